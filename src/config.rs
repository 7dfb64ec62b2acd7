/*! Per-decoder configuration.

Every file-producing decoder understands the same small record of options.
Unknown keys are ignored so that one flat host configuration can be handed
to every decoder.
*/

use std::path::PathBuf;

#[derive(Clone, Debug)]
pub struct DecoderConfig {
    /// Enable content extraction to files.
    pub enable_save: bool,
    pub output_dir: PathBuf,
    pub file_prefix: String,
    pub file_suffix: String,
    /// Empty the output directory before starting.
    pub rmdir_on_start: bool,
    /// Per-flow byte cap for extracted content; 0 means no limit.
    pub max_bytes_per_flow: u64,
    pub split_output: bool,
    /// Bytes (or flows, where the subsystem counts flows) per output file
    /// in split mode.
    pub split_threshold: u64,
}

impl Default for DecoderConfig {
    fn default() -> DecoderConfig {
        DecoderConfig {
            enable_save: false,
            output_dir: PathBuf::from("."),
            file_prefix: String::new(),
            file_suffix: String::new(),
            rmdir_on_start: false,
            max_bytes_per_flow: 0,
            split_output: false,
            split_threshold: 0,
        }
    }
}

impl DecoderConfig {
    /// Create the output directory, emptying it first when
    /// `rmdir_on_start` is set.
    pub fn prepare_output_dir(&self) -> std::io::Result<()> {
        if self.rmdir_on_start && self.output_dir.exists() {
            std::fs::remove_dir_all(&self.output_dir)?;
        }
        std::fs::create_dir_all(&self.output_dir)
    }

    /// Build a config from `key=value` pairs, ignoring unknown keys.
    pub fn from_pairs<'a, I>(pairs: I) -> DecoderConfig
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut cfg = DecoderConfig::default();
        for (key, value) in pairs {
            match key {
                "enable_save" => cfg.enable_save = value == "1" || value == "true",
                "output_dir" => cfg.output_dir = PathBuf::from(value),
                "file_prefix" => cfg.file_prefix = value.to_owned(),
                "file_suffix" => cfg.file_suffix = value.to_owned(),
                "rmdir_on_start" => cfg.rmdir_on_start = value == "1" || value == "true",
                "max_bytes_per_flow" => {
                    cfg.max_bytes_per_flow = value.parse().unwrap_or(0);
                }
                "split_output" => cfg.split_output = value == "1" || value == "true",
                "split_threshold" => cfg.split_threshold = value.parse().unwrap_or(0),
                _ => {}
            }
        }
        cfg
    }
}
