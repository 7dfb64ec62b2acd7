use std::io;
use thiserror::Error;

/// A field could not be parsed out of a captured buffer.
///
/// These are recoverable: the decoder records the condition in the flow's
/// status bits and moves on to the next unit (TLV, line, message, packet).
#[derive(Clone, Copy, PartialEq, Eq, Debug, Error)]
pub enum ParseError {
    /// The capture ended in the middle of the field. Reads past the snap
    /// length are never undefined behavior, they are this error.
    #[error("buffer snapped mid-field")]
    Snapped,
    /// An encoded length exceeds the bytes that are actually available.
    #[error("encoded length exceeds available bytes")]
    InvalidLength,
    /// The destination was too small for the source string.
    #[error("string truncated to fit destination")]
    Truncated,
}

pub type ParseResult<T> = std::result::Result<T, ParseError>;

/// Errors from the file-producing subsystems (dumper, ring extractor,
/// findexer, subnet table).
#[derive(Debug, Error)]
pub enum Error {
    #[error("unknown subnet file version {found} (compiled for {expected})")]
    ConfigMismatch { expected: u16, found: u16 },
    #[error("subnet file too short: {0} bytes")]
    SubnetFileTooShort(usize),
    #[error("output column {index} declared {declared:?} but got {got:?}")]
    SchemaMismatch {
        index: usize,
        declared: crate::schema::ColumnType,
        got: crate::schema::ColumnType,
    },
    #[error("packet of {0} bytes does not fit the ring")]
    PacketTooLarge(usize),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
