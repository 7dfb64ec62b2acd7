/*! Chained per-PCAP / per-flow packet index files.

While a capture is processed, the findexer maintains a `_flows.xer` file
(and optionally a `_packets.xer` file) mapping every flow to the byte
offsets of its packets inside the input PCAPs. Records are chained with
absolute file offsets: each record is appended with a null next-pointer,
then the predecessor's pointer field is rewritten in place — the rewrite
is the atomic step, so a truncated file is always walkable.

The findexer observes the packet dispatch independently of the decoder
chain: the host drives it with [`Findexer::begin_pcap`],
[`Findexer::on_packet`] and [`Findexer::on_flow_terminate`].
*/

use crate::config::DecoderConfig;
use crate::error::Result;
use crate::flow::{Flow, FlowIndex};
use bytes::{BufMut, BytesMut};
use std::fs::File;
use std::io::{Seek, SeekFrom, Write};
use std::path::PathBuf;
use tracing::*;

/// `FINDEXE2`, little-endian.
pub const FINDEXER_MAGIC: u64 = 0x3245_5845_444e_4946;
/// `PKTSXER2`, little-endian.
pub const PKTSXER_MAGIC: u64 = 0x3252_4558_5354_4b50;

/// Minimum size of a valid `_flows.xer` file (header only).
pub const FINDEXER_MIN_HDRLEN: u64 = 20;
/// Minimum size of a valid `_packets.xer` file.
pub const PKTSXER_MIN_HDRLEN: u64 = 36;

// Per-flow record flags.
pub const FLAG_REVERSE_FLOW: u8 = 0x01;
pub const FLAG_FIRST_XER: u8 = 0x02;
pub const FLAG_LAST_XER: u8 = 0x04;

/// Size of a classic PCAP file header.
const PCAP_FILE_HDR_LEN: u64 = 24;
/// Size of a classic PCAP per-packet record header.
const PCAP_PKT_HDR_LEN: u64 = 16;
/// Packet offsets buffered before being flushed to `_packets.xer`.
const PKT_BUFFER_SIZE: usize = 128 * 1024;

#[derive(Clone, Debug, Default)]
pub struct FindexerOptions {
    pub base: DecoderConfig,
    /// Also maintain the `_packets.xer` index of every packet.
    pub packet_mode: bool,
    /// In split mode, rotate on terminated-flow count instead of bytes.
    pub split_by_flows: bool,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum OutputKind {
    Flows,
    Packets,
}

struct Output {
    kind: OutputKind,
    file: File,
    /// Path without the split-mode counter.
    base_path: PathBuf,
    index: u64,
    split: bool,
    pcap_count: u32,
    /// Offset of the pointer field linking to the next PCAP record.
    pcap_ptr_pos: u64,
    /// Offset of the current PCAP record.
    pcap_hdr_pos: u64,
    /// Offset of the pointer field linking to the next flow record.
    flow_ptr_pos: u64,
    flow_count: u64,
    /// First and last packet numbers of the current PCAP (packet mode).
    first_pkt: u64,
    last_pkt: u64,
    terminated_flows: u64,
}

impl Output {
    fn create(kind: OutputKind, dir: &std::path::Path, name: String, split: bool) -> Result<Output> {
        std::fs::create_dir_all(dir)?;
        let base_path = dir.join(name);
        let index = 0;
        let path = if split {
            Self::numbered(&base_path, index)
        } else {
            base_path.clone()
        };
        let file = File::create(path)?;
        let mut out = Output {
            kind,
            file,
            base_path,
            index,
            split,
            pcap_count: 0,
            pcap_ptr_pos: 0,
            pcap_hdr_pos: 0,
            flow_ptr_pos: 0,
            flow_count: 0,
            first_pkt: 0,
            last_pkt: 0,
            terminated_flows: 0,
        };
        out.write_file_header()?;
        Ok(out)
    }

    fn numbered(path: &std::path::Path, index: u64) -> PathBuf {
        let mut name = path.file_name().unwrap_or_default().to_os_string();
        name.push(index.to_string());
        path.with_file_name(name)
    }

    fn write_file_header(&mut self) -> Result<()> {
        let magic = match self.kind {
            OutputKind::Flows => FINDEXER_MAGIC,
            OutputKind::Packets => PKTSXER_MAGIC,
        };
        let mut hdr = BytesMut::with_capacity(20);
        hdr.put_u64_le(magic);
        hdr.put_u32_le(0); // PCAP count
        hdr.put_u64_le(0); // first PCAP pointer
        self.file.write_all(&hdr)?;
        self.pcap_count = 0;
        // The first-PCAP pointer is the first chain field to rewrite.
        self.pcap_ptr_pos = 12;
        Ok(())
    }

    /// Append a per-PCAP record and link the predecessor to it.
    fn write_pcap_header(&mut self, name: &str) -> Result<()> {
        let pos = self.file.seek(SeekFrom::End(0))?;
        let mut rec = BytesMut::with_capacity(26 + name.len());
        rec.put_u64_le(0); // next PCAP pointer
        rec.put_u64_le(0); // flow count / first packet number
        rec.put_u64_le(0); // first flow pointer / last packet number
        rec.put_u16_le(name.len() as u16);
        rec.put_slice(name.as_bytes());
        self.file.write_all(&rec)?;

        self.file.seek(SeekFrom::Start(self.pcap_ptr_pos))?;
        self.file.write_all(&pos.to_le_bytes())?;
        self.pcap_ptr_pos = pos;
        self.pcap_hdr_pos = pos;
        self.flow_ptr_pos = pos + 16;
        self.flow_count = 0;
        self.first_pkt = 0;
        self.last_pkt = 0;

        self.pcap_count += 1;
        self.file.seek(SeekFrom::Start(8))?;
        self.file.write_all(&self.pcap_count.to_le_bytes())?;
        self.file.seek(SeekFrom::End(0))?;
        Ok(())
    }

    /// Append a per-flow record and link it into the PCAP's flow chain.
    fn write_flow_record(&mut self, findex: u64, flags: u8, positions: &[u64]) -> Result<()> {
        let pos = self.file.seek(SeekFrom::End(0))?;
        let mut rec = BytesMut::with_capacity(25 + 8 * positions.len());
        rec.put_u64_le(0); // next flow pointer
        rec.put_u64_le(findex);
        rec.put_u8(flags);
        rec.put_u64_le(positions.len() as u64);
        for p in positions {
            rec.put_u64_le(*p);
        }
        self.file.write_all(&rec)?;

        self.file.seek(SeekFrom::Start(self.flow_ptr_pos))?;
        self.file.write_all(&pos.to_le_bytes())?;
        self.flow_ptr_pos = pos;

        self.flow_count += 1;
        self.file.seek(SeekFrom::Start(self.pcap_hdr_pos + 8))?;
        self.file.write_all(&self.flow_count.to_le_bytes())?;
        self.file.seek(SeekFrom::End(0))?;
        Ok(())
    }

    /// Rewrite the first/last packet numbers and append the buffered
    /// packet positions (packet mode).
    fn flush_packets(&mut self, buffer: &mut Vec<u64>) -> Result<()> {
        self.file.seek(SeekFrom::Start(self.pcap_hdr_pos + 8))?;
        self.file.write_all(&self.first_pkt.to_le_bytes())?;
        self.file.write_all(&self.last_pkt.to_le_bytes())?;
        self.file.seek(SeekFrom::End(0))?;
        let mut rec = BytesMut::with_capacity(8 * buffer.len());
        for p in buffer.iter() {
            rec.put_u64_le(*p);
        }
        self.file.write_all(&rec)?;
        buffer.clear();
        Ok(())
    }

    fn size(&mut self) -> Result<u64> {
        Ok(self.file.seek(SeekFrom::End(0))?)
    }

    /// Close the current file and start the next numbered one.
    fn rotate(&mut self) -> Result<()> {
        self.index += 1;
        self.file = File::create(Self::numbered(&self.base_path, self.index))?;
        self.write_file_header()?;
        self.terminated_flows = 0;
        Ok(())
    }
}

#[derive(Clone, Default)]
struct FxFlow {
    active: bool,
    findex: u64,
    reverse: bool,
    first_xer: bool,
    positions: Vec<u64>,
}

pub struct Findexer {
    options: FindexerOptions,
    flows: Vec<FxFlow>,
    flows_out: Output,
    pkts_out: Option<Output>,
    pkt_buffer: Vec<u64>,
    /// Name of the PCAP currently being read; None before the first one.
    current_pcap: Option<String>,
    /// Byte position of the next packet record in the current PCAP.
    position: u64,
    packet_num: u64,
    indexed_flows: u64,
}

impl Findexer {
    pub fn new(flow_capacity: usize, options: FindexerOptions) -> Result<Findexer> {
        let dir = options.base.output_dir.clone();
        let split = options.base.split_output;
        let flows_out = Output::create(
            OutputKind::Flows,
            &dir,
            format!("{}_flows.xer", options.base.file_prefix),
            split,
        )?;
        let pkts_out = if options.packet_mode {
            Some(Output::create(
                OutputKind::Packets,
                &dir,
                format!("{}_packets.xer", options.base.file_prefix),
                split,
            )?)
        } else {
            None
        };
        Ok(Findexer {
            options,
            flows: vec![FxFlow::default(); flow_capacity],
            flows_out,
            pkts_out,
            pkt_buffer: Vec::new(),
            current_pcap: None,
            position: 0,
            packet_num: 0,
            indexed_flows: 0,
        })
    }

    /// Re-emit every open flow so it stays reachable from the current
    /// file, then forget the written positions.
    fn flush_open_flows(&mut self) -> Result<()> {
        for state in self.flows.iter_mut().filter(|f| f.active) {
            let mut flags = 0;
            if state.reverse {
                flags |= FLAG_REVERSE_FLOW;
            }
            if state.first_xer {
                flags |= FLAG_FIRST_XER;
            }
            self.flows_out
                .write_flow_record(state.findex, flags, &state.positions)?;
            state.first_xer = false;
            state.positions.clear();
        }
        Ok(())
    }

    /// Switch to the next input PCAP.
    pub fn begin_pcap(&mut self, name: &str) -> Result<()> {
        if self.current_pcap.as_deref() == Some(name) {
            return Ok(());
        }
        if self.current_pcap.is_some() {
            self.flush_open_flows()?;
            if let Some(out) = &mut self.pkts_out {
                out.flush_packets(&mut self.pkt_buffer)?;
            }
        }
        self.current_pcap = Some(name.to_owned());
        self.position = PCAP_FILE_HDR_LEN;
        self.flows_out.write_pcap_header(name)?;
        if let Some(out) = &mut self.pkts_out {
            out.write_pcap_header(name)?;
        }
        debug!("indexing {name}");
        Ok(())
    }

    pub fn on_new_flow(&mut self, flow: &Flow) {
        let state = &mut self.flows[flow.index.0];
        *state = FxFlow {
            active: true,
            findex: flow.findex,
            reverse: flow.is_b(),
            first_xer: true,
            positions: Vec::new(),
        };
    }

    /// Record one packet of `caplen` captured bytes for the given flow.
    pub fn on_packet(&mut self, index: FlowIndex, caplen: usize) -> Result<()> {
        let position = self.position;
        self.position += PCAP_PKT_HDR_LEN + caplen as u64;
        self.packet_num += 1;

        let state = &mut self.flows[index.0];
        if state.active {
            // SCTP can dispatch one packet several times for one flow.
            if state.positions.last() != Some(&position) {
                state.positions.push(position);
            }
        }

        if let Some(out) = &mut self.pkts_out {
            if self.pkt_buffer.last() != Some(&position) {
                if self.pkt_buffer.len() >= PKT_BUFFER_SIZE {
                    out.flush_packets(&mut self.pkt_buffer)?;
                }
                self.pkt_buffer.push(position);
                if out.first_pkt == 0 {
                    out.first_pkt = self.packet_num;
                }
                out.last_pkt = self.packet_num;
            }
        }
        Ok(())
    }

    /// Emit the flow's terminal record (flagged `LAST_XER`) and release
    /// its slot.
    pub fn on_flow_terminate(&mut self, index: FlowIndex) -> Result<()> {
        let state = std::mem::take(&mut self.flows[index.0]);
        if !state.active {
            return Ok(());
        }
        let mut flags = FLAG_LAST_XER;
        if state.reverse {
            flags |= FLAG_REVERSE_FLOW;
        }
        if state.first_xer {
            flags |= FLAG_FIRST_XER;
        }
        self.flows_out
            .write_flow_record(state.findex, flags, &state.positions)?;
        self.indexed_flows += 1;

        if self.options.base.split_output {
            self.flows_out.terminated_flows += 1;
            let over = if self.options.split_by_flows {
                self.flows_out.terminated_flows >= self.options.base.split_threshold
            } else {
                self.flows_out.size()? >= self.options.base.split_threshold
            };
            if over {
                self.flush_open_flows()?;
                self.flows_out.rotate()?;
                if let Some(name) = self.current_pcap.clone() {
                    self.flows_out.write_pcap_header(&name)?;
                }
            }
        }
        Ok(())
    }

    pub fn indexed_flows(&self) -> u64 {
        self.indexed_flows
    }

    /// Flush open flows and buffered packet positions.
    pub fn finalize(&mut self) -> Result<()> {
        self.flush_open_flows()?;
        if let Some(out) = &mut self.pkts_out {
            out.flush_packets(&mut self.pkt_buffer)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::Direction;

    fn u64_at(buf: &[u8], off: usize) -> u64 {
        let mut b = [0u8; 8];
        b.copy_from_slice(&buf[off..off + 8]);
        u64::from_le_bytes(b)
    }

    fn u32_at(buf: &[u8], off: usize) -> u32 {
        let mut b = [0u8; 4];
        b.copy_from_slice(&buf[off..off + 4]);
        u32::from_le_bytes(b)
    }

    fn u16_at(buf: &[u8], off: usize) -> u16 {
        u16::from_le_bytes([buf[off], buf[off + 1]])
    }

    #[test]
    fn single_flow_chain() {
        let dir = tempfile::tempdir().unwrap();
        let options = FindexerOptions {
            base: DecoderConfig {
                output_dir: dir.path().to_path_buf(),
                ..DecoderConfig::default()
            },
            ..FindexerOptions::default()
        };
        let mut fx = Findexer::new(4, options).unwrap();
        fx.begin_pcap("test.pcap").unwrap();

        let mut flow = Flow::new(42, FlowIndex(1), Direction::A);
        flow.findex = 42;
        fx.on_new_flow(&flow);
        // Captured lengths chosen so packets start at 24, 200 and 500.
        fx.on_packet(FlowIndex(1), 160).unwrap();
        fx.on_packet(FlowIndex(1), 284).unwrap();
        fx.on_packet(FlowIndex(1), 100).unwrap();
        fx.on_flow_terminate(FlowIndex(1)).unwrap();
        fx.finalize().unwrap();
        assert_eq!(fx.indexed_flows(), 1);

        let buf = std::fs::read(dir.path().join("_flows.xer")).unwrap();
        assert!(buf.len() as u64 >= FINDEXER_MIN_HDRLEN);
        assert_eq!(u64_at(&buf, 0), FINDEXER_MAGIC);
        assert_eq!(u32_at(&buf, 8), 1); // one PCAP

        // Walk to the PCAP record.
        let pcap_pos = u64_at(&buf, 12) as usize;
        assert_eq!(u64_at(&buf, pcap_pos), 0); // no next PCAP
        assert_eq!(u64_at(&buf, pcap_pos + 8), 1); // one flow
        let name_len = u16_at(&buf, pcap_pos + 24) as usize;
        assert_eq!(
            &buf[pcap_pos + 26..pcap_pos + 26 + name_len],
            b"test.pcap"
        );

        // Walk to the flow record.
        let flow_pos = u64_at(&buf, pcap_pos + 16) as usize;
        assert_eq!(u64_at(&buf, flow_pos), 0); // no next flow
        assert_eq!(u64_at(&buf, flow_pos + 8), 42); // findex
        assert_eq!(buf[flow_pos + 16], FLAG_FIRST_XER | FLAG_LAST_XER);
        assert_eq!(u64_at(&buf, flow_pos + 17), 3); // packet count
        assert_eq!(u64_at(&buf, flow_pos + 25), 24);
        assert_eq!(u64_at(&buf, flow_pos + 33), 200);
        assert_eq!(u64_at(&buf, flow_pos + 41), 500);
    }

    #[test]
    fn pcap_switch_links_records() {
        let dir = tempfile::tempdir().unwrap();
        let options = FindexerOptions {
            base: DecoderConfig {
                output_dir: dir.path().to_path_buf(),
                ..DecoderConfig::default()
            },
            ..FindexerOptions::default()
        };
        let mut fx = Findexer::new(4, options).unwrap();

        let mut flow = Flow::new(7, FlowIndex(0), Direction::B);
        flow.findex = 7;
        fx.begin_pcap("a.pcap").unwrap();
        fx.on_new_flow(&flow);
        fx.on_packet(FlowIndex(0), 60).unwrap();
        fx.begin_pcap("b.pcap").unwrap();
        fx.on_packet(FlowIndex(0), 60).unwrap();
        fx.on_flow_terminate(FlowIndex(0)).unwrap();
        fx.finalize().unwrap();

        let buf = std::fs::read(dir.path().join("_flows.xer")).unwrap();
        assert_eq!(u32_at(&buf, 8), 2);
        let first = u64_at(&buf, 12) as usize;
        let second = u64_at(&buf, first) as usize;
        assert_ne!(second, 0);
        assert_eq!(u64_at(&buf, second), 0);

        // The flow was re-emitted into the first PCAP's chain before the
        // switch, keeping it reachable; FIRST_XER only on the first copy.
        let flow1 = u64_at(&buf, first + 16) as usize;
        assert_eq!(buf[flow1 + 16] & FLAG_FIRST_XER, FLAG_FIRST_XER);
        assert_eq!(buf[flow1 + 16] & FLAG_LAST_XER, 0);
        assert_eq!(buf[flow1 + 16] & FLAG_REVERSE_FLOW, FLAG_REVERSE_FLOW);
        let flow2 = u64_at(&buf, second + 16) as usize;
        assert_eq!(buf[flow2 + 16] & FLAG_FIRST_XER, 0);
        assert_eq!(buf[flow2 + 16] & FLAG_LAST_XER, FLAG_LAST_XER);
        // Positions restart at 24 in the second PCAP.
        assert_eq!(u64_at(&buf, flow2 + 17), 1);
        assert_eq!(u64_at(&buf, flow2 + 25), 24);
    }

    #[test]
    fn packet_mode_tracks_all_packets() {
        let dir = tempfile::tempdir().unwrap();
        let options = FindexerOptions {
            base: DecoderConfig {
                output_dir: dir.path().to_path_buf(),
                ..DecoderConfig::default()
            },
            packet_mode: true,
            ..FindexerOptions::default()
        };
        let mut fx = Findexer::new(4, options).unwrap();
        fx.begin_pcap("c.pcap").unwrap();
        let flow = Flow::new(1, FlowIndex(0), Direction::A);
        fx.on_new_flow(&flow);
        fx.on_packet(FlowIndex(0), 100).unwrap();
        fx.on_packet(FlowIndex(0), 50).unwrap();
        fx.finalize().unwrap();

        let buf = std::fs::read(dir.path().join("_packets.xer")).unwrap();
        assert!(buf.len() as u64 >= PKTSXER_MIN_HDRLEN);
        assert_eq!(u64_at(&buf, 0), PKTSXER_MAGIC);
        let pcap_pos = u64_at(&buf, 12) as usize;
        assert_eq!(u64_at(&buf, pcap_pos + 8), 1); // first packet number
        assert_eq!(u64_at(&buf, pcap_pos + 16), 2); // last packet number
        // The two buffered positions were appended at the end.
        let tail = buf.len() - 16;
        assert_eq!(u64_at(&buf, tail), 24);
        assert_eq!(u64_at(&buf, tail + 8), 24 + 16 + 100);
    }

    #[test]
    fn split_by_flow_count() {
        let dir = tempfile::tempdir().unwrap();
        let options = FindexerOptions {
            base: DecoderConfig {
                output_dir: dir.path().to_path_buf(),
                split_output: true,
                split_threshold: 1,
                ..DecoderConfig::default()
            },
            split_by_flows: true,
            ..FindexerOptions::default()
        };
        let mut fx = Findexer::new(4, options).unwrap();
        fx.begin_pcap("d.pcap").unwrap();
        for i in 0..2u64 {
            let flow = Flow::new(i + 1, FlowIndex(i as usize), Direction::A);
            fx.on_new_flow(&flow);
            fx.on_packet(FlowIndex(i as usize), 60).unwrap();
            fx.on_flow_terminate(FlowIndex(i as usize)).unwrap();
        }
        fx.finalize().unwrap();

        let first = std::fs::read(dir.path().join("_flows.xer0")).unwrap();
        let second = std::fs::read(dir.path().join("_flows.xer1")).unwrap();
        assert_eq!(u64_at(&first, 0), FINDEXER_MAGIC);
        assert_eq!(u64_at(&second, 0), FINDEXER_MAGIC);
        // Both files carry the current PCAP record.
        assert_eq!(u32_at(&first, 8), 1);
        assert_eq!(u32_at(&second, 8), 1);
    }
}
