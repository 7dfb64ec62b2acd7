/*! Per-flow payload writer.

Reconstructs the application-layer byte stream of each qualifying flow
into a file: TCP segments are placed at `seq − seq_init`, UDP datagrams
and layer-2 payloads are appended, SCTP data chunks are sequenced by TSN.
Retransmissions simply overwrite the same range; gaps stay as file holes.
*/

use crate::config::DecoderConfig;
use crate::cursor::ByteCursor;
use crate::error::Result;
use crate::flow::{Flow, FlowTable, IS_L2};
use crate::packet::{Packet, L4_SCTP, L4_TCP, L4_UDP, TH_FIN, TH_RST, TH_SYN};
use crate::runtime::{Decoder, DecoderReport};
use crate::schema::{Column, ColumnType, RecordBuilder};
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use tracing::*;

pub const PLDUMP_MTCH: u8 = 0x01; // Flow matches the filters
pub const PLDUMP_DUMP: u8 = 0x02; // Payload dumped for this flow
pub const PLDUMP_SCTP_FDP: u8 = 0x04; // SCTP first data chunk seen
pub const PLDUMP_PTRNC: u8 = 0x08; // SCTP payload truncated
pub const PLDUMP_TCP_SQERR: u8 = 0x10; // TCP out of order / keep-alive
pub const PLDUMP_SCTP_SQERR: u8 = 0x20; // SCTP TSN out of order
pub const PLDUMP_FTRNC: u8 = 0x40; // Filename truncated
pub const PLDUMP_ERR: u8 = 0x80; // File open/write failed

/// Longest file name the dumper will emit.
const MAX_NAME_LEN: usize = 255;

/// How extracted files are named.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum NameMode {
    /// `{findex}_{A|B}`
    #[default]
    FlowIndex,
    /// `{src}.{sport}-{dst}.{dport}-{proto}`, or the MAC pair and
    /// ethertype for layer-2 flows.
    AddressTuple,
}

#[derive(Clone, Debug)]
pub struct DumperOptions {
    pub base: DecoderConfig,
    pub l2: bool,
    pub tcp: bool,
    pub udp: bool,
    pub sctp: bool,
    /// Empty filters match every port.
    pub tcp_ports: Vec<u16>,
    pub udp_ports: Vec<u16>,
    pub sctp_ports: Vec<u16>,
    pub ethertypes: Vec<u16>,
    pub names: NameMode,
    /// Skip this many payload bytes per packet (L2 and UDP only).
    pub start_offset: u16,
}

impl Default for DumperOptions {
    fn default() -> DumperOptions {
        DumperOptions {
            base: DecoderConfig::default(),
            l2: false,
            tcp: true,
            udp: true,
            sctp: false,
            tcp_ports: Vec::new(),
            udp_ports: Vec::new(),
            sctp_ports: Vec::new(),
            ethertypes: Vec::new(),
            names: NameMode::default(),
            start_offset: 0,
        }
    }
}

#[derive(Default)]
struct DumpFlow {
    status: u8,
    file: Option<File>,
    seq_init: u32,
    seq_next: u32,
    tsn_init: u32,
    tsn_last: u32,
    last_off: u64,
}

pub struct PayloadDumper {
    flows: Vec<DumpFlow>,
    options: DumperOptions,
    packets: u64,
    files: u64,
    agg_status: u8,
}

fn mac_str(mac: &[u8; 6]) -> String {
    format!(
        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
    )
}

impl PayloadDumper {
    pub fn new(flow_capacity: usize, options: DumperOptions) -> PayloadDumper {
        if let Err(e) = options.base.prepare_output_dir() {
            warn!("failed to prepare {}: {e}", options.base.output_dir.display());
        }
        PayloadDumper {
            flows: (0..flow_capacity).map(|_| DumpFlow::default()).collect(),
            options,
            packets: 0,
            files: 0,
            agg_status: 0,
        }
    }

    fn matches(&self, flow: &Flow) -> bool {
        if flow.status() & IS_L2 != 0 {
            return self.options.l2
                && (self.options.ethertypes.is_empty()
                    || self.options.ethertypes.contains(&flow.ethertype));
        }
        let port_match = |ports: &[u16]| {
            ports.is_empty() || ports.contains(&flow.src_port) || ports.contains(&flow.dst_port)
        };
        match flow.l4_proto {
            L4_TCP => self.options.tcp && port_match(&self.options.tcp_ports),
            L4_UDP => self.options.udp && port_match(&self.options.udp_ports),
            L4_SCTP => self.options.sctp && port_match(&self.options.sctp_ports),
            _ => false,
        }
    }

    fn filename(&self, flow: &Flow, status: &mut u8) -> String {
        let mut name = self.options.base.file_prefix.clone();
        match self.options.names {
            NameMode::FlowIndex => {
                name.push_str(&format!("{}_{}", flow.findex, flow.dir_char()));
            }
            NameMode::AddressTuple => {
                if flow.status() & IS_L2 != 0 {
                    name.push_str(&format!(
                        "{}-{}-{:#06x}",
                        mac_str(&flow.src_mac),
                        mac_str(&flow.dst_mac),
                        flow.ethertype
                    ));
                } else {
                    let src = flow.src.map(|a| a.to_string()).unwrap_or_default();
                    let dst = flow.dst.map(|a| a.to_string()).unwrap_or_default();
                    name.push_str(&format!(
                        "{src}.{:05}-{dst}.{:05}-{}",
                        flow.src_port, flow.dst_port, flow.l4_proto
                    ));
                }
            }
        }
        name.push_str(&self.options.base.file_suffix);
        if name.len() > MAX_NAME_LEN {
            name.truncate(MAX_NAME_LEN);
            *status |= PLDUMP_FTRNC;
        }
        name
    }

    fn dump(&mut self, packet: &Packet, flow: &Flow) {
        let idx = flow.index.0;
        if self.flows[idx].status & PLDUMP_MTCH == 0 {
            return;
        }
        let is_l2 = flow.status() & IS_L2 != 0;
        if !is_l2 && !packet.first_fragment {
            return;
        }

        let mut pkt_stat = self.flows[idx].status & PLDUMP_MTCH;
        let seq = packet.tcp_seq();
        let mut payload = packet.l7();
        let mut l7_len = packet.l7_len;

        let start_off = usize::from(self.options.start_offset);
        if start_off > 0 && (is_l2 || flow.l4_proto == L4_UDP) {
            if payload.len() <= start_off || usize::from(l7_len) <= start_off {
                self.finish_packet(idx, flow, seq, packet.l7_len, pkt_stat);
                return;
            }
            payload = &payload[start_off..];
            l7_len -= start_off as u16;
        }
        if payload.is_empty() {
            self.finish_packet(idx, flow, seq, packet.l7_len, pkt_stat);
            return;
        }
        pkt_stat |= self.flows[idx].status & PLDUMP_DUMP;

        if self.flows[idx].file.is_none() {
            let name = self.filename(flow, &mut pkt_stat);
            let path = self.options.base.output_dir.join(name);
            if let Some(parent) = path.parent() {
                let _ = std::fs::create_dir_all(parent);
            }
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(&path);
            match file {
                Ok(f) => {
                    let state = &mut self.flows[idx];
                    state.file = Some(f);
                    if flow.l4_proto == L4_TCP {
                        state.seq_init = seq;
                        // Initialized here so keep-alive detection cannot
                        // trigger on the first segment.
                        state.seq_next = seq;
                    }
                    pkt_stat |= PLDUMP_DUMP;
                    self.files += 1;
                }
                Err(e) => {
                    warn!("failed to open {}: {e}", path.display());
                    pkt_stat |= PLDUMP_ERR;
                    self.finish_packet(idx, flow, seq, packet.l7_len, pkt_stat);
                    return;
                }
            }
        }

        let state = &mut self.flows[idx];
        let mut data = payload;
        let offset;
        if is_l2 {
            offset = state.last_off;
            state.last_off += u64::from(l7_len);
        } else {
            match flow.l4_proto {
                L4_TCP => {
                    if state.seq_init > seq {
                        pkt_stat |= PLDUMP_TCP_SQERR;
                        self.finish_packet(idx, flow, seq, packet.l7_len, pkt_stat);
                        return;
                    }
                    let flags = packet.tcp.map(|t| t.flags).unwrap_or(0);
                    if l7_len <= 1
                        && flags & (TH_SYN | TH_FIN | TH_RST) == 0
                        && seq == state.seq_next.wrapping_sub(1)
                    {
                        // TCP keep-alive
                        pkt_stat |= PLDUMP_TCP_SQERR;
                        self.finish_packet(idx, flow, seq, packet.l7_len, pkt_stat);
                        return;
                    }
                    offset = u64::from(seq.wrapping_sub(state.seq_init));
                }
                L4_UDP => {
                    offset = state.last_off;
                    state.last_off += u64::from(l7_len);
                }
                L4_SCTP => {
                    // The payload starts at the SCTP data chunk.
                    let mut cur = ByteCursor::new(payload);
                    let chunk = (|| {
                        let ty = cur.read_u8()?;
                        cur.skip(1)?; // flags
                        let len = cur.read_u16()?;
                        let tsn = cur.read_u32()?;
                        cur.skip(8)?; // stream id, ssn, ppid
                        Ok::<_, crate::error::ParseError>((ty, len, tsn))
                    })();
                    let Ok((ty, chunk_len, tsn)) = chunk else {
                        self.finish_packet(idx, flow, seq, packet.l7_len, pkt_stat);
                        return;
                    };
                    if ty & 0x3f != 0 || chunk_len == 0 {
                        // Not a data chunk.
                        self.finish_packet(idx, flow, seq, packet.l7_len, pkt_stat);
                        return;
                    }
                    if usize::from(chunk_len) > payload.len() {
                        pkt_stat |= PLDUMP_PTRNC;
                    }
                    if state.status & PLDUMP_SCTP_FDP == 0 {
                        state.tsn_init = tsn;
                        state.tsn_last = tsn;
                        pkt_stat |= PLDUMP_SCTP_FDP;
                    } else if tsn.wrapping_sub(state.tsn_last) != 1 {
                        pkt_stat |= PLDUMP_SCTP_SQERR;
                    }
                    state.tsn_last = tsn;
                    if state.tsn_init > tsn {
                        pkt_stat |= PLDUMP_SCTP_SQERR;
                        self.finish_packet(idx, flow, seq, packet.l7_len, pkt_stat);
                        return;
                    }
                    offset = state.last_off;
                    let body_len = usize::from(chunk_len).saturating_sub(16).min(cur.remaining());
                    data = cur.read_slice(body_len).unwrap_or(&[]);
                    state.last_off += body_len as u64;
                }
                _ => {
                    self.finish_packet(idx, flow, seq, packet.l7_len, pkt_stat);
                    return;
                }
            }
        }

        // Global per-flow byte cap.
        let cap = self.options.base.max_bytes_per_flow;
        if cap > 0 {
            if offset >= cap {
                self.finish_packet(idx, flow, seq, packet.l7_len, pkt_stat);
                return;
            }
            let left = (cap - offset) as usize;
            if data.len() > left {
                data = &data[..left];
            }
        }

        let state = &mut self.flows[idx];
        if let Some(file) = &mut state.file {
            let write = file
                .seek(SeekFrom::Start(offset))
                .and_then(|_| file.write_all(data));
            if let Err(e) = write {
                warn!("flow {}: payload write failed: {e}", flow.findex);
                pkt_stat |= PLDUMP_ERR;
            }
        }
        self.finish_packet(idx, flow, seq, packet.l7_len, pkt_stat);
    }

    fn finish_packet(&mut self, idx: usize, flow: &Flow, seq: u32, l7_len: u16, pkt_stat: u8) {
        let state = &mut self.flows[idx];
        if flow.l4_proto == L4_TCP {
            state.seq_next = seq.wrapping_add(u32::from(l7_len));
        }
        state.status |= pkt_stat;
    }
}

impl Decoder for PayloadDumper {
    fn name(&self) -> &'static str {
        "payloadDumper"
    }

    fn header(&self) -> Vec<Column> {
        vec![Column::new("pldStat", "payloadDumper status", ColumnType::Hex8)]
    }

    fn on_new_flow(&mut self, _packet: &Packet, flow: &Flow, _flows: &FlowTable) {
        let matched = self.matches(flow);
        let state = &mut self.flows[flow.index.0];
        *state = DumpFlow::default();
        if matched {
            state.status |= PLDUMP_MTCH;
        }
    }

    fn on_layer2(&mut self, packet: &Packet, flow: &Flow, _flows: &FlowTable) {
        if flow.status() & IS_L2 != 0 {
            self.packets += 1;
            self.dump(packet, flow);
        }
    }

    fn on_layer4(&mut self, packet: &Packet, flow: &Flow, _flows: &FlowTable) {
        self.packets += 1;
        self.dump(packet, flow);
    }

    fn on_flow_terminate(
        &mut self,
        flow: &Flow,
        _flows: &FlowTable,
        record: &mut RecordBuilder,
    ) -> Result<()> {
        let state = &mut self.flows[flow.index.0];
        state.file = None;
        self.agg_status |= state.status;
        record.append_u8(state.status)?;
        Ok(())
    }

    fn report(&self) -> DecoderReport {
        DecoderReport {
            status: u64::from(self.agg_status),
            packets: self.packets,
            units: self.files,
        }
    }
}
