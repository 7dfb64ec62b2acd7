//! POP2/POP3 decoder.

use crate::config::DecoderConfig;
use crate::error::Result;
use crate::flow::{Flow, FlowTable};
use crate::line::{cmd_word, first_word, response_code, token, SeqWriter};
use crate::packet::{Packet, L4_TCP};
use crate::runtime::{Decoder, DecoderReport};
use crate::schema::{Column, ColumnType, RecordBuilder};
use crate::tlv::dedup_push;
use tracing::*;

pub const POP_INIT3: u16 = 0x0001; // POP3 port found
pub const POP_INIT2: u16 = 0x0002; // POP2 port found
pub const POP_ROK: u16 = 0x0004; // Response +OK
pub const POP_RERR: u16 = 0x0008; // Response -ERR
pub const POP_DWF: u16 = 0x0010; // Data storage exists
pub const POP_DTP: u16 = 0x0020; // Data storage in progress
pub const POP_RNVL: u16 = 0x0040; // Response not valid, or data
pub const POP_OVFL: u16 = 0x0080; // Array overflow
pub const POP_PAUT: u16 = 0x0100; // Authentication pending (transient)
pub const POP_RPATH: u16 = 0x0200; // Return path pending (transient)

pub const POP3_PORT: u16 = 110;
pub const POP2_PORT: u16 = 109;

// Command bitfield
const POP_C_APOP: u16 = 0x0001;
const POP_C_AUTH: u16 = 0x0002;
const POP_C_CAPA: u16 = 0x0004;
const POP_C_DELE: u16 = 0x0008;
const POP_C_LIST: u16 = 0x0010;
const POP_C_NOOP: u16 = 0x0020;
const POP_C_PASS: u16 = 0x0040;
const POP_C_QUIT: u16 = 0x0080;
const POP_C_RETR: u16 = 0x0100;
const POP_C_RSET: u16 = 0x0200;
const POP_C_STAT: u16 = 0x0400;
const POP_C_STLS: u16 = 0x0800;
const POP_C_TOP: u16 = 0x1000;
const POP_C_UIDL: u16 = 0x2000;
const POP_C_USER: u16 = 0x4000;
const POP_C_XTND: u16 = 0x8000;

const POP_MXNMLN: usize = 65; // max name length
const POP_MXUNM: usize = 5; // max users
const POP_MXPNM: usize = 5; // max passwords / parameters
const POP_MXCNM: usize = 10; // max content entries / message ids
const POP_NONAME: &str = "nudel";

#[derive(Default)]
struct PopFlow {
    status: u16,
    commands: u16,
    msg_ids: Vec<u16>,
    users: Vec<String>,
    passwords: Vec<String>,
    content: Vec<String>,
    writer: Option<SeqWriter>,
}

pub struct PopDecoder {
    flows: Vec<PopFlow>,
    config: DecoderConfig,
    packets: u64,
    files: u64,
    agg_status: u16,
}

impl PopDecoder {
    pub fn new(flow_capacity: usize, config: DecoderConfig) -> PopDecoder {
        if config.enable_save {
            if let Err(e) = config.prepare_output_dir() {
                warn!("failed to prepare {}: {e}", config.output_dir.display());
            }
        }
        PopDecoder {
            flows: (0..flow_capacity).map(|_| PopFlow::default()).collect(),
            config,
            packets: 0,
            files: 0,
            agg_status: 0,
        }
    }

    /// Mutable access to a flow's state and its opposite's.
    fn pair(&mut self, a: usize, b: usize) -> (&mut PopFlow, &mut PopFlow) {
        debug_assert_ne!(a, b);
        if a < b {
            let (lo, hi) = self.flows.split_at_mut(b);
            (&mut lo[a], &mut hi[0])
        } else {
            let (lo, hi) = self.flows.split_at_mut(a);
            (&mut hi[0], &mut lo[b])
        }
    }

    fn capture_arg(list: &mut Vec<String>, status: &mut u16, cap: usize, line: &[u8]) {
        if list.len() >= cap {
            *status |= POP_OVFL;
            return;
        }
        if line.len() < 6 {
            return;
        }
        let arg = &line[5..];
        let end = arg.len().min(POP_MXNMLN);
        list.push(String::from_utf8_lossy(&arg[..end]).into_owned());
    }

    fn client_packet(state: &mut PopFlow, opposite: Option<&mut PopFlow>, line: &[u8]) {
        let tok = cmd_word(first_word(line));
        match tok {
            t if t == token(b"APOP") => state.commands |= POP_C_APOP,
            t if t == token(b"AUTH") => {
                state.commands |= POP_C_AUTH;
                if line.windows(5).any(|w| w == b"PLAIN") {
                    state.status |= POP_PAUT;
                }
            }
            t if t == token(b"CAPA") => state.commands |= POP_C_CAPA,
            t if t == token(b"DELE") => state.commands |= POP_C_DELE,
            t if t == token(b"LIST") => state.commands |= POP_C_LIST,
            t if t == token(b"NOOP") => state.commands |= POP_C_NOOP,
            t if t == token(b"PASS") => {
                state.commands |= POP_C_PASS;
                let (list, status) = (&mut state.passwords, &mut state.status);
                Self::capture_arg(list, status, POP_MXPNM, line);
            }
            t if t == token(b"QUIT") => {
                state.commands |= POP_C_QUIT;
                state.writer = None;
                state.status &= !POP_DTP;
            }
            t if t == token(b"RETR") => {
                state.commands |= POP_C_RETR;
                state.status |= POP_DTP;
                let (list, status) = (&mut state.content, &mut state.status);
                Self::capture_arg(list, status, POP_MXPNM, line);
            }
            t if t == token(b"RSET") => state.commands |= POP_C_RSET,
            t if t == token(b"STAT") => state.commands |= POP_C_STAT,
            t if t == token(b"STLS") => state.commands |= POP_C_STLS,
            t if t == token(b"TOP") => state.commands |= POP_C_TOP,
            t if t == token(b"UIDL") => state.commands |= POP_C_UIDL,
            t if t == token(b"USER") => {
                state.commands |= POP_C_USER;
                let (list, status) = (&mut state.users, &mut state.status);
                Self::capture_arg(list, status, POP_MXUNM, line);
            }
            t if t == token(b"XTND") => state.commands |= POP_C_XTND,
            _ => {
                // An unrecognized client line right after AUTH carries the
                // credentials blob.
                if state.status & POP_PAUT != 0 {
                    if state.passwords.len() < POP_MXPNM {
                        let end = line.len().min(POP_MXNMLN);
                        state
                            .passwords
                            .push(String::from_utf8_lossy(&line[..end]).into_owned());
                    } else {
                        state.status |= POP_OVFL;
                    }
                    state.status &= !POP_PAUT;
                    if let Some(opp) = opposite {
                        opp.status |= POP_RPATH;
                    }
                }
            }
        }
    }

    fn last_user_or_noname(opp: Option<&PopFlow>) -> String {
        opp.and_then(|o| o.users.last())
            .map(|u| u.replace('/', "_"))
            .unwrap_or_else(|| POP_NONAME.to_owned())
    }

    fn server_packet(
        &mut self,
        flow: &Flow,
        idx: usize,
        opp: Option<usize>,
        seq: u32,
        payload: &[u8],
    ) {
        let line = payload;
        if self.flows[idx].msg_ids.len() >= POP_MXCNM {
            self.flows[idx].status |= POP_OVFL;
            return;
        }

        let skip = if line.starts_with(b"+OK") {
            self.flows[idx].status |= POP_ROK;
            if self.config.enable_save {
                let opp_dtp = opp
                    .map(|o| self.flows[o].status & POP_DTP != 0)
                    .unwrap_or(false);
                if opp_dtp && self.flows[idx].writer.is_none() {
                    let user = Self::last_user_or_noname(opp.map(|o| &self.flows[o]));
                    let name = format!(
                        "{}{}_{}_{}{}",
                        self.config.file_prefix,
                        user,
                        flow.dir_char(),
                        flow.findex,
                        self.config.file_suffix
                    );
                    let path = self.config.output_dir.join(name);
                    // The message body starts with the next segment.
                    match SeqWriter::create(&path, seq.wrapping_add(payload.len() as u32)) {
                        Ok(w) => {
                            self.flows[idx].writer = Some(w);
                            self.files += 1;
                            if let Some(o) = opp {
                                self.flows[o].status |= POP_DWF;
                            }
                        }
                        Err(e) => {
                            warn!("failed to open {}: {e}", path.display());
                            self.flows[idx].status |= POP_RERR;
                            return;
                        }
                    }
                }
            }
            4
        } else if line.starts_with(b"-ERR") {
            self.flows[idx].status |= POP_RERR;
            self.flows[idx].writer = None;
            if let Some(o) = opp {
                self.flows[o].status &= !POP_DTP;
            }
            5
        } else {
            // Not a status line: either message data or garbage.
            self.flows[idx].status |= POP_RNVL;
            if self.flows[idx].status & POP_RPATH != 0 {
                if let Some(start) = line.windows(14).position(|w| w == b"Return-Path: <") {
                    let rest = &line[start + 14..];
                    if let Some(end) = rest.iter().position(|&b| b == b'>') {
                        let name = &rest[..end.min(POP_MXNMLN)];
                        if self.flows[idx].users.len() < POP_MXUNM {
                            let user = String::from_utf8_lossy(name).into_owned();
                            self.flows[idx].users.push(user);
                        }
                    }
                }
                self.flows[idx].status &= !POP_RPATH;
            }
            let opp_dtp = opp
                .map(|o| self.flows[o].status & POP_DTP != 0)
                .unwrap_or(false);
            if opp_dtp {
                let state = &mut self.flows[idx];
                if let Some(w) = &mut state.writer {
                    if w.write_seq(seq, payload).is_err() {
                        state.status |= POP_RERR;
                    }
                } else {
                    state.status &= !POP_DTP;
                }
            } else if self.flows[idx].writer.is_some() {
                self.flows[idx].writer = None;
                if let Some(o) = opp {
                    self.flows[o].status &= !POP_DTP;
                }
            }
            return;
        };

        // Capture the response parameter and a leading message id.
        let state = &mut self.flows[idx];
        if line.len() > skip {
            let rest = &line[skip..];
            if state.content.len() < POP_MXPNM {
                let end = rest
                    .iter()
                    .position(|&b| b == b'\r')
                    .unwrap_or(rest.len())
                    .min(POP_MXNMLN);
                state
                    .content
                    .push(String::from_utf8_lossy(&rest[..end]).into_owned());
            } else {
                state.status |= POP_OVFL;
            }
            if let Some(id) = response_code(rest) {
                if id != 0 {
                    dedup_push(&mut state.msg_ids, POP_MXCNM, id);
                }
            }
        }
    }
}

impl Decoder for PopDecoder {
    fn name(&self) -> &'static str {
        "popDecode"
    }

    fn header(&self) -> Vec<Column> {
        vec![
            Column::new("popStat", "POP status", ColumnType::Hex16),
            Column::new("popCBF", "POP command bitfield", ColumnType::Hex16),
            Column::repeated("popCC", "POP message ids", ColumnType::U16),
            Column::new("popUsrNum", "POP number of users", ColumnType::U8),
            Column::repeated("popUsr", "POP users", ColumnType::Str),
            Column::new("popPwNum", "POP number of passwords", ColumnType::U8),
            Column::repeated("popPw", "POP passwords", ColumnType::Str),
            Column::new("popCNum", "POP number of parameters", ColumnType::U8),
            Column::repeated("popC", "POP content", ColumnType::Str),
        ]
    }

    fn on_new_flow(&mut self, _packet: &Packet, flow: &Flow, _flows: &FlowTable) {
        let state = &mut self.flows[flow.index.0];
        *state = PopFlow::default();
        if flow.l4_proto != L4_TCP {
            return;
        }
        let ports = [flow.src_port, flow.dst_port];
        if ports.contains(&POP3_PORT) {
            state.status |= POP_INIT3;
        } else if ports.contains(&POP2_PORT) {
            state.status |= POP_INIT2;
        }
    }

    fn on_layer4(&mut self, packet: &Packet, flow: &Flow, _flows: &FlowTable) {
        let idx = flow.index.0;
        if self.flows[idx].status & (POP_INIT3 | POP_INIT2) == 0 {
            return;
        }
        let payload = packet.l7();
        if payload.len() < 4 {
            return;
        }
        self.packets += 1;
        let opp = flow.opposite.map(|o| o.0);

        if flow.is_b() {
            self.server_packet(flow, idx, opp, packet.tcp_seq(), payload);
        } else {
            match opp {
                Some(o) => {
                    let (state, opposite) = self.pair(idx, o);
                    Self::client_packet(state, Some(opposite), payload);
                }
                None => Self::client_packet(&mut self.flows[idx], None, payload),
            }
        }
    }

    fn on_flow_terminate(
        &mut self,
        flow: &Flow,
        _flows: &FlowTable,
        record: &mut RecordBuilder,
    ) -> Result<()> {
        let state = &mut self.flows[flow.index.0];
        state.writer = None;
        self.agg_status |= state.status;

        record.append_u16(state.status)?;
        record.append_u16(state.commands)?;
        record.begin_repeat(state.msg_ids.len() as u32)?;
        for id in &state.msg_ids {
            record.append_u16(*id)?;
        }
        for list in [&state.users, &state.passwords, &state.content] {
            record.append_u8(list.len() as u8)?;
            record.begin_repeat(list.len() as u32)?;
            for s in list {
                record.append_str(s)?;
            }
        }
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
