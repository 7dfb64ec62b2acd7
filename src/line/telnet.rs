//! TELNET decoder: IAC negotiation tracking and login capture.

use crate::config::DecoderConfig;
use crate::error::Result;
use crate::flow::{Flow, FlowTable};
use crate::line::SeqWriter;
use crate::packet::{Packet, L4_SCTP, L4_TCP};
use crate::runtime::{Decoder, DecoderReport};
use crate::schema::{Column, ColumnType, RecordBuilder};
use crate::tlv::dedup_push;
use tracing::*;

pub const TEL_INIT: u8 = 0x01; // Telnet port found
pub const TEL_FWRT: u8 = 0x02; // File extraction active
pub const TEL_USR: u8 = 0x04; // Username capture pending (transient)
pub const TEL_PWD: u8 = 0x08; // Password capture pending (transient)
pub const TEL_OFERR: u8 = 0x10; // File open error
pub const TEL_UP_OVFL: u8 = 0x20; // User/password length overflow
pub const TEL_CMD_OVFL: u8 = 0x40; // Command array overflow
pub const TEL_OPT_OVFL: u8 = 0x80; // Option array overflow

pub const TELNET_PORT: u16 = 23;

const IAC: u8 = 0xff;
const SE: u8 = 240;
const SB: u8 = 250;
const WILL: u8 = 251;
const DONT: u8 = 254;

const TELUPLN: usize = 25; // max user/password length
const TELCMDN: usize = 25; // max commands per flow
const TELOPTN: usize = 25; // max options per flow

#[derive(Default)]
struct TelnetFlow {
    status: u8,
    cmd_bf: u16,
    cmds: Vec<u8>,
    opts: Vec<u8>,
    user: String,
    password: String,
    writer: Option<SeqWriter>,
}

pub struct TelnetDecoder {
    flows: Vec<TelnetFlow>,
    config: DecoderConfig,
    packets: u64,
    files: u64,
    agg_status: u8,
}

impl TelnetDecoder {
    pub fn new(flow_capacity: usize, config: DecoderConfig) -> TelnetDecoder {
        if config.enable_save {
            if let Err(e) = config.prepare_output_dir() {
                warn!("failed to prepare {}: {e}", config.output_dir.display());
            }
        }
        TelnetDecoder {
            flows: (0..flow_capacity).map(|_| TelnetFlow::default()).collect(),
            config,
            packets: 0,
            files: 0,
            agg_status: 0,
        }
    }

    fn negotiation(state: &mut TelnetFlow, payload: &[u8]) {
        let mut i = 0;
        while i < payload.len() && payload[i] == IAC {
            let Some(&verb) = payload.get(i + 1) else {
                break;
            };
            let cmd = verb & 0x0f;
            state.cmd_bf |= 1 << cmd;
            if !dedup_push(&mut state.cmds, TELCMDN, cmd) {
                state.status |= TEL_CMD_OVFL;
            }
            match verb {
                WILL..=DONT => {
                    let Some(&opt) = payload.get(i + 2) else {
                        break;
                    };
                    if !dedup_push(&mut state.opts, TELOPTN, opt) {
                        state.status |= TEL_OPT_OVFL;
                    }
                    i += 3;
                }
                SB => {
                    // Skip the subnegotiation body up to SE.
                    match payload[i + 2..].iter().position(|&b| b == SE) {
                        Some(p) => i += 2 + p + 1,
                        None => break,
                    }
                }
                _ => i += 2,
            }
        }
    }

    /// Accumulate a prompted line (username or password) across packets;
    /// interactive sessions often send one byte per segment.
    fn capture(dst: &mut String, status: &mut u8, done_bit: u8, payload: &[u8]) {
        if payload[0] == b'\r' {
            *status &= !done_bit;
            return;
        }
        let end = payload
            .iter()
            .position(|&b| b == b'\r')
            .unwrap_or(payload.len());
        let take = end.min(TELUPLN.saturating_sub(dst.len()));
        if take < end {
            *status |= TEL_UP_OVFL;
        }
        dst.push_str(&String::from_utf8_lossy(&payload[..take]));
        // A full line (not single-keystroke typing) completes the capture.
        if payload.len() > 1 || end < payload.len() {
            *status &= !done_bit;
        }
    }
}

impl Decoder for TelnetDecoder {
    fn name(&self) -> &'static str {
        "telnetDecode"
    }

    fn header(&self) -> Vec<Column> {
        vec![
            Column::new("telStat", "TELNET status", ColumnType::Hex8),
            Column::new("telCmdBF", "TELNET command bitfield", ColumnType::Hex16),
            Column::repeated("telCmdC", "TELNET command codes", ColumnType::U8),
            Column::repeated("telOptC", "TELNET option codes", ColumnType::U8),
            Column::new("telUser", "TELNET user", ColumnType::Str),
            Column::new("telPass", "TELNET password", ColumnType::Str),
        ]
    }

    fn on_new_flow(&mut self, _packet: &Packet, flow: &Flow, _flows: &FlowTable) {
        let state = &mut self.flows[flow.index.0];
        *state = TelnetFlow::default();
        if (flow.l4_proto == L4_TCP || flow.l4_proto == L4_SCTP)
            && (flow.src_port == TELNET_PORT || flow.dst_port == TELNET_PORT)
        {
            state.status |= TEL_INIT;
        }
    }

    fn on_layer4(&mut self, packet: &Packet, flow: &Flow, _flows: &FlowTable) {
        let idx = flow.index.0;
        if self.flows[idx].status & TEL_INIT == 0 {
            return;
        }
        let payload = packet.l7();
        if payload.is_empty() {
            return;
        }
        self.packets += 1;

        if payload[0] == IAC {
            Self::negotiation(&mut self.flows[idx], payload);
            return;
        }

        // Login prompts arm the capture on the opposite (client) flow.
        if let Some(opp) = flow.opposite {
            if payload.windows(6).any(|w| w == b"login:") {
                self.flows[opp.0].status |= TEL_USR;
            }
            if payload.windows(9).any(|w| w == b"Password:") {
                self.flows[opp.0].status |= TEL_PWD;
            }
        }

        let state = &mut self.flows[idx];
        if state.status & TEL_USR != 0 {
            let (user, status) = (&mut state.user, &mut state.status);
            Self::capture(user, status, TEL_USR, payload);
        } else if state.status & TEL_PWD != 0 {
            let (pass, status) = (&mut state.password, &mut state.status);
            Self::capture(pass, status, TEL_PWD, payload);
        }

        if self.config.enable_save && state.status & TEL_OFERR == 0 {
            let seq = packet.tcp_seq();
            if state.writer.is_none() {
                let name = format!(
                    "{}telnet_flow_{}_{}{}",
                    self.config.file_prefix,
                    flow.findex,
                    flow.dir_char(),
                    self.config.file_suffix
                );
                let path = self.config.output_dir.join(name);
                match SeqWriter::create(&path, seq) {
                    Ok(w) => {
                        state.writer = Some(w);
                        state.status |= TEL_FWRT;
                        self.files += 1;
                    }
                    Err(e) => {
                        warn!("failed to open {}: {e}", path.display());
                        state.status |= TEL_OFERR;
                    }
                }
            }
            if let Some(w) = &mut state.writer {
                if w.write_seq(seq, payload).is_err() {
                    state.status |= TEL_OFERR;
                }
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

        record.append_u8(state.status)?;
        record.append_u16(state.cmd_bf)?;
        record.begin_repeat(state.cmds.len() as u32)?;
        for cmd in &state.cmds {
            record.append_u8(*cmd)?;
        }
        record.begin_repeat(state.opts.len() as u32)?;
        for opt in &state.opts {
            record.append_u8(*opt)?;
        }
        record.append_str(&state.user)?;
        record.append_str(&state.password)?;
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{Direction, FlowIndex};

    struct Session {
        dec: TelnetDecoder,
        flows: FlowTable,
        a: Flow,
        b: Flow,
    }

    impl Session {
        fn new() -> Session {
            let mut dec = TelnetDecoder::new(2, DecoderConfig::default());
            let flows = FlowTable::with_capacity(2);
            let mut a = Flow::new(1, FlowIndex(0), Direction::A);
            a.l4_proto = L4_TCP;
            a.src_port = 50000;
            a.dst_port = TELNET_PORT;
            a.opposite = Some(FlowIndex(1));
            let mut b = Flow::new(2, FlowIndex(1), Direction::B);
            b.l4_proto = L4_TCP;
            b.src_port = TELNET_PORT;
            b.dst_port = 50000;
            b.opposite = Some(FlowIndex(0));
            let raw = [0u8; 60];
            let pkt = Packet::layer4(
                &raw,
                L4_TCP,
                "10.0.0.1".parse().unwrap(),
                "10.0.0.2".parse().unwrap(),
                50000,
                TELNET_PORT,
                54,
            );
            dec.on_new_flow(&pkt, &a, &flows);
            dec.on_new_flow(&pkt, &b, &flows);
            Session { dec, flows, a, b }
        }

        fn packet(&mut self, dir: Direction, payload: &[u8]) {
            let mut raw = vec![0u8; 54];
            raw.extend_from_slice(payload);
            let pkt = Packet::layer4(
                &raw,
                L4_TCP,
                "10.0.0.1".parse().unwrap(),
                "10.0.0.2".parse().unwrap(),
                50000,
                TELNET_PORT,
                54,
            )
            .with_tcp(1000, 0x18);
            let flow = match dir {
                Direction::A => &self.a,
                Direction::B => &self.b,
            };
            self.dec.on_layer4(&pkt, flow, &self.flows);
        }
    }

    #[test]
    fn option_negotiation() {
        let mut s = Session::new();
        // IAC DO ECHO, IAC WILL SUPPRESS-GO-AHEAD
        s.packet(Direction::B, &[IAC, 253, 1, IAC, 251, 3]);
        let state = &s.dec.flows[1];
        assert_eq!(state.opts, vec![1, 3]);
        assert!(state.cmd_bf & (1 << (253 & 0x0f)) != 0);
        assert!(state.cmd_bf & (1 << (251 & 0x0f)) != 0);
    }

    #[test]
    fn login_prompt_captures_credentials() {
        let mut s = Session::new();
        s.packet(Direction::B, b"login:");
        assert!(s.dec.flows[0].status & TEL_USR != 0);
        s.packet(Direction::A, b"alice\r\n");
        assert_eq!(s.dec.flows[0].user, "alice");
        assert!(s.dec.flows[0].status & TEL_USR == 0);

        s.packet(Direction::B, b"Password:");
        assert!(s.dec.flows[0].status & TEL_PWD != 0);
        // One keystroke per segment.
        for b in b"s3cret" {
            s.packet(Direction::A, &[*b]);
        }
        s.packet(Direction::A, b"\r");
        assert_eq!(s.dec.flows[0].password, "s3cret");
        assert!(s.dec.flows[0].status & TEL_PWD == 0);
    }

    #[test]
    fn subnegotiation_is_skipped() {
        let mut s = Session::new();
        // IAC SB TERMINAL-TYPE ... SE, then IAC DO ECHO.
        s.packet(
            Direction::A,
            &[IAC, SB, 24, 0, b'x', b't', b'e', b'r', b'm', IAC, SE, IAC, 253, 1],
        );
        let state = &s.dec.flows[0];
        assert_eq!(state.opts, vec![1]);
    }
}
