//! SMTP decoder.

use crate::config::DecoderConfig;
use crate::error::Result;
use crate::flow::{Flow, FlowTable};
use crate::line::{cmd_word, first_word, response_code, token, SeqWriter};
use crate::packet::{Packet, L4_TCP};
use crate::runtime::{Decoder, DecoderReport};
use crate::schema::{Column, ColumnType, RecordBuilder};
use crate::tlv::dedup_push;
use tracing::*;

pub const SMTP_INIT: u8 = 0x01; // SMTP port found
pub const SMTP_AUTP: u8 = 0x02; // Authentication pending (transient)
pub const SMTP_DTP: u8 = 0x04; // Data transfer pending (transient)
pub const SMTP_PWP: u8 = 0x08; // Password pending (transient)
pub const SMTP_PWF: u8 = 0x10; // Flow write finished
pub const SMTP_FERR: u8 = 0x40; // Extraction file error
pub const SMTP_OVFL: u8 = 0x80; // Array overflow

pub const SMTP_PORT: u16 = 25;
pub const SMTP_SUBMISSION_PORT: u16 = 587;

// Command bitfield
const SMTP_C_HELO: u16 = 0x0001;
const SMTP_C_EHLO: u16 = 0x0002;
const SMTP_C_MAIL: u16 = 0x0004;
const SMTP_C_RCPT: u16 = 0x0008;
const SMTP_C_DATA: u16 = 0x0010;
const SMTP_C_RSET: u16 = 0x0020;
const SMTP_C_SEND: u16 = 0x0040;
const SMTP_C_SOML: u16 = 0x0080;
const SMTP_C_SAML: u16 = 0x0100;
const SMTP_C_VRFY: u16 = 0x0200;
const SMTP_C_EXPN: u16 = 0x0400;
const SMTP_C_HELP: u16 = 0x0800;
const SMTP_C_NOOP: u16 = 0x1000;
const SMTP_C_QUIT: u16 = 0x2000;
const SMTP_C_TURN: u16 = 0x4000;
const SMTP_C_AUTH: u16 = 0x8000;

const SMTP_MXNMLN: usize = 70; // max name length
const SMTP_MXUNMLN: usize = 25; // max user length
const SMTP_MXPNMLN: usize = 15; // max password length
const SMTP_MAXCNM: usize = 8; // max response codes
const SMTP_MAXUNM: usize = 5; // max users
const SMTP_MAXPNM: usize = 5; // max passwords
const SMTP_MAXSNM: usize = 8; // max server names
const SMTP_MAXRNM: usize = 8; // max recipient addresses
const SMTP_MAXTNM: usize = 8; // max sender addresses
const SMTP_NONAME: &str = "nudel";

#[derive(Default)]
struct SmtpFlow {
    status: u8,
    commands: u16,
    rec_codes: Vec<u16>,
    users: Vec<String>,
    passwords: Vec<String>,
    servers: Vec<String>,
    senders: Vec<String>,
    recipients: Vec<String>,
    writer: Option<SeqWriter>,
}

pub struct SmtpDecoder {
    flows: Vec<SmtpFlow>,
    config: DecoderConfig,
    packets: u64,
    files: u64,
    agg_status: u8,
}

/// The address between `<` and `>` on a MAIL FROM / RCPT TO line, or the
/// remainder after the colon when no brackets are present.
fn mail_address(line: &[u8]) -> Option<String> {
    let start = line.iter().position(|&b| b == b'<')?;
    let rest = &line[start + 1..];
    let end = rest.iter().position(|&b| b == b'>').unwrap_or(rest.len());
    let end = end.min(SMTP_MXNMLN);
    Some(String::from_utf8_lossy(&rest[..end]).into_owned())
}

impl SmtpDecoder {
    pub fn new(flow_capacity: usize, config: DecoderConfig) -> SmtpDecoder {
        if config.enable_save {
            if let Err(e) = config.prepare_output_dir() {
                warn!("failed to prepare {}: {e}", config.output_dir.display());
            }
        }
        SmtpDecoder {
            flows: (0..flow_capacity).map(|_| SmtpFlow::default()).collect(),
            config,
            packets: 0,
            files: 0,
            agg_status: 0,
        }
    }

    fn server_packet(state: &mut SmtpFlow, payload: &[u8]) {
        let Some(code) = response_code(payload) else {
            return;
        };
        if state.rec_codes.len() >= SMTP_MAXCNM {
            state.status |= SMTP_OVFL;
            return;
        }
        dedup_push(&mut state.rec_codes, SMTP_MAXCNM, code);
        // Response text is kept alongside the server names.
        if payload.len() > 4 && state.servers.len() < SMTP_MAXSNM {
            let rest = &payload[4..];
            let end = rest
                .iter()
                .position(|&b| b == b'\r')
                .unwrap_or(rest.len())
                .min(SMTP_MXNMLN);
            let text = String::from_utf8_lossy(&rest[..end]).into_owned();
            dedup_push(&mut state.servers, SMTP_MAXSNM, text);
        }
    }

    fn client_packet(&mut self, flow: &Flow, idx: usize, seq: u32, payload: &[u8]) {
        // Pending authentication: the next lines carry user then password.
        if self.flows[idx].status & SMTP_AUTP != 0 {
            let state = &mut self.flows[idx];
            let Some(end) = payload.iter().position(|&b| b == b'\r') else {
                state.status &= !(SMTP_PWP | SMTP_AUTP);
                return;
            };
            if state.status & SMTP_PWP != 0 {
                if state.passwords.len() >= SMTP_MAXPNM {
                    state.status |= SMTP_OVFL;
                } else {
                    let n = end.min(SMTP_MXPNMLN);
                    state
                        .passwords
                        .push(String::from_utf8_lossy(&payload[..n]).into_owned());
                }
                state.status &= !(SMTP_PWP | SMTP_AUTP);
            } else {
                if state.users.len() >= SMTP_MAXUNM {
                    state.status |= SMTP_OVFL;
                } else {
                    let n = end.min(SMTP_MXUNMLN);
                    state
                        .users
                        .push(String::from_utf8_lossy(&payload[..n]).into_owned());
                }
                state.status |= SMTP_PWP;
            }
            return;
        }

        // Pending message data: write and wait for the terminating dot.
        if self.flows[idx].status & SMTP_DTP != 0 {
            let state = &mut self.flows[idx];
            if let Some(w) = &mut state.writer {
                if w.write_seq(seq, payload).is_err() {
                    state.status |= SMTP_FERR;
                }
            }
            if payload == b".\r\n" || payload.ends_with(b"\r\n.\r\n") {
                state.status &= !SMTP_DTP;
                state.status |= SMTP_PWF;
                state.writer = None;
            }
            return;
        }

        let tok = cmd_word(first_word(payload));
        let state = &mut self.flows[idx];
        state.status &= !(SMTP_PWP | SMTP_AUTP);
        match tok {
            t if t == token(b"HELO") || t == token(b"EHLO") => {
                state.commands |= if t == token(b"HELO") {
                    SMTP_C_HELO
                } else {
                    SMTP_C_EHLO
                };
                if state.servers.len() >= SMTP_MAXSNM {
                    state.status |= SMTP_OVFL;
                } else if payload.len() > 7 {
                    let rest = &payload[5..];
                    if let Some(end) = rest.iter().position(|&b| b == b'\r') {
                        let n = end.min(SMTP_MXNMLN);
                        let name = String::from_utf8_lossy(&rest[..n]).into_owned();
                        dedup_push(&mut state.servers, SMTP_MAXSNM, name);
                    }
                }
            }
            t if t == token(b"MAIL") => {
                state.commands |= SMTP_C_MAIL;
                if state.senders.len() >= SMTP_MAXTNM {
                    state.status |= SMTP_OVFL;
                } else if let Some(addr) = mail_address(payload) {
                    state.senders.push(addr);
                }
            }
            t if t == token(b"RCPT") => {
                state.commands |= SMTP_C_RCPT;
                if state.recipients.len() >= SMTP_MAXRNM {
                    state.status |= SMTP_OVFL;
                } else if let Some(addr) = mail_address(payload) {
                    state.recipients.push(addr);
                }
            }
            t if t == token(b"DATA") => {
                state.commands |= SMTP_C_DATA;
                if self.config.enable_save && state.writer.is_none() {
                    let sender = state
                        .senders
                        .last()
                        .map(|s| s.replace('/', "_"))
                        .unwrap_or_else(|| SMTP_NONAME.to_owned());
                    let name = format!(
                        "{}{}_{}_{}{}",
                        self.config.file_prefix,
                        sender,
                        flow.dir_char(),
                        flow.findex,
                        self.config.file_suffix
                    );
                    let path = self.config.output_dir.join(name);
                    // The message body starts with the next segment.
                    match SeqWriter::create(&path, seq.wrapping_add(payload.len() as u32)) {
                        Ok(w) => {
                            state.writer = Some(w);
                            self.files += 1;
                        }
                        Err(e) => {
                            warn!("failed to open {}: {e}", path.display());
                            state.status |= SMTP_FERR;
                            return;
                        }
                    }
                }
                state.status |= SMTP_DTP;
            }
            t if t == token(b"RSET") => state.commands |= SMTP_C_RSET,
            t if t == token(b"SEND") => state.commands |= SMTP_C_SEND,
            t if t == token(b"SOML") => state.commands |= SMTP_C_SOML,
            t if t == token(b"SAML") => state.commands |= SMTP_C_SAML,
            t if t == token(b"VRFY") => state.commands |= SMTP_C_VRFY,
            t if t == token(b"EXPN") => state.commands |= SMTP_C_EXPN,
            t if t == token(b"HELP") => state.commands |= SMTP_C_HELP,
            t if t == token(b"NOOP") => state.commands |= SMTP_C_NOOP,
            t if t == token(b"TURN") => state.commands |= SMTP_C_TURN,
            t if t == token(b"QUIT") => {
                state.commands |= SMTP_C_QUIT;
                if state.writer.take().is_some() {
                    state.status |= SMTP_PWF;
                }
                state.status &= !SMTP_DTP;
            }
            t if t == token(b"AUTH") => {
                state.commands |= SMTP_C_AUTH;
                state.status |= SMTP_AUTP;
            }
            _ => {}
        }
    }
}

impl Decoder for SmtpDecoder {
    fn name(&self) -> &'static str {
        "smtpDecode"
    }

    fn header(&self) -> Vec<Column> {
        vec![
            Column::new("smtpStat", "SMTP status", ColumnType::Hex8),
            Column::new("smtpCBF", "SMTP command bitfield", ColumnType::Hex16),
            Column::repeated("smtpRC", "SMTP response codes", ColumnType::U16),
            Column::new("smtpUsrNum", "SMTP number of users", ColumnType::U8),
            Column::repeated("smtpUsr", "SMTP users", ColumnType::Str),
            Column::new("smtpPwNum", "SMTP number of passwords", ColumnType::U8),
            Column::repeated("smtpPw", "SMTP passwords", ColumnType::Str),
            Column::new("smtpSANum", "SMTP number of server names", ColumnType::U8),
            Column::repeated("smtpSA", "SMTP server names", ColumnType::Str),
            Column::new("smtpESANum", "SMTP number of sender addresses", ColumnType::U8),
            Column::repeated("smtpESA", "SMTP sender addresses", ColumnType::Str),
            Column::new("smtpERANum", "SMTP number of recipient addresses", ColumnType::U8),
            Column::repeated("smtpERA", "SMTP recipient addresses", ColumnType::Str),
        ]
    }

    fn on_new_flow(&mut self, _packet: &Packet, flow: &Flow, _flows: &FlowTable) {
        let state = &mut self.flows[flow.index.0];
        *state = SmtpFlow::default();
        if flow.l4_proto != L4_TCP {
            return;
        }
        let ports = [flow.src_port, flow.dst_port];
        if ports.contains(&SMTP_PORT) || ports.contains(&SMTP_SUBMISSION_PORT) {
            state.status |= SMTP_INIT;
        }
    }

    fn on_layer4(&mut self, packet: &Packet, flow: &Flow, _flows: &FlowTable) {
        let idx = flow.index.0;
        if self.flows[idx].status & SMTP_INIT == 0 {
            return;
        }
        let payload = packet.l7();
        if payload.len() < 4 {
            return;
        }
        self.packets += 1;

        if flow.is_b() {
            Self::server_packet(&mut self.flows[idx], payload);
        } else {
            self.client_packet(flow, idx, packet.tcp_seq(), payload);
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
        record.append_u16(state.commands)?;
        record.begin_repeat(state.rec_codes.len() as u32)?;
        for code in &state.rec_codes {
            record.append_u16(*code)?;
        }
        for list in [
            &state.users,
            &state.passwords,
            &state.servers,
            &state.senders,
            &state.recipients,
        ] {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{Direction, FlowIndex};

    fn session(config: DecoderConfig) -> (SmtpDecoder, FlowTable, Flow, Flow) {
        let mut dec = SmtpDecoder::new(2, config);
        let flows = FlowTable::with_capacity(2);
        let mut a = Flow::new(1, FlowIndex(0), Direction::A);
        a.l4_proto = L4_TCP;
        a.src_port = 50000;
        a.dst_port = SMTP_PORT;
        let mut b = Flow::new(2, FlowIndex(1), Direction::B);
        b.l4_proto = L4_TCP;
        b.src_port = SMTP_PORT;
        b.dst_port = 50000;
        let raw = [0u8; 60];
        let pkt = Packet::layer4(
            &raw,
            L4_TCP,
            "10.0.0.1".parse().unwrap(),
            "10.0.0.2".parse().unwrap(),
            50000,
            SMTP_PORT,
            54,
        );
        dec.on_new_flow(&pkt, &a, &flows);
        dec.on_new_flow(&pkt, &b, &flows);
        (dec, flows, a, b)
    }

    fn packet<'a>(raw: &'a mut Vec<u8>, seq: u32, payload: &[u8]) -> Packet<'a> {
        raw.clear();
        raw.resize(54, 0);
        raw.extend_from_slice(payload);
        Packet::layer4(
            raw,
            L4_TCP,
            "10.0.0.1".parse().unwrap(),
            "10.0.0.2".parse().unwrap(),
            50000,
            SMTP_PORT,
            54,
        )
        .with_tcp(seq, 0x18)
    }

    #[test]
    fn envelope_addresses() {
        let (mut dec, flows, a, _b) = session(DecoderConfig::default());
        let mut raw = Vec::new();
        let pkt = packet(&mut raw, 100, b"EHLO mail.example.org\r\n");
        dec.on_layer4(&pkt, &a, &flows);
        let pkt = packet(&mut raw, 123, b"MAIL FROM:<bob@example.org>\r\n");
        dec.on_layer4(&pkt, &a, &flows);
        let pkt = packet(&mut raw, 152, b"RCPT TO:<alice@example.net>\r\n");
        dec.on_layer4(&pkt, &a, &flows);

        let state = &dec.flows[0];
        assert_eq!(state.commands, SMTP_C_EHLO | SMTP_C_MAIL | SMTP_C_RCPT);
        assert_eq!(state.servers, vec!["mail.example.org"]);
        assert_eq!(state.senders, vec!["bob@example.org"]);
        assert_eq!(state.recipients, vec!["alice@example.net"]);
    }

    #[test]
    fn auth_login_captures_credentials() {
        let (mut dec, flows, a, _b) = session(DecoderConfig::default());
        let mut raw = Vec::new();
        let pkt = packet(&mut raw, 100, b"AUTH LOGIN\r\n");
        dec.on_layer4(&pkt, &a, &flows);
        assert!(dec.flows[0].status & SMTP_AUTP != 0);
        let pkt = packet(&mut raw, 112, b"YWxpY2U=\r\n");
        dec.on_layer4(&pkt, &a, &flows);
        assert!(dec.flows[0].status & SMTP_PWP != 0);
        let pkt = packet(&mut raw, 122, b"czNjcmV0\r\n");
        dec.on_layer4(&pkt, &a, &flows);

        let state = &dec.flows[0];
        assert_eq!(state.users, vec!["YWxpY2U="]);
        assert_eq!(state.passwords, vec!["czNjcmV0"]);
        assert!(state.status & (SMTP_AUTP | SMTP_PWP) == 0);
    }

    #[test]
    fn server_codes_deduplicate() {
        let (mut dec, flows, _a, b) = session(DecoderConfig::default());
        let mut raw = Vec::new();
        for _ in 0..2 {
            let pkt = packet(&mut raw, 200, b"250 OK\r\n");
            dec.on_layer4(&pkt, &b, &flows);
        }
        assert_eq!(dec.flows[1].rec_codes, vec![250]);
    }

    #[test]
    fn data_is_saved_until_dot() {
        let dir = tempfile::tempdir().unwrap();
        let config = DecoderConfig {
            enable_save: true,
            output_dir: dir.path().to_path_buf(),
            ..DecoderConfig::default()
        };
        let (mut dec, flows, a, _b) = session(config);
        let mut raw = Vec::new();
        let pkt = packet(&mut raw, 100, b"MAIL FROM:<bob@example.org>\r\n");
        dec.on_layer4(&pkt, &a, &flows);
        let pkt = packet(&mut raw, 129, b"DATA\r\n");
        dec.on_layer4(&pkt, &a, &flows);
        let pkt = packet(&mut raw, 135, b"Subject: hi\r\n\r\nbody\r\n.\r\n");
        dec.on_layer4(&pkt, &a, &flows);

        let state = &dec.flows[0];
        assert!(state.status & SMTP_DTP == 0);
        assert!(state.status & SMTP_PWF != 0);
        let path = dir.path().join("bob@example.org_A_1");
        let content = std::fs::read(&path).unwrap();
        assert_eq!(&content, b"Subject: hi\r\n\r\nbody\r\n.\r\n");
    }
}
