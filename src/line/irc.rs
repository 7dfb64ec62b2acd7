//! IRC decoder.

use crate::config::DecoderConfig;
use crate::error::Result;
use crate::flow::{Flow, FlowTable};
use crate::line::{
    bounded_arg, cmd_word, first_word, lines, response_code, strip_prefix, token, SeqWriter,
};
use crate::packet::{Packet, L4_TCP};
use crate::runtime::{Decoder, DecoderReport};
use crate::schema::{Column, ColumnType, RecordBuilder};
use crate::tlv::dedup_push;
use tracing::*;

pub const IRC_INIT: u8 = 0x01; // IRC port found
pub const IRC_REG_SUCC: u8 = 0x02; // Registration successful
pub const IRC_LOG_ERR: u8 = 0x04; // Password incorrect
pub const IRC_SENDCODE: u8 = 0x10; // Unrecognized IRC command
pub const IRC_FILE_ERR: u8 = 0x20; // Extraction file error
pub const IRC_OVFL: u8 = 0x40; // Array, string or filename overflow
pub const IRC_MALFORMED: u8 = 0x80; // Invalid format or parsing error

pub const IRC_PORT: u16 = 194;
pub const IRC_PORT_MIN: u16 = 6665;
pub const IRC_PORT_MAX: u16 = 6669;

const IRC_UXNMLN: usize = 10; // max username length
const IRC_PXNMLN: usize = 10; // max password length
const IRC_NXNMLN: usize = 10; // max nickname length
const IRC_MXNMLN: usize = 50; // max parameter length
const IRC_MAXUNM: usize = 5; // max number of users
const IRC_MAXPNM: usize = 5; // max number of passwords
const IRC_MAXNNM: usize = 5; // max number of nicknames
const IRC_MAXCNM: usize = 20; // max number of parameters / response codes

/// Recognized commands, in bitfield order.
const COMMANDS: &[(u64, u32)] = &[
    (token(b"ADMIN"), 0),
    (token(b"AWAY"), 1),
    (token(b"CONNECT"), 2),
    (token(b"DIE"), 3),
    (token(b"ERROR"), 4),
    (token(b"HELP"), 5),
    (token(b"INFO"), 6),
    (token(b"INVITE"), 7),
    (token(b"ISON"), 8),
    (token(b"JOIN"), 9),
    (token(b"KICK"), 10),
    (token(b"KILL"), 11),
    (token(b"LINKS"), 12),
    (token(b"LIST"), 13),
    (token(b"MODE"), 14),
    (token(b"MOTD"), 15),
    (token(b"NAMES"), 16),
    (token(b"NICK"), 17),
    (token(b"NOTICE"), 18),
    (token(b"OPER"), 19),
    (token(b"PART"), 20),
    (token(b"PASS"), 21),
    (token(b"PING"), 22),
    (token(b"PONG"), 23),
    (token(b"PRIVMSG"), 24),
    (token(b"QUIT"), 25),
    (token(b"TOPIC"), 26),
    (token(b"USER"), 27),
    (token(b"WHO"), 28),
    (token(b"WHOIS"), 29),
];

#[derive(Default)]
struct IrcFlow {
    status: u8,
    commands: u64,
    rec_codes: Vec<u16>,
    users: Vec<String>,
    passwords: Vec<String>,
    nicks: Vec<String>,
    params: Vec<String>,
    writer: Option<SeqWriter>,
}

pub struct IrcDecoder {
    flows: Vec<IrcFlow>,
    config: DecoderConfig,
    packets: u64,
    agg_status: u8,
}

impl IrcDecoder {
    pub fn new(flow_capacity: usize, config: DecoderConfig) -> IrcDecoder {
        if config.enable_save {
            if let Err(e) = config.prepare_output_dir() {
                warn!("failed to prepare {}: {e}", config.output_dir.display());
            }
        }
        IrcDecoder {
            flows: (0..flow_capacity).map(|_| IrcFlow::default()).collect(),
            config,
            packets: 0,
            agg_status: 0,
        }
    }

    fn push_bounded(state: &mut IrcFlow, list: fn(&mut IrcFlow) -> &mut Vec<String>, cap: usize, value: String) {
        let full = {
            let l = list(state);
            if l.len() >= cap {
                true
            } else {
                l.push(value);
                false
            }
        };
        if full {
            state.status |= IRC_OVFL;
        }
    }

    fn client_line(state: &mut IrcFlow, line: &[u8]) {
        let word = first_word(line);
        if word.is_empty() {
            return;
        }
        let tok = cmd_word(word);
        let Some(&(_, bit)) = COMMANDS.iter().find(|(t, _)| *t == tok) else {
            state.status |= IRC_SENDCODE;
            return;
        };
        state.commands |= 1 << bit;
        let arg = if line.len() > word.len() {
            &line[word.len() + 1..]
        } else {
            &[][..]
        };
        match tok {
            t if t == token(b"NICK") => {
                let nick = bounded_arg(arg, IRC_NXNMLN);
                if !nick.is_empty() {
                    Self::push_bounded(state, |s| &mut s.nicks, IRC_MAXNNM, nick);
                }
            }
            t if t == token(b"USER") => {
                let user = bounded_arg(arg, IRC_UXNMLN);
                if !user.is_empty() {
                    Self::push_bounded(state, |s| &mut s.users, IRC_MAXUNM, user);
                }
            }
            t if t == token(b"PASS") => {
                let pass = bounded_arg(arg, IRC_PXNMLN);
                if !pass.is_empty() {
                    Self::push_bounded(state, |s| &mut s.passwords, IRC_MAXPNM, pass);
                }
            }
            t if t == token(b"JOIN") || t == token(b"PRIVMSG") || t == token(b"TOPIC") => {
                if !arg.is_empty() {
                    let end = arg.len().min(IRC_MXNMLN);
                    let param = String::from_utf8_lossy(&arg[..end]).into_owned();
                    Self::push_bounded(state, |s| &mut s.params, IRC_MAXCNM, param);
                }
            }
            _ => {}
        }
    }

    fn server_line(state: &mut IrcFlow, line: &[u8]) {
        let Some(code) = response_code(line) else {
            return;
        };
        match code {
            0 => return,
            1..=4 => state.status |= IRC_REG_SUCC,
            464 => state.status |= IRC_LOG_ERR,
            _ => {}
        }
        if state.rec_codes.len() >= IRC_MAXCNM {
            state.status |= IRC_OVFL;
        } else {
            dedup_push(&mut state.rec_codes, IRC_MAXCNM, code);
        }
    }
}

impl Decoder for IrcDecoder {
    fn name(&self) -> &'static str {
        "ircDecode"
    }

    fn header(&self) -> Vec<Column> {
        vec![
            Column::new("ircStat", "IRC status", ColumnType::Hex8),
            Column::new("ircCBF", "IRC command bitfield", ColumnType::Hex64),
            Column::repeated("ircRC", "IRC response codes", ColumnType::U16),
            Column::new("ircNumUser", "IRC number of users", ColumnType::U8),
            Column::repeated("ircUser", "IRC users", ColumnType::Str),
            Column::new("ircNumPass", "IRC number of passwords", ColumnType::U8),
            Column::repeated("ircPass", "IRC passwords", ColumnType::Str),
            Column::new("ircNumNick", "IRC number of nicknames", ColumnType::U8),
            Column::repeated("ircNick", "IRC nicknames", ColumnType::Str),
            Column::new("ircNumC", "IRC number of parameters", ColumnType::U8),
            Column::repeated("ircC", "IRC content", ColumnType::Str),
        ]
    }

    fn on_new_flow(&mut self, _packet: &Packet, flow: &Flow, _flows: &FlowTable) {
        let state = &mut self.flows[flow.index.0];
        *state = IrcFlow::default();
        if flow.l4_proto != L4_TCP {
            return;
        }
        let ports = [flow.src_port, flow.dst_port];
        if ports.contains(&IRC_PORT)
            || ports
                .iter()
                .any(|p| (IRC_PORT_MIN..=IRC_PORT_MAX).contains(p))
        {
            state.status |= IRC_INIT;
        }
    }

    fn on_layer4(&mut self, packet: &Packet, flow: &Flow, _flows: &FlowTable) {
        let state = &mut self.flows[flow.index.0];
        if state.status & IRC_INIT == 0 {
            return;
        }
        let payload = packet.l7();
        if payload.len() < 4 {
            return;
        }
        self.packets += 1;

        if self.config.enable_save {
            let seq = packet.tcp_seq();
            if state.writer.is_none() {
                let name = format!(
                    "{}irc_flow_{}_{}.txt{}",
                    self.config.file_prefix,
                    flow.findex,
                    flow.dir_char(),
                    self.config.file_suffix
                );
                let path = self.config.output_dir.join(name);
                match SeqWriter::create(&path, seq) {
                    Ok(w) => state.writer = Some(w),
                    Err(e) => {
                        warn!("failed to open {}: {e}", path.display());
                        state.status |= IRC_FILE_ERR;
                    }
                }
            }
            if let Some(w) = &mut state.writer {
                if w.write_seq(seq, payload).is_err() {
                    state.status |= IRC_FILE_ERR;
                }
            }
        }

        for line in lines(payload) {
            let Some(stripped) = strip_prefix(line.bytes) else {
                state.status |= IRC_MALFORMED;
                return;
            };
            if flow.is_b() {
                Self::server_line(state, stripped);
            } else {
                Self::client_line(state, stripped);
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
        state.writer = None; // close the extraction file
        self.agg_status |= state.status;

        record.append_u8(state.status)?;
        record.append_u64(state.commands)?;
        record.begin_repeat(state.rec_codes.len() as u32)?;
        for code in &state.rec_codes {
            record.append_u16(*code)?;
        }
        for list in [&state.users, &state.passwords, &state.nicks, &state.params] {
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
            units: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{Direction, FlowIndex};

    fn run(dir: Direction, payload: &[u8]) -> IrcFlow {
        let mut raw = vec![0u8; 54];
        raw.extend_from_slice(payload);
        let pkt = Packet::layer4(
            &raw,
            L4_TCP,
            "10.0.0.1".parse().unwrap(),
            "10.0.0.2".parse().unwrap(),
            50000,
            6667,
            54,
        )
        .with_tcp(1000, 0x18);
        let mut dec = IrcDecoder::new(1, DecoderConfig::default());
        let flows = FlowTable::with_capacity(1);
        let mut flow = Flow::new(1, FlowIndex(0), dir);
        flow.l4_proto = L4_TCP;
        flow.src_port = 50000;
        flow.dst_port = 6667;
        dec.on_new_flow(&pkt, &flow, &flows);
        dec.on_layer4(&pkt, &flow, &flows);
        std::mem::take(&mut dec.flows[0])
    }

    #[test]
    fn registration_commands() {
        let state = run(
            Direction::A,
            b"PASS hunter2\r\nNICK alice\r\nUSER alice 0 * :Alice\r\n",
        );
        assert!(state.commands & (1 << 21) != 0); // PASS
        assert!(state.commands & (1 << 17) != 0); // NICK
        assert!(state.commands & (1 << 27) != 0); // USER
        assert_eq!(state.passwords, vec!["hunter2"]);
        assert_eq!(state.nicks, vec!["alice"]);
        assert_eq!(state.users, vec!["alice"]);
    }

    #[test]
    fn server_welcome_and_error() {
        let state = run(
            Direction::B,
            b":irc.example.net 001 alice :Welcome\r\n:irc.example.net 464 alice :Bad password\r\n",
        );
        assert!(state.status & IRC_REG_SUCC != 0);
        assert!(state.status & IRC_LOG_ERR != 0);
        assert_eq!(state.rec_codes, vec![1, 464]);
    }

    #[test]
    fn unknown_command_sets_sendcode() {
        let state = run(Direction::A, b"BOGUSCMD something\r\n");
        assert!(state.status & IRC_SENDCODE != 0);
    }

    #[test]
    fn privmsg_content_is_captured() {
        let state = run(Direction::A, b"PRIVMSG #chan :hello there\r\n");
        assert_eq!(state.params, vec!["#chan :hello there"]);
    }

    #[test]
    fn nick_overflow_sets_bit() {
        let mut payload = Vec::new();
        for i in 0..(IRC_MAXNNM + 1) {
            payload.extend_from_slice(format!("NICK nick{i}\r\n").as_bytes());
        }
        let state = run(Direction::A, &payload);
        assert!(state.status & IRC_OVFL != 0);
        assert_eq!(state.nicks.len(), IRC_MAXNNM);
    }
}
