//! Telegram MTProto decoder: transport heuristics plus optional removal
//! of the obfuscation layer when the connection prologue was captured.

use crate::config::DecoderConfig;
use crate::error::Result;
use crate::flow::{Flow, FlowTable};
use crate::line::SeqWriter;
use crate::packet::{Packet, L4_TCP, L4_UDP, TH_ACK, TH_SYN};
use crate::runtime::{Decoder, DecoderReport};
use crate::schema::{Column, ColumnType, RecordBuilder};
use crate::subnet::SubnetTable4;
use aes::Aes256;
use ctr::cipher::{KeyIvInit, StreamCipher, StreamCipherSeek};
use ctr::Ctr128BE;
use std::net::IpAddr;
use tracing::*;

pub const TG_DETECT: u16 = 0x0001; // Detected by the state machine
pub const TG_CNTRL: u16 = 0x0002; // Control channel
pub const TG_VOICE: u16 = 0x0004; // Voice
pub const TG_ADTCT: u16 = 0x0008; // Detected by IP ownership
pub const TG_FLS: u16 = 0x0010; // File save active
pub const TG_TOSD: u16 = 0x0020; // Internetwork-control TOS seen
pub const TG_PWFERR: u16 = 0x0100; // Write error
pub const TG_PLNFLG: u16 = 0x1000; // Internal state machine
pub const TG_PLIGN2: u16 = 0x2000; // Internal state machine
pub const TG_PLIGN1: u16 = 0x4000; // Internal state machine
pub const TG_INIT: u16 = 0x8000; // Candidate flow

const TG_INTCTRL: u8 = 0xc0; // IPv4 TOS for internetwork control
const TG_MTU_LIMIT: u16 = 1460;
const MOD_LIMIT: i32 = 3;
/// Telegram's AS, low 24 bits of the subnet net-ID.
const TG_ORGCODE: u32 = 0x0002_394c;

const KEY_LEN: usize = 32;
const BLOCK: usize = 16;
const OBFUSC_HDR_LEN: usize = 16 + KEY_LEN + BLOCK;
/// Only the EF obfuscation family carries no shared secret.
const TG_FAMILY_EF: u32 = 0xefef_efef;
const MSG_HDR_SIZE: usize = 1 + 8 + 16; // length + auth_key_id + msg_key

type TgCipher = Ctr128BE<Aes256>;

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
enum ObfState {
    #[default]
    Undef,
    Syn,
    Key,
    Nope,
}

#[derive(Default)]
struct TgFlow {
    status: u16,
    obf_state: ObfState,
    client_flow: bool,
    key: [u8; KEY_LEN],
    iv: [u8; BLOCK],
    seq_init: u32,
    next_msg_seq: u32,
    auth_key_id: u64,
    num_pkts: u32,
    num_bytes: i64,
    mod_cnt: i32,
    l7_len_min: u16,
    writer: Option<SeqWriter>,
    written: u64,
}

pub struct TelegramDecoder {
    flows: Vec<TgFlow>,
    config: DecoderConfig,
    subnets: Option<SubnetTable4>,
    packets: u64,
    agg_status: u16,
}

fn decrypt(key: &[u8; KEY_LEN], iv: &[u8; BLOCK], pos: u32, data: &[u8]) -> Vec<u8> {
    let mut cipher = TgCipher::new(key.into(), iv.into());
    cipher.seek(u64::from(pos));
    let mut out = data.to_vec();
    cipher.apply_keystream(&mut out);
    out
}

/// The server-to-client keystream uses the byte-reversed halves of the
/// client prologue material.
fn reverse_halves(key: &[u8; KEY_LEN], iv: &[u8; BLOCK]) -> ([u8; KEY_LEN], [u8; BLOCK]) {
    let mut opp_key = [0u8; KEY_LEN];
    let mut opp_iv = [0u8; BLOCK];
    for i in 0..BLOCK {
        opp_key[i] = iv[BLOCK - 1 - i];
        opp_key[i + BLOCK] = key[KEY_LEN - 1 - i];
        opp_iv[i] = key[BLOCK - 1 - i];
    }
    (opp_key, opp_iv)
}

impl TelegramDecoder {
    pub fn new(flow_capacity: usize, config: DecoderConfig) -> TelegramDecoder {
        if config.enable_save {
            if let Err(e) = config.prepare_output_dir() {
                warn!("failed to prepare {}: {e}", config.output_dir.display());
            }
        }
        TelegramDecoder {
            flows: (0..flow_capacity).map(|_| TgFlow::default()).collect(),
            config,
            subnets: None,
            packets: 0,
            agg_status: 0,
        }
    }

    /// Attach a subnet table so flows to Telegram's address space are
    /// flagged even when the transport heuristics stay inconclusive.
    pub fn with_subnets(mut self, subnets: SubnetTable4) -> TelegramDecoder {
        self.subnets = Some(subnets);
        self
    }

    fn owned_by_telegram(&self, addr: Option<IpAddr>) -> bool {
        let (Some(table), Some(IpAddr::V4(ip))) = (&self.subnets, addr) else {
            return false;
        };
        let row = table.lookup(ip);
        row != 0 && table.net_id(row) & 0x00ff_ffff == TG_ORGCODE
    }

    /// Flag both directions as not Telegram, deleting any extracted file.
    fn unset(&mut self, idx: usize, opp: Option<usize>) {
        for i in std::iter::once(idx).chain(opp) {
            let state = &mut self.flows[i];
            state.status = 0;
            self.packets = self.packets.saturating_sub(u64::from(state.num_pkts));
            state.num_pkts = 0;
            state.writer = None;
            state.auth_key_id = 0;
            state.obf_state = ObfState::Nope;
        }
    }

    /// Walk the deobfuscated segment for message headers. Returns false
    /// when the auth key changed mid-flow (not a Telegram flow).
    fn walk_messages(state: &mut TgFlow, clear: &[u8], seq: u32) -> bool {
        let len = clear.len();
        let mut pos = state.next_msg_seq.wrapping_sub(seq) as usize;
        while pos < len && pos + MSG_HDR_SIZE <= len {
            let mut first = clear[pos];
            if !state.client_flow {
                // Server to client: skip the reportAck chain.
                while pos < len && clear[pos] & 0x80 != 0 {
                    pos += 4;
                }
                if pos >= len {
                    break;
                }
                first = clear[pos];
            } else {
                first &= 0x7f;
            }
            let size;
            if first != 0x7f {
                size = usize::from(first) * 4;
                pos += 1;
            } else {
                if pos + 4 > len {
                    break;
                }
                size = (usize::from(clear[pos + 1])
                    | usize::from(clear[pos + 2]) << 8
                    | usize::from(clear[pos + 3]) << 16)
                    * 4;
                pos += 4;
            }
            if pos + MSG_HDR_SIZE - 1 >= len {
                break;
            }
            state.next_msg_seq = seq.wrapping_add((pos + size) as u32);

            let mut id = [0u8; 8];
            id.copy_from_slice(&clear[pos..pos + 8]);
            let auth_key_id = u64::from_be_bytes(id);
            if seq != state.seq_init && auth_key_id != state.auth_key_id {
                debug!(
                    "auth_key_id change {:#x} -> {auth_key_id:#x}",
                    state.auth_key_id
                );
                return false;
            }
            state.auth_key_id = auth_key_id;
            pos += size;
        }
        true
    }
}

impl Decoder for TelegramDecoder {
    fn name(&self) -> &'static str {
        "telegram"
    }

    fn header(&self) -> Vec<Column> {
        vec![
            Column::new("tgStat", "telegram status", ColumnType::Hex16),
            Column::new("tgAuthKeyId", "telegram auth key id", ColumnType::Hex64),
        ]
    }

    fn on_new_flow(&mut self, _packet: &Packet, flow: &Flow, _flows: &FlowTable) {
        let adtct = self.owned_by_telegram(flow.src) || self.owned_by_telegram(flow.dst);
        let state = &mut self.flows[flow.index.0];
        *state = TgFlow::default();
        state.l7_len_min = u16::MAX;

        let ports = [flow.src_port, flow.dst_port];
        if flow.l4_proto == L4_TCP && ports.iter().any(|p| [443, 80, 25].contains(p)) {
            state.status |= TG_INIT;
            if adtct {
                state.status |= TG_ADTCT;
            }
        } else if flow.l4_proto == L4_UDP && flow.src_port > 525 && flow.dst_port > 525 {
            state.status |= TG_INIT;
        }
    }

    fn on_layer4(&mut self, packet: &Packet, flow: &Flow, _flows: &FlowTable) {
        let idx = flow.index.0;
        if self.flows[idx].status == 0 {
            return;
        }
        if !packet.first_fragment {
            return;
        }
        let l7_len = packet.l7_len;
        let payload = packet.l7();
        let seq = packet.tcp_seq();
        let opp = flow.opposite.map(|o| o.0);
        let mut save_buf: Option<Vec<u8>> = None;

        // Deobfuscation state machine.
        loop {
            match self.flows[idx].obf_state {
                ObfState::Undef => {
                    let state = &mut self.flows[idx];
                    match packet.tcp {
                        Some(tcp) if packet.l4_proto == L4_TCP && tcp.flags & TH_SYN != 0 => {
                            state.obf_state = ObfState::Syn;
                            state.seq_init = tcp.seq.wrapping_add(1);
                            state.client_flow = tcp.flags & TH_ACK == 0;
                        }
                        _ => state.obf_state = ObfState::Nope,
                    }
                    break;
                }
                ObfState::Syn => {
                    let client = self.flows[idx].client_flow;
                    if l7_len as usize >= OBFUSC_HDR_LEN && client {
                        if payload.len() >= OBFUSC_HDR_LEN {
                            let mut key = [0u8; KEY_LEN];
                            key.copy_from_slice(&payload[8..8 + KEY_LEN]);
                            let mut iv = [0u8; BLOCK];
                            iv.copy_from_slice(&payload[8 + KEY_LEN..OBFUSC_HDR_LEN]);
                            {
                                let state = &mut self.flows[idx];
                                state.key = key;
                                state.iv = iv;
                                state.next_msg_seq = state.seq_init.wrapping_add(OBFUSC_HDR_LEN as u32);
                                state.obf_state = ObfState::Key;
                            }
                            if let Some(o) = opp {
                                let (okey, oiv) = reverse_halves(&key, &iv);
                                let other = &mut self.flows[o];
                                other.key = okey;
                                other.iv = oiv;
                            }
                            debug!("flow {}: deobfuscation enabled", flow.findex);
                            continue; // fall through to Key
                        } else {
                            // Snapped in the middle of the prologue.
                            self.flows[idx].obf_state = ObfState::Nope;
                            break;
                        }
                    } else if l7_len != 0 && !client {
                        let Some(o) = opp else {
                            self.flows[idx].obf_state = ObfState::Nope;
                            break;
                        };
                        match self.flows[o].obf_state {
                            ObfState::Key => {
                                let state = &mut self.flows[idx];
                                state.next_msg_seq = state.seq_init;
                                state.obf_state = ObfState::Key;
                                continue;
                            }
                            // The client flow is still waiting for the key.
                            ObfState::Syn => break,
                            _ => {
                                self.flows[idx].obf_state = ObfState::Nope;
                                break;
                            }
                        }
                    } else if l7_len != 0 {
                        // Key and IV split across segments; unsupported.
                        self.flows[idx].obf_state = ObfState::Nope;
                        break;
                    }
                    break;
                }
                ObfState::Key => {
                    if !payload.is_empty() {
                        let state = &mut self.flows[idx];
                        let pos = seq.wrapping_sub(state.seq_init);
                        let clear = decrypt(&state.key, &state.iv, pos, payload);
                        if pos == 0 && state.client_flow && clear.len() >= 60 {
                            let mut fam = [0u8; 4];
                            fam.copy_from_slice(&clear[56..60]);
                            if u32::from_le_bytes(fam) != TG_FAMILY_EF {
                                debug!("flow {}: unsupported obfuscation family", flow.findex);
                                self.flows[idx].obf_state = ObfState::Nope;
                                if let Some(o) = opp {
                                    self.flows[o].obf_state = ObfState::Nope;
                                }
                                break;
                            }
                        }
                        let ok = Self::walk_messages(&mut self.flows[idx], &clear, seq);
                        if !ok {
                            self.unset(idx, opp);
                            return;
                        }
                        save_buf = Some(clear);
                    }
                    break;
                }
                ObfState::Nope => break,
            }
        }

        self.packets += 1;
        let state = &mut self.flows[idx];
        state.num_pkts += 1;

        if l7_len == 0 {
            return;
        }
        state.num_bytes += i64::from(l7_len);
        if state.l7_len_min > l7_len {
            state.l7_len_min = l7_len;
        }

        if packet.l4_proto == L4_UDP {
            if packet.tos == TG_INTCTRL {
                state.status |= TG_TOSD;
            }
            if l7_len % 8 != 0 {
                state.mod_cnt -= 1;
                self.unset(idx, opp);
                return;
            }
            state.mod_cnt += 1;
            state.status |= TG_DETECT;
        } else {
            let rem = l7_len % 16;
            if l7_len > TG_MTU_LIMIT {
                state.status |= TG_PLIGN1;
            } else {
                if state.status & TG_VOICE != 0 {
                    state.status &= !(TG_PLIGN1 | TG_PLIGN2);
                }
                if state.status & TG_PLIGN1 != 0 {
                    state.status |= TG_PLIGN2;
                }
            }
            if rem == 9 {
                state.mod_cnt += 1;
                state.status |= TG_DETECT;
            } else if state.status & TG_PLIGN1 == 0 && l7_len != 4 {
                state.mod_cnt -= 1;
                if state.num_pkts > 3 && state.mod_cnt < MOD_LIMIT {
                    if state.status & TG_PLNFLG != 0 && state.status & TG_ADTCT == 0 {
                        self.unset(idx, opp);
                        return;
                    }
                    state.status |= TG_PLNFLG;
                }
            }
        }

        if self.config.enable_save {
            let state = &mut self.flows[idx];
            if state.writer.is_none() {
                let name = format!(
                    "{}tg_{}_{}{}.dat",
                    self.config.file_prefix,
                    flow.findex,
                    flow.dir_char(),
                    self.config.file_suffix
                );
                let path = self.config.output_dir.join(name);
                match SeqWriter::create(&path, seq) {
                    Ok(w) => {
                        state.writer = Some(w);
                        state.status |= TG_FLS;
                    }
                    Err(e) => {
                        warn!("failed to open {}: {e}", path.display());
                        state.status |= TG_PWFERR;
                        return;
                    }
                }
            }
            let data = save_buf.as_deref().unwrap_or(payload);
            let write_seq = if packet.l4_proto == L4_TCP {
                seq
            } else {
                // UDP has no sequencing; append.
                let w = state.writer.as_ref().map(|w| w.seq_init()).unwrap_or(0);
                w.wrapping_add(state.written as u32)
            };
            if let Some(w) = &mut state.writer {
                if w.write_seq(write_seq, data).is_err() {
                    state.status |= TG_PWFERR;
                } else {
                    state.written += data.len() as u64;
                }
            }
        }
    }

    fn on_flow_terminate(
        &mut self,
        flow: &Flow,
        flows: &FlowTable,
        record: &mut RecordBuilder,
    ) -> Result<()> {
        let opp = flows.opposite(flow.index).map(|f| f.index.0);
        let opp_bytes = opp.map(|o| self.flows[o].num_bytes);
        let opp_detect = opp
            .map(|o| self.flows[o].status & TG_DETECT != 0)
            .unwrap_or(false);

        let state = &mut self.flows[flow.index.0];
        state.writer = None;

        // Final scoring: flows that never passed either detector are
        // reported clean.
        let gate = TG_DETECT | TG_ADTCT;
        let any_bytes = state.num_bytes != 0 || opp_bytes.map(|b| b != 0).unwrap_or(false);
        if !any_bytes && state.status & gate == 0 {
            state.status = 0;
        }
        if state.status & TG_INIT != 0 && state.num_pkts > 2 && state.l7_len_min >= 32 {
            let basym = opp_bytes
                .map(|ob| {
                    let total = state.num_bytes + ob;
                    if total == 0 {
                        0.0
                    } else {
                        ((state.num_bytes - ob) as f32 / total as f32).abs()
                    }
                })
                .unwrap_or(0.0);
            if flow.l4_proto == L4_UDP {
                if basym < 0.2 && state.l7_len_min % 8 == 0 && state.num_bytes % 8 == 0 {
                    if state.status & TG_DETECT != 0 {
                        if state.l7_len_min == 88 {
                            state.status |= TG_VOICE;
                        } else if state.l7_len_min < 88 {
                            state.status |= TG_CNTRL;
                        } else if state.status & TG_ADTCT == 0 {
                            state.status = 0;
                        }
                    } else if opp_detect {
                        state.status |= TG_DETECT | TG_CNTRL;
                    } else if state.status & gate == 0 {
                        state.status = 0;
                    }
                } else if state.status & gate == 0 {
                    state.status = 0;
                }
            } else if flow.l4_proto == L4_TCP
                && state.l7_len_min > 350
                && state.status & gate == 0
            {
                state.status = 0;
            }
        } else if state.status & gate == 0 {
            state.status = 0;
        }

        self.agg_status |= state.status;
        record.append_u16(state.status)?;
        record.append_u64(state.auth_key_id)?;
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

    fn keystream(key: &[u8; KEY_LEN], iv: &[u8; BLOCK], pos: u32, len: usize) -> Vec<u8> {
        decrypt(key, iv, pos, &vec![0u8; len])
    }

    struct Session {
        dec: TelegramDecoder,
        flows: FlowTable,
        a: Flow,
        b: Flow,
    }

    impl Session {
        fn new() -> Session {
            let mut dec = TelegramDecoder::new(2, DecoderConfig::default());
            let mut flows = FlowTable::with_capacity(2);
            let mut a = Flow::new(1, FlowIndex(0), Direction::A);
            a.l4_proto = L4_TCP;
            a.src_port = 50000;
            a.dst_port = 443;
            a.opposite = Some(FlowIndex(1));
            let mut b = Flow::new(2, FlowIndex(1), Direction::B);
            b.l4_proto = L4_TCP;
            b.src_port = 443;
            b.dst_port = 50000;
            b.opposite = Some(FlowIndex(0));
            let raw = [0u8; 60];
            let pkt = Packet::layer4(
                &raw,
                L4_TCP,
                "10.0.0.1".parse().unwrap(),
                "149.154.167.51".parse().unwrap(),
                50000,
                443,
                54,
            );
            dec.on_new_flow(&pkt, &a, &flows);
            dec.on_new_flow(&pkt, &b, &flows);
            flows.insert(a.clone());
            flows.insert(b.clone());
            Session { dec, flows, a, b }
        }

        fn packet(&mut self, dir: Direction, seq: u32, flags: u8, payload: &[u8]) {
            let mut raw = vec![0u8; 54];
            raw.extend_from_slice(payload);
            let pkt = Packet::layer4(
                &raw,
                L4_TCP,
                "10.0.0.1".parse().unwrap(),
                "149.154.167.51".parse().unwrap(),
                50000,
                443,
                54,
            )
            .with_tcp(seq, flags);
            let flow = match dir {
                Direction::A => &self.a,
                Direction::B => &self.b,
            };
            self.dec.on_layer4(&pkt, flow, &self.flows);
        }
    }

    #[test]
    fn ctr_roundtrip_at_offset() {
        let key = [0x11; KEY_LEN];
        let iv = [0x22; BLOCK];
        let plain = b"mtproto transport bytes spanning blocks".to_vec();
        let cipher = decrypt(&key, &iv, 100, &plain);
        let back = decrypt(&key, &iv, 100, &cipher);
        assert_eq!(back, plain);
        // Positions inside a block line up with the stream offset.
        let tail = decrypt(&key, &iv, 110, &cipher[10..]);
        assert_eq!(&tail, &plain[10..]);
    }

    #[test]
    fn prologue_and_message_walk() {
        let mut s = Session::new();
        // Client SYN.
        s.packet(Direction::A, 999, TH_SYN, &[]);
        assert_eq!(s.dec.flows[0].obf_state, ObfState::Syn);
        assert!(s.dec.flows[0].client_flow);

        // 64-byte prologue: bytes [8..40) key, [40..56) IV; the family
        // selector at cleartext [56..60) must decrypt to EF EF EF EF.
        let key = [0x5a; KEY_LEN];
        let iv = [0xc3; BLOCK];
        let mut prologue = vec![0u8; OBFUSC_HDR_LEN];
        prologue[8..40].copy_from_slice(&key);
        prologue[40..56].copy_from_slice(&iv);
        let ks = keystream(&key, &iv, 0, OBFUSC_HDR_LEN);
        for i in 56..60 {
            prologue[i] = ks[i] ^ 0xef;
        }
        s.packet(Direction::A, 1000, TH_ACK, &prologue);
        assert_eq!(s.dec.flows[0].obf_state, ObfState::Key);
        assert_eq!(s.dec.flows[0].next_msg_seq, 1064);

        // One message: length byte 10 (40 bytes), auth_key_id, msg_key
        // and a 16-byte body.
        let mut msg = vec![10u8];
        msg.extend_from_slice(&0x0102030405060708u64.to_be_bytes());
        msg.extend_from_slice(&[0u8; 16]);
        msg.extend_from_slice(&[0u8; 16]);
        let mut cipher = msg.clone();
        let ks = keystream(&key, &iv, 64, cipher.len());
        for (b, k) in cipher.iter_mut().zip(&ks) {
            *b ^= k;
        }
        s.packet(Direction::A, 1064, TH_ACK, &cipher);

        let state = &s.dec.flows[0];
        assert_eq!(state.obf_state, ObfState::Key);
        assert_eq!(state.auth_key_id, 0x0102030405060708);
        assert_eq!(state.next_msg_seq, 1064 + 1 + 40);
        assert!(state.status & TG_DETECT != 0); // 41 % 16 == 9
    }

    #[test]
    fn wrong_family_disables_deobfuscation() {
        let mut s = Session::new();
        s.packet(Direction::A, 999, TH_SYN, &[]);
        let key = [0x5a; KEY_LEN];
        let iv = [0xc3; BLOCK];
        let mut prologue = vec![0u8; OBFUSC_HDR_LEN];
        prologue[8..40].copy_from_slice(&key);
        prologue[40..56].copy_from_slice(&iv);
        // Family bytes decrypt to DD DD DD DD.
        let ks = keystream(&key, &iv, 0, OBFUSC_HDR_LEN);
        for i in 56..60 {
            prologue[i] = ks[i] ^ 0xdd;
        }
        s.packet(Direction::A, 1000, TH_ACK, &prologue);
        assert_eq!(s.dec.flows[0].obf_state, ObfState::Nope);
        assert_eq!(s.dec.flows[1].obf_state, ObfState::Nope);
    }

    #[test]
    fn server_direction_derives_reversed_keys() {
        let key = [0x01; KEY_LEN];
        let mut iv = [0u8; BLOCK];
        for (i, b) in iv.iter_mut().enumerate() {
            *b = i as u8;
        }
        let (okey, oiv) = reverse_halves(&key, &iv);
        // First half of the opposite key is the reversed IV.
        assert_eq!(okey[0], 15);
        assert_eq!(okey[15], 0);
        assert_eq!(okey[16..32], [0x01; 16]);
        assert_eq!(oiv, [0x01; BLOCK]);
    }

    #[test]
    fn auth_key_change_unsets_flow() {
        let mut s = Session::new();
        s.packet(Direction::A, 999, TH_SYN, &[]);
        let key = [0x5a; KEY_LEN];
        let iv = [0xc3; BLOCK];
        let mut prologue = vec![0u8; OBFUSC_HDR_LEN];
        prologue[8..40].copy_from_slice(&key);
        prologue[40..56].copy_from_slice(&iv);
        let ks = keystream(&key, &iv, 0, OBFUSC_HDR_LEN);
        for i in 56..60 {
            prologue[i] = ks[i] ^ 0xef;
        }
        s.packet(Direction::A, 1000, TH_ACK, &prologue);

        // Length byte 7: one 28-byte message per segment, so the next
        // header is expected exactly at the next segment's sequence.
        let make_msg = |id: u64| {
            let mut msg = vec![7u8];
            msg.extend_from_slice(&id.to_be_bytes());
            msg.extend_from_slice(&[0u8; 16]);
            msg.extend_from_slice(&[0u8; 4]);
            msg
        };
        let mut first = make_msg(0x1111);
        let ks = keystream(&key, &iv, 64, first.len());
        for (b, k) in first.iter_mut().zip(&ks) {
            *b ^= k;
        }
        s.packet(Direction::A, 1064, TH_ACK, &first);
        assert_eq!(s.dec.flows[0].auth_key_id, 0x1111);

        let mut second = make_msg(0x2222);
        let ks = keystream(&key, &iv, 93, second.len());
        for (b, k) in second.iter_mut().zip(&ks) {
            *b ^= k;
        }
        s.packet(Direction::A, 1093, TH_ACK, &second);
        assert_eq!(s.dec.flows[0].status, 0);
        assert_eq!(s.dec.flows[0].obf_state, ObfState::Nope);
    }
}
