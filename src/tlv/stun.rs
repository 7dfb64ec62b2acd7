//! STUN / TURN and NAT-PMP decoder.

use crate::cursor::ByteCursor;
use crate::error::Result;
use crate::flow::{Flow, FlowTable};
use crate::packet::{Packet, L4_TCP, L4_UDP};
use crate::runtime::{Decoder, DecoderReport};
use crate::schema::{Column, ColumnType, RecordBuilder};
use crate::tlv::{dedup_push, Tlv, TlvHeader, TlvScanner};
use std::net::Ipv4Addr;

pub const NAT_STAT_STUN: u32 = 0x0001; // Flow contains STUN messages
pub const NAT_STAT_TURN: u32 = 0x0002; // TURN method or attribute seen
pub const NAT_STAT_ICE: u32 = 0x0004; // ICE attribute seen
pub const NAT_STAT_PMP: u32 = 0x0008; // Flow contains NAT-PMP messages
pub const NAT_STAT_OVER_NSP: u32 = 0x0010; // STUN over a non-standard port
pub const NAT_STAT_DF: u32 = 0x0020; // Don't-fragment attribute
pub const NAT_STAT_NONCE: u32 = 0x0040; // Nonce attribute
pub const NAT_STAT_DEPRECATED: u32 = 0x0080; // Deprecated attribute used
pub const NAT_STAT_OVFL: u32 = 0x0100; // Bounded list overflowed
pub const NAT_STAT_MALFORMED: u32 = 0x1000; // Attribute length inconsistent
pub const NAT_STAT_SNAPLEN: u32 = 0x8000; // Snapped payload

const STUN_MAGIC_COOKIE: u32 = 0x2112_a442;
const STUN_PORT: u16 = 3478;
const STUNS_PORT: u16 = 5349;
const NATPMP_PORT_CLI: u16 = 5350;
const NATPMP_PORT_SRV: u16 = 5351;

// Attributes
const AT_MAPPED_ADDR: u16 = 0x0001;
const AT_DEST_ADDR: u16 = 0x0011;
const AT_USERNAME: u16 = 0x0006;
const AT_PASSWORD: u16 = 0x0007;
const AT_ERR_CODE: u16 = 0x0009;
const AT_CHANNEL_NUMBER: u16 = 0x000c;
const AT_LIFETIME: u16 = 0x000d;
const AT_XOR_PEER_ADDR: u16 = 0x0012;
const AT_REALM: u16 = 0x0014;
const AT_NONCE: u16 = 0x0015;
const AT_XOR_RELAYED_ADDR: u16 = 0x0016;
const AT_DONT_FRAGMENT: u16 = 0x001a;
const AT_XOR_MAPPED_ADDR: u16 = 0x0020;
const AT_PRIORITY: u16 = 0x0024;
const AT_SOFTWARE: u16 = 0x8022;
const AT_ALT_SERVER: u16 = 0x8023;
const AT_RESPONSE_ORIGIN: u16 = 0x802b;
const AT_OTHER_ADDRESS: u16 = 0x802c;

const STUN_STR_MAX: usize = 64;
const STUN_NSTR: usize = 4; // bounded string-list cap

/// TURN method range (Allocate .. ConnectionAttempt).
const TURN_METHOD_LO: u16 = 0x003;
const TURN_METHOD_HI: u16 = 0x00c;

#[derive(Clone, Copy, Default, PartialEq, Debug)]
struct AddrPort {
    /// Raw IPv4 octets, as on the wire.
    addr: [u8; 4],
    port: u16,
}

#[derive(Clone, Default)]
struct NatFlow {
    status: u32,
    err_bf: u32,
    /// Message counts per class: request, indication, success, error.
    classes: [u16; 4],
    mapped: Option<AddrPort>,
    xor_mapped: Option<AddrPort>,
    peer: Option<AddrPort>,
    origin: Option<AddrPort>,
    relayed: Option<AddrPort>,
    dest: Option<AddrPort>,
    other: Option<AddrPort>,
    lifetime: u32,
    users: Vec<String>,
    passwords: Vec<String>,
    realms: Vec<String>,
    software: Vec<String>,
    // NAT-PMP: external-address / map-UDP / map-TCP requests + responses.
    pmp_req: [u16; 3],
    pmp_resp: [u16; 3],
    pmp_epoch: u32,
}

pub struct StunDecoder {
    flows: Vec<NatFlow>,
    stun_packets: u64,
    pmp_packets: u64,
    agg_status: u32,
    agg_err: u32,
}

fn class_of(ty: u16) -> usize {
    (((ty >> 4) & 0x1) | ((ty >> 7) & 0x2)) as usize
}

fn method_of(ty: u16) -> u16 {
    (ty & 0x000f) | ((ty >> 1) & 0x0070) | ((ty >> 2) & 0x0f80)
}

impl StunDecoder {
    pub fn new(flow_capacity: usize) -> StunDecoder {
        StunDecoder {
            flows: vec![NatFlow::default(); flow_capacity],
            stun_packets: 0,
            pmp_packets: 0,
            agg_status: 0,
            agg_err: 0,
        }
    }

    fn read_addr(value: &[u8], xor: bool) -> Option<AddrPort> {
        let mut cur = ByteCursor::new(value);
        cur.read_u8().ok()?; // reserved
        let family = cur.read_u8().ok()?;
        let mut port = cur.read_u16().ok()?;
        if family != 1 {
            return None; // IPv6 mappings are not kept
        }
        let mut oct = [0u8; 4];
        cur.read_n(&mut oct).ok()?;
        if xor {
            port ^= (STUN_MAGIC_COOKIE >> 16) as u16;
            let addr = u32::from_be_bytes(oct) ^ STUN_MAGIC_COOKIE;
            oct = addr.to_be_bytes();
        }
        Some(AddrPort { addr: oct, port })
    }

    fn push_str(list: &mut Vec<String>, status: &mut u32, raw: &[u8]) {
        let mut s = String::from_utf8_lossy(raw).into_owned();
        if s.len() > STUN_STR_MAX {
            let mut cut = STUN_STR_MAX;
            while !s.is_char_boundary(cut) {
                cut -= 1;
            }
            s.truncate(cut);
        }
        if !dedup_push(list, STUN_NSTR, s) {
            *status |= NAT_STAT_OVFL;
        }
    }

    fn handle(state: &mut NatFlow, tlv: Tlv) {
        match tlv.ty {
            AT_MAPPED_ADDR => state.mapped = Self::read_addr(tlv.value, false),
            AT_RESPONSE_ORIGIN => state.origin = Self::read_addr(tlv.value, false),
            AT_OTHER_ADDRESS | AT_ALT_SERVER => {
                state.other = Self::read_addr(tlv.value, false);
            }
            AT_DEST_ADDR => {
                state.dest = Self::read_addr(tlv.value, false);
                state.status |= NAT_STAT_TURN;
            }
            AT_XOR_MAPPED_ADDR => state.xor_mapped = Self::read_addr(tlv.value, true),
            AT_XOR_PEER_ADDR => {
                state.peer = Self::read_addr(tlv.value, true);
                state.status |= NAT_STAT_TURN;
            }
            AT_XOR_RELAYED_ADDR => {
                state.relayed = Self::read_addr(tlv.value, true);
                state.status |= NAT_STAT_TURN;
            }
            AT_ERR_CODE => {
                let mut cur = ByteCursor::new(tlv.value);
                if let Ok(word) = cur.read_u32() {
                    let class = (word >> 8) & 0x7;
                    state.err_bf |= 1 << class;
                }
            }
            AT_USERNAME => {
                // "user:password" credentials are split on the colon.
                if let Some(colon) = tlv.value.iter().position(|&b| b == b':') {
                    let (user, pass) = tlv.value.split_at(colon);
                    Self::push_str(&mut state.users, &mut state.status, user);
                    Self::push_str(&mut state.passwords, &mut state.status, &pass[1..]);
                } else {
                    Self::push_str(&mut state.users, &mut state.status, tlv.value);
                }
            }
            AT_PASSWORD => {
                state.status |= NAT_STAT_DEPRECATED;
                Self::push_str(&mut state.passwords, &mut state.status, tlv.value);
            }
            AT_REALM => Self::push_str(&mut state.realms, &mut state.status, tlv.value),
            AT_SOFTWARE => Self::push_str(&mut state.software, &mut state.status, tlv.value),
            AT_DONT_FRAGMENT => state.status |= NAT_STAT_TURN | NAT_STAT_DF,
            AT_NONCE => state.status |= NAT_STAT_NONCE,
            AT_LIFETIME => {
                state.status |= NAT_STAT_TURN;
                let mut cur = ByteCursor::new(tlv.value);
                state.lifetime = cur.read_u32().unwrap_or(0);
            }
            AT_CHANNEL_NUMBER => state.status |= NAT_STAT_TURN,
            AT_PRIORITY => state.status |= NAT_STAT_ICE,
            _ => {}
        }
    }

    fn natpmp(state: &mut NatFlow, payload: &[u8]) {
        state.status |= NAT_STAT_PMP;
        let mut cur = ByteCursor::new(payload);
        let header = (|| {
            cur.read_u8()?; // version
            cur.read_u8()
        })();
        let op = match header {
            Ok(op) => op,
            Err(_) => return,
        };
        match op {
            0..=2 => state.pmp_req[op as usize] += 1,
            128..=130 => {
                let slot = (op - 128) as usize;
                state.pmp_resp[slot] += 1;
                let resp = (|| {
                    let result = cur.read_u16()?;
                    let epoch = cur.read_u32()?;
                    Ok::<_, crate::error::ParseError>((result, epoch))
                })();
                if let Ok((result, epoch)) = resp {
                    state.pmp_epoch = epoch;
                    if result != 0 {
                        state.err_bf |= 1 << (result & 0x1f);
                    } else if slot == 0 {
                        let mut oct = [0u8; 4];
                        if cur.read_n(&mut oct).is_ok() {
                            state.mapped = Some(AddrPort { addr: oct, port: 0 });
                        }
                    }
                }
            }
            _ => state.status |= NAT_STAT_MALFORMED,
        }
    }

    fn stun(state: &mut NatFlow, flow: &Flow, payload: &[u8]) -> bool {
        let mut cur = ByteCursor::new(payload);
        let header = (|| {
            let ty = cur.read_u16()?;
            let len = cur.read_u16()?;
            let cookie = cur.read_u32()?;
            cur.skip(12)?; // transaction id
            Ok::<_, crate::error::ParseError>((ty, len, cookie))
        })();
        let (ty, len, cookie) = match header {
            Ok(h) => h,
            Err(_) => return false,
        };
        // No magic cookie, no STUN. The top two type bits must be zero and
        // the length a multiple of 4.
        if cookie != STUN_MAGIC_COOKIE || ty & 0xc000 != 0 || len % 4 != 0 {
            return false;
        }

        state.status |= NAT_STAT_STUN;
        let ports = [flow.src_port, flow.dst_port];
        if !ports.contains(&STUN_PORT) && !ports.contains(&STUNS_PORT) {
            state.status |= NAT_STAT_OVER_NSP;
        }

        state.classes[class_of(ty)] += 1;
        let method = method_of(ty);
        if (TURN_METHOD_LO..=TURN_METHOD_HI).contains(&method) {
            state.status |= NAT_STAT_TURN;
        }

        let attr_len = usize::from(len).min(cur.remaining());
        if attr_len < usize::from(len) {
            state.status |= NAT_STAT_SNAPLEN;
        }
        let attrs = match cur.read_slice(attr_len) {
            Ok(a) => a,
            Err(_) => return true,
        };
        let mut acur = ByteCursor::new(attrs);
        for tlv in TlvScanner::new(&mut acur, TlvHeader::WidePadded) {
            match tlv {
                Ok(tlv) => Self::handle(state, tlv),
                Err(_) => {
                    state.status |= NAT_STAT_SNAPLEN;
                    break;
                }
            }
        }
        true
    }
}

impl Decoder for StunDecoder {
    fn name(&self) -> &'static str {
        "stunDecode"
    }

    fn header(&self) -> Vec<Column> {
        let pair = &[ColumnType::Ip4, ColumnType::U16];
        vec![
            Column::new("natStat", "NAT status", ColumnType::Hex32),
            Column::new("natErr", "NAT error code", ColumnType::Hex32),
            Column::group(
                "natMCReq_Ind_Succ_Err",
                "NAT message class (REQ, INDIC, SUCC RESP, ERR RESP) (STUN)",
                &[
                    ColumnType::U16,
                    ColumnType::U16,
                    ColumnType::U16,
                    ColumnType::U16,
                ],
            ),
            Column::group("natAddr_Port", "NAT mapped address and port (STUN)", pair),
            Column::group("natXAddr_Port", "NAT xor mapped address and port (STUN)", pair),
            Column::group("natPeerAddr_Port", "NAT xor peer address and port (TURN)", pair),
            Column::group(
                "natOrigAddr_Port",
                "NAT response origin address and port (STUN)",
                pair,
            ),
            Column::group("natRelayAddr_Port", "NAT relayed address and port (TURN)", pair),
            Column::group("natDstAddr_Port", "NAT destination address and port (TURN)", pair),
            Column::group("natOtherAddr_Port", "NAT other address and port (STUN)", pair),
            Column::new("natLifetime", "NAT binding lifetime [seconds] (STUN)", ColumnType::U32),
            Column::repeated("natUser", "NAT username (STUN)", ColumnType::Str),
            Column::repeated("natPass", "NAT password (STUN)", ColumnType::Str),
            Column::repeated("natRealm", "NAT realm (STUN)", ColumnType::Str),
            Column::repeated("natSoftware", "NAT software (STUN)", ColumnType::Str),
            Column::group(
                "natPMPReqEA_MU_MT",
                "NAT-PMP number of requests (External Address, Map UDP, Map TCP)",
                &[ColumnType::U16, ColumnType::U16, ColumnType::U16],
            ),
            Column::group(
                "natPMPRespEA_MU_MT",
                "NAT-PMP number of responses (External Address, Map UDP, Map TCP)",
                &[ColumnType::U16, ColumnType::U16, ColumnType::U16],
            ),
            Column::new("natPMPSSSOE", "NAT-PMP seconds since start of epoch", ColumnType::U32),
        ]
    }

    fn on_new_flow(&mut self, _packet: &Packet, flow: &Flow, _flows: &FlowTable) {
        self.flows[flow.index.0] = NatFlow::default();
    }

    fn on_layer4(&mut self, packet: &Packet, flow: &Flow, _flows: &FlowTable) {
        if packet.l4_proto != L4_UDP && packet.l4_proto != L4_TCP {
            return;
        }
        let state = &mut self.flows[flow.index.0];
        let payload = packet.l7();

        if packet.l4_proto == L4_UDP
            && [packet.src_port, packet.dst_port]
                .iter()
                .any(|p| *p == NATPMP_PORT_CLI || *p == NATPMP_PORT_SRV)
        {
            self.pmp_packets += 1;
            Self::natpmp(state, payload);
            return;
        }

        if Self::stun(state, flow, payload) {
            self.stun_packets += 1;
        }
    }

    fn on_flow_terminate(
        &mut self,
        flow: &Flow,
        _flows: &FlowTable,
        record: &mut RecordBuilder,
    ) -> Result<()> {
        let state = &self.flows[flow.index.0];
        self.agg_status |= state.status;
        self.agg_err |= state.err_bf;

        record.append_u32(state.status)?;
        record.append_u32(state.err_bf)?;
        record.begin_repeat(1)?;
        for count in state.classes {
            record.append_u16(count)?;
        }
        for slot in [
            &state.mapped,
            &state.xor_mapped,
            &state.peer,
            &state.origin,
            &state.relayed,
            &state.dest,
            &state.other,
        ] {
            match slot {
                Some(ap) => {
                    record.begin_repeat(1)?;
                    record.append_ip4(Ipv4Addr::from(ap.addr))?;
                    record.append_u16(ap.port)?;
                }
                None => record.begin_repeat(0)?,
            }
        }
        record.append_u32(state.lifetime)?;
        for list in [
            &state.users,
            &state.passwords,
            &state.realms,
            &state.software,
        ] {
            record.begin_repeat(list.len() as u32)?;
            for s in list {
                record.append_str(s)?;
            }
        }
        record.begin_repeat(1)?;
        for count in state.pmp_req {
            record.append_u16(count)?;
        }
        record.begin_repeat(1)?;
        for count in state.pmp_resp {
            record.append_u16(count)?;
        }
        record.append_u32(state.pmp_epoch)?;
        Ok(())
    }

    fn report(&self) -> DecoderReport {
        DecoderReport {
            status: u64::from(self.agg_status),
            packets: self.stun_packets + self.pmp_packets,
            units: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{Direction, FlowIndex};

    fn stun_packet(ty: u16, attrs: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&ty.to_be_bytes());
        out.extend_from_slice(&(attrs.len() as u16).to_be_bytes());
        out.extend_from_slice(&STUN_MAGIC_COOKIE.to_be_bytes());
        out.extend_from_slice(&[0x42; 12]); // transaction id
        out.extend_from_slice(attrs);
        out
    }

    fn attr(ty: u16, value: &[u8]) -> Vec<u8> {
        let mut out = ty.to_be_bytes().to_vec();
        out.extend_from_slice(&(value.len() as u16).to_be_bytes());
        out.extend_from_slice(value);
        out.resize(out.len() + (4 - value.len() % 4) % 4, 0);
        out
    }

    fn run(payload: &[u8], src_port: u16, dst_port: u16) -> NatFlow {
        let mut raw = vec![0u8; 42];
        raw.extend_from_slice(payload);
        let pkt = Packet::layer4(
            &raw,
            L4_UDP,
            "10.0.0.1".parse().unwrap(),
            "10.0.0.2".parse().unwrap(),
            src_port,
            dst_port,
            42,
        );
        let mut dec = StunDecoder::new(1);
        let flows = FlowTable::with_capacity(1);
        let mut flow = Flow::new(1, FlowIndex(0), Direction::A);
        flow.src_port = src_port;
        flow.dst_port = dst_port;
        dec.on_new_flow(&pkt, &flow, &flows);
        dec.on_layer4(&pkt, &flow, &flows);
        dec.flows[0].clone()
    }

    #[test]
    fn binding_response_with_xor_mapped_address() {
        // Success response to the Binding method.
        let mut value = vec![0, 1]; // reserved, family IPv4
        let port = 54321u16 ^ (STUN_MAGIC_COOKIE >> 16) as u16;
        value.extend_from_slice(&port.to_be_bytes());
        let addr = u32::from(Ipv4Addr::new(203, 0, 113, 7)) ^ STUN_MAGIC_COOKIE;
        value.extend_from_slice(&addr.to_be_bytes());
        let attrs = attr(AT_XOR_MAPPED_ADDR, &value);
        let payload = stun_packet(0x0101, &attrs);

        let state = run(&payload, STUN_PORT, 54321);
        assert!(state.status & NAT_STAT_STUN != 0);
        assert_eq!(state.classes, [0, 0, 1, 0]);
        let xm = state.xor_mapped.unwrap();
        assert_eq!(Ipv4Addr::from(xm.addr), Ipv4Addr::new(203, 0, 113, 7));
        assert_eq!(xm.port, 54321);
    }

    #[test]
    fn username_splits_credentials() {
        let attrs = attr(AT_USERNAME, b"alice:s3cret");
        let payload = stun_packet(0x0001, &attrs);
        let state = run(&payload, 40000, STUN_PORT);
        assert_eq!(state.users, vec!["alice"]);
        assert_eq!(state.passwords, vec!["s3cret"]);
        assert_eq!(state.classes, [1, 0, 0, 0]);
    }

    #[test]
    fn non_stun_payload_is_ignored() {
        let state = run(b"GET / HTTP/1.1\r\n\r\n", 40000, 80);
        assert_eq!(state.status, 0);
    }

    #[test]
    fn natpmp_external_address_response() {
        let mut payload = vec![0, 128]; // version, extaddr response
        payload.extend_from_slice(&0u16.to_be_bytes()); // result ok
        payload.extend_from_slice(&1234u32.to_be_bytes()); // epoch
        payload.extend_from_slice(&[198, 51, 100, 9]);
        let state = run(&payload, NATPMP_PORT_SRV, 40000);
        assert!(state.status & NAT_STAT_PMP != 0);
        assert_eq!(state.pmp_resp, [1, 0, 0]);
        assert_eq!(state.pmp_epoch, 1234);
        assert_eq!(state.mapped.unwrap().addr, [198, 51, 100, 9]);
    }

    #[test]
    fn turn_allocate_sets_turn_bit() {
        let payload = stun_packet(0x0003, &[]); // Allocate request
        let state = run(&payload, 40000, STUN_PORT);
        assert!(state.status & NAT_STAT_TURN != 0);
    }
}
