//! MikroTik Neighbor Discovery Protocol decoder.

use crate::cursor::{ByteCursor, StrEncoding};
use crate::error::Result;
use crate::flow::{Flow, FlowTable};
use crate::packet::{Packet, L4_UDP};
use crate::runtime::{Decoder, DecoderReport};
use crate::schema::{Column, ColumnType, RecordBuilder};
use crate::tlv::{dedup_push, record_type, Tlv, TlvHeader, TlvScanner};
use std::net::{Ipv4Addr, Ipv6Addr};

pub const MNDP_STAT_MNDP: u8 = 0x01; // Flow is MNDP
pub const MNDP_STAT_IPV4: u8 = 0x02; // IPv4 address seen
pub const MNDP_STAT_IPV6: u8 = 0x04; // IPv6 address seen
pub const MNDP_STAT_UNK_TLV: u8 = 0x08; // Unknown TLV type
pub const MNDP_STAT_TLV_LEN: u8 = 0x10; // Invalid TLV length
pub const MNDP_STAT_LIST: u8 = 0x20; // List truncated
pub const MNDP_STAT_STR: u8 = 0x40; // String truncated
pub const MNDP_STAT_SNAP: u8 = 0x80; // Packet snapped

pub const MNDP_PORT: u16 = 5678;
const MNDP_MIN_SIZE: usize = 8; // header + seqno + one TLV header

const MNDP_TLV_MAC_ADDR: u16 = 1;
const MNDP_TLV_IDENTITY: u16 = 5;
const MNDP_TLV_VERSION: u16 = 7;
const MNDP_TLV_PLATFORM: u16 = 8;
const MNDP_TLV_UPTIME: u16 = 10;
const MNDP_TLV_SW_ID: u16 = 11;
const MNDP_TLV_BOARD: u16 = 12;
const MNDP_TLV_UNPACK: u16 = 14;
const MNDP_TLV_IPV6_ADDR: u16 = 15;
const MNDP_TLV_IFACE: u16 = 16;
const MNDP_TLV_IPV4_ADDR: u16 = 17;

const MNDP_LSTLEN: usize = 5; // list cap
const MNDP_STRLEN: usize = 32; // string cap

#[derive(Clone, Default)]
struct MndpFlow {
    status: u8,
    tlv_types: u32,
    macs: Vec<[u8; 6]>,
    identity: String,
    version: String,
    platform: String,
    software_id: String,
    board: String,
    iface: String,
    uptime: u32,
    unpack: u8,
    ipv4: Vec<Ipv4Addr>,
    ipv6: Vec<Ipv6Addr>,
}

pub struct MndpDecoder {
    flows: Vec<MndpFlow>,
    packets: u64,
    agg_status: u8,
}

impl MndpDecoder {
    pub fn new(flow_capacity: usize) -> MndpDecoder {
        MndpDecoder {
            flows: vec![MndpFlow::default(); flow_capacity],
            packets: 0,
            agg_status: 0,
        }
    }

    fn read_bounded(tlv: Tlv) -> (String, u8) {
        let mut cur = ByteCursor::new(tlv.value);
        match cur.read_str(MNDP_STRLEN, tlv.value.len(), StrEncoding::Utf8) {
            Ok(s) => {
                let bits = if s.truncated { MNDP_STAT_STR } else { 0 };
                (s.value, bits)
            }
            Err(_) => (String::new(), MNDP_STAT_SNAP),
        }
    }

    fn handle(state: &mut MndpFlow, tlv: Tlv) {
        match tlv.ty {
            MNDP_TLV_MAC_ADDR => {
                if tlv.value.len() != 6 {
                    state.status |= MNDP_STAT_TLV_LEN;
                    return;
                }
                let mut mac = [0u8; 6];
                mac.copy_from_slice(tlv.value);
                if !dedup_push(&mut state.macs, MNDP_LSTLEN, mac) {
                    state.status |= MNDP_STAT_LIST;
                }
            }
            MNDP_TLV_IDENTITY => {
                let (value, bits) = Self::read_bounded(tlv);
                state.identity = value;
                state.status |= bits;
            }
            MNDP_TLV_VERSION => {
                let (value, bits) = Self::read_bounded(tlv);
                state.version = value;
                state.status |= bits;
            }
            MNDP_TLV_PLATFORM => {
                let (value, bits) = Self::read_bounded(tlv);
                state.platform = value;
                state.status |= bits;
            }
            MNDP_TLV_SW_ID => {
                let (value, bits) = Self::read_bounded(tlv);
                state.software_id = value;
                state.status |= bits;
            }
            MNDP_TLV_BOARD => {
                let (value, bits) = Self::read_bounded(tlv);
                state.board = value;
                state.status |= bits;
            }
            MNDP_TLV_IFACE => {
                let (value, bits) = Self::read_bounded(tlv);
                state.iface = value;
                state.status |= bits;
            }
            MNDP_TLV_UPTIME => {
                // Uptime is sent little-endian, in seconds.
                let mut cur = ByteCursor::new(tlv.value);
                match cur.read_le_u32() {
                    Ok(uptime) => state.uptime = uptime,
                    Err(_) => state.status |= MNDP_STAT_TLV_LEN,
                }
            }
            MNDP_TLV_UNPACK => {
                let mut cur = ByteCursor::new(tlv.value);
                match cur.read_u8() {
                    Ok(unpack) => state.unpack = unpack,
                    Err(_) => state.status |= MNDP_STAT_TLV_LEN,
                }
            }
            MNDP_TLV_IPV4_ADDR => {
                if tlv.value.len() != 4 {
                    state.status |= MNDP_STAT_TLV_LEN;
                    return;
                }
                let mut oct = [0u8; 4];
                oct.copy_from_slice(tlv.value);
                if !dedup_push(&mut state.ipv4, MNDP_LSTLEN, Ipv4Addr::from(oct)) {
                    state.status |= MNDP_STAT_LIST;
                }
                state.status |= MNDP_STAT_IPV4;
            }
            MNDP_TLV_IPV6_ADDR => {
                if tlv.value.len() != 16 {
                    state.status |= MNDP_STAT_TLV_LEN;
                    return;
                }
                let mut oct = [0u8; 16];
                oct.copy_from_slice(tlv.value);
                if !dedup_push(&mut state.ipv6, MNDP_LSTLEN, Ipv6Addr::from(oct)) {
                    state.status |= MNDP_STAT_LIST;
                }
                state.status |= MNDP_STAT_IPV6;
            }
            _ => state.status |= MNDP_STAT_UNK_TLV,
        }
    }
}

impl Decoder for MndpDecoder {
    fn name(&self) -> &'static str {
        "mndpDecode"
    }

    fn header(&self) -> Vec<Column> {
        vec![
            Column::new("mndpStat", "MNDP status", ColumnType::Hex8),
            Column::new("mndpTLVTypes", "MNDP TLV types", ColumnType::Hex32),
            Column::repeated("mndpMAC", "MNDP MAC addresses", ColumnType::Mac),
            Column::new("mndpIdentity", "MNDP identity", ColumnType::Str),
            Column::new("mndpVersion", "MNDP version", ColumnType::Str),
            Column::new("mndpPlatform", "MNDP platform", ColumnType::Str),
            Column::new("mndpSWID", "MNDP software ID", ColumnType::Str),
            Column::new("mndpBoard", "MNDP board", ColumnType::Str),
            Column::new("mndpIface", "MNDP interface name", ColumnType::Str),
            Column::new("mndpUptime", "MNDP uptime (sec)", ColumnType::U32),
            Column::repeated("mndpIP4", "MNDP IPv4 addresses", ColumnType::Ip4),
            Column::repeated("mndpIP6", "MNDP IPv6 addresses", ColumnType::Ip6),
        ]
    }

    fn on_new_flow(&mut self, packet: &Packet, flow: &Flow, _flows: &FlowTable) {
        let state = &mut self.flows[flow.index.0];
        *state = MndpFlow::default();
        if packet.l4_proto == L4_UDP
            && (packet.src_port == MNDP_PORT || packet.dst_port == MNDP_PORT)
        {
            state.status |= MNDP_STAT_MNDP;
        }
    }

    fn on_layer4(&mut self, packet: &Packet, flow: &Flow, _flows: &FlowTable) {
        let state = &mut self.flows[flow.index.0];
        if state.status & MNDP_STAT_MNDP == 0 {
            return;
        }
        let payload = packet.l7();
        if payload.len() < MNDP_MIN_SIZE {
            return;
        }
        self.packets += 1;

        let mut cur = ByteCursor::new(payload);
        // Header and sequence number.
        if cur.skip(4).is_err() {
            state.status |= MNDP_STAT_SNAP;
            return;
        }
        for tlv in TlvScanner::new(&mut cur, TlvHeader::Wide) {
            match tlv {
                Ok(tlv) => {
                    record_type(&mut state.tlv_types, tlv.ty);
                    Self::handle(state, tlv);
                }
                Err(_) => {
                    state.status |= MNDP_STAT_SNAP;
                    break;
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
        let state = &self.flows[flow.index.0];
        self.agg_status |= state.status;

        record.append_u8(state.status)?;
        record.append_u32(state.tlv_types)?;
        record.begin_repeat(state.macs.len() as u32)?;
        for mac in &state.macs {
            record.append_mac(*mac)?;
        }
        record.append_str(&state.identity)?;
        record.append_str(&state.version)?;
        record.append_str(&state.platform)?;
        record.append_str(&state.software_id)?;
        record.append_str(&state.board)?;
        record.append_str(&state.iface)?;
        record.append_u32(state.uptime)?;
        record.begin_repeat(state.ipv4.len() as u32)?;
        for ip in &state.ipv4 {
            record.append_ip4(*ip)?;
        }
        record.begin_repeat(state.ipv6.len() as u32)?;
        for ip in &state.ipv6 {
            record.append_ip6(*ip)?;
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

    fn tlv(ty: u16, value: &[u8]) -> Vec<u8> {
        let mut out = ty.to_be_bytes().to_vec();
        out.extend_from_slice(&(value.len() as u16).to_be_bytes());
        out.extend_from_slice(value);
        out
    }

    fn run(payload: &[u8]) -> MndpFlow {
        let mut raw = vec![0u8; 42];
        raw.extend_from_slice(payload);
        let pkt = Packet::layer4(
            &raw,
            L4_UDP,
            "192.168.88.1".parse().unwrap(),
            "255.255.255.255".parse().unwrap(),
            MNDP_PORT,
            MNDP_PORT,
            42,
        );
        let mut dec = MndpDecoder::new(1);
        let flows = FlowTable::with_capacity(1);
        let flow = Flow::new(1, FlowIndex(0), Direction::A);
        dec.on_new_flow(&pkt, &flow, &flows);
        dec.on_layer4(&pkt, &flow, &flows);
        dec.flows[0].clone()
    }

    #[test]
    fn neighbor_announcement() {
        let mut payload = vec![0, 0, 0, 1]; // header + seqno
        payload.extend_from_slice(&tlv(
            MNDP_TLV_MAC_ADDR,
            &[0x4c, 0x5e, 0x0c, 0x01, 0x02, 0x03],
        ));
        payload.extend_from_slice(&tlv(MNDP_TLV_IDENTITY, b"MikroTik"));
        payload.extend_from_slice(&tlv(MNDP_TLV_UPTIME, &86400u32.to_le_bytes()));
        payload.extend_from_slice(&tlv(MNDP_TLV_IPV4_ADDR, &[192, 168, 88, 1]));

        let state = run(&payload);
        assert_eq!(state.macs, vec![[0x4c, 0x5e, 0x0c, 0x01, 0x02, 0x03]]);
        assert_eq!(state.identity, "MikroTik");
        assert_eq!(state.uptime, 86400);
        assert_eq!(state.ipv4, vec![Ipv4Addr::new(192, 168, 88, 1)]);
        assert!(state.status & MNDP_STAT_IPV4 != 0);
    }

    #[test]
    fn bad_mac_length() {
        let mut payload = vec![0, 0, 0, 1];
        payload.extend_from_slice(&tlv(MNDP_TLV_MAC_ADDR, &[1, 2, 3]));
        let state = run(&payload);
        assert!(state.status & MNDP_STAT_TLV_LEN != 0);
        assert!(state.macs.is_empty());
    }

    #[test]
    fn unknown_tlv_continues() {
        let mut payload = vec![0, 0, 0, 1];
        payload.extend_from_slice(&tlv(99, b"zz"));
        payload.extend_from_slice(&tlv(MNDP_TLV_BOARD, b"RB750"));
        let state = run(&payload);
        assert!(state.status & MNDP_STAT_UNK_TLV != 0);
        assert_eq!(state.board, "RB750");
    }
}
