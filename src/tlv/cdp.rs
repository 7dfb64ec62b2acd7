//! Cisco Discovery Protocol decoder.

use crate::cursor::{ByteCursor, StrEncoding};
use crate::error::{ParseError, Result};
use crate::flow::{Flow, FlowTable};
use crate::packet::{Packet, ETHERTYPE_CDP};
use crate::runtime::{Decoder, DecoderReport};
use crate::schema::{Column, ColumnType, RecordBuilder};
use crate::tlv::{dedup_push, record_type, Tlv, TlvHeader, TlvScanner};
use std::net::Ipv4Addr;

pub const CDP_STAT_CDP: u8 = 0x01; // Flow is CDP
pub const CDP_STAT_STR: u8 = 0x20; // String truncated
pub const CDP_STAT_LEN: u8 = 0x40; // Invalid TLV length
pub const CDP_STAT_SNAP: u8 = 0x80; // Snapped payload

const CDP_TLV_DEVICE_ID: u16 = 0x0001;
const CDP_TLV_ADDRESSES: u16 = 0x0002;
const CDP_TLV_PORT_ID: u16 = 0x0003;
const CDP_TLV_CAPS: u16 = 0x0004;
const CDP_TLV_SW_VERSION: u16 = 0x0005;
const CDP_TLV_PLATFORM: u16 = 0x0006;
const CDP_TLV_IP_PREFIXES: u16 = 0x0007;
const CDP_TLV_VTP_MNGMT: u16 = 0x0009;
const CDP_TLV_NATIVE_VLAN: u16 = 0x000a;
const CDP_TLV_DUPLEX: u16 = 0x000b;
const CDP_TLV_VOIP_VLAN_R: u16 = 0x000e;
const CDP_TLV_MNGMT_ADDR: u16 = 0x0016;

const CDP_NADDR: usize = 5; // maximum number of IPv4 addresses
const CDP_NMADDR: usize = 5; // maximum number of management addresses
const CDP_NIPPG: usize = 5; // maximum number of IP prefix gateways
const CDP_STRLEN: usize = 25; // maximum length of strings to store
const CDP_LSTRLEN: usize = 100; // maximum length of long strings to store

#[derive(Clone, Default)]
struct CdpFlow {
    status: u8,
    version: u8,
    ttl: u8,
    tlv_types: u32,
    caps: u32,
    duplex: u8,
    vlan: u16,
    voip_vlan: u16,
    device: String,
    platform: String,
    sw_version: String,
    port: String,
    vtp_domain: String,
    addrs: Vec<Ipv4Addr>,
    mgmt_addrs: Vec<Ipv4Addr>,
    prefixes: Vec<(Ipv4Addr, u8)>,
}

pub struct CdpDecoder {
    flows: Vec<CdpFlow>,
    packets: u64,
    agg_status: u8,
    agg_types: u32,
    agg_caps: u32,
}

impl CdpDecoder {
    pub fn new(flow_capacity: usize) -> CdpDecoder {
        CdpDecoder {
            flows: vec![CdpFlow::default(); flow_capacity],
            packets: 0,
            agg_status: 0,
            agg_types: 0,
            agg_caps: 0,
        }
    }

    /// Bounded string out of a TLV value; returns the status bits to OR in.
    fn read_bounded(tlv: Tlv, cap: usize) -> (String, u8) {
        let mut cur = ByteCursor::new(tlv.value);
        match cur.read_str(cap, tlv.value.len(), StrEncoding::Utf8) {
            Ok(s) => {
                let bits = if s.truncated { CDP_STAT_STR } else { 0 };
                (s.value, bits)
            }
            Err(_) => (String::new(), CDP_STAT_SNAP),
        }
    }

    /// Address and management-address TLVs share the same layout: a count
    /// followed by protocol-tagged addresses.
    fn read_addresses(state: &mut CdpFlow, value: &[u8], mgmt: bool) {
        let mut cur = ByteCursor::new(value);
        let naddr = match cur.read_u32() {
            Ok(n) => n,
            Err(_) => {
                state.status |= CDP_STAT_SNAP;
                return;
            }
        };
        for _ in 0..naddr {
            let header = (|| {
                cur.read_u8()?; // protocol type
                let plen = cur.read_u8()?;
                cur.skip(plen as usize)?; // protocol
                cur.read_u16() // address length
            })();
            let alen = match header {
                Ok(alen) => alen,
                Err(_) => {
                    state.status |= CDP_STAT_SNAP;
                    return;
                }
            };
            if alen != 4 {
                // Not an IPv4 address; skip it.
                if cur.skip(alen as usize).is_err() {
                    state.status |= CDP_STAT_SNAP;
                    return;
                }
                continue;
            }
            let mut oct = [0u8; 4];
            if cur.read_n(&mut oct).is_err() {
                state.status |= CDP_STAT_SNAP;
                return;
            }
            let addr = Ipv4Addr::from(oct);
            let list = if mgmt {
                &mut state.mgmt_addrs
            } else {
                &mut state.addrs
            };
            let cap = if mgmt { CDP_NMADDR } else { CDP_NADDR };
            dedup_push(list, cap, addr);
        }
    }

    fn handle(state: &mut CdpFlow, tlv: Tlv) {
        match tlv.ty {
            CDP_TLV_DEVICE_ID => {
                let (value, bits) = Self::read_bounded(tlv, CDP_STRLEN);
                state.device = value;
                state.status |= bits;
            }
            CDP_TLV_PORT_ID => {
                let (value, bits) = Self::read_bounded(tlv, CDP_STRLEN);
                state.port = value;
                state.status |= bits;
            }
            CDP_TLV_PLATFORM => {
                let (value, bits) = Self::read_bounded(tlv, CDP_STRLEN);
                state.platform = value;
                state.status |= bits;
            }
            CDP_TLV_SW_VERSION => {
                let (value, bits) = Self::read_bounded(tlv, CDP_LSTRLEN);
                state.sw_version = value;
                state.status |= bits;
            }
            CDP_TLV_VTP_MNGMT => {
                let (value, bits) = Self::read_bounded(tlv, CDP_STRLEN);
                state.vtp_domain = value;
                state.status |= bits;
            }
            CDP_TLV_ADDRESSES => Self::read_addresses(state, tlv.value, false),
            CDP_TLV_MNGMT_ADDR => Self::read_addresses(state, tlv.value, true),
            CDP_TLV_CAPS => {
                let mut cur = ByteCursor::new(tlv.value);
                match cur.read_u32() {
                    Ok(caps) => state.caps |= caps,
                    Err(_) => state.status |= CDP_STAT_SNAP,
                }
            }
            CDP_TLV_NATIVE_VLAN => {
                let mut cur = ByteCursor::new(tlv.value);
                match cur.read_u16() {
                    Ok(vlan) => state.vlan = vlan,
                    Err(_) => state.status |= CDP_STAT_SNAP,
                }
            }
            CDP_TLV_DUPLEX => {
                let mut cur = ByteCursor::new(tlv.value);
                match cur.read_u8() {
                    Ok(duplex) => state.duplex |= 1 << (duplex & 0x07),
                    Err(_) => state.status |= CDP_STAT_SNAP,
                }
            }
            CDP_TLV_VOIP_VLAN_R => {
                let mut cur = ByteCursor::new(tlv.value);
                let vlan = (|| {
                    cur.read_u8()?; // data
                    cur.read_u16()
                })();
                match vlan {
                    Ok(vlan) => state.voip_vlan = vlan,
                    Err(_) => state.status |= CDP_STAT_SNAP,
                }
            }
            CDP_TLV_IP_PREFIXES => {
                let mut cur = ByteCursor::new(tlv.value);
                while cur.remaining() >= 5 {
                    let mut oct = [0u8; 4];
                    // Reads inside the value slice cannot fail here.
                    let _ = cur.read_n(&mut oct);
                    let mask = cur.read_u8().unwrap_or(0);
                    dedup_push(&mut state.prefixes, CDP_NIPPG, (Ipv4Addr::from(oct), mask));
                }
            }
            // Known-but-unused and unknown types alike only record their
            // type bit.
            _ => {}
        }
    }
}

impl Decoder for CdpDecoder {
    fn name(&self) -> &'static str {
        "cdpDecode"
    }

    fn header(&self) -> Vec<Column> {
        vec![
            Column::new("cdpStat", "CDP status", ColumnType::Hex8),
            Column::new("cdpVer", "CDP version", ColumnType::U8),
            Column::new("cdpTTL", "CDP Time To Live (sec)", ColumnType::U8),
            Column::new("cdpTLVTypes", "CDP TLV types", ColumnType::Hex32),
            Column::new("cdpDevice", "CDP device ID", ColumnType::Str),
            Column::new("cdpPlatform", "CDP platform", ColumnType::Str),
            Column::new("cdpSWVersion", "CDP Software Version", ColumnType::Str),
            Column::new("cdpPortID", "CDP port ID", ColumnType::Str),
            Column::new("cdpCaps", "CDP capabilities", ColumnType::Hex32),
            Column::new("cdpDuplex", "CDP duplex", ColumnType::Hex8),
            Column::new("cdpNVLAN", "CDP native VLAN", ColumnType::U16),
            Column::new("cdpVoipVLAN", "CDP VoIP VLAN", ColumnType::U16),
            Column::new("cdpVTPMngmtDmn", "CDP VTP management domain", ColumnType::Str),
            Column::repeated("cdpMAddrs", "CDP management addresses", ColumnType::Ip4),
            Column::repeated("cdpAddrs", "CDP addresses", ColumnType::Ip4),
            Column::group(
                "cdpIPPref_cdr",
                "CDP IP prefix, CIDR",
                &[ColumnType::Ip4, ColumnType::U8],
            ),
        ]
    }

    fn on_new_flow(&mut self, packet: &Packet, flow: &Flow, _flows: &FlowTable) {
        let state = &mut self.flows[flow.index.0];
        *state = CdpFlow::default();
        if packet.ethertype == ETHERTYPE_CDP {
            state.status |= CDP_STAT_CDP;
        }
    }

    fn on_layer2(&mut self, packet: &Packet, flow: &Flow, _flows: &FlowTable) {
        if packet.ethertype != ETHERTYPE_CDP {
            return;
        }
        self.packets += 1;
        let state = &mut self.flows[flow.index.0];

        let mut cur = ByteCursor::new(packet.l7());
        let prologue = (|| {
            let version = cur.read_u8()?;
            let ttl = cur.read_u8()?;
            cur.skip(2)?; // checksum
            Ok::<_, ParseError>((version, ttl))
        })();
        match prologue {
            Ok((version, ttl)) => {
                state.version = version;
                state.ttl = ttl;
            }
            Err(_) => {
                state.status |= CDP_STAT_SNAP;
                return;
            }
        }

        for tlv in TlvScanner::new(&mut cur, TlvHeader::WideInclusive) {
            match tlv {
                Ok(tlv) => {
                    record_type(&mut state.tlv_types, tlv.ty);
                    Self::handle(state, tlv);
                }
                Err(ParseError::InvalidLength) => {
                    state.status |= CDP_STAT_LEN;
                    break;
                }
                Err(_) => {
                    state.status |= CDP_STAT_SNAP;
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
        self.agg_types |= state.tlv_types;
        self.agg_caps |= state.caps;

        record.append_u8(state.status)?;
        record.append_u8(state.version)?;
        record.append_u8(state.ttl)?;
        record.append_u32(state.tlv_types)?;
        record.append_str(&state.device)?;
        record.append_str(&state.platform)?;
        record.append_str(&state.sw_version)?;
        record.append_str(&state.port)?;
        record.append_u32(state.caps)?;
        record.append_u8(state.duplex)?;
        record.append_u16(state.vlan)?;
        record.append_u16(state.voip_vlan)?;
        record.append_str(&state.vtp_domain)?;
        record.begin_repeat(state.mgmt_addrs.len() as u32)?;
        for addr in &state.mgmt_addrs {
            record.append_ip4(*addr)?;
        }
        record.begin_repeat(state.addrs.len() as u32)?;
        for addr in &state.addrs {
            record.append_ip4(*addr)?;
        }
        record.begin_repeat(state.prefixes.len() as u32)?;
        for (net, cidr) in &state.prefixes {
            record.append_ip4(*net)?;
            record.append_u8(*cidr)?;
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

    fn cdp_packet(payload: &[u8]) -> Vec<u8> {
        let mut raw = vec![0u8; 14];
        raw.extend_from_slice(payload);
        raw
    }

    fn run(payload: &[u8]) -> CdpFlow {
        let raw = cdp_packet(payload);
        let pkt = Packet::layer2(&raw, ETHERTYPE_CDP, 14);
        let mut dec = CdpDecoder::new(1);
        let flows = FlowTable::with_capacity(1);
        let flow = Flow::new(1, FlowIndex(0), Direction::A);
        dec.on_new_flow(&pkt, &flow, &flows);
        dec.on_layer2(&pkt, &flow, &flows);
        dec.flows[0].clone()
    }

    #[test]
    fn device_id() {
        // version=2 ttl=180 checksum=0, then TLV type=1 len=14.
        let mut payload = vec![2, 180, 0, 0, 0x00, 0x01, 0x00, 0x0e];
        payload.extend_from_slice(b"Switch-A\0\0");
        let state = run(&payload);
        assert_eq!(state.status, CDP_STAT_CDP);
        assert_eq!(state.version, 2);
        assert_eq!(state.ttl, 180);
        assert_eq!(state.device, "Switch-A");
        assert_eq!(state.tlv_types, 1 << 1);
    }

    #[test]
    fn addresses_deduplicate() {
        let mut payload = vec![2, 180, 0, 0];
        // One address TLV with the same IPv4 address twice.
        let mut addr_entry = Vec::new();
        for _ in 0..2 {
            addr_entry.extend_from_slice(&[1, 1, 0xcc]); // type, len, proto
            addr_entry.extend_from_slice(&[0x00, 0x04]); // address length
            addr_entry.extend_from_slice(&[10, 0, 0, 1]);
        }
        let value_len = 4 + addr_entry.len() + 4;
        payload.extend_from_slice(&[0x00, 0x02]);
        payload.extend_from_slice(&(value_len as u16).to_be_bytes());
        payload.extend_from_slice(&2u32.to_be_bytes());
        payload.extend_from_slice(&addr_entry);
        let state = run(&payload);
        assert_eq!(state.addrs, vec![Ipv4Addr::new(10, 0, 0, 1)]);
    }

    #[test]
    fn truncated_string_sets_bit() {
        let mut payload = vec![2, 180, 0, 0];
        let name = [b'x'; CDP_STRLEN + 1];
        payload.extend_from_slice(&[0x00, 0x06]);
        payload.extend_from_slice(&((name.len() + 4) as u16).to_be_bytes());
        payload.extend_from_slice(&name);
        let state = run(&payload);
        assert!(state.status & CDP_STAT_STR != 0);
        assert_eq!(state.platform.len(), CDP_STRLEN);
    }

    #[test]
    fn overlong_tlv_sets_snap() {
        let payload = [2, 180, 0, 0, 0x00, 0x01, 0x00, 0x50, 0xaa];
        let state = run(&payload);
        assert!(state.status & CDP_STAT_SNAP != 0);
    }

    #[test]
    fn bad_tlv_length_sets_len_bit() {
        let payload = [2, 180, 0, 0, 0x00, 0x01, 0x00, 0x02, 0, 0];
        let state = run(&payload);
        assert!(state.status & CDP_STAT_LEN != 0);
    }
}
