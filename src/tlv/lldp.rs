//! Link Layer Discovery Protocol decoder.

use crate::cursor::{ByteCursor, StrEncoding};
use crate::error::{ParseError, Result};
use crate::flow::{Flow, FlowTable};
use crate::packet::{Packet, ETHERTYPE_LLDP};
use crate::runtime::{Decoder, DecoderReport};
use crate::schema::{Column, ColumnType, RecordBuilder};
use crate::tlv::{dedup_push, record_type, Tlv, TlvHeader, TlvScanner};

pub const LLDP_STAT_LLDP: u16 = 0x0001; // Flow is LLDP
pub const LLDP_STAT_MAND: u16 = 0x0002; // Mandatory TLV missing
pub const LLDP_STAT_OPT: u16 = 0x0004; // Optional TLV present
pub const LLDP_STAT_RSVD: u16 = 0x0008; // Reserved TLV type/subtype used
pub const LLDP_STAT_SPEC: u16 = 0x0010; // Organization specific TLV used
pub const LLDP_STAT_UNK: u16 = 0x0020; // Unhandled TLV used
pub const LLDP_STAT_LEN: u16 = 0x0040; // Invalid TLV length
pub const LLDP_STAT_STR: u16 = 0x2000; // String truncated
pub const LLDP_STAT_TTL: u16 = 0x4000; // Too many TTL values
pub const LLDP_STAT_SNAP: u16 = 0x8000; // Snapped payload

const LLDP_TLV_END: u16 = 0;
const LLDP_TLV_CHASSIS_ID: u16 = 1;
const LLDP_TLV_PORT_ID: u16 = 2;
const LLDP_TLV_TTL: u16 = 3;
const LLDP_TLV_PORT_DESC: u16 = 4;
const LLDP_TLV_SYS_NAME: u16 = 5;
const LLDP_TLV_SYS_DESC: u16 = 6;
const LLDP_TLV_SYS_CAPS: u16 = 7;
const LLDP_TLV_MNGMT_ADDR: u16 = 8;
const LLDP_TLV_ORG_SPEC: u16 = 127;

const LLDP_NUM_TTL: usize = 8; // distinct TTL values to store
const LLDP_STRLEN: usize = 20; // short string cap
const LLDP_LSTRLEN: usize = 100; // long string cap

// Chassis-ID subtypes
const CID_CHASSIS_COMP: u8 = 1;
const CID_IF_ALIAS: u8 = 2;
const CID_PORT_COMP: u8 = 3;
const CID_MAC_ADDR: u8 = 4;
const CID_NET_ADDR: u8 = 5;
const CID_IF_NAME: u8 = 6;
const CID_LOCAL: u8 = 7;

// Port-ID subtypes
const PID_IF_ALIAS: u8 = 1;
const PID_PORT_COMP: u8 = 2;
const PID_MAC_ADDR: u8 = 3;
const PID_NET_ADDR: u8 = 4;
const PID_IF_NAME: u8 = 5;
const PID_CIRC_ID: u8 = 6;
const PID_LOCAL: u8 = 7;

#[derive(Clone, Default)]
struct LldpFlow {
    status: u16,
    tlv_types: u32,
    ttl: Vec<u16>,
    caps: u16,
    enabled_caps: u16,
    chassis: String,
    port_id: String,
    port_desc: String,
    sys_name: String,
    sys_desc: String,
    mgmt_addr: String,
}

pub struct LldpDecoder {
    flows: Vec<LldpFlow>,
    packets: u64,
    agg_status: u16,
    agg_types: u32,
}

fn mac_str(b: &[u8; 6]) -> String {
    format!(
        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        b[0], b[1], b[2], b[3], b[4], b[5]
    )
}

fn hex_str(b: &[u8]) -> String {
    let mut out = String::with_capacity(2 * b.len());
    for byte in b {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

impl LldpDecoder {
    pub fn new(flow_capacity: usize) -> LldpDecoder {
        LldpDecoder {
            flows: vec![LldpFlow::default(); flow_capacity],
            packets: 0,
            agg_status: 0,
            agg_types: 0,
        }
    }

    /// Subtyped identifier TLVs (Chassis-ID, Port-ID): the first value
    /// byte selects how the rest is rendered.
    fn read_identifier(tlv: Tlv, mac_subtype: u8, net_subtype: u8) -> (String, u16) {
        let mut cur = ByteCursor::new(tlv.value);
        let subtype = match cur.read_u8() {
            Ok(s) => s,
            Err(_) => return (String::new(), LLDP_STAT_SNAP),
        };
        let rest = tlv.value.len() - 1;
        if subtype == mac_subtype {
            let mut mac = [0u8; 6];
            if cur.read_n(&mut mac).is_err() {
                return (String::new(), LLDP_STAT_LEN);
            }
            return (mac_str(&mac), 0);
        }
        if subtype == net_subtype {
            return match cur.read_u8() {
                Ok(1) => {
                    let mut oct = [0u8; 4];
                    match cur.read_n(&mut oct) {
                        Ok(()) => (std::net::Ipv4Addr::from(oct).to_string(), 0),
                        Err(_) => (String::new(), LLDP_STAT_LEN),
                    }
                }
                Ok(2) => {
                    let mut oct = [0u8; 16];
                    match cur.read_n(&mut oct) {
                        Ok(()) => (std::net::Ipv6Addr::from(oct).to_string(), 0),
                        Err(_) => (String::new(), LLDP_STAT_LEN),
                    }
                }
                Ok(_) => {
                    let bytes = cur.read_slice(cur.remaining()).unwrap_or(&[]);
                    let mut s = hex_str(bytes);
                    let bits = if s.len() > LLDP_STRLEN {
                        s.truncate(LLDP_STRLEN);
                        LLDP_STAT_STR
                    } else {
                        0
                    };
                    (s, bits)
                }
                Err(_) => (String::new(), LLDP_STAT_SNAP),
            };
        }
        // Hex-rendered subtypes (components, circuit ids).
        let hex_rendered = subtype == CID_PORT_COMP && mac_subtype == CID_MAC_ADDR
            || (subtype == PID_PORT_COMP || subtype == PID_CIRC_ID)
                && mac_subtype == PID_MAC_ADDR;
        if hex_rendered {
            let bytes = cur.read_slice(rest).unwrap_or(&[]);
            let mut s = hex_str(bytes);
            let bits = if s.len() > LLDP_STRLEN {
                s.truncate(LLDP_STRLEN);
                LLDP_STAT_STR
            } else {
                0
            };
            return (s, bits);
        }
        let named = matches!(
            subtype,
            CID_CHASSIS_COMP | CID_IF_ALIAS | CID_IF_NAME | CID_LOCAL
        ) || matches!(subtype, PID_IF_ALIAS | PID_IF_NAME | PID_LOCAL);
        if named {
            return match cur.read_str(LLDP_STRLEN, rest, StrEncoding::Utf8) {
                Ok(s) => {
                    let bits = if s.truncated { LLDP_STAT_STR } else { 0 };
                    (s.value, bits)
                }
                Err(_) => (String::new(), LLDP_STAT_SNAP),
            };
        }
        (String::new(), LLDP_STAT_RSVD)
    }

    fn read_bounded(tlv: Tlv, cap: usize) -> (String, u16) {
        let mut cur = ByteCursor::new(tlv.value);
        match cur.read_str(cap, tlv.value.len(), StrEncoding::Utf8) {
            Ok(s) => {
                let bits = if s.truncated { LLDP_STAT_STR } else { 0 };
                (s.value, bits)
            }
            Err(_) => (String::new(), LLDP_STAT_SNAP),
        }
    }

    fn handle(state: &mut LldpFlow, tlv: Tlv) {
        match tlv.ty {
            LLDP_TLV_END => {}
            LLDP_TLV_CHASSIS_ID => {
                let (value, bits) = Self::read_identifier(tlv, CID_MAC_ADDR, CID_NET_ADDR);
                state.chassis = value;
                state.status |= bits;
            }
            LLDP_TLV_PORT_ID => {
                let (value, bits) = Self::read_identifier(tlv, PID_MAC_ADDR, PID_NET_ADDR);
                state.port_id = value;
                state.status |= bits;
            }
            LLDP_TLV_TTL => {
                let mut cur = ByteCursor::new(tlv.value);
                match cur.read_u16() {
                    Ok(ttl) => {
                        if !dedup_push(&mut state.ttl, LLDP_NUM_TTL, ttl) {
                            state.status |= LLDP_STAT_TTL;
                        }
                    }
                    Err(_) => state.status |= LLDP_STAT_SNAP,
                }
            }
            LLDP_TLV_PORT_DESC => {
                let (value, bits) = Self::read_bounded(tlv, LLDP_STRLEN);
                state.port_desc = value;
                state.status |= bits;
            }
            LLDP_TLV_SYS_NAME => {
                let (value, bits) = Self::read_bounded(tlv, LLDP_STRLEN);
                state.sys_name = value;
                state.status |= bits;
            }
            LLDP_TLV_SYS_DESC => {
                let (value, bits) = Self::read_bounded(tlv, LLDP_LSTRLEN);
                state.sys_desc = value;
                state.status |= bits;
            }
            LLDP_TLV_SYS_CAPS => {
                let mut cur = ByteCursor::new(tlv.value);
                let caps = (|| Ok::<_, ParseError>((cur.read_u16()?, cur.read_u16()?)))();
                match caps {
                    Ok((caps, enabled)) => {
                        state.caps |= caps;
                        state.enabled_caps |= enabled;
                    }
                    Err(_) => state.status |= LLDP_STAT_SNAP,
                }
            }
            LLDP_TLV_MNGMT_ADDR => {
                let mut cur = ByteCursor::new(tlv.value);
                let parsed = (|| {
                    let alen = cur.read_u8()?;
                    let family = cur.read_u8()?;
                    Ok::<_, ParseError>((alen, family))
                })();
                match parsed {
                    Ok((alen, 1)) if alen >= 5 => {
                        let mut oct = [0u8; 4];
                        if cur.read_n(&mut oct).is_ok() {
                            state.mgmt_addr = std::net::Ipv4Addr::from(oct).to_string();
                        } else {
                            state.status |= LLDP_STAT_LEN;
                        }
                    }
                    Ok((alen, 2)) if alen >= 17 => {
                        let mut oct = [0u8; 16];
                        if cur.read_n(&mut oct).is_ok() {
                            state.mgmt_addr = std::net::Ipv6Addr::from(oct).to_string();
                        } else {
                            state.status |= LLDP_STAT_LEN;
                        }
                    }
                    Ok((alen, _)) => {
                        let n = (alen as usize).saturating_sub(1).min(cur.remaining());
                        let bytes = cur.read_slice(n).unwrap_or(&[]);
                        state.mgmt_addr = hex_str(bytes);
                        if state.mgmt_addr.len() > LLDP_STRLEN {
                            state.mgmt_addr.truncate(LLDP_STRLEN);
                            state.status |= LLDP_STAT_STR;
                        }
                    }
                    Err(_) => state.status |= LLDP_STAT_SNAP,
                }
            }
            LLDP_TLV_ORG_SPEC => state.status |= LLDP_STAT_SPEC,
            9..=126 => state.status |= LLDP_STAT_RSVD,
            _ => state.status |= LLDP_STAT_UNK,
        }
    }
}

impl Decoder for LldpDecoder {
    fn name(&self) -> &'static str {
        "lldpDecode"
    }

    fn header(&self) -> Vec<Column> {
        vec![
            Column::new("lldpStat", "LLDP status", ColumnType::Hex16),
            Column::repeated("lldpTTL", "LLDP Time To Live (sec)", ColumnType::U16),
            Column::new("lldpTLVTypes", "LLDP TLV types", ColumnType::Hex32),
            Column::new("lldpChassis", "LLDP chassis ID", ColumnType::Str),
            Column::new("lldpPort", "LLDP port ID", ColumnType::Str),
            Column::new("lldpPortDesc", "LLDP port description", ColumnType::Str),
            Column::new("lldpSysName", "LLDP system name", ColumnType::Str),
            Column::new("lldpSysDesc", "LLDP system description", ColumnType::Str),
            Column::group(
                "lldpCaps_enCaps",
                "LLDP supported and enabled capabilities",
                &[ColumnType::Hex16, ColumnType::Hex16],
            ),
            Column::new("lldpMngmtAddr", "LLDP management address", ColumnType::Str),
        ]
    }

    fn on_new_flow(&mut self, packet: &Packet, flow: &Flow, _flows: &FlowTable) {
        let state = &mut self.flows[flow.index.0];
        *state = LldpFlow::default();
        if packet.ethertype == ETHERTYPE_LLDP {
            state.status |= LLDP_STAT_LLDP;
        }
    }

    fn on_layer2(&mut self, packet: &Packet, flow: &Flow, _flows: &FlowTable) {
        if packet.ethertype != ETHERTYPE_LLDP {
            return;
        }
        self.packets += 1;
        let state = &mut self.flows[flow.index.0];

        let mut cur = ByteCursor::new(packet.l7());
        let mut mandatory = 0u8;
        for tlv in TlvScanner::new(&mut cur, TlvHeader::Packed7x9).with_end_type(LLDP_TLV_END) {
            match tlv {
                Ok(tlv) => {
                    record_type(&mut state.tlv_types, tlv.ty);
                    if tlv.ty < LLDP_TLV_PORT_DESC {
                        mandatory |= 1 << tlv.ty;
                    } else if tlv.ty <= LLDP_TLV_MNGMT_ADDR {
                        state.status |= LLDP_STAT_OPT;
                    }
                    Self::handle(state, tlv);
                }
                Err(_) => {
                    state.status |= LLDP_STAT_SNAP;
                    break;
                }
            }
        }
        if mandatory != 0x0f {
            state.status |= LLDP_STAT_MAND;
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

        record.append_u16(state.status)?;
        record.begin_repeat(state.ttl.len() as u32)?;
        for ttl in &state.ttl {
            record.append_u16(*ttl)?;
        }
        record.append_u32(state.tlv_types)?;
        record.append_str(&state.chassis)?;
        record.append_str(&state.port_id)?;
        record.append_str(&state.port_desc)?;
        record.append_str(&state.sys_name)?;
        record.append_str(&state.sys_desc)?;
        record.begin_repeat(1)?;
        record.append_u16(state.caps)?;
        record.append_u16(state.enabled_caps)?;
        record.append_str(&state.mgmt_addr)?;
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
        let word = (ty << 9) | value.len() as u16;
        let mut out = word.to_be_bytes().to_vec();
        out.extend_from_slice(value);
        out
    }

    fn run(payload: &[u8]) -> LldpFlow {
        let mut raw = vec![0u8; 14];
        raw.extend_from_slice(payload);
        let pkt = Packet::layer2(&raw, ETHERTYPE_LLDP, 14);
        let mut dec = LldpDecoder::new(1);
        let flows = FlowTable::with_capacity(1);
        let flow = Flow::new(1, FlowIndex(0), Direction::A);
        dec.on_new_flow(&pkt, &flow, &flows);
        dec.on_layer2(&pkt, &flow, &flows);
        dec.flows[0].clone()
    }

    #[test]
    fn mandatory_tlvs() {
        let mut payload = Vec::new();
        let mut chassis = vec![CID_MAC_ADDR];
        chassis.extend_from_slice(&[0x00, 0x11, 0x22, 0x33, 0x44, 0x55]);
        payload.extend_from_slice(&tlv(LLDP_TLV_CHASSIS_ID, &chassis));
        let mut port = vec![PID_LOCAL];
        port.extend_from_slice(b"eth0");
        payload.extend_from_slice(&tlv(LLDP_TLV_PORT_ID, &port));
        payload.extend_from_slice(&tlv(LLDP_TLV_TTL, &120u16.to_be_bytes()));
        payload.extend_from_slice(&tlv(LLDP_TLV_END, &[]));

        let state = run(&payload);
        assert_eq!(state.status, LLDP_STAT_LLDP);
        assert_eq!(state.chassis, "00:11:22:33:44:55");
        assert_eq!(state.port_id, "eth0");
        assert_eq!(state.ttl, vec![120]);
        assert_eq!(state.tlv_types & 0x0f, 0x0f);
    }

    #[test]
    fn missing_mandatory_sets_bit() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&tlv(LLDP_TLV_TTL, &120u16.to_be_bytes()));
        payload.extend_from_slice(&tlv(LLDP_TLV_END, &[]));
        let state = run(&payload);
        assert!(state.status & LLDP_STAT_MAND != 0);
    }

    #[test]
    fn optional_tlvs() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&tlv(LLDP_TLV_SYS_NAME, b"core-switch"));
        let mut caps = Vec::new();
        caps.extend_from_slice(&0x0080u16.to_be_bytes());
        caps.extend_from_slice(&0x0080u16.to_be_bytes());
        payload.extend_from_slice(&tlv(LLDP_TLV_SYS_CAPS, &caps));
        payload.extend_from_slice(&tlv(LLDP_TLV_END, &[]));
        let state = run(&payload);
        assert!(state.status & LLDP_STAT_OPT != 0);
        assert_eq!(state.sys_name, "core-switch");
        assert_eq!(state.caps, 0x0080);
        assert_eq!(state.enabled_caps, 0x0080);
    }

    #[test]
    fn ttl_overflow() {
        let mut payload = Vec::new();
        for ttl in 0..(LLDP_NUM_TTL as u16 + 1) {
            payload.extend_from_slice(&tlv(LLDP_TLV_TTL, &(ttl + 1).to_be_bytes()));
        }
        payload.extend_from_slice(&tlv(LLDP_TLV_END, &[]));
        let state = run(&payload);
        assert!(state.status & LLDP_STAT_TTL != 0);
        assert_eq!(state.ttl.len(), LLDP_NUM_TTL);
    }
}
