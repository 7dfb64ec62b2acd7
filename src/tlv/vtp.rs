//! VLAN Trunking Protocol decoder.

use crate::cursor::{ByteCursor, StrEncoding};
use crate::error::{ParseError, Result};
use crate::flow::{Flow, FlowTable};
use crate::packet::{Packet, ETHERTYPE_VTP};
use crate::runtime::{Decoder, DecoderReport};
use crate::schema::{Column, ColumnType, RecordBuilder};
use crate::tlv::dedup_push;
use std::net::Ipv4Addr;

pub const VTP_STAT_VTP: u16 = 0x0001; // Flow is VTP
pub const VTP_STAT_DVER: u16 = 0x0002; // Different versions used
pub const VTP_STAT_DMD: u16 = 0x0004; // Different management domains used
pub const VTP_STAT_MDLEN: u16 = 0x0010; // Invalid management domain length
pub const VTP_STAT_IVER: u16 = 0x0020; // Invalid version
pub const VTP_STAT_CODE: u16 = 0x0040; // Invalid code
pub const VTP_STAT_VLAN_TYPE: u16 = 0x0080; // Invalid VLAN type
pub const VTP_STAT_ARR: u16 = 0x2000; // Updater identity list truncated
pub const VTP_STAT_STR: u16 = 0x4000; // String truncated
pub const VTP_STAT_SNAP: u16 = 0x8000; // Packet snapped

const VTP_C_SUMADV: u8 = 0x01; // Summary Advertisement
const VTP_C_SUBADV: u8 = 0x02; // Subset Advertisement
const VTP_C_ADVREQ: u8 = 0x03; // Advertisement Request
const VTP_C_JOIN: u8 = 0x04; // Join/Prune Message
const VTP_C_UNKNOWN: u8 = 0x07; // Artificial type for unknown codes
const VTP_NUM_CODES: u8 = 4;
const VTP_V_LAST: u8 = 0x03;
const VTP_VLAN_UNKNOWN: u8 = 0x06; // Artificial type for unknown VLAN types

const VTP_NUM_UPDID: usize = 16; // max updater identities
const VTP_STR_MAX: usize = 64; // string cap
const VTP_TS_LEN: usize = 12; // update timestamp length
const VTP_MD5_STRLEN: usize = 32;

#[derive(Clone, Default)]
struct VtpFlow {
    status: u16,
    version: u8,
    code_bf: u8,
    vlan_type_bf: u8,
    domain: String,
    upd_ids: Vec<Ipv4Addr>,
    first_upd_ts: [u8; VTP_TS_LEN],
    last_upd_ts: [u8; VTP_TS_LEN],
    md5: String,
}

pub struct VtpDecoder {
    flows: Vec<VtpFlow>,
    packets: u64,
    agg_status: u16,
    agg_codes: u8,
}

impl VtpDecoder {
    pub fn new(flow_capacity: usize) -> VtpDecoder {
        VtpDecoder {
            flows: vec![VtpFlow::default(); flow_capacity],
            packets: 0,
            agg_status: 0,
            agg_codes: 0,
        }
    }

    fn summary_advert(state: &mut VtpFlow, cur: &mut ByteCursor) -> std::result::Result<(), ParseError> {
        cur.skip(4)?; // configuration revision number
        // Updater identity (the bytes are the IPv4 address).
        let mut oct = [0u8; 4];
        cur.read_n(&mut oct)?;
        if !dedup_push(&mut state.upd_ids, VTP_NUM_UPDID, Ipv4Addr::from(oct)) {
            state.status |= VTP_STAT_ARR;
        }
        // Update timestamp: keep the earliest and latest seen.
        let mut ts = [0u8; VTP_TS_LEN];
        cur.read_n(&mut ts)?;
        if state.first_upd_ts == [0; VTP_TS_LEN] || ts < state.first_upd_ts {
            state.first_upd_ts = ts;
        }
        if ts > state.last_upd_ts {
            state.last_upd_ts = ts;
        }
        state.md5 = cur.read_hex(16)?;
        Ok(())
    }

    fn subset_advert(state: &mut VtpFlow, cur: &mut ByteCursor) -> std::result::Result<(), ParseError> {
        cur.skip(4)?; // configuration revision number
        while !cur.is_empty() {
            let start = cur.tell();
            let vi_len = cur.read_u8()? as usize;
            cur.skip(1)?; // status
            let vlan_type = cur.read_u8()?;
            if vlan_type > 0 && vlan_type < VTP_VLAN_UNKNOWN {
                state.vlan_type_bf |= 1 << vlan_type;
            } else {
                state.status |= VTP_STAT_VLAN_TYPE;
            }
            let name_len = cur.read_u8()? as usize;
            cur.skip(2)?; // ISL VLAN id
            cur.skip(2)?; // MTU size
            cur.skip(4)?; // 802.10 index
            // The name is padded to a multiple of 4 bytes.
            let padded = 4 * ((name_len + 3) / 4);
            let name = cur.read_str(VTP_STR_MAX, padded, StrEncoding::Utf8)?;
            if name.truncated {
                state.status |= VTP_STAT_STR;
            }
            // Skip over any VLAN info TLVs to the next record.
            cur.seek(start + vi_len.max(1));
        }
        Ok(())
    }

    fn parse(state: &mut VtpFlow, payload: &[u8]) -> std::result::Result<(), ParseError> {
        let mut cur = ByteCursor::new(payload);

        let version = cur.read_u8()?;
        if version == 0 || version > VTP_V_LAST {
            state.status |= VTP_STAT_IVER;
        }
        if state.code_bf != 0 && version != state.version {
            state.status |= VTP_STAT_DVER;
        }
        state.version = version; // only the last version is kept

        let code = cur.read_u8()?;
        if code > 0 && code <= VTP_NUM_CODES {
            state.code_bf |= 1 << code;
        } else {
            state.code_bf |= 1 << VTP_C_UNKNOWN;
            state.status |= VTP_STAT_CODE;
        }

        cur.skip(1)?; // followers / sequence number / reserved

        let md_len = cur.read_u8()?;
        if md_len > 32 {
            state.status |= VTP_STAT_MDLEN;
        }

        // Management domain, padded with zeros to 32 bytes.
        let domain = cur.read_str(VTP_STR_MAX, 32, StrEncoding::Utf8)?;
        if domain.truncated {
            state.status |= VTP_STAT_STR;
        }
        if state.domain.is_empty() {
            state.domain = domain.value;
        } else if state.domain != domain.value {
            state.status |= VTP_STAT_DMD;
        }

        match code {
            VTP_C_SUMADV => Self::summary_advert(state, &mut cur)?,
            VTP_C_SUBADV => Self::subset_advert(state, &mut cur)?,
            VTP_C_ADVREQ => cur.skip(2)?, // start value
            VTP_C_JOIN => {
                cur.skip(2)?; // first VLAN id
                cur.skip(2)?; // last VLAN id
                cur.skip(cur.remaining())?; // active-VLAN bitmap
            }
            _ => {}
        }
        Ok(())
    }
}

impl Decoder for VtpDecoder {
    fn name(&self) -> &'static str {
        "vtpDecode"
    }

    fn header(&self) -> Vec<Column> {
        vec![
            Column::new("vtpStat", "VTP status", ColumnType::Hex16),
            Column::new("vtpVer", "VTP version", ColumnType::Hex8),
            Column::new("vtpCodeBF", "VTP aggregated codes", ColumnType::Hex8),
            Column::new("vtpVlanTypeBF", "VTP aggregated VLAN types", ColumnType::Hex8),
            Column::new("vtpDomain", "VTP Management Domain", ColumnType::Str),
            Column::repeated("vtpUpdId", "VTP Updater Identity", ColumnType::Ip4),
            Column::new("vtpFirstUpdTS", "VTP Timestamp of first update", ColumnType::Str),
            Column::new("vtpLastUpdTS", "VTP Timestamp of last update", ColumnType::Str),
            Column::new("vtpMD5", "VTP MD5 digest of last update", ColumnType::Str),
        ]
    }

    fn on_new_flow(&mut self, packet: &Packet, flow: &Flow, _flows: &FlowTable) {
        let state = &mut self.flows[flow.index.0];
        *state = VtpFlow::default();
        if packet.ethertype == ETHERTYPE_VTP {
            state.status |= VTP_STAT_VTP;
        }
    }

    fn on_layer2(&mut self, packet: &Packet, flow: &Flow, _flows: &FlowTable) {
        let state = &mut self.flows[flow.index.0];
        if state.status & VTP_STAT_VTP == 0 {
            return;
        }
        self.packets += 1;
        if Self::parse(state, packet.l7()).is_err() {
            state.status |= VTP_STAT_SNAP;
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
        self.agg_codes |= state.code_bf;

        let ts_str = |ts: &[u8; VTP_TS_LEN]| -> String {
            if *ts == [0; VTP_TS_LEN] {
                String::new()
            } else {
                String::from_utf8_lossy(ts).into_owned()
            }
        };

        record.append_u16(state.status)?;
        record.append_u8(state.version)?;
        record.append_u8(state.code_bf)?;
        record.append_u8(state.vlan_type_bf)?;
        record.append_str(&state.domain)?;
        record.begin_repeat(state.upd_ids.len() as u32)?;
        for id in &state.upd_ids {
            record.append_ip4(*id)?;
        }
        record.append_str(&ts_str(&state.first_upd_ts))?;
        record.append_str(&ts_str(&state.last_upd_ts))?;
        record.append_str(&state.md5)?;
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

    fn prologue(version: u8, code: u8, domain: &str) -> Vec<u8> {
        let mut out = vec![version, code, 0, domain.len() as u8];
        let mut dom = [0u8; 32];
        dom[..domain.len()].copy_from_slice(domain.as_bytes());
        out.extend_from_slice(&dom);
        out
    }

    fn run_packets(payloads: &[Vec<u8>]) -> VtpFlow {
        let mut dec = VtpDecoder::new(1);
        let flows = FlowTable::with_capacity(1);
        let flow = Flow::new(1, FlowIndex(0), Direction::A);
        let mut first = true;
        for payload in payloads {
            let mut raw = vec![0u8; 22];
            raw.extend_from_slice(payload);
            let pkt = Packet::layer2(&raw, ETHERTYPE_VTP, 22);
            if first {
                dec.on_new_flow(&pkt, &flow, &flows);
                first = false;
            }
            dec.on_layer2(&pkt, &flow, &flows);
        }
        dec.flows[0].clone()
    }

    #[test]
    fn summary_advertisement() {
        let mut payload = prologue(2, VTP_C_SUMADV, "LAB");
        payload.extend_from_slice(&42u32.to_be_bytes()); // revision
        payload.extend_from_slice(&[10, 1, 1, 1]); // updater identity
        payload.extend_from_slice(b"930313000102"); // timestamp
        payload.extend_from_slice(&[0xab; 16]); // md5

        let state = run_packets(&[payload]);
        assert_eq!(state.version, 2);
        assert_eq!(state.code_bf, 1 << VTP_C_SUMADV);
        assert_eq!(state.domain, "LAB");
        assert_eq!(state.upd_ids, vec![Ipv4Addr::new(10, 1, 1, 1)]);
        assert_eq!(&state.first_upd_ts, b"930313000102");
        assert_eq!(state.md5.len(), VTP_MD5_STRLEN);
    }

    #[test]
    fn domain_change_is_flagged() {
        let a = prologue(2, VTP_C_ADVREQ, "LAB");
        let b = prologue(2, VTP_C_ADVREQ, "PROD");
        let mut a2 = a.clone();
        a2.extend_from_slice(&[0, 0]);
        let mut b2 = b.clone();
        b2.extend_from_slice(&[0, 0]);
        let state = run_packets(&[a2, b2]);
        assert!(state.status & VTP_STAT_DMD != 0);
    }

    #[test]
    fn version_change_is_flagged() {
        let mut a = prologue(1, VTP_C_ADVREQ, "LAB");
        a.extend_from_slice(&[0, 0]);
        let mut b = prologue(2, VTP_C_ADVREQ, "LAB");
        b.extend_from_slice(&[0, 0]);
        let state = run_packets(&[a, b]);
        assert!(state.status & VTP_STAT_DVER != 0);
    }

    #[test]
    fn subset_advertisement_vlan_types() {
        let mut payload = prologue(2, VTP_C_SUBADV, "LAB");
        payload.extend_from_slice(&42u32.to_be_bytes()); // revision
        // One VLAN info record: len=20, status=0, type=1 (ethernet),
        // name_len=7, vlan=1, mtu=1500, 802.10 index, "default" padded.
        payload.push(20);
        payload.push(0);
        payload.push(1);
        payload.push(7);
        payload.extend_from_slice(&1u16.to_be_bytes());
        payload.extend_from_slice(&1500u16.to_be_bytes());
        payload.extend_from_slice(&100001u32.to_be_bytes());
        payload.extend_from_slice(b"default\0");
        let state = run_packets(&[payload]);
        assert_eq!(state.vlan_type_bf, 1 << 1);
        assert!(state.status & VTP_STAT_SNAP == 0);
    }
}
