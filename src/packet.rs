/*! The borrowed packet view handed to decoders.

Capture, link-layer dissection and flow classification happen upstream;
the core receives a [`Packet`] whose layer offsets all point into the same
raw buffer and whose lifetime is a single dispatch cycle.
*/

use std::net::IpAddr;

pub const ETHERTYPE_CDP: u16 = 0x2000;
pub const ETHERTYPE_LLDP: u16 = 0x88cc;
pub const ETHERTYPE_VLAN: u16 = 0x8100;
pub const ETHERTYPE_VTP: u16 = 0x2003;

pub const L4_TCP: u8 = 6;
pub const L4_UDP: u8 = 17;
pub const L4_SCTP: u8 = 132;

pub const TH_FIN: u8 = 0x01;
pub const TH_SYN: u8 = 0x02;
pub const TH_RST: u8 = 0x04;
pub const TH_ACK: u8 = 0x10;

/// Seconds and microseconds since the epoch, as written to output records.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Default)]
pub struct Timestamp {
    pub sec: u64,
    pub usec: u32,
}

impl Timestamp {
    pub fn new(sec: u64, usec: u32) -> Timestamp {
        Timestamp { sec, usec }
    }
}

/// TCP header fields decoders care about.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct TcpInfo {
    pub seq: u32,
    pub flags: u8,
}

#[derive(Clone, Debug)]
pub struct Packet<'a> {
    /// The raw captured bytes, starting at layer 2.
    pub raw: &'a [u8],
    pub timestamp: Timestamp,
    /// Wire length of the packet; `raw.len()` may be smaller (snapped).
    pub wire_len: u32,
    pub l7_off: usize,
    /// Layer-7 length according to the headers.
    pub l7_len: u16,
    /// Layer-7 bytes actually captured; always `<= l7_len`.
    pub snap_l7_len: u16,
    pub ethertype: u16,
    pub vlan: Option<u16>,
    pub inner_vlan: Option<u16>,
    pub src: Option<IpAddr>,
    pub dst: Option<IpAddr>,
    pub src_port: u16,
    pub dst_port: u16,
    /// 0 for layer-2-only packets.
    pub l4_proto: u8,
    pub tcp: Option<TcpInfo>,
    /// IPv4 TOS byte (or the IPv6 traffic class); 0 for layer-2 packets.
    pub tos: u8,
    /// False for trailing IP fragments, which decoders skip.
    pub first_fragment: bool,
}

impl<'a> Packet<'a> {
    /// The captured layer-7 slice (bounded by the snap length).
    pub fn l7(&self) -> &'a [u8] {
        let start = self.l7_off.min(self.raw.len());
        let end = (self.l7_off + self.snap_l7_len as usize).min(self.raw.len());
        &self.raw[start..end]
    }

    pub fn has_l4_payload(&self) -> bool {
        self.l4_proto != 0 && self.snap_l7_len > 0
    }

    pub fn tcp_seq(&self) -> u32 {
        self.tcp.map(|t| t.seq).unwrap_or(0)
    }

    /// A layer-2 packet whose payload starts right after the ethertype.
    pub fn layer2(raw: &'a [u8], ethertype: u16, l7_off: usize) -> Packet<'a> {
        let l7 = raw.len().saturating_sub(l7_off) as u16;
        Packet {
            raw,
            timestamp: Timestamp::default(),
            wire_len: raw.len() as u32,
            l7_off,
            l7_len: l7,
            snap_l7_len: l7,
            ethertype,
            vlan: None,
            inner_vlan: None,
            src: None,
            dst: None,
            src_port: 0,
            dst_port: 0,
            l4_proto: 0,
            tcp: None,
            tos: 0,
            first_fragment: true,
        }
    }

    /// An IP packet with the payload at `l7_off`.
    pub fn layer4(
        raw: &'a [u8],
        l4_proto: u8,
        src: IpAddr,
        dst: IpAddr,
        src_port: u16,
        dst_port: u16,
        l7_off: usize,
    ) -> Packet<'a> {
        let l7 = raw.len().saturating_sub(l7_off) as u16;
        Packet {
            raw,
            timestamp: Timestamp::default(),
            wire_len: raw.len() as u32,
            l7_off,
            l7_len: l7,
            snap_l7_len: l7,
            ethertype: 0x0800,
            vlan: None,
            inner_vlan: None,
            src: Some(src),
            dst: Some(dst),
            src_port,
            dst_port,
            l4_proto,
            tcp: None,
            tos: 0,
            first_fragment: true,
        }
    }

    pub fn with_tcp(mut self, seq: u32, flags: u8) -> Packet<'a> {
        self.tcp = Some(TcpInfo { seq, flags });
        self
    }

    /// Mark the packet as snapped: only `snap` of the `l7_len` payload
    /// bytes were captured.
    pub fn snapped(mut self, snap: u16) -> Packet<'a> {
        self.snap_l7_len = snap.min(self.l7_len);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn l7_slice_is_bounded_by_snap() {
        let raw = [0u8; 64];
        let pkt = Packet::layer2(&raw, ETHERTYPE_CDP, 14).snapped(10);
        assert_eq!(pkt.l7().len(), 10);
        assert_eq!(pkt.l7_len, 50);
    }
}
