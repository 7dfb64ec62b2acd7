/*! Flow identity as seen by the decoders.

The flow table itself (hashing, timeouts, recycling) lives upstream; the
core only observes a stable [`FlowIndex`] per direction plus the small set
of fields below. Decoders never mutate a [`Flow`] except through the
declared status bits ([`LIVE_EXTRACT`]).
*/

use crate::packet::Timestamp;
use std::cell::Cell;
use std::net::IpAddr;

/// Index into the per-decoder state arrays. Stable for the lifetime of the
/// flow, reused once the flow table recycles the slot.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct FlowIndex(pub usize);

/// Flow status bits observable by decoders.
pub const HAS_OPPOSITE: u64 = 0x0001;
pub const IS_L2: u64 = 0x0002;
pub const IS_IPV6: u64 = 0x0004;
/// Any decoder may raise this; the ring extractor then writes the flow's
/// packets to the output PCAP.
pub const LIVE_EXTRACT: u64 = 0x0010_0000_0000_0000;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Direction {
    /// The direction that created the flow.
    A,
    /// The reverse direction.
    B,
}

#[derive(Clone, Debug)]
pub struct Flow {
    /// Global flow identifier, unique across the whole capture.
    pub findex: u64,
    pub index: FlowIndex,
    pub opposite: Option<FlowIndex>,
    pub direction: Direction,
    pub src: Option<IpAddr>,
    pub dst: Option<IpAddr>,
    pub src_mac: [u8; 6],
    pub dst_mac: [u8; 6],
    pub src_port: u16,
    pub dst_port: u16,
    pub l4_proto: u8,
    pub ethertype: u16,
    pub first_seen: Timestamp,
    pub last_seen: Timestamp,
    status: Cell<u64>,
}

impl Flow {
    pub fn new(findex: u64, index: FlowIndex, direction: Direction) -> Flow {
        Flow {
            findex,
            index,
            opposite: None,
            direction,
            src: None,
            dst: None,
            src_mac: [0; 6],
            dst_mac: [0; 6],
            src_port: 0,
            dst_port: 0,
            l4_proto: 0,
            ethertype: 0,
            first_seen: Timestamp::default(),
            last_seen: Timestamp::default(),
            status: Cell::new(0),
        }
    }

    pub fn status(&self) -> u64 {
        self.status.get()
    }

    pub fn set_status(&self, bits: u64) {
        self.status.set(self.status.get() | bits);
    }

    pub fn is_b(&self) -> bool {
        self.direction == Direction::B
    }

    pub fn dir_char(&self) -> char {
        match self.direction {
            Direction::A => 'A',
            Direction::B => 'B',
        }
    }

    pub fn has_opposite(&self) -> bool {
        self.opposite.is_some()
    }
}

/// The slice of the external flow table the runtime exposes to decoders.
///
/// Slots are allocated once for the flow-table capacity and reused when a
/// flow index is recycled.
pub struct FlowTable {
    slots: Vec<Option<Flow>>,
}

impl FlowTable {
    pub fn with_capacity(capacity: usize) -> FlowTable {
        FlowTable {
            slots: (0..capacity).map(|_| None).collect(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Install a flow in its slot. Panics if the index is out of range;
    /// the runtime and the flow table are sized together at startup.
    pub fn insert(&mut self, flow: Flow) {
        let idx = flow.index.0;
        self.slots[idx] = Some(flow);
    }

    pub fn remove(&mut self, index: FlowIndex) -> Option<Flow> {
        self.slots[index.0].take()
    }

    pub fn get(&self, index: FlowIndex) -> Option<&Flow> {
        self.slots.get(index.0).and_then(|s| s.as_ref())
    }

    pub fn get_mut(&mut self, index: FlowIndex) -> Option<&mut Flow> {
        self.slots.get_mut(index.0).and_then(|s| s.as_mut())
    }

    /// The flow carrying traffic in the reverse direction, if observed.
    pub fn opposite(&self, index: FlowIndex) -> Option<&Flow> {
        self.get(index)
            .and_then(|f| f.opposite)
            .and_then(|o| self.get(o))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_bits_are_monotonic() {
        let flow = Flow::new(1, FlowIndex(0), Direction::A);
        flow.set_status(HAS_OPPOSITE);
        flow.set_status(LIVE_EXTRACT);
        assert_eq!(flow.status(), HAS_OPPOSITE | LIVE_EXTRACT);
    }

    #[test]
    fn opposite_lookup() {
        let mut table = FlowTable::with_capacity(4);
        let mut a = Flow::new(1, FlowIndex(0), Direction::A);
        a.opposite = Some(FlowIndex(1));
        let b = Flow::new(2, FlowIndex(1), Direction::B);
        table.insert(a);
        table.insert(b);
        assert_eq!(table.opposite(FlowIndex(0)).unwrap().findex, 2);
        assert!(table.opposite(FlowIndex(1)).is_none());
    }
}
