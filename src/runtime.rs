/*! Decoder lifecycle and packet dispatch.

The runtime owns the registered decoders and drives the fixed callback
order: `on_new_flow` (when the packet creates a flow), then `on_layer2`
for every packet, then `on_layer4` for packets carrying an L4 payload.
`on_flow_terminate` follows all other callbacks for a flow and appends the
decoder's columns to the output record strictly in header order.
*/

use crate::error::Result;
use crate::flow::{Flow, FlowIndex, FlowTable};
use crate::packet::Packet;
use crate::schema::{Column, RecordBuilder, Schema};
use bytes::Bytes;
use tracing::*;

/// Aggregated per-decoder results reported at shutdown.
#[derive(Clone, Copy, Debug, Default)]
pub struct DecoderReport {
    /// OR of the status bits of every flow the decoder saw.
    pub status: u64,
    /// Packets the decoder recognized as its protocol.
    pub packets: u64,
    /// Files written, packets extracted or flows indexed, where relevant.
    pub units: u64,
}

pub trait Decoder {
    fn name(&self) -> &'static str;

    /// Declared output columns; assembled into the global [`Schema`] once
    /// at startup.
    fn header(&self) -> Vec<Column>;

    /// The slot for `flow.index` must be fully reset here: indexes are
    /// recycled by the external flow table.
    fn on_new_flow(&mut self, packet: &Packet, flow: &Flow, flows: &FlowTable);

    fn on_layer2(&mut self, _packet: &Packet, _flow: &Flow, _flows: &FlowTable) {}

    fn on_layer4(&mut self, _packet: &Packet, _flow: &Flow, _flows: &FlowTable) {}

    /// Append exactly the declared columns, in order.
    fn on_flow_terminate(
        &mut self,
        flow: &Flow,
        flows: &FlowTable,
        record: &mut RecordBuilder,
    ) -> Result<()>;

    fn report(&self) -> DecoderReport {
        DecoderReport::default()
    }

    /// Flush and release resources; called once after the last packet.
    fn finalize(&mut self) {}
}

pub struct Runtime {
    decoders: Vec<Box<dyn Decoder>>,
    schema: Schema,
    pub flows: FlowTable,
}

impl Runtime {
    pub fn new(flow_capacity: usize) -> Runtime {
        Runtime {
            decoders: Vec::new(),
            schema: Schema::default(),
            flows: FlowTable::with_capacity(flow_capacity),
        }
    }

    /// Register a decoder. Registration order fixes both the dispatch
    /// order and the column order of the output schema.
    pub fn register(&mut self, decoder: Box<dyn Decoder>) {
        self.schema.push(decoder.header());
        self.decoders.push(decoder);
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Dispatch one packet. `new_flow` carries the flow the packet just
    /// created, if any; it is installed before any callback runs.
    pub fn dispatch(&mut self, packet: &Packet, index: FlowIndex, new_flow: Option<Flow>) {
        if let Some(flow) = new_flow {
            debug_assert_eq!(flow.index, index);
            self.flows.insert(flow);
            let flow = match self.flows.get(index) {
                Some(f) => f,
                None => return,
            };
            for d in &mut self.decoders {
                d.on_new_flow(packet, flow, &self.flows);
            }
        }
        let flow = match self.flows.get(index) {
            Some(f) => f,
            None => {
                warn!("packet dispatched for unknown flow index {}", index.0);
                return;
            }
        };
        for d in &mut self.decoders {
            d.on_layer2(packet, flow, &self.flows);
        }
        // Every L4 packet is dispatched, payload or not: stream decoders
        // track handshakes through empty segments.
        if packet.l4_proto != 0 {
            for d in &mut self.decoders {
                d.on_layer4(packet, flow, &self.flows);
            }
        }
    }

    /// Terminate a flow: every decoder appends its columns and the slot is
    /// released for reuse. Returns the assembled record.
    pub fn terminate_flow(&mut self, index: FlowIndex) -> Result<Bytes> {
        let mut record = RecordBuilder::new(&self.schema.columns);
        {
            let flow = match self.flows.get(index) {
                Some(f) => f,
                None => {
                    warn!("terminate for unknown flow index {}", index.0);
                    return record.finish();
                }
            };
            for d in &mut self.decoders {
                d.on_flow_terminate(flow, &self.flows, &mut record)?;
            }
        }
        self.flows.remove(index);
        record.finish()
    }

    /// Shut down all decoders and emit the aggregated per-decoder report.
    pub fn finalize(&mut self) -> Vec<(&'static str, DecoderReport)> {
        let mut out = Vec::with_capacity(self.decoders.len());
        for d in &mut self.decoders {
            d.finalize();
            let report = d.report();
            info!(
                decoder = d.name(),
                status = report.status,
                packets = report.packets,
                "aggregated status"
            );
            out.push((d.name(), report));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::Direction;
    use crate::schema::ColumnType;

    /// Counts callbacks per flow slot and emits them as two columns.
    struct Probe {
        seen: Vec<(u32, u32)>,
    }

    impl Decoder for Probe {
        fn name(&self) -> &'static str {
            "probe"
        }

        fn header(&self) -> Vec<Column> {
            vec![
                Column::new("probeL2", "layer-2 callbacks", ColumnType::U32),
                Column::new("probeL4", "layer-4 callbacks", ColumnType::U32),
            ]
        }

        fn on_new_flow(&mut self, _packet: &Packet, flow: &Flow, _flows: &FlowTable) {
            self.seen[flow.index.0] = (0, 0);
        }

        fn on_layer2(&mut self, _packet: &Packet, flow: &Flow, _flows: &FlowTable) {
            self.seen[flow.index.0].0 += 1;
        }

        fn on_layer4(&mut self, _packet: &Packet, flow: &Flow, _flows: &FlowTable) {
            self.seen[flow.index.0].1 += 1;
        }

        fn on_flow_terminate(
            &mut self,
            flow: &Flow,
            _flows: &FlowTable,
            record: &mut RecordBuilder,
        ) -> Result<()> {
            let (l2, l4) = self.seen[flow.index.0];
            record.append_u32(l2)?;
            record.append_u32(l4)?;
            Ok(())
        }
    }

    #[test]
    fn dispatch_order_and_record() {
        let mut rt = Runtime::new(4);
        rt.register(Box::new(Probe {
            seen: vec![(9, 9); 4],
        }));
        assert_eq!(rt.schema().names(), vec!["probeL2", "probeL4"]);

        let raw = [0u8; 60];
        let pkt = Packet::layer4(
            &raw,
            crate::packet::L4_TCP,
            "10.0.0.1".parse().unwrap(),
            "10.0.0.2".parse().unwrap(),
            1234,
            80,
            40,
        );
        let idx = FlowIndex(2);
        let flow = Flow::new(7, idx, Direction::A);
        rt.dispatch(&pkt, idx, Some(flow));
        rt.dispatch(&pkt, idx, None);

        let rec = rt.terminate_flow(idx).unwrap();
        let values = crate::schema::RecordReader::new(&rec).read(&rt.schema().columns);
        // new-flow reset the counters, then two packets hit L2 and L4.
        assert_eq!(values[0], crate::schema::Value::U32(2));
        assert_eq!(values[1], crate::schema::Value::U32(2));
        assert!(rt.flows.get(idx).is_none());
    }
}
