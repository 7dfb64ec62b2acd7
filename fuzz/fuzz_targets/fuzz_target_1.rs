#![no_main]
use flowsift::flow::{Direction, Flow, FlowIndex};
use flowsift::packet::{Packet, ETHERTYPE_CDP, ETHERTYPE_LLDP};
use flowsift::runtime::Runtime;
use flowsift::tlv::{CdpDecoder, LldpDecoder, MndpDecoder, StunDecoder};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let mut rt = Runtime::new(2);
    rt.register(Box::new(CdpDecoder::new(2)));
    rt.register(Box::new(LldpDecoder::new(2)));
    rt.register(Box::new(MndpDecoder::new(2)));
    rt.register(Box::new(StunDecoder::new(2)));

    for (i, ethertype) in [ETHERTYPE_CDP, ETHERTYPE_LLDP].iter().enumerate() {
        let pkt = Packet::layer2(data, *ethertype, 0);
        let idx = FlowIndex(i);
        rt.dispatch(&pkt, idx, Some(Flow::new(i as u64, idx, Direction::A)));
        let _ = rt.terminate_flow(idx);
    }
});
