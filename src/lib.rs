/*!
Protocol-dissection core for a passive network flow analyzer.

The host captures packets, classifies them up to layer 4 and maintains the
flow table; this crate owns everything after that:

* [`cursor::ByteCursor`] — the bounds-checked, endian-aware reader every
  decoder walks captured payloads with. Reads past the snap length are a
  recoverable error, never undefined behavior.
* [`runtime::Runtime`] — decoder lifecycle and the fixed per-packet
  dispatch order (`on_new_flow`, `on_layer2`, `on_layer4`,
  `on_flow_terminate`), with per-flow state arrays owned by each decoder.
* The decoders themselves: TLV protocols (CDP, LLDP, MNDP, VTP,
  STUN/TURN/NAT-PMP), line protocols (IRC, POP, SMTP, TELNET) and stream
  protocols (NTLMSSP with NetNTLM hash extraction, Telegram MTProto with
  optional CTR deobfuscation).
* [`schema`] — the typed, self-describing record each flow emits at
  termination, declared once at startup and checked on every write.
* File-producing subsystems: the per-flow payload [`dumper`], the live
  extraction [`ring`] with its background PCAP writer, the chained
  [`findexer`] packet index and the [`subnet`] lookup tables.

```
use flowsift::runtime::Runtime;
use flowsift::tlv::{CdpDecoder, LldpDecoder};

let mut rt = Runtime::new(1024);
rt.register(Box::new(CdpDecoder::new(1024)));
rt.register(Box::new(LldpDecoder::new(1024)));
// for each captured packet: rt.dispatch(&packet, index, new_flow);
// on flow timeout: let record = rt.terminate_flow(index)?;
# Ok::<(), flowsift::error::Error>(())
```
*/

pub mod config;
pub mod cursor;
pub mod dumper;
pub mod error;
pub mod findexer;
pub mod flow;
pub mod line;
pub mod packet;
pub mod ring;
pub mod runtime;
pub mod schema;
pub mod stream;
pub mod subnet;
pub mod tlv;

pub use crate::cursor::ByteCursor;
pub use crate::error::{Error, ParseError};
pub use crate::flow::{Flow, FlowIndex, FlowTable};
pub use crate::packet::Packet;
pub use crate::runtime::{Decoder, Runtime};
