/*! Decoders for length-prefixed binary protocols framed over TCP.

These do not perform general TCP reassembly: they rely on in-order
delivery, a locator pattern or a per-flow next-message sequence pointer,
and offset-anchored field reads inside each captured segment.
*/

mod ntlmssp;
mod telegram;

pub use self::ntlmssp::*;
pub use self::telegram::*;
