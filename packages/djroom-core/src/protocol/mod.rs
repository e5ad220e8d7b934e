//! Room protocol: packet framing, event names, and the event decoder.

pub mod decoder;
pub mod events;
pub mod packet;

#[cfg(test)]
pub(crate) mod test_fixtures;

pub use decoder::{
    decode, decode_event, decode_join_ack, DecodeError, DecodeResult, Decoded, JoinAckError,
};
pub use packet::{OpenInfo, Packet};
