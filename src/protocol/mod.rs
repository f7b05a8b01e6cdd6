//! Probe wire protocol: codec profiles, timestamps and the packet layout

pub mod clock;
pub mod codec;
pub mod error;
pub mod message;

pub use clock::{Clock, Timestamp};
pub use codec::{CodecId, CodecProfile};
pub use error::{DecodeError, Result as ProtocolResult};
pub use message::{
    ProbePacket, SequenceNumber, HEADER_SIZE, MAX_PACKET_SIZE, PROTOCOL_VERSION,
};
