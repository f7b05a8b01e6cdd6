use crate::protocol::clock::Timestamp;
use crate::protocol::codec::{CodecId, CodecProfile};
use crate::protocol::error::{DecodeError, Result};
use tracing::debug;

/// Current wire format revision
pub const PROTOCOL_VERSION: u8 = 1;

/// version (1) + sequence (4) + origin timestamp (8) + codec id (1)
pub const HEADER_SIZE: usize = 14;

/// Largest datagram any profile produces
pub const MAX_PACKET_SIZE: usize = 2048;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SequenceNumber(pub u32);

impl SequenceNumber {
    pub fn next(self) -> Self {
        SequenceNumber(self.0.wrapping_add(1))
    }
}

/// One synthetic voice packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbePacket {
    pub sequence: SequenceNumber,
    pub origin: Timestamp,
    pub codec: CodecId,
    pub payload: Vec<u8>,
}

impl ProbePacket {
    /// Build a packet with zero-filled payload sized for the codec
    pub fn new(sequence: SequenceNumber, origin: Timestamp, codec: CodecId) -> Self {
        let size = CodecProfile::from_id(codec).payload_bytes;
        Self {
            sequence,
            origin,
            codec,
            payload: vec![0u8; size],
        }
    }

    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + CodecProfile::from_id(self.codec).payload_bytes
    }

    /// Serialize into the fixed wire layout; payload is padded or truncated
    /// to the codec's payload size.
    pub fn encode(&self) -> Vec<u8> {
        let payload_bytes = CodecProfile::from_id(self.codec).payload_bytes;
        let mut buf = Vec::with_capacity(HEADER_SIZE + payload_bytes);
        buf.push(PROTOCOL_VERSION);
        buf.extend_from_slice(&self.sequence.0.to_be_bytes());
        buf.extend_from_slice(&self.origin.0.to_be_bytes());
        buf.push(self.codec.as_u8());

        let copied = self.payload.len().min(payload_bytes);
        buf.extend_from_slice(&self.payload[..copied]);
        buf.resize(HEADER_SIZE + payload_bytes, 0);
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            debug!(
                expected = HEADER_SIZE,
                actual = bytes.len(),
                "Packet shorter than header"
            );
            return Err(DecodeError::TooShort {
                expected: HEADER_SIZE,
                actual: bytes.len(),
            });
        }

        let version = bytes[0];
        if version != PROTOCOL_VERSION {
            debug!(version = version, "Unsupported packet version");
            return Err(DecodeError::UnsupportedVersion(version));
        }

        let mut seq = [0u8; 4];
        seq.copy_from_slice(&bytes[1..5]);
        let mut origin = [0u8; 8];
        origin.copy_from_slice(&bytes[5..13]);

        let codec = CodecId::from_u8(bytes[13]).ok_or(DecodeError::UnknownCodec(bytes[13]))?;
        let payload_bytes = CodecProfile::from_id(codec).payload_bytes;
        let expected = HEADER_SIZE + payload_bytes;
        if bytes.len() < expected {
            debug!(
                expected = expected,
                actual = bytes.len(),
                "Packet payload truncated"
            );
            return Err(DecodeError::TooShort {
                expected,
                actual: bytes.len(),
            });
        }

        let packet = ProbePacket {
            sequence: SequenceNumber(u32::from_be_bytes(seq)),
            origin: Timestamp(u64::from_be_bytes(origin)),
            codec,
            payload: bytes[HEADER_SIZE..expected].to_vec(),
        };

        debug!(sequence = packet.sequence.0, "Packet decoded successfully");
        Ok(packet)
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    fn codec_strategy() -> impl Strategy<Value = CodecId> {
        prop_oneof![Just(CodecId::G711), Just(CodecId::G729), Just(CodecId::Opus)]
    }

    proptest! {
        #[test]
        fn test_packet_encode_decode_roundtrip(
            seq in any::<u32>(),
            origin in any::<u64>(),
            codec in codec_strategy(),
        ) {
            let original = ProbePacket::new(SequenceNumber(seq), Timestamp(origin), codec);
            let decoded = ProbePacket::decode(&original.encode()).unwrap();
            prop_assert_eq!(original, decoded);
        }

        #[test]
        fn test_any_truncation_is_too_short(
            seq in any::<u32>(),
            codec in codec_strategy(),
            cut in 0usize..HEADER_SIZE + 20,
        ) {
            let encoded = ProbePacket::new(SequenceNumber(seq), Timestamp(1), codec).encode();
            let is_too_short = matches!(
                ProbePacket::decode(&encoded[..cut]),
                Err(DecodeError::TooShort { .. })
            );
            prop_assert!(is_too_short);
        }
    }
}
