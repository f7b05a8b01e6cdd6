use thiserror::Error;

/// Protocol-level errors for probe packet decoding
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("Packet too short: expected at least {expected} bytes, got {actual}")]
    TooShort { expected: usize, actual: usize },

    #[error("Unsupported packet format version {0}")]
    UnsupportedVersion(u8),

    #[error("Unknown codec id {0}")]
    UnknownCodec(u8),
}

pub type Result<T> = std::result::Result<T, DecodeError>;
