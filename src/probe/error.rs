use crate::probe::session::SessionState;
use std::time::Duration;
use thiserror::Error;

/// Invalid probe configuration, reported before any packet is sent
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigurationError {
    #[error("Unknown codec profile '{0}' (expected one of: g711, g729, opus)")]
    UnknownCodec(String),

    #[error("Packet rate must be > 0")]
    NonPositiveRate,

    #[error("Invalid target '{target}': {reason}")]
    InvalidTarget { target: String, reason: String },

    #[error("Invalid setting {name}: {reason}")]
    InvalidSetting { name: &'static str, reason: String },
}

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error(
        "Fatal transport error after {elapsed:?} (last sequence {}): {source}",
        describe_sequence(.last_sequence)
    )]
    FatalTransport {
        #[source]
        source: std::io::Error,
        last_sequence: Option<u32>,
        elapsed: Duration,
    },

    #[error("Operation not allowed in state {0:?}")]
    InvalidState(SessionState),

    #[error("Session did not finish within {0:?}")]
    Timeout(Duration),

    #[error("Socket error: {0}")]
    Socket(String),

    #[error("Statistics error: {0}")]
    Statistics(String),

    #[error("Failed to spawn {name} thread: {source}")]
    Spawn {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },
}

fn describe_sequence(sequence: &Option<u32>) -> String {
    match sequence {
        Some(seq) => seq.to_string(),
        None => "none".to_string(),
    }
}

impl ProbeError {
    pub fn is_fatal_transport(&self) -> bool {
        matches!(self, ProbeError::FatalTransport { .. })
    }
}

/// Failure reported by a results sink
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("Sink I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Sink serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ProbeError>;
