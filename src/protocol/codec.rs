//! Codec profile registry
//!
//! Each profile models the packetization of a real voice codec: how many
//! payload bytes one packet carries and how often packets are sent. The
//! E-model impairment factors (`Ie`, `Bpl`) per ITU-T G.113 live alongside so
//! the quality indicator can be derived for the same codec.

use crate::probe::error::ConfigurationError;
use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// Wire identifier of a codec profile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecId {
    G711 = 0,
    G729 = 1,
    Opus = 2,
}

impl CodecId {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(CodecId::G711),
            1 => Some(CodecId::G729),
            2 => Some(CodecId::Opus),
            _ => None,
        }
    }
}

/// Packetization parameters for one codec
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CodecProfile {
    pub name: &'static str,
    pub id: CodecId,
    pub payload_bytes: usize,
    pub packet_interval_ms: u64,
    /// Equipment impairment factor
    pub ie: f64,
    /// Packet-loss robustness factor
    pub bpl: f64,
}

const PROFILES: [CodecProfile; 3] = [
    CodecProfile {
        name: "g711",
        id: CodecId::G711,
        payload_bytes: 160,
        packet_interval_ms: 20,
        ie: 0.0,
        bpl: 25.0,
    },
    CodecProfile {
        name: "g729",
        id: CodecId::G729,
        payload_bytes: 20,
        packet_interval_ms: 20,
        ie: 11.0,
        bpl: 19.0,
    },
    // Opus is variable bitrate; 32 kbit/s at 20 ms frames is the modelled shape.
    CodecProfile {
        name: "opus",
        id: CodecId::Opus,
        payload_bytes: 80,
        packet_interval_ms: 20,
        ie: 5.0,
        bpl: 14.0,
    },
];

impl CodecProfile {
    /// Look up a profile by name (case-insensitive)
    pub fn resolve(name: &str) -> Result<Self, ConfigurationError> {
        let wanted = name.trim();
        PROFILES
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(wanted))
            .copied()
            .ok_or_else(|| ConfigurationError::UnknownCodec(name.to_string()))
    }

    pub fn from_id(id: CodecId) -> Self {
        PROFILES[id as usize]
    }

    pub fn all() -> &'static [CodecProfile] {
        &PROFILES
    }

    pub fn packet_interval(&self) -> Duration {
        Duration::from_millis(self.packet_interval_ms)
    }

    /// Natural send rate of the codec
    pub fn packets_per_second(&self) -> u32 {
        (1000 / self.packet_interval_ms.max(1)) as u32
    }
}

impl Default for CodecProfile {
    fn default() -> Self {
        PROFILES[0]
    }
}

impl fmt::Display for CodecProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({} bytes / {} ms)",
            self.name, self.payload_bytes, self.packet_interval_ms
        )
    }
}
