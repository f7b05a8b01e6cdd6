//! voip-probe - synthetic VoIP traffic probe
//!
//! Sends codec-shaped UDP packets at a fixed cadence to a reflector and
//! measures one-way or round-trip delay, RFC 3550 jitter, sequence-gap loss
//! and an E-model MOS estimate from the echoes.

pub mod probe;
pub mod protocol;
pub mod server;
