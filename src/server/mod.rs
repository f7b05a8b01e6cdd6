//! Reflector side of the probe: UDP echo with per-peer statistics

pub mod config;
pub mod monitor;
pub mod reflector;

pub use config::ServerConfig;
pub use monitor::{ServerCounters, ServerMonitor, ServerStats};
pub use reflector::{Reflector, ReflectorOptions, ShutdownHandle};
