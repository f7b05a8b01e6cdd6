//! Probe engine: paced sending, echo reception, statistics and reporting

pub mod config;
pub mod constants;
pub mod error;
pub mod health;
pub mod logging;
pub mod pacer;
pub mod progress;
pub mod quality;
pub mod reporter;
pub mod sender;
pub mod session;
pub mod sink;
pub mod socket;
pub mod statistics;

pub use config::{resolve_target, ClientConfig, SessionConfig};
pub use constants::*;
pub use error::{ConfigurationError, ProbeError, Result, SinkError};
pub use health::{HealthMonitor, HealthPolicy, HealthStatus};
pub use logging::{init_logging, init_logging_with_config};
pub use pacer::{Pacer, PacerHandle, Tick};
pub use progress::ProgressTracker;
pub use quality::QualityEstimate;
pub use reporter::Reporter;
pub use sender::{SendOutcome, Sender};
pub use session::{Session, SessionState};
pub use sink::{CsvSink, FanoutSink, JsonLinesSink, LogSink, MemorySink, ResultsSink};
pub use socket::{Transport, UdpTransport};
pub use statistics::{DelayMode, DelaySummary, MetricSnapshot, StatsConfig, StatsEngine};
