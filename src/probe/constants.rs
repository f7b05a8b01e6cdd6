//! Constants used throughout the probe engine

/// Default UDP port of the reflector
pub const DEFAULT_PORT: u16 = 5005;

/// Default cadence for interim snapshots written to the sink (seconds)
pub const DEFAULT_REPORT_INTERVAL_SECS: u64 = 5;

/// Default warmup before the quality indicator is reported (seconds)
pub const DEFAULT_WARMUP_SECS: u64 = 3;

/// Highest accepted packet rate (packets per second)
pub const MAX_RATE: u32 = 10_000;

/// Default grace period for in-flight packets while draining (milliseconds)
pub const DEFAULT_GRACE_MS: u64 = 500;

/// Upper bound on the drain grace period (milliseconds)
pub const MAX_GRACE_MS: u64 = 10_000;

/// Default socket read timeout for the receive loop (milliseconds)
pub const DEFAULT_RECV_TIMEOUT_MS: u64 = 200;

/// Jitter smoothing divisor from RFC 3550 section 6.4.1
pub const JITTER_SMOOTHING: f64 = 16.0;

/// Minimum number of sequence numbers in the sliding loss window
pub const MIN_LOSS_WINDOW: u32 = 100;

/// Loss window length expressed in seconds of traffic
pub const LOSS_WINDOW_SECS: u32 = 10;

/// Minimum number of delay samples before the quality indicator is computed
pub const MIN_QUALITY_SAMPLES: usize = 3;

/// Histogram lower bound in microseconds
pub const HISTOGRAM_LOW_BOUND_US: u64 = 1;

/// Histogram upper bound in microseconds
pub const HISTOGRAM_HIGH_BOUND_US: u64 = 60_000_000;

/// Histogram significant digits for precision
pub const HISTOGRAM_SIGNIFICANT_DIGITS: u8 = 3;

/// Default loss ratio above which health is reported as degraded
pub const DEFAULT_LOSS_THRESHOLD: f64 = 0.05;

/// Packet intervals without an arrival before health is reported as degraded
pub const DEFAULT_SILENCE_MULTIPLE: u32 = 10;

/// Floor for the silence window in milliseconds
pub const MIN_SILENCE_WINDOW_MS: u64 = 1_000;

/// Default E-model burst ratio (1.0 = random loss)
pub const DEFAULT_BURST_RATIO: f64 = 1.0;

/// Mean opinion score considered good for voice
pub const GOOD_MOS: f64 = 4.0;

/// Mean opinion score below which calls are noticeably impaired
pub const FAIR_MOS: f64 = 3.6;

/// Progress bar tick interval in milliseconds
pub const PROGRESS_TICK_INTERVAL_MS: u64 = 100;
