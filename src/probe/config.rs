use crate::probe::constants::*;
use crate::probe::error::ConfigurationError;
use crate::probe::health::HealthPolicy;
use crate::probe::statistics::{DelayMode, StatsConfig};
use crate::protocol::CodecProfile;
use clap::Parser;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

/// Validated settings for one probing session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub target: SocketAddr,
    pub profile: CodecProfile,
    /// Packets per second
    pub rate: u32,
    /// `None` runs until cancelled
    pub duration: Option<Duration>,
    pub report_interval: Duration,
    pub grace: Duration,
    pub warmup: Duration,
    pub burst_ratio: f64,
    pub delay_mode: DelayMode,
    pub recv_timeout: Duration,
    pub health: HealthPolicy,
}

impl SessionConfig {
    /// Defaults for `profile`, sending at the codec's natural rate forever
    pub fn new(target: SocketAddr, profile: CodecProfile) -> Self {
        Self {
            target,
            profile,
            rate: profile.packets_per_second(),
            duration: None,
            report_interval: Duration::from_secs(DEFAULT_REPORT_INTERVAL_SECS),
            grace: Duration::from_millis(DEFAULT_GRACE_MS),
            warmup: Duration::from_secs(DEFAULT_WARMUP_SECS),
            burst_ratio: DEFAULT_BURST_RATIO,
            delay_mode: DelayMode::RoundTrip,
            recv_timeout: Duration::from_millis(DEFAULT_RECV_TIMEOUT_MS),
            health: HealthPolicy::default(),
        }
    }

    pub fn with_rate(mut self, rate: u32) -> Self {
        self.rate = rate;
        self
    }

    /// Zero means unlimited
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = (!duration.is_zero()).then_some(duration);
        self
    }

    pub fn with_report_interval(mut self, interval: Duration) -> Self {
        self.report_interval = interval;
        self
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn with_warmup(mut self, warmup: Duration) -> Self {
        self.warmup = warmup;
        self
    }

    pub fn with_delay_mode(mut self, mode: DelayMode) -> Self {
        self.delay_mode = mode;
        self
    }

    pub fn with_health(mut self, policy: HealthPolicy) -> Self {
        self.health = policy;
        self
    }

    pub fn packet_interval(&self) -> Duration {
        Duration::from_nanos(1_000_000_000 / u64::from(self.rate.max(1)))
    }

    pub fn stats_config(&self) -> StatsConfig {
        StatsConfig {
            profile: self.profile,
            rate: self.rate,
            delay_mode: self.delay_mode,
            warmup: self.warmup,
            burst_ratio: self.burst_ratio,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        debug!("Validating session configuration");
        if self.rate == 0 {
            return Err(ConfigurationError::NonPositiveRate);
        }
        if self.rate > MAX_RATE {
            return Err(invalid(
                "rate",
                format!("must not exceed {} packets per second", MAX_RATE),
            ));
        }
        if self.target.port() == 0 || self.target.ip().is_unspecified() {
            return Err(ConfigurationError::InvalidTarget {
                target: self.target.to_string(),
                reason: "address and port must be specified".into(),
            });
        }
        if self.report_interval.is_zero() {
            return Err(invalid("report_interval", "must be > 0"));
        }
        if self.recv_timeout.is_zero() {
            return Err(invalid("recv_timeout", "must be > 0"));
        }
        if self.grace > Duration::from_millis(MAX_GRACE_MS) {
            return Err(invalid(
                "grace",
                format!("must not exceed {} ms", MAX_GRACE_MS),
            ));
        }
        if !(self.burst_ratio.is_finite() && self.burst_ratio > 0.0) {
            return Err(invalid("burst_ratio", "must be a positive number"));
        }
        if !(0.0..=1.0).contains(&self.health.loss_threshold) {
            return Err(invalid("loss_threshold", "must be between 0 and 1"));
        }
        debug!("Session configuration validated successfully");
        Ok(())
    }
}

fn invalid(name: &'static str, reason: impl Into<String>) -> ConfigurationError {
    ConfigurationError::InvalidSetting {
        name,
        reason: reason.into(),
    }
}

/// Resolve `host:port` into a socket address
pub fn resolve_target(host: &str, port: u16) -> Result<SocketAddr, ConfigurationError> {
    let target = format!("{}:{}", host, port);
    let invalid_target = |reason: String| ConfigurationError::InvalidTarget {
        target: target.clone(),
        reason,
    };
    if host.trim().is_empty() {
        return Err(invalid_target("host is empty".into()));
    }
    (host, port)
        .to_socket_addrs()
        .map_err(|e| invalid_target(e.to_string()))?
        .next()
        .ok_or_else(|| invalid_target("no addresses found".into()))
}

#[derive(Parser, Debug, Clone)]
#[command(name = "voip-probe-client")]
#[command(about = "Synthetic VoIP traffic probe: delay, jitter, loss and MOS")]
pub struct ClientConfig {
    /// Reflector host to probe
    #[arg(long, env = "VOIP_PROBE_HOST", default_value = "127.0.0.1")]
    pub host: String,

    /// Reflector UDP port
    #[arg(long, env = "VOIP_PROBE_PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Probe this host's own UDP stack instead of a remote reflector
    #[arg(long)]
    pub loopback: bool,

    /// Codec profile (g711, g729, opus)
    #[arg(long, env = "VOIP_PROBE_CODEC", default_value = "g711")]
    pub codec: String,

    /// Packets per second (defaults to the codec's packetization rate)
    #[arg(long, env = "VOIP_PROBE_PPS")]
    pub pps: Option<u32>,

    /// Run duration in seconds, 0 = until interrupted
    #[arg(long, env = "VOIP_PROBE_DURATION", default_value_t = 0)]
    pub duration: u64,

    /// Interval between interim reports in seconds
    #[arg(long, default_value_t = DEFAULT_REPORT_INTERVAL_SECS)]
    pub report_every: u64,

    /// Seconds before the MOS estimate is reported
    #[arg(long, default_value_t = DEFAULT_WARMUP_SECS)]
    pub warmup: u64,

    /// E-model burst ratio (1.0 = random loss)
    #[arg(long, default_value_t = DEFAULT_BURST_RATIO)]
    pub burst_ratio: f64,

    /// Socket read timeout in milliseconds
    #[arg(long, default_value_t = DEFAULT_RECV_TIMEOUT_MS)]
    pub timeout_ms: u64,

    /// Grace period for in-flight packets at the end of a run, in milliseconds
    #[arg(long, default_value_t = DEFAULT_GRACE_MS)]
    pub grace_ms: u64,

    /// Loss ratio above which health is reported as degraded
    #[arg(long, default_value_t = DEFAULT_LOSS_THRESHOLD)]
    pub loss_threshold: f64,

    /// Write snapshots as CSV to this file
    #[arg(long, env = "VOIP_PROBE_CSV")]
    pub csv: Option<PathBuf>,

    /// Write snapshots as JSON lines to this file
    #[arg(long, env = "VOIP_PROBE_JSON")]
    pub json: Option<PathBuf>,

    /// Disable the live progress line
    #[arg(long)]
    pub quiet: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Log format (text or json)
    #[arg(long, default_value = "text", value_parser = ["text", "json"])]
    pub log_format: String,
}

impl ClientConfig {
    /// Returns true if JSON format logging is enabled
    pub fn is_json_format(&self) -> bool {
        self.log_format.to_lowercase() == "json"
    }

    /// Validate flags and build the session configuration.
    ///
    /// In loopback mode the target is filled in once the socket is bound.
    pub fn session_config(&self, loopback_target: Option<SocketAddr>) -> Result<SessionConfig, ConfigurationError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.to_lowercase().as_str()) {
            return Err(invalid(
                "log_level",
                format!("must be one of: {}", valid_levels.join(", ")),
            ));
        }

        let profile = CodecProfile::resolve(&self.codec)?;
        let target = match loopback_target {
            Some(addr) => addr,
            None => resolve_target(&self.host, self.port)?,
        };

        let config = SessionConfig {
            target,
            profile,
            rate: self.pps.unwrap_or_else(|| profile.packets_per_second()),
            duration: (self.duration > 0).then(|| Duration::from_secs(self.duration)),
            report_interval: Duration::from_secs(self.report_every),
            grace: Duration::from_millis(self.grace_ms),
            warmup: Duration::from_secs(self.warmup),
            burst_ratio: self.burst_ratio,
            delay_mode: DelayMode::RoundTrip,
            recv_timeout: Duration::from_millis(self.timeout_ms),
            health: HealthPolicy {
                loss_threshold: self.loss_threshold,
                ..HealthPolicy::default()
            },
        };
        config.validate()?;
        Ok(config)
    }
}
