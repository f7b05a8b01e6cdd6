//! Liveness status derived from session state
//!
//! Nothing here owns state of its own: every `status()` call collects the
//! current inputs from the session and runs them through `HealthPolicy`.

use crate::probe::constants::*;
use crate::probe::session::SessionState;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Unknown,
    Healthy,
    Degraded,
    Unhealthy,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            HealthStatus::Unknown => "unknown",
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
        };
        f.write_str(label)
    }
}

/// Inputs to a health assessment, gathered at call time
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HealthProbe {
    pub state: SessionState,
    pub transport_ok: bool,
    pub packets_sent: u64,
    pub since_start: Option<Duration>,
    pub since_last_send: Option<Duration>,
    pub since_last_receive: Option<Duration>,
    pub loss_ratio: f64,
    pub packet_interval: Duration,
}

/// Thresholds for degraded health
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HealthPolicy {
    pub loss_threshold: f64,
    /// Packet intervals without an arrival before degrading
    pub silence_multiple: u32,
    pub min_silence: Duration,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            loss_threshold: DEFAULT_LOSS_THRESHOLD,
            silence_multiple: DEFAULT_SILENCE_MULTIPLE,
            min_silence: Duration::from_millis(MIN_SILENCE_WINDOW_MS),
        }
    }
}

impl HealthPolicy {
    pub fn silence_window(&self, packet_interval: Duration) -> Duration {
        (packet_interval * self.silence_multiple).max(self.min_silence)
    }

    pub fn assess(&self, probe: &HealthProbe) -> HealthStatus {
        if probe.state == SessionState::Failed || !probe.transport_ok {
            return HealthStatus::Unhealthy;
        }
        if !probe.state.is_active() || probe.packets_sent == 0 {
            return HealthStatus::Unknown;
        }
        if probe.loss_ratio > self.loss_threshold {
            return HealthStatus::Degraded;
        }

        let window = self.silence_window(probe.packet_interval);
        if probe.state == SessionState::Running
            && probe.since_last_send.is_some_and(|d| d > window)
        {
            return HealthStatus::Degraded;
        }
        match probe.since_last_receive {
            Some(silence) if silence > window => HealthStatus::Degraded,
            Some(_) => HealthStatus::Healthy,
            None if probe.since_start.is_some_and(|d| d > window) => HealthStatus::Degraded,
            None => HealthStatus::Unknown,
        }
    }
}

/// Something the monitor can query for current inputs
pub trait HealthSource: Send + Sync {
    fn health_probe(&self) -> HealthProbe;
}

/// Polled by an external liveness or readiness check
#[derive(Clone)]
pub struct HealthMonitor {
    policy: HealthPolicy,
    source: Arc<dyn HealthSource>,
}

impl HealthMonitor {
    pub fn new(policy: HealthPolicy, source: Arc<dyn HealthSource>) -> Self {
        Self { policy, source }
    }

    pub fn status(&self) -> HealthStatus {
        self.policy.assess(&self.source.health_probe())
    }

    pub fn policy(&self) -> &HealthPolicy {
        &self.policy
    }
}

/// Lock-free record of when the send and receive paths last made progress
#[derive(Debug)]
pub struct Activity {
    origin: Instant,
    started: AtomicU64,
    last_send: AtomicU64,
    last_receive: AtomicU64,
}

impl Activity {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            started: AtomicU64::new(0),
            last_send: AtomicU64::new(0),
            last_receive: AtomicU64::new(0),
        }
    }

    // 0 means "never"; recorded instants are stored as nanoseconds + 1
    fn stamp(&self, slot: &AtomicU64) {
        let nanos = self.origin.elapsed().as_nanos() as u64;
        slot.store(nanos.saturating_add(1), Ordering::Relaxed);
    }

    fn since(&self, slot: &AtomicU64) -> Option<Duration> {
        match slot.load(Ordering::Relaxed) {
            0 => None,
            stamped => {
                let at = Duration::from_nanos(stamped - 1);
                Some(self.origin.elapsed().saturating_sub(at))
            }
        }
    }

    pub fn mark_started(&self) {
        self.stamp(&self.started);
    }

    #[inline]
    pub fn record_send(&self) {
        self.stamp(&self.last_send);
    }

    #[inline]
    pub fn record_receive(&self) {
        self.stamp(&self.last_receive);
    }

    pub fn since_start(&self) -> Option<Duration> {
        self.since(&self.started)
    }

    pub fn since_last_send(&self) -> Option<Duration> {
        self.since(&self.last_send)
    }

    pub fn since_last_receive(&self) -> Option<Duration> {
        self.since(&self.last_receive)
    }
}

impl Default for Activity {
    fn default() -> Self {
        Self::new()
    }
}
