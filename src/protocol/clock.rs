//! Timestamp source for probe packets
//!
//! A `Clock` reads wall time once when it is created and advances from there
//! with the monotonic clock, so timestamps stay comparable with a peer's wall
//! clock while never stepping backwards inside the process.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Nanoseconds since the Unix epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timestamp(pub u64);

impl Timestamp {
    pub fn as_nanos(self) -> u64 {
        self.0
    }

    /// Signed difference `self - earlier` in nanoseconds
    pub fn delta_ns(self, earlier: Timestamp) -> i64 {
        self.0.wrapping_sub(earlier.0) as i64
    }

    /// Signed difference `self - earlier` in milliseconds
    pub fn delta_ms(self, earlier: Timestamp) -> f64 {
        self.delta_ns(earlier) as f64 / 1_000_000.0
    }

    pub fn saturating_add(self, duration: Duration) -> Timestamp {
        Timestamp(self.0.saturating_add(duration.as_nanos() as u64))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Clock {
    anchor: Instant,
    anchor_wall_ns: u64,
}

impl Clock {
    pub fn new() -> Self {
        let anchor_wall_ns = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        Self {
            anchor: Instant::now(),
            anchor_wall_ns,
        }
    }

    pub fn now(&self) -> Timestamp {
        self.at(Instant::now())
    }

    /// Timestamp corresponding to a monotonic instant
    pub fn at(&self, instant: Instant) -> Timestamp {
        let offset = instant.saturating_duration_since(self.anchor);
        Timestamp(self.anchor_wall_ns.saturating_add(offset.as_nanos() as u64))
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}
