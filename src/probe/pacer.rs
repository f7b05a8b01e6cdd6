//! Drift-corrected packet pacing
//!
//! Deadlines are computed from a fixed origin (`origin + index * interval`)
//! rather than from the previous tick, so scheduling latency never accumulates.
//! A consumer that falls behind gets a single tick reporting how many slots
//! were skipped, and the schedule resumes at the next slot in the future.

use crate::probe::constants::MAX_RATE;
use crate::probe::error::ConfigurationError;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// One "send now" event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tick {
    /// Slot number since the pacer was (re)started
    pub index: u64,
    /// Scheduled instant of this slot
    pub deadline: Instant,
    /// Slots skipped because the consumer was late
    pub missed: u64,
}

#[derive(Debug, Default)]
struct PacerShared {
    stopped: Mutex<bool>,
    wake: Condvar,
}

/// Thread-safe stop control for a running pacer
#[derive(Debug, Clone)]
pub struct PacerHandle {
    shared: Arc<PacerShared>,
}

impl PacerHandle {
    /// Stop the pacer. Once this returns no further tick is produced.
    pub fn stop(&self) {
        let mut stopped = self.shared.stopped.lock();
        *stopped = true;
        self.shared.wake.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        *self.shared.stopped.lock()
    }
}

#[derive(Debug)]
pub struct Pacer {
    interval: Duration,
    origin: Instant,
    next_index: u64,
    shared: Arc<PacerShared>,
}

impl Pacer {
    /// Create a pacer producing `rate` ticks per second, anchored at now
    pub fn new(rate: u32) -> Result<Self, ConfigurationError> {
        if rate == 0 {
            return Err(ConfigurationError::NonPositiveRate);
        }
        if rate > MAX_RATE {
            return Err(ConfigurationError::InvalidSetting {
                name: "rate",
                reason: format!("must not exceed {} packets per second", MAX_RATE),
            });
        }
        Ok(Self::with_interval(Duration::from_nanos(
            1_000_000_000 / u64::from(rate),
        )))
    }

    pub fn with_interval(interval: Duration) -> Self {
        debug!(interval_us = interval.as_micros() as u64, "Pacer created");
        Self {
            interval: interval.max(Duration::from_nanos(1)),
            origin: Instant::now(),
            next_index: 0,
            shared: Arc::new(PacerShared::default()),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn handle(&self) -> PacerHandle {
        PacerHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Re-anchor the schedule at now and clear a previous stop
    pub fn restart(&mut self) {
        *self.shared.stopped.lock() = false;
        self.origin = Instant::now();
        self.next_index = 0;
        debug!("Pacer restarted");
    }

    fn deadline_of(&self, index: u64) -> Instant {
        let offset = self.interval.as_nanos().saturating_mul(u128::from(index));
        self.origin + Duration::from_nanos(offset.min(u128::from(u64::MAX)) as u64)
    }

    /// Block until the next slot is due. Returns `None` once stopped.
    pub fn next_tick(&mut self) -> Option<Tick> {
        let deadline = self.deadline_of(self.next_index);

        let mut stopped = self.shared.stopped.lock();
        loop {
            if *stopped {
                return None;
            }
            if Instant::now() >= deadline {
                break;
            }
            self.shared.wake.wait_until(&mut stopped, deadline);
        }

        // The stop flag is still held here, so a concurrent stop() cannot
        // complete until this tick has been produced.
        let behind = Instant::now().saturating_duration_since(deadline);
        let missed = (behind.as_nanos() / self.interval.as_nanos()) as u64;
        if missed > 0 {
            debug!(index = self.next_index, missed = missed, "Pacer coalesced missed ticks");
        }

        let tick = Tick {
            index: self.next_index,
            deadline,
            missed,
        };
        self.next_index += 1 + missed;
        Some(tick)
    }

    pub fn ticks(&mut self) -> Ticks<'_> {
        Ticks { pacer: self }
    }
}

/// Blocking iterator over pacer ticks
pub struct Ticks<'a> {
    pacer: &'a mut Pacer,
}

impl Iterator for Ticks<'_> {
    type Item = Tick;

    fn next(&mut self) -> Option<Tick> {
        self.pacer.next_tick()
    }
}
