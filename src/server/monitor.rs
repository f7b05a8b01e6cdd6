//! Reflector monitoring and status line display

use colored::*;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Time without packets before the reflector is shown as idle (milliseconds)
const IDLE_THRESHOLD_MS: u64 = 1_000;

/// Blink interval for the activity indicator (milliseconds)
const BLINK_INTERVAL_MS: u64 = 200;

#[derive(Debug, Default)]
struct Counters {
    received: AtomicU64,
    echoed: AtomicU64,
    malformed: AtomicU64,
    errors: AtomicU64,
    peers: AtomicU64,
}

/// Tracks reflector traffic with lock-free counters.
///
/// The receive loop only touches atomics; the status line is redrawn from a
/// background thread.
pub struct ServerMonitor {
    counters: Arc<Counters>,
    start_time: Instant,
    update_interval: Duration,
    running: Arc<AtomicBool>,
}

impl ServerMonitor {
    pub fn new(update_interval_ms: u64) -> Self {
        Self {
            counters: Arc::new(Counters::default()),
            start_time: Instant::now(),
            update_interval: Duration::from_millis(update_interval_ms),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Handle for the receive loop
    pub fn counters(&self) -> ServerCounters {
        ServerCounters {
            inner: Arc::clone(&self.counters),
        }
    }

    /// Start the background display thread; it runs until `stop_display`
    pub fn start_display(&self) -> JoinHandle<()> {
        let counters = Arc::clone(&self.counters);
        let running = Arc::clone(&self.running);
        let update_interval = self.update_interval;
        running.store(true, Ordering::Relaxed);

        thread::spawn(move || {
            let mut last_received = 0u64;
            let mut last_packet_time = Instant::now();
            let mut blink_state = false;
            let mut last_blink_time = Instant::now();

            while running.load(Ordering::Relaxed) {
                thread::sleep(update_interval);

                let received = counters.received.load(Ordering::Relaxed);
                let now = Instant::now();

                if received > last_received {
                    last_packet_time = now;
                }
                let is_idle = now.duration_since(last_packet_time)
                    >= Duration::from_millis(IDLE_THRESHOLD_MS);

                if is_idle {
                    blink_state = false;
                } else if now.duration_since(last_blink_time)
                    >= Duration::from_millis(BLINK_INTERVAL_MS)
                {
                    blink_state = !blink_state;
                    last_blink_time = now;
                }

                let indicator = Self::render_indicator(is_idle, blink_state);
                print!("\r{}", Self::status_line(&indicator, is_idle, &counters.snapshot()));
                std::io::Write::flush(&mut std::io::stdout()).ok();

                last_received = received;
            }
            println!();
        })
    }

    pub fn stop_display(&self) {
        self.running.store(false, Ordering::Relaxed);
    }

    fn render_indicator(is_idle: bool, blink_state: bool) -> String {
        if is_idle {
            "░".normal().to_string()
        } else if blink_state {
            "█".green().bold().to_string()
        } else {
            "░".green().to_string()
        }
    }

    fn status_line(indicator: &str, is_idle: bool, stats: &ServerStats) -> String {
        let status = if is_idle { "IDLE" } else { "ACTIVE" };
        let errors = if stats.errors > 0 {
            stats.errors.to_string().red().to_string()
        } else {
            stats.errors.to_string()
        };
        format!(
            "{} [{}] Peers: {} | Received: {} | Echoed: {} | Malformed: {} | Errors: {}",
            indicator, status, stats.peers, stats.packets_received, stats.packets_echoed,
            stats.malformed, errors
        )
    }

    /// Totals since the monitor was created
    pub fn stats(&self) -> ServerStats {
        ServerStats {
            elapsed: self.start_time.elapsed(),
            ..self.counters.snapshot()
        }
    }
}

impl Counters {
    fn snapshot(&self) -> ServerStats {
        ServerStats {
            packets_received: self.received.load(Ordering::Relaxed),
            packets_echoed: self.echoed.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            peers: self.peers.load(Ordering::Relaxed),
            elapsed: Duration::ZERO,
        }
    }
}

/// Cheap handle for updating counters from the receive loop
#[derive(Debug, Clone, Default)]
pub struct ServerCounters {
    inner: Arc<Counters>,
}

impl ServerCounters {
    #[inline]
    pub fn increment_received(&self) {
        self.inner.received.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn increment_echoed(&self) {
        self.inner.echoed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn increment_malformed(&self) {
        self.inner.malformed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn increment_error(&self) {
        self.inner.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of peers currently tracked
    pub fn set_peers(&self, peers: usize) {
        self.inner.peers.store(peers as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ServerStats {
        self.inner.snapshot()
    }
}

/// Reflector totals
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerStats {
    pub packets_received: u64,
    pub packets_echoed: u64,
    pub malformed: u64,
    pub errors: u64,
    pub peers: u64,
    pub elapsed: Duration,
}
