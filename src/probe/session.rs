//! One probing run: pacing, sending, receiving and reporting
//!
//! A session owns three threads once started. The send thread drives the
//! pacer and the sender, the receive thread decodes echoes into the stats
//! engine, and the supervisor enforces the duration, writes interim reports
//! and performs the drain. The stats engine sits behind a single mutex that
//! both I/O paths go through.

use crate::probe::config::SessionConfig;
use crate::probe::error::{ProbeError, Result};
use crate::probe::health::{Activity, HealthMonitor, HealthProbe, HealthSource};
use crate::probe::pacer::{Pacer, PacerHandle};
use crate::probe::sender::{SendOutcome, Sender};
use crate::probe::sink::ResultsSink;
use crate::probe::socket::{is_idle_receive, Transport};
use crate::probe::statistics::{MetricSnapshot, StatsEngine};
use crate::protocol::{Clock, ProbePacket, MAX_PACKET_SIZE};
use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::Serialize;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Running,
    Draining,
    Stopped,
    Failed,
}

impl SessionState {
    /// Packets may still be flowing
    pub fn is_active(self) -> bool {
        matches!(self, SessionState::Running | SessionState::Draining)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Stopped | SessionState::Failed)
    }
}

#[derive(Debug)]
struct Lifecycle {
    state: SessionState,
    cancel_requested: bool,
    /// Set once every worker thread has exited
    finished: bool,
    failure: Option<ProbeError>,
    final_snapshot: Option<MetricSnapshot>,
}

struct Shared<T: Transport> {
    config: SessionConfig,
    transport: Arc<T>,
    clock: Clock,
    engine: Mutex<StatsEngine>,
    activity: Activity,
    lifecycle: Mutex<Lifecycle>,
    changed: Condvar,
    pacer: PacerHandle,
    sink: Mutex<Box<dyn ResultsSink>>,
    sink_errors: AtomicU64,
    receiving: AtomicBool,
    transport_ok: AtomicBool,
    // sequence + 1, 0 while nothing has been sent
    last_sequence: AtomicU64,
}

impl<T: Transport + 'static> Shared<T> {
    fn state(&self) -> SessionState {
        self.lifecycle.lock().state
    }

    fn last_sequence(&self) -> Option<u32> {
        match self.last_sequence.load(Ordering::Relaxed) {
            0 => None,
            stored => Some((stored - 1) as u32),
        }
    }

    /// Move to `Failed` unless already terminal; the first failure wins
    fn fail(&self, error: ProbeError) {
        let mut life = self.lifecycle.lock();
        if life.state.is_terminal() {
            return;
        }
        error!(error = %error, state = ?life.state, "Session failed");
        if error.is_fatal_transport() {
            self.transport_ok.store(false, Ordering::Relaxed);
        }
        life.state = SessionState::Failed;
        life.failure = Some(error);
        self.pacer.stop();
        self.changed.notify_all();
    }

    fn write_snapshot(&self, snapshot: &MetricSnapshot) {
        let mut sink = self.sink.lock();
        if let Err(e) = sink.write(snapshot) {
            self.sink_errors.fetch_add(1, Ordering::Relaxed);
            warn!(error = %e, "Failed to write snapshot to sink");
        }
    }

    fn flush_sink(&self) {
        if let Err(e) = self.sink.lock().flush() {
            self.sink_errors.fetch_add(1, Ordering::Relaxed);
            warn!(error = %e, "Failed to flush sink");
        }
    }

    fn send_loop(&self, mut pacer: Pacer) {
        debug!(interval_us = pacer.interval().as_micros() as u64, "Send loop started");
        let mut sender = Sender::new(Arc::clone(&self.transport), self.config.profile, self.clock);

        while pacer.next_tick().is_some() {
            let outcome = sender.on_tick();
            if let Some(seq) = sender.last_sequence() {
                self.last_sequence.store(u64::from(seq) + 1, Ordering::Relaxed);
            }
            match outcome {
                Ok(SendOutcome::Sent { .. }) => {
                    self.engine.lock().on_packet_sent();
                    self.activity.record_send();
                }
                Ok(SendOutcome::Dropped { .. }) => self.engine.lock().on_send_failure(),
                Err(e) => {
                    self.fail(e);
                    break;
                }
            }
        }
        debug!(
            sent = sender.packets_sent(),
            failures = sender.send_failures(),
            "Send loop finished"
        );
    }

    fn receive_loop(&self) {
        debug!("Receive loop started");
        let mut buf = [0u8; MAX_PACKET_SIZE];

        while self.receiving.load(Ordering::Acquire) {
            let len = match self.transport.recv_datagram(&mut buf) {
                Ok(len) => len,
                Err(e) if is_idle_receive(&e) => continue,
                Err(e) => {
                    self.fail(ProbeError::FatalTransport {
                        source: e,
                        last_sequence: self.last_sequence(),
                        elapsed: self.activity.since_start().unwrap_or_default(),
                    });
                    break;
                }
            };
            let arrival = self.clock.now();

            match ProbePacket::decode(&buf[..len]) {
                Ok(packet) => {
                    self.engine.lock().on_packet_arrival(&packet, arrival);
                    self.activity.record_receive();
                }
                Err(e) => {
                    debug!(bytes = len, error = %e, "Discarding malformed datagram");
                    self.engine.lock().on_malformed();
                }
            }
        }
        debug!("Receive loop finished");
    }

    /// Wait for the duration, a cancel or a failure, reporting along the way
    fn run_until_done(&self) {
        let started = Instant::now();
        let deadline = self.config.duration.map(|d| started + d);
        let interval = self.config.report_interval;
        let mut next_report = started + interval;

        let mut life = self.lifecycle.lock();
        loop {
            if life.cancel_requested || life.state == SessionState::Failed {
                break;
            }
            let now = Instant::now();
            if deadline.is_some_and(|d| now >= d) {
                debug!("Session duration reached");
                break;
            }
            if now >= next_report {
                MutexGuard::unlocked(&mut life, || {
                    let snapshot = self.engine.lock().snapshot();
                    self.write_snapshot(&snapshot);
                });
                while next_report <= now {
                    next_report += interval;
                }
                continue;
            }
            let wake = deadline.map_or(next_report, |d| d.min(next_report));
            self.changed.wait_until(&mut life, wake);
        }
    }

    /// Let in-flight echoes arrive, cut short by a failure
    fn grace_period(&self) {
        let until = Instant::now() + self.config.grace;
        let mut life = self.lifecycle.lock();
        while life.state != SessionState::Failed && Instant::now() < until {
            self.changed.wait_until(&mut life, until);
        }
    }

    fn supervise(self: Arc<Self>, pacer: Pacer) {
        let send_shared = Arc::clone(&self);
        let send = thread::Builder::new()
            .name("probe-send".into())
            .spawn(move || send_shared.send_loop(pacer));
        let recv_shared = Arc::clone(&self);
        let recv = thread::Builder::new()
            .name("probe-recv".into())
            .spawn(move || recv_shared.receive_loop());

        let (send, recv) = match (send, recv) {
            (Ok(send), Ok(recv)) => (Some(send), Some(recv)),
            (send, recv) => {
                if let Err(source) = &send {
                    self.fail(spawn_error("send", source));
                }
                if let Err(source) = &recv {
                    self.fail(spawn_error("receive", source));
                }
                (send.ok(), recv.ok())
            }
        };

        if send.is_some() && recv.is_some() {
            self.run_until_done();
        }

        {
            let mut life = self.lifecycle.lock();
            if life.state == SessionState::Running {
                life.state = SessionState::Draining;
                info!("Draining session");
                self.changed.notify_all();
            }
        }
        self.pacer.stop();
        join_worker(send, "send");

        self.grace_period();
        self.receiving.store(false, Ordering::Release);
        join_worker(recv, "receive");

        let snapshot = self.engine.lock().snapshot();
        self.write_snapshot(&snapshot);
        self.flush_sink();

        info!(
            sent = snapshot.packets_sent,
            received = snapshot.packets_received,
            loss_pct = snapshot.loss_percent(),
            jitter_ms = snapshot.jitter_ms,
            mos = ?snapshot.mos(),
            "Session finished"
        );

        let mut life = self.lifecycle.lock();
        if life.state != SessionState::Failed {
            life.state = SessionState::Stopped;
        }
        life.final_snapshot = Some(snapshot);
        life.finished = true;
        self.changed.notify_all();
    }
}

impl<T: Transport + 'static> HealthSource for Shared<T> {
    fn health_probe(&self) -> HealthProbe {
        let state = self.state();
        let (packets_sent, loss_ratio) = {
            let engine = self.engine.lock();
            (engine.packets_sent(), engine.loss_ratio())
        };
        HealthProbe {
            state,
            transport_ok: self.transport_ok.load(Ordering::Relaxed),
            packets_sent,
            since_start: self.activity.since_start(),
            since_last_send: self.activity.since_last_send(),
            since_last_receive: self.activity.since_last_receive(),
            loss_ratio,
            packet_interval: self.config.packet_interval(),
        }
    }
}

fn spawn_error(name: &'static str, source: &io::Error) -> ProbeError {
    ProbeError::Spawn {
        name,
        source: io::Error::new(source.kind(), source.to_string()),
    }
}

fn join_worker(handle: Option<JoinHandle<()>>, name: &str) {
    if let Some(handle) = handle {
        if handle.join().is_err() {
            error!(thread = name, "Worker thread panicked");
        }
    }
}

/// Reproduce a stored failure for every caller of `wait`
fn replay(error: &ProbeError) -> ProbeError {
    let copy_io = |e: &io::Error| io::Error::new(e.kind(), e.to_string());
    match error {
        ProbeError::Configuration(e) => ProbeError::Configuration(e.clone()),
        ProbeError::FatalTransport {
            source,
            last_sequence,
            elapsed,
        } => ProbeError::FatalTransport {
            source: copy_io(source),
            last_sequence: *last_sequence,
            elapsed: *elapsed,
        },
        ProbeError::InvalidState(state) => ProbeError::InvalidState(*state),
        ProbeError::Timeout(d) => ProbeError::Timeout(*d),
        ProbeError::Socket(msg) => ProbeError::Socket(msg.clone()),
        ProbeError::Statistics(msg) => ProbeError::Statistics(msg.clone()),
        ProbeError::Spawn { name, source } => ProbeError::Spawn {
            name: *name,
            source: copy_io(source),
        },
    }
}

/// A probing session over one transport.
///
/// Every method takes `&self`, so a session can be shared between threads
/// behind an `Arc`.
pub struct Session<T: Transport + 'static> {
    shared: Arc<Shared<T>>,
    pacer: Mutex<Option<Pacer>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Transport + 'static> Session<T> {
    /// Validate `config` and prepare an idle session
    pub fn new(config: SessionConfig, transport: Arc<T>, sink: Box<dyn ResultsSink>) -> Result<Self> {
        config.validate()?;
        let pacer = Pacer::new(config.rate)?;
        let engine = StatsEngine::new(config.stats_config())?;
        transport
            .set_timeout(config.recv_timeout)
            .map_err(|e| ProbeError::Socket(format!("Failed to set read timeout: {}", e)))?;

        info!(
            target_addr = %config.target,
            codec = config.profile.name,
            rate = config.rate,
            duration_secs = ?config.duration.map(|d| d.as_secs_f64()),
            "Session created"
        );

        let shared = Arc::new(Shared {
            pacer: pacer.handle(),
            config,
            transport,
            clock: Clock::new(),
            engine: Mutex::new(engine),
            activity: Activity::new(),
            lifecycle: Mutex::new(Lifecycle {
                state: SessionState::Idle,
                cancel_requested: false,
                finished: false,
                failure: None,
                final_snapshot: None,
            }),
            changed: Condvar::new(),
            sink: Mutex::new(sink),
            sink_errors: AtomicU64::new(0),
            receiving: AtomicBool::new(false),
            transport_ok: AtomicBool::new(true),
            last_sequence: AtomicU64::new(0),
        });

        Ok(Self {
            shared,
            pacer: Mutex::new(Some(pacer)),
            supervisor: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }

    /// Begin sending. A no-op while running or draining.
    pub fn start(&self) -> Result<()> {
        let mut life = self.shared.lifecycle.lock();
        match life.state {
            SessionState::Idle => {}
            SessionState::Running | SessionState::Draining => return Ok(()),
            state => return Err(ProbeError::InvalidState(state)),
        }
        let Some(mut pacer) = self.pacer.lock().take() else {
            return Err(ProbeError::InvalidState(life.state));
        };

        self.shared.engine.lock().reset();
        self.shared.activity.mark_started();
        self.shared.receiving.store(true, Ordering::Release);
        pacer.restart();
        life.state = SessionState::Running;
        drop(life);

        let shared = Arc::clone(&self.shared);
        match thread::Builder::new()
            .name("probe-supervisor".into())
            .spawn(move || shared.supervise(pacer))
        {
            Ok(handle) => {
                *self.supervisor.lock() = Some(handle);
                info!("Session started");
                Ok(())
            }
            Err(source) => {
                self.shared.receiving.store(false, Ordering::Release);
                self.shared.fail(spawn_error("supervisor", &source));
                let mut life = self.shared.lifecycle.lock();
                life.finished = true;
                self.shared.changed.notify_all();
                Err(ProbeError::Spawn {
                    name: "supervisor",
                    source,
                })
            }
        }
    }

    /// Request a drain without blocking. An idle session stops immediately.
    pub fn cancel(&self) {
        let mut life = self.shared.lifecycle.lock();
        match life.state {
            SessionState::Idle => {
                life.state = SessionState::Stopped;
                life.final_snapshot = Some(self.shared.engine.lock().snapshot());
                life.finished = true;
                info!("Session cancelled before start");
                self.shared.changed.notify_all();
            }
            SessionState::Running if !life.cancel_requested => {
                life.cancel_requested = true;
                info!("Session cancellation requested");
                self.shared.changed.notify_all();
            }
            _ => {}
        }
    }

    /// Cancel and wait for the drain to complete
    pub fn stop(&self) -> Result<MetricSnapshot> {
        self.cancel();
        self.wait()
    }

    /// Block until the session is terminal
    pub fn wait(&self) -> Result<MetricSnapshot> {
        let mut life = self.shared.lifecycle.lock();
        while !life.finished {
            self.shared.changed.wait(&mut life);
        }
        let outcome = Self::outcome(&life);
        drop(life);
        self.reap();
        outcome
    }

    /// Like `wait`, giving up with `ProbeError::Timeout` after `timeout`
    pub fn wait_timeout(&self, timeout: Duration) -> Result<MetricSnapshot> {
        let until = Instant::now() + timeout;
        let mut life = self.shared.lifecycle.lock();
        while !life.finished {
            if self.shared.changed.wait_until(&mut life, until).timed_out() && !life.finished {
                return Err(ProbeError::Timeout(timeout));
            }
        }
        let outcome = Self::outcome(&life);
        drop(life);
        self.reap();
        outcome
    }

    fn outcome(life: &Lifecycle) -> Result<MetricSnapshot> {
        if let Some(failure) = &life.failure {
            return Err(replay(failure));
        }
        life.final_snapshot
            .clone()
            .ok_or(ProbeError::InvalidState(life.state))
    }

    fn reap(&self) {
        if let Some(handle) = self.supervisor.lock().take() {
            join_worker(Some(handle), "supervisor");
        }
    }

    /// Current metrics, or the final ones once terminal
    pub fn snapshot(&self) -> MetricSnapshot {
        if let Some(snapshot) = &self.shared.lifecycle.lock().final_snapshot {
            return snapshot.clone();
        }
        self.shared.engine.lock().snapshot()
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    pub fn health(&self) -> HealthMonitor {
        let source: Arc<dyn HealthSource> = self.shared.clone();
        HealthMonitor::new(self.shared.config.health, source)
    }

    /// Snapshot writes or flushes that failed
    pub fn sink_errors(&self) -> u64 {
        self.shared.sink_errors.load(Ordering::Relaxed)
    }
}

impl<T: Transport + 'static> Drop for Session<T> {
    fn drop(&mut self) {
        self.cancel();
    }
}
