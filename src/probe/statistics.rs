//! Incremental delay, jitter and loss statistics
//!
//! Loss is derived only from gaps in the received sequence numbers. Jitter is
//! the RFC 3550 interarrival estimate, updated in arrival order. Delay samples
//! go into an HDR histogram for the distribution summary.

use crate::probe::constants::*;
use crate::probe::error::{ProbeError, Result};
use crate::probe::quality::{self, QualityEstimate};
use crate::protocol::{CodecProfile, ProbePacket, Timestamp};
use chrono::{DateTime, Utc};
use hdrhistogram::Histogram;
use serde::Serialize;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Sequence span tracked for duplicate detection, in loss windows
const TRACKED_SPAN_WINDOWS: u32 = 4;

/// What the measured `arrival - origin` delay represents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DelayMode {
    /// Packets were echoed back to the sender: delay is a round trip on one clock
    RoundTrip,
    /// Packets come from a remote sender: delay relies on comparable clocks
    OneWay,
}

#[derive(Debug, Clone)]
pub struct StatsConfig {
    pub profile: CodecProfile,
    pub rate: u32,
    pub delay_mode: DelayMode,
    pub warmup: Duration,
    pub burst_ratio: f64,
}

impl StatsConfig {
    pub fn new(profile: CodecProfile, delay_mode: DelayMode) -> Self {
        Self {
            profile,
            rate: profile.packets_per_second(),
            delay_mode,
            warmup: Duration::from_secs(DEFAULT_WARMUP_SECS),
            burst_ratio: DEFAULT_BURST_RATIO,
        }
    }

    fn effective_rate(&self) -> u32 {
        self.rate.clamp(1, MAX_RATE)
    }

    fn loss_window(&self) -> u32 {
        (self.effective_rate() * LOSS_WINDOW_SECS).max(MIN_LOSS_WINDOW)
    }

    fn recent_window(&self) -> usize {
        self.effective_rate() as usize
    }

    /// Sequence numbers kept in the duplicate bitmap; always covers the loss window
    fn tracked_span(&self) -> u32 {
        self.loss_window() * TRACKED_SPAN_WINDOWS
    }
}

/// How an arriving packet was classified
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arrival {
    InOrder,
    OutOfOrder,
    Duplicate,
}

/// Summary of the delay distribution in milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DelaySummary {
    pub min_ms: f64,
    pub mean_ms: f64,
    pub max_ms: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
}

/// Immutable point-in-time view of a session's metrics
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricSnapshot {
    pub timestamp: DateTime<Utc>,
    pub elapsed_secs: f64,
    pub codec: &'static str,
    pub delay_mode: DelayMode,
    pub jitter_ms: f64,
    pub last_delay_ms: Option<f64>,
    pub loss_ratio: f64,
    pub window_loss_ratio: f64,
    pub packets_sent: u64,
    pub packets_received: u64,
    pub packets_expected: u64,
    pub duplicates: u64,
    pub out_of_order: u64,
    pub malformed: u64,
    pub send_failures: u64,
    pub delay: Option<DelaySummary>,
    pub quality: Option<QualityEstimate>,
}

impl MetricSnapshot {
    pub fn loss_percent(&self) -> f64 {
        self.loss_ratio * 100.0
    }

    pub fn mos(&self) -> Option<f64> {
        self.quality.map(|q| q.mos)
    }
}

/// Running RFC 3550 state plus sequence bookkeeping
#[derive(Debug, Clone, Default)]
struct JitterAccumulator {
    previous_transit_ms: Option<f64>,
    previous_delta_ms: f64,
    smoothed_jitter_ms: f64,
    first_sequence: Option<u32>,
    highest_sequence: Option<u32>,
    received_count: u64,
    expected_count: u64,
}

impl JitterAccumulator {
    fn update_jitter(&mut self, transit_ms: f64) {
        if let Some(previous) = self.previous_transit_ms {
            let delta = transit_ms - previous;
            self.previous_delta_ms = delta;
            self.smoothed_jitter_ms += (delta.abs() - self.smoothed_jitter_ms) / JITTER_SMOOTHING;
        }
        self.previous_transit_ms = Some(transit_ms);
    }

    fn loss_ratio(&self) -> f64 {
        if self.expected_count == 0 {
            return 0.0;
        }
        (1.0 - self.received_count as f64 / self.expected_count as f64).max(0.0)
    }
}

/// Bitmap of received sequence numbers in `base..base + span`
#[derive(Debug, Clone)]
struct SeenSequences {
    base: u32,
    span: u32,
    words: Vec<u64>,
}

impl SeenSequences {
    fn new(span: u32) -> Self {
        Self {
            base: 0,
            span: span.max(128),
            words: Vec::new(),
        }
    }

    /// Mark `seq` as seen. `Some(true)` if it is new, `Some(false)` for a
    /// duplicate, `None` if it is older than the tracked span.
    fn insert(&mut self, seq: u32) -> Option<bool> {
        if seq < self.base {
            return None;
        }
        if seq - self.base >= self.span {
            self.advance(seq - self.span / 2);
        }

        let offset = (seq - self.base) as usize;
        let (word, bit) = (offset / 64, offset % 64);
        if word >= self.words.len() {
            self.words.resize(word + 1, 0);
        }
        let mask = 1u64 << bit;
        let fresh = self.words[word] & mask == 0;
        self.words[word] |= mask;
        Some(fresh)
    }

    fn contains(&self, seq: u32) -> bool {
        if seq < self.base {
            return false;
        }
        let offset = (seq - self.base) as usize;
        self.words
            .get(offset / 64)
            .is_some_and(|w| w & (1u64 << (offset % 64)) != 0)
    }

    fn advance(&mut self, new_base: u32) {
        let shift = ((new_base - self.base) / 64) as usize;
        let dropped = shift.min(self.words.len());
        self.words.drain(..dropped);
        self.base += (shift * 64) as u32;
        debug!(base = self.base, "Sequence tracking window advanced");
    }
}

/// Per-session statistics; owned by exactly one writer
pub struct StatsEngine {
    config: StatsConfig,
    acc: JitterAccumulator,
    seen: SeenSequences,
    delays: Histogram<u64>,
    recent_delays: VecDeque<f64>,
    last_delay_ms: Option<f64>,
    real_min_ms: f64,
    real_max_ms: f64,
    clamped_count: u64,
    duplicates: u64,
    out_of_order: u64,
    malformed: u64,
    packets_sent: u64,
    send_failures: u64,
    started: Instant,
}

impl StatsEngine {
    pub fn new(config: StatsConfig) -> Result<Self> {
        let delays = Histogram::<u64>::new_with_bounds(
            HISTOGRAM_LOW_BOUND_US,
            HISTOGRAM_HIGH_BOUND_US,
            HISTOGRAM_SIGNIFICANT_DIGITS,
        )
        .map_err(|e| ProbeError::Statistics(format!("Failed to create histogram: {}", e)))?;

        let recent = config.recent_window();
        let tracked_span = config.tracked_span();
        Ok(Self {
            config,
            acc: JitterAccumulator::default(),
            seen: SeenSequences::new(tracked_span),
            delays,
            recent_delays: VecDeque::with_capacity(recent),
            last_delay_ms: None,
            real_min_ms: f64::INFINITY,
            real_max_ms: f64::NEG_INFINITY,
            clamped_count: 0,
            duplicates: 0,
            out_of_order: 0,
            malformed: 0,
            packets_sent: 0,
            send_failures: 0,
            started: Instant::now(),
        })
    }

    pub fn config(&self) -> &StatsConfig {
        &self.config
    }

    /// Clear all accumulated state, keeping the configuration
    pub fn reset(&mut self) {
        self.acc = JitterAccumulator::default();
        self.seen = SeenSequences::new(self.config.tracked_span());
        self.delays.reset();
        self.recent_delays.clear();
        self.last_delay_ms = None;
        self.real_min_ms = f64::INFINITY;
        self.real_max_ms = f64::NEG_INFINITY;
        self.clamped_count = 0;
        self.duplicates = 0;
        self.out_of_order = 0;
        self.malformed = 0;
        self.packets_sent = 0;
        self.send_failures = 0;
        self.started = Instant::now();
    }

    pub fn on_packet_arrival(&mut self, packet: &ProbePacket, arrival: Timestamp) -> Arrival {
        let seq = packet.sequence.0;

        let kind = match self.seen.insert(seq) {
            Some(false) => {
                self.duplicates += 1;
                debug!(sequence = seq, "Duplicate packet ignored");
                return Arrival::Duplicate;
            }
            // Older than the tracked span: cannot be checked for duplication
            None => Arrival::OutOfOrder,
            Some(true) => match self.acc.highest_sequence {
                Some(highest) if seq < highest => Arrival::OutOfOrder,
                _ => Arrival::InOrder,
            },
        };

        self.acc.received_count += 1;
        match kind {
            Arrival::OutOfOrder => {
                self.out_of_order += 1;
                debug!(sequence = seq, "Out-of-order packet");
            }
            _ => self.acc.highest_sequence = Some(seq),
        }
        let first = self.acc.first_sequence.map_or(seq, |f| f.min(seq));
        self.acc.first_sequence = Some(first);
        if let Some(highest) = self.acc.highest_sequence {
            self.acc.expected_count = u64::from(highest - first) + 1;
        }

        let transit_ms = arrival.delta_ms(packet.origin);
        self.record_delay(transit_ms);
        self.acc.update_jitter(transit_ms);

        kind
    }

    fn record_delay(&mut self, delay_ms: f64) {
        self.last_delay_ms = Some(delay_ms);
        self.real_min_ms = self.real_min_ms.min(delay_ms);
        self.real_max_ms = self.real_max_ms.max(delay_ms);

        let micros = (delay_ms * 1000.0).round().max(0.0) as u64;
        let clamped = micros.clamp(HISTOGRAM_LOW_BOUND_US, HISTOGRAM_HIGH_BOUND_US);
        if clamped != micros {
            self.clamped_count += 1;
        }
        if let Err(e) = self.delays.record(clamped) {
            warn!(delay_us = micros, error = %e, "Failed to record delay");
        }

        if self.recent_delays.len() == self.config.recent_window() {
            self.recent_delays.pop_front();
        }
        self.recent_delays.push_back(delay_ms);
    }

    pub fn on_packet_sent(&mut self) {
        self.packets_sent += 1;
    }

    pub fn on_send_failure(&mut self) {
        self.send_failures += 1;
    }

    /// Count bytes that failed to decode; sequence accounting is untouched
    pub fn on_malformed(&mut self) {
        self.malformed += 1;
    }

    pub fn packets_sent(&self) -> u64 {
        self.packets_sent
    }

    pub fn packets_received(&self) -> u64 {
        self.acc.received_count
    }

    pub fn loss_ratio(&self) -> f64 {
        self.acc.loss_ratio()
    }

    /// Delay samples that fell outside the histogram bounds
    pub fn clamped_count(&self) -> u64 {
        self.clamped_count
    }

    fn window_loss_ratio(&self) -> f64 {
        let (Some(first), Some(highest)) = (self.acc.first_sequence, self.acc.highest_sequence)
        else {
            return 0.0;
        };
        let window = self.config.loss_window();
        let low = first.max(highest.saturating_sub(window - 1));
        let len = highest - low + 1;
        let seen = (low..=highest).filter(|&s| self.seen.contains(s)).count();
        (1.0 - seen as f64 / f64::from(len)).max(0.0)
    }

    fn delay_summary(&self) -> Option<DelaySummary> {
        if self.delays.len() == 0 {
            return None;
        }
        let ms = |us: u64| us as f64 / 1000.0;
        Some(DelaySummary {
            min_ms: self.real_min_ms,
            mean_ms: self.delays.mean() / 1000.0,
            max_ms: self.real_max_ms,
            p50_ms: ms(self.delays.value_at_quantile(0.50)),
            p95_ms: ms(self.delays.value_at_quantile(0.95)),
            p99_ms: ms(self.delays.value_at_quantile(0.99)),
        })
    }

    fn quality(&self, window_loss_ratio: f64) -> Option<QualityEstimate> {
        if self.started.elapsed() < self.config.warmup
            || self.recent_delays.len() < MIN_QUALITY_SAMPLES
        {
            return None;
        }
        let mean = self.recent_delays.iter().sum::<f64>() / self.recent_delays.len() as f64;
        let one_way = match self.config.delay_mode {
            DelayMode::RoundTrip => mean / 2.0,
            DelayMode::OneWay => mean,
        };
        Some(quality::estimate(
            one_way,
            window_loss_ratio * 100.0,
            &self.config.profile,
            self.config.burst_ratio,
        ))
    }

    /// Copy of the current metrics; never mutates the accumulator
    pub fn snapshot(&self) -> MetricSnapshot {
        let window_loss_ratio = self.window_loss_ratio();
        MetricSnapshot {
            timestamp: Utc::now(),
            elapsed_secs: self.started.elapsed().as_secs_f64(),
            codec: self.config.profile.name,
            delay_mode: self.config.delay_mode,
            jitter_ms: self.acc.smoothed_jitter_ms,
            last_delay_ms: self.last_delay_ms,
            loss_ratio: self.acc.loss_ratio(),
            window_loss_ratio,
            packets_sent: self.packets_sent,
            packets_received: self.acc.received_count,
            packets_expected: self.acc.expected_count,
            duplicates: self.duplicates,
            out_of_order: self.out_of_order,
            malformed: self.malformed,
            send_failures: self.send_failures,
            delay: self.delay_summary(),
            quality: self.quality(window_loss_ratio),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{CodecId, SequenceNumber};

    fn engine() -> StatsEngine {
        let mut config = StatsConfig::new(CodecProfile::default(), DelayMode::OneWay);
        config.warmup = Duration::ZERO;
        StatsEngine::new(config).unwrap()
    }

    fn ms(value: f64) -> Timestamp {
        Timestamp((value * 1_000_000.0) as u64)
    }

    fn packet(seq: u32, origin_ms: f64) -> ProbePacket {
        ProbePacket::new(SequenceNumber(seq), ms(origin_ms), CodecId::G711)
    }

    /// Deliver `seq` with a constant 10 ms transit
    fn deliver(engine: &mut StatsEngine, seq: u32) -> Arrival {
        let origin = f64::from(seq) * 20.0;
        engine.on_packet_arrival(&packet(seq, origin), ms(origin + 10.0))
    }

    #[test]
    fn test_loss_with_two_drops() {
        let n = 50u32;
        let mut engine = engine();
        for seq in (0..n).filter(|s| *s != 3 && *s != 7) {
            deliver(&mut engine, seq);
        }
        let snapshot = engine.snapshot();
        assert_eq!(snapshot.packets_expected, u64::from(n));
        assert_eq!(snapshot.packets_received, u64::from(n - 2));
        assert!((snapshot.loss_ratio - 2.0 / f64::from(n)).abs() < 1e-12);
    }

    #[test]
    fn test_jitter_matches_reference_sequence() {
        let mut engine = engine();
        // transits 10, 12, 10, 15 ms -> D = 2, -2, 5
        let arrivals = [(0.0, 10.0), (20.0, 32.0), (40.0, 50.0), (60.0, 75.0)];
        for (seq, (origin, arrival)) in arrivals.iter().enumerate() {
            engine.on_packet_arrival(&packet(seq as u32, *origin), ms(*arrival));
        }

        let mut expected = 0.0f64;
        for d in [2.0f64, -2.0, 5.0] {
            expected += (d.abs() - expected) / 16.0;
        }
        assert!((expected - 0.53955078125).abs() < 1e-12);
        assert!((engine.snapshot().jitter_ms - expected).abs() < 1e-6);
        assert!((engine.acc.previous_delta_ms - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_constant_transit_has_no_jitter() {
        let mut engine = engine();
        for seq in 0..100 {
            deliver(&mut engine, seq);
        }
        let snapshot = engine.snapshot();
        assert!(snapshot.jitter_ms.abs() < 1e-6);
        assert!((snapshot.last_delay_ms.unwrap() - 10.0).abs() < 1e-6);
        let delay = snapshot.delay.unwrap();
        assert!((delay.p50_ms - 10.0).abs() < 0.05);
    }

    #[test]
    fn test_out_of_order_counted_as_received() {
        let mut engine = engine();
        assert_eq!(deliver(&mut engine, 0), Arrival::InOrder);
        assert_eq!(deliver(&mut engine, 2), Arrival::InOrder);
        assert_eq!(deliver(&mut engine, 1), Arrival::OutOfOrder);
        assert_eq!(deliver(&mut engine, 3), Arrival::InOrder);

        let snapshot = engine.snapshot();
        assert_eq!(snapshot.out_of_order, 1);
        assert_eq!(snapshot.packets_received, 4);
        assert_eq!(snapshot.loss_ratio, 0.0);
        assert_eq!(engine.acc.highest_sequence, Some(3));
    }

    #[test]
    fn test_duplicates_do_not_change_loss() {
        let mut engine = engine();
        for seq in [0, 1, 1, 2, 2, 2, 4] {
            deliver(&mut engine, seq);
        }
        let snapshot = engine.snapshot();
        assert_eq!(snapshot.duplicates, 3);
        assert_eq!(snapshot.packets_received, 4);
        assert!((snapshot.loss_ratio - 0.2).abs() < 1e-12);
    }

    #[test]
    fn test_packet_before_first_rebases_expected() {
        let mut engine = engine();
        deliver(&mut engine, 1);
        deliver(&mut engine, 2);
        assert_eq!(deliver(&mut engine, 0), Arrival::OutOfOrder);
        let snapshot = engine.snapshot();
        assert_eq!(snapshot.packets_expected, 3);
        assert_eq!(snapshot.loss_ratio, 0.0);
    }

    #[test]
    fn test_malformed_does_not_affect_loss() {
        let mut engine = engine();
        deliver(&mut engine, 0);
        engine.on_malformed();
        deliver(&mut engine, 1);
        let snapshot = engine.snapshot();
        assert_eq!(snapshot.malformed, 1);
        assert_eq!(snapshot.loss_ratio, 0.0);
    }

    #[test]
    fn test_snapshot_does_not_mutate() {
        let mut engine = engine();
        for seq in [0, 2, 5] {
            deliver(&mut engine, seq);
        }
        let a = engine.snapshot();
        let b = engine.snapshot();
        assert_eq!(a.loss_ratio, b.loss_ratio);
        assert_eq!(a.jitter_ms, b.jitter_ms);
        assert_eq!(a.packets_received, b.packets_received);
        assert_eq!(a.delay, b.delay);
    }

    #[test]
    fn test_window_loss_tracks_recent_sequences() {
        let mut engine = engine();
        // rate 50 -> window of 500 sequence numbers
        for seq in 0..1000u32 {
            if seq < 500 && seq % 2 == 0 {
                continue;
            }
            deliver(&mut engine, seq);
        }
        let snapshot = engine.snapshot();
        assert!((snapshot.loss_ratio - 0.25).abs() < 1e-12);
        assert_eq!(snapshot.window_loss_ratio, 0.0);
    }

    #[test]
    fn test_quality_requires_samples_and_warmup() {
        let mut engine = engine();
        deliver(&mut engine, 0);
        assert!(engine.snapshot().quality.is_none());
        deliver(&mut engine, 1);
        deliver(&mut engine, 2);
        let mos = engine.snapshot().mos().unwrap();
        assert!(mos > 4.0);

        let mut config = StatsConfig::new(CodecProfile::default(), DelayMode::RoundTrip);
        config.warmup = Duration::from_secs(3600);
        let mut warming = StatsEngine::new(config).unwrap();
        for seq in 0..10 {
            deliver(&mut warming, seq);
        }
        assert!(warming.snapshot().quality.is_none());
    }

    #[test]
    fn test_reset_clears_state() {
        let mut engine = engine();
        for seq in [0, 3] {
            deliver(&mut engine, seq);
        }
        engine.on_packet_sent();
        engine.reset();
        let snapshot = engine.snapshot();
        assert_eq!(snapshot.packets_received, 0);
        assert_eq!(snapshot.packets_sent, 0);
        assert_eq!(snapshot.loss_ratio, 0.0);
        assert!(snapshot.delay.is_none());
        assert_eq!(deliver(&mut engine, 0), Arrival::InOrder);
    }

    fn bitmap_limit(engine: &StatsEngine) -> usize {
        (engine.config.tracked_span() / 64) as usize + 1
    }

    #[test]
    fn test_huge_sequence_jump_stays_bounded() {
        let mut engine = engine();
        deliver(&mut engine, 0);
        deliver(&mut engine, u32::MAX - 1);
        assert!(engine.seen.words.len() <= bitmap_limit(&engine));
        assert_eq!(deliver(&mut engine, u32::MAX - 1), Arrival::Duplicate);
    }

    #[test]
    fn test_first_packet_far_from_zero_allocates_little() {
        let mut engine = engine();
        assert_eq!(engine.config.tracked_span(), 2_000);
        deliver(&mut engine, (1 << 24) - 1);
        assert!(engine.seen.words.len() <= bitmap_limit(&engine));
        assert!(engine.seen.words.capacity() * 8 <= 4096, "{} words", engine.seen.words.capacity());

        // still detects duplicates and reordering just behind the new base
        deliver(&mut engine, (1 << 24) + 1);
        assert_eq!(deliver(&mut engine, 1 << 24), Arrival::OutOfOrder);
        assert_eq!(deliver(&mut engine, 1 << 24), Arrival::Duplicate);
    }

    #[test]
    fn test_window_sizes_capped_for_huge_rates() {
        let mut config = StatsConfig::new(CodecProfile::default(), DelayMode::OneWay);
        config.rate = u32::MAX;
        let engine = StatsEngine::new(config).unwrap();
        assert_eq!(engine.config.recent_window(), MAX_RATE as usize);
        assert!(engine.recent_delays.capacity() <= 2 * MAX_RATE as usize);
        assert_eq!(engine.config.loss_window(), MAX_RATE * LOSS_WINDOW_SECS);
    }
}
