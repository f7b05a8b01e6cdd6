use crate::probe::constants::*;
use crate::probe::error::{ProbeError, Result, SinkError};
use crate::probe::sink::ResultsSink;
use crate::probe::statistics::MetricSnapshot;
use colored::*;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

/// Live one-line view of a running session
///
/// A bounded run shows a bar over the configured duration, an unbounded one a
/// spinner. Clones share the same bar.
#[derive(Clone)]
pub struct ProgressTracker {
    pb: ProgressBar,
    bounded: bool,
}

impl ProgressTracker {
    pub fn new(duration: Option<Duration>) -> Result<Self> {
        let pb = match duration {
            Some(d) => ProgressBar::new(d.as_secs().max(1)),
            None => ProgressBar::new_spinner(),
        };
        Self::with_bar(pb, duration)
    }

    /// Attach to an existing bar, e.g. `ProgressBar::hidden()`
    pub fn with_bar(pb: ProgressBar, duration: Option<Duration>) -> Result<Self> {
        let template = if duration.is_some() {
            "{msg}\n{bar:40.cyan/blue} {pos:>4}/{len:4}s [{elapsed_precise}]"
        } else {
            "{spinner} {msg} [{elapsed_precise}]"
        };
        let style = ProgressStyle::with_template(template)
            .map_err(|e| ProbeError::Statistics(format!("Failed to create progress style: {}", e)))?
            .progress_chars("█░");
        pb.set_style(style);
        pb.enable_steady_tick(Duration::from_millis(PROGRESS_TICK_INTERVAL_MS));

        Ok(Self {
            pb,
            bounded: duration.is_some(),
        })
    }

    pub fn update(&self, snapshot: &MetricSnapshot) {
        if self.bounded {
            self.pb.set_position(snapshot.elapsed_secs as u64);
        }
        self.pb.set_message(Self::render(snapshot));
    }

    /// Current status line
    pub fn message(&self) -> String {
        self.pb.message()
    }

    fn render(s: &MetricSnapshot) -> String {
        let delay = match s.last_delay_ms {
            Some(ms) => format!("{:.2}ms", ms),
            None => "-".to_string(),
        };
        let loss = format!("{:.2}%", s.loss_percent());
        let loss = if s.loss_ratio > DEFAULT_LOSS_THRESHOLD {
            loss.red()
        } else if s.loss_ratio > 0.0 {
            loss.yellow()
        } else {
            loss.green()
        };
        let mos = match s.mos() {
            Some(mos) => grade_mos(mos).to_string(),
            None => "warming up".dimmed().to_string(),
        };

        format!(
            "Sent: {} | Recv: {} | Delay: {} | Jitter: {:.2}ms | Loss: {} | MOS: {}",
            s.packets_sent, s.packets_received, delay, s.jitter_ms, loss, mos
        )
    }

    pub fn finish(&self) {
        self.pb.finish();
    }
}

/// Format a MOS value colored by its quality band
pub fn grade_mos(mos: f64) -> ColoredString {
    let text = format!("{:.2}", mos);
    if mos >= GOOD_MOS {
        text.green()
    } else if mos >= FAIR_MOS {
        text.yellow()
    } else {
        text.red()
    }
}

impl ResultsSink for ProgressTracker {
    fn write(&mut self, snapshot: &MetricSnapshot) -> std::result::Result<(), SinkError> {
        self.update(snapshot);
        Ok(())
    }

    fn flush(&mut self) -> std::result::Result<(), SinkError> {
        self.finish();
        Ok(())
    }
}
