use crate::probe::constants::{FAIR_MOS, GOOD_MOS};
use crate::probe::health::HealthStatus;
use crate::probe::progress::grade_mos;
use crate::probe::statistics::{DelayMode, MetricSnapshot};
use colored::*;
use std::fmt::Write;
use tracing::{debug, info, warn};

/// Renders the end-of-run summary
pub struct Reporter;

const BAR_WIDTH: usize = 30;

// Percentage thresholds for formatting precision
const LOW_PERCENTAGE_THRESHOLD: f64 = 0.1;
const MEDIUM_PRECISION_THRESHOLD: f64 = 1.0;

const LABEL_WIDTH: usize = 10;

impl Reporter {
    /// Bar scaled to `value / max`, with a sliver for values that round to zero
    fn render_bar(value: f64, max: f64, width: usize) -> String {
        if value <= 0.0 || max <= 0.0 {
            return String::new();
        }
        let length = ((value / max) * width as f64) as usize;
        match length {
            0 => "▏".to_string(),
            n => "█".repeat(n.min(width)),
        }
    }

    /// Smaller percentages get more decimal places
    fn format_percentage(percentage: f64) -> String {
        if percentage < LOW_PERCENTAGE_THRESHOLD {
            format!("{:5.3}%", percentage)
        } else if percentage < MEDIUM_PRECISION_THRESHOLD {
            format!("{:5.2}%", percentage)
        } else {
            format!("{:5.1}%", percentage)
        }
    }

    fn format_count(count: u64) -> String {
        if count >= 1_000_000 {
            format!("{:.1}M", count as f64 / 1_000_000.0)
        } else if count >= 10_000 {
            format!("{}k", count / 1000)
        } else {
            count.to_string()
        }
    }

    fn verdict(mos: Option<f64>) -> ColoredString {
        match mos {
            Some(mos) if mos >= GOOD_MOS => {
                format!("✓ GOOD: MOS {:.2} is at or above {:.1}", mos, GOOD_MOS)
                    .green()
                    .bold()
            }
            Some(mos) if mos >= FAIR_MOS => {
                format!("~ FAIR: MOS {:.2} is below {:.1}", mos, GOOD_MOS)
                    .yellow()
                    .bold()
            }
            Some(mos) => format!("✗ POOR: MOS {:.2} is below {:.1}", mos, FAIR_MOS)
                .red()
                .bold(),
            None => "? Not enough samples for a quality estimate".normal().bold(),
        }
    }

    /// Build the report text
    pub fn render(&self, s: &MetricSnapshot, health: Option<HealthStatus>) -> String {
        let mut out = String::new();
        // Writing into a String cannot fail
        let _ = self.render_into(&mut out, s, health);
        out
    }

    fn render_into(
        &self,
        out: &mut String,
        s: &MetricSnapshot,
        health: Option<HealthStatus>,
    ) -> std::fmt::Result {
        writeln!(out, "\n{}", "┌─────────────────────────────┐".cyan())?;
        writeln!(out, "{}", "│  VoIP Probe Results         │".cyan())?;
        writeln!(out, "{}", "└─────────────────────────────┘".cyan())?;
        writeln!(out)?;

        writeln!(
            out,
            "Codec:    {} over {:.1}s",
            s.codec, s.elapsed_secs
        )?;
        let lost = s.packets_expected.saturating_sub(s.packets_received);
        writeln!(
            out,
            "Packets:  {} sent, {} received, {} lost ({})",
            Self::format_count(s.packets_sent),
            Self::format_count(s.packets_received),
            Self::format_count(lost),
            Self::format_percentage(s.loss_percent()).trim()
        )?;
        writeln!(
            out,
            "          └─ last window loss {}",
            Self::format_percentage(s.window_loss_ratio * 100.0).trim()
        )?;
        if s.duplicates + s.out_of_order + s.malformed + s.send_failures > 0 {
            writeln!(
                out,
                "          └─ {} duplicate, {} reordered, {} malformed, {} send failures",
                s.duplicates, s.out_of_order, s.malformed, s.send_failures
            )?;
        }
        writeln!(out)?;

        let kind = match s.delay_mode {
            DelayMode::RoundTrip => "round-trip",
            DelayMode::OneWay => "one-way",
        };
        match s.delay {
            Some(d) => {
                writeln!(out, "Delay ({}):", kind)?;
                let rows = [
                    ("Min", d.min_ms),
                    ("Mean", d.mean_ms),
                    ("P50", d.p50_ms),
                    ("P95", d.p95_ms),
                    ("P99", d.p99_ms),
                    ("Max", d.max_ms),
                ];
                for (label, value) in rows {
                    writeln!(
                        out,
                        "  {:>width$}: {:>9.3} ms  {}",
                        label,
                        value,
                        Self::render_bar(value, d.max_ms, BAR_WIDTH),
                        width = LABEL_WIDTH
                    )?;
                }
            }
            None => writeln!(out, "{}", "No packets received.".red())?,
        }
        writeln!(out, "  {:>width$}: {:>9.3} ms", "Jitter", s.jitter_ms, width = LABEL_WIDTH)?;
        writeln!(out)?;

        if let Some(q) = s.quality {
            writeln!(
                out,
                "Quality:  MOS {} (R = {:.1}, Id = {:.1}, Ie-eff = {:.1})",
                grade_mos(q.mos),
                q.r_factor,
                q.id,
                q.ie_eff
            )?;
        }
        if let Some(status) = health {
            let label = status.to_string();
            let label = match status {
                HealthStatus::Healthy => label.green(),
                HealthStatus::Degraded => label.yellow(),
                HealthStatus::Unhealthy => label.red(),
                HealthStatus::Unknown => label.normal(),
            };
            writeln!(out, "Health:   {}", label)?;
        }
        writeln!(out)?;
        writeln!(out, "{}", Self::verdict(s.mos()))?;
        Ok(())
    }

    /// Print the complete results summary
    pub fn print_results(&self, snapshot: &MetricSnapshot, health: Option<HealthStatus>) {
        debug!(
            packets_received = snapshot.packets_received,
            packets_expected = snapshot.packets_expected,
            "Printing probe results"
        );
        if snapshot.packets_received == 0 {
            warn!("No probe packets came back");
        }
        print!("{}", self.render(snapshot, health));
        info!(
            loss_pct = snapshot.loss_percent(),
            jitter_ms = snapshot.jitter_ms,
            mos = ?snapshot.mos(),
            "Results reported"
        );
    }
}
