//! Consumers of metric snapshots
//!
//! The session hands every interim and final snapshot to a `ResultsSink` and
//! does not care where it ends up. Sink failures are reported back to the
//! session, which logs and counts them without stopping the run.

use crate::probe::error::SinkError;
use crate::probe::statistics::MetricSnapshot;
use parking_lot::Mutex;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

pub trait ResultsSink: Send {
    fn write(&mut self, snapshot: &MetricSnapshot) -> Result<(), SinkError>;

    /// Called once after the final snapshot
    fn flush(&mut self) -> Result<(), SinkError> {
        Ok(())
    }
}

impl<S: ResultsSink + ?Sized> ResultsSink for Box<S> {
    fn write(&mut self, snapshot: &MetricSnapshot) -> Result<(), SinkError> {
        (**self).write(snapshot)
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        (**self).flush()
    }
}

const CSV_HEADER: &str = "ts_utc,elapsed_s,codec,sent,received,expected,loss_pct,loss_pct_window,\
last_delay_ms,jitter_ms,delay_p50_ms,delay_p95_ms,delay_p99_ms,mos,r_factor,\
duplicates,out_of_order,malformed,send_failures";

fn opt(value: Option<f64>, precision: usize) -> String {
    value
        .map(|v| format!("{:.*}", precision, v))
        .unwrap_or_default()
}

/// Time-series CSV, one row per snapshot
pub struct CsvSink<W: Write + Send> {
    writer: W,
    header_written: bool,
}

impl CsvSink<BufWriter<File>> {
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self, SinkError> {
        debug!(path = %path.as_ref().display(), "Creating CSV sink");
        Ok(Self::new(BufWriter::new(File::create(path)?)))
    }
}

impl<W: Write + Send> CsvSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            header_written: false,
        }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write + Send> ResultsSink for CsvSink<W> {
    fn write(&mut self, s: &MetricSnapshot) -> Result<(), SinkError> {
        if !self.header_written {
            writeln!(self.writer, "{}", CSV_HEADER)?;
            self.header_written = true;
        }
        writeln!(
            self.writer,
            "{},{:.3},{},{},{},{},{:.3},{:.3},{},{:.3},{},{},{},{},{},{},{},{},{}",
            s.timestamp.to_rfc3339(),
            s.elapsed_secs,
            s.codec,
            s.packets_sent,
            s.packets_received,
            s.packets_expected,
            s.loss_ratio * 100.0,
            s.window_loss_ratio * 100.0,
            opt(s.last_delay_ms, 3),
            s.jitter_ms,
            opt(s.delay.map(|d| d.p50_ms), 3),
            opt(s.delay.map(|d| d.p95_ms), 3),
            opt(s.delay.map(|d| d.p99_ms), 3),
            opt(s.quality.map(|q| q.mos), 3),
            opt(s.quality.map(|q| q.r_factor), 1),
            s.duplicates,
            s.out_of_order,
            s.malformed,
            s.send_failures,
        )?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        self.writer.flush()?;
        Ok(())
    }
}

/// One JSON object per line
pub struct JsonLinesSink<W: Write + Send> {
    writer: W,
}

impl JsonLinesSink<BufWriter<File>> {
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self, SinkError> {
        debug!(path = %path.as_ref().display(), "Creating JSON lines sink");
        Ok(Self::new(BufWriter::new(File::create(path)?)))
    }
}

impl<W: Write + Send> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write + Send> ResultsSink for JsonLinesSink<W> {
    fn write(&mut self, snapshot: &MetricSnapshot) -> Result<(), SinkError> {
        serde_json::to_writer(&mut self.writer, snapshot)?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Emits each snapshot as a structured log event
#[derive(Debug, Default)]
pub struct LogSink;

impl ResultsSink for LogSink {
    fn write(&mut self, s: &MetricSnapshot) -> Result<(), SinkError> {
        info!(
            sent = s.packets_sent,
            received = s.packets_received,
            loss_pct = s.loss_ratio * 100.0,
            loss_window_pct = s.window_loss_ratio * 100.0,
            delay_ms = ?s.last_delay_ms,
            jitter_ms = s.jitter_ms,
            mos = ?s.mos(),
            "Probe statistics"
        );
        Ok(())
    }
}

/// Keeps snapshots in memory; clones share the same buffer
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    snapshots: Arc<Mutex<Vec<MetricSnapshot>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshots(&self) -> Vec<MetricSnapshot> {
        self.snapshots.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.snapshots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.lock().is_empty()
    }
}

impl ResultsSink for MemorySink {
    fn write(&mut self, snapshot: &MetricSnapshot) -> Result<(), SinkError> {
        self.snapshots.lock().push(snapshot.clone());
        Ok(())
    }
}

/// Forwards every snapshot to several sinks
#[derive(Default)]
pub struct FanoutSink {
    sinks: Vec<Box<dyn ResultsSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<S: ResultsSink + 'static>(mut self, sink: S) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }

    pub fn push(&mut self, sink: Box<dyn ResultsSink>) {
        self.sinks.push(sink);
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl ResultsSink for FanoutSink {
    /// Every sink sees the snapshot; the first error is returned
    fn write(&mut self, snapshot: &MetricSnapshot) -> Result<(), SinkError> {
        let mut first_error = None;
        for sink in &mut self.sinks {
            if let Err(e) = sink.write(snapshot) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        let mut first_error = None;
        for sink in &mut self.sinks {
            if let Err(e) = sink.flush() {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::statistics::{DelayMode, StatsConfig, StatsEngine};
    use crate::protocol::{CodecId, CodecProfile, ProbePacket, SequenceNumber, Timestamp};
    use std::io;

    fn snapshot() -> MetricSnapshot {
        let config = StatsConfig::new(CodecProfile::default(), DelayMode::RoundTrip);
        let mut engine = StatsEngine::new(config).unwrap();
        for seq in [0u32, 1, 3] {
            let packet = ProbePacket::new(SequenceNumber(seq), Timestamp(0), CodecId::G711);
            engine.on_packet_arrival(&packet, Timestamp(2_000_000));
            engine.on_packet_sent();
        }
        engine.snapshot()
    }

    struct FailingSink;

    impl ResultsSink for FailingSink {
        fn write(&mut self, _: &MetricSnapshot) -> Result<(), SinkError> {
            Err(SinkError::Io(io::Error::from(io::ErrorKind::BrokenPipe)))
        }
    }

    #[test]
    fn test_csv_sink_writes_header_once() -> Result<(), SinkError> {
        let mut sink = CsvSink::new(Vec::new());
        let snap = snapshot();
        sink.write(&snap)?;
        sink.write(&snap)?;
        let text = String::from_utf8(sink.into_inner()).unwrap();
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], CSV_HEADER);
        let columns = CSV_HEADER.split(',').count();
        assert_eq!(lines[1].split(',').count(), columns);
        assert!(lines[1].contains(",g711,3,3,4,25.000,"));
        Ok(())
    }

    #[test]
    fn test_json_lines_sink() -> Result<(), SinkError> {
        let mut sink = JsonLinesSink::new(Vec::new());
        sink.write(&snapshot())?;
        let text = String::from_utf8(sink.into_inner()).unwrap();
        let value: serde_json::Value = serde_json::from_str(text.trim_end()).unwrap();
        assert_eq!(value["packets_received"], 3);
        assert_eq!(value["delay_mode"], "round_trip");
        assert_eq!(value["codec"], "g711");
        Ok(())
    }

    #[test]
    fn test_memory_sink_shares_buffer() -> Result<(), SinkError> {
        let sink = MemorySink::new();
        let mut writer = sink.clone();
        writer.write(&snapshot())?;
        assert_eq!(sink.len(), 1);
        Ok(())
    }

    #[test]
    fn test_fanout_reaches_all_sinks_despite_errors() {
        let memory = MemorySink::new();
        let mut fanout = FanoutSink::new()
            .with(FailingSink)
            .with(memory.clone())
            .with(LogSink);
        assert_eq!(fanout.len(), 3);
        assert!(fanout.write(&snapshot()).is_err());
        assert_eq!(memory.len(), 1);
        assert!(fanout.flush().is_ok());
    }
}
