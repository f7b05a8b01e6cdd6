use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use voip_probe::probe::{
    init_logging_with_config, ClientConfig, CsvSink, FanoutSink, HealthStatus, JsonLinesSink,
    LogSink, ProbeError, ProgressTracker, Reporter, Session, Transport, UdpTransport,
};

/// How often the live status line is refreshed
const POLL_INTERVAL: Duration = Duration::from_millis(250);

fn main() {
    let config = ClientConfig::parse();

    init_logging_with_config(&config.log_level, config.is_json_format());

    if let Err(e) = run(config) {
        error!(error = %e, "Probe failed");
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run(config: ClientConfig) -> Result<()> {
    let (transport, session_config) = if config.loopback {
        let transport = UdpTransport::loopback()?;
        let local = transport
            .local_addr()
            .context("Failed to read loopback address")?;
        (transport, config.session_config(Some(local))?)
    } else {
        let session_config = config.session_config(None)?;
        (UdpTransport::connect_to(session_config.target)?, session_config)
    };

    let mut sinks = FanoutSink::new();
    let tracker = if config.quiet {
        sinks.push(Box::new(LogSink));
        None
    } else {
        let tracker = ProgressTracker::new(session_config.duration)?;
        sinks.push(Box::new(tracker.clone()));
        Some(tracker)
    };
    if let Some(path) = &config.csv {
        sinks.push(Box::new(
            CsvSink::create(path).with_context(|| format!("Failed to create {}", path.display()))?,
        ));
    }
    if let Some(path) = &config.json {
        sinks.push(Box::new(
            JsonLinesSink::create(path)
                .with_context(|| format!("Failed to create {}", path.display()))?,
        ));
    }

    info!(
        target_addr = %session_config.target,
        codec = session_config.profile.name,
        pps = session_config.rate,
        loopback = config.loopback,
        "Starting probe"
    );

    let session = Session::new(session_config, Arc::new(transport), Box::new(sinks))?;
    let health = session.health();
    session.start()?;

    let mut last_health = HealthStatus::Unknown;
    let outcome = loop {
        match session.wait_timeout(POLL_INTERVAL) {
            Err(ProbeError::Timeout(_)) => {
                last_health = health.status();
                if let Some(tracker) = &tracker {
                    tracker.update(&session.snapshot());
                }
            }
            other => break other,
        }
    };
    if let Some(tracker) = &tracker {
        tracker.finish();
    }

    let snapshot = outcome?;
    Reporter.print_results(&snapshot, Some(last_health));
    Ok(())
}
