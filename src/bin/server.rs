use anyhow::Result;
use clap::Parser;
use voip_probe::probe::init_logging_with_config;
use voip_probe::server::{Reflector, ServerConfig, ServerMonitor};
use tracing::{error, info};

fn main() {
    let config = ServerConfig::parse();

    init_logging_with_config(&config.log_level, config.is_json_format());

    if let Err(e) = config.validate() {
        error!(error = %e, "Invalid configuration");
        eprintln!("Configuration error: {}", e);
        std::process::exit(1);
    }

    if let Err(e) = run(config) {
        error!(error = %e, "Server failed");
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run(config: ServerConfig) -> Result<()> {
    let addr = config.address();
    let monitor = ServerMonitor::new(config.update_interval);
    let mut reflector = Reflector::bind(&addr, config.reflector_options(), monitor.counters())?;

    info!(
        address = %addr,
        update_interval_ms = config.update_interval,
        quiet_mode = config.quiet,
        echo = !config.no_echo,
        "VoIP probe reflector listening"
    );

    if !config.quiet {
        monitor.start_display();
    } else {
        info!("Running in quiet mode (terminal UI disabled)");
    }

    reflector.run()?;
    monitor.stop_display();

    let stats = monitor.stats();
    info!(
        received = stats.packets_received,
        echoed = stats.packets_echoed,
        malformed = stats.malformed,
        errors = stats.errors,
        uptime_secs = stats.elapsed.as_secs(),
        "Reflector stopped"
    );
    Ok(())
}
