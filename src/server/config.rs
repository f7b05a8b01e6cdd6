//! Reflector configuration module
//!
//! Provides CLI argument parsing and validation for the probe reflector.

use crate::probe::constants::{DEFAULT_PORT, DEFAULT_RECV_TIMEOUT_MS, DEFAULT_REPORT_INTERVAL_SECS};
use crate::server::reflector::ReflectorOptions;
use clap::Parser;
use std::time::Duration;
use tracing::debug;

/// Seconds without traffic before a peer's statistics are discarded
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 30;

#[derive(Parser, Debug, Clone)]
#[command(name = "voip-probe-server")]
#[command(about = "UDP reflector for the VoIP probe: echoes probe packets and tracks per-peer statistics")]
pub struct ServerConfig {
    /// Bind address
    #[arg(long, env = "VOIP_PROBE_BIND", default_value = "0.0.0.0")]
    pub bind: String,

    /// Bind port
    #[arg(long, env = "VOIP_PROBE_PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Monitor update interval in milliseconds
    #[arg(long, default_value_t = 100)]
    pub update_interval: u64,

    /// Interval between per-peer statistics log lines in seconds
    #[arg(long, default_value_t = DEFAULT_REPORT_INTERVAL_SECS)]
    pub report_every: u64,

    /// Seconds without traffic before a peer is forgotten
    #[arg(long, default_value_t = DEFAULT_IDLE_TIMEOUT_SECS)]
    pub idle_timeout: u64,

    /// Only measure incoming probes, do not echo them back
    #[arg(long)]
    pub no_echo: bool,

    /// Disable terminal UI (useful for Docker/systemd/non-interactive environments)
    #[arg(long)]
    pub quiet: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Log format (text or json)
    #[arg(long, default_value = "text", value_parser = ["text", "json"])]
    pub log_format: String,
}

impl ServerConfig {
    /// Returns the full bind address as a string (bind:port)
    pub fn address(&self) -> String {
        if self.bind.contains(':') {
            format!("[{}]:{}", self.bind, self.port)
        } else {
            format!("{}:{}", self.bind, self.port)
        }
    }

    /// Validates the configuration values
    pub fn validate(&self) -> Result<(), String> {
        debug!("Validating server configuration");

        if self.port == 0 {
            return Err("port must be > 0".into());
        }

        if self.update_interval == 0 {
            return Err("update_interval must be > 0".into());
        }

        if self.report_every == 0 {
            return Err("report_every must be > 0".into());
        }

        if self.idle_timeout == 0 {
            return Err("idle_timeout must be > 0".into());
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.to_lowercase().as_str()) {
            return Err(format!(
                "log_level must be one of: {}",
                valid_levels.join(", ")
            ));
        }

        debug!("Server configuration validated successfully");
        Ok(())
    }

    /// Returns true if JSON format logging is enabled
    pub fn is_json_format(&self) -> bool {
        self.log_format.to_lowercase() == "json"
    }

    pub fn reflector_options(&self) -> ReflectorOptions {
        ReflectorOptions {
            echo: !self.no_echo,
            report_interval: Duration::from_secs(self.report_every),
            idle_timeout: Duration::from_secs(self.idle_timeout),
            recv_timeout: Duration::from_millis(DEFAULT_RECV_TIMEOUT_MS),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ServerConfig {
        ServerConfig::try_parse_from(["server"]).unwrap()
    }

    #[test]
    fn test_default_config() {
        let config = config();
        assert_eq!(config.address(), "0.0.0.0:5005");
        assert!(!config.is_json_format());
        assert!(config.validate().is_ok());

        let options = config.reflector_options();
        assert!(options.echo);
        assert_eq!(options.report_interval, Duration::from_secs(5));
        assert_eq!(options.idle_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_custom_config() {
        let config = ServerConfig::try_parse_from([
            "server",
            "--bind",
            "::1",
            "--port",
            "9000",
            "--no-echo",
            "--log-format",
            "json",
            "--quiet",
        ])
        .unwrap();

        assert_eq!(config.address(), "[::1]:9000");
        assert!(config.is_json_format());
        assert!(config.quiet);
        assert!(!config.reflector_options().echo);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_port() {
        let config = ServerConfig {
            port: 0,
            ..config()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_intervals() {
        assert!(ServerConfig { report_every: 0, ..config() }.validate().is_err());
        assert!(ServerConfig { idle_timeout: 0, ..config() }.validate().is_err());
        assert!(ServerConfig { update_interval: 0, ..config() }.validate().is_err());
    }

    #[test]
    fn test_invalid_log_level() {
        let config = ServerConfig {
            log_level: "invalid".to_string(),
            ..config()
        };
        assert!(config.validate().is_err());
    }
}
