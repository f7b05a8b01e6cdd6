use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize structured logging with configurable log levels
///
/// Log level can be controlled via the `RUST_LOG` environment variable.
/// Examples:
/// - `RUST_LOG=info` - Info level and above
/// - `RUST_LOG=voip_probe=debug` - Debug level for this crate only
/// - `RUST_LOG=warn` - Warn level and above
pub fn init_logging() {
    init_logging_with_config("info", false);
}

/// Initialize logging with `level` as the fallback when `RUST_LOG` is unset.
///
/// Events go to stderr so they do not interleave with the progress line and
/// the final report. Calling this twice keeps the first subscriber.
pub fn init_logging_with_config(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_lowercase()));

    let text_layer = (!json).then(|| {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .with_thread_ids(true)
            .with_line_number(true)
            .with_file(true)
    });
    let json_layer = json.then(|| {
        fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_thread_names(true)
            .with_current_span(false)
    });

    if tracing_subscriber::registry()
        .with(filter)
        .with(text_layer)
        .with(json_layer)
        .try_init()
        .is_err()
    {
        tracing::debug!("Logging already initialized");
    }
}
