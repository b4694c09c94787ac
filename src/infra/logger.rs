// src/infra/logger.rs — Structured logging with tracing

use tracing_subscriber::{fmt, EnvFilter};

use crate::infra::config::ConsoleFormat;

/// Install the process-wide subscriber. `WHARF_LOG` wins over `RUST_LOG`,
/// which wins over `level`.
pub fn init_logging(level: &str, format: ConsoleFormat) {
    let filter = std::env::var("WHARF_LOG")
        .ok()
        .and_then(|v| EnvFilter::try_new(v).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new(level));

    let builder = fmt().with_env_filter(filter).with_target(false);
    let installed = match format {
        ConsoleFormat::Text => builder.compact().try_init(),
        ConsoleFormat::Json => builder.json().try_init(),
    };

    if installed.is_err() {
        tracing::debug!("global subscriber already installed");
    }
}
