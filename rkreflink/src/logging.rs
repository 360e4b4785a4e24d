//! Logging initialization.

use std::sync::Once;

use clap::ValueEnum;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines on stderr.
    #[default]
    Pretty,
    /// One JSON object per event on stderr.
    Json,
    /// systemd journal.
    Journald,
}

/// Install the global subscriber.  `RUST_LOG` selects levels, default `info`.
///
/// Falls back to pretty output when the journal socket is unavailable.
/// Later calls are no-ops.
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let registry = tracing_subscriber::registry().with(env_filter);

        match format {
            LogFormat::Json => registry.with(fmt::layer().json().with_writer(std::io::stderr)).init(),
            LogFormat::Pretty => registry.with(fmt::layer().with_writer(std::io::stderr)).init(),
            LogFormat::Journald => match tracing_journald::layer() {
                Ok(journald) => registry.with(journald.with_syslog_identifier("rkreflink".into())).init(),
                Err(e) => {
                    registry.with(fmt::layer().with_writer(std::io::stderr)).init();
                    tracing::warn!(error = %e, "journald unavailable, logging to stderr");
                }
            },
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_init_is_noop() {
        init_logging(LogFormat::Pretty);
        init_logging(LogFormat::Json);
    }
}
