//! Tracing initialisation for Shipyard binaries.
//!
//! Logs always go to stderr; stdout belongs to reports and other output a
//! caller may parse. `RUST_LOG` overrides the level chosen here.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Commands that only print resolved data.
const QUERY_COMMANDS: &[&str] = &["scenario", "versions"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    /// Newline-delimited JSON for log aggregation.
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TelemetryConfig {
    pub format: LogFormat,
    /// Default verbosity when `RUST_LOG` is not set.
    pub level: Level,
    /// Tag lines with the worker thread; useful once pools run concurrently.
    pub thread_ids: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Text,
            level: Level::INFO,
            thread_ids: false,
        }
    }
}

impl TelemetryConfig {
    /// Settings for one subcommand.
    ///
    /// Query commands stay at warnings unless `verbose`, so their output is
    /// not buried. Everything else drives worker pools and gets thread ids.
    pub fn for_command(command: &str, json: bool, verbose: bool) -> Self {
        let query = QUERY_COMMANDS.contains(&command);
        let level = match (verbose, query) {
            (true, _) => Level::DEBUG,
            (false, true) => Level::WARN,
            (false, false) => Level::INFO,
        };
        Self {
            format: if json { LogFormat::Json } else { LogFormat::Text },
            level,
            thread_ids: !query,
        }
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(self.level.as_str()))
    }
}

/// Install the global subscriber. Only the first call takes effect.
pub fn init_tracing(config: &TelemetryConfig) {
    let layer = fmt::layer()
        .with_target(false)
        .with_thread_ids(config.thread_ids)
        .with_writer(std::io::stderr);

    match config.format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(config.filter())
            .with(layer.json())
            .try_init()
            .ok(),
        LogFormat::Text => tracing_subscriber::registry()
            .with(config.filter())
            .with(layer)
            .try_init()
            .ok(),
    };
}
