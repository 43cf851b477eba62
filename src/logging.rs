//! Logging setup
//!
//! Installs the global tracing subscriber. `RUST_LOG` overrides the
//! configured level when set.

use std::fs::OpenOptions;
use std::sync::Mutex;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;
use crate::error::{Error, Result};

/// Initialize logging from config
///
/// Fails if a global subscriber is already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let json = config.format == "json";
    let stdout_json = json.then(|| tracing_subscriber::fmt::layer().json());
    let stdout_pretty = (!json).then(tracing_subscriber::fmt::layer);

    let file_layer = match &config.file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_json)
        .with(stdout_pretty)
        .with(file_layer)
        .try_init()
        .map_err(|e| Error::Config(format!("Failed to install log subscriber: {}", e)))
}
