//! Logging setup using `tracing` + `tracing-subscriber`.
//!
//! Priority for determining the filter:
//! 1. `RUST_LOG` environment variable (full `EnvFilter` syntax)
//! 2. the level passed by the caller (CLI flag or `application.log_level`)
//! 3. default to `info`
//!
//! Logs go to stderr so stdout stays free for run summaries.

use tracing_subscriber::EnvFilter;

use crate::error::{AppResult, DaqError};

/// Initialise the global logging subscriber.
///
/// Safe to call once at startup; a second call reports an error instead of
/// panicking.
pub fn init_logging(level: Option<&str>) -> AppResult<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(level.unwrap_or("info"))
            .map_err(|e| DaqError::configuration(format!("invalid log filter: {e}")))?,
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_names(true)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| DaqError::configuration(format!("logging already initialised: {e}")))
}
