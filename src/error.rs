//! Custom error types for the run orchestrator.
//!
//! This module defines the primary error type, `DaqError`, shared by every
//! device-capability boundary and every controller operation. Using the
//! `thiserror` crate, it keeps the error taxonomy of a triggered run explicit:
//!
//! - **`Configuration`**: invalid or unachievable timing detected before any
//!   hardware is armed. Fatal for `start()`, nothing is touched.
//! - **`Device`**: an open/arm/start failure reported by a driver. Fatal for the
//!   current run; the controller tears down whatever was armed.
//! - **`TimingViolation`**: frame or sample drift detected mid-run by a worker.
//!   The run fails, but buffered data is still drained and the run finalizes.
//! - **`TransientTimeout`**: a single poll timeout. Retried by the worker and
//!   only escalated when it recurs.
//!
//! Driver implementations map whatever their SDK raises into `Device` or
//! `TransientTimeout`; the core never sees SDK-specific error types.

use thiserror::Error;

use crate::controller::RunState;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

#[allow(missing_docs)]
#[derive(Error, Debug)]
pub enum DaqError {
    #[error("Configuration file error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Device error: {0}")]
    Device(String),

    #[error("Timing violation: {0}")]
    TimingViolation(String),

    #[error("{device} timed out after {timeout_ms} ms")]
    TransientTimeout { device: String, timeout_ms: u64 },

    #[error("Cannot {operation} while {state:?}")]
    InvalidState {
        operation: &'static str,
        state: RunState,
    },

    #[error("Run controller is no longer running")]
    ControllerUnavailable,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Encoding error: {0}")]
    Encoding(#[from] bincode::Error),
}

impl DaqError {
    /// A transient timeout is retried by the polling worker; everything else
    /// ends the current run (or blocks it from starting).
    pub fn is_fatal(&self) -> bool {
        !matches!(self, DaqError::TransientTimeout { .. })
    }

    /// Shorthand used by drivers to wrap an SDK failure.
    pub fn device(msg: impl Into<String>) -> Self {
        DaqError::Device(msg.into())
    }

    /// Shorthand for configuration validation failures.
    pub fn configuration(msg: impl Into<String>) -> Self {
        DaqError::Configuration(msg.into())
    }
}

impl From<figment::Error> for DaqError {
    fn from(err: figment::Error) -> Self {
        DaqError::Config(Box::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DaqError::Device("camera 0 did not open".to_string());
        assert_eq!(err.to_string(), "Device error: camera 0 did not open");
    }

    #[test]
    fn test_transient_timeout_is_not_fatal() {
        let timeout = DaqError::TransientTimeout {
            device: "image camera".into(),
            timeout_ms: 1000,
        };
        assert!(!timeout.is_fatal());
        assert_eq!(timeout.to_string(), "image camera timed out after 1000 ms");
        assert!(DaqError::TimingViolation("lost frame".into()).is_fatal());
        assert!(DaqError::configuration("negative exposure").is_fatal());
    }

    #[test]
    fn test_invalid_state_message() {
        let err = DaqError::InvalidState {
            operation: "start",
            state: RunState::Uninitialized,
        };
        assert_eq!(err.to_string(), "Cannot start while Uninitialized");
    }
}
