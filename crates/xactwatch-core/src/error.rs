//! Error types for xactwatch-core.
//!
//! A single closed error enum is used across the crate. Per-transaction
//! escalation failures are *not* errors: they are reported through the sink
//! and the scan continues. Only provider-unavailable conditions (a failed
//! snapshot or blocker query) and malformed configuration surface here.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the watchdog core.
#[derive(Debug, Error)]
pub enum Error {
    /// The session or lock snapshot source could not be queried.
    /// Fatal to the whole run; there is no graceful degradation.
    #[error("database error: {0}")]
    Database(#[from] tokio_postgres::Error),

    /// Malformed configuration, rejected before the scan starts.
    #[error("config error: {0}")]
    Config(String),

    /// Internal invariant violations and everything else.
    #[error("runtime error: {0}")]
    Runtime(String),

    /// I/O error (config file loading).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_display() {
        let err = Error::Config("negative duration".to_string());
        assert_eq!(err.to_string(), "config error: negative duration");
    }

    #[test]
    fn io_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: Error = io.into();
        assert!(matches!(err, Error::Io(_)));
    }
}
