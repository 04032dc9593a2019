//! Error types for roomcrawl.
//!
//! Only configuration and identifier-source failures abort a run. Failures
//! inside a worker arrive as reports and are never represented here.

use thiserror::Error;

/// Main error type for roomcrawl.
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Identifier source failed: {0}")]
    Source(String),

    #[error("Failed to launch worker {worker}: {message}")]
    Launch { worker: usize, message: String },

    #[error("Worker channel error: {0}")]
    Channel(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),
}

/// Result type alias for roomcrawl operations.
pub type Result<T> = std::result::Result<T, DispatchError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_config_error_message() {
        let err = DispatchError::Config("chunk capacity must be positive".to_string());
        let msg = err.to_string();
        assert!(msg.contains("Invalid configuration"));
        assert!(msg.contains("chunk capacity"));
    }

    #[test]
    fn test_launch_error_names_worker() {
        let err = DispatchError::Launch {
            worker: 3,
            message: "No such file or directory".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("worker 3"));
        assert!(msg.contains("No such file"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "ids.txt not found");
        let err: DispatchError = io_err.into();
        assert!(err.to_string().contains("ids.txt not found"));
    }

    #[test]
    fn test_json_error_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("{ nope").unwrap_err();
        let err: DispatchError = json_err.into();
        assert!(err.to_string().contains("JSON"));
    }
}
