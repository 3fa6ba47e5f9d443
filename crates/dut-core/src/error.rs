//! Common error types for workers

use thiserror::Error;

/// Result type for worker operations
pub type WorkerResult<T> = Result<T, WorkerError>;

/// Errors that can occur while driving a worker
#[derive(Debug, Error)]
pub enum WorkerError {
    /// Serial link could not be opened, configured or written
    #[error("Link error: {0}")]
    Link(String),

    /// A bounded retry gave up
    #[error("Retry exhausted after {attempts} attempts: {last}")]
    RetryExhausted {
        /// Number of attempts made
        attempts: u32,
        /// Failure of the final attempt
        last: Box<WorkerError>,
    },

    /// Board bring-up failed (never signalled ready, firmware load failed)
    #[error("Setup error: {0}")]
    Setup(String),

    /// Destination resolution failed, or every destination failed
    #[error("Flash error: {0}")]
    Flash(String),

    /// Operation not valid in the current state, or bad configuration
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Network collaborator failure
    #[error("Network error: {0}")]
    Network(String),
}

impl WorkerError {
    /// Returns the HTTP status code the control-plane surfaces for this error
    pub fn status_code(&self) -> u16 {
        match self {
            WorkerError::Link(_) => 503,
            WorkerError::RetryExhausted { .. } => 504,
            WorkerError::Setup(_) => 500,
            WorkerError::Flash(_) => 500,
            WorkerError::InvalidRequest(_) => 400,
            WorkerError::Network(_) => 502,
        }
    }

    /// Short machine-readable error kind
    pub fn kind(&self) -> &'static str {
        match self {
            WorkerError::Link(_) => "link_error",
            WorkerError::RetryExhausted { .. } => "retry_exhausted",
            WorkerError::Setup(_) => "setup_error",
            WorkerError::Flash(_) => "flash_error",
            WorkerError::InvalidRequest(_) => "invalid_request",
            WorkerError::Network(_) => "network_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_exhausted_message_includes_cause() {
        let err = WorkerError::RetryExhausted {
            attempts: 5,
            last: Box::new(WorkerError::Flash("no such device".to_string())),
        };

        assert_eq!(
            err.to_string(),
            "Retry exhausted after 5 attempts: Flash error: no such device"
        );
        assert_eq!(err.kind(), "retry_exhausted");
        assert_eq!(err.status_code(), 504);
    }

    #[test]
    fn test_invalid_request_is_client_error() {
        let err = WorkerError::InvalidRequest("setup has not completed".to_string());
        assert_eq!(err.status_code(), 400);
    }
}
