//! Error types for tapnet-core.

use thiserror::Error;

/// Result type alias for tapnet-core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors that can occur during lease operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Every allowed slot already carries an active lease.
    #[error("resource pool exhausted ({0} slots in use)")]
    ResourceExhausted(usize),

    /// No lease is registered under the given owner name.
    #[error("no lease for owner: {0}")]
    NotFound(String),

    /// The worker process for a freshly allocated slot failed to start.
    /// The slot is rolled back and stays allocatable.
    #[error("worker failed to start: {0}")]
    WorkerStartFailed(#[source] std::io::Error),

    /// Startup configuration cannot be used. Fatal before serving.
    #[error("invalid configuration: {0}")]
    ConfigurationFatal(String),

    /// The action pattern is not a valid regex.
    #[error("invalid action pattern: {0}")]
    InvalidPattern(#[from] regex::Error),

    /// The command template names a capture group the pattern lacks.
    #[error("template placeholder <{0}> has no matching capture group")]
    UnknownPlaceholder(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoreError {
    /// Check if this error indicates a not-found condition.
    pub fn is_not_found(&self) -> bool {
        matches!(self, CoreError::NotFound(_))
    }

    /// Check if this error is the expected pool-full outcome.
    pub fn is_exhausted(&self) -> bool {
        matches!(self, CoreError::ResourceExhausted(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CoreError::NotFound("sig42_1".to_string());
        assert_eq!(err.to_string(), "no lease for owner: sig42_1");
    }

    #[test]
    fn test_classification() {
        assert!(CoreError::NotFound("x".into()).is_not_found());
        assert!(CoreError::ResourceExhausted(4).is_exhausted());
        assert!(!CoreError::ResourceExhausted(4).is_not_found());
    }
}
