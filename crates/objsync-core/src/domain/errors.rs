//! Domain error types
//!
//! Raised when mapping between object names and local paths.

use thiserror::Error;

/// Errors that can occur in domain operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Object name is empty or would escape the sync root
    #[error("Invalid object name: {0}")]
    InvalidObjectName(String),

    /// Path is not within the configured sync root
    #[error("Path not within sync root: {0}")]
    PathNotInSyncRoot(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DomainError::PathNotInSyncRoot("/elsewhere/a.txt".to_string());
        assert_eq!(err.to_string(), "Path not within sync root: /elsewhere/a.txt");

        let err = DomainError::InvalidObjectName("../etc/passwd".to_string());
        assert_eq!(err.to_string(), "Invalid object name: ../etc/passwd");
    }

    #[test]
    fn test_error_equality() {
        let err1 = DomainError::PathNotInSyncRoot("/a".to_string());
        let err2 = DomainError::PathNotInSyncRoot("/a".to_string());
        let err3 = DomainError::PathNotInSyncRoot("/b".to_string());

        assert_eq!(err1, err2);
        assert_ne!(err1, err3);
    }
}
