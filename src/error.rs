//! Error types for replicas, drivers and formats.

/// A document, address, path, timestamp, signature or schema rejection.
///
/// Expected conditions are returned as values, so this type is `Clone` and
/// comparable; the reason string names the failing rule.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{reason}")]
pub struct ValidationError {
    /// Human-readable description of the rule that failed.
    pub reason: String,
}

impl ValidationError {
    /// Create a new validation error with the given reason.
    pub fn new(reason: impl Into<String>) -> Self {
        ValidationError {
            reason: reason.into(),
        }
    }
}

/// Lower-level failures surfaced by document and attachment drivers.
///
/// The replica wraps these rather than exposing raw backend errors.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// An I/O error from a file-backed driver.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    /// An error from the embedded database backend.
    #[error("database error: {0}")]
    Database(#[source] anyhow::Error),
    /// The driver was already closed.
    #[error("driver is closed")]
    Closed,
    /// The driver was asked to close a second time.
    #[error("driver was already closed")]
    AlreadyClosed,
    /// A backend connection failed.
    #[error("connection failed: {0}")]
    Connection(String),
    /// A backend operation timed out.
    #[error("timed out: {0}")]
    Timeout(String),
}

/// Any error a replica operation can return.
#[derive(Debug, thiserror::Error)]
pub enum ReplicaError {
    /// The input failed validation. Carries the failing rule.
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),
    /// The replica was closed before or during the operation.
    #[error("replica is closed")]
    ReplicaIsClosed,
    /// The query cache was closed before or during the operation.
    #[error("replica cache is closed")]
    ReplicaCacheIsClosed,
    /// A document or attachment was required but is not present.
    #[error("not found: {0}")]
    NotFound(String),
    /// The format does not implement the requested capability.
    #[error("not supported: {0}")]
    NotSupported(String),
    /// A driver failed below the replica.
    #[error("storage failed: {0}")]
    Storage(#[from] StorageError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_error_displays_reason() {
        let err = ValidationError::new("path too short");
        assert_eq!(err.to_string(), "path too short");
        let wrapped = ReplicaError::from(err);
        assert!(wrapped.to_string().contains("path too short"));
    }

    #[test]
    fn storage_error_wraps_io() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk on fire");
        let err = ReplicaError::from(StorageError::from(io));
        assert!(matches!(err, ReplicaError::Storage(StorageError::Io(_))));
    }
}
