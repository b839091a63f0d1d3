//! Errors surfaced by cluster access.

use thiserror::Error;

/// Cluster-facing error. `NotFound` and `AlreadyExists` are frequently expected
/// outcomes and are matched on by callers rather than propagated.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ClusterError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The server does not serve the requested kind.
    #[error("unsupported resource: {0}")]
    Unsupported(String),

    #[error("api error ({code}): {message}")]
    Api { code: u16, message: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ClusterError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClusterError::NotFound(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, ClusterError::AlreadyExists(_))
    }

    pub fn api(code: u16, message: impl Into<String>) -> Self {
        ClusterError::Api { code, message: message.into() }
    }
}

pub type ClusterResult<T> = Result<T, ClusterError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expected_outcomes_are_matchable() {
        assert!(ClusterError::NotFound("x".into()).is_not_found());
        assert!(ClusterError::AlreadyExists("x".into()).is_already_exists());
        assert!(!ClusterError::api(403, "forbidden").is_not_found());
        assert_eq!(ClusterError::api(403, "forbidden").to_string(), "api error (403): forbidden");
    }

    #[test]
    fn anyhow_errors_convert_transparently() {
        let e: ClusterError = anyhow::anyhow!("boom").into();
        assert_eq!(e.to_string(), "boom");
    }
}
