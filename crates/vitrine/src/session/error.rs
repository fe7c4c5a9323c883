//! Errors surfaced by the demo-session coordinator.

use thiserror::Error;

use crate::container::ContainerError;

#[derive(Debug, Error)]
pub enum DemoError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("container runtime error: {0}")]
    Infrastructure(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("session {session_id} failed to start: {message}")]
    StartFailed { session_id: String, message: String },

    #[error("storage error: {0:#}")]
    Storage(#[from] anyhow::Error),
}

pub type DemoResult<T> = Result<T, DemoError>;

impl From<ContainerError> for DemoError {
    fn from(err: ContainerError) -> Self {
        match err {
            ContainerError::Timeout(msg) => DemoError::Timeout(msg),
            other => DemoError::Infrastructure(other.to_string()),
        }
    }
}

/// Whether a storage error was caused by a unique constraint.
///
/// sqlx hides the SQLite error code behind a boxed trait object, so fall back
/// to the message when the structured check misses.
pub fn is_unique_violation(err: &anyhow::Error) -> bool {
    for cause in err.chain() {
        if let Some(sqlx::Error::Database(db)) = cause.downcast_ref::<sqlx::Error>()
            && db.is_unique_violation()
        {
            return true;
        }
    }
    err.chain()
        .any(|cause| cause.to_string().to_lowercase().contains("unique constraint"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_timeout_maps_to_timeout() {
        let err: DemoError = ContainerError::Timeout("port 3000".into()).into();
        assert!(matches!(err, DemoError::Timeout(_)));

        let err: DemoError = ContainerError::ImageNotFound("demo/shop".into()).into();
        assert!(matches!(err, DemoError::Infrastructure(_)));
    }

    #[test]
    fn test_unique_violation_by_message() {
        let err = anyhow::anyhow!("UNIQUE constraint failed: demo_sessions.project_name")
            .context("inserting session");
        assert!(is_unique_violation(&err));
        assert!(!is_unique_violation(&anyhow::anyhow!("disk I/O error")));
    }
}
