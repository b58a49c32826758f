//! Error types for the lockq job queue library.

use thiserror::Error;

use crate::job::JobId;

/// The main error type for the lockq library.
#[derive(Error, Debug)]
pub enum LockqError {
    /// Returned when a job is enqueued without a type.
    #[error("job type must be specified")]
    MissingType,

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Store-specific error.
    #[error("Backend error: {0}")]
    Backend(String),

    /// The store connection is gone; retrying will not help.
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// Claiming a job failed after the transaction was opened.
    #[error("could not lock a job (rollback result: {rollback}): {source}")]
    LockJob {
        rollback: String,
        #[source]
        source: Box<LockqError>,
    },

    /// Done or Error could not be persisted for a claimed job.
    #[error("could not {action} job {job_id} (rollback result: {rollback}): {source}")]
    Settle {
        action: &'static str,
        job_id: JobId,
        rollback: String,
        #[source]
        source: Box<LockqError>,
    },

    /// A job was settled twice.
    #[error("job {0} is no longer bound to a transaction")]
    Settled(JobId),

    /// A worker task panicked outside of a job handler.
    #[error("Worker panicked: {0}")]
    WorkerPanicked(String),
}

impl LockqError {
    /// Whether this error, or any error it wraps, means the store is unreachable.
    pub fn is_connection_lost(&self) -> bool {
        match self {
            LockqError::ConnectionLost(_) => true,
            LockqError::LockJob { source, .. } | LockqError::Settle { source, .. } => {
                source.is_connection_lost()
            }
            _ => false,
        }
    }
}

/// Result type alias using LockqError.
pub type Result<T> = std::result::Result<T, LockqError>;

/// Render a rollback outcome for inclusion in a wrapping error.
pub(crate) fn rollback_result(result: &Result<()>) -> String {
    match result {
        Ok(()) => "ok".to_string(),
        Err(e) => e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_missing_type() {
        assert_eq!(
            LockqError::MissingType.to_string(),
            "job type must be specified"
        );
    }

    #[test]
    fn test_error_display_config() {
        let err = LockqError::Config("poll_interval must be greater than 0".to_string());
        assert_eq!(
            err.to_string(),
            "Configuration error: poll_interval must be greater than 0"
        );
    }

    #[test]
    fn test_error_display_lock_job() {
        let err = LockqError::LockJob {
            rollback: "ok".to_string(),
            source: Box::new(LockqError::Backend("relation does not exist".to_string())),
        };
        assert_eq!(
            err.to_string(),
            "could not lock a job (rollback result: ok): Backend error: relation does not exist"
        );
    }

    #[test]
    fn test_error_display_settle() {
        let err = LockqError::Settle {
            action: "delete",
            job_id: JobId(7),
            rollback: "Backend error: gone".to_string(),
            source: Box::new(LockqError::Backend("timeout".to_string())),
        };
        assert_eq!(
            err.to_string(),
            "could not delete job 7 (rollback result: Backend error: gone): Backend error: timeout"
        );
    }

    #[test]
    fn test_error_from_serde_json() {
        let json_err: serde_json::Error = serde_json::from_str::<i32>("not a number").unwrap_err();
        let err: LockqError = json_err.into();
        assert!(matches!(err, LockqError::Serialization(_)));
    }

    #[test]
    fn test_connection_lost_is_detected_through_wrappers() {
        let err = LockqError::LockJob {
            rollback: "Connection lost: broken pipe".to_string(),
            source: Box::new(LockqError::ConnectionLost("broken pipe".to_string())),
        };
        assert!(err.is_connection_lost());
        assert!(!LockqError::Backend("deadlock".to_string()).is_connection_lost());
    }

    #[test]
    fn test_rollback_result() {
        assert_eq!(rollback_result(&Ok(())), "ok");
        assert_eq!(
            rollback_result(&Err(LockqError::Backend("x".to_string()))),
            "Backend error: x"
        );
    }
}
