//! Progress tracker error types.

use thiserror::Error;

/// Result type for progress operations.
pub type TrackerResult<T> = Result<T, TrackerError>;

/// Errors that can occur while querying task progress.
#[derive(Debug, Error)]
pub enum TrackerError {
    /// The credential was rejected.
    #[error("Unauthorized: credential rejected by the progress service")]
    Unauthorized,

    /// The upstream does not know this task.
    #[error("Task not found: {0}")]
    NotFound(String),

    #[error("Failed to connect to progress service at {url}: {message}")]
    ConnectionFailed { url: String, message: String },

    /// HTTP request failed.
    #[error("HTTP request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),

    /// The progress service returned an error response.
    #[error("Progress service error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Failed to parse response: {0}")]
    ParseError(String),
}

impl TrackerError {
    /// Whether a later attempt may succeed without user action.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, TrackerError::Unauthorized | TrackerError::NotFound(_))
    }

    /// HTTP status the upstream answered with, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            TrackerError::Unauthorized => Some(401),
            TrackerError::NotFound(_) => Some(404),
            TrackerError::Api { status, .. } => Some(*status),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_and_missing_tasks_are_definitive() {
        assert!(!TrackerError::Unauthorized.is_recoverable());
        assert!(!TrackerError::NotFound("t1".into()).is_recoverable());
        assert!(
            TrackerError::Api {
                status: 503,
                message: "busy".into()
            }
            .is_recoverable()
        );
        assert!(TrackerError::ParseError("eof".into()).is_recoverable());
    }
}
