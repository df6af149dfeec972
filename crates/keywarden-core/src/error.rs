// ABOUTME: Error types for credential authorization using thiserror.
// ABOUTME: Separates collaborator (API) failures from domain-level authorization failures.

use keywarden_ssh::SshError;
use thiserror::Error;

/// Failure reported by an external collaborator (metadata store, permission
/// service, OS Login backend).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    /// The remote service answered with a non-success HTTP status.
    #[error("HTTP {code}: {message}")]
    Status { code: u16, message: String },

    /// The call was abandoned because the caller cancelled.
    #[error("request cancelled")]
    Cancelled,

    /// The request never produced a response.
    #[error("transport error: {0}")]
    Transport(String),
}

impl ApiError {
    pub fn status(code: u16, message: impl Into<String>) -> Self {
        ApiError::Status {
            code,
            message: message.into(),
        }
    }

    fn code(&self) -> Option<u16> {
        match self {
            ApiError::Status { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub fn is_bad_request(&self) -> bool {
        self.code() == Some(400)
    }

    pub fn is_access_denied(&self) -> bool {
        self.code() == Some(403)
    }

    pub fn is_not_found(&self) -> bool {
        self.code() == Some(404)
    }

    /// HTTP 412: a conditional write lost an optimistic-concurrency race.
    pub fn is_conflict(&self) -> bool {
        self.code() == Some(412)
    }

    pub fn is_unavailable(&self) -> bool {
        self.code() == Some(503)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ApiError::Cancelled)
    }

    /// Message text of a status error, empty otherwise.
    pub fn message(&self) -> &str {
        match self {
            ApiError::Status { message, .. } => message,
            _ => "",
        }
    }
}

/// Errors that end a credential authorization attempt.
///
/// A failed attempt never yields a usable credential.
#[derive(Error, Debug)]
pub enum AuthorizationError {
    /// The request itself is unusable (invalid username, no scope permitted).
    #[error("invalid request: {0}")]
    Validation(String),

    /// Instance or project policy forbids what the caller asked for.
    #[error("{0}")]
    Policy(String),

    /// The instance still carries keys in the legacy single-key metadata field.
    #[error("{0}")]
    LegacyFormat(String),

    /// A metadata or OS Login write was denied.
    #[error("{message}")]
    Permission {
        message: String,
        #[source]
        source: ApiError,
    },

    /// Optimistic-concurrency retries were exhausted.
    #[error("metadata of {resource} kept changing concurrently, gave up after {attempts} attempts")]
    Conflict { resource: String, attempts: u32 },

    /// A resource or login profile does not exist.
    #[error("{message}")]
    NotFound {
        message: String,
        #[source]
        source: ApiError,
    },

    /// The caller cancelled the attempt.
    #[error("operation was cancelled")]
    Cancelled,

    /// A key record or certificate could not be parsed.
    #[error("malformed {what} '{excerpt}': {reason}")]
    Format {
        what: &'static str,
        excerpt: String,
        reason: String,
    },

    /// The OS Login profile lacks a usable POSIX account.
    #[error("invalid OS Login profile: {0}")]
    InvalidProfile(String),

    /// Local key material could not be created or used.
    #[error(transparent)]
    Ssh(#[from] SshError),

    /// Any other collaborator failure.
    #[error("{context}: {source}")]
    Api {
        context: String,
        #[source]
        source: ApiError,
    },
}

impl AuthorizationError {
    /// Classify a collaborator failure that has no more specific meaning.
    ///
    /// Cancellation and not-found keep their own kinds; everything else is
    /// wrapped with `context`.
    pub fn api(context: impl Into<String>, source: ApiError) -> Self {
        let context = context.into();
        if source.is_cancelled() {
            AuthorizationError::Cancelled
        } else if source.is_not_found() {
            AuthorizationError::NotFound {
                message: context,
                source,
            }
        } else {
            AuthorizationError::Api { context, source }
        }
    }

    /// Whether the attempt ended because the caller cancelled it.
    ///
    /// Callers use this to suppress error reporting for user-initiated
    /// cancellation.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, AuthorizationError::Cancelled)
    }
}

/// Result type alias using AuthorizationError.
pub type Result<T> = std::result::Result<T, AuthorizationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_error_classification() {
        assert!(ApiError::status(400, "x").is_bad_request());
        assert!(ApiError::status(403, "x").is_access_denied());
        assert!(ApiError::status(404, "x").is_not_found());
        assert!(ApiError::status(412, "x").is_conflict());
        assert!(ApiError::status(503, "x").is_unavailable());
        assert!(ApiError::Cancelled.is_cancelled());
        assert!(!ApiError::Transport("reset".into()).is_conflict());
    }

    #[test]
    fn test_api_error_message() {
        assert_eq!(ApiError::status(400, "bad").message(), "bad");
        assert_eq!(ApiError::Cancelled.message(), "");
    }

    #[test]
    fn test_api_classifier_keeps_cancellation_distinct() {
        let err = AuthorizationError::api("reading project", ApiError::Cancelled);
        assert!(err.is_cancellation());
    }

    #[test]
    fn test_api_classifier_maps_not_found() {
        let err = AuthorizationError::api("reading instance", ApiError::status(404, "gone"));
        assert!(matches!(err, AuthorizationError::NotFound { .. }));
        assert!(err.to_string().contains("reading instance"));
    }

    #[test]
    fn test_api_classifier_wraps_other_errors() {
        let err = AuthorizationError::api("reading instance", ApiError::status(500, "boom"));
        assert!(matches!(err, AuthorizationError::Api { .. }));
        assert!(err.to_string().contains("HTTP 500"));
        assert!(!err.is_cancellation());
    }

    #[test]
    fn test_conflict_display() {
        let err = AuthorizationError::Conflict {
            resource: "project p".to_string(),
            attempts: 6,
        };
        let display = err.to_string();
        assert!(display.contains("project p"));
        assert!(display.contains("6 attempts"));
    }

    #[test]
    fn test_permission_error_source() {
        use std::error::Error;

        let err = AuthorizationError::Permission {
            message: "denied".to_string(),
            source: ApiError::status(403, "forbidden"),
        };
        assert!(err.source().is_some());
    }

    #[test]
    fn test_ssh_error_converts() {
        let err: AuthorizationError = SshError::Sign("bad".to_string()).into();
        assert!(matches!(err, AuthorizationError::Ssh(_)));
    }
}
