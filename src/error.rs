use thiserror::Error;

/// Custom result type for DMS operations
pub type Result<T> = std::result::Result<T, DmsError>;

/// Error taxonomy for the regulated DMS control plane.
///
/// Authentication variants deliberately carry no detail that would reveal
/// whether a username exists.
#[derive(Error, Debug)]
pub enum DmsError {
    /// Credential verification failed at login
    #[error("invalid username or password")]
    InvalidCredentials,

    /// Principal exists but has been deactivated
    #[error("account is deactivated")]
    Deactivated,

    /// Another session is already active for this principal
    #[error("an active session already exists for this account")]
    SessionConflict,

    /// The presented session token has been superseded by a newer login
    #[error("session has been superseded by a newer login")]
    SessionSuperseded,

    /// E-signature re-verification failed; no transition occurred
    #[error("e-signature verification failed")]
    ESignatureMismatch,

    /// Capability check failed
    #[error("permission denied: {action}")]
    PermissionDenied { action: String },

    /// The state machine rejected the requested transition
    #[error("illegal transition from '{from}' via {action}")]
    IllegalTransition { from: String, action: String },

    /// Operation requires the version to be in a different status
    #[error("operation requires status '{required}' but version is '{actual}'")]
    IllegalStatus { required: String, actual: String },

    /// An active edit lock is held by another principal
    #[error("version is locked by {holder} until {expires_at}")]
    Locked { holder: String, expires_at: String },

    /// Caller does not hold the edit lock required for this mutation
    #[error("edit lock is not held for this version")]
    LockNotHeld,

    /// The presented lock token refers to an expired lease
    #[error("edit lock has expired")]
    LockExpired,

    /// Optimistic content-hash check failed; carries the current hash so the
    /// client can re-render and retry
    #[error("content conflict: version has changed (current hash {current_hash})")]
    Conflict { current_hash: String },

    /// Entity lookup failed
    #[error("{resource} not found: {id}")]
    NotFound { resource: String, id: String },

    /// Unique constraint would be violated
    #[error("{resource} already exists: {id}")]
    AlreadyExists { resource: String, id: String },

    /// Structural input validation failed
    #[error("validation error: {field} - {message}")]
    Validation { field: String, message: String },

    /// A detected attempt to break a core invariant; aborts the transaction
    #[error("invariant violation: {message}")]
    InvariantViolation { message: String },

    /// Persistent store errors
    #[error("database error: {message}")]
    Database { message: String },

    /// Audit trail errors (critical for Part 11 compliance)
    #[error("audit trail error: {message}")]
    AuditTrail { message: String },

    /// File system operations errors (attachment blobs, logs)
    #[error("file system error: {path} - {message}")]
    FileSystem { path: String, message: String },

    /// Serialization/Deserialization errors
    #[error("serialization error: {message}")]
    Serialization { message: String },

    /// Configuration errors
    #[error("configuration error: {message}")]
    Config { message: String },
}

impl DmsError {
    /// Stable error code surfaced alongside the human message
    pub fn error_code(&self) -> &'static str {
        match self {
            DmsError::InvalidCredentials => "AUTH_INVALID_CREDENTIALS",
            DmsError::Deactivated => "AUTH_DEACTIVATED",
            DmsError::SessionConflict => "AUTH_SESSION_CONFLICT",
            DmsError::SessionSuperseded => "AUTH_SESSION_SUPERSEDED",
            DmsError::ESignatureMismatch => "AUTH_ESIGNATURE_MISMATCH",
            DmsError::PermissionDenied { .. } => "PERMISSION_DENIED",
            DmsError::IllegalTransition { .. } => "ILLEGAL_TRANSITION",
            DmsError::IllegalStatus { .. } => "ILLEGAL_STATUS",
            DmsError::Locked { .. } => "LOCKED",
            DmsError::LockNotHeld => "LOCK_NOT_HELD",
            DmsError::LockExpired => "LOCK_EXPIRED",
            DmsError::Conflict { .. } => "CONFLICT",
            DmsError::NotFound { .. } => "NOT_FOUND",
            DmsError::AlreadyExists { .. } => "ALREADY_EXISTS",
            DmsError::Validation { .. } => "VALIDATION_ERROR",
            DmsError::InvariantViolation { .. } => "INVARIANT_VIOLATION",
            DmsError::Database { .. } => "DB_ERROR",
            DmsError::AuditTrail { .. } => "AUDIT_ERROR",
            DmsError::FileSystem { .. } => "FS_ERROR",
            DmsError::Serialization { .. } => "SER_ERROR",
            DmsError::Config { .. } => "CFG_ERROR",
        }
    }

    /// Whether the error maps to a 5xx-class response; everything else is a
    /// client-side failure
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            DmsError::InvariantViolation { .. }
                | DmsError::Database { .. }
                | DmsError::AuditTrail { .. }
                | DmsError::FileSystem { .. }
                | DmsError::Serialization { .. }
                | DmsError::Config { .. }
        )
    }

    pub fn not_found(resource: &str, id: &str) -> Self {
        DmsError::NotFound {
            resource: resource.to_string(),
            id: id.to_string(),
        }
    }

    pub fn validation(field: &str, message: impl Into<String>) -> Self {
        DmsError::Validation {
            field: field.to_string(),
            message: message.into(),
        }
    }

    pub fn permission_denied(action: &str) -> Self {
        DmsError::PermissionDenied {
            action: action.to_string(),
        }
    }

    pub fn invariant(message: impl Into<String>) -> Self {
        DmsError::InvariantViolation {
            message: message.into(),
        }
    }
}

impl From<rusqlite::Error> for DmsError {
    fn from(err: rusqlite::Error) -> Self {
        DmsError::Database {
            message: err.to_string(),
        }
    }
}

impl From<std::io::Error> for DmsError {
    fn from(err: std::io::Error) -> Self {
        DmsError::FileSystem {
            path: "unknown".to_string(),
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for DmsError {
    fn from(err: serde_json::Error) -> Self {
        DmsError::Serialization {
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_are_stable() {
        assert_eq!(DmsError::InvalidCredentials.error_code(), "AUTH_INVALID_CREDENTIALS");
        assert_eq!(DmsError::LockNotHeld.error_code(), "LOCK_NOT_HELD");
        assert_eq!(
            DmsError::Conflict { current_hash: "abc".to_string() }.error_code(),
            "CONFLICT"
        );
        assert_eq!(
            DmsError::invariant("two effective versions").error_code(),
            "INVARIANT_VIOLATION"
        );
    }

    #[test]
    fn test_internal_classification() {
        assert!(DmsError::invariant("broken").is_internal());
        assert!(DmsError::Database { message: "locked".to_string() }.is_internal());
        assert!(!DmsError::InvalidCredentials.is_internal());
        assert!(!DmsError::LockExpired.is_internal());
    }

    #[test]
    fn test_auth_errors_do_not_leak_username() {
        let msg = DmsError::InvalidCredentials.to_string();
        assert_eq!(msg, "invalid username or password");
    }

    #[test]
    fn test_conflict_carries_current_hash() {
        let err = DmsError::Conflict { current_hash: "deadbeef".to_string() };
        assert!(err.to_string().contains("deadbeef"));
    }

    #[test]
    fn test_conversion_from_io() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "no such file");
        let err: DmsError = io_error.into();
        match err {
            DmsError::FileSystem { message, .. } => assert!(message.contains("no such file")),
            _ => panic!("expected FileSystem error"),
        }
    }
}
