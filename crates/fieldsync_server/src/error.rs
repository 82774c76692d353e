//! Error types for the sync server.

use fieldsync_protocol::ProtocolError;
use thiserror::Error;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// SQLite result codes for busy/locked conditions, including extended codes.
const SQLITE_BUSY_CODES: &[&str] = &["5", "6", "261", "262", "517"];

/// Errors that can occur in the sync server.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Invalid request format or contents.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Message could not be decoded or encoded.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// No endpoint at the requested path.
    #[error("not found: {0}")]
    NotFound(String),

    /// Caller could not be authenticated.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Caller is authenticated but not allowed.
    #[error("not authorized: {0}")]
    NotAuthorized(String),

    /// Body tenant differs from the caller's active tenant.
    #[error("tenant mismatch: request for {requested}, caller is active in {active}")]
    TenantMismatch {
        /// Tenant named in the request body.
        requested: String,
        /// Tenant resolved from the caller's session.
        active: String,
    },

    /// Another transaction won a write race (unique violation, busy database).
    #[error("write conflict: {0}")]
    WriteConflict(String),

    /// Bounded retries of a conflicting write ran out.
    #[error("gave up after {attempts} attempts: {last}")]
    RetriesExhausted {
        /// Attempts made.
        attempts: u32,
        /// Last conflict seen.
        last: String,
    },

    /// Database error.
    #[error("database error: {0}")]
    Database(sqlx::Error),

    /// Schema migration failed.
    #[error("migration {name} failed: {message}")]
    Migration {
        /// Migration file name.
        name: String,
        /// Underlying failure.
        message: String,
    },

    /// Server misconfiguration.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<sqlx::Error> for ServerError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &err {
            let busy = db
                .code()
                .is_some_and(|code| SQLITE_BUSY_CODES.contains(&code.as_ref()));
            if db.is_unique_violation() || busy {
                return ServerError::WriteConflict(db.message().to_string());
            }
        }
        ServerError::Database(err)
    }
}

impl ServerError {
    /// Returns true if re-running the whole transaction may succeed.
    pub fn is_retryable_conflict(&self) -> bool {
        matches!(self, ServerError::WriteConflict(_))
    }

    /// Returns true if this is a client error (4xx).
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            ServerError::InvalidRequest(_)
                | ServerError::Protocol(_)
                | ServerError::NotFound(_)
                | ServerError::AuthenticationFailed(_)
                | ServerError::NotAuthorized(_)
                | ServerError::TenantMismatch { .. }
        )
    }

    /// Returns true if this is a server error (5xx).
    pub fn is_server_error(&self) -> bool {
        !self.is_client_error()
    }

    /// HTTP status for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            ServerError::InvalidRequest(_) | ServerError::Protocol(_) => 400,
            ServerError::AuthenticationFailed(_) => 401,
            ServerError::NotFound(_) => 404,
            ServerError::NotAuthorized(_) | ServerError::TenantMismatch { .. } => 403,
            ServerError::WriteConflict(_) | ServerError::RetriesExhausted { .. } => 503,
            _ => 500,
        }
    }

    /// Machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            ServerError::InvalidRequest(_) => "invalid_request",
            ServerError::Protocol(_) => "protocol",
            ServerError::NotFound(_) => "not_found",
            ServerError::AuthenticationFailed(_) => "unauthenticated",
            ServerError::NotAuthorized(_) => "forbidden",
            ServerError::TenantMismatch { .. } => "tenant_mismatch",
            ServerError::WriteConflict(_) => "write_conflict",
            ServerError::RetriesExhausted { .. } => "retries_exhausted",
            ServerError::Database(_) | ServerError::Migration { .. } => "database",
            ServerError::Configuration(_) => "configuration",
            ServerError::Internal(_) | ServerError::Io(_) => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_classification() {
        assert!(ServerError::InvalidRequest("bad".into()).is_client_error());
        assert!(ServerError::Internal("oops".into()).is_server_error());
        assert!(!ServerError::InvalidRequest("bad".into()).is_server_error());
        assert!(ServerError::WriteConflict("busy".into()).is_retryable_conflict());
        assert!(!ServerError::Internal("oops".into()).is_retryable_conflict());
    }

    #[test]
    fn tenant_mismatch_is_forbidden() {
        let err = ServerError::TenantMismatch {
            requested: "loc-2".into(),
            active: "loc-1".into(),
        };
        assert_eq!(err.status_code(), 403);
        assert_eq!(err.code(), "tenant_mismatch");
        let msg = err.to_string();
        assert!(msg.contains("loc-1"));
        assert!(msg.contains("loc-2"));
    }

    #[test]
    fn non_database_sqlx_errors_are_not_conflicts() {
        let err = ServerError::from(sqlx::Error::RowNotFound);
        assert!(matches!(err, ServerError::Database(_)));
        assert!(!err.is_retryable_conflict());
    }
}
