use rusqlite::ffi::ErrorCode;
use thiserror::Error;

pub type Result<T, E = MetaError> = std::result::Result<T, E>;

/// Errors surfaced by the metadata store.
///
/// Callers never see raw backend errors at a component boundary without a
/// classification; branch on [`MetaError::class`], not on message text.
#[derive(Debug, Error)]
pub enum MetaError {
    #[error("{what} not found: {id}")]
    NotFound { what: &'static str, id: String },

    #[error("{0}")]
    Conflict(String),

    #[error("invalid {what}: {reason}")]
    Invalid { what: &'static str, reason: String },

    #[error("database error")]
    Db(#[from] rusqlite::Error),

    #[error("malformed {column} column")]
    Decode {
        column: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// The §failure-semantics classification of an error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    /// Worth retrying with backoff: lock contention, busy handles, I/O
    /// hiccups.
    Transient,
    /// Bad input or schema-level violation; retrying cannot help.
    Permanent,
    /// The referenced row does not exist.
    NotFound,
}

impl MetaError {
    pub fn class(&self) -> ErrorClass {
        match self {
            MetaError::NotFound { .. } => ErrorClass::NotFound,
            MetaError::Conflict(_) | MetaError::Invalid { .. } | MetaError::Decode { .. } => {
                ErrorClass::Permanent
            }
            MetaError::Db(db) => classify_db(db),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    pub(crate) fn not_found(what: &'static str, id: impl ToString) -> Self {
        MetaError::NotFound {
            what,
            id: id.to_string(),
        }
    }
}

fn classify_db(err: &rusqlite::Error) -> ErrorClass {
    match err {
        rusqlite::Error::SqliteFailure(e, _) => match e.code {
            ErrorCode::DatabaseBusy
            | ErrorCode::DatabaseLocked
            | ErrorCode::SystemIoFailure
            | ErrorCode::DiskFull
            | ErrorCode::OutOfMemory => ErrorClass::Transient,
            ErrorCode::ConstraintViolation
            | ErrorCode::TypeMismatch
            | ErrorCode::PermissionDenied
            | ErrorCode::ReadOnly => ErrorClass::Permanent,
            _ => ErrorClass::Permanent,
        },
        rusqlite::Error::QueryReturnedNoRows => ErrorClass::NotFound,
        _ => ErrorClass::Permanent,
    }
}
