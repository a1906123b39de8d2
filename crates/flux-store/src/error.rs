//! Error types for the flux-store crate.
//!
//! All storage operations return [`StoreError`] via [`StoreResult`]. At the
//! crate boundary, [`StoreError`] converts into [`flux_kernel::FluxError`]
//! (see the `From` impl below) per the taxonomy in the specification's
//! error-handling design: row-not-found maps to `NotFound`, a `UNIQUE`
//! violation to `InvalidRequest`/`EntityAlreadyExists` depending on call
//! site, a `FOREIGN KEY` violation to `InvalidRequest`, everything else to
//! `Internal`.

use flux_kernel::FluxError;
use rusqlite::ErrorCode;
use thiserror::Error;

/// Alias for `Result<T, StoreError>`.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur in the storage engine.
#[derive(Debug, Error)]
pub enum StoreError {
    /// SQLite operation failed.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// JSON serialization or deserialization failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// A schema migration failed.
    #[error("migration v{version} failed: {message}")]
    Migration { version: u32, message: String },

    /// The requested record was not found.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// The record already exists (a `UNIQUE` constraint was violated on an
    /// insert where that means "a peer already wrote this").
    #[error("{entity} already exists: {id}")]
    AlreadyExists { entity: &'static str, id: String },

    /// An invalid argument was provided to a store operation.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A blocking task was cancelled or panicked.
    #[error("background task failed: {0}")]
    TaskJoin(String),
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::TaskJoin(err.to_string())
    }
}

/// Classifies a raw `rusqlite::Error` by SQLite error code, the way a
/// call site translates "this insert failed" into "this entity already
/// exists" versus "something is actually broken".
pub fn classify_sqlite(err: rusqlite::Error, entity: &'static str, id: impl Into<String>) -> StoreError {
    if let rusqlite::Error::SqliteFailure(ref sqlite_err, _) = err {
        match sqlite_err.code {
            ErrorCode::ConstraintViolation => {
                let msg = err.to_string();
                if msg.contains("UNIQUE") || msg.contains("PRIMARY KEY") {
                    return StoreError::AlreadyExists {
                        entity,
                        id: id.into(),
                    };
                }
                if msg.contains("FOREIGN KEY") {
                    return StoreError::InvalidArgument(format!(
                        "{entity} references a nonexistent row: {msg}"
                    ));
                }
                StoreError::InvalidArgument(msg)
            }
            _ => StoreError::Sqlite(err),
        }
    } else {
        StoreError::Sqlite(err)
    }
}

impl From<StoreError> for FluxError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { entity, id } => FluxError::NotFound { entity, id },
            StoreError::AlreadyExists { entity, id } => {
                FluxError::EntityAlreadyExists(format!("{entity} {id}"))
            }
            StoreError::InvalidArgument(msg) => FluxError::InvalidRequest(msg),
            StoreError::Migration { version, message } => {
                FluxError::Internal(format!("migration v{version} failed: {message}"))
            }
            other => FluxError::Internal(other.to_string()),
        }
    }
}
