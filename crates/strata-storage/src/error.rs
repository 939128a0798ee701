//! Storage error types for strata-storage.
//!
//! [`StorageError`] covers all anticipated failure modes in the engine:
//! backend statement failures, schema-permission refusals, store version
//! gating, unresolved deferred references, and integrity violations.

use thiserror::Error;

use strata_core::CoreError;

/// Errors produced by the persistence and schema-evolution engine.
#[derive(Debug, Error)]
pub enum StorageError {
    /// A backend statement failed; wraps the native error.
    #[error("sql error: {0}")]
    Sql(#[from] rusqlite::Error),

    /// JSON serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An object-model error (unknown class, handle, property...).
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Catalog bootstrap failed.
    #[error("migration error: {0}")]
    Migration(String),

    /// A required table or column is missing and schema creation is
    /// disabled. Never downgraded; always surfaced to the caller.
    #[error("schema object missing and schema creation is disabled: {object}")]
    SchemaPermission { object: String },

    /// The on-disk store was written by a newer engine. Fatal.
    #[error("store version {found} is newer than supported version {supported}")]
    IncompatibleVersion { found: i64, supported: i64 },

    /// The on-disk store predates the earliest version this engine can
    /// migrate. Fatal; never silently migrated.
    #[error("store version {found} is older than earliest supported version {earliest}")]
    UnsupportedVersion { found: i64, earliest: i64 },

    /// A deferred reference record was still unresolved when the enclosing
    /// save completed: the cycle never closed. The transaction is rolled
    /// back rather than leaving a dangling NULL.
    #[error("unresolved deferred reference to class {class} after save")]
    UnresolvedReference { class: String },

    /// An internal invariant was violated.
    #[error("integrity error: {reason}")]
    Integrity { reason: String },
}

impl StorageError {
    pub(crate) fn integrity(reason: impl Into<String>) -> Self {
        StorageError::Integrity {
            reason: reason.into(),
        }
    }
}

/// True when a backend error is SQLite's signal for a missing table or
/// index. Used only to swallow failures of best-effort drops.
///
/// SQLite reports these under the generic SQLITE_ERROR primary code, so
/// after matching the code the message prefix is the documented fallback
/// discriminator.
pub(crate) fn is_missing_schema_object(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(inner, Some(message)) => {
            inner.extended_code == rusqlite::ffi::SQLITE_ERROR
                && (message.starts_with("no such table") || message.starts_with("no such index"))
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_table_error_is_recognized() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        let err = conn
            .execute("DROP TABLE NO_SUCH_TABLE", [])
            .expect_err("drop of a missing table must fail");
        assert!(is_missing_schema_object(&err));
    }

    #[test]
    fn missing_index_error_is_recognized() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        let err = conn
            .execute("DROP INDEX NO_SUCH_INDEX", [])
            .expect_err("drop of a missing index must fail");
        assert!(is_missing_schema_object(&err));
    }

    #[test]
    fn other_errors_are_not_swallowed() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        let err = conn
            .execute("THIS IS NOT SQL", [])
            .expect_err("syntax error expected");
        assert!(!is_missing_schema_object(&err));
    }
}
