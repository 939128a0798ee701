//! System catalog bootstrap for the SQLite backend.
//!
//! Uses `rusqlite_migration` to manage the catalog schema via SQLite's
//! `user_version` pragma. Migrations are embedded at compile time via
//! `include_str!`. The engine's own logical store version lives in the
//! `SYS_VERSION` row and is gated separately (see [`crate::meta`]).

use rusqlite::Connection;
use rusqlite_migration::{Migrations, M};

use crate::error::StorageError;

/// All catalog migrations, applied in order via `user_version` tracking.
fn migrations() -> Migrations<'static> {
    Migrations::new(vec![
        M::up(include_str!("migrations/001_system_catalog.sql")),
        // Future catalog migrations added here as new M::up(...) entries.
    ])
}

/// Opens (or creates) a SQLite database at `path` with WAL mode and the
/// system catalog bootstrapped.
pub fn open_database(path: &str) -> Result<Connection, StorageError> {
    let mut conn = Connection::open(path)?;
    configure_and_migrate(&mut conn)?;
    Ok(conn)
}

/// Opens an in-memory SQLite database with the system catalog bootstrapped.
pub fn open_in_memory() -> Result<Connection, StorageError> {
    let mut conn = Connection::open_in_memory()?;
    configure_and_migrate(&mut conn)?;
    Ok(conn)
}

/// Configures pragmas and applies pending catalog migrations.
fn configure_and_migrate(conn: &mut Connection) -> Result<(), StorageError> {
    // WAL mode for concurrent readers with a single writer.
    conn.pragma_update(None, "journal_mode", "WAL")?;
    // NORMAL synchronous is safe with WAL mode.
    conn.pragma_update(None, "synchronous", "NORMAL")?;

    migrations()
        .to_latest(conn)
        .map_err(|e| StorageError::Migration(e.to_string()))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bootstrap_creates_the_catalog() {
        let conn = open_in_memory().unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM SYS_VERSION", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn bootstrap_is_idempotent() {
        let mut conn = open_in_memory().unwrap();
        // A second pass over an already-migrated database is a no-op.
        configure_and_migrate(&mut conn).unwrap();
        let version: i64 = conn
            .query_row("SELECT VERSION FROM SYS_VERSION", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, 1);
    }
}
