//! The ownership graph.
//!
//! Every reference the engine writes is recorded as an edge in the
//! `SYS_OWNERSHIP` table: owner row, relation name, target row, target
//! class. A row is *protected* while at least one edge targets it;
//! unprotected rows are eligible for deletion. The cascading delete that
//! consumes these edges lives in [`crate::store`]; this module is the edge
//! bookkeeping itself.

use rusqlite::{params, Connection};

use crate::dialect::Dialect;
use crate::error::StorageError;

/// One ownership edge as persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct OwnershipEdge {
    pub owner_table: String,
    pub owner_id: i64,
    pub relation: String,
    pub property_table: String,
    pub property_id: i64,
    pub property_class: String,
}

/// Records that `(owner_table, owner_id)` owns `(property_table,
/// property_id)` through `relation`.
pub fn protect(
    conn: &Connection,
    owner_table: &str,
    owner_id: i64,
    relation: &str,
    property_table: &str,
    property_id: i64,
    property_class: &str,
) -> Result<(), StorageError> {
    conn.execute(
        "INSERT INTO SYS_OWNERSHIP \
         (OWNER_TABLE, OWNER_ID, RELATION_NAME, PROPERTY_TABLE, PROPERTY_ID, PROPERTY_CLASS) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            owner_table,
            owner_id,
            relation,
            property_table,
            property_id,
            property_class
        ],
    )?;
    Ok(())
}

/// Removes one edge.
pub fn unprotect(
    conn: &Connection,
    owner_table: &str,
    owner_id: i64,
    relation: &str,
    property_table: &str,
    property_id: i64,
) -> Result<(), StorageError> {
    conn.execute(
        "DELETE FROM SYS_OWNERSHIP WHERE OWNER_TABLE = ?1 AND OWNER_ID = ?2 \
         AND RELATION_NAME = ?3 AND PROPERTY_TABLE = ?4 AND PROPERTY_ID = ?5",
        params![owner_table, owner_id, relation, property_table, property_id],
    )?;
    Ok(())
}

/// True while at least one edge targets the row.
///
/// Always re-read from the backend after the corresponding unprotect has
/// been issued; this is what makes concurrent deleters under-collect
/// rather than over-collect.
pub fn is_protected(
    conn: &Connection,
    dialect: &Dialect,
    table: &str,
    id: i64,
) -> Result<bool, StorageError> {
    let protected: bool = if dialect.supports_exists {
        conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM SYS_OWNERSHIP WHERE PROPERTY_TABLE = ?1 AND PROPERTY_ID = ?2)",
            params![table, id],
            |row| row.get(0),
        )?
    } else {
        conn.query_row(
            "SELECT COUNT(*) FROM SYS_OWNERSHIP WHERE PROPERTY_TABLE = ?1 AND PROPERTY_ID = ?2",
            params![table, id],
            |row| row.get::<_, i64>(0).map(|n| n > 0),
        )?
    };
    Ok(protected)
}

/// All edges owned by the row, in insertion order.
pub fn edges_from(
    conn: &Connection,
    table: &str,
    id: i64,
) -> Result<Vec<OwnershipEdge>, StorageError> {
    let mut stmt = conn.prepare_cached(
        "SELECT OWNER_TABLE, OWNER_ID, RELATION_NAME, PROPERTY_TABLE, PROPERTY_ID, PROPERTY_CLASS \
         FROM SYS_OWNERSHIP WHERE OWNER_TABLE = ?1 AND OWNER_ID = ?2 ORDER BY rowid",
    )?;
    let rows = stmt.query_map(params![table, id], map_edge)?;
    let mut result = Vec::new();
    for row in rows {
        result.push(row?);
    }
    Ok(result)
}

/// The edge a given owner/relation currently holds, if any.
pub fn edge_for_relation(
    conn: &Connection,
    owner_table: &str,
    owner_id: i64,
    relation: &str,
) -> Result<Option<OwnershipEdge>, StorageError> {
    let mut stmt = conn.prepare_cached(
        "SELECT OWNER_TABLE, OWNER_ID, RELATION_NAME, PROPERTY_TABLE, PROPERTY_ID, PROPERTY_CLASS \
         FROM SYS_OWNERSHIP WHERE OWNER_TABLE = ?1 AND OWNER_ID = ?2 AND RELATION_NAME = ?3",
    )?;
    let mut rows = stmt.query_map(params![owner_table, owner_id, relation], map_edge)?;
    match rows.next() {
        Some(edge) => Ok(Some(edge?)),
        None => Ok(None),
    }
}

/// Drops every edge owned by the row. Used when the row itself is deleted.
pub fn remove_edges_from(conn: &Connection, table: &str, id: i64) -> Result<(), StorageError> {
    conn.execute(
        "DELETE FROM SYS_OWNERSHIP WHERE OWNER_TABLE = ?1 AND OWNER_ID = ?2",
        params![table, id],
    )?;
    Ok(())
}

/// Drops every edge targeting the row. Used when a row is deleted
/// explicitly, independent of its protection state.
pub fn remove_edges_to(conn: &Connection, table: &str, id: i64) -> Result<(), StorageError> {
    conn.execute(
        "DELETE FROM SYS_OWNERSHIP WHERE PROPERTY_TABLE = ?1 AND PROPERTY_ID = ?2",
        params![table, id],
    )?;
    Ok(())
}

/// True when a specific owner table holds an edge to the row. Used to keep
/// the root-protection edge of explicitly saved objects unique.
pub fn is_protected_by(
    conn: &Connection,
    owner_table: &str,
    table: &str,
    id: i64,
) -> Result<bool, StorageError> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM SYS_OWNERSHIP WHERE OWNER_TABLE = ?1 \
         AND PROPERTY_TABLE = ?2 AND PROPERTY_ID = ?3",
        params![owner_table, table, id],
        |row| row.get(0),
    )?;
    Ok(n > 0)
}

/// Rewrites the relation name on every edge of a table. Part of the
/// column-rename migration.
pub fn rename_relation(
    conn: &Connection,
    owner_table: &str,
    old: &str,
    new: &str,
) -> Result<(), StorageError> {
    conn.execute(
        "UPDATE SYS_OWNERSHIP SET RELATION_NAME = ?3 WHERE OWNER_TABLE = ?1 AND RELATION_NAME = ?2",
        params![owner_table, old, new],
    )?;
    Ok(())
}

fn map_edge(row: &rusqlite::Row<'_>) -> rusqlite::Result<OwnershipEdge> {
    Ok(OwnershipEdge {
        owner_table: row.get(0)?,
        owner_id: row.get(1)?,
        relation: row.get(2)?,
        property_table: row.get(3)?,
        property_id: row.get(4)?,
        property_class: row.get(5)?,
    })
}
