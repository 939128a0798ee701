//! Typed access to the system catalog tables.
//!
//! Everything here operates on the fixed-name metadata tables created by
//! [`crate::schema`]: class/table naming, hierarchy edges, per-column
//! declared types, and the logical store version. The per-class data tables
//! themselves are managed by the migrator.

use rusqlite::{params, Connection, OptionalExtension};

use strata_core::SemanticType;

use crate::error::StorageError;

/// Logical store format version written by this engine.
pub const CURRENT_VERSION: i64 = 1;
/// Oldest store format this engine will open. Anything older is fatal,
/// never silently migrated.
pub const EARLIEST_SUPPORTED_VERSION: i64 = 1;

/// Gates the on-disk store version against what this engine supports.
pub fn check_version(conn: &Connection) -> Result<(), StorageError> {
    let found: i64 = conn.query_row("SELECT VERSION FROM SYS_VERSION", [], |row| row.get(0))?;
    if found > CURRENT_VERSION {
        return Err(StorageError::IncompatibleVersion {
            found,
            supported: CURRENT_VERSION,
        });
    }
    if found < EARLIEST_SUPPORTED_VERSION {
        return Err(StorageError::UnsupportedVersion {
            found,
            earliest: EARLIEST_SUPPORTED_VERSION,
        });
    }
    Ok(())
}

// -----------------------------------------------------------------------
// Class name <-> table name
// -----------------------------------------------------------------------

pub fn table_for_class(conn: &Connection, class: &str) -> Result<Option<String>, StorageError> {
    let table = conn
        .query_row(
            "SELECT TABLENAME FROM SYS_CLASS_NAMES WHERE CLASS = ?1",
            params![class],
            |row| row.get(0),
        )
        .optional()?;
    Ok(table)
}

pub fn class_for_table(conn: &Connection, table: &str) -> Result<Option<String>, StorageError> {
    let class = conn
        .query_row(
            "SELECT CLASS FROM SYS_CLASS_NAMES WHERE TABLENAME = ?1",
            params![table],
            |row| row.get(0),
        )
        .optional()?;
    Ok(class)
}

pub fn record_class(conn: &Connection, class: &str, table: &str) -> Result<(), StorageError> {
    conn.execute(
        "INSERT INTO SYS_CLASS_NAMES (CLASS, TABLENAME) VALUES (?1, ?2)",
        params![class, table],
    )?;
    Ok(())
}

pub fn remove_class(conn: &Connection, class: &str) -> Result<(), StorageError> {
    conn.execute(
        "DELETE FROM SYS_CLASS_NAMES WHERE CLASS = ?1",
        params![class],
    )?;
    Ok(())
}

/// All persisted classes, in registration order.
pub fn all_classes(conn: &Connection) -> Result<Vec<(String, String)>, StorageError> {
    let mut stmt =
        conn.prepare_cached("SELECT CLASS, TABLENAME FROM SYS_CLASS_NAMES ORDER BY rowid")?;
    let rows = stmt.query_map([], |row| {
        let class: String = row.get(0)?;
        let table: String = row.get(1)?;
        Ok((class, table))
    })?;
    let mut result = Vec::new();
    for row in rows {
        result.push(row?);
    }
    Ok(result)
}

// -----------------------------------------------------------------------
// Class hierarchy edges
// -----------------------------------------------------------------------

pub fn add_hierarchy_edge(
    conn: &Connection,
    subclass: &str,
    superclass: &str,
) -> Result<(), StorageError> {
    let exists: bool = conn.query_row(
        "SELECT COUNT(*) FROM SYS_HIERARCHY WHERE SUBCLASS = ?1 AND SUPERCLASS = ?2",
        params![subclass, superclass],
        |row| row.get::<_, i64>(0).map(|n| n > 0),
    )?;
    if !exists {
        conn.execute(
            "INSERT INTO SYS_HIERARCHY (SUPERCLASS, SUBCLASS) VALUES (?1, ?2)",
            params![superclass, subclass],
        )?;
    }
    Ok(())
}

pub fn remove_hierarchy_edge(
    conn: &Connection,
    subclass: &str,
    superclass: &str,
) -> Result<(), StorageError> {
    conn.execute(
        "DELETE FROM SYS_HIERARCHY WHERE SUBCLASS = ?1 AND SUPERCLASS = ?2",
        params![subclass, superclass],
    )?;
    Ok(())
}

/// Removes every edge mentioning `class`, on either side.
pub fn remove_hierarchy_edges_for(conn: &Connection, class: &str) -> Result<(), StorageError> {
    conn.execute(
        "DELETE FROM SYS_HIERARCHY WHERE SUBCLASS = ?1 OR SUPERCLASS = ?1",
        params![class],
    )?;
    Ok(())
}

/// Direct stored supertypes of `class`, in the order they were recorded.
pub fn direct_supertypes_stored(
    conn: &Connection,
    class: &str,
) -> Result<Vec<String>, StorageError> {
    let mut stmt = conn
        .prepare_cached("SELECT SUPERCLASS FROM SYS_HIERARCHY WHERE SUBCLASS = ?1 ORDER BY rowid")?;
    let rows = stmt.query_map(params![class], |row| row.get(0))?;
    let mut result = Vec::new();
    for row in rows {
        result.push(row?);
    }
    Ok(result)
}

/// Direct stored subclasses (and implementers) of `class`.
pub fn direct_subclasses_stored(
    conn: &Connection,
    class: &str,
) -> Result<Vec<String>, StorageError> {
    let mut stmt = conn
        .prepare_cached("SELECT SUBCLASS FROM SYS_HIERARCHY WHERE SUPERCLASS = ?1 ORDER BY rowid")?;
    let rows = stmt.query_map(params![class], |row| row.get(0))?;
    let mut result = Vec::new();
    for row in rows {
        result.push(row?);
    }
    Ok(result)
}

/// The stored supertype chain of `class`, most general first, `class` last.
///
/// Reconstructed from the persisted edges with the same linearization the
/// registry uses; edge insertion order keeps it deterministic. The chain is
/// what the schema differ compares against the freshly introspected one,
/// and it keeps working after the running program's interface list changed.
pub fn stored_chain(conn: &Connection, class: &str) -> Result<Vec<String>, StorageError> {
    fn collect(
        conn: &Connection,
        name: &str,
        chain: &mut Vec<String>,
        depth: usize,
    ) -> Result<(), StorageError> {
        if depth > 64 {
            return Err(StorageError::integrity(format!(
                "stored hierarchy too deep or cyclic at class {name}"
            )));
        }
        for sup in direct_supertypes_stored(conn, name)? {
            collect(conn, &sup, chain, depth + 1)?;
        }
        if !chain.iter().any(|c| c == name) {
            chain.push(name.to_string());
        }
        Ok(())
    }
    let mut chain = Vec::new();
    collect(conn, class, &mut chain, 0)?;
    Ok(chain)
}

/// Transitive closure of stored subclasses, including `class` itself.
pub fn subclass_closure(conn: &Connection, class: &str) -> Result<Vec<String>, StorageError> {
    let mut closure = vec![class.to_string()];
    let mut frontier = vec![class.to_string()];
    while let Some(current) = frontier.pop() {
        for sub in direct_subclasses_stored(conn, &current)? {
            if !closure.iter().any(|c| c == &sub) {
                closure.push(sub.clone());
                frontier.push(sub);
            }
        }
    }
    Ok(closure)
}

// -----------------------------------------------------------------------
// Declared column types
// -----------------------------------------------------------------------

/// One column as recorded in the catalog.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredColumn {
    pub name: String,
    pub ty: SemanticType,
    pub indexed: bool,
}

/// Columns of a generated table, in declaration order.
pub fn columns_for_table(
    conn: &Connection,
    table: &str,
) -> Result<Vec<StoredColumn>, StorageError> {
    let mut stmt = conn.prepare_cached(
        "SELECT COLUMN_NAME, COLUMN_CLASS, INDEXED FROM SYS_COLUMN_TYPES \
         WHERE OWNER_TABLE = ?1 ORDER BY ORDINAL",
    )?;
    let rows = stmt.query_map(params![table], |row| {
        let name: String = row.get(0)?;
        let key: String = row.get(1)?;
        let indexed: i64 = row.get(2)?;
        Ok((name, key, indexed))
    })?;
    let mut result = Vec::new();
    for row in rows {
        let (name, key, indexed) = row?;
        result.push(StoredColumn {
            name,
            ty: SemanticType::parse_key(&key).map_err(StorageError::Core)?,
            indexed: indexed != 0,
        });
    }
    Ok(result)
}

pub fn record_column(
    conn: &Connection,
    table: &str,
    name: &str,
    ty: &SemanticType,
    ordinal: i64,
    indexed: bool,
) -> Result<(), StorageError> {
    conn.execute(
        "INSERT INTO SYS_COLUMN_TYPES (OWNER_TABLE, COLUMN_NAME, COLUMN_CLASS, ORDINAL, INDEXED) \
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![table, name, ty.storage_key(), ordinal, indexed as i64],
    )?;
    Ok(())
}

pub fn remove_column(conn: &Connection, table: &str, name: &str) -> Result<(), StorageError> {
    conn.execute(
        "DELETE FROM SYS_COLUMN_TYPES WHERE OWNER_TABLE = ?1 AND COLUMN_NAME = ?2",
        params![table, name],
    )?;
    Ok(())
}

pub fn rename_column(
    conn: &Connection,
    table: &str,
    old: &str,
    new: &str,
) -> Result<(), StorageError> {
    conn.execute(
        "UPDATE SYS_COLUMN_TYPES SET COLUMN_NAME = ?3 WHERE OWNER_TABLE = ?1 AND COLUMN_NAME = ?2",
        params![table, old, new],
    )?;
    Ok(())
}

pub fn set_column_type(
    conn: &Connection,
    table: &str,
    name: &str,
    ty: &SemanticType,
) -> Result<(), StorageError> {
    conn.execute(
        "UPDATE SYS_COLUMN_TYPES SET COLUMN_CLASS = ?3 WHERE OWNER_TABLE = ?1 AND COLUMN_NAME = ?2",
        params![table, name, ty.storage_key()],
    )?;
    Ok(())
}

pub fn set_column_indexed(
    conn: &Connection,
    table: &str,
    name: &str,
    indexed: bool,
) -> Result<(), StorageError> {
    conn.execute(
        "UPDATE SYS_COLUMN_TYPES SET INDEXED = ?3 WHERE OWNER_TABLE = ?1 AND COLUMN_NAME = ?2",
        params![table, name, indexed as i64],
    )?;
    Ok(())
}

/// Removes all column records of a table.
pub fn clear_columns_for_table(conn: &Connection, table: &str) -> Result<(), StorageError> {
    conn.execute(
        "DELETE FROM SYS_COLUMN_TYPES WHERE OWNER_TABLE = ?1",
        params![table],
    )?;
    Ok(())
}

/// Tables whose columns declare a reference to any of the given classes.
pub fn tables_referencing(
    conn: &Connection,
    classes: &[String],
) -> Result<Vec<String>, StorageError> {
    let mut result: Vec<String> = Vec::new();
    let mut stmt = conn
        .prepare_cached("SELECT OWNER_TABLE FROM SYS_COLUMN_TYPES WHERE COLUMN_CLASS = ?1")?;
    for class in classes {
        let key = SemanticType::reference(class).storage_key();
        let rows = stmt.query_map(params![key], |row| row.get::<_, String>(0))?;
        for row in rows {
            let table = row?;
            if !result.contains(&table) {
                result.push(table);
            }
        }
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::open_in_memory;

    #[test]
    fn version_gate_accepts_current() {
        let conn = open_in_memory().unwrap();
        check_version(&conn).unwrap();
    }

    #[test]
    fn version_gate_rejects_newer() {
        let conn = open_in_memory().unwrap();
        conn.execute("UPDATE SYS_VERSION SET VERSION = 99", [])
            .unwrap();
        assert!(matches!(
            check_version(&conn),
            Err(StorageError::IncompatibleVersion { found: 99, .. })
        ));
    }

    #[test]
    fn version_gate_rejects_older() {
        let conn = open_in_memory().unwrap();
        conn.execute("UPDATE SYS_VERSION SET VERSION = 0", [])
            .unwrap();
        assert!(matches!(
            check_version(&conn),
            Err(StorageError::UnsupportedVersion { found: 0, .. })
        ));
    }

    #[test]
    fn class_name_mapping_roundtrip() {
        let conn = open_in_memory().unwrap();
        record_class(&conn, "Shape", "SHAPE").unwrap();
        assert_eq!(
            table_for_class(&conn, "Shape").unwrap().as_deref(),
            Some("SHAPE")
        );
        assert_eq!(
            class_for_table(&conn, "SHAPE").unwrap().as_deref(),
            Some("Shape")
        );
        assert_eq!(table_for_class(&conn, "Nope").unwrap(), None);
    }

    #[test]
    fn stored_chain_reconstructs_linearization() {
        let conn = open_in_memory().unwrap();
        add_hierarchy_edge(&conn, "ColoredShape", "Shape").unwrap();
        add_hierarchy_edge(&conn, "ColoredShape", "Drawable").unwrap();
        let chain = stored_chain(&conn, "ColoredShape").unwrap();
        assert_eq!(chain, vec!["Shape", "Drawable", "ColoredShape"]);
    }

    #[test]
    fn subclass_closure_is_transitive() {
        let conn = open_in_memory().unwrap();
        add_hierarchy_edge(&conn, "B", "A").unwrap();
        add_hierarchy_edge(&conn, "C", "B").unwrap();
        let mut closure = subclass_closure(&conn, "A").unwrap();
        closure.sort();
        assert_eq!(closure, vec!["A", "B", "C"]);
    }

    #[test]
    fn column_records_keep_order_and_flags() {
        let conn = open_in_memory().unwrap();
        record_column(&conn, "SHAPE", "COLOR", &SemanticType::Text, 0, true).unwrap();
        record_column(&conn, "SHAPE", "NOTES", &SemanticType::LongText, 1, false).unwrap();

        let cols = columns_for_table(&conn, "SHAPE").unwrap();
        assert_eq!(cols.len(), 2);
        assert_eq!(cols[0].name, "COLOR");
        assert!(cols[0].indexed);
        assert_eq!(cols[1].ty, SemanticType::LongText);
        assert!(!cols[1].indexed);

        rename_column(&conn, "SHAPE", "COLOR", "COLOR_NAME").unwrap();
        let cols = columns_for_table(&conn, "SHAPE").unwrap();
        assert_eq!(cols[0].name, "COLOR_NAME");
    }

    #[test]
    fn tables_referencing_finds_reference_columns() {
        let conn = open_in_memory().unwrap();
        record_column(
            &conn,
            "CANVAS",
            "SHAPE",
            &SemanticType::reference("Shape"),
            0,
            true,
        )
        .unwrap();
        record_column(&conn, "OTHER", "N", &SemanticType::I32, 0, true).unwrap();

        let tables = tables_referencing(&conn, &["Shape".to_string()]).unwrap();
        assert_eq!(tables, vec!["CANVAS"]);
    }
}
