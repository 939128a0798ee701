//! The persistence engine entry point.
//!
//! [`Store`] owns one backend connection, the dialect record, a snapshot of
//! the descriptor registry, and the per-store caches (object identity, id
//! allocation, schema checks). Every save/delete is one transaction: begun
//! on entry, committed at the end of the unit of work, rolled back on any
//! failure -- including a save that finishes with unresolved deferred
//! references.
//!
//! Saving walks the object's [`ClassStack`] from the concrete level up to
//! the root, inserting one row per level, recursively saving referenced
//! objects first, deferring foreign keys into cycles, and recording an
//! ownership edge for every reference written. Deletion is the mirror:
//! the object's own rows go first (unconditionally, which is what reclaims
//! self-owning cycles), then every formerly-owned row that lost its last
//! protector is collected recursively.

use std::collections::{HashMap, HashSet};

use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use strata_core::{
    ContainerValue, Handle, ObjectSpace, PropertyDef, SemanticType, TypeRegistry, Value,
};

use crate::deferred::{DeferredReference, DeferredReferenceBuffer};
use crate::dialect::Dialect;
use crate::error::{is_missing_schema_object, StorageError};
use crate::level::{
    ClassStack, FILLER_PROPERTY, ID_COLUMN, KEYS_PROPERTY, MEMBERS_PROPERTY, MEMBER_COUNT_PROPERTY,
    REAL_CLASS_COLUMN, REAL_ID_COLUMN, VALUES_PROPERTY,
};
use crate::meta;
use crate::protect;

/// Marker owner of the protection edge placed on explicitly saved objects.
/// Not a real table; it only ever appears on the owner side of an edge.
pub(crate) const ROOT_OWNER: &str = "SYS_ROOT";
pub(crate) const ROOT_RELATION: &str = "root";

/// Engine configuration fixed at open.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// When false, a missing table or column raises
    /// [`StorageError::SchemaPermission`] instead of being created.
    pub create_schema: bool,
}

impl Default for StoreOptions {
    fn default() -> Self {
        StoreOptions {
            create_schema: true,
        }
    }
}

/// One persisted row of one inheritance level.
#[derive(Debug, Clone, PartialEq)]
pub struct LevelRow {
    pub class: String,
    pub table: String,
    pub id: i64,
}

/// The persisted rows of one object, root level first.
#[derive(Debug, Clone)]
pub struct SavedObject {
    pub levels: Vec<LevelRow>,
}

impl SavedObject {
    pub fn concrete(&self) -> &LevelRow {
        &self.levels[self.levels.len() - 1]
    }

    pub fn row_for_class(&self, class: &str) -> Option<&LevelRow> {
        self.levels.iter().find(|lr| lr.class == class)
    }
}

/// Per-save bookkeeping: the recursion guard, the deferred buffer, and the
/// set of handles already written in this unit of work.
#[derive(Default)]
pub(crate) struct SaveContext {
    pub(crate) in_progress: HashSet<Handle>,
    pub(crate) touched: HashSet<Handle>,
    pub(crate) inserted: HashSet<Handle>,
    pub(crate) deferred: DeferredReferenceBuffer,
}

/// Per-load bookkeeping: concrete rows already materialized, which is what
/// closes reference cycles on the way back in.
#[derive(Default)]
pub(crate) struct LoadContext {
    pub(crate) loaded: HashMap<(String, i64), Handle>,
}

/// A resolved reference: the id cast to the declared class's level, plus
/// the target's concrete class for the ownership edge.
pub(crate) struct ResolvedCast {
    pub(crate) id: i64,
    pub(crate) concrete_class: String,
}

struct ResolvedEdge {
    relation: String,
    table: String,
    id: i64,
    class: String,
}

struct PendingDeferred {
    column: String,
    relation: String,
    target: Handle,
    declared: String,
}

struct PreparedLevel {
    columns: Vec<(String, rusqlite::types::Value)>,
    edges: Vec<ResolvedEdge>,
    deferred: Vec<PendingDeferred>,
}

/// The object store: persistence engine plus schema synchronization.
pub struct Store {
    pub(crate) conn: Connection,
    pub(crate) dialect: Dialect,
    pub(crate) registry: TypeRegistry,
    options: StoreOptions,
    saved: HashMap<Handle, SavedObject>,
    checked_classes: HashSet<String>,
    pub(crate) ensured_member_tables: HashSet<String>,
    next_ids: HashMap<String, i64>,
}

impl Store {
    /// Opens (or creates) a store at `path`.
    pub fn open(
        path: &str,
        registry: TypeRegistry,
        dialect: Dialect,
        options: StoreOptions,
    ) -> Result<Self, StorageError> {
        let conn = crate::schema::open_database(path)?;
        meta::check_version(&conn)?;
        Ok(Store {
            conn,
            dialect,
            registry,
            options,
            saved: HashMap::new(),
            checked_classes: HashSet::new(),
            ensured_member_tables: HashSet::new(),
            next_ids: HashMap::new(),
        })
    }

    /// Opens an in-memory store with the SQLite dialect (for testing and
    /// ephemeral sessions).
    pub fn open_in_memory(registry: TypeRegistry) -> Result<Self, StorageError> {
        let conn = crate::schema::open_in_memory()?;
        meta::check_version(&conn)?;
        Ok(Store {
            conn,
            dialect: Dialect::sqlite(),
            registry,
            options: StoreOptions::default(),
            saved: HashMap::new(),
            checked_classes: HashSet::new(),
            ensured_member_tables: HashSet::new(),
            next_ids: HashMap::new(),
        })
    }

    pub fn registry(&self) -> &TypeRegistry {
        &self.registry
    }

    pub fn dialect(&self) -> &Dialect {
        &self.dialect
    }

    /// Escape hatch for diagnostics and tests.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// The concrete-level row id of a saved object, if known to this store.
    pub fn row_id(&self, handle: Handle) -> Option<i64> {
        self.saved.get(&handle).map(|so| so.concrete().id)
    }

    // -------------------------------------------------------------------
    // Save
    // -------------------------------------------------------------------

    /// Persists the object graph reachable from `handle`. Returns the
    /// concrete-level row id.
    ///
    /// Objects already saved through this store are updated in place;
    /// everything else is inserted. The whole graph is one transaction.
    pub fn save(&mut self, space: &ObjectSpace, handle: Handle) -> Result<i64, StorageError> {
        meta::check_version(&self.conn)?;
        let mut ctx = SaveContext::default();
        self.begin()?;
        match self.save_object(space, handle, &mut ctx) {
            Ok(id) => {
                if !ctx.deferred.is_empty() {
                    let class = ctx
                        .deferred
                        .first_unresolved_class()
                        .unwrap_or("<unknown>")
                        .to_string();
                    self.rollback_save(&ctx);
                    return Err(StorageError::UnresolvedReference { class });
                }
                self.protect_root(handle)?;
                self.commit()?;
                Ok(id)
            }
            Err(e) => {
                self.rollback_save(&ctx);
                Err(e)
            }
        }
    }

    /// An explicitly saved object is externally protected: it survives the
    /// cascading deletion of any object that happens to own it, until it is
    /// itself explicitly deleted.
    fn protect_root(&mut self, handle: Handle) -> Result<(), StorageError> {
        let Some(so) = self.saved.get(&handle).cloned() else {
            return Ok(());
        };
        let concrete = so.concrete();
        if !protect::is_protected_by(&self.conn, ROOT_OWNER, &concrete.table, concrete.id)? {
            protect::protect(
                &self.conn,
                ROOT_OWNER,
                0,
                ROOT_RELATION,
                &concrete.table,
                concrete.id,
                &concrete.class,
            )?;
        }
        Ok(())
    }

    pub(crate) fn save_object(
        &mut self,
        space: &ObjectSpace,
        handle: Handle,
        ctx: &mut SaveContext,
    ) -> Result<i64, StorageError> {
        if ctx.touched.contains(&handle) {
            return self
                .saved
                .get(&handle)
                .map(|so| so.concrete().id)
                .ok_or_else(|| StorageError::integrity("touched object without saved rows"));
        }
        if self.saved.contains_key(&handle) {
            self.update_object(space, handle, ctx)
        } else {
            self.insert_object(space, handle, ctx)
        }
    }

    fn insert_object(
        &mut self,
        space: &ObjectSpace,
        handle: Handle,
        ctx: &mut SaveContext,
    ) -> Result<i64, StorageError> {
        ctx.touched.insert(handle);
        ctx.inserted.insert(handle);
        ctx.in_progress.insert(handle);

        let stack = ClassStack::from_instance(&self.registry, &self.dialect, space, handle)?;
        let class = stack.concrete().class.clone();
        self.ensure_class_schema(&class)?;
        debug!(class = %class, "inserting object");

        // Concrete level first, then up to the root.
        let mut level_rows: Vec<LevelRow> = Vec::with_capacity(stack.levels.len());
        for level in stack.levels.iter().rev() {
            let prepared = self.prepare_level_values(space, level, ctx)?;
            let row_id = self.insert_row(&level.table, &level.properties, prepared.columns)?;
            for edge in &prepared.edges {
                protect::protect(
                    &self.conn,
                    &level.table,
                    row_id,
                    &edge.relation,
                    &edge.table,
                    edge.id,
                    &edge.class,
                )?;
            }
            for pending in prepared.deferred {
                ctx.deferred.push(DeferredReference {
                    owner_table: level.table.clone(),
                    column: pending.column,
                    owner_id: row_id,
                    relation: pending.relation,
                    referenced: pending.target,
                    referenced_class: pending.declared,
                });
            }
            level_rows.push(LevelRow {
                class: level.class.clone(),
                table: level.table.clone(),
                id: row_id,
            });
        }
        level_rows.reverse();

        // Downward real-class pointers: each ancestor row points at the
        // next-more-derived row of the same logical object.
        for i in 0..level_rows.len().saturating_sub(1) {
            let child = level_rows[i + 1].clone();
            let parent = &level_rows[i];
            self.conn.execute(
                &format!(
                    "UPDATE {} SET {} = ?1, {} = ?2 WHERE {} = ?3",
                    parent.table, REAL_CLASS_COLUMN, REAL_ID_COLUMN, ID_COLUMN
                ),
                params![child.class, child.id, parent.id],
            )?;
        }

        let concrete_id = level_rows[level_rows.len() - 1].id;
        self.saved.insert(handle, SavedObject { levels: level_rows });
        ctx.in_progress.remove(&handle);
        self.resolve_deferred_for(handle, ctx)?;
        Ok(concrete_id)
    }

    fn update_object(
        &mut self,
        space: &ObjectSpace,
        handle: Handle,
        ctx: &mut SaveContext,
    ) -> Result<i64, StorageError> {
        ctx.touched.insert(handle);
        ctx.in_progress.insert(handle);

        let so = self
            .saved
            .get(&handle)
            .cloned()
            .ok_or_else(|| StorageError::integrity("update of an object with no saved rows"))?;
        let stack = ClassStack::from_instance(&self.registry, &self.dialect, space, handle)?;
        if stack.levels.len() != so.levels.len() {
            return Err(StorageError::integrity(
                "class shape changed under a cached object; run schema sync and refresh",
            ));
        }
        debug!(class = %stack.concrete().class, id = so.concrete().id, "updating object");

        for (level, lr) in stack.levels.iter().zip(so.levels.iter()) {
            if level.class != lr.class {
                return Err(StorageError::integrity(
                    "cached rows no longer match the class stack",
                ));
            }
            let mut sets: Vec<(String, rusqlite::types::Value)> = Vec::new();
            for (prop, value) in level.pairs() {
                let column = self.dialect.identifier(&prop.name);
                let owns = prop.ty.is_reference() || prop.ty.is_array();
                let old_edge = if owns {
                    protect::edge_for_relation(&self.conn, &lr.table, lr.id, &column)?
                } else {
                    None
                };
                match value {
                    Value::Ref(target) => {
                        let declared = match &prop.ty {
                            SemanticType::Ref(c) => c.clone(),
                            _ => {
                                return Err(StorageError::integrity(format!(
                                    "reference value in non-reference property {}",
                                    prop.name
                                )))
                            }
                        };
                        let declared_table = self.class_table(&declared);
                        match self.resolve_reference(space, *target, &declared, ctx)? {
                            Some(cast) => {
                                let unchanged = old_edge.as_ref().map_or(false, |e| {
                                    e.property_table == declared_table && e.property_id == cast.id
                                });
                                if !unchanged {
                                    if let Some(e) = &old_edge {
                                        self.drop_edge_and_collect(e)?;
                                    }
                                    protect::protect(
                                        &self.conn,
                                        &lr.table,
                                        lr.id,
                                        &column,
                                        &declared_table,
                                        cast.id,
                                        &cast.concrete_class,
                                    )?;
                                }
                                sets.push((column, rusqlite::types::Value::Integer(cast.id)));
                            }
                            None => {
                                if let Some(e) = &old_edge {
                                    self.drop_edge_and_collect(e)?;
                                }
                                ctx.deferred.push(DeferredReference {
                                    owner_table: lr.table.clone(),
                                    column: column.clone(),
                                    owner_id: lr.id,
                                    relation: column.clone(),
                                    referenced: *target,
                                    referenced_class: declared,
                                });
                                sets.push((column, rusqlite::types::Value::Null));
                            }
                        }
                    }
                    Value::Array(av) => {
                        // Arrays are replaced wholesale on re-save.
                        if let Some(e) = &old_edge {
                            self.drop_edge_and_collect(e)?;
                        }
                        let header_id = self.save_array(space, av, ctx)?;
                        protect::protect(
                            &self.conn,
                            &lr.table,
                            lr.id,
                            &column,
                            crate::arrays::ARRAY_TABLE,
                            header_id,
                            &prop.ty.storage_key(),
                        )?;
                        sets.push((column, rusqlite::types::Value::Integer(header_id)));
                    }
                    Value::Null => {
                        if let Some(e) = &old_edge {
                            self.drop_edge_and_collect(e)?;
                        }
                        sets.push((column, rusqlite::types::Value::Null));
                    }
                    scalar => sets.push((column, bind_scalar(scalar))),
                }
            }
            if !sets.is_empty() {
                let assignments: Vec<String> = sets
                    .iter()
                    .enumerate()
                    .map(|(i, (c, _))| format!("{} = ?{}", c, i + 1))
                    .collect();
                let sql = format!(
                    "UPDATE {} SET {} WHERE {} = ?{}",
                    lr.table,
                    assignments.join(", "),
                    ID_COLUMN,
                    sets.len() + 1
                );
                let mut values: Vec<rusqlite::types::Value> =
                    sets.into_iter().map(|(_, v)| v).collect();
                values.push(rusqlite::types::Value::Integer(lr.id));
                self.conn
                    .execute(&sql, rusqlite::params_from_iter(values.iter()))?;
            }
        }

        ctx.in_progress.remove(&handle);
        Ok(so.concrete().id)
    }

    fn prepare_level_values(
        &mut self,
        space: &ObjectSpace,
        level: &crate::level::LevelRepresentation,
        ctx: &mut SaveContext,
    ) -> Result<PreparedLevel, StorageError> {
        let mut prepared = PreparedLevel {
            columns: Vec::new(),
            edges: Vec::new(),
            deferred: Vec::new(),
        };
        for (prop, value) in level.pairs() {
            let column = self.dialect.identifier(&prop.name);
            match value {
                Value::Null => {}
                Value::Ref(target) => {
                    let declared = match &prop.ty {
                        SemanticType::Ref(c) => c.clone(),
                        _ => {
                            return Err(StorageError::integrity(format!(
                                "reference value in non-reference property {}",
                                prop.name
                            )))
                        }
                    };
                    match self.resolve_reference(space, *target, &declared, ctx)? {
                        Some(cast) => {
                            prepared
                                .columns
                                .push((column.clone(), rusqlite::types::Value::Integer(cast.id)));
                            prepared.edges.push(ResolvedEdge {
                                relation: column,
                                table: self.class_table(&declared),
                                id: cast.id,
                                class: cast.concrete_class,
                            });
                        }
                        None => {
                            // Mid-insertion cycle: the column stays NULL for
                            // now and is patched after the target closes.
                            prepared.deferred.push(PendingDeferred {
                                column: column.clone(),
                                relation: column,
                                target: *target,
                                declared,
                            });
                        }
                    }
                }
                Value::Array(av) => {
                    let header_id = self.save_array(space, av, ctx)?;
                    prepared
                        .columns
                        .push((column.clone(), rusqlite::types::Value::Integer(header_id)));
                    prepared.edges.push(ResolvedEdge {
                        relation: column,
                        table: crate::arrays::ARRAY_TABLE.to_string(),
                        id: header_id,
                        class: prop.ty.storage_key(),
                    });
                }
                scalar => prepared.columns.push((column, bind_scalar(scalar))),
            }
        }
        Ok(prepared)
    }

    /// Resolves a reference property to a castable row id, recursively
    /// saving the target first. Returns `None` when the target is currently
    /// mid-insertion higher up the call stack (a cycle to defer).
    pub(crate) fn resolve_reference(
        &mut self,
        space: &ObjectSpace,
        target: Handle,
        declared: &str,
        ctx: &mut SaveContext,
    ) -> Result<Option<ResolvedCast>, StorageError> {
        if let Some(so) = self.saved.get(&target).cloned() {
            if ctx.in_progress.contains(&target) || ctx.touched.contains(&target) {
                // Already handled (or mid-update) this save; ids are stable.
                return Ok(Some(self.cast_to(&so, declared)?));
            }
            self.save_object(space, target, ctx)?;
            let so = self
                .saved
                .get(&target)
                .cloned()
                .ok_or_else(|| StorageError::integrity("saved object vanished from cache"))?;
            return Ok(Some(self.cast_to(&so, declared)?));
        }
        if ctx.in_progress.contains(&target) {
            return Ok(None);
        }
        self.save_object(space, target, ctx)?;
        let so = self
            .saved
            .get(&target)
            .cloned()
            .ok_or_else(|| StorageError::integrity("saved object vanished from cache"))?;
        Ok(Some(self.cast_to(&so, declared)?))
    }

    /// Casting: the id of the target's row at the declared class's level.
    fn cast_to(&self, so: &SavedObject, declared: &str) -> Result<ResolvedCast, StorageError> {
        let row = so.row_for_class(declared).ok_or_else(|| {
            StorageError::integrity(format!(
                "object of class {} has no level for declared type {declared}",
                so.concrete().class
            ))
        })?;
        Ok(ResolvedCast {
            id: row.id,
            concrete_class: so.concrete().class.clone(),
        })
    }

    fn resolve_deferred_for(
        &mut self,
        handle: Handle,
        ctx: &mut SaveContext,
    ) -> Result<(), StorageError> {
        let records = ctx.deferred.take_for(handle);
        if records.is_empty() {
            return Ok(());
        }
        let so = self
            .saved
            .get(&handle)
            .cloned()
            .ok_or_else(|| StorageError::integrity("deferred target has no saved rows"))?;
        for record in records {
            let cast = self.cast_to(&so, &record.referenced_class)?;
            let declared_table = self.class_table(&record.referenced_class);
            self.conn.execute(
                &format!(
                    "UPDATE {} SET {} = ?1 WHERE {} = ?2",
                    record.owner_table, record.column, ID_COLUMN
                ),
                params![cast.id, record.owner_id],
            )?;
            protect::protect(
                &self.conn,
                &record.owner_table,
                record.owner_id,
                &record.relation,
                &declared_table,
                cast.id,
                &cast.concrete_class,
            )?;
        }
        Ok(())
    }

    fn drop_edge_and_collect(&mut self, edge: &protect::OwnershipEdge) -> Result<(), StorageError> {
        protect::unprotect(
            &self.conn,
            &edge.owner_table,
            edge.owner_id,
            &edge.relation,
            &edge.property_table,
            edge.property_id,
        )?;
        if !protect::is_protected(
            &self.conn,
            &self.dialect,
            &edge.property_table,
            edge.property_id,
        )? {
            self.delete_row_cascade(&edge.property_table, edge.property_id)?;
        }
        Ok(())
    }

    pub(crate) fn insert_row(
        &mut self,
        table: &str,
        properties: &[PropertyDef],
        mut columns: Vec<(String, rusqlite::types::Value)>,
    ) -> Result<i64, StorageError> {
        if columns.is_empty() && self.dialect.forbids_empty_insert {
            // Force exactly one property to NULL explicitly.
            let first = properties.first().ok_or_else(|| {
                StorageError::integrity("level with neither properties nor placeholder")
            })?;
            columns.push((
                self.dialect.identifier(&first.name),
                rusqlite::types::Value::Null,
            ));
        }
        let explicit_id = if self.dialect.supports_identity {
            None
        } else {
            let id = self.allocate_id(table)?;
            columns.push((ID_COLUMN.to_string(), rusqlite::types::Value::Integer(id)));
            Some(id)
        };

        if columns.is_empty() {
            self.conn
                .execute(&format!("INSERT INTO {table} DEFAULT VALUES"), [])?;
        } else {
            let names: Vec<&str> = columns.iter().map(|(c, _)| c.as_str()).collect();
            let placeholders: Vec<String> =
                (1..=columns.len()).map(|i| format!("?{i}")).collect();
            let sql = format!(
                "INSERT INTO {} ({}) VALUES ({})",
                table,
                names.join(", "),
                placeholders.join(", ")
            );
            self.conn.execute(
                &sql,
                rusqlite::params_from_iter(columns.iter().map(|(_, v)| v)),
            )?;
        }
        Ok(explicit_id.unwrap_or_else(|| self.conn.last_insert_rowid()))
    }

    /// Id allocation for dialects without identity columns. Seeded from the
    /// table's current maximum, cached for the store's lifetime.
    fn allocate_id(&mut self, table: &str) -> Result<i64, StorageError> {
        let next = match self.next_ids.get(table) {
            Some(n) => *n,
            None => {
                let max: Option<i64> = self.conn.query_row(
                    &format!("SELECT MAX({ID_COLUMN}) FROM {table}"),
                    [],
                    |row| row.get(0),
                )?;
                max.unwrap_or(0) + 1
            }
        };
        self.next_ids.insert(table.to_string(), next + 1);
        Ok(next)
    }

    pub(crate) fn class_table(&self, class: &str) -> String {
        self.dialect.identifier(class)
    }

    /// Verifies (once per class per store lifetime) that every table and
    /// column the class's stack needs exists, creating schema when allowed.
    fn ensure_class_schema(&mut self, class: &str) -> Result<(), StorageError> {
        if self.checked_classes.contains(class) {
            return Ok(());
        }
        let stack = ClassStack::from_class(&self.registry, &self.dialect, class)?;
        let mut missing: Option<String> = None;
        for level in &stack.levels {
            match meta::table_for_class(&self.conn, &level.class)? {
                None => {
                    missing = Some(level.table.clone());
                    break;
                }
                Some(table) => {
                    let catalog = meta::columns_for_table(&self.conn, &table)?;
                    for prop in &level.properties {
                        let column = self.dialect.identifier(&prop.name);
                        if !catalog.iter().any(|c| c.name == column) {
                            missing = Some(format!("{table}.{column}"));
                            break;
                        }
                    }
                }
            }
            if missing.is_some() {
                break;
            }
        }
        if let Some(object) = missing {
            if !self.options.create_schema {
                return Err(StorageError::SchemaPermission { object });
            }
            self.sync_class(class)?;
        }
        self.checked_classes.insert(class.to_string());
        Ok(())
    }

    pub(crate) fn mark_schema_dirty(&mut self) {
        self.checked_classes.clear();
    }

    // -------------------------------------------------------------------
    // Load
    // -------------------------------------------------------------------

    /// Loads the object stored under `(class, id)`, materializing its whole
    /// reachable graph. Returns `None` for unknown classes and missing rows.
    pub fn load(
        &mut self,
        space: &mut ObjectSpace,
        class: &str,
        id: i64,
    ) -> Result<Option<Handle>, StorageError> {
        meta::check_version(&self.conn)?;
        let mut ctx = LoadContext::default();
        self.load_object(space, class, id, &mut ctx)
    }

    /// All objects stored under `class`, including subclass instances found
    /// through the real-class pointer chain. Unknown classes yield an empty
    /// result, so queries against supertypes survive dropped subclasses.
    pub fn find_all(
        &mut self,
        space: &mut ObjectSpace,
        class: &str,
    ) -> Result<Vec<Handle>, StorageError> {
        meta::check_version(&self.conn)?;
        let Some(table) = meta::table_for_class(&self.conn, class)? else {
            return Ok(Vec::new());
        };
        let ids: Vec<i64> = {
            let mut stmt = self
                .conn
                .prepare(&format!("SELECT {ID_COLUMN} FROM {table} ORDER BY {ID_COLUMN}"))?;
            let rows = stmt.query_map([], |row| row.get(0))?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            out
        };
        let mut ctx = LoadContext::default();
        let mut handles = Vec::new();
        for id in ids {
            if let Some(h) = self.load_object(space, class, id, &mut ctx)? {
                if !handles.contains(&h) {
                    handles.push(h);
                }
            }
        }
        Ok(handles)
    }

    /// Row count at the class's own level; zero for unknown classes.
    pub fn count(&self, class: &str) -> Result<u64, StorageError> {
        let Some(table) = meta::table_for_class(&self.conn, class)? else {
            return Ok(0);
        };
        let n: i64 = self
            .conn
            .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
                row.get(0)
            })?;
        Ok(n as u64)
    }

    pub(crate) fn load_object(
        &mut self,
        space: &mut ObjectSpace,
        class: &str,
        id: i64,
        ctx: &mut LoadContext,
    ) -> Result<Option<Handle>, StorageError> {
        let Some(table) = meta::table_for_class(&self.conn, class)? else {
            return Ok(None);
        };
        let Some((concrete_class, concrete_id)) = self.descend_to_concrete(class, &table, id)?
        else {
            return Ok(None);
        };
        if let Some(&h) = ctx.loaded.get(&(concrete_class.clone(), concrete_id)) {
            return Ok(Some(h));
        }
        // A class recorded in metadata but gone from the running program:
        // reads return empty rather than failing.
        if !self.registry.contains(&concrete_class) {
            return Ok(None);
        }

        let stack = ClassStack::from_class(&self.registry, &self.dialect, &concrete_class)?;
        let rows = self.logical_rows(&concrete_class, concrete_id)?;
        let handle = space.create(&concrete_class);
        ctx.loaded
            .insert((concrete_class.clone(), concrete_id), handle);

        for level in &stack.levels {
            let Some(lr) = rows.iter().find(|r| r.class == level.class).cloned() else {
                continue;
            };
            self.load_level(space, handle, level, &lr, ctx)?;
        }

        self.saved.insert(handle, SavedObject { levels: rows });
        Ok(Some(handle))
    }

    fn load_level(
        &mut self,
        space: &mut ObjectSpace,
        handle: Handle,
        level: &crate::level::LevelRepresentation,
        lr: &LevelRow,
        ctx: &mut LoadContext,
    ) -> Result<(), StorageError> {
        let props: Vec<&PropertyDef> = level
            .properties
            .iter()
            .filter(|p| p.name != FILLER_PROPERTY)
            .collect();
        if props.is_empty() {
            return Ok(());
        }
        let columns: Vec<String> = props
            .iter()
            .map(|p| self.dialect.identifier(&p.name))
            .collect();
        let sql = format!(
            "SELECT {} FROM {} WHERE {} = ?1",
            columns.join(", "),
            lr.table,
            ID_COLUMN
        );
        let raw: Vec<rusqlite::types::Value> = self.conn.query_row(&sql, params![lr.id], |row| {
            let mut out = Vec::with_capacity(props.len());
            for i in 0..props.len() {
                out.push(row.get::<_, rusqlite::types::Value>(i)?);
            }
            Ok(out)
        })?;

        let mut members: Option<Vec<Value>> = None;
        let mut keys: Option<Vec<Value>> = None;
        let mut map_values: Option<Vec<Value>> = None;
        for (prop, raw_value) in props.iter().zip(raw.into_iter()) {
            let value = self.materialize_value(space, &prop.ty, raw_value, ctx)?;
            match prop.name.as_str() {
                MEMBERS_PROPERTY => {
                    if let Value::Array(av) = value {
                        members = Some(av.elements);
                    }
                }
                MEMBER_COUNT_PROPERTY => {}
                KEYS_PROPERTY => {
                    if let Value::Array(av) = value {
                        keys = Some(av.elements);
                    }
                }
                VALUES_PROPERTY => {
                    if let Value::Array(av) = value {
                        map_values = Some(av.elements);
                    }
                }
                name => space.set(handle, name, value)?,
            }
        }
        if let Some(elements) = members {
            space.set_container(handle, ContainerValue::List(elements))?;
        } else if let (Some(ks), Some(vs)) = (keys, map_values) {
            space.set_container(
                handle,
                ContainerValue::Map(ks.into_iter().zip(vs).collect()),
            )?;
        }
        Ok(())
    }

    fn materialize_value(
        &mut self,
        space: &mut ObjectSpace,
        ty: &SemanticType,
        raw: rusqlite::types::Value,
        ctx: &mut LoadContext,
    ) -> Result<Value, StorageError> {
        if matches!(raw, rusqlite::types::Value::Null) {
            return Ok(Value::Null);
        }
        match ty {
            SemanticType::Ref(declared) => {
                let id = raw_integer(&raw)?;
                match self.load_object(space, declared, id, ctx)? {
                    Some(h) => Ok(Value::Ref(h)),
                    None => Ok(Value::Null),
                }
            }
            SemanticType::Array(_) => {
                let header_id = raw_integer(&raw)?;
                let av = self.load_array(space, header_id, ctx)?;
                Ok(Value::Array(av))
            }
            scalar => decode_scalar(scalar, raw),
        }
    }

    /// Follows the downward real-class pointer chain from `(table, id)` to
    /// the concrete row. `None` when the starting row does not exist.
    pub(crate) fn descend_to_concrete(
        &self,
        class: &str,
        table: &str,
        id: i64,
    ) -> Result<Option<(String, i64)>, StorageError> {
        let mut current = (class.to_string(), table.to_string(), id);
        loop {
            let row: Option<(Option<String>, Option<i64>)> = self
                .conn
                .query_row(
                    &format!(
                        "SELECT {}, {} FROM {} WHERE {} = ?1",
                        REAL_CLASS_COLUMN, REAL_ID_COLUMN, current.1, ID_COLUMN
                    ),
                    params![current.2],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            match row {
                None => return Ok(None),
                Some((Some(real_class), Some(real_id))) => {
                    let Some(next_table) = meta::table_for_class(&self.conn, &real_class)? else {
                        // Chain points into a dropped class; treat the
                        // current row as concrete.
                        return Ok(Some((current.0, current.2)));
                    };
                    current = (real_class, next_table, real_id);
                }
                Some(_) => return Ok(Some((current.0, current.2))),
            }
        }
    }

    /// All rows of the logical object whose concrete row is
    /// `(concrete_class, concrete_id)`, root level first. Levels whose row
    /// is missing (schema evolution in flight) are skipped.
    pub(crate) fn logical_rows(
        &self,
        concrete_class: &str,
        concrete_id: i64,
    ) -> Result<Vec<LevelRow>, StorageError> {
        let chain = meta::stored_chain(&self.conn, concrete_class)?;
        let concrete_table = meta::table_for_class(&self.conn, concrete_class)?
            .ok_or_else(|| StorageError::integrity("concrete class has no table"))?;
        let mut rows = vec![LevelRow {
            class: concrete_class.to_string(),
            table: concrete_table,
            id: concrete_id,
        }];
        let mut child = (concrete_class.to_string(), concrete_id);
        for ancestor in chain.iter().rev().skip(1) {
            let Some(ancestor_table) = meta::table_for_class(&self.conn, ancestor)? else {
                continue;
            };
            let found: Option<i64> = self
                .conn
                .query_row(
                    &format!(
                        "SELECT {} FROM {} WHERE {} = ?1 AND {} = ?2",
                        ID_COLUMN, ancestor_table, REAL_CLASS_COLUMN, REAL_ID_COLUMN
                    ),
                    params![child.0, child.1],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(ancestor_id) = found {
                rows.push(LevelRow {
                    class: ancestor.clone(),
                    table: ancestor_table,
                    id: ancestor_id,
                });
                child = (ancestor.clone(), ancestor_id);
            }
        }
        rows.reverse();
        Ok(rows)
    }

    // -------------------------------------------------------------------
    // Delete
    // -------------------------------------------------------------------

    /// Deletes the logical object stored under `(class, id)` and collects
    /// everything it owned that loses its last protector. Explicit deletion
    /// always works: the object's own rows go first, independent of any
    /// self-referencing ownership edges.
    pub fn delete(&mut self, class: &str, id: i64) -> Result<(), StorageError> {
        meta::check_version(&self.conn)?;
        self.begin()?;
        match self.delete_logical(class, id) {
            Ok(()) => self.commit(),
            Err(e) => {
                let _ = self.rollback();
                Err(e)
            }
        }
    }

    /// Deletes a previously saved object through its handle.
    pub fn delete_object(&mut self, handle: Handle) -> Result<(), StorageError> {
        let Some(so) = self.saved.get(&handle).cloned() else {
            return Ok(());
        };
        let concrete = so.concrete().clone();
        self.delete(&concrete.class, concrete.id)
    }

    fn delete_logical(&mut self, class: &str, id: i64) -> Result<(), StorageError> {
        let Some(table) = meta::table_for_class(&self.conn, class)? else {
            // Unknown persisted class: deletes are a no-op, not an error.
            return Ok(());
        };
        let Some((concrete_class, concrete_id)) = self.descend_to_concrete(class, &table, id)?
        else {
            return Ok(());
        };
        let rows = self.logical_rows(&concrete_class, concrete_id)?;
        debug!(class = %concrete_class, id = concrete_id, "deleting object");

        let mut outbound = Vec::new();
        for lr in &rows {
            outbound.extend(protect::edges_from(&self.conn, &lr.table, lr.id)?);
            self.conn.execute(
                &format!("DELETE FROM {} WHERE {} = ?1", lr.table, ID_COLUMN),
                params![lr.id],
            )?;
            protect::remove_edges_from(&self.conn, &lr.table, lr.id)?;
            protect::remove_edges_to(&self.conn, &lr.table, lr.id)?;
        }
        for edge in &outbound {
            if !protect::is_protected(
                &self.conn,
                &self.dialect,
                &edge.property_table,
                edge.property_id,
            )? {
                self.delete_row_cascade(&edge.property_table, edge.property_id)?;
            }
        }
        self.saved.retain(|_, so| {
            !so.levels
                .iter()
                .any(|lr| rows.iter().any(|d| d.table == lr.table && d.id == lr.id))
        });
        Ok(())
    }

    /// Collects an unprotected row. A row in a class table takes its whole
    /// logical object with it; array headers and members are plain rows.
    pub(crate) fn delete_row_cascade(&mut self, table: &str, id: i64) -> Result<(), StorageError> {
        if let Some(class) = meta::class_for_table(&self.conn, table)? {
            let Some((concrete_class, concrete_id)) =
                self.descend_to_concrete(&class, table, id)?
            else {
                return Ok(());
            };
            let rows = self.logical_rows(&concrete_class, concrete_id)?;
            // The object survives while any of its level rows is still
            // protected from elsewhere.
            for lr in &rows {
                if protect::is_protected(&self.conn, &self.dialect, &lr.table, lr.id)? {
                    return Ok(());
                }
            }
            let mut outbound = Vec::new();
            for lr in &rows {
                outbound.extend(protect::edges_from(&self.conn, &lr.table, lr.id)?);
                self.conn.execute(
                    &format!("DELETE FROM {} WHERE {} = ?1", lr.table, ID_COLUMN),
                    params![lr.id],
                )?;
                protect::remove_edges_from(&self.conn, &lr.table, lr.id)?;
            }
            self.saved.retain(|_, so| {
                !so.levels
                    .iter()
                    .any(|lr| rows.iter().any(|d| d.table == lr.table && d.id == lr.id))
            });
            for edge in &outbound {
                if !protect::is_protected(
                    &self.conn,
                    &self.dialect,
                    &edge.property_table,
                    edge.property_id,
                )? {
                    self.delete_row_cascade(&edge.property_table, edge.property_id)?;
                }
            }
        } else {
            let outbound = protect::edges_from(&self.conn, table, id)?;
            self.conn.execute(
                &format!("DELETE FROM {} WHERE {} = ?1", table, ID_COLUMN),
                params![id],
            )?;
            protect::remove_edges_from(&self.conn, table, id)?;
            for edge in &outbound {
                if !protect::is_protected(
                    &self.conn,
                    &self.dialect,
                    &edge.property_table,
                    edge.property_id,
                )? {
                    self.delete_row_cascade(&edge.property_table, edge.property_id)?;
                }
            }
        }
        Ok(())
    }

    /// Drops a whole persisted type: every row in every subclass table,
    /// every row of every class whose properties reference the dropped
    /// type, the subclass tables themselves, and all related metadata.
    pub fn drop_class(&mut self, class: &str) -> Result<(), StorageError> {
        meta::check_version(&self.conn)?;
        self.begin()?;
        match self.drop_class_inner(class) {
            Ok(()) => self.commit(),
            Err(e) => {
                let _ = self.rollback();
                Err(e)
            }
        }
    }

    fn drop_class_inner(&mut self, class: &str) -> Result<(), StorageError> {
        let closure = meta::subclass_closure(&self.conn, class)?;
        let referencing = meta::tables_referencing(&self.conn, &closure)?;
        debug!(class, subclasses = closure.len(), "dropping class hierarchy");

        // Rows of classes that reference the dropped type go first; their
        // foreign keys would otherwise dangle.
        let mut closure_tables = Vec::new();
        for c in &closure {
            if let Some(t) = meta::table_for_class(&self.conn, c)? {
                closure_tables.push(t);
            }
        }
        for table in &referencing {
            if closure_tables.contains(table) {
                continue;
            }
            self.conn.execute(&format!("DELETE FROM {table}"), [])?;
            self.conn.execute(
                "DELETE FROM SYS_OWNERSHIP WHERE OWNER_TABLE = ?1 OR PROPERTY_TABLE = ?1",
                params![table],
            )?;
        }
        for c in &closure {
            let Some(table) = meta::table_for_class(&self.conn, c)? else {
                continue;
            };
            self.exec_drop_rows_best_effort(&table)?;
            self.conn.execute(
                "DELETE FROM SYS_OWNERSHIP WHERE OWNER_TABLE = ?1 OR PROPERTY_TABLE = ?1",
                params![table],
            )?;
            match self.conn.execute(&format!("DROP TABLE {table}"), []) {
                Ok(_) => {}
                Err(e) if is_missing_schema_object(&e) => {}
                Err(e) => return Err(e.into()),
            }
            meta::remove_class(&self.conn, c)?;
            meta::clear_columns_for_table(&self.conn, &table)?;
            meta::remove_hierarchy_edges_for(&self.conn, c)?;
        }
        let affected: HashSet<&String> = referencing.iter().chain(closure_tables.iter()).collect();
        self.saved
            .retain(|_, so| !so.levels.iter().any(|lr| affected.contains(&lr.table)));
        self.mark_schema_dirty();
        Ok(())
    }

    fn exec_drop_rows_best_effort(&self, table: &str) -> Result<(), StorageError> {
        match self.conn.execute(&format!("DELETE FROM {table}"), []) {
            Ok(_) => Ok(()),
            Err(e) if is_missing_schema_object(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    // -------------------------------------------------------------------
    // Cache lifecycle
    // -------------------------------------------------------------------

    /// Re-validates the identity cache against the backend, dropping
    /// entries whose rows no longer exist. Never triggered automatically by
    /// remote writes; callers decide when.
    pub fn refresh(&mut self) -> Result<(), StorageError> {
        let entries: Vec<(Handle, SavedObject)> = self
            .saved
            .iter()
            .map(|(h, so)| (*h, so.clone()))
            .collect();
        for (handle, so) in entries {
            for lr in &so.levels {
                if !self.row_exists(&lr.table, lr.id)? {
                    self.saved.remove(&handle);
                    break;
                }
            }
        }
        Ok(())
    }

    fn row_exists(&self, table: &str, id: i64) -> Result<bool, StorageError> {
        let sql = if self.dialect.supports_exists {
            format!("SELECT EXISTS(SELECT 1 FROM {table} WHERE {ID_COLUMN} = ?1)")
        } else {
            format!("SELECT COUNT(*) FROM {table} WHERE {ID_COLUMN} = ?1")
        };
        match self
            .conn
            .query_row(&sql, params![id], |row| row.get::<_, i64>(0))
        {
            Ok(n) => Ok(n > 0),
            Err(e) => {
                if is_missing_schema_object(&e) {
                    Ok(false)
                } else {
                    Err(e.into())
                }
            }
        }
    }

    // -------------------------------------------------------------------
    // Transactions
    // -------------------------------------------------------------------

    fn begin(&self) -> Result<(), StorageError> {
        self.conn.execute_batch("BEGIN")?;
        Ok(())
    }

    fn commit(&self) -> Result<(), StorageError> {
        self.conn.execute_batch("COMMIT")?;
        Ok(())
    }

    fn rollback(&self) -> Result<(), StorageError> {
        self.conn.execute_batch("ROLLBACK")?;
        Ok(())
    }

    fn rollback_save(&mut self, ctx: &SaveContext) {
        let _ = self.rollback();
        // Rows inserted this save were rolled back; drop their cache
        // entries. Updated objects keep theirs -- their rows predate the
        // transaction.
        for handle in &ctx.inserted {
            self.saved.remove(handle);
        }
        // Schema created inside the transaction was rolled back with it.
        self.checked_classes.clear();
        self.ensured_member_tables.clear();
    }
}

// -----------------------------------------------------------------------
// Value binding
// -----------------------------------------------------------------------

/// Binds a scalar value for a column write. References and arrays are
/// resolved before this point.
pub(crate) fn bind_scalar(value: &Value) -> rusqlite::types::Value {
    use rusqlite::types::Value as Sql;
    match value {
        Value::Null => Sql::Null,
        Value::Bool(b) => Sql::Integer(*b as i64),
        Value::I8(n) => Sql::Integer(*n as i64),
        Value::I16(n) => Sql::Integer(*n as i64),
        Value::I32(n) => Sql::Integer(*n as i64),
        Value::I64(n) => Sql::Integer(*n),
        Value::F32(f) => Sql::Real(*f as f64),
        Value::F64(f) => Sql::Real(*f),
        Value::Text(s) | Value::LongText(s) => Sql::Text(s.clone()),
        Value::Bytes(b) => Sql::Blob(b.clone()),
        Value::Date(n) | Value::Time(n) | Value::Timestamp(n) => Sql::Integer(*n),
        Value::Enum { variant, .. } => Sql::Text(variant.clone()),
        Value::Ref(_) | Value::Array(_) => Sql::Null,
    }
}

/// Decodes a scalar column value back into the declared semantic type.
pub(crate) fn decode_scalar(
    ty: &SemanticType,
    raw: rusqlite::types::Value,
) -> Result<Value, StorageError> {
    use rusqlite::types::Value as Sql;
    let value = match (ty, raw) {
        (_, Sql::Null) => Value::Null,
        (SemanticType::Bool, Sql::Integer(n)) => Value::Bool(n != 0),
        (SemanticType::I8, Sql::Integer(n)) => Value::I8(n as i8),
        (SemanticType::I16, Sql::Integer(n)) => Value::I16(n as i16),
        (SemanticType::I32, Sql::Integer(n)) => Value::I32(n as i32),
        (SemanticType::I64, Sql::Integer(n)) => Value::I64(n),
        (SemanticType::F32, Sql::Real(r)) => Value::F32(r as f32),
        (SemanticType::F64, Sql::Real(r)) => Value::F64(r),
        // Integer affinity can surface whole floats as integers.
        (SemanticType::F32, Sql::Integer(n)) => Value::F32(n as f32),
        (SemanticType::F64, Sql::Integer(n)) => Value::F64(n as f64),
        (SemanticType::Text, Sql::Text(s)) => Value::Text(s),
        (SemanticType::LongText, Sql::Text(s)) => Value::LongText(s),
        (SemanticType::Bytes, Sql::Blob(b)) => Value::Bytes(b),
        (SemanticType::Date, Sql::Integer(n)) => Value::Date(n),
        (SemanticType::Time, Sql::Integer(n)) => Value::Time(n),
        (SemanticType::Timestamp, Sql::Integer(n)) => Value::Timestamp(n),
        (SemanticType::Enum(name), Sql::Text(s)) => Value::Enum {
            ty: name.clone(),
            variant: s,
        },
        (ty, _) => {
            return Err(StorageError::integrity(format!(
                "column value does not match declared type {}",
                ty.storage_key()
            )))
        }
    };
    Ok(value)
}

pub(crate) fn raw_integer(raw: &rusqlite::types::Value) -> Result<i64, StorageError> {
    match raw {
        rusqlite::types::Value::Integer(n) => Ok(*n),
        other => Err(StorageError::integrity(format!(
            "expected a row id, found {other:?}"
        ))),
    }
}
