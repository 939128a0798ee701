//! The schema migrator.
//!
//! Executes a [`MigrationPlan`] as a sequence of DDL/DML operations in the
//! plan's fixed dependency order. Every structural statement is rendered
//! through the dialect record; no backend keyword is hardcoded here.
//! Migration is a blocking foreground operation and is deliberately not
//! wrapped in a transaction: most backends cannot run DDL transactionally,
//! so a failure partway leaves the schema intermediate by documented
//! contract.

use std::collections::HashMap;

use rusqlite::params;
use serde::Serialize;
use tracing::{debug, info, warn};

use strata_core::SemanticType;

use crate::diff::{self, ColumnSpec, MigrationPlan, MigrationStep};
use crate::error::{is_missing_schema_object, StorageError};
use crate::level::{ClassStack, ID_COLUMN, REAL_CLASS_COLUMN, REAL_ID_COLUMN};
use crate::meta;
use crate::protect;
use crate::store::{LevelRow, Store};

/// Outcome of one class synchronization.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MigrationReport {
    pub class: String,
    pub steps_applied: usize,
    pub created_tables: Vec<String>,
    /// Columns whose old data was dropped because the oracle rejected the
    /// conversion.
    pub lossy_columns: Vec<String>,
}

impl MigrationReport {
    /// True when the class's schema already matched; nothing was done.
    pub fn is_noop(&self) -> bool {
        self.steps_applied == 0
    }
}

impl Store {
    /// Diffs `class` against its persisted shape and applies the resulting
    /// plan. Typically run once per class per process start.
    pub fn sync_class(&mut self, class: &str) -> Result<MigrationReport, StorageError> {
        meta::check_version(&self.conn)?;
        let plan = diff::diff_class(&self.registry, &self.dialect, &self.conn, class)?;
        self.apply_plan(plan)
    }

    /// Synchronizes every registered concrete class, in registration order.
    pub fn sync_all(&mut self) -> Result<Vec<MigrationReport>, StorageError> {
        let classes: Vec<String> = self
            .registry
            .iter()
            .filter(|def| !def.is_interface())
            .map(|def| def.name.clone())
            .collect();
        let mut reports = Vec::with_capacity(classes.len());
        for class in classes {
            reports.push(self.sync_class(&class)?);
        }
        Ok(reports)
    }

    pub(crate) fn apply_plan(&mut self, plan: MigrationPlan) -> Result<MigrationReport, StorageError> {
        let mut report = MigrationReport {
            class: plan.class.clone(),
            ..MigrationReport::default()
        };
        if plan.is_empty() {
            return Ok(report);
        }
        info!(class = %plan.class, steps = plan.len(), "applying schema migration");
        for step in plan.steps {
            self.apply_step(&plan.class, &mut report, step)?;
            report.steps_applied += 1;
        }
        self.mark_schema_dirty();
        Ok(report)
    }

    fn apply_step(
        &mut self,
        plan_class: &str,
        report: &mut MigrationReport,
        step: MigrationStep,
    ) -> Result<(), StorageError> {
        debug!(?step, "migration step");
        match step {
            MigrationStep::AddHierarchyEdge {
                subclass,
                superclass,
            } => meta::add_hierarchy_edge(&self.conn, &subclass, &superclass),
            MigrationStep::RemoveHierarchyEdge {
                subclass,
                superclass,
            } => meta::remove_hierarchy_edge(&self.conn, &subclass, &superclass),
            MigrationStep::CreateClassTable {
                class,
                table,
                columns,
            } => self.create_class_table(report, &class, &table, &columns),
            MigrationStep::BackfillLevelRows { class } => self.backfill_level_rows(&class),
            MigrationStep::MoveProperty {
                column,
                ty,
                from_class,
                from_table,
                to_class,
                to_table,
                adjacent,
                ordinal,
                indexed,
            } => self.move_property(
                plan_class, &column, &ty, &from_class, &from_table, &to_class, &to_table,
                adjacent, ordinal, indexed,
            ),
            MigrationStep::RemoveLevel { class, table } => self.remove_level(&class, &table),
            MigrationStep::RenameColumn {
                table,
                old,
                new,
                ty,
            } => self.rename_column(&table, &old, &new, &ty),
            MigrationStep::RetypeColumn {
                table,
                column,
                old_ty,
                new_ty,
                lossy,
            } => self.retype_column(report, &table, &column, &old_ty, &new_ty, lossy),
            MigrationStep::AddColumn {
                table,
                column,
                ty,
                ordinal,
                indexed,
            } => {
                self.conn.execute(
                    &format!(
                        "ALTER TABLE {table} ADD COLUMN {column} {}",
                        self.dialect.column_type(&ty)
                    ),
                    [],
                )?;
                meta::record_column(&self.conn, &table, &column, &ty, ordinal, indexed)
            }
            MigrationStep::DropColumn { table, column, ty } => {
                self.drop_column(&table, &column, &ty)
            }
            MigrationStep::RecreateIndexes { class, table } => {
                self.recreate_indexes(&class, &table)
            }
        }
    }

    // -------------------------------------------------------------------
    // Step implementations
    // -------------------------------------------------------------------

    fn create_class_table(
        &mut self,
        report: &mut MigrationReport,
        class: &str,
        table: &str,
        columns: &[ColumnSpec],
    ) -> Result<(), StorageError> {
        let text_ty = self.dialect.column_type(&SemanticType::Text);
        let mut defs = vec![
            format!("{ID_COLUMN} INTEGER PRIMARY KEY"),
            format!("{REAL_CLASS_COLUMN} {text_ty}"),
            format!("{REAL_ID_COLUMN} INTEGER"),
        ];
        for col in columns {
            defs.push(format!("{} {}", col.name, self.dialect.column_type(&col.ty)));
        }
        self.conn
            .execute(&format!("CREATE TABLE {table} ({})", defs.join(", ")), [])?;
        meta::record_class(&self.conn, class, table)?;
        for (i, col) in columns.iter().enumerate() {
            meta::record_column(&self.conn, table, &col.name, &col.ty, i as i64, col.indexed)?;
            if col.indexed {
                self.conn.execute(
                    &format!(
                        "CREATE INDEX {} ON {table} ({})",
                        self.index_name(table, &col.name),
                        col.name
                    ),
                    [],
                )?;
            }
        }
        info!(class, table, "created class table");
        report.created_tables.push(table.to_string());
        Ok(())
    }

    /// After a class gains inheritance levels, every existing object needs
    /// rows at the new levels and a rewired pointer chain.
    fn backfill_level_rows(&mut self, class: &str) -> Result<(), StorageError> {
        let chain = self.registry.supertype_chain(class).map_err(StorageError::Core)?;
        let table = self.class_table(class);
        let stack = ClassStack::from_class(&self.registry, &self.dialect, class)?;

        let concrete_ids: Vec<i64> = {
            let mut stmt = self.conn.prepare(&format!(
                "SELECT {ID_COLUMN} FROM {table} WHERE {REAL_ID_COLUMN} IS NULL"
            ))?;
            let rows = stmt.query_map([], |row| row.get(0))?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            out
        };

        for concrete_id in concrete_ids {
            let existing = self.logical_rows(class, concrete_id)?;
            let by_class: HashMap<String, i64> = existing
                .iter()
                .map(|lr| (lr.class.clone(), lr.id))
                .collect();

            let mut full: Vec<LevelRow> = Vec::with_capacity(chain.len());
            for level_class in &chain {
                let level = stack.level_for_class(level_class).ok_or_else(|| {
                    StorageError::integrity("chain class missing from its own stack")
                })?;
                let id = match by_class.get(level_class) {
                    Some(id) => *id,
                    None => self.insert_row(&level.table, &level.properties, Vec::new())?,
                };
                full.push(LevelRow {
                    class: level_class.clone(),
                    table: level.table.clone(),
                    id,
                });
            }
            for i in 0..full.len().saturating_sub(1) {
                let child = full[i + 1].clone();
                let parent = &full[i];
                self.conn.execute(
                    &format!(
                        "UPDATE {} SET {} = ?1, {} = ?2 WHERE {} = ?3",
                        parent.table, REAL_CLASS_COLUMN, REAL_ID_COLUMN, ID_COLUMN
                    ),
                    params![child.class, child.id, parent.id],
                )?;
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn move_property(
        &mut self,
        plan_class: &str,
        column: &str,
        ty: &SemanticType,
        from_class: &str,
        from_table: &str,
        to_class: &str,
        to_table: &str,
        adjacent: bool,
        ordinal: i64,
        indexed: bool,
    ) -> Result<(), StorageError> {
        info!(column, from_table, to_table, "moving property across levels");
        // Destination column.
        let to_cols = meta::columns_for_table(&self.conn, to_table)?;
        if !to_cols.iter().any(|c| c.name == column) {
            self.conn.execute(
                &format!(
                    "ALTER TABLE {to_table} ADD COLUMN {column} {}",
                    self.dialect.column_type(ty)
                ),
                [],
            )?;
            meta::record_column(&self.conn, to_table, column, ty, ordinal, indexed)?;
        }

        let owning = ty.is_reference() || ty.is_array();
        if self.dialect.supports_join_update && adjacent && !owning {
            // One backend-side correlated update per direction.
            let chain = self
                .registry
                .supertype_chain(plan_class)
                .map_err(StorageError::Core)?;
            let from_pos = chain.iter().position(|c| c == from_class);
            let to_pos = chain.iter().position(|c| c == to_class);
            let downward = matches!((from_pos, to_pos), (Some(f), Some(t)) if t > f);
            let sql = if downward {
                format!(
                    "UPDATE {to_table} SET {column} = (SELECT f.{column} FROM {from_table} f \
                     WHERE f.{REAL_CLASS_COLUMN} = ?1 AND f.{REAL_ID_COLUMN} = {to_table}.{ID_COLUMN})"
                )
            } else {
                format!(
                    "UPDATE {to_table} SET {column} = (SELECT f.{column} FROM {from_table} f \
                     WHERE {to_table}.{REAL_CLASS_COLUMN} = ?1 AND {to_table}.{REAL_ID_COLUMN} = f.{ID_COLUMN})"
                )
            };
            let marker = if downward { to_class } else { from_class };
            self.conn.execute(&sql, params![marker])?;
        } else {
            // Client-side cursor loop: walk each source row's chain to the
            // destination level. No cancellation point; runs to completion.
            let rows: Vec<(i64, rusqlite::types::Value)> = {
                let mut stmt = self.conn.prepare(&format!(
                    "SELECT {ID_COLUMN}, {column} FROM {from_table} WHERE {column} IS NOT NULL"
                ))?;
                let found = stmt.query_map([], |row| {
                    Ok((row.get(0)?, row.get::<_, rusqlite::types::Value>(1)?))
                })?;
                let mut out = Vec::new();
                for row in found {
                    out.push(row?);
                }
                out
            };
            for (from_id, value) in rows {
                let Some((concrete_class, concrete_id)) =
                    self.descend_to_concrete(from_class, from_table, from_id)?
                else {
                    continue;
                };
                let level_rows = self.logical_rows(&concrete_class, concrete_id)?;
                let Some(target) = level_rows.iter().find(|lr| lr.class == to_class) else {
                    continue;
                };
                self.conn.execute(
                    &format!("UPDATE {to_table} SET {column} = ?1 WHERE {ID_COLUMN} = ?2"),
                    params![value, target.id],
                )?;
                if owning {
                    // The ownership edge follows its owner row.
                    self.conn.execute(
                        "UPDATE SYS_OWNERSHIP SET OWNER_TABLE = ?1, OWNER_ID = ?2 \
                         WHERE OWNER_TABLE = ?3 AND OWNER_ID = ?4 AND RELATION_NAME = ?5",
                        params![to_table, target.id, from_table, from_id, column],
                    )?;
                }
            }
        }

        // Drop the old location.
        self.drop_index_best_effort(from_table, column)?;
        if self.dialect.can_drop_column {
            self.conn
                .execute(&format!("ALTER TABLE {from_table} DROP COLUMN {column}"), [])?;
        }
        meta::remove_column(&self.conn, from_table, column)?;
        Ok(())
    }

    fn remove_level(&mut self, class: &str, table: &str) -> Result<(), StorageError> {
        info!(class, table, "removing inheritance level");
        let parents = meta::direct_supertypes_stored(&self.conn, class)?;

        let rows: Vec<(i64, Option<String>, Option<i64>)> = {
            let mut stmt = self.conn.prepare(&format!(
                "SELECT {ID_COLUMN}, {REAL_CLASS_COLUMN}, {REAL_ID_COLUMN} FROM {table}"
            ))?;
            let found = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?;
            let mut out = Vec::new();
            for row in found {
                out.push(row?);
            }
            out
        };

        for (id, real_class, real_id) in &rows {
            // Rewire ancestor pointers around the vanishing row.
            for parent in &parents {
                if let Some(parent_table) = meta::table_for_class(&self.conn, parent)? {
                    self.conn.execute(
                        &format!(
                            "UPDATE {parent_table} SET {REAL_CLASS_COLUMN} = ?1, {REAL_ID_COLUMN} = ?2 \
                             WHERE {REAL_CLASS_COLUMN} = ?3 AND {REAL_ID_COLUMN} = ?4"
                        ),
                        params![real_class, real_id, class, id],
                    )?;
                }
            }
            for edge in protect::edges_from(&self.conn, table, *id)? {
                self.drop_level_edge(&edge)?;
            }
        }

        self.conn.execute(
            "DELETE FROM SYS_OWNERSHIP WHERE OWNER_TABLE = ?1 OR PROPERTY_TABLE = ?1",
            params![table],
        )?;
        self.exec_best_effort(&format!("DROP TABLE {table}"))?;
        meta::remove_class(&self.conn, class)?;
        meta::clear_columns_for_table(&self.conn, table)?;
        meta::remove_hierarchy_edges_for(&self.conn, class)?;
        Ok(())
    }

    fn drop_level_edge(&mut self, edge: &protect::OwnershipEdge) -> Result<(), StorageError> {
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

    fn rename_column(
        &mut self,
        table: &str,
        old: &str,
        new: &str,
        ty: &SemanticType,
    ) -> Result<(), StorageError> {
        info!(table, old, new, "renaming column");
        self.drop_index_best_effort(table, old)?;
        if self.dialect.can_rename_column {
            let sql = self.dialect.render_rename_column(table, old, new);
            self.conn.execute(&sql, [])?;
        } else {
            // Four-step fallback: create, copy, drop (where possible).
            self.conn.execute(
                &format!(
                    "ALTER TABLE {table} ADD COLUMN {new} {}",
                    self.dialect.column_type(ty)
                ),
                [],
            )?;
            self.conn
                .execute(&format!("UPDATE {table} SET {new} = {old}"), [])?;
            if self.dialect.can_drop_column {
                self.conn
                    .execute(&format!("ALTER TABLE {table} DROP COLUMN {old}"), [])?;
            }
        }
        meta::rename_column(&self.conn, table, old, new)?;
        protect::rename_relation(&self.conn, table, old, new)?;
        Ok(())
    }

    fn retype_column(
        &mut self,
        report: &mut MigrationReport,
        table: &str,
        column: &str,
        old_ty: &SemanticType,
        new_ty: &SemanticType,
        lossy: bool,
    ) -> Result<(), StorageError> {
        self.drop_index_best_effort(table, column)?;
        if lossy {
            warn!(
                table,
                column,
                old = %old_ty.storage_key(),
                new = %new_ty.storage_key(),
                "unconvertible type change drops existing data"
            );
            report.lossy_columns.push(format!("{table}.{column}"));
            if old_ty.is_reference() || old_ty.is_array() {
                self.release_column_references(table, column)?;
            }
            if self.dialect.can_drop_column {
                self.conn
                    .execute(&format!("ALTER TABLE {table} DROP COLUMN {column}"), [])?;
            } else if self.dialect.can_rename_column {
                let tomb = self.dialect.identifier(&format!("{column}_OLD"));
                let sql = self.dialect.render_rename_column(table, column, &tomb);
                self.conn.execute(&sql, [])?;
            } else {
                return Err(StorageError::Migration(format!(
                    "dialect {} cannot drop or rename column {table}.{column}",
                    self.dialect.name
                )));
            }
            self.conn.execute(
                &format!(
                    "ALTER TABLE {table} ADD COLUMN {column} {}",
                    self.dialect.column_type(new_ty)
                ),
                [],
            )?;
            meta::set_column_type(&self.conn, table, column, new_ty)?;
            return Ok(());
        }

        info!(
            table,
            column,
            old = %old_ty.storage_key(),
            new = %new_ty.storage_key(),
            "retyping column"
        );
        if self.dialect.can_retype_column {
            self.conn.execute(
                &format!(
                    "ALTER TABLE {table} ALTER COLUMN {column} {}",
                    self.dialect.column_type(new_ty)
                ),
                [],
            )?;
        } else if self.dialect.can_rename_column {
            // Rename-old / create-new / copy / drop-old fallback.
            let tomb = self.dialect.identifier(&format!("{column}_OLD"));
            let sql = self.dialect.render_rename_column(table, column, &tomb);
            self.conn.execute(&sql, [])?;
            self.conn.execute(
                &format!(
                    "ALTER TABLE {table} ADD COLUMN {column} {}",
                    self.dialect.column_type(new_ty)
                ),
                [],
            )?;
            self.conn
                .execute(&format!("UPDATE {table} SET {column} = {tomb}"), [])?;
            if self.dialect.can_drop_column {
                self.conn
                    .execute(&format!("ALTER TABLE {table} DROP COLUMN {tomb}"), [])?;
            }
        } else {
            return Err(StorageError::Migration(format!(
                "dialect {} cannot retype column {table}.{column}",
                self.dialect.name
            )));
        }
        meta::set_column_type(&self.conn, table, column, new_ty)?;

        // A widened reference column: re-validate every existing value
        // against the new declared class.
        if let (SemanticType::Ref(old_class), SemanticType::Ref(new_class)) = (old_ty, new_ty) {
            self.revalidate_references(table, column, old_class, new_class)?;
        }
        Ok(())
    }

    fn revalidate_references(
        &mut self,
        table: &str,
        column: &str,
        old_class: &str,
        new_class: &str,
    ) -> Result<(), StorageError> {
        let old_table = self.class_table(old_class);
        let new_declared_table = self.class_table(new_class);
        let rows: Vec<(i64, i64)> = {
            let mut stmt = self.conn.prepare(&format!(
                "SELECT {ID_COLUMN}, {column} FROM {table} WHERE {column} IS NOT NULL"
            ))?;
            let found = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
            let mut out = Vec::new();
            for row in found {
                out.push(row?);
            }
            out
        };
        for (row_id, target_id) in rows {
            let resolved = self.descend_to_concrete(old_class, &old_table, target_id)?;
            let mut repointed = false;
            if let Some((concrete_class, concrete_id)) = resolved {
                if self.registry.is_subtype(&concrete_class, new_class) {
                    let level_rows = self.logical_rows(&concrete_class, concrete_id)?;
                    if let Some(target) = level_rows.iter().find(|lr| lr.class == new_class) {
                        // Compatible: re-cast to the new declared level.
                        self.conn.execute(
                            &format!("UPDATE {table} SET {column} = ?1 WHERE {ID_COLUMN} = ?2"),
                            params![target.id, row_id],
                        )?;
                        if let Some(edge) =
                            protect::edge_for_relation(&self.conn, table, row_id, column)?
                        {
                            protect::unprotect(
                                &self.conn,
                                &edge.owner_table,
                                edge.owner_id,
                                &edge.relation,
                                &edge.property_table,
                                edge.property_id,
                            )?;
                        }
                        protect::protect(
                            &self.conn,
                            table,
                            row_id,
                            column,
                            &new_declared_table,
                            target.id,
                            &concrete_class,
                        )?;
                        repointed = true;
                    }
                }
            }
            if !repointed {
                // Incompatible: release and possibly collect the target.
                if let Some(edge) = protect::edge_for_relation(&self.conn, table, row_id, column)? {
                    self.drop_level_edge(&edge)?;
                }
                self.conn.execute(
                    &format!("UPDATE {table} SET {column} = NULL WHERE {ID_COLUMN} = ?1"),
                    params![row_id],
                )?;
            }
        }
        Ok(())
    }

    fn drop_column(
        &mut self,
        table: &str,
        column: &str,
        ty: &SemanticType,
    ) -> Result<(), StorageError> {
        info!(table, column, "dropping column");
        if ty.is_reference() || ty.is_array() {
            self.release_column_references(table, column)?;
        }
        self.drop_index_best_effort(table, column)?;
        if self.dialect.can_drop_column {
            self.conn
                .execute(&format!("ALTER TABLE {table} DROP COLUMN {column}"), [])?;
        }
        meta::remove_column(&self.conn, table, column)?;
        Ok(())
    }

    /// Unprotects (and possibly collects) every row a reference column
    /// points at, ahead of the column's removal.
    fn release_column_references(&mut self, table: &str, column: &str) -> Result<(), StorageError> {
        let ids: Vec<i64> = {
            let mut stmt = self.conn.prepare(&format!(
                "SELECT {ID_COLUMN} FROM {table} WHERE {column} IS NOT NULL"
            ))?;
            let found = stmt.query_map([], |row| row.get(0))?;
            let mut out = Vec::new();
            for row in found {
                out.push(row?);
            }
            out
        };
        for row_id in ids {
            if let Some(edge) = protect::edge_for_relation(&self.conn, table, row_id, column)? {
                self.drop_level_edge(&edge)?;
            }
        }
        Ok(())
    }

    fn recreate_indexes(&mut self, class: &str, table: &str) -> Result<(), StorageError> {
        debug!(table, "recreating indexes");
        for col in meta::columns_for_table(&self.conn, table)? {
            self.drop_index_best_effort(table, &col.name)?;
        }
        let stack = ClassStack::from_class(&self.registry, &self.dialect, class)?;
        let Some(level) = stack.level_for_class(class) else {
            return Ok(());
        };
        for prop in &level.properties {
            let column = self.dialect.identifier(&prop.name);
            meta::set_column_indexed(&self.conn, table, &column, prop.indexed)?;
            if prop.indexed {
                self.conn.execute(
                    &format!(
                        "CREATE INDEX {} ON {table} ({column})",
                        self.index_name(table, &column)
                    ),
                    [],
                )?;
            }
        }
        Ok(())
    }

    // -------------------------------------------------------------------
    // Helpers
    // -------------------------------------------------------------------

    fn index_name(&self, table: &str, column: &str) -> String {
        self.dialect.identifier(&format!("{table}_{column}_IX"))
    }

    fn drop_index_best_effort(&self, table: &str, column: &str) -> Result<(), StorageError> {
        let sql = self.dialect.render_drop_index(&self.index_name(table, column));
        self.exec_best_effort(&sql)
    }

    /// Executes a drop statement, swallowing only the backend's specific
    /// missing-table/missing-index signal.
    fn exec_best_effort(&self, sql: &str) -> Result<(), StorageError> {
        match self.conn.execute(sql, []) {
            Ok(_) => Ok(()),
            Err(e) if is_missing_schema_object(&e) => {
                debug!(sql, "best-effort drop target absent");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}
