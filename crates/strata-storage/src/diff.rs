//! The schema diff engine.
//!
//! Compares a class's previously persisted shape (reconstructed from the
//! catalog) against its currently registered shape and produces a
//! [`MigrationPlan`]: the minimal ordered sequence of structural steps that
//! brings the backend in line. The plan is assembled in the migrator's
//! fixed execution order -- inheritance structure first, then field moves,
//! then removed-inheritance cleanup, then scalar field changes, then index
//! recreation.

use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use strata_core::{SemanticType, TypeRegistry};

use crate::compat::TypeCompatibilityOracle;
use crate::dialect::Dialect;
use crate::error::StorageError;
use crate::level::ClassStack;
use crate::meta;

/// One column of a generated table, by its backend name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    pub ty: SemanticType,
    pub indexed: bool,
}

/// One structural migration step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum MigrationStep {
    AddHierarchyEdge {
        subclass: String,
        superclass: String,
    },
    RemoveHierarchyEdge {
        subclass: String,
        superclass: String,
    },
    CreateClassTable {
        class: String,
        table: String,
        columns: Vec<ColumnSpec>,
    },
    /// Creates the missing level rows (and rewires real-class pointers) for
    /// existing objects after new inheritance levels were introduced.
    BackfillLevelRows {
        class: String,
    },
    /// Copies a property's column and data to another inheritance level and
    /// drops it from its old location.
    MoveProperty {
        column: String,
        ty: SemanticType,
        from_class: String,
        from_table: String,
        to_class: String,
        to_table: String,
        /// The two levels are adjacent in the chain; enables the
        /// backend-side join-update copy.
        adjacent: bool,
        ordinal: i64,
        indexed: bool,
    },
    /// Drops a no-longer-inherited level: rows, table, and metadata.
    RemoveLevel {
        class: String,
        table: String,
    },
    RenameColumn {
        table: String,
        old: String,
        new: String,
        ty: SemanticType,
    },
    RetypeColumn {
        table: String,
        column: String,
        old_ty: SemanticType,
        new_ty: SemanticType,
        /// The oracle rejected the conversion: the old data is dropped by
        /// documented contract.
        lossy: bool,
    },
    AddColumn {
        table: String,
        column: String,
        ty: SemanticType,
        ordinal: i64,
        indexed: bool,
    },
    DropColumn {
        table: String,
        column: String,
        ty: SemanticType,
    },
    /// Drops and recreates every index of the table from the current
    /// descriptors.
    RecreateIndexes {
        class: String,
        table: String,
    },
}

/// The ordered change set for one class.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationPlan {
    pub class: String,
    pub steps: Vec<MigrationStep>,
}

impl MigrationPlan {
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }
}

struct LevelSpec {
    class: String,
    table: String,
    columns: Vec<ColumnSpec>,
}

/// Computes the migration plan for `class`.
pub fn diff_class(
    registry: &TypeRegistry,
    dialect: &Dialect,
    conn: &Connection,
    class: &str,
) -> Result<MigrationPlan, StorageError> {
    let new_stack = ClassStack::from_class(registry, dialect, class)?;
    let new_levels: Vec<LevelSpec> = new_stack
        .levels
        .iter()
        .map(|level| LevelSpec {
            class: level.class.clone(),
            table: level.table.clone(),
            columns: level
                .properties
                .iter()
                .map(|p| ColumnSpec {
                    name: dialect.identifier(&p.name),
                    ty: p.ty.clone(),
                    indexed: p.indexed,
                })
                .collect(),
        })
        .collect();
    let old_stack = ClassStack::from_catalog(conn, class)?;
    let old_classes: Vec<String> = old_stack
        .as_ref()
        .map(|s| s.levels.iter().map(|l| l.class.clone()).collect())
        .unwrap_or_default();
    let in_new = |c: &str| new_levels.iter().any(|l| l.class == c);

    let mut phase_inherit = Vec::new();
    let mut phase_moves = Vec::new();
    let mut phase_level_cleanup = Vec::new();
    let mut phase_edge_cleanup = Vec::new();
    let mut phase_fields = Vec::new();
    // Tables needing their indexes rebuilt, by level class.
    let mut index_tables: Vec<String> = Vec::new();
    let touch_index = |index_tables: &mut Vec<String>, class: &str| {
        if !index_tables.iter().any(|c| c == class) {
            index_tables.push(class.to_string());
        }
    };

    // --- Hierarchy edges -------------------------------------------------
    let mut desired_edges: Vec<(String, String)> = Vec::new();
    for level in &new_levels {
        let def = registry.get(&level.class)?;
        for sup in def.direct_supertypes() {
            desired_edges.push((level.class.clone(), sup.to_string()));
        }
    }
    let mut involved: Vec<String> = new_levels.iter().map(|l| l.class.clone()).collect();
    for c in &old_classes {
        if !involved.contains(c) {
            involved.push(c.clone());
        }
    }
    let mut current_edges: Vec<(String, String)> = Vec::new();
    for c in &involved {
        for sup in meta::direct_supertypes_stored(conn, c)? {
            current_edges.push((c.clone(), sup));
        }
    }
    for (sub, sup) in &desired_edges {
        if !current_edges.iter().any(|e| &e.0 == sub && &e.1 == sup) {
            phase_inherit.push(MigrationStep::AddHierarchyEdge {
                subclass: sub.clone(),
                superclass: sup.clone(),
            });
        }
    }
    // Only edges whose subclass is still in the new chain are removed here;
    // edges of a dropped level go with its RemoveLevel step.
    for (sub, sup) in &current_edges {
        if in_new(sub) && !desired_edges.iter().any(|e| &e.0 == sub && &e.1 == sup) {
            phase_edge_cleanup.push(MigrationStep::RemoveHierarchyEdge {
                subclass: sub.clone(),
                superclass: sup.clone(),
            });
        }
    }

    // --- Missing level tables -------------------------------------------
    for level in &new_levels {
        if meta::table_for_class(conn, &level.class)?.is_none() {
            phase_inherit.push(MigrationStep::CreateClassTable {
                class: level.class.clone(),
                table: level.table.clone(),
                columns: level.columns.clone(),
            });
        }
    }
    if old_stack.is_some() && new_levels.iter().any(|l| !old_classes.contains(&l.class)) {
        phase_inherit.push(MigrationStep::BackfillLevelRows {
            class: class.to_string(),
        });
    }

    // --- Per-property comparison ----------------------------------------
    let mut moved: Vec<String> = Vec::new();
    if let Some(old) = &old_stack {
        // Property moves: same column, same type, different level.
        for level in &new_levels {
            for (ordinal, col) in level.columns.iter().enumerate() {
                for old_level in &old.levels {
                    let Some(old_col) = old_level.properties.iter().find(|p| p.name == col.name)
                    else {
                        continue;
                    };
                    if old_level.class != level.class && old_col.ty == col.ty {
                        let adjacent = match (
                            new_levels.iter().position(|l| l.class == old_level.class),
                            new_levels.iter().position(|l| l.class == level.class),
                        ) {
                            (Some(a), Some(b)) => a.abs_diff(b) == 1,
                            _ => false,
                        };
                        phase_moves.push(MigrationStep::MoveProperty {
                            column: col.name.clone(),
                            ty: col.ty.clone(),
                            from_class: old_level.class.clone(),
                            from_table: old_level.table.clone(),
                            to_class: level.class.clone(),
                            to_table: level.table.clone(),
                            adjacent,
                            ordinal: ordinal as i64,
                            indexed: col.indexed,
                        });
                        moved.push(col.name.clone());
                        touch_index(&mut index_tables, &level.class);
                    }
                }
            }
        }

        // Removed levels: dropped once no other persisted class still
        // chains through them.
        for old_class in &old_classes {
            if in_new(old_class) {
                continue;
            }
            let subs = meta::direct_subclasses_stored(conn, old_class)?;
            let only_ours = subs
                .iter()
                .all(|s| old_classes.contains(s) || in_new(s));
            if only_ours {
                if let Some(table) = meta::table_for_class(conn, old_class)? {
                    phase_level_cleanup.push(MigrationStep::RemoveLevel {
                        class: old_class.clone(),
                        table,
                    });
                }
            }
        }

        // Column-level diffs for levels present in both shapes.
        for level in &new_levels {
            let Some(old_level) = old.levels.iter().find(|l| l.class == level.class) else {
                continue;
            };
            let old_cols: Vec<ColumnSpec> = old_level
                .properties
                .iter()
                .filter(|p| !moved.contains(&p.name))
                .map(|p| ColumnSpec {
                    name: p.name.clone(),
                    ty: p.ty.clone(),
                    indexed: p.indexed,
                })
                .collect();
            let new_cols: Vec<ColumnSpec> = level
                .columns
                .iter()
                .filter(|c| !moved.contains(&c.name))
                .cloned()
                .collect();

            // Rename detection: same position in the level, same type,
            // different name, and neither name appears on the other side.
            let mut renamed_old: Vec<String> = Vec::new();
            let mut renamed_new: Vec<String> = Vec::new();
            for i in 0..old_cols.len().min(new_cols.len()) {
                let o = &old_cols[i];
                let n = &new_cols[i];
                if o.name != n.name
                    && o.ty == n.ty
                    && !new_cols.iter().any(|c| c.name == o.name)
                    && !old_cols.iter().any(|c| c.name == n.name)
                {
                    phase_fields.push(MigrationStep::RenameColumn {
                        table: level.table.clone(),
                        old: o.name.clone(),
                        new: n.name.clone(),
                        ty: n.ty.clone(),
                    });
                    renamed_old.push(o.name.clone());
                    renamed_new.push(n.name.clone());
                    touch_index(&mut index_tables, &level.class);
                    if o.indexed != n.indexed {
                        touch_index(&mut index_tables, &level.class);
                    }
                }
            }

            let oracle = TypeCompatibilityOracle::new(registry);
            for (ordinal, n) in new_cols.iter().enumerate() {
                if renamed_new.contains(&n.name) {
                    continue;
                }
                match old_cols.iter().find(|o| o.name == n.name) {
                    Some(o) => {
                        if o.ty != n.ty {
                            phase_fields.push(MigrationStep::RetypeColumn {
                                table: level.table.clone(),
                                column: n.name.clone(),
                                old_ty: o.ty.clone(),
                                new_ty: n.ty.clone(),
                                lossy: !oracle.calculate(&o.ty, &n.ty),
                            });
                            touch_index(&mut index_tables, &level.class);
                        } else if o.indexed != n.indexed {
                            touch_index(&mut index_tables, &level.class);
                        }
                    }
                    None => {
                        phase_fields.push(MigrationStep::AddColumn {
                            table: level.table.clone(),
                            column: n.name.clone(),
                            ty: n.ty.clone(),
                            ordinal: ordinal as i64,
                            indexed: n.indexed,
                        });
                        touch_index(&mut index_tables, &level.class);
                    }
                }
            }
            for o in &old_cols {
                if renamed_old.contains(&o.name) {
                    continue;
                }
                if !new_cols.iter().any(|n| n.name == o.name) {
                    phase_fields.push(MigrationStep::DropColumn {
                        table: level.table.clone(),
                        column: o.name.clone(),
                        ty: o.ty.clone(),
                    });
                    touch_index(&mut index_tables, &level.class);
                }
            }
        }
    }

    // --- Assemble in execution order ------------------------------------
    let mut steps = phase_inherit;
    steps.extend(phase_moves);
    steps.extend(phase_level_cleanup);
    steps.extend(phase_edge_cleanup);
    steps.extend(phase_fields);
    for level_class in index_tables {
        if let Some(level) = new_levels.iter().find(|l| l.class == level_class) {
            steps.push(MigrationStep::RecreateIndexes {
                class: level.class.clone(),
                table: level.table.clone(),
            });
        }
    }

    Ok(MigrationPlan {
        class: class.to_string(),
        steps,
    })
}
