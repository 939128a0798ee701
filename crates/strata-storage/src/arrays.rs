//! Array persistence.
//!
//! An array is a graph node with no declared properties: an id-bearing
//! header row in `SYS_ARRAY` plus one positional member row per element in
//! a per-element-type member table. Each member is protected by an
//! ownership edge from the header, so the ordinary cascading delete
//! reclaims a whole array once its header loses its last protector.
//! Multidimensional arrays recurse: an element that is itself an array is
//! saved as its own header + members, referenced by id.

use rusqlite::{params, OptionalExtension};

use strata_core::{ArrayValue, ObjectSpace, SemanticType, Value};

use crate::error::StorageError;
use crate::level::ID_COLUMN;
use crate::protect;
use crate::store::{
    bind_scalar, decode_scalar, raw_integer, LoadContext, SaveContext, Store,
};

/// Header table for every persisted array.
pub(crate) const ARRAY_TABLE: &str = "SYS_ARRAY";

const POSITION_COLUMN: &str = "POSITION";
const COMPONENT_CLASS_COLUMN: &str = "COMPONENT_CLASS";
const VALUE_COLUMN: &str = "VAL";

/// Relation names on the edges linking headers, members, and elements.
const MEMBER_RELATION: &str = "member";
const ELEMENT_RELATION: &str = "element";

impl Store {
    /// Persists an array: header first, then one member row per element in
    /// position order. Returns the header id.
    pub(crate) fn save_array(
        &mut self,
        space: &ObjectSpace,
        array: &ArrayValue,
        ctx: &mut SaveContext,
    ) -> Result<i64, StorageError> {
        let component_key = array.component.storage_key();
        let header_id = if self.dialect.supports_identity {
            self.conn.execute(
                &format!("INSERT INTO {ARRAY_TABLE} (COMPONENT_TYPE) VALUES (?1)"),
                params![component_key],
            )?;
            self.conn.last_insert_rowid()
        } else {
            let id = self.allocate_array_id()?;
            self.conn.execute(
                &format!("INSERT INTO {ARRAY_TABLE} ({ID_COLUMN}, COMPONENT_TYPE) VALUES (?1, ?2)"),
                params![id, component_key],
            )?;
            id
        };

        let member_table = self.ensure_member_table(&array.component)?;
        for (position, element) in array.elements.iter().enumerate() {
            let mut element_edge: Option<(String, i64, String)> = None;
            let mut element_deferred: Option<(strata_core::Handle, String)> = None;
            let (member_class, bound) = match element {
                Value::Null => (component_key.clone(), rusqlite::types::Value::Null),
                Value::Array(sub) => {
                    let sub_id = self.save_array(space, sub, ctx)?;
                    element_edge = Some((
                        ARRAY_TABLE.to_string(),
                        sub_id,
                        sub.component.storage_key(),
                    ));
                    (
                        SemanticType::array(sub.component.clone()).storage_key(),
                        rusqlite::types::Value::Integer(sub_id),
                    )
                }
                Value::Ref(target) => {
                    let declared = match &array.component {
                        SemanticType::Ref(c) => c.clone(),
                        other => {
                            return Err(StorageError::integrity(format!(
                                "reference element in array of {}",
                                other.storage_key()
                            )))
                        }
                    };
                    match self.resolve_reference(space, *target, &declared, ctx)? {
                        Some(cast) => {
                            element_edge = Some((
                                self.class_table(&declared),
                                cast.id,
                                cast.concrete_class.clone(),
                            ));
                            (cast.concrete_class, rusqlite::types::Value::Integer(cast.id))
                        }
                        None => {
                            element_deferred = Some((*target, declared.clone()));
                            (declared, rusqlite::types::Value::Null)
                        }
                    }
                }
                scalar => (component_key.clone(), bind_scalar(scalar)),
            };

            let member_id = if self.dialect.supports_identity {
                self.conn.execute(
                    &format!(
                        "INSERT INTO {member_table} \
                         ({POSITION_COLUMN}, {COMPONENT_CLASS_COLUMN}, {VALUE_COLUMN}) \
                         VALUES (?1, ?2, ?3)"
                    ),
                    params![position as i64, member_class, bound],
                )?;
                self.conn.last_insert_rowid()
            } else {
                let id = self.allocate_member_id(&member_table)?;
                self.conn.execute(
                    &format!(
                        "INSERT INTO {member_table} \
                         ({ID_COLUMN}, {POSITION_COLUMN}, {COMPONENT_CLASS_COLUMN}, {VALUE_COLUMN}) \
                         VALUES (?1, ?2, ?3, ?4)"
                    ),
                    params![id, position as i64, member_class, bound],
                )?;
                id
            };

            protect::protect(
                &self.conn,
                ARRAY_TABLE,
                header_id,
                MEMBER_RELATION,
                &member_table,
                member_id,
                &component_key,
            )?;
            if let Some((target_table, target_id, target_class)) = element_edge {
                protect::protect(
                    &self.conn,
                    &member_table,
                    member_id,
                    ELEMENT_RELATION,
                    &target_table,
                    target_id,
                    &target_class,
                )?;
            }
            if let Some((target, declared)) = element_deferred {
                ctx.deferred.push(crate::deferred::DeferredReference {
                    owner_table: member_table.clone(),
                    column: VALUE_COLUMN.to_string(),
                    owner_id: member_id,
                    relation: ELEMENT_RELATION.to_string(),
                    referenced: target,
                    referenced_class: declared,
                });
            }
        }
        Ok(header_id)
    }

    /// Loads an array from its header id: one- or multi-dimensional per the
    /// header's declared component type, members ordered by position.
    pub(crate) fn load_array(
        &mut self,
        space: &mut ObjectSpace,
        header_id: i64,
        ctx: &mut LoadContext,
    ) -> Result<ArrayValue, StorageError> {
        let key: String = self
            .conn
            .query_row(
                &format!("SELECT COMPONENT_TYPE FROM {ARRAY_TABLE} WHERE {ID_COLUMN} = ?1"),
                params![header_id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| {
                StorageError::integrity(format!("array header {header_id} does not exist"))
            })?;
        let component = SemanticType::parse_key(&key).map_err(StorageError::Core)?;
        let member_table = self.member_table_name(&component);

        // Members are linked to their header through ownership edges.
        let members: Vec<rusqlite::types::Value> = {
            let mut stmt = self.conn.prepare(&format!(
                "SELECT m.{VALUE_COLUMN} FROM {member_table} m \
                 JOIN SYS_OWNERSHIP o ON o.PROPERTY_TABLE = ?1 AND o.PROPERTY_ID = m.{ID_COLUMN} \
                 WHERE o.OWNER_TABLE = ?2 AND o.OWNER_ID = ?3 \
                 ORDER BY m.{POSITION_COLUMN}"
            ))?;
            let rows = stmt.query_map(params![member_table, ARRAY_TABLE, header_id], |row| {
                row.get::<_, rusqlite::types::Value>(0)
            })?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            out
        };

        let mut elements = Vec::with_capacity(members.len());
        for raw in members {
            if matches!(raw, rusqlite::types::Value::Null) {
                elements.push(Value::Null);
                continue;
            }
            let value = match &component {
                SemanticType::Array(_) => {
                    let sub_id = raw_integer(&raw)?;
                    Value::Array(self.load_array(space, sub_id, ctx)?)
                }
                SemanticType::Ref(declared) => {
                    let id = raw_integer(&raw)?;
                    match self.load_object(space, declared, id, ctx)? {
                        Some(h) => Value::Ref(h),
                        None => Value::Null,
                    }
                }
                scalar => decode_scalar(scalar, raw)?,
            };
            elements.push(value);
        }
        Ok(ArrayValue::new(component, elements))
    }

    /// Creates (once per store lifetime) the member table for an element
    /// type. One member table exists per distinct persisted element type,
    /// suffixed by the element's table name.
    fn ensure_member_table(&mut self, component: &SemanticType) -> Result<String, StorageError> {
        let name = self.member_table_name(component);
        if self.ensured_member_tables.contains(&name) {
            return Ok(name);
        }
        let value_type = self.dialect.column_type(component);
        let text_type = self.dialect.column_type(&SemanticType::Text);
        self.conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {name} (\
                 {ID_COLUMN} INTEGER PRIMARY KEY, \
                 {POSITION_COLUMN} INTEGER NOT NULL, \
                 {COMPONENT_CLASS_COLUMN} {text_type}, \
                 {VALUE_COLUMN} {value_type})"
            ),
            [],
        )?;
        self.ensured_member_tables.insert(name.clone());
        Ok(name)
    }

    /// Member table name for an element type: scalar types use their type
    /// key, references their class's table name, nested arrays share one
    /// table.
    pub(crate) fn member_table_name(&self, component: &SemanticType) -> String {
        let suffix = match component {
            SemanticType::Ref(class) => self.dialect.identifier(class),
            SemanticType::Array(_) => "ARRAY".to_string(),
            scalar => scalar.storage_key().to_ascii_uppercase(),
        };
        self.dialect.identifier(&format!("SYS_ARRAY_M_{suffix}"))
    }

    fn allocate_array_id(&mut self) -> Result<i64, StorageError> {
        let max: Option<i64> = self.conn.query_row(
            &format!("SELECT MAX({ID_COLUMN}) FROM {ARRAY_TABLE}"),
            [],
            |row| row.get(0),
        )?;
        Ok(max.unwrap_or(0) + 1)
    }

    fn allocate_member_id(&mut self, member_table: &str) -> Result<i64, StorageError> {
        let max: Option<i64> = self.conn.query_row(
            &format!("SELECT MAX({ID_COLUMN}) FROM {member_table}"),
            [],
            |row| row.get(0),
        )?;
        Ok(max.unwrap_or(0) + 1)
    }
}
