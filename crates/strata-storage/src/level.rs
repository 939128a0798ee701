//! Per-inheritance-level row modeling.
//!
//! A [`LevelRepresentation`] maps one inheritance level of one object to its
//! table, columns, and values. A [`ClassStack`] is the ordered sequence of
//! levels from the most general supertype down to the concrete class. Stacks
//! are built fresh for every save, load, and schema-diff pass -- from an
//! instance, from the registry alone, or from the catalog (never a mix) --
//! and are discarded when the operation completes.

use rusqlite::Connection;

use strata_core::{
    ClassDef, ContainerKind, ContainerValue, Handle, ObjectSpace, PropertyDef, SemanticType,
    TypeRegistry, Value,
};

use crate::dialect::Dialect;
use crate::error::StorageError;
use crate::meta;

/// Primary key column present on every generated table.
pub const ID_COLUMN: &str = "ID";
/// Downward real-class pointer columns present on every generated table.
pub const REAL_CLASS_COLUMN: &str = "REAL_CLASS";
pub const REAL_ID_COLUMN: &str = "REAL_ID";

/// Synthetic placeholder property for levels with no columns of their own,
/// used when the dialect rejects an empty insert column list.
pub const FILLER_PROPERTY: &str = "_filler";

/// Synthetic snapshot properties of container-capable classes.
pub const MEMBERS_PROPERTY: &str = "_members";
pub const MEMBER_COUNT_PROPERTY: &str = "_member_count";
pub const KEYS_PROPERTY: &str = "_keys";
pub const VALUES_PROPERTY: &str = "_values";

/// One inheritance level's property/column/value mapping for one object.
#[derive(Debug, Clone)]
pub struct LevelRepresentation {
    pub class: String,
    pub table: String,
    /// Properties persisted at this level, after elision and synthetics.
    pub properties: Vec<PropertyDef>,
    /// Values parallel to `properties`; empty when the stack was built
    /// without an instance.
    pub values: Vec<Value>,
    /// Assigned once the level's row has been written.
    pub row_id: Option<i64>,
}

impl LevelRepresentation {
    /// Pairs each property with its value. Panics never: an instance-less
    /// stack yields no pairs.
    pub fn pairs(&self) -> impl Iterator<Item = (&PropertyDef, &Value)> {
        self.properties.iter().zip(self.values.iter())
    }
}

/// Ordered per-level representations: index 0 is the most general
/// supertype, the last entry is the concrete class.
#[derive(Debug, Clone)]
pub struct ClassStack {
    pub levels: Vec<LevelRepresentation>,
}

impl ClassStack {
    /// Builds the stack for an instance about to be saved.
    pub fn from_instance(
        registry: &TypeRegistry,
        dialect: &Dialect,
        space: &ObjectSpace,
        handle: Handle,
    ) -> Result<Self, StorageError> {
        let class = space.class_of(handle)?.to_string();
        build(registry, dialect, &class, Some((space, handle)))
    }

    /// Builds the value-less stack of a class as currently registered.
    pub fn from_class(
        registry: &TypeRegistry,
        dialect: &Dialect,
        class: &str,
    ) -> Result<Self, StorageError> {
        build(registry, dialect, class, None)
    }

    /// Reconstructs the previously persisted shape of a class from the
    /// catalog. Returns `None` for a class that has never been persisted.
    /// Property names at this point are column names.
    pub fn from_catalog(conn: &Connection, class: &str) -> Result<Option<Self>, StorageError> {
        if meta::table_for_class(conn, class)?.is_none() {
            return Ok(None);
        }
        let chain = meta::stored_chain(conn, class)?;
        let mut levels = Vec::with_capacity(chain.len());
        for level_class in chain {
            let table = meta::table_for_class(conn, &level_class)?.ok_or_else(|| {
                StorageError::integrity(format!(
                    "class {level_class} appears in stored hierarchy but has no table"
                ))
            })?;
            let properties = meta::columns_for_table(conn, &table)?
                .into_iter()
                .map(|col| PropertyDef {
                    name: col.name,
                    ty: col.ty,
                    indexed: col.indexed,
                })
                .collect();
            levels.push(LevelRepresentation {
                class: level_class,
                table,
                properties,
                values: Vec::new(),
                row_id: None,
            });
        }
        Ok(Some(ClassStack { levels }))
    }

    /// The concrete-class level ("actual representation").
    pub fn concrete(&self) -> &LevelRepresentation {
        // A stack always has at least the concrete level.
        &self.levels[self.levels.len() - 1]
    }

    pub fn level_for_class(&self, class: &str) -> Option<&LevelRepresentation> {
        self.levels.iter().find(|l| l.class == class)
    }
}

fn build(
    registry: &TypeRegistry,
    dialect: &Dialect,
    class: &str,
    instance: Option<(&ObjectSpace, Handle)>,
) -> Result<ClassStack, StorageError> {
    let chain = registry.supertype_chain(class)?;
    let mut defs: Vec<&ClassDef> = Vec::with_capacity(chain.len());
    for level_class in &chain {
        defs.push(registry.get(level_class)?);
    }

    // The lowest (most derived) level declaring a container capability gets
    // the snapshot synthetics in place of its own fields.
    let container_level = defs.iter().rposition(|def| def.container.is_some());

    let mut seen: Vec<String> = Vec::new();
    let mut levels = Vec::with_capacity(chain.len());
    for (i, level_class) in chain.iter().enumerate() {
        let def = defs[i];
        let mut properties = if Some(i) == container_level {
            synthetic_properties(def.container.as_ref().ok_or_else(|| {
                StorageError::integrity("container level without container kind")
            })?)
        } else {
            def.properties.clone()
        };

        // Duplicate-property elision: a property declared by an ancestor is
        // not repeated at a descendant level.
        properties.retain(|p| !seen.contains(&p.name));
        for p in &properties {
            seen.push(p.name.clone());
        }

        if properties.is_empty() && dialect.forbids_empty_insert {
            properties.push(PropertyDef::new(FILLER_PROPERTY, SemanticType::I32).no_index());
        }

        let values = match instance {
            Some((space, handle)) => {
                let object = space.get(handle)?;
                properties
                    .iter()
                    .map(|p| property_value(object.container.as_ref(), space, handle, p))
                    .collect::<Result<Vec<_>, StorageError>>()?
            }
            None => Vec::new(),
        };

        levels.push(LevelRepresentation {
            class: level_class.clone(),
            table: dialect.identifier(level_class),
            properties,
            values,
            row_id: None,
        });
    }

    Ok(ClassStack { levels })
}

fn synthetic_properties(container: &ContainerKind) -> Vec<PropertyDef> {
    match container {
        ContainerKind::List { element } => vec![
            PropertyDef::new(MEMBERS_PROPERTY, SemanticType::array(element.clone())).no_index(),
            PropertyDef::new(MEMBER_COUNT_PROPERTY, SemanticType::I32).no_index(),
        ],
        ContainerKind::Map { key, value } => vec![
            PropertyDef::new(KEYS_PROPERTY, SemanticType::array(key.clone())).no_index(),
            PropertyDef::new(VALUES_PROPERTY, SemanticType::array(value.clone())).no_index(),
        ],
    }
}

fn property_value(
    container: Option<&ContainerValue>,
    space: &ObjectSpace,
    handle: Handle,
    property: &PropertyDef,
) -> Result<Value, StorageError> {
    let value = match property.name.as_str() {
        MEMBERS_PROPERTY => match container {
            Some(ContainerValue::List(elements)) => match &property.ty {
                SemanticType::Array(component) => {
                    Value::array((**component).clone(), elements.clone())
                }
                _ => Value::Null,
            },
            _ => Value::Null,
        },
        MEMBER_COUNT_PROPERTY => match container {
            Some(ContainerValue::List(elements)) => Value::I32(elements.len() as i32),
            _ => Value::Null,
        },
        KEYS_PROPERTY => match container {
            Some(ContainerValue::Map(pairs)) => match &property.ty {
                SemanticType::Array(component) => Value::array(
                    (**component).clone(),
                    pairs.iter().map(|(k, _)| k.clone()).collect(),
                ),
                _ => Value::Null,
            },
            _ => Value::Null,
        },
        VALUES_PROPERTY => match container {
            Some(ContainerValue::Map(pairs)) => match &property.ty {
                SemanticType::Array(component) => Value::array(
                    (**component).clone(),
                    pairs.iter().map(|(_, v)| v.clone()).collect(),
                ),
                _ => Value::Null,
            },
            _ => Value::Null,
        },
        FILLER_PROPERTY => Value::Null,
        name => space.field(handle, name)?.clone(),
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::ClassDef;

    fn registry() -> TypeRegistry {
        let mut reg = TypeRegistry::new();
        reg.register(ClassDef::interface("Drawable")).unwrap();
        reg.register(
            ClassDef::new("Shape").with_property(PropertyDef::new("color", SemanticType::Text)),
        )
        .unwrap();
        reg.register(
            ClassDef::new("ColoredShape")
                .extends("Shape")
                .implements("Drawable")
                .with_property(PropertyDef::new("weight", SemanticType::I32)),
        )
        .unwrap();
        reg
    }

    #[test]
    fn stack_orders_most_general_first() {
        let reg = registry();
        let stack = ClassStack::from_class(&reg, &Dialect::sqlite(), "ColoredShape").unwrap();
        let classes: Vec<&str> = stack.levels.iter().map(|l| l.class.as_str()).collect();
        assert_eq!(classes, vec!["Shape", "Drawable", "ColoredShape"]);
        assert_eq!(stack.concrete().class, "ColoredShape");
        assert_eq!(stack.concrete().table, "COLOREDSHAPE");
    }

    #[test]
    fn redeclared_ancestor_property_is_elided() {
        let mut reg = TypeRegistry::new();
        reg.register(
            ClassDef::new("Base").with_property(PropertyDef::new("name", SemanticType::Text)),
        )
        .unwrap();
        reg.register(
            ClassDef::new("Derived")
                .extends("Base")
                .with_property(PropertyDef::new("name", SemanticType::Text))
                .with_property(PropertyDef::new("extra", SemanticType::I32)),
        )
        .unwrap();

        let stack = ClassStack::from_class(&reg, &Dialect::sqlite(), "Derived").unwrap();
        let derived = stack.level_for_class("Derived").unwrap();
        let names: Vec<&str> = derived.properties.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["extra"]);
    }

    #[test]
    fn interface_level_gets_filler_when_dialect_needs_it() {
        let reg = registry();
        let stack = ClassStack::from_class(&reg, &Dialect::generic(), "ColoredShape").unwrap();
        let drawable = stack.level_for_class("Drawable").unwrap();
        assert_eq!(drawable.properties.len(), 1);
        assert_eq!(drawable.properties[0].name, FILLER_PROPERTY);

        // SQLite can insert without columns; no filler there.
        let stack = ClassStack::from_class(&reg, &Dialect::sqlite(), "ColoredShape").unwrap();
        let drawable = stack.level_for_class("Drawable").unwrap();
        assert!(drawable.properties.is_empty());
    }

    #[test]
    fn container_class_snapshots_instead_of_fields() {
        let mut reg = TypeRegistry::new();
        reg.register(
            ClassDef::new("IntList")
                .with_property(PropertyDef::new("capacity", SemanticType::I32))
                .with_container(ContainerKind::List {
                    element: SemanticType::I32,
                }),
        )
        .unwrap();

        let mut space = ObjectSpace::new();
        let h = space.create("IntList");
        space.set(h, "capacity", Value::I32(16)).unwrap();
        space
            .set_container(
                h,
                ContainerValue::List(vec![Value::I32(4), Value::I32(5)]),
            )
            .unwrap();

        let stack = ClassStack::from_instance(&reg, &Dialect::sqlite(), &space, h).unwrap();
        let level = stack.concrete();
        let names: Vec<&str> = level.properties.iter().map(|p| p.name.as_str()).collect();
        // The declared field is replaced by the snapshot synthetics.
        assert_eq!(names, vec![MEMBERS_PROPERTY, MEMBER_COUNT_PROPERTY]);
        assert_eq!(level.values[1], Value::I32(2));
        match &level.values[0] {
            Value::Array(av) => assert_eq!(av.elements.len(), 2),
            other => panic!("expected array snapshot, got {other:?}"),
        }
    }

    #[test]
    fn map_container_snapshots_keys_and_values() {
        let mut reg = TypeRegistry::new();
        reg.register(ClassDef::new("Dict").with_container(ContainerKind::Map {
            key: SemanticType::Text,
            value: SemanticType::I32,
        }))
        .unwrap();

        let mut space = ObjectSpace::new();
        let h = space.create("Dict");
        space
            .set_container(
                h,
                ContainerValue::Map(vec![(Value::text("a"), Value::I32(1))]),
            )
            .unwrap();

        let stack = ClassStack::from_instance(&reg, &Dialect::sqlite(), &space, h).unwrap();
        let names: Vec<&str> = stack
            .concrete()
            .properties
            .iter()
            .map(|p| p.name.as_str())
            .collect();
        assert_eq!(names, vec![KEYS_PROPERTY, VALUES_PROPERTY]);
    }

    #[test]
    fn instance_stack_carries_field_values() {
        let reg = registry();
        let mut space = ObjectSpace::new();
        let h = space.create("ColoredShape");
        space.set(h, "color", Value::text("red")).unwrap();
        space.set(h, "weight", Value::I32(10)).unwrap();

        let stack = ClassStack::from_instance(&reg, &Dialect::sqlite(), &space, h).unwrap();
        let shape = stack.level_for_class("Shape").unwrap();
        assert_eq!(shape.values, vec![Value::text("red")]);
        let concrete = stack.concrete();
        assert_eq!(concrete.values, vec![Value::I32(10)]);
    }
}
