//! The object arena.
//!
//! [`ObjectSpace`] owns every in-memory object participating in a persistence
//! operation; objects refer to each other through [`Handle`] values. The
//! arena serves two purposes: it makes cyclic graphs expressible without
//! reference counting, and the handle is the identity key the engine uses to
//! detect an object that is currently mid-save (cycle resolution) -- two
//! equal-but-distinct objects have different handles and are never conflated.

use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::types::Value;

/// Stable identity of an object within its [`ObjectSpace`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Handle(pub u32);

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Snapshot payload of a container-capable object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ContainerValue {
    /// Positional contents, in order.
    List(Vec<Value>),
    /// Key/value contents, in insertion order.
    Map(Vec<(Value, Value)>),
}

/// One in-memory object: its concrete class, its property values, and --
/// for container-capable classes -- its contents snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectInstance {
    class: String,
    fields: IndexMap<String, Value>,
    pub container: Option<ContainerValue>,
}

impl ObjectInstance {
    fn new(class: &str) -> Self {
        ObjectInstance {
            class: class.to_string(),
            fields: IndexMap::new(),
            container: None,
        }
    }

    pub fn class(&self) -> &str {
        &self.class
    }

    /// The value of a field, `Value::Null` if never set.
    pub fn field(&self, name: &str) -> &Value {
        self.fields.get(name).unwrap_or(&Value::Null)
    }

    pub fn set_field(&mut self, name: &str, value: Value) {
        self.fields.insert(name.to_string(), value);
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }
}

/// Arena of live objects for one unit of work.
///
/// Handles index into the arena and stay valid for the arena's lifetime;
/// objects are never removed, only the whole space is dropped when the unit
/// of work completes.
#[derive(Debug, Clone, Default)]
pub struct ObjectSpace {
    objects: Vec<ObjectInstance>,
}

impl ObjectSpace {
    pub fn new() -> Self {
        ObjectSpace {
            objects: Vec::new(),
        }
    }

    /// Creates a new empty object of the given concrete class.
    pub fn create(&mut self, class: &str) -> Handle {
        let handle = Handle(self.objects.len() as u32);
        self.objects.push(ObjectInstance::new(class));
        handle
    }

    pub fn get(&self, handle: Handle) -> Result<&ObjectInstance, CoreError> {
        self.objects
            .get(handle.0 as usize)
            .ok_or(CoreError::UnknownHandle(handle.0))
    }

    pub fn get_mut(&mut self, handle: Handle) -> Result<&mut ObjectInstance, CoreError> {
        self.objects
            .get_mut(handle.0 as usize)
            .ok_or(CoreError::UnknownHandle(handle.0))
    }

    /// Sets one field on an object.
    pub fn set(&mut self, handle: Handle, field: &str, value: Value) -> Result<(), CoreError> {
        self.get_mut(handle)?.set_field(field, value);
        Ok(())
    }

    /// Reads one field; `Value::Null` if never set.
    pub fn field(&self, handle: Handle, field: &str) -> Result<&Value, CoreError> {
        Ok(self.get(handle)?.field(field))
    }

    pub fn class_of(&self, handle: Handle) -> Result<&str, CoreError> {
        Ok(self.get(handle)?.class())
    }

    /// Attaches a container snapshot to a container-capable object.
    pub fn set_container(
        &mut self,
        handle: Handle,
        container: ContainerValue,
    ) -> Result<(), CoreError> {
        self.get_mut(handle)?.container = Some(container);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}
