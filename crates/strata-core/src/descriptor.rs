//! Registered class shapes.
//!
//! A [`ClassDef`] declares everything the engine needs to know about one
//! persisted type: its place in the hierarchy (superclass plus implemented
//! interfaces), its own properties (never including inherited ones), and an
//! optional container capability for list-like or map-like classes whose
//! contents are snapshotted instead of their internal fields.

use serde::{Deserialize, Serialize};

use crate::types::SemanticType;

/// Whether a registered type is a concrete class or an interface.
///
/// Interfaces carry no properties of their own; they exist so that objects
/// can be queried and referenced through them, which requires each object to
/// own a row at every interface level of its stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TypeKind {
    Class,
    Interface,
}

/// One declared property of a class.
///
/// Properties are indexed by default; the no-index annotation clears the
/// flag. Large text/binary payloads are expressed through the
/// `LongText`/`Bytes` semantic types rather than a separate annotation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyDef {
    pub name: String,
    pub ty: SemanticType,
    pub indexed: bool,
}

impl PropertyDef {
    pub fn new(name: &str, ty: SemanticType) -> Self {
        PropertyDef {
            name: name.to_string(),
            ty,
            indexed: true,
        }
    }

    /// Clears the index annotation.
    pub fn no_index(mut self) -> Self {
        self.indexed = false;
        self
    }
}

/// Container capability of a class.
///
/// A container class persists a snapshot of its contents as synthetic
/// array-typed properties in place of its declared fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ContainerKind {
    /// Positional container; snapshots as `_members` + `_member_count`.
    List { element: SemanticType },
    /// Keyed container; snapshots as `_keys` + `_values`.
    Map {
        key: SemanticType,
        value: SemanticType,
    },
}

/// The registered shape of one persisted class or interface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassDef {
    pub name: String,
    pub kind: TypeKind,
    /// Direct superclass, if any.
    pub parent: Option<String>,
    /// Directly implemented interfaces.
    pub interfaces: Vec<String>,
    /// Properties declared at this level only -- inherited properties are
    /// never redeclared.
    pub properties: Vec<PropertyDef>,
    /// Container capability, if this class is list-like or map-like.
    pub container: Option<ContainerKind>,
}

impl ClassDef {
    /// A concrete class with no supertype.
    pub fn new(name: &str) -> Self {
        ClassDef {
            name: name.to_string(),
            kind: TypeKind::Class,
            parent: None,
            interfaces: Vec::new(),
            properties: Vec::new(),
            container: None,
        }
    }

    /// An interface: no properties, no parent class.
    pub fn interface(name: &str) -> Self {
        ClassDef {
            name: name.to_string(),
            kind: TypeKind::Interface,
            parent: None,
            interfaces: Vec::new(),
            properties: Vec::new(),
            container: None,
        }
    }

    pub fn extends(mut self, parent: &str) -> Self {
        self.parent = Some(parent.to_string());
        self
    }

    pub fn implements(mut self, interface: &str) -> Self {
        self.interfaces.push(interface.to_string());
        self
    }

    pub fn with_property(mut self, property: PropertyDef) -> Self {
        self.properties.push(property);
        self
    }

    pub fn with_container(mut self, container: ContainerKind) -> Self {
        self.container = Some(container);
        self
    }

    pub fn is_interface(&self) -> bool {
        self.kind == TypeKind::Interface
    }

    /// Direct supertypes: the parent (if any) followed by the interfaces,
    /// in declaration order.
    pub fn direct_supertypes(&self) -> Vec<&str> {
        let mut out = Vec::with_capacity(1 + self.interfaces.len());
        if let Some(parent) = &self.parent {
            out.push(parent.as_str());
        }
        for interface in &self.interfaces {
            out.push(interface.as_str());
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_produces_expected_shape() {
        let def = ClassDef::new("ColoredShape")
            .extends("Shape")
            .implements("Drawable")
            .with_property(PropertyDef::new("weight", SemanticType::I32))
            .with_property(PropertyDef::new("notes", SemanticType::LongText).no_index());

        assert_eq!(def.kind, TypeKind::Class);
        assert_eq!(def.parent.as_deref(), Some("Shape"));
        assert_eq!(def.direct_supertypes(), vec!["Shape", "Drawable"]);
        assert_eq!(def.properties.len(), 2);
        assert!(def.properties[0].indexed);
        assert!(!def.properties[1].indexed);
    }

    #[test]
    fn interface_has_no_properties() {
        let def = ClassDef::interface("Drawable");
        assert!(def.is_interface());
        assert!(def.properties.is_empty());
    }
}
