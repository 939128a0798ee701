//! The descriptor registry: an arena of class shapes keyed by name.
//!
//! Descriptors are registered once per process (typically at startup) and
//! looked up by the engine on every save/load/diff. The registry also owns
//! the supertype linearization that orders a class's inheritance stack.

use indexmap::IndexMap;

use crate::descriptor::{ClassDef, PropertyDef};
use crate::error::CoreError;

/// Arena of registered class descriptors, keyed by class name.
///
/// Insertion order is preserved; the linearization of a class's supertype
/// DAG is deterministic given registration order.
#[derive(Debug, Clone, Default)]
pub struct TypeRegistry {
    classes: IndexMap<String, ClassDef>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        TypeRegistry {
            classes: IndexMap::new(),
        }
    }

    /// Registers a descriptor. Supertypes may be registered in any order;
    /// they are resolved lazily when a chain is built.
    pub fn register(&mut self, def: ClassDef) -> Result<(), CoreError> {
        if self.classes.contains_key(&def.name) {
            return Err(CoreError::DuplicateClass(def.name));
        }
        self.classes.insert(def.name.clone(), def);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<&ClassDef, CoreError> {
        self.classes
            .get(name)
            .ok_or_else(|| CoreError::UnknownClass(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.classes.contains_key(name)
    }

    pub fn is_interface(&self, name: &str) -> bool {
        self.classes.get(name).map_or(false, ClassDef::is_interface)
    }

    /// Iterates all registered descriptors in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &ClassDef> {
        self.classes.values()
    }

    /// The supertype chain of `name`, most general supertype first, `name`
    /// itself last. Every supertype precedes its subtypes; duplicates from
    /// diamond-shaped interface graphs appear once.
    pub fn supertype_chain(&self, name: &str) -> Result<Vec<String>, CoreError> {
        let mut chain = Vec::new();
        let mut visiting = Vec::new();
        self.collect_chain(name, &mut chain, &mut visiting)?;
        Ok(chain)
    }

    /// All supertypes of `name`, excluding `name` itself.
    pub fn supertypes(&self, name: &str) -> Result<Vec<String>, CoreError> {
        let mut chain = self.supertype_chain(name)?;
        chain.pop();
        Ok(chain)
    }

    /// True when `sub` is `sup` or transitively extends/implements it.
    pub fn is_subtype(&self, sub: &str, sup: &str) -> bool {
        if sub == sup {
            return true;
        }
        self.supertype_chain(sub)
            .map_or(false, |chain| chain.iter().any(|c| c == sup))
    }

    /// Looks up the declared property `property` anywhere in the chain of
    /// `class`, together with the chain class that declares it.
    pub fn find_property(
        &self,
        class: &str,
        property: &str,
    ) -> Result<(String, PropertyDef), CoreError> {
        for level in self.supertype_chain(class)? {
            let def = self.get(&level)?;
            if let Some(prop) = def.properties.iter().find(|p| p.name == property) {
                return Ok((level, prop.clone()));
            }
        }
        Err(CoreError::UnknownProperty {
            class: class.to_string(),
            property: property.to_string(),
        })
    }

    fn collect_chain(
        &self,
        name: &str,
        chain: &mut Vec<String>,
        visiting: &mut Vec<String>,
    ) -> Result<(), CoreError> {
        if visiting.iter().any(|v| v == name) {
            return Err(CoreError::CyclicHierarchy(name.to_string()));
        }
        let def = self.get(name)?;
        visiting.push(name.to_string());
        if let Some(parent) = &def.parent {
            self.collect_chain(parent, chain, visiting)?;
        }
        for interface in &def.interfaces {
            self.collect_chain(interface, chain, visiting)?;
        }
        visiting.pop();
        if !chain.iter().any(|c| c == name) {
            chain.push(name.to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::PropertyDef;
    use crate::types::SemanticType;

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
    fn chain_is_most_general_first() {
        let reg = registry();
        let chain = reg.supertype_chain("ColoredShape").unwrap();
        assert_eq!(chain, vec!["Shape", "Drawable", "ColoredShape"]);
    }

    #[test]
    fn chain_of_root_is_itself() {
        let reg = registry();
        assert_eq!(reg.supertype_chain("Shape").unwrap(), vec!["Shape"]);
    }

    #[test]
    fn diamond_appears_once() {
        let mut reg = TypeRegistry::new();
        reg.register(ClassDef::interface("Base")).unwrap();
        reg.register(ClassDef::interface("Left").implements("Base"))
            .unwrap();
        reg.register(ClassDef::interface("Right").implements("Base"))
            .unwrap();
        reg.register(
            ClassDef::new("Leaf").implements("Left").implements("Right"),
        )
        .unwrap();

        let chain = reg.supertype_chain("Leaf").unwrap();
        assert_eq!(chain, vec!["Base", "Left", "Right", "Leaf"]);
    }

    #[test]
    fn cyclic_hierarchy_is_an_error() {
        let mut reg = TypeRegistry::new();
        reg.register(ClassDef::new("A").extends("B")).unwrap();
        reg.register(ClassDef::new("B").extends("A")).unwrap();
        assert!(matches!(
            reg.supertype_chain("A"),
            Err(CoreError::CyclicHierarchy(_))
        ));
    }

    #[test]
    fn subtype_checks() {
        let reg = registry();
        assert!(reg.is_subtype("ColoredShape", "Shape"));
        assert!(reg.is_subtype("ColoredShape", "Drawable"));
        assert!(reg.is_subtype("Shape", "Shape"));
        assert!(!reg.is_subtype("Shape", "ColoredShape"));
    }

    #[test]
    fn find_property_walks_the_chain() {
        let reg = registry();
        let (level, prop) = reg.find_property("ColoredShape", "color").unwrap();
        assert_eq!(level, "Shape");
        assert_eq!(prop.ty, SemanticType::Text);

        assert!(reg.find_property("ColoredShape", "missing").is_err());
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut reg = registry();
        assert!(matches!(
            reg.register(ClassDef::new("Shape")),
            Err(CoreError::DuplicateClass(_))
        ));
    }
}
