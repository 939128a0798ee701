//! The type-compatibility oracle.
//!
//! A pure predicate deciding whether a column can be converted from one
//! declared type to another without loss. The schema migrator consults it
//! before every type change; a `false` answer means the old column is
//! dropped and the new one starts empty (documented data loss, not an
//! error).

use strata_core::{SemanticType, TypeRegistry};

/// Answers whether converting a column from `old` to `new` preserves data.
pub struct TypeCompatibilityOracle<'a> {
    registry: &'a TypeRegistry,
}

impl<'a> TypeCompatibilityOracle<'a> {
    pub fn new(registry: &'a TypeRegistry) -> Self {
        TypeCompatibilityOracle { registry }
    }

    /// True when every value of `old` survives as a value of `new`.
    pub fn calculate(&self, old: &SemanticType, new: &SemanticType) -> bool {
        // Identical declarations are always a no-op.
        if old == new {
            return true;
        }
        // Arrays never convert to anything else.
        if old.is_array() || new.is_array() {
            return false;
        }
        // Integer widening: strictly increasing bit width only.
        if let (Some(old_bits), Some(new_bits)) = (old.int_bits(), new.int_bits()) {
            return new_bits > old_bits;
        }
        // Float widening: only up to F64. Mixed int/float never converts,
        // which the two arms above and below enforce together.
        if old.is_float() || new.is_float() {
            return *old == SemanticType::F32 && *new == SemanticType::F64;
        }
        // Direct large-object/date-like types: only the Date/Time ->
        // Timestamp path survives.
        if old.is_direct() || new.is_direct() {
            return matches!(old, SemanticType::Date | SemanticType::Time)
                && *new == SemanticType::Timestamp;
        }
        // Enums flatten to text; text never becomes an enum.
        if let SemanticType::Enum(_) = old {
            return *new == SemanticType::Text;
        }
        // Reference-to-reference: allowed when the classes are related or
        // either side is an interface.
        if let (SemanticType::Ref(old_class), SemanticType::Ref(new_class)) = (old, new) {
            return self.registry.is_subtype(old_class, new_class)
                || self.registry.is_subtype(new_class, old_class)
                || self.registry.is_interface(old_class)
                || self.registry.is_interface(new_class);
        }
        // Everything else -- scalar vs. reference, bool vs. int, text vs.
        // numeric -- loses data.
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::ClassDef;

    fn registry() -> TypeRegistry {
        let mut reg = TypeRegistry::new();
        reg.register(ClassDef::interface("Drawable")).unwrap();
        reg.register(ClassDef::new("Shape")).unwrap();
        reg.register(ClassDef::new("ColoredShape").extends("Shape"))
            .unwrap();
        reg.register(ClassDef::new("Unrelated")).unwrap();
        reg
    }

    #[test]
    fn identity_is_always_compatible() {
        let reg = registry();
        let oracle = TypeCompatibilityOracle::new(&reg);
        for ty in [
            SemanticType::Bool,
            SemanticType::I32,
            SemanticType::F64,
            SemanticType::Text,
            SemanticType::Timestamp,
            SemanticType::Enum("Color".into()),
            SemanticType::reference("Shape"),
            SemanticType::array(SemanticType::I32),
        ] {
            assert!(oracle.calculate(&ty, &ty), "{ty:?}");
        }
    }

    #[test]
    fn integer_widening_is_one_way() {
        let reg = registry();
        let oracle = TypeCompatibilityOracle::new(&reg);
        assert!(oracle.calculate(&SemanticType::I32, &SemanticType::I64));
        assert!(oracle.calculate(&SemanticType::I8, &SemanticType::I16));
        assert!(!oracle.calculate(&SemanticType::I64, &SemanticType::I32));
        assert!(!oracle.calculate(&SemanticType::I16, &SemanticType::I8));
    }

    #[test]
    fn float_widening_is_one_way() {
        let reg = registry();
        let oracle = TypeCompatibilityOracle::new(&reg);
        assert!(oracle.calculate(&SemanticType::F32, &SemanticType::F64));
        assert!(!oracle.calculate(&SemanticType::F64, &SemanticType::F32));
    }

    #[test]
    fn mixed_int_float_never_converts() {
        let reg = registry();
        let oracle = TypeCompatibilityOracle::new(&reg);
        assert!(!oracle.calculate(&SemanticType::I32, &SemanticType::F64));
        assert!(!oracle.calculate(&SemanticType::F32, &SemanticType::I64));
    }

    #[test]
    fn date_and_time_widen_to_timestamp_only() {
        let reg = registry();
        let oracle = TypeCompatibilityOracle::new(&reg);
        assert!(oracle.calculate(&SemanticType::Date, &SemanticType::Timestamp));
        assert!(oracle.calculate(&SemanticType::Time, &SemanticType::Timestamp));
        assert!(!oracle.calculate(&SemanticType::Timestamp, &SemanticType::Date));
        assert!(!oracle.calculate(&SemanticType::LongText, &SemanticType::Text));
        assert!(!oracle.calculate(&SemanticType::Text, &SemanticType::LongText));
        assert!(!oracle.calculate(&SemanticType::Bytes, &SemanticType::LongText));
    }

    #[test]
    fn enum_to_text_is_one_way() {
        let reg = registry();
        let oracle = TypeCompatibilityOracle::new(&reg);
        let color = SemanticType::Enum("Color".into());
        assert!(oracle.calculate(&color, &SemanticType::Text));
        assert!(!oracle.calculate(&SemanticType::Text, &color));
        // Distinct enums are not interchangeable.
        assert!(!oracle.calculate(&color, &SemanticType::Enum("Size".into())));
    }

    #[test]
    fn arrays_never_convert() {
        let reg = registry();
        let oracle = TypeCompatibilityOracle::new(&reg);
        let ints = SemanticType::array(SemanticType::I32);
        assert!(!oracle.calculate(&ints, &SemanticType::array(SemanticType::I64)));
        assert!(!oracle.calculate(&ints, &SemanticType::I32));
        assert!(!oracle.calculate(&SemanticType::I32, &ints));
    }

    #[test]
    fn scalar_and_reference_never_convert() {
        let reg = registry();
        let oracle = TypeCompatibilityOracle::new(&reg);
        let shape = SemanticType::reference("Shape");
        assert!(!oracle.calculate(&SemanticType::I64, &shape));
        assert!(!oracle.calculate(&shape, &SemanticType::I64));
    }

    #[test]
    fn related_references_convert_both_ways() {
        let reg = registry();
        let oracle = TypeCompatibilityOracle::new(&reg);
        let shape = SemanticType::reference("Shape");
        let colored = SemanticType::reference("ColoredShape");
        let unrelated = SemanticType::reference("Unrelated");
        let drawable = SemanticType::reference("Drawable");

        assert!(oracle.calculate(&colored, &shape));
        assert!(oracle.calculate(&shape, &colored));
        assert!(!oracle.calculate(&shape, &unrelated));
        // An interface on either side is accepted.
        assert!(oracle.calculate(&unrelated, &drawable));
        assert!(oracle.calculate(&drawable, &unrelated));
    }
}
