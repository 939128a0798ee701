//! The strata semantic type system and runtime values.
//!
//! [`SemanticType`] names the persisted type of a property independently of
//! any backend column type: scalars (Bool, I8-I64, F32, F64), text and binary
//! payloads, date-like types, named enums, references to persisted classes,
//! and (possibly nested) arrays. [`Value`] is the matching runtime
//! representation carried by objects in an [`ObjectSpace`](crate::object::ObjectSpace).
//!
//! Types round-trip through a compact textual key (`storage_key` /
//! `parse_key`) so that the storage engine can record a column's declared
//! type in its catalog and reconstruct it later.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::object::Handle;

/// The persisted type of a property.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SemanticType {
    Bool,
    I8,
    I16,
    I32,
    I64,
    F32,
    F64,

    /// Short text, indexed by default.
    Text,
    /// Large text payload, stored through the dialect's large-text column.
    LongText,
    /// Binary payload.
    Bytes,

    /// Calendar date, stored as epoch days.
    Date,
    /// Time of day, stored as milliseconds since midnight.
    Time,
    /// Instant, stored as epoch milliseconds.
    Timestamp,

    /// Named enum; persisted as the variant name.
    Enum(String),

    /// Reference to a persisted class or interface.
    Ref(String),

    /// Array of a component type; nests for multidimensional arrays.
    Array(Box<SemanticType>),
}

impl SemanticType {
    /// Convenience constructor for array types.
    pub fn array(component: SemanticType) -> Self {
        SemanticType::Array(Box::new(component))
    }

    /// Convenience constructor for reference types.
    pub fn reference(class: &str) -> Self {
        SemanticType::Ref(class.to_string())
    }

    pub fn is_reference(&self) -> bool {
        matches!(self, SemanticType::Ref(_))
    }

    pub fn is_array(&self) -> bool {
        matches!(self, SemanticType::Array(_))
    }

    /// Scalar/primitive-like types: numerics, bool, and short text.
    pub fn is_scalar(&self) -> bool {
        matches!(
            self,
            SemanticType::Bool
                | SemanticType::I8
                | SemanticType::I16
                | SemanticType::I32
                | SemanticType::I64
                | SemanticType::F32
                | SemanticType::F64
                | SemanticType::Text
        )
    }

    /// "Direct" types: large-object and date-like payloads that only ever
    /// convert along the Date/Time -> Timestamp path.
    pub fn is_direct(&self) -> bool {
        matches!(
            self,
            SemanticType::LongText
                | SemanticType::Bytes
                | SemanticType::Date
                | SemanticType::Time
                | SemanticType::Timestamp
        )
    }

    /// Bit width for integer types, `None` otherwise.
    pub fn int_bits(&self) -> Option<u8> {
        match self {
            SemanticType::I8 => Some(8),
            SemanticType::I16 => Some(16),
            SemanticType::I32 => Some(32),
            SemanticType::I64 => Some(64),
            _ => None,
        }
    }

    pub fn is_float(&self) -> bool {
        matches!(self, SemanticType::F32 | SemanticType::F64)
    }

    /// Compact textual key for the storage catalog.
    ///
    /// Structured kinds carry their payload after a colon; arrays nest:
    /// `array:array:i32`.
    pub fn storage_key(&self) -> String {
        match self {
            SemanticType::Bool => "bool".into(),
            SemanticType::I8 => "i8".into(),
            SemanticType::I16 => "i16".into(),
            SemanticType::I32 => "i32".into(),
            SemanticType::I64 => "i64".into(),
            SemanticType::F32 => "f32".into(),
            SemanticType::F64 => "f64".into(),
            SemanticType::Text => "text".into(),
            SemanticType::LongText => "longtext".into(),
            SemanticType::Bytes => "bytes".into(),
            SemanticType::Date => "date".into(),
            SemanticType::Time => "time".into(),
            SemanticType::Timestamp => "timestamp".into(),
            SemanticType::Enum(name) => format!("enum:{name}"),
            SemanticType::Ref(class) => format!("ref:{class}"),
            SemanticType::Array(component) => format!("array:{}", component.storage_key()),
        }
    }

    /// Parses a key produced by [`storage_key`](Self::storage_key).
    pub fn parse_key(key: &str) -> Result<SemanticType, CoreError> {
        let ty = match key {
            "bool" => SemanticType::Bool,
            "i8" => SemanticType::I8,
            "i16" => SemanticType::I16,
            "i32" => SemanticType::I32,
            "i64" => SemanticType::I64,
            "f32" => SemanticType::F32,
            "f64" => SemanticType::F64,
            "text" => SemanticType::Text,
            "longtext" => SemanticType::LongText,
            "bytes" => SemanticType::Bytes,
            "date" => SemanticType::Date,
            "time" => SemanticType::Time,
            "timestamp" => SemanticType::Timestamp,
            _ => {
                if let Some(name) = key.strip_prefix("enum:") {
                    SemanticType::Enum(name.to_string())
                } else if let Some(class) = key.strip_prefix("ref:") {
                    SemanticType::Ref(class.to_string())
                } else if let Some(inner) = key.strip_prefix("array:") {
                    SemanticType::array(SemanticType::parse_key(inner)?)
                } else {
                    return Err(CoreError::MalformedTypeKey(key.to_string()));
                }
            }
        };
        Ok(ty)
    }
}

/// An array value: a declared component type plus its elements in order.
///
/// Elements of an `Array(Array(..))` type are themselves `Value::Array`,
/// which is how multidimensional arrays nest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArrayValue {
    pub component: SemanticType,
    pub elements: Vec<Value>,
}

impl ArrayValue {
    pub fn new(component: SemanticType, elements: Vec<Value>) -> Self {
        ArrayValue {
            component,
            elements,
        }
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }
}

/// A runtime value held by an object property.
///
/// References are arena handles, not nested values -- an object graph with
/// cycles is a set of [`ObjectInstance`](crate::object::ObjectInstance)s
/// pointing at each other through `Value::Ref`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    Text(String),
    LongText(String),
    Bytes(Vec<u8>),
    /// Epoch days.
    Date(i64),
    /// Milliseconds since midnight.
    Time(i64),
    /// Epoch milliseconds.
    Timestamp(i64),
    /// Named enum variant.
    Enum { ty: String, variant: String },
    Ref(Handle),
    Array(ArrayValue),
}

impl Value {
    pub fn text(s: &str) -> Self {
        Value::Text(s.to_string())
    }

    pub fn long_text(s: &str) -> Self {
        Value::LongText(s.to_string())
    }

    pub fn enumeration(ty: &str, variant: &str) -> Self {
        Value::Enum {
            ty: ty.to_string(),
            variant: variant.to_string(),
        }
    }

    pub fn array(component: SemanticType, elements: Vec<Value>) -> Self {
        Value::Array(ArrayValue::new(component, elements))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// The referenced handle, if this is a non-null reference.
    pub fn as_handle(&self) -> Option<Handle> {
        match self {
            Value::Ref(h) => Some(*h),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_key_roundtrip_all_kinds() {
        let types = vec![
            SemanticType::Bool,
            SemanticType::I8,
            SemanticType::I16,
            SemanticType::I32,
            SemanticType::I64,
            SemanticType::F32,
            SemanticType::F64,
            SemanticType::Text,
            SemanticType::LongText,
            SemanticType::Bytes,
            SemanticType::Date,
            SemanticType::Time,
            SemanticType::Timestamp,
            SemanticType::Enum("Color".into()),
            SemanticType::reference("Shape"),
            SemanticType::array(SemanticType::I32),
            SemanticType::array(SemanticType::array(SemanticType::reference("Shape"))),
        ];
        for ty in types {
            let key = ty.storage_key();
            let back = SemanticType::parse_key(&key).unwrap();
            assert_eq!(ty, back, "key {key}");
        }
    }

    #[test]
    fn malformed_key_is_rejected() {
        assert!(SemanticType::parse_key("no-such-type").is_err());
        assert!(SemanticType::parse_key("array:no-such-type").is_err());
    }

    #[test]
    fn int_bits() {
        assert_eq!(SemanticType::I8.int_bits(), Some(8));
        assert_eq!(SemanticType::I64.int_bits(), Some(64));
        assert_eq!(SemanticType::F32.int_bits(), None);
        assert_eq!(SemanticType::Text.int_bits(), None);
    }

    #[test]
    fn direct_and_scalar_are_disjoint() {
        for ty in [
            SemanticType::LongText,
            SemanticType::Bytes,
            SemanticType::Date,
            SemanticType::Time,
            SemanticType::Timestamp,
        ] {
            assert!(ty.is_direct());
            assert!(!ty.is_scalar());
        }
        assert!(SemanticType::Text.is_scalar());
        assert!(!SemanticType::Text.is_direct());
    }

    #[test]
    fn serde_roundtrip() {
        let v = Value::array(
            SemanticType::I32,
            vec![Value::I32(1), Value::Null, Value::I32(3)],
        );
        let json = serde_json::to_string(&v).unwrap();
        let back: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(v, back);
    }
}
