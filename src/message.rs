//! Schema-driven message instances.
//!
//! A [`DynamicMessage`] keeps only non-default values, keyed by tag number.
//! Setting a field to its zero value removes it, so "explicitly set to the
//! default" and "never set" are the same state and compare equal.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::schema::{FieldDescriptor, MessageDescriptor};

/// Runtime value of a single field.
///
/// Floats compare by bit pattern, so a NaN equals itself and `-0.0` differs
/// from `0.0`, matching what the wire carries.
#[derive(Debug, Clone)]
pub enum Value {
    Bool(bool),
    I32(i32),
    I64(i64),
    U32(u32),
    U64(u64),
    F32(f32),
    F64(f64),
    String(String),
    Bytes(Vec<u8>),
    Message(Box<DynamicMessage>),
}

impl Value {
    /// Name of the runtime kind, used in mismatch errors.
    pub fn kind_name(&self) -> String {
        match self {
            Value::Bool(_) => "bool".into(),
            Value::I32(_) => "i32".into(),
            Value::I64(_) => "i64".into(),
            Value::U32(_) => "u32".into(),
            Value::U64(_) => "u64".into(),
            Value::F32(_) => "f32".into(),
            Value::F64(_) => "f64".into(),
            Value::String(_) => "string".into(),
            Value::Bytes(_) => "bytes".into(),
            Value::Message(m) => format!("message {}", m.descriptor().full_name()),
        }
    }

    /// True for the proto3 zero value of the kind. `-0.0` is not a default.
    pub fn is_default(&self) -> bool {
        match self {
            Value::Bool(v) => !v,
            Value::I32(v) => *v == 0,
            Value::I64(v) => *v == 0,
            Value::U32(v) => *v == 0,
            Value::U64(v) => *v == 0,
            Value::F32(v) => v.to_bits() == 0,
            Value::F64(v) => v.to_bits() == 0,
            Value::String(v) => v.is_empty(),
            Value::Bytes(v) => v.is_empty(),
            Value::Message(m) => m.is_empty(),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Value::I32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::I64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        match self {
            Value::U32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::U64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f32(&self) -> Option<f32> {
        match self {
            Value::F32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::F64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_message(&self) -> Option<&DynamicMessage> {
        match self {
            Value::Message(m) => Some(m),
            _ => None,
        }
    }
}

macro_rules! impl_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(v: $ty) -> Self {
                    Value::$variant(v)
                }
            }
        )*
    };
}

impl_from! {
    bool => Bool,
    i32 => I32,
    i64 => I64,
    u32 => U32,
    u64 => U64,
    f32 => F32,
    f64 => F64,
    String => String,
    Vec<u8> => Bytes,
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_owned())
    }
}

impl From<&[u8]> for Value {
    fn from(v: &[u8]) -> Self {
        Value::Bytes(v.to_vec())
    }
}

impl From<DynamicMessage> for Value {
    fn from(v: DynamicMessage) -> Self {
        Value::Message(Box::new(v))
    }
}

/// A message instance bound to its descriptor.
///
/// Not synchronized: an instance belongs to one request or one response.
#[derive(Clone)]
pub struct DynamicMessage {
    descriptor: Arc<MessageDescriptor>,
    values: BTreeMap<u32, Value>,
}

impl DynamicMessage {
    /// New instance with every field at its default.
    pub fn new(descriptor: Arc<MessageDescriptor>) -> Self {
        Self {
            descriptor,
            values: BTreeMap::new(),
        }
    }

    /// Builder-style [`set`](Self::set).
    pub fn with(mut self, field: &str, value: impl Into<Value>) -> Result<Self> {
        self.set(field, value)?;
        Ok(self)
    }

    pub fn descriptor(&self) -> &Arc<MessageDescriptor> {
        &self.descriptor
    }

    /// Current value of `field`, or its zero value if unset.
    pub fn get(&self, field: &str) -> Result<Value> {
        let desc = self.field(field)?;
        Ok(self
            .values
            .get(&desc.tag())
            .cloned()
            .unwrap_or_else(|| desc.default_value()))
    }

    pub fn set(&mut self, field: &str, value: impl Into<Value>) -> Result<()> {
        let desc = self.field(field)?;
        let tag = desc.tag();
        let value = value.into();
        if !desc.accepts(&value) {
            return Err(Error::TypeMismatch {
                field: desc.full_name().to_owned(),
                expected: desc.field_type().to_string(),
                found: value.kind_name(),
            });
        }
        self.store(tag, value);
        Ok(())
    }

    /// Reset `field` to its default.
    pub fn clear(&mut self, field: &str) -> Result<()> {
        let tag = self.field(field)?.tag();
        self.values.remove(&tag);
        Ok(())
    }

    /// True when no field holds a non-default value.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Fields holding non-default values, in ascending tag order.
    pub fn set_fields(&self) -> impl Iterator<Item = (&FieldDescriptor, &Value)> {
        self.values.iter().filter_map(|(tag, value)| {
            self.descriptor
                .field_by_tag(*tag)
                .map(|field| (field, value))
        })
    }

    /// Remove and return the stored value for `tag`.
    pub(crate) fn take(&mut self, tag: u32) -> Option<Value> {
        self.values.remove(&tag)
    }

    /// Store a value already checked against the field's declared kind.
    pub(crate) fn store(&mut self, tag: u32, value: Value) {
        if value.is_default() {
            self.values.remove(&tag);
        } else {
            self.values.insert(tag, value);
        }
    }

    fn field(&self, name: &str) -> Result<&FieldDescriptor> {
        self.descriptor
            .field(name)
            .ok_or_else(|| Error::UnknownField {
                message: self.descriptor.full_name().to_owned(),
                field: name.to_owned(),
            })
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::I32(a), Value::I32(b)) => a == b,
            (Value::I64(a), Value::I64(b)) => a == b,
            (Value::U32(a), Value::U32(b)) => a == b,
            (Value::U64(a), Value::U64(b)) => a == b,
            (Value::F32(a), Value::F32(b)) => a.to_bits() == b.to_bits(),
            (Value::F64(a), Value::F64(b)) => a.to_bits() == b.to_bits(),
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::Message(a), Value::Message(b)) => a == b,
            _ => false,
        }
    }
}

impl PartialEq for DynamicMessage {
    /// Same descriptor and same effective values.
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.descriptor, &other.descriptor) && self.values == other.values
    }
}

impl fmt::Debug for DynamicMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct(self.descriptor.full_name());
        for (field, value) in self.set_fields() {
            s.field(field.name(), value);
        }
        s.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FieldDef, FieldType, SchemaRegistry};

    fn registry() -> SchemaRegistry {
        let mut registry = SchemaRegistry::new();
        registry
            .define_message(
                "test.Scalars",
                [
                    FieldDef::string("name", 1),
                    FieldDef::bool("flag", 2),
                    FieldDef::new("count", 3, FieldType::Int32),
                    FieldDef::new("total", 4, FieldType::Uint64),
                    FieldDef::new("ratio", 5, FieldType::Double),
                    FieldDef::new("blob", 6, FieldType::Bytes),
                    FieldDef::new("delta", 7, FieldType::Sint64),
                ],
            )
            .unwrap();
        registry
            .define_message(
                "test.Wrapper",
                [FieldDef::message("inner", 1, "test.Scalars")],
            )
            .unwrap();
        registry
    }

    #[test]
    fn test_new_instance_reads_defaults() {
        let registry = registry();
        let msg = DynamicMessage::new(registry.message("test.Scalars").unwrap());

        assert_eq!(msg.get("name").unwrap(), Value::String(String::new()));
        assert_eq!(msg.get("flag").unwrap(), Value::Bool(false));
        assert_eq!(msg.get("count").unwrap(), Value::I32(0));
        assert_eq!(msg.get("total").unwrap(), Value::U64(0));
        assert_eq!(msg.get("ratio").unwrap(), Value::F64(0.0));
        assert_eq!(msg.get("blob").unwrap(), Value::Bytes(Vec::new()));
        assert_eq!(msg.get("delta").unwrap(), Value::I64(0));
        assert!(msg.is_empty());
    }

    #[test]
    fn test_set_then_get() {
        let registry = registry();
        let mut msg = DynamicMessage::new(registry.message("test.Scalars").unwrap());
        msg.set("name", "foo").unwrap();
        msg.set("count", -3).unwrap();
        msg.set("delta", -9_i64).unwrap();

        assert_eq!(msg.get("name").unwrap().as_str(), Some("foo"));
        assert_eq!(msg.get("count").unwrap().as_i32(), Some(-3));
        assert_eq!(msg.get("delta").unwrap().as_i64(), Some(-9));
    }

    #[test]
    fn test_unknown_field() {
        let registry = registry();
        let mut msg = DynamicMessage::new(registry.message("test.Scalars").unwrap());
        assert!(matches!(
            msg.get("missing"),
            Err(Error::UnknownField { ref field, .. }) if field == "missing"
        ));
        assert!(matches!(msg.set("missing", true), Err(Error::UnknownField { .. })));
        assert!(matches!(msg.clear("missing"), Err(Error::UnknownField { .. })));
    }

    #[test]
    fn test_type_mismatch_leaves_value_untouched() {
        let registry = registry();
        let mut msg = DynamicMessage::new(registry.message("test.Scalars").unwrap());
        msg.set("name", "kept").unwrap();

        let err = msg.set("name", true).unwrap_err();
        assert!(matches!(
            err,
            Error::TypeMismatch { ref field, ref expected, ref found }
                if field == "test.Scalars.name" && expected == "string" && found == "bool"
        ));
        assert!(matches!(msg.set("count", 5_i64), Err(Error::TypeMismatch { .. })));
        assert_eq!(msg.get("name").unwrap().as_str(), Some("kept"));
    }

    #[test]
    fn test_explicit_default_equals_unset() {
        let registry = registry();
        let desc = registry.message("test.Scalars").unwrap();
        let unset = DynamicMessage::new(desc.clone());
        let mut explicit = DynamicMessage::new(desc);
        explicit.set("name", "").unwrap();
        explicit.set("flag", false).unwrap();
        explicit.set("count", 0).unwrap();

        assert_eq!(unset, explicit);
        assert!(explicit.is_empty());
    }

    #[test]
    fn test_equality_requires_same_descriptor() {
        let registry = registry();
        let mut other = SchemaRegistry::new();
        other
            .define_message("test.Scalars", [FieldDef::string("name", 1)])
            .unwrap();

        let a = DynamicMessage::new(registry.message("test.Scalars").unwrap());
        let b = DynamicMessage::new(other.message("test.Scalars").unwrap());
        assert_ne!(a, b);
    }

    #[test]
    fn test_clear_resets_field() {
        let registry = registry();
        let mut msg = DynamicMessage::new(registry.message("test.Scalars").unwrap())
            .with("flag", true)
            .unwrap();
        assert!(!msg.is_empty());
        msg.clear("flag").unwrap();
        assert_eq!(msg.get("flag").unwrap(), Value::Bool(false));
        assert!(msg.is_empty());
    }

    #[test]
    fn test_instances_do_not_alias() {
        let registry = registry();
        let original = DynamicMessage::new(registry.message("test.Scalars").unwrap())
            .with("name", "a")
            .unwrap();
        let mut copy = original.clone();
        copy.set("name", "b").unwrap();
        assert_eq!(original.get("name").unwrap().as_str(), Some("a"));
        assert_eq!(copy.get("name").unwrap().as_str(), Some("b"));
    }

    #[test]
    fn test_set_fields_in_tag_order() {
        let registry = registry();
        let msg = DynamicMessage::new(registry.message("test.Scalars").unwrap())
            .with("delta", 1_i64)
            .unwrap()
            .with("name", "x")
            .unwrap();
        let tags: Vec<_> = msg.set_fields().map(|(f, _)| f.tag()).collect();
        assert_eq!(tags, [1, 7]);
        assert_eq!(format!("{msg:?}"), r#"test.Scalars { name: String("x"), delta: I64(1) }"#);
    }

    #[test]
    fn test_embedded_message_field() {
        let registry = registry();
        let scalars = registry.message("test.Scalars").unwrap();
        let mut wrapper = DynamicMessage::new(registry.message("test.Wrapper").unwrap());

        let inner = wrapper.get("inner").unwrap();
        assert!(inner.as_message().unwrap().is_empty());
        assert!(Arc::ptr_eq(inner.as_message().unwrap().descriptor(), &scalars));

        let filled = DynamicMessage::new(scalars).with("flag", true).unwrap();
        wrapper.set("inner", filled.clone()).unwrap();
        assert_eq!(wrapper.get("inner").unwrap().as_message(), Some(&filled));

        let wrong = DynamicMessage::new(registry.message("test.Wrapper").unwrap());
        assert!(matches!(wrapper.set("inner", wrong), Err(Error::TypeMismatch { .. })));
    }

    #[test]
    fn test_negative_zero_is_not_default() {
        assert!(Value::F64(0.0).is_default());
        assert!(!Value::F64(-0.0).is_default());
        assert!(!Value::F32(f32::NAN).is_default());
    }

    #[test]
    fn test_floats_compare_by_bits() {
        let registry = registry();
        let desc = registry.message("test.Scalars").unwrap();

        let nan = DynamicMessage::new(desc.clone()).with("ratio", f64::NAN).unwrap();
        assert_eq!(nan, nan.clone());

        let neg_zero = DynamicMessage::new(desc.clone()).with("ratio", -0.0_f64).unwrap();
        assert_ne!(neg_zero, DynamicMessage::new(desc));
        assert_ne!(Value::F32(0.0), Value::F32(-0.0));
        assert_eq!(Value::F32(f32::NAN), Value::F32(f32::NAN));
    }
}
