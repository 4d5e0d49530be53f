//! Schema model: field, message, method and service descriptors, and the
//! registry that owns them.
//!
//! A [`SchemaRegistry`] is filled once at startup through
//! [`SchemaRegistry::define_message`] and [`SchemaRegistry::define_service`],
//! then shared read-only. Descriptors are handed out as `Arc`s so the codec and
//! the stubs can hold on to them without borrowing the registry.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::error::{Error, Result};
use crate::message::{DynamicMessage, Value};

/// Largest tag number representable in a field key.
pub const MAX_TAG: u32 = (1 << 29) - 1;

/// Tag range reserved for the protocol implementation.
pub const RESERVED_TAGS: std::ops::RangeInclusive<u32> = 19_000..=19_999;

/// Encoding category carried in the low three bits of a field key.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WireType {
    Varint = 0,
    Fixed64 = 1,
    LengthDelimited = 2,
    Fixed32 = 5,
}

impl WireType {
    #[inline]
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Varint),
            1 => Some(Self::Fixed64),
            2 => Some(Self::LengthDelimited),
            5 => Some(Self::Fixed32),
            _ => None,
        }
    }
}

/// Declared value kind of a field.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FieldType {
    String,
    Bytes,
    Bool,
    Int32,
    Int64,
    Uint32,
    Uint64,
    /// ZigZag-encoded `i32`
    Sint32,
    /// ZigZag-encoded `i64`
    Sint64,
    Fixed32,
    Fixed64,
    Sfixed32,
    Sfixed64,
    Float,
    Double,
    /// Embedded message, by fully-qualified name
    Message(String),
}

impl FieldType {
    /// Wire type implied by this kind.
    pub fn wire_type(&self) -> WireType {
        match self {
            FieldType::String | FieldType::Bytes | FieldType::Message(_) => {
                WireType::LengthDelimited
            }
            FieldType::Bool
            | FieldType::Int32
            | FieldType::Int64
            | FieldType::Uint32
            | FieldType::Uint64
            | FieldType::Sint32
            | FieldType::Sint64 => WireType::Varint,
            FieldType::Fixed32 | FieldType::Sfixed32 | FieldType::Float => WireType::Fixed32,
            FieldType::Fixed64 | FieldType::Sfixed64 | FieldType::Double => WireType::Fixed64,
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FieldType::String => "string",
            FieldType::Bytes => "bytes",
            FieldType::Bool => "bool",
            FieldType::Int32 => "int32",
            FieldType::Int64 => "int64",
            FieldType::Uint32 => "uint32",
            FieldType::Uint64 => "uint64",
            FieldType::Sint32 => "sint32",
            FieldType::Sint64 => "sint64",
            FieldType::Fixed32 => "fixed32",
            FieldType::Fixed64 => "fixed64",
            FieldType::Sfixed32 => "sfixed32",
            FieldType::Sfixed64 => "sfixed64",
            FieldType::Float => "float",
            FieldType::Double => "double",
            FieldType::Message(name) => return write!(f, "message {name}"),
        };
        f.write_str(name)
    }
}

/// Field declaration as written by the schema author.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDef {
    pub name: String,
    pub tag: u32,
    pub field_type: FieldType,
}

impl FieldDef {
    pub fn new(name: impl Into<String>, tag: u32, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            tag,
            field_type,
        }
    }

    pub fn string(name: impl Into<String>, tag: u32) -> Self {
        Self::new(name, tag, FieldType::String)
    }

    pub fn bool(name: impl Into<String>, tag: u32) -> Self {
        Self::new(name, tag, FieldType::Bool)
    }

    pub fn message(name: impl Into<String>, tag: u32, type_name: impl Into<String>) -> Self {
        Self::new(name, tag, FieldType::Message(type_name.into()))
    }
}

/// Method declaration: input and output types by fully-qualified name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDef {
    pub name: String,
    pub input_type: String,
    pub output_type: String,
}

impl MethodDef {
    pub fn new(
        name: impl Into<String>,
        input_type: impl Into<String>,
        output_type: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            input_type: input_type.into(),
            output_type: output_type.into(),
        }
    }
}

#[derive(Debug)]
pub struct FieldDescriptor {
    name: String,
    full_name: String,
    index: usize,
    tag: u32,
    field_type: FieldType,
    message_type: Option<Arc<MessageDescriptor>>,
}

impl FieldDescriptor {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// `<message full name>.<field name>`
    pub fn full_name(&self) -> &str {
        &self.full_name
    }

    /// Declaration position within the message.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn tag(&self) -> u32 {
        self.tag
    }

    pub fn field_type(&self) -> &FieldType {
        &self.field_type
    }

    pub fn wire_type(&self) -> WireType {
        self.field_type.wire_type()
    }

    /// Referenced descriptor for embedded message fields.
    pub fn message_type(&self) -> Option<&Arc<MessageDescriptor>> {
        self.message_type.as_ref()
    }

    /// Zero value read back for an unset field.
    pub fn default_value(&self) -> Value {
        match &self.field_type {
            FieldType::String => Value::String(String::new()),
            FieldType::Bytes => Value::Bytes(Vec::new()),
            FieldType::Bool => Value::Bool(false),
            FieldType::Int32 | FieldType::Sint32 | FieldType::Sfixed32 => Value::I32(0),
            FieldType::Int64 | FieldType::Sint64 | FieldType::Sfixed64 => Value::I64(0),
            FieldType::Uint32 | FieldType::Fixed32 => Value::U32(0),
            FieldType::Uint64 | FieldType::Fixed64 => Value::U64(0),
            FieldType::Float => Value::F32(0.0),
            FieldType::Double => Value::F64(0.0),
            FieldType::Message(_) => match &self.message_type {
                Some(desc) => Value::Message(Box::new(DynamicMessage::new(desc.clone()))),
                // Registry resolution guarantees a descriptor for message fields.
                None => Value::Bytes(Vec::new()),
            },
        }
    }

    /// Whether `value` has the runtime shape this field declares.
    pub fn accepts(&self, value: &Value) -> bool {
        match (&self.field_type, value) {
            (FieldType::String, Value::String(_))
            | (FieldType::Bytes, Value::Bytes(_))
            | (FieldType::Bool, Value::Bool(_))
            | (FieldType::Int32 | FieldType::Sint32 | FieldType::Sfixed32, Value::I32(_))
            | (FieldType::Int64 | FieldType::Sint64 | FieldType::Sfixed64, Value::I64(_))
            | (FieldType::Uint32 | FieldType::Fixed32, Value::U32(_))
            | (FieldType::Uint64 | FieldType::Fixed64, Value::U64(_))
            | (FieldType::Float, Value::F32(_))
            | (FieldType::Double, Value::F64(_)) => true,
            (FieldType::Message(_), Value::Message(msg)) => self
                .message_type
                .as_ref()
                .is_some_and(|desc| Arc::ptr_eq(desc, msg.descriptor())),
            _ => false,
        }
    }
}

/// Shape of one message type. Owns its fields.
pub struct MessageDescriptor {
    full_name: String,
    fields: Vec<FieldDescriptor>,
    by_tag: HashMap<u32, usize>,
    by_name: HashMap<String, usize>,
}

impl MessageDescriptor {
    pub fn full_name(&self) -> &str {
        &self.full_name
    }

    pub fn name(&self) -> &str {
        short_name(&self.full_name)
    }

    pub fn package(&self) -> &str {
        package_of(&self.full_name)
    }

    /// Fields in declaration order.
    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.by_name.get(name).map(|&i| &self.fields[i])
    }

    pub fn field_by_tag(&self, tag: u32) -> Option<&FieldDescriptor> {
        self.by_tag.get(&tag).map(|&i| &self.fields[i])
    }
}

impl fmt::Debug for MessageDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageDescriptor")
            .field("full_name", &self.full_name)
            .field("fields", &self.fields)
            .finish()
    }
}

#[derive(Debug)]
pub struct MethodDescriptor {
    name: String,
    full_name: String,
    index: usize,
    input_type: Arc<MessageDescriptor>,
    output_type: Arc<MessageDescriptor>,
}

impl MethodDescriptor {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// `<service full name>.<method name>`, the routing key on the transport.
    pub fn full_name(&self) -> &str {
        &self.full_name
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn input_type(&self) -> &Arc<MessageDescriptor> {
        &self.input_type
    }

    pub fn output_type(&self) -> &Arc<MessageDescriptor> {
        &self.output_type
    }
}

#[derive(Debug)]
pub struct ServiceDescriptor {
    full_name: String,
    methods: Vec<MethodDescriptor>,
}

impl ServiceDescriptor {
    pub fn full_name(&self) -> &str {
        &self.full_name
    }

    pub fn name(&self) -> &str {
        short_name(&self.full_name)
    }

    pub fn package(&self) -> &str {
        package_of(&self.full_name)
    }

    pub fn methods(&self) -> &[MethodDescriptor] {
        &self.methods
    }

    /// Look up a method by its short name (`Get`).
    pub fn method(&self, name: &str) -> Option<&MethodDescriptor> {
        self.methods.iter().find(|m| m.name == name)
    }

    /// Look up a method by its full name (`kv.KV.Get`).
    pub fn method_by_full_name(&self, full_name: &str) -> Option<&MethodDescriptor> {
        self.methods.iter().find(|m| m.full_name == full_name)
    }
}

/// Owner of every message and service descriptor.
///
/// Mutated only while the schema is loaded; afterwards it is read-only and can
/// be shared across threads behind an `Arc` or a plain reference.
#[derive(Debug, Default)]
pub struct SchemaRegistry {
    messages: Vec<Arc<MessageDescriptor>>,
    services: Vec<Arc<ServiceDescriptor>>,
    names: HashMap<String, Entry>,
}

#[derive(Debug, Clone, Copy)]
enum Entry {
    Message(usize),
    Service(usize),
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a message type.
    ///
    /// Tags must lie in `1..=MAX_TAG`, outside [`RESERVED_TAGS`], and be unique
    /// within the message. Embedded message fields must reference a message
    /// that is already registered.
    pub fn define_message<I>(&mut self, name: &str, fields: I) -> Result<Arc<MessageDescriptor>>
    where
        I: IntoIterator<Item = FieldDef>,
    {
        if self.names.contains_key(name) {
            return Err(Error::duplicate("message", name));
        }

        let mut descriptors = Vec::new();
        let mut by_tag = HashMap::new();
        let mut by_name = HashMap::new();

        for (index, def) in fields.into_iter().enumerate() {
            let full_name = format!("{name}.{}", def.name);
            validate_tag(&full_name, def.tag)?;
            if by_tag.insert(def.tag, index).is_some() {
                return Err(Error::InvalidTag {
                    field: full_name,
                    tag: def.tag,
                    reason: "tag already used in this message",
                });
            }
            if by_name.insert(def.name.clone(), index).is_some() {
                return Err(Error::duplicate("field", full_name));
            }

            let message_type = match &def.field_type {
                FieldType::Message(type_name) => Some(self.message(type_name).ok_or_else(|| {
                    Error::UnresolvedType {
                        name: type_name.clone(),
                        referenced_by: full_name.clone(),
                    }
                })?),
                _ => None,
            };

            descriptors.push(FieldDescriptor {
                name: def.name,
                full_name,
                index,
                tag: def.tag,
                field_type: def.field_type,
                message_type,
            });
        }

        let descriptor = Arc::new(MessageDescriptor {
            full_name: name.to_owned(),
            fields: descriptors,
            by_tag,
            by_name,
        });
        debug!(message = name, fields = descriptor.fields.len(), "registered message");

        self.names
            .insert(name.to_owned(), Entry::Message(self.messages.len()));
        self.messages.push(descriptor.clone());
        Ok(descriptor)
    }

    /// Register a service; every input and output type must already be
    /// registered.
    pub fn define_service<I>(&mut self, name: &str, methods: I) -> Result<Arc<ServiceDescriptor>>
    where
        I: IntoIterator<Item = MethodDef>,
    {
        if self.names.contains_key(name) {
            return Err(Error::duplicate("service", name));
        }

        let mut descriptors: Vec<MethodDescriptor> = Vec::new();
        for (index, def) in methods.into_iter().enumerate() {
            let full_name = format!("{name}.{}", def.name);
            if descriptors.iter().any(|m| m.name == def.name) {
                return Err(Error::duplicate("method", full_name));
            }
            let input_type = self.resolve(&def.input_type, &full_name)?;
            let output_type = self.resolve(&def.output_type, &full_name)?;
            descriptors.push(MethodDescriptor {
                name: def.name,
                full_name,
                index,
                input_type,
                output_type,
            });
        }

        let descriptor = Arc::new(ServiceDescriptor {
            full_name: name.to_owned(),
            methods: descriptors,
        });
        debug!(service = name, methods = descriptor.methods.len(), "registered service");

        self.names
            .insert(name.to_owned(), Entry::Service(self.services.len()));
        self.services.push(descriptor.clone());
        Ok(descriptor)
    }

    pub fn message(&self, name: &str) -> Option<Arc<MessageDescriptor>> {
        match self.names.get(name)? {
            Entry::Message(i) => Some(self.messages[*i].clone()),
            Entry::Service(_) => None,
        }
    }

    pub fn service(&self, name: &str) -> Option<Arc<ServiceDescriptor>> {
        match self.names.get(name)? {
            Entry::Service(i) => Some(self.services[*i].clone()),
            Entry::Message(_) => None,
        }
    }

    /// Messages in registration order.
    pub fn messages(&self) -> impl Iterator<Item = &Arc<MessageDescriptor>> {
        self.messages.iter()
    }

    /// Services in registration order.
    pub fn services(&self) -> impl Iterator<Item = &Arc<ServiceDescriptor>> {
        self.services.iter()
    }

    fn resolve(&self, type_name: &str, referenced_by: &str) -> Result<Arc<MessageDescriptor>> {
        self.message(type_name).ok_or_else(|| Error::UnresolvedType {
            name: type_name.to_owned(),
            referenced_by: referenced_by.to_owned(),
        })
    }
}

fn validate_tag(field: &str, tag: u32) -> Result<()> {
    let reason = if tag == 0 || tag > MAX_TAG {
        "tag must be between 1 and 2^29-1"
    } else if RESERVED_TAGS.contains(&tag) {
        "tags 19000 through 19999 are reserved"
    } else {
        return Ok(());
    };
    Err(Error::InvalidTag {
        field: field.to_owned(),
        tag,
        reason,
    })
}

fn short_name(full_name: &str) -> &str {
    full_name.rsplit('.').next().unwrap_or(full_name)
}

fn package_of(full_name: &str) -> &str {
    full_name.rsplit_once('.').map_or("", |(package, _)| package)
}
