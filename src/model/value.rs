use crate::model::types::{PrimitiveKind, TypeId};
use indexmap::IndexMap;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

/// Identity of a heap allocated debuggee object or array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Primitive {
    Bool(bool),
    Char(char),
    Int32(i32),
    Int64(i64),
    Double(f64),
}

impl Primitive {
    pub fn kind(&self) -> PrimitiveKind {
        match self {
            Primitive::Bool(_) => PrimitiveKind::Bool,
            Primitive::Char(_) => PrimitiveKind::Char,
            Primitive::Int32(_) => PrimitiveKind::Int32,
            Primitive::Int64(_) => PrimitiveKind::Int64,
            Primitive::Double(_) => PrimitiveKind::Double,
        }
    }

    pub fn type_id(&self) -> TypeId {
        match self {
            Primitive::Bool(_) => TypeId::BOOL,
            Primitive::Char(_) => TypeId::CHAR,
            Primitive::Int32(_) => TypeId::INT32,
            Primitive::Int64(_) => TypeId::INT64,
            Primitive::Double(_) => TypeId::DOUBLE,
        }
    }

    /// Integral value, if any.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Primitive::Int32(v) => Some(*v as i64),
            Primitive::Int64(v) => Some(*v),
            Primitive::Char(c) => Some(*c as i64),
            _ => None,
        }
    }
}

impl Display for Primitive {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Primitive::Bool(b) => write!(f, "{b}"),
            Primitive::Char(c) => write!(f, "'{}'", c.escape_default()),
            Primitive::Int32(v) => write!(f, "{v}"),
            Primitive::Int64(v) => write!(f, "{v}"),
            Primitive::Double(v) => write!(f, "{v}"),
        }
    }
}

/// Value type instance, copied by value.
#[derive(Debug, Clone, PartialEq)]
pub struct StructValue {
    pub ty: TypeId,
    pub fields: IndexMap<String, Value>,
}

/// Debuggee value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Primitive(Primitive),
    String(Arc<str>),
    Enum { ty: TypeId, value: i64 },
    Array(ObjectId),
    Struct(StructValue),
    Object(ObjectId),
}

impl Value {
    pub fn string(s: impl AsRef<str>) -> Self {
        Value::String(Arc::from(s.as_ref()))
    }

    pub fn int(v: i32) -> Self {
        Value::Primitive(Primitive::Int32(v))
    }

    pub fn bool(v: bool) -> Self {
        Value::Primitive(Primitive::Bool(v))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Primitive(Primitive::Bool(b)) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Primitive(p) => p.as_i64(),
            Value::Enum { value, .. } => Some(*value),
            _ => None,
        }
    }

    /// Heap identity for reference values.
    pub fn object_id(&self) -> Option<ObjectId> {
        match self {
            Value::Array(id) | Value::Object(id) => Some(*id),
            _ => None,
        }
    }
}
