//! The typed field value union.

use bytes::Bytes;
use std::fmt;

use swarm_common::{Id, LogicalTime};

use crate::descriptor::FieldType;

/// A single typed field value.
///
/// Per-field typed setters and getters on revisions go through this
/// tagged union; the variant is checked against the table descriptor at
/// every access.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Boolean.
    Bool(bool),
    /// 32-bit signed integer.
    Int32(i32),
    /// 64-bit signed integer.
    Int64(i64),
    /// 64-bit float.
    Double(f64),
    /// UTF-8 string.
    String(String),
    /// Raw bytes.
    Bytes(Bytes),
    /// A 128-bit id hash.
    Hash(Id),
    /// A logical-clock time.
    Time(LogicalTime),
    /// An embedded serialized message.
    Message(Bytes),
}

impl Value {
    /// Returns the field type this value inhabits.
    #[must_use]
    pub const fn field_type(&self) -> FieldType {
        match self {
            Value::Bool(_) => FieldType::Bool,
            Value::Int32(_) => FieldType::Int32,
            Value::Int64(_) => FieldType::Int64,
            Value::Double(_) => FieldType::Double,
            Value::String(_) => FieldType::String,
            Value::Bytes(_) => FieldType::Bytes,
            Value::Hash(_) => FieldType::Hash,
            Value::Time(_) => FieldType::LogicalTime,
            Value::Message(_) => FieldType::Message,
        }
    }

    /// Extracts a boolean.
    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// Extracts a 32-bit integer.
    #[must_use]
    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Value::Int32(v) => Some(*v),
            _ => None,
        }
    }

    /// Extracts a 64-bit integer.
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int64(v) => Some(*v),
            _ => None,
        }
    }

    /// Extracts a double.
    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Double(v) => Some(*v),
            _ => None,
        }
    }

    /// Extracts a string slice.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(v) => Some(v),
            _ => None,
        }
    }

    /// Extracts raw bytes (also accepts embedded messages).
    #[must_use]
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Value::Bytes(v) | Value::Message(v) => Some(v),
            _ => None,
        }
    }

    /// Extracts an id hash.
    #[must_use]
    pub fn as_hash(&self) -> Option<Id> {
        match self {
            Value::Hash(v) => Some(*v),
            _ => None,
        }
    }

    /// Extracts a logical time.
    #[must_use]
    pub fn as_time(&self) -> Option<LogicalTime> {
        match self {
            Value::Time(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(v) => write!(f, "{}", v),
            Value::Int32(v) => write!(f, "{}", v),
            Value::Int64(v) => write!(f, "{}", v),
            Value::Double(v) => write!(f, "{}", v),
            Value::String(v) => write!(f, "{:?}", v),
            Value::Bytes(v) => write!(f, "<{} bytes>", v.len()),
            Value::Hash(v) => write!(f, "{}", v),
            Value::Time(v) => write!(f, "{}", v),
            Value::Message(v) => write!(f, "<message, {} bytes>", v.len()),
        }
    }
}
