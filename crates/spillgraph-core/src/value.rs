//! Typed property values.
//!
//! A closed set of value kinds that node and edge properties may hold.
//! Strings are reference counted so decoded records can share interned text.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Approximate heap cost of a value, used for resident memory accounting
const VALUE_BASE_SIZE: usize = 24;

/// Kind of a property value, as declared by the schema
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    Bool,
    Byte,
    Short,
    Int,
    Long,
    Float,
    Double,
    Char,
    String,
    List,
    NodeRef,
}

impl ValueKind {
    /// Get the string representation of the kind
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bool => "bool",
            Self::Byte => "byte",
            Self::Short => "short",
            Self::Int => "int",
            Self::Long => "long",
            Self::Float => "float",
            Self::Double => "double",
            Self::Char => "char",
            Self::String => "string",
            Self::List => "list",
            Self::NodeRef => "node_ref",
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed property value
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Bool(bool),
    Byte(i8),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Char(char),
    String(Arc<str>),
    /// List of scalar values
    List(Vec<PropertyValue>),
    /// Reference to another node by id
    NodeRef(i64),
}

impl PropertyValue {
    /// The kind of this value
    pub fn kind(&self) -> ValueKind {
        match self {
            Self::Bool(_) => ValueKind::Bool,
            Self::Byte(_) => ValueKind::Byte,
            Self::Short(_) => ValueKind::Short,
            Self::Int(_) => ValueKind::Int,
            Self::Long(_) => ValueKind::Long,
            Self::Float(_) => ValueKind::Float,
            Self::Double(_) => ValueKind::Double,
            Self::Char(_) => ValueKind::Char,
            Self::String(_) => ValueKind::String,
            Self::List(_) => ValueKind::List,
            Self::NodeRef(_) => ValueKind::NodeRef,
        }
    }

    /// Whether the value may appear as a list element
    pub fn is_scalar(&self) -> bool {
        !matches!(self, Self::List(_) | Self::NodeRef(_))
    }

    /// Borrow the string contents, if this is a string
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Widen any integer kind to i64
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Byte(v) => Some(i64::from(*v)),
            Self::Short(v) => Some(i64::from(*v)),
            Self::Int(v) => Some(i64::from(*v)),
            Self::Long(v) => Some(*v),
            _ => None,
        }
    }

    /// Estimated in-memory footprint in bytes
    pub fn estimated_size(&self) -> usize {
        match self {
            Self::String(s) => VALUE_BASE_SIZE + s.len(),
            Self::List(items) => {
                VALUE_BASE_SIZE + items.iter().map(Self::estimated_size).sum::<usize>()
            }
            _ => VALUE_BASE_SIZE,
        }
    }

    /// Convert to a JSON value for display
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value;
        match self {
            Self::Bool(v) => Value::from(*v),
            Self::Byte(v) => Value::from(*v),
            Self::Short(v) => Value::from(*v),
            Self::Int(v) => Value::from(*v),
            Self::Long(v) => Value::from(*v),
            Self::Float(v) => Value::from(*v),
            Self::Double(v) => Value::from(*v),
            Self::Char(v) => Value::from(v.to_string()),
            Self::String(v) => Value::from(v.as_ref()),
            Self::List(items) => Value::Array(items.iter().map(Self::to_json).collect()),
            Self::NodeRef(id) => serde_json::json!({ "node": id }),
        }
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{v}"),
            Self::Byte(v) => write!(f, "{v}b"),
            Self::Short(v) => write!(f, "{v}s"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Long(v) => write!(f, "{v}L"),
            Self::Float(v) => write!(f, "{v}f"),
            Self::Double(v) => write!(f, "{v}"),
            Self::Char(v) => write!(f, "'{v}'"),
            Self::String(v) => write!(f, "{v:?}"),
            Self::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
            Self::NodeRef(id) => write!(f, "#{id}"),
        }
    }
}

macro_rules! impl_from {
    ($ty:ty, $variant:ident) => {
        impl From<$ty> for PropertyValue {
            fn from(v: $ty) -> Self {
                Self::$variant(v)
            }
        }
    };
}

impl_from!(bool, Bool);
impl_from!(i8, Byte);
impl_from!(i16, Short);
impl_from!(i32, Int);
impl_from!(i64, Long);
impl_from!(f32, Float);
impl_from!(f64, Double);
impl_from!(char, Char);
impl_from!(Arc<str>, String);
impl_from!(Vec<PropertyValue>, List);

impl From<&str> for PropertyValue {
    fn from(v: &str) -> Self {
        Self::String(Arc::from(v))
    }
}

impl From<String> for PropertyValue {
    fn from(v: String) -> Self {
        Self::String(Arc::from(v))
    }
}
