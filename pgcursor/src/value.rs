use std::{
    fmt,
    hash::{Hash, Hasher},
};

/// A database value.
#[derive(Clone)]
pub enum Value {
    Null,
    Bool(bool),
    ShortInt(i16),
    Int(i32),
    BigInt(i64),
    Double(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl Value {
    /// Returns the value as an `i64` if it is of any integer type.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::ShortInt(inner) => Some(i64::from(*inner)),
            Value::Int(inner) => Some(i64::from(*inner)),
            Value::BigInt(inner) => Some(*inner),
            _ => None,
        }
    }

    /// Returns the value as a string slice if it is a text.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(inner) => Some(inner),
            _ => None,
        }
    }
}

// Doubles are compared by their bit pattern so that values can be used as
// grouping keys.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::ShortInt(a), Value::ShortInt(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::BigInt(a), Value::BigInt(b)) => a == b,
            (Value::Double(a), Value::Double(b)) => a.to_bits() == b.to_bits(),
            (Value::Text(a), Value::Text(b)) => a == b,
            (Value::Blob(a), Value::Blob(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Value::Null => {}
            Value::Bool(inner) => inner.hash(state),
            Value::ShortInt(inner) => inner.hash(state),
            Value::Int(inner) => inner.hash(state),
            Value::BigInt(inner) => inner.hash(state),
            Value::Double(inner) => inner.to_bits().hash(state),
            Value::Text(inner) => inner.hash(state),
            Value::Blob(inner) => inner.hash(state),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.pad("NULL"),
            Value::Bool(inner) => fmt::Display::fmt(inner, f),
            Value::ShortInt(inner) => fmt::Display::fmt(inner, f),
            Value::Int(inner) => fmt::Display::fmt(inner, f),
            Value::BigInt(inner) => fmt::Display::fmt(inner, f),
            Value::Double(inner) => fmt::Display::fmt(inner, f),
            Value::Text(inner) => fmt::Display::fmt(inner, f),
            Value::Blob(inner) => f.pad(&format!("<bytes ({})>", inner.len())),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("Null"),
            Value::Bool(inner) => fmt::Debug::fmt(inner, f),
            Value::ShortInt(inner) => fmt::Debug::fmt(inner, f),
            Value::Int(inner) => fmt::Debug::fmt(inner, f),
            Value::BigInt(inner) => fmt::Debug::fmt(inner, f),
            Value::Double(inner) => fmt::Debug::fmt(inner, f),
            Value::Text(inner) => fmt::Debug::fmt(inner, f),
            Value::Blob(inner) => write!(f, "<bytes ({})>", inner.len()),
        }
    }
}

macro_rules! impl_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(inner: $ty) -> Value {
                    Value::$variant(inner.into())
                }
            }
        )*
    };
}

impl_from! {
    bool => Bool,
    i16 => ShortInt,
    i32 => Int,
    i64 => BigInt,
    f64 => Double,
    String => Text,
    &str => Text,
    Vec<u8> => Blob,
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(inner: Option<T>) -> Value {
        inner.map_or(Value::Null, Into::into)
    }
}
