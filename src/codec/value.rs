//! Host value model.
//!
//! Every query parameter and every decoded column is a [`Value`]. Geometric and
//! money types get small dedicated structs so the structural inference can tell
//! them apart.

use super::temporal::{Date, Timestamp};

/// Monetary amount in the smallest currency unit (cents).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Money {
    pub cents: i64,
}

impl Money {
    pub fn from_cents(cents: i64) -> Self {
        Self { cents }
    }
}

/// `point`: (x, y)
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// `lseg`: a finite line segment
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Lseg {
    pub start: Point,
    pub end: Point,
}

/// `box`: stored by the server as (upper-right, lower-left)
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PgBox {
    pub high: Point,
    pub low: Point,
}

/// `circle`: center and radius
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Circle {
    pub center: Point,
    pub radius: f64,
}

/// A PostgreSQL value on the host side.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    /// Integral number; also the decoded form of every integer column.
    Int(i64),
    /// Widened integer. Accepted by `int8` when it fits in 64 bits.
    BigInt(i128),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    /// Hex-with-dashes UUID string
    Uuid(String),
    Json(serde_json::Value),
    Timestamp(Timestamp),
    Date(Date),
    Money(Money),
    Point(Point),
    Lseg(Lseg),
    Box(PgBox),
    Circle(Circle),
    /// One array dimension; nest for multi-dimensional arrays.
    Array(Vec<Value>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Short name of the variant, used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::BigInt(_) => "bigint",
            Value::Float(_) => "float",
            Value::Text(_) => "text",
            Value::Bytes(_) => "bytes",
            Value::Uuid(_) => "uuid",
            Value::Json(_) => "json",
            Value::Timestamp(_) => "timestamp",
            Value::Date(_) => "date",
            Value::Money(_) => "money",
            Value::Point(_) => "point",
            Value::Lseg(_) => "lseg",
            Value::Box(_) => "box",
            Value::Circle(_) => "circle",
            Value::Array(_) => "array",
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::BigInt(i) => i64::try_from(*i).ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    /// Text-like values: `Text` and `Uuid`.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) | Value::Uuid(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Value::Json(j) => Some(j),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Build an array value from any iterator of convertible items.
    pub fn array<I, T>(items: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Value>,
    {
        Value::Array(items.into_iter().map(Into::into).collect())
    }
}

macro_rules! impl_from {
    ($($ty:ty => |$v:ident| $body:expr),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from($v: $ty) -> Self {
                    $body
                }
            }
        )*
    };
}

impl_from! {
    bool => |v| Value::Bool(v),
    i16 => |v| Value::Int(v.into()),
    i32 => |v| Value::Int(v.into()),
    i64 => |v| Value::Int(v),
    u32 => |v| Value::Int(v.into()),
    i128 => |v| Value::BigInt(v),
    f32 => |v| Value::Float(v.into()),
    f64 => |v| Value::Float(v),
    String => |v| Value::Text(v),
    &str => |v| Value::Text(v.to_string()),
    Vec<u8> => |v| Value::Bytes(v),
    &[u8] => |v| Value::Bytes(v.to_vec()),
    serde_json::Value => |v| Value::Json(v),
    Timestamp => |v| Value::Timestamp(v),
    Date => |v| Value::Date(v),
    Money => |v| Value::Money(v),
    Point => |v| Value::Point(v),
    Lseg => |v| Value::Lseg(v),
    PgBox => |v| Value::Box(v),
    Circle => |v| Value::Circle(v),
    Vec<Value> => |v| Value::Array(v),
    Vec<i32> => |v| Value::array(v),
    Vec<i64> => |v| Value::array(v),
    Vec<f64> => |v| Value::array(v),
    Vec<bool> => |v| Value::array(v),
    Vec<String> => |v| Value::array(v),
    Vec<&str> => |v| Value::array(v),
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

#[cfg(feature = "uuid")]
impl From<uuid::Uuid> for Value {
    fn from(v: uuid::Uuid) -> Self {
        Value::Uuid(v.hyphenated().to_string())
    }
}

#[cfg(feature = "chrono")]
mod chrono_impls {
    use super::Value;
    use crate::codec::temporal::{Date, Timestamp};

    impl From<chrono::DateTime<chrono::Utc>> for Value {
        fn from(v: chrono::DateTime<chrono::Utc>) -> Self {
            Value::Timestamp(Timestamp::from(v))
        }
    }

    impl From<chrono::NaiveDateTime> for Value {
        fn from(v: chrono::NaiveDateTime) -> Self {
            Value::Timestamp(Timestamp::from(v))
        }
    }

    impl From<chrono::NaiveDate> for Value {
        fn from(v: chrono::NaiveDate) -> Self {
            Value::Date(Date::from(v))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_conversions() {
        assert_eq!(Value::from(42i32), Value::Int(42));
        assert_eq!(Value::from("x"), Value::Text("x".to_string()));
        assert_eq!(Value::from(None::<i32>), Value::Null);
        assert_eq!(Value::from(Some(1.5f64)), Value::Float(1.5));
        assert_eq!(
            Value::from(vec![1i32, 2]),
            Value::Array(vec![Value::Int(1), Value::Int(2)])
        );
    }

    #[test]
    fn test_accessors() {
        assert_eq!(Value::BigInt(7).as_i64(), Some(7));
        assert_eq!(Value::BigInt(i128::MAX).as_i64(), None);
        assert_eq!(Value::Uuid("a".into()).as_str(), Some("a"));
        assert!(Value::Null.is_null());
        assert_eq!(Value::Box(PgBox::default()).kind(), "box");
    }
}
