//! Binary type codecs.
//!
//! A [`Codec`] transcodes between a host [`Value`] and one PostgreSQL type's
//! binary representation. Codecs are immutable and shared through `Arc`; the
//! [`CodecRegistry`] owns the lookup tables and the inference rules.

pub mod array;
pub mod registry;
pub mod shape;
pub mod temporal;
pub mod value;

pub use registry::CodecRegistry;
pub use shape::{Shape, ShapeTest};
pub use temporal::{Date, Timestamp};
pub use value::{Circle, Lseg, Money, PgBox, Point, Value};

use bytes::{BufMut, BytesMut};
use std::sync::Arc;
use thiserror::Error;

/// Errors raised while validating, encoding, decoding or inferring values.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CodecError {
    /// The host value kind cannot be represented by the codec.
    #[error("Cannot encode {found} value as {codec}")]
    Mismatch { codec: String, found: &'static str },

    /// An integer does not fit the codec's bit width.
    #[error("Value {value} out of range for {codec}")]
    OutOfRange { codec: String, value: String },

    /// Wire bytes (or a host value) are malformed for the codec.
    #[error("Invalid {codec} data: {reason}")]
    InvalidData { codec: String, reason: String },

    /// No codec could be inferred from the value.
    #[error("Could not infer a type for {0}")]
    Inference(String),

    #[error("Unknown type OID {0}")]
    UnknownOid(u32),

    #[error("Unknown type name '{0}'")]
    UnknownName(String),

    /// The server described a different number of parameters than were supplied.
    #[error("Statement expects {expected} parameters, {actual} supplied")]
    ParamCount { expected: usize, actual: usize },
}

/// Result of encoding: whether the value went on the wire as SQL NULL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsNull {
    Yes,
    No,
}

/// Binary wire layout of a type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Format {
    /// Server-inferred placeholder; only NULL encodes, anything decodes to raw bytes.
    Unknown,
    Bool,
    Int2,
    Int4,
    Int8,
    Oid,
    Float4,
    Float8,
    Text,
    Bytea,
    Uuid,
    Json,
    Jsonb,
    Timestamp,
    Date,
    Money,
    Point,
    Lseg,
    Box,
    Circle,
    Array,
}

/// A registered type codec.
#[derive(Debug)]
pub struct Codec {
    name: String,
    oid: u32,
    format: Format,
    shape: Option<Shape>,
    priority: Option<i32>,
    element: Option<Arc<Codec>>,
}

impl Codec {
    /// Scalar codec with no structural inference.
    pub fn scalar(name: impl Into<String>, oid: u32, format: Format) -> Self {
        Self {
            name: name.into(),
            oid,
            format,
            shape: None,
            priority: None,
            element: None,
        }
    }

    /// Array codec wrapping an element codec.
    pub fn array(name: impl Into<String>, oid: u32, element: Arc<Codec>) -> Self {
        Self {
            name: name.into(),
            oid,
            format: Format::Array,
            shape: None,
            priority: None,
            element: Some(element),
        }
    }

    /// Attach a shape test. A `None` priority keeps the codec out of inference.
    pub fn with_shape(mut self, shape: Shape, priority: Option<i32>) -> Self {
        self.shape = Some(shape);
        self.priority = priority;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn oid(&self) -> u32 {
        self.oid
    }

    pub fn format(&self) -> Format {
        self.format
    }

    pub fn shape(&self) -> Option<Shape> {
        self.shape
    }

    pub fn priority(&self) -> Option<i32> {
        self.priority
    }

    /// Element codec for array types.
    pub fn element(&self) -> Option<&Arc<Codec>> {
        self.element.as_ref()
    }

    pub fn is_array(&self) -> bool {
        self.element.is_some()
    }

    /// Append the binary form of `value` to `buf`.
    pub fn encode(&self, value: &Value, buf: &mut BytesMut) -> Result<IsNull, CodecError> {
        if value.is_null() {
            return Ok(IsNull::Yes);
        }
        match self.format {
            Format::Unknown => return Err(self.mismatch(value)),
            Format::Bool => match value {
                Value::Bool(b) => buf.put_u8(u8::from(*b)),
                _ => return Err(self.mismatch(value)),
            },
            Format::Int2 => buf.put_i16(self.integral(value)? as i16),
            Format::Int4 => buf.put_i32(self.integral(value)? as i32),
            Format::Int8 => buf.put_i64(self.integral(value)? as i64),
            Format::Oid => buf.put_u32(self.integral(value)? as u32),
            Format::Float4 => buf.put_f32(self.float(value)? as f32),
            Format::Float8 => buf.put_f64(self.float(value)?),
            Format::Text => match value {
                Value::Text(s) | Value::Uuid(s) => {
                    if s.as_bytes().contains(&0) {
                        return Err(self.invalid("text contains NUL byte"));
                    }
                    buf.put_slice(s.as_bytes());
                }
                _ => return Err(self.mismatch(value)),
            },
            Format::Bytea => match value {
                Value::Bytes(b) => buf.put_slice(b),
                _ => return Err(self.mismatch(value)),
            },
            Format::Uuid => match value {
                Value::Uuid(s) | Value::Text(s) => {
                    let bytes = shape::parse_uuid(s)
                        .ok_or_else(|| self.invalid(format!("'{s}' is not a UUID")))?;
                    buf.put_slice(&bytes);
                }
                _ => return Err(self.mismatch(value)),
            },
            Format::Json => buf.put_slice(self.json_text(value)?.as_bytes()),
            Format::Jsonb => {
                let text = self.json_text(value)?;
                buf.put_u8(1);
                buf.put_slice(text.as_bytes());
            }
            Format::Timestamp => match value {
                Value::Timestamp(ts) => buf.put_i64(ts.usec),
                _ => return Err(self.mismatch(value)),
            },
            Format::Date => match value {
                Value::Date(d) => buf.put_i32(d.days),
                _ => return Err(self.mismatch(value)),
            },
            Format::Money => match value {
                Value::Money(m) => buf.put_i64(m.cents),
                Value::Int(cents) => buf.put_i64(*cents),
                _ => return Err(self.mismatch(value)),
            },
            Format::Point => match value {
                Value::Point(p) => put_point(buf, p),
                _ => return Err(self.mismatch(value)),
            },
            Format::Lseg => match value {
                Value::Lseg(l) => {
                    put_point(buf, &l.start);
                    put_point(buf, &l.end);
                }
                _ => return Err(self.mismatch(value)),
            },
            Format::Box => match value {
                Value::Box(b) => {
                    put_point(buf, &b.high);
                    put_point(buf, &b.low);
                }
                _ => return Err(self.mismatch(value)),
            },
            Format::Circle => match value {
                Value::Circle(c) => {
                    put_point(buf, &c.center);
                    buf.put_f64(c.radius);
                }
                _ => return Err(self.mismatch(value)),
            },
            Format::Array => return array::encode(self, value, buf),
        }
        Ok(IsNull::No)
    }

    /// Decode one non-NULL binary field.
    pub fn decode(&self, bytes: &[u8]) -> Result<Value, CodecError> {
        let value = match self.format {
            Format::Unknown | Format::Bytea => Value::Bytes(bytes.to_vec()),
            Format::Bool => Value::Bool(self.fixed::<1>(bytes)?[0] != 0),
            Format::Int2 => Value::Int(i16::from_be_bytes(self.fixed(bytes)?).into()),
            Format::Int4 => Value::Int(i32::from_be_bytes(self.fixed(bytes)?).into()),
            Format::Int8 => Value::Int(i64::from_be_bytes(self.fixed(bytes)?)),
            Format::Oid => Value::Int(u32::from_be_bytes(self.fixed(bytes)?).into()),
            Format::Float4 => Value::Float(f32::from_be_bytes(self.fixed(bytes)?).into()),
            Format::Float8 => Value::Float(f64::from_be_bytes(self.fixed(bytes)?)),
            Format::Text => Value::Text(self.utf8(bytes)?.to_string()),
            Format::Uuid => Value::Uuid(shape::format_uuid(&self.fixed(bytes)?)),
            Format::Json => self.parse_json(bytes)?,
            Format::Jsonb => match bytes.split_first() {
                Some((&1, rest)) => self.parse_json(rest)?,
                Some((version, _)) => {
                    return Err(self.invalid(format!("unsupported jsonb version {version}")));
                }
                None => return Err(self.invalid("empty jsonb payload")),
            },
            Format::Timestamp => Value::Timestamp(Timestamp::from_pg_usec(i64::from_be_bytes(
                self.fixed(bytes)?,
            ))),
            Format::Date => Value::Date(Date {
                days: i32::from_be_bytes(self.fixed(bytes)?),
            }),
            Format::Money => Value::Money(Money::from_cents(i64::from_be_bytes(
                self.fixed(bytes)?,
            ))),
            Format::Point => {
                let f = self.floats::<2>(bytes)?;
                Value::Point(Point::new(f[0], f[1]))
            }
            Format::Lseg => {
                let f = self.floats::<4>(bytes)?;
                Value::Lseg(Lseg {
                    start: Point::new(f[0], f[1]),
                    end: Point::new(f[2], f[3]),
                })
            }
            Format::Box => {
                let f = self.floats::<4>(bytes)?;
                Value::Box(PgBox {
                    high: Point::new(f[0], f[1]),
                    low: Point::new(f[2], f[3]),
                })
            }
            Format::Circle => {
                let f = self.floats::<3>(bytes)?;
                Value::Circle(Circle {
                    center: Point::new(f[0], f[1]),
                    radius: f[2],
                })
            }
            Format::Array => array::decode(self, bytes)?,
        };
        Ok(value)
    }

    /// Validate a value against this codec without keeping the encoding.
    ///
    /// Arrays are checked element by element and must be rectangular. JSON
    /// codecs require a JSON representation; other structural codecs defer to
    /// their shape test.
    pub fn check(&self, value: &Value) -> Result<(), CodecError> {
        if value.is_null() {
            return Ok(());
        }
        match self.format {
            Format::Array => return array::check(self, value),
            Format::Json | Format::Jsonb => return self.json_text(value).map(|_| ()),
            _ => {}
        }
        if let Some(shape) = self.shape {
            return if shape.matches(value) {
                Ok(())
            } else {
                Err(self.mismatch(value))
            };
        }
        let mut scratch = BytesMut::new();
        self.encode(value, &mut scratch).map(|_| ())
    }

    fn integral(&self, value: &Value) -> Result<i128, CodecError> {
        let n = match value {
            Value::Int(i) => i128::from(*i),
            Value::BigInt(i) if self.format == Format::Int8 => *i,
            Value::Float(f) if f.is_finite() && f.fract() == 0.0 => *f as i128,
            _ => return Err(self.mismatch(value)),
        };
        let (min, max) = match self.format {
            Format::Int2 => (i16::MIN as i128, i16::MAX as i128),
            Format::Int4 => (i32::MIN as i128, i32::MAX as i128),
            Format::Oid => (0, u32::MAX as i128),
            _ => (i64::MIN as i128, i64::MAX as i128),
        };
        if n < min || n > max {
            return Err(CodecError::OutOfRange {
                codec: self.name.clone(),
                value: n.to_string(),
            });
        }
        Ok(n)
    }

    fn float(&self, value: &Value) -> Result<f64, CodecError> {
        match value {
            Value::Float(f) => Ok(*f),
            Value::Int(i) => Ok(*i as f64),
            _ => Err(self.mismatch(value)),
        }
    }

    fn json_text(&self, value: &Value) -> Result<String, CodecError> {
        let text = match value {
            Value::Json(j) => serde_json::to_string(j),
            other => serde_json::to_string(&self.to_json(other)?),
        }
        .map_err(|e| self.invalid(e.to_string()))?;
        if text.contains("\\u0000") {
            return Err(self.invalid("JSON contains \\u0000"));
        }
        Ok(text)
    }

    fn to_json(&self, value: &Value) -> Result<serde_json::Value, CodecError> {
        use serde_json::Value as Json;
        let json = match value {
            Value::Null => Json::Null,
            Value::Bool(b) => Json::Bool(*b),
            Value::Int(i) => Json::from(*i),
            Value::BigInt(i) => match (i64::try_from(*i), u64::try_from(*i)) {
                (Ok(n), _) => Json::from(n),
                (_, Ok(n)) => Json::from(n),
                _ => return Err(self.invalid(format!("{i} has no JSON representation"))),
            },
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(Json::Number)
                .ok_or_else(|| self.invalid(format!("{f} has no JSON representation")))?,
            Value::Text(s) | Value::Uuid(s) => Json::String(s.clone()),
            Value::Json(j) => j.clone(),
            Value::Array(items) => Json::Array(
                items
                    .iter()
                    .map(|v| self.to_json(v))
                    .collect::<Result<_, _>>()?,
            ),
            other => return Err(self.mismatch(other)),
        };
        Ok(json)
    }

    fn parse_json(&self, bytes: &[u8]) -> Result<Value, CodecError> {
        serde_json::from_slice(bytes)
            .map(Value::Json)
            .map_err(|e| self.invalid(e.to_string()))
    }

    fn fixed<const N: usize>(&self, bytes: &[u8]) -> Result<[u8; N], CodecError> {
        bytes
            .try_into()
            .map_err(|_| self.invalid(format!("expected {N} bytes, got {}", bytes.len())))
    }

    fn floats<const N: usize>(&self, bytes: &[u8]) -> Result<[f64; N], CodecError> {
        if bytes.len() != N * 8 {
            return Err(self.invalid(format!(
                "expected {} bytes, got {}",
                N * 8,
                bytes.len()
            )));
        }
        let mut out = [0f64; N];
        for (slot, chunk) in out.iter_mut().zip(bytes.chunks_exact(8)) {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(chunk);
            *slot = f64::from_be_bytes(raw);
        }
        Ok(out)
    }

    fn utf8<'a>(&self, bytes: &'a [u8]) -> Result<&'a str, CodecError> {
        std::str::from_utf8(bytes).map_err(|e| self.invalid(format!("invalid UTF-8: {e}")))
    }

    pub(crate) fn mismatch(&self, value: &Value) -> CodecError {
        CodecError::Mismatch {
            codec: self.name.clone(),
            found: value.kind(),
        }
    }

    pub(crate) fn invalid(&self, reason: impl Into<String>) -> CodecError {
        CodecError::InvalidData {
            codec: self.name.clone(),
            reason: reason.into(),
        }
    }
}

fn put_point(buf: &mut BytesMut, p: &Point) {
    buf.put_f64(p.x);
    buf.put_f64(p.y);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::types::oid;
    use pretty_assertions::assert_eq;

    fn round_trip(codec: &Codec, value: Value) -> Value {
        let mut buf = BytesMut::new();
        assert_eq!(codec.encode(&value, &mut buf).unwrap(), IsNull::No);
        codec.decode(&buf).unwrap()
    }

    #[test]
    fn test_integer_boundaries() {
        let int2 = Codec::scalar("int2", oid::INT2, Format::Int2);
        let int4 = Codec::scalar("int4", oid::INT4, Format::Int4);
        let int8 = Codec::scalar("int8", oid::INT8, Format::Int8);
        for v in [i16::MIN as i64, i16::MAX as i64, 0] {
            assert_eq!(round_trip(&int2, Value::Int(v)), Value::Int(v));
        }
        for v in [i32::MIN as i64, i32::MAX as i64] {
            assert_eq!(round_trip(&int4, Value::Int(v)), Value::Int(v));
        }
        for v in [i64::MIN, i64::MAX, 9_007_199_254_740_993] {
            assert_eq!(round_trip(&int8, Value::Int(v)), Value::Int(v));
        }
        assert_eq!(
            round_trip(&int8, Value::BigInt(9_007_199_254_740_993)),
            Value::Int(9_007_199_254_740_993)
        );
    }

    #[test]
    fn test_integer_range_checks() {
        let int2 = Codec::scalar("int2", oid::INT2, Format::Int2);
        let int4 = Codec::scalar("int4", oid::INT4, Format::Int4);
        let oid_codec = Codec::scalar("oid", oid::OID, Format::Oid);
        assert!(matches!(
            int2.check(&Value::Int(40_000)),
            Err(CodecError::OutOfRange { .. })
        ));
        assert!(int4.check(&Value::Float(3.0)).is_ok());
        assert!(int4.check(&Value::Float(3.5)).is_err());
        assert!(int4.check(&Value::BigInt(1)).is_err());
        assert!(oid_codec.check(&Value::Int(u32::MAX as i64)).is_ok());
        assert!(oid_codec.check(&Value::Int(-1)).is_err());
    }

    #[test]
    fn test_timestamp_infinity() {
        let ts = Codec::scalar("timestamptz", oid::TIMESTAMPTZ, Format::Timestamp);
        for v in [Timestamp::INFINITY, Timestamp::NEG_INFINITY] {
            assert_eq!(round_trip(&ts, Value::Timestamp(v)), Value::Timestamp(v));
        }
        let mut buf = BytesMut::new();
        ts.encode(&Value::Timestamp(Timestamp::INFINITY), &mut buf)
            .unwrap();
        assert_eq!(&buf[..], &i64::MAX.to_be_bytes());
    }

    #[test]
    fn test_uuid_case_insensitive() {
        let uuid = Codec::scalar("uuid", oid::UUID, Format::Uuid);
        let upper = Value::Uuid("550E8400-E29B-41D4-A716-446655440000".into());
        assert_eq!(
            round_trip(&uuid, upper),
            Value::Uuid("550e8400-e29b-41d4-a716-446655440000".into())
        );
    }

    #[test]
    fn test_jsonb() {
        let jsonb = Codec::scalar("jsonb", oid::JSONB, Format::Jsonb);
        let doc = Value::Json(serde_json::json!({"a": [1, 2, null]}));
        let mut buf = BytesMut::new();
        jsonb.encode(&doc, &mut buf).unwrap();
        assert_eq!(buf[0], 1);
        assert_eq!(jsonb.decode(&buf).unwrap(), doc);

        assert!(jsonb.decode(b"\x02{}").is_err());
        assert!(jsonb.check(&Value::Bytes(vec![1])).is_err());
        assert!(jsonb.check(&Value::Float(f64::NAN)).is_err());
        assert!(jsonb.check(&Value::Text("a\0b".into())).is_err());
        assert!(jsonb.check(&Value::Text("ok".into())).is_ok());
    }

    #[test]
    fn test_geometry_and_money() {
        let circle = Codec::scalar("circle", oid::CIRCLE, Format::Circle);
        let c = Value::Circle(Circle {
            center: Point::new(1.5, -2.0),
            radius: 3.0,
        });
        assert_eq!(round_trip(&circle, c.clone()), c);

        let money = Codec::scalar("money", oid::MONEY, Format::Money);
        let m = Value::Money(Money::from_cents(-12_345));
        assert_eq!(round_trip(&money, m.clone()), m);
    }

    #[test]
    fn test_check_agrees_with_encode() {
        let money =
            Codec::scalar("money", oid::MONEY, Format::Money).with_shape(Shape::Money, Some(50));
        let cents = Value::Int(1_999);
        assert!(money.check(&cents).is_ok());
        assert_eq!(round_trip(&money, cents), Value::Money(Money::from_cents(1_999)));
        assert!(money.check(&Value::Text("19.99".into())).is_err());
        assert!(money.encode(&Value::Text("19.99".into()), &mut BytesMut::new()).is_err());
    }

    #[test]
    fn test_null_and_mismatch() {
        let text = Codec::scalar("text", oid::TEXT, Format::Text);
        let mut buf = BytesMut::new();
        assert_eq!(text.encode(&Value::Null, &mut buf).unwrap(), IsNull::Yes);
        assert!(buf.is_empty());
        assert!(matches!(
            text.encode(&Value::Int(1), &mut buf),
            Err(CodecError::Mismatch { found: "int", .. })
        ));
        assert!(text.decode(&[0xff, 0xfe]).is_err());
    }
}
