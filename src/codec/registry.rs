//! Codec lookup and type inference.
//!
//! The registry maps OIDs and names to codecs and keeps an ascending-priority
//! list of structural entries used to infer a codec from a host value.

use super::array::flatten_leaves;
use super::shape::{Shape, ShapeTest};
use super::{Codec, CodecError, Format, Value};
use crate::protocol::types::{array_element_oid, oid};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

/// Explicit parameter type: by OID or by registered name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeHint {
    Oid(u32),
    Name(String),
}

impl From<u32> for TypeHint {
    fn from(oid: u32) -> Self {
        TypeHint::Oid(oid)
    }
}

impl From<&str> for TypeHint {
    fn from(name: &str) -> Self {
        TypeHint::Name(name.to_string())
    }
}

impl From<String> for TypeHint {
    fn from(name: String) -> Self {
        TypeHint::Name(name)
    }
}

#[derive(Debug)]
struct InferenceEntry {
    priority: i32,
    shape: Shape,
    scalar: Arc<Codec>,
    array: Option<Arc<Codec>>,
}

/// Registry of codecs by OID and by name.
#[derive(Debug)]
pub struct CodecRegistry {
    by_oid: HashMap<u32, Arc<Codec>>,
    by_name: HashMap<String, Arc<Codec>>,
    /// Element OID -> array codec
    arrays: HashMap<u32, Arc<Codec>>,
    inference: Vec<InferenceEntry>,
    unknown: Arc<Codec>,
}

const SCALARS: &[(&str, u32, Format, Option<(Shape, Option<i32>)>)] = &[
    ("bool", oid::BOOL, Format::Bool, None),
    ("bytea", oid::BYTEA, Format::Bytea, Some((Shape::Bytes, Some(10)))),
    ("char", oid::CHAR, Format::Text, None),
    ("name", oid::NAME, Format::Text, None),
    ("int8", oid::INT8, Format::Int8, None),
    ("int2", oid::INT2, Format::Int2, None),
    ("int4", oid::INT4, Format::Int4, None),
    ("text", oid::TEXT, Format::Text, None),
    ("oid", oid::OID, Format::Oid, None),
    ("json", oid::JSON, Format::Json, Some((Shape::Json, None))),
    ("point", oid::POINT, Format::Point, Some((Shape::Point, Some(60)))),
    ("lseg", oid::LSEG, Format::Lseg, Some((Shape::Lseg, Some(63)))),
    ("box", oid::BOX, Format::Box, Some((Shape::Box, Some(61)))),
    ("float4", oid::FLOAT4, Format::Float4, None),
    ("float8", oid::FLOAT8, Format::Float8, None),
    ("circle", oid::CIRCLE, Format::Circle, Some((Shape::Circle, Some(62)))),
    ("money", oid::MONEY, Format::Money, Some((Shape::Money, Some(50)))),
    ("bpchar", oid::BPCHAR, Format::Text, None),
    ("varchar", oid::VARCHAR, Format::Text, None),
    ("date", oid::DATE, Format::Date, Some((Shape::Date, Some(30)))),
    ("timestamp", oid::TIMESTAMP, Format::Timestamp, Some((Shape::Timestamp, None))),
    ("timestamptz", oid::TIMESTAMPTZ, Format::Timestamp, Some((Shape::Timestamp, Some(20)))),
    ("uuid", oid::UUID, Format::Uuid, Some((Shape::Uuid, Some(40)))),
    ("jsonb", oid::JSONB, Format::Jsonb, Some((Shape::Json, Some(100)))),
];

const ARRAYS: &[(&str, u32)] = &[
    ("_bool", oid::BOOL_ARRAY),
    ("_bytea", oid::BYTEA_ARRAY),
    ("_char", oid::CHAR_ARRAY),
    ("_name", oid::NAME_ARRAY),
    ("_int2", oid::INT2_ARRAY),
    ("_int4", oid::INT4_ARRAY),
    ("_text", oid::TEXT_ARRAY),
    ("_oid", oid::OID_ARRAY),
    ("_bpchar", oid::BPCHAR_ARRAY),
    ("_varchar", oid::VARCHAR_ARRAY),
    ("_int8", oid::INT8_ARRAY),
    ("_point", oid::POINT_ARRAY),
    ("_lseg", oid::LSEG_ARRAY),
    ("_box", oid::BOX_ARRAY),
    ("_float4", oid::FLOAT4_ARRAY),
    ("_float8", oid::FLOAT8_ARRAY),
    ("_circle", oid::CIRCLE_ARRAY),
    ("_money", oid::MONEY_ARRAY),
    ("_date", oid::DATE_ARRAY),
    ("_timestamp", oid::TIMESTAMP_ARRAY),
    ("_timestamptz", oid::TIMESTAMPTZ_ARRAY),
    ("_json", oid::JSON_ARRAY),
    ("_uuid", oid::UUID_ARRAY),
    ("_jsonb", oid::JSONB_ARRAY),
];

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CodecRegistry {
    /// A registry holding only the `unknown` placeholder.
    pub fn empty() -> Self {
        let unknown = Arc::new(Codec::scalar("unknown", oid::UNSPECIFIED, Format::Unknown));
        let mut registry = Self {
            by_oid: HashMap::new(),
            by_name: HashMap::new(),
            arrays: HashMap::new(),
            inference: Vec::new(),
            unknown: unknown.clone(),
        };
        registry.register(unknown);
        registry
    }

    /// A fresh registry with every built-in codec.
    pub fn new() -> Self {
        let mut registry = Self::empty();
        for (name, type_oid, format, shape) in SCALARS {
            let mut codec = Codec::scalar(*name, *type_oid, *format);
            if let Some((shape, priority)) = shape {
                codec = codec.with_shape(*shape, *priority);
            }
            registry.register(codec);
        }
        for (name, array_oid) in ARRAYS {
            let element = array_element_oid(*array_oid).and_then(|e| registry.by_oid.get(&e));
            if let Some(element) = element.cloned() {
                registry.register(Codec::array(*name, *array_oid, element));
            }
        }
        registry
    }

    /// Process-wide default registry. Immutable once built.
    pub fn shared() -> Arc<CodecRegistry> {
        static SHARED: OnceLock<Arc<CodecRegistry>> = OnceLock::new();
        SHARED.get_or_init(|| Arc::new(CodecRegistry::new())).clone()
    }

    /// Register a codec; the last registration for an OID or name wins.
    pub fn register(&mut self, codec: impl Into<Arc<Codec>>) -> Arc<Codec> {
        let codec = codec.into();
        let replaced: Vec<Arc<Codec>> = [
            self.by_oid.get(&codec.oid()),
            self.by_name.get(codec.name()),
        ]
        .into_iter()
        .flatten()
        .cloned()
        .collect();
        if !replaced.is_empty() {
            self.unlink(&replaced);
        }
        self.by_oid.insert(codec.oid(), codec.clone());
        self.by_name.insert(codec.name().to_string(), codec.clone());

        if let Some(element) = codec.element() {
            self.arrays.insert(element.oid(), codec.clone());
            for entry in &mut self.inference {
                if Arc::ptr_eq(&entry.scalar, element) {
                    entry.array = Some(codec.clone());
                }
            }
        } else if let (Some(shape), Some(priority)) = (codec.shape(), codec.priority()) {
            // Stable ascending insert: after the last entry with priority <= ours.
            let at = self
                .inference
                .iter()
                .rposition(|e| e.priority <= priority)
                .map_or(0, |i| i + 1);
            let array = self
                .arrays
                .get(&codec.oid())
                .filter(|a| a.element().is_some_and(|e| Arc::ptr_eq(e, &codec)))
                .cloned();
            self.inference.insert(
                at,
                InferenceEntry {
                    priority,
                    shape,
                    scalar: codec.clone(),
                    array,
                },
            );
        }
        codec
    }

    /// Drop inference entries and array links that point at replaced codecs.
    fn unlink(&mut self, replaced: &[Arc<Codec>]) {
        let is_replaced = |c: &Arc<Codec>| replaced.iter().any(|r| Arc::ptr_eq(r, c));
        self.inference.retain(|e| !is_replaced(&e.scalar));
        for entry in &mut self.inference {
            if entry.array.as_ref().is_some_and(is_replaced) {
                entry.array = None;
            }
        }
        self.arrays.retain(|_, array| !is_replaced(array));
    }

    pub fn get_codec_by_oid(&self, oid: u32) -> Option<&Arc<Codec>> {
        self.by_oid.get(&oid)
    }

    pub fn get_codec_by_name(&self, name: &str) -> Option<&Arc<Codec>> {
        self.by_name.get(name)
    }

    /// Resolve an explicit type hint.
    pub fn get_codec(&self, hint: &TypeHint) -> Result<Arc<Codec>, CodecError> {
        match hint {
            TypeHint::Oid(oid) => self
                .get_codec_by_oid(*oid)
                .cloned()
                .ok_or(CodecError::UnknownOid(*oid)),
            TypeHint::Name(name) => self
                .get_codec_by_name(name)
                .cloned()
                .ok_or_else(|| CodecError::UnknownName(name.clone())),
        }
    }

    /// Codec for a result column; unregistered types decode as raw bytes.
    pub fn column_codec(&self, oid: u32) -> Arc<Codec> {
        self.by_oid
            .get(&oid)
            .cloned()
            .unwrap_or_else(|| self.unknown.clone())
    }

    /// The placeholder codec for server-inferred parameters.
    pub fn unknown(&self) -> &Arc<Codec> {
        &self.unknown
    }

    /// Infer a codec from a host value.
    pub fn determine_codec(&self, value: &Value) -> Result<Arc<Codec>, CodecError> {
        match value {
            Value::Null => Ok(self.unknown.clone()),
            Value::Text(_) => self.builtin(oid::TEXT),
            Value::Bool(_) => self.builtin(oid::BOOL),
            Value::Int(i) => self.builtin(narrowest_int(i128::from(*i), i128::from(*i))),
            Value::BigInt(i) => {
                if i64::try_from(*i).is_ok() {
                    self.builtin(oid::INT8)
                } else {
                    Err(CodecError::Inference(format!("{i} exceeds int8")))
                }
            }
            Value::Float(_) => self.builtin(oid::FLOAT8),
            Value::Array(items) => self.determine_array(items),
            other => self.structural(other).map(|e| e.scalar.clone()),
        }
    }

    /// Validate a value against a codec.
    pub fn test_value(&self, codec: &Codec, value: &Value) -> Result<(), CodecError> {
        codec.check(value)
    }

    fn structural(&self, value: &Value) -> Result<&InferenceEntry, CodecError> {
        self.inference
            .iter()
            .find(|e| e.shape.matches(value))
            .ok_or_else(|| CodecError::Inference(format!("{} value", value.kind())))
    }

    fn builtin(&self, oid: u32) -> Result<Arc<Codec>, CodecError> {
        self.by_oid
            .get(&oid)
            .cloned()
            .ok_or(CodecError::UnknownOid(oid))
    }

    fn array_for(&self, element_oid: u32) -> Result<Arc<Codec>, CodecError> {
        self.arrays
            .get(&element_oid)
            .cloned()
            .ok_or_else(|| CodecError::Inference(format!("no array type for OID {element_oid}")))
    }

    fn determine_array(&self, items: &[Value]) -> Result<Arc<Codec>, CodecError> {
        let mut leaves = Vec::new();
        flatten_leaves(items, &mut leaves);

        let mut range: Option<(i128, i128)> = None;
        let mut has_float = false;
        let mut first_other: Option<&Value> = None;
        for leaf in leaves {
            match leaf {
                Value::Null => {}
                Value::Int(i) => range = Some(widen(range, i128::from(*i))),
                Value::BigInt(i) => range = Some(widen(range, *i)),
                Value::Float(_) => has_float = true,
                other => {
                    first_other.get_or_insert(other);
                }
            }
        }
        let numeric = has_float || range.is_some();

        match (numeric, first_other) {
            (true, Some(other)) => Err(CodecError::Inference(format!(
                "array mixes numbers with {} values",
                other.kind()
            ))),
            (true, None) if has_float => self.array_for(oid::FLOAT8),
            (true, None) => {
                let (min, max) = range.unwrap_or((0, 0));
                if min < i128::from(i64::MIN) || max > i128::from(i64::MAX) {
                    return Err(CodecError::Inference(format!(
                        "array element range {min}..={max} exceeds int8"
                    )));
                }
                self.array_for(narrowest_int(min, max))
            }
            (false, Some(Value::Text(_))) => self.array_for(oid::TEXT),
            (false, Some(Value::Bool(_))) => self.array_for(oid::BOOL),
            (false, Some(other)) => {
                let entry = self.structural(other)?;
                entry.array.clone().ok_or_else(|| {
                    CodecError::Inference(format!("no array type for {}", entry.scalar.name()))
                })
            }
            (false, None) => self.array_for(oid::TEXT),
        }
    }
}

fn widen(range: Option<(i128, i128)>, n: i128) -> (i128, i128) {
    match range {
        Some((min, max)) => (min.min(n), max.max(n)),
        None => (n, n),
    }
}

/// Narrowest integer OID whose range holds `min..=max`.
fn narrowest_int(min: i128, max: i128) -> u32 {
    if min >= i128::from(i16::MIN) && max <= i128::from(i16::MAX) {
        oid::INT2
    } else if min >= i128::from(i32::MIN) && max <= i128::from(i32::MAX) {
        oid::INT4
    } else {
        oid::INT8
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Money, Point, Timestamp};
    use pretty_assertions::assert_eq;

    fn name_of(registry: &CodecRegistry, value: Value) -> String {
        registry.determine_codec(&value).unwrap().name().to_string()
    }

    #[test]
    fn test_determine_scalars() {
        let r = CodecRegistry::new();
        assert_eq!(name_of(&r, Value::Int(100)), "int2");
        assert_eq!(name_of(&r, Value::Int(100_000)), "int4");
        assert_eq!(name_of(&r, Value::Int(5_000_000_000)), "int8");
        assert_eq!(name_of(&r, Value::Float(1.5)), "float8");
        assert_eq!(name_of(&r, Value::Float(3.0)), "float8");
        assert_eq!(name_of(&r, Value::Text("x".into())), "text");
        assert_eq!(name_of(&r, Value::Bool(true)), "bool");
        assert_eq!(name_of(&r, Value::Null), "unknown");
        assert_eq!(name_of(&r, Value::BigInt(9_007_199_254_740_993)), "int8");
        assert!(matches!(
            r.determine_codec(&Value::BigInt(i128::from(i64::MAX) + 1)),
            Err(CodecError::Inference(_))
        ));
    }

    #[test]
    fn test_determine_structural() {
        let r = CodecRegistry::new();
        assert_eq!(name_of(&r, Value::Bytes(vec![1])), "bytea");
        assert_eq!(
            name_of(&r, Value::Timestamp(Timestamp::from_pg_usec(0))),
            "timestamptz"
        );
        assert_eq!(name_of(&r, Value::Money(Money::from_cents(1))), "money");
        assert_eq!(name_of(&r, Value::Point(Point::new(0.0, 0.0))), "point");
        assert_eq!(name_of(&r, Value::Json(serde_json::json!({}))), "jsonb");
        assert_eq!(
            name_of(&r, Value::Uuid("550e8400-e29b-41d4-a716-446655440000".into())),
            "uuid"
        );
        assert!(r.determine_codec(&Value::Uuid("bad".into())).is_err());
    }

    #[test]
    fn test_determine_arrays() {
        let r = CodecRegistry::new();
        assert_eq!(name_of(&r, Value::from(vec![1, 2, 100_000])), "_int4");
        assert_eq!(name_of(&r, Value::from(vec![1, 2])), "_int2");
        assert_eq!(name_of(&r, Value::Array(vec![])), "_text");
        assert_eq!(name_of(&r, Value::Array(vec![Value::Null])), "_text");
        assert_eq!(
            name_of(&r, Value::Array(vec![Value::Int(1), Value::Float(0.5)])),
            "_float8"
        );
        assert_eq!(
            name_of(&r, Value::Array(vec![Value::Null, Value::Bytes(vec![])])),
            "_bytea"
        );
        assert_eq!(
            name_of(
                &r,
                Value::Array(vec![
                    Value::Array(vec![Value::Int(1)]),
                    Value::Array(vec![Value::Int(70_000), Value::Int(2)]),
                ])
            ),
            "_int4"
        );
        assert!(matches!(
            r.determine_codec(&Value::Array(vec![Value::Int(1), Value::Text("x".into())])),
            Err(CodecError::Inference(_))
        ));
    }

    #[test]
    fn test_priority_order_is_stable() {
        let mut r = CodecRegistry::empty();
        r.register(Codec::scalar("late_json", 90_001, Format::Json).with_shape(Shape::Json, Some(5)));
        r.register(Codec::scalar("first_json", 90_002, Format::Json).with_shape(Shape::Json, Some(1)));
        r.register(Codec::scalar("tie_json", 90_003, Format::Json).with_shape(Shape::Json, Some(1)));
        let json = Value::Json(serde_json::json!([1]));
        assert_eq!(name_of(&r, json), "first_json");

        let order: Vec<_> = r.inference.iter().map(|e| e.scalar.name()).collect();
        assert_eq!(order, vec!["first_json", "tie_json", "late_json"]);
    }

    #[test]
    fn test_null_priority_not_inferred() {
        let r = CodecRegistry::new();
        assert!(r.get_codec_by_name("json").is_some());
        assert!(r.inference.iter().all(|e| e.scalar.name() != "json"));
        assert!(r.inference.iter().all(|e| e.scalar.name() != "timestamp"));
    }

    #[test]
    fn test_array_linked_by_identity() {
        let mut r = CodecRegistry::empty();
        let money = r.register(
            Codec::scalar("money", oid::MONEY, Format::Money).with_shape(Shape::Money, Some(50)),
        );
        r.register(Codec::array("_money", oid::MONEY_ARRAY, money));
        let arr = Value::Array(vec![Value::Money(Money::from_cents(3))]);
        assert_eq!(name_of(&r, arr), "_money");
    }

    #[test]
    fn test_custom_codec_last_wins() {
        let mut r = CodecRegistry::new();
        r.register(Codec::scalar("citext", 50_000, Format::Text));
        assert_eq!(r.get_codec(&TypeHint::from("citext")).unwrap().oid(), 50_000);
        assert_eq!(r.get_codec(&TypeHint::Oid(50_000)).unwrap().name(), "citext");
        assert!(matches!(
            r.get_codec(&TypeHint::Oid(42)),
            Err(CodecError::UnknownOid(42))
        ));
        r.register(Codec::scalar("citext2", 50_000, Format::Text));
        assert_eq!(r.get_codec_by_oid(50_000).unwrap().name(), "citext2");
    }

    #[test]
    fn test_reregistered_structural_codec_wins_inference() {
        let mut r = CodecRegistry::new();
        let replacement = r.register(
            Codec::scalar("money", oid::MONEY, Format::Money).with_shape(Shape::Money, Some(50)),
        );
        let cents = Value::Money(Money::from_cents(250));
        let inferred = r.determine_codec(&cents).unwrap();
        assert!(Arc::ptr_eq(&inferred, &replacement));
        assert!(Arc::ptr_eq(r.get_codec_by_oid(oid::MONEY).unwrap(), &inferred));
        assert_eq!(r.inference.iter().filter(|e| e.scalar.name() == "money").count(), 1);

        // The old `_money` pointed at the replaced scalar; arrays need a fresh link.
        let arr = Value::Array(vec![cents]);
        assert!(r.determine_codec(&arr).is_err());
        let arrays = r.register(Codec::array("_money", oid::MONEY_ARRAY, replacement));
        assert!(Arc::ptr_eq(&r.determine_codec(&arr).unwrap(), &arrays));
    }

    #[test]
    fn test_test_value() {
        let r = CodecRegistry::new();
        let int8 = r.get_codec_by_name("int8").unwrap();
        assert!(r.test_value(int8, &Value::BigInt(i128::from(i64::MAX))).is_ok());
        assert!(r.test_value(int8, &Value::BigInt(i128::from(i64::MAX) + 1)).is_err());
        let ints = r.get_codec_by_name("_int2").unwrap();
        assert!(r.test_value(ints, &Value::from(vec![1, 2])).is_ok());
        assert!(r.test_value(ints, &Value::from(vec![1, 100_000])).is_err());
    }
}
