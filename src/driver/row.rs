//! Decoded rows and their column metadata.

use crate::codec::{Timestamp, Value};
use crate::protocol::FieldDescription;
use std::collections::HashMap;
use std::sync::Arc;

/// Column metadata shared by every row of a result.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ColumnInfo {
    pub fields: Vec<FieldDescription>,
    name_to_index: HashMap<String, usize>,
}

impl ColumnInfo {
    pub fn from_fields(fields: Vec<FieldDescription>) -> Self {
        let mut name_to_index = HashMap::with_capacity(fields.len());
        for (i, field) in fields.iter().enumerate() {
            // First column wins for duplicate names, as in `SELECT a.id, b.id`
            name_to_index.entry(field.name.clone()).or_insert(i);
        }
        Self {
            fields,
            name_to_index,
        }
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.name_to_index.get(name).copied()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.name.as_str())
    }

    pub fn oids(&self) -> impl Iterator<Item = u32> + '_ {
        self.fields.iter().map(|f| f.type_oid)
    }
}

/// PostgreSQL row with decoded values and shared metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct PgRow {
    pub values: Vec<Value>,
    pub columns: Arc<ColumnInfo>,
}

impl PgRow {
    pub fn new(values: Vec<Value>, columns: Arc<ColumnInfo>) -> Self {
        Self { values, columns }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, idx: usize) -> Option<&Value> {
        self.values.get(idx)
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.index_of(name)
    }

    pub fn get_by_name(&self, name: &str) -> Option<&Value> {
        self.get(self.column_index(name)?)
    }

    /// Check if a column is NULL. Missing columns count as NULL.
    pub fn is_null(&self, idx: usize) -> bool {
        self.get(idx).is_none_or(Value::is_null)
    }

    pub fn get_string(&self, idx: usize) -> Option<String> {
        match self.get(idx)? {
            Value::Text(s) | Value::Uuid(s) => Some(s.clone()),
            Value::Json(json) => Some(json.to_string()),
            _ => None,
        }
    }

    pub fn get_str(&self, idx: usize) -> Option<&str> {
        self.get(idx)?.as_str()
    }

    pub fn get_i64(&self, idx: usize) -> Option<i64> {
        self.get(idx)?.as_i64()
    }

    pub fn get_i32(&self, idx: usize) -> Option<i32> {
        i32::try_from(self.get_i64(idx)?).ok()
    }

    pub fn get_f64(&self, idx: usize) -> Option<f64> {
        self.get(idx)?.as_f64()
    }

    pub fn get_bool(&self, idx: usize) -> Option<bool> {
        self.get(idx)?.as_bool()
    }

    pub fn get_bytes(&self, idx: usize) -> Option<&[u8]> {
        self.get(idx)?.as_bytes()
    }

    pub fn get_json(&self, idx: usize) -> Option<&serde_json::Value> {
        self.get(idx)?.as_json()
    }

    pub fn get_timestamp(&self, idx: usize) -> Option<Timestamp> {
        match self.get(idx)? {
            Value::Timestamp(ts) => Some(*ts),
            _ => None,
        }
    }

    pub fn get_array(&self, idx: usize) -> Option<&[Value]> {
        self.get(idx)?.as_array()
    }

    /// Integer array elements; NULL elements are skipped.
    pub fn get_int_array(&self, idx: usize) -> Option<Vec<i64>> {
        Some(
            self.get_array(idx)?
                .iter()
                .filter_map(Value::as_i64)
                .collect(),
        )
    }

    pub fn get_text_array(&self, idx: usize) -> Option<Vec<String>> {
        Some(
            self.get_array(idx)?
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
        )
    }

    #[cfg(feature = "uuid")]
    pub fn get_uuid(&self, idx: usize) -> Option<uuid::Uuid> {
        match self.get(idx)? {
            Value::Uuid(s) => uuid::Uuid::parse_str(s).ok(),
            _ => None,
        }
    }

    #[cfg(feature = "chrono")]
    pub fn get_datetime(&self, idx: usize) -> Option<chrono::DateTime<chrono::Utc>> {
        self.get_timestamp(idx)?.to_datetime()
    }

    pub fn get_string_by_name(&self, name: &str) -> Option<String> {
        self.get_string(self.column_index(name)?)
    }

    pub fn get_str_by_name(&self, name: &str) -> Option<&str> {
        self.get_str(self.column_index(name)?)
    }

    pub fn get_i64_by_name(&self, name: &str) -> Option<i64> {
        self.get_i64(self.column_index(name)?)
    }

    pub fn get_f64_by_name(&self, name: &str) -> Option<f64> {
        self.get_f64(self.column_index(name)?)
    }

    pub fn get_bool_by_name(&self, name: &str) -> Option<bool> {
        self.get_bool(self.column_index(name)?)
    }

    pub fn get_json_by_name(&self, name: &str) -> Option<&serde_json::Value> {
        self.get_json(self.column_index(name)?)
    }

    pub fn is_null_by_name(&self, name: &str) -> bool {
        self.column_index(name).is_none_or(|idx| self.is_null(idx))
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::oid;

    fn field(name: &str, type_oid: u32) -> FieldDescription {
        FieldDescription {
            name: name.to_string(),
            table_oid: 0,
            column_attr: 0,
            type_oid,
            type_size: -1,
            type_modifier: -1,
            format: 1,
        }
    }

    fn sample() -> PgRow {
        let columns = Arc::new(ColumnInfo::from_fields(vec![
            field("id", oid::INT8),
            field("name", oid::TEXT),
            field("active", oid::BOOL),
            field("tags", oid::TEXT_ARRAY),
            field("id", oid::INT4),
        ]));
        PgRow::new(
            vec![
                Value::Int(7),
                Value::Text("ada".into()),
                Value::Null,
                Value::Array(vec!["a".into(), Value::Null, "b".into()]),
                Value::Int(8),
            ],
            columns,
        )
    }

    #[test]
    fn test_getters_by_index_and_name() {
        let row = sample();
        assert_eq!(row.get_i64(0), Some(7));
        assert_eq!(row.get_i32(0), Some(7));
        assert_eq!(row.get_str(1), Some("ada"));
        assert_eq!(row.get_string_by_name("name").as_deref(), Some("ada"));
        assert_eq!(row.get_bool(2), None);
        assert!(row.is_null(2));
        assert!(row.is_null(99));
        assert!(row.is_null_by_name("missing"));
        assert_eq!(
            row.get_text_array(3),
            Some(vec!["a".to_string(), "b".to_string()])
        );
    }

    #[test]
    fn test_duplicate_names_resolve_to_first() {
        let row = sample();
        assert_eq!(row.column_index("id"), Some(0));
        assert_eq!(row.get_i64_by_name("id"), Some(7));
        assert_eq!(row.columns.oids().collect::<Vec<_>>()[4], oid::INT4);
    }
}
