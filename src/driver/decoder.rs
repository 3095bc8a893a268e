//! Row decoders, cached per column signature.
//!
//! A decoder built for `(name, oid)` columns either runs a compiled plan of
//! inlined per-column ops or falls back to dispatching through each column's
//! [`Codec::decode`]. When a plan fails on data its column codec accepts, the
//! owning cache turns compiled plans off for good and forgets every entry.

use super::row::{ColumnInfo, PgRow};
use super::{PgError, PgResult};
use crate::codec::{Codec, CodecRegistry, Format, Value};
use crate::protocol::{DataRow, FieldDescription};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// One step of a compiled plan.
#[derive(Debug, Clone)]
enum ColumnOp {
    Bool,
    Int2,
    Int4,
    Int8,
    Float4,
    Float8,
    Text,
    Bytes,
    Codec(Arc<Codec>),
}

impl ColumnOp {
    fn for_codec(codec: &Arc<Codec>) -> Self {
        match codec.format() {
            Format::Bool => ColumnOp::Bool,
            Format::Int2 => ColumnOp::Int2,
            Format::Int4 => ColumnOp::Int4,
            Format::Int8 => ColumnOp::Int8,
            Format::Float4 => ColumnOp::Float4,
            Format::Float8 => ColumnOp::Float8,
            Format::Text => ColumnOp::Text,
            Format::Bytea | Format::Unknown => ColumnOp::Bytes,
            _ => ColumnOp::Codec(codec.clone()),
        }
    }
}

/// A plan step could not run; the plan no longer fits the data.
#[derive(Debug)]
struct PlanMismatch {
    column: usize,
}

/// Decoder for one column signature.
#[derive(Debug)]
pub struct RowDecoder {
    columns: Arc<ColumnInfo>,
    codecs: Vec<Arc<Codec>>,
    plan: Option<Vec<ColumnOp>>,
}

impl RowDecoder {
    pub fn new(fields: Vec<FieldDescription>, registry: &CodecRegistry, compiled: bool) -> Self {
        let codecs: Vec<Arc<Codec>> = fields
            .iter()
            .map(|f| registry.column_codec(f.type_oid))
            .collect();
        let plan = compiled.then(|| codecs.iter().map(ColumnOp::for_codec).collect());
        Self {
            columns: Arc::new(ColumnInfo::from_fields(fields)),
            codecs,
            plan,
        }
    }

    pub fn columns(&self) -> &Arc<ColumnInfo> {
        &self.columns
    }

    pub fn codecs(&self) -> &[Arc<Codec>] {
        &self.codecs
    }

    pub fn is_compiled(&self) -> bool {
        self.plan.is_some()
    }

    fn check_width(&self, row: &DataRow<'_>) -> PgResult<()> {
        if row.len() != self.codecs.len() {
            return Err(PgError::Protocol(format!(
                "DataRow has {} columns, RowDescription declared {}",
                row.len(),
                self.codecs.len()
            )));
        }
        Ok(())
    }

    /// Decode through each column codec.
    pub fn decode_generic(&self, row: &DataRow<'_>) -> PgResult<PgRow> {
        self.check_width(row)?;
        let mut values = Vec::with_capacity(self.codecs.len());
        for (field, codec) in row.fields().zip(&self.codecs) {
            let value = match field.map_err(PgError::Protocol)? {
                Some(bytes) => codec.decode(bytes)?,
                None => Value::Null,
            };
            values.push(value);
        }
        Ok(PgRow::new(values, self.columns.clone()))
    }

    /// Run the compiled plan. `Ok(Err(_))` means the plan itself is unusable.
    fn decode_compiled(
        &self,
        plan: &[ColumnOp],
        row: &DataRow<'_>,
    ) -> PgResult<Result<PgRow, PlanMismatch>> {
        self.check_width(row)?;
        let mut values = Vec::with_capacity(plan.len());
        for (column, (field, op)) in row.fields().zip(plan).enumerate() {
            let Some(bytes) = field.map_err(PgError::Protocol)? else {
                values.push(Value::Null);
                continue;
            };
            let value = match op {
                ColumnOp::Bool => match bytes {
                    [b] => Value::Bool(*b != 0),
                    _ => return Ok(Err(PlanMismatch { column })),
                },
                ColumnOp::Int2 => match <[u8; 2]>::try_from(bytes) {
                    Ok(b) => Value::Int(i16::from_be_bytes(b).into()),
                    Err(_) => return Ok(Err(PlanMismatch { column })),
                },
                ColumnOp::Int4 => match <[u8; 4]>::try_from(bytes) {
                    Ok(b) => Value::Int(i32::from_be_bytes(b).into()),
                    Err(_) => return Ok(Err(PlanMismatch { column })),
                },
                ColumnOp::Int8 => match <[u8; 8]>::try_from(bytes) {
                    Ok(b) => Value::Int(i64::from_be_bytes(b)),
                    Err(_) => return Ok(Err(PlanMismatch { column })),
                },
                ColumnOp::Float4 => match <[u8; 4]>::try_from(bytes) {
                    Ok(b) => Value::Float(f32::from_be_bytes(b).into()),
                    Err(_) => return Ok(Err(PlanMismatch { column })),
                },
                ColumnOp::Float8 => match <[u8; 8]>::try_from(bytes) {
                    Ok(b) => Value::Float(f64::from_be_bytes(b)),
                    Err(_) => return Ok(Err(PlanMismatch { column })),
                },
                ColumnOp::Text => match std::str::from_utf8(bytes) {
                    Ok(s) => Value::Text(s.to_string()),
                    Err(_) => self.codecs[column].decode(bytes)?,
                },
                ColumnOp::Bytes => Value::Bytes(bytes.to_vec()),
                ColumnOp::Codec(codec) => codec.decode(bytes)?,
            };
            values.push(value);
        }
        Ok(Ok(PgRow::new(values, self.columns.clone())))
    }
}

type Signature = Vec<(String, u32)>;

/// Decoders keyed by ordered `(field name, type oid)` lists.
#[derive(Debug)]
pub struct RowDecoderCache {
    compiled_enabled: AtomicBool,
    decoders: Mutex<HashMap<Signature, Arc<RowDecoder>>>,
}

impl RowDecoderCache {
    pub fn new(compiled: bool) -> Self {
        Self {
            compiled_enabled: AtomicBool::new(compiled),
            decoders: Mutex::new(HashMap::new()),
        }
    }

    pub fn compiled_enabled(&self) -> bool {
        self.compiled_enabled.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.decoders.lock().map(|d| d.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Return the shared decoder for these columns, building it on first use.
    pub fn get_or_build(
        &self,
        fields: Vec<FieldDescription>,
        registry: &CodecRegistry,
    ) -> Arc<RowDecoder> {
        let key: Signature = fields.iter().map(|f| (f.name.clone(), f.type_oid)).collect();
        let Ok(mut decoders) = self.decoders.lock() else {
            return Arc::new(RowDecoder::new(fields, registry, false));
        };
        decoders
            .entry(key)
            .or_insert_with(|| {
                tracing::debug!("Building row decoder for {} columns", fields.len());
                Arc::new(RowDecoder::new(fields, registry, self.compiled_enabled()))
            })
            .clone()
    }

    /// Decode a row with the compiled plan while it is enabled, else generically.
    ///
    /// A plan mismatch is retried generically. Only when the generic codecs
    /// accept the row is the plan at fault; otherwise the data is bad and the
    /// error is returned with compiled plans left on.
    pub fn decode(&self, decoder: &RowDecoder, row: &DataRow<'_>) -> PgResult<PgRow> {
        if let Some(plan) = decoder.plan.as_deref().filter(|_| self.compiled_enabled()) {
            match decoder.decode_compiled(plan, row)? {
                Ok(decoded) => return Ok(decoded),
                Err(PlanMismatch { column }) => {
                    let decoded = decoder.decode_generic(row)?;
                    self.disable_compiled(column);
                    return Ok(decoded);
                }
            }
        }
        decoder.decode_generic(row)
    }

    fn disable_compiled(&self, column: usize) {
        if self.compiled_enabled.swap(false, Ordering::AcqRel) {
            tracing::warn!(
                "Compiled row decoding failed at column {}; using generic decoders from now on",
                column
            );
            if let Ok(mut decoders) = self.decoders.lock() {
                decoders.clear();
            }
        }
    }
}

impl Default for RowDecoderCache {
    fn default() -> Self {
        Self::new(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{BackendMessage, oid};

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

    fn data_row_body(fields: &[Option<&[u8]>]) -> Vec<u8> {
        let mut body = (fields.len() as i16).to_be_bytes().to_vec();
        for field in fields {
            match field {
                Some(bytes) => {
                    body.extend_from_slice(&(bytes.len() as i32).to_be_bytes());
                    body.extend_from_slice(bytes);
                }
                None => body.extend_from_slice(&(-1i32).to_be_bytes()),
            }
        }
        body
    }

    fn with_row<T>(fields: &[Option<&[u8]>], f: impl FnOnce(&DataRow<'_>) -> T) -> T {
        let body = data_row_body(fields);
        match BackendMessage::decode(b'D', &body).unwrap() {
            BackendMessage::DataRow(row) => f(&row),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_identical_signatures_share_decoder() {
        let registry = CodecRegistry::new();
        let cache = RowDecoderCache::default();
        let a = cache.get_or_build(vec![field("id", oid::INT4), field("n", oid::TEXT)], &registry);
        let b = cache.get_or_build(vec![field("id", oid::INT4), field("n", oid::TEXT)], &registry);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 1);

        let c = cache.get_or_build(vec![field("id", oid::INT8), field("n", oid::TEXT)], &registry);
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_compiled_and_generic_agree() {
        let registry = CodecRegistry::new();
        let fields = vec![
            field("id", oid::INT8),
            field("name", oid::TEXT),
            field("ok", oid::BOOL),
            field("tags", oid::UUID),
        ];
        let compiled = RowDecoder::new(fields.clone(), &registry, true);
        let generic = RowDecoder::new(fields, &registry, false);
        assert!(compiled.is_compiled());
        assert!(!generic.is_compiled());

        let cache = RowDecoderCache::default();
        let uuid = [0xabu8; 16];
        with_row(
            &[Some(&42i64.to_be_bytes()[..]), Some(&b"ada"[..]), None, Some(&uuid[..])],
            |row| {
                let a = cache.decode(&compiled, row).unwrap();
                let b = generic.decode_generic(row).unwrap();
                assert_eq!(a.values, b.values);
                assert_eq!(a.get_i64(0), Some(42));
                assert!(a.is_null(2));
            },
        );
        assert!(cache.compiled_enabled());
    }

    #[test]
    fn test_bad_data_keeps_compiled_path() {
        let registry = CodecRegistry::new();
        let cache = RowDecoderCache::default();
        let decoder = cache.get_or_build(
            vec![field("name", oid::TEXT), field("n", oid::INT4)],
            &registry,
        );
        assert!(decoder.is_compiled());

        let bad_text = with_row(&[Some(&[0xffu8, 0xfe][..]), None], |row| {
            cache.decode(&decoder, row)
        });
        assert!(matches!(bad_text, Err(PgError::Codec(_))));
        let bad_width = with_row(&[None, Some(&[0u8, 1][..])], |row| cache.decode(&decoder, row));
        assert!(matches!(bad_width, Err(PgError::Codec(_))));

        assert!(cache.compiled_enabled());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_plan_mismatch_disables_compiled_path() {
        let registry = CodecRegistry::new();
        let cache = RowDecoderCache::default();
        let fields = vec![field("n", oid::INT8)];
        cache.get_or_build(fields.clone(), &registry);
        // A plan that disagrees with its column codec.
        let stale = RowDecoder {
            plan: Some(vec![ColumnOp::Int4]),
            ..RowDecoder::new(fields.clone(), &registry, false)
        };

        let row = with_row(&[Some(&7i64.to_be_bytes()[..])], |row| cache.decode(&stale, row));
        assert_eq!(row.unwrap().get_i64(0), Some(7));
        assert!(!cache.compiled_enabled());
        assert!(cache.is_empty());

        let rebuilt = cache.get_or_build(fields, &registry);
        assert!(!rebuilt.is_compiled());
        let row = with_row(&[Some(&8i64.to_be_bytes()[..])], |row| cache.decode(&rebuilt, row));
        assert_eq!(row.unwrap().get_i64(0), Some(8));
    }

    #[test]
    fn test_column_count_mismatch() {
        let registry = CodecRegistry::new();
        let decoder = RowDecoder::new(vec![field("a", oid::INT4)], &registry, true);
        let cache = RowDecoderCache::default();
        let result = with_row(&[None, None], |row| cache.decode(&decoder, row));
        assert!(matches!(result, Err(PgError::Protocol(_))));
    }
}
