//! Query submission over the extended protocol.
//!
//! Every query uses the unnamed statement and portal. When all parameter
//! codecs are known the whole Parse/Bind/Describe/Execute/Sync batch goes out
//! at once. Otherwise the statement is described first and Bind follows once
//! the server has named the parameter types; the write lock stays held across
//! that round trip so later queries cannot overtake it on the wire. All writes
//! for a query run in a spawned task that owns the write lock, so cancelling
//! a caller never leaves a partial batch or an orphaned queue entry.

use super::config::ParamInference;
use super::connection::{Connection, Shared, Writer};
use super::decoder::RowDecoder;
use super::response::PendingQuery;
use super::row::{ColumnInfo, PgRow};
use super::{PgError, PgResult};
use crate::codec::registry::TypeHint;
use crate::codec::{Codec, CodecError, Value};
use crate::protocol::{Target, parse_affected_rows, parse_command};
use std::sync::Arc;
use tokio::sync::{OwnedMutexGuard, oneshot};

/// A query parameter, optionally pinned to a codec.
#[derive(Debug, Clone)]
pub enum Param {
    Value(Value),
    Bound(Value, Arc<Codec>),
}

impl Param {
    pub fn value(&self) -> &Value {
        match self {
            Param::Value(v) | Param::Bound(v, _) => v,
        }
    }
}

impl<T: Into<Value>> From<T> for Param {
    fn from(value: T) -> Self {
        Param::Value(value.into())
    }
}

/// Pin a parameter to a codec, skipping inference.
pub fn bind_param(value: impl Into<Value>, codec: &Arc<Codec>) -> Param {
    Param::Bound(value.into(), codec.clone())
}

/// Build a `Vec<Param>` from heterogeneous values.
///
/// ```ignore
/// conn.query("SELECT $1::int4 + $2", params![1, 2]).await?;
/// ```
#[macro_export]
macro_rules! params {
    () => {
        ::std::vec::Vec::<$crate::driver::Param>::new()
    };
    ($($param:expr),+ $(,)?) => {
        ::std::vec![$($crate::driver::Param::from($param)),+]
    };
}

/// Per-call options.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Explicit types by parameter position; `None` entries fall back to inference.
    pub param_types: Vec<Option<TypeHint>>,
    /// Overrides the connection's inference mode.
    pub inference: Option<ParamInference>,
}

impl QueryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the type of parameter `index` (0-based).
    pub fn param_type(mut self, index: usize, hint: impl Into<TypeHint>) -> Self {
        if self.param_types.len() <= index {
            self.param_types.resize(index + 1, None);
        }
        self.param_types[index] = Some(hint.into());
        self
    }

    pub fn inference(mut self, mode: ParamInference) -> Self {
        self.inference = Some(mode);
        self
    }
}

/// Outcome of one query.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult {
    /// Command word of the completion tag, e.g. `INSERT` or `CREATE TABLE`.
    pub command: String,
    pub row_count: u64,
    pub rows: Vec<PgRow>,
    pub fields: Arc<ColumnInfo>,
}

impl QueryResult {
    pub(crate) fn new(tag: &str, rows: Vec<PgRow>, fields: Arc<ColumnInfo>) -> Self {
        Self {
            command: parse_command(tag).to_string(),
            row_count: parse_affected_rows(tag),
            rows,
            fields,
        }
    }
}

/// Cache key: SQL text plus resolved parameter OIDs (0 where unknown).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct DescriptionKey {
    pub(crate) sql: String,
    pub(crate) param_oids: Vec<u32>,
}

/// What the server has told us about one statement shape.
#[derive(Debug, Clone, Default)]
pub(crate) struct CachedDescription {
    pub(crate) param_codecs: Option<Vec<Arc<Codec>>>,
    pub(crate) row_decoder: Option<Arc<RowDecoder>>,
}

impl Connection {
    /// Run a query with value-inferred (or pinned) parameter types.
    pub async fn query(&self, sql: &str, params: Vec<Param>) -> PgResult<QueryResult> {
        self.query_with(sql, params, &QueryOptions::default()).await
    }

    /// Run a statement and return the affected row count.
    pub async fn execute(&self, sql: &str, params: Vec<Param>) -> PgResult<u64> {
        Ok(self.query(sql, params).await?.row_count)
    }

    pub async fn query_with(
        &self,
        sql: &str,
        params: Vec<Param>,
        options: &QueryOptions,
    ) -> PgResult<QueryResult> {
        let shared = &self.shared;
        let inference = options.inference.unwrap_or(shared.param_inference);

        let mut values = Vec::with_capacity(params.len());
        let mut codecs = Vec::with_capacity(params.len());
        for (index, param) in params.into_iter().enumerate() {
            let (value, codec) = match param {
                Param::Bound(value, codec) => (value, Some(codec)),
                Param::Value(value) => {
                    let codec = match options.param_types.get(index).and_then(Option::as_ref) {
                        Some(hint) => Some(shared.registry.get_codec(hint)?),
                        None if inference == ParamInference::Value => {
                            Some(shared.registry.determine_codec(&value)?)
                        }
                        None => None,
                    };
                    (value, codec)
                }
            };
            if let Some(codec) = &codec {
                shared.registry.test_value(codec, &value)?;
            }
            values.push(value);
            codecs.push(codec);
        }

        let key = Arc::new(DescriptionKey {
            sql: sql.to_string(),
            param_oids: codecs
                .iter()
                .map(|c| c.as_ref().map_or(0, |c| c.oid()))
                .collect(),
        });

        let writer = shared.writer.clone().lock_owned().await;
        let (key, cached) = {
            let mut state = shared.state()?;
            state.check_open()?;
            match state.descriptions.get_key_value(&key) {
                Some((key, cached)) => (key.clone(), cached.clone()),
                None => {
                    tracing::debug!("Caching description for {:?}", key.sql);
                    state.descriptions.insert(key.clone(), CachedDescription::default());
                    (key, CachedDescription::default())
                }
            }
        };

        // Fill unknown slots from an earlier server description.
        if let Some(described) = &cached.param_codecs {
            for ((slot, value), described) in codecs.iter_mut().zip(&values).zip(described) {
                if slot.is_none() {
                    shared.registry.test_value(described, value)?;
                    *slot = Some(described.clone());
                }
            }
        }

        // From the first byte written the query runs in its own task; dropping
        // this future only abandons the reply.
        let writes = tokio::spawn(write_query(shared.clone(), writer, key, cached, values, codecs));
        let reply = writes.await.map_err(|e| {
            PgError::ConnectionClosed(format!("Query writer stopped: {}", e))
        })??;
        await_reply(reply).await
    }
}

type Reply = oneshot::Receiver<PgResult<QueryResult>>;

/// Write one query while holding the writer, returning where its result will arrive.
async fn write_query(
    shared: Arc<Shared>,
    mut writer: OwnedMutexGuard<Writer>,
    key: Arc<DescriptionKey>,
    cached: CachedDescription,
    values: Vec<Value>,
    codecs: Vec<Option<Arc<Codec>>>,
) -> PgResult<Reply> {
    match codecs.into_iter().collect::<Option<Vec<_>>>() {
        Some(codecs) => {
            tracing::trace!("Fast path for {:?}", key.sql);
            fast_path(&shared, &mut writer, key, &cached, &values, &codecs).await
        }
        None => {
            tracing::debug!("Describing parameters of {:?}", key.sql);
            slow_path(&shared, &mut writer, key, &values).await
        }
    }
}

/// Queue the query, then send the batch already in the builder.
async fn submit(
    shared: &Shared,
    writer: &mut Writer,
    pending: PendingQuery,
) -> PgResult<()> {
    {
        let mut state = shared.state()?;
        state.check_open()?;
        state.queue.push_back(pending);
    }
    if let Err(err) = writer.flush().await {
        shared.fail_writes(&err);
        return Err(err);
    }
    Ok(())
}

async fn await_reply(reply: Reply) -> PgResult<QueryResult> {
    reply.await.unwrap_or_else(|_| {
        Err(PgError::ConnectionClosed(
            "Connection closed before the query completed".to_string(),
        ))
    })
}

async fn fast_path(
    shared: &Shared,
    writer: &mut Writer,
    key: Arc<DescriptionKey>,
    cached: &CachedDescription,
    values: &[Value],
    codecs: &[Arc<Codec>],
) -> PgResult<Reply> {
    let mark = writer.builder.mark();
    let built = (|| {
        let builder = &mut writer.builder;
        builder.parse("", &key.sql, &key.param_oids)?;
        builder.bind("", "", values, codecs)?;
        if cached.row_decoder.is_none() {
            builder.describe(Target::Portal, "")?;
        }
        builder.execute("", 0)?;
        builder.sync()
    })();
    if let Err(err) = built {
        writer.builder.rollback_to(mark);
        return Err(err.into());
    }

    let (tx, rx) = oneshot::channel();
    let pending = PendingQuery::new(key, cached.row_decoder.clone(), None, tx);
    submit(shared, writer, pending).await?;
    Ok(rx)
}

/// Parse/Describe/Flush, wait for the parameter types, then Bind/Execute/Sync.
/// The writer stays held throughout so nothing else reaches the wire in between.
async fn slow_path(
    shared: &Shared,
    writer: &mut Writer,
    key: Arc<DescriptionKey>,
    values: &[Value],
) -> PgResult<Reply> {
    let mark = writer.builder.mark();
    let built = (|| {
        let builder = &mut writer.builder;
        builder.parse("", &key.sql, &key.param_oids)?;
        builder.describe(Target::Statement, "")?;
        builder.flush()
    })();
    if let Err(err) = built {
        writer.builder.rollback_to(mark);
        return Err(err.into());
    }

    let (tx, rx) = oneshot::channel();
    let (describe_tx, describe_rx) = oneshot::channel();
    let pending = PendingQuery::new(key.clone(), None, Some(describe_tx), tx);
    submit(shared, writer, pending).await?;

    let param_oids = match describe_rx.await {
        Ok(oids) => oids,
        Err(_) => {
            // Parse failed (or the connection died): resynchronize and collect the error.
            if shared.state()?.closed.is_none() {
                writer.builder.sync()?;
                if let Err(err) = writer.flush().await {
                    shared.fail_writes(&err);
                }
            }
            return Ok(rx);
        }
    };

    let mark = writer.builder.mark();
    if let Err(err) = bind_described(shared, writer, &key, values, &param_oids) {
        // The server is waiting for Bind; a lone Sync closes the exchange cleanly.
        // The query still completes on the wire but its outcome is superseded.
        writer.builder.rollback_to(mark);
        writer.builder.sync()?;
        if let Err(write_err) = writer.flush().await {
            shared.fail_writes(&write_err);
        }
        return Err(err);
    }
    if let Err(err) = writer.flush().await {
        shared.fail_writes(&err);
        return Err(err);
    }
    Ok(rx)
}

/// Resolve described parameter types, cache them and write Bind/Execute/Sync.
fn bind_described(
    shared: &Shared,
    writer: &mut Writer,
    key: &Arc<DescriptionKey>,
    values: &[Value],
    param_oids: &[u32],
) -> PgResult<()> {
    if param_oids.len() != values.len() {
        return Err(CodecError::ParamCount {
            expected: param_oids.len(),
            actual: values.len(),
        }
        .into());
    }
    let mut codecs = Vec::with_capacity(values.len());
    for ((oid, value), known) in param_oids.iter().zip(values).zip(&key.param_oids) {
        let codec = if *known != 0 {
            shared.registry.get_codec(&TypeHint::Oid(*known))?
        } else {
            shared.registry.get_codec(&TypeHint::Oid(*oid))?
        };
        shared.registry.test_value(&codec, value)?;
        codecs.push(codec);
    }
    if let Some(cached) = shared.state()?.descriptions.get_mut(key) {
        cached.param_codecs = Some(codecs.clone());
    }

    let builder = &mut writer.builder;
    builder.bind("", "", values, &codecs)?;
    builder.execute("", 0)?;
    builder.sync()?;
    Ok(())
}
