//! The response loop.
//!
//! One task per connection reads every backend message and matches it to the
//! query at the head of the FIFO queue. Asynchronous messages are published
//! as [`ServerEvent`]s. Any protocol violation, read failure or FATAL error
//! ends the loop and rejects everything still queued.

use super::connection::{ServerEvent, Shared};
use super::decoder::RowDecoder;
use super::query::{DescriptionKey, QueryResult};
use super::row::{ColumnInfo, PgRow};
use super::socket::PacketSocket;
use super::{PgError, PgResult};
use crate::protocol::BackendMessage;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::sync::oneshot;

/// A submitted query awaiting its responses.
pub(crate) struct PendingQuery {
    key: Arc<DescriptionKey>,
    decoder: Option<Arc<RowDecoder>>,
    /// Slow path: receives the described parameter OIDs.
    describe: Option<oneshot::Sender<Vec<u32>>>,
    reply: oneshot::Sender<PgResult<QueryResult>>,
}

impl PendingQuery {
    pub(crate) fn new(
        key: Arc<DescriptionKey>,
        decoder: Option<Arc<RowDecoder>>,
        describe: Option<oneshot::Sender<Vec<u32>>>,
        reply: oneshot::Sender<PgResult<QueryResult>>,
    ) -> Self {
        Self {
            key,
            decoder,
            describe,
            reply,
        }
    }

    pub(crate) fn fail(self, err: PgError) {
        let _ = self.reply.send(Err(err));
    }
}

/// The query whose responses are being read.
struct InFlight {
    query: PendingQuery,
    param_oids: Option<Vec<u32>>,
    rows: Vec<PgRow>,
    tag: Option<String>,
    error: Option<PgError>,
}

impl InFlight {
    fn new(query: PendingQuery) -> Self {
        Self {
            query,
            param_oids: None,
            rows: Vec::new(),
            tag: None,
            error: None,
        }
    }

    /// Keep the first error; later rows of this query are skipped.
    fn record_error(&mut self, err: PgError) {
        self.rows.clear();
        self.query.describe = None;
        if self.error.is_none() {
            self.error = Some(err);
        }
    }

    fn finish(self) {
        let InFlight {
            query,
            rows,
            tag,
            error,
            ..
        } = self;
        let result = match error {
            Some(err) => Err(err),
            None => {
                let fields = query
                    .decoder
                    .as_ref()
                    .map(|d| d.columns().clone())
                    .unwrap_or_else(|| Arc::new(ColumnInfo::default()));
                Ok(QueryResult::new(tag.as_deref().unwrap_or(""), rows, fields))
            }
        };
        // The caller may have given up on the result
        let _ = query.reply.send(result);
    }
}

/// Read and dispatch messages until the connection ends.
pub(crate) async fn run<S: AsyncRead + Unpin>(mut socket: PacketSocket<S>, shared: Arc<Shared>) {
    let mut current: Option<InFlight> = None;
    let reason = loop {
        let packet = match socket.read_packet().await {
            Ok(packet) => packet,
            Err(err) => break err,
        };
        let message = match BackendMessage::decode(packet.code, packet.body) {
            Ok(message) => message,
            Err(reason) => break PgError::Protocol(reason),
        };
        if let Err(err) = dispatch(&shared, &mut current, message) {
            break err;
        }
    };
    terminate(&shared, current, reason).await;
}

fn dispatch(
    shared: &Shared,
    current: &mut Option<InFlight>,
    message: BackendMessage<'_>,
) -> PgResult<()> {
    match message {
        BackendMessage::NoticeResponse(fields) => {
            tracing::info!("Server notice: {}", fields);
            shared.publish(ServerEvent::Notice(fields));
            return Ok(());
        }
        BackendMessage::ParameterStatus { name, value } => {
            tracing::debug!("Parameter status {} = {}", name, value);
            shared
                .state()?
                .server_params
                .insert(name.clone(), value.clone());
            shared.publish(ServerEvent::ParameterStatus { name, value });
            return Ok(());
        }
        BackendMessage::NotificationResponse {
            process_id,
            channel,
            payload,
        } => {
            shared.publish(ServerEvent::Notification {
                process_id,
                channel,
                payload,
            });
            return Ok(());
        }
        BackendMessage::ErrorResponse(fields) if fields.is_fatal() => {
            return Err(fields.into());
        }
        _ => {}
    }

    let inflight = match current {
        Some(inflight) => inflight,
        None => {
            let Some(query) = shared.state()?.queue.pop_front() else {
                tracing::warn!("Unsolicited message: {:?}", message);
                return Err(PgError::Protocol(format!(
                    "Unexpected message with no query pending: {:?}",
                    message
                )));
            };
            current.insert(InFlight::new(query))
        }
    };

    match message {
        BackendMessage::ParseComplete
        | BackendMessage::BindComplete
        | BackendMessage::CloseComplete
        | BackendMessage::PortalSuspended => {}
        BackendMessage::ParameterDescription(oids) => inflight.param_oids = Some(oids),
        BackendMessage::RowDescription(fields) => {
            let decoder = shared.decoders.get_or_build(fields, &shared.registry);
            described(shared, inflight, decoder)?;
        }
        BackendMessage::NoData => {
            let decoder = shared.decoders.get_or_build(Vec::new(), &shared.registry);
            described(shared, inflight, decoder)?;
        }
        BackendMessage::DataRow(row) => {
            if inflight.error.is_some() {
                return Ok(());
            }
            let Some(decoder) = &inflight.query.decoder else {
                return Err(PgError::Protocol(
                    "DataRow before RowDescription".to_string(),
                ));
            };
            match shared.decoders.decode(decoder, &row) {
                Ok(decoded) => inflight.rows.push(decoded),
                Err(err @ PgError::Codec(_)) => inflight.record_error(err),
                Err(err) => return Err(err),
            }
        }
        BackendMessage::CommandComplete(tag) => inflight.tag = Some(tag),
        BackendMessage::EmptyQueryResponse => inflight.tag = Some(String::new()),
        BackendMessage::ErrorResponse(fields) => inflight.record_error(fields.into()),
        BackendMessage::CopyOutResponse => inflight.record_error(PgError::Protocol(
            "COPY TO STDOUT is not supported".to_string(),
        )),
        BackendMessage::CopyData(_) | BackendMessage::CopyDone => {}
        BackendMessage::CopyInResponse | BackendMessage::CopyBothResponse => {
            return Err(PgError::Protocol(
                "COPY FROM STDIN is not supported".to_string(),
            ));
        }
        BackendMessage::ReadyForQuery(status) => {
            shared.state()?.tx_status = status;
            if let Some(done) = current.take() {
                done.finish();
            }
        }
        other => {
            return Err(PgError::Protocol(format!(
                "Unexpected message during query: {:?}",
                other
            )));
        }
    }
    Ok(())
}

/// RowDescription or NoData arrived: cache the decoder and release a waiting Bind.
fn described(shared: &Shared, inflight: &mut InFlight, decoder: Arc<RowDecoder>) -> PgResult<()> {
    if let Some(cached) = shared.state()?.descriptions.get_mut(&inflight.query.key) {
        cached.row_decoder = Some(decoder.clone());
    }
    inflight.query.decoder = Some(decoder);
    if let Some(describe) = inflight.query.describe.take() {
        let Some(oids) = inflight.param_oids.take() else {
            return Err(PgError::Protocol(
                "Statement described without ParameterDescription".to_string(),
            ));
        };
        let _ = describe.send(oids);
    }
    Ok(())
}

/// Reject the in-flight query (or, if none started, the queue head) with the
/// real error and everything else with ConnectionClosed.
async fn terminate(shared: &Shared, current: Option<InFlight>, reason: PgError) {
    let message = reason.to_string();
    let mut head = current.map(|inflight| inflight.query);
    match shared.state() {
        Ok(mut state) => {
            if state.closed.is_some() {
                tracing::debug!("Response loop finished: {}", message);
            } else {
                tracing::error!("Connection terminated: {}", message);
            }
            if head.is_none() {
                head = state.queue.pop_front();
            }
            // Closed before any describe sender drops, so a waiting slow path
            // sees the teardown and writes nothing more.
            state.close(&message);
        }
        Err(_) => tracing::error!("Connection terminated: {}", message),
    }
    if let Some(query) = head {
        query.fail(reason);
    }

    let mut writer = match shared.writer.try_lock() {
        Ok(writer) => writer,
        Err(_) => {
            tracing::debug!("Waiting for the writer before shutting down the socket");
            shared.writer.lock().await
        }
    };
    if let Err(err) = writer.sink.shutdown().await {
        tracing::debug!("Socket shutdown failed: {}", err);
    }
}
