//! PostgreSQL Connection
//!
//! The shared, cloneable connection handle. Methods are split across modules:
//! - `startup.rs` - SSL negotiation and the startup handshake
//! - `query.rs` - query submission (fast and slow paths)
//! - `response.rs` - the background response loop

use super::config::{ConnectOptions, ParamInference};
use super::decoder::RowDecoderCache;
use super::query::{CachedDescription, DescriptionKey};
use super::response::{self, PendingQuery};
use super::socket::PacketSocket;
use super::startup::{self, Handshake};
use super::stream::PgStream;
use super::{PgError, PgResult};
use crate::codec::CodecRegistry;
use crate::protocol::{ErrorFields, RequestBuilder, TransactionStatus};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Out-of-band messages from the server.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    Notice(ErrorFields),
    ParameterStatus {
        name: String,
        value: String,
    },
    Notification {
        process_id: i32,
        channel: String,
        payload: String,
    },
}

/// Sizes of the per-connection caches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub descriptions: usize,
    pub row_decoders: usize,
    pub compiled_decoders: bool,
}

/// Mutable connection state. Never locked across an `.await`.
pub(crate) struct ConnectionState {
    pub(crate) queue: VecDeque<PendingQuery>,
    pub(crate) descriptions: HashMap<Arc<DescriptionKey>, CachedDescription>,
    pub(crate) server_params: HashMap<String, String>,
    pub(crate) tx_status: TransactionStatus,
    /// Reason the connection was torn down.
    pub(crate) closed: Option<String>,
}

impl ConnectionState {
    /// Reject every queued query and mark the connection closed.
    pub(crate) fn close(&mut self, reason: &str) {
        if self.closed.is_none() {
            self.closed = Some(reason.to_string());
        }
        for pending in self.queue.drain(..) {
            pending.fail(PgError::ConnectionClosed(reason.to_string()));
        }
    }

    pub(crate) fn check_open(&self) -> PgResult<()> {
        match &self.closed {
            Some(reason) => Err(PgError::ConnectionClosed(reason.clone())),
            None => Ok(()),
        }
    }
}

/// Write side, held for the whole write sequence of one query.
pub(crate) struct Writer {
    pub(crate) sink: Box<dyn AsyncWrite + Send + Unpin>,
    pub(crate) builder: RequestBuilder,
}

impl Writer {
    /// Send everything the builder has accumulated.
    ///
    /// Not cancel safe: callers run it from a task that owns the writer.
    pub(crate) async fn flush(&mut self) -> PgResult<()> {
        let result = async {
            self.sink.write_all(self.builder.outstanding()).await?;
            self.sink.flush().await
        }
        .await;
        self.builder.acknowledge();
        result.map_err(PgError::Io)
    }
}

pub(crate) struct Shared {
    pub(crate) registry: Arc<CodecRegistry>,
    pub(crate) state: Mutex<ConnectionState>,
    /// Write-ordering chain; query writes hold it from an owned guard.
    pub(crate) writer: Arc<tokio::sync::Mutex<Writer>>,
    pub(crate) decoders: RowDecoderCache,
    pub(crate) events: broadcast::Sender<ServerEvent>,
    pub(crate) backend_key: Option<(i32, Vec<u8>)>,
    pub(crate) protocol_minor: i32,
    pub(crate) param_inference: ParamInference,
}

impl Shared {
    pub(crate) fn state(&self) -> PgResult<MutexGuard<'_, ConnectionState>> {
        self.state
            .lock()
            .map_err(|_| PgError::ConnectionClosed("Connection state poisoned".to_string()))
    }

    /// Tear down from the write side after a failed write.
    pub(crate) fn fail_writes(&self, err: &PgError) {
        tracing::error!("Write failed, closing connection: {}", err);
        if let Ok(mut state) = self.state.lock() {
            state.close(&err.to_string());
        }
    }

    pub(crate) fn publish(&self, event: ServerEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

/// Aborts the response loop once the last handle is dropped.
struct ReaderGuard(JoinHandle<()>);

impl Drop for ReaderGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// A pipelined PostgreSQL connection.
///
/// Cheap to clone; every clone submits into the same FIFO pipeline.
#[derive(Clone)]
pub struct Connection {
    pub(crate) shared: Arc<Shared>,
    _reader: Arc<ReaderGuard>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("backend_key", &self.shared.backend_key.as_ref().map(|k| k.0))
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Connection {
    /// Connect over TCP (or a Unix socket), negotiating TLS per `ssl_mode`.
    pub async fn connect(options: ConnectOptions) -> PgResult<Self> {
        let timeout = options.connect_timeout;
        let connect = async move {
            let stream = PgStream::connect(&options.host, options.port)
                .await
                .map_err(|e| {
                    PgError::Connection(format!(
                        "Failed to connect to {}:{}: {}",
                        options.host, options.port, e
                    ))
                })?;
            let socket = startup::negotiate_tls(PacketSocket::new(stream), &options).await?;
            Self::establish(socket, options).await
        };
        match timeout {
            Some(limit) => tokio::time::timeout(limit, connect)
                .await
                .map_err(|_| PgError::Connection(format!("Connection timeout after {:?}", limit)))?,
            None => connect.await,
        }
    }

    /// Run the startup handshake over an already-open stream. No SSL request is sent.
    pub async fn connect_stream<S>(stream: S, options: ConnectOptions) -> PgResult<Self>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        Self::establish(PacketSocket::new(stream), options).await
    }

    async fn establish<S>(mut socket: PacketSocket<S>, options: ConnectOptions) -> PgResult<Self>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let mut builder = RequestBuilder::default();
        let handshake = Handshake::run(&mut socket, &mut builder, &options).await?;
        let (reader, sink) = socket.into_split();

        let (events, _) = broadcast::channel(options.event_capacity.max(1));
        let shared = Arc::new(Shared {
            registry: options.registry.clone(),
            state: Mutex::new(ConnectionState {
                queue: VecDeque::new(),
                descriptions: HashMap::new(),
                server_params: handshake.server_params,
                tx_status: handshake.tx_status,
                closed: None,
            }),
            writer: Arc::new(tokio::sync::Mutex::new(Writer {
                sink: Box::new(sink),
                builder,
            })),
            decoders: RowDecoderCache::new(options.compiled_decoders),
            events,
            backend_key: handshake.backend_key,
            protocol_minor: handshake.protocol_minor,
            param_inference: options.param_inference,
        });
        let task = tokio::spawn(response::run(reader, shared.clone()));
        tracing::debug!(
            "Connection ready (protocol 3.{})",
            shared.protocol_minor
        );
        Ok(Self {
            shared,
            _reader: Arc::new(ReaderGuard(task)),
        })
    }

    /// Current value of a server parameter reported via ParameterStatus.
    pub fn server_param(&self, name: &str) -> Option<String> {
        self.shared.state().ok()?.server_params.get(name).cloned()
    }

    /// Backend process id and secret key, for out-of-band cancellation.
    pub fn backend_key(&self) -> Option<(i32, &[u8])> {
        self.shared
            .backend_key
            .as_ref()
            .map(|(pid, secret)| (*pid, secret.as_slice()))
    }

    /// Negotiated protocol minor version (0 or 2).
    pub fn protocol_minor(&self) -> i32 {
        self.shared.protocol_minor
    }

    /// Transaction status from the most recent ReadyForQuery.
    pub fn transaction_status(&self) -> Option<TransactionStatus> {
        self.shared.state().ok().map(|s| s.tx_status)
    }

    pub fn registry(&self) -> &Arc<CodecRegistry> {
        &self.shared.registry
    }

    /// Subscribe to notices, parameter changes and notifications.
    ///
    /// Slow subscribers miss events rather than stalling the connection.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.shared.events.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state().map_or(true, |s| s.closed.is_some())
    }

    pub fn cache_stats(&self) -> CacheStats {
        CacheStats {
            descriptions: self.shared.state().map_or(0, |s| s.descriptions.len()),
            row_decoders: self.shared.decoders.len(),
            compiled_decoders: self.shared.decoders.compiled_enabled(),
        }
    }

    /// Send Terminate and close the connection. Queued queries are rejected.
    pub async fn close(&self) -> PgResult<()> {
        let mut writer = self.shared.writer.clone().lock_owned().await;
        self.shared.state()?.check_open()?;
        let shared = self.shared.clone();
        let teardown = tokio::spawn(async move {
            writer.builder.terminate()?;
            let sent = writer.flush().await;
            let _ = writer.sink.shutdown().await;
            shared.state()?.close("Connection closed by client");
            tracing::debug!("Connection closed by client");
            sent
        });
        teardown
            .await
            .map_err(|e| PgError::ConnectionClosed(format!("Close task failed: {}", e)))?
    }
}
