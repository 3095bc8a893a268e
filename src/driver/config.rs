//! Connection configuration.
//!
//! Options can be built fluently, parsed from a `postgres://` URL, or read from
//! the standard `PG*` environment variables.

use super::tls::TlsConfig;
use super::{PgError, PgResult};
use crate::codec::CodecRegistry;
use crate::protocol::{PROTOCOL_V3_0, PROTOCOL_V3_2};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Whether and how to negotiate TLS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SslMode {
    /// Never send an SSLRequest.
    Disable,
    /// Try TLS, continue in plaintext if the server declines.
    #[default]
    Prefer,
    /// Fail unless the server accepts TLS.
    Require,
}

impl FromStr for SslMode {
    type Err = PgError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "disable" => Ok(SslMode::Disable),
            "allow" | "prefer" => Ok(SslMode::Prefer),
            "require" | "verify-ca" | "verify-full" => Ok(SslMode::Require),
            other => Err(PgError::Connection(format!("Invalid sslmode '{}'", other))),
        }
    }
}

/// Requested frontend/backend protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProtocolVersion {
    #[default]
    V3_0,
    V3_2,
}

impl ProtocolVersion {
    /// Version code sent in the StartupMessage.
    pub fn code(self) -> i32 {
        match self {
            ProtocolVersion::V3_0 => PROTOCOL_V3_0,
            ProtocolVersion::V3_2 => PROTOCOL_V3_2,
        }
    }

    pub fn minor(self) -> i32 {
        self.code() & 0xffff
    }
}

/// How parameters without an explicit type get their codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParamInference {
    /// Infer from the host value's shape.
    #[default]
    Value,
    /// Ask the server (Parse + Describe round trip) for the types.
    Server,
}

/// Options for [`Connection::connect`](super::Connection::connect).
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub database: Option<String>,
    pub application_name: Option<String>,
    pub ssl_mode: SslMode,
    pub tls: TlsConfig,
    pub connect_timeout: Option<Duration>,
    pub protocol_version: ProtocolVersion,
    pub param_inference: ParamInference,
    /// Use compiled decode plans for rows (falls back automatically).
    pub compiled_decoders: bool,
    pub registry: Arc<CodecRegistry>,
    /// Capacity of the server event broadcast channel.
    pub event_capacity: usize,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5432,
            user: "postgres".to_string(),
            database: None,
            application_name: None,
            ssl_mode: SslMode::default(),
            tls: TlsConfig::default(),
            connect_timeout: None,
            protocol_version: ProtocolVersion::default(),
            param_inference: ParamInference::default(),
            compiled_decoders: true,
            registry: CodecRegistry::shared(),
            event_capacity: 64,
        }
    }
}

impl ConnectOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the host (default: "127.0.0.1"). A path starting with `/` selects a Unix socket.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Set the port (default: 5432).
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    /// Set the database name (server defaults to the user name).
    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    pub fn application_name(mut self, name: impl Into<String>) -> Self {
        self.application_name = Some(name.into());
        self
    }

    pub fn ssl_mode(mut self, mode: SslMode) -> Self {
        self.ssl_mode = mode;
        self
    }

    pub fn tls(mut self, tls: TlsConfig) -> Self {
        self.tls = tls;
        self
    }

    /// Set connection timeout (covers TCP connect, TLS and startup).
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn protocol_version(mut self, version: ProtocolVersion) -> Self {
        self.protocol_version = version;
        self
    }

    pub fn param_inference(mut self, mode: ParamInference) -> Self {
        self.param_inference = mode;
        self
    }

    pub fn compiled_decoders(mut self, enabled: bool) -> Self {
        self.compiled_decoders = enabled;
        self
    }

    pub fn registry(mut self, registry: Arc<CodecRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }

    /// Parse a `postgres://user@host:port/database?sslmode=...` URL.
    pub fn from_url(url: &str) -> PgResult<Self> {
        let parsed = url::Url::parse(url)
            .map_err(|e| PgError::Connection(format!("Invalid connection URL: {}", e)))?;
        if !matches!(parsed.scheme(), "postgres" | "postgresql") {
            return Err(PgError::Connection(format!(
                "Unsupported URL scheme '{}'",
                parsed.scheme()
            )));
        }

        let mut options = Self::default();
        if let Some(host) = parsed.host_str().filter(|h| !h.is_empty()) {
            options.host = host.trim_start_matches('[').trim_end_matches(']').to_string();
        }
        if let Some(port) = parsed.port() {
            options.port = port;
        }
        if !parsed.username().is_empty() {
            options.user = decode(parsed.username());
        }
        let path = parsed.path().trim_start_matches('/');
        if !path.is_empty() {
            options.database = Some(decode(path));
        }

        for (key, value) in parsed.query_pairs() {
            match key.as_ref() {
                "sslmode" => options.ssl_mode = value.parse()?,
                "application_name" => options.application_name = Some(value.into_owned()),
                "host" => options.host = value.into_owned(),
                "port" => options.port = parse_number(&key, &value)?,
                "dbname" => options.database = Some(value.into_owned()),
                "user" => options.user = value.into_owned(),
                "connect_timeout" => {
                    options.connect_timeout =
                        Some(Duration::from_secs(parse_number(&key, &value)?))
                }
                "sslrootcert" => {
                    options.tls.ca_cert_pem = Some(std::fs::read(&*value)?);
                }
                other => {
                    tracing::debug!("Ignoring connection URL parameter '{}'", other);
                }
            }
        }
        Ok(options)
    }

    /// Read `PGHOST`, `PGPORT`, `PGUSER`, `PGDATABASE`, `PGAPPNAME`,
    /// `PGSSLMODE` and `PGCONNECT_TIMEOUT`.
    pub fn from_env() -> PgResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> PgResult<Self> {
        let mut options = Self::default();
        if let Some(host) = lookup("PGHOST") {
            options.host = host;
        }
        if let Some(port) = lookup("PGPORT") {
            options.port = parse_number("PGPORT", &port)?;
        }
        if let Some(user) = lookup("PGUSER") {
            options.user = user;
        }
        options.database = lookup("PGDATABASE");
        options.application_name = lookup("PGAPPNAME");
        if let Some(mode) = lookup("PGSSLMODE") {
            options.ssl_mode = mode.parse()?;
        }
        if let Some(secs) = lookup("PGCONNECT_TIMEOUT") {
            options.connect_timeout = Some(Duration::from_secs(parse_number(
                "PGCONNECT_TIMEOUT",
                &secs,
            )?));
        }
        Ok(options)
    }
}

impl FromStr for ConnectOptions {
    type Err = PgError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_url(s)
    }
}

/// Percent-decode a URL component (handles %XX sequences).
fn decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).unwrap_or("");
            if let Ok(byte) = u8::from_str_radix(hex, 16) {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn parse_number<T: FromStr>(key: &str, value: &str) -> PgResult<T> {
    value
        .parse()
        .map_err(|_| PgError::Connection(format!("Invalid {} '{}'", key, value)))
}
