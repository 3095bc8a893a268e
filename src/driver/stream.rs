//! Stream abstraction for TCP, TLS, and Unix socket connections.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tokio_rustls::client::TlsStream;

/// A PostgreSQL connection stream (TCP, TLS, or Unix).
#[allow(clippy::large_enum_variant)]
pub enum PgStream {
    Tcp(TcpStream),
    Tls(TlsStream<TcpStream>),
    /// Unix domain socket connection
    #[cfg(unix)]
    Unix(UnixStream),
}

impl PgStream {
    /// Open a plain connection. A host starting with `/` is a socket directory.
    pub async fn connect(host: &str, port: u16) -> io::Result<Self> {
        if host.starts_with('/') {
            return Self::connect_unix(host, port).await;
        }
        let tcp = TcpStream::connect((host, port)).await?;
        // Disable Nagle's algorithm for lower latency
        tcp.set_nodelay(true)?;
        Ok(PgStream::Tcp(tcp))
    }

    #[cfg(unix)]
    async fn connect_unix(dir: &str, port: u16) -> io::Result<Self> {
        let path = format!("{}/.s.PGSQL.{}", dir.trim_end_matches('/'), port);
        Ok(PgStream::Unix(UnixStream::connect(path).await?))
    }

    #[cfg(not(unix))]
    async fn connect_unix(_dir: &str, _port: u16) -> io::Result<Self> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "Unix domain sockets are not available on this platform",
        ))
    }

    pub fn is_tls(&self) -> bool {
        matches!(self, PgStream::Tls(_))
    }
}

macro_rules! dispatch {
    ($target:expr, $stream:ident => $body:expr) => {
        match $target {
            PgStream::Tcp($stream) => $body,
            PgStream::Tls($stream) => $body,
            #[cfg(unix)]
            PgStream::Unix($stream) => $body,
        }
    };
}

impl AsyncRead for PgStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        dispatch!(self.get_mut(), s => Pin::new(s).poll_read(cx, buf))
    }
}

impl AsyncWrite for PgStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        dispatch!(self.get_mut(), s => Pin::new(s).poll_write(cx, buf))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        dispatch!(self.get_mut(), s => Pin::new(s).poll_flush(cx))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        dispatch!(self.get_mut(), s => Pin::new(s).poll_shutdown(cx))
    }
}
