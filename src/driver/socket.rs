//! Packet framing over a byte stream.
//!
//! A packet already sitting in the receive buffer is returned without
//! suspending. A packet split across reads is reassembled in a persistent
//! scratch buffer.

use super::stream::PgStream;
use super::{PgError, PgResult};
use bytes::{Buf, BytesMut};
use std::ops::Range;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio_rustls::TlsConnector;
use tokio_rustls::rustls::pki_types::ServerName;

/// Largest accepted packet length (1 GiB).
pub const MAX_PACKET_LEN: usize = 1 << 30;

/// Tag byte + 4-byte length
const HEADER_LEN: usize = 5;

/// Initial receive buffer capacity
const BUFFER_CAPACITY: usize = 65536;

/// One framed backend packet. Valid until the next read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Packet<'a> {
    pub code: u8,
    pub body: &'a [u8],
}

/// Frames protocol packets from a stream.
pub struct PacketSocket<S> {
    stream: S,
    recv: BytesMut,
    /// Start of unread bytes in `recv`.
    pos: usize,
    scratch: Vec<u8>,
    /// Set once the stream failed; every later read reports it.
    terminal: Option<String>,
}

/// Validate a packet header and return (tag, body length).
fn parse_header(header: &[u8]) -> Result<(u8, usize), String> {
    let len = i32::from_be_bytes([header[1], header[2], header[3], header[4]]);
    if len < 4 || len as usize > MAX_PACKET_LEN {
        return Err(format!(
            "Invalid length {} for message '{}'",
            len, header[0] as char
        ));
    }
    Ok((header[0], len as usize - 4))
}

impl<S> PacketSocket<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            recv: BytesMut::with_capacity(BUFFER_CAPACITY),
            pos: 0,
            scratch: Vec::new(),
            terminal: None,
        }
    }

    /// Bytes received but not yet framed.
    pub fn buffered(&self) -> usize {
        self.recv.len() - self.pos
    }

    fn check_terminal(&self) -> PgResult<()> {
        match &self.terminal {
            Some(reason) => Err(PgError::ConnectionClosed(reason.clone())),
            None => Ok(()),
        }
    }

    fn fail(&mut self, reason: String) -> PgError {
        self.terminal = Some(reason.clone());
        PgError::Protocol(reason)
    }

    /// Locate a complete packet in the receive buffer and consume it.
    fn locate_buffered(&mut self) -> PgResult<Option<(u8, Range<usize>)>> {
        if self.buffered() < HEADER_LEN {
            return Ok(None);
        }
        let (code, body_len) =
            parse_header(&self.recv[self.pos..self.pos + HEADER_LEN]).map_err(|e| self.fail(e))?;
        let start = self.pos + HEADER_LEN;
        if self.recv.len() - start < body_len {
            return Ok(None);
        }
        self.pos = start + body_len;
        Ok(Some((code, start..start + body_len)))
    }

    /// Return a packet if one is fully buffered, without touching the stream.
    pub fn try_read_buffered(&mut self) -> PgResult<Option<Packet<'_>>> {
        self.check_terminal()?;
        Ok(self
            .locate_buffered()?
            .map(|(code, range)| Packet {
                code,
                body: &self.recv[range],
            }))
    }
}

impl<S: AsyncRead + Unpin> PacketSocket<S> {
    /// Read the next packet.
    pub async fn read_packet(&mut self) -> PgResult<Packet<'_>> {
        self.check_terminal()?;
        if let Some((code, range)) = self.locate_buffered()? {
            return Ok(Packet {
                code,
                body: &self.recv[range],
            });
        }
        let code = self.reassemble().await?;
        Ok(Packet {
            code,
            body: &self.scratch[HEADER_LEN..],
        })
    }

    /// Slow path: move the partial packet into scratch and append chunks until complete.
    async fn reassemble(&mut self) -> PgResult<u8> {
        self.scratch.clear();
        self.scratch.extend_from_slice(&self.recv[self.pos..]);
        self.recv.clear();
        self.pos = 0;
        loop {
            let missing = if self.scratch.len() < HEADER_LEN {
                HEADER_LEN - self.scratch.len()
            } else {
                let (code, body_len) =
                    parse_header(&self.scratch[..HEADER_LEN]).map_err(|e| self.fail(e))?;
                let missing = HEADER_LEN + body_len - self.scratch.len();
                if missing == 0 {
                    return Ok(code);
                }
                self.scratch.reserve(missing);
                missing
            };
            if self.recv.is_empty() {
                self.fill().await?;
            }
            let take = missing.min(self.recv.len());
            self.scratch.extend_from_slice(&self.recv[..take]);
            self.recv.advance(take);
        }
    }

    /// Read at least one more byte into the receive buffer.
    async fn fill(&mut self) -> PgResult<()> {
        if self.pos > 0 {
            self.recv.advance(self.pos);
            self.pos = 0;
        }
        if self.recv.capacity() - self.recv.len() < BUFFER_CAPACITY / 2 {
            self.recv.reserve(BUFFER_CAPACITY);
        }
        match self.stream.read_buf(&mut self.recv).await {
            Ok(0) => {
                let reason = "Connection closed by server".to_string();
                self.terminal = Some(reason.clone());
                Err(PgError::ConnectionClosed(reason))
            }
            Ok(_) => Ok(()),
            Err(e) => {
                self.terminal = Some(e.to_string());
                Err(PgError::Io(e))
            }
        }
    }

    /// Read the single-byte answer to an SSLRequest.
    ///
    /// Returns `true` for 'S'. Bytes buffered beyond an 'S' were not
    /// encrypted and are rejected.
    pub async fn read_ssl_response(&mut self) -> PgResult<bool> {
        self.check_terminal()?;
        if self.buffered() == 0 {
            self.fill().await?;
        }
        let answer = self.recv[self.pos];
        self.pos += 1;
        match answer {
            b'S' if self.buffered() > 0 => Err(self.fail(
                "Unexpected data after SSL response".to_string(),
            )),
            b'S' => Ok(true),
            b'N' => Ok(false),
            other => Err(self.fail(format!(
                "Invalid SSL response byte: 0x{:02x}",
                other
            ))),
        }
    }
}

impl<S: AsyncWrite + Unpin> PacketSocket<S> {
    /// Write and flush raw bytes.
    pub async fn send(&mut self, bytes: &[u8]) -> PgResult<()> {
        self.check_terminal()?;
        let result = async {
            self.stream.write_all(bytes).await?;
            self.stream.flush().await
        }
        .await;
        result.map_err(|e| {
            self.terminal = Some(e.to_string());
            PgError::Io(e)
        })
    }
}

impl<S: AsyncRead + AsyncWrite> PacketSocket<S> {
    /// Split into a framed read side and a raw write side, keeping buffered bytes.
    pub fn into_split(self) -> (PacketSocket<ReadHalf<S>>, WriteHalf<S>) {
        let (read, write) = tokio::io::split(self.stream);
        let reader = PacketSocket {
            stream: read,
            recv: self.recv,
            pos: self.pos,
            scratch: self.scratch,
            terminal: self.terminal,
        };
        (reader, write)
    }
}

impl PacketSocket<PgStream> {
    /// Perform the TLS handshake and continue framing on the encrypted stream.
    pub async fn switch_to_tls(
        self,
        connector: &TlsConnector,
        server_name: ServerName<'static>,
    ) -> PgResult<Self> {
        self.check_terminal()?;
        if self.buffered() > 0 {
            return Err(PgError::Protocol(
                "Unencrypted data buffered before TLS handshake".to_string(),
            ));
        }
        let tcp = match self.stream {
            PgStream::Tcp(tcp) => tcp,
            _ => {
                return Err(PgError::Connection(
                    "TLS requires a plain TCP connection".to_string(),
                ));
            }
        };
        let tls = connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| PgError::Connection(format!("TLS handshake failed: {}", e)))?;
        Ok(PacketSocket::new(PgStream::Tls(tls)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::io::Builder;

    fn packet(code: u8, body: &[u8]) -> Vec<u8> {
        let mut out = vec![code];
        out.extend_from_slice(&((body.len() + 4) as i32).to_be_bytes());
        out.extend_from_slice(body);
        out
    }

    #[tokio::test]
    async fn test_whole_packet_fast_path() {
        let mut bytes = packet(b'Z', b"I");
        bytes.extend(packet(b'C', b"SELECT 1\0"));
        let mock = Builder::new().read(&bytes).build();
        let mut socket = PacketSocket::new(mock);

        let p = socket.read_packet().await.unwrap();
        assert_eq!((p.code, p.body), (b'Z', &b"I"[..]));
        // Second packet is already buffered
        let p = socket.try_read_buffered().unwrap().unwrap();
        assert_eq!((p.code, p.body), (b'C', &b"SELECT 1\0"[..]));
        assert!(socket.try_read_buffered().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_byte_by_byte_reassembly() {
        let bytes = packet(b'D', b"\x00\x01\x00\x00\x00\x03abc");
        let mut builder = Builder::new();
        for b in &bytes {
            builder.read(std::slice::from_ref(b));
        }
        let mut socket = PacketSocket::new(builder.build());
        let p = socket.read_packet().await.unwrap();
        assert_eq!(p.code, b'D');
        assert_eq!(p.body, &bytes[5..]);
    }

    #[tokio::test]
    async fn test_split_across_chunks_keeps_next_packet() {
        let first = packet(b'T', &[0u8; 40]);
        let second = packet(b'Z', b"T");
        let mut all = first.clone();
        all.extend_from_slice(&second);
        let mock = Builder::new()
            .read(&all[..3])
            .read(&all[3..30])
            .read(&all[30..])
            .build();
        let mut socket = PacketSocket::new(mock);
        let p = socket.read_packet().await.unwrap();
        assert_eq!((p.code, p.body.len()), (b'T', 40));
        let p = socket.read_packet().await.unwrap();
        assert_eq!((p.code, p.body), (b'Z', &b"T"[..]));
    }

    #[tokio::test]
    async fn test_invalid_length_is_terminal() {
        let mock = Builder::new().read(&[b'Z', 0, 0, 0, 2]).build();
        let mut socket = PacketSocket::new(mock);
        assert!(matches!(
            socket.read_packet().await,
            Err(PgError::Protocol(_))
        ));
        assert!(matches!(
            socket.read_packet().await,
            Err(PgError::ConnectionClosed(_))
        ));
    }

    #[tokio::test]
    async fn test_eof_is_terminal() {
        let mock = Builder::new().read(&[b'Z', 0, 0]).build();
        let mut socket = PacketSocket::new(mock);
        assert!(matches!(
            socket.read_packet().await,
            Err(PgError::ConnectionClosed(_))
        ));
        assert!(socket.read_packet().await.is_err());
    }

    #[tokio::test]
    async fn test_ssl_response() {
        let mock = Builder::new().read(b"N").build();
        assert!(!PacketSocket::new(mock).read_ssl_response().await.unwrap());

        let mock = Builder::new().read(b"S").build();
        assert!(PacketSocket::new(mock).read_ssl_response().await.unwrap());

        let mock = Builder::new().read(b"SZ").build();
        assert!(matches!(
            PacketSocket::new(mock).read_ssl_response().await,
            Err(PgError::Protocol(_))
        ));

        let mock = Builder::new().read(b"E").build();
        assert!(PacketSocket::new(mock).read_ssl_response().await.is_err());
    }
}
