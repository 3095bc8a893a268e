//! Scripted in-process PostgreSQL server for driver tests.

#![allow(dead_code)]

use qail_pgwire::{ConnectOptions, Connection};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

pub struct FakeServer {
    io: DuplexStream,
}

/// A frontend message as read by the server.
#[derive(Debug, Clone, PartialEq)]
pub struct Frontend {
    pub tag: u8,
    pub body: Vec<u8>,
}

impl FakeServer {
    pub fn new(io: DuplexStream) -> Self {
        Self { io }
    }

    /// Read the untagged StartupMessage and return its parameters.
    pub async fn read_startup(&mut self) -> (i32, Vec<(String, String)>) {
        let len = self.io.read_i32().await.unwrap() as usize;
        let mut body = vec![0; len - 4];
        self.io.read_exact(&mut body).await.unwrap();
        let version = i32::from_be_bytes([body[0], body[1], body[2], body[3]]);
        let strings: Vec<String> = body[4..]
            .split(|b| *b == 0)
            .filter(|s| !s.is_empty())
            .map(|s| String::from_utf8(s.to_vec()).unwrap())
            .collect();
        let params = strings
            .chunks(2)
            .map(|pair| (pair[0].clone(), pair[1].clone()))
            .collect();
        (version, params)
    }

    pub async fn read_message(&mut self) -> Frontend {
        let tag = self.io.read_u8().await.unwrap();
        let len = self.io.read_i32().await.unwrap() as usize;
        let mut body = vec![0; len - 4];
        self.io.read_exact(&mut body).await.unwrap();
        Frontend { tag, body }
    }

    /// Read messages and assert their tags, in order.
    pub async fn expect(&mut self, tags: &[u8]) -> Vec<Frontend> {
        let mut messages = Vec::with_capacity(tags.len());
        for expected in tags {
            let message = self.read_message().await;
            assert_eq!(
                message.tag as char, *expected as char,
                "unexpected frontend message {:?}",
                message
            );
            messages.push(message);
        }
        messages
    }

    pub async fn send(&mut self, messages: &[Vec<u8>]) {
        self.io.write_all(&messages.concat()).await.unwrap();
        self.io.flush().await.unwrap();
    }

    /// Trust authentication followed by ReadyForQuery.
    pub async fn accept(&mut self) -> Vec<(String, String)> {
        let (_, params) = self.read_startup().await;
        self.send(&[
            auth_ok(),
            parameter_status("server_version", "16.2"),
            parameter_status("client_encoding", "UTF8"),
            backend_key(4242, &[9, 9, 9, 9]),
            ready(b'I'),
        ])
        .await;
        params
    }

    /// True once the client has shut down its write side.
    pub async fn at_eof(&mut self) -> bool {
        let mut byte = [0u8; 1];
        matches!(self.io.read(&mut byte).await, Ok(0))
    }

    pub async fn shutdown(mut self) {
        let _ = self.io.shutdown().await;
    }
}

/// Connect a client to a fresh fake server that accepts trust auth.
pub async fn connect(options: ConnectOptions) -> (Connection, FakeServer) {
    connect_with_capacity(options, 1 << 16).await
}

/// Like [`connect`], with a pipe that holds at most `capacity` unread bytes.
pub async fn connect_with_capacity(
    options: ConnectOptions,
    capacity: usize,
) -> (Connection, FakeServer) {
    let (client, server) = tokio::io::duplex(capacity);
    let mut server = FakeServer::new(server);
    let (conn, _) = tokio::join!(Connection::connect_stream(client, options), server.accept());
    (conn.unwrap(), server)
}

pub fn message(tag: u8, body: &[u8]) -> Vec<u8> {
    let mut out = vec![tag];
    out.extend_from_slice(&((body.len() + 4) as i32).to_be_bytes());
    out.extend_from_slice(body);
    out
}

fn cstr(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(s.as_bytes());
    out.push(0);
}

pub fn auth_ok() -> Vec<u8> {
    message(b'R', &0i32.to_be_bytes())
}

pub fn auth_md5() -> Vec<u8> {
    let mut body = 5i32.to_be_bytes().to_vec();
    body.extend_from_slice(&[1, 2, 3, 4]);
    message(b'R', &body)
}

pub fn negotiate_protocol(newest_minor: i32) -> Vec<u8> {
    let mut body = newest_minor.to_be_bytes().to_vec();
    body.extend_from_slice(&0i32.to_be_bytes());
    message(b'v', &body)
}

pub fn parameter_status(name: &str, value: &str) -> Vec<u8> {
    let mut body = Vec::new();
    cstr(&mut body, name);
    cstr(&mut body, value);
    message(b'S', &body)
}

pub fn backend_key(pid: i32, secret: &[u8]) -> Vec<u8> {
    let mut body = pid.to_be_bytes().to_vec();
    body.extend_from_slice(secret);
    message(b'K', &body)
}

pub fn ready(status: u8) -> Vec<u8> {
    message(b'Z', &[status])
}

pub fn parse_complete() -> Vec<u8> {
    message(b'1', &[])
}

pub fn bind_complete() -> Vec<u8> {
    message(b'2', &[])
}

pub fn no_data() -> Vec<u8> {
    message(b'n', &[])
}

pub fn command_complete(tag: &str) -> Vec<u8> {
    let mut body = Vec::new();
    cstr(&mut body, tag);
    message(b'C', &body)
}

pub fn parameter_description(oids: &[u32]) -> Vec<u8> {
    let mut body = (oids.len() as i16).to_be_bytes().to_vec();
    for oid in oids {
        body.extend_from_slice(&oid.to_be_bytes());
    }
    message(b't', &body)
}

pub fn row_description(columns: &[(&str, u32)]) -> Vec<u8> {
    let mut body = (columns.len() as i16).to_be_bytes().to_vec();
    for (name, oid) in columns {
        cstr(&mut body, name);
        body.extend_from_slice(&0u32.to_be_bytes());
        body.extend_from_slice(&0i16.to_be_bytes());
        body.extend_from_slice(&oid.to_be_bytes());
        body.extend_from_slice(&(-1i16).to_be_bytes());
        body.extend_from_slice(&(-1i32).to_be_bytes());
        body.extend_from_slice(&1i16.to_be_bytes());
    }
    message(b'T', &body)
}

pub fn data_row(fields: &[Option<&[u8]>]) -> Vec<u8> {
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
    message(b'D', &body)
}

fn error_fields(tag: u8, severity: &str, code: &str, text: &str) -> Vec<u8> {
    let mut body = Vec::new();
    for (field, value) in [(b'S', severity), (b'V', severity), (b'C', code), (b'M', text)] {
        body.push(field);
        cstr(&mut body, value);
    }
    body.push(0);
    message(tag, &body)
}

pub fn error(severity: &str, code: &str, text: &str) -> Vec<u8> {
    error_fields(b'E', severity, code, text)
}

pub fn notice(text: &str) -> Vec<u8> {
    error_fields(b'N', "NOTICE", "00000", text)
}

/// Bind body for the unnamed portal/statement with binary formats.
pub fn bind_body(params: &[Option<&[u8]>]) -> Vec<u8> {
    let mut body = vec![0, 0];
    body.extend_from_slice(&1i16.to_be_bytes());
    body.extend_from_slice(&1i16.to_be_bytes());
    body.extend_from_slice(&(params.len() as i16).to_be_bytes());
    for param in params {
        match param {
            Some(bytes) => {
                body.extend_from_slice(&(bytes.len() as i32).to_be_bytes());
                body.extend_from_slice(bytes);
            }
            None => body.extend_from_slice(&(-1i32).to_be_bytes()),
        }
    }
    body.extend_from_slice(&1i16.to_be_bytes());
    body.extend_from_slice(&1i16.to_be_bytes());
    body
}

/// Parse body for the unnamed statement.
pub fn parse_body(sql: &str, oids: &[u32]) -> Vec<u8> {
    let mut body = vec![0];
    cstr(&mut body, sql);
    body.extend_from_slice(&(oids.len() as i16).to_be_bytes());
    for oid in oids {
        body.extend_from_slice(&oid.to_be_bytes());
    }
    body
}
