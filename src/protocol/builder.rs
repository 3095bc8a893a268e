//! Frontend message serializer.
//!
//! Pure, synchronous computation - no I/O, no async. Every message is written
//! into one reusable arena; the async layer sends `outstanding()` and then
//! calls `acknowledge()`.
//!
//! Packet layout:
//! - tag (1 byte, omitted for startup / SSL request / cancel request)
//! - length (4 bytes, big-endian, includes self, excludes tag)
//! - body

use super::error::BuildError;
use crate::codec::{Codec, IsNull, Value};
use bytes::{BufMut, BytesMut};

/// Protocol version 3.0
pub const PROTOCOL_V3_0: i32 = 196_608;
/// Protocol version 3.2
pub const PROTOCOL_V3_2: i32 = 196_610;

const SSL_REQUEST_CODE: i32 = 80_877_103;
const CANCEL_REQUEST_CODE: i32 = 80_877_102;

/// Binary format code
const FORMAT_BINARY: i16 = 1;

/// What a Describe or Close message targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Statement,
    Portal,
}

impl Target {
    fn code(self) -> u8 {
        match self {
            Target::Statement => b'S',
            Target::Portal => b'P',
        }
    }
}

/// Position in the arena that a failed batch can be rolled back to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mark(usize);

/// Reusable frontend message buffer with sequential-write checks.
#[derive(Debug)]
pub struct RequestBuilder {
    buf: BytesMut,
    /// Where the next packet must begin.
    expected_end: usize,
    /// Length placeholder of a packet whose size is patched on finish.
    open: Option<usize>,
}

impl Default for RequestBuilder {
    fn default() -> Self {
        Self::with_capacity(1024)
    }
}

impl RequestBuilder {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
            expected_end: 0,
            open: None,
        }
    }

    /// Bytes written since the last acknowledgement.
    pub fn outstanding(&self) -> &[u8] {
        &self.buf
    }

    pub fn has_outstanding(&self) -> bool {
        !self.buf.is_empty()
    }

    /// The outstanding bytes reached the socket; reuse the arena.
    pub fn acknowledge(&mut self) {
        self.buf.clear();
        self.expected_end = 0;
        self.open = None;
    }

    pub fn mark(&self) -> Mark {
        Mark(self.buf.len())
    }

    /// Discard everything written after `mark`.
    pub fn rollback_to(&mut self, mark: Mark) {
        self.buf.truncate(mark.0);
        self.expected_end = mark.0;
        self.open = None;
    }

    /// Begin a packet with a known body length and return the buffer for its body.
    ///
    /// Fails if the previous packet was not written to exactly its declared length.
    pub fn start_packet(
        &mut self,
        tag: Option<u8>,
        body_len: usize,
    ) -> Result<&mut BytesMut, BuildError> {
        self.check_sequence()?;
        let len = i32::try_from(body_len + 4).map_err(|_| BuildError::PacketTooLarge(body_len))?;
        self.reserve(5 + body_len);
        if let Some(tag) = tag {
            self.buf.put_u8(tag);
        }
        self.buf.put_i32(len);
        self.expected_end = self.buf.len() + body_len;
        Ok(&mut self.buf)
    }

    /// Begin a packet whose length is patched by `finish_packet`.
    fn start_open_packet(&mut self, tag: u8) -> Result<(), BuildError> {
        self.check_sequence()?;
        self.reserve(5);
        self.buf.put_u8(tag);
        self.open = Some(self.buf.len());
        self.buf.put_i32(0);
        Ok(())
    }

    fn finish_packet(&mut self) -> Result<(), BuildError> {
        let Some(len_pos) = self.open.take() else {
            return Err(BuildError::Invariant {
                expected: self.expected_end,
                actual: self.buf.len(),
            });
        };
        let len = self.buf.len() - len_pos;
        let len = i32::try_from(len).map_err(|_| BuildError::PacketTooLarge(len))?;
        self.buf[len_pos..len_pos + 4].copy_from_slice(&len.to_be_bytes());
        self.expected_end = self.buf.len();
        Ok(())
    }

    fn check_sequence(&self) -> Result<(), BuildError> {
        if let Some(start) = self.open {
            return Err(BuildError::Unterminated { start });
        }
        if self.buf.len() != self.expected_end {
            return Err(BuildError::Invariant {
                expected: self.expected_end,
                actual: self.buf.len(),
            });
        }
        Ok(())
    }

    /// Grow by doubling when the free space is insufficient.
    fn reserve(&mut self, additional: usize) {
        let free = self.buf.capacity() - self.buf.len();
        if free < additional {
            self.buf.reserve(additional.max(self.buf.capacity()));
        }
    }

    // ==================== Pre-startup messages ====================

    /// StartupMessage: length, protocol version, (name\0 value\0)*, \0
    pub fn startup(&mut self, version: i32, params: &[(&str, &str)]) -> Result<(), BuildError> {
        for (name, value) in params {
            check_cstr(name)?;
            check_cstr(value)?;
        }
        let body_len = 4 + params
            .iter()
            .map(|(name, value)| name.len() + value.len() + 2)
            .sum::<usize>()
            + 1;
        let buf = self.start_packet(None, body_len)?;
        buf.put_i32(version);
        for (name, value) in params {
            put_cstr(buf, name);
            put_cstr(buf, value);
        }
        buf.put_u8(0);
        Ok(())
    }

    /// SSLRequest: 8 bytes, answered by a single 'S' or 'N'.
    pub fn ssl_request(&mut self) -> Result<(), BuildError> {
        self.start_packet(None, 4)?.put_i32(SSL_REQUEST_CODE);
        Ok(())
    }

    /// CancelRequest, sent on a fresh connection.
    pub fn cancel_request(&mut self, process_id: i32, secret_key: &[u8]) -> Result<(), BuildError> {
        let buf = self.start_packet(None, 8 + secret_key.len())?;
        buf.put_i32(CANCEL_REQUEST_CODE);
        buf.put_i32(process_id);
        buf.put_slice(secret_key);
        Ok(())
    }

    // ==================== Simple Query ====================

    /// Query: 'Q', sql\0
    pub fn query(&mut self, sql: &str) -> Result<(), BuildError> {
        check_cstr(sql)?;
        let buf = self.start_packet(Some(b'Q'), sql.len() + 1)?;
        put_cstr(buf, sql);
        Ok(())
    }

    // ==================== Extended Query Protocol ====================

    /// Parse: 'P', statement\0, sql\0, i16 count, u32 oid* (0 = server infers)
    pub fn parse(&mut self, statement: &str, sql: &str, param_oids: &[u32]) -> Result<(), BuildError> {
        check_cstr(statement)?;
        check_cstr(sql)?;
        check_param_count(param_oids.len())?;
        let body_len = statement.len() + 1 + sql.len() + 1 + 2 + 4 * param_oids.len();
        let buf = self.start_packet(Some(b'P'), body_len)?;
        put_cstr(buf, statement);
        put_cstr(buf, sql);
        buf.put_i16(param_oids.len() as i16);
        for oid in param_oids {
            buf.put_u32(*oid);
        }
        Ok(())
    }

    /// Bind: 'B', portal\0, statement\0, formats, params, result formats.
    ///
    /// Every parameter and every result column uses binary format. Each value
    /// gets a 4-byte length placeholder patched after encoding, or -1 for NULL.
    pub fn bind<C: AsRef<Codec>>(
        &mut self,
        portal: &str,
        statement: &str,
        params: &[Value],
        codecs: &[C],
    ) -> Result<(), BuildError> {
        check_cstr(portal)?;
        check_cstr(statement)?;
        check_param_count(params.len())?;
        if params.len() != codecs.len() {
            return Err(BuildError::Invariant {
                expected: params.len(),
                actual: codecs.len(),
            });
        }
        self.start_open_packet(b'B')?;
        put_cstr(&mut self.buf, portal);
        put_cstr(&mut self.buf, statement);
        self.buf.put_i16(1);
        self.buf.put_i16(FORMAT_BINARY);
        self.buf.put_i16(params.len() as i16);
        for (index, (value, codec)) in params.iter().zip(codecs).enumerate() {
            self.put_param(index, value, codec.as_ref())?;
        }
        self.buf.put_i16(1);
        self.buf.put_i16(FORMAT_BINARY);
        self.finish_packet()
    }

    fn put_param(&mut self, index: usize, value: &Value, codec: &Codec) -> Result<(), BuildError> {
        let len_pos = self.buf.len();
        self.buf.put_i32(0);
        let is_null = codec
            .encode(value, &mut self.buf)
            .map_err(|source| BuildError::Param { index, source })?;
        let len = match is_null {
            IsNull::Yes => -1,
            IsNull::No => {
                let len = self.buf.len() - len_pos - 4;
                i32::try_from(len).map_err(|_| BuildError::PacketTooLarge(len))?
            }
        };
        self.buf[len_pos..len_pos + 4].copy_from_slice(&len.to_be_bytes());
        Ok(())
    }

    /// Describe: 'D', 'S' | 'P', name\0
    pub fn describe(&mut self, target: Target, name: &str) -> Result<(), BuildError> {
        check_cstr(name)?;
        let buf = self.start_packet(Some(b'D'), 1 + name.len() + 1)?;
        buf.put_u8(target.code());
        put_cstr(buf, name);
        Ok(())
    }

    /// Execute: 'E', portal\0, i32 max rows (0 = unlimited)
    pub fn execute(&mut self, portal: &str, max_rows: i32) -> Result<(), BuildError> {
        check_cstr(portal)?;
        let buf = self.start_packet(Some(b'E'), portal.len() + 1 + 4)?;
        put_cstr(buf, portal);
        buf.put_i32(max_rows);
        Ok(())
    }

    /// Close: 'C', 'S' | 'P', name\0
    pub fn close(&mut self, target: Target, name: &str) -> Result<(), BuildError> {
        check_cstr(name)?;
        let buf = self.start_packet(Some(b'C'), 1 + name.len() + 1)?;
        buf.put_u8(target.code());
        put_cstr(buf, name);
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), BuildError> {
        self.start_packet(Some(b'H'), 0).map(|_| ())
    }

    pub fn sync(&mut self) -> Result<(), BuildError> {
        self.start_packet(Some(b'S'), 0).map(|_| ())
    }

    pub fn terminate(&mut self) -> Result<(), BuildError> {
        self.start_packet(Some(b'X'), 0).map(|_| ())
    }

    /// FunctionCall: 'F', u32 function oid, binary args, binary result.
    pub fn function_call<C: AsRef<Codec>>(
        &mut self,
        function_oid: u32,
        args: &[Value],
        codecs: &[C],
    ) -> Result<(), BuildError> {
        check_param_count(args.len())?;
        if args.len() != codecs.len() {
            return Err(BuildError::Invariant {
                expected: args.len(),
                actual: codecs.len(),
            });
        }
        self.start_open_packet(b'F')?;
        self.buf.put_u32(function_oid);
        self.buf.put_i16(1);
        self.buf.put_i16(FORMAT_BINARY);
        self.buf.put_i16(args.len() as i16);
        for (index, (value, codec)) in args.iter().zip(codecs).enumerate() {
            self.put_param(index, value, codec.as_ref())?;
        }
        self.buf.put_i16(FORMAT_BINARY);
        self.finish_packet()
    }

    // ==================== COPY sub-protocol ====================

    pub fn copy_data(&mut self, data: &[u8]) -> Result<(), BuildError> {
        self.start_packet(Some(b'd'), data.len())?.put_slice(data);
        Ok(())
    }

    pub fn copy_done(&mut self) -> Result<(), BuildError> {
        self.start_packet(Some(b'c'), 0).map(|_| ())
    }

    pub fn copy_fail(&mut self, message: &str) -> Result<(), BuildError> {
        check_cstr(message)?;
        let buf = self.start_packet(Some(b'f'), message.len() + 1)?;
        put_cstr(buf, message);
        Ok(())
    }
}

fn check_cstr(s: &str) -> Result<(), BuildError> {
    if s.as_bytes().contains(&0) {
        return Err(BuildError::NullByte);
    }
    Ok(())
}

fn check_param_count(count: usize) -> Result<(), BuildError> {
    if count > i16::MAX as usize {
        return Err(BuildError::TooManyParameters(count));
    }
    Ok(())
}

fn put_cstr(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}
