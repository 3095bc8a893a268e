//! PostgreSQL Wire Protocol Messages
//!
//! Backend (server → client) message parsing.
//! Reference: https://www.postgresql.org/docs/current/protocol-message-formats.html

/// Backend message tags
pub mod tag {
    pub const AUTHENTICATION: u8 = b'R';
    pub const PARAMETER_STATUS: u8 = b'S';
    pub const BACKEND_KEY_DATA: u8 = b'K';
    pub const READY_FOR_QUERY: u8 = b'Z';
    pub const ROW_DESCRIPTION: u8 = b'T';
    pub const DATA_ROW: u8 = b'D';
    pub const COMMAND_COMPLETE: u8 = b'C';
    pub const ERROR_RESPONSE: u8 = b'E';
    pub const NOTICE_RESPONSE: u8 = b'N';
    pub const PARSE_COMPLETE: u8 = b'1';
    pub const BIND_COMPLETE: u8 = b'2';
    pub const CLOSE_COMPLETE: u8 = b'3';
    pub const NO_DATA: u8 = b'n';
    pub const PORTAL_SUSPENDED: u8 = b's';
    pub const PARAMETER_DESCRIPTION: u8 = b't';
    pub const EMPTY_QUERY: u8 = b'I';
    pub const NOTIFICATION: u8 = b'A';
    pub const NEGOTIATE_PROTOCOL_VERSION: u8 = b'v';
    pub const COPY_IN_RESPONSE: u8 = b'G';
    pub const COPY_OUT_RESPONSE: u8 = b'H';
    pub const COPY_BOTH_RESPONSE: u8 = b'W';
    pub const COPY_DATA: u8 = b'd';
    pub const COPY_DONE: u8 = b'c';
    pub const FUNCTION_CALL_RESPONSE: u8 = b'V';
}

/// Backend (server → client) message types
#[derive(Debug, Clone)]
pub enum BackendMessage<'a> {
    AuthenticationOk,
    AuthenticationCleartextPassword,
    AuthenticationMD5Password([u8; 4]),
    AuthenticationSASL(Vec<String>),
    /// Any other authentication request (GSS, SSPI, SASL continuation, ...)
    AuthenticationOther(i32),
    /// Parameter status (server config)
    ParameterStatus {
        name: String,
        value: String,
    },
    /// Backend key data (for cancel). Protocol 3.2 allows secrets up to 256 bytes.
    BackendKeyData {
        process_id: i32,
        secret_key: Vec<u8>,
    },
    ReadyForQuery(TransactionStatus),
    RowDescription(Vec<FieldDescription>),
    ParameterDescription(Vec<u32>),
    DataRow(DataRow<'a>),
    CommandComplete(String),
    ErrorResponse(ErrorFields),
    ParseComplete,
    BindComplete,
    CloseComplete,
    NoData,
    PortalSuspended,
    EmptyQueryResponse,
    /// Notice response (warning/info messages, not errors)
    NoticeResponse(ErrorFields),
    /// Notification response (async notification from LISTEN/NOTIFY)
    NotificationResponse {
        process_id: i32,
        channel: String,
        payload: String,
    },
    /// Server supports an older minor version than requested
    NegotiateProtocolVersion {
        newest_minor: i32,
        unrecognized: Vec<String>,
    },
    CopyInResponse,
    CopyOutResponse,
    CopyBothResponse,
    CopyData(&'a [u8]),
    CopyDone,
    FunctionCallResponse(Option<&'a [u8]>),
}

/// Transaction status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Idle,    // 'I'
    InBlock, // 'T'
    Failed,  // 'E'
}

/// Field description in RowDescription
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDescription {
    pub name: String,
    pub table_oid: u32,
    pub column_attr: i16,
    pub type_oid: u32,
    pub type_size: i16,
    pub type_modifier: i32,
    pub format: i16,
}

/// Fields of an ErrorResponse or NoticeResponse
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ErrorFields {
    /// Non-localized severity when the server sends it (`V`), else `S`.
    pub severity: String,
    pub code: String,
    pub message: String,
    pub detail: Option<String>,
    pub hint: Option<String>,
    pub position: Option<u32>,
    pub internal_position: Option<u32>,
    pub internal_query: Option<String>,
    pub where_: Option<String>,
    pub schema: Option<String>,
    pub table: Option<String>,
    pub column: Option<String>,
    pub data_type: Option<String>,
    pub constraint: Option<String>,
    pub file: Option<String>,
    pub line: Option<u32>,
    pub routine: Option<String>,
}

impl ErrorFields {
    /// FATAL and PANIC terminate the session.
    pub fn is_fatal(&self) -> bool {
        matches!(self.severity.as_str(), "FATAL" | "PANIC")
    }
}

impl std::fmt::Display for ErrorFields {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}: {}", self.severity, self.code, self.message)?;
        if let Some(ref detail) = self.detail {
            write!(f, " (DETAIL: {})", detail)?;
        }
        if let Some(ref hint) = self.hint {
            write!(f, " (HINT: {})", hint)?;
        }
        Ok(())
    }
}

/// Borrowed DataRow body; fields are read lazily.
#[derive(Debug, Clone, Copy)]
pub struct DataRow<'a> {
    count: usize,
    body: &'a [u8],
}

impl<'a> DataRow<'a> {
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Iterate columns; `None` is SQL NULL.
    pub fn fields(&self) -> DataRowFields<'a> {
        DataRowFields {
            cursor: Cursor::new(self.body),
            remaining: self.count,
        }
    }
}

pub struct DataRowFields<'a> {
    cursor: Cursor<'a>,
    remaining: usize,
}

impl<'a> Iterator for DataRowFields<'a> {
    type Item = Result<Option<&'a [u8]>, String>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        Some(self.cursor.field())
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

/// Bounds-checked reader over a message body.
struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], String> {
        if self.buf.len() - self.pos < n {
            return Err(format!(
                "Message truncated: need {} bytes at offset {}, have {}",
                n,
                self.pos,
                self.buf.len() - self.pos
            ));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, String> {
        Ok(self.take(1)?[0])
    }

    fn i16(&mut self) -> Result<i16, String> {
        let b = self.take(2)?;
        Ok(i16::from_be_bytes([b[0], b[1]]))
    }

    fn i32(&mut self) -> Result<i32, String> {
        let b = self.take(4)?;
        Ok(i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u32(&mut self) -> Result<u32, String> {
        Ok(self.i32()? as u32)
    }

    /// Null-terminated string
    fn cstr(&mut self) -> Result<String, String> {
        let rest = &self.buf[self.pos..];
        let end = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or("Missing null terminator")?;
        let s = String::from_utf8_lossy(&rest[..end]).into_owned();
        self.pos += end + 1;
        Ok(s)
    }

    fn rest(&mut self) -> &'a [u8] {
        let slice = &self.buf[self.pos..];
        self.pos = self.buf.len();
        slice
    }

    fn field(&mut self) -> Result<Option<&'a [u8]>, String> {
        let len = self.i32()?;
        if len < 0 {
            Ok(None)
        } else {
            self.take(len as usize).map(Some)
        }
    }

    fn finish(&self, what: &str) -> Result<(), String> {
        if self.pos != self.buf.len() {
            return Err(format!(
                "{}: {} trailing bytes",
                what,
                self.buf.len() - self.pos
            ));
        }
        Ok(())
    }
}

impl<'a> BackendMessage<'a> {
    /// Decode a message from its tag and body (length header already stripped).
    pub fn decode(code: u8, body: &'a [u8]) -> Result<Self, String> {
        let mut c = Cursor::new(body);
        let message = match code {
            tag::AUTHENTICATION => Self::decode_auth(&mut c)?,
            tag::PARAMETER_STATUS => BackendMessage::ParameterStatus {
                name: c.cstr()?,
                value: c.cstr()?,
            },
            tag::BACKEND_KEY_DATA => {
                let process_id = c.i32()?;
                let secret_key = c.rest().to_vec();
                if secret_key.len() < 4 || secret_key.len() > 256 {
                    return Err(format!(
                        "BackendKeyData secret of {} bytes",
                        secret_key.len()
                    ));
                }
                BackendMessage::BackendKeyData {
                    process_id,
                    secret_key,
                }
            }
            tag::READY_FOR_QUERY => {
                let status = match c.u8()? {
                    b'I' => TransactionStatus::Idle,
                    b'T' => TransactionStatus::InBlock,
                    b'E' => TransactionStatus::Failed,
                    other => return Err(format!("Unknown transaction status: {}", other)),
                };
                BackendMessage::ReadyForQuery(status)
            }
            tag::ROW_DESCRIPTION => Self::decode_row_description(&mut c)?,
            tag::PARAMETER_DESCRIPTION => {
                let count = c.i16()?;
                if count < 0 {
                    return Err(format!("Negative parameter count: {}", count));
                }
                let oids = (0..count).map(|_| c.u32()).collect::<Result<_, _>>()?;
                BackendMessage::ParameterDescription(oids)
            }
            tag::DATA_ROW => {
                let count = c.i16()?;
                if count < 0 {
                    return Err(format!("Negative column count: {}", count));
                }
                BackendMessage::DataRow(DataRow {
                    count: count as usize,
                    body: c.rest(),
                })
            }
            tag::COMMAND_COMPLETE => BackendMessage::CommandComplete(c.cstr()?),
            tag::ERROR_RESPONSE => BackendMessage::ErrorResponse(Self::parse_error_fields(&mut c)?),
            tag::NOTICE_RESPONSE => BackendMessage::NoticeResponse(Self::parse_error_fields(&mut c)?),
            tag::PARSE_COMPLETE => BackendMessage::ParseComplete,
            tag::BIND_COMPLETE => BackendMessage::BindComplete,
            tag::CLOSE_COMPLETE => BackendMessage::CloseComplete,
            tag::NO_DATA => BackendMessage::NoData,
            tag::PORTAL_SUSPENDED => BackendMessage::PortalSuspended,
            tag::EMPTY_QUERY => BackendMessage::EmptyQueryResponse,
            tag::NOTIFICATION => BackendMessage::NotificationResponse {
                process_id: c.i32()?,
                channel: c.cstr()?,
                payload: c.cstr()?,
            },
            tag::NEGOTIATE_PROTOCOL_VERSION => {
                let newest_minor = c.i32()?;
                let count = c.i32()?;
                let unrecognized = (0..count.max(0))
                    .map(|_| c.cstr())
                    .collect::<Result<_, _>>()?;
                BackendMessage::NegotiateProtocolVersion {
                    newest_minor,
                    unrecognized,
                }
            }
            tag::COPY_IN_RESPONSE => {
                c.rest();
                BackendMessage::CopyInResponse
            }
            tag::COPY_OUT_RESPONSE => {
                c.rest();
                BackendMessage::CopyOutResponse
            }
            tag::COPY_BOTH_RESPONSE => {
                c.rest();
                BackendMessage::CopyBothResponse
            }
            tag::COPY_DATA => BackendMessage::CopyData(c.rest()),
            tag::COPY_DONE => BackendMessage::CopyDone,
            tag::FUNCTION_CALL_RESPONSE => BackendMessage::FunctionCallResponse(c.field()?),
            _ => return Err(format!("Unknown message type: {}", code as char)),
        };
        c.finish(&format!("Message '{}'", code as char))?;
        Ok(message)
    }

    fn decode_auth(c: &mut Cursor<'a>) -> Result<Self, String> {
        let auth_type = c.i32()?;
        let message = match auth_type {
            0 => BackendMessage::AuthenticationOk,
            3 => BackendMessage::AuthenticationCleartextPassword,
            5 => {
                let salt = c.take(4)?;
                BackendMessage::AuthenticationMD5Password([salt[0], salt[1], salt[2], salt[3]])
            }
            10 => {
                // SASL - parse mechanism list
                let mut mechanisms = Vec::new();
                loop {
                    let mechanism = c.cstr()?;
                    if mechanism.is_empty() {
                        break;
                    }
                    mechanisms.push(mechanism);
                }
                BackendMessage::AuthenticationSASL(mechanisms)
            }
            other => {
                c.rest();
                BackendMessage::AuthenticationOther(other)
            }
        };
        Ok(message)
    }

    fn decode_row_description(c: &mut Cursor<'a>) -> Result<Self, String> {
        let field_count = c.i16()?;
        if field_count < 0 {
            return Err(format!("Negative field count: {}", field_count));
        }
        let mut fields = Vec::with_capacity(field_count as usize);
        for _ in 0..field_count {
            fields.push(FieldDescription {
                name: c.cstr()?,
                table_oid: c.u32()?,
                column_attr: c.i16()?,
                type_oid: c.u32()?,
                type_size: c.i16()?,
                type_modifier: c.i32()?,
                format: c.i16()?,
            });
        }
        Ok(BackendMessage::RowDescription(fields))
    }

    fn parse_error_fields(c: &mut Cursor<'a>) -> Result<ErrorFields, String> {
        let mut fields = ErrorFields::default();
        let mut localized_severity = String::new();
        loop {
            let field_type = c.u8()?;
            if field_type == 0 {
                break;
            }
            let value = c.cstr()?;
            match field_type {
                b'S' => localized_severity = value,
                b'V' => fields.severity = value,
                b'C' => fields.code = value,
                b'M' => fields.message = value,
                b'D' => fields.detail = Some(value),
                b'H' => fields.hint = Some(value),
                b'P' => fields.position = value.parse().ok(),
                b'p' => fields.internal_position = value.parse().ok(),
                b'q' => fields.internal_query = Some(value),
                b'W' => fields.where_ = Some(value),
                b's' => fields.schema = Some(value),
                b't' => fields.table = Some(value),
                b'c' => fields.column = Some(value),
                b'd' => fields.data_type = Some(value),
                b'n' => fields.constraint = Some(value),
                b'F' => fields.file = Some(value),
                b'L' => fields.line = value.parse().ok(),
                b'R' => fields.routine = Some(value),
                _ => {}
            }
        }
        if fields.severity.is_empty() {
            fields.severity = localized_severity;
        }
        Ok(fields)
    }
}

/// Parse the row count from a CommandComplete tag.
///
/// `INSERT 0 5` → 5, `UPDATE 3` → 3, `CREATE TABLE` → 0.
pub fn parse_affected_rows(tag: &str) -> u64 {
    tag.rsplit(' ')
        .next()
        .and_then(|s| s.parse().ok())
        .unwrap_or(0)
}

/// The command word(s) of a CommandComplete tag, without counts.
pub fn parse_command(tag: &str) -> &str {
    let mut parts = tag.split(' ');
    match parts.next() {
        Some(first @ ("INSERT" | "SELECT" | "UPDATE" | "DELETE" | "MERGE" | "MOVE" | "FETCH"
        | "COPY")) => first,
        _ => tag,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn error_body(fields: &[(u8, &str)]) -> Vec<u8> {
        let mut body = Vec::new();
        for (code, value) in fields {
            body.push(*code);
            body.extend_from_slice(value.as_bytes());
            body.push(0);
        }
        body.push(0);
        body
    }

    #[test]
    fn test_error_response_fields() {
        let body = error_body(&[
            (b'S', "ERREUR"),
            (b'V', "ERROR"),
            (b'C', "23505"),
            (b'M', "duplicate key value"),
            (b'D', "Key (id)=(1) already exists."),
            (b'P', "15"),
            (b'n', "users_pkey"),
            (b'L', "664"),
        ]);
        let msg = BackendMessage::decode(b'E', &body).unwrap();
        let BackendMessage::ErrorResponse(fields) = msg else {
            panic!("expected ErrorResponse");
        };
        assert_eq!(fields.severity, "ERROR");
        assert_eq!(fields.code, "23505");
        assert_eq!(fields.position, Some(15));
        assert_eq!(fields.constraint.as_deref(), Some("users_pkey"));
        assert_eq!(fields.line, Some(664));
        assert!(!fields.is_fatal());
    }

    #[test]
    fn test_data_row_fields() {
        let mut body = vec![0, 3];
        body.extend_from_slice(&2i32.to_be_bytes());
        body.extend_from_slice(b"hi");
        body.extend_from_slice(&(-1i32).to_be_bytes());
        body.extend_from_slice(&0i32.to_be_bytes());
        let BackendMessage::DataRow(row) = BackendMessage::decode(b'D', &body).unwrap() else {
            panic!("expected DataRow");
        };
        let fields: Vec<_> = row.fields().collect::<Result<_, _>>().unwrap();
        assert_eq!(fields, vec![Some(&b"hi"[..]), None, Some(&b""[..])]);
    }

    #[test]
    fn test_truncated_data_row() {
        let mut body = vec![0, 1];
        body.extend_from_slice(&10i32.to_be_bytes());
        body.extend_from_slice(b"abc");
        let BackendMessage::DataRow(row) = BackendMessage::decode(b'D', &body).unwrap() else {
            panic!("expected DataRow");
        };
        assert!(row.fields().next().unwrap().is_err());
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        assert!(BackendMessage::decode(b'1', &[0]).is_err());
        assert!(BackendMessage::decode(b'?', &[]).is_err());
    }

    #[test]
    fn test_parameter_description() {
        let mut body = vec![0, 2];
        body.extend_from_slice(&23u32.to_be_bytes());
        body.extend_from_slice(&25u32.to_be_bytes());
        match BackendMessage::decode(b't', &body).unwrap() {
            BackendMessage::ParameterDescription(oids) => assert_eq!(oids, vec![23, 25]),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_affected_rows() {
        assert_eq!(parse_affected_rows("INSERT 0 5"), 5);
        assert_eq!(parse_affected_rows("UPDATE 3"), 3);
        assert_eq!(parse_affected_rows("CREATE TABLE"), 0);
        assert_eq!(parse_command("INSERT 0 5"), "INSERT");
        assert_eq!(parse_command("CREATE TABLE"), "CREATE TABLE");
    }
}
