//! Structural shape tests used for codec inference.

use super::value::Value;

/// Decides whether a host value structurally belongs to a type.
pub trait ShapeTest {
    fn matches(&self, value: &Value) -> bool;
}

/// Closed set of structural shapes the built-in codecs recognize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Shape {
    Bytes,
    Timestamp,
    Date,
    Uuid,
    Money,
    Point,
    Box,
    Circle,
    Lseg,
    Json,
}

impl ShapeTest for Shape {
    fn matches(&self, value: &Value) -> bool {
        match (self, value) {
            (Shape::Bytes, Value::Bytes(_)) => true,
            (Shape::Timestamp, Value::Timestamp(_)) => true,
            (Shape::Date, Value::Date(_)) => true,
            (Shape::Uuid, Value::Uuid(s) | Value::Text(s)) => parse_uuid(s).is_some(),
            (Shape::Money, Value::Money(_) | Value::Int(_)) => true,
            (Shape::Point, Value::Point(_)) => true,
            (Shape::Box, Value::Box(_)) => true,
            (Shape::Circle, Value::Circle(_)) => true,
            (Shape::Lseg, Value::Lseg(_)) => true,
            (Shape::Json, Value::Json(_)) => true,
            _ => false,
        }
    }
}

/// Parse a hex-with-dashes UUID (case-insensitive) into its 16 raw bytes.
pub fn parse_uuid(s: &str) -> Option<[u8; 16]> {
    let s = s.as_bytes();
    if s.len() != 36 {
        return None;
    }
    let mut out = [0u8; 16];
    let mut n = 0;
    let mut i = 0;
    while i < 36 {
        if matches!(i, 8 | 13 | 18 | 23) {
            if s[i] != b'-' {
                return None;
            }
            i += 1;
            continue;
        }
        let hi = hex_val(s[i])?;
        let lo = hex_val(s[i + 1])?;
        out[n] = (hi << 4) | lo;
        n += 1;
        i += 2;
    }
    Some(out)
}

fn hex_val(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

/// Format 16 raw bytes as lowercase hex-with-dashes.
pub fn format_uuid(bytes: &[u8; 16]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(36);
    for (i, b) in bytes.iter().enumerate() {
        if matches!(i, 4 | 6 | 8 | 10) {
            out.push('-');
        }
        out.push(HEX[(b >> 4) as usize] as char);
        out.push(HEX[(b & 0x0f) as usize] as char);
    }
    out
}
