//! Binary array format.
//!
//! ```text
//! i32 ndim | i32 has_null | u32 element oid
//! ndim x (i32 length, i32 lower bound)
//! per element: i32 length (-1 = NULL) | payload
//! ```
//!
//! Multi-dimensional arrays are nested `Value::Array`s and must be rectangular.

use super::{Codec, CodecError, IsNull, Value};
use bytes::{BufMut, BytesMut};

/// PostgreSQL's MAXDIM.
const MAX_DIMENSIONS: usize = 6;

/// Lower bound written for every dimension.
const LOWER_BOUND: i32 = 0;

/// Collect every non-array leaf of a (possibly ragged) nested array.
pub fn flatten_leaves<'a>(items: &'a [Value], out: &mut Vec<&'a Value>) {
    for item in items {
        match item {
            Value::Array(inner) => flatten_leaves(inner, out),
            leaf => out.push(leaf),
        }
    }
}

/// Dimensions and row-major leaves of a rectangular nested array.
fn layout<'a>(
    codec: &Codec,
    items: &'a [Value],
) -> Result<(Vec<usize>, Vec<&'a Value>), CodecError> {
    let mut dims = vec![items.len()];
    let mut probe = items;
    while let Some(Value::Array(inner)) = probe.first() {
        dims.push(inner.len());
        probe = inner;
    }
    if dims.len() > MAX_DIMENSIONS {
        return Err(codec.invalid(format!(
            "{} dimensions exceed the maximum of {MAX_DIMENSIONS}",
            dims.len()
        )));
    }
    let mut leaves = Vec::with_capacity(dims.iter().product());
    collect(codec, items, &dims, &mut leaves)?;
    Ok((dims, leaves))
}

fn collect<'a>(
    codec: &Codec,
    items: &'a [Value],
    dims: &[usize],
    out: &mut Vec<&'a Value>,
) -> Result<(), CodecError> {
    if items.len() != dims[0] {
        return Err(codec.invalid("array is not rectangular"));
    }
    let deeper = dims.len() > 1;
    for item in items {
        match (item, deeper) {
            (Value::Array(inner), true) => collect(codec, inner, &dims[1..], out)?,
            (Value::Array(_), false) | (_, true) => {
                return Err(codec.invalid("array is not rectangular"));
            }
            (leaf, false) => out.push(leaf),
        }
    }
    Ok(())
}

fn element_of(codec: &Codec) -> Result<&Codec, CodecError> {
    codec
        .element()
        .map(|e| e.as_ref())
        .ok_or_else(|| codec.invalid("array codec has no element codec"))
}

pub(super) fn encode(codec: &Codec, value: &Value, buf: &mut BytesMut) -> Result<IsNull, CodecError> {
    let element = element_of(codec)?;
    let Value::Array(items) = value else {
        return Err(codec.mismatch(value));
    };
    let (dims, leaves) = layout(codec, items)?;

    if leaves.is_empty() {
        buf.put_i32(0);
        buf.put_i32(0);
        buf.put_u32(element.oid());
        return Ok(IsNull::No);
    }

    buf.put_i32(dims.len() as i32);
    buf.put_i32(i32::from(leaves.iter().any(|v| v.is_null())));
    buf.put_u32(element.oid());
    for dim in &dims {
        buf.put_i32(*dim as i32);
        buf.put_i32(LOWER_BOUND);
    }

    for leaf in leaves {
        let len_pos = buf.len();
        buf.put_i32(0);
        match element.encode(leaf, buf)? {
            IsNull::Yes => {
                buf[len_pos..len_pos + 4].copy_from_slice(&(-1i32).to_be_bytes());
            }
            IsNull::No => {
                let len = buf.len() - len_pos - 4;
                buf[len_pos..len_pos + 4].copy_from_slice(&(len as i32).to_be_bytes());
            }
        }
    }
    Ok(IsNull::No)
}

pub(super) fn check(codec: &Codec, value: &Value) -> Result<(), CodecError> {
    let element = element_of(codec)?;
    let Value::Array(items) = value else {
        return Err(codec.mismatch(value));
    };
    let (_, leaves) = layout(codec, items)?;
    leaves.into_iter().try_for_each(|leaf| element.check(leaf))
}

struct Reader<'a> {
    codec: &'a Codec,
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.bytes.len())
            .ok_or_else(|| self.codec.invalid("truncated array"))?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn i32(&mut self) -> Result<i32, CodecError> {
        let raw = self.take(4)?;
        Ok(i32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }
}

pub(super) fn decode(codec: &Codec, bytes: &[u8]) -> Result<Value, CodecError> {
    let element = element_of(codec)?;
    let mut r = Reader { codec, bytes, pos: 0 };

    let ndim = r.i32()?;
    let _has_null = r.i32()?;
    let element_oid = r.i32()? as u32;
    if ndim < 0 || ndim as usize > MAX_DIMENSIONS {
        return Err(codec.invalid(format!("invalid dimension count {ndim}")));
    }
    if ndim == 0 {
        return Ok(Value::Array(Vec::new()));
    }
    if element_oid != element.oid() {
        return Err(codec.invalid(format!(
            "element OID {element_oid} does not match {}",
            element.name()
        )));
    }

    let mut dims = Vec::with_capacity(ndim as usize);
    let mut total: usize = 1;
    for _ in 0..ndim {
        let len = r.i32()?;
        let _lower_bound = r.i32()?;
        if len < 0 {
            return Err(codec.invalid(format!("negative dimension length {len}")));
        }
        dims.push(len as usize);
        total = total
            .checked_mul(len as usize)
            .filter(|t| *t <= bytes.len())
            .ok_or_else(|| codec.invalid("array dimensions exceed payload"))?;
    }

    let mut flat = Vec::with_capacity(total);
    for _ in 0..total {
        let len = r.i32()?;
        if len < 0 {
            flat.push(Value::Null);
        } else {
            flat.push(element.decode(r.take(len as usize)?)?);
        }
    }
    if r.pos != bytes.len() {
        return Err(codec.invalid("trailing bytes after array elements"));
    }

    Ok(nest(&dims, &mut flat.into_iter()))
}

fn nest(dims: &[usize], flat: &mut impl Iterator<Item = Value>) -> Value {
    match dims {
        [last] => Value::Array(flat.take(*last).collect()),
        [first, rest @ ..] => Value::Array((0..*first).map(|_| nest(rest, flat)).collect()),
        [] => Value::Array(Vec::new()),
    }
}
