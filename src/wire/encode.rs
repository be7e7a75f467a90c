//! [`Value`] to wire encoding.
//!
//! Every writer here targets any [`Write`], so a value can be encoded into
//! a buffer or streamed straight to the output channel.

use std::io::Write;

use super::{Value, SYMBOL_EXT};
use crate::error::{Fatal, StatusCode};
use crate::wire::decode::check_depth;

fn io_failure<E>(_: E) -> Fatal {
    Fatal(StatusCode::IoFailure)
}

/// A value that can be written as one wire value.
///
/// `check` walks everything `encode` would write and fails the same way,
/// so a caller can refuse a value before any byte of it is out.
pub trait Encode {
    /// Reject a value that cannot be encoded.
    ///
    /// # Errors
    /// Whatever [`Encode::encode`] would fail with, short of I/O
    fn check(&self) -> Result<(), Fatal>;

    /// Write the value to `wr`.
    ///
    /// # Errors
    /// `io_failure` when `wr` fails, plus anything [`Encode::check`] reports
    fn encode<W: Write>(&self, wr: &mut W) -> Result<(), Fatal>;
}

impl Encode for Value {
    fn check(&self) -> Result<(), Fatal> {
        write_nested::<std::io::Sink>(None, self, 0)
    }

    fn encode<W: Write>(&self, wr: &mut W) -> Result<(), Fatal> {
        write_nested(Some(wr), self, 0)
    }
}

/// Append the symbol `name` as a symbol extension.
///
/// # Errors
/// `overflow` when the name is longer than `u32::MAX` bytes
pub fn write_symbol<W: Write>(wr: &mut W, name: &str) -> Result<(), Fatal> {
    let len = u32::try_from(name.len()).map_err(|_| Fatal(StatusCode::Overflow))?;
    rmp::encode::write_ext_meta(wr, len, SYMBOL_EXT).map_err(io_failure)?;
    wr.write_all(name.as_bytes()).map_err(io_failure)
}

/// Append a string.
///
/// # Errors
/// `overflow` when the string is longer than `u32::MAX` bytes
pub fn write_str<W: Write>(wr: &mut W, text: &str) -> Result<(), Fatal> {
    if u32::try_from(text.len()).is_err() {
        return Err(Fatal(StatusCode::Overflow));
    }
    rmp::encode::write_str(wr, text).map_err(io_failure)
}

/// Append a binary blob.
///
/// # Errors
/// `overflow` when the blob is longer than `u32::MAX` bytes
pub fn write_bin<W: Write>(wr: &mut W, bytes: &[u8]) -> Result<(), Fatal> {
    if u32::try_from(bytes.len()).is_err() {
        return Err(Fatal(StatusCode::Overflow));
    }
    rmp::encode::write_bin(wr, bytes).map_err(io_failure)
}

/// Append an array header.
///
/// # Errors
/// `structure_too_deep` when `len` does not fit the wire format
pub fn write_array_len<W: Write>(wr: &mut W, len: usize) -> Result<(), Fatal> {
    let len = u32::try_from(len).map_err(|_| Fatal(StatusCode::StructureTooDeep))?;
    rmp::encode::write_array_len(wr, len).map_err(io_failure)?;
    Ok(())
}

/// Append a map header.
///
/// # Errors
/// `structure_too_deep` when `len` does not fit the wire format
pub fn write_map_len<W: Write>(wr: &mut W, len: usize) -> Result<(), Fatal> {
    let len = u32::try_from(len).map_err(|_| Fatal(StatusCode::StructureTooDeep))?;
    rmp::encode::write_map_len(wr, len).map_err(io_failure)?;
    Ok(())
}

/// Append a signed integer in its most compact form.
///
/// # Errors
/// Only on a failing write
pub fn write_int<W: Write>(wr: &mut W, n: i64) -> Result<(), Fatal> {
    rmp::encode::write_sint(wr, n).map_err(io_failure)?;
    Ok(())
}

/// Append an unsigned integer in its most compact form.
///
/// # Errors
/// Only on a failing write
pub fn write_uint<W: Write>(wr: &mut W, n: u64) -> Result<(), Fatal> {
    rmp::encode::write_uint(wr, n).map_err(io_failure)?;
    Ok(())
}

/// Append a float.
///
/// # Errors
/// Only on a failing write
pub fn write_float<W: Write>(wr: &mut W, f: f64) -> Result<(), Fatal> {
    rmp::encode::write_f64(wr, f).map_err(io_failure)
}

/// Append nil.
///
/// # Errors
/// Only on a failing write
pub fn write_nil<W: Write>(wr: &mut W) -> Result<(), Fatal> {
    rmp::encode::write_nil(wr).map_err(io_failure)
}

/// Append a boolean.
///
/// # Errors
/// Only on a failing write
pub fn write_bool<W: Write>(wr: &mut W, b: bool) -> Result<(), Fatal> {
    rmp::encode::write_bool(wr, b).map_err(io_failure)
}

/// Reject a length the wire cannot carry, with `status`.
///
/// # Errors
/// `status` when `len` exceeds `u32::MAX`
pub fn check_len(len: usize, status: StatusCode) -> Result<(), Fatal> {
    u32::try_from(len).map(drop).map_err(|_| Fatal(status))
}

/// Run `f` against the writer when there is one. Traversals pass `None` to
/// check a value without writing it.
pub fn put<W: Write>(
    wr: Option<&mut W>,
    f: impl FnOnce(&mut W) -> Result<(), Fatal>,
) -> Result<(), Fatal> {
    wr.map_or(Ok(()), f)
}

/// Append `value`, rejecting nesting deeper than [`crate::MAX_DEPTH`].
///
/// # Errors
/// `structure_too_deep` or `overflow`
pub fn write_value<W: Write>(wr: &mut W, value: &Value) -> Result<(), Fatal> {
    value.encode(wr)
}

fn write_nested<W: Write>(mut wr: Option<&mut W>, value: &Value, depth: usize) -> Result<(), Fatal> {
    check_depth(depth)?;

    match value {
        Value::Nil => put(wr, write_nil),
        Value::Bool(b) => put(wr, |w| write_bool(w, *b)),
        Value::Int(n) => put(wr, |w| write_int(w, *n)),
        Value::Float(f) => put(wr, |w| write_float(w, *f)),
        Value::Str(s) => {
            check_len(s.len(), StatusCode::Overflow)?;
            put(wr, |w| write_str(w, s))
        }
        Value::Bytes(bytes) => {
            check_len(bytes.len(), StatusCode::Overflow)?;
            put(wr, |w| write_bin(w, bytes))
        }
        Value::Symbol(sym) => {
            check_len(sym.as_str().len(), StatusCode::Overflow)?;
            put(wr, |w| write_symbol(w, sym.as_str()))
        }
        Value::Array(items) => {
            check_len(items.len(), StatusCode::StructureTooDeep)?;
            put(wr.as_deref_mut(), |w| write_array_len(w, items.len()))?;
            items
                .iter()
                .try_for_each(|item| write_nested(wr.as_deref_mut(), item, depth + 1))
        }
        Value::Map(entries) => {
            check_len(entries.len(), StatusCode::StructureTooDeep)?;
            put(wr.as_deref_mut(), |w| write_map_len(w, entries.len()))?;
            entries.iter().try_for_each(|(key, item)| {
                write_nested(wr.as_deref_mut(), key, depth + 1)?;
                write_nested(wr.as_deref_mut(), item, depth + 1)
            })
        }
    }
}

/// Encode `value` into a fresh buffer.
///
/// # Errors
/// As [`write_value`]
pub fn to_vec(value: &Value) -> Result<Vec<u8>, Fatal> {
    let mut buf = Vec::new();
    write_value(&mut buf, value)?;
    Ok(buf)
}
