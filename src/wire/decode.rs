//! Wire to [`Value`] conversion.
//!
//! Raw trees come from `rmpv`; this pass applies the protocol rules on top:
//! symbol extension, integer range, the depth bound and the split between
//! recoverable and fatal rejections.

use std::io::Read;

use super::{kind, Symbol, Value, SYMBOL_EXT};
use crate::error::{ErrorRecord, Failure, Fatal, StatusCode};
use crate::MAX_DEPTH;

/// Nesting limit for the raw parser. Looser than [`MAX_DEPTH`] so that the
/// envelope around a value fits; the exact bound is applied on conversion.
pub const RAW_MAX_DEPTH: usize = MAX_DEPTH + 8;

/// Fail fatally once `depth` exceeds [`MAX_DEPTH`].
///
/// # Errors
/// `structure_too_deep`
pub const fn check_depth(depth: usize) -> Result<(), Fatal> {
    if depth > MAX_DEPTH {
        return Err(Fatal(StatusCode::StructureTooDeep));
    }
    Ok(())
}

/// Name carried by a symbol ext payload.
///
/// # Errors
/// `bad_symbol` when the payload is not UTF-8
pub fn symbol_name(data: &[u8]) -> Result<&str, Fatal> {
    std::str::from_utf8(data).map_err(|_| Fatal(StatusCode::BadSymbol))
}

/// Whether `raw` is the symbol `name`
#[must_use]
pub fn is_symbol(raw: &rmpv::Value, name: &str) -> bool {
    matches!(raw, rmpv::Value::Ext(ty, data) if *ty == SYMBOL_EXT && data.as_slice() == name.as_bytes())
}

/// One raw wire node seen through the protocol rules, borrowing from the
/// raw tree. Containers hand back their raw children.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Node<'a> {
    /// nil
    Nil,
    /// Boolean
    Bool(bool),
    /// Integer within `i64`
    Int(i64),
    /// Float, widened to 64 bits
    Float(f64),
    /// UTF-8 string
    Str(&'a str),
    /// Binary blob
    Bytes(&'a [u8]),
    /// Symbol name
    Symbol(&'a str),
    /// Array elements
    Array(&'a [rmpv::Value]),
    /// Map entries
    Map(&'a [(rmpv::Value, rmpv::Value)]),
}

/// Classify one raw node.
///
/// # Errors
/// Recoverable `UnknownType` for strings that are not UTF-8 and
/// `UnknownExt` for extension types other than the symbol type; fatal
/// `overflow` and `bad_symbol`.
pub fn node(raw: &rmpv::Value) -> Result<Node<'_>, Failure> {
    let node = match raw {
        rmpv::Value::Nil => Node::Nil,
        rmpv::Value::Boolean(b) => Node::Bool(*b),
        rmpv::Value::Integer(n) => Node::Int(n.as_i64().ok_or(Fatal(StatusCode::Overflow))?),
        rmpv::Value::F32(f) => Node::Float(f64::from(*f)),
        rmpv::Value::F64(f) => Node::Float(*f),
        rmpv::Value::String(s) => match s.as_str() {
            Some(text) => Node::Str(text),
            None => return Err(ErrorRecord::UnknownType { type_tag: kind::STR }.into()),
        },
        rmpv::Value::Binary(bytes) => Node::Bytes(bytes),
        rmpv::Value::Array(items) => Node::Array(items),
        rmpv::Value::Map(entries) => Node::Map(entries),
        rmpv::Value::Ext(ty, data) if *ty == SYMBOL_EXT => Node::Symbol(symbol_name(data)?),
        rmpv::Value::Ext(ty, _) => return Err(ErrorRecord::UnknownExt { ext_tag: *ty }.into()),
    };
    Ok(node)
}

/// Check a raw tree against every rule [`from_wire`] applies, without
/// building anything. Nodes are visited in the same order, so the first
/// failure reported is the same one.
///
/// # Errors
/// As [`from_wire`]
pub fn validate(raw: &rmpv::Value) -> Result<(), Failure> {
    walk(raw, 0)
}

fn walk(raw: &rmpv::Value, depth: usize) -> Result<(), Failure> {
    check_depth(depth)?;
    match node(raw)? {
        Node::Array(items) => items.iter().try_for_each(|item| walk(item, depth + 1)),
        Node::Map(entries) => entries.iter().try_for_each(|(k, v)| {
            walk(k, depth + 1)?;
            walk(v, depth + 1)
        }),
        _ => Ok(()),
    }
}

/// Convert a raw wire tree into a [`Value`].
///
/// # Errors
/// As [`node`], plus fatal `structure_too_deep`.
pub fn from_wire(raw: &rmpv::Value) -> Result<Value, Failure> {
    convert(raw, 0)
}

fn convert(raw: &rmpv::Value, depth: usize) -> Result<Value, Failure> {
    check_depth(depth)?;

    let value = match node(raw)? {
        Node::Nil => Value::Nil,
        Node::Bool(b) => Value::Bool(b),
        Node::Int(n) => Value::Int(n),
        Node::Float(f) => Value::Float(f),
        Node::Str(text) => Value::str(text),
        Node::Bytes(bytes) => Value::Bytes(bytes.to_vec()),
        Node::Symbol(name) => Value::Symbol(Symbol::new(name)),
        Node::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| convert(item, depth + 1))
                .collect::<Result<_, _>>()?,
        ),
        Node::Map(entries) => Value::Map(
            entries
                .iter()
                .map(|(k, v)| Ok((convert(k, depth + 1)?, convert(v, depth + 1)?)))
                .collect::<Result<_, Failure>>()?,
        ),
    };

    Ok(value)
}

/// Read one complete value from `rd`.
///
/// # Errors
/// Fatal `bad_input` on malformed or truncated data, `structure_too_deep`
/// when the raw nesting limit is hit, plus everything [`from_wire`] raises.
pub fn read_value<R: Read>(rd: &mut R) -> Result<Value, Failure> {
    let raw = rmpv::decode::read_value_with_max_depth(rd, RAW_MAX_DEPTH).map_err(|e| match e {
        rmpv::decode::Error::DepthLimitExceeded => Fatal(StatusCode::StructureTooDeep),
        _ => Fatal(StatusCode::BadInput),
    })?;
    from_wire(&raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nested_array(levels: usize) -> rmpv::Value {
        let mut value = rmpv::Value::Nil;
        for _ in 0..levels {
            value = rmpv::Value::Array(vec![value]);
        }
        value
    }

    #[test]
    fn test_scalars() {
        assert_eq!(from_wire(&rmpv::Value::Nil), Ok(Value::Nil));
        assert_eq!(from_wire(&rmpv::Value::from(true)), Ok(Value::Bool(true)));
        assert_eq!(from_wire(&rmpv::Value::from(-5)), Ok(Value::Int(-5)));
        assert_eq!(from_wire(&rmpv::Value::F32(1.5)), Ok(Value::Float(1.5)));
        assert_eq!(from_wire(&rmpv::Value::from("hi")), Ok(Value::str("hi")));
        assert_eq!(
            from_wire(&rmpv::Value::Binary(vec![0, 255])),
            Ok(Value::Bytes(vec![0, 255]))
        );
    }

    #[test]
    fn test_symbol_ext() {
        let raw = rmpv::Value::Ext(SYMBOL_EXT, b"output".to_vec());
        assert_eq!(from_wire(&raw), Ok(Value::symbol("output")));
        assert!(is_symbol(&raw, "output"));
        assert!(!is_symbol(&rmpv::Value::from("output"), "output"));
    }

    #[test]
    fn test_bad_symbol_is_fatal() {
        let raw = rmpv::Value::Ext(SYMBOL_EXT, vec![0xff, 0xfe]);
        assert_eq!(from_wire(&raw), Err(StatusCode::BadSymbol.into()));
    }

    #[test]
    fn test_unknown_ext_is_recoverable() {
        let raw = rmpv::Value::Array(vec![rmpv::Value::Ext(7, vec![1])]);
        assert_eq!(
            from_wire(&raw),
            Err(Failure::Recoverable(ErrorRecord::UnknownExt { ext_tag: 7 }))
        );
    }

    #[test]
    fn test_invalid_utf8_is_unknown_type() {
        let bytes = [0xa2, 0xc3, 0x28];
        let raw = rmpv::decode::read_value(&mut &bytes[..]).unwrap();
        assert_eq!(
            from_wire(&raw),
            Err(Failure::Recoverable(ErrorRecord::UnknownType { type_tag: kind::STR }))
        );
    }

    #[test]
    fn test_u64_overflow_is_fatal() {
        let raw = rmpv::Value::from(u64::MAX);
        assert_eq!(from_wire(&raw), Err(StatusCode::Overflow.into()));
        assert_eq!(from_wire(&rmpv::Value::from(i64::MAX as u64)), Ok(Value::Int(i64::MAX)));
    }

    #[test]
    fn test_depth_limit() {
        // 32 arrays put the innermost scalar at depth 32.
        assert!(from_wire(&nested_array(MAX_DEPTH)).is_ok());
        assert_eq!(
            from_wire(&nested_array(MAX_DEPTH + 1)),
            Err(StatusCode::StructureTooDeep.into())
        );
    }

    #[test]
    fn test_validate_matches_conversion() {
        let cases = [
            rmpv::Value::Array(vec![rmpv::Value::from(1), rmpv::Value::Ext(7, vec![1])]),
            rmpv::Value::Map(vec![(
                rmpv::Value::Ext(SYMBOL_EXT, vec![0xff]),
                rmpv::Value::from(u64::MAX),
            )]),
            nested_array(MAX_DEPTH + 1),
            nested_array(MAX_DEPTH),
            rmpv::Value::Binary(vec![1, 2]),
        ];
        for raw in cases {
            assert_eq!(validate(&raw), from_wire(&raw).map(|_| ()), "{raw:?}");
        }
    }

    #[test]
    fn test_node_borrows() {
        let raw = rmpv::Value::from("text");
        assert_eq!(node(&raw), Ok(Node::Str("text")));
        let raw = rmpv::Value::Ext(SYMBOL_EXT, Vec::new());
        assert_eq!(node(&raw), Ok(Node::Symbol("")));
    }

    #[test]
    fn test_read_value_truncated() {
        let bytes = [0x92, 0x01];
        assert_eq!(read_value(&mut &bytes[..]), Err(StatusCode::BadInput.into()));
    }

    #[test]
    fn test_read_value_raw_depth() {
        let mut bytes = vec![0x91; RAW_MAX_DEPTH + 1];
        bytes.push(0xc0);
        assert_eq!(
            read_value(&mut bytes.as_slice()),
            Err(StatusCode::StructureTooDeep.into())
        );
    }
}
