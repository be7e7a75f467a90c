//! Wire protocol value model.
//!
//! The protocol is MessagePack with one extension: ext type `0` carries a
//! symbol, its payload being the raw identifier bytes. Every traversal in
//! either direction is bounded by [`crate::MAX_DEPTH`].

pub mod decode;
pub mod encode;

use std::fmt;

pub use decode::{from_wire, read_value, validate};
pub use encode::{to_vec, write_value, Encode};

/// Extension type code carrying a symbol
pub const SYMBOL_EXT: i8 = 0;

/// Kind codes reported in `unknown_type` error records.
pub mod kind {
    /// nil
    pub const NIL: u32 = 0;
    /// true/false
    pub const BOOLEAN: u32 = 1;
    /// non-negative integer
    pub const POSITIVE_INTEGER: u32 = 2;
    /// negative integer
    pub const NEGATIVE_INTEGER: u32 = 3;
    /// 64-bit float
    pub const FLOAT64: u32 = 4;
    /// string
    pub const STR: u32 = 5;
    /// array
    pub const ARRAY: u32 = 6;
    /// map
    pub const MAP: u32 = 7;
    /// binary blob
    pub const BIN: u32 = 8;
    /// extension
    pub const EXT: u32 = 9;
    /// 32-bit float
    pub const FLOAT32: u32 = 10;
}

/// An interned identifier, distinct from a string on the wire.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Symbol(String);

impl Symbol {
    /// Create a symbol from its name
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The identifier text
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, ":{}", self.0)
    }
}

/// A protocol value.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    /// nil
    Nil,
    /// Boolean
    Bool(bool),
    /// Signed 64-bit integer
    Int(i64),
    /// 64-bit float
    Float(f64),
    /// UTF-8 string
    Str(String),
    /// Raw bytes
    Bytes(Vec<u8>),
    /// Symbol
    Symbol(Symbol),
    /// Ordered sequence
    Array(Vec<Value>),
    /// Ordered key/value pairs
    Map(Vec<(Value, Value)>),
}

impl Value {
    /// Shorthand for `Value::Symbol(Symbol::new(name))`
    #[must_use]
    pub fn symbol(name: impl Into<String>) -> Self {
        Self::Symbol(Symbol::new(name))
    }

    /// Shorthand for `Value::Str`
    #[must_use]
    pub fn str(text: impl Into<String>) -> Self {
        Self::Str(text.into())
    }

    /// Look up the entry keyed by the symbol `name` in a map
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Self> {
        match self {
            Self::Map(entries) => entries.iter().find_map(|(key, value)| match key {
                Self::Symbol(sym) if sym.as_str() == name => Some(value),
                _ => None,
            }),
            _ => None,
        }
    }

    /// String contents, if this is a `Str`
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Integer contents, if this is an `Int`
    #[must_use]
    pub const fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(n) => Some(*n),
            _ => None,
        }
    }

    /// Elements, if this is an `Array`
    #[must_use]
    pub fn as_array(&self) -> Option<&[Self]> {
        match self {
            Self::Array(items) => Some(items),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Self::Int(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}
