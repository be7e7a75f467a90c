//! Conversion between wire values and Lua values.
//!
//! Input goes from the raw wire tree straight into Lua, and Lua values go
//! back out onto the wire through [`Exported`] straight from interpreter
//! memory, so a run never holds a second copy of its data on the host heap.
//!
//! Symbols live in Lua as interned `Symbol` userdata, so two symbols with
//! the same name are the same object. Arrays are tables carrying a shared
//! metatable, which is what lets an empty array come back out as an array.

use std::ffi::c_void;
use std::io::{Sink, Write};

use mlua::{AnyUserData, Lua, MetaMethod, Table, UserData, UserDataFields, UserDataMethods};

use crate::error::{ErrorRecord, Failure, Fatal, StatusCode};
use crate::wire::decode::{check_depth, node, Node};
use crate::wire::encode::{
    check_len, put, write_array_len, write_bin, write_bool, write_float, write_int, write_map_len,
    write_nil, write_str, write_symbol,
};
use crate::wire::{Encode, Symbol, Value};

/// Registry slot of the symbol intern table
const SYMBOLS: &str = "script_host.symbols";
/// Registry slot of the array metatable
const ARRAY_META: &str = "script_host.array";

/// Lua side of a [`Symbol`]
#[derive(Debug)]
pub struct LuaSymbol(Symbol);

impl UserData for LuaSymbol {
    fn add_fields<'lua, F: UserDataFields<'lua, Self>>(fields: &mut F) {
        fields.add_field_method_get("name", |_, this| Ok(this.0.as_str().to_owned()));
    }

    fn add_methods<'lua, M: UserDataMethods<'lua, Self>>(methods: &mut M) {
        methods.add_meta_method(MetaMethod::ToString, |_, this, ()| Ok(this.0.to_string()));
    }
}

/// Map an interpreter error raised while building or walking values.
pub(crate) fn lua_fatal(err: &mlua::Error) -> Fatal {
    match err {
        mlua::Error::MemoryError(_) => Fatal(StatusCode::MemoryQuotaReached),
        _ => Fatal(StatusCode::TypeError),
    }
}

pub(crate) fn internal(err: &mlua::Error) -> Failure {
    lua_fatal(err).into()
}

/// Create the registry entries conversions rely on.
pub fn register(lua: &Lua) -> mlua::Result<()> {
    lua.set_named_registry_value(SYMBOLS, lua.create_table()?)?;
    let meta = lua.create_table()?;
    meta.raw_set("__name", "array")?;
    lua.set_named_registry_value(ARRAY_META, meta)
}

/// The unique symbol object for `name`.
pub fn intern<'lua>(lua: &'lua Lua, name: &str) -> mlua::Result<AnyUserData<'lua>> {
    let symbols: Table<'_> = lua.named_registry_value(SYMBOLS)?;
    if let Some(existing) = symbols.raw_get::<_, Option<AnyUserData<'_>>>(name)? {
        return Ok(existing);
    }
    let symbol = lua.create_userdata(LuaSymbol(Symbol::new(name)))?;
    symbols.raw_set(name, symbol.clone())?;
    Ok(symbol)
}

fn array_meta(lua: &Lua) -> Result<Table<'_>, Fatal> {
    lua.named_registry_value(ARRAY_META).map_err(|e| lua_fatal(&e))
}

/// Convert a raw wire value into a Lua value.
///
/// # Errors
/// Whatever [`node`] rejects; fatal `structure_too_deep` past
/// [`crate::MAX_DEPTH`]; a recoverable runtime error for map keys Lua
/// cannot index by (nil, NaN).
pub fn to_lua<'lua>(lua: &'lua Lua, raw: &rmpv::Value) -> Result<mlua::Value<'lua>, Failure> {
    let meta = array_meta(lua)?;
    push(lua, &meta, raw, 0)
}

fn push<'lua>(
    lua: &'lua Lua,
    meta: &Table<'lua>,
    raw: &rmpv::Value,
    depth: usize,
) -> Result<mlua::Value<'lua>, Failure> {
    check_depth(depth)?;
    let lua_err = |e: mlua::Error| internal(&e);

    let out = match node(raw)? {
        Node::Nil => mlua::Value::Nil,
        Node::Bool(b) => mlua::Value::Boolean(b),
        Node::Int(n) => mlua::Value::Integer(n),
        Node::Float(f) => mlua::Value::Number(f),
        Node::Str(text) => mlua::Value::String(lua.create_string(text).map_err(lua_err)?),
        Node::Bytes(bytes) => mlua::Value::String(lua.create_string(bytes).map_err(lua_err)?),
        Node::Symbol(name) => mlua::Value::UserData(intern(lua, name).map_err(lua_err)?),
        Node::Array(items) => {
            let table = lua.create_table().map_err(lua_err)?;
            for (i, item) in items.iter().enumerate() {
                let item = push(lua, meta, item, depth + 1)?;
                table.raw_set(i + 1, item).map_err(lua_err)?;
            }
            table.set_metatable(Some(meta.clone()));
            mlua::Value::Table(table)
        }
        Node::Map(entries) => {
            let table = lua.create_table().map_err(lua_err)?;
            for (key, item) in entries {
                let key = push(lua, meta, key, depth + 1)?;
                match key {
                    mlua::Value::Nil => return Err(bad_key("nil")),
                    mlua::Value::Number(f) if f.is_nan() => return Err(bad_key("NaN")),
                    _ => {}
                }
                let item = push(lua, meta, item, depth + 1)?;
                table.raw_set(key, item).map_err(lua_err)?;
            }
            mlua::Value::Table(table)
        }
    };

    Ok(out)
}

fn bad_key(what: &str) -> Failure {
    ErrorRecord::Runtime {
        message: format!("map key is {what}"),
        backtrace: Vec::new(),
    }
    .into()
}

/// A Lua value on its way out.
///
/// A table is an array when it carries the array metatable and its integer
/// keys leave at most half of `1..=max` empty, or when its keys are exactly
/// `1..=n` for some `n > 0`. Any other table is a map.
///
/// Lua tables do not remember insertion order: map entries come out in the
/// table's traversal order, which need not be the order they went in.
/// Functions, threads and foreign userdata are fatal `unknown_type`;
/// nesting past [`crate::MAX_DEPTH`] is fatal `structure_too_deep`, which
/// also stops cycles.
pub struct Exported<'lua> {
    meta: Table<'lua>,
    value: mlua::Value<'lua>,
}

impl<'lua> Exported<'lua> {
    /// Prepare `value` for export.
    ///
    /// # Errors
    /// Only on interpreter failure
    pub fn new(lua: &'lua Lua, value: mlua::Value<'lua>) -> Result<Self, Fatal> {
        Ok(Self {
            meta: array_meta(lua)?,
            value,
        })
    }

    /// Copy the value out of the interpreter.
    ///
    /// # Errors
    /// As [`Encode::check`]
    pub fn to_value(&self) -> Result<Value, Fatal> {
        pull(self.meta.to_pointer(), &self.value, 0)
    }
}

impl Encode for Exported<'_> {
    fn check(&self) -> Result<(), Fatal> {
        emit::<Sink>(self.meta.to_pointer(), &self.value, 0, None)
    }

    fn encode<W: Write>(&self, wr: &mut W) -> Result<(), Fatal> {
        emit(self.meta.to_pointer(), &self.value, 0, Some(wr))
    }
}

/// Copy a Lua value out as a [`Value`]; see [`Exported`] for the rules.
///
/// # Errors
/// As [`Exported::to_value`]
pub fn from_lua<'lua>(lua: &'lua Lua, value: mlua::Value<'lua>) -> Result<Value, Failure> {
    Ok(Exported::new(lua, value)?.to_value()?)
}

enum Shape {
    Array(usize),
    Map(usize),
}

fn shape(meta: *const c_void, table: &Table<'_>) -> Result<Shape, Fatal> {
    let tagged = table
        .get_metatable()
        .is_some_and(|mt| mt.to_pointer() == meta);

    let mut entries = 0;
    let mut max = 0;
    let mut sequence = true;
    for pair in table.clone().pairs::<mlua::Value<'_>, mlua::Value<'_>>() {
        let (key, _) = pair.map_err(|e| lua_fatal(&e))?;
        entries += 1;
        match position(&key) {
            Some(index) => max = max.max(index),
            None => sequence = false,
        }
    }

    // A tagged table more than half empty is a map, as in Lua's own array
    // sizing.
    if sequence && ((tagged && max <= 2 * entries) || (max > 0 && max == entries)) {
        return Ok(Shape::Array(max));
    }
    Ok(Shape::Map(entries))
}

/// 1-based array position of `key`, if it is one
fn position(key: &mlua::Value<'_>) -> Option<usize> {
    match key {
        mlua::Value::Integer(n) if *n >= 1 => usize::try_from(*n).ok(),
        _ => None,
    }
}

fn element<'lua>(table: &Table<'lua>, index: usize) -> Result<mlua::Value<'lua>, Fatal> {
    table.raw_get(index).map_err(|e| lua_fatal(&e))
}

fn emit<W: Write>(
    meta: *const c_void,
    value: &mlua::Value<'_>,
    depth: usize,
    mut wr: Option<&mut W>,
) -> Result<(), Fatal> {
    check_depth(depth)?;

    match value {
        mlua::Value::Nil => put(wr, write_nil),
        mlua::Value::Boolean(b) => put(wr, |w| write_bool(w, *b)),
        mlua::Value::Integer(n) => put(wr, |w| write_int(w, *n)),
        mlua::Value::Number(f) => put(wr, |w| write_float(w, *f)),
        mlua::Value::String(s) => {
            let bytes = s.as_bytes();
            check_len(bytes.len(), StatusCode::Overflow)?;
            match std::str::from_utf8(bytes) {
                Ok(text) => put(wr, |w| write_str(w, text)),
                Err(_) => put(wr, |w| write_bin(w, bytes)),
            }
        }
        mlua::Value::UserData(ud) => match ud.borrow::<LuaSymbol>() {
            Ok(symbol) => put(wr, |w| write_symbol(w, symbol.0.as_str())),
            Err(_) => Err(Fatal(StatusCode::UnknownType)),
        },
        mlua::Value::Table(table) => match shape(meta, table)? {
            Shape::Array(len) => {
                check_len(len, StatusCode::StructureTooDeep)?;
                put(wr.as_deref_mut(), |w| write_array_len(w, len))?;
                for index in 1..=len {
                    let item = element(table, index)?;
                    emit(meta, &item, depth + 1, wr.as_deref_mut())?;
                }
                Ok(())
            }
            Shape::Map(len) => {
                check_len(len, StatusCode::StructureTooDeep)?;
                put(wr.as_deref_mut(), |w| write_map_len(w, len))?;
                for pair in table.clone().pairs::<mlua::Value<'_>, mlua::Value<'_>>() {
                    let (key, item) = pair.map_err(|e| lua_fatal(&e))?;
                    emit(meta, &key, depth + 1, wr.as_deref_mut())?;
                    emit(meta, &item, depth + 1, wr.as_deref_mut())?;
                }
                Ok(())
            }
        },
        _ => Err(Fatal(StatusCode::UnknownType)),
    }
}

fn pull(meta: *const c_void, value: &mlua::Value<'_>, depth: usize) -> Result<Value, Fatal> {
    check_depth(depth)?;

    let out = match value {
        mlua::Value::Nil => Value::Nil,
        mlua::Value::Boolean(b) => Value::Bool(*b),
        mlua::Value::Integer(n) => Value::Int(*n),
        mlua::Value::Number(f) => Value::Float(*f),
        mlua::Value::String(s) => match std::str::from_utf8(s.as_bytes()) {
            Ok(text) => Value::str(text),
            Err(_) => Value::Bytes(s.as_bytes().to_vec()),
        },
        mlua::Value::UserData(ud) => match ud.borrow::<LuaSymbol>() {
            Ok(symbol) => Value::Symbol(symbol.0.clone()),
            Err(_) => return Err(Fatal(StatusCode::UnknownType)),
        },
        mlua::Value::Table(table) => match shape(meta, table)? {
            Shape::Array(len) => {
                let mut items = Vec::with_capacity(len);
                for index in 1..=len {
                    items.push(pull(meta, &element(table, index)?, depth + 1)?);
                }
                Value::Array(items)
            }
            Shape::Map(len) => {
                let mut entries = Vec::with_capacity(len);
                for pair in table.clone().pairs::<mlua::Value<'_>, mlua::Value<'_>>() {
                    let (key, item) = pair.map_err(|e| lua_fatal(&e))?;
                    entries.push((pull(meta, &key, depth + 1)?, pull(meta, &item, depth + 1)?));
                }
                Value::Map(entries)
            }
        },
        _ => return Err(Fatal(StatusCode::UnknownType)),
    };

    Ok(out)
}
