//! The global environment a hosted script runs in.
//!
//! `print` output is kept as a list of pieces while the script runs; the
//! `stdout` global holds a [`PendingOutput`] marker until [`settle`] joins
//! the pieces into one string.

use mlua::{Function, Lua, MetaMethod, MultiValue, Table, UserData, UserDataMethods};
use thiserror::Error;

use super::convert::intern;

/// Global that collects `print` output
pub const STDOUT: &str = "stdout";

const LOAD: &str = "script_host.load";
const TOSTRING: &str = "script_host.tostring";
const CONCAT: &str = "script_host.concat";
const PIECES: &str = "script_host.stdout";

/// `string` functions driven by Lua patterns. Matching runs in C where the
/// instruction meter cannot stop it.
pub const PATTERN_FUNCTIONS: [&str; 4] = ["find", "match", "gmatch", "gsub"];

/// Raised by the script-visible `exit()`; evaluation treats it as a clean stop.
#[derive(Debug, Error)]
#[error("exit")]
pub struct ExitSignal;

/// Value of `stdout` while `print` output is still in pieces.
#[derive(Debug)]
pub struct PendingOutput;

impl UserData for PendingOutput {
    fn add_methods<'lua, M: UserDataMethods<'lua, Self>>(methods: &mut M) {
        methods.add_meta_method(MetaMethod::ToString, |lua, _, ()| joined(lua));
        methods.add_meta_method(MetaMethod::Len, |lua, _, ()| Ok(joined(lua)?.as_bytes().len()));
        methods.add_meta_function(
            MetaMethod::Concat,
            |lua, (left, right): (mlua::Value<'lua>, mlua::Value<'lua>)| {
                let parts = lua.create_sequence_from([operand(lua, left)?, operand(lua, right)?])?;
                let concat: Function<'_> = lua.named_registry_value(CONCAT)?;
                concat.call::<_, mlua::String<'_>>(parts)
            },
        );
    }
}

fn operand<'lua>(lua: &'lua Lua, value: mlua::Value<'lua>) -> mlua::Result<mlua::String<'lua>> {
    if is_pending(&value) {
        return joined(lua);
    }
    let type_name = value.type_name();
    lua.coerce_string(value)?.ok_or_else(|| {
        mlua::Error::RuntimeError(format!("attempt to concatenate a {type_name} value"))
    })
}

/// Trim the base library and install the host globals.
pub fn install(lua: &Lua) -> mlua::Result<()> {
    let globals = lua.globals();
    globals.raw_remove("dofile")?;
    globals.raw_remove("loadfile")?;

    let load: Function<'_> = globals.raw_get("load")?;
    lua.set_named_registry_value(LOAD, load)?;
    let tostring: Function<'_> = globals.raw_get("tostring")?;
    lua.set_named_registry_value(TOSTRING, tostring)?;

    let table: Table<'_> = globals.raw_get("table")?;
    let concat: Function<'_> = table.raw_get("concat")?;
    lua.set_named_registry_value(CONCAT, concat)?;

    let string: Table<'_> = globals.raw_get("string")?;
    for name in PATTERN_FUNCTIONS {
        string.raw_remove(name)?;
    }

    globals.raw_set("load", lua.create_function(load_text)?)?;
    globals.raw_set("print", lua.create_function(print)?)?;
    globals.raw_set(
        "sym",
        lua.create_function(|lua, name: mlua::String<'_>| intern(lua, name.to_str()?))?,
    )?;
    globals.raw_set(
        "exit",
        lua.create_function(|_, ()| Err::<(), _>(mlua::Error::external(ExitSignal)))?,
    )?;
    Ok(())
}

/// `load` with the mode argument pinned to text.
fn load_text<'lua>(lua: &'lua Lua, args: MultiValue<'lua>) -> mlua::Result<MultiValue<'lua>> {
    let load: Function<'_> = lua.named_registry_value(LOAD)?;
    let mut args = args.into_vec();
    if args.len() < 3 {
        args.resize(3, mlua::Value::Nil);
    }
    args[2] = mlua::Value::String(lua.create_string("t")?);
    load.call(MultiValue::from_vec(args))
}

/// Append the arguments, tab separated and newline terminated, to `stdout`.
///
/// A string already in `stdout` becomes the first piece.
fn print<'lua>(lua: &'lua Lua, args: MultiValue<'lua>) -> mlua::Result<()> {
    let tostring: Function<'_> = lua.named_registry_value(TOSTRING)?;
    let globals = lua.globals();

    let pieces: Table<'_> = match globals.raw_get::<_, mlua::Value<'_>>(STDOUT)? {
        current if is_pending(&current) => lua.named_registry_value(PIECES)?,
        current => {
            let pieces = lua.create_table()?;
            if let mlua::Value::String(existing) = current {
                pieces.raw_set(1, existing)?;
            }
            lua.set_named_registry_value(PIECES, pieces.clone())?;
            globals.raw_set(STDOUT, lua.create_userdata(PendingOutput)?)?;
            pieces
        }
    };

    let mut next = pieces.raw_len() + 1;
    for (i, arg) in args.into_iter().enumerate() {
        if i > 0 {
            pieces.raw_set(next, "\t")?;
            next += 1;
        }
        let text: mlua::String<'_> = tostring.call(arg)?;
        pieces.raw_set(next, text)?;
        next += 1;
    }
    pieces.raw_set(next, "\n")
}

fn is_pending(value: &mlua::Value<'_>) -> bool {
    matches!(value, mlua::Value::UserData(ud) if ud.is::<PendingOutput>())
}

fn joined(lua: &Lua) -> mlua::Result<mlua::String<'_>> {
    match lua.named_registry_value::<Option<Table<'_>>>(PIECES)? {
        Some(pieces) => {
            let concat: Function<'_> = lua.named_registry_value(CONCAT)?;
            concat.call(pieces)
        }
        None => lua.create_string(""),
    }
}

/// The joined `print` output when `value` is the pending marker, else
/// `value` itself.
pub fn resolve<'lua>(lua: &'lua Lua, value: mlua::Value<'lua>) -> mlua::Result<mlua::Value<'lua>> {
    if is_pending(&value) {
        return joined(lua).map(mlua::Value::String);
    }
    Ok(value)
}

/// Replace pending `print` output in `stdout` with the joined string.
pub fn settle(lua: &Lua) -> mlua::Result<()> {
    let globals = lua.globals();
    let current: mlua::Value<'_> = globals.raw_get(STDOUT)?;
    if is_pending(&current) {
        globals.raw_set(STDOUT, joined(lua)?)?;
        lua.set_named_registry_value(PIECES, mlua::Value::Nil)?;
    }
    Ok(())
}
