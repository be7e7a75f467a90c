//! Interpreter host.
//!
//! One Lua 5.4 state whose allocator is the quota arena and whose dispatch
//! loop calls a count hook on every instruction. Both callbacks reach the
//! host through the allocator userdata, so no global state is involved.
//!
//! Fatal conditions found inside those callbacks (arena exhausted,
//! instruction budget spent, allocator misuse) end the process right there
//! through [`leave`]: at that point the interpreter may be mid-allocation and
//! must not be unwound.

pub mod convert;
pub mod prelude;

use std::cell::{Cell, RefCell};
use std::ffi::c_void;
use std::ptr::{self, NonNull};

use mlua::{ffi, ChunkMode, Function, Lua, StdLib};
use tracing::debug;

use crate::arena::{Arena, Usage};
use crate::error::{leave, ErrorRecord, Failure, Fatal, StatusCode};
use crate::intake::SourceUnit;
use crate::wire::Value;
use convert::Exported;
use prelude::{ExitSignal, STDOUT};

/// Placeholder reported when the script left `stdout` as something other
/// than a string
pub const STDOUT_PLACEHOLDER: &str = "(can't read stdout)";

/// Instruction accounting shared with the count hook.
#[derive(Debug)]
pub struct Meter {
    quota: u64,
    count: Cell<u64>,
    total: Cell<u64>,
    limit: Cell<bool>,
}

impl Meter {
    /// A fresh meter with limiting on
    #[must_use]
    pub const fn new(quota: u64) -> Self {
        Self {
            quota,
            count: Cell::new(0),
            total: Cell::new(0),
            limit: Cell::new(true),
        }
    }

    /// Account for one instruction. `false` once the budget is spent; the
    /// instruction must then not run.
    pub fn tick(&self) -> bool {
        if self.count.get() >= self.quota {
            return false;
        }
        self.total.set(self.total.get() + 1);
        if self.limit.get() {
            self.count.set(self.count.get() + 1);
        }
        true
    }

    /// Instructions charged against the quota
    #[must_use]
    pub fn count(&self) -> u64 {
        self.count.get()
    }

    /// Every instruction executed
    #[must_use]
    pub fn total(&self) -> u64 {
        self.total.get()
    }

    /// Whether instructions are currently charged
    #[must_use]
    pub fn limited(&self) -> bool {
        self.limit.get()
    }

    /// Turn charging on or off
    pub fn set_limit(&self, on: bool) {
        self.limit.set(on);
    }
}

/// What the allocator and hook callbacks see.
struct HostContext {
    arena: RefCell<Arena>,
    meter: Meter,
}

/// A compiled source unit or library, ready to evaluate
pub struct CompiledUnit<'h> {
    function: Function<'h>,
}

impl CompiledUnit<'_> {
    /// Serialize to a binary chunk loadable by [`InterpreterHost::load_precompiled`]
    #[must_use]
    pub fn dump(&self) -> Vec<u8> {
        self.function.dump(false)
    }
}

/// The embedded interpreter and everything it owns.
pub struct InterpreterHost {
    // Declared first so the state closes while the arena is still mapped.
    lua: Lua,
    ctx: Box<HostContext>,
}

impl InterpreterHost {
    /// Create an interpreter allocating from `arena` and metered against
    /// `instruction_quota`.
    ///
    /// # Errors
    /// `initialization_failure` when the state or its environment cannot be
    /// built
    pub fn new(arena: Arena, instruction_quota: u64) -> Result<Self, Fatal> {
        let ctx = Box::new(HostContext {
            arena: RefCell::new(arena),
            meter: Meter::new(instruction_quota),
        });
        let ud = ptr::from_ref::<HostContext>(&ctx).cast_mut().cast::<c_void>();

        // SAFETY: `ud` points into the boxed context, which outlives the state
        // (see the field order of `InterpreterHost`).
        let state = unsafe { ffi::lua_newstate(arena_alloc, ud) };
        if state.is_null() {
            return Err(Fatal(StatusCode::InitializationFailure));
        }

        // SAFETY: fresh state; the base library is opened exactly as
        // `luaL_openlibs` would, and `init_from_ptr` takes ownership.
        let lua = unsafe {
            ffi::luaL_requiref(state, b"_G\0".as_ptr().cast(), ffi::luaopen_base, 1);
            ffi::lua_pop(state, 1);
            Lua::init_from_ptr(state)
        };
        let host = Self { lua, ctx };

        let setup = host
            .lua
            .load_from_std_lib(StdLib::TABLE | StdLib::STRING | StdLib::MATH | StdLib::UTF8)
            .and_then(|()| convert::register(&host.lua))
            .and_then(|()| prelude::install(&host.lua));
        if let Err(e) = setup {
            debug!("interpreter setup failed: {e}");
            return Err(Fatal(StatusCode::InitializationFailure));
        }

        // SAFETY: the hook only reads the context through the allocator
        // userdata. Threads created later inherit it.
        unsafe { ffi::lua_sethook(state, Some(meter_hook), ffi::LUA_MASKCOUNT, 1) };

        debug!(quota = instruction_quota, "interpreter ready");
        Ok(host)
    }

    /// Instruction meter
    #[must_use]
    pub fn meter(&self) -> &Meter {
        &self.ctx.meter
    }

    /// Arena occupancy
    #[must_use]
    pub fn memory_usage(&self) -> Usage {
        // The allocator only borrows while the interpreter is running.
        self.ctx.arena.borrow().usage()
    }

    /// Bind the wire value `raw` to the global `name`.
    ///
    /// # Errors
    /// As [`convert::to_lua`]
    pub fn inject(&self, name: &str, raw: &rmpv::Value) -> Result<(), Failure> {
        let native = convert::to_lua(&self.lua, raw)?;
        self.lua
            .globals()
            .raw_set(name, native)
            .map_err(|e| convert::internal(&e))
    }

    /// The global `name`, ready to encode in place.
    ///
    /// # Errors
    /// Only on interpreter failure
    pub fn export(&self, name: &str) -> Result<Exported<'_>, Failure> {
        let native: mlua::Value<'_> = self
            .lua
            .globals()
            .raw_get(name)
            .map_err(|e| convert::internal(&e))?;
        let native = prelude::resolve(&self.lua, native).map_err(|e| convert::internal(&e))?;
        Ok(Exported::new(&self.lua, native)?)
    }

    /// The `print` buffer, or [`STDOUT_PLACEHOLDER`] when it is not a string.
    ///
    /// # Errors
    /// Only on interpreter failure
    pub fn export_stdout(&self) -> Result<Exported<'_>, Failure> {
        let lua_err = |e: mlua::Error| convert::internal(&e);
        prelude::settle(&self.lua).map_err(lua_err)?;
        let current: mlua::Value<'_> = self.lua.globals().raw_get(STDOUT).map_err(lua_err)?;
        let native = match current {
            text @ mlua::Value::String(_) => text,
            _ => mlua::Value::String(self.lua.create_string(STDOUT_PLACEHOLDER).map_err(lua_err)?),
        };
        Ok(Exported::new(&self.lua, native)?)
    }

    /// Copy the global `name` out of the interpreter.
    ///
    /// # Errors
    /// As [`Exported::to_value`]
    pub fn extract(&self, name: &str) -> Result<Value, Failure> {
        Ok(self.export(name)?.to_value()?)
    }

    /// Copy the `print` buffer out; see [`Self::export_stdout`].
    ///
    /// # Errors
    /// As [`Exported::to_value`]
    pub fn extract_stdout(&self) -> Result<Value, Failure> {
        Ok(self.export_stdout()?.to_value()?)
    }

    /// Compile a source unit.
    ///
    /// # Errors
    /// Recoverable `Syntax` for parse errors; fatal `bad_syntax` when the
    /// parser's message has no location and `code_generation_failure` for
    /// any other compiler failure
    pub fn compile(&self, unit: &SourceUnit) -> Result<CompiledUnit<'_>, Failure> {
        let compiled = self
            .lua
            .load(unit.text.as_str())
            .set_name(format!("={}", unit.path))
            .set_mode(ChunkMode::Text)
            .into_function();

        match compiled {
            Ok(function) => Ok(CompiledUnit { function }),
            Err(mlua::Error::SyntaxError { message, .. }) => match syntax_record(&unit.path, &message) {
                Some(record) => Err(record.into()),
                None => Err(StatusCode::BadSyntax.into()),
            },
            Err(mlua::Error::MemoryError(_)) => Err(StatusCode::MemoryQuotaReached.into()),
            Err(_) => Err(StatusCode::CodeGenerationFailure.into()),
        }
    }

    /// Run a compiled unit to completion. A call to `exit()` counts as
    /// success.
    ///
    /// # Errors
    /// Recoverable `Runtime` for unhandled script errors; fatal
    /// `type_error` for interpreter errors of any other class
    pub fn evaluate(&self, unit: &CompiledUnit<'_>) -> Result<(), Failure> {
        match unit.function.call::<_, ()>(()) {
            Ok(()) => Ok(()),
            Err(err) if is_exit(&err) => Ok(()),
            Err(err) => Err(normalize(&err)),
        }
    }

    /// Load a binary chunk and run it.
    ///
    /// # Errors
    /// Fatal `bad_instruction_sequence` when the chunk is malformed, then
    /// as [`Self::evaluate`]
    pub fn load_precompiled(&self, chunk: &[u8]) -> Result<(), Failure> {
        let function = self
            .lua
            .load(chunk)
            .set_name("=library")
            .set_mode(ChunkMode::Binary)
            .into_function()
            .map_err(|e| match e {
                mlua::Error::MemoryError(_) => Fatal(StatusCode::MemoryQuotaReached),
                _ => Fatal(StatusCode::BadInstructionSequence),
            })?;
        self.evaluate(&CompiledUnit { function })
    }
}

impl std::fmt::Debug for InterpreterHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterpreterHost")
            .field("meter", &self.ctx.meter)
            .field("arena", &self.ctx.arena)
            .finish_non_exhaustive()
    }
}

/// Recover the context from a state created by [`InterpreterHost::new`].
///
/// # Safety
/// `state` must belong to a live host.
unsafe fn context<'a>(state: *mut ffi::lua_State) -> &'a HostContext {
    let mut ud = ptr::null_mut();
    ffi::lua_getallocf(state, &mut ud);
    &*ud.cast::<HostContext>()
}

unsafe extern "C-unwind" fn meter_hook(state: *mut ffi::lua_State, _ar: *mut ffi::lua_Debug) {
    if !context(state).meter.tick() {
        leave(StatusCode::InstructionQuotaReached);
    }
}

/// `lua_Alloc` over the arena. `osize` is only a size when `ptr` is non-null.
unsafe extern "C-unwind" fn arena_alloc(
    ud: *mut c_void,
    ptr: *mut c_void,
    osize: usize,
    nsize: usize,
) -> *mut c_void {
    let ctx = &*ud.cast::<HostContext>();
    let Ok(mut arena) = ctx.arena.try_borrow_mut() else {
        leave(StatusCode::MemoryCorruption);
    };

    let Some(block) = NonNull::new(ptr.cast::<u8>()) else {
        if nsize == 0 {
            return ptr::null_mut();
        }
        return match arena.allocate(nsize) {
            Some(fresh) => fresh.as_ptr().cast(),
            None => leave(StatusCode::MemoryQuotaReached),
        };
    };

    if !arena.owns(block.as_ptr()) {
        leave(StatusCode::MemoryUsageError);
    }
    if nsize == 0 {
        arena.free(block, osize);
        return ptr::null_mut();
    }
    match arena.reallocate(block, osize, nsize) {
        Some(moved) => moved.as_ptr().cast(),
        None => leave(StatusCode::MemoryQuotaReached),
    }
}

fn is_exit(err: &mlua::Error) -> bool {
    match err {
        mlua::Error::CallbackError { cause, .. } => is_exit(cause),
        mlua::Error::ExternalError(inner) => inner.downcast_ref::<ExitSignal>().is_some(),
        _ => false,
    }
}

const TRACEBACK_HEADER: &str = "stack traceback:\n";

/// Turn an evaluation error into the right tier.
fn normalize(err: &mlua::Error) -> Failure {
    match err {
        mlua::Error::RuntimeError(text) => runtime_record(text, None),
        mlua::Error::CallbackError { traceback, cause } => {
            let mut cause = cause.as_ref();
            while let mlua::Error::CallbackError { cause: inner, .. } = cause {
                cause = inner.as_ref();
            }
            match cause {
                mlua::Error::RuntimeError(text) => runtime_record(text, Some(traceback)),
                mlua::Error::MemoryError(_) => StatusCode::MemoryQuotaReached.into(),
                other => ErrorRecord::Runtime {
                    message: other.to_string(),
                    backtrace: frames(traceback),
                }
                .into(),
            }
        }
        mlua::Error::MemoryError(_) => StatusCode::MemoryQuotaReached.into(),
        _ => StatusCode::TypeError.into(),
    }
}

/// Split `message\nstack traceback:\n\t...`; the fallback traceback is used
/// when the message carries none of its own.
fn runtime_record(text: &str, fallback: Option<&str>) -> Failure {
    let (message, backtrace) = match text.split_once(&format!("\n{TRACEBACK_HEADER}")) {
        Some((message, traceback)) => (message, frames(traceback)),
        None => (text, fallback.map(frames).unwrap_or_default()),
    };
    ErrorRecord::Runtime {
        message: message.to_owned(),
        backtrace,
    }
    .into()
}

fn frames(traceback: &str) -> Vec<String> {
    traceback
        .strip_prefix(TRACEBACK_HEADER)
        .unwrap_or(traceback)
        .lines()
        .map(|line| line.trim_start_matches('\t'))
        .filter(|line| !line.is_empty())
        .map(str::to_owned)
        .collect()
}

/// Parse `chunk:line: message`. Long chunk names are shortened by Lua, so
/// when the path is not a literal prefix the first `:<digits>:` is used.
fn syntax_record(path: &str, message: &str) -> Option<ErrorRecord> {
    let rest = message
        .strip_prefix(path)
        .and_then(|r| r.strip_prefix(':'))
        .filter(|r| line_prefix(r).is_some())
        .or_else(|| {
            message
                .match_indices(':')
                .map(|(i, _)| &message[i + 1..])
                .find(|r| line_prefix(r).is_some())
        })?;
    let (line, text) = line_prefix(rest)?;
    Some(ErrorRecord::Syntax {
        filename: path.to_owned(),
        line,
        column: 0,
        message: text.trim_start().to_owned(),
    })
}

fn line_prefix(rest: &str) -> Option<(i32, &str)> {
    let (digits, text) = rest.split_once(':')?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some((digits.parse().ok()?, text))
}
