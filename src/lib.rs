//! # Script Host
//!
//! A one-shot host that runs untrusted Lua under hard resource bounds.
//!
//! ## Architecture
//!
//! One process handles exactly one job:
//! - **Intake** reads a MessagePack job envelope from stdin
//! - **Arena** maps a fixed region that backs every interpreter allocation
//! - **Host** embeds Lua, metering every instruction against a quota
//! - **Sandbox** confines the process to read(0), write(1|2) and exit
//! - **Runner** compiles and evaluates the source units, reporting through
//!   the **Writer** as a stream of MessagePack records on stdout
//!
//! ## Failure Model
//!
//! - Recoverable failures (syntax, runtime, unconvertible input) are written
//!   as error records and the run continues
//! - Fatal failures (quota exhaustion, malformed envelope, I/O) end the
//!   process immediately with a dedicated exit status

#![deny(clippy::all)]
#![warn(clippy::pedantic, rust_2018_idioms, missing_docs)]
#![allow(clippy::module_name_repetitions)]

pub mod arena;
pub mod config;
pub mod error;
pub mod host;
pub mod intake;
pub mod runner;
pub mod sandbox;
pub mod timer;
pub mod wire;
pub mod writer;

pub use arena::{Arena, Usage};
pub use config::{Command, Options};
pub use error::{leave, ErrorRecord, Failure, Fatal, StatusCode};
pub use host::InterpreterHost;
pub use intake::{read_job, Job, SourceUnit};
pub use runner::Orchestrator;
pub use timer::{MeasurementSink, StageTimer};
pub use wire::{Symbol, Value};
pub use writer::{ExecutionStats, FdStream, OutputWriter};

/// Host version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Deepest nesting accepted in either conversion direction
pub const MAX_DEPTH: usize = 32;
