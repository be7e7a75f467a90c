//! Two-tier error model.
//!
//! Recoverable failures become an [`ErrorRecord`] that is serialized into the
//! output stream while the run continues. Fatal failures carry a
//! [`StatusCode`] and end the process through [`leave`], which never unwinds.

use thiserror::Error;

/// Process exit status, one per fatal condition.
///
/// The discriminants are part of the protocol with the hosting client and
/// must stay stable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum StatusCode {
    /// Clean exit
    Ok = 0,
    /// Reserved
    Runtime = 1,
    /// Malformed job envelope
    BadInput = 2,
    /// Interpreter could not be created
    InitializationFailure = 3,
    /// Parser failed without a diagnostic
    BadSyntax = 4,
    /// Parser succeeded but no executable unit came out
    CodeGenerationFailure = 5,
    /// Nesting deeper than [`crate::MAX_DEPTH`]
    StructureTooDeep = 6,
    /// Reserved
    SandboxException = 7,
    /// Integer or length out of range
    Overflow = 8,
    /// Interpreter value with no wire counterpart
    UnknownType = 9,
    /// Unrecognized extension type
    UnknownExt = 10,
    /// Symbol with an empty or non UTF-8 name
    BadSymbol = 11,
    /// Allocator entered re-entrantly
    MemoryCorruption = 12,
    /// Allocator handed a pointer it does not own
    MemoryUsageError = 13,
    /// Arena capacity outside the permitted range
    BadCapacity = 14,
    /// Arena region could not be mapped
    MmapFailed = 15,
    /// Arena exhausted
    MemoryQuotaReached = 16,
    /// Instruction budget exhausted
    InstructionQuotaReached = 17,
    /// Read or write failure on a channel
    IoFailure = 18,
    /// Interpreter produced an error of an unexpected shape
    TypeError = 19,
    /// Precompiled library is malformed
    BadInstructionSequence = 20,
    /// Syscall filter could not be installed
    BadSeccompFilter = 21,
}

impl StatusCode {
    /// Exit status for this condition
    #[must_use]
    pub const fn code(self) -> i32 {
        self as i32
    }

    /// Short lowercase name, as used by the hosting client
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Runtime => "runtime",
            Self::BadInput => "bad_input",
            Self::InitializationFailure => "initialization_failure",
            Self::BadSyntax => "bad_syntax",
            Self::CodeGenerationFailure => "code_generation_failure",
            Self::StructureTooDeep => "structure_too_deep",
            Self::SandboxException => "sandbox_exception",
            Self::Overflow => "overflow",
            Self::UnknownType => "unknown_type",
            Self::UnknownExt => "unknown_ext",
            Self::BadSymbol => "bad_symbol",
            Self::MemoryCorruption => "memory_corruption",
            Self::MemoryUsageError => "memory_usage_error",
            Self::BadCapacity => "bad_capacity",
            Self::MmapFailed => "mmap_failed",
            Self::MemoryQuotaReached => "memory_quota_reached",
            Self::InstructionQuotaReached => "instruction_quota_reached",
            Self::IoFailure => "io_failure",
            Self::TypeError => "type_error",
            Self::BadInstructionSequence => "bad_instruction_sequence",
            Self::BadSeccompFilter => "bad_seccomp_filter",
        }
    }
}

impl std::fmt::Display for StatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name(), self.code())
    }
}

/// A condition that ends the process.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
#[error("fatal condition: {0}")]
pub struct Fatal(pub StatusCode);

impl Fatal {
    /// The exit status this condition maps to
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        self.0
    }
}

impl From<StatusCode> for Fatal {
    fn from(code: StatusCode) -> Self {
        Self(code)
    }
}

/// A failure reported to the client while the run carries on.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ErrorRecord {
    /// Source unit failed to parse
    #[error("{filename}:{line}: {message}")]
    Syntax {
        /// Path of the offending source unit
        filename: String,
        /// 1-based line of the first error
        line: i32,
        /// Column of the first error, 0 when unknown
        column: i32,
        /// Parser message
        message: String,
    },

    /// Unhandled script exception
    #[error("{message}")]
    Runtime {
        /// Exception message
        message: String,
        /// One entry per frame, innermost first
        backtrace: Vec<String>,
    },

    /// Wire value of a kind the interpreter cannot represent
    #[error("unknown type {type_tag}")]
    UnknownType {
        /// Wire kind code
        type_tag: u32,
    },

    /// Extension type other than the symbol type
    #[error("unknown ext {ext_tag}")]
    UnknownExt {
        /// Extension type code
        ext_tag: i8,
    },
}

impl ErrorRecord {
    /// Value of the `__type` field of the serialized record
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Syntax { .. } => "syntax",
            Self::Runtime { .. } => "runtime",
            Self::UnknownType { .. } => "unknown_type",
            Self::UnknownExt { .. } => "unknown_ext",
        }
    }
}

/// Failure of a host operation: either tier.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum Failure {
    /// Serialize and continue
    #[error(transparent)]
    Recoverable(#[from] ErrorRecord),

    /// Terminate
    #[error(transparent)]
    Fatal(#[from] Fatal),
}

impl From<StatusCode> for Failure {
    fn from(code: StatusCode) -> Self {
        Self::Fatal(Fatal(code))
    }
}

/// Terminate the process immediately with `code`.
///
/// Runs no destructors, atexit handlers or unwinding, and cannot be caught
/// by anything the hosted script installs. On Linux this is the raw `exit`
/// syscall, the only exit path the sandbox allows.
#[cfg(target_os = "linux")]
pub fn leave(code: StatusCode) -> ! {
    loop {
        // SAFETY: SYS_exit takes a single integer and does not return.
        unsafe {
            libc::syscall(libc::SYS_exit, libc::c_long::from(code as u8));
        }
    }
}

/// Terminate the process immediately with `code`.
#[cfg(not(target_os = "linux"))]
pub fn leave(code: StatusCode) -> ! {
    std::process::exit(code.code())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_are_stable() {
        assert_eq!(StatusCode::Ok.code(), 0);
        assert_eq!(StatusCode::BadInput.code(), 2);
        assert_eq!(StatusCode::StructureTooDeep.code(), 6);
        assert_eq!(StatusCode::Overflow.code(), 8);
        assert_eq!(StatusCode::UnknownType.code(), 9);
        assert_eq!(StatusCode::BadCapacity.code(), 14);
        assert_eq!(StatusCode::MemoryQuotaReached.code(), 16);
        assert_eq!(StatusCode::InstructionQuotaReached.code(), 17);
        assert_eq!(StatusCode::TypeError.code(), 19);
        assert_eq!(StatusCode::BadSeccompFilter.code(), 21);
    }

    #[test]
    fn test_record_kinds() {
        let syntax = ErrorRecord::Syntax {
            filename: "A".into(),
            line: 1,
            column: 0,
            message: "unexpected symbol".into(),
        };
        assert_eq!(syntax.kind(), "syntax");
        assert_eq!(syntax.to_string(), "A:1: unexpected symbol");
        assert_eq!(ErrorRecord::UnknownExt { ext_tag: 3 }.kind(), "unknown_ext");
    }

    #[test]
    fn test_failure_from_status() {
        let failure: Failure = StatusCode::Overflow.into();
        assert_eq!(failure, Failure::Fatal(Fatal(StatusCode::Overflow)));
        assert_eq!(Fatal(StatusCode::IoFailure).to_string(), "fatal condition: io_failure (18)");
    }
}
