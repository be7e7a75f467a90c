//! Syscall confinement.
//!
//! Once the interpreter exists the process only needs three syscalls: read
//! from fd 0, write to fd 1 or 2, and `exit`. Everything else kills the
//! process. The filter is permanent and must be installed after every
//! resource the run needs has been acquired.

use tracing::{debug, warn};

use crate::error::{Fatal, StatusCode};

#[cfg(target_os = "linux")]
pub use linux::{build_filter, install};

/// Standard input
pub const STDIN: u64 = 0;
/// Standard output
pub const STDOUT: u64 = 1;
/// Standard error
pub const STDERR: u64 = 2;

#[cfg(target_os = "linux")]
mod linux {
    use std::collections::BTreeMap;

    use seccompiler::{
        BpfProgram, SeccompAction, SeccompCmpArgLen, SeccompCmpOp, SeccompCondition,
        SeccompFilter, SeccompRule, TargetArch,
    };

    use super::{debug, warn, Fatal, StatusCode, STDERR, STDIN, STDOUT};

    fn rejected<E: std::fmt::Display>(e: E) -> Fatal {
        warn!("seccomp filter rejected: {e}");
        Fatal(StatusCode::BadSeccompFilter)
    }

    fn fd_is(fd: u64) -> Result<SeccompRule, Fatal> {
        let condition =
            SeccompCondition::new(0, SeccompCmpArgLen::Dword, SeccompCmpOp::Eq, fd).map_err(rejected)?;
        SeccompRule::new(vec![condition]).map_err(rejected)
    }

    /// Compile the allow-list for the host architecture.
    ///
    /// # Errors
    /// `bad_seccomp_filter` when the architecture is unsupported or the
    /// rules fail to compile
    pub fn build_filter() -> Result<BpfProgram, Fatal> {
        let rules: BTreeMap<i64, Vec<SeccompRule>> = [
            (libc::SYS_exit, Vec::new()),
            (libc::SYS_read, vec![fd_is(STDIN)?]),
            (libc::SYS_write, vec![fd_is(STDOUT)?, fd_is(STDERR)?]),
        ]
        .into_iter()
        .collect();

        let arch = TargetArch::try_from(std::env::consts::ARCH).map_err(rejected)?;
        let filter = SeccompFilter::new(rules, SeccompAction::KillProcess, SeccompAction::Allow, arch)
            .map_err(rejected)?;
        BpfProgram::try_from(filter).map_err(rejected)
    }

    /// Install the filter on the calling process. Irreversible.
    ///
    /// # Errors
    /// `bad_seccomp_filter` when the filter cannot be built or the kernel
    /// refuses it
    pub fn install() -> Result<(), Fatal> {
        let program = build_filter()?;
        seccompiler::apply_filter(&program).map_err(rejected)?;
        debug!(instructions = program.len(), "seccomp filter installed");
        Ok(())
    }
}

/// No confinement is available off Linux.
///
/// # Errors
/// Never
#[cfg(not(target_os = "linux"))]
pub fn install() -> Result<(), Fatal> {
    warn!("syscall filtering unavailable on this platform");
    Ok(())
}

/// Bytes of C heap kept resident for use after the filter is installed
pub const HEAP_RESERVE: usize = 32 * crate::arena::MIB;

/// Heap growth the allocator keeps before giving memory back
pub const TRIM_THRESHOLD: usize = 2 * HEAP_RESERVE;

const RESERVE_BLOCK: usize = crate::arena::MIB;

/// Grow the C heap ahead of confinement.
///
/// After the filter is in place the system allocator can no longer call
/// `brk` or `mmap`, so host-side allocations must be served from memory it
/// already holds. The reserve is taken in blocks below the mmap threshold
/// so it comes from the main heap, and the trim threshold keeps it there
/// once freed.
pub fn reserve_heap() {
    #[cfg(all(target_os = "linux", target_env = "gnu"))]
    {
        let mmap_threshold = libc::c_int::try_from(HEAP_RESERVE).unwrap_or(libc::c_int::MAX);
        let trim_threshold = libc::c_int::try_from(TRIM_THRESHOLD).unwrap_or(libc::c_int::MAX);
        // SAFETY: mallopt only adjusts allocator tunables.
        unsafe {
            libc::mallopt(libc::M_MMAP_THRESHOLD, mmap_threshold);
            libc::mallopt(libc::M_TRIM_THRESHOLD, trim_threshold);
        }
    }

    let blocks: Vec<Vec<u8>> = (0..HEAP_RESERVE / RESERVE_BLOCK)
        .map(|_| std::hint::black_box(vec![1_u8; RESERVE_BLOCK]))
        .collect();
    let reserved: usize = blocks.iter().map(Vec::len).sum();
    drop(std::hint::black_box(blocks));
    debug!(bytes = reserved, "heap reserved");
}
