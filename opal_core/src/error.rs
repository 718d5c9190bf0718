//! Compilation error types shared across the Opal middle-end.
//!
//! Error design follows a strict split:
//! - **Bugs in a phase** (invariant violations) panic via [`graph_bug!`] and
//!   are caught at the compile-driver boundary, surfacing as
//!   [`CompileError::PhaseFailed`] for that one method. They never take the
//!   host process down.
//! - **Conservative analysis fallbacks** (could not prove non-escape, no
//!   rewrite rule matched) are not errors at all and have no variant here.
//! - **Resource guards** (fixpoint budgets, cancellation) abort the method
//!   and leave it running unoptimized: a performance outcome, not a
//!   correctness one.

use thiserror::Error;

/// Result alias used throughout the compiler.
pub type Result<T> = std::result::Result<T, CompileError>;

/// Why compiling a single method was abandoned.
///
/// One value of this type describes the fate of exactly one compilation
/// unit. The caller decides what to do next (typically: keep interpreting
/// the method and possibly retry later).
#[derive(Error, Debug)]
pub enum CompileError {
    /// A phase hit an internal invariant violation (a compiler bug, never a
    /// property of the input program). Carries the failing phase name and,
    /// when dumps are enabled, a textual graph dump for diagnosis.
    #[error("phase `{phase}` failed: {detail}")]
    PhaseFailed {
        /// Name of the phase that was running when the invariant tripped.
        phase: &'static str,
        /// Panic payload or verifier message.
        detail: String,
        /// Best-effort graph dump captured before the phase ran.
        dump: Option<String>,
    },

    /// A fixpoint loop (canonicalization worklist, escape-analysis
    /// iteration) exceeded its step budget. The method falls back to
    /// unoptimized execution.
    #[error("phase `{phase}` exceeded its step budget ({steps} steps)")]
    FixpointExceeded {
        /// Phase whose budget was exhausted.
        phase: &'static str,
        /// Steps executed before giving up.
        steps: u64,
    },

    /// The configured phase list can never run: a phase's required stages
    /// are not produced by any earlier phase, or a strictly-once phase
    /// appears twice. Detected by pipeline validation before any phase runs.
    #[error("invalid pipeline: {0}")]
    InvalidPipeline(String),

    /// The compilation was cancelled cooperatively. The partially
    /// transformed graph is discarded, never handed to code generation.
    #[error("compilation cancelled")]
    Cancelled,
}

impl CompileError {
    /// True for errors that mean "retry later may succeed" (cancellation),
    /// false for deterministic failures.
    pub fn is_transient(&self) -> bool {
        matches!(self, CompileError::Cancelled)
    }
}

/// Panic with a formatted invariant-violation message.
///
/// Used for conditions that can only arise from a bug in a phase, such as
/// deleting a node that still has usages. The compile driver catches the
/// unwind and converts it into [`CompileError::PhaseFailed`].
#[macro_export]
macro_rules! graph_bug {
    ($($arg:tt)*) => {
        panic!("graph invariant violated: {}", format_args!($($arg)*))
    };
}

/// Assert a graph invariant, panicking through [`graph_bug!`] on failure.
///
/// Unlike `debug_assert!`, this fires in release builds too: a broken graph
/// must never reach code generation.
#[macro_export]
macro_rules! guarantee {
    ($cond:expr, $($arg:tt)*) => {
        if !$cond {
            $crate::graph_bug!($($arg)*);
        }
    };
}
