//! Shared foundation for the Opal JIT compiler.
//!
//! Small, dependency-light types used by every compiler crate:
//! - [`CompileError`] / [`Result`]: the one error channel for a compilation
//! - [`CancelToken`]: cooperative cancellation with optional deadline
//! - [`SourcePos`]: bytecode position + exception-handler metadata
//! - [`SplitMix64`]: deterministic PRNG for seeded fuzzing
#![deny(unsafe_op_in_unsafe_fn)]

pub mod cancel;
pub mod error;
pub mod pos;
pub mod rng;

pub use cancel::CancelToken;
pub use error::{CompileError, Result};
pub use pos::SourcePos;
pub use rng::SplitMix64;
