//! Optimizing middle-end of the Opal JIT compiler.
//!
//! Methods arrive as sea-of-nodes graphs and leave as block schedules:
//! - Sea-of-Nodes IR with type stamps ([`ir`])
//! - Canonicalization, partial escape analysis, guard pinning ([`opt`])
//! - Global code motion into ordered basic blocks ([`schedule`])
//! - A reference interpreter for differential testing ([`interp`])
#![deny(unsafe_op_in_unsafe_fn)]

pub mod driver;
pub mod dump;
pub mod interp;
pub mod ir;
pub mod opt;
pub mod schedule;

pub use driver::{compile, compile_batch, BatchReport, CompileOutput};
pub use opt::{CompileConfig, CompileStats, Phase, PhaseContext, Pipeline};
pub use schedule::{BlockCursor, MethodSchedule, SchedStrategy};
