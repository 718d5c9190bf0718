//! Optimization phases.
//!
//! Each phase is a self-contained graph transformation behind the
//! [`Phase`] trait:
//!
//! - **Canonicalize** (`canonicalize.rs`): worklist folding and local
//!   simplification to a fixed point
//! - **PartialEscape** (`escape.rs`): allocation virtualization and
//!   scalar replacement
//! - **FixGuards** (`guards.rs`): pins floating guards into control flow
//! - **DeadCodeElim** (`dce.rs`): reachability sweep from the end node
//! - **Pipeline** (`pipeline.rs`): ordering, precondition validation,
//!   failure isolation
//!
//! Phases declare the stage invariants they require and produce; the
//! pipeline validates the chain before anything runs.

use std::time::Duration;

use opal_core::{CancelToken, Result};

use crate::ir::{Graph, StageSet};
use crate::schedule::{MethodSchedule, SchedStrategy};

pub mod canonicalize;
pub mod dce;
pub mod escape;
pub mod guards;
pub mod pipeline;

pub use canonicalize::Canonicalize;
pub use dce::DeadCodeElim;
pub use escape::PartialEscape;
pub use guards::FixGuards;
pub use pipeline::Pipeline;

// =============================================================================
// Configuration
// =============================================================================

/// Knobs for one compilation. Cheap to clone; the driver hands each
/// worker its own copy.
#[derive(Debug, Clone)]
pub struct CompileConfig {
    /// Abstract loop iterations escape analysis runs before it gives up
    /// and materializes at the loop entry.
    pub escape_loop_iterations: u32,
    /// Arrays with constant length up to this many elements virtualize.
    pub escape_array_limit: u32,
    /// Canonicalization step budget: `factor * live_nodes + base`.
    pub canonicalize_budget_factor: u64,
    pub canonicalize_budget_base: u64,
    /// Where floating nodes land in the final schedule.
    pub strategy: SchedStrategy,
    /// Shuffle the phase order (legally) with this seed.
    pub fuzz_seed: Option<u64>,
    /// Attach a graph dump to phase-failure errors.
    pub dump_on_failure: bool,
    /// Trace the whole graph before and after every phase.
    pub dump_phases: bool,
}

impl Default for CompileConfig {
    fn default() -> Self {
        CompileConfig {
            escape_loop_iterations: 3,
            escape_array_limit: 32,
            canonicalize_budget_factor: 16,
            canonicalize_budget_base: 1024,
            strategy: SchedStrategy::LatestOutOfLoops,
            fuzz_seed: None,
            dump_on_failure: true,
            dump_phases: false,
        }
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Counters accumulated across one compilation.
#[derive(Debug, Clone, Default)]
pub struct CompileStats {
    pub canonicalize_steps: u64,
    pub nodes_folded: u64,
    pub branches_collapsed: u64,
    pub loads_forwarded: u64,
    pub allocs_virtualized: u64,
    pub allocs_materialized: u64,
    pub guards_pinned: u64,
    pub nodes_swept: u64,
    pub phase_times: Vec<(&'static str, Duration)>,
}

// =============================================================================
// Phase trait
// =============================================================================

/// Everything a phase may touch besides the graph.
pub struct PhaseContext<'a> {
    pub config: &'a CompileConfig,
    pub cancel: &'a CancelToken,
    pub stats: &'a mut CompileStats,
    /// Filled by the scheduling phase; the driver takes it as the result.
    pub schedule: Option<MethodSchedule>,
}

impl<'a> PhaseContext<'a> {
    pub fn new(
        config: &'a CompileConfig,
        cancel: &'a CancelToken,
        stats: &'a mut CompileStats,
    ) -> PhaseContext<'a> {
        PhaseContext {
            config,
            cancel,
            stats,
            schedule: None,
        }
    }
}

/// One graph transformation in the pipeline.
pub trait Phase {
    fn name(&self) -> &'static str;

    /// Stage invariants that must hold before this phase runs.
    fn requires(&self) -> StageSet {
        StageSet::empty()
    }

    /// Stage invariants this phase establishes.
    fn produces(&self) -> StageSet {
        StageSet::empty()
    }

    /// Running twice would corrupt the graph (guard pinning).
    fn strictly_once(&self) -> bool {
        false
    }

    fn run(&mut self, graph: &mut Graph, ctx: &mut PhaseContext<'_>) -> Result<()>;
}
