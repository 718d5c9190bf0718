//! One-call compilation driver.
//!
//! [`compile`] runs the phase pipeline over a single method graph and
//! returns the schedule together with the run's statistics.
//! [`compile_batch`] fans a set of methods out over the rayon pool:
//! per-method results keep their input order, while a shared report
//! aggregates counts and phase times in completion order.

use std::time::Duration;

use parking_lot::Mutex;
use rayon::prelude::*;
use tracing::debug;

use opal_core::{CancelToken, CompileError, Result};

use crate::ir::{Graph, StageSet};
use crate::opt::{CompileConfig, CompileStats, PhaseContext, Pipeline};
use crate::schedule::MethodSchedule;

/// Everything a backend needs from the middle-end.
#[derive(Debug)]
pub struct CompileOutput {
    pub schedule: MethodSchedule,
    pub stats: CompileStats,
}

/// Run the full pipeline over one method graph.
///
/// With [`CompileConfig::fuzz_seed`] set, the phase order is a seeded
/// random legal one instead of the default; the compiled behavior must
/// not depend on the choice.
pub fn compile(
    graph: &mut Graph,
    config: &CompileConfig,
    cancel: &CancelToken,
) -> Result<CompileOutput> {
    let mut pipeline = match config.fuzz_seed {
        Some(seed) => Pipeline::shuffled(seed, StageSet::SCHEDULED),
        None => Pipeline::new(),
    };
    let mut stats = CompileStats::default();
    let mut ctx = PhaseContext::new(config, cancel, &mut stats);
    pipeline.run(graph, &mut ctx)?;
    let Some(schedule) = ctx.schedule.take() else {
        return Err(CompileError::InvalidPipeline(
            "pipeline finished without scheduling the graph".to_string(),
        ));
    };
    Ok(CompileOutput { schedule, stats })
}

/// Aggregated outcome of one [`compile_batch`] call.
#[derive(Debug, Default, Clone)]
pub struct BatchReport {
    pub compiled: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// Wall time summed per phase across the whole batch.
    pub phase_times: Vec<(&'static str, Duration)>,
}

impl BatchReport {
    fn absorb(&mut self, outcome: &Result<CompileOutput>) {
        match outcome {
            Ok(out) => {
                self.compiled += 1;
                for &(name, time) in &out.stats.phase_times {
                    match self.phase_times.iter_mut().find(|(n, _)| *n == name) {
                        Some(slot) => slot.1 += time,
                        None => self.phase_times.push((name, time)),
                    }
                }
            }
            Err(err) if err.is_transient() => self.cancelled += 1,
            Err(_) => self.failed += 1,
        }
    }
}

/// Compile every graph in parallel.
///
/// One broken method fails its own slot and nothing else. Cancellation
/// reaches all workers through the shared token.
pub fn compile_batch(
    graphs: &mut [Graph],
    config: &CompileConfig,
    cancel: &CancelToken,
) -> (Vec<Result<CompileOutput>>, BatchReport) {
    debug!(methods = graphs.len(), "batch compile");
    let report = Mutex::new(BatchReport::default());
    let results: Vec<Result<CompileOutput>> = graphs
        .par_iter_mut()
        .map(|graph| {
            let outcome = compile(graph, config, cancel);
            report.lock().absorb(&outcome);
            outcome
        })
        .collect();
    (results, report.into_inner())
}

// =============================================================================
// Tests
// =============================================================================
