//! Phase ordering and failure isolation.
//!
//! A pipeline is an explicit list of phases, validated against the stage
//! partial order before anything runs: every phase's required stages must
//! be produced by some earlier phase, and strictly-once phases may appear
//! once. Phase panics (`graph_bug!` invariant violations) are caught here
//! and converted into [`CompileError::PhaseFailed`] carrying the phase
//! name and a pre-phase graph dump, so one broken method never takes the
//! host down.
//!
//! `shuffled` builds a random legal order from a seed, for pipeline
//! fuzzing: optional phases may drop out, required ones are permuted
//! within the partial order, and identical seeds give identical pipelines.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::time::Instant;

use tracing::{debug, trace};

use opal_core::{CompileError, Result, SplitMix64};

use crate::dump::graph_to_string;
use crate::ir::{Graph, StageSet};
use crate::schedule::Schedule;

use super::{Canonicalize, DeadCodeElim, FixGuards, PartialEscape, Phase, PhaseContext};

/// Ordered list of phases for one compilation.
pub struct Pipeline {
    phases: Vec<Box<dyn Phase>>,
}

fn default_phases() -> Vec<Box<dyn Phase>> {
    vec![
        Box::new(Canonicalize),
        Box::new(PartialEscape),
        Box::new(FixGuards),
        Box::new(DeadCodeElim),
        Box::new(Schedule),
    ]
}

impl Pipeline {
    /// The driver's default order: canonicalize, escape analysis, guard
    /// pinning, dead code sweep, scheduling.
    pub fn new() -> Pipeline {
        Pipeline {
            phases: default_phases(),
        }
    }

    /// An explicit phase list; external tooling substitutes pipelines as
    /// data.
    pub fn with_phases(phases: Vec<Box<dyn Phase>>) -> Pipeline {
        Pipeline { phases }
    }

    /// A random legal order for `seed`. Phases whose stages nothing needs
    /// on the way to `terminal` may drop out; the rest appear in any order
    /// the stage preconditions admit. Identical seeds give identical
    /// pipelines.
    pub fn shuffled(seed: u64, terminal: StageSet) -> Pipeline {
        let mut rng = SplitMix64::new(seed);
        let pool = default_phases();

        // Stages transitively needed to reach the terminal set.
        let mut needed = terminal;
        loop {
            let mut grown = needed;
            for p in &pool {
                if p.produces().intersects(needed) {
                    grown |= p.requires();
                }
            }
            if grown == needed {
                break;
            }
            needed = grown;
        }

        let mut kept: Vec<Box<dyn Phase>> = Vec::new();
        for p in pool {
            if p.produces().intersects(needed) || rng.next_bool() {
                kept.push(p);
            }
        }

        let mut order: Vec<Box<dyn Phase>> = Vec::with_capacity(kept.len());
        let mut acquired = StageSet::empty();
        while !kept.is_empty() {
            let runnable: Vec<usize> = kept
                .iter()
                .enumerate()
                .filter(|(_, p)| acquired.contains(p.requires()))
                .map(|(i, _)| i)
                .collect();
            opal_core::guarantee!(!runnable.is_empty(), "phase preconditions form a cycle");
            let pick = runnable[rng.next_index(runnable.len())];
            let phase = kept.swap_remove(pick);
            acquired |= phase.produces();
            order.push(phase);
        }
        Pipeline { phases: order }
    }

    pub fn phase_names(&self) -> Vec<&'static str> {
        self.phases.iter().map(|p| p.name()).collect()
    }

    /// Check the list against the stage partial order without running
    /// anything. `initial` is the stage set the incoming graph already
    /// holds.
    pub fn validate(&self, initial: StageSet) -> Result<()> {
        let mut acquired = initial;
        let mut once_seen: Vec<&'static str> = Vec::new();
        for phase in &self.phases {
            let name = phase.name();
            if phase.strictly_once() {
                if once_seen.contains(&name) {
                    return Err(CompileError::InvalidPipeline(format!(
                        "strictly-once phase `{name}` appears twice"
                    )));
                }
                once_seen.push(name);
            }
            let missing = phase.requires() - acquired;
            if !missing.is_empty() {
                return Err(CompileError::InvalidPipeline(format!(
                    "phase `{name}` requires {missing:?} which no earlier phase produces"
                )));
            }
            acquired |= phase.produces();
        }
        Ok(())
    }

    /// Validate against the graph's current stages, then run every phase
    /// in order. The first failure wins; the graph must be considered
    /// poisoned after an error.
    pub fn run(&mut self, graph: &mut Graph, ctx: &mut PhaseContext<'_>) -> Result<()> {
        self.validate(graph.state.stages())?;
        for phase in &mut self.phases {
            ctx.cancel.check()?;
            let name = phase.name();
            let dump_before = if ctx.config.dump_on_failure || ctx.config.dump_phases {
                Some(graph_to_string(graph))
            } else {
                None
            };
            if ctx.config.dump_phases {
                if let Some(text) = dump_before.as_deref() {
                    trace!(phase = name, "graph before:\n{text}");
                }
            }

            let start = Instant::now();
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| phase.run(graph, ctx)));
            let elapsed = start.elapsed();
            ctx.stats.phase_times.push((name, elapsed));

            match outcome {
                Ok(Ok(())) => {
                    debug!(phase = name, micros = elapsed.as_micros() as u64, "phase done");
                    if ctx.config.dump_phases {
                        trace!(phase = name, "graph after:\n{}", graph_to_string(graph));
                    }
                }
                Ok(Err(err)) => return Err(err),
                Err(payload) => {
                    return Err(CompileError::PhaseFailed {
                        phase: name,
                        detail: panic_message(payload),
                        dump: dump_before,
                    });
                }
            }

            #[cfg(debug_assertions)]
            if let Err(detail) = crate::ir::verify::verify(graph) {
                return Err(CompileError::PhaseFailed {
                    phase: name,
                    detail,
                    dump: dump_before,
                });
            }
        }
        Ok(())
    }
}

impl Default for Pipeline {
    fn default() -> Pipeline {
        Pipeline::new()
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unrecognized panic payload".to_string()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{ClassId, CmpOp, DeoptReason, FieldId, GraphBuilder, ValKind};
    use crate::opt::{CompileConfig, CompileStats};
    use opal_core::CancelToken;

    fn sample_graph() -> Graph {
        let mut b = GraphBuilder::new();
        let p = b.param(0, ValKind::I32);
        let zero = b.const_i32(0);
        let c = b.int_cmp(CmpOp::Ne, p, zero);
        let anchor = b.anchor();
        b.guard(c, DeoptReason::NullCheck, anchor);
        let obj = b.new_object(ClassId(1), 1);
        b.store_field(obj, FieldId(0), p);
        let v = b.load_field(obj, FieldId(0), ValKind::I32);
        let sum = b.int_add(v, zero);
        b.ret(Some(sum));
        b.finish()
    }

    #[test]
    fn test_default_pipeline_validates() {
        assert!(Pipeline::new().validate(StageSet::empty()).is_ok());
    }

    #[test]
    fn test_out_of_order_pipeline_is_rejected() {
        let p = Pipeline::with_phases(vec![Box::new(FixGuards), Box::new(Canonicalize)]);
        let err = p.validate(StageSet::empty()).unwrap_err();
        assert!(matches!(err, CompileError::InvalidPipeline(_)));
        // The same list is fine on a graph that is already canonical.
        assert!(p.validate(StageSet::CANONICAL).is_ok());
    }

    #[test]
    fn test_repeated_strictly_once_phase_is_rejected() {
        let p = Pipeline::with_phases(vec![
            Box::new(Canonicalize),
            Box::new(FixGuards),
            Box::new(FixGuards),
        ]);
        let err = p.validate(StageSet::empty()).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("twice"), "{msg}");
    }

    #[test]
    fn test_full_pipeline_produces_a_schedule() {
        let mut g = sample_graph();
        let config = CompileConfig::default();
        let cancel = CancelToken::new();
        let mut stats = CompileStats::default();
        let mut ctx = PhaseContext::new(&config, &cancel, &mut stats);

        Pipeline::new().run(&mut g, &mut ctx).unwrap();
        assert!(g.state.is_after(StageSet::SCHEDULED));
        assert!(ctx.schedule.is_some());
        let names: Vec<&str> = ctx.stats.phase_times.iter().map(|(n, _)| *n).collect();
        assert_eq!(
            names,
            vec!["canonicalize", "escape", "guards", "dce", "schedule"]
        );
        // The allocation does not escape and the guard is pinned.
        assert_eq!(ctx.stats.allocs_virtualized, 1);
        assert_eq!(ctx.stats.guards_pinned, 1);
    }

    #[test]
    fn test_dump_phases_does_not_disturb_the_run() {
        let mut g = sample_graph();
        let config = CompileConfig {
            dump_phases: true,
            ..CompileConfig::default()
        };
        let cancel = CancelToken::new();
        let mut stats = CompileStats::default();
        let mut ctx = PhaseContext::new(&config, &cancel, &mut stats);

        Pipeline::new().run(&mut g, &mut ctx).unwrap();
        assert!(g.state.is_after(StageSet::SCHEDULED));
    }

    #[test]
    fn test_shuffled_is_deterministic_and_legal() {
        for seed in 0..16u64 {
            let a = Pipeline::shuffled(seed, StageSet::SCHEDULED);
            let b = Pipeline::shuffled(seed, StageSet::SCHEDULED);
            assert_eq!(a.phase_names(), b.phase_names());
            assert!(
                a.validate(StageSet::empty()).is_ok(),
                "seed {seed}: {:?}",
                a.phase_names()
            );
            for required in ["canonicalize", "guards", "schedule"] {
                assert!(
                    a.phase_names().contains(&required),
                    "seed {seed} dropped `{required}`"
                );
            }
        }
    }

    #[test]
    fn test_shuffled_pipelines_compile_correctly() {
        for seed in [3, 11, 29] {
            let mut g = sample_graph();
            let config = CompileConfig::default();
            let cancel = CancelToken::new();
            let mut stats = CompileStats::default();
            let mut ctx = PhaseContext::new(&config, &cancel, &mut stats);
            Pipeline::shuffled(seed, StageSet::SCHEDULED)
                .run(&mut g, &mut ctx)
                .unwrap();
            assert!(g.state.is_after(StageSet::SCHEDULED), "seed {seed}");
            assert!(ctx.schedule.is_some(), "seed {seed}");
        }
    }

    struct Broken;

    impl Phase for Broken {
        fn name(&self) -> &'static str {
            "broken"
        }

        fn run(&mut self, _graph: &mut Graph, _ctx: &mut PhaseContext<'_>) -> Result<()> {
            opal_core::graph_bug!("deliberately tripped");
        }
    }

    #[test]
    fn test_phase_panic_is_isolated_with_dump() {
        let mut g = sample_graph();
        let config = CompileConfig::default();
        let cancel = CancelToken::new();
        let mut stats = CompileStats::default();
        let mut ctx = PhaseContext::new(&config, &cancel, &mut stats);

        let err = Pipeline::with_phases(vec![Box::new(Broken)])
            .run(&mut g, &mut ctx)
            .unwrap_err();
        match err {
            CompileError::PhaseFailed { phase, detail, dump } => {
                assert_eq!(phase, "broken");
                assert!(detail.contains("deliberately tripped"));
                assert!(dump.is_some());
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    struct Tired;

    impl Phase for Tired {
        fn name(&self) -> &'static str {
            "tired"
        }

        fn run(&mut self, _graph: &mut Graph, _ctx: &mut PhaseContext<'_>) -> Result<()> {
            Err(CompileError::FixpointExceeded { phase: "tired", steps: 7 })
        }
    }

    #[test]
    fn test_phase_error_passes_through() {
        let mut g = sample_graph();
        let config = CompileConfig::default();
        let cancel = CancelToken::new();
        let mut stats = CompileStats::default();
        let mut ctx = PhaseContext::new(&config, &cancel, &mut stats);

        let err = Pipeline::with_phases(vec![Box::new(Tired)])
            .run(&mut g, &mut ctx)
            .unwrap_err();
        assert!(matches!(err, CompileError::FixpointExceeded { steps: 7, .. }));
        assert_eq!(ctx.stats.phase_times.len(), 1);
    }
}
