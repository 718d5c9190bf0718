//! Dead code elimination.
//!
//! Liveness is reachability along input edges from the exit sink. The
//! fixed chain keeps itself alive through its control edges, so what this
//! sweep actually removes is floating values nothing consumes, including
//! phi cycles left behind by dead loop variables, which single-node
//! deletion can never reach. Guards are extra roots while they still
//! float: no node consumes them, yet they must fire.

use tracing::debug;

use opal_core::Result;

use crate::ir::{BitSet, Graph, NodeId, Op};

use super::{Phase, PhaseContext};

/// Sweeps nodes unreachable from the graph's exits.
#[derive(Debug, Default)]
pub struct DeadCodeElim;

impl Phase for DeadCodeElim {
    fn name(&self) -> &'static str {
        "dce"
    }

    fn run(&mut self, graph: &mut Graph, ctx: &mut PhaseContext<'_>) -> Result<()> {
        ctx.cancel.check()?;

        let mut live = BitSet::with_capacity(graph.len());
        let mut work: Vec<NodeId> = Vec::new();
        live.insert(graph.end.as_usize());
        work.push(graph.end);
        for (id, node) in graph.iter_live() {
            if matches!(node.op, Op::Guard { .. }) {
                live.insert(id.as_usize());
                work.push(id);
            }
        }
        while let Some(n) = work.pop() {
            for input in graph.node(n).inputs.iter() {
                if input.is_valid() && !live.contains(input.as_usize()) {
                    live.insert(input.as_usize());
                    work.push(input);
                }
            }
        }

        let swept = graph.sweep(&live);
        ctx.stats.nodes_swept += swept;
        debug!(swept, live = graph.live_count(), "dead code swept");
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
