//! Guard pinning.
//!
//! Up to this point speculation checks float: a `Guard` hangs off an
//! `Anchor` and constrains nothing but its ordering. Lowering them means
//! making the check explicit control flow. Each guard becomes an `If` on
//! its condition spliced in right before the anchor, with the true arm
//! continuing the original chain and the false arm ending in a `Deopt`
//! carrying the guard's reason.
//!
//! Guards attached to the same anchor are pinned in creation order, which
//! matches the order the frontend emitted the checks. The phase runs
//! exactly once; afterwards anchors have no remaining purpose and the
//! seeded canonicalize sweep splices them out of the chain.

use tracing::debug;

use opal_core::Result;

use crate::ir::{Graph, NodeId, Op, StageSet};

use super::canonicalize::canonicalize_from;
use super::{Phase, PhaseContext};

/// Turns floating guards into branches to `Deopt`.
#[derive(Debug, Default)]
pub struct FixGuards;

impl Phase for FixGuards {
    fn name(&self) -> &'static str {
        "guards"
    }

    fn requires(&self) -> StageSet {
        StageSet::CANONICAL
    }

    fn produces(&self) -> StageSet {
        StageSet::GUARDS_FIXED
    }

    fn strictly_once(&self) -> bool {
        true
    }

    fn run(&mut self, graph: &mut Graph, ctx: &mut PhaseContext<'_>) -> Result<()> {
        let mut guards: Vec<NodeId> = Vec::new();
        let mut anchors: Vec<NodeId> = Vec::new();
        for (id, node) in graph.iter_live() {
            match node.op {
                Op::Guard { .. } => guards.push(id),
                Op::Anchor => anchors.push(id),
                _ => {}
            }
        }
        guards.sort_unstable();

        let mut touched: Vec<NodeId> = Vec::new();
        let mut pinned = 0u64;
        for g in guards {
            ctx.cancel.check()?;
            let reason = match *graph.op(g) {
                Op::Guard { reason } => reason,
                _ => opal_core::graph_bug!("{g} left the live set mid-phase"),
            };
            let cond = match graph.node(g).inputs.get(0) {
                Some(c) => c,
                None => opal_core::graph_bug!("{g} has no condition"),
            };
            let anchor = match graph.node(g).inputs.get(1) {
                Some(a) => a,
                None => opal_core::graph_bug!("{g} has no anchor"),
            };
            let pred = match graph.control_pred(anchor) {
                Some(p) => p,
                None => opal_core::graph_bug!("anchor {anchor} is detached"),
            };

            let iff = graph.add(Op::If, &[pred, cond]);
            let pass = graph.add(Op::Proj { index: 0 }, &[iff]);
            let fail = graph.add(Op::Proj { index: 1 }, &[iff]);
            let deopt = graph.add(Op::Deopt { reason }, &[fail]);
            let end = graph.end;
            graph.add_input(end, deopt);
            graph.replace_input(anchor, 0, pass);
            graph.kill(g);

            // Conditions the canonicalizer constified after its own run
            // still collapse, via the branch.
            touched.push(iff);
            pinned += 1;
            ctx.stats.guards_pinned += 1;
        }

        graph.state.mark(StageSet::GUARDS_FIXED);
        // Every anchor is guardless now and folds away under the marked
        // stage, including anchors that never carried a guard.
        touched.extend(anchors);
        canonicalize_from(graph, ctx, &touched)?;
        debug!(pinned, "guards pinned");
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
