//! Scheduling: from the floating graph back to ordered basic blocks.
//!
//! The optimizer works on a sea of nodes where pure values have no
//! position. Code generation needs the opposite, so the final phase
//! rebuilds classic structure: block discovery over the fixed chains,
//! dominators and loop nesting on the block graph, a block for every
//! floating node, and a total order inside each block. The result is a
//! [`MethodSchedule`], the read-only view later stages consume.
//!
//! A schedule is only meaningful for the exact graph it was computed
//! from. It records the graph's edit counter; touching the graph
//! afterwards makes the schedule stale, and stale access is an
//! invariant violation, not an error value. In-schedule edits go
//! through [`BlockCursor`], which keeps the two in sync.

mod cfg;
mod place;

pub use cfg::{Block, BlockId, Cfg, DominatorTree, LoopInfo, LoopTree};

use tracing::debug;

use opal_core::Result;

use crate::ir::{Graph, NodeId, StageSet};
use crate::opt::{Phase, PhaseContext};

// =============================================================================
// Strategy
// =============================================================================

/// Where floating nodes land.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchedStrategy {
    /// Dominance-deepest block the inputs allow. Values compute as soon
    /// as possible, which keeps them out of branches but lengthens live
    /// ranges.
    Earliest,
    /// Common dominator of the uses, hoisted only while that lowers
    /// loop depth or estimated frequency. Work stays off paths that do
    /// not need it.
    #[default]
    LatestOutOfLoops,
}

// =============================================================================
// Phase
// =============================================================================

/// Computes the method schedule and hands it to the driver through the
/// phase context.
#[derive(Debug, Default)]
pub struct Schedule;

impl Phase for Schedule {
    fn name(&self) -> &'static str {
        "schedule"
    }

    fn requires(&self) -> StageSet {
        StageSet::CANONICAL | StageSet::GUARDS_FIXED
    }

    fn produces(&self) -> StageSet {
        StageSet::SCHEDULED
    }

    fn run(&mut self, graph: &mut Graph, ctx: &mut PhaseContext<'_>) -> Result<()> {
        ctx.cancel.check()?;
        let mut cfg = Cfg::build(graph);
        let dom = DominatorTree::build(&cfg);
        let loops = LoopTree::build(&cfg, &dom);
        cfg.annotate(&dom, &loops);

        ctx.cancel.check()?;
        place::place(graph, &mut cfg, &dom, ctx.config.strategy);
        place::order_blocks(graph, &mut cfg);

        graph.state.mark(StageSet::SCHEDULED);
        debug!(blocks = cfg.len(), "schedule complete");
        ctx.schedule = Some(MethodSchedule {
            cfg,
            dom,
            edits: graph.edit_count(),
        });
        Ok(())
    }
}

// =============================================================================
// MethodSchedule
// =============================================================================

/// The scheduling result: every live node assigned to a block, every
/// block's nodes in execution order, plus the dominator tree and the
/// loop and frequency annotations the placement used.
#[derive(Debug)]
pub struct MethodSchedule {
    cfg: Cfg,
    dom: DominatorTree,
    /// Graph edit counter at the time the schedule was computed.
    edits: u64,
}

impl MethodSchedule {
    pub fn block_count(&self) -> usize {
        self.cfg.len()
    }

    pub fn entry(&self) -> BlockId {
        self.cfg.entry
    }

    /// Blocks in reverse postorder.
    pub fn rpo(&self) -> &[BlockId] {
        &self.cfg.rpo
    }

    /// The block a node was scheduled into. `None` for the end node and
    /// for dead nodes.
    pub fn block_of(&self, node: NodeId) -> Option<BlockId> {
        let block = self.cfg.block_of(node);
        block.is_valid().then_some(block)
    }

    /// Nodes of `block` in execution order: leader first, phis next,
    /// terminator last.
    pub fn nodes(&self, block: BlockId) -> &[NodeId] {
        &self.cfg.block(block).nodes
    }

    pub fn leader(&self, block: BlockId) -> NodeId {
        self.cfg.block(block).leader
    }

    pub fn terminator(&self, block: BlockId) -> NodeId {
        self.cfg.block(block).terminator
    }

    pub fn preds(&self, block: BlockId) -> &[BlockId] {
        &self.cfg.block(block).preds
    }

    pub fn succs(&self, block: BlockId) -> &[BlockId] {
        &self.cfg.block(block).succs
    }

    pub fn loop_depth(&self, block: BlockId) -> u32 {
        self.cfg.block(block).loop_depth
    }

    /// Estimated executions per method entry.
    pub fn frequency(&self, block: BlockId) -> f64 {
        self.cfg.block(block).frequency
    }

    pub fn dominates(&self, a: BlockId, b: BlockId) -> bool {
        self.dom.dominates(a, b)
    }

    pub fn idom(&self, block: BlockId) -> Option<BlockId> {
        self.dom.idom(block)
    }

    /// Edit counter the schedule was computed at.
    pub fn edit_count(&self) -> u64 {
        self.edits
    }

    /// Open a cursor over `block`, positioned at its leader.
    ///
    /// The schedule must be fresh for the graph. Cursor edits keep it
    /// fresh; any other graph mutation makes it stale.
    pub fn cursor(&mut self, graph: &Graph, block: BlockId) -> BlockCursor<'_> {
        self.assert_fresh(graph);
        BlockCursor {
            sched: self,
            block,
            pos: 0,
        }
    }

    fn assert_fresh(&self, graph: &Graph) {
        opal_core::guarantee!(
            self.edits == graph.edit_count(),
            "stale schedule: computed at edit {} but the graph is at {}",
            self.edits,
            graph.edit_count()
        );
    }
}

// =============================================================================
// BlockCursor
// =============================================================================

/// A position inside one block's node list.
///
/// Splicing goes through the cursor so the schedule absorbs the edits:
/// create the node on the graph first, then insert or replace here.
pub struct BlockCursor<'a> {
    sched: &'a mut MethodSchedule,
    block: BlockId,
    pos: usize,
}

impl BlockCursor<'_> {
    pub fn current(&self) -> NodeId {
        self.sched.cfg.block(self.block).nodes[self.pos]
    }

    /// Step to the next node. False once the terminator is current.
    pub fn advance(&mut self) -> bool {
        if self.pos + 1 < self.sched.cfg.block(self.block).nodes.len() {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    /// Splice `node` in right after the current position.
    pub fn insert_after_current(&mut self, graph: &Graph, node: NodeId) {
        opal_core::guarantee!(
            self.current() != self.sched.cfg.block(self.block).terminator,
            "cannot schedule {node} after the terminator of {:?}",
            self.block
        );
        let pos = self.pos;
        let target = self.block;
        self.sched.cfg.block_mut(target).nodes.insert(pos + 1, node);
        self.sched.cfg.assign(node, target);
        self.sched.edits = graph.edit_count();
    }

    /// Swap the current node for `node`, keeping the position.
    ///
    /// The caller retires the old node separately; replacing a leader
    /// or terminator keeps the block's role fields in step.
    pub fn replace_current(&mut self, graph: &Graph, node: NodeId) {
        let old = self.current();
        let target = self.block;
        if self.sched.cfg.block(target).leader == old {
            opal_core::guarantee!(
                graph.op(node).is_block_leader(),
                "{node} cannot lead a block"
            );
            self.sched.cfg.block_mut(target).leader = node;
        }
        if self.sched.cfg.block(target).terminator == old {
            self.sched.cfg.block_mut(target).terminator = node;
        }
        self.sched.cfg.block_mut(target).nodes[self.pos] = node;
        self.sched.cfg.assign(node, target);
        self.sched.edits = graph.edit_count();
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{CmpOp, GraphBuilder, IntArith, Op, ValKind};
    use crate::opt::{CompileConfig, CompileStats};
    use opal_core::{CancelToken, CompileError};

    fn run_schedule(graph: &mut Graph) -> MethodSchedule {
        let config = CompileConfig::default();
        let cancel = CancelToken::new();
        let mut stats = CompileStats::default();
        let mut ctx = PhaseContext::new(&config, &cancel, &mut stats);
        let mut phase = Schedule;
        phase.run(graph, &mut ctx).unwrap();
        ctx.schedule.take().unwrap()
    }

    fn diamond() -> (Graph, NodeId) {
        let mut b = GraphBuilder::new();
        let p = b.param(0, ValKind::I32);
        let zero = b.const_i32(0);
        let c = b.int_cmp(CmpOp::Ne, p, zero);
        let mem = b.tail().memory;
        let (t, f) = b.branch(c);
        b.seek(t, mem);
        let t_exit = b.tail();
        b.seek(f, mem);
        let f_exit = b.tail();
        let region = b.merge(&[t_exit, f_exit]);
        let phi = b.phi(region, ValKind::I32, &[p, zero]);
        b.ret(Some(phi));
        (b.finish(), phi)
    }

    #[test]
    fn test_phase_produces_a_schedule() {
        let (mut g, phi) = diamond();
        let sched = run_schedule(&mut g);

        assert!(g.state.is_after(StageSet::SCHEDULED));
        assert_eq!(sched.block_count(), 4);
        assert_eq!(sched.rpo().len(), 4);
        assert_eq!(sched.rpo()[0], sched.entry());
        assert_eq!(sched.leader(sched.entry()), g.start);
        assert!(sched.block_of(g.end).is_none());

        let merge = sched.block_of(phi).unwrap();
        assert_eq!(sched.nodes(merge)[1], phi);
        assert_eq!(sched.preds(merge).len(), 2);
        for &pred in sched.preds(merge) {
            assert!(sched.dominates(sched.entry(), pred));
        }
    }

    #[test]
    fn test_every_input_block_dominates_its_use() {
        let (mut g, _) = diamond();
        let sched = run_schedule(&mut g);

        for (id, node) in g.iter_live() {
            let Some(block) = sched.block_of(id) else {
                continue;
            };
            for input in node.inputs.iter() {
                if !input.is_valid() {
                    continue;
                }
                if matches!(g.op(id), Op::Phi { .. } | Op::MemoryPhi)
                    || g.op(id).is_block_leader()
                {
                    continue;
                }
                let Some(in_block) = sched.block_of(input) else {
                    continue;
                };
                assert!(
                    sched.dominates(in_block, block),
                    "{input} in {in_block:?} does not dominate its use {id} in {block:?}"
                );
            }
        }
    }

    #[test]
    fn test_cursor_insert_keeps_the_schedule_fresh() {
        let mut b = GraphBuilder::new();
        let p = b.param(0, ValKind::I32);
        let k = b.const_i32(3);
        let sum = b.int_add(p, k);
        b.ret(Some(sum));
        let mut g = b.finish();
        let mut sched = run_schedule(&mut g);

        let entry = sched.entry();
        let mut cur = sched.cursor(&g, entry);
        while cur.current() != sum {
            assert!(cur.advance());
        }
        let doubled = g.add(Op::IntOp { op: IntArith::Add, bits: 32 }, &[sum, sum]);
        cur.insert_after_current(&g, doubled);

        assert_eq!(sched.block_of(doubled), Some(entry));
        let nodes = sched.nodes(entry).to_vec();
        let at = nodes.iter().position(|&n| n == sum).unwrap();
        assert_eq!(nodes[at + 1], doubled);

        // The cursor resynced the edit counter, so a new cursor opens fine.
        let cur = sched.cursor(&g, entry);
        assert_eq!(cur.current(), g.start);
    }

    #[test]
    fn test_cursor_replace_swaps_in_place() {
        let mut b = GraphBuilder::new();
        let p = b.param(0, ValKind::I32);
        let k = b.const_i32(3);
        let sum = b.int_add(p, k);
        b.ret(Some(sum));
        let mut g = b.finish();
        let mut sched = run_schedule(&mut g);

        let entry = sched.entry();
        let mut cur = sched.cursor(&g, entry);
        while cur.current() != sum {
            assert!(cur.advance());
        }
        let prod = g.add(Op::IntOp { op: IntArith::Mul, bits: 32 }, &[p, k]);
        cur.replace_current(&g, prod);
        assert_eq!(cur.current(), prod);

        assert_eq!(sched.block_of(prod), Some(entry));
        assert!(sched.nodes(entry).contains(&prod));
        assert_eq!(sched.terminator(entry), *sched.nodes(entry).last().unwrap());
    }

    #[test]
    #[should_panic(expected = "stale")]
    fn test_stale_schedule_access_panics() {
        let (mut g, _) = diamond();
        let mut sched = run_schedule(&mut g);

        g.const_i32(777);
        let entry = sched.entry();
        let _ = sched.cursor(&g, entry);
    }

    #[test]
    fn test_cancelled_schedule_bails_out() {
        let (mut g, _) = diamond();
        let config = CompileConfig::default();
        let cancel = CancelToken::new();
        cancel.cancel();
        let mut stats = CompileStats::default();
        let mut ctx = PhaseContext::new(&config, &cancel, &mut stats);
        let mut phase = Schedule;
        let err = phase.run(&mut g, &mut ctx).unwrap_err();
        assert!(matches!(err, CompileError::Cancelled));
        assert!(ctx.schedule.is_none());
    }

    #[test]
    fn test_strategy_changes_placement() {
        let mut b = GraphBuilder::new();
        let p = b.param(0, ValKind::I32);
        let zero = b.const_i32(0);
        let c = b.int_cmp(CmpOp::Ne, p, zero);
        let mem = b.tail().memory;
        let (t, f) = b.branch(c);
        b.seek(t, mem);
        let k = b.const_i32(41);
        let bumped = b.int_add(p, k);
        b.ret(Some(bumped));
        b.seek(f, mem);
        b.ret(Some(p));
        let mut g = b.finish();

        let sched = run_schedule(&mut g);
        assert_eq!(sched.block_of(bumped), sched.block_of(t));

        let config = CompileConfig {
            strategy: SchedStrategy::Earliest,
            ..CompileConfig::default()
        };
        let cancel = CancelToken::new();
        let mut stats = CompileStats::default();
        let mut ctx = PhaseContext::new(&config, &cancel, &mut stats);
        let mut phase = Schedule;
        phase.run(&mut g, &mut ctx).unwrap();
        let early = ctx.schedule.take().unwrap();
        assert_eq!(early.block_of(bumped), Some(early.entry()));
    }
}
