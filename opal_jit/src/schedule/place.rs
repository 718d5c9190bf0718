//! Floating-node placement.
//!
//! Fixed nodes keep the chain blocks discovery gave them and phis sit
//! at their merge. Every other live node is pure data and gets a block
//! here:
//!
//! - `Earliest`: the dominance-deepest block among the inputs' blocks.
//! - `LatestOutOfLoops`: start from the common dominator of the uses
//!   and hoist along the dominator chain toward the earliest legal
//!   block, keeping the candidate with the lowest loop depth, then the
//!   lowest estimated frequency. Work leaves loops and cold paths
//!   unless its uses force it there.
//!
//! A phi use counts the matching predecessor block, not the merge: the
//! operand must be ready on the incoming edge.
//!
//! Afterwards every block's node list is rebuilt in execution order:
//! leader first, then phis, chain and floating nodes interleaved with
//! inputs before uses, terminator last.

use crate::ir::{BitSet, Graph, Node, NodeId, Op, SecondaryMap};

use super::cfg::{Block, BlockId, Cfg, DominatorTree};
use super::SchedStrategy;

/// Assign a block to every live floating node.
pub(super) fn place(graph: &Graph, cfg: &mut Cfg, dom: &DominatorTree, strategy: SchedStrategy) {
    let mut placer = Placer {
        graph,
        cfg,
        dom,
        early: SecondaryMap::with_capacity(graph.len()),
        on_input_path: BitSet::with_capacity(graph.len()),
        on_user_path: BitSet::with_capacity(graph.len()),
    };
    placer.place_phis();
    placer.place_pure(strategy);
}

struct Placer<'a> {
    graph: &'a Graph,
    cfg: &'a mut Cfg,
    dom: &'a DominatorTree,
    /// Earliest legal block per pure node.
    early: SecondaryMap<Node, BlockId>,
    /// Nodes on the current input-walk path. An input already on the
    /// path is a data cycle. The user walk keeps its own set because an
    /// input of a transitive user is the normal case, not a cycle.
    on_input_path: BitSet,
    on_user_path: BitSet,
}

impl Placer<'_> {
    /// Phis live in their region's block.
    fn place_phis(&mut self) {
        for (id, node) in self.graph.iter_live() {
            if !matches!(node.op, Op::Phi { .. } | Op::MemoryPhi) {
                continue;
            }
            let region = match node.inputs.get(0) {
                Some(r) => r,
                None => opal_core::graph_bug!("phi {id} without a region"),
            };
            let block = self.cfg.block_of(region);
            if !block.is_valid() {
                opal_core::graph_bug!("phi {id} hangs off unreachable region {region}");
            }
            self.cfg.assign(id, block);
        }
    }

    fn place_pure(&mut self, strategy: SchedStrategy) {
        for (id, node) in self.graph.iter_live() {
            if !node.op.is_pure() {
                continue;
            }
            match strategy {
                SchedStrategy::Earliest => {
                    let block = self.earliest(id);
                    self.cfg.assign(id, block);
                }
                SchedStrategy::LatestOutOfLoops => self.place_late(id),
            }
        }
        // Guards and anchors are pinned into the chain before this
        // phase; a leftover one has no block to go to.
        for (id, node) in self.graph.iter_live() {
            if !node.op.is_fixed() && !self.cfg.block_of(id).is_valid() {
                opal_core::graph_bug!(
                    "floating {} node {id} survived to scheduling",
                    node.op.mnemonic()
                );
            }
        }
    }

    /// Earliest legal block: the dominance-deepest input block. Pure
    /// inputs count their own earliest block.
    fn earliest(&mut self, root: NodeId) -> BlockId {
        let known = self.early_of(root);
        if known.is_valid() {
            return known;
        }
        let graph = self.graph;
        let mut stack = vec![root];
        self.on_input_path.insert(root.as_usize());
        while let Some(&top) = stack.last() {
            let inputs = &graph.node(top).inputs;
            let mut unresolved = None;
            for input in inputs.iter() {
                if input.is_valid()
                    && graph.op(input).is_pure()
                    && !self.early_of(input).is_valid()
                {
                    unresolved = Some(input);
                    break;
                }
            }
            if let Some(input) = unresolved {
                opal_core::guarantee!(
                    !self.on_input_path.contains(input.as_usize()),
                    "pure value cycle through {input}"
                );
                self.on_input_path.insert(input.as_usize());
                stack.push(input);
                continue;
            }
            let mut best = self.cfg.entry;
            for input in inputs.iter() {
                if !input.is_valid() {
                    continue;
                }
                let block = if graph.op(input).is_pure() {
                    self.early_of(input)
                } else {
                    let b = self.cfg.block_of(input);
                    if !b.is_valid() {
                        opal_core::graph_bug!("input {input} of {top} is outside the schedule");
                    }
                    b
                };
                if self.dom.depth(block) > self.dom.depth(best) {
                    best = block;
                }
            }
            self.early.set(top, best);
            self.on_input_path.remove(top.as_usize());
            stack.pop();
        }
        self.early_of(root)
    }

    fn early_of(&self, node: NodeId) -> BlockId {
        self.early.get(node).copied().unwrap_or(BlockId::INVALID)
    }

    /// Latest-out-of-loops placement. Pure users are placed first so
    /// their blocks bound this node's.
    fn place_late(&mut self, root: NodeId) {
        if self.cfg.block_of(root).is_valid() {
            return;
        }
        let graph = self.graph;
        let mut stack = vec![root];
        self.on_user_path.insert(root.as_usize());
        while let Some(&top) = stack.last() {
            let mut unplaced = None;
            for &user in graph.uses(top) {
                if graph.op(user).is_pure() && !self.cfg.block_of(user).is_valid() {
                    unplaced = Some(user);
                    break;
                }
            }
            if let Some(user) = unplaced {
                opal_core::guarantee!(
                    !self.on_user_path.contains(user.as_usize()),
                    "pure value cycle through {user}"
                );
                self.on_user_path.insert(user.as_usize());
                stack.push(user);
                continue;
            }
            let block = self.late_block(top);
            self.cfg.assign(top, block);
            self.on_user_path.remove(top.as_usize());
            stack.pop();
        }
    }

    /// Common dominator of the placed uses, hoisted toward the earliest
    /// legal block.
    fn late_block(&mut self, node: NodeId) -> BlockId {
        let graph = self.graph;
        let early = self.earliest(node);
        let mut latest = BlockId::INVALID;
        for &user in graph.uses(node) {
            let unode = graph.node(user);
            for i in 0..unode.inputs.len() {
                if unode.inputs.get(i) != Some(node) {
                    continue;
                }
                let use_block = match unode.op {
                    Op::Phi { .. } | Op::MemoryPhi if i >= 1 => {
                        let region = match unode.inputs.get(0) {
                            Some(r) => r,
                            None => opal_core::graph_bug!("phi {user} without a region"),
                        };
                        let feed = match graph.node(region).inputs.get(i - 1) {
                            Some(f) => f,
                            None => {
                                opal_core::graph_bug!("phi {user} is wider than its region")
                            }
                        };
                        self.cfg.block_of(feed)
                    }
                    _ => self.cfg.block_of(user),
                };
                if !use_block.is_valid() {
                    opal_core::graph_bug!("use {user} of {node} has no block");
                }
                latest = if latest.is_valid() {
                    self.dom.common_dominator(latest, use_block)
                } else {
                    use_block
                };
            }
        }
        if !latest.is_valid() {
            // Nothing uses it; leave it where its inputs sit.
            return early;
        }
        self.hoist(early, latest)
    }

    /// Walk the dominator chain from `latest` up to `early`, keeping
    /// the cheapest block and staying as late as possible among equals.
    fn hoist(&self, early: BlockId, latest: BlockId) -> BlockId {
        let mut best = latest;
        let mut cur = latest;
        while cur != early {
            cur = match self.dom.idom(cur) {
                Some(i) => i,
                None => opal_core::graph_bug!("hoist walk escaped the entry block"),
            };
            let (cur_depth, cur_freq) = self.cost(cur);
            let (best_depth, best_freq) = self.cost(best);
            if cur_depth < best_depth || (cur_depth == best_depth && cur_freq < best_freq) {
                best = cur;
            }
        }
        best
    }

    fn cost(&self, block: BlockId) -> (u32, f64) {
        let b = self.cfg.block(block);
        (b.loop_depth, b.frequency)
    }
}

// =============================================================================
// Block-local ordering
// =============================================================================

/// Rebuild each block's node list in execution order: leader, phis,
/// chain and floating nodes with inputs before uses, terminator last.
pub(super) fn order_blocks(graph: &Graph, cfg: &mut Cfg) {
    let mut phis: SecondaryMap<Block, Vec<NodeId>> = SecondaryMap::with_capacity(cfg.len());
    let mut floats: SecondaryMap<Block, Vec<NodeId>> = SecondaryMap::with_capacity(cfg.len());
    for (id, node) in graph.iter_live() {
        if node.op.is_fixed() {
            continue;
        }
        let block = cfg.block_of(id);
        if !block.is_valid() {
            continue;
        }
        if matches!(node.op, Op::Phi { .. } | Op::MemoryPhi) {
            phis[block].push(id);
        } else {
            floats[block].push(id);
        }
    }

    let mut emitted = BitSet::with_capacity(graph.len());
    for i in 0..cfg.len() {
        let block = BlockId::new(i as u32);
        let chain = std::mem::take(&mut cfg.block_mut(block).nodes);
        let leader = chain[0];
        let terminator = cfg.block(block).terminator;

        let mut list =
            Vec::with_capacity(chain.len() + phis[block].len() + floats[block].len());
        list.push(leader);
        emitted.insert(leader.as_usize());
        for &phi in &phis[block] {
            list.push(phi);
            emitted.insert(phi.as_usize());
        }
        for &fixed in &chain[1..] {
            if fixed == terminator {
                continue;
            }
            emit_with_deps(graph, cfg, block, fixed, &mut emitted, &mut list);
        }
        for &float in &floats[block] {
            emit_with_deps(graph, cfg, block, float, &mut emitted, &mut list);
        }
        if terminator != leader {
            emit_with_deps(graph, cfg, block, terminator, &mut emitted, &mut list);
        }
        cfg.block_mut(block).nodes = list;
    }
}

/// Emit `node` preceded by its not-yet-emitted floating inputs from the
/// same block.
fn emit_with_deps(
    graph: &Graph,
    cfg: &Cfg,
    block: BlockId,
    node: NodeId,
    emitted: &mut BitSet,
    list: &mut Vec<NodeId>,
) {
    if emitted.contains(node.as_usize()) {
        return;
    }
    let mut stack = vec![node];
    while let Some(&top) = stack.last() {
        if emitted.contains(top.as_usize()) {
            stack.pop();
            continue;
        }
        let mut pending = false;
        for input in graph.node(top).inputs.iter() {
            if !input.is_valid() || emitted.contains(input.as_usize()) {
                continue;
            }
            let inode = graph.node(input);
            if inode.op.is_fixed() || matches!(inode.op, Op::Phi { .. } | Op::MemoryPhi) {
                continue;
            }
            if cfg.block_of(input) != block {
                continue;
            }
            stack.push(input);
            pending = true;
        }
        if pending {
            continue;
        }
        emitted.insert(top.as_usize());
        list.push(top);
        stack.pop();
    }
}

// =============================================================================
// Tests
// =============================================================================
