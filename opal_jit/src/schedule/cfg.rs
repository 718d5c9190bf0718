//! Control-flow skeleton for scheduling.
//!
//! The floating graph keeps no block structure, so scheduling derives
//! it here: basic blocks with predecessor and successor links, reverse
//! postorder, a dominator tree, the loop nesting, and a per-block
//! execution frequency estimate. Everything is rebuilt per run and
//! discarded with the schedule.
//!
//! A block starts at `Start`, `Region`, `LoopBegin`, or a branch
//! projection and follows the control chain to the next terminator or
//! merge. The end node only aggregates method exits and belongs to no
//! block.

use smallvec::SmallVec;

use crate::ir::{BitSet, Graph, Id, Node, NodeId, Op, SecondaryMap};

// =============================================================================
// Blocks
// =============================================================================

pub type BlockId = Id<Block>;

/// One basic block: a maximal run of fixed nodes with a single entry
/// and a single exit.
#[derive(Debug, Clone)]
pub struct Block {
    /// First fixed node: `Start`, `Region`, `LoopBegin`, or a projection.
    pub leader: NodeId,
    /// Last fixed node: a branch, return, throw, deopt, or loop back
    /// edge, or whatever chain node falls through into a merge.
    pub terminator: NodeId,
    pub preds: SmallVec<[BlockId; 2]>,
    pub succs: SmallVec<[BlockId; 2]>,
    /// Scheduled nodes in execution order. Holds the fixed chain after
    /// discovery; placement rebuilds it with phis and floating nodes.
    pub nodes: Vec<NodeId>,
    /// Loop nesting depth, zero outside any loop.
    pub loop_depth: u32,
    /// Profile-free execution frequency estimate, relative to one run
    /// of the entry block.
    pub frequency: f64,
}

impl Block {
    fn new(leader: NodeId) -> Block {
        Block {
            leader,
            terminator: NodeId::INVALID,
            preds: SmallVec::new(),
            succs: SmallVec::new(),
            nodes: Vec::new(),
            loop_depth: 0,
            frequency: 0.0,
        }
    }
}

// =============================================================================
// Cfg
// =============================================================================

/// Block skeleton of one graph.
#[derive(Debug)]
pub struct Cfg {
    blocks: Vec<Block>,
    /// Block holding each placed node. Fixed nodes are filled in at
    /// build time, phis and floating nodes by placement.
    block_of: SecondaryMap<Node, BlockId>,
    pub entry: BlockId,
    /// Reverse postorder from the entry block.
    pub rpo: Vec<BlockId>,
    /// Postorder numbers, for dominator intersection.
    postorder: SecondaryMap<Block, u32>,
}

impl Cfg {
    /// Discover the blocks of `graph` and link them.
    pub fn build(graph: &Graph) -> Cfg {
        let mut cfg = Cfg {
            blocks: Vec::new(),
            block_of: SecondaryMap::with_capacity(graph.len()),
            entry: BlockId::INVALID,
            rpo: Vec::new(),
            postorder: SecondaryMap::new(),
        };
        cfg.entry = cfg.block_at(graph.start);
        // block_at appends newly seen leaders, so this drains a queue.
        let mut next = 0;
        while next < cfg.blocks.len() {
            cfg.walk_chain(graph, BlockId::new(next as u32));
            next += 1;
        }
        cfg.compute_rpo();
        cfg
    }

    /// Block led by `leader`, created on first sight.
    fn block_at(&mut self, leader: NodeId) -> BlockId {
        let known = self.block_of(leader);
        if known.is_valid() {
            return known;
        }
        let id = BlockId::new(self.blocks.len() as u32);
        self.blocks.push(Block::new(leader));
        self.block_of.set(leader, id);
        id
    }

    /// Follow the control chain from a block's leader to its end,
    /// linking successor blocks.
    fn walk_chain(&mut self, graph: &Graph, block: BlockId) {
        let mut cur = self.blocks[block.as_usize()].leader;
        loop {
            self.block_of.set(cur, block);
            self.blocks[block.as_usize()].nodes.push(cur);
            match graph.op(cur) {
                Op::If => {
                    let mut projs = graph.control_successors(cur);
                    projs.sort_by_key(|&p| match graph.op(p) {
                        Op::Proj { index } => *index,
                        _ => u8::MAX,
                    });
                    for proj in projs {
                        let succ = self.block_at(proj);
                        self.link(block, succ);
                    }
                    break;
                }
                Op::LoopEnd => {
                    let header = match graph.node(cur).inputs.get(1) {
                        Some(h) => h,
                        None => opal_core::graph_bug!("loop end {cur} without a header"),
                    };
                    let succ = self.block_at(header);
                    self.link(block, succ);
                    break;
                }
                Op::Return | Op::Throw | Op::Deopt { .. } => break,
                Op::End => opal_core::graph_bug!("end node on a control chain"),
                _ => {
                    let succs = graph.control_successors(cur);
                    match succs.len() {
                        // A dangling projection; gone once dead code is
                        // swept, a chainless block until then.
                        0 => break,
                        1 if graph.op(succs[0]).is_block_leader() => {
                            let succ = self.block_at(succs[0]);
                            self.link(block, succ);
                            break;
                        }
                        1 => cur = succs[0],
                        n => opal_core::graph_bug!(
                            "chain node {cur} ({}) has {n} control successors",
                            graph.op(cur).mnemonic()
                        ),
                    }
                }
            }
        }
        self.blocks[block.as_usize()].terminator = cur;
    }

    fn link(&mut self, from: BlockId, to: BlockId) {
        let succs = &mut self.blocks[from.as_usize()].succs;
        if !succs.contains(&to) {
            succs.push(to);
        }
        let preds = &mut self.blocks[to.as_usize()].preds;
        if !preds.contains(&from) {
            preds.push(from);
        }
    }

    fn compute_rpo(&mut self) {
        let mut visited = BitSet::with_capacity(self.blocks.len());
        let mut order: Vec<BlockId> = Vec::with_capacity(self.blocks.len());
        let mut stack: Vec<(BlockId, usize)> = vec![(self.entry, 0)];
        visited.insert(self.entry.as_usize());
        while let Some(frame) = stack.last_mut() {
            let (block, child) = *frame;
            let succs = &self.blocks[block.as_usize()].succs;
            if child < succs.len() {
                frame.1 += 1;
                let succ = succs[child];
                if !visited.contains(succ.as_usize()) {
                    visited.insert(succ.as_usize());
                    stack.push((succ, 0));
                }
            } else {
                order.push(block);
                stack.pop();
            }
        }
        for (i, &block) in order.iter().enumerate() {
            self.postorder.set(block, i as u32);
        }
        order.reverse();
        self.rpo = order;
    }

    /// Fill per-block loop depth and the frequency estimate: the entry
    /// runs once, a branch splits its frequency evenly, a merge sums
    /// its forward predecessors, and each loop nesting level multiplies
    /// by ten.
    pub fn annotate(&mut self, dom: &DominatorTree, loops: &LoopTree) {
        for i in 0..self.blocks.len() {
            self.blocks[i].loop_depth = loops.depth_of(BlockId::new(i as u32));
        }
        let mut forward: SecondaryMap<Block, f64> = SecondaryMap::with_capacity(self.blocks.len());
        forward.set(self.entry, 1.0);
        for &block in &self.rpo {
            if block == self.entry {
                continue;
            }
            let mut f = 0.0;
            for &pred in &self.blocks[block.as_usize()].preds {
                if dom.dominates(block, pred) {
                    continue; // back edge
                }
                let share = self.blocks[pred.as_usize()].succs.len().max(1) as f64;
                f += forward[pred] / share;
            }
            forward.set(block, f);
        }
        for i in 0..self.blocks.len() {
            let base = forward[BlockId::new(i as u32)];
            let scale = 10f64.powi(self.blocks[i].loop_depth as i32);
            self.blocks[i].frequency = base * scale;
        }
    }

    #[inline]
    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id.as_usize()]
    }

    #[inline]
    pub fn block_mut(&mut self, id: BlockId) -> &mut Block {
        &mut self.blocks[id.as_usize()]
    }

    /// Block a node was placed in, `INVALID` if it has none yet.
    pub fn block_of(&self, node: NodeId) -> BlockId {
        self.block_of.get(node).copied().unwrap_or(BlockId::INVALID)
    }

    pub fn assign(&mut self, node: NodeId, block: BlockId) {
        self.block_of.set(node, block);
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    fn postorder_of(&self, block: BlockId) -> u32 {
        self.postorder.get(block).copied().unwrap_or(0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (BlockId, &Block)> {
        self.blocks
            .iter()
            .enumerate()
            .map(|(i, b)| (BlockId::new(i as u32), b))
    }
}

// =============================================================================
// Dominators
// =============================================================================

/// Immediate-dominator tree over the block skeleton.
#[derive(Debug)]
pub struct DominatorTree {
    idom: SecondaryMap<Block, BlockId>,
    depth: SecondaryMap<Block, u32>,
}

impl DominatorTree {
    /// Iterative Cooper-Harvey-Kennedy over reverse postorder.
    pub fn build(cfg: &Cfg) -> DominatorTree {
        let n = cfg.len();
        let mut dom = DominatorTree {
            idom: SecondaryMap::with_capacity(n),
            depth: SecondaryMap::with_capacity(n),
        };
        if n == 0 || !cfg.entry.is_valid() {
            return dom;
        }
        for i in 0..n {
            dom.idom.set(BlockId::new(i as u32), BlockId::INVALID);
        }
        dom.idom.set(cfg.entry, cfg.entry);

        let mut changed = true;
        while changed {
            changed = false;
            for &block in &cfg.rpo {
                if block == cfg.entry {
                    continue;
                }
                let preds = &cfg.block(block).preds;
                let mut new_idom = BlockId::INVALID;
                for &pred in preds {
                    if dom.idom[pred].is_valid() {
                        new_idom = pred;
                        break;
                    }
                }
                if !new_idom.is_valid() {
                    continue;
                }
                for &pred in preds {
                    if pred != new_idom && dom.idom[pred].is_valid() {
                        new_idom = dom.intersect(cfg, pred, new_idom);
                    }
                }
                if dom.idom[block] != new_idom {
                    dom.idom.set(block, new_idom);
                    changed = true;
                }
            }
        }

        // A dominator precedes its subtree in reverse postorder, so one
        // pass settles every depth.
        dom.depth.set(cfg.entry, 0);
        for &block in &cfg.rpo {
            if block == cfg.entry {
                continue;
            }
            let idom = dom.idom[block];
            if idom.is_valid() {
                let d = dom.depth[idom] + 1;
                dom.depth.set(block, d);
            }
        }
        dom
    }

    fn intersect(&self, cfg: &Cfg, mut a: BlockId, mut b: BlockId) -> BlockId {
        while a != b {
            while cfg.postorder_of(a) < cfg.postorder_of(b) {
                a = self.idom[a];
                if !a.is_valid() {
                    return b;
                }
            }
            while cfg.postorder_of(b) < cfg.postorder_of(a) {
                b = self.idom[b];
                if !b.is_valid() {
                    return a;
                }
            }
        }
        a
    }

    /// Immediate dominator, none for the entry block.
    pub fn idom(&self, block: BlockId) -> Option<BlockId> {
        let idom = self.idom.get(block).copied().unwrap_or(BlockId::INVALID);
        if idom.is_valid() && idom != block {
            Some(idom)
        } else {
            None
        }
    }

    /// Distance from the entry block along the dominator tree.
    pub fn depth(&self, block: BlockId) -> u32 {
        self.depth.get(block).copied().unwrap_or(0)
    }

    pub fn dominates(&self, a: BlockId, b: BlockId) -> bool {
        let mut cur = b;
        while self.depth(cur) > self.depth(a) {
            cur = self.up(cur);
        }
        cur == a
    }

    /// Deepest block dominating both `a` and `b`.
    pub fn common_dominator(&self, mut a: BlockId, mut b: BlockId) -> BlockId {
        while self.depth(a) > self.depth(b) {
            a = self.up(a);
        }
        while self.depth(b) > self.depth(a) {
            b = self.up(b);
        }
        while a != b {
            a = self.up(a);
            b = self.up(b);
        }
        a
    }

    fn up(&self, block: BlockId) -> BlockId {
        match self.idom(block) {
            Some(i) => i,
            None => opal_core::graph_bug!("dominator walk escaped the entry block"),
        }
    }
}

// =============================================================================
// Loops
// =============================================================================

/// One natural loop: the header plus every block on a path from a back
/// edge source back to it.
#[derive(Debug)]
pub struct LoopInfo {
    pub header: BlockId,
    pub back_edges: SmallVec<[BlockId; 1]>,
    pub blocks: BitSet,
    pub parent: Option<u32>,
    /// Nesting depth, one for an outermost loop.
    pub depth: u32,
}

/// Loop nesting forest, found from back edges (target dominates source).
#[derive(Debug, Default)]
pub struct LoopTree {
    loops: Vec<LoopInfo>,
    depth_of: SecondaryMap<Block, u32>,
}

impl LoopTree {
    pub fn build(cfg: &Cfg, dom: &DominatorTree) -> LoopTree {
        let mut tree = LoopTree {
            loops: Vec::new(),
            depth_of: SecondaryMap::with_capacity(cfg.len()),
        };
        for &block in &cfg.rpo {
            for &succ in &cfg.block(block).succs {
                if dom.dominates(succ, block) {
                    tree.add_back_edge(cfg, succ, block);
                }
            }
        }
        tree.compute_nesting();

        let mut depth_of: SecondaryMap<Block, u32> = SecondaryMap::with_capacity(cfg.len());
        for l in &tree.loops {
            for b in l.blocks.iter() {
                let id = BlockId::new(b as u32);
                if l.depth > depth_of[id] {
                    depth_of.set(id, l.depth);
                }
            }
        }
        tree.depth_of = depth_of;
        tree
    }

    fn add_back_edge(&mut self, cfg: &Cfg, header: BlockId, source: BlockId) {
        let idx = match self.loops.iter().position(|l| l.header == header) {
            Some(i) => i,
            None => {
                let mut blocks = BitSet::with_capacity(cfg.len());
                blocks.insert(header.as_usize());
                self.loops.push(LoopInfo {
                    header,
                    back_edges: SmallVec::new(),
                    blocks,
                    parent: None,
                    depth: 1,
                });
                self.loops.len() - 1
            }
        };
        if !self.loops[idx].back_edges.contains(&source) {
            self.loops[idx].back_edges.push(source);
        }
        // Everything reaching the back edge source without passing the
        // header belongs to the loop.
        let mut work = vec![source];
        while let Some(b) = work.pop() {
            if self.loops[idx].blocks.contains(b.as_usize()) {
                continue;
            }
            self.loops[idx].blocks.insert(b.as_usize());
            for &p in &cfg.block(b).preds {
                work.push(p);
            }
        }
    }

    /// Parent links by smallest enclosing body, then depths along them.
    fn compute_nesting(&mut self) {
        let n = self.loops.len();
        for i in 0..n {
            let header = self.loops[i].header;
            let mut parent: Option<u32> = None;
            let mut best = usize::MAX;
            for j in 0..n {
                if i != j && self.loops[j].blocks.contains(header.as_usize()) {
                    let size = self.loops[j].blocks.count();
                    if size < best {
                        best = size;
                        parent = Some(j as u32);
                    }
                }
            }
            self.loops[i].parent = parent;
        }
        for i in 0..n {
            let mut depth = 1;
            let mut cur = self.loops[i].parent;
            while let Some(p) = cur {
                depth += 1;
                cur = self.loops[p as usize].parent;
            }
            self.loops[i].depth = depth;
        }
    }

    pub fn loops(&self) -> &[LoopInfo] {
        &self.loops
    }

    /// Loop nesting depth of a block, zero outside any loop.
    pub fn depth_of(&self, block: BlockId) -> u32 {
        self.depth_of.get(block).copied().unwrap_or(0)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{CmpOp, GraphBuilder, ValKind};

    #[test]
    fn test_straightline_is_one_block() {
        let mut b = GraphBuilder::new();
        let p = b.param(0, ValKind::I32);
        b.ret(Some(p));
        let g = b.finish();

        let cfg = Cfg::build(&g);
        assert_eq!(cfg.len(), 1);
        assert_eq!(cfg.rpo, vec![cfg.entry]);
        let entry = cfg.block(cfg.entry);
        assert_eq!(entry.leader, g.start);
        assert!(matches!(g.op(entry.terminator), Op::Return));
        assert!(entry.succs.is_empty());
        assert_eq!(cfg.block_of(entry.terminator), cfg.entry);
    }

    #[test]
    fn test_diamond_blocks_dominators_and_frequency() {
        let mut b = GraphBuilder::new();
        let p = b.param(0, ValKind::I32);
        let zero = b.const_i32(0);
        let c = b.int_cmp(CmpOp::Lt, p, zero);
        let mem = b.tail().memory;
        let (t, f) = b.branch(c);
        b.seek(t, mem);
        let t_exit = b.tail();
        b.seek(f, mem);
        let f_exit = b.tail();
        let region = b.merge(&[t_exit, f_exit]);
        b.ret(Some(p));
        let g = b.finish();

        let mut cfg = Cfg::build(&g);
        assert_eq!(cfg.len(), 4);
        let b0 = cfg.entry;
        let b1 = cfg.block_of(t);
        let b2 = cfg.block_of(f);
        let b3 = cfg.block_of(region);
        assert_eq!(cfg.block(b0).succs.as_slice(), &[b1, b2]);
        assert_eq!(cfg.block(b3).preds.as_slice(), &[b1, b2]);
        assert!(matches!(g.op(cfg.block(b0).terminator), Op::If));
        assert!(matches!(g.op(cfg.block(b3).terminator), Op::Return));

        let dom = DominatorTree::build(&cfg);
        assert_eq!(dom.idom(b0), None);
        assert_eq!(dom.idom(b1), Some(b0));
        assert_eq!(dom.idom(b2), Some(b0));
        assert_eq!(dom.idom(b3), Some(b0));
        assert!(dom.dominates(b0, b3));
        assert!(!dom.dominates(b1, b3));
        assert_eq!(dom.common_dominator(b1, b2), b0);
        assert_eq!(dom.depth(b0), 0);
        assert_eq!(dom.depth(b3), 1);

        let loops = LoopTree::build(&cfg, &dom);
        assert!(loops.loops().is_empty());

        cfg.annotate(&dom, &loops);
        assert_eq!(cfg.block(b0).frequency, 1.0);
        assert_eq!(cfg.block(b1).frequency, 0.5);
        assert_eq!(cfg.block(b2).frequency, 0.5);
        assert_eq!(cfg.block(b3).frequency, 1.0);
    }

    #[test]
    fn test_nested_loops_depth_and_frequency() {
        let mut b = GraphBuilder::new();
        let n = b.param(0, ValKind::I32);
        let zero = b.const_i32(0);
        let one = b.const_i32(1);

        let outer = b.loop_begin();
        let i = b.loop_phi(outer, ValKind::I32, zero);
        let c_outer = b.int_cmp(CmpOp::Lt, i, n);
        let outer_mem = b.tail().memory;
        let (ob, oexit) = b.branch(c_outer);

        b.seek(ob, outer_mem);
        let inner = b.loop_begin();
        let j = b.loop_phi(inner, ValKind::I32, zero);
        let c_inner = b.int_cmp(CmpOp::Lt, j, n);
        let inner_mem = b.tail().memory;
        let (ib, iexit) = b.branch(c_inner);

        b.seek(ib, inner_mem);
        let j2 = b.int_add(j, one);
        b.loop_end(inner);
        b.seal_loop_phi(j, j2);

        b.seek(iexit, inner_mem);
        let i2 = b.int_add(i, one);
        b.loop_end(outer);
        b.seal_loop_phi(i, i2);

        b.seek(oexit, outer_mem);
        b.ret(Some(i));
        let g = b.finish();

        let mut cfg = Cfg::build(&g);
        assert_eq!(cfg.len(), 7);
        let entry = cfg.entry;
        let outer_hdr = cfg.block_of(outer);
        let inner_hdr = cfg.block_of(inner);
        let inner_body = cfg.block_of(ib);
        let latch = cfg.block_of(iexit);
        let exit = cfg.block_of(oexit);

        let dom = DominatorTree::build(&cfg);
        assert!(dom.dominates(outer_hdr, latch));
        assert!(dom.dominates(inner_hdr, inner_body));
        assert_eq!(dom.idom(inner_hdr), Some(cfg.block_of(ob)));

        let loops = LoopTree::build(&cfg, &dom);
        assert_eq!(loops.loops().len(), 2);
        let outer_loop = loops
            .loops()
            .iter()
            .find(|l| l.header == outer_hdr)
            .unwrap();
        let inner_loop = loops
            .loops()
            .iter()
            .find(|l| l.header == inner_hdr)
            .unwrap();
        assert_eq!(outer_loop.depth, 1);
        assert_eq!(inner_loop.depth, 2);
        assert!(outer_loop.blocks.contains(inner_hdr.as_usize()));
        assert!(!outer_loop.blocks.contains(exit.as_usize()));
        assert_eq!(loops.depth_of(entry), 0);
        assert_eq!(loops.depth_of(outer_hdr), 1);
        assert_eq!(loops.depth_of(inner_body), 2);
        assert_eq!(loops.depth_of(latch), 1);
        assert_eq!(loops.depth_of(exit), 0);

        cfg.annotate(&dom, &loops);
        assert_eq!(cfg.block(entry).frequency, 1.0);
        assert_eq!(cfg.block(outer_hdr).frequency, 10.0);
        assert_eq!(cfg.block(inner_hdr).frequency, 50.0);
        assert_eq!(cfg.block(inner_body).frequency, 25.0);
        assert_eq!(cfg.block(latch).frequency, 2.5);
        assert_eq!(cfg.block(exit).frequency, 0.5);
    }

    #[test]
    fn test_dangling_projection_gets_its_own_block() {
        let mut b = GraphBuilder::new();
        let p = b.param(0, ValKind::I32);
        let zero = b.const_i32(0);
        let c = b.int_cmp(CmpOp::Ne, p, zero);
        let mem = b.tail().memory;
        let (t, f) = b.branch(c);
        b.seek(t, mem);
        b.ret(Some(p));
        let g = b.finish();

        // The false arm was never continued; its block is just the
        // projection.
        let cfg = Cfg::build(&g);
        assert_eq!(cfg.len(), 3);
        let dead = cfg.block_of(f);
        assert!(dead.is_valid());
        assert_eq!(cfg.block(dead).nodes, vec![f]);
        assert!(cfg.block(dead).succs.is_empty());
        assert_eq!(cfg.block_of(t), cfg.block(cfg.entry).succs[0]);
    }
}
