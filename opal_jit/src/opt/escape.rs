//! Partial escape analysis.
//!
//! Allocations whose contents never become observable are deleted outright;
//! the ones that do escape have their initialization replayed as late as
//! possible, immediately before the first point on each path that needs a
//! real object. The
//! analysis walks the control flow in reverse postorder carrying a per-path
//! view of every tracked allocation:
//!
//! * `Virtual`: the allocation has not happened yet. Slot contents are
//!   tracked symbolically, so loads fold to the stored value and stores
//!   just update the view.
//! * `Materialized`: the allocation is real from this point on. Memory is
//!   authoritative and every access stays as written.
//!
//! A merge where the same allocation arrives virtual on one path and real
//! on another cannot be expressed without duplicating the merge, so the
//! object is pinned as real everywhere and the analysis restarts. The same
//! happens when a loop body changes a virtual object between iterations.
//! Every restart pins at least one more allocation, which bounds the number
//! of attempts.
//!
//! Graph rewrites are collected as effects during the walk and applied only
//! once an attempt converges; phi and constant nodes created eagerly at
//! merges are discarded when an attempt is abandoned.

use std::mem;

use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::{smallvec, SmallVec};
use tracing::debug;

use opal_core::{CancelToken, Result};

use crate::ir::{EdgeClass, FieldId, Graph, NodeId, Op, Stamp, StageSet, ValKind};

use super::canonicalize::canonicalize_from;
use super::{CompileConfig, Phase, PhaseContext};

// =============================================================================
// Phase
// =============================================================================

/// Removes or delays heap allocations that do not escape.
#[derive(Debug, Default)]
pub struct PartialEscape;

impl Phase for PartialEscape {
    fn name(&self) -> &'static str {
        "escape"
    }

    fn requires(&self) -> StageSet {
        StageSet::CANONICAL
    }

    fn produces(&self) -> StageSet {
        StageSet::ESCAPE_ANALYZED
    }

    fn run(&mut self, graph: &mut Graph, ctx: &mut PhaseContext<'_>) -> Result<()> {
        let candidates = collect_candidates(graph, ctx.config);
        if candidates.is_empty() {
            graph.state.mark(StageSet::ESCAPE_ANALYZED);
            return Ok(());
        }
        let cfg = Cfg::build(graph);
        let budget = ctx.config.escape_loop_iterations as usize + candidates.len();
        let mut forced: FxHashSet<NodeId> = FxHashSet::default();
        let mut attempts = 0usize;
        let (effects, created) = loop {
            ctx.cancel.check()?;
            attempts += 1;
            let tracked: FxHashSet<NodeId> = candidates
                .iter()
                .copied()
                .filter(|a| !forced.contains(a))
                .collect();
            let pass = Pass::new(graph, &cfg, ctx.cancel, tracked);
            match pass.run()? {
                PassOutcome::Stable { effects, created } => break (effects, created),
                PassOutcome::Restart(newly) => {
                    if attempts > budget {
                        // Safety valve: stop virtualizing altogether. The
                        // next attempt tracks nothing and must converge.
                        forced.extend(candidates.iter().copied());
                    } else {
                        forced.extend(newly);
                    }
                }
            }
        };
        let touched = apply_effects(graph, ctx, effects, created);
        graph.state.mark(StageSet::ESCAPE_ANALYZED);
        canonicalize_from(graph, ctx, &touched)?;
        debug!(
            attempts,
            removed = ctx.stats.allocs_virtualized,
            materialized = ctx.stats.allocs_materialized,
            "escape analysis converged"
        );
        Ok(())
    }
}

// =============================================================================
// Candidates
// =============================================================================

/// Allocations every use of which the analysis fully understands. Arrays
/// qualify only with a small constant length, so the per-object state stays
/// bounded.
fn collect_candidates(graph: &Graph, config: &CompileConfig) -> FxHashSet<NodeId> {
    let mut out = FxHashSet::default();
    for (id, node) in graph.iter_live() {
        match node.op {
            Op::New { .. } | Op::NewBox { .. } => {}
            Op::NewArray { .. } => match array_const_len(graph, id) {
                Some(len) if len <= config.escape_array_limit as usize => {}
                _ => continue,
            },
            _ => continue,
        }
        if graph.uses(id).iter().all(|&u| use_is_tracked(graph, id, u)) {
            out.insert(id);
        }
    }
    out
}

/// Whether one usage of `alloc` is something the transfer function models.
/// Everything else, phi operands and reference comparisons included,
/// counts as an escape up front and disqualifies the allocation.
fn use_is_tracked(graph: &Graph, alloc: NodeId, user: NodeId) -> bool {
    let node = graph.node(user);
    for i in 0..node.inputs.len() {
        if node.inputs.get(i) != Some(alloc) {
            continue;
        }
        let ok = match node.op.input_class(i) {
            // Chain plumbing; splicing the allocation out repairs these.
            EdgeClass::Control | EdgeClass::Memory => true,
            EdgeClass::Value => match (node.op, i) {
                (Op::LoadField { .. }, 1)
                | (Op::LoadIndex { .. }, 1)
                | (Op::Unbox { .. }, 1)
                | (Op::StoreField { .. }, 1 | 2)
                | (Op::StoreIndex { .. }, 1 | 3)
                | (Op::Return, 1)
                | (Op::Throw, 1) => true,
                (Op::Call { .. }, n) if n >= 2 => true,
                _ => false,
            },
        };
        if !ok {
            return false;
        }
    }
    true
}

// =============================================================================
// Control flow skeleton
// =============================================================================

/// A leader followed by its chain, up to and including the terminator.
struct Block {
    nodes: Vec<NodeId>,
    succs: SmallVec<[u32; 2]>,
}

/// Block partition of the fixed-node chain. Forward successors only: the
/// back edge from a `LoopEnd` to its header is left out, so the block graph
/// is acyclic and reverse postorder visits every predecessor of a merge
/// before the merge itself. Loop back-edge states are checked against the
/// header assumption after the walk.
struct Cfg {
    blocks: Vec<Block>,
    block_of: FxHashMap<NodeId, u32>,
    rpo: Vec<u32>,
}

impl Cfg {
    fn build(graph: &Graph) -> Cfg {
        let mut blocks: Vec<Block> = Vec::new();
        let mut succ_leaders: Vec<SmallVec<[NodeId; 2]>> = Vec::new();
        let mut leader_block: FxHashMap<NodeId, u32> = FxHashMap::default();
        let mut block_of: FxHashMap<NodeId, u32> = FxHashMap::default();

        let mut work: Vec<NodeId> = vec![graph.start];
        while let Some(leader) = work.pop() {
            if leader_block.contains_key(&leader) {
                continue;
            }
            let bi = blocks.len() as u32;
            leader_block.insert(leader, bi);
            let mut nodes = Vec::new();
            let mut succs: SmallVec<[NodeId; 2]> = SmallVec::new();
            let mut cur = leader;
            loop {
                nodes.push(cur);
                block_of.insert(cur, bi);
                if graph.op(cur).is_block_terminator() {
                    // Only a branch continues forward; exits stop and a
                    // LoopEnd feeds a header that is reached on entry.
                    if matches!(graph.op(cur), Op::If) {
                        for s in graph.control_successors(cur) {
                            succs.push(s);
                            work.push(s);
                        }
                    }
                    break;
                }
                let next = single_successor(graph, cur);
                if graph.op(next).is_block_leader() {
                    succs.push(next);
                    work.push(next);
                    break;
                }
                cur = next;
            }
            blocks.push(Block {
                nodes,
                succs: SmallVec::new(),
            });
            succ_leaders.push(succs);
        }

        for (bi, leaders) in succ_leaders.into_iter().enumerate() {
            for leader in leaders {
                blocks[bi].succs.push(leader_block[&leader]);
            }
        }

        let rpo = reverse_postorder(&blocks);
        Cfg {
            blocks,
            block_of,
            rpo,
        }
    }
}

fn single_successor(graph: &Graph, node: NodeId) -> NodeId {
    let succs = graph.control_successors(node);
    opal_core::guarantee!(
        succs.len() == 1,
        "{node} has {} control successors mid-block",
        succs.len()
    );
    succs[0]
}

fn reverse_postorder(blocks: &[Block]) -> Vec<u32> {
    let mut seen = vec![false; blocks.len()];
    let mut post: Vec<u32> = Vec::with_capacity(blocks.len());
    let mut stack: Vec<(u32, usize)> = vec![(0, 0)];
    seen[0] = true;
    while let Some(top) = stack.last_mut() {
        let b = top.0;
        let i = top.1;
        top.1 += 1;
        let succs = &blocks[b as usize].succs;
        if i < succs.len() {
            let s = succs[i];
            if !seen[s as usize] {
                seen[s as usize] = true;
                stack.push((s, 0));
            }
        } else {
            post.push(b);
            stack.pop();
        }
    }
    post.reverse();
    post
}

// =============================================================================
// Analysis state
// =============================================================================

/// Where one tracked allocation stands on the current path.
#[derive(Clone, PartialEq)]
enum ObjState {
    /// Not allocated yet. One entry per field or element; boxes have a
    /// single slot. `NodeId::INVALID` marks a slot still holding the
    /// default value of its kind.
    Virtual(SmallVec<[NodeId; 4]>),
    /// Allocated for real somewhere on this path.
    Materialized,
}

/// Path state, keyed by allocation node.
type State = FxHashMap<NodeId, ObjState>;

/// Deferred graph rewrite. Recorded in chain order during the walk and
/// applied only once an attempt converges.
enum Effect {
    /// Replace a load or unbox with the value it must produce.
    Forward { node: NodeId, with: NodeId },
    /// Store into a still-virtual object; the slot view absorbed it.
    DeleteStore(NodeId),
    /// Re-create the tracked slot contents right before `before`.
    Materialize {
        alloc: NodeId,
        before: NodeId,
        slots: Vec<NodeId>,
    },
    /// The allocation never became observable on any path.
    DeleteAlloc(NodeId),
}

enum PassOutcome {
    Stable {
        effects: Vec<Effect>,
        created: Vec<NodeId>,
    },
    /// These allocations must stay real; run again without tracking them.
    Restart(Vec<NodeId>),
}

// =============================================================================
// One analysis attempt
// =============================================================================

struct Pass<'a> {
    graph: &'a mut Graph,
    cfg: &'a Cfg,
    cancel: &'a CancelToken,
    /// Allocations still eligible for virtualization this attempt.
    tracked: FxHashSet<NodeId>,
    /// Exit state per block, filled in reverse postorder.
    exits: Vec<Option<State>>,
    /// Loop header entry states, compared against back edges afterwards.
    assumptions: Vec<(u32, State)>,
    effects: Vec<Effect>,
    /// Nodes created eagerly for merges; killed in reverse on restart.
    created: Vec<NodeId>,
    materialized: FxHashSet<NodeId>,
    unstable: Vec<NodeId>,
}

impl<'a> Pass<'a> {
    fn new(
        graph: &'a mut Graph,
        cfg: &'a Cfg,
        cancel: &'a CancelToken,
        tracked: FxHashSet<NodeId>,
    ) -> Pass<'a> {
        let blocks = cfg.blocks.len();
        Pass {
            graph,
            cfg,
            cancel,
            tracked,
            exits: vec![None; blocks],
            assumptions: Vec::new(),
            effects: Vec::new(),
            created: Vec::new(),
            materialized: FxHashSet::default(),
            unstable: Vec::new(),
        }
    }

    fn run(mut self) -> Result<PassOutcome> {
        for idx in 0..self.cfg.rpo.len() {
            self.cancel.check()?;
            let bi = self.cfg.rpo[idx];
            let mut state = self.entry_state(bi);
            for i in 0..self.cfg.blocks[bi as usize].nodes.len() {
                let n = self.cfg.blocks[bi as usize].nodes[i];
                self.transfer(n, &mut state);
            }
            self.exits[bi as usize] = Some(state);
        }
        self.check_loops();

        if !self.unstable.is_empty() {
            // Unwind this attempt's merge nodes; nothing else in the graph
            // refers to them, so reverse creation order is safe.
            for &n in self.created.iter().rev() {
                self.graph.kill(n);
            }
            let mut newly = self.unstable;
            newly.sort_unstable();
            newly.dedup();
            return Ok(PassOutcome::Restart(newly));
        }

        // Whatever stayed virtual on every path disappears entirely.
        let mut gone: Vec<NodeId> = self
            .tracked
            .iter()
            .copied()
            .filter(|a| !self.materialized.contains(a))
            .collect();
        gone.sort_unstable();
        for a in gone {
            self.effects.push(Effect::DeleteAlloc(a));
        }
        Ok(PassOutcome::Stable {
            effects: self.effects,
            created: self.created,
        })
    }

    fn input(&self, node: NodeId, index: usize) -> NodeId {
        match self.graph.node(node).inputs.get(index) {
            Some(id) => id,
            None => opal_core::graph_bug!("{node} is missing input {index}"),
        }
    }

    fn exit_of(&self, node: NodeId) -> &State {
        let Some(&bi) = self.cfg.block_of.get(&node) else {
            opal_core::graph_bug!("{node} is not on the control chain");
        };
        match self.exits[bi as usize].as_ref() {
            Some(state) => state,
            None => opal_core::graph_bug!("block of {node} visited before its predecessors"),
        }
    }

    fn entry_state(&mut self, bi: u32) -> State {
        let leader = self.cfg.blocks[bi as usize].nodes[0];
        match *self.graph.op(leader) {
            Op::Start => State::default(),
            Op::Proj { .. } => {
                let branch = self.input(leader, 0);
                self.exit_of(branch).clone()
            }
            Op::Region => self.merge_states(leader),
            Op::LoopBegin => {
                // Optimistic: assume the body leaves every view unchanged.
                // check_loops verifies this against each back edge.
                let entry = self.input(leader, 0);
                let state = self.exit_of(entry).clone();
                self.assumptions.push((bi, state.clone()));
                state
            }
            _ => opal_core::graph_bug!("{leader} cannot lead a block"),
        }
    }

    /// Join the predecessor states of a region. Objects virtual on every
    /// path stay virtual, with phis for slots whose values differ; objects
    /// real on every path stay real. A mix is unrepresentable and forces a
    /// restart.
    fn merge_states(&mut self, region: NodeId) -> State {
        let pred_count = self.graph.node(region).inputs.len();
        let preds: Vec<NodeId> = (0..pred_count).map(|i| self.input(region, i)).collect();

        let mut keys: Vec<NodeId> = self.exit_of(preds[0]).keys().copied().collect();
        keys.sort_unstable();
        keys.retain(|a| preds[1..].iter().all(|&p| self.exit_of(p).contains_key(a)));

        let mut out = State::default();
        for alloc in keys {
            let per_pred: Vec<ObjState> = preds
                .iter()
                .map(|&p| self.exit_of(p)[&alloc].clone())
                .collect();
            let mut views: Vec<&[NodeId]> = Vec::with_capacity(per_pred.len());
            let mut real = 0usize;
            for s in &per_pred {
                match s {
                    ObjState::Virtual(slots) => views.push(slots),
                    ObjState::Materialized => real += 1,
                }
            }
            if real == per_pred.len() {
                out.insert(alloc, ObjState::Materialized);
                continue;
            }
            if real > 0 {
                self.unstable.push(alloc);
                out.insert(alloc, ObjState::Materialized);
                continue;
            }

            let slot_count = views[0].len();
            opal_core::guarantee!(
                views.iter().all(|v| v.len() == slot_count),
                "slot views of {alloc} diverge at {region}"
            );
            let mut merged: SmallVec<[NodeId; 4]> = SmallVec::with_capacity(slot_count);
            for s in 0..slot_count {
                let first = views[0][s];
                if views[1..].iter().all(|v| v[s] == first) {
                    merged.push(first);
                    continue;
                }
                let vals: Vec<NodeId> = views.iter().map(|v| v[s]).collect();
                let Some(&known) = vals.iter().find(|v| v.is_valid()) else {
                    opal_core::graph_bug!("default slots of {alloc} compare unequal");
                };
                let kind = stamp_kind(self.graph.stamp(known));
                let mut operands: Vec<NodeId> = Vec::with_capacity(vals.len() + 1);
                operands.push(region);
                for v in vals {
                    if v.is_valid() {
                        operands.push(v);
                    } else {
                        let c = self.graph.add(default_value_op(kind), &[]);
                        self.created.push(c);
                        operands.push(c);
                    }
                }
                let phi = self.graph.add(Op::Phi { kind }, &operands);
                self.created.push(phi);
                merged.push(phi);
            }
            out.insert(alloc, ObjState::Virtual(merged));
        }
        out
    }

    fn transfer(&mut self, n: NodeId, state: &mut State) {
        match *self.graph.op(n) {
            Op::New { fields, .. } if self.tracked.contains(&n) => {
                state.insert(
                    n,
                    ObjState::Virtual(smallvec![NodeId::INVALID; fields as usize]),
                );
            }
            Op::NewArray { .. } if self.tracked.contains(&n) => {
                let len = match array_const_len(self.graph, n) {
                    Some(len) => len,
                    None => opal_core::graph_bug!("{n} tracked without a constant length"),
                };
                state.insert(n, ObjState::Virtual(smallvec![NodeId::INVALID; len]));
            }
            Op::NewBox { .. } if self.tracked.contains(&n) => {
                let value = self.input(n, 1);
                state.insert(n, ObjState::Virtual(smallvec![value]));
            }

            Op::LoadField { field, kind } => {
                let object = self.input(n, 1);
                if !is_virtual(state, object) {
                    return;
                }
                let idx = field.0 as usize;
                if !slot_in_range(state, object, idx) {
                    // Out-of-model field index; hand the object back to
                    // memory and let the load run for real.
                    self.materialize_at(object, n, state);
                    return;
                }
                let value = self.slot_value(state, object, idx, kind);
                self.forward(n, value, state);
            }
            Op::LoadIndex { elem } => {
                let array = self.input(n, 1);
                if !is_virtual(state, array) {
                    return;
                }
                match self.const_index(n, 2) {
                    Some(idx) if slot_in_range(state, array, idx) => {
                        let value = self.slot_value(state, array, idx, elem);
                        self.forward(n, value, state);
                    }
                    // Unknown or out-of-bounds index: the real access
                    // keeps its trap semantics.
                    _ => self.materialize_at(array, n, state),
                }
            }
            Op::Unbox { kind } => {
                let boxed = self.input(n, 1);
                if !is_virtual(state, boxed) {
                    return;
                }
                let same_kind =
                    matches!(*self.graph.op(boxed), Op::NewBox { kind: k, .. } if k == kind);
                if !same_kind {
                    self.materialize_at(boxed, n, state);
                    return;
                }
                let value = self.slot_value(state, boxed, 0, kind);
                self.forward(n, value, state);
            }

            Op::StoreField { field } => {
                let object = self.input(n, 1);
                let value = self.input(n, 2);
                if is_virtual(state, object) {
                    let idx = field.0 as usize;
                    if slot_in_range(state, object, idx) {
                        set_slot(state, object, idx, value);
                        self.effects.push(Effect::DeleteStore(n));
                        return;
                    }
                    self.materialize_at(object, n, state);
                }
                // Storing a virtual object into real memory publishes it.
                if is_virtual(state, value) {
                    self.materialize_at(value, n, state);
                }
            }
            Op::StoreIndex { .. } => {
                let array = self.input(n, 1);
                let value = self.input(n, 3);
                if is_virtual(state, array) {
                    match self.const_index(n, 2) {
                        Some(idx) if slot_in_range(state, array, idx) => {
                            set_slot(state, array, idx, value);
                            self.effects.push(Effect::DeleteStore(n));
                            return;
                        }
                        _ => self.materialize_at(array, n, state),
                    }
                }
                if is_virtual(state, value) {
                    self.materialize_at(value, n, state);
                }
            }

            Op::Return | Op::Throw => {
                if let Some(value) = self.graph.node(n).inputs.get(1) {
                    if is_virtual(state, value) {
                        self.materialize_at(value, n, state);
                    }
                }
            }
            Op::Call { .. } => {
                // Arguments escape into the callee. Virtual objects not
                // passed along are unreachable from it and keep their view.
                let argc = self.graph.node(n).inputs.len();
                for i in 2..argc {
                    let arg = self.input(n, i);
                    if is_virtual(state, arg) {
                        self.materialize_at(arg, n, state);
                    }
                }
            }

            _ => {}
        }
    }

    /// Record the replacement for a load whose value is already known.
    fn forward(&mut self, node: NodeId, value: NodeId, state: &mut State) {
        // Handing out a still-virtual object as a plain value would let it
        // leak past the analysis; allocate it first.
        if is_virtual(state, value) {
            self.materialize_at(value, node, state);
        }
        self.effects.push(Effect::Forward { node, with: value });
    }

    /// Current value of a virtual slot. The default constant is minted on
    /// first read and written back, so every later reader and merge sees
    /// the same node.
    fn slot_value(&mut self, state: &mut State, object: NodeId, idx: usize, kind: ValKind) -> NodeId {
        let current = match state.get(&object) {
            Some(ObjState::Virtual(slots)) => slots[idx],
            _ => opal_core::graph_bug!("{object} is not virtual"),
        };
        if current.is_valid() {
            return current;
        }
        let c = self.graph.add(default_value_op(kind), &[]);
        self.created.push(c);
        set_slot(state, object, idx, c);
        c
    }

    /// Flip `alloc` to materialized right before `before`. Virtual objects
    /// referenced by its slots have to exist first, so they materialize at
    /// the same point.
    fn materialize_at(&mut self, alloc: NodeId, before: NodeId, state: &mut State) {
        let slots = match state.get(&alloc) {
            Some(ObjState::Virtual(slots)) => slots.clone(),
            _ => return,
        };
        // Marking first breaks self-referential slot cycles.
        state.insert(alloc, ObjState::Materialized);
        self.materialized.insert(alloc);
        for &v in &slots {
            if v.is_valid() {
                self.materialize_at(v, before, state);
            }
        }
        self.effects.push(Effect::Materialize {
            alloc,
            before,
            slots: slots.to_vec(),
        });
    }

    /// Index input as a non-negative constant, if its stamp pins one.
    fn const_index(&self, node: NodeId, slot: usize) -> Option<usize> {
        let idx = self.graph.node(node).inputs.get(slot)?;
        let v = self.graph.stamp(idx).as_int()?.as_constant()?;
        usize::try_from(v).ok()
    }

    /// Compare every loop header assumption against the state reaching its
    /// back edges. Objects whose view changed across an iteration cannot
    /// stay virtual.
    fn check_loops(&mut self) {
        let assumptions = mem::take(&mut self.assumptions);
        for (bi, assumed) in assumptions {
            let header = self.cfg.blocks[bi as usize].nodes[0];
            let back_edges = self.graph.node(header).inputs.len();
            let mut keys: Vec<NodeId> = assumed.keys().copied().collect();
            keys.sort_unstable();
            for i in 1..back_edges {
                let le = self.input(header, i);
                let exit = self.exit_of(le).clone();
                for &alloc in &keys {
                    if exit.get(&alloc) != assumed.get(&alloc) {
                        self.unstable.push(alloc);
                    }
                }
            }
        }
    }
}

fn is_virtual(state: &State, id: NodeId) -> bool {
    matches!(state.get(&id), Some(ObjState::Virtual(_)))
}

fn slot_in_range(state: &State, id: NodeId, idx: usize) -> bool {
    match state.get(&id) {
        Some(ObjState::Virtual(slots)) => idx < slots.len(),
        _ => false,
    }
}

fn set_slot(state: &mut State, object: NodeId, idx: usize, value: NodeId) {
    if let Some(ObjState::Virtual(slots)) = state.get_mut(&object) {
        slots[idx] = value;
    }
}

// =============================================================================
// Effect application
// =============================================================================

/// Rewrite the graph per the converged effect list. Returns the nodes worth
/// re-canonicalizing: replaced usages, spliced neighbors and everything the
/// attempt created.
fn apply_effects(
    graph: &mut Graph,
    ctx: &mut PhaseContext<'_>,
    effects: Vec<Effect>,
    created: Vec<NodeId>,
) -> Vec<NodeId> {
    // Forwarded loads may themselves appear in later effects as stored
    // values; the alias map chases them to the surviving node.
    let mut alias: FxHashMap<NodeId, NodeId> = FxHashMap::default();
    let mut touched: Vec<NodeId> = created;
    for effect in effects {
        match effect {
            Effect::Forward { node, with } => {
                let with = resolve(&alias, with);
                touched.extend(graph.uses(node).iter().copied());
                touched.push(with);
                graph.replace_fixed_with_value(node, with);
                alias.insert(node, with);
                ctx.stats.loads_forwarded += 1;
            }
            Effect::DeleteStore(node) => {
                push_neighbors(graph, node, &mut touched);
                graph.remove_fixed(node);
                graph.kill(node);
            }
            Effect::Materialize {
                alloc,
                before,
                slots,
            } => {
                debug!(%alloc, at = %before, op = graph.op(before).mnemonic(), "materializing");
                materialize(graph, &alias, alloc, before, &slots, &mut touched);
                ctx.stats.allocs_materialized += 1;
            }
            Effect::DeleteAlloc(node) => {
                push_neighbors(graph, node, &mut touched);
                graph.remove_fixed(node);
                graph.kill(node);
                ctx.stats.allocs_virtualized += 1;
            }
        }
    }
    touched
}

fn resolve(alias: &FxHashMap<NodeId, NodeId>, mut id: NodeId) -> NodeId {
    while let Some(&next) = alias.get(&id) {
        id = next;
    }
    id
}

fn push_neighbors(graph: &Graph, node: NodeId, touched: &mut Vec<NodeId>) {
    touched.extend(graph.node(node).inputs.iter());
    touched.extend(graph.uses(node).iter().copied());
}

/// The allocation node itself stays where it is; it dominates every use.
/// Materializing means re-playing the tracked slot values into memory right
/// before `before`, then threading `before` behind the new stores.
fn materialize(
    graph: &mut Graph,
    alias: &FxHashMap<NodeId, NodeId>,
    alloc: NodeId,
    before: NodeId,
    slots: &[NodeId],
    touched: &mut Vec<NodeId>,
) {
    let mut ctrl = match graph.control_pred(before) {
        Some(p) => p,
        None => opal_core::graph_bug!("{before} has no control predecessor"),
    };
    let memory_slot = graph.op(before).memory_input();
    let mut memory = match memory_slot {
        Some(slot) => match graph.node(before).inputs.get(slot) {
            Some(m) => m,
            None => opal_core::graph_bug!("{before} is missing its memory input"),
        },
        None => memory_state_at(graph, before),
    };

    let mut synthesized = false;
    for (i, &raw) in slots.iter().enumerate() {
        if !raw.is_valid() {
            // Fresh memory already holds the default value.
            continue;
        }
        let value = resolve(alias, raw);
        let store = match *graph.op(alloc) {
            Op::New { .. } => graph.add(
                Op::StoreField {
                    field: FieldId(i as u32),
                },
                &[ctrl, alloc, value, memory],
            ),
            Op::NewArray { elem, .. } => {
                let index = graph.add(Op::ConstI32(i as i32), &[]);
                touched.push(index);
                graph.add(
                    Op::StoreIndex { elem },
                    &[ctrl, alloc, index, value, memory],
                )
            }
            // A box carries its value as a direct input; nothing to store.
            Op::NewBox { .. } => continue,
            _ => opal_core::graph_bug!("{alloc} is not an allocation"),
        };
        touched.push(store);
        ctrl = store;
        memory = store;
        synthesized = true;
    }
    if synthesized {
        graph.replace_input(before, 0, ctrl);
        if let Some(slot) = memory_slot {
            graph.replace_input(before, slot, memory);
        }
    }
    touched.push(alloc);
    touched.push(before);
}

/// Memory state reaching `point`, for splicing stores ahead of a node that
/// carries no memory input of its own.
fn memory_state_at(graph: &Graph, point: NodeId) -> NodeId {
    let mut cur = match graph.control_pred(point) {
        Some(p) => p,
        None => opal_core::graph_bug!("{point} has no control predecessor"),
    };
    loop {
        let op = *graph.op(cur);
        if op.kill_location().is_some() {
            // Stores, allocations and calls all define the state here.
            return cur;
        }
        match op {
            Op::Start => return cur,
            Op::Region | Op::LoopBegin => {
                if let Some(phi) = memory_phi_of(graph, cur) {
                    return phi;
                }
                // No phi: every predecessor carries the same state.
                cur = match graph.node(cur).inputs.get(0) {
                    Some(p) => p,
                    None => opal_core::graph_bug!("{cur} has no predecessors"),
                };
            }
            Op::Proj { .. } => {
                let branch = match graph.node(cur).inputs.get(0) {
                    Some(b) => b,
                    None => opal_core::graph_bug!("{cur} is detached"),
                };
                cur = match graph.control_pred(branch) {
                    Some(p) => p,
                    None => opal_core::graph_bug!("{branch} is detached"),
                };
            }
            _ => {
                cur = match graph.control_pred(cur) {
                    Some(p) => p,
                    None => opal_core::graph_bug!("{cur} is detached"),
                };
            }
        }
    }
}

fn memory_phi_of(graph: &Graph, merge: NodeId) -> Option<NodeId> {
    graph.uses(merge).iter().copied().find(|&u| {
        matches!(graph.op(u), Op::MemoryPhi) && graph.node(u).inputs.get(0) == Some(merge)
    })
}

// =============================================================================
// Small helpers
// =============================================================================

/// Constant length of a `NewArray`, if its stamp pins one.
fn array_const_len(graph: &Graph, alloc: NodeId) -> Option<usize> {
    let length = graph.node(alloc).inputs.get(1)?;
    let v = graph.stamp(length).as_int()?.as_constant()?;
    usize::try_from(v).ok()
}

fn default_value_op(kind: ValKind) -> Op {
    match kind {
        ValKind::I32 => Op::ConstI32(0),
        ValKind::I64 => Op::ConstI64(0),
        ValKind::F32 => Op::ConstF32(0),
        ValKind::F64 => Op::ConstF64(0),
        ValKind::Ref => Op::ConstNull,
    }
}

fn stamp_kind(stamp: &Stamp) -> ValKind {
    match stamp {
        Stamp::Int(s) if s.bits() == 32 => ValKind::I32,
        Stamp::Int(_) => ValKind::I64,
        Stamp::Float(s) if s.bits() == 32 => ValKind::F32,
        Stamp::Float(_) => ValKind::F64,
        Stamp::Ref(_) => ValKind::Ref,
        Stamp::RawPtr | Stamp::Void => {
            opal_core::graph_bug!("untyped value in an object slot")
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::verify::verify;
    use crate::ir::{ClassId, CmpOp, GraphBuilder, MethodId};
    use crate::opt::{Canonicalize, CompileStats};
    use opal_core::{CancelToken, CompileError};

    const OBJ: ClassId = ClassId(1);
    const BOX: ClassId = ClassId(2);
    const ARR: ClassId = ClassId(3);

    /// Canonicalize first, as the pipeline does, then run the analysis.
    fn run_escape(graph: &mut Graph) -> CompileStats {
        let config = CompileConfig::default();
        let cancel = CancelToken::new();
        let mut stats = CompileStats::default();
        let mut ctx = PhaseContext::new(&config, &cancel, &mut stats);
        Canonicalize.run(graph, &mut ctx).unwrap();
        PartialEscape.run(graph, &mut ctx).unwrap();
        assert!(verify(graph).is_ok(), "{:?}", verify(graph));
        stats
    }

    fn ret_of(graph: &Graph) -> NodeId {
        let exit = graph.node(graph.end).inputs.get(0).unwrap();
        assert!(matches!(graph.op(exit), Op::Return));
        exit
    }

    fn ret_value(graph: &Graph) -> NodeId {
        graph.node(ret_of(graph)).inputs.get(1).unwrap()
    }

    #[test]
    fn test_box_with_unboxed_consumer_vanishes() {
        let mut b = GraphBuilder::new();
        let p = b.param(0, ValKind::I64);
        let boxed = b.new_box(BOX, ValKind::I64, p);
        let v = b.unbox(ValKind::I64, boxed);
        b.ret(Some(v));
        let mut g = b.finish();

        let stats = run_escape(&mut g);
        assert_eq!(ret_value(&g), p);
        assert!(g.is_dead(boxed));
        assert_eq!(stats.allocs_virtualized, 1);
        assert!(g.state.is_after(StageSet::ESCAPE_ANALYZED));
    }

    #[test]
    fn test_field_roundtrip_allocation_removed() {
        let mut b = GraphBuilder::new();
        let p = b.param(0, ValKind::I32);
        let obj = b.new_object(OBJ, 2);
        b.store_field(obj, FieldId(0), p);
        let v = b.load_field(obj, FieldId(0), ValKind::I32);
        b.ret(Some(v));
        let mut g = b.finish();

        let stats = run_escape(&mut g);
        assert_eq!(ret_value(&g), p);
        assert!(g.is_dead(obj));
        assert_eq!(stats.allocs_virtualized, 1);
        assert_eq!(stats.allocs_materialized, 0);
    }

    #[test]
    fn test_virtual_fields_merge_with_phis() {
        // Different constants stored per arm; the load after the merge
        // becomes a phi and the allocation disappears.
        let mut b = GraphBuilder::new();
        let p = b.param(0, ValKind::I32);
        let obj = b.new_object(OBJ, 1);
        let zero = b.const_i32(0);
        let c = b.int_cmp(CmpOp::Lt, p, zero);
        let before = b.tail();
        let (t, f) = b.branch(c);

        b.seek(t, before.memory);
        let one = b.const_i32(1);
        b.store_field(obj, FieldId(0), one);
        let t_exit = b.tail();

        b.seek(f, before.memory);
        let two = b.const_i32(2);
        b.store_field(obj, FieldId(0), two);
        let f_exit = b.tail();

        b.merge(&[t_exit, f_exit]);
        let v = b.load_field(obj, FieldId(0), ValKind::I32);
        b.ret(Some(v));
        let mut g = b.finish();

        let stats = run_escape(&mut g);
        assert!(g.is_dead(obj));
        assert_eq!(stats.allocs_virtualized, 1);
        assert_eq!(stats.allocs_materialized, 0);
        let v = ret_value(&g);
        assert!(matches!(g.op(v), Op::Phi { kind: ValKind::I32 }));
        assert!(matches!(
            g.op(g.node(v).inputs.get(1).unwrap()),
            Op::ConstI32(1)
        ));
        assert!(matches!(
            g.op(g.node(v).inputs.get(2).unwrap()),
            Op::ConstI32(2)
        ));
    }

    #[test]
    fn test_escape_through_call_materializes_late() {
        let mut b = GraphBuilder::new();
        let p = b.param(0, ValKind::I32);
        let obj = b.new_object(OBJ, 1);
        let s = b.store_field(obj, FieldId(0), p);
        let call = b.call(MethodId(9), None, &[obj]);
        let v = b.load_field(obj, FieldId(0), ValKind::I32);
        b.ret(Some(v));
        let mut g = b.finish();

        let stats = run_escape(&mut g);
        assert!(!g.is_dead(obj));
        assert_eq!(stats.allocs_materialized, 1);
        assert_eq!(stats.allocs_virtualized, 0);
        // The original store is gone; an equivalent one sits right before
        // the call.
        assert!(g.is_dead(s));
        let pred = g.control_pred(call).unwrap();
        assert!(matches!(g.op(pred), Op::StoreField { .. }));
        assert_eq!(v, ret_value(&g));
        // The load reads memory the callee may have changed, so it stays.
        assert!(matches!(g.op(v), Op::LoadField { .. }));
    }

    #[test]
    fn test_returned_object_materializes_before_return() {
        let mut b = GraphBuilder::new();
        let p = b.param(0, ValKind::I32);
        let obj = b.new_object(OBJ, 1);
        b.store_field(obj, FieldId(0), p);
        b.ret(Some(obj));
        let mut g = b.finish();

        let stats = run_escape(&mut g);
        assert!(!g.is_dead(obj));
        assert_eq!(ret_value(&g), obj);
        assert_eq!(stats.allocs_materialized, 1);
        let pred = g.control_pred(ret_of(&g)).unwrap();
        assert!(matches!(g.op(pred), Op::StoreField { .. }));
    }

    #[test]
    fn test_mixed_merge_pins_the_object() {
        // One arm lets the object escape into a call, the other keeps it
        // virtual. The merge cannot hold both, so nothing is removed.
        let mut b = GraphBuilder::new();
        let p = b.param(0, ValKind::I32);
        let obj = b.new_object(OBJ, 1);
        let zero = b.const_i32(0);
        let c = b.int_cmp(CmpOp::Lt, p, zero);
        let before = b.tail();
        let (t, f) = b.branch(c);

        b.seek(t, before.memory);
        b.call(MethodId(4), None, &[obj]);
        let t_exit = b.tail();

        b.seek(f, before.memory);
        b.store_field(obj, FieldId(0), p);
        let f_exit = b.tail();

        b.merge(&[t_exit, f_exit]);
        let v = b.load_field(obj, FieldId(0), ValKind::I32);
        b.ret(Some(v));
        let mut g = b.finish();

        let stats = run_escape(&mut g);
        assert!(!g.is_dead(obj));
        assert_eq!(stats.allocs_virtualized, 0);
        assert_eq!(stats.allocs_materialized, 0);
        assert!(matches!(g.op(ret_value(&g)), Op::LoadField { .. }));
    }

    #[test]
    fn test_untouched_object_rides_a_loop() {
        let mut b = GraphBuilder::new();
        let p = b.param(0, ValKind::I32);
        let n = b.param(1, ValKind::I32);
        let obj = b.new_object(OBJ, 1);
        b.store_field(obj, FieldId(0), p);

        let header = b.loop_begin();
        let zero = b.const_i32(0);
        let i = b.loop_phi(header, ValKind::I32, zero);
        let c = b.int_cmp(CmpOp::Lt, i, n);
        let inside = b.tail();
        let (body, exit) = b.branch(c);

        b.seek(body, inside.memory);
        let one = b.const_i32(1);
        let i2 = b.int_add(i, one);
        b.loop_end(header);
        b.seal_loop_phi(i, i2);

        b.seek(exit, inside.memory);
        let v = b.load_field(obj, FieldId(0), ValKind::I32);
        b.ret(Some(v));
        let mut g = b.finish();

        let stats = run_escape(&mut g);
        assert!(g.is_dead(obj));
        assert_eq!(ret_value(&g), p);
        assert_eq!(stats.allocs_virtualized, 1);
    }

    #[test]
    fn test_loop_mutation_pins_the_object() {
        // The stored value differs per iteration, so the view at the back
        // edge never matches the entry assumption.
        let mut b = GraphBuilder::new();
        let n = b.param(0, ValKind::I32);
        let obj = b.new_object(OBJ, 1);

        let header = b.loop_begin();
        let zero = b.const_i32(0);
        let i = b.loop_phi(header, ValKind::I32, zero);
        let c = b.int_cmp(CmpOp::Lt, i, n);
        let inside = b.tail();
        let (body, exit) = b.branch(c);

        b.seek(body, inside.memory);
        b.store_field(obj, FieldId(0), i);
        let one = b.const_i32(1);
        let i2 = b.int_add(i, one);
        b.loop_end(header);
        b.seal_loop_phi(i, i2);

        b.seek(exit, inside.memory);
        let v = b.load_field(obj, FieldId(0), ValKind::I32);
        b.ret(Some(v));
        let mut g = b.finish();

        let stats = run_escape(&mut g);
        assert!(!g.is_dead(obj));
        assert_eq!(stats.allocs_virtualized, 0);
        assert_eq!(stats.allocs_materialized, 0);
        assert!(matches!(g.op(ret_value(&g)), Op::LoadField { .. }));
    }

    #[test]
    fn test_store_into_foreign_object_escapes() {
        let mut b = GraphBuilder::new();
        let other = b.param(0, ValKind::Ref);
        let obj = b.new_object(OBJ, 1);
        let s = b.store_field(other, FieldId(3), obj);
        b.ret(None);
        let mut g = b.finish();

        let stats = run_escape(&mut g);
        assert!(!g.is_dead(obj));
        assert!(!g.is_dead(s));
        assert_eq!(stats.allocs_materialized, 1);
        assert_eq!(stats.allocs_virtualized, 0);
    }

    #[test]
    fn test_array_with_constant_indexes_vanishes() {
        // Distinct index nodes with the same constant value, so only the
        // stamp-based slot model can connect the store to the load.
        let mut b = GraphBuilder::new();
        let p = b.param(0, ValKind::I32);
        let len = b.const_i32(2);
        let arr = b.new_array(ARR, ValKind::I32, len);
        let i0 = b.const_i32(0);
        b.store_index(arr, i0, p, ValKind::I32);
        let i0b = b.const_i32(0);
        let v = b.load_index(arr, i0b, ValKind::I32);
        b.ret(Some(v));
        let mut g = b.finish();

        let stats = run_escape(&mut g);
        assert_eq!(ret_value(&g), p);
        assert!(g.is_dead(arr));
        assert_eq!(stats.allocs_virtualized, 1);
    }

    #[test]
    fn test_dynamic_index_pins_the_array() {
        let mut b = GraphBuilder::new();
        let idx = b.param(0, ValKind::I32);
        let len = b.const_i32(4);
        let arr = b.new_array(ARR, ValKind::I32, len);
        let zero = b.const_i32(0);
        let s = b.store_index(arr, idx, zero, ValKind::I32);
        let v = b.load_index(arr, idx, ValKind::I32);
        b.ret(Some(v));
        let mut g = b.finish();

        let stats = run_escape(&mut g);
        assert!(!g.is_dead(arr));
        assert!(!g.is_dead(s));
        assert_eq!(stats.allocs_materialized, 1);
        assert_eq!(stats.allocs_virtualized, 0);
    }

    #[test]
    fn test_oversized_or_unknown_arrays_are_left_alone() {
        let mut b = GraphBuilder::new();
        let dyn_len = b.param(0, ValKind::I32);
        let big = b.const_i32(100);
        let a1 = b.new_array(ARR, ValKind::I32, big);
        let a2 = b.new_array(ARR, ValKind::I32, dyn_len);
        b.ret(None);
        let mut g = b.finish();

        let stats = run_escape(&mut g);
        assert!(!g.is_dead(a1));
        assert!(!g.is_dead(a2));
        assert_eq!(stats.allocs_virtualized, 0);
        assert_eq!(stats.allocs_materialized, 0);
    }

    #[test]
    fn test_chained_virtuals_materialize_together() {
        let mut b = GraphBuilder::new();
        let inner = b.new_object(OBJ, 1);
        let outer = b.new_object(OBJ, 1);
        b.store_field(outer, FieldId(0), inner);
        b.ret(Some(outer));
        let mut g = b.finish();

        let stats = run_escape(&mut g);
        assert!(!g.is_dead(inner));
        assert!(!g.is_dead(outer));
        assert_eq!(stats.allocs_materialized, 2);
        assert_eq!(ret_value(&g), outer);
        // outer.f0 is replayed right before the return.
        let pred = g.control_pred(ret_of(&g)).unwrap();
        assert!(matches!(g.op(pred), Op::StoreField { .. }));
    }

    #[test]
    fn test_loading_a_virtual_field_value_makes_it_real() {
        // The inner object is stored into a virtual field and read back on
        // the far side of a merge. The outer object still evaporates; the
        // inner one has to become real at the load.
        let mut b = GraphBuilder::new();
        let p = b.param(0, ValKind::I32);
        let other = b.param(1, ValKind::Ref);
        let inner = b.new_object(OBJ, 1);
        let outer = b.new_object(OBJ, 1);
        b.store_field(outer, FieldId(0), inner);
        let zero = b.const_i32(0);
        let c = b.int_cmp(CmpOp::Lt, p, zero);
        let before = b.tail();
        let (t, f) = b.branch(c);

        b.seek(t, before.memory);
        b.store_field(other, FieldId(2), p);
        let t_exit = b.tail();

        b.seek(f, before.memory);
        let f_exit = b.tail();

        b.merge(&[t_exit, f_exit]);
        let v = b.load_field(outer, FieldId(0), ValKind::Ref);
        b.ret(Some(v));
        let mut g = b.finish();

        let stats = run_escape(&mut g);
        assert_eq!(ret_value(&g), inner);
        assert!(g.is_dead(outer));
        assert!(!g.is_dead(inner));
        assert_eq!(stats.allocs_virtualized, 1);
        assert_eq!(stats.allocs_materialized, 1);
    }

    #[test]
    fn test_identity_compared_object_is_not_tracked() {
        let mut b = GraphBuilder::new();
        let other = b.param(0, ValKind::Ref);
        let obj = b.new_object(OBJ, 1);
        let c = b.ref_eq(obj, other);
        b.ret(Some(c));
        let mut g = b.finish();

        let stats = run_escape(&mut g);
        assert!(!g.is_dead(obj));
        assert_eq!(stats.allocs_virtualized, 0);
        assert_eq!(stats.allocs_materialized, 0);
    }

    #[test]
    fn test_no_candidates_still_marks_the_stage() {
        let mut b = GraphBuilder::new();
        let p = b.param(0, ValKind::I32);
        b.ret(Some(p));
        let mut g = b.finish();

        run_escape(&mut g);
        assert!(g.state.is_after(StageSet::ESCAPE_ANALYZED));
    }

    #[test]
    fn test_cancellation_stops_the_analysis() {
        let mut b = GraphBuilder::new();
        let obj = b.new_object(OBJ, 1);
        b.ret(Some(obj));
        let mut g = b.finish();

        let config = CompileConfig::default();
        let cancel = CancelToken::new();
        cancel.cancel();
        let mut stats = CompileStats::default();
        let mut ctx = PhaseContext::new(&config, &cancel, &mut stats);
        let err = PartialEscape.run(&mut g, &mut ctx).unwrap_err();
        assert!(matches!(err, CompileError::Cancelled));
    }
}
