//! The program graph: owning container for one compilation unit.
//!
//! The graph owns every node and keeps the two edge directions in lockstep:
//! inputs are stored on the node, usages in a side table, and every
//! mutation goes through graph methods so the two stay exact duals. The
//! graph also carries:
//! - **An edit counter**: bumped by every structural change; derived
//!   structures (schedules) record it and refuse to outlive it
//! - **The graph state**: which named stage invariants currently hold,
//!   threaded through the pipeline with the graph itself
//! - **Source positions**: new nodes take the current position; replacement
//!   transfers the old node's position when the replacement has none
//!
//! Deletion never frees a slot: [`Graph::kill`] clears the node's outgoing
//! edges and marks it dead, and it is an invariant violation for a live
//! node to reference a dead one.

use smallvec::SmallVec;

use opal_core::SourcePos;

use super::arena::{Arena, BitSet, SecondaryMap};
use super::node::{CmpOp, EdgeClass, InputList, Node, NodeFlags, NodeId, Op, OpKind};
use super::stamp::{IntStamp, Stamp};

// =============================================================================
// Graph state
// =============================================================================

bitflags::bitflags! {
    /// Named structural invariants a graph can have acquired.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct StageSet: u8 {
        /// A full canonicalization run has reached its fixed point.
        const CANONICAL = 1 << 0;
        /// Partial escape analysis has run.
        const ESCAPE_ANALYZED = 1 << 1;
        /// Floating guards have been pinned into the control chain. Dead
        /// anchors become collectable only after this.
        const GUARDS_FIXED = 1 << 2;
        /// A schedule has been computed for the current graph shape.
        const SCHEDULED = 1 << 3;
    }
}

/// Per-compilation record of which stage invariants currently hold.
///
/// Owned by the graph (never global), so concurrent compilations of other
/// methods cannot observe or corrupt it.
#[derive(Debug, Clone, Copy, Default)]
pub struct GraphState {
    stages: StageSet,
}

impl GraphState {
    pub fn new() -> GraphState {
        GraphState {
            stages: StageSet::empty(),
        }
    }

    pub fn stages(&self) -> StageSet {
        self.stages
    }

    /// True once every stage in `stages` has been marked.
    pub fn is_after(&self, stages: StageSet) -> bool {
        self.stages.contains(stages)
    }

    pub fn mark(&mut self, stages: StageSet) {
        self.stages |= stages;
    }

    /// Structural edits can invalidate a computed schedule.
    pub fn unmark(&mut self, stages: StageSet) {
        self.stages &= !stages;
    }
}

// =============================================================================
// Graph
// =============================================================================

/// Sea-of-nodes graph for one method.
#[derive(Clone)]
pub struct Graph {
    nodes: Arena<Node>,
    /// Dual of the input edges: for each node, the live nodes using it.
    uses: SecondaryMap<Node, Vec<NodeId>>,
    /// Method entry; also the initial memory state.
    pub start: NodeId,
    /// Exit sink; its inputs are every Return/Throw/Deopt.
    pub end: NodeId,
    /// Monotonically increasing structural edit counter.
    edits: u64,
    /// Position stamped onto newly created nodes.
    next_pos: SourcePos,
    /// Stage invariants currently holding for this graph.
    pub state: GraphState,
}

impl Graph {
    pub fn new() -> Graph {
        let mut nodes = Arena::with_capacity(64);
        let start = nodes.alloc(Node::new(Op::Start, InputList::Empty, SourcePos::UNKNOWN));
        let end = nodes.alloc(Node::new(Op::End, InputList::Empty, SourcePos::UNKNOWN));
        Graph {
            nodes,
            uses: SecondaryMap::with_capacity(64),
            start,
            end,
            edits: 0,
            next_pos: SourcePos::UNKNOWN,
            state: GraphState::new(),
        }
    }

    // =========================================================================
    // Access
    // =========================================================================

    #[inline]
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    /// Direct mutable access. Callers must not edit `inputs` through this;
    /// input edits go through [`Graph::replace_input`] and friends so usage
    /// edges stay dual.
    #[inline]
    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id]
    }

    #[inline]
    pub fn op(&self, id: NodeId) -> &Op {
        &self.nodes[id].op
    }

    #[inline]
    pub fn stamp(&self, id: NodeId) -> &Stamp {
        &self.nodes[id].stamp
    }

    #[inline]
    pub fn is_dead(&self, id: NodeId) -> bool {
        self.nodes[id].is_dead()
    }

    /// Total slots ever allocated, dead included.
    #[inline]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn live_count(&self) -> usize {
        self.nodes.iter().filter(|(_, n)| !n.is_dead()).count()
    }

    /// Edit counter for derived-structure invalidation.
    #[inline]
    pub fn edit_count(&self) -> u64 {
        self.edits
    }

    fn touch(&mut self) {
        self.edits += 1;
        // Any structural change invalidates a previously computed schedule.
        self.state.unmark(StageSet::SCHEDULED);
    }

    // =========================================================================
    // Iteration
    // =========================================================================

    pub fn iter_live(&self) -> impl Iterator<Item = (NodeId, &Node)> {
        self.nodes.iter().filter(|(_, n)| !n.is_dead())
    }

    /// Kind-filtered iteration, the cheap way phases scan for work.
    pub fn iter_kind(&self, kind: OpKind) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes
            .iter()
            .filter(move |(_, n)| !n.is_dead() && n.op.kind() == kind)
            .map(|(id, _)| id)
    }

    pub fn ids(&self) -> impl Iterator<Item = NodeId> {
        self.nodes.ids()
    }

    // =========================================================================
    // Creation
    // =========================================================================

    /// Position stamped onto nodes created from here on.
    pub fn set_pos(&mut self, pos: SourcePos) {
        self.next_pos = pos;
    }

    pub fn add(&mut self, op: Op, inputs: &[NodeId]) -> NodeId {
        let list = InputList::from_slice(inputs);
        let stamp = self.infer_stamp(&op, &list);
        let mut node = Node::new(op, list, self.next_pos);
        node.stamp = stamp;
        let id = self.nodes.alloc(node);
        for input in inputs {
            opal_core::guarantee!(
                !self.nodes[*input].is_dead(),
                "new node {id:?} references dead input {input:?}"
            );
            self.add_use(*input, id);
        }
        self.touch();
        id
    }

    // Constant helpers, used heavily by folding rewrites.

    pub fn const_i32(&mut self, value: i32) -> NodeId {
        self.add(Op::ConstI32(value), &[])
    }

    pub fn const_i64(&mut self, value: i64) -> NodeId {
        self.add(Op::ConstI64(value), &[])
    }

    pub fn const_f32(&mut self, value: f32) -> NodeId {
        self.add(Op::ConstF32(value.to_bits()), &[])
    }

    pub fn const_f64(&mut self, value: f64) -> NodeId {
        self.add(Op::ConstF64(value.to_bits()), &[])
    }

    pub fn const_bool(&mut self, value: bool) -> NodeId {
        self.const_i32(value as i32)
    }

    pub fn const_null(&mut self) -> NodeId {
        self.add(Op::ConstNull, &[])
    }

    /// Integer constant of the given width.
    pub fn const_int(&mut self, bits: u8, value: i64) -> NodeId {
        if bits == 32 {
            self.const_i32(value as i32)
        } else {
            self.const_i64(value)
        }
    }

    // =========================================================================
    // Usage edges
    // =========================================================================

    pub fn uses(&self, id: NodeId) -> &[NodeId] {
        self.uses.get(id).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn use_count(&self, id: NodeId) -> usize {
        self.uses.get(id).map(|v| v.len()).unwrap_or(0)
    }

    pub fn has_uses(&self, id: NodeId) -> bool {
        self.use_count(id) > 0
    }

    fn add_use(&mut self, def: NodeId, user: NodeId) {
        self.uses.resize(def.as_usize() + 1);
        self.uses[def].push(user);
    }

    fn remove_use(&mut self, def: NodeId, user: NodeId) {
        if let Some(uses) = self.uses.get_mut(def) {
            if let Some(pos) = uses.iter().position(|&u| u == user) {
                uses.swap_remove(pos);
            }
        }
    }

    // =========================================================================
    // Mutation
    // =========================================================================

    /// Replace one input edge, keeping usage edges dual.
    pub fn replace_input(&mut self, node: NodeId, index: usize, new_input: NodeId) {
        let old = self.nodes[node].inputs.get(index);
        opal_core::guarantee!(
            !self.nodes[new_input].is_dead(),
            "replace_input would wire {node:?} to dead node {new_input:?}"
        );
        if old == Some(new_input) {
            return;
        }
        if let Some(old) = old {
            self.remove_use(old, node);
        }
        self.nodes[node].inputs.set(index, new_input);
        self.add_use(new_input, node);
        self.touch();
    }

    /// Append an input edge (merge predecessors, phi operands, exits).
    pub fn add_input(&mut self, node: NodeId, input: NodeId) {
        opal_core::guarantee!(
            !self.nodes[input].is_dead(),
            "add_input would wire {node:?} to dead node {input:?}"
        );
        self.nodes[node].inputs.push(input);
        self.add_use(input, node);
        self.touch();
    }

    /// Drop the input at `index`, shifting the tail (region predecessor
    /// removal; callers keep any phis in sync).
    pub fn remove_input(&mut self, node: NodeId, index: usize) {
        let old = self.nodes[node].inputs.get(index);
        if let Some(old) = old {
            self.remove_use(old, node);
        }
        self.nodes[node].inputs.remove(index);
        self.touch();
    }

    /// Swap two inputs in place (commutative normalization).
    pub fn swap_inputs(&mut self, node: NodeId, i: usize, j: usize) {
        let a = self.nodes[node].inputs.get(i);
        let b = self.nodes[node].inputs.get(j);
        if let (Some(a), Some(b)) = (a, b) {
            self.nodes[node].inputs.set(i, b);
            self.nodes[node].inputs.set(j, a);
            self.touch();
        }
    }

    /// Swap the operation of a node without touching edges (condition
    /// mirroring and similar in-place rewrites).
    pub fn set_op(&mut self, node: NodeId, op: Op) {
        self.nodes[node].op = op;
        self.touch();
    }

    /// Redirect every usage of `old` to `new`. `old` keeps its inputs.
    pub fn replace_all_uses(&mut self, old: NodeId, new: NodeId) {
        opal_core::guarantee!(old != new, "replace_all_uses of a node with itself");
        let users: Vec<NodeId> = self.uses(old).to_vec();
        let mut updates: Vec<(NodeId, usize)> = Vec::new();
        for user in &users {
            let node = &self.nodes[*user];
            for i in 0..node.inputs.len() {
                if node.inputs.get(i) == Some(old) {
                    updates.push((*user, i));
                }
            }
        }
        for (user, i) in updates {
            self.nodes[user].inputs.set(i, new);
            self.add_use(new, user);
        }
        if let Some(uses) = self.uses.get_mut(old) {
            uses.clear();
        }
        self.touch();
    }

    /// Delete a node. It is a programming error (phase bug) to delete a
    /// node that still has usages: the caller must redirect them first.
    pub fn kill(&mut self, id: NodeId) {
        opal_core::guarantee!(!self.nodes[id].is_dead(), "double kill of {id:?}");
        opal_core::guarantee!(
            self.use_count(id) == 0,
            "kill of {id:?} ({}) with {} live usages",
            self.nodes[id].op.mnemonic(),
            self.use_count(id)
        );
        let inputs: Vec<NodeId> = self.nodes[id].inputs.iter().collect();
        for input in inputs {
            self.remove_use(input, id);
        }
        self.nodes[id].inputs = InputList::Empty;
        self.nodes[id].flags.insert(NodeFlags::DEAD);
        self.touch();
    }

    /// Atomically redirect all usages of `old` to `new`, transfer `old`'s
    /// source position onto `new` if `new` has none, and delete `old`.
    pub fn replace_and_delete(&mut self, old: NodeId, new: NodeId) {
        opal_core::guarantee!(old != new, "replace_and_delete of a node with itself");
        opal_core::guarantee!(
            !self.nodes[new].is_dead(),
            "replace_and_delete with dead replacement {new:?}"
        );
        if !self.nodes[new].pos.is_known() {
            self.nodes[new].pos = self.nodes[old].pos;
        }
        self.replace_all_uses(old, new);
        self.kill(old);
    }

    // =========================================================================
    // Control and memory chain
    // =========================================================================

    /// Control predecessor of a plain fixed node (input 0).
    pub fn control_pred(&self, id: NodeId) -> Option<NodeId> {
        let node = &self.nodes[id];
        if node.op.is_fixed() && !matches!(node.op, Op::Start | Op::Region | Op::LoopBegin | Op::End)
        {
            node.inputs.get(0)
        } else {
            None
        }
    }

    /// Fixed nodes that continue control flow after `id`. One for chain
    /// nodes, two projections after an `If`, none after the terminators
    /// feeding `End`. A `LoopEnd`'s header back-reference is an
    /// association, not succession, and is excluded.
    pub fn control_successors(&self, id: NodeId) -> SmallVec<[NodeId; 2]> {
        let mut succs = SmallVec::new();
        for &user in self.uses(id) {
            let node = &self.nodes[user];
            if !node.op.is_fixed() {
                continue;
            }
            for i in 0..node.inputs.len() {
                if node.inputs.get(i) != Some(id) {
                    continue;
                }
                if node.op.input_class(i) != EdgeClass::Control {
                    continue;
                }
                if matches!(node.op, Op::LoopEnd) && i == 1 {
                    continue;
                }
                if !succs.contains(&user) {
                    succs.push(user);
                }
            }
        }
        succs
    }

    /// Unlink a plain fixed chain node: control users take its control
    /// predecessor, memory users take its memory input. Value usages are
    /// left for the caller to redirect.
    pub fn remove_fixed(&mut self, id: NodeId) {
        let node = &self.nodes[id];
        opal_core::guarantee!(
            node.op.is_fixed() && !node.op.is_block_leader() && !node.op.is_block_terminator(),
            "remove_fixed on non-chain node {id:?} ({})",
            node.op.mnemonic()
        );
        let ctrl_pred = node.inputs.get(0);
        opal_core::guarantee!(
            ctrl_pred.is_some(),
            "remove_fixed on unlinked node {id:?}"
        );
        let ctrl_pred = ctrl_pred.unwrap();
        let mem_pred = node.op.memory_input().and_then(|i| node.inputs.get(i));

        let users: Vec<NodeId> = self.uses(id).to_vec();
        for user in users {
            let mut slots: Vec<(usize, EdgeClass)> = Vec::new();
            let unode = &self.nodes[user];
            for i in 0..unode.inputs.len() {
                if unode.inputs.get(i) == Some(id) {
                    slots.push((i, unode.op.input_class(i)));
                }
            }
            for (slot, class) in slots {
                match class {
                    EdgeClass::Control => self.replace_input(user, slot, ctrl_pred),
                    EdgeClass::Memory => {
                        let mem = match mem_pred {
                            Some(m) => m,
                            None => opal_core::graph_bug!(
                                "memory user {user:?} of non-producer {id:?}"
                            ),
                        };
                        self.replace_input(user, slot, mem);
                    }
                    EdgeClass::Value => {}
                }
            }
        }
    }

    /// Unlink a fixed node that produces a value and hand its value usages
    /// to `value` (unbox forwarding, load elimination).
    pub fn replace_fixed_with_value(&mut self, old: NodeId, value: NodeId) {
        self.remove_fixed(old);
        self.replace_and_delete(old, value);
    }

    /// Delete every live node whose index is missing from `keep`. Doomed
    /// nodes may reference each other freely (a dead loop variable and the
    /// arithmetic feeding its back edge), so all their input edges are
    /// detached before any of them is marked dead. Returns the number of
    /// nodes deleted.
    pub fn sweep(&mut self, keep: &BitSet) -> u64 {
        let mut doomed: Vec<NodeId> = Vec::new();
        for (id, node) in self.nodes.iter() {
            if !node.is_dead() && !keep.contains(id.as_usize()) {
                doomed.push(id);
            }
        }
        for &id in &doomed {
            let inputs: Vec<NodeId> = self.nodes[id].inputs.iter().collect();
            for input in inputs {
                self.remove_use(input, id);
            }
            self.nodes[id].inputs = InputList::Empty;
        }
        for &id in &doomed {
            opal_core::guarantee!(
                self.use_count(id) == 0,
                "sweep of {id:?} ({}) still used by a kept node",
                self.nodes[id].op.mnemonic()
            );
            if let Some(uses) = self.uses.get_mut(id) {
                uses.clear();
            }
            self.nodes[id].flags.insert(NodeFlags::DEAD);
        }
        if !doomed.is_empty() {
            self.touch();
        }
        doomed.len() as u64
    }

    // =========================================================================
    // Stamp inference
    // =========================================================================

    /// Compute the stamp of `op` over the current stamps of `inputs`.
    /// Conservative: anything not understood keeps its default stamp.
    pub fn infer_stamp(&self, op: &Op, inputs: &InputList) -> Stamp {
        let int_in = |i: usize| -> Option<IntStamp> {
            inputs
                .get(i)
                .and_then(|id| self.nodes.get(id))
                .and_then(|n| n.stamp.as_int().copied())
        };

        match op {
            Op::IntOp { op: arith, .. } => {
                let (Some(a), Some(b)) = (int_in(0), int_in(1)) else {
                    return op.default_stamp();
                };
                use super::node::IntArith::*;
                let s = match arith {
                    Add => a.add(&b),
                    Sub => a.sub(&b),
                    Mul => a.mul(&b),
                    And => a.and(&b),
                    Or => a.or(&b),
                    Xor => a.xor(&b),
                    Shl => a.shl(&b),
                    Shr => a.shr(&b),
                    Ushr => a.ushr(&b),
                };
                Stamp::Int(s)
            }
            Op::IntNeg { .. } => match int_in(0) {
                Some(a) => Stamp::Int(a.neg()),
                None => op.default_stamp(),
            },
            Op::IntNot { .. } => match int_in(0) {
                Some(a) => Stamp::Int(a.not()),
                None => op.default_stamp(),
            },
            Op::IntCmp { op: cmp, .. } => {
                let (Some(a), Some(b)) = (int_in(0), int_in(1)) else {
                    return op.default_stamp();
                };
                Stamp::Int(Self::cmp_stamp(*cmp, &a, &b))
            }
            Op::Convert(conv) => {
                use super::node::ConvertOp::*;
                match conv {
                    I32ToI64 => match int_in(0) {
                        Some(a) => Stamp::Int(a.sign_extend_to(64)),
                        None => op.default_stamp(),
                    },
                    I64ToI32 => match int_in(0) {
                        Some(a) => Stamp::Int(a.narrow_to(32)),
                        None => op.default_stamp(),
                    },
                    _ => op.default_stamp(),
                }
            }
            Op::RefEq => {
                let a = inputs
                    .get(0)
                    .and_then(|id| self.nodes.get(id))
                    .and_then(|n| n.stamp.as_ref_stamp().copied());
                let b = inputs
                    .get(1)
                    .and_then(|id| self.nodes.get(id))
                    .and_then(|n| n.stamp.as_ref_stamp().copied());
                match (a, b) {
                    (Some(a), Some(b)) => {
                        if a.is_always_null() && b.is_always_null() {
                            Stamp::constant_bool(true)
                        } else if (a.is_always_null() && b.is_non_null())
                            || (b.is_always_null() && a.is_non_null())
                        {
                            Stamp::constant_bool(false)
                        } else {
                            op.default_stamp()
                        }
                    }
                    _ => op.default_stamp(),
                }
            }
            Op::InstanceOf(class) => {
                let obj = inputs
                    .get(0)
                    .and_then(|id| self.nodes.get(id))
                    .and_then(|n| n.stamp.as_ref_stamp().copied());
                match obj {
                    Some(s) if s.is_always_null() => Stamp::constant_bool(false),
                    Some(s) => match s.exact_class() {
                        Some(k) if k != *class => Stamp::constant_bool(false),
                        Some(_) if s.is_non_null() => Stamp::constant_bool(true),
                        _ => op.default_stamp(),
                    },
                    None => op.default_stamp(),
                }
            }
            Op::Phi { .. } => {
                // Meet of the value operands; the slot-0 region is control.
                let mut acc: Option<Stamp> = None;
                for i in 1..inputs.len() {
                    let Some(id) = inputs.get(i) else { continue };
                    if !id.is_valid() {
                        continue;
                    }
                    let Some(n) = self.nodes.get(id) else { continue };
                    acc = Some(match acc {
                        None => n.stamp,
                        Some(prev) if prev.same_kind(&n.stamp) => prev.meet(&n.stamp),
                        Some(prev) => prev,
                    });
                }
                acc.unwrap_or_else(|| op.default_stamp())
            }
            _ => op.default_stamp(),
        }
    }

    fn cmp_stamp(op: CmpOp, a: &IntStamp, b: &IntStamp) -> IntStamp {
        if a.is_empty() || b.is_empty() {
            return IntStamp::empty(32);
        }
        let (can_true, can_false) = match op {
            CmpOp::Eq => (!a.never_eq(b), !(a.as_constant().is_some() && a == b)),
            CmpOp::Ne => (
                !(a.as_constant().is_some() && a == b),
                !a.never_eq(b),
            ),
            CmpOp::Lt => (a.lo() < b.hi(), a.hi() >= b.lo()),
            CmpOp::Le => (a.lo() <= b.hi(), a.hi() > b.lo()),
            CmpOp::Gt => (a.hi() > b.lo(), a.lo() <= b.hi()),
            CmpOp::Ge => (a.hi() >= b.lo(), a.lo() < b.hi()),
        };
        match (can_true, can_false) {
            (true, true) => IntStamp::bool_range(),
            (true, false) => IntStamp::constant(32, 1),
            (false, true) => IntStamp::constant(32, 0),
            (false, false) => IntStamp::empty(32),
        }
    }

    /// Re-infer a node's stamp, narrowing only (`join` with the previous
    /// stamp). Returns true when the stamp strictly narrowed, which is the
    /// canonicalizer's progress signal.
    pub fn recompute_stamp(&mut self, id: NodeId) -> bool {
        let node = &self.nodes[id];
        let inferred = self.infer_stamp(&node.op, &node.inputs);
        let old = self.nodes[id].stamp;
        if !old.same_kind(&inferred) {
            return false;
        }
        let new = old.join(&inferred);
        if new != old {
            self.nodes[id].stamp = new;
            true
        } else {
            false
        }
    }

    /// Overwrite a node's stamp. For structure changes that legitimately
    /// widen, like sealing a loop phi whose back-edge values depend on the
    /// phi itself and cannot be inferred without circularity.
    pub fn set_stamp(&mut self, id: NodeId, stamp: Stamp) {
        opal_core::guarantee!(
            self.nodes[id].stamp.same_kind(&stamp),
            "set_stamp changes the value kind of {id:?}"
        );
        self.nodes[id].stamp = stamp;
    }

    /// Re-infer the stamps of `id`'s transitive usages after `id`'s stamp
    /// widened. Inference is monotone in the input stamps, so the chaotic
    /// iteration converges.
    pub fn propagate_stamps_from(&mut self, id: NodeId) {
        let mut work: std::collections::VecDeque<NodeId> = self.uses(id).iter().copied().collect();
        while let Some(n) = work.pop_front() {
            if self.nodes[n].is_dead() {
                continue;
            }
            let inferred = {
                let node = &self.nodes[n];
                self.infer_stamp(&node.op, &node.inputs)
            };
            let old = self.nodes[n].stamp;
            if old.same_kind(&inferred) && inferred != old {
                self.nodes[n].stamp = inferred;
                for &user in self.uses(n) {
                    work.push_back(user);
                }
            }
        }
    }
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Graph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Graph({} nodes, {} live, {} edits)",
            self.len(),
            self.live_count(),
            self.edits
        )
    }
}

// =============================================================================
// Tests
// =============================================================================
