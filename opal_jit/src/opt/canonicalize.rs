//! Worklist canonicalization.
//!
//! Drains a worklist of candidate nodes, applying local rewrites until no
//! rule fires anywhere. Every rewrite must strictly reduce the graph
//! (fewer nodes, a narrower stamp, or a strictly simpler node), so the
//! fixed point exists; a step budget turns any violation of that rule
//! into a hard error instead of a hang.
//!
//! Rules fire in a fixed order per node and the worklist is FIFO over
//! ascending seed order, so a given input graph always canonicalizes to
//! the same output graph.
//!
//! Rewrites here are strictly local: a node, its inputs' stamps, and its
//! immediate memory predecessor. Anything needing whole-graph reasoning
//! (dominators, loops) belongs to a scheduler-backed phase instead.

use std::collections::VecDeque;

use tracing::debug;

use opal_core::{CompileError, Result};

use crate::ir::{
    BitSet, EdgeClass, Graph, GraphState, IntArith, MemLoc, NodeId, Op, OpKind, StageSet, Stamp,
    ValKind,
};

use super::{Phase, PhaseContext};

// =============================================================================
// Phase
// =============================================================================

/// Fixed-point local simplification.
#[derive(Debug, Default)]
pub struct Canonicalize;

impl Phase for Canonicalize {
    fn name(&self) -> &'static str {
        "canonicalize"
    }

    fn produces(&self) -> StageSet {
        StageSet::CANONICAL
    }

    fn run(&mut self, graph: &mut Graph, ctx: &mut PhaseContext<'_>) -> Result<()> {
        let mut worker = Worker::new(graph, ctx);
        worker.seed_all();
        worker.drain()?;
        let steps = worker.steps;
        graph.state.mark(StageSet::CANONICAL);
        debug!(steps, live = graph.live_count(), "canonicalize reached fixed point");
        Ok(())
    }
}

/// Re-canonicalize starting only from the given seeds, for phases that
/// enable new folds (escape analysis after it rewrites loads).
pub fn canonicalize_from(
    graph: &mut Graph,
    ctx: &mut PhaseContext<'_>,
    seeds: &[NodeId],
) -> Result<()> {
    let mut worker = Worker::new(graph, ctx);
    for &seed in seeds {
        worker.push(seed);
    }
    worker.drain()
}

// =============================================================================
// Rewrites
// =============================================================================

/// Outcome of examining one node.
enum Rewrite {
    Unchanged,
    /// Redirect all usages to an existing node and delete.
    Replace(NodeId),
    /// Same, for a chain node: splice control and memory around it first.
    ReplaceFixed(NodeId),
    /// Replace a floating node with a freshly created constant.
    Fold(Op),
    /// Replace a chain node with a freshly created constant.
    FoldFixed(Op),
    /// Hop this load's memory input past a disjoint kill.
    RethreadMemory(NodeId),
    /// Delete a floating node with no usages.
    Kill,
    /// Unlink and delete a chain node whose value is unused.
    KillFixed,
    /// Delete the overwritten store feeding this one.
    RemoveDeadStore(NodeId),
    /// The condition is constant; collapse the branch.
    CollapseIf(bool),
}

struct Worker<'a, 'c> {
    graph: &'a mut Graph,
    ctx: &'a mut PhaseContext<'c>,
    work: VecDeque<NodeId>,
    queued: BitSet,
    steps: u64,
    budget: u64,
}

impl<'a, 'c> Worker<'a, 'c> {
    fn new(graph: &'a mut Graph, ctx: &'a mut PhaseContext<'c>) -> Worker<'a, 'c> {
        let budget = ctx.config.canonicalize_budget_factor * graph.live_count() as u64
            + ctx.config.canonicalize_budget_base;
        Worker {
            graph,
            ctx,
            work: VecDeque::new(),
            queued: BitSet::new(),
            steps: 0,
            budget,
        }
    }

    fn seed_all(&mut self) {
        let ids: Vec<NodeId> = self.graph.iter_live().map(|(id, _)| id).collect();
        for id in ids {
            self.push(id);
        }
    }

    fn push(&mut self, id: NodeId) {
        if !id.is_valid() || self.graph.is_dead(id) {
            return;
        }
        if !self.queued.contains(id.as_usize()) {
            self.queued.insert(id.as_usize());
            self.work.push_back(id);
        }
    }

    fn push_uses(&mut self, id: NodeId) {
        let users: Vec<NodeId> = self.graph.uses(id).to_vec();
        for user in users {
            self.push(user);
        }
    }

    fn push_inputs(&mut self, id: NodeId) {
        let inputs: Vec<NodeId> = self.graph.node(id).inputs.iter().collect();
        for input in inputs {
            self.push(input);
        }
    }

    fn drain(&mut self) -> Result<()> {
        while let Some(id) = self.work.pop_front() {
            self.queued.remove(id.as_usize());
            if self.graph.is_dead(id) {
                continue;
            }
            self.ctx.cancel.check()?;
            self.steps += 1;
            self.ctx.stats.canonicalize_steps += 1;
            if self.steps > self.budget {
                return Err(CompileError::FixpointExceeded {
                    phase: "canonicalize",
                    steps: self.steps,
                });
            }
            self.process(id);
        }
        Ok(())
    }

    fn process(&mut self, id: NodeId) {
        // Stamp narrowing first: a narrower stamp can unlock every other
        // rule, and usages may fold on the new stamp.
        if self.graph.recompute_stamp(id) {
            self.push_uses(id);
        }

        if self.try_materialize_constant(id) {
            return;
        }

        // Commutative normalization: constant operand to the right.
        if self.graph.op(id).is_commutative() {
            let a = self.graph.node(id).inputs.get(0);
            let b = self.graph.node(id).inputs.get(1);
            if let (Some(a), Some(b)) = (a, b) {
                if self.graph.op(a).kind() == OpKind::Const
                    && self.graph.op(b).kind() != OpKind::Const
                {
                    self.graph.swap_inputs(id, 0, 1);
                    self.push(id);
                    return;
                }
            }
        }

        let rewrite = self.rewrite(id);
        self.apply(id, rewrite);
    }

    /// A pure or phi node whose stamp pinned down a single value becomes
    /// that constant.
    fn try_materialize_constant(&mut self, id: NodeId) -> bool {
        let op = self.graph.op(id);
        let foldable =
            (op.is_pure() || matches!(op, Op::Phi { .. })) && op.kind() != OpKind::Const;
        if !foldable {
            return false;
        }
        let folded = match self.graph.stamp(id) {
            Stamp::Int(s) => s.as_constant().map(|v| {
                if s.bits() == 32 {
                    Op::ConstI32(v as i32)
                } else {
                    Op::ConstI64(v)
                }
            }),
            Stamp::Ref(r) if r.is_always_null() => Some(Op::ConstNull),
            _ => None,
        };
        match folded {
            Some(op) => {
                self.apply(id, Rewrite::Fold(op));
                true
            }
            None => false,
        }
    }

    // =========================================================================
    // Per-op rules
    // =========================================================================

    fn rewrite(&mut self, id: NodeId) -> Rewrite {
        let node = self.graph.node(id);
        let input = |i: usize| node.inputs.get(i);

        match node.op {
            Op::IntOp { op, bits } => {
                let (Some(a), Some(b)) = (input(0), input(1)) else {
                    return Rewrite::Unchanged;
                };
                let b_const = self.graph.stamp(b).as_int().and_then(|s| s.as_constant());
                if let (Some(k), Some(identity)) = (b_const, op.identity()) {
                    if k == identity {
                        return Rewrite::Replace(a);
                    }
                }
                if let (Some(k), Some(absorbing)) = (b_const, op.absorbing()) {
                    if k == absorbing {
                        return Rewrite::Fold(const_int_op(bits, absorbing));
                    }
                }
                if a == b {
                    match op {
                        IntArith::Sub | IntArith::Xor => {
                            return Rewrite::Fold(const_int_op(bits, 0))
                        }
                        IntArith::And | IntArith::Or => return Rewrite::Replace(a),
                        _ => {}
                    }
                }
                Rewrite::Unchanged
            }

            Op::IntNeg { .. } => match input(0).map(|a| *self.graph.op(a)) {
                Some(Op::IntNeg { .. }) => {
                    let inner = self.graph.node(input(0).unwrap()).inputs.get(0).unwrap();
                    Rewrite::Replace(inner)
                }
                _ => Rewrite::Unchanged,
            },
            Op::IntNot { .. } => match input(0).map(|a| *self.graph.op(a)) {
                Some(Op::IntNot { .. }) => {
                    let inner = self.graph.node(input(0).unwrap()).inputs.get(0).unwrap();
                    Rewrite::Replace(inner)
                }
                _ => Rewrite::Unchanged,
            },

            Op::IntCmp { op, .. } => {
                let (Some(a), Some(b)) = (input(0), input(1)) else {
                    return Rewrite::Unchanged;
                };
                if a == b {
                    use crate::ir::CmpOp::*;
                    let r = matches!(op, Eq | Le | Ge);
                    return Rewrite::Fold(Op::ConstI32(r as i32));
                }
                Rewrite::Unchanged
            }

            Op::RefEq => {
                let (Some(a), Some(b)) = (input(0), input(1)) else {
                    return Rewrite::Unchanged;
                };
                if a == b {
                    return Rewrite::Fold(Op::ConstI32(1));
                }
                let stamps = (
                    self.graph.stamp(a).as_ref_stamp(),
                    self.graph.stamp(b).as_ref_stamp(),
                );
                if let (Some(ra), Some(rb)) = stamps {
                    if ra.is_always_null() && rb.is_always_null() {
                        return Rewrite::Fold(Op::ConstI32(1));
                    }
                    if (ra.is_always_null() && rb.is_non_null())
                        || (rb.is_always_null() && ra.is_non_null())
                    {
                        return Rewrite::Fold(Op::ConstI32(0));
                    }
                    if let (Some(ka), Some(kb)) = (ra.exact_class(), rb.exact_class()) {
                        if ka != kb && ra.is_non_null() && rb.is_non_null() {
                            return Rewrite::Fold(Op::ConstI32(0));
                        }
                    }
                }
                // Two distinct allocation sites can never alias.
                if self.graph.op(a).is_allocation() && self.graph.op(b).is_allocation() {
                    return Rewrite::Fold(Op::ConstI32(0));
                }
                Rewrite::Unchanged
            }

            Op::InstanceOf(class) => {
                let Some(object) = input(0) else {
                    return Rewrite::Unchanged;
                };
                let Some(r) = self.graph.stamp(object).as_ref_stamp() else {
                    return Rewrite::Unchanged;
                };
                // instanceof is false on null, whatever the class.
                if r.is_always_null() {
                    return Rewrite::Fold(Op::ConstI32(0));
                }
                match r.exact_class() {
                    Some(k) if k != class => Rewrite::Fold(Op::ConstI32(0)),
                    Some(_) if r.is_non_null() => Rewrite::Fold(Op::ConstI32(1)),
                    _ => Rewrite::Unchanged,
                }
            }

            Op::ArrayLength => {
                let Some(array) = input(0) else {
                    return Rewrite::Unchanged;
                };
                if matches!(self.graph.op(array), Op::NewArray { .. }) {
                    let length = self.graph.node(array).inputs.get(1).unwrap();
                    return Rewrite::Replace(length);
                }
                Rewrite::Unchanged
            }

            // Float constants fold through explicit rules, not stamps: the
            // float lattice does not collapse to singletons.
            Op::FloatOp { op, bits } => {
                let consts = (
                    input(0).map(|a| *self.graph.op(a)),
                    input(1).map(|b| *self.graph.op(b)),
                );
                match consts {
                    (Some(Op::ConstF32(x)), Some(Op::ConstF32(y))) if bits == 32 => {
                        let r = float_arith_32(op, f32::from_bits(x), f32::from_bits(y));
                        Rewrite::Fold(Op::ConstF32(r.to_bits()))
                    }
                    (Some(Op::ConstF64(x)), Some(Op::ConstF64(y))) if bits == 64 => {
                        let r = float_arith_64(op, f64::from_bits(x), f64::from_bits(y));
                        Rewrite::Fold(Op::ConstF64(r.to_bits()))
                    }
                    _ => Rewrite::Unchanged,
                }
            }
            Op::FloatNeg { bits } => match input(0).map(|a| *self.graph.op(a)) {
                Some(Op::ConstF32(x)) if bits == 32 => {
                    Rewrite::Fold(Op::ConstF32((-f32::from_bits(x)).to_bits()))
                }
                Some(Op::ConstF64(x)) if bits == 64 => {
                    Rewrite::Fold(Op::ConstF64((-f64::from_bits(x)).to_bits()))
                }
                _ => Rewrite::Unchanged,
            },
            Op::FloatCmp { op, .. } => {
                let consts = (
                    input(0).map(|a| *self.graph.op(a)),
                    input(1).map(|b| *self.graph.op(b)),
                );
                let vals = match consts {
                    (Some(Op::ConstF32(x)), Some(Op::ConstF32(y))) => {
                        Some((f32::from_bits(x) as f64, f32::from_bits(y) as f64))
                    }
                    (Some(Op::ConstF64(x)), Some(Op::ConstF64(y))) => {
                        Some((f64::from_bits(x), f64::from_bits(y)))
                    }
                    _ => None,
                };
                match vals {
                    Some((x, y)) => {
                        use crate::ir::CmpOp::*;
                        let r = match op {
                            Eq => x == y,
                            Ne => x != y,
                            Lt => x < y,
                            Le => x <= y,
                            Gt => x > y,
                            Ge => x >= y,
                        };
                        Rewrite::Fold(Op::ConstI32(r as i32))
                    }
                    None => Rewrite::Unchanged,
                }
            }

            Op::Convert(conv) => {
                use crate::ir::ConvertOp::*;
                let Some(a) = input(0) else {
                    return Rewrite::Unchanged;
                };
                // Integer results fold through stamps; float results here.
                match (conv, *self.graph.op(a)) {
                    (I64ToI32, Op::Convert(I32ToI64)) => {
                        let inner = self.graph.node(a).inputs.get(0).unwrap();
                        Rewrite::Replace(inner)
                    }
                    (I32ToF64, Op::ConstI32(v)) => {
                        Rewrite::Fold(Op::ConstF64((v as f64).to_bits()))
                    }
                    (I64ToF64, Op::ConstI64(v)) => {
                        Rewrite::Fold(Op::ConstF64((v as f64).to_bits()))
                    }
                    (F32ToF64, Op::ConstF32(x)) => {
                        Rewrite::Fold(Op::ConstF64((f32::from_bits(x) as f64).to_bits()))
                    }
                    (F64ToF32, Op::ConstF64(x)) => {
                        Rewrite::Fold(Op::ConstF32((f64::from_bits(x) as f32).to_bits()))
                    }
                    _ => Rewrite::Unchanged,
                }
            }

            Op::Phi { .. } | Op::MemoryPhi => self.rewrite_phi(id),

            Op::Guard { .. } => {
                let cond = input(0);
                let always = cond
                    .and_then(|c| self.graph.stamp(c).as_int().and_then(|s| s.as_constant()))
                    == Some(1);
                if always {
                    return Rewrite::Kill;
                }
                Rewrite::Unchanged
            }

            Op::Anchor => {
                // The chain successor always counts as a user, so presence
                // of uses says nothing; only guard users make an anchor
                // load-bearing. Removal before guards are pinned would
                // strand a guard floated here later.
                let guarded = self
                    .graph
                    .uses(id)
                    .iter()
                    .any(|&u| matches!(self.graph.op(u), Op::Guard { .. }));
                if !guarded && dead_anchor_removable(&self.graph.state) {
                    return Rewrite::KillFixed;
                }
                Rewrite::Unchanged
            }

            Op::Unbox { kind } => {
                let Some(boxed) = input(1) else {
                    return Rewrite::Unchanged;
                };
                match *self.graph.op(boxed) {
                    Op::NewBox { kind: k, .. } if k == kind => {
                        let value = self.graph.node(boxed).inputs.get(1).unwrap();
                        self.ctx.stats.loads_forwarded += 1;
                        Rewrite::ReplaceFixed(value)
                    }
                    _ => self.rewrite_load(id),
                }
            }

            Op::LoadField { .. } | Op::LoadIndex { .. } => self.rewrite_load(id),

            Op::StoreField { .. } | Op::StoreIndex { .. } => self.rewrite_store(id),

            Op::If => {
                let cond = input(1);
                let k = cond
                    .and_then(|c| self.graph.stamp(c).as_int().and_then(|s| s.as_constant()));
                match k {
                    Some(k) => Rewrite::CollapseIf(k != 0),
                    None => Rewrite::Unchanged,
                }
            }

            Op::Region => {
                if self.graph.node(id).inputs.len() == 1 && !self.has_phi_users(id) {
                    let pred = self.graph.node(id).inputs.get(0).unwrap();
                    return Rewrite::Replace(pred);
                }
                Rewrite::Unchanged
            }
            Op::LoopBegin => {
                // Every back edge is gone: not a loop anymore.
                if self.graph.node(id).inputs.len() == 1 && !self.has_phi_users(id) {
                    let entry = self.graph.node(id).inputs.get(0).unwrap();
                    return Rewrite::Replace(entry);
                }
                Rewrite::Unchanged
            }

            _ => {
                if node.op.is_pure() && !self.graph.has_uses(id) {
                    return Rewrite::Kill;
                }
                Rewrite::Unchanged
            }
        }
    }

    /// A phi whose operands (ignoring itself) agree collapses to that
    /// operand. Covers single-predecessor merges and redundant loop phis.
    fn rewrite_phi(&mut self, id: NodeId) -> Rewrite {
        if !self.graph.has_uses(id) {
            return Rewrite::Kill;
        }
        let node = self.graph.node(id);
        let mut unique: Option<NodeId> = None;
        for i in 1..node.inputs.len() {
            let Some(operand) = node.inputs.get(i) else {
                return Rewrite::Unchanged;
            };
            if operand == id {
                continue;
            }
            match unique {
                None => unique = Some(operand),
                Some(u) if u == operand => {}
                Some(_) => return Rewrite::Unchanged,
            }
        }
        match unique {
            Some(operand) => Rewrite::Replace(operand),
            None => Rewrite::Unchanged,
        }
    }

    /// Loads look one step up the memory chain:
    /// - same location, same object, the producer is a store: take its value
    /// - provably disjoint kill: hop past it and look again later
    /// - a fresh allocation the load does not read: hop past it
    /// - a field read of the freshly allocated object itself: the field
    ///   still holds its default value
    ///
    /// Element loads of a fresh array never fold to the default: their
    /// bounds trap must survive.
    fn rewrite_load(&mut self, id: NodeId) -> Rewrite {
        let node = self.graph.node(id);
        let Some(loc) = node.op.load_location() else {
            return Rewrite::Unchanged;
        };
        let Some(mem_slot) = node.op.memory_input() else {
            return Rewrite::Unchanged;
        };
        let Some(mem) = node.inputs.get(mem_slot) else {
            return Rewrite::Unchanged;
        };
        let obj = node.inputs.get(1);

        let mem_op = *self.graph.op(mem);
        match mem_op {
            Op::StoreField { field } => {
                let store_obj = self.graph.node(mem).inputs.get(1);
                if MemLoc::Field(field) == loc && store_obj == obj {
                    let value = self.graph.node(mem).inputs.get(2).unwrap();
                    self.ctx.stats.loads_forwarded += 1;
                    return Rewrite::ReplaceFixed(value);
                }
                self.hop_if_disjoint(mem, &mem_op, loc)
            }
            Op::StoreIndex { .. } => {
                let store_arr = self.graph.node(mem).inputs.get(1);
                let store_idx = self.graph.node(mem).inputs.get(2);
                let load_idx = self.graph.node(id).inputs.get(2);
                if loc == MemLoc::Element && store_arr == obj && store_idx == load_idx {
                    let value = self.graph.node(mem).inputs.get(3).unwrap();
                    self.ctx.stats.loads_forwarded += 1;
                    return Rewrite::ReplaceFixed(value);
                }
                self.hop_if_disjoint(mem, &mem_op, loc)
            }
            Op::New { .. } | Op::NewArray { .. } | Op::NewBox { .. } => {
                if obj == Some(mem) {
                    // Reading the object this memory state just allocated.
                    if let (Op::New { .. }, Op::LoadField { kind, .. }) =
                        (mem_op, self.graph.op(id))
                    {
                        return Rewrite::FoldFixed(default_const(*kind));
                    }
                    return Rewrite::Unchanged;
                }
                // A fresh allocation cannot alias any object that already
                // existed, so loads of other objects pass it.
                let hop = self
                    .graph
                    .node(mem)
                    .inputs
                    .get(mem_op.memory_input().unwrap());
                match hop {
                    Some(hop) => Rewrite::RethreadMemory(hop),
                    None => Rewrite::Unchanged,
                }
            }
            // Calls clobber everything; merges end the local view.
            _ => Rewrite::Unchanged,
        }
    }

    fn hop_if_disjoint(&self, kill: NodeId, kill_op: &Op, loc: MemLoc) -> Rewrite {
        let Some(kill_loc) = kill_op.kill_location() else {
            return Rewrite::Unchanged;
        };
        if !kill_loc.disjoint(loc) {
            return Rewrite::Unchanged;
        }
        let hop = self
            .graph
            .node(kill)
            .inputs
            .get(kill_op.memory_input().unwrap());
        match hop {
            Some(hop) => Rewrite::RethreadMemory(hop),
            None => Rewrite::Unchanged,
        }
    }

    /// A store whose previous memory state is an overwritten store with no
    /// other memory observers deletes the earlier store.
    fn rewrite_store(&mut self, id: NodeId) -> Rewrite {
        let node = self.graph.node(id);
        let Some(loc) = node.op.kill_location() else {
            return Rewrite::Unchanged;
        };
        let Some(mem_slot) = node.op.memory_input() else {
            return Rewrite::Unchanged;
        };
        let Some(prev) = node.inputs.get(mem_slot) else {
            return Rewrite::Unchanged;
        };
        let same_target = match (*self.graph.op(prev), *self.graph.op(id)) {
            (Op::StoreField { field: f1 }, Op::StoreField { field: f2 }) => {
                f1 == f2
                    && loc == MemLoc::Field(f2)
                    && self.graph.node(prev).inputs.get(1) == self.graph.node(id).inputs.get(1)
            }
            (Op::StoreIndex { .. }, Op::StoreIndex { .. }) => {
                self.graph.node(prev).inputs.get(1) == self.graph.node(id).inputs.get(1)
                    && self.graph.node(prev).inputs.get(2) == self.graph.node(id).inputs.get(2)
            }
            _ => false,
        };
        if !same_target {
            return Rewrite::Unchanged;
        }
        // Every memory observer of the earlier store must be this store;
        // plain control users are order-only and splice fine.
        for &user in self.graph.uses(prev) {
            let unode = self.graph.node(user);
            for i in 0..unode.inputs.len() {
                if unode.inputs.get(i) == Some(prev)
                    && unode.op.input_class(i) == EdgeClass::Memory
                    && user != id
                {
                    return Rewrite::Unchanged;
                }
            }
        }
        Rewrite::RemoveDeadStore(prev)
    }

    fn has_phi_users(&self, merge: NodeId) -> bool {
        self.graph.uses(merge).iter().any(|&u| {
            matches!(self.graph.op(u), Op::Phi { .. } | Op::MemoryPhi)
                && self.graph.node(u).inputs.get(0) == Some(merge)
        })
    }

    // =========================================================================
    // Application
    // =========================================================================

    fn apply(&mut self, id: NodeId, rewrite: Rewrite) {
        match rewrite {
            Rewrite::Unchanged => {}
            Rewrite::Replace(new) => {
                self.push_uses(id);
                self.push_inputs(id);
                self.graph.replace_and_delete(id, new);
                self.push(new);
            }
            Rewrite::ReplaceFixed(new) => {
                self.push_uses(id);
                self.push_inputs(id);
                self.graph.replace_fixed_with_value(id, new);
                self.push(new);
            }
            Rewrite::Fold(op) => {
                let c = self.graph.add(op, &[]);
                self.ctx.stats.nodes_folded += 1;
                self.push_uses(id);
                self.push_inputs(id);
                self.graph.replace_and_delete(id, c);
                self.push(c);
            }
            Rewrite::FoldFixed(op) => {
                let c = self.graph.add(op, &[]);
                self.ctx.stats.nodes_folded += 1;
                self.push_uses(id);
                self.push_inputs(id);
                self.graph.replace_fixed_with_value(id, c);
                self.push(c);
            }
            Rewrite::RethreadMemory(mem) => {
                let slot = self.graph.op(id).memory_input().unwrap();
                self.graph.replace_input(id, slot, mem);
                self.push(id);
            }
            Rewrite::Kill => {
                self.push_inputs(id);
                self.graph.kill(id);
            }
            Rewrite::KillFixed => {
                self.push_inputs(id);
                self.graph.remove_fixed(id);
                self.graph.kill(id);
            }
            Rewrite::RemoveDeadStore(prev) => {
                self.push_inputs(prev);
                self.push(id);
                self.graph.remove_fixed(prev);
                self.graph.kill(prev);
            }
            Rewrite::CollapseIf(taken) => self.collapse_if(id, taken),
        }
    }

    /// Constant condition: the surviving arm continues from the branch's
    /// predecessor, the other arm is unreachable and unwound.
    fn collapse_if(&mut self, iff: NodeId, taken: bool) {
        let mut live = NodeId::INVALID;
        let mut dead = NodeId::INVALID;
        for &user in self.graph.uses(iff) {
            if let Op::Proj { index } = self.graph.op(user) {
                if (*index == 0) == taken {
                    live = user;
                } else {
                    dead = user;
                }
            }
        }
        opal_core::guarantee!(
            live.is_valid() && dead.is_valid(),
            "collapsing {iff:?} without both projections"
        );
        let ctrl_in = self.graph.node(iff).inputs.get(0).unwrap();

        self.push_uses(live);
        self.graph.replace_all_uses(live, ctrl_in);
        self.graph.kill(live);

        self.kill_unreachable(dead);

        self.push_inputs(iff);
        self.graph.kill(iff);
        self.push(ctrl_in);
        self.ctx.stats.branches_collapsed += 1;
    }

    /// Remove the control subgraph reachable only through `entry`.
    ///
    /// Walks forward along control successors. Exit nodes unhook
    /// themselves from the end node instead of walking into it. Boundary
    /// merges lose the corresponding predecessor (and phi operands), and
    /// merges left with no way in join the dead set. Loop back edges
    /// detach from their header, which may stop being a loop.
    fn kill_unreachable(&mut self, entry: NodeId) {
        let mut dead: Vec<NodeId> = Vec::new();
        let mut seen = BitSet::new();
        let mut stack = vec![entry];

        while let Some(n) = stack.pop() {
            if seen.contains(n.as_usize()) {
                continue;
            }
            seen.insert(n.as_usize());
            dead.push(n);

            match *self.graph.op(n) {
                Op::Return | Op::Throw | Op::Deopt { .. } => {
                    let end = self.graph.end;
                    let pos = self.pred_pos(end, n);
                    self.graph.remove_input(end, pos);
                    continue;
                }
                Op::LoopEnd => {
                    let header = self.graph.node(n).inputs.get(1).unwrap();
                    self.detach_merge_pred(header, n);
                    if self.graph.node(header).inputs.is_empty() {
                        stack.push(header);
                    } else {
                        self.push(header);
                    }
                    continue;
                }
                _ => {}
            }

            let succs = self.graph.control_successors(n);
            for succ in succs {
                match self.graph.op(succ) {
                    Op::Region | Op::LoopBegin => {
                        self.detach_merge_pred(succ, n);
                        if self.graph.node(succ).inputs.is_empty() {
                            stack.push(succ);
                        } else {
                            self.push(succ);
                        }
                    }
                    _ => stack.push(succ),
                }
            }
        }

        // Close over the floating referencers of unreachable control:
        // phis of dead merges, guards hung on dead anchors or conditions.
        let mut kill_set = dead;
        let mut in_set = BitSet::new();
        for &n in &kill_set {
            in_set.insert(n.as_usize());
        }
        let mut i = 0;
        while i < kill_set.len() {
            let n = kill_set[i];
            i += 1;
            let grabbed: Vec<NodeId> = self
                .graph
                .uses(n)
                .iter()
                .copied()
                .filter(|&u| {
                    !in_set.contains(u.as_usize())
                        && matches!(
                            self.graph.op(u),
                            Op::Phi { .. } | Op::MemoryPhi | Op::Guard { .. }
                        )
                })
                .collect();
            for u in grabbed {
                in_set.insert(u.as_usize());
                kill_set.push(u);
            }
        }

        // Kill leaves-first until the whole set is gone.
        loop {
            let mut progress = false;
            for &n in &kill_set {
                if !self.graph.is_dead(n) && !self.graph.has_uses(n) {
                    self.push_inputs(n);
                    self.graph.kill(n);
                    progress = true;
                }
            }
            if !progress {
                break;
            }
        }
        for &n in &kill_set {
            opal_core::guarantee!(
                self.graph.is_dead(n),
                "unreachable node {n:?} is still referenced"
            );
        }
    }

    /// Remove `pred` from a merge's inputs along with the matching phi
    /// operands.
    fn detach_merge_pred(&mut self, merge: NodeId, pred: NodeId) {
        let pos = self.pred_pos(merge, pred);
        let phis: Vec<NodeId> = self
            .graph
            .uses(merge)
            .iter()
            .copied()
            .filter(|&u| {
                matches!(self.graph.op(u), Op::Phi { .. } | Op::MemoryPhi)
                    && self.graph.node(u).inputs.get(0) == Some(merge)
            })
            .collect();
        for phi in phis {
            self.graph.remove_input(phi, pos + 1);
            self.push(phi);
        }
        self.graph.remove_input(merge, pos);
    }

    fn pred_pos(&self, merge: NodeId, pred: NodeId) -> usize {
        let inputs = &self.graph.node(merge).inputs;
        for i in 0..inputs.len() {
            if inputs.get(i) == Some(pred) {
                return i;
            }
        }
        opal_core::graph_bug!("{pred:?} is not a predecessor of {merge:?}");
    }
}

/// Unused anchors are kept until guards have been pinned: a floating guard
/// may still be hung on one up to that boundary.
fn dead_anchor_removable(state: &GraphState) -> bool {
    state.is_after(StageSet::GUARDS_FIXED)
}

fn const_int_op(bits: u8, value: i64) -> Op {
    if bits == 32 {
        Op::ConstI32(value as i32)
    } else {
        Op::ConstI64(value)
    }
}

fn default_const(kind: ValKind) -> Op {
    match kind {
        ValKind::I32 => Op::ConstI32(0),
        ValKind::I64 => Op::ConstI64(0),
        ValKind::F32 => Op::ConstF32(0f32.to_bits()),
        ValKind::F64 => Op::ConstF64(0f64.to_bits()),
        ValKind::Ref => Op::ConstNull,
    }
}

fn float_arith_32(op: crate::ir::FloatArith, a: f32, b: f32) -> f32 {
    use crate::ir::FloatArith::*;
    match op {
        Add => a + b,
        Sub => a - b,
        Mul => a * b,
        Div => a / b,
    }
}

fn float_arith_64(op: crate::ir::FloatArith, a: f64, b: f64) -> f64 {
    use crate::ir::FloatArith::*;
    match op {
        Add => a + b,
        Sub => a - b,
        Mul => a * b,
        Div => a / b,
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::verify::verify;
    use crate::ir::{ClassId, CmpOp, DeoptReason, FieldId, GraphBuilder};
    use crate::opt::{CompileConfig, CompileStats};
    use opal_core::CancelToken;

    fn run_canonicalize(graph: &mut Graph) -> Result<CompileStats> {
        let config = CompileConfig::default();
        let cancel = CancelToken::new();
        let mut stats = CompileStats::default();
        let mut ctx = PhaseContext::new(&config, &cancel, &mut stats);
        Canonicalize.run(graph, &mut ctx)?;
        Ok(stats)
    }

    fn ret_value(graph: &Graph) -> NodeId {
        let mut ret = None;
        for id in graph.iter_kind(OpKind::Control) {
            if matches!(graph.op(id), Op::Return) {
                assert!(ret.is_none(), "more than one live return");
                ret = Some(graph.node(id).inputs.get(1).unwrap());
            }
        }
        ret.expect("no live return")
    }

    #[test]
    fn test_add_zero_is_identity() {
        let mut b = GraphBuilder::new();
        let p = b.param(0, ValKind::I32);
        let zero = b.const_i32(0);
        let sum = b.int_add(p, zero);
        b.ret(Some(sum));
        let mut g = b.finish();

        run_canonicalize(&mut g).unwrap();
        assert_eq!(ret_value(&g), p);
        assert!(g.is_dead(sum));
        assert!(verify(&g).is_ok(), "{:?}", verify(&g));
    }

    #[test]
    fn test_constant_operand_normalizes_right() {
        // 0 + x first swaps, then folds away.
        let mut b = GraphBuilder::new();
        let p = b.param(0, ValKind::I32);
        let zero = b.const_i32(0);
        let sum = b.int_arith(IntArith::Add, 32, zero, p);
        b.ret(Some(sum));
        let mut g = b.finish();

        run_canonicalize(&mut g).unwrap();
        assert_eq!(ret_value(&g), p);
    }

    #[test]
    fn test_constants_fold_through_stamps() {
        let mut b = GraphBuilder::new();
        let three = b.const_i32(3);
        let four = b.const_i32(4);
        let sum = b.int_add(three, four);
        b.ret(Some(sum));
        let mut g = b.finish();

        run_canonicalize(&mut g).unwrap();
        let v = ret_value(&g);
        assert!(matches!(g.op(v), Op::ConstI32(7)));
    }

    #[test]
    fn test_sub_self_folds_to_zero() {
        let mut b = GraphBuilder::new();
        let p = b.param(0, ValKind::I32);
        let d = b.int_sub(p, p);
        b.ret(Some(d));
        let mut g = b.finish();

        run_canonicalize(&mut g).unwrap();
        assert!(matches!(g.op(ret_value(&g)), Op::ConstI32(0)));
    }

    #[test]
    fn test_mul_zero_absorbs() {
        let mut b = GraphBuilder::new();
        let p = b.param(0, ValKind::I32);
        let zero = b.const_i32(0);
        let m = b.int_mul(p, zero);
        b.ret(Some(m));
        let mut g = b.finish();

        run_canonicalize(&mut g).unwrap();
        assert!(matches!(g.op(ret_value(&g)), Op::ConstI32(0)));
        // The parameter lost its last use and went with it.
        assert!(g.is_dead(p));
    }

    #[test]
    fn test_or_minus_one_absorbs() {
        // Full-width bit patterns stay symbolic in the int lattice, so
        // this exercises the rewrite rule rather than materialization.
        let mut b = GraphBuilder::new();
        let p = b.param(0, ValKind::I32);
        let all = b.const_i32(-1);
        let m = b.int_arith(IntArith::Or, 32, p, all);
        b.ret(Some(m));
        let mut g = b.finish();

        run_canonicalize(&mut g).unwrap();
        assert!(matches!(g.op(ret_value(&g)), Op::ConstI32(-1)));
    }

    #[test]
    fn test_masked_compare_folds_by_range() {
        // (p & 7) < 100 is always true.
        let mut b = GraphBuilder::new();
        let p = b.param(0, ValKind::I32);
        let seven = b.const_i32(7);
        let hundred = b.const_i32(100);
        let masked = b.int_arith(IntArith::And, 32, p, seven);
        let cmp = b.int_cmp(CmpOp::Lt, masked, hundred);
        b.ret(Some(cmp));
        let mut g = b.finish();

        run_canonicalize(&mut g).unwrap();
        assert!(matches!(g.op(ret_value(&g)), Op::ConstI32(1)));
    }

    #[test]
    fn test_constant_branch_collapses() {
        // if (true) return 1 else return 2  =>  return 1
        let mut b = GraphBuilder::new();
        let t = b.const_bool(true);
        let (tp, fp) = b.branch(t);
        let mem = b.graph().start;
        b.seek(tp, mem);
        let one = b.const_i32(1);
        b.ret(Some(one));
        b.seek(fp, mem);
        let two = b.const_i32(2);
        b.ret(Some(two));
        let mut g = b.finish();

        let stats = run_canonicalize(&mut g).unwrap();
        assert_eq!(stats.branches_collapsed, 1);
        assert!(verify(&g).is_ok(), "{:?}", verify(&g));
        assert!(matches!(g.op(ret_value(&g)), Op::ConstI32(1)));
        // A single exit remains.
        assert_eq!(g.node(g.end).inputs.len(), 1);
    }

    #[test]
    fn test_constant_branch_with_phi_collapses_to_arm_value() {
        let mut b = GraphBuilder::new();
        let t = b.const_bool(false);
        let (tp, fp) = b.branch(t);
        let mem = b.graph().start;
        b.seek(tp, mem);
        let t_exit = b.tail();
        b.seek(fp, mem);
        let f_exit = b.tail();
        let region = b.merge(&[t_exit, f_exit]);
        let one = b.const_i32(1);
        let two = b.const_i32(2);
        let phi = b.phi(region, ValKind::I32, &[one, two]);
        b.ret(Some(phi));
        let mut g = b.finish();

        run_canonicalize(&mut g).unwrap();
        assert!(verify(&g).is_ok(), "{:?}", verify(&g));
        assert!(matches!(g.op(ret_value(&g)), Op::ConstI32(2)));
    }

    #[test]
    fn test_store_to_load_forwarding() {
        let mut b = GraphBuilder::new();
        let obj = b.param(0, ValKind::Ref);
        let v = b.param(1, ValKind::I32);
        b.store_field(obj, FieldId(0), v);
        let loaded = b.load_field(obj, FieldId(0), ValKind::I32);
        b.ret(Some(loaded));
        let mut g = b.finish();

        let stats = run_canonicalize(&mut g).unwrap();
        assert_eq!(stats.loads_forwarded, 1);
        assert_eq!(ret_value(&g), v);
        assert!(verify(&g).is_ok(), "{:?}", verify(&g));
    }

    #[test]
    fn test_load_hops_disjoint_store() {
        let mut b = GraphBuilder::new();
        let obj = b.param(0, ValKind::Ref);
        let v = b.param(1, ValKind::I32);
        let early = b.load_field(obj, FieldId(1), ValKind::I32);
        b.store_field(obj, FieldId(0), v);
        let late = b.load_field(obj, FieldId(1), ValKind::I32);
        let sum = b.int_add(early, late);
        b.ret(Some(sum));
        let mut g = b.finish();

        run_canonicalize(&mut g).unwrap();
        // The second load's memory input walked past the unrelated store
        // back to the entry state.
        assert!(!g.is_dead(late));
        let slot = g.op(late).memory_input().unwrap();
        assert_eq!(g.node(late).inputs.get(slot), Some(g.start));
    }

    #[test]
    fn test_load_of_fresh_field_is_default() {
        let mut b = GraphBuilder::new();
        let obj = b.new_object(ClassId(3), 2);
        let loaded = b.load_field(obj, FieldId(1), ValKind::I32);
        b.ret(Some(loaded));
        let mut g = b.finish();

        run_canonicalize(&mut g).unwrap();
        assert!(matches!(g.op(ret_value(&g)), Op::ConstI32(0)));
        assert!(verify(&g).is_ok(), "{:?}", verify(&g));
    }

    #[test]
    fn test_fresh_array_load_keeps_bounds_trap() {
        let mut b = GraphBuilder::new();
        let idx = b.param(0, ValKind::I32);
        let len = b.const_i32(4);
        let arr = b.new_array(ClassId(7), ValKind::I32, len);
        let loaded = b.load_index(arr, idx, ValKind::I32);
        b.ret(Some(loaded));
        let mut g = b.finish();

        run_canonicalize(&mut g).unwrap();
        // The load may trap on a bad index, so it must survive.
        assert!(!g.is_dead(loaded));
        assert_eq!(ret_value(&g), loaded);
    }

    #[test]
    fn test_unbox_of_box_forwards() {
        let mut b = GraphBuilder::new();
        let p = b.param(0, ValKind::I64);
        let boxed = b.new_box(ClassId(1), ValKind::I64, p);
        let v = b.unbox(ValKind::I64, boxed);
        b.ret(Some(v));
        let mut g = b.finish();

        run_canonicalize(&mut g).unwrap();
        assert_eq!(ret_value(&g), p);
        assert!(verify(&g).is_ok(), "{:?}", verify(&g));
    }

    #[test]
    fn test_overwritten_store_is_removed() {
        let mut b = GraphBuilder::new();
        let obj = b.param(0, ValKind::Ref);
        let first = b.param(1, ValKind::I32);
        let second = b.param(2, ValKind::I32);
        let s1 = b.store_field(obj, FieldId(0), first);
        let s2 = b.store_field(obj, FieldId(0), second);
        b.ret(None);
        let mut g = b.finish();

        run_canonicalize(&mut g).unwrap();
        assert!(g.is_dead(s1));
        assert!(!g.is_dead(s2));
        assert!(verify(&g).is_ok(), "{:?}", verify(&g));
    }

    #[test]
    fn test_observed_store_is_kept() {
        // A load between the two stores may observe the first one: the
        // two objects are not provably distinct.
        let mut b = GraphBuilder::new();
        let obj = b.param(0, ValKind::Ref);
        let other = b.param(1, ValKind::Ref);
        let first = b.param(2, ValKind::I32);
        let second = b.param(3, ValKind::I32);
        let s1 = b.store_field(obj, FieldId(0), first);
        let observed = b.load_field(other, FieldId(0), ValKind::I32);
        let _s2 = b.store_field(obj, FieldId(0), second);
        b.ret(Some(observed));
        let mut g = b.finish();

        run_canonicalize(&mut g).unwrap();
        assert!(!g.is_dead(s1));
    }

    #[test]
    fn test_true_guard_is_removed() {
        let mut b = GraphBuilder::new();
        let p = b.param(0, ValKind::I32);
        let t = b.const_bool(true);
        let anchor = b.anchor();
        let guard = b.guard(t, DeoptReason::NullCheck, anchor);
        b.ret(Some(p));
        let mut g = b.finish();

        run_canonicalize(&mut g).unwrap();
        assert!(g.is_dead(guard));
        // The anchor stays: guards are not pinned yet.
        assert!(!g.is_dead(anchor));
    }

    #[test]
    fn test_dead_anchor_survives_until_guards_fixed() {
        let mut b = GraphBuilder::new();
        let p = b.param(0, ValKind::I32);
        let anchor = b.anchor();
        b.ret(Some(p));
        let mut g = b.finish();

        run_canonicalize(&mut g).unwrap();
        assert!(!g.is_dead(anchor), "anchor removed before guards were pinned");

        g.state.mark(StageSet::GUARDS_FIXED);
        run_canonicalize(&mut g).unwrap();
        assert!(g.is_dead(anchor));
        assert!(verify(&g).is_ok(), "{:?}", verify(&g));
    }

    #[test]
    fn test_canonicalize_is_idempotent() {
        let mut b = GraphBuilder::new();
        let p = b.param(0, ValKind::I32);
        let zero = b.const_i32(0);
        let three = b.const_i32(3);
        let four = b.const_i32(4);
        let sum = b.int_add(p, zero);
        let c = b.int_add(three, four);
        let both = b.int_add(sum, c);
        b.ret(Some(both));
        let mut g = b.finish();

        run_canonicalize(&mut g).unwrap();
        let edits_after_first = g.edit_count();
        run_canonicalize(&mut g).unwrap();
        assert_eq!(g.edit_count(), edits_after_first);
    }

    #[test]
    fn test_step_budget_is_enforced() {
        let mut b = GraphBuilder::new();
        let p = b.param(0, ValKind::I32);
        let mut acc = p;
        for i in 0..16 {
            let c = b.const_i32(i);
            acc = b.int_add(acc, c);
        }
        b.ret(Some(acc));
        let mut g = b.finish();

        let config = CompileConfig {
            canonicalize_budget_factor: 0,
            canonicalize_budget_base: 3,
            ..CompileConfig::default()
        };
        let cancel = CancelToken::new();
        let mut stats = CompileStats::default();
        let mut ctx = PhaseContext::new(&config, &cancel, &mut stats);
        let err = Canonicalize.run(&mut g, &mut ctx).unwrap_err();
        assert!(matches!(err, CompileError::FixpointExceeded { .. }));
    }

    #[test]
    fn test_cancellation_stops_the_worklist() {
        let mut b = GraphBuilder::new();
        let p = b.param(0, ValKind::I32);
        let zero = b.const_i32(0);
        let sum = b.int_add(p, zero);
        b.ret(Some(sum));
        let mut g = b.finish();

        let config = CompileConfig::default();
        let cancel = CancelToken::new();
        cancel.cancel();
        let mut stats = CompileStats::default();
        let mut ctx = PhaseContext::new(&config, &cancel, &mut stats);
        let err = Canonicalize.run(&mut g, &mut ctx).unwrap_err();
        assert!(matches!(err, CompileError::Cancelled));
    }

    #[test]
    fn test_array_length_of_fresh_array_folds() {
        let mut b = GraphBuilder::new();
        let len = b.param(0, ValKind::I32);
        let arr = b.new_array(ClassId(3), ValKind::I32, len);
        let l = b.array_length(arr);
        b.ret(Some(l));
        let mut g = b.finish();

        run_canonicalize(&mut g).unwrap();
        assert_eq!(ret_value(&g), len);
        assert!(g.is_dead(l));
    }

    #[test]
    fn test_instance_of_folds_from_ref_stamps() {
        // Exact classes are known for fresh allocations and null.
        let mut b = GraphBuilder::new();
        let obj = b.new_object(ClassId(5), 1);
        let null = b.const_null();
        let yes = b.instance_of(ClassId(5), obj);
        let no = b.instance_of(ClassId(6), obj);
        let on_null = b.instance_of(ClassId(5), null);
        let a = b.int_add(yes, no);
        let sum = b.int_add(a, on_null);
        b.ret(Some(sum));
        let mut g = b.finish();

        run_canonicalize(&mut g).unwrap();
        assert!(matches!(g.op(ret_value(&g)), Op::ConstI32(1)));
    }

    #[test]
    fn test_ref_identity_folds_on_nulls_and_fresh_allocs() {
        let mut b = GraphBuilder::new();
        let p = b.param(0, ValKind::Ref);
        let x = b.new_object(ClassId(5), 1);
        let y = b.new_object(ClassId(5), 1);
        let null = b.const_null();
        let distinct = b.ref_eq(x, y);
        let fresh_vs_null = b.ref_eq(x, null);
        let unknown = b.ref_eq(p, null);
        let a = b.int_add(distinct, fresh_vs_null);
        let sum = b.int_add(a, unknown);
        b.ret(Some(sum));
        let mut g = b.finish();

        run_canonicalize(&mut g).unwrap();
        // The two known comparisons fold to 0 and both adds collapse,
        // leaving only the comparison against the unknown parameter.
        assert_eq!(ret_value(&g), unknown);
        assert!(matches!(g.op(unknown), Op::RefEq));
        assert!(g.is_dead(distinct));
        assert!(g.is_dead(fresh_vs_null));
    }
}
