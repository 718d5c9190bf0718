//! Programmatic graph construction.
//!
//! The frontend lowers bytecode through this interface; tests use it to
//! set up graph shapes directly. The builder tracks two cursors while
//! appending fixed nodes:
//!
//! - **Control tail**: the fixed node new chain nodes hang off
//! - **Memory tail**: the last memory-state producer on the current path
//!
//! Splits leave both arms starting from the split's tails; [`GraphBuilder::merge`]
//! joins arms back together, inserting a memory phi when the arms saw
//! different memory states. Loops thread their memory through a loop
//! memory phi created with the header.

use rustc_hash::FxHashMap;

use opal_core::SourcePos;

use super::graph::Graph;
use super::node::{
    CmpOp, ConvertOp, DeoptReason, FieldId, FloatArith, IntArith, MethodId, NodeId, Op,
};
use super::stamp::{ClassId, ValKind};

/// A finished arm of a control split: where its control ended and what
/// memory state it carried.
#[derive(Debug, Clone, Copy)]
pub struct Exit {
    pub control: NodeId,
    pub memory: NodeId,
}

/// Incremental graph constructor with control and memory cursors.
pub struct GraphBuilder {
    graph: Graph,
    control: NodeId,
    memory: NodeId,
    /// Loop header -> its memory phi, so back edges can complete it.
    loop_memory: FxHashMap<NodeId, NodeId>,
}

impl GraphBuilder {
    pub fn new() -> GraphBuilder {
        let graph = Graph::new();
        let start = graph.start;
        GraphBuilder {
            graph,
            control: start,
            memory: start,
            loop_memory: FxHashMap::default(),
        }
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn graph_mut(&mut self) -> &mut Graph {
        &mut self.graph
    }

    /// Hand over the finished graph.
    pub fn finish(self) -> Graph {
        self.graph
    }

    /// Source position stamped on nodes created from here on.
    pub fn at_pos(&mut self, pos: SourcePos) -> &mut Self {
        self.graph.set_pos(pos);
        self
    }

    /// Current control and memory cursors.
    pub fn tail(&self) -> Exit {
        Exit {
            control: self.control,
            memory: self.memory,
        }
    }

    /// Continue appending at the given cursors (after a split arm).
    pub fn seek(&mut self, control: NodeId, memory: NodeId) {
        self.control = control;
        self.memory = memory;
    }

    // =========================================================================
    // Pure values
    // =========================================================================

    pub fn param(&mut self, index: u16, kind: ValKind) -> NodeId {
        self.graph.add(Op::Parameter { index, kind }, &[])
    }

    pub fn const_i32(&mut self, v: i32) -> NodeId {
        self.graph.const_i32(v)
    }

    pub fn const_i64(&mut self, v: i64) -> NodeId {
        self.graph.const_i64(v)
    }

    pub fn const_f64(&mut self, v: f64) -> NodeId {
        self.graph.const_f64(v)
    }

    pub fn const_null(&mut self) -> NodeId {
        self.graph.const_null()
    }

    pub fn const_bool(&mut self, v: bool) -> NodeId {
        self.graph.const_bool(v)
    }

    pub fn int_arith(&mut self, op: IntArith, bits: u8, a: NodeId, b: NodeId) -> NodeId {
        self.graph.add(Op::IntOp { op, bits }, &[a, b])
    }

    pub fn int_add(&mut self, a: NodeId, b: NodeId) -> NodeId {
        self.int_arith(IntArith::Add, 32, a, b)
    }

    pub fn int_sub(&mut self, a: NodeId, b: NodeId) -> NodeId {
        self.int_arith(IntArith::Sub, 32, a, b)
    }

    pub fn int_mul(&mut self, a: NodeId, b: NodeId) -> NodeId {
        self.int_arith(IntArith::Mul, 32, a, b)
    }

    pub fn int_cmp(&mut self, op: CmpOp, a: NodeId, b: NodeId) -> NodeId {
        self.graph.add(Op::IntCmp { op, bits: 32 }, &[a, b])
    }

    pub fn float_arith(&mut self, op: FloatArith, bits: u8, a: NodeId, b: NodeId) -> NodeId {
        self.graph.add(Op::FloatOp { op, bits }, &[a, b])
    }

    pub fn convert(&mut self, op: ConvertOp, value: NodeId) -> NodeId {
        self.graph.add(Op::Convert(op), &[value])
    }

    pub fn ref_eq(&mut self, a: NodeId, b: NodeId) -> NodeId {
        self.graph.add(Op::RefEq, &[a, b])
    }

    pub fn instance_of(&mut self, class: ClassId, obj: NodeId) -> NodeId {
        self.graph.add(Op::InstanceOf(class), &[obj])
    }

    pub fn array_length(&mut self, array: NodeId) -> NodeId {
        self.graph.add(Op::ArrayLength, &[array])
    }

    // =========================================================================
    // Memory accesses and allocation
    // =========================================================================

    pub fn load_field(&mut self, object: NodeId, field: FieldId, kind: ValKind) -> NodeId {
        let n = self.graph.add(
            Op::LoadField { field, kind },
            &[self.control, object, self.memory],
        );
        self.control = n;
        n
    }

    pub fn store_field(&mut self, object: NodeId, field: FieldId, value: NodeId) -> NodeId {
        let n = self.graph.add(
            Op::StoreField { field },
            &[self.control, object, value, self.memory],
        );
        self.control = n;
        self.memory = n;
        n
    }

    pub fn load_index(&mut self, array: NodeId, index: NodeId, elem: ValKind) -> NodeId {
        let n = self.graph.add(
            Op::LoadIndex { elem },
            &[self.control, array, index, self.memory],
        );
        self.control = n;
        n
    }

    pub fn store_index(&mut self, array: NodeId, index: NodeId, value: NodeId, elem: ValKind) -> NodeId {
        let n = self.graph.add(
            Op::StoreIndex { elem },
            &[self.control, array, index, value, self.memory],
        );
        self.control = n;
        self.memory = n;
        n
    }

    pub fn new_object(&mut self, class: ClassId, fields: u16) -> NodeId {
        let n = self
            .graph
            .add(Op::New { class, fields }, &[self.control, self.memory]);
        self.control = n;
        self.memory = n;
        n
    }

    pub fn new_array(&mut self, class: ClassId, elem: ValKind, length: NodeId) -> NodeId {
        let n = self.graph.add(
            Op::NewArray { class, elem },
            &[self.control, length, self.memory],
        );
        self.control = n;
        self.memory = n;
        n
    }

    pub fn new_box(&mut self, class: ClassId, kind: ValKind, value: NodeId) -> NodeId {
        let n = self.graph.add(
            Op::NewBox { class, kind },
            &[self.control, value, self.memory],
        );
        self.control = n;
        self.memory = n;
        n
    }

    pub fn unbox(&mut self, kind: ValKind, boxed: NodeId) -> NodeId {
        let n = self
            .graph
            .add(Op::Unbox { kind }, &[self.control, boxed, self.memory]);
        self.control = n;
        n
    }

    pub fn call(&mut self, target: MethodId, returns: Option<ValKind>, args: &[NodeId]) -> NodeId {
        let mut inputs = vec![self.control, self.memory];
        inputs.extend_from_slice(args);
        let n = self.graph.add(Op::Call { target, returns }, &inputs);
        self.control = n;
        self.memory = n;
        n
    }

    pub fn anchor(&mut self) -> NodeId {
        let n = self.graph.add(Op::Anchor, &[self.control]);
        self.control = n;
        n
    }

    pub fn guard(&mut self, condition: NodeId, reason: DeoptReason, anchor: NodeId) -> NodeId {
        self.graph.add(Op::Guard { reason }, &[condition, anchor])
    }

    // =========================================================================
    // Control flow
    // =========================================================================

    /// Split control on `condition`. Returns the true and false
    /// projections; both arms inherit the current memory state. Use
    /// [`GraphBuilder::seek`] to continue building inside an arm.
    pub fn branch(&mut self, condition: NodeId) -> (NodeId, NodeId) {
        let iff = self.graph.add(Op::If, &[self.control, condition]);
        let t = self.graph.add(Op::Proj { index: 0 }, &[iff]);
        let f = self.graph.add(Op::Proj { index: 1 }, &[iff]);
        self.control = NodeId::INVALID;
        (t, f)
    }

    /// Join finished arms. Creates the region, merges memory (inserting a
    /// memory phi only when the arms' states differ), and leaves the
    /// cursors at the join.
    pub fn merge(&mut self, exits: &[Exit]) -> NodeId {
        opal_core::guarantee!(exits.len() >= 2, "merge of fewer than two arms");
        let preds: Vec<NodeId> = exits.iter().map(|e| e.control).collect();
        let region = self.graph.add(Op::Region, &preds);
        let first_mem = exits[0].memory;
        let memory = if exits.iter().all(|e| e.memory == first_mem) {
            first_mem
        } else {
            let mut inputs = vec![region];
            inputs.extend(exits.iter().map(|e| e.memory));
            self.graph.add(Op::MemoryPhi, &inputs)
        };
        self.control = region;
        self.memory = memory;
        region
    }

    /// Value phi at a merge point; operand order matches the merge's arm
    /// order.
    pub fn phi(&mut self, region: NodeId, kind: ValKind, values: &[NodeId]) -> NodeId {
        let mut inputs = vec![region];
        inputs.extend_from_slice(values);
        self.graph.add(Op::Phi { kind }, &inputs)
    }

    /// Open a loop: the current control becomes the loop entry. Control
    /// continues at the header, memory through the header's memory phi.
    pub fn loop_begin(&mut self) -> NodeId {
        let header = self.graph.add(Op::LoopBegin, &[self.control]);
        let mphi = self.graph.add(Op::MemoryPhi, &[header, self.memory]);
        self.loop_memory.insert(header, mphi);
        self.control = header;
        self.memory = mphi;
        header
    }

    /// Loop-carried value: `init` flows in from the entry, back-edge
    /// operands are added by [`GraphBuilder::seal_loop_phi`].
    pub fn loop_phi(&mut self, header: NodeId, kind: ValKind, init: NodeId) -> NodeId {
        self.graph.add(Op::Phi { kind }, &[header, init])
    }

    /// Close the current path as a back edge of `header`. Appends the back
    /// edge to the header and the current memory to its memory phi.
    pub fn loop_end(&mut self, header: NodeId) -> NodeId {
        let le = self.graph.add(Op::LoopEnd, &[self.control, header]);
        self.graph.add_input(header, le);
        let mphi = self.loop_memory[&header];
        let mem = self.memory;
        self.graph.add_input(mphi, mem);
        self.control = NodeId::INVALID;
        le
    }

    /// Complete a loop phi with its back-edge value. Must be called once
    /// per [`GraphBuilder::loop_end`], in back-edge order. The phi's stamp
    /// goes back to unrestricted: its back-edge operands depend on the phi
    /// itself, so anything narrower would be circular.
    pub fn seal_loop_phi(&mut self, phi: NodeId, back_value: NodeId) {
        self.graph.add_input(phi, back_value);
        let kind = match *self.graph.op(phi) {
            Op::Phi { kind } => kind,
            _ => opal_core::graph_bug!("seal_loop_phi on non-phi {phi:?}"),
        };
        self.graph.set_stamp(phi, kind.unrestricted());
        self.graph.propagate_stamps_from(phi);
    }

    /// Return from the method; wires the exit into the end node.
    pub fn ret(&mut self, value: Option<NodeId>) -> NodeId {
        let node = match value {
            Some(v) => self.graph.add(Op::Return, &[self.control, v]),
            None => self.graph.add(Op::Return, &[self.control]),
        };
        let end = self.graph.end;
        self.graph.add_input(end, node);
        self.control = NodeId::INVALID;
        node
    }

    pub fn throw(&mut self, exception: NodeId) -> NodeId {
        let node = self.graph.add(Op::Throw, &[self.control, exception]);
        let end = self.graph.end;
        self.graph.add_input(end, node);
        self.control = NodeId::INVALID;
        node
    }

    pub fn deopt(&mut self, reason: DeoptReason) -> NodeId {
        let node = self.graph.add(Op::Deopt { reason }, &[self.control]);
        let end = self.graph.end;
        self.graph.add_input(end, node);
        self.control = NodeId::INVALID;
        node
    }
}

impl Default for GraphBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
