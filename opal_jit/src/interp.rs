//! Reference graph executor.
//!
//! Runs a graph directly against a model heap, with the plain unoptimized
//! semantics of every operation. Differential tests execute the same input
//! before and after a phase and compare outcomes; stamp checks compare
//! observed values against node stamps.
//!
//! The executor walks the fixed control chain and evaluates floating nodes
//! on demand. Memory edges carry no runtime meaning here (the heap is
//! real); they only order the optimizer.
//!
//! Opaque calls are modeled as pure, handle-derived results with no heap
//! effect. The optimizer never assumes anything about call behavior, so
//! both sides of a differential run observe identical call results.

use rustc_hash::FxHashMap;

use crate::ir::{
    CmpOp, ConvertOp, DeoptReason, Graph, IntArith, MethodId, NodeId, Op, ValKind,
};
use crate::ir::stamp::ClassId;

/// Runtime value. References index the model heap.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    Ref(usize),
    Null,
}

impl Value {
    pub fn default_of(kind: ValKind) -> Value {
        match kind {
            ValKind::I32 => Value::I32(0),
            ValKind::I64 => Value::I64(0),
            ValKind::F32 => Value::F32(0.0),
            ValKind::F64 => Value::F64(0.0),
            ValKind::Ref => Value::Null,
        }
    }

    /// Uninitialized fields read back as the zero of the access kind.
    fn coerce_default(self, kind: ValKind) -> Value {
        match self {
            Value::Null if kind != ValKind::Ref => Value::default_of(kind),
            v => v,
        }
    }

    /// Equality with NaN compared by bits, for differential runs.
    pub fn bits_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::F32(a), Value::F32(b)) => a.to_bits() == b.to_bits(),
            (Value::F64(a), Value::F64(b)) => a.to_bits() == b.to_bits(),
            (a, b) => a == b,
        }
    }
}

// =============================================================================
// Heap model
// =============================================================================

#[derive(Debug, Clone)]
enum HeapData {
    Object(Vec<Value>),
    Array(Vec<Value>),
    Box(Value),
}

#[derive(Debug, Clone)]
struct HeapObj {
    class: ClassId,
    data: HeapData,
}

/// Flat object store; `Value::Ref` indexes into it.
#[derive(Debug, Default)]
pub struct Heap {
    objects: Vec<HeapObj>,
}

impl Heap {
    pub fn new() -> Heap {
        Heap::default()
    }

    pub fn alloc_object(&mut self, class: ClassId, fields: usize) -> Value {
        self.objects.push(HeapObj {
            class,
            data: HeapData::Object(vec![Value::Null; fields]),
        });
        Value::Ref(self.objects.len() - 1)
    }

    pub fn alloc_array(&mut self, class: ClassId, len: usize, elem: ValKind) -> Value {
        self.objects.push(HeapObj {
            class,
            data: HeapData::Array(vec![Value::default_of(elem); len]),
        });
        Value::Ref(self.objects.len() - 1)
    }

    pub fn alloc_box(&mut self, class: ClassId, value: Value) -> Value {
        self.objects.push(HeapObj {
            class,
            data: HeapData::Box(value),
        });
        Value::Ref(self.objects.len() - 1)
    }
}

// =============================================================================
// Outcomes
// =============================================================================

/// VM-level traps the optimizer must preserve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trap {
    NullDeref,
    OutOfBounds,
}

/// How an execution finished.
#[derive(Debug, Clone, Copy)]
pub enum Outcome {
    Returned(Option<Value>),
    Threw(Value),
    Deopted(DeoptReason),
    Trapped(Trap),
}

impl Outcome {
    /// Outcome equivalence for differential runs. The middle-end only
    /// keeps deopts the source graph already had, so outcomes must match
    /// exactly, deoptimizations included.
    pub fn same_as(&self, other: &Outcome) -> bool {
        match (self, other) {
            (Outcome::Returned(a), Outcome::Returned(b)) => match (a, b) {
                (Some(a), Some(b)) => a.bits_eq(b),
                (None, None) => true,
                _ => false,
            },
            (Outcome::Threw(a), Outcome::Threw(b)) => a.bits_eq(b),
            (Outcome::Deopted(a), Outcome::Deopted(b)) => a == b,
            (Outcome::Trapped(a), Outcome::Trapped(b)) => a == b,
            _ => false,
        }
    }
}

// =============================================================================
// Executor
// =============================================================================

enum Step {
    Continue(NodeId),
    Done(Outcome),
}

/// One execution of a graph.
pub struct Interp<'g> {
    graph: &'g Graph,
    pub heap: Heap,
    params: Vec<Value>,
    /// Current values of loop and merge phis.
    phi_values: FxHashMap<NodeId, Value>,
    /// Most recent result of each executed fixed value producer.
    fixed_values: FxHashMap<NodeId, Value>,
    max_steps: u64,
}

impl<'g> Interp<'g> {
    pub fn new(graph: &'g Graph) -> Interp<'g> {
        Interp {
            graph,
            heap: Heap::new(),
            params: Vec::new(),
            phi_values: FxHashMap::default(),
            fixed_values: FxHashMap::default(),
            max_steps: 200_000,
        }
    }

    pub fn with_max_steps(mut self, max_steps: u64) -> Self {
        self.max_steps = max_steps;
        self
    }

    /// Execute from start to an exit. Errors mean a malformed graph or an
    /// exhausted step budget, never a legitimate program outcome.
    pub fn run(&mut self, params: &[Value]) -> Result<Outcome, String> {
        self.params = params.to_vec();
        self.phi_values.clear();
        self.fixed_values.clear();

        let mut cur = self.graph.start;
        let mut steps = 0u64;
        loop {
            steps += 1;
            if steps > self.max_steps {
                return Err(format!("step budget exhausted after {steps} steps"));
            }
            match self.step(cur)? {
                Step::Continue(next) => cur = next,
                Step::Done(outcome) => return Ok(outcome),
            }
        }
    }

    fn step(&mut self, cur: NodeId) -> Result<Step, String> {
        let op = *self.graph.op(cur);
        match op {
            Op::Start | Op::Region | Op::LoopBegin | Op::Proj { .. } => {}
            Op::Anchor => {}

            Op::LoadField { field, kind } => {
                let obj = self.eval(self.input(cur, 1)?)?;
                match self.read_field(obj, field.0 as usize)? {
                    Ok(v) => {
                        self.fixed_values.insert(cur, v.coerce_default(kind));
                    }
                    Err(trap) => return Ok(Step::Done(Outcome::Trapped(trap))),
                }
            }
            Op::StoreField { field } => {
                let obj = self.eval(self.input(cur, 1)?)?;
                let value = self.eval(self.input(cur, 2)?)?;
                if let Err(trap) = self.write_field(obj, field.0 as usize, value)? {
                    return Ok(Step::Done(Outcome::Trapped(trap)));
                }
            }
            Op::LoadIndex { elem } => {
                let arr = self.eval(self.input(cur, 1)?)?;
                let idx = self.eval(self.input(cur, 2)?)?;
                match self.read_index(arr, idx)? {
                    Ok(v) => {
                        self.fixed_values.insert(cur, v.coerce_default(elem));
                    }
                    Err(trap) => return Ok(Step::Done(Outcome::Trapped(trap))),
                }
            }
            Op::StoreIndex { .. } => {
                let arr = self.eval(self.input(cur, 1)?)?;
                let idx = self.eval(self.input(cur, 2)?)?;
                let value = self.eval(self.input(cur, 3)?)?;
                if let Err(trap) = self.write_index(arr, idx, value)? {
                    return Ok(Step::Done(Outcome::Trapped(trap)));
                }
            }

            Op::New { class, fields } => {
                let v = self.heap.alloc_object(class, fields as usize);
                self.fixed_values.insert(cur, v);
            }
            Op::NewArray { class, elem } => {
                let len = self.eval(self.input(cur, 1)?)?;
                let Value::I32(len) = len else {
                    return Err(format!("{cur:?}: non-i32 array length"));
                };
                if len < 0 {
                    return Ok(Step::Done(Outcome::Trapped(Trap::OutOfBounds)));
                }
                let v = self.heap.alloc_array(class, len as usize, elem);
                self.fixed_values.insert(cur, v);
            }
            Op::NewBox { class, .. } => {
                let value = self.eval(self.input(cur, 1)?)?;
                let v = self.heap.alloc_box(class, value);
                self.fixed_values.insert(cur, v);
            }
            Op::Unbox { kind } => {
                let boxed = self.eval(self.input(cur, 1)?)?;
                match boxed {
                    Value::Null => return Ok(Step::Done(Outcome::Trapped(Trap::NullDeref))),
                    Value::Ref(h) => match &self.heap.objects[h].data {
                        HeapData::Box(v) => {
                            let v = v.coerce_default(kind);
                            self.fixed_values.insert(cur, v);
                        }
                        _ => return Err(format!("{cur:?}: unbox of non-box")),
                    },
                    _ => return Err(format!("{cur:?}: unbox of primitive")),
                }
            }

            Op::Call { target, returns } => {
                if let Some(kind) = returns {
                    self.fixed_values.insert(cur, Self::call_result(target, kind));
                }
            }

            Op::If => {
                let cond = self.eval(self.input(cur, 1)?)?;
                let taken = !matches!(cond, Value::I32(0));
                let want = if taken { 0u8 } else { 1u8 };
                for &user in self.graph.uses(cur) {
                    if let Op::Proj { index } = self.graph.op(user) {
                        if *index == want && self.graph.node(user).inputs.get(0) == Some(cur) {
                            return Ok(Step::Continue(user));
                        }
                    }
                }
                return Err(format!("{cur:?}: if without projection {want}"));
            }
            Op::LoopEnd => {
                let header = self
                    .input(cur, 1)
                    .map_err(|e| format!("loop end without header: {e}"))?;
                let pred = self.pred_index(header, cur)?;
                self.commit_phis(header, pred)?;
                return Ok(Step::Continue(header));
            }

            Op::Return => {
                let value = match self.graph.node(cur).inputs.get(1) {
                    Some(v) => Some(self.eval(v)?),
                    None => None,
                };
                return Ok(Step::Done(Outcome::Returned(value)));
            }
            Op::Throw => {
                let exc = self.eval(self.input(cur, 1)?)?;
                return Ok(Step::Done(Outcome::Threw(exc)));
            }
            Op::Deopt { reason } => {
                return Ok(Step::Done(Outcome::Deopted(reason)));
            }
            Op::End => return Err("control reached the end sink".into()),

            other => {
                return Err(format!("{cur:?}: {} is not a control-chain node", other.mnemonic()))
            }
        }

        // Floating guards fire at the node they are anchored to.
        if let Some(outcome) = self.run_guards(cur)? {
            return Ok(Step::Done(outcome));
        }

        self.advance(cur)
    }

    /// Follow the unique control successor, committing phis when entering
    /// a merge.
    fn advance(&mut self, cur: NodeId) -> Result<Step, String> {
        let succs = self.graph.control_successors(cur);
        if succs.len() != 1 {
            return Err(format!(
                "{cur:?}: expected one control successor, found {}",
                succs.len()
            ));
        }
        let next = succs[0];
        if matches!(self.graph.op(next), Op::Region | Op::LoopBegin) {
            let pred = self.pred_index(next, cur)?;
            self.commit_phis(next, pred)?;
        }
        Ok(Step::Continue(next))
    }

    fn pred_index(&self, merge: NodeId, pred: NodeId) -> Result<usize, String> {
        let inputs = &self.graph.node(merge).inputs;
        for i in 0..inputs.len() {
            if inputs.get(i) == Some(pred) {
                return Ok(i);
            }
        }
        Err(format!("{pred:?} is not a predecessor of {merge:?}"))
    }

    /// Evaluate all phi operands for predecessor `pred` against the old
    /// environment, then commit simultaneously.
    fn commit_phis(&mut self, merge: NodeId, pred: usize) -> Result<(), String> {
        let mut phis: Vec<NodeId> = self
            .graph
            .uses(merge)
            .iter()
            .copied()
            .filter(|&u| {
                matches!(self.graph.op(u), Op::Phi { .. })
                    && self.graph.node(u).inputs.get(0) == Some(merge)
            })
            .collect();
        phis.sort_unstable();
        phis.dedup();

        let mut staged = Vec::with_capacity(phis.len());
        for phi in phis {
            let operand = self
                .graph
                .node(phi)
                .inputs
                .get(pred + 1)
                .ok_or_else(|| format!("{phi:?}: missing operand for predecessor {pred}"))?;
            staged.push((phi, self.eval(operand)?));
        }
        for (phi, value) in staged {
            self.phi_values.insert(phi, value);
        }
        Ok(())
    }

    fn run_guards(&mut self, anchor: NodeId) -> Result<Option<Outcome>, String> {
        let mut guards: Vec<NodeId> = self
            .graph
            .uses(anchor)
            .iter()
            .copied()
            .filter(|&u| {
                matches!(self.graph.op(u), Op::Guard { .. })
                    && self.graph.node(u).inputs.get(1) == Some(anchor)
            })
            .collect();
        guards.sort_unstable();
        for guard in guards {
            let cond = self.eval(self.input(guard, 0)?)?;
            if matches!(cond, Value::I32(0)) {
                let Op::Guard { reason } = self.graph.op(guard) else {
                    unreachable!()
                };
                return Ok(Some(Outcome::Deopted(*reason)));
            }
        }
        Ok(None)
    }

    fn input(&self, node: NodeId, index: usize) -> Result<NodeId, String> {
        self.graph
            .node(node)
            .inputs
            .get(index)
            .ok_or_else(|| format!("{node:?}: missing input {index}"))
    }

    fn call_result(target: MethodId, kind: ValKind) -> Value {
        let h = (target.0 as u64).wrapping_mul(0x9E37_79B9).wrapping_add(17);
        match kind {
            ValKind::I32 => Value::I32(h as i32),
            ValKind::I64 => Value::I64(h as i64),
            ValKind::F32 => Value::F32(h as f32),
            ValKind::F64 => Value::F64(h as f64),
            ValKind::Ref => Value::Null,
        }
    }

    // =========================================================================
    // Heap access
    // =========================================================================

    fn read_field(&self, obj: Value, field: usize) -> Result<Result<Value, Trap>, String> {
        match obj {
            Value::Null => Ok(Err(Trap::NullDeref)),
            Value::Ref(h) => match &self.heap.objects[h].data {
                HeapData::Object(fields) => fields
                    .get(field)
                    .copied()
                    .map(Ok)
                    .ok_or_else(|| format!("field {field} out of layout")),
                HeapData::Box(v) if field == 0 => Ok(Ok(*v)),
                _ => Err("field access on non-object".into()),
            },
            _ => Err("field access on primitive".into()),
        }
    }

    fn write_field(&mut self, obj: Value, field: usize, value: Value) -> Result<Result<(), Trap>, String> {
        match obj {
            Value::Null => Ok(Err(Trap::NullDeref)),
            Value::Ref(h) => match &mut self.heap.objects[h].data {
                HeapData::Object(fields) => match fields.get_mut(field) {
                    Some(slot) => {
                        *slot = value;
                        Ok(Ok(()))
                    }
                    None => Err(format!("field {field} out of layout")),
                },
                _ => Err("field store on non-object".into()),
            },
            _ => Err("field store on primitive".into()),
        }
    }

    fn read_index(&self, arr: Value, idx: Value) -> Result<Result<Value, Trap>, String> {
        let Value::I32(i) = idx else {
            return Err("non-i32 array index".into());
        };
        match arr {
            Value::Null => Ok(Err(Trap::NullDeref)),
            Value::Ref(h) => match &self.heap.objects[h].data {
                HeapData::Array(elems) => {
                    if i < 0 || i as usize >= elems.len() {
                        Ok(Err(Trap::OutOfBounds))
                    } else {
                        Ok(Ok(elems[i as usize]))
                    }
                }
                _ => Err("index access on non-array".into()),
            },
            _ => Err("index access on primitive".into()),
        }
    }

    fn write_index(&mut self, arr: Value, idx: Value, value: Value) -> Result<Result<(), Trap>, String> {
        let Value::I32(i) = idx else {
            return Err("non-i32 array index".into());
        };
        match arr {
            Value::Null => Ok(Err(Trap::NullDeref)),
            Value::Ref(h) => match &mut self.heap.objects[h].data {
                HeapData::Array(elems) => {
                    if i < 0 || i as usize >= elems.len() {
                        Ok(Err(Trap::OutOfBounds))
                    } else {
                        elems[i as usize] = value;
                        Ok(Ok(()))
                    }
                }
                _ => Err("index store on non-array".into()),
            },
            _ => Err("index store on primitive".into()),
        }
    }

    // =========================================================================
    // Floating evaluation
    // =========================================================================

    /// Value of any node in the current environment. Fixed producers must
    /// have executed already; pure nodes evaluate recursively.
    pub fn eval(&self, id: NodeId) -> Result<Value, String> {
        if let Some(v) = self.fixed_values.get(&id) {
            return Ok(*v);
        }
        if let Some(v) = self.phi_values.get(&id) {
            return Ok(*v);
        }

        let op = self.graph.op(id);
        let val = |i: usize| -> Result<Value, String> { self.eval(self.input(id, i)?) };

        Ok(match *op {
            Op::ConstI32(v) => Value::I32(v),
            Op::ConstI64(v) => Value::I64(v),
            Op::ConstF32(bits) => Value::F32(f32::from_bits(bits)),
            Op::ConstF64(bits) => Value::F64(f64::from_bits(bits)),
            Op::ConstNull => Value::Null,
            Op::Parameter { index, .. } => self
                .params
                .get(index as usize)
                .copied()
                .ok_or_else(|| format!("missing parameter {index}"))?,

            Op::IntOp { op, bits } => {
                let (a, b) = (val(0)?, val(1)?);
                Self::int_arith(op, bits, a, b)?
            }
            Op::IntNeg { bits } => match (bits, val(0)?) {
                (32, Value::I32(a)) => Value::I32(a.wrapping_neg()),
                (64, Value::I64(a)) => Value::I64(a.wrapping_neg()),
                _ => return Err(format!("{id:?}: neg operand mismatch")),
            },
            Op::IntNot { bits } => match (bits, val(0)?) {
                (32, Value::I32(a)) => Value::I32(!a),
                (64, Value::I64(a)) => Value::I64(!a),
                _ => return Err(format!("{id:?}: not operand mismatch")),
            },
            Op::IntCmp { op, .. } => {
                let (a, b) = (val(0)?, val(1)?);
                let (a, b) = match (a, b) {
                    (Value::I32(a), Value::I32(b)) => (a as i64, b as i64),
                    (Value::I64(a), Value::I64(b)) => (a, b),
                    _ => return Err(format!("{id:?}: cmp operand mismatch")),
                };
                let r = match op {
                    CmpOp::Eq => a == b,
                    CmpOp::Ne => a != b,
                    CmpOp::Lt => a < b,
                    CmpOp::Le => a <= b,
                    CmpOp::Gt => a > b,
                    CmpOp::Ge => a >= b,
                };
                Value::I32(r as i32)
            }
            Op::FloatOp { op, bits } => {
                use crate::ir::FloatArith::*;
                let (a, b) = (val(0)?, val(1)?);
                match (bits, a, b) {
                    (32, Value::F32(a), Value::F32(b)) => Value::F32(match op {
                        Add => a + b,
                        Sub => a - b,
                        Mul => a * b,
                        Div => a / b,
                    }),
                    (64, Value::F64(a), Value::F64(b)) => Value::F64(match op {
                        Add => a + b,
                        Sub => a - b,
                        Mul => a * b,
                        Div => a / b,
                    }),
                    _ => return Err(format!("{id:?}: float operand mismatch")),
                }
            }
            Op::FloatNeg { bits } => match (bits, val(0)?) {
                (32, Value::F32(a)) => Value::F32(-a),
                (64, Value::F64(a)) => Value::F64(-a),
                _ => return Err(format!("{id:?}: fneg operand mismatch")),
            },
            Op::FloatCmp { op, .. } => {
                let (a, b) = (val(0)?, val(1)?);
                let (a, b) = match (a, b) {
                    (Value::F32(a), Value::F32(b)) => (a as f64, b as f64),
                    (Value::F64(a), Value::F64(b)) => (a, b),
                    _ => return Err(format!("{id:?}: fcmp operand mismatch")),
                };
                let r = match op {
                    CmpOp::Eq => a == b,
                    CmpOp::Ne => a != b,
                    CmpOp::Lt => a < b,
                    CmpOp::Le => a <= b,
                    CmpOp::Gt => a > b,
                    CmpOp::Ge => a >= b,
                };
                Value::I32(r as i32)
            }
            Op::Convert(conv) => {
                let a = val(0)?;
                match (conv, a) {
                    (ConvertOp::I32ToI64, Value::I32(v)) => Value::I64(v as i64),
                    (ConvertOp::I64ToI32, Value::I64(v)) => Value::I32(v as i32),
                    (ConvertOp::I32ToF64, Value::I32(v)) => Value::F64(v as f64),
                    (ConvertOp::I64ToF64, Value::I64(v)) => Value::F64(v as f64),
                    (ConvertOp::F32ToF64, Value::F32(v)) => Value::F64(v as f64),
                    (ConvertOp::F64ToF32, Value::F64(v)) => Value::F32(v as f32),
                    _ => return Err(format!("{id:?}: convert operand mismatch")),
                }
            }
            Op::RefEq => {
                let (a, b) = (val(0)?, val(1)?);
                let r = match (a, b) {
                    (Value::Null, Value::Null) => true,
                    (Value::Ref(a), Value::Ref(b)) => a == b,
                    (Value::Null, Value::Ref(_)) | (Value::Ref(_), Value::Null) => false,
                    _ => return Err(format!("{id:?}: refeq on primitives")),
                };
                Value::I32(r as i32)
            }
            Op::InstanceOf(class) => {
                // Exact-class test; hierarchy is outside this tier.
                let r = match val(0)? {
                    Value::Null => false,
                    Value::Ref(h) => self.heap.objects[h].class == class,
                    _ => return Err(format!("{id:?}: instanceof on primitive")),
                };
                Value::I32(r as i32)
            }
            Op::ArrayLength => match val(0)? {
                Value::Null => return Err(format!("{id:?}: array length of null")),
                Value::Ref(h) => match &self.heap.objects[h].data {
                    HeapData::Array(elems) => Value::I32(elems.len() as i32),
                    _ => return Err(format!("{id:?}: array length of non-array")),
                },
                _ => return Err(format!("{id:?}: array length of primitive")),
            },

            Op::Phi { .. } => {
                return Err(format!("{id:?}: phi read before its merge executed"))
            }
            ref other => {
                return Err(format!(
                    "{id:?}: {} has no floating value",
                    other.mnemonic()
                ))
            }
        })
    }

    fn int_arith(op: IntArith, bits: u8, a: Value, b: Value) -> Result<Value, String> {
        use IntArith::*;
        match (bits, a, b) {
            (32, Value::I32(a), Value::I32(b)) => Ok(Value::I32(match op {
                Add => a.wrapping_add(b),
                Sub => a.wrapping_sub(b),
                Mul => a.wrapping_mul(b),
                And => a & b,
                Or => a | b,
                Xor => a ^ b,
                Shl => a.wrapping_shl(b as u32 & 31),
                Shr => a.wrapping_shr(b as u32 & 31),
                Ushr => ((a as u32).wrapping_shr(b as u32 & 31)) as i32,
            })),
            (64, Value::I64(a), Value::I64(b)) => Ok(Value::I64(match op {
                Add => a.wrapping_add(b),
                Sub => a.wrapping_sub(b),
                Mul => a.wrapping_mul(b),
                And => a & b,
                Or => a | b,
                Xor => a ^ b,
                Shl => a.wrapping_shl(b as u32 & 63),
                Shr => a.wrapping_shr(b as u32 & 63),
                Ushr => ((a as u64).wrapping_shr(b as u32 & 63)) as i64,
            })),
            _ => Err("integer operand mismatch".into()),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::node::FieldId;
    use crate::ir::GraphBuilder;

    #[test]
    fn test_straight_line_arith() {
        // return (p0 + 3) * 2
        let mut b = GraphBuilder::new();
        let p = b.param(0, ValKind::I32);
        let three = b.const_i32(3);
        let two = b.const_i32(2);
        let sum = b.int_add(p, three);
        let prod = b.int_mul(sum, two);
        b.ret(Some(prod));
        let g = b.finish();

        let mut interp = Interp::new(&g);
        let out = interp.run(&[Value::I32(5)]).unwrap();
        assert!(out.same_as(&Outcome::Returned(Some(Value::I32(16)))));
    }

    #[test]
    fn test_diamond_picks_arm() {
        // return p0 < 10 ? 1 : 2
        let mut b = GraphBuilder::new();
        let p = b.param(0, ValKind::I32);
        let ten = b.const_i32(10);
        let cond = b.int_cmp(CmpOp::Lt, p, ten);
        let (t, f) = b.branch(cond);
        let mem = b.graph().start;
        b.seek(t, mem);
        let t_exit = b.tail();
        b.seek(f, mem);
        let f_exit = b.tail();
        let region = b.merge(&[t_exit, f_exit]);
        let one = b.const_i32(1);
        let two = b.const_i32(2);
        let phi = b.phi(region, ValKind::I32, &[one, two]);
        b.ret(Some(phi));
        let g = b.finish();

        let mut interp = Interp::new(&g);
        let lt = interp.run(&[Value::I32(3)]).unwrap();
        assert!(lt.same_as(&Outcome::Returned(Some(Value::I32(1)))));
        let ge = interp.run(&[Value::I32(42)]).unwrap();
        assert!(ge.same_as(&Outcome::Returned(Some(Value::I32(2)))));
    }

    #[test]
    fn test_counted_loop_sums() {
        // s = 0; for (i = 0; i < p0; i++) s += i; return s
        let mut b = GraphBuilder::new();
        let limit = b.param(0, ValKind::I32);
        let zero = b.const_i32(0);
        let one = b.const_i32(1);

        let header = b.loop_begin();
        let i = b.loop_phi(header, ValKind::I32, zero);
        let s = b.loop_phi(header, ValKind::I32, zero);
        let cond = b.int_cmp(CmpOp::Lt, i, limit);
        let (body, exit) = b.branch(cond);
        let mem = b.tail().memory;

        b.seek(body, mem);
        let s2 = b.int_add(s, i);
        let i2 = b.int_add(i, one);
        b.loop_end(header);
        b.seal_loop_phi(i, i2);
        b.seal_loop_phi(s, s2);

        b.seek(exit, mem);
        b.ret(Some(s));
        let g = b.finish();

        let mut interp = Interp::new(&g);
        let out = interp.run(&[Value::I32(5)]).unwrap();
        assert!(out.same_as(&Outcome::Returned(Some(Value::I32(10)))));
    }

    #[test]
    fn test_field_store_load_roundtrip() {
        // o = new C; o.f = p0; return o.f
        let mut b = GraphBuilder::new();
        let p = b.param(0, ValKind::I32);
        let obj = b.new_object(ClassId(7), 2);
        b.store_field(obj, FieldId(0), p);
        let v = b.load_field(obj, FieldId(0), ValKind::I32);
        b.ret(Some(v));
        let g = b.finish();

        let mut interp = Interp::new(&g);
        let out = interp.run(&[Value::I32(99)]).unwrap();
        assert!(out.same_as(&Outcome::Returned(Some(Value::I32(99)))));
    }

    #[test]
    fn test_null_store_traps() {
        let mut b = GraphBuilder::new();
        let nil = b.const_null();
        let v = b.const_i32(1);
        b.store_field(nil, FieldId(0), v);
        let zero = b.const_i32(0);
        b.ret(Some(zero));
        let g = b.finish();

        let mut interp = Interp::new(&g);
        let out = interp.run(&[]).unwrap();
        assert!(out.same_as(&Outcome::Trapped(Trap::NullDeref)));
    }

    #[test]
    fn test_guard_deopts_on_false_condition() {
        let mut b = GraphBuilder::new();
        let p = b.param(0, ValKind::I32);
        let zero = b.const_i32(0);
        let cond = b.int_cmp(CmpOp::Ge, p, zero);
        let anchor = b.anchor();
        b.guard(cond, DeoptReason::BoundsCheck, anchor);
        b.ret(Some(p));
        let g = b.finish();

        let mut interp = Interp::new(&g);
        let ok = interp.run(&[Value::I32(3)]).unwrap();
        assert!(ok.same_as(&Outcome::Returned(Some(Value::I32(3)))));
        let deopt = interp.run(&[Value::I32(-1)]).unwrap();
        assert!(deopt.same_as(&Outcome::Deopted(DeoptReason::BoundsCheck)));
    }

    #[test]
    fn test_box_unbox_roundtrip() {
        let mut b = GraphBuilder::new();
        let p = b.param(0, ValKind::I64);
        let boxed = b.new_box(ClassId(1), ValKind::I64, p);
        let v = b.unbox(ValKind::I64, boxed);
        b.ret(Some(v));
        let g = b.finish();

        let mut interp = Interp::new(&g);
        let out = interp.run(&[Value::I64(1 << 40)]).unwrap();
        assert!(out.same_as(&Outcome::Returned(Some(Value::I64(1 << 40)))));
    }

    #[test]
    fn test_budget_stops_infinite_loop() {
        // while (true) {}
        let mut b = GraphBuilder::new();
        let header = b.loop_begin();
        let t = b.const_bool(true);
        let (body, exit) = b.branch(t);
        let mem = b.tail().memory;
        b.seek(body, mem);
        b.loop_end(header);
        b.seek(exit, mem);
        let zero = b.const_i32(0);
        b.ret(Some(zero));
        let g = b.finish();

        let mut interp = Interp::new(&g).with_max_steps(1_000);
        assert!(interp.run(&[]).is_err());
    }
}
