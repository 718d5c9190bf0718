//! Node and operation definitions for the program graph.
//!
//! The graph is a sea of nodes: data flow, control flow, and memory ordering
//! are all edges between nodes. Every node is:
//! - **An operation**: a closed [`Op`] union; the canonicalizer dispatches
//!   on it exhaustively, so adding a variant forces every rewrite site to
//!   decide what to do with it
//! - **Its inputs**: an [`InputList`] of typed edges ([`EdgeClass`] tells
//!   control from value from memory per slot)
//! - **A stamp**: the abstract value the node can produce
//! - **A position**: bytecode offset + handler metadata that rewrites must
//!   carry over to replacements
//!
//! **Fixed vs floating**: fixed nodes (control, memory accesses, allocations,
//! calls, anchors) are threaded on a control chain through input 0 and keep
//! their program order; floating nodes (constants, arithmetic, compares)
//! have no position until the scheduler assigns one.

use opal_core::SourcePos;

use super::arena::Id;
use super::stamp::{ClassId, FloatStamp, IntStamp, RefStamp, Stamp, ValKind};

// =============================================================================
// Ids
// =============================================================================

/// Unique identifier for a node in one graph.
pub type NodeId = Id<Node>;

/// Field slot index within an object layout (assigned by the runtime's class
/// loader; the middle-end only needs identity and disjointness).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FieldId(pub u32);

impl std::fmt::Display for FieldId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "f{}", self.0)
    }
}

/// Resolved call target handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MethodId(pub u32);

impl std::fmt::Display for MethodId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "m{}", self.0)
    }
}

// =============================================================================
// Abstract memory locations
// =============================================================================

/// Location identity for memory ordering. A store to location L must be
/// observed by every later load whose location is not provably disjoint
/// from L.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemLoc {
    /// One field slot of some object.
    Field(FieldId),
    /// Any array element.
    Element,
    /// The value slot of a box allocation.
    BoxValue,
    /// Aliases everything (calls, allocation init barriers).
    Any,
}

impl MemLoc {
    /// Provable disjointness; `Any` overlaps everything, two field slots are
    /// disjoint iff their indices differ.
    pub fn disjoint(self, other: MemLoc) -> bool {
        match (self, other) {
            (MemLoc::Any, _) | (_, MemLoc::Any) => false,
            (MemLoc::Field(a), MemLoc::Field(b)) => a != b,
            (a, b) => a != b,
        }
    }
}

// =============================================================================
// Operation sub-enums
// =============================================================================

/// Two-operand integer arithmetic (division is carried by runtime calls, so
/// it never appears here).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntArith {
    Add,
    Sub,
    Mul,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    Ushr,
}

impl IntArith {
    pub fn is_commutative(self) -> bool {
        matches!(
            self,
            IntArith::Add | IntArith::Mul | IntArith::And | IntArith::Or | IntArith::Xor
        )
    }

    /// Right operand that leaves the left operand unchanged.
    pub fn identity(self) -> Option<i64> {
        match self {
            IntArith::Add | IntArith::Sub | IntArith::Or | IntArith::Xor => Some(0),
            IntArith::Shl | IntArith::Shr | IntArith::Ushr => Some(0),
            IntArith::Mul => Some(1),
            IntArith::And => Some(-1),
        }
    }

    /// Right operand that forces the result regardless of the left operand.
    pub fn absorbing(self) -> Option<i64> {
        match self {
            IntArith::Mul | IntArith::And => Some(0),
            IntArith::Or => Some(-1),
            _ => None,
        }
    }

    pub fn mnemonic(self) -> &'static str {
        match self {
            IntArith::Add => "add",
            IntArith::Sub => "sub",
            IntArith::Mul => "mul",
            IntArith::And => "and",
            IntArith::Or => "or",
            IntArith::Xor => "xor",
            IntArith::Shl => "shl",
            IntArith::Shr => "shr",
            IntArith::Ushr => "ushr",
        }
    }
}

/// Two-operand float arithmetic (IEEE, never traps).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FloatArith {
    Add,
    Sub,
    Mul,
    Div,
}

impl FloatArith {
    pub fn is_commutative(self) -> bool {
        matches!(self, FloatArith::Add | FloatArith::Mul)
    }

    pub fn mnemonic(self) -> &'static str {
        match self {
            FloatArith::Add => "fadd",
            FloatArith::Sub => "fsub",
            FloatArith::Mul => "fmul",
            FloatArith::Div => "fdiv",
        }
    }
}

/// Comparison condition. Results are i32 zero/one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    /// Condition with operands swapped: `a < b` == `b > a`.
    pub fn swapped(self) -> CmpOp {
        match self {
            CmpOp::Eq => CmpOp::Eq,
            CmpOp::Ne => CmpOp::Ne,
            CmpOp::Lt => CmpOp::Gt,
            CmpOp::Le => CmpOp::Ge,
            CmpOp::Gt => CmpOp::Lt,
            CmpOp::Ge => CmpOp::Le,
        }
    }

    pub fn negated(self) -> CmpOp {
        match self {
            CmpOp::Eq => CmpOp::Ne,
            CmpOp::Ne => CmpOp::Eq,
            CmpOp::Lt => CmpOp::Ge,
            CmpOp::Le => CmpOp::Gt,
            CmpOp::Gt => CmpOp::Le,
            CmpOp::Ge => CmpOp::Lt,
        }
    }

    pub fn mnemonic(self) -> &'static str {
        match self {
            CmpOp::Eq => "eq",
            CmpOp::Ne => "ne",
            CmpOp::Lt => "lt",
            CmpOp::Le => "le",
            CmpOp::Gt => "gt",
            CmpOp::Ge => "ge",
        }
    }
}

/// Numeric conversions between the kinds the bytecode uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConvertOp {
    I32ToI64,
    I64ToI32,
    I32ToF64,
    I64ToF64,
    F32ToF64,
    F64ToF32,
}

impl ConvertOp {
    pub fn result_kind(self) -> ValKind {
        match self {
            ConvertOp::I32ToI64 => ValKind::I64,
            ConvertOp::I64ToI32 => ValKind::I32,
            ConvertOp::I32ToF64 | ConvertOp::I64ToF64 | ConvertOp::F32ToF64 => ValKind::F64,
            ConvertOp::F64ToF32 => ValKind::F32,
        }
    }

    pub fn mnemonic(self) -> &'static str {
        match self {
            ConvertOp::I32ToI64 => "i32toi64",
            ConvertOp::I64ToI32 => "i64toi32",
            ConvertOp::I32ToF64 => "i32tof64",
            ConvertOp::I64ToF64 => "i64tof64",
            ConvertOp::F32ToF64 => "f32tof64",
            ConvertOp::F64ToF32 => "f64tof32",
        }
    }
}

/// Why a guard would deoptimize if its condition fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeoptReason {
    NullCheck,
    BoundsCheck,
    TypeCheck,
    UnreachedCode,
}

// =============================================================================
// Operation union
// =============================================================================

/// The closed set of operations. Input slot layout per variant is documented
/// by [`Op::input_class`]; fixed variants carry their control predecessor in
/// slot 0.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Op {
    // ---- Constants and parameters (floating, pure) ----
    ConstI32(i32),
    ConstI64(i64),
    /// Raw f32 bits; kept as bits so `Op` stays `Eq`-comparable for tests.
    ConstF32(u32),
    /// Raw f64 bits.
    ConstF64(u64),
    ConstNull,
    Parameter { index: u16, kind: ValKind },

    // ---- Pure data (floating); inputs all values ----
    /// Inputs: (a, b).
    IntOp { op: IntArith, bits: u8 },
    /// Inputs: (a).
    IntNeg { bits: u8 },
    /// Inputs: (a).
    IntNot { bits: u8 },
    /// Inputs: (a, b).
    FloatOp { op: FloatArith, bits: u8 },
    /// Inputs: (a).
    FloatNeg { bits: u8 },
    /// Inputs: (a, b); result i32 0/1.
    IntCmp { op: CmpOp, bits: u8 },
    /// Inputs: (a, b); result i32 0/1. Any NaN operand compares false
    /// except through `Ne`.
    FloatCmp { op: CmpOp, bits: u8 },
    /// Inputs: (a).
    Convert(ConvertOp),
    /// Reference identity compare. Inputs: (a, b); result i32 0/1.
    RefEq,
    /// Dynamic type test. Inputs: (obj); result i32 0/1.
    InstanceOf(ClassId),
    /// Array length (immutable after allocation, so this floats).
    /// Inputs: (array).
    ArrayLength,

    // ---- Phi (floating, placed in its region's block) ----
    /// Inputs: (region, v_1, .., v_n) with n == region predecessor count.
    Phi { kind: ValKind },
    /// Merge of memory states where control merges. Not itself a kill; it
    /// forwards whichever predecessor state reaches it.
    /// Inputs: (region, mem_1, .., mem_n) with n == region predecessor count.
    MemoryPhi,

    // ---- Memory accesses (fixed) ----
    // The memory slot points at the previous memory state: `Start` or the
    // closest earlier kill on the control path. Loads consume that state;
    // kills consume and produce it, forming a chain deletions can re-thread
    // without searching the control flow.
    /// Inputs: (control, object, memory).
    LoadField { field: FieldId, kind: ValKind },
    /// Inputs: (control, object, value, memory).
    StoreField { field: FieldId },
    /// Inputs: (control, array, index, memory).
    LoadIndex { elem: ValKind },
    /// Inputs: (control, array, index, value, memory).
    StoreIndex { elem: ValKind },

    // ---- Allocations (fixed) ----
    /// Inputs: (control, memory). `fields` is the instance slot count.
    New { class: ClassId, fields: u16 },
    /// Inputs: (control, length, memory).
    NewArray { class: ClassId, elem: ValKind },
    /// Box allocation wrapping one primitive value.
    /// Inputs: (control, value, memory).
    NewBox { class: ClassId, kind: ValKind },
    /// Read the value back out of a box. Inputs: (control, box, memory).
    Unbox { kind: ValKind },

    // ---- Calls (fixed; unmodeled by every analysis) ----
    /// Inputs: (control, memory, arg_1, .., arg_n).
    Call { target: MethodId, returns: Option<ValKind> },

    // ---- Guards ----
    /// Ordering point floating guards attach to. Inputs: (control).
    Anchor,
    /// Floating speculation check; deoptimizes when `condition` is false.
    /// Inputs: (condition, anchor).
    Guard { reason: DeoptReason },

    // ---- Control (fixed) ----
    /// Method entry. No inputs.
    Start,
    /// Control merge. Inputs: one control edge per predecessor.
    Region,
    /// Loop header merge. Inputs: (entry_control, back_edge_1, ..).
    LoopBegin,
    /// Back edge. Inputs: (control, loop_begin).
    LoopEnd,
    /// Two-way split. Inputs: (control, condition). Successors are the two
    /// `Proj` usages.
    If,
    /// Branch successor of a split. Inputs: (split). `index` 0 = true arm.
    Proj { index: u8 },
    /// Method exit. Inputs: (control, value) or (control) for void.
    Return,
    /// Exceptional exit. Inputs: (control, exception).
    Throw,
    /// Terminal deoptimization. Inputs: (control).
    Deopt { reason: DeoptReason },
    /// Sink collecting every exit. Inputs: one control edge per exit node.
    End,
}

/// Edge classification per input slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeClass {
    Control,
    Value,
    Memory,
}

/// Coarse grouping for kind-filtered graph iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Const,
    Parameter,
    Arith,
    Compare,
    Convert,
    Phi,
    Memory,
    Alloc,
    Call,
    Guard,
    Anchor,
    Control,
    TypeTest,
}

impl Op {
    pub fn kind(&self) -> OpKind {
        match self {
            Op::ConstI32(_) | Op::ConstI64(_) | Op::ConstF32(_) | Op::ConstF64(_) | Op::ConstNull => {
                OpKind::Const
            }
            Op::Parameter { .. } => OpKind::Parameter,
            Op::IntOp { .. }
            | Op::IntNeg { .. }
            | Op::IntNot { .. }
            | Op::FloatOp { .. }
            | Op::FloatNeg { .. }
            | Op::ArrayLength => OpKind::Arith,
            Op::IntCmp { .. } | Op::FloatCmp { .. } | Op::RefEq => OpKind::Compare,
            Op::Convert(_) => OpKind::Convert,
            Op::InstanceOf(_) => OpKind::TypeTest,
            Op::Phi { .. } | Op::MemoryPhi => OpKind::Phi,
            Op::LoadField { .. } | Op::StoreField { .. } | Op::LoadIndex { .. }
            | Op::StoreIndex { .. } | Op::Unbox { .. } => OpKind::Memory,
            Op::New { .. } | Op::NewArray { .. } | Op::NewBox { .. } => OpKind::Alloc,
            Op::Call { .. } => OpKind::Call,
            Op::Guard { .. } => OpKind::Guard,
            Op::Anchor => OpKind::Anchor,
            Op::Start | Op::Region | Op::LoopBegin | Op::LoopEnd | Op::If | Op::Proj { .. }
            | Op::Return | Op::Throw | Op::Deopt { .. } | Op::End => OpKind::Control,
        }
    }

    /// Fixed nodes keep their place on the control chain; everything else
    /// floats until scheduling.
    pub fn is_fixed(&self) -> bool {
        matches!(
            self,
            Op::LoadField { .. }
                | Op::StoreField { .. }
                | Op::LoadIndex { .. }
                | Op::StoreIndex { .. }
                | Op::New { .. }
                | Op::NewArray { .. }
                | Op::NewBox { .. }
                | Op::Unbox { .. }
                | Op::Call { .. }
                | Op::Anchor
                | Op::Start
                | Op::Region
                | Op::LoopBegin
                | Op::LoopEnd
                | Op::If
                | Op::Proj { .. }
                | Op::Return
                | Op::Throw
                | Op::Deopt { .. }
                | Op::End
        )
    }

    pub fn is_control(&self) -> bool {
        self.kind() == OpKind::Control
    }

    /// Pure data ops: no memory effect, no control effect, deletable when
    /// unused, freely duplicable.
    pub fn is_pure(&self) -> bool {
        matches!(
            self.kind(),
            OpKind::Const
                | OpKind::Parameter
                | OpKind::Arith
                | OpKind::Compare
                | OpKind::Convert
                | OpKind::TypeTest
        )
    }

    pub fn is_allocation(&self) -> bool {
        self.kind() == OpKind::Alloc
    }

    /// Blocks begin at these nodes.
    pub fn is_block_leader(&self) -> bool {
        matches!(self, Op::Start | Op::Region | Op::LoopBegin | Op::Proj { .. })
    }

    /// Blocks end at these nodes (last fixed node of a block).
    pub fn is_block_terminator(&self) -> bool {
        matches!(
            self,
            Op::If | Op::Return | Op::Throw | Op::Deopt { .. } | Op::LoopEnd | Op::End
        )
    }

    /// Index of the memory ordering input, for every node on the memory
    /// chain.
    pub fn memory_input(&self) -> Option<usize> {
        match self {
            Op::LoadField { .. } | Op::Unbox { .. } => Some(2),
            Op::LoadIndex { .. } => Some(3),
            Op::StoreField { .. } => Some(3),
            Op::StoreIndex { .. } => Some(4),
            Op::New { .. } => Some(1),
            Op::NewArray { .. } | Op::NewBox { .. } => Some(2),
            Op::Call { .. } => Some(1),
            _ => None,
        }
    }

    /// Nodes whose output can serve as a memory-slot input: the initial
    /// state (`Start`), every kill, and memory merges.
    pub fn is_memory_producer(&self) -> bool {
        matches!(self, Op::Start | Op::MemoryPhi) || self.kill_location().is_some()
    }

    /// Location a load reads from.
    pub fn load_location(&self) -> Option<MemLoc> {
        match self {
            Op::LoadField { field, .. } => Some(MemLoc::Field(*field)),
            Op::LoadIndex { .. } => Some(MemLoc::Element),
            Op::Unbox { .. } => Some(MemLoc::BoxValue),
            _ => None,
        }
    }

    /// Location this node overwrites, if it is a memory kill. Allocations
    /// kill `Any`: their initialization must not be reordered with reads.
    pub fn kill_location(&self) -> Option<MemLoc> {
        match self {
            Op::StoreField { field } => Some(MemLoc::Field(*field)),
            Op::StoreIndex { .. } => Some(MemLoc::Element),
            Op::NewBox { .. } | Op::New { .. } | Op::NewArray { .. } => Some(MemLoc::Any),
            Op::Call { .. } => Some(MemLoc::Any),
            _ => None,
        }
    }

    pub fn is_commutative(&self) -> bool {
        match self {
            Op::IntOp { op, .. } => op.is_commutative(),
            Op::FloatOp { op, .. } => op.is_commutative(),
            Op::IntCmp { op, .. } => matches!(op, CmpOp::Eq | CmpOp::Ne),
            Op::RefEq => true,
            _ => false,
        }
    }

    /// Classify input slot `index`. Variants with a variable tail classify
    /// every slot past the fixed prefix the same way.
    pub fn input_class(&self, index: usize) -> EdgeClass {
        match self {
            // All-control variants.
            Op::Start | Op::Region | Op::LoopBegin | Op::End => EdgeClass::Control,
            Op::LoopEnd => EdgeClass::Control,
            Op::Proj { .. } | Op::Deopt { .. } | Op::Anchor => EdgeClass::Control,

            // Control in slot 0, values after.
            Op::If | Op::Return | Op::Throw => {
                if index == 0 {
                    EdgeClass::Control
                } else {
                    EdgeClass::Value
                }
            }

            // Memory chain nodes: control, then values, with one memory slot.
            Op::LoadField { .. } | Op::LoadIndex { .. } | Op::Unbox { .. }
            | Op::StoreField { .. } | Op::StoreIndex { .. } | Op::New { .. }
            | Op::NewArray { .. } | Op::NewBox { .. } | Op::Call { .. } => {
                if index == 0 {
                    EdgeClass::Control
                } else if Some(index) == self.memory_input() {
                    EdgeClass::Memory
                } else {
                    EdgeClass::Value
                }
            }

            // Phis: region first, then one operand per predecessor.
            Op::Phi { .. } => {
                if index == 0 {
                    EdgeClass::Control
                } else {
                    EdgeClass::Value
                }
            }
            Op::MemoryPhi => {
                if index == 0 {
                    EdgeClass::Control
                } else {
                    EdgeClass::Memory
                }
            }

            // Guard: condition then anchor.
            Op::Guard { .. } => {
                if index == 0 {
                    EdgeClass::Value
                } else {
                    EdgeClass::Control
                }
            }

            // Everything else is pure data.
            _ => EdgeClass::Value,
        }
    }

    /// Stamp assigned at creation, before input-driven inference refines it.
    pub fn default_stamp(&self) -> Stamp {
        match self {
            Op::ConstI32(v) => Stamp::constant_int(32, *v as i64),
            Op::ConstI64(v) => Stamp::constant_int(64, *v),
            Op::ConstF32(bits) => Stamp::Float(FloatStamp::constant(32, f32::from_bits(*bits) as f64)),
            Op::ConstF64(bits) => Stamp::Float(FloatStamp::constant(64, f64::from_bits(*bits))),
            Op::ConstNull => Stamp::Ref(RefStamp::null()),
            Op::Parameter { kind, .. } => kind.unrestricted(),
            Op::IntOp { bits, .. } | Op::IntNeg { bits } | Op::IntNot { bits } => {
                Stamp::Int(IntStamp::unrestricted(*bits))
            }
            Op::FloatOp { bits, .. } | Op::FloatNeg { bits } => {
                Stamp::Float(FloatStamp::unrestricted(*bits))
            }
            Op::IntCmp { .. } | Op::FloatCmp { .. } | Op::RefEq | Op::InstanceOf(_) => {
                Stamp::Int(IntStamp::bool_range())
            }
            Op::Convert(op) => op.result_kind().unrestricted(),
            Op::ArrayLength => Stamp::Int(IntStamp::range(32, 0, i32::MAX as i64)),
            Op::Phi { kind } => kind.unrestricted(),
            Op::LoadField { kind, .. } | Op::LoadIndex { elem: kind } | Op::Unbox { kind } => {
                kind.unrestricted()
            }
            Op::New { class, .. } | Op::NewArray { class, .. } | Op::NewBox { class, .. } => {
                Stamp::Ref(RefStamp::exact_non_null(*class))
            }
            Op::Call { returns, .. } => match returns {
                Some(kind) => kind.unrestricted(),
                None => Stamp::Void,
            },
            Op::StoreField { .. } | Op::StoreIndex { .. } | Op::Guard { .. } | Op::Anchor
            | Op::MemoryPhi => Stamp::Void,
            Op::Start | Op::Region | Op::LoopBegin | Op::LoopEnd | Op::If | Op::Proj { .. }
            | Op::Return | Op::Throw | Op::Deopt { .. } | Op::End => Stamp::Void,
        }
    }

    pub fn mnemonic(&self) -> &'static str {
        match self {
            Op::ConstI32(_) => "const.i32",
            Op::ConstI64(_) => "const.i64",
            Op::ConstF32(_) => "const.f32",
            Op::ConstF64(_) => "const.f64",
            Op::ConstNull => "null",
            Op::Parameter { .. } => "param",
            Op::IntOp { op, .. } => op.mnemonic(),
            Op::IntNeg { .. } => "neg",
            Op::IntNot { .. } => "not",
            Op::FloatOp { op, .. } => op.mnemonic(),
            Op::FloatNeg { .. } => "fneg",
            Op::IntCmp { op, .. } => op.mnemonic(),
            Op::FloatCmp { .. } => "fcmp",
            Op::Convert(op) => op.mnemonic(),
            Op::RefEq => "refeq",
            Op::InstanceOf(_) => "instanceof",
            Op::ArrayLength => "arraylength",
            Op::Phi { .. } => "phi",
            Op::MemoryPhi => "memphi",
            Op::LoadField { .. } => "loadfield",
            Op::StoreField { .. } => "storefield",
            Op::LoadIndex { .. } => "loadindex",
            Op::StoreIndex { .. } => "storeindex",
            Op::New { .. } => "new",
            Op::NewArray { .. } => "newarray",
            Op::NewBox { .. } => "box",
            Op::Unbox { .. } => "unbox",
            Op::Call { .. } => "call",
            Op::Anchor => "anchor",
            Op::Guard { .. } => "guard",
            Op::Start => "start",
            Op::Region => "region",
            Op::LoopBegin => "loopbegin",
            Op::LoopEnd => "loopend",
            Op::If => "if",
            Op::Proj { index } => {
                if *index == 0 {
                    "iftrue"
                } else {
                    "iffalse"
                }
            }
            Op::Return => "return",
            Op::Throw => "throw",
            Op::Deopt { .. } => "deopt",
            Op::End => "end",
        }
    }
}

// =============================================================================
// Input list
// =============================================================================

/// Inputs stored inline before spilling to a heap vector.
pub const INLINE_INPUTS: usize = 4;

/// Ordered input edges of one node. Most nodes have at most
/// [`INLINE_INPUTS`] inputs, so those are stored without allocation; merges
/// and calls spill to a vector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputList {
    Empty,
    Single(NodeId),
    Pair(NodeId, NodeId),
    Triple(NodeId, NodeId, NodeId),
    Quad(NodeId, NodeId, NodeId, NodeId),
    Many(Vec<NodeId>),
}

impl InputList {
    pub fn from_slice(inputs: &[NodeId]) -> InputList {
        match inputs {
            [] => InputList::Empty,
            [a] => InputList::Single(*a),
            [a, b] => InputList::Pair(*a, *b),
            [a, b, c] => InputList::Triple(*a, *b, *c),
            [a, b, c, d] => InputList::Quad(*a, *b, *c, *d),
            _ => InputList::Many(inputs.to_vec()),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            InputList::Empty => 0,
            InputList::Single(_) => 1,
            InputList::Pair(..) => 2,
            InputList::Triple(..) => 3,
            InputList::Quad(..) => 4,
            InputList::Many(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: usize) -> Option<NodeId> {
        match (self, index) {
            (InputList::Single(a), 0) => Some(*a),
            (InputList::Pair(a, _), 0) => Some(*a),
            (InputList::Pair(_, b), 1) => Some(*b),
            (InputList::Triple(a, _, _), 0) => Some(*a),
            (InputList::Triple(_, b, _), 1) => Some(*b),
            (InputList::Triple(_, _, c), 2) => Some(*c),
            (InputList::Quad(a, _, _, _), 0) => Some(*a),
            (InputList::Quad(_, b, _, _), 1) => Some(*b),
            (InputList::Quad(_, _, c, _), 2) => Some(*c),
            (InputList::Quad(_, _, _, d), 3) => Some(*d),
            (InputList::Many(v), i) => v.get(i).copied(),
            _ => None,
        }
    }

    pub fn set(&mut self, index: usize, id: NodeId) {
        match (&mut *self, index) {
            (InputList::Single(a), 0) => *a = id,
            (InputList::Pair(a, _), 0) => *a = id,
            (InputList::Pair(_, b), 1) => *b = id,
            (InputList::Triple(a, _, _), 0) => *a = id,
            (InputList::Triple(_, b, _), 1) => *b = id,
            (InputList::Triple(_, _, c), 2) => *c = id,
            (InputList::Quad(a, _, _, _), 0) => *a = id,
            (InputList::Quad(_, b, _, _), 1) => *b = id,
            (InputList::Quad(_, _, c, _), 2) => *c = id,
            (InputList::Quad(_, _, _, d), 3) => *d = id,
            (InputList::Many(v), i) if i < v.len() => v[i] = id,
            _ => opal_core::graph_bug!("input index {index} out of bounds"),
        }
    }

    pub fn push(&mut self, id: NodeId) {
        let next = match std::mem::replace(self, InputList::Empty) {
            InputList::Empty => InputList::Single(id),
            InputList::Single(a) => InputList::Pair(a, id),
            InputList::Pair(a, b) => InputList::Triple(a, b, id),
            InputList::Triple(a, b, c) => InputList::Quad(a, b, c, id),
            InputList::Quad(a, b, c, d) => InputList::Many(vec![a, b, c, d, id]),
            InputList::Many(mut v) => {
                v.push(id);
                InputList::Many(v)
            }
        };
        *self = next;
    }

    /// Remove the input at `index`, shifting the tail down.
    pub fn remove(&mut self, index: usize) {
        let mut v: Vec<NodeId> = self.iter().collect();
        if index >= v.len() {
            opal_core::graph_bug!("input index {index} out of bounds for remove");
        }
        v.remove(index);
        *self = InputList::from_slice(&v);
    }

    pub fn iter(&self) -> InputIter<'_> {
        InputIter {
            list: self,
            index: 0,
        }
    }

    pub fn to_vec(&self) -> Vec<NodeId> {
        self.iter().collect()
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.iter().any(|i| i == id)
    }
}

pub struct InputIter<'a> {
    list: &'a InputList,
    index: usize,
}

impl Iterator for InputIter<'_> {
    type Item = NodeId;

    fn next(&mut self) -> Option<NodeId> {
        let item = self.list.get(self.index);
        if item.is_some() {
            self.index += 1;
        }
        item
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let rest = self.list.len().saturating_sub(self.index);
        (rest, Some(rest))
    }
}

// =============================================================================
// Node
// =============================================================================

bitflags::bitflags! {
    /// Per-node state bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct NodeFlags: u8 {
        /// Deleted; slot survives but no live node may reference it.
        const DEAD = 1 << 0;
        /// Scheduling override: keep this node where its control
        /// predecessor is even if it would otherwise float.
        const PINNED = 1 << 1;
    }
}

/// One operation in the graph.
#[derive(Debug, Clone)]
pub struct Node {
    pub op: Op,
    pub inputs: InputList,
    pub stamp: Stamp,
    pub pos: SourcePos,
    pub flags: NodeFlags,
}

impl Node {
    pub fn new(op: Op, inputs: InputList, pos: SourcePos) -> Node {
        let stamp = op.default_stamp();
        Node {
            op,
            inputs,
            stamp,
            pos,
            flags: NodeFlags::empty(),
        }
    }

    pub fn is_dead(&self) -> bool {
        self.flags.contains(NodeFlags::DEAD)
    }

    pub fn is_pinned(&self) -> bool {
        self.flags.contains(NodeFlags::PINNED)
    }
}

// =============================================================================
// Tests
// =============================================================================
