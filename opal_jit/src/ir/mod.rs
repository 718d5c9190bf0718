//! Sea-of-Nodes Intermediate Representation.
//!
//! One graph per compiled method:
//!
//! # Core Components
//!
//! - **Stamps** (`stamp.rs`): Value-range lattice driving folding
//! - **Node** (`node.rs`): Closed operation set and edge layouts
//! - **Arena** (`arena.rs`): Node storage, side tables, bit sets
//! - **Graph** (`graph.rs`): The container; keeps input and usage edges dual
//! - **Builder** (`builder.rs`): Programmatic construction with control and
//!   memory cursors
//! - **Verify** (`verify.rs`): Whole-graph invariant checks for tests
//!
//! # Design Principles
//!
//! - **Arena allocation**: O(1) node creation, ids stay stable, deletion
//!   marks dead instead of freeing
//! - **Dual edges**: usage lists maintained by every mutation, never rebuilt
//! - **Fixed/floating split**: control-chained nodes keep program order,
//!   pure nodes float until scheduling

pub mod arena;
pub mod builder;
pub mod graph;
pub mod node;
pub mod stamp;
pub mod verify;

// Re-export commonly used types
pub use arena::{Arena, BitSet, Id, SecondaryMap};
pub use builder::{Exit, GraphBuilder};
pub use graph::{Graph, GraphState, StageSet};
pub use node::{
    CmpOp, ConvertOp, DeoptReason, EdgeClass, FieldId, FloatArith, InputList, IntArith, MemLoc,
    MethodId, Node, NodeFlags, NodeId, Op, OpKind,
};
pub use stamp::{ClassId, FloatStamp, IntStamp, RefStamp, Stamp, ValKind};
