//! Textual graph dumps.
//!
//! Best-effort diagnostics: attached to phase-failure errors and handy in
//! test assertions. The format is one line per live node in allocation
//! order and is not a stable interface.

use std::fmt;

use crate::ir::{Graph, Op};

/// Lazy [`fmt::Display`] wrapper over a graph.
pub struct GraphDump<'a> {
    graph: &'a Graph,
}

impl<'a> GraphDump<'a> {
    pub fn new(graph: &'a Graph) -> GraphDump<'a> {
        GraphDump { graph }
    }
}

impl fmt::Display for GraphDump<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let g = self.graph;
        writeln!(
            f,
            "graph: {} live / {} slots, stages {:?}, edits {}",
            g.live_count(),
            g.len(),
            g.state.stages(),
            g.edit_count()
        )?;
        for (id, node) in g.iter_live() {
            write!(f, "  {id}: {}", node.op.mnemonic())?;
            match node.op {
                Op::ConstI32(v) => write!(f, " {v}")?,
                Op::ConstI64(v) => write!(f, " {v}")?,
                Op::ConstF32(bits) => write!(f, " {}", f32::from_bits(bits))?,
                Op::ConstF64(bits) => write!(f, " {}", f64::from_bits(bits))?,
                Op::Parameter { index, .. } => write!(f, " #{index}")?,
                Op::LoadField { field, .. } | Op::StoreField { field } => {
                    write!(f, " {field}")?
                }
                Op::New { class, fields } => write!(f, " {class}/{fields}")?,
                Op::NewArray { class, .. } | Op::NewBox { class, .. } => {
                    write!(f, " {class}")?
                }
                Op::InstanceOf(class) => write!(f, " {class}")?,
                Op::Call { target, .. } => write!(f, " {target}")?,
                Op::Guard { reason } | Op::Deopt { reason } => {
                    write!(f, " {reason:?}")?
                }
                _ => {}
            }
            if node.inputs.len() > 0 {
                write!(f, " [")?;
                for (i, input) in node.inputs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    if input.is_valid() {
                        write!(f, "{input}")?;
                    } else {
                        write!(f, "_")?;
                    }
                }
                write!(f, "]")?;
            }
            if !matches!(&node.stamp, crate::ir::Stamp::Void) {
                write!(f, " :: {}", node.stamp)?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

/// One-shot dump, for error payloads.
pub fn graph_to_string(graph: &Graph) -> String {
    GraphDump::new(graph).to_string()
}

// =============================================================================
// Tests
// =============================================================================
