//! Structural graph checks (for debugging and tests).
//!
//! [`verify`] walks the whole graph and re-derives the invariants the
//! mutation API is supposed to preserve. Phases call it from tests and
//! debug builds; a failure message names the first offending node.

use super::graph::Graph;
use super::node::{EdgeClass, Op};

/// Check every graph invariant. Returns the first violation found.
pub fn verify(graph: &Graph) -> Result<(), String> {
    check_edge_duality(graph)?;
    check_liveness(graph)?;
    check_control_shape(graph)?;
    check_memory_edges(graph)?;
    Ok(())
}

/// Input edges and usage edges must be exact duals, down to multiplicity:
/// a node using the same input twice appears twice in its use list.
fn check_edge_duality(graph: &Graph) -> Result<(), String> {
    for (id, node) in graph.iter_live() {
        for input in node.inputs.iter() {
            if !input.is_valid() {
                return Err(format!("{id:?} has an invalid input slot"));
            }
            let expected = node.inputs.iter().filter(|&i| i == input).count();
            let actual = graph.uses(input).iter().filter(|&&u| u == id).count();
            if expected != actual {
                return Err(format!(
                    "edge duality broken: {id:?} references {input:?} {expected}x \
                     but appears {actual}x in its use list"
                ));
            }
        }
    }
    for id in graph.ids() {
        for &user in graph.uses(id) {
            if graph.is_dead(user) {
                return Err(format!("dead node {user:?} still registered as user of {id:?}"));
            }
            if !graph.node(user).inputs.contains(id) {
                return Err(format!(
                    "stale use edge: {user:?} listed as user of {id:?} without the input"
                ));
            }
        }
    }
    Ok(())
}

/// Live nodes must not reference dead ones, and dead nodes must be fully
/// unlinked.
fn check_liveness(graph: &Graph) -> Result<(), String> {
    for (id, node) in graph.iter_live() {
        for input in node.inputs.iter() {
            if graph.is_dead(input) {
                return Err(format!("live node {id:?} references dead node {input:?}"));
            }
        }
    }
    for id in graph.ids() {
        if graph.is_dead(id) && !graph.node(id).inputs.is_empty() {
            return Err(format!("dead node {id:?} kept its inputs"));
        }
    }
    Ok(())
}

fn check_control_shape(graph: &Graph) -> Result<(), String> {
    if !graph.node(graph.start).inputs.is_empty() {
        return Err("start node must have no inputs".into());
    }
    if !matches!(graph.op(graph.start), Op::Start) {
        return Err("graph start is not a Start node".into());
    }
    if !matches!(graph.op(graph.end), Op::End) {
        return Err("graph end is not an End node".into());
    }

    for (id, node) in graph.iter_live() {
        match node.op {
            // Exactly two projections, indices 0 and 1.
            Op::If => {
                let mut seen = [false, false];
                for &user in graph.uses(id) {
                    if let Op::Proj { index } = graph.op(user) {
                        if graph.node(user).inputs.get(0) == Some(id) {
                            let index = *index as usize;
                            if index > 1 || seen[index] {
                                return Err(format!("{id:?}: bad projection index on {user:?}"));
                            }
                            seen[index] = true;
                        }
                    }
                }
                if !(seen[0] && seen[1]) {
                    return Err(format!("{id:?}: if without both successor projections"));
                }
            }
            Op::Proj { .. } => {
                let split = node.inputs.get(0);
                if !split.is_some_and(|s| matches!(graph.op(s), Op::If)) {
                    return Err(format!("{id:?}: projection of a non-split node"));
                }
            }
            Op::LoopEnd => {
                let header = node.inputs.get(1);
                if !header.is_some_and(|h| matches!(graph.op(h), Op::LoopBegin)) {
                    return Err(format!("{id:?}: loop end without loop header"));
                }
            }
            Op::Return | Op::Throw | Op::Deopt { .. } => {
                if !graph.node(graph.end).inputs.contains(id) {
                    return Err(format!("{id:?}: exit not registered with end node"));
                }
            }
            Op::Phi { .. } | Op::MemoryPhi => {
                let region = node.inputs.get(0);
                let Some(region) = region else {
                    return Err(format!("{id:?}: phi without region"));
                };
                let preds = match graph.op(region) {
                    Op::Region | Op::LoopBegin => graph.node(region).inputs.len(),
                    _ => return Err(format!("{id:?}: phi anchored to non-merge node")),
                };
                if node.inputs.len() != preds + 1 {
                    return Err(format!(
                        "{id:?}: phi has {} operands for {} predecessors",
                        node.inputs.len() - 1,
                        preds
                    ));
                }
            }
            _ => {}
        }

        // Plain chain nodes hang off a fixed control predecessor.
        if node.op.is_fixed()
            && !matches!(node.op, Op::Start | Op::Region | Op::LoopBegin | Op::End)
        {
            let pred = node.inputs.get(0);
            let ok = pred.is_some_and(|p| graph.node(p).op.is_fixed());
            if !ok {
                return Err(format!(
                    "{id:?} ({}): fixed node without fixed control predecessor",
                    node.op.mnemonic()
                ));
            }
        }
    }
    Ok(())
}

/// Every memory input must point at a memory-state producer.
fn check_memory_edges(graph: &Graph) -> Result<(), String> {
    for (id, node) in graph.iter_live() {
        for i in 0..node.inputs.len() {
            if node.op.input_class(i) != EdgeClass::Memory {
                continue;
            }
            let Some(mem) = node.inputs.get(i) else {
                return Err(format!("{id:?}: empty memory slot {i}"));
            };
            if !graph.op(mem).is_memory_producer() {
                return Err(format!(
                    "{id:?}: memory input {mem:?} ({}) does not produce memory state",
                    graph.op(mem).mnemonic()
                ));
            }
        }
    }
    Ok(())
}
