use super::GraphNode;
use crate::error::Result;
use std::collections::HashSet;
use std::rc::Rc;
use tracing::warn;

/// Runs every node reachable from `root` in reverse topological order.
///
/// A node therefore runs only after every node consuming its output has pushed its gradient
/// contribution. The first failing node aborts the pass: nodes that already ran are
/// [aborted](GraphNode::abort) and every node below the root discards its gradient.
pub fn backward(root: Option<Rc<dyn GraphNode>>) -> Result<()> {
    let Some(root) = root else { return Ok(()) };

    let mut topo = Vec::new();
    let mut visited = HashSet::new();
    build_topo(root, &mut topo, &mut visited);
    topo.reverse();

    for (i, node) in topo.iter().enumerate() {
        if let Err(err) = node.backward() {
            warn!(%err, completed = i, total = topo.len(), "backward pass failed");
            unwind(&topo, i);
            return Err(err);
        }
    }
    Ok(())
}

/// Cleans up after `order[failed]` returned an error. `order[0]` is the root.
fn unwind(order: &[Rc<dyn GraphNode>], failed: usize) {
    for node in order[..failed].iter().rev() {
        node.abort();
    }
    for node in &order[1..] {
        node.discard_grad();
    }
}

fn build_topo(
    node: Rc<dyn GraphNode>,
    topo: &mut Vec<Rc<dyn GraphNode>>,
    visited: &mut HashSet<*const ()>,
) {
    // The data pointer of the fat `Rc<dyn _>` identifies the node.
    let ptr = Rc::as_ptr(&node) as *const ();
    if !visited.insert(ptr) {
        return;
    }

    for parent in node.parents() {
        build_topo(parent, topo, visited);
    }

    topo.push(node);
}
