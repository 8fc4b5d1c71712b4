use crate::attributes::{names, AttrMap, AttrValue};
use crate::{EdgeId, NodeId};

// LOOP
// ================================================================================================

/// A natural loop of a CFG: a distinguished head, the set of member nodes, and the back-edges
/// returning to the head.
#[derive(Debug, Clone, PartialEq)]
pub struct Loop {
    head: NodeId,
    nodes: Vec<NodeId>,
    back_edges: Vec<EdgeId>,
    attrs: AttrMap,
}

impl Loop {
    /// Creates a loop; `nodes` must contain the head.
    pub fn new(head: NodeId, mut nodes: Vec<NodeId>, back_edges: Vec<EdgeId>) -> Self {
        nodes.sort_unstable();
        nodes.dedup();
        Self { head, nodes, back_edges, attrs: AttrMap::new() }
    }

    pub fn head(&self) -> NodeId {
        self.head
    }

    /// Member nodes in ascending id order.
    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    pub fn back_edges(&self) -> &[EdgeId] {
        &self.back_edges
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.nodes.binary_search(&node).is_ok()
    }

    /// True when every node of `self` belongs to `other`.
    pub fn is_nested_in(&self, other: &Loop) -> bool {
        self.nodes.iter().all(|n| other.contains(*n))
    }

    /// True when the two loops share no node.
    pub fn is_disjoint_from(&self, other: &Loop) -> bool {
        self.nodes.iter().all(|n| !other.contains(*n))
    }

    /// Returns the iteration bound, if attached.
    pub fn max_iterations(&self) -> Option<u64> {
        self.attrs
            .get_plain(names::MAXITER)
            .and_then(AttrValue::as_int)
            .and_then(|v| u64::try_from(v).ok())
    }

    pub fn set_max_iterations(&mut self, bound: u64) {
        self.attrs.set_plain(names::MAXITER, AttrValue::Int(bound as i64));
    }

    pub fn attrs(&self) -> &AttrMap {
        &self.attrs
    }

    pub fn attrs_mut(&mut self) -> &mut AttrMap {
        &mut self.attrs
    }
}
