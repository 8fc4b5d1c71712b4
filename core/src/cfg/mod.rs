mod instruction;
pub use instruction::Instruction;

mod node;
pub use node::{Node, NodeKind};

mod loops;
pub use loops::Loop;

use crate::attributes::{names, AttrMap, AttrValue};
use crate::context::ContextId;
use crate::{EdgeId, LoopId, NodeId};

// EDGE
// ================================================================================================

/// A directed edge between two nodes of the same CFG.
#[derive(Debug, Clone, PartialEq)]
pub struct Edge {
    source: NodeId,
    target: NodeId,
    attrs: AttrMap,
}

impl Edge {
    pub fn new(source: NodeId, target: NodeId) -> Self {
        Self { source, target, attrs: AttrMap::new() }
    }

    pub fn source(&self) -> NodeId {
        self.source
    }

    pub fn target(&self) -> NodeId {
        self.target
    }

    pub fn attrs(&self) -> &AttrMap {
        &self.attrs
    }

    pub fn attrs_mut(&mut self) -> &mut AttrMap {
        &mut self.attrs
    }
}

// CFG
// ================================================================================================

/// A control-flow graph of one function.
///
/// Nodes, edges and loops are arena-owned; all cross-references are indices, so cloning a CFG
/// (or the whole program) needs no pointer rewriting. The topology is frozen once
/// [`Cfg::finalize`] has run; analyses only ever mutate attributes.
#[derive(Debug, Clone, PartialEq)]
pub struct Cfg {
    name: String,
    external: bool,
    nodes: Vec<Node>,
    edges: Vec<Edge>,
    loops: Vec<Loop>,
    successors: Vec<Vec<NodeId>>,
    predecessors: Vec<Vec<NodeId>>,
    attrs: AttrMap,
}

impl Cfg {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            external: false,
            nodes: Vec::new(),
            edges: Vec::new(),
            loops: Vec::new(),
            successors: Vec::new(),
            predecessors: Vec::new(),
            attrs: AttrMap::new(),
        }
    }

    /// Creates a CFG without a body (a function outside the analyzed binary).
    pub fn external(name: impl Into<String>) -> Self {
        let mut cfg = Self::new(name);
        cfg.external = true;
        cfg
    }

    // CONSTRUCTION
    // --------------------------------------------------------------------------------------------

    pub fn add_node(&mut self, node: Node) -> NodeId {
        let id = NodeId::new(self.nodes.len() as u32);
        self.nodes.push(node);
        id
    }

    pub fn add_edge(&mut self, source: NodeId, target: NodeId) -> EdgeId {
        let id = EdgeId::new(self.edges.len() as u32);
        self.edges.push(Edge::new(source, target));
        id
    }

    pub fn add_loop(&mut self, l: Loop) -> LoopId {
        let id = LoopId::new(self.loops.len() as u32);
        self.loops.push(l);
        id
    }

    /// Builds the adjacency tables. Must be called once the node and edge sets are complete.
    pub fn finalize(&mut self) {
        self.successors = vec![Vec::new(); self.nodes.len()];
        self.predecessors = vec![Vec::new(); self.nodes.len()];
        for edge in &self.edges {
            self.successors[edge.source.to_usize()].push(edge.target);
            self.predecessors[edge.target.to_usize()].push(edge.source);
        }
    }

    // ACCESSORS
    // --------------------------------------------------------------------------------------------

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_external(&self) -> bool {
        self.external
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.to_usize()]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.to_usize()]
    }

    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        (0..self.nodes.len() as u32).map(NodeId::new)
    }

    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &Node)> {
        self.nodes.iter().enumerate().map(|(i, n)| (NodeId::new(i as u32), n))
    }

    pub fn edge(&self, id: EdgeId) -> &Edge {
        &self.edges[id.to_usize()]
    }

    pub fn edge_mut(&mut self, id: EdgeId) -> &mut Edge {
        &mut self.edges[id.to_usize()]
    }

    pub fn edge_ids(&self) -> impl Iterator<Item = EdgeId> + '_ {
        (0..self.edges.len() as u32).map(EdgeId::new)
    }

    pub fn edges(&self) -> impl Iterator<Item = (EdgeId, &Edge)> {
        self.edges.iter().enumerate().map(|(i, e)| (EdgeId::new(i as u32), e))
    }

    pub fn loop_ids(&self) -> impl Iterator<Item = LoopId> + '_ {
        (0..self.loops.len() as u32).map(LoopId::new)
    }

    pub fn loops(&self) -> impl Iterator<Item = (LoopId, &Loop)> {
        self.loops.iter().enumerate().map(|(i, l)| (LoopId::new(i as u32), l))
    }

    pub fn loop_at(&self, id: LoopId) -> &Loop {
        &self.loops[id.to_usize()]
    }

    pub fn loop_at_mut(&mut self, id: LoopId) -> &mut Loop {
        &mut self.loops[id.to_usize()]
    }

    pub fn attrs(&self) -> &AttrMap {
        &self.attrs
    }

    pub fn attrs_mut(&mut self) -> &mut AttrMap {
        &mut self.attrs
    }

    // TOPOLOGY QUERIES
    // --------------------------------------------------------------------------------------------

    /// Returns the entry node: the first node with no intra-CFG predecessor, falling back to
    /// node 0 when the entry participates in a cycle.
    pub fn start_node(&self) -> Option<NodeId> {
        if self.nodes.is_empty() {
            return None;
        }
        self.node_ids()
            .find(|id| self.predecessors[id.to_usize()].is_empty())
            .or(Some(NodeId::new(0)))
    }

    /// Returns the nodes with no outgoing edge, in id order.
    pub fn end_nodes(&self) -> Vec<NodeId> {
        self.node_ids().filter(|id| self.successors[id.to_usize()].is_empty()).collect()
    }

    pub fn successors(&self, id: NodeId) -> &[NodeId] {
        &self.successors[id.to_usize()]
    }

    pub fn predecessors(&self, id: NodeId) -> &[NodeId] {
        &self.predecessors[id.to_usize()]
    }

    pub fn find_edge(&self, source: NodeId, target: NodeId) -> Option<EdgeId> {
        self.edges
            .iter()
            .position(|e| e.source == source && e.target == target)
            .map(|i| EdgeId::new(i as u32))
    }

    pub fn incoming_edges(&self, target: NodeId) -> Vec<EdgeId> {
        self.edges()
            .filter_map(|(id, e)| (e.target == target).then_some(id))
            .collect()
    }

    pub fn outgoing_edges(&self, source: NodeId) -> Vec<EdgeId> {
        self.edges()
            .filter_map(|(id, e)| (e.source == source).then_some(id))
            .collect()
    }

    /// Call nodes in id (source) order.
    pub fn call_nodes(&self) -> Vec<NodeId> {
        self.nodes()
            .filter_map(|(id, n)| n.is_call().then_some(id))
            .collect()
    }

    /// Nodes that are not single-nop filler, in id order.
    pub fn real_nodes(&self) -> Vec<NodeId> {
        self.nodes()
            .filter_map(|(id, n)| (!n.is_isolated_nop()).then_some(id))
            .collect()
    }

    /// Returns the nodes of `l` that belong to no other loop nested inside `l`.
    pub fn loop_nodes_not_nested(&self, l: LoopId) -> Vec<NodeId> {
        let outer = self.loop_at(l);
        outer
            .nodes()
            .iter()
            .copied()
            .filter(|n| {
                !self.loops().any(|(id, inner)| {
                    id != l && inner.is_nested_in(outer) && inner.contains(*n)
                })
            })
            .collect()
    }

    // CONTEXT LIST
    // --------------------------------------------------------------------------------------------

    /// Returns the execution contexts of this CFG, empty when the context tree has not been
    /// built yet.
    pub fn context_list(&self) -> &[ContextId] {
        self.attrs
            .get_plain(names::CONTEXT_LIST)
            .and_then(AttrValue::as_context_list)
            .unwrap_or(&[])
    }

    pub fn set_context_list(&mut self, contexts: Vec<ContextId>) {
        self.attrs.set_plain(names::CONTEXT_LIST, AttrValue::ContextList(contexts));
    }

    pub fn has_context_list(&self) -> bool {
        self.attrs.has(&crate::attributes::AttrKey::plain(names::CONTEXT_LIST))
    }
}
