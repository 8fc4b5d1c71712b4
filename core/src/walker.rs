//! Traversal of the program as (context, node) pairs.
//!
//! The contextual walker is the substrate every fixed-point analysis iterates on: successors
//! descend into callees at call nodes and return to the caller's post-call nodes at function
//! ends, predecessors are the exact dual, and back-edges can be filtered out for the first
//! phase of the Must analysis.

use std::collections::BTreeSet;

use smallvec::SmallVec;

use crate::callgraph::CallGraph;
use crate::context::{ContextId, ContextTree};
use crate::{CfgId, EdgeId, NodeId, NodeRef, Program};

// CONTEXTUAL NODE
// ================================================================================================

/// A CFG node paired with the execution context it is analyzed in.
///
/// The node always belongs to the function of `ctx`. Ordering is `(ctx, node)`, which gives
/// every work-list a deterministic iteration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContextualNode {
    pub ctx: ContextId,
    pub node: NodeId,
}

impl ContextualNode {
    pub const fn new(ctx: ContextId, node: NodeId) -> Self {
        Self { ctx, node }
    }

    /// The CFG this node belongs to.
    pub fn cfg(&self, tree: &ContextTree) -> CfgId {
        tree.context(self.ctx).function()
    }
}

/// Scratch list for neighbor sets; most nodes have very few.
pub type Neighbors = SmallVec<[ContextualNode; 4]>;

// TRAVERSAL
// ================================================================================================

/// Returns the contextual successors of `cn`.
///
/// A call node with a real callee continues at the callee entry in the callee context; an end
/// node returns to the successors of the caller node in the parent context; everything else
/// stays inside the CFG.
pub fn contextual_successors(
    program: &Program,
    tree: &ContextTree,
    cn: ContextualNode,
) -> Neighbors {
    let cfg_id = cn.cfg(tree);
    let cfg = program.cfg(cfg_id);
    let node = cfg.node(cn.node);

    if let Some(callee) = node.callee() {
        let callee_cfg = program.cfg(callee);
        if !callee_cfg.is_external() && !callee_cfg.is_empty() {
            let callee_ctx = tree
                .callee_context(cn.ctx, cn.node)
                .expect("context tree covers every call node");
            let start = callee_cfg.start_node().expect("non-empty CFG has a start node");
            let mut out = Neighbors::new();
            out.push(ContextualNode::new(callee_ctx, start));
            return out;
        }
    }

    let intra = cfg.successors(cn.node);
    if intra.is_empty() {
        // An end node: execution resumes after the caller node, if any.
        let ctx = tree.context(cn.ctx);
        if let (Some(parent), Some(caller_node)) = (ctx.parent(), ctx.caller_node()) {
            let caller_cfg = program.cfg(tree.context(parent).function());
            return caller_cfg
                .successors(caller_node)
                .iter()
                .map(|s| ContextualNode::new(parent, *s))
                .collect();
        }
        return Neighbors::new();
    }

    intra.iter().map(|s| ContextualNode::new(cn.ctx, *s)).collect()
}

/// Returns the contextual predecessors of `cn` (the dual of [`contextual_successors`]).
pub fn contextual_predecessors(
    program: &Program,
    tree: &ContextTree,
    cn: ContextualNode,
) -> Neighbors {
    let cfg_id = cn.cfg(tree);
    let cfg = program.cfg(cfg_id);
    let mut preds = Neighbors::new();

    // Entering the function: the caller node precedes the start node.
    if cfg.start_node() == Some(cn.node) {
        let ctx = tree.context(cn.ctx);
        if let (Some(parent), Some(caller_node)) = (ctx.parent(), ctx.caller_node()) {
            preds.push(ContextualNode::new(parent, caller_node));
        }
    }

    for &p in cfg.predecessors(cn.node) {
        let pred_node = cfg.node(p);
        match pred_node.callee() {
            Some(callee)
                if !program.cfg(callee).is_external() && !program.cfg(callee).is_empty() =>
            {
                // Control reaches us by returning from the callee's end nodes.
                let callee_ctx = tree
                    .callee_context(cn.ctx, p)
                    .expect("context tree covers every call node");
                for end in program.cfg(callee).end_nodes() {
                    preds.push(ContextualNode::new(callee_ctx, end));
                }
            },
            _ => preds.push(ContextualNode::new(cn.ctx, p)),
        }
    }
    preds
}

/// The initial work set: the entry CFG's start node in the root context.
pub fn init_work(program: &Program, tree: &ContextTree) -> BTreeSet<ContextualNode> {
    let mut work = BTreeSet::new();
    if let Some(entry) = program.entry_point() {
        if let Some(start) = program.cfg(entry).start_node() {
            work.insert(ContextualNode::new(tree.root(), start));
        }
    }
    work
}

// BACK-EDGES
// ================================================================================================

/// Union of the back-edges of every loop of every non-dead CFG.
pub fn compute_back_edges(
    program: &Program,
    call_graph: &CallGraph,
) -> BTreeSet<(CfgId, EdgeId)> {
    let mut back_edges = BTreeSet::new();
    for (cfg_id, cfg) in program.cfgs() {
        if call_graph.is_dead_code(cfg_id) {
            continue;
        }
        for (_, l) in cfg.loops() {
            for edge in l.back_edges() {
                back_edges.insert((cfg_id, *edge));
            }
        }
    }
    back_edges
}

/// False iff the intra-CFG edge `pred -> current` is a loop back-edge. Cross-CFG steps (calls
/// and returns) are never back-edges.
pub fn filter_back_edge(
    program: &Program,
    tree: &ContextTree,
    current: ContextualNode,
    pred: ContextualNode,
    back_edges: &BTreeSet<(CfgId, EdgeId)>,
) -> bool {
    let current_cfg = current.cfg(tree);
    if pred.cfg(tree) != current_cfg {
        return true;
    }
    match program.cfg(current_cfg).find_edge(pred.node, current.node) {
        Some(edge) => !back_edges.contains(&(current_cfg, edge)),
        None => true,
    }
}

// REACHABLE NODES
// ================================================================================================

/// Every node reachable from the entry point, in a deterministic breadth-first order.
///
/// The walk follows intra-CFG successors and enters a callee at most once, exactly like the
/// reachability used by the program checker; context is deliberately ignored here.
pub fn reachable_nodes(program: &Program) -> Vec<NodeRef> {
    let mut order = Vec::new();
    let entry = match program.entry_point() {
        Some(entry) => entry,
        None => return order,
    };
    let start = match program.cfg(entry).start_node() {
        Some(start) => start,
        None => return order,
    };

    let mut visited = BTreeSet::new();
    let mut queue = std::collections::VecDeque::new();
    let root = NodeRef::new(entry, start);
    visited.insert(root);
    queue.push_back(root);

    while let Some(current) = queue.pop_front() {
        let cfg = program.cfg(current.cfg);
        for &s in cfg.successors(current.node) {
            let next = NodeRef::new(current.cfg, s);
            if visited.insert(next) {
                queue.push_back(next);
            }
        }
        if let Some(callee) = cfg.node(current.node).callee() {
            let callee_cfg = program.cfg(callee);
            if !callee_cfg.is_external() {
                if let Some(callee_start) = callee_cfg.start_node() {
                    let next = NodeRef::new(callee, callee_start);
                    if visited.insert(next) {
                        queue.push_back(next);
                    }
                }
            }
        }
        order.push(current);
    }
    order
}

// TESTS
// ================================================================================================
