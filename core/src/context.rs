use core::fmt;
use std::collections::VecDeque;

use crate::attributes::names;
use crate::{CfgId, NodeId, Program};

// CONTEXT ID
// ================================================================================================

/// Index of a context within the context tree of a program.
///
/// The decimal form of the id is the context's string id: it suffixes contextual attribute
/// names (`base#3`) and ILP variable names (`n_5_c3`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContextId(u32);

impl ContextId {
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }

    pub const fn to_usize(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

// CONTEXT
// ================================================================================================

/// One call-string context: the function executing, and for every context but the root, the
/// call node and context it was entered from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Context {
    function: CfgId,
    caller: Option<(ContextId, NodeId)>,
}

impl Context {
    /// The function this context executes.
    pub fn function(&self) -> CfgId {
        self.function
    }

    /// The context this one was called from, `None` for the root.
    pub fn parent(&self) -> Option<ContextId> {
        self.caller.map(|(ctx, _)| ctx)
    }

    /// The call node (in the parent context's function) that entered this context.
    pub fn caller_node(&self) -> Option<NodeId> {
        self.caller.map(|(_, node)| node)
    }
}

// CONTEXT TREE
// ================================================================================================

/// All call-string contexts stemming from the entry point.
///
/// Contexts are stored in creation (breadth-first) order; the root has id 0. Each context
/// records its outgoing links as `(call node, callee context)` pairs in call-node order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ContextTree {
    contexts: Vec<Context>,
    children: Vec<Vec<(NodeId, ContextId)>>,
}

impl ContextTree {
    /// Enumerates every context reachable from `entry` by walking call nodes breadth-first.
    ///
    /// The call graph must be acyclic; the program checker enforces this before any context
    /// tree is built.
    pub fn initialise(program: &Program, entry: CfgId) -> Self {
        let mut tree = Self {
            contexts: vec![Context { function: entry, caller: None }],
            children: vec![Vec::new()],
        };

        let mut queue = VecDeque::new();
        queue.push_back(ContextId::new(0));
        while let Some(ctx) = queue.pop_front() {
            let function = tree.contexts[ctx.to_usize()].function;
            for call_node in program.cfg(function).call_nodes() {
                let callee = program
                    .cfg(function)
                    .node(call_node)
                    .callee()
                    .expect("call node has a callee");
                let child = ContextId::new(tree.contexts.len() as u32);
                tree.contexts.push(Context { function: callee, caller: Some((ctx, call_node)) });
                tree.children.push(Vec::new());
                tree.children[ctx.to_usize()].push((call_node, child));
                queue.push_back(child);
            }
        }
        tree
    }

    /// Rebuilds a tree from `(function, caller)` entries in id order; used by
    /// deserialization. Child links are reconstructed from the caller references.
    pub fn from_entries(entries: Vec<(CfgId, Option<(ContextId, NodeId)>)>) -> Self {
        let mut tree = Self {
            contexts: entries
                .into_iter()
                .map(|(function, caller)| Context { function, caller })
                .collect(),
            children: Vec::new(),
        };
        tree.children = vec![Vec::new(); tree.contexts.len()];
        for (index, ctx) in tree.contexts.iter().enumerate() {
            if let Some((parent, call_node)) = ctx.caller {
                tree.children[parent.to_usize()].push((call_node, ContextId::new(index as u32)));
            }
        }
        tree
    }

    pub fn root(&self) -> ContextId {
        ContextId::new(0)
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    pub fn context(&self, id: ContextId) -> &Context {
        &self.contexts[id.to_usize()]
    }

    pub fn ids(&self) -> impl Iterator<Item = ContextId> + '_ {
        (0..self.contexts.len() as u32).map(ContextId::new)
    }

    /// The context entered by taking `call` in context `ctx`. Always defined when `call` is a
    /// call node of `ctx`'s function and the tree belongs to the current program.
    pub fn callee_context(&self, ctx: ContextId, call: NodeId) -> Option<ContextId> {
        self.children[ctx.to_usize()]
            .iter()
            .find(|(node, _)| *node == call)
            .map(|(_, child)| *child)
    }

    /// True when some ancestor of `ctx` was entered from a call node lying inside a loop of
    /// the ancestor's function.
    pub fn caller_in_loop(&self, program: &Program, ctx: ContextId) -> bool {
        let mut current = ctx;
        while let Some((parent, call_node)) = self.contexts[current.to_usize()].caller {
            let caller_cfg = program.cfg(self.contexts[parent.to_usize()].function);
            if caller_cfg.loops().any(|(_, l)| l.contains(call_node)) {
                return true;
            }
            current = parent;
        }
        false
    }
}

// CONTEXT LIFECYCLE
// ================================================================================================

/// Builds the context tree for the current entry point and attaches the per-CFG context lists.
///
/// Any contexts from a previous entry point are purged first, together with every contextual
/// attribute they anchored.
pub fn compute_contexts(program: &mut Program) -> Result<(), ContextError> {
    let entry = program.entry_point().ok_or(ContextError::NoEntryPoint)?;
    if program.cfg(entry).is_empty() {
        return Err(ContextError::EmptyEntryPoint);
    }
    reset_contexts(program);

    let tree = ContextTree::initialise(program, entry);
    let mut lists: Vec<Vec<ContextId>> = vec![Vec::new(); program.num_cfgs()];
    for id in tree.ids() {
        lists[tree.context(id).function().to_usize()].push(id);
    }
    for (cfg_id, list) in lists.into_iter().enumerate() {
        program.cfg_mut(CfgId::new(cfg_id as u32)).set_context_list(list);
    }
    tracing::debug!(contexts = tree.len(), "context tree built");
    program.set_contexts(tree);
    Ok(())
}

/// Removes the context tree and every attribute anchored to a context: contextual attribute
/// keys everywhere, the per-CFG context lists, the per-context frequency attributes, and the
/// WCET of the previous entry point.
pub fn reset_contexts(program: &mut Program) {
    if program.take_contexts().is_none() {
        return;
    }
    let frequency_prefix = format!("{}_c", names::FREQUENCY);
    for cfg_id in program.cfg_ids().collect::<Vec<_>>() {
        let cfg = program.cfg_mut(cfg_id);
        cfg.attrs_mut().remove_matching(|k| {
            k.context().is_some() || k.base() == names::CONTEXT_LIST || k.base() == names::WCET
        });
        for node_id in cfg.node_ids().collect::<Vec<_>>() {
            let node = cfg.node_mut(node_id);
            node.attrs_mut().remove_matching(|k| {
                k.context().is_some() || k.base().starts_with(&frequency_prefix)
            });
            for instr in node.instructions_mut() {
                instr.attrs_mut().remove_matching(|k| k.context().is_some());
            }
        }
        for edge_id in cfg.edge_ids().collect::<Vec<_>>() {
            cfg.edge_mut(edge_id).attrs_mut().remove_matching(|k| k.context().is_some());
        }
    }
}

// ERRORS
// ================================================================================================

#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error("no entry point selected")]
    NoEntryPoint,
    #[error("the entry point has no body")]
    EmptyEntryPoint,
}

// TESTS
// ================================================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::{Cfg, Instruction, Node};

    /// main calls f twice; f calls g once. Contexts: main, f@call1, f@call2, g via each f.
    fn two_call_program() -> Program {
        let mut program = Program::new("test");
        let f = CfgId::new(1);
        let g = CfgId::new(2);

        let mut main_cfg = Cfg::new("main");
        let c1 = main_cfg.add_node(Node::call(f, vec![Instruction::new("jal f")]));
        let c2 = main_cfg.add_node(Node::call(f, vec![Instruction::new("jal f")]));
        main_cfg.add_edge(c1, c2);
        main_cfg.finalize();

        let mut f_cfg = Cfg::new("f");
        f_cfg.add_node(Node::call(g, vec![Instruction::new("jal g")]));
        f_cfg.finalize();

        let mut g_cfg = Cfg::new("g");
        g_cfg.add_node(Node::basic(vec![Instruction::new("nop")]));
        g_cfg.finalize();

        program.add_cfg(main_cfg);
        program.add_cfg(f_cfg);
        program.add_cfg(g_cfg);
        program.set_entry_point("main").unwrap();
        program
    }

    #[test]
    fn one_context_per_call_path() {
        let mut program = two_call_program();
        compute_contexts(&mut program).unwrap();
        let tree = program.contexts().unwrap();

        // main, two f contexts, one g context below each f context.
        assert_eq!(tree.len(), 5);
        assert_eq!(program.cfg(CfgId::new(0)).context_list().len(), 1);
        assert_eq!(program.cfg(CfgId::new(1)).context_list().len(), 2);
        assert_eq!(program.cfg(CfgId::new(2)).context_list().len(), 2);
    }

    #[test]
    fn callee_context_follows_call_nodes() {
        let mut program = two_call_program();
        compute_contexts(&mut program).unwrap();
        let tree = program.contexts().unwrap();
        let root = tree.root();

        let f1 = tree.callee_context(root, NodeId::new(0)).unwrap();
        let f2 = tree.callee_context(root, NodeId::new(1)).unwrap();
        assert_ne!(f1, f2);
        assert_eq!(tree.context(f1).function(), CfgId::new(1));
        assert_eq!(tree.context(f1).parent(), Some(root));

        let g1 = tree.callee_context(f1, NodeId::new(0)).unwrap();
        assert_eq!(tree.context(g1).function(), CfgId::new(2));
    }

    #[test]
    fn reset_purges_contextual_attributes() {
        use crate::attributes::AttrValue;

        let mut program = two_call_program();
        compute_contexts(&mut program).unwrap();
        let ctx = program.cfg(CfgId::new(0)).context_list()[0];

        let cfg = program.cfg_mut(CfgId::new(0));
        cfg.node_mut(NodeId::new(0))
            .attrs_mut()
            .set_in_ctx("NodeExecTimeFirst", ctx, AttrValue::Int(12));

        compute_contexts(&mut program).unwrap();
        let cfg = program.cfg(CfgId::new(0));
        assert!(cfg.node(NodeId::new(0)).attrs().get_in_ctx("NodeExecTimeFirst", ctx).is_none());
        // Context lists are rebuilt.
        assert_eq!(cfg.context_list().len(), 1);
    }

    #[test]
    fn caller_in_loop_walks_ancestors() {
        let mut program = Program::new("test");
        let f = CfgId::new(1);
        let g = CfgId::new(2);

        // main: loop { call f }; f: call g; g: leaf.
        let mut main_cfg = Cfg::new("main");
        let head = main_cfg.add_node(Node::basic(vec![Instruction::new("nop2")]));
        let call = main_cfg.add_node(Node::call(f, vec![Instruction::new("jal f")]));
        let exit = main_cfg.add_node(Node::basic(vec![Instruction::new("jr $31")]));
        main_cfg.add_edge(head, call);
        let back = main_cfg.add_edge(call, head);
        main_cfg.add_edge(head, exit);
        main_cfg.add_loop(crate::cfg::Loop::new(head, vec![head, call], vec![back]));
        main_cfg.finalize();

        let mut f_cfg = Cfg::new("f");
        f_cfg.add_node(Node::call(g, vec![Instruction::new("jal g")]));
        f_cfg.finalize();

        let mut g_cfg = Cfg::new("g");
        g_cfg.add_node(Node::basic(vec![Instruction::new("nop3")]));
        g_cfg.finalize();

        program.add_cfg(main_cfg);
        program.add_cfg(f_cfg);
        program.add_cfg(g_cfg);
        program.set_entry_point("main").unwrap();
        compute_contexts(&mut program).unwrap();

        let tree = program.contexts().unwrap();
        let root = tree.root();
        let f_ctx = tree.callee_context(root, NodeId::new(1)).unwrap();
        let g_ctx = tree.callee_context(f_ctx, NodeId::new(0)).unwrap();

        assert!(!tree.caller_in_loop(&program, root));
        assert!(tree.caller_in_loop(&program, f_ctx));
        // g's direct caller is not in a loop, but a transitive one is.
        assert!(tree.caller_in_loop(&program, g_ctx));
    }
}
