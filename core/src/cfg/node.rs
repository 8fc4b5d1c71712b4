use super::Instruction;
use crate::attributes::AttrMap;
use crate::CfgId;

// NODE
// ================================================================================================

/// Discriminant of a CFG node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// A plain basic block.
    Basic,
    /// A basic block ending in a call to another CFG. For its own CFG it behaves as a
    /// degenerate basic block; the callee is entered by the contextual walker.
    Call { callee: CfgId },
}

/// A node of a control-flow graph: a basic block or a call block.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    kind: NodeKind,
    instructions: Vec<Instruction>,
    isolated_nop: bool,
    attrs: AttrMap,
}

impl Node {
    pub fn basic(instructions: Vec<Instruction>) -> Self {
        Self {
            kind: NodeKind::Basic,
            instructions,
            isolated_nop: false,
            attrs: AttrMap::new(),
        }
    }

    pub fn call(callee: CfgId, instructions: Vec<Instruction>) -> Self {
        Self {
            kind: NodeKind::Call { callee },
            instructions,
            isolated_nop: false,
            attrs: AttrMap::new(),
        }
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    pub fn is_call(&self) -> bool {
        matches!(self.kind, NodeKind::Call { .. })
    }

    /// Returns the callee CFG when this node is a call.
    pub fn callee(&self) -> Option<CfgId> {
        match self.kind {
            NodeKind::Call { callee } => Some(callee),
            NodeKind::Basic => None,
        }
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    pub fn instructions_mut(&mut self) -> &mut [Instruction] {
        &mut self.instructions
    }

    /// True when the node body is a single architecture no-op; such nodes are skipped by every
    /// analysis and by ILP variable generation.
    pub fn is_isolated_nop(&self) -> bool {
        self.isolated_nop
    }

    pub fn set_isolated_nop(&mut self, value: bool) {
        self.isolated_nop = value;
    }

    pub fn attrs(&self) -> &AttrMap {
        &self.attrs
    }

    pub fn attrs_mut(&mut self) -> &mut AttrMap {
        &mut self.attrs
    }

    /// Returns the address of the first instruction, if any instruction carries one.
    pub fn start_address(&self) -> Option<u64> {
        self.instructions.first().and_then(Instruction::address)
    }
}
