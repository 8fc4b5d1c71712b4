//! Program model for the Tempo WCET analyzer.
//!
//! This crate owns everything the analyses operate on: the control-flow graphs of the program
//! under analysis, the typed attribute substrate shared between passes, the call graph, the
//! call-string context tree and the contextual walker, plus the XML round-trip of all of it.
//!
//! The model is arena-shaped: the [`Program`] owns its [`Cfg`]s, each CFG owns its nodes,
//! edges, loops and instructions, and every cross-reference is a 32-bit index newtype. Deep
//! cloning a program (needed when a pass must not leak its results) is therefore a plain
//! `Clone`.

use core::fmt;

pub mod arch;
pub mod attributes;
pub mod callgraph;
pub mod cfg;
pub mod checker;
pub mod context;
pub mod program;
pub mod serialization;
pub mod walker;

// RE-EXPORTS
// ================================================================================================

pub use arch::{Arch, Target};
pub use attributes::{names, AddressInfo, AddressRange, AttrKey, AttrMap, AttrValue};
pub use callgraph::CallGraph;
pub use cfg::{Cfg, Edge, Instruction, Loop, Node, NodeKind};
pub use checker::{check_program, CheckError};
pub use context::{Context, ContextId, ContextTree};
pub use program::Program;
pub use walker::ContextualNode;

// ID TYPES
// ================================================================================================

macro_rules! id_type {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(u32);

        impl $name {
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

        impl From<u32> for $name {
            fn from(value: u32) -> Self {
                Self(value)
            }
        }

        impl From<$name> for u32 {
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }
    };
}

id_type!(
    /// Index of a CFG within its program.
    CfgId
);
id_type!(
    /// Index of a node within its CFG.
    NodeId
);
id_type!(
    /// Index of an edge within its CFG.
    EdgeId
);
id_type!(
    /// Index of a loop within its CFG.
    LoopId
);

/// A node addressed across the whole program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeRef {
    pub cfg: CfgId,
    pub node: NodeId,
}

impl NodeRef {
    pub const fn new(cfg: CfgId, node: NodeId) -> Self {
        Self { cfg, node }
    }
}
