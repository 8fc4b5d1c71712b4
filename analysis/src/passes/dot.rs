use std::fmt::Write as _;
use std::fs;
use std::path::PathBuf;

use tempo_core::{CallGraph, Program};

use crate::{Analysis, AnalysisError};

// DOT PRINT
// ================================================================================================

/// Graphviz rendering of every non-dead CFG: one cluster per function, basic blocks labelled
/// with their address range, call edges between clusters, back-edges dashed.
pub struct DotPrint {
    directory: PathBuf,
}

impl DotPrint {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self { directory: directory.into() }
    }

    fn render(&self, program: &Program, call_graph: &CallGraph) -> String {
        let mut out = String::new();
        out.push_str("digraph program {\n");
        for (cfg_id, cfg) in program.cfgs() {
            if call_graph.is_dead_code(cfg_id) || cfg.is_external() {
                continue;
            }
            let _ = writeln!(out, "  subgraph cluster_{cfg_id} {{");
            let _ = writeln!(out, "    label=\"{}\";", cfg.name());
            for (node_id, node) in cfg.nodes() {
                let label = match (node.start_address(), node.callee()) {
                    (Some(addr), Some(callee)) => {
                        format!("{:#x}\\ncall {}", addr, program.cfg(callee).name())
                    },
                    (Some(addr), None) => format!("{addr:#x}"),
                    (None, Some(callee)) => format!("call {}", program.cfg(callee).name()),
                    (None, None) => String::new(),
                };
                let _ = writeln!(
                    out,
                    "    n{cfg_id}_{node_id} [shape=box, label=\"{label}\"];"
                );
            }

            let back_edges: Vec<_> = cfg
                .loops()
                .flat_map(|(_, l)| l.back_edges().iter().copied())
                .collect();
            for (edge_id, edge) in cfg.edges() {
                let style = if back_edges.contains(&edge_id) { " [style=dashed]" } else { "" };
                let _ = writeln!(
                    out,
                    "    n{cfg_id}_{} -> n{cfg_id}_{}{style};",
                    edge.source(),
                    edge.target()
                );
            }
            out.push_str("  }\n");
        }

        // Call edges cross cluster boundaries.
        for (cfg_id, cfg) in program.cfgs() {
            if call_graph.is_dead_code(cfg_id) {
                continue;
            }
            for node_id in cfg.call_nodes() {
                let callee = cfg.node(node_id).callee().expect("call node has a callee");
                if program.cfg(callee).is_external() || program.cfg(callee).is_empty() {
                    continue;
                }
                if let Some(start) = program.cfg(callee).start_node() {
                    let _ = writeln!(
                        out,
                        "  n{cfg_id}_{node_id} -> n{callee}_{start} [color=blue];"
                    );
                }
            }
        }
        out.push_str("}\n");
        out
    }
}

impl Analysis for DotPrint {
    fn name(&self) -> &'static str {
        "DOTPRINT"
    }

    fn check_input_attributes(&mut self, program: &Program) -> Result<(), AnalysisError> {
        if program.entry_point().is_none() {
            return Err(AnalysisError::input("DOTPRINT", "no entry point selected"));
        }
        Ok(())
    }

    fn perform(&mut self, program: &mut Program) -> Result<(), AnalysisError> {
        let entry = program.entry_point().expect("checked above");
        let call_graph = CallGraph::build(program, entry);
        let dot = self.render(program, &call_graph);
        let path = self.directory.join(format!("{}.dot", program.name()));
        fs::write(&path, dot)?;
        tracing::info!(path = %path.display(), "control-flow graph written");
        Ok(())
    }
}

// TESTS
// ================================================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempo_core::cfg::{Cfg, Instruction, Node};
    use tempo_core::CfgId;

    #[test]
    fn rendering_includes_blocks_and_call_edges() {
        let mut program = Program::new("sample");
        let f = CfgId::new(1);
        let mut main_cfg = Cfg::new("main");
        let mut call = Instruction::new("jal f");
        call.set_address(0x100);
        main_cfg.add_node(Node::call(f, vec![call]));
        main_cfg.finalize();
        let mut f_cfg = Cfg::new("f");
        let mut body = Instruction::new("jr $31");
        body.set_address(0x200);
        f_cfg.add_node(Node::basic(vec![body]));
        f_cfg.finalize();
        program.add_cfg(main_cfg);
        program.add_cfg(f_cfg);
        program.set_entry_point("main").unwrap();

        let printer = DotPrint::new(".");
        let entry = program.entry_point().unwrap();
        let call_graph = CallGraph::build(&program, entry);
        let dot = printer.render(&program, &call_graph);

        assert!(dot.contains("label=\"main\";"));
        assert!(dot.contains("n0_0 -> n1_0 [color=blue];"));
        assert!(dot.contains("0x100\\ncall f"));
    }
}
