//! Whole-program validity checks run before any analysis.

use crate::callgraph::CallGraph;
use crate::walker::reachable_nodes;
use crate::{CfgId, NodeId, Program};

// ERRORS
// ================================================================================================

/// Reasons a program is rejected for WCET analysis. Every one of them is fatal.
#[derive(Debug, thiserror::Error)]
pub enum CheckError {
    #[error("no entry point selected")]
    NoEntryPoint,
    #[error("the call graph is cyclic (recursion is not supported)")]
    CyclicCallGraph,
    #[error("instruction without address attribute in function '{cfg}', node {node}")]
    MissingAddress { cfg: String, node: u32 },
    #[error("loop without iteration bound in function '{cfg}'")]
    UnboundedLoop { cfg: String },
    #[error("improperly nested loops in function '{cfg}'")]
    ImproperNesting { cfg: String },
}

// PROGRAM CHECK
// ================================================================================================

/// Checks the program for analyzability and returns its call graph.
///
/// Verified in order: the call graph from the entry point is acyclic; every reachable
/// instruction carries an address; every loop of every non-dead CFG has an iteration bound;
/// any two loops of one CFG either nest or are disjoint. The first violation aborts the
/// whole analysis.
pub fn check_program(program: &Program) -> Result<CallGraph, CheckError> {
    let entry = program.entry_point().ok_or(CheckError::NoEntryPoint)?;
    let call_graph = CallGraph::build(program, entry);
    if call_graph.is_cyclic() {
        return Err(CheckError::CyclicCallGraph);
    }

    for node_ref in reachable_nodes(program) {
        check_node_addresses(program, node_ref.cfg, node_ref.node)?;
    }

    for (cfg_id, cfg) in program.cfgs() {
        if !call_graph.is_dead_code(cfg_id) {
            for (_, l) in cfg.loops() {
                if l.max_iterations().is_none() {
                    return Err(CheckError::UnboundedLoop { cfg: cfg.name().to_string() });
                }
            }
        }

        for (id_a, loop_a) in cfg.loops() {
            for (id_b, loop_b) in cfg.loops() {
                if id_a == id_b {
                    continue;
                }
                let properly_nested = loop_a.is_nested_in(loop_b)
                    || loop_b.is_nested_in(loop_a)
                    || loop_a.is_disjoint_from(loop_b);
                if !properly_nested {
                    return Err(CheckError::ImproperNesting { cfg: cfg.name().to_string() });
                }
            }
        }
    }

    Ok(call_graph)
}

fn check_node_addresses(
    program: &Program,
    cfg_id: CfgId,
    node_id: NodeId,
) -> Result<(), CheckError> {
    let cfg = program.cfg(cfg_id);
    let node = cfg.node(node_id);
    if node.is_isolated_nop() {
        return Ok(());
    }
    for instr in node.instructions() {
        if !instr.has_address() {
            return Err(CheckError::MissingAddress {
                cfg: cfg.name().to_string(),
                node: node_id.as_u32(),
            });
        }
    }
    Ok(())
}

// TESTS
// ================================================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::{Cfg, Instruction, Loop, Node};

    fn addressed(code: &str, addr: u64) -> Instruction {
        let mut i = Instruction::new(code);
        i.set_address(addr);
        i
    }

    #[test]
    fn rejects_missing_address() {
        let mut program = Program::new("test");
        let mut cfg = Cfg::new("main");
        cfg.add_node(Node::basic(vec![Instruction::new("addu $2, $3, $4")]));
        cfg.finalize();
        program.add_cfg(cfg);
        program.set_entry_point("main").unwrap();

        assert!(matches!(
            check_program(&program),
            Err(CheckError::MissingAddress { .. })
        ));
    }

    #[test]
    fn rejects_unbounded_loop() {
        let mut program = Program::new("test");
        let mut cfg = Cfg::new("main");
        let head = cfg.add_node(Node::basic(vec![addressed("addu $2, $3, $4", 0x1000)]));
        let body = cfg.add_node(Node::basic(vec![addressed("addu $2, $2, $4", 0x1004)]));
        let exit = cfg.add_node(Node::basic(vec![addressed("jr $31", 0x1008)]));
        cfg.add_edge(head, body);
        let back = cfg.add_edge(body, head);
        cfg.add_edge(head, exit);
        cfg.add_loop(Loop::new(head, vec![head, body], vec![back]));
        cfg.finalize();
        program.add_cfg(cfg);
        program.set_entry_point("main").unwrap();

        assert!(matches!(check_program(&program), Err(CheckError::UnboundedLoop { .. })));

        program.cfg_mut(CfgId::new(0)).loop_at_mut(crate::LoopId::new(0)).set_max_iterations(8);
        assert!(check_program(&program).is_ok());
    }

    #[test]
    fn rejects_overlapping_loops() {
        let mut program = Program::new("test");
        let mut cfg = Cfg::new("main");
        let n0 = cfg.add_node(Node::basic(vec![addressed("a", 0x0)]));
        let n1 = cfg.add_node(Node::basic(vec![addressed("b", 0x4)]));
        let n2 = cfg.add_node(Node::basic(vec![addressed("c", 0x8)]));
        cfg.add_edge(n0, n1);
        let e1 = cfg.add_edge(n1, n0);
        let e2 = cfg.add_edge(n2, n1);
        cfg.add_edge(n1, n2);
        let mut l1 = Loop::new(n0, vec![n0, n1], vec![e1]);
        let mut l2 = Loop::new(n1, vec![n1, n2], vec![e2]);
        l1.set_max_iterations(2);
        l2.set_max_iterations(2);
        cfg.add_loop(l1);
        cfg.add_loop(l2);
        cfg.finalize();
        program.add_cfg(cfg);
        program.set_entry_point("main").unwrap();

        assert!(matches!(
            check_program(&program),
            Err(CheckError::ImproperNesting { .. })
        ));
    }
}
