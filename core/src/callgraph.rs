use std::collections::BTreeSet;

use crate::{CfgId, Program};

// CALL GRAPH
// ================================================================================================

/// The call graph of a program, rooted at its entry point.
///
/// Built once per entry point; the analyses use it for the cyclicity check and to skip dead
/// CFGs (functions never reached from the entry point).
#[derive(Debug, Clone)]
pub struct CallGraph {
    root: CfgId,
    callees: Vec<BTreeSet<CfgId>>,
    reachable: BTreeSet<CfgId>,
    cyclic: bool,
}

impl CallGraph {
    /// Builds the call graph from `entry`, following call nodes breadth-first. External CFGs
    /// are recorded but not expanded.
    pub fn build(program: &Program, entry: CfgId) -> Self {
        let mut callees = vec![BTreeSet::new(); program.num_cfgs()];
        let mut reachable = BTreeSet::new();
        let mut queue = vec![entry];
        reachable.insert(entry);

        while let Some(cfg_id) = queue.pop() {
            let cfg = program.cfg(cfg_id);
            if cfg.is_external() {
                continue;
            }
            for node_id in cfg.call_nodes() {
                let callee = cfg.node(node_id).callee().expect("call node has a callee");
                callees[cfg_id.to_usize()].insert(callee);
                if reachable.insert(callee) {
                    queue.push(callee);
                }
            }
        }

        let cyclic = Self::detect_cycle(&callees, entry);
        Self { root: entry, callees, reachable, cyclic }
    }

    fn detect_cycle(callees: &[BTreeSet<CfgId>], root: CfgId) -> bool {
        // Iterative DFS with an explicit on-stack marker.
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            White,
            Grey,
            Black,
        }
        let mut marks = vec![Mark::White; callees.len()];
        let mut stack = vec![(root, false)];
        while let Some((cfg, leaving)) = stack.pop() {
            if leaving {
                marks[cfg.to_usize()] = Mark::Black;
                continue;
            }
            match marks[cfg.to_usize()] {
                Mark::Grey => return true,
                Mark::Black => continue,
                Mark::White => {},
            }
            marks[cfg.to_usize()] = Mark::Grey;
            stack.push((cfg, true));
            for callee in &callees[cfg.to_usize()] {
                match marks[callee.to_usize()] {
                    Mark::Grey => return true,
                    Mark::Black => {},
                    Mark::White => stack.push((*callee, false)),
                }
            }
        }
        false
    }

    pub fn root(&self) -> CfgId {
        self.root
    }

    /// True when some call chain from the entry point re-enters a function.
    pub fn is_cyclic(&self) -> bool {
        self.cyclic
    }

    /// True when `cfg` is not reachable from the entry point.
    pub fn is_dead_code(&self, cfg: CfgId) -> bool {
        !self.reachable.contains(&cfg)
    }

    /// Direct callees of `cfg`, in id order.
    pub fn callees(&self, cfg: CfgId) -> impl Iterator<Item = CfgId> + '_ {
        self.callees[cfg.to_usize()].iter().copied()
    }

    /// Reachable CFGs in id order.
    pub fn reachable(&self) -> impl Iterator<Item = CfgId> + '_ {
        self.reachable.iter().copied()
    }
}

// TESTS
// ================================================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::{Cfg, Instruction, Node};
    use crate::Program;

    fn instr(code: &str) -> Instruction {
        Instruction::new(code)
    }

    /// main -> f, g; f -> g; h unreachable.
    fn diamond_program() -> Program {
        let mut program = Program::new("test");
        let main = CfgId::new(0);
        let f = CfgId::new(1);
        let g = CfgId::new(2);

        let mut main_cfg = Cfg::new("main");
        let c1 = main_cfg.add_node(Node::call(f, vec![instr("jal f")]));
        let c2 = main_cfg.add_node(Node::call(g, vec![instr("jal g")]));
        main_cfg.add_edge(c1, c2);
        main_cfg.finalize();

        let mut f_cfg = Cfg::new("f");
        f_cfg.add_node(Node::call(g, vec![instr("jal g")]));
        f_cfg.finalize();

        let mut g_cfg = Cfg::new("g");
        g_cfg.add_node(Node::basic(vec![instr("nop")]));
        g_cfg.finalize();

        let mut h_cfg = Cfg::new("h");
        h_cfg.add_node(Node::basic(vec![instr("nop")]));
        h_cfg.finalize();

        assert_eq!(program.add_cfg(main_cfg), main);
        assert_eq!(program.add_cfg(f_cfg), f);
        assert_eq!(program.add_cfg(g_cfg), g);
        program.add_cfg(h_cfg);
        program.set_entry_point("main").unwrap();
        program
    }

    #[test]
    fn acyclic_graph_with_dead_code() {
        let program = diamond_program();
        let cg = CallGraph::build(&program, CfgId::new(0));
        assert!(!cg.is_cyclic());
        assert!(!cg.is_dead_code(CfgId::new(0)));
        assert!(!cg.is_dead_code(CfgId::new(2)));
        assert!(cg.is_dead_code(CfgId::new(3)));
    }

    #[test]
    fn recursion_is_detected() {
        let mut program = Program::new("test");
        let mut main_cfg = Cfg::new("main");
        main_cfg.add_node(Node::call(CfgId::new(1), vec![instr("jal f")]));
        main_cfg.finalize();
        let mut f_cfg = Cfg::new("f");
        f_cfg.add_node(Node::call(CfgId::new(0), vec![instr("jal main")]));
        f_cfg.finalize();
        program.add_cfg(main_cfg);
        program.add_cfg(f_cfg);

        let cg = CallGraph::build(&program, CfgId::new(0));
        assert!(cg.is_cyclic());
    }
}
