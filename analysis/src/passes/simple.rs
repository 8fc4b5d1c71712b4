use tempo_core::{names, AttrValue, CallGraph, Program};

use crate::{Analysis, AnalysisError};

// SIMPLE PRINT
// ================================================================================================

/// Text dump of the program on stdout: functions, optionally the call graph, the loop nests,
/// the CFG bodies and the analysis results attached so far.
pub struct SimplePrint {
    pub print_call_graph: bool,
    pub print_loop_nests: bool,
    pub print_cfg: bool,
    pub print_wcet_info: bool,
}

impl Analysis for SimplePrint {
    fn name(&self) -> &'static str {
        "SIMPLEPRINT"
    }

    fn check_input_attributes(&mut self, _program: &Program) -> Result<(), AnalysisError> {
        Ok(())
    }

    fn perform(&mut self, program: &mut Program) -> Result<(), AnalysisError> {
        println!("Program {}", program.name());

        let call_graph = program.entry_point().map(|entry| CallGraph::build(program, entry));

        if self.print_call_graph {
            if let Some(cg) = &call_graph {
                for (cfg_id, cfg) in program.cfgs() {
                    if cg.is_dead_code(cfg_id) {
                        continue;
                    }
                    let callees: Vec<&str> =
                        cg.callees(cfg_id).map(|c| program.cfg(c).name()).collect();
                    if callees.is_empty() {
                        println!("Function {} is a leaf", cfg.name());
                    } else {
                        println!("Function {} calls {}", cfg.name(), callees.join(", "));
                    }
                }
            }
        }

        if self.print_loop_nests {
            for (_, cfg) in program.cfgs() {
                for (_, l) in cfg.loops() {
                    let bound = l
                        .max_iterations()
                        .map(|b| b.to_string())
                        .unwrap_or_else(|| "?".into());
                    println!(
                        "Loop in {}: head {}, {} nodes, maxiter {}",
                        cfg.name(),
                        l.head(),
                        l.nodes().len(),
                        bound
                    );
                }
            }
        }

        if self.print_cfg {
            for (_, cfg) in program.cfgs() {
                println!("CFG {} ({} nodes)", cfg.name(), cfg.num_nodes());
                for (node_id, node) in cfg.nodes() {
                    let kind = match node.callee() {
                        Some(callee) => format!("call {}", program.cfg(callee).name()),
                        None => "bb".to_string(),
                    };
                    let addr = node
                        .start_address()
                        .map(|a| format!("{a:#x}"))
                        .unwrap_or_else(|| "-".into());
                    println!(
                        "  node {node_id} [{kind}] at {addr}, {} instructions",
                        node.instructions().len()
                    );
                }
                for (_, edge) in cfg.edges() {
                    println!("  edge {} -> {}", edge.source(), edge.target());
                }
            }
        }

        if self.print_wcet_info {
            // A missing WCET (failed or skipped path analysis) prints as the -1 marker.
            let wcet = program
                .entry_point()
                .and_then(|entry| program.cfg(entry).attrs().get_plain(names::WCET))
                .and_then(AttrValue::as_str)
                .unwrap_or("-1");
            println!("WCET: {wcet}");

            for (_, cfg) in program.cfgs() {
                for (node_id, node) in cfg.nodes() {
                    for (key, value) in node.attrs().iter() {
                        if key.base().starts_with("frequency_c") {
                            if let AttrValue::UInt(freq) = value {
                                println!(
                                    "  frequency {}:{} {} = {}",
                                    cfg.name(),
                                    node_id,
                                    key.base(),
                                    freq
                                );
                            }
                        }
                    }
                }
            }
        }

        Ok(())
    }
}
