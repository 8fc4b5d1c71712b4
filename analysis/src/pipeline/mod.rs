//! Timing of basic blocks on an in-order scalar pipeline.
//!
//! For every node in every context the pass computes the execution time of the block's first
//! and subsequent iterations, and for every intra-CFG edge the four timing corrections
//! (first/next × first/next) that account for pipeline overlap between adjacent blocks.
//! Call nodes additionally get call and return corrections against their callee. The path
//! analysis adds these deltas (which may be negative) on top of the per-block times.

mod sim;
pub use sim::{InstructionPipeline, PipeStage};

use tempo_core::cfg::Instruction;
use tempo_core::context::ContextId;
use tempo_core::{names, Arch, AttrValue, CallGraph, CfgId, NodeId, Program};

use crate::cache::Chmc;
use crate::config::ArchitectureConfig;
use crate::{Analysis, AnalysisError};

const PASS: &str = "PIPELINE";

/// Fetch, decode, execute, write-back.
const PIPELINE_DEPTH: usize = 4;

// PIPELINE ANALYSIS
// ================================================================================================

pub struct PipelineAnalysis {
    arch: Arch,
    cache_levels: u32,
    level_latency: Vec<u32>,
    memory_load_latency: u32,
}

impl PipelineAnalysis {
    pub fn new(config: &ArchitectureConfig) -> Self {
        let cache_levels = config.num_icache_levels();
        let level_latency = (1..=cache_levels).map(|l| config.icache_latency(l)).collect();
        Self {
            arch: config.arch,
            cache_levels,
            level_latency,
            memory_load_latency: config.memory.load_latency,
        }
    }

    // FETCH TIMING
    // --------------------------------------------------------------------------------------------

    /// Cycles needed to fetch `instr` in `ctx`, walking the cache hierarchy by
    /// classification. The first execution misses on FM/AM/NC; later ones only on AM/NC.
    fn fetch_latency(&self, instr: &Instruction, ctx: ContextId, first: bool) -> u32 {
        let mut latency = self.level_latency.first().copied().unwrap_or(0);
        for level in 1..=self.cache_levels {
            let chmc = instr
                .attrs()
                .str_in_ctx(&names::chmc_code(level), ctx)
                .and_then(Chmc::from_str)
                .unwrap_or(Chmc::NotClassified);
            let miss = if first { chmc.misses_first() } else { chmc.misses_next() };
            if !miss {
                break;
            }
            latency += if level == self.cache_levels {
                self.memory_load_latency
            } else {
                self.level_latency[level as usize]
            };
        }
        latency
    }

    // BLOCK SCHEDULING
    // --------------------------------------------------------------------------------------------

    fn schedule_first(
        &self,
        instr: &Instruction,
        pipes: &mut Vec<InstructionPipeline>,
        ctx: ContextId,
        first: bool,
    ) {
        let mut pipe = InstructionPipeline::new(PIPELINE_DEPTH);
        pipe.insert(self.fetch_latency(instr, ctx, first));
        pipe.propagate(1);

        let exec = pipe.propagate(self.arch.latency(instr.code()));
        exec.units = self.arch.functional_units(instr.code());
        exec.inputs = self.arch.inputs(instr.code());

        let wb = pipe.propagate(1);
        wb.outputs = self.arch.outputs(instr.code());
        pipes.push(pipe);
    }

    fn schedule_next(
        &self,
        instr: &Instruction,
        pipes: &mut Vec<InstructionPipeline>,
        ctx: ContextId,
        first: bool,
    ) {
        let previous = pipes.last().expect("a first instruction was scheduled");
        let fetch_at = previous.stage(0).tick + self.fetch_latency(instr, ctx, first);

        let mut pipe = InstructionPipeline::new(PIPELINE_DEPTH);
        pipe.insert(fetch_at);
        pipe.propagate(1);

        // Stall the execute stage on the youngest register dependency and on functional-unit
        // contention with every in-flight instruction.
        let inputs = self.arch.inputs(instr.code());
        let mut dep_tick = 0;
        for pipe_in_flight in pipes.iter().rev() {
            dep_tick = pipe_in_flight.dependency_ready(&inputs);
            if dep_tick != 0 {
                break;
            }
        }
        let units = self.arch.functional_units(instr.code());
        let mut unit_tick = 0;
        for pipe_in_flight in pipes.iter() {
            for unit in &units {
                unit_tick = unit_tick.max(pipe_in_flight.unit_busy_until(unit));
            }
        }

        let ready = dep_tick.max(unit_tick);
        let exec_stall = ready.saturating_sub(fetch_at + 3);

        let latency = self.arch.latency(instr.code());
        let exec = pipe.propagate(exec_stall + 1);
        exec.units = units;
        exec.inputs = inputs;
        if latency <= 1 {
            // Single-cycle results bypass to dependents from the execute stage.
            exec.outputs = self.arch.outputs(instr.code());
        }

        // Write-back stays in program order.
        let wb_after = pipes.last().expect("non-empty").completion() + 1;
        let exec_tick = pipe.stage(2).tick;
        let wb_latency = if wb_after > exec_tick { wb_after - exec_tick } else { 1 };
        let wb = pipe.propagate(wb_latency);
        wb.outputs = self.arch.outputs(instr.code());
        pipes.push(pipe);
    }

    /// Schedules the code instructions of `instructions` and returns the completion time of
    /// the last one, or 0 for a block without code.
    fn schedule_block(
        &self,
        pipes: &mut Vec<InstructionPipeline>,
        instructions: &[Instruction],
        ctx: ContextId,
        first: bool,
    ) -> u32 {
        for instr in instructions {
            if !self.arch.is_code(instr.code()) {
                continue;
            }
            if pipes.is_empty() {
                self.schedule_first(instr, pipes, ctx, first);
            } else {
                self.schedule_next(instr, pipes, ctx, first);
            }
        }
        pipes.last().map(InstructionPipeline::completion).unwrap_or(0)
    }

    /// Execution time of one block in isolation.
    fn block_time(&self, program: &Program, cfg: CfgId, node: NodeId, ctx: ContextId, first: bool) -> u32 {
        let mut pipes = Vec::new();
        self.schedule_block(&mut pipes, program.cfg(cfg).node(node).instructions(), ctx, first)
    }

    // DELTAS
    // --------------------------------------------------------------------------------------------

    /// Timing correction of executing `pred` then `succ` back to back, against the sum of
    /// their isolated times. Zero or negative when the pipeline overlaps the blocks.
    #[allow(clippy::too_many_arguments)]
    fn delta(
        &self,
        program: &Program,
        pred: (CfgId, NodeId, ContextId, bool),
        succ: (CfgId, NodeId, ContextId, bool),
    ) -> i64 {
        let (pred_cfg, pred_node, pred_ctx, pred_first) = pred;
        let (succ_cfg, succ_node, succ_ctx, succ_first) = succ;

        let mut pipes = Vec::new();
        self.schedule_block(
            &mut pipes,
            program.cfg(pred_cfg).node(pred_node).instructions(),
            pred_ctx,
            pred_first,
        );
        let combined = self.schedule_block(
            &mut pipes,
            program.cfg(succ_cfg).node(succ_node).instructions(),
            succ_ctx,
            succ_first,
        );
        if pipes.is_empty() {
            return 0;
        }

        let pred_time = self.block_time(program, pred_cfg, pred_node, pred_ctx, pred_first);
        let succ_time = self.block_time(program, succ_cfg, succ_node, succ_ctx, succ_first);
        combined as i64 - (pred_time as i64 + succ_time as i64)
    }
}

// ANALYSIS CONTRACT
// ================================================================================================

impl Analysis for PipelineAnalysis {
    fn name(&self) -> &'static str {
        PASS
    }

    fn check_input_attributes(&mut self, program: &Program) -> Result<(), AnalysisError> {
        if program.contexts().is_none() {
            return Err(AnalysisError::input(PASS, "contexts are not computed"));
        }
        let entry = program
            .entry_point()
            .ok_or_else(|| AnalysisError::input(PASS, "no entry point selected"))?;
        let call_graph = CallGraph::build(program, entry);

        for (cfg_id, cfg) in program.cfgs() {
            if call_graph.is_dead_code(cfg_id) {
                continue;
            }
            for (_, node) in cfg.nodes() {
                if node.is_isolated_nop() {
                    continue;
                }
                for instr in node.instructions() {
                    if !self.arch.is_code(instr.code()) {
                        continue;
                    }
                    for level in 1..=self.cache_levels {
                        let name = names::chmc_code(level);
                        for &ctx in cfg.context_list() {
                            let valid = instr
                                .attrs()
                                .str_in_ctx(&name, ctx)
                                .map(Chmc::from_str)
                                .is_some_and(|c| c.is_some());
                            if !valid {
                                return Err(AnalysisError::input(
                                    PASS,
                                    format!(
                                        "instruction '{}' should have a valid {name} \
                                         classification",
                                        instr.code()
                                    ),
                                ));
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn perform(&mut self, program: &mut Program) -> Result<(), AnalysisError> {
        let tree = program
            .contexts()
            .cloned()
            .ok_or_else(|| AnalysisError::input(PASS, "contexts are not computed"))?;
        let entry = program
            .entry_point()
            .ok_or_else(|| AnalysisError::input(PASS, "no entry point selected"))?;
        let call_graph = CallGraph::build(program, entry);

        let mut call_sites = Vec::new();

        // Per-node times and per-edge deltas, context by context.
        for cfg_id in program.cfg_ids().collect::<Vec<_>>() {
            if call_graph.is_dead_code(cfg_id) {
                continue;
            }
            let contexts = program.cfg(cfg_id).context_list().to_vec();
            for ctx in contexts {
                let mut node_writes = Vec::new();
                let mut edge_writes = Vec::new();
                {
                    let cfg = program.cfg(cfg_id);
                    for (node_id, node) in cfg.nodes() {
                        if node.is_isolated_nop() {
                            continue;
                        }
                        let first = self.block_time(program, cfg_id, node_id, ctx, true);
                        let next = self.block_time(program, cfg_id, node_id, ctx, false);
                        node_writes.push((node_id, first, next));
                        if node.is_call() {
                            call_sites.push((cfg_id, node_id, ctx));
                        }
                    }

                    for (edge_id, edge) in cfg.edges() {
                        let deltas = [
                            (names::DELTA_FF, true, true),
                            (names::DELTA_FN, true, false),
                            (names::DELTA_NF, false, true),
                            (names::DELTA_NN, false, false),
                        ]
                        .map(|(name, src_first, dst_first)| {
                            let value = self.delta(
                                program,
                                (cfg_id, edge.source(), ctx, src_first),
                                (cfg_id, edge.target(), ctx, dst_first),
                            );
                            (name, value)
                        });
                        edge_writes.push((edge_id, deltas));
                    }
                }

                let cfg = program.cfg_mut(cfg_id);
                for (node_id, first, next) in node_writes {
                    let attrs = cfg.node_mut(node_id).attrs_mut();
                    attrs.set_in_ctx(
                        names::NODE_EXEC_TIME_FIRST,
                        ctx,
                        AttrValue::Int(first as i64),
                    );
                    attrs.set_in_ctx(names::NODE_EXEC_TIME_NEXT, ctx, AttrValue::Int(next as i64));
                }
                for (edge_id, deltas) in edge_writes {
                    let attrs = cfg.edge_mut(edge_id).attrs_mut();
                    for (name, value) in deltas {
                        attrs.set_in_ctx(name, ctx, AttrValue::Int(value));
                    }
                }
            }
        }

        // Call and return corrections, stored on the call node.
        for (cfg_id, call_node, ctx) in call_sites {
            let callee = program
                .cfg(cfg_id)
                .node(call_node)
                .callee()
                .ok_or_else(|| AnalysisError::internal(PASS, "call site without callee"))?;
            if program.cfg(callee).is_external() || program.cfg(callee).is_empty() {
                continue;
            }
            let callee_ctx = tree
                .callee_context(ctx, call_node)
                .ok_or_else(|| AnalysisError::internal(PASS, "call site without context"))?;
            let callee_start = program
                .cfg(callee)
                .start_node()
                .ok_or_else(|| AnalysisError::internal(PASS, "callee without start node"))?;
            let successors = program.cfg(cfg_id).successors(call_node).to_vec();
            let return_node = match successors.as_slice() {
                [only] => *only,
                _ => {
                    return Err(AnalysisError::input(
                        PASS,
                        "call nodes must have a unique successor",
                    ));
                },
            };
            let end_nodes = program.cfg(callee).end_nodes();

            let mut writes = Vec::new();
            for (name, first) in
                [(names::CALL_DELTA_FIRST, true), (names::CALL_DELTA_NEXT, false)]
            {
                let value = self.delta(
                    program,
                    (cfg_id, call_node, ctx, first),
                    (callee, callee_start, callee_ctx, first),
                );
                writes.push((name, value));
            }
            for (name, first) in
                [(names::RETURN_DELTA_FIRST, true), (names::RETURN_DELTA_NEXT, false)]
            {
                // Over several callee exits, keep the costliest return.
                let value = end_nodes
                    .iter()
                    .map(|&end| {
                        self.delta(
                            program,
                            (callee, end, callee_ctx, first),
                            (cfg_id, return_node, ctx, first),
                        )
                    })
                    .max()
                    .unwrap_or(0);
                writes.push((name, value));
            }

            let attrs = program.cfg_mut(cfg_id).node_mut(call_node).attrs_mut();
            for (name, value) in writes {
                attrs.set_in_ctx(name, ctx, AttrValue::Int(value));
            }
        }

        Ok(())
    }
}

// TESTS
// ================================================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CacheConfig, CacheKind, MemoryConfig, ReplacementPolicy};
    use tempo_core::arch::Target;
    use tempo_core::cfg::{Cfg, Node};
    use tempo_core::context::compute_contexts;

    fn config() -> ArchitectureConfig {
        ArchitectureConfig {
            arch: Arch::new(Target::Mips, true),
            caches: vec![CacheConfig {
                kind: CacheKind::Instruction,
                level: 1,
                sets: 1,
                ways: 1,
                line_size: 16,
                policy: ReplacementPolicy::Lru,
                latency: 1,
            }],
            memory: MemoryConfig { load_latency: 10, store_latency: 10 },
        }
    }

    fn instr_with_chmc(code: &str, addr: u64, ctx: ContextId, chmc: &str) -> Instruction {
        let mut i = Instruction::new(code);
        i.set_address(addr);
        i.attrs_mut()
            .set_in_ctx(&names::chmc_code(1), ctx, AttrValue::Str(chmc.into()));
        i
    }

    fn one_block_program(make: impl Fn(ContextId) -> Vec<Instruction>) -> Program {
        let root = ContextId::new(0);
        let mut program = Program::new("test");
        let mut cfg = Cfg::new("main");
        cfg.add_node(Node::basic(make(root)));
        cfg.finalize();
        program.add_cfg(cfg);
        program.set_entry_point("main").unwrap();
        compute_contexts(&mut program).unwrap();
        program
    }

    #[test]
    fn independent_hits_flow_through_the_pipeline() {
        let mut program = one_block_program(|ctx| {
            vec![
                instr_with_chmc("addu $2, $3, $4", 0x0, ctx, "AH"),
                instr_with_chmc("addu $5, $6, $7", 0x4, ctx, "AH"),
            ]
        });
        let mut pass = PipelineAnalysis::new(&config());
        pass.check_input_attributes(&program).unwrap();
        pass.perform(&mut program).unwrap();

        let root = program.contexts().unwrap().root();
        let node = program.cfg(CfgId::new(0)).node(NodeId::new(0));
        // First instruction: fetch 1, decode 1, exec 1, wb 1 = 4; the second overlaps and
        // retires one cycle later.
        assert_eq!(node.attrs().int_in_ctx(names::NODE_EXEC_TIME_FIRST, root), Some(5));
        assert_eq!(node.attrs().int_in_ctx(names::NODE_EXEC_TIME_NEXT, root), Some(5));
    }

    #[test]
    fn first_miss_penalizes_only_the_first_iteration() {
        let mut program = one_block_program(|ctx| {
            vec![instr_with_chmc("addu $2, $3, $4", 0x0, ctx, "FM")]
        });
        let mut pass = PipelineAnalysis::new(&config());
        pass.perform(&mut program).unwrap();

        let root = program.contexts().unwrap().root();
        let node = program.cfg(CfgId::new(0)).node(NodeId::new(0));
        let first = node.attrs().int_in_ctx(names::NODE_EXEC_TIME_FIRST, root).unwrap();
        let next = node.attrs().int_in_ctx(names::NODE_EXEC_TIME_NEXT, root).unwrap();
        assert_eq!(first - next, 10);
    }

    #[test]
    fn dependent_instructions_stall() {
        let independent = one_block_program(|ctx| {
            vec![
                instr_with_chmc("mult $2, $3", 0x0, ctx, "AH"),
                instr_with_chmc("addu $5, $6, $7", 0x4, ctx, "AH"),
            ]
        });
        let dependent = one_block_program(|ctx| {
            vec![
                instr_with_chmc("mult $2, $3", 0x0, ctx, "AH"),
                instr_with_chmc("addu $5, $2, $7", 0x4, ctx, "AH"),
            ]
        });

        let pass = PipelineAnalysis::new(&config());
        let root = ContextId::new(0);
        let exec_tick = |p: &Program| {
            let mut pipes = Vec::new();
            pass.schedule_block(
                &mut pipes,
                p.cfg(CfgId::new(0)).node(NodeId::new(0)).instructions(),
                root,
                true,
            );
            pipes[1].stage(2).tick
        };
        // The consumer of the multiply result waits for its write-back; the independent add
        // executes as soon as it is decoded.
        assert!(exec_tick(&dependent) > exec_tick(&independent));
    }

    #[test]
    fn edge_deltas_reflect_overlap() {
        let root = ContextId::new(0);
        let mut program = Program::new("test");
        let mut cfg = Cfg::new("main");
        let a = cfg.add_node(Node::basic(vec![instr_with_chmc(
            "addu $2, $3, $4",
            0x0,
            root,
            "AH",
        )]));
        let b = cfg.add_node(Node::basic(vec![instr_with_chmc(
            "addu $5, $6, $7",
            0x4,
            root,
            "AH",
        )]));
        cfg.add_edge(a, b);
        cfg.finalize();
        program.add_cfg(cfg);
        program.set_entry_point("main").unwrap();
        compute_contexts(&mut program).unwrap();

        let mut pass = PipelineAnalysis::new(&config());
        pass.perform(&mut program).unwrap();

        let edge = program.cfg(CfgId::new(0)).edge(tempo_core::EdgeId::new(0));
        let ff = edge.attrs().int_in_ctx(names::DELTA_FF, root).unwrap();
        // Two one-instruction blocks overlap in the pipeline: the pair is cheaper than the
        // sum of the isolated blocks.
        assert!(ff < 0);
    }
}
