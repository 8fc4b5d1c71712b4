//! Worst-case path analysis by implicit path enumeration.
//!
//! Execution frequencies of basic blocks and edges become integer variables of a linear
//! program: flow conservation ties blocks to their edges, call sites to their callee entry,
//! loop bounds cap body frequencies against the loop entry edges, and the entry block runs
//! exactly once. The objective maximizes frequency times cost, where block costs come either
//! from a deterministic walk of the cache classifications or from the pipeline timing
//! attributes. The bound is the objective value of the solved program.
//!
//! Variable naming (kept stable because it is visible in solver logs and round-trips through
//! the frequency attributes): `n_<id>_c<ctx>` for total block frequency, `nf_`/`nn_` for the
//! first/subsequent split, `e_<src>_<dst>_c<ctx>` for edges, and `eff_/efn_/enf_/enn_` for
//! the pipelined edge split. `<id>` is a program-wide block number.

mod solver;
pub use solver::{Cplex, LpSolve, LpSolver, Solution, SolverError};

use std::collections::BTreeMap;

use itertools::Itertools;
use tempo_core::cfg::Instruction;
use tempo_core::context::ContextId;
use tempo_core::walker::reachable_nodes;
use tempo_core::{names, Arch, AttrValue, CallGraph, CfgId, NodeId, NodeRef, Program};

use crate::cache::Chmc;
use crate::config::ArchitectureConfig;
use crate::{Analysis, AnalysisError};

const PASS: &str = "IPET";

// SOLVER KIND
// ================================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolverKind {
    LpSolve,
    Cplex,
}

impl SolverKind {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "lp_solve" => Some(Self::LpSolve),
            "cplex" => Some(Self::Cplex),
            _ => None,
        }
    }

    fn solver(&self) -> Box<dyn LpSolver> {
        match self {
            Self::LpSolve => Box::new(LpSolve),
            Self::Cplex => Box::new(Cplex),
        }
    }
}

// ESTIMATION METHOD
// ================================================================================================

/// The cost model, fixed by the configured cache hierarchy and the pipeline switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Method {
    PipelineIcacheDcache,
    PipelineIcachePerfectDcache,
    NoPipelineIcacheDcache,
    NoPipelineIcachePerfectDcache,
    NoPipelinePerfectIcacheDcache,
    NoPipelinePerfectIcachePerfectDcache,
}

impl Method {
    fn has_pipeline(&self) -> bool {
        matches!(self, Self::PipelineIcacheDcache | Self::PipelineIcachePerfectDcache)
    }

    /// True when blocks split into first/next frequency variables.
    fn splits_frequencies(&self) -> bool {
        !matches!(self, Self::NoPipelinePerfectIcachePerfectDcache)
    }
}

// IPET ANALYSIS
// ================================================================================================

pub struct IpetAnalysis {
    solver_kind: SolverKind,
    pipeline: bool,
    attach_wcet: bool,
    generate_node_freq: bool,
    arch: Arch,
    config: ArchitectureConfig,
    /// Program-wide block numbers backing the ILP variable names.
    node_ids: BTreeMap<NodeRef, u64>,
}

impl IpetAnalysis {
    pub fn new(
        config: &ArchitectureConfig,
        solver_kind: SolverKind,
        pipeline: bool,
        attach_wcet: bool,
        generate_node_freq: bool,
    ) -> Self {
        Self {
            solver_kind,
            pipeline,
            attach_wcet,
            generate_node_freq,
            arch: config.arch,
            config: config.clone(),
            node_ids: BTreeMap::new(),
        }
    }

    fn method(&self) -> Result<Method, AnalysisError> {
        let perfect_icache = self.config.has_perfect_icache();
        let perfect_dcache = self.config.has_perfect_dcache();
        if self.pipeline {
            if perfect_icache {
                return Err(AnalysisError::unsupported(
                    PASS,
                    "pipeline timing without an instruction cache is not implemented",
                ));
            }
            if !perfect_dcache {
                tracing::warn!("the data cache is ignored by the pipeline cost model");
                return Ok(Method::PipelineIcacheDcache);
            }
            return Ok(Method::PipelineIcachePerfectDcache);
        }
        Ok(match (perfect_icache, perfect_dcache) {
            (false, false) => Method::NoPipelineIcacheDcache,
            (false, true) => Method::NoPipelineIcachePerfectDcache,
            (true, false) => Method::NoPipelinePerfectIcacheDcache,
            (true, true) => Method::NoPipelinePerfectIcachePerfectDcache,
        })
    }

    fn perfect_icache_latency(&self) -> i64 {
        self.config.icache_latency(1) as i64
    }

    fn perfect_dcache_latency(&self) -> i64 {
        self.config.dcache_latency(1) as i64
    }

    // VARIABLE NAMES
    // --------------------------------------------------------------------------------------------

    fn node_var(&self, prefix: &str, node: NodeRef, ctx: ContextId) -> String {
        format!("{prefix}{}_c{ctx}", self.node_ids[&node])
    }

    fn edge_var(&self, prefix: &str, source: NodeRef, target: NodeRef, ctx: ContextId) -> String {
        format!(
            "{prefix}{}_{}_c{ctx}",
            self.node_ids[&source], self.node_ids[&target]
        )
    }

    /// The four pipelined edge variables, in FF/FN/NF/NN order.
    fn edge_split_vars(&self, source: NodeRef, target: NodeRef, ctx: ContextId) -> [String; 4] {
        ["eff_", "efn_", "enf_", "enn_"]
            .map(|prefix| self.edge_var(prefix, source, target, ctx))
    }

    /// Numbers every block of every CFG (dead ones included, so numbering does not depend on
    /// the entry point's call graph).
    fn assign_node_ids(&mut self, program: &Program) {
        self.node_ids.clear();
        let mut next = 0u64;
        for (cfg_id, cfg) in program.cfgs() {
            for node_id in cfg.node_ids() {
                self.node_ids.insert(NodeRef::new(cfg_id, node_id), next);
                next += 1;
            }
        }
    }

    // BLOCK COSTS
    // --------------------------------------------------------------------------------------------

    /// Static bound on how often `node` can run in `ctx`: the product of the bounds of every
    /// loop containing the node or one of the call sites leading to it.
    fn node_frequency_bound(&self, program: &Program, node: NodeRef, ctx: ContextId) -> u64 {
        let tree = program.contexts().expect("contexts are computed");
        let mut involved = vec![node];
        let mut current = ctx;
        while let (Some(parent), Some(call_node)) = {
            let c = tree.context(current);
            (c.parent(), c.caller_node())
        } {
            involved.push(NodeRef::new(tree.context(parent).function(), call_node));
            current = parent;
        }

        let mut bound = 1u64;
        for node_ref in involved {
            for (_, l) in program.cfg(node_ref.cfg).loops() {
                if l.contains(node_ref.node) {
                    bound = bound.saturating_mul(l.max_iterations().unwrap_or(1));
                }
            }
        }
        bound
    }

    /// Adds the cost of one fetch walking the instruction cache hierarchy.
    fn instruction_fetch_cost(
        &self,
        instr: &Instruction,
        ctx: ContextId,
        state: &mut FetchWalk,
        level: u32,
        first: &mut i64,
        next: &mut i64,
    ) {
        let access_cost = self.config.icache_latency(level) as i64;
        let chmc = instr
            .attrs()
            .str_in_ctx(&names::chmc_code(level), ctx)
            .and_then(Chmc::from_str)
            .unwrap_or(Chmc::NotClassified);

        if state.count_next {
            *next += access_cost;
        }
        if state.count_first {
            *first += access_cost;
        }

        let levels = self.config.num_icache_levels();
        match chmc {
            Chmc::AlwaysHit => {
                state.count_first = false;
                state.count_next = false;
            },
            Chmc::AlwaysMiss | Chmc::NotClassified => {
                if level == levels {
                    if state.count_first {
                        *first += self.config.memory.load_latency as i64;
                    }
                    if state.count_next {
                        *next += self.config.memory.load_latency as i64;
                    }
                }
            },
            Chmc::FirstMiss => {
                if level == levels && state.count_first {
                    *first += self.config.memory.load_latency as i64;
                }
                state.count_next = false;
            },
            Chmc::AlwaysUnused => {},
        }
    }

    /// Adds the cost of one load at one data cache level and advances the walk state.
    #[allow(clippy::too_many_arguments)]
    fn data_access_cost(
        &self,
        instr: &Instruction,
        ctx: ContextId,
        state: &mut DataWalk,
        level: u32,
        frequency: u64,
        first: &mut i64,
        next: &mut i64,
    ) {
        let chmc = instr
            .attrs()
            .str_in_ctx(&names::chmc_data(level), ctx)
            .and_then(Chmc::from_str)
            .unwrap_or(Chmc::NotClassified);

        if chmc == Chmc::AlwaysUnused {
            state.always_accessed = false;
            state.never_accessed = true;
            return;
        }

        let access_cost = self.config.dcache_latency(level) as i64;
        state.charge(access_cost, true, first, next);

        let blocks = instr
            .attrs()
            .int_in_ctx(&names::data_block_count(level), ctx)
            .unwrap_or(1)
            .max(0) as u64;
        state.advance(chmc, blocks, frequency);

        if level == self.config.num_dcache_levels() {
            let miss_both = chmc == Chmc::AlwaysMiss || chmc == Chmc::NotClassified;
            state.charge(self.config.memory.load_latency as i64, miss_both, first, next);
        }
    }

    /// Cost of one block (first and next executions) under the no-pipeline cost models.
    fn node_cost(
        &self,
        program: &Program,
        node: NodeRef,
        ctx: ContextId,
        perfect_icache: bool,
        perfect_dcache: bool,
    ) -> (i64, i64) {
        let mut first = 0i64;
        let mut next = 0i64;
        let frequency = if perfect_dcache {
            1
        } else {
            self.node_frequency_bound(program, node, ctx)
        };

        for instr in program.cfg(node.cfg).node(node.node).instructions() {
            if !self.arch.is_code(instr.code()) {
                continue;
            }

            if perfect_icache {
                first += self.perfect_icache_latency();
                next += self.perfect_icache_latency();
            }
            if perfect_dcache && !perfect_icache {
                first += self.perfect_dcache_latency();
                next += self.perfect_dcache_latency();
            }
            if !perfect_dcache && self.arch.is_store(instr.code()) {
                first += self.config.memory.store_latency as i64;
                next += self.config.memory.store_latency as i64;
            }

            let mut fetch = FetchWalk::new();
            let mut data = DataWalk::new();
            let is_load = self.arch.is_load(instr.code());
            for level in 1..=self.config.num_icache_levels().max(self.config.num_dcache_levels())
            {
                if !perfect_icache && level <= self.config.num_icache_levels() {
                    self.instruction_fetch_cost(instr, ctx, &mut fetch, level, &mut first, &mut next);
                }
                if !perfect_dcache && is_load && level <= self.config.num_dcache_levels() {
                    self.data_access_cost(
                        instr, ctx, &mut data, level, frequency, &mut first, &mut next,
                    );
                }
            }
        }
        (first, next)
    }

    /// Cost of one block when neither cache is modeled: one perfect-latency cycle per code
    /// instruction.
    fn node_cost_nocache(&self, program: &Program, node: NodeRef) -> i64 {
        program
            .cfg(node.cfg)
            .node(node.node)
            .instructions()
            .iter()
            .filter(|i| self.arch.is_code(i.code()))
            .count() as i64
            * self.perfect_icache_latency()
    }

    // CONSTRAINT GENERATION
    // --------------------------------------------------------------------------------------------

    /// Builds the complete LP: returns the text and the list of generated variables in
    /// emission order.
    fn build_lp(&mut self, program: &Program, format: &dyn LpSolver) -> Result<String, AnalysisError> {
        let method = self.method()?;
        let entry = program
            .entry_point()
            .ok_or_else(|| AnalysisError::input(PASS, "no entry point selected"))?;
        let call_graph = CallGraph::build(program, entry);
        self.assign_node_ids(program);

        let mut objective_terms: Vec<(String, i64)> = Vec::new();
        let mut constraints = String::new();

        for (cfg_id, cfg) in program.cfgs() {
            if call_graph.is_dead_code(cfg_id) || cfg.is_external() || cfg.is_empty() {
                continue;
            }
            self.generate_cfg_constraints(
                program,
                cfg_id,
                method,
                format,
                &mut constraints,
                &mut objective_terms,
            );
        }

        self.generate_call_constraints(program, &call_graph, format, &mut constraints);

        // The entry block runs exactly once.
        let start = program
            .cfg(entry)
            .start_node()
            .ok_or_else(|| AnalysisError::input(PASS, "the entry point has no body"))?;
        let tree = program
            .contexts()
            .ok_or_else(|| AnalysisError::input(PASS, "contexts are not computed"))?;
        let entry_var = self.node_var("n_", NodeRef::new(entry, start), tree.root());
        format.equality(&mut constraints, &[entry_var], 1);

        let mut lp = String::new();
        format.objective(&mut lp, &objective_terms);
        lp.push_str(&constraints);

        // Declarations keep first-emission order, without duplicates (call sites repeat
        // their frequency variables in the objective).
        let declared: Vec<String> =
            objective_terms.iter().map(|(var, _)| var.clone()).unique().collect();
        format.declarations(&mut lp, &declared);
        Ok(lp)
    }

    fn generate_cfg_constraints(
        &self,
        program: &Program,
        cfg_id: CfgId,
        method: Method,
        format: &dyn LpSolver,
        constraints: &mut String,
        objective_terms: &mut Vec<(String, i64)>,
    ) {
        let cfg = program.cfg(cfg_id);
        let contexts = cfg.context_list().to_vec();
        let nodes: Vec<NodeId> = cfg.real_nodes();

        // Objective coefficients and, per method, the first/next split constraints.
        for &ctx in &contexts {
            for &node_id in &nodes {
                let node_ref = NodeRef::new(cfg_id, node_id);
                match method {
                    Method::NoPipelinePerfectIcachePerfectDcache => {
                        let cost = self.node_cost_nocache(program, node_ref);
                        objective_terms.push((self.node_var("n_", node_ref, ctx), cost));
                    },
                    Method::NoPipelineIcacheDcache
                    | Method::NoPipelineIcachePerfectDcache
                    | Method::NoPipelinePerfectIcacheDcache => {
                        let perfect_icache =
                            method == Method::NoPipelinePerfectIcacheDcache;
                        let perfect_dcache =
                            method == Method::NoPipelineIcachePerfectDcache;
                        let (first, next) =
                            self.node_cost(program, node_ref, ctx, perfect_icache, perfect_dcache);
                        objective_terms.push((self.node_var("nf_", node_ref, ctx), first));
                        objective_terms.push((self.node_var("nn_", node_ref, ctx), next));
                    },
                    Method::PipelineIcacheDcache | Method::PipelineIcachePerfectDcache => {
                        let node = cfg.node(node_id);
                        let attrs = node.attrs();
                        let first_var = self.node_var("nf_", node_ref, ctx);
                        let next_var = self.node_var("nn_", node_ref, ctx);
                        objective_terms.push((
                            first_var.clone(),
                            attrs.int_in_ctx(names::NODE_EXEC_TIME_FIRST, ctx).unwrap_or(0),
                        ));
                        objective_terms.push((
                            next_var.clone(),
                            attrs.int_in_ctx(names::NODE_EXEC_TIME_NEXT, ctx).unwrap_or(0),
                        ));
                        if node.is_call() {
                            for (var, name) in [
                                (&first_var, names::CALL_DELTA_FIRST),
                                (&first_var, names::RETURN_DELTA_FIRST),
                                (&next_var, names::CALL_DELTA_NEXT),
                                (&next_var, names::RETURN_DELTA_NEXT),
                            ] {
                                objective_terms
                                    .push((var.clone(), attrs.int_in_ctx(name, ctx).unwrap_or(0)));
                            }
                        }
                    },
                }

                if method.splits_frequencies() {
                    // n = nf + nn, and the first execution happens at most once.
                    format.flow_constraint(
                        constraints,
                        &[
                            self.node_var("n_", node_ref, ctx),
                            self.node_var("nf_", node_ref, ctx),
                            self.node_var("nn_", node_ref, ctx),
                        ],
                    );
                    format.inequality(
                        constraints,
                        &[self.node_var("nf_", node_ref, ctx)],
                        1,
                    );
                }
            }
        }

        // Pipelined edges: deltas in the objective plus the first/next split per edge.
        if method.has_pipeline() {
            for &ctx in &contexts {
                for (_, edge) in cfg.edges() {
                    let source = NodeRef::new(cfg_id, edge.source());
                    let target = NodeRef::new(cfg_id, edge.target());
                    let split = self.edge_split_vars(source, target, ctx);

                    if !cfg.node(edge.source()).is_call() {
                        for (var, name) in split.iter().zip([
                            names::DELTA_FF,
                            names::DELTA_FN,
                            names::DELTA_NF,
                            names::DELTA_NN,
                        ]) {
                            objective_terms.push((
                                var.clone(),
                                edge.attrs().int_in_ctx(name, ctx).unwrap_or(0),
                            ));
                        }
                    }

                    let mut flow = vec![self.edge_var("e_", source, target, ctx)];
                    flow.extend(split.iter().cloned());
                    format.flow_constraint(constraints, &flow);
                    // A first execution of either endpoint pairs with at most one traversal.
                    format.inequality(constraints, &[split[0].clone(), split[1].clone()], 1);
                    format.inequality(constraints, &[split[0].clone(), split[2].clone()], 1);
                }
            }
        }

        // Flow conservation between every block and its edges.
        for &ctx in &contexts {
            for &node_id in &nodes {
                let node_ref = NodeRef::new(cfg_id, node_id);
                let mut inflow = vec![self.node_var("n_", node_ref, ctx)];
                for pred in cfg.predecessors(node_id) {
                    inflow.push(self.edge_var("e_", NodeRef::new(cfg_id, *pred), node_ref, ctx));
                }
                format.flow_constraint(constraints, &inflow);

                let mut outflow = vec![self.node_var("n_", node_ref, ctx)];
                for succ in cfg.successors(node_id) {
                    outflow.push(self.edge_var("e_", node_ref, NodeRef::new(cfg_id, *succ), ctx));
                }
                format.flow_constraint(constraints, &outflow);
            }
        }

        // Loop bounds: every nested-free body block runs at most maxiter times per loop entry.
        for &ctx in &contexts {
            for (loop_id, l) in cfg.loops() {
                let bound = l.max_iterations().unwrap_or(1) as i64;
                let mut entry_terms: Vec<(String, i64)> = Vec::new();
                for pred in cfg.predecessors(l.head()) {
                    if !l.contains(*pred) {
                        entry_terms.push((
                            self.edge_var(
                                "e_",
                                NodeRef::new(cfg_id, *pred),
                                NodeRef::new(cfg_id, l.head()),
                                ctx,
                            ),
                            -bound,
                        ));
                    }
                }
                let body = cfg.loop_nodes_not_nested(loop_id);
                for node_id in body.iter().copied() {
                    // The header runs one extra exit check per entry, so it is only bounded
                    // when it is the entire loop.
                    if node_id == l.head() && l.nodes().len() > 1 {
                        continue;
                    }
                    let mut terms = entry_terms.clone();
                    terms.push((self.node_var("n_", NodeRef::new(cfg_id, node_id), ctx), 1));
                    format.linear_inequality(constraints, &terms, 0);
                }
            }
        }
    }

    /// Couples every call site with its callee entry: same frequency, per context pair.
    fn generate_call_constraints(
        &self,
        program: &Program,
        call_graph: &CallGraph,
        format: &dyn LpSolver,
        constraints: &mut String,
    ) {
        let Some(tree) = program.contexts() else { return };
        for (cfg_id, cfg) in program.cfgs() {
            if call_graph.is_dead_code(cfg_id) || cfg.is_external() || cfg.is_empty() {
                continue;
            }
            let Some(start) = cfg.start_node() else { continue };
            for &ctx in cfg.context_list() {
                let context = tree.context(ctx);
                let (Some(parent), Some(call_node)) = (context.parent(), context.caller_node())
                else {
                    continue;
                };
                let caller_cfg = tree.context(parent).function();
                let call_var =
                    self.node_var("n_", NodeRef::new(caller_cfg, call_node), parent);
                let start_var = self.node_var("n_", NodeRef::new(cfg_id, start), ctx);
                format.flow_constraint(constraints, &[call_var, start_var]);
            }
        }
    }

    // RESULT INGESTION
    // --------------------------------------------------------------------------------------------

    /// Writes the per-context frequency attributes from the solved variable values.
    fn attach_frequencies(
        &self,
        program: &mut Program,
        solution: &Solution,
    ) -> Result<(), AnalysisError> {
        let by_id: BTreeMap<u64, NodeRef> =
            self.node_ids.iter().map(|(node, id)| (*id, *node)).collect();

        for (variable, value) in &solution.variables {
            let Some(rest) = variable.strip_prefix("n_") else { continue };
            let Some((id, ctx)) = rest.split_once("_c") else { continue };
            let (Ok(id), Ok(ctx)) = (id.parse::<u64>(), ctx.parse::<u32>()) else { continue };
            let Some(&node_ref) = by_id.get(&id) else { continue };

            let name = names::frequency_in(ContextId::new(ctx));
            let attrs = program.cfg_mut(node_ref.cfg).node_mut(node_ref.node).attrs_mut();
            if attrs.get_plain(&name).is_some() {
                return Err(AnalysisError::internal(
                    PASS,
                    format!("variable {variable} already has a frequency"),
                ));
            }
            attrs.set_plain(name, AttrValue::UInt(*value));
        }
        Ok(())
    }
}

// LEVEL-WALK STATE
// ================================================================================================

/// State of the per-level instruction fetch cost walk.
struct FetchWalk {
    count_first: bool,
    count_next: bool,
}

impl FetchWalk {
    fn new() -> Self {
        Self { count_first: true, count_next: true }
    }
}

/// State of the per-level data access cost walk.
struct DataWalk {
    never_accessed: bool,
    always_accessed: bool,
    occurrence_bound: u64,
}

impl DataWalk {
    fn new() -> Self {
        Self { never_accessed: false, always_accessed: true, occurrence_bound: 1 }
    }

    /// Charges `cost` according to the walk state: certain accesses charge both iterations,
    /// uncertain ones charge the first iteration once per possible occurrence.
    fn charge(&self, cost: i64, update_next: bool, first: &mut i64, next: &mut i64) {
        if self.always_accessed {
            *first += cost;
            if update_next {
                *next += cost;
            }
        } else if !self.never_accessed {
            *first += cost * self.occurrence_bound as i64;
        }
    }

    /// Advances the walk past one level given its classification and block count.
    fn advance(&mut self, chmc: Chmc, blocks: u64, frequency: u64) {
        if chmc == Chmc::AlwaysHit {
            self.never_accessed = true;
        }
        if self.always_accessed {
            self.always_accessed = chmc == Chmc::AlwaysMiss || chmc == Chmc::NotClassified;
        }
        self.occurrence_bound = if self.never_accessed {
            0
        } else if self.always_accessed {
            blocks.min(frequency)
        } else if chmc == Chmc::FirstMiss {
            blocks.min(self.occurrence_bound)
        } else {
            self.occurrence_bound
        };
    }
}

// ANALYSIS CONTRACT
// ================================================================================================

impl Analysis for IpetAnalysis {
    fn name(&self) -> &'static str {
        PASS
    }

    fn check_input_attributes(&mut self, program: &Program) -> Result<(), AnalysisError> {
        if program.contexts().is_none() {
            return Err(AnalysisError::input(PASS, "contexts are not computed"));
        }
        let method = self.method()?;

        let check_icache = !self.config.has_perfect_icache();
        let check_dcache = !self.config.has_perfect_dcache() && !method.has_pipeline();
        for node_ref in reachable_nodes(program) {
            let cfg = program.cfg(node_ref.cfg);
            let node = cfg.node(node_ref.node);
            if node.is_isolated_nop() {
                continue;
            }
            for &ctx in cfg.context_list() {
                if method.has_pipeline()
                    && node.attrs().int_in_ctx(names::NODE_EXEC_TIME_FIRST, ctx).is_none()
                {
                    return Err(AnalysisError::input(
                        PASS,
                        "pipeline timing attributes are missing; run PIPELINE first",
                    ));
                }
                for instr in node.instructions() {
                    if !self.arch.is_code(instr.code()) {
                        continue;
                    }
                    if check_icache {
                        for level in 1..=self.config.num_icache_levels() {
                            let name = names::chmc_code(level);
                            if instr.attrs().str_in_ctx(&name, ctx).is_none() {
                                return Err(AnalysisError::input(
                                    PASS,
                                    format!("missing {name} classification; run ICACHE first"),
                                ));
                            }
                        }
                    }
                    if check_dcache && self.arch.is_load(instr.code()) {
                        for level in 1..=self.config.num_dcache_levels() {
                            let name = names::chmc_data(level);
                            if instr.attrs().str_in_ctx(&name, ctx).is_none() {
                                return Err(AnalysisError::input(
                                    PASS,
                                    format!("missing {name} classification; run DCACHE first"),
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
        let format = self.solver_kind.solver();
        let lp = self.build_lp(program, format.as_ref())?;

        // Solver files live in a process-private directory, removed once parsing is done.
        let dir = tempfile::tempdir()?;
        let lp_path = dir.path().join("wcet.lp");
        let out_path = dir.path().join("wcet.out");
        std::fs::write(&lp_path, &lp)?;

        format.solve(&lp_path, &out_path)?;
        let output = std::fs::read_to_string(&out_path)?;
        let solution = format.parse_output(&output, self.generate_node_freq)?;
        drop(dir);

        tracing::info!(wcet = solution.objective, "worst-case execution time bound computed");

        if self.generate_node_freq {
            self.attach_frequencies(program, &solution)?;
        }
        if self.attach_wcet {
            let entry = program
                .entry_point()
                .ok_or_else(|| AnalysisError::input(PASS, "no entry point selected"))?;
            program
                .cfg_mut(entry)
                .attrs_mut()
                .set_plain(names::WCET, AttrValue::Str(solution.objective.to_string()));
        }
        Ok(())
    }

    fn remove_private_attributes(&mut self, _program: &mut Program) {
        self.node_ids.clear();
    }
}

// TESTS
// ================================================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CacheConfig, CacheKind, MemoryConfig, ReplacementPolicy};
    use tempo_core::arch::Target;
    use tempo_core::cfg::{Cfg, Loop, Node};
    use tempo_core::context::compute_contexts;

    fn cache(kind: CacheKind, latency: u32) -> CacheConfig {
        CacheConfig {
            kind,
            level: 1,
            sets: 1,
            ways: 1,
            line_size: 4,
            policy: ReplacementPolicy::Lru,
            latency,
        }
    }

    fn perfect_config() -> ArchitectureConfig {
        ArchitectureConfig {
            arch: Arch::new(Target::Mips, true),
            caches: vec![
                cache(CacheKind::PerfectInstruction, 1),
                cache(CacheKind::PerfectData, 1),
            ],
            memory: MemoryConfig { load_latency: 100, store_latency: 100 },
        }
    }

    fn icache_config() -> ArchitectureConfig {
        ArchitectureConfig {
            arch: Arch::new(Target::Mips, true),
            caches: vec![
                cache(CacheKind::Instruction, 1),
                cache(CacheKind::PerfectData, 0),
            ],
            memory: MemoryConfig { load_latency: 10, store_latency: 10 },
        }
    }

    fn instr_at(code: &str, addr: u64) -> Instruction {
        let mut i = Instruction::new(code);
        i.set_address(addr);
        i
    }

    fn ipet(config: &ArchitectureConfig) -> IpetAnalysis {
        IpetAnalysis::new(config, SolverKind::LpSolve, false, true, true)
    }

    /// One block of four unit instructions under perfect caches costs four cycles and runs
    /// exactly once.
    #[test]
    fn straight_line_block_under_perfect_caches() {
        let mut program = Program::new("test");
        let mut cfg = Cfg::new("main");
        cfg.add_node(Node::basic(vec![
            instr_at("addu $2, $3, $4", 0x0),
            instr_at("addu $5, $6, $7", 0x4),
            instr_at("addu $8, $9, $10", 0x8),
            instr_at("addu $11, $12, $13", 0xc),
        ]));
        cfg.finalize();
        program.add_cfg(cfg);
        program.set_entry_point("main").unwrap();
        compute_contexts(&mut program).unwrap();

        let mut pass = ipet(&perfect_config());
        let lp = pass.build_lp(&program, &LpSolve).unwrap();

        assert!(lp.contains("MAX: \n4*n_0_c0 ;"));
        assert!(lp.contains("n_0_c0 = 1;"));
    }

    /// A level-1 always-miss pays the cache access plus the memory latency on both
    /// iterations; a first-miss pays the memory latency only once.
    #[test]
    fn block_cost_follows_the_classification() {
        let config = icache_config();
        let chmc = names::chmc_code(1);
        let root = ContextId::new(0);

        let build = |classif: &str| {
            let mut program = Program::new("test");
            let mut cfg = Cfg::new("main");
            let mut instr = instr_at("addu $2, $3, $4", 0x0);
            instr
                .attrs_mut()
                .set_in_ctx(&chmc, root, AttrValue::Str(classif.into()));
            cfg.add_node(Node::basic(vec![instr]));
            cfg.finalize();
            program.add_cfg(cfg);
            program.set_entry_point("main").unwrap();
            compute_contexts(&mut program).unwrap();
            program
        };

        let mut pass = ipet(&config);
        let program = build("AM");
        pass.assign_node_ids(&program);
        let node = NodeRef::new(CfgId::new(0), NodeId::new(0));
        assert_eq!(pass.node_cost(&program, node, root, false, true), (11, 11));

        let program = build("FM");
        assert_eq!(pass.node_cost(&program, node, root, false, true), (11, 1));

        let program = build("AH");
        assert_eq!(pass.node_cost(&program, node, root, false, true), (1, 1));
    }

    /// A loop bounded at 5 constrains every body block against its entry edges.
    #[test]
    fn loop_bound_constraints_are_emitted() {
        let mut program = Program::new("test");
        let mut cfg = Cfg::new("main");
        let pre = cfg.add_node(Node::basic(vec![instr_at("addiu $2, $0, 0", 0x0)]));
        let head = cfg.add_node(Node::basic(vec![instr_at("slti $3, $2, 5", 0x4)]));
        let body = cfg.add_node(Node::basic(vec![instr_at("addiu $2, $2, 1", 0x8)]));
        let exit = cfg.add_node(Node::basic(vec![instr_at("jr $31", 0xc)]));
        cfg.add_edge(pre, head);
        cfg.add_edge(head, body);
        let back = cfg.add_edge(body, head);
        cfg.add_edge(head, exit);
        let mut l = Loop::new(head, vec![head, body], vec![back]);
        l.set_max_iterations(5);
        cfg.add_loop(l);
        cfg.finalize();
        program.add_cfg(cfg);
        program.set_entry_point("main").unwrap();
        compute_contexts(&mut program).unwrap();

        let mut pass = ipet(&perfect_config());
        let lp = pass.build_lp(&program, &LpSolve).unwrap();

        // Body (node 2) is bounded by 5 traversals of the entry edge pre -> head; the head
        // itself is not (it runs the extra exit check).
        assert!(lp.contains("-5*e_0_1_c0  + 1*n_2_c0  <= 0;"));
        assert!(!lp.contains("1*n_1_c0  <= 0;"));
        // Flow conservation around the head.
        assert!(lp.contains("e_0_1_c0 + e_2_1_c0 - n_1_c0 = 0;"));
        assert!(lp.contains("e_1_2_c0 + e_1_3_c0 - n_1_c0 = 0;"));
    }

    /// An outer header whose other nodes all sit in a nested loop is still a header: it gets
    /// no bound of its own (it runs the extra exit check), while the inner body is bounded
    /// against the inner entry edge.
    #[test]
    fn nested_loop_header_is_not_bounded() {
        let mut program = Program::new("test");
        let mut cfg = Cfg::new("main");
        let pre = cfg.add_node(Node::basic(vec![instr_at("addiu $2, $0, 0", 0x0)]));
        let outer_head = cfg.add_node(Node::basic(vec![instr_at("slti $3, $2, 5", 0x4)]));
        let inner_head = cfg.add_node(Node::basic(vec![instr_at("slti $5, $4, 3", 0x8)]));
        let inner_body = cfg.add_node(Node::basic(vec![instr_at("addiu $4, $4, 1", 0xc)]));
        let exit = cfg.add_node(Node::basic(vec![instr_at("jr $31", 0x10)]));
        cfg.add_edge(pre, outer_head);
        cfg.add_edge(outer_head, inner_head);
        cfg.add_edge(inner_head, inner_body);
        let inner_back = cfg.add_edge(inner_body, inner_head);
        let outer_back = cfg.add_edge(inner_head, outer_head);
        cfg.add_edge(outer_head, exit);
        let mut outer = Loop::new(
            outer_head,
            vec![outer_head, inner_head, inner_body],
            vec![outer_back],
        );
        outer.set_max_iterations(5);
        let mut inner = Loop::new(inner_head, vec![inner_head, inner_body], vec![inner_back]);
        inner.set_max_iterations(3);
        cfg.add_loop(outer);
        cfg.add_loop(inner);
        cfg.finalize();
        program.add_cfg(cfg);
        program.set_entry_point("main").unwrap();
        compute_contexts(&mut program).unwrap();

        let mut pass = ipet(&perfect_config());
        let lp = pass.build_lp(&program, &LpSolve).unwrap();

        // The inner body (node 3) is bounded by 3 traversals of the inner entry edge
        // outer_head -> inner_head.
        assert!(lp.contains("-3*e_1_2_c0  + 1*n_3_c0  <= 0;"));
        // The outer loop's only nested-free node is its header, which must stay unbounded:
        // it executes maxiter + 1 times per entry.
        assert!(!lp.contains("n_1_c0  <= 0;"));
    }

    /// Each call site is coupled with the callee entry in the matching context.
    #[test]
    fn call_sites_couple_with_callee_contexts() {
        let mut program = Program::new("test");
        let f = CfgId::new(1);
        let mut main_cfg = Cfg::new("main");
        let c1 = main_cfg.add_node(Node::call(f, vec![instr_at("jal f", 0x0)]));
        let c2 = main_cfg.add_node(Node::call(f, vec![instr_at("jal f", 0x4)]));
        main_cfg.add_edge(c1, c2);
        main_cfg.finalize();
        let mut f_cfg = Cfg::new("f");
        f_cfg.add_node(Node::basic(vec![instr_at("addu $2, $3, $4", 0x100)]));
        f_cfg.finalize();
        program.add_cfg(main_cfg);
        program.add_cfg(f_cfg);
        program.set_entry_point("main").unwrap();
        compute_contexts(&mut program).unwrap();

        let mut pass = ipet(&perfect_config());
        let lp = pass.build_lp(&program, &LpSolve).unwrap();

        // Nodes 0/1 are the two call sites, node 2 is f's body; contexts 1 and 2 are f's.
        assert!(lp.contains("n_2_c1 - n_0_c0 = 0;"));
        assert!(lp.contains("n_2_c2 - n_1_c0 = 0;"));
    }

    /// Solved block frequencies land as per-context attributes; a duplicate is a bug.
    #[test]
    fn frequencies_are_attached_once() {
        let mut program = Program::new("test");
        let mut cfg = Cfg::new("main");
        cfg.add_node(Node::basic(vec![instr_at("addu $2, $3, $4", 0x0)]));
        cfg.finalize();
        program.add_cfg(cfg);
        program.set_entry_point("main").unwrap();
        compute_contexts(&mut program).unwrap();

        let mut pass = ipet(&perfect_config());
        pass.assign_node_ids(&program);
        let solution = Solution {
            objective: 4,
            variables: vec![("n_0_c0".into(), 1), ("e_0_1_c0".into(), 1)],
        };
        pass.attach_frequencies(&mut program, &solution).unwrap();

        let attrs = program.cfg(CfgId::new(0)).node(NodeId::new(0)).attrs();
        assert!(matches!(
            attrs.get_plain("frequency_c0"),
            Some(AttrValue::UInt(1))
        ));

        assert!(pass.attach_frequencies(&mut program, &solution).is_err());
    }

    /// Identical inputs produce a byte-identical linear program.
    #[test]
    fn lp_generation_is_deterministic() {
        let build = || {
            let mut program = Program::new("test");
            let f = CfgId::new(1);
            let mut main_cfg = Cfg::new("main");
            let c1 = main_cfg.add_node(Node::call(f, vec![instr_at("jal f", 0x0)]));
            let c2 = main_cfg.add_node(Node::call(f, vec![instr_at("jal f", 0x4)]));
            main_cfg.add_edge(c1, c2);
            main_cfg.finalize();
            let mut f_cfg = Cfg::new("f");
            f_cfg.add_node(Node::basic(vec![instr_at("addu $2, $3, $4", 0x100)]));
            f_cfg.finalize();
            program.add_cfg(main_cfg);
            program.add_cfg(f_cfg);
            program.set_entry_point("main").unwrap();
            compute_contexts(&mut program).unwrap();

            let mut pass = ipet(&perfect_config());
            pass.build_lp(&program, &LpSolve).unwrap()
        };
        assert_eq!(build(), build());
    }

    /// Pipeline timing with a perfect instruction cache has no defined cost model.
    #[test]
    fn pipeline_without_icache_is_rejected() {
        let pass = IpetAnalysis::new(&perfect_config(), SolverKind::LpSolve, true, true, false);
        assert!(pass.method().is_err());
    }
}
