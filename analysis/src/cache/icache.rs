//! Per-level instruction cache analysis.
//!
//! For one cache level, the pass runs up to three abstract interpretations over the
//! contextual CFG (Must, persistence, May), classifies every instruction fetch as
//! AH/FM/AM/NC/AU for every context, and derives the access classification the next cache
//! level will see. Level 1 additionally seeds every fetch with CAC `A`.

use std::collections::BTreeSet;

use tempo_core::context::ContextTree;
use tempo_core::walker::{compute_back_edges, init_work, reachable_nodes, ContextualNode};
use tempo_core::{names, AttrValue, CallGraph, NodeRef, Program};

use super::{
    fixpoint, may_width, must_ps_widths, next_level_cac, AbstractCache, AcsMaps, Cac, CacheSet,
    Chmc, FixpointMode, MaySet, MustSet, PsSet,
};
use crate::config::CacheConfig;
use crate::{Analysis, AnalysisError};

const PASS: &str = "ICACHE";

// INSTRUCTION CACHE ANALYSIS
// ================================================================================================

pub struct ICacheAnalysis {
    level: u32,
    sets: u32,
    ways: u32,
    line_size: u32,
    policy: crate::config::ReplacementPolicy,
    perfect: bool,
    apply_must: bool,
    apply_persistence: bool,
    apply_may: bool,
    keep_age: bool,
    must: AcsMaps<MustSet>,
    ps: AcsMaps<PsSet>,
    may: AcsMaps<MaySet>,
}

impl ICacheAnalysis {
    /// Creates the pass for one cache level. For a perfect cache every analysis is disabled
    /// and all fetches classify as hits.
    pub fn new(
        cache: &CacheConfig,
        apply_must: bool,
        apply_persistence: bool,
        apply_may: bool,
        keep_age: bool,
    ) -> Self {
        let perfect = cache.kind.is_perfect();
        Self {
            level: cache.level,
            sets: cache.sets,
            ways: cache.ways,
            line_size: cache.line_size,
            policy: cache.policy,
            perfect,
            apply_must: apply_must && !perfect,
            apply_persistence: apply_persistence && !perfect,
            apply_may: apply_may && !perfect,
            keep_age: keep_age && !perfect,
            must: AcsMaps::new(),
            ps: AcsMaps::new(),
            may: AcsMaps::new(),
        }
    }

    // CACHE FACTORIES
    // --------------------------------------------------------------------------------------------

    fn empty_must(&self) -> AbstractCache<MustSet> {
        let (used, removed) = must_ps_widths(self.policy, self.ways);
        AbstractCache::new(self.sets, self.line_size, MustSet::new(used, removed))
    }

    fn empty_ps(&self) -> AbstractCache<PsSet> {
        let (used, removed) = must_ps_widths(self.policy, self.ways);
        AbstractCache::new(self.sets, self.line_size, PsSet::new(used, removed))
    }

    fn empty_may(&self) -> Result<AbstractCache<MaySet>, AnalysisError> {
        let used = may_width(PASS, self.policy, self.ways)?;
        Ok(AbstractCache::new(self.sets, self.line_size, MaySet::new(used)))
    }

    // MUST ANALYSIS
    // --------------------------------------------------------------------------------------------

    fn must_analysis(
        &mut self,
        program: &mut Program,
        tree: &ContextTree,
        call_graph: &CallGraph,
        reachable: &[NodeRef],
    ) {
        {
            let prog: &Program = program;
            let empty = self.empty_must();
            for (cn, _) in contextual_nodes(prog, reachable) {
                self.must.ins.insert(cn, empty.clone());
                self.must.outs.insert(cn, empty.clone());
            }

            let back_edges = compute_back_edges(prog, call_graph);
            let level = self.level;
            let mut simulate = |cn: ContextualNode, acs: &mut AbstractCache<MustSet>| {
                simulate_fetches(prog, tree, level, cn, acs)
            };

            // First phase ignores back-edges: loop bodies see the state from the loop entry
            // instead of an artificial bottom, which keeps the classification precise.
            fixpoint(
                prog,
                tree,
                &mut self.must,
                FixpointMode::NoBackEdges,
                &back_edges,
                init_work(prog, tree),
                &mut simulate,
            );
            // Second phase runs to the real fixed point over every edge.
            fixpoint(
                prog,
                tree,
                &mut self.must,
                FixpointMode::ForceVisit,
                &back_edges,
                init_work(prog, tree),
                &mut simulate,
            );
        }

        self.classify_must(program, reachable);
    }

    /// Classifies fetches proven present by the Must analysis as AH and consumes the Must
    /// states.
    fn classify_must(&mut self, program: &mut Program, reachable: &[NodeRef]) {
        let chmc_name = names::chmc_code(self.level);
        let cac_name = names::cac_code(self.level);
        let age_name = names::age_must_code(self.level);

        for (cn, node_ref) in contextual_nodes(program, reachable) {
            let Some(mut acs) = self.must.ins.remove(&cn) else { continue };
            self.must.outs.remove(&cn);

            let mut writes = Vec::new();
            {
                let node = program.cfg(node_ref.cfg).node(node_ref.node);
                for (index, instr) in node.instructions().iter().enumerate() {
                    let cac = instr
                        .attrs()
                        .str_in_ctx(&cac_name, cn.ctx)
                        .and_then(Cac::from_str)
                        .unwrap_or(Cac::Never);
                    if cac == Cac::Never {
                        writes.push((index, Chmc::AlwaysUnused, None));
                        continue;
                    }
                    let Some(addr) = instr.address() else { continue };
                    if acs.present(addr) {
                        let age = self.keep_age.then(|| acs.age(addr));
                        writes.push((index, Chmc::AlwaysHit, age));
                    }
                    acs.update(addr, cac);
                }
            }

            let node = program.cfg_mut(node_ref.cfg).node_mut(node_ref.node);
            for (index, chmc, age) in writes {
                let instr = &mut node.instructions_mut()[index];
                instr
                    .attrs_mut()
                    .set_in_ctx(&chmc_name, cn.ctx, AttrValue::Str(chmc.as_str().into()));
                if let Some(age) = age {
                    instr.attrs_mut().set_in_ctx(&age_name, cn.ctx, AttrValue::Int(age as i64));
                }
            }
        }
    }

    // PERSISTENCE ANALYSIS
    // --------------------------------------------------------------------------------------------

    fn ps_analysis(
        &mut self,
        program: &mut Program,
        tree: &ContextTree,
        call_graph: &CallGraph,
        reachable: &[NodeRef],
    ) {
        {
            let prog: &Program = program;
            let work = self.ps_region_init(prog, tree, call_graph);
            let back_edges = BTreeSet::new();
            let level = self.level;
            let mut simulate = |cn: ContextualNode, acs: &mut AbstractCache<PsSet>| {
                simulate_fetches(prog, tree, level, cn, acs)
            };
            fixpoint(
                prog,
                tree,
                &mut self.ps,
                FixpointMode::Region,
                &back_edges,
                work,
                &mut simulate,
            );
        }
        self.classify_ps(program, reachable);
    }

    /// Attaches empty persistence states to every node of the analyzed regions: all outer
    /// loops, plus the whole body of any CFG whose callers are (transitively) inside a loop.
    /// Returns the initial work set (the outer loop heads).
    fn ps_region_init(
        &mut self,
        program: &Program,
        tree: &ContextTree,
        call_graph: &CallGraph,
    ) -> BTreeSet<ContextualNode> {
        let empty = self.empty_ps();
        let mut work = BTreeSet::new();

        for (cfg_id, cfg) in program.cfgs() {
            if call_graph.is_dead_code(cfg_id) {
                continue;
            }
            for &ctx in cfg.context_list() {
                if tree.caller_in_loop(program, ctx) {
                    for node in cfg.node_ids() {
                        let cn = ContextualNode::new(ctx, node);
                        self.ps.ins.insert(cn, empty.clone());
                        self.ps.outs.insert(cn, empty.clone());
                    }
                } else {
                    for (loop_id, l) in cfg.loops() {
                        let nested = cfg
                            .loops()
                            .any(|(other, outer)| other != loop_id && l.is_nested_in(outer));
                        if nested {
                            continue;
                        }
                        work.insert(ContextualNode::new(ctx, l.head()));
                        for &node in l.nodes() {
                            let cn = ContextualNode::new(ctx, node);
                            self.ps.ins.insert(cn, empty.clone());
                            self.ps.outs.insert(cn, empty.clone());
                        }
                    }
                }
            }
        }
        work
    }

    /// Classifies persistent fetches as FM; only touches instructions the Must analysis left
    /// unclassified.
    fn classify_ps(&mut self, program: &mut Program, reachable: &[NodeRef]) {
        let chmc_name = names::chmc_code(self.level);
        let cac_name = names::cac_code(self.level);
        let age_name = names::age_ps_code(self.level);

        for (cn, node_ref) in contextual_nodes(program, reachable) {
            let Some(mut acs) = self.ps.ins.remove(&cn) else { continue };
            self.ps.outs.remove(&cn);

            let mut writes = Vec::new();
            {
                let node = program.cfg(node_ref.cfg).node(node_ref.node);
                for (index, instr) in node.instructions().iter().enumerate() {
                    if instr.attrs().str_in_ctx(&chmc_name, cn.ctx).is_some() {
                        continue;
                    }
                    let cac = instr
                        .attrs()
                        .str_in_ctx(&cac_name, cn.ctx)
                        .and_then(Cac::from_str)
                        .unwrap_or(Cac::Never);
                    if cac == Cac::Never {
                        writes.push((index, Chmc::AlwaysUnused, None));
                        continue;
                    }
                    let Some(addr) = instr.address() else { continue };
                    if acs.present(addr) {
                        let age = self.keep_age.then(|| acs.age(addr));
                        writes.push((index, Chmc::FirstMiss, age));
                    }
                    acs.update(addr, cac);
                }
            }

            let node = program.cfg_mut(node_ref.cfg).node_mut(node_ref.node);
            for (index, chmc, age) in writes {
                let instr = &mut node.instructions_mut()[index];
                instr
                    .attrs_mut()
                    .set_in_ctx(&chmc_name, cn.ctx, AttrValue::Str(chmc.as_str().into()));
                if let Some(age) = age {
                    instr.attrs_mut().set_in_ctx(&age_name, cn.ctx, AttrValue::Int(age as i64));
                }
            }
        }
    }

    // MAY ANALYSIS
    // --------------------------------------------------------------------------------------------

    fn may_analysis(
        &mut self,
        program: &mut Program,
        tree: &ContextTree,
        reachable: &[NodeRef],
    ) -> Result<(), AnalysisError> {
        {
            let prog: &Program = program;
            let empty = self.empty_may()?;
            for (cn, _) in contextual_nodes(prog, reachable) {
                self.may.ins.insert(cn, empty.clone());
                self.may.outs.insert(cn, empty.clone());
            }

            let back_edges = BTreeSet::new();
            let level = self.level;
            let mut simulate = |cn: ContextualNode, acs: &mut AbstractCache<MaySet>| {
                simulate_fetches(prog, tree, level, cn, acs)
            };
            fixpoint(
                prog,
                tree,
                &mut self.may,
                FixpointMode::ForceVisit,
                &back_edges,
                init_work(prog, tree),
                &mut simulate,
            );
        }

        self.classify_may(program, reachable);
        Ok(())
    }

    /// Classifies fetches absent from the May state as AM; only touches instructions no
    /// earlier analysis classified.
    fn classify_may(&mut self, program: &mut Program, reachable: &[NodeRef]) {
        let chmc_name = names::chmc_code(self.level);
        let cac_name = names::cac_code(self.level);

        for (cn, node_ref) in contextual_nodes(program, reachable) {
            let Some(mut acs) = self.may.ins.remove(&cn) else { continue };
            self.may.outs.remove(&cn);

            let mut writes = Vec::new();
            {
                let node = program.cfg(node_ref.cfg).node(node_ref.node);
                for (index, instr) in node.instructions().iter().enumerate() {
                    if instr.attrs().str_in_ctx(&chmc_name, cn.ctx).is_some() {
                        continue;
                    }
                    let cac = instr
                        .attrs()
                        .str_in_ctx(&cac_name, cn.ctx)
                        .and_then(Cac::from_str)
                        .unwrap_or(Cac::Never);
                    if cac == Cac::Never {
                        writes.push((index, Chmc::AlwaysUnused));
                        continue;
                    }
                    let Some(addr) = instr.address() else { continue };
                    if acs.absent(addr) {
                        writes.push((index, Chmc::AlwaysMiss));
                    }
                    acs.update(addr, cac);
                }
            }

            let node = program.cfg_mut(node_ref.cfg).node_mut(node_ref.node);
            for (index, chmc) in writes {
                node.instructions_mut()[index]
                    .attrs_mut()
                    .set_in_ctx(&chmc_name, cn.ctx, AttrValue::Str(chmc.as_str().into()));
            }
        }
    }

    // FINAL CLASSIFICATION
    // --------------------------------------------------------------------------------------------

    /// Stamps `fallback` on every fetch no analysis classified (NC normally, AH for a
    /// perfect cache), then derives the next-level access classification.
    fn finish_classification(
        &self,
        program: &mut Program,
        reachable: &[NodeRef],
    ) -> Result<(), AnalysisError> {
        let fallback = if self.perfect { Chmc::AlwaysHit } else { Chmc::NotClassified };
        let chmc_name = names::chmc_code(self.level);
        let cac_name = names::cac_code(self.level);
        let next_cac_name = names::cac_code(self.level + 1);

        for (cn, node_ref) in contextual_nodes(program, reachable) {
            let node = program.cfg_mut(node_ref.cfg).node_mut(node_ref.node);
            for instr in node.instructions_mut() {
                if instr.attrs().str_in_ctx(&chmc_name, cn.ctx).is_none() {
                    instr.attrs_mut().set_in_ctx(
                        &chmc_name,
                        cn.ctx,
                        AttrValue::Str(fallback.as_str().into()),
                    );
                }

                let chmc = instr
                    .attrs()
                    .str_in_ctx(&chmc_name, cn.ctx)
                    .and_then(Chmc::from_str)
                    .ok_or_else(|| {
                        AnalysisError::internal(PASS, "missing classification after all passes")
                    })?;
                let cac = instr
                    .attrs()
                    .str_in_ctx(&cac_name, cn.ctx)
                    .and_then(Cac::from_str)
                    .unwrap_or(Cac::Never);
                let next = next_level_cac(chmc, cac);
                instr.attrs_mut().set_in_ctx(
                    &next_cac_name,
                    cn.ctx,
                    AttrValue::Str(next.as_str().into()),
                );
            }
        }
        Ok(())
    }
}

// ANALYSIS CONTRACT
// ================================================================================================

impl Analysis for ICacheAnalysis {
    fn name(&self) -> &'static str {
        PASS
    }

    fn check_input_attributes(&mut self, program: &Program) -> Result<(), AnalysisError> {
        if program.contexts().is_none() {
            return Err(AnalysisError::input(PASS, "contexts are not computed"));
        }
        if self.level > 1 {
            let cac_name = names::cac_code(self.level);
            for node_ref in reachable_nodes(program) {
                let cfg = program.cfg(node_ref.cfg);
                for &ctx in cfg.context_list() {
                    for instr in cfg.node(node_ref.node).instructions() {
                        if instr.attrs().str_in_ctx(&cac_name, ctx).is_none() {
                            return Err(AnalysisError::input(
                                PASS,
                                format!("instructions should have the {cac_name} attribute set"),
                            ));
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
        let reachable = reachable_nodes(program);

        if self.level == 1 {
            seed_level_one_cac(program, &reachable);
        }

        if self.apply_must {
            self.must_analysis(program, &tree, &call_graph, &reachable);
            tracing::info!(level = self.level, "instruction cache Must analysis done");
        }
        if self.apply_persistence {
            self.ps_analysis(program, &tree, &call_graph, &reachable);
            tracing::info!(level = self.level, "instruction cache persistence analysis done");
        }
        if self.apply_may {
            self.may_analysis(program, &tree, &reachable)?;
            tracing::info!(level = self.level, "instruction cache May analysis done");
        }

        self.finish_classification(program, &reachable)
    }

    fn remove_private_attributes(&mut self, _program: &mut Program) {
        self.must.clear();
        self.ps.clear();
        self.may.clear();
    }
}

// SHARED HELPERS
// ================================================================================================

/// Pairs every reachable node with each execution context of its CFG, in traversal order.
pub(crate) fn contextual_nodes(
    program: &Program,
    reachable: &[NodeRef],
) -> Vec<(ContextualNode, NodeRef)> {
    let mut out = Vec::new();
    for &node_ref in reachable {
        for &ctx in program.cfg(node_ref.cfg).context_list() {
            out.push((ContextualNode::new(ctx, node_ref.node), node_ref));
        }
    }
    out
}

/// Writes CAC `A` on every instruction of every reachable node, for every context: every
/// fetch always reaches the first cache level.
fn seed_level_one_cac(program: &mut Program, reachable: &[NodeRef]) {
    let cac_name = names::cac_code(1);
    for &node_ref in reachable {
        let contexts = program.cfg(node_ref.cfg).context_list().to_vec();
        let node = program.cfg_mut(node_ref.cfg).node_mut(node_ref.node);
        for instr in node.instructions_mut() {
            for &ctx in &contexts {
                instr.attrs_mut().set_in_ctx(&cac_name, ctx, AttrValue::Str("A".into()));
            }
        }
    }
}

/// Simulates the fetches of one node on `acs`, honoring each instruction's access
/// classification at this level.
fn simulate_fetches<S: CacheSet>(
    program: &Program,
    tree: &ContextTree,
    level: u32,
    cn: ContextualNode,
    acs: &mut AbstractCache<S>,
) {
    let cac_name = names::cac_code(level);
    let cfg = program.cfg(cn.cfg(tree));
    for instr in cfg.node(cn.node).instructions() {
        let cac = instr
            .attrs()
            .str_in_ctx(&cac_name, cn.ctx)
            .and_then(Cac::from_str)
            .unwrap_or(Cac::Never);
        if cac == Cac::Never {
            continue;
        }
        if let Some(addr) = instr.address() {
            acs.update(addr, cac);
        }
    }
}

// TESTS
// ================================================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CacheKind, ReplacementPolicy};
    use tempo_core::cfg::{Cfg, Instruction, Loop, Node};
    use tempo_core::context::compute_contexts;
    use tempo_core::{CfgId, NodeId};

    fn icache(sets: u32, ways: u32, line: u32) -> CacheConfig {
        CacheConfig {
            kind: CacheKind::Instruction,
            level: 1,
            sets,
            ways,
            line_size: line,
            policy: ReplacementPolicy::Lru,
            latency: 1,
        }
    }

    fn instr_at(code: &str, addr: u64) -> Instruction {
        let mut i = Instruction::new(code);
        i.set_address(addr);
        i
    }

    fn run_level_one(program: &mut Program, cache: &CacheConfig, ps: bool) {
        let mut pass = ICacheAnalysis::new(cache, true, ps, true, false);
        pass.check_input_attributes(program).unwrap();
        pass.perform(program).unwrap();
        pass.remove_private_attributes(program);
    }

    fn chmc_of(program: &Program, cfg: u32, node: u32, ctx: tempo_core::ContextId) -> String {
        program
            .cfg(CfgId::new(cfg))
            .node(NodeId::new(node))
            .instructions()[0]
            .attrs()
            .str_in_ctx(&names::chmc_code(1), ctx)
            .unwrap()
            .to_string()
    }

    /// main calls f twice; with two ways the Must analysis proves the second call hits.
    #[test]
    fn must_proves_presence_across_contexts() {
        let mut program = Program::new("test");
        let f = CfgId::new(1);

        let mut main_cfg = Cfg::new("main");
        let c1 = main_cfg.add_node(Node::call(f, vec![instr_at("jal f", 0x100)]));
        let c2 = main_cfg.add_node(Node::call(f, vec![instr_at("jal f", 0x104)]));
        main_cfg.add_edge(c1, c2);
        main_cfg.finalize();

        let mut f_cfg = Cfg::new("f");
        f_cfg.add_node(Node::basic(vec![instr_at("addu $2, $3, $4", 0x0)]));
        f_cfg.finalize();

        program.add_cfg(main_cfg);
        program.add_cfg(f_cfg);
        program.set_entry_point("main").unwrap();
        compute_contexts(&mut program).unwrap();

        let tree = program.contexts().unwrap();
        let root = tree.root();
        let ctx1 = tree.callee_context(root, NodeId::new(0)).unwrap();
        let ctx2 = tree.callee_context(root, NodeId::new(1)).unwrap();

        run_level_one(&mut program, &icache(1, 2, 16), false);

        // First call misses, second call provably hits: the block stayed in the cache.
        assert_eq!(chmc_of(&program, 1, 0, ctx1), "AM");
        assert_eq!(chmc_of(&program, 1, 0, ctx2), "AH");
    }

    /// A block fetched inside a loop is persistent when nothing else maps to its set.
    #[test]
    fn persistence_classifies_loop_body_as_first_miss() {
        let mut program = Program::new("test");
        let mut cfg = Cfg::new("main");
        let pre = cfg.add_node(Node::basic(vec![instr_at("addiu $2, $0, 0", 0x0)]));
        let head = cfg.add_node(Node::basic(vec![instr_at("slti $3, $2, 10", 0x40)]));
        let body = cfg.add_node(Node::basic(vec![instr_at("addiu $2, $2, 1", 0x80)]));
        let exit = cfg.add_node(Node::basic(vec![instr_at("jr $31", 0xc0)]));
        cfg.add_edge(pre, head);
        cfg.add_edge(head, body);
        let back = cfg.add_edge(body, head);
        cfg.add_edge(head, exit);
        let mut l = Loop::new(head, vec![head, body], vec![back]);
        l.set_max_iterations(10);
        cfg.add_loop(l);
        cfg.finalize();
        program.add_cfg(cfg);
        program.set_entry_point("main").unwrap();
        compute_contexts(&mut program).unwrap();
        let root = program.contexts().unwrap().root();

        // 4 sets, 1 way, 64-byte lines: every block has its own set, nothing conflicts.
        run_level_one(&mut program, &icache(4, 1, 64), true);

        // Loop blocks: persistent (first execution misses, the rest hit).
        assert_eq!(chmc_of(&program, 0, 1, root), "FM");
        assert_eq!(chmc_of(&program, 0, 2, root), "FM");
        // Straight-line code before and after the loop is classified by Must/May alone.
        assert_eq!(chmc_of(&program, 0, 0, root), "AM");
        assert_eq!(chmc_of(&program, 0, 3, root), "AM");
    }

    /// Without Must/PS/May evidence an access stays NC; a perfect cache forces AH.
    #[test]
    fn leftovers_default_to_not_classified() {
        let mut program = Program::new("test");
        let mut cfg = Cfg::new("main");
        cfg.add_node(Node::basic(vec![instr_at("addu $2, $3, $4", 0x0)]));
        cfg.finalize();
        program.add_cfg(cfg);
        program.set_entry_point("main").unwrap();
        compute_contexts(&mut program).unwrap();
        let root = program.contexts().unwrap().root();

        let cache = icache(1, 1, 16);
        let mut pass = ICacheAnalysis::new(&cache, false, false, false, false);
        pass.perform(&mut program).unwrap();
        assert_eq!(chmc_of(&program, 0, 0, root), "NC");

        let perfect = CacheConfig { kind: CacheKind::PerfectInstruction, ..cache };
        let mut program2 = {
            let mut p = Program::new("test");
            let mut c = Cfg::new("main");
            c.add_node(Node::basic(vec![instr_at("addu $2, $3, $4", 0x0)]));
            c.finalize();
            p.add_cfg(c);
            p.set_entry_point("main").unwrap();
            compute_contexts(&mut p).unwrap();
            p
        };
        let mut pass = ICacheAnalysis::new(&perfect, true, true, true, false);
        pass.perform(&mut program2).unwrap();
        let root2 = program2.contexts().unwrap().root();
        assert_eq!(chmc_of(&program2, 0, 0, root2), "AH");
    }

    /// The next-level access classification follows the fixed table.
    #[test]
    fn next_level_cac_table() {
        use super::next_level_cac as t;
        assert_eq!(t(Chmc::AlwaysHit, Cac::Always), Cac::Never);
        assert_eq!(t(Chmc::AlwaysHit, Cac::Uncertain), Cac::Never);
        assert_eq!(t(Chmc::AlwaysMiss, Cac::Always), Cac::Always);
        assert_eq!(t(Chmc::AlwaysMiss, Cac::Uncertain), Cac::Uncertain);
        assert_eq!(t(Chmc::AlwaysMiss, Cac::UncertainNever), Cac::UncertainNever);
        assert_eq!(t(Chmc::FirstMiss, Cac::Always), Cac::UncertainNever);
        assert_eq!(t(Chmc::NotClassified, Cac::Always), Cac::Uncertain);
        assert_eq!(t(Chmc::NotClassified, Cac::UncertainNever), Cac::UncertainNever);
        assert_eq!(t(Chmc::AlwaysUnused, Cac::Never), Cac::Never);
    }

    /// After a level-1 run, every instruction carries a CAC for level 2.
    #[test]
    fn next_level_cac_is_attached_everywhere() {
        let mut program = Program::new("test");
        let mut cfg = Cfg::new("main");
        cfg.add_node(Node::basic(vec![
            instr_at("addu $2, $3, $4", 0x0),
            instr_at("addu $5, $2, $4", 0x4),
        ]));
        cfg.finalize();
        program.add_cfg(cfg);
        program.set_entry_point("main").unwrap();
        compute_contexts(&mut program).unwrap();
        let root = program.contexts().unwrap().root();

        run_level_one(&mut program, &icache(1, 1, 16), false);

        let cac2 = names::cac_code(2);
        for instr in program.cfg(CfgId::new(0)).node(NodeId::new(0)).instructions() {
            assert!(instr.attrs().str_in_ctx(&cac2, root).is_some());
        }
    }
}
