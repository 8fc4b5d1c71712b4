//! Per-level data cache analysis.
//!
//! Same skeleton as the instruction side, with two differences: only loads touch the modeled
//! write-through cache (stores go straight to memory and non-loads classify as AU), and a
//! load may touch any block of its address-range set, so the abstract updates are
//! set-valued. The number of candidate blocks of every load is recorded for the path
//! analysis. Classification is only supported under LRU replacement.

use std::collections::BTreeSet;

use tempo_core::cfg::Instruction;
use tempo_core::context::{ContextId, ContextTree};
use tempo_core::walker::{compute_back_edges, init_work, reachable_nodes, ContextualNode};
use tempo_core::{names, Arch, AttrValue, CallGraph, NodeRef, Program};

use super::icache::contextual_nodes;
use super::{
    fixpoint, may_width, must_ps_widths, next_level_cac, AbstractCache, AcsMaps, BlockAddr, Cac,
    CacheSet, Chmc, FixpointMode, MaySet, MustSet, PsSet,
};
use crate::config::{CacheConfig, ReplacementPolicy};
use crate::{Analysis, AnalysisError};

const PASS: &str = "DCACHE";

// DATA CACHE ANALYSIS
// ================================================================================================

pub struct DCacheAnalysis {
    arch: Arch,
    level: u32,
    sets: u32,
    ways: u32,
    line_size: u32,
    policy: ReplacementPolicy,
    perfect: bool,
    apply_must: bool,
    apply_persistence: bool,
    apply_may: bool,
    must: AcsMaps<MustSet>,
    ps: AcsMaps<PsSet>,
    may: AcsMaps<MaySet>,
}

impl DCacheAnalysis {
    /// Creates the pass for one cache level; rejects any replacement policy other than LRU
    /// (the set-valued classification is only sound there).
    pub fn new(
        arch: Arch,
        cache: &CacheConfig,
        apply_must: bool,
        apply_persistence: bool,
        apply_may: bool,
    ) -> Result<Self, AnalysisError> {
        let perfect = cache.kind.is_perfect();
        if !perfect && cache.policy != ReplacementPolicy::Lru {
            return Err(AnalysisError::unsupported(
                PASS,
                "only the LRU replacement policy is supported for data cache classification",
            ));
        }
        Ok(Self {
            arch,
            level: cache.level,
            sets: cache.sets,
            ways: cache.ways,
            line_size: cache.line_size,
            policy: cache.policy,
            perfect,
            apply_must: apply_must && !perfect,
            apply_persistence: apply_persistence && !perfect,
            apply_may: apply_may && !perfect,
            must: AcsMaps::new(),
            ps: AcsMaps::new(),
            may: AcsMaps::new(),
        })
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

    /// The cache-line blocks a load may touch in one context: every range of every non-code
    /// segment of its address attribute (the contextual variant wins), quantized to lines.
    fn data_blocks(&self, instr: &Instruction, ctx: ContextId) -> BTreeSet<BlockAddr> {
        data_blocks(instr, ctx, self.line_size)
    }

    // ANALYSES
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
            let arch = self.arch;
            let line_size = self.line_size;
            let mut simulate = |cn: ContextualNode, acs: &mut AbstractCache<MustSet>| {
                simulate_loads(prog, tree, arch, level, line_size, cn, acs)
            };
            fixpoint(
                prog,
                tree,
                &mut self.must,
                FixpointMode::NoBackEdges,
                &back_edges,
                init_work(prog, tree),
                &mut simulate,
            );
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

        self.classify(program, reachable, Lattice::Must);
    }

    fn ps_analysis(
        &mut self,
        program: &mut Program,
        tree: &ContextTree,
        call_graph: &CallGraph,
        reachable: &[NodeRef],
    ) {
        {
            let prog: &Program = program;
            let empty = self.empty_ps();
            let mut work = BTreeSet::new();
            for (cfg_id, cfg) in prog.cfgs() {
                if call_graph.is_dead_code(cfg_id) {
                    continue;
                }
                for &ctx in cfg.context_list() {
                    if tree.caller_in_loop(prog, ctx) {
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

            let back_edges = BTreeSet::new();
            let level = self.level;
            let arch = self.arch;
            let line_size = self.line_size;
            let mut simulate = |cn: ContextualNode, acs: &mut AbstractCache<PsSet>| {
                simulate_loads(prog, tree, arch, level, line_size, cn, acs)
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
        self.classify(program, reachable, Lattice::Persistence);
    }

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
            let arch = self.arch;
            let line_size = self.line_size;
            let mut simulate = |cn: ContextualNode, acs: &mut AbstractCache<MaySet>| {
                simulate_loads(prog, tree, arch, level, line_size, cn, acs)
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
        self.classify(program, reachable, Lattice::May);
        Ok(())
    }

    // CLASSIFICATION
    // --------------------------------------------------------------------------------------------

    /// One classification walk, shared by the three lattices: simulate the node's loads on
    /// the pre-state and stamp the classification the lattice proves. Consumes the states.
    fn classify(&mut self, program: &mut Program, reachable: &[NodeRef], lattice: Lattice) {
        let chmc_name = names::chmc_data(self.level);
        let cac_name = names::cac_data(self.level);

        for (cn, node_ref) in contextual_nodes(program, reachable) {
            let mut must = None;
            let mut ps = None;
            let mut may = None;
            match lattice {
                Lattice::Must => match self.must.ins.remove(&cn) {
                    Some(acs) => {
                        self.must.outs.remove(&cn);
                        must = Some(acs);
                    },
                    None => continue,
                },
                Lattice::Persistence => match self.ps.ins.remove(&cn) {
                    Some(acs) => {
                        self.ps.outs.remove(&cn);
                        ps = Some(acs);
                    },
                    None => continue,
                },
                Lattice::May => match self.may.ins.remove(&cn) {
                    Some(acs) => {
                        self.may.outs.remove(&cn);
                        may = Some(acs);
                    },
                    None => continue,
                },
            }

            let mut writes = Vec::new();
            {
                let node = program.cfg(node_ref.cfg).node(node_ref.node);
                for (index, instr) in node.instructions().iter().enumerate() {
                    if !self.arch.is_load(instr.code()) {
                        continue;
                    }
                    // Must classifies first; later lattices respect earlier verdicts.
                    if lattice != Lattice::Must
                        && instr.attrs().str_in_ctx(&chmc_name, cn.ctx).is_some()
                    {
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
                    let blocks = self.data_blocks(instr, cn.ctx);
                    if blocks.is_empty() {
                        continue;
                    }
                    match lattice {
                        Lattice::Must => {
                            let acs = must.as_mut().expect("state taken above");
                            if acs.all_present(&blocks) {
                                writes.push((index, Chmc::AlwaysHit));
                            }
                            acs.update_blocks(&blocks, cac);
                        },
                        Lattice::Persistence => {
                            let acs = ps.as_mut().expect("state taken above");
                            if acs.all_present(&blocks) {
                                writes.push((index, Chmc::FirstMiss));
                            }
                            acs.update_blocks(&blocks, cac);
                        },
                        Lattice::May => {
                            let acs = may.as_mut().expect("state taken above");
                            if !acs.one_present(&blocks) {
                                writes.push((index, Chmc::AlwaysMiss));
                            }
                            acs.update_blocks(&blocks, cac);
                        },
                    }
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

    /// Stamps NC (or AH for a perfect cache) on unclassified loads, AU on every non-load,
    /// attaches the per-load block counts, and derives the next-level access classification.
    fn finish_classification(
        &self,
        program: &mut Program,
        reachable: &[NodeRef],
    ) -> Result<(), AnalysisError> {
        let fallback = if self.perfect { Chmc::AlwaysHit } else { Chmc::NotClassified };
        let chmc_name = names::chmc_data(self.level);
        let cac_name = names::cac_data(self.level);
        let next_cac_name = names::cac_data(self.level + 1);
        let count_name = names::data_block_count(self.level);

        for (cn, node_ref) in contextual_nodes(program, reachable) {
            let mut counts = Vec::new();
            {
                let node = program.cfg(node_ref.cfg).node(node_ref.node);
                for (index, instr) in node.instructions().iter().enumerate() {
                    if self.arch.is_load(instr.code()) {
                        counts.push((index, self.data_blocks(instr, cn.ctx).len() as i64));
                    }
                }
            }

            let node = program.cfg_mut(node_ref.cfg).node_mut(node_ref.node);
            for instr in node.instructions_mut() {
                let is_load = self.arch.is_load(instr.code());
                if !is_load {
                    instr.attrs_mut().set_in_ctx(
                        &chmc_name,
                        cn.ctx,
                        AttrValue::Str(Chmc::AlwaysUnused.as_str().into()),
                    );
                    continue;
                }
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
                instr.attrs_mut().set_in_ctx(
                    &next_cac_name,
                    cn.ctx,
                    AttrValue::Str(next_level_cac(chmc, cac).as_str().into()),
                );
            }
            for (index, count) in counts {
                node.instructions_mut()[index].attrs_mut().set_in_ctx(
                    &count_name,
                    cn.ctx,
                    AttrValue::Int(count),
                );
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lattice {
    Must,
    Persistence,
    May,
}

// ANALYSIS CONTRACT
// ================================================================================================

impl Analysis for DCacheAnalysis {
    fn name(&self) -> &'static str {
        PASS
    }

    fn check_input_attributes(&mut self, program: &Program) -> Result<(), AnalysisError> {
        if program.contexts().is_none() {
            return Err(AnalysisError::input(PASS, "contexts are not computed"));
        }
        let cac_name = names::cac_data(self.level);
        for node_ref in reachable_nodes(program) {
            let cfg = program.cfg(node_ref.cfg);
            for &ctx in cfg.context_list() {
                for instr in cfg.node(node_ref.node).instructions() {
                    let is_load = self.arch.is_load(instr.code());
                    if self.level > 1
                        && is_load
                        && instr.attrs().str_in_ctx(&cac_name, ctx).is_none()
                    {
                        return Err(AnalysisError::input(
                            PASS,
                            format!("loads should have the {cac_name} attribute set"),
                        ));
                    }
                    if (is_load || self.arch.is_store(instr.code()))
                        && data_blocks(instr, ctx, self.line_size).is_empty()
                    {
                        return Err(AnalysisError::input(
                            PASS,
                            format!(
                                "memory access '{}' has no data address information",
                                instr.code()
                            ),
                        ));
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
            self.seed_level_one_cac(program, &reachable);
        }

        if self.apply_must {
            self.must_analysis(program, &tree, &call_graph, &reachable);
            tracing::info!(level = self.level, "data cache Must analysis done");
        }
        if self.apply_persistence {
            self.ps_analysis(program, &tree, &call_graph, &reachable);
            tracing::info!(level = self.level, "data cache persistence analysis done");
        }
        if self.apply_may {
            self.may_analysis(program, &tree, &reachable)?;
            tracing::info!(level = self.level, "data cache May analysis done");
        }

        self.finish_classification(program, &reachable)
    }

    fn remove_private_attributes(&mut self, _program: &mut Program) {
        self.must.clear();
        self.ps.clear();
        self.may.clear();
    }
}

impl DCacheAnalysis {
    /// Every load always reaches the first data cache level.
    fn seed_level_one_cac(&self, program: &mut Program, reachable: &[NodeRef]) {
        let cac_name = names::cac_data(1);
        for &node_ref in reachable {
            let contexts = program.cfg(node_ref.cfg).context_list().to_vec();
            let node = program.cfg_mut(node_ref.cfg).node_mut(node_ref.node);
            for instr in node.instructions_mut() {
                if !self.arch.is_load(instr.code()) {
                    continue;
                }
                for &ctx in &contexts {
                    instr.attrs_mut().set_in_ctx(&cac_name, ctx, AttrValue::Str("A".into()));
                }
            }
        }
    }
}

// SHARED HELPERS
// ================================================================================================

/// Candidate cache-line blocks of one memory access in one context.
fn data_blocks(instr: &Instruction, ctx: ContextId, line_size: u32) -> BTreeSet<BlockAddr> {
    let line = line_size as u64;
    let infos = instr
        .attrs()
        .get_in_ctx(names::ADDRESS, ctx)
        .or_else(|| instr.attrs().get_plain(names::ADDRESS))
        .and_then(AttrValue::as_address)
        .unwrap_or(&[]);

    let mut blocks = BTreeSet::new();
    for info in infos {
        if info.segment == "code" {
            continue;
        }
        for range in &info.ranges {
            if range.size == 0 {
                continue;
            }
            let first = range.start - range.start % line;
            let last_byte = range.start + range.size - 1;
            let last = last_byte - last_byte % line;
            let mut block = first;
            while block <= last {
                blocks.insert(block);
                block += line;
            }
        }
    }
    blocks
}

/// Simulates the loads of one node on `acs` with set-valued updates.
fn simulate_loads<S: CacheSet>(
    program: &Program,
    tree: &ContextTree,
    arch: Arch,
    level: u32,
    line_size: u32,
    cn: ContextualNode,
    acs: &mut AbstractCache<S>,
) {
    let cac_name = names::cac_data(level);
    let cfg = program.cfg(cn.cfg(tree));
    for instr in cfg.node(cn.node).instructions() {
        if !arch.is_load(instr.code()) {
            continue;
        }
        let cac = instr
            .attrs()
            .str_in_ctx(&cac_name, cn.ctx)
            .and_then(Cac::from_str)
            .unwrap_or(Cac::Never);
        if cac == Cac::Never {
            continue;
        }
        let blocks = data_blocks(instr, cn.ctx, line_size);
        if !blocks.is_empty() {
            acs.update_blocks(&blocks, cac);
        }
    }
}

// TESTS
// ================================================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheKind;
    use tempo_core::arch::Target;
    use tempo_core::attributes::{AddressInfo, AddressRange};
    use tempo_core::cfg::{Cfg, Node};
    use tempo_core::context::compute_contexts;
    use tempo_core::{CfgId, NodeId};

    fn dcache(sets: u32, ways: u32, line: u32) -> CacheConfig {
        CacheConfig {
            kind: CacheKind::Data,
            level: 1,
            sets,
            ways,
            line_size: line,
            policy: ReplacementPolicy::Lru,
            latency: 1,
        }
    }

    fn mips() -> Arch {
        Arch::new(Target::Mips, true)
    }

    /// A load at `code_addr` reading `[data_start, data_start + size)`.
    fn load(code_addr: u64, data_start: u64, size: u64) -> Instruction {
        let mut i = Instruction::new("lw $2, 0($3)");
        i.attrs_mut().set_plain(
            names::ADDRESS,
            AttrValue::Address(vec![
                AddressInfo {
                    segment: "code".into(),
                    ranges: vec![AddressRange::new(code_addr, 4)],
                },
                AddressInfo {
                    segment: "data".into(),
                    ranges: vec![AddressRange::new(data_start, size)],
                },
            ]),
        );
        i
    }

    fn alu(code_addr: u64) -> Instruction {
        let mut i = Instruction::new("addu $2, $3, $4");
        i.set_address(code_addr);
        i
    }

    fn single_block_program(instructions: Vec<Instruction>) -> Program {
        let mut program = Program::new("test");
        let mut cfg = Cfg::new("main");
        cfg.add_node(Node::basic(instructions));
        cfg.finalize();
        program.add_cfg(cfg);
        program.set_entry_point("main").unwrap();
        compute_contexts(&mut program).unwrap();
        program
    }

    fn run(program: &mut Program, cache: &CacheConfig) {
        let mut pass = DCacheAnalysis::new(mips(), cache, true, true, true).unwrap();
        pass.check_input_attributes(program).unwrap();
        pass.perform(program).unwrap();
        pass.remove_private_attributes(program);
    }

    fn data_chmc(program: &Program, instr_index: usize) -> String {
        let root = program.contexts().unwrap().root();
        program.cfg(CfgId::new(0)).node(NodeId::new(0)).instructions()[instr_index]
            .attrs()
            .str_in_ctx(&names::chmc_data(1), root)
            .unwrap()
            .to_string()
    }

    #[test]
    fn repeated_precise_load_hits() {
        let mut program =
            single_block_program(vec![load(0x100, 0x8000, 4), load(0x104, 0x8000, 4)]);
        run(&mut program, &dcache(4, 2, 32));

        // Second load of the same line is proven present by the Must analysis.
        assert_eq!(data_chmc(&program, 0), "AM");
        assert_eq!(data_chmc(&program, 1), "AH");
    }

    #[test]
    fn non_load_instructions_are_always_unused() {
        let mut program = single_block_program(vec![alu(0x100), load(0x104, 0x8000, 4)]);
        run(&mut program, &dcache(4, 2, 32));
        assert_eq!(data_chmc(&program, 0), "AU");
    }

    #[test]
    fn imprecise_load_cannot_hit_but_gets_block_count() {
        // A load that may touch 4 different lines, followed by a reload of the same range.
        let mut program =
            single_block_program(vec![load(0x100, 0x8000, 128), load(0x104, 0x8000, 128)]);
        run(&mut program, &dcache(4, 2, 32));

        // The reload cannot be a proven hit: each access touches one unknown block.
        assert_eq!(data_chmc(&program, 0), "AM");
        assert_eq!(data_chmc(&program, 1), "NC");

        let root = program.contexts().unwrap().root();
        let count = program.cfg(CfgId::new(0)).node(NodeId::new(0)).instructions()[0]
            .attrs()
            .int_in_ctx(&names::data_block_count(1), root)
            .unwrap();
        assert_eq!(count, 4);
    }

    #[test]
    fn non_lru_policy_is_rejected() {
        let cache = CacheConfig { policy: ReplacementPolicy::Fifo, ..dcache(4, 2, 32) };
        assert!(DCacheAnalysis::new(mips(), &cache, true, false, false).is_err());
    }

    #[test]
    fn memory_access_without_ranges_is_rejected() {
        let mut bad = Instruction::new("lw $2, 0($3)");
        bad.set_address(0x100);
        let program = single_block_program(vec![bad]);
        let mut pass = DCacheAnalysis::new(mips(), &dcache(4, 2, 32), true, false, false).unwrap();
        assert!(pass.check_input_attributes(&program).is_err());
    }
}
