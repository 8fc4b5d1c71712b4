//! Cache analyses: abstract domain, per-level instruction and data passes.

pub mod acs;
mod dcache;
mod icache;

pub use acs::{AbstractCache, BlockAddr, CacheSet, MaySet, MustSet, PsSet};
pub use dcache::DCacheAnalysis;
pub use icache::ICacheAnalysis;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use tempo_core::context::ContextTree;
use tempo_core::walker::{
    contextual_predecessors, contextual_successors, filter_back_edge, ContextualNode,
};
use tempo_core::{CfgId, EdgeId, Program};

use crate::config::ReplacementPolicy;
use crate::AnalysisError;

// CACHE ACCESS CLASSIFICATION
// ================================================================================================

/// Whether an access reaches a given cache level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cac {
    /// The access is always performed at this level.
    Always,
    /// The access never reaches this level.
    Never,
    /// The access may or may not reach this level.
    Uncertain,
    /// The access may reach this level, but never more than once per region execution.
    UncertainNever,
}

impl Cac {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Always => "A",
            Self::Never => "N",
            Self::Uncertain => "U",
            Self::UncertainNever => "UN",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "A" => Some(Self::Always),
            "N" => Some(Self::Never),
            "U" => Some(Self::Uncertain),
            "UN" => Some(Self::UncertainNever),
            _ => None,
        }
    }
}

impl fmt::Display for Cac {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// CACHE HIT/MISS CLASSIFICATION
// ================================================================================================

/// Outcome of an access at a given cache level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Chmc {
    AlwaysHit,
    AlwaysMiss,
    FirstMiss,
    NotClassified,
    AlwaysUnused,
}

impl Chmc {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AlwaysHit => "AH",
            Self::AlwaysMiss => "AM",
            Self::FirstMiss => "FM",
            Self::NotClassified => "NC",
            Self::AlwaysUnused => "AU",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "AH" => Some(Self::AlwaysHit),
            "AM" => Some(Self::AlwaysMiss),
            "FM" => Some(Self::FirstMiss),
            "NC" => Some(Self::NotClassified),
            "AU" => Some(Self::AlwaysUnused),
            _ => None,
        }
    }

    /// True when the access misses this level on its first execution.
    pub fn misses_first(&self) -> bool {
        matches!(self, Self::FirstMiss | Self::AlwaysMiss | Self::NotClassified)
    }

    /// True when the access misses this level on subsequent executions.
    pub fn misses_next(&self) -> bool {
        matches!(self, Self::AlwaysMiss | Self::NotClassified)
    }
}

impl fmt::Display for Chmc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification of an access at the next cache level, given its outcome and classification
/// at the current one. A hit (or an unused access) never propagates; a proven miss keeps its
/// classification; a first-miss propagates at most one access per region execution.
pub fn next_level_cac(chmc: Chmc, cac: Cac) -> Cac {
    match chmc {
        Chmc::AlwaysHit | Chmc::AlwaysUnused => Cac::Never,
        Chmc::AlwaysMiss => cac,
        Chmc::FirstMiss => Cac::UncertainNever,
        Chmc::NotClassified => match cac {
            Cac::UncertainNever => Cac::UncertainNever,
            _ => Cac::Uncertain,
        },
    }
}

// ACS WIDTH NARROWING
// ================================================================================================

/// Number of ways the Must and persistence abstract states may track under `policy`, and the
/// number of ways removed by the narrowing. Only LRU keeps the full associativity.
pub(crate) fn must_ps_widths(policy: ReplacementPolicy, ways: u32) -> (u32, u32) {
    let used = match policy {
        ReplacementPolicy::Lru => ways,
        ReplacementPolicy::Plru => {
            if ways == 1 {
                1
            } else {
                ways.ilog2() + 1
            }
        },
        ReplacementPolicy::Mru => {
            if ways == 1 {
                1
            } else {
                2
            }
        },
        ReplacementPolicy::Fifo | ReplacementPolicy::Random => 1,
    };
    (used, ways - used)
}

/// Number of ways the May abstract state must track under `policy`; some policies have no
/// known May bound and are rejected.
pub(crate) fn may_width(
    pass: &'static str,
    policy: ReplacementPolicy,
    ways: u32,
) -> Result<u32, AnalysisError> {
    match policy {
        ReplacementPolicy::Lru => Ok(ways),
        ReplacementPolicy::Plru if ways <= 2 => Ok(ways),
        ReplacementPolicy::Plru => Err(AnalysisError::unsupported(
            pass,
            "the May analysis is not implemented for PLRU with more than 2 ways",
        )),
        ReplacementPolicy::Mru => Ok(2 * ways - 2),
        ReplacementPolicy::Fifo => Ok(2 * ways - 1),
        ReplacementPolicy::Random => Err(AnalysisError::unsupported(
            pass,
            "the May analysis is not implemented for the RANDOM replacement policy",
        )),
    }
}

// FIXED-POINT ENGINE
// ================================================================================================

/// Per-node abstract states of one analysis, before and after the node.
pub(crate) struct AcsMaps<S: CacheSet> {
    pub ins: BTreeMap<ContextualNode, AbstractCache<S>>,
    pub outs: BTreeMap<ContextualNode, AbstractCache<S>>,
}

impl<S: CacheSet> AcsMaps<S> {
    pub fn new() -> Self {
        Self { ins: BTreeMap::new(), outs: BTreeMap::new() }
    }

    pub fn clear(&mut self) {
        self.ins.clear();
        self.outs.clear();
    }
}

/// Propagation rule of one fixed-point run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FixpointMode {
    /// Ignore loop back-edges entirely (first Must phase).
    NoBackEdges,
    /// Follow every edge and force every node to be processed at least once.
    ForceVisit,
    /// Stay within the region that carries abstract states (persistence analysis).
    Region,
}

/// Runs a work-list fixed point over the contextual nodes, alternating between recomputing
/// post-states (`simulate` applied to the pre-state) and joining pre-states from
/// predecessors. Work sets are ordered, so the iteration is deterministic.
pub(crate) fn fixpoint<S: CacheSet>(
    program: &Program,
    tree: &ContextTree,
    maps: &mut AcsMaps<S>,
    mode: FixpointMode,
    back_edges: &BTreeSet<(CfgId, EdgeId)>,
    mut work: BTreeSet<ContextualNode>,
    simulate: &mut dyn FnMut(ContextualNode, &mut AbstractCache<S>),
) {
    let mut visited: BTreeSet<ContextualNode> = BTreeSet::new();

    while !work.is_empty() {
        // Post-state phase: simulate each node on its current pre-state.
        let mut work_in: BTreeSet<ContextualNode> = BTreeSet::new();
        for &cn in &work {
            let mut out = match maps.ins.get(&cn) {
                Some(acs) => acs.clone(),
                None => continue,
            };
            simulate(cn, &mut out);

            let changed = maps.outs.get(&cn) != Some(&out);
            if changed {
                maps.outs.insert(cn, out);
            }
            let forced = mode == FixpointMode::ForceVisit && visited.insert(cn);
            if changed || forced {
                for succ in contextual_successors(program, tree, cn) {
                    let insert = match mode {
                        FixpointMode::NoBackEdges => {
                            filter_back_edge(program, tree, succ, cn, back_edges)
                        },
                        FixpointMode::ForceVisit => true,
                        FixpointMode::Region => maps.ins.contains_key(&succ),
                    };
                    if insert {
                        work_in.insert(succ);
                    }
                }
            }
        }

        // Pre-state phase: join the post-states of the predecessors.
        work.clear();
        for &cn in &work_in {
            let mut new_in: Option<AbstractCache<S>> = None;
            for pred in contextual_predecessors(program, tree, cn) {
                let usable = match mode {
                    FixpointMode::NoBackEdges => {
                        filter_back_edge(program, tree, cn, pred, back_edges)
                    },
                    FixpointMode::ForceVisit => true,
                    FixpointMode::Region => maps.outs.contains_key(&pred),
                };
                if !usable {
                    continue;
                }
                if let Some(pred_out) = maps.outs.get(&pred) {
                    match new_in.as_mut() {
                        Some(acc) => acc.join(pred_out),
                        None => new_in = Some(pred_out.clone()),
                    }
                }
            }
            let Some(new_in) = new_in else { continue };

            let changed = maps.ins.get(&cn) != Some(&new_in);
            if changed {
                maps.ins.insert(cn, new_in);
            }
            if changed || (mode == FixpointMode::ForceVisit && !visited.contains(&cn)) {
                work.insert(cn);
            }
        }
    }
}
