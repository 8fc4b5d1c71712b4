//! Architecture description shared by all passes: cache hierarchy, memory latencies and the
//! target instruction set.

use tempo_core::arch::Arch;

// REPLACEMENT POLICY
// ================================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplacementPolicy {
    Lru,
    Plru,
    Mru,
    Fifo,
    Random,
}

impl ReplacementPolicy {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "LRU" => Some(Self::Lru),
            "PLRU" => Some(Self::Plru),
            "MRU" => Some(Self::Mru),
            "FIFO" => Some(Self::Fifo),
            "RANDOM" => Some(Self::Random),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Lru => "LRU",
            Self::Plru => "PLRU",
            Self::Mru => "MRU",
            Self::Fifo => "FIFO",
            Self::Random => "RANDOM",
        }
    }
}

// CACHE CONFIG
// ================================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheKind {
    Instruction,
    Data,
    PerfectInstruction,
    PerfectData,
}

impl CacheKind {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "icache" => Some(Self::Instruction),
            "dcache" => Some(Self::Data),
            "picache" => Some(Self::PerfectInstruction),
            "pdcache" => Some(Self::PerfectData),
            _ => None,
        }
    }

    pub fn is_instruction_side(&self) -> bool {
        matches!(self, Self::Instruction | Self::PerfectInstruction)
    }

    pub fn is_perfect(&self) -> bool {
        matches!(self, Self::PerfectInstruction | Self::PerfectData)
    }
}

/// One cache level of the memory hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfig {
    pub kind: CacheKind,
    pub level: u32,
    pub sets: u32,
    pub ways: u32,
    pub line_size: u32,
    pub policy: ReplacementPolicy,
    pub latency: u32,
}

// MEMORY CONFIG
// ================================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryConfig {
    pub load_latency: u32,
    pub store_latency: u32,
}

// ARCHITECTURE CONFIG
// ================================================================================================

/// Validated architecture description: the target, every configured cache, and the main
/// memory latencies.
#[derive(Debug, Clone)]
pub struct ArchitectureConfig {
    pub arch: Arch,
    pub caches: Vec<CacheConfig>,
    pub memory: MemoryConfig,
}

#[derive(Debug, thiserror::Error)]
pub enum ArchitectureError {
    #[error("picache/icache directives are incompatible (level {0})")]
    PerfectAndRealInstructionCache(u32),
    #[error("pdcache/dcache directives are incompatible (level {0})")]
    PerfectAndRealDataCache(u32),
    #[error("at most one perfect {0} directive is allowed")]
    DuplicatePerfectCache(&'static str),
    #[error("duplicate cache directive for {kind} level {level}")]
    DuplicateLevel { kind: &'static str, level: u32 },
    #[error("cache levels must cover 1..{expected} contiguously")]
    NonContiguousLevels { expected: u32 },
    #[error("instruction and data cache hierarchies must have the same number of levels")]
    MismatchedLevelCounts,
}

impl ArchitectureConfig {
    /// Validates the cache directives: perfect and real caches of one side are exclusive,
    /// perfect caches live at level 1, and the real levels of both sides cover `1..=N`
    /// contiguously with matching depth.
    pub fn validate(&mut self) -> Result<(), ArchitectureError> {
        let mut has_perfect_icache = false;
        let mut has_perfect_dcache = false;
        for cache in &mut self.caches {
            match cache.kind {
                CacheKind::PerfectInstruction => {
                    if has_perfect_icache {
                        return Err(ArchitectureError::DuplicatePerfectCache("picache"));
                    }
                    has_perfect_icache = true;
                    if cache.level != 1 {
                        tracing::warn!("perfect instruction cache level forced to 1");
                        cache.level = 1;
                    }
                },
                CacheKind::PerfectData => {
                    if has_perfect_dcache {
                        return Err(ArchitectureError::DuplicatePerfectCache("pdcache"));
                    }
                    has_perfect_dcache = true;
                    if cache.level != 1 {
                        tracing::warn!("perfect data cache level forced to 1");
                        cache.level = 1;
                    }
                },
                CacheKind::Instruction | CacheKind::Data => {},
            }
        }

        let icache_levels = self.side_levels(true)?;
        let dcache_levels = self.side_levels(false)?;
        if has_perfect_icache && !icache_levels.is_empty() {
            return Err(ArchitectureError::PerfectAndRealInstructionCache(icache_levels[0]));
        }
        if has_perfect_dcache && !dcache_levels.is_empty() {
            return Err(ArchitectureError::PerfectAndRealDataCache(dcache_levels[0]));
        }
        if !has_perfect_icache && !has_perfect_dcache && icache_levels.len() != dcache_levels.len()
        {
            return Err(ArchitectureError::MismatchedLevelCounts);
        }
        Ok(())
    }

    fn side_levels(&self, instruction: bool) -> Result<Vec<u32>, ArchitectureError> {
        let kind = if instruction { CacheKind::Instruction } else { CacheKind::Data };
        let mut levels: Vec<u32> =
            self.caches.iter().filter(|c| c.kind == kind).map(|c| c.level).collect();
        levels.sort_unstable();
        for pair in levels.windows(2) {
            if pair[0] == pair[1] {
                return Err(ArchitectureError::DuplicateLevel {
                    kind: if instruction { "icache" } else { "dcache" },
                    level: pair[0],
                });
            }
        }
        if let Some(&max) = levels.last() {
            if levels.len() as u32 != max || levels[0] != 1 {
                return Err(ArchitectureError::NonContiguousLevels { expected: max });
            }
        }
        Ok(levels)
    }

    /// The cache configured for `kind`'s side at `level` (perfect caches live at level 1).
    pub fn cache_at(&self, instruction: bool, level: u32) -> Option<&CacheConfig> {
        self.caches
            .iter()
            .find(|c| c.kind.is_instruction_side() == instruction && c.level == level)
    }

    /// Number of instruction-side cache levels (a perfect cache counts as one level).
    pub fn num_icache_levels(&self) -> u32 {
        self.caches
            .iter()
            .filter(|c| c.kind.is_instruction_side())
            .map(|c| c.level)
            .max()
            .unwrap_or(0)
    }

    pub fn num_dcache_levels(&self) -> u32 {
        self.caches
            .iter()
            .filter(|c| !c.kind.is_instruction_side())
            .map(|c| c.level)
            .max()
            .unwrap_or(0)
    }

    pub fn has_perfect_icache(&self) -> bool {
        self.caches.iter().any(|c| c.kind == CacheKind::PerfectInstruction)
    }

    pub fn has_perfect_dcache(&self) -> bool {
        self.caches.iter().any(|c| c.kind == CacheKind::PerfectData)
    }

    pub fn icache_latency(&self, level: u32) -> u32 {
        self.cache_at(true, level).map(|c| c.latency).unwrap_or(0)
    }

    pub fn dcache_latency(&self, level: u32) -> u32 {
        self.cache_at(false, level).map(|c| c.latency).unwrap_or(0)
    }
}

// TESTS
// ================================================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempo_core::arch::Target;

    fn cache(kind: CacheKind, level: u32) -> CacheConfig {
        CacheConfig {
            kind,
            level,
            sets: 64,
            ways: 4,
            line_size: 32,
            policy: ReplacementPolicy::Lru,
            latency: 1,
        }
    }

    fn config(caches: Vec<CacheConfig>) -> ArchitectureConfig {
        ArchitectureConfig {
            arch: Arch::new(Target::Mips, true),
            caches,
            memory: MemoryConfig { load_latency: 100, store_latency: 100 },
        }
    }

    #[test]
    fn matched_two_level_hierarchy_validates() {
        let mut cfg = config(vec![
            cache(CacheKind::Instruction, 1),
            cache(CacheKind::Instruction, 2),
            cache(CacheKind::Data, 1),
            cache(CacheKind::Data, 2),
        ]);
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.num_icache_levels(), 2);
        assert_eq!(cfg.num_dcache_levels(), 2);
    }

    #[test]
    fn mismatched_depths_are_rejected() {
        let mut cfg = config(vec![
            cache(CacheKind::Instruction, 1),
            cache(CacheKind::Instruction, 2),
            cache(CacheKind::Data, 1),
        ]);
        assert!(matches!(cfg.validate(), Err(ArchitectureError::MismatchedLevelCounts)));
    }

    #[test]
    fn perfect_cache_is_forced_to_level_one() {
        let mut cfg = config(vec![
            cache(CacheKind::PerfectInstruction, 2),
            cache(CacheKind::Data, 1),
        ]);
        cfg.validate().unwrap();
        assert_eq!(cfg.caches[0].level, 1);
        assert!(cfg.has_perfect_icache());
    }

    #[test]
    fn perfect_and_real_icache_conflict() {
        let mut cfg = config(vec![
            cache(CacheKind::PerfectInstruction, 1),
            cache(CacheKind::Instruction, 1),
            cache(CacheKind::Data, 1),
        ]);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn gap_in_levels_is_rejected() {
        let mut cfg = config(vec![
            cache(CacheKind::Instruction, 1),
            cache(CacheKind::Instruction, 3),
            cache(CacheKind::Data, 1),
            cache(CacheKind::Data, 2),
        ]);
        assert!(matches!(
            cfg.validate(),
            Err(ArchitectureError::NonContiguousLevels { .. })
        ));
    }
}
