//! Abstract cache states for the Must, May and persistence analyses.
//!
//! Each analysis interprets one cache set as a different lattice:
//!
//! - **Must** keeps, per age slot, the blocks whose *maximum* age is that slot; joins
//!   intersect the contents and keep the older age, so presence proves a hit.
//! - **May** keeps blocks at their *minimum* age; joins union the contents, so absence proves
//!   a miss.
//! - **Persistence** maps every block first loaded in the analyzed region to the set of
//!   blocks that entered its set since; once the conflict set reaches the associativity the
//!   block may have been evicted and moves to the evicted set.
//!
//! A whole cache is a vector of per-set states with direct-mapped set indexing. The per-set
//! states sit behind `Arc`s: joins and updates that leave a set unchanged share it between
//! program points, which keeps the fixed points affordable.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use super::Cac;

/// A memory-block address, already aligned to the cache line it occupies.
pub type BlockAddr = u64;

// CACHE SET INTERFACE
// ================================================================================================

/// One abstract cache set. Implementations are the Must/May/persistence lattices.
pub trait CacheSet: Clone + PartialEq {
    /// Simulates one access to `addr`.
    fn update(&mut self, addr: BlockAddr);

    /// Simulates one access that touches exactly one of `addrs` (a data access with an
    /// imprecise address), all mapped to this set.
    fn update_many(&mut self, addrs: &BTreeSet<BlockAddr>);

    /// Joins the state reaching over another path into `self`.
    fn join(&mut self, other: &Self);

    /// True when `addr` is certainly absent under this lattice's reading.
    fn absent(&self, addr: BlockAddr) -> bool;
}

// MUST SET
// ================================================================================================

/// Must-analysis cache set: slot `i` holds the blocks of maximum age `i`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MustSet {
    ways_used: u32,
    ways_removed: u32,
    slots: Vec<BTreeSet<BlockAddr>>,
}

impl MustSet {
    pub fn new(ways_used: u32, ways_removed: u32) -> Self {
        Self {
            ways_used,
            ways_removed,
            slots: vec![BTreeSet::new(); ways_used as usize],
        }
    }

    /// The maximum age of `addr`, or `ways_used + ways_removed` when absent. The removed
    /// count restores the true associativity for policies whose state was narrowed.
    pub fn age(&self, addr: BlockAddr) -> u32 {
        for (i, slot) in self.slots.iter().enumerate() {
            if slot.contains(&addr) {
                return i as u32;
            }
        }
        self.ways_used + self.ways_removed
    }
}

impl CacheSet for MustSet {
    fn update(&mut self, addr: BlockAddr) {
        let ways = self.ways_used as usize;
        debug_assert!(ways > 0);
        debug_assert!(self.slots[0].len() <= 1);

        if self.slots[0].contains(&addr) {
            return;
        }

        // Position of the block, or one past the last slot when absent.
        let mut pos = ways;
        for i in 1..ways {
            if self.slots[i].remove(&addr) {
                pos = i;
                break;
            }
        }

        // The evicted slot absorbs the one aging into it.
        if pos < ways {
            let merged: Vec<_> = self.slots[pos - 1].iter().copied().collect();
            self.slots[pos].extend(merged);
        }
        for i in (1..pos.min(ways)).rev() {
            self.slots[i] = std::mem::take(&mut self.slots[i - 1]);
        }
        self.slots[0].clear();
        self.slots[0].insert(addr);
    }

    fn update_many(&mut self, addrs: &BTreeSet<BlockAddr>) {
        let ways = self.ways_used as usize;
        debug_assert!(ways > 0);

        let mut max_age = 0u32;
        for addr in addrs {
            if max_age >= self.ways_used {
                break;
            }
            max_age = max_age.max(self.age(*addr));
        }
        // Every candidate already sits at the top; nothing can age.
        if max_age == 0 {
            return;
        }

        let max_age = max_age as usize;
        if max_age < ways {
            let merged: Vec<_> = self.slots[max_age - 1].iter().copied().collect();
            self.slots[max_age].extend(merged);
        }
        for i in (1..max_age.min(ways)).rev() {
            self.slots[i] = std::mem::take(&mut self.slots[i - 1]);
        }
        // The accessed block is unknown, so no block is certainly most recent.
        self.slots[0].clear();
    }

    fn join(&mut self, other: &Self) {
        debug_assert_eq!(self.ways_used, other.ways_used);
        let ways = self.ways_used as usize;
        let mut result = vec![BTreeSet::new(); ways];
        // Keep blocks present on both sides at the older of their two ages.
        for i in 0..ways {
            for &addr in &self.slots[i] {
                let other_age = other.age(addr);
                if other_age < self.ways_used {
                    result[i.max(other_age as usize)].insert(addr);
                }
            }
        }
        self.slots = result;
    }

    fn absent(&self, addr: BlockAddr) -> bool {
        self.age(addr) >= self.ways_used
    }
}

// MAY SET
// ================================================================================================

/// May-analysis cache set: slot `i` holds the blocks of minimum age `i`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaySet {
    ways_used: u32,
    slots: Vec<BTreeSet<BlockAddr>>,
}

impl MaySet {
    pub fn new(ways_used: u32) -> Self {
        Self { ways_used, slots: vec![BTreeSet::new(); ways_used as usize] }
    }

    fn position(&self, addr: BlockAddr) -> Option<usize> {
        self.slots.iter().position(|slot| slot.contains(&addr))
    }
}

impl CacheSet for MaySet {
    fn update(&mut self, addr: BlockAddr) {
        let ways = self.ways_used as usize;
        let pos = match self.position(addr) {
            Some(pos) => {
                self.slots[pos].remove(&addr);
                pos
            },
            None => ways,
        };

        if pos == 0 {
            // The block was already most recent; its age-0 peers may now be older.
            if ways > 1 && !self.slots[0].is_empty() {
                let moved: Vec<_> = self.slots[0].iter().copied().collect();
                self.slots[1].extend(moved);
            }
        } else {
            if pos < ways {
                let merged: Vec<_> = self.slots[pos - 1].iter().copied().collect();
                self.slots[pos].extend(merged);
            }
            for i in (1..pos.min(ways)).rev() {
                self.slots[i] = std::mem::take(&mut self.slots[i - 1]);
            }
        }
        self.slots[0].clear();
        self.slots[0].insert(addr);
    }

    fn update_many(&mut self, addrs: &BTreeSet<BlockAddr>) {
        // All candidates may have been touched: each re-enters at age 0, nothing else ages.
        for addr in addrs {
            if let Some(pos) = self.position(*addr) {
                self.slots[pos].remove(addr);
            }
        }
        self.slots[0].extend(addrs.iter().copied());
    }

    fn join(&mut self, other: &Self) {
        debug_assert_eq!(self.ways_used, other.ways_used);
        let ways = self.ways_used as usize;
        let mut result = vec![BTreeSet::new(); ways];
        // Union, keeping the younger of the two ages.
        for i in 0..ways {
            for &addr in &self.slots[i] {
                let age = other.position(addr).map_or(i, |o| o.min(i));
                result[age].insert(addr);
            }
            for &addr in &other.slots[i] {
                let age = self.position(addr).map_or(i, |s| s.min(i));
                result[age].insert(addr);
            }
        }
        self.slots = result;
    }

    fn absent(&self, addr: BlockAddr) -> bool {
        self.position(addr).is_none()
    }
}

// PERSISTENCE SET
// ================================================================================================

/// Persistence cache set: each live block maps to the set of blocks that entered its cache
/// set since it was first loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PsSet {
    ways_used: u32,
    ways_removed: u32,
    conflicts: BTreeMap<BlockAddr, BTreeSet<BlockAddr>>,
    evicted: BTreeSet<BlockAddr>,
}

impl PsSet {
    pub fn new(ways_used: u32, ways_removed: u32) -> Self {
        Self {
            ways_used,
            ways_removed,
            conflicts: BTreeMap::new(),
            evicted: BTreeSet::new(),
        }
    }

    /// The age of `addr` (its conflict count plus the removed ways), or `ways_used` when it
    /// is not live.
    pub fn age(&self, addr: BlockAddr) -> u32 {
        match self.conflicts.get(&addr) {
            Some(set) => set.len() as u32 + self.ways_removed,
            None => self.ways_used,
        }
    }
}

impl CacheSet for PsSet {
    fn update(&mut self, addr: BlockAddr) {
        let ways = self.ways_used as usize;
        let mut to_evict = Vec::new();
        for (block, conflicts) in self.conflicts.iter_mut() {
            conflicts.insert(addr);
            if conflicts.len() == ways {
                to_evict.push(*block);
            }
        }
        for block in to_evict {
            self.conflicts.remove(&block);
            self.evicted.insert(block);
        }
        self.conflicts.insert(addr, BTreeSet::new());
        self.evicted.remove(&addr);
    }

    fn update_many(&mut self, addrs: &BTreeSet<BlockAddr>) {
        let ways = self.ways_used as usize;
        let mut absent: BTreeSet<BlockAddr> = addrs.clone();
        let mut to_evict = Vec::new();

        // Every candidate conflicts with every block already live.
        for (block, conflicts) in self.conflicts.iter_mut() {
            conflicts.extend(addrs.iter().copied());
            if addrs.contains(block) {
                conflicts.remove(block);
                absent.remove(block);
            }
            if conflicts.len() >= ways {
                to_evict.push(*block);
            }
        }

        // Candidates known to be evicted are not (re)inserted as live.
        for block in &self.evicted {
            absent.remove(block);
        }

        for block in absent {
            let mut conflicts: BTreeSet<BlockAddr> = addrs.clone();
            conflicts.remove(&block);
            if conflicts.len() >= ways {
                to_evict.push(block);
            } else {
                self.conflicts.insert(block, conflicts);
            }
        }

        for block in to_evict {
            self.conflicts.remove(&block);
            self.evicted.insert(block);
        }
    }

    fn join(&mut self, other: &Self) {
        debug_assert_eq!(self.ways_used, other.ways_used);
        let ways = self.ways_used as usize;

        for (block, other_conflicts) in &other.conflicts {
            if self.evicted.contains(block) {
                continue;
            }
            let conflicts = self.conflicts.entry(*block).or_default();
            conflicts.extend(other_conflicts.iter().copied());
            if conflicts.len() >= ways {
                self.conflicts.remove(block);
                self.evicted.insert(*block);
            }
        }
        for block in &other.evicted {
            self.conflicts.remove(block);
        }
        self.evicted.extend(other.evicted.iter().copied());
    }

    fn absent(&self, addr: BlockAddr) -> bool {
        !self.conflicts.contains_key(&addr)
    }
}

// ABSTRACT CACHE
// ================================================================================================

/// A whole abstract cache: `sets` per-set states with direct-mapped indexing on
/// `(addr / line_size) mod sets`.
#[derive(Debug, Clone, PartialEq)]
pub struct AbstractCache<S: CacheSet> {
    sets: Vec<Arc<S>>,
    num_sets: u32,
    line_size: u32,
}

impl<S: CacheSet> AbstractCache<S> {
    pub fn new(num_sets: u32, line_size: u32, empty_set: S) -> Self {
        let shared = Arc::new(empty_set);
        Self {
            sets: vec![shared; num_sets as usize],
            num_sets,
            line_size,
        }
    }

    fn line_of(&self, addr: u64) -> BlockAddr {
        addr - (addr % self.line_size as u64)
    }

    fn set_index(&self, line: BlockAddr) -> usize {
        ((line / self.line_size as u64) % self.num_sets as u64) as usize
    }

    pub fn present(&self, addr: u64) -> bool {
        !self.absent(addr)
    }

    pub fn absent(&self, addr: u64) -> bool {
        let line = self.line_of(addr);
        self.sets[self.set_index(line)].absent(line)
    }

    /// True when every block of `blocks` is present.
    pub fn all_present(&self, blocks: &BTreeSet<BlockAddr>) -> bool {
        blocks.iter().all(|b| self.present(*b))
    }

    /// True when at least one block of `blocks` is present.
    pub fn one_present(&self, blocks: &BTreeSet<BlockAddr>) -> bool {
        blocks.iter().any(|b| self.present(*b))
    }

    pub fn join(&mut self, other: &Self) {
        debug_assert_eq!(self.num_sets, other.num_sets);
        for (mine, theirs) in self.sets.iter_mut().zip(&other.sets) {
            if Arc::ptr_eq(mine, theirs) || **mine == **theirs {
                continue;
            }
            Arc::make_mut(mine).join(theirs);
        }
    }

    /// Simulates one access to `addr` under access classification `cac`. Uncertain accesses
    /// weak-update: the post state is joined with the pre state.
    pub fn update(&mut self, addr: u64, cac: Cac) {
        match cac {
            Cac::Never => {},
            Cac::Always => {
                let line = self.line_of(addr);
                let index = self.set_index(line);
                Arc::make_mut(&mut self.sets[index]).update(line);
            },
            Cac::Uncertain | Cac::UncertainNever => {
                let line = self.line_of(addr);
                let index = self.set_index(line);
                let before = self.sets[index].clone();
                let set = Arc::make_mut(&mut self.sets[index]);
                set.update(line);
                set.join(&before);
            },
        }
    }

    /// Simulates one data access that touches exactly one block of `blocks` (already
    /// line-aligned). Blocks are grouped per cache set; a single-block access degrades to
    /// [`AbstractCache::update`].
    pub fn update_blocks(&mut self, blocks: &BTreeSet<BlockAddr>, cac: Cac) {
        if cac == Cac::Never || blocks.is_empty() {
            return;
        }

        let mut per_set: BTreeMap<usize, BTreeSet<BlockAddr>> = BTreeMap::new();
        for &block in blocks {
            let line = self.line_of(block);
            per_set.entry(self.set_index(line)).or_default().insert(line);
        }

        if per_set.len() == 1 {
            let (index, lines) = per_set.into_iter().next().expect("one entry");
            if lines.len() == 1 {
                let line = *lines.iter().next().expect("one line");
                self.update(line, cac);
            } else {
                Arc::make_mut(&mut self.sets[index]).update_many(&lines);
            }
        } else {
            // The access resolves to several sets; each one may or may not be touched, which
            // is exactly what the set-valued update models.
            for (index, lines) in per_set {
                Arc::make_mut(&mut self.sets[index]).update_many(&lines);
            }
        }
    }
}

impl AbstractCache<MustSet> {
    /// Maximum age over `blocks`, as used by the data-cache Must classification.
    pub fn max_age(&self, blocks: &BTreeSet<BlockAddr>) -> u32 {
        let mut max_age = 0;
        for &block in blocks {
            let line = self.line_of(block);
            max_age = max_age.max(self.sets[self.set_index(line)].age(line));
        }
        max_age
    }

    pub fn age(&self, addr: u64) -> u32 {
        let line = self.line_of(addr);
        self.sets[self.set_index(line)].age(line)
    }
}

impl AbstractCache<PsSet> {
    pub fn age(&self, addr: u64) -> u32 {
        let line = self.line_of(addr);
        self.sets[self.set_index(line)].age(line)
    }
}

// TESTS
// ================================================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(addrs: &[u64]) -> BTreeSet<BlockAddr> {
        addrs.iter().copied().collect()
    }

    // MUST
    // --------------------------------------------------------------------------------------------

    #[test]
    fn must_update_ages_blocks() {
        let mut set = MustSet::new(2, 0);
        set.update(0x00);
        assert_eq!(set.age(0x00), 0);
        set.update(0x40);
        assert_eq!(set.age(0x40), 0);
        assert_eq!(set.age(0x00), 1);
        set.update(0x80);
        assert!(set.absent(0x00));
        assert_eq!(set.age(0x40), 1);
    }

    #[test]
    fn must_update_is_idempotent_at_top() {
        let mut set = MustSet::new(4, 0);
        set.update(0x00);
        let snapshot = set.clone();
        set.update(0x00);
        assert_eq!(set, snapshot);
    }

    #[test]
    fn must_join_keeps_older_age_of_common_blocks() {
        let mut a = MustSet::new(2, 0);
        a.update(0x00);
        a.update(0x40); // a: age(0x40)=0, age(0x00)=1

        let mut b = MustSet::new(2, 0);
        b.update(0x40);
        b.update(0x80); // b: age(0x80)=0, age(0x40)=1

        a.join(&b);
        // Only 0x40 is present on both paths, at its older age.
        assert_eq!(a.age(0x40), 1);
        assert!(a.absent(0x00));
        assert!(a.absent(0x80));
    }

    #[test]
    fn must_set_valued_update_clears_mru() {
        let mut set = MustSet::new(2, 0);
        set.update(0x00);
        set.update_many(&lines(&[0x40, 0x80]));
        // 0x00 aged by the unknown access; the top slot holds nothing for certain.
        assert_eq!(set.age(0x00), 1);
        assert!(set.absent(0x40));
        assert!(set.absent(0x80));
    }

    #[test]
    fn must_narrowed_set_reports_full_age_when_absent() {
        let set = MustSet::new(2, 6); // e.g. FIFO with 8 ways... narrowed state
        assert_eq!(set.age(0x00), 8);
    }

    // MAY
    // --------------------------------------------------------------------------------------------

    #[test]
    fn may_join_is_union_with_younger_age() {
        let mut a = MaySet::new(2);
        a.update(0x00);

        let mut b = MaySet::new(2);
        b.update(0x00);
        b.update(0x40); // b: 0x40 at 0, 0x00 at 1

        a.join(&b);
        assert!(!a.absent(0x00));
        assert!(!a.absent(0x40));
        // 0x00 is younger in a.
        assert_eq!(a.position(0x00), Some(0));
    }

    #[test]
    fn may_set_valued_update_inserts_all_at_zero() {
        let mut set = MaySet::new(2);
        set.update(0x00);
        set.update_many(&lines(&[0x40, 0x80]));
        assert_eq!(set.position(0x40), Some(0));
        assert_eq!(set.position(0x80), Some(0));
        assert_eq!(set.position(0x00), Some(0));
    }

    // PS
    // --------------------------------------------------------------------------------------------

    #[test]
    fn ps_evicts_after_enough_conflicts() {
        let mut set = PsSet::new(2, 0);
        set.update(0x00);
        set.update(0x40);
        assert!(!set.absent(0x00)); // one conflict, still live
        set.update(0x80);
        assert!(set.absent(0x00)); // two conflicts with 2 ways: may be evicted
        assert!(!set.absent(0x80));
    }

    #[test]
    fn ps_join_unions_conflicts() {
        let mut a = PsSet::new(3, 0);
        a.update(0x00);
        a.update(0x40);

        let mut b = PsSet::new(3, 0);
        b.update(0x00);
        b.update(0x80);

        a.join(&b);
        // 0x00 now conflicts with both 0x40 and 0x80; with 3 ways it stays live.
        assert!(!a.absent(0x00));
        assert_eq!(a.age(0x00), 2);
    }

    #[test]
    fn ps_reload_revives_evicted_block() {
        let mut set = PsSet::new(1, 0);
        set.update(0x00);
        set.update(0x40); // evicts 0x00
        assert!(set.absent(0x00));
        set.update(0x00);
        assert!(!set.absent(0x00));
    }

    // WHOLE CACHE
    // --------------------------------------------------------------------------------------------

    fn must_cache(sets: u32, ways: u32, line: u32) -> AbstractCache<MustSet> {
        AbstractCache::new(sets, line, MustSet::new(ways, 0))
    }

    #[test]
    fn direct_mapping_separates_sets() {
        let mut cache = must_cache(2, 1, 32);
        cache.update(0x00, Cac::Always);
        cache.update(0x20, Cac::Always); // maps to set 1
        assert!(cache.present(0x00));
        assert!(cache.present(0x20));
        assert!(cache.present(0x04)); // same line as 0x00
    }

    #[test]
    fn never_access_is_a_no_op() {
        let mut cache = must_cache(1, 1, 32);
        cache.update(0x00, Cac::Always);
        let snapshot = cache.clone();
        cache.update(0x40, Cac::Never);
        assert_eq!(cache, snapshot);
    }

    #[test]
    fn uncertain_access_weak_updates() {
        let mut cache = must_cache(1, 1, 32);
        cache.update(0x00, Cac::Always);
        // An uncertain access cannot prove 0x40 present, and it may evict 0x00.
        cache.update(0x40, Cac::Uncertain);
        assert!(cache.absent(0x00));
        assert!(cache.absent(0x40));
    }

    #[test]
    fn multi_set_data_access_updates_each_set_weakly() {
        let mut cache = must_cache(2, 2, 32);
        cache.update(0x00, Cac::Always);
        cache.update_blocks(&lines(&[0x40, 0x20]), Cac::Always);
        // 0x40 maps to set 0 and may not have been the accessed block: 0x00 ages.
        assert_eq!(cache.age(0x00), 1);
        assert!(cache.absent(0x40));
        assert!(cache.absent(0x20));
    }

    // LATTICE PROPERTIES
    // --------------------------------------------------------------------------------------------

    proptest::proptest! {
        /// A smaller (more defined) Must input can only make the output smaller: joining the
        /// input with more paths never grows the set of provably-present blocks.
        #[test]
        fn must_update_is_monotone(
            accesses in proptest::collection::vec(0u64..8, 1..30),
            probe in 0u64..8,
        ) {
            let mut precise = MustSet::new(4, 0);
            for a in &accesses {
                precise.update(a * 0x20);
            }
            let mut joined = precise.clone();
            joined.join(&MustSet::new(4, 0)); // join with bottom: nothing is present

            let mut after_precise = precise.clone();
            after_precise.update(probe * 0x20);
            let mut after_joined = joined.clone();
            after_joined.update(probe * 0x20);

            // Every block present after the joined (weaker) input is present after the
            // precise one.
            for addr in (0u64..8).map(|a| a * 0x20) {
                if !after_joined.absent(addr) {
                    proptest::prop_assert!(!after_precise.absent(addr));
                }
            }
        }

        /// Joining is conservative for May: anything present on either side stays present.
        #[test]
        fn may_join_preserves_presence(
            left in proptest::collection::vec(0u64..8, 0..10),
            right in proptest::collection::vec(0u64..8, 0..10),
        ) {
            let mut a = MaySet::new(4);
            for x in &left {
                a.update(x * 0x20);
            }
            let mut b = MaySet::new(4);
            for x in &right {
                b.update(x * 0x20);
            }
            let mut joined = a.clone();
            joined.join(&b);
            for addr in (0u64..8).map(|x| x * 0x20) {
                if !a.absent(addr) || !b.absent(addr) {
                    proptest::prop_assert!(!joined.absent(addr));
                }
            }
        }
    }
}
