//! Fixed-size bitsets for regroup passes
//!
//! [`DocBitSet`] marks documents (remapped-in-this-pass flags, regroup
//! selections). [`GroupsSeen`] tracks which groups a term touched so the
//! stream can emit them in ascending order and reset only what it used.

use crate::types::{DocId, GroupId};

// ============================================================================
// DocBitSet
// ============================================================================

/// Dense bitset over `[0, len)`
///
/// One bit per id in `u64` words; sized once at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocBitSet {
    words: Vec<u64>,
    len: usize,
}

impl DocBitSet {
    /// Create an all-clear bitset of `len` bits
    pub fn new(len: usize) -> Self {
        Self {
            words: vec![0; len.div_ceil(64)],
            len,
        }
    }

    /// Build from the ids to set
    pub fn from_ids(len: usize, ids: &[DocId]) -> Self {
        let mut bits = Self::new(len);
        for &id in ids {
            bits.set(id);
        }
        bits
    }

    /// Number of addressable bits
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the bitset addresses no bits
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Set bit `id`
    #[inline]
    pub fn set(&mut self, id: DocId) {
        let id = id as usize;
        self.words[id / 64] |= 1u64 << (id % 64);
    }

    /// Clear bit `id`
    #[inline]
    pub fn clear(&mut self, id: DocId) {
        let id = id as usize;
        self.words[id / 64] &= !(1u64 << (id % 64));
    }

    /// Test bit `id`
    #[inline]
    pub fn get(&self, id: DocId) -> bool {
        let id = id as usize;
        self.words[id / 64] & (1u64 << (id % 64)) != 0
    }

    /// Clear every bit
    pub fn clear_all(&mut self) {
        self.words.fill(0);
    }

    /// Number of set bits
    pub fn cardinality(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Iterate set bits in ascending order
    pub fn iter(&self) -> impl Iterator<Item = DocId> + '_ {
        self.words
            .iter()
            .enumerate()
            .flat_map(|(word_idx, &word)| SetBits { word, base: word_idx * 64 })
    }

    /// Heap bytes held by the bitset
    pub fn memory_bytes(&self) -> usize {
        self.words.len() * 8
    }
}

struct SetBits {
    word: u64,
    base: usize,
}

impl Iterator for SetBits {
    type Item = DocId;

    fn next(&mut self) -> Option<DocId> {
        if self.word == 0 {
            return None;
        }
        let bit = self.word.trailing_zeros() as usize;
        self.word &= self.word - 1;
        Some((self.base + bit) as DocId)
    }
}

// ============================================================================
// GroupsSeen
// ============================================================================

/// Groups touched by the current term
///
/// Membership is a bitset; the touched ids are also listed so that clearing
/// and ordered iteration cost is proportional to the groups seen, not to
/// `num_groups`.
#[derive(Debug, Clone)]
pub struct GroupsSeen {
    bits: DocBitSet,
    list: Vec<GroupId>,
    sorted: bool,
}

impl GroupsSeen {
    /// Tracker for groups in `[0, num_groups)`
    pub fn new(num_groups: usize) -> Self {
        Self {
            bits: DocBitSet::new(num_groups),
            list: Vec::new(),
            sorted: true,
        }
    }

    /// Group bound this tracker was sized for
    pub fn capacity(&self) -> usize {
        self.bits.len()
    }

    /// Record a group
    #[inline]
    pub fn insert(&mut self, group: GroupId) {
        if !self.bits.get(group) {
            self.bits.set(group);
            if self.list.last().is_some_and(|&last| last > group) {
                self.sorted = false;
            }
            self.list.push(group);
        }
    }

    /// Whether `group` was recorded
    pub fn contains(&self, group: GroupId) -> bool {
        self.bits.get(group)
    }

    /// Number of distinct groups recorded
    pub fn len(&self) -> usize {
        self.list.len()
    }

    /// Whether nothing was recorded
    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    /// Recorded groups in ascending order
    pub fn sorted(&mut self) -> &[GroupId] {
        if !self.sorted {
            self.list.sort_unstable();
            self.sorted = true;
        }
        &self.list
    }

    /// Forget every recorded group
    pub fn clear(&mut self) {
        for &group in &self.list {
            self.bits.clear(group);
        }
        self.list.clear();
        self.sorted = true;
    }
}
