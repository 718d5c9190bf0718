//! Arena storage for graph nodes.
//!
//! The graph is cyclic (loops, phi back edges), so nodes cannot own each
//! other. Instead every node lives in one flat arena and edges are plain
//! integer handles:
//! - **Stable handles**: a `NodeId` stays valid for the life of the graph;
//!   deletion marks nodes dead instead of freeing slots
//! - **Cheap side tables**: [`SecondaryMap`] keys derived data off the same
//!   indices without touching the node struct
//! - **Dense sets**: [`BitSet`] for worklist dedup and reachability marks
//!
//! Handles are typed (`Id<T>`) so a block id cannot be used where a node id
//! is expected.

use std::marker::PhantomData;
use std::ops::{Index, IndexMut};

// =============================================================================
// Typed ID
// =============================================================================

/// Index of an item in an [`Arena<T>`], tagged with the item type.
///
/// Implemented manually so `Id<T>` is `Copy`/`Eq`/`Hash`/`Ord` no matter
/// what `T` is.
pub struct Id<T> {
    index: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Copy for Id<T> {}

impl<T> Clone for Id<T> {
    #[inline]
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> PartialEq for Id<T> {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index
    }
}

impl<T> Eq for Id<T> {}

impl<T> PartialOrd for Id<T> {
    #[inline]
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Id<T> {
    #[inline]
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.index.cmp(&other.index)
    }
}

impl<T> std::hash::Hash for Id<T> {
    #[inline]
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.index.hash(state);
    }
}

impl<T> Id<T> {
    #[inline]
    pub const fn new(index: u32) -> Self {
        Id {
            index,
            _marker: PhantomData,
        }
    }

    #[inline]
    pub const fn index(self) -> u32 {
        self.index
    }

    #[inline]
    pub const fn as_usize(self) -> usize {
        self.index as usize
    }

    /// Sentinel used for "no node" slots (unfilled phi inputs, unset links).
    pub const INVALID: Self = Id {
        index: u32::MAX,
        _marker: PhantomData,
    };

    #[inline]
    pub const fn is_valid(self) -> bool {
        self.index != u32::MAX
    }
}

impl<T> std::fmt::Debug for Id<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_valid() {
            write!(f, "n{}", self.index)
        } else {
            write!(f, "n<invalid>")
        }
    }
}

impl<T> std::fmt::Display for Id<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "n{}", self.index)
    }
}

impl<T> Default for Id<T> {
    fn default() -> Self {
        Self::INVALID
    }
}

// =============================================================================
// Arena
// =============================================================================

/// Flat append-only store. Items are addressed by [`Id`] and never move or
/// get freed individually; the whole arena drops at once with the graph.
#[derive(Debug, Clone)]
pub struct Arena<T> {
    items: Vec<T>,
}

impl<T> Arena<T> {
    #[inline]
    pub fn new() -> Self {
        Arena { items: Vec::new() }
    }

    #[inline]
    pub fn with_capacity(capacity: usize) -> Self {
        Arena {
            items: Vec::with_capacity(capacity),
        }
    }

    #[inline]
    pub fn alloc(&mut self, item: T) -> Id<T> {
        let index = self.items.len() as u32;
        self.items.push(item);
        Id::new(index)
    }

    #[inline]
    pub fn get(&self, id: Id<T>) -> Option<&T> {
        self.items.get(id.as_usize())
    }

    #[inline]
    pub fn get_mut(&mut self, id: Id<T>) -> Option<&mut T> {
        self.items.get_mut(id.as_usize())
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = (Id<T>, &T)> {
        self.items
            .iter()
            .enumerate()
            .map(|(i, item)| (Id::new(i as u32), item))
    }

    #[inline]
    pub fn ids(&self) -> impl Iterator<Item = Id<T>> {
        (0..self.items.len() as u32).map(Id::new)
    }

    /// Id the next `alloc` call will hand out.
    #[inline]
    pub fn next_id(&self) -> Id<T> {
        Id::new(self.items.len() as u32)
    }
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Index<Id<T>> for Arena<T> {
    type Output = T;

    #[inline]
    fn index(&self, id: Id<T>) -> &Self::Output {
        &self.items[id.as_usize()]
    }
}

impl<T> IndexMut<Id<T>> for Arena<T> {
    #[inline]
    fn index_mut(&mut self, id: Id<T>) -> &mut Self::Output {
        &mut self.items[id.as_usize()]
    }
}

// =============================================================================
// Secondary Map
// =============================================================================

/// Side table keyed by arena ids, growing on demand.
///
/// Used for data computed per node (usage lists, schedule assignments,
/// dominator numbers) that does not belong in the node itself.
#[derive(Debug, Clone)]
pub struct SecondaryMap<K, V> {
    values: Vec<V>,
    _marker: PhantomData<K>,
}

impl<K, V: Default + Clone> SecondaryMap<K, V> {
    pub fn new() -> Self {
        SecondaryMap {
            values: Vec::new(),
            _marker: PhantomData,
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        SecondaryMap {
            values: vec![V::default(); capacity],
            _marker: PhantomData,
        }
    }

    /// Grow (never shrink) to cover ids below `len`.
    pub fn resize(&mut self, len: usize) {
        if len > self.values.len() {
            self.values.resize(len, V::default());
        }
    }

    pub fn get(&self, id: Id<K>) -> Option<&V> {
        self.values.get(id.as_usize())
    }

    pub fn get_mut(&mut self, id: Id<K>) -> Option<&mut V> {
        self.values.get_mut(id.as_usize())
    }

    pub fn set(&mut self, id: Id<K>, value: V) {
        let idx = id.as_usize();
        if idx >= self.values.len() {
            self.values.resize(idx + 1, V::default());
        }
        self.values[idx] = value;
    }

    pub fn iter(&self) -> impl Iterator<Item = (Id<K>, &V)> {
        self.values
            .iter()
            .enumerate()
            .map(|(i, v)| (Id::new(i as u32), v))
    }
}

impl<K, V: Default + Clone> Default for SecondaryMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V: Default + Clone> Index<Id<K>> for SecondaryMap<K, V> {
    type Output = V;

    fn index(&self, id: Id<K>) -> &Self::Output {
        &self.values[id.as_usize()]
    }
}

impl<K, V: Default + Clone> IndexMut<Id<K>> for SecondaryMap<K, V> {
    fn index_mut(&mut self, id: Id<K>) -> &mut Self::Output {
        &mut self.values[id.as_usize()]
    }
}

// =============================================================================
// Bit Set
// =============================================================================

/// Dense bit set over arena indices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitSet {
    bits: Vec<u64>,
}

impl BitSet {
    pub fn new() -> Self {
        BitSet { bits: Vec::new() }
    }

    pub fn with_capacity(n: usize) -> Self {
        BitSet {
            bits: vec![0; n.div_ceil(64)],
        }
    }

    pub fn ensure_capacity(&mut self, n: usize) {
        let words = n.div_ceil(64);
        if words > self.bits.len() {
            self.bits.resize(words, 0);
        }
    }

    #[inline]
    pub fn insert(&mut self, index: usize) {
        self.ensure_capacity(index + 1);
        self.bits[index / 64] |= 1 << (index % 64);
    }

    #[inline]
    pub fn remove(&mut self, index: usize) {
        if index / 64 < self.bits.len() {
            self.bits[index / 64] &= !(1 << (index % 64));
        }
    }

    #[inline]
    pub fn contains(&self, index: usize) -> bool {
        match self.bits.get(index / 64) {
            Some(word) => (word & (1 << (index % 64))) != 0,
            None => false,
        }
    }

    pub fn clear(&mut self) {
        for word in &mut self.bits {
            *word = 0;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|&w| w == 0)
    }

    pub fn count(&self) -> usize {
        self.bits.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.bits.iter().enumerate().flat_map(|(word_idx, &word)| {
            (0..64).filter_map(move |bit| {
                if (word & (1 << bit)) != 0 {
                    Some(word_idx * 64 + bit)
                } else {
                    None
                }
            })
        })
    }
}

impl Default for BitSet {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    struct Item {
        tag: u32,
    }

    #[test]
    fn test_alloc_and_index() {
        let mut arena: Arena<Item> = Arena::new();
        let a = arena.alloc(Item { tag: 1 });
        let b = arena.alloc(Item { tag: 2 });

        assert_eq!(a.index(), 0);
        assert_eq!(b.index(), 1);
        assert_eq!(arena[a].tag, 1);

        arena[b].tag = 9;
        assert_eq!(arena[b].tag, 9);
        assert_eq!(arena.len(), 2);
    }

    #[test]
    fn test_next_id_matches_alloc() {
        let mut arena: Arena<Item> = Arena::new();
        let predicted = arena.next_id();
        let actual = arena.alloc(Item { tag: 0 });
        assert_eq!(predicted, actual);
    }

    #[test]
    fn test_invalid_id() {
        let id: Id<Item> = Id::INVALID;
        assert!(!id.is_valid());
        assert!(Id::<Item>::new(0).is_valid());
        assert_eq!(format!("{:?}", id), "n<invalid>");
    }

    #[test]
    fn test_secondary_map_grows_on_set() {
        let mut arena: Arena<Item> = Arena::new();
        let a = arena.alloc(Item { tag: 1 });
        let b = arena.alloc(Item { tag: 2 });

        let mut uses: SecondaryMap<Item, Vec<u32>> = SecondaryMap::new();
        uses.set(b, vec![7]);
        assert_eq!(uses[b], vec![7]);
        // `a` was never set but is covered after the grow.
        assert_eq!(uses[a], Vec::<u32>::new());
    }

    #[test]
    fn test_bitset_worklist_dedup() {
        // The canonicalizer pattern: insert on push, remove on pop.
        let mut queued = BitSet::new();
        queued.insert(3);
        queued.insert(3);
        queued.insert(200);
        assert_eq!(queued.count(), 2);

        queued.remove(3);
        assert!(!queued.contains(3));
        assert!(queued.contains(200));
    }

    #[test]
    fn test_bitset_iter_across_words() {
        let mut set = BitSet::new();
        for i in [0usize, 63, 64, 129] {
            set.insert(i);
        }
        let got: Vec<_> = set.iter().collect();
        assert_eq!(got, vec![0, 63, 64, 129]);
    }
}
