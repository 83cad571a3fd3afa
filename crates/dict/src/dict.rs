//! Incremental-rehash hash table with copy-on-write snapshots.
//!
//! The dict backs every keyspace database and every set/hash/sorted-set
//! value. Two properties drive the design:
//!
//! 1. **Incremental rehash.** Resizes migrate a few buckets per operation
//!    instead of stopping the world. While a rehash is in flight the dict
//!    holds two tables: reads probe `ht0` then `ht1`, writes of new keys go
//!    to `ht1`, and each point operation moves up to [`REHASH_STEPS`]
//!    non-empty buckets forward before doing its own work.
//!
//! 2. **O(buckets) snapshots.** Bucket chains are immutable `Arc` nodes.
//!    Mutators never touch an existing node: an insert prepends a new head,
//!    a replace or delete rebuilds the chain prefix and shares the unchanged
//!    tail, and the new head is published into the bucket array. A snapshot
//!    is therefore just a clone of the bucket-head arrays, and it keeps
//!    seeing the chains exactly as they were when it was taken.
//!
//! # Lock discipline
//!
//! One internal mutex guards the tables for the duration of a single
//! operation. Snapshot creation holds it for the O(buckets) head-array copy
//! and releases it before the caller starts iterating; snapshot reads never
//! take it at all.
//!
//! # Rehash states
//!
//! `Idle` → `Expanding` when load factor exceeds 1.0, `Idle` → `Contracting`
//! when it drops below 1/40 on a table above the initial size. Either state
//! returns to `Idle` when the cursor sweeps past the end of `ht0`. At most
//! one rehash is ever in flight.

use parking_lot::Mutex;
use rustc_hash::FxHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Initial (and minimum) table size; always a power of two.
pub const INITIAL_SIZE: usize = 4;

/// Non-empty buckets migrated per point operation.
pub const REHASH_STEPS: usize = 5;

/// Empty buckets skipped per point operation before giving up the step.
pub const EMPTY_SCAN_LIMIT: usize = 10;

/// Contraction triggers below this load factor (1/40).
const SHRINK_LOAD_NUM: usize = 1;
const SHRINK_LOAD_DEN: usize = 40;

/// Rehash progress of a dict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RehashState {
    /// No rehash in flight.
    Idle,
    /// Migrating into a table twice the size.
    Expanding,
    /// Migrating into a smaller table.
    Contracting,
}

struct Node<K, V> {
    key: K,
    value: V,
    next: Link<K, V>,
}

type Link<K, V> = Option<Arc<Node<K, V>>>;

struct Table<K, V> {
    buckets: Vec<Link<K, V>>,
    used: usize,
}

impl<K, V> Table<K, V> {
    fn with_size(size: usize) -> Self {
        debug_assert!(size.is_power_of_two());
        Table {
            buckets: vec![None; size],
            used: 0,
        }
    }

    fn mask(&self) -> usize {
        self.buckets.len() - 1
    }
}

// Vec<Link> clone needs Node: no Clone bound; Option<Arc<_>> clones the Arc.
impl<K, V> Clone for Table<K, V> {
    fn clone(&self) -> Self {
        Table {
            buckets: self.buckets.clone(),
            used: self.used,
        }
    }
}

fn hash_key<K: Hash>(key: &K) -> u64 {
    let mut hasher = FxHasher::default();
    key.hash(&mut hasher);
    hasher.finish()
}

fn chain_get<'a, K: Eq, V>(mut link: Option<&'a Arc<Node<K, V>>>, key: &K) -> Option<&'a Node<K, V>> {
    while let Some(node) = link {
        if node.key == *key {
            return Some(node);
        }
        link = node.next.as_ref();
    }
    None
}

/// Rebuild the chain with `key` bound to `value`, sharing the unchanged tail.
/// Returns the new head and the previous value, or `None` if the key is absent.
fn chain_replace<K, V>(head: &Link<K, V>, key: &K, value: V) -> Option<(Link<K, V>, V)>
where
    K: Clone + Eq,
    V: Clone,
{
    let mut prefix: Vec<&Arc<Node<K, V>>> = Vec::new();
    let mut cursor = head.as_ref();
    while let Some(node) = cursor {
        if node.key == *key {
            let old = node.value.clone();
            let mut rebuilt = Some(Arc::new(Node {
                key: node.key.clone(),
                value,
                next: node.next.clone(),
            }));
            for kept in prefix.iter().rev() {
                rebuilt = Some(Arc::new(Node {
                    key: kept.key.clone(),
                    value: kept.value.clone(),
                    next: rebuilt,
                }));
            }
            return Some((rebuilt, old));
        }
        prefix.push(node);
        cursor = node.next.as_ref();
    }
    None
}

/// Rebuild the chain without `key`, sharing the unchanged tail.
/// Returns the new head and the removed value, or `None` if the key is absent.
fn chain_remove<K, V>(head: &Link<K, V>, key: &K) -> Option<(Link<K, V>, V)>
where
    K: Clone + Eq,
    V: Clone,
{
    let mut prefix: Vec<&Arc<Node<K, V>>> = Vec::new();
    let mut cursor = head.as_ref();
    while let Some(node) = cursor {
        if node.key == *key {
            let removed = node.value.clone();
            let mut rebuilt = node.next.clone();
            for kept in prefix.iter().rev() {
                rebuilt = Some(Arc::new(Node {
                    key: kept.key.clone(),
                    value: kept.value.clone(),
                    next: rebuilt,
                }));
            }
            return Some((rebuilt, removed));
        }
        prefix.push(node);
        cursor = node.next.as_ref();
    }
    None
}

struct DictInner<K, V> {
    ht0: Table<K, V>,
    /// Destination table while a rehash is in flight.
    ht1: Option<Table<K, V>>,
    /// Next `ht0` bucket to migrate; -1 when idle.
    rehash_cursor: i64,
    state: RehashState,
}

impl<K, V> DictInner<K, V>
where
    K: Clone + Eq + Hash,
    V: Clone,
{
    fn new() -> Self {
        DictInner {
            ht0: Table::with_size(INITIAL_SIZE),
            ht1: None,
            rehash_cursor: -1,
            state: RehashState::Idle,
        }
    }

    fn len(&self) -> usize {
        self.ht0.used + self.ht1.as_ref().map_or(0, |t| t.used)
    }

    fn is_rehashing(&self) -> bool {
        self.rehash_cursor >= 0
    }

    /// Migrate up to [`REHASH_STEPS`] non-empty buckets from `ht0` to `ht1`,
    /// visiting at most [`EMPTY_SCAN_LIMIT`] empty buckets along the way.
    fn rehash_step(&mut self) {
        if !self.is_rehashing() {
            return;
        }
        let mut moved = 0;
        let mut empty_seen = 0;
        while moved < REHASH_STEPS {
            let cursor = self.rehash_cursor as usize;
            if cursor >= self.ht0.buckets.len() {
                break;
            }
            match self.ht0.buckets[cursor].take() {
                None => {
                    self.rehash_cursor += 1;
                    empty_seen += 1;
                    if empty_seen >= EMPTY_SCAN_LIMIT {
                        break;
                    }
                }
                Some(head) => {
                    let ht1 = self
                        .ht1
                        .as_mut()
                        .expect("rehash in flight without destination table");
                    let mask = ht1.mask();
                    let mut cursor_node = Some(head);
                    while let Some(node) = cursor_node {
                        let idx = hash_key(&node.key) as usize & mask;
                        // Nodes are rebuilt rather than relinked: live
                        // snapshots still reference the original chain.
                        let migrated = Arc::new(Node {
                            key: node.key.clone(),
                            value: node.value.clone(),
                            next: ht1.buckets[idx].take(),
                        });
                        ht1.buckets[idx] = Some(migrated);
                        ht1.used += 1;
                        self.ht0.used -= 1;
                        cursor_node = node.next.clone();
                    }
                    self.rehash_cursor += 1;
                    moved += 1;
                }
            }
        }
        if self.rehash_cursor as usize >= self.ht0.buckets.len() {
            self.finish_rehash();
        }
    }

    fn finish_rehash(&mut self) {
        debug_assert_eq!(self.ht0.used, 0);
        self.ht0 = self.ht1.take().expect("finishing rehash without ht1");
        self.rehash_cursor = -1;
        self.state = RehashState::Idle;
    }

    fn start_rehash(&mut self, target_size: usize, state: RehashState) {
        debug_assert!(!self.is_rehashing());
        self.ht1 = Some(Table::with_size(target_size));
        self.rehash_cursor = 0;
        self.state = state;
    }

    fn maybe_expand(&mut self) {
        if self.is_rehashing() {
            return;
        }
        if self.ht0.used > self.ht0.buckets.len() {
            self.start_rehash(self.ht0.buckets.len() * 2, RehashState::Expanding);
        }
    }

    fn maybe_contract(&mut self) {
        if self.is_rehashing() || self.ht0.buckets.len() <= INITIAL_SIZE {
            return;
        }
        if self.ht0.used * SHRINK_LOAD_DEN < self.ht0.buckets.len() * SHRINK_LOAD_NUM {
            // Smallest power of two that keeps the load factor at or below 0.5.
            let target = (self.ht0.used * 2).next_power_of_two().max(INITIAL_SIZE);
            if target < self.ht0.buckets.len() {
                self.start_rehash(target, RehashState::Contracting);
            }
        }
    }

    fn find(&self, key: &K) -> Option<&V> {
        let h = hash_key(key);
        let idx0 = h as usize & self.ht0.mask();
        if let Some(node) = chain_get(self.ht0.buckets[idx0].as_ref(), key) {
            return Some(&node.value);
        }
        if let Some(ht1) = &self.ht1 {
            let idx1 = h as usize & ht1.mask();
            if let Some(node) = chain_get(ht1.buckets[idx1].as_ref(), key) {
                return Some(&node.value);
            }
        }
        None
    }

    fn put(&mut self, key: K, value: V) -> Option<V> {
        let h = hash_key(&key);

        // Replace in place (copy-on-write chain rebuild) wherever the key
        // currently lives.
        let idx0 = h as usize & self.ht0.mask();
        if let Some((rebuilt, old)) = chain_replace(&self.ht0.buckets[idx0], &key, value.clone()) {
            self.ht0.buckets[idx0] = rebuilt;
            return Some(old);
        }
        if let Some(ht1) = self.ht1.as_mut() {
            let idx1 = h as usize & ht1.mask();
            if let Some((rebuilt, old)) = chain_replace(&ht1.buckets[idx1], &key, value.clone()) {
                ht1.buckets[idx1] = rebuilt;
                return Some(old);
            }
        }

        // New key: while rehashing all inserts land in ht1.
        let table = match self.ht1.as_mut() {
            Some(ht1) => ht1,
            None => &mut self.ht0,
        };
        let idx = h as usize & table.mask();
        table.buckets[idx] = Some(Arc::new(Node {
            key,
            value,
            next: table.buckets[idx].take(),
        }));
        table.used += 1;

        self.maybe_expand();
        None
    }

    fn remove(&mut self, key: &K) -> Option<V> {
        let h = hash_key(key);
        let idx0 = h as usize & self.ht0.mask();
        let mut removed = None;
        if let Some((rebuilt, value)) = chain_remove(&self.ht0.buckets[idx0], key) {
            self.ht0.buckets[idx0] = rebuilt;
            self.ht0.used -= 1;
            removed = Some(value);
        } else if let Some(ht1) = self.ht1.as_mut() {
            let idx1 = h as usize & ht1.mask();
            if let Some((rebuilt, value)) = chain_remove(&ht1.buckets[idx1], key) {
                ht1.buckets[idx1] = rebuilt;
                ht1.used -= 1;
                removed = Some(value);
            }
        }
        self.maybe_contract();
        removed
    }
}

/// Concurrent keyed map with incremental rehash and O(buckets) snapshots.
pub struct Dict<K, V> {
    inner: Mutex<DictInner<K, V>>,
    /// Token cloned into every snapshot; strong count - 1 = live snapshots.
    snapshot_token: Arc<()>,
}

impl<K, V> Dict<K, V>
where
    K: Clone + Eq + Hash,
    V: Clone,
{
    /// Create an empty dict at the initial table size.
    pub fn new() -> Self {
        Dict {
            inner: Mutex::new(DictInner::new()),
            snapshot_token: Arc::new(()),
        }
    }

    /// Insert or replace; returns the prior value if the key existed.
    pub fn put(&self, key: K, value: V) -> Option<V> {
        let mut inner = self.inner.lock();
        inner.rehash_step();
        inner.put(key, value)
    }

    /// Look up a key, cloning the value out.
    pub fn get(&self, key: &K) -> Option<V> {
        let mut inner = self.inner.lock();
        inner.rehash_step();
        inner.find(key).cloned()
    }

    /// Remove a key; returns the removed value if it existed.
    pub fn remove(&self, key: &K) -> Option<V> {
        let mut inner = self.inner.lock();
        inner.rehash_step();
        inner.remove(key)
    }

    /// Whether the key is present.
    pub fn contains(&self, key: &K) -> bool {
        let mut inner = self.inner.lock();
        inner.rehash_step();
        inner.find(key).is_some()
    }

    /// Number of entries across both tables.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// True when the dict holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current rehash state.
    pub fn rehash_state(&self) -> RehashState {
        self.inner.lock().state
    }

    /// Drop every entry and reset to the initial table size.
    ///
    /// Live snapshots keep the chains they captured.
    pub fn clear(&self) {
        *self.inner.lock() = DictInner::new();
    }

    /// Freeze the map at this call's linearisation point.
    ///
    /// Cost is O(buckets): the bucket-head arrays of both tables are cloned
    /// under the lock; chains are shared. Later mutations of the live dict
    /// are invisible through the returned snapshot.
    pub fn create_snapshot(&self) -> DictSnapshot<K, V> {
        let inner = self.inner.lock();
        let mut tables = vec![inner.ht0.clone()];
        if let Some(ht1) = &inner.ht1 {
            tables.push(ht1.clone());
        }
        DictSnapshot {
            tables,
            _live: Arc::clone(&self.snapshot_token),
        }
    }

    /// Release a snapshot. Dropping it has the same effect; the explicit
    /// form mirrors the create/finish pairing at call sites that want it.
    pub fn finish_snapshot(&self, snapshot: DictSnapshot<K, V>) {
        drop(snapshot);
    }

    /// Number of snapshots currently alive.
    pub fn live_snapshots(&self) -> usize {
        Arc::strong_count(&self.snapshot_token) - 1
    }

    /// Weakly-consistent key iteration.
    ///
    /// Backed by an internal snapshot: never fails under concurrent
    /// mutation, never yields an element twice, and yields every element
    /// that is present for the whole iteration.
    pub fn keys(&self) -> Vec<K> {
        self.create_snapshot().iter().map(|(k, _)| k.clone()).collect()
    }

    /// Weakly-consistent entry iteration; same guarantees as [`Dict::keys`].
    pub fn entries(&self) -> DictIter<K, V> {
        DictIter::new(self.create_snapshot())
    }
}

impl<K, V> Default for Dict<K, V>
where
    K: Clone + Eq + Hash,
    V: Clone,
{
    fn default() -> Self {
        Dict::new()
    }
}

impl<K, V> std::fmt::Debug for Dict<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Dict")
            .field("len", &(inner.ht0.used + inner.ht1.as_ref().map_or(0, |t| t.used)))
            .field("rehashing", &(inner.rehash_cursor >= 0))
            .finish()
    }
}

/// A logical freeze of a dict at one point in time.
pub struct DictSnapshot<K, V> {
    tables: Vec<Table<K, V>>,
    _live: Arc<()>,
}

impl<K, V> DictSnapshot<K, V>
where
    K: Clone + Eq + Hash,
    V: Clone,
{
    /// Entries captured by the snapshot.
    pub fn len(&self) -> usize {
        self.tables.iter().map(|t| t.used).sum()
    }

    /// True when the snapshot captured no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Point lookup against the frozen state.
    pub fn get(&self, key: &K) -> Option<&V> {
        let h = hash_key(key);
        for table in &self.tables {
            let idx = h as usize & table.mask();
            if let Some(node) = chain_get(table.buckets[idx].as_ref(), key) {
                return Some(&node.value);
            }
        }
        None
    }

    /// Iterate the frozen entries by reference.
    pub fn iter(&self) -> SnapshotIter<'_, K, V> {
        SnapshotIter {
            snapshot: self,
            table: 0,
            bucket: 0,
            node: None,
        }
    }
}

/// Borrowing iterator over a snapshot's entries.
pub struct SnapshotIter<'a, K, V> {
    snapshot: &'a DictSnapshot<K, V>,
    table: usize,
    bucket: usize,
    node: Option<&'a Node<K, V>>,
}

impl<'a, K, V> Iterator for SnapshotIter<'a, K, V> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(node) = self.node {
                self.node = node.next.as_deref();
                return Some((&node.key, &node.value));
            }
            let table = self.snapshot.tables.get(self.table)?;
            match table.buckets.get(self.bucket) {
                Some(link) => {
                    self.node = link.as_deref();
                    self.bucket += 1;
                }
                None => {
                    self.table += 1;
                    self.bucket = 0;
                }
            }
        }
    }
}

/// Owning iterator over a snapshot taken at creation time.
pub struct DictIter<K, V> {
    tables: Vec<Table<K, V>>,
    table: usize,
    bucket: usize,
    node: Link<K, V>,
}

impl<K, V> DictIter<K, V> {
    fn new(snapshot: DictSnapshot<K, V>) -> Self {
        DictIter {
            tables: snapshot.tables,
            table: 0,
            bucket: 0,
            node: None,
        }
    }
}

impl<K: Clone, V: Clone> Iterator for DictIter<K, V> {
    type Item = (K, V);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(node) = self.node.take() {
                self.node = node.next.clone();
                return Some((node.key.clone(), node.value.clone()));
            }
            let table = self.tables.get(self.table)?;
            match table.buckets.get(self.bucket) {
                Some(link) => {
                    self.node = link.clone();
                    self.bucket += 1;
                }
                None => {
                    self.table += 1;
                    self.bucket = 0;
                }
            }
        }
    }
}
