//! Value types stored in the keyspace.
//!
//! A tagged [`Value`] enum replaces any common-supertype hierarchy: the
//! keyspace stores the variant, commands match on it, and per-variant
//! serialisation functions handle persistence. Collection variants hold
//! shared handles so that cloning a `Value` (dict chain rebuilds, snapshot
//! reads) aliases the collection instead of deep-copying it; mutation goes
//! through each collection's own lock, and cross-structure updates inside a
//! sorted set hold its index lock for the whole step.
//!
//! Every type knows how to serialise itself as a command sequence — the
//! representation used by log rewrite and replication full-sync.

use ember_core::{ByteString, DynStr};
use ember_dict::{Dict, SkipList};
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::Arc;

/// Elements per command emitted by collection self-serialisation. Bounds the
/// size of any single rewrite command without inflating command count.
const SERIALIZE_CHUNK: usize = 64;

/// A string value: growable buffer plus a cached immutable view.
#[derive(Debug)]
pub struct StrValue {
    inner: Mutex<StrInner>,
}

#[derive(Debug)]
struct StrInner {
    buf: DynStr,
    /// Invalidated on every mutation, rebuilt on read.
    cached: Option<ByteString>,
}

impl StrValue {
    /// Create from raw bytes.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        StrValue {
            inner: Mutex::new(StrInner {
                buf: DynStr::from_bytes(bytes),
                cached: None,
            }),
        }
    }

    /// Current contents as a shared byte-string, caching the view.
    pub fn load(&self) -> ByteString {
        let mut inner = self.inner.lock();
        if let Some(cached) = &inner.cached {
            return cached.clone();
        }
        let view = ByteString::from_bytes(inner.buf.as_slice());
        inner.cached = Some(view.clone());
        view
    }

    /// Replace the contents.
    pub fn store(&self, bytes: &[u8]) {
        let mut inner = self.inner.lock();
        inner.buf.set(bytes);
        inner.cached = None;
    }

    /// Append bytes; returns the new length.
    pub fn append(&self, bytes: &[u8]) -> usize {
        let mut inner = self.inner.lock();
        inner.cached = None;
        inner.buf.append(bytes)
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.inner.lock().buf.len()
    }

    /// True when the string is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Member→score map plus the ordered index, kept consistent under one lock.
#[derive(Debug, Default)]
pub struct SortedSet {
    by_member: Dict<ByteString, F64Bits>,
    index: Mutex<SkipList<ByteString>>,
}

/// Score wrapper giving `f64` the `Eq` the dict wants. Scores are never NaN,
/// so bit equality is value equality (modulo -0.0, which command parsing
/// normalises).
#[derive(Debug, Clone, Copy, PartialEq)]
struct F64Bits(f64);

impl Eq for F64Bits {}

impl SortedSet {
    /// Create an empty sorted set.
    pub fn new() -> Self {
        SortedSet {
            by_member: Dict::new(),
            index: Mutex::new(SkipList::new()),
        }
    }

    /// Insert or update a member; returns true when the member was new.
    pub fn add(&self, member: ByteString, score: f64) -> bool {
        let mut index = self.index.lock();
        match self.by_member.put(member.clone(), F64Bits(score)) {
            Some(F64Bits(old)) => {
                if old != score {
                    index.delete(old, &member);
                    index.insert(score, member);
                }
                false
            }
            None => {
                index.insert(score, member);
                true
            }
        }
    }

    /// Remove a member; returns whether it was present.
    pub fn remove(&self, member: &ByteString) -> bool {
        let mut index = self.index.lock();
        match self.by_member.remove(member) {
            Some(F64Bits(score)) => {
                index.delete(score, member);
                true
            }
            None => false,
        }
    }

    /// Score of a member.
    pub fn score(&self, member: &ByteString) -> Option<f64> {
        self.by_member.get(member).map(|F64Bits(s)| s)
    }

    /// Member count.
    pub fn len(&self) -> usize {
        self.by_member.len()
    }

    /// True when the set is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 0-based rank by ascending `(score, member)`.
    pub fn rank(&self, member: &ByteString) -> Option<usize> {
        let score = self.score(member)?;
        let rank = self.index.lock().rank_of(score, member);
        if rank == 0 {
            None
        } else {
            Some(rank - 1)
        }
    }

    /// Entries at 1-based ranks `lo..=hi`.
    pub fn range_by_rank(&self, lo: usize, hi: usize) -> Vec<(f64, ByteString)> {
        self.index.lock().range_by_rank(lo, hi)
    }

    /// Entries with score in `[min, max]`.
    pub fn range_by_score(&self, min: f64, max: f64) -> Vec<(f64, ByteString)> {
        self.index.lock().range_by_score(min, max)
    }

    /// Every entry in `(score, member)` order.
    pub fn entries(&self) -> Vec<(f64, ByteString)> {
        self.index
            .lock()
            .iter()
            .map(|(score, member)| (score, member.clone()))
            .collect()
    }
}

/// A value in the keyspace.
#[derive(Debug, Clone)]
pub enum Value {
    /// String.
    Str(Arc<StrValue>),
    /// Double-ended list of byte-strings.
    List(Arc<RwLock<VecDeque<ByteString>>>),
    /// Unordered set of byte-strings.
    Set(Arc<Dict<ByteString, ()>>),
    /// Field→value map.
    Hash(Arc<Dict<ByteString, ByteString>>),
    /// Sorted set.
    ZSet(Arc<SortedSet>),
}

impl Value {
    /// New string value.
    pub fn str_from(bytes: &[u8]) -> Value {
        Value::Str(Arc::new(StrValue::from_bytes(bytes)))
    }

    /// New empty list.
    pub fn empty_list() -> Value {
        Value::List(Arc::new(RwLock::new(VecDeque::new())))
    }

    /// New empty set.
    pub fn empty_set() -> Value {
        Value::Set(Arc::new(Dict::new()))
    }

    /// New empty hash.
    pub fn empty_hash() -> Value {
        Value::Hash(Arc::new(Dict::new()))
    }

    /// New empty sorted set.
    pub fn empty_zset() -> Value {
        Value::ZSet(Arc::new(SortedSet::new()))
    }

    /// Type name as reported by TYPE and used in WRONGTYPE checks.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Str(_) => "string",
            Value::List(_) => "list",
            Value::Set(_) => "set",
            Value::Hash(_) => "hash",
            Value::ZSet(_) => "zset",
        }
    }

    /// Number of elements (string length for strings).
    pub fn element_count(&self) -> usize {
        match self {
            Value::Str(s) => s.len(),
            Value::List(l) => l.read().len(),
            Value::Set(s) => s.len(),
            Value::Hash(h) => h.len(),
            Value::ZSet(z) => z.len(),
        }
    }

    /// Serialise as the minimal command sequence that rebuilds this value
    /// under `key`. Used by log rewrite and full-sync.
    pub fn to_commands(&self, key: &ByteString) -> Vec<Vec<ByteString>> {
        match self {
            Value::Str(s) => {
                vec![vec![ByteString::from("SET"), key.clone(), s.load()]]
            }
            Value::List(list) => {
                let items: Vec<ByteString> = list.read().iter().cloned().collect();
                chunked_command("RPUSH", key, items.into_iter())
            }
            Value::Set(set) => {
                let members = set.entries().map(|(m, ())| m);
                chunked_command("SADD", key, members)
            }
            Value::Hash(hash) => {
                let pairs = hash.entries().flat_map(|(f, v)| [f, v]);
                chunked_pairs("HSET", key, pairs)
            }
            Value::ZSet(zset) => {
                let pairs = zset
                    .entries()
                    .into_iter()
                    .flat_map(|(score, member)| [ByteString::from_string(fmt_score(score)), member]);
                chunked_pairs("ZADD", key, pairs)
            }
        }
    }
}

fn chunked_command(
    name: &str,
    key: &ByteString,
    items: impl Iterator<Item = ByteString>,
) -> Vec<Vec<ByteString>> {
    let mut commands = Vec::new();
    let mut current: Vec<ByteString> = Vec::new();
    for item in items {
        if current.is_empty() {
            current.push(ByteString::from(name));
            current.push(key.clone());
        }
        current.push(item);
        if current.len() >= SERIALIZE_CHUNK + 2 {
            commands.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        commands.push(current);
    }
    commands
}

/// Like [`chunked_command`] but splits only on pair boundaries.
fn chunked_pairs(
    name: &str,
    key: &ByteString,
    flattened: impl Iterator<Item = ByteString>,
) -> Vec<Vec<ByteString>> {
    let mut commands = Vec::new();
    let mut current: Vec<ByteString> = Vec::new();
    let mut pending = 0usize;
    for item in flattened {
        if current.is_empty() {
            current.push(ByteString::from(name));
            current.push(key.clone());
        }
        current.push(item);
        pending += 1;
        if pending % 2 == 0 && current.len() >= SERIALIZE_CHUNK + 2 {
            commands.push(std::mem::take(&mut current));
            pending = 0;
        }
    }
    if !current.is_empty() {
        commands.push(current);
    }
    commands
}

/// Canonical textual form of a score: integral scores render without a
/// fractional part, everything else uses the shortest round-trip form.
pub fn fmt_score(score: f64) -> String {
    if score == score.trunc() && score.abs() < 1e17 {
        format!("{}", score as i64)
    } else {
        format!("{}", score)
    }
}
