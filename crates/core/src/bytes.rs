//! Immutable byte-string with a cached content hash.
//!
//! `ByteString` is the unit of data everywhere in the system: keys, values,
//! list elements, set members, hash fields, command arguments. It is an
//! immutable shared buffer, so cloning is cheap and chains of dict nodes can
//! share it freely across snapshots.
//!
//! # Construction modes
//!
//! - *copied*: `from_bytes` takes a defensive copy of the input slice.
//! - *trusted*: `from_vec` / `from_string` take ownership without copying.
//!
//! The 32-bit content hash is computed once at construction; dict probes and
//! equality fast-paths read it for free afterwards.

use once_cell::sync::{Lazy, OnceCell};
use rustc_hash::FxHashMap;
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;
use xxhash_rust::xxh32::xxh32;

/// Seed for the cached content hash. Fixed so that hashes are stable across
/// process restarts (the hash never leaves the process, but test fixtures
/// rely on determinism).
const HASH_SEED: u32 = 0;

/// Immutable, cheaply-cloneable byte sequence with a precomputed hash.
#[derive(Clone)]
pub struct ByteString {
    data: Arc<[u8]>,
    hash: u32,
    /// Lazily-computed UTF-8 view; `None` once computed if invalid UTF-8.
    text: OnceCell<Option<Box<str>>>,
}

impl ByteString {
    /// Construct by copying the input slice.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self::from_arc(Arc::from(bytes))
    }

    /// Construct by taking ownership of the vector (no copy).
    pub fn from_vec(bytes: Vec<u8>) -> Self {
        Self::from_arc(Arc::from(bytes.into_boxed_slice()))
    }

    /// Construct by taking ownership of a string (no copy).
    pub fn from_string(s: String) -> Self {
        Self::from_vec(s.into_bytes())
    }

    fn from_arc(data: Arc<[u8]>) -> Self {
        let hash = xxh32(&data, HASH_SEED);
        ByteString {
            data,
            hash,
            text: OnceCell::new(),
        }
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True when the byte sequence is empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Borrow the underlying bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Copy the bytes out into a fresh vector.
    pub fn to_vec(&self) -> Vec<u8> {
        self.data.to_vec()
    }

    /// The 32-bit content hash computed at construction.
    pub fn content_hash(&self) -> u32 {
        self.hash
    }

    /// Textual view of the bytes, computed on first use.
    ///
    /// Returns `None` when the bytes are not valid UTF-8.
    pub fn as_str(&self) -> Option<&str> {
        self.text
            .get_or_init(|| std::str::from_utf8(&self.data).ok().map(Box::from))
            .as_deref()
    }

    /// Case-insensitive comparison folding only ASCII letters.
    ///
    /// Bytes outside `[A-Za-z]` must match exactly.
    pub fn equals_ignore_case_ascii(&self, other: &ByteString) -> bool {
        self.data.eq_ignore_ascii_case(&other.data)
    }

    /// Lexicographic comparison on raw bytes.
    pub fn compare_lex(&self, other: &ByteString) -> Ordering {
        self.data.cmp(&other.data)
    }

    /// Parse the bytes as a signed 64-bit decimal integer.
    ///
    /// Used by INCR-family commands and anywhere a client-supplied number is
    /// consumed; rejects empty input, stray whitespace, and overflow.
    pub fn parse_i64(&self) -> Option<i64> {
        let s = std::str::from_utf8(&self.data).ok()?;
        s.parse::<i64>().ok()
    }

    /// Parse the bytes as a 64-bit float (scores).
    pub fn parse_f64(&self) -> Option<f64> {
        let s = std::str::from_utf8(&self.data).ok()?;
        let v = s.parse::<f64>().ok()?;
        if v.is_nan() {
            return None;
        }
        Some(v)
    }
}

impl PartialEq for ByteString {
    fn eq(&self, other: &Self) -> bool {
        // Hash mismatch settles inequality without touching the bytes.
        self.hash == other.hash && self.data == other.data
    }
}

impl Eq for ByteString {}

impl PartialOrd for ByteString {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ByteString {
    fn cmp(&self, other: &Self) -> Ordering {
        self.compare_lex(other)
    }
}

impl std::hash::Hash for ByteString {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        state.write_u32(self.hash);
    }
}

impl fmt::Debug for ByteString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.data) {
            Ok(s) => write!(f, "b\"{}\"", s.escape_debug()),
            Err(_) => write!(f, "{:02x?}", &self.data[..self.data.len().min(16)]),
        }
    }
}

impl From<&str> for ByteString {
    fn from(s: &str) -> Self {
        ByteString::from_bytes(s.as_bytes())
    }
}

impl From<&[u8]> for ByteString {
    fn from(b: &[u8]) -> Self {
        ByteString::from_bytes(b)
    }
}

/// The closed set of command names interned at process start.
///
/// Lookup key is the upper-cased ASCII form of the input, so dispatch never
/// allocates for a well-known command regardless of the case a client used.
const INTERNED_COMMANDS: &[&str] = &[
    "GET", "SET", "APPEND", "STRLEN", "INCR", "DECR", "INCRBY", "DEL", "EXISTS", "KEYS", "TYPE",
    "EXPIRE", "PEXPIRE", "PEXPIREAT", "TTL", "PTTL", "PERSIST", "DBSIZE", "FLUSHDB", "FLUSHALL",
    "SELECT",
    "LPUSH", "RPUSH", "LPOP", "RPOP", "LLEN", "LRANGE", "SADD", "SREM", "SISMEMBER", "SMEMBERS",
    "SCARD", "HSET", "HGET", "HDEL", "HEXISTS", "HLEN", "HGETALL", "HKEYS", "HVALS", "ZADD",
    "ZREM", "ZSCORE", "ZCARD", "ZRANK", "ZRANGE", "ZRANGEBYSCORE", "PING", "ECHO", "SAVE",
    "BGSAVE", "BGREWRITEAOF", "INFO", "REPLICAOF", "SLAVEOF", "REPLCONF", "PSYNC",
];

static INTERN_TABLE: Lazy<FxHashMap<&'static str, ByteString>> = Lazy::new(|| {
    INTERNED_COMMANDS
        .iter()
        .map(|name| (*name, ByteString::from(*name)))
        .collect()
});

/// Look up the shared instance for a command name.
///
/// Folds the input to upper-case ASCII before the lookup; returns `None` for
/// names outside the interned set (the caller falls back to its own copy).
pub fn intern_command(name: &[u8]) -> Option<ByteString> {
    if name.len() > 16 {
        return None;
    }
    let mut upper = [0u8; 16];
    let upper = &mut upper[..name.len()];
    upper.copy_from_slice(name);
    upper.make_ascii_uppercase();
    let key = std::str::from_utf8(upper).ok()?;
    INTERN_TABLE.get(key).cloned()
}
