//! Numbered databases with TTL tracking.
//!
//! The keyspace is a fixed array of databases, each owning one dict from key
//! to stored value. Expiry is lazy on access: a read that finds an expired
//! entry deletes it and reports a miss. Bulk readers (snapshot write, log
//! rewrite, full-sync) skip expired keys eagerly instead of deleting them,
//! so background work never mutates a database it is serialising.
//!
//! Writers on one database serialise through that database's write lock;
//! the dict's internal lock only covers single point operations.

use crate::value::Value;
use ember_core::ByteString;
use ember_dict::{Dict, DictSnapshot};
use parking_lot::{Mutex, MutexGuard};
use tracing::trace;

/// Default number of databases.
pub const DEFAULT_DB_COUNT: usize = 16;

/// Sentinel for "no expiry".
pub const NO_EXPIRY: i64 = -1;

/// A value plus its optional absolute expiry (milliseconds since epoch).
#[derive(Debug, Clone)]
pub struct Stored {
    /// The value.
    pub value: Value,
    /// Absolute expiry in ms; [`NO_EXPIRY`] when the key does not expire.
    pub expire_at_ms: i64,
}

impl Stored {
    /// A value without expiry.
    pub fn new(value: Value) -> Self {
        Stored {
            value,
            expire_at_ms: NO_EXPIRY,
        }
    }

    /// Whether the entry is expired at `now_ms`.
    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.expire_at_ms != NO_EXPIRY && self.expire_at_ms <= now_ms
    }
}

/// Remaining-TTL answer for a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ttl {
    /// Key does not exist.
    Missing,
    /// Key exists without expiry.
    None,
    /// Key expires in this many milliseconds.
    Ms(i64),
}

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// One numbered database.
pub struct Database {
    index: usize,
    write_lock: Mutex<()>,
    dict: Dict<ByteString, Stored>,
}

impl Database {
    fn new(index: usize) -> Self {
        Database {
            index,
            write_lock: Mutex::new(()),
            dict: Dict::new(),
        }
    }

    /// Database number.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Serialise command execution against this database.
    pub fn lock_writes(&self) -> MutexGuard<'_, ()> {
        self.write_lock.lock()
    }

    /// Look up a live value, lazily deleting it when expired.
    pub fn get(&self, key: &ByteString) -> Option<Value> {
        let stored = self.dict.get(key)?;
        if stored.is_expired(now_ms()) {
            trace!(target: "ember::keyspace", db = self.index, key = ?key, "lazy expiry");
            self.dict.remove(key);
            return None;
        }
        Some(stored.value)
    }

    /// Look up including the expiry metadata.
    pub fn get_stored(&self, key: &ByteString) -> Option<Stored> {
        let stored = self.dict.get(key)?;
        if stored.is_expired(now_ms()) {
            self.dict.remove(key);
            return None;
        }
        Some(stored)
    }

    /// Install a value, keeping no previous expiry.
    pub fn set(&self, key: ByteString, value: Value) {
        self.dict.put(key, Stored::new(value));
    }

    /// Install a value with expiry metadata (snapshot load path).
    pub fn set_stored(&self, key: ByteString, stored: Stored) {
        self.dict.put(key, stored);
    }

    /// Remove a key; reports whether a live entry was removed.
    pub fn remove(&self, key: &ByteString) -> bool {
        match self.dict.remove(key) {
            Some(stored) => !stored.is_expired(now_ms()),
            None => false,
        }
    }

    /// True when a live entry exists.
    pub fn contains(&self, key: &ByteString) -> bool {
        self.get_stored(key).is_some()
    }

    /// Set the absolute expiry of an existing key. Returns false when the
    /// key is missing.
    pub fn expire_at(&self, key: &ByteString, at_ms: i64) -> bool {
        match self.get_stored(key) {
            Some(mut stored) => {
                stored.expire_at_ms = at_ms;
                self.dict.put(key.clone(), stored);
                true
            }
            None => false,
        }
    }

    /// Clear the expiry of a key. Returns true when an expiry was removed.
    pub fn persist(&self, key: &ByteString) -> bool {
        match self.get_stored(key) {
            Some(mut stored) if stored.expire_at_ms != NO_EXPIRY => {
                stored.expire_at_ms = NO_EXPIRY;
                self.dict.put(key.clone(), stored);
                true
            }
            _ => false,
        }
    }

    /// Remaining TTL.
    pub fn ttl(&self, key: &ByteString) -> Ttl {
        match self.get_stored(key) {
            None => Ttl::Missing,
            Some(stored) if stored.expire_at_ms == NO_EXPIRY => Ttl::None,
            Some(stored) => Ttl::Ms(stored.expire_at_ms - now_ms()),
        }
    }

    /// Number of entries, counting not-yet-collected expired keys.
    pub fn len(&self) -> usize {
        self.dict.len()
    }

    /// True when the database holds no entries.
    pub fn is_empty(&self) -> bool {
        self.dict.is_empty()
    }

    /// Live keys (expired keys are skipped, not deleted).
    pub fn keys(&self) -> Vec<ByteString> {
        let now = now_ms();
        self.dict
            .entries()
            .filter(|(_, stored)| !stored.is_expired(now))
            .map(|(key, _)| key)
            .collect()
    }

    /// O(buckets) freeze of the database for background serialisation.
    pub fn snapshot(&self) -> DictSnapshot<ByteString, Stored> {
        self.dict.create_snapshot()
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.dict.clear();
    }
}

/// The array of databases.
pub struct Keyspace {
    databases: Vec<Database>,
}

impl Keyspace {
    /// Create `db_count` empty databases.
    pub fn new(db_count: usize) -> Self {
        Keyspace {
            databases: (0..db_count).map(Database::new).collect(),
        }
    }

    /// Database by index; panics on out-of-range (callers validate SELECT).
    pub fn db(&self, index: usize) -> &Database {
        &self.databases[index]
    }

    /// Number of databases.
    pub fn db_count(&self) -> usize {
        self.databases.len()
    }

    /// All databases, for serialisation sweeps.
    pub fn databases(&self) -> &[Database] {
        &self.databases
    }

    /// Drop every entry in every database.
    pub fn flush_all(&self) {
        for db in &self.databases {
            db.clear();
        }
    }
}

impl Default for Keyspace {
    fn default() -> Self {
        Keyspace::new(DEFAULT_DB_COUNT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bs(s: &str) -> ByteString {
        ByteString::from(s)
    }

    #[test]
    fn test_set_get_remove() {
        let ks = Keyspace::new(2);
        let db = ks.db(0);
        db.set(bs("k"), Value::str_from(b"v"));
        assert!(db.contains(&bs("k")));
        assert!(!ks.db(1).contains(&bs("k")));
        assert!(db.remove(&bs("k")));
        assert!(!db.remove(&bs("k")));
    }

    #[test]
    fn test_expiry_is_lazy() {
        let ks = Keyspace::default();
        let db = ks.db(0);
        db.set(bs("k"), Value::str_from(b"v"));
        assert!(db.expire_at(&bs("k"), now_ms() - 1));
        // Entry still occupies a slot until touched.
        assert_eq!(db.len(), 1);
        assert!(db.get(&bs("k")).is_none());
        assert_eq!(db.len(), 0);
    }

    #[test]
    fn test_expire_at_zero_means_immediate() {
        let ks = Keyspace::default();
        let db = ks.db(0);
        db.set(bs("k"), Value::str_from(b"v"));
        assert!(db.expire_at(&bs("k"), now_ms()));
        assert!(db.get(&bs("k")).is_none());
    }

    #[test]
    fn test_ttl_states() {
        let ks = Keyspace::default();
        let db = ks.db(0);
        assert_eq!(db.ttl(&bs("missing")), Ttl::Missing);

        db.set(bs("k"), Value::str_from(b"v"));
        assert_eq!(db.ttl(&bs("k")), Ttl::None);

        db.expire_at(&bs("k"), now_ms() + 60_000);
        match db.ttl(&bs("k")) {
            Ttl::Ms(remaining) => assert!(remaining > 55_000 && remaining <= 60_000),
            other => panic!("unexpected ttl {:?}", other),
        }

        assert!(db.persist(&bs("k")));
        assert_eq!(db.ttl(&bs("k")), Ttl::None);
        assert!(!db.persist(&bs("k")));
    }

    #[test]
    fn test_keys_skips_expired_without_deleting() {
        let ks = Keyspace::default();
        let db = ks.db(0);
        db.set(bs("live"), Value::str_from(b"v"));
        db.set(bs("dead"), Value::str_from(b"v"));
        db.expire_at(&bs("dead"), now_ms() - 1);

        let keys = db.keys();
        assert_eq!(keys, vec![bs("live")]);
        // The expired entry is still present until a point read touches it.
        assert_eq!(db.len(), 2);
    }

    #[test]
    fn test_expire_missing_key() {
        let ks = Keyspace::default();
        assert!(!ks.db(0).expire_at(&bs("nope"), now_ms() + 1000));
    }

    #[test]
    fn test_flush_all() {
        let ks = Keyspace::new(3);
        for i in 0..3 {
            ks.db(i).set(bs("k"), Value::str_from(b"v"));
        }
        ks.flush_all();
        for i in 0..3 {
            assert!(ks.db(i).is_empty());
        }
    }

    #[test]
    fn test_snapshot_isolated_from_writes() {
        let ks = Keyspace::default();
        let db = ks.db(0);
        db.set(bs("a"), Value::str_from(b"1"));
        let snapshot = db.snapshot();
        db.set(bs("b"), Value::str_from(b"2"));
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot.get(&bs("a")).is_some());
        assert!(snapshot.get(&bs("b")).is_none());
    }
}
