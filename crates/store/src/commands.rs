//! Command dispatch and handlers.
//!
//! Dispatch is a closed table from upper-cased command name to handler
//! function; the command set is fixed at process start. Each handler reports
//! whether it mutated the keyspace, which drives log append and replication
//! propagation — a write command that changed nothing is not propagated.
//!
//! The same entry point serves three callers: client connections, command-log
//! recovery, and the replica apply loop. All three present decoded argument
//! arrays and a per-caller connection state (the selected database).

use crate::error::{StoreError, StoreResult};
use crate::keyspace::{now_ms, Keyspace, Ttl};
use crate::value::{fmt_score, SortedSet, StrValue, Value};
use ember_core::{intern_command, ByteString, Reply};
use ember_dict::Dict;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::sync::Arc;

/// Per-caller execution state.
#[derive(Debug, Clone)]
pub struct ConnState {
    /// Selected database index.
    pub db_index: usize,
}

impl ConnState {
    /// State pointing at database 0.
    pub fn new() -> Self {
        ConnState { db_index: 0 }
    }
}

impl Default for ConnState {
    fn default() -> Self {
        ConnState::new()
    }
}

/// Result of executing one command.
#[derive(Debug)]
pub struct Outcome {
    /// Reply to send to the caller.
    pub reply: Reply,
    /// Whether the keyspace was mutated (drives propagation and logging).
    pub dirty: bool,
}

impl Outcome {
    fn read(reply: Reply) -> Self {
        Outcome {
            reply,
            dirty: false,
        }
    }

    fn write(reply: Reply) -> Self {
        Outcome { reply, dirty: true }
    }

    fn write_if(reply: Reply, dirty: bool) -> Self {
        Outcome { reply, dirty }
    }
}

type Handler = fn(&Keyspace, &mut ConnState, &[ByteString]) -> StoreResult<Outcome>;

static TABLE: Lazy<FxHashMap<&'static str, Handler>> = Lazy::new(|| {
    let mut table: FxHashMap<&'static str, Handler> = FxHashMap::default();
    table.insert("GET", cmd_get);
    table.insert("SET", cmd_set);
    table.insert("APPEND", cmd_append);
    table.insert("STRLEN", cmd_strlen);
    table.insert("INCR", cmd_incr);
    table.insert("DECR", cmd_decr);
    table.insert("INCRBY", cmd_incrby);
    table.insert("DEL", cmd_del);
    table.insert("EXISTS", cmd_exists);
    table.insert("KEYS", cmd_keys);
    table.insert("TYPE", cmd_type);
    table.insert("EXPIRE", cmd_expire);
    table.insert("PEXPIRE", cmd_pexpire);
    table.insert("PEXPIREAT", cmd_pexpireat);
    table.insert("TTL", cmd_ttl);
    table.insert("PTTL", cmd_pttl);
    table.insert("PERSIST", cmd_persist);
    table.insert("DBSIZE", cmd_dbsize);
    table.insert("FLUSHDB", cmd_flushdb);
    table.insert("FLUSHALL", cmd_flushall);
    table.insert("SELECT", cmd_select);
    table.insert("LPUSH", cmd_lpush);
    table.insert("RPUSH", cmd_rpush);
    table.insert("LPOP", cmd_lpop);
    table.insert("RPOP", cmd_rpop);
    table.insert("LLEN", cmd_llen);
    table.insert("LRANGE", cmd_lrange);
    table.insert("SADD", cmd_sadd);
    table.insert("SREM", cmd_srem);
    table.insert("SISMEMBER", cmd_sismember);
    table.insert("SMEMBERS", cmd_smembers);
    table.insert("SCARD", cmd_scard);
    table.insert("HSET", cmd_hset);
    table.insert("HGET", cmd_hget);
    table.insert("HDEL", cmd_hdel);
    table.insert("HEXISTS", cmd_hexists);
    table.insert("HLEN", cmd_hlen);
    table.insert("HGETALL", cmd_hgetall);
    table.insert("HKEYS", cmd_hkeys);
    table.insert("HVALS", cmd_hvals);
    table.insert("ZADD", cmd_zadd);
    table.insert("ZREM", cmd_zrem);
    table.insert("ZSCORE", cmd_zscore);
    table.insert("ZCARD", cmd_zcard);
    table.insert("ZRANK", cmd_zrank);
    table.insert("ZRANGE", cmd_zrange);
    table.insert("ZRANGEBYSCORE", cmd_zrangebyscore);
    table.insert("PING", cmd_ping);
    table.insert("ECHO", cmd_echo);
    table
});

/// Execute one decoded command, rendering any error as its reply.
pub fn execute(ks: &Keyspace, conn: &mut ConnState, args: &[ByteString]) -> Outcome {
    match try_execute(ks, conn, args) {
        Ok(outcome) => outcome,
        Err(err) => Outcome::read(err.to_reply()),
    }
}

/// Execute one decoded command, propagating the error value.
pub fn try_execute(
    ks: &Keyspace,
    conn: &mut ConnState,
    args: &[ByteString],
) -> StoreResult<Outcome> {
    let name = args
        .first()
        .ok_or_else(|| StoreError::invalid("empty command"))?;
    let handler = lookup(name)?;

    // Writers and plain reads on a database serialise through its lock.
    let db = ks.db(conn.db_index);
    let _guard = db.lock_writes();
    handler(ks, conn, args)
}

/// Execute with the database write lock already held by the caller.
///
/// The server path holds the lock across execution *and* propagation so
/// that the commit order cannot invert relative to execution order.
pub fn execute_pre_locked(ks: &Keyspace, conn: &mut ConnState, args: &[ByteString]) -> Outcome {
    let result = (|| {
        let name = args
            .first()
            .ok_or_else(|| StoreError::invalid("empty command"))?;
        let handler = lookup(name)?;
        handler(ks, conn, args)
    })();
    match result {
        Ok(outcome) => outcome,
        Err(err) => Outcome::read(err.to_reply()),
    }
}

/// Whether `name` is a keyspace command this table can execute.
pub fn is_known(name: &ByteString) -> bool {
    lookup(name).is_ok()
}

fn unknown_command(name: &ByteString) -> StoreError {
    StoreError::UnknownCommand(String::from_utf8_lossy(name.as_bytes()).into_owned())
}

fn lookup(name: &ByteString) -> StoreResult<Handler> {
    let interned = intern_command(name.as_bytes()).ok_or_else(|| unknown_command(name))?;
    let key = interned.as_str().expect("interned command names are ASCII");
    TABLE.get(key).copied().ok_or_else(|| unknown_command(name))
}

// =========================================================================
// Argument helpers
// =========================================================================

fn name_of(args: &[ByteString]) -> String {
    String::from_utf8_lossy(args[0].as_bytes()).to_lowercase()
}

fn require(args: &[ByteString], exact: usize) -> StoreResult<()> {
    if args.len() != exact {
        return Err(StoreError::WrongArity(name_of(args)));
    }
    Ok(())
}

fn require_at_least(args: &[ByteString], min: usize) -> StoreResult<()> {
    if args.len() < min {
        return Err(StoreError::WrongArity(name_of(args)));
    }
    Ok(())
}

fn int_arg(arg: &ByteString) -> StoreResult<i64> {
    arg.parse_i64().ok_or(StoreError::NotAnInteger)
}

fn score_arg(arg: &ByteString) -> StoreResult<f64> {
    let text = arg.as_str().ok_or(StoreError::NotAFloat)?;
    let value = match text {
        "+inf" | "inf" => f64::INFINITY,
        "-inf" => f64::NEG_INFINITY,
        other => other.parse::<f64>().map_err(|_| StoreError::NotAFloat)?,
    };
    if value.is_nan() {
        return Err(StoreError::NotAFloat);
    }
    // Normalise -0.0 so score formatting round-trips.
    Ok(if value == 0.0 { 0.0 } else { value })
}

/// Resolve `(start, stop)` with negative-index semantics (-1 = last) into
/// inclusive 0-based bounds, or `None` when the range is empty.
fn resolve_range(start: i64, stop: i64, len: usize) -> Option<(usize, usize)> {
    if len == 0 {
        return None;
    }
    let len = len as i64;
    let mut start = if start < 0 { len + start } else { start };
    let mut stop = if stop < 0 { len + stop } else { stop };
    if start < 0 {
        start = 0;
    }
    if stop >= len {
        stop = len - 1;
    }
    if start > stop || start >= len {
        return None;
    }
    Some((start as usize, stop as usize))
}

// =========================================================================
// Typed accessors
// =========================================================================

fn str_of(db: &crate::keyspace::Database, key: &ByteString) -> StoreResult<Option<Arc<StrValue>>> {
    match db.get(key) {
        None => Ok(None),
        Some(Value::Str(s)) => Ok(Some(s)),
        Some(_) => Err(StoreError::WrongType),
    }
}

fn list_of(
    db: &crate::keyspace::Database,
    key: &ByteString,
) -> StoreResult<Option<Arc<RwLock<VecDeque<ByteString>>>>> {
    match db.get(key) {
        None => Ok(None),
        Some(Value::List(l)) => Ok(Some(l)),
        Some(_) => Err(StoreError::WrongType),
    }
}

fn list_or_create(
    db: &crate::keyspace::Database,
    key: &ByteString,
) -> StoreResult<Arc<RwLock<VecDeque<ByteString>>>> {
    if let Some(list) = list_of(db, key)? {
        return Ok(list);
    }
    let value = Value::empty_list();
    db.set(key.clone(), value.clone());
    match value {
        Value::List(l) => Ok(l),
        _ => unreachable!(),
    }
}

fn set_of(
    db: &crate::keyspace::Database,
    key: &ByteString,
) -> StoreResult<Option<Arc<Dict<ByteString, ()>>>> {
    match db.get(key) {
        None => Ok(None),
        Some(Value::Set(s)) => Ok(Some(s)),
        Some(_) => Err(StoreError::WrongType),
    }
}

fn set_or_create(
    db: &crate::keyspace::Database,
    key: &ByteString,
) -> StoreResult<Arc<Dict<ByteString, ()>>> {
    if let Some(set) = set_of(db, key)? {
        return Ok(set);
    }
    let value = Value::empty_set();
    db.set(key.clone(), value.clone());
    match value {
        Value::Set(s) => Ok(s),
        _ => unreachable!(),
    }
}

fn hash_of(
    db: &crate::keyspace::Database,
    key: &ByteString,
) -> StoreResult<Option<Arc<Dict<ByteString, ByteString>>>> {
    match db.get(key) {
        None => Ok(None),
        Some(Value::Hash(h)) => Ok(Some(h)),
        Some(_) => Err(StoreError::WrongType),
    }
}

fn hash_or_create(
    db: &crate::keyspace::Database,
    key: &ByteString,
) -> StoreResult<Arc<Dict<ByteString, ByteString>>> {
    if let Some(hash) = hash_of(db, key)? {
        return Ok(hash);
    }
    let value = Value::empty_hash();
    db.set(key.clone(), value.clone());
    match value {
        Value::Hash(h) => Ok(h),
        _ => unreachable!(),
    }
}

fn zset_of(
    db: &crate::keyspace::Database,
    key: &ByteString,
) -> StoreResult<Option<Arc<SortedSet>>> {
    match db.get(key) {
        None => Ok(None),
        Some(Value::ZSet(z)) => Ok(Some(z)),
        Some(_) => Err(StoreError::WrongType),
    }
}

fn zset_or_create(
    db: &crate::keyspace::Database,
    key: &ByteString,
) -> StoreResult<Arc<SortedSet>> {
    if let Some(zset) = zset_of(db, key)? {
        return Ok(zset);
    }
    let value = Value::empty_zset();
    db.set(key.clone(), value.clone());
    match value {
        Value::ZSet(z) => Ok(z),
        _ => unreachable!(),
    }
}

// =========================================================================
// Strings
// =========================================================================

fn cmd_get(ks: &Keyspace, conn: &mut ConnState, args: &[ByteString]) -> StoreResult<Outcome> {
    require(args, 2)?;
    let db = ks.db(conn.db_index);
    let reply = match str_of(db, &args[1])? {
        Some(s) => Reply::Bulk(s.load()),
        None => Reply::NullBulk,
    };
    Ok(Outcome::read(reply))
}

fn cmd_set(ks: &Keyspace, conn: &mut ConnState, args: &[ByteString]) -> StoreResult<Outcome> {
    require(args, 3)?;
    let db = ks.db(conn.db_index);
    db.set(args[1].clone(), Value::str_from(args[2].as_bytes()));
    Ok(Outcome::write(Reply::ok()))
}

fn cmd_append(ks: &Keyspace, conn: &mut ConnState, args: &[ByteString]) -> StoreResult<Outcome> {
    require(args, 3)?;
    let db = ks.db(conn.db_index);
    let new_len = match str_of(db, &args[1])? {
        Some(s) => s.append(args[2].as_bytes()),
        None => {
            db.set(args[1].clone(), Value::str_from(args[2].as_bytes()));
            args[2].len()
        }
    };
    Ok(Outcome::write(Reply::Int(new_len as i64)))
}

fn cmd_strlen(ks: &Keyspace, conn: &mut ConnState, args: &[ByteString]) -> StoreResult<Outcome> {
    require(args, 2)?;
    let db = ks.db(conn.db_index);
    let len = str_of(db, &args[1])?.map_or(0, |s| s.len());
    Ok(Outcome::read(Reply::Int(len as i64)))
}

fn incr_decr(ks: &Keyspace, conn: &mut ConnState, args: &[ByteString], delta: i64) -> StoreResult<Outcome> {
    let db = ks.db(conn.db_index);
    let current = match str_of(db, &args[1])? {
        Some(s) => s.load().parse_i64().ok_or(StoreError::NotAnInteger)?,
        None => 0,
    };
    let next = current.checked_add(delta).ok_or(StoreError::NotAnInteger)?;
    // Keep any TTL the key already carries.
    let expire = match db.ttl(&args[1]) {
        Ttl::Ms(remaining) => Some(now_ms() + remaining),
        _ => None,
    };
    db.set(args[1].clone(), Value::str_from(next.to_string().as_bytes()));
    if let Some(at) = expire {
        db.expire_at(&args[1], at);
    }
    Ok(Outcome::write(Reply::Int(next)))
}

fn cmd_incr(ks: &Keyspace, conn: &mut ConnState, args: &[ByteString]) -> StoreResult<Outcome> {
    require(args, 2)?;
    incr_decr(ks, conn, args, 1)
}

fn cmd_decr(ks: &Keyspace, conn: &mut ConnState, args: &[ByteString]) -> StoreResult<Outcome> {
    require(args, 2)?;
    incr_decr(ks, conn, args, -1)
}

fn cmd_incrby(ks: &Keyspace, conn: &mut ConnState, args: &[ByteString]) -> StoreResult<Outcome> {
    require(args, 3)?;
    let delta = int_arg(&args[2])?;
    incr_decr(ks, conn, args, delta)
}

// =========================================================================
// Keys
// =========================================================================

fn cmd_del(ks: &Keyspace, conn: &mut ConnState, args: &[ByteString]) -> StoreResult<Outcome> {
    require_at_least(args, 2)?;
    let db = ks.db(conn.db_index);
    let removed = args[1..].iter().filter(|key| db.remove(key)).count();
    Ok(Outcome::write_if(Reply::Int(removed as i64), removed > 0))
}

fn cmd_exists(ks: &Keyspace, conn: &mut ConnState, args: &[ByteString]) -> StoreResult<Outcome> {
    require_at_least(args, 2)?;
    let db = ks.db(conn.db_index);
    let found = args[1..].iter().filter(|key| db.contains(key)).count();
    Ok(Outcome::read(Reply::Int(found as i64)))
}

fn cmd_keys(ks: &Keyspace, conn: &mut ConnState, args: &[ByteString]) -> StoreResult<Outcome> {
    require(args, 2)?;
    let db = ks.db(conn.db_index);
    let pattern = args[1].as_bytes();
    let mut keys: Vec<ByteString> = db
        .keys()
        .into_iter()
        .filter(|key| glob_match(pattern, key.as_bytes()))
        .collect();
    keys.sort();
    let reply = Reply::Array(keys.into_iter().map(Reply::Bulk).collect());
    Ok(Outcome::read(reply))
}

fn cmd_type(ks: &Keyspace, conn: &mut ConnState, args: &[ByteString]) -> StoreResult<Outcome> {
    require(args, 2)?;
    let db = ks.db(conn.db_index);
    let name = match db.get(&args[1]) {
        Some(value) => value.type_name(),
        None => "none",
    };
    Ok(Outcome::read(Reply::Simple(name.to_string())))
}

fn expire_generic(ks: &Keyspace, conn: &mut ConnState, args: &[ByteString], at_ms: i64) -> StoreResult<Outcome> {
    let db = ks.db(conn.db_index);
    let applied = db.expire_at(&args[1], at_ms);
    Ok(Outcome::write_if(Reply::Int(applied as i64), applied))
}

fn cmd_expire(ks: &Keyspace, conn: &mut ConnState, args: &[ByteString]) -> StoreResult<Outcome> {
    require(args, 3)?;
    let seconds = int_arg(&args[2])?;
    expire_generic(ks, conn, args, now_ms() + seconds.saturating_mul(1000))
}

fn cmd_pexpire(ks: &Keyspace, conn: &mut ConnState, args: &[ByteString]) -> StoreResult<Outcome> {
    require(args, 3)?;
    let millis = int_arg(&args[2])?;
    expire_generic(ks, conn, args, now_ms() + millis)
}

fn cmd_pexpireat(ks: &Keyspace, conn: &mut ConnState, args: &[ByteString]) -> StoreResult<Outcome> {
    require(args, 3)?;
    let at_ms = int_arg(&args[2])?;
    expire_generic(ks, conn, args, at_ms)
}

fn cmd_ttl(ks: &Keyspace, conn: &mut ConnState, args: &[ByteString]) -> StoreResult<Outcome> {
    require(args, 2)?;
    let db = ks.db(conn.db_index);
    let reply = match db.ttl(&args[1]) {
        Ttl::Missing => Reply::Int(-2),
        Ttl::None => Reply::Int(-1),
        Ttl::Ms(ms) => Reply::Int((ms + 999) / 1000),
    };
    Ok(Outcome::read(reply))
}

fn cmd_pttl(ks: &Keyspace, conn: &mut ConnState, args: &[ByteString]) -> StoreResult<Outcome> {
    require(args, 2)?;
    let db = ks.db(conn.db_index);
    let reply = match db.ttl(&args[1]) {
        Ttl::Missing => Reply::Int(-2),
        Ttl::None => Reply::Int(-1),
        Ttl::Ms(ms) => Reply::Int(ms),
    };
    Ok(Outcome::read(reply))
}

fn cmd_persist(ks: &Keyspace, conn: &mut ConnState, args: &[ByteString]) -> StoreResult<Outcome> {
    require(args, 2)?;
    let db = ks.db(conn.db_index);
    let cleared = db.persist(&args[1]);
    Ok(Outcome::write_if(Reply::Int(cleared as i64), cleared))
}

fn cmd_dbsize(ks: &Keyspace, conn: &mut ConnState, args: &[ByteString]) -> StoreResult<Outcome> {
    require(args, 1)?;
    Ok(Outcome::read(Reply::Int(ks.db(conn.db_index).len() as i64)))
}

fn cmd_flushdb(ks: &Keyspace, conn: &mut ConnState, args: &[ByteString]) -> StoreResult<Outcome> {
    require(args, 1)?;
    ks.db(conn.db_index).clear();
    Ok(Outcome::write(Reply::ok()))
}

fn cmd_flushall(ks: &Keyspace, _conn: &mut ConnState, args: &[ByteString]) -> StoreResult<Outcome> {
    require(args, 1)?;
    ks.flush_all();
    Ok(Outcome::write(Reply::ok()))
}

fn cmd_select(ks: &Keyspace, conn: &mut ConnState, args: &[ByteString]) -> StoreResult<Outcome> {
    require(args, 2)?;
    let index = int_arg(&args[1])?;
    if index < 0 || index as usize >= ks.db_count() {
        return Err(StoreError::invalid("DB index is out of range"));
    }
    conn.db_index = index as usize;
    Ok(Outcome::read(Reply::ok()))
}

// =========================================================================
// Lists
// =========================================================================

fn push_generic(ks: &Keyspace, conn: &mut ConnState, args: &[ByteString], front: bool) -> StoreResult<Outcome> {
    require_at_least(args, 3)?;
    let db = ks.db(conn.db_index);
    let list = list_or_create(db, &args[1])?;
    let mut list = list.write();
    for item in &args[2..] {
        if front {
            list.push_front(item.clone());
        } else {
            list.push_back(item.clone());
        }
    }
    Ok(Outcome::write(Reply::Int(list.len() as i64)))
}

fn cmd_lpush(ks: &Keyspace, conn: &mut ConnState, args: &[ByteString]) -> StoreResult<Outcome> {
    push_generic(ks, conn, args, true)
}

fn cmd_rpush(ks: &Keyspace, conn: &mut ConnState, args: &[ByteString]) -> StoreResult<Outcome> {
    push_generic(ks, conn, args, false)
}

fn pop_generic(ks: &Keyspace, conn: &mut ConnState, args: &[ByteString], front: bool) -> StoreResult<Outcome> {
    require(args, 2)?;
    let db = ks.db(conn.db_index);
    let Some(list) = list_of(db, &args[1])? else {
        return Ok(Outcome::read(Reply::NullBulk));
    };
    let popped = {
        let mut list = list.write();
        if front {
            list.pop_front()
        } else {
            list.pop_back()
        }
    };
    match popped {
        Some(item) => {
            if list.read().is_empty() {
                db.remove(&args[1]);
            }
            Ok(Outcome::write(Reply::Bulk(item)))
        }
        None => Ok(Outcome::read(Reply::NullBulk)),
    }
}

fn cmd_lpop(ks: &Keyspace, conn: &mut ConnState, args: &[ByteString]) -> StoreResult<Outcome> {
    pop_generic(ks, conn, args, true)
}

fn cmd_rpop(ks: &Keyspace, conn: &mut ConnState, args: &[ByteString]) -> StoreResult<Outcome> {
    pop_generic(ks, conn, args, false)
}

fn cmd_llen(ks: &Keyspace, conn: &mut ConnState, args: &[ByteString]) -> StoreResult<Outcome> {
    require(args, 2)?;
    let db = ks.db(conn.db_index);
    let len = list_of(db, &args[1])?.map_or(0, |l| l.read().len());
    Ok(Outcome::read(Reply::Int(len as i64)))
}

fn cmd_lrange(ks: &Keyspace, conn: &mut ConnState, args: &[ByteString]) -> StoreResult<Outcome> {
    require(args, 4)?;
    let start = int_arg(&args[2])?;
    let stop = int_arg(&args[3])?;
    let db = ks.db(conn.db_index);
    let Some(list) = list_of(db, &args[1])? else {
        return Ok(Outcome::read(Reply::Array(Vec::new())));
    };
    let list = list.read();
    let items = match resolve_range(start, stop, list.len()) {
        Some((lo, hi)) => list
            .iter()
            .skip(lo)
            .take(hi - lo + 1)
            .cloned()
            .map(Reply::Bulk)
            .collect(),
        None => Vec::new(),
    };
    Ok(Outcome::read(Reply::Array(items)))
}

// =========================================================================
// Sets
// =========================================================================

fn cmd_sadd(ks: &Keyspace, conn: &mut ConnState, args: &[ByteString]) -> StoreResult<Outcome> {
    require_at_least(args, 3)?;
    let db = ks.db(conn.db_index);
    let set = set_or_create(db, &args[1])?;
    let added = args[2..]
        .iter()
        .filter(|member| set.put((*member).clone(), ()).is_none())
        .count();
    Ok(Outcome::write_if(Reply::Int(added as i64), added > 0))
}

fn cmd_srem(ks: &Keyspace, conn: &mut ConnState, args: &[ByteString]) -> StoreResult<Outcome> {
    require_at_least(args, 3)?;
    let db = ks.db(conn.db_index);
    let Some(set) = set_of(db, &args[1])? else {
        return Ok(Outcome::read(Reply::Int(0)));
    };
    let removed = args[2..]
        .iter()
        .filter(|member| set.remove(member).is_some())
        .count();
    if set.is_empty() {
        db.remove(&args[1]);
    }
    Ok(Outcome::write_if(Reply::Int(removed as i64), removed > 0))
}

fn cmd_sismember(ks: &Keyspace, conn: &mut ConnState, args: &[ByteString]) -> StoreResult<Outcome> {
    require(args, 3)?;
    let db = ks.db(conn.db_index);
    let present = set_of(db, &args[1])?.is_some_and(|set| set.contains(&args[2]));
    Ok(Outcome::read(Reply::Int(present as i64)))
}

fn cmd_smembers(ks: &Keyspace, conn: &mut ConnState, args: &[ByteString]) -> StoreResult<Outcome> {
    require(args, 2)?;
    let db = ks.db(conn.db_index);
    let mut members: Vec<ByteString> = match set_of(db, &args[1])? {
        Some(set) => set.entries().map(|(member, ())| member).collect(),
        None => Vec::new(),
    };
    members.sort();
    Ok(Outcome::read(Reply::Array(
        members.into_iter().map(Reply::Bulk).collect(),
    )))
}

fn cmd_scard(ks: &Keyspace, conn: &mut ConnState, args: &[ByteString]) -> StoreResult<Outcome> {
    require(args, 2)?;
    let db = ks.db(conn.db_index);
    let count = set_of(db, &args[1])?.map_or(0, |set| set.len());
    Ok(Outcome::read(Reply::Int(count as i64)))
}

// =========================================================================
// Hashes
// =========================================================================

fn cmd_hset(ks: &Keyspace, conn: &mut ConnState, args: &[ByteString]) -> StoreResult<Outcome> {
    require_at_least(args, 4)?;
    if (args.len() - 2) % 2 != 0 {
        return Err(StoreError::WrongArity(name_of(args)));
    }
    let db = ks.db(conn.db_index);
    let hash = hash_or_create(db, &args[1])?;
    let mut created = 0i64;
    for pair in args[2..].chunks_exact(2) {
        if hash.put(pair[0].clone(), pair[1].clone()).is_none() {
            created += 1;
        }
    }
    Ok(Outcome::write(Reply::Int(created)))
}

fn cmd_hget(ks: &Keyspace, conn: &mut ConnState, args: &[ByteString]) -> StoreResult<Outcome> {
    require(args, 3)?;
    let db = ks.db(conn.db_index);
    let reply = match hash_of(db, &args[1])?.and_then(|hash| hash.get(&args[2])) {
        Some(value) => Reply::Bulk(value),
        None => Reply::NullBulk,
    };
    Ok(Outcome::read(reply))
}

fn cmd_hdel(ks: &Keyspace, conn: &mut ConnState, args: &[ByteString]) -> StoreResult<Outcome> {
    require_at_least(args, 3)?;
    let db = ks.db(conn.db_index);
    let Some(hash) = hash_of(db, &args[1])? else {
        return Ok(Outcome::read(Reply::Int(0)));
    };
    let removed = args[2..]
        .iter()
        .filter(|field| hash.remove(field).is_some())
        .count();
    if hash.is_empty() {
        db.remove(&args[1]);
    }
    Ok(Outcome::write_if(Reply::Int(removed as i64), removed > 0))
}

fn cmd_hexists(ks: &Keyspace, conn: &mut ConnState, args: &[ByteString]) -> StoreResult<Outcome> {
    require(args, 3)?;
    let db = ks.db(conn.db_index);
    let present = hash_of(db, &args[1])?.is_some_and(|hash| hash.contains(&args[2]));
    Ok(Outcome::read(Reply::Int(present as i64)))
}

fn cmd_hlen(ks: &Keyspace, conn: &mut ConnState, args: &[ByteString]) -> StoreResult<Outcome> {
    require(args, 2)?;
    let db = ks.db(conn.db_index);
    let count = hash_of(db, &args[1])?.map_or(0, |hash| hash.len());
    Ok(Outcome::read(Reply::Int(count as i64)))
}

fn cmd_hgetall(ks: &Keyspace, conn: &mut ConnState, args: &[ByteString]) -> StoreResult<Outcome> {
    require(args, 2)?;
    let db = ks.db(conn.db_index);
    let mut pairs: Vec<(ByteString, ByteString)> = match hash_of(db, &args[1])? {
        Some(hash) => hash.entries().collect(),
        None => Vec::new(),
    };
    pairs.sort_by(|a, b| a.0.cmp(&b.0));
    let mut items = Vec::with_capacity(pairs.len() * 2);
    for (field, value) in pairs {
        items.push(Reply::Bulk(field));
        items.push(Reply::Bulk(value));
    }
    Ok(Outcome::read(Reply::Array(items)))
}

fn cmd_hkeys(ks: &Keyspace, conn: &mut ConnState, args: &[ByteString]) -> StoreResult<Outcome> {
    require(args, 2)?;
    let db = ks.db(conn.db_index);
    let mut fields: Vec<ByteString> = match hash_of(db, &args[1])? {
        Some(hash) => hash.entries().map(|(field, _)| field).collect(),
        None => Vec::new(),
    };
    fields.sort();
    Ok(Outcome::read(Reply::Array(
        fields.into_iter().map(Reply::Bulk).collect(),
    )))
}

fn cmd_hvals(ks: &Keyspace, conn: &mut ConnState, args: &[ByteString]) -> StoreResult<Outcome> {
    require(args, 2)?;
    let db = ks.db(conn.db_index);
    let mut pairs: Vec<(ByteString, ByteString)> = match hash_of(db, &args[1])? {
        Some(hash) => hash.entries().collect(),
        None => Vec::new(),
    };
    pairs.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(Outcome::read(Reply::Array(
        pairs.into_iter().map(|(_, value)| Reply::Bulk(value)).collect(),
    )))
}

// =========================================================================
// Sorted sets
// =========================================================================

fn cmd_zadd(ks: &Keyspace, conn: &mut ConnState, args: &[ByteString]) -> StoreResult<Outcome> {
    require_at_least(args, 4)?;
    if (args.len() - 2) % 2 != 0 {
        return Err(StoreError::invalid("syntax error"));
    }
    let db = ks.db(conn.db_index);
    let zset = zset_or_create(db, &args[1])?;
    let mut added = 0i64;
    for pair in args[2..].chunks_exact(2) {
        let score = score_arg(&pair[0])?;
        if zset.add(pair[1].clone(), score) {
            added += 1;
        }
    }
    Ok(Outcome::write(Reply::Int(added)))
}

fn cmd_zrem(ks: &Keyspace, conn: &mut ConnState, args: &[ByteString]) -> StoreResult<Outcome> {
    require_at_least(args, 3)?;
    let db = ks.db(conn.db_index);
    let Some(zset) = zset_of(db, &args[1])? else {
        return Ok(Outcome::read(Reply::Int(0)));
    };
    let removed = args[2..].iter().filter(|member| zset.remove(member)).count();
    if zset.is_empty() {
        db.remove(&args[1]);
    }
    Ok(Outcome::write_if(Reply::Int(removed as i64), removed > 0))
}

fn cmd_zscore(ks: &Keyspace, conn: &mut ConnState, args: &[ByteString]) -> StoreResult<Outcome> {
    require(args, 3)?;
    let db = ks.db(conn.db_index);
    let reply = match zset_of(db, &args[1])?.and_then(|zset| zset.score(&args[2])) {
        Some(score) => Reply::Bulk(ByteString::from_string(fmt_score(score))),
        None => Reply::NullBulk,
    };
    Ok(Outcome::read(reply))
}

fn cmd_zcard(ks: &Keyspace, conn: &mut ConnState, args: &[ByteString]) -> StoreResult<Outcome> {
    require(args, 2)?;
    let db = ks.db(conn.db_index);
    let count = zset_of(db, &args[1])?.map_or(0, |zset| zset.len());
    Ok(Outcome::read(Reply::Int(count as i64)))
}

fn cmd_zrank(ks: &Keyspace, conn: &mut ConnState, args: &[ByteString]) -> StoreResult<Outcome> {
    require(args, 3)?;
    let db = ks.db(conn.db_index);
    let reply = match zset_of(db, &args[1])?.and_then(|zset| zset.rank(&args[2])) {
        Some(rank) => Reply::Int(rank as i64),
        None => Reply::NullBulk,
    };
    Ok(Outcome::read(reply))
}

fn with_scores_flag(args: &[ByteString], at: usize) -> StoreResult<bool> {
    match args.len() - at {
        0 => Ok(false),
        1 if args[at].equals_ignore_case_ascii(&ByteString::from("WITHSCORES")) => Ok(true),
        _ => Err(StoreError::invalid("syntax error")),
    }
}

fn scored_reply(entries: Vec<(f64, ByteString)>, with_scores: bool) -> Reply {
    let mut items = Vec::with_capacity(entries.len() * if with_scores { 2 } else { 1 });
    for (score, member) in entries {
        items.push(Reply::Bulk(member));
        if with_scores {
            items.push(Reply::Bulk(ByteString::from_string(fmt_score(score))));
        }
    }
    Reply::Array(items)
}

fn cmd_zrange(ks: &Keyspace, conn: &mut ConnState, args: &[ByteString]) -> StoreResult<Outcome> {
    require_at_least(args, 4)?;
    let with_scores = with_scores_flag(args, 4)?;
    let start = int_arg(&args[2])?;
    let stop = int_arg(&args[3])?;
    let db = ks.db(conn.db_index);
    let Some(zset) = zset_of(db, &args[1])? else {
        return Ok(Outcome::read(Reply::Array(Vec::new())));
    };
    let entries = match resolve_range(start, stop, zset.len()) {
        Some((lo, hi)) => zset.range_by_rank(lo + 1, hi + 1),
        None => Vec::new(),
    };
    Ok(Outcome::read(scored_reply(entries, with_scores)))
}

fn cmd_zrangebyscore(ks: &Keyspace, conn: &mut ConnState, args: &[ByteString]) -> StoreResult<Outcome> {
    require_at_least(args, 4)?;
    let with_scores = with_scores_flag(args, 4)?;
    let min = score_arg(&args[2])?;
    let max = score_arg(&args[3])?;
    let db = ks.db(conn.db_index);
    let Some(zset) = zset_of(db, &args[1])? else {
        return Ok(Outcome::read(Reply::Array(Vec::new())));
    };
    Ok(Outcome::read(scored_reply(
        zset.range_by_score(min, max),
        with_scores,
    )))
}

// =========================================================================
// Connection
// =========================================================================

fn cmd_ping(_ks: &Keyspace, _conn: &mut ConnState, args: &[ByteString]) -> StoreResult<Outcome> {
    match args.len() {
        1 => Ok(Outcome::read(Reply::Simple("PONG".to_string()))),
        2 => Ok(Outcome::read(Reply::Bulk(args[1].clone()))),
        _ => Err(StoreError::WrongArity(name_of(args))),
    }
}

fn cmd_echo(_ks: &Keyspace, _conn: &mut ConnState, args: &[ByteString]) -> StoreResult<Outcome> {
    require(args, 2)?;
    Ok(Outcome::read(Reply::Bulk(args[1].clone())))
}

// =========================================================================
// Glob matching for KEYS
// =========================================================================

/// `*`, `?`, and `\`-escape glob match over raw bytes.
fn glob_match(pattern: &[u8], text: &[u8]) -> bool {
    let (mut p, mut t) = (0usize, 0usize);
    let (mut star_p, mut star_t) = (usize::MAX, 0usize);
    while t < text.len() {
        let matched = match pattern.get(p) {
            Some(b'*') => {
                star_p = p;
                star_t = t;
                p += 1;
                continue;
            }
            Some(b'?') => true,
            Some(b'\\') if p + 1 < pattern.len() => {
                let lit = pattern[p + 1];
                if lit == text[t] {
                    p += 1;
                    true
                } else {
                    false
                }
            }
            Some(&c) => c == text[t],
            None => false,
        };
        if matched {
            p += 1;
            t += 1;
        } else if star_p != usize::MAX {
            // Backtrack: let the last * absorb one more byte.
            p = star_p + 1;
            star_t += 1;
            t = star_t;
        } else {
            return false;
        }
    }
    while pattern.get(p) == Some(&b'*') {
        p += 1;
    }
    p == pattern.len()
}
