//! Crash-safe snapshot writer.
//!
//! Uses the write-fsync-rename pattern: the image is written to a temporary
//! file behind a streaming checksum writer, fsynced, atomically renamed over
//! the final path, and the parent directory is fsynced. Either the complete
//! snapshot exists or the previous one is untouched.
//!
//! A background save captures per-database dict snapshots on the calling
//! thread (the consistency point) and serialises them on a worker thread, so
//! command execution never blocks on disk. At most one save runs per engine;
//! a non-reentrant guard refuses concurrent attempts.

use super::{
    write_bytes, write_length, HEADER, OPCODE_EOF, OPCODE_EXPIRE_MS, OPCODE_SELECT_DB,
    TYPE_HASH, TYPE_LIST, TYPE_SET, TYPE_STRING, TYPE_ZSET,
};
use crate::error::{PersistError, PersistResult};
use byteorder::{BigEndian, LittleEndian, WriteBytesExt};
use ember_core::{ByteString, Crc64};
use ember_dict::DictSnapshot;
use ember_store::{now_ms, Keyspace, Stored, Value};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{info, warn};

/// Writer adapter feeding every byte through the checksum.
struct ChecksumWriter<W: Write> {
    inner: W,
    crc: Crc64,
}

impl<W: Write> ChecksumWriter<W> {
    fn new(inner: W) -> Self {
        ChecksumWriter {
            inner,
            crc: Crc64::new(),
        }
    }

    fn digest(&self) -> u64 {
        self.crc.finalize()
    }

    fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for ChecksumWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let written = self.inner.write(buf)?;
        self.crc.update(&buf[..written]);
        Ok(written)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// Result of a completed save.
#[derive(Debug, Clone)]
pub struct SaveReport {
    /// Live keys written.
    pub keys_written: usize,
    /// Databases with at least one live key.
    pub dbs_written: usize,
    /// Final file path.
    pub path: PathBuf,
    /// Checksum written to the footer.
    pub crc: u64,
}

/// A consistent capture of the keyspace, taken under the dict locks.
type Capture = Vec<(usize, DictSnapshot<ByteString, Stored>)>;

fn capture_keyspace(keyspace: &Keyspace) -> Capture {
    keyspace
        .databases()
        .iter()
        .map(|db| (db.index(), db.snapshot()))
        .collect()
}

/// Snapshot engine bound to one file path.
pub struct SnapshotEngine {
    path: PathBuf,
    saving: Arc<AtomicBool>,
    cancel: Arc<AtomicBool>,
}

impl SnapshotEngine {
    /// Create an engine writing to `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        SnapshotEngine {
            path: path.into(),
            saving: Arc::new(AtomicBool::new(false)),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The snapshot file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether a save is currently running.
    pub fn save_in_progress(&self) -> bool {
        self.saving.load(Ordering::Acquire)
    }

    /// Request cancellation of an in-flight background save.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Release);
    }

    /// Synchronous save on the calling thread.
    pub fn save(&self, keyspace: &Keyspace) -> PersistResult<SaveReport> {
        let _guard = SaveGuard::acquire(&self.saving)?;
        self.cancel.store(false, Ordering::Release);
        let capture = capture_keyspace(keyspace);
        write_capture_to_path(&self.path, &capture, &self.cancel)
    }

    /// Capture now, serialise on a background thread.
    ///
    /// The returned handle yields the save report; the guard is held until
    /// the worker finishes.
    pub fn save_in_background(
        &self,
        keyspace: &Keyspace,
    ) -> PersistResult<JoinHandle<PersistResult<SaveReport>>> {
        let guard = SaveGuard::acquire(&self.saving)?;
        self.cancel.store(false, Ordering::Release);
        let capture = capture_keyspace(keyspace);
        let path = self.path.clone();
        let cancel = Arc::clone(&self.cancel);
        let handle = std::thread::Builder::new()
            .name("ember-bgsave".to_string())
            .spawn(move || {
                let _guard = guard;
                write_capture_to_path(&path, &capture, &cancel)
            })?;
        Ok(handle)
    }
}

/// Non-reentrant save guard; releases on drop.
struct SaveGuard {
    flag: Arc<AtomicBool>,
}

impl SaveGuard {
    fn acquire(flag: &Arc<AtomicBool>) -> PersistResult<Self> {
        if flag
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(PersistError::SaveInProgress);
        }
        Ok(SaveGuard {
            flag: Arc::clone(flag),
        })
    }
}

impl Drop for SaveGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

fn write_capture_to_path(
    path: &Path,
    capture: &Capture,
    cancel: &AtomicBool,
) -> PersistResult<SaveReport> {
    let temp_path = temp_path_for(path);
    let result = write_capture_to_temp(&temp_path, path, capture, cancel);
    if result.is_err() {
        // Best effort: a failed or cancelled save must not leave the temp
        // file behind.
        let _ = std::fs::remove_file(&temp_path);
    }
    result
}

fn write_capture_to_temp(
    temp_path: &Path,
    final_path: &Path,
    capture: &Capture,
    cancel: &AtomicBool,
) -> PersistResult<SaveReport> {
    let file = OpenOptions::new()
        .create(true)
        .truncate(true)
        .write(true)
        .open(temp_path)?;
    let mut out = ChecksumWriter::new(std::io::BufWriter::new(file));

    let (keys_written, dbs_written) = write_image(&mut out, capture, Some(cancel))?;
    let crc = out.digest();
    let mut inner = out.into_inner();
    inner.write_u64::<LittleEndian>(crc)?;
    let file = inner
        .into_inner()
        .map_err(|e| PersistError::Io(e.into_error()))?;
    file.sync_all()?;
    drop(file);

    std::fs::rename(temp_path, final_path)?;
    if let Some(dir) = final_path.parent() {
        if !dir.as_os_str().is_empty() {
            File::open(dir)?.sync_all()?;
        }
    }

    info!(
        target: "ember::rdb",
        keys = keys_written,
        dbs = dbs_written,
        path = %final_path.display(),
        "snapshot written"
    );
    Ok(SaveReport {
        keys_written,
        dbs_written,
        path: final_path.to_path_buf(),
        crc,
    })
}

/// Serialise the keyspace into an in-memory image (full-sync blob).
pub fn serialize_keyspace(keyspace: &Keyspace) -> PersistResult<Vec<u8>> {
    let capture = capture_keyspace(keyspace);
    let mut out = ChecksumWriter::new(Vec::new());
    write_image(&mut out, &capture, None)?;
    let crc = out.digest();
    let mut bytes = out.into_inner();
    bytes.write_u64::<LittleEndian>(crc)?;
    Ok(bytes)
}

/// Emit header, databases, EOF opcode. Returns (keys, non-empty dbs).
fn write_image<W: Write>(
    out: &mut ChecksumWriter<W>,
    capture: &Capture,
    cancel: Option<&AtomicBool>,
) -> PersistResult<(usize, usize)> {
    let now = now_ms();
    let mut keys_written = 0usize;
    let mut dbs_written = 0usize;

    out.write_all(HEADER)?;
    for (db_index, snapshot) in capture {
        if let Some(cancel) = cancel {
            if cancel.load(Ordering::Acquire) {
                warn!(target: "ember::rdb", "snapshot write cancelled");
                return Err(PersistError::Cancelled);
            }
        }
        // Expired keys are skipped eagerly; an effectively-empty database
        // is omitted entirely.
        let live: Vec<(&ByteString, &Stored)> = snapshot
            .iter()
            .filter(|(_, stored)| !stored.is_expired(now))
            .collect();
        if live.is_empty() {
            continue;
        }
        dbs_written += 1;
        out.write_u8(OPCODE_SELECT_DB)?;
        write_length(out, *db_index)?;
        for (key, stored) in live {
            write_entry(out, key, stored)?;
            keys_written += 1;
        }
    }
    out.write_u8(OPCODE_EOF)?;
    Ok((keys_written, dbs_written))
}

fn write_entry<W: Write>(
    out: &mut W,
    key: &ByteString,
    stored: &Stored,
) -> PersistResult<()> {
    if stored.expire_at_ms >= 0 {
        out.write_u8(OPCODE_EXPIRE_MS)?;
        out.write_i64::<LittleEndian>(stored.expire_at_ms)?;
    }
    match &stored.value {
        Value::Str(s) => {
            out.write_u8(TYPE_STRING)?;
            write_bytes(out, key.as_bytes())?;
            write_bytes(out, s.load().as_bytes())?;
        }
        Value::List(list) => {
            out.write_u8(TYPE_LIST)?;
            write_bytes(out, key.as_bytes())?;
            let items: Vec<ByteString> = list.read().iter().cloned().collect();
            write_length(out, items.len())?;
            for item in &items {
                write_bytes(out, item.as_bytes())?;
            }
        }
        Value::Set(set) => {
            out.write_u8(TYPE_SET)?;
            write_bytes(out, key.as_bytes())?;
            let members: Vec<ByteString> = set.entries().map(|(member, ())| member).collect();
            write_length(out, members.len())?;
            for member in &members {
                write_bytes(out, member.as_bytes())?;
            }
        }
        Value::ZSet(zset) => {
            out.write_u8(TYPE_ZSET)?;
            write_bytes(out, key.as_bytes())?;
            let entries = zset.entries();
            write_length(out, entries.len())?;
            for (score, member) in &entries {
                write_bytes(out, member.as_bytes())?;
                out.write_f64::<BigEndian>(*score)?;
            }
        }
        Value::Hash(hash) => {
            out.write_u8(TYPE_HASH)?;
            write_bytes(out, key.as_bytes())?;
            let pairs: Vec<(ByteString, ByteString)> = hash.entries().collect();
            write_length(out, pairs.len())?;
            for (field, value) in &pairs {
                write_bytes(out, field.as_bytes())?;
                write_bytes(out, value.as_bytes())?;
            }
        }
    }
    Ok(())
}

fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "snapshot".into());
    name.push(".tmp");
    path.with_file_name(name)
}
