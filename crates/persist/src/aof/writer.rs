//! Asynchronous batched log writer.
//!
//! Producers enqueue already-encoded command bytes onto a bounded queue; a
//! dedicated writer thread pulls batches, consolidates them into one buffer,
//! and issues a single write syscall per batch. The queue is bounded in both
//! items and bytes — when either bound is hit the enqueue blocks, which is
//! the backpressure that ties command-thread speed to disk speed.
//!
//! Oversized commands (≥ the direct-write threshold) are never copied into a
//! batch buffer; they are written alone straight from their own allocation.
//!
//! The file is pre-allocated in fixed chunks so steady-state appends never
//! extend the inode; on clean shutdown it is truncated back to the logical
//! tail. A live-file I/O failure poisons the writer: queued data is dropped
//! and every later enqueue fails until the process restarts.

use super::config::{AofConfig, FsyncPolicy};
use crate::error::{PersistError, PersistResult};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// Pre-allocated append-only file tracking its logical tail.
pub(crate) struct LogFile {
    file: File,
    logical: u64,
    allocated: u64,
    chunk: u64,
}

impl LogFile {
    /// Open (creating if needed) with the logical tail pinned at `tail`.
    ///
    /// Recovery determines the tail; bytes past it are pre-allocation
    /// padding or a torn record and are overwritten by the next append.
    pub(crate) fn open(path: &Path, tail: u64, chunk: u64) -> std::io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)?;
        let allocated = file.metadata()?.len();
        let mut log = LogFile {
            file,
            logical: tail.min(allocated),
            allocated,
            chunk: chunk.max(1),
        };
        log.ensure_allocated(log.chunk)?;
        Ok(log)
    }

    fn ensure_allocated(&mut self, needed: u64) -> std::io::Result<()> {
        if needed <= self.allocated {
            return Ok(());
        }
        let chunks = (needed + self.chunk - 1) / self.chunk;
        let target = chunks * self.chunk;
        self.file.set_len(target)?;
        self.allocated = target;
        Ok(())
    }

    fn append(&mut self, buf: &[u8]) -> std::io::Result<()> {
        self.ensure_allocated(self.logical + buf.len() as u64)?;
        self.file.seek(SeekFrom::Start(self.logical))?;
        self.file.write_all(buf)?;
        self.logical += buf.len() as u64;
        Ok(())
    }

    fn sync(&mut self) -> std::io::Result<()> {
        self.file.sync_data()
    }

    /// Truncate away the pre-allocation padding and sync.
    fn close_clean(mut self) -> std::io::Result<()> {
        self.file.set_len(self.logical)?;
        self.file.sync_all()
    }
}

/// Request to retarget the writer at a freshly rewritten file.
struct SwitchRequest {
    path: PathBuf,
    tail: u64,
}

struct WriterState {
    queue: VecDeque<Vec<u8>>,
    pending_bytes: usize,
    /// Writer is mid-batch; drain waiters must keep waiting.
    in_flight: bool,
    switch_request: Option<SwitchRequest>,
    closed: bool,
    /// Live-file failure message; poisons every later enqueue.
    failed: Option<String>,
}

struct Shared {
    state: Mutex<WriterState>,
    /// Wakes the writer thread.
    work_ready: Condvar,
    /// Wakes producers and drain/switch waiters.
    state_changed: Condvar,
    config: AofConfig,
}

/// Handle to the batched log writer thread.
pub struct LogWriter {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl LogWriter {
    /// Open the log file at `tail` and start the writer thread.
    pub fn start(path: &Path, tail: u64, config: AofConfig) -> PersistResult<LogWriter> {
        let file = LogFile::open(path, tail, config.preallocate_bytes)?;
        let shared = Arc::new(Shared {
            state: Mutex::new(WriterState {
                queue: VecDeque::new(),
                pending_bytes: 0,
                in_flight: false,
                switch_request: None,
                closed: false,
                failed: None,
            }),
            work_ready: Condvar::new(),
            state_changed: Condvar::new(),
            config,
        });
        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name("ember-aof".to_string())
            .spawn(move || writer_loop(worker_shared, file))?;
        Ok(LogWriter {
            shared,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Enqueue encoded command bytes, blocking under backpressure.
    pub fn enqueue(&self, bytes: Vec<u8>) -> PersistResult<()> {
        let shared = &self.shared;
        let mut state = shared.state.lock();
        loop {
            if let Some(message) = &state.failed {
                return Err(PersistError::WriterClosed(message.clone()));
            }
            if state.closed {
                return Err(PersistError::WriterClosed("writer shut down".to_string()));
            }
            let over_items = state.queue.len() >= shared.config.queue_items_max;
            let over_bytes =
                state.pending_bytes + bytes.len() > shared.config.queue_bytes_max;
            if !over_items && !over_bytes {
                break;
            }
            shared.state_changed.wait(&mut state);
        }
        state.pending_bytes += bytes.len();
        state.queue.push_back(bytes);
        shared.work_ready.notify_one();
        Ok(())
    }

    /// Block until everything enqueued so far has hit the file.
    pub fn drain(&self) -> PersistResult<()> {
        let shared = &self.shared;
        let mut state = shared.state.lock();
        while !state.queue.is_empty() || state.in_flight {
            if let Some(message) = &state.failed {
                return Err(PersistError::WriterClosed(message.clone()));
            }
            shared.state_changed.wait(&mut state);
        }
        Ok(())
    }

    /// Retarget the writer at the rewritten file (same path, new inode).
    ///
    /// The caller must have drained the queue first; the old handle is
    /// dropped without truncation since its inode has been renamed over.
    pub fn switch_to(&self, path: &Path, tail: u64) -> PersistResult<()> {
        let shared = &self.shared;
        let mut state = shared.state.lock();
        state.switch_request = Some(SwitchRequest {
            path: path.to_path_buf(),
            tail,
        });
        shared.work_ready.notify_one();
        while state.switch_request.is_some() {
            if let Some(message) = &state.failed {
                return Err(PersistError::WriterClosed(message.clone()));
            }
            if state.closed {
                return Err(PersistError::WriterClosed("writer shut down".to_string()));
            }
            shared.state_changed.wait(&mut state);
        }
        Ok(())
    }

    /// Bytes currently queued (diagnostics).
    pub fn pending_bytes(&self) -> usize {
        self.shared.state.lock().pending_bytes
    }

    /// Stop the writer: drain the queue, truncate to the logical tail, sync.
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock();
            state.closed = true;
            self.shared.work_ready.notify_one();
            self.shared.state_changed.notify_all();
        }
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                error!(target: "ember::aof", "log writer thread panicked");
            }
        }
    }
}

impl Drop for LogWriter {
    fn drop(&mut self) {
        self.shutdown();
    }
}

enum Work {
    /// Consolidated small commands.
    Batch(Vec<Vec<u8>>),
    /// One oversized command, written without copying.
    Direct(Vec<u8>),
}

fn writer_loop(shared: Arc<Shared>, mut file: LogFile) {
    let config = &shared.config;
    let mut last_sync = Instant::now();
    let mut unsynced = false;

    loop {
        let work = {
            let mut state = shared.state.lock();
            loop {
                if let Some(request) = state.switch_request.take() {
                    match LogFile::open(&request.path, request.tail, config.preallocate_bytes) {
                        Ok(new_file) => {
                            // Old inode was renamed over; drop without
                            // truncating it.
                            file = new_file;
                            unsynced = false;
                            state.failed = None;
                        }
                        Err(e) => {
                            state.failed = Some(format!("switch failed: {}", e));
                            error!(target: "ember::aof", error = %e, "log switch failed");
                        }
                    }
                    shared.state_changed.notify_all();
                    continue;
                }
                if !state.queue.is_empty() {
                    break;
                }
                if state.closed {
                    drop(state);
                    if let Err(e) = file.close_clean() {
                        error!(target: "ember::aof", error = %e, "clean close failed");
                    }
                    return;
                }
                let timeout = Duration::from_millis(config.flush_interval_ms.max(1));
                let timed_out = shared
                    .work_ready
                    .wait_for(&mut state, timeout)
                    .timed_out();
                if timed_out && unsynced && config.fsync == FsyncPolicy::EverySec {
                    // Periodic sync with an idle queue.
                    if let Err(e) = file.sync() {
                        record_failure(&mut state, e.to_string());
                    } else {
                        unsynced = false;
                        last_sync = Instant::now();
                    }
                }
            }
            let work = pop_work(&mut state, config);
            state.in_flight = true;
            work
        };

        let started = Instant::now();
        let (written_bytes, write_result) = match &work {
            Work::Batch(items) => {
                let total: usize = items.iter().map(|b| b.len()).sum();
                let mut buffer = Vec::with_capacity(total);
                for item in items {
                    buffer.extend_from_slice(item);
                }
                (total, file.append(&buffer))
            }
            Work::Direct(item) => (item.len(), file.append(item)),
        };

        let sync_result = match (&write_result, config.fsync) {
            (Ok(()), FsyncPolicy::Always) => {
                let r = file.sync();
                if r.is_ok() {
                    unsynced = false;
                    last_sync = Instant::now();
                }
                r
            }
            (Ok(()), FsyncPolicy::EverySec) => {
                unsynced = true;
                if last_sync.elapsed() >= Duration::from_millis(config.flush_interval_ms) {
                    let r = file.sync();
                    if r.is_ok() {
                        unsynced = false;
                        last_sync = Instant::now();
                    }
                    r
                } else {
                    Ok(())
                }
            }
            (Ok(()), FsyncPolicy::No) => Ok(()),
            (Err(_), _) => Ok(()),
        };

        let elapsed = started.elapsed();
        if elapsed >= Duration::from_millis(config.slow_write_warn_ms) {
            warn!(
                target: "ember::aof",
                bytes = written_bytes,
                elapsed_ms = elapsed.as_millis() as u64,
                "slow log write"
            );
        }

        let mut state = shared.state.lock();
        state.pending_bytes -= written_bytes;
        state.in_flight = false;
        if let Err(e) = write_result.and(sync_result) {
            record_failure(&mut state, e.to_string());
        } else {
            debug!(target: "ember::aof", bytes = written_bytes, "batch written");
        }
        shared.state_changed.notify_all();
    }
}

/// Pop the next unit of work: either one oversized command, or up to
/// `batch_items_max` small commands stopping short of any oversized one.
fn pop_work(state: &mut WriterState, config: &AofConfig) -> Work {
    let first = state.queue.pop_front().expect("queue checked non-empty");
    if first.len() >= config.direct_write_bytes {
        return Work::Direct(first);
    }
    let mut items = vec![first];
    while items.len() < config.batch_items_max {
        match state.queue.front() {
            Some(next) if next.len() < config.direct_write_bytes => {
                items.push(state.queue.pop_front().expect("front checked"));
            }
            _ => break,
        }
    }
    Work::Batch(items)
}

fn record_failure(state: &mut WriterState, message: String) {
    error!(target: "ember::aof", error = %message, "live log file failure, refusing further writes");
    state.failed = Some(message);
    // Queued data cannot be trusted to land; drop it so producers unblock
    // into the error path.
    state.pending_bytes = 0;
    state.queue.clear();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_logical(path: &Path, writer: &LogWriter) -> Vec<u8> {
        writer.drain().unwrap();
        // The file still carries pre-allocation padding; compare prefixes.
        std::fs::read(path).unwrap()
    }

    #[test]
    fn test_appends_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.aof");
        let writer = LogWriter::start(&path, 0, AofConfig::for_testing()).unwrap();

        writer.enqueue(b"*1\r\n$4\r\nPING\r\n".to_vec()).unwrap();
        writer.enqueue(b"*1\r\n$4\r\nECHO\r\n".to_vec()).unwrap();
        let contents = read_logical(&path, &writer);
        assert!(contents.starts_with(b"*1\r\n$4\r\nPING\r\n*1\r\n$4\r\nECHO\r\n"));
    }

    #[test]
    fn test_preallocation_and_clean_truncate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.aof");
        let payload = b"*1\r\n$4\r\nPING\r\n".to_vec();
        {
            let writer = LogWriter::start(&path, 0, AofConfig::for_testing()).unwrap();
            writer.enqueue(payload.clone()).unwrap();
            writer.drain().unwrap();
            // Pre-allocated beyond the logical tail while open.
            assert_eq!(
                std::fs::metadata(&path).unwrap().len(),
                AofConfig::for_testing().preallocate_bytes
            );
            writer.shutdown();
        }
        // Truncated to the real tail on clean close.
        assert_eq!(
            std::fs::metadata(&path).unwrap().len(),
            payload.len() as u64
        );
    }

    #[test]
    fn test_file_grows_in_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.aof");
        let config = AofConfig::for_testing().with_preallocate_bytes(1024);
        let writer = LogWriter::start(&path, 0, config).unwrap();

        let item = vec![b'x'; 700];
        writer.enqueue(item.clone()).unwrap();
        writer.drain().unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 1024);

        writer.enqueue(item).unwrap();
        writer.drain().unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 2048);
    }

    #[test]
    fn test_oversized_item_written_correctly() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.aof");
        let config = AofConfig::for_testing();
        let oversized = vec![b'y'; config.direct_write_bytes + 1];
        let writer = LogWriter::start(&path, 0, config).unwrap();

        writer.enqueue(b"small".to_vec()).unwrap();
        writer.enqueue(oversized.clone()).unwrap();
        writer.enqueue(b"after".to_vec()).unwrap();
        writer.drain().unwrap();

        let contents = std::fs::read(&path).unwrap();
        let mut expected = b"small".to_vec();
        expected.extend_from_slice(&oversized);
        expected.extend_from_slice(b"after");
        assert!(contents.starts_with(&expected));
    }

    #[test]
    fn test_resume_at_tail_overwrites_padding() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.aof");
        {
            let writer = LogWriter::start(&path, 0, AofConfig::for_testing()).unwrap();
            writer.enqueue(b"first".to_vec()).unwrap();
            writer.drain().unwrap();
            writer.shutdown();
        }
        {
            let writer = LogWriter::start(&path, 5, AofConfig::for_testing()).unwrap();
            writer.enqueue(b"second".to_vec()).unwrap();
            writer.drain().unwrap();
            writer.shutdown();
        }
        let contents = std::fs::read(&path).unwrap();
        assert_eq!(contents, b"firstsecond");
    }

    #[test]
    fn test_backpressure_blocks_then_releases() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.aof");
        let config = AofConfig::for_testing().with_queue_items_max(2);
        let writer = Arc::new(LogWriter::start(&path, 0, config).unwrap());

        // Saturate, then push from another thread; it must complete once
        // the writer drains the queue.
        for _ in 0..2 {
            writer.enqueue(b"x".to_vec()).unwrap();
        }
        let producer = {
            let writer = Arc::clone(&writer);
            std::thread::spawn(move || {
                for _ in 0..20 {
                    writer.enqueue(b"y".to_vec()).unwrap();
                }
            })
        };
        producer.join().unwrap();
        writer.drain().unwrap();
        let contents = std::fs::read(&path).unwrap();
        assert_eq!(contents.iter().filter(|&&b| b == b'y').count(), 20);
    }

    #[test]
    fn test_enqueue_after_shutdown_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.aof");
        let writer = LogWriter::start(&path, 0, AofConfig::for_testing()).unwrap();
        writer.shutdown();
        assert!(matches!(
            writer.enqueue(b"late".to_vec()),
            Err(PersistError::WriterClosed(_))
        ));
    }
}
