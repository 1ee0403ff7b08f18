//! The rotating writer: public API plus the write and sync loops.
//!
//! ## Architecture
//!
//! ```text
//!  producers ──publish──▶ StagingRing ──try_pop──▶ write loop
//!                                                    │   │
//!                                          WriteBuffer│   │SyncJob
//!                                                    ▼   ▼
//!                                             active file  sync loop
//!                                                          (flush-range /
//!                                                           drop-cache /
//!                                                           close)
//! ```
//!
//! Producers never touch the disk: [`Rotation::write`] publishes into the
//! lock-free staging ring and returns. A dedicated write-loop thread drains
//! the ring into the buffered writer, counts the bytes that reach the
//! active file, emits writeback jobs every `per_sync_size` bytes, and
//! rotates the file when `max_size` is crossed. A second thread consumes
//! the jobs, coalesces flush-range hints and retires rotated files with a
//! final flush hint, a page-cache drop and a close — all off the write
//! path.
//!
//! Durability on crash is explicitly not promised: every flush is an
//! advisory hint to the kernel, and an overrun staging ring overwrites the
//! oldest records rather than ever blocking a producer.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, SyncSender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::backup::Backups;
use crate::buffer::WriteBuffer;
use crate::config::{Config, Limits};
use crate::error::{Error, Result};
use crate::fs::{LogFile, LogFs, OsFs};
use crate::output::Output;
use crate::staging::StagingRing;

/// Staging capacity in slots (records, not bytes).
const STAGING_SLOTS: usize = 1024;

/// Bound on in-flight sync jobs; a handful is enough since the sync loop
/// only issues non-blocking hints.
const SYNC_JOB_BOUND: usize = 8;

/// How long the write loop naps when the staging ring is empty.
const IDLE_SLEEP: Duration = Duration::from_millis(2);

/// State shared between the producer-facing handle and the loops.
struct Shared {
    /// True until `close` wins its compare-and-swap.
    running: AtomicBool,
    /// Set by `sync()`, consumed by the write loop.
    sync_requested: AtomicBool,
    /// Record staging ring.
    staging: StagingRing<Bytes>,
}

/// Work handed from the write loop to the sync loop.
enum SyncJob {
    /// `bytes` more bytes reached `file`; schedule writeback for them.
    FlushRange {
        /// File the bytes were written to.
        file: Arc<dyn LogFile>,
        /// Number of newly written bytes.
        bytes: u64,
    },
    /// `file` was rotated away: final flush, page-cache drop, close.
    Retire {
        /// The retired file handle (last reference).
        file: Arc<dyn LogFile>,
    },
}

/// A non-blocking, size-rotating log writer.
///
/// Cheap to share behind an `Arc`; all methods take `&self`. Writes are
/// wait-free for the caller and never report I/O errors — see the module
/// docs for the loss model that buys.
pub struct Rotation {
    shared: Arc<Shared>,
    write_thread: Mutex<Option<JoinHandle<()>>>,
    sync_thread: Mutex<Option<JoinHandle<()>>>,
}

impl Rotation {
    /// Creates a writer for `config` on the real filesystem and starts the
    /// background loops.
    ///
    /// # Errors
    ///
    /// Configuration validation, the initial backup scan and the initial
    /// open are the only fatal failure points; see [`Error`].
    pub fn new(config: &Config) -> Result<Self> {
        Self::with_fs(config, Arc::new(OsFs))
    }

    /// Creates a writer over a custom filesystem provider.
    ///
    /// This is the seam used by tests and by hosts without the Linux
    /// advisory syscalls.
    ///
    /// # Errors
    ///
    /// Same as [`Rotation::new`].
    pub fn with_fs(config: &Config, fs: Arc<dyn LogFs>) -> Result<Self> {
        let limits = config.normalize()?;

        // Make sure the directory exists before scanning it, so a config
        // pointing into a fresh directory works on first run.
        if let Some(dir) = limits.output_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs.create_dir_all(dir).map_err(|source| Error::CreateDir {
                dir: dir.to_path_buf(),
                source,
            })?;
        }

        let backups = Backups::list(fs.as_ref(), &limits.output_path, limits.max_backups)?;
        let mut output = Output::new(&limits, backups, fs);
        let active = output.open()?;

        let shared = Arc::new(Shared {
            running: AtomicBool::new(true),
            sync_requested: AtomicBool::new(false),
            staging: StagingRing::new(STAGING_SLOTS),
        });

        let (jobs_tx, jobs_rx) = std::sync::mpsc::sync_channel(SYNC_JOB_BOUND);

        let write_loop = WriteLoop {
            shared: Arc::clone(&shared),
            buf: WriteBuffer::new(Arc::clone(&active), limits.buf_size),
            output,
            active,
            jobs: jobs_tx,
            dirty: 0,
            file_written: 0,
            poison_logged: false,
            limits: limits.clone(),
        };
        let sync_loop = SyncLoop {
            shared: Arc::clone(&shared),
            jobs: jobs_rx,
            pending: 0,
            flushed: 0,
            per_sync: limits.per_sync_size,
            max_size: limits.max_size,
        };

        let write_thread = thread::Builder::new()
            .name("rotolog-write".into())
            .spawn(move || write_loop.run())
            .map_err(|source| Error::Spawn { source })?;
        let sync_thread = thread::Builder::new()
            .name("rotolog-sync".into())
            .spawn(move || sync_loop.run())
            .map_err(|source| Error::Spawn { source })?;

        Ok(Self {
            shared,
            write_thread: Mutex::new(Some(write_thread)),
            sync_thread: Mutex::new(Some(sync_thread)),
        })
    }

    /// Publishes a record.
    ///
    /// Returns `p.len()` once the record is staged, or 0 if the writer is
    /// closed. Never blocks on disk I/O, rotation or flushing; if the write
    /// loop cannot keep up, the oldest staged records are overwritten.
    pub fn write(&self, p: &[u8]) -> usize {
        if p.is_empty() || !self.shared.running.load(Ordering::Acquire) {
            return 0;
        }
        self.shared.staging.publish(Bytes::copy_from_slice(p));
        p.len()
    }

    /// Publishes an owned record without copying the body.
    ///
    /// Returns the record length, or 0 if the writer is closed.
    pub fn write_bytes(&self, p: Bytes) -> usize {
        if p.is_empty() || !self.shared.running.load(Ordering::Acquire) {
            return 0;
        }
        let len = p.len();
        self.shared.staging.publish(p);
        len
    }

    /// Asks the write loop to drain staged records, flush the write buffer
    /// and schedule writeback for the flushed bytes.
    ///
    /// The request is asynchronous: data reaches the file shortly after,
    /// not by the time this returns. On a closed writer this is a no-op.
    ///
    /// # Errors
    ///
    /// None currently; the `Result` is part of the API contract for
    /// signalling failures.
    pub fn sync(&self) -> Result<()> {
        if self.shared.running.load(Ordering::Acquire) {
            self.shared.sync_requested.store(true, Ordering::Release);
        }
        Ok(())
    }

    /// Stops both loops and closes the active file. Idempotent.
    ///
    /// Staged records that the write loop has not picked up yet are
    /// dropped; the write buffer's tail is flushed best-effort.
    ///
    /// # Errors
    ///
    /// None currently; repeated calls return `Ok(())`.
    pub fn close(&self) -> Result<()> {
        if self
            .shared
            .running
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(());
        }

        if let Some(handle) = self.write_thread.lock().take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.sync_thread.lock().take() {
            let _ = handle.join();
        }
        Ok(())
    }

    /// Returns true until [`Rotation::close`] is called.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }
}

impl Drop for Rotation {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

impl io::Write for Rotation {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(Rotation::write(self, buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        self.sync().map_err(io::Error::other)
    }
}

impl io::Write for &Rotation {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(Rotation::write(*self, buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        self.sync().map_err(io::Error::other)
    }
}

impl std::fmt::Debug for Rotation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rotation")
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

/// Single-threaded consumer of the staging ring.
struct WriteLoop {
    shared: Arc<Shared>,
    buf: WriteBuffer,
    output: Output,
    active: Arc<dyn LogFile>,
    jobs: SyncSender<SyncJob>,
    /// Bytes written to the active file since the last flush-range job.
    dirty: u64,
    /// Bytes written to the active file since it was opened.
    file_written: u64,
    /// Keeps the poisoned-sink warning to one line per episode.
    poison_logged: bool,
    limits: Limits,
}

impl WriteLoop {
    fn run(mut self) {
        while self.shared.running.load(Ordering::Acquire) {
            if self.shared.sync_requested.swap(false, Ordering::AcqRel) {
                self.drain_and_flush();
                continue;
            }
            match self.shared.staging.try_pop() {
                Some(popped) => {
                    if popped.lost > 0 {
                        warn!(
                            lost = popped.lost,
                            "staging ring overrun; oldest records overwritten"
                        );
                    }
                    self.forward(&popped.value);
                }
                None => thread::sleep(IDLE_SLEEP),
            }
        }
        // Orderly shutdown: push the buffered tail out best-effort. No
        // hints are dispatched; durability was never promised.
        let _ = self.buf.flush();
        debug!("write loop stopped");
    }

    /// Sends one record through the write buffer and runs the flush-range
    /// and rotation checks.
    fn forward(&mut self, p: &[u8]) {
        let out = self.buf.write(p);
        match &out.error {
            Some(e) if !self.poison_logged => {
                warn!(error = %e, "log sink poisoned; records dropped until next rotation");
                self.poison_logged = true;
            }
            _ => {}
        }

        let forwarded = out.forwarded as u64;
        self.dirty += forwarded;
        self.file_written += forwarded;

        if self.dirty >= self.limits.per_sync_size {
            self.emit_flush_range();
        }
        if self.file_written >= self.limits.max_size {
            self.rotate();
        }
    }

    /// Handles a `sync()` request: drain up to one ring's worth of staged
    /// records, flush the buffer, schedule writeback for what got flushed.
    fn drain_and_flush(&mut self) {
        for _ in 0..self.shared.staging.capacity() {
            match self.shared.staging.try_pop() {
                Some(popped) => {
                    if popped.lost > 0 {
                        warn!(
                            lost = popped.lost,
                            "staging ring overrun; oldest records overwritten"
                        );
                    }
                    self.forward(&popped.value);
                }
                None => break,
            }
        }

        let (flushed, _) = self.buf.flush();
        self.dirty += flushed as u64;
        self.file_written += flushed as u64;
        self.emit_flush_range();
    }

    /// Queues writeback for the accumulated dirty bytes of the active file.
    fn emit_flush_range(&mut self) {
        if self.dirty == 0 {
            return;
        }
        let job = SyncJob::FlushRange {
            file: Arc::clone(&self.active),
            bytes: self.dirty,
        };
        // A send error means the sync loop is gone, which only happens
        // during shutdown; the bytes are simply no longer hinted.
        let _ = self.jobs.send(job);
        self.dirty = 0;
    }

    /// Rotates the active file once `file_written` crosses the limit.
    ///
    /// The counter is cleared *before* the attempt: a rotation that keeps
    /// failing then retries once per `max_size` worth of writes instead of
    /// on every record.
    fn rotate(&mut self) {
        let old = Arc::clone(&self.active);
        self.file_written = 0;

        match self.output.open() {
            Ok(new_file) => {
                self.active = Arc::clone(&new_file);
                // Buffered tail and future records go to the new file; a
                // poisoned buffer gets a clean slate with it.
                self.buf.reset(new_file);
                self.buf.clear_error();
                self.poison_logged = false;

                // Residual writeback for the old file must precede its
                // retirement so the sync loop's counters cover every byte.
                if self.dirty > 0 {
                    let _ = self.jobs.send(SyncJob::FlushRange {
                        file: Arc::clone(&old),
                        bytes: self.dirty,
                    });
                    self.dirty = 0;
                }
                let _ = self.jobs.send(SyncJob::Retire { file: old });
            }
            Err(e) => {
                // Best effort: keep writing into the old file and retry at
                // the next threshold crossing.
                warn!(error = %e, "rotation failed; continuing with current file");
            }
        }
    }
}

/// Single-threaded consumer of sync jobs.
struct SyncLoop {
    shared: Arc<Shared>,
    jobs: Receiver<SyncJob>,
    /// Bytes announced by flush-range jobs but not yet hinted.
    pending: u64,
    /// Offset up to which writeback has been hinted for the active file.
    flushed: u64,
    per_sync: u64,
    max_size: u64,
}

impl SyncLoop {
    fn run(mut self) {
        while let Ok(job) = self.jobs.recv() {
            if !self.shared.running.load(Ordering::Acquire) {
                // Cancelled: remaining jobs are dropped, handles close via
                // their last Arc.
                break;
            }
            self.handle(job);
        }
        debug!("sync loop stopped");
    }

    fn handle(&mut self, job: SyncJob) {
        match job {
            SyncJob::FlushRange { file, bytes } => {
                self.pending += bytes;
                if self.pending >= self.per_sync {
                    file.flush_range(self.flushed, self.pending);
                    self.flushed += self.pending;
                    self.pending = 0;
                }
            }
            SyncJob::Retire { file } => {
                if self.pending > 0 {
                    file.flush_range(self.flushed, self.pending);
                }
                file.drop_cache(0, self.max_size);
                // Dropping the last reference closes the descriptor; the
                // next active file starts with fresh counters.
                drop(file);
                self.flushed = 0;
                self.pending = 0;
            }
        }
    }
}
