//! Size-bounded write buffer with sticky-error semantics.
//!
//! [`WriteBuffer`] sits between the write loop and the active file. It
//! combines small records into page-sized writes, reports how many bytes
//! each call pushed through to the sink (the rotation and writeback
//! counters are driven by forwarded bytes, not accepted bytes), and latches
//! the first sink error: once poisoned, every call returns that error
//! without touching the sink until [`WriteBuffer::clear_error`] is called.
//! Rotation swaps the sink with [`WriteBuffer::reset`], which keeps any
//! buffered tail so it lands in the new file.

use std::io;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::fs::LogFile;

/// The latched sink error, cheaply cloneable into every subsequent result.
pub type StickyError = Arc<io::Error>;

/// Result of a [`WriteBuffer::write`] call.
#[derive(Debug, Clone, Default)]
pub struct WriteOutcome {
    /// Bytes of the caller's payload consumed (buffered or written).
    pub accepted: usize,
    /// Bytes pushed through to the sink by this call.
    pub forwarded: usize,
    /// The sticky error, if the writer is poisoned.
    pub error: Option<StickyError>,
}

/// A fixed-capacity buffered writer over a swappable sink.
pub struct WriteBuffer {
    inner: Mutex<Inner>,
}

struct Inner {
    sink: Arc<dyn LogFile>,
    buf: Box<[u8]>,
    n: usize,
    err: Option<StickyError>,
}

impl WriteBuffer {
    /// Creates a buffer of `capacity` bytes over `sink`.
    #[must_use]
    pub fn new(sink: Arc<dyn LogFile>, capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                sink,
                buf: vec![0u8; capacity.max(1)].into_boxed_slice(),
                n: 0,
                err: None,
            }),
        }
    }

    /// Writes `p`, buffering what fits and flushing full buffers through to
    /// the sink.
    ///
    /// A write larger than the remaining space on an empty buffer bypasses
    /// the copy and goes straight to the sink. When the writer is poisoned
    /// the call returns the latched error immediately and accepts nothing
    /// further.
    pub fn write(&self, p: &[u8]) -> WriteOutcome {
        let mut inner = self.inner.lock();
        let mut out = WriteOutcome::default();
        let mut p = p;

        while p.len() > inner.avail() && inner.err.is_none() {
            let n = if inner.n == 0 {
                // Large write, empty buffer: skip the copy.
                match inner.sink.write(p) {
                    Ok(n) => {
                        out.forwarded += n;
                        n
                    }
                    Err(e) => {
                        inner.err = Some(Arc::new(e));
                        0
                    }
                }
            } else {
                let n = inner.fill(p);
                let flushed = inner.flush();
                out.forwarded += flushed;
                n
            };
            out.accepted += n;
            p = &p[n..];
        }

        if let Some(err) = &inner.err {
            out.error = Some(Arc::clone(err));
            return out;
        }

        let n = inner.fill(p);
        out.accepted += n;
        out
    }

    /// Forwards all buffered bytes to the sink.
    ///
    /// Returns the number of bytes flushed by this call and the sticky
    /// error, if any. A short write poisons the writer and the unflushed
    /// tail is kept at the front of the buffer.
    pub fn flush(&self) -> (usize, Option<StickyError>) {
        let mut inner = self.inner.lock();
        let flushed = inner.flush();
        (flushed, inner.err.clone())
    }

    /// Replaces the sink, keeping buffered bytes and the sticky error.
    pub fn reset(&self, sink: Arc<dyn LogFile>) {
        self.inner.lock().sink = sink;
    }

    /// Clears the sticky error so subsequent calls reach the sink again.
    pub fn clear_error(&self) {
        self.inner.lock().err = None;
    }

    /// Number of bytes currently buffered.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.inner.lock().n
    }

    /// Total buffer capacity in bytes.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.inner.lock().buf.len()
    }
}

impl Inner {
    fn avail(&self) -> usize {
        self.buf.len() - self.n
    }

    /// Copies as much of `p` as fits into the buffer, returning the count.
    fn fill(&mut self, p: &[u8]) -> usize {
        let n = p.len().min(self.avail());
        self.buf[self.n..self.n + n].copy_from_slice(&p[..n]);
        self.n += n;
        n
    }

    fn flush(&mut self) -> usize {
        if self.err.is_some() || self.n == 0 {
            return 0;
        }
        match self.sink.write(&self.buf[..self.n]) {
            Ok(written) if written < self.n => {
                // Short write: keep the tail, poison the writer.
                self.buf.copy_within(written..self.n, 0);
                self.n -= written;
                self.err = Some(Arc::new(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "short write to log file",
                )));
                written
            }
            Ok(written) => {
                self.n = 0;
                written
            }
            Err(e) => {
                self.err = Some(Arc::new(e));
                0
            }
        }
    }
}

impl std::fmt::Debug for WriteBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("WriteBuffer")
            .field("capacity", &inner.buf.len())
            .field("buffered", &inner.n)
            .field("poisoned", &inner.err.is_some())
            .finish_non_exhaustive()
    }
}
