//! Filesystem provider and kernel page-cache hints.
//!
//! The writer talks to the filesystem through the [`LogFs`] / [`LogFile`]
//! traits so tests can substitute in-memory implementations and non-Linux
//! hosts can degrade the advisory calls to no-ops. [`OsFs`] is the
//! production implementation.
//!
//! ## Advisory calls
//!
//! On Linux, `flush_range` maps to `sync_file_range(2)` with
//! `SYNC_FILE_RANGE_WRITE` (initiate writeback, never wait for it) and
//! `drop_cache` maps to `posix_fadvise(2)` with `POSIX_FADV_DONTNEED`
//! (evict clean pages). Both are hints: failures are logged at debug level
//! and otherwise ignored. On other targets both are no-ops; correctness is
//! unaffected, only the cache-displacement mitigation is lost.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// An open log file as seen by the write and sync loops.
///
/// Writes go through a shared reference: the file is opened in append mode,
/// so concurrent positioning is not a concern (and in practice only the
/// write loop writes).
pub trait LogFile: Send + Sync {
    /// Appends `buf` to the file, returning the number of bytes written.
    ///
    /// # Errors
    ///
    /// Returns the underlying IO error; the caller decides whether it is
    /// sticky.
    fn write(&self, buf: &[u8]) -> io::Result<usize>;

    /// Advises the kernel to initiate writeback of `len` bytes starting at
    /// `offset`. Must not block waiting for durability.
    fn flush_range(&self, offset: u64, len: u64);

    /// Advises the kernel to evict clean cached pages for the given range.
    fn drop_cache(&self, offset: u64, len: u64);

    /// Hints that the file will grow to `len` bytes, without changing its
    /// visible size. Log shippers watch the file by size, so an eager
    /// `ftruncate`-style allocation would confuse them.
    fn preallocate(&self, len: u64);
}

/// Filesystem operations needed to open, rotate and prune log files.
pub trait LogFs: Send + Sync {
    /// Returns true if `path` exists.
    fn exists(&self, path: &Path) -> bool;

    /// Renames `from` to `to`.
    ///
    /// # Errors
    ///
    /// Returns the underlying IO error.
    fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;

    /// Creates `dir` and all missing parents (mode 0755 on Unix).
    ///
    /// # Errors
    ///
    /// Returns the underlying IO error.
    fn create_dir_all(&self, dir: &Path) -> io::Result<()>;

    /// Removes the file at `path`.
    ///
    /// # Errors
    ///
    /// Returns the underlying IO error.
    fn remove_file(&self, path: &Path) -> io::Result<()>;

    /// Returns the names of the regular files in `dir` (directories and
    /// other non-file entries are skipped).
    ///
    /// # Errors
    ///
    /// Returns the underlying IO error, including when `dir` is missing.
    fn read_dir(&self, dir: &Path) -> io::Result<Vec<String>>;

    /// Opens `path` for appending, creating it and truncating any content
    /// another process may have raced in (mode 0644 on Unix).
    ///
    /// # Errors
    ///
    /// Returns the underlying IO error.
    fn open(&self, path: &Path) -> io::Result<Arc<dyn LogFile>>;
}

/// The real filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsFs;

impl LogFs for OsFs {
    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        std::fs::rename(from, to)
    }

    fn create_dir_all(&self, dir: &Path) -> io::Result<()> {
        std::fs::create_dir_all(dir)
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        std::fs::remove_file(path)
    }

    fn read_dir(&self, dir: &Path) -> io::Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        Ok(names)
    }

    fn open(&self, path: &Path) -> io::Result<Arc<dyn LogFile>> {
        let file = open_append(path)?;
        Ok(Arc::new(OsFile {
            file,
            path: path.to_path_buf(),
        }))
    }
}

/// Opens a log file with WRITE|CREATE|TRUNC|APPEND.
///
/// Truncation cleans up content someone else may have created between the
/// existence check and this open; `O_EXCL` would break the rotation
/// protocol instead. Append mode makes every write allocate fresh pages
/// rather than read-modify-write existing ones.
#[cfg(unix)]
fn open_append(path: &Path) -> io::Result<File> {
    use std::os::unix::fs::OpenOptionsExt;

    // std rejects .append(true) together with .truncate(true), so the
    // append flag goes in through custom_flags.
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o644)
        .custom_flags(libc::O_APPEND)
        .open(path)
}

#[cfg(not(unix))]
fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
}

/// A real log file plus its path (kept for diagnostics).
struct OsFile {
    file: File,
    path: PathBuf,
}

impl LogFile for OsFile {
    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        (&self.file).write(buf)
    }

    fn flush_range(&self, offset: u64, len: u64) {
        if len == 0 {
            // sync_file_range treats nbytes == 0 as "to end of file".
            return;
        }
        imp::flush_range(&self.file, &self.path, offset, len);
    }

    fn drop_cache(&self, offset: u64, len: u64) {
        if len == 0 {
            return;
        }
        imp::drop_cache(&self.file, &self.path, offset, len);
    }

    fn preallocate(&self, len: u64) {
        if len == 0 {
            return;
        }
        imp::preallocate(&self.file, &self.path, len);
    }
}

#[cfg(target_os = "linux")]
mod imp {
    use std::fs::File;
    use std::os::unix::io::AsRawFd;
    use std::path::Path;

    use tracing::debug;

    #[allow(clippy::cast_possible_wrap)] // offsets are bounded by max file size
    pub(super) fn flush_range(file: &File, path: &Path, offset: u64, len: u64) {
        // SAFETY: plain syscall on an owned, open descriptor.
        let rc = unsafe {
            libc::sync_file_range(
                file.as_raw_fd(),
                offset as libc::off64_t,
                len as libc::off64_t,
                libc::SYNC_FILE_RANGE_WRITE,
            )
        };
        if rc != 0 {
            debug!(
                path = %path.display(),
                offset,
                len,
                errno = std::io::Error::last_os_error().raw_os_error(),
                "sync_file_range hint failed"
            );
        }
    }

    #[allow(clippy::cast_possible_wrap)]
    pub(super) fn drop_cache(file: &File, path: &Path, offset: u64, len: u64) {
        // SAFETY: plain syscall on an owned, open descriptor.
        let rc = unsafe {
            libc::posix_fadvise(
                file.as_raw_fd(),
                offset as libc::off64_t,
                len as libc::off64_t,
                libc::POSIX_FADV_DONTNEED,
            )
        };
        if rc != 0 {
            debug!(path = %path.display(), offset, len, errno = rc, "fadvise hint failed");
        }
    }

    #[allow(clippy::cast_possible_wrap)]
    pub(super) fn preallocate(file: &File, path: &Path, len: u64) {
        // KEEP_SIZE so the visible file size stays at the written bytes.
        // SAFETY: plain syscall on an owned, open descriptor.
        let rc = unsafe {
            libc::fallocate(
                file.as_raw_fd(),
                libc::FALLOC_FL_KEEP_SIZE,
                0,
                len as libc::off64_t,
            )
        };
        if rc != 0 {
            debug!(
                path = %path.display(),
                len,
                errno = std::io::Error::last_os_error().raw_os_error(),
                "fallocate hint failed"
            );
        }
    }
}

#[cfg(not(target_os = "linux"))]
mod imp {
    use std::fs::File;
    use std::path::Path;

    // Page-cache control is Linux-specific; elsewhere the hints degrade to
    // no-ops and only the cache-displacement mitigation is lost.
    pub(super) fn flush_range(_file: &File, _path: &Path, _offset: u64, _len: u64) {}
    pub(super) fn drop_cache(_file: &File, _path: &Path, _offset: u64, _len: u64) {}
    pub(super) fn preallocate(_file: &File, _path: &Path, _len: u64) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_open_truncates_and_appends() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.log");
        std::fs::write(&path, b"stale").unwrap();

        let fs = OsFs;
        let file = fs.open(&path).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);

        assert_eq!(file.write(b"abc").unwrap(), 3);
        assert_eq!(file.write(b"def").unwrap(), 3);
        assert_eq!(std::fs::read(&path).unwrap(), b"abcdef");
    }

    #[test]
    fn test_read_dir_skips_directories() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.log"), b"x").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();

        let names = OsFs.read_dir(dir.path()).unwrap();
        assert_eq!(names, vec!["a.log".to_string()]);
    }

    #[test]
    fn test_read_dir_missing_dir_errors() {
        let dir = TempDir::new().unwrap();
        assert!(OsFs.read_dir(&dir.path().join("nope")).is_err());
    }

    #[test]
    fn test_hints_do_not_change_visible_size() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.log");
        let file = OsFs.open(&path).unwrap();

        file.preallocate(1 << 16);
        file.write(b"abc").unwrap();
        file.flush_range(0, 3);
        file.drop_cache(0, 3);

        assert_eq!(std::fs::metadata(&path).unwrap().len(), 3);
    }
}
