//! Backup retention and backup file naming.
//!
//! A rotated file is renamed to a sibling `<stem>-<timestamp><ext>` and
//! tracked in a min-heap keyed by its unix timestamp, so the oldest backup
//! is always the next pruning victim. Retention is enforced on startup
//! (directory scan) and on every rotation.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local, Utc};
use tracing::warn;

use crate::error::{Error, Result};
use crate::fs::LogFs;

/// Backup timestamp layout: milliseconds plus a fixed-width numeric zone
/// offset, e.g. `2024-06-01T12:34:56.789+0000`.
const BACKUP_TIME_FMT: &str = "%Y-%m-%dT%H:%M:%S%.3f%z";

/// A retained backup file.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Backup {
    /// Seconds since the unix epoch, taken from the file name.
    pub ts: i64,
    /// Full path of the backup file.
    pub path: PathBuf,
}

/// Min-heap of retained backups, ordered by timestamp ascending.
#[derive(Debug, Default)]
pub struct Backups {
    heap: BinaryHeap<Reverse<Backup>>,
}

impl Backups {
    /// Creates an empty backup set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Scans the directory of `output_path` for backup files and prunes
    /// down to `max`, deleting the oldest from disk.
    ///
    /// Entries that are not backups of `output_path` (wrong prefix, wrong
    /// extension, unparseable timestamp) and non-file entries are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Scan`] if the directory cannot be read.
    pub fn list(fs: &dyn LogFs, output_path: &Path, max: usize) -> Result<Self> {
        let dir = parent_dir(output_path);
        let names = fs.read_dir(dir).map_err(|source| Error::Scan {
            dir: dir.to_path_buf(),
            source,
        })?;

        let (prefix, ext) = prefix_and_ext(output_path);
        let mut backups = Self::new();
        for name in names {
            let ts = parse_backup_ts(&name, &prefix, &ext);
            if ts != 0 {
                backups.push(Backup {
                    ts,
                    path: dir.join(name),
                });
            }
        }
        backups.prune(fs, max);
        Ok(backups)
    }

    /// Adds a backup to the set.
    pub fn push(&mut self, backup: Backup) {
        self.heap.push(Reverse(backup));
    }

    /// Removes and returns the oldest backup, if any.
    pub fn pop(&mut self) -> Option<Backup> {
        self.heap.pop().map(|Reverse(b)| b)
    }

    /// Number of retained backups.
    #[must_use]
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Returns true if no backups are retained.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Pops backups beyond `max` and deletes their files from disk.
    ///
    /// Deletion failures are logged and skipped; the entry is still dropped
    /// from the set so retention cannot grow without bound.
    pub fn prune(&mut self, fs: &dyn LogFs, max: usize) {
        while self.len() > max {
            if let Some(victim) = self.pop() {
                if let Err(e) = fs.remove_file(&victim.path) {
                    warn!(path = %victim.path.display(), error = %e, "failed to delete old backup");
                }
            }
        }
    }
}

/// Builds the backup path for `output_path` at time `now`.
///
/// Returns the path and the unix timestamp encoded in it. With
/// `local = false` the timestamp is rendered in UTC, otherwise in the local
/// zone; either way the numeric offset keeps the name parseable.
#[must_use]
pub fn backup_path(output_path: &Path, local: bool, now: DateTime<Utc>) -> (PathBuf, i64) {
    let dir = parent_dir(output_path);
    let (prefix, ext) = prefix_and_ext(output_path);

    let stamp = if local {
        now.with_timezone(&Local).format(BACKUP_TIME_FMT).to_string()
    } else {
        now.format(BACKUP_TIME_FMT).to_string()
    };

    (dir.join(format!("{prefix}{stamp}{ext}")), now.timestamp())
}

/// Extracts the timestamp from a backup file name.
///
/// `prefix` is `<stem>-` and `ext` the extension (with the dot) of the
/// active file. Returns 0 if the name is not a backup of that file.
#[must_use]
pub fn parse_backup_ts(filename: &str, prefix: &str, ext: &str) -> i64 {
    let Some(rest) = filename.strip_prefix(prefix) else {
        return 0;
    };
    let Some(stamp) = rest.strip_suffix(ext) else {
        return 0;
    };
    DateTime::parse_from_str(stamp, BACKUP_TIME_FMT)
        .map(|t| t.timestamp())
        .unwrap_or(0)
}

/// Splits the active file name into the backup name prefix (`<stem>-`) and
/// the extension (with its dot, possibly empty).
#[must_use]
pub fn prefix_and_ext(output_path: &Path) -> (String, String) {
    let name = output_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    // Split at the final dot, like the extension of `a.tar.gz` being `.gz`.
    let (stem, ext) = match name.rfind('.') {
        Some(i) => (&name[..i], &name[i..]),
        None => (name.as_str(), ""),
    };
    (format!("{stem}-"), ext.to_string())
}

fn parent_dir(output_path: &Path) -> &Path {
    match output_path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    }
}
