//! Writer configuration and normalisation.
//!
//! [`Config`] is the envelope users deserialize from JSON/TOML; sizes are
//! given in human units (MiB / KiB). [`Config::normalize`] converts it into
//! byte-valued [`Limits`] and establishes the invariants the write and sync
//! loops rely on: every size is a positive multiple of the page size and
//! `per_sync_size >= 2 * buf_size`.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Page size the size fields are aligned to.
pub const PAGE_SIZE: u64 = 1 << 12; // 4KB

const KB: u64 = 1024;
const MB: u64 = 1024 * KB;

/// Default maximum size of the active file before rotation: 128 MiB.
pub const DEFAULT_MAX_SIZE: u64 = 128 * MB;

/// Default number of backups to retain.
///
/// Backups are a safety net, not an archive; in practice a log shipper has
/// already collected them.
pub const DEFAULT_MAX_BACKUPS: usize = 4;

/// Default write-buffer size: 64 KiB.
pub const DEFAULT_BUF_SIZE: u64 = 64 * KB;

/// Default writeback-hint granularity: 16 MiB.
pub const DEFAULT_PER_SYNC_SIZE: u64 = 16 * MB;

/// Configuration envelope for a [`Rotation`](crate::Rotation) writer.
///
/// All fields except `output_path` have working defaults. Non-positive size
/// fields fall back to their defaults during normalisation. Unrecognised
/// fields in a deserialized document are ignored.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Path of the active log file.
    pub output_path: PathBuf,

    /// Maximum size of the active file before it gets rotated. Unit: MiB.
    pub max_size_mb: i64,

    /// Maximum number of backup files to retain.
    pub max_backups: i64,

    /// Use local time in backup file names instead of UTC.
    pub local_time: bool,

    /// Write-buffer size. Unit: KiB.
    ///
    /// The buffer combines small writes. It should stay small: a flush of
    /// the whole buffer happens inline on the write loop.
    pub buf_size_kb: i64,

    /// Writeback-hint granularity. Unit: MiB.
    ///
    /// Every `per_sync_size_mb` of written data, the kernel is advised to
    /// start flushing those pages. Large values cause bursty I/O.
    pub per_sync_size_mb: i64,

    /// Test mode: size fields are taken as raw bytes and neither page
    /// alignment nor the sync/buffer ratio is enforced.
    pub developed: bool,
}

/// Byte-valued configuration produced by [`Config::normalize`].
#[derive(Debug, Clone)]
pub struct Limits {
    /// Path of the active log file.
    pub output_path: PathBuf,
    /// Rotation threshold in bytes.
    pub max_size: u64,
    /// Backup retention count.
    pub max_backups: usize,
    /// Local-time backup names.
    pub local_time: bool,
    /// Write-buffer capacity in bytes.
    pub buf_size: usize,
    /// Writeback-hint granularity in bytes.
    pub per_sync_size: u64,
    /// Alignment and ratio enforcement disabled.
    pub developed: bool,
}

impl Config {
    /// Creates a config writing to `path`, everything else defaulted.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            output_path: path.into(),
            ..Self::default()
        }
    }

    /// Validates and normalises the configuration.
    ///
    /// Applied once, before any I/O. Rules run in order: unit scaling
    /// (`developed` takes sizes as bytes), defaults for non-positive values,
    /// the `per_sync >= 2 * buf` floor, then upward page alignment.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EmptyOutputPath`] if `output_path` is empty.
    #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)] // guarded by > 0 checks; buffer sizes fit usize
    pub fn normalize(&self) -> Result<Limits> {
        if self.output_path.as_os_str().is_empty() {
            return Err(Error::EmptyOutputPath);
        }

        let (k, m) = if self.developed { (1, 1) } else { (KB, MB) };

        // The raw fields come straight out of a deserialized document, so
        // the unit multiplies saturate instead of trapping on absurd values.
        let max_size = if self.max_size_mb <= 0 {
            DEFAULT_MAX_SIZE
        } else {
            (self.max_size_mb as u64).saturating_mul(m)
        };
        let max_backups = if self.max_backups <= 0 {
            DEFAULT_MAX_BACKUPS
        } else {
            self.max_backups as usize
        };
        let buf_size = if self.buf_size_kb <= 0 {
            DEFAULT_BUF_SIZE
        } else {
            (self.buf_size_kb as u64).saturating_mul(k)
        };
        let per_sync_size = if self.per_sync_size_mb <= 0 {
            DEFAULT_PER_SYNC_SIZE
        } else {
            (self.per_sync_size_mb as u64).saturating_mul(m)
        };

        let mut limits = Limits {
            output_path: self.output_path.clone(),
            max_size,
            max_backups,
            local_time: self.local_time,
            buf_size: usize::try_from(buf_size).unwrap_or(usize::MAX),
            per_sync_size,
            developed: self.developed,
        };

        if !self.developed {
            let floor = buf_size.saturating_mul(2);
            if limits.per_sync_size < floor {
                limits.per_sync_size = floor;
            }
            limits.max_size = align_to_page(limits.max_size);
            limits.buf_size = align_to_page(limits.buf_size as u64) as usize;
            limits.per_sync_size = align_to_page(limits.per_sync_size);
        }

        Ok(limits)
    }
}

/// Rounds `n` up to the next multiple of [`PAGE_SIZE`], saturating at the
/// largest page-aligned value.
#[inline]
#[must_use]
pub const fn align_to_page(n: u64) -> u64 {
    n.saturating_add(PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_to_page() {
        for i in 1..=PAGE_SIZE {
            assert_eq!(align_to_page(i), PAGE_SIZE);
        }
        for i in PAGE_SIZE + 1..2 * PAGE_SIZE {
            assert_eq!(align_to_page(i), 2 * PAGE_SIZE);
        }
        assert_eq!(align_to_page(0), 0);
    }

    #[test]
    fn test_empty_path_rejected() {
        let conf = Config::default();
        assert!(matches!(
            conf.normalize(),
            Err(Error::EmptyOutputPath)
        ));
    }

    #[test]
    fn test_defaults() {
        let limits = Config::new("/tmp/a.log").normalize().unwrap();
        assert_eq!(limits.max_size, DEFAULT_MAX_SIZE);
        assert_eq!(limits.max_backups, DEFAULT_MAX_BACKUPS);
        assert_eq!(limits.buf_size as u64, DEFAULT_BUF_SIZE);
        assert_eq!(limits.per_sync_size, DEFAULT_PER_SYNC_SIZE);
        assert!(!limits.local_time);
        assert!(!limits.developed);
    }

    #[test]
    fn test_unit_scaling() {
        let conf = Config {
            max_size_mb: 2,
            buf_size_kb: 8,
            per_sync_size_mb: 1,
            ..Config::new("/tmp/a.log")
        };
        let limits = conf.normalize().unwrap();
        assert_eq!(limits.max_size, 2 * MB);
        assert_eq!(limits.buf_size as u64, 8 * KB);
        assert_eq!(limits.per_sync_size, MB);
    }

    #[test]
    fn test_developed_takes_raw_bytes() {
        let conf = Config {
            max_size_mb: 32,
            buf_size_kb: 4,
            per_sync_size_mb: 16,
            developed: true,
            ..Config::new("/tmp/a.log")
        };
        let limits = conf.normalize().unwrap();
        assert_eq!(limits.max_size, 32);
        assert_eq!(limits.buf_size, 4);
        assert_eq!(limits.per_sync_size, 16);
    }

    #[test]
    fn test_per_sync_floor() {
        // per_sync below 2 * buf is raised to the floor.
        let conf = Config {
            buf_size_kb: 1024, // 1 MiB buffer
            per_sync_size_mb: 1,
            ..Config::new("/tmp/a.log")
        };
        let limits = conf.normalize().unwrap();
        assert_eq!(limits.per_sync_size, 2 * limits.buf_size as u64);
    }

    #[test]
    fn test_page_alignment() {
        let conf = Config {
            max_size_mb: 1,
            buf_size_kb: 3, // not page aligned
            per_sync_size_mb: 1,
            ..Config::new("/tmp/a.log")
        };
        let limits = conf.normalize().unwrap();
        assert_eq!(limits.max_size % PAGE_SIZE, 0);
        assert_eq!(limits.buf_size as u64 % PAGE_SIZE, 0);
        assert_eq!(limits.per_sync_size % PAGE_SIZE, 0);
        assert!(limits.per_sync_size >= 2 * limits.buf_size as u64);
    }

    #[test]
    fn test_huge_values_saturate_instead_of_panicking() {
        // A syntactically valid document with absurd sizes must degrade,
        // not overflow.
        let conf = Config {
            max_size_mb: i64::MAX,
            buf_size_kb: i64::MAX,
            per_sync_size_mb: i64::MAX,
            max_backups: i64::MAX,
            ..Config::new("/tmp/a.log")
        };
        let limits = conf.normalize().unwrap();
        assert!(limits.max_size > 0);
        assert_eq!(limits.max_size % PAGE_SIZE, 0);
        assert_eq!(limits.per_sync_size % PAGE_SIZE, 0);
        assert!(limits.per_sync_size >= limits.buf_size as u64);
    }

    #[test]
    fn test_developed_skips_enforcement() {
        let conf = Config {
            buf_size_kb: 7,
            per_sync_size_mb: 3,
            developed: true,
            ..Config::new("/tmp/a.log")
        };
        let limits = conf.normalize().unwrap();
        // Raw bytes, no floor, no alignment.
        assert_eq!(limits.buf_size, 7);
        assert_eq!(limits.per_sync_size, 3);
    }

    #[test]
    fn test_envelope_ignores_unknown_fields() {
        let doc = r#"{
            "output_path": "/var/log/a.log",
            "max_size_mb": 64,
            "compression": "zstd"
        }"#;
        let conf: Config = serde_json::from_str(doc).unwrap();
        assert_eq!(conf.output_path, PathBuf::from("/var/log/a.log"));
        assert_eq!(conf.max_size_mb, 64);
        assert_eq!(conf.max_backups, 0);
    }
}
