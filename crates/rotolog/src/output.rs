//! Active output file management.
//!
//! [`Output`] owns the path of the active log file, the handle currently
//! receiving writes, and the backup retention set. [`Output::open`] is both
//! the initial open and the rotation step: an existing file at the output
//! path is renamed to a timestamped backup before the fresh file is
//! created. The retired handle is never closed here; the write loop hands
//! it to the sync loop so the flush + cache-drop + close cycle stays off
//! the write path.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tracing::debug;

use crate::backup::{backup_path, Backup, Backups};
use crate::config::Limits;
use crate::error::{Error, Result};
use crate::fs::{LogFile, LogFs};

/// The active output file and its rotation state.
pub struct Output {
    path: PathBuf,
    file: Option<Arc<dyn LogFile>>,
    max_size: u64,
    backups: Backups,
    local_time: bool,
    max_backups: usize,
    fs: Arc<dyn LogFs>,
}

impl Output {
    /// Creates an output for `limits` with an already-scanned backup set.
    #[must_use]
    pub fn new(limits: &Limits, backups: Backups, fs: Arc<dyn LogFs>) -> Self {
        Self {
            path: limits.output_path.clone(),
            file: None,
            max_size: limits.max_size,
            backups,
            local_time: limits.local_time,
            max_backups: limits.max_backups,
            fs,
        }
    }

    /// Opens a fresh active file, rotating any existing one into a backup.
    ///
    /// On success the new handle replaces the current one and is returned;
    /// on failure the previous handle stays in place so writing can
    /// continue into the old file.
    ///
    /// # Errors
    ///
    /// [`Error::Rename`] if an existing file cannot be moved aside,
    /// [`Error::CreateDir`] / [`Error::Open`] if the new file cannot be
    /// created.
    pub fn open(&mut self) -> Result<Arc<dyn LogFile>> {
        if self.fs.exists(&self.path) {
            // A file is present during rotation (and possibly at startup,
            // left over from a previous run): move it aside first.
            let (backup_fp, ts) = backup_path(&self.path, self.local_time, Utc::now());
            self.fs
                .rename(&self.path, &backup_fp)
                .map_err(|source| Error::Rename {
                    from: self.path.clone(),
                    to: backup_fp.clone(),
                    source,
                })?;
            debug!(backup = %backup_fp.display(), "rotated active file into backup");

            self.backups.push(Backup {
                ts,
                path: backup_fp,
            });
            self.backups.prune(self.fs.as_ref(), self.max_backups);
        }

        if let Some(dir) = non_empty_parent(&self.path) {
            self.fs
                .create_dir_all(dir)
                .map_err(|source| Error::CreateDir {
                    dir: dir.to_path_buf(),
                    source,
                })?;
        }

        let file = self.fs.open(&self.path).map_err(|source| Error::Open {
            path: self.path.clone(),
            source,
        })?;
        // Ask for the pages up front; the visible size stays at zero.
        file.preallocate(self.max_size);

        self.file = Some(Arc::clone(&file));
        Ok(file)
    }

    /// The handle currently receiving writes, if one is open.
    #[must_use]
    pub fn file(&self) -> Option<&Arc<dyn LogFile>> {
        self.file.as_ref()
    }

    /// Number of retained backups.
    #[must_use]
    pub fn backup_count(&self) -> usize {
        self.backups.len()
    }
}

fn non_empty_parent(path: &Path) -> Option<&Path> {
    path.parent().filter(|p| !p.as_os_str().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::fs::OsFs;
    use tempfile::TempDir;

    fn limits_for(path: &Path) -> Limits {
        let mut conf = Config::new(path);
        conf.developed = true;
        conf.max_size_mb = 64;
        conf.max_backups = 2;
        conf.normalize().unwrap()
    }

    fn output_for(limits: &Limits) -> Output {
        let fs: Arc<dyn LogFs> = Arc::new(OsFs);
        let backups = Backups::list(fs.as_ref(), &limits.output_path, limits.max_backups)
            .unwrap_or_default();
        Output::new(limits, backups, fs)
    }

    #[test]
    fn test_open_creates_file_and_parents() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("a.log");
        let limits = limits_for(&path);
        let mut output = Output::new(&limits, Backups::new(), Arc::new(OsFs));

        let file = output.open().unwrap();
        assert!(path.exists());
        file.write(b"x").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"x");
    }

    #[test]
    fn test_open_existing_rotates_to_backup() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.log");
        std::fs::write(&path, b"previous run").unwrap();

        let limits = limits_for(&path);
        let mut output = output_for(&limits);
        output.open().unwrap();

        assert_eq!(output.backup_count(), 1);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);

        // The old content lives on in the backup.
        let names = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|n| n != "a.log")
            .collect::<Vec<_>>();
        assert_eq!(names.len(), 1);
        assert_eq!(
            std::fs::read(dir.path().join(&names[0])).unwrap(),
            b"previous run"
        );
    }

    #[test]
    fn test_retention_enforced_across_opens() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.log");
        let limits = limits_for(&path); // max_backups = 2

        let mut output = output_for(&limits);
        for i in 0..4u8 {
            std::fs::write(&path, [i]).unwrap();
            output.open().unwrap();
            // Distinct timestamps: the name carries millisecond precision.
            std::thread::sleep(std::time::Duration::from_millis(5));
        }

        assert!(output.backup_count() <= 2);
        let backups = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|n| n != "a.log")
            .collect::<Vec<_>>();
        assert_eq!(backups.len(), 2);
    }
}
