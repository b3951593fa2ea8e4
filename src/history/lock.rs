use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use fs4::fs_std::FileExt;

use super::HistoryError;

/// Exclusive claim on a history file for the duration of one run.
///
/// An OS advisory lock on `<history>.lock`. The kernel releases it when
/// the process exits, so a run killed mid-download leaves nothing to
/// clean up. The file itself stays on disk.
#[derive(Debug)]
pub struct HistoryLock {
    path: PathBuf,
    file: File,
}

impl HistoryLock {
    pub fn acquire(history_path: &Path) -> Result<Self, HistoryError> {
        let mut lock = history_path.as_os_str().to_owned();
        lock.push(".lock");
        let lock = PathBuf::from(lock);

        let write_err = |source| HistoryError::Write {
            path: history_path.to_path_buf(),
            source,
        };

        if let Some(parent) = lock.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(write_err)?;
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock)
            .map_err(write_err)?;

        if !file.try_lock_exclusive().map_err(write_err)? {
            return Err(HistoryError::Locked {
                path: history_path.to_path_buf(),
                lock,
            });
        }

        let pid = file
            .set_len(0)
            .and_then(|()| writeln!(file, "{}", std::process::id()));
        if let Err(e) = pid {
            tracing::debug!(path = %lock.display(), error = %e, "Failed to write pid to history lock");
        }

        Ok(Self { path: lock, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for HistoryLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::warn!(path = %self.path.display(), error = %e, "Failed to release history lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn second_acquire_fails_until_released() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let history = dir.path().join("history.json");

        let first = HistoryLock::acquire(&history)?;
        assert!(first.path().exists());
        assert!(matches!(
            HistoryLock::acquire(&history),
            Err(HistoryError::Locked { .. })
        ));

        drop(first);
        let again = HistoryLock::acquire(&history)?;
        assert!(again.path().ends_with("history.json.lock"));
        Ok(())
    }

    #[test]
    fn leftover_lock_file_from_dead_run_is_reclaimed() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let history = dir.path().join("history.json");
        std::fs::write(dir.path().join("history.json.lock"), "4242\n")?;

        let lock = HistoryLock::acquire(&history)?;
        assert_eq!(
            std::fs::read_to_string(lock.path())?.trim(),
            std::process::id().to_string()
        );
        Ok(())
    }
}
