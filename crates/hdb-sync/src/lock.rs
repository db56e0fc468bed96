use std::fs::{File, OpenOptions};
use std::io::{Seek, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use fs2::FileExt;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum RunLockError {
    #[error("another pipeline run holds {path}")]
    Held { path: PathBuf },
    #[error("locking {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Exclusive OS lock on a file in the workspace, held for one pipeline run.
///
/// The file itself stays on disk. The lock goes away when the guard drops or
/// the process dies, so a crashed run never blocks the next one.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
    file: File,
}

impl RunLock {
    pub const FILE_NAME: &'static str = "hdb-pipeline.lock";

    pub fn acquire(dir: &Path) -> Result<Self, RunLockError> {
        let path = dir.join(Self::FILE_NAME);
        let io_err = |source| RunLockError::Io {
            path: path.clone(),
            source,
        };

        std::fs::create_dir_all(dir).map_err(io_err)?;
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(io_err)?;

        if let Err(err) = file.try_lock_exclusive() {
            if err.kind() == fs2::lock_contended_error().kind() {
                return Err(RunLockError::Held { path: path.clone() });
            }
            return Err(io_err(err));
        }

        file.set_len(0).map_err(io_err)?;
        file.rewind().map_err(io_err)?;
        writeln!(file, "pid={} acquired_at={}", std::process::id(), Utc::now().to_rfc3339())
            .map_err(io_err)?;
        debug!(path = %path.display(), "acquired run lock");
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(err) = FileExt::unlock(&self.file) {
            warn!(path = %self.path.display(), error = %err, "failed to release run lock");
        }
    }
}
