//! Sentinel files that let a human steer a running scheduler.
//!
//! - `PAUSE`: present while dispatch is paused
//! - `STOP`: finish in-flight work, then exit
//! - `RETRY`: first line names a failed phase to run again
//!
//! Every operation is idempotent. Removing a missing sentinel or overwriting
//! an existing one is never an error.

use crate::errors::SchedulerError;
use crate::phase::PhaseId;
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

pub const PAUSE_FILE: &str = "PAUSE";
pub const STOP_FILE: &str = "STOP";
pub const RETRY_FILE: &str = "RETRY";
pub const LOCK_FILE: &str = "run.lock";

#[derive(Debug, Clone)]
pub struct InterventionDir {
    path: PathBuf,
}

impl InterventionDir {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn ensure(&self) -> io::Result<()> {
        fs::create_dir_all(&self.path)
    }

    fn write_sentinel(&self, name: &str, content: &str) -> io::Result<()> {
        self.ensure()?;
        fs::write(self.path.join(name), content)
    }

    fn remove_sentinel(&self, name: &str) -> io::Result<()> {
        match fs::remove_file(self.path.join(name)) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }

    pub fn pause(&self) -> io::Result<()> {
        self.write_sentinel(PAUSE_FILE, "")
    }

    pub fn resume(&self) -> io::Result<()> {
        self.remove_sentinel(PAUSE_FILE)
    }

    pub fn stop(&self) -> io::Result<()> {
        self.write_sentinel(STOP_FILE, "")
    }

    pub fn clear_stop(&self) -> io::Result<()> {
        self.remove_sentinel(STOP_FILE)
    }

    /// Ask for a failed phase to be retried.
    pub fn retry(&self, phase: &PhaseId) -> io::Result<()> {
        self.write_sentinel(RETRY_FILE, &format!("{}\n", phase))
    }

    pub fn is_paused(&self) -> bool {
        self.path.join(PAUSE_FILE).exists()
    }

    pub fn is_stopped(&self) -> bool {
        self.path.join(STOP_FILE).exists()
    }

    /// Consume the RETRY sentinel. The file is deleted even when empty.
    pub fn take_retry(&self) -> io::Result<Option<PhaseId>> {
        let path = self.path.join(RETRY_FILE);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        self.remove_sentinel(RETRY_FILE)?;

        let id = content.lines().next().unwrap_or("").trim();
        Ok((!id.is_empty()).then(|| PhaseId::new(id)))
    }

    /// Remove every sentinel.
    pub fn clear(&self) -> io::Result<()> {
        self.remove_sentinel(PAUSE_FILE)?;
        self.remove_sentinel(STOP_FILE)?;
        self.remove_sentinel(RETRY_FILE)
    }

    /// Take the exclusive run lock for this directory.
    pub fn lock(&self) -> Result<RunLock, SchedulerError> {
        let io_err = |source| SchedulerError::InterventionDir {
            path: self.path.clone(),
            source,
        };
        self.ensure().map_err(io_err)?;

        let lock_path = self.path.join(LOCK_FILE);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .map_err(io_err)?;
        file.try_lock_exclusive()
            .map_err(|_| SchedulerError::LockHeld { path: lock_path })?;
        Ok(RunLock { file })
    }
}

/// Held for the lifetime of a scheduler run.
#[derive(Debug)]
pub struct RunLock {
    file: File,
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}
