//! PID file
//!
//! `start` claims the PID file before launching anything; `stop` and
//! `status` read it back. Creation is exclusive (`O_EXCL`), so two
//! launchers racing for the same file cannot both win. A record whose
//! process is gone, or whose PID now belongs to an unrelated command, is
//! stale and gets replaced.

use crate::config::STARTING_CLAIM_TIMEOUT;
use crate::core::process_table::{self, CommandPattern};
use crate::platform;
use crate::supervisor::LaunchMode;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum PidFileError {
    #[error("PID file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("PID file {path} is malformed: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("detection program already running (pid {0})")]
    AlreadyRunning(u32),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PidState {
    /// Claimed by a launcher that has not spawned the program yet; `pid` is the launcher
    Starting,
    Running,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PidRecord {
    pub pid: u32,
    pub state: PidState,
    pub mode: LaunchMode,
    pub started_at: DateTime<Utc>,
    pub launcher_pid: u32,
    #[serde(default)]
    pub command: Vec<String>,
}

impl PidRecord {
    /// Record for a launcher that is about to start the program
    pub fn starting(mode: LaunchMode) -> Self {
        let launcher_pid = std::process::id();
        Self {
            pid: launcher_pid,
            state: PidState::Starting,
            mode,
            started_at: Utc::now(),
            launcher_pid,
            command: Vec::new(),
        }
    }

    /// Check whether the recorded process still exists and is ours
    pub fn is_live(&self, pattern: &CommandPattern) -> bool {
        if !platform::process_alive(self.pid) {
            return false;
        }
        match self.state {
            PidState::Starting => self.claim_is_fresh() && process_table::is_launcher(self.pid),
            PidState::Running => process_table::is_instance(self.pid, pattern),
        }
    }

    fn claim_is_fresh(&self) -> bool {
        // a start time in the future (clock step) counts as fresh
        (Utc::now() - self.started_at)
            .to_std()
            .map(|age| age < STARTING_CLAIM_TIMEOUT)
            .unwrap_or(true)
    }
}

#[derive(Debug, Clone)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the record; `None` when there is no PID file
    pub fn read(&self) -> Result<Option<PidRecord>, PidFileError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(PidFileError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        serde_json::from_str(&content)
            .map(Some)
            .map_err(|source| PidFileError::Malformed {
                path: self.path.clone(),
                source,
            })
    }

    /// Like [`PidFile::read`], treating an unreadable record as absent
    pub fn read_lenient(&self) -> Option<PidRecord> {
        match self.read() {
            Ok(record) => record,
            Err(err) => {
                warn!("ignoring PID file: {}", err);
                None
            }
        }
    }

    /// Read the record only if its process is alive and still ours
    pub fn live_record(&self, pattern: &CommandPattern) -> Option<PidRecord> {
        self.read_lenient().filter(|record| record.is_live(pattern))
    }

    /// Claim the PID file for a new launch
    ///
    /// Fails with [`PidFileError::AlreadyRunning`] while a live instance
    /// owns it. A stale file is removed and the claim retried once.
    pub fn acquire(
        &self,
        record: PidRecord,
        pattern: &CommandPattern,
    ) -> Result<PidLock, PidFileError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| PidFileError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        for attempt in 0..2 {
            match self.create_exclusive(&record) {
                Ok(()) => {
                    debug!(path = %self.path.display(), "PID file claimed");
                    return Ok(PidLock {
                        file: self.clone(),
                        record,
                        armed: true,
                    });
                }
                Err(PidFileError::Io { source, .. })
                    if source.kind() == io::ErrorKind::AlreadyExists && attempt == 0 =>
                {
                    if let Some(existing) = self.live_record(pattern) {
                        return Err(PidFileError::AlreadyRunning(existing.pid));
                    }
                    debug!(path = %self.path.display(), "removing stale PID file");
                    self.release()?;
                }
                Err(err) => return Err(err),
            }
        }

        // another launcher re-created the file between our removal and retry
        match self.read_lenient() {
            Some(existing) => Err(PidFileError::AlreadyRunning(existing.pid)),
            None => Err(PidFileError::Io {
                path: self.path.clone(),
                source: io::Error::new(io::ErrorKind::AlreadyExists, "PID file contended"),
            }),
        }
    }

    /// Remove the PID file; a missing file is fine
    pub fn release(&self) -> Result<(), PidFileError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(PidFileError::Io {
                path: self.path.clone(),
                source,
            }),
        }
    }

    /// Remove the PID file only while it still holds `record`
    pub fn release_if_owned(&self, record: &PidRecord) -> Result<(), PidFileError> {
        match self.read_lenient() {
            Some(current)
                if current.launcher_pid == record.launcher_pid
                    && current.started_at == record.started_at =>
            {
                self.release()
            }
            Some(_) => {
                debug!(path = %self.path.display(), "PID file taken over by another launch, leaving it");
                Ok(())
            }
            None => self.release(),
        }
    }

    fn create_exclusive(&self, record: &PidRecord) -> Result<(), PidFileError> {
        let io_err = |source| PidFileError::Io {
            path: self.path.clone(),
            source,
        };
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
            .map_err(io_err)?;
        let content = serde_json::to_vec_pretty(record).map_err(|source| {
            PidFileError::Malformed {
                path: self.path.clone(),
                source,
            }
        })?;
        file.write_all(&content).map_err(io_err)?;
        file.sync_all().map_err(io_err)
    }

    /// Replace the content atomically (temp file + rename)
    fn overwrite(&self, record: &PidRecord) -> Result<(), PidFileError> {
        let tmp = self.path.with_extension("pid.tmp");
        let content =
            serde_json::to_vec_pretty(record).map_err(|source| PidFileError::Malformed {
                path: self.path.clone(),
                source,
            })?;
        std::fs::write(&tmp, content)
            .and_then(|()| std::fs::rename(&tmp, &self.path))
            .map_err(|source| PidFileError::Io {
                path: self.path.clone(),
                source,
            })
    }
}

/// A claimed PID file
///
/// Dropping the lock removes the file unless [`PidLock::persist`] was
/// called, so error paths between claim and launch clean up after
/// themselves.
#[derive(Debug)]
pub struct PidLock {
    file: PidFile,
    record: PidRecord,
    armed: bool,
}

impl PidLock {
    pub fn record(&self) -> &PidRecord {
        &self.record
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Record the program's PID and command line
    pub fn mark_running(&mut self, pid: u32, command: Vec<String>) -> Result<(), PidFileError> {
        self.record.pid = pid;
        self.record.state = PidState::Running;
        self.record.command = command;
        self.file.overwrite(&self.record)
    }

    /// Keep the file after this launcher exits (background runs)
    pub fn persist(mut self) -> PidRecord {
        self.armed = false;
        self.record.clone()
    }
}

impl Drop for PidLock {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Err(err) = self.file.release_if_owned(&self.record) {
            warn!("failed to remove PID file: {}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::process::{Command, Stdio};
    use tempfile::TempDir;

    fn pattern() -> CommandPattern {
        CommandPattern::new("/nonexistent/dsctl-test/main.py")
    }

    fn dead_pid() -> u32 {
        let mut child = Command::new("true").stdout(Stdio::null()).spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        pid
    }

    #[test]
    fn acquire_creates_file_and_drop_removes_it() {
        let dir = TempDir::new().unwrap();
        let pid_file = PidFile::new(dir.path().join("run").join("dsctl.pid"));

        let lock = pid_file
            .acquire(PidRecord::starting(LaunchMode::Manual), &pattern())
            .unwrap();
        let stored = pid_file.read().unwrap().unwrap();
        assert_eq!(&stored, lock.record());
        assert_eq!(stored.state, PidState::Starting);

        drop(lock);
        assert!(!pid_file.path().exists());
    }

    #[test]
    fn second_acquire_is_refused_while_launcher_alive() {
        let dir = TempDir::new().unwrap();
        let pid_file = PidFile::new(dir.path().join("dsctl.pid"));

        let _lock = pid_file
            .acquire(PidRecord::starting(LaunchMode::Manual), &pattern())
            .unwrap();
        let err = pid_file
            .acquire(PidRecord::starting(LaunchMode::Manual), &pattern())
            .unwrap_err();

        assert!(matches!(err, PidFileError::AlreadyRunning(pid) if pid == std::process::id()));
    }

    #[test]
    fn stale_record_is_replaced() {
        let dir = TempDir::new().unwrap();
        let pid_file = PidFile::new(dir.path().join("dsctl.pid"));

        let mut stale = PidRecord::starting(LaunchMode::Manual);
        stale.pid = dead_pid();
        stale.state = PidState::Running;
        pid_file.overwrite(&stale).unwrap();

        let lock = pid_file
            .acquire(PidRecord::starting(LaunchMode::Service), &pattern())
            .unwrap();
        assert_eq!(lock.record().mode, LaunchMode::Service);
    }

    #[test]
    fn reused_pid_with_foreign_command_is_stale() {
        let dir = TempDir::new().unwrap();
        let pid_file = PidFile::new(dir.path().join("dsctl.pid"));

        // our own pid is alive but does not run the entry point
        let mut record = PidRecord::starting(LaunchMode::Manual);
        record.state = PidState::Running;
        pid_file.overwrite(&record).unwrap();

        assert!(pid_file.live_record(&pattern()).is_none());
        assert!(pid_file
            .acquire(PidRecord::starting(LaunchMode::Manual), &pattern())
            .is_ok());
    }

    #[test]
    fn starting_claim_naming_foreign_process_is_stale() {
        let dir = TempDir::new().unwrap();
        let pid_file = PidFile::new(dir.path().join("dsctl.pid"));

        // launcher died before spawning; its pid now belongs to something else
        let mut sleeper = Command::new("sleep").arg("30").spawn().unwrap();
        let mut abandoned = PidRecord::starting(LaunchMode::Manual);
        abandoned.pid = sleeper.id();
        abandoned.launcher_pid = sleeper.id();
        pid_file.overwrite(&abandoned).unwrap();

        let acquired = pid_file.acquire(PidRecord::starting(LaunchMode::Manual), &pattern());

        sleeper.kill().unwrap();
        sleeper.wait().unwrap();

        let lock = acquired.unwrap();
        assert_eq!(lock.record().launcher_pid, std::process::id());
    }

    #[test]
    fn old_starting_claim_is_stale_even_for_a_launcher() {
        let dir = TempDir::new().unwrap();
        let pid_file = PidFile::new(dir.path().join("dsctl.pid"));

        let mut abandoned = PidRecord::starting(LaunchMode::Manual);
        abandoned.started_at = Utc::now() - chrono::Duration::seconds(120);
        pid_file.overwrite(&abandoned).unwrap();

        assert!(pid_file.live_record(&pattern()).is_none());
        assert!(pid_file
            .acquire(PidRecord::starting(LaunchMode::Manual), &pattern())
            .is_ok());
    }

    #[test]
    fn malformed_file_reads_as_error_and_lenient_none() {
        let dir = TempDir::new().unwrap();
        let pid_file = PidFile::new(dir.path().join("dsctl.pid"));
        std::fs::write(pid_file.path(), "12345").unwrap();

        assert!(matches!(pid_file.read(), Err(PidFileError::Malformed { .. })));
        assert!(pid_file.read_lenient().is_none());
    }

    #[test]
    fn mark_running_and_persist_keep_the_file() {
        let dir = TempDir::new().unwrap();
        let pid_file = PidFile::new(dir.path().join("dsctl.pid"));

        let mut lock = pid_file
            .acquire(PidRecord::starting(LaunchMode::Manual), &pattern())
            .unwrap();
        lock.mark_running(4242, vec!["python".into(), "main.py".into()])
            .unwrap();
        let record = lock.persist();

        let stored = pid_file.read().unwrap().unwrap();
        assert_eq!(stored, record);
        assert_eq!(stored.pid, 4242);
        assert_eq!(stored.state, PidState::Running);
    }

    #[test]
    fn drop_leaves_a_file_claimed_by_another_launch() {
        let dir = TempDir::new().unwrap();
        let pid_file = PidFile::new(dir.path().join("dsctl.pid"));

        let lock = pid_file
            .acquire(PidRecord::starting(LaunchMode::Manual), &pattern())
            .unwrap();
        let mut newer = lock.record().clone();
        newer.launcher_pid += 1;
        pid_file.overwrite(&newer).unwrap();

        drop(lock);
        assert_eq!(pid_file.read().unwrap(), Some(newer));
    }

    #[test]
    fn release_missing_file_is_ok() {
        let dir = TempDir::new().unwrap();
        let pid_file = PidFile::new(dir.path().join("absent.pid"));
        assert!(pid_file.release().is_ok());
        assert!(pid_file.read().unwrap().is_none());
    }
}
