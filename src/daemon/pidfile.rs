//! Pid file tracking the background daemon

use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tracing::{debug, warn};

use super::DaemonError;
use crate::atomic::write_atomic;
use crate::error::PersistenceError;

/// How often `stop` polls for the process to exit
const STOP_POLL: Duration = Duration::from_millis(100);

/// Whether the daemon recorded in the pid file is alive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonStatus {
    /// No pid file, or a stale one (now removed)
    Stopped,
    /// Process with this pid is alive
    Running(i32),
}

/// How `stop` ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Nothing was running
    NotRunning,
    /// Exited after SIGTERM
    Stopped(i32),
    /// Still alive after the grace period, so SIGKILL was sent
    Killed(i32),
}

/// Whether `pid` names a live process we may signal
pub fn is_alive(pid: i32) -> bool {
    kill(Pid::from_raw(pid), None).is_ok()
}

/// `murmur.pid` in the data directory
#[derive(Debug, Clone)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Pid file at `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        PidFile { path: path.into() }
    }

    /// Backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record `pid`, replacing the file atomically
    pub fn write(&self, pid: u32) -> Result<(), PersistenceError> {
        write_atomic(&self.path, format!("{pid}\n").as_bytes())
    }

    /// The recorded pid, if any. Unparseable contents count as none.
    pub fn read(&self) -> Result<Option<i32>, PersistenceError> {
        match std::fs::read_to_string(&self.path) {
            Ok(contents) => Ok(contents.trim().parse().ok().filter(|pid| *pid > 0)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(PersistenceError::io(&self.path, e)),
        }
    }

    /// Delete the file if present
    pub fn remove(&self) -> Result<(), PersistenceError> {
        match std::fs::remove_file(&self.path) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
                Err(PersistenceError::io(&self.path, e))
            }
            _ => Ok(()),
        }
    }

    /// Check the recorded process, clearing a stale file
    pub fn status(&self) -> Result<DaemonStatus, PersistenceError> {
        let Some(pid) = self.read()? else {
            if self.path.exists() {
                self.remove()?;
            }
            return Ok(DaemonStatus::Stopped);
        };
        if is_alive(pid) {
            return Ok(DaemonStatus::Running(pid));
        }
        debug!(pid, "removing stale pid file");
        self.remove()?;
        Ok(DaemonStatus::Stopped)
    }

    /// SIGTERM the daemon, wait up to `grace`, then SIGKILL
    pub async fn stop(&self, grace: Duration) -> Result<StopOutcome, DaemonError> {
        let DaemonStatus::Running(pid) = self.status()? else {
            return Ok(StopOutcome::NotRunning);
        };

        let target = Pid::from_raw(pid);
        kill(target, Signal::SIGTERM).map_err(|source| DaemonError::Signal { pid, source })?;

        let deadline = tokio::time::Instant::now() + grace;
        while tokio::time::Instant::now() < deadline {
            tokio::time::sleep(STOP_POLL).await;
            if !is_alive(pid) {
                self.remove()?;
                return Ok(StopOutcome::Stopped(pid));
            }
        }

        warn!(pid, "daemon ignored SIGTERM, killing");
        let _ = kill(target, Signal::SIGKILL);
        tokio::time::sleep(STOP_POLL * 2).await;
        self.remove()?;
        Ok(StopOutcome::Killed(pid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_read_remove() {
        let tmp = tempfile::tempdir().unwrap();
        let pidfile = PidFile::new(tmp.path().join("murmur.pid"));
        assert_eq!(pidfile.read().unwrap(), None);

        pidfile.write(4242).unwrap();
        assert_eq!(pidfile.read().unwrap(), Some(4242));
        assert_eq!(std::fs::read_to_string(pidfile.path()).unwrap(), "4242\n");

        pidfile.remove().unwrap();
        pidfile.remove().unwrap();
        assert!(!pidfile.path().exists());
    }

    #[test]
    fn test_status_of_own_process() {
        let tmp = tempfile::tempdir().unwrap();
        let pidfile = PidFile::new(tmp.path().join("murmur.pid"));
        pidfile.write(std::process::id()).unwrap();
        assert_eq!(
            pidfile.status().unwrap(),
            DaemonStatus::Running(std::process::id() as i32)
        );
    }

    #[test]
    fn test_garbage_pid_file_is_cleared() {
        let tmp = tempfile::tempdir().unwrap();
        let pidfile = PidFile::new(tmp.path().join("murmur.pid"));
        std::fs::write(pidfile.path(), "not a pid").unwrap();

        assert_eq!(pidfile.status().unwrap(), DaemonStatus::Stopped);
        assert!(!pidfile.path().exists());
    }

    #[tokio::test]
    async fn test_stop_terminates_child() {
        let tmp = tempfile::tempdir().unwrap();
        let pidfile = PidFile::new(tmp.path().join("murmur.pid"));

        let mut child = tokio::process::Command::new("sleep")
            .arg("30")
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let pid = child.id().unwrap();
        pidfile.write(pid).unwrap();

        // reap concurrently so the pid disappears once signalled
        let reaper = tokio::spawn(async move { child.wait().await });
        let outcome = pidfile.stop(Duration::from_secs(5)).await.unwrap();
        assert_eq!(outcome, StopOutcome::Stopped(pid as i32));
        assert!(!pidfile.path().exists());
        reaper.await.unwrap().unwrap();

        assert_eq!(pidfile.stop(Duration::from_secs(1)).await.unwrap(), StopOutcome::NotRunning);
    }
}
