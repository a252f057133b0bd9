//! PID file utilities for single-instance detection.
//!
//! One orchestrator owns every worker recorded in its state store, so two
//! orchestrators must never share a data directory. `serve` takes a
//! [`PidFile`] in the data directory before touching the store; stale
//! files left by a dead process are cleaned up automatically.
//!
//! ## Example
//!
//! ```rust
//! use daemon::pidfile::PidFile;
//!
//! let dir = tempfile::tempdir().unwrap();
//! let path = dir.path().join("orchestrator.pid");
//!
//! let guard = PidFile::acquire(&path).unwrap();
//! assert!(PidFile::acquire(&path).is_err());
//! drop(guard);
//! assert!(!path.exists());
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, warn};

/// Errors taking the pid file.
#[derive(Debug, Error)]
pub enum PidFileError {
    #[error("another orchestrator is already running with PID {0}")]
    AlreadyRunning(u32),

    #[error("failed to write pid file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Held for the lifetime of a running orchestrator. Removes the file on drop.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Write the current PID to `path` unless a live process already holds it.
    pub fn acquire<P: AsRef<Path>>(path: P) -> Result<Self, PidFileError> {
        let path = path.as_ref();

        if let Some(pid) = read_running_pid(path) {
            return Err(PidFileError::AlreadyRunning(pid));
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| PidFileError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        }
        fs::write(path, format!("{}\n", std::process::id())).map_err(|source| {
            PidFileError::Io {
                path: path.to_path_buf(),
                source,
            }
        })?;

        debug!(path = %path.display(), "pid file written");
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "failed to remove pid file");
        }
    }
}

/// Get the PID recorded in `path`, if that process is still running.
///
/// Automatically cleans up stale or unparsable PID files.
pub fn read_running_pid(path: &Path) -> Option<u32> {
    let pid_str = fs::read_to_string(path).ok()?;

    let pid: u32 = match pid_str.trim().parse() {
        Ok(p) => p,
        Err(_) => {
            cleanup_stale_pid_file(path);
            return None;
        }
    };

    if is_process_running(pid) {
        Some(pid)
    } else {
        cleanup_stale_pid_file(path);
        None
    }
}

/// Check if a process with the given PID is running.
///
/// On Linux, this checks if `/proc/{pid}/stat` exists.
/// On other Unix systems, this sends signal 0.
pub fn is_process_running(pid: u32) -> bool {
    #[cfg(target_os = "linux")]
    {
        let proc_path = format!("/proc/{}/stat", pid);
        Path::new(&proc_path).exists()
    }

    #[cfg(not(target_os = "linux"))]
    {
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        i32::try_from(pid)
            .map(|raw| kill(Pid::from_raw(raw), None).is_ok())
            .unwrap_or(false)
    }
}

/// Remove a stale PID file.
fn cleanup_stale_pid_file(path: &Path) {
    let _ = fs::remove_file(path);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_is_process_running_current() {
        let pid = std::process::id();
        assert!(
            is_process_running(pid),
            "Current process should be detected as running"
        );
    }

    #[test]
    fn test_is_process_running_invalid() {
        assert!(
            !is_process_running(4_000_000_000),
            "Invalid PID should not be running"
        );
    }

    #[test]
    fn test_acquire_writes_and_drop_removes() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("data").join("orchestrator.pid");

        let guard = PidFile::acquire(&path).unwrap();
        assert_eq!(guard.path(), path.as_path());
        let contents = fs::read_to_string(&path).unwrap();
        assert_eq!(contents.trim(), std::process::id().to_string());
        assert_eq!(read_running_pid(&path), Some(std::process::id()));

        drop(guard);
        assert!(!path.exists());
    }

    #[test]
    fn test_acquire_rejects_live_holder() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("orchestrator.pid");
        // PID 1 is always running
        fs::write(&path, "1\n").unwrap();

        let err = PidFile::acquire(&path).unwrap_err();
        assert!(matches!(err, PidFileError::AlreadyRunning(1)));
        assert!(path.exists());
    }

    #[test]
    fn test_stale_pid_file_is_replaced() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("orchestrator.pid");
        fs::write(&path, "4000000000\n").unwrap();

        assert_eq!(read_running_pid(&path), None);
        assert!(!path.exists(), "Stale PID file should be cleaned up");

        fs::write(&path, "4000000000\n").unwrap();
        let _guard = PidFile::acquire(&path).unwrap();
        assert_eq!(read_running_pid(&path), Some(std::process::id()));
    }

    #[test]
    fn test_garbage_pid_file_is_cleaned() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("orchestrator.pid");
        fs::write(&path, "not-a-pid").unwrap();

        assert_eq!(read_running_pid(&path), None);
        assert!(!path.exists());
    }

    #[test]
    fn test_missing_pid_file() {
        let temp_dir = TempDir::new().unwrap();
        assert_eq!(read_running_pid(&temp_dir.path().join("none.pid")), None);
    }
}
