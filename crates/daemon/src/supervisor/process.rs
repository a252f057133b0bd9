//! Workers as separate OS processes.
//!
//! Each worker is spawned from `worker.command` with the allocated port in
//! `worker.port_env`, in its own process group so it outlives an
//! orchestrator restart and can be adopted again from its pid. Signals go
//! to the whole group, so helpers a wrapper script forks die with it.
//!
//! A pid alone does not identify a worker once the orchestrator restarts:
//! the worker may have died and the pid been reused. Every worker carries
//! its id in [`WORKER_ID_ENV`], and a pid is only treated as the worker
//! while its environment still says so.

use std::ffi::OsString;
use std::process::Stdio;
use std::time::Duration;

use dashmap::DashMap;
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind};
use tokio::process::{Child, Command};
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use super::{HealthProbe, SupervisorError, WorkerHandle, WorkerLauncher};
use crate::config::WorkerConfig;

/// Environment variable carrying the worker id into the worker process.
pub const WORKER_ID_ENV: &str = "ORCHESTRATOR_WORKER_ID";

/// How often a recovered pid is checked while waiting for it to exit.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Launches workers with `tokio::process`.
pub struct ProcessLauncher {
    command: String,
    args: Vec<String>,
    port_env: String,
    stop_grace: Duration,
    probe: HealthProbe,
    children: DashMap<String, Child>,
}

impl ProcessLauncher {
    pub fn new(config: &WorkerConfig) -> Self {
        Self {
            command: config.command.clone(),
            args: config.args.clone(),
            port_env: config.port_env.clone(),
            stop_grace: config.stop_grace(),
            probe: HealthProbe::new(&config.host, &config.health_path),
            children: DashMap::new(),
        }
    }

    /// Stop a child this launcher spawned, along with its process group.
    ///
    /// `group` is the recorded pid, used when the leader was already reaped
    /// so helpers left in its group still get killed.
    async fn stop_child(
        &self,
        worker_id: &str,
        mut child: Child,
        group: Option<u32>,
    ) -> Result<(), SupervisorError> {
        let Some(pid) = child.id() else {
            return match group {
                Some(pid) => signal_group(worker_id, pid, Signal::SIGKILL),
                None => Ok(()),
            };
        };
        signal_group(worker_id, pid, Signal::SIGTERM)?;

        let exited = match timeout(self.stop_grace, child.wait()).await {
            Ok(Ok(status)) => {
                debug!(worker_id = %worker_id, status = %status, "worker exited");
                true
            }
            Ok(Err(e)) => {
                return Err(SupervisorError::Stop {
                    worker_id: worker_id.to_string(),
                    reason: e.to_string(),
                })
            }
            Err(_) => false,
        };

        if !exited {
            warn!(worker_id = %worker_id, pid = pid, "worker ignored SIGTERM, killing");
        }
        // Whatever is left of the group does not outlive the worker.
        signal_group(worker_id, pid, Signal::SIGKILL)?;
        if !exited {
            child.wait().await.map_err(|e| SupervisorError::Stop {
                worker_id: worker_id.to_string(),
                reason: e.to_string(),
            })?;
        }
        Ok(())
    }

    /// Stop a worker known only by pid, e.g. one started before a restart.
    async fn stop_pid(&self, worker_id: &str, pid: u32) -> Result<(), SupervisorError> {
        if !runs_worker(pid, worker_id) {
            debug!(worker_id = %worker_id, pid = pid, "pid no longer runs this worker");
            return Ok(());
        }
        signal_group(worker_id, pid, Signal::SIGTERM)?;

        let deadline = Instant::now() + self.stop_grace;
        while Instant::now() < deadline {
            if !runs_worker(pid, worker_id) {
                return signal_group(worker_id, pid, Signal::SIGKILL);
            }
            tokio::time::sleep(EXIT_POLL_INTERVAL).await;
        }

        warn!(worker_id = %worker_id, pid = pid, "worker ignored SIGTERM, killing");
        signal_group(worker_id, pid, Signal::SIGKILL)
    }
}

impl WorkerLauncher for ProcessLauncher {
    async fn start(&self, worker_id: &str, port: u16) -> Result<WorkerHandle, SupervisorError> {
        // A previous attempt under the same id must not linger.
        if let Some((_, old)) = self.children.remove(worker_id) {
            self.stop_child(worker_id, old, None).await?;
        }

        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args)
            .env(&self.port_env, port.to_string())
            .env(WORKER_ID_ENV, worker_id)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .process_group(0)
            .kill_on_drop(false);

        let child = cmd
            .spawn()
            .map_err(|e| SupervisorError::Spawn(format!("{}: {}", self.command, e)))?;
        let pid = child.id();
        self.children.insert(worker_id.to_string(), child);

        info!(
            worker_id = %worker_id,
            port = port,
            pid = pid.unwrap_or_default(),
            command = %self.command,
            "worker process spawned"
        );

        Ok(WorkerHandle {
            worker_id: worker_id.to_string(),
            port,
            pid,
        })
    }

    async fn stop(&self, handle: &WorkerHandle) -> Result<(), SupervisorError> {
        if let Some((_, child)) = self.children.remove(&handle.worker_id) {
            return self.stop_child(&handle.worker_id, child, handle.pid).await;
        }
        match handle.pid {
            Some(pid) => self.stop_pid(&handle.worker_id, pid).await,
            None => Ok(()),
        }
    }

    async fn health_check(&self, handle: &WorkerHandle) -> bool {
        let exited = match self.children.get_mut(&handle.worker_id) {
            Some(mut child) => !matches!(child.try_wait(), Ok(None)),
            None => match handle.pid {
                Some(pid) => !runs_worker(pid, &handle.worker_id),
                None => true,
            },
        };
        if exited {
            return false;
        }
        self.probe.check(handle.port).await
    }
}

/// Whether `pid` is a live process spawned as `worker_id`.
///
/// A process whose environment cannot be read (exited, zombie, another
/// user) does not count.
fn runs_worker(pid: u32, worker_id: &str) -> bool {
    let pid = sysinfo::Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes_specifics(
        ProcessesToUpdate::Some(&[pid]),
        true,
        ProcessRefreshKind::nothing().with_environ(UpdateKind::Always),
    );

    let marker = OsString::from(format!("{WORKER_ID_ENV}={worker_id}"));
    system.process(pid).is_some_and(|process| {
        process
            .environ()
            .iter()
            .any(|var| AsRef::<std::ffi::OsStr>::as_ref(var) == marker.as_os_str())
    })
}

/// Signal the process group led by `pid`. A group that is already gone is
/// not an error.
fn signal_group(worker_id: &str, pid: u32, signal: Signal) -> Result<(), SupervisorError> {
    let Ok(raw) = i32::try_from(pid) else {
        return Err(SupervisorError::Stop {
            worker_id: worker_id.to_string(),
            reason: format!("invalid pid {pid}"),
        });
    };
    match killpg(Pid::from_raw(raw), signal) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(SupervisorError::Stop {
            worker_id: worker_id.to_string(),
            reason: format!("{signal:?}: {e}"),
        }),
    }
}
