//! Durable execution of session lifecycle operations.
//!
//! Creating and tearing down a session are multi-step operations with
//! external side effects (a reserved port, a running worker). Each one is
//! journaled in the state store before its first side effect and advances
//! the journal after every step, so a crash at any point can be resumed by
//! [`Engine::recover`] without repeating completed effects:
//!
//! - create: reserve port, launch worker and wait for ready, commit binding
//! - teardown: stop worker, then terminate session and free its port
//!
//! Operations on one session id are serialized through [`SessionLocks`];
//! different sessions proceed concurrently. A create holds its session lock
//! from the moment it is journaled until it commits or rolls back, so a
//! journaled create whose lock is free was abandoned by a dropped caller
//! and is rolled back by [`Engine::abort_abandoned_creates`] or by a
//! teardown of the same session.

mod locks;

pub use locks::{SessionGuard, SessionLocks};

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use protocol::{SessionData, SessionState};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{OrchestratorError, Result};
use crate::ports::PortAllocator;
use crate::store::{
    now_millis, Operation, OperationKind, OperationStep, Session, Store, TerminationReason,
    Worker, WorkerState,
};
use crate::supervisor::{WorkerHandle, WorkerLauncher, WorkerSupervisor};

/// Attempts for a compare-and-set transition before giving up.
const CONFLICT_RETRIES: u32 = 3;

/// What startup recovery and reconciliation did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Journaled creates driven to an active binding.
    pub creates_completed: usize,
    /// Journaled creates rolled back.
    pub creates_aborted: usize,
    /// Journaled teardowns finished.
    pub teardowns_completed: usize,
    /// Sessions terminated because their worker could not be confirmed.
    pub sessions_reconciled: usize,
    /// Port reservations with no live owner that were released.
    pub reservations_released: usize,
}

/// Runs create and teardown operations against the store and supervisor.
pub struct Engine<L> {
    store: Store,
    ports: PortAllocator,
    supervisor: WorkerSupervisor<L>,
    locks: SessionLocks,
    ttl: Duration,
}

impl<L: WorkerLauncher> Engine<L> {
    pub fn new(
        store: Store,
        ports: PortAllocator,
        supervisor: WorkerSupervisor<L>,
        ttl: Duration,
    ) -> Self {
        Self {
            store,
            ports,
            supervisor,
            locks: SessionLocks::new(),
            ttl,
        }
    }

    /// Wire an engine from configuration.
    pub fn from_config(store: Store, config: &Config, launcher: L) -> Self {
        let host = config
            .worker
            .host
            .parse()
            .unwrap_or(std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST));
        let ports = PortAllocator::new(store.clone(), &config.ports, host);
        let supervisor = WorkerSupervisor::new(launcher, &config.worker);
        Self::new(store, ports, supervisor, config.session.ttl())
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn supervisor(&self) -> &WorkerSupervisor<L> {
        &self.supervisor
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    // ===== Create =====

    /// Create a session backed by a freshly started worker.
    ///
    /// Returns once the binding is committed and the session is `Active`.
    /// On failure nothing is left behind: no pending session, no port
    /// reservation, no worker.
    pub async fn create_session(&self, data: SessionData) -> Result<Session> {
        let now = now_millis();
        let session = Session {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            ttl_deadline: now.saturating_add(self.ttl.as_millis() as u64),
            status: SessionState::Pending,
            data,
            worker_id: None,
            termination_reason: None,
        };
        let op = Operation {
            id: Uuid::new_v4().to_string(),
            kind: OperationKind::Create,
            session_id: session.id.clone(),
            step: OperationStep::Started,
            worker_id: Uuid::new_v4().to_string(),
            port: None,
            pid: None,
            reason: None,
            created_at: now,
        };

        let _guard = self.locks.acquire(&session.id).await;
        self.store.begin_create(&op, &session)?;
        info!(session_id = %session.id, op_id = %op.id, "creating session");

        self.drive_create(&op).await
    }

    /// [`create_session`](Self::create_session) on its own task.
    ///
    /// The create runs to commit or rollback even if the caller stops
    /// waiting for it.
    pub async fn create_session_detached(self: &Arc<Self>, data: SessionData) -> Result<Session> {
        let engine = Arc::clone(self);
        tokio::spawn(async move { engine.create_session(data).await })
            .await
            .map_err(|e| OrchestratorError::Internal(format!("create task failed: {e}")))?
    }

    /// Run (or resume) a journaled create, rolling it back on failure.
    async fn drive_create(&self, op: &Operation) -> Result<Session> {
        match self.run_create_steps(op).await {
            Ok(session) => Ok(session),
            Err(err) => {
                self.abort_create(op).await;
                warn!(session_id = %op.session_id, error = %err, "session create failed");
                Err(err)
            }
        }
    }

    async fn run_create_steps(&self, op: &Operation) -> Result<Session> {
        // (a) reserve a port; a replay gets back the port it already holds
        let port = self.ports.allocate(&op.id)?;
        if op.step < OperationStep::PortReserved || op.port != Some(port) {
            self.store.record_port_reserved(&op.id, port)?;
        }

        // (b) launch, adopting a worker this operation already started
        let handle = match self.adopt_existing_worker(op, port).await? {
            Some(handle) => handle,
            None => self.launch_worker(op, port).await?,
        };
        self.store
            .record_worker_launched(&op.id, &handle.worker_id, handle.pid)?;

        // (c) commit
        let session = self.commit_binding(op).await?;
        info!(
            session_id = %session.id,
            worker_id = %handle.worker_id,
            port = port,
            "session active"
        );
        Ok(session)
    }

    /// Reuse the worker recorded for this operation if it is still healthy.
    /// A recorded worker that is not is stopped so it cannot linger.
    async fn adopt_existing_worker(
        &self,
        op: &Operation,
        port: u16,
    ) -> Result<Option<WorkerHandle>> {
        let Some(worker) = self.store.get_worker(&op.worker_id)? else {
            return Ok(None);
        };
        let handle = WorkerHandle::from(&worker);

        if worker.port == port && self.supervisor.health_check(&handle).await {
            info!(
                session_id = %op.session_id,
                worker_id = %worker.id,
                port = port,
                "adopting running worker"
            );
            return Ok(Some(handle));
        }

        debug!(worker_id = %worker.id, "recorded worker not healthy, replacing");
        if let Err(e) = self.supervisor.stop(&handle).await {
            warn!(worker_id = %worker.id, error = %e, "failed to stop stale worker");
        }
        Ok(None)
    }

    async fn launch_worker(&self, op: &Operation, port: u16) -> Result<WorkerHandle> {
        self.store.record_worker_starting(&Worker {
            id: op.worker_id.clone(),
            session_id: op.session_id.clone(),
            port,
            status: WorkerState::Starting,
            started_at: now_millis(),
            pid: None,
        })?;

        let store = &self.store;
        let handle = self
            .supervisor
            .start_observed(&op.worker_id, port, |handle| {
                if let Err(e) = store.record_worker_pid(&handle.worker_id, handle.pid) {
                    warn!(worker_id = %handle.worker_id, error = %e, "failed to record worker pid");
                }
            })
            .await?;
        Ok(handle)
    }

    async fn commit_binding(&self, op: &Operation) -> Result<Session> {
        for attempt in 1..=CONFLICT_RETRIES {
            match self
                .store
                .commit_binding(&op.id, &op.session_id, &op.worker_id)
            {
                Ok(session) => return Ok(session),
                Err(e) if e.is_conflict() => {
                    // A replayed commit may already have landed.
                    if let Some(session) = self.store.get_session(&op.session_id)? {
                        if session.status == SessionState::Active
                            && session.worker_id.as_deref() == Some(op.worker_id.as_str())
                        {
                            self.store.remove_operation(&op.id)?;
                            return Ok(session);
                        }
                    }
                    debug!(session_id = %op.session_id, attempt = attempt, error = %e, "commit conflict");
                    tokio::task::yield_now().await;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(OrchestratorError::Conflict(op.session_id.clone()))
    }

    /// Roll back every journaled create nobody is driving any more.
    ///
    /// Returns how many were rolled back.
    pub async fn abort_abandoned_creates(&self) -> Result<usize> {
        let mut aborted = 0;
        for op in self.store.list_operations()? {
            if op.kind != OperationKind::Create {
                continue;
            }
            let Some(_guard) = self.locks.try_acquire(&op.session_id) else {
                continue;
            };
            if self.abort_abandoned_create(&op.session_id).await? {
                aborted += 1;
            }
        }
        Ok(aborted)
    }

    /// Roll back the journaled create of `session_id`, if any.
    ///
    /// The caller holds the session lock, so no live create owns the entry.
    async fn abort_abandoned_create(&self, session_id: &str) -> Result<bool> {
        let op = self
            .store
            .list_operations()?
            .into_iter()
            .find(|op| op.kind == OperationKind::Create && op.session_id == session_id);
        let Some(op) = op else {
            return Ok(false);
        };

        warn!(
            op_id = %op.id,
            session_id = %session_id,
            step = op.step.as_str(),
            "rolling back abandoned create"
        );
        self.abort_create(&op).await;
        Ok(true)
    }

    /// Best-effort rollback of a create that will not complete.
    async fn abort_create(&self, op: &Operation) {
        match self.store.get_worker(&op.worker_id) {
            Ok(Some(worker)) if worker.status != WorkerState::Ready => {
                if let Err(e) = self.supervisor.stop(&WorkerHandle::from(&worker)).await {
                    warn!(worker_id = %worker.id, error = %e, "failed to stop worker of aborted create");
                }
            }
            Ok(_) => {}
            Err(e) => warn!(op_id = %op.id, error = %e, "failed to read worker of aborted create"),
        }

        if let Err(e) = self
            .store
            .abort_create(&op.id, &op.session_id, &op.worker_id)
        {
            error!(op_id = %op.id, session_id = %op.session_id, error = %e, "failed to roll back create");
        }
    }

    // ===== Read =====

    /// A readable (not terminated, not expired) session.
    pub fn get_session(&self, id: &str) -> Result<Session> {
        match self.store.get_session(id)? {
            Some(session) if session.is_readable_at(now_millis()) => Ok(session),
            _ => Err(OrchestratorError::SessionNotFound(id.to_string())),
        }
    }

    /// All readable sessions, newest first.
    pub fn list_sessions(&self) -> Result<Vec<Session>> {
        let now = now_millis();
        Ok(self
            .store
            .list_sessions()?
            .into_iter()
            .filter(|s| s.is_readable_at(now))
            .collect())
    }

    // ===== Teardown =====

    /// Delete a session.
    ///
    /// Fails with [`OrchestratorError::SessionNotFound`] if the session is
    /// unknown or already terminated. A session past its TTL is reclaimed
    /// as expired and also reported as not found. A `Pending` session whose
    /// create was abandoned is rolled back and reported as not found.
    pub async fn delete_session(&self, id: &str) -> Result<()> {
        self.teardown(id, TerminationReason::Deleted).await
    }

    /// Tear down a session whose TTL has passed.
    ///
    /// Returns `false` if the session is not due or is already gone.
    pub async fn expire_session(&self, id: &str) -> Result<bool> {
        match self.teardown(id, TerminationReason::Expired).await {
            Ok(()) => Ok(true),
            Err(OrchestratorError::SessionNotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn teardown(&self, id: &str, requested: TerminationReason) -> Result<()> {
        let _guard = self.locks.acquire(id).await;

        for attempt in 1..=CONFLICT_RETRIES {
            let session = match self.store.get_session(id)? {
                Some(s) if s.status == SessionState::Active => s,
                Some(s) if s.status == SessionState::Pending => {
                    self.abort_abandoned_create(id).await?;
                    return Err(OrchestratorError::SessionNotFound(id.to_string()));
                }
                _ => return Err(OrchestratorError::SessionNotFound(id.to_string())),
            };

            let expired = session.is_expired_at(now_millis());
            let reason = match requested {
                TerminationReason::Expired if !expired => {
                    return Err(OrchestratorError::SessionNotFound(id.to_string()));
                }
                TerminationReason::Deleted if expired => TerminationReason::Expired,
                other => other,
            };

            let Some(worker_id) = session.worker_id.clone() else {
                return Err(OrchestratorError::Internal(format!(
                    "active session {id} has no worker"
                )));
            };

            let op = Operation {
                id: Uuid::new_v4().to_string(),
                kind: OperationKind::Delete,
                session_id: id.to_string(),
                step: OperationStep::Started,
                worker_id,
                port: None,
                pid: None,
                reason: Some(reason),
                created_at: now_millis(),
            };

            match self.store.begin_delete(&op) {
                Ok(()) => {
                    self.finish_teardown(&op).await?;
                    if reason == requested {
                        return Ok(());
                    }
                    return Err(OrchestratorError::SessionNotFound(id.to_string()));
                }
                Err(e) if e.is_conflict() => {
                    debug!(session_id = %id, attempt = attempt, error = %e, "teardown conflict");
                    tokio::task::yield_now().await;
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(OrchestratorError::Conflict(id.to_string()))
    }

    /// Stop the worker and terminate the session of a journaled teardown.
    async fn finish_teardown(&self, op: &Operation) -> Result<()> {
        let reason = op.reason.unwrap_or(TerminationReason::Deleted);

        if let Some(worker) = self.store.get_worker(&op.worker_id)? {
            if worker.status.is_live() {
                if let Err(e) = self.supervisor.stop(&WorkerHandle::from(&worker)).await {
                    let err = OrchestratorError::from(e);
                    warn!(
                        session_id = %op.session_id,
                        worker_id = %worker.id,
                        error = %err,
                        "worker did not stop cleanly, terminating session anyway"
                    );
                }
            }
        }

        for attempt in 1..=CONFLICT_RETRIES {
            match self
                .store
                .mark_terminated(Some(&op.id), &op.session_id, reason)
            {
                Ok(()) => {
                    info!(session_id = %op.session_id, reason = %reason, "session terminated");
                    return Ok(());
                }
                Err(e) if e.is_conflict() => {
                    let terminated = self
                        .store
                        .get_session(&op.session_id)?
                        .is_none_or(|s| s.status == SessionState::Terminated);
                    if terminated {
                        self.store.remove_operation(&op.id)?;
                        return Ok(());
                    }
                    debug!(session_id = %op.session_id, attempt = attempt, "terminate conflict");
                    tokio::task::yield_now().await;
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(OrchestratorError::Conflict(op.session_id.clone()))
    }

    // ===== Restart =====

    /// Resume every journaled operation left by a previous run.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();

        for op in self.store.list_operations()? {
            let _guard = self.locks.acquire(&op.session_id).await;
            info!(
                op_id = %op.id,
                session_id = %op.session_id,
                kind = op.kind.as_str(),
                step = op.step.as_str(),
                "resuming operation"
            );

            match op.kind {
                OperationKind::Create => match self.drive_create(&op).await {
                    Ok(_) => report.creates_completed += 1,
                    Err(_) => report.creates_aborted += 1,
                },
                OperationKind::Delete => {
                    self.finish_teardown(&op).await?;
                    report.teardowns_completed += 1;
                }
            }
        }

        Ok(report)
    }

    /// Bring recorded state in line with reality.
    ///
    /// Every `Ready` worker is health-checked; one that cannot be confirmed
    /// is stopped (best effort), marked `Stopped` and its session
    /// `Terminated` with reason `reconciled`. Active sessions without a
    /// consistent binding get the same treatment. Port reservations with no
    /// live owner are released. Run after [`recover`](Self::recover).
    pub async fn reconcile(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();

        for worker in self.store.workers_in_state(WorkerState::Ready)? {
            let _guard = self.locks.acquire(&worker.session_id).await;
            let handle = WorkerHandle::from(&worker);
            if self.supervisor.health_check(&handle).await {
                continue;
            }

            warn!(
                session_id = %worker.session_id,
                worker_id = %worker.id,
                port = worker.port,
                "worker unconfirmable, reconciling"
            );
            if let Err(e) = self.supervisor.stop(&handle).await {
                warn!(worker_id = %worker.id, error = %e, "failed to stop unconfirmable worker");
            }
            match self
                .store
                .mark_terminated(None, &worker.session_id, TerminationReason::Reconciled)
            {
                Ok(()) => report.sessions_reconciled += 1,
                Err(e) if e.is_conflict() => self.store.retire_orphan_worker(&worker.id)?,
                Err(e) => return Err(e.into()),
            }
        }

        for session in self.store.list_sessions()? {
            if session.status != SessionState::Active {
                continue;
            }
            let _guard = self.locks.acquire(&session.id).await;
            if self.store.get_worker_for_session(&session.id)?.is_none() {
                warn!(session_id = %session.id, "active session without worker, reconciling");
                self.store
                    .mark_terminated(None, &session.id, TerminationReason::Reconciled)?;
                report.sessions_reconciled += 1;
            }
        }

        let ops = self.store.list_operations()?;
        let journaled: HashSet<&str> = ops.iter().map(|op| op.worker_id.as_str()).collect();
        for worker in self.store.live_workers()? {
            if worker.status != WorkerState::Ready && !journaled.contains(worker.id.as_str()) {
                warn!(worker_id = %worker.id, status = worker.status.as_str(), "retiring orphan worker");
                if let Err(e) = self.supervisor.stop(&WorkerHandle::from(&worker)).await {
                    warn!(worker_id = %worker.id, error = %e, "failed to stop orphan worker");
                }
                self.store.retire_orphan_worker(&worker.id)?;
            }
        }

        let mut owners: HashSet<String> = ops.into_iter().map(|op| op.id).collect();
        owners.extend(self.store.live_workers()?.into_iter().map(|w| w.id));
        for (port, owner) in self.store.list_reservations()? {
            if !owners.contains(&owner) {
                debug!(port = port, owner = %owner, "releasing stale reservation");
                self.ports.release(port)?;
                report.reservations_released += 1;
            }
        }

        Ok(report)
    }

    /// Stop every running worker without touching session state.
    ///
    /// The next startup's reconciliation terminates the affected sessions.
    pub async fn stop_all_workers(&self) -> usize {
        let workers = match self.store.live_workers() {
            Ok(w) => w,
            Err(e) => {
                error!(error = %e, "failed to list workers for shutdown");
                return 0;
            }
        };

        let mut stopped = 0;
        for worker in workers {
            match self.supervisor.stop(&WorkerHandle::from(&worker)).await {
                Ok(()) => stopped += 1,
                Err(e) => warn!(worker_id = %worker.id, error = %e, "failed to stop worker"),
            }
        }
        stopped
    }
}
