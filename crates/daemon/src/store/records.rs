//! Durable record types held by the state store.

use std::time::{SystemTime, UNIX_EPOCH};

use protocol::{SessionData, SessionRecord, SessionState};

/// Current wall-clock time in Unix milliseconds.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub(crate) fn session_state_str(state: SessionState) -> &'static str {
    match state {
        SessionState::Pending => "pending",
        SessionState::Active => "active",
        SessionState::Terminated => "terminated",
    }
}

pub(crate) fn parse_session_state(s: &str) -> Option<SessionState> {
    match s {
        "pending" => Some(SessionState::Pending),
        "active" => Some(SessionState::Active),
        "terminated" => Some(SessionState::Terminated),
        _ => None,
    }
}

/// Why a session reached `Terminated`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    /// Explicit delete request.
    Deleted,
    /// TTL reaper.
    Expired,
    /// Startup reconciliation found its worker gone.
    Reconciled,
}

impl TerminationReason {
    pub fn as_str(self) -> &'static str {
        match self {
            TerminationReason::Deleted => "deleted",
            TerminationReason::Expired => "expired",
            TerminationReason::Reconciled => "reconciled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "deleted" => Some(TerminationReason::Deleted),
            "expired" => Some(TerminationReason::Expired),
            "reconciled" => Some(TerminationReason::Reconciled),
            _ => None,
        }
    }
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A session row.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub id: String,
    /// Unix milliseconds.
    pub created_at: u64,
    /// Unix milliseconds after which the session may be reaped.
    pub ttl_deadline: u64,
    pub status: SessionState,
    pub data: SessionData,
    /// Set only while `status` is `Active`.
    pub worker_id: Option<String>,
    pub termination_reason: Option<TerminationReason>,
}

impl Session {
    /// Whether the TTL deadline has passed at `now` (Unix milliseconds).
    pub fn is_expired_at(&self, now: u64) -> bool {
        now >= self.ttl_deadline
    }

    /// Whether clients may still read this session at `now`.
    pub fn is_readable_at(&self, now: u64) -> bool {
        self.status != SessionState::Terminated && !self.is_expired_at(now)
    }

    /// Wire representation; timestamps in Unix seconds.
    pub fn to_record(&self) -> SessionRecord {
        SessionRecord {
            id: self.id.clone(),
            created_at: self.created_at / 1000,
            expires_at: self.ttl_deadline / 1000,
            status: self.status,
            data: self.data.clone(),
        }
    }
}

/// Lifecycle of a worker record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Starting,
    Ready,
    Stopping,
    Stopped,
}

impl WorkerState {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkerState::Starting => "starting",
            WorkerState::Ready => "ready",
            WorkerState::Stopping => "stopping",
            WorkerState::Stopped => "stopped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "starting" => Some(WorkerState::Starting),
            "ready" => Some(WorkerState::Ready),
            "stopping" => Some(WorkerState::Stopping),
            "stopped" => Some(WorkerState::Stopped),
            _ => None,
        }
    }

    /// Starting, Ready and Stopping workers still own a process and a port.
    pub fn is_live(self) -> bool {
        !matches!(self, WorkerState::Stopped)
    }
}

/// A worker row.
#[derive(Debug, Clone, PartialEq)]
pub struct Worker {
    pub id: String,
    pub session_id: String,
    pub port: u16,
    pub status: WorkerState,
    /// Unix milliseconds.
    pub started_at: u64,
    /// OS process id, when the worker runs as a separate process.
    pub pid: Option<u32>,
}

/// Kind of a journaled multi-step operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Create,
    Delete,
}

impl OperationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationKind::Create => "create",
            OperationKind::Delete => "delete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "create" => Some(OperationKind::Create),
            "delete" => Some(OperationKind::Delete),
            _ => None,
        }
    }
}

/// Last completed step of a journaled operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum OperationStep {
    Started,
    PortReserved,
    WorkerLaunched,
}

impl OperationStep {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationStep::Started => "started",
            OperationStep::PortReserved => "port_reserved",
            OperationStep::WorkerLaunched => "worker_launched",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "started" => Some(OperationStep::Started),
            "port_reserved" => Some(OperationStep::PortReserved),
            "worker_launched" => Some(OperationStep::WorkerLaunched),
            _ => None,
        }
    }
}

/// An in-flight operation. Removed in the transaction that completes it.
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    pub id: String,
    pub kind: OperationKind,
    pub session_id: String,
    pub step: OperationStep,
    /// Worker id chosen when the operation began, stable across replays.
    pub worker_id: String,
    pub port: Option<u16>,
    pub pid: Option<u32>,
    /// Set for delete operations.
    pub reason: Option<TerminationReason>,
    pub created_at: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(status: SessionState, deadline: u64) -> Session {
        Session {
            id: "s".to_string(),
            created_at: 1_000,
            ttl_deadline: deadline,
            status,
            data: SessionData::new(),
            worker_id: None,
            termination_reason: None,
        }
    }

    #[test]
    fn test_readability() {
        let s = session(SessionState::Active, 5_000);
        assert!(s.is_readable_at(4_999));
        assert!(!s.is_readable_at(5_000));

        let s = session(SessionState::Terminated, 5_000);
        assert!(!s.is_readable_at(1_000));
    }

    #[test]
    fn test_to_record_uses_seconds() {
        let record = session(SessionState::Pending, 61_500).to_record();
        assert_eq!(record.created_at, 1);
        assert_eq!(record.expires_at, 61);
        assert_eq!(record.status, SessionState::Pending);
    }

    #[test]
    fn test_string_forms_parse_back() {
        for state in [
            WorkerState::Starting,
            WorkerState::Ready,
            WorkerState::Stopping,
            WorkerState::Stopped,
        ] {
            assert_eq!(WorkerState::parse(state.as_str()), Some(state));
        }
        for reason in [
            TerminationReason::Deleted,
            TerminationReason::Expired,
            TerminationReason::Reconciled,
        ] {
            assert_eq!(TerminationReason::parse(reason.as_str()), Some(reason));
        }
        assert_eq!(parse_session_state("active"), Some(SessionState::Active));
        assert_eq!(OperationStep::parse("bogus"), None);
    }

    #[test]
    fn test_step_ordering() {
        assert!(OperationStep::Started < OperationStep::PortReserved);
        assert!(OperationStep::PortReserved < OperationStep::WorkerLaunched);
    }
}
