//! SQLite-backed state store.
//!
//! All tables live in one database file. Multi-row transitions run inside a
//! single transaction while the connection mutex is held, so a reader never
//! sees one side of a binding without the other.

use std::collections::HashSet;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use protocol::{SessionData, SessionState};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use tracing::{debug, info};

use super::records::{parse_session_state, session_state_str};
use super::{
    now_millis, Operation, OperationKind, OperationStep, Session, StoreError, StoreResult,
    TerminationReason, Worker, WorkerState,
};

/// Current schema version.
pub const CURRENT_SCHEMA_VERSION: i32 = 1;

const SESSION_COLUMNS: &str =
    "id, created_at, ttl_deadline, status, data, worker_id, termination_reason";
const WORKER_COLUMNS: &str = "id, session_id, port, status, started_at, pid";
const OPERATION_COLUMNS: &str =
    "id, kind, session_id, step, worker_id, port, pid, reason, created_at";

/// Shared handle to the state database. Cloning shares the connection.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
}

impl Store {
    /// Open or create the database at the given path and apply migrations.
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StoreError::InvalidPath(format!(
                        "Failed to create directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = FULL;")?;

        let store = Self::from_connection(conn, path.to_path_buf())?;
        info!(path = %path.display(), "state store opened");
        Ok(store)
    }

    /// Open a throwaway in-memory database.
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn, PathBuf::from(":memory:"))
    }

    fn from_connection(mut conn: Connection, path: PathBuf) -> StoreResult<Self> {
        run_migrations(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Get the current schema version.
    pub fn schema_version(&self) -> StoreResult<i32> {
        let conn = self.conn.lock();
        Ok(conn.query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    /// Cheap round trip used by the health endpoint.
    pub fn ping(&self) -> StoreResult<()> {
        let conn = self.conn.lock();
        conn.query_row("SELECT 1", [], |_| Ok(()))?;
        Ok(())
    }

    // ===== Sessions =====

    pub fn get_session(&self, id: &str) -> StoreResult<Option<Session>> {
        let conn = self.conn.lock();
        Ok(select_session(&conn, id)?)
    }

    /// All sessions that are not terminated, newest first.
    pub fn list_sessions(&self) -> StoreResult<Vec<Session>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE status != 'terminated' \
             ORDER BY created_at DESC, id"
        ))?;
        let rows = stmt.query_map([], session_from_row)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Ids of non-terminated sessions whose deadline is at or before `now`.
    pub fn expired_session_ids(&self, now: u64) -> StoreResult<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id FROM sessions WHERE status != 'terminated' AND ttl_deadline <= ?1 \
             ORDER BY ttl_deadline",
        )?;
        let rows = stmt.query_map(params![now as i64], |row| row.get(0))?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    // ===== Workers =====

    pub fn get_worker(&self, id: &str) -> StoreResult<Option<Worker>> {
        let conn = self.conn.lock();
        Ok(select_worker(&conn, id)?)
    }

    /// The worker bound to an `Active` session, read in one snapshot.
    ///
    /// Returns `None` unless both sides of the binding reference each other.
    pub fn get_worker_for_session(
        &self,
        session_id: &str,
    ) -> StoreResult<Option<(Session, Worker)>> {
        let conn = self.conn.lock();
        let Some(session) = select_session(&conn, session_id)? else {
            return Ok(None);
        };
        let Some(worker_id) = session.worker_id.clone() else {
            return Ok(None);
        };
        match select_worker(&conn, &worker_id)? {
            Some(worker) if worker.session_id == session.id => Ok(Some((session, worker))),
            _ => Ok(None),
        }
    }

    /// Workers in the given state.
    pub fn workers_in_state(&self, state: WorkerState) -> StoreResult<Vec<Worker>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {WORKER_COLUMNS} FROM workers WHERE status = ?1 ORDER BY started_at"
        ))?;
        let rows = stmt.query_map(params![state.as_str()], worker_from_row)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Workers that still own a process and a port.
    pub fn live_workers(&self) -> StoreResult<Vec<Worker>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {WORKER_COLUMNS} FROM workers WHERE status != 'stopped' ORDER BY started_at"
        ))?;
        let rows = stmt.query_map([], worker_from_row)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    // ===== Operations =====

    pub fn get_operation(&self, id: &str) -> StoreResult<Option<Operation>> {
        let conn = self.conn.lock();
        Ok(select_operation(&conn, id)?)
    }

    /// All journaled operations, oldest first.
    pub fn list_operations(&self) -> StoreResult<Vec<Operation>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {OPERATION_COLUMNS} FROM operations ORDER BY created_at, id"
        ))?;
        let rows = stmt.query_map([], operation_from_row)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Drop an operation from the journal.
    pub fn remove_operation(&self, id: &str) -> StoreResult<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM operations WHERE id = ?1", params![id])?;
        Ok(())
    }

    // ===== Port reservations =====

    /// Reserve a port for `owner`.
    ///
    /// Returns the owner's existing reservation if it has one. Otherwise the
    /// lowest port in `range` that is neither reserved nor rejected by
    /// `is_usable` is reserved and returned. `None` means the range is
    /// exhausted. Check and insert happen under the connection lock.
    pub fn reserve_port<F>(
        &self,
        owner: &str,
        range: RangeInclusive<u16>,
        is_usable: F,
    ) -> StoreResult<Option<u16>>
    where
        F: Fn(u16) -> bool,
    {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let existing: Option<u16> = tx
            .query_row(
                "SELECT port FROM port_reservations WHERE owner = ?1",
                params![owner],
                |row| row.get(0),
            )
            .optional()?;
        if existing.is_some() {
            return Ok(existing);
        }

        let taken: HashSet<u16> = {
            let mut stmt = tx.prepare("SELECT port FROM port_reservations")?;
            let rows = stmt.query_map([], |row| row.get(0))?;
            rows.collect::<Result<_, _>>()?
        };

        let Some(port) = range.filter(|p| !taken.contains(p)).find(|p| is_usable(*p)) else {
            return Ok(None);
        };

        tx.execute(
            "INSERT INTO port_reservations (port, owner, reserved_at) VALUES (?1, ?2, ?3)",
            params![port, owner, now_millis() as i64],
        )?;
        tx.commit()?;
        Ok(Some(port))
    }

    /// Release a port. Releasing a free port is a no-op.
    pub fn release_port(&self, port: u16) -> StoreResult<bool> {
        let conn = self.conn.lock();
        let n = conn.execute(
            "DELETE FROM port_reservations WHERE port = ?1",
            params![port],
        )?;
        Ok(n > 0)
    }

    /// All reservations as `(port, owner)`.
    pub fn list_reservations(&self) -> StoreResult<Vec<(u16, String)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT port, owner FROM port_reservations ORDER BY port")?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    // ===== Create path =====

    /// Journal a create operation together with its `Pending` session.
    pub fn begin_create(&self, op: &Operation, session: &Session) -> StoreResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        insert_session(&tx, session)?;
        insert_operation(&tx, op)?;
        tx.commit()?;
        debug!(session_id = %session.id, op_id = %op.id, "create operation journaled");
        Ok(())
    }

    pub fn record_port_reserved(&self, op_id: &str, port: u16) -> StoreResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE operations SET step = ?2, port = ?3 WHERE id = ?1",
            params![op_id, OperationStep::PortReserved.as_str(), port],
        )?;
        Ok(())
    }

    /// Insert or reset the worker row for a launch attempt.
    pub fn record_worker_starting(&self, worker: &Worker) -> StoreResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO workers (id, session_id, port, status, started_at, pid) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
             ON CONFLICT(id) DO UPDATE SET port = excluded.port, status = excluded.status, \
             started_at = excluded.started_at, pid = excluded.pid",
            params![
                worker.id,
                worker.session_id,
                worker.port,
                WorkerState::Starting.as_str(),
                worker.started_at as i64,
                worker.pid,
            ],
        )?;
        Ok(())
    }

    /// Remember the OS pid of a freshly launched worker.
    pub fn record_worker_pid(&self, worker_id: &str, pid: Option<u32>) -> StoreResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE workers SET pid = ?2 WHERE id = ?1",
            params![worker_id, pid],
        )?;
        Ok(())
    }

    /// Record that the worker for `op_id` is running and answered its health check.
    pub fn record_worker_launched(
        &self,
        op_id: &str,
        worker_id: &str,
        pid: Option<u32>,
    ) -> StoreResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE workers SET pid = ?2 WHERE id = ?1",
            params![worker_id, pid],
        )?;
        tx.execute(
            "UPDATE operations SET step = ?2, pid = ?3 WHERE id = ?1",
            params![op_id, OperationStep::WorkerLaunched.as_str(), pid],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Atomically bind a `Pending` session to its `Starting` worker.
    ///
    /// The session becomes `Active`, the worker `Ready`, the port reservation
    /// moves from the operation to the worker and the operation is removed.
    /// Fails with [`StoreError::Conflict`] if either record is not in the
    /// expected prior state.
    pub fn commit_binding(
        &self,
        op_id: &str,
        session_id: &str,
        worker_id: &str,
    ) -> StoreResult<Session> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let session = select_session(&tx, session_id)?.ok_or_else(|| StoreError::Conflict {
            entity: "session",
            id: session_id.to_string(),
            expected: "pending",
            found: "missing".to_string(),
        })?;
        if session.status != SessionState::Pending || session.worker_id.is_some() {
            return Err(StoreError::Conflict {
                entity: "session",
                id: session_id.to_string(),
                expected: "pending",
                found: session_state_str(session.status).to_string(),
            });
        }

        let worker = select_worker(&tx, worker_id)?.ok_or_else(|| StoreError::Conflict {
            entity: "worker",
            id: worker_id.to_string(),
            expected: "starting",
            found: "missing".to_string(),
        })?;
        if worker.status != WorkerState::Starting || worker.session_id != session_id {
            return Err(StoreError::Conflict {
                entity: "worker",
                id: worker_id.to_string(),
                expected: "starting",
                found: worker.status.as_str().to_string(),
            });
        }

        tx.execute(
            "UPDATE workers SET status = ?2 WHERE id = ?1",
            params![worker_id, WorkerState::Ready.as_str()],
        )?;
        tx.execute(
            "UPDATE sessions SET status = ?2, worker_id = ?3 WHERE id = ?1",
            params![
                session_id,
                session_state_str(SessionState::Active),
                worker_id
            ],
        )?;
        tx.execute(
            "UPDATE port_reservations SET owner = ?2 WHERE owner = ?1",
            params![op_id, worker_id],
        )?;
        tx.execute("DELETE FROM operations WHERE id = ?1", params![op_id])?;

        let committed = select_session(&tx, session_id)?.ok_or_else(|| {
            StoreError::Corrupt(format!("session {session_id} vanished during commit"))
        })?;
        tx.commit()?;
        Ok(committed)
    }

    /// Undo an unfinished create: the `Pending` session, its worker row, its
    /// port reservation and the operation are all removed.
    pub fn abort_create(&self, op_id: &str, session_id: &str, worker_id: &str) -> StoreResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM workers WHERE id = ?1 AND status != 'ready'",
            params![worker_id],
        )?;
        tx.execute(
            "DELETE FROM sessions WHERE id = ?1 AND status = 'pending'",
            params![session_id],
        )?;
        tx.execute(
            "DELETE FROM port_reservations WHERE owner = ?1",
            params![op_id],
        )?;
        tx.execute("DELETE FROM operations WHERE id = ?1", params![op_id])?;
        tx.commit()?;
        Ok(())
    }

    // ===== Teardown path =====

    /// Journal a delete operation for an `Active` session and move its
    /// worker to `Stopping`.
    pub fn begin_delete(&self, op: &Operation) -> StoreResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let status = select_session(&tx, &op.session_id)?.map(|s| s.status);
        if status != Some(SessionState::Active) {
            return Err(StoreError::Conflict {
                entity: "session",
                id: op.session_id.clone(),
                expected: "active",
                found: status
                    .map(|s| session_state_str(s).to_string())
                    .unwrap_or_else(|| "missing".to_string()),
            });
        }

        insert_operation(&tx, op)?;
        tx.execute(
            "UPDATE workers SET status = ?2 WHERE id = ?1 AND status != 'stopped'",
            params![op.worker_id, WorkerState::Stopping.as_str()],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Atomically terminate an `Active` session.
    ///
    /// Its worker becomes `Stopped`, the worker's port is released, the
    /// session records `reason` and drops its worker reference, and the
    /// delete operation (if any) is removed. Fails with
    /// [`StoreError::Conflict`] if the session is not `Active`.
    pub fn mark_terminated(
        &self,
        op_id: Option<&str>,
        session_id: &str,
        reason: TerminationReason,
    ) -> StoreResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let session = select_session(&tx, session_id)?;
        let Some(session) = session.filter(|s| s.status == SessionState::Active) else {
            let found = select_session(&tx, session_id)?
                .map(|s| session_state_str(s.status).to_string())
                .unwrap_or_else(|| "missing".to_string());
            return Err(StoreError::Conflict {
                entity: "session",
                id: session_id.to_string(),
                expected: "active",
                found,
            });
        };

        if let Some(worker_id) = &session.worker_id {
            if let Some(worker) = select_worker(&tx, worker_id)? {
                tx.execute(
                    "UPDATE workers SET status = ?2 WHERE id = ?1",
                    params![worker.id, WorkerState::Stopped.as_str()],
                )?;
                tx.execute(
                    "DELETE FROM port_reservations WHERE port = ?1 AND owner = ?2",
                    params![worker.port, worker.id],
                )?;
            }
        }

        tx.execute(
            "UPDATE sessions SET status = ?2, worker_id = NULL, termination_reason = ?3, \
             terminated_at = ?4 WHERE id = ?1",
            params![
                session_id,
                session_state_str(SessionState::Terminated),
                reason.as_str(),
                now_millis() as i64
            ],
        )?;
        if let Some(op_id) = op_id {
            tx.execute("DELETE FROM operations WHERE id = ?1", params![op_id])?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Mark a worker that no session references as `Stopped` and free its port.
    pub fn retire_orphan_worker(&self, worker_id: &str) -> StoreResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        if let Some(worker) = select_worker(&tx, worker_id)? {
            tx.execute(
                "UPDATE workers SET status = ?2 WHERE id = ?1",
                params![worker.id, WorkerState::Stopped.as_str()],
            )?;
            tx.execute(
                "DELETE FROM port_reservations WHERE port = ?1 AND owner = ?2",
                params![worker.port, worker.id],
            )?;
        }
        tx.commit()?;
        Ok(())
    }
}

// ===== Migrations =====

fn run_migrations(conn: &mut Connection) -> StoreResult<()> {
    let current_version: i32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;

    if current_version < 1 {
        migrate_v1(conn)?;
    }

    Ok(())
}

/// Migration to version 1: Initial schema.
fn migrate_v1(conn: &mut Connection) -> StoreResult<()> {
    let tx = conn.transaction()?;

    tx.execute(
        r#"
        CREATE TABLE IF NOT EXISTS sessions (
            id TEXT PRIMARY KEY,
            created_at INTEGER NOT NULL,
            ttl_deadline INTEGER NOT NULL,
            status TEXT NOT NULL,
            data TEXT NOT NULL,
            worker_id TEXT,
            termination_reason TEXT,
            terminated_at INTEGER
        )
        "#,
        [],
    )?;

    tx.execute(
        r#"
        CREATE TABLE IF NOT EXISTS workers (
            id TEXT PRIMARY KEY,
            session_id TEXT NOT NULL UNIQUE,
            port INTEGER NOT NULL,
            status TEXT NOT NULL,
            started_at INTEGER NOT NULL,
            pid INTEGER
        )
        "#,
        [],
    )?;

    tx.execute(
        r#"
        CREATE TABLE IF NOT EXISTS port_reservations (
            port INTEGER PRIMARY KEY,
            owner TEXT NOT NULL UNIQUE,
            reserved_at INTEGER NOT NULL
        )
        "#,
        [],
    )?;

    tx.execute(
        r#"
        CREATE TABLE IF NOT EXISTS operations (
            id TEXT PRIMARY KEY,
            kind TEXT NOT NULL,
            session_id TEXT NOT NULL,
            step TEXT NOT NULL,
            worker_id TEXT NOT NULL,
            port INTEGER,
            pid INTEGER,
            reason TEXT,
            created_at INTEGER NOT NULL
        )
        "#,
        [],
    )?;

    tx.execute(
        r#"
        CREATE INDEX IF NOT EXISTS idx_sessions_status_deadline
        ON sessions(status, ttl_deadline)
        "#,
        [],
    )?;

    tx.execute(
        &format!("PRAGMA user_version = {}", CURRENT_SCHEMA_VERSION),
        [],
    )?;

    tx.commit()?;
    Ok(())
}

// ===== Row helpers =====

fn insert_session(tx: &Transaction<'_>, session: &Session) -> StoreResult<()> {
    let data = serde_json::to_string(&session.data)
        .map_err(|e| StoreError::Corrupt(format!("session data: {e}")))?;
    tx.execute(
        "INSERT INTO sessions (id, created_at, ttl_deadline, status, data, worker_id) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            session.id,
            session.created_at as i64,
            session.ttl_deadline as i64,
            session_state_str(session.status),
            data,
            session.worker_id,
        ],
    )?;
    Ok(())
}

fn insert_operation(tx: &Transaction<'_>, op: &Operation) -> StoreResult<()> {
    tx.execute(
        &format!(
            "INSERT INTO operations ({OPERATION_COLUMNS}) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
        ),
        params![
            op.id,
            op.kind.as_str(),
            op.session_id,
            op.step.as_str(),
            op.worker_id,
            op.port,
            op.pid,
            op.reason.map(|r| r.as_str()),
            op.created_at as i64,
        ],
    )?;
    Ok(())
}

fn select_session(conn: &Connection, id: &str) -> rusqlite::Result<Option<Session>> {
    conn.query_row(
        &format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1"),
        params![id],
        session_from_row,
    )
    .optional()
}

fn select_worker(conn: &Connection, id: &str) -> rusqlite::Result<Option<Worker>> {
    conn.query_row(
        &format!("SELECT {WORKER_COLUMNS} FROM workers WHERE id = ?1"),
        params![id],
        worker_from_row,
    )
    .optional()
}

fn select_operation(conn: &Connection, id: &str) -> rusqlite::Result<Option<Operation>> {
    conn.query_row(
        &format!("SELECT {OPERATION_COLUMNS} FROM operations WHERE id = ?1"),
        params![id],
        operation_from_row,
    )
    .optional()
}

fn corrupt(idx: usize, what: &str, value: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        Type::Text,
        Box::new(StoreError::Corrupt(format!("unknown {what} '{value}'"))),
    )
}

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<Session> {
    let status: String = row.get(3)?;
    let data: String = row.get(4)?;
    let reason: Option<String> = row.get(6)?;

    let data: SessionData = serde_json::from_str(&data)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(4, Type::Text, Box::new(e)))?;
    let termination_reason = match reason {
        Some(r) => Some(
            TerminationReason::parse(&r).ok_or_else(|| corrupt(6, "termination reason", &r))?,
        ),
        None => None,
    };

    Ok(Session {
        id: row.get(0)?,
        created_at: row.get::<_, i64>(1)? as u64,
        ttl_deadline: row.get::<_, i64>(2)? as u64,
        status: parse_session_state(&status).ok_or_else(|| corrupt(3, "session status", &status))?,
        data,
        worker_id: row.get(5)?,
        termination_reason,
    })
}

fn worker_from_row(row: &Row<'_>) -> rusqlite::Result<Worker> {
    let status: String = row.get(3)?;
    Ok(Worker {
        id: row.get(0)?,
        session_id: row.get(1)?,
        port: row.get(2)?,
        status: WorkerState::parse(&status).ok_or_else(|| corrupt(3, "worker status", &status))?,
        started_at: row.get::<_, i64>(4)? as u64,
        pid: row.get(5)?,
    })
}

fn operation_from_row(row: &Row<'_>) -> rusqlite::Result<Operation> {
    let kind: String = row.get(1)?;
    let step: String = row.get(3)?;
    let reason: Option<String> = row.get(7)?;
    let reason = match reason {
        Some(r) => Some(
            TerminationReason::parse(&r).ok_or_else(|| corrupt(7, "termination reason", &r))?,
        ),
        None => None,
    };

    Ok(Operation {
        id: row.get(0)?,
        kind: OperationKind::parse(&kind).ok_or_else(|| corrupt(1, "operation kind", &kind))?,
        session_id: row.get(2)?,
        step: OperationStep::parse(&step).ok_or_else(|| corrupt(3, "operation step", &step))?,
        worker_id: row.get(4)?,
        port: row.get(5)?,
        pid: row.get(6)?,
        reason,
        created_at: row.get::<_, i64>(8)? as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn pending_session(id: &str) -> Session {
        let mut data = SessionData::new();
        data.insert("user".to_string(), json!("alice"));
        Session {
            id: id.to_string(),
            created_at: 1_000,
            ttl_deadline: 61_000,
            status: SessionState::Pending,
            data,
            worker_id: None,
            termination_reason: None,
        }
    }

    fn create_op(id: &str, session_id: &str, worker_id: &str) -> Operation {
        Operation {
            id: id.to_string(),
            kind: OperationKind::Create,
            session_id: session_id.to_string(),
            step: OperationStep::Started,
            worker_id: worker_id.to_string(),
            port: None,
            pid: None,
            reason: None,
            created_at: 1_000,
        }
    }

    fn starting_worker(id: &str, session_id: &str, port: u16) -> Worker {
        Worker {
            id: id.to_string(),
            session_id: session_id.to_string(),
            port,
            status: WorkerState::Starting,
            started_at: 1_000,
            pid: Some(4242),
        }
    }

    /// Runs the full create path and returns the bound port.
    fn create_active(store: &Store, session_id: &str, op_id: &str, worker_id: &str) -> u16 {
        store
            .begin_create(&create_op(op_id, session_id, worker_id), &pending_session(session_id))
            .unwrap();
        let port = store.reserve_port(op_id, 5000..=5010, |_| true).unwrap().unwrap();
        store.record_port_reserved(op_id, port).unwrap();
        store
            .record_worker_starting(&starting_worker(worker_id, session_id, port))
            .unwrap();
        store.record_worker_launched(op_id, worker_id, Some(4242)).unwrap();
        store.commit_binding(op_id, session_id, worker_id).unwrap();
        port
    }

    #[test]
    fn test_open_in_memory() {
        let store = Store::open_in_memory().unwrap();
        assert_eq!(store.schema_version().unwrap(), CURRENT_SCHEMA_VERSION);
        assert!(store.ping().is_ok());
    }

    #[test]
    fn test_open_file_creates_parent_and_persists() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("state.db");

        {
            let store = Store::open(&path).unwrap();
            create_active(&store, "s1", "op1", "w1");
        }

        let store = Store::open(&path).unwrap();
        assert_eq!(store.schema_version().unwrap(), CURRENT_SCHEMA_VERSION);
        let session = store.get_session("s1").unwrap().unwrap();
        assert_eq!(session.status, SessionState::Active);
        assert_eq!(session.data["user"], "alice");
    }

    #[test]
    fn test_begin_create_journals_pending_session() {
        let store = Store::open_in_memory().unwrap();
        store
            .begin_create(&create_op("op1", "s1", "w1"), &pending_session("s1"))
            .unwrap();

        let session = store.get_session("s1").unwrap().unwrap();
        assert_eq!(session.status, SessionState::Pending);
        assert!(session.worker_id.is_none());

        let ops = store.list_operations().unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].step, OperationStep::Started);
        assert_eq!(ops[0].worker_id, "w1");
    }

    #[test]
    fn test_reserve_port_is_idempotent_per_owner() {
        let store = Store::open_in_memory().unwrap();
        let a = store.reserve_port("op-a", 5000..=5002, |_| true).unwrap();
        let again = store.reserve_port("op-a", 5000..=5002, |_| true).unwrap();
        let b = store.reserve_port("op-b", 5000..=5002, |_| true).unwrap();

        assert_eq!(a, Some(5000));
        assert_eq!(again, Some(5000));
        assert_eq!(b, Some(5001));
    }

    #[test]
    fn test_reserve_port_skips_unusable_and_exhausts() {
        let store = Store::open_in_memory().unwrap();
        let a = store.reserve_port("a", 5000..=5001, |p| p != 5000).unwrap();
        assert_eq!(a, Some(5001));
        let b = store.reserve_port("b", 5000..=5001, |p| p != 5000).unwrap();
        assert_eq!(b, None);
    }

    #[test]
    fn test_release_port_idempotent() {
        let store = Store::open_in_memory().unwrap();
        store.reserve_port("a", 5000..=5000, |_| true).unwrap();
        assert!(store.release_port(5000).unwrap());
        assert!(!store.release_port(5000).unwrap());
        assert_eq!(store.reserve_port("b", 5000..=5000, |_| true).unwrap(), Some(5000));
    }

    #[test]
    fn test_commit_binding_links_both_sides() {
        let store = Store::open_in_memory().unwrap();
        let port = create_active(&store, "s1", "op1", "w1");

        let (session, worker) = store.get_worker_for_session("s1").unwrap().unwrap();
        assert_eq!(session.status, SessionState::Active);
        assert_eq!(session.worker_id.as_deref(), Some("w1"));
        assert_eq!(worker.session_id, "s1");
        assert_eq!(worker.status, WorkerState::Ready);
        assert_eq!(worker.port, port);

        // Operation gone, reservation now owned by the worker
        assert!(store.list_operations().unwrap().is_empty());
        assert_eq!(store.list_reservations().unwrap(), vec![(port, "w1".to_string())]);
    }

    #[test]
    fn test_commit_binding_twice_conflicts() {
        let store = Store::open_in_memory().unwrap();
        create_active(&store, "s1", "op1", "w1");

        let err = store.commit_binding("op1", "s1", "w1").unwrap_err();
        assert!(err.is_conflict());
    }

    #[test]
    fn test_commit_binding_requires_starting_worker() {
        let store = Store::open_in_memory().unwrap();
        store
            .begin_create(&create_op("op1", "s1", "w1"), &pending_session("s1"))
            .unwrap();

        let err = store.commit_binding("op1", "s1", "w1").unwrap_err();
        assert!(matches!(err, StoreError::Conflict { entity: "worker", .. }));

        // Nothing changed
        let session = store.get_session("s1").unwrap().unwrap();
        assert_eq!(session.status, SessionState::Pending);
    }

    #[test]
    fn test_abort_create_removes_everything() {
        let store = Store::open_in_memory().unwrap();
        store
            .begin_create(&create_op("op1", "s1", "w1"), &pending_session("s1"))
            .unwrap();
        let port = store.reserve_port("op1", 5000..=5010, |_| true).unwrap().unwrap();
        store
            .record_worker_starting(&starting_worker("w1", "s1", port))
            .unwrap();

        store.abort_create("op1", "s1", "w1").unwrap();

        assert!(store.get_session("s1").unwrap().is_none());
        assert!(store.get_worker("w1").unwrap().is_none());
        assert!(store.list_reservations().unwrap().is_empty());
        assert!(store.list_operations().unwrap().is_empty());
    }

    #[test]
    fn test_teardown_releases_port_and_records_reason() {
        let store = Store::open_in_memory().unwrap();
        let port = create_active(&store, "s1", "op1", "w1");

        let mut op = create_op("op2", "s1", "w1");
        op.kind = OperationKind::Delete;
        op.reason = Some(TerminationReason::Deleted);
        store.begin_delete(&op).unwrap();
        assert_eq!(
            store.get_worker("w1").unwrap().unwrap().status,
            WorkerState::Stopping
        );

        store
            .mark_terminated(Some("op2"), "s1", TerminationReason::Deleted)
            .unwrap();

        let session = store.get_session("s1").unwrap().unwrap();
        assert_eq!(session.status, SessionState::Terminated);
        assert_eq!(session.termination_reason, Some(TerminationReason::Deleted));
        assert!(session.worker_id.is_none());
        assert_eq!(
            store.get_worker("w1").unwrap().unwrap().status,
            WorkerState::Stopped
        );
        assert!(store.get_worker_for_session("s1").unwrap().is_none());
        assert!(store.list_operations().unwrap().is_empty());
        assert!(store.list_reservations().unwrap().is_empty());
        assert_eq!(store.reserve_port("op3", port..=port, |_| true).unwrap(), Some(port));
    }

    #[test]
    fn test_mark_terminated_twice_conflicts() {
        let store = Store::open_in_memory().unwrap();
        create_active(&store, "s1", "op1", "w1");

        store
            .mark_terminated(None, "s1", TerminationReason::Expired)
            .unwrap();
        let err = store
            .mark_terminated(None, "s1", TerminationReason::Deleted)
            .unwrap_err();
        assert!(err.is_conflict());

        // First reason wins
        let session = store.get_session("s1").unwrap().unwrap();
        assert_eq!(session.termination_reason, Some(TerminationReason::Expired));
    }

    #[test]
    fn test_begin_delete_requires_active() {
        let store = Store::open_in_memory().unwrap();
        let mut op = create_op("op1", "missing", "w1");
        op.kind = OperationKind::Delete;
        let err = store.begin_delete(&op).unwrap_err();
        assert!(err.is_conflict());
        assert!(store.list_operations().unwrap().is_empty());
    }

    #[test]
    fn test_list_and_expired_sessions() {
        let store = Store::open_in_memory().unwrap();
        create_active(&store, "s1", "op1", "w1");
        create_active(&store, "s2", "op2", "w2");
        store
            .mark_terminated(None, "s2", TerminationReason::Deleted)
            .unwrap();

        let listed: Vec<String> = store
            .list_sessions()
            .unwrap()
            .into_iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(listed, vec!["s1".to_string()]);

        assert!(store.expired_session_ids(60_999).unwrap().is_empty());
        assert_eq!(store.expired_session_ids(61_000).unwrap(), vec!["s1".to_string()]);
    }

    #[test]
    fn test_live_workers_and_orphans() {
        let store = Store::open_in_memory().unwrap();
        store
            .begin_create(&create_op("op1", "s1", "w1"), &pending_session("s1"))
            .unwrap();
        let port = store.reserve_port("op1", 5000..=5010, |_| true).unwrap().unwrap();
        store
            .record_worker_starting(&starting_worker("w1", "s1", port))
            .unwrap();
        assert_eq!(store.live_workers().unwrap().len(), 1);
        assert_eq!(store.workers_in_state(WorkerState::Starting).unwrap().len(), 1);

        store.retire_orphan_worker("w1").unwrap();
        assert!(store.live_workers().unwrap().is_empty());
    }
}
