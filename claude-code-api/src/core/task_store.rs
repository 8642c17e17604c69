//! Persistent record of long-running background jobs, with orphan recovery
//! on startup and a TTL sweep over terminal rows (spec §4.4).
//!
//! Cancellation handles are runtime-only, like the session lock table —
//! they live in an in-memory map keyed by task ID and are dropped the
//! moment a task reaches a terminal state.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::core::errors::{CoreError, CoreResult};
use crate::core::session_store::fingerprint;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "completed" => TaskStatus::Completed,
            "failed" => TaskStatus::Failed,
            _ => TaskStatus::Running,
        }
    }
}

/// The subset of `RunOptions` that survives to disk. Runtime-only fields
/// (`stream`, `on_chunk`, `timeout`, `cancel`) have no persisted form.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub prompt: String,
    pub model: Option<String>,
    pub allowed_tools: Option<Vec<String>>,
    pub working_directory: Option<String>,
    pub session_id: Option<String>,
    pub max_turns: Option<u32>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct Task {
    pub id: String,
    pub status: TaskStatus,
    #[serde(skip_serializing)]
    pub owner_fingerprint: String,
    pub prompt: String,
    pub model: Option<String>,
    pub allowed_tools: Option<Vec<String>>,
    pub working_directory: Option<String>,
    pub session_id: Option<String>,
    pub max_turns: Option<u32>,
    pub result: Option<String>,
    pub failure_reason: Option<String>,
    pub upstream_session_id: Option<String>,
    pub created_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub duration_ms: Option<i64>,
}

impl Task {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let allowed_tools_json: Option<String> = row.get(5)?;
        Ok(Task {
            id: row.get(0)?,
            status: TaskStatus::parse(&row.get::<_, String>(1)?),
            owner_fingerprint: row.get(2)?,
            prompt: row.get(3)?,
            model: row.get(4)?,
            allowed_tools: allowed_tools_json.and_then(|s| serde_json::from_str(&s).ok()),
            working_directory: row.get(6)?,
            session_id: row.get(7)?,
            max_turns: row.get(8)?,
            result: row.get(9)?,
            failure_reason: row.get(10)?,
            upstream_session_id: row.get(11)?,
            created_at: row.get(12)?,
            started_at: row.get(13)?,
            completed_at: row.get(14)?,
            duration_ms: row.get(15)?,
        })
    }
}

const TASK_COLUMNS: &str = "id, status, owner_fingerprint, prompt, model, allowed_tools, working_directory, \
     session_id, max_turns, result, failure_reason, upstream_session_id, created_at, started_at, \
     completed_at, duration_ms";

fn now_iso() -> String {
    Utc::now().to_rfc3339()
}

fn db_err(e: rusqlite::Error) -> CoreError {
    CoreError::internal(format!("task store error: {e}"))
}

pub struct TaskStore {
    conn: Mutex<Connection>,
    cancel_handles: Mutex<HashMap<String, CancellationToken>>,
    retention: Duration,
}

impl TaskStore {
    pub fn open(db_path: &Path, retention: Duration) -> CoreResult<Self> {
        let conn = Connection::open(db_path)
            .map_err(|e| CoreError::internal(format!("failed to open task store at {db_path:?}: {e}")))?;
        conn.pragma_update(None, "journal_mode", "WAL").map_err(db_err)?;
        conn.busy_timeout(Duration::from_secs(5)).map_err(db_err)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                status TEXT NOT NULL CHECK (status IN ('running','completed','failed')),
                owner_fingerprint TEXT NOT NULL,
                prompt TEXT NOT NULL,
                model TEXT,
                allowed_tools TEXT,
                working_directory TEXT,
                session_id TEXT,
                max_turns INTEGER,
                result TEXT,
                failure_reason TEXT,
                upstream_session_id TEXT,
                created_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT,
                duration_ms INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_tasks_owner ON tasks(owner_fingerprint);
            CREATE INDEX IF NOT EXISTS idx_tasks_status_completed ON tasks(status, completed_at);",
        )
        .map_err(db_err)?;

        Ok(Self {
            conn: Mutex::new(conn),
            cancel_handles: Mutex::new(HashMap::new()),
            retention,
        })
    }

    /// Inserts a `running` row and returns it alongside a fresh
    /// cancellation handle the caller threads through to the Worker Pool.
    pub async fn create(&self, spec: TaskSpec, credential: &str) -> CoreResult<(Task, CancellationToken)> {
        let owner = fingerprint(credential);
        let id = Uuid::new_v4().to_string();
        let now = now_iso();
        let allowed_tools_json = spec
            .allowed_tools
            .as_ref()
            .map(|tools| serde_json::to_string(tools).unwrap_or_default());

        {
            let conn = self.conn.lock().await;
            conn.execute(
                "INSERT INTO tasks
                 (id, status, owner_fingerprint, prompt, model, allowed_tools, working_directory,
                  session_id, max_turns, created_at, started_at)
                 VALUES (?1, 'running', ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
                params![
                    id,
                    owner,
                    spec.prompt,
                    spec.model,
                    allowed_tools_json,
                    spec.working_directory,
                    spec.session_id,
                    spec.max_turns,
                    now,
                ],
            )
            .map_err(db_err)?;
        }

        let cancel = CancellationToken::new();
        self.cancel_handles.lock().await.insert(id.clone(), cancel.clone());

        let task = Task {
            id,
            status: TaskStatus::Running,
            owner_fingerprint: owner,
            prompt: spec.prompt,
            model: spec.model,
            allowed_tools: spec.allowed_tools,
            working_directory: spec.working_directory,
            session_id: spec.session_id,
            max_turns: spec.max_turns,
            result: None,
            failure_reason: None,
            upstream_session_id: None,
            created_at: now.clone(),
            started_at: Some(now),
            completed_at: None,
            duration_ms: None,
        };
        Ok((task, cancel))
    }

    pub async fn get(&self, id: &str, credential: &str) -> CoreResult<Task> {
        let owner = fingerprint(credential);
        let conn = self.conn.lock().await;
        let task = conn
            .query_row(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                params![id],
                Task::from_row,
            )
            .map_err(|_| CoreError::task_not_found())?;

        if task.owner_fingerprint != owner {
            return Err(CoreError::task_not_found());
        }
        Ok(task)
    }

    pub async fn list(&self, credential: &str) -> CoreResult<Vec<Task>> {
        let owner = fingerprint(credential);
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {TASK_COLUMNS} FROM tasks WHERE owner_fingerprint = ?1 ORDER BY created_at DESC"
            ))
            .map_err(db_err)?;
        let rows = stmt.query_map(params![owner], Task::from_row).map_err(db_err)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(db_err)
    }

    pub async fn set_completed(&self, id: &str, result: &str, upstream_session_id: Option<&str>) -> CoreResult<()> {
        self.finish(id, TaskStatus::Completed, Some(result), None, upstream_session_id).await
    }

    pub async fn set_failed(&self, id: &str, reason: &str) -> CoreResult<()> {
        self.finish(id, TaskStatus::Failed, None, Some(reason), None).await
    }

    async fn finish(
        &self,
        id: &str,
        status: TaskStatus,
        result: Option<&str>,
        failure_reason: Option<&str>,
        upstream_session_id: Option<&str>,
    ) -> CoreResult<()> {
        let now = now_iso();
        let conn = self.conn.lock().await;
        let started_at: Option<String> = conn
            .query_row("SELECT started_at FROM tasks WHERE id = ?1", params![id], |r| r.get(0))
            .optional()
            .map_err(db_err)?
            .ok_or_else(CoreError::task_not_found)?;

        let duration_ms = started_at
            .as_deref()
            .and_then(parse_iso)
            .map(|started| (Utc::now() - started).num_milliseconds());

        conn.execute(
            "UPDATE tasks SET status = ?1, result = ?2, failure_reason = ?3,
             upstream_session_id = COALESCE(?4, upstream_session_id), completed_at = ?5, duration_ms = ?6
             WHERE id = ?7",
            params![status.as_str(), result, failure_reason, upstream_session_id, now, duration_ms, id],
        )
        .map_err(db_err)?;
        drop(conn);

        self.cancel_handles.lock().await.remove(id);
        Ok(())
    }

    /// Fires the task's cancel handle, then records it `failed: cancelled`.
    /// Returns `false` if the task is absent or already terminal — at that
    /// point no cancel handle remains in the in-memory map.
    pub async fn cancel(&self, id: &str) -> CoreResult<bool> {
        let handle = self.cancel_handles.lock().await.get(id).cloned();
        let Some(handle) = handle else {
            return Ok(false);
        };
        handle.cancel();
        self.set_failed(id, "cancelled").await?;
        Ok(true)
    }

    /// On startup, before admitting new work: any row left `running` by a
    /// prior process belongs to a process that no longer exists.
    pub async fn mark_orphaned_failed(&self) -> CoreResult<usize> {
        let now = now_iso();
        let conn = self.conn.lock().await;
        let updated = conn
            .execute(
                "UPDATE tasks SET status = 'failed', failure_reason = 'server_restart', completed_at = ?1
                 WHERE status = 'running'",
                params![now],
            )
            .map_err(db_err)?;
        if updated > 0 {
            warn!(count = updated, "recovered orphaned running tasks as failed: server_restart");
        }
        Ok(updated)
    }

    pub async fn sweep_expired(&self) -> CoreResult<usize> {
        let cutoff = cutoff_iso(self.retention);
        let conn = self.conn.lock().await;
        let deleted = conn
            .execute(
                "DELETE FROM tasks WHERE status != 'running' AND completed_at < ?1",
                params![cutoff],
            )
            .map_err(db_err)?;
        Ok(deleted)
    }
}

fn parse_iso(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s).ok().map(|dt| dt.with_timezone(&Utc))
}

fn cutoff_iso(retention: Duration) -> String {
    let retention = ChronoDuration::from_std(retention).unwrap_or(ChronoDuration::zero());
    (Utc::now() - retention).to_rfc3339()
}

/// Spawn the recurring TTL sweep over terminal rows (spec §4.4).
pub fn spawn_sweeper(store: std::sync::Arc<TaskStore>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            match store.sweep_expired().await {
                Ok(0) => {},
                Ok(n) => info!(count = n, "task TTL sweep removed terminal rows"),
                Err(e) => warn!(error = %e, "task TTL sweep failed"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn spec(prompt: &str) -> TaskSpec {
        TaskSpec {
            prompt: prompt.to_string(),
            model: None,
            allowed_tools: None,
            working_directory: None,
            session_id: None,
            max_turns: None,
        }
    }

    fn store() -> (TaskStore, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tasks.db");
        (TaskStore::open(&path, Duration::from_secs(3600)).unwrap(), dir)
    }

    #[tokio::test]
    async fn create_and_get_round_trip() {
        let (store, _dir) = store();
        let (task, _cancel) = store.create(spec("hi"), "owner").await.unwrap();
        assert_eq!(task.status, TaskStatus::Running);

        let fetched = store.get(&task.id, "owner").await.unwrap();
        assert_eq!(fetched.prompt, "hi");
    }

    #[tokio::test]
    async fn ownership_mismatch_is_not_found() {
        let (store, _dir) = store();
        let (task, _cancel) = store.create(spec("hi"), "owner-a").await.unwrap();
        let err = store.get(&task.id, "owner-b").await.unwrap_err();
        assert_eq!(err.kind, crate::core::errors::ErrorKind::TaskNotFound);
    }

    #[tokio::test]
    async fn set_completed_computes_duration_and_clears_cancel_handle() {
        let (store, _dir) = store();
        let (task, _cancel) = store.create(spec("hi"), "owner").await.unwrap();
        store.set_completed(&task.id, "done", Some("U1")).await.unwrap();

        let fetched = store.get(&task.id, "owner").await.unwrap();
        assert_eq!(fetched.status, TaskStatus::Completed);
        assert_eq!(fetched.result.as_deref(), Some("done"));
        assert_eq!(fetched.upstream_session_id.as_deref(), Some("U1"));
        assert!(fetched.completed_at.is_some());

        assert!(!store.cancel(&task.id).await.unwrap());
    }

    #[tokio::test]
    async fn cancel_fires_handle_and_marks_cancelled() {
        let (store, _dir) = store();
        let (task, cancel) = store.create(spec("hi"), "owner").await.unwrap();

        let cancelled = store.cancel(&task.id).await.unwrap();
        assert!(cancelled);
        assert!(cancel.is_cancelled());

        let fetched = store.get(&task.id, "owner").await.unwrap();
        assert_eq!(fetched.status, TaskStatus::Failed);
        assert_eq!(fetched.failure_reason.as_deref(), Some("cancelled"));
    }

    #[tokio::test]
    async fn cancel_on_absent_task_returns_false() {
        let (store, _dir) = store();
        assert!(!store.cancel("no-such-id").await.unwrap());
    }

    #[tokio::test]
    async fn mark_orphaned_failed_recovers_running_rows() {
        let (store, _dir) = store();
        let (task, _cancel) = store.create(spec("hi"), "owner").await.unwrap();

        let recovered = store.mark_orphaned_failed().await.unwrap();
        assert_eq!(recovered, 1);

        let fetched = store.get(&task.id, "owner").await.unwrap();
        assert_eq!(fetched.status, TaskStatus::Failed);
        assert_eq!(fetched.failure_reason.as_deref(), Some("server_restart"));
    }

    #[tokio::test]
    async fn sweep_expired_only_removes_old_terminal_rows() {
        let (store, _dir) = store();
        let (running, _c1) = store.create(spec("still running"), "owner").await.unwrap();
        let (old, _c2) = store.create(spec("long done"), "owner").await.unwrap();
        store.set_completed(&old.id, "done", None).await.unwrap();

        {
            let conn = store.conn.lock().await;
            conn.execute(
                "UPDATE tasks SET completed_at = ?1 WHERE id = ?2",
                params!["2000-01-01T00:00:00+00:00", old.id],
            )
            .unwrap();
        }

        let deleted = store.sweep_expired().await.unwrap();
        assert_eq!(deleted, 1);
        assert!(store.get(&running.id, "owner").await.is_ok());
        assert!(store.get(&old.id, "owner").await.is_err());
    }
}
