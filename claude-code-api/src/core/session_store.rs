//! Owner-scoped session CRUD plus per-session exclusive locking (spec §4.3).
//!
//! Two independent pieces share this module because they share a lifecycle:
//! the persisted `sessions` table (SQLite, WAL) and the in-memory
//! [`SessionLockTable`] (FIFO mutex per session ID). A session's lock entry
//! is purged whenever its row is deleted, by the owner or by the TTL sweep.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use rusqlite::{Connection, Row, params};
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, oneshot};
use tracing::{info, warn};
use uuid::Uuid;

use crate::core::errors::{CoreError, CoreResult};

#[derive(Debug, Clone, serde::Serialize)]
pub struct Session {
    pub id: String,
    pub upstream_session_id: Option<String>,
    #[serde(skip_serializing)]
    pub owner_fingerprint: String,
    pub created_at: String,
    pub last_accessed_at: String,
}

impl Session {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Session {
            id: row.get(0)?,
            upstream_session_id: row.get(1)?,
            owner_fingerprint: row.get(2)?,
            created_at: row.get(3)?,
            last_accessed_at: row.get(4)?,
        })
    }
}

/// SHA-256 of the raw credential. The raw credential itself is never
/// persisted — only this digest, per spec §9.
pub fn fingerprint(credential: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(credential.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn now_iso() -> String {
    Utc::now().to_rfc3339()
}

fn db_err(e: rusqlite::Error) -> CoreError {
    CoreError::internal(format!("session store error: {e}"))
}

/// FIFO exclusive lock per session ID (spec §4.3 locking model). Entry
/// presence in the map means the session is held; an empty waiter queue
/// with no entry means unlocked.
struct SessionLockTable {
    state: Mutex<HashMap<String, VecDeque<oneshot::Sender<()>>>>,
}

impl SessionLockTable {
    fn new() -> Self {
        Self {
            state: Mutex::new(HashMap::new()),
        }
    }

    async fn acquire(&self, id: &str) {
        let waiter = {
            let mut guard = self.state.lock().await;
            match guard.get_mut(id) {
                Some(waiters) => {
                    let (tx, rx) = oneshot::channel();
                    waiters.push_back(tx);
                    Some(rx)
                },
                None => {
                    guard.insert(id.to_string(), VecDeque::new());
                    None
                },
            }
        };
        if let Some(rx) = waiter {
            let _ = rx.await;
        }
    }

    /// Hands the lock to the next waiter whose receiver is still live. A
    /// waiter's `rx` is dropped without notice if its enclosing future is
    /// cancelled while parked on `acquire()` (e.g. a client disconnect), so
    /// `send` can fail for any number of waiters at the front of the queue
    /// before one actually takes the lock.
    async fn release(&self, id: &str) {
        let mut guard = self.state.lock().await;
        if let Some(waiters) = guard.get_mut(id) {
            loop {
                match waiters.pop_front() {
                    Some(tx) => {
                        if tx.send(()).is_ok() {
                            return;
                        }
                    },
                    None => {
                        guard.remove(id);
                        return;
                    },
                }
            }
        }
    }

    async fn purge(&self, id: &str) {
        let mut guard = self.state.lock().await;
        guard.remove(id);
    }
}

pub struct SessionStore {
    conn: Mutex<Connection>,
    locks: SessionLockTable,
    ttl: Duration,
    max_sessions_per_key: usize,
}

impl SessionStore {
    pub fn open(db_path: &Path, ttl: Duration, max_sessions_per_key: usize) -> CoreResult<Self> {
        let conn = Connection::open(db_path)
            .map_err(|e| CoreError::internal(format!("failed to open session store at {db_path:?}: {e}")))?;
        conn.pragma_update(None, "journal_mode", "WAL").map_err(db_err)?;
        conn.busy_timeout(Duration::from_secs(5)).map_err(db_err)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                upstream_session_id TEXT,
                owner_fingerprint TEXT NOT NULL,
                created_at TEXT NOT NULL,
                last_accessed_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_sessions_owner ON sessions(owner_fingerprint);",
        )
        .map_err(db_err)?;

        Ok(Self {
            conn: Mutex::new(conn),
            locks: SessionLockTable::new(),
            ttl,
            max_sessions_per_key,
        })
    }

    pub async fn create(&self, upstream_session_id: Option<String>, credential: &str) -> CoreResult<Session> {
        let owner = fingerprint(credential);
        let conn = self.conn.lock().await;

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM sessions WHERE owner_fingerprint = ?1", params![owner], |r| r.get(0))
            .map_err(db_err)?;
        if count as usize >= self.max_sessions_per_key {
            return Err(CoreError::session_limit(self.max_sessions_per_key));
        }

        let id = Uuid::new_v4().to_string();
        let now = now_iso();
        conn.execute(
            "INSERT INTO sessions (id, upstream_session_id, owner_fingerprint, created_at, last_accessed_at)
             VALUES (?1, ?2, ?3, ?4, ?4)",
            params![id, upstream_session_id, owner, now],
        )
        .map_err(db_err)?;

        Ok(Session {
            id,
            upstream_session_id,
            owner_fingerprint: owner,
            created_at: now.clone(),
            last_accessed_at: now,
        })
    }

    /// Ownership mismatch and absence both surface as `session_not_found`
    /// — never `forbidden` — so existence is never leaked (spec §9).
    pub async fn get(&self, id: &str, credential: &str) -> CoreResult<Session> {
        let owner = fingerprint(credential);
        let conn = self.conn.lock().await;
        let session = conn
            .query_row(
                "SELECT id, upstream_session_id, owner_fingerprint, created_at, last_accessed_at
                 FROM sessions WHERE id = ?1",
                params![id],
                Session::from_row,
            )
            .map_err(|_| CoreError::session_not_found())?;

        if session.owner_fingerprint != owner {
            return Err(CoreError::session_not_found());
        }
        Ok(session)
    }

    pub async fn touch(&self, id: &str, credential: &str) -> CoreResult<()> {
        let owner = fingerprint(credential);
        let conn = self.conn.lock().await;
        let updated = conn
            .execute(
                "UPDATE sessions SET last_accessed_at = ?1 WHERE id = ?2 AND owner_fingerprint = ?3",
                params![now_iso(), id, owner],
            )
            .map_err(db_err)?;
        if updated == 0 {
            return Err(CoreError::session_not_found());
        }
        Ok(())
    }

    pub async fn delete(&self, id: &str, credential: &str) -> CoreResult<()> {
        let owner = fingerprint(credential);
        {
            let conn = self.conn.lock().await;
            let deleted = conn
                .execute("DELETE FROM sessions WHERE id = ?1 AND owner_fingerprint = ?2", params![id, owner])
                .map_err(db_err)?;
            if deleted == 0 {
                return Err(CoreError::session_not_found());
            }
        }
        self.locks.purge(id).await;
        Ok(())
    }

    pub async fn list(&self, credential: &str) -> CoreResult<Vec<Session>> {
        let owner = fingerprint(credential);
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT id, upstream_session_id, owner_fingerprint, created_at, last_accessed_at
                 FROM sessions WHERE owner_fingerprint = ?1 ORDER BY last_accessed_at DESC",
            )
            .map_err(db_err)?;
        let rows = stmt.query_map(params![owner], Session::from_row).map_err(db_err)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(db_err)
    }

    pub async fn count(&self, credential: &str) -> CoreResult<usize> {
        let owner = fingerprint(credential);
        let conn = self.conn.lock().await;
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM sessions WHERE owner_fingerprint = ?1", params![owner], |r| r.get(0))
            .map_err(db_err)?;
        Ok(count as usize)
    }

    pub async fn acquire(&self, id: &str) {
        self.locks.acquire(id).await;
    }

    pub async fn release(&self, id: &str) {
        self.locks.release(id).await;
    }

    /// Delete rows idle longer than the configured TTL, purging any
    /// in-memory lock for each removed session.
    pub async fn sweep_expired(&self) -> CoreResult<usize> {
        let cutoff = cutoff_iso(self.ttl);

        let expired_ids: Vec<String> = {
            let conn = self.conn.lock().await;
            let mut stmt = conn
                .prepare("SELECT id FROM sessions WHERE last_accessed_at < ?1")
                .map_err(db_err)?;
            let ids = stmt.query_map(params![cutoff], |r| r.get::<_, String>(0)).map_err(db_err)?;
            ids.collect::<Result<Vec<_>, _>>().map_err(db_err)?
        };

        if expired_ids.is_empty() {
            return Ok(0);
        }

        {
            let conn = self.conn.lock().await;
            conn.execute("DELETE FROM sessions WHERE last_accessed_at < ?1", params![cutoff])
                .map_err(db_err)?;
        }
        for id in &expired_ids {
            self.locks.purge(id).await;
        }
        Ok(expired_ids.len())
    }
}

fn cutoff_iso(ttl: Duration) -> String {
    let ttl = ChronoDuration::from_std(ttl).unwrap_or(ChronoDuration::zero());
    (Utc::now() - ttl).to_rfc3339()
}

/// Spawn the recurring TTL sweep task (spec §4.3).
pub fn spawn_sweeper(store: std::sync::Arc<SessionStore>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            match store.sweep_expired().await {
                Ok(0) => {},
                Ok(n) => info!(count = n, "session TTL sweep removed expired sessions"),
                Err(e) => warn!(error = %e, "session TTL sweep failed"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn store(max_sessions_per_key: usize) -> (SessionStore, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sessions.db");
        let store = SessionStore::open(&path, Duration::from_secs(3600), max_sessions_per_key).unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn create_and_get_round_trip() {
        let (store, _dir) = store(10);
        let session = store.create(Some("upstream-1".to_string()), "secret").await.unwrap();
        let fetched = store.get(&session.id, "secret").await.unwrap();
        assert_eq!(fetched.id, session.id);
        assert_eq!(fetched.upstream_session_id.as_deref(), Some("upstream-1"));
    }

    #[tokio::test]
    async fn ownership_mismatch_is_not_found_not_forbidden() {
        let (store, _dir) = store(10);
        let session = store.create(None, "owner-a").await.unwrap();
        let err = store.get(&session.id, "owner-b").await.unwrap_err();
        assert_eq!(err.kind, crate::core::errors::ErrorKind::SessionNotFound);
    }

    #[tokio::test]
    async fn missing_session_is_not_found() {
        let (store, _dir) = store(10);
        let err = store.get("no-such-id", "secret").await.unwrap_err();
        assert_eq!(err.kind, crate::core::errors::ErrorKind::SessionNotFound);
    }

    #[tokio::test]
    async fn quota_rejects_beyond_max_sessions_per_key() {
        let (store, _dir) = store(1);
        store.create(None, "owner").await.unwrap();
        let err = store.create(None, "owner").await.unwrap_err();
        assert_eq!(err.kind, crate::core::errors::ErrorKind::SessionLimit);
    }

    #[tokio::test]
    async fn delete_removes_row_and_is_idempotently_not_found_after() {
        let (store, _dir) = store(10);
        let session = store.create(None, "owner").await.unwrap();
        store.delete(&session.id, "owner").await.unwrap();
        let err = store.get(&session.id, "owner").await.unwrap_err();
        assert_eq!(err.kind, crate::core::errors::ErrorKind::SessionNotFound);
    }

    #[tokio::test]
    async fn touch_advances_last_accessed_and_rejects_wrong_owner() {
        let (store, _dir) = store(10);
        let session = store.create(None, "owner").await.unwrap();
        store.touch(&session.id, "owner").await.unwrap();
        let err = store.touch(&session.id, "intruder").await.unwrap_err();
        assert_eq!(err.kind, crate::core::errors::ErrorKind::SessionNotFound);
    }

    #[tokio::test]
    async fn sweep_expired_removes_stale_sessions_only() {
        let (store, _dir) = store(10);
        let fresh = store.create(None, "owner").await.unwrap();
        let stale = store.create(None, "owner").await.unwrap();

        {
            let conn = store.conn.lock().await;
            conn.execute(
                "UPDATE sessions SET last_accessed_at = ?1 WHERE id = ?2",
                params!["2000-01-01T00:00:00+00:00", stale.id],
            )
            .unwrap();
        }

        let removed = store.sweep_expired().await.unwrap();
        assert_eq!(removed, 1);
        assert!(store.get(&fresh.id, "owner").await.is_ok());
        assert!(store.get(&stale.id, "owner").await.is_err());
    }

    #[tokio::test]
    async fn lock_serves_waiters_in_fifo_order() {
        let (store, _dir) = store(10);
        let store = Arc::new(store);
        let session_id = "S".to_string();
        let order = Arc::new(Mutex::new(Vec::new()));

        store.acquire(&session_id).await;

        let mut handles = Vec::new();
        for name in ["B", "C"] {
            let store = store.clone();
            let session_id = session_id.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                store.acquire(&session_id).await;
                order.lock().await.push(name);
                store.release(&session_id).await;
            }));
        }

        tokio::time::sleep(Duration::from_millis(20)).await;
        order.lock().await.push("A-held");
        store.release(&session_id).await;

        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(*order.lock().await, vec!["A-held", "B", "C"]);
    }

    #[tokio::test]
    async fn lock_release_without_waiters_fully_unlocks() {
        let (store, _dir) = store(10);
        store.acquire("S").await;
        store.release("S").await;
        // second acquire must not block since the entry was removed
        let fut = store.acquire("S");
        tokio::time::timeout(Duration::from_millis(50), fut).await.unwrap();
    }
}
