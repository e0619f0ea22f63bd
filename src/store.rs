//! Durable job persistence backed by SQLite.
//!
//! Every operation but `init` tolerates backend failure: a failing
//! `insert`/`update` is logged and treated as if persistence were disabled
//! for that call. `init` is the only operation allowed to fail its
//! caller — there is no sensible degraded mode for "the store could never
//! be opened at all", so the scheduler treats that failure as persistence
//! being unavailable for the whole run rather than retrying per call.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::Connection;

use crate::job::{JobSpec, PersistStatus};

const DDL: &str = "
CREATE TABLE IF NOT EXISTS jobs (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  cmd TEXT NOT NULL,
  cpu_cores INTEGER NOT NULL,
  memory_mb INTEGER NOT NULL,
  timeout_sec INTEGER NOT NULL,
  priority INTEGER NOT NULL,
  status TEXT NOT NULL,
  submit_ms INTEGER NOT NULL,
  start_ms INTEGER NOT NULL DEFAULT 0,
  end_ms INTEGER NOT NULL DEFAULT 0,
  exit_code INTEGER NOT NULL DEFAULT 0
);
";

/// A job loaded back from the store at startup. Always reported as
/// `Queued` regardless of whether it was last seen `queued` or `running` —
/// on restart there is no running child to rejoin, so it is rescheduled
/// from scratch.
pub struct PersistedJob {
    pub id: u64,
    pub spec: JobSpec,
}

pub struct JobStore {
    conn: Mutex<Connection>,
}

impl JobStore {
    pub fn init(path: &str) -> Result<Self, rusqlite::Error> {
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                let _ = std::fs::create_dir_all(parent);
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(DDL)?;
        Ok(JobStore {
            conn: Mutex::new(conn),
        })
    }

    /// Inserts a newly-submitted job, returning the store-assigned id.
    /// Returns `None` (logged) on any backend failure.
    pub fn insert(&self, spec: &JobSpec, status: PersistStatus, submit_ms: i64) -> Option<u64> {
        let conn = self.conn.lock().unwrap();
        let result = conn.execute(
            "INSERT INTO jobs(cmd, cpu_cores, memory_mb, timeout_sec, priority, status, submit_ms) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                spec.cmd,
                spec.cpu_cores,
                spec.memory_mb,
                spec.timeout_sec,
                spec.priority,
                status.as_str(),
                submit_ms,
            ],
        );
        match result {
            Ok(_) => Some(conn.last_insert_rowid() as u64),
            Err(e) => {
                tracing::warn!(error = %e, "failed to persist job insert");
                None
            }
        }
    }

    /// Records a status transition. Failures are logged and otherwise
    /// ignored — the in-memory kernel state is authoritative regardless.
    pub fn update(
        &self,
        id: u64,
        status: PersistStatus,
        exit_code: i32,
        start_ms: i64,
        end_ms: i64,
    ) {
        let conn = self.conn.lock().unwrap();
        let result = conn.execute(
            "UPDATE jobs SET status = ?1, exit_code = ?2, start_ms = ?3, end_ms = ?4 WHERE id = ?5",
            rusqlite::params![status.as_str(), exit_code, start_ms, end_ms, id],
        );
        if let Err(e) = result {
            tracing::warn!(job_id = id, error = %e, "failed to persist job update");
        }
    }

    /// Loads every job whose last recorded status is `queued` or `running`.
    /// Returns an empty vector (logged) on backend failure.
    pub fn load_unfinished(&self) -> Vec<PersistedJob> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = match conn.prepare(
            "SELECT id, cmd, cpu_cores, memory_mb, timeout_sec, priority FROM jobs \
             WHERE status IN ('queued', 'running')",
        ) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "failed to prepare load_unfinished query");
                return Vec::new();
            }
        };
        let rows = stmt.query_map([], |row| {
            Ok(PersistedJob {
                id: row.get::<_, i64>(0)? as u64,
                spec: JobSpec {
                    cmd: row.get(1)?,
                    cpu_cores: row.get(2)?,
                    memory_mb: row.get(3)?,
                    timeout_sec: row.get(4)?,
                    priority: row.get(5)?,
                },
            })
        });
        match rows {
            Ok(rows) => rows.filter_map(|r| r.ok()).collect(),
            Err(e) => {
                tracing::warn!(error = %e, "failed to load unfinished jobs");
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(cmd: &str) -> JobSpec {
        JobSpec {
            cmd: cmd.to_string(),
            cpu_cores: 1,
            memory_mb: 64,
            timeout_sec: 0,
            priority: 0,
        }
    }

    #[test]
    fn insert_then_load_unfinished_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let db_path = tmp.path().join("tasks.db");
        let store = JobStore::init(db_path.to_str().unwrap()).unwrap();

        let id1 = store.insert(&spec("echo a"), PersistStatus::Queued, 1000).unwrap();
        let id2 = store.insert(&spec("echo b"), PersistStatus::Queued, 2000).unwrap();
        assert!(id2 > id1);

        let unfinished = store.load_unfinished();
        assert_eq!(unfinished.len(), 2);
    }

    #[test]
    fn update_to_succeeded_excludes_from_unfinished() {
        let tmp = tempfile::tempdir().unwrap();
        let db_path = tmp.path().join("tasks.db");
        let store = JobStore::init(db_path.to_str().unwrap()).unwrap();

        let id = store.insert(&spec("echo a"), PersistStatus::Queued, 1000).unwrap();
        store.update(id, PersistStatus::Succeeded, 0, 1000, 1500);

        assert!(store.load_unfinished().is_empty());
    }

    #[test]
    fn init_is_idempotent_across_restart() {
        let tmp = tempfile::tempdir().unwrap();
        let db_path = tmp.path().join("tasks.db");
        {
            let store = JobStore::init(db_path.to_str().unwrap()).unwrap();
            store.insert(&spec("echo a"), PersistStatus::Queued, 1000);
        }
        let store = JobStore::init(db_path.to_str().unwrap()).unwrap();
        assert_eq!(store.load_unfinished().len(), 1);
    }
}
