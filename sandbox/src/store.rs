//! Per-exec persistence.
//!
//! A `RUNNING` row is inserted before the container launches so a crash never
//! loses the record; the same row is updated once on completion. The unique
//! `idempotency_key` turns concurrent duplicates into a fetch of the existing
//! row. Environment keys are stored, never values.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use serde::Serialize;

use crate::errors::SandboxError;
use crate::runner::ExecStatus;

#[derive(Clone, Debug, Serialize)]
pub struct SandboxExecRecord {
    pub exec_id: String,
    pub project_id: String,
    pub task_id: Option<String>,
    pub conversation_id: Option<String>,
    pub skill_id: Option<String>,
    pub image: Option<String>,
    pub cmd: Option<String>,
    pub args: Vec<String>,
    pub cwd: Option<String>,
    pub env_keys: Vec<String>,
    pub policy_snapshot: Option<serde_json::Value>,
    pub status: ExecStatus,
    pub exit_code: Option<i32>,
    pub error_reason: Option<serde_json::Value>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub artifacts_path: String,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    pub idempotency_key: Option<String>,
}

/// Terminal fields written by [`SandboxStore::update_record`].
#[derive(Clone, Debug, Default)]
pub struct ExecUpdate {
    pub image: Option<String>,
    pub cmd: Option<String>,
    pub args_json: Option<String>,
    pub cwd: Option<String>,
    pub env_keys_json: Option<String>,
    pub policy_snapshot: Option<serde_json::Value>,
    pub exit_code: Option<i32>,
    pub error_reason: Option<serde_json::Value>,
    pub duration_ms: Option<i64>,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
}

pub struct SandboxStore {
    db: Arc<Mutex<Connection>>,
}

impl SandboxStore {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, SandboxError> {
        let conn = Connection::open(path.as_ref()).map_err(storage)?;
        Self::init(conn)
    }

    pub fn in_memory() -> Result<Self, SandboxError> {
        Self::init(Connection::open_in_memory().map_err(storage)?)
    }

    fn init(conn: Connection) -> Result<Self, SandboxError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS sandbox_execs (
                exec_id TEXT PRIMARY KEY,
                project_id TEXT NOT NULL,
                task_id TEXT,
                conversation_id TEXT,
                skill_id TEXT,
                image TEXT,
                cmd TEXT,
                args TEXT NOT NULL DEFAULT '[]',
                cwd TEXT,
                env_keys TEXT NOT NULL DEFAULT '[]',
                policy_snapshot TEXT,
                status TEXT NOT NULL,
                exit_code INTEGER,
                error_reason TEXT,
                started_at TEXT NOT NULL,
                ended_at TEXT,
                duration_ms INTEGER,
                artifacts_path TEXT NOT NULL,
                stdout_truncated INTEGER NOT NULL DEFAULT 0,
                stderr_truncated INTEGER NOT NULL DEFAULT 0,
                idempotency_key TEXT
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_sandbox_execs_idem
                ON sandbox_execs(idempotency_key) WHERE idempotency_key IS NOT NULL;
            CREATE INDEX IF NOT EXISTS idx_sandbox_execs_task ON sandbox_execs(task_id);",
        )
        .map_err(storage)?;
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }

    /// Insert the initial RUNNING row. Returns `Ok(false)` when a concurrent
    /// duplicate hit the idempotency unique index.
    #[allow(clippy::too_many_arguments)]
    pub fn insert_running(
        &self,
        exec_id: &str,
        project_id: &str,
        task_id: Option<&str>,
        conversation_id: Option<&str>,
        skill_id: Option<&str>,
        started_at: DateTime<Utc>,
        artifacts_path: &str,
        idempotency_key: Option<&str>,
    ) -> Result<bool, SandboxError> {
        let conn = self.lock()?;
        let result = conn.execute(
            "INSERT INTO sandbox_execs (exec_id, project_id, task_id, conversation_id, skill_id,
                status, started_at, artifacts_path, idempotency_key)
             VALUES (?1, ?2, ?3, ?4, ?5, 'RUNNING', ?6, ?7, ?8)",
            params![
                exec_id,
                project_id,
                task_id,
                conversation_id,
                skill_id,
                started_at.to_rfc3339(),
                artifacts_path,
                idempotency_key,
            ],
        );
        match result {
            Ok(_) => Ok(true),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Ok(false)
            }
            Err(e) => Err(storage(e)),
        }
    }

    pub fn update_record(
        &self,
        exec_id: &str,
        status: ExecStatus,
        ended_at: DateTime<Utc>,
        update: ExecUpdate,
    ) -> Result<(), SandboxError> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE sandbox_execs SET status = ?1, ended_at = ?2, duration_ms = ?3,
                stdout_truncated = ?4, stderr_truncated = ?5,
                image = COALESCE(?6, image), cmd = COALESCE(?7, cmd),
                args = COALESCE(?8, args), cwd = COALESCE(?9, cwd),
                env_keys = COALESCE(?10, env_keys),
                policy_snapshot = COALESCE(?11, policy_snapshot),
                exit_code = COALESCE(?12, exit_code),
                error_reason = COALESCE(?13, error_reason)
             WHERE exec_id = ?14",
            params![
                status.as_str(),
                ended_at.to_rfc3339(),
                update.duration_ms,
                update.stdout_truncated as i64,
                update.stderr_truncated as i64,
                update.image,
                update.cmd,
                update.args_json,
                update.cwd,
                update.env_keys_json,
                update
                    .policy_snapshot
                    .map(|v| serde_json::to_string(&v).unwrap_or_default()),
                update.exit_code,
                update
                    .error_reason
                    .map(|v| serde_json::to_string(&v).unwrap_or_default()),
                exec_id,
            ],
        )
        .map_err(storage)?;
        Ok(())
    }

    pub fn get(&self, exec_id: &str) -> Result<Option<SandboxExecRecord>, SandboxError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT * FROM sandbox_execs WHERE exec_id = ?1")
            .map_err(storage)?;
        let mut rows = stmt.query_map(params![exec_id], row_to_record).map_err(storage)?;
        match rows.next() {
            Some(row) => Ok(Some(row.map_err(storage)?)),
            None => Ok(None),
        }
    }

    pub fn get_by_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Option<SandboxExecRecord>, SandboxError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT * FROM sandbox_execs WHERE idempotency_key = ?1")
            .map_err(storage)?;
        let mut rows = stmt.query_map(params![key], row_to_record).map_err(storage)?;
        match rows.next() {
            Some(row) => Ok(Some(row.map_err(storage)?)),
            None => Ok(None),
        }
    }

    pub fn list(
        &self,
        task_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<SandboxExecRecord>, SandboxError> {
        let conn = self.lock()?;
        let mut query = "SELECT * FROM sandbox_execs WHERE 1=1".to_string();
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if let Some(task) = task_id {
            query.push_str(" AND task_id = ?");
            args.push(Box::new(task.to_string()));
        }
        query.push_str(" ORDER BY started_at DESC LIMIT ?");
        args.push(Box::new(limit as i64));
        let mut stmt = conn.prepare(&query).map_err(storage)?;
        let params: Vec<&dyn rusqlite::ToSql> = args.iter().map(|b| b.as_ref()).collect();
        let rows = stmt
            .query_map(params.as_slice(), row_to_record)
            .map_err(storage)?;
        rows.collect::<rusqlite::Result<_>>().map_err(storage)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, SandboxError> {
        self.db
            .lock()
            .map_err(|_| SandboxError::Runtime("lock poisoned".to_string()))
    }
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<SandboxExecRecord> {
    let args_json: String = row.get("args")?;
    let env_keys_json: String = row.get("env_keys")?;
    let policy_json: Option<String> = row.get("policy_snapshot")?;
    let error_json: Option<String> = row.get("error_reason")?;
    let status: String = row.get("status")?;
    let started: String = row.get("started_at")?;
    let ended: Option<String> = row.get("ended_at")?;
    Ok(SandboxExecRecord {
        exec_id: row.get("exec_id")?,
        project_id: row.get("project_id")?,
        task_id: row.get("task_id")?,
        conversation_id: row.get("conversation_id")?,
        skill_id: row.get("skill_id")?,
        image: row.get("image")?,
        cmd: row.get("cmd")?,
        args: serde_json::from_str(&args_json).unwrap_or_default(),
        cwd: row.get("cwd")?,
        env_keys: serde_json::from_str(&env_keys_json).unwrap_or_default(),
        policy_snapshot: policy_json.and_then(|j| serde_json::from_str(&j).ok()),
        status: ExecStatus::parse(&status).unwrap_or(ExecStatus::Failed),
        exit_code: row.get("exit_code")?,
        error_reason: error_json.and_then(|j| serde_json::from_str(&j).ok()),
        started_at: started.parse().unwrap_or_else(|_| Utc::now()),
        ended_at: ended.and_then(|s| s.parse().ok()),
        duration_ms: row.get("duration_ms")?,
        artifacts_path: row.get("artifacts_path")?,
        stdout_truncated: row.get::<_, i64>("stdout_truncated")? != 0,
        stderr_truncated: row.get::<_, i64>("stderr_truncated")? != 0,
        idempotency_key: row.get("idempotency_key")?,
    })
}

fn storage(e: rusqlite::Error) -> SandboxError {
    SandboxError::Runtime(e.to_string())
}
