//! Conversations, messages and runs in SQLite.
//!
//! `has_unread` is computed from `updated_at` vs `last_read_at ?? created_at`,
//! never stored. `client_msg_id` is unique within a conversation. Runs flow
//! `queued -> running -> {succeeded | failed | canceled | waiting_child ->
//! queued}` with lease fields for worker pulls.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};

use crate::CoreError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::System => "system",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            "system" => Some(Self::System),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    WaitingChild,
    Succeeded,
    Failed,
    Canceled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::Running => "running",
            RunStatus::WaitingChild => "waiting_child",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::Canceled => "canceled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "waiting_child" => Some(Self::WaitingChild),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            "canceled" => Some(Self::Canceled),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct Conversation {
    pub id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_read_at: Option<DateTime<Utc>>,
    pub meta_json: Option<serde_json::Value>,
}

impl Conversation {
    /// Computed, never stored: new activity since the last read (or since
    /// creation when never read).
    pub fn has_unread(&self) -> bool {
        match self.last_read_at {
            Some(last_read) => self.updated_at > last_read,
            None => self.updated_at > self.created_at,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub role: MessageRole,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub source_ref: Option<serde_json::Value>,
    pub meta_json: Option<serde_json::Value>,
    pub client_msg_id: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct Run {
    pub id: String,
    pub run_type: String,
    pub title: Option<String>,
    pub conversation_id: Option<String>,
    pub status: RunStatus,
    pub input_json: Option<serde_json::Value>,
    pub output_json: Option<serde_json::Value>,
    pub error: Option<String>,
    pub worker_id: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub attempt: i64,
    pub progress: Option<f64>,
    pub parent_run_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// New message parameters.
#[derive(Clone, Debug, Default)]
pub struct NewMessage {
    pub role: MessageRole,
    pub content: String,
    pub source_ref: Option<serde_json::Value>,
    pub meta_json: Option<serde_json::Value>,
    pub client_msg_id: Option<String>,
}

impl Default for MessageRole {
    fn default() -> Self {
        MessageRole::User
    }
}

#[derive(Clone)]
pub struct ChatStore {
    db: Arc<Mutex<Connection>>,
}

impl ChatStore {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        Self::init(Connection::open(path.as_ref()).map_err(storage)?)
    }

    pub fn in_memory() -> Result<Self, CoreError> {
        Self::init(Connection::open_in_memory().map_err(storage)?)
    }

    fn init(conn: Connection) -> Result<Self, CoreError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                last_read_at TEXT,
                meta_json TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_conversations_updated ON conversations(updated_at DESC);

            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                created_at TEXT NOT NULL,
                source_ref TEXT,
                meta_json TEXT,
                client_msg_id TEXT,
                FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
            );
            CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages(conversation_id, created_at);
            CREATE UNIQUE INDEX IF NOT EXISTS idx_messages_client_msg
                ON messages(conversation_id, client_msg_id) WHERE client_msg_id IS NOT NULL;

            CREATE TABLE IF NOT EXISTS runs (
                id TEXT PRIMARY KEY,
                run_type TEXT NOT NULL,
                title TEXT,
                conversation_id TEXT,
                status TEXT NOT NULL,
                input_json TEXT,
                output_json TEXT,
                error TEXT,
                worker_id TEXT,
                lease_expires_at TEXT,
                attempt INTEGER NOT NULL DEFAULT 0,
                progress REAL,
                parent_run_id TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_runs_status ON runs(status, created_at);
            CREATE INDEX IF NOT EXISTS idx_runs_conversation ON runs(conversation_id, created_at);",
        )
        .map_err(storage)?;
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }

    // ---- conversations ----

    pub async fn create_conversation(&self, title: &str) -> Result<Conversation, CoreError> {
        self.create_conversation_with(title, None, None).await
    }

    /// Create with explicit meta and an optional `updated_at` offset used by
    /// run emission to guarantee `has_unread` on clock-resolution edges.
    pub async fn create_conversation_with(
        &self,
        title: &str,
        meta_json: Option<serde_json::Value>,
        updated_at: Option<DateTime<Utc>>,
    ) -> Result<Conversation, CoreError> {
        let db = self.db.clone();
        let title = title.to_string();
        tokio::task::block_in_place(move || {
            let conn = lock(&db)?;
            let id = uuid::Uuid::new_v4().to_string();
            let now = Utc::now();
            conn.execute(
                "INSERT INTO conversations (id, title, created_at, updated_at, meta_json)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    id,
                    title,
                    now.to_rfc3339(),
                    updated_at.unwrap_or(now).to_rfc3339(),
                    meta_json.map(|v| v.to_string()),
                ],
            )
            .map_err(storage)?;
            get_conversation_locked(&conn, &id)?
                .ok_or_else(|| CoreError::Storage("conversation vanished".to_string()))
        })
    }

    pub async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>, CoreError> {
        let db = self.db.clone();
        let id = id.to_string();
        tokio::task::block_in_place(move || {
            let conn = lock(&db)?;
            get_conversation_locked(&conn, &id)
        })
    }

    /// Ordered by `updated_at` descending.
    pub async fn list_conversations(
        &self,
        limit: Option<usize>,
        offset: Option<usize>,
    ) -> Result<Vec<Conversation>, CoreError> {
        let db = self.db.clone();
        tokio::task::block_in_place(move || {
            let conn = lock(&db)?;
            let mut stmt = conn
                .prepare(
                    "SELECT * FROM conversations ORDER BY updated_at DESC LIMIT ?1 OFFSET ?2",
                )
                .map_err(storage)?;
            let rows = stmt
                .query_map(
                    params![limit.map(|l| l as i64).unwrap_or(-1), offset.unwrap_or(0) as i64],
                    row_to_conversation,
                )
                .map_err(storage)?;
            rows.collect::<rusqlite::Result<_>>().map_err(storage)
        })
    }

    pub async fn update_conversation_title(
        &self,
        id: &str,
        title: &str,
    ) -> Result<Option<Conversation>, CoreError> {
        let db = self.db.clone();
        let id = id.to_string();
        let title = title.to_string();
        tokio::task::block_in_place(move || {
            let conn = lock(&db)?;
            let updated = conn
                .execute(
                    "UPDATE conversations SET title = ?1, updated_at = ?2 WHERE id = ?3",
                    params![title, Utc::now().to_rfc3339(), id],
                )
                .map_err(storage)?;
            if updated == 0 {
                return Ok(None);
            }
            get_conversation_locked(&conn, &id)
        })
    }

    pub async fn delete_conversation(&self, id: &str) -> Result<bool, CoreError> {
        let db = self.db.clone();
        let id = id.to_string();
        tokio::task::block_in_place(move || {
            let conn = lock(&db)?;
            // Cascade isn't on by default in SQLite; delete messages explicitly.
            conn.execute("DELETE FROM messages WHERE conversation_id = ?1", params![id])
                .map_err(storage)?;
            let deleted = conn
                .execute("DELETE FROM conversations WHERE id = ?1", params![id])
                .map_err(storage)?;
            Ok(deleted > 0)
        })
    }

    /// Sets `last_read_at = max(now, updated_at) + 1ms`, and corrects once if
    /// `updated_at` advanced concurrently past the written value.
    pub async fn mark_read(&self, id: &str) -> Result<Option<Conversation>, CoreError> {
        let db = self.db.clone();
        let id = id.to_string();
        tokio::task::block_in_place(move || {
            let conn = lock(&db)?;
            let Some(conversation) = get_conversation_locked(&conn, &id)? else {
                return Ok(None);
            };
            let now = Utc::now();
            let last_read = now.max(conversation.updated_at) + Duration::milliseconds(1);
            conn.execute(
                "UPDATE conversations SET last_read_at = ?1 WHERE id = ?2",
                params![last_read.to_rfc3339(), id],
            )
            .map_err(storage)?;

            // Corrective pass: a concurrent bump of updated_at must not leave
            // the conversation unread right after mark-read.
            let reloaded = get_conversation_locked(&conn, &id)?
                .ok_or_else(|| CoreError::Storage("conversation vanished".to_string()))?;
            if let Some(last) = reloaded.last_read_at {
                if last <= reloaded.updated_at {
                    conn.execute(
                        "UPDATE conversations SET last_read_at = ?1 WHERE id = ?2",
                        params![
                            (reloaded.updated_at + Duration::milliseconds(1)).to_rfc3339(),
                            id
                        ],
                    )
                    .map_err(storage)?;
                }
            }
            get_conversation_locked(&conn, &id)
        })
    }

    /// Bump `updated_at` (message activity).
    pub async fn touch_conversation(
        &self,
        id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        let db = self.db.clone();
        let id = id.to_string();
        tokio::task::block_in_place(move || {
            let conn = lock(&db)?;
            conn.execute(
                "UPDATE conversations SET updated_at = ?1 WHERE id = ?2",
                params![at.to_rfc3339(), id],
            )
            .map_err(storage)?;
            Ok(())
        })
    }

    // ---- messages ----

    pub async fn insert_message(
        &self,
        conversation_id: &str,
        new: NewMessage,
    ) -> Result<Message, CoreError> {
        self.insert_message_at(conversation_id, new, Utc::now()).await
    }

    pub async fn insert_message_at(
        &self,
        conversation_id: &str,
        new: NewMessage,
        created_at: DateTime<Utc>,
    ) -> Result<Message, CoreError> {
        let db = self.db.clone();
        let conversation_id = conversation_id.to_string();
        tokio::task::block_in_place(move || {
            let conn = lock(&db)?;
            let id = uuid::Uuid::new_v4().to_string();
            conn.execute(
                "INSERT INTO messages (id, conversation_id, role, content, created_at, source_ref, meta_json, client_msg_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    id,
                    conversation_id,
                    new.role.as_str(),
                    new.content,
                    created_at.to_rfc3339(),
                    new.source_ref.map(|v| v.to_string()),
                    new.meta_json.map(|v| v.to_string()),
                    new.client_msg_id,
                ],
            )
            .map_err(storage)?;
            get_message_locked(&conn, &id)?
                .ok_or_else(|| CoreError::Storage("message vanished".to_string()))
        })
    }

    pub async fn get_message_by_client_id(
        &self,
        conversation_id: &str,
        client_msg_id: &str,
    ) -> Result<Option<Message>, CoreError> {
        let db = self.db.clone();
        let conversation_id = conversation_id.to_string();
        let client_msg_id = client_msg_id.to_string();
        tokio::task::block_in_place(move || {
            let conn = lock(&db)?;
            let mut stmt = conn
                .prepare(
                    "SELECT * FROM messages WHERE conversation_id = ?1 AND client_msg_id = ?2",
                )
                .map_err(storage)?;
            let mut rows = stmt
                .query_map(params![conversation_id, client_msg_id], row_to_message)
                .map_err(storage)?;
            match rows.next() {
                Some(row) => Ok(Some(row.map_err(storage)?)),
                None => Ok(None),
            }
        })
    }

    /// Ascending by `created_at`.
    pub async fn list_messages(
        &self,
        conversation_id: &str,
        limit: Option<usize>,
        offset: Option<usize>,
    ) -> Result<Vec<Message>, CoreError> {
        let db = self.db.clone();
        let conversation_id = conversation_id.to_string();
        tokio::task::block_in_place(move || {
            let conn = lock(&db)?;
            let mut stmt = conn
                .prepare(
                    "SELECT * FROM messages WHERE conversation_id = ?1
                     ORDER BY created_at ASC LIMIT ?2 OFFSET ?3",
                )
                .map_err(storage)?;
            let rows = stmt
                .query_map(
                    params![
                        conversation_id,
                        limit.map(|l| l as i64).unwrap_or(-1),
                        offset.unwrap_or(0) as i64
                    ],
                    row_to_message,
                )
                .map_err(storage)?;
            rows.collect::<rusqlite::Result<_>>().map_err(storage)
        })
    }

    /// Most recent messages, descending, for history windows.
    pub async fn recent_messages(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> Result<Vec<Message>, CoreError> {
        let db = self.db.clone();
        let conversation_id = conversation_id.to_string();
        tokio::task::block_in_place(move || {
            let conn = lock(&db)?;
            let mut stmt = conn
                .prepare(
                    "SELECT * FROM messages WHERE conversation_id = ?1
                     ORDER BY created_at DESC LIMIT ?2",
                )
                .map_err(storage)?;
            let rows = stmt
                .query_map(params![conversation_id, limit as i64], row_to_message)
                .map_err(storage)?;
            rows.collect::<rusqlite::Result<_>>().map_err(storage)
        })
    }

    /// Any existing completion message for a run: `source_ref.ref_id == run_id`
    /// and `source_ref.kind` in `run`/`run_done`. Prefers the JSON1 indexed
    /// query; falls back to a linear scan when `json_extract` is unavailable.
    pub async fn find_run_completion_message(
        &self,
        run_id: &str,
    ) -> Result<Option<Message>, CoreError> {
        let db = self.db.clone();
        let run_id = run_id.to_string();
        tokio::task::block_in_place(move || {
            let conn = lock(&db)?;
            let json_query = conn.prepare(
                "SELECT * FROM messages
                 WHERE source_ref IS NOT NULL
                   AND json_extract(source_ref, '$.ref_id') = ?1
                   AND json_extract(source_ref, '$.kind') IN ('run', 'run_done')",
            );
            match json_query {
                Ok(mut stmt) => {
                    let mut rows = stmt
                        .query_map(params![run_id], row_to_message)
                        .map_err(storage)?;
                    match rows.next() {
                        Some(row) => Ok(Some(row.map_err(storage)?)),
                        None => Ok(None),
                    }
                }
                Err(_) => {
                    let mut stmt = conn
                        .prepare("SELECT * FROM messages WHERE source_ref IS NOT NULL")
                        .map_err(storage)?;
                    let rows = stmt.query_map([], row_to_message).map_err(storage)?;
                    for row in rows {
                        let message = row.map_err(storage)?;
                        if let Some(source_ref) = &message.source_ref {
                            let kind = source_ref["kind"].as_str().unwrap_or("");
                            if source_ref["ref_id"].as_str() == Some(run_id.as_str())
                                && (kind == "run" || kind == "run_done")
                            {
                                return Ok(Some(message));
                            }
                        }
                    }
                    Ok(None)
                }
            }
        })
    }

    // ---- runs ----

    pub async fn create_run(
        &self,
        run_type: &str,
        title: Option<&str>,
        conversation_id: Option<&str>,
        input_json: Option<serde_json::Value>,
    ) -> Result<Run, CoreError> {
        let db = self.db.clone();
        let run_type = run_type.to_string();
        let title = title.map(str::to_string);
        let conversation_id = conversation_id.map(str::to_string);
        tokio::task::block_in_place(move || {
            let conn = lock(&db)?;
            let id = format!("run_{}", &uuid::Uuid::new_v4().simple().to_string()[..12]);
            let now = Utc::now();
            let parent_run_id = input_json
                .as_ref()
                .and_then(|v| v["parent_run_id"].as_str().map(str::to_string));
            conn.execute(
                "INSERT INTO runs (id, run_type, title, conversation_id, status, input_json, parent_run_id, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, 'queued', ?5, ?6, ?7, ?8)",
                params![
                    id,
                    run_type,
                    title,
                    conversation_id,
                    input_json.map(|v| v.to_string()),
                    parent_run_id,
                    now.to_rfc3339(),
                    now.to_rfc3339(),
                ],
            )
            .map_err(storage)?;
            get_run_locked(&conn, &id)?
                .ok_or_else(|| CoreError::Storage("run vanished".to_string()))
        })
    }

    pub async fn get_run(&self, run_id: &str) -> Result<Option<Run>, CoreError> {
        let db = self.db.clone();
        let run_id = run_id.to_string();
        tokio::task::block_in_place(move || {
            let conn = lock(&db)?;
            get_run_locked(&conn, &run_id)
        })
    }

    pub async fn list_runs_for_conversation(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> Result<Vec<Run>, CoreError> {
        let db = self.db.clone();
        let conversation_id = conversation_id.to_string();
        tokio::task::block_in_place(move || {
            let conn = lock(&db)?;
            let mut stmt = conn
                .prepare(
                    "SELECT * FROM runs WHERE conversation_id = ?1
                     ORDER BY created_at DESC LIMIT ?2",
                )
                .map_err(storage)?;
            let rows = stmt
                .query_map(params![conversation_id, limit as i64], row_to_run)
                .map_err(storage)?;
            rows.collect::<rusqlite::Result<_>>().map_err(storage)
        })
    }

    /// Worker pull: claim the oldest queued run, moving it to running with a
    /// lease.
    pub async fn claim_next_run(
        &self,
        worker_id: &str,
        lease_seconds: i64,
    ) -> Result<Option<Run>, CoreError> {
        let db = self.db.clone();
        let worker_id = worker_id.to_string();
        tokio::task::block_in_place(move || {
            let conn = lock(&db)?;
            let candidate: Option<String> = conn
                .query_row(
                    "SELECT id FROM runs WHERE status = 'queued' ORDER BY created_at ASC LIMIT 1",
                    [],
                    |row| row.get(0),
                )
                .ok();
            let Some(id) = candidate else { return Ok(None) };
            let now = Utc::now();
            let claimed = conn
                .execute(
                    "UPDATE runs SET status = 'running', worker_id = ?1, lease_expires_at = ?2,
                        attempt = attempt + 1, updated_at = ?3
                     WHERE id = ?4 AND status = 'queued'",
                    params![
                        worker_id,
                        (now + Duration::seconds(lease_seconds)).to_rfc3339(),
                        now.to_rfc3339(),
                        id,
                    ],
                )
                .map_err(storage)?;
            if claimed == 0 {
                return Ok(None);
            }
            get_run_locked(&conn, &id)
        })
    }

    /// Write mutable run fields back. Lifecycle assertions live in the queue
    /// layer; this is the raw persistence hop.
    pub async fn update_run(&self, run: &Run) -> Result<(), CoreError> {
        let db = self.db.clone();
        let run = run.clone();
        tokio::task::block_in_place(move || {
            let conn = lock(&db)?;
            conn.execute(
                "UPDATE runs SET status = ?1, input_json = ?2, output_json = ?3, error = ?4,
                    worker_id = ?5, lease_expires_at = ?6, progress = ?7, updated_at = ?8
                 WHERE id = ?9",
                params![
                    run.status.as_str(),
                    run.input_json.as_ref().map(|v| v.to_string()),
                    run.output_json.as_ref().map(|v| v.to_string()),
                    run.error,
                    run.worker_id,
                    run.lease_expires_at.map(|t| t.to_rfc3339()),
                    run.progress,
                    run.updated_at.to_rfc3339(),
                    run.id,
                ],
            )
            .map_err(storage)?;
            Ok(())
        })
    }
}

fn lock(db: &Arc<Mutex<Connection>>) -> Result<MutexGuard<'_, Connection>, CoreError> {
    db.lock()
        .map_err(|_| CoreError::Storage("lock poisoned".to_string()))
}

fn storage(e: rusqlite::Error) -> CoreError {
    CoreError::Storage(e.to_string())
}

fn get_conversation_locked(
    conn: &Connection,
    id: &str,
) -> Result<Option<Conversation>, CoreError> {
    let mut stmt = conn
        .prepare("SELECT * FROM conversations WHERE id = ?1")
        .map_err(storage)?;
    let mut rows = stmt
        .query_map(params![id], row_to_conversation)
        .map_err(storage)?;
    match rows.next() {
        Some(row) => Ok(Some(row.map_err(storage)?)),
        None => Ok(None),
    }
}

fn get_message_locked(conn: &Connection, id: &str) -> Result<Option<Message>, CoreError> {
    let mut stmt = conn
        .prepare("SELECT * FROM messages WHERE id = ?1")
        .map_err(storage)?;
    let mut rows = stmt.query_map(params![id], row_to_message).map_err(storage)?;
    match rows.next() {
        Some(row) => Ok(Some(row.map_err(storage)?)),
        None => Ok(None),
    }
}

fn get_run_locked(conn: &Connection, id: &str) -> Result<Option<Run>, CoreError> {
    let mut stmt = conn
        .prepare("SELECT * FROM runs WHERE id = ?1")
        .map_err(storage)?;
    let mut rows = stmt.query_map(params![id], row_to_run).map_err(storage)?;
    match rows.next() {
        Some(row) => Ok(Some(row.map_err(storage)?)),
        None => Ok(None),
    }
}

fn row_to_conversation(row: &Row<'_>) -> rusqlite::Result<Conversation> {
    let meta: Option<String> = row.get("meta_json")?;
    Ok(Conversation {
        id: row.get("id")?,
        title: row.get("title")?,
        created_at: parse_ts(row, "created_at")?,
        updated_at: parse_ts(row, "updated_at")?,
        last_read_at: parse_ts_opt(row, "last_read_at")?,
        meta_json: meta.and_then(|j| serde_json::from_str(&j).ok()),
    })
}

fn row_to_message(row: &Row<'_>) -> rusqlite::Result<Message> {
    let role: String = row.get("role")?;
    let source_ref: Option<String> = row.get("source_ref")?;
    let meta: Option<String> = row.get("meta_json")?;
    Ok(Message {
        id: row.get("id")?,
        conversation_id: row.get("conversation_id")?,
        role: MessageRole::parse(&role).unwrap_or(MessageRole::User),
        content: row.get("content")?,
        created_at: parse_ts(row, "created_at")?,
        source_ref: source_ref.and_then(|j| serde_json::from_str(&j).ok()),
        meta_json: meta.and_then(|j| serde_json::from_str(&j).ok()),
        client_msg_id: row.get("client_msg_id")?,
    })
}

fn row_to_run(row: &Row<'_>) -> rusqlite::Result<Run> {
    let status: String = row.get("status")?;
    let input: Option<String> = row.get("input_json")?;
    let output: Option<String> = row.get("output_json")?;
    Ok(Run {
        id: row.get("id")?,
        run_type: row.get("run_type")?,
        title: row.get("title")?,
        conversation_id: row.get("conversation_id")?,
        status: RunStatus::parse(&status).unwrap_or(RunStatus::Failed),
        input_json: input.and_then(|j| serde_json::from_str(&j).ok()),
        output_json: output.and_then(|j| serde_json::from_str(&j).ok()),
        error: row.get("error")?,
        worker_id: row.get("worker_id")?,
        lease_expires_at: parse_ts_opt(row, "lease_expires_at")?,
        attempt: row.get("attempt")?,
        progress: row.get("progress")?,
        parent_run_id: row.get("parent_run_id")?,
        created_at: parse_ts(row, "created_at")?,
        updated_at: parse_ts(row, "updated_at")?,
    })
}

fn parse_ts(row: &Row<'_>, column: &str) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(column)?;
    Ok(raw.parse().unwrap_or_else(|_| Utc::now()))
}

fn parse_ts_opt(row: &Row<'_>, column: &str) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(column)?;
    Ok(raw.and_then(|s| s.parse().ok()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread")]
    async fn conversation_unread_is_computed() {
        let store = ChatStore::in_memory().unwrap();
        let conv = store.create_conversation("chat").await.unwrap();
        assert!(!conv.has_unread());

        store
            .touch_conversation(&conv.id, Utc::now() + Duration::milliseconds(5))
            .await
            .unwrap();
        let conv = store.get_conversation(&conv.id).await.unwrap().unwrap();
        assert!(conv.has_unread());

        let read = store.mark_read(&conv.id).await.unwrap().unwrap();
        assert!(!read.has_unread());
        assert!(read.last_read_at.unwrap() > read.updated_at);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn mark_read_never_regresses() {
        let store = ChatStore::in_memory().unwrap();
        let conv = store.create_conversation("chat").await.unwrap();
        let first = store.mark_read(&conv.id).await.unwrap().unwrap();
        let first_read = first.last_read_at.unwrap();

        // New activity after mark-read flips unread again.
        store
            .touch_conversation(&conv.id, first_read + Duration::milliseconds(5))
            .await
            .unwrap();
        let conv = store.get_conversation(&conv.id).await.unwrap().unwrap();
        assert!(conv.has_unread());
        assert_eq!(conv.last_read_at.unwrap(), first_read);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn client_msg_id_is_unique_per_conversation() {
        let store = ChatStore::in_memory().unwrap();
        let conv = store.create_conversation("chat").await.unwrap();
        store
            .insert_message(
                &conv.id,
                NewMessage {
                    role: MessageRole::User,
                    content: "hello".to_string(),
                    client_msg_id: Some("c1".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let dup = store
            .insert_message(
                &conv.id,
                NewMessage {
                    role: MessageRole::User,
                    content: "hello again".to_string(),
                    client_msg_id: Some("c1".to_string()),
                    ..Default::default()
                },
            )
            .await;
        assert!(dup.is_err());

        let found = store
            .get_message_by_client_id(&conv.id, "c1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.content, "hello");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn run_claim_moves_queued_to_running() {
        let store = ChatStore::in_memory().unwrap();
        let run = store
            .create_run("research_report", Some("find things"), None, None)
            .await
            .unwrap();
        assert_eq!(run.status, RunStatus::Queued);

        let claimed = store.claim_next_run("worker-1", 60).await.unwrap().unwrap();
        assert_eq!(claimed.id, run.id);
        assert_eq!(claimed.status, RunStatus::Running);
        assert_eq!(claimed.worker_id.as_deref(), Some("worker-1"));
        assert_eq!(claimed.attempt, 1);
        assert!(claimed.lease_expires_at.is_some());

        assert!(store.claim_next_run("worker-2", 60).await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn parent_run_id_is_lifted_from_input() {
        let store = ChatStore::in_memory().unwrap();
        let run = store
            .create_run(
                "run_code_snippet",
                None,
                None,
                Some(serde_json::json!({"parent_run_id": "run_parent", "code": "1+1"})),
            )
            .await
            .unwrap();
        assert_eq!(run.parent_run_id.as_deref(), Some("run_parent"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn find_run_completion_message_matches_both_kinds() {
        let store = ChatStore::in_memory().unwrap();
        let conv = store.create_conversation("chat").await.unwrap();
        store
            .insert_message(
                &conv.id,
                NewMessage {
                    role: MessageRole::Assistant,
                    content: "done".to_string(),
                    source_ref: Some(serde_json::json!({"kind": "run_done", "ref_id": "run_1"})),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert!(store
            .find_run_completion_message("run_1")
            .await
            .unwrap()
            .is_some());
        assert!(store
            .find_run_completion_message("run_2")
            .await
            .unwrap()
            .is_none());
    }
}
