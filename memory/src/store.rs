//! SQLite-backed proposal/fact store.
//!
//! Acceptance resolves scope and conflict strategy, then either updates the
//! existing active fact in place (`overwrite_latest`, version bump + diff
//! audit) or creates a new one (`keep_both`). Every state change writes an
//! audit event. Under `overwrite_latest` at most one active fact exists per
//! `(key, scope, project_id, session_id)`.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use tracing::debug;

use crate::audit::{
    ensure_table, log_event, query_events, AuditActor, AuditEvent, AuditEventDiff, AuditEventType,
    AuditTarget,
};
use crate::schemas::{
    ConflictStrategy, Fact, FactStatus, Proposal, ProposalPayload, ProposalStatus, Scope, SourceRef,
};
use crate::MemoryError;

const SINGLE_VALUED_KEYS: &[&str] = &["preferred_name", "timezone", "language", "email", "phone"];
const MULTI_VALUED_KEYS: &[&str] = &["favorite_tools", "projects", "constraints", "skills", "tags"];

pub struct MemoryStore {
    db: Arc<Mutex<Connection>>,
}

impl MemoryStore {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, MemoryError> {
        let conn = Connection::open(path.as_ref()).map_err(storage)?;
        Self::init(conn)
    }

    pub fn in_memory() -> Result<Self, MemoryError> {
        let conn = Connection::open_in_memory().map_err(storage)?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, MemoryError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS proposals (
                id TEXT PRIMARY KEY,
                payload_key TEXT NOT NULL,
                payload_value TEXT NOT NULL,
                payload_tags TEXT NOT NULL DEFAULT '[]',
                ttl_seconds INTEGER,
                status TEXT NOT NULL,
                reason TEXT,
                confidence REAL,
                scope_hint TEXT,
                source_ref_kind TEXT NOT NULL,
                source_ref_ref_id TEXT NOT NULL,
                source_ref_excerpt TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_proposals_status ON proposals(status);

            CREATE TABLE IF NOT EXISTS facts (
                id TEXT PRIMARY KEY,
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                status TEXT NOT NULL,
                scope TEXT NOT NULL,
                project_id TEXT,
                session_id TEXT,
                source_ref_kind TEXT NOT NULL,
                source_ref_ref_id TEXT NOT NULL,
                source_ref_excerpt TEXT,
                confidence REAL,
                version INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_facts_key_scope ON facts(key, scope, status);

            CREATE TABLE IF NOT EXISTS key_policies (
                key TEXT PRIMARY KEY,
                strategy TEXT NOT NULL
            );",
        )
        .map_err(storage)?;
        ensure_table(&conn).map_err(storage)?;
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }

    pub async fn create_proposal(
        &self,
        payload: ProposalPayload,
        source_ref: SourceRef,
        reason: Option<String>,
        confidence: Option<f64>,
        scope_hint: Option<Scope>,
    ) -> Result<Proposal, MemoryError> {
        if let Some(c) = confidence {
            if !(0.0..=1.0).contains(&c) {
                return Err(MemoryError::InvalidArgument(
                    "confidence must be between 0 and 1".to_string(),
                ));
            }
        }
        let db = self.db.clone();
        tokio::task::block_in_place(move || {
            let conn = lock(&db)?;
            let id = uuid::Uuid::new_v4().simple().to_string();
            let now = Utc::now();
            conn.execute(
                "INSERT INTO proposals (id, payload_key, payload_value, payload_tags, ttl_seconds,
                    status, reason, confidence, scope_hint,
                    source_ref_kind, source_ref_ref_id, source_ref_excerpt, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    id,
                    payload.key,
                    serde_json::to_string(&payload.value)?,
                    serde_json::to_string(&payload.tags)?,
                    payload.ttl_seconds,
                    reason,
                    confidence,
                    scope_hint.map(|s| s.as_str()),
                    source_ref.kind,
                    source_ref.ref_id,
                    source_ref.excerpt,
                    now.to_rfc3339(),
                    now.to_rfc3339(),
                ],
            )
            .map_err(storage)?;
            log_event(
                &conn,
                AuditEventType::ProposalCreated,
                &AuditActor::system(),
                &AuditTarget {
                    target_type: "proposal".to_string(),
                    id: id.clone(),
                },
                None,
                None,
            )
            .map_err(storage)?;
            get_proposal_locked(&conn, &id)?.ok_or_else(|| {
                MemoryError::Storage("proposal vanished after insert".to_string())
            })
        })
    }

    pub async fn get_proposal(&self, proposal_id: &str) -> Result<Option<Proposal>, MemoryError> {
        let db = self.db.clone();
        let proposal_id = proposal_id.to_string();
        tokio::task::block_in_place(move || {
            let conn = lock(&db)?;
            get_proposal_locked(&conn, &proposal_id)
        })
    }

    pub async fn list_proposals(
        &self,
        status: Option<ProposalStatus>,
        scope_hint: Option<Scope>,
    ) -> Result<Vec<Proposal>, MemoryError> {
        let db = self.db.clone();
        tokio::task::block_in_place(move || {
            let conn = lock(&db)?;
            let mut query = "SELECT * FROM proposals WHERE 1=1".to_string();
            let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
            if let Some(s) = status {
                query.push_str(" AND status = ?");
                args.push(Box::new(s.as_str().to_string()));
            }
            if let Some(s) = scope_hint {
                query.push_str(" AND scope_hint = ?");
                args.push(Box::new(s.as_str().to_string()));
            }
            query.push_str(" ORDER BY created_at DESC");
            let mut stmt = conn.prepare(&query).map_err(storage)?;
            let params: Vec<&dyn rusqlite::ToSql> = args.iter().map(|b| b.as_ref()).collect();
            let rows = stmt
                .query_map(params.as_slice(), row_to_proposal)
                .map_err(storage)?;
            rows.collect::<rusqlite::Result<_>>().map_err(storage)
        })
    }

    /// Accept a pending proposal, producing or updating a fact.
    pub async fn accept_proposal(
        &self,
        proposal_id: &str,
        strategy: Option<ConflictStrategy>,
        scope: Option<Scope>,
        project_id: Option<String>,
        session_id: Option<String>,
        actor: Option<AuditActor>,
    ) -> Result<Option<(Proposal, Fact)>, MemoryError> {
        let db = self.db.clone();
        let proposal_id = proposal_id.to_string();
        tokio::task::block_in_place(move || {
            let conn = lock(&db)?;
            let Some(proposal) = get_proposal_locked(&conn, &proposal_id)? else {
                return Ok(None);
            };
            if proposal.status != ProposalStatus::Pending {
                return Ok(None);
            }

            let final_scope = scope.or(proposal.scope_hint).unwrap_or(Scope::Global);
            if final_scope == Scope::Project && project_id.is_none() {
                return Err(MemoryError::InvalidArgument(
                    "project_id is required when scope=project".to_string(),
                ));
            }
            if final_scope == Scope::Session && session_id.is_none() {
                return Err(MemoryError::InvalidArgument(
                    "session_id is required when scope=session".to_string(),
                ));
            }

            let strategy = match strategy {
                Some(s) => s,
                None => key_policy(&conn, &proposal.payload.key)?,
            };
            debug!(key = %proposal.payload.key, strategy = strategy.as_str(), "accepting proposal");

            let existing = detect_conflict(
                &conn,
                &proposal.payload.key,
                final_scope,
                project_id.as_deref(),
                session_id.as_deref(),
            )?;

            let fact = match (strategy, existing) {
                (ConflictStrategy::OverwriteLatest, Some(existing)) => {
                    update_fact_in_place(&conn, &existing, &proposal)?
                }
                _ => create_fact(
                    &conn,
                    &proposal,
                    final_scope,
                    project_id.as_deref(),
                    session_id.as_deref(),
                )?,
            };

            let now = Utc::now();
            conn.execute(
                "UPDATE proposals SET status = 'accepted', updated_at = ?1 WHERE id = ?2",
                params![now.to_rfc3339(), proposal_id],
            )
            .map_err(storage)?;
            log_event(
                &conn,
                AuditEventType::ProposalAccepted,
                &actor.unwrap_or_else(AuditActor::system),
                &AuditTarget {
                    target_type: "proposal".to_string(),
                    id: proposal_id.clone(),
                },
                None,
                None,
            )
            .map_err(storage)?;

            let proposal = get_proposal_locked(&conn, &proposal_id)?
                .ok_or_else(|| MemoryError::Storage("proposal vanished".to_string()))?;
            Ok(Some((proposal, fact)))
        })
    }

    pub async fn reject_proposal(
        &self,
        proposal_id: &str,
        actor: Option<AuditActor>,
    ) -> Result<Option<Proposal>, MemoryError> {
        self.transition_proposal(proposal_id, ProposalStatus::Rejected, actor)
            .await
    }

    pub async fn expire_proposal(
        &self,
        proposal_id: &str,
        actor: Option<AuditActor>,
    ) -> Result<Option<Proposal>, MemoryError> {
        self.transition_proposal(proposal_id, ProposalStatus::Expired, actor)
            .await
    }

    async fn transition_proposal(
        &self,
        proposal_id: &str,
        to: ProposalStatus,
        actor: Option<AuditActor>,
    ) -> Result<Option<Proposal>, MemoryError> {
        let db = self.db.clone();
        let proposal_id = proposal_id.to_string();
        tokio::task::block_in_place(move || {
            let conn = lock(&db)?;
            let Some(proposal) = get_proposal_locked(&conn, &proposal_id)? else {
                return Ok(None);
            };
            if proposal.status != ProposalStatus::Pending {
                return Ok(None);
            }
            conn.execute(
                "UPDATE proposals SET status = ?1, updated_at = ?2 WHERE id = ?3",
                params![to.as_str(), Utc::now().to_rfc3339(), proposal_id],
            )
            .map_err(storage)?;
            let event = match to {
                ProposalStatus::Rejected => AuditEventType::ProposalRejected,
                ProposalStatus::Expired => AuditEventType::ProposalExpired,
                _ => AuditEventType::ProposalAccepted,
            };
            log_event(
                &conn,
                event,
                &actor.unwrap_or_else(AuditActor::system),
                &AuditTarget {
                    target_type: "proposal".to_string(),
                    id: proposal_id.clone(),
                },
                None,
                None,
            )
            .map_err(storage)?;
            get_proposal_locked(&conn, &proposal_id)
        })
    }

    /// TTL sweep: expire pending proposals whose `ttl_seconds` has elapsed.
    /// Returns the expired ids.
    pub async fn check_expired_proposals(&self) -> Result<Vec<String>, MemoryError> {
        let candidates: Vec<(String, DateTime<Utc>, i64)> = {
            let db = self.db.clone();
            tokio::task::block_in_place(move || {
                let conn = lock(&db)?;
                let mut stmt = conn
                    .prepare(
                        "SELECT id, created_at, ttl_seconds FROM proposals
                         WHERE status = 'pending' AND ttl_seconds IS NOT NULL",
                    )
                    .map_err(storage)?;
                let rows = stmt
                    .query_map([], |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, i64>(2)?,
                        ))
                    })
                    .map_err(storage)?;
                let mut out = Vec::new();
                for row in rows {
                    let (id, created, ttl) = row.map_err(storage)?;
                    let created = created
                        .parse::<DateTime<Utc>>()
                        .unwrap_or_else(|_| Utc::now());
                    out.push((id, created, ttl));
                }
                Ok::<_, MemoryError>(out)
            })?
        };

        let now = Utc::now();
        let mut expired = Vec::new();
        for (id, created_at, ttl_seconds) in candidates {
            if now >= created_at + chrono::Duration::seconds(ttl_seconds) {
                if self.expire_proposal(&id, None).await?.is_some() {
                    expired.push(id);
                }
            }
        }
        Ok(expired)
    }

    pub async fn get_fact(&self, fact_id: &str) -> Result<Option<Fact>, MemoryError> {
        let db = self.db.clone();
        let fact_id = fact_id.to_string();
        tokio::task::block_in_place(move || {
            let conn = lock(&db)?;
            get_fact_locked(&conn, &fact_id)
        })
    }

    /// The active fact for a key under the given scope and scoping ids.
    pub async fn get_fact_by_key(
        &self,
        key: &str,
        scope: Scope,
        project_id: Option<&str>,
        session_id: Option<&str>,
    ) -> Result<Option<Fact>, MemoryError> {
        let db = self.db.clone();
        let key = key.to_string();
        let project_id = project_id.map(str::to_string);
        let session_id = session_id.map(str::to_string);
        tokio::task::block_in_place(move || {
            let conn = lock(&db)?;
            detect_conflict(&conn, &key, scope, project_id.as_deref(), session_id.as_deref())
        })
    }

    pub async fn list_facts(
        &self,
        scope: Option<Scope>,
        project_id: Option<&str>,
        session_id: Option<&str>,
        status: Option<FactStatus>,
    ) -> Result<Vec<Fact>, MemoryError> {
        let db = self.db.clone();
        let project_id = project_id.map(str::to_string);
        let session_id = session_id.map(str::to_string);
        tokio::task::block_in_place(move || {
            let conn = lock(&db)?;
            let mut query = "SELECT * FROM facts WHERE 1=1".to_string();
            let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
            if let Some(s) = scope {
                query.push_str(" AND scope = ?");
                args.push(Box::new(s.as_str().to_string()));
            }
            if let Some(p) = project_id {
                query.push_str(" AND project_id = ?");
                args.push(Box::new(p));
            }
            if let Some(s) = session_id {
                query.push_str(" AND session_id = ?");
                args.push(Box::new(s));
            }
            if let Some(s) = status {
                query.push_str(" AND status = ?");
                args.push(Box::new(s.as_str().to_string()));
            }
            query.push_str(" ORDER BY created_at DESC");
            let mut stmt = conn.prepare(&query).map_err(storage)?;
            let params: Vec<&dyn rusqlite::ToSql> = args.iter().map(|b| b.as_ref()).collect();
            let rows = stmt
                .query_map(params.as_slice(), row_to_fact)
                .map_err(storage)?;
            rows.collect::<rusqlite::Result<_>>().map_err(storage)
        })
    }

    pub async fn revoke_fact(
        &self,
        fact_id: &str,
        actor: Option<AuditActor>,
    ) -> Result<Option<Fact>, MemoryError> {
        self.transition_fact(
            fact_id,
            &[FactStatus::Active],
            FactStatus::Revoked,
            AuditEventType::FactRevoked,
            actor,
        )
        .await
    }

    pub async fn archive_fact(
        &self,
        fact_id: &str,
        actor: Option<AuditActor>,
    ) -> Result<Option<Fact>, MemoryError> {
        self.transition_fact(
            fact_id,
            &[FactStatus::Active],
            FactStatus::Archived,
            AuditEventType::FactArchived,
            actor,
        )
        .await
    }

    pub async fn reactivate_fact(
        &self,
        fact_id: &str,
        actor: Option<AuditActor>,
    ) -> Result<Option<Fact>, MemoryError> {
        self.transition_fact(
            fact_id,
            &[FactStatus::Revoked, FactStatus::Archived],
            FactStatus::Active,
            AuditEventType::FactReactivated,
            actor,
        )
        .await
    }

    async fn transition_fact(
        &self,
        fact_id: &str,
        from: &[FactStatus],
        to: FactStatus,
        event: AuditEventType,
        actor: Option<AuditActor>,
    ) -> Result<Option<Fact>, MemoryError> {
        let db = self.db.clone();
        let fact_id = fact_id.to_string();
        let from = from.to_vec();
        tokio::task::block_in_place(move || {
            let conn = lock(&db)?;
            let Some(fact) = get_fact_locked(&conn, &fact_id)? else {
                return Ok(None);
            };
            if !from.contains(&fact.status) {
                return Ok(None);
            }
            conn.execute(
                "UPDATE facts SET status = ?1, updated_at = ?2 WHERE id = ?3",
                params![to.as_str(), Utc::now().to_rfc3339(), fact_id],
            )
            .map_err(storage)?;
            log_event(
                &conn,
                event,
                &actor.unwrap_or_else(AuditActor::system),
                &AuditTarget {
                    target_type: "fact".to_string(),
                    id: fact_id.clone(),
                },
                None,
                None,
            )
            .map_err(storage)?;
            get_fact_locked(&conn, &fact_id)
        })
    }

    pub async fn list_audit_events(
        &self,
        target_type: Option<&str>,
        target_id: Option<&str>,
        event_type: Option<&str>,
        limit: usize,
    ) -> Result<Vec<AuditEvent>, MemoryError> {
        let db = self.db.clone();
        let target_type = target_type.map(str::to_string);
        let target_id = target_id.map(str::to_string);
        let event_type = event_type.map(str::to_string);
        tokio::task::block_in_place(move || {
            let conn = lock(&db)?;
            query_events(
                &conn,
                target_type.as_deref(),
                target_id.as_deref(),
                event_type.as_deref(),
                limit,
            )
            .map_err(storage)
        })
    }

    /// Register an explicit conflict strategy for a key.
    pub async fn set_key_policy(
        &self,
        key: &str,
        strategy: ConflictStrategy,
    ) -> Result<(), MemoryError> {
        let db = self.db.clone();
        let key = key.to_string();
        tokio::task::block_in_place(move || {
            let conn = lock(&db)?;
            conn.execute(
                "INSERT OR REPLACE INTO key_policies (key, strategy) VALUES (?1, ?2)",
                params![key, strategy.as_str()],
            )
            .map_err(storage)?;
            Ok(())
        })
    }
}

fn lock(db: &Arc<Mutex<Connection>>) -> Result<MutexGuard<'_, Connection>, MemoryError> {
    db.lock()
        .map_err(|_| MemoryError::Storage("lock poisoned".to_string()))
}

fn storage(e: rusqlite::Error) -> MemoryError {
    MemoryError::Storage(e.to_string())
}

/// Strategy for a key: explicit policy row, else built-in defaults.
fn key_policy(conn: &Connection, key: &str) -> Result<ConflictStrategy, MemoryError> {
    let explicit: Option<String> = conn
        .query_row(
            "SELECT strategy FROM key_policies WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .ok();
    if let Some(strategy) = explicit.and_then(|s| ConflictStrategy::parse(&s)) {
        return Ok(strategy);
    }

    if SINGLE_VALUED_KEYS.contains(&key) || (key.starts_with("project_") && key.ends_with("_goal"))
    {
        return Ok(ConflictStrategy::OverwriteLatest);
    }
    if MULTI_VALUED_KEYS.contains(&key) || key.ends_with("[]") || key.ends_with("_list") {
        return Ok(ConflictStrategy::KeepBoth);
    }
    Ok(ConflictStrategy::OverwriteLatest)
}

/// The active fact matching (key, scope, scoping ids), when one exists.
fn detect_conflict(
    conn: &Connection,
    key: &str,
    scope: Scope,
    project_id: Option<&str>,
    session_id: Option<&str>,
) -> Result<Option<Fact>, MemoryError> {
    let mut query =
        "SELECT * FROM facts WHERE key = ?1 AND scope = ?2 AND status = 'active'".to_string();
    let mut args: Vec<Box<dyn rusqlite::ToSql>> = vec![
        Box::new(key.to_string()),
        Box::new(scope.as_str().to_string()),
    ];
    match scope {
        Scope::Project => {
            query.push_str(" AND project_id = ?3");
            args.push(Box::new(project_id.unwrap_or_default().to_string()));
        }
        Scope::Session => {
            query.push_str(" AND session_id = ?3");
            args.push(Box::new(session_id.unwrap_or_default().to_string()));
        }
        Scope::Global => {
            query.push_str(" AND project_id IS NULL AND session_id IS NULL");
        }
    }
    let mut stmt = conn.prepare(&query).map_err(storage)?;
    let params: Vec<&dyn rusqlite::ToSql> = args.iter().map(|b| b.as_ref()).collect();
    let mut rows = stmt
        .query_map(params.as_slice(), row_to_fact)
        .map_err(storage)?;
    match rows.next() {
        Some(row) => Ok(Some(row.map_err(storage)?)),
        None => Ok(None),
    }
}

fn create_fact(
    conn: &Connection,
    proposal: &Proposal,
    scope: Scope,
    project_id: Option<&str>,
    session_id: Option<&str>,
) -> Result<Fact, MemoryError> {
    let id = uuid::Uuid::new_v4().simple().to_string();
    let now = Utc::now();
    conn.execute(
        "INSERT INTO facts (id, key, value, status, scope, project_id, session_id,
            source_ref_kind, source_ref_ref_id, source_ref_excerpt, confidence, version,
            created_at, updated_at)
         VALUES (?1, ?2, ?3, 'active', ?4, ?5, ?6, ?7, ?8, ?9, ?10, 1, ?11, ?12)",
        params![
            id,
            proposal.payload.key,
            serde_json::to_string(&proposal.payload.value)?,
            scope.as_str(),
            project_id,
            session_id,
            proposal.source_ref.kind,
            proposal.source_ref.ref_id,
            proposal.source_ref.excerpt,
            proposal.confidence,
            now.to_rfc3339(),
            now.to_rfc3339(),
        ],
    )
    .map_err(storage)?;
    log_event(
        conn,
        AuditEventType::FactCreated,
        &AuditActor::system(),
        &AuditTarget {
            target_type: "fact".to_string(),
            id: id.clone(),
        },
        None,
        None,
    )
    .map_err(storage)?;
    get_fact_locked(conn, &id)?.ok_or_else(|| MemoryError::Storage("fact vanished".to_string()))
}

fn update_fact_in_place(
    conn: &Connection,
    existing: &Fact,
    proposal: &Proposal,
) -> Result<Fact, MemoryError> {
    let now = Utc::now();
    conn.execute(
        "UPDATE facts SET value = ?1, version = version + 1,
            source_ref_kind = ?2, source_ref_ref_id = ?3, source_ref_excerpt = ?4,
            confidence = COALESCE(?5, confidence), updated_at = ?6
         WHERE id = ?7",
        params![
            serde_json::to_string(&proposal.payload.value)?,
            proposal.source_ref.kind,
            proposal.source_ref.ref_id,
            proposal.source_ref.excerpt,
            proposal.confidence,
            now.to_rfc3339(),
            existing.id,
        ],
    )
    .map_err(storage)?;

    let updated = get_fact_locked(conn, &existing.id)?
        .ok_or_else(|| MemoryError::Storage("fact vanished".to_string()))?;
    log_event(
        conn,
        AuditEventType::FactUpdated,
        &AuditActor::system(),
        &AuditTarget {
            target_type: "fact".to_string(),
            id: existing.id.clone(),
        },
        Some(&AuditEventDiff {
            before: serde_json::json!({"value": existing.value, "version": existing.version}),
            after: serde_json::json!({"value": updated.value, "version": updated.version}),
        }),
        None,
    )
    .map_err(storage)?;
    Ok(updated)
}

fn get_proposal_locked(conn: &Connection, id: &str) -> Result<Option<Proposal>, MemoryError> {
    let mut stmt = conn
        .prepare("SELECT * FROM proposals WHERE id = ?1")
        .map_err(storage)?;
    let mut rows = stmt.query_map(params![id], row_to_proposal).map_err(storage)?;
    match rows.next() {
        Some(row) => Ok(Some(row.map_err(storage)?)),
        None => Ok(None),
    }
}

fn get_fact_locked(conn: &Connection, id: &str) -> Result<Option<Fact>, MemoryError> {
    let mut stmt = conn
        .prepare("SELECT * FROM facts WHERE id = ?1")
        .map_err(storage)?;
    let mut rows = stmt.query_map(params![id], row_to_fact).map_err(storage)?;
    match rows.next() {
        Some(row) => Ok(Some(row.map_err(storage)?)),
        None => Ok(None),
    }
}

fn row_to_proposal(row: &Row<'_>) -> rusqlite::Result<Proposal> {
    let value_json: String = row.get("payload_value")?;
    let tags_json: String = row.get("payload_tags")?;
    let status: String = row.get("status")?;
    let scope_hint: Option<String> = row.get("scope_hint")?;
    Ok(Proposal {
        id: row.get("id")?,
        payload: ProposalPayload {
            key: row.get("payload_key")?,
            value: serde_json::from_str(&value_json).unwrap_or(serde_json::Value::Null),
            tags: serde_json::from_str(&tags_json).unwrap_or_default(),
            ttl_seconds: row.get("ttl_seconds")?,
        },
        status: ProposalStatus::parse(&status).unwrap_or(ProposalStatus::Pending),
        reason: row.get("reason")?,
        confidence: row.get("confidence")?,
        scope_hint: scope_hint.as_deref().and_then(Scope::parse),
        source_ref: SourceRef {
            kind: row.get("source_ref_kind")?,
            ref_id: row.get("source_ref_ref_id")?,
            excerpt: row.get("source_ref_excerpt")?,
        },
        created_at: parse_ts(row, "created_at")?,
        updated_at: parse_ts(row, "updated_at")?,
    })
}

fn row_to_fact(row: &Row<'_>) -> rusqlite::Result<Fact> {
    let value_json: String = row.get("value")?;
    let status: String = row.get("status")?;
    let scope: String = row.get("scope")?;
    Ok(Fact {
        id: row.get("id")?,
        key: row.get("key")?,
        value: serde_json::from_str(&value_json).unwrap_or(serde_json::Value::Null),
        status: FactStatus::parse(&status).unwrap_or(FactStatus::Active),
        scope: Scope::parse(&scope).unwrap_or(Scope::Global),
        project_id: row.get("project_id")?,
        session_id: row.get("session_id")?,
        source_ref: SourceRef {
            kind: row.get("source_ref_kind")?,
            ref_id: row.get("source_ref_ref_id")?,
            excerpt: row.get("source_ref_excerpt")?,
        },
        confidence: row.get("confidence")?,
        version: row.get("version")?,
        created_at: parse_ts(row, "created_at")?,
        updated_at: parse_ts(row, "updated_at")?,
    })
}

fn parse_ts(row: &Row<'_>, column: &str) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(column)?;
    Ok(raw.parse::<DateTime<Utc>>().unwrap_or_else(|_| Utc::now()))
}
