//! Append-only audit log for memory state changes.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditEventType {
    #[serde(rename = "proposal.created")]
    ProposalCreated,
    #[serde(rename = "proposal.accepted")]
    ProposalAccepted,
    #[serde(rename = "proposal.rejected")]
    ProposalRejected,
    #[serde(rename = "proposal.expired")]
    ProposalExpired,
    #[serde(rename = "fact.created")]
    FactCreated,
    #[serde(rename = "fact.updated")]
    FactUpdated,
    #[serde(rename = "fact.revoked")]
    FactRevoked,
    #[serde(rename = "fact.archived")]
    FactArchived,
    #[serde(rename = "fact.reactivated")]
    FactReactivated,
}

impl AuditEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEventType::ProposalCreated => "proposal.created",
            AuditEventType::ProposalAccepted => "proposal.accepted",
            AuditEventType::ProposalRejected => "proposal.rejected",
            AuditEventType::ProposalExpired => "proposal.expired",
            AuditEventType::FactCreated => "fact.created",
            AuditEventType::FactUpdated => "fact.updated",
            AuditEventType::FactRevoked => "fact.revoked",
            AuditEventType::FactArchived => "fact.archived",
            AuditEventType::FactReactivated => "fact.reactivated",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuditActor {
    pub kind: String,
    pub id: String,
}

impl AuditActor {
    pub fn system() -> Self {
        Self {
            kind: "system".to_string(),
            id: "system".to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuditTarget {
    #[serde(rename = "type")]
    pub target_type: String,
    pub id: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuditEventDiff {
    pub before: serde_json::Value,
    pub after: serde_json::Value,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub actor: AuditActor,
    pub target: AuditTarget,
    pub diff: Option<AuditEventDiff>,
    pub request_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

pub(crate) fn ensure_table(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS audit_events (
            id TEXT PRIMARY KEY,
            event_type TEXT NOT NULL,
            actor_kind TEXT NOT NULL,
            actor_id TEXT NOT NULL,
            target_type TEXT NOT NULL,
            target_id TEXT NOT NULL,
            diff TEXT,
            request_id TEXT,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_audit_events_target ON audit_events(target_type, target_id);
        CREATE INDEX IF NOT EXISTS idx_audit_events_type ON audit_events(event_type);",
    )
}

pub(crate) fn log_event(
    conn: &Connection,
    event_type: AuditEventType,
    actor: &AuditActor,
    target: &AuditTarget,
    diff: Option<&AuditEventDiff>,
    request_id: Option<&str>,
) -> rusqlite::Result<()> {
    let diff_json = diff
        .map(serde_json::to_string)
        .transpose()
        .unwrap_or(None);
    conn.execute(
        "INSERT INTO audit_events (id, event_type, actor_kind, actor_id, target_type, target_id, diff, request_id, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            uuid::Uuid::new_v4().simple().to_string(),
            event_type.as_str(),
            actor.kind,
            actor.id,
            target.target_type,
            target.id,
            diff_json,
            request_id,
            Utc::now().to_rfc3339(),
        ],
    )?;
    Ok(())
}

pub(crate) fn query_events(
    conn: &Connection,
    target_type: Option<&str>,
    target_id: Option<&str>,
    event_type: Option<&str>,
    limit: usize,
) -> rusqlite::Result<Vec<AuditEvent>> {
    let mut query = "SELECT id, event_type, actor_kind, actor_id, target_type, target_id, diff, request_id, created_at
         FROM audit_events WHERE 1=1"
        .to_string();
    let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
    if let Some(t) = target_type {
        query.push_str(" AND target_type = ?");
        args.push(Box::new(t.to_string()));
    }
    if let Some(id) = target_id {
        query.push_str(" AND target_id = ?");
        args.push(Box::new(id.to_string()));
    }
    if let Some(t) = event_type {
        query.push_str(" AND event_type = ?");
        args.push(Box::new(t.to_string()));
    }
    query.push_str(" ORDER BY created_at DESC LIMIT ?");
    args.push(Box::new(limit as i64));

    let mut stmt = conn.prepare(&query)?;
    let params: Vec<&dyn rusqlite::ToSql> = args.iter().map(|b| b.as_ref()).collect();
    let rows = stmt.query_map(params.as_slice(), |row| {
        let diff_json: Option<String> = row.get(6)?;
        let created: String = row.get(8)?;
        Ok(AuditEvent {
            id: row.get(0)?,
            event_type: row.get(1)?,
            actor: AuditActor {
                kind: row.get(2)?,
                id: row.get(3)?,
            },
            target: AuditTarget {
                target_type: row.get(4)?,
                id: row.get(5)?,
            },
            diff: diff_json.and_then(|j| serde_json::from_str(&j).ok()),
            request_id: row.get(7)?,
            created_at: created
                .parse::<DateTime<Utc>>()
                .unwrap_or_else(|_| Utc::now()),
        })
    })?;
    rows.collect()
}
