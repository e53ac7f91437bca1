//! Memory endpoints: proposals, facts, audit, TTL maintenance.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use memory::{ConflictStrategy, Fact, FactStatus, Proposal, ProposalPayload, ProposalStatus, Scope, SourceRef};

use crate::app::AppState;
use crate::error::ApiError;

#[derive(Deserialize)]
pub struct ProposalCreateBody {
    pub payload: PayloadBody,
    pub source_ref: SourceRefBody,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub scope_hint: Option<String>,
}

#[derive(Deserialize)]
pub struct PayloadBody {
    pub key: String,
    pub value: Value,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub ttl_seconds: Option<i64>,
}

#[derive(Deserialize)]
pub struct SourceRefBody {
    pub kind: String,
    pub ref_id: String,
    #[serde(default)]
    pub excerpt: Option<String>,
}

#[derive(Deserialize)]
pub struct AcceptBody {
    #[serde(default)]
    pub strategy: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Deserialize)]
pub struct ProposalListQuery {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub scope_hint: Option<String>,
}

#[derive(Deserialize)]
pub struct FactListQuery {
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Deserialize)]
pub struct AuditQuery {
    #[serde(default)]
    pub target_type: Option<String>,
    #[serde(default)]
    pub target_id: Option<String>,
    #[serde(default)]
    pub event_type: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

fn parse_scope(raw: &Option<String>) -> Result<Option<Scope>, ApiError> {
    match raw {
        None => Ok(None),
        Some(s) => Scope::parse(s)
            .map(Some)
            .ok_or_else(|| ApiError::bad_request(&format!("invalid scope: {s}"))),
    }
}

fn serialize_proposal(p: &Proposal) -> Value {
    serde_json::to_value(p).unwrap_or(Value::Null)
}

fn serialize_fact(f: &Fact) -> Value {
    serde_json::to_value(f).unwrap_or(Value::Null)
}

pub async fn create_proposal(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ProposalCreateBody>,
) -> Result<Json<Value>, ApiError> {
    let scope_hint = parse_scope(&body.scope_hint)?;
    let proposal = state
        .memory
        .create_proposal(
            ProposalPayload {
                key: body.payload.key,
                value: body.payload.value,
                tags: body.payload.tags,
                ttl_seconds: body.payload.ttl_seconds,
            },
            SourceRef {
                kind: body.source_ref.kind,
                ref_id: body.source_ref.ref_id,
                excerpt: body.source_ref.excerpt,
            },
            body.reason,
            body.confidence,
            scope_hint,
        )
        .await?;
    Ok(Json(serialize_proposal(&proposal)))
}

pub async fn list_proposals(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ProposalListQuery>,
) -> Result<Json<Value>, ApiError> {
    let status = match &query.status {
        None => None,
        Some(s) => Some(
            ProposalStatus::parse(s)
                .ok_or_else(|| ApiError::bad_request(&format!("invalid status: {s}")))?,
        ),
    };
    let scope_hint = parse_scope(&query.scope_hint)?;
    let proposals = state.memory.list_proposals(status, scope_hint).await?;
    Ok(Json(json!({
        "items": proposals.iter().map(serialize_proposal).collect::<Vec<_>>(),
    })))
}

pub async fn accept_proposal(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<AcceptBody>,
) -> Result<Json<Value>, ApiError> {
    let strategy = match &body.strategy {
        None => None,
        Some(s) => Some(
            ConflictStrategy::parse(s)
                .ok_or_else(|| ApiError::bad_request(&format!("invalid strategy: {s}")))?,
        ),
    };
    let scope = parse_scope(&body.scope)?;
    let result = state
        .memory
        .accept_proposal(&id, strategy, scope, body.project_id, body.session_id, None)
        .await?;
    match result {
        Some((proposal, fact)) => Ok(Json(json!({
            "proposal": serialize_proposal(&proposal),
            "fact": serialize_fact(&fact),
        }))),
        None => Err(ApiError::not_found("Proposal not found or not pending")),
    }
}

pub async fn reject_proposal(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state
        .memory
        .reject_proposal(&id, None)
        .await?
        .map(|p| Json(serialize_proposal(&p)))
        .ok_or_else(|| ApiError::not_found("Proposal not found or not pending"))
}

pub async fn expire_proposal(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state
        .memory
        .expire_proposal(&id, None)
        .await?
        .map(|p| Json(serialize_proposal(&p)))
        .ok_or_else(|| ApiError::not_found("Proposal not found or not pending"))
}

pub async fn list_facts(
    State(state): State<Arc<AppState>>,
    Query(query): Query<FactListQuery>,
) -> Result<Json<Value>, ApiError> {
    let scope = parse_scope(&query.scope)?;
    let status = match &query.status {
        None => None,
        Some(s) => Some(
            FactStatus::parse(s)
                .ok_or_else(|| ApiError::bad_request(&format!("invalid status: {s}")))?,
        ),
    };
    let facts = state
        .memory
        .list_facts(scope, query.project_id.as_deref(), query.session_id.as_deref(), status)
        .await?;
    Ok(Json(json!({
        "items": facts.iter().map(serialize_fact).collect::<Vec<_>>(),
    })))
}

pub async fn get_fact(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state
        .memory
        .get_fact(&id)
        .await?
        .map(|f| Json(serialize_fact(&f)))
        .ok_or_else(|| ApiError::not_found("Fact not found"))
}

pub async fn get_fact_by_key(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
    Query(query): Query<FactListQuery>,
) -> Result<Json<Value>, ApiError> {
    let scope = parse_scope(&query.scope)?.unwrap_or(Scope::Global);
    state
        .memory
        .get_fact_by_key(
            &key,
            scope,
            query.project_id.as_deref(),
            query.session_id.as_deref(),
        )
        .await?
        .map(|f| Json(serialize_fact(&f)))
        .ok_or_else(|| ApiError::not_found("Fact not found"))
}

pub async fn revoke_fact(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state
        .memory
        .revoke_fact(&id, None)
        .await?
        .map(|f| Json(serialize_fact(&f)))
        .ok_or_else(|| ApiError::not_found("Fact not found or not active"))
}

pub async fn archive_fact(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state
        .memory
        .archive_fact(&id, None)
        .await?
        .map(|f| Json(serialize_fact(&f)))
        .ok_or_else(|| ApiError::not_found("Fact not found or not active"))
}

pub async fn reactivate_fact(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state
        .memory
        .reactivate_fact(&id, None)
        .await?
        .map(|f| Json(serialize_fact(&f)))
        .ok_or_else(|| ApiError::not_found("Fact not found or not revoked/archived"))
}

pub async fn list_audit(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AuditQuery>,
) -> Result<Json<Value>, ApiError> {
    let events = state
        .memory
        .list_audit_events(
            query.target_type.as_deref(),
            query.target_id.as_deref(),
            query.event_type.as_deref(),
            query.limit.unwrap_or(100),
        )
        .await?;
    Ok(Json(json!({
        "items": events
            .iter()
            .map(|e| serde_json::to_value(e).unwrap_or(Value::Null))
            .collect::<Vec<_>>(),
    })))
}

pub async fn check_expired(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    let expired = state.memory.check_expired_proposals().await?;
    Ok(Json(json!({"expired": expired})))
}
