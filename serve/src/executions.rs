//! Execution history endpoints: listing, detail, artifacts, replay, lineage,
//! correlation chains, statistics. All reads go through the blocking pool.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::app::AppState;
use crate::error::ApiError;

#[derive(Deserialize)]
pub struct ExecutionListQuery {
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub verdict: Option<String>,
    #[serde(default)]
    pub risk_level: Option<String>,
    #[serde(default)]
    pub correlation_id: Option<String>,
}

#[derive(Deserialize)]
pub struct LineageQuery {
    #[serde(default)]
    pub depth: Option<usize>,
}

#[derive(Deserialize)]
pub struct CorrelationQuery {
    #[serde(default)]
    pub limit: Option<usize>,
}

pub async fn list(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ExecutionListQuery>,
) -> Result<Json<Value>, ApiError> {
    let store = state.execution_store.clone();
    let records = tokio::task::spawn_blocking(move || {
        if let Some(correlation_id) = &query.correlation_id {
            store.list_executions_by_correlation(correlation_id, query.limit.unwrap_or(100))
        } else {
            store.list_executions(
                query.limit.unwrap_or(20),
                query.status.as_deref(),
                query.verdict.as_deref(),
                query.risk_level.as_deref(),
            )
        }
    })
    .await
    .map_err(|e| ApiError::internal(&e.to_string()))??;

    Ok(Json(json!({
        "items": records
            .iter()
            .map(|r| serde_json::to_value(r).unwrap_or(Value::Null))
            .collect::<Vec<_>>(),
    })))
}

pub async fn get_one(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let store = state.execution_store.clone();
    let record = tokio::task::spawn_blocking(move || store.get_execution(&id))
        .await
        .map_err(|e| ApiError::internal(&e.to_string()))??
        .ok_or_else(|| ApiError::not_found("Execution not found"))?;

    let steps = {
        let store = state.execution_store.clone();
        let execution_id = record.execution_id.clone();
        tokio::task::spawn_blocking(move || store.get_execution_steps(&execution_id))
            .await
            .map_err(|e| ApiError::internal(&e.to_string()))??
    };

    Ok(Json(json!({
        "execution": serde_json::to_value(&record).unwrap_or(Value::Null),
        "steps": steps
            .iter()
            .map(|s| serde_json::to_value(s).unwrap_or(Value::Null))
            .collect::<Vec<_>>(),
    })))
}

pub async fn artifacts(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let dir = state
        .artifacts
        .execution_dir(&id)
        .ok_or_else(|| ApiError::not_found("Execution artifacts not found"))?;
    let mut files = Vec::new();
    if let Ok(entries) = std::fs::read_dir(&dir) {
        for entry in entries.filter_map(|e| e.ok()) {
            files.push(entry.file_name().to_string_lossy().to_string());
        }
    }
    files.sort();
    Ok(Json(json!({
        "execution_id": id,
        "artifact_path": dir.display().to_string(),
        "files": files,
    })))
}

pub async fn replay(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let dir = state
        .artifacts
        .execution_dir(&id)
        .ok_or_else(|| ApiError::not_found("Execution artifacts not found"))?;
    let replay = tokio::task::spawn_blocking(move || executor::replay_execution(&dir))
        .await
        .map_err(|e| ApiError::internal(&e.to_string()))??;
    Ok(Json(replay))
}

pub async fn lineage(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<LineageQuery>,
) -> Result<Json<Value>, ApiError> {
    let store = state.execution_store.clone();
    let depth = query.depth.unwrap_or(20);
    let lineage = tokio::task::spawn_blocking(move || store.get_execution_lineage(&id, depth))
        .await
        .map_err(|e| ApiError::internal(&e.to_string()))??;
    if lineage.execution.is_none() {
        return Err(ApiError::not_found("Execution not found"));
    }
    Ok(Json(serde_json::to_value(&lineage).unwrap_or(Value::Null)))
}

pub async fn by_correlation(
    State(state): State<Arc<AppState>>,
    Path(cid): Path<String>,
    Query(query): Query<CorrelationQuery>,
) -> Result<Json<Value>, ApiError> {
    let store = state.execution_store.clone();
    let limit = query.limit.unwrap_or(100);
    let records =
        tokio::task::spawn_blocking(move || store.list_executions_by_correlation(&cid, limit))
            .await
            .map_err(|e| ApiError::internal(&e.to_string()))??;
    Ok(Json(json!({
        "items": records
            .iter()
            .map(|r| serde_json::to_value(r).unwrap_or(Value::Null))
            .collect::<Vec<_>>(),
    })))
}

pub async fn statistics(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    let store = state.execution_store.clone();
    let stats = tokio::task::spawn_blocking(move || store.get_statistics())
        .await
        .map_err(|e| ApiError::internal(&e.to_string()))??;
    Ok(Json(serde_json::to_value(&stats).unwrap_or(Value::Null)))
}
