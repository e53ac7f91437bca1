//! Sandbox endpoints. `POST /sandbox/execs` honors the `Idempotency-Key`
//! header (or the body's `request_id`); docker work runs on the blocking pool.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use sandbox::{
    execute_request, parse_overrides, ExecKind, SandboxExecInput, SandboxExecRequest,
    SandboxExecResponse,
};

use crate::app::AppState;
use crate::error::ApiError;

#[derive(Deserialize)]
pub struct ExecBody {
    pub kind: String,
    pub command: String,
    pub args: Vec<String>,
    #[serde(default = "default_cwd")]
    pub cwd: String,
    #[serde(default)]
    pub env: Option<HashMap<String, String>>,
}

fn default_cwd() -> String {
    "work".to_string()
}

#[derive(Deserialize)]
pub struct InputItem {
    pub path: String,
    pub content: String,
}

#[derive(Deserialize)]
pub struct TaskRefBody {
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub conversation_id: Option<String>,
}

#[derive(Deserialize)]
pub struct SandboxExecBody {
    pub project_id: String,
    #[serde(default)]
    pub skill_id: Option<String>,
    pub exec: ExecBody,
    #[serde(default)]
    pub inputs: Vec<InputItem>,
    #[serde(default)]
    pub manifest_limits: Option<Value>,
    #[serde(default)]
    pub policy_overrides: Option<Value>,
    #[serde(default)]
    pub task_ref: Option<TaskRefBody>,
    /// Body-level idempotency alternative to the header.
    #[serde(default)]
    pub request_id: Option<String>,
}

#[derive(Deserialize)]
pub struct ExecListQuery {
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Deserialize)]
pub struct HealthQuery {
    #[serde(default)]
    pub probe: Option<u8>,
}

fn response_json(resp: &SandboxExecResponse) -> Value {
    json!({
        "exec_id": resp.exec_id,
        "status": resp.status.as_str(),
        "exit_code": resp.exit_code,
        "artifacts_dir": resp.artifacts_dir,
        "stdout_path": resp.stdout_path,
        "stderr_path": resp.stderr_path,
        "stdout_truncated": resp.stdout_truncated,
        "stderr_truncated": resp.stderr_truncated,
        "error_reason": resp.error_reason,
    })
}

pub async fn create_exec(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<SandboxExecBody>,
) -> Result<Json<Value>, ApiError> {
    let idempotency_key = headers
        .get("Idempotency-Key")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or(body.request_id.clone());

    let exec_kind = match body.exec.kind.as_str() {
        "shell" => ExecKind::Shell,
        "python" => ExecKind::Python,
        other => return Err(ApiError::bad_request(&format!("exec.kind must be shell or python, got '{other}'"))),
    };

    let request = SandboxExecRequest {
        project_id: body.project_id,
        skill_id: body.skill_id,
        exec_kind,
        command: body.exec.command,
        args: body.exec.args,
        cwd: body.exec.cwd,
        env: body.exec.env.unwrap_or_default(),
        inputs: body
            .inputs
            .into_iter()
            .map(|i| SandboxExecInput {
                path: i.path,
                content: i.content,
            })
            .collect(),
        manifest_limits: body.manifest_limits.as_ref().map(parse_overrides),
        policy_overrides: body.policy_overrides.as_ref().map(parse_overrides),
        task_id: body.task_ref.as_ref().and_then(|t| t.task_id.clone()),
        conversation_id: body.task_ref.as_ref().and_then(|t| t.conversation_id.clone()),
    };

    let settings = state.sandbox_settings.clone();
    let store = state.clone();
    let response = tokio::task::spawn_blocking(move || {
        execute_request(&settings, &store.sandbox_store, &request, idempotency_key.as_deref())
    })
    .await
    .map_err(|e| ApiError::internal(&e.to_string()))??;

    Ok(Json(response_json(&response)))
}

pub async fn list_execs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ExecListQuery>,
) -> Result<Json<Value>, ApiError> {
    let records = state
        .sandbox_store
        .list(query.task_id.as_deref(), query.limit.unwrap_or(50))?;
    Ok(Json(json!({
        "items": records
            .iter()
            .map(|r| serde_json::to_value(r).unwrap_or(Value::Null))
            .collect::<Vec<_>>(),
    })))
}

pub async fn get_exec(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state
        .sandbox_store
        .get(&id)?
        .map(|r| Json(serde_json::to_value(&r).unwrap_or(Value::Null)))
        .ok_or_else(|| ApiError::not_found("Exec not found"))
}

pub async fn get_artifacts(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let record = state
        .sandbox_store
        .get(&id)?
        .ok_or_else(|| ApiError::not_found("Exec not found"))?;
    let manifest_path = state
        .workspace_root
        .join(&record.artifacts_path)
        .join("manifest.json");
    let manifest: Value = std::fs::read_to_string(&manifest_path)
        .ok()
        .and_then(|c| serde_json::from_str(&c).ok())
        .unwrap_or_else(|| json!({"files": []}));
    Ok(Json(json!({
        "exec_id": record.exec_id,
        "artifacts_dir": record.artifacts_path,
        "manifest": manifest,
    })))
}

pub async fn get_stdout(
    state: State<Arc<AppState>>,
    path: Path<String>,
) -> Result<Json<Value>, ApiError> {
    read_artifact_file(state, path, "stdout.txt").await
}

pub async fn get_stderr(
    state: State<Arc<AppState>>,
    path: Path<String>,
) -> Result<Json<Value>, ApiError> {
    read_artifact_file(state, path, "stderr.txt").await
}

pub async fn get_observation(
    state: State<Arc<AppState>>,
    path: Path<String>,
) -> Result<Json<Value>, ApiError> {
    read_artifact_file(state, path, "observation.json").await
}

async fn read_artifact_file(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    name: &str,
) -> Result<Json<Value>, ApiError> {
    let record = state
        .sandbox_store
        .get(&id)?
        .ok_or_else(|| ApiError::not_found("Exec not found"))?;
    let file_path = state.workspace_root.join(&record.artifacts_path).join(name);
    let content = std::fs::read_to_string(&file_path)
        .map_err(|_| ApiError::not_found(&format!("{name} not found")))?;
    Ok(Json(json!({
        "exec_id": record.exec_id,
        "name": name,
        "content": content,
    })))
}

pub async fn health(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HealthQuery>,
) -> Result<Json<Value>, ApiError> {
    let workspace = state.workspace_root.clone();
    let writable = tokio::task::spawn_blocking(move || {
        let probe = workspace.join(".sandbox_health_probe");
        let ok = std::fs::write(&probe, b"ok").is_ok();
        let _ = std::fs::remove_file(&probe);
        ok
    })
    .await
    .unwrap_or(false);

    let mut out = json!({
        "workspace_root": state.workspace_root.display().to_string(),
        "docker_image": sandbox::SANDBOX_IMAGE,
        "writable_check": writable,
        "platform": std::env::consts::OS,
    });

    if query.probe == Some(1) {
        let probe_result = tokio::task::spawn_blocking(|| {
            std::process::Command::new("docker")
                .args([
                    "run",
                    "--rm",
                    "--entrypoint",
                    "bash",
                    sandbox::SANDBOX_IMAGE,
                    "-lc",
                    "true",
                ])
                .output()
        })
        .await
        .map_err(|e| ApiError::internal(&e.to_string()))?;

        out["probe_run"] = json!(true);
        match probe_result {
            Ok(output) => {
                out["probe_ok"] = json!(output.status.success());
                if !output.status.success() {
                    let err: String = String::from_utf8_lossy(&output.stderr)
                        .chars()
                        .take(500)
                        .collect();
                    out["probe_error"] = json!(err);
                }
            }
            Err(e) => {
                out["probe_ok"] = json!(false);
                out["probe_error"] = json!(e.to_string().chars().take(500).collect::<String>());
            }
        }
    }
    Ok(Json(out))
}
