//! Ties persistence and the runner together: insert RUNNING, run, update the
//! same row to its terminal status. Idempotent on the caller-supplied key.

use chrono::Utc;
use tracing::info;

use crate::errors::SandboxError;
use crate::runner::{run_sandbox_exec, ExecStatus, SandboxExecRequest, SandboxExecResponse};
use crate::runner::{generate_exec_id, SandboxSettings};
use crate::store::{ExecUpdate, SandboxExecRecord, SandboxStore};

/// Execute a sandbox request with persistence. A prior row under the same
/// idempotency key short-circuits without running anything.
pub fn execute_request(
    settings: &SandboxSettings,
    store: &SandboxStore,
    req: &SandboxExecRequest,
    idempotency_key: Option<&str>,
) -> Result<SandboxExecResponse, SandboxError> {
    let idempotency_key = idempotency_key
        .map(str::trim)
        .filter(|s| !s.is_empty());

    if let Some(key) = idempotency_key {
        if let Some(existing) = store.get_by_idempotency_key(key)? {
            info!(exec_id = %existing.exec_id, "idempotency hit, returning existing exec");
            return Ok(record_to_response(&existing));
        }
    }

    let exec_id = generate_exec_id();
    let started_at = Utc::now();
    let artifacts_path = format!("projects/{}/artifacts/{}", req.project_id, exec_id);
    let inserted = store.insert_running(
        &exec_id,
        &req.project_id,
        req.task_id.as_deref(),
        req.conversation_id.as_deref(),
        req.skill_id.as_deref(),
        started_at,
        &artifacts_path,
        idempotency_key,
    )?;
    if !inserted {
        // A concurrent duplicate won the unique index; return its row.
        if let Some(key) = idempotency_key {
            if let Some(existing) = store.get_by_idempotency_key(key)? {
                return Ok(record_to_response(&existing));
            }
        }
        return Err(SandboxError::Runtime(
            "exec record insert conflicted without idempotency key".to_string(),
        ));
    }

    let env_keys: Vec<&String> = req.env.keys().collect();
    let args_json = serde_json::to_string(&req.args).unwrap_or_else(|_| "[]".to_string());
    let env_keys_json = serde_json::to_string(&env_keys).unwrap_or_else(|_| "[]".to_string());

    match run_sandbox_exec(settings, req, Some(exec_id.clone())) {
        Ok(resp) => {
            let ended_at = Utc::now();
            store.update_record(
                &exec_id,
                resp.status,
                ended_at,
                ExecUpdate {
                    image: Some(crate::runner::SANDBOX_IMAGE.to_string()),
                    cmd: Some(req.command.clone()),
                    args_json: Some(args_json),
                    cwd: Some(req.cwd.clone()),
                    env_keys_json: Some(env_keys_json),
                    policy_snapshot: serde_json::to_value(&resp.policy).ok(),
                    exit_code: resp.exit_code,
                    error_reason: resp.error_reason.clone(),
                    duration_ms: Some((ended_at - started_at).num_milliseconds()),
                    stdout_truncated: resp.stdout_truncated,
                    stderr_truncated: resp.stderr_truncated,
                },
            )?;
            Ok(resp)
        }
        Err(e) => {
            let status = match &e {
                SandboxError::PolicyDenied(_) => ExecStatus::PolicyDenied,
                _ => ExecStatus::Failed,
            };
            let ended_at = Utc::now();
            store.update_record(
                &exec_id,
                status,
                ended_at,
                ExecUpdate {
                    cmd: Some(req.command.clone()),
                    args_json: Some(args_json),
                    cwd: Some(req.cwd.clone()),
                    env_keys_json: Some(env_keys_json),
                    error_reason: Some(e.to_reason()),
                    duration_ms: Some((ended_at - started_at).num_milliseconds()),
                    ..Default::default()
                },
            )?;
            Err(e)
        }
    }
}

pub fn record_to_response(record: &SandboxExecRecord) -> SandboxExecResponse {
    SandboxExecResponse {
        exec_id: record.exec_id.clone(),
        status: record.status,
        exit_code: record.exit_code,
        artifacts_dir: record.artifacts_path.clone(),
        stdout_path: "stdout.txt".to_string(),
        stderr_path: "stderr.txt".to_string(),
        stdout_truncated: record.stdout_truncated,
        stderr_truncated: record.stderr_truncated,
        error_reason: record.error_reason.clone(),
        policy: Default::default(),
    }
}
