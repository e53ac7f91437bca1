//! Docker-backed execution.
//!
//! Mounts exactly the three host templates (`inputs:ro`, `work:rw`,
//! `artifacts/<exec_id>:rw`), runs the container unprivileged and
//! network-disabled, streams stdout/stderr to files on two threads with
//! truncation, SIGKILLs on wall-clock timeout (plus a defensive
//! `docker rm -f`), and writes `manifest.json`/`meta.json` on completion.

use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::errors::SandboxError;
use crate::policy::{
    merge_manifest_limits, merge_policy_overrides, policy_from_settings, PolicyOverrides,
    SandboxPolicy, SettingsLimits,
};

pub const SANDBOX_IMAGE: &str = "lonelycat-sandbox:py312";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecStatus {
    Running,
    Succeeded,
    Failed,
    Timeout,
    PolicyDenied,
}

impl ExecStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecStatus::Running => "RUNNING",
            ExecStatus::Succeeded => "SUCCEEDED",
            ExecStatus::Failed => "FAILED",
            ExecStatus::Timeout => "TIMEOUT",
            ExecStatus::PolicyDenied => "POLICY_DENIED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "RUNNING" => Some(Self::Running),
            "SUCCEEDED" => Some(Self::Succeeded),
            "FAILED" => Some(Self::Failed),
            "TIMEOUT" => Some(Self::Timeout),
            "POLICY_DENIED" => Some(Self::PolicyDenied),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecKind {
    Shell,
    Python,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SandboxExecInput {
    pub path: String,
    pub content: String,
}

#[derive(Clone, Debug)]
pub struct SandboxExecRequest {
    pub project_id: String,
    pub skill_id: Option<String>,
    pub exec_kind: ExecKind,
    pub command: String,
    pub args: Vec<String>,
    pub cwd: String,
    pub env: HashMap<String, String>,
    pub inputs: Vec<SandboxExecInput>,
    pub manifest_limits: Option<PolicyOverrides>,
    pub policy_overrides: Option<PolicyOverrides>,
    pub task_id: Option<String>,
    pub conversation_id: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct SandboxExecResponse {
    pub exec_id: String,
    pub status: ExecStatus,
    pub exit_code: Option<i32>,
    pub artifacts_dir: String,
    pub stdout_path: String,
    pub stderr_path: String,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    pub error_reason: Option<serde_json::Value>,
    #[serde(skip)]
    pub policy: SandboxPolicy,
}

/// System settings the runner needs: workspace root, limit ceiling, docker CLI.
#[derive(Clone, Debug)]
pub struct SandboxSettings {
    pub workspace_root: PathBuf,
    pub limits: SettingsLimits,
    pub max_concurrent_execs: Option<u64>,
    pub docker_cli_path: Option<String>,
}

impl SandboxSettings {
    pub fn new(workspace_root: &Path) -> Self {
        Self {
            workspace_root: workspace_root.to_path_buf(),
            limits: SettingsLimits::default(),
            max_concurrent_execs: None,
            docker_cli_path: None,
        }
    }
}

pub fn generate_exec_id() -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    format!("e_{}", &hex[..16])
}

/// `kind=shell` requires `bash -lc <script>`; `kind=python` requires
/// `python` with `-c`/`-u` or an inputs-rooted script path.
pub fn validate_exec_kind_command(req: &SandboxExecRequest) -> Result<(), SandboxError> {
    match req.exec_kind {
        ExecKind::Shell => {
            if req.command != "bash" {
                return Err(SandboxError::PolicyDenied(
                    "exec.kind=shell requires command=bash".to_string(),
                ));
            }
            if req.args.len() < 2 || req.args[0] != "-lc" {
                return Err(SandboxError::PolicyDenied(
                    "exec.kind=shell requires args [\"-lc\", <script>]".to_string(),
                ));
            }
        }
        ExecKind::Python => {
            if req.command != "python" {
                return Err(SandboxError::PolicyDenied(
                    "exec.kind=python requires command=python".to_string(),
                ));
            }
            let first = req.args.first().map(String::as_str).unwrap_or("");
            if first != "-c" && first != "-u" && !first.starts_with("/workspace/inputs/") {
                return Err(SandboxError::PolicyDenied(
                    "exec.kind=python requires args [\"-c\", <code>] or [\"/workspace/inputs/...\"]"
                        .to_string(),
                ));
            }
        }
    }
    Ok(())
}

/// Normalize an `inputs[].path`: relative, no `..`, no absolute prefix.
pub fn validate_input_path(path: &str) -> Result<String, SandboxError> {
    let p = path.replace('\\', "/");
    let p = p.trim();
    if p.is_empty() {
        return Err(SandboxError::InvalidArgument(
            "inputs[].path must not be empty".to_string(),
        ));
    }
    if p.starts_with('/') || Path::new(path).is_absolute() {
        return Err(SandboxError::InvalidArgument(format!(
            "inputs[].path path traversal rejected: {path}"
        )));
    }
    let mut parts: Vec<&str> = Vec::new();
    for segment in p.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                return Err(SandboxError::InvalidArgument(format!(
                    "inputs[].path path traversal rejected: {path}"
                )))
            }
            seg => parts.push(seg),
        }
    }
    if parts.is_empty() {
        return Err(SandboxError::InvalidArgument(
            "inputs[].path must not be empty".to_string(),
        ));
    }
    Ok(parts.join("/"))
}

/// One semaphore per process, sized by `max_concurrent_execs`; resized lazily
/// when the limit changes.
static GATE: Lazy<Gate> = Lazy::new(|| Gate::new(4));

struct Gate {
    state: Mutex<GateState>,
    cv: Condvar,
}

struct GateState {
    limit: usize,
    in_use: usize,
}

impl Gate {
    fn new(limit: usize) -> Self {
        Self {
            state: Mutex::new(GateState { limit, in_use: 0 }),
            cv: Condvar::new(),
        }
    }

    fn acquire(&self, limit: usize) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.limit = limit.max(1);
        while state.in_use >= state.limit {
            state = self.cv.wait(state).unwrap_or_else(|e| e.into_inner());
        }
        state.in_use += 1;
    }

    fn release(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.in_use = state.in_use.saturating_sub(1);
        self.cv.notify_one();
    }
}

/// Run one sandbox exec end to end. `exec_id` is supplied by the caller when a
/// RUNNING record was already inserted.
pub fn run_sandbox_exec(
    settings: &SandboxSettings,
    req: &SandboxExecRequest,
    exec_id: Option<String>,
) -> Result<SandboxExecResponse, SandboxError> {
    let mut policy = policy_from_settings(&settings.limits, settings.max_concurrent_execs);
    if let Some(limits) = &req.manifest_limits {
        policy = merge_manifest_limits(&policy, limits);
    }
    if let Some(overrides) = &req.policy_overrides {
        policy = merge_policy_overrides(&policy, overrides);
    }
    validate_exec_kind_command(req)?;
    for input in &req.inputs {
        validate_input_path(&input.path)?;
    }

    let exec_id = exec_id.unwrap_or_else(generate_exec_id);
    let project_dir = settings.workspace_root.join("projects").join(&req.project_id);
    let inputs_host = project_dir.join("inputs");
    let work_host = project_dir.join("work");
    let artifacts_host = project_dir.join("artifacts").join(&exec_id);
    std::fs::create_dir_all(&inputs_host)?;
    std::fs::create_dir_all(&work_host)?;
    std::fs::create_dir_all(&artifacts_host)?;

    for input in &req.inputs {
        let rel = validate_input_path(&input.path)?;
        let out_path = inputs_host.join(&rel);
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&out_path, input.content.as_bytes())?;
    }

    let docker_mounts = vec![
        format!("{}:/workspace/inputs:ro", inputs_host.display()),
        format!("{}:/workspace/work:rw", work_host.display()),
        format!("{}:/workspace/artifacts:rw", artifacts_host.display()),
    ];
    let docker_cmd = settings
        .docker_cli_path
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or("docker")
        .to_string();
    let container_name = format!("lonelycat-sbx-{}", &exec_id[..8.min(exec_id.len())]);

    let mut cmd_args: Vec<String> = vec![
        "run".to_string(),
        "--rm".to_string(),
        format!("--network={}", policy.net_mode),
        "--cap-drop=ALL".to_string(),
        "--security-opt=no-new-privileges".to_string(),
        "--user=1000:1000".to_string(),
        "--workdir=/workspace/work".to_string(),
        format!("--name={container_name}"),
        format!("--memory={}m", policy.memory_mb),
        format!("--cpus={}", policy.cpu_cores),
        format!("--pids-limit={}", policy.pids),
    ];
    for mount in &docker_mounts {
        cmd_args.push("-v".to_string());
        cmd_args.push(mount.clone());
    }
    for (k, v) in &req.env {
        cmd_args.push("-e".to_string());
        cmd_args.push(format!("{k}={v}"));
    }
    cmd_args.push(SANDBOX_IMAGE.to_string());
    cmd_args.push(req.command.clone());
    cmd_args.extend(req.args.iter().cloned());

    let stdout_path = artifacts_host.join("stdout.txt");
    let stderr_path = artifacts_host.join("stderr.txt");
    let timeout = Duration::from_millis(policy.timeout_ms.max(1000));

    GATE.acquire(policy.max_concurrent_execs as usize);
    let stream = run_docker_streaming(
        &docker_cmd,
        &cmd_args,
        timeout,
        &stdout_path,
        &stderr_path,
        policy.max_stdout_bytes,
        policy.max_stderr_bytes,
    );
    GATE.release();
    let stream = stream?;

    let error_reason = if stream.status == ExecStatus::Timeout {
        // The kill may not have reached the docker daemon; force-remove the
        // container so nothing lingers.
        let _ = Command::new(&docker_cmd)
            .args(["rm", "-f", &container_name])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        Some(serde_json::json!({
            "code": "TIMEOUT",
            "message": format!("execution timed out ({}s)", timeout.as_secs()),
        }))
    } else {
        None
    };

    write_manifest(&artifacts_host)?;
    let full_cmd: Vec<String> = std::iter::once(docker_cmd.clone()).chain(cmd_args).collect();
    write_meta(&artifacts_host, &exec_id, req, &policy, &stream, &docker_mounts, &full_cmd)?;

    Ok(SandboxExecResponse {
        exec_id,
        status: stream.status,
        exit_code: stream.exit_code,
        artifacts_dir: format!("projects/{}/artifacts", req.project_id),
        stdout_path: "stdout.txt".to_string(),
        stderr_path: "stderr.txt".to_string(),
        stdout_truncated: stream.stdout_truncated,
        stderr_truncated: stream.stderr_truncated,
        error_reason,
        policy,
    })
}

pub(crate) struct StreamOutcome {
    pub status: ExecStatus,
    pub exit_code: Option<i32>,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
}

#[allow(clippy::too_many_arguments)]
fn run_docker_streaming(
    docker_cmd: &str,
    args: &[String],
    timeout: Duration,
    stdout_path: &Path,
    stderr_path: &Path,
    max_stdout_bytes: u64,
    max_stderr_bytes: u64,
) -> Result<StreamOutcome, SandboxError> {
    debug!(cmd = docker_cmd, "spawning sandbox container");
    let mut child = Command::new(docker_cmd)
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .stdin(Stdio::null())
        .spawn()
        .map_err(|e| SandboxError::Runtime(format!("failed to spawn docker: {e}")))?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let out_path = stdout_path.to_path_buf();
    let err_path = stderr_path.to_path_buf();
    let out_handle =
        std::thread::spawn(move || stream_read_to_file(stdout, &out_path, max_stdout_bytes));
    let err_handle =
        std::thread::spawn(move || stream_read_to_file(stderr, &err_path, max_stderr_bytes));

    let deadline = Instant::now() + timeout;
    let mut timed_out = false;
    let exit_status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break Some(status),
            Ok(None) => {
                if Instant::now() >= deadline {
                    timed_out = true;
                    let _ = child.kill();
                    let _ = child.wait();
                    break None;
                }
                std::thread::sleep(Duration::from_millis(25));
            }
            Err(e) => return Err(SandboxError::Runtime(e.to_string())),
        }
    };

    let (_, stdout_truncated) = out_handle.join().unwrap_or((0, false));
    let (_, stderr_truncated) = err_handle.join().unwrap_or((0, false));

    if timed_out {
        return Ok(StreamOutcome {
            status: ExecStatus::Timeout,
            exit_code: None,
            stdout_truncated,
            stderr_truncated,
        });
    }
    let exit_code = exit_status.and_then(|s| s.code());
    Ok(StreamOutcome {
        status: if exit_code == Some(0) {
            ExecStatus::Succeeded
        } else {
            ExecStatus::Failed
        },
        exit_code,
        stdout_truncated,
        stderr_truncated,
    })
}

/// Read a stream into a file; once `max_bytes` is written, keep draining but
/// stop writing and flag truncation. Returns `(written, truncated)`.
pub(crate) fn stream_read_to_file(
    stream: Option<impl Read>,
    path: &Path,
    max_bytes: u64,
) -> (u64, bool) {
    let Some(mut stream) = stream else {
        return (0, false);
    };
    let Ok(mut file) = std::fs::File::create(path) else {
        return (0, false);
    };
    let mut written: u64 = 0;
    let mut truncated = false;
    let mut buf = [0u8; 4096];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                let chunk = &buf[..n];
                if written < max_bytes {
                    let room = (max_bytes - written) as usize;
                    let to_write = &chunk[..room.min(chunk.len())];
                    if std::io::Write::write_all(&mut file, to_write).is_err() {
                        break;
                    }
                    written += to_write.len() as u64;
                    if chunk.len() > to_write.len() {
                        truncated = true;
                    }
                } else {
                    truncated = true;
                }
            }
            Err(_) => break,
        }
    }
    (written, truncated)
}

/// `manifest.json`: `{path, size, hash}` per file directly under the artifacts
/// directory, paths relative to it.
fn write_manifest(artifacts_dir: &Path) -> Result<(), SandboxError> {
    let mut entries = Vec::new();
    for entry in walkdir::WalkDir::new(artifacts_dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }
        let data = std::fs::read(entry.path())?;
        let mut hasher = Sha256::new();
        hasher.update(&data);
        entries.push(serde_json::json!({
            "path": entry.file_name().to_string_lossy(),
            "size": data.len(),
            "hash": format!("{:x}", hasher.finalize()),
        }));
    }
    std::fs::write(
        artifacts_dir.join("manifest.json"),
        serde_json::to_string_pretty(&serde_json::json!({"files": entries}))
            .map_err(|e| SandboxError::Runtime(e.to_string()))?,
    )?;
    Ok(())
}

fn write_meta(
    artifacts_dir: &Path,
    exec_id: &str,
    req: &SandboxExecRequest,
    policy: &SandboxPolicy,
    stream: &StreamOutcome,
    docker_mounts: &[String],
    docker_args: &[String],
) -> Result<(), SandboxError> {
    let meta = serde_json::json!({
        "exec_id": exec_id,
        "project_id": req.project_id,
        "status": stream.status.as_str(),
        "exit_code": stream.exit_code,
        "policy_snapshot": {
            "timeout_ms": policy.timeout_ms,
            "max_stdout_bytes": policy.max_stdout_bytes,
            "max_stderr_bytes": policy.max_stderr_bytes,
        },
        "stdout_truncated": stream.stdout_truncated,
        "stderr_truncated": stream.stderr_truncated,
        "docker_mounts": docker_mounts,
        "docker_image": SANDBOX_IMAGE,
        "docker_args": docker_args,
    });
    std::fs::write(
        artifacts_dir.join("meta.json"),
        serde_json::to_string_pretty(&meta).map_err(|e| SandboxError::Runtime(e.to_string()))?,
    )?;
    Ok(())
}

/// Best-effort warning for unrecognized override keys; recognized fields are
/// deserialized into [`PolicyOverrides`].
pub fn parse_overrides(value: &serde_json::Value) -> PolicyOverrides {
    const KNOWN: &[&str] = &[
        "timeout_ms",
        "memory_mb",
        "cpu_cores",
        "pids",
        "max_stdout_bytes",
        "max_stderr_bytes",
        "max_artifacts_bytes_total",
    ];
    if let Some(map) = value.as_object() {
        for key in map.keys() {
            if !KNOWN.contains(&key.as_str()) {
                warn!(key = %key, "ignoring unrecognized policy override field");
            }
        }
    }
    serde_json::from_value(sanitize_overrides(value)).unwrap_or_default()
}

fn sanitize_overrides(value: &serde_json::Value) -> serde_json::Value {
    match value.as_object() {
        Some(map) => serde_json::Value::Object(
            map.iter()
                .filter(|(_, v)| v.is_number())
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        ),
        None => serde_json::json!({}),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shell_request() -> SandboxExecRequest {
        SandboxExecRequest {
            project_id: "p1".to_string(),
            skill_id: None,
            exec_kind: ExecKind::Shell,
            command: "bash".to_string(),
            args: vec!["-lc".to_string(), "echo hi".to_string()],
            cwd: "work".to_string(),
            env: HashMap::new(),
            inputs: vec![],
            manifest_limits: None,
            policy_overrides: None,
            task_id: None,
            conversation_id: None,
        }
    }

    #[test]
    fn shell_kind_validation() {
        assert!(validate_exec_kind_command(&shell_request()).is_ok());

        let mut bad_cmd = shell_request();
        bad_cmd.command = "sh".to_string();
        assert!(matches!(
            validate_exec_kind_command(&bad_cmd),
            Err(SandboxError::PolicyDenied(_))
        ));

        let mut bad_args = shell_request();
        bad_args.args = vec!["-c".to_string(), "echo".to_string()];
        assert!(validate_exec_kind_command(&bad_args).is_err());
    }

    #[test]
    fn python_kind_validation() {
        let mut req = shell_request();
        req.exec_kind = ExecKind::Python;
        req.command = "python".to_string();
        req.args = vec!["-c".to_string(), "print(1)".to_string()];
        assert!(validate_exec_kind_command(&req).is_ok());

        req.args = vec!["/workspace/inputs/main.py".to_string()];
        assert!(validate_exec_kind_command(&req).is_ok());

        req.args = vec!["/etc/passwd".to_string()];
        assert!(validate_exec_kind_command(&req).is_err());
    }

    #[test]
    fn input_paths_are_normalized_and_guarded() {
        assert_eq!(validate_input_path("a/b.txt").unwrap(), "a/b.txt");
        assert_eq!(validate_input_path("./a//b.txt").unwrap(), "a/b.txt");
        assert_eq!(validate_input_path("a\\b.txt").unwrap(), "a/b.txt");
        assert!(validate_input_path("../escape").is_err());
        assert!(validate_input_path("a/../../b").is_err());
        assert!(validate_input_path("/abs").is_err());
        assert!(validate_input_path("  ").is_err());
    }

    #[test]
    fn stream_truncates_at_exact_limit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.txt");
        // One byte beyond the cap.
        let data = vec![b'x'; 11];
        let (written, truncated) =
            stream_read_to_file(Some(std::io::Cursor::new(data)), &path, 10);
        assert_eq!(written, 10);
        assert!(truncated);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 10);
    }

    #[test]
    fn stream_below_limit_is_not_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.txt");
        let (written, truncated) =
            stream_read_to_file(Some(std::io::Cursor::new(vec![b'x'; 5])), &path, 10);
        assert_eq!(written, 5);
        assert!(!truncated);
    }

    #[test]
    fn manifest_lists_files_with_hashes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("stdout.txt"), "hello").unwrap();
        write_manifest(dir.path()).unwrap();

        let manifest: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(dir.path().join("manifest.json")).unwrap())
                .unwrap();
        let files = manifest["files"].as_array().unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0]["path"], "stdout.txt");
        assert_eq!(files[0]["size"], 5);
        assert_eq!(files[0]["hash"].as_str().unwrap().len(), 64);
    }

    #[test]
    fn parse_overrides_ignores_unknown_and_non_numeric() {
        let overrides = parse_overrides(&serde_json::json!({
            "timeout_ms": 5000,
            "bogus_field": true,
            "memory_mb": "not-a-number",
        }));
        assert_eq!(overrides.timeout_ms, Some(5000));
        assert_eq!(overrides.memory_mb, None);
    }

    #[test]
    fn exec_id_shape() {
        let id = generate_exec_id();
        assert!(id.starts_with("e_"));
        assert_eq!(id.len(), 18);
    }
}
