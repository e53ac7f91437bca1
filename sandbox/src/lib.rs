//! Sandboxed code execution: each exec is one policy-clamped Docker invocation
//! with a persisted record and a content-hashed artifact manifest.

mod errors;
mod policy;
mod runner;
mod service;
mod store;

pub use errors::SandboxError;
pub use policy::{
    merge_manifest_limits, merge_policy_overrides, policy_from_settings, PolicyOverrides,
    SandboxPolicy, SettingsLimits,
};
pub use runner::{
    generate_exec_id, parse_overrides, run_sandbox_exec, validate_exec_kind_command,
    validate_input_path, ExecKind, ExecStatus, SandboxExecInput, SandboxExecRequest,
    SandboxExecResponse, SandboxSettings, SANDBOX_IMAGE,
};
pub use service::{execute_request, record_to_response};
pub use store::{ExecUpdate, SandboxExecRecord, SandboxStore};
