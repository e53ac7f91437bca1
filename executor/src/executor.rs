//! The execution engine.
//!
//! `execute(plan, changeset, decision)` runs validate -> checksum -> backup ->
//! apply -> verify -> health with automatic rollback on any fatal step, all
//! inside one acquisition of the repository lock and guarded by the
//! idempotency cache. Every step is logged to the artifact directory and timed
//! in the execution store.

use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, warn};

use governance::{ChangePlan, ChangeSet, GovernanceDecision, Verdict};

use crate::applier::FileApplier;
use crate::artifacts::ArtifactManager;
use crate::health::HealthChecker;
use crate::idempotency::{IdempotencyManager, IdempotencyRecord};
use crate::lock::ExecutionLock;
use crate::rollback::RollbackHandler;
use crate::store::{ExecutionStore, StartGraphFields};
use crate::verifier::VerificationRunner;
use crate::ExecutorError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Validating,
    BackingUp,
    Applying,
    Verifying,
    HealthChecking,
    Completed,
    Failed,
    RolledBack,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Validating => "validating",
            ExecutionStatus::BackingUp => "backing_up",
            ExecutionStatus::Applying => "applying",
            ExecutionStatus::Verifying => "verifying",
            ExecutionStatus::HealthChecking => "health_checking",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::RolledBack => "rolled_back",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Manual,
    Agent,
    Retry,
    Repair,
    Child,
    Scheduled,
}

impl TriggerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerKind::Manual => "manual",
            TriggerKind::Agent => "agent",
            TriggerKind::Retry => "retry",
            TriggerKind::Repair => "repair",
            TriggerKind::Child => "child",
            TriggerKind::Scheduled => "scheduled",
        }
    }
}

/// Graph metadata for the execution being started.
#[derive(Clone, Debug)]
pub struct TriggerContext {
    pub correlation_id: Option<String>,
    pub parent_execution_id: Option<String>,
    pub trigger_kind: TriggerKind,
    pub run_id: Option<String>,
    pub is_repair: bool,
    pub repair_for_execution_id: Option<String>,
}

impl Default for TriggerContext {
    fn default() -> Self {
        Self {
            correlation_id: None,
            parent_execution_id: None,
            trigger_kind: TriggerKind::Manual,
            run_id: None,
            is_repair: false,
            repair_for_execution_id: None,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct ExecutionResult {
    pub execution_id: String,
    pub plan_id: String,
    pub success: bool,
    pub message: String,
    pub status: ExecutionStatus,
    pub files_changed: usize,
    pub verification_passed: bool,
    pub health_checks_passed: bool,
    pub duration_seconds: f64,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub rolled_back: bool,
    pub error_message: Option<String>,
    #[serde(skip)]
    pub cached: bool,
}

/// Test observability hooks, called at the boundaries of the inner execution.
#[derive(Default)]
pub struct ExecutorHooks {
    pub before_do_execute: Option<Box<dyn Fn(&str, &str) + Send + Sync>>,
    pub after_do_execute: Option<Box<dyn Fn(&str, &str) + Send + Sync>>,
}

pub fn generate_execution_id() -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    format!("exec_{}", &hex[..12])
}

pub struct HostExecutor {
    workspace_root: PathBuf,
    dry_run: bool,
    use_locking: bool,
    use_idempotency: bool,
    hooks: ExecutorHooks,
    artifact_manager: ArtifactManager,
    execution_store: ExecutionStore,
    lock: ExecutionLock,
    idempotency: IdempotencyManager,
}

struct StepFailure {
    status: ExecutionStatus,
    step_name: &'static str,
    message: String,
}

struct ApplyState {
    backup_dir: Option<PathBuf>,
    applied: Vec<String>,
}

impl HostExecutor {
    pub fn new(workspace_root: &Path) -> Result<Self, ExecutorError> {
        Self::with_options(workspace_root, false, true, true, ExecutorHooks::default())
    }

    pub fn with_options(
        workspace_root: &Path,
        dry_run: bool,
        use_locking: bool,
        use_idempotency: bool,
        hooks: ExecutorHooks,
    ) -> Result<Self, ExecutorError> {
        let workspace_root = workspace_root
            .canonicalize()
            .unwrap_or_else(|_| workspace_root.to_path_buf());
        Ok(Self {
            artifact_manager: ArtifactManager::new(&workspace_root)?,
            execution_store: ExecutionStore::new(&workspace_root)?,
            lock: ExecutionLock::new(&workspace_root)?,
            idempotency: IdempotencyManager::new(&workspace_root)?,
            workspace_root,
            dry_run,
            use_locking,
            use_idempotency,
            hooks,
        })
    }

    pub fn store(&self) -> &ExecutionStore {
        &self.execution_store
    }

    pub fn artifacts(&self) -> &ArtifactManager {
        &self.artifact_manager
    }

    /// Main entry point. The lock covers the idempotency check, the execution
    /// and the recording of the result.
    pub fn execute(
        &self,
        plan: &ChangePlan,
        changeset: &ChangeSet,
        decision: &GovernanceDecision,
    ) -> Result<ExecutionResult, ExecutorError> {
        self.execute_with_trigger(plan, changeset, decision, TriggerContext::default())
    }

    pub fn execute_with_trigger(
        &self,
        plan: &ChangePlan,
        changeset: &ChangeSet,
        decision: &GovernanceDecision,
        trigger: TriggerContext,
    ) -> Result<ExecutionResult, ExecutorError> {
        let exec_id = generate_execution_id();

        if self.use_locking {
            let _guard = self.lock.acquire(&exec_id, &plan.id)?;
            self.execute_with_idempotency(&exec_id, plan, changeset, decision, trigger)
        } else {
            self.execute_with_idempotency(&exec_id, plan, changeset, decision, trigger)
        }
    }

    fn execute_with_idempotency(
        &self,
        exec_id: &str,
        plan: &ChangePlan,
        changeset: &ChangeSet,
        decision: &GovernanceDecision,
        trigger: TriggerContext,
    ) -> Result<ExecutionResult, ExecutorError> {
        if !self.use_idempotency {
            return Ok(self.do_execute(exec_id, plan, changeset, decision, trigger));
        }

        if let Some(previous) = self
            .idempotency
            .check_already_executed(&plan.id, &changeset.checksum)
        {
            info!(exec_id = %previous.execution_id, "duplicate submission, returning cached result");
            return Ok(cached_result(plan, &previous));
        }

        let result = self.do_execute(exec_id, plan, changeset, decision, trigger);
        self.idempotency.record_execution(
            &plan.id,
            &changeset.id,
            &changeset.checksum,
            if result.success { "completed" } else { "failed" },
            result.files_changed,
            result.verification_passed,
            &result.message,
        )?;
        Ok(result)
    }

    fn do_execute(
        &self,
        exec_id: &str,
        plan: &ChangePlan,
        changeset: &ChangeSet,
        decision: &GovernanceDecision,
        trigger: TriggerContext,
    ) -> ExecutionResult {
        if let Some(hook) = &self.hooks.before_do_execute {
            hook(exec_id, &plan.id);
        }

        let started_at = Utc::now();
        let start = Instant::now();

        if !self.dry_run {
            if let Err(e) = self.write_initial_artifacts(exec_id, plan, changeset, decision, &trigger)
            {
                error!(error = %e, "failed to initialize execution artifacts");
            }
        }

        let mut state = ApplyState {
            backup_dir: None,
            applied: Vec::new(),
        };
        let outcome = self.run_steps(exec_id, plan, changeset, decision, &mut state);

        let (result, error_step) = match outcome {
            Ok(()) => {
                let duration = start.elapsed().as_secs_f64();
                self.log_step(exec_id, 7, "finalize", &format!("Execution completed in {duration:.2}s"));
                (
                    ExecutionResult {
                        execution_id: exec_id.to_string(),
                        plan_id: plan.id.clone(),
                        success: true,
                        message: "ChangeSet applied successfully".to_string(),
                        status: ExecutionStatus::Completed,
                        files_changed: state.applied.len(),
                        verification_passed: true,
                        health_checks_passed: true,
                        duration_seconds: duration,
                        started_at,
                        completed_at: Some(Utc::now()),
                        rolled_back: false,
                        error_message: None,
                        cached: false,
                    },
                    None,
                )
            }
            Err(failure) => {
                self.log_step(exec_id, 99, "error", &format!("ERROR: {}", failure.message));
                let mut status = failure.status;
                let mut error_message = failure.message.clone();
                let mut rolled_back = false;

                if let Some(backup_dir) = &state.backup_dir {
                    self.log_step(
                        exec_id,
                        98,
                        "rollback",
                        &format!("Starting rollback from {}", backup_dir.display()),
                    );
                    match RollbackHandler::new(&self.workspace_root, self.dry_run)
                        .rollback(backup_dir, &state.applied)
                    {
                        Ok(()) => {
                            rolled_back = true;
                            status = ExecutionStatus::RolledBack;
                            self.log_step(exec_id, 98, "rollback", "Rollback completed successfully");
                        }
                        Err(e) => {
                            error_message = format!("{error_message}; Rollback failed: {e}");
                            self.log_step(exec_id, 98, "rollback", &format!("ROLLBACK FAILED: {e}"));
                        }
                    }
                }

                let duration = start.elapsed().as_secs_f64();
                self.log_step(exec_id, 99, "error", &format!("Execution failed after {duration:.2}s"));
                (
                    ExecutionResult {
                        execution_id: exec_id.to_string(),
                        plan_id: plan.id.clone(),
                        success: false,
                        message: format!("Execution failed: {}", failure.message),
                        status,
                        files_changed: state.applied.len(),
                        verification_passed: false,
                        health_checks_passed: false,
                        duration_seconds: duration,
                        started_at,
                        completed_at: Some(Utc::now()),
                        rolled_back,
                        error_message: Some(error_message),
                        cached: false,
                    },
                    Some(failure.step_name),
                )
            }
        };

        if result.success {
            if let Some(backup_dir) = &state.backup_dir {
                let _ = std::fs::remove_dir_all(backup_dir);
            }
        }

        if !self.dry_run {
            if let Err(e) = self.artifact_manager.write_execution(exec_id, &result) {
                error!(error = %e, "failed to write execution.json");
            }
            if let Err(e) = self.execution_store.record_execution_end(
                exec_id,
                result.status.as_str(),
                result.duration_seconds,
                result.files_changed,
                result.verification_passed,
                result.health_checks_passed,
                result.rolled_back,
                result.error_message.as_deref(),
                error_step,
            ) {
                error!(error = %e, "failed to record execution end");
            }
        }

        if let Some(hook) = &self.hooks.after_do_execute {
            hook(exec_id, &plan.id);
        }
        result
    }

    fn run_steps(
        &self,
        exec_id: &str,
        plan: &ChangePlan,
        changeset: &ChangeSet,
        decision: &GovernanceDecision,
        state: &mut ApplyState,
    ) -> Result<(), StepFailure> {
        // Step 1: validate approval.
        self.track_step(exec_id, 1, "validate", ExecutionStatus::Validating, || {
            self.log_step(exec_id, 1, "validate", "Starting approval validation");
            if decision.verdict != Verdict::Allow {
                return Err(format!(
                    "Cannot execute: Decision verdict is {}, must be allow. Reasons: {}",
                    decision.verdict.as_str(),
                    decision.reasons.join(", ")
                ));
            }
            self.log_step(exec_id, 1, "validate", "Approval validated successfully");
            Ok(())
        })?;

        // Step 2: changeset integrity. A mismatch aborts before any change.
        self.track_step(exec_id, 2, "checksum", ExecutionStatus::Validating, || {
            self.log_step(exec_id, 2, "checksum", &format!("Verifying checksum: {}", changeset.checksum));
            if !changeset.verify_checksum() {
                return Err("ChangeSet checksum verification failed (possible tampering)".to_string());
            }
            self.log_step(exec_id, 2, "checksum", "Checksum verified successfully");
            Ok(())
        })?;

        // Step 3: backup existing targets.
        let backup_dir = self.track_step(exec_id, 3, "backup", ExecutionStatus::BackingUp, || {
            self.log_step(
                exec_id,
                3,
                "backup",
                &format!("Creating backup for {} files", changeset.changes.len()),
            );
            let dir = self.create_backup(changeset).map_err(|e| e.to_string())?;
            self.log_step(exec_id, 3, "backup", &format!("Backup created at {}", dir.display()));
            Ok(dir)
        })?;
        state.backup_dir = Some(backup_dir.clone());
        if !self.dry_run {
            if let Err(e) = self.artifact_manager.link_backup(exec_id, &backup_dir) {
                warn!(error = %e, "failed to link backup into artifact");
            }
        }

        // Step 4: apply.
        let applied = self.track_step(exec_id, 4, "apply", ExecutionStatus::Applying, || {
            self.log_step(
                exec_id,
                4,
                "apply",
                &format!("Applying {} file changes", changeset.changes.len()),
            );
            let applier = FileApplier::new(&self.workspace_root, self.dry_run);
            match applier.apply_changeset(changeset) {
                Ok(applied) => {
                    self.log_step(
                        exec_id,
                        4,
                        "apply",
                        &format!("Successfully applied changes to {} files", applied.len()),
                    );
                    Ok(applied)
                }
                Err(e) => {
                    // The applied prefix still needs rollback.
                    state.applied = e.applied.clone();
                    Err(e.to_string())
                }
            }
        })?;
        state.applied = applied;

        // Step 5: verification.
        self.track_step(exec_id, 5, "verify", ExecutionStatus::Verifying, || {
            self.log_step(exec_id, 5, "verify", &format!("Running verification: {}", plan.verification_plan));
            let outcome = VerificationRunner::new(&self.workspace_root, self.dry_run)
                .run_verification(&plan.verification_plan);
            if !outcome.passed {
                self.log_step(exec_id, 5, "verify", &format!("FAILED: {}", outcome.message));
                return Err(format!("Verification failed: {}", outcome.message));
            }
            self.log_step(exec_id, 5, "verify", "Verification passed");
            Ok(())
        })?;

        // Step 6: health checks.
        self.track_step(exec_id, 6, "health", ExecutionStatus::HealthChecking, || {
            self.log_step(
                exec_id,
                6,
                "health",
                &format!("Running {} health checks", plan.health_checks.len()),
            );
            let outcome = HealthChecker::new(&self.workspace_root, self.dry_run)
                .run_health_checks(&plan.health_checks);
            if !outcome.passed {
                self.log_step(exec_id, 6, "health", &format!("FAILED: {}", outcome.message));
                return Err(format!("Health checks failed: {}", outcome.message));
            }
            self.log_step(exec_id, 6, "health", "All health checks passed");
            Ok(())
        })?;

        Ok(())
    }

    /// Run one step with DB timing. On failure returns a [`StepFailure`]
    /// carrying the status the execution was in.
    fn track_step<T>(
        &self,
        exec_id: &str,
        step_num: u32,
        step_name: &'static str,
        status: ExecutionStatus,
        f: impl FnOnce() -> Result<T, String>,
    ) -> Result<T, StepFailure> {
        let step_id = if self.dry_run {
            None
        } else {
            let log_ref = format!("steps/{step_num:02}_{step_name}.log");
            self.execution_store
                .record_step_start(exec_id, step_num, step_name, Some(&log_ref))
                .ok()
        };
        if !self.dry_run {
            let _ = self
                .execution_store
                .update_execution_status(exec_id, status.as_str(), None, None);
        }

        let start = Instant::now();
        match f() {
            Ok(value) => {
                if let Some(step_id) = step_id {
                    let _ = self.execution_store.record_step_end(
                        step_id,
                        "completed",
                        start.elapsed().as_secs_f64(),
                        None,
                        None,
                    );
                }
                Ok(value)
            }
            Err(message) => {
                if let Some(step_id) = step_id {
                    let _ = self.execution_store.record_step_end(
                        step_id,
                        "failed",
                        start.elapsed().as_secs_f64(),
                        Some(&format!("{}_FAILED", step_name.to_uppercase())),
                        Some(&message),
                    );
                }
                Err(StepFailure {
                    status: ExecutionStatus::Failed,
                    step_name,
                    message,
                })
            }
        }
    }

    fn create_backup(&self, changeset: &ChangeSet) -> Result<PathBuf, ExecutorError> {
        let prefix = if self.dry_run {
            "dryrun_backup_"
        } else {
            "lonelycat_backup_"
        };
        let backup_dir = tempfile::Builder::new().prefix(prefix).tempdir()?.into_path();
        if self.dry_run {
            return Ok(backup_dir);
        }
        for change in &changeset.changes {
            let source = self.workspace_root.join(&change.path);
            if source.exists() {
                let target = backup_dir.join(&change.path);
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::copy(&source, &target)?;
            }
        }
        Ok(backup_dir)
    }

    fn write_initial_artifacts(
        &self,
        exec_id: &str,
        plan: &ChangePlan,
        changeset: &ChangeSet,
        decision: &GovernanceDecision,
        trigger: &TriggerContext,
    ) -> Result<(), ExecutorError> {
        self.artifact_manager.create_execution_dir(exec_id)?;
        self.artifact_manager.write_plan(exec_id, plan)?;
        self.artifact_manager.write_changeset(exec_id, changeset)?;
        self.artifact_manager.write_decision(exec_id, decision)?;

        let artifact_path = self
            .artifact_manager
            .execution_dir(exec_id)
            .map(|p| p.to_string_lossy().to_string())
            .unwrap_or_default();
        self.execution_store.record_execution_start(
            exec_id,
            &plan.id,
            &changeset.id,
            &decision.id,
            &changeset.checksum,
            decision.verdict.as_str(),
            decision.risk_level_effective.as_str(),
            &plan.affected_paths,
            &artifact_path,
            StartGraphFields {
                correlation_id: trigger.correlation_id.clone(),
                parent_execution_id: trigger.parent_execution_id.clone(),
                trigger_kind: Some(trigger.trigger_kind.as_str().to_string()),
                run_id: trigger.run_id.clone(),
                is_repair: trigger.is_repair,
                repair_for_execution_id: trigger.repair_for_execution_id.clone(),
            },
        )
    }

    fn log_step(&self, exec_id: &str, step_num: u32, step_name: &str, message: &str) {
        if !self.dry_run {
            if let Err(e) = self
                .artifact_manager
                .append_step_log(exec_id, step_num, step_name, message)
            {
                warn!(error = %e, "failed to append step log");
            }
        }
    }
}

fn cached_result(plan: &ChangePlan, previous: &IdempotencyRecord) -> ExecutionResult {
    ExecutionResult {
        execution_id: previous.execution_id.clone(),
        plan_id: plan.id.clone(),
        success: previous.is_success(),
        message: format!("[CACHED] {}", previous.message),
        status: if previous.is_success() {
            ExecutionStatus::Completed
        } else {
            ExecutionStatus::Failed
        },
        files_changed: previous.files_changed,
        verification_passed: previous.verification_passed,
        health_checks_passed: true,
        duration_seconds: 0.0,
        started_at: previous.executed_at,
        completed_at: Some(previous.executed_at),
        rolled_back: false,
        error_message: None,
        cached: true,
    }
}
