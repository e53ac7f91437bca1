//! Plan x checksum idempotency cache.
//!
//! `execution_id_for(plan_id, checksum) = sha256("plan:checksum")[..16]`; one
//! JSON record per id under `.lonelycat/executions/exec_<id>.json` with a TTL.
//! The check-execute-record triple must run inside a single acquisition of the
//! execution lock; this module only provides the cache.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::ExecutorError;

pub const DEFAULT_TTL_SECONDS: i64 = 3600;

/// Cached record of a previous execution of the same plan + checksum.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub execution_id: String,
    pub plan_id: String,
    pub changeset_id: String,
    pub checksum: String,
    /// "completed" or "failed"
    pub status: String,
    pub executed_at: DateTime<Utc>,
    pub files_changed: usize,
    pub verification_passed: bool,
    pub message: String,
    #[serde(default = "default_ttl")]
    pub ttl_seconds: i64,
}

fn default_ttl() -> i64 {
    DEFAULT_TTL_SECONDS
}

impl IdempotencyRecord {
    pub fn is_expired(&self) -> bool {
        let age = Utc::now().signed_duration_since(self.executed_at);
        age.num_seconds() > self.ttl_seconds
    }

    pub fn is_success(&self) -> bool {
        self.status == "completed" && self.verification_passed
    }
}

pub struct IdempotencyManager {
    cache_dir: PathBuf,
    ttl_seconds: i64,
    allow_retry_on_failure: bool,
}

impl IdempotencyManager {
    pub fn new(workspace_root: &Path) -> Result<Self, ExecutorError> {
        Self::with_options(workspace_root, DEFAULT_TTL_SECONDS, true)
    }

    pub fn with_options(
        workspace_root: &Path,
        ttl_seconds: i64,
        allow_retry_on_failure: bool,
    ) -> Result<Self, ExecutorError> {
        let cache_dir = workspace_root.join(".lonelycat").join("executions");
        std::fs::create_dir_all(&cache_dir)?;
        Ok(Self {
            cache_dir,
            ttl_seconds,
            allow_retry_on_failure,
        })
    }

    /// Deterministic execution id for a plan + changeset checksum pair.
    pub fn execution_id_for(plan_id: &str, changeset_checksum: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(format!("{plan_id}:{changeset_checksum}").as_bytes());
        format!("{:x}", hasher.finalize())[..16].to_string()
    }

    /// Returns the previous record when this pair already executed. Expired
    /// records and retryable failures are discarded to permit re-execution.
    pub fn check_already_executed(
        &self,
        plan_id: &str,
        changeset_checksum: &str,
    ) -> Option<IdempotencyRecord> {
        let exec_id = Self::execution_id_for(plan_id, changeset_checksum);
        let record = self.load_record(&exec_id)?;

        if record.is_expired() {
            info!(exec_id, "idempotency record expired, allowing re-execution");
            self.delete_record(&exec_id);
            return None;
        }
        if !record.is_success() && self.allow_retry_on_failure {
            info!(exec_id, "previous execution failed, allowing retry");
            self.delete_record(&exec_id);
            return None;
        }
        Some(record)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn record_execution(
        &self,
        plan_id: &str,
        changeset_id: &str,
        checksum: &str,
        status: &str,
        files_changed: usize,
        verification_passed: bool,
        message: &str,
    ) -> Result<(), ExecutorError> {
        let execution_id = Self::execution_id_for(plan_id, checksum);
        let record = IdempotencyRecord {
            execution_id: execution_id.clone(),
            plan_id: plan_id.to_string(),
            changeset_id: changeset_id.to_string(),
            checksum: checksum.to_string(),
            status: status.to_string(),
            executed_at: Utc::now(),
            files_changed,
            verification_passed,
            message: message.to_string(),
            ttl_seconds: self.ttl_seconds,
        };
        let path = self.record_path(&execution_id);
        std::fs::write(&path, serde_json::to_string_pretty(&record)?)?;
        debug!(execution_id, status, "recorded idempotency result");
        Ok(())
    }

    /// Recent non-expired records, newest first.
    pub fn execution_history(&self, limit: usize) -> Vec<IdempotencyRecord> {
        let mut records: Vec<IdempotencyRecord> = self
            .record_files()
            .into_iter()
            .filter_map(|path| self.load_record_file(&path))
            .filter(|r| !r.is_expired())
            .collect();
        records.sort_by(|a, b| b.executed_at.cmp(&a.executed_at));
        records.truncate(limit);
        records
    }

    /// Deletes expired records, returning how many were removed.
    pub fn clean_expired_records(&self) -> usize {
        let mut deleted = 0;
        for path in self.record_files() {
            if let Some(record) = self.load_record_file(&path) {
                if record.is_expired() && std::fs::remove_file(&path).is_ok() {
                    deleted += 1;
                }
            }
        }
        if deleted > 0 {
            info!(deleted, "cleaned expired idempotency records");
        }
        deleted
    }

    fn record_path(&self, execution_id: &str) -> PathBuf {
        self.cache_dir.join(format!("exec_{execution_id}.json"))
    }

    fn record_files(&self) -> Vec<PathBuf> {
        let Ok(entries) = std::fs::read_dir(&self.cache_dir) else {
            return Vec::new();
        };
        entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.is_file()
                    && p.file_name()
                        .map(|n| {
                            let n = n.to_string_lossy();
                            n.starts_with("exec_") && n.ends_with(".json")
                        })
                        .unwrap_or(false)
            })
            .collect()
    }

    fn load_record(&self, execution_id: &str) -> Option<IdempotencyRecord> {
        self.load_record_file(&self.record_path(execution_id))
    }

    fn load_record_file(&self, path: &Path) -> Option<IdempotencyRecord> {
        let content = std::fs::read_to_string(path).ok()?;
        match serde_json::from_str(&content) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "unreadable idempotency record");
                None
            }
        }
    }

    fn delete_record(&self, execution_id: &str) {
        let _ = std::fs::remove_file(self.record_path(execution_id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(ws: &Path) -> IdempotencyManager {
        IdempotencyManager::new(ws).unwrap()
    }

    #[test]
    fn execution_id_is_deterministic_and_short() {
        let a = IdempotencyManager::execution_id_for("plan_1", "abc");
        let b = IdempotencyManager::execution_id_for("plan_1", "abc");
        let c = IdempotencyManager::execution_id_for("plan_1", "abd");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn completed_record_blocks_reexecution() {
        let ws = tempfile::tempdir().unwrap();
        let m = manager(ws.path());

        assert!(m.check_already_executed("plan_1", "abc").is_none());
        m.record_execution("plan_1", "cs_1", "abc", "completed", 2, true, "ok")
            .unwrap();

        let hit = m.check_already_executed("plan_1", "abc").unwrap();
        assert!(hit.is_success());
        assert_eq!(hit.files_changed, 2);
    }

    #[test]
    fn failed_record_allows_retry_and_is_discarded() {
        let ws = tempfile::tempdir().unwrap();
        let m = manager(ws.path());

        m.record_execution("plan_1", "cs_1", "abc", "failed", 0, false, "boom")
            .unwrap();
        assert!(m.check_already_executed("plan_1", "abc").is_none());
        // The failed record was discarded, so the next check is also a miss.
        assert!(m.check_already_executed("plan_1", "abc").is_none());
    }

    #[test]
    fn failed_record_blocks_when_retry_disabled() {
        let ws = tempfile::tempdir().unwrap();
        let m = IdempotencyManager::with_options(ws.path(), DEFAULT_TTL_SECONDS, false).unwrap();
        m.record_execution("plan_1", "cs_1", "abc", "failed", 0, false, "boom")
            .unwrap();
        let hit = m.check_already_executed("plan_1", "abc").unwrap();
        assert!(!hit.is_success());
    }

    #[test]
    fn expired_record_is_cleaned() {
        let ws = tempfile::tempdir().unwrap();
        let m = IdempotencyManager::with_options(ws.path(), 0, true).unwrap();
        m.record_execution("plan_1", "cs_1", "abc", "completed", 1, true, "ok")
            .unwrap();
        std::thread::sleep(std::time::Duration::from_millis(1100));
        assert!(m.check_already_executed("plan_1", "abc").is_none());
        assert_eq!(m.clean_expired_records(), 0); // already discarded by check
    }

    #[test]
    fn history_is_newest_first_and_limited() {
        let ws = tempfile::tempdir().unwrap();
        let m = manager(ws.path());
        for i in 0..3 {
            m.record_execution(&format!("plan_{i}"), "cs", &format!("sum{i}"), "completed", 1, true, "ok")
                .unwrap();
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        let history = m.execution_history(2);
        assert_eq!(history.len(), 2);
        assert!(history[0].executed_at >= history[1].executed_at);
    }
}
