//! Per-execution evidence directories.
//!
//! Layout under `<root>/.lonelycat/executions/<execution_id>/`:
//! the 4-piece JSON set (`plan`, `changeset`, `decision`, `execution`), a
//! `steps/` directory with `NN_<name>.log` append-only logs, a `backups/`
//! subtree, and `stdout.log`/`stderr.log`. Existing files are never modified.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::Utc;
use serde_json::Value;
use walkdir::WalkDir;

use crate::ExecutorError;

#[derive(Clone, Debug)]
pub struct ArtifactConfig {
    /// Always keep the newest N executions.
    pub retention_count: usize,
    /// Among older executions, remove those with mtime older than this.
    pub retention_days: u64,
}

impl Default for ArtifactConfig {
    fn default() -> Self {
        Self {
            retention_count: 100,
            retention_days: 7,
        }
    }
}

pub struct ArtifactManager {
    base_dir: PathBuf,
    config: ArtifactConfig,
}

impl ArtifactManager {
    pub fn new(workspace_root: &Path) -> Result<Self, ExecutorError> {
        Self::with_config(workspace_root, ArtifactConfig::default())
    }

    pub fn with_config(workspace_root: &Path, config: ArtifactConfig) -> Result<Self, ExecutorError> {
        let base_dir = workspace_root.join(".lonelycat").join("executions");
        std::fs::create_dir_all(&base_dir)?;
        Ok(Self { base_dir, config })
    }

    pub fn create_execution_dir(&self, execution_id: &str) -> Result<PathBuf, ExecutorError> {
        let exec_dir = self.base_dir.join(execution_id);
        std::fs::create_dir_all(exec_dir.join("steps"))?;
        std::fs::create_dir_all(exec_dir.join("backups"))?;
        touch(&exec_dir.join("stdout.log"))?;
        touch(&exec_dir.join("stderr.log"))?;
        Ok(exec_dir)
    }

    pub fn execution_dir(&self, execution_id: &str) -> Option<PathBuf> {
        let dir = self.base_dir.join(execution_id);
        dir.exists().then_some(dir)
    }

    pub fn write_plan<T: serde::Serialize>(
        &self,
        execution_id: &str,
        plan: &T,
    ) -> Result<PathBuf, ExecutorError> {
        self.write_json(execution_id, "plan.json", plan)
    }

    pub fn write_changeset<T: serde::Serialize>(
        &self,
        execution_id: &str,
        changeset: &T,
    ) -> Result<PathBuf, ExecutorError> {
        self.write_json(execution_id, "changeset.json", changeset)
    }

    pub fn write_decision<T: serde::Serialize>(
        &self,
        execution_id: &str,
        decision: &T,
    ) -> Result<PathBuf, ExecutorError> {
        self.write_json(execution_id, "decision.json", decision)
    }

    pub fn write_execution<T: serde::Serialize>(
        &self,
        execution_id: &str,
        result: &T,
    ) -> Result<PathBuf, ExecutorError> {
        self.write_json(execution_id, "execution.json", result)
    }

    /// Append a timestamped line to `steps/NN_<name>.log`.
    pub fn append_step_log(
        &self,
        execution_id: &str,
        step_num: u32,
        step_name: &str,
        content: &str,
    ) -> Result<PathBuf, ExecutorError> {
        let path = self
            .base_dir
            .join(execution_id)
            .join("steps")
            .join(format!("{step_num:02}_{step_name}.log"));
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        writeln!(file, "[{}] {content}", Utc::now().to_rfc3339())?;
        Ok(path)
    }

    pub fn append_stdout(&self, execution_id: &str, content: &str) -> Result<(), ExecutorError> {
        self.append(execution_id, "stdout.log", content)
    }

    pub fn append_stderr(&self, execution_id: &str, content: &str) -> Result<(), ExecutorError> {
        self.append(execution_id, "stderr.log", content)
    }

    /// Copy the pre-change backup tree into the artifact so ownership transfers
    /// to the artifact on success.
    pub fn link_backup(&self, execution_id: &str, backup_source: &Path) -> Result<PathBuf, ExecutorError> {
        let target_root = self.base_dir.join(execution_id).join("backups");
        if backup_source.exists() {
            for entry in WalkDir::new(backup_source).into_iter().filter_map(|e| e.ok()) {
                if entry.file_type().is_file() {
                    let rel = entry
                        .path()
                        .strip_prefix(backup_source)
                        .map_err(|e| ExecutorError::Storage(e.to_string()))?;
                    let target = target_root.join(rel);
                    if let Some(parent) = target.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    std::fs::copy(entry.path(), &target)?;
                }
            }
        }
        Ok(target_root)
    }

    /// Execution ids sorted by mtime, newest first.
    pub fn list_executions(&self, limit: Option<usize>) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(&self.base_dir) else {
            return Vec::new();
        };
        let mut dirs: Vec<(String, SystemTime)> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_dir())
            .filter_map(|e| {
                let name = e.file_name().to_string_lossy().to_string();
                if !name.starts_with("exec_") {
                    return None;
                }
                let mtime = e.metadata().ok()?.modified().ok()?;
                Some((name, mtime))
            })
            .collect();
        dirs.sort_by(|a, b| b.1.cmp(&a.1));
        let mut ids: Vec<String> = dirs.into_iter().map(|(name, _)| name).collect();
        if let Some(limit) = limit {
            ids.truncate(limit);
        }
        ids
    }

    /// Keep the newest `retention_count`; among older ones remove those with
    /// mtime older than `retention_days`. Returns how many were removed.
    pub fn cleanup_old_artifacts(&self) -> Result<usize, ExecutorError> {
        let all = self.list_executions(None);
        let cutoff = SystemTime::now()
            - std::time::Duration::from_secs(self.config.retention_days * 24 * 3600);
        let mut removed = 0;
        for (idx, exec_id) in all.iter().enumerate() {
            if idx < self.config.retention_count {
                continue;
            }
            let dir = self.base_dir.join(exec_id);
            let old = dir
                .metadata()
                .and_then(|m| m.modified())
                .map(|mtime| mtime < cutoff)
                .unwrap_or(false);
            if old {
                std::fs::remove_dir_all(&dir)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn write_json<T: serde::Serialize>(
        &self,
        execution_id: &str,
        name: &str,
        value: &T,
    ) -> Result<PathBuf, ExecutorError> {
        let path = self.base_dir.join(execution_id).join(name);
        std::fs::write(&path, serde_json::to_string_pretty(value)?)?;
        Ok(path)
    }

    fn append(&self, execution_id: &str, name: &str, content: &str) -> Result<(), ExecutorError> {
        let path = self.base_dir.join(execution_id).join(name);
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        file.write_all(content.as_bytes())?;
        Ok(())
    }
}

/// Parse an artifact directory back into a full audit record: the four JSONs
/// plus step-log text and stdout/stderr.
pub fn replay_execution(artifact_dir: &Path) -> Result<Value, ExecutorError> {
    let mut result = serde_json::Map::new();

    for name in ["plan.json", "changeset.json", "decision.json", "execution.json"] {
        let path = artifact_dir.join(name);
        if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            let key = name.trim_end_matches(".json").to_string();
            result.insert(key, serde_json::from_str(&content)?);
        }
    }

    let mut step_logs = serde_json::Map::new();
    let steps_dir = artifact_dir.join("steps");
    if steps_dir.exists() {
        let mut logs: Vec<PathBuf> = std::fs::read_dir(&steps_dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().map(|e| e == "log").unwrap_or(false))
            .collect();
        logs.sort();
        for log in logs {
            let stem = log
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_default();
            step_logs.insert(stem, Value::String(std::fs::read_to_string(&log)?));
        }
    }
    result.insert("step_logs".to_string(), Value::Object(step_logs));

    for name in ["stdout", "stderr"] {
        let path = artifact_dir.join(format!("{name}.log"));
        if path.exists() {
            result.insert(name.to_string(), Value::String(std::fs::read_to_string(&path)?));
        }
    }

    Ok(Value::Object(result))
}

fn touch(path: &Path) -> std::io::Result<()> {
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn creates_layout_and_replays_the_four_piece_set() {
        let ws = tempfile::tempdir().unwrap();
        let mgr = ArtifactManager::new(ws.path()).unwrap();
        let dir = mgr.create_execution_dir("exec_abc").unwrap();
        assert!(dir.join("steps").is_dir());
        assert!(dir.join("backups").is_dir());
        assert!(dir.join("stdout.log").is_file());

        mgr.write_plan("exec_abc", &json!({"id": "plan_1"})).unwrap();
        mgr.write_changeset("exec_abc", &json!({"id": "cs_1"})).unwrap();
        mgr.write_decision("exec_abc", &json!({"id": "dec_1"})).unwrap();
        mgr.write_execution("exec_abc", &json!({"success": true})).unwrap();
        mgr.append_step_log("exec_abc", 1, "validate", "Starting approval validation")
            .unwrap();
        mgr.append_stdout("exec_abc", "hello\n").unwrap();

        let replay = replay_execution(&dir).unwrap();
        assert_eq!(replay["plan"]["id"], "plan_1");
        assert_eq!(replay["changeset"]["id"], "cs_1");
        assert_eq!(replay["decision"]["id"], "dec_1");
        assert_eq!(replay["execution"]["success"], true);
        assert!(replay["step_logs"]["01_validate"]
            .as_str()
            .unwrap()
            .contains("Starting approval validation"));
        assert_eq!(replay["stdout"], "hello\n");
    }

    #[test]
    fn step_logs_are_append_only() {
        let ws = tempfile::tempdir().unwrap();
        let mgr = ArtifactManager::new(ws.path()).unwrap();
        mgr.create_execution_dir("exec_x").unwrap();
        mgr.append_step_log("exec_x", 4, "apply", "first").unwrap();
        let path = mgr.append_step_log("exec_x", 4, "apply", "second").unwrap();
        let content = std::fs::read_to_string(path).unwrap();
        assert!(content.contains("first"));
        assert!(content.contains("second"));
        assert_eq!(content.lines().count(), 2);
    }

    #[test]
    fn link_backup_mirrors_tree() {
        let ws = tempfile::tempdir().unwrap();
        let mgr = ArtifactManager::new(ws.path()).unwrap();
        mgr.create_execution_dir("exec_b").unwrap();

        let backup = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(backup.path().join("src")).unwrap();
        std::fs::write(backup.path().join("src/lib.rs"), "content").unwrap();

        let target = mgr.link_backup("exec_b", backup.path()).unwrap();
        assert_eq!(
            std::fs::read_to_string(target.join("src/lib.rs")).unwrap(),
            "content"
        );
    }

    #[test]
    fn retention_keeps_newest_and_prunes_old() {
        let ws = tempfile::tempdir().unwrap();
        let mgr = ArtifactManager::with_config(
            ws.path(),
            ArtifactConfig {
                retention_count: 1,
                retention_days: 0,
            },
        )
        .unwrap();
        mgr.create_execution_dir("exec_old").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(1100));
        mgr.create_execution_dir("exec_new").unwrap();

        let removed = mgr.cleanup_old_artifacts().unwrap();
        assert_eq!(removed, 1);
        let left = mgr.list_executions(None);
        assert_eq!(left, vec!["exec_new".to_string()]);
    }

    #[test]
    fn list_executions_is_newest_first() {
        let ws = tempfile::tempdir().unwrap();
        let mgr = ArtifactManager::new(ws.path()).unwrap();
        mgr.create_execution_dir("exec_1").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(1100));
        mgr.create_execution_dir("exec_2").unwrap();
        assert_eq!(mgr.list_executions(Some(1)), vec!["exec_2".to_string()]);
    }
}
