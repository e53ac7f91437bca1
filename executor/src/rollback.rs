//! Restores the pre-change state from the backup directory.
//!
//! Only paths actually applied are touched: files present in the backup are
//! restored, files absent from it were created by this execution and are
//! deleted.

use std::path::{Path, PathBuf};

use tracing::warn;

use crate::ExecutorError;

pub struct RollbackHandler {
    workspace_root: PathBuf,
    dry_run: bool,
}

impl RollbackHandler {
    pub fn new(workspace_root: &Path, dry_run: bool) -> Self {
        Self {
            workspace_root: workspace_root.to_path_buf(),
            dry_run,
        }
    }

    pub fn rollback(&self, backup_dir: &Path, applied_paths: &[String]) -> Result<(), ExecutorError> {
        if !backup_dir.exists() {
            return Err(ExecutorError::Storage(
                "no backup directory found for rollback".to_string(),
            ));
        }
        if self.dry_run {
            return Ok(());
        }

        for path in applied_paths {
            self.restore_file(path, backup_dir)?;
        }

        if let Err(e) = std::fs::remove_dir_all(backup_dir) {
            warn!(error = %e, "failed to clean up backup directory");
        }
        Ok(())
    }

    fn restore_file(&self, rel_path: &str, backup_dir: &Path) -> Result<(), ExecutorError> {
        let target = self.workspace_root.join(rel_path);
        let backup = backup_dir.join(rel_path);

        if backup.exists() {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(&backup, &target)?;
        } else if target.exists() {
            // Created by this execution, remove it.
            std::fs::remove_file(&target)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restores_updated_and_deletes_created() {
        let ws = tempfile::tempdir().unwrap();
        let backup = tempfile::tempdir().unwrap();

        // x.txt existed before (backed up as "A"), created.txt did not.
        std::fs::write(backup.path().join("x.txt"), "A").unwrap();
        std::fs::write(ws.path().join("x.txt"), "B").unwrap();
        std::fs::write(ws.path().join("created.txt"), "new").unwrap();

        let handler = RollbackHandler::new(ws.path(), false);
        handler
            .rollback(
                backup.path(),
                &["x.txt".to_string(), "created.txt".to_string()],
            )
            .unwrap();

        assert_eq!(std::fs::read_to_string(ws.path().join("x.txt")).unwrap(), "A");
        assert!(!ws.path().join("created.txt").exists());
        assert!(!backup.path().exists());
    }

    #[test]
    fn missing_backup_dir_is_an_error() {
        let ws = tempfile::tempdir().unwrap();
        let handler = RollbackHandler::new(ws.path(), false);
        let err = handler
            .rollback(Path::new("/nonexistent/backup"), &[])
            .unwrap_err();
        assert!(err.to_string().contains("backup"));
    }

    #[test]
    fn untouched_paths_are_ignored() {
        let ws = tempfile::tempdir().unwrap();
        let backup = tempfile::tempdir().unwrap();
        std::fs::write(ws.path().join("other.txt"), "keep").unwrap();

        let handler = RollbackHandler::new(ws.path(), false);
        handler.rollback(backup.path(), &[]).unwrap();
        assert_eq!(
            std::fs::read_to_string(ws.path().join("other.txt")).unwrap(),
            "keep"
        );
    }
}
