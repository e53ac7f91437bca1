//! Applies file changes from an approved changeset.
//!
//! CREATE refuses existing targets, UPDATE and DELETE require the current file
//! content to equal `old_content` byte-for-byte. Writes go to a sibling
//! tempfile and land by atomic rename; UPDATE preserves the original file mode.

use std::path::{Path, PathBuf};

use governance::{ChangeSet, FileChange, Operation};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplyFailureKind {
    CreateExists,
    UpdateMismatch,
    DeleteMismatch,
    MissingTarget,
    MissingContent,
    Io,
}

impl ApplyFailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApplyFailureKind::CreateExists => "create_exists",
            ApplyFailureKind::UpdateMismatch => "update_mismatch",
            ApplyFailureKind::DeleteMismatch => "delete_mismatch",
            ApplyFailureKind::MissingTarget => "missing_target",
            ApplyFailureKind::MissingContent => "missing_content",
            ApplyFailureKind::Io => "io",
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("failed to apply change to {path}: {message}")]
pub struct ApplyError {
    pub kind: ApplyFailureKind,
    pub path: String,
    pub message: String,
    /// Paths applied before the failure; the executor rolls these back.
    pub applied: Vec<String>,
}

pub struct FileApplier {
    workspace_root: PathBuf,
    dry_run: bool,
}

impl FileApplier {
    pub fn new(workspace_root: &Path, dry_run: bool) -> Self {
        Self {
            workspace_root: workspace_root.to_path_buf(),
            dry_run,
        }
    }

    /// Apply all changes in order, returning the applied paths. Stops at the
    /// first failure; already-applied changes are the executor's to roll back.
    pub fn apply_changeset(&self, changeset: &ChangeSet) -> Result<Vec<String>, ApplyError> {
        let mut applied = Vec::new();
        for change in &changeset.changes {
            if let Err(mut e) = self.apply_change(change) {
                e.applied = applied;
                return Err(e);
            }
            applied.push(change.path.clone());
        }
        Ok(applied)
    }

    fn apply_change(&self, change: &FileChange) -> Result<(), ApplyError> {
        let target = self.workspace_root.join(&change.path);
        match change.operation {
            Operation::Create => self.create_file(&target, change),
            Operation::Update => self.update_file(&target, change),
            Operation::Delete => self.delete_file(&target, change),
        }
    }

    fn create_file(&self, target: &Path, change: &FileChange) -> Result<(), ApplyError> {
        if self.dry_run {
            return Ok(());
        }
        if target.exists() {
            return Err(self.fail(change, ApplyFailureKind::CreateExists, "file already exists"));
        }
        let content = change
            .new_content
            .as_deref()
            .ok_or_else(|| self.fail(change, ApplyFailureKind::MissingContent, "CREATE requires new_content"))?;

        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| self.io_fail(change, &e))?;
        }
        self.write_atomic(target, content, None, change)
    }

    fn update_file(&self, target: &Path, change: &FileChange) -> Result<(), ApplyError> {
        if self.dry_run {
            return Ok(());
        }
        if !target.exists() {
            return Err(self.fail(change, ApplyFailureKind::MissingTarget, "file does not exist"));
        }
        if let Some(expected) = &change.old_content {
            let current = std::fs::read_to_string(target).map_err(|e| self.io_fail(change, &e))?;
            if &current != expected {
                return Err(self.fail(
                    change,
                    ApplyFailureKind::UpdateMismatch,
                    "expected old_content does not match current file content",
                ));
            }
        }
        let content = change.new_content.as_deref().unwrap_or("");
        let mode = file_mode(target);
        self.write_atomic(target, content, mode, change)
    }

    fn delete_file(&self, target: &Path, change: &FileChange) -> Result<(), ApplyError> {
        if self.dry_run {
            return Ok(());
        }
        if !target.exists() {
            return Err(self.fail(change, ApplyFailureKind::MissingTarget, "file does not exist"));
        }
        if let Some(expected) = &change.old_content {
            let current = std::fs::read_to_string(target).map_err(|e| self.io_fail(change, &e))?;
            if &current != expected {
                return Err(self.fail(
                    change,
                    ApplyFailureKind::DeleteMismatch,
                    "expected old_content does not match current file content",
                ));
            }
        }
        std::fs::remove_file(target).map_err(|e| self.io_fail(change, &e))
    }

    /// Sibling tempfile then rename, so readers never observe partial content.
    fn write_atomic(
        &self,
        target: &Path,
        content: &str,
        mode: Option<u32>,
        change: &FileChange,
    ) -> Result<(), ApplyError> {
        let dir = target.parent().unwrap_or(&self.workspace_root);
        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| self.io_fail(change, &e))?;
        std::io::Write::write_all(&mut tmp, content.as_bytes())
            .map_err(|e| self.io_fail(change, &e))?;
        #[cfg(unix)]
        if let Some(mode) = mode {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(tmp.path(), std::fs::Permissions::from_mode(mode));
        }
        #[cfg(not(unix))]
        let _ = mode;
        tmp.persist(target)
            .map_err(|e| self.io_fail(change, &e.error))?;
        Ok(())
    }

    fn fail(&self, change: &FileChange, kind: ApplyFailureKind, message: &str) -> ApplyError {
        ApplyError {
            kind,
            path: change.path.clone(),
            message: message.to_string(),
            applied: Vec::new(),
        }
    }

    fn io_fail(&self, change: &FileChange, err: &dyn std::fmt::Display) -> ApplyError {
        ApplyError {
            kind: ApplyFailureKind::Io,
            path: change.path.clone(),
            message: err.to_string(),
            applied: Vec::new(),
        }
    }
}

#[cfg(unix)]
fn file_mode(path: &Path) -> Option<u32> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path).ok().map(|m| m.permissions().mode())
}

#[cfg(not(unix))]
fn file_mode(_path: &Path) -> Option<u32> {
    None
}
