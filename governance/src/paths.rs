//! Canonical path handling for the write path.
//!
//! All candidate paths are resolved lexically against the workspace root (no
//! symlink following), then every ancestor up to the root is tested for symlinks.
//! Pattern checks run on the workspace-relative path with forward slashes;
//! forbidden patterns beat allowed patterns, default is deny.

use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Why a path was rejected.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PathViolation {
    PathTraversal,
    ForbiddenRoot,
    SymlinkPath,
    OutsideWorkspace,
    AbsolutePathDenied,
    UncPathDenied,
}

impl PathViolation {
    pub fn as_str(&self) -> &'static str {
        match self {
            PathViolation::PathTraversal => "path_traversal",
            PathViolation::ForbiddenRoot => "forbidden_root",
            PathViolation::SymlinkPath => "symlink_path",
            PathViolation::OutsideWorkspace => "outside_workspace",
            PathViolation::AbsolutePathDenied => "absolute_path_denied",
            PathViolation::UncPathDenied => "unc_path_denied",
        }
    }
}

/// Result of [`canonicalize_path`].
#[derive(Clone, Debug)]
pub struct CanonicalPathResult {
    pub abs_path: PathBuf,
    /// Normalized string used for pattern matching; original case is preserved
    /// in `abs_path` for display.
    pub norm_path_str: String,
    pub has_symlink: bool,
    pub within_workspace: bool,
    pub violation: Option<PathViolation>,
}

/// Canonicalize `path` against `workspace_root` with security checks.
///
/// Order of evaluation: absolute/UNC rejection, lexical resolution of `..`,
/// workspace containment, symlink chain detection.
pub fn canonicalize_path(path: &str, workspace_root: &Path) -> CanonicalPathResult {
    let root = lexical_absolute(workspace_root);
    let candidate = Path::new(path);

    if path.starts_with("\\\\") {
        return CanonicalPathResult {
            abs_path: candidate.to_path_buf(),
            norm_path_str: path.to_string(),
            has_symlink: false,
            within_workspace: false,
            violation: Some(PathViolation::UncPathDenied),
        };
    }
    if candidate.is_absolute() {
        return CanonicalPathResult {
            abs_path: candidate.to_path_buf(),
            norm_path_str: path.to_string(),
            has_symlink: false,
            within_workspace: false,
            violation: Some(PathViolation::AbsolutePathDenied),
        };
    }

    // Resolve `..` lexically so traversal is visible, symlinks stay unfollowed.
    let (abs_path, escaped) = resolve_relative(&root, candidate);
    let within_workspace = !escaped && abs_path.starts_with(&root);
    let has_symlink = within_workspace && has_symlink_in_chain(&abs_path, &root);

    let violation = if !within_workspace {
        Some(PathViolation::OutsideWorkspace)
    } else if has_symlink {
        Some(PathViolation::SymlinkPath)
    } else {
        None
    };

    CanonicalPathResult {
        norm_path_str: normalize_for_matching(&abs_path),
        abs_path,
        has_symlink,
        within_workspace,
        violation,
    }
}

/// Unified policy check used by both WriteGate and the Executor.
///
/// Precedence: canonical violations, then forbidden patterns, then allowed
/// patterns, then default deny. Returns `(allowed, reason)`.
pub fn path_policy_check(
    target_path: &str,
    workspace_root: &Path,
    allowed_patterns: &[String],
    forbidden_patterns: &[String],
) -> (bool, String) {
    let result = canonicalize_path(target_path, workspace_root);

    if let Some(v) = result.violation {
        return (false, format!("{}: {target_path}", v.as_str()));
    }

    let root = lexical_absolute(workspace_root);
    let rel = match result.abs_path.strip_prefix(&root) {
        Ok(rel) => rel.to_string_lossy().replace('\\', "/"),
        Err(_) => return (false, format!("outside_workspace: {target_path}")),
    };

    for pattern in forbidden_patterns {
        if match_pattern(&rel, pattern) {
            return (false, format!("forbidden_root: matches pattern '{pattern}'"));
        }
    }
    for pattern in allowed_patterns {
        if match_pattern(&rel, pattern) {
            return (true, "allowed_by_policy".to_string());
        }
    }
    (false, "not_in_allowed_paths".to_string())
}

/// Glob match supporting `**` (recursive), `*` (any chars) and literals.
///
/// `**` patterns are split once: the prefix must anchor the path, the suffix is
/// matched as `*<suffix>` against the whole path.
pub fn match_pattern(path: &str, pattern: &str) -> bool {
    let path = normalize_case(&path.replace('\\', "/"));
    let pattern = normalize_case(&pattern.replace('\\', "/"));

    if let Some((prefix, suffix)) = pattern.split_once("**") {
        let prefix = prefix.trim_end_matches('/');
        let suffix = suffix.trim_start_matches('/');

        if !prefix.is_empty() && !path.starts_with(prefix) {
            return false;
        }
        if suffix.is_empty() {
            return true;
        }
        return glob_match(&format!("*{suffix}"), &path);
    }

    glob_match(&pattern, &path)
}

fn glob_match(pattern: &str, path: &str) -> bool {
    match glob::Pattern::new(pattern) {
        Ok(p) => p.matches_with(
            path,
            glob::MatchOptions {
                case_sensitive: true,
                require_literal_separator: false,
                require_literal_leading_dot: false,
            },
        ),
        Err(_) => false,
    }
}

#[cfg(windows)]
fn normalize_case(s: &str) -> String {
    s.to_lowercase()
}

#[cfg(not(windows))]
fn normalize_case(s: &str) -> String {
    s.to_string()
}

#[cfg(windows)]
fn normalize_for_matching(path: &Path) -> String {
    path.to_string_lossy().to_lowercase()
}

#[cfg(not(windows))]
fn normalize_for_matching(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

/// Make the workspace root absolute without touching symlinks.
fn lexical_absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        normalize_components(path)
    } else {
        let base = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"));
        normalize_components(&base.join(path))
    }
}

/// Lexical join of `rel` under `root`. Returns the resolved path and whether
/// the path escaped the root through `..` components.
fn resolve_relative(root: &Path, rel: &Path) -> (PathBuf, bool) {
    let mut out = root.to_path_buf();
    let mut escaped = false;
    for comp in rel.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                if out == *root || !out.pop() {
                    escaped = true;
                }
                if !out.starts_with(root) {
                    escaped = true;
                }
            }
            Component::Normal(seg) => out.push(seg),
            Component::RootDir | Component::Prefix(_) => escaped = true,
        }
    }
    (out, escaped)
}

fn normalize_components(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Walk each ancestor from `path` down to `root`, reporting any symlink found.
/// Errors are treated conservatively as a potential symlink.
fn has_symlink_in_chain(path: &Path, root: &Path) -> bool {
    let mut current = path.to_path_buf();
    loop {
        if !current.starts_with(root) {
            break;
        }
        match std::fs::symlink_metadata(&current) {
            Ok(meta) => {
                if meta.file_type().is_symlink() {
                    return true;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(_) => return true,
        }
        if current == *root {
            break;
        }
        if !current.pop() {
            break;
        }
    }
    false
}
