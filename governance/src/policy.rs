//! Policy file loading.
//!
//! The policy file is YAML and may contain multiple documents separated by `---`;
//! documents are merged in order (later keys win). A SHA-256 over the raw file
//! bytes is recorded with every decision as `policy_snapshot_hash`.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_yaml::Value;
use sha2::{Digest, Sha256};

#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("policies not found: {0}")]
    NotFound(PathBuf),
    #[error("read policies: {0}")]
    Io(#[from] std::io::Error),
    #[error("parse policies: {0}")]
    Parse(#[from] serde_yaml::Error),
}

/// Merged policy document plus its snapshot hash.
#[derive(Clone, Debug)]
pub struct PolicySet {
    path: PathBuf,
    merged: serde_yaml::Mapping,
    snapshot_hash: String,
}

impl PolicySet {
    pub fn load(path: &Path) -> Result<Self, PolicyError> {
        if !path.exists() {
            return Err(PolicyError::NotFound(path.to_path_buf()));
        }
        let content = std::fs::read_to_string(path)?;

        let mut merged = serde_yaml::Mapping::new();
        for doc in serde_yaml::Deserializer::from_str(&content) {
            let value = Value::deserialize(doc)?;
            if let Value::Mapping(map) = value {
                for (k, v) in map {
                    merged.insert(k, v);
                }
            }
        }

        let mut hasher = Sha256::new();
        hasher.update(content.as_bytes());
        let snapshot_hash = format!("{:x}", hasher.finalize());

        Ok(Self {
            path: path.to_path_buf(),
            merged,
            snapshot_hash,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn snapshot_hash(&self) -> &str {
        &self.snapshot_hash
    }

    /// `forbidden_paths` list, empty when absent.
    pub fn forbidden_paths(&self) -> Vec<String> {
        self.string_list("forbidden_paths")
    }

    /// `allowed_paths` list, empty when absent.
    pub fn allowed_paths(&self) -> Vec<String> {
        self.string_list("allowed_paths")
    }

    /// `writegate_rules.triggers[].path_matches`, each entry flattened to a
    /// pattern list (single string accepted).
    pub fn trigger_patterns(&self) -> Vec<Vec<String>> {
        let mut out = Vec::new();
        let rules = match self.merged.get(Value::from("writegate_rules")) {
            Some(Value::Mapping(m)) => m,
            _ => return out,
        };
        let triggers = match rules.get(Value::from("triggers")) {
            Some(Value::Sequence(s)) => s,
            _ => return out,
        };
        for trigger in triggers {
            let Value::Mapping(m) = trigger else { continue };
            match m.get(Value::from("path_matches")) {
                Some(Value::String(s)) => out.push(vec![s.clone()]),
                Some(Value::Sequence(seq)) => {
                    let patterns: Vec<String> = seq
                        .iter()
                        .filter_map(|v| v.as_str().map(str::to_string))
                        .collect();
                    if !patterns.is_empty() {
                        out.push(patterns);
                    }
                }
                _ => {}
            }
        }
        out
    }

    fn string_list(&self, key: &str) -> Vec<String> {
        match self.merged.get(Value::from(key)) {
            Some(Value::Sequence(seq)) => seq
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_policy(content: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("default.yaml");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(content.as_bytes()).unwrap();
        (dir, path)
    }

    #[test]
    fn loads_and_merges_multiple_documents() {
        let (_dir, path) = write_policy(
            "forbidden_paths:\n  - \".env\"\n---\nwritegate_rules:\n  triggers:\n    - path_matches: \"**/migrations/*.py\"\n    - path_matches:\n        - \"agent/**\"\n        - \"*.lock\"\n",
        );
        let policies = PolicySet::load(&path).unwrap();
        assert_eq!(policies.forbidden_paths(), vec![".env".to_string()]);
        let triggers = policies.trigger_patterns();
        assert_eq!(triggers.len(), 2);
        assert_eq!(triggers[0], vec!["**/migrations/*.py".to_string()]);
        assert_eq!(triggers[1].len(), 2);
    }

    #[test]
    fn snapshot_hash_tracks_content() {
        let (_dir, path) = write_policy("forbidden_paths: []\n");
        let a = PolicySet::load(&path).unwrap().snapshot_hash().to_string();
        std::fs::write(&path, "forbidden_paths: [\".env\"]\n").unwrap();
        let b = PolicySet::load(&path).unwrap().snapshot_hash().to_string();
        assert_ne!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = PolicySet::load(&dir.path().join("nope.yaml")).unwrap_err();
        assert!(matches!(err, PolicyError::NotFound(_)));
    }
}
