//! Change models shared by the Planner, WriteGate and the Host Executor.
//!
//! Plans, changesets, decisions and approvals are append-only: updates create new
//! records, never mutate stored ones. The changeset checksum binds producer and
//! consumer; any mismatch is treated as tampering.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Risk level ordering matters: WriteGate escalation only ever raises it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Allow,
    NeedApproval,
    Deny,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Allow => "allow",
            Verdict::NeedApproval => "need_approval",
            Verdict::Deny => "deny",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

/// One file mutation with its precondition content.
///
/// CREATE requires `new_content` and a non-existing target; UPDATE and DELETE
/// require `old_content` to match the current file byte-for-byte.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FileChange {
    pub operation: Operation,
    /// Path relative to the workspace root, forward slashes.
    pub path: String,
    #[serde(default)]
    pub old_content: Option<String>,
    #[serde(default)]
    pub new_content: Option<String>,
    #[serde(default)]
    pub diff_unified: Option<String>,
    #[serde(default)]
    pub line_count_delta: i64,
    #[serde(default)]
    pub size_bytes: u64,
}

impl FileChange {
    /// Lines touched by this change, used for WriteGate size escalation.
    pub fn lines_changed(&self) -> usize {
        let old = self.old_content.as_deref().map(count_lines).unwrap_or(0);
        let new = self.new_content.as_deref().map(count_lines).unwrap_or(0);
        old.max(new)
    }
}

fn count_lines(s: &str) -> usize {
    if s.is_empty() {
        0
    } else {
        s.lines().count()
    }
}

/// Structured description of intent: what files, what risk, how to roll back,
/// how to verify.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChangePlan {
    pub id: String,
    pub intent: String,
    pub objective: String,
    pub rationale: String,
    pub affected_paths: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    pub risk_level_proposed: RiskLevel,
    /// Set by WriteGate, always >= proposed.
    #[serde(default)]
    pub risk_level_effective: Option<RiskLevel>,
    #[serde(default)]
    pub risk_escalation_reason: Option<String>,
    pub rollback_plan: String,
    pub verification_plan: String,
    #[serde(default)]
    pub health_checks: Vec<String>,
    #[serde(default)]
    pub policy_refs: Vec<String>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub confidence: f64,
    #[serde(default)]
    pub run_id: Option<String>,
}

/// Ordered list of [`FileChange`] with a stable checksum, bound to a plan.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChangeSet {
    pub id: String,
    pub plan_id: String,
    pub changes: Vec<FileChange>,
    pub checksum: String,
    pub generated_by: String,
    pub generated_at: DateTime<Utc>,
}

impl ChangeSet {
    /// Stable SHA-256 over the canonicalized change list (operation, path,
    /// old_content, new_content in order). Metadata fields do not participate.
    pub fn canonical_checksum(&self) -> String {
        let mut hasher = Sha256::new();
        for change in &self.changes {
            hasher.update(b"op:");
            hasher.update(serde_json::to_string(&change.operation).unwrap_or_default());
            hasher.update(b"\npath:");
            hasher.update(change.path.as_bytes());
            hasher.update(b"\nold:");
            if let Some(old) = &change.old_content {
                hasher.update(old.as_bytes());
            }
            hasher.update(b"\nnew:");
            if let Some(new) = &change.new_content {
                hasher.update(new.as_bytes());
            }
            hasher.update(b"\n--\n");
        }
        hex_digest(hasher)
    }

    /// Recompute and store the checksum.
    pub fn compute_checksum(&mut self) {
        self.checksum = self.canonical_checksum();
    }

    /// Holds at every producer/consumer boundary; a mismatch is a security fault.
    pub fn verify_checksum(&self) -> bool {
        !self.checksum.is_empty() && self.checksum == self.canonical_checksum()
    }

    pub fn total_lines_changed(&self) -> usize {
        self.changes.iter().map(FileChange::lines_changed).sum()
    }
}

/// WriteGate's verdict plus the audit hashes needed for replay.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GovernanceDecision {
    pub id: String,
    pub plan_id: String,
    pub changeset_id: String,
    pub verdict: Verdict,
    pub reasons: Vec<String>,
    pub violated_policies: Vec<String>,
    pub required_actions: Vec<String>,
    pub risk_level_effective: RiskLevel,
    pub policy_snapshot_hash: String,
    pub agent_source_hash: String,
    #[serde(default)]
    pub projection_hash: Option<String>,
    pub writegate_version: String,
    pub evaluated_at: DateTime<Utc>,
    pub evaluator: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GovernanceApproval {
    pub id: String,
    pub plan_id: String,
    pub decision_id: String,
    pub approved_by: String,
    pub approved_at: DateTime<Utc>,
    #[serde(default)]
    pub approval_notes: Option<String>,
}

fn hex_digest(hasher: Sha256) -> String {
    let bytes = hasher.finalize();
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

fn short_hex_id(prefix: &str) -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    format!("{prefix}_{}", &hex[..12])
}

pub fn generate_plan_id() -> String {
    short_hex_id("plan")
}

pub fn generate_changeset_id() -> String {
    short_hex_id("cs")
}

pub fn generate_decision_id() -> String {
    short_hex_id("dec")
}

pub fn generate_approval_id() -> String {
    short_hex_id("appr")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_changeset() -> ChangeSet {
        let mut cs = ChangeSet {
            id: generate_changeset_id(),
            plan_id: generate_plan_id(),
            changes: vec![FileChange {
                operation: Operation::Update,
                path: "src/main.rs".to_string(),
                old_content: Some("old".to_string()),
                new_content: Some("new".to_string()),
                diff_unified: None,
                line_count_delta: 0,
                size_bytes: 3,
            }],
            checksum: String::new(),
            generated_by: "test".to_string(),
            generated_at: Utc::now(),
        };
        cs.compute_checksum();
        cs
    }

    #[test]
    fn checksum_roundtrip_is_stable() {
        let cs = sample_changeset();
        assert!(cs.verify_checksum());

        let json = serde_json::to_string(&cs).unwrap();
        let replayed: ChangeSet = serde_json::from_str(&json).unwrap();
        assert!(replayed.verify_checksum());
        assert_eq!(replayed.checksum, cs.checksum);
    }

    #[test]
    fn checksum_detects_tampering() {
        let mut cs = sample_changeset();
        cs.changes[0].new_content = Some("tampered".to_string());
        assert!(!cs.verify_checksum());
    }

    #[test]
    fn checksum_ignores_diff_metadata() {
        let mut cs = sample_changeset();
        let before = cs.checksum.clone();
        cs.changes[0].diff_unified = Some("--- a\n+++ b".to_string());
        cs.compute_checksum();
        assert_eq!(before, cs.checksum);
    }

    #[test]
    fn risk_level_is_ordered() {
        assert!(RiskLevel::Low < RiskLevel::Medium);
        assert!(RiskLevel::Medium < RiskLevel::High);
        assert!(RiskLevel::High < RiskLevel::Critical);
    }

    #[test]
    fn empty_checksum_never_verifies() {
        let mut cs = sample_changeset();
        cs.checksum = String::new();
        assert!(!cs.verify_checksum());
    }

    #[test]
    fn id_prefixes() {
        assert!(generate_plan_id().starts_with("plan_"));
        assert!(generate_changeset_id().starts_with("cs_"));
        assert!(generate_decision_id().starts_with("dec_"));
        assert!(generate_approval_id().starts_with("appr_"));
    }
}
