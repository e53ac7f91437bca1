//! WriteGate: the governance judge.
//!
//! Evaluates a plan + changeset against the loaded policies and returns a
//! verdict with accumulated reasons, violated policies and required actions.
//! WriteGate never applies changes; the Host Executor does that, and only for
//! `Verdict::Allow`.

use std::path::Path;

use chrono::Utc;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::models::{
    generate_decision_id, ChangePlan, ChangeSet, GovernanceDecision, Operation, RiskLevel, Verdict,
};
use crate::paths::match_pattern;
use crate::policy::{PolicyError, PolicySet};

pub const WRITEGATE_VERSION: &str = "1.0.0";

/// File patterns that force at least medium risk.
const CRITICAL_PATTERNS: &[&str] = &[
    "packages/**/*.py",
    "apps/**/*.py",
    "**/migrations/*.py",
];

/// Patterns that mark a database schema change (at least high risk).
const DB_PATTERNS: &[&str] = &["**/migrations/*.py", "**/schema.sql", "**/alembic/**"];

/// Diff sizes above this line count escalate to high risk.
const LARGE_CHANGE_LINES: usize = 500;

pub struct WriteGate {
    policies: PolicySet,
}

impl WriteGate {
    pub fn new(policies_path: &Path) -> Result<Self, PolicyError> {
        Ok(Self {
            policies: PolicySet::load(policies_path)?,
        })
    }

    pub fn from_policies(policies: PolicySet) -> Self {
        Self { policies }
    }

    pub fn policy_snapshot_hash(&self) -> &str {
        self.policies.snapshot_hash()
    }

    /// Evaluate a plan + changeset. Judges only, never executes.
    pub fn evaluate(
        &self,
        plan: &ChangePlan,
        changeset: &ChangeSet,
        agent_source_hash: Option<&str>,
        projection_hash: Option<&str>,
    ) -> GovernanceDecision {
        // Check 1: forbidden paths are an immediate DENY at critical risk.
        if let Some((path, pattern)) = self.first_forbidden_path(changeset) {
            debug!(path = %path, pattern = %pattern, "forbidden path fast-deny");
            return self.decision(
                plan,
                changeset,
                Verdict::Deny,
                vec![format!("Path '{path}' matches forbidden pattern '{pattern}'")],
                vec!["forbidden_paths".to_string()],
                vec!["Remove forbidden path modifications".to_string()],
                RiskLevel::Critical,
                agent_source_hash,
                projection_hash,
            );
        }

        let mut reasons = Vec::new();
        let required_actions;

        // Check 2: risk escalation (effective >= proposed).
        let (risk_level_effective, escalation_reason) = self.escalate_risk(plan, changeset);
        if let Some(reason) = escalation_reason {
            reasons.push(reason);
        }

        // Check 3: rollback / verification gating.
        let (gating_passed, gating_reasons, gating_actions) = gating_requirements(plan);
        reasons.extend(gating_reasons);
        required_actions = gating_actions;

        // Check 4: trigger rules from the policy file.
        let trigger_reasons = self.trigger_reasons(changeset);
        let requires_approval = !trigger_reasons.is_empty();
        reasons.extend(trigger_reasons);

        let verdict = if !gating_passed || risk_level_effective >= RiskLevel::High || requires_approval
        {
            Verdict::NeedApproval
        } else {
            Verdict::Allow
        };

        self.decision(
            plan,
            changeset,
            verdict,
            reasons,
            Vec::new(),
            required_actions,
            risk_level_effective,
            agent_source_hash,
            projection_hash,
        )
    }

    fn first_forbidden_path(&self, changeset: &ChangeSet) -> Option<(String, String)> {
        let forbidden = self.policies.forbidden_paths();
        for change in &changeset.changes {
            for pattern in &forbidden {
                if match_pattern(&change.path, pattern) {
                    return Some((change.path.clone(), pattern.clone()));
                }
            }
        }
        None
    }

    fn escalate_risk(&self, plan: &ChangePlan, changeset: &ChangeSet) -> (RiskLevel, Option<String>) {
        let mut risk = plan.risk_level_proposed;
        let mut notes = Vec::new();
        let policy_file = self.policies.path().to_string_lossy().replace('\\', "/");

        for change in &changeset.changes {
            for pattern in CRITICAL_PATTERNS {
                if match_pattern(&change.path, pattern) && risk < RiskLevel::Medium {
                    risk = RiskLevel::Medium;
                    notes.push(format!(
                        "Critical file pattern '{pattern}' matched by '{}'",
                        change.path
                    ));
                }
            }
            if (change.path == policy_file || policy_file.ends_with(&change.path))
                && risk < RiskLevel::Medium
            {
                risk = RiskLevel::Medium;
                notes.push(format!("Policy file modified: '{}'", change.path));
            }
        }

        let total_lines = changeset.total_lines_changed();
        if total_lines > LARGE_CHANGE_LINES && risk < RiskLevel::High {
            risk = RiskLevel::High;
            notes.push(format!("Large change ({total_lines} lines)"));
        }

        let delete_count = changeset
            .changes
            .iter()
            .filter(|c| c.operation == Operation::Delete)
            .count();
        if delete_count > 0 && risk < RiskLevel::Medium {
            risk = RiskLevel::Medium;
            notes.push(format!("{delete_count} file deletion(s)"));
        }

        for change in &changeset.changes {
            for pattern in DB_PATTERNS {
                if match_pattern(&change.path, pattern) && risk < RiskLevel::High {
                    risk = RiskLevel::High;
                    notes.push("Database schema modification".to_string());
                }
            }
        }

        if risk > plan.risk_level_proposed {
            let joined = notes.join("; ");
            (risk, Some(format!("Risk escalated to {}: {joined}", risk.as_str())))
        } else {
            (risk, None)
        }
    }

    fn trigger_reasons(&self, changeset: &ChangeSet) -> Vec<String> {
        let mut reasons = Vec::new();
        for patterns in self.policies.trigger_patterns() {
            for change in &changeset.changes {
                for pattern in &patterns {
                    if match_pattern(&change.path, pattern) {
                        reasons.push(format!(
                            "WriteGate trigger: path '{}' matches '{pattern}'",
                            change.path
                        ));
                    }
                }
            }
        }
        reasons
    }

    #[allow(clippy::too_many_arguments)]
    fn decision(
        &self,
        plan: &ChangePlan,
        changeset: &ChangeSet,
        verdict: Verdict,
        reasons: Vec<String>,
        violated_policies: Vec<String>,
        required_actions: Vec<String>,
        risk_level_effective: RiskLevel,
        agent_source_hash: Option<&str>,
        projection_hash: Option<&str>,
    ) -> GovernanceDecision {
        GovernanceDecision {
            id: generate_decision_id(),
            plan_id: plan.id.clone(),
            changeset_id: changeset.id.clone(),
            verdict,
            reasons,
            violated_policies,
            required_actions,
            risk_level_effective,
            policy_snapshot_hash: self.policies.snapshot_hash().to_string(),
            agent_source_hash: agent_source_hash.unwrap_or("unknown").to_string(),
            projection_hash: projection_hash.map(str::to_string),
            writegate_version: WRITEGATE_VERSION.to_string(),
            evaluated_at: Utc::now(),
            evaluator: "writegate_engine".to_string(),
        }
    }
}

/// Missing rollback/verification plans gate the change; medium+ risk also wants
/// health checks. Returns `(passed, reasons, required_actions)`.
fn gating_requirements(plan: &ChangePlan) -> (bool, Vec<String>, Vec<String>) {
    let mut reasons = Vec::new();
    let mut actions = Vec::new();

    if plan.rollback_plan.trim().is_empty() {
        reasons.push("Missing rollback plan".to_string());
        actions.push("Add rollback plan".to_string());
    }
    if plan.verification_plan.trim().is_empty() {
        reasons.push("Missing verification plan".to_string());
        actions.push("Add verification plan".to_string());
    }
    if plan.risk_level_proposed >= RiskLevel::Medium && plan.health_checks.is_empty() {
        reasons.push("No health checks defined for MEDIUM+ risk change".to_string());
        actions.push("Add health checks".to_string());
    }

    (reasons.is_empty(), reasons, actions)
}

/// SHA-256 over sorted `relative_path:file_sha256` lines of a directory tree.
/// Recorded on decisions so changes to the agent material are auditable.
pub fn compute_agent_source_hash(agent_dir: &Path) -> std::io::Result<String> {
    let mut entries: Vec<(String, String)> = Vec::new();
    collect_file_hashes(agent_dir, agent_dir, &mut entries)?;
    entries.sort();

    let combined = entries
        .iter()
        .map(|(rel, hash)| format!("{rel}:{hash}"))
        .collect::<Vec<_>>()
        .join("\n");

    let mut hasher = Sha256::new();
    hasher.update(combined.as_bytes());
    Ok(format!("{:x}", hasher.finalize()))
}

/// SHA-256 over sorted `file_name:file_sha256` lines of projection files;
/// missing files are skipped.
pub fn compute_projection_hash(projections: &[&Path]) -> std::io::Result<String> {
    let mut sorted: Vec<&Path> = projections.to_vec();
    sorted.sort();

    let mut lines = Vec::new();
    for path in sorted {
        if path.exists() {
            let content = std::fs::read(path)?;
            let mut hasher = Sha256::new();
            hasher.update(&content);
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            lines.push(format!("{name}:{:x}", hasher.finalize()));
        }
    }

    let mut hasher = Sha256::new();
    hasher.update(lines.join("\n").as_bytes());
    Ok(format!("{:x}", hasher.finalize()))
}

fn collect_file_hashes(
    root: &Path,
    dir: &Path,
    out: &mut Vec<(String, String)>,
) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            collect_file_hashes(root, &path, out)?;
        } else if path.is_file() {
            let content = std::fs::read(&path)?;
            let mut hasher = Sha256::new();
            hasher.update(&content);
            let rel = path
                .strip_prefix(root)
                .unwrap_or(&path)
                .to_string_lossy()
                .replace('\\', "/");
            out.push((rel, format!("{:x}", hasher.finalize())));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{generate_changeset_id, generate_plan_id, FileChange};

    fn gate(policy_yaml: &str) -> (tempfile::TempDir, WriteGate) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("default.yaml");
        std::fs::write(&path, policy_yaml).unwrap();
        let gate = WriteGate::new(&path).unwrap();
        (dir, gate)
    }

    fn plan_with(risk: RiskLevel, rollback: &str, verify: &str, health: Vec<String>) -> ChangePlan {
        ChangePlan {
            id: generate_plan_id(),
            intent: "test".to_string(),
            objective: "test objective".to_string(),
            rationale: "because".to_string(),
            affected_paths: vec!["src/lib.rs".to_string()],
            dependencies: vec![],
            risk_level_proposed: risk,
            risk_level_effective: None,
            risk_escalation_reason: None,
            rollback_plan: rollback.to_string(),
            verification_plan: verify.to_string(),
            health_checks: health,
            policy_refs: vec![],
            created_by: "test".to_string(),
            created_at: Utc::now(),
            confidence: 0.9,
            run_id: None,
        }
    }

    fn changeset_for(paths: &[(&str, Operation)]) -> ChangeSet {
        let changes = paths
            .iter()
            .map(|(p, op)| FileChange {
                operation: *op,
                path: p.to_string(),
                old_content: Some("a".to_string()),
                new_content: Some("b".to_string()),
                diff_unified: None,
                line_count_delta: 0,
                size_bytes: 1,
            })
            .collect();
        let mut cs = ChangeSet {
            id: generate_changeset_id(),
            plan_id: "plan_x".to_string(),
            changes,
            checksum: String::new(),
            generated_by: "test".to_string(),
            generated_at: Utc::now(),
        };
        cs.compute_checksum();
        cs
    }

    #[test]
    fn forbidden_path_is_immediate_deny() {
        let (_d, gate) = gate("forbidden_paths:\n  - \".env\"\n");
        let plan = plan_with(RiskLevel::Low, "git revert", "run tests", vec![]);
        let cs = changeset_for(&[(".env", Operation::Update)]);

        let decision = gate.evaluate(&plan, &cs, None, None);
        assert_eq!(decision.verdict, Verdict::Deny);
        assert_eq!(decision.risk_level_effective, RiskLevel::Critical);
        assert_eq!(decision.violated_policies, vec!["forbidden_paths"]);
    }

    #[test]
    fn low_risk_complete_plan_is_allowed() {
        let (_d, gate) = gate("forbidden_paths: []\n");
        let plan = plan_with(RiskLevel::Low, "git revert <commit>", "Run tests", vec![]);
        let cs = changeset_for(&[("docs/readme.md", Operation::Update)]);

        let decision = gate.evaluate(&plan, &cs, Some("hash"), None);
        assert_eq!(decision.verdict, Verdict::Allow);
        assert_eq!(decision.agent_source_hash, "hash");
        assert_eq!(decision.writegate_version, WRITEGATE_VERSION);
    }

    #[test]
    fn missing_rollback_needs_approval() {
        let (_d, gate) = gate("forbidden_paths: []\n");
        let plan = plan_with(RiskLevel::Low, "", "Run tests", vec![]);
        let cs = changeset_for(&[("docs/readme.md", Operation::Update)]);

        let decision = gate.evaluate(&plan, &cs, None, None);
        assert_eq!(decision.verdict, Verdict::NeedApproval);
        assert!(decision.reasons.iter().any(|r| r.contains("rollback")));
        assert!(decision
            .required_actions
            .iter()
            .any(|a| a == "Add rollback plan"));
    }

    #[test]
    fn critical_pattern_escalates_to_medium() {
        let (_d, gate) = gate("forbidden_paths: []\n");
        let plan = plan_with(
            RiskLevel::Low,
            "git revert",
            "Run tests",
            vec!["GET /health returns 200".to_string()],
        );
        let cs = changeset_for(&[("packages/memory/facts.py", Operation::Update)]);

        let decision = gate.evaluate(&plan, &cs, None, None);
        assert_eq!(decision.risk_level_effective, RiskLevel::Medium);
        assert_eq!(decision.verdict, Verdict::Allow);
    }

    #[test]
    fn migration_escalates_to_high_and_needs_approval() {
        let (_d, gate) = gate("forbidden_paths: []\n");
        let plan = plan_with(
            RiskLevel::Low,
            "git revert",
            "Run tests",
            vec!["Database queries succeed".to_string()],
        );
        let cs = changeset_for(&[("app/migrations/0002_add.py", Operation::Update)]);

        let decision = gate.evaluate(&plan, &cs, None, None);
        assert_eq!(decision.risk_level_effective, RiskLevel::High);
        assert_eq!(decision.verdict, Verdict::NeedApproval);
    }

    #[test]
    fn delete_escalates_to_medium() {
        let (_d, gate) = gate("forbidden_paths: []\n");
        let plan = plan_with(
            RiskLevel::Low,
            "git revert",
            "Run tests",
            vec!["GET /health returns 200".to_string()],
        );
        let cs = changeset_for(&[("docs/old.md", Operation::Delete)]);

        let decision = gate.evaluate(&plan, &cs, None, None);
        assert_eq!(decision.risk_level_effective, RiskLevel::Medium);
    }

    #[test]
    fn large_change_escalates_to_high() {
        let (_d, gate) = gate("forbidden_paths: []\n");
        let plan = plan_with(RiskLevel::Low, "git revert", "Run tests", vec![]);
        let big = (0..600).map(|i| format!("line {i}")).collect::<Vec<_>>().join("\n");
        let mut cs = changeset_for(&[("docs/big.md", Operation::Update)]);
        cs.changes[0].new_content = Some(big);
        cs.compute_checksum();

        let decision = gate.evaluate(&plan, &cs, None, None);
        assert_eq!(decision.risk_level_effective, RiskLevel::High);
        assert_eq!(decision.verdict, Verdict::NeedApproval);
    }

    #[test]
    fn trigger_rule_needs_approval() {
        let (_d, gate) = gate(
            "forbidden_paths: []\nwritegate_rules:\n  triggers:\n    - path_matches: \"agent/**\"\n",
        );
        let plan = plan_with(RiskLevel::Low, "git revert", "Run tests", vec![]);
        let cs = changeset_for(&[("agent/policies/extra.yaml", Operation::Update)]);

        let decision = gate.evaluate(&plan, &cs, None, None);
        assert_eq!(decision.verdict, Verdict::NeedApproval);
        assert!(decision.reasons.iter().any(|r| r.contains("WriteGate trigger")));
    }

    #[test]
    fn medium_risk_without_health_checks_needs_approval() {
        let (_d, gate) = gate("forbidden_paths: []\n");
        let plan = plan_with(RiskLevel::Medium, "git revert", "Run tests", vec![]);
        let cs = changeset_for(&[("docs/readme.md", Operation::Update)]);

        let decision = gate.evaluate(&plan, &cs, None, None);
        assert_eq!(decision.verdict, Verdict::NeedApproval);
        assert!(decision.reasons.iter().any(|r| r.contains("health checks")));
    }

    #[test]
    fn source_hashes_are_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("a.md"), "alpha").unwrap();
        std::fs::write(dir.path().join("sub/b.md"), "beta").unwrap();

        let h1 = compute_agent_source_hash(dir.path()).unwrap();
        let h2 = compute_agent_source_hash(dir.path()).unwrap();
        assert_eq!(h1, h2);

        std::fs::write(dir.path().join("a.md"), "changed").unwrap();
        let h3 = compute_agent_source_hash(dir.path()).unwrap();
        assert_ne!(h1, h3);
    }
}
