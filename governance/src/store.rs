//! Append-only persistence for governance artifacts.
//!
//! Dual storage: structured columns for query plus a `full_json` snapshot column
//! for audit replay. All writes are inserts; updates are never permitted.

use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::params;

use crate::models::{ChangePlan, ChangeSet, GovernanceApproval, GovernanceDecision, Verdict};
use crate::GovernanceError;

pub struct GovernanceStore {
    db: Arc<Mutex<rusqlite::Connection>>,
}

impl GovernanceStore {
    /// Opens or creates the database and tables.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, GovernanceError> {
        let conn = rusqlite::Connection::open(path.as_ref())
            .map_err(|e| GovernanceError::Storage(e.to_string()))?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS governance_plans (
                id TEXT PRIMARY KEY,
                intent TEXT NOT NULL,
                objective TEXT NOT NULL,
                risk_level_proposed TEXT NOT NULL,
                risk_level_effective TEXT,
                created_by TEXT NOT NULL,
                created_at TEXT NOT NULL,
                run_id TEXT,
                full_json TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS governance_changesets (
                id TEXT PRIMARY KEY,
                plan_id TEXT NOT NULL,
                checksum TEXT NOT NULL,
                generated_by TEXT NOT NULL,
                generated_at TEXT NOT NULL,
                full_json TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS governance_decisions (
                id TEXT PRIMARY KEY,
                plan_id TEXT NOT NULL,
                changeset_id TEXT NOT NULL,
                verdict TEXT NOT NULL,
                risk_level_effective TEXT NOT NULL,
                policy_snapshot_hash TEXT NOT NULL,
                evaluated_at TEXT NOT NULL,
                evaluator TEXT NOT NULL,
                full_json TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS governance_approvals (
                id TEXT PRIMARY KEY,
                plan_id TEXT NOT NULL,
                decision_id TEXT NOT NULL,
                approved_by TEXT NOT NULL,
                approved_at TEXT NOT NULL,
                full_json TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_gov_changesets_plan ON governance_changesets(plan_id);
            CREATE INDEX IF NOT EXISTS idx_gov_decisions_plan ON governance_decisions(plan_id);
            CREATE INDEX IF NOT EXISTS idx_gov_approvals_plan ON governance_approvals(plan_id);
            "#,
        )
        .map_err(|e| GovernanceError::Storage(e.to_string()))?;
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn save_plan(&self, plan: &ChangePlan) -> Result<(), GovernanceError> {
        let full_json = serde_json::to_string(plan)?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO governance_plans (id, intent, objective, risk_level_proposed, risk_level_effective, created_by, created_at, run_id, full_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                plan.id,
                plan.intent,
                plan.objective,
                plan.risk_level_proposed.as_str(),
                plan.risk_level_effective.map(|r| r.as_str()),
                plan.created_by,
                plan.created_at.to_rfc3339(),
                plan.run_id,
                full_json,
            ],
        )
        .map_err(|e| GovernanceError::Storage(e.to_string()))?;
        Ok(())
    }

    pub fn get_plan(&self, plan_id: &str) -> Result<Option<ChangePlan>, GovernanceError> {
        self.get_full_json("governance_plans", "id", plan_id)
    }

    pub fn list_plans(
        &self,
        created_by: Option<&str>,
        risk_level: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ChangePlan>, GovernanceError> {
        let mut query = "SELECT full_json FROM governance_plans WHERE 1=1".to_string();
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if let Some(by) = created_by {
            query.push_str(" AND created_by = ?");
            args.push(Box::new(by.to_string()));
        }
        if let Some(risk) = risk_level {
            query.push_str(" AND risk_level_effective = ?");
            args.push(Box::new(risk.to_string()));
        }
        query.push_str(" ORDER BY created_at DESC LIMIT ?");
        args.push(Box::new(limit as i64));
        self.query_full_json(&query, &args)
    }

    pub fn save_changeset(&self, changeset: &ChangeSet) -> Result<(), GovernanceError> {
        let full_json = serde_json::to_string(changeset)?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO governance_changesets (id, plan_id, checksum, generated_by, generated_at, full_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                changeset.id,
                changeset.plan_id,
                changeset.checksum,
                changeset.generated_by,
                changeset.generated_at.to_rfc3339(),
                full_json,
            ],
        )
        .map_err(|e| GovernanceError::Storage(e.to_string()))?;
        Ok(())
    }

    pub fn get_changeset(&self, changeset_id: &str) -> Result<Option<ChangeSet>, GovernanceError> {
        self.get_full_json("governance_changesets", "id", changeset_id)
    }

    /// Latest changeset generated for a plan.
    pub fn get_changeset_for_plan(
        &self,
        plan_id: &str,
    ) -> Result<Option<ChangeSet>, GovernanceError> {
        let args: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(plan_id.to_string())];
        let rows: Vec<ChangeSet> = self.query_full_json(
            "SELECT full_json FROM governance_changesets WHERE plan_id = ? ORDER BY generated_at DESC LIMIT 1",
            &args,
        )?;
        Ok(rows.into_iter().next())
    }

    pub fn save_decision(&self, decision: &GovernanceDecision) -> Result<(), GovernanceError> {
        let full_json = serde_json::to_string(decision)?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO governance_decisions (id, plan_id, changeset_id, verdict, risk_level_effective, policy_snapshot_hash, evaluated_at, evaluator, full_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                decision.id,
                decision.plan_id,
                decision.changeset_id,
                decision.verdict.as_str(),
                decision.risk_level_effective.as_str(),
                decision.policy_snapshot_hash,
                decision.evaluated_at.to_rfc3339(),
                decision.evaluator,
                full_json,
            ],
        )
        .map_err(|e| GovernanceError::Storage(e.to_string()))?;
        Ok(())
    }

    pub fn get_decision(
        &self,
        decision_id: &str,
    ) -> Result<Option<GovernanceDecision>, GovernanceError> {
        self.get_full_json("governance_decisions", "id", decision_id)
    }

    /// Latest decision for a plan.
    pub fn get_decision_for_plan(
        &self,
        plan_id: &str,
    ) -> Result<Option<GovernanceDecision>, GovernanceError> {
        let args: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(plan_id.to_string())];
        let rows: Vec<GovernanceDecision> = self.query_full_json(
            "SELECT full_json FROM governance_decisions WHERE plan_id = ? ORDER BY evaluated_at DESC LIMIT 1",
            &args,
        )?;
        Ok(rows.into_iter().next())
    }

    pub fn list_decisions(
        &self,
        verdict: Option<Verdict>,
        limit: usize,
    ) -> Result<Vec<GovernanceDecision>, GovernanceError> {
        let mut query = "SELECT full_json FROM governance_decisions WHERE 1=1".to_string();
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if let Some(v) = verdict {
            query.push_str(" AND verdict = ?");
            args.push(Box::new(v.as_str().to_string()));
        }
        query.push_str(" ORDER BY evaluated_at DESC LIMIT ?");
        args.push(Box::new(limit as i64));
        self.query_full_json(&query, &args)
    }

    pub fn save_approval(&self, approval: &GovernanceApproval) -> Result<(), GovernanceError> {
        let full_json = serde_json::to_string(approval)?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO governance_approvals (id, plan_id, decision_id, approved_by, approved_at, full_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                approval.id,
                approval.plan_id,
                approval.decision_id,
                approval.approved_by,
                approval.approved_at.to_rfc3339(),
                full_json,
            ],
        )
        .map_err(|e| GovernanceError::Storage(e.to_string()))?;
        Ok(())
    }

    pub fn get_approval_for_plan(
        &self,
        plan_id: &str,
    ) -> Result<Option<GovernanceApproval>, GovernanceError> {
        let args: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(plan_id.to_string())];
        let rows: Vec<GovernanceApproval> = self.query_full_json(
            "SELECT full_json FROM governance_approvals WHERE plan_id = ? ORDER BY approved_at DESC LIMIT 1",
            &args,
        )?;
        Ok(rows.into_iter().next())
    }

    pub fn plan_has_approval(&self, plan_id: &str) -> Result<bool, GovernanceError> {
        Ok(self.get_approval_for_plan(plan_id)?.is_some())
    }

    /// Complete governance record for a plan: plan, latest changeset, latest
    /// decision and latest approval, any of which may be absent.
    pub fn get_full_governance_record(
        &self,
        plan_id: &str,
    ) -> Result<GovernanceRecord, GovernanceError> {
        Ok(GovernanceRecord {
            plan: self.get_plan(plan_id)?,
            changeset: self.get_changeset_for_plan(plan_id)?,
            decision: self.get_decision_for_plan(plan_id)?,
            approval: self.get_approval_for_plan(plan_id)?,
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, rusqlite::Connection>, GovernanceError> {
        self.db
            .lock()
            .map_err(|_| GovernanceError::Storage("lock poisoned".to_string()))
    }

    fn get_full_json<T: serde::de::DeserializeOwned>(
        &self,
        table: &str,
        key: &str,
        value: &str,
    ) -> Result<Option<T>, GovernanceError> {
        let conn = self.lock()?;
        let query = format!("SELECT full_json FROM {table} WHERE {key} = ?1");
        let mut stmt = conn
            .prepare(&query)
            .map_err(|e| GovernanceError::Storage(e.to_string()))?;
        let mut rows = stmt
            .query(params![value])
            .map_err(|e| GovernanceError::Storage(e.to_string()))?;
        let row = match rows.next().map_err(|e| GovernanceError::Storage(e.to_string()))? {
            Some(r) => r,
            None => return Ok(None),
        };
        let json: String = row.get(0).map_err(|e| GovernanceError::Storage(e.to_string()))?;
        Ok(Some(serde_json::from_str(&json)?))
    }

    fn query_full_json<T: serde::de::DeserializeOwned>(
        &self,
        query: &str,
        args: &[Box<dyn rusqlite::ToSql>],
    ) -> Result<Vec<T>, GovernanceError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(query)
            .map_err(|e| GovernanceError::Storage(e.to_string()))?;
        let params: Vec<&dyn rusqlite::ToSql> = args.iter().map(|b| b.as_ref()).collect();
        let rows = stmt
            .query_map(params.as_slice(), |row| row.get::<_, String>(0))
            .map_err(|e| GovernanceError::Storage(e.to_string()))?;
        let mut out = Vec::new();
        for row in rows {
            let json = row.map_err(|e| GovernanceError::Storage(e.to_string()))?;
            out.push(serde_json::from_str(&json)?);
        }
        Ok(out)
    }
}

/// Full audit record for a plan.
pub struct GovernanceRecord {
    pub plan: Option<ChangePlan>,
    pub changeset: Option<ChangeSet>,
    pub decision: Option<GovernanceDecision>,
    pub approval: Option<GovernanceApproval>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        generate_approval_id, generate_changeset_id, generate_decision_id, generate_plan_id,
        FileChange, Operation, RiskLevel,
    };
    use chrono::Utc;

    fn store() -> (GovernanceStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = GovernanceStore::new(dir.path().join("gov.db")).unwrap();
        (store, dir)
    }

    fn sample_plan() -> ChangePlan {
        ChangePlan {
            id: generate_plan_id(),
            intent: "fix bug".to_string(),
            objective: "root cause".to_string(),
            rationale: "test".to_string(),
            affected_paths: vec!["src/lib.rs".to_string()],
            dependencies: vec![],
            risk_level_proposed: RiskLevel::Low,
            risk_level_effective: Some(RiskLevel::Medium),
            risk_escalation_reason: None,
            rollback_plan: "git revert".to_string(),
            verification_plan: "run tests".to_string(),
            health_checks: vec![],
            policy_refs: vec![],
            created_by: "planner".to_string(),
            created_at: Utc::now(),
            confidence: 0.85,
            run_id: None,
        }
    }

    #[test]
    fn plan_roundtrip_and_filters() {
        let (store, _dir) = store();
        let plan = sample_plan();
        store.save_plan(&plan).unwrap();

        let loaded = store.get_plan(&plan.id).unwrap().unwrap();
        assert_eq!(loaded.intent, "fix bug");
        assert_eq!(loaded.risk_level_effective, Some(RiskLevel::Medium));

        let by_creator = store.list_plans(Some("planner"), None, 10).unwrap();
        assert_eq!(by_creator.len(), 1);
        let by_risk = store.list_plans(None, Some("high"), 10).unwrap();
        assert!(by_risk.is_empty());
    }

    #[test]
    fn changeset_for_plan_returns_latest() {
        let (store, _dir) = store();
        let plan = sample_plan();
        store.save_plan(&plan).unwrap();

        for content in ["v1", "v2"] {
            let mut cs = ChangeSet {
                id: generate_changeset_id(),
                plan_id: plan.id.clone(),
                changes: vec![FileChange {
                    operation: Operation::Update,
                    path: "src/lib.rs".to_string(),
                    old_content: Some("x".to_string()),
                    new_content: Some(content.to_string()),
                    diff_unified: None,
                    line_count_delta: 0,
                    size_bytes: 2,
                }],
                checksum: String::new(),
                generated_by: "planner".to_string(),
                generated_at: Utc::now() + chrono::Duration::milliseconds(if content == "v2" { 10 } else { 0 }),
            };
            cs.compute_checksum();
            store.save_changeset(&cs).unwrap();
        }

        let latest = store.get_changeset_for_plan(&plan.id).unwrap().unwrap();
        assert_eq!(latest.changes[0].new_content.as_deref(), Some("v2"));
        assert!(latest.verify_checksum());
    }

    #[test]
    fn full_record_aggregates_everything() {
        let (store, _dir) = store();
        let plan = sample_plan();
        store.save_plan(&plan).unwrap();

        let mut cs = ChangeSet {
            id: generate_changeset_id(),
            plan_id: plan.id.clone(),
            changes: vec![],
            checksum: String::new(),
            generated_by: "planner".to_string(),
            generated_at: Utc::now(),
        };
        cs.compute_checksum();
        store.save_changeset(&cs).unwrap();

        let decision = GovernanceDecision {
            id: generate_decision_id(),
            plan_id: plan.id.clone(),
            changeset_id: cs.id.clone(),
            verdict: Verdict::NeedApproval,
            reasons: vec!["risk".to_string()],
            violated_policies: vec![],
            required_actions: vec![],
            risk_level_effective: RiskLevel::High,
            policy_snapshot_hash: "abc".to_string(),
            agent_source_hash: "unknown".to_string(),
            projection_hash: None,
            writegate_version: "1.0.0".to_string(),
            evaluated_at: Utc::now(),
            evaluator: "writegate_engine".to_string(),
        };
        store.save_decision(&decision).unwrap();

        assert!(!store.plan_has_approval(&plan.id).unwrap());
        let approval = GovernanceApproval {
            id: generate_approval_id(),
            plan_id: plan.id.clone(),
            decision_id: decision.id.clone(),
            approved_by: "operator".to_string(),
            approved_at: Utc::now(),
            approval_notes: Some("lgtm".to_string()),
        };
        store.save_approval(&approval).unwrap();
        assert!(store.plan_has_approval(&plan.id).unwrap());

        let record = store.get_full_governance_record(&plan.id).unwrap();
        assert!(record.plan.is_some());
        assert!(record.changeset.is_some());
        assert_eq!(record.decision.unwrap().verdict, Verdict::NeedApproval);
        assert_eq!(record.approval.unwrap().approved_by, "operator");
    }

    #[test]
    fn list_decisions_filters_by_verdict() {
        let (store, _dir) = store();
        for (i, verdict) in [Verdict::Allow, Verdict::Deny].iter().enumerate() {
            let decision = GovernanceDecision {
                id: generate_decision_id(),
                plan_id: format!("plan_{i}"),
                changeset_id: format!("cs_{i}"),
                verdict: *verdict,
                reasons: vec![],
                violated_policies: vec![],
                required_actions: vec![],
                risk_level_effective: RiskLevel::Low,
                policy_snapshot_hash: "h".to_string(),
                agent_source_hash: "unknown".to_string(),
                projection_hash: None,
                writegate_version: "1.0.0".to_string(),
                evaluated_at: Utc::now(),
                evaluator: "writegate_engine".to_string(),
            };
            store.save_decision(&decision).unwrap();
        }

        let denies = store.list_decisions(Some(Verdict::Deny), 10).unwrap();
        assert_eq!(denies.len(), 1);
        let all = store.list_decisions(None, 10).unwrap();
        assert_eq!(all.len(), 2);
    }
}
