//! Main coordination layer: intent in, plan + changeset out, ready for
//! WriteGate. The Planner decides the workflow; an injected reasoner (if any)
//! only fills in reasoning text.

use chrono::Utc;
use tracing::debug;

use governance::{
    generate_changeset_id, generate_plan_id, ChangePlan, ChangeSet, FileChange, Operation,
    RiskLevel,
};

use crate::decomposer::{DecomposedIntent, IntentDecomposer};
use crate::risk_shaper::RiskShaper;
use crate::state_machine::{
    create_initial_context, PlannerState, PlannerStateMachine, StateContext, TransitionReason,
};
use crate::PlannerError;

/// Optional LLM reasoning hook. Receives the intent and the decomposition,
/// returns free-text rationale.
pub type Reasoner = Box<dyn Fn(&str, &DecomposedIntent) -> String + Send + Sync>;

/// Output of [`PlannerOrchestrator::create_plan_from_intent`].
pub struct PlanBundle {
    pub context: StateContext,
    pub decomposed: DecomposedIntent,
    pub plan: ChangePlan,
    pub changeset: ChangeSet,
}

pub struct PlannerOrchestrator {
    state_machine: PlannerStateMachine,
    decomposer: IntentDecomposer,
    risk_shaper: RiskShaper,
    reasoner: Option<Reasoner>,
}

impl Default for PlannerOrchestrator {
    fn default() -> Self {
        Self::new()
    }
}

impl PlannerOrchestrator {
    pub fn new() -> Self {
        Self {
            state_machine: PlannerStateMachine::new(),
            decomposer: IntentDecomposer::new(),
            risk_shaper: RiskShaper::new(),
            reasoner: None,
        }
    }

    pub fn with_reasoner(mut self, reasoner: Reasoner) -> Self {
        self.reasoner = Some(reasoner);
        self
    }

    /// Convert user intent to a ChangePlan + placeholder ChangeSet, driving the
    /// context through `INTENT -> (ANALYSIS) -> PLAN_GENERATION ->
    /// GOVERNANCE_CHECK`.
    pub fn create_plan_from_intent(
        &self,
        user_intent: &str,
        created_by: &str,
    ) -> Result<PlanBundle, PlannerError> {
        let mut context = create_initial_context(user_intent);
        let decomposed = self.decomposer.decompose(user_intent);
        debug!(intent_type = decomposed.intent_type.as_str(), "intent decomposed");

        if decomposed.needs_analysis {
            context = self.state_machine.transition(
                context,
                PlannerState::Analysis,
                TransitionReason::NeedInvestigation,
            )?;
            context.analysis_data = serde_json::json!({
                "requirements": decomposed.analysis_requirements,
                "tools": decomposed.analysis_tools,
                "affected_components": decomposed.affected_components,
            });
        }
        context = self.state_machine.transition(
            context,
            PlannerState::PlanGeneration,
            TransitionReason::SufficientInfo,
        )?;

        let plan = self.generate_change_plan(&context, &decomposed, created_by);
        context.change_plan_id = Some(plan.id.clone());

        let changeset = self.generate_changeset_placeholder(&plan, created_by);
        context.changeset_id = Some(changeset.id.clone());

        context = self.state_machine.transition(
            context,
            PlannerState::GovernanceCheck,
            TransitionReason::PlanReady,
        )?;

        Ok(PlanBundle {
            context,
            decomposed,
            plan,
            changeset,
        })
    }

    /// Errors unless `tool_name` is whitelisted for the context's state.
    pub fn validate_tool_usage(
        &self,
        context: &StateContext,
        tool_name: &str,
    ) -> Result<(), PlannerError> {
        if !self
            .state_machine
            .is_tool_allowed(context.current_state, tool_name)
        {
            return Err(PlannerError::ToolNotAllowed {
                tool: tool_name.to_string(),
                state: context.current_state.as_str().to_string(),
                allowed: self
                    .state_machine
                    .allowed_tools(context.current_state)
                    .iter()
                    .map(|s| s.to_string())
                    .collect(),
            });
        }
        Ok(())
    }

    pub fn workflow_summary(&self, context: &StateContext) -> serde_json::Value {
        serde_json::json!({
            "current_state": context.current_state.as_str(),
            "user_intent": context.user_intent,
            "state_history": context.state_history,
            "change_plan_id": context.change_plan_id,
            "changeset_id": context.changeset_id,
            "decision_id": context.decision_id,
            "is_terminal": self.state_machine.is_terminal_state(context.current_state),
        })
    }

    fn generate_change_plan(
        &self,
        context: &StateContext,
        decomposed: &DecomposedIntent,
        created_by: &str,
    ) -> ChangePlan {
        let affected_paths = if decomposed.affected_components.is_empty() {
            vec!["<to_be_determined>".to_string()]
        } else {
            decomposed.affected_components.clone()
        };

        let rollback_plan = self.risk_shaper.generate_rollback_plan(&affected_paths);
        let verification_plan = self.risk_shaper.generate_verification_plan(&affected_paths);
        let health_checks = self.risk_shaper.generate_health_checks(&affected_paths);

        let risk_level = match decomposed.estimated_risk.as_str() {
            "low" => RiskLevel::Low,
            "high" => RiskLevel::High,
            _ => RiskLevel::Medium,
        };

        let rationale = match &self.reasoner {
            Some(reasoner) => reasoner(&context.user_intent, decomposed),
            None => format!(
                "Intent type: {}; Affected: {}",
                decomposed.intent_type.as_str(),
                decomposed.affected_components.join(", ")
            ),
        };

        ChangePlan {
            id: generate_plan_id(),
            intent: context.user_intent.clone(),
            objective: decomposed.suggested_approach.clone(),
            rationale,
            affected_paths,
            dependencies: Vec::new(),
            risk_level_proposed: risk_level,
            risk_level_effective: None,
            risk_escalation_reason: None,
            rollback_plan,
            verification_plan,
            health_checks,
            policy_refs: vec!["planner_generated".to_string()],
            created_by: created_by.to_string(),
            created_at: Utc::now(),
            confidence: 0.85,
            run_id: None,
        }
    }

    /// Placeholder changeset: a single UPDATE against the first affected path.
    /// A reasoner-backed generator replaces the contents later in the flow.
    fn generate_changeset_placeholder(&self, plan: &ChangePlan, generated_by: &str) -> ChangeSet {
        let path = plan
            .affected_paths
            .first()
            .cloned()
            .unwrap_or_else(|| "placeholder.txt".to_string());

        let mut changeset = ChangeSet {
            id: generate_changeset_id(),
            plan_id: plan.id.clone(),
            changes: vec![FileChange {
                operation: Operation::Update,
                path,
                old_content: Some("# Placeholder".to_string()),
                new_content: Some("# Placeholder (to be generated)".to_string()),
                diff_unified: None,
                line_count_delta: 0,
                size_bytes: 0,
            }],
            checksum: String::new(),
            generated_by: generated_by.to_string(),
            generated_at: Utc::now(),
        };
        changeset.compute_checksum();
        changeset
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bug_fix_flows_through_analysis_to_governance_check() {
        let orchestrator = PlannerOrchestrator::new();
        let bundle = orchestrator
            .create_plan_from_intent("Fix memory conflict resolution bug", "planner")
            .unwrap();

        assert_eq!(bundle.context.current_state, PlannerState::GovernanceCheck);
        let states: Vec<&str> = bundle
            .context
            .state_history
            .iter()
            .map(|t| t.to.as_str())
            .collect();
        assert_eq!(states, vec!["analysis", "plan_generation", "governance_check"]);
        assert_eq!(bundle.plan.confidence, 0.85);
        assert_eq!(bundle.plan.policy_refs, vec!["planner_generated"]);
        assert!(bundle.changeset.verify_checksum());
        assert_eq!(bundle.changeset.plan_id, bundle.plan.id);
    }

    #[test]
    fn docs_update_skips_analysis() {
        let orchestrator = PlannerOrchestrator::new();
        let bundle = orchestrator
            .create_plan_from_intent("update docs for setup", "planner")
            .unwrap();
        let states: Vec<&str> = bundle
            .context
            .state_history
            .iter()
            .map(|t| t.to.as_str())
            .collect();
        assert_eq!(states, vec!["plan_generation", "governance_check"]);
        assert_eq!(bundle.plan.risk_level_proposed, RiskLevel::Low);
    }

    #[test]
    fn safety_fields_are_always_present() {
        let orchestrator = PlannerOrchestrator::new();
        let bundle = orchestrator
            .create_plan_from_intent("fix bug in memory facts", "planner")
            .unwrap();
        assert!(!bundle.plan.rollback_plan.is_empty());
        assert!(!bundle.plan.verification_plan.is_empty());
    }

    #[test]
    fn reasoner_fills_rationale() {
        let orchestrator = PlannerOrchestrator::new()
            .with_reasoner(Box::new(|intent, _| format!("reasoned: {intent}")));
        let bundle = orchestrator
            .create_plan_from_intent("fix bug in api", "planner")
            .unwrap();
        assert!(bundle.plan.rationale.starts_with("reasoned: "));
    }

    #[test]
    fn tool_validation_follows_state() {
        let orchestrator = PlannerOrchestrator::new();
        let bundle = orchestrator
            .create_plan_from_intent("fix bug in api", "planner")
            .unwrap();
        // Context ends in GOVERNANCE_CHECK: only governance tools allowed.
        assert!(orchestrator
            .validate_tool_usage(&bundle.context, "governance.evaluate")
            .is_ok());
        let err = orchestrator
            .validate_tool_usage(&bundle.context, "read_file")
            .unwrap_err();
        assert!(matches!(err, PlannerError::ToolNotAllowed { .. }));
    }
}
