//! Deterministic workflow state machine for a planning request.
//!
//! Flow: `INTENT -> ANALYSIS -> PLAN_GENERATION -> GOVERNANCE_CHECK ->
//! EXECUTION_READY -> COMPLETED`, with `FAILED` reachable from any active
//! state. Each state restricts which tools the Planner may call.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::PlannerError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlannerState {
    Intent,
    Analysis,
    PlanGeneration,
    GovernanceCheck,
    ExecutionReady,
    Completed,
    Failed,
}

impl PlannerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlannerState::Intent => "intent",
            PlannerState::Analysis => "analysis",
            PlannerState::PlanGeneration => "plan_generation",
            PlannerState::GovernanceCheck => "governance_check",
            PlannerState::ExecutionReady => "execution_ready",
            PlannerState::Completed => "completed",
            PlannerState::Failed => "failed",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionReason {
    NeedInvestigation,
    SufficientInfo,
    PlanReady,
    Approved,
    Rejected,
    NeedsRevision,
    ExecutionSuccess,
    UnrecoverableError,
}

impl TransitionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransitionReason::NeedInvestigation => "need_investigation",
            TransitionReason::SufficientInfo => "sufficient_info",
            TransitionReason::PlanReady => "plan_ready",
            TransitionReason::Approved => "approved",
            TransitionReason::Rejected => "rejected",
            TransitionReason::NeedsRevision => "needs_revision",
            TransitionReason::ExecutionSuccess => "execution_success",
            TransitionReason::UnrecoverableError => "unrecoverable_error",
        }
    }
}

/// One recorded transition in the context history.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: String,
    pub to: String,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

/// Context carried through the workflow.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StateContext {
    pub user_intent: String,
    pub current_state: PlannerState,
    pub analysis_data: serde_json::Value,
    pub change_plan_id: Option<String>,
    pub changeset_id: Option<String>,
    pub decision_id: Option<String>,
    pub approval_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub state_history: Vec<StateTransition>,
}

pub fn create_initial_context(user_intent: &str) -> StateContext {
    let now = Utc::now();
    StateContext {
        user_intent: user_intent.to_string(),
        current_state: PlannerState::Intent,
        analysis_data: serde_json::Value::Null,
        change_plan_id: None,
        changeset_id: None,
        decision_id: None,
        approval_id: None,
        created_at: now,
        updated_at: now,
        state_history: Vec::new(),
    }
}

pub fn is_workflow_complete(context: &StateContext) -> bool {
    matches!(
        context.current_state,
        PlannerState::Completed | PlannerState::Failed
    )
}

#[derive(Default)]
pub struct PlannerStateMachine;

impl PlannerStateMachine {
    pub fn new() -> Self {
        Self
    }

    fn valid_targets(from: PlannerState) -> &'static [PlannerState] {
        use PlannerState::*;
        match from {
            Intent => &[Analysis, PlanGeneration, Failed],
            Analysis => &[PlanGeneration, Analysis, Failed],
            PlanGeneration => &[GovernanceCheck, Analysis, Failed],
            GovernanceCheck => &[ExecutionReady, PlanGeneration, Failed],
            ExecutionReady => &[Completed, Failed],
            Completed | Failed => &[],
        }
    }

    pub fn can_transition(&self, from: PlannerState, to: PlannerState) -> bool {
        Self::valid_targets(from).contains(&to)
    }

    /// Transition and record it in the context history.
    pub fn transition(
        &self,
        mut context: StateContext,
        to: PlannerState,
        reason: TransitionReason,
    ) -> Result<StateContext, PlannerError> {
        if !self.can_transition(context.current_state, to) {
            return Err(PlannerError::InvalidTransition {
                from: context.current_state.as_str().to_string(),
                to: to.as_str().to_string(),
            });
        }
        context.state_history.push(StateTransition {
            from: context.current_state.as_str().to_string(),
            to: to.as_str().to_string(),
            reason: reason.as_str().to_string(),
            timestamp: Utc::now(),
        });
        context.current_state = to;
        context.updated_at = Utc::now();
        Ok(context)
    }

    /// Per-state tool whitelist. ANALYSIS is read-only; PLAN_GENERATION adds
    /// diff/checksum tools; EXECUTION_READY forbids all Planner tool use.
    pub fn allowed_tools(&self, state: PlannerState) -> &'static [&'static str] {
        use PlannerState::*;
        match state {
            Intent => &[],
            Analysis => &[
                "read_file",
                "list_directory",
                "grep",
                "glob",
                "web.search",
                "web.fetch",
                "memory.list_facts",
                "memory.query",
            ],
            PlanGeneration => &[
                "read_file",
                "list_directory",
                "grep",
                "glob",
                "generate_diff",
                "compute_checksum",
            ],
            GovernanceCheck => &["governance.evaluate", "governance.get_decision"],
            ExecutionReady | Completed | Failed => &[],
        }
    }

    pub fn is_tool_allowed(&self, state: PlannerState, tool_name: &str) -> bool {
        self.allowed_tools(state).iter().any(|allowed| {
            if let Some(prefix) = allowed.strip_suffix(".*") {
                tool_name.starts_with(prefix)
            } else {
                *allowed == tool_name
            }
        })
    }

    pub fn is_terminal_state(&self, state: PlannerState) -> bool {
        Self::valid_targets(state).is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_transitions() {
        let sm = PlannerStateMachine::new();
        let mut ctx = create_initial_context("fix a bug");
        for (to, reason) in [
            (PlannerState::Analysis, TransitionReason::NeedInvestigation),
            (PlannerState::PlanGeneration, TransitionReason::SufficientInfo),
            (PlannerState::GovernanceCheck, TransitionReason::PlanReady),
            (PlannerState::ExecutionReady, TransitionReason::Approved),
            (PlannerState::Completed, TransitionReason::ExecutionSuccess),
        ] {
            ctx = sm.transition(ctx, to, reason).unwrap();
        }
        assert!(is_workflow_complete(&ctx));
        assert_eq!(ctx.state_history.len(), 5);
        assert_eq!(ctx.state_history[0].from, "intent");
        assert_eq!(ctx.state_history[0].to, "analysis");
        assert_eq!(ctx.state_history[0].reason, "need_investigation");
    }

    #[test]
    fn invalid_transition_is_rejected() {
        let sm = PlannerStateMachine::new();
        let ctx = create_initial_context("x");
        let err = sm
            .transition(ctx, PlannerState::Completed, TransitionReason::Approved)
            .unwrap_err();
        assert!(matches!(err, PlannerError::InvalidTransition { .. }));
    }

    #[test]
    fn governance_check_can_loop_back_to_planning() {
        let sm = PlannerStateMachine::new();
        let ctx = create_initial_context("x");
        let ctx = sm
            .transition(ctx, PlannerState::PlanGeneration, TransitionReason::SufficientInfo)
            .unwrap();
        let ctx = sm
            .transition(ctx, PlannerState::GovernanceCheck, TransitionReason::PlanReady)
            .unwrap();
        let ctx = sm
            .transition(ctx, PlannerState::PlanGeneration, TransitionReason::NeedsRevision)
            .unwrap();
        assert_eq!(ctx.current_state, PlannerState::PlanGeneration);
    }

    #[test]
    fn analysis_allows_only_read_tools() {
        let sm = PlannerStateMachine::new();
        assert!(sm.is_tool_allowed(PlannerState::Analysis, "read_file"));
        assert!(sm.is_tool_allowed(PlannerState::Analysis, "memory.list_facts"));
        assert!(!sm.is_tool_allowed(PlannerState::Analysis, "generate_diff"));
        assert!(sm.is_tool_allowed(PlannerState::PlanGeneration, "generate_diff"));
        assert!(!sm.is_tool_allowed(PlannerState::ExecutionReady, "read_file"));
    }

    #[test]
    fn terminal_states_have_no_exits() {
        let sm = PlannerStateMachine::new();
        assert!(sm.is_terminal_state(PlannerState::Completed));
        assert!(sm.is_terminal_state(PlannerState::Failed));
        assert!(!sm.is_terminal_state(PlannerState::Intent));
    }
}
