//! Planner layer: the Planner shapes the workflow, an optional LLM fills in
//! reasoning. Decomposition, state transitions and safety-field generation are
//! all deterministic, which is what keeps the WriteGate first-pass approval
//! rate high.

mod decomposer;
mod orchestrator;
mod risk_shaper;
mod state_machine;

pub use decomposer::{AnalysisRequirement, DecomposedIntent, IntentDecomposer, IntentType};
pub use orchestrator::{PlanBundle, PlannerOrchestrator, Reasoner};
pub use risk_shaper::RiskShaper;
pub use state_machine::{
    create_initial_context, is_workflow_complete, PlannerState, PlannerStateMachine, StateContext,
    StateTransition, TransitionReason,
};

#[derive(Debug, thiserror::Error)]
pub enum PlannerError {
    #[error("invalid transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },
    #[error("tool '{tool}' not allowed in state '{state}'; allowed: {allowed:?}")]
    ToolNotAllowed {
        tool: String,
        state: String,
        allowed: Vec<String>,
    },
}
