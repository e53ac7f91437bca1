//! Governance layer: the judge side of controlled code changes.
//!
//! WriteGate evaluates a [`ChangePlan`] + [`ChangeSet`] against the policy file and
//! returns a [`GovernanceDecision`]; it never touches the filesystem itself. Path
//! canonicalization and glob policy checks live in [`paths`], append-only persistence
//! in [`store`].

mod models;
mod policy;
mod writegate;

pub mod paths;
pub mod store;

pub use models::{
    generate_approval_id, generate_changeset_id, generate_decision_id, generate_plan_id,
    ChangePlan, ChangeSet, FileChange, GovernanceApproval, GovernanceDecision, Operation,
    RiskLevel, Verdict,
};
pub use policy::{PolicyError, PolicySet};
pub use writegate::{compute_agent_source_hash, compute_projection_hash, WriteGate};

/// Errors from governance persistence and policy loading.
#[derive(Debug, thiserror::Error)]
pub enum GovernanceError {
    #[error("storage: {0}")]
    Storage(String),
    #[error("policy: {0}")]
    Policy(#[from] PolicyError),
    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),
}
