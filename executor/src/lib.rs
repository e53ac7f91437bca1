//! Host executor: applies WriteGate-approved changesets to the workspace.
//!
//! The pipeline is validate -> checksum -> backup -> apply -> verify -> health,
//! with automatic rollback on any fatal step. Executions are serialized by a
//! repository-level file lock, deduplicated by a plan x checksum idempotency
//! cache, and leave a full evidence trail (artifact directory + SQLite history).

pub mod applier;
pub mod artifacts;
pub mod executor;
pub mod health;
pub mod idempotency;
pub mod lock;
pub mod migrations;
pub mod rollback;
pub mod similarity;
pub mod store;
pub mod verifier;

pub use applier::{ApplyFailureKind, FileApplier};
pub use artifacts::{replay_execution, ArtifactConfig, ArtifactManager};
pub use executor::{
    generate_execution_id, ExecutionResult, ExecutionStatus, ExecutorHooks, HostExecutor,
    TriggerContext, TriggerKind,
};
pub use idempotency::{IdempotencyManager, IdempotencyRecord};
pub use lock::{ExecutionLock, LockGuard, LockInfo};
pub use similarity::{PathSimilarity, SimilarityEngine, SimilarityScore, TextVectorizer};
pub use store::{ExecutionRecord, ExecutionStore, StepRecord};

/// Executor-side failures. Step failures inside an execution surface through
/// [`ExecutionResult`]; these errors are infrastructure faults.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("storage: {0}")]
    Storage(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("lock acquisition failed: {0}")]
    LockAcquisition(String),
    #[error("decision verdict is {verdict}, must be allow: {reasons}")]
    DecisionNotAllowed { verdict: String, reasons: String },
    #[error("changeset checksum verification failed (possible tampering)")]
    ChecksumMismatch,
}
