//! Router assembly and shared state.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::routing::{get, patch, post};
use axum::Router;

use executor::{ArtifactManager, ExecutionStore};
use lonelycat::{ChatStore, ConversationOrchestrator, FactLine, FactsProvider, RunQueue};
use memory::{FactStatus, MemoryStore, Scope};
use sandbox::{SandboxSettings, SandboxStore};

pub struct AppState {
    pub orchestrator: ConversationOrchestrator,
    pub chat_store: ChatStore,
    pub run_queue: RunQueue,
    pub memory: Arc<MemoryStore>,
    pub sandbox_store: SandboxStore,
    pub sandbox_settings: SandboxSettings,
    pub execution_store: ExecutionStore,
    pub artifacts: ArtifactManager,
    pub workspace_root: PathBuf,
}

/// Active facts for the decision prompt: global scope plus the current
/// session (the conversation doubles as the session id).
pub struct MemoryFactsProvider {
    memory: Arc<MemoryStore>,
}

#[async_trait::async_trait]
impl FactsProvider for MemoryFactsProvider {
    async fn active_facts(&self, conversation_id: &str) -> Vec<FactLine> {
        let mut lines = Vec::new();
        let global = self
            .memory
            .list_facts(Some(Scope::Global), None, None, Some(FactStatus::Active))
            .await
            .unwrap_or_default();
        let session = self
            .memory
            .list_facts(
                Some(Scope::Session),
                None,
                Some(conversation_id),
                Some(FactStatus::Active),
            )
            .await
            .unwrap_or_default();
        for fact in global.into_iter().chain(session) {
            lines.push(FactLine {
                key: fact.key,
                value: fact.value,
                status: Some(fact.status.as_str().to_string()),
            });
        }
        lines
    }
}

impl AppState {
    /// Wire every store against one workspace root.
    pub fn new(workspace_root: &Path) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        std::fs::create_dir_all(workspace_root)?;
        let chat_store = ChatStore::new(workspace_root.join("lonelycat.db"))?;
        let memory = Arc::new(MemoryStore::new(workspace_root.join("lonelycat_memory.db"))?);
        let facts_provider = Arc::new(MemoryFactsProvider {
            memory: memory.clone(),
        });
        Ok(Self {
            orchestrator: ConversationOrchestrator::new(chat_store.clone())
                .with_facts(facts_provider),
            run_queue: RunQueue::new(chat_store.clone()),
            chat_store,
            memory,
            sandbox_store: SandboxStore::new(workspace_root.join("sandbox.db"))?,
            sandbox_settings: SandboxSettings::new(workspace_root),
            execution_store: ExecutionStore::new(workspace_root)?,
            artifacts: ArtifactManager::new(workspace_root)?,
            workspace_root: workspace_root.to_path_buf(),
        })
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        // Conversations
        .route(
            "/conversations",
            get(crate::conversations::list).post(crate::conversations::create),
        )
        .route(
            "/conversations/:id",
            patch(crate::conversations::update).delete(crate::conversations::delete),
        )
        .route(
            "/conversations/:id/mark-read",
            patch(crate::conversations::mark_read),
        )
        .route(
            "/conversations/:id/messages",
            get(crate::conversations::messages).post(crate::conversations::create_message),
        )
        .route("/conversations/:id/runs", get(crate::conversations::runs))
        // Memory
        .route(
            "/proposals",
            get(crate::memory_api::list_proposals).post(crate::memory_api::create_proposal),
        )
        .route("/proposals/:id/accept", post(crate::memory_api::accept_proposal))
        .route("/proposals/:id/reject", post(crate::memory_api::reject_proposal))
        .route("/proposals/:id/expire", post(crate::memory_api::expire_proposal))
        .route("/facts", get(crate::memory_api::list_facts))
        .route("/facts/:id", get(crate::memory_api::get_fact))
        .route("/facts/key/:key", get(crate::memory_api::get_fact_by_key))
        .route("/facts/:id/revoke", post(crate::memory_api::revoke_fact))
        .route("/facts/:id/archive", post(crate::memory_api::archive_fact))
        .route(
            "/facts/:id/reactivate",
            post(crate::memory_api::reactivate_fact),
        )
        .route("/audit", get(crate::memory_api::list_audit))
        .route(
            "/maintenance/check-expired",
            post(crate::memory_api::check_expired),
        )
        // Sandbox
        .route(
            "/sandbox/execs",
            get(crate::sandbox_api::list_execs).post(crate::sandbox_api::create_exec),
        )
        .route("/sandbox/execs/:id", get(crate::sandbox_api::get_exec))
        .route(
            "/sandbox/execs/:id/artifacts",
            get(crate::sandbox_api::get_artifacts),
        )
        .route("/sandbox/execs/:id/stdout", get(crate::sandbox_api::get_stdout))
        .route("/sandbox/execs/:id/stderr", get(crate::sandbox_api::get_stderr))
        .route(
            "/sandbox/execs/:id/observation",
            get(crate::sandbox_api::get_observation),
        )
        .route("/sandbox/health", get(crate::sandbox_api::health))
        // Executions
        .route("/executions", get(crate::executions::list))
        .route("/executions/statistics", get(crate::executions::statistics))
        .route(
            "/executions/correlation/:cid",
            get(crate::executions::by_correlation),
        )
        .route("/executions/:id", get(crate::executions::get_one))
        .route("/executions/:id/artifacts", get(crate::executions::artifacts))
        .route("/executions/:id/replay", get(crate::executions::replay))
        .route("/executions/:id/lineage", get(crate::executions::lineage))
        .with_state(state)
}
