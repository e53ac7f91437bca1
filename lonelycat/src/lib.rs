//! LonelyCat core: the conversation-facing half of the platform.
//!
//! On every user message the orchestrator decides between reply-only,
//! run-only, and reply-and-run; runs complete through the queue and emit their
//! conversation messages idempotently; unread state is always computed from
//! timestamps.

pub mod chat_store;
pub mod decision;
pub mod llm;
pub mod orchestrator;
pub mod run_messages;

pub use chat_store::{
    ChatStore, Conversation, Message, MessageRole, NewMessage, Run, RunStatus,
};
pub use decision::{AgentDecision, Decision, DecisionError, FactLine, ReplyContent, RunDecision, RunSummary};
pub use llm::{ChatFlow, ChatFlowError, ChatTurn, GateLlm, LlmError, MockChatFlow, MockLlm};
pub use orchestrator::{
    ConversationOrchestrator, CreateMessageOutcome, FactsProvider, MessageCreateRequest, NoFacts,
};
pub use run_messages::RunQueue;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("storage: {0}")]
    Storage(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("decision: {0}")]
    Decision(String),
}
