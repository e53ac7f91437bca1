//! Conversation orchestrator: the turn-level flow behind
//! `POST /conversations/{id}/messages`.
//!
//! Duplicate client messages short-circuit, explicit-role requests insert
//! directly, user turns run through Agent Decision when the loop is enabled,
//! and every failure path still terminates the conversation with an assistant
//! or system message.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tracing::{error, info, warn};

use crate::chat_store::{ChatStore, Message, MessageRole, NewMessage};
use crate::decision::{AgentDecision, Decision, FactLine, RunSummary};
use crate::llm::{ChatFlow, ChatTurn};
use crate::CoreError;

/// History window: 40 messages for the LLM plus a filtering buffer.
const HISTORY_WINDOW: usize = 40;
const HISTORY_BUFFER: usize = 20;

#[derive(Clone, Debug, Default)]
pub struct MessageCreateRequest {
    pub content: String,
    /// Explicit role shortcut: insert as-is, no worker involvement.
    pub role: Option<String>,
    pub source_ref: Option<serde_json::Value>,
    pub meta_json: Option<serde_json::Value>,
    pub client_msg_id: Option<String>,
}

#[derive(Clone, Debug)]
pub struct CreateMessageOutcome {
    pub user_message: Option<Message>,
    pub assistant_message: Option<Message>,
    pub duplicate: bool,
}

/// Supplies active facts for the decision prompt; backed by the memory store
/// in production, stubbed in tests.
#[async_trait::async_trait]
pub trait FactsProvider: Send + Sync {
    async fn active_facts(&self, conversation_id: &str) -> Vec<FactLine>;
}

pub struct NoFacts;

#[async_trait::async_trait]
impl FactsProvider for NoFacts {
    async fn active_facts(&self, _conversation_id: &str) -> Vec<FactLine> {
        Vec::new()
    }
}

pub struct ConversationOrchestrator {
    store: ChatStore,
    decision: Option<Arc<AgentDecision>>,
    chat_flow: Option<Arc<dyn ChatFlow>>,
    facts: Arc<dyn FactsProvider>,
    agent_loop_enabled: bool,
    decision_timeout: Duration,
}

impl ConversationOrchestrator {
    pub fn new(store: ChatStore) -> Self {
        Self {
            store,
            decision: None,
            chat_flow: None,
            facts: Arc::new(NoFacts),
            agent_loop_enabled: false,
            decision_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_decision(mut self, decision: Arc<AgentDecision>, timeout: Duration) -> Self {
        self.decision = Some(decision);
        self.agent_loop_enabled = true;
        self.decision_timeout = timeout;
        self
    }

    pub fn with_chat_flow(mut self, chat_flow: Arc<dyn ChatFlow>) -> Self {
        self.chat_flow = Some(chat_flow);
        self
    }

    pub fn with_facts(mut self, facts: Arc<dyn FactsProvider>) -> Self {
        self.facts = facts;
        self
    }

    pub fn store(&self) -> &ChatStore {
        &self.store
    }

    pub async fn create_message(
        &self,
        conversation_id: &str,
        request: MessageCreateRequest,
    ) -> Result<CreateMessageOutcome, CoreError> {
        if self.store.get_conversation(conversation_id).await?.is_none() {
            return Err(CoreError::NotFound(format!(
                "conversation {conversation_id}"
            )));
        }

        // 1. Idempotency on client_msg_id: return the existing message with no
        // side effects.
        if let Some(client_msg_id) = &request.client_msg_id {
            if let Some(existing) = self
                .store
                .get_message_by_client_id(conversation_id, client_msg_id)
                .await?
            {
                let is_user = existing.role == MessageRole::User;
                return Ok(CreateMessageOutcome {
                    user_message: is_user.then(|| existing.clone()),
                    assistant_message: (!is_user).then_some(existing),
                    duplicate: true,
                });
            }
        }

        // 2. Explicit role shortcut.
        if let Some(role) = &request.role {
            let role = MessageRole::parse(role)
                .ok_or_else(|| CoreError::InvalidArgument(format!("invalid role: {role}")))?;
            let now = Utc::now();
            let message = self
                .store
                .insert_message_at(
                    conversation_id,
                    NewMessage {
                        role,
                        content: request.content,
                        source_ref: request.source_ref,
                        meta_json: request.meta_json,
                        client_msg_id: request.client_msg_id,
                    },
                    now,
                )
                .await?;
            self.store.touch_conversation(conversation_id, now).await?;
            let is_user = role == MessageRole::User;
            return Ok(CreateMessageOutcome {
                user_message: is_user.then(|| message.clone()),
                assistant_message: (!is_user).then_some(message),
                duplicate: false,
            });
        }

        // 3. User turn.
        let now = Utc::now();
        let user_message = self
            .store
            .insert_message_at(
                conversation_id,
                NewMessage {
                    role: MessageRole::User,
                    content: request.content.clone(),
                    source_ref: request.source_ref.clone(),
                    meta_json: request.meta_json.clone(),
                    client_msg_id: request.client_msg_id.clone(),
                },
                now,
            )
            .await?;
        self.store.touch_conversation(conversation_id, now).await?;

        let history = self.history_window(conversation_id, &user_message.id).await;

        // 4. Decision branch.
        let mut decision_used = false;
        let mut decision_run_id: Option<String> = None;
        let mut assistant_content: Option<String> = None;
        let mut worker_error: Option<String> = None;

        if self.agent_loop_enabled {
            if let Some(decision_service) = &self.decision {
                match self
                    .run_decision(decision_service, conversation_id, &request.content, &history)
                    .await
                {
                    Ok(decision) => {
                        decision_used = true;
                        let (content, run_id) = self
                            .dispatch_decision(conversation_id, &decision)
                            .await;
                        assistant_content = content;
                        decision_run_id = run_id;
                    }
                    Err(e) => {
                        warn!(error = %e, conversation_id, "agent decision failed, falling back to chat flow");
                    }
                }
            }
        }

        // 5. Fallback chat flow.
        if !decision_used {
            match &self.chat_flow {
                Some(chat_flow) => {
                    let turns: Vec<ChatTurn> = history
                        .iter()
                        .map(|(role, content)| ChatTurn {
                            role: role.clone(),
                            content: content.clone(),
                        })
                        .collect();
                    match chat_flow.chat(&request.content, &turns).await {
                        Ok(reply) => assistant_content = Some(reply),
                        Err(e) => {
                            error!(error = %e, conversation_id, "chat flow failed");
                            worker_error = Some(e.to_string());
                        }
                    }
                }
                None => worker_error = Some("Agent worker is not available".to_string()),
            }
        }

        // 6. Terminating assistant/system message.
        let assistant_now = Utc::now();
        let assistant_message = if let Some(error_message) = worker_error {
            self.store
                .insert_message_at(
                    conversation_id,
                    NewMessage {
                        role: MessageRole::System,
                        content: format!("Execution failed: {error_message}"),
                        source_ref: Some(json!({
                            "kind": "manual",
                            "ref_id": format!("worker_error_{conversation_id}"),
                            "excerpt": null,
                        })),
                        meta_json: Some(json!({
                            "error": true,
                            "error_type": "worker_failure",
                            "error_message": error_message,
                        })),
                        client_msg_id: None,
                    },
                    assistant_now,
                )
                .await?
        } else {
            let (source_ref, meta_json) = if decision_used {
                (
                    json!({"kind": "agent_decision", "ref_id": conversation_id, "excerpt": null}),
                    Some(json!({"agent_decision": true, "run_id": decision_run_id})),
                )
            } else {
                (
                    json!({"kind": "chat", "ref_id": conversation_id, "excerpt": null}),
                    None,
                )
            };
            self.store
                .insert_message_at(
                    conversation_id,
                    NewMessage {
                        role: MessageRole::Assistant,
                        content: assistant_content.unwrap_or_default(),
                        source_ref: Some(source_ref),
                        meta_json,
                        client_msg_id: None,
                    },
                    assistant_now,
                )
                .await?
        };
        self.store
            .touch_conversation(conversation_id, assistant_now)
            .await?;

        Ok(CreateMessageOutcome {
            user_message: Some(user_message),
            assistant_message: Some(assistant_message),
            duplicate: false,
        })
    }

    /// Recent user/assistant turns ascending, excluding the just-inserted user
    /// message (the LLM receives it separately) and all system rows.
    async fn history_window(
        &self,
        conversation_id: &str,
        exclude_message_id: &str,
    ) -> Vec<(String, String)> {
        match self
            .store
            .recent_messages(conversation_id, HISTORY_WINDOW + HISTORY_BUFFER)
            .await
        {
            Ok(mut recent) => {
                recent.reverse();
                recent
                    .into_iter()
                    .filter(|m| m.id != exclude_message_id)
                    .filter_map(|m| match m.role {
                        MessageRole::User => Some(("user".to_string(), m.content)),
                        MessageRole::Assistant => Some(("assistant".to_string(), m.content)),
                        MessageRole::System => None,
                    })
                    .collect()
            }
            Err(e) => {
                warn!(error = %e, "failed to query history messages");
                Vec::new()
            }
        }
    }

    async fn run_decision(
        &self,
        decision_service: &AgentDecision,
        conversation_id: &str,
        user_message: &str,
        history: &[(String, String)],
    ) -> Result<Decision, CoreError> {
        let active_facts = self.facts.active_facts(conversation_id).await;
        let recent_runs: Vec<RunSummary> = self
            .store
            .list_runs_for_conversation(conversation_id, 5)
            .await
            .unwrap_or_default()
            .into_iter()
            .map(|r| RunSummary {
                run_type: r.run_type,
                status: r.status.as_str().to_string(),
            })
            .collect();

        let fut = decision_service.decide(
            user_message,
            conversation_id,
            history,
            &active_facts,
            &recent_runs,
        );
        match tokio::time::timeout(self.decision_timeout, fut).await {
            Ok(Ok(decision)) => Ok(decision),
            Ok(Err(e)) => Err(CoreError::Decision(e.to_string())),
            Err(_) => Err(CoreError::Decision("decision timed out".to_string())),
        }
    }

    /// Execute a validated decision: reply text and/or a created run.
    async fn dispatch_decision(
        &self,
        conversation_id: &str,
        decision: &Decision,
    ) -> (Option<String>, Option<String>) {
        let mut assistant_content = decision.reply.as_ref().map(|r| r.content.clone());
        let mut run_id = None;

        if let Some(run) = &decision.run {
            match self
                .store
                .create_run(
                    &run.run_type,
                    run.title.as_deref(),
                    run.conversation_id.as_deref(),
                    Some(run.input.clone()),
                )
                .await
            {
                Ok(created) => {
                    info!(run_id = %created.id, run_type = %run.run_type, "run created from decision");
                    run_id = Some(created.id);
                    if decision.decision == "run" {
                        let label = run.title.clone().unwrap_or_else(|| run.run_type.clone());
                        assistant_content = Some(format!(
                            "Task started: {label}. I'll notify you when it's done."
                        ));
                    }
                }
                Err(e) => {
                    error!(error = %e, "failed to create run from decision");
                    let note = format!("task creation failed: {e}");
                    assistant_content = Some(match assistant_content {
                        Some(content) if !content.is_empty() => {
                            format!("{content}\n\n(Note: {note})")
                        }
                        _ => format!("Sorry, {note}"),
                    });
                }
            }
        }

        (assistant_content, run_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::AgentDecision;
    use crate::llm::{MockChatFlow, MockLlm};

    fn orchestrator_with_decision(llm_response: &str) -> ConversationOrchestrator {
        let store = ChatStore::in_memory().unwrap();
        let decision = AgentDecision::new(
            Arc::new(MockLlm::fixed(llm_response)),
            vec!["research_report".to_string(), "summarize_conversation".to_string()],
        );
        ConversationOrchestrator::new(store)
            .with_decision(Arc::new(decision), Duration::from_secs(5))
    }

    fn user_request(content: &str) -> MessageCreateRequest {
        MessageCreateRequest {
            content: content.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn reply_decision_produces_assistant_message() {
        let orch = orchestrator_with_decision(
            r#"{"decision": "reply", "reply": {"content": "hello there"}, "confidence": 0.9, "reason": "chat"}"#,
        );
        let conv = orch.store().create_conversation("chat").await.unwrap();
        let outcome = orch
            .create_message(&conv.id, user_request("hi"))
            .await
            .unwrap();

        assert!(!outcome.duplicate);
        let assistant = outcome.assistant_message.unwrap();
        assert_eq!(assistant.role, MessageRole::Assistant);
        assert_eq!(assistant.content, "hello there");
        assert_eq!(
            assistant.source_ref.as_ref().unwrap()["kind"],
            "agent_decision"
        );
        assert_eq!(assistant.meta_json.as_ref().unwrap()["agent_decision"], true);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn run_decision_creates_run_and_hint() {
        let orch = orchestrator_with_decision(
            r#"{"decision": "run", "run": {"type": "research_report", "title": "look up", "conversation_id": null, "input": {"query": "q"}}, "confidence": 0.8, "reason": "lookup"}"#,
        );
        let conv = orch.store().create_conversation("chat").await.unwrap();
        let outcome = orch
            .create_message(&conv.id, user_request("look something up"))
            .await
            .unwrap();

        let assistant = outcome.assistant_message.unwrap();
        assert!(assistant.content.contains("Task started: look up"));
        let run_id = assistant.meta_json.as_ref().unwrap()["run_id"]
            .as_str()
            .unwrap()
            .to_string();
        let run = orch.store().get_run(&run_id).await.unwrap().unwrap();
        assert_eq!(run.run_type, "research_report");
        assert_eq!(run.conversation_id.as_deref(), Some(conv.id.as_str()));
        assert_eq!(run.input_json.unwrap()["query"], "q");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn decision_failure_falls_back_to_chat_flow() {
        let store = ChatStore::in_memory().unwrap();
        let decision = AgentDecision::new(
            Arc::new(MockLlm::fixed("this is not json")),
            vec!["research_report".to_string()],
        );
        let orch = ConversationOrchestrator::new(store)
            .with_decision(Arc::new(decision), Duration::from_secs(5))
            .with_chat_flow(Arc::new(MockChatFlow::replying("fallback reply")));
        let conv = orch.store().create_conversation("chat").await.unwrap();

        let outcome = orch.create_message(&conv.id, user_request("hi")).await.unwrap();
        let assistant = outcome.assistant_message.unwrap();
        assert_eq!(assistant.content, "fallback reply");
        assert_eq!(assistant.source_ref.as_ref().unwrap()["kind"], "chat");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn chat_flow_error_leaves_system_message() {
        let store = ChatStore::in_memory().unwrap();
        let orch = ConversationOrchestrator::new(store)
            .with_chat_flow(Arc::new(MockChatFlow::failing("provider down")));
        let conv = orch.store().create_conversation("chat").await.unwrap();

        let outcome = orch.create_message(&conv.id, user_request("hi")).await.unwrap();
        let system = outcome.assistant_message.unwrap();
        assert_eq!(system.role, MessageRole::System);
        assert!(system.content.starts_with("Execution failed:"));
        let meta = system.meta_json.unwrap();
        assert_eq!(meta["error"], true);
        assert_eq!(meta["error_type"], "worker_failure");

        // The conversation terminates with a non-user message either way.
        let messages = orch.store().list_messages(&conv.id, None, None).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_ne!(messages.last().unwrap().role, MessageRole::User);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn client_msg_id_duplicate_returns_existing() {
        let store = ChatStore::in_memory().unwrap();
        let orch = ConversationOrchestrator::new(store)
            .with_chat_flow(Arc::new(MockChatFlow::replying("ok")));
        let conv = orch.store().create_conversation("chat").await.unwrap();

        let mut request = user_request("hello");
        request.client_msg_id = Some("client-1".to_string());
        let first = orch.create_message(&conv.id, request.clone()).await.unwrap();
        assert!(!first.duplicate);

        let second = orch.create_message(&conv.id, request).await.unwrap();
        assert!(second.duplicate);
        assert_eq!(
            second.user_message.unwrap().id,
            first.user_message.unwrap().id
        );
        // Exactly one user message exists.
        let messages = orch.store().list_messages(&conv.id, None, None).await.unwrap();
        let user_count = messages.iter().filter(|m| m.role == MessageRole::User).count();
        assert_eq!(user_count, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn explicit_role_inserts_directly() {
        let store = ChatStore::in_memory().unwrap();
        let orch = ConversationOrchestrator::new(store);
        let conv = orch.store().create_conversation("chat").await.unwrap();

        let mut request = user_request("imported assistant text");
        request.role = Some("assistant".to_string());
        let outcome = orch.create_message(&conv.id, request).await.unwrap();
        assert!(outcome.user_message.is_none());
        assert_eq!(
            outcome.assistant_message.unwrap().content,
            "imported assistant text"
        );

        let conv = orch.store().get_conversation(&conv.id).await.unwrap().unwrap();
        assert!(conv.has_unread());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn invalid_role_is_rejected() {
        let store = ChatStore::in_memory().unwrap();
        let orch = ConversationOrchestrator::new(store);
        let conv = orch.store().create_conversation("chat").await.unwrap();

        let mut request = user_request("x");
        request.role = Some("robot".to_string());
        let err = orch.create_message(&conv.id, request).await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidArgument(_)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn history_excludes_system_and_current_message() {
        let store = ChatStore::in_memory().unwrap();
        let orch = ConversationOrchestrator::new(store)
            .with_chat_flow(Arc::new(MockChatFlow::replying("ok")));
        let conv = orch.store().create_conversation("chat").await.unwrap();

        for (role, content) in [
            (MessageRole::User, "first"),
            (MessageRole::Assistant, "second"),
            (MessageRole::System, "error row"),
        ] {
            orch.store()
                .insert_message(
                    &conv.id,
                    NewMessage {
                        role,
                        content: content.to_string(),
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
        }
        let user = orch
            .store()
            .insert_message(
                &conv.id,
                NewMessage {
                    role: MessageRole::User,
                    content: "current".to_string(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let history = orch.history_window(&conv.id, &user.id).await;
        let contents: Vec<&str> = history.iter().map(|(_, c)| c.as_str()).collect();
        assert_eq!(contents, vec!["first", "second"]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unknown_conversation_is_not_found() {
        let store = ChatStore::in_memory().unwrap();
        let orch = ConversationOrchestrator::new(store);
        let err = orch
            .create_message("missing", user_request("hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::NotFound(_)));
    }
}
