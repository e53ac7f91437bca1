//! LLM collaborator seams.
//!
//! The decision layer depends on an opaque `generate(prompt) -> text` gate;
//! the fallback chat path depends on an opaque chat flow. Both are traits so
//! tests inject mocks and providers stay out of the core.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("llm call failed: {0}")]
    Call(String),
    #[error("llm returned empty response")]
    Empty,
}

/// Single-shot text generation used by Agent Decision.
#[async_trait]
pub trait GateLlm: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String, LlmError>;
}

/// One message as the chat flow sees it.
#[derive(Clone, Debug)]
pub struct ChatTurn {
    pub role: String,
    pub content: String,
}

#[derive(Debug, thiserror::Error)]
#[error("chat flow failed: {0}")]
pub struct ChatFlowError(pub String);

/// The worker's chat pipeline, used when the decision layer is disabled or
/// fails.
#[async_trait]
pub trait ChatFlow: Send + Sync {
    async fn chat(
        &self,
        user_message: &str,
        history: &[ChatTurn],
    ) -> Result<String, ChatFlowError>;
}

/// Scripted mock: pops queued responses, then repeats the last one.
#[derive(Default)]
pub struct MockLlm {
    responses: Mutex<VecDeque<String>>,
    fallback: Option<String>,
}

impl MockLlm {
    pub fn new(responses: Vec<String>) -> Self {
        Self {
            fallback: responses.last().cloned(),
            responses: Mutex::new(responses.into()),
        }
    }

    pub fn fixed(response: &str) -> Self {
        Self::new(vec![response.to_string()])
    }
}

#[async_trait]
impl GateLlm for MockLlm {
    async fn generate(&self, _prompt: &str) -> Result<String, LlmError> {
        let mut queue = self.responses.lock().unwrap_or_else(|e| e.into_inner());
        match queue.pop_front() {
            Some(response) => Ok(response),
            None => self.fallback.clone().ok_or(LlmError::Empty),
        }
    }
}

/// Chat flow mock returning a canned reply, or failing when constructed with
/// an error.
pub struct MockChatFlow {
    reply: Result<String, String>,
}

impl MockChatFlow {
    pub fn replying(reply: &str) -> Self {
        Self {
            reply: Ok(reply.to_string()),
        }
    }

    pub fn failing(error: &str) -> Self {
        Self {
            reply: Err(error.to_string()),
        }
    }
}

#[async_trait]
impl ChatFlow for MockChatFlow {
    async fn chat(
        &self,
        _user_message: &str,
        _history: &[ChatTurn],
    ) -> Result<String, ChatFlowError> {
        self.reply.clone().map_err(ChatFlowError)
    }
}
