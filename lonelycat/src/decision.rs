//! Agent Decision: per-turn choice between reply, run, or both.
//!
//! Builds a prompt (schema block, active facts, truncated history, recent
//! runs, current message), calls the gate LLM, parses JSON strictly, then
//! validates schema and logical consistency. A run type outside the whitelist
//! transforms the decision instead of raising. A missing `conversation_id` on
//! the run is filled from the current conversation.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::llm::GateLlm;

#[derive(Debug, thiserror::Error)]
pub enum DecisionError {
    #[error("decision LLM call failed: {0}")]
    Llm(String),
    #[error("invalid JSON response from decision LLM: {0}")]
    Json(String),
    #[error("decision schema validation failed: {0}")]
    Schema(String),
    #[error("decision logic validation failed: {0}")]
    Logic(String),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReplyContent {
    pub content: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunDecision {
    #[serde(rename = "type")]
    pub run_type: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub input: serde_json::Value,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Decision {
    pub decision: String,
    #[serde(default)]
    pub reply: Option<ReplyContent>,
    #[serde(default)]
    pub run: Option<RunDecision>,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub reason: String,
}

impl Decision {
    /// Logical consistency after schema validation.
    pub fn validate_logic(&self) -> Result<(), String> {
        match self.decision.as_str() {
            "reply" => {
                if self.reply.is_none() {
                    return Err("decision='reply' requires 'reply' field".to_string());
                }
                if self.run.is_some() {
                    return Err("decision='reply' must not provide 'run'".to_string());
                }
            }
            "run" => {
                if self.run.is_none() {
                    return Err("decision='run' requires 'run' field".to_string());
                }
            }
            "reply_and_run" => {
                if self.reply.is_none() {
                    return Err("decision='reply_and_run' requires 'reply' field".to_string());
                }
                if self.run.is_none() {
                    return Err("decision='reply_and_run' requires 'run' field".to_string());
                }
            }
            other => return Err(format!("unknown decision '{other}'")),
        }
        Ok(())
    }
}

/// A fact line for the prompt's facts block.
#[derive(Clone, Debug)]
pub struct FactLine {
    pub key: String,
    pub value: serde_json::Value,
    pub status: Option<String>,
}

/// Run summary line for the prompt's recent-runs block.
#[derive(Clone, Debug)]
pub struct RunSummary {
    pub run_type: String,
    pub status: String,
}

pub struct AgentDecision {
    llm: Arc<dyn GateLlm>,
    allowed_run_types: Vec<String>,
}

impl AgentDecision {
    pub fn new(llm: Arc<dyn GateLlm>, allowed_run_types: Vec<String>) -> Self {
        Self {
            llm,
            allowed_run_types,
        }
    }

    /// Whitelist from `AGENT_ALLOWED_RUN_TYPES` (with defaults).
    pub fn from_env(llm: Arc<dyn GateLlm>) -> Self {
        Self::new(llm, config::agent_allowed_run_types())
    }

    pub async fn decide(
        &self,
        user_message: &str,
        conversation_id: &str,
        history: &[(String, String)],
        active_facts: &[FactLine],
        recent_runs: &[RunSummary],
    ) -> Result<Decision, DecisionError> {
        let prompt = self.build_decision_prompt(
            user_message,
            conversation_id,
            history,
            active_facts,
            recent_runs,
        );

        let raw = self
            .llm
            .generate(&prompt)
            .await
            .map_err(|e| DecisionError::Llm(e.to_string()))?;
        if raw.trim().is_empty() {
            return Err(DecisionError::Llm("LLM returned empty response".to_string()));
        }

        let mut decision: Decision =
            serde_json::from_str(&raw).map_err(|e| DecisionError::Json(e.to_string()))?;

        if !matches!(decision.decision.as_str(), "reply" | "run" | "reply_and_run") {
            return Err(DecisionError::Schema(format!(
                "decision must be reply|run|reply_and_run, got '{}'",
                decision.decision
            )));
        }
        if !(0.0..=1.0).contains(&decision.confidence) {
            return Err(DecisionError::Schema("confidence out of [0, 1]".to_string()));
        }
        decision.validate_logic().map_err(DecisionError::Logic)?;

        // Whitelist fallback: transform rather than raise.
        if let Some(run) = decision.run.clone() {
            if !self.allowed_run_types.contains(&run.run_type) {
                warn!(
                    run_type = %run.run_type,
                    "run type not in whitelist, falling back to reply-only"
                );
                match decision.decision.as_str() {
                    "run" => {
                        decision.decision = "reply".to_string();
                        decision.reply = Some(ReplyContent {
                            content: format!(
                                "Sorry, task type '{}' is not in the allowed list.",
                                run.run_type
                            ),
                        });
                        decision.run = None;
                    }
                    "reply_and_run" => {
                        decision.decision = "reply".to_string();
                        if let Some(reply) = decision.reply.as_mut() {
                            reply.content.push_str(&format!(
                                "\n\n(Note: task type '{}' is not in the allowed list, task creation skipped)",
                                run.run_type
                            ));
                        }
                        decision.run = None;
                    }
                    _ => {}
                }
            }
        }

        // A user-initiated run defaults to the current conversation.
        if let Some(run) = decision.run.as_mut() {
            if run.conversation_id.is_none() {
                run.conversation_id = Some(conversation_id.to_string());
            }
        }

        let reason_preview: String = decision.reason.chars().take(50).collect();
        info!(
            decision = %decision.decision,
            confidence = decision.confidence,
            reason = %reason_preview,
            "decision made"
        );
        Ok(decision)
    }

    fn build_decision_prompt(
        &self,
        user_message: &str,
        conversation_id: &str,
        history: &[(String, String)],
        active_facts: &[FactLine],
        recent_runs: &[RunSummary],
    ) -> String {
        let allowed = self.allowed_run_types.join(", ");
        let mut prompt = format!(
            r#"You are an AI assistant that decides how to respond to user messages.

You can choose one of three actions:
1. "reply" - Only reply to the user (normal conversation)
2. "run" - Create a background task without replying immediately
3. "reply_and_run" - Reply to the user AND create a background task

Available task types (whitelist):
{allowed}

Decision rules:
- Use "reply" for normal chat, subjective opinions, or when no task is needed.
- Use "run" when the user wants a background task and doesn't need an immediate response.
- Use "reply_and_run" when you should acknowledge the request AND start a task.
- Research / lookup requests need real-time or factual data: use "run" with type "research_report" and put the question in run.input.query.
- Always set conversation_id to the current conversation_id (unless it's a system/automatic task).
- Only use task types from the whitelist above.

Return ONLY a valid JSON object with this exact structure:
{{
  "decision": "reply" | "run" | "reply_and_run",
  "reply": {{"content": "string"}},
  "run": {{"type": "string", "title": "string?", "conversation_id": "string|null", "input": {{"any": "json"}}}},
  "confidence": 0.0-1.0,
  "reason": "string"
}}

Rules:
- If decision="reply": must provide reply.content, must NOT provide run
- If decision="run": must provide run, reply can be empty/null
- If decision="reply_and_run": must provide BOTH reply and run
- conversation_id: use "{conversation_id}" if the user is in a conversation, null for system/automatic tasks
- For research_report: run.input must include "query" with the user's lookup question
"#
        );

        let facts_lines: Vec<String> = active_facts
            .iter()
            .filter(|f| {
                !matches!(f.status.as_deref(), Some("revoked") | Some("archived"))
                    && !f.key.is_empty()
            })
            .map(|f| {
                let value = match &f.value {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                format!("- {}: {value}", f.key)
            })
            .collect();
        if !facts_lines.is_empty() {
            prompt.push_str(&format!(
                "\n[KNOWN FACTS]\n{}\n[/KNOWN FACTS]\n\nRules:\n- Use KNOWN FACTS when relevant.\n- Do not ask for info already in KNOWN FACTS.\n- If the user contradicts a fact, ask for confirmation and propose an update.\n",
                facts_lines.join("\n")
            ));
        }

        if !history.is_empty() {
            prompt.push_str("\nRecent conversation history:\n");
            let start = history.len().saturating_sub(10);
            for (role, content) in &history[start..] {
                prompt.push_str(&format!("{role}: {content}\n"));
            }
        }

        if !recent_runs.is_empty() {
            prompt.push_str("\nRecent runs in this conversation:\n");
            for run in recent_runs.iter().take(5) {
                prompt.push_str(&format!("- {} ({})\n", run.run_type, run.status));
            }
        }

        prompt.push_str(&format!("\nCurrent user message:\n{user_message}\n"));
        prompt
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlm;

    fn decider(response: &str, allowed: &[&str]) -> AgentDecision {
        AgentDecision::new(
            Arc::new(MockLlm::fixed(response)),
            allowed.iter().map(|s| s.to_string()).collect(),
        )
    }

    #[tokio::test]
    async fn reply_decision_parses() {
        let d = decider(
            r#"{"decision": "reply", "reply": {"content": "hi"}, "confidence": 0.9, "reason": "greeting"}"#,
            &["research_report"],
        );
        let decision = d.decide("hello", "conv_1", &[], &[], &[]).await.unwrap();
        assert_eq!(decision.decision, "reply");
        assert_eq!(decision.reply.unwrap().content, "hi");
        assert!(decision.run.is_none());
    }

    #[tokio::test]
    async fn run_decision_fills_conversation_id() {
        let d = decider(
            r#"{"decision": "run", "run": {"type": "research_report", "conversation_id": null, "input": {"query": "top company"}}, "confidence": 0.8, "reason": "lookup"}"#,
            &["research_report"],
        );
        let decision = d.decide("look it up", "conv_42", &[], &[], &[]).await.unwrap();
        let run = decision.run.unwrap();
        assert_eq!(run.conversation_id.as_deref(), Some("conv_42"));
        assert_eq!(run.input["query"], "top company");
    }

    #[tokio::test]
    async fn invalid_json_is_a_json_error() {
        let d = decider("not json at all", &["research_report"]);
        let err = d.decide("x", "c", &[], &[], &[]).await.unwrap_err();
        assert!(matches!(err, DecisionError::Json(_)));
    }

    #[tokio::test]
    async fn reply_with_run_is_a_logic_error() {
        let d = decider(
            r#"{"decision": "reply", "reply": {"content": "hi"}, "run": {"type": "research_report", "input": {}}, "confidence": 0.5, "reason": ""}"#,
            &["research_report"],
        );
        let err = d.decide("x", "c", &[], &[], &[]).await.unwrap_err();
        assert!(matches!(err, DecisionError::Logic(_)));
    }

    #[tokio::test]
    async fn run_without_run_field_is_a_logic_error() {
        let d = decider(
            r#"{"decision": "run", "confidence": 0.5, "reason": ""}"#,
            &["research_report"],
        );
        let err = d.decide("x", "c", &[], &[], &[]).await.unwrap_err();
        assert!(matches!(err, DecisionError::Logic(_)));
    }

    #[tokio::test]
    async fn whitelisted_fallback_run_becomes_reply() {
        let d = decider(
            r#"{"decision": "run", "run": {"type": "format_disk", "input": {}}, "confidence": 0.9, "reason": ""}"#,
            &["research_report"],
        );
        let decision = d.decide("x", "c", &[], &[], &[]).await.unwrap();
        assert_eq!(decision.decision, "reply");
        assert!(decision.run.is_none());
        assert!(decision.reply.unwrap().content.contains("format_disk"));
    }

    #[tokio::test]
    async fn whitelisted_fallback_reply_and_run_keeps_reply() {
        let d = decider(
            r#"{"decision": "reply_and_run", "reply": {"content": "on it"}, "run": {"type": "format_disk", "input": {}}, "confidence": 0.9, "reason": ""}"#,
            &["research_report"],
        );
        let decision = d.decide("x", "c", &[], &[], &[]).await.unwrap();
        assert_eq!(decision.decision, "reply");
        assert!(decision.run.is_none());
        let content = decision.reply.unwrap().content;
        assert!(content.starts_with("on it"));
        assert!(content.contains("task creation skipped"));
    }

    #[tokio::test]
    async fn prompt_contains_facts_history_and_runs() {
        let d = decider("{}", &["research_report"]);
        let prompt = d.build_decision_prompt(
            "current question",
            "conv_1",
            &[("user".to_string(), "earlier".to_string())],
            &[
                FactLine {
                    key: "preferred_name".to_string(),
                    value: serde_json::json!("Alice"),
                    status: Some("active".to_string()),
                },
                FactLine {
                    key: "old".to_string(),
                    value: serde_json::json!("gone"),
                    status: Some("revoked".to_string()),
                },
            ],
            &[RunSummary {
                run_type: "research_report".to_string(),
                status: "succeeded".to_string(),
            }],
        );
        assert!(prompt.contains("preferred_name: Alice"));
        assert!(!prompt.contains("gone"));
        assert!(prompt.contains("user: earlier"));
        assert!(prompt.contains("research_report (succeeded)"));
        assert!(prompt.contains("current question"));
        assert!(prompt.contains("conv_1"));
    }
}
