//! Run completion: queue transitions, idempotent message emission, and waking
//! a parent run that waits on a child.
//!
//! Emission is idempotent on `(source_ref.kind in {run, run_done},
//! source_ref.ref_id = run.id)`. Orchestrated child code runs emit no message
//! at all; they wake the waiting parent instead.

use chrono::{Duration, Utc};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::chat_store::{ChatStore, MessageRole, NewMessage, Run, RunStatus};
use crate::CoreError;

/// Cap for the child-output preview merged into the parent's input.
const PREVIOUS_OUTPUT_CAP_BYTES: usize = 4096;

pub struct RunQueue {
    store: ChatStore,
}

impl RunQueue {
    pub fn new(store: ChatStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &ChatStore {
        &self.store
    }

    pub async fn complete_success(
        &self,
        run_id: &str,
        output_json: Value,
    ) -> Result<Option<Run>, CoreError> {
        self.complete(run_id, RunStatus::Succeeded, Some(output_json), None)
            .await
    }

    pub async fn complete_failure(
        &self,
        run_id: &str,
        error: &str,
    ) -> Result<Option<Run>, CoreError> {
        self.complete(run_id, RunStatus::Failed, None, Some(error.to_string()))
            .await
    }

    pub async fn cancel(&self, run_id: &str) -> Result<Option<Run>, CoreError> {
        self.complete(run_id, RunStatus::Canceled, None, None).await
    }

    async fn complete(
        &self,
        run_id: &str,
        status: RunStatus,
        output_json: Option<Value>,
        error: Option<String>,
    ) -> Result<Option<Run>, CoreError> {
        let Some(mut run) = self.store.get_run(run_id).await? else {
            return Ok(None);
        };
        // Terminal runs are never mutated again.
        if matches!(
            run.status,
            RunStatus::Succeeded | RunStatus::Failed | RunStatus::Canceled
        ) {
            return Ok(Some(run));
        }

        run.status = status;
        if output_json.is_some() {
            run.output_json = output_json;
        }
        run.error = error;
        run.updated_at = Utc::now();
        self.store.update_run(&run).await?;

        self.emit_run_message(&run).await?;
        Ok(Some(run))
    }

    /// Emit the completion message for a run (idempotent), or wake the parent
    /// for orchestrated child code runs.
    pub async fn emit_run_message(&self, run: &Run) -> Result<(), CoreError> {
        let run_type = run.run_type.trim().replace(' ', "_");
        let input = run.input_json.clone().unwrap_or(Value::Null);

        // Orchestrated child: the turn orchestration writes the final summary,
        // this child only advances the parent.
        if run_type == "run_code_snippet" && input["parent_run_id"].as_str().is_some() {
            self.wake_parent_run_if_waiting(run).await?;
            return Ok(());
        }

        if self.store.find_run_completion_message(&run.id).await?.is_some() {
            return Ok(());
        }

        let (content, kind) = compose_run_message(run, &run_type);
        let source_ref = json!({"kind": kind, "ref_id": run.id, "excerpt": null});

        match &run.conversation_id {
            Some(conversation_id) => {
                if self.store.get_conversation(conversation_id).await?.is_none() {
                    warn!(conversation_id = %conversation_id, run_id = %run.id, "conversation not found for run message");
                    return Ok(());
                }
                let now = Utc::now();
                self.store
                    .insert_message_at(
                        conversation_id,
                        NewMessage {
                            role: MessageRole::Assistant,
                            content,
                            source_ref: Some(source_ref),
                            meta_json: None,
                            client_msg_id: None,
                        },
                        now,
                    )
                    .await?;
                // Unread is derived; advance updated_at, never touch last_read_at.
                self.store.touch_conversation(conversation_id, now).await?;
            }
            None => {
                let title = format!(
                    "Task completed: {}",
                    run.title.clone().unwrap_or_else(|| run.run_type.clone())
                );
                // updated_at = created_at + 1ms so has_unread holds even on
                // coarse clocks.
                let message_time = Utc::now() + Duration::milliseconds(1);
                let conversation = self
                    .store
                    .create_conversation_with(
                        &title,
                        Some(json!({
                            "kind": "system_run",
                            "run_id": run.id,
                            "origin": "run",
                            "channel_hint": "web",
                        })),
                        Some(message_time),
                    )
                    .await?;
                self.store
                    .insert_message_at(
                        &conversation.id,
                        NewMessage {
                            role: MessageRole::Assistant,
                            content,
                            source_ref: Some(source_ref),
                            meta_json: None,
                            client_msg_id: None,
                        },
                        message_time,
                    )
                    .await?;
            }
        }
        Ok(())
    }

    /// Requeue the parent when it waits for exactly this child. Idempotent:
    /// any other state is left untouched.
    pub async fn wake_parent_run_if_waiting(&self, child: &Run) -> Result<(), CoreError> {
        let parent_id = child
            .parent_run_id
            .clone()
            .or_else(|| {
                child
                    .input_json
                    .as_ref()
                    .and_then(|v| v["parent_run_id"].as_str().map(str::to_string))
            });
        let Some(parent_id) = parent_id else {
            return Ok(());
        };
        let Some(mut parent) = self.store.get_run(&parent_id).await? else {
            return Ok(());
        };

        let out = parent.output_json.clone().unwrap_or(Value::Null);
        if out["state"].as_str() != Some("WAIT_CHILD") {
            return Ok(());
        }
        let waiting_id = out["waiting_child_run_id"]
            .as_str()
            .or_else(|| out["child_run_id"].as_str());
        if waiting_id != Some(child.id.as_str()) {
            return Ok(());
        }

        let step_index = out["waiting_step_index"]
            .as_i64()
            .or_else(|| out["step_index"].as_i64())
            .unwrap_or(0);
        let run_ids = out["run_ids"].clone();

        let mut merged = match parent.input_json.clone() {
            Some(Value::Object(map)) => Value::Object(map),
            _ => json!({}),
        };
        merged["step_index"] = json!(step_index + 1);
        merged["previous_output_json"] = cap_previous_output(child.output_json.as_ref());
        merged["run_ids"] = if run_ids.is_null() { json!([]) } else { run_ids };

        // Clear only the waiting keys; keep the rest for debugging.
        let mut remaining = match out {
            Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        for key in [
            "state",
            "child_run_id",
            "waiting_child_run_id",
            "waiting_step_index",
            "run_ids",
        ] {
            remaining.remove(key);
        }

        parent.input_json = Some(merged);
        parent.output_json = if remaining.is_empty() {
            None
        } else {
            Some(Value::Object(remaining))
        };
        parent.status = RunStatus::Queued;
        parent.worker_id = None;
        parent.lease_expires_at = None;
        parent.updated_at = Utc::now();
        self.store.update_run(&parent).await?;
        info!(parent_run_id = %parent.id, child_run_id = %child.id, "woke waiting parent run");
        Ok(())
    }
}

/// Content plus `source_ref.kind` for a finished run.
fn compose_run_message(run: &Run, run_type: &str) -> (String, &'static str) {
    if run_type == "agent_loop_turn" {
        // Orchestrated turn: the final reply was computed by the orchestration.
        let out = run.output_json.clone().unwrap_or(Value::Null);
        let content = match run.status {
            RunStatus::Succeeded => out["final_reply"]
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| "Task completed".to_string()),
            RunStatus::Failed => format!(
                "Task failed: {}",
                run.error.clone().unwrap_or_else(|| "unknown error".to_string())
            ),
            RunStatus::Canceled => "Task canceled".to_string(),
            _ => format!("Task status: {}", run.status.as_str()),
        };
        return (content, "run_done");
    }

    let label = run.title.clone().unwrap_or_else(|| run.run_type.clone());
    let content = match run.status {
        RunStatus::Succeeded => match run_type {
            "summarize_conversation" | "research_report" => {
                format_run_output_summary(run.output_json.as_ref(), run_type)
            }
            _ => format!(
                "Task completed: {label}\n\n{}",
                format_run_output_summary(run.output_json.as_ref(), run_type)
            ),
        },
        RunStatus::Failed => format!(
            "Task failed: {label}\n\nError: {}",
            run.error.clone().unwrap_or_else(|| "unknown error".to_string())
        ),
        RunStatus::Canceled => format!("Task canceled: {label}"),
        _ => format!("Task status: {} - {label}", run.status.as_str()),
    };
    (content, "run")
}

/// Type-aware rendering of a run's output for the conversation.
fn format_run_output_summary(output_json: Option<&Value>, run_type: &str) -> String {
    let Some(output) = output_json else {
        return "Task finished.".to_string();
    };

    if run_type == "summarize_conversation" {
        if let Some(summary) = output["summary"].as_str() {
            let count = output["message_count"].as_i64().unwrap_or(0);
            return format!("\u{1F4DD} Conversation summary (last {count} messages):\n\n{summary}");
        }
    }

    if run_type == "research_report" {
        let report_text = output["artifacts"]["report"]["text"].as_str().map(str::trim);
        if let Some(text) = report_text.filter(|t| !t.is_empty()) {
            return format!("\u{1F4CB} Research report:\n\n{text}");
        }
        let query = output["result"]["query"].as_str().unwrap_or("");
        let sources = output["result"]["source_count"].as_i64().unwrap_or(0);
        return format!(
            "Research finished: {}, {sources} sources.",
            if query.is_empty() { "(no query)" } else { query }
        );
    }

    if run_type == "run_code_snippet" {
        if let Some(reply) = extract_reply(output) {
            return reply;
        }
        let exec_id = extract_exec_id(output).unwrap_or_else(|| "unknown".to_string());
        return format!("Code execution finished (exec_id={exec_id}). See the task details for output.");
    }

    for key in ["summary", "message"] {
        if let Some(text) = output[key].as_str() {
            return text.to_string();
        }
    }
    if !output["result"].is_null() {
        return truncate_chars(&render_value(&output["result"]), 500);
    }
    truncate_chars(&render_value(output), 500)
}

/// An assistant-facing reply embedded in a code run's output.
fn extract_reply(output: &Value) -> Option<String> {
    for candidate in [&output["result"]["reply"], &output["reply"], &output["final_reply"]] {
        if let Some(text) = candidate.as_str() {
            let trimmed = text.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
    }
    None
}

/// Resolve a sandbox exec id (`e_` + 16 hex) from the places runs stash it.
fn extract_exec_id(output: &Value) -> Option<String> {
    let candidates = [
        &output["result"]["exec_id"],
        &output["result"]["observation"]["exec_id"],
        &output["result"]["meta"]["exec_id"],
        &output["artifacts"]["exec"]["exec_id"],
    ];
    candidates
        .iter()
        .filter_map(|v| v.as_str())
        .map(str::trim)
        .find(|s| s.starts_with("e_") && s.len() == 18)
        .map(str::to_string)
}

/// Preview of the child's output for the parent's input, capped at 4 KiB.
fn cap_previous_output(output_json: Option<&Value>) -> Value {
    let Some(output) = output_json else {
        return Value::Null;
    };
    let Some(map) = output.as_object() else {
        return output.clone();
    };

    let mut preview = serde_json::Map::new();
    let result = &output["result"];
    if !result["observation"].is_null() {
        preview.insert("observation".to_string(), result["observation"].clone());
    }
    if preview.is_empty() && !result.is_null() {
        preview.insert("result".to_string(), result.clone());
    }
    if preview.is_empty() {
        for (k, v) in map.iter().take(3) {
            preview.insert(k.clone(), v.clone());
        }
    }

    let rendered = Value::Object(preview);
    let raw = rendered.to_string();
    if raw.len() <= PREVIOUS_OUTPUT_CAP_BYTES {
        rendered
    } else {
        json!({"_truncated": true, "preview_bytes": raw.len()})
    }
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max).collect();
        format!("{truncated}...")
    }
}
