//! Conversation endpoints.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use lonelycat::{Conversation, Message, MessageCreateRequest};

use crate::app::AppState;
use crate::error::ApiError;

#[derive(Deserialize)]
pub struct PageQuery {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[derive(Deserialize)]
pub struct ConversationCreateBody {
    #[serde(default = "default_title")]
    pub title: String,
}

fn default_title() -> String {
    "New chat".to_string()
}

#[derive(Deserialize)]
pub struct ConversationUpdateBody {
    pub title: Option<String>,
}

#[derive(Deserialize)]
pub struct MessageCreateBody {
    pub content: String,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub source_ref: Option<Value>,
    #[serde(default)]
    pub meta_json: Option<Value>,
    #[serde(default)]
    pub client_msg_id: Option<String>,
}

fn serialize_conversation(conv: &Conversation) -> Value {
    json!({
        "id": conv.id,
        "title": conv.title,
        "created_at": conv.created_at.to_rfc3339(),
        "updated_at": conv.updated_at.to_rfc3339(),
        "has_unread": conv.has_unread(),
        "last_read_at": conv.last_read_at.map(|t| t.to_rfc3339()),
        "meta_json": conv.meta_json,
    })
}

fn serialize_message(msg: &Message) -> Value {
    json!({
        "id": msg.id,
        "conversation_id": msg.conversation_id,
        "role": msg.role.as_str(),
        "content": msg.content,
        "created_at": msg.created_at.to_rfc3339(),
        "source_ref": msg.source_ref,
        "meta_json": msg.meta_json,
        "client_msg_id": msg.client_msg_id,
    })
}

pub async fn list(
    State(state): State<Arc<AppState>>,
    Query(page): Query<PageQuery>,
) -> Result<Json<Value>, ApiError> {
    let conversations = state
        .chat_store
        .list_conversations(page.limit, page.offset)
        .await?;
    Ok(Json(json!({
        "items": conversations.iter().map(serialize_conversation).collect::<Vec<_>>(),
    })))
}

pub async fn create(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ConversationCreateBody>,
) -> Result<Json<Value>, ApiError> {
    let conversation = state.chat_store.create_conversation(&body.title).await?;
    Ok(Json(serialize_conversation(&conversation)))
}

pub async fn update(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<ConversationUpdateBody>,
) -> Result<Json<Value>, ApiError> {
    let conversation = match body.title {
        Some(title) => state.chat_store.update_conversation_title(&id, &title).await?,
        None => state.chat_store.get_conversation(&id).await?,
    };
    conversation
        .map(|c| Json(serialize_conversation(&c)))
        .ok_or_else(|| ApiError::not_found("Conversation not found"))
}

pub async fn delete(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    if state.chat_store.delete_conversation(&id).await? {
        Ok(Json(json!({"deleted": true})))
    } else {
        Err(ApiError::not_found("Conversation not found"))
    }
}

pub async fn mark_read(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state
        .chat_store
        .mark_read(&id)
        .await?
        .map(|c| Json(serialize_conversation(&c)))
        .ok_or_else(|| ApiError::not_found("Conversation not found"))
}

pub async fn messages(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(page): Query<PageQuery>,
) -> Result<Json<Value>, ApiError> {
    if state.chat_store.get_conversation(&id).await?.is_none() {
        return Err(ApiError::not_found("Conversation not found"));
    }
    let messages = state
        .chat_store
        .list_messages(&id, page.limit, page.offset)
        .await?;
    Ok(Json(json!({
        "items": messages.iter().map(serialize_message).collect::<Vec<_>>(),
    })))
}

pub async fn create_message(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<MessageCreateBody>,
) -> Result<Json<Value>, ApiError> {
    let outcome = state
        .orchestrator
        .create_message(
            &id,
            MessageCreateRequest {
                content: body.content,
                role: body.role,
                source_ref: body.source_ref,
                meta_json: body.meta_json,
                client_msg_id: body.client_msg_id,
            },
        )
        .await?;
    Ok(Json(json!({
        "user_message": outcome.user_message.as_ref().map(serialize_message),
        "assistant_message": outcome.assistant_message.as_ref().map(serialize_message),
        "duplicate": outcome.duplicate,
    })))
}

pub async fn runs(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(page): Query<PageQuery>,
) -> Result<Json<Value>, ApiError> {
    let runs = state
        .chat_store
        .list_runs_for_conversation(&id, page.limit.unwrap_or(50))
        .await?;
    let items: Vec<Value> = runs
        .iter()
        .map(|r| {
            json!({
                "id": r.id,
                "type": r.run_type,
                "title": r.title,
                "conversation_id": r.conversation_id,
                "status": r.status.as_str(),
                "input_json": r.input_json,
                "output_json": r.output_json,
                "error": r.error,
                "created_at": r.created_at.to_rfc3339(),
                "updated_at": r.updated_at.to_rfc3339(),
            })
        })
        .collect();
    Ok(Json(json!({"items": items})))
}
