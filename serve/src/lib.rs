//! HTTP API surface for the LonelyCat core.
//!
//! One router over the conversation orchestrator, the memory store, the
//! sandbox service and the execution history; typed errors map to status
//! codes per the platform's error taxonomy.

pub mod app;
pub mod conversations;
pub mod error;
pub mod executions;
pub mod memory_api;
pub mod sandbox_api;

pub use app::{build_router, AppState};
pub use error::ApiError;

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use super::*;

    async fn test_app() -> (axum::Router, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let state = AppState::new(dir.path()).unwrap();
        (build_router(Arc::new(state)), dir)
    }

    async fn request(
        app: &axum::Router,
        method: &str,
        uri: &str,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(v) => {
                builder = builder.header("content-type", "application/json");
                Body::from(v.to_string())
            }
            None => Body::empty(),
        };
        let response = app
            .clone()
            .oneshot(builder.body(body).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, value)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn conversation_crud_and_unread_flow() {
        let (app, _dir) = test_app().await;

        let (status, created) =
            request(&app, "POST", "/conversations", Some(json!({"title": "demo"}))).await;
        assert_eq!(status, StatusCode::OK);
        let id = created["id"].as_str().unwrap().to_string();
        assert_eq!(created["has_unread"], false);

        // Insert an assistant message via the explicit role shortcut.
        let (status, _) = request(
            &app,
            "POST",
            &format!("/conversations/{id}/messages"),
            Some(json!({"content": "imported", "role": "assistant"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (_, listed) = request(&app, "GET", "/conversations", None).await;
        assert_eq!(listed["items"][0]["has_unread"], true);

        let (status, read) = request(
            &app,
            "PATCH",
            &format!("/conversations/{id}/mark-read"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(read["has_unread"], false);

        let (_, messages) =
            request(&app, "GET", &format!("/conversations/{id}/messages"), None).await;
        assert_eq!(messages["items"].as_array().unwrap().len(), 1);

        let (status, _) = request(&app, "DELETE", &format!("/conversations/{id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = request(&app, "GET", &format!("/conversations/{id}/messages"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn memory_proposal_accept_flow() {
        let (app, _dir) = test_app().await;

        let (status, proposal) = request(
            &app,
            "POST",
            "/proposals",
            Some(json!({
                "payload": {"key": "preferred_name", "value": "Alice"},
                "source_ref": {"kind": "conversation", "ref_id": "conv_1"},
                "confidence": 0.9,
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let id = proposal["id"].as_str().unwrap().to_string();

        let (status, accepted) = request(
            &app,
            "POST",
            &format!("/proposals/{id}/accept"),
            Some(json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(accepted["fact"]["key"], "preferred_name");
        assert_eq!(accepted["fact"]["version"], 1);

        let (_, facts) = request(&app, "GET", "/facts?status=active", None).await;
        assert_eq!(facts["items"].as_array().unwrap().len(), 1);

        let (_, by_key) = request(&app, "GET", "/facts/key/preferred_name?scope=global", None).await;
        assert_eq!(by_key["value"], "Alice");

        // Accept of a non-pending proposal is a 404.
        let (status, _) = request(
            &app,
            "POST",
            &format!("/proposals/{id}/accept"),
            Some(json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (_, audit) = request(&app, "GET", "/audit?target_type=proposal", None).await;
        assert!(!audit["items"].as_array().unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn sandbox_policy_denial_maps_to_403() {
        let (app, _dir) = test_app().await;

        let (status, body) = request(
            &app,
            "POST",
            "/sandbox/execs",
            Some(json!({
                "project_id": "p1",
                "exec": {"kind": "shell", "command": "sh", "args": ["-c", "true"]},
            })),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["detail"]["code"], "POLICY_DENIED");

        // The denial is persisted and listable.
        let (_, execs) = request(&app, "GET", "/sandbox/execs", None).await;
        assert_eq!(execs["items"][0]["status"], "POLICY_DENIED");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn executions_listing_and_statistics() {
        let (app, _dir) = test_app().await;
        let (status, stats) = request(&app, "GET", "/executions/statistics", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(stats["total_executions"], 0);

        let (status, listed) = request(&app, "GET", "/executions?limit=5", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(listed["items"].as_array().unwrap().is_empty());

        let (status, _) = request(&app, "GET", "/executions/exec_missing", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn sandbox_health_reports_writable_workspace() {
        let (app, _dir) = test_app().await;
        let (status, health) = request(&app, "GET", "/sandbox/health?probe=0", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(health["writable_check"], true);
        assert_eq!(health["docker_image"], "lonelycat-sandbox:py312");
    }
}
