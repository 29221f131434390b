pub mod handlers;
pub mod ws;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use thiserror::Error;
use tower_http::trace::TraceLayer;

use crate::error::{StoreError, VerifyError};
use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    let api_routes = Router::new()
        .route("/health", get(handlers::health))
        .route("/documents/:id/verify", post(handlers::start_verification))
        .route(
            "/documents/:id/progress",
            get(handlers::get_progress).put(handlers::put_progress),
        )
        .route("/documents/:id/progress/ws", get(ws::progress_socket))
        .route("/documents/:id/result", get(handlers::get_result));

    Router::new()
        .nest("/api/v1", api_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error(transparent)]
    Verify(#[from] VerifyError),
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        ApiError::Verify(VerifyError::Store(e))
    }
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
    code: &'static str,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
            ApiError::Conflict(_) => (StatusCode::CONFLICT, "CONFLICT"),
            ApiError::Verify(VerifyError::Store(StoreError::NotFound(_))) => {
                (StatusCode::NOT_FOUND, "NOT_FOUND")
            }
            ApiError::Verify(VerifyError::Store(_)) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "STORAGE_ERROR")
            }
            ApiError::Verify(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        };

        let body = ErrorResponse {
            error: self.to_string(),
            code,
        };
        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

/// Document ids end up in storage keys.
pub(crate) fn validate_document_id(id: &str) -> ApiResult<()> {
    let ok = !id.is_empty()
        && id.len() <= 128
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && !id.starts_with('.');
    if ok {
        Ok(())
    } else {
        Err(ApiError::BadRequest(format!("invalid document id: {:?}", id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::Request;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use crate::config::RunSettings;
    use crate::footnotes::sample_footnotes;
    use crate::pipeline::{ToolScope, VerificationPipeline};
    use crate::progress::store::MemorySnapshotStore;
    use crate::progress::ProgressHub;
    use crate::storage::MemoryBlobStore;
    use crate::testing::{text_reply, tool_reply, verdict_json, ScriptedModel, ScriptedTools};

    fn app() -> Router {
        let model = ScriptedModel::new(|_, _| Ok(text_reply(verdict_json("supports", "https://s"))));
        app_with(model, ScriptedTools::default())
    }

    fn app_with(model: ScriptedModel, tools: ScriptedTools) -> Router {
        let blobs = Arc::new(MemoryBlobStore::default());
        let pipeline = VerificationPipeline::new(
            Arc::new(model),
            ToolScope::Shared(Arc::new(tools)),
            RunSettings::default(),
            None,
            blobs.clone(),
        );
        let hub = ProgressHub::new(Arc::new(MemorySnapshotStore::default()));
        create_router(AppState::new(Arc::new(pipeline), Arc::new(hub), blobs))
    }

    async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(match body {
                Some(b) => Body::from(b.to_string()),
                None => Body::empty(),
            })
            .unwrap();
        let resp = app.clone().oneshot(request).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn test_health() {
        let (status, body) = call(&app(), "GET", "/api/v1/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_progress_is_null_until_set() {
        let app = app();
        let (status, body) = call(&app, "GET", "/api/v1/documents/doc-1/progress", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.is_null());

        let snapshot = json!({ "status": "processing", "footnoteCount": 2, "verifications": [] });
        let (status, stored) =
            call(&app, "PUT", "/api/v1/documents/doc-1/progress", Some(snapshot)).await;
        assert_eq!(status, StatusCode::OK);
        assert!(stored["updatedAt"].is_string());

        let (_, body) = call(&app, "GET", "/api/v1/documents/doc-1/progress", None).await;
        assert_eq!(body, stored);
    }

    #[tokio::test]
    async fn test_missing_result_is_404() {
        let (status, body) = call(&app(), "GET", "/api/v1/documents/nope/result", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_verify_accepts_then_result_appears() {
        let app = app();
        let request = json!({ "footnotes": sample_footnotes(2) });
        let (status, body) =
            call(&app, "POST", "/api/v1/documents/doc-9/verify", Some(request)).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["status"], "processing");
        assert_eq!(body["footnoteCount"], 2);

        let mut result = Value::Null;
        for _ in 0..100 {
            let (status, body) = call(&app, "GET", "/api/v1/documents/doc-9/result", None).await;
            if status == StatusCode::OK {
                result = body;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(result["status"], "complete");
        assert_eq!(result["verifications"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_starts_run_once() {
        let model = ScriptedModel::new(|_, turns| {
            Ok(match turns.len() {
                1 => tool_reply(&[("read_url", json!({ "url": "https://s" }))]),
                _ => text_reply(verdict_json("supports", "https://s")),
            })
        });
        let app = app_with(
            model,
            ScriptedTools::stalling_on(&["Claim number 1", "Claim number 2"]),
        );
        let request = json!({ "footnotes": sample_footnotes(2) });

        let (first, second) = tokio::join!(
            call(&app, "POST", "/api/v1/documents/doc-7/verify", Some(request.clone())),
            call(&app, "POST", "/api/v1/documents/doc-7/verify", Some(request)),
        );
        let mut statuses = vec![first.0, second.0];
        statuses.sort();
        assert_eq!(statuses, vec![StatusCode::ACCEPTED, StatusCode::CONFLICT]);
    }

    #[tokio::test]
    async fn test_invalid_document_id_is_rejected() {
        let (status, _) = call(&app(), "GET", "/api/v1/documents/..%2Fetc/progress", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(validate_document_id("report-2024_v2.final").is_ok());
        assert!(validate_document_id("a/b").is_err());
    }
}
