use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use super::{validate_document_id, ApiError, ApiResult};
use crate::footnotes::types::{DocumentResult, Footnote, ProgressSnapshot};
use crate::state::AppState;
use crate::storage::{get_json, results_key};

#[derive(Debug, Deserialize)]
pub struct VerifyRequest {
    pub footnotes: Vec<Footnote>,
}

pub async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "status": "ok", "version": state.version }))
}

/// Start a background run; replies with the initial snapshot.
pub async fn start_verification(
    State(state): State<AppState>,
    Path(document_id): Path<String>,
    Json(request): Json<VerifyRequest>,
) -> ApiResult<(StatusCode, Json<ProgressSnapshot>)> {
    validate_document_id(&document_id)?;
    let handle = state.progress.handle(&document_id);

    let total = request.footnotes.len();
    let initial = handle
        .begin(ProgressSnapshot::processing(total, Vec::new()))
        .await?
        .ok_or_else(|| {
            ApiError::Conflict(format!("document {} is already being verified", document_id))
        })?;
    info!(document_id = %document_id, footnotes = total, "verification requested");
    state
        .pipeline
        .spawn(document_id, request.footnotes, handle);

    Ok((StatusCode::ACCEPTED, Json(initial)))
}

/// Pull-based read; `null` before the first snapshot.
pub async fn get_progress(
    State(state): State<AppState>,
    Path(document_id): Path<String>,
) -> ApiResult<Json<Option<ProgressSnapshot>>> {
    validate_document_id(&document_id)?;
    Ok(Json(state.progress.handle(&document_id).get().await?))
}

/// Whole-snapshot replacement; returns the stored snapshot.
pub async fn put_progress(
    State(state): State<AppState>,
    Path(document_id): Path<String>,
    Json(snapshot): Json<ProgressSnapshot>,
) -> ApiResult<Json<ProgressSnapshot>> {
    validate_document_id(&document_id)?;
    Ok(Json(state.progress.handle(&document_id).set(snapshot).await?))
}

pub async fn get_result(
    State(state): State<AppState>,
    Path(document_id): Path<String>,
) -> ApiResult<Json<DocumentResult>> {
    validate_document_id(&document_id)?;
    get_json(state.blobs.as_ref(), &results_key(&document_id))
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("no result for document {}", document_id)))
}
