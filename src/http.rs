//! HTTP surface: router, handlers, and error mapping.
//!
//! Every handler is a thin request/response adapter: check identity, parse
//! the JSON body, call the model and/or store, reshape, respond. Errors
//! are caught here and rendered as `{"error": message}` with the status
//! codes the browser client expects.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{error, info, warn};

use crate::auth::AuthUser;
use crate::extract::{parse_model_json, MalformedModelOutput};
use crate::gemini_client::{AiError, TextGenerator};
use crate::report::{handoff_prompt, FieldMap, Report};
use crate::store::{DraftStore, StoreError};
use crate::transcript;

const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Shared handler state: the two external clients, constructed once at
/// startup and injected.
#[derive(Clone)]
pub struct AppState {
    pub model: Arc<dyn TextGenerator>,
    pub store: Arc<dyn DraftStore>,
}

/// Handler-boundary error. Maps the internal error taxonomy onto the
/// fixed status vocabulary (401 comes from the auth extractor, 405 from
/// the router).
#[derive(Debug)]
pub enum ApiError {
    Validation(&'static str),
    Ai(AiError),
    MalformedModelOutput(MalformedModelOutput),
    Store(StoreError),
    DraftNotFound,
}

impl From<AiError> for ApiError {
    fn from(err: AiError) -> Self {
        Self::Ai(err)
    }
}

impl From<MalformedModelOutput> for ApiError {
    fn from(err: MalformedModelOutput) -> Self {
        Self::MalformedModelOutput(err)
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        Self::Store(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Validation(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.to_string()),
            ApiError::Ai(err) => {
                error!("model call failed: {}", err);
                (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
            }
            ApiError::MalformedModelOutput(err) => {
                // Keep the offending output in the log, not the response.
                error!("unparseable model output: {}; raw: {:?}", err.source, err.raw);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "The AI returned an invalid JSON response. Please try again.".to_string(),
                )
            }
            ApiError::Store(err) => {
                error!("store call failed: {}", err);
                (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
            }
            ApiError::DraftNotFound => {
                return (
                    StatusCode::NOT_FOUND,
                    Json(json!({ "message": "No saved draft found." })),
                )
                    .into_response();
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/report", post(generate_report))
        .route("/api/draft", get(load_draft).post(save_draft))
        .route("/api/transcript", post(process_transcript))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateReportRequest {
    patient_data: Option<FieldMap>,
}

/// POST /api/report - synthesize an SBAR report from the submitted form.
async fn generate_report(
    State(state): State<AppState>,
    user: AuthUser,
    Json(body): Json<GenerateReportRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let patient_data = body
        .patient_data
        .filter(|data| !data.is_empty())
        .ok_or(ApiError::Validation("Missing patientData in request body."))?;

    info!(
        "generating report for user {} ({} fields)",
        user.sub,
        patient_data.len()
    );

    // Bookkeeping, not the deliverable: never fail the report over it.
    if let Err(err) = state
        .store
        .record_usage(&user.sub, user.email_or_sub())
        .await
    {
        warn!("usage recording failed for user {}: {}", user.sub, err);
    }

    let prompt = handoff_prompt(&patient_data);
    let raw = state.model.generate(&prompt).await?;
    let value = parse_model_json(&raw)?;
    let report = Report::from_model_value(&value);

    Ok(Json(json!({ "report": report })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SaveDraftRequest {
    form_data: Option<FieldMap>,
}

/// POST /api/draft - upsert the caller's latest form draft.
async fn save_draft(
    State(state): State<AppState>,
    user: AuthUser,
    Json(body): Json<SaveDraftRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let form_data = body
        .form_data
        .ok_or(ApiError::Validation("Missing formData in request body."))?;

    state.store.save_draft(&user.sub, &form_data).await?;
    Ok(Json(json!({ "message": "Draft saved successfully" })))
}

/// GET /api/draft - fetch the caller's latest form draft.
async fn load_draft(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<Json<serde_json::Value>, ApiError> {
    let form_data = state
        .store
        .load_draft(&user.sub)
        .await?
        .ok_or(ApiError::DraftNotFound)?;

    Ok(Json(json!({ "formData": form_data })))
}

#[derive(Debug, Deserialize)]
struct ProcessTranscriptRequest {
    transcript: Option<String>,
}

/// POST /api/transcript - two-stage extraction of form fields from a
/// voice or free-text report. Either stage failing aborts the whole
/// operation; there is no partial result.
async fn process_transcript(
    State(state): State<AppState>,
    user: AuthUser,
    Json(body): Json<ProcessTranscriptRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let raw_transcript = body
        .transcript
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .ok_or(ApiError::Validation("Missing transcript in request body."))?;

    info!(
        "processing transcript for user {} ({} chars)",
        user.sub,
        raw_transcript.len()
    );

    let cleaned = state
        .model
        .generate(&transcript::cleaning_prompt(&raw_transcript))
        .await?;
    let extracted = state
        .model
        .generate(&transcript::extraction_prompt(&cleaned))
        .await?;

    let value = parse_model_json(&extracted)?;
    let form_data = transcript::coerce_fields(&value);

    info!(
        "transcript extraction complete for user {} ({} fields)",
        user.sub,
        form_data.len()
    );
    Ok(Json(json!({ "formData": form_data })))
}
