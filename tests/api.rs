//! End-to-end handler tests against the router, with a scripted model and
//! an in-memory store standing in for the external collaborators.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use sbar_service::auth::{EMAIL_HEADER, USER_HEADER};
use sbar_service::gemini_client::{AiError, TextGenerator};
use sbar_service::http::{router, AppState};
use sbar_service::report::FieldMap;
use sbar_service::store::{DraftStore, StoreError};

/// Model stub that pops pre-scripted responses and records every prompt.
struct ScriptedModel {
    responses: Mutex<Vec<Result<String, AiError>>>,
    prompts: Mutex<Vec<String>>,
    calls: AtomicUsize,
}

impl ScriptedModel {
    fn new(responses: Vec<Result<String, AiError>>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses),
            prompts: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        })
    }

    fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn prompt(&self, index: usize) -> String {
        self.prompts.lock().unwrap()[index].clone()
    }
}

#[async_trait]
impl TextGenerator for ScriptedModel {
    async fn generate(&self, prompt: &str) -> Result<String, AiError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().unwrap().push(prompt.to_string());
        let mut responses = self.responses.lock().unwrap();
        if responses.is_empty() {
            return Err(AiError::Upstream("no scripted response left".to_string()));
        }
        responses.remove(0)
    }
}

#[derive(Default, Clone)]
struct UserDoc {
    form_data: Option<FieldMap>,
    email: String,
    usage_count: u64,
    last_used: u64,
}

/// In-memory store with the same merge/not-found semantics as the real
/// document store.
#[derive(Default)]
struct MemoryStore {
    docs: Mutex<HashMap<String, UserDoc>>,
    clock: AtomicUsize,
    calls: AtomicUsize,
    fail_usage: bool,
}

impl MemoryStore {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn failing_usage() -> Arc<Self> {
        Arc::new(Self {
            fail_usage: true,
            ..Self::default()
        })
    }

    fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn doc(&self, user_id: &str) -> Option<UserDoc> {
        self.docs.lock().unwrap().get(user_id).cloned()
    }
}

#[async_trait]
impl DraftStore for MemoryStore {
    async fn save_draft(&self, user_id: &str, form_data: &FieldMap) -> Result<(), StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut docs = self.docs.lock().unwrap();
        let doc = docs.entry(user_id.to_string()).or_default();
        doc.form_data = Some(form_data.clone());
        Ok(())
    }

    async fn load_draft(&self, user_id: &str) -> Result<Option<FieldMap>, StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let docs = self.docs.lock().unwrap();
        Ok(docs.get(user_id).and_then(|doc| doc.form_data.clone()))
    }

    async fn record_usage(&self, user_id: &str, email: &str) -> Result<(), StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_usage {
            return Err(StoreError::Status {
                status: 503,
                message: "store unavailable".to_string(),
            });
        }
        let tick = self.clock.fetch_add(1, Ordering::SeqCst) as u64 + 1;
        let mut docs = self.docs.lock().unwrap();
        let doc = docs.entry(user_id.to_string()).or_default();
        doc.email = email.to_string();
        doc.usage_count += 1;
        doc.last_used = tick;
        Ok(())
    }
}

fn app(model: Arc<ScriptedModel>, store: Arc<MemoryStore>) -> axum::Router {
    router(AppState {
        model: model as Arc<dyn TextGenerator>,
        store: store as Arc<dyn DraftStore>,
    })
}

fn authed(request: axum::http::request::Builder) -> axum::http::request::Builder {
    request
        .header(USER_HEADER, "nurse-1")
        .header(EMAIL_HEADER, "nurse@example.ca")
}

fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
    authed(Request::builder().method(method).uri(uri))
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn fenced_report() -> String {
    let report = json!({
        "situation": "Pt in 4B, post-op day 1.",
        "background": "Penicillin allergy documented.",
        "assessment": "Neurological: alert\nCardiovascular: NSR",
        "recommendation": "Clarify antibiotic order with MD.",
        "ai_suggestion": "!!! CRITICAL SAFETY ALERT: Amoxicillin ordered with documented penicillin allergy."
    });
    format!("```json\n{}\n```", report)
}

#[tokio::test]
async fn unauthenticated_report_is_401_and_touches_nothing() {
    let model = ScriptedModel::new(vec![Ok(fenced_report())]);
    let store = MemoryStore::new();
    let app = app(model.clone(), store.clone());

    let request = Request::builder()
        .method("POST")
        .uri("/api/report")
        .header("content-type", "application/json")
        .body(Body::from(
            json!({"patientData": {"room": "4B"}}).to_string(),
        ))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = body_json(response).await;
    assert_eq!(body["error"], "You must be logged in.");
    assert_eq!(model.call_count(), 0);
    assert_eq!(store.call_count(), 0);
}

#[tokio::test]
async fn unauthenticated_draft_and_transcript_are_401() {
    for (method, uri) in [
        ("POST", "/api/draft"),
        ("GET", "/api/draft"),
        ("POST", "/api/transcript"),
    ] {
        let model = ScriptedModel::new(vec![]);
        let store = MemoryStore::new();
        let app = app(model.clone(), store.clone());

        let mut request = Request::builder().method(method).uri(uri);
        if method == "POST" {
            request = request.header("content-type", "application/json");
        }
        let body = if method == "POST" {
            Body::from("{}")
        } else {
            Body::empty()
        };
        let response = app.oneshot(request.body(body).unwrap()).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED, "{} {}", method, uri);
        assert_eq!(store.call_count(), 0);
    }
}

#[tokio::test]
async fn report_round_trip_preserves_critical_alert() {
    let model = ScriptedModel::new(vec![Ok(fenced_report())]);
    let store = MemoryStore::new();
    let app = app(model.clone(), store.clone());

    let request = json_request(
        "POST",
        "/api/report",
        json!({"patientData": {
            "room": "4B",
            "allergies": "penicillin",
            "medications": "Amoxicillin 500mg"
        }}),
    );
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    let report = &body["report"];
    assert_eq!(report["situation"], "Pt in 4B, post-op day 1.");
    assert!(report["ai_suggestion"]
        .as_str()
        .unwrap()
        .starts_with("!!! CRITICAL SAFETY ALERT:"));

    // The prompt embedded every submitted field.
    let prompt = model.prompt(0);
    assert!(prompt.contains("penicillin"));
    assert!(prompt.contains("Amoxicillin 500mg"));

    // Exactly one usage record for this call.
    let doc = store.doc("nurse-1").unwrap();
    assert_eq!(doc.usage_count, 1);
    assert_eq!(doc.email, "nurse@example.ca");
}

#[tokio::test]
async fn usage_count_reaches_two_after_second_report() {
    let model = ScriptedModel::new(vec![Ok(fenced_report()), Ok(fenced_report())]);
    let store = MemoryStore::new();

    for _ in 0..2 {
        let app = app(model.clone(), store.clone());
        let request = json_request("POST", "/api/report", json!({"patientData": {"room": "4B"}}));
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    let doc = store.doc("nurse-1").unwrap();
    assert_eq!(doc.usage_count, 2);
    assert_eq!(doc.last_used, 2);
}

#[tokio::test]
async fn usage_failure_does_not_fail_report() {
    let model = ScriptedModel::new(vec![Ok(fenced_report())]);
    let store = MemoryStore::failing_usage();
    let app = app(model.clone(), store.clone());

    let request = json_request("POST", "/api/report", json!({"patientData": {"room": "4B"}}));
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(model.call_count(), 1);
}

#[tokio::test]
async fn non_json_model_output_is_500_with_retry_message() {
    let model = ScriptedModel::new(vec![Ok("Sorry, I can't help.".to_string())]);
    let store = MemoryStore::new();
    let app = app(model.clone(), store.clone());

    let request = json_request("POST", "/api/report", json!({"patientData": {"room": "4B"}}));
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = body_json(response).await;
    assert_eq!(
        body["error"],
        "The AI returned an invalid JSON response. Please try again."
    );
}

#[tokio::test]
async fn upstream_failure_surfaces_provider_message() {
    let model = ScriptedModel::new(vec![Err(AiError::Upstream(
        "Resource has been exhausted".to_string(),
    ))]);
    let store = MemoryStore::new();
    let app = app(model.clone(), store.clone());

    let request = json_request("POST", "/api/report", json!({"patientData": {"room": "4B"}}));
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = body_json(response).await;
    assert!(body["error"]
        .as_str()
        .unwrap()
        .contains("Resource has been exhausted"));
}

#[tokio::test]
async fn missing_patient_data_is_validation_error() {
    for body in [json!({}), json!({"patientData": {}})] {
        let model = ScriptedModel::new(vec![]);
        let store = MemoryStore::new();
        let app = app(model.clone(), store.clone());

        let response = app
            .oneshot(json_request("POST", "/api/report", body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_json(response).await;
        assert_eq!(body["error"], "Missing patientData in request body.");
        assert_eq!(model.call_count(), 0);
    }
}

#[tokio::test]
async fn draft_save_then_load_round_trips() {
    let model = ScriptedModel::new(vec![]);
    let store = MemoryStore::new();

    let save = json_request(
        "POST",
        "/api/draft",
        json!({"formData": {"room": "4B", "plan": "extubate in AM"}}),
    );
    let response = app(model.clone(), store.clone()).oneshot(save).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["message"], "Draft saved successfully");

    let load = authed(Request::builder().method("GET").uri("/api/draft"))
        .body(Body::empty())
        .unwrap();
    let response = app(model, store).oneshot(load).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["formData"]["room"], "4B");
    assert_eq!(body["formData"]["plan"], "extubate in AM");
}

#[tokio::test]
async fn draft_load_without_document_is_404() {
    let model = ScriptedModel::new(vec![]);
    let store = MemoryStore::new();
    let app = app(model, store);

    let load = authed(Request::builder().method("GET").uri("/api/draft"))
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(load).await.unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = body_json(response).await;
    assert_eq!(body["message"], "No saved draft found.");
}

#[tokio::test]
async fn transcript_runs_two_stages_and_filters_fields() {
    let cleaned = "Patient in room 4B is on levophed at 5 mcg/min, temperature 38.5.";
    let extracted = json!({
        "room": "4B",
        "drips": "levophed 5 mcg/min",
        "temperature": 38.5,
        "reasoning": "not a form field"
    });
    let model = ScriptedModel::new(vec![
        Ok(cleaned.to_string()),
        Ok(format!("```json\n{}\n```", extracted)),
    ]);
    let store = MemoryStore::new();
    let app = app(model.clone(), store.clone());

    let request = json_request(
        "POST",
        "/api/transcript",
        json!({"transcript": "patient in room four bee on leave a fed at five"}),
    );
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["formData"]["room"], "4B");
    assert_eq!(body["formData"]["drips"], "levophed 5 mcg/min");
    assert_eq!(body["formData"]["temperature"], "38.5");
    assert!(body["formData"].get("reasoning").is_none());

    // Stage 1 saw the raw transcript; stage 2 saw stage 1's output.
    assert_eq!(model.call_count(), 2);
    assert!(model.prompt(0).contains("leave a fed"));
    assert!(model.prompt(1).contains(cleaned));
}

#[tokio::test]
async fn transcript_stage_one_failure_aborts() {
    let model = ScriptedModel::new(vec![Err(AiError::Upstream("model offline".to_string()))]);
    let store = MemoryStore::new();
    let app = app(model.clone(), store.clone());

    let request = json_request("POST", "/api/transcript", json!({"transcript": "some report"}));
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(model.call_count(), 1);
}

#[tokio::test]
async fn transcript_requires_nonempty_text() {
    for body in [json!({}), json!({"transcript": "   "})] {
        let model = ScriptedModel::new(vec![]);
        let store = MemoryStore::new();
        let app = app(model.clone(), store.clone());

        let response = app
            .oneshot(json_request("POST", "/api/transcript", body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(model.call_count(), 0);
    }
}

#[tokio::test]
async fn wrong_method_is_405() {
    let model = ScriptedModel::new(vec![]);
    let store = MemoryStore::new();
    let app = app(model, store);

    let request = authed(Request::builder().method("GET").uri("/api/report"))
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
}

#[tokio::test]
async fn health_is_open() {
    let model = ScriptedModel::new(vec![]);
    let store = MemoryStore::new();
    let app = app(model, store);

    let request = Request::builder()
        .method("GET")
        .uri("/api/health")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
}
