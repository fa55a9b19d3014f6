//! Google Gemini API client for report and extraction prompts.
//!
//! Thin wrapper around the Gemini generateContent endpoint for
//! single-turn text generation. Upstream failures are surfaced to the
//! caller immediately; there is no retry loop because a human is waiting
//! on the other end and will simply try again.

use async_trait::async_trait;
use reqwest::header::{HeaderValue, CONTENT_TYPE};
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

const GEMINI_ENDPOINT: &str = "https://generativelanguage.googleapis.com/v1beta/models";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors from the generative-model client.
#[derive(Debug, Error)]
pub enum AiError {
    #[error("generative API key is not configured")]
    MissingCredential,

    #[error("generative API request failed: {0}")]
    Upstream(String),
}

/// Single-turn text generation, behind a trait so handlers can be
/// exercised with a scripted model in tests.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String, AiError>;
}

pub struct GeminiClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

// -- Response types --

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    content: GeminiResponseContent,
}

#[derive(Debug, Deserialize)]
struct GeminiResponseContent {
    #[serde(default)]
    parts: Vec<GeminiResponsePart>,
}

#[derive(Debug, Deserialize)]
struct GeminiResponsePart {
    text: Option<String>,
}

/// Structured error body returned by the provider on non-success status.
#[derive(Debug, Deserialize)]
struct GeminiErrorBody {
    error: GeminiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct GeminiErrorDetail {
    message: String,
}

impl GeminiClient {
    pub fn new(api_key: &str, model: &str) -> Result<Self, AiError> {
        if api_key.trim().is_empty() {
            return Err(AiError::MissingCredential);
        }

        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| AiError::Upstream(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: GEMINI_ENDPOINT.to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
        })
    }

    #[cfg(test)]
    fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    fn build_request_body(prompt: &str) -> serde_json::Value {
        serde_json::json!({
            "contents": [{
                "parts": [{"text": prompt}]
            }]
        })
    }

    fn extract_text(response: &GeminiResponse) -> Option<String> {
        response
            .candidates
            .first()
            .and_then(|c| c.content.parts.iter().find_map(|p| p.text.as_ref()))
            .cloned()
    }
}

#[async_trait]
impl TextGenerator for GeminiClient {
    async fn generate(&self, prompt: &str) -> Result<String, AiError> {
        let url = format!("{}/{}:generateContent", self.base_url, self.model);
        let body = Self::build_request_body(prompt);

        info!("Gemini generation: prompt={} chars", prompt.len());

        let response = self
            .client
            .post(&url)
            .header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
            .header(
                "x-goog-api-key",
                HeaderValue::from_str(&self.api_key)
                    .map_err(|e| AiError::Upstream(format!("invalid API key header: {}", e)))?,
            )
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AiError::Upstream(format!(
                        "Gemini request timed out after {}s",
                        REQUEST_TIMEOUT.as_secs()
                    ))
                } else {
                    AiError::Upstream(format!("Gemini request failed: {}", e))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            // Prefer the provider's own message when the body is structured.
            let message = serde_json::from_str::<GeminiErrorBody>(&error_body)
                .map(|b| b.error.message)
                .unwrap_or_else(|_| format!("Gemini API error {}", status));
            return Err(AiError::Upstream(message));
        }

        let gemini_response: GeminiResponse = response
            .json()
            .await
            .map_err(|e| AiError::Upstream(format!("failed to parse Gemini response: {}", e)))?;

        let text = Self::extract_text(&gemini_response)
            .ok_or_else(|| AiError::Upstream("Gemini response contained no text".to_string()))?;

        debug!("Gemini generation complete: {} chars", text.len());
        Ok(text)
    }
}
