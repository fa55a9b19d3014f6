//! Firestore REST implementation of the draft store.
//!
//! One document per user under `users/{subject}`. Draft saves are
//! field-masked so the usage-accounting fields living in the same document
//! are never clobbered; usage increments are delegated to a server-side
//! field transform so concurrent requests cannot lose counts.
//!
//! Authentication is the service-account JWT-bearer grant: sign an RS256
//! assertion, exchange it for a bearer token, cache the token until close
//! to expiry.

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::config::ServiceAccount;
use crate::report::FieldMap;
use crate::store::{DraftStore, StoreError};

const FIRESTORE_ENDPOINT: &str = "https://firestore.googleapis.com/v1";
const TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const DATASTORE_SCOPE: &str = "https://www.googleapis.com/auth/datastore";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Refresh the cached token this many seconds before it actually expires.
const TOKEN_EXPIRY_BUFFER_SECS: i64 = 300;

#[derive(Debug, Serialize)]
struct Claims {
    iss: String,
    scope: String,
    aud: String,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

#[derive(Debug, Clone)]
struct CachedToken {
    access_token: String,
    expires_at: i64,
}

impl CachedToken {
    fn is_expired(&self, now: i64) -> bool {
        now >= self.expires_at - TOKEN_EXPIRY_BUFFER_SECS
    }
}

pub struct FirestoreStore {
    client: reqwest::Client,
    account: ServiceAccount,
    signing_key: EncodingKey,
    token: RwLock<Option<CachedToken>>,
}

impl FirestoreStore {
    pub fn new(account: ServiceAccount) -> Result<Self, StoreError> {
        let signing_key = EncodingKey::from_rsa_pem(account.private_key.as_bytes())
            .map_err(|e| StoreError::Credential(e.to_string()))?;

        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        info!(
            "Firestore store initialized for project {}",
            account.project_id
        );

        Ok(Self {
            client,
            account,
            signing_key,
            token: RwLock::new(None),
        })
    }

    fn user_doc_url(&self, user_id: &str) -> String {
        format!(
            "{}/{}",
            FIRESTORE_ENDPOINT,
            user_doc_name(&self.account.project_id, user_id)
        )
    }

    fn commit_url(&self) -> String {
        format!(
            "{}/projects/{}/databases/(default)/documents:commit",
            FIRESTORE_ENDPOINT, self.account.project_id
        )
    }

    fn sign_assertion(&self, now: i64) -> Result<String, StoreError> {
        let claims = Claims {
            iss: self.account.client_email.clone(),
            scope: DATASTORE_SCOPE.to_string(),
            aud: TOKEN_URI.to_string(),
            iat: now,
            exp: now + 3600,
        };
        jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &self.signing_key)
            .map_err(|e| StoreError::Credential(e.to_string()))
    }

    /// Get a bearer token, reusing the cached one until near expiry.
    async fn access_token(&self) -> Result<String, StoreError> {
        let now = Utc::now().timestamp();

        if let Some(token) = self.token.read().await.as_ref() {
            if !token.is_expired(now) {
                return Ok(token.access_token.clone());
            }
        }

        let mut guard = self.token.write().await;
        // Another request may have refreshed while we waited for the lock.
        if let Some(token) = guard.as_ref() {
            if !token.is_expired(now) {
                return Ok(token.access_token.clone());
            }
        }

        debug!("refreshing Firestore access token");
        let assertion = self.sign_assertion(now)?;
        let response = self
            .client
            .post(TOKEN_URI)
            .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", &assertion)])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StoreError::Auth(format!("{}: {}", status, body)));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| StoreError::Auth(format!("invalid token response: {}", e)))?;

        let cached = CachedToken {
            access_token: token.access_token.clone(),
            expires_at: now + token.expires_in,
        };
        *guard = Some(cached);
        Ok(token.access_token)
    }

    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, StoreError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        Err(StoreError::Status {
            status: status.as_u16(),
            message,
        })
    }
}

#[async_trait]
impl DraftStore for FirestoreStore {
    async fn save_draft(&self, user_id: &str, form_data: &FieldMap) -> Result<(), StoreError> {
        let token = self.access_token().await?;
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);
        let body = draft_patch_body(form_data, &now);

        let url = format!(
            "{}?updateMask.fieldPaths=formData&updateMask.fieldPaths=formLastUpdated",
            self.user_doc_url(user_id)
        );
        let response = self
            .client
            .patch(&url)
            .bearer_auth(token)
            .json(&body)
            .send()
            .await?;
        Self::check_status(response).await?;

        debug!("draft saved for user {}", user_id);
        Ok(())
    }

    async fn load_draft(&self, user_id: &str) -> Result<Option<FieldMap>, StoreError> {
        let token = self.access_token().await?;
        let response = self
            .client
            .get(self.user_doc_url(user_id))
            .bearer_auth(token)
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = Self::check_status(response).await?;

        let document: Value = response
            .json()
            .await
            .map_err(|e| StoreError::Decode(e.to_string()))?;

        let Some(form_data) = document
            .get("fields")
            .and_then(|fields| fields.get("formData"))
        else {
            return Ok(None);
        };

        match from_firestore_value(form_data) {
            Value::Object(map) => Ok(Some(map)),
            other => Err(StoreError::Decode(format!(
                "formData was not a map: {}",
                other
            ))),
        }
    }

    async fn record_usage(&self, user_id: &str, email: &str) -> Result<(), StoreError> {
        let token = self.access_token().await?;
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);
        let doc_name = user_doc_name(&self.account.project_id, user_id);
        let body = usage_commit_body(&doc_name, email, &now);

        let response = self
            .client
            .post(self.commit_url())
            .bearer_auth(token)
            .json(&body)
            .send()
            .await?;
        Self::check_status(response).await?;

        debug!("usage recorded for user {}", user_id);
        Ok(())
    }
}

/// Full resource name of a user document, as used in commit writes.
fn user_doc_name(project_id: &str, user_id: &str) -> String {
    format!(
        "projects/{}/databases/(default)/documents/users/{}",
        project_id, user_id
    )
}

/// Body for the field-masked draft upsert. Only the two draft fields are
/// written, so usage fields in the same document survive.
fn draft_patch_body(form_data: &FieldMap, now: &str) -> Value {
    json!({
        "fields": {
            "formData": to_firestore_value(&Value::Object(form_data.clone())),
            "formLastUpdated": { "timestampValue": now }
        }
    })
}

/// Commit request that upserts email/last-used and applies a server-side
/// increment to the usage counter (a missing field starts from zero).
fn usage_commit_body(doc_name: &str, email: &str, now: &str) -> Value {
    json!({
        "writes": [
            {
                "update": {
                    "name": doc_name,
                    "fields": {
                        "email": { "stringValue": email },
                        "last_used": { "timestampValue": now }
                    }
                },
                "updateMask": { "fieldPaths": ["email", "last_used"] }
            },
            {
                "transform": {
                    "document": doc_name,
                    "fieldTransforms": [
                        { "fieldPath": "usage_count", "increment": { "integerValue": "1" } }
                    ]
                }
            }
        ]
    })
}

/// Encode a JSON value into Firestore's typed value representation.
fn to_firestore_value(value: &Value) -> Value {
    match value {
        Value::Null => json!({ "nullValue": null }),
        Value::Bool(b) => json!({ "booleanValue": b }),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                // Firestore represents 64-bit integers as strings.
                json!({ "integerValue": i.to_string() })
            } else {
                json!({ "doubleValue": n.as_f64() })
            }
        }
        Value::String(s) => json!({ "stringValue": s }),
        Value::Array(items) => json!({
            "arrayValue": {
                "values": items.iter().map(to_firestore_value).collect::<Vec<_>>()
            }
        }),
        Value::Object(map) => {
            let fields: serde_json::Map<String, Value> = map
                .iter()
                .map(|(k, v)| (k.clone(), to_firestore_value(v)))
                .collect();
            json!({ "mapValue": { "fields": fields } })
        }
    }
}

/// Decode Firestore's typed value representation back into plain JSON.
fn from_firestore_value(value: &Value) -> Value {
    let Some(map) = value.as_object() else {
        return Value::Null;
    };

    if let Some(s) = map.get("stringValue").and_then(Value::as_str) {
        return Value::String(s.to_string());
    }
    if let Some(s) = map.get("integerValue").and_then(Value::as_str) {
        return s
            .parse::<i64>()
            .map(Value::from)
            .unwrap_or(Value::String(s.to_string()));
    }
    if let Some(n) = map.get("doubleValue") {
        return n.clone();
    }
    if let Some(b) = map.get("booleanValue").and_then(Value::as_bool) {
        return Value::Bool(b);
    }
    if let Some(ts) = map.get("timestampValue").and_then(Value::as_str) {
        return Value::String(ts.to_string());
    }
    if let Some(fields) = map
        .get("mapValue")
        .and_then(|m| m.get("fields"))
        .and_then(Value::as_object)
    {
        let decoded: serde_json::Map<String, Value> = fields
            .iter()
            .map(|(k, v)| (k.clone(), from_firestore_value(v)))
            .collect();
        return Value::Object(decoded);
    }
    if let Some(values) = map
        .get("arrayValue")
        .and_then(|a| a.get("values"))
        .and_then(Value::as_array)
    {
        return Value::Array(values.iter().map(from_firestore_value).collect());
    }
    Value::Null
}
