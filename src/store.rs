//! Draft and usage persistence behind a store trait.

use async_trait::async_trait;
use thiserror::Error;

use crate::report::FieldMap;

/// Document-store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store authentication failed: {0}")]
    Auth(String),

    #[error("invalid service account key: {0}")]
    Credential(String),

    #[error("store request failed: {0}")]
    Network(#[from] reqwest::Error),

    #[error("store returned error status {status}: {message}")]
    Status { status: u16, message: String },

    #[error("stored document could not be decoded: {0}")]
    Decode(String),
}

/// Per-user draft and usage persistence.
///
/// Each authenticated subject owns exactly one document; drafts overwrite
/// wholesale ("latest wins") while usage fields live alongside in the same
/// document and must survive draft saves.
#[async_trait]
pub trait DraftStore: Send + Sync {
    /// Upsert the user's draft, preserving sibling document fields.
    async fn save_draft(&self, user_id: &str, form_data: &FieldMap) -> Result<(), StoreError>;

    /// Fetch the user's draft; `None` when no document or no draft field
    /// exists yet.
    async fn load_draft(&self, user_id: &str) -> Result<Option<FieldMap>, StoreError>;

    /// Create-or-increment the user's usage record and stamp last-used.
    async fn record_usage(&self, user_id: &str, email: &str) -> Result<(), StoreError>;
}
