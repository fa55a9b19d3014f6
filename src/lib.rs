//! Server-side backend for the ICU SBAR handoff form.
//!
//! The browser client collects patient data in a form; this service turns
//! that data into an SBAR handoff report via the Gemini API, extracts form
//! fields from free-text or voice transcripts, and keeps one draft of the
//! form per authenticated user in Firestore.

pub mod auth;
pub mod config;
pub mod extract;
pub mod firestore;
pub mod gemini_client;
pub mod http;
pub mod report;
pub mod store;
pub mod transcript;
