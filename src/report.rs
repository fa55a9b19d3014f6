//! SBAR report schema and the handoff prompt.

use serde::Serialize;
use serde_json::Value;

use crate::extract::flatten_to_text;

/// Form data as sent by the browser: field id to free-text value.
///
/// No keys are required and values arrive as whatever the form held;
/// beyond "non-empty object" the contents are passed through to the model
/// untouched.
pub type FieldMap = serde_json::Map<String, Value>;

/// The keys the model is instructed to produce, in report order.
pub const REPORT_KEYS: [&str; 5] = [
    "situation",
    "background",
    "assessment",
    "recommendation",
    "ai_suggestion",
];

/// Fixed sentence every AI suggestion must end with. The suggestion is a
/// physician-perspective aside, not an order.
pub const SUGGESTION_DISCLAIMER: &str =
    "This is an AI-generated suggestion and must be verified against current orders and local policy.";

/// A generated SBAR handoff report. Held in client memory for render and
/// copy; never persisted server-side.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Report {
    pub situation: String,
    pub background: String,
    pub assessment: String,
    pub recommendation: String,
    pub ai_suggestion: String,
}

/// Build the report-generation prompt from the submitted patient data.
///
/// Deterministic for identical input; the JSON dump keeps the model
/// anchored to exactly what the nurse entered.
pub fn handoff_prompt(patient_data: &FieldMap) -> String {
    let data_json = serde_json::to_string_pretty(&Value::Object(patient_data.clone()))
        .unwrap_or_else(|_| "{}".to_string());

    format!(
        r#"You are an expert Canadian ICU nurse preparing a written handoff report for the next shift.
Based on the following patient data, generate a clear, concise, and professional SBAR
(Situation, Background, Assessment, Recommendation) report.
Synthesize the data into a coherent narrative. Do not just list the data. Focus on the most
critical information. Use Canadian medical terminology and units (e.g., mmol/L).

Patient Data:
{data_json}

Respond with a JSON object containing exactly these keys: "situation", "background",
"assessment", "recommendation", "ai_suggestion".

- "situation": the standard SBAR situation.
- "background": the standard SBAR background.
- "assessment": a SINGLE string organized head-to-toe, one line per system, covering:
  Neurological, Cardiovascular, Respiratory, Gastrointestinal/Genitourinary, Skin/Extremities.
- "recommendation": specific, actionable next steps for the oncoming nurse.
- "ai_suggestion": one short, high-level suggestion from a physician's perspective. It MUST end
  with the sentence: "{SUGGESTION_DISCLAIMER}"

Every value must be a plain string, not a nested object or array.
Respond with ONLY the JSON object - no surrounding prose, no markdown, no code fences."#
    )
}

impl Report {
    /// Shape parsed model output into the fixed report schema.
    ///
    /// Missing keys become empty strings; nested values are flattened to
    /// text so the assessment is always one string with embedded lines.
    pub fn from_model_value(value: &Value) -> Self {
        let field = |key: &str| {
            value
                .get(key)
                .map(flatten_to_text)
                .unwrap_or_default()
        };

        Self {
            situation: field("situation"),
            background: field("background"),
            assessment: field("assessment"),
            recommendation: field("recommendation"),
            ai_suggestion: field("ai_suggestion"),
        }
    }
}
