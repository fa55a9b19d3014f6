//! Transcript-to-form extraction prompts and field coercion.
//!
//! The inverse of report generation: a noisy voice transcript (or pasted
//! free text) goes through two model calls - a cleaning pass that fixes
//! mis-transcribed medical terminology, then an extraction pass that maps
//! the cleaned prose onto the fixed form-field vocabulary.

use serde_json::Value;

use crate::extract::flatten_to_text;
use crate::report::FieldMap;

/// Form field ids the extraction prompt may populate. Keys mirror the
/// browser form's element ids exactly; anything else the model invents is
/// dropped.
pub const FORM_FIELDS: [&str; 39] = [
    "room",
    "name",
    "age-sex",
    "md",
    "allergies",
    "code-status",
    "isolation",
    "diagnosis",
    "history",
    "loc",
    "pupils",
    "sedation-pain",
    "delirium-score",
    "evd",
    "temperature",
    "hr-rhythm",
    "bp-map",
    "pulses",
    "pacemaker",
    "iabp",
    "o2-delivery",
    "vent-settings",
    "trach-airway",
    "breath-sounds",
    "diet",
    "abdomen",
    "urine-output",
    "iv-lines",
    "art-line",
    "central-line",
    "drains-tubes",
    "skin-integrity",
    "traction-fixators",
    "fractures-braces",
    "labs-diagnostics",
    "family-communication",
    "drips",
    "medications",
    "plan",
];

/// Stage 1: correct the raw voice-to-text transcript.
pub fn cleaning_prompt(transcript: &str) -> String {
    format!(
        r#"You are a highly skilled medical transcriptionist AI. Your task is to correct the following
raw, potentially inaccurate voice-to-text transcript from an ICU nurse.
- Correct any spelling and grammatical errors.
- Most importantly, correct any misspelled medical terminology, drug names, or clinical acronyms
  to their proper medical spelling. For example, if you see "leave a fed", correct it to
  "levophed". If you see "proper fall", correct it to "propofol".
- Do not summarize. Return only the corrected, clean version of the full transcript.

Raw Transcript:
---
{transcript}
---"#
    )
}

/// Stage 2: extract form-field values from the cleaned transcript.
pub fn extraction_prompt(cleaned: &str) -> String {
    let keys = FORM_FIELDS.join(", ");
    format!(
        r#"You are an expert data extraction AI. Your task is to analyze the following CLEANED verbal
report from an ICU nurse and parse the information into a structured JSON object.
The JSON object keys MUST correspond to the form field IDs.
The keys are: {keys}.

Extract the relevant information for each key from the text. If information for a key is not
present, omit the key from the final JSON object.

Respond with ONLY the JSON object - no surrounding prose, no markdown, no code fences.

Cleaned transcript to analyze:
---
{cleaned}
---"#
    )
}

/// Reduce parsed extraction output to the known field vocabulary, coercing
/// every value to a plain string.
pub fn coerce_fields(value: &Value) -> FieldMap {
    let mut fields = FieldMap::new();
    let Some(map) = value.as_object() else {
        return fields;
    };
    for key in FORM_FIELDS {
        if let Some(val) = map.get(key) {
            if val.is_null() {
                continue;
            }
            fields.insert(key.to_string(), Value::String(flatten_to_text(val)));
        }
    }
    fields
}
