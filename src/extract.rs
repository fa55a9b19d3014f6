//! Defensive parsing of model output.
//!
//! The upstream model is asked for JSON-only output but is not
//! contractually guaranteed to comply; the most common deviation is
//! wrapping the payload in a markdown code fence. Every endpoint that
//! parses model output goes through [`parse_model_json`] so the cleanup
//! rule cannot drift between call sites: one deterministic fence-strip,
//! one parse attempt.

use serde_json::Value;
use thiserror::Error;

/// The model call succeeded but the payload was not valid JSON.
///
/// Distinct from an upstream failure; carries the raw text so the offending
/// output can be logged for diagnostics.
#[derive(Debug, Error)]
#[error("model output was not valid JSON: {source}")]
pub struct MalformedModelOutput {
    pub raw: String,
    #[source]
    pub source: serde_json::Error,
}

/// Strip a single wrapping triple-backtick code fence (with an optional
/// language tag on the opening line) and surrounding whitespace.
pub fn strip_code_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the rest of the opening line, which may carry a language tag.
    let body = match rest.find('\n') {
        Some(idx) => &rest[idx + 1..],
        None => rest,
    };
    let body = body.trim_end();
    body.strip_suffix("```").unwrap_or(body).trim()
}

/// Parse model output into a JSON value after the fence-strip cleanup.
pub fn parse_model_json(raw: &str) -> Result<Value, MalformedModelOutput> {
    let cleaned = strip_code_fences(raw);
    serde_json::from_str(cleaned).map_err(|source| MalformedModelOutput {
        raw: raw.to_string(),
        source,
    })
}

/// Flatten a JSON value into plain text.
///
/// The report schema requires every value to be a single string, but the
/// model occasionally emits nested objects or arrays (e.g. an assessment
/// broken into per-system keys). Objects become `key: value` lines with
/// bulleted sub-items; arrays become bulleted lines.
pub fn flatten_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Array(items) => items
            .iter()
            .map(|item| format!("\u{2022} {}", scalar_text(item)))
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Object(map) => {
            let mut lines = Vec::new();
            for (key, val) in map {
                match val {
                    Value::Array(items) => {
                        lines.push(format!("{}:", key));
                        for item in items {
                            lines.push(format!("  \u{2022} {}", scalar_text(item)));
                        }
                    }
                    Value::Object(inner) => {
                        lines.push(format!("{}:", key));
                        for (sub_key, sub_val) in inner {
                            lines.push(format!("  \u{2022} {}: {}", sub_key, scalar_text(sub_val)));
                        }
                    }
                    _ => lines.push(format!("{}: {}", key, scalar_text(val))),
                }
            }
            lines.join("\n")
        }
        other => scalar_text(other),
    }
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
