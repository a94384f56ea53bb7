//! Structured payload recovery from agent output
//!
//! The agent prints banner and log text around a single JSON document.
//! Extraction is kept behind [`PayloadExtractor`] so the brace-matching
//! heuristic can be replaced by a stricter framing contract later.

use serde_json::Value;

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum ExtractError {
    #[error("No JSON response found in agent output")]
    NoPayloadFound,

    #[error("Failed to parse agent output: {detail}")]
    MalformedPayload { detail: String },
}

pub trait PayloadExtractor: Send + Sync {
    fn extract(&self, raw_output: &str) -> Result<Value, ExtractError>;
}

/// Takes the first balanced `{ ... }` region and parses it as JSON.
#[derive(Debug, Clone, Copy, Default)]
pub struct BraceMatchingExtractor;

impl PayloadExtractor for BraceMatchingExtractor {
    fn extract(&self, raw_output: &str) -> Result<Value, ExtractError> {
        let candidate = first_balanced_object(raw_output).ok_or(ExtractError::NoPayloadFound)?;
        serde_json::from_str(candidate).map_err(|e| ExtractError::MalformedPayload {
            detail: e.to_string(),
        })
    }
}

/// Slice from the first `{` to its matching `}`.
///
/// Braces inside JSON string literals do not count toward nesting. Returns
/// `None` when the first opening brace is never closed.
pub fn first_balanced_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, &byte) in bytes[start..].iter().enumerate() {
        if in_string {
            match byte {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }

        match byte {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..=start + offset]);
                }
            }
            _ => {}
        }
    }

    None
}
