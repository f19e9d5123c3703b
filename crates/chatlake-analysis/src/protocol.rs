//! Parser for the fenced text protocol the model responds with.
//!
//! The format survives model quoting inconsistencies better than JSON: a
//! sentinel line opens the result, topic blocks are separated by blank
//! lines, each block is `field: value` pairs with multi-line values
//! continuing on unprefixed lines. Unknown fields are ignored; a topic
//! missing its required fields is dropped with a warning rather than
//! failing the batch.

use tracing::warn;

use crate::error::LlmError;
use crate::prompt::{RESULT_END, RESULT_START};
use crate::types::Topic;

const KNOWN_FIELDS: [&str; 8] = [
    "title",
    "summary",
    "keywords",
    "participants",
    "message_ids",
    "confidence",
    "time_range",
    "notes",
];

/// Parse a model response into topics.
///
/// Errors with `LlmError::Protocol` only when the whole response is
/// unusable: sentinels missing, or no block survives field validation.
pub fn parse_topics(response: &str) -> Result<Vec<Topic>, LlmError> {
    let fenced = extract_fenced(response)?;

    let mut topics = Vec::new();
    for block in fenced.split("\n\n").map(str::trim).filter(|b| !b.is_empty()) {
        match parse_block(block) {
            Some(topic) => topics.push(topic),
            None => warn!(block, "topic block missing required fields; dropped"),
        }
    }

    if topics.is_empty() {
        return Err(LlmError::Protocol(
            "no parseable topic blocks in response".to_string(),
        ));
    }
    Ok(topics)
}

fn extract_fenced(response: &str) -> Result<&str, LlmError> {
    let start = response
        .find(RESULT_START)
        .ok_or_else(|| LlmError::Protocol("missing result start sentinel".to_string()))?
        + RESULT_START.len();
    let end = response[start..]
        .find(RESULT_END)
        .ok_or_else(|| LlmError::Protocol("missing result end sentinel".to_string()))?;
    Ok(response[start..start + end].trim_matches('\n'))
}

fn parse_block(block: &str) -> Option<Topic> {
    let mut fields: Vec<(String, String)> = Vec::new();
    let mut ignoring = false;

    for line in block.lines() {
        if let Some((key, value)) = split_field(line) {
            if KNOWN_FIELDS.contains(&key) {
                fields.push((key.to_string(), value.to_string()));
                ignoring = false;
            } else {
                // Unknown field: drop it and any continuation lines.
                ignoring = true;
            }
        } else if !ignoring {
            // Continuation of the previous field's value.
            if let Some((_, value)) = fields.last_mut() {
                if !value.is_empty() {
                    value.push(' ');
                }
                value.push_str(line.trim());
            }
        }
    }

    let get = |name: &str| -> String {
        fields
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.trim().to_string())
            .unwrap_or_default()
    };

    let summary = get("summary");
    let message_ids = split_list(&get("message_ids"));
    if summary.is_empty() || message_ids.is_empty() {
        return None;
    }

    let confidence = get("confidence").parse::<f32>().unwrap_or(0.5);
    Some(Topic {
        title: get("title"),
        summary,
        keywords: split_list(&get("keywords")),
        participants: split_list(&get("participants")),
        message_ids,
        confidence: confidence.clamp(0.0, 1.0),
        time_range: get("time_range"),
        notes: get("notes"),
    })
}

/// Split `key: value` where key is a bare identifier. Lines whose colon sits
/// mid-sentence (display lines quoted back, URLs) are continuations.
fn split_field(line: &str) -> Option<(&str, &str)> {
    let (key, value) = line.split_once(':')?;
    let key = key.trim();
    if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return None;
    }
    Some((key, value.trim()))
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split([',', '，'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
