#![forbid(unsafe_code)]

use super::{AgentEvent, ResultEvent, decode_line};
use crate::model::{CATEGORY_KEY, has_mandatory_fields};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExtractError {
    #[error("no result found in agent output")]
    NoResultFound,
}

/// Pulls the structured analysis out of a finished run.
///
/// Order:
/// 1. the last result event, when it already is (or carries) an object with
///    both mandatory keys;
/// 2. ```` ```json ```` fences inside the result text, newest first;
/// 3. a brace-balanced `{"category" ...}` object in the result text, then in
///    the assistant text blocks decoded from the transcript (newest first),
///    then in the raw transcript. This step only requires `category`.
///
/// In `stream-json` output the model's own text is JSON-escaped inside each
/// envelope, so the raw transcript alone only matches plain progress lines.
pub fn extract_result(last: Option<&ResultEvent>, transcript: &str) -> Result<Value, ExtractError> {
    let result_text = last.and_then(|event| event.result.as_str());

    if let Some(event) = last {
        if let Some(structured) = event
            .structured_output
            .as_ref()
            .filter(|v| has_mandatory_fields(v))
        {
            return Ok(structured.clone());
        }
        if has_mandatory_fields(&event.result) {
            return Ok(event.result.clone());
        }
    }

    if let Some(text) = result_text {
        for block in fenced_json_blocks(text).into_iter().rev() {
            if let Ok(value) = serde_json::from_str::<Value>(block)
                && has_mandatory_fields(&value)
            {
                return Ok(value);
            }
        }
    }

    let text_blocks = transcript_text_blocks(transcript);
    let haystacks = result_text
        .into_iter()
        .chain(text_blocks.iter().rev().map(String::as_str))
        .chain(std::iter::once(transcript));
    for haystack in haystacks {
        if let Some(value) = find_category_object(haystack) {
            return Ok(value);
        }
    }

    Err(ExtractError::NoResultFound)
}

/// Bodies of fences labelled `json`, in document order. Unlabelled fences and
/// an unterminated final fence are ignored.
pub fn fenced_json_blocks(text: &str) -> Vec<&str> {
    let mut blocks = Vec::new();
    let mut rest = text;
    while let Some(open) = rest.find("```") {
        let after = &rest[open + 3..];
        let Some(newline) = after.find('\n') else {
            break;
        };
        let label = after[..newline].trim();
        let body = &after[newline + 1..];
        let Some(close) = body.find("```") else {
            break;
        };
        if label.eq_ignore_ascii_case("json") {
            blocks.push(body[..close].trim());
        }
        rest = &body[close + 3..];
    }
    blocks
}

fn transcript_text_blocks(transcript: &str) -> Vec<String> {
    transcript
        .lines()
        .flat_map(decode_line)
        .filter_map(|event| match event {
            AgentEvent::Text { text } => Some(text),
            _ => None,
        })
        .collect()
}

fn find_category_object(text: &str) -> Option<Value> {
    let bytes = text.as_bytes();
    let starts = bytes
        .iter()
        .enumerate()
        .filter(|(i, b)| **b == b'{' && opens_category_object(&bytes[i + 1..]))
        .map(|(i, _)| i)
        .collect::<Vec<_>>();

    for start in starts.into_iter().rev() {
        let Some(candidate) = find_balanced_object(text, start) else {
            continue;
        };
        if let Ok(value) = serde_json::from_str::<Value>(candidate)
            && value
                .as_object()
                .is_some_and(|obj| obj.contains_key(CATEGORY_KEY))
        {
            return Some(value);
        }
    }
    None
}

fn opens_category_object(after_brace: &[u8]) -> bool {
    let skipped = after_brace
        .iter()
        .take_while(|b| b.is_ascii_whitespace())
        .count();
    after_brace[skipped..].starts_with(b"\"category\"")
}

/// Returns the object starting at byte `start` (which must be `{`), matching
/// braces while ignoring any that appear inside string literals.
pub fn find_balanced_object(text: &str, start: usize) -> Option<&str> {
    let bytes = text.as_bytes();
    if bytes.get(start) != Some(&b'{') {
        return None;
    }
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, b) in bytes[start..].iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if *b == b'\\' {
                escaped = true;
            } else if *b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return text.get(start..=start + offset);
                }
            }
            _ => {}
        }
    }
    None
}
