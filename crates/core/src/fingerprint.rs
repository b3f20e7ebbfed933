#![forbid(unsafe_code)]

//! Stable digests for incident payloads.
//!
//! Two deliveries of the same incident usually differ only in when they were
//! sent and which request carried them. Those fields are stripped before
//! hashing so both deliveries land on the same fingerprint.

use serde_json::{Map, Value};
use sha2::{Digest as _, Sha256};
use std::fmt::Write as _;

pub const FINGERPRINT_HEX_LEN: usize = 16;
pub const MAX_DEPTH: usize = 64;
pub const DEPTH_MARKER: &str = "[depth-limit]";

pub const VOLATILE_KEYS: &[&str] = &[
    "timestamp",
    "time",
    "ts",
    "@timestamp",
    "date",
    "datetime",
    "created_at",
    "createdAt",
    "updated_at",
    "updatedAt",
    "occurred_at",
    "received_at",
    "receivedAt",
    "request_id",
    "requestId",
    "correlation_id",
    "correlationId",
    "trace_id",
    "traceId",
    "span_id",
    "spanId",
    "event_id",
    "eventId",
    "message_id",
    "messageId",
];

pub fn is_volatile_key(key: &str) -> bool {
    VOLATILE_KEYS.contains(&key)
}

/// Removes volatile keys at every depth, arrays included.
///
/// Anything nested deeper than [`MAX_DEPTH`] collapses into [`DEPTH_MARKER`], so
/// the walk always terminates on hostile input.
pub fn normalize(value: &Value) -> Value {
    normalize_at(value, 0)
}

fn normalize_at(value: &Value, depth: usize) -> Value {
    if depth >= MAX_DEPTH {
        return Value::String(DEPTH_MARKER.to_string());
    }
    match value {
        Value::Object(map) => {
            let mut out = Map::new();
            for (key, inner) in map {
                if is_volatile_key(key) {
                    continue;
                }
                out.insert(key.clone(), normalize_at(inner, depth + 1));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|inner| normalize_at(inner, depth + 1))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Compact JSON with object keys sorted at every level.
///
/// Written by hand so the output does not depend on whether `serde_json` was
/// built with `preserve_order`.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys = map.keys().collect::<Vec<_>>();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_string(key, out);
                out.push(':');
                if let Some(inner) = map.get(key) {
                    write_canonical(inner, out);
                }
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, inner) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(inner, out);
            }
            out.push(']');
        }
        Value::String(s) => write_string(s, out),
        other => out.push_str(&other.to_string()),
    }
}

fn write_string(s: &str, out: &mut String) {
    // Value::String's Display is the escaped JSON literal.
    out.push_str(&Value::String(s.to_string()).to_string());
}

pub fn compute(payload: &Value) -> String {
    let canonical = canonical_json(&normalize(payload));
    let digest = Sha256::digest(canonical.as_bytes());
    let mut hex = String::with_capacity(64);
    for b in digest {
        let _ = write!(&mut hex, "{b:02x}");
    }
    hex.truncate(FINGERPRINT_HEX_LEN);
    hex
}

/// Caller-supplied fingerprints win only when they are a non-blank string
/// other than `"0"`.
pub fn accept_supplied(supplied: Option<&Value>) -> Option<String> {
    let raw = supplied?.as_str()?.trim();
    if raw.is_empty() || raw == "0" {
        return None;
    }
    Some(raw.to_string())
}

pub fn resolve(payload: &Value, supplied: Option<&Value>) -> String {
    accept_supplied(supplied).unwrap_or_else(|| compute(payload))
}
