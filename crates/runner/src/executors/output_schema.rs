#![forbid(unsafe_code)]

use serde_json::{Value, json};

pub(crate) const PRIORITIES: [&str; 4] = ["critical", "high", "medium", "low"];

/// Shape the agent must answer with. Passed as `--json-schema` and embedded in the task text.
pub(crate) fn analysis_output_schema_value() -> Value {
    json!({
        "type": "object",
        "additionalProperties": false,
        "properties": {
            "category": { "type": "string" },
            "priority": { "type": "string", "enum": PRIORITIES },
            "summary": { "type": "string" },
            "root_cause": {
                "type": "object",
                "additionalProperties": false,
                "properties": {
                    "hypothesis": { "type": "string" },
                    "confidence": { "type": "number", "minimum": 0, "maximum": 1 }
                },
                "required": ["confidence", "hypothesis"]
            },
            "fix_suggestion": { "type": "string" },
            "affected_files": { "type": "array", "items": { "type": "string" } },
            "investigation_trace": { "type": "array", "items": { "type": "string" } },
            "routing_key": { "type": ["string", "null"] }
        },
        "required": [
            "affected_files",
            "category",
            "fix_suggestion",
            "investigation_trace",
            "priority",
            "root_cause",
            "routing_key",
            "summary"
        ]
    })
}

pub(crate) fn analysis_output_schema_pretty() -> String {
    serde_json::to_string_pretty(&analysis_output_schema_value()).unwrap_or_default()
}
