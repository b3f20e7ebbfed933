#![forbid(unsafe_code)]

//! Decoding of the analysis agent's `stream-json` output.
//!
//! The agent writes one JSON envelope per line, interleaved with plain progress
//! text. Transport chunks may cut a line anywhere, so bytes go through
//! [`LineAssembler`] first and only whole lines reach [`decode_line`].

mod extract;
mod lines;
mod wire;

pub use extract::{ExtractError, extract_result, fenced_json_blocks, find_balanced_object};
pub use lines::LineAssembler;

use serde::Serialize;
use serde_json::Value;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ResultEvent {
    pub result: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub structured_output: Option<Value>,
    pub is_error: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_turns: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AgentEvent {
    System { subtype: Option<String> },
    Text { text: String },
    ToolUse { name: String, input: Value },
    ToolResult { content: Value, is_error: bool },
    Result(ResultEvent),
    Error { message: String },
}

impl AgentEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            AgentEvent::System { .. } => "system",
            AgentEvent::Text { .. } => "text",
            AgentEvent::ToolUse { .. } => "tool_use",
            AgentEvent::ToolResult { .. } => "tool_result",
            AgentEvent::Result(_) => "result",
            AgentEvent::Error { .. } => "error",
        }
    }
}

/// Decodes one complete line. Anything that is not a recognised envelope
/// (progress text, truncated JSON, unknown kinds) yields no events.
pub fn decode_line(line: &str) -> Vec<AgentEvent> {
    let line = line.trim();
    if !line.starts_with('{') {
        return Vec::new();
    }
    match serde_json::from_str::<wire::WireLine>(line) {
        Ok(wire) => wire.into_events(),
        Err(_) => Vec::new(),
    }
}

/// Incremental decoder over raw output chunks.
#[derive(Debug, Default)]
pub struct StreamDecoder {
    lines: LineAssembler,
    last_result: Option<ResultEvent>,
    decoded_lines: u64,
    skipped_lines: u64,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<AgentEvent> {
        let lines = self.lines.push(chunk);
        let mut out = Vec::new();
        for line in lines {
            self.decode_into(&line, &mut out);
        }
        out
    }

    /// Flushes whatever is left in the carry-over buffer. Call once at EOF.
    pub fn finish(&mut self) -> Vec<AgentEvent> {
        let mut out = Vec::new();
        if let Some(tail) = self.lines.finish() {
            self.decode_into(&tail, &mut out);
        }
        out
    }

    pub fn last_result(&self) -> Option<&ResultEvent> {
        self.last_result.as_ref()
    }

    pub fn decoded_lines(&self) -> u64 {
        self.decoded_lines
    }

    pub fn skipped_lines(&self) -> u64 {
        self.skipped_lines
    }

    fn decode_into(&mut self, line: &str, out: &mut Vec<AgentEvent>) {
        if line.trim().is_empty() {
            return;
        }
        let events = decode_line(line);
        if events.is_empty() {
            self.skipped_lines += 1;
            return;
        }
        self.decoded_lines += 1;
        for event in events {
            if let AgentEvent::Result(result) = &event {
                // The agent may revise its answer across turns; the newest wins.
                self.last_result = Some(result.clone());
            }
            out.push(event);
        }
    }
}
