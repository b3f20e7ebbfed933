#![forbid(unsafe_code)]

use super::{AgentEvent, ResultEvent};
use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(super) enum WireLine {
    System {
        #[serde(default)]
        subtype: Option<String>,
    },
    Assistant {
        #[serde(default)]
        message: WireMessage,
    },
    User {
        #[serde(default)]
        message: WireMessage,
    },
    Result {
        #[serde(default)]
        result: Value,
        #[serde(default)]
        structured_output: Option<Value>,
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        num_turns: Option<u64>,
        #[serde(default)]
        duration_ms: Option<u64>,
    },
    Error {
        #[serde(default)]
        error: Value,
        #[serde(default)]
        message: Option<String>,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Default, Deserialize)]
pub(super) struct WireMessage {
    #[serde(default)]
    content: WireContent,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireContent {
    Text(String),
    Blocks(Vec<WireBlock>),
}

impl Default for WireContent {
    fn default() -> Self {
        WireContent::Blocks(Vec::new())
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireBlock {
    Text {
        #[serde(default)]
        text: String,
    },
    ToolUse {
        #[serde(default)]
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        #[serde(default)]
        content: Value,
        #[serde(default)]
        is_error: bool,
    },
    #[serde(other)]
    Other,
}

impl WireLine {
    pub(super) fn into_events(self) -> Vec<AgentEvent> {
        match self {
            WireLine::System { subtype } => vec![AgentEvent::System { subtype }],
            WireLine::Assistant { message } | WireLine::User { message } => {
                message.content.into_events()
            }
            WireLine::Result {
                result,
                structured_output,
                is_error,
                num_turns,
                duration_ms,
            } => vec![AgentEvent::Result(ResultEvent {
                result,
                structured_output: structured_output.filter(|v| !v.is_null()),
                is_error,
                num_turns,
                duration_ms,
            })],
            WireLine::Error { error, message } => {
                let message = message
                    .or_else(|| {
                        error
                            .get("message")
                            .and_then(Value::as_str)
                            .map(str::to_string)
                    })
                    .or_else(|| error.as_str().map(str::to_string))
                    .unwrap_or_else(|| error.to_string());
                vec![AgentEvent::Error { message }]
            }
            WireLine::Unknown => Vec::new(),
        }
    }
}

impl WireContent {
    fn into_events(self) -> Vec<AgentEvent> {
        match self {
            WireContent::Text(text) if text.trim().is_empty() => Vec::new(),
            WireContent::Text(text) => vec![AgentEvent::Text { text }],
            WireContent::Blocks(blocks) => blocks
                .into_iter()
                .filter_map(|block| match block {
                    WireBlock::Text { text } if !text.trim().is_empty() => {
                        Some(AgentEvent::Text { text })
                    }
                    WireBlock::Text { .. } | WireBlock::Other => None,
                    WireBlock::ToolUse { name, input } => Some(AgentEvent::ToolUse { name, input }),
                    WireBlock::ToolResult { content, is_error } => {
                        Some(AgentEvent::ToolResult { content, is_error })
                    }
                })
                .collect(),
        }
    }
}
