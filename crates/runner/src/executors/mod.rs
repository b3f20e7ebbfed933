#![forbid(unsafe_code)]

pub(crate) mod claude_code;
pub(crate) mod output_schema;
