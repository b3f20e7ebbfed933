#![forbid(unsafe_code)]

mod jobs;
mod stats;

pub use jobs::*;
pub use stats::*;
