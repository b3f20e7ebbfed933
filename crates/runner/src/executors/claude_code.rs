#![forbid(unsafe_code)]

use super::output_schema::analysis_output_schema_value;
use std::path::Path;
use std::process::{Command, Stdio};

/// Read-only inspection only.
pub(crate) const ALLOWED_TOOLS: &str = "Read,Grep,Glob";
pub(crate) const DISALLOWED_TOOLS: &str = "Write,Edit,Bash,WebFetch,WebSearch,NotebookEdit";

/// Headless analysis run that streams one JSON event per line on stdout.
pub(crate) fn analysis_command(
    agent_bin: &Path,
    repo_root: &Path,
    max_turns: u32,
    task: &str,
) -> Command {
    let mut cmd = Command::new(agent_bin);
    cmd.arg("-p")
        .arg("--output-format")
        .arg("stream-json")
        // stream-json requires --verbose in print mode.
        .arg("--verbose")
        .arg("--max-turns")
        .arg(max_turns.to_string())
        .arg("--allowedTools")
        .arg(ALLOWED_TOOLS)
        .arg("--disallowedTools")
        .arg(DISALLOWED_TOOLS)
        .arg("--json-schema")
        .arg(analysis_output_schema_value().to_string())
        .arg("--no-session-persistence");

    // `claude` has no `--cwd`; the process working directory scopes file access.
    cmd.current_dir(repo_root);

    cmd.arg(task)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    cmd
}
