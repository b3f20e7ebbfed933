#![forbid(unsafe_code)]

use std::ffi::OsString;
use std::path::{Path, PathBuf};

pub(crate) const DEFAULT_STATE_DIRNAME: &str = "triage";
pub(crate) const DEFAULT_LOG_DIRNAME: &str = "logs";
pub(crate) const DEFAULT_OUTBOX_DIRNAME: &str = "outbox";

pub(crate) const DEFAULT_DEDUP_WINDOW_S: u64 = 24 * 60 * 60;
pub(crate) const DEFAULT_TIMEOUT_S: u64 = 600;
pub(crate) const DEFAULT_MAX_TURNS: u32 = 25;
pub(crate) const DEFAULT_MAX_ACTIONS: u32 = 6;
pub(crate) const DEFAULT_POLL_MS: u64 = 5_000;

fn find_repo_root(start: &Path) -> Option<PathBuf> {
    let mut current = start.to_path_buf();
    loop {
        let git = current.join(".git");
        if git.exists() {
            return Some(current);
        }
        if !current.pop() {
            return None;
        }
    }
}

/// Nearest ancestor holding `.git`, else `start` itself.
pub(crate) fn repo_root_from_start(start: &Path) -> PathBuf {
    find_repo_root(start).unwrap_or_else(|| start.to_path_buf())
}

pub(crate) fn default_repo_root() -> PathBuf {
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    repo_root_from_start(&cwd)
}

fn normalize_workspace_id(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_lowercase());
        } else if matches!(ch, '.' | '_' | '-') {
            out.push(ch);
        } else {
            out.push('-');
        }
    }
    let trimmed = out.trim_matches('-');
    if trimmed.is_empty() {
        "workspace".to_string()
    } else {
        trimmed.to_string()
    }
}

fn non_blank(raw: Option<OsString>) -> Option<PathBuf> {
    raw.filter(|v| !v.to_string_lossy().trim().is_empty())
        .map(PathBuf::from)
}

/// `$XDG_STATE_HOME`, else `$HOME/.local/state`, else the temp dir.
fn state_home_from(xdg_state_home: Option<OsString>, home: Option<OsString>) -> PathBuf {
    non_blank(xdg_state_home)
        .or_else(|| non_blank(home).map(|h| h.join(".local").join("state")))
        .unwrap_or_else(std::env::temp_dir)
}

/// Per-checkout state directory. Lives outside the checkout: the agent reads
/// everything under `repo_root`.
fn storage_dir_under(state_home: &Path, repo_root: &Path) -> PathBuf {
    state_home
        .join(DEFAULT_STATE_DIRNAME)
        .join(normalize_workspace_id(&repo_root.to_string_lossy()))
}

pub(crate) fn default_storage_dir(repo_root: &Path) -> PathBuf {
    let state_home = state_home_from(std::env::var_os("XDG_STATE_HOME"), std::env::var_os("HOME"));
    storage_dir_under(&state_home, repo_root)
}

pub(crate) fn default_log_dir(storage_dir: &Path) -> PathBuf {
    storage_dir.join(DEFAULT_LOG_DIRNAME)
}

pub(crate) fn default_outbox_dir(storage_dir: &Path) -> PathBuf {
    storage_dir.join(DEFAULT_OUTBOX_DIRNAME)
}
