#![forbid(unsafe_code)]

//! Startup configuration.
//!
//! Flags (with `TRIAGE_*` env fallbacks) override the optional YAML file,
//! which overrides built-in defaults. The result is immutable for the life of
//! the process.

use crate::bin_detect::resolve_agent_bin;
use crate::defaults::*;
use crate::issues::RoutingRegistry;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub(crate) enum ConfigError {
    #[error("read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, clap::Args)]
pub(crate) struct ConfigArgs {
    /// YAML file with dedup window, budgets and routing allow-list
    #[arg(long, global = true, env = "TRIAGE_CONFIG")]
    pub(crate) config: Option<PathBuf>,

    /// Source checkout the agent inspects (default: nearest `.git` ancestor)
    #[arg(long, global = true, env = "TRIAGE_REPO_ROOT")]
    pub(crate) repo_root: Option<PathBuf>,

    /// Queue database and outbox location, outside the checkout
    /// (default: $XDG_STATE_HOME/triage/<checkout>)
    #[arg(long, global = true, env = "TRIAGE_STORAGE_DIR")]
    pub(crate) storage_dir: Option<PathBuf>,

    /// Per-job transcripts (default: <storage-dir>/logs)
    #[arg(long, global = true, env = "TRIAGE_LOG_DIR")]
    pub(crate) log_dir: Option<PathBuf>,

    /// Agent binary (default: `claude` on PATH)
    #[arg(long, global = true, env = "TRIAGE_CLAUDE_BIN")]
    pub(crate) claude_bin: Option<String>,

    #[arg(long, global = true, env = "TRIAGE_DEDUP_WINDOW_S")]
    pub(crate) dedup_window_s: Option<u64>,

    #[arg(long, global = true, env = "TRIAGE_TIMEOUT_S")]
    pub(crate) timeout_s: Option<u64>,

    #[arg(long, global = true, env = "TRIAGE_MAX_TURNS")]
    pub(crate) max_turns: Option<u32>,

    #[arg(long, global = true, env = "TRIAGE_MAX_ACTIONS")]
    pub(crate) max_actions: Option<u32>,

    #[arg(long, global = true, env = "TRIAGE_POLL_MS")]
    pub(crate) poll_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct FileConfig {
    #[serde(default)]
    pub(crate) dedup_window_s: Option<u64>,
    #[serde(default)]
    pub(crate) timeout_s: Option<u64>,
    #[serde(default)]
    pub(crate) max_turns: Option<u32>,
    #[serde(default)]
    pub(crate) max_actions: Option<u32>,
    #[serde(default)]
    pub(crate) poll_ms: Option<u64>,
    /// Destination key -> display name.
    #[serde(default)]
    pub(crate) routing: BTreeMap<String, String>,
}

impl FileConfig {
    pub(crate) fn from_yaml(path: &Path, text: &str) -> Result<Self, ConfigError> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub(crate) fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(path, &text)
    }
}

#[derive(Debug, Clone)]
pub(crate) struct RunnerConfig {
    pub(crate) repo_root: PathBuf,
    pub(crate) storage_dir: PathBuf,
    pub(crate) log_dir: PathBuf,
    pub(crate) outbox_dir: PathBuf,
    pub(crate) agent_bin: Option<PathBuf>,
    pub(crate) dedup_window: Duration,
    pub(crate) timeout: Duration,
    pub(crate) max_turns: u32,
    pub(crate) max_actions: u32,
    pub(crate) poll: Duration,
    pub(crate) routing: RoutingRegistry,
}

impl RunnerConfig {
    pub(crate) fn load(args: &ConfigArgs) -> Result<Self, ConfigError> {
        let file = match args.config.as_deref() {
            Some(path) => FileConfig::load(path)?,
            None => FileConfig::default(),
        };
        Self::resolve(args, file)
    }

    pub(crate) fn resolve(args: &ConfigArgs, file: FileConfig) -> Result<Self, ConfigError> {
        let repo_root = args.repo_root.clone().unwrap_or_else(default_repo_root);
        if !repo_root.is_dir() {
            return Err(ConfigError::Invalid(format!(
                "repo root {} is not a directory",
                repo_root.display()
            )));
        }
        let storage_dir = args
            .storage_dir
            .clone()
            .unwrap_or_else(|| default_storage_dir(&repo_root));
        let log_dir = args
            .log_dir
            .clone()
            .unwrap_or_else(|| default_log_dir(&storage_dir));
        let outbox_dir = default_outbox_dir(&storage_dir);
        for (what, dir) in [
            ("storage_dir", &storage_dir),
            ("log_dir", &log_dir),
            ("outbox_dir", &outbox_dir),
        ] {
            if is_inside(dir, &repo_root) {
                return Err(ConfigError::Invalid(format!(
                    "{what} {} is inside repo root {}; the agent would read it",
                    dir.display(),
                    repo_root.display()
                )));
            }
        }

        let dedup_window_s = args
            .dedup_window_s
            .or(file.dedup_window_s)
            .unwrap_or(DEFAULT_DEDUP_WINDOW_S);
        let timeout_s = args.timeout_s.or(file.timeout_s).unwrap_or(DEFAULT_TIMEOUT_S);
        let max_turns = args.max_turns.or(file.max_turns).unwrap_or(DEFAULT_MAX_TURNS);
        let max_actions = args
            .max_actions
            .or(file.max_actions)
            .unwrap_or(DEFAULT_MAX_ACTIONS);
        let poll_ms = args.poll_ms.or(file.poll_ms).unwrap_or(DEFAULT_POLL_MS);

        if timeout_s == 0 {
            return Err(ConfigError::Invalid("timeout_s must be > 0".to_string()));
        }
        if max_turns == 0 {
            return Err(ConfigError::Invalid("max_turns must be > 0".to_string()));
        }
        if max_actions == 0 {
            return Err(ConfigError::Invalid("max_actions must be > 0".to_string()));
        }
        if poll_ms == 0 {
            return Err(ConfigError::Invalid("poll_ms must be > 0".to_string()));
        }

        Ok(Self {
            repo_root,
            storage_dir,
            log_dir,
            outbox_dir,
            agent_bin: resolve_agent_bin(args.claude_bin.as_deref()),
            dedup_window: Duration::from_secs(dedup_window_s),
            timeout: Duration::from_secs(timeout_s),
            max_turns,
            max_actions,
            poll: Duration::from_millis(poll_ms),
            routing: RoutingRegistry::new(file.routing)?,
        })
    }

    pub(crate) fn dedup_window_ms(&self) -> i64 {
        i64::try_from(self.dedup_window.as_millis()).unwrap_or(i64::MAX)
    }
}

/// Lexical and symlink-resolved containment, so `./x` and links both count.
fn is_inside(path: &Path, root: &Path) -> bool {
    let forms = |p: &Path| {
        let mut out = vec![p.to_path_buf()];
        if let Ok(abs) = std::path::absolute(p) {
            out.push(abs);
        }
        if let Ok(canon) = p.canonicalize() {
            out.push(canon);
        }
        out
    };
    let roots = forms(root);
    forms(path)
        .iter()
        .any(|candidate| roots.iter().any(|r| candidate.starts_with(r)))
}
