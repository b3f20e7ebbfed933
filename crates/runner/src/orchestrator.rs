#![forbid(unsafe_code)]

//! One analysis run per job: screen, spawn, stream, resolve.
//!
//! A run is an [`AnalysisSession`] moving through
//! `Spawned -> Streaming -> {Exited | TimedOut}`. Pipe readers feed a channel;
//! the session owns the deadline and is the only place the child is killed.

use crate::config::RunnerConfig;
use crate::executors::claude_code::analysis_command;
use crate::issues::RoutingRegistry;
use crate::prompt::{build_analysis_task, sanitize_single_line};
use crate::screen::screen_payload;
use serde_json::Value;
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ExitStatus};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::{JoinHandle, sleep};
use std::time::{Duration, Instant};
use triage_core::stream::{AgentEvent, ExtractError, StreamDecoder, extract_result};

pub(crate) const AGENT_LOG_TARGET: &str = "triage::agent";

const READ_CHUNK_BYTES: usize = 8 * 1024;
const TERM_GRACE: Duration = Duration::from_secs(5);
const EXIT_POLL: Duration = Duration::from_millis(50);
const MAX_STDERR_BYTES: usize = 256 * 1024;
const OUTPUT_TAIL_CHARS: usize = 2_000;
const LOG_TEXT_CHARS: usize = 240;

#[derive(Debug, thiserror::Error)]
pub(crate) enum AnalysisError {
    #[error("payload rejected by security screen (pattern={pattern})")]
    SecurityRejected { pattern: &'static str },
    #[error("agent binary not found (set --claude-bin or TRIAGE_CLAUDE_BIN)")]
    AgentNotConfigured,
    #[error("failed to spawn agent {bin}: {source}")]
    Spawn {
        bin: String,
        #[source]
        source: std::io::Error,
    },
    #[error("agent exited with status {exit}: {output}")]
    Execution { exit: String, output: String },
    #[error("agent timed out after {secs}s")]
    Timeout { secs: u64 },
    #[error(transparent)]
    NoResultFound(#[from] ExtractError),
    #[error("session log {path}: {source}")]
    Log {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Produces the raw structured analysis for one job payload.
pub(crate) trait Analyzer {
    fn analyze(&self, job_id: i64, payload: &Value) -> Result<Value, AnalysisError>;
}

#[derive(Clone, Debug)]
pub(crate) struct OrchestratorConfig {
    pub(crate) agent_bin: Option<PathBuf>,
    pub(crate) repo_root: PathBuf,
    pub(crate) log_dir: PathBuf,
    pub(crate) timeout: Duration,
    pub(crate) max_turns: u32,
    pub(crate) max_actions: u32,
}

impl OrchestratorConfig {
    pub(crate) fn from_runner(cfg: &RunnerConfig) -> Self {
        Self {
            agent_bin: cfg.agent_bin.clone(),
            repo_root: cfg.repo_root.clone(),
            log_dir: cfg.log_dir.clone(),
            timeout: cfg.timeout,
            max_turns: cfg.max_turns,
            max_actions: cfg.max_actions,
        }
    }
}

pub(crate) struct Orchestrator<'a> {
    cfg: OrchestratorConfig,
    routing: &'a RoutingRegistry,
}

impl<'a> Orchestrator<'a> {
    pub(crate) fn new(cfg: OrchestratorConfig, routing: &'a RoutingRegistry) -> Self {
        Self { cfg, routing }
    }
}

impl Analyzer for Orchestrator<'_> {
    fn analyze(&self, job_id: i64, payload: &Value) -> Result<Value, AnalysisError> {
        let serialized = payload.to_string();
        if let Some(pattern) = screen_payload(&serialized) {
            tracing::warn!(job_id, pattern, "payload rejected before spawn");
            return Err(AnalysisError::SecurityRejected { pattern });
        }

        let Some(agent_bin) = self.cfg.agent_bin.as_deref() else {
            return Err(AnalysisError::AgentNotConfigured);
        };

        let task = build_analysis_task(payload, self.cfg.max_actions, self.routing);
        let logs = SessionLogs::create(&self.cfg.log_dir, job_id)?;
        let session = AnalysisSession::spawn(
            job_id,
            agent_bin,
            &self.cfg.repo_root,
            self.cfg.max_turns,
            &task,
            self.cfg.timeout,
            logs,
        )?;
        session.run()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Pipe {
    Stdout,
    Stderr,
}

#[derive(Debug)]
enum SessionSignal {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
    Eof(Pipe),
}

#[derive(Clone, Copy, Debug)]
enum SessionState {
    Spawned,
    Streaming { open_pipes: u8 },
    Exited(ExitStatus),
    TimedOut,
}

pub(crate) fn transcript_path(log_dir: &Path, job_id: i64) -> PathBuf {
    log_dir.join(format!("job-{job_id}.transcript.log"))
}

pub(crate) fn events_path(log_dir: &Path, job_id: i64) -> PathBuf {
    log_dir.join(format!("job-{job_id}.events.jsonl"))
}

struct SessionLogs {
    transcript_path: PathBuf,
    transcript: BufWriter<File>,
    events_path: PathBuf,
    events: BufWriter<File>,
}

impl SessionLogs {
    fn create(log_dir: &Path, job_id: i64) -> Result<Self, AnalysisError> {
        let log_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source| AnalysisError::Log { path, source }
        };
        std::fs::create_dir_all(log_dir).map_err(log_err(log_dir))?;

        let transcript_path = transcript_path(log_dir, job_id);
        let events_path = events_path(log_dir, job_id);
        let transcript = File::create(&transcript_path).map_err(log_err(&transcript_path))?;
        let events = File::create(&events_path).map_err(log_err(&events_path))?;
        Ok(Self {
            transcript_path,
            transcript: BufWriter::new(transcript),
            events_path,
            events: BufWriter::new(events),
        })
    }

    fn append_raw(&mut self, bytes: &[u8]) -> Result<(), AnalysisError> {
        self.transcript
            .write_all(bytes)
            .map_err(|source| AnalysisError::Log {
                path: self.transcript_path.clone(),
                source,
            })
    }

    fn append_event(&mut self, event: &AgentEvent) -> Result<(), AnalysisError> {
        let line = serde_json::to_string(event).unwrap_or_default();
        writeln!(self.events, "{line}").map_err(|source| AnalysisError::Log {
            path: self.events_path.clone(),
            source,
        })
    }

    fn flush(&mut self) -> Result<(), AnalysisError> {
        self.transcript.flush().map_err(|source| AnalysisError::Log {
            path: self.transcript_path.clone(),
            source,
        })?;
        self.events.flush().map_err(|source| AnalysisError::Log {
            path: self.events_path.clone(),
            source,
        })
    }
}

fn spawn_reader(
    mut pipe: impl Read + Send + 'static,
    kind: Pipe,
    tx: Sender<SessionSignal>,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        let mut buf = vec![0u8; READ_CHUNK_BYTES];
        loop {
            match pipe.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    let chunk = buf[..n].to_vec();
                    let signal = match kind {
                        Pipe::Stdout => SessionSignal::Stdout(chunk),
                        Pipe::Stderr => SessionSignal::Stderr(chunk),
                    };
                    if tx.send(signal).is_err() {
                        return;
                    }
                }
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    tracing::warn!(pipe = ?kind, error = %err, "agent pipe read failed");
                    break;
                }
            }
        }
        let _ = tx.send(SessionSignal::Eof(kind));
    })
}

struct AnalysisSession {
    job_id: i64,
    child: Child,
    signals: Receiver<SessionSignal>,
    readers: Vec<JoinHandle<()>>,
    started: Instant,
    deadline: Instant,
    timeout: Duration,
    state: SessionState,
    decoder: StreamDecoder,
    logs: SessionLogs,
    stdout_raw: Vec<u8>,
    stderr_raw: Vec<u8>,
}

impl AnalysisSession {
    fn spawn(
        job_id: i64,
        agent_bin: &Path,
        repo_root: &Path,
        max_turns: u32,
        task: &str,
        timeout: Duration,
        logs: SessionLogs,
    ) -> Result<Self, AnalysisError> {
        let mut child = analysis_command(agent_bin, repo_root, max_turns, task)
            .spawn()
            .map_err(|source| AnalysisError::Spawn {
                bin: agent_bin.display().to_string(),
                source,
            })?;

        let (tx, signals) = mpsc::channel();
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_reader(stdout, Pipe::Stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_reader(stderr, Pipe::Stderr, tx));
        }

        let started = Instant::now();
        tracing::info!(
            job_id,
            pid = child.id(),
            timeout_s = timeout.as_secs(),
            max_turns,
            "agent spawned"
        );

        Ok(Self {
            job_id,
            child,
            signals,
            readers,
            started,
            deadline: started + timeout,
            timeout,
            state: SessionState::Spawned,
            decoder: StreamDecoder::new(),
            logs,
            stdout_raw: Vec::new(),
            stderr_raw: Vec::new(),
        })
    }

    fn run(mut self) -> Result<Value, AnalysisError> {
        let outcome = self.drive();
        let flushed = self.logs.flush();

        let duration_ms = u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX);
        match &self.state {
            SessionState::Exited(status) => tracing::info!(
                job_id = self.job_id,
                exit = %format_exit_status(status),
                duration_ms,
                decoded_lines = self.decoder.decoded_lines(),
                skipped_lines = self.decoder.skipped_lines(),
                "agent exited"
            ),
            SessionState::TimedOut => tracing::warn!(
                job_id = self.job_id,
                duration_ms,
                "agent timed out and was terminated"
            ),
            SessionState::Spawned | SessionState::Streaming { .. } => {}
        }

        if outcome.is_err()
            && matches!(
                self.state,
                SessionState::Spawned | SessionState::Streaming { .. }
            )
        {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
        outcome?;
        flushed?;
        self.resolve()
    }

    fn drive(&mut self) -> Result<(), AnalysisError> {
        let open_pipes = u8::try_from(self.readers.len()).unwrap_or(2);
        self.state = SessionState::Streaming { open_pipes };

        while let SessionState::Streaming { open_pipes } = self.state {
            if open_pipes == 0 {
                return self.await_exit();
            }
            let remaining = self.deadline.saturating_duration_since(Instant::now());
            match self.signals.recv_timeout(remaining) {
                Ok(SessionSignal::Stdout(chunk)) => self.on_stdout(&chunk)?,
                Ok(SessionSignal::Stderr(chunk)) => self.on_stderr(&chunk),
                Ok(SessionSignal::Eof(pipe)) => {
                    tracing::debug!(job_id = self.job_id, ?pipe, "agent pipe closed");
                    self.state = SessionState::Streaming {
                        open_pipes: open_pipes.saturating_sub(1),
                    };
                }
                Err(RecvTimeoutError::Timeout) => self.cancel(),
                Err(RecvTimeoutError::Disconnected) => {
                    self.state = SessionState::Streaming { open_pipes: 0 };
                }
            }
        }
        Ok(())
    }

    fn on_stdout(&mut self, chunk: &[u8]) -> Result<(), AnalysisError> {
        self.logs.append_raw(chunk)?;
        self.stdout_raw.extend_from_slice(chunk);
        let events = self.decoder.push(chunk);
        self.record_events(&events)
    }

    fn on_stderr(&mut self, chunk: &[u8]) {
        let room = MAX_STDERR_BYTES.saturating_sub(self.stderr_raw.len());
        self.stderr_raw
            .extend_from_slice(&chunk[..chunk.len().min(room)]);
        tracing::debug!(
            target: AGENT_LOG_TARGET,
            job_id = self.job_id,
            stderr = %sanitize_single_line(&String::from_utf8_lossy(chunk)),
            "agent stderr"
        );
    }

    fn record_events(&mut self, events: &[AgentEvent]) -> Result<(), AnalysisError> {
        for event in events {
            self.logs.append_event(event)?;
            mirror_event(self.job_id, event);
        }
        Ok(())
    }

    /// Both pipes are closed; the child still has to be reaped inside the deadline.
    fn await_exit(&mut self) -> Result<(), AnalysisError> {
        loop {
            match self.child.try_wait() {
                Ok(Some(status)) => {
                    self.state = SessionState::Exited(status);
                    break;
                }
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(job_id = self.job_id, error = %err, "try_wait failed");
                }
            }
            if Instant::now() >= self.deadline {
                self.cancel();
                return Ok(());
            }
            sleep(EXIT_POLL);
        }

        for reader in self.readers.drain(..) {
            let _ = reader.join();
        }
        let tail = self.decoder.finish();
        self.record_events(&tail)
    }

    /// Deadline expiry: SIGTERM, a short grace, then SIGKILL.
    fn cancel(&mut self) {
        tracing::warn!(
            job_id = self.job_id,
            timeout_s = self.timeout.as_secs(),
            "agent deadline reached, terminating"
        );
        request_terminate(&self.child);

        let grace_end = Instant::now() + TERM_GRACE;
        while Instant::now() < grace_end {
            if let Ok(Some(_)) = self.child.try_wait() {
                break;
            }
            sleep(EXIT_POLL);
        }
        if let Ok(None) = self.child.try_wait() {
            let _ = self.child.kill();
        }
        let _ = self.child.wait();

        // Readers may stay blocked if a grandchild inherited the pipes; they are
        // detached rather than joined.
        self.readers.clear();
        self.state = SessionState::TimedOut;
    }

    fn resolve(self) -> Result<Value, AnalysisError> {
        match self.state {
            SessionState::TimedOut => Err(AnalysisError::Timeout {
                secs: self.timeout.as_secs(),
            }),
            SessionState::Exited(status) if !status.success() => Err(AnalysisError::Execution {
                exit: format_exit_status(&status),
                output: captured_output(&self.stderr_raw, &self.stdout_raw),
            }),
            SessionState::Exited(_) => {
                let transcript = String::from_utf8_lossy(&self.stdout_raw);
                Ok(extract_result(self.decoder.last_result(), &transcript)?)
            }
            SessionState::Spawned | SessionState::Streaming { .. } => {
                Err(AnalysisError::Execution {
                    exit: "unknown".to_string(),
                    output: captured_output(&self.stderr_raw, &self.stdout_raw),
                })
            }
        }
    }
}

#[cfg(unix)]
fn request_terminate(child: &Child) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    if let Ok(pid) = i32::try_from(child.id()) {
        let _ = kill(Pid::from_raw(pid), Signal::SIGTERM);
    }
}

#[cfg(not(unix))]
fn request_terminate(_child: &Child) {}

fn mirror_event(job_id: i64, event: &AgentEvent) {
    match event {
        AgentEvent::System { subtype } => {
            tracing::debug!(target: AGENT_LOG_TARGET, job_id, kind = "system", subtype = ?subtype, "agent event")
        }
        AgentEvent::Text { text } => tracing::debug!(
            target: AGENT_LOG_TARGET,
            job_id,
            kind = "text",
            text = %clip(text, LOG_TEXT_CHARS),
            "agent event"
        ),
        AgentEvent::ToolUse { name, input } => tracing::debug!(
            target: AGENT_LOG_TARGET,
            job_id,
            kind = "tool_use",
            tool = %name,
            input = %clip(&input.to_string(), LOG_TEXT_CHARS),
            "agent event"
        ),
        AgentEvent::ToolResult { is_error, .. } => tracing::debug!(
            target: AGENT_LOG_TARGET,
            job_id,
            kind = "tool_result",
            is_error,
            "agent event"
        ),
        AgentEvent::Result(result) => tracing::debug!(
            target: AGENT_LOG_TARGET,
            job_id,
            kind = "result",
            is_error = result.is_error,
            num_turns = ?result.num_turns,
            "agent event"
        ),
        AgentEvent::Error { message } => tracing::warn!(
            target: AGENT_LOG_TARGET,
            job_id,
            kind = "error",
            message = %clip(message, LOG_TEXT_CHARS),
            "agent event"
        ),
    }
}

fn clip(text: &str, max_chars: usize) -> String {
    let single = sanitize_single_line(text);
    if single.chars().count() <= max_chars {
        return single;
    }
    let mut out = single.chars().take(max_chars).collect::<String>();
    out.push('\u{2026}');
    out
}

fn tail_chars(text: &str, max_chars: usize) -> &str {
    let total = text.chars().count();
    if total <= max_chars {
        return text;
    }
    let skip = total - max_chars;
    text.char_indices()
        .nth(skip)
        .map(|(idx, _)| &text[idx..])
        .unwrap_or(text)
}

fn captured_output(stderr: &[u8], stdout: &[u8]) -> String {
    let stderr = String::from_utf8_lossy(stderr);
    let stdout = String::from_utf8_lossy(stdout);
    let stderr = tail_chars(stderr.trim(), OUTPUT_TAIL_CHARS);
    let stdout = tail_chars(stdout.trim(), OUTPUT_TAIL_CHARS);
    match (stderr.is_empty(), stdout.is_empty()) {
        (true, true) => "-".to_string(),
        (false, true) => format!("stderr: {stderr}"),
        (true, false) => format!("stdout: {stdout}"),
        (false, false) => format!("stderr: {stderr}\nstdout: {stdout}"),
    }
}

pub(crate) fn format_exit_status(status: &ExitStatus) -> String {
    status
        .code()
        .map(|c| c.to_string())
        .unwrap_or_else(|| "signal".to_string())
}
