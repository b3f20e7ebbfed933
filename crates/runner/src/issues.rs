#![forbid(unsafe_code)]

use crate::config::ConfigError;
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use triage_core::model::AnalysisResult;

const TICKET_PREFIX: &str = "TRI";
const MAX_TICKET_FINGERPRINT_CHARS: usize = 64;

#[derive(Debug, thiserror::Error)]
pub(crate) enum IssueError {
    #[error("outbox io ({path}): {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("serialize ticket: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub(crate) struct Destination {
    pub(crate) key: String,
    pub(crate) name: String,
}

/// Allow-list of routing destinations, built once from config.
#[derive(Clone, Debug, Default)]
pub(crate) struct RoutingRegistry {
    by_key: BTreeMap<String, Destination>,
}

impl RoutingRegistry {
    pub(crate) fn new(entries: BTreeMap<String, String>) -> Result<Self, ConfigError> {
        let mut by_key = BTreeMap::new();
        for (raw_key, raw_name) in entries {
            let key = normalize_key(&raw_key);
            if key.is_empty() {
                return Err(ConfigError::Invalid(
                    "routing keys must not be empty".to_string(),
                ));
            }
            let name = match raw_name.trim() {
                "" => raw_key.trim().to_string(),
                name => name.to_string(),
            };
            if by_key
                .insert(key.clone(), Destination { key: key.clone(), name })
                .is_some()
            {
                return Err(ConfigError::Invalid(format!(
                    "routing key {key} is listed twice"
                )));
            }
        }
        Ok(Self { by_key })
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    pub(crate) fn destinations(&self) -> impl Iterator<Item = &Destination> {
        self.by_key.values()
    }

    pub(crate) fn lookup(&self, key: &str) -> Option<&Destination> {
        self.by_key.get(&normalize_key(key))
    }
}

fn normalize_key(raw: &str) -> String {
    raw.trim().to_ascii_lowercase()
}

pub(crate) struct TicketRequest<'a> {
    pub(crate) job_id: i64,
    pub(crate) fingerprint: &'a str,
    pub(crate) destination: Option<&'a Destination>,
    pub(crate) payload: &'a Value,
    pub(crate) analysis: &'a AnalysisResult,
}

pub(crate) trait IssueService {
    /// Maps the agent's suggested key onto an allow-listed destination.
    fn resolve_destination(&self, suggested: Option<&str>) -> Option<Destination>;

    /// Files a ticket and returns its reference.
    fn create_ticket(&self, request: TicketRequest<'_>) -> Result<String, IssueError>;
}

pub(crate) fn ticket_ref_for(fingerprint: &str, job_id: i64) -> String {
    let safe = fingerprint
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '-'
            }
        })
        .take(MAX_TICKET_FINGERPRINT_CHARS)
        .collect::<String>();
    format!("{TICKET_PREFIX}-{safe}-{job_id}")
}

/// Writes each ticket as `<outbox>/<ticket_ref>.json` for a downstream tracker
/// bridge to pick up.
pub(crate) struct OutboxIssueService<'a> {
    outbox_dir: PathBuf,
    routing: &'a RoutingRegistry,
}

impl<'a> OutboxIssueService<'a> {
    pub(crate) fn new(outbox_dir: impl Into<PathBuf>, routing: &'a RoutingRegistry) -> Self {
        Self {
            outbox_dir: outbox_dir.into(),
            routing,
        }
    }

    #[cfg(test)]
    pub(crate) fn outbox_dir(&self) -> &Path {
        &self.outbox_dir
    }
}

impl IssueService for OutboxIssueService<'_> {
    fn resolve_destination(&self, suggested: Option<&str>) -> Option<Destination> {
        self.routing.lookup(suggested?).cloned()
    }

    fn create_ticket(&self, request: TicketRequest<'_>) -> Result<String, IssueError> {
        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source| IssueError::Io { path, source }
        };

        std::fs::create_dir_all(&self.outbox_dir).map_err(io_err(&self.outbox_dir))?;

        let ticket_ref = ticket_ref_for(request.fingerprint, request.job_id);
        let document = json!({
            "ticket_ref": ticket_ref,
            "job_id": request.job_id,
            "fingerprint": request.fingerprint,
            "destination": request.destination,
            "title": ticket_title(request.analysis),
            "analysis": request.analysis,
            "payload": request.payload,
        });
        let bytes = serde_json::to_vec_pretty(&document)?;

        // Write-then-rename so a reader never sees a half-written ticket.
        let final_path = self.outbox_dir.join(format!("{ticket_ref}.json"));
        let tmp_path = self.outbox_dir.join(format!(".{ticket_ref}.json.tmp"));
        std::fs::write(&tmp_path, bytes).map_err(io_err(&tmp_path))?;
        std::fs::rename(&tmp_path, &final_path).map_err(io_err(&final_path))?;

        Ok(ticket_ref)
    }
}

fn ticket_title(analysis: &AnalysisResult) -> String {
    let summary = analysis.summary.lines().next().unwrap_or("").trim();
    match (analysis.priority.as_deref(), summary) {
        (Some(priority), "") => format!("[{priority}] {}", analysis.category),
        (Some(priority), summary) => format!("[{priority}] {}: {summary}", analysis.category),
        (None, "") => analysis.category.clone(),
        (None, summary) => format!("{}: {summary}", analysis.category),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> RoutingRegistry {
        RoutingRegistry::new(BTreeMap::from([
            ("payments".to_string(), "Payments Team".to_string()),
            ("Infra".to_string(), String::new()),
        ]))
        .expect("registry")
    }

    fn analysis() -> AnalysisResult {
        AnalysisResult::from_value(&json!({
            "category": "bug",
            "priority": "high",
            "summary": "null deref in checkout\nmore detail",
            "routing_key": "payments"
        }))
        .expect("analysis")
    }

    #[test]
    fn destinations_resolve_case_insensitively_and_only_from_allow_list() {
        let routing = registry();
        let service = OutboxIssueService::new("/nonexistent", &routing);
        assert_eq!(
            service.resolve_destination(Some(" PAYMENTS ")),
            Some(Destination {
                key: "payments".to_string(),
                name: "Payments Team".to_string()
            })
        );
        assert_eq!(
            service.resolve_destination(Some("infra")).map(|d| d.name),
            Some("Infra".to_string())
        );
        assert_eq!(service.resolve_destination(Some("unknown")), None);
        assert_eq!(service.resolve_destination(None), None);
    }

    #[test]
    fn duplicate_routing_keys_are_rejected() {
        let err = RoutingRegistry::new(BTreeMap::from([
            ("a".to_string(), "A".to_string()),
            ("A".to_string(), "A again".to_string()),
        ]))
        .expect_err("case-folded duplicate");
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn ticket_ref_is_filename_safe() {
        assert_eq!(ticket_ref_for("abc123", 7), "TRI-abc123-7");
        assert_eq!(ticket_ref_for("../etc/passwd", 1), "TRI-..-etc-passwd-1");
    }

    #[test]
    fn outbox_ticket_document_is_written() {
        let dir = tempfile::tempdir().expect("temp dir");
        let routing = registry();
        let service = OutboxIssueService::new(dir.path().join("outbox"), &routing);
        let analysis = analysis();
        let destination = service.resolve_destination(analysis.routing_key());
        let payload = json!({ "message": "boom" });

        let ticket_ref = service
            .create_ticket(TicketRequest {
                job_id: 42,
                fingerprint: "feedbeef",
                destination: destination.as_ref(),
                payload: &payload,
                analysis: &analysis,
            })
            .expect("ticket");
        assert_eq!(ticket_ref, "TRI-feedbeef-42");

        let text = std::fs::read_to_string(service.outbox_dir().join("TRI-feedbeef-42.json"))
            .expect("ticket file");
        let doc: Value = serde_json::from_str(&text).expect("ticket json");
        assert_eq!(doc["destination"]["key"], json!("payments"));
        assert_eq!(doc["title"], json!("[high] bug: null deref in checkout"));
        assert_eq!(doc["payload"], payload);
    }
}
