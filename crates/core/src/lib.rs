#![forbid(unsafe_code)]

pub mod fingerprint;
pub mod stream;

pub mod model {
    use serde::{Deserialize, Serialize};
    use serde_json::Value;

    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum JobStatus {
        Pending,
        Processing,
        Completed,
        Failed,
        Duplicate,
    }

    impl JobStatus {
        pub const ALL: [JobStatus; 5] = [
            JobStatus::Pending,
            JobStatus::Processing,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Duplicate,
        ];

        pub fn as_str(self) -> &'static str {
            match self {
                JobStatus::Pending => "pending",
                JobStatus::Processing => "processing",
                JobStatus::Completed => "completed",
                JobStatus::Failed => "failed",
                JobStatus::Duplicate => "duplicate",
            }
        }

        pub fn is_terminal(self) -> bool {
            matches!(
                self,
                JobStatus::Completed | JobStatus::Failed | JobStatus::Duplicate
            )
        }
    }

    impl std::fmt::Display for JobStatus {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str(self.as_str())
        }
    }

    #[derive(Clone, Debug, PartialEq, Eq)]
    pub struct UnknownJobStatus(pub String);

    impl std::fmt::Display for UnknownJobStatus {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "unknown job status: {}", self.0)
        }
    }

    impl std::error::Error for UnknownJobStatus {}

    impl std::str::FromStr for JobStatus {
        type Err = UnknownJobStatus;

        fn from_str(s: &str) -> Result<Self, Self::Err> {
            JobStatus::ALL
                .into_iter()
                .find(|status| status.as_str().eq_ignore_ascii_case(s.trim()))
                .ok_or_else(|| UnknownJobStatus(s.to_string()))
        }
    }

    /// Mandatory keys an agent result must carry to be accepted without the
    /// permissive fallback.
    pub const CATEGORY_KEY: &str = "category";
    pub const SUMMARY_KEY: &str = "summary";

    #[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
    pub struct RootCause {
        #[serde(default)]
        pub hypothesis: String,
        #[serde(default)]
        pub confidence: Option<f64>,
    }

    /// Typed view over the agent's structured answer.
    ///
    /// The raw JSON is what gets persisted on the job; this struct only exists so
    /// the worker can route and file a ticket without probing untyped fields.
    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    pub struct AnalysisResult {
        pub category: String,
        #[serde(default)]
        pub priority: Option<String>,
        #[serde(default)]
        pub summary: String,
        #[serde(default)]
        pub root_cause: RootCause,
        #[serde(default)]
        pub fix_suggestion: Option<String>,
        #[serde(default)]
        pub affected_files: Vec<String>,
        #[serde(default)]
        pub investigation_trace: Vec<String>,
        #[serde(default, alias = "routing_destination", alias = "team")]
        pub routing_key: Option<String>,
    }

    impl AnalysisResult {
        pub fn from_value(value: &Value) -> Result<Self, serde_json::Error> {
            Self::deserialize(value)
        }

        pub fn routing_key(&self) -> Option<&str> {
            self.routing_key
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty() && !s.eq_ignore_ascii_case("null"))
        }
    }

    pub fn has_mandatory_fields(value: &Value) -> bool {
        value
            .as_object()
            .is_some_and(|obj| obj.contains_key(CATEGORY_KEY) && obj.contains_key(SUMMARY_KEY))
    }
}
