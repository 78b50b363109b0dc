use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use time::OffsetDateTime;

use crate::engine::llm::LlmErrorKind;

/// Generate a random identifier for runs, schedules and sessions.
pub fn new_id() -> String {
    let mut b = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut b);
    format!("{:016x}", u64::from_le_bytes(b))
}

/// Scoring strategy applied to each (predicted, expected) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvaluationMethod {
    Exact,
    #[default]
    Fuzzy,
    Semantic,
    Contains,
    /// Anything we don't recognise. Always scores 0.0.
    #[serde(other)]
    Unknown,
}

impl EvaluationMethod {
    pub const KNOWN: [EvaluationMethod; 4] = [
        EvaluationMethod::Exact,
        EvaluationMethod::Fuzzy,
        EvaluationMethod::Semantic,
        EvaluationMethod::Contains,
    ];

    /// Lenient parse: unrecognised names map to `Unknown` instead of failing.
    pub fn parse(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "exact" => Self::Exact,
            "fuzzy" => Self::Fuzzy,
            "semantic" => Self::Semantic,
            "contains" => Self::Contains,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Exact => "exact",
            Self::Fuzzy => "fuzzy",
            Self::Semantic => "semantic",
            Self::Contains => "contains",
            Self::Unknown => "unknown",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Self::Exact => "Case-insensitive exact match after trimming",
            Self::Fuzzy => "Similarity ratio of longest matching blocks",
            Self::Semantic => "Word-set overlap (Jaccard index)",
            Self::Contains => "Expected output appears inside the prediction",
            Self::Unknown => "Unrecognised method; always scores 0",
        }
    }
}

impl std::fmt::Display for EvaluationMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the executor treats per-sample failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunMode {
    /// First failure aborts the batch; no outcome is produced.
    Interactive,
    /// Failures are recorded, the sample is skipped and the batch continues.
    Scheduled,
}

/// Generation config for a prompt template. Read-only for the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptSystem {
    #[serde(default = "new_id")]
    pub id: String,
    pub name: String,
    pub template: String,
    #[serde(default)]
    pub variables: Vec<String>,
    #[serde(default = "default_provider")]
    pub provider: String,
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_top_p")]
    pub top_p: f64,
    #[serde(default)]
    pub top_k: Option<u32>,
    #[serde(with = "time::serde::rfc3339", default = "OffsetDateTime::now_utc")]
    pub created_at: OffsetDateTime,
}

fn default_provider() -> String {
    "openai".into()
}

fn default_temperature() -> f64 {
    0.7
}

fn default_max_tokens() -> u32 {
    1000
}

fn default_top_p() -> f64 {
    1.0
}

impl PromptSystem {
    /// Same generation parameters, different template.
    pub fn with_template(&self, template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
            ..self.clone()
        }
    }
}

/// One regression sample: template variables plus the expected output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    #[serde(default)]
    pub expected_output: String,
    #[serde(flatten)]
    pub variables: BTreeMap<String, serde_json::Value>,
}

impl Sample {
    pub fn new<K, V>(vars: impl IntoIterator<Item = (K, V)>, expected_output: &str) -> Self
    where
        K: Into<String>,
        V: Into<serde_json::Value>,
    {
        Self {
            expected_output: expected_output.to_string(),
            variables: vars
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// Scored result for a single sample. Never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampleResult {
    pub sample_index: usize,
    pub variables: BTreeMap<String, serde_json::Value>,
    pub expected_output: String,
    pub predicted_output: String,
    pub score: f64,
    pub evaluation_method: EvaluationMethod,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    MissingVariable,
    Upstream(LlmErrorKind),
}

/// A sample a scheduled run had to skip.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampleFailure {
    pub sample_index: usize,
    pub kind: FailureKind,
    pub message: String,
}

/// Aggregate result of one executor invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOutcome {
    pub results: Vec<SampleResult>,
    pub avg_score: f64,
    /// Number of samples actually evaluated.
    pub total_samples: usize,
    pub failure_count: usize,
    #[serde(default)]
    pub failures: Vec<SampleFailure>,
}

impl RunOutcome {
    pub fn new(results: Vec<SampleResult>, failures: Vec<SampleFailure>) -> Self {
        let avg_score = crate::metrics::mean(results.iter().map(|r| r.score));
        Self {
            total_samples: results.len(),
            failure_count: failures.len(),
            results,
            avg_score,
            failures,
        }
    }

    pub fn failure_occurred(&self) -> bool {
        !self.failures.is_empty()
    }

    /// Human-readable summary of every skipped sample, if any.
    pub fn failure_message(&self) -> Option<String> {
        if self.failures.is_empty() {
            return None;
        }
        Some(
            self.failures
                .iter()
                .map(|f| f.message.as_str())
                .collect::<Vec<_>>()
                .join("; "),
        )
    }

    /// Rebuild samples from stored results. Only evaluated samples survive.
    pub fn regression_set(&self) -> Vec<Sample> {
        self.results
            .iter()
            .map(|r| Sample {
                expected_output: r.expected_output.clone(),
                variables: r.variables.clone(),
            })
            .collect()
    }
}

/// A persisted run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: String,
    pub prompt_system_id: String,
    #[serde(default)]
    pub schedule_id: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub outcome: RunOutcome,
}

impl RunRecord {
    pub fn new(prompt_system_id: &str, schedule_id: Option<&str>, outcome: RunOutcome) -> Self {
        Self {
            id: new_id(),
            prompt_system_id: prompt_system_id.to_string(),
            schedule_id: schedule_id.map(str::to_string),
            created_at: OffsetDateTime::now_utc(),
            outcome,
        }
    }
}

/// Point in a prompt system's score history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryPoint {
    pub id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub avg_score: f64,
    pub total_samples: usize,
    pub is_scheduled: bool,
}

impl From<&RunRecord> for HistoryPoint {
    fn from(r: &RunRecord) -> Self {
        Self {
            id: r.id.clone(),
            created_at: r.created_at,
            avg_score: r.outcome.avg_score,
            total_samples: r.outcome.total_samples,
            is_scheduled: r.schedule_id.is_some(),
        }
    }
}

/// Recurring binding of a prompt system to a regression set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleDescriptor {
    pub id: String,
    pub name: String,
    pub prompt_system_id: String,
    pub regression_set: Vec<Sample>,
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    #[serde(default)]
    pub evaluation_method: EvaluationMethod,
    #[serde(default = "default_alert_threshold")]
    pub alert_threshold: f64,
    #[serde(default)]
    pub notifications_enabled: bool,
    #[serde(default)]
    pub recipients: Vec<String>,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_run_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub next_run_at: Option<OffsetDateTime>,
}

fn default_alert_threshold() -> f64 {
    0.2
}

fn default_active() -> bool {
    true
}

/// Progress events emitted by the executor and consumed by CLI layers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RunEvent {
    SampleStarted { index: usize },
    SampleScored { index: usize, score: f64 },
    SampleSkipped { index: usize, reason: String },
}

impl RunEvent {
    /// Render a human-readable message for CLI layers.
    pub fn to_message(&self) -> String {
        match self {
            RunEvent::SampleStarted { index } => format!("Sample {index}: calling model"),
            RunEvent::SampleScored { index, score } => {
                format!("Sample {index}: score {score:.3}")
            }
            RunEvent::SampleSkipped { index, reason } => {
                format!("Sample {index}: skipped ({reason})")
            }
        }
    }
}
