use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Engine tunables, folded from CLI arguments.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub api_url: url::Url,
    pub poll_interval: Duration,
    pub request_timeout: Duration,
    pub reconnect_attempts: u32,
    pub reconnect_delay: Duration,
    pub event_queue_capacity: usize,
    pub log_capacity: usize,
}

impl EngineConfig {
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(2000);
    pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
    pub const DEFAULT_RECONNECT_ATTEMPTS: u32 = 5;
    pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(1000);
    pub const DEFAULT_EVENT_QUEUE_CAPACITY: usize = 256;
    pub const DEFAULT_LOG_CAPACITY: usize = 5000;

    pub fn new(api_url: url::Url) -> Self {
        Self {
            api_url,
            poll_interval: Self::DEFAULT_POLL_INTERVAL,
            request_timeout: Self::DEFAULT_REQUEST_TIMEOUT,
            reconnect_attempts: Self::DEFAULT_RECONNECT_ATTEMPTS,
            reconnect_delay: Self::DEFAULT_RECONNECT_DELAY,
            event_queue_capacity: Self::DEFAULT_EVENT_QUEUE_CAPACITY,
            log_capacity: Self::DEFAULT_LOG_CAPACITY,
        }
    }

    /// WebSocket URL of the log stream, derived from the HTTP base URL.
    pub fn logs_url(&self) -> Result<url::Url, url::ParseError> {
        let mut url = self.api_url.join("/ws/logs")?;
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        // http/https -> ws/wss is always a permitted scheme change.
        let _ = url.set_scheme(scheme);
        Ok(url)
    }
}

/// Opaque identifier of one backend pipeline execution.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Response of the run-start endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunTicket {
    pub run_id: RunId,
    /// Free-form acknowledgement, e.g. "started".
    #[serde(default)]
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartRequest<'a> {
    pub dataset_path: &'a str,
}

/// Where a run currently stands. A failure message can only exist on `Failed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunPhase {
    Running,
    Completed,
    Failed { error: Option<String> },
}

impl RunPhase {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunPhase::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunPhase::Running => "running",
            RunPhase::Completed => "completed",
            RunPhase::Failed { .. } => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetStats {
    pub size: u64,
    pub class_dist: BTreeMap<String, u64>,
    pub imbalance_ratio: f64,
    pub avg_blur: f64,
    pub avg_noise: f64,
    pub num_classes: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColorJitter {
    None,
    Low,
    Medium,
    /// Any level the trainer does not recognise; it trains without jitter.
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AugmentationPlan {
    pub rotation: f64,
    pub flip: bool,
    pub color_jitter: ColorJitter,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSelection {
    pub selected_model: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelResults {
    pub accuracy: f64,
    pub f1_score: f64,
    pub model: String,
    pub model_path: String,
}

/// Immutable status snapshot of one run. Each poll yields a fresh value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawRunStatus", into = "RawRunStatus")]
pub struct RunStatus {
    pub run_id: RunId,
    pub phase: RunPhase,
    pub current_stage: Option<String>,
    pub dataset_stats: Option<DatasetStats>,
    pub aug_plan: Option<AugmentationPlan>,
    pub selected_model: Option<ModelSelection>,
    pub model_results: Option<ModelResults>,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }

    #[allow(dead_code)]
    pub fn error(&self) -> Option<&str> {
        match &self.phase {
            RunPhase::Failed { error } => error.as_deref(),
            _ => None,
        }
    }
}

/// Wire shape of a status snapshot, validated into [`RunStatus`].
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawRunStatus {
    run_id: RunId,
    status: String,
    #[serde(default)]
    current_stage: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    dataset_stats: Option<DatasetStats>,
    #[serde(default, deserialize_with = "lenient")]
    aug_plan: Option<AugmentationPlan>,
    #[serde(default, deserialize_with = "lenient")]
    selected_model: Option<ModelSelection>,
    #[serde(default, deserialize_with = "lenient")]
    model_results: Option<ModelResults>,
    #[serde(default)]
    error: Option<String>,
}

/// Decode an optional payload, degrading a malformed one to `None`.
///
/// Payloads are agent output and only decorate a snapshot; a bad one must not
/// make the snapshot (and with it a terminal status) undecodable.
fn lenient<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: serde::Deserializer<'de>,
    T: serde::de::DeserializeOwned,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    match serde_json::from_value::<Option<T>>(value) {
        Ok(v) => Ok(v),
        Err(e) => {
            tracing::warn!(
                payload = std::any::type_name::<T>(),
                error = %e,
                "ignoring malformed status payload"
            );
            Ok(None)
        }
    }
}

impl TryFrom<RawRunStatus> for RunStatus {
    type Error = String;

    fn try_from(raw: RawRunStatus) -> Result<Self, Self::Error> {
        let phase = match (raw.status.as_str(), raw.error) {
            ("failed", error) => RunPhase::Failed { error },
            ("running", None) => RunPhase::Running,
            ("completed", None) => RunPhase::Completed,
            ("running" | "completed", Some(_)) => {
                return Err(format!(
                    "status '{}' must not carry an error message",
                    raw.status
                ))
            }
            (other, _) => return Err(format!("unknown run status '{other}'")),
        };
        Ok(RunStatus {
            run_id: raw.run_id,
            phase,
            current_stage: raw.current_stage,
            dataset_stats: raw.dataset_stats,
            aug_plan: raw.aug_plan,
            selected_model: raw.selected_model,
            model_results: raw.model_results,
        })
    }
}

impl From<RunStatus> for RawRunStatus {
    fn from(s: RunStatus) -> Self {
        let status = s.phase.as_str().to_string();
        let error = match s.phase {
            RunPhase::Failed { error } => error,
            _ => None,
        };
        RawRunStatus {
            run_id: s.run_id,
            status,
            current_stage: s.current_stage,
            dataset_stats: s.dataset_stats,
            aug_plan: s.aug_plan,
            selected_model: s.selected_model,
            model_results: s.model_results,
            error,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

impl LogLevel {
    pub fn label(self) -> &'static str {
        match self {
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARN",
            LogLevel::Error => "ERROR",
        }
    }
}

/// A log/agent event pushed by the backend over the event channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentEvent {
    pub timestamp: String,
    pub agent: String,
    pub message: String,
    pub level: LogLevel,
}

impl AgentEvent {
    /// Render a single display line.
    pub fn to_line(&self) -> String {
        format!(
            "[{}] {:<5} {}: {}",
            self.timestamp,
            self.level.label(),
            self.agent,
            self.message
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    pub path: String,
    /// Size in bytes, as reported (stringly) by the backend.
    pub size: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelList {
    pub models: Vec<ModelInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestResult {
    pub predicted_class: i64,
    pub confidence: f64,
    #[serde(default)]
    pub heatmap_base64: Option<String>,
    #[serde(default)]
    pub explanation: Option<String>,
}
