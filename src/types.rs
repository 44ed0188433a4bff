use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One of the fixed, closed set of categories the classifier can
/// produce. Deterministic from `(prompt, files)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskCategory {
    CodeGeneration,
    CodeReview,
    BugSearch,
    Refactor,
    Documentation,
    CodebaseAnalysis,
    QuickQuery,
    General,
}

impl TaskCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskCategory::CodeGeneration => "code_generation",
            TaskCategory::CodeReview => "code_review",
            TaskCategory::BugSearch => "bug_search",
            TaskCategory::Refactor => "refactor",
            TaskCategory::Documentation => "documentation",
            TaskCategory::CodebaseAnalysis => "codebase_analysis",
            TaskCategory::QuickQuery => "quick_query",
            TaskCategory::General => "general",
        }
    }
}

impl std::fmt::Display for TaskCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Immutable once produced by the classifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskInfo {
    pub category: TaskCategory,
    pub file_count: usize,
    pub total_bytes: u64,
    pub use_parallel: bool,
    pub recommended_services: Vec<String>,
}

/// What kind of backend family a service descriptor describes. Invariant
/// after load — only the other descriptor fields are mutable through
/// the config layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceKind {
    Cli,
    OllamaHttp,
    OpenAiHttp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    pub id: String,
    pub kind: ServiceKind,
    pub enabled: bool,
    pub base_url: Option<String>,
    pub default_model: Option<String>,
    pub executable: Option<String>,
    pub capabilities: Vec<String>,
    pub context_window_hint: Option<u32>,
    /// Encrypted at rest; never logged, never serialized back out in
    /// diagnostics. See SPEC_FULL.md §6 for the at-rest property.
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
}

/// Per-category routing configuration. Invariant: every id referenced
/// must exist in the service descriptor set the router is constructed
/// with — violating this is a `Config` error at request start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingRule {
    pub primary: String,
    pub fallback: Vec<String>,
    pub parallel_threshold_files: usize,
    pub timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Single,
    Parallel,
    BroadcastAll,
}

/// Produced fresh per request by the router.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterDecision {
    pub primary: String,
    pub fallback: Vec<String>,
    pub mode: ExecutionMode,
    pub timeout_seconds: u64,
    /// Only populated when `mode == BroadcastAll`: every currently
    /// available service, not just primary + fallback.
    pub broadcast_targets: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

/// One per-service result inside a broadcast-all task record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastResult {
    pub service_id: String,
    pub chunks: usize,
    pub bytes: u64,
    pub error: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// The durable row describing one request through its life cycle.
/// Transitions queued → running → {completed, failed} are monotonic;
/// timestamps are set exactly once on first entry into each state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: String,
    pub status: TaskStatus,
    pub prompt: String,
    pub files: Vec<String>,
    pub preferences: HashMap<String, serde_json::Value>,
    pub service: Option<String>,
    pub category: Option<TaskCategory>,
    pub execution_mode: Option<ExecutionMode>,
    /// Truncated to 500 chars when the record is finalized.
    pub result: Option<String>,
    pub error: Option<String>,
    pub broadcast_results: Vec<BroadcastResult>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
}

impl TaskRecord {
    pub fn new(id: String, prompt: String, files: Vec<String>, preferences: HashMap<String, serde_json::Value>) -> Self {
        Self {
            id,
            status: TaskStatus::Queued,
            prompt,
            files,
            preferences,
            service: None,
            category: None,
            execution_mode: None,
            result: None,
            error: None,
            broadcast_results: Vec::new(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            duration_ms: None,
        }
    }

    /// Monotonic transition helper — sets the relevant timestamp
    /// exactly once and computes duration on terminal entry.
    pub fn transition(&mut self, status: TaskStatus) {
        let now = Utc::now();
        match status {
            TaskStatus::Running => {
                if self.started_at.is_none() {
                    self.started_at = Some(now);
                }
            }
            TaskStatus::Completed | TaskStatus::Failed => {
                if self.completed_at.is_none() {
                    self.completed_at = Some(now);
                    if let Some(started) = self.started_at {
                        self.duration_ms = Some((now - started).num_milliseconds());
                    }
                }
            }
            TaskStatus::Queued => {}
        }
        self.status = status;
    }

    pub fn set_result_truncated(&mut self, result: &str) {
        const LIMIT: usize = 500;
        self.result = Some(if result.chars().count() > LIMIT {
            result.chars().take(LIMIT).collect()
        } else {
            result.to_string()
        });
    }

    pub fn upsert_broadcast_result(&mut self, result: BroadcastResult) {
        if let Some(existing) = self
            .broadcast_results
            .iter_mut()
            .find(|r| r.service_id == result.service_id)
        {
            *existing = result;
        } else {
            self.broadcast_results.push(result);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: MessageRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Append-only: messages are never removed or reordered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub messages: Vec<Message>,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Conversation {
    pub fn new(id: String) -> Self {
        let now = Utc::now();
        Self {
            id,
            created_at: now,
            updated_at: now,
            messages: Vec::new(),
            metadata: HashMap::new(),
        }
    }
}

/// Immutable after insert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostRecord {
    pub id: i64,
    pub task_id: String,
    pub service_id: String,
    pub tokens_in: i64,
    pub tokens_out: i64,
    pub cost: f64,
    pub timestamp: DateTime<Utc>,
}

/// At most one active budget per period — setting a new one
/// deactivates the prior active row for the same period.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Budget {
    pub period: String,
    pub limit: f64,
    pub alert_fraction: f64,
    pub active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetAlert {
    pub period: String,
    pub limit: f64,
    pub current: f64,
    pub ratio: f64,
    pub alert_fraction: f64,
    pub exceeded: bool,
}

/// A peer's capability summary as advertised over the discovery
/// datagram — see `ServiceDescriptor` for the local, richer shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerServiceSummary {
    #[serde(rename = "type")]
    pub kind: ServiceKind,
    pub models: Vec<String>,
    pub capabilities: Vec<String>,
    pub base_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerNode {
    pub node_id: String,
    pub hostname: String,
    pub ip_address: String,
    pub port: u16,
    pub services: HashMap<String, PeerServiceSummary>,
    pub cpu_percent: f32,
    pub memory_percent: f32,
    pub active_tasks: u32,
    pub total_tasks: u64,
    pub last_seen: DateTime<Utc>,
    pub healthy: bool,
    pub enabled: bool,
    pub version: Option<String>,
    pub features: Vec<String>,
    pub first_seen: DateTime<Utc>,
}

impl PeerNode {
    pub fn missed_broadcasts(&self, discovery_interval_secs: u64) -> f64 {
        let age = (Utc::now() - self.last_seen).num_milliseconds() as f64 / 1000.0;
        age / discovery_interval_secs.max(1) as f64
    }

    /// Lower is better: load-weighted score used by `select_best_node`.
    pub fn load_score(&self) -> f64 {
        (self.cpu_percent as f64 + self.memory_percent as f64) / 2.0 + 10.0 * self.active_tasks as f64
    }
}

/// A validated, canonicalized file path that has passed the security
/// sandbox check. Only `PathValidator` may construct one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatedPath(pub std::path::PathBuf);

impl ValidatedPath {
    pub fn as_path(&self) -> &std::path::Path {
        &self.0
    }
}

impl std::fmt::Display for ValidatedPath {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

/// A single yielded chunk of a streaming execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub text: String,
}

/// One item in a broadcast-all multiplexed stream — tagged so
/// recipients can demultiplex by service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastChunk {
    pub service_id: String,
    pub chunk: String,
    pub done: bool,
    pub timestamp: DateTime<Utc>,
    pub error: Option<String>,
}

/// What the orchestrator yields to its caller — a single-service
/// stream of plain chunks, or a multiplexed broadcast stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TaskChunk {
    Text(String),
    Broadcast(BroadcastChunk),
}
