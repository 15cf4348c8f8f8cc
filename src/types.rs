//! Core types for stagemem

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

use crate::error::{Result, StageMemError};

/// Unique identifier for a memory entry
pub type EntryId = String;

/// Unique identifier for a task
pub type TaskId = String;

/// Unique identifier for an agent
pub type AgentId = String;

/// Task kind (e.g. "scrape", "search", "analyze")
pub type TaskKind = String;

/// Memory stage, ordered from least to most durable
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Fresh results, not yet proven useful
    #[default]
    Working,
    /// Entries that earned a promotion through access or importance
    ShortTerm,
    /// Durable knowledge
    LongTerm,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Working => "working",
            Stage::ShortTerm => "short_term",
            Stage::LongTerm => "long_term",
        }
    }

    pub fn all() -> &'static [Stage] {
        &[Stage::Working, Stage::ShortTerm, Stage::LongTerm]
    }

    /// The next more durable stage, if any
    pub fn next(&self) -> Option<Stage> {
        match self {
            Stage::Working => Some(Stage::ShortTerm),
            Stage::ShortTerm => Some(Stage::LongTerm),
            Stage::LongTerm => None,
        }
    }

    /// The previous less durable stage, if any
    pub fn previous(&self) -> Option<Stage> {
        match self {
            Stage::Working => None,
            Stage::ShortTerm => Some(Stage::Working),
            Stage::LongTerm => Some(Stage::ShortTerm),
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "working" => Ok(Stage::Working),
            "short_term" | "short-term" => Ok(Stage::ShortTerm),
            "long_term" | "long-term" => Ok(Stage::LongTerm),
            _ => Err(format!("Unknown stage: {}", s)),
        }
    }
}

fn default_importance() -> f32 {
    0.5
}

/// A memory entry held by the store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntry {
    /// Unique identifier
    pub id: EntryId,
    /// Opaque payload
    pub content: serde_json::Value,
    /// Arbitrary metadata
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    /// Importance score (0.0 - 1.0)
    #[serde(default = "default_importance")]
    pub importance: f32,
    /// When the entry was created
    pub created_at: DateTime<Utc>,
    /// Number of times read
    #[serde(default)]
    pub access_count: u64,
    /// When the entry was last read
    #[serde(default)]
    pub last_accessed_at: Option<DateTime<Utc>>,
    /// Current stage
    #[serde(default)]
    pub stage: Stage,
}

impl MemoryEntry {
    /// Create an entry with a generated id
    pub fn new(content: serde_json::Value) -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string(), content)
    }

    /// Create an entry with a caller-chosen id
    pub fn with_id(id: impl Into<EntryId>, content: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            content,
            metadata: HashMap::new(),
            importance: default_importance(),
            created_at: Utc::now(),
            access_count: 0,
            last_accessed_at: None,
            stage: Stage::Working,
        }
    }

    pub fn importance(mut self, importance: f32) -> Self {
        self.importance = clamp_importance(importance);
        self
    }

    pub fn meta(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = at;
        self
    }

    /// Last moment the entry was touched: last read, or creation if never read
    pub fn last_touched(&self) -> DateTime<Utc> {
        self.last_accessed_at.unwrap_or(self.created_at)
    }

    /// Serialize into a plain JSON object for durable storage
    pub fn to_dict(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Rebuild an entry from [`MemoryEntry::to_dict`] output
    pub fn from_dict(value: serde_json::Value) -> Result<Self> {
        let entry: MemoryEntry = serde_json::from_value(value)?;
        if !(0.0..=1.0).contains(&entry.importance) {
            return Err(StageMemError::InvalidInput(format!(
                "entry {}: importance {} outside [0, 1]",
                entry.id, entry.importance
            )));
        }
        Ok(entry)
    }
}

/// Clamp an importance value into [0, 1], mapping NaN to 0
pub fn clamp_importance(value: f32) -> f32 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// Per-stage entry counts
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageStats {
    pub working: usize,
    pub short_term: usize,
    pub long_term: usize,
}

impl StageStats {
    pub fn total(&self) -> usize {
        self.working + self.short_term + self.long_term
    }

    pub(crate) fn bump(&mut self, stage: Stage) {
        match stage {
            Stage::Working => self.working += 1,
            Stage::ShortTerm => self.short_term += 1,
            Stage::LongTerm => self.long_term += 1,
        }
    }
}

/// Lifecycle status of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    /// Completed, failed and cancelled tasks never change again
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An inbound work request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Request {
    /// Free-text or command string used for classification
    pub text: String,
    /// Optional structured payload forwarded to the agent
    #[serde(default)]
    pub payload: Option<serde_json::Value>,
}

impl Request {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            payload: None,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }
}

impl From<&str> for Request {
    fn from(text: &str) -> Self {
        Request::text(text)
    }
}

impl From<String> for Request {
    fn from(text: String) -> Self {
        Request::text(text)
    }
}

/// A unit of dispatched work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub kind: TaskKind,
    /// Original request text
    pub request: String,
    pub payload: serde_json::Value,
    pub status: TaskStatus,
    pub assigned_agent_id: Option<AgentId>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result_entry_id: Option<EntryId>,
    /// Number of times the task has been dispatched
    #[serde(default)]
    pub attempts: u32,
    /// Most recent failure, if any
    #[serde(default)]
    pub last_error: Option<String>,
}

impl Task {
    pub fn new(kind: impl Into<TaskKind>, request: &Request) -> Self {
        Self {
            id: format!("task_{}", uuid::Uuid::new_v4()),
            kind: kind.into(),
            request: request.text.clone(),
            payload: request
                .payload
                .clone()
                .unwrap_or_else(|| serde_json::json!({ "text": request.text })),
            status: TaskStatus::Queued,
            assigned_agent_id: None,
            created_at: Utc::now(),
            completed_at: None,
            result_entry_id: None,
            attempts: 0,
            last_error: None,
        }
    }
}

/// Availability of an agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    #[default]
    Idle,
    Busy,
    Stopped,
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentStatus::Idle => write!(f, "idle"),
            AgentStatus::Busy => write!(f, "busy"),
            AgentStatus::Stopped => write!(f, "stopped"),
        }
    }
}

/// A worker agent and the task kinds it accepts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    pub capabilities: BTreeSet<TaskKind>,
    #[serde(default)]
    pub status: AgentStatus,
}

impl Agent {
    pub fn new<I, S>(id: impl Into<AgentId>, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<TaskKind>,
    {
        Self {
            id: id.into(),
            capabilities: capabilities.into_iter().map(Into::into).collect(),
            status: AgentStatus::Idle,
        }
    }

    pub fn can_handle(&self, kind: &str) -> bool {
        self.capabilities.contains(kind)
    }
}

/// How an agent's task ended, recorded on release
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentOutcome {
    Completed,
    Failed,
    TimedOut,
    Cancelled,
}

/// Per-agent outcome counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentStats {
    pub completed: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub cancelled: u64,
    pub last_outcome: Option<AgentOutcome>,
    pub last_released_at: Option<DateTime<Utc>>,
}

impl AgentStats {
    pub fn record(&mut self, outcome: AgentOutcome) {
        match outcome {
            AgentOutcome::Completed => self.completed += 1,
            AgentOutcome::Failed => self.failed += 1,
            AgentOutcome::TimedOut => self.timed_out += 1,
            AgentOutcome::Cancelled => self.cancelled += 1,
        }
        self.last_outcome = Some(outcome);
        self.last_released_at = Some(Utc::now());
    }

    pub fn total(&self) -> u64 {
        self.completed + self.failed + self.timed_out + self.cancelled
    }
}
