//! Structured core events and the sinks that receive them
//!
//! Components never format log lines themselves. They hand a [`CoreEvent`]
//! to the [`EventSink`] injected at construction; the sink decides where it
//! goes (tracing, an in-memory buffer, a broadcast channel).

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::types::{AgentId, AgentOutcome, EntryId, Stage, TaskId, TaskKind};

/// Types of core events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    TaskSubmitted,
    TaskStarted,
    TaskCompleted,
    TaskFailed,
    TaskRetryScheduled,
    TaskCancelled,
    EntryInserted,
    EntryPromoted,
    EntryDemoted,
    EntryEvicted,
    AgentRegistered,
    AgentReleased,
}

/// A structured event emitted by the core
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoreEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    pub task_id: Option<TaskId>,
    pub entry_id: Option<EntryId>,
    pub agent_id: Option<AgentId>,
    pub kind: Option<TaskKind>,
    /// Stage before a transition
    pub from_stage: Option<Stage>,
    /// Stage after a transition
    pub to_stage: Option<Stage>,
    pub data: Option<serde_json::Value>,
}

impl CoreEvent {
    fn new(event_type: EventType) -> Self {
        Self {
            event_type,
            timestamp: Utc::now(),
            task_id: None,
            entry_id: None,
            agent_id: None,
            kind: None,
            from_stage: None,
            to_stage: None,
            data: None,
        }
    }

    pub fn task_submitted(task_id: &str, kind: &str) -> Self {
        Self {
            task_id: Some(task_id.to_string()),
            kind: Some(kind.to_string()),
            ..Self::new(EventType::TaskSubmitted)
        }
    }

    pub fn task_started(task_id: &str, agent_id: &str, attempt: u32) -> Self {
        Self {
            task_id: Some(task_id.to_string()),
            agent_id: Some(agent_id.to_string()),
            data: Some(serde_json::json!({ "attempt": attempt })),
            ..Self::new(EventType::TaskStarted)
        }
    }

    pub fn task_completed(task_id: &str, agent_id: &str, entry_id: &str) -> Self {
        Self {
            task_id: Some(task_id.to_string()),
            agent_id: Some(agent_id.to_string()),
            entry_id: Some(entry_id.to_string()),
            ..Self::new(EventType::TaskCompleted)
        }
    }

    pub fn task_failed(task_id: &str, agent_id: Option<&str>, error: &str) -> Self {
        Self {
            task_id: Some(task_id.to_string()),
            agent_id: agent_id.map(str::to_string),
            data: Some(serde_json::json!({ "error": error })),
            ..Self::new(EventType::TaskFailed)
        }
    }

    pub fn task_retry_scheduled(task_id: &str, attempt: u32, delay_ms: u64, error: &str) -> Self {
        Self {
            task_id: Some(task_id.to_string()),
            data: Some(serde_json::json!({
                "attempt": attempt,
                "delay_ms": delay_ms,
                "error": error,
            })),
            ..Self::new(EventType::TaskRetryScheduled)
        }
    }

    pub fn task_cancelled(task_id: &str, agent_id: Option<&str>) -> Self {
        Self {
            task_id: Some(task_id.to_string()),
            agent_id: agent_id.map(str::to_string),
            ..Self::new(EventType::TaskCancelled)
        }
    }

    pub fn entry_inserted(entry_id: &str, importance: f32) -> Self {
        Self {
            entry_id: Some(entry_id.to_string()),
            to_stage: Some(Stage::Working),
            data: Some(serde_json::json!({ "importance": importance })),
            ..Self::new(EventType::EntryInserted)
        }
    }

    pub fn entry_promoted(entry_id: &str, from: Stage, to: Stage) -> Self {
        Self {
            entry_id: Some(entry_id.to_string()),
            from_stage: Some(from),
            to_stage: Some(to),
            ..Self::new(EventType::EntryPromoted)
        }
    }

    pub fn entry_demoted(entry_id: &str, from: Stage, to: Stage) -> Self {
        Self {
            entry_id: Some(entry_id.to_string()),
            from_stage: Some(from),
            to_stage: Some(to),
            ..Self::new(EventType::EntryDemoted)
        }
    }

    pub fn entry_evicted(entry_id: &str, from: Stage) -> Self {
        Self {
            entry_id: Some(entry_id.to_string()),
            from_stage: Some(from),
            ..Self::new(EventType::EntryEvicted)
        }
    }

    pub fn agent_registered(agent_id: &str, capabilities: Vec<String>) -> Self {
        Self {
            agent_id: Some(agent_id.to_string()),
            data: Some(serde_json::json!({ "capabilities": capabilities })),
            ..Self::new(EventType::AgentRegistered)
        }
    }

    pub fn agent_released(agent_id: &str, outcome: AgentOutcome) -> Self {
        Self {
            agent_id: Some(agent_id.to_string()),
            data: Some(serde_json::json!({ "outcome": outcome })),
            ..Self::new(EventType::AgentReleased)
        }
    }
}

/// Receives core events
pub trait EventSink: Send + Sync {
    fn emit(&self, event: CoreEvent);
}

/// Shared handle to an event sink
pub type SharedSink = Arc<dyn EventSink>;

/// Forwards events to `tracing` at a level matching their severity
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: CoreEvent) {
        let task_id = event.task_id.as_deref().unwrap_or("-");
        let entry_id = event.entry_id.as_deref().unwrap_or("-");
        let agent_id = event.agent_id.as_deref().unwrap_or("-");
        match event.event_type {
            EventType::TaskFailed | EventType::TaskRetryScheduled => tracing::warn!(
                event = ?event.event_type,
                task_id,
                agent_id,
                data = ?event.data,
                "core event"
            ),
            EventType::EntryPromoted | EventType::EntryDemoted | EventType::EntryEvicted => {
                tracing::debug!(
                    event = ?event.event_type,
                    entry_id,
                    from = ?event.from_stage,
                    to = ?event.to_stage,
                    "core event"
                )
            }
            _ => tracing::info!(
                event = ?event.event_type,
                task_id,
                entry_id,
                agent_id,
                "core event"
            ),
        }
    }
}

/// Drops every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: CoreEvent) {}
}

/// Keeps events in memory, for inspection by embedders and tests
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<CoreEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<CoreEvent> {
        self.events.lock().clone()
    }

    pub fn of_type(&self, event_type: EventType) -> Vec<CoreEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.event_type == event_type)
            .cloned()
            .collect()
    }

    pub fn count(&self, event_type: EventType) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: CoreEvent) {
        self.events.lock().push(event);
    }
}

/// Fans events out to any number of `tokio` broadcast subscribers
pub struct BroadcastSink {
    tx: broadcast::Sender<CoreEvent>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for BroadcastSink {
    fn default() -> Self {
        Self::new(1000)
    }
}

impl EventSink for BroadcastSink {
    fn emit(&self, event: CoreEvent) {
        // No subscribers is not an error
        let _ = self.tx.send(event);
    }
}

/// Sends each event to several sinks in order
#[derive(Default)]
pub struct FanoutSink {
    sinks: Vec<SharedSink>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<SharedSink>) -> Self {
        Self { sinks }
    }
}

impl EventSink for FanoutSink {
    fn emit(&self, event: CoreEvent) {
        if let Some((last, rest)) = self.sinks.split_last() {
            for sink in rest {
                sink.emit(event.clone());
            }
            last.emit(event);
        }
    }
}
