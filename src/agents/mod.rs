//! Agent pool
//!
//! Keeps registered agents in registration order. `claim` and `release`
//! run under a single mutex so an idle agent is never handed out twice.
//! Stopping a busy agent is deferred until its task is released.

mod executor;

pub use executor::{AgentExecutor, CancelSignal, ExecutionContext, ExecutionError, FnExecutor};

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::error::{Result, StageMemError};
use crate::events::{CoreEvent, SharedSink};
use crate::types::{Agent, AgentId, AgentOutcome, AgentStats, AgentStatus};

struct AgentSlot {
    agent: Agent,
    executor: Arc<dyn AgentExecutor>,
    /// Set when `stop` hits a busy agent; applied on release
    stop_requested: bool,
}

/// Registered worker agents
pub struct AgentPool {
    slots: Mutex<Vec<AgentSlot>>,
    stats: DashMap<AgentId, AgentStats>,
    sink: SharedSink,
}

impl AgentPool {
    pub fn new(sink: SharedSink) -> Self {
        Self {
            slots: Mutex::new(Vec::new()),
            stats: DashMap::new(),
            sink,
        }
    }

    /// Add an agent; it starts idle
    pub fn register(&self, mut agent: Agent, executor: Arc<dyn AgentExecutor>) -> Result<()> {
        agent.status = AgentStatus::Idle;
        let capabilities: Vec<String> = agent.capabilities.iter().cloned().collect();
        let id = agent.id.clone();
        {
            let mut slots = self.slots.lock();
            if slots.iter().any(|s| s.agent.id == id) {
                return Err(StageMemError::DuplicateAgentId(id));
            }
            slots.push(AgentSlot {
                agent,
                executor,
                stop_requested: false,
            });
        }
        self.stats.insert(id.clone(), AgentStats::default());

        tracing::info!(agent_id = %id, ?capabilities, "Agent registered");
        self.sink.emit(CoreEvent::agent_registered(&id, capabilities));
        Ok(())
    }

    /// Mark the first idle agent able to run `kind` as busy and return its id
    pub fn claim(&self, kind: &str) -> Result<AgentId> {
        let mut slots = self.slots.lock();
        let slot = slots
            .iter_mut()
            .find(|s| s.agent.status == AgentStatus::Idle && s.agent.can_handle(kind))
            .ok_or_else(|| StageMemError::NoAvailableAgent(kind.to_string()))?;
        slot.agent.status = AgentStatus::Busy;
        tracing::debug!(agent_id = %slot.agent.id, kind, "Agent claimed");
        Ok(slot.agent.id.clone())
    }

    /// Return a busy agent to idle and record how its task ended.
    /// An agent stopped mid-task becomes stopped instead.
    pub fn release(&self, agent_id: &str, outcome: AgentOutcome) -> Result<()> {
        {
            let mut slots = self.slots.lock();
            let slot = slots
                .iter_mut()
                .find(|s| s.agent.id == agent_id)
                .ok_or_else(|| StageMemError::AgentNotFound(agent_id.to_string()))?;
            match slot.agent.status {
                AgentStatus::Busy if slot.stop_requested => {
                    slot.stop_requested = false;
                    slot.agent.status = AgentStatus::Stopped;
                }
                AgentStatus::Busy => slot.agent.status = AgentStatus::Idle,
                AgentStatus::Idle => {
                    tracing::warn!(agent_id, "Release of an agent that was not busy");
                }
                AgentStatus::Stopped => {}
            }
        }

        self.stats
            .entry(agent_id.to_string())
            .or_default()
            .record(outcome);
        self.sink.emit(CoreEvent::agent_released(agent_id, outcome));
        Ok(())
    }

    /// Take an agent out of rotation. A busy agent finishes its task first.
    pub fn stop(&self, agent_id: &str) -> Result<()> {
        let mut slots = self.slots.lock();
        let slot = slots
            .iter_mut()
            .find(|s| s.agent.id == agent_id)
            .ok_or_else(|| StageMemError::AgentNotFound(agent_id.to_string()))?;
        match slot.agent.status {
            AgentStatus::Busy => {
                slot.stop_requested = true;
                tracing::info!(agent_id, "Agent will stop after its current task");
            }
            AgentStatus::Idle => {
                slot.agent.status = AgentStatus::Stopped;
                tracing::info!(agent_id, "Agent stopped");
            }
            AgentStatus::Stopped => {}
        }
        Ok(())
    }

    /// Put a stopped agent back into rotation, or cancel a pending stop
    /// of a busy one
    pub fn resume(&self, agent_id: &str) -> Result<()> {
        let mut slots = self.slots.lock();
        let slot = slots
            .iter_mut()
            .find(|s| s.agent.id == agent_id)
            .ok_or_else(|| StageMemError::AgentNotFound(agent_id.to_string()))?;
        match slot.agent.status {
            AgentStatus::Stopped => slot.agent.status = AgentStatus::Idle,
            AgentStatus::Busy => slot.stop_requested = false,
            AgentStatus::Idle => {}
        }
        Ok(())
    }

    pub fn get(&self, agent_id: &str) -> Result<Agent> {
        self.slots
            .lock()
            .iter()
            .find(|s| s.agent.id == agent_id)
            .map(|s| s.agent.clone())
            .ok_or_else(|| StageMemError::AgentNotFound(agent_id.to_string()))
    }

    pub fn executor(&self, agent_id: &str) -> Result<Arc<dyn AgentExecutor>> {
        self.slots
            .lock()
            .iter()
            .find(|s| s.agent.id == agent_id)
            .map(|s| Arc::clone(&s.executor))
            .ok_or_else(|| StageMemError::AgentNotFound(agent_id.to_string()))
    }

    /// All agents in registration order
    pub fn agents(&self) -> Vec<Agent> {
        self.slots.lock().iter().map(|s| s.agent.clone()).collect()
    }

    pub fn stats(&self, agent_id: &str) -> Option<AgentStats> {
        self.stats.get(agent_id).map(|s| s.clone())
    }

    /// Number of idle agents that could take `kind`
    pub fn idle_count(&self, kind: &str) -> usize {
        self.slots
            .lock()
            .iter()
            .filter(|s| s.agent.status == AgentStatus::Idle && s.agent.can_handle(kind))
            .count()
    }

    pub fn busy_count(&self) -> usize {
        self.slots
            .lock()
            .iter()
            .filter(|s| s.agent.status == AgentStatus::Busy)
            .count()
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }
}
