//! Runtime wiring
//!
//! [`AgentCore`] builds the store, agent pool, scheduler and orchestrator
//! from one [`CoreConfig`], owns their background loops and stops them.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::agents::{AgentExecutor, AgentPool};
use crate::background::BackgroundHandle;
use crate::config::CoreConfig;
use crate::error::{Result, StageMemError};
use crate::events::{SharedSink, TracingSink};
use crate::knowledge::{KnowledgeBase, KnowledgeExecutor};
use crate::memory::MemoryStore;
use crate::orchestrator::Orchestrator;
use crate::scheduler::StageScheduler;
use crate::types::{Agent, Request, Task, TaskId};

/// Id of the built-in agent serving `lookup` tasks
pub const KNOWLEDGE_AGENT_ID: &str = "knowledge";

/// Builder for [`AgentCore`]
pub struct AgentCoreBuilder {
    config: CoreConfig,
    sink: Option<SharedSink>,
    store: Option<Arc<MemoryStore>>,
    knowledge: Option<Arc<KnowledgeBase>>,
    knowledge_agent: bool,
}

impl AgentCoreBuilder {
    /// Event sink for every component; defaults to [`TracingSink`]
    pub fn sink(mut self, sink: SharedSink) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Start from an existing store, e.g. one restored from a snapshot
    pub fn store(mut self, store: Arc<MemoryStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Use this table instead of `knowledge_path` or the built-in one
    pub fn knowledge(mut self, kb: Arc<KnowledgeBase>) -> Self {
        self.knowledge = Some(kb);
        self
    }

    /// Whether to register the knowledge agent for `lookup` (default: yes)
    pub fn knowledge_agent(mut self, enabled: bool) -> Self {
        self.knowledge_agent = enabled;
        self
    }

    pub fn build(self) -> Result<AgentCore> {
        self.config.validate()?;

        let sink = self.sink.unwrap_or_else(|| Arc::new(TracingSink));
        let knowledge = match (self.knowledge, &self.config.knowledge_path) {
            (Some(kb), _) => kb,
            (None, Some(path)) => Arc::new(KnowledgeBase::load(path)?),
            (None, None) => KnowledgeBase::builtin(),
        };

        let store = self.store.unwrap_or_default();
        let pool = Arc::new(AgentPool::new(sink.clone()));
        let scheduler = Arc::new(StageScheduler::new(
            store.clone(),
            self.config.scheduler.clone(),
            sink.clone(),
        ));
        let orchestrator = Orchestrator::new(
            store.clone(),
            pool.clone(),
            self.config.orchestrator.clone(),
            sink.clone(),
        )?;
        orchestrator.attach_scheduler(scheduler.clone())?;

        if self.knowledge_agent {
            pool.register(
                Agent::new(KNOWLEDGE_AGENT_ID, ["lookup"]),
                Arc::new(KnowledgeExecutor::new(knowledge.clone())),
            )?;
        }

        tracing::info!(
            knowledge_topics = knowledge.len(),
            rules = orchestrator.classifier().rules().len(),
            "Agent core built"
        );

        Ok(AgentCore {
            config: self.config,
            store,
            pool,
            scheduler,
            orchestrator,
            knowledge,
            handles: Mutex::new(Vec::new()),
        })
    }
}

/// The assembled core
pub struct AgentCore {
    config: CoreConfig,
    store: Arc<MemoryStore>,
    pool: Arc<AgentPool>,
    scheduler: Arc<StageScheduler>,
    orchestrator: Orchestrator,
    knowledge: Arc<KnowledgeBase>,
    handles: Mutex<Vec<BackgroundHandle>>,
}

impl AgentCore {
    pub fn builder(config: CoreConfig) -> AgentCoreBuilder {
        AgentCoreBuilder {
            config,
            sink: None,
            store: None,
            knowledge: None,
            knowledge_agent: true,
        }
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    pub fn pool(&self) -> &Arc<AgentPool> {
        &self.pool
    }

    pub fn scheduler(&self) -> &Arc<StageScheduler> {
        &self.scheduler
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    pub fn knowledge(&self) -> &Arc<KnowledgeBase> {
        &self.knowledge
    }

    pub fn register_agent(&self, agent: Agent, executor: Arc<dyn AgentExecutor>) -> Result<()> {
        self.pool.register(agent, executor)
    }

    pub fn submit(&self, request: impl Into<Request>) -> Result<TaskId> {
        self.orchestrator.submit(request)
    }

    pub async fn wait(&self, task_id: &str) -> Result<Task> {
        self.orchestrator.wait(task_id).await
    }

    /// Start the dispatch loop and, when an interval is configured, the
    /// scheduler loop. Must be called from within a Tokio runtime.
    pub fn start(&self) -> Result<()> {
        let mut handles = self.handles.lock();
        if !handles.is_empty() {
            return Err(StageMemError::InvalidInput(
                "agent core already started".to_string(),
            ));
        }
        handles.push(self.orchestrator.spawn());
        if let Some(handle) = self.scheduler.spawn() {
            handles.push(handle);
        }
        tracing::info!(loops = handles.len(), "Agent core started");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        !self.handles.lock().is_empty()
    }

    /// Stop the background loops. Tasks already running finish on their own.
    pub async fn shutdown(&self) {
        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            tracing::debug!(task = handle.name(), "Stopping background task");
            handle.shutdown().await;
        }
        tracing::info!("Agent core stopped");
    }
}
