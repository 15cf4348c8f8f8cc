//! Task orchestrator
//!
//! Turns requests into tasks, hands queued tasks to idle agents, and folds
//! agent results back into the memory store. Task state lives behind one
//! mutex; agent execution happens in spawned tasks that hold no lock.
//!
//! Lock order is orchestrator state, then agent pool, then memory store.

mod classify;

pub use classify::{ClassificationRule, Classifier};

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::agents::{AgentExecutor, AgentPool, CancelSignal, ExecutionContext, ExecutionError};
use crate::background::{spawn_periodic, BackgroundHandle};
use crate::config::OrchestratorConfig;
use crate::error::{Result, StageMemError};
use crate::events::{CoreEvent, SharedSink};
use crate::memory::MemoryStore;
use crate::scheduler::StageScheduler;
use crate::types::{
    AgentId, AgentOutcome, MemoryEntry, Request, Task, TaskId, TaskKind, TaskStatus,
};

/// What an agent handed back for one attempt
#[derive(Debug)]
pub enum AgentResult {
    Success(serde_json::Value),
    Failure(StageMemError),
    Cancelled,
}

/// Outcome of one dispatch round
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TickReport {
    /// (task, agent) pairs started this round
    pub dispatched: Vec<(TaskId, AgentId)>,
    /// Tasks still queued afterwards
    pub waiting: usize,
}

struct TaskRecord {
    task: Task,
    failures: u32,
    /// Backoff gate for a retried task
    not_before: Option<Instant>,
    cancel_tx: Option<watch::Sender<bool>>,
    cancel_requested: bool,
    status_tx: watch::Sender<TaskStatus>,
}

impl TaskRecord {
    fn new(task: Task) -> Self {
        let (status_tx, _) = watch::channel(task.status);
        Self {
            task,
            failures: 0,
            not_before: None,
            cancel_tx: None,
            cancel_requested: false,
            status_tx,
        }
    }

    fn set_status(&mut self, status: TaskStatus) {
        self.task.status = status;
        self.status_tx.send_replace(status);
    }

    fn finish(&mut self, status: TaskStatus) {
        self.task.completed_at = Some(Utc::now());
        self.not_before = None;
        self.cancel_tx = None;
        self.set_status(status);
    }
}

#[derive(Default)]
struct State {
    tasks: HashMap<TaskId, TaskRecord>,
    /// Queued task ids in submission order
    queue: VecDeque<TaskId>,
}

struct Launch {
    ctx: ExecutionContext,
    agent_id: AgentId,
    executor: Arc<dyn AgentExecutor>,
}

struct Inner {
    store: Arc<MemoryStore>,
    pool: Arc<AgentPool>,
    scheduler: OnceCell<Arc<StageScheduler>>,
    classifier: Classifier,
    config: OrchestratorConfig,
    sink: SharedSink,
    state: Mutex<State>,
}

/// Classifies, dispatches and tracks tasks. Cheap to clone.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    /// Build an orchestrator. Configured rules replace the built-in classifier.
    pub fn new(
        store: Arc<MemoryStore>,
        pool: Arc<AgentPool>,
        config: OrchestratorConfig,
        sink: SharedSink,
    ) -> Result<Self> {
        let classifier = match &config.rules {
            Some(rules) => Classifier::from_config(rules)?,
            None => Classifier::default(),
        };
        Ok(Self::with_classifier(store, pool, classifier, config, sink))
    }

    pub fn with_classifier(
        store: Arc<MemoryStore>,
        pool: Arc<AgentPool>,
        classifier: Classifier,
        config: OrchestratorConfig,
        sink: SharedSink,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                pool,
                scheduler: OnceCell::new(),
                classifier,
                config,
                sink,
                state: Mutex::new(State::default()),
            }),
        }
    }

    /// Notify `scheduler` after every stored result
    pub fn attach_scheduler(&self, scheduler: Arc<StageScheduler>) -> Result<()> {
        self.inner
            .scheduler
            .set(scheduler)
            .map_err(|_| StageMemError::Internal("scheduler already attached".to_string()))
    }

    pub fn classifier(&self) -> &Classifier {
        &self.inner.classifier
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.inner.store
    }

    pub fn pool(&self) -> &Arc<AgentPool> {
        &self.inner.pool
    }

    /// Classify a request and queue it as a task
    pub fn submit(&self, request: impl Into<Request>) -> Result<TaskId> {
        let request = request.into();
        let kind = self.inner.classifier.classify(&request.text)?;
        Ok(self.enqueue(kind, &request))
    }

    /// Queue a task of a known kind without classification
    pub fn submit_kind(&self, kind: impl Into<TaskKind>, request: impl Into<Request>) -> TaskId {
        self.enqueue(kind.into(), &request.into())
    }

    fn enqueue(&self, kind: TaskKind, request: &Request) -> TaskId {
        let task = Task::new(kind, request);
        let task_id = task.id.clone();
        let kind = task.kind.clone();
        {
            let mut state = self.inner.state.lock();
            state.tasks.insert(task_id.clone(), TaskRecord::new(task));
            state.queue.push_back(task_id.clone());
        }

        tracing::debug!(task_id = %task_id, kind = %kind, "Task queued");
        self.inner
            .sink
            .emit(CoreEvent::task_submitted(&task_id, &kind));
        task_id
    }

    /// Dispatch every ready queued task that has an idle capable agent.
    ///
    /// Must be called from within a Tokio runtime; executions are spawned.
    pub fn tick(&self) -> TickReport {
        let now = Instant::now();
        let mut report = TickReport::default();
        let mut launches = Vec::new();
        let mut events = Vec::new();

        {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            // kinds with no idle agent left this round
            let mut exhausted: HashSet<TaskKind> = HashSet::new();
            let mut remaining = VecDeque::with_capacity(state.queue.len());

            while let Some(task_id) = state.queue.pop_front() {
                let Some(record) = state.tasks.get_mut(&task_id) else {
                    continue;
                };
                if record.task.status != TaskStatus::Queued {
                    continue;
                }
                let backing_off = record.not_before.map_or(false, |at| at > now);
                if backing_off || exhausted.contains(&record.task.kind) {
                    remaining.push_back(task_id);
                    continue;
                }

                let agent_id = match self.inner.pool.claim(&record.task.kind) {
                    Ok(agent_id) => agent_id,
                    Err(_) => {
                        exhausted.insert(record.task.kind.clone());
                        remaining.push_back(task_id);
                        continue;
                    }
                };

                let executor = match self.inner.pool.executor(&agent_id) {
                    Ok(executor) => executor,
                    Err(e) => {
                        tracing::error!(task_id = %task_id, agent_id = %agent_id, "Claimed agent has no executor: {}", e);
                        let _ = self.inner.pool.release(&agent_id, AgentOutcome::Failed);
                        let error = StageMemError::Internal(e.to_string()).to_string();
                        record.task.last_error = Some(error.clone());
                        record.finish(TaskStatus::Failed);
                        events.push(CoreEvent::task_failed(&task_id, Some(&agent_id), &error));
                        continue;
                    }
                };

                let (cancel_tx, cancel_rx) = watch::channel(false);
                record.task.attempts += 1;
                record.task.assigned_agent_id = Some(agent_id.clone());
                record.not_before = None;
                record.cancel_tx = Some(cancel_tx);
                record.set_status(TaskStatus::Running);

                let attempt = record.task.attempts;
                tracing::debug!(task_id = %task_id, agent_id = %agent_id, attempt, "Task dispatched");
                events.push(CoreEvent::task_started(&task_id, &agent_id, attempt));
                launches.push(Launch {
                    ctx: ExecutionContext {
                        task_id: task_id.clone(),
                        kind: record.task.kind.clone(),
                        payload: record.task.payload.clone(),
                        attempt,
                        cancel: CancelSignal::new(cancel_rx),
                    },
                    agent_id: agent_id.clone(),
                    executor,
                });
                report.dispatched.push((task_id, agent_id));
            }

            state.queue = remaining;
            report.waiting = state.queue.len();
        }

        for event in events {
            self.inner.sink.emit(event);
        }
        for launch in launches {
            self.launch(launch);
        }
        report
    }

    fn launch(&self, launch: Launch) {
        let orchestrator = self.clone();
        let timeout = self.inner.config.task_timeout();
        let timeout_ms = self.inner.config.task_timeout_ms;

        tokio::spawn(async move {
            let Launch {
                ctx,
                agent_id,
                executor,
            } = launch;
            let task_id = ctx.task_id.clone();
            let attempt = ctx.attempt;

            let mut execution = tokio::spawn(async move { executor.execute(&ctx).await });
            let result = match tokio::time::timeout(timeout, &mut execution).await {
                Ok(Ok(Ok(value))) => AgentResult::Success(value),
                Ok(Ok(Err(ExecutionError::Cancelled))) => AgentResult::Cancelled,
                Ok(Ok(Err(ExecutionError::Failed(message)))) => {
                    AgentResult::Failure(StageMemError::AgentExecution(message))
                }
                Ok(Err(join_error)) => AgentResult::Failure(StageMemError::AgentExecution(
                    format!("agent {} aborted: {}", agent_id, join_error),
                )),
                Err(_) => {
                    execution.abort();
                    tracing::warn!(task_id = %task_id, agent_id = %agent_id, timeout_ms, "Task attempt timed out");
                    AgentResult::Failure(StageMemError::Timeout {
                        task_id: task_id.clone(),
                        timeout_ms,
                    })
                }
            };

            if let Err(e) = orchestrator.on_agent_result(&task_id, attempt, result) {
                tracing::error!(task_id = %task_id, "Failed to record agent result: {}", e);
            }
        });
    }

    /// Fold an agent's result for `attempt` into the task. Results for an
    /// attempt other than the current running one are ignored.
    pub fn on_agent_result(
        &self,
        task_id: &str,
        attempt: u32,
        result: AgentResult,
    ) -> Result<TaskStatus> {
        let mut events = Vec::new();
        let mut stored = false;

        let status = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            let record = state
                .tasks
                .get_mut(task_id)
                .ok_or_else(|| StageMemError::TaskNotFound(task_id.to_string()))?;

            if record.task.status != TaskStatus::Running || record.task.attempts != attempt {
                tracing::debug!(task_id, attempt, current = record.task.attempts, "Ignoring stale agent result");
                return Ok(record.task.status);
            }
            let agent_id = record.task.assigned_agent_id.clone().ok_or_else(|| {
                StageMemError::Internal(format!("running task {} has no agent", task_id))
            })?;
            record.cancel_tx = None;

            let release = |outcome: AgentOutcome| {
                if let Err(e) = self.inner.pool.release(&agent_id, outcome) {
                    tracing::error!(agent_id = %agent_id, "Agent release failed: {}", e);
                }
            };

            // any return after a cancel request acknowledges it
            let result = if record.cancel_requested {
                AgentResult::Cancelled
            } else {
                result
            };

            match result {
                AgentResult::Success(value) => {
                    let importance = self.inner.config.importance_for(&record.task.kind);
                    let entry = MemoryEntry::new(value)
                        .importance(importance)
                        .meta("task_id", json!(task_id))
                        .meta("kind", json!(record.task.kind))
                        .meta("agent_id", json!(agent_id))
                        .meta("request", json!(record.task.request))
                        .meta("attempt", json!(attempt));

                    match self.inner.store.put(entry) {
                        Ok(entry_id) => {
                            release(AgentOutcome::Completed);
                            record.task.result_entry_id = Some(entry_id.clone());
                            record.finish(TaskStatus::Completed);
                            tracing::info!(task_id, agent_id = %agent_id, entry_id = %entry_id, "Task completed");
                            events.push(CoreEvent::entry_inserted(&entry_id, importance));
                            events.push(CoreEvent::task_completed(task_id, &agent_id, &entry_id));
                            stored = true;
                        }
                        Err(e) => {
                            tracing::error!(task_id, "Storing task result failed: {}", e);
                            release(AgentOutcome::Failed);
                            let error = e.to_string();
                            record.task.last_error = Some(error.clone());
                            record.finish(TaskStatus::Failed);
                            events.push(CoreEvent::task_failed(task_id, Some(&agent_id), &error));
                        }
                    }
                }
                AgentResult::Failure(error) => {
                    release(match error {
                        StageMemError::Timeout { .. } => AgentOutcome::TimedOut,
                        _ => AgentOutcome::Failed,
                    });
                    record.failures += 1;
                    let message = error.to_string();
                    record.task.last_error = Some(message.clone());

                    if error.is_retryable() && record.failures < self.inner.config.max_retries {
                        let delay = self.inner.config.retry.delay_for(record.failures);
                        let delay_ms = delay.as_millis() as u64;
                        record.task.assigned_agent_id = None;
                        record.not_before = Some(Instant::now() + delay);
                        record.set_status(TaskStatus::Queued);
                        tracing::warn!(task_id, failures = record.failures, delay_ms, "Task failed, retry scheduled: {}", message);
                        events.push(CoreEvent::task_retry_scheduled(
                            task_id,
                            record.task.attempts + 1,
                            delay_ms,
                            &message,
                        ));
                        state.queue.push_back(task_id.to_string());
                    } else {
                        record.finish(TaskStatus::Failed);
                        tracing::warn!(task_id, failures = record.failures, "Task failed: {}", message);
                        events.push(CoreEvent::task_failed(task_id, Some(&agent_id), &message));
                    }
                }
                AgentResult::Cancelled => {
                    release(AgentOutcome::Cancelled);
                    record.finish(TaskStatus::Cancelled);
                    tracing::info!(task_id, agent_id = %agent_id, "Task cancelled");
                    events.push(CoreEvent::task_cancelled(task_id, Some(&agent_id)));
                }
            }
            record.task.status
        };

        for event in events {
            self.inner.sink.emit(event);
        }
        if stored {
            if let Some(scheduler) = self.inner.scheduler.get() {
                scheduler.on_write();
            }
        }
        Ok(status)
    }

    /// Cancel a task. A queued task is cancelled at once; a running task is
    /// signalled and becomes cancelled when its agent returns.
    pub fn cancel(&self, task_id: &str) -> Result<TaskStatus> {
        let mut cancelled = false;
        let status = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            let record = state
                .tasks
                .get_mut(task_id)
                .ok_or_else(|| StageMemError::TaskNotFound(task_id.to_string()))?;

            match record.task.status {
                TaskStatus::Queued => {
                    state.queue.retain(|id| id != task_id);
                    record.finish(TaskStatus::Cancelled);
                    cancelled = true;
                }
                TaskStatus::Running => {
                    record.cancel_requested = true;
                    if let Some(tx) = &record.cancel_tx {
                        let _ = tx.send(true);
                    }
                    tracing::debug!(task_id, "Cancellation requested");
                }
                status => {
                    return Err(StageMemError::InvalidTransition {
                        id: task_id.to_string(),
                        message: format!("cannot cancel a {} task", status),
                    })
                }
            }
            record.task.status
        };

        if cancelled {
            tracing::info!(task_id, "Task cancelled");
            self.inner.sink.emit(CoreEvent::task_cancelled(task_id, None));
        }
        Ok(status)
    }

    pub fn task(&self, task_id: &str) -> Result<Task> {
        self.inner
            .state
            .lock()
            .tasks
            .get(task_id)
            .map(|r| r.task.clone())
            .ok_or_else(|| StageMemError::TaskNotFound(task_id.to_string()))
    }

    /// All known tasks, oldest first
    pub fn tasks(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self
            .inner
            .state
            .lock()
            .tasks
            .values()
            .map(|r| r.task.clone())
            .collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        tasks
    }

    /// Watch a task's status
    pub fn subscribe(&self, task_id: &str) -> Result<watch::Receiver<TaskStatus>> {
        self.inner
            .state
            .lock()
            .tasks
            .get(task_id)
            .map(|r| r.status_tx.subscribe())
            .ok_or_else(|| StageMemError::TaskNotFound(task_id.to_string()))
    }

    /// Resolve once the task reaches a terminal status
    pub async fn wait(&self, task_id: &str) -> Result<Task> {
        let mut rx = self.subscribe(task_id)?;
        loop {
            let terminal = rx.borrow_and_update().is_terminal();
            if terminal || rx.changed().await.is_err() {
                break;
            }
        }
        self.task(task_id)
    }

    pub fn queued_count(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    pub fn running_count(&self) -> usize {
        self.inner
            .state
            .lock()
            .tasks
            .values()
            .filter(|r| r.task.status == TaskStatus::Running)
            .count()
    }

    /// Forget terminal tasks; returns how many were dropped
    pub fn prune_finished(&self) -> usize {
        let mut state = self.inner.state.lock();
        let before = state.tasks.len();
        state.tasks.retain(|_, r| !r.task.status.is_terminal());
        before - state.tasks.len()
    }

    /// Run `tick` on the configured interval until the handle is shut down
    pub fn spawn(&self) -> BackgroundHandle {
        let orchestrator = self.clone();
        spawn_periodic("dispatch", self.inner.config.tick_interval(), move || {
            let orchestrator = orchestrator.clone();
            async move {
                let report = orchestrator.tick();
                if !report.dispatched.is_empty() {
                    tracing::debug!(
                        dispatched = report.dispatched.len(),
                        waiting = report.waiting,
                        "Dispatch round"
                    );
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::FnExecutor;
    use crate::events::{EventType, RecordingSink};
    use crate::types::{Agent, AgentStatus, Stage};
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
    use std::time::Duration;

    struct Fixture {
        orchestrator: Orchestrator,
        store: Arc<MemoryStore>,
        pool: Arc<AgentPool>,
        sink: Arc<RecordingSink>,
    }

    fn fixture(config: OrchestratorConfig) -> Fixture {
        let sink = Arc::new(RecordingSink::new());
        let store = Arc::new(MemoryStore::new());
        let pool = Arc::new(AgentPool::new(sink.clone()));
        let orchestrator =
            Orchestrator::new(store.clone(), pool.clone(), config, sink.clone()).unwrap();
        Fixture {
            orchestrator,
            store,
            pool,
            sink,
        }
    }

    fn echo() -> Arc<dyn AgentExecutor> {
        Arc::new(FnExecutor::new(|ctx: ExecutionContext| async move {
            Ok::<_, ExecutionError>(json!({ "echo": ctx.payload["text"] }))
        }))
    }

    fn always_failing() -> Arc<dyn AgentExecutor> {
        Arc::new(FnExecutor::new(|_ctx: ExecutionContext| async {
            Err::<serde_json::Value, _>(ExecutionError::failed("upstream returned 503"))
        }))
    }

    fn until_cancelled() -> Arc<dyn AgentExecutor> {
        Arc::new(FnExecutor::new(|ctx: ExecutionContext| async move {
            ctx.cancel.cancelled().await;
            Err::<serde_json::Value, _>(ExecutionError::Cancelled)
        }))
    }

    #[tokio::test]
    async fn test_submit_classifies_and_queues() {
        let f = fixture(OrchestratorConfig::default());
        let id = f.orchestrator.submit("scrape https://example.com").unwrap();
        let task = f.orchestrator.task(&id).unwrap();
        assert_eq!(task.kind, "scrape");
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.payload, json!({ "text": "scrape https://example.com" }));
        assert_eq!(f.orchestrator.queued_count(), 1);
        assert_eq!(f.sink.count(EventType::TaskSubmitted), 1);

        let err = f.orchestrator.submit("good morning").unwrap_err();
        assert!(matches!(err, StageMemError::UnclassifiableRequest(_)));
        assert_eq!(f.orchestrator.tasks().len(), 1);
    }

    #[tokio::test]
    async fn test_task_waits_for_capable_agent() {
        let f = fixture(OrchestratorConfig::default());
        let id = f.orchestrator.submit("scrape the changelog").unwrap();

        let report = f.orchestrator.tick();
        assert!(report.dispatched.is_empty());
        assert_eq!(report.waiting, 1);
        assert_eq!(f.orchestrator.task(&id).unwrap().status, TaskStatus::Queued);

        f.pool.register(Agent::new("scraper", ["scrape"]), echo()).unwrap();
        let report = f.orchestrator.tick();
        assert_eq!(report.dispatched, vec![(id.clone(), "scraper".to_string())]);
        assert_eq!(f.orchestrator.task(&id).unwrap().status, TaskStatus::Running);

        let task = f.orchestrator.wait(&id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.completed_at.is_some());

        let entry = f.store.peek(task.result_entry_id.as_ref().unwrap()).unwrap();
        assert_eq!(entry.stage, Stage::Working);
        assert!((entry.importance - 0.6).abs() < f32::EPSILON);
        assert_eq!(entry.content, json!({ "echo": "scrape the changelog" }));
        assert_eq!(entry.metadata["task_id"], json!(id));
        assert_eq!(entry.metadata["agent_id"], json!("scraper"));
        assert_eq!(f.pool.get("scraper").unwrap().status, AgentStatus::Idle);
        assert_eq!(f.sink.count(EventType::EntryInserted), 1);
    }

    #[tokio::test]
    async fn test_busy_kind_does_not_block_other_kinds() {
        let f = fixture(OrchestratorConfig::default());
        f.pool.register(Agent::new("searcher", ["search"]), echo()).unwrap();
        let scrape = f.orchestrator.submit("crawl the docs").unwrap();
        let search = f.orchestrator.submit("search tokio watch").unwrap();

        let report = f.orchestrator.tick();
        assert_eq!(report.dispatched, vec![(search.clone(), "searcher".to_string())]);
        assert_eq!(report.waiting, 1);
        assert_eq!(f.orchestrator.task(&scrape).unwrap().status, TaskStatus::Queued);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_then_success() {
        let f = fixture(OrchestratorConfig::default());
        let calls = Arc::new(AtomicU32::new(0));
        let flaky = {
            let calls = calls.clone();
            Arc::new(FnExecutor::new(move |_ctx: ExecutionContext| {
                let calls = calls.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(ExecutionError::failed("connection reset"))
                    } else {
                        Ok(json!("ok"))
                    }
                }
            }))
        };
        f.pool.register(Agent::new("s", ["search"]), flaky).unwrap();

        let handle = f.orchestrator.spawn();
        let id = f.orchestrator.submit("search rust").unwrap();
        let task = f.orchestrator.wait(&id).await.unwrap();
        handle.shutdown().await;

        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.attempts, 2);
        assert_eq!(task.last_error.as_deref(), Some("Agent execution error: connection reset"));
        assert_eq!(f.sink.count(EventType::TaskRetryScheduled), 1);
        let stats = f.pool.stats("s").unwrap();
        assert_eq!((stats.failed, stats.completed), (1, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_exhausts_retries() {
        let f = fixture(OrchestratorConfig::default());
        f.pool.register(Agent::new("s", ["scrape"]), always_failing()).unwrap();

        let handle = f.orchestrator.spawn();
        let id = f.orchestrator.submit("scrape https://example.com").unwrap();
        let task = f.orchestrator.wait(&id).await.unwrap();
        handle.shutdown().await;

        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.attempts, 3);
        assert!(task.result_entry_id.is_none());
        assert!(f.store.is_empty());
        assert_eq!(f.pool.stats("s").unwrap().failed, 3);
        assert_eq!(f.pool.get("s").unwrap().status, AgentStatus::Idle);
        assert_eq!(f.sink.count(EventType::TaskFailed), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_releases_agent() {
        let config = OrchestratorConfig {
            max_retries: 1,
            task_timeout_ms: 1_000,
            ..Default::default()
        };
        let f = fixture(config);
        let slow = Arc::new(FnExecutor::new(|_ctx: ExecutionContext| async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok::<_, ExecutionError>(json!("late"))
        }));
        f.pool.register(Agent::new("slow", ["analyze"]), slow).unwrap();

        let id = f.orchestrator.submit("analyze the logs").unwrap();
        f.orchestrator.tick();
        let task = f.orchestrator.wait(&id).await.unwrap();

        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.last_error.unwrap().contains("timed out after 1000ms"));
        assert_eq!(f.pool.stats("slow").unwrap().timed_out, 1);
        assert_eq!(f.pool.get("slow").unwrap().status, AgentStatus::Idle);
        assert!(f.store.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_queued_task() {
        let f = fixture(OrchestratorConfig::default());
        let id = f.orchestrator.submit("search anything").unwrap();
        assert_eq!(f.orchestrator.cancel(&id).unwrap(), TaskStatus::Cancelled);
        assert_eq!(f.orchestrator.queued_count(), 0);

        let err = f.orchestrator.cancel(&id).unwrap_err();
        assert!(matches!(err, StageMemError::InvalidTransition { .. }));
        assert!(matches!(
            f.orchestrator.cancel("task_missing"),
            Err(StageMemError::TaskNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_cancel_running_task_waits_for_agent() {
        let f = fixture(OrchestratorConfig::default());
        f.pool.register(Agent::new("a", ["search"]), until_cancelled()).unwrap();
        let id = f.orchestrator.submit("search forever").unwrap();
        f.orchestrator.tick();

        assert_eq!(f.orchestrator.cancel(&id).unwrap(), TaskStatus::Running);
        let task = f.orchestrator.wait(&id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Cancelled);
        assert_eq!(f.pool.get("a").unwrap().status, AgentStatus::Idle);
        assert_eq!(f.pool.stats("a").unwrap().cancelled, 1);
        assert!(f.store.is_empty());
    }

    #[tokio::test]
    async fn test_stale_attempt_results_are_ignored() {
        let f = fixture(OrchestratorConfig::default());
        f.pool.register(Agent::new("a", ["search"]), until_cancelled()).unwrap();
        let id = f.orchestrator.submit("search slowly").unwrap();
        f.orchestrator.tick();

        let status = f
            .orchestrator
            .on_agent_result(&id, 7, AgentResult::Success(json!("stale")))
            .unwrap();
        assert_eq!(status, TaskStatus::Running);
        assert!(f.store.is_empty());

        f.orchestrator.cancel(&id).unwrap();
        f.orchestrator.wait(&id).await.unwrap();
        let status = f
            .orchestrator
            .on_agent_result(&id, 1, AgentResult::Success(json!("late")))
            .unwrap();
        assert_eq!(status, TaskStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_running_tasks_never_exceed_agents() {
        let f = fixture(OrchestratorConfig::default());
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        for i in 0..2 {
            let active = active.clone();
            let peak = peak.clone();
            let executor = Arc::new(FnExecutor::new(move |_ctx: ExecutionContext| {
                let active = active.clone();
                let peak = peak.clone();
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, ExecutionError>(json!(null))
                }
            }));
            f.pool.register(Agent::new(format!("w{}", i), ["search"]), executor).unwrap();
        }

        let ids: Vec<_> = (0..6)
            .map(|i| f.orchestrator.submit(format!("search item {}", i)).unwrap())
            .collect();
        let handle = f.orchestrator.spawn();
        for id in &ids {
            assert_eq!(f.orchestrator.wait(id).await.unwrap().status, TaskStatus::Completed);
        }
        handle.shutdown().await;

        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(f.store.len(), 6);
        assert_eq!(f.orchestrator.prune_finished(), 6);
    }

    #[tokio::test]
    async fn test_attached_scheduler_runs_on_write() {
        use crate::config::SchedulerConfig;

        let config = OrchestratorConfig {
            kind_importance: [("analyze".to_string(), 0.9)].into_iter().collect(),
            ..Default::default()
        };
        let f = fixture(config);
        let scheduler = Arc::new(StageScheduler::new(
            f.store.clone(),
            SchedulerConfig {
                trigger_on_write: true,
                ..Default::default()
            },
            f.sink.clone(),
        ));
        f.orchestrator.attach_scheduler(scheduler.clone()).unwrap();
        assert!(f.orchestrator.attach_scheduler(scheduler).is_err());

        f.pool.register(Agent::new("a", ["analyze"]), echo()).unwrap();
        let id = f.orchestrator.submit("analyze churn").unwrap();
        f.orchestrator.tick();
        let task = f.orchestrator.wait(&id).await.unwrap();

        let entry = f.store.peek(&task.result_entry_id.unwrap()).unwrap();
        assert_eq!(entry.stage, Stage::ShortTerm);
    }
}
