//! Agent execution boundary
//!
//! The core never knows what an agent does. It hands an
//! [`ExecutionContext`] to an [`AgentExecutor`] and gets back a JSON value or
//! an [`ExecutionError`].

use std::future::Future;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use thiserror::Error;
use tokio::sync::watch;

use crate::types::{TaskId, TaskKind};

/// Why an execution did not produce a result
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutionError {
    #[error("{0}")]
    Failed(String),

    #[error("execution cancelled")]
    Cancelled,
}

impl ExecutionError {
    pub fn failed(message: impl Into<String>) -> Self {
        ExecutionError::Failed(message.into())
    }
}

static NEVER: Lazy<watch::Sender<bool>> = Lazy::new(|| watch::channel(false).0);

/// Cooperative cancellation flag handed to executors
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    pub(crate) fn new(rx: watch::Receiver<bool>) -> Self {
        Self { rx }
    }

    /// A signal that never fires
    pub fn never() -> Self {
        Self {
            rx: NEVER.subscribe(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation is requested
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                // sender gone without cancelling; never resolves
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Everything an executor gets for one attempt of a task
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub task_id: TaskId,
    pub kind: TaskKind,
    pub payload: serde_json::Value,
    /// 1-based attempt number
    pub attempt: u32,
    pub cancel: CancelSignal,
}

/// Executes tasks of the kinds an agent is registered for
#[async_trait]
pub trait AgentExecutor: Send + Sync {
    async fn execute(&self, ctx: &ExecutionContext)
        -> Result<serde_json::Value, ExecutionError>;
}

/// Adapts an async closure into an executor
pub struct FnExecutor<F> {
    f: F,
}

impl<F> FnExecutor<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> AgentExecutor for FnExecutor<F>
where
    F: Fn(ExecutionContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<serde_json::Value, ExecutionError>> + Send,
{
    async fn execute(
        &self,
        ctx: &ExecutionContext,
    ) -> Result<serde_json::Value, ExecutionError> {
        (self.f)(ctx.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(cancel: CancelSignal) -> ExecutionContext {
        ExecutionContext {
            task_id: "task_1".to_string(),
            kind: "search".to_string(),
            payload: json!({ "text": "search rust" }),
            attempt: 1,
            cancel,
        }
    }

    #[tokio::test]
    async fn test_fn_executor_passes_context() {
        let executor = FnExecutor::new(|ctx: ExecutionContext| async move {
            Ok::<_, ExecutionError>(json!({ "echo": ctx.payload["text"], "attempt": ctx.attempt }))
        });
        let out = executor.execute(&ctx(CancelSignal::never())).await.unwrap();
        assert_eq!(out, json!({ "echo": "search rust", "attempt": 1 }));
    }

    #[tokio::test]
    async fn test_cancel_signal_fires() {
        let (tx, rx) = watch::channel(false);
        let signal = CancelSignal::new(rx);
        assert!(!signal.is_cancelled());

        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move { signal.cancelled().await })
        };
        tx.send(true).unwrap();
        waiter.await.unwrap();
        assert!(signal.is_cancelled());
    }

    #[test]
    fn test_error_display() {
        assert_eq!(ExecutionError::failed("503 upstream").to_string(), "503 upstream");
        assert_eq!(ExecutionError::Cancelled.to_string(), "execution cancelled");
    }
}
