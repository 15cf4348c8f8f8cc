//! Periodic background loops with graceful shutdown

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Handle to a running periodic loop
pub struct BackgroundHandle {
    name: &'static str,
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl BackgroundHandle {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Signal the loop to stop and wait for it. An iteration already in
    /// progress runs to completion.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.join.await {
            tracing::error!(task = self.name, "Background task failed: {}", e);
        }
    }
}

/// Run `f` every `period` until the returned handle is shut down.
/// The first run happens one full period after spawning.
pub fn spawn_periodic<F, Fut>(name: &'static str, period: Duration, mut f: F) -> BackgroundHandle
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

    let join = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // first tick fires immediately
        ticker.tick().await;
        tracing::info!(task = name, period_ms = period.as_millis() as u64, "Background task started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    f().await;
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!(task = name, "Background task stopped");
    });

    BackgroundHandle {
        name,
        shutdown_tx,
        join,
    }
}
