// src/infra/daemon.rs — Periodic background tasks
//
// Each task is a spawned loop that sleeps for its interval, runs one pass,
// and exits when told to stop. A failed pass is logged and the loop
// carries on.

use std::future::Future;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Handle to a running periodic task.
pub struct PeriodicTask {
    name: String,
    shutdown_tx: Option<broadcast::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl PeriodicTask {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Signal the loop to stop and wait for the current pass to finish.
    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                tracing::warn!("Task '{}' ended abnormally: {}", self.name, e);
            }
        }
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Spawn `pass` every `interval` until the returned handle is stopped or
/// dropped.
pub fn spawn_periodic<F, Fut, E>(name: &str, interval: Duration, mut pass: F) -> PeriodicTask
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
    let task_name = name.to_string();

    let handle = tokio::spawn(async move {
        tracing::info!(
            "Task '{}' started ({:?} interval)",
            task_name,
            interval
        );
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = pass().await {
                        tracing::warn!("Task '{}' pass failed: {}", task_name, e);
                    }
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("Task '{}' stopping", task_name);
                    break;
                }
            }
        }
    });

    PeriodicTask {
        name: name.to_string(),
        shutdown_tx: Some(shutdown_tx),
        handle: Some(handle),
    }
}
