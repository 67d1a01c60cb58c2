pub mod heartbeat;
pub mod status_poll;

pub use heartbeat::HeartbeatWorker;
pub use status_poll::StatusPollWorker;

use std::future::Future;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::Instrument;

/// A spawned worker loop and the shutdown signal it watches.
///
/// Stopping only signals: the loop finishes its current iteration and then exits
/// without starting another. Dropping the handle stops the worker.
#[derive(Debug)]
pub struct WorkerHandle {
    name: &'static str,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn spawn<F, Fut>(name: &'static str, worker: F) -> Self
    where
        F: FnOnce(watch::Receiver<bool>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (shutdown, rx) = watch::channel(false);
        let task = tokio::spawn(worker(rx).instrument(tracing::info_span!("worker", worker = name)));
        Self { name, shutdown, task: Some(task) }
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        !*self.shutdown.borrow() && self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Signals the worker to exit. Idempotent.
    pub fn stop(&self) {
        if !self.shutdown.send_replace(true) {
            tracing::debug!(worker = self.name, "Worker stop requested");
        }
    }

    /// Stops the worker and waits for its loop to return.
    pub async fn join(mut self) {
        self.stop();
        if let Some(task) = self.task.take()
            && let Err(e) = task.await
        {
            tracing::warn!(worker = self.name, error = %e, "Worker task ended abnormally");
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
