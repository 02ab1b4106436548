//! Background worker lifecycle
//!
//! Every periodic component (discovery, liveness probing, stats scraping,
//! config polling, stats logging) runs as one tokio task owned by a
//! [`WorkerHandle`]. The handle hands the task a [`ShutdownSignal`], and
//! `close` flips the signal and joins the task.

use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// How long `close` waits for a worker before aborting it
const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// Lifecycle errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("worker '{0}' is already running")]
    AlreadyRunning(&'static str),
}

/// Receiving side of a worker's shutdown flag
#[derive(Clone, Debug)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// Resolves once shutdown is requested or the owning handle is gone
    pub async fn wait(&mut self) {
        let _ = self.rx.wait_for(|stop| *stop).await;
    }

    pub fn is_shutdown(&self) -> bool {
        *self.rx.borrow()
    }
}

struct RunningWorker {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Owner of a single background task
pub struct WorkerHandle {
    name: &'static str,
    running: Mutex<Option<RunningWorker>>,
}

impl WorkerHandle {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            running: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Spawn the worker. Fails if it is already running.
    pub fn start<F, Fut>(&self, worker: F) -> Result<(), LifecycleError>
    where
        F: FnOnce(ShutdownSignal) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut running = self.running.lock();
        if running.is_some() {
            return Err(LifecycleError::AlreadyRunning(self.name));
        }

        let (shutdown, rx) = watch::channel(false);
        let task = tokio::spawn(worker(ShutdownSignal { rx }));
        *running = Some(RunningWorker { shutdown, task });

        tracing::debug!(worker = self.name, "Worker started");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .is_some_and(|worker| !worker.task.is_finished())
    }

    /// Signal shutdown and join the task. Safe to call repeatedly, and safe
    /// to call on a handle that was never started.
    pub async fn close(&self) {
        let Some(worker) = self.running.lock().take() else {
            return;
        };

        let _ = worker.shutdown.send(true);
        let mut task = worker.task;
        match tokio::time::timeout(CLOSE_GRACE, &mut task).await {
            Ok(Ok(())) => tracing::debug!(worker = self.name, "Worker stopped"),
            Ok(Err(e)) => tracing::warn!(worker = self.name, error = %e, "Worker ended abnormally"),
            Err(_) => {
                tracing::warn!(worker = self.name, "Worker did not stop in time, aborting");
                task.abort();
            }
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        if let Some(worker) = self.running.get_mut().take() {
            let _ = worker.shutdown.send(true);
            worker.task.abort();
        }
    }
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("name", &self.name)
            .field("running", &self.is_running())
            .finish()
    }
}
