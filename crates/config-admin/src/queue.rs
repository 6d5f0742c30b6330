//! Strictly ordered single-worker task queue.
//!
//! Each queue owns exactly one tokio worker that runs tasks one at a time in
//! submission order. A task that fails or panics is logged and the worker
//! moves on. After shutdown pending tasks are discarded and new submissions
//! are dropped.

use std::fmt::Display;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, warn};

/// Executes tasks taken off a [`DeliveryQueue`].
#[async_trait]
pub trait TaskRunner<T>: Send + Sync + 'static {
    async fn run(&self, task: T);
}

enum Job<T> {
    Task(T),
    Barrier(oneshot::Sender<()>),
}

/// FIFO queue with one background worker.
pub struct DeliveryQueue<T> {
    name: String,
    sender: Mutex<Option<mpsc::UnboundedSender<Job<T>>>>,
    terminated: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
    running: Arc<Mutex<Option<AbortHandle>>>,
}

impl<T> DeliveryQueue<T>
where
    T: Display + Send + 'static,
{
    /// Start the worker. Must be called inside a tokio runtime.
    pub fn start(name: impl Into<String>, runner: Arc<dyn TaskRunner<T>>) -> Self {
        let name = name.into();
        let (sender, receiver) = mpsc::unbounded_channel();
        let terminated = Arc::new(AtomicBool::new(false));
        let running = Arc::new(Mutex::new(None));

        let worker = tokio::spawn(Self::work(
            name.clone(),
            receiver,
            runner,
            terminated.clone(),
            running.clone(),
        ));
        debug!(queue = %name, "Delivery queue started");

        Self {
            name,
            sender: Mutex::new(Some(sender)),
            terminated,
            worker: Mutex::new(Some(worker)),
            running,
        }
    }

    async fn work(
        name: String,
        mut receiver: mpsc::UnboundedReceiver<Job<T>>,
        runner: Arc<dyn TaskRunner<T>>,
        terminated: Arc<AtomicBool>,
        running: Arc<Mutex<Option<AbortHandle>>>,
    ) {
        while let Some(job) = receiver.recv().await {
            match job {
                Job::Barrier(done) => {
                    let _ = done.send(());
                }
                Job::Task(task) => {
                    if terminated.load(Ordering::SeqCst) {
                        debug!(queue = %name, task = %task, "Discarding task after shutdown");
                        continue;
                    }
                    let label = task.to_string();
                    debug!(queue = %name, task = %label, "Running task");
                    let runner = runner.clone();
                    let handle = tokio::spawn(async move { runner.run(task).await });
                    *running.lock() = Some(handle.abort_handle());
                    let outcome = handle.await;
                    running.lock().take();
                    match outcome {
                        Err(e) if e.is_cancelled() => {
                            debug!(queue = %name, task = %label, "Task cancelled");
                        }
                        Err(e) => {
                            error!(queue = %name, task = %label, error = %e, "Task aborted");
                        }
                        Ok(()) => {}
                    }
                }
            }
        }
        debug!(queue = %name, "Delivery queue worker stopped");
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    /// Enqueue a task. Never blocks. Returns `false` if the queue is shut
    /// down and the task was dropped.
    pub fn schedule(&self, task: T) -> bool {
        if self.is_terminated() {
            debug!(queue = %self.name, task = %task, "Queue terminated, dropping task");
            return false;
        }
        match self.sender.lock().as_ref() {
            Some(sender) => {
                debug!(queue = %self.name, task = %task, "Scheduling task");
                sender.send(Job::Task(task)).is_ok()
            }
            None => false,
        }
    }

    /// Wait until every task submitted before this call has run.
    pub async fn sync(&self) {
        let (done, wait) = oneshot::channel();
        let sent = match self.sender.lock().as_ref() {
            Some(sender) => sender.send(Job::Barrier(done)).is_ok(),
            None => false,
        };
        if sent {
            let _ = wait.await;
        }
    }

    /// Stop accepting tasks, discard pending ones, and wait up to `grace`
    /// for the task in flight before aborting it along with the worker.
    pub async fn shutdown(&self, grace: Duration) {
        self.terminated.store(true, Ordering::SeqCst);
        self.sender.lock().take();

        let worker = self.worker.lock().take();
        if let Some(mut worker) = worker {
            if tokio::time::timeout(grace, &mut worker).await.is_err() {
                warn!(queue = %self.name, "Worker did not stop in time, aborting");
                if let Some(task) = self.running.lock().take() {
                    task.abort();
                }
                worker.abort();
            }
        }
        debug!(queue = %self.name, "Delivery queue shut down");
    }
}
