//! Unified task queue.
//!
//! Serializes every synchronization routine that could otherwise be invoked
//! concurrently by independent triggers (user action, periodic timer,
//! connectivity-regained event). Tasks run strictly one at a time in
//! priority order, FIFO within a priority; a failing task fails only its own
//! caller, never the loop.

use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::EngineError;

type TaskFuture = Pin<Box<dyn Future<Output = Result<Value, EngineError>> + Send>>;

struct QueuedTask {
    label: String,
    priority: i64,
    seq: u64,
    future: TaskFuture,
    done: oneshot::Sender<Result<Value, EngineError>>,
}

struct QueueInner {
    /// Sorted: highest priority first, earliest enqueue first within a
    /// priority. Head is index 0.
    pending: Mutex<Vec<QueuedTask>>,
    running: AtomicBool,
    seq: AtomicU64,
}

/// Priority-ordered, strictly sequential task executor.
#[derive(Clone)]
pub struct TaskQueue {
    inner: Arc<QueueInner>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(QueueInner {
                pending: Mutex::new(Vec::new()),
                running: AtomicBool::new(false),
                seq: AtomicU64::new(0),
            }),
        }
    }

    /// Enqueue a unit of work. Higher priority runs first; ties run in
    /// enqueue order. The receiver resolves with the task's own result.
    pub fn enqueue<F>(
        &self,
        label: impl Into<String>,
        priority: i64,
        future: F,
    ) -> oneshot::Receiver<Result<Value, EngineError>>
    where
        F: Future<Output = Result<Value, EngineError>> + Send + 'static,
    {
        let (done, rx) = oneshot::channel();
        let task = QueuedTask {
            label: label.into(),
            priority,
            seq: self.inner.seq.fetch_add(1, Ordering::SeqCst),
            future: Box::pin(future),
            done,
        };

        {
            let mut pending = match self.inner.pending.lock() {
                Ok(p) => p,
                Err(poisoned) => poisoned.into_inner(),
            };
            let position = pending
                .iter()
                .position(|t| t.priority < task.priority)
                .unwrap_or(pending.len());
            debug!(
                label = %task.label,
                priority = task.priority,
                depth = pending.len(),
                "task enqueued"
            );
            pending.insert(position, task);
        }

        if !self.inner.running.swap(true, Ordering::SeqCst) {
            let inner = Arc::clone(&self.inner);
            tokio::spawn(worker(inner));
        }

        rx
    }

    pub fn pending_len(&self) -> usize {
        self.inner
            .pending
            .lock()
            .map(|p| p.len())
            .unwrap_or_default()
    }

    pub fn is_busy(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Single worker loop: pop the head, await it, deliver, repeat until empty.
/// Going idle is decided under the pending lock so an enqueue cannot slip
/// between the emptiness check and the running-flag reset.
async fn worker(inner: Arc<QueueInner>) {
    loop {
        let task = {
            let mut pending = match inner.pending.lock() {
                Ok(p) => p,
                Err(poisoned) => poisoned.into_inner(),
            };
            if pending.is_empty() {
                inner.running.store(false, Ordering::SeqCst);
                return;
            }
            pending.remove(0)
        };

        debug!(label = %task.label, "task started");
        let result = task.future.await;
        match &result {
            Ok(_) => debug!(label = %task.label, "task finished"),
            Err(e) => warn!(label = %task.label, error = %e, "task failed"),
        }
        // Caller may have gone away; the loop continues regardless.
        let _ = task.done.send(result);
    }
}
