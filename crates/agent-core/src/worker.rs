//! Bounded worker pool: a fixed number of long-lived workers draining a
//! single FIFO queue of deferred tasks.
//!
//! RPC handlers must never perform VM/container create/start inline — they
//! build a [`Task`] and [`WorkerPool::add_task`] it, then return immediately.
//! The queue itself is unbounded: backpressure, if any is needed, belongs
//! to the RPC server's own concurrency limit, not this queue.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{Mutex, mpsc};
use tracing::{error, warn};

pub type Task = Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send>;

const DEFAULT_WORKERS: usize = 5;

struct Inner {
    sender: mpsc::UnboundedSender<Task>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<Task>>>,
    queued: AtomicUsize,
}

/// A bounded pool of `workers` long-lived tasks draining one FIFO channel.
///
/// Clone is cheap (`Arc` inside); every clone shares the same queue and
/// worker count. `run()` must be called exactly once to spawn the workers.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<Inner>,
    workers: usize,
}

impl WorkerPool {
    /// `workers` <= 0 is coerced to the default (5), matching the source's
    /// "default 5, configurable" note — a zero-worker pool would never drain.
    pub fn new(workers: usize) -> Self {
        let workers = if workers == 0 {
            DEFAULT_WORKERS
        } else {
            workers
        };
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                sender,
                receiver: Mutex::new(Some(receiver)),
                queued: AtomicUsize::new(0),
            }),
            workers,
        }
    }

    /// Enqueue a task. Never blocks (the channel is unbounded) and never
    /// executes the task inline.
    pub fn add_task(&self, task: Task) {
        self.inner.queued.fetch_add(1, Ordering::SeqCst);
        if self.inner.sender.send(task).is_err() {
            // Only happens if every worker (and thus every receiver) has
            // been dropped, i.e. the pool was shut down.
            warn!("worker pool task dropped: no workers running");
            self.inner.queued.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Current queue depth, for the `MonitorStream` metrics payload.
    pub fn queued_task_count(&self) -> usize {
        self.inner.queued.load(Ordering::SeqCst)
    }

    /// Spawn `workers` long-lived tasks draining the shared channel. Must be
    /// called once; subsequent calls are a no-op (the receiver was already
    /// taken).
    pub async fn run(&self) {
        let mut guard = self.inner.receiver.lock().await;
        let Some(receiver) = guard.take() else {
            warn!("worker pool already running, ignoring duplicate run()");
            return;
        };
        drop(guard);

        let receiver = Arc::new(Mutex::new(receiver));
        for id in 0..self.workers {
            let receiver = Arc::clone(&receiver);
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move {
                loop {
                    let task = {
                        let mut rx = receiver.lock().await;
                        rx.recv().await
                    };
                    match task {
                        Some(task) => {
                            inner.queued.fetch_sub(1, Ordering::SeqCst);
                            task().await;
                        }
                        None => {
                            tracing::debug!(worker = id, "worker pool channel closed, exiting");
                            break;
                        }
                    }
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use tokio::time::{Duration, sleep};

    #[tokio::test]
    async fn runs_all_enqueued_tasks() {
        let pool = WorkerPool::new(3);
        pool.run().await;

        let counter = Arc::new(AtomicU32::new(0));
        for _ in 0..20 {
            let counter = Arc::clone(&counter);
            pool.add_task(Box::new(move || {
                Box::pin(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
            }));
        }

        // Give workers a chance to drain; polling beats a fixed sleep flake.
        for _ in 0..200 {
            if counter.load(Ordering::SeqCst) == 20 {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(counter.load(Ordering::SeqCst), 20);
        assert_eq!(pool.queued_task_count(), 0);
    }

    #[tokio::test]
    async fn zero_workers_coerced_to_default() {
        let pool = WorkerPool::new(0);
        assert_eq!(pool.workers, DEFAULT_WORKERS);
    }

    #[tokio::test]
    async fn queued_count_reflects_pending_work() {
        let pool = WorkerPool::new(1);
        // Don't call run() yet: tasks should sit in the queue.
        for _ in 0..5 {
            pool.add_task(Box::new(|| Box::pin(async {})));
        }
        assert_eq!(pool.queued_task_count(), 5);
    }
}
