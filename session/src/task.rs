//! Optional executors for message dispatch.
//!
//! By default a session invokes `on_message` inline on its receive loop,
//! which preserves wire order but couples listener latency to the socket.
//! Installing a [`TaskPool`] moves dispatch onto workers; ordering across
//! messages is then no longer guaranteed.

use futures::future::BoxFuture;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error};

/// A unit of work handed to a task pool.
pub type Task = BoxFuture<'static, ()>;

/// An executor a session can offload message dispatch to.
pub trait TaskPool: Send + Sync {
    /// Queue a unit of work. Implementations choose ordering and
    /// parallelism; the engine never waits for completion.
    fn submit(&self, task: Task);
}

/// A fixed-size pool of tokio workers draining a shared queue.
pub struct WorkerPool {
    tx: mpsc::UnboundedSender<Task>,
}

impl WorkerPool {
    /// Spawn `workers` worker tasks on the current tokio runtime.
    ///
    /// Workers exit once the last handle to the pool is dropped and the
    /// queue has drained.
    ///
    /// # Panics
    ///
    /// Panics if `workers` is zero.
    pub fn new(workers: usize) -> Arc<Self> {
        assert!(workers >= 1, "worker pool needs at least one worker");

        let (tx, rx) = mpsc::unbounded_channel::<Task>();
        let rx = Arc::new(Mutex::new(rx));
        for id in 0..workers {
            let rx = Arc::clone(&rx);
            tokio::spawn(async move {
                loop {
                    let task = { rx.lock().await.recv().await };
                    match task {
                        Some(task) => {
                            // A panicking task must not take the worker down.
                            if let Err(panic) = AssertUnwindSafe(task).catch_unwind().await {
                                error!(
                                    "task pool worker {id} caught panic: {}",
                                    crate::panic_message(&panic)
                                );
                            }
                        }
                        None => break,
                    }
                }
                debug!("task pool worker {id} exiting");
            });
        }

        Arc::new(Self { tx })
    }
}

impl TaskPool for WorkerPool {
    fn submit(&self, task: Task) {
        if self.tx.send(task).is_err() {
            debug!("task submitted to a dropped pool");
        }
    }
}
