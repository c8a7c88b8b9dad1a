//! Shared worker pool that runs handler invocations
//!
//! One long-lived `tokio::task` per unit of concurrent work; here the unit
//! is "drain a shared job queue" rather than "own one connection", since
//! handler dispatch must not block any single `SubConnection`'s reader task.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};

use crate::handler::BoxFuture;

const QUEUE_CAPACITY: usize = 1024;

/// A fixed-size pool of tasks draining a shared queue of handler jobs
#[derive(Debug)]
pub(crate) struct WorkerPool {
    jobs: mpsc::Sender<BoxFuture<'static, ()>>,
}

impl WorkerPool {
    pub(crate) fn new(size: usize) -> Self {
        Self::with_capacity(size, QUEUE_CAPACITY)
    }

    fn with_capacity(size: usize, capacity: usize) -> Self {
        let (jobs, rx) = mpsc::channel(capacity);
        let rx = Arc::new(Mutex::new(rx));
        for _ in 0..size.max(1) {
            let rx = Arc::clone(&rx);
            tokio::spawn(async move {
                loop {
                    let job = { rx.lock().await.recv().await };
                    match job {
                        Some(job) => job.await,
                        None => break,
                    }
                }
            });
        }
        Self { jobs }
    }

    /// Enqueue a handler job without blocking the caller
    ///
    /// Used by the subscription control loop, which must not stall behind a
    /// full worker queue. Returns `false` without running the job if the
    /// queue is full or closed; the caller must not count a rejected job as
    /// dispatched.
    #[must_use]
    pub(crate) fn try_spawn(&self, job: BoxFuture<'static, ()>) -> bool {
        self.jobs.try_send(job).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::WorkerPool;

    #[tokio::test]
    async fn jobs_run_on_pool_workers() {
        let pool = WorkerPool::new(2);
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let count = Arc::clone(&count);
            assert!(pool.try_spawn(Box::pin(async move {
                count.fetch_add(1, Ordering::SeqCst);
            })));
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(10, count.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn try_spawn_returns_false_once_the_queue_is_full() {
        let pool = WorkerPool::with_capacity(1, 2);
        let (release_tx, release_rx) = tokio::sync::watch::channel(false);

        // occupy the sole worker with a job that blocks until released
        let mut release_rx_for_worker = release_rx.clone();
        assert!(pool.try_spawn(Box::pin(async move {
            let _ = release_rx_for_worker.changed().await;
        })));
        // let the worker task actually receive and start the blocking job,
        // freeing its slot in the channel buffer, before filling the queue
        tokio::task::yield_now().await;

        // fill the queue behind the blocked worker
        assert!(pool.try_spawn(Box::pin(async {})));
        assert!(pool.try_spawn(Box::pin(async {})));

        // queue and in-flight permit are exhausted
        assert!(!pool.try_spawn(Box::pin(async {})));

        let _ = release_tx.send(true);
    }
}
