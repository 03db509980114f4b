//! Bounded worker pool for message consumption.
//!
//! Jobs are pushed onto a lock-free [`crossbeam::queue::SegQueue`] and drained
//! by a fixed number of worker tasks spawned on the tokio runtime.  Idle
//! workers park on a [`Notify`] and are woken one per submitted job.
//!
//! The pool is fire-and-forget: `submit` returns as soon as the job is
//! queued, jobs carry no result, and there is no ordering guarantee between
//! jobs once more than one worker is running.
//!
//! A job that panics is caught and logged; the worker keeps running.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use crossbeam::queue::SegQueue;
use futures::FutureExt;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::error::{BrokerError, Result};

/// A unit of work executed by the pool.
pub type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Fixed-size pool of tokio worker tasks.
///
/// Cheaply cloneable (`Arc`-backed).
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    queue: SegQueue<Job>,
    notify: Notify,
    shutdown: AtomicBool,
    /// Held shared by `submit` and exclusively by `shutdown`, so no push can
    /// land after workers have seen the shutdown flag.
    intake: RwLock<()>,
    busy: AtomicUsize,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Spawn `workers` worker tasks on `runtime`.
    pub fn start(workers: usize, runtime: &Handle) -> Self {
        let inner = Arc::new(PoolInner {
            queue: SegQueue::new(),
            notify: Notify::new(),
            shutdown: AtomicBool::new(false),
            intake: RwLock::new(()),
            busy: AtomicUsize::new(0),
            workers: Mutex::new(Vec::with_capacity(workers)),
        });

        let handles: Vec<JoinHandle<()>> = (0..workers)
            .map(|worker| {
                let inner = Arc::clone(&inner);
                runtime.spawn(async move {
                    tracing::debug!(worker, "pool worker started");
                    Self::worker_loop(&inner).await;
                    tracing::debug!(worker, "pool worker stopped");
                })
            })
            .collect();
        *inner.workers.lock().unwrap_or_else(PoisonError::into_inner) = handles;

        tracing::info!(workers, "worker pool started");
        Self { inner }
    }

    /// Queue a job for execution on some worker.
    pub fn submit<F>(&self, job: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let _intake = self
            .inner
            .intake
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        if self.inner.shutdown.load(Ordering::Acquire) {
            return Err(BrokerError::PoolShutdown);
        }
        self.inner.queue.push(Box::pin(job));
        self.inner.notify.notify_one();
        Ok(())
    }

    /// Number of jobs waiting for a worker.
    pub fn queued(&self) -> usize {
        self.inner.queue.len()
    }

    /// Number of jobs currently executing.
    pub fn busy(&self) -> usize {
        self.inner.busy.load(Ordering::Acquire)
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.load(Ordering::Acquire)
    }

    /// Stop accepting jobs.  Workers finish everything already queued and
    /// then exit.
    pub fn shutdown(&self) {
        {
            let _intake = self
                .inner
                .intake
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            if self.inner.shutdown.swap(true, Ordering::AcqRel) {
                return;
            }
        }
        tracing::info!(queued = self.queued(), "worker pool shutdown requested");
        self.inner.notify.notify_waiters();
    }

    /// Wait for every worker to exit.  Only returns after [`shutdown`].
    ///
    /// [`shutdown`]: WorkerPool::shutdown
    pub async fn join(&self) {
        let handles: Vec<JoinHandle<()>> = std::mem::take(
            &mut *self
                .inner
                .workers
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for handle in handles {
            if let Err(err) = handle.await {
                tracing::error!(error = %err, "pool worker terminated abnormally");
            }
        }
    }

    async fn worker_loop(inner: &PoolInner) {
        loop {
            // Register interest before checking the queue so a submit that
            // lands in between still wakes this worker.
            let notified = inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match inner.queue.pop() {
                Some(job) => {
                    inner.busy.fetch_add(1, Ordering::AcqRel);
                    if AssertUnwindSafe(job).catch_unwind().await.is_err() {
                        tracing::error!("pool job panicked");
                    }
                    inner.busy.fetch_sub(1, Ordering::AcqRel);
                }
                None => {
                    // Once the flag is visible every accepted job has been
                    // pushed, so an empty queue really is drained.
                    if inner.shutdown.load(Ordering::Acquire) {
                        if inner.queue.is_empty() {
                            break;
                        }
                        continue;
                    }
                    notified.await;
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn executes_submitted_jobs() {
        let pool = WorkerPool::start(2, &Handle::current());
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..10 {
            let c = Arc::clone(&counter);
            pool.submit(async move {
                c.fetch_add(1, Ordering::SeqCst);
            })
            .expect("submit should succeed");
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 10);

        pool.shutdown();
        pool.join().await;
    }

    #[tokio::test]
    async fn shutdown_rejects_new_jobs() {
        let pool = WorkerPool::start(1, &Handle::current());
        pool.shutdown();
        assert!(pool.is_shutdown());

        let result = pool.submit(async {});
        assert!(matches!(result, Err(BrokerError::PoolShutdown)));
        pool.join().await;
    }

    #[tokio::test]
    async fn shutdown_drains_queued_jobs() {
        let pool = WorkerPool::start(1, &Handle::current());
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            let c = Arc::clone(&counter);
            pool.submit(async move {
                tokio::task::yield_now().await;
                c.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }

        pool.shutdown();
        pool.join().await;
        assert_eq!(counter.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn panicking_job_does_not_kill_worker() {
        let pool = WorkerPool::start(1, &Handle::current());
        let counter = Arc::new(AtomicUsize::new(0));

        let explode = true;
        pool.submit(async move {
            if explode {
                panic!("component blew up");
            }
        })
        .unwrap();
        let c = Arc::clone(&counter);
        pool.submit(async move {
            c.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(pool.busy(), 0);

        pool.shutdown();
        pool.join().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn every_job_is_either_run_or_refused_across_shutdown() {
        const PER_THREAD: usize = 2000;
        const THREADS: usize = 4;

        let pool = WorkerPool::start(4, &Handle::current());
        let ran = Arc::new(AtomicUsize::new(0));
        let refused = Arc::new(AtomicUsize::new(0));

        let submitters: Vec<_> = (0..THREADS)
            .map(|_| {
                let (pool, ran, refused) = (pool.clone(), Arc::clone(&ran), Arc::clone(&refused));
                std::thread::spawn(move || {
                    for _ in 0..PER_THREAD {
                        let ran = Arc::clone(&ran);
                        let job = async move {
                            ran.fetch_add(1, Ordering::SeqCst);
                        };
                        if pool.submit(job).is_err() {
                            refused.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                })
            })
            .collect();

        while ran.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        pool.shutdown();
        for submitter in submitters {
            submitter.join().unwrap();
        }
        pool.join().await;

        assert_eq!(
            ran.load(Ordering::SeqCst) + refused.load(Ordering::SeqCst),
            PER_THREAD * THREADS
        );
        assert_eq!(pool.queued(), 0);
    }
}
