//! Cancellable task pool
//!
//! Each job owns one of these for its per-file subtasks, and the job manager
//! owns one for job drivers. Tasks are plain tokio tasks; the pool only keeps
//! enough bookkeeping to refuse work after shutdown, wait for in-flight work
//! with a deadline, and abort whatever is left.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::{AbortHandle, JoinHandle};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    #[error("worker pool {0} is shut down")]
    ShutDown(String),
}

#[derive(Default)]
struct Activity {
    active: AtomicUsize,
    idle: Notify,
}

/// Decrements the active count when the task finishes or is aborted.
struct ActiveGuard(Arc<Activity>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        if self.0.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

pub struct WorkerPool {
    name: String,
    handles: Mutex<Vec<AbortHandle>>,
    shut_down: AtomicBool,
    activity: Arc<Activity>,
}

impl WorkerPool {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            handles: Mutex::new(Vec::new()),
            shut_down: AtomicBool::new(false),
            activity: Arc::new(Activity::default()),
        }
    }

    pub fn submit<F>(&self, task: F) -> Result<JoinHandle<F::Output>, PoolError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        // Holding the handle list keeps submit and shutdown_now from interleaving
        let mut handles = self.handles();
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(PoolError::ShutDown(self.name.clone()));
        }

        self.activity.active.fetch_add(1, Ordering::SeqCst);
        let guard = ActiveGuard(self.activity.clone());
        let handle = tokio::spawn(async move {
            let _guard = guard;
            task.await
        });

        handles.retain(|h| !h.is_finished());
        handles.push(handle.abort_handle());
        Ok(handle)
    }

    pub fn active_tasks(&self) -> usize {
        self.activity.active.load(Ordering::SeqCst)
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Stop accepting work and wait up to `grace` for running tasks. Anything
    /// still running afterwards is aborted. Returns `true` if the pool drained
    /// on its own.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.shut_down.store(true, Ordering::SeqCst);

        if tokio::time::timeout(grace, self.wait_idle()).await.is_ok() {
            tracing::debug!("Worker pool {} drained", self.name);
            return true;
        }

        let aborted = self.shutdown_now();
        tracing::warn!(
            "Worker pool {} did not drain within {:?}, aborted {} task(s)",
            self.name,
            grace,
            aborted
        );
        false
    }

    /// Stop accepting work and abort every outstanding task. Safe to call
    /// repeatedly.
    pub fn shutdown_now(&self) -> usize {
        let mut handles = self.handles();
        self.shut_down.store(true, Ordering::SeqCst);

        let mut aborted = 0;
        for handle in handles.drain(..) {
            if !handle.is_finished() {
                handle.abort();
                aborted += 1;
            }
        }
        aborted
    }

    async fn wait_idle(&self) {
        loop {
            let notified = self.activity.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.activity.active.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    fn handles(&self) -> MutexGuard<'_, Vec<AbortHandle>> {
        self.handles.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_submit_and_join() {
        let pool = WorkerPool::new("test");
        let handle = pool.submit(async { 21 * 2 }).unwrap();
        assert_eq!(handle.await.unwrap(), 42);
        assert!(pool.shutdown(Duration::from_millis(100)).await);
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_is_refused() {
        let pool = WorkerPool::new("closed");
        pool.shutdown_now();
        assert_eq!(
            pool.submit(async {}).unwrap_err(),
            PoolError::ShutDown("closed".to_string())
        );
    }

    #[tokio::test]
    async fn test_shutdown_now_aborts_running_tasks() {
        let pool = WorkerPool::new("abort");
        let handle = pool
            .submit(async { tokio::time::sleep(Duration::from_secs(60)).await })
            .unwrap();

        assert_eq!(pool.shutdown_now(), 1);
        assert!(handle.await.unwrap_err().is_cancelled());
        assert_eq!(pool.active_tasks(), 0);
        assert_eq!(pool.shutdown_now(), 0);
    }

    #[tokio::test]
    async fn test_graceful_shutdown_times_out() {
        let pool = WorkerPool::new("slow");
        let handle = pool
            .submit(async { tokio::time::sleep(Duration::from_secs(60)).await })
            .unwrap();

        assert!(!pool.shutdown(Duration::from_millis(20)).await);
        assert!(handle.await.unwrap_err().is_cancelled());
    }
}
