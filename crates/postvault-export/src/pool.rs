//! Bounded worker pool: a shared queue drained by a fixed number of tasks.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{ExportError, ExportResult};

/// Result of one task, tagged with its submission index.
#[derive(Debug)]
pub struct TaskOutcome<R> {
    /// Position of the task in the submitted list.
    pub index: usize,
    /// What the task returned.
    pub result: ExportResult<R>,
}

/// Fixed-size pool of async workers.
#[derive(Debug, Clone, Copy)]
pub struct WorkerPool {
    workers: usize,
}

impl WorkerPool {
    /// Creates a pool with `workers` concurrent tasks (at least one).
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
        }
    }

    /// Number of workers.
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Runs `f` over every task with bounded concurrency.
    ///
    /// Outcomes come back ordered by submission index. Workers stop picking up
    /// new tasks once `cancel` fires, and the whole run then reports `Cancelled`.
    pub async fn run<T, R, F, Fut>(
        &self,
        tasks: Vec<T>,
        cancel: &CancellationToken,
        f: F,
    ) -> ExportResult<Vec<TaskOutcome<R>>>
    where
        T: Send + 'static,
        R: Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ExportResult<R>> + Send + 'static,
    {
        let total = tasks.len();
        if total == 0 {
            return Ok(Vec::new());
        }

        let queue: Arc<Mutex<VecDeque<(usize, T)>>> =
            Arc::new(Mutex::new(tasks.into_iter().enumerate().collect()));
        let f = Arc::new(f);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut set = JoinSet::new();

        for worker in 0..self.workers.min(total) {
            let queue = Arc::clone(&queue);
            let f = Arc::clone(&f);
            let tx = tx.clone();
            let cancel = cancel.clone();
            set.spawn(async move {
                loop {
                    if cancel.is_cancelled() {
                        break;
                    }
                    let next = queue.lock().unwrap_or_else(|p| p.into_inner()).pop_front();
                    let Some((index, task)) = next else {
                        break;
                    };
                    let result = f(task).await;
                    if tx.send(TaskOutcome { index, result }).is_err() {
                        break;
                    }
                }
                debug!(worker, "worker drained");
            });
        }
        drop(tx);

        let mut panicked = None;
        while let Some(joined) = set.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "worker task aborted");
                panicked = Some(e.to_string());
            }
        }

        let mut outcomes = Vec::with_capacity(total);
        while let Some(outcome) = rx.recv().await {
            outcomes.push(outcome);
        }
        outcomes.sort_by_key(|o| o.index);

        if cancel.is_cancelled() {
            return Err(ExportError::Cancelled);
        }
        if let Some(reason) = panicked {
            return Err(ExportError::Io(std::io::Error::other(format!(
                "worker task failed: {}",
                reason
            ))));
        }
        Ok(outcomes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_all_tasks_run_in_order() {
        let pool = WorkerPool::new(3);
        let cancel = CancellationToken::new();
        let outcomes = pool
            .run((0..20u64).collect(), &cancel, |n| async move { Ok(n * 2) })
            .await
            .unwrap();
        assert_eq!(outcomes.len(), 20);
        for (i, o) in outcomes.iter().enumerate() {
            assert_eq!(o.index, i);
            assert_eq!(*o.result.as_ref().unwrap(), i as u64 * 2);
        }
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let pool = WorkerPool::new(2);
        let cancel = CancellationToken::new();
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (a, p) = (Arc::clone(&active), Arc::clone(&peak));
        pool.run((0..10).collect::<Vec<u32>>(), &cancel, move |_| {
            let (a, p) = (Arc::clone(&a), Arc::clone(&p));
            async move {
                let now = a.fetch_add(1, Ordering::SeqCst) + 1;
                p.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                a.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await
        .unwrap();
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert!(peak.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn test_failures_are_per_task() {
        let pool = WorkerPool::new(4);
        let cancel = CancellationToken::new();
        let outcomes = pool
            .run((0..6u32).collect(), &cancel, |n| async move {
                if n % 3 == 0 {
                    Err(ExportError::InvalidOptions(format!("bad {}", n)))
                } else {
                    Ok(n)
                }
            })
            .await
            .unwrap();
        assert_eq!(outcomes.iter().filter(|o| o.result.is_err()).count(), 2);
        assert_eq!(outcomes.len(), 6);
    }

    #[tokio::test]
    async fn test_cancellation_stops_pickup() {
        let pool = WorkerPool::new(1);
        let cancel = CancellationToken::new();
        let ran = Arc::new(AtomicUsize::new(0));
        let (r, c) = (Arc::clone(&ran), cancel.clone());
        let result = pool
            .run((0..100u32).collect(), &cancel, move |n| {
                let (r, c) = (Arc::clone(&r), c.clone());
                async move {
                    r.fetch_add(1, Ordering::SeqCst);
                    if n == 4 {
                        c.cancel();
                    }
                    Ok(())
                }
            })
            .await;
        assert!(matches!(result, Err(ExportError::Cancelled)));
        assert_eq!(ran.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_empty_input() {
        let pool = WorkerPool::new(4);
        let out = pool
            .run(Vec::<u8>::new(), &CancellationToken::new(), |_| async { Ok(()) })
            .await
            .unwrap();
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn test_zero_workers_clamped() {
        assert_eq!(WorkerPool::new(0).workers(), 1);
    }
}
