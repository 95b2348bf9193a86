//! Bounded task scheduler.
//!
//! A [`WorkerPool`] caps how many submitted tasks run at once. Tasks go into
//! a [`TaskBatch`]; [`TaskBatch::join`] waits for every one of them and
//! returns a [`BatchResult`]. A failing or panicking task never cancels its
//! siblings, and nothing is retried here.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::error::{Result, ShipyardError, TaskFailure};
use crate::obs;

/// Worker count used when a pool is sized 0.
pub fn default_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// A named concurrency limit shared by every batch created from it.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    name: String,
    size: usize,
    semaphore: Arc<Semaphore>,
}

impl WorkerPool {
    /// `parallelism == 0` sizes the pool to the available CPUs.
    pub fn new(name: impl Into<String>, parallelism: usize) -> Self {
        let size = if parallelism == 0 {
            default_parallelism()
        } else {
            parallelism
        };
        Self {
            name: name.into(),
            size,
            semaphore: Arc::new(Semaphore::new(size)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Empty batch drawing permits from this pool.
    pub fn batch<T: Send + 'static>(&self) -> TaskBatch<T> {
        TaskBatch {
            pool: self.name.clone(),
            semaphore: Arc::clone(&self.semaphore),
            set: JoinSet::new(),
            labels: Vec::new(),
        }
    }

    /// Submit every `(label, task)` and wait for all of them.
    pub async fn run<T, Fut, I>(&self, tasks: I) -> BatchResult<T>
    where
        T: Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        I: IntoIterator<Item = (String, Fut)>,
    {
        let mut batch = self.batch();
        for (label, task) in tasks {
            batch.submit(label, task);
        }
        batch.join().await
    }
}

/// Tasks submitted to a pool, awaiting a single drain.
pub struct TaskBatch<T> {
    pool: String,
    semaphore: Arc<Semaphore>,
    set: JoinSet<(usize, Result<T>)>,
    labels: Vec<String>,
}

impl<T: Send + 'static> TaskBatch<T> {
    /// Start `task` as soon as a pool permit is free.
    pub fn submit<Fut>(&mut self, label: impl Into<String>, task: Fut)
    where
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let idx = self.labels.len();
        let label = label.into();
        self.labels.push(label.clone());
        let semaphore = Arc::clone(&self.semaphore);

        self.set.spawn(async move {
            let _permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => return (idx, Err(ShipyardError::TaskJoin(e.to_string()))),
            };
            let outcome = match AssertUnwindSafe(task).catch_unwind().await {
                Ok(result) => result,
                Err(panic) => Err(ShipyardError::TaskJoin(format!(
                    "task '{label}' panicked: {}",
                    panic_message(panic.as_ref())
                ))),
            };
            (idx, outcome)
        });
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Wait for every submitted task, then report outcomes in submission order.
    pub async fn join(mut self) -> BatchResult<T> {
        let total = self.labels.len();
        let mut slots: Vec<Option<Result<T>>> = (0..total).map(|_| None).collect();

        while let Some(joined) = self.set.join_next().await {
            match joined {
                Ok((idx, outcome)) => slots[idx] = Some(outcome),
                Err(e) => tracing::error!(pool = %self.pool, error = %e, "task join error"),
            }
        }

        let mut successes = Vec::new();
        let mut failures = Vec::new();
        for (label, slot) in self.labels.into_iter().zip(slots) {
            match slot {
                Some(Ok(value)) => successes.push(value),
                Some(Err(e)) => {
                    tracing::error!(pool = %self.pool, task = %label, error = %e, "task failed");
                    failures.push(TaskFailure::new(label, &e));
                }
                None => failures.push(TaskFailure::new(
                    label,
                    &ShipyardError::TaskJoin("task did not report an outcome".to_string()),
                )),
            }
        }

        obs::emit_batch_drained(&self.pool, total, failures.len());
        BatchResult {
            successes,
            failures,
            total,
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Outcome of a fully drained batch.
#[derive(Debug)]
pub struct BatchResult<T> {
    /// Successful values, in submission order.
    pub successes: Vec<T>,
    /// Failed tasks, in submission order.
    pub failures: Vec<TaskFailure>,
    /// Number of tasks submitted.
    pub total: usize,
}

impl<T> BatchResult<T> {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    /// `Ok(successes)`, or `AggregateBuildFailure` if anything failed.
    pub fn into_result(self) -> Result<Vec<T>> {
        match ShipyardError::aggregate(self.total, self.failures) {
            Some(err) => Err(err),
            None => Ok(self.successes),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn fail(tag: &str) -> ShipyardError {
        ShipyardError::Build {
            tag: tag.to_string(),
            stderr: "exit 1".to_string(),
        }
    }

    #[test]
    fn zero_parallelism_uses_available_cpus() {
        assert_eq!(WorkerPool::new("build", 0).size(), default_parallelism());
        assert_eq!(WorkerPool::new("build", 3).size(), 3);
    }

    #[tokio::test]
    async fn all_tasks_attempted_when_some_fail() {
        let attempted = Arc::new(AtomicUsize::new(0));
        let pool = WorkerPool::new("build", 2);
        let tasks = (0..7).map(|i| {
            let attempted = Arc::clone(&attempted);
            (format!("task-{i}"), async move {
                attempted.fetch_add(1, Ordering::SeqCst);
                if i % 3 == 0 {
                    Err(fail(&format!("img:{i}")))
                } else {
                    Ok(i)
                }
            })
        });

        let result = pool.run(tasks).await;
        assert_eq!(attempted.load(Ordering::SeqCst), 7);
        assert_eq!(result.total, 7);
        assert_eq!(result.successes, vec![1, 2, 4, 5]);
        let labels: Vec<_> = result.failures.iter().map(|f| f.label.as_str()).collect();
        assert_eq!(labels, vec!["task-0", "task-3", "task-6"]);

        match result.into_result() {
            Err(ShipyardError::AggregateBuildFailure {
                failed, total, kinds, ..
            }) => {
                assert_eq!(failed, 3);
                assert_eq!(total, 7);
                assert!(kinds.contains("BuildError"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn no_failures_is_ok() {
        let pool = WorkerPool::new("io", 4);
        let result = pool
            .run((0..5).map(|i| (format!("t{i}"), async move { Ok::<_, ShipyardError>(i * 10) })))
            .await;
        assert_eq!(result.into_result().unwrap(), vec![0, 10, 20, 30, 40]);
    }

    #[tokio::test(start_paused = true)]
    async fn results_keep_submission_order() {
        let pool = WorkerPool::new("build", 4);
        let tasks = [30u64, 10, 20].into_iter().map(|ms| {
            (format!("sleep-{ms}"), async move {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(ms)
            })
        });
        assert_eq!(pool.run(tasks).await.successes, vec![30, 10, 20]);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrency_never_exceeds_pool_size() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let pool = WorkerPool::new("build", 2);
        let mut batch = pool.batch();
        for i in 0..6 {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            batch.submit(format!("t{i}"), async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            });
        }
        assert_eq!(batch.len(), 6);
        let result = batch.join().await;
        assert!(result.is_success());
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn panicking_task_is_recorded_not_propagated() {
        let pool = WorkerPool::new("build", 2);
        let mut batch = pool.batch::<u8>();
        batch.submit("ok", async { Ok(1) });
        batch.submit("boom", async {
            let exploded = true;
            if exploded {
                panic!("registry exploded");
            }
            Ok(0)
        });
        batch.submit("ok-2", async { Ok(2) });

        let result = batch.join().await;
        assert_eq!(result.successes, vec![1, 2]);
        assert_eq!(result.failures.len(), 1);
        assert_eq!(result.failures[0].kind, "TaskJoinError");
        assert!(result.failures[0].message.contains("registry exploded"));
    }

    #[tokio::test]
    async fn pools_share_permits_across_batches() {
        let pool = WorkerPool::new("io", 1);
        let clone = pool.clone();
        let a = pool.batch::<()>();
        let b = clone.batch::<()>();
        assert!(a.is_empty() && b.is_empty());
        assert_eq!(clone.name(), "io");
    }
}
