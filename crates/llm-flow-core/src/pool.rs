// Copyright (c) 2025 LLM Flow Contributors
// SPDX-License-Identifier: Apache-2.0

//! Worker Pool: bounded-concurrency task execution for parallel-mode runs.
//!
//! Readiness and dispatch order are entirely the orchestrator's concern
//! (`dag.rs` computes what's ready); the pool only enforces the
//! concurrency cap via a `Semaphore`, reports completions back over an
//! `mpsc` channel as they happen so the orchestrator's event loop can react
//! immediately, and applies the pool-wide error policy through a shared
//! `CancellationToken`.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::error::OrchestratorError;
use crate::workflow::WorkerErrorPolicy;

/// Outcome of one pool task, tagged with the name it was submitted under
/// (a step or loop name).
#[derive(Debug)]
pub struct TaskOutcome<T> {
    pub name: String,
    pub output: std::result::Result<T, OrchestratorError>,
}

pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
    on_error: WorkerErrorPolicy,
    cancellation: CancellationToken,
}

impl WorkerPool {
    pub fn new(max_workers: usize, on_error: WorkerErrorPolicy) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_workers.max(1))),
            on_error,
            cancellation: CancellationToken::new(),
        }
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Manually requests cancellation, used when a halting step failure
    /// outside the pool (e.g. sequential-mode) needs to stop in-flight
    /// parallel work too.
    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    /// Spawns `fut` once a permit is available and reports its outcome on
    /// `tx`. The permit is acquired inside the spawned task, so `submit`
    /// itself never blocks the caller — the orchestrator can submit every
    /// ready step in one pass and let the semaphore throttle them.
    ///
    /// On a `CancelAll` policy, any task failure cancels the shared token;
    /// tasks still queued behind the semaphore observe the cancellation
    /// before starting and report [`OrchestratorError::Cancellation`]
    /// instead of running. `CompleteRunning` and `Continue` never cancel
    /// from here — the orchestrator decides whether to keep dispatching.
    pub fn submit<T, Fut>(&self, name: impl Into<String>, fut: Fut, tx: mpsc::UnboundedSender<TaskOutcome<T>>)
    where
        T: Send + 'static,
        Fut: Future<Output = std::result::Result<T, OrchestratorError>> + Send + 'static,
    {
        let name = name.into();
        let semaphore = self.semaphore.clone();
        let cancellation = self.cancellation.clone();
        let on_error = self.on_error;

        tokio::spawn(async move {
            let _permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };

            if cancellation.is_cancelled() {
                let _ = tx.send(TaskOutcome {
                    name,
                    output: Err(OrchestratorError::Cancellation),
                });
                return;
            }

            let output = tokio::select! {
                biased;
                _ = cancellation.cancelled() => Err(OrchestratorError::Cancellation),
                result = fut => result,
            };

            if output.is_err() && matches!(on_error, WorkerErrorPolicy::CancelAll) {
                cancellation.cancel();
            }

            let _ = tx.send(TaskOutcome { name, output });
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn runs_all_submitted_tasks_to_completion() {
        let pool = WorkerPool::new(2, WorkerErrorPolicy::Continue);
        let (tx, mut rx) = mpsc::unbounded_channel();

        for i in 0..4 {
            pool.submit(
                format!("step-{i}"),
                async move { Ok::<_, OrchestratorError>(i) },
                tx.clone(),
            );
        }
        drop(tx);

        let mut seen = Vec::new();
        while let Some(outcome) = rx.recv().await {
            seen.push(outcome.output.unwrap());
        }
        seen.sort();
        assert_eq!(seen, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn concurrency_cap_is_respected() {
        let pool = WorkerPool::new(1, WorkerErrorPolicy::Continue);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let concurrent = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        for i in 0..5 {
            let concurrent = concurrent.clone();
            let max_seen = max_seen.clone();
            pool.submit(
                format!("step-{i}"),
                async move {
                    let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    concurrent.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, OrchestratorError>(())
                },
                tx.clone(),
            );
        }
        drop(tx);

        while rx.recv().await.is_some() {}
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancel_all_policy_cancels_queued_tasks_on_failure() {
        let pool = WorkerPool::new(1, WorkerErrorPolicy::CancelAll);
        let (tx, mut rx) = mpsc::unbounded_channel();

        pool.submit(
            "fails",
            async move { Err::<(), _>(OrchestratorError::other("boom")) },
            tx.clone(),
        );
        let first = rx.recv().await.unwrap();
        assert!(first.output.is_err());

        pool.submit(
            "queued-after-failure",
            async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok::<_, OrchestratorError>(())
            },
            tx.clone(),
        );
        drop(tx);

        let second = rx.recv().await.unwrap();
        assert!(matches!(second.output, Err(OrchestratorError::Cancellation)));
        assert!(pool.is_cancelled());
    }

    #[tokio::test]
    async fn continue_policy_does_not_cancel_on_failure() {
        let pool = WorkerPool::new(2, WorkerErrorPolicy::Continue);
        let (tx, mut rx) = mpsc::unbounded_channel();

        pool.submit(
            "fails",
            async move { Err::<(), _>(OrchestratorError::other("boom")) },
            tx.clone(),
        );
        pool.submit(
            "succeeds",
            async move { Ok::<_, OrchestratorError>(()) },
            tx.clone(),
        );
        drop(tx);

        let mut results = Vec::new();
        while let Some(outcome) = rx.recv().await {
            results.push(outcome.output.is_ok());
        }
        results.sort();
        assert_eq!(results, vec![false, true]);
        assert!(!pool.is_cancelled());
    }
}
