//! Bounded-concurrency admission queue with retry, cooperative cancellation,
//! and graceful shutdown drain (spec §4.2).
//!
//! `outstanding` (running + queued) is the admission bound; the concurrency
//! semaphore is the execution bound. They are deliberately separate:
//! `max_queue_size` can exceed `concurrency` by any amount, letting
//! submissions queue once every executor slot is busy.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::core::errors::{CoreError, CoreResult};
use crate::core::retry::RetryPolicy;
use crate::core::types::RunOptions;
use crate::core::types::RunResult;

/// Abstraction over `Runner::run`, so the pool's admission/retry/shutdown
/// logic can be unit-tested without spawning real child processes.
#[async_trait]
pub trait Execute: Send + Sync {
    async fn run(&self, opts: RunOptions) -> CoreResult<RunResult>;
}

#[async_trait]
impl Execute for crate::core::runner::Runner {
    async fn run(&self, opts: RunOptions) -> CoreResult<RunResult> {
        crate::core::runner::Runner::run(self, opts).await
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct PoolStats {
    pub outstanding: usize,
    pub running: usize,
    pub concurrency: usize,
    pub max_queue_size: usize,
    pub paused: bool,
}

pub struct WorkerPool {
    executor: Arc<dyn Execute>,
    semaphore: Arc<Semaphore>,
    concurrency: usize,
    max_queue_size: usize,
    request_timeout: Duration,
    queue_timeout: Duration,
    outstanding: Arc<AtomicUsize>,
    shutdown: CancellationToken,
}

struct OutstandingGuard(Arc<AtomicUsize>);

impl Drop for OutstandingGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl WorkerPool {
    pub fn new(
        executor: Arc<dyn Execute>,
        concurrency: usize,
        max_queue_size: usize,
        request_timeout: Duration,
        queue_timeout: Duration,
    ) -> Self {
        Self {
            executor,
            semaphore: Arc::new(Semaphore::new(concurrency)),
            concurrency,
            max_queue_size,
            request_timeout,
            queue_timeout,
            outstanding: Arc::new(AtomicUsize::new(0)),
            shutdown: CancellationToken::new(),
        }
    }

    /// `opts.cancel` is the caller-supplied cancellation handle (e.g. a
    /// dropped HTTP connection, or a task's own cancel handle). It is
    /// linked with the pool's shutdown signal so either one tears the
    /// submission down the same way.
    pub async fn submit(&self, mut opts: RunOptions, req_id: &str) -> CoreResult<RunResult> {
        if self.shutdown.is_cancelled() {
            return Err(CoreError::cli_error("aborted: shutdown"));
        }

        let outstanding_now = self.outstanding.fetch_add(1, Ordering::SeqCst) + 1;
        if outstanding_now > self.max_queue_size {
            self.outstanding.fetch_sub(1, Ordering::SeqCst);
            return Err(CoreError::queue_full(format!(
                "pool saturated at {}/{}",
                outstanding_now - 1,
                self.max_queue_size
            )));
        }
        let _guard = OutstandingGuard(self.outstanding.clone());

        let run_cancel = self.shutdown.child_token();
        link_cancellation(opts.cancel.clone(), run_cancel.clone());
        opts.cancel = run_cancel.clone();

        let enqueued_at = Instant::now();
        let stream = opts.stream;
        let req_id = req_id.to_string();

        info!(req_id, stream, "submission admitted");

        let body = || {
            let opts = opts.clone();
            let run_cancel = run_cancel.clone();
            self.execute_once(opts, enqueued_at, run_cancel)
        };

        if stream {
            body().await
        } else {
            RetryPolicy::run(&run_cancel, body).await
        }
    }

    /// Acquire a concurrency slot, re-check queue wait time once this
    /// submission actually becomes the executor, then run it under a
    /// combined `requestTimeout + queueTimeout` ceiling.
    async fn execute_once(
        &self,
        mut opts: RunOptions,
        enqueued_at: Instant,
        cancel: CancellationToken,
    ) -> CoreResult<RunResult> {
        let permit = tokio::select! {
            p = self.semaphore.clone().acquire_owned() => match p {
                Ok(p) => p,
                Err(_) => return Err(CoreError::internal("worker pool semaphore closed")),
            },
            _ = cancel.cancelled() => {
                return Err(CoreError::aborted("cancelled while queued"));
            }
        };

        let waited = enqueued_at.elapsed();
        if waited > self.queue_timeout {
            drop(permit);
            return Err(CoreError::queue_timeout(format!(
                "waited {waited:?} in queue, exceeding {:?}",
                self.queue_timeout
            )));
        }

        let combined_ceiling = self.queue_timeout + self.request_timeout;
        let remaining_ceiling = combined_ceiling.saturating_sub(waited);

        let ceiling_fired = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let ceiling_flag = ceiling_fired.clone();
        let ceiling_cancel = cancel.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(remaining_ceiling).await;
            ceiling_flag.store(true, Ordering::SeqCst);
            ceiling_cancel.cancel();
        });

        opts.timeout = self.request_timeout;
        opts.cancel = cancel;
        let result = self.executor.run(opts).await;
        timer.abort();
        drop(permit);

        match result {
            Err(e) if ceiling_fired.load(Ordering::SeqCst) => Err(CoreError::timeout(format!(
                "combined queue+request ceiling of {combined_ceiling:?} exceeded: {e}"
            ))),
            other => other,
        }
    }

    /// Idempotent, monotone. Refuses new submissions, cancels queued and
    /// in-flight work (process shutdown is a cancellation producer per
    /// spec §5), and waits for everything to actually drain — including
    /// the SIGTERM→SIGKILL teardown any in-flight child undergoes — before
    /// returning.
    pub async fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        warn!("worker pool shutting down, draining outstanding submissions");
        self.shutdown.cancel();

        while self.outstanding.load(Ordering::SeqCst) > 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    pub fn stats(&self) -> PoolStats {
        let running = self.concurrency - self.semaphore.available_permits();
        PoolStats {
            outstanding: self.outstanding.load(Ordering::SeqCst),
            running,
            concurrency: self.concurrency,
            max_queue_size: self.max_queue_size,
            paused: self.shutdown.is_cancelled(),
        }
    }

    pub fn healthy(&self) -> bool {
        let outstanding = self.outstanding.load(Ordering::SeqCst) as f64;
        outstanding < 0.9 * self.max_queue_size as f64
    }
}

fn link_cancellation(source: CancellationToken, target: CancellationToken) {
    tokio::spawn(async move {
        tokio::select! {
            _ = source.cancelled() => target.cancel(),
            _ = target.cancelled() => {}
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize as StdAtomicUsize;
    use std::time::Duration;

    struct FnExecutor<F>(F);

    #[async_trait]
    impl<F, Fut> Execute for FnExecutor<F>
    where
        F: Fn(RunOptions) -> Fut + Send + Sync,
        Fut: std::future::Future<Output = CoreResult<RunResult>> + Send,
    {
        async fn run(&self, opts: RunOptions) -> CoreResult<RunResult> {
            (self.0)(opts).await
        }
    }

    fn ok_result() -> RunResult {
        RunResult {
            result: "ok".to_string(),
            upstream_session_id: None,
            raw_output: "ok".to_string(),
            model: None,
        }
    }

    #[tokio::test]
    async fn bounded_concurrency_never_exceeds_limit() {
        let active = Arc::new(StdAtomicUsize::new(0));
        let max_seen = Arc::new(StdAtomicUsize::new(0));
        let a = active.clone();
        let m = max_seen.clone();

        let executor = Arc::new(FnExecutor(move |_opts: RunOptions| {
            let a = a.clone();
            let m = m.clone();
            async move {
                let now = a.fetch_add(1, Ordering::SeqCst) + 1;
                m.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(30)).await;
                a.fetch_sub(1, Ordering::SeqCst);
                Ok(ok_result())
            }
        }));

        let pool = Arc::new(WorkerPool::new(
            executor,
            2,
            10,
            Duration::from_secs(5),
            Duration::from_secs(5),
        ));

        let mut handles = vec![];
        for i in 0..4 {
            let pool = pool.clone();
            handles.push(tokio::spawn(async move {
                pool.submit(
                    RunOptions::new("hi", Duration::from_secs(5), CancellationToken::new()),
                    &format!("req-{i}"),
                )
                .await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }

        assert!(max_seen.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn queue_full_when_outstanding_already_at_max() {
        let (release_tx, release_rx) = tokio::sync::watch::channel(false);
        let release_rx = Arc::new(tokio::sync::Mutex::new(release_rx));

        let executor = Arc::new(FnExecutor(move |_opts: RunOptions| {
            let rx = release_rx.clone();
            async move {
                let mut rx = rx.lock().await.clone();
                let _ = rx.changed().await;
                Ok(ok_result())
            }
        }));

        let pool = Arc::new(WorkerPool::new(
            executor,
            1,
            2,
            Duration::from_secs(5),
            Duration::from_secs(5),
        ));

        let p1 = pool.clone();
        let first = tokio::spawn(async move {
            p1.submit(
                RunOptions::new("a", Duration::from_secs(5), CancellationToken::new()),
                "req-1",
            )
            .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let p2 = pool.clone();
        let second = tokio::spawn(async move {
            p2.submit(
                RunOptions::new("b", Duration::from_secs(5), CancellationToken::new()),
                "req-2",
            )
            .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let third = pool
            .submit(
                RunOptions::new("c", Duration::from_secs(5), CancellationToken::new()),
                "req-3",
            )
            .await;
        assert_eq!(third.unwrap_err().kind, crate::core::errors::ErrorKind::QueueFull);

        release_tx.send(true).unwrap();
        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn shutdown_refuses_new_submissions() {
        let executor = Arc::new(FnExecutor(|_opts: RunOptions| async { Ok(ok_result()) }));
        let pool = WorkerPool::new(executor, 1, 5, Duration::from_secs(5), Duration::from_secs(5));
        pool.shutdown().await;

        let err = pool
            .submit(
                RunOptions::new("hi", Duration::from_secs(5), CancellationToken::new()),
                "req-1",
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::core::errors::ErrorKind::CliError);
    }

    #[tokio::test]
    async fn retries_non_streaming_submission_on_timeout() {
        let calls = Arc::new(StdAtomicUsize::new(0));
        let c = calls.clone();
        let executor = Arc::new(FnExecutor(move |_opts: RunOptions| {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(CoreError::timeout("slow"))
                } else {
                    Ok(ok_result())
                }
            }
        }));

        let pool = WorkerPool::new(executor, 1, 5, Duration::from_secs(5), Duration::from_secs(5));
        let result = pool
            .submit(
                RunOptions::new("hi", Duration::from_secs(5), CancellationToken::new()),
                "req-1",
            )
            .await;
        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn streaming_submission_bypasses_retry() {
        let calls = Arc::new(StdAtomicUsize::new(0));
        let c = calls.clone();
        let executor = Arc::new(FnExecutor(move |_opts: RunOptions| {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err::<RunResult, _>(CoreError::timeout("slow"))
            }
        }));

        let pool = WorkerPool::new(executor, 1, 5, Duration::from_secs(5), Duration::from_secs(5));
        let mut opts = RunOptions::new("hi", Duration::from_secs(5), CancellationToken::new());
        opts.stream = true;
        let result = pool.submit(opts, "req-1").await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn healthy_reports_false_near_saturation() {
        let executor = Arc::new(FnExecutor(|_opts: RunOptions| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(ok_result())
        }));
        let pool = Arc::new(WorkerPool::new(executor, 1, 10, Duration::from_secs(30), Duration::from_secs(30)));

        assert!(pool.healthy());

        let mut handles = vec![];
        for i in 0..9 {
            let pool = pool.clone();
            handles.push(tokio::spawn(async move {
                let _ = pool
                    .submit(
                        RunOptions::new("x", Duration::from_secs(30), CancellationToken::new()),
                        &format!("req-{i}"),
                    )
                    .await;
            }));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!pool.healthy());
        for h in handles {
            h.abort();
        }
    }
}
