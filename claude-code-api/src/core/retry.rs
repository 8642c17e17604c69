//! Retry/backoff policy wrapped around a single `Pool.Submit` body
//! (spec §4.2). Non-streaming only — callers never invoke this for
//! streaming requests, which fail fast by construction.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::core::errors::{CoreError, CoreResult};
use crate::core::types::RunResult;

const MAX_ATTEMPTS: u32 = 3;
/// Base backoff per attempt index, before jitter. Only the first two are
/// ever slept on since `MAX_ATTEMPTS` caps at 3; the third is kept so the
/// table reads the same shape the spec lists it in.
const BASE_DELAYS_MS: [u64; 3] = [1000, 2000, 4000];
const JITTER_FRACTION: f64 = 0.15;

pub struct RetryPolicy;

impl RetryPolicy {
    /// Run `attempt` up to [`MAX_ATTEMPTS`] times. Retries only on a
    /// retryable [`CoreError`] (`timeout`, `rate_limit`, or a transport
    /// reset); anything else, or exhausting the attempt budget, returns the
    /// error from the most recent attempt. `cancel` is checked before each
    /// attempt and raced against each backoff sleep.
    pub async fn run<F, Fut>(cancel: &CancellationToken, mut attempt: F) -> CoreResult<RunResult>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = CoreResult<RunResult>>,
    {
        for attempt_no in 1..=MAX_ATTEMPTS {
            if cancel.is_cancelled() {
                return Err(CoreError::aborted("cancelled before attempt"));
            }

            match attempt().await {
                Ok(result) => {
                    if attempt_no > 1 {
                        info!(attempt = attempt_no, "submission succeeded after retry");
                    }
                    return Ok(result);
                },
                Err(err) => {
                    if attempt_no == MAX_ATTEMPTS || !err.is_retryable() {
                        return Err(err);
                    }

                    let delay = jittered_delay(BASE_DELAYS_MS[(attempt_no - 1) as usize]);
                    warn!(
                        attempt = attempt_no,
                        kind = %err.kind,
                        delay_ms = delay.as_millis() as u64,
                        "retrying after transient failure"
                    );

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => {
                            return Err(CoreError::aborted("cancelled during retry backoff"));
                        }
                    }
                },
            }
        }

        unreachable!("loop always returns by MAX_ATTEMPTS")
    }
}

fn jittered_delay(base_ms: u64) -> Duration {
    let jitter = rand::thread_rng().gen_range(-JITTER_FRACTION..=JITTER_FRACTION);
    let millis = (base_ms as f64 * (1.0 + jitter)).max(0.0) as u64;
    Duration::from_millis(millis)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn result(text: &str) -> RunResult {
        RunResult {
            result: text.to_string(),
            upstream_session_id: None,
            raw_output: text.to_string(),
            model: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_on_timeout_then_succeeds() {
        let calls = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();
        let c = calls.clone();

        let fut = RetryPolicy::run(&cancel, move || {
            let c = c.clone();
            async move {
                let n = c.fetch_add(1, Ordering::SeqCst);
                if n == 0 {
                    Err(CoreError::timeout("slow"))
                } else {
                    Ok(result("ok"))
                }
            }
        });

        tokio::time::pause();
        let handle = tokio::spawn(fut);
        tokio::time::advance(Duration::from_secs(2)).await;
        let out = handle.await.unwrap();

        assert_eq!(out.unwrap().result, "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn caps_at_three_attempts_on_persistent_timeout() {
        let calls = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();
        let c = calls.clone();

        let fut = RetryPolicy::run(&cancel, move || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err::<RunResult, _>(CoreError::timeout("still slow"))
            }
        });

        let handle = tokio::spawn(fut);
        tokio::time::advance(Duration::from_secs(10)).await;
        let out = handle.await.unwrap();

        assert_eq!(out.unwrap_err().kind, crate::core::errors::ErrorKind::Timeout);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_kind_is_a_single_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();
        let c = calls.clone();

        let out = RetryPolicy::run(&cancel, move || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err::<RunResult, _>(CoreError::invalid_request("bad prompt"))
            }
        })
        .await;

        assert!(out.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn already_cancelled_aborts_without_calling_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let c = calls.clone();

        let out = RetryPolicy::run(&cancel, move || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(result("should not run"))
            }
        })
        .await;

        assert!(out.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn jittered_delay_stays_within_fifteen_percent() {
        for _ in 0..100 {
            let d = jittered_delay(1000).as_millis();
            assert!((850..=1150).contains(&d), "delay {d} out of bounds");
        }
    }
}
