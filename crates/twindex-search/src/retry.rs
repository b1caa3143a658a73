//! Ask-with-retry: timeouts and exponential backoff for outbound calls.
//!
//! Every outbound fetch (twin retrieval, policy load) goes through
//! [`ask_with_retry`]: each attempt is bounded by the configured timeout,
//! failed attempts are retried with exponential backoff, and every
//! request carries a ULID correlation id in its tracing span so retries
//! of one logical ask can be correlated across logs.

use std::future::Future;
use std::time::Duration;

use tracing::Instrument;
use ulid::Ulid;

use crate::config::AskRetrySettings;
use crate::error::{Error, Result};

/// Runs `operation` with per-attempt timeout and exponential backoff.
///
/// The operation is attempted once plus up to `settings.retries` more
/// times. Only transient errors are retried; permanent errors surface
/// immediately.
///
/// # Errors
///
/// Returns [`Error::AskTimeout`] when every attempt timed out, or the
/// operation's own error when it failed permanently (or kept failing
/// transiently until the attempts were exhausted).
pub async fn ask_with_retry<T, F, Fut>(
    settings: &AskRetrySettings,
    operation_name: &'static str,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let correlation_id = Ulid::new();
    let span = tracing::debug_span!(
        "ask",
        op = operation_name,
        correlation_id = %correlation_id,
    );

    async {
        let attempts = settings.retries + 1;
        let mut timeouts = 0u32;
        for attempt in 0..attempts {
            if attempt > 0 {
                tokio::time::sleep(backoff_for(settings.backoff, attempt - 1)).await;
            }
            match tokio::time::timeout(settings.timeout, operation()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(error)) if error.is_transient() && attempt + 1 < attempts => {
                    tracing::warn!(%error, attempt, "transient ask failure, retrying");
                }
                Ok(Err(error)) => return Err(error),
                Err(_elapsed) => {
                    timeouts += 1;
                    tracing::warn!(attempt, "ask attempt timed out");
                }
            }
        }
        if timeouts > 0 {
            Err(Error::AskTimeout {
                operation: operation_name,
                attempts,
            })
        } else {
            Err(Error::transient_store(format!(
                "ask '{operation_name}' failed transiently on every attempt"
            )))
        }
    }
    .instrument(span)
    .await
}

/// Exponential backoff: `base * 2^attempt`, saturating.
#[must_use]
pub fn backoff_for(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempt))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn settings(retries: u32) -> AskRetrySettings {
        AskRetrySettings {
            timeout: Duration::from_millis(50),
            retries,
            backoff: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn first_success_returns_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in = Arc::clone(&calls);
        let result = ask_with_retry(&settings(3), "probe", move || {
            let calls = Arc::clone(&calls_in);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(42)
            }
        })
        .await
        .unwrap();
        assert_eq!(result, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in = Arc::clone(&calls);
        let result = ask_with_retry(&settings(3), "probe", move || {
            let calls = Arc::clone(&calls_in);
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Error::transient_store("flaky"))
                } else {
                    Ok("ok")
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(result, "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_failures_surface_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in = Arc::clone(&calls);
        let result: Result<()> = ask_with_retry(&settings(3), "probe", move || {
            let calls = Arc::clone(&calls_in);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::permanent_store("rejected"))
            }
        })
        .await;
        assert!(matches!(result, Err(Error::PermanentStore { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timeouts_exhaust_into_ask_timeout() {
        let result: Result<()> = ask_with_retry(&settings(1), "probe", || async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        })
        .await;
        match result {
            Err(Error::AskTimeout {
                operation,
                attempts,
            }) => {
                assert_eq!(operation, "probe");
                assert_eq!(attempts, 2);
            }
            other => panic!("expected ask timeout, got {other:?}"),
        }
    }

    #[test]
    fn backoff_doubles() {
        let base = Duration::from_millis(100);
        assert_eq!(backoff_for(base, 0), Duration::from_millis(100));
        assert_eq!(backoff_for(base, 1), Duration::from_millis(200));
        assert_eq!(backoff_for(base, 3), Duration::from_millis(800));
    }
}
