//! Bounded polling helper.
//!
//! Every wait in the operator is a loop of "check, sleep `interval`" bounded
//! by a timeout that converts into an error. The check decides between done
//! (`Ok(true)`), not yet (`Ok(false)`) and abort (`Err`).

use std::future::Future;
use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RetryError<E> {
    #[error("wait timed out after {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Inner(E),
}

/// Poll `check` every `interval` until it returns `Ok(true)`, it fails, or
/// `timeout` elapses.
pub async fn retry<F, Fut, E>(
    interval: Duration,
    timeout: Duration,
    mut check: F,
) -> Result<(), RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, E>>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        match check().await {
            Ok(true) => return Ok(()),
            Ok(false) => {}
            Err(e) => return Err(RetryError::Inner(e)),
        }
        if tokio::time::Instant::now() + interval > deadline {
            return Err(RetryError::Timeout(timeout));
        }
        tokio::time::sleep(interval).await;
    }
}

/// Like [`retry`], but the check may keep going on soft errors: `Err` values
/// for which `transient` returns true are treated as "not yet".
pub async fn retry_transient<F, Fut, E, P>(
    interval: Duration,
    timeout: Duration,
    transient: P,
    mut check: F,
) -> Result<(), RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, E>>,
    P: Fn(&E) -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        match check().await {
            Ok(true) => return Ok(()),
            Ok(false) => {}
            Err(e) if transient(&e) => {}
            Err(e) => return Err(RetryError::Inner(e)),
        }
        if tokio::time::Instant::now() + interval > deadline {
            return Err(RetryError::Timeout(timeout));
        }
        tokio::time::sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn succeeds_once_check_passes() {
        let mut calls = 0;
        let result = retry(
            Duration::from_millis(10),
            Duration::from_secs(1),
            || {
                calls += 1;
                let done = calls >= 3;
                async move { Ok::<_, std::io::Error>(done) }
            },
        )
        .await;
        assert!(result.is_ok());
        assert_eq!(calls, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn times_out() {
        let result = retry(
            Duration::from_millis(10),
            Duration::from_millis(35),
            || async { Ok::<_, std::io::Error>(false) },
        )
        .await;
        assert!(matches!(result, Err(RetryError::Timeout(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn hard_error_aborts() {
        let result = retry(Duration::from_millis(10), Duration::from_secs(1), || async {
            Err::<bool, _>(std::io::Error::other("boom"))
        })
        .await;
        assert!(matches!(result, Err(RetryError::Inner(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_keep_polling() {
        let mut calls = 0;
        let result = retry_transient(
            Duration::from_millis(10),
            Duration::from_secs(1),
            |_: &std::io::Error| true,
            || {
                calls += 1;
                let outcome = if calls < 3 {
                    Err(std::io::Error::other("connection refused"))
                } else {
                    Ok(true)
                };
                async move { outcome }
            },
        )
        .await;
        assert!(result.is_ok());
        assert_eq!(calls, 3);
    }
}
