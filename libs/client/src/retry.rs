//! One cancellable retry policy, shared by signaling reconnects and local
//! track acquisition.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tokio::time;
use tokio_util::sync::CancellationToken;

#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    #[error("cancelled")]
    Cancelled,
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },
}

/// Fixed-interval retry with a capped number of attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl RetryPolicy {
    pub fn new(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Run `op` until it succeeds, the attempts run out, or `cancel` fires.
    /// `op` receives the 1-based attempt number.
    pub async fn run<T, E, F, Fut>(&self, cancel: &CancellationToken, mut op: F) -> Result<T, RetryError<E>>
    where
        E: Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 1;
        loop {
            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(RetryError::Cancelled),
                result = op(attempt) => result,
            };

            match result {
                Ok(value) => return Ok(value),
                Err(last) if attempt >= self.max_attempts => {
                    return Err(RetryError::Exhausted {
                        attempts: attempt,
                        last,
                    });
                }
                Err(err) => {
                    tracing::debug!(attempt, max_attempts = self.max_attempts, %err, "attempt failed, retrying");
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(RetryError::Cancelled),
                _ = time::sleep(self.interval) => {}
            }
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn succeeds_on_later_attempt() {
        let policy = RetryPolicy::new(Duration::from_secs(5), 5);
        let result = policy
            .run(&CancellationToken::new(), |attempt| async move {
                if attempt < 3 {
                    Err("not yet")
                } else {
                    Ok(attempt)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_cap() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::new(Duration::from_secs(5), 5);
        let c = calls.clone();
        let result: Result<(), _> = policy
            .run(&CancellationToken::new(), move |_| {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err("down")
                }
            })
            .await;

        match result {
            Err(RetryError::Exhausted { attempts, last }) => {
                assert_eq!(attempts, 5);
                assert_eq!(last, "down");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_stops_the_wait() {
        let cancel = CancellationToken::new();
        let policy = RetryPolicy::new(Duration::from_secs(60), 5);
        let c = cancel.clone();
        tokio::spawn(async move {
            time::sleep(Duration::from_secs(1)).await;
            c.cancel();
        });
        let result: Result<(), _> = policy.run(&cancel, |_| async { Err("down") }).await;
        assert!(matches!(result, Err(RetryError::Cancelled)));
    }
}
