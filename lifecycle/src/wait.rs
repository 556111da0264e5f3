use crate::error::{self, Result};
use log::{trace, warn};
use snafu::ResultExt;
use std::future::Future;
use std::time::Duration;

/// Backoff schedule for a polling loop: the delay starts at `initial`, doubles after each
/// attempt, and never exceeds `cap`. The loop gives up after `attempts` polls.
#[derive(Clone, Copy, Debug)]
pub struct Backoff {
    pub initial: Duration,
    pub cap: Duration,
    pub attempts: u32,
}

impl Backoff {
    pub fn new(initial: Duration, cap: Duration, attempts: u32) -> Self {
        Self {
            initial,
            cap,
            attempts,
        }
    }

    fn delay(&self, attempt: u32) -> Duration {
        // Cap the exponent so the multiplication cannot overflow.
        let factor = 2u32.saturating_pow(attempt.min(16));
        self.initial.saturating_mul(factor).min(self.cap)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(2),
            cap: Duration::from_secs(30),
            attempts: 60,
        }
    }
}

/// Poll `condition` until it reports true, sleeping between attempts per `backoff`. The whole
/// wait is additionally bounded by `overall`; exceeding either bound is an error, never a silent
/// continue. Errors from the condition itself abort the wait immediately.
pub async fn until<F, Fut>(
    what: &str,
    backoff: Backoff,
    overall: Duration,
    mut condition: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    tokio::time::timeout(overall, async {
        for attempt in 0..backoff.attempts {
            if condition().await? {
                return Ok(());
            }
            let delay = backoff.delay(attempt);
            trace!("{} not ready, checking again in {:?}", what, delay);
            tokio::time::sleep(delay).await;
        }
        error::WaitAttemptsSnafu {
            what,
            attempts: backoff.attempts,
        }
        .fail()
    })
    .await
    .context(error::WaitTimeoutSnafu { what })?
}

/// Retry `call` while `retriable` classifies its error as transient, sleeping `delay` between
/// attempts. The last error is returned as-is once `attempts` are spent, so the caller surfaces
/// the real failure instead of a generic timeout.
pub async fn retry<T, E, F, Fut, P>(
    what: &str,
    attempts: u32,
    delay: Duration,
    mut retriable: P,
    mut call: F,
) -> std::result::Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    P: FnMut(&E) -> bool,
{
    let mut attempt = 1;
    loop {
        match call().await {
            Err(error) if attempt < attempts && retriable(&error) => {
                attempt += 1;
                warn!("Could not {} yet, retrying in {:?}", what, delay);
                tokio::time::sleep(delay).await;
            }
            result => return result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{retry, until, Backoff};
    use crate::error::{self, Error};
    use std::time::Duration;

    fn quick(attempts: u32) -> Backoff {
        Backoff::new(Duration::from_millis(1), Duration::from_millis(4), attempts)
    }

    #[test]
    fn delays_double_up_to_the_cap() {
        let backoff = Backoff::new(Duration::from_secs(2), Duration::from_secs(30), 10);
        assert_eq!(backoff.delay(0), Duration::from_secs(2));
        assert_eq!(backoff.delay(1), Duration::from_secs(4));
        assert_eq!(backoff.delay(2), Duration::from_secs(8));
        assert_eq!(backoff.delay(5), Duration::from_secs(30));
        assert_eq!(backoff.delay(u32::MAX), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn condition_eventually_true_succeeds() {
        let mut polls = 0;
        let result = until("test condition", quick(10), Duration::from_secs(5), || {
            polls += 1;
            let done = polls >= 3;
            async move { Ok(done) }
        })
        .await;
        assert!(result.is_ok());
        assert_eq!(polls, 3);
    }

    #[tokio::test]
    async fn attempts_are_bounded() {
        let result = until("test condition", quick(3), Duration::from_secs(5), || async {
            Ok(false)
        })
        .await;
        match result {
            Err(Error::WaitAttempts { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("expected WaitAttempts, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn overall_timeout_is_enforced() {
        let backoff = Backoff::new(Duration::from_millis(50), Duration::from_millis(50), 100);
        let result = until(
            "test condition",
            backoff,
            Duration::from_millis(10),
            || async { Ok(false) },
        )
        .await;
        assert!(matches!(result, Err(Error::WaitTimeout { .. })));
    }

    #[tokio::test]
    async fn retry_returns_the_last_error_once_attempts_are_spent() {
        let mut calls = 0;
        let result: Result<(), u32> =
            retry("test call", 3, Duration::from_millis(1), |_| true, || {
                calls += 1;
                let failure = calls;
                async move { Err(failure) }
            })
            .await;
        assert_eq!(result, Err(3));
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn retry_gives_up_immediately_on_a_fatal_error() {
        let mut calls = 0;
        let result: Result<(), &str> = retry(
            "test call",
            5,
            Duration::from_millis(1),
            |e: &&str| *e == "transient",
            || {
                calls += 1;
                async { Err("fatal") }
            },
        )
        .await;
        assert_eq!(result, Err("fatal"));
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn retry_stops_as_soon_as_the_call_succeeds() {
        let mut calls = 0;
        let result: Result<u32, &str> =
            retry("test call", 5, Duration::from_millis(1), |_| true, || {
                calls += 1;
                let outcome = if calls < 3 { Err("transient") } else { Ok(calls) };
                async move { outcome }
            })
            .await;
        assert_eq!(result, Ok(3));
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn condition_errors_abort_the_wait() {
        let result: Result<(), Error> =
            until("test condition", quick(10), Duration::from_secs(5), || async {
                error::MissingSnafu {
                    what: "status",
                    from: "response",
                }
                .fail()
            })
            .await;
        assert!(matches!(result, Err(Error::Missing { .. })));
    }
}
