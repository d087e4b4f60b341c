//! Poll-until primitive shared by every dispatch-then-confirm operation.
//!
//! A fetch returning `Ok(None)` or `Err(_)` counts as "nothing yet"; only a
//! present value that the continuation predicate releases ends the wait.
//! On deadline the last fetched value is dropped, never returned.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, warn};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AwaitError {
    #[error("timed out after {waited:?}")]
    TimedOut { waited: Duration },

    #[error("aborted after {waited:?}")]
    Aborted { waited: Duration },
}

impl AwaitError {
    pub fn waited(&self) -> Duration {
        match self {
            Self::TimedOut { waited } | Self::Aborted { waited } => *waited,
        }
    }
}

type Predicate<T> = Box<dyn Fn(&T) -> bool + Send + Sync>;
type AbortCheck = Box<dyn Fn() -> bool + Send + Sync>;

pub struct PollUntil<T> {
    max_wait: Duration,
    interval: Duration,
    keep_waiting: Option<Predicate<T>>,
    abort_when: Option<AbortCheck>,
}

impl<T> PollUntil<T> {
    pub fn new(max_wait: Duration, interval: Duration) -> Self {
        Self {
            max_wait,
            // A zero interval would spin the executor.
            interval: interval.max(Duration::from_millis(1)),
            keep_waiting: None,
            abort_when: None,
        }
    }

    /// Keep polling while `predicate` holds for a fetched value.
    pub fn keep_waiting(mut self, predicate: impl Fn(&T) -> bool + Send + Sync + 'static) -> Self {
        self.keep_waiting = Some(Box::new(predicate));
        self
    }

    /// Checked before each fetch; returning `true` ends the loop with
    /// [`AwaitError::Aborted`].
    pub fn abort_when(mut self, check: impl Fn() -> bool + Send + Sync + 'static) -> Self {
        self.abort_when = Some(Box::new(check));
        self
    }

    pub async fn run<E, F, Fut>(&self, mut fetch: F) -> Result<T, AwaitError>
    where
        E: Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Option<T>, E>>,
    {
        let started = Instant::now();
        let deadline = started + self.max_wait;
        let mut attempts: u32 = 0;

        loop {
            if self.abort_when.as_ref().is_some_and(|check| check()) {
                return Err(AwaitError::Aborted {
                    waited: started.elapsed(),
                });
            }

            attempts = attempts.saturating_add(1);
            match fetch().await {
                Ok(Some(value)) => {
                    let hold = self.keep_waiting.as_ref().is_some_and(|p| p(&value));
                    if !hold {
                        debug!(attempts, "poll condition satisfied");
                        return Ok(value);
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, attempts, "poll fetch failed, retrying next tick"),
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(AwaitError::TimedOut {
                    waited: now.saturating_duration_since(started),
                });
            }
            sleep_until((now + self.interval).min(deadline)).await;
        }
    }
}
