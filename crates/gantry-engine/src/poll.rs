//! Bounded polling against external platforms.

use gantry_core::{Error, Result};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Result of one probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollStep<T> {
    /// The awaited condition was reached.
    Done(T),
    /// Not there yet; probe again after the interval.
    Pending,
}

/// Fixed-interval polling with an attempt budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl PollPolicy {
    pub fn new(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Probe until it reports [`PollStep::Done`].
    ///
    /// Retryable errors use up an attempt; any other error ends the wait
    /// immediately. Running out of attempts is [`Error::PlatformTimeout`],
    /// which callers may retry as a whole.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut probe: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<PollStep<T>>>,
    {
        for attempt in 1..=self.max_attempts {
            match probe(attempt).await {
                Ok(PollStep::Done(value)) => {
                    debug!(operation, attempt, "Poll finished");
                    return Ok(value);
                }
                Ok(PollStep::Pending) => {}
                Err(e) if e.is_retryable() => {
                    warn!(operation, attempt, error = %e, "Poll attempt failed");
                }
                Err(e) => return Err(e),
            }
            if attempt < self.max_attempts {
                sleep(self.interval).await;
            }
        }
        Err(Error::PlatformTimeout {
            operation: operation.to_string(),
            attempts: self.max_attempts,
        })
    }
}
