//! Per-attempt deadline used by the failover dispatcher.

use crate::error::ConfigError;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// Hard deadline for one delivery attempt.
///
/// On expiry the attempt future is dropped, which releases the waiter; any I/O the backend
/// already started may still complete on the remote side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutPolicy {
    duration: Duration,
}

/// The attempt did not finish before its deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimedOut {
    /// Time spent before the attempt was abandoned.
    pub elapsed: Duration,
    /// Configured deadline.
    pub timeout: Duration,
}

impl TimeoutPolicy {
    /// Create a timeout policy. Rejects zero and `Duration::MAX`.
    pub fn new(duration: Duration) -> Result<Self, ConfigError> {
        if duration == Duration::ZERO || duration == Duration::MAX {
            return Err(ConfigError::InvalidTimeout(duration));
        }
        Ok(Self { duration })
    }

    /// Inspect the configured timeout duration.
    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Drive `attempt` to completion or abandon it at the deadline.
    pub async fn run<F>(&self, attempt: F) -> Result<F::Output, TimedOut>
    where
        F: Future,
    {
        let start = Instant::now();
        match tokio::time::timeout(self.duration, attempt).await {
            Ok(output) => Ok(output),
            Err(_) => Err(TimedOut { elapsed: start.elapsed(), timeout: self.duration }),
        }
    }
}
