//! # Command Executor
//!
//! Purpose: Run one HSM command end to end (borrow, write, read, return)
//! and absorb transient failures with bounded, linearly increasing backoff.
//!
//! ## Design Principles
//! 1. **Outcome Values**: Each stage returns a `ClientResult`; the retry loop
//!    branches on the error kind instead of unwinding.
//! 2. **Always Return**: The borrowed connection goes back to the pool on every
//!    path, and the pool's validity check recycles it when broken.
//! 3. **Cancellation Wins**: A cancelled backoff aborts the loop immediately.
//!
//! ## Ordering
//!
//! At most one request is in flight per connection, but nothing orders
//! commands across callers. A retried command may land on a different
//! connection than the attempt that failed.

use std::time::Duration;

use hsm_common::{FrameCodec, Response};
use tracing::{debug, error, warn};

use crate::cancel::CancelToken;
use crate::client::{ClientError, ClientResult};
use crate::pool::ConnectionPool;

/// Canonical attempt budget.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Canonical backoff step.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);

/// Attempt budget and backoff schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: DEFAULT_BASE_DELAY,
        }
    }
}

impl RetryPolicy {
    /// Delay slept after failed attempt `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt)
    }

    fn attempts(&self) -> u32 {
        self.max_retries.max(1)
    }
}

/// Sends commands through a pool with retries.
#[derive(Clone)]
pub struct CommandExecutor {
    pool: ConnectionPool,
    codec: FrameCodec,
    retry: RetryPolicy,
}

impl CommandExecutor {
    pub fn new(pool: ConnectionPool, codec: FrameCodec, retry: RetryPolicy) -> Self {
        CommandExecutor { pool, codec, retry }
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn codec(&self) -> FrameCodec {
        self.codec
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Executes `command`, retrying transient failures.
    pub fn execute(&self, command: &str) -> ClientResult<Response> {
        self.execute_cancellable(command, &CancelToken::new())
    }

    /// Executes `command`; `cancel` aborts pool waits and backoff sleeps.
    ///
    /// **Logic**:
    /// 1. Encode once; an unencodable command fails without any attempt.
    /// 2. For attempt `a` in `1..=max_retries`: borrow, exchange, return.
    /// 3. On a retryable failure sleep `a * base_delay` before the next attempt.
    /// 4. After the last failure return `RetriesExhausted` with its cause.
    pub fn execute_cancellable(&self, command: &str, cancel: &CancelToken) -> ClientResult<Response> {
        let frame = self.codec.encode(command).map_err(ClientError::Encoding)?;
        let max = self.retry.attempts();
        debug!(command, "executing HSM command");

        let mut attempt = 1;
        loop {
            let err = match self.attempt(&frame, cancel) {
                Ok(response) => {
                    debug!(response = %response, "HSM response received");
                    return Ok(response);
                }
                Err(err) => err,
            };

            if !err.is_retryable() {
                warn!(attempt, max, error = %err, "HSM command aborted");
                return Err(err);
            }
            warn!("attempt {}/{} failed: {}", attempt, max, err);

            if attempt >= max {
                error!(attempts = attempt, last = %err, "HSM command failed after retries");
                return Err(ClientError::RetriesExhausted {
                    attempts: attempt,
                    last: Box::new(err),
                });
            }

            if !cancel.sleep(self.retry.delay(attempt)) {
                warn!(attempt, "interrupted during retry backoff");
                return Err(ClientError::Cancelled);
            }
            attempt += 1;
        }
    }

    // The guard returns the connection when it goes out of scope, on both paths.
    fn attempt(&self, frame: &[u8], cancel: &CancelToken) -> ClientResult<Response> {
        let mut conn = self.pool.borrow_cancellable(cancel)?;
        let raw = conn.exchange(frame, &self.codec)?;
        Ok(Response::new(raw, self.codec.width()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_grows_linearly() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay(1), Duration::from_secs(1));
        assert_eq!(policy.delay(2), Duration::from_secs(2));
        assert_eq!(policy.delay(5), Duration::from_secs(5));
    }

    #[test]
    fn zero_retries_still_attempts_once() {
        let policy = RetryPolicy {
            max_retries: 0,
            base_delay: Duration::from_millis(1),
        };
        assert_eq!(policy.attempts(), 1);
    }
}
