//! Bounded retry of fallible device operations.
//!
//! Every command in this crate passes through a [`RetryPolicy`]. Policies are
//! plain values so each protocol can carry its own budget: three quick
//! attempts for interrupt-protocol commands, five slow ones for the bulk
//! protocol's init handshake.

use crate::error::{Error, Result};
use log::warn;
use std::thread;
use std::time::Duration;

/// Number of attempts for an ordinary command operation.
pub const DEFAULT_ATTEMPTS: usize = 3;

/// Delay between attempts of an ordinary command operation.
pub const DEFAULT_DELAY: Duration = Duration::from_millis(100);

/// How many times to try an operation and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of invocations (at least one is always made).
    pub attempts: usize,
    /// Pause between consecutive invocations.
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_ATTEMPTS,
            delay: DEFAULT_DELAY,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with the given attempt budget and delay.
    pub fn new(attempts: usize, delay: Duration) -> Self {
        Self { attempts, delay }
    }

    /// A policy that makes exactly one attempt.
    pub fn once() -> Self {
        Self::new(1, Duration::ZERO)
    }

    /// Set the delay between attempts.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Run `operation` until it succeeds or the budget is spent.
    ///
    /// `what` names the operation in log output. The last error is returned
    /// unchanged once every attempt has failed.
    pub fn run<T, F>(&self, what: &str, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Result<T>,
    {
        let attempts = self.attempts.max(1);
        let mut last_error: Option<Error> = None;

        for attempt in 1..=attempts {
            match operation() {
                Ok(value) => return Ok(value),
                Err(e) => {
                    if attempt < attempts {
                        warn!("{what} failed (attempt {attempt}/{attempts}): {e}");
                        if !self.delay.is_zero() {
                            thread::sleep(self.delay);
                        }
                    }
                    last_error = Some(e);
                },
            }
        }

        Err(last_error.unwrap_or_else(|| Error::InternalState(format!("{what} never ran"))))
    }
}
