//! Retry policy for transient remote IO.
//!
//! Applied once per remote operation, never around whole phases. The wait
//! loop is [`backoff::retry_notify`] driven by [`LinearBackoff`].

use anyhow::Result;
use backoff::backoff::Backoff;
use backoff::Error as BackoffError;
use serde::Deserialize;
use std::cell::Cell;
use std::time::Duration;

use crate::context::ExecContext;
use crate::error::{self, Error};

/// Lowercased fragments of error messages that are worth retrying.
const RETRIABLE_PATTERNS: &[&str] = &[
    "connection refused",
    "connection reset",
    "connection aborted",
    "broken pipe",
    "timed out",
    "no route to host",
    "network is unreachable",
    "host is down",
    "unexpected eof",
    "disconnected",
    "channel open failure",
    "handshake",
];

/// Initial delay plus a linear increment per attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryPolicy {
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_increment_ms")]
    pub increment_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_initial_delay_ms() -> u64 {
    1000
}

fn default_increment_ms() -> u64 {
    1000
}

fn default_max_attempts() -> u32 {
    5
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            increment_ms: default_increment_ms(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no waiting.
    pub fn none() -> Self {
        Self {
            initial_delay_ms: 0,
            increment_ms: 0,
            max_attempts: 1,
        }
    }

    /// Delay before retry number `attempt` (1-based: the wait after the first failure is attempt 1).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let extra = self.increment_ms * u64::from(attempt.saturating_sub(1));
        Duration::from_millis(self.initial_delay_ms + extra)
    }

    /// The policy as a [`Backoff`] bound to `ctx`.
    pub fn backoff<'a>(&self, ctx: &'a ExecContext) -> LinearBackoff<'a> {
        LinearBackoff {
            policy: *self,
            retries: 0,
            ctx,
        }
    }

    /// Run `op` until it succeeds, fails non-transiently, or attempts run out.
    pub fn run<T>(
        &self,
        ctx: &ExecContext,
        what: &str,
        mut op: impl FnMut() -> Result<T>,
    ) -> Result<T> {
        let attempt = Cell::new(0u32);
        let max_attempts = self.max_attempts.max(1);
        let result = backoff::retry_notify(
            self.backoff(ctx),
            || {
                ctx.check()
                    .map_err(|e| BackoffError::permanent(anyhow::Error::from(e)))?;
                attempt.set(attempt.get() + 1);
                op().map_err(|e| {
                    if is_retriable(&e) {
                        BackoffError::transient(e)
                    } else {
                        BackoffError::permanent(e)
                    }
                })
            },
            |e: anyhow::Error, delay: Duration| {
                tracing::warn!(
                    attempt = attempt.get(),
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "{what} failed, retrying: {e:#}"
                );
            },
        );
        match result {
            Ok(v) => Ok(v),
            Err(BackoffError::Permanent(e)) => Err(e),
            Err(BackoffError::Transient { err, .. }) => {
                ctx.check()?;
                Err(err)
            }
        }
    }
}

/// [`RetryPolicy`] as a [`Backoff`]. Stops once the attempts are used up
/// or `ctx` is done; waits never run past the context deadline.
#[derive(Debug)]
pub struct LinearBackoff<'a> {
    policy: RetryPolicy,
    retries: u32,
    ctx: &'a ExecContext,
}

impl Backoff for LinearBackoff<'_> {
    fn reset(&mut self) {
        self.retries = 0;
    }

    fn next_backoff(&mut self) -> Option<Duration> {
        if self.retries + 1 >= self.policy.max_attempts.max(1) || self.ctx.is_done() {
            return None;
        }
        self.retries += 1;
        Some(self.ctx.bounded(self.policy.delay_for(self.retries)))
    }
}

/// Whether an error belongs to the retriable set.
pub fn is_retriable(err: &anyhow::Error) -> bool {
    match error::kind(err) {
        Some(Error::Transient(_)) => return true,
        Some(Error::BmcWedged { .. })
        | Some(Error::Cancelled)
        | Some(Error::Timeout(_))
        | Some(Error::Validation(_))
        | Some(Error::CommandFailed { .. }) => return false,
        _ => {}
    }
    let text = format!("{err:#}").to_ascii_lowercase();
    if text.contains("authentication") {
        return false;
    }
    RETRIABLE_PATTERNS.iter().any(|p| text.contains(p))
}
