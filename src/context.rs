//! Execution context passed to every public operation.
//!
//! A context carries an optional deadline and a cancellation token. Loops
//! call [`ExecContext::check`] at the top of each iteration and before each
//! remote or long-running host command.

use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::error::Error;

/// Granularity of interruptible sleeps.
const SLEEP_SLICE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct ExecContext {
    deadline: Option<Instant>,
    started: Instant,
    token: CancellationToken,
}

impl Default for ExecContext {
    fn default() -> Self {
        Self::background()
    }
}

impl ExecContext {
    /// A context with no deadline.
    pub fn background() -> Self {
        Self {
            deadline: None,
            started: Instant::now(),
            token: CancellationToken::new(),
        }
    }

    /// Child context sharing cancellation, with a deadline no later than `timeout` from now.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some(existing) if existing < candidate => existing,
            _ => candidate,
        };
        Self {
            deadline: Some(deadline),
            started: Instant::now(),
            token: self.token.child_token(),
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Token that fires when this context is cancelled.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_done(&self) -> bool {
        self.token.is_cancelled() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Time left before the deadline, if any.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Bound `limit` by the remaining time.
    pub fn bounded(&self, limit: Duration) -> Duration {
        match self.remaining() {
            Some(left) if left < limit => left,
            _ => limit,
        }
    }

    /// Fail if cancelled or past the deadline.
    pub fn check(&self) -> Result<(), Error> {
        if self.token.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(Error::Timeout(deadline.saturating_duration_since(self.started)));
            }
        }
        Ok(())
    }

    /// Sleep for `duration`, waking early on cancellation or deadline.
    pub fn sleep(&self, duration: Duration) -> Result<(), Error> {
        let end = Instant::now() + duration;
        loop {
            self.check()?;
            let now = Instant::now();
            if now >= end {
                return Ok(());
            }
            std::thread::sleep(SLEEP_SLICE.min(end - now));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancellation_propagates_to_children() {
        let root = ExecContext::background();
        let child = root.with_timeout(Duration::from_secs(60));
        root.cancel();
        assert!(matches!(child.check(), Err(Error::Cancelled)));
    }

    #[test]
    fn child_deadline_never_extends_parent() {
        let parent = ExecContext::background().with_timeout(Duration::from_millis(50));
        let child = parent.with_timeout(Duration::from_secs(60));
        assert!(child.remaining().unwrap() <= Duration::from_millis(50));
    }

    #[test]
    fn sleep_stops_at_deadline() {
        let ctx = ExecContext::background().with_timeout(Duration::from_millis(150));
        let start = Instant::now();
        let result = ctx.sleep(Duration::from_secs(5));
        assert!(matches!(result, Err(Error::Timeout(_))));
        assert!(start.elapsed() < Duration::from_secs(2));
    }
}
