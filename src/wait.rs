// Bounded waits for blocking serial reads
//
// Every blocking read in the driver goes through BoundedWait: poll a closure at a
// fixed interval until it produces a value, the deadline passes, or the
// cancellation token fires. The token is tokio-util's, so async callers can
// cancel a blocking worker without changing the driver's contract.

use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Default delay between polls
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Why a bounded wait gave up
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum WaitError {
    #[error("timed out after {0:?}")]
    TimedOut(Duration),

    #[error("wait cancelled")]
    Cancelled,
}

/// A fixed timeout plus an optional cancellation token
#[derive(Debug, Clone)]
pub struct BoundedWait {
    timeout: Duration,
    poll_interval: Duration,
    cancel: Option<CancellationToken>,
}

impl BoundedWait {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            poll_interval: DEFAULT_POLL_INTERVAL,
            cancel: None,
        }
    }

    /// Change the delay between polls
    pub fn poll_every(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Abort the wait as soon as `token` is cancelled
    pub fn cancel_on(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Poll `check` until it returns `Some`.
    ///
    /// `check` always runs at least once, even with a zero timeout. Errors from
    /// `check` end the wait immediately. Cancellation is checked before every
    /// poll, so an already-cancelled token never runs `check`.
    pub fn run<T, E>(&self, mut check: impl FnMut() -> Result<Option<T>, E>) -> Result<T, E>
    where
        E: From<WaitError>,
    {
        let started = Instant::now();

        loop {
            if self.is_cancelled() {
                return Err(WaitError::Cancelled.into());
            }

            if let Some(value) = check()? {
                return Ok(value);
            }

            let elapsed = started.elapsed();
            if elapsed >= self.timeout {
                return Err(WaitError::TimedOut(self.timeout).into());
            }

            std::thread::sleep(self.poll_interval.min(self.timeout - elapsed));
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|token| token.is_cancelled())
    }
}
