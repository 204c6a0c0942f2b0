//! Idle countdown timer
//!
//! Tracks how long the pipeline has gone without observing new work. The
//! timer is deliberately not thread-safe: it is owned and touched only by
//! the dispatch loop. Expiry is a pure function of the current time against
//! the stored deadline.

use std::time::Duration;
use tokio::time::Instant;

/// Countdown timer with a fixed patience.
#[derive(Debug)]
pub struct IdleTimer {
    patience: Duration,
    deadline: Instant,
}

impl IdleTimer {
    /// Create a timer whose first deadline is `patience` from now.
    ///
    /// A zero patience is valid and makes the timer immediately expirable.
    pub fn new(patience: Duration) -> Self {
        Self {
            patience,
            deadline: Instant::now() + patience,
        }
    }

    /// Push the deadline out to now + patience.
    pub fn reset(&mut self) {
        self.deadline = Instant::now() + self.patience;
    }

    /// True iff the deadline has passed.
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    /// The configured patience.
    pub fn patience(&self) -> Duration {
        self.patience
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_expires_after_patience() {
        let timer = IdleTimer::new(Duration::from_secs(1));
        assert!(!timer.is_expired());

        tokio::time::advance(Duration::from_millis(999)).await;
        assert!(!timer.is_expired());

        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(timer.is_expired());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_pushes_deadline_out() {
        let mut timer = IdleTimer::new(Duration::from_secs(1));

        tokio::time::advance(Duration::from_millis(900)).await;
        timer.reset();
        assert!(!timer.is_expired());

        tokio::time::advance(Duration::from_millis(900)).await;
        assert!(!timer.is_expired());

        tokio::time::advance(Duration::from_millis(100)).await;
        assert!(timer.is_expired());
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_patience_expires_immediately() {
        let mut timer = IdleTimer::new(Duration::ZERO);
        assert!(timer.is_expired());

        // Resetting cannot unexpire a zero-patience timer.
        timer.reset();
        assert!(timer.is_expired());
    }
}
