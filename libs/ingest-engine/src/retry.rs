use std::time::Duration;

use tokio::time::Instant;

use crate::config::WriterConfig;

/// Exponential backoff: `initial * 2^(attempt-1)`, capped at `max_backoff`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &WriterConfig) -> Self {
        Self {
            max_retries: config.max_write_retries,
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }

    /// Delay after the given failed attempt (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        self.initial_backoff
            .saturating_mul(1u32 << exp)
            .min(self.max_backoff)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAt(Instant),
    GiveUp,
}

/// Retry bookkeeping for one batch commit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryState {
    /// Attempts started so far.
    pub attempt: u32,
    pub next_retry_at: Option<Instant>,
}

impl RetryState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin_attempt(&mut self) {
        self.attempt += 1;
        self.next_retry_at = None;
    }

    /// Record a failed attempt and decide whether to try again.
    pub fn on_failure(&mut self, policy: &RetryPolicy, now: Instant) -> RetryDecision {
        if self.attempt > policy.max_retries {
            self.next_retry_at = None;
            return RetryDecision::GiveUp;
        }
        let at = now + policy.backoff(self.attempt);
        self.next_retry_at = Some(at);
        RetryDecision::RetryAt(at)
    }

    pub fn retries(&self) -> u32 {
        self.attempt.saturating_sub(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(1_000),
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let p = policy(10);
        let delays: Vec<u64> = (1..=6).map(|a| p.backoff(a).as_millis() as u64).collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1_000, 1_000]);
        assert_eq!(p.backoff(200), Duration::from_millis(1_000));
    }

    #[test]
    fn gives_up_after_max_retries() {
        let p = policy(2);
        let now = Instant::now();
        let mut state = RetryState::new();

        state.begin_attempt();
        assert_eq!(state.on_failure(&p, now), RetryDecision::RetryAt(now + Duration::from_millis(100)));
        assert_eq!(state.next_retry_at, Some(now + Duration::from_millis(100)));

        state.begin_attempt();
        assert_eq!(state.on_failure(&p, now), RetryDecision::RetryAt(now + Duration::from_millis(200)));

        state.begin_attempt();
        assert_eq!(state.on_failure(&p, now), RetryDecision::GiveUp);
        assert_eq!(state.attempt, 3);
        assert_eq!(state.retries(), 2);
        assert!(state.next_retry_at.is_none());
    }

    #[test]
    fn zero_retries_means_one_attempt() {
        let mut state = RetryState::new();
        state.begin_attempt();
        assert_eq!(state.on_failure(&policy(0), Instant::now()), RetryDecision::GiveUp);
    }
}
