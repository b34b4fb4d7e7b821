use std::{future::IntoFuture, time::Duration};

use tokio::time::{timeout, Timeout};

use crate::config::RetryConfig;

#[derive(Debug)]
pub enum RetryState<T> {
    Ok(T),
    Retry(Duration),
    GaveUp,
}

#[derive(Debug, Default)]
pub struct Retry {
    pub attempts: u8,
    config: RetryConfig,
}

impl Retry {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            attempts: 0,
            config,
        }
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    pub fn timeout<F: IntoFuture>(&self, f: F) -> Timeout<F::IntoFuture> {
        timeout(self.config.timeout(), f)
    }

    /// Returns the delay to wait before the current attempt: the
    /// initial backoff doubled for each previous attempt, capped by
    /// the maximum backoff.
    pub fn backoff(&self) -> Duration {
        let factor = 1u64
            .checked_shl(self.attempts.saturating_sub(1).into())
            .unwrap_or(u64::MAX);
        let secs = self
            .config
            .backoff_secs
            .saturating_mul(factor)
            .min(self.config.max_backoff_secs);
        Duration::from_secs(secs)
    }

    pub fn next<T, E>(&mut self, res: Result<T, E>) -> RetryState<T> {
        match res.ok() {
            Some(res) => {
                self.reset();
                RetryState::Ok(res)
            }
            None if self.attempts < self.config.attempts => {
                self.attempts += 1;
                RetryState::Retry(self.backoff())
            }
            None => {
                self.reset();
                RetryState::GaveUp
            }
        }
    }
}
