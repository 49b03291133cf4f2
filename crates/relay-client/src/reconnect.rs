// Copyright (c) 2026 Roman Barinov <rbarinov@gmail.com>
// Licensed under the FSL-1.1-NC.

use std::time::Duration;
use tokio::time::sleep;

const MIN_BACKOFF_STEP: Duration = Duration::from_millis(100);

pub struct ReconnectStrategy {
    base_delay: Option<Duration>,
    max_delay: Duration,
    max_attempts: Option<u32>,
    pub attempt: u32,
}

impl ReconnectStrategy {
    /// `base_delay` of `None` retries immediately the first time and then
    /// backs off from 100ms.
    pub fn new(base_delay: Option<Duration>, max_delay: Duration, max_attempts: Option<u32>) -> Self {
        Self {
            base_delay,
            max_delay,
            max_attempts,
            attempt: 0,
        }
    }

    #[cfg(test)]
    fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn exhausted(&self) -> bool {
        self.max_attempts
            .is_some_and(|max| self.attempt >= max)
    }

    /// Sleeps for the next backoff step. Returns `false` without sleeping
    /// once the attempt budget is spent.
    pub async fn wait_before_retry(&mut self) -> bool {
        if self.exhausted() {
            return false;
        }
        self.attempt += 1;
        let delay = self.calculate_delay();
        tracing::info!(
            "Reconnect attempt {} - waiting {:?}",
            self.attempt,
            delay
        );
        sleep(delay).await;
        true
    }

    pub fn calculate_delay(&self) -> Duration {
        let base = self.base_delay.unwrap_or(Duration::ZERO);
        if self.attempt <= 1 {
            return base.min(self.max_delay);
        }
        let step = base.max(MIN_BACKOFF_STEP);
        let exponential_delay = step * 2u32.pow(self.attempt.saturating_sub(1).min(7));
        exponential_delay.min(self.max_delay)
    }
}
