use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub backoff_multiplier: f64,
    pub max_retry_delay: Duration,
    /// Jitter as a percentage of the computed delay (0-100).
    pub jitter_pct: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_millis(1000),
            backoff_multiplier: 2.0,
            max_retry_delay: Duration::from_secs(30),
            jitter_pct: 20,
        }
    }
}

impl RetryConfig {
    pub fn backoff(&self) -> Backoff {
        Backoff {
            config: self.clone(),
            next: self.retry_delay,
            attempts: 0,
        }
    }
}

/// Exponential backoff state for one run of retries.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: RetryConfig,
    next: Duration,
    attempts: u32,
}

impl Backoff {
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn exhausted(&self) -> bool {
        self.attempts >= self.config.max_retries
    }

    /// Delay to sleep before the next attempt, jitter included.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.next;
        self.attempts += 1;
        self.next = Duration::from_secs_f64(
            (base.as_secs_f64() * self.config.backoff_multiplier)
                .min(self.config.max_retry_delay.as_secs_f64()),
        );

        let jitter_pct = self.config.jitter_pct.min(100) as u64;
        let base_ms = base.as_millis() as u64;
        let max_jitter = base_ms * jitter_pct / 100;
        if max_jitter == 0 {
            return base;
        }
        let jitter = rand::thread_rng().gen_range(0..=max_jitter);
        Duration::from_millis(base_ms + jitter)
    }

    pub fn reset(&mut self) {
        self.next = self.config.retry_delay;
        self.attempts = 0;
    }
}
