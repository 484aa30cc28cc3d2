use std::time::Duration;

/// Capped exponential backoff shared by every component of one invocation.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: u32,
    /// Fraction of the computed delay added at random (0.0 disables).
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(10),
            multiplier: 2,
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    #[must_use]
    pub fn with_initial_backoff(mut self, initial_backoff: Duration) -> Self {
        self.initial_backoff = initial_backoff;
        self
    }

    #[must_use]
    pub fn without_jitter(mut self) -> Self {
        self.jitter = 0.0;
        self
    }

    /// Delay before retry number `attempt` (1-based). An upstream hint
    /// (`Retry-After`) replaces the computed delay but is still capped.
    pub fn backoff(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        if let Some(hint) = hint {
            return hint.min(self.max_backoff);
        }

        let exp = attempt.saturating_sub(1).min(16);
        let base = self
            .initial_backoff
            .saturating_mul(self.multiplier.saturating_pow(exp))
            .min(self.max_backoff);

        if self.jitter <= 0.0 {
            return base;
        }
        let spread = base.mul_f64(self.jitter);
        let mut raw = [0u8; 4];
        rand::fill(&mut raw);
        let extra = f64::from(u32::from_le_bytes(raw)) / f64::from(u32::MAX);
        (base + spread.mul_f64(extra)).min(self.max_backoff)
    }

    /// Whether another attempt is allowed after `attempt` attempts were made.
    pub fn allows_another(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}
