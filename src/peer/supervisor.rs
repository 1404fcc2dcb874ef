use std::time::Duration;

/// `min(base * 2^(attempt-1), cap)` for a 1-based attempt number
pub fn exponential_delay(base: Duration, attempt: u32, cap: Duration) -> Duration {
    let shift = attempt.saturating_sub(1).min(31);
    base.saturating_mul(1u32 << shift).min(cap)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(1000),
            cap: Duration::from_millis(30_000),
            max_attempts: 6,
        }
    }
}

impl ReconnectPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        exponential_delay(self.base, attempt, self.cap)
    }
}

/// Bounded attempt counter. A success resets it to zero.
#[derive(Debug, Clone)]
pub struct ReconnectSupervisor {
    policy: ReconnectPolicy,
    attempts: u32,
}

impl ReconnectSupervisor {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self { policy, attempts: 0 }
    }

    /// Delay before the next attempt, or `None` once the budget is spent
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts >= self.policy.max_attempts {
            return None;
        }
        self.attempts += 1;
        Some(self.policy.delay_for(self.attempts))
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.policy.max_attempts
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }
}
