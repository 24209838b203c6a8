use std::time::Duration;

/// Linearly increasing delay: `min(step * attempt, cap)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinearBackoff {
    pub step: Duration,
    pub cap: Duration,
}

impl LinearBackoff {
    pub fn new(step: Duration, cap: Duration) -> Self {
        Self { step, cap }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        self.step.saturating_mul(attempt).min(self.cap)
    }
}
