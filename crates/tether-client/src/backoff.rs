use crate::config::BackoffPolicy;
use std::time::Duration;

/// Reconnect delay schedule. Owned by the connection supervisor so it
/// survives individual attempts; reset after every successful handshake.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    current: Duration,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        let current = policy.base;
        Self { policy, current }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current.min(self.policy.max);
        let grown = (self.current.as_millis() as f64 * self.policy.factor.max(1.0)).round();
        self.current = Duration::from_millis(grown as u64).min(self.policy.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.policy.base;
    }
}
