use std::time::Duration;

/// Capped exponential backoff policy shared by snapshot retries and stream
/// reconnects.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    pub multiplier: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        // 250ms, 500ms, 1s ... capped at 10s
        Self { base: Duration::from_millis(250), max: Duration::from_secs(10), multiplier: 2.0 }
    }
}

#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    attempt: u32,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Delay before the next attempt; advances the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let scaled = self.policy.base.as_nanos() as f64 * self.policy.multiplier.powi(self.attempt as i32);
        let capped = scaled.min(self.policy.max.as_nanos() as f64);
        self.attempt = self.attempt.saturating_add(1);
        Duration::from_nanos(capped.round() as u64)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_then_caps() {
        let mut b = Backoff::new(BackoffPolicy {
            base: Duration::from_millis(100),
            max: Duration::from_millis(350),
            multiplier: 2.0,
        });
        let got: Vec<u128> = (0..4).map(|_| b.next_delay().as_millis()).collect();
        assert_eq!(got, vec![100, 200, 350, 350]);
        assert_eq!(b.attempt(), 4);
        b.reset();
        assert_eq!(b.next_delay().as_millis(), 100);
    }
}
