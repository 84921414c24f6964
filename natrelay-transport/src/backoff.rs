use std::time::Duration;

/// Capped exponential backoff with a bounded number of attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl Backoff {
    pub const fn new(base: Duration, cap: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            cap,
            max_attempts,
        }
    }

    /// `min(base * 2^exponent, cap)`
    pub fn delay(&self, exponent: u32) -> Duration {
        let factor = 2u32.checked_pow(exponent).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .map_or(self.cap, |d| d.min(self.cap))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k9::assert_equal;

    #[test]
    fn delay_doubles_until_cap() {
        let backoff = Backoff::new(Duration::from_millis(1000), Duration::from_millis(30_000), 10);
        let delays: Vec<u64> = (0..7).map(|n| backoff.delay(n).as_millis() as u64).collect();
        assert_equal!(delays, vec![1000, 2000, 4000, 8000, 16_000, 30_000, 30_000]);
    }

    #[test]
    fn huge_exponent_saturates_at_cap() {
        let backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(10), 10);
        assert_equal!(backoff.delay(64), Duration::from_secs(10));
    }
}
