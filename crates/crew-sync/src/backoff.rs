use rand::Rng;
use std::time::Duration;

/// Exponential reconnect delay: `min(base * 2^failures, cap)`, spread by a
/// random jitter so that the three streams do not reconnect in lockstep.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
    /// Fraction of the nominal delay added or removed at random, in `[0, 1]`.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(30),
            jitter: 0.2,
        }
    }
}

impl BackoffPolicy {
    pub fn floor(&self) -> Duration {
        self.base.min(self.cap)
    }

    pub fn nominal(&self, failures: u32) -> Duration {
        let shift = failures.min(20);
        self.base.saturating_mul(1u32 << shift).min(self.cap)
    }

    pub fn delay_for(&self, failures: u32) -> Duration {
        let nominal = self.nominal(failures);
        let spread = self.jitter.clamp(0.0, 1.0);
        if spread == 0.0 || nominal.is_zero() {
            return nominal;
        }
        let factor = rand::thread_rng().gen_range((1.0 - spread)..=(1.0 + spread));
        nominal.mul_f64(factor).min(self.cap)
    }
}
