use rand::Rng;
use std::time::Duration;

/// Exponential backoff with multiplicative jitter
#[derive(Debug, Clone)]
pub struct Backoff {
    current: Duration,
    max: Duration,
    factor: f64,
    jitter: f64,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            current: initial,
            max,
            factor: 2.0,
            jitter: 0.0,
        }
    }

    /// 50ms doubling up to 1s with 20% jitter
    pub fn sync_wait() -> Self {
        Self::new(Duration::from_millis(50), Duration::from_secs(1)).with_jitter(0.2)
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay to wait now; advances the backoff
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current;
        self.current = self.current.mul_f64(self.factor).min(self.max);
        if self.jitter > 0.0 {
            let extra = rand::thread_rng().gen_range(0.0..=self.jitter);
            base.mul_f64(1.0 + extra)
        } else {
            base
        }
    }
}
