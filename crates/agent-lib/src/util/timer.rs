use std::time::{Duration, Instant};

/// Next instant strictly after `now_ms` that sits `offset` past a multiple of `period`
///
/// All values are unix milliseconds.
pub fn next_aligned(now_ms: i64, period: Duration, offset: Duration) -> i64 {
    let period = period.as_millis().max(1) as i64;
    let offset = offset.as_millis() as i64 % period;
    let base = (now_ms - offset).div_euclid(period) * period + offset;
    base + period
}

/// Ticker firing at wall-clock aligned instants (e.g. every minute + 2s)
#[derive(Debug, Clone)]
pub struct AlignedTicker {
    period: Duration,
    offset: Duration,
}

impl AlignedTicker {
    pub fn new(period: Duration, offset: Duration) -> Self {
        Self { period, offset }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Unix milliseconds of the next firing
    pub fn next_fire_ms(&self) -> i64 {
        next_aligned(chrono::Utc::now().timestamp_millis(), self.period, self.offset)
    }

    /// Sleep until the next aligned instant and return it in unix milliseconds
    pub async fn tick(&mut self) -> i64 {
        let now = chrono::Utc::now().timestamp_millis();
        let next = next_aligned(now, self.period, self.offset);
        tokio::time::sleep(Duration::from_millis((next - now).max(0) as u64)).await;
        next
    }
}

/// Leading-edge throttle: the first call in each window passes
#[derive(Debug)]
pub struct ThrottleFirst {
    window: Duration,
    last: Option<Instant>,
}

impl ThrottleFirst {
    pub fn new(window: Duration) -> Self {
        Self { window, last: None }
    }

    /// Returns true when the caller should act now
    pub fn allow(&mut self) -> bool {
        self.allow_at(Instant::now())
    }

    pub fn allow_at(&mut self, now: Instant) -> bool {
        match self.last {
            Some(last) if now.saturating_duration_since(last) < self.window => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_aligned_minute_plus_offset() {
        let minute = Duration::from_secs(60);
        let two = Duration::from_secs(2);

        // 12:00:00.000 -> 12:00:02
        assert_eq!(next_aligned(720_000, minute, two), 722_000);
        // 12:00:02.000 exactly -> next minute
        assert_eq!(next_aligned(722_000, minute, two), 782_000);
        // 12:00:30 -> 12:01:02
        assert_eq!(next_aligned(750_000, minute, two), 782_000);
        // offset 40s
        assert_eq!(next_aligned(750_000, minute, Duration::from_secs(40)), 760_000);
    }

    #[test]
    fn test_throttle_first_window() {
        let mut throttle = ThrottleFirst::new(Duration::from_secs(1));
        let t0 = Instant::now();

        assert!(throttle.allow_at(t0));
        assert!(!throttle.allow_at(t0 + Duration::from_millis(200)));
        assert!(!throttle.allow_at(t0 + Duration::from_millis(999)));
        assert!(throttle.allow_at(t0 + Duration::from_millis(1000)));
        assert!(!throttle.allow_at(t0 + Duration::from_millis(1500)));
    }

    #[tokio::test]
    async fn test_aligned_ticker_fires_on_boundary() {
        let mut ticker = AlignedTicker::new(Duration::from_millis(50), Duration::ZERO);
        let fired = ticker.tick().await;

        assert_eq!(fired % 50, 0);
        assert!(chrono::Utc::now().timestamp_millis() >= fired);
    }
}
