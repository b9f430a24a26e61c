//! Per-job pacing: sleep just long enough after each chunk that the average
//! rate since the window start stays at or under the governor's limit.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::bandwidth::{BandwidthGovernor, RateLimit};
use crate::control::AbortHandle;

/// How often the governor is asked again (time windows move).
const LIMIT_RECHECK: Duration = Duration::from_secs(1);
/// Accounting restarts after this long without owed sleep, so an idle
/// stretch does not buy a later burst.
const WINDOW: Duration = Duration::from_secs(2);
/// Blocking sleeps are sliced so aborts are seen promptly.
const BLOCKING_SLICE: Duration = Duration::from_millis(50);

/// Sleep owed after `bytes` in `elapsed` at `limit`.
pub fn delay_for(bytes: u64, elapsed: Duration, limit: RateLimit) -> Duration {
    match limit {
        RateLimit::Unlimited => Duration::ZERO,
        RateLimit::BytesPerSec(rate) => {
            let expected = Duration::from_secs_f64(bytes as f64 / rate as f64);
            expected.saturating_sub(elapsed)
        }
    }
}

pub struct Throttle {
    governor: Arc<BandwidthGovernor>,
    owner: String,
    limit: RateLimit,
    checked_at: Instant,
    window_start: Instant,
    window_bytes: u64,
}

impl Throttle {
    pub fn new(governor: Arc<BandwidthGovernor>, owner: &str) -> Self {
        let limit = governor.current_limit(owner);
        let now = Instant::now();
        Self {
            governor,
            owner: owner.to_string(),
            limit,
            checked_at: now,
            window_start: now,
            window_bytes: 0,
        }
    }

    pub fn limit(&self) -> RateLimit {
        self.limit
    }

    /// Account for `n` bytes and return the sleep now owed.
    pub fn consume(&mut self, n: u64) -> Duration {
        let now = Instant::now();
        if now.duration_since(self.checked_at) >= LIMIT_RECHECK {
            self.checked_at = now;
            let limit = self.governor.current_limit(&self.owner);
            if limit != self.limit {
                tracing::debug!(owner = %self.owner, from = %self.limit, to = %limit, "rate limit changed");
                self.limit = limit;
                self.reset(now);
            }
        }
        let elapsed = now.duration_since(self.window_start);
        if elapsed >= WINDOW && delay_for(self.window_bytes, elapsed, self.limit).is_zero() {
            self.reset(now);
        }
        self.window_bytes += n;
        delay_for(self.window_bytes, now.duration_since(self.window_start), self.limit)
    }

    fn reset(&mut self, now: Instant) {
        self.window_start = now;
        self.window_bytes = 0;
    }

    /// Async pacing. Returns false if aborted while sleeping.
    pub async fn pace(&mut self, n: u64, abort: &AbortHandle) -> bool {
        let delay = self.consume(n);
        if delay.is_zero() {
            return true;
        }
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = abort.aborted() => false,
        }
    }

    /// Blocking pacing for transports on a blocking thread.
    pub fn pace_blocking(&mut self, n: u64, abort: &AbortHandle) -> bool {
        let mut remaining = self.consume(n);
        while !remaining.is_zero() {
            if abort.is_aborted() {
                return false;
            }
            let step = remaining.min(BLOCKING_SLICE);
            std::thread::sleep(step);
            remaining -= step;
        }
        !abort.is_aborted()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bandwidth::BandwidthProfile;
    use std::collections::HashMap;

    #[test]
    fn unlimited_never_sleeps() {
        assert_eq!(
            delay_for(u64::MAX, Duration::ZERO, RateLimit::Unlimited),
            Duration::ZERO
        );
    }

    #[test]
    fn delay_covers_the_deficit() {
        let d = delay_for(1000, Duration::from_millis(250), RateLimit::BytesPerSec(1000));
        assert_eq!(d, Duration::from_millis(750));
        assert_eq!(
            delay_for(1000, Duration::from_secs(2), RateLimit::BytesPerSec(1000)),
            Duration::ZERO
        );
    }

    #[test]
    fn throttle_uses_owner_profile() {
        let gov = Arc::new(BandwidthGovernor::new(
            BandwidthProfile::default(),
            HashMap::from([("slow".to_string(), BandwidthProfile::fixed(1000))]),
        ));
        let mut fast = Throttle::new(gov.clone(), "other");
        assert_eq!(fast.consume(1_000_000), Duration::ZERO);
        let mut slow = Throttle::new(gov, "slow");
        assert_eq!(slow.limit(), RateLimit::BytesPerSec(1000));
        let d = slow.consume(500);
        assert!(d > Duration::from_millis(400) && d <= Duration::from_millis(500));
    }

    #[tokio::test]
    async fn pace_stops_on_abort() {
        let gov = Arc::new(BandwidthGovernor::new(BandwidthProfile::fixed(1), HashMap::new()));
        let mut t = Throttle::new(gov, "");
        let abort = AbortHandle::new();
        abort.abort(crate::control::AbortReason::Pause);
        assert!(!t.pace(10, &abort).await);
        assert!(!t.pace_blocking(10, &abort));
    }
}
