use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy)]
struct LimiterState {
    backoff: Duration,
    next_allowed_at: Instant,
}

/// Adaptive backoff for the quota-limited search API.
///
/// Only this type mutates its state. One instance is shared by every
/// `web_search` call that goes through the same `ToolState`.
#[derive(Debug)]
pub struct SearchRateLimiter {
    base_delay: Duration,
    max_delay: Duration,
    state: Mutex<LimiterState>,
}

impl SearchRateLimiter {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay: max_delay.max(base_delay),
            state: Mutex::new(LimiterState {
                backoff: Duration::ZERO,
                next_allowed_at: Instant::now(),
            }),
        }
    }

    pub fn backoff(&self) -> Duration {
        self.lock().backoff
    }

    /// Sleep until the next call is allowed. No-op when already past.
    pub async fn wait(&self) {
        let next = self.lock().next_allowed_at;
        if next > Instant::now() {
            debug!(delay_ms = (next - Instant::now()).as_millis() as u64, "search throttled");
            tokio::time::sleep_until(next).await;
        }
    }

    /// Record a 429. `retry_after` is the raw `Retry-After` header value.
    pub fn on_429(&self, retry_after: Option<&str>) {
        let hinted = retry_after.and_then(parse_retry_after);
        let mut state = self.lock();
        state.backoff = match hinted {
            Some(delay) => state.backoff.max(delay).min(self.max_delay),
            None if state.backoff.is_zero() => self.base_delay,
            None => (state.backoff * 2).min(self.max_delay),
        };
        state.next_allowed_at = Instant::now() + state.backoff;
        warn!(
            backoff_ms = state.backoff.as_millis() as u64,
            hinted = hinted.is_some(),
            "search rate limited"
        );
    }

    /// Decay the penalty after a successful call.
    pub fn on_success(&self) {
        let mut state = self.lock();
        if state.backoff.is_zero() {
            return;
        }
        state.backoff /= 2;
        state.next_allowed_at = Instant::now() + state.backoff;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LimiterState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// `Retry-After` is either delta-seconds or an HTTP date.
fn parse_retry_after(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    if let Ok(secs) = raw.parse::<f64>() {
        if !secs.is_finite() || secs < 0.0 {
            return None;
        }
        // Saturate oversized hints; `on_429` caps them at the maximum delay.
        return Some(Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX));
    }
    let when = DateTime::parse_from_rfc2822(raw).ok()?.with_timezone(&Utc);
    (when - Utc::now()).to_std().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter() -> SearchRateLimiter {
        SearchRateLimiter::new(Duration::from_millis(1_000), Duration::from_millis(8_000))
    }

    #[test]
    fn test_parse_retry_after_forms() {
        assert_eq!(parse_retry_after("5"), Some(Duration::from_secs(5)));
        assert_eq!(parse_retry_after(" 1.5 "), Some(Duration::from_millis(1_500)));
        assert_eq!(parse_retry_after("-1"), None);
        assert_eq!(parse_retry_after("soon"), None);
        // A date in the past yields no usable delay.
        assert_eq!(parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_429_without_hint_grows_and_caps() {
        let rl = limiter();
        rl.on_429(None);
        assert_eq!(rl.backoff(), Duration::from_millis(1_000));
        let mut previous = rl.backoff();
        for _ in 0..6 {
            rl.on_429(None);
            let current = rl.backoff();
            assert!(current > previous || current == Duration::from_millis(8_000));
            previous = current;
        }
        assert_eq!(rl.backoff(), Duration::from_millis(8_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_halves_or_stays_zero() {
        let rl = limiter();
        rl.on_success();
        assert_eq!(rl.backoff(), Duration::ZERO);

        rl.on_429(None);
        rl.on_429(None);
        assert_eq!(rl.backoff(), Duration::from_millis(2_000));
        rl.on_success();
        assert_eq!(rl.backoff(), Duration::from_millis(1_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_hint_blocks_next_wait() {
        let rl = SearchRateLimiter::new(Duration::from_millis(1_000), Duration::from_secs(60));
        rl.on_429(Some("5"));
        assert_eq!(rl.backoff(), Duration::from_secs(5));

        let start = Instant::now();
        rl.wait().await;
        let waited = start.elapsed();
        assert!(waited >= Duration::from_millis(4_990), "waited {:?}", waited);
        assert!(waited <= Duration::from_millis(5_100), "waited {:?}", waited);

        rl.on_success();
        assert_eq!(rl.backoff(), Duration::from_millis(2_500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hint_never_lowers_existing_backoff() {
        let rl = limiter();
        for _ in 0..3 {
            rl.on_429(None);
        }
        assert_eq!(rl.backoff(), Duration::from_millis(4_000));
        rl.on_429(Some("1"));
        assert_eq!(rl.backoff(), Duration::from_millis(4_000));
        rl.on_429(Some("120"));
        assert_eq!(rl.backoff(), Duration::from_millis(8_000));
    }

    #[test]
    fn test_oversized_retry_after_saturates() {
        assert_eq!(parse_retry_after("1e30"), Some(Duration::MAX));
        assert_eq!(
            parse_retry_after("99999999999999999999999"),
            Some(Duration::MAX)
        );
        assert_eq!(parse_retry_after("NaN"), None);
        assert_eq!(parse_retry_after("inf"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_absurd_hint_is_capped_at_max_delay() {
        let rl = SearchRateLimiter::new(Duration::from_millis(1_000), Duration::from_secs(60));
        rl.on_429(Some("1e30"));
        assert_eq!(rl.backoff(), Duration::from_secs(60));
        rl.on_429(Some("99999999999999999999999"));
        assert_eq!(rl.backoff(), Duration::from_secs(60));

        let start = Instant::now();
        rl.wait().await;
        assert!(start.elapsed() <= Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_is_noop_when_clear() {
        let rl = limiter();
        let start = Instant::now();
        rl.wait().await;
        assert_eq!(start.elapsed(), Duration::ZERO);
    }
}
