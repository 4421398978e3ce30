//! Pre-request throttling for API traffic.
//!
//! Every API request first sleeps for a uniformly random jitter, then waits
//! for admission through a sliding-window [`RateLimiter`]. Requests that
//! exceed the window queue up; they are never rejected.
//!
//! One [`Throttle`] belongs to one pipeline, so separate clients never share
//! throttle state.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use rand::Rng;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use crate::config::ThrottleConfig;

/// Warning threshold for cumulative rate-limit delay (30 seconds).
const CUMULATIVE_DELAY_WARNING_THRESHOLD: Duration = Duration::from_secs(30);

/// Sliding-window limiter: at most `limit` admissions in any `interval`.
///
/// The admission lock is held across the wait, so waiters are admitted in
/// arrival order and spaced out.
#[derive(Debug)]
pub struct RateLimiter {
    limit: usize,
    interval: Duration,
    admissions: Mutex<VecDeque<Instant>>,
    cumulative_delay_ms: AtomicU64,
}

impl RateLimiter {
    /// Creates a limiter admitting `limit` requests per `interval`.
    ///
    /// A `limit` of zero is treated as one.
    #[must_use]
    pub fn new(limit: u32, interval: Duration) -> Self {
        let limit = usize::try_from(limit.max(1)).unwrap_or(usize::MAX);
        Self {
            limit,
            interval,
            admissions: Mutex::new(VecDeque::with_capacity(limit.min(64))),
            cumulative_delay_ms: AtomicU64::new(0),
        }
    }

    /// Requests admitted per window.
    #[must_use]
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Window length.
    #[must_use]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Total time callers have spent waiting for admission.
    #[must_use]
    pub fn cumulative_delay(&self) -> Duration {
        Duration::from_millis(self.cumulative_delay_ms.load(Ordering::Relaxed))
    }

    /// Waits until a request may be sent, then records its admission.
    #[instrument(level = "debug", skip(self))]
    pub async fn acquire(&self) {
        let mut admissions = self.admissions.lock().await;

        let now = Instant::now();
        while admissions
            .front()
            .is_some_and(|admitted| now.duration_since(*admitted) >= self.interval)
        {
            admissions.pop_front();
        }

        if admissions.len() >= self.limit
            && let Some(oldest) = admissions.pop_front()
        {
            let ready_at = oldest + self.interval;
            let delay = ready_at.saturating_duration_since(now);
            let cumulative = self.add_cumulative_delay(delay);
            debug!(
                delay_ms = delay.as_millis(),
                cumulative_ms = cumulative.as_millis(),
                "applying rate limit delay"
            );
            if cumulative >= CUMULATIVE_DELAY_WARNING_THRESHOLD
                && cumulative.saturating_sub(delay) < CUMULATIVE_DELAY_WARNING_THRESHOLD
            {
                warn!(
                    cumulative_delay_secs = cumulative.as_secs(),
                    "excessive rate limiting - consider reducing request volume"
                );
            }
            tokio::time::sleep_until(ready_at).await;
        }

        admissions.push_back(Instant::now());
    }

    #[allow(clippy::cast_possible_truncation)]
    fn add_cumulative_delay(&self, delay: Duration) -> Duration {
        let delay_ms = delay.as_millis() as u64;
        let total = self
            .cumulative_delay_ms
            .fetch_add(delay_ms, Ordering::Relaxed)
            + delay_ms;
        Duration::from_millis(total)
    }
}

/// Random jitter followed by rate-limit admission.
#[derive(Debug)]
pub struct Throttle {
    jitter_min: Duration,
    jitter_max: Duration,
    limiter: RateLimiter,
}

impl Throttle {
    /// Builds a throttle from configuration; `None` when throttling is disabled.
    #[must_use]
    pub fn from_config(config: &ThrottleConfig) -> Option<Self> {
        if !config.enabled {
            debug!("request throttle disabled");
            return None;
        }
        Some(Self {
            jitter_min: config.jitter_min,
            jitter_max: config.jitter_max.max(config.jitter_min),
            limiter: RateLimiter::new(config.limit, config.interval),
        })
    }

    /// The underlying rate limiter.
    #[must_use]
    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Jitter, then admission. Applied to every fresh API request.
    pub async fn before_request(&self) {
        let jitter = self.sample_jitter();
        if !jitter.is_zero() {
            debug!(jitter_ms = jitter.as_millis(), "applying request jitter");
            tokio::time::sleep(jitter).await;
        }
        self.limiter.acquire().await;
    }

    /// Admission only. Applied to the single retry after reauthentication.
    pub async fn before_retry(&self) {
        self.limiter.acquire().await;
    }

    #[allow(clippy::cast_possible_truncation)]
    fn sample_jitter(&self) -> Duration {
        let min_ms = self.jitter_min.as_millis() as u64;
        let max_ms = self.jitter_max.as_millis() as u64;
        if max_ms <= min_ms {
            return Duration::from_millis(min_ms);
        }
        Duration::from_millis(rand::thread_rng().gen_range(min_ms..=max_ms))
    }
}
