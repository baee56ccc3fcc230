//! Per-host request pacing for source API calls.
//!
//! Each host gets a reservation clock: a caller takes the next free slot,
//! advances the clock by the configured spacing and sleeps until its slot.
//! Hosts are independent, and a server `Retry-After` pushes the host's clock
//! forward for everyone.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use harvester_core::download::RateLimiter;
//!
//! # async fn example() {
//! let limiter = RateLimiter::new(Duration::from_millis(250));
//! limiter.acquire("https://api.example/v1/patreon/user/1/posts").await;
//! limiter.acquire("https://api.example/v1/patreon/user/2/posts").await; // waits ~250ms
//! # }
//! ```

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use super::constants::MAX_RETRY_AFTER;

/// Per-host request spacing shared by every producer task.
#[derive(Debug)]
pub struct RateLimiter {
    spacing: Duration,
    hosts: DashMap<String, HostClock>,
}

#[derive(Debug)]
struct HostClock {
    next_slot: Mutex<Option<Instant>>,
}

impl HostClock {
    fn new() -> Self {
        Self {
            next_slot: Mutex::new(None),
        }
    }

    /// Reserves the next slot and returns it.
    fn reserve(&self, spacing: Duration) -> Instant {
        let now = Instant::now();
        let mut next = self
            .next_slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let slot = next.map_or(now, |at| at.max(now));
        *next = Some(slot + spacing);
        slot
    }

    fn defer_until(&self, at: Instant) {
        let mut next = self
            .next_slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *next = Some(next.map_or(at, |current| current.max(at)));
    }
}

impl RateLimiter {
    /// Creates a limiter spacing requests to one host by `spacing`.
    #[must_use]
    pub fn new(spacing: Duration) -> Self {
        Self {
            spacing,
            hosts: DashMap::new(),
        }
    }

    /// Creates a limiter that never waits unless a server asks it to.
    #[must_use]
    pub fn unpaced() -> Self {
        Self::new(Duration::ZERO)
    }

    /// Configured spacing.
    #[must_use]
    pub fn spacing(&self) -> Duration {
        self.spacing
    }

    /// Waits for this host's next free slot.
    ///
    /// The first request to a host proceeds immediately.
    #[instrument(skip(self), fields(host))]
    pub async fn acquire(&self, url: &str) {
        let host = extract_domain(url);
        tracing::Span::current().record("host", host.as_str());

        let slot = self
            .hosts
            .entry(host)
            .or_insert_with(HostClock::new)
            .reserve(self.spacing);

        let wait = slot.saturating_duration_since(Instant::now());
        if !wait.is_zero() {
            debug!(delay_ms = wait.as_millis(), "pacing request");
            tokio::time::sleep_until(slot).await;
        }
    }

    /// Blocks the URL's host for `delay`, as demanded by the server.
    pub fn record_rate_limit(&self, url: &str, delay: Duration) {
        let host = extract_domain(url);
        let delay = delay.min(MAX_RETRY_AFTER);
        warn!(
            host = %host,
            delay_secs = delay.as_secs(),
            "server rate limit, deferring requests"
        );
        self.hosts
            .entry(host)
            .or_insert_with(HostClock::new)
            .defer_until(Instant::now() + delay);
    }
}

/// Extracts the lowercase host of a URL, or `"unknown"`.
///
/// ```
/// use harvester_core::download::extract_domain;
///
/// assert_eq!(extract_domain("https://API.Example/v1"), "api.example");
/// assert_eq!(extract_domain("not a url"), "unknown");
/// ```
#[must_use]
pub fn extract_domain(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_lowercase))
        .unwrap_or_else(|| "unknown".to_string())
}

/// Parses a `Retry-After` value (seconds or HTTP-date) into a delay.
///
/// Negative and unparseable values yield `None`; past dates yield zero;
/// values above one hour are capped.
///
/// ```
/// use std::time::Duration;
/// use harvester_core::download::parse_retry_after;
///
/// assert_eq!(parse_retry_after("120"), Some(Duration::from_secs(120)));
/// assert_eq!(parse_retry_after("soon"), None);
/// ```
#[must_use]
pub fn parse_retry_after(header_value: &str) -> Option<Duration> {
    let header_value = header_value.trim();

    if let Ok(seconds) = header_value.parse::<i64>() {
        let seconds = u64::try_from(seconds).ok()?;
        return Some(Duration::from_secs(seconds).min(MAX_RETRY_AFTER));
    }

    let at = httpdate::parse_http_date(header_value).ok()?;
    let delay = at
        .duration_since(std::time::SystemTime::now())
        .unwrap_or(Duration::ZERO);
    Some(delay.min(MAX_RETRY_AFTER))
}
