//! Failure classification and retry with exponential backoff.
//!
//! Every error is mapped to a closed [`ErrorKind`]. Only kinds for which
//! [`ErrorKind::is_transient`] holds are retried; the rest fail immediately.
//!
//! # Example
//!
//! ```
//! use harvester_core::download::{DownloadError, ErrorKind, RetryDecision, RetryPolicy, classify_error};
//!
//! let policy = RetryPolicy::default();
//! let error = DownloadError::http_status("https://files.example/a.png", 503);
//! let kind = classify_error(&error);
//! assert_eq!(kind, ErrorKind::ServerError);
//! assert!(matches!(policy.should_retry(kind, 1), RetryDecision::Retry { .. }));
//! ```

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, instrument, warn};

use super::DownloadError;
use super::rate_limiter::parse_retry_after;
use crate::pipeline::PipelineState;

/// Default number of attempts, including the first.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Default delay before the first retry.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(4);

/// Default upper bound of the exponential part of the delay.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(10);

/// Default upper bound of the random jitter added to each delay.
pub const DEFAULT_MAX_JITTER: Duration = Duration::from_secs(2);

const DEFAULT_BACKOFF_MULTIPLIER: f32 = 2.0;

/// Closed classification of failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Request or body read timed out.
    Timeout,
    /// Peer reset the connection.
    ConnectionReset,
    /// Connection could not be established or dropped mid-request.
    Disconnected,
    /// Body ended early or could not be read.
    Payload,
    /// Proxy refused or failed the request.
    Proxy,
    /// TLS handshake failed.
    Handshake,
    /// HTTP 5xx or 408.
    ServerError,
    /// HTTP 429.
    RateLimited,
    /// HTTP 4xx other than auth, 408 and 429.
    ClientError,
    /// HTTP 401, 403 or 407.
    NeedsAuth,
    /// Malformed URL.
    InvalidUrl,
    /// Malformed listing response.
    Decode,
    /// Local filesystem failure.
    Io,
    /// Body size differs from the advertised length.
    Integrity,
    /// Pipeline halted mid-operation.
    Interrupted,
    /// Transient failures outlasted the retry budget.
    RetryExhausted,
}

impl ErrorKind {
    /// Returns true for failures that may succeed when retried.
    #[must_use]
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            Self::Timeout
                | Self::ConnectionReset
                | Self::Disconnected
                | Self::Payload
                | Self::Proxy
                | Self::Handshake
                | Self::ServerError
                | Self::RateLimited
                | Self::Integrity
        )
    }

    /// Returns true for failures that are an ordinary part of talking to
    /// remote hosts and are logged as warnings rather than errors.
    #[must_use]
    pub fn is_expected_transport(self) -> bool {
        self.is_transient() || matches!(self, Self::RetryExhausted | Self::Interrupted)
    }
}

/// Decision on whether to retry a failed operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after `delay`; `attempt` is the number of the next attempt.
    Retry {
        /// How long to wait first.
        delay: Duration,
        /// 1-indexed number of the upcoming attempt.
        attempt: u32,
    },
    /// Give up.
    DoNotRetry {
        /// Human-readable reason.
        reason: String,
    },
}

/// Bounded exponential backoff with jitter.
///
/// ```text
/// delay = min(base_delay * multiplier^(attempt-1), max_delay) + rand(0..=max_jitter)
/// ```
///
/// With defaults the waits are roughly 4s, 8s, 10s, 10s plus up to 2s each.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    backoff_multiplier: f32,
    max_jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            max_jitter: DEFAULT_MAX_JITTER,
        }
    }
}

impl RetryPolicy {
    /// Creates a policy; `max_attempts` is raised to at least 1.
    #[must_use]
    pub fn new(
        max_attempts: u32,
        base_delay: Duration,
        max_delay: Duration,
        backoff_multiplier: f32,
    ) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
            backoff_multiplier,
            max_jitter: DEFAULT_MAX_JITTER,
        }
    }

    /// Creates a default policy with a custom attempt count.
    #[must_use]
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }

    /// Replaces the jitter bound.
    #[must_use]
    pub fn with_max_jitter(mut self, max_jitter: Duration) -> Self {
        self.max_jitter = max_jitter;
        self
    }

    /// Maximum number of attempts, including the first.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Decides what to do after attempt number `attempt` failed with `kind`.
    #[instrument(skip(self), fields(max_attempts = self.max_attempts))]
    pub fn should_retry(&self, kind: ErrorKind, attempt: u32) -> RetryDecision {
        if !kind.is_transient() {
            return RetryDecision::DoNotRetry {
                reason: format!("{kind:?} is not transient"),
            };
        }

        if attempt >= self.max_attempts {
            debug!(attempt, max = self.max_attempts, "max attempts reached");
            return RetryDecision::DoNotRetry {
                reason: format!("max attempts ({}) exhausted", self.max_attempts),
            };
        }

        let delay = self.calculate_delay(attempt);
        debug!(
            attempt,
            next_attempt = attempt + 1,
            delay_ms = delay.as_millis(),
            "will retry"
        );
        RetryDecision::Retry {
            delay,
            attempt: attempt + 1,
        }
    }

    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    fn calculate_delay(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as f64;
        let exponent = f64::from(attempt.saturating_sub(1));
        let delay_ms = base_ms * f64::from(self.backoff_multiplier).powf(exponent);
        let capped_ms = delay_ms.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped_ms as u64) + self.calculate_jitter()
    }

    #[allow(clippy::cast_possible_truncation)]
    fn calculate_jitter(&self) -> Duration {
        let max_ms = self.max_jitter.as_millis() as u64;
        if max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
    }
}

/// Classifies an error for retry and logging decisions.
#[must_use]
pub fn classify_error(error: &DownloadError) -> ErrorKind {
    match error {
        DownloadError::Network { source, .. } => classify_transport(source),
        DownloadError::Timeout { .. } => ErrorKind::Timeout,
        DownloadError::HttpStatus { status, .. } => classify_http_status(*status),
        DownloadError::Io { .. } => ErrorKind::Io,
        DownloadError::InvalidUrl { .. } => ErrorKind::InvalidUrl,
        DownloadError::Integrity { .. } => ErrorKind::Integrity,
        DownloadError::Decode { .. } => ErrorKind::Decode,
        DownloadError::Interrupted { .. } => ErrorKind::Interrupted,
        DownloadError::RetryExhausted { .. } => ErrorKind::RetryExhausted,
    }
}

#[allow(clippy::match_same_arms)]
fn classify_http_status(status: u16) -> ErrorKind {
    match status {
        401 | 403 | 407 => ErrorKind::NeedsAuth,
        408 => ErrorKind::ServerError,
        429 => ErrorKind::RateLimited,
        400..=499 => ErrorKind::ClientError,
        500..=599 => ErrorKind::ServerError,
        _ => ErrorKind::ClientError,
    }
}

fn classify_transport(error: &reqwest::Error) -> ErrorKind {
    if error.is_timeout() {
        return ErrorKind::Timeout;
    }
    if error.is_body() || error.is_decode() {
        return ErrorKind::Payload;
    }
    if error.is_builder() {
        return ErrorKind::InvalidUrl;
    }
    classify_transport_message(&format!("{error:?}"))
}

/// Maps a transport error's debug chain to a kind.
///
/// Client errors hide the io/TLS cause behind opaque wrappers, so the chain's
/// text is the only portable signal.
fn classify_transport_message(chain: &str) -> ErrorKind {
    let lower = chain.to_lowercase();
    if lower.contains("proxy") {
        ErrorKind::Proxy
    } else if lower.contains("certificate")
        || lower.contains("handshake")
        || lower.contains("tls")
        || lower.contains("ssl")
    {
        ErrorKind::Handshake
    } else if lower.contains("reset") || lower.contains("broken pipe") {
        ErrorKind::ConnectionReset
    } else {
        ErrorKind::Disconnected
    }
}

/// Runs `operation` until it succeeds, fails permanently, or the attempt
/// budget is spent.
///
/// Backoff sleeps end early when the pipeline halts, yielding
/// [`DownloadError::Interrupted`]. A server `Retry-After` longer than the
/// computed backoff replaces it. Exhausting the budget on a transient failure
/// yields [`DownloadError::RetryExhausted`].
///
/// # Errors
///
/// Returns the permanent error, the interruption, or the exhaustion.
pub async fn retry_with_policy<T, F, Fut>(
    policy: &RetryPolicy,
    state: &PipelineState,
    url: &str,
    mut operation: F,
) -> Result<T, DownloadError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, DownloadError>>,
{
    let mut attempt = 1;
    loop {
        if state.is_halted() {
            return Err(DownloadError::interrupted(url));
        }
        let error = match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };

        let kind = classify_error(&error);
        match policy.should_retry(kind, attempt) {
            RetryDecision::Retry {
                delay,
                attempt: next,
            } => {
                let delay = error
                    .retry_after()
                    .and_then(parse_retry_after)
                    .map_or(delay, |server| server.max(delay));
                warn!(
                    url,
                    attempt,
                    ?kind,
                    delay_ms = delay.as_millis(),
                    error = %error,
                    "transient failure, retrying"
                );
                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    () = state.halted() => return Err(DownloadError::interrupted(url)),
                }
                attempt = next;
            }
            RetryDecision::DoNotRetry { reason } => {
                debug!(url, attempt, reason, "not retrying");
                if kind.is_transient() {
                    return Err(DownloadError::retry_exhausted(url, attempt, &error));
                }
                return Err(error);
            }
        }
    }
}
