//! Adaptive throttle and retry policy for the GitHub REST API.
//!
//! One limiter is shared by every caller talking to the same token. Its state
//! is refreshed from the `x-ratelimit-*` headers of each response, so races
//! between callers only affect who sees the newest values.

use std::{
    fmt::Display,
    future::Future,
    sync::{Mutex, MutexGuard, PoisonError},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use chrono::{DateTime, Utc};
use rand::Rng;
use reqwest::header::HeaderMap;
use serde::Serialize;

use crate::error::{
    HEADER_REMAINING, HEADER_RESET, ResponseHeaders, ThrottleSignal, header_str, parse_retry_after,
};

/// Grace added past the reset instant before calls resume.
const RESET_GRACE: Duration = Duration::from_millis(1);

/// Limiter tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Remaining-call count assumed at startup and after a reset window.
    pub default_remaining: u64,
    /// At or below this many remaining calls, every call is slowed down.
    pub low_water_mark: u64,
    /// Delay applied after each call while below the low-water mark.
    pub throttle_delay: Duration,
    /// Base delay for secondary rate limits; jitter of up to the same amount is added.
    pub secondary_base_delay: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            default_remaining: 5000,
            low_water_mark: 100,
            throttle_delay: Duration::from_millis(200),
            secondary_base_delay: Duration::from_millis(5000),
        }
    }
}

/// Snapshot of the limiter state.
///
/// Serializes as `{"remaining", "resetAt" (RFC 3339), "delayMs"}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitStatus {
    pub remaining: u64,
    pub reset_at: DateTime<Utc>,
    pub delay_ms: u64,
}

#[derive(Debug)]
struct RateLimitState {
    remaining: u64,
    reset_at: SystemTime,
    delay: Duration,
}

impl RateLimitState {
    const fn fresh(config: &RateLimitConfig) -> Self {
        Self {
            remaining: config.default_remaining,
            reset_at: UNIX_EPOCH,
            delay: Duration::ZERO,
        }
    }
}

/// What to do after a failed call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RetryPlan {
    /// Sleep, then call again.
    After(Duration),
    /// Call again; `wait_if_needed` sleeps until the quota resets.
    AtReset,
    /// Return the error.
    GiveUp,
}

/// Shared throttle for a quota-limited API.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    state: Mutex<RateLimitState>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}

impl RateLimiter {
    /// Create a limiter.
    #[must_use]
    pub const fn new(config: RateLimitConfig) -> Self {
        Self {
            state: Mutex::new(RateLimitState::fresh(&config)),
            config,
        }
    }

    /// Limiter tuning.
    #[must_use]
    pub const fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    fn state(&self) -> MutexGuard<'_, RateLimitState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current state, for observability.
    #[must_use]
    pub fn status(&self) -> RateLimitStatus {
        let state = self.state();
        RateLimitStatus {
            remaining: state.remaining,
            reset_at: DateTime::<Utc>::from(state.reset_at),
            delay_ms: millis(state.delay),
        }
    }

    /// Forget everything observed so far.
    pub fn reset(&self) {
        *self.state() = RateLimitState::fresh(&self.config);
    }

    /// Record `x-ratelimit-remaining` and `x-ratelimit-reset` from a response.
    ///
    /// Missing or malformed headers leave the corresponding value unchanged.
    pub fn update_from_headers(&self, headers: &HeaderMap) {
        let remaining = header_str(headers, HEADER_REMAINING).and_then(|v| v.parse::<u64>().ok());
        let reset_at = header_str(headers, HEADER_RESET)
            .and_then(|v| v.parse::<i64>().ok())
            .filter(|secs| *secs >= 0)
            .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
            .map(SystemTime::from);

        let mut state = self.state();
        if let Some(reset_at) = reset_at {
            state.reset_at = reset_at;
        }
        if let Some(remaining) = remaining {
            state.remaining = remaining;
            let throttled = remaining <= self.config.low_water_mark;
            let delay = if throttled {
                self.config.throttle_delay
            } else {
                Duration::ZERO
            };
            if delay != state.delay {
                tracing::debug!(remaining, throttled, "rate limit floor delay changed");
            }
            state.delay = delay;
        }
    }

    /// Sleep until the primary window resets if the quota is exhausted.
    pub async fn wait_if_needed(&self) {
        let wait = {
            let state = self.state();
            if state.remaining == 0 {
                state.reset_at.duration_since(SystemTime::now()).ok()
            } else {
                None
            }
        };
        let Some(wait) = wait.filter(|wait| !wait.is_zero()) else {
            return;
        };

        tracing::info!(wait_ms = millis(wait), "rate limit exhausted, waiting for reset");
        tokio::time::sleep(wait + RESET_GRACE).await;

        // Optimistic: the next response corrects this if it is wrong.
        let mut state = self.state();
        state.remaining = self.config.default_remaining;
        state.delay = Duration::ZERO;
    }

    /// Run `call`, pausing for known exhaustion and retrying throttled attempts.
    ///
    /// A 403 is retried when it carries `retry-after` or reports an exhausted
    /// quota with a reset time; any other 403 is returned at once. A 429 is
    /// retried after the secondary base delay plus jitter. Everything else is
    /// returned unchanged. After `max_retries` retries the last error is
    /// returned.
    ///
    /// # Errors
    /// Returns the error of the last attempt.
    pub async fn execute_with_retry<T, E, F, Fut>(&self, mut call: F, max_retries: u32) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        T: ResponseHeaders,
        E: ThrottleSignal + Display,
    {
        let mut retries = 0_u32;
        loop {
            self.wait_if_needed().await;

            let error = match call().await {
                Ok(response) => {
                    self.update_from_headers(response.headers());
                    let delay = self.state().delay;
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    return Ok(response);
                }
                Err(error) => error,
            };

            let delay = match self.plan_retry(&error) {
                RetryPlan::GiveUp => return Err(error),
                RetryPlan::After(delay) => Some(delay),
                RetryPlan::AtReset => None,
            };
            if retries >= max_retries {
                tracing::warn!(retries, %error, "rate limit retries exhausted");
                return Err(error);
            }
            retries += 1;

            if let Some(delay) = delay {
                tracing::warn!(
                    attempt = retries,
                    delay_ms = millis(delay),
                    %error,
                    "rate limited, retrying after delay"
                );
                tokio::time::sleep(delay).await;
            } else {
                tracing::warn!(attempt = retries, %error, "rate limit exhausted, retrying after reset");
            }
        }
    }

    fn plan_retry<E: ThrottleSignal>(&self, error: &E) -> RetryPlan {
        match error.http_status() {
            Some(403) => {
                let Some(headers) = error.response_headers() else {
                    return RetryPlan::GiveUp;
                };
                if let Some(delay) = parse_retry_after(headers) {
                    return RetryPlan::After(delay);
                }
                let exhausted = header_str(headers, HEADER_REMAINING) == Some("0");
                if exhausted && header_str(headers, HEADER_RESET).is_some() {
                    self.update_from_headers(headers);
                    return RetryPlan::AtReset;
                }
                RetryPlan::GiveUp
            }
            Some(429) => RetryPlan::After(self.secondary_delay()),
            _ => RetryPlan::GiveUp,
        }
    }

    fn secondary_delay(&self) -> Duration {
        let base = millis(self.config.secondary_base_delay);
        let jitter = rand::thread_rng().gen_range(0..=base);
        Duration::from_millis(base.saturating_add(jitter))
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
