//! API errors and the signals the rate limiter reads from them.

use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::header::HeaderMap;
use thiserror::Error;

/// Remaining requests in the current primary window.
pub const HEADER_REMAINING: &str = "x-ratelimit-remaining";
/// Unix time (seconds) at which the primary window resets.
pub const HEADER_RESET: &str = "x-ratelimit-reset";
/// Seconds (or HTTP date) to wait before retrying.
pub const HEADER_RETRY_AFTER: &str = "retry-after";

const ERROR_BODY_LIMIT: usize = 800;

/// Error returned by a GitHub API call.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("GitHub API returned status {status}: {message}")]
    Status {
        status: u16,
        headers: HeaderMap,
        message: String,
    },
    #[error("GitHub API request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("Invalid GitHub token: {0}")]
    InvalidToken(#[from] reqwest::header::InvalidHeaderValue),
}

impl ApiError {
    /// Build a status error.
    #[must_use]
    pub fn status(status: u16, headers: HeaderMap, message: impl Into<String>) -> Self {
        Self::Status {
            status,
            headers,
            message: message.into(),
        }
    }

    /// Build a status error from an unsuccessful response, consuming its body.
    pub async fn from_response(response: reqwest::Response) -> Self {
        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body = response.text().await.unwrap_or_default();
        Self::status(status, headers, truncate_for_error(&body, ERROR_BODY_LIMIT))
    }
}

/// Pass successful responses through and turn the rest into [`ApiError`].
///
/// # Errors
/// Returns [`ApiError::Status`] for any non-2xx response.
pub async fn error_for_status(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
    if response.status().is_success() {
        Ok(response)
    } else {
        Err(ApiError::from_response(response).await)
    }
}

/// Throttling information carried by a failed call.
pub trait ThrottleSignal {
    /// HTTP status, if the call reached the server.
    fn http_status(&self) -> Option<u16>;

    /// Response headers, if the call reached the server.
    fn response_headers(&self) -> Option<&HeaderMap>;
}

impl ThrottleSignal for ApiError {
    fn http_status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            Self::Transport(error) => error.status().map(|s| s.as_u16()),
            Self::InvalidToken(_) => None,
        }
    }

    fn response_headers(&self) -> Option<&HeaderMap> {
        match self {
            Self::Status { headers, .. } => Some(headers),
            Self::Transport(_) | Self::InvalidToken(_) => None,
        }
    }
}

/// Successful response whose rate-limit headers should be observed.
pub trait ResponseHeaders {
    fn headers(&self) -> &HeaderMap;
}

impl ResponseHeaders for reqwest::Response {
    fn headers(&self) -> &HeaderMap {
        Self::headers(self)
    }
}

/// Decoded response body with its headers.
#[derive(Debug, Clone)]
pub struct ApiResponse<T> {
    pub body: T,
    pub headers: HeaderMap,
}

impl<T> ApiResponse<T> {
    #[must_use]
    pub const fn new(body: T, headers: HeaderMap) -> Self {
        Self { body, headers }
    }
}

impl<T> ResponseHeaders for ApiResponse<T> {
    fn headers(&self) -> &HeaderMap {
        &self.headers
    }
}

pub(crate) fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)?
        .to_str()
        .ok()
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

/// Parse `retry-after` as delay-seconds or an HTTP date.
#[must_use]
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let raw = header_str(headers, HEADER_RETRY_AFTER)?;
    if let Ok(seconds) = raw.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }

    let retry_at = DateTime::parse_from_rfc2822(raw).ok()?.with_timezone(&Utc);
    let delay = retry_at.signed_duration_since(Utc::now());
    Some(delay.to_std().unwrap_or(Duration::ZERO))
}

fn truncate_for_error(body: &str, limit: usize) -> String {
    if body.chars().count() <= limit {
        return body.to_string();
    }
    let mut truncated: String = body.chars().take(limit).collect();
    truncated.push_str("...");
    truncated
}
