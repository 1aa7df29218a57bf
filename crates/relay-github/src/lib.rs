//! Adaptive rate limiting and retries for GitHub REST API calls.
//!
//! Provides:
//! - `RateLimiter` - Shared throttle fed by `x-ratelimit-*` headers
//! - `ApiError` - Error type carrying status and headers of failed calls
//! - `ThrottleSignal` / `ResponseHeaders` - Seams for custom call types
//! - `GithubClient` - REST client whose calls all go through the limiter

pub mod client;
pub mod error;
pub mod rate_limit;

pub use client::{CreatedComment, GithubClient};
pub use error::{ApiError, ApiResponse, ResponseHeaders, ThrottleSignal, error_for_status};
pub use rate_limit::{RateLimitConfig, RateLimitStatus, RateLimiter};
