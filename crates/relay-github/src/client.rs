//! Minimal GitHub REST client. Every request goes through a shared [`RateLimiter`].

use std::{sync::Arc, time::Duration};

use reqwest::header::{ACCEPT, AUTHORIZATION, HeaderMap, HeaderValue, USER_AGENT};
use serde::{Deserialize, de::DeserializeOwned};
use serde_json::json;

use crate::{
    error::{ApiError, ApiResponse, error_for_status},
    rate_limit::RateLimiter,
};

const API_VERSION_HEADER: &str = "x-github-api-version";
const API_VERSION: &str = "2022-11-28";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Zero-based attempt number, sent with every request.
pub const RETRY_ATTEMPT_HEADER: &str = "x-relay-retry-attempt";

/// Comment returned by the create endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct CreatedComment {
    pub id: u64,
    pub html_url: Option<String>,
}

/// GitHub API client sharing one rate limiter with every other caller.
#[derive(Debug, Clone)]
pub struct GithubClient {
    http: reqwest::Client,
    api_base: String,
    limiter: Arc<RateLimiter>,
    max_retries: u32,
}

impl GithubClient {
    /// Create a client authenticating with `token`.
    ///
    /// # Errors
    /// Returns error if the token is not a valid header value or the HTTP
    /// client cannot be built.
    pub fn new(
        api_base: &str,
        token: &str,
        limiter: Arc<RateLimiter>,
        max_retries: u32,
    ) -> Result<Self, ApiError> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static("gh-agent-relay"));
        headers.insert(ACCEPT, HeaderValue::from_static("application/vnd.github+json"));
        headers.insert(API_VERSION_HEADER, HeaderValue::from_static(API_VERSION));
        let mut auth = HeaderValue::from_str(&format!("Bearer {}", token.trim()))?;
        auth.set_sensitive(true);
        headers.insert(AUTHORIZATION, auth);

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            api_base: api_base.trim_end_matches('/').to_string(),
            limiter,
            max_retries,
        })
    }

    /// Shared limiter.
    #[must_use]
    pub const fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Post a comment on an issue or pull request.
    ///
    /// # Errors
    /// Returns the last error once retries are exhausted, or at once for
    /// errors that are not rate limits.
    pub async fn create_issue_comment(
        &self,
        owner: &str,
        repo: &str,
        issue_number: u64,
        body: &str,
    ) -> Result<CreatedComment, ApiError> {
        let url = format!(
            "{}/repos/{owner}/{repo}/issues/{issue_number}/comments",
            self.api_base
        );
        let payload = json!({ "body": body });
        let response = self
            .request_json(|| self.http.post(&url).json(&payload))
            .await?;
        Ok(response.body)
    }

    async fn request_json<T, F>(&self, mut build: F) -> Result<ApiResponse<T>, ApiError>
    where
        T: DeserializeOwned,
        F: FnMut() -> reqwest::RequestBuilder,
    {
        let mut attempt = 0_u32;
        self.limiter
            .execute_with_retry(
                || {
                    let request = build().header(RETRY_ATTEMPT_HEADER, attempt);
                    attempt += 1;
                    async move {
                        let response = error_for_status(request.send().await?).await?;
                        let headers = response.headers().clone();
                        let body = response.json::<T>().await?;
                        Ok::<_, ApiError>(ApiResponse::new(body, headers))
                    }
                },
                self.max_retries,
            )
            .await
    }
}
