//! Runtime configuration sourced from the environment.

use std::{net::SocketAddr, path::PathBuf, time::Duration};

use thiserror::Error;

use crate::AgentProvider;

/// Environment variable names.
pub mod vars {
    pub const SESSION_DIR: &str = "RELAY_SESSION_DIR";
    pub const SESSION_TTL_SECS: &str = "RELAY_SESSION_TTL_SECS";
    pub const CLEANUP_INTERVAL_SECS: &str = "RELAY_CLEANUP_INTERVAL_SECS";
    pub const DEDUP_WINDOW_MS: &str = "RELAY_DEDUP_WINDOW_MS";
    pub const MAX_RETRIES: &str = "RELAY_MAX_RETRIES";
    pub const BIND_ADDR: &str = "RELAY_BIND_ADDR";
    pub const AGENT_PROVIDER: &str = "RELAY_AGENT_PROVIDER";
    pub const GITHUB_TOKEN: &str = "RELAY_GITHUB_TOKEN";
    pub const GITHUB_API_URL: &str = "RELAY_GITHUB_API_URL";
}

/// Default session TTL (24 hours).
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(24 * 60 * 60);
/// Default interval between expiry sweeps.
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(60 * 60);
/// Default window during which a repeated delivery id is dropped.
pub const DEFAULT_DEDUP_WINDOW: Duration = Duration::from_millis(5000);
/// Default retry cap for rate-limited API calls.
pub const DEFAULT_MAX_RETRIES: u32 = 3;
/// Default GitHub REST API base URL.
pub const DEFAULT_GITHUB_API_URL: &str = "https://api.github.com";

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value {value:?} for {var}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Relay configuration.
#[derive(Clone, PartialEq, Eq)]
pub struct RelayConfig {
    /// Directory holding one JSON file per conversation.
    pub session_dir: PathBuf,
    /// Maximum session age, measured from creation.
    pub session_ttl: Duration,
    /// Interval of the background expiry sweep.
    pub cleanup_interval: Duration,
    /// Delivery dedup window.
    pub dedup_window: Duration,
    /// Retry cap passed to the rate limiter.
    pub max_retries: u32,
    /// Listen address for the webhook intake.
    pub bind_addr: SocketAddr,
    /// Agent backend expected when resuming sessions.
    pub provider: AgentProvider,
    /// Token used for GitHub API calls; replies are not posted without one.
    pub github_token: Option<String>,
    /// GitHub REST API base URL.
    pub github_api_url: String,
}

impl std::fmt::Debug for RelayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayConfig")
            .field("session_dir", &self.session_dir)
            .field("session_ttl", &self.session_ttl)
            .field("cleanup_interval", &self.cleanup_interval)
            .field("dedup_window", &self.dedup_window)
            .field("max_retries", &self.max_retries)
            .field("bind_addr", &self.bind_addr)
            .field("provider", &self.provider)
            .field("github_token", &self.github_token.as_ref().map(|_| "<redacted>"))
            .field("github_api_url", &self.github_api_url)
            .finish()
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            session_dir: default_session_dir(),
            session_ttl: DEFAULT_SESSION_TTL,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
            dedup_window: DEFAULT_DEDUP_WINDOW,
            max_retries: DEFAULT_MAX_RETRIES,
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 3000)),
            provider: AgentProvider::Claude,
            github_token: None,
            github_api_url: DEFAULT_GITHUB_API_URL.to_string(),
        }
    }
}

impl RelayConfig {
    /// Load configuration from process environment variables.
    ///
    /// # Errors
    /// Returns error if a variable is set to an unparseable value.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Load configuration through an arbitrary lookup function.
    ///
    /// Unset or blank variables fall back to defaults.
    ///
    /// # Errors
    /// Returns error if a variable is set to an unparseable value.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        if let Some(dir) = get(vars::SESSION_DIR) {
            config.session_dir = PathBuf::from(dir.trim());
        }
        if let Some(raw) = get(vars::SESSION_TTL_SECS) {
            config.session_ttl = Duration::from_secs(parse_positive(vars::SESSION_TTL_SECS, &raw)?);
        }
        if let Some(raw) = get(vars::CLEANUP_INTERVAL_SECS) {
            config.cleanup_interval =
                Duration::from_secs(parse_positive(vars::CLEANUP_INTERVAL_SECS, &raw)?);
        }
        if let Some(raw) = get(vars::DEDUP_WINDOW_MS) {
            config.dedup_window = Duration::from_millis(parse_number(vars::DEDUP_WINDOW_MS, &raw)?);
        }
        if let Some(raw) = get(vars::MAX_RETRIES) {
            let value = parse_number(vars::MAX_RETRIES, &raw)?;
            config.max_retries = u32::try_from(value).map_err(|e| invalid(vars::MAX_RETRIES, &raw, e))?;
        }
        if let Some(raw) = get(vars::BIND_ADDR) {
            config.bind_addr = raw
                .trim()
                .parse()
                .map_err(|e| invalid(vars::BIND_ADDR, &raw, e))?;
        }
        if let Some(raw) = get(vars::AGENT_PROVIDER) {
            config.provider = AgentProvider::parse(&raw)
                .ok_or_else(|| invalid(vars::AGENT_PROVIDER, &raw, "unknown provider"))?;
        }
        if let Some(token) = get(vars::GITHUB_TOKEN) {
            config.github_token = Some(token.trim().to_string());
        }
        if let Some(url) = get(vars::GITHUB_API_URL) {
            let url = url.trim().trim_end_matches('/');
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(invalid(vars::GITHUB_API_URL, url, "expected an http(s) URL"));
            }
            config.github_api_url = url.to_string();
        }

        Ok(config)
    }
}

/// Default session directory: the platform data dir, else the working directory.
#[must_use]
pub fn default_session_dir() -> PathBuf {
    dirs::data_local_dir().map_or_else(
        || PathBuf::from(".gh-agent-relay").join("sessions"),
        |dir| dir.join("gh-agent-relay").join("sessions"),
    )
}

fn parse_number(var: &'static str, raw: &str) -> Result<u64, ConfigError> {
    raw.trim().parse::<u64>().map_err(|e| invalid(var, raw, e))
}

fn parse_positive(var: &'static str, raw: &str) -> Result<u64, ConfigError> {
    match parse_number(var, raw)? {
        0 => Err(invalid(var, raw, "must be greater than zero")),
        value => Ok(value),
    }
}

fn invalid(var: &'static str, value: &str, reason: impl ToString) -> ConfigError {
    ConfigError::Invalid {
        var,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}
