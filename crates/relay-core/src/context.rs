//! Conversation identity and the GitHub context a session was started from.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Stable identifier for one issue or pull request thread.
///
/// Rendered as `owner/repo#number`. The same string is used as the session
/// map key, the on-disk file key and the keyed-lock key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationKey(String);

impl ConversationKey {
    /// Build a key from its parts.
    #[must_use]
    pub fn new(owner: &str, repo: &str, issue_number: u64) -> Self {
        Self(format!("{owner}/{repo}#{issue_number}"))
    }

    /// Parse an `owner/repo#number` string.
    ///
    /// Returns `None` when any part is missing or the number is not numeric.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        let (slug, number) = raw.rsplit_once('#')?;
        let (owner, repo) = slug.split_once('/')?;
        if owner.is_empty() || repo.is_empty() || repo.contains('/') {
            return None;
        }
        let number = number.parse::<u64>().ok()?;
        Some(Self::new(owner, repo, number))
    }

    /// Extract the key from an `issues`, `issue_comment` or
    /// `pull_request*` webhook payload.
    #[must_use]
    pub fn from_webhook_payload(payload: &Value) -> Option<Self> {
        let repository = payload.get("repository")?;
        let owner = repository.pointer("/owner/login")?.as_str()?;
        let repo = repository.get("name")?.as_str()?;
        let number = payload
            .pointer("/issue/number")
            .or_else(|| payload.pointer("/pull_request/number"))
            .or_else(|| payload.get("number"))?
            .as_u64()?;
        Some(Self::new(owner, repo, number))
    }

    /// The key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ConversationKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Where and when a conversation turn was triggered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationContext {
    /// Repository owner (user or organization login).
    pub owner: String,

    /// Repository name.
    pub repo: String,

    /// Issue or pull request number.
    pub issue_number: u64,

    /// Whether the thread is a pull request.
    #[serde(rename = "isPR")]
    pub is_pr: bool,

    /// Comment that triggered the turn, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment_id: Option<u64>,

    /// Trigger time (Unix epoch milliseconds).
    pub triggered_at: i64,
}

impl ConversationContext {
    /// Create a context for an issue thread.
    #[must_use]
    pub fn new(owner: impl Into<String>, repo: impl Into<String>, issue_number: u64) -> Self {
        Self {
            owner: owner.into(),
            repo: repo.into(),
            issue_number,
            is_pr: false,
            comment_id: None,
            triggered_at: crate::time::unix_millis(),
        }
    }

    /// Mark the thread as a pull request.
    #[must_use]
    pub const fn pull_request(mut self) -> Self {
        self.is_pr = true;
        self
    }

    /// Attach the triggering comment.
    #[must_use]
    pub const fn with_comment(mut self, comment_id: u64) -> Self {
        self.comment_id = Some(comment_id);
        self
    }

    /// Build the context for an `issues`, `issue_comment` or
    /// `pull_request*` webhook payload.
    ///
    /// Issue comments on a pull request are flagged as PR threads.
    #[must_use]
    pub fn from_webhook_payload(payload: &Value) -> Option<Self> {
        let owner = payload.pointer("/repository/owner/login")?.as_str()?;
        let repo = payload.pointer("/repository/name")?.as_str()?;
        let number = payload
            .pointer("/issue/number")
            .or_else(|| payload.pointer("/pull_request/number"))
            .or_else(|| payload.get("number"))?
            .as_u64()?;

        let mut ctx = Self::new(owner, repo, number);
        if payload.get("pull_request").is_some()
            || payload.pointer("/issue/pull_request").is_some()
        {
            ctx = ctx.pull_request();
        }
        if let Some(comment_id) = payload.pointer("/comment/id").and_then(Value::as_u64) {
            ctx = ctx.with_comment(comment_id);
        }
        Some(ctx)
    }

    /// The conversation key this context belongs to.
    #[must_use]
    pub fn key(&self) -> ConversationKey {
        ConversationKey::new(&self.owner, &self.repo, self.issue_number)
    }
}
