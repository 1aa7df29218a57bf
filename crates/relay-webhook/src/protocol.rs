//! Webhook deliveries as queued jobs.

use relay_core::{ConversationKey, time::unix_millis};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Header carrying the unique delivery id.
pub const DELIVERY_HEADER: &str = "x-github-delivery";
/// Header carrying the event name (`issue_comment`, `pull_request`, ...).
pub const EVENT_HEADER: &str = "x-github-event";

/// One inbound event delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookJob {
    /// Delivery identifier assigned by the event source.
    pub id: String,
    /// Event name.
    pub event_kind: String,
    /// Raw event payload.
    pub payload: Value,
    /// Receipt time (Unix epoch milliseconds).
    pub created_at: i64,
}

impl WebhookJob {
    /// Create a job stamped with the current time.
    #[must_use]
    pub fn new(id: impl Into<String>, event_kind: impl Into<String>, payload: Value) -> Self {
        Self {
            id: id.into(),
            event_kind: event_kind.into(),
            payload,
            created_at: unix_millis(),
        }
    }

    /// Conversation the event belongs to, if it is about an issue or PR.
    #[must_use]
    pub fn conversation_key(&self) -> Option<ConversationKey> {
        ConversationKey::from_webhook_payload(&self.payload)
    }

    /// The `action` field of the payload, if any.
    #[must_use]
    pub fn action(&self) -> Option<&str> {
        self.payload.get("action").and_then(Value::as_str)
    }
}
