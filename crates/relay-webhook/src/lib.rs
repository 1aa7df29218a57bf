//! Deduplicating webhook intake and asynchronous job dispatch.
//!
//! Provides:
//! - `WebhookJob` - One inbound delivery
//! - `JobQueue` - At-most-once acceptance per delivery id, background processing
//! - HTTP intake router (feature: http)

pub mod protocol;
pub mod queue;

#[cfg(feature = "http")]
pub mod http;

pub use protocol::WebhookJob;
pub use queue::{Admission, JobError, JobHandler, JobQueue, handler_fn};
