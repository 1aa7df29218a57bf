//! Core types for conversation sessions relayed between GitHub and remote agents.
//!
//! This crate provides the shared building blocks:
//! - `ConversationKey` / `ConversationContext` - Identity of an issue or PR thread
//! - `SessionRecord` / `AgentProvider` - Resumable agent session metadata
//! - `SessionStorage` - Trait implemented by session backends
//! - `RelayConfig` - Environment-driven configuration

pub mod config;
pub mod context;
pub mod time;
pub mod traits;

pub use config::{ConfigError, RelayConfig};
pub use context::{ConversationContext, ConversationKey};
pub use traits::{AgentProvider, SessionRecord, SessionStorage, StorageError};
