//! Per-conversation locking and session storage for the agent relay.
//!
//! Provides:
//! - `KeyedLock` - FIFO mutual exclusion per conversation key
//! - `ConversationManager` - Locked turns over a session store
//! - Storage implementations (memory, file)

pub mod lock;
pub mod manager;
pub mod storage;

pub use lock::{KeyLease, KeyedLock};
pub use manager::{ConversationManager, ConversationTurn};
