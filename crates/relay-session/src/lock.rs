//! Per-key mutual exclusion.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use tokio::sync::OwnedMutexGuard;

#[derive(Debug)]
struct Slot {
    lock: Arc<tokio::sync::Mutex<()>>,
    holders: usize,
}

type Slots = Arc<Mutex<HashMap<String, Slot>>>;

/// Grants exclusive access to a logical key.
///
/// Waiters on the same key are served in request order (tokio's mutex is
/// fair). Keys never contend with each other. A slot exists only while a
/// holder or waiter references it, so memory tracks the currently contended
/// keys rather than every key ever seen.
///
/// There is no timeout: a lease that is never released blocks every later
/// acquirer of that key.
#[derive(Debug, Clone, Default)]
pub struct KeyedLock {
    slots: Slots,
}

impl KeyedLock {
    /// Create an empty lock table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until every earlier acquirer of `key` has released, then take it.
    pub async fn acquire(&self, key: &str) -> KeyLease {
        let (lock, ticket) = {
            let mut slots = lock_slots(&self.slots);
            let slot = slots.entry(key.to_owned()).or_insert_with(|| Slot {
                lock: Arc::new(tokio::sync::Mutex::new(())),
                holders: 0,
            });
            slot.holders += 1;
            let ticket = Ticket {
                slots: Arc::clone(&self.slots),
                key: key.to_owned(),
            };
            (Arc::clone(&slot.lock), ticket)
        };

        // A dropped `acquire` future still releases its ticket.
        let guard = lock.lock_owned().await;
        tracing::debug!(key, "keyed lock acquired");
        KeyLease {
            guard: Some(guard),
            ticket: Some(ticket),
        }
    }

    /// Number of keys with a holder or waiter.
    #[must_use]
    pub fn active_keys(&self) -> usize {
        lock_slots(&self.slots).len()
    }
}

fn lock_slots(slots: &Slots) -> MutexGuard<'_, HashMap<String, Slot>> {
    slots.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Interest registered in a key's slot; prunes the slot when the last one goes.
#[derive(Debug)]
struct Ticket {
    slots: Slots,
    key: String,
}

impl Drop for Ticket {
    fn drop(&mut self) {
        let mut slots = lock_slots(&self.slots);
        if let Some(slot) = slots.get_mut(&self.key) {
            slot.holders = slot.holders.saturating_sub(1);
            if slot.holders == 0 {
                slots.remove(&self.key);
            }
        }
    }
}

/// Exclusive hold on a key.
///
/// Released by [`KeyLease::release`] or on drop, whichever comes first.
#[derive(Debug)]
#[must_use = "the key is released as soon as the lease is dropped"]
pub struct KeyLease {
    guard: Option<OwnedMutexGuard<()>>,
    ticket: Option<Ticket>,
}

impl KeyLease {
    /// Give up the key. Calling this more than once has no effect.
    pub fn release(&mut self) {
        // Unlock before the ticket so the next waiter is woken while its
        // slot is still registered.
        if let Some(guard) = self.guard.take() {
            drop(guard);
            if let Some(ticket) = self.ticket.take() {
                tracing::debug!(key = %ticket.key, "keyed lock released");
            }
        }
    }

    /// Whether the lease still holds its key.
    #[must_use]
    pub const fn is_held(&self) -> bool {
        self.guard.is_some()
    }
}

impl Drop for KeyLease {
    fn drop(&mut self) {
        self.release();
    }
}
