//! Coordination-store access for the lease protocol.
//!
//! The controller only ever talks to the store through [`LeaseCapability`],
//! whose three operations are atomic on the store side.  Two backends are
//! provided: [`locks::RedisLease`] (production, Redis/KeyDB via fred) and
//! [`memory::MemoryLease`] (an in-process store with the same semantics).

pub mod locks;
pub mod memory;
pub mod node;
pub mod redis;

use std::time::Duration;

use anyhow::Result;

/// Outcome of an extend request.
///
/// [`LeaseCapability::extend`] returns one of the first three variants and
/// reports store errors as `Err`.  [`crate::LeaseHandle`] passes those
/// through and adds `Stale` and `Failed`, since a worker never sees an
/// error from its handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Extension {
    /// The lease now expires `ttl` from the moment the store processed it.
    Extended,
    /// The key is missing or owned by another holder.
    NotHeld,
    /// The store did not answer within the command timeout.
    TimedOut,
    /// Handle only: the episode has already ended; nothing was sent to the
    /// store.
    Stale,
    /// Handle only: the capability returned an error.
    Failed,
}

impl Extension {
    pub fn is_extended(self) -> bool {
        matches!(self, Extension::Extended)
    }
}

/// Atomic lease primitives against a coordination store.
///
/// Each implementor instance acts as one holder: `extend` and `release` only
/// touch a key that this instance acquired and still owns.  An `Err` means
/// the store could not be reached; contention is reported as `Ok(false)`.
#[async_trait::async_trait]
pub trait LeaseCapability: Send + Sync {
    /// Try to take `key` for `ttl`.  Never waits for a current holder.
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<bool>;

    /// Push the expiry of an owned `key` to `ttl` from now.
    async fn extend(&self, key: &str, ttl: Duration) -> Result<Extension>;

    /// Delete an owned `key`.  Returns `false` when it was already gone or
    /// taken over by another holder.
    async fn release(&self, key: &str) -> Result<bool>;

    /// Opaque identifier of this holder, used in logs.
    fn holder(&self) -> &str;
}
