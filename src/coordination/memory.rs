//! In-process coordination store.
//!
//! [`MemoryStore`] keeps `key -> (holder, expires_at)` entries behind a mutex
//! and gives every operation the same check-and-set atomicity Redis gives
//! the Lua scripts.  Expiry uses [`tokio::time::Instant`], so tests running
//! with a paused clock observe lease lapses deterministically.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{bail, Result};
use tokio::time::Instant;
use tracing::debug;

use super::{Extension, LeaseCapability};

#[derive(Debug, Clone)]
struct Entry {
    holder: String,
    expires_at: Instant,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// Shared store.  Clone it to hand the same store to several holders.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
    unavailable: Arc<AtomicBool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A holder bound to this store.
    pub fn lease(&self, holder: impl Into<String>) -> MemoryLease {
        MemoryLease {
            store: self.clone(),
            holder: holder.into(),
        }
    }

    /// Simulate the store becoming unreachable (every call fails) or
    /// reachable again.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Current live holder of `key`, if any.
    pub fn holder_of(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        self.lock()
            .get(key)
            .filter(|e| e.is_live(now))
            .map(|e| e.holder.clone())
    }

    /// Remaining validity of `key`, or `None` when it is not held.
    pub fn remaining_ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        self.lock()
            .get(key)
            .filter(|e| e.is_live(now))
            .map(|e| e.expires_at - now)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        // A poisoned map is still structurally valid.
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            bail!("memory store unavailable");
        }
        Ok(())
    }
}

/// One holder's view of a [`MemoryStore`].
#[derive(Debug, Clone)]
pub struct MemoryLease {
    store: MemoryStore,
    holder: String,
}

#[async_trait::async_trait]
impl LeaseCapability for MemoryLease {
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<bool> {
        self.store.check_available()?;
        let now = Instant::now();
        let mut entries = self.store.lock();
        if entries.get(key).is_some_and(|e| e.is_live(now)) {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                holder: self.holder.clone(),
                expires_at: now + ttl,
            },
        );
        debug!(%key, holder = %self.holder, "memory lease acquired");
        Ok(true)
    }

    async fn extend(&self, key: &str, ttl: Duration) -> Result<Extension> {
        self.store.check_available()?;
        let now = Instant::now();
        let mut entries = self.store.lock();
        match entries.get_mut(key) {
            Some(entry) if entry.is_live(now) && entry.holder == self.holder => {
                entry.expires_at = now + ttl;
                Ok(Extension::Extended)
            }
            _ => Ok(Extension::NotHeld),
        }
    }

    async fn release(&self, key: &str) -> Result<bool> {
        self.store.check_available()?;
        let now = Instant::now();
        let mut entries = self.store.lock();
        let owned = entries
            .get(key)
            .is_some_and(|e| e.is_live(now) && e.holder == self.holder);
        if owned {
            entries.remove(key);
        }
        Ok(owned)
    }

    fn holder(&self) -> &str {
        &self.holder
    }
}
