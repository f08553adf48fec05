//! Release held leases when the process is being torn down.
//!
//! Signal handlers are process-global, so instead of each controller
//! installing its own, every controller records the lease it holds in a
//! [`LeaseRegistry`] and a single [`TerminationHook`] releases whatever the
//! registry contains before exiting.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::signal;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::coordination::LeaseCapability;

/// Upper bound on each release issued during shutdown.
pub const SHUTDOWN_RELEASE_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

struct HeldLease {
    key: String,
    lease: Arc<dyn LeaseCapability>,
    /// Present once the episode's worker has promised to stop on shutdown;
    /// turns `true` when it has.
    teardown: Option<watch::Receiver<bool>>,
}

struct RegistryInner {
    held: Mutex<HashMap<u64, HeldLease>>,
    next_id: AtomicU64,
    closed: watch::Sender<bool>,
}

/// Leases currently held by controllers in this process.
///
/// Once closed by [`LeaseRegistry::release_all`] the registry refuses new
/// registrations, and controllers subscribed to it stop.  A lease whose
/// worker asked for a [`ShutdownNotice`] is only released after that worker
/// has called `done()`, so no work outlives the lease it ran under.
#[derive(Clone)]
pub struct LeaseRegistry {
    inner: Arc<RegistryInner>,
}

impl Default for LeaseRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl LeaseRegistry {
    pub fn new() -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            inner: Arc::new(RegistryInner {
                held: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                closed,
            }),
        }
    }

    /// The process-wide registry used by controllers unless told otherwise.
    pub fn global() -> LeaseRegistry {
        static GLOBAL: OnceLock<LeaseRegistry> = OnceLock::new();
        GLOBAL.get_or_init(LeaseRegistry::new).clone()
    }

    fn held(&self) -> MutexGuard<'_, HashMap<u64, HeldLease>> {
        self.inner.held.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record a freshly acquired lease.  Returns `None` when the registry is
    /// already closed; the caller must then release the lease itself.
    pub(crate) fn register(
        &self,
        key: &str,
        lease: Arc<dyn LeaseCapability>,
    ) -> Option<Registration> {
        let mut held = self.held();
        // Checked under the map lock so release_all cannot miss this entry.
        if self.is_closed() {
            return None;
        }
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        held.insert(
            id,
            HeldLease {
                key: key.to_string(),
                lease,
                teardown: None,
            },
        );
        Some(Registration {
            id,
            registry: self.clone(),
        })
    }

    /// Keys of every lease currently registered.
    pub fn held_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.held().values().map(|h| h.key.clone()).collect();
        keys.sort();
        keys
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.closed.borrow()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<bool> {
        self.inner.closed.subscribe()
    }

    /// Close the registry and release every registered lease.
    ///
    /// Workers that took a [`ShutdownNotice`] are waited for first.  The wait
    /// and each release are bounded by [`SHUTDOWN_RELEASE_TIMEOUT`]; failures
    /// are logged and skipped.  Returns the number of leases actually
    /// released.  Does not contact the store when nothing is held.
    pub async fn release_all(&self) -> usize {
        let drained: Vec<HeldLease> = {
            let mut held = self.held();
            self.inner.closed.send_replace(true);
            held.drain().map(|(_, h)| h).collect()
        };

        if drained.is_empty() {
            debug!("no leases held at shutdown");
            return 0;
        }

        let mut released = 0;
        for held in drained {
            if let Some(mut stopped) = held.teardown {
                info!(key = %held.key, "waiting for worker to stop before release");
                let wait = stopped.wait_for(|stopped| *stopped);
                match tokio::time::timeout(SHUTDOWN_RELEASE_TIMEOUT, wait).await {
                    // A closed channel means every handle is gone.
                    Ok(_) => debug!(key = %held.key, "worker stopped"),
                    Err(_) => {
                        error!(key = %held.key, timeout = ?SHUTDOWN_RELEASE_TIMEOUT, "worker did not stop; releasing anyway");
                    }
                }
            }
            let result = tokio::time::timeout(SHUTDOWN_RELEASE_TIMEOUT, held.lease.release(&held.key)).await;
            match result {
                Ok(Ok(true)) => {
                    released += 1;
                    info!(key = %held.key, holder = %held.lease.holder(), "lease released at shutdown");
                }
                Ok(Ok(false)) => {
                    warn!(key = %held.key, "lease already gone at shutdown");
                }
                Ok(Err(e)) => {
                    error!(key = %held.key, error = %e, "lease release failed at shutdown");
                }
                Err(_) => {
                    error!(key = %held.key, timeout = ?SHUTDOWN_RELEASE_TIMEOUT, "lease release timed out at shutdown");
                }
            }
        }
        released
    }
}

/// Removes its entry from the registry when dropped.
pub(crate) struct Registration {
    id: u64,
    registry: LeaseRegistry,
}

impl Registration {
    pub(crate) fn ticket(&self) -> ShutdownTicket {
        ShutdownTicket {
            id: self.id,
            registry: self.registry.clone(),
        }
    }
}

/// An episode's link back to its registry entry.
#[derive(Clone)]
pub(crate) struct ShutdownTicket {
    id: u64,
    registry: LeaseRegistry,
}

impl ShutdownTicket {
    /// Make `release_all` wait for `stopped` to turn `true` before releasing
    /// this entry.  Returns `None` when shutdown has already begun.
    pub(crate) fn cooperate(&self, stopped: watch::Receiver<bool>) -> Option<ShutdownNotice> {
        let mut held = self.registry.held();
        // Same lock as release_all's drain: either the entry is still here
        // and will be waited for, or the caller learns it is too late.
        if self.registry.is_closed() {
            return None;
        }
        if let Some(entry) = held.get_mut(&self.id) {
            entry.teardown = Some(stopped);
        }
        Some(ShutdownNotice {
            closed: Some(self.registry.subscribe()),
        })
    }
}

/// Resolves when the process starts shutting down.
///
/// Obtained from [`crate::LeaseHandle::on_shutdown`].
pub struct ShutdownNotice {
    closed: Option<watch::Receiver<bool>>,
}

impl ShutdownNotice {
    /// A notice that never fires, for episodes outside any registry.
    pub(crate) fn never() -> Self {
        Self { closed: None }
    }

    /// Wait for shutdown.  Cancel safe.
    pub async fn recv(&mut self) {
        match &mut self.closed {
            Some(closed) => {
                if closed.wait_for(|closed| *closed).await.is_err() {
                    std::future::pending::<()>().await;
                }
            }
            None => std::future::pending::<()>().await,
        }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.held().remove(&self.id);
    }
}

// ---------------------------------------------------------------------------
// Signal handling
// ---------------------------------------------------------------------------

/// Wait for SIGINT or SIGTERM.  Returns the name of the signal received.
pub async fn shutdown_signal() -> Result<&'static str> {
    #[cfg(unix)]
    let terminate = {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
            .context("failed to install SIGTERM handler")?;
        async move {
            sigterm.recv().await;
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        res = signal::ctrl_c() => {
            res.context("failed to install Ctrl+C handler")?;
            Ok("SIGINT")
        }
        () = terminate => Ok("SIGTERM"),
    }
}

/// Maps SIGINT/SIGTERM to "release every held lease, then exit 0".
pub struct TerminationHook;

impl TerminationHook {
    /// Spawn the signal watcher on the current tokio runtime.
    ///
    /// Only the first call in a process installs anything; later calls
    /// return `false`.
    pub fn install(registry: LeaseRegistry) -> bool {
        static INSTALLED: AtomicBool = AtomicBool::new(false);
        if INSTALLED.swap(true, Ordering::SeqCst) {
            debug!("termination hook already installed");
            return false;
        }

        tokio::spawn(async move {
            match shutdown_signal().await {
                Ok(name) => info!(signal = name, "termination signal received"),
                Err(e) => {
                    error!(error = %e, "termination hook disabled");
                    return;
                }
            }
            let released = registry.release_all().await;
            info!(released, "leases released; exiting");
            std::process::exit(0);
        });
        true
    }
}
