//! The handle a worker uses to interact with its own lease.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::coordination::{Extension, LeaseCapability};
use crate::metrics::Metrics;
use crate::shutdown::{ShutdownNotice, ShutdownTicket};

/// Bound to exactly one acquisition episode.
///
/// Cheap to clone; every clone refers to the same episode.  Once `done()`
/// has been called on any clone, `touch`/`extend` return
/// [`Extension::Stale`] without contacting the store and further `done()`
/// calls are no-ops.
#[derive(Clone)]
pub struct LeaseHandle {
    inner: Arc<Episode>,
}

struct Episode {
    number: u64,
    key: String,
    ttl: Duration,
    lease: Arc<dyn LeaseCapability>,
    metrics: Arc<Metrics>,
    live: AtomicBool,
    done_tx: Mutex<Option<oneshot::Sender<()>>>,
    deadline: Arc<Mutex<Instant>>,
    stopped: watch::Sender<bool>,
    ticket: Option<ShutdownTicket>,
}

/// Controller side of an episode.
pub(crate) struct EpisodeWatch {
    pub(crate) done_rx: oneshot::Receiver<()>,
    pub(crate) deadline: Arc<Mutex<Instant>>,
}

impl EpisodeWatch {
    pub(crate) fn deadline(&self) -> Instant {
        *self.deadline.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl LeaseHandle {
    pub(crate) fn new(
        number: u64,
        key: String,
        ttl: Duration,
        acquired_at: Instant,
        lease: Arc<dyn LeaseCapability>,
        metrics: Arc<Metrics>,
        ticket: Option<ShutdownTicket>,
    ) -> (Self, EpisodeWatch) {
        let (done_tx, done_rx) = oneshot::channel();
        let deadline = Arc::new(Mutex::new(acquired_at + ttl));
        let handle = Self {
            inner: Arc::new(Episode {
                number,
                key,
                ttl,
                lease,
                metrics,
                live: AtomicBool::new(true),
                done_tx: Mutex::new(Some(done_tx)),
                deadline: Arc::clone(&deadline),
                stopped: watch::channel(false).0,
                ticket,
            }),
        };
        (handle, EpisodeWatch { done_rx, deadline })
    }

    /// Episode number, starting at 1 for the first acquisition.
    pub fn episode(&self) -> u64 {
        self.inner.number
    }

    /// Coordination-store key of the lease.
    pub fn key(&self) -> &str {
        &self.inner.key
    }

    /// `false` once `done()` has been called.
    pub fn is_live(&self) -> bool {
        self.inner.live.load(Ordering::SeqCst)
    }

    /// Extend the lease by the configured ttl.
    pub async fn touch(&self) -> Extension {
        self.extend(self.inner.ttl).await
    }

    /// Extend the lease so it expires `duration` from now.
    ///
    /// Store failures are logged and reported through the returned
    /// [`Extension`]; they are never raised as errors to the worker.
    pub async fn extend(&self, duration: Duration) -> Extension {
        let ep = &self.inner;
        if !self.is_live() {
            debug!(key = %ep.key, episode = ep.number, "extend on finished episode ignored");
            return Extension::Stale;
        }

        let requested_at = Instant::now();
        let outcome = match ep.lease.extend(&ep.key, duration).await {
            Ok(outcome) => outcome,
            Err(e) => {
                ep.metrics.store_errors.inc();
                warn!(key = %ep.key, episode = ep.number, error = %e, "lease extend failed");
                Extension::Failed
            }
        };

        if outcome.is_extended() {
            ep.metrics.lease_extensions.inc();
            let mut deadline = ep.deadline.lock().unwrap_or_else(|e| e.into_inner());
            *deadline = (*deadline).max(requested_at + duration);
        } else {
            ep.metrics.lease_extension_failures.inc();
        }
        outcome
    }

    /// Ask to be told when the process starts shutting down.
    ///
    /// Taking a notice is a promise: on shutdown the held lease is only
    /// released once this episode's `done()` has been called (or after
    /// [`crate::shutdown::SHUTDOWN_RELEASE_TIMEOUT`]), so the worker must
    /// stop its work and call `done()` when the notice fires.
    ///
    /// Returns `None` when shutdown has already begun or the episode is over;
    /// the worker should then start nothing and call `done()` right away.
    pub fn on_shutdown(&self) -> Option<ShutdownNotice> {
        if !self.is_live() {
            return None;
        }
        match &self.inner.ticket {
            Some(ticket) => ticket.cooperate(self.inner.stopped.subscribe()),
            None => Some(ShutdownNotice::never()),
        }
    }

    /// Signal that the work of this episode is finished.
    ///
    /// Does not block.  Only the first call on any clone has an effect.
    pub fn done(&self) {
        let ep = &self.inner;
        if !ep.live.swap(false, Ordering::SeqCst) {
            debug!(key = %ep.key, episode = ep.number, "done called again; ignored");
            return;
        }
        ep.stopped.send_replace(true);
        let tx = ep.done_tx.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(tx) = tx {
            // The controller may already be gone (process shutting down).
            let _ = tx.send(());
        }
    }
}

impl std::fmt::Debug for LeaseHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseHandle")
            .field("key", &self.inner.key)
            .field("episode", &self.inner.number)
            .field("live", &self.is_live())
            .finish()
    }
}
