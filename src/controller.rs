//! The acquire → run → release state machine for one worker identity.
//!
//! ```text
//! Idle --start()--> Acquiring
//! Acquiring --acquire ok--> Active            (worker invoked)
//! Acquiring --held elsewhere / store error--> Acquiring (after ping_interval)
//! Active --done()--> Releasing
//! Releasing --released--> Acquiring           (continuous)
//! Releasing --released--> Terminated          (one-shot, or registry closed)
//! ```
//!
//! Mutual exclusion itself comes from the store's atomic acquire; the
//! controller only guarantees that, within this process, a new acquisition
//! never starts before the previous episode's release has been issued.

use std::fmt;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{LeaseConfig, LeaseSettings, RunMode, WorkerIdentity, DEFAULT_KEY_PREFIX};
use crate::coordination::{Extension, LeaseCapability};
use crate::error::BuildError;
use crate::handle::{EpisodeWatch, LeaseHandle};
use crate::metrics::{Metrics, MetricsRegistry};
use crate::shutdown::LeaseRegistry;
use crate::worker::{LapseEvent, LapseHook, Worker};

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Idle,
    Acquiring,
    Active,
    Releasing,
    Terminated,
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ControllerState::Idle => "idle",
            ControllerState::Acquiring => "acquiring",
            ControllerState::Active => "active",
            ControllerState::Releasing => "releasing",
            ControllerState::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

pub struct ControllerBuilder {
    id: String,
    key_prefix: String,
    config: LeaseConfig,
    mode: RunMode,
    lease: Option<Arc<dyn LeaseCapability>>,
    worker: Option<Arc<dyn Worker>>,
    registry: Option<LeaseRegistry>,
    metrics: Option<MetricsRegistry>,
    on_lapse: Option<LapseHook>,
}

impl ControllerBuilder {
    fn new(id: String) -> Self {
        Self {
            id,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            config: LeaseConfig::default(),
            mode: RunMode::default(),
            lease: None,
            worker: None,
            registry: None,
            metrics: None,
            on_lapse: None,
        }
    }

    pub fn key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn lease_config(mut self, config: LeaseConfig) -> Self {
        self.config = config;
        self
    }

    pub fn mode(mut self, mode: RunMode) -> Self {
        self.mode = mode;
        self
    }

    /// Apply prefix, timings and mode from a loaded config section.
    pub fn settings(self, settings: &LeaseSettings) -> Self {
        self.key_prefix(settings.key_prefix.clone())
            .lease_config(settings.lease_config())
            .mode(settings.mode)
    }

    pub fn lease(mut self, lease: Arc<dyn LeaseCapability>) -> Self {
        self.lease = Some(lease);
        self
    }

    pub fn worker<W: Worker>(mut self, worker: W) -> Self {
        self.worker = Some(Arc::new(worker));
        self
    }

    /// Registry the held lease is recorded in.  Defaults to
    /// [`LeaseRegistry::global`].
    pub fn registry(mut self, registry: LeaseRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn metrics(mut self, metrics: MetricsRegistry) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Called once per episode whose lease expired before `done()`.
    /// Purely diagnostic: the controller keeps waiting for `done()`.
    pub fn on_lease_lapsed<F>(mut self, hook: F) -> Self
    where
        F: Fn(LapseEvent) + Send + Sync + 'static,
    {
        self.on_lapse = Some(Arc::new(hook));
        self
    }

    pub fn build(self) -> Result<LeaseController, BuildError> {
        let worker = self.worker.ok_or(BuildError::MissingWorker)?;
        let lease = self.lease.ok_or(BuildError::MissingLease)?;
        if self.id.is_empty() {
            return Err(BuildError::EmptyWorkerId);
        }
        if self.key_prefix.is_empty() {
            return Err(BuildError::EmptyKeyPrefix);
        }
        if self.config.ttl.is_zero() {
            return Err(BuildError::ZeroDuration("ttl"));
        }
        if self.config.ping_interval.is_zero() {
            return Err(BuildError::ZeroDuration("ping_interval"));
        }

        let (state_tx, _) = watch::channel(ControllerState::Idle);
        Ok(LeaseController {
            identity: WorkerIdentity::new(self.key_prefix, self.id),
            config: self.config,
            mode: self.mode,
            lease,
            worker,
            registry: self.registry.unwrap_or_else(LeaseRegistry::global),
            metrics: self.metrics.unwrap_or_default().metrics,
            on_lapse: self.on_lapse,
            state_tx,
        })
    }
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

/// Drives one [`WorkerIdentity`] through repeated acquisition episodes.
pub struct LeaseController {
    identity: WorkerIdentity,
    config: LeaseConfig,
    mode: RunMode,
    lease: Arc<dyn LeaseCapability>,
    worker: Arc<dyn Worker>,
    registry: LeaseRegistry,
    metrics: Arc<Metrics>,
    on_lapse: Option<LapseHook>,
    state_tx: watch::Sender<ControllerState>,
}

impl LeaseController {
    pub fn builder(id: impl Into<String>) -> ControllerBuilder {
        ControllerBuilder::new(id.into())
    }

    pub fn key(&self) -> String {
        self.identity.key()
    }

    pub fn config(&self) -> LeaseConfig {
        self.config
    }

    pub fn mode(&self) -> RunMode {
        self.mode
    }

    pub fn state(&self) -> ControllerState {
        *self.state_tx.borrow()
    }

    /// Spawn the state machine on the current tokio runtime.
    ///
    /// Consumes the controller, so it can only be started once.
    pub fn start(self) -> ControllerTask {
        let key = self.identity.key();
        let state = self.state_tx.subscribe();
        let join = tokio::spawn(self.run());
        ControllerTask { key, state, join }
    }

    fn set_state(&self, state: ControllerState) {
        self.state_tx.send_replace(state);
        debug!(key = %self.identity, %state, "controller state");
    }

    async fn run(self) {
        let key = self.identity.key();
        let mut closed = self.registry.subscribe();
        let mut episode: u64 = 0;

        info!(
            %key,
            holder = %self.lease.holder(),
            mode = ?self.mode,
            ttl = ?self.config.ttl,
            ping_interval = ?self.config.ping_interval,
            restart_interval = ?self.config.restart_interval,
            "lease controller started"
        );

        loop {
            self.set_state(ControllerState::Acquiring);
            if !self.acquire_until_held(&key, &mut closed).await {
                break;
            }

            let Some(registration) = self.registry.register(&key, Arc::clone(&self.lease)) else {
                // Shutdown began while the acquire was in flight.
                self.release(&key).await;
                break;
            };

            episode += 1;
            self.metrics.lease_acquisitions.inc();
            self.metrics.leases_held.inc();
            self.set_state(ControllerState::Active);
            info!(%key, episode, "lease acquired; starting worker");

            let (handle, episode_watch) = LeaseHandle::new(
                episode,
                key.clone(),
                self.config.ttl,
                Instant::now(),
                Arc::clone(&self.lease),
                Arc::clone(&self.metrics),
                Some(registration.ticket()),
            );
            self.worker.run(None, handle);

            let finished = self.wait_for_done(&key, episode, episode_watch, &mut closed).await;
            if finished {
                self.set_state(ControllerState::Releasing);
                self.release_after_episode(&key).await;
            }
            drop(registration);
            self.metrics.leases_held.dec();

            if !finished || self.mode == RunMode::OneShot || self.registry.is_closed() {
                break;
            }
        }

        self.set_state(ControllerState::Terminated);
        info!(%key, episodes = episode, "lease controller terminated");
    }

    /// Retry until the lease is ours.  Returns `false` if the registry was
    /// closed first.
    async fn acquire_until_held(&self, key: &str, closed: &mut watch::Receiver<bool>) -> bool {
        loop {
            if *closed.borrow() {
                return false;
            }

            self.metrics.acquire_attempts.inc();
            match self.lease.acquire(key, self.config.ttl).await {
                Ok(true) => return true,
                Ok(false) => {
                    self.metrics.acquire_contended.inc();
                    debug!(%key, "lease held elsewhere; retrying");
                }
                Err(e) => {
                    self.metrics.store_errors.inc();
                    warn!(%key, error = %e, "lease acquire failed; retrying");
                }
            }

            tokio::select! {
                () = tokio::time::sleep(self.config.ping_interval) => {}
                _ = closed.changed() => {}
            }
        }
    }

    /// Wait for the worker's `done()`.  Returns `false` if the registry was
    /// closed first, in which case the lease is released by whoever closed
    /// it.
    async fn wait_for_done(
        &self,
        key: &str,
        episode: u64,
        mut episode_watch: EpisodeWatch,
        closed: &mut watch::Receiver<bool>,
    ) -> bool {
        let mut lapsed = false;
        let mut handles_dropped = false;

        loop {
            let deadline = episode_watch.deadline();
            tokio::select! {
                res = &mut episode_watch.done_rx, if !handles_dropped => match res {
                    Ok(()) => {
                        debug!(%key, episode, "worker signalled done");
                        return true;
                    }
                    Err(_) => {
                        handles_dropped = true;
                        warn!(%key, episode, "worker dropped its lease handle without calling done");
                    }
                },
                () = tokio::time::sleep_until(deadline), if !lapsed => {
                    // A touch may have moved the deadline while we slept.
                    if episode_watch.deadline() <= Instant::now() {
                        lapsed = true;
                        self.report_lapse(key, episode);
                    }
                }
                res = closed.changed() => {
                    if res.is_err() || *closed.borrow() {
                        return false;
                    }
                }
            }
        }
    }

    fn report_lapse(&self, key: &str, episode: u64) {
        self.metrics.lease_lapsed.inc();
        warn!(%key, episode, "lease expired before the worker called done");
        if let Some(hook) = &self.on_lapse {
            hook(LapseEvent {
                key: key.to_string(),
                episode,
            });
        }
    }

    /// Hold the lease through the restart interval, then release it.
    async fn release_after_episode(&self, key: &str) {
        let restart = self.config.restart_interval;
        // Extending by zero would delete the key; skip straight to release.
        if !restart.is_zero() {
            match self.lease.extend(key, restart).await {
                Ok(Extension::Extended) => {
                    debug!(%key, ?restart, "lease held through restart interval");
                }
                Ok(outcome) => {
                    warn!(%key, ?outcome, "could not hold lease through restart interval");
                }
                Err(e) => {
                    self.metrics.store_errors.inc();
                    warn!(%key, error = %e, "lease extend before release failed");
                }
            }
            tokio::time::sleep(restart).await;
        }
        self.release(key).await;
    }

    async fn release(&self, key: &str) {
        match self.lease.release(key).await {
            Ok(true) => {
                self.metrics.lease_releases.inc();
                info!(%key, "lease released");
            }
            Ok(false) => debug!(%key, "lease already expired or taken over"),
            Err(e) => {
                self.metrics.store_errors.inc();
                warn!(%key, error = %e, "lease release failed; it will lapse after ttl");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Running controller
// ---------------------------------------------------------------------------

/// A started controller.
///
/// Dropping it does not stop the controller; the loop keeps running until
/// it terminates on its own or the process exits.
pub struct ControllerTask {
    key: String,
    state: watch::Receiver<ControllerState>,
    join: JoinHandle<()>,
}

impl ControllerTask {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn state(&self) -> ControllerState {
        *self.state.borrow()
    }

    /// A receiver that observes every state change from now on.
    pub fn subscribe(&self) -> watch::Receiver<ControllerState> {
        self.state.clone()
    }

    /// Wait until the controller is in `target`.
    pub async fn wait_for(&mut self, target: ControllerState) -> Result<()> {
        self.state
            .wait_for(|s| *s == target)
            .await
            .with_context(|| format!("controller for {} stopped before reaching {target}", self.key))?;
        Ok(())
    }

    /// Resolves once the controller has terminated: after its single
    /// episode in one-shot mode, or after the registry was closed.
    pub async fn join(self) -> Result<()> {
        self.join.await.context("lease controller task failed")
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::coordination::memory::MemoryStore;
    use crate::handle::LeaseHandle;
    use crate::worker::WorkerError;

    fn noop(_: Option<WorkerError>, handle: LeaseHandle) {
        handle.done();
    }

    #[test]
    fn missing_worker_fails_fast() {
        let store = MemoryStore::new();
        let err = LeaseController::builder("w")
            .lease(Arc::new(store.lease("a")))
            .build()
            .err();
        assert_eq!(err, Some(BuildError::MissingWorker));
    }

    #[test]
    fn missing_lease_fails_fast() {
        let err = LeaseController::builder("w").worker(noop).build().err();
        assert_eq!(err, Some(BuildError::MissingLease));
    }

    #[test]
    fn empty_id_and_zero_durations_are_rejected() {
        let store = MemoryStore::new();
        let lease: Arc<dyn LeaseCapability> = Arc::new(store.lease("a"));

        let err = LeaseController::builder("")
            .lease(Arc::clone(&lease))
            .worker(noop)
            .build()
            .err();
        assert_eq!(err, Some(BuildError::EmptyWorkerId));

        let err = LeaseController::builder("w")
            .key_prefix("")
            .lease(Arc::clone(&lease))
            .worker(noop)
            .build()
            .err();
        assert_eq!(err, Some(BuildError::EmptyKeyPrefix));

        let err = LeaseController::builder("w")
            .lease(lease)
            .worker(noop)
            .lease_config(LeaseConfig {
                ping_interval: Duration::ZERO,
                ..LeaseConfig::default()
            })
            .build()
            .err();
        assert_eq!(err, Some(BuildError::ZeroDuration("ping_interval")));
    }

    #[test]
    fn defaults_without_options() {
        let store = MemoryStore::new();
        let controller = LeaseController::builder("worker1")
            .lease(Arc::new(store.lease("a")))
            .worker(noop)
            .build()
            .unwrap();

        assert_eq!(controller.key(), "solo:worker1");
        assert_eq!(controller.config().ttl, Duration::from_millis(1000));
        assert_eq!(controller.config().ping_interval, Duration::from_millis(1000));
        assert_eq!(controller.config().restart_interval, Duration::ZERO);
        assert_eq!(controller.mode(), RunMode::Continuous);
        assert_eq!(controller.state(), ControllerState::Idle);
    }

    #[test]
    fn settings_apply_prefix_timings_and_mode() {
        let store = MemoryStore::new();
        let settings = LeaseSettings {
            key_prefix: "jobs".to_string(),
            ttl_ms: 7000,
            ping_interval_ms: 3000,
            restart_interval_ms: 5000,
            mode: RunMode::OneShot,
        };
        let controller = LeaseController::builder("nightly")
            .settings(&settings)
            .lease(Arc::new(store.lease("a")))
            .worker(noop)
            .build()
            .unwrap();

        assert_eq!(controller.key(), "jobs:nightly");
        assert_eq!(controller.config(), settings.lease_config());
        assert_eq!(controller.mode(), RunMode::OneShot);
    }

    #[tokio::test(start_paused = true)]
    async fn one_shot_terminates_and_releases() {
        let store = MemoryStore::new();
        let registry = LeaseRegistry::new();
        let controller = LeaseController::builder("w")
            .lease(Arc::new(store.lease("a")))
            .worker(noop)
            .mode(RunMode::OneShot)
            .registry(registry.clone())
            .build()
            .unwrap();

        let task = controller.start();
        task.join().await.unwrap();
        assert!(store.holder_of("solo:w").is_none());
        assert!(registry.held_keys().is_empty());
    }
}
