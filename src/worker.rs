//! The caller-supplied unit of work and its diagnostic hooks.

use std::sync::Arc;

use crate::handle::LeaseHandle;

/// Failure passed to a worker in place of a handle-only invocation.
///
/// The controller never constructs one today: every invocation carries
/// `None`.  The slot exists so failures can be reported later without
/// changing the [`Worker`] signature.
#[derive(thiserror::Error, Debug, Clone)]
#[error("{message}")]
#[non_exhaustive]
pub struct WorkerError {
    pub message: String,
}

/// Work run while this process holds the lease.
///
/// `run` is called exactly once per acquisition episode, on the
/// controller's task, and must not block: long work should be spawned and
/// keep the lease alive with [`LeaseHandle::touch`] or
/// [`LeaseHandle::extend`] at an interval shorter than the ttl.  The episode
/// ends when [`LeaseHandle::done`] is called.
///
/// Any `Fn(Option<WorkerError>, LeaseHandle)` closure is a worker.
pub trait Worker: Send + Sync + 'static {
    fn run(&self, error: Option<WorkerError>, handle: LeaseHandle);
}

impl<F> Worker for F
where
    F: Fn(Option<WorkerError>, LeaseHandle) + Send + Sync + 'static,
{
    fn run(&self, error: Option<WorkerError>, handle: LeaseHandle) {
        self(error, handle)
    }
}

/// Reported when a lease expired while its worker had not called `done()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LapseEvent {
    pub key: String,
    pub episode: u64,
}

pub type LapseHook = Arc<dyn Fn(LapseEvent) + Send + Sync>;
