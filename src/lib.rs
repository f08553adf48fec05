//! Run a worker in at most one process at a time.
//!
//! Every process registers a [`LeaseController`] under the same worker id.
//! The controller keeps trying to take a lease on `prefix:id` in a shared
//! coordination store; the process that gets it runs its [`Worker`] and
//! keeps the lease alive through the [`LeaseHandle`] until the worker calls
//! [`LeaseHandle::done`].  The lease is then released and, in continuous
//! mode, the cycle starts over.  A process that dies without releasing
//! blocks the others for at most one ttl; a process that receives
//! SIGINT/SIGTERM releases first (see [`shutdown::TerminationHook`]).
//!
//! ```rust,ignore
//! let pool = solo::coordination::redis::create_pool(&config.redis).await?;
//! let lease = RedisLease::new(pool, holder_token(&node_id()), config.redis.command_timeout());
//!
//! TerminationHook::install(LeaseRegistry::global());
//! let task = LeaseController::builder("nightly-report")
//!     .settings(&config.lease)
//!     .lease(Arc::new(lease))
//!     .worker(|_err: Option<WorkerError>, handle: LeaseHandle| {
//!         tokio::spawn(async move {
//!             generate_report().await;
//!             handle.done();
//!         });
//!     })
//!     .build()?
//!     .start();
//! ```

pub mod command;
pub mod config;
pub mod controller;
pub mod coordination;
pub mod error;
pub mod handle;
pub mod health;
pub mod http;
pub mod metrics;
pub mod shutdown;
pub mod worker;

pub use config::{LeaseConfig, RunMode, SoloConfig, WorkerIdentity};
pub use controller::{ControllerBuilder, ControllerState, ControllerTask, LeaseController};
pub use coordination::{Extension, LeaseCapability};
pub use error::BuildError;
pub use handle::LeaseHandle;
pub use shutdown::{LeaseRegistry, ShutdownNotice, TerminationHook};
pub use worker::{LapseEvent, Worker, WorkerError};
