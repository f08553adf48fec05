/// Misconfiguration detected while building a [`crate::LeaseController`].
///
/// A controller that fails to build never starts its loop and never
/// touches the coordination store.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum BuildError {
    /// No worker callback was supplied.
    #[error("no worker callback supplied")]
    MissingWorker,
    /// No lease capability (coordination-store client) was supplied.
    #[error("no lease capability supplied")]
    MissingLease,
    /// The worker id is empty.
    #[error("worker id must not be empty")]
    EmptyWorkerId,
    /// The key prefix is empty.
    #[error("key prefix must not be empty")]
    EmptyKeyPrefix,
    /// `ttl` or `ping_interval` is zero.
    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),
}
