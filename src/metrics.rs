use std::sync::Arc;

use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

// ---------------------------------------------------------------------------
// Metrics struct
// ---------------------------------------------------------------------------

/// Every Prometheus metric exposed by the lease controller.
pub struct Metrics {
    // -- acquisition --
    pub acquire_attempts: Counter,
    pub acquire_contended: Counter,
    pub store_errors: Counter,
    pub lease_acquisitions: Counter,

    // -- held lease --
    pub lease_extensions: Counter,
    pub lease_extension_failures: Counter,
    pub lease_lapsed: Counter,
    pub lease_releases: Counter,

    // -- gauges --
    pub leases_held: Gauge,
}

impl Metrics {
    /// Create a new [`Metrics`] instance and register every metric with the
    /// supplied `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let acquire_attempts = Counter::default();
        registry.register(
            "solo_acquire_attempts",
            "Lease acquisition attempts",
            acquire_attempts.clone(),
        );

        let acquire_contended = Counter::default();
        registry.register(
            "solo_acquire_contended",
            "Acquisition attempts refused because another holder owns the lease",
            acquire_contended.clone(),
        );

        let store_errors = Counter::default();
        registry.register(
            "solo_store_errors",
            "Coordination store calls that failed",
            store_errors.clone(),
        );

        let lease_acquisitions = Counter::default();
        registry.register(
            "solo_lease_acquisitions",
            "Successful lease acquisitions (worker episodes started)",
            lease_acquisitions.clone(),
        );

        let lease_extensions = Counter::default();
        registry.register(
            "solo_lease_extensions",
            "Successful lease extensions",
            lease_extensions.clone(),
        );

        let lease_extension_failures = Counter::default();
        registry.register(
            "solo_lease_extension_failures",
            "Lease extensions that were refused, timed out or failed",
            lease_extension_failures.clone(),
        );

        let lease_lapsed = Counter::default();
        registry.register(
            "solo_lease_lapsed",
            "Leases that expired before their worker signalled completion",
            lease_lapsed.clone(),
        );

        let lease_releases = Counter::default();
        registry.register(
            "solo_lease_releases",
            "Lease releases that deleted the key",
            lease_releases.clone(),
        );

        let leases_held: Gauge = Gauge::default();
        registry.register(
            "solo_leases_held",
            "Leases currently held by this process",
            leases_held.clone(),
        );

        Self {
            acquire_attempts,
            acquire_contended,
            store_errors,
            lease_acquisitions,
            lease_extensions,
            lease_extension_failures,
            lease_lapsed,
            lease_releases,
            leases_held,
        }
    }
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Thread-safe wrapper for the metrics registry.
#[derive(Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub metrics: Arc<Metrics>,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    /// Build a fresh registry and pre-register all controller metrics.
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let metrics = Metrics::new(&mut registry);
        Self {
            registry: Arc::new(registry),
            metrics: Arc::new(metrics),
        }
    }

    /// Render the registry in OpenMetrics text format.
    pub fn encode(&self) -> anyhow::Result<String> {
        let mut buf = String::new();
        prometheus_client::encoding::text::encode(&mut buf, &self.registry)
            .map_err(|e| anyhow::anyhow!("metrics encoding failed: {e}"))?;
        Ok(buf)
    }
}
