//! Prometheus metric collection.
//!
//! Collection only: the exposition endpoint is owned by an external
//! collaborator that reads from the registry.

use prometheus::{Counter, Gauge, Opts, Registry};
use std::sync::Arc;

/// Metric handles shared across the daemon.
#[derive(Clone)]
pub struct MetricsCollector {
    pub reconciles_total: Counter,
    pub reconcile_failures_total: Counter,
    pub probes_total: Counter,
    pub probe_failures_total: Counter,
    pub health_edges_total: Counter,

    pub uplinks_observed: Gauge,
    pub uplinks_active: Gauge,

    pub registry: Arc<Registry>,
}

impl MetricsCollector {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let reconciles_total = Counter::with_opts(Opts::new(
            "uplinkd_reconciles_total",
            "Total number of reconcile passes applied",
        ))?;
        registry.register(Box::new(reconciles_total.clone()))?;

        let reconcile_failures_total = Counter::with_opts(Opts::new(
            "uplinkd_reconcile_failures_total",
            "Total number of reconcile passes with failed kernel mutations",
        ))?;
        registry.register(Box::new(reconcile_failures_total.clone()))?;

        let probes_total = Counter::with_opts(Opts::new(
            "uplinkd_probes_total",
            "Total number of health probes executed",
        ))?;
        registry.register(Box::new(probes_total.clone()))?;

        let probe_failures_total = Counter::with_opts(Opts::new(
            "uplinkd_probe_failures_total",
            "Total number of failed health probes",
        ))?;
        registry.register(Box::new(probe_failures_total.clone()))?;

        let health_edges_total = Counter::with_opts(Opts::new(
            "uplinkd_health_edges_total",
            "Total number of health transitions crossing the Up boundary",
        ))?;
        registry.register(Box::new(health_edges_total.clone()))?;

        let uplinks_observed = Gauge::with_opts(Opts::new(
            "uplinkd_uplinks_observed",
            "Default-route uplinks in the latest sample",
        ))?;
        registry.register(Box::new(uplinks_observed.clone()))?;

        let uplinks_active = Gauge::with_opts(Opts::new(
            "uplinkd_uplinks_active",
            "Healthy uplinks carrying new flows",
        ))?;
        registry.register(Box::new(uplinks_active.clone()))?;

        Ok(Self {
            reconciles_total,
            reconcile_failures_total,
            probes_total,
            probe_failures_total,
            health_edges_total,
            uplinks_observed,
            uplinks_active,
            registry: Arc::new(registry),
        })
    }

    pub fn observe_sample(&self, observed: usize, active: usize) {
        self.uplinks_observed.set(observed as f64);
        self.uplinks_active.set(active as f64);
    }
}
