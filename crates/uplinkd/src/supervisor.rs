//! Supervisor: wires observer → sampler → health → reconciler, debounces
//! ticks, runs the periodic health schedule, and guarantees cleanup on
//! shutdown.

use lb_types::UplinkTuple;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

use crate::config::Config;
use crate::error::Result;
use crate::health::{HealthMonitor, TickOutcome};
use crate::kernel::KernelOps;
use crate::metrics::MetricsCollector;
use crate::netlink::RouteEvent;
use crate::reconcile::Reconciler;
use crate::sampler;

/// Snapshot of the last state successfully applied to the kernel. Reconciles
/// are skipped while the snapshot is unchanged; a failed reconcile clears it
/// so the next tick retries from scratch.
type Snapshot = (Vec<UplinkTuple>, BTreeSet<String>);

/// The main control loop. Sole kernel writer.
pub struct Supervisor<K: ?Sized> {
    kernel: Arc<K>,
    cfg: Config,
    monitor: HealthMonitor<K>,
    reconciler: Reconciler<K>,
    metrics: MetricsCollector,
    sample: Vec<UplinkTuple>,
    last_applied: Option<Snapshot>,
    /// Round-robin cursor: with the global probe rate limit, uplinks take
    /// turns across ticks.
    probe_cursor: usize,
}

impl<K: KernelOps + ?Sized> Supervisor<K> {
    pub fn new(kernel: Arc<K>, cfg: Config, metrics: MetricsCollector) -> Self {
        let monitor = HealthMonitor::new(kernel.clone(), cfg.health.clone());
        let reconciler = Reconciler::new(kernel.clone(), cfg.clone());
        Self {
            kernel,
            cfg,
            monitor,
            reconciler,
            metrics,
            sample: Vec::new(),
            last_applied: None,
            probe_cursor: 0,
        }
    }

    /// Runs until SIGINT/SIGTERM, then tears down the kernel state.
    pub async fn run(&mut self, mut ticks: mpsc::Receiver<RouteEvent>) -> Result<()> {
        // Keeps a replacement channel's sender alive if the observer dies,
        // so the recv branch pends instead of spinning on a closed channel.
        let mut observer_guard: Option<mpsc::Sender<RouteEvent>> = None;
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;

        let mut health_timer = tokio::time::interval(self.cfg.health.interval());
        health_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = sigint.recv() => {
                    tracing::info!("received SIGINT");
                    break;
                }
                _ = sigterm.recv() => {
                    tracing::info!("received SIGTERM");
                    break;
                }
                event = ticks.recv() => {
                    match event {
                        Some(RouteEvent) => {
                            self.debounce(&mut ticks).await;
                            self.converge(Instant::now()).await;
                        }
                        None => {
                            // The periodic health pass still drives
                            // reconciles; keep running degraded.
                            tracing::error!("route observer stream ended, continuing on the health timer");
                            let (tx, rx) = mpsc::channel(1);
                            observer_guard = Some(tx);
                            ticks = rx;
                        }
                    }
                }
                _ = health_timer.tick() => {
                    self.converge(Instant::now()).await;
                }
            }
        }

        drop(observer_guard);
        tracing::info!("shutting down, removing kernel state");
        let result = self.reconciler.cleanup().await;
        if result.is_ok() {
            tracing::info!("cleanup complete");
        }
        result
    }

    /// Trailing debounce: wait out the quiet period, then fold the burst
    /// into a single converge.
    async fn debounce(&self, ticks: &mut mpsc::Receiver<RouteEvent>) {
        tokio::time::sleep(self.cfg.debounce()).await;
        let mut coalesced = 0usize;
        while ticks.try_recv().is_ok() {
            coalesced += 1;
        }
        if coalesced > 0 {
            tracing::debug!(coalesced, "debounce folded route events");
        }
    }

    /// One pass: resample, advance health, reconcile when the snapshot
    /// moved. Both the event path and the periodic timer land here, so
    /// liveness transitions reach the kernel even when the observer stalls.
    async fn converge(&mut self, now: Instant) {
        match sampler::sample(&*self.kernel).await {
            Ok(sample) => {
                self.monitor.sync(&sample);
                self.sample = sample;
            }
            Err(e) => {
                tracing::error!(error = %e, "sampling failed, keeping previous sample");
            }
        }

        if self.cfg.health.enabled && !self.sample.is_empty() && self.monitor.due(now) {
            let tuple = self.sample[self.probe_cursor % self.sample.len()].clone();
            self.probe_cursor = self.probe_cursor.wrapping_add(1);
            match self.monitor.tick(&tuple, now).await {
                TickOutcome::Probed { success, edge } => {
                    self.metrics.probes_total.inc();
                    if !success {
                        self.metrics.probe_failures_total.inc();
                    }
                    if edge.is_some_and(|e| e.crosses_up()) {
                        self.metrics.health_edges_total.inc();
                    }
                }
                TickOutcome::Promoted(_) => {
                    self.metrics.health_edges_total.inc();
                }
                TickOutcome::NotDue | TickOutcome::Skipped => {}
            }
        }

        self.maybe_reconcile().await;
    }

    async fn maybe_reconcile(&mut self) {
        let up = self.monitor.up_set(&self.sample);
        self.metrics.observe_sample(self.sample.len(), up.len());

        let snapshot: Snapshot = (self.sample.clone(), up);
        if self.last_applied.as_ref() == Some(&snapshot) {
            tracing::debug!("snapshot unchanged, skipping reconcile");
            return;
        }

        match self.reconciler.reconcile(&snapshot.0, &snapshot.1).await {
            Ok(()) => {
                self.metrics.reconciles_total.inc();
                self.last_applied = Some(snapshot);
            }
            Err(e) => {
                self.metrics.reconcile_failures_total.inc();
                tracing::error!(error = %e, "reconcile failed, will retry on next tick");
                self.last_applied = None;
            }
        }
    }
}
