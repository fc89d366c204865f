//! Per-uplink liveness state machine.
//!
//! One record per interface, advanced by `tick`. Probes are rate-limited
//! globally: at most one per configured interval across all uplinks, which
//! bounds probe traffic regardless of link count. Detection latency scales
//! with the number of uplinks, by contract.

use lb_types::{NeighborState, UplinkTuple};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::HealthConfig;
use crate::kernel::KernelOps;

/// Liveness status of one uplink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    /// Carrying traffic. Initial state for newly observed uplinks.
    Up,
    /// Failed the failure threshold; excluded from the active table.
    Down,
    /// Still failing after the backoff window elapsed.
    Backoff,
    /// Recovered but dwelling before promotion, to suppress flapping.
    HoldDown,
}

/// Health bookkeeping for one uplink.
#[derive(Debug, Clone)]
pub struct HealthRecord {
    pub status: HealthStatus,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    /// Number of transitions into Down within this failure episode.
    pub backoff_count: u32,
    /// Most recent transition into Down.
    pub last_failure_at: Option<Instant>,
    /// Meaningful only in HoldDown.
    pub hold_down_until: Option<Instant>,
}

impl HealthRecord {
    fn new() -> Self {
        Self {
            status: HealthStatus::Up,
            consecutive_failures: 0,
            consecutive_successes: 0,
            backoff_count: 0,
            last_failure_at: None,
            hold_down_until: None,
        }
    }
}

/// A status transition. Only edges that cross the Up boundary force a
/// reconcile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthEdge {
    pub from: HealthStatus,
    pub to: HealthStatus,
}

impl HealthEdge {
    /// True when the transition enters or leaves `Up`.
    pub fn crosses_up(&self) -> bool {
        (self.from == HealthStatus::Up) != (self.to == HealthStatus::Up)
    }
}

/// What one tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Global rate limit not yet elapsed; nothing done.
    NotDue,
    /// Uplink is inside its backoff window; probe withheld.
    Skipped,
    /// Hold-down dwell expired; promoted without probing.
    Promoted(HealthEdge),
    /// A probe ran.
    Probed {
        success: bool,
        edge: Option<HealthEdge>,
    },
}

impl TickOutcome {
    /// Edge that crossed the Up boundary, if any.
    pub fn up_edge(&self) -> Option<HealthEdge> {
        match self {
            Self::Promoted(edge) => Some(*edge).filter(HealthEdge::crosses_up),
            Self::Probed {
                edge: Some(edge), ..
            } => Some(*edge).filter(HealthEdge::crosses_up),
            _ => None,
        }
    }
}

/// Health monitor over all observed uplinks.
pub struct HealthMonitor<K: ?Sized> {
    kernel: Arc<K>,
    cfg: HealthConfig,
    records: HashMap<String, HealthRecord>,
    last_probe_at: Option<Instant>,
}

impl<K: KernelOps + ?Sized> HealthMonitor<K> {
    pub fn new(kernel: Arc<K>, cfg: HealthConfig) -> Self {
        Self {
            kernel,
            cfg,
            records: HashMap::new(),
            last_probe_at: None,
        }
    }

    /// Creates records for newly observed uplinks and prunes records for
    /// interfaces that left the sample. Pruned uplinks carry no kernel state
    /// of their own once the applier removed their return table.
    pub fn sync(&mut self, tuples: &[UplinkTuple]) {
        for tuple in tuples {
            self.records
                .entry(tuple.iface.clone())
                .or_insert_with(HealthRecord::new);
        }
        let seen: BTreeSet<&str> = tuples.iter().map(|t| t.iface.as_str()).collect();
        self.records.retain(|iface, _| seen.contains(iface.as_str()));
    }

    pub fn record(&self, iface: &str) -> Option<&HealthRecord> {
        self.records.get(iface)
    }

    /// An uplink is eligible for the active table only while Up. Unknown
    /// interfaces count as Up because records are created Up on first sight.
    pub fn is_up(&self, iface: &str) -> bool {
        self.records
            .get(iface)
            .map(|r| r.status == HealthStatus::Up)
            .unwrap_or(true)
    }

    /// Interfaces of the sample that are currently Up, in canonical order.
    pub fn up_set(&self, tuples: &[UplinkTuple]) -> BTreeSet<String> {
        tuples
            .iter()
            .filter(|t| self.is_up(&t.iface))
            .map(|t| t.iface.clone())
            .collect()
    }

    /// True once the global probe interval has elapsed.
    pub fn due(&self, now: Instant) -> bool {
        match self.last_probe_at {
            Some(last) => now.saturating_duration_since(last) >= self.cfg.interval(),
            None => true,
        }
    }

    /// Advances the state machine for one uplink.
    pub async fn tick(&mut self, tuple: &UplinkTuple, now: Instant) -> TickOutcome {
        if !self.due(now) {
            return TickOutcome::NotDue;
        }
        self.sync_one(tuple);

        let (status, hold_down_until, last_failure_at, backoff_count) = {
            let rec = &self.records[&tuple.iface];
            (
                rec.status,
                rec.hold_down_until,
                rec.last_failure_at,
                rec.backoff_count,
            )
        };
        match status {
            HealthStatus::HoldDown => {
                if hold_down_until.map(|t| now >= t).unwrap_or(true) {
                    // Dwell served with no intervening failure.
                    let edge = self.promote(&tuple.iface);
                    return TickOutcome::Promoted(edge);
                }
            }
            HealthStatus::Down | HealthStatus::Backoff => {
                let elapsed = last_failure_at
                    .map(|t| now.saturating_duration_since(t))
                    .unwrap_or(Duration::MAX);
                if elapsed < self.backoff_window(backoff_count) {
                    tracing::debug!(iface = %tuple.iface, "probe withheld inside backoff window");
                    return TickOutcome::Skipped;
                }
            }
            HealthStatus::Up => {}
        }

        self.last_probe_at = Some(now);
        let success = self.probe(tuple).await;
        let edge = self.apply_outcome(&tuple.iface, success, now);
        TickOutcome::Probed { success, edge }
    }

    fn sync_one(&mut self, tuple: &UplinkTuple) {
        self.records
            .entry(tuple.iface.clone())
            .or_insert_with(HealthRecord::new);
    }

    /// Backoff window for the given episode depth:
    /// `min(backoff_base * 2^count, backoff_max)`.
    fn backoff_window(&self, backoff_count: u32) -> Duration {
        let base = self.cfg.backoff_base();
        let shift = backoff_count.min(16);
        let window = base.saturating_mul(1u32 << shift);
        window.min(self.cfg.backoff_max())
    }

    /// One end-to-end probe: neighbor gate first, then a bound TCP connect.
    async fn probe(&self, tuple: &UplinkTuple) -> bool {
        if self.cfg.neighbor_reachability {
            match self.kernel.neighbor_state(&tuple.iface, tuple.gw).await {
                Ok(NeighborState::Stale) => {
                    // Force a fresh ARP exchange on the next packet and count
                    // the uplink as alive for this round.
                    if let Err(e) = self.kernel.neighbor_flush(&tuple.iface, tuple.gw).await {
                        tracing::warn!(iface = %tuple.iface, error = %e, "neighbor flush failed");
                    }
                    return true;
                }
                Ok(state) if state.is_dead() => {
                    tracing::info!(iface = %tuple.iface, gw = %tuple.gw, ?state, "neighbor unreachable");
                    return false;
                }
                Ok(_) => {}
                Err(e) => {
                    // Be permissive: a failed read must not fail the uplink.
                    tracing::warn!(iface = %tuple.iface, error = %e, "neighbor state read failed");
                }
            }
        }

        self.kernel
            .dial_tcp(
                tuple.src_ip,
                self.cfg.probe_target,
                self.cfg.probe_port,
                self.cfg.timeout(),
            )
            .await
    }

    fn promote(&mut self, iface: &str) -> HealthEdge {
        let rec = self.records.get_mut(iface).expect("record exists");
        let edge = HealthEdge {
            from: rec.status,
            to: HealthStatus::Up,
        };
        rec.status = HealthStatus::Up;
        rec.consecutive_failures = 0;
        rec.consecutive_successes = 0;
        rec.hold_down_until = None;
        tracing::info!(iface, "uplink promoted after hold-down");
        edge
    }

    fn apply_outcome(&mut self, iface: &str, success: bool, now: Instant) -> Option<HealthEdge> {
        let failure_threshold = self.cfg.failure_threshold;
        let recovery_threshold = self.cfg.recovery_threshold;
        let hysteresis = self.cfg.hysteresis_enabled;
        let hold_down = self.cfg.hold_down();

        let rec = self.records.get_mut(iface).expect("record exists");
        let from = rec.status;

        let to = if success {
            rec.consecutive_failures = 0;
            rec.consecutive_successes += 1;
            match from {
                HealthStatus::Up | HealthStatus::HoldDown => from,
                HealthStatus::Down | HealthStatus::Backoff => {
                    if rec.consecutive_successes >= recovery_threshold {
                        if hysteresis {
                            rec.hold_down_until = Some(now + hold_down);
                            rec.backoff_count = 0;
                            HealthStatus::HoldDown
                        } else {
                            rec.consecutive_successes = 0;
                            HealthStatus::Up
                        }
                    } else {
                        from
                    }
                }
            }
        } else {
            rec.consecutive_successes = 0;
            match from {
                HealthStatus::Up => {
                    rec.consecutive_failures += 1;
                    if rec.consecutive_failures >= failure_threshold {
                        rec.last_failure_at = Some(now);
                        rec.backoff_count += 1;
                        HealthStatus::Down
                    } else {
                        HealthStatus::Up
                    }
                }
                // Reached only once the backoff window has elapsed.
                HealthStatus::Down | HealthStatus::Backoff => HealthStatus::Backoff,
                HealthStatus::HoldDown => {
                    rec.last_failure_at = Some(now);
                    rec.backoff_count += 1;
                    rec.hold_down_until = None;
                    HealthStatus::Down
                }
            }
        };

        if to == from {
            rec.status = to;
            return None;
        }
        rec.status = to;
        let edge = HealthEdge { from, to };
        if edge.crosses_up() {
            tracing::warn!(iface, ?from, ?to, "uplink health edge");
        } else {
            tracing::info!(iface, ?from, ?to, "uplink health transition");
        }
        Some(edge)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::MockKernel;
    use std::net::Ipv4Addr;

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    fn wlan() -> UplinkTuple {
        UplinkTuple::new("wlan0", ip("192.168.1.1"), ip("192.168.1.50"))
    }

    fn monitor(kernel: Arc<MockKernel>) -> HealthMonitor<MockKernel> {
        let mut cfg = HealthConfig::default();
        cfg.interval_secs = 30;
        HealthMonitor::new(kernel, cfg)
    }

    /// Ticks with the rate limit satisfied by advancing a synthetic clock.
    struct Clock {
        now: Instant,
    }

    impl Clock {
        fn new() -> Self {
            Self {
                now: Instant::now(),
            }
        }

        fn advance(&mut self, secs: u64) -> Instant {
            self.now += Duration::from_secs(secs);
            self.now
        }
    }

    #[tokio::test]
    async fn two_failures_take_an_uplink_down() {
        let kernel = Arc::new(MockKernel::new());
        kernel.set_dial_result(ip("192.168.1.50"), false);
        let mut mon = monitor(kernel);
        let mut clock = Clock::new();
        mon.sync(&[wlan()]);

        let first = mon.tick(&wlan(), clock.advance(1)).await;
        assert_eq!(
            first,
            TickOutcome::Probed {
                success: false,
                edge: None
            }
        );
        assert!(mon.is_up("wlan0"));

        let second = mon.tick(&wlan(), clock.advance(30)).await;
        let edge = second.up_edge().expect("second failure crosses Up");
        assert_eq!(edge.from, HealthStatus::Up);
        assert_eq!(edge.to, HealthStatus::Down);
        assert!(!mon.is_up("wlan0"));
        assert_eq!(mon.record("wlan0").unwrap().backoff_count, 1);
    }

    #[tokio::test]
    async fn global_rate_limit_spans_interfaces() {
        let kernel = Arc::new(MockKernel::new());
        let mut mon = monitor(kernel);
        let mut clock = Clock::new();
        let eth = UplinkTuple::new("eth0", ip("10.0.0.1"), ip("10.0.0.2"));
        mon.sync(&[eth.clone(), wlan()]);

        let now = clock.advance(1);
        assert!(matches!(
            mon.tick(&eth, now).await,
            TickOutcome::Probed { .. }
        ));
        // Second interface in the same round is rate-limited.
        assert_eq!(mon.tick(&wlan(), now).await, TickOutcome::NotDue);
        assert!(matches!(
            mon.tick(&wlan(), clock.advance(30)).await,
            TickOutcome::Probed { .. }
        ));
    }

    #[tokio::test]
    async fn recovery_with_hysteresis_dwells_in_hold_down() {
        let kernel = Arc::new(MockKernel::new());
        kernel.set_dial_result(ip("192.168.1.50"), false);
        let mut mon = monitor(kernel.clone());
        let mut clock = Clock::new();
        mon.sync(&[wlan()]);

        mon.tick(&wlan(), clock.advance(1)).await;
        mon.tick(&wlan(), clock.advance(30)).await;
        assert!(!mon.is_up("wlan0"));

        // Inside the 60 s backoff window (backoff_count = 1) probes are
        // withheld entirely.
        kernel.set_dial_result(ip("192.168.1.50"), true);
        assert_eq!(mon.tick(&wlan(), clock.advance(31)).await, TickOutcome::Skipped);

        // Past the window a probe runs; one success meets the default
        // recovery threshold, but hysteresis holds the uplink down.
        let outcome = mon.tick(&wlan(), clock.advance(30)).await;
        assert!(outcome.up_edge().is_none());
        assert_eq!(
            mon.record("wlan0").unwrap().status,
            HealthStatus::HoldDown
        );
        assert_eq!(mon.record("wlan0").unwrap().backoff_count, 0);
        assert!(!mon.is_up("wlan0"));

        // Before the dwell expires a tick probes but does not promote.
        let outcome = mon.tick(&wlan(), clock.advance(30)).await;
        assert!(outcome.up_edge().is_none());
        assert_eq!(mon.record("wlan0").unwrap().status, HealthStatus::HoldDown);

        // After 60 s the next tick promotes without probing.
        let outcome = mon.tick(&wlan(), clock.advance(31)).await;
        let edge = outcome.up_edge().expect("promotion crosses Up");
        assert_eq!(edge.from, HealthStatus::HoldDown);
        assert!(mon.is_up("wlan0"));
    }

    #[tokio::test]
    async fn hold_down_failure_demotes() {
        let kernel = Arc::new(MockKernel::new());
        kernel.set_dial_result(ip("192.168.1.50"), false);
        let mut mon = monitor(kernel.clone());
        let mut clock = Clock::new();
        mon.sync(&[wlan()]);

        mon.tick(&wlan(), clock.advance(1)).await;
        mon.tick(&wlan(), clock.advance(30)).await;
        kernel.set_dial_result(ip("192.168.1.50"), true);
        // Past the 60 s backoff window so the recovery probe actually runs.
        mon.tick(&wlan(), clock.advance(61)).await;
        assert_eq!(mon.record("wlan0").unwrap().status, HealthStatus::HoldDown);

        kernel.set_dial_result(ip("192.168.1.50"), false);
        let outcome = mon.tick(&wlan(), clock.advance(30)).await;
        assert!(outcome.up_edge().is_none());
        assert_eq!(mon.record("wlan0").unwrap().status, HealthStatus::Down);
        assert_eq!(mon.record("wlan0").unwrap().backoff_count, 1);
    }

    #[tokio::test]
    async fn backoff_window_withholds_probes() {
        let kernel = Arc::new(MockKernel::new());
        kernel.set_dial_result(ip("192.168.1.50"), false);
        let mut cfg = HealthConfig::default();
        cfg.hysteresis_enabled = false;
        let mut mon = HealthMonitor::new(kernel.clone(), cfg);
        let mut clock = Clock::new();
        mon.sync(&[wlan()]);

        // Three quick Up→Down cycles: recovery without hysteresis keeps
        // backoff_count, so the window grows 30 → 60 → 120 → 240.
        for _ in 0..3 {
            kernel.set_dial_result(ip("192.168.1.50"), false);
            mon.tick(&wlan(), clock.advance(35)).await;
            mon.tick(&wlan(), clock.advance(35)).await;
            assert!(!mon.is_up("wlan0"));
            kernel.set_dial_result(ip("192.168.1.50"), true);
            // Past the current backoff window so the probe actually runs.
            mon.tick(&wlan(), clock.advance(300)).await;
            assert!(mon.is_up("wlan0"));
        }
        assert_eq!(mon.record("wlan0").unwrap().backoff_count, 3);

        kernel.set_dial_result(ip("192.168.1.50"), false);
        mon.tick(&wlan(), clock.advance(35)).await;
        mon.tick(&wlan(), clock.advance(35)).await;
        assert_eq!(mon.record("wlan0").unwrap().backoff_count, 4);

        // Inside min(30 * 2^4, 300) = 300 s the probe is withheld.
        assert_eq!(mon.tick(&wlan(), clock.advance(100)).await, TickOutcome::Skipped);
        assert!(matches!(
            mon.tick(&wlan(), clock.advance(250)).await,
            TickOutcome::Probed { .. }
        ));
    }

    #[tokio::test]
    async fn failed_neighbor_short_circuits_probe() {
        let kernel = Arc::new(MockKernel::new());
        // TCP would succeed, but the neighbor entry is dead.
        kernel.set_dial_result(ip("192.168.1.50"), true);
        kernel.set_neighbor("wlan0", ip("192.168.1.1"), NeighborState::Failed);
        let mut mon = monitor(kernel.clone());
        let mut clock = Clock::new();
        mon.sync(&[wlan()]);

        mon.tick(&wlan(), clock.advance(1)).await;
        let outcome = mon.tick(&wlan(), clock.advance(30)).await;
        assert!(outcome.up_edge().is_some());
        assert!(!mon.is_up("wlan0"));
    }

    #[tokio::test]
    async fn stale_neighbor_is_flushed_and_passes() {
        let kernel = Arc::new(MockKernel::new());
        kernel.set_dial_result(ip("192.168.1.50"), false);
        kernel.set_neighbor("wlan0", ip("192.168.1.1"), NeighborState::Stale);
        let mut mon = monitor(kernel.clone());
        let mut clock = Clock::new();
        mon.sync(&[wlan()]);

        let outcome = mon.tick(&wlan(), clock.advance(1)).await;
        assert_eq!(
            outcome,
            TickOutcome::Probed {
                success: true,
                edge: None
            }
        );
        let ops = kernel.take_ops();
        assert!(ops.iter().any(|op| matches!(
            op,
            crate::kernel::KernelOp::NeighborFlush { iface, .. } if iface == "wlan0"
        )));
    }

    #[tokio::test]
    async fn pruning_forgets_departed_interfaces() {
        let kernel = Arc::new(MockKernel::new());
        let mut mon = monitor(kernel);
        mon.sync(&[wlan()]);
        assert!(mon.record("wlan0").is_some());
        mon.sync(&[]);
        assert!(mon.record("wlan0").is_none());
    }
}
