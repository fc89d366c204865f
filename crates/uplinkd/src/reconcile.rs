//! Reconciler: desired kernel state from `(sample, health)` plus the applier
//! that converges the kernel toward it.
//!
//! Plan computation is pure and fully deterministic for identical inputs:
//! rule preferences and nexthop order both derive from the canonical sample
//! order. The applier issues mutations in contract order (return tables,
//! active table/rule, draining table/rule, nftables, route-cache flush) and
//! is best-effort: a failed mutation is logged and the next reconcile
//! re-issues the full desired state.

use lb_common::LbResult;
use lb_types::link::weight_of;
use lb_types::{NexthopSpec, RouteSpec, RuleMatch, RuleSelector, UplinkTuple};
use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::sync::Arc;

use crate::config::Config;
use crate::error::{Result, UplinkdError};
use crate::kernel::KernelOps;
use crate::nft::{self, NftPlan};
use crate::tables::{
    ACTIVE_MARK, AFFINITY_MASK, DRAINING_MARK, NFT_MANGLE_CHAIN, NFT_POSTROUTING_CHAIN,
    OVERLAY_RANGE, RETURN_PREF_BASE, RETURN_TABLE_BASE,
};

/// Per-interface return table: answers arriving at an uplink's address leave
/// through that uplink, regardless of the overlay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReturnTable {
    pub table: u32,
    pub pref: u32,
    pub src_ip: Ipv4Addr,
    pub routes: [RouteSpec; 2],
}

/// One affinity shard: a single-uplink table selected by the masked mark.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AffinityShard {
    pub table: u32,
    pub pref: u32,
    pub mark: u32,
    pub route: RouteSpec,
}

/// How new flows are steered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActivePlan {
    /// One weighted multipath default in the active table.
    Multipath(RouteSpec),
    /// Per-uplink shard tables selected by the hashed connection mark.
    Affinity(Vec<AffinityShard>),
}

/// Desired kernel state for one reconcile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    pub return_tables: Vec<ReturnTable>,
    pub active: ActivePlan,
    /// Weight-1 multipath over the unhealthy uplinks, when any exist and
    /// draining is enabled.
    pub draining: Option<RouteSpec>,
    pub nft: NftPlan,
}

/// Computes the desired state. Returns `None` when no uplink is healthy: the
/// multipath rebuild is skipped entirely and existing rules drain naturally.
pub fn plan(cfg: &Config, sample: &[UplinkTuple], up: &BTreeSet<String>) -> Option<Plan> {
    let (active, draining): (Vec<&UplinkTuple>, Vec<&UplinkTuple>) =
        sample.iter().partition(|t| up.contains(&t.iface));
    if active.is_empty() {
        return None;
    }

    let return_tables = sample
        .iter()
        .enumerate()
        .map(|(i, t)| ReturnTable {
            table: RETURN_TABLE_BASE + i as u32,
            pref: RETURN_PREF_BASE + i as u32,
            src_ip: t.src_ip,
            routes: [
                RouteSpec::gateway_link(t.gw, t.iface.clone(), t.src_ip),
                RouteSpec::default_via(t.gw, t.iface.clone()),
            ],
        })
        .collect();

    let active_plan = if cfg.routing.affinity_enabled && active.len() > 1 {
        ActivePlan::Affinity(
            active
                .iter()
                .enumerate()
                .map(|(i, t)| AffinityShard {
                    table: cfg.shard_table(i as u32),
                    pref: cfg.shard_pref(i as u32),
                    mark: ACTIVE_MARK | i as u32,
                    route: RouteSpec::default_via(t.gw, t.iface.clone()),
                })
                .collect(),
        )
    } else {
        ActivePlan::Multipath(RouteSpec::default_multipath(
            active
                .iter()
                .map(|t| NexthopSpec::new(t.gw, t.iface.clone(), weight_of(&t.iface)))
                .collect(),
        ))
    };

    let draining_route = if cfg.routing.draining_enabled && !draining.is_empty() {
        Some(RouteSpec::default_multipath(
            draining
                .iter()
                .map(|t| NexthopSpec::new(t.gw, t.iface.clone(), 1))
                .collect(),
        ))
    } else {
        None
    };

    let nft = nft::build(
        cfg.routing.affinity_enabled,
        cfg.nat.consistent_nat,
        active.len(),
        sample,
    );

    Some(Plan {
        return_tables,
        active: active_plan,
        draining: draining_route,
        nft,
    })
}

/// Applies plans and runs shutdown cleanup. The sole kernel writer.
pub struct Reconciler<K: ?Sized> {
    kernel: Arc<K>,
    cfg: Config,
}

/// Best-effort mutation tracker: failures are logged and counted, never
/// short-circuit the pass.
struct BestEffort {
    failed: usize,
}

impl BestEffort {
    fn new() -> Self {
        Self { failed: 0 }
    }

    fn note(&mut self, op: &str, result: LbResult<()>) {
        if let Err(e) = result {
            self.failed += 1;
            tracing::error!(op, error = %e, "kernel mutation failed");
        }
    }

    fn finish(self) -> Result<()> {
        if self.failed == 0 {
            Ok(())
        } else {
            Err(UplinkdError::Reconcile(self.failed))
        }
    }
}

impl<K: KernelOps + ?Sized> Reconciler<K> {
    pub fn new(kernel: Arc<K>, cfg: Config) -> Self {
        Self { kernel, cfg }
    }

    /// Computes and applies the desired state for one snapshot.
    pub async fn reconcile(&self, sample: &[UplinkTuple], up: &BTreeSet<String>) -> Result<()> {
        let Some(plan) = plan(&self.cfg, sample, up) else {
            tracing::warn!("no healthy uplink, leaving existing kernel state to drain");
            return Ok(());
        };
        tracing::info!(
            uplinks = sample.len(),
            active = up.len(),
            draining = sample.len() - up.len(),
            "reconciling"
        );
        self.apply(&plan).await
    }

    async fn apply(&self, plan: &Plan) -> Result<()> {
        let k = &self.kernel;
        let cfg = &self.cfg;
        let mut eff = BestEffort::new();

        // Return tables and their source-address rules.
        for rt in &plan.return_tables {
            eff.note("flush return table", k.flush_table(rt.table).await);
            eff.note(
                "drop return rules",
                k.del_rules_matching(RuleMatch::Table(rt.table)).await,
            );
            for route in &rt.routes {
                eff.note("add return route", k.add_route(rt.table, route).await);
            }
            eff.note(
                "add return rule",
                k.add_rule(RuleSelector::From(rt.src_ip), rt.table, rt.pref)
                    .await,
            );
        }

        // Active overlay.
        let active_table = cfg.active_table();
        let lb_pref = cfg.routing.lb_pref;
        eff.note("flush active table", k.flush_table(active_table).await);
        eff.note(
            "drop active rule",
            k.del_rules_matching(RuleMatch::Pref(lb_pref)).await,
        );
        // Stale shard state from a previous pass is cleared before rebuild.
        if cfg.routing.affinity_enabled {
            for i in 0..OVERLAY_RANGE - 1 {
                eff.note("flush shard table", k.flush_table(cfg.shard_table(i)).await);
                eff.note(
                    "drop shard rule",
                    k.del_rules_matching(RuleMatch::Pref(cfg.shard_pref(i))).await,
                );
            }
        }
        match &plan.active {
            ActivePlan::Multipath(route) => {
                eff.note("add active route", k.add_route(active_table, route).await);
                eff.note(
                    "add active rule",
                    k.add_rule(RuleSelector::Fwmark(ACTIVE_MARK), active_table, lb_pref)
                        .await,
                );
            }
            ActivePlan::Affinity(shards) => {
                for shard in shards {
                    eff.note("add shard route", k.add_route(shard.table, &shard.route).await);
                    eff.note(
                        "add shard rule",
                        k.add_rule(
                            RuleSelector::FwmarkMasked {
                                mark: shard.mark,
                                mask: AFFINITY_MASK,
                            },
                            shard.table,
                            shard.pref,
                        )
                        .await,
                    );
                }
            }
        }

        // Draining overlay.
        let draining_table = cfg.draining_table();
        eff.note("flush draining table", k.flush_table(draining_table).await);
        eff.note(
            "drop draining rule",
            k.del_rules_matching(RuleMatch::Pref(lb_pref + 1)).await,
        );
        if let Some(route) = &plan.draining {
            eff.note("add draining route", k.add_route(draining_table, route).await);
            eff.note(
                "add draining rule",
                k.add_rule(
                    RuleSelector::Fwmark(DRAINING_MARK),
                    draining_table,
                    lb_pref + 1,
                )
                .await,
            );
        }

        // nftables marking and masquerade.
        eff.note("reset nft table", k.nft_reset_table().await);
        eff.note(
            "add mangle chain",
            k.nft_add_chain(NFT_MANGLE_CHAIN, &nft::mangle_chain_spec()).await,
        );
        for rule in &plan.nft.mangle_rules {
            eff.note("add mangle rule", k.nft_add_rule(NFT_MANGLE_CHAIN, rule).await);
        }
        eff.note(
            "add postrouting chain",
            k.nft_add_chain(NFT_POSTROUTING_CHAIN, &nft::postrouting_chain_spec())
                .await,
        );
        for rule in &plan.nft.postrouting_rules {
            eff.note(
                "add postrouting rule",
                k.nft_add_rule(NFT_POSTROUTING_CHAIN, rule).await,
            );
        }

        // Mandatory: stale multipath selections survive until the cache goes.
        eff.note("flush route cache", k.flush_route_cache().await);

        eff.finish()
    }

    /// Shutdown teardown: removes every rule, table, and nftables object in
    /// the contract ranges.
    pub async fn cleanup(&self) -> Result<()> {
        let k = &self.kernel;
        let cfg = &self.cfg;
        let mut eff = BestEffort::new();

        for pref in cfg.routing.lb_pref..=cfg.routing.lb_pref + OVERLAY_RANGE {
            eff.note(
                "drop overlay rule",
                k.del_rules_matching(RuleMatch::Pref(pref)).await,
            );
        }
        for pref in RETURN_PREF_BASE..=RETURN_PREF_BASE + crate::tables::RETURN_RANGE {
            eff.note(
                "drop return rule",
                k.del_rules_matching(RuleMatch::Pref(pref)).await,
            );
        }
        for table in cfg.routing.lb_table..=cfg.routing.lb_table + OVERLAY_RANGE {
            eff.note("flush overlay table", k.flush_table(table).await);
        }
        for table in RETURN_TABLE_BASE..=RETURN_TABLE_BASE + crate::tables::RETURN_RANGE {
            eff.note("flush return table", k.flush_table(table).await);
        }
        eff.note("delete nft table", k.nft_delete_table().await);
        eff.note("flush route cache", k.flush_route_cache().await);

        eff.finish().map_err(|_| {
            UplinkdError::Cleanup("kernel teardown left residues behind".to_string())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_link_sample() -> Vec<UplinkTuple> {
        vec![
            UplinkTuple::new("eth0", "10.0.0.1".parse().unwrap(), "10.0.0.2".parse().unwrap()),
            UplinkTuple::new(
                "wlan0",
                "192.168.1.1".parse().unwrap(),
                "192.168.1.50".parse().unwrap(),
            ),
        ]
    }

    fn all_up(sample: &[UplinkTuple]) -> BTreeSet<String> {
        sample.iter().map(|t| t.iface.clone()).collect()
    }

    #[test]
    fn plan_is_deterministic_for_identical_inputs() {
        let cfg = Config::default();
        let sample = two_link_sample();
        let up = all_up(&sample);
        assert_eq!(plan(&cfg, &sample, &up), plan(&cfg, &sample, &up));
    }

    #[test]
    fn plan_builds_return_tables_in_sample_order() {
        let cfg = Config::default();
        let sample = two_link_sample();
        let p = plan(&cfg, &sample, &all_up(&sample)).unwrap();

        assert_eq!(p.return_tables.len(), 2);
        assert_eq!(p.return_tables[0].table, 100);
        assert_eq!(p.return_tables[0].pref, 100);
        assert_eq!(
            p.return_tables[0].routes[0].to_string(),
            "10.0.0.1 dev eth0 src 10.0.0.2"
        );
        assert_eq!(
            p.return_tables[0].routes[1].to_string(),
            "default via 10.0.0.1 dev eth0"
        );
        assert_eq!(p.return_tables[1].table, 101);
    }

    #[test]
    fn healthy_uplinks_share_the_multipath_route() {
        let cfg = Config::default();
        let sample = two_link_sample();
        let p = plan(&cfg, &sample, &all_up(&sample)).unwrap();

        match &p.active {
            ActivePlan::Multipath(route) => assert_eq!(
                route.to_string(),
                "default nexthop via 10.0.0.1 dev eth0 weight 5 \
                 nexthop via 192.168.1.1 dev wlan0 weight 3"
            ),
            other => panic!("expected multipath, got {other:?}"),
        }
        assert!(p.draining.is_none());
    }

    #[test]
    fn unhealthy_uplink_moves_to_draining() {
        let cfg = Config::default();
        let sample = two_link_sample();
        let up: BTreeSet<String> = ["eth0".to_string()].into();
        let p = plan(&cfg, &sample, &up).unwrap();

        match &p.active {
            ActivePlan::Multipath(route) => assert_eq!(
                route.to_string(),
                "default nexthop via 10.0.0.1 dev eth0 weight 5"
            ),
            other => panic!("expected multipath, got {other:?}"),
        }
        assert_eq!(
            p.draining.as_ref().unwrap().to_string(),
            "default nexthop via 192.168.1.1 dev wlan0 weight 1"
        );
        // Draining uplinks keep their masquerade.
        assert!(p
            .nft
            .postrouting_rules
            .contains(&"oifname \"wlan0\" masquerade".to_string()));
    }

    #[test]
    fn no_healthy_uplink_skips_the_rebuild() {
        let cfg = Config::default();
        let sample = two_link_sample();
        assert!(plan(&cfg, &sample, &BTreeSet::new()).is_none());
    }

    #[test]
    fn draining_disabled_drops_the_draining_route() {
        let mut cfg = Config::default();
        cfg.routing.draining_enabled = false;
        let sample = two_link_sample();
        let up: BTreeSet<String> = ["eth0".to_string()].into();
        let p = plan(&cfg, &sample, &up).unwrap();
        assert!(p.draining.is_none());
    }

    #[test]
    fn affinity_shards_follow_reserved_numbering() {
        let mut cfg = Config::default();
        cfg.routing.affinity_enabled = true;
        let sample = two_link_sample();
        let p = plan(&cfg, &sample, &all_up(&sample)).unwrap();

        match &p.active {
            ActivePlan::Affinity(shards) => {
                assert_eq!(shards.len(), 2);
                assert_eq!(shards[0].table, 202);
                assert_eq!(shards[0].pref, 92);
                assert_eq!(shards[0].mark, 0x2000_0000);
                assert_eq!(shards[1].table, 203);
                assert_eq!(shards[1].mark, 0x2000_0001);
            }
            other => panic!("expected affinity shards, got {other:?}"),
        }
    }

    #[test]
    fn affinity_with_one_active_uplink_collapses_to_multipath() {
        let mut cfg = Config::default();
        cfg.routing.affinity_enabled = true;
        let sample = two_link_sample();
        let up: BTreeSet<String> = ["eth0".to_string()].into();
        let p = plan(&cfg, &sample, &up).unwrap();
        assert!(matches!(p.active, ActivePlan::Multipath(_)));
    }
}
