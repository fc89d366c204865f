//! nftables ruleset construction for the mark/masquerade table.
//!
//! Pure text building; execution happens in the kernel adapter. The table
//! layout (name, chains, hooks, priorities) is part of the external contract.

use lb_types::UplinkTuple;

use crate::tables::{ACTIVE_MARK, DNS_PORT, NFT_MANGLE_PRIO, NFT_NAT_PRIO};

/// Desired content of the nftables table for one reconcile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NftPlan {
    /// Rules of the output-hook mangle chain, in order.
    pub mangle_rules: Vec<String>,
    /// Rules of the postrouting NAT chain, in order.
    pub postrouting_rules: Vec<String>,
}

/// Chain definition for the mangle chain (route hook so a changed mark
/// re-routes the packet).
pub fn mangle_chain_spec() -> String {
    format!("{{ type route hook output priority {NFT_MANGLE_PRIO} ; }}")
}

/// Chain definition for the postrouting NAT chain.
pub fn postrouting_chain_spec() -> String {
    format!("{{ type nat hook postrouting priority {NFT_NAT_PRIO} ; }}")
}

/// Builds the ruleset.
///
/// `active_count > 1` with affinity enabled switches the mangle chain to
/// per-connection shard hashing; `all` (healthy and draining) drives the
/// masquerade rules so established flows on a draining uplink keep their NAT.
pub fn build(
    affinity: bool,
    consistent_nat: bool,
    active_count: usize,
    all: &[UplinkTuple],
) -> NftPlan {
    let mangle_rules = if affinity && active_count > 1 {
        affinity_mangle_rules(active_count)
    } else {
        simple_mangle_rules()
    };

    let postrouting_rules = if consistent_nat {
        all.iter()
            .map(|t| format!("oifname \"{}\" masquerade", t.iface))
            .collect()
    } else {
        vec!["masquerade".to_string()]
    };

    NftPlan {
        mangle_rules,
        postrouting_rules,
    }
}

/// One mark for everything: new connections are tagged with the active mark;
/// DNS is left unmarked so resolvers follow the main table.
fn simple_mangle_rules() -> Vec<String> {
    vec![
        format!("tcp dport != {DNS_PORT} ct state new ct mark set {ACTIVE_MARK:#010x}"),
        format!("udp dport != {DNS_PORT} ct state new ct mark set {ACTIVE_MARK:#010x}"),
        format!("icmp type echo-request ct state new ct mark set {ACTIVE_MARK:#010x}"),
        restore_rule(),
    ]
}

/// Per-connection sharding: hash the flow tuple symmetrically into a shard
/// index, then tag with the active mark. The index lives in the low mark
/// bits and selects the shard rule.
fn affinity_mangle_rules(shards: usize) -> Vec<String> {
    vec![
        format!(
            "tcp dport != {DNS_PORT} ct state new ct mark set \
             jhash ip saddr . ip daddr . tcp sport . tcp dport mod {shards}"
        ),
        format!(
            "udp dport != {DNS_PORT} ct state new ct mark set \
             jhash ip saddr . ip daddr . udp sport . udp dport mod {shards}"
        ),
        format!(
            "icmp type echo-request ct state new ct mark set \
             jhash ip saddr . ip daddr mod {shards}"
        ),
        format!("ct state new ct mark set ct mark or {ACTIVE_MARK:#010x}"),
        restore_rule(),
    ]
}

/// Copies the connection mark back onto every packet so the fwmark policy
/// rules see it; runs last so the first packet of a new connection is
/// covered in the same traversal.
fn restore_rule() -> String {
    "ct mark != 0x00000000 meta mark set ct mark".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn tuples(names: &[&str]) -> Vec<UplinkTuple> {
        names
            .iter()
            .enumerate()
            .map(|(i, n)| {
                UplinkTuple::new(
                    *n,
                    Ipv4Addr::new(10, i as u8, 0, 1),
                    Ipv4Addr::new(10, i as u8, 0, 2),
                )
            })
            .collect()
    }

    #[test]
    fn simple_mode_marks_tcp_udp_icmp() {
        let plan = build(false, true, 2, &tuples(&["eth0", "wlan0"]));
        assert_eq!(plan.mangle_rules.len(), 4);
        assert_eq!(
            plan.mangle_rules[0],
            "tcp dport != 53 ct state new ct mark set 0x20000000"
        );
        assert_eq!(
            plan.mangle_rules[2],
            "icmp type echo-request ct state new ct mark set 0x20000000"
        );
        assert_eq!(
            plan.mangle_rules[3],
            "ct mark != 0x00000000 meta mark set ct mark"
        );
    }

    #[test]
    fn affinity_mode_hashes_flows() {
        let plan = build(true, true, 2, &tuples(&["eth0", "wlan0"]));
        assert_eq!(plan.mangle_rules.len(), 5);
        assert!(plan.mangle_rules[0].contains("jhash ip saddr . ip daddr . tcp sport . tcp dport mod 2"));
        assert!(plan.mangle_rules[2].contains("jhash ip saddr . ip daddr mod 2"));
        assert_eq!(
            plan.mangle_rules[3],
            "ct state new ct mark set ct mark or 0x20000000"
        );
    }

    #[test]
    fn affinity_collapses_with_single_active_uplink() {
        let plan = build(true, true, 1, &tuples(&["eth0"]));
        assert_eq!(plan.mangle_rules, build(false, true, 1, &tuples(&["eth0"])).mangle_rules);
    }

    #[test]
    fn consistent_nat_lists_every_interface() {
        let plan = build(false, true, 1, &tuples(&["eth0", "wlan0"]));
        assert_eq!(
            plan.postrouting_rules,
            vec![
                "oifname \"eth0\" masquerade".to_string(),
                "oifname \"wlan0\" masquerade".to_string(),
            ]
        );
    }

    #[test]
    fn catch_all_masquerade_without_consistent_nat() {
        let plan = build(false, false, 2, &tuples(&["eth0", "wlan0"]));
        assert_eq!(plan.postrouting_rules, vec!["masquerade".to_string()]);
    }

    #[test]
    fn chain_specs_carry_contract_priorities() {
        assert_eq!(
            mangle_chain_spec(),
            "{ type route hook output priority -150 ; }"
        );
        assert_eq!(
            postrouting_chain_spec(),
            "{ type nat hook postrouting priority 100 ; }"
        );
    }
}
