//! Typed route and policy-rule specifications.
//!
//! The kernel adapter renders these once, at the command boundary. Call sites
//! build values from typed fields instead of concatenating address strings,
//! which removes the quoting and word-splitting hazards of assembling
//! `ip route add default … nexthop …` by hand.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;

/// One weighted nexthop of a multipath default route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NexthopSpec {
    pub via: Ipv4Addr,
    pub dev: String,
    pub weight: u32,
}

impl NexthopSpec {
    pub fn new(via: Ipv4Addr, dev: impl Into<String>, weight: u32) -> Self {
        Self {
            via,
            dev: dev.into(),
            weight,
        }
    }
}

impl fmt::Display for NexthopSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "nexthop via {} dev {} weight {}", self.via, self.dev, self.weight)
    }
}

/// A route to install into some table.
///
/// Renders to the argument text understood by `ip -4 route replace`, without
/// the table suffix (the adapter appends `table N`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RouteSpec {
    /// On-link host route to the gateway: `GW dev IFACE src SRC`.
    GatewayLink {
        gw: Ipv4Addr,
        dev: String,
        src: Ipv4Addr,
    },
    /// Single-nexthop default: `default via GW dev IFACE`.
    DefaultVia { gw: Ipv4Addr, dev: String },
    /// Weighted multipath default: `default nexthop … nexthop …`.
    DefaultMultipath { nexthops: Vec<NexthopSpec> },
}

impl RouteSpec {
    pub fn gateway_link(gw: Ipv4Addr, dev: impl Into<String>, src: Ipv4Addr) -> Self {
        Self::GatewayLink {
            gw,
            dev: dev.into(),
            src,
        }
    }

    pub fn default_via(gw: Ipv4Addr, dev: impl Into<String>) -> Self {
        Self::DefaultVia {
            gw,
            dev: dev.into(),
        }
    }

    pub fn default_multipath(nexthops: Vec<NexthopSpec>) -> Self {
        Self::DefaultMultipath { nexthops }
    }
}

impl fmt::Display for RouteSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::GatewayLink { gw, dev, src } => {
                write!(f, "{gw} dev {dev} src {src}")
            }
            Self::DefaultVia { gw, dev } => write!(f, "default via {gw} dev {dev}"),
            Self::DefaultMultipath { nexthops } => {
                write!(f, "default")?;
                for hop in nexthops {
                    write!(f, " {hop}")?;
                }
                Ok(())
            }
        }
    }
}

/// Packet selector of a policy rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuleSelector {
    /// `from SRC`: return-path rule for one uplink address.
    From(Ipv4Addr),
    /// `fwmark MARK`: overlay rule on the packet mark.
    Fwmark(u32),
    /// `fwmark MARK/MASK`: masked mark match (affinity shards).
    FwmarkMasked { mark: u32, mask: u32 },
}

impl fmt::Display for RuleSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::From(src) => write!(f, "from {src}"),
            Self::Fwmark(mark) => write!(f, "fwmark {mark:#010x}"),
            Self::FwmarkMasked { mark, mask } => {
                write!(f, "fwmark {mark:#010x}/{mask:#010x}")
            }
        }
    }
}

/// Predicate for bulk rule deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleMatch {
    /// Delete rules at this preference.
    Pref(u32),
    /// Delete rules pointing at this table.
    Table(u32),
}

impl fmt::Display for RuleMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pref(pref) => write!(f, "pref {pref}"),
            Self::Table(table) => write!(f, "lookup {table}"),
        }
    }
}
