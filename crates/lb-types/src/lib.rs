//! Shared types for the uplinkd egress load balancer.
//!
//! This crate provides the vocabulary the daemon crates speak:
//!
//! - [`UplinkTuple`]: one usable default gateway (interface, gateway, source
//!   address) and the canonical ordering of a sample
//! - [`LinkClass`]: interface-name classification and multipath weights
//! - [`NeighborState`]: kernel ARP neighbor states
//! - [`route`]: typed route and policy-rule specification builders
//!
//! Everything here is plain data. Kernel interaction lives in `uplinkd`.

pub mod link;
pub mod neighbor;
pub mod route;
pub mod uplink;

pub use link::LinkClass;
pub use neighbor::NeighborState;
pub use route::{NexthopSpec, RouteSpec, RuleMatch, RuleSelector};
pub use uplink::{canonicalize, UplinkTuple};
