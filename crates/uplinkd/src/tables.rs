//! Numeric contract: routing table IDs, rule preferences, firewall marks,
//! and nftables object names.
//!
//! The table and preference ranges are shared with the external uninstaller,
//! which flushes exactly these numbers. Do not renumber one side without the
//! other.

/// First per-interface return table (tables 100..110).
pub const RETURN_TABLE_BASE: u32 = 100;

/// First per-interface return rule preference (prefs 100..110).
pub const RETURN_PREF_BASE: u32 = 100;

/// Width of the return table/preference range.
pub const RETURN_RANGE: u32 = 10;

/// Default base table ID for the overlay (active table; draining is +1,
/// affinity shards are +2..+10).
pub const DEFAULT_LB_TABLE: u32 = 200;

/// Default base rule preference for the overlay.
pub const DEFAULT_LB_PREF: u32 = 90;

/// Width of the overlay table/preference range reserved for draining and
/// affinity shards.
pub const OVERLAY_RANGE: u32 = 10;

/// Connection mark for flows steered at the active multipath table.
pub const ACTIVE_MARK: u32 = 0x2000_0000;

/// Connection mark for flows steered at the draining table.
pub const DRAINING_MARK: u32 = 0x1000_0000;

/// Mask isolating the per-interface shard index inside a connection mark.
pub const AFFINITY_MASK: u32 = 0x0000_ffff;

/// nftables table owned by the daemon (family ip).
pub const NFT_TABLE: &str = "loadbalancing";

/// Output-hook mangle chain that marks new connections.
pub const NFT_MANGLE_CHAIN: &str = "mangle";

/// Postrouting NAT chain that masquerades egress traffic.
pub const NFT_POSTROUTING_CHAIN: &str = "postrouting";

/// Priority of the mangle chain (route hook output).
pub const NFT_MANGLE_PRIO: i32 = -150;

/// Priority of the postrouting chain (nat hook).
pub const NFT_NAT_PRIO: i32 = 100;

/// DNS port, excluded from connection marking so resolver traffic follows
/// the main table.
pub const DNS_PORT: u16 = 53;
