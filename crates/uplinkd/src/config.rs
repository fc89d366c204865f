//! Daemon configuration.
//!
//! Loaded from a TOML file, default location /etc/uplinkd/uplinkd.conf
//! (overridable via the UPLINKD_CONFIG environment variable). A missing file
//! means all defaults; a present but malformed file is an error.

use crate::error::{Result, UplinkdError};
use crate::tables::{DEFAULT_LB_PREF, DEFAULT_LB_TABLE, RETURN_PREF_BASE, RETURN_RANGE, RETURN_TABLE_BASE};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

/// Default configuration file path.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/uplinkd/uplinkd.conf";

/// Environment variable overriding the configuration file path.
pub const CONFIG_PATH_ENV: &str = "UPLINKD_CONFIG";

/// Overlay routing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Base routing table ID for the overlay.
    #[serde(default = "default_lb_table")]
    pub lb_table: u32,

    /// Base rule preference for the overlay.
    #[serde(default = "default_lb_pref")]
    pub lb_pref: u32,

    /// Minimum quiet period between reconciles, in seconds.
    #[serde(default = "default_debounce_secs")]
    pub debounce_time_secs: u64,

    /// Build the draining table for unhealthy uplinks.
    #[serde(default = "default_true")]
    pub draining_enabled: bool,

    /// Shard flows per-uplink instead of hashing across one multipath route.
    #[serde(default = "default_false")]
    pub affinity_enabled: bool,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        toml::from_str("").expect("empty routing config must deserialize")
    }
}

/// Health probing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Gate all probing.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Minimum seconds between consecutive probes, global across uplinks.
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    /// TCP connect deadline in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Consecutive failures before an uplink goes down.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Consecutive successes before a down uplink recovers.
    #[serde(default = "default_recovery_threshold")]
    pub recovery_threshold: u32,

    /// Probe endpoint address.
    #[serde(default = "default_probe_target")]
    pub probe_target: Ipv4Addr,

    /// Probe endpoint port.
    #[serde(default = "default_probe_port")]
    pub probe_port: u16,

    /// Base of the exponential probe backoff, in seconds.
    #[serde(default = "default_backoff_base_secs")]
    pub backoff_base_secs: u64,

    /// Cap of the exponential probe backoff, in seconds.
    #[serde(default = "default_backoff_max_secs")]
    pub backoff_max_secs: u64,

    /// Hold-down dwell before promoting a recovered uplink, in seconds.
    #[serde(default = "default_hold_down_secs")]
    pub hold_down_secs: u64,

    /// Insert the hold-down dwell on recovery.
    #[serde(default = "default_true")]
    pub hysteresis_enabled: bool,

    /// Gate probes on the kernel neighbor cache.
    #[serde(default = "default_true")]
    pub neighbor_reachability: bool,
}

impl Default for HealthConfig {
    fn default() -> Self {
        toml::from_str("").expect("empty health config must deserialize")
    }
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_secs(self.backoff_base_secs)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_secs(self.backoff_max_secs)
    }

    pub fn hold_down(&self) -> Duration {
        Duration::from_secs(self.hold_down_secs)
    }
}

/// NAT configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NatConfig {
    /// One masquerade rule per egress interface instead of a catch-all.
    #[serde(default = "default_true")]
    pub consistent_nat: bool,
}

impl Default for NatConfig {
    fn default() -> Self {
        toml::from_str("").expect("empty nat config must deserialize")
    }
}

/// Complete daemon configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub routing: RoutingConfig,

    #[serde(default)]
    pub health: HealthConfig,

    #[serde(default)]
    pub nat: NatConfig,
}

fn default_lb_table() -> u32 {
    DEFAULT_LB_TABLE
}

fn default_lb_pref() -> u32 {
    DEFAULT_LB_PREF
}

fn default_debounce_secs() -> u64 {
    2
}

fn default_interval_secs() -> u64 {
    30
}

fn default_timeout_secs() -> u64 {
    3
}

fn default_failure_threshold() -> u32 {
    2
}

fn default_recovery_threshold() -> u32 {
    1
}

fn default_probe_target() -> Ipv4Addr {
    Ipv4Addr::new(1, 1, 1, 1)
}

fn default_probe_port() -> u16 {
    53
}

fn default_backoff_base_secs() -> u64 {
    30
}

fn default_backoff_max_secs() -> u64 {
    300
}

fn default_hold_down_secs() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

fn default_false() -> bool {
    false
}

impl Config {
    /// Loads configuration from the given path, falling back to defaults if
    /// the file does not exist.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let config = if path.exists() {
            let content = fs::read_to_string(path)?;
            let config: Config = toml::from_str(&content)
                .map_err(|e| UplinkdError::Config(format!("{}: {e}", path.display())))?;
            tracing::info!(path = %path.display(), "loaded configuration file");
            config
        } else {
            tracing::info!(path = %path.display(), "no configuration file, using defaults");
            Config::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from `UPLINKD_CONFIG` or the default path.
    pub fn load() -> Result<Self> {
        match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) => Self::load_or_default(path),
            Err(_) => Self::load_or_default(DEFAULT_CONFIG_PATH),
        }
    }

    /// Rejects settings the kernel would only refuse at reconcile time.
    pub fn validate(&self) -> Result<()> {
        let r = &self.routing;
        let overlay = r.lb_table..=r.lb_table + crate::tables::OVERLAY_RANGE;
        let returns = RETURN_TABLE_BASE..=RETURN_TABLE_BASE + RETURN_RANGE;
        if overlay.contains(returns.start())
            || overlay.contains(returns.end())
            || returns.contains(&r.lb_table)
        {
            return Err(UplinkdError::Config(format!(
                "lb_table {} collides with the {}..{} return-table range",
                r.lb_table,
                returns.start(),
                returns.end()
            )));
        }
        if r.lb_pref >= RETURN_PREF_BASE {
            return Err(UplinkdError::Config(format!(
                "lb_pref {} must sort before the return-rule preferences ({}..)",
                r.lb_pref, RETURN_PREF_BASE
            )));
        }
        let h = &self.health;
        if h.probe_port == 0 {
            return Err(UplinkdError::Config("probe_port must be non-zero".into()));
        }
        if h.failure_threshold == 0 || h.recovery_threshold == 0 {
            return Err(UplinkdError::Config(
                "failure_threshold and recovery_threshold must be at least 1".into(),
            ));
        }
        if h.backoff_max_secs < h.backoff_base_secs {
            return Err(UplinkdError::Config(
                "backoff_max must not be below backoff_base".into(),
            ));
        }
        if h.timeout_secs == 0 || h.interval_secs == 0 {
            return Err(UplinkdError::Config(
                "health timeout and interval must be non-zero".into(),
            ));
        }
        Ok(())
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_secs(self.routing.debounce_time_secs)
    }

    /// Table ID of the active multipath table.
    pub fn active_table(&self) -> u32 {
        self.routing.lb_table
    }

    /// Table ID of the draining table.
    pub fn draining_table(&self) -> u32 {
        self.routing.lb_table + 1
    }

    /// Table ID of affinity shard `i`.
    pub fn shard_table(&self, i: u32) -> u32 {
        self.routing.lb_table + 2 + i
    }

    /// Rule preference of affinity shard `i`.
    pub fn shard_pref(&self, i: u32) -> u32 {
        self.routing.lb_pref + 2 + i
    }
}
