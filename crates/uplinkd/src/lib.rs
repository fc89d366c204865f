//! Multipath egress load balancer control plane.
//!
//! uplinkd watches the kernel's main routing table for default routes across
//! multiple uplinks (wired, Wi-Fi, USB tethering), probes each gateway for
//! end-to-end reachability, and programs policy routing plus an nftables
//! mark/masquerade table so new outbound flows spread over the healthy links
//! while established flows drain naturally off failed ones.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐ ticks ┌────────────┐ sample ┌─────────────┐
//! │ RouteObserver├──────▶│ Supervisor │◀───────┤ StateSampler│
//! │  (netlink)   │       │ (debounce) │        └─────────────┘
//! └──────────────┘       │            │ probes ┌─────────────┐
//!                        │            │◀───────┤HealthMonitor│
//!                        └─────┬──────┘        └─────────────┘
//!                              │ (S, up-set)
//!                        ┌─────▼──────┐  ip/nft  ┌───────────┐
//!                        │ Reconciler ├─────────▶│ KernelOps │
//!                        └────────────┘          └───────────┘
//! ```
//!
//! The supervisor loop is the sole kernel writer. All state is reconstructed
//! from the kernel at startup; nothing is persisted.

pub mod config;
pub mod error;
pub mod health;
pub mod kernel;
pub mod metrics;
pub mod netlink;
pub mod nft;
pub mod reconcile;
pub mod sampler;
pub mod supervisor;
pub mod tables;

pub use config::Config;
pub use error::{Result, UplinkdError};
pub use health::{HealthMonitor, HealthRecord, HealthStatus};
pub use kernel::{KernelOps, MockKernel, ShellKernel};
pub use metrics::MetricsCollector;
pub use reconcile::Reconciler;
pub use supervisor::Supervisor;
