//! Error types for uplinkd.

use thiserror::Error;

/// Result type alias for uplinkd operations.
pub type Result<T> = std::result::Result<T, UplinkdError>;

/// Errors that can occur in the daemon.
#[derive(Debug, Error)]
pub enum UplinkdError {
    /// Kernel-facing operation failed (shell, parse, netlink bind).
    #[error(transparent)]
    Kernel(#[from] lb_common::LbError),

    /// Configuration load or validation error.
    #[error("configuration error: {0}")]
    Config(String),

    /// A reconcile pass finished with failed mutations; the next tick
    /// re-issues the full desired state.
    #[error("reconcile finished with {0} failed kernel mutations")]
    Reconcile(usize),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Cleanup on shutdown did not complete.
    #[error("cleanup incomplete: {0}")]
    Cleanup(String),
}
