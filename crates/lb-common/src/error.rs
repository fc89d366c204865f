//! Shared error type for kernel-facing operations.

use std::io;
use thiserror::Error;

/// Result type alias for lb-common operations.
pub type LbResult<T> = Result<T, LbError>;

/// Errors that can occur while driving the kernel.
#[derive(Debug, Error)]
pub enum LbError {
    /// Failed to spawn a shell command.
    #[error("failed to execute '{command}': {source}")]
    ShellExec {
        command: String,
        #[source]
        source: io::Error,
    },

    /// Shell command returned a non-zero exit code.
    #[error("command failed: '{command}' (exit code {exit_code}): {output}")]
    ShellCommandFailed {
        command: String,
        exit_code: i32,
        /// Combined stdout/stderr output.
        output: String,
    },

    /// Netlink socket operation failed.
    #[error("netlink {operation} failed: {message}")]
    Netlink { operation: String, message: String },

    /// Configuration validation error.
    #[error("invalid configuration for {field}: {message}")]
    InvalidConfig { field: String, message: String },

    /// IO error outside of command execution.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// Internal error (unexpected state).
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl LbError {
    /// Creates a netlink error.
    pub fn netlink(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Netlink {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Creates an invalid configuration error.
    pub fn invalid_config(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true for errors that may succeed if the operation is simply
    /// re-issued on the next reconcile.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LbError::ShellCommandFailed { .. } | LbError::Netlink { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_command_and_exit_code() {
        let err = LbError::ShellCommandFailed {
            command: "ip route flush table 200".to_string(),
            exit_code: 2,
            output: "RTNETLINK answers: Operation not permitted".to_string(),
        };
        let text = err.to_string();
        assert!(text.contains("ip route flush table 200"));
        assert!(text.contains("exit code 2"));
    }

    #[test]
    fn transience_classification() {
        assert!(LbError::ShellCommandFailed {
            command: "x".into(),
            exit_code: 1,
            output: String::new(),
        }
        .is_transient());
        assert!(LbError::netlink("bind", "EPERM").is_transient());
        assert!(!LbError::invalid_config("lb_table", "collides").is_transient());
        assert!(!LbError::internal("bug").is_transient());
    }
}
