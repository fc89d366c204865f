//! Shell command execution for kernel mutation.
//!
//! Every `ip`/`nft` invocation the daemon makes goes through [`exec`], which
//! pipes the command through `/bin/sh -c`, captures both output streams, and
//! logs the outcome. [`shellquote`] must be applied to any operand that is
//! not produced by a typed builder (interface names arrive from the kernel,
//! but a hostile netns peer can still name a link creatively).

use once_cell::sync::Lazy;
use regex::Regex;
use std::process::Stdio;
use tokio::process::Command;

use crate::error::{LbError, LbResult};

/// Path to the `ip` command for routing, rule, and neighbor operations.
pub const IP_CMD: &str = "/sbin/ip";

/// Path to the `nft` command for the mark/masquerade table.
pub const NFT_CMD: &str = "/usr/sbin/nft";

/// Characters that need escaping inside shell double-quotes:
/// $, `, ", \, and newline.
static SHELL_ESCAPE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"([$`"\\\n])"#).expect("invalid regex pattern"));

/// Quotes a string for safe use in shell commands.
///
/// Wraps the string in double quotes and escapes the characters that retain
/// special meaning inside them.
///
/// # Example
///
/// ```
/// use lb_common::shell::shellquote;
///
/// assert_eq!(shellquote("eth0"), "\"eth0\"");
/// assert_eq!(shellquote("evil$name"), "\"evil\\$name\"");
/// ```
pub fn shellquote(s: &str) -> String {
    let escaped = SHELL_ESCAPE_RE.replace_all(s, r"\$1");
    format!("\"{}\"", escaped)
}

/// Result of a shell command execution.
#[derive(Debug, Clone)]
pub struct ExecResult {
    /// The exit code of the command (0 = success).
    pub exit_code: i32,
    /// Trimmed stdout.
    pub stdout: String,
    /// Trimmed stderr.
    pub stderr: String,
}

impl ExecResult {
    /// Returns true if the command succeeded (exit code 0).
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Returns the combined output (stdout + stderr) for error messages.
    pub fn combined_output(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else if self.stdout.is_empty() {
            self.stderr.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

/// Executes a shell command asynchronously.
///
/// Runs through `/bin/sh -c`. A non-zero exit code is not an `Err`; callers
/// that need to distinguish benign kernel refusals ("File exists", "No such
/// process") from real failures inspect the [`ExecResult`] themselves.
pub async fn exec(cmd: &str) -> LbResult<ExecResult> {
    tracing::debug!(command = %cmd, "executing shell command");

    let output = Command::new("/bin/sh")
        .arg("-c")
        .arg(cmd)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| LbError::ShellExec {
            command: cmd.to_string(),
            source: e,
        })?;

    let exit_code = output.status.code().unwrap_or(-1);
    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

    let result = ExecResult {
        exit_code,
        stdout,
        stderr,
    };

    if result.success() {
        tracing::trace!(command = %cmd, "command succeeded");
    } else {
        tracing::debug!(
            command = %cmd,
            exit_code = exit_code,
            stderr = %result.stderr,
            "command returned non-zero"
        );
    }

    Ok(result)
}

/// Executes a shell command and returns an error on non-zero exit.
pub async fn exec_or_throw(cmd: &str) -> LbResult<String> {
    let result = exec(cmd).await?;
    if result.success() {
        Ok(result.stdout)
    } else {
        Err(LbError::ShellCommandFailed {
            command: cmd.to_string(),
            exit_code: result.exit_code,
            output: result.combined_output(),
        })
    }
}
