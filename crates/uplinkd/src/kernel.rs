//! Kernel adapter: a thin, testable facade over routing-table, rule,
//! neighbor, and nftables operations.
//!
//! Every operation is best-effort idempotent. The shell implementation
//! absorbs the kernel's "already exists" / "does not exist" refusals and
//! surfaces everything else; the reconciler logs those and re-issues the full
//! desired state on the next pass, so partial kernel state is never fatal.

use async_trait::async_trait;
use lb_common::shell::{self, shellquote, ExecResult, IP_CMD, NFT_CMD};
use lb_common::{LbError, LbResult};
use lb_types::{NeighborState, RouteSpec, RuleMatch, RuleSelector};
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::TcpSocket;

use crate::tables::NFT_TABLE;

/// A default route in the main table that names both a gateway and a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefaultRoute {
    pub iface: String,
    pub gw: Ipv4Addr,
}

/// Kernel operations the reconciler and health monitor drive.
#[async_trait]
pub trait KernelOps: Send + Sync {
    /// Empties a routing table. Absent tables are treated as empty.
    async fn flush_table(&self, table: u32) -> LbResult<()>;

    /// Installs (or replaces) one route in a table.
    async fn add_route(&self, table: u32, route: &RouteSpec) -> LbResult<()>;

    /// Installs a policy rule. An identical existing rule is a no-op.
    async fn add_rule(&self, selector: RuleSelector, table: u32, pref: u32) -> LbResult<()>;

    /// Deletes every rule matching the predicate.
    async fn del_rules_matching(&self, matcher: RuleMatch) -> LbResult<()>;

    /// Flushes the kernel route cache so multipath selections are recomputed.
    async fn flush_route_cache(&self) -> LbResult<()>;

    /// Drops and recreates the daemon's nftables table.
    async fn nft_reset_table(&self) -> LbResult<()>;

    /// Removes the daemon's nftables table entirely (shutdown path).
    async fn nft_delete_table(&self) -> LbResult<()>;

    /// Adds a chain to the daemon's nftables table.
    /// `spec` is the brace-delimited chain definition, e.g.
    /// `{ type nat hook postrouting priority 100 ; }`.
    async fn nft_add_chain(&self, chain: &str, spec: &str) -> LbResult<()>;

    /// Appends one rule to a chain of the daemon's nftables table.
    async fn nft_add_rule(&self, chain: &str, rule: &str) -> LbResult<()>;

    /// Reads the neighbor-cache state for a gateway on an interface.
    async fn neighbor_state(&self, iface: &str, gw: Ipv4Addr) -> LbResult<NeighborState>;

    /// Drops the neighbor-cache entry for a gateway, forcing fresh ARP.
    async fn neighbor_flush(&self, iface: &str, gw: Ipv4Addr) -> LbResult<()>;

    /// Opens a TCP connection from `src` to `dst:port` within `timeout`.
    /// Any established connection is success; payload is irrelevant. The
    /// source binding is what forces the connection onto the probed uplink.
    async fn dial_tcp(&self, src: Ipv4Addr, dst: Ipv4Addr, port: u16, timeout: Duration) -> bool;

    /// Lists default routes in the main table that have both `via` and `dev`.
    async fn list_default_routes(&self) -> LbResult<Vec<DefaultRoute>>;

    /// First IPv4 address bound on an interface, if any.
    async fn primary_ipv4_of(&self, iface: &str) -> LbResult<Option<Ipv4Addr>>;
}

// ---------------------------------------------------------------------------
// Shell implementation
// ---------------------------------------------------------------------------

/// Kernel refusals that mean "the state you wanted is already in place" or
/// "the thing you are removing is already gone".
const BENIGN_STDERR: &[&str] = &[
    "File exists",
    "No such process",
    "No such file or directory",
    "Nothing to flush",
    "Cannot find device",
];

/// Upper bound on duplicate rules deleted per predicate. The kernel removes
/// one rule per `ip rule del`; anything past this count is not ours.
const MAX_RULE_DELETIONS: usize = 16;

/// Kernel adapter backed by `ip` and `nft` through the shared shell layer.
#[derive(Debug, Default)]
pub struct ShellKernel;

impl ShellKernel {
    pub fn new() -> Self {
        Self
    }

    /// Absorbs benign refusals, surfaces everything else.
    fn absorb(cmd: &str, result: ExecResult) -> LbResult<()> {
        if result.success() {
            return Ok(());
        }
        if BENIGN_STDERR.iter().any(|m| result.stderr.contains(m)) {
            tracing::debug!(command = %cmd, stderr = %result.stderr, "absorbed benign kernel refusal");
            return Ok(());
        }
        Err(LbError::ShellCommandFailed {
            command: cmd.to_string(),
            exit_code: result.exit_code,
            output: result.combined_output(),
        })
    }

    async fn run_absorbing(cmd: String) -> LbResult<()> {
        let result = shell::exec(&cmd).await?;
        Self::absorb(&cmd, result)
    }
}

#[async_trait]
impl KernelOps for ShellKernel {
    async fn flush_table(&self, table: u32) -> LbResult<()> {
        Self::run_absorbing(format!("{IP_CMD} -4 route flush table {table}")).await
    }

    async fn add_route(&self, table: u32, route: &RouteSpec) -> LbResult<()> {
        Self::run_absorbing(format!("{IP_CMD} -4 route replace {route} table {table}")).await
    }

    async fn add_rule(&self, selector: RuleSelector, table: u32, pref: u32) -> LbResult<()> {
        Self::run_absorbing(format!(
            "{IP_CMD} -4 rule add {selector} lookup {table} pref {pref}"
        ))
        .await
    }

    async fn del_rules_matching(&self, matcher: RuleMatch) -> LbResult<()> {
        // The kernel deletes one matching rule per invocation; loop until it
        // reports there is nothing left.
        for _ in 0..MAX_RULE_DELETIONS {
            let cmd = format!("{IP_CMD} -4 rule del {matcher}");
            let result = shell::exec(&cmd).await?;
            if !result.success() {
                return Self::absorb(&cmd, result);
            }
        }
        Ok(())
    }

    async fn flush_route_cache(&self) -> LbResult<()> {
        Self::run_absorbing(format!("{IP_CMD} route flush cache")).await
    }

    async fn nft_reset_table(&self) -> LbResult<()> {
        self.nft_delete_table().await?;
        Self::run_absorbing(format!("{NFT_CMD} add table ip {NFT_TABLE}")).await
    }

    async fn nft_delete_table(&self) -> LbResult<()> {
        Self::run_absorbing(format!("{NFT_CMD} delete table ip {NFT_TABLE}")).await
    }

    async fn nft_add_chain(&self, chain: &str, spec: &str) -> LbResult<()> {
        Self::run_absorbing(format!(
            "{NFT_CMD} add chain ip {NFT_TABLE} {chain} '{spec}'"
        ))
        .await
    }

    async fn nft_add_rule(&self, chain: &str, rule: &str) -> LbResult<()> {
        Self::run_absorbing(format!("{NFT_CMD} add rule ip {NFT_TABLE} {chain} {rule}")).await
    }

    async fn neighbor_state(&self, iface: &str, gw: Ipv4Addr) -> LbResult<NeighborState> {
        let cmd = format!(
            "{IP_CMD} -4 neigh show to {gw} dev {}",
            shellquote(iface)
        );
        let output = shell::exec_or_throw(&cmd).await?;
        Ok(parse_neighbor_state(&output))
    }

    async fn neighbor_flush(&self, iface: &str, gw: Ipv4Addr) -> LbResult<()> {
        Self::run_absorbing(format!(
            "{IP_CMD} -4 neigh del {gw} dev {}",
            shellquote(iface)
        ))
        .await
    }

    async fn dial_tcp(&self, src: Ipv4Addr, dst: Ipv4Addr, port: u16, timeout: Duration) -> bool {
        let attempt = async {
            let socket = TcpSocket::new_v4()?;
            socket.bind(SocketAddr::from((src, 0)))?;
            socket.connect(SocketAddr::from((dst, port))).await
        };
        match tokio::time::timeout(timeout, attempt).await {
            Ok(Ok(_stream)) => true,
            Ok(Err(e)) => {
                tracing::debug!(%src, %dst, port, error = %e, "probe connect failed");
                false
            }
            Err(_) => {
                tracing::debug!(%src, %dst, port, "probe connect timed out");
                false
            }
        }
    }

    async fn list_default_routes(&self) -> LbResult<Vec<DefaultRoute>> {
        let output = shell::exec_or_throw(&format!("{IP_CMD} -4 route show default")).await?;
        Ok(parse_default_routes(&output))
    }

    async fn primary_ipv4_of(&self, iface: &str) -> LbResult<Option<Ipv4Addr>> {
        let cmd = format!("{IP_CMD} -4 addr show dev {}", shellquote(iface));
        let result = shell::exec(&cmd).await?;
        if !result.success() {
            // Interface gone between sampling steps; the tuple is discarded.
            return Ok(None);
        }
        Ok(parse_first_inet(&result.stdout))
    }
}

/// Parses `ip -4 route show default` output into gateway/device pairs.
/// Routes missing either field (e.g. point-to-point `default dev tun0`) are
/// skipped.
fn parse_default_routes(output: &str) -> Vec<DefaultRoute> {
    let mut routes = Vec::new();
    for line in output.lines() {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.first() != Some(&"default") {
            continue;
        }
        let value_after = |key: &str| {
            tokens
                .iter()
                .position(|t| *t == key)
                .and_then(|i| tokens.get(i + 1))
                .copied()
        };
        let gw = value_after("via").and_then(|v| v.parse::<Ipv4Addr>().ok());
        let iface = value_after("dev");
        if let (Some(gw), Some(iface)) = (gw, iface) {
            routes.push(DefaultRoute {
                iface: iface.to_string(),
                gw,
            });
        }
    }
    routes
}

/// Parses `ip -4 addr show dev X` output, returning the first `inet` address.
fn parse_first_inet(output: &str) -> Option<Ipv4Addr> {
    for line in output.lines() {
        let mut tokens = line.split_whitespace();
        while let Some(token) = tokens.next() {
            if token == "inet" {
                let addr = tokens.next()?;
                let addr = addr.split('/').next()?;
                return addr.parse().ok();
            }
        }
    }
    None
}

/// Parses `ip -4 neigh show` output for a single gateway. No entry at all
/// means the kernel has never tried to resolve it; report Unknown and let
/// the probe proceed.
fn parse_neighbor_state(output: &str) -> NeighborState {
    output
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().last())
        .map(NeighborState::from_show_token)
        .unwrap_or(NeighborState::Unknown)
}

// ---------------------------------------------------------------------------
// Recording fake
// ---------------------------------------------------------------------------

pub use mock::{KernelOp, MockKernel};

/// Recording kernel used by the test-suite and by the external
/// failure-injection harness. Mutations are recorded, reads are served from
/// configured fixtures.
pub mod mock {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// One recorded kernel mutation, in applied order.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum KernelOp {
        FlushTable(u32),
        AddRoute { table: u32, route: String },
        AddRule { selector: String, table: u32, pref: u32 },
        DelRules(String),
        FlushCache,
        NftReset,
        NftDeleteTable,
        NftChain { chain: String, spec: String },
        NftRule { chain: String, rule: String },
        NeighborFlush { iface: String, gw: Ipv4Addr },
    }

    #[derive(Debug, Default)]
    pub struct MockKernel {
        ops: Mutex<Vec<KernelOp>>,
        default_routes: Mutex<Vec<DefaultRoute>>,
        addrs: Mutex<HashMap<String, Ipv4Addr>>,
        neighbor_states: Mutex<HashMap<(String, Ipv4Addr), NeighborState>>,
        dial_results: Mutex<HashMap<Ipv4Addr, bool>>,
    }

    impl MockKernel {
        pub fn new() -> Self {
            Self::default()
        }

        /// Fixture: one default route plus the interface's first address.
        pub fn add_uplink(&self, iface: &str, gw: Ipv4Addr, src: Ipv4Addr) {
            self.default_routes.lock().unwrap().push(DefaultRoute {
                iface: iface.to_string(),
                gw,
            });
            self.addrs.lock().unwrap().insert(iface.to_string(), src);
        }

        /// Fixture: a default route whose interface has no IPv4 address.
        pub fn add_default_route(&self, iface: &str, gw: Ipv4Addr) {
            self.default_routes.lock().unwrap().push(DefaultRoute {
                iface: iface.to_string(),
                gw,
            });
        }

        pub fn clear_uplinks(&self) {
            self.default_routes.lock().unwrap().clear();
            self.addrs.lock().unwrap().clear();
        }

        pub fn set_neighbor(&self, iface: &str, gw: Ipv4Addr, state: NeighborState) {
            self.neighbor_states
                .lock()
                .unwrap()
                .insert((iface.to_string(), gw), state);
        }

        /// Fixture: probe outcome for connections bound to `src`.
        pub fn set_dial_result(&self, src: Ipv4Addr, ok: bool) {
            self.dial_results.lock().unwrap().insert(src, ok);
        }

        /// Drains and returns the recorded mutations.
        pub fn take_ops(&self) -> Vec<KernelOp> {
            std::mem::take(&mut *self.ops.lock().unwrap())
        }

        fn record(&self, op: KernelOp) {
            self.ops.lock().unwrap().push(op);
        }
    }

    #[async_trait]
    impl KernelOps for MockKernel {
        async fn flush_table(&self, table: u32) -> LbResult<()> {
            self.record(KernelOp::FlushTable(table));
            Ok(())
        }

        async fn add_route(&self, table: u32, route: &RouteSpec) -> LbResult<()> {
            self.record(KernelOp::AddRoute {
                table,
                route: route.to_string(),
            });
            Ok(())
        }

        async fn add_rule(&self, selector: RuleSelector, table: u32, pref: u32) -> LbResult<()> {
            self.record(KernelOp::AddRule {
                selector: selector.to_string(),
                table,
                pref,
            });
            Ok(())
        }

        async fn del_rules_matching(&self, matcher: RuleMatch) -> LbResult<()> {
            self.record(KernelOp::DelRules(matcher.to_string()));
            Ok(())
        }

        async fn flush_route_cache(&self) -> LbResult<()> {
            self.record(KernelOp::FlushCache);
            Ok(())
        }

        async fn nft_reset_table(&self) -> LbResult<()> {
            self.record(KernelOp::NftReset);
            Ok(())
        }

        async fn nft_delete_table(&self) -> LbResult<()> {
            self.record(KernelOp::NftDeleteTable);
            Ok(())
        }

        async fn nft_add_chain(&self, chain: &str, spec: &str) -> LbResult<()> {
            self.record(KernelOp::NftChain {
                chain: chain.to_string(),
                spec: spec.to_string(),
            });
            Ok(())
        }

        async fn nft_add_rule(&self, chain: &str, rule: &str) -> LbResult<()> {
            self.record(KernelOp::NftRule {
                chain: chain.to_string(),
                rule: rule.to_string(),
            });
            Ok(())
        }

        async fn neighbor_state(&self, iface: &str, gw: Ipv4Addr) -> LbResult<NeighborState> {
            Ok(self
                .neighbor_states
                .lock()
                .unwrap()
                .get(&(iface.to_string(), gw))
                .copied()
                .unwrap_or(NeighborState::Unknown))
        }

        async fn neighbor_flush(&self, iface: &str, gw: Ipv4Addr) -> LbResult<()> {
            self.record(KernelOp::NeighborFlush {
                iface: iface.to_string(),
                gw,
            });
            Ok(())
        }

        async fn dial_tcp(
            &self,
            src: Ipv4Addr,
            _dst: Ipv4Addr,
            _port: u16,
            _timeout: Duration,
        ) -> bool {
            self.dial_results
                .lock()
                .unwrap()
                .get(&src)
                .copied()
                .unwrap_or(true)
        }

        async fn list_default_routes(&self) -> LbResult<Vec<DefaultRoute>> {
            Ok(self.default_routes.lock().unwrap().clone())
        }

        async fn primary_ipv4_of(&self, iface: &str) -> LbResult<Option<Ipv4Addr>> {
            Ok(self.addrs.lock().unwrap().get(iface).copied())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_dhcp_default_routes() {
        let output = "\
default via 10.0.0.1 dev eth0 proto dhcp src 10.0.0.2 metric 100 \n\
default via 192.168.1.1 dev wlan0 proto dhcp src 192.168.1.50 metric 600";
        let routes = parse_default_routes(output);
        assert_eq!(routes.len(), 2);
        assert_eq!(routes[0].iface, "eth0");
        assert_eq!(routes[0].gw, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(routes[1].iface, "wlan0");
    }

    #[test]
    fn skips_default_routes_without_gateway() {
        let output = "default dev tun0 scope link";
        assert!(parse_default_routes(output).is_empty());
    }

    #[test]
    fn skips_nexthop_continuation_lines() {
        let output = "\
default proto static\n\
\tnexthop via 10.0.0.1 dev eth0 weight 1\n\
\tnexthop via 192.168.1.1 dev wlan0 weight 1";
        assert!(parse_default_routes(output).is_empty());
    }

    #[test]
    fn first_inet_address_wins() {
        let output = "\
2: eth0: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1500 qdisc fq_codel state UP\n\
    inet 10.0.0.2/24 brd 10.0.0.255 scope global dynamic eth0\n\
       valid_lft 86391sec preferred_lft 86391sec\n\
    inet 10.0.0.3/24 scope global secondary eth0";
        assert_eq!(parse_first_inet(output), Some(Ipv4Addr::new(10, 0, 0, 2)));
    }

    #[test]
    fn no_inet_address_yields_none() {
        let output = "5: wlan0: <BROADCAST,MULTICAST> mtu 1500 qdisc noop state DOWN";
        assert_eq!(parse_first_inet(output), None);
    }

    #[test]
    fn neighbor_state_from_show_output() {
        assert_eq!(
            parse_neighbor_state("10.0.0.1 lladdr aa:bb:cc:dd:ee:ff REACHABLE"),
            NeighborState::Reachable
        );
        assert_eq!(
            parse_neighbor_state("10.0.0.1  FAILED"),
            NeighborState::Failed
        );
        assert_eq!(parse_neighbor_state(""), NeighborState::Unknown);
    }

    #[test]
    fn absorb_passes_benign_refusals() {
        let benign = ExecResult {
            exit_code: 2,
            stdout: String::new(),
            stderr: "RTNETLINK answers: File exists".to_string(),
        };
        assert!(ShellKernel::absorb("ip rule add", benign).is_ok());

        let real = ExecResult {
            exit_code: 2,
            stdout: String::new(),
            stderr: "RTNETLINK answers: Operation not permitted".to_string(),
        };
        assert!(ShellKernel::absorb("ip rule add", real).is_err());
    }

    #[tokio::test]
    async fn mock_records_in_order() {
        let kernel = MockKernel::new();
        kernel.flush_table(100).await.unwrap();
        kernel
            .add_route(100, &RouteSpec::default_via("10.0.0.1".parse().unwrap(), "eth0"))
            .await
            .unwrap();
        let ops = kernel.take_ops();
        assert_eq!(ops[0], KernelOp::FlushTable(100));
        assert!(matches!(&ops[1], KernelOp::AddRoute { table: 100, route } if route == "default via 10.0.0.1 dev eth0"));
        assert!(kernel.take_ops().is_empty());
    }
}
