//! Route observer: a lazy stream of "topology may have changed" ticks.
//!
//! Binds an rtnetlink socket to the link, IPv4 address, and IPv4 route
//! multicast groups and forwards every notification as one opaque tick. The
//! observer never classifies events; a tick only promises that the sampler
//! output may differ. One synthetic tick is emitted at startup so the first
//! reconcile runs unconditionally.

use tokio::sync::mpsc;

use crate::error::Result;

/// Opaque topology-change notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteEvent;

/// Channel depth for pending ticks. Ticks are coalesced: when the channel is
/// full a drop is safe because an undelivered tick already guarantees a
/// resample after the change.
const TICK_CHANNEL_DEPTH: usize = 64;

/// Starts the observer and returns the tick stream. The synthetic startup
/// tick is already queued on return.
pub fn spawn_observer() -> Result<mpsc::Receiver<RouteEvent>> {
    let (tx, rx) = mpsc::channel(TICK_CHANNEL_DEPTH);
    tx.try_send(RouteEvent)
        .expect("fresh channel accepts the startup tick");
    imp::spawn_pump(tx)?;
    Ok(rx)
}

#[cfg(target_os = "linux")]
mod imp {
    use super::*;
    use lb_common::LbError;
    use netlink_packet_core::{NetlinkMessage, NetlinkPayload};
    use netlink_packet_route::RouteNetlinkMessage;
    use netlink_sys::{protocols::NETLINK_ROUTE, Socket, SocketAddr};
    use std::io;
    use std::os::fd::{AsRawFd, RawFd};
    use tokio::io::unix::AsyncFd;

    /// rtnetlink multicast groups (linux/rtnetlink.h).
    const RTNLGRP_LINK: u32 = 1;
    const RTNLGRP_IPV4_IFADDR: u32 = 5;
    const RTNLGRP_IPV4_ROUTE: u32 = 7;

    /// Netlink socket subscribed to the topology groups.
    pub struct RouteSocket {
        socket: Socket,
        buffer: Vec<u8>,
    }

    impl RouteSocket {
        pub fn new() -> Result<Self> {
            let mut socket = Socket::new(NETLINK_ROUTE)
                .map_err(|e| LbError::netlink("socket", e.to_string()))?;

            let groups = group_bit(RTNLGRP_LINK)
                | group_bit(RTNLGRP_IPV4_IFADDR)
                | group_bit(RTNLGRP_IPV4_ROUTE);
            socket
                .bind(&SocketAddr::new(0, groups))
                .map_err(|e| LbError::netlink("bind", e.to_string()))?;
            socket
                .set_non_blocking(true)
                .map_err(|e| LbError::netlink("set_non_blocking", e.to_string()))?;

            tracing::debug!("netlink socket bound to link/ifaddr/route groups");

            Ok(Self {
                socket,
                buffer: vec![0u8; 65536],
            })
        }

        /// Receives one datagram and returns the number of messages in it.
        /// The count is only used for logging; any datagram is a tick.
        fn recv_burst(&mut self) -> io::Result<usize> {
            let len = self.socket.recv(&mut &mut self.buffer[..], 0)?;
            let mut count = 0;
            let mut offset = 0;
            while offset < len {
                let Ok(msg) =
                    NetlinkMessage::<RouteNetlinkMessage>::deserialize(&self.buffer[offset..len])
                else {
                    break;
                };
                let length = msg.header.length as usize;
                if length == 0 {
                    break;
                }
                if let NetlinkPayload::InnerMessage(inner) = &msg.payload {
                    tracing::trace!(kind = kind_name(inner), "route event");
                }
                count += 1;
                // Messages are 4-byte aligned within the datagram.
                offset += (length + 3) & !3;
            }
            Ok(count)
        }
    }

    impl AsRawFd for RouteSocket {
        fn as_raw_fd(&self) -> RawFd {
            self.socket.as_raw_fd()
        }
    }

    fn group_bit(group: u32) -> u32 {
        1 << (group - 1)
    }

    fn kind_name(msg: &RouteNetlinkMessage) -> &'static str {
        match msg {
            RouteNetlinkMessage::NewRoute(_) => "new-route",
            RouteNetlinkMessage::DelRoute(_) => "del-route",
            RouteNetlinkMessage::NewLink(_) => "new-link",
            RouteNetlinkMessage::DelLink(_) => "del-link",
            RouteNetlinkMessage::NewAddress(_) => "new-address",
            RouteNetlinkMessage::DelAddress(_) => "del-address",
            _ => "other",
        }
    }

    /// Pumps netlink notifications into the tick channel until the receiver
    /// is dropped.
    pub fn spawn_pump(tx: mpsc::Sender<RouteEvent>) -> Result<()> {
        let socket = RouteSocket::new()?;
        let fd = AsyncFd::new(socket).map_err(LbError::Io)?;

        tokio::spawn(async move {
            let mut fd = fd;
            loop {
                let mut guard = match fd.readable_mut().await {
                    Ok(guard) => guard,
                    Err(e) => {
                        tracing::error!(error = %e, "netlink readiness lost, observer stopping");
                        return;
                    }
                };
                match guard.try_io(|inner| inner.get_mut().recv_burst()) {
                    Ok(Ok(count)) => {
                        tracing::debug!(messages = count, "topology change tick");
                        match tx.try_send(RouteEvent) {
                            Ok(()) => {}
                            Err(mpsc::error::TrySendError::Full(_)) => {
                                // A tick is already pending; coalesce.
                            }
                            Err(mpsc::error::TrySendError::Closed(_)) => return,
                        }
                    }
                    Ok(Err(e)) => {
                        tracing::warn!(error = %e, "netlink recv error");
                    }
                    Err(_would_block) => continue,
                }
            }
        });
        Ok(())
    }
}

/// Mock observer for non-Linux development builds: only the synthetic
/// startup tick is ever delivered.
#[cfg(not(target_os = "linux"))]
mod imp {
    use super::*;

    pub fn spawn_pump(_tx: mpsc::Sender<RouteEvent>) -> Result<()> {
        tracing::warn!("route observer is a no-op on this platform");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn startup_tick_is_queued() {
        // On Linux this also exercises socket creation, which needs no
        // privileges for a multicast bind.
        let mut rx = match spawn_observer() {
            Ok(rx) => rx,
            // Sandboxed test environments may refuse netlink sockets.
            Err(_) => return,
        };
        assert_eq!(rx.recv().await, Some(RouteEvent));
    }
}
