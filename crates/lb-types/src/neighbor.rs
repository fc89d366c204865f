//! Kernel neighbor (ARP) cache states.

use serde::{Deserialize, Serialize};

/// Kernel neighbor state (NUD_* values from linux/neighbour.h).
///
/// Only IPv4/ARP entries are ever consulted; the state gates whether a TCP
/// probe is worth attempting at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u16)]
pub enum NeighborState {
    /// Resolution in progress, no reply yet.
    Incomplete = 0x01,
    /// Recently confirmed reachable.
    Reachable = 0x02,
    /// Confirmation has expired.
    Stale = 0x04,
    /// Waiting before re-probing.
    Delay = 0x08,
    /// Unicast probe in progress.
    Probe = 0x10,
    /// Resolution failed.
    Failed = 0x20,
    /// No entry, or a state we do not track (NOARP, PERMANENT).
    Unknown = 0x00,
}

impl NeighborState {
    /// Create from a kernel NUD_* value.
    pub fn from_kernel(state: u16) -> Self {
        match state {
            0x01 => Self::Incomplete,
            0x02 => Self::Reachable,
            0x04 => Self::Stale,
            0x08 => Self::Delay,
            0x10 => Self::Probe,
            0x20 => Self::Failed,
            _ => Self::Unknown,
        }
    }

    /// Parse the state token printed by `ip -4 neigh show`.
    pub fn from_show_token(token: &str) -> Self {
        match token {
            "INCOMPLETE" => Self::Incomplete,
            "REACHABLE" => Self::Reachable,
            "STALE" => Self::Stale,
            "DELAY" => Self::Delay,
            "PROBE" => Self::Probe,
            "FAILED" => Self::Failed,
            _ => Self::Unknown,
        }
    }

    /// States that let a probe proceed to the TCP check.
    #[inline]
    pub fn allows_probe(self) -> bool {
        matches!(
            self,
            Self::Reachable | Self::Delay | Self::Probe | Self::Unknown
        )
    }

    /// States that count as an immediate probe failure.
    #[inline]
    pub fn is_dead(self) -> bool {
        matches!(self, Self::Failed | Self::Incomplete)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_values_round_trip() {
        assert_eq!(NeighborState::from_kernel(0x02), NeighborState::Reachable);
        assert_eq!(NeighborState::from_kernel(0x20), NeighborState::Failed);
        assert_eq!(NeighborState::from_kernel(0x40), NeighborState::Unknown);
        assert_eq!(NeighborState::from_kernel(0x80), NeighborState::Unknown);
    }

    #[test]
    fn show_tokens() {
        assert_eq!(
            NeighborState::from_show_token("REACHABLE"),
            NeighborState::Reachable
        );
        assert_eq!(
            NeighborState::from_show_token("FAILED"),
            NeighborState::Failed
        );
        assert_eq!(
            NeighborState::from_show_token("PERMANENT"),
            NeighborState::Unknown
        );
    }

    #[test]
    fn gating_classes_are_disjoint() {
        for state in [
            NeighborState::Incomplete,
            NeighborState::Reachable,
            NeighborState::Stale,
            NeighborState::Delay,
            NeighborState::Probe,
            NeighborState::Failed,
            NeighborState::Unknown,
        ] {
            assert!(
                !(state.allows_probe() && state.is_dead()),
                "{state:?} cannot both pass and fail"
            );
        }
        // Stale is special-cased by the monitor (flush + pass), so it is
        // neither pass-through nor dead here.
        assert!(!NeighborState::Stale.allows_probe());
        assert!(!NeighborState::Stale.is_dead());
    }
}
