//! Interface-name classification and multipath weights.

use serde::{Deserialize, Serialize};

// Predictable-name prefixes, most specific first: "enx" (USB MAC-based
// naming) must win over the generic "en*" wired prefixes.
const USB_PREFIXES: &[&str] = &["enx"];
const WIRED_PREFIXES: &[&str] = &["eno", "ens", "enp", "eth"];
const WIRELESS_PREFIXES: &[&str] = &["wlan", "wlp", "wlx", "wl"];

/// Coarse class of an uplink interface, derived from its name.
///
/// The class only drives the static nexthop weight; it has no effect on
/// health or eligibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkClass {
    /// Wired Ethernet (eno*/ens*/enp*/eth*).
    Wired,
    /// Wi-Fi (wlan*/wlp*/wlx*/wl*).
    Wireless,
    /// USB tethering with MAC-derived name (enx*).
    UsbTether,
    /// Anything else (tun, ppp, unnamed vendor schemes, ...).
    Other,
}

impl LinkClass {
    /// Classifies an interface by name prefix.
    pub fn of(iface: &str) -> Self {
        if USB_PREFIXES.iter().any(|p| iface.starts_with(p)) {
            Self::UsbTether
        } else if WIRED_PREFIXES.iter().any(|p| iface.starts_with(p)) {
            Self::Wired
        } else if WIRELESS_PREFIXES.iter().any(|p| iface.starts_with(p)) {
            Self::Wireless
        } else {
            Self::Other
        }
    }

    /// Static multipath nexthop weight for this class.
    pub fn weight(self) -> u32 {
        match self {
            Self::Wired => 5,
            Self::Wireless => 3,
            Self::UsbTether => 2,
            Self::Other => 1,
        }
    }
}

/// Nexthop weight for an interface name.
pub fn weight_of(iface: &str) -> u32 {
    LinkClass::of(iface).weight()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wired_names() {
        for name in ["eth0", "eno1", "ens3", "enp2s0"] {
            assert_eq!(LinkClass::of(name), LinkClass::Wired, "{name}");
            assert_eq!(weight_of(name), 5);
        }
    }

    #[test]
    fn wireless_names() {
        for name in ["wlan0", "wlp3s0", "wlx00c0ca", "wl0"] {
            assert_eq!(LinkClass::of(name), LinkClass::Wireless, "{name}");
            assert_eq!(weight_of(name), 3);
        }
    }

    #[test]
    fn usb_tether_wins_over_wired_prefixes() {
        // "enx..." also matches no wired prefix list entry, but order matters
        // if the lists ever grow; pin the expectation.
        assert_eq!(LinkClass::of("enx001122334455"), LinkClass::UsbTether);
        assert_eq!(weight_of("enx001122334455"), 2);
    }

    #[test]
    fn unknown_names_get_unit_weight() {
        for name in ["tun0", "ppp0", "usb0", "lte0"] {
            assert_eq!(LinkClass::of(name), LinkClass::Other, "{name}");
            assert_eq!(weight_of(name), 1);
        }
    }
}
