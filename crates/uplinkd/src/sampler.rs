//! State sampler: canonical snapshot of the usable default gateways.

use lb_types::{canonicalize, UplinkTuple};

use crate::error::Result;
use crate::kernel::KernelOps;

/// Samples the current set of default-route tuples in canonical order.
///
/// A default route contributes a tuple only when it names both a gateway and
/// a device and the device has an IPv4 address; everything else is discarded.
/// Allocation is bounded by the number of default routes (expected ≤ ~8).
pub async fn sample<K: KernelOps + ?Sized>(kernel: &K) -> Result<Vec<UplinkTuple>> {
    let routes = kernel.list_default_routes().await?;
    let mut tuples = Vec::with_capacity(routes.len());

    for route in routes {
        match kernel.primary_ipv4_of(&route.iface).await? {
            Some(src_ip) => tuples.push(UplinkTuple::new(route.iface, route.gw, src_ip)),
            None => {
                tracing::debug!(
                    iface = %route.iface,
                    gw = %route.gw,
                    "default route without IPv4 address, skipping"
                );
            }
        }
    }

    Ok(canonicalize(tuples))
}
