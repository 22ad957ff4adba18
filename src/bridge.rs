// Bridge lifecycle: idempotent creation, gateway assignment, NAT-out.

use ipnet::Ipv4Net;

use crate::error::{NetworkError, Result};
use crate::firewall::Nat;
use crate::netlink::LinkOps;

/// Default MTU for new bridge interfaces.
pub const DEFAULT_MTU: u32 = 1500;

/// Options for the bridge interface.
#[derive(Debug, Clone)]
pub struct BridgeSpec {
    pub name: String,
    /// Gateway address with prefix in CIDR form, e.g. `172.19.0.1/16`.
    pub ip_addr: String,
    pub mtu: u32,
}

/// Handle to a live bridge interface.
#[derive(Debug, Clone)]
pub struct BridgeHandle {
    pub name: String,
    pub index: u32,
}

/// Create the bridge named in `spec` if it does not exist, assign its
/// gateway address, install the masquerade rule and bring it up.
///
/// Idempotent: when the interface already exists the handle is returned
/// as-is, leaving addresses and firewall state untouched. The hook runs
/// once per container against the same long-lived bridge.
pub async fn init(ops: &dyn LinkOps, nat: &dyn Nat, spec: &BridgeSpec) -> Result<BridgeHandle> {
    if let Ok(index) = ops.link_index(&spec.name).await {
        tracing::debug!("bridge {} already exists (index {})", spec.name, index);
        return Ok(BridgeHandle {
            name: spec.name.clone(),
            index,
        });
    }

    let net: Ipv4Net = spec.ip_addr.parse().map_err(|e| {
        NetworkError::BadOption(format!("parsing address {} failed: {}", spec.ip_addr, e))
    })?;

    let index = ops.create_bridge(&spec.name, spec.mtu).await?;
    ops.add_address(index, net.addr(), net.prefix_len()).await?;

    // Validate that the address actually landed.
    if ops.ipv4_addresses(index).await?.is_empty() {
        return Err(NetworkError::AssignmentMissing(spec.name.clone()));
    }

    nat.ensure_masquerade(&spec.ip_addr).await?;

    ops.set_up(index).await?;

    tracing::debug!("bridge {} created (index {})", spec.name, index);
    Ok(BridgeHandle {
        name: spec.name.clone(),
        index,
    })
}

/// Remove the bridge by name. The masquerade rule is left in place;
/// operators remove it separately.
pub async fn delete(ops: &dyn LinkOps, name: &str) -> Result<()> {
    ops.delete_link(name).await
}
