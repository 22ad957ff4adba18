// IPv4 address arithmetic for the allocator.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Convert an IPv4 address to its big-endian integer value.
pub fn to_u32(ip: Ipv4Addr) -> u32 {
    u32::from(ip)
}

/// Convert a big-endian integer value back to an IPv4 address.
pub fn from_u32(raw: u32) -> Ipv4Addr {
    Ipv4Addr::from(raw)
}

/// The address one past `ip`. Wraps at the integer boundary; staying
/// inside the subnet is the caller's policy.
pub fn next(ip: Ipv4Addr) -> Ipv4Addr {
    from_u32(to_u32(ip).wrapping_add(1))
}

/// Whether `ip` is assignable as a host address under `prefix_len`.
///
/// False for the directed broadcast of the subnet (host bits all ones)
/// and for anything that is not globally unicast: unspecified, loopback,
/// link-local, multicast and the limited broadcast.
pub fn is_unicast(ip: Ipv4Addr, prefix_len: u8) -> bool {
    let mask = if prefix_len == 0 {
        0
    } else {
        (!0u32) << (32 - prefix_len as u32)
    };
    if to_u32(ip) & !mask == !mask {
        return false;
    }

    !(ip.is_unspecified()
        || ip.is_loopback()
        || ip.is_link_local()
        || ip.is_multicast()
        || ip.is_broadcast())
}

/// Decode raw store key bytes into an address. Both 4-byte and 16-byte
/// forms are accepted; IPv4-mapped IPv6 collapses to IPv4.
pub fn from_bytes(raw: &[u8]) -> Option<IpAddr> {
    match raw.len() {
        4 => {
            let octets: [u8; 4] = raw.try_into().ok()?;
            Some(IpAddr::V4(Ipv4Addr::from(octets)))
        }
        16 => {
            let octets: [u8; 16] = raw.try_into().ok()?;
            let v6 = Ipv6Addr::from(octets);
            match v6.to_ipv4_mapped() {
                Some(v4) => Some(IpAddr::V4(v4)),
                None => Some(IpAddr::V6(v6)),
            }
        }
        _ => None,
    }
}
