//! Address-scope helpers.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Whether an address is globally routable. Hosts with non-global
/// addresses (RFC 1918, CGN, link-local, documentation ranges and
/// friends) are kept in the output but never looked up against the
/// external registries.
pub fn ip_is_global(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => ipv4_is_global(v4),
        IpAddr::V6(v6) => ipv6_is_global(v6),
    }
}

fn ipv4_is_global(ip: Ipv4Addr) -> bool {
    let octets = ip.octets();

    !(ip.is_private()
        || ip.is_loopback()
        || ip.is_link_local()
        || ip.is_broadcast()
        || ip.is_documentation()
        || ip.is_unspecified()
        // 100.64.0.0/10, carrier-grade NAT
        || (octets[0] == 100 && (octets[1] & 0xc0) == 64)
        // 192.0.0.0/24, IETF protocol assignments
        || (octets[0] == 192 && octets[1] == 0 && octets[2] == 0)
        // 198.18.0.0/15, benchmarking
        || (octets[0] == 198 && (octets[1] & 0xfe) == 18)
        // 240.0.0.0/4, reserved
        || octets[0] >= 240)
}

fn ipv6_is_global(ip: Ipv6Addr) -> bool {
    let segments = ip.segments();

    if let Some(v4) = ip.to_ipv4_mapped() {
        return ipv4_is_global(v4);
    }

    !(ip.is_loopback()
        || ip.is_unspecified()
        || ip.is_multicast()
        // fc00::/7, unique local
        || (segments[0] & 0xfe00) == 0xfc00
        // fe80::/10, link local
        || (segments[0] & 0xffc0) == 0xfe80
        // 2001:db8::/32, documentation
        || (segments[0] == 0x2001 && segments[1] == 0xdb8))
}
