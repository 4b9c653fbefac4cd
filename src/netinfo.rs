use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// Ethernet default; used whenever no interface is named or the
/// interface cannot be read.
pub const DEFAULT_MTU: u32 = 1500;

// ─── NetworkInfo ─────────────────────────────────────────────────

/// Path facts attached to a test result: addresses, family, whether
/// the client appears to sit behind NAT, and the local MTU.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInfo {
    pub client_ip: IpAddr,
    pub server_ip: IpAddr,
    pub ipv6: bool,
    pub nat_detected: bool,
    pub mtu: u32,
}

impl NetworkInfo {
    /// `local_ip` is the client's own address on its interface;
    /// `remote_seen_ip` is what the server reported seeing. NAT is
    /// inferred when the two differ and the server-seen address is a
    /// real public one (a private server-seen address just means the
    /// whole path is private).
    pub fn detect(
        local_ip: IpAddr,
        remote_seen_ip: IpAddr,
        server_ip: IpAddr,
        interface: Option<&str>,
    ) -> Self {
        let local = local_ip.to_canonical();
        let seen = remote_seen_ip.to_canonical();

        Self {
            client_ip: local,
            server_ip,
            ipv6: local.is_ipv6() || server_ip.is_ipv6(),
            nat_detected: local != seen && !is_private(seen),
            mtu: interface.and_then(interface_mtu).unwrap_or(DEFAULT_MTU),
        }
    }
}

/// Private-range check covering RFC 1918, loopback, link-local, and
/// carrier-grade NAT for v4; unique-local and link-local for v6.
pub fn is_private(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_private()
                || v4.is_loopback()
                || v4.is_link_local()
                // 100.64.0.0/10 (CGNAT)
                || (v4.octets()[0] == 100 && (v4.octets()[1] & 0xC0) == 64)
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                // fc00::/7 unique local
                || (v6.segments()[0] & 0xFE00) == 0xFC00
                // fe80::/10 link local
                || (v6.segments()[0] & 0xFFC0) == 0xFE80
        }
    }
}

/// Read the MTU of a named local interface; `None` off Linux or when
/// the interface does not exist.
fn interface_mtu(name: &str) -> Option<u32> {
    std::fs::read_to_string(format!("/sys/class/net/{name}/mtu"))
        .ok()?
        .trim()
        .parse()
        .ok()
}

// ─── Tests ───────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn v4(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn same_address_means_no_nat() {
        let info = NetworkInfo::detect(v4("203.0.113.7"), v4("203.0.113.7"), v4("198.51.100.1"), None);
        assert!(!info.nat_detected);
    }

    #[test]
    fn private_local_behind_public_seen_is_nat() {
        let info = NetworkInfo::detect(v4("192.168.1.20"), v4("203.0.113.7"), v4("198.51.100.1"), None);
        assert!(info.nat_detected);
    }

    #[test]
    fn private_seen_address_is_not_nat() {
        // both sides on the same private network
        let info = NetworkInfo::detect(v4("192.168.1.20"), v4("192.168.1.1"), v4("192.168.1.2"), None);
        assert!(!info.nat_detected);
    }

    #[test]
    fn cgnat_range_counts_as_private() {
        assert!(is_private(v4("100.64.0.1")));
        assert!(is_private(v4("100.127.255.254")));
        assert!(!is_private(v4("100.128.0.1")));
    }

    #[test]
    fn v6_unique_local_is_private() {
        assert!(is_private("fd12:3456::1".parse().unwrap()));
        assert!(is_private("fe80::1".parse().unwrap()));
        assert!(!is_private("2001:db8::1".parse().unwrap()));
    }

    #[test]
    fn ipv6_flag_tracks_either_endpoint() {
        let info = NetworkInfo::detect(
            "2001:db8::1".parse().unwrap(),
            "2001:db8::1".parse().unwrap(),
            "2001:db8::2".parse().unwrap(),
            None,
        );
        assert!(info.ipv6);
    }

    #[test]
    fn unknown_interface_falls_back_to_default_mtu() {
        let info = NetworkInfo::detect(
            v4("203.0.113.7"),
            v4("203.0.113.7"),
            v4("198.51.100.1"),
            Some("definitely-not-a-nic"),
        );
        assert_eq!(info.mtu, DEFAULT_MTU);
    }
}
