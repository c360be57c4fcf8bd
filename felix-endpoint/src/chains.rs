// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Fixed rule structure of the per-endpoint "to" and "from" chains
//! (`spec.md` §4.8). Unlike a profile's rule list, these rules never
//! vary with policy content -- only with IP family, the endpoint's
//! current profile, and its current allowed addresses.

use std::net::IpAddr;

use felix_model::{naming, normalize_host_cidr, IpVersion, ProfileId};
use mac_address::MacAddress;

/// ICMPv6 types that must be let through a "to-endpoint" chain
/// regardless of policy: MLD (130-132) and neighbor discovery / router
/// advertisement (134-136).
const ICMPV6_ALWAYS_ALLOWED: [u8; 6] = [130, 131, 132, 134, 135, 136];

/// Rules for the chain carrying traffic **into** the endpoint.
#[must_use]
pub fn to_chain_rules(version: IpVersion, profile_id: &ProfileId) -> Vec<String> {
    let mut rules = Vec::new();
    if version == IpVersion::V6 {
        for icmp_type in ICMPV6_ALWAYS_ALLOWED {
            rules.push(format!("-p icmpv6 --icmpv6-type {icmp_type} -j RETURN"));
        }
    }
    rules.push("-m conntrack --ctstate INVALID -j DROP".to_string());
    rules.push("-m conntrack --ctstate RELATED,ESTABLISHED -j RETURN".to_string());
    rules.push(format!("--goto {}", naming::profile_inbound_chain_name(profile_id)));
    rules
}

/// Rules for the chain carrying traffic **out of** the endpoint.
/// `ips` must already be filtered to addresses of `version`'s family.
#[must_use]
pub fn from_chain_rules(
    version: IpVersion,
    profile_id: &ProfileId,
    mac: &MacAddress,
    ips: impl Iterator<Item = IpAddr>,
) -> Vec<String> {
    let mut rules = Vec::new();
    if version == IpVersion::V6 {
        rules.push("-p icmpv6 -j RETURN".to_string());
    }
    rules.push("-m conntrack --ctstate INVALID -j DROP".to_string());
    rules.push("-m conntrack --ctstate RELATED,ESTABLISHED -j RETURN".to_string());
    match version {
        IpVersion::V4 => rules.push("-p udp --sport 68 --dport 67 -j RETURN".to_string()),
        IpVersion::V6 => rules.push("-p udp --sport 546 --dport 547 -j RETURN".to_string()),
    }

    let outbound_chain = naming::profile_outbound_chain_name(profile_id);
    for ip in ips {
        let cidr = normalize_host_cidr(&ip.to_string(), version);
        // MacAddress's own Display already renders upper-cased
        // colon-separated hex, matching `spec.md`'s e2e scenario 2.
        rules.push(format!("-s {cidr} -m mac --mac-source {mac} --goto {outbound_chain}"));
    }
    // Anti-spoof default: nothing else may leave this interface.
    rules.push("-j DROP".to_string());
    rules
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v6_to_chain_allows_icmpv6_before_conntrack_checks() {
        let rules = to_chain_rules(IpVersion::V6, &ProfileId::from("web"));
        assert_eq!(rules.len(), 6 + 3);
        assert!(rules[0].contains("--icmpv6-type 130"));
        assert!(rules.last().unwrap().starts_with("--goto felix-p-web"));
    }

    #[test]
    fn v4_to_chain_has_no_icmpv6_allowances() {
        let rules = to_chain_rules(IpVersion::V4, &ProfileId::from("web"));
        assert_eq!(rules.len(), 3);
        assert!(rules[0].contains("INVALID"));
    }

    #[test]
    fn from_chain_ends_with_anti_spoof_drop() {
        let mac = MacAddress::new([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);
        let rules = from_chain_rules(
            IpVersion::V4,
            &ProfileId::from("web"),
            &mac,
            std::iter::once("10.0.0.1".parse().unwrap()),
        );
        assert_eq!(rules.last().unwrap(), "-j DROP");
        let goto_rule = rules.iter().find(|r| r.contains("--goto")).unwrap();
        assert!(goto_rule.contains("10.0.0.1/32"));
        assert!(goto_rule.contains("AA:BB:CC:DD:EE:FF"));
    }

    #[test]
    fn v4_from_chain_allows_dhcp_not_dhcpv6() {
        let mac = MacAddress::new([0, 0, 0, 0, 0, 0]);
        let rules = from_chain_rules(IpVersion::V4, &ProfileId::from("web"), &mac, std::iter::empty());
        assert!(rules.iter().any(|r| r.contains("--sport 68 --dport 67")));
        assert!(!rules.iter().any(|r| r.contains("546")));
    }
}
