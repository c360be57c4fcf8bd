// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Renders one abstract [`Rule`] into an `iptables`/`ip6tables` match
//! fragment for a single IP family.

use felix_ipset::names::owned_ipset_names;
use felix_model::{Action, IpVersion, PortSpec, Protocol, Rule};

fn ports_csv(ports: &[PortSpec]) -> String {
    ports
        .iter()
        .map(|p| match p {
            PortSpec::Port(port) => port.to_string(),
            PortSpec::Range(start, end) => format!("{start}:{end}"),
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// Render `rule` as a standalone rule line for `version`, or `None` if
/// the rule does not apply to this IP family: an explicit `ip_version`
/// mismatch, or a `src_net`/`dst_net` that only parses as the other
/// family.
#[must_use]
pub fn render_rule(rule: &Rule, version: IpVersion) -> Option<String> {
    if let Some(v) = rule.ip_version {
        let matches = match version {
            IpVersion::V4 => v == 4,
            IpVersion::V6 => v == 6,
        };
        if !matches {
            return None;
        }
    }

    let mut parts = Vec::new();

    if let Some(protocol) = rule.protocol {
        let name = match protocol {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Icmp => "icmp",
            Protocol::Icmpv6 => "icmpv6",
        };
        parts.push(format!("-p {name}"));
    }

    for (flag, net) in [("-s", &rule.src_net), ("-d", &rule.dst_net)] {
        if let Some(net) = net {
            let parses = match version {
                IpVersion::V4 => net.parse::<ipnet::Ipv4Net>().is_ok(),
                IpVersion::V6 => net.parse::<ipnet::Ipv6Net>().is_ok(),
            };
            if !parses {
                return None;
            }
            parts.push(format!("{flag} {net}"));
        }
    }

    if let Some(ports) = &rule.src_ports {
        parts.push(format!("-m multiport --sports {}", ports_csv(ports)));
    }
    if let Some(ports) = &rule.dst_ports {
        parts.push(format!("-m multiport --dports {}", ports_csv(ports)));
    }

    for (flag, tag) in [("src", &rule.src_tag), ("dst", &rule.dst_tag)] {
        if let Some(tag) = tag {
            let (set_name, _) = owned_ipset_names(tag, version);
            parts.push(format!("-m set --match-set {set_name} {flag}"));
        }
    }

    if let Some(icmp_type) = rule.icmp_type {
        let flag = match rule.protocol {
            Some(Protocol::Icmpv6) => "--icmpv6-type",
            _ => "--icmp-type",
        };
        match rule.icmp_code {
            Some(code) => parts.push(format!("{flag} {icmp_type}/{code}")),
            None => parts.push(format!("{flag} {icmp_type}")),
        }
    }

    let target = match rule.action {
        Some(Action::Deny) => "DROP",
        // An absent action, like a rule with no match criteria at all,
        // is treated as allow -- the reference validator only rejects
        // malformed fields, never a missing action.
        Some(Action::Allow) | None => "RETURN",
    };
    parts.push(format!("-j {target}"));

    Some(parts.join(" "))
}
