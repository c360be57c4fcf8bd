// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Profile rule lists: the abstract policy a profile's rules actor
//! (`felix-profiles`) translates into kernel chains.

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::ids::Tag;
use crate::IpVersion;

/// Transport protocol a rule matches on.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// TCP.
    Tcp,
    /// UDP.
    Udp,
    /// ICMP (IPv4 only).
    Icmp,
    /// ICMPv6 (IPv6 only).
    Icmpv6,
}

/// What to do with traffic that matches a rule.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// Let the traffic through.
    Allow,
    /// Drop the traffic.
    Deny,
}

/// A single port, or an inclusive `start:end` range with `start < end`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(untagged)]
pub enum PortSpec {
    /// A single port number, 1–65535.
    Port(u16),
    /// An inclusive range `start..=end`, both 1–65535 and `start < end`.
    Range(u16, u16),
}

/// Raw, not-yet-validated shape of a port list entry as it arrives from
/// the datastore: either a JSON integer or a `"start:end"` string.
#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
enum RawPort {
    Int(i64),
    Range(String),
}

impl<'de> Deserialize<'de> for PortSpec {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = RawPort::deserialize(deserializer)?;
        PortSpec::try_from(raw).map_err(serde::de::Error::custom)
    }
}

impl TryFrom<RawPort> for PortSpec {
    type Error = String;

    fn try_from(raw: RawPort) -> Result<Self, Self::Error> {
        match raw {
            RawPort::Int(port) => {
                if (1..=65535).contains(&port) {
                    Ok(PortSpec::Port(port as u16))
                } else {
                    Err(format!("port {port} out of range"))
                }
            }
            RawPort::Range(s) => {
                let mut fields = s.splitn(2, ':');
                let (Some(start), Some(end)) = (fields.next(), fields.next()) else {
                    return Err(format!("port range {s:?} unparseable"));
                };
                let start: i64 = start
                    .parse()
                    .map_err(|_| format!("port range {s:?} invalid"))?;
                let end: i64 = end
                    .parse()
                    .map_err(|_| format!("port range {s:?} invalid"))?;
                if start >= end || start < 1 || end > 65535 {
                    return Err(format!("port range {s:?} invalid"));
                }
                Ok(PortSpec::Range(start as u16, end as u16))
            }
        }
    }
}

/// One inbound or outbound rule. Every field is optional; an empty rule
/// matches everything. `spec.md` §3 "Rule record" is the normative list of
/// fields and cross-field constraints.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Rule {
    pub protocol: Option<Protocol>,
    pub ip_version: Option<u8>,
    pub src_net: Option<String>,
    pub dst_net: Option<String>,
    #[serde(default)]
    pub src_ports: Option<Vec<PortSpec>>,
    #[serde(default)]
    pub dst_ports: Option<Vec<PortSpec>>,
    pub src_tag: Option<Tag>,
    pub dst_tag: Option<Tag>,
    pub icmp_type: Option<u16>,
    pub icmp_code: Option<u16>,
    pub action: Option<Action>,
}

impl Rule {
    /// Validate the cross-field constraints that a plain field-by-field
    /// deserialize can't express: `ip_version` must be 4 or 6,
    /// `icmpv6`/`icmp` must agree with it, CIDRs must match the rule's IP
    /// version, ICMP type/code must be in range, and a code requires a
    /// type.
    fn validate(&self, issues: &mut Vec<String>) {
        if let Some(v) = self.ip_version {
            if v != 4 && v != 6 {
                issues.push(format!("invalid ip_version {v} in rule"));
                return;
            }
        }
        let version = match self.ip_version {
            Some(4) => Some(IpVersion::V4),
            Some(6) => Some(IpVersion::V6),
            _ => None,
        };
        if matches!(version, Some(IpVersion::V4)) && self.protocol == Some(Protocol::Icmpv6) {
            issues.push("using icmpv6 with IPv4 in rule".to_string());
        }
        if matches!(version, Some(IpVersion::V6)) && self.protocol == Some(Protocol::Icmp) {
            issues.push("using icmp with IPv6 in rule".to_string());
        }
        for (field, net) in [("src_net", &self.src_net), ("dst_net", &self.dst_net)] {
            if let Some(net) = net {
                let valid = match version {
                    Some(IpVersion::V4) => net.parse::<ipnet::Ipv4Net>().is_ok(),
                    Some(IpVersion::V6) => net.parse::<ipnet::Ipv6Net>().is_ok(),
                    None => {
                        net.parse::<ipnet::Ipv4Net>().is_ok() || net.parse::<ipnet::Ipv6Net>().is_ok()
                    }
                };
                if !valid {
                    issues.push(format!("invalid CIDR in rule field {field}: {net}"));
                }
            }
        }
        if let Some(icmp_type) = self.icmp_type {
            if icmp_type > 255 {
                issues.push("ICMP type is out of range".to_string());
            }
        }
        if let Some(icmp_code) = self.icmp_code {
            if icmp_code > 255 {
                issues.push("ICMP code is out of range".to_string());
            }
            if self.icmp_type.is_none() {
                issues.push("ICMP code specified without ICMP type".to_string());
            }
        }
    }
}

/// A profile's ordered inbound and outbound rule lists.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct RuleList {
    #[serde(default)]
    pub inbound_rules: Vec<Rule>,
    #[serde(default)]
    pub outbound_rules: Vec<Rule>,
}

impl RuleList {
    /// Validate every rule in both directions, collecting every issue
    /// found rather than stopping at the first (matches the reference
    /// validator).
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError`] listing every problem found.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let mut issues = Vec::new();
        for rule in self.inbound_rules.iter().chain(self.outbound_rules.iter()) {
            rule.validate(&mut issues);
        }
        ValidationError::from_issues(issues)
    }
}
