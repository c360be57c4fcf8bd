// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Endpoint payloads as they arrive from the datastore, and the
//! in-memory record the endpoint manager tracks per local endpoint.

use ipnet::{Ipv4Net, Ipv6Net};
use mac_address::MacAddress;
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::ValidationError;
use crate::ids::ProfileId;

/// Parse one `ipvN_nets` entry. The datastore carries these as either a
/// CIDR (`"10.0.0.1/24"`) or a bare host address (`"10.0.0.1"`); a bare
/// address is a host route, equivalent to `/32` (v4) or `/128` (v6).
/// `Ipv4Net`/`Ipv6Net`'s own `FromStr` requires an explicit prefix, so
/// this is the one place that convention is applied.
fn parse_v4_net(s: &str) -> Result<Ipv4Net, String> {
    if s.contains('/') {
        s.parse().map_err(|_| format!("invalid IPv4 CIDR {s:?}"))
    } else {
        let addr: std::net::Ipv4Addr = s.parse().map_err(|_| format!("invalid IPv4 address {s:?}"))?;
        Ok(Ipv4Net::new(addr, 32).expect("32 is a valid IPv4 prefix length"))
    }
}

fn parse_v6_net(s: &str) -> Result<Ipv6Net, String> {
    if s.contains('/') {
        s.parse().map_err(|_| format!("invalid IPv6 CIDR {s:?}"))
    } else {
        let addr: std::net::Ipv6Addr = s.parse().map_err(|_| format!("invalid IPv6 address {s:?}"))?;
        Ok(Ipv6Net::new(addr, 128).expect("128 is a valid IPv6 prefix length"))
    }
}

fn deserialize_ipv4_nets<'de, D>(deserializer: D) -> Result<Vec<Ipv4Net>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Vec<String> = Vec::deserialize(deserializer)?;
    raw.iter()
        .map(|s| parse_v4_net(s).map_err(serde::de::Error::custom))
        .collect()
}

fn deserialize_ipv6_nets<'de, D>(deserializer: D) -> Result<Vec<Ipv6Net>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Vec<String> = Vec::deserialize(deserializer)?;
    raw.iter()
        .map(|s| parse_v6_net(s).map_err(serde::de::Error::custom))
        .collect()
}

/// Administrative state of an endpoint, as set by the orchestrator.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointState {
    /// Traffic should flow; the endpoint's rules are programmed.
    Active,
    /// The endpoint exists but should be isolated: interface present,
    /// rules drop everything.
    Inactive,
}

/// Deserialized shape of an endpoint key's value, before the per-field
/// validation in [`EndpointPayload::validate`] has run.
///
/// Every field the watcher feeds into this struct must already have
/// passed `serde`'s own type checking; the cross-field checks this module
/// adds are the ones `serde` can't express (prefix convention, CIDR
/// family, non-empty name).
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct EndpointPayload {
    pub state: EndpointState,
    pub name: String,
    pub mac: MacAddress,
    #[serde(default)]
    pub profile_id: Option<ProfileId>,
    #[serde(default, deserialize_with = "deserialize_ipv4_nets")]
    pub ipv4_nets: Vec<Ipv4Net>,
    #[serde(default, deserialize_with = "deserialize_ipv6_nets")]
    pub ipv6_nets: Vec<Ipv6Net>,
    pub ipv4_gateway: Option<std::net::Ipv4Addr>,
    pub ipv6_gateway: Option<std::net::Ipv6Addr>,
}

impl EndpointPayload {
    /// Check the constraints `serde`'s type-driven deserialize can't:
    /// the interface name must start with the configured prefix, and
    /// both network lists must be present (an empty list is fine, a
    /// missing key already failed deserialization upstream).
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError`] with every problem found, not just the
    /// first.
    pub fn validate(&self, iface_prefix: &str) -> Result<(), ValidationError> {
        let mut issues = Vec::new();
        if self.name.is_empty() {
            issues.push("endpoint name must not be empty".to_string());
        } else if !self.name.starts_with(iface_prefix) {
            issues.push(format!(
                "interface {:?} does not start with {iface_prefix:?}",
                self.name
            ));
        }
        ValidationError::from_issues(issues)
    }
}

/// A local endpoint as tracked by the endpoint manager: the validated
/// payload plus the identifier it was filed under.
#[derive(Clone, Debug)]
pub struct Endpoint {
    pub id: crate::ids::EndpointId,
    pub payload: EndpointPayload,
}

impl Endpoint {
    /// Construct an endpoint from an id and an already-validated payload.
    #[must_use]
    pub fn new(id: crate::ids::EndpointId, payload: EndpointPayload) -> Self {
        Endpoint { id, payload }
    }
}
