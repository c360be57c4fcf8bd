// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The data model shared by every reconciliation component: endpoints,
//! profiles (rule lists and tag lists), rule records, and the handful of
//! pure helpers (IP extraction, name truncation) that more than one
//! component needs.
//!
//! Nothing in this crate touches the kernel or the datastore; it only
//! describes the shapes those components agree on and validates them
//! against the invariants `spec.md` §3 and §6 spell out.

#![deny(clippy::all)]
#![forbid(unsafe_code)]

pub mod endpoint;
pub mod error;
pub mod ids;
pub mod naming;
pub mod rules;

pub use endpoint::{Endpoint, EndpointPayload, EndpointState};
pub use error::ValidationError;
pub use ids::{EndpointId, ProfileId, Tag};
pub use rules::{Action, PortSpec, Protocol, Rule, RuleList};

/// Which IP family a dataplane object (chain, ipset, rule) belongs to.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, serde::Deserialize, serde::Serialize)]
pub enum IpVersion {
    /// IPv4.
    V4 = 4,
    /// IPv6.
    V6 = 6,
}

impl IpVersion {
    /// The `ipvN_nets`-style field name for this version.
    #[must_use]
    pub fn nets_field(self) -> &'static str {
        match self {
            IpVersion::V4 => "ipv4_nets",
            IpVersion::V6 => "ipv6_nets",
        }
    }
}

impl std::fmt::Display for IpVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IpVersion::V4 => write!(f, "4"),
            IpVersion::V6 => write!(f, "6"),
        }
    }
}

/// Normalize a possibly-bare IP address into a CIDR with an explicit host
/// prefix (`/32` for IPv4, `/128` for IPv6), leaving an already-CIDR
/// string untouched. Used when building anti-spoofing match rules (see
/// `spec.md` §4.8 "from-endpoint chain", item 5).
#[must_use]
pub fn normalize_host_cidr(net: &str, version: IpVersion) -> String {
    if net.contains('/') {
        net.to_string()
    } else {
        let bits = match version {
            IpVersion::V4 => 32,
            IpVersion::V6 => 128,
        };
        format!("{net}/{bits}")
    }
}
