// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Deterministic name truncation shared by the chain namer and the ipset
//! namer. The kernel tools both impose short name limits (31 characters
//! for ipset, 16 here per `spec.md` §6's "endpoint suffix"/"tag suffix"
//! convention); truncating naively risks collisions, so every truncation
//! keeps a content hash of the full string.

use sha2::{Digest, Sha256};

/// Shorten `s` to at most `max_len` characters, preserving a prefix of the
/// original plus an 8-hex-digit hash suffix when truncation is needed, so
/// that two different inputs which happen to share a long common prefix
/// still produce different names.
///
/// Strings already within the limit are returned unchanged.
#[must_use]
pub fn uniquely_shorten(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        return s.to_string();
    }
    // 1 separator byte + 8 hex digits of hash.
    let hash_suffix_len = 9;
    let prefix_len = max_len.saturating_sub(hash_suffix_len);
    let mut hasher = Sha256::new();
    hasher.update(s.as_bytes());
    let digest = hasher.finalize();
    let hash_hex: String = digest.iter().take(4).map(|b| format!("{b:02x}")).collect();
    format!("{}-{}", &s[..prefix_len], hash_hex)
}

/// Kernel chain-name limit used for per-endpoint chains (`spec.md` §4.8's
/// "16-char limit convention").
pub const ENDPOINT_CHAIN_NAME_LEN: usize = 16;

/// The interface-specific part of an endpoint's name: whatever follows
/// the configured interface prefix, shortened to
/// [`ENDPOINT_CHAIN_NAME_LEN`]. Shared by the dispatch chains (which
/// route by interface) and the per-endpoint chain programmer (which owns
/// the chains this suffix names), so both agree on the same chain names
/// without either depending on the other.
#[must_use]
pub fn endpoint_chain_suffix(iface: &str, iface_prefix: &str) -> String {
    let suffix = iface.strip_prefix(iface_prefix).unwrap_or(iface);
    uniquely_shorten(suffix, ENDPOINT_CHAIN_NAME_LEN)
}

/// Name of the "to-endpoint" chain (traffic routed *into* the endpoint)
/// for `iface`.
#[must_use]
pub fn to_chain_name(iface: &str, iface_prefix: &str) -> String {
    format!("felix-to-{}", endpoint_chain_suffix(iface, iface_prefix))
}

/// Name of the "from-endpoint" chain (traffic routed *out of* the
/// endpoint) for `iface`.
#[must_use]
pub fn from_chain_name(iface: &str, iface_prefix: &str) -> String {
    format!("felix-from-{}", endpoint_chain_suffix(iface, iface_prefix))
}

/// Names of a profile's inbound/outbound chains.
#[must_use]
pub fn profile_inbound_chain_name(profile_id: &str) -> String {
    format!("felix-p-{}-i", uniquely_shorten(profile_id, ENDPOINT_CHAIN_NAME_LEN))
}

/// See [`profile_inbound_chain_name`].
#[must_use]
pub fn profile_outbound_chain_name(profile_id: &str) -> String {
    format!("felix-p-{}-o", uniquely_shorten(profile_id, ENDPOINT_CHAIN_NAME_LEN))
}

/// Name of the top-level dispatch chain for `direction` (see
/// `felix_dispatch::Direction`). Kept here so the suffix convention has a
/// single owner even though dispatch chain names don't need hashing.
#[must_use]
pub fn dispatch_chain_name(to_endpoint: bool) -> &'static str {
    if to_endpoint {
        "felix-dispatch-to"
    } else {
        "felix-dispatch-from"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_strings_are_unchanged() {
        assert_eq!(uniquely_shorten("cali0", 16), "cali0");
    }

    #[test]
    fn long_strings_are_truncated_and_hashed() {
        let long = "a-very-long-interface-name-that-exceeds-the-limit";
        let shortened = uniquely_shorten(long, 16);
        assert_eq!(shortened.len(), 16);
        assert!(shortened.starts_with(&long[..7]));
    }

    #[test]
    fn truncation_is_deterministic() {
        let long = "another-quite-long-tag-name-for-testing";
        assert_eq!(uniquely_shorten(long, 16), uniquely_shorten(long, 16));
    }

    #[test]
    fn differing_suffixes_after_the_cut_point_produce_different_names() {
        let a = "shared-prefix-AAAA-tail-one";
        let b = "shared-prefix-AAAA-tail-two";
        assert_ne!(uniquely_shorten(a, 16), uniquely_shorten(b, 16));
    }

    #[test]
    fn endpoint_chain_names_use_the_iface_suffix_not_the_whole_name() {
        let to = to_chain_name("cali1234", "cali");
        let from = from_chain_name("cali1234", "cali");
        assert_eq!(to, "felix-to-1234");
        assert_eq!(from, "felix-from-1234");
    }

    #[test]
    fn profile_chain_names_differ_by_direction() {
        let inbound = profile_inbound_chain_name("web");
        let outbound = profile_outbound_chain_name("web");
        assert_ne!(inbound, outbound);
        assert!(inbound.ends_with("-i"));
        assert!(outbound.ends_with("-o"));
    }
}
