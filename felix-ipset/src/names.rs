// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Deterministic kernel names for a tag's IP sets.

use felix_model::{naming::uniquely_shorten, IpVersion, Tag};

/// `ipset` caps names at 31 characters (`IPSET_MAXNAMELEN - 1`).
const MAX_IPSET_NAME_LEN: usize = 31;

/// The main and temp set names owned by the actor tracking `tag` for
/// `version`. Both are truncated and hash-suffixed by
/// [`uniquely_shorten`] so two tags with a long shared prefix never
/// collide once truncated.
#[must_use]
pub fn owned_ipset_names(tag: &Tag, version: IpVersion) -> (String, String) {
    let main = format!("felix-v{version}-{tag}");
    let temp = format!("felix-tmp-v{version}-{tag}");
    (
        uniquely_shorten(&main, MAX_IPSET_NAME_LEN),
        uniquely_shorten(&temp, MAX_IPSET_NAME_LEN),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_tag_names_are_not_mangled() {
        let (main, temp) = owned_ipset_names(&Tag::from("web"), IpVersion::V4);
        assert_eq!(main, "felix-v4-web");
        assert_eq!(temp, "felix-tmp-v4-web");
    }

    #[test]
    fn names_stay_within_the_kernel_limit() {
        let long_tag = Tag::from("a-tag-name-so-long-it-will-not-fit-in-31-characters");
        let (main, temp) = owned_ipset_names(&long_tag, IpVersion::V6);
        assert!(main.len() <= MAX_IPSET_NAME_LEN);
        assert!(temp.len() <= MAX_IPSET_NAME_LEN);
    }
}
