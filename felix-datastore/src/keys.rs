// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Key-space layout (`spec.md` §6 "Datastore layout") and the regexes
//! that classify a key into one of the kinds the watcher cares about.

use regex::Regex;

/// Default versioned root, matching the reference implementation's
/// `VERSION_DIR`.
pub const DEFAULT_ROOT: &str = "/calico/v1";

/// What kind of datastore object a key names.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum KeyKind {
    Ready,
    Config,
    HostConfig,
    Endpoint { endpoint_id: String },
    ProfileRules { profile_id: String },
    ProfileTags { profile_id: String },
    /// The profile's own directory (`.../profile/<id>`, no further
    /// suffix) -- only meaningful on a `delete` action, which the
    /// reference implementation treats as "the whole profile went
    /// away" and synthesizes both a rules-null and a tags-null update.
    ProfileDir { profile_id: String },
    /// Anything else; carried so a non-set/non-create event under one
    /// of the resync-trigger prefixes can still be recognized.
    Other,
}

/// Compiled key regexes for one (root, hostname) pair.
pub struct Keys {
    root: String,
    ready_key: String,
    config_dir: String,
    host_config_dir: String,
    endpoint_re: Regex,
    profile_rules_re: Regex,
    profile_tags_re: Regex,
    profile_dir_re: Regex,
    host_dir_prefix: String,
    profile_dir_prefix: String,
}

impl Keys {
    #[must_use]
    pub fn new(root: &str, hostname: &str) -> Self {
        let root = root.trim_end_matches('/').to_string();
        let escaped_root = regex::escape(&root);
        Keys {
            ready_key: format!("{root}/Ready"),
            config_dir: format!("{root}/config"),
            host_config_dir: format!("{root}/host/{hostname}/config"),
            endpoint_re: Regex::new(&format!(
                r"^{escaped_root}/host/(?P<hostname>[^/]+)/workload/(?P<orchestrator>[^/]+)/(?P<workload>[^/]+)/endpoint/(?P<endpoint_id>[^/]+)$"
            ))
            .expect("static pattern compiles"),
            profile_rules_re: Regex::new(&format!(
                r"^{escaped_root}/policy/profile/(?P<profile_id>[^/]+)/rules$"
            ))
            .expect("static pattern compiles"),
            profile_tags_re: Regex::new(&format!(
                r"^{escaped_root}/policy/profile/(?P<profile_id>[^/]+)/tags$"
            ))
            .expect("static pattern compiles"),
            profile_dir_re: Regex::new(&format!(
                r"^{escaped_root}/policy/profile/(?P<profile_id>[^/]+)$"
            ))
            .expect("static pattern compiles"),
            host_dir_prefix: format!("{root}/host/"),
            profile_dir_prefix: format!("{root}/policy/profile/"),
            root,
        }
    }

    #[must_use]
    pub fn root(&self) -> &str {
        &self.root
    }

    #[must_use]
    pub fn ready_key(&self) -> &str {
        &self.ready_key
    }

    #[must_use]
    pub fn config_dir(&self) -> &str {
        &self.config_dir
    }

    #[must_use]
    pub fn host_config_dir(&self) -> &str {
        &self.host_config_dir
    }

    /// Classify `key` into the kind of object it names. Order matters:
    /// the more specific profile-rules/tags patterns are tried before
    /// the bare profile-directory pattern.
    #[must_use]
    pub fn classify(&self, key: &str) -> KeyKind {
        if key == self.ready_key {
            return KeyKind::Ready;
        }
        if let Some(caps) = self.endpoint_re.captures(key) {
            return KeyKind::Endpoint {
                endpoint_id: caps["endpoint_id"].to_string(),
            };
        }
        if let Some(caps) = self.profile_rules_re.captures(key) {
            return KeyKind::ProfileRules {
                profile_id: caps["profile_id"].to_string(),
            };
        }
        if let Some(caps) = self.profile_tags_re.captures(key) {
            return KeyKind::ProfileTags {
                profile_id: caps["profile_id"].to_string(),
            };
        }
        if let Some(caps) = self.profile_dir_re.captures(key) {
            return KeyKind::ProfileDir {
                profile_id: caps["profile_id"].to_string(),
            };
        }
        if key.starts_with(&self.config_dir) {
            return KeyKind::Config;
        }
        if key.starts_with(&self.host_config_dir) {
            return KeyKind::HostConfig;
        }
        KeyKind::Other
    }

    /// The hostname an endpoint key belongs to, if `key` is an endpoint
    /// key. Used to decide whether an endpoint is "local" without
    /// requiring the payload itself to carry a `host` field -- the
    /// datastore layout already encodes it in the key.
    #[must_use]
    pub fn endpoint_host(&self, key: &str) -> Option<String> {
        self.endpoint_re
            .captures(key)
            .map(|caps| caps["hostname"].to_string())
    }

    /// Prefixes under which any non-set/non-create event (directory
    /// deletion, expiry of something unexpected) forces a full resync
    /// rather than being handled incrementally (`spec.md` §4.10).
    #[must_use]
    pub fn resync_trigger_prefixes(&self) -> [&str; 3] {
        [&self.ready_key, &self.profile_dir_prefix, &self.host_dir_prefix]
    }
}
