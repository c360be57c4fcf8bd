// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The datastore watcher (C10): connects, performs an initial snapshot
//! read, and then long-polls for deltas, dispatching every change to an
//! [`UpdateSink`] -- the "update splitter" `spec.md` §2's dataflow shows
//! fanning out to the endpoint manager, the profile rules manager and
//! the ipset manager.
//!
//! `felix-model::Endpoint`/`EndpointPayload` carries no `host` field --
//! "local" is a property of the *key* an endpoint was read from, not of
//! the payload -- so this module wraps every endpoint update in
//! [`RawEndpoint`], which keeps the host alongside the payload all the
//! way to the sink. The sink (the `felix` binary's update splitter)
//! decides which consumers care about which host.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;

use felix_config::Config;
use felix_model::{EndpointId, EndpointPayload, ProfileId, RuleList, Tag};

use crate::client::{DatastoreClient, DatastoreError, Node};
use crate::keys::{KeyKind, Keys, DEFAULT_ROOT};

/// Connect timeout for a long-poll wait (`spec.md` §4.10).
pub const WAIT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Read timeout for a long-poll wait.
pub const WAIT_READ_TIMEOUT: Duration = Duration::from_secs(90);
/// Backoff between retries of config loading, the readiness wait, and a
/// failed resync (`spec.md`'s reference `RETRY_DELAY`).
pub const RETRY_DELAY: Duration = Duration::from_secs(5);

/// An endpoint update as delivered to the sink: the validated payload
/// plus the host its key named, so the splitter can decide whether this
/// agent treats it as local.
#[derive(Clone, Debug)]
pub struct RawEndpoint {
    pub host: String,
    pub payload: EndpointPayload,
}

/// The "update splitter": receives every datastore change the watcher
/// produces and fans it out to the components that care. Implemented by
/// the `felix` binary, which owns the endpoint manager, profile rules
/// manager, and ipset managers this dispatches to.
#[async_trait::async_trait]
pub trait UpdateSink: Send {
    /// A full resync: replace all in-memory state built from these three
    /// maps. Called once per outer watch-loop iteration, before any
    /// incremental update.
    async fn apply_snapshot(
        &mut self,
        rules_by_id: HashMap<ProfileId, RuleList>,
        tags_by_id: HashMap<ProfileId, BTreeSet<Tag>>,
        endpoints_by_id: HashMap<EndpointId, RawEndpoint>,
    );

    /// `rules: None` means the profile's rule list was deleted (or its
    /// payload failed validation, which is treated the same way).
    async fn on_rules_update(&mut self, profile_id: ProfileId, rules: Option<RuleList>);

    /// `tags: None` means the profile's tag list was deleted (or failed
    /// validation).
    async fn on_tags_update(&mut self, profile_id: ProfileId, tags: Option<BTreeSet<Tag>>);

    /// `endpoint: None` means the endpoint was deleted (or failed
    /// validation) -- per `spec.md` §9 Open Question (b), a later valid
    /// update re-creates it; nothing here needs to track "was this
    /// undeleted" state, since each update is just whatever the
    /// datastore currently holds.
    async fn on_endpoint_update(&mut self, endpoint_id: EndpointId, endpoint: Option<RawEndpoint>);
}

/// What happened after one long-poll wait resolved.
#[derive(Debug, Eq, PartialEq)]
pub enum PollOutcome {
    /// Processed normally; continue polling from this `waitIndex`.
    Continue(u64),
    /// A desync condition was observed; the caller must break out to a
    /// full resync.
    Resync,
}

fn parse_rules(value: &str) -> Option<RuleList> {
    match serde_json::from_str::<RuleList>(value) {
        Ok(rules) => match rules.validate() {
            Ok(()) => Some(rules),
            Err(err) => {
                tracing::warn!(%err, "rule list failed validation, treating as deleted");
                None
            }
        },
        Err(err) => {
            tracing::warn!(%err, "rule list payload did not parse, treating as deleted");
            None
        }
    }
}

fn parse_tags(value: &str) -> Option<BTreeSet<Tag>> {
    match serde_json::from_str::<Vec<String>>(value) {
        Ok(tags) => Some(tags.into_iter().map(Tag::from).collect()),
        Err(err) => {
            tracing::warn!(%err, "tag list payload did not parse, treating as deleted");
            None
        }
    }
}

fn parse_endpoint(iface_prefix: &str, value: &str) -> Option<EndpointPayload> {
    match serde_json::from_str::<EndpointPayload>(value) {
        Ok(payload) => match payload.validate(iface_prefix) {
            Ok(()) => Some(payload),
            Err(err) => {
                tracing::warn!(%err, "endpoint failed validation, treating as deleted");
                None
            }
        },
        Err(err) => {
            tracing::warn!(%err, "endpoint payload did not parse, treating as deleted");
            None
        }
    }
}

fn collect_leaves(node: &Node, out: &mut Vec<Node>) {
    if node.dir {
        for child in &node.children {
            collect_leaves(child, out);
        }
    } else {
        out.push(node.clone());
    }
}

/// Flatten a one-level config directory node into `key basename -> value`.
fn node_to_map(node: &Node) -> BTreeMap<String, String> {
    node.children
        .iter()
        .filter_map(|child| {
            let value = child.value.clone()?;
            let name = child.key.rsplit('/').next().unwrap_or(&child.key);
            Some((name.to_string(), value))
        })
        .collect()
}

/// Drives the watch/resync protocol (`spec.md` §4.10) against a
/// [`DatastoreClient`].
pub struct Watcher<D: DatastoreClient> {
    client: D,
    keys: Keys,
    hostname: String,
    iface_prefix: String,
    expected_cluster_id: Option<String>,
}

impl<D: DatastoreClient> Watcher<D> {
    #[must_use]
    pub fn new(client: D, hostname: impl Into<String>) -> Self {
        let hostname = hostname.into();
        Watcher {
            keys: Keys::new(DEFAULT_ROOT, &hostname),
            client,
            hostname,
            iface_prefix: String::new(),
            expected_cluster_id: None,
        }
    }

    /// Set the interface-name prefix used to validate endpoints, once
    /// it's known from [`Watcher::load_config`]. Endpoint validation
    /// before this is called always fails (empty prefix matches
    /// nothing), which is safe: `watch`/`resync` are never called before
    /// `load_config` has completed in the `felix` binary's startup
    /// sequence.
    pub fn set_iface_prefix(&mut self, prefix: impl Into<String>) {
        self.iface_prefix = prefix.into();
    }

    async fn wait_for_ready(&self) {
        loop {
            match self.client.read(self.keys.ready_key(), false).await {
                Ok(resp) if resp.node.value.as_deref() == Some("true") => return,
                Ok(_) => tracing::info!("datastore not ready, waiting"),
                Err(err) => tracing::warn!(%err, "failed to read readiness flag, waiting"),
            }
            tokio::time::sleep(RETRY_DELAY).await;
        }
    }

    async fn try_load_config(&self) -> Result<Config, DatastoreError> {
        let mut config = Config {
            hostname: self.hostname.clone(),
            ..Config::default()
        };
        let global = self.client.read(self.keys.config_dir(), true).await?;
        config.apply_raw(&node_to_map(&global.node));
        match self.client.read(self.keys.host_config_dir(), true).await {
            Ok(host) => config.apply_raw(&node_to_map(&host.node)),
            Err(DatastoreError::KeyNotFound(_)) => {
                tracing::info!("no per-host config overrides present");
            }
            Err(err) => return Err(err),
        }
        Ok(config)
    }

    /// `load_config` (`spec.md` §4.10 step 1): connect, wait for
    /// readiness, read global config overlaid by per-host config. Loops
    /// indefinitely on failure -- there is no caller to report a startup
    /// error to yet, matching the reference implementation blocking
    /// `main` until this succeeds.
    pub async fn load_config(&self) -> Config {
        loop {
            self.client.reconnect();
            self.wait_for_ready().await;
            match self.try_load_config().await {
                Ok(config) => return config,
                Err(err) => {
                    tracing::error!(%err, "failed to load config, retrying");
                    tokio::time::sleep(RETRY_DELAY).await;
                }
            }
        }
    }

    /// One full resync: reconnect, wait for readiness, read the whole
    /// version directory as a snapshot, and hand it to `sink` as one
    /// atomic `apply_snapshot` call. Returns the `waitIndex` the
    /// subsequent poll loop should start from.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot read fails outright, or if the
    /// readiness flag was no longer true by the time the snapshot
    /// finished (someone flipped it mid-read) -- both are retried by the
    /// caller after a backoff.
    pub async fn resync(&mut self, sink: &mut impl UpdateSink) -> Result<u64, DatastoreError> {
        self.client.reconnect();
        self.wait_for_ready().await;

        let snapshot = self.client.read(self.keys.root(), true).await?;
        let mut leaves = Vec::new();
        collect_leaves(&snapshot.node, &mut leaves);

        let mut rules_by_id = HashMap::new();
        let mut tags_by_id = HashMap::new();
        let mut endpoints_by_id = HashMap::new();
        let mut still_ready = false;

        for node in &leaves {
            match self.keys.classify(&node.key) {
                KeyKind::Ready => {
                    still_ready = node.value.as_deref() == Some("true");
                }
                KeyKind::ProfileRules { profile_id } => {
                    if let Some(rules) = node.value.as_deref().and_then(parse_rules) {
                        rules_by_id.insert(ProfileId::from(profile_id), rules);
                    }
                }
                KeyKind::ProfileTags { profile_id } => {
                    if let Some(tags) = node.value.as_deref().and_then(parse_tags) {
                        tags_by_id.insert(ProfileId::from(profile_id), tags);
                    }
                }
                KeyKind::Endpoint { endpoint_id } => {
                    let host = self.keys.endpoint_host(&node.key).unwrap_or_default();
                    if let Some(payload) = node.value.as_deref().and_then(|v| parse_endpoint(&self.iface_prefix, v)) {
                        endpoints_by_id.insert(EndpointId::from(endpoint_id), RawEndpoint { host, payload });
                    }
                }
                _ => {}
            }
            tokio::task::yield_now().await;
        }

        if !still_ready {
            return Err(DatastoreError::Other(
                "readiness flag no longer set by the time the snapshot finished".to_string(),
            ));
        }

        sink.apply_snapshot(rules_by_id, tags_by_id, endpoints_by_id).await;
        self.expected_cluster_id = snapshot.cluster_id;
        Ok(snapshot.etcd_index + 1)
    }

    /// One iteration of the inner poll loop (`spec.md` §4.10 step 3):
    /// long-poll for the next change at or after `wait_index`, classify
    /// it, and dispatch.
    pub async fn poll_once(&mut self, wait_index: u64, sink: &mut impl UpdateSink) -> PollOutcome {
        let resp = match self
            .client
            .wait(self.keys.root(), wait_index, WAIT_CONNECT_TIMEOUT, WAIT_READ_TIMEOUT)
            .await
        {
            Ok(resp) => resp,
            Err(DatastoreError::ReadTimeout) => {
                tracing::debug!("long-poll read timed out, reconnecting");
                self.client.reconnect();
                return PollOutcome::Continue(wait_index);
            }
            Err(DatastoreError::ConnectFailed(err)) => {
                tracing::warn!(%err, "low-level connect error, reconnecting");
                self.client.reconnect();
                return PollOutcome::Continue(wait_index);
            }
            Err(DatastoreError::EventIndexCleared) => {
                tracing::warn!("datastore event index was cleared, forcing resync");
                return PollOutcome::Resync;
            }
            Err(DatastoreError::KeyNotFound(_)) => {
                // The root directory not existing yet is routine during
                // early startup; just keep polling.
                return PollOutcome::Continue(wait_index);
            }
            Err(DatastoreError::Other(msg)) => {
                if msg.to_lowercase().contains("no more machines") {
                    tracing::error!("connection to datastore failed, will retry");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    self.client.reconnect();
                    return PollOutcome::Continue(wait_index);
                }
                tracing::error!(error = %msg, "unexpected datastore error, forcing resync");
                return PollOutcome::Resync;
            }
        };

        let next_wait_index = wait_index.max(resp.node.modified_index) + 1;

        if let (Some(expected), Some(got)) = (&self.expected_cluster_id, &resp.cluster_id) {
            if expected != got {
                tracing::warn!("datastore cluster id changed, forcing resync");
                return PollOutcome::Resync;
            }
        }

        let key = resp.node.key.clone();
        let kind = self.keys.classify(&key);

        if resp.action.is_delete() {
            if let KeyKind::ProfileDir { profile_id } = &kind {
                tracing::info!(%profile_id, "whole profile directory deleted");
                sink.on_rules_update(ProfileId::from(profile_id.clone()), None).await;
                sink.on_tags_update(ProfileId::from(profile_id.clone()), None).await;
                return PollOutcome::Continue(next_wait_index);
            }
        }

        match kind {
            KeyKind::ProfileRules { profile_id } => {
                let rules = if resp.action.is_delete() {
                    None
                } else {
                    resp.node.value.as_deref().and_then(parse_rules)
                };
                sink.on_rules_update(ProfileId::from(profile_id), rules).await;
            }
            KeyKind::ProfileTags { profile_id } => {
                let tags = if resp.action.is_delete() {
                    None
                } else {
                    resp.node.value.as_deref().and_then(parse_tags)
                };
                sink.on_tags_update(ProfileId::from(profile_id), tags).await;
            }
            KeyKind::Endpoint { endpoint_id } => {
                let host = self.keys.endpoint_host(&key).unwrap_or_default();
                let endpoint = if resp.action.is_delete() {
                    None
                } else {
                    resp.node
                        .value
                        .as_deref()
                        .and_then(|v| parse_endpoint(&self.iface_prefix, v))
                        .map(|payload| RawEndpoint { host, payload })
                };
                sink.on_endpoint_update(EndpointId::from(endpoint_id), endpoint).await;
            }
            KeyKind::Ready => {
                if resp.node.value.as_deref() != Some("true") {
                    tracing::warn!("datastore became unready, forcing resync");
                    return PollOutcome::Resync;
                }
            }
            KeyKind::ProfileDir { .. } => {
                // A non-delete event directly on the profile directory
                // (e.g. its own creation) carries nothing actionable;
                // the rules/tags sub-keys generate their own events.
            }
            KeyKind::Config | KeyKind::HostConfig => {
                tracing::warn!(%key, "config changed but dynamic reconfiguration is not supported");
            }
            KeyKind::Other => {
                if !resp.action.is_set_or_create()
                    && self.keys.resync_trigger_prefixes().iter().any(|prefix| key.starts_with(*prefix))
                {
                    tracing::warn!(%key, action = ?resp.action, "unexpected event under a resync-trigger prefix");
                    return PollOutcome::Resync;
                }
            }
        }

        PollOutcome::Continue(next_wait_index)
    }

    /// Run the watch/resync protocol forever: resync, then poll until a
    /// desync condition is observed, then resync again. Never returns.
    pub async fn run(&mut self, sink: &mut impl UpdateSink) -> ! {
        loop {
            let mut wait_index = match self.resync(sink).await {
                Ok(index) => index,
                Err(err) => {
                    tracing::error!(%err, "resync failed, retrying after backoff");
                    tokio::time::sleep(RETRY_DELAY).await;
                    continue;
                }
            };
            loop {
                match self.poll_once(wait_index, sink).await {
                    PollOutcome::Continue(next) => wait_index = next,
                    PollOutcome::Resync => break,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::fake::{self, FakeClient, Scripted};
    use crate::client::{Action, EtcdResponse};

    #[derive(Default)]
    struct Recorder {
        snapshots: usize,
        rules: Vec<(ProfileId, Option<RuleList>)>,
        tags: Vec<(ProfileId, Option<BTreeSet<Tag>>)>,
        endpoints: Vec<(EndpointId, Option<RawEndpoint>)>,
    }

    #[async_trait::async_trait]
    impl UpdateSink for Recorder {
        async fn apply_snapshot(
            &mut self,
            _rules_by_id: HashMap<ProfileId, RuleList>,
            _tags_by_id: HashMap<ProfileId, BTreeSet<Tag>>,
            _endpoints_by_id: HashMap<EndpointId, RawEndpoint>,
        ) {
            self.snapshots += 1;
        }

        async fn on_rules_update(&mut self, profile_id: ProfileId, rules: Option<RuleList>) {
            self.rules.push((profile_id, rules));
        }

        async fn on_tags_update(&mut self, profile_id: ProfileId, tags: Option<BTreeSet<Tag>>) {
            self.tags.push((profile_id, tags));
        }

        async fn on_endpoint_update(&mut self, endpoint_id: EndpointId, endpoint: Option<RawEndpoint>) {
            self.endpoints.push((endpoint_id, endpoint));
        }
    }

    fn watcher_with(client: FakeClient) -> Watcher<FakeClient> {
        let mut watcher = Watcher::new(client, "host-a");
        watcher.set_iface_prefix("cali");
        watcher
    }

    #[tokio::test]
    async fn poll_once_dispatches_endpoint_update() {
        let client = FakeClient::new();
        let key = "/calico/v1/host/host-a/workload/docker/wl1/endpoint/ep1";
        let value = serde_json::json!({
            "state": "active",
            "name": "cali1234",
            "mac": "00:01:02:03:04:05",
            "profile_id": "web",
            "ipv4_nets": ["10.0.0.1/32"],
            "ipv6_nets": [],
        })
        .to_string();
        client.push(Scripted::Wait(Ok(fake::leaf(key, &value, 5, 5))));
        let mut watcher = watcher_with(client);
        let mut sink = Recorder::default();

        let outcome = watcher.poll_once(1, &mut sink).await;
        assert_eq!(outcome, PollOutcome::Continue(6));
        assert_eq!(sink.endpoints.len(), 1);
        let (id, endpoint) = &sink.endpoints[0];
        assert_eq!(id.to_string(), "ep1");
        assert_eq!(endpoint.as_ref().unwrap().host, "host-a");
    }

    #[tokio::test]
    async fn poll_once_treats_invalid_endpoint_as_deletion() {
        let client = FakeClient::new();
        let key = "/calico/v1/host/host-a/workload/docker/wl1/endpoint/ep1";
        // Interface name doesn't start with the configured "cali" prefix.
        let value = serde_json::json!({
            "state": "active",
            "name": "eth0",
            "mac": "00:01:02:03:04:05",
            "ipv4_nets": [],
            "ipv6_nets": [],
        })
        .to_string();
        client.push(Scripted::Wait(Ok(fake::leaf(key, &value, 5, 5))));
        let mut watcher = watcher_with(client);
        let mut sink = Recorder::default();

        watcher.poll_once(1, &mut sink).await;
        assert_eq!(sink.endpoints[0].1, None);
    }

    #[tokio::test]
    async fn poll_once_on_event_index_cleared_forces_resync() {
        let client = FakeClient::new();
        client.push(Scripted::Wait(Err(DatastoreError::EventIndexCleared)));
        let mut watcher = watcher_with(client);
        let mut sink = Recorder::default();

        let outcome = watcher.poll_once(1, &mut sink).await;
        assert_eq!(outcome, PollOutcome::Resync);
    }

    #[tokio::test]
    async fn poll_once_on_read_timeout_reconnects_and_continues() {
        let client = FakeClient::new();
        client.push(Scripted::Wait(Err(DatastoreError::ReadTimeout)));
        let mut watcher = watcher_with(client);
        let mut sink = Recorder::default();

        let outcome = watcher.poll_once(7, &mut sink).await;
        assert_eq!(outcome, PollOutcome::Continue(7));
        assert_eq!(*watcher.client.reconnects.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn whole_profile_directory_delete_synthesizes_rules_and_tags_null() {
        let client = FakeClient::new();
        let resp = EtcdResponse {
            action: Action::Delete,
            node: Node {
                key: "/calico/v1/policy/profile/web".to_string(),
                value: None,
                dir: true,
                modified_index: 9,
                children: Vec::new(),
            },
            etcd_index: 9,
            cluster_id: Some("cluster-a".to_string()),
        };
        client.push(Scripted::Wait(Ok(resp)));
        let mut watcher = watcher_with(client);
        let mut sink = Recorder::default();

        watcher.poll_once(1, &mut sink).await;
        assert_eq!(sink.rules, vec![(ProfileId::from("web"), None)]);
        assert_eq!(sink.tags, vec![(ProfileId::from("web"), None)]);
    }

    #[tokio::test]
    async fn unexpected_event_under_host_dir_forces_resync() {
        let client = FakeClient::new();
        let resp = EtcdResponse {
            action: Action::Delete,
            node: Node {
                key: "/calico/v1/host/host-a/workload/docker/wl1".to_string(),
                value: None,
                dir: true,
                modified_index: 9,
                children: Vec::new(),
            },
            etcd_index: 9,
            cluster_id: Some("cluster-a".to_string()),
        };
        client.push(Scripted::Wait(Ok(resp)));
        let mut watcher = watcher_with(client);
        let mut sink = Recorder::default();

        let outcome = watcher.poll_once(1, &mut sink).await;
        assert_eq!(outcome, PollOutcome::Resync);
    }

    #[tokio::test]
    async fn ready_flag_going_false_forces_resync() {
        let client = FakeClient::new();
        client.push(Scripted::Wait(Ok(fake::leaf("/calico/v1/Ready", "false", 9, 9))));
        let mut watcher = watcher_with(client);
        let mut sink = Recorder::default();

        let outcome = watcher.poll_once(1, &mut sink).await;
        assert_eq!(outcome, PollOutcome::Resync);
    }

    #[tokio::test]
    async fn resync_reads_snapshot_and_applies_it_once() {
        let client = FakeClient::new();
        let children = vec![
            Node {
                key: "/calico/v1/Ready".to_string(),
                value: Some("true".to_string()),
                dir: false,
                modified_index: 1,
                children: Vec::new(),
            },
            Node {
                key: "/calico/v1/policy/profile/web/tags".to_string(),
                value: Some(r#"["web"]"#.to_string()),
                dir: false,
                modified_index: 2,
                children: Vec::new(),
            },
        ];
        client.push(Scripted::Read(Ok(fake::leaf("/calico/v1/Ready", "true", 1, 1))));
        client.push(Scripted::Read(Ok(fake::dir("/calico/v1", children, 10))));
        let mut watcher = watcher_with(client);
        let mut sink = Recorder::default();

        let next_index = watcher.resync(&mut sink).await.unwrap();
        assert_eq!(next_index, 11);
        assert_eq!(sink.snapshots, 1);
    }

    #[tokio::test]
    async fn resync_fails_if_ready_flag_missing_from_snapshot() {
        let client = FakeClient::new();
        client.push(Scripted::Read(Ok(fake::leaf("/calico/v1/Ready", "true", 1, 1))));
        client.push(Scripted::Read(Ok(fake::dir("/calico/v1", Vec::new(), 10))));
        let mut watcher = watcher_with(client);
        let mut sink = Recorder::default();

        assert!(watcher.resync(&mut sink).await.is_err());
        assert_eq!(sink.snapshots, 0);
    }
}
