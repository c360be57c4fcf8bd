// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! `IpsetManager` (C5): the reference-counted factory of [`ActiveIpset`]
//! actors, keyed by tag, and the cross-index between endpoints, the
//! profiles they use, and the tags those profiles carry.
//!
//! This is plain (non-actor) state: the binary wraps one `IpsetManager`
//! per IP family behind its own `felix-actor` mailbox so that calls into
//! it are still serialized, but the manager itself only needs `&mut
//! self` methods — spawning and reference-counting the per-tag actors is
//! its entire job.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::net::IpAddr;

use felix_model::{EndpointId, ProfileId, Tag};
use felix_refcount::ReferenceManager;

use crate::{ActiveIpset, IpsetError, IpsetMessage, IpsetTool};
use felix_model::IpVersion;

/// What the manager needs to know about one endpoint: the profile it
/// currently resolves to (if any) and the IPs it contributes to that
/// profile's tags, for this IP family.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct EndpointSummary {
    pub profile_id: Option<ProfileId>,
    pub ips: BTreeSet<IpAddr>,
}

/// Factory and index-keeper for per-tag IP sets, per `spec.md` §4.5.
pub struct IpsetManager<T: IpsetTool + Clone> {
    version: IpVersion,
    tool: T,
    refs: ReferenceManager<Tag, IpsetMessage>,
    endpoints_by_id: HashMap<EndpointId, EndpointSummary>,
    tags_by_profile_id: HashMap<ProfileId, BTreeSet<Tag>>,
    endpoint_ids_by_profile_id: HashMap<ProfileId, BTreeSet<EndpointId>>,
    endpoint_ids_by_tag: HashMap<Tag, BTreeSet<EndpointId>>,
}

impl<T: IpsetTool + Clone> IpsetManager<T> {
    #[must_use]
    pub fn new(version: IpVersion, tool: T) -> Self {
        IpsetManager {
            version,
            tool,
            refs: ReferenceManager::new(),
            endpoints_by_id: HashMap::new(),
            tags_by_profile_id: HashMap::new(),
            endpoint_ids_by_profile_id: HashMap::new(),
            endpoint_ids_by_tag: HashMap::new(),
        }
    }

    /// Whether a tag currently has a live backing actor. Exposed so a
    /// caller (the dispatch/profile layer, or tests) can check invariant
    /// I1 without reaching into private state.
    #[must_use]
    pub fn is_tag_live(&self, tag: &Tag) -> bool {
        self.refs.is_starting_or_live(tag)
    }

    fn members_for_tag(&self, tag: &Tag) -> BTreeSet<IpAddr> {
        let Some(endpoint_ids) = self.endpoint_ids_by_tag.get(tag) else {
            return BTreeSet::new();
        };
        endpoint_ids
            .iter()
            .filter_map(|id| self.endpoints_by_id.get(id))
            .flat_map(|summary| summary.ips.iter().copied())
            .collect()
    }

    /// Reference (creating if necessary) the IP-set actor for `tag`,
    /// seeding it with the current computed membership on first
    /// creation. This is invariant I1's sole driver: a tag's actor
    /// lives for exactly as long as at least one endpoint's
    /// `endpoint_ids_by_tag` entry names it — see
    /// [`IpsetManager::add_endpoint_to_tag`] and
    /// [`IpsetManager::remove_endpoint_from_tag`], the only callers.
    fn get_and_incref(&mut self, tag: &Tag) -> felix_actor::ActorRef<IpsetMessage> {
        let version = self.version;
        let tool = self.tool.clone();
        let initial_members = self.members_for_tag(tag);
        let (actor_ref, just_created) = self.refs.get_and_incref(tag.clone(), |id| {
            felix_actor::spawn(ActiveIpset::new(id.clone(), version, tool))
        });
        if just_created {
            actor_ref.post(IpsetMessage::ReplaceMembers(initial_members));
        }
        actor_ref
    }

    /// Drop a reference to `tag`'s IP-set actor. At refcount zero the
    /// actor is sent `OnUnreferenced` and moves to "stopping".
    fn decref(&mut self, tag: &Tag) {
        if let Some(actor_ref) = self.refs.decref(tag) {
            let tag = tag.clone();
            felix_refcount::notify_on_unreferenced(
                &actor_ref,
                IpsetMessage::OnUnreferenced,
                move || {
                    tracing::debug!(%tag, "ipset actor finished cleanup");
                },
            );
        }
    }

    /// Record that `endpoint_id` now carries `tag` and take out exactly
    /// one reference on `tag`'s actor — one incref per (endpoint, tag)
    /// pair, balanced 1:1 by [`IpsetManager::remove_endpoint_from_tag`],
    /// is what keeps the actor's refcount equal to the number of
    /// endpoints currently using the tag.
    fn add_endpoint_to_tag(&mut self, tag: &Tag, endpoint_id: &EndpointId) {
        self.endpoint_ids_by_tag
            .entry(tag.clone())
            .or_default()
            .insert(endpoint_id.clone());
        self.get_and_incref(tag);
    }

    fn remove_endpoint_from_tag(&mut self, tag: &Tag, endpoint_id: &EndpointId) {
        if let Some(set) = self.endpoint_ids_by_tag.get_mut(tag) {
            set.remove(endpoint_id);
        }
        self.decref(tag);
    }

    fn notify_add_members(&mut self, tag: &Tag, ips: impl Iterator<Item = IpAddr>) {
        if let Some(actor_ref) = self.refs.get(tag) {
            for ip in ips {
                actor_ref.post(IpsetMessage::AddMember(ip));
            }
        }
    }

    fn notify_remove_members(&mut self, tag: &Tag, ips: impl Iterator<Item = IpAddr>) {
        if let Some(actor_ref) = self.refs.get(tag) {
            for ip in ips {
                actor_ref.post(IpsetMessage::RemoveMember(ip));
            }
        }
    }

    /// `on_tags_update` (§4.5): diff the old and new tag set for
    /// `profile_id` and push membership deltas to every *live* IP-set
    /// actor affected. The indices are updated regardless of whether a
    /// tag's actor is currently live.
    pub fn on_tags_update(&mut self, profile_id: ProfileId, tags: Option<BTreeSet<Tag>>) {
        let old_tags = self.tags_by_profile_id.remove(&profile_id).unwrap_or_default();
        let new_tags = tags.clone().unwrap_or_default();
        let endpoint_ids: Vec<EndpointId> = self
            .endpoint_ids_by_profile_id
            .get(&profile_id)
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .collect();

        let removed: Vec<&Tag> = old_tags.difference(&new_tags).collect();
        let added: Vec<&Tag> = new_tags.difference(&old_tags).collect();

        for tag in removed {
            for endpoint_id in &endpoint_ids {
                self.remove_endpoint_from_tag(tag, endpoint_id);
            }
            let ips: Vec<IpAddr> = endpoint_ids
                .iter()
                .filter_map(|id| self.endpoints_by_id.get(id))
                .flat_map(|s| s.ips.iter().copied())
                .collect();
            self.notify_remove_members(tag, ips.into_iter());
        }
        for tag in added {
            for endpoint_id in &endpoint_ids {
                self.add_endpoint_to_tag(tag, endpoint_id);
            }
            let ips: Vec<IpAddr> = endpoint_ids
                .iter()
                .filter_map(|id| self.endpoints_by_id.get(id))
                .flat_map(|s| s.ips.iter().copied())
                .collect();
            self.notify_add_members(tag, ips.into_iter());
        }

        if tags.is_some() {
            self.tags_by_profile_id.insert(profile_id, new_tags);
        }
    }

    /// `on_endpoint_update` (§4.5): diff `(old tags, old IPs)` against
    /// `(new tags, new IPs)` for `endpoint_id`, computing the four cases
    /// — common tags with an IP diff, removed tags, added tags, and
    /// outright deletion — and pushing deltas to every live affected
    /// IP-set actor. Indices are always updated, live or not.
    pub fn on_endpoint_update(&mut self, endpoint_id: EndpointId, endpoint: Option<(ProfileId, BTreeSet<IpAddr>)>) {
        let old_summary = self.endpoints_by_id.remove(&endpoint_id);
        let old_profile = old_summary.as_ref().and_then(|s| s.profile_id.clone());
        let old_ips = old_summary.map(|s| s.ips).unwrap_or_default();
        let old_tags = old_profile
            .as_ref()
            .and_then(|p| self.tags_by_profile_id.get(p))
            .cloned()
            .unwrap_or_default();

        if let Some(profile) = &old_profile {
            if let Some(set) = self.endpoint_ids_by_profile_id.get_mut(profile) {
                set.remove(&endpoint_id);
            }
        }

        let Some((new_profile, new_ips)) = endpoint else {
            // Deletion: remove this endpoint from every tag it used to
            // contribute to.
            for tag in &old_tags {
                self.remove_endpoint_from_tag(tag, &endpoint_id);
                self.notify_remove_members(tag, old_ips.iter().copied());
            }
            return;
        };

        let new_tags = self
            .tags_by_profile_id
            .get(&new_profile)
            .cloned()
            .unwrap_or_default();

        self.endpoint_ids_by_profile_id
            .entry(new_profile.clone())
            .or_default()
            .insert(endpoint_id.clone());

        let common: Vec<&Tag> = old_tags.intersection(&new_tags).collect();
        let removed_tags: Vec<&Tag> = old_tags.difference(&new_tags).collect();
        let added_tags: Vec<&Tag> = new_tags.difference(&old_tags).collect();

        for tag in common {
            let going: Vec<IpAddr> = old_ips.difference(&new_ips).copied().collect();
            let coming: Vec<IpAddr> = new_ips.difference(&old_ips).copied().collect();
            self.notify_remove_members(tag, going.into_iter());
            self.notify_add_members(tag, coming.into_iter());
        }
        for tag in removed_tags {
            self.remove_endpoint_from_tag(tag, &endpoint_id);
            self.notify_remove_members(tag, old_ips.iter().copied());
        }
        for tag in added_tags {
            self.add_endpoint_to_tag(tag, &endpoint_id);
            self.notify_add_members(tag, new_ips.iter().copied());
        }

        self.endpoints_by_id.insert(
            endpoint_id,
            EndpointSummary {
                profile_id: Some(new_profile),
                ips: new_ips,
            },
        );
    }

    /// `apply_snapshot` (§4.5): replace all in-memory state from a full
    /// read, processing each entry as an update and then treating
    /// anything previously known but absent from the snapshot as a
    /// deletion. Yields cooperatively between entries so a large
    /// snapshot doesn't starve other actors' mailboxes (the
    /// `_maybe_yield` behavior from `spec.md` §9).
    pub async fn apply_snapshot(
        &mut self,
        tags_by_profile_id: HashMap<ProfileId, BTreeSet<Tag>>,
        endpoints_by_id: HashMap<EndpointId, (ProfileId, BTreeSet<IpAddr>)>,
    ) {
        let stale_profiles: Vec<ProfileId> = self
            .tags_by_profile_id
            .keys()
            .filter(|p| !tags_by_profile_id.contains_key(*p))
            .cloned()
            .collect();

        for (profile_id, tags) in tags_by_profile_id {
            self.on_tags_update(profile_id, Some(tags));
            tokio::task::yield_now().await;
        }
        for profile_id in stale_profiles {
            self.on_tags_update(profile_id, None);
            tokio::task::yield_now().await;
        }

        let stale_endpoints: Vec<EndpointId> = self
            .endpoints_by_id
            .keys()
            .filter(|e| !endpoints_by_id.contains_key(*e))
            .cloned()
            .collect();

        for (endpoint_id, endpoint) in endpoints_by_id {
            self.on_endpoint_update(endpoint_id, Some(endpoint));
            tokio::task::yield_now().await;
        }
        for endpoint_id in stale_endpoints {
            self.on_endpoint_update(endpoint_id, None);
            tokio::task::yield_now().await;
        }
    }

    /// `cleanup` (§4.5): list every kernel IP set whose name begins with
    /// this agent's prefix for this IP family, subtract every name owned
    /// by a live or stopping child, and destroy what's left. Safe to run
    /// at any time; idempotent (P2).
    ///
    /// # Errors
    ///
    /// Returns an error only if listing kernel sets fails; individual
    /// destroy failures are logged and otherwise ignored (matching
    /// `ActiveIpset`'s own best-effort destroy).
    pub async fn cleanup(&self) -> Result<(), IpsetError> {
        let prefix = format!("felix-v{}-", self.version);
        let temp_prefix = format!("felix-tmp-v{}-", self.version);
        let all_names = self.tool.list_names().await?;

        let owned: HashSet<String> = self
            .refs
            .live_and_stopping_ids()
            .flat_map(|tag| {
                let (main, temp) = crate::names::owned_ipset_names(tag, self.version);
                [main, temp]
            })
            .collect();

        for name in all_names {
            let ours = name.starts_with(&prefix) || name.starts_with(&temp_prefix);
            if ours && !owned.contains(&name) {
                if let Err(err) = self.tool.destroy(&name).await {
                    tracing::warn!(%name, %err, "failed to destroy stale ipset during cleanup");
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default, Clone)]
    struct FakeTool {
        inner: std::sync::Arc<Mutex<FakeToolState>>,
    }

    #[derive(Default)]
    struct FakeToolState {
        scripts: Vec<String>,
        destroyed: Vec<String>,
        names: Vec<String>,
    }

    #[async_trait::async_trait]
    impl IpsetTool for FakeTool {
        async fn restore(&self, script: &str) -> Result<(), IpsetError> {
            self.inner.lock().unwrap().scripts.push(script.to_string());
            Ok(())
        }
        async fn destroy(&self, name: &str) -> Result<(), IpsetError> {
            self.inner.lock().unwrap().destroyed.push(name.to_string());
            Ok(())
        }
        async fn list_names(&self) -> Result<Vec<String>, IpsetError> {
            Ok(self.inner.lock().unwrap().names.clone())
        }
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    async fn settle() {
        // Give spawned actor mailboxes a chance to drain their posted
        // messages before assertions that depend on kernel-visible state.
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn endpoint_update_seeds_tag_membership() {
        let tool = FakeTool::default();
        let mut mgr = IpsetManager::new(IpVersion::V4, tool.clone());
        mgr.on_tags_update(ProfileId::from("p1"), Some(BTreeSet::from([Tag::from("web")])));
        // Giving the endpoint this profile is what brings the tag's actor
        // to life (I1) -- no separate incref call is needed.
        mgr.on_endpoint_update(
            EndpointId::from("e1"),
            Some((ProfileId::from("p1"), BTreeSet::from([ip("10.0.0.1")]))),
        );
        settle().await;
        assert!(mgr.is_tag_live(&Tag::from("web")));
        let scripts = tool.inner.lock().unwrap().scripts.clone();
        assert!(scripts.last().unwrap().contains("10.0.0.1"));
    }

    #[tokio::test]
    async fn profile_swap_drains_old_tag_and_fills_new() {
        let tool = FakeTool::default();
        let mut mgr = IpsetManager::new(IpVersion::V4, tool.clone());
        mgr.on_tags_update(ProfileId::from("web-profile"), Some(BTreeSet::from([Tag::from("web")])));
        mgr.on_tags_update(ProfileId::from("db-profile"), Some(BTreeSet::from([Tag::from("db")])));
        mgr.on_endpoint_update(
            EndpointId::from("e1"),
            Some((ProfileId::from("web-profile"), BTreeSet::from([ip("10.0.0.2")]))),
        );
        settle().await;

        mgr.on_endpoint_update(
            EndpointId::from("e1"),
            Some((ProfileId::from("db-profile"), BTreeSet::from([ip("10.0.0.2")]))),
        );
        settle().await;

        // Dropping the endpoint's last reference to "web" takes its
        // refcount to zero, so cleanup goes straight to destroying both
        // owned sets rather than one final empty-membership swap.
        assert!(!mgr.is_tag_live(&Tag::from("web")));
        let destroyed = tool.inner.lock().unwrap().destroyed.clone();
        assert!(destroyed.contains(&"felix-v4-web".to_string()));
        assert!(destroyed.contains(&"felix-tmp-v4-web".to_string()));

        let scripts = tool.inner.lock().unwrap().scripts.clone();
        let db_scripts: Vec<&String> = scripts.iter().filter(|s| s.contains("felix-v4-db")).collect();
        assert!(db_scripts.last().unwrap().contains("add felix-tmp-v4-db 10.0.0.2"));
    }

    #[tokio::test]
    async fn cleanup_destroys_unowned_prefixed_sets_only() {
        let tool = FakeTool::default();
        tool.inner.lock().unwrap().names = vec![
            "felix-v4-web".to_string(),
            "felix-v4-orphan".to_string(),
            "unrelated-set".to_string(),
        ];
        let mut mgr = IpsetManager::new(IpVersion::V4, tool.clone());
        mgr.on_tags_update(ProfileId::from("p1"), Some(BTreeSet::from([Tag::from("web")])));
        mgr.on_endpoint_update(
            EndpointId::from("e1"),
            Some((ProfileId::from("p1"), BTreeSet::from([ip("10.0.0.1")]))),
        );
        settle().await;

        mgr.cleanup().await.unwrap();
        let destroyed = tool.inner.lock().unwrap().destroyed.clone();
        assert!(destroyed.contains(&"felix-v4-orphan".to_string()));
        assert!(!destroyed.contains(&"unrelated-set".to_string()));
        assert!(!destroyed.contains(&"felix-v4-web".to_string()));
    }

    #[tokio::test]
    async fn cleanup_is_idempotent() {
        let tool = FakeTool::default();
        tool.inner.lock().unwrap().names = vec!["felix-v4-orphan".to_string()];
        let mgr = IpsetManager::new(IpVersion::V4, tool.clone());
        mgr.cleanup().await.unwrap();
        mgr.cleanup().await.unwrap();
        assert_eq!(
            tool.inner
                .lock()
                .unwrap()
                .destroyed
                .iter()
                .filter(|n| *n == "felix-v4-orphan")
                .count(),
            2
        );
    }
}
