// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Profile rules actor + manager (C7): reference-counted per
//! `profile_id`, translating a profile's rule list into its inbound and
//! outbound kernel chains.
//!
//! A profile's chains exist once per IP family but share the same name
//! across families (the `(IpVersion, name)` pair in [`ChainUpdater`]
//! disambiguates them), so every rewrite here is actually two
//! independent `iptables-restore`/`ip6tables-restore` transactions, one
//! per family.

#![forbid(unsafe_code)]

pub mod render;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use felix_actor::{Actor, ActorRef};
use felix_iptables::{ChainError, ChainUpdater, Restore};
use felix_model::{naming, IpVersion, ProfileId, Rule, RuleList};
use felix_refcount::ReferenceManager;
use tokio::sync::{oneshot, Mutex as AsyncMutex};

/// Messages accepted by a [`ProfileRulesActor`].
pub enum ProfileMessage {
    /// `on_rules_update(profile_id, rules)`: `None` means the rule list
    /// was deleted, which renders as an empty (default-deny) chain
    /// rather than deleting the chain outright -- the chain name is
    /// still a valid `--goto` target for every endpoint referencing this
    /// profile.
    RulesUpdate(Option<RuleList>),
    /// Sent by the owning manager once the refcount drops to zero.
    OnUnreferenced(oneshot::Sender<()>),
}

fn render_chain(rules: &[Rule], version: IpVersion) -> Vec<String> {
    let mut lines: Vec<String> = rules.iter().filter_map(|r| render::render_rule(r, version)).collect();
    // No rule matched (or the rule list is empty/deleted): default-deny,
    // matching the trailing DROP convention of the endpoint chains this
    // profile chain is `--goto`'d from.
    lines.push("-j DROP".to_string());
    lines
}

/// Owns exactly one profile's inbound/outbound chains, across both IP
/// families.
pub struct ProfileRulesActor<R: Restore> {
    profile_id: ProfileId,
    updater: Arc<AsyncMutex<ChainUpdater<R>>>,
    rules: Option<RuleList>,
    stopped: bool,
    cleanup_acks: Vec<oneshot::Sender<()>>,
}

impl<R: Restore> ProfileRulesActor<R> {
    #[must_use]
    pub fn new(profile_id: ProfileId, updater: Arc<AsyncMutex<ChainUpdater<R>>>) -> Self {
        ProfileRulesActor {
            profile_id,
            updater,
            rules: None,
            stopped: false,
            cleanup_acks: Vec::new(),
        }
    }

    fn chain_names(&self) -> (String, String) {
        (
            naming::profile_inbound_chain_name(&self.profile_id),
            naming::profile_outbound_chain_name(&self.profile_id),
        )
    }
}

impl<R: Restore + Send + Sync + 'static> Actor for ProfileRulesActor<R> {
    type Message = ProfileMessage;
    type Error = ChainError;

    fn handle(&mut self, message: Self::Message) {
        if self.stopped {
            if let ProfileMessage::OnUnreferenced(ack) = message {
                self.cleanup_acks.push(ack);
            }
            return;
        }
        match message {
            ProfileMessage::RulesUpdate(rules) => self.rules = rules,
            ProfileMessage::OnUnreferenced(ack) => {
                self.stopped = true;
                self.cleanup_acks.push(ack);
            }
        }
    }

    async fn finish_batch(&mut self) -> Result<(), Self::Error> {
        let (inbound_name, outbound_name) = self.chain_names();
        let mut updater = self.updater.lock().await;

        if self.stopped {
            for version in [IpVersion::V4, IpVersion::V6] {
                updater
                    .delete_chains(version, &[inbound_name.clone(), outbound_name.clone()])
                    .await;
            }
            for ack in self.cleanup_acks.drain(..) {
                let _ = ack.send(());
            }
            return Ok(());
        }

        let rules = self.rules.clone().unwrap_or_default();
        for version in [IpVersion::V4, IpVersion::V6] {
            let inbound_rules = render_chain(&rules.inbound_rules, version);
            let outbound_rules = render_chain(&rules.outbound_rules, version);

            let unchanged = updater.programmed_rules(version, &inbound_name) == Some(inbound_rules.as_slice())
                && updater.programmed_rules(version, &outbound_name) == Some(outbound_rules.as_slice());
            if unchanged {
                continue;
            }

            let mut updates = BTreeMap::new();
            updates.insert(inbound_name.clone(), inbound_rules);
            updates.insert(outbound_name.clone(), outbound_rules);
            updater.rewrite_chains(version, updates, BTreeMap::new()).await?;
        }
        Ok(())
    }
}

/// Reference-counted factory of [`ProfileRulesActor`]s, keyed by
/// `profile_id`.
pub struct ProfileRulesManager<R: Restore> {
    updater: Arc<AsyncMutex<ChainUpdater<R>>>,
    refs: ReferenceManager<ProfileId, ProfileMessage>,
    /// Every rules update seen so far, live consumer or not. Seeds a
    /// freshly-created actor (including one restarting after a previous
    /// instance finished stopping) with the latest known rules, and
    /// covers the case a rules update arrives before any consumer has
    /// increffed the profile (`spec.md` §4.7).
    pending_rules: HashMap<ProfileId, Option<RuleList>>,
}

impl<R: Restore + Send + Sync + 'static> ProfileRulesManager<R> {
    #[must_use]
    pub fn new(updater: Arc<AsyncMutex<ChainUpdater<R>>>) -> Self {
        ProfileRulesManager {
            updater,
            refs: ReferenceManager::new(),
            pending_rules: HashMap::new(),
        }
    }

    /// `true` iff `profile_id` currently has a live backing actor.
    #[must_use]
    pub fn is_profile_live(&self, profile_id: &ProfileId) -> bool {
        self.refs.is_starting_or_live(profile_id)
    }

    /// Reference (creating if necessary) the rules actor for
    /// `profile_id`.
    pub fn get_and_incref(&mut self, profile_id: &ProfileId) -> ActorRef<ProfileMessage> {
        let updater = self.updater.clone();
        let seed = self.pending_rules.get(profile_id).cloned();
        let (actor_ref, just_created) = self.refs.get_and_incref(profile_id.clone(), |id| {
            felix_actor::spawn(ProfileRulesActor::new(id.clone(), updater))
        });
        if just_created {
            if let Some(rules) = seed {
                actor_ref.post(ProfileMessage::RulesUpdate(rules));
            }
        }
        actor_ref
    }

    /// Drop a reference to `profile_id`'s rules actor.
    pub fn decref(&mut self, profile_id: &ProfileId) {
        if let Some(actor_ref) = self.refs.decref(profile_id) {
            let profile_id = profile_id.clone();
            felix_refcount::notify_on_unreferenced(&actor_ref, ProfileMessage::OnUnreferenced, move || {
                tracing::debug!(%profile_id, "profile rules actor finished cleanup");
            });
        }
    }

    /// `on_rules_update` (§4.7): cache the update and forward it to the
    /// live actor, if any.
    pub fn on_rules_update(&mut self, profile_id: ProfileId, rules: Option<RuleList>) {
        self.pending_rules.insert(profile_id.clone(), rules.clone());
        if let Some(actor_ref) = self.refs.get(&profile_id) {
            actor_ref.post(ProfileMessage::RulesUpdate(rules));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use felix_model::{Action, Protocol};
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct FakeRestore {
        scripts: Arc<Mutex<Vec<(IpVersion, String)>>>,
    }

    #[async_trait::async_trait]
    impl Restore for FakeRestore {
        async fn restore(&self, ip_version: IpVersion, script: &str) -> Result<(), ChainError> {
            self.scripts.lock().unwrap().push((ip_version, script.to_string()));
            Ok(())
        }
    }

    async fn settle() {
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
    }

    fn allow_tcp_80() -> RuleList {
        RuleList {
            inbound_rules: vec![Rule {
                protocol: Some(Protocol::Tcp),
                dst_ports: Some(vec![felix_model::PortSpec::Port(80)]),
                action: Some(Action::Allow),
                ..Default::default()
            }],
            outbound_rules: vec![],
        }
    }

    #[tokio::test]
    async fn rules_update_before_incref_is_cached_and_applied_on_start() {
        let restore = FakeRestore::default();
        let updater = Arc::new(AsyncMutex::new(ChainUpdater::new(restore.clone())));
        let mut mgr = ProfileRulesManager::new(updater.clone());

        mgr.on_rules_update(ProfileId::from("web"), Some(allow_tcp_80()));
        let _actor_ref = mgr.get_and_incref(&ProfileId::from("web"));
        settle().await;

        let updater = updater.lock().await;
        let inbound = naming::profile_inbound_chain_name("web");
        let rules = updater.programmed_rules(IpVersion::V4, &inbound).unwrap();
        assert!(rules.iter().any(|r| r.contains("--dports 80")));
    }

    #[tokio::test]
    async fn decref_to_zero_deletes_chains() {
        let restore = FakeRestore::default();
        let updater = Arc::new(AsyncMutex::new(ChainUpdater::new(restore.clone())));
        let mut mgr = ProfileRulesManager::new(updater.clone());

        mgr.on_rules_update(ProfileId::from("web"), Some(allow_tcp_80()));
        mgr.get_and_incref(&ProfileId::from("web"));
        settle().await;

        mgr.decref(&ProfileId::from("web"));
        settle().await;

        let updater = updater.lock().await;
        let inbound = naming::profile_inbound_chain_name("web");
        assert!(updater.programmed_rules(IpVersion::V4, &inbound).is_none());
    }

    #[tokio::test]
    async fn unchanged_rules_do_not_reissue_restore() {
        let restore = FakeRestore::default();
        let scripts = restore.scripts.clone();
        let updater = Arc::new(AsyncMutex::new(ChainUpdater::new(restore)));
        let mut mgr = ProfileRulesManager::new(updater.clone());

        mgr.on_rules_update(ProfileId::from("web"), Some(allow_tcp_80()));
        let actor_ref = mgr.get_and_incref(&ProfileId::from("web"));
        settle().await;
        let calls_after_first = scripts.lock().unwrap().len();

        actor_ref.post(ProfileMessage::RulesUpdate(Some(allow_tcp_80())));
        settle().await;
        assert_eq!(scripts.lock().unwrap().len(), calls_after_first);
    }

    #[tokio::test]
    async fn rule_with_no_match_criteria_defaults_to_deny_at_chain_end() {
        let restore = FakeRestore::default();
        let updater = Arc::new(AsyncMutex::new(ChainUpdater::new(restore)));
        let mut mgr = ProfileRulesManager::new(updater.clone());

        mgr.on_rules_update(ProfileId::from("empty"), Some(RuleList::default()));
        mgr.get_and_incref(&ProfileId::from("empty"));
        settle().await;

        let updater = updater.lock().await;
        let inbound = naming::profile_inbound_chain_name("empty");
        let rules = updater.programmed_rules(IpVersion::V4, &inbound).unwrap();
        assert_eq!(rules, ["-j DROP"]);
    }
}
