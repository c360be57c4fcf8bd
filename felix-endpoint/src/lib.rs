// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Local endpoint actor + manager (C8/C9): per-endpoint state machine
//! that acquires its profile and programs its own chains, and the
//! top-level reference manager that creates one per local endpoint.
//!
//! Ownership across crates: a [`LocalEndpoint`] holds shared handles to
//! the same [`ChainUpdater`], [`ProfileRulesManager`] and
//! [`DispatchChains`] instances the rest of the agent uses, each behind
//! its own `tokio::sync::Mutex` so independently-scheduled endpoint
//! actors can serialize on them. Lock order is always *dispatch, then
//! updater* -- every call site that needs both acquires them in that
//! order, and no call site holds `updater` while requesting `dispatch`.

#![forbid(unsafe_code)]

pub mod chains;
pub mod interface;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::IpAddr;
use std::sync::Arc;

use felix_actor::{Actor, ActorRef};
use felix_dispatch::DispatchChains;
use felix_iptables::{ChainError, ChainUpdater, Restore};
use felix_model::{naming, EndpointId, EndpointPayload, EndpointState, IpVersion, ProfileId};
use felix_profiles::ProfileRulesManager;
use felix_refcount::ReferenceManager;
use tokio::sync::{oneshot, Mutex as AsyncMutex};

pub use interface::{InterfaceConfigurer, SystemInterfaceConfigurer};

/// Messages accepted by a [`LocalEndpoint`].
pub enum EndpointMessage {
    /// `on_endpoint_update`: `None` means the endpoint (or this agent's
    /// view of it as local) was deleted.
    EndpointUpdate(Option<EndpointPayload>),
    /// `on_interface_update`: retry interface configuration. Does not
    /// clear the readiness gate by itself.
    InterfaceKick,
    /// Sent by the owning manager once the refcount drops to zero.
    OnUnreferenced(oneshot::Sender<()>),
}

/// Observable resting state of a [`LocalEndpoint`]. *Configuring* and
/// *Removing* from `spec.md` §4.8 are not separate resting states here:
/// both run to completion inside a single `finish_batch`, so a caller
/// only ever observes the state the endpoint settles into.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum State {
    /// No endpoint data, or data present but not eligible to run
    /// (`state != active` or no profile).
    Pending,
    /// Eligible to run but the kernel interface is not yet up.
    Waiting,
    /// Chains programmed and routed.
    Ready,
    /// Unreferenced and cleaned up.
    Terminated,
}

/// Reference-counted per-endpoint actor (C8).
pub struct LocalEndpoint<R: Restore, C: InterfaceConfigurer> {
    endpoint_id: EndpointId,
    iface_prefix: String,
    updater: Arc<AsyncMutex<ChainUpdater<R>>>,
    profiles: Arc<AsyncMutex<ProfileRulesManager<R>>>,
    dispatch: Arc<AsyncMutex<DispatchChains>>,
    interface: C,
    data: Option<EndpointPayload>,
    current_profile: Option<ProfileId>,
    /// Interface name the currently-programmed chains (if any) belong
    /// to; used to tear down by the right name even after `data` has
    /// already been cleared (deletion).
    programmed_iface: Option<String>,
    programmed: bool,
    /// Set on a kernel-write failure; cleared on the next successful
    /// program. Does not by itself force a retry -- the next message
    /// (kick or update) does, via `finish_batch` always reconciling.
    failed: bool,
    state: State,
    stopped: bool,
    cleanup_acks: Vec<oneshot::Sender<()>>,
}

impl<R: Restore, C: InterfaceConfigurer> LocalEndpoint<R, C> {
    #[must_use]
    pub fn new(
        endpoint_id: EndpointId,
        iface_prefix: String,
        updater: Arc<AsyncMutex<ChainUpdater<R>>>,
        profiles: Arc<AsyncMutex<ProfileRulesManager<R>>>,
        dispatch: Arc<AsyncMutex<DispatchChains>>,
        interface: C,
    ) -> Self {
        LocalEndpoint {
            endpoint_id,
            iface_prefix,
            updater,
            profiles,
            dispatch,
            interface,
            data: None,
            current_profile: None,
            programmed_iface: None,
            programmed: false,
            failed: false,
            state: State::Pending,
            stopped: false,
            cleanup_acks: Vec::new(),
        }
    }

    /// Current resting state, for callers/tests checking convergence.
    #[must_use]
    pub fn state(&self) -> State {
        self.state
    }

    /// Whether the kernel-write latch (`spec.md` §4.8) is set.
    #[must_use]
    pub fn failed(&self) -> bool {
        self.failed
    }

    async fn release_profile(&mut self) {
        if let Some(profile_id) = self.current_profile.take() {
            self.profiles.lock().await.decref(&profile_id);
        }
    }

    async fn acquire_profile(&mut self, profile_id: &ProfileId) {
        self.profiles.lock().await.get_and_incref(profile_id);
        self.current_profile = Some(profile_id.clone());
    }

    async fn teardown_programming(&mut self) {
        let Some(iface) = self.programmed_iface.take() else {
            return;
        };
        let to_name = naming::to_chain_name(&iface, &self.iface_prefix);
        let from_name = naming::from_chain_name(&iface, &self.iface_prefix);
        for version in [IpVersion::V4, IpVersion::V6] {
            let mut dispatch = self.dispatch.lock().await;
            let mut updater = self.updater.lock().await;
            let _ = dispatch.on_endpoint_removed(&mut updater, version, &iface).await;
        }
        {
            let mut updater = self.updater.lock().await;
            for version in [IpVersion::V4, IpVersion::V6] {
                updater
                    .delete_chains(version, &[to_name.clone(), from_name.clone()])
                    .await;
            }
        }
        self.programmed = false;
    }

    /// Render and push this endpoint's "to"/"from" chains for both IP
    /// families, then route its interface through the dispatch chains.
    /// Returns [`ChainError::MissingDependency`] (treated by the caller
    /// as a transient, retryable condition) if the profile's own chains
    /// haven't been programmed by `felix-profiles` yet.
    async fn program_chains(&mut self) -> Result<(), ChainError> {
        let payload = self.data.clone().expect("only called with endpoint data present");
        let profile_id = payload
            .profile_id
            .clone()
            .expect("only called once a profile resolves");
        let to_name = naming::to_chain_name(&payload.name, &self.iface_prefix);
        let from_name = naming::from_chain_name(&payload.name, &self.iface_prefix);
        let profile_inbound = naming::profile_inbound_chain_name(&profile_id);
        let profile_outbound = naming::profile_outbound_chain_name(&profile_id);

        for version in [IpVersion::V4, IpVersion::V6] {
            let ips: Vec<IpAddr> = match version {
                IpVersion::V4 => payload.ipv4_nets.iter().map(|n| IpAddr::V4(n.addr())).collect(),
                IpVersion::V6 => payload.ipv6_nets.iter().map(|n| IpAddr::V6(n.addr())).collect(),
            };
            let to_rules = chains::to_chain_rules(version, &profile_id);
            let from_rules = chains::from_chain_rules(version, &profile_id, &payload.mac, ips.into_iter());

            let mut updater = self.updater.lock().await;
            let profile_chains_ready = updater.programmed_rules(version, &profile_inbound).is_some()
                && updater.programmed_rules(version, &profile_outbound).is_some();
            if !profile_chains_ready {
                return Err(ChainError::MissingDependency {
                    chain: to_name,
                    missing: profile_inbound,
                });
            }

            let mut updates = BTreeMap::new();
            updates.insert(to_name.clone(), to_rules);
            updates.insert(from_name.clone(), from_rules);
            let mut deps = BTreeMap::new();
            deps.insert(to_name.clone(), BTreeSet::from([profile_inbound.clone()]));
            deps.insert(from_name.clone(), BTreeSet::from([profile_outbound.clone()]));
            updater.rewrite_chains(version, updates, deps).await?;
        }

        for version in [IpVersion::V4, IpVersion::V6] {
            let mut dispatch = self.dispatch.lock().await;
            let mut updater = self.updater.lock().await;
            dispatch
                .on_endpoint_added(&mut updater, version, payload.name.clone(), self.endpoint_id.clone())
                .await?;
        }
        self.programmed_iface = Some(payload.name.clone());
        Ok(())
    }

    /// Re-derive this endpoint's state from its current data and run
    /// whatever kernel work that implies. Idempotent: calling it twice
    /// in a row with no intervening message is a no-op (P3-style).
    async fn reconcile(&mut self) -> Result<(), ChainError> {
        if self.stopped {
            self.teardown_programming().await;
            self.release_profile().await;
            self.state = State::Terminated;
            for ack in self.cleanup_acks.drain(..) {
                let _ = ack.send(());
            }
            return Ok(());
        }

        let Some(payload) = self.data.clone() else {
            if self.programmed {
                self.teardown_programming().await;
            }
            self.release_profile().await;
            self.state = State::Pending;
            return Ok(());
        };

        if payload.profile_id != self.current_profile {
            self.release_profile().await;
            if let Some(profile_id) = &payload.profile_id {
                self.acquire_profile(profile_id).await;
            }
        }

        let ready = payload.state == EndpointState::Active && payload.profile_id.is_some();
        if !ready {
            if self.programmed {
                self.teardown_programming().await;
            }
            self.state = State::Pending;
            return Ok(());
        }

        if !self.interface.configure(&payload.name, &payload).await {
            self.state = State::Waiting;
            return Ok(());
        }

        match self.program_chains().await {
            Ok(()) => {
                self.programmed = true;
                self.failed = false;
                self.state = State::Ready;
                Ok(())
            }
            Err(err) => {
                self.failed = true;
                self.teardown_programming().await;
                self.state = State::Waiting;
                Err(err)
            }
        }
    }
}

impl<R: Restore + Send + Sync + 'static, C: InterfaceConfigurer> Actor for LocalEndpoint<R, C> {
    type Message = EndpointMessage;
    type Error = ChainError;

    fn handle(&mut self, message: Self::Message) {
        if self.stopped {
            if let EndpointMessage::OnUnreferenced(ack) = message {
                self.cleanup_acks.push(ack);
            }
            return;
        }
        match message {
            EndpointMessage::EndpointUpdate(data) => self.data = data,
            EndpointMessage::InterfaceKick => {}
            EndpointMessage::OnUnreferenced(ack) => {
                self.stopped = true;
                self.cleanup_acks.push(ack);
            }
        }
    }

    async fn finish_batch(&mut self) -> Result<(), Self::Error> {
        self.reconcile().await
    }
}

/// Top-level reference manager for local endpoints (C9).
pub struct EndpointManager<R: Restore, C: InterfaceConfigurer + Clone> {
    iface_prefix: String,
    updater: Arc<AsyncMutex<ChainUpdater<R>>>,
    profiles: Arc<AsyncMutex<ProfileRulesManager<R>>>,
    dispatch: Arc<AsyncMutex<DispatchChains>>,
    interface: C,
    refs: ReferenceManager<EndpointId, EndpointMessage>,
    endpoints_by_id: HashMap<EndpointId, EndpointPayload>,
    endpoint_id_by_iface_name: HashMap<String, EndpointId>,
}

impl<R: Restore + Send + Sync + 'static, C: InterfaceConfigurer + Clone> EndpointManager<R, C> {
    #[must_use]
    pub fn new(
        iface_prefix: impl Into<String>,
        updater: Arc<AsyncMutex<ChainUpdater<R>>>,
        profiles: Arc<AsyncMutex<ProfileRulesManager<R>>>,
        dispatch: Arc<AsyncMutex<DispatchChains>>,
        interface: C,
    ) -> Self {
        EndpointManager {
            iface_prefix: iface_prefix.into(),
            updater,
            profiles,
            dispatch,
            interface,
            refs: ReferenceManager::new(),
            endpoints_by_id: HashMap::new(),
            endpoint_id_by_iface_name: HashMap::new(),
        }
    }

    /// `true` iff `endpoint_id` currently has a live local-endpoint actor.
    #[must_use]
    pub fn is_local_live(&self, endpoint_id: &EndpointId) -> bool {
        self.refs.is_starting_or_live(endpoint_id)
    }

    fn get_and_incref(&mut self, endpoint_id: &EndpointId) -> ActorRef<EndpointMessage> {
        let iface_prefix = self.iface_prefix.clone();
        let updater = self.updater.clone();
        let profiles = self.profiles.clone();
        let dispatch = self.dispatch.clone();
        let interface = self.interface.clone();
        let (actor_ref, _just_created) = self.refs.get_and_incref(endpoint_id.clone(), move |id| {
            felix_actor::spawn(LocalEndpoint::new(
                id.clone(),
                iface_prefix,
                updater,
                profiles,
                dispatch,
                interface,
            ))
        });
        actor_ref
    }

    fn decref(&mut self, endpoint_id: &EndpointId) {
        if let Some(actor_ref) = self.refs.decref(endpoint_id) {
            let endpoint_id = endpoint_id.clone();
            felix_refcount::notify_on_unreferenced(&actor_ref, EndpointMessage::OnUnreferenced, move || {
                tracing::debug!(%endpoint_id, "local endpoint finished cleanup");
            });
        }
    }

    /// `on_endpoint_update` (§4.9): maintain the id/iface indices,
    /// reference-count the child on first sight / deletion, and forward
    /// the update to a live child.
    pub fn on_endpoint_update(&mut self, endpoint_id: EndpointId, endpoint: Option<EndpointPayload>) {
        if let Some(old) = self.endpoints_by_id.get(&endpoint_id) {
            self.endpoint_id_by_iface_name.remove(&old.name);
        }
        if let Some(payload) = &endpoint {
            self.endpoint_id_by_iface_name
                .insert(payload.name.clone(), endpoint_id.clone());
        }

        let was_live = self.refs.is_starting_or_live(&endpoint_id);
        match (&endpoint, was_live) {
            (Some(_), false) => {
                let actor_ref = self.get_and_incref(&endpoint_id);
                actor_ref.post(EndpointMessage::EndpointUpdate(endpoint.clone()));
            }
            (Some(_), true) => {
                if let Some(actor_ref) = self.refs.get(&endpoint_id) {
                    actor_ref.post(EndpointMessage::EndpointUpdate(endpoint.clone()));
                }
            }
            (None, true) => {
                if let Some(actor_ref) = self.refs.get(&endpoint_id) {
                    actor_ref.post(EndpointMessage::EndpointUpdate(None));
                }
                self.decref(&endpoint_id);
            }
            (None, false) => {}
        }

        match endpoint {
            Some(payload) => {
                self.endpoints_by_id.insert(endpoint_id, payload);
            }
            None => {
                self.endpoints_by_id.remove(&endpoint_id);
            }
        }
    }

    /// `on_interface_update` (§4.9): kick the child routed to `iface`,
    /// if any. Unknown interface names are ignored.
    pub fn on_interface_update(&mut self, iface: &str) {
        let Some(endpoint_id) = self.endpoint_id_by_iface_name.get(iface) else {
            return;
        };
        if let Some(actor_ref) = self.refs.get(endpoint_id) {
            actor_ref.post(EndpointMessage::InterfaceKick);
        }
    }

    /// `apply_snapshot` (§4.9): push the whole iface→endpoint-ID map to
    /// the dispatch chains as one rewrite before touching any individual
    /// endpoint, so the dispatch chains never observe an intermediate
    /// mix of old and new routes (`spec.md` §5 ordering requirement).
    pub async fn apply_snapshot(&mut self, endpoints_by_id: HashMap<EndpointId, EndpointPayload>) {
        let iface_map: BTreeMap<String, EndpointId> = endpoints_by_id
            .iter()
            .map(|(id, payload)| (payload.name.clone(), id.clone()))
            .collect();
        {
            let mut dispatch = self.dispatch.lock().await;
            let mut updater = self.updater.lock().await;
            for version in [IpVersion::V4, IpVersion::V6] {
                if let Err(err) = dispatch.apply_snapshot(&mut updater, version, iface_map.clone()).await {
                    tracing::warn!(%err, "dispatch snapshot application failed");
                }
            }
        }

        let stale: Vec<EndpointId> = self
            .endpoints_by_id
            .keys()
            .filter(|id| !endpoints_by_id.contains_key(*id))
            .cloned()
            .collect();

        for (endpoint_id, payload) in endpoints_by_id {
            self.on_endpoint_update(endpoint_id, Some(payload));
            tokio::task::yield_now().await;
        }
        for endpoint_id in stale {
            self.on_endpoint_update(endpoint_id, None);
            tokio::task::yield_now().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex as StdMutex;

    use felix_model::EndpointState;
    use ipnet::Ipv4Net;
    use mac_address::MacAddress;

    #[derive(Clone, Default)]
    struct FakeRestore {
        scripts: Arc<StdMutex<Vec<String>>>,
    }

    #[async_trait::async_trait]
    impl Restore for FakeRestore {
        async fn restore(&self, _ip_version: IpVersion, script: &str) -> Result<(), ChainError> {
            self.scripts.lock().unwrap().push(script.to_string());
            Ok(())
        }
    }

    #[derive(Clone, Default)]
    struct FakeInterface {
        up: Arc<AtomicBool>,
    }

    #[async_trait::async_trait]
    impl InterfaceConfigurer for FakeInterface {
        async fn configure(&self, _iface: &str, _endpoint: &EndpointPayload) -> bool {
            self.up.load(Ordering::SeqCst)
        }
    }

    async fn settle() {
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
    }

    fn sample_endpoint(profile: &str) -> EndpointPayload {
        EndpointPayload {
            state: EndpointState::Active,
            name: "caliabcd".to_string(),
            mac: MacAddress::new([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]),
            profile_id: Some(ProfileId::from(profile)),
            ipv4_nets: vec!["10.0.0.1/32".parse::<Ipv4Net>().unwrap()],
            ipv6_nets: vec![],
            ipv4_gateway: None,
            ipv6_gateway: None,
        }
    }

    struct Fixture {
        updater: Arc<AsyncMutex<ChainUpdater<FakeRestore>>>,
        profiles: Arc<AsyncMutex<ProfileRulesManager<FakeRestore>>>,
        dispatch: Arc<AsyncMutex<DispatchChains>>,
        interface: FakeInterface,
    }

    impl Fixture {
        fn new() -> Self {
            let restore = FakeRestore::default();
            let updater = Arc::new(AsyncMutex::new(ChainUpdater::new(restore)));
            Fixture {
                profiles: Arc::new(AsyncMutex::new(ProfileRulesManager::new(updater.clone()))),
                dispatch: Arc::new(AsyncMutex::new(DispatchChains::new("cali"))),
                interface: FakeInterface::default(),
                updater,
            }
        }

        fn manager(&self) -> EndpointManager<FakeRestore, FakeInterface> {
            EndpointManager::new(
                "cali",
                self.updater.clone(),
                self.profiles.clone(),
                self.dispatch.clone(),
                self.interface.clone(),
            )
        }

        async fn seed_profile(&self, profile: &str) {
            self.profiles
                .lock()
                .await
                .on_rules_update(ProfileId::from(profile), Some(felix_model::RuleList::default()));
        }
    }

    #[tokio::test]
    async fn ready_endpoint_programs_chains_and_routes_dispatch() {
        let fx = Fixture::new();
        fx.seed_profile("web").await;
        fx.interface.up.store(true, Ordering::SeqCst);
        let mut mgr = fx.manager();

        mgr.on_endpoint_update(EndpointId::from("e1"), Some(sample_endpoint("web")));
        settle().await;

        let updater = fx.updater.lock().await;
        let to_name = naming::to_chain_name("caliabcd", "cali");
        assert!(updater.programmed_rules(IpVersion::V4, &to_name).is_some());
        let dispatch_to = updater
            .programmed_rules(IpVersion::V4, naming::dispatch_chain_name(true))
            .unwrap();
        assert!(dispatch_to.iter().any(|r| r.contains("caliabcd")));
    }

    #[tokio::test]
    async fn interface_down_waits_then_kick_retries() {
        let fx = Fixture::new();
        fx.seed_profile("web").await;
        let mut mgr = fx.manager();

        mgr.on_endpoint_update(EndpointId::from("e1"), Some(sample_endpoint("web")));
        settle().await;

        {
            let updater = fx.updater.lock().await;
            let to_name = naming::to_chain_name("caliabcd", "cali");
            assert!(updater.programmed_rules(IpVersion::V4, &to_name).is_none());
        }

        fx.interface.up.store(true, Ordering::SeqCst);
        mgr.on_interface_update("caliabcd");
        settle().await;

        let updater = fx.updater.lock().await;
        let to_name = naming::to_chain_name("caliabcd", "cali");
        assert!(updater.programmed_rules(IpVersion::V4, &to_name).is_some());
    }

    #[tokio::test]
    async fn profile_swap_increfs_new_and_decrefs_old() {
        let fx = Fixture::new();
        fx.seed_profile("web").await;
        fx.seed_profile("db").await;
        fx.interface.up.store(true, Ordering::SeqCst);
        let mut mgr = fx.manager();

        mgr.on_endpoint_update(EndpointId::from("e1"), Some(sample_endpoint("web")));
        settle().await;
        assert!(fx.profiles.lock().await.is_profile_live(&ProfileId::from("web")));

        mgr.on_endpoint_update(EndpointId::from("e1"), Some(sample_endpoint("db")));
        settle().await;

        assert!(!fx.profiles.lock().await.is_profile_live(&ProfileId::from("web")));
        assert!(fx.profiles.lock().await.is_profile_live(&ProfileId::from("db")));
    }

    #[tokio::test]
    async fn deletion_tears_down_chains_and_releases_profile() {
        let fx = Fixture::new();
        fx.seed_profile("web").await;
        fx.interface.up.store(true, Ordering::SeqCst);
        let mut mgr = fx.manager();

        mgr.on_endpoint_update(EndpointId::from("e1"), Some(sample_endpoint("web")));
        settle().await;

        mgr.on_endpoint_update(EndpointId::from("e1"), None);
        settle().await;

        assert!(!fx.profiles.lock().await.is_profile_live(&ProfileId::from("web")));
        let updater = fx.updater.lock().await;
        let to_name = naming::to_chain_name("caliabcd", "cali");
        assert!(updater.programmed_rules(IpVersion::V4, &to_name).is_none());
        assert!(!mgr.is_local_live(&EndpointId::from("e1")));
    }
}
