// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Thin entry point: load configuration, wire the per-IP-family
//! reconciliation stacks together, and drive the datastore watcher.
//! Everything interesting lives in the `felix-*` library crates; this
//! binary only assembles them.

#![forbid(unsafe_code)]

use std::collections::{BTreeSet, HashMap};
use std::net::IpAddr;
use std::sync::Arc;

use color_eyre::eyre;
use felix_config::Config;
use felix_datastore::{EtcdV2Client, PollOutcome, RawEndpoint, UpdateSink, Watcher, RETRY_DELAY};
use felix_dispatch::DispatchChains;
use felix_endpoint::{EndpointManager, SystemInterfaceConfigurer};
use felix_iptables::{ChainUpdater, SystemRestore};
use felix_ipset::{IpsetManager, SystemIpsetTool};
use felix_model::{EndpointId, EndpointPayload, IpVersion, ProfileId, RuleList, Tag};
use felix_profiles::ProfileRulesManager;
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Error)]
enum FelixError {
    #[error("failed to install SIGINT/SIGTERM handler: {0}")]
    SignalHandler(#[from] ctrlc::Error),
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();
}

async fn resolve_hostname() -> String {
    if let Ok(hostname) = std::env::var("HOSTNAME") {
        if !hostname.is_empty() {
            return hostname;
        }
    }
    match tokio::process::Command::new("hostname").output().await {
        Ok(output) if output.status.success() => String::from_utf8_lossy(&output.stdout).trim().to_string(),
        _ => {
            tracing::warn!("could not determine hostname, falling back to \"localhost\"");
            "localhost".to_string()
        }
    }
}

/// One IP family's complete reconciliation stack: its own packet-filter
/// chain updater (chains are per-family even when the rules that
/// produce them are shared), profile rules manager, dispatch chains,
/// endpoint manager, and ipset manager.
struct Family {
    version: IpVersion,
    profiles: Arc<AsyncMutex<ProfileRulesManager<SystemRestore>>>,
    endpoints: EndpointManager<SystemRestore, SystemInterfaceConfigurer>,
    ipsets: AsyncMutex<IpsetManager<SystemIpsetTool>>,
}

impl Family {
    fn new(version: IpVersion, iface_prefix: &str) -> Self {
        let updater = Arc::new(AsyncMutex::new(ChainUpdater::new(SystemRestore)));
        let profiles = Arc::new(AsyncMutex::new(ProfileRulesManager::new(updater.clone())));
        let dispatch = Arc::new(AsyncMutex::new(DispatchChains::new(iface_prefix)));
        let endpoints = EndpointManager::new(
            iface_prefix,
            updater,
            profiles.clone(),
            dispatch,
            SystemInterfaceConfigurer,
        );
        Family {
            version,
            profiles,
            endpoints,
            ipsets: AsyncMutex::new(IpsetManager::new(version, SystemIpsetTool)),
        }
    }

    /// Destroy any kernel ipset left over from a previous run (or a crash
    /// mid-cleanup) that no actor currently owns. Must run after the
    /// first snapshot has been applied -- otherwise every tag this agent
    /// is about to need would look unowned and get swept too.
    async fn cleanup(&self) {
        if let Err(err) = self.ipsets.lock().await.cleanup().await {
            tracing::warn!(version = ?self.version, %err, "ipset cleanup sweep failed, will retry on next restart");
        }
    }

    fn ips(&self, payload: &EndpointPayload) -> BTreeSet<IpAddr> {
        match self.version {
            IpVersion::V4 => payload.ipv4_nets.iter().map(|n| IpAddr::V4(n.addr())).collect(),
            IpVersion::V6 => payload.ipv6_nets.iter().map(|n| IpAddr::V6(n.addr())).collect(),
        }
    }
}

/// The "update splitter": fans out every datastore change to both IP
/// families, filtering endpoint payloads down to this host's local
/// endpoints before they reach `felix-endpoint`, while the cluster-wide
/// view (every endpoint, not just local ones) still reaches
/// `felix-ipset` so tag membership stays correct for remote peers too.
struct UpdateSplitter {
    hostname: String,
    v4: Family,
    v6: Family,
    /// Profiles `felix-profiles` currently believes have a rule list, so
    /// a resync that drops a profile entirely can be told to null it out
    /// -- `ProfileRulesManager` has no snapshot concept of its own, only
    /// incremental updates.
    known_rule_profiles: BTreeSet<ProfileId>,
}

impl UpdateSplitter {
    fn new(hostname: String, iface_prefix: &str) -> Self {
        UpdateSplitter {
            v4: Family::new(IpVersion::V4, iface_prefix),
            v6: Family::new(IpVersion::V6, iface_prefix),
            hostname,
            known_rule_profiles: BTreeSet::new(),
        }
    }

    async fn cleanup(&self) {
        self.v4.cleanup().await;
        self.v6.cleanup().await;
    }

    async fn push_rules(&mut self, profile_id: ProfileId, rules: Option<RuleList>) {
        self.v4.profiles.lock().await.on_rules_update(profile_id.clone(), rules.clone());
        self.v6.profiles.lock().await.on_rules_update(profile_id, rules);
    }

    fn endpoint_summary(&self, payload: &EndpointPayload, version: IpVersion) -> Option<(ProfileId, BTreeSet<IpAddr>)> {
        let profile_id = payload.profile_id.clone()?;
        let family = match version {
            IpVersion::V4 => &self.v4,
            IpVersion::V6 => &self.v6,
        };
        Some((profile_id, family.ips(payload)))
    }
}

#[async_trait::async_trait]
impl UpdateSink for UpdateSplitter {
    async fn apply_snapshot(
        &mut self,
        rules_by_id: HashMap<ProfileId, RuleList>,
        tags_by_id: HashMap<ProfileId, BTreeSet<Tag>>,
        endpoints_by_id: HashMap<EndpointId, RawEndpoint>,
    ) {
        let stale_rule_profiles: Vec<ProfileId> = self
            .known_rule_profiles
            .iter()
            .filter(|p| !rules_by_id.contains_key(*p))
            .cloned()
            .collect();
        for profile_id in stale_rule_profiles {
            self.push_rules(profile_id, None).await;
        }
        for (profile_id, rules) in &rules_by_id {
            self.push_rules(profile_id.clone(), Some(rules.clone())).await;
        }
        self.known_rule_profiles = rules_by_id.keys().cloned().collect();

        let mut local_endpoints = HashMap::new();
        let mut v4_summaries = HashMap::new();
        let mut v6_summaries = HashMap::new();
        for (endpoint_id, raw) in &endpoints_by_id {
            if raw.host == self.hostname {
                local_endpoints.insert(endpoint_id.clone(), raw.payload.clone());
            }
            if let Some(summary) = self.endpoint_summary(&raw.payload, IpVersion::V4) {
                v4_summaries.insert(endpoint_id.clone(), summary);
            }
            if let Some(summary) = self.endpoint_summary(&raw.payload, IpVersion::V6) {
                v6_summaries.insert(endpoint_id.clone(), summary);
            }
        }

        self.v4.endpoints.apply_snapshot(local_endpoints.clone()).await;
        self.v6.endpoints.apply_snapshot(local_endpoints).await;
        self.v4.ipsets.lock().await.apply_snapshot(tags_by_id.clone(), v4_summaries).await;
        self.v6.ipsets.lock().await.apply_snapshot(tags_by_id, v6_summaries).await;
    }

    async fn on_rules_update(&mut self, profile_id: ProfileId, rules: Option<RuleList>) {
        match &rules {
            Some(_) => {
                self.known_rule_profiles.insert(profile_id.clone());
            }
            None => {
                self.known_rule_profiles.remove(&profile_id);
            }
        }
        self.push_rules(profile_id, rules).await;
    }

    async fn on_tags_update(&mut self, profile_id: ProfileId, tags: Option<BTreeSet<Tag>>) {
        self.v4.ipsets.lock().await.on_tags_update(profile_id.clone(), tags.clone());
        self.v6.ipsets.lock().await.on_tags_update(profile_id, tags);
    }

    async fn on_endpoint_update(&mut self, endpoint_id: EndpointId, endpoint: Option<RawEndpoint>) {
        let v4_summary = endpoint
            .as_ref()
            .and_then(|raw| self.endpoint_summary(&raw.payload, IpVersion::V4));
        let v6_summary = endpoint
            .as_ref()
            .and_then(|raw| self.endpoint_summary(&raw.payload, IpVersion::V6));
        self.v4.ipsets.lock().await.on_endpoint_update(endpoint_id.clone(), v4_summary);
        self.v6.ipsets.lock().await.on_endpoint_update(endpoint_id.clone(), v6_summary);

        // A deletion carries no host, so it's always forwarded: an
        // endpoint manager that never heard of this id treats it as a
        // no-op, and one that did needs the teardown regardless.
        let is_local = endpoint.as_ref().map_or(true, |raw| raw.host == self.hostname);
        if is_local {
            let payload = endpoint.map(|raw| raw.payload);
            self.v4.endpoints.on_endpoint_update(endpoint_id.clone(), payload.clone());
            self.v6.endpoints.on_endpoint_update(endpoint_id, payload);
        }
    }
}

/// Run the watch/resync protocol, but unlike [`Watcher::run`], pause
/// once after the very first resync to let the caller sweep stale
/// kernel state -- by then every start-of-day actor the snapshot
/// implies has been created, so "unowned" really means "leftover from a
/// previous run" (`spec.md` §5's ordering requirement).
async fn run_with_startup_cleanup(
    watcher: &mut Watcher<EtcdV2Client>,
    sink: &mut UpdateSplitter,
) -> ! {
    let mut wait_index = loop {
        match watcher.resync(sink).await {
            Ok(index) => break index,
            Err(err) => {
                tracing::error!(%err, "initial resync failed, retrying");
                tokio::time::sleep(RETRY_DELAY).await;
            }
        }
    };

    sink.cleanup().await;

    loop {
        match watcher.poll_once(wait_index, sink).await {
            PollOutcome::Continue(next) => wait_index = next,
            PollOutcome::Resync => {
                wait_index = loop {
                    match watcher.resync(sink).await {
                        Ok(index) => break index,
                        Err(err) => {
                            tracing::error!(%err, "resync failed, retrying");
                            tokio::time::sleep(RETRY_DELAY).await;
                        }
                    }
                };
            }
        }
    }
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    color_eyre::install()?;
    init_logging();

    let hostname = resolve_hostname().await;
    let bootstrap_client = EtcdV2Client::new(&format!("127.0.0.1:{}", felix_config::DEFAULT_ETCD_PORT));
    let bootstrap_watcher = Watcher::new(bootstrap_client, hostname.clone());
    let config: Config = bootstrap_watcher.load_config().await;
    tracing::info!(
        hostname = %config.hostname,
        etcd_addr = %config.etcd_addr,
        iface_prefix = %config.iface_prefix,
        "loaded configuration"
    );

    let client = EtcdV2Client::new(&config.etcd_addr);
    let mut watcher = Watcher::new(client, config.hostname.clone());
    watcher.set_iface_prefix(config.iface_prefix.clone());

    let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();
    ctrlc::set_handler(move || {
        let _ = stop_tx.send(());
    })
    .map_err(FelixError::SignalHandler)?;

    let mut sink = UpdateSplitter::new(config.hostname.clone(), &config.iface_prefix);

    tokio::select! {
        () = run_with_startup_cleanup(&mut watcher, &mut sink) => {
            unreachable!("the watch loop never returns");
        }
        result = tokio::task::spawn_blocking(move || stop_rx.recv()) => {
            let _ = result;
            tracing::info!("received shutdown signal, exiting");
        }
    }

    Ok(())
}
