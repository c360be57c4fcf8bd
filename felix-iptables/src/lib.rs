// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Batched, transactional updates to named packet-filter chains.
//!
//! Every chain write goes through `iptables-restore`, which accepts a
//! whole table as one transaction: either every chain in the batch is
//! rewritten, or none is. Callers (the profile-rules actor, the
//! per-endpoint state machine) are expected to collect the rule
//! fragments for all the chains they want to change and call
//! [`ChainUpdater::rewrite_chains`] once per batch rather than once per
//! chain.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::process::Stdio;

use felix_model::IpVersion;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Failures that can occur while applying or removing chains.
#[derive(Debug, Error)]
pub enum ChainError {
    #[error("chain {chain:?} depends on unknown chain {missing:?}")]
    MissingDependency { chain: String, missing: String },
    #[error("{tool} exited with status {status}: {stderr}")]
    CommandFailed {
        tool: &'static str,
        status: std::process::ExitStatus,
        stderr: String,
    },
    #[error("failed to run {tool}: {source}")]
    Spawn {
        tool: &'static str,
        #[source]
        source: std::io::Error,
    },
}

/// Abstraction over invoking the kernel's restore tool, so tests can
/// substitute an in-memory fake instead of shelling out.
#[async_trait::async_trait]
pub trait Restore: Send + Sync {
    /// Feed `script` to the restore tool for `ip_version` as one
    /// transaction. Must return an error if the tool exits non-zero.
    async fn restore(&self, ip_version: IpVersion, script: &str) -> Result<(), ChainError>;
}

/// Invokes the real `iptables-restore` / `ip6tables-restore` binaries.
#[derive(Default)]
pub struct SystemRestore;

#[async_trait::async_trait]
impl Restore for SystemRestore {
    async fn restore(&self, ip_version: IpVersion, script: &str) -> Result<(), ChainError> {
        let tool = match ip_version {
            IpVersion::V4 => "iptables-restore",
            IpVersion::V6 => "ip6tables-restore",
        };
        let mut child = Command::new(tool)
            .arg("--noflush")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| ChainError::Spawn { tool, source })?;

        let mut stdin = child.stdin.take().expect("stdin was piped");
        stdin
            .write_all(script.as_bytes())
            .await
            .map_err(|source| ChainError::Spawn { tool, source })?;
        drop(stdin);

        let output = child
            .wait_with_output()
            .await
            .map_err(|source| ChainError::Spawn { tool, source })?;
        if output.status.success() {
            Ok(())
        } else {
            Err(ChainError::CommandFailed {
                tool,
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            })
        }
    }
}

#[derive(Clone, Debug, Default)]
struct ChainState {
    rules: Vec<String>,
    deps: BTreeSet<String>,
}

/// Tracks the set of chains this agent owns (per IP family) and applies
/// batched rewrites through a [`Restore`] implementation.
pub struct ChainUpdater<R: Restore> {
    restore: R,
    chains: HashMap<(IpVersion, String), ChainState>,
}

impl<R: Restore> ChainUpdater<R> {
    #[must_use]
    pub fn new(restore: R) -> Self {
        ChainUpdater {
            restore,
            chains: HashMap::new(),
        }
    }

    /// Flush and rewrite every chain in `updates`, as one atomic
    /// transaction. `deps[chain]` is the set of chains it jumps or goes
    /// to; every dependency must already be known (from a previous
    /// successful call) or be part of this same batch, or the whole
    /// batch is rejected before anything is sent to the kernel.
    ///
    /// # Errors
    ///
    /// Returns [`ChainError::MissingDependency`] if a referenced chain
    /// is absent, or [`ChainError::CommandFailed`]/[`ChainError::Spawn`]
    /// if the kernel tool invocation fails. On error no state is
    /// committed.
    pub async fn rewrite_chains(
        &mut self,
        ip_version: IpVersion,
        updates: BTreeMap<String, Vec<String>>,
        deps: BTreeMap<String, BTreeSet<String>>,
    ) -> Result<(), ChainError> {
        for (chain, chain_deps) in &deps {
            for dep in chain_deps {
                let known = updates.contains_key(dep)
                    || self.chains.contains_key(&(ip_version, dep.clone()));
                if !known {
                    return Err(ChainError::MissingDependency {
                        chain: chain.clone(),
                        missing: dep.clone(),
                    });
                }
            }
        }

        let mut script = String::from("*filter\n");
        for chain in updates.keys() {
            script.push_str(&format!(":{chain} - [0:0]\n"));
        }
        for (chain, rules) in &updates {
            for rule in rules {
                script.push_str(&format!("-A {chain} {rule}\n"));
            }
        }
        script.push_str("COMMIT\n");

        self.restore.restore(ip_version, &script).await?;

        for (chain, rules) in updates {
            let chain_deps = deps.get(&chain).cloned().unwrap_or_default();
            self.chains
                .insert((ip_version, chain), ChainState { rules, deps: chain_deps });
        }
        Ok(())
    }

    /// Best-effort deletion of `names`. Chains that fail to delete
    /// (still referenced elsewhere, or never existed) are logged and
    /// skipped rather than surfaced as an error — callers cannot
    /// generally recover from a partial chain-GC failure, and the next
    /// cleanup pass will retry.
    pub async fn delete_chains(&mut self, ip_version: IpVersion, names: &[String]) {
        for name in names {
            let mut script = String::from("*filter\n");
            script.push_str(&format!(":{name} - [0:0]\n"));
            script.push_str(&format!("-X {name}\n"));
            script.push_str("COMMIT\n");
            match self.restore.restore(ip_version, &script).await {
                Ok(()) => {
                    self.chains.remove(&(ip_version, name.clone()));
                }
                Err(err) => {
                    tracing::warn!(chain = %name, %err, "failed to delete chain, will retry on next cleanup");
                }
            }
        }
    }

    /// The chains no other known chain references. Candidates for
    /// garbage collection by a caller that also knows which chains are
    /// roots (dispatch chains, in particular) and should never be
    /// swept.
    #[must_use]
    pub fn unreferenced_chains(&self, ip_version: IpVersion) -> Vec<String> {
        let referenced: HashSet<&str> = self
            .chains
            .iter()
            .filter(|((v, _), _)| *v == ip_version)
            .flat_map(|(_, state)| state.deps.iter().map(String::as_str))
            .collect();
        self.chains
            .keys()
            .filter(|(v, _)| *v == ip_version)
            .map(|(_, name)| name.as_str())
            .filter(|name| !referenced.contains(name))
            .map(str::to_string)
            .collect()
    }

    /// The rule fragments currently believed programmed for `chain`, if
    /// any. Used by tests and by callers checking property P3 (repeated
    /// snapshot application is a no-op).
    #[must_use]
    pub fn programmed_rules(&self, ip_version: IpVersion, chain: &str) -> Option<&[String]> {
        self.chains
            .get(&(ip_version, chain.to_string()))
            .map(|state| state.rules.as_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeRestore {
        scripts: Mutex<Vec<String>>,
        fail_next: std::sync::atomic::AtomicBool,
    }

    #[async_trait::async_trait]
    impl Restore for FakeRestore {
        async fn restore(&self, _ip_version: IpVersion, script: &str) -> Result<(), ChainError> {
            if self.fail_next.swap(false, std::sync::atomic::Ordering::SeqCst) {
                return Err(ChainError::CommandFailed {
                    tool: "iptables-restore",
                    status: std::process::ExitStatus::default(),
                    stderr: "boom".to_string(),
                });
            }
            self.scripts.lock().unwrap().push(script.to_string());
            Ok(())
        }
    }

    #[tokio::test]
    async fn rewrite_rejects_missing_dependency() {
        let mut updater = ChainUpdater::new(FakeRestore::default());
        let mut updates = BTreeMap::new();
        updates.insert("felix-to-abc".to_string(), vec!["-j DROP".to_string()]);
        let mut deps = BTreeMap::new();
        deps.insert(
            "felix-to-abc".to_string(),
            BTreeSet::from(["felix-p-unknown".to_string()]),
        );
        let err = updater
            .rewrite_chains(IpVersion::V4, updates, deps)
            .await
            .unwrap_err();
        assert!(matches!(err, ChainError::MissingDependency { .. }));
    }

    #[tokio::test]
    async fn rewrite_accepts_intra_batch_dependency() {
        let mut updater = ChainUpdater::new(FakeRestore::default());
        let mut updates = BTreeMap::new();
        updates.insert(
            "felix-to-abc".to_string(),
            vec!["--goto felix-p-web-inbound".to_string()],
        );
        updates.insert("felix-p-web-inbound".to_string(), vec!["-j RETURN".to_string()]);
        let mut deps = BTreeMap::new();
        deps.insert(
            "felix-to-abc".to_string(),
            BTreeSet::from(["felix-p-web-inbound".to_string()]),
        );
        updater
            .rewrite_chains(IpVersion::V4, updates, deps)
            .await
            .unwrap();
        assert_eq!(
            updater.programmed_rules(IpVersion::V4, "felix-to-abc").unwrap(),
            ["--goto felix-p-web-inbound"]
        );
    }

    #[tokio::test]
    async fn failed_restore_does_not_commit_state() {
        let restore = FakeRestore::default();
        restore.fail_next.store(true, std::sync::atomic::Ordering::SeqCst);
        let mut updater = ChainUpdater::new(restore);
        let mut updates = BTreeMap::new();
        updates.insert("felix-to-abc".to_string(), vec!["-j DROP".to_string()]);
        let result = updater
            .rewrite_chains(IpVersion::V4, updates, BTreeMap::new())
            .await;
        assert!(result.is_err());
        assert!(updater.programmed_rules(IpVersion::V4, "felix-to-abc").is_none());
    }

    #[tokio::test]
    async fn unreferenced_chains_excludes_dependencies() {
        let mut updater = ChainUpdater::new(FakeRestore::default());
        let mut updates = BTreeMap::new();
        updates.insert("felix-to-abc".to_string(), vec!["--goto felix-p-web".to_string()]);
        updates.insert("felix-p-web".to_string(), vec!["-j RETURN".to_string()]);
        let mut deps = BTreeMap::new();
        deps.insert(
            "felix-to-abc".to_string(),
            BTreeSet::from(["felix-p-web".to_string()]),
        );
        updater
            .rewrite_chains(IpVersion::V4, updates, deps)
            .await
            .unwrap();
        let unreferenced = updater.unreferenced_chains(IpVersion::V4);
        assert_eq!(unreferenced, vec!["felix-to-abc".to_string()]);
    }
}
