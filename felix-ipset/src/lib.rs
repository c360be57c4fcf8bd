// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Per-tag IP sets (C4) and the manager that keeps them in sync with the
//! profile/endpoint indices (C5).
//!
//! Every IP set this agent owns is replaced, never patched in place: the
//! kernel's `ipset` tool has exactly one atomic multi-member primitive,
//! `swap`, so [`ActiveIpset::finish_batch`] always goes through the
//! create-temp/fill-temp/swap/destroy-temp sequence in §4.4 rather than
//! issuing incremental `add`/`del` calls against the live set.

#![forbid(unsafe_code)]

pub mod manager;
pub mod names;

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::process::Stdio;

use felix_actor::Actor;
use felix_model::{IpVersion, Tag};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::oneshot;

pub use manager::{EndpointSummary, IpsetManager};
pub use names::owned_ipset_names;

/// Failures invoking the kernel's `ipset` tool.
#[derive(Debug, Error)]
pub enum IpsetError {
    #[error("ipset exited with status {status}: {stderr}")]
    CommandFailed {
        status: std::process::ExitStatus,
        stderr: String,
    },
    #[error("failed to run ipset: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Abstraction over the `ipset` binary, so the actor's synchronization
/// logic can be exercised without a kernel.
#[async_trait::async_trait]
pub trait IpsetTool: Send + Sync + 'static {
    /// Feed a batch (`create`/`flush`/`add`/`swap`/`destroy` lines) to
    /// `ipset restore`, as one transaction.
    async fn restore(&self, script: &str) -> Result<(), IpsetError>;

    /// Best-effort destroy of a single set. Unknown sets are not an
    /// error.
    async fn destroy(&self, name: &str) -> Result<(), IpsetError>;

    /// List every kernel ipset name, for the cleanup sweep.
    async fn list_names(&self) -> Result<Vec<String>, IpsetError>;
}

/// Invokes the real `ipset` binary.
#[derive(Default)]
pub struct SystemIpsetTool;

#[async_trait::async_trait]
impl IpsetTool for SystemIpsetTool {
    async fn restore(&self, script: &str) -> Result<(), IpsetError> {
        let mut child = Command::new("ipset")
            .arg("restore")
            .arg("-exist")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()?;
        let mut stdin = child.stdin.take().expect("stdin was piped");
        stdin.write_all(script.as_bytes()).await?;
        drop(stdin);
        let output = child.wait_with_output().await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(IpsetError::CommandFailed {
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            })
        }
    }

    async fn destroy(&self, name: &str) -> Result<(), IpsetError> {
        let output = Command::new("ipset").arg("destroy").arg(name).output().await?;
        if output.status.success() {
            Ok(())
        } else {
            // Destroying a set that doesn't exist (or is still referenced
            // by a live iptables rule) is routine during cleanup; treat
            // any failure here as non-fatal to the caller.
            tracing::debug!(name, stderr = %String::from_utf8_lossy(&output.stderr), "ipset destroy failed");
            Ok(())
        }
    }

    async fn list_names(&self) -> Result<Vec<String>, IpsetError> {
        let output = Command::new("ipset").arg("list").arg("-name").output().await?;
        if !output.status.success() {
            return Err(IpsetError::CommandFailed {
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }
}

/// Messages accepted by an [`ActiveIpset`] actor.
pub enum IpsetMessage {
    ReplaceMembers(BTreeSet<IpAddr>),
    AddMember(IpAddr),
    RemoveMember(IpAddr),
    /// Sent by the reference manager once the refcount drops to zero;
    /// the actor destroys its owned sets and acknowledges through the
    /// channel when done.
    OnUnreferenced(oneshot::Sender<()>),
}

/// What the actor believes is currently programmed in the kernel.
#[derive(Clone, Debug, Eq, PartialEq)]
enum Programmed {
    Unknown,
    Known(BTreeSet<IpAddr>),
}

/// Owns exactly one tag's IP set, for one IP family.
pub struct ActiveIpset<T: IpsetTool> {
    tag: Tag,
    version: IpVersion,
    tool: T,
    intended_members: BTreeSet<IpAddr>,
    programmed_members: Programmed,
    stopped: bool,
    notified_ready: bool,
    on_ready: Option<Box<dyn FnOnce() + Send>>,
    cleanup_acks: Vec<oneshot::Sender<()>>,
}

impl<T: IpsetTool> ActiveIpset<T> {
    #[must_use]
    pub fn new(tag: Tag, version: IpVersion, tool: T) -> Self {
        ActiveIpset {
            tag,
            version,
            tool,
            intended_members: BTreeSet::new(),
            programmed_members: Programmed::Unknown,
            stopped: false,
            notified_ready: false,
            on_ready: None,
            cleanup_acks: Vec::new(),
        }
    }

    /// Run `callback` exactly once, the first time this set is
    /// successfully synchronized. Used by the manager to know when a
    /// freshly-created set has something in the kernel worth routing
    /// traffic against.
    pub fn notify_when_ready(&mut self, callback: impl FnOnce() + Send + 'static) {
        self.on_ready = Some(Box::new(callback));
    }

    /// The two kernel set names this actor owns. Pure function of
    /// `tag`/`version`; safe to call without going through the mailbox.
    #[must_use]
    pub fn owned_ipset_names(&self) -> (String, String) {
        names::owned_ipset_names(&self.tag, self.version)
    }

    fn build_swap_script(&self, main: &str, temp: &str) -> String {
        let family = match self.version {
            IpVersion::V4 => "inet",
            IpVersion::V6 => "inet6",
        };
        let mut script = String::new();
        script.push_str(&format!("create {main} hash:ip family {family} -exist\n"));
        script.push_str(&format!("create {temp} hash:ip family {family} -exist\n"));
        script.push_str(&format!("flush {temp}\n"));
        for member in &self.intended_members {
            script.push_str(&format!("add {temp} {member}\n"));
        }
        script.push_str(&format!("swap {main} {temp}\n"));
        script.push_str(&format!("destroy {temp}\n"));
        script
    }
}

impl<T: IpsetTool> Actor for ActiveIpset<T> {
    type Message = IpsetMessage;
    type Error = IpsetError;

    fn handle(&mut self, message: Self::Message) {
        if self.stopped {
            // Once stopped this actor's only remaining job is to finish
            // cleanup; further membership churn is meaningless.
            if let IpsetMessage::OnUnreferenced(ack) = message {
                self.cleanup_acks.push(ack);
            }
            return;
        }
        match message {
            IpsetMessage::ReplaceMembers(members) => self.intended_members = members,
            IpsetMessage::AddMember(ip) => {
                self.intended_members.insert(ip);
            }
            IpsetMessage::RemoveMember(ip) => {
                self.intended_members.remove(&ip);
            }
            IpsetMessage::OnUnreferenced(ack) => {
                self.stopped = true;
                self.cleanup_acks.push(ack);
            }
        }
    }

    async fn finish_batch(&mut self) -> Result<(), Self::Error> {
        if self.stopped {
            let (main, temp) = self.owned_ipset_names();
            let _ = self.tool.destroy(&main).await;
            let _ = self.tool.destroy(&temp).await;
            for ack in self.cleanup_acks.drain(..) {
                let _ = ack.send(());
            }
            return Ok(());
        }

        let up_to_date = matches!(&self.programmed_members, Programmed::Known(p) if *p == self.intended_members);
        if up_to_date {
            return Ok(());
        }

        let (main, temp) = self.owned_ipset_names();
        let script = self.build_swap_script(&main, &temp);
        self.tool.restore(&script).await?;
        self.programmed_members = Programmed::Known(self.intended_members.clone());

        if !self.notified_ready {
            self.notified_ready = true;
            if let Some(callback) = self.on_ready.take() {
                callback();
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use felix_actor::test_util::drain;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct FakeTool {
        scripts: Mutex<Vec<String>>,
        destroyed: Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl IpsetTool for FakeTool {
        async fn restore(&self, script: &str) -> Result<(), IpsetError> {
            self.scripts.lock().unwrap().push(script.to_string());
            Ok(())
        }
        async fn destroy(&self, name: &str) -> Result<(), IpsetError> {
            self.destroyed.lock().unwrap().push(name.to_string());
            Ok(())
        }
        async fn list_names(&self) -> Result<Vec<String>, IpsetError> {
            Ok(Vec::new())
        }
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn replace_then_finish_batch_issues_one_swap() {
        let tool = FakeTool::default();
        let mut actor = ActiveIpset::new(Tag::from("web"), IpVersion::V4, tool);
        drain(
            &mut actor,
            [
                IpsetMessage::AddMember(ip("10.0.0.1")),
                IpsetMessage::AddMember(ip("10.0.0.2")),
                IpsetMessage::RemoveMember(ip("10.0.0.1")),
            ],
        )
        .await
        .unwrap();
        assert_eq!(actor.tool.scripts.lock().unwrap().len(), 1);
        let script = actor.tool.scripts.lock().unwrap()[0].clone();
        assert!(script.contains("swap"));
        assert!(script.contains("10.0.0.2"));
        assert!(!script.contains("add") || script.matches("add").count() == 1);
    }

    #[tokio::test]
    async fn unchanged_members_do_not_resync() {
        let tool = FakeTool::default();
        let mut actor = ActiveIpset::new(Tag::from("web"), IpVersion::V4, tool);
        drain(&mut actor, [IpsetMessage::AddMember(ip("10.0.0.1"))])
            .await
            .unwrap();
        assert_eq!(actor.tool.scripts.lock().unwrap().len(), 1);
        drain(&mut actor, []).await.unwrap();
        assert_eq!(actor.tool.scripts.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn on_unreferenced_destroys_both_sets_and_acks() {
        let tool = FakeTool::default();
        let mut actor = ActiveIpset::new(Tag::from("web"), IpVersion::V4, tool);
        drain(&mut actor, [IpsetMessage::AddMember(ip("10.0.0.1"))])
            .await
            .unwrap();
        let (tx, rx) = oneshot::channel();
        drain(&mut actor, [IpsetMessage::OnUnreferenced(tx)]).await.unwrap();
        rx.await.unwrap();
        assert_eq!(actor.tool.destroyed.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn ready_callback_fires_once() {
        let tool = FakeTool::default();
        let mut actor = ActiveIpset::new(Tag::from("web"), IpVersion::V4, tool);
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();
        actor.notify_when_ready(move || {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });
        drain(&mut actor, [IpsetMessage::AddMember(ip("10.0.0.1"))])
            .await
            .unwrap();
        drain(&mut actor, [IpsetMessage::AddMember(ip("10.0.0.2"))])
            .await
            .unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
