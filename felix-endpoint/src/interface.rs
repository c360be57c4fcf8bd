// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Boundary to the device/sysctl/route helpers that configure a local
//! endpoint's kernel interface -- out of scope (`spec.md` §1's "Out of
//! scope" list names exactly this as an external collaborator whose
//! internals are not specified here).
//!
//! `felix-endpoint` only needs to know whether the interface currently
//! exists and is up; everything below that boundary is a plug-in.

#![forbid(unsafe_code)]

use felix_model::EndpointPayload;

/// Reports interface readiness and (out of this crate's scope) applies
/// the sysctls/routes a workload interface needs.
#[async_trait::async_trait]
pub trait InterfaceConfigurer: Send + Sync + 'static {
    /// Apply whatever per-interface configuration `endpoint` requires
    /// and report whether `iface` currently exists and is administratively
    /// up. `false` puts the owning [`crate::LocalEndpoint`] into its
    /// *Waiting* state until a kick observes readiness.
    async fn configure(&self, iface: &str, endpoint: &EndpointPayload) -> bool;
}

/// Checks interface presence/state via `ip link show`. The sysctl and
/// route programming this endpoint's interface needs is delegated
/// further still -- this type only answers the up/down question.
#[derive(Clone, Default)]
pub struct SystemInterfaceConfigurer;

#[async_trait::async_trait]
impl InterfaceConfigurer for SystemInterfaceConfigurer {
    async fn configure(&self, iface: &str, _endpoint: &EndpointPayload) -> bool {
        let output = tokio::process::Command::new("ip")
            .args(["link", "show", iface])
            .output()
            .await;
        match output {
            Ok(output) => {
                output.status.success()
                    && String::from_utf8_lossy(&output.stdout).contains("state UP")
            }
            Err(err) => {
                tracing::debug!(iface, %err, "failed to query interface state");
                false
            }
        }
    }
}
