//! ManagedCluster Custom Resource Definition
//!
//! A ManagedCluster declares one cluster to be provisioned at the managed
//! Kubernetes provider. The spec carries the user's desired configuration;
//! the status records provider-assigned identity and provisioning progress
//! as the controller observes it.

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{NodePool, Progress, ResourceKey, SecretRef};

/// Specification for a ManagedCluster
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "flotilla.dev",
    version = "v1alpha1",
    kind = "ManagedCluster",
    plural = "managedclusters",
    shortname = "mc",
    status = "ManagedClusterStatus",
    namespaced,
    printcolumn = r#"{"name":"Progress","type":"string","jsonPath":".status.progress"}"#,
    printcolumn = r#"{"name":"Region","type":"string","jsonPath":".spec.region"}"#,
    printcolumn = r#"{"name":"Version","type":"string","jsonPath":".spec.version"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ManagedClusterSpec {
    /// Display name of the cluster at the provider
    pub name: String,

    /// Provider region slug (e.g. "nyc1")
    pub region: String,

    /// Kubernetes version slug (e.g. "1.29")
    pub version: String,

    /// Reference to the Secret holding the provider API token
    pub token_secret: SecretRef,

    /// Worker node pools; at least one is required
    pub node_pools: Vec<NodePool>,
}

impl ManagedClusterSpec {
    /// Validate the cluster specification.
    ///
    /// An invalid spec will not become valid by retrying, so callers fail
    /// the reconciliation pass without touching the provider.
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.name.is_empty() {
            return Err(crate::Error::validation("spec.name must not be empty"));
        }
        if self.region.is_empty() {
            return Err(crate::Error::validation("spec.region must not be empty"));
        }
        if self.version.is_empty() {
            return Err(crate::Error::validation("spec.version must not be empty"));
        }
        if self.token_secret.name.is_empty() {
            return Err(crate::Error::validation(
                "spec.tokenSecret.name must not be empty",
            ));
        }
        if self.node_pools.is_empty() {
            return Err(crate::Error::validation(
                "spec.nodePools must contain at least one pool",
            ));
        }
        for (i, pool) in self.node_pools.iter().enumerate() {
            if pool.name.is_empty() {
                return Err(crate::Error::validation(format!(
                    "spec.nodePools[{i}].name must not be empty"
                )));
            }
            if pool.size.is_empty() {
                return Err(crate::Error::validation(format!(
                    "spec.nodePools[{i}].size must not be empty"
                )));
            }
            if pool.count == 0 {
                return Err(crate::Error::validation(format!(
                    "spec.nodePools[{i}].count must be at least 1"
                )));
            }
        }
        Ok(())
    }
}

/// Status for a ManagedCluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ManagedClusterStatus {
    /// Provider-assigned cluster id; empty until creation succeeds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_id: Option<String>,

    /// Provisioning progress observed by the controller
    #[serde(default)]
    pub progress: Progress,

    /// Human-readable message about the current state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ManagedClusterStatus {
    /// Move progress forward, refusing regressions.
    ///
    /// Returns false (and leaves the status untouched) when the transition
    /// would move backwards, e.g. `Running -> Creating` on a pass that raced
    /// with an earlier one. `Failed` is reachable from any state, and a
    /// later pass that observes the cluster running may leave `Failed`.
    pub fn advance(&mut self, next: Progress) -> bool {
        use Progress::*;
        let allowed = match (self.progress, next) {
            (a, b) if a == b => true,
            (_, Failed) => true,
            (Failed, _) => true,
            (Running, _) => false,
            (Creating, Pending) => false,
            _ => true,
        };
        if allowed {
            self.progress = next;
        }
        allowed
    }

    /// Set the message and return self for chaining
    pub fn message(mut self, msg: impl Into<String>) -> Self {
        self.message = Some(msg.into());
        self
    }
}

impl ManagedCluster {
    /// The queue key addressing this resource
    pub fn key(&self) -> ResourceKey {
        ResourceKey::new(self.namespace().unwrap_or_default(), self.name_any())
    }

    /// Provider-assigned cluster id, if creation has already succeeded
    pub fn cluster_id(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.cluster_id.as_deref())
            .filter(|id| !id.is_empty())
    }
}
