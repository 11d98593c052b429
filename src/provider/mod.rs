//! Managed-Kubernetes provider abstraction layer
//!
//! This module defines the narrow seam between the reconciler and the
//! external provider that materializes clusters: create a cluster from a
//! spec, and report the coarse lifecycle state of a cluster by id. The
//! production implementation is [`DigitalOceanProvisioner`], which talks to
//! the DigitalOcean Kubernetes (DOKS) REST API.
//!
//! # Example
//!
//! ```text
//! let provisioner = DigitalOceanProvisioner::new(token_source);
//! let id = provisioner.create(&cluster).await?;
//! let state = provisioner.state(&cluster, &id).await?;
//! ```

mod digitalocean;

pub use digitalocean::{
    DigitalOceanProvisioner, SecretTokenSource, TokenSource, DEFAULT_API_URL,
};
#[cfg(test)]
pub use digitalocean::MockTokenSource;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[cfg(test)]
use mockall::automock;

use crate::crd::ManagedCluster;
use crate::Result;

/// Coarse lifecycle state of a provider-side cluster.
///
/// Mirrors the DOKS cluster status states. Only [`ClusterState::Running`]
/// terminates the reconciler's poll loop; every other state keeps polling
/// under the configured budget.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ClusterState {
    /// The provider is still bringing the cluster up
    Provisioning,
    /// The cluster is up and serving
    Running,
    /// Running with degraded capacity
    Degraded,
    /// The provider reports a cluster-level error
    Error,
    /// A version upgrade is in progress
    Upgrading,
    /// The cluster was deleted provider-side
    Deleted,
    /// Any state outside the documented set
    #[serde(other)]
    Invalid,
}

impl ClusterState {
    /// True for the terminal state the poll loop waits for
    pub fn is_running(self) -> bool {
        matches!(self, Self::Running)
    }
}

impl std::fmt::Display for ClusterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Provisioning => "provisioning",
            Self::Running => "running",
            Self::Degraded => "degraded",
            Self::Error => "error",
            Self::Upgrading => "upgrading",
            Self::Deleted => "deleted",
            Self::Invalid => "invalid",
        };
        write!(f, "{s}")
    }
}

/// External system that materializes managed clusters from specs.
///
/// Both calls resolve the API credential from the Secret referenced by the
/// resource's spec at call time; no token is cached across passes.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Request creation of a cluster; returns the provider-assigned id.
    ///
    /// The id is assigned atomically by the provider: there is no window in
    /// which a cluster exists without an id, which is what makes the
    /// reconciler's "create only when the status has no id" check safe.
    async fn create(&self, cluster: &ManagedCluster) -> Result<String>;

    /// Report the lifecycle state of a previously created cluster
    async fn state(&self, cluster: &ManagedCluster, id: &str) -> Result<ClusterState>;
}
