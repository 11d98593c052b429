//! Supporting types for the ManagedCluster CRD

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Namespace/name pair uniquely addressing one ManagedCluster resource.
///
/// This is the identity the work queue carries. It is deliberately payload
/// free: every reconciliation pass re-reads the resource by key, so a pass
/// never acts on a snapshot that was stale at dequeue time.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct ResourceKey {
    /// Namespace of the resource
    pub namespace: String,
    /// Name of the resource
    pub name: String,
}

impl ResourceKey {
    /// Create a key from a namespace and name
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl std::str::FromStr for ResourceKey {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((ns, name)) if !ns.is_empty() && !name.is_empty() => Ok(Self::new(ns, name)),
            _ => Err(crate::Error::validation(format!(
                "invalid resource key: {s:?}, expected namespace/name"
            ))),
        }
    }
}

/// A worker node pool in the managed cluster
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct NodePool {
    /// Provider size/machine-class slug (e.g. "s-2vcpu-4gb")
    pub size: String,
    /// Pool name
    pub name: String,
    /// Number of worker nodes in the pool
    pub count: u32,
}

/// Reference to a Kubernetes Secret holding the provider API token.
///
/// Only the reference travels in the spec; the token value is resolved at
/// call time and never stored on the resource.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SecretRef {
    /// Namespace of the secret; defaults to the resource's own namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Name of the secret
    pub name: String,
}

impl SecretRef {
    /// Namespace to read the secret from, given the owning resource's namespace
    pub fn namespace_or<'a>(&'a self, fallback: &'a str) -> &'a str {
        self.namespace.as_deref().unwrap_or(fallback)
    }
}

/// Controller-observed provisioning progress of a ManagedCluster.
///
/// Progress is monotonic: it moves `Pending -> Creating -> Running` as the
/// controller learns provider state and never regresses. `Failed` is
/// reachable from any state on unrecoverable error; a later pass that sees
/// the cluster running may overwrite it.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Progress {
    /// No provisioning attempt observed yet
    #[default]
    Pending,
    /// Provider accepted the create request; cluster is coming up
    Creating,
    /// Provider reports the cluster running
    Running,
    /// Provisioning failed; awaiting a spec change to re-attempt
    Failed,
}

impl std::fmt::Display for Progress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Creating => write!(f, "creating"),
            Self::Running => write!(f, "running"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn key_round_trips_through_display() {
        let key = ResourceKey::new("team-a", "demo");
        assert_eq!(key.to_string(), "team-a/demo");
        assert_eq!(ResourceKey::from_str("team-a/demo").unwrap(), key);
    }

    #[test]
    fn key_rejects_malformed_strings() {
        assert!(ResourceKey::from_str("no-slash").is_err());
        assert!(ResourceKey::from_str("/missing-ns").is_err());
        assert!(ResourceKey::from_str("missing-name/").is_err());
    }

    #[test]
    fn secret_ref_defaults_to_owner_namespace() {
        let explicit = SecretRef {
            namespace: Some("vault".into()),
            name: "do-token".into(),
        };
        assert_eq!(explicit.namespace_or("team-a"), "vault");

        let inherited = SecretRef {
            namespace: None,
            name: "do-token".into(),
        };
        assert_eq!(inherited.namespace_or("team-a"), "team-a");
    }

    #[test]
    fn progress_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&Progress::Creating).unwrap(),
            "\"creating\""
        );
        assert_eq!(
            serde_json::from_str::<Progress>("\"running\"").unwrap(),
            Progress::Running
        );
    }
}
