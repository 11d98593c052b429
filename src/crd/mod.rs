//! Custom Resource Definitions for flotilla
//!
//! This module contains the ManagedCluster CRD and its supporting types.

mod cluster;
mod types;

pub use cluster::{ManagedCluster, ManagedClusterSpec, ManagedClusterStatus};
pub use types::{NodePool, Progress, ResourceKey, SecretRef};
