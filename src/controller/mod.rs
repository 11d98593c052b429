//! Reconciliation engine for ManagedCluster resources
//!
//! The engine is split in two: [`runner`] owns the worker loop and queue
//! discipline, [`cluster`] owns the per-key reconciliation pass and the
//! collaborator seams it drives (store, provisioner, event sinks).

mod cluster;
mod runner;

pub use cluster::{reconcile, ClusterStore, Context, ContextBuilder, KubeClusterStore};
pub use runner::Controller;

#[cfg(test)]
pub use cluster::MockClusterStore;
