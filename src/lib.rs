//! Flotilla - Kubernetes operator for provisioning managed DOKS clusters
//!
//! Flotilla reconciles declarative [`ManagedCluster`](crd::ManagedCluster)
//! resources against DigitalOcean Kubernetes: users declare the cluster they
//! want, and an asynchronous control loop converges provider state toward
//! it.
//!
//! # Architecture
//!
//! The control loop is push-then-pull:
//! - A notification source watches ManagedCluster resources and pushes keys
//!   into a de-duplicating, rate-limited work queue
//! - Workers pull keys and drive one reconciliation pass each: validate the
//!   spec, create the cluster at the provider if the status carries no id
//!   yet, poll the provider until it reports running, and commit status
//!   transitions with optimistic-concurrency-safe writes
//!
//! The queue guarantees at-most-one-in-flight per key, so no resource is
//! ever reconciled by two workers at once, and it carries only key
//! identities — every pass re-reads the resource, never a cached snapshot.
//!
//! # Modules
//!
//! - [`crd`] - The ManagedCluster Custom Resource Definition
//! - [`queue`] - De-duplicating, rate-limited work queue
//! - [`source`] - Resource-change notification source (kube watcher bridge)
//! - [`controller`] - Worker loop and per-key reconciliation
//! - [`provider`] - Managed-Kubernetes provider abstraction (DOKS)
//! - [`event`] - Operator events (log + Kubernetes Event sinks)
//! - [`retry`] - Backoff policies and retry utilities
//! - [`error`] - Error types for the operator

#![deny(missing_docs)]

use std::time::Duration;

pub mod controller;
pub mod crd;
pub mod error;
pub mod event;
pub mod provider;
pub mod queue;
pub mod retry;
pub mod source;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Default Configuration Constants
// =============================================================================
// Defaults shared by the CLI, the context builder, and test fixtures.

/// Component name used in event sources and server-side-apply field managers
pub const COMPONENT: &str = "flotilla";

/// Default number of concurrent workers draining the queue
pub const DEFAULT_WORKERS: usize = 2;

/// Default delay between provider state polls
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Default wall-clock budget for one provisioning poll loop.
///
/// A cluster that has not reached running within this budget fails the pass
/// terminally; provisioning is re-attempted on the next notification.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(600);
