//! ManagedCluster reconciliation
//!
//! One reconciliation pass drives a single resource from its declared spec
//! toward the provider's actual state: resolve the key to a fresh snapshot,
//! validate, create the cluster if the status carries no provider id yet,
//! commit `creating`, poll the provider until it reports `running` (under a
//! bounded wall-clock budget), and commit `running`. Status commits use a
//! fetch-fresh-then-update discipline so a write that races another actor
//! is detected by the API server and retried against a re-read copy instead
//! of silently overwriting.
//!
//! The pass holds no state between invocations. The queue delivers only a
//! key, and everything else is re-read, so a pass never acts on a snapshot
//! that went stale while the key was queued.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kube::api::{Api, PostParams};
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use crate::crd::{ManagedCluster, ManagedClusterStatus, Progress, ResourceKey};
use crate::event::{
    broadcast, ClusterEvent, EventSink, REASON_CREATION, REASON_CREATION_COMPLETED,
    REASON_PROVISION_FAILED, REASON_SPEC_INVALID,
};
use crate::provider::Provisioner;
use crate::{Error, Result};

/// Status writes re-read and retry this many times on conflict before the
/// pass fails and the key goes back to the queue.
const STATUS_COMMIT_ATTEMPTS: u32 = 3;

/// Typed read/write access to ManagedCluster resources and their status
/// sub-object.
///
/// The version token for optimistic concurrency is the `resourceVersion`
/// carried inside the freshly read resource that `update_status` writes
/// against; a raced write surfaces as [`Error::Conflict`].
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterStore: Send + Sync {
    /// Read the current resource, or `None` if it no longer exists
    async fn get(&self, key: &ResourceKey) -> Result<Option<ManagedCluster>>;

    /// Write the status sub-object against the version token in `cluster`
    async fn update_status(
        &self,
        cluster: &ManagedCluster,
        status: ManagedClusterStatus,
    ) -> Result<()>;
}

/// Production store backed by the Kubernetes API
pub struct KubeClusterStore {
    client: Client,
}

impl KubeClusterStore {
    /// Create a store reading and writing through the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<ManagedCluster> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl ClusterStore for KubeClusterStore {
    async fn get(&self, key: &ResourceKey) -> Result<Option<ManagedCluster>> {
        Ok(self.api(&key.namespace).get_opt(&key.name).await?)
    }

    async fn update_status(
        &self,
        cluster: &ManagedCluster,
        status: ManagedClusterStatus,
    ) -> Result<()> {
        let key = cluster.key();
        let mut updated = cluster.clone();
        updated.status = Some(status);

        let body = serde_json::to_vec(&updated)
            .map_err(|e| Error::serialization(e.to_string()))?;

        self.api(&key.namespace)
            .replace_status(&key.name, &PostParams::default(), body)
            .await
            .map_err(|e| match e {
                kube::Error::Api(ae) if ae.code == 409 => Error::conflict(ae.message),
                other => Error::Kube(other),
            })?;
        Ok(())
    }
}

/// Shared state for all reconciliation passes.
///
/// Built once at startup and shared across workers; holds the external
/// collaborator seams and the poll tuning.
pub struct Context {
    /// Read/write access to ManagedCluster resources
    pub store: Arc<dyn ClusterStore>,
    /// The managed-Kubernetes provider
    pub provisioner: Arc<dyn Provisioner>,
    /// Event sinks, each receiving every emitted event
    pub sinks: Vec<Arc<dyn EventSink>>,
    /// Fixed delay between provider state polls
    pub poll_interval: Duration,
    /// Wall-clock budget for one provisioning poll loop
    pub poll_timeout: Duration,
    /// Process-wide shutdown signal, checked between poll iterations
    pub shutdown: CancellationToken,
}

impl Context {
    /// Create a builder over the two required collaborator seams
    pub fn builder(
        store: Arc<dyn ClusterStore>,
        provisioner: Arc<dyn Provisioner>,
    ) -> ContextBuilder {
        ContextBuilder {
            store,
            provisioner,
            sinks: Vec::new(),
            poll_interval: crate::DEFAULT_POLL_INTERVAL,
            poll_timeout: crate::DEFAULT_POLL_TIMEOUT,
            shutdown: CancellationToken::new(),
        }
    }
}

/// Builder for [`Context`]
pub struct ContextBuilder {
    store: Arc<dyn ClusterStore>,
    provisioner: Arc<dyn Provisioner>,
    sinks: Vec<Arc<dyn EventSink>>,
    poll_interval: Duration,
    poll_timeout: Duration,
    shutdown: CancellationToken,
}

impl ContextBuilder {
    /// Add an event sink
    pub fn sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Set the delay between provider state polls
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the wall-clock budget for one provisioning poll loop
    pub fn poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    /// Attach the process-wide shutdown token
    pub fn shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    /// Build the context
    pub fn build(self) -> Context {
        Context {
            store: self.store,
            provisioner: self.provisioner,
            sinks: self.sinks,
            poll_interval: self.poll_interval,
            poll_timeout: self.poll_timeout,
            shutdown: self.shutdown,
        }
    }
}

/// Run one reconciliation pass for the given key.
///
/// Returns `Ok(())` when the resource converged (or no longer exists —
/// provider-side deletion is deliberately not implemented, a deletion is
/// logged and treated as success). Errors are classified by
/// [`Error::is_retryable`]: the worker loop re-queues retryable failures
/// with backoff and drops terminal ones until the next notification.
#[instrument(skip(ctx), fields(cluster = %key))]
pub async fn reconcile(key: &ResourceKey, ctx: &Context) -> Result<()> {
    let Some(cluster) = ctx.store.get(key).await? else {
        info!("resource gone; provider-side deletion is not implemented, nothing to do");
        return Ok(());
    };

    if let Err(rejection) = cluster.spec.validate() {
        warn!(error = %rejection, "spec rejected");
        broadcast(
            &ctx.sinks,
            &ClusterEvent::warning(key.clone(), REASON_SPEC_INVALID, rejection.to_string()),
        )
        .await;
        record_failure(ctx, key, &rejection).await;
        return Err(rejection);
    }

    let cluster_id = match cluster.cluster_id() {
        Some(id) => {
            debug!(id, "cluster already created; skipping create");
            id.to_string()
        }
        None => {
            broadcast(
                &ctx.sinks,
                &ClusterEvent::normal(
                    key.clone(),
                    REASON_CREATION,
                    format!("requesting cluster {:?} at the provider", cluster.spec.name),
                ),
            )
            .await;
            let id = ctx.provisioner.create(&cluster).await?;
            info!(id = %id, "provider accepted create request");
            id
        }
    };

    commit_progress(ctx, key, &cluster_id, Progress::Creating).await?;

    match wait_for_running(ctx, &cluster, &cluster_id).await {
        Ok(()) => {}
        Err(timeout @ Error::PollTimeout { .. }) => {
            broadcast(
                &ctx.sinks,
                &ClusterEvent::warning(key.clone(), REASON_PROVISION_FAILED, timeout.to_string()),
            )
            .await;
            record_failure(ctx, key, &timeout).await;
            return Err(timeout);
        }
        Err(other) => return Err(other),
    }

    commit_progress(ctx, key, &cluster_id, Progress::Running).await?;
    broadcast(
        &ctx.sinks,
        &ClusterEvent::normal(
            key.clone(),
            REASON_CREATION_COMPLETED,
            format!("cluster {cluster_id} is running"),
        ),
    )
    .await;
    info!(id = %cluster_id, "cluster is running");
    Ok(())
}

/// Poll the provider until the cluster reports running.
///
/// Fails with [`Error::PollTimeout`] once the budget is exhausted and with
/// [`Error::Interrupted`] when shutdown is signalled; both checks happen
/// every iteration before sleeping again. Provider call errors surface
/// immediately as a failed (retryable) pass rather than polling forever.
async fn wait_for_running(ctx: &Context, cluster: &ManagedCluster, id: &str) -> Result<()> {
    let started = tokio::time::Instant::now();
    loop {
        let state = ctx.provisioner.state(cluster, id).await?;
        if state.is_running() {
            return Ok(());
        }
        debug!(%state, "cluster not running yet");

        if ctx.shutdown.is_cancelled() {
            return Err(Error::Interrupted);
        }
        if started.elapsed() + ctx.poll_interval > ctx.poll_timeout {
            return Err(Error::PollTimeout {
                elapsed: started.elapsed(),
                budget: ctx.poll_timeout,
            });
        }

        tokio::select! {
            _ = tokio::time::sleep(ctx.poll_interval) => {}
            _ = ctx.shutdown.cancelled() => return Err(Error::Interrupted),
        }
    }
}

/// Commit a progress transition, carrying the provider id.
///
/// A transition the monotonicity guard refuses (e.g. `running -> creating`
/// on a pass that re-walks an already-provisioned resource) skips the write
/// instead of regressing the status.
async fn commit_progress(
    ctx: &Context,
    key: &ResourceKey,
    id: &str,
    progress: Progress,
) -> Result<()> {
    commit_status(ctx, key, |status| {
        status.cluster_id = Some(id.to_string());
        status.message = None;
        if !status.advance(progress) {
            debug!(requested = %progress, current = %status.progress, "refusing progress regression");
            return false;
        }
        true
    })
    .await
}

/// Best-effort commit of a terminal `failed` status with its cause.
///
/// The pass is already failing for `cause`; a store error while recording
/// it is logged, not propagated, so the original failure stays visible.
async fn record_failure(ctx: &Context, key: &ResourceKey, cause: &Error) {
    let message = cause.to_string();
    let outcome = commit_status(ctx, key, |status| {
        status.message = Some(message.clone());
        status.advance(Progress::Failed)
    })
    .await;
    if let Err(e) = outcome {
        warn!(error = %e, "failed to record failed status");
    }
}

/// Fetch-fresh-then-update status commit.
///
/// Re-reads the resource immediately before writing so the write carries
/// the latest version token, and retries the read-modify-write on conflict.
/// The `mutate` closure edits the freshly read status and returns whether a
/// write is needed at all.
async fn commit_status<F>(ctx: &Context, key: &ResourceKey, mutate: F) -> Result<()>
where
    F: Fn(&mut ManagedClusterStatus) -> bool,
{
    let mut last_conflict = None;
    for attempt in 1..=STATUS_COMMIT_ATTEMPTS {
        let Some(fresh) = ctx.store.get(key).await? else {
            info!("resource disappeared before status commit");
            return Ok(());
        };

        let mut status = fresh.status.clone().unwrap_or_default();
        if !mutate(&mut status) {
            return Ok(());
        }

        match ctx.store.update_status(&fresh, status).await {
            Ok(()) => return Ok(()),
            Err(e) if e.is_conflict() => {
                debug!(attempt, "status write conflicted; re-reading");
                last_conflict = Some(e);
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_conflict.unwrap_or_else(|| Error::conflict("status write conflicted")))
}
