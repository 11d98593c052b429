//! Resource-change notification source.
//!
//! The source is the external edge of the control loop: it observes
//! ManagedCluster resources and enqueues a key whenever one is created,
//! updated, or deleted, and it reports when its cache has been populated at
//! least once. The worker loop blocks on that first sync before starting —
//! a worker running against an unsynced source could act on incomplete
//! state.
//!
//! [`WatchSource`] is the production implementation, bridging a kube-rs
//! watcher/reflector into the queue. [`ManualSource`] is for embedders and
//! tests that feed the queue directly.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use kube::runtime::watcher::{watcher, Config};
use kube::runtime::{reflector, WatchStreamExt};
use kube::{Api, Client};
use tokio::sync::{watch, Notify};
use tracing::{info, warn};

use crate::crd::{ManagedCluster, ResourceKey};
use crate::queue::WorkQueue;

/// Where change notifications come from, plus a readiness predicate.
#[async_trait]
pub trait NotificationSource: Send + Sync {
    /// True once the source's cache has been fully populated at least once
    fn has_synced(&self) -> bool;

    /// Wait for the first full cache population
    async fn wait_synced(&self);
}

/// Production source: a kube-rs watcher over ManagedCluster resources.
///
/// Every applied or deleted object becomes a `WorkQueue::add` of its key —
/// only the key; reconciliation re-reads the resource so a change between
/// enqueue and dequeue is never acted on from a stale snapshot.
pub struct WatchSource {
    synced: watch::Receiver<bool>,
}

impl WatchSource {
    /// Start watching and feeding the queue.
    ///
    /// Watches the given namespace, or all namespaces when `None`. The
    /// watch restarts internally with backoff on transient API errors.
    pub fn spawn(
        client: Client,
        queue: Arc<WorkQueue<ResourceKey>>,
        namespace: Option<&str>,
    ) -> Self {
        let api: Api<ManagedCluster> = match namespace {
            Some(ns) => Api::namespaced(client, ns),
            None => Api::all(client),
        };

        let (reader, writer) = reflector::store();
        let (tx, rx) = watch::channel(false);

        tokio::spawn(async move {
            if reader.wait_until_ready().await.is_ok() {
                info!("notification source synced");
                let _ = tx.send(true);
            } else {
                warn!("reflector store dropped before first sync");
            }
        });

        tokio::spawn(async move {
            let events = watcher(api, Config::default()).default_backoff();
            let mut touched = std::pin::pin!(reflector(writer, events).touched_objects());
            while let Some(event) = touched.next().await {
                match event {
                    Ok(object) => queue.add(object.key()),
                    Err(e) => warn!(error = %e, "watch stream error"),
                }
            }
        });

        Self { synced: rx }
    }
}

#[async_trait]
impl NotificationSource for WatchSource {
    fn has_synced(&self) -> bool {
        *self.synced.borrow()
    }

    async fn wait_synced(&self) {
        let mut rx = self.synced.clone();
        if rx.wait_for(|synced| *synced).await.is_err() {
            warn!("notification source closed before syncing");
        }
    }
}

/// A source whose sync state is driven by the caller.
#[derive(Default)]
pub struct ManualSource {
    synced: AtomicBool,
    notify: Notify,
}

impl ManualSource {
    /// Create an unsynced source
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the source synced, releasing all `wait_synced` callers
    pub fn mark_synced(&self) {
        self.synced.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }
}

#[async_trait]
impl NotificationSource for ManualSource {
    fn has_synced(&self) -> bool {
        self.synced.load(Ordering::SeqCst)
    }

    async fn wait_synced(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.has_synced() {
                return;
            }
            notified.await;
        }
    }
}
