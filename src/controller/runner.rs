//! Worker loop draining the work queue.
//!
//! The loop never inspects payloads, only keys; all domain logic lives in
//! [`reconcile`](super::reconcile). Its one obligation beyond calling the
//! reconciler is queue discipline: release every dequeued key (success or
//! failure), forget backoff state on success and on terminal failure, and
//! re-queue with backoff on retryable failure.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::controller::{reconcile, Context};
use crate::crd::ResourceKey;
use crate::queue::WorkQueue;
use crate::source::NotificationSource;

/// The reconciliation controller: a queue plus N worker tasks.
pub struct Controller {
    queue: Arc<WorkQueue<ResourceKey>>,
    ctx: Arc<Context>,
}

impl Controller {
    /// Create a controller draining the given queue
    pub fn new(queue: Arc<WorkQueue<ResourceKey>>, ctx: Arc<Context>) -> Self {
        Self { queue, ctx }
    }

    /// Run the control loop until the queue shuts down.
    ///
    /// Blocks until the notification source reports its first full sync
    /// before starting any worker: a worker started against an unsynced
    /// source could act on incomplete state.
    pub async fn run(&self, source: &dyn NotificationSource, workers: usize) {
        info!("waiting for notification source to sync");
        source.wait_synced().await;
        info!(workers, "notification source synced; starting workers");

        let mut handles = Vec::with_capacity(workers);
        for worker_id in 0..workers {
            let queue = self.queue.clone();
            let ctx = self.ctx.clone();
            handles.push(tokio::spawn(worker(worker_id, queue, ctx)));
        }

        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "worker task aborted");
            }
        }
        info!("all workers stopped");
    }
}

async fn worker(worker_id: usize, queue: Arc<WorkQueue<ResourceKey>>, ctx: Arc<Context>) {
    while let Some(key) = queue.get().await {
        match reconcile(&key, &ctx).await {
            Ok(()) => {
                queue.forget(&key);
            }
            Err(e) if e.is_retryable() => {
                warn!(
                    worker = worker_id,
                    cluster = %key,
                    error = %e,
                    "reconciliation failed; re-queueing with backoff"
                );
                queue.clone().add_rate_limited(key.clone());
            }
            Err(e) => {
                error!(
                    worker = worker_id,
                    cluster = %key,
                    error = %e,
                    "reconciliation failed terminally; waiting for the next notification"
                );
                queue.forget(&key);
            }
        }
        // release on every exit path, or the key stays in-flight forever
        queue.done(&key);
    }
    debug!(worker = worker_id, "queue shut down; worker exiting");
}
