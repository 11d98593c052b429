//! End-to-end control-loop tests.
//!
//! These drive the real queue, worker loop, and reconciler against
//! in-memory collaborators: an in-memory cluster store with injectable
//! write conflicts, a scripted provisioner, and a recording event sink.
//! Time is virtual (`start_paused`), so backoff delays and poll intervals
//! cost nothing.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use flotilla::controller::{ClusterStore, Context, Controller};
use flotilla::crd::{
    ManagedCluster, ManagedClusterSpec, ManagedClusterStatus, NodePool, Progress, ResourceKey,
    SecretRef,
};
use flotilla::event::{ClusterEvent, EventSink};
use flotilla::provider::{ClusterState, Provisioner};
use flotilla::queue::WorkQueue;
use flotilla::retry::BackoffPolicy;
use flotilla::source::ManualSource;
use flotilla::{Error, Result};

// ===========================================================================
// In-memory collaborators
// ===========================================================================

#[derive(Default)]
struct InMemoryStore {
    clusters: Mutex<HashMap<ResourceKey, ManagedCluster>>,
    history: Mutex<Vec<ManagedClusterStatus>>,
    conflicts_to_inject: Mutex<u32>,
}

impl InMemoryStore {
    fn insert(&self, cluster: ManagedCluster) {
        self.clusters
            .lock()
            .unwrap()
            .insert(cluster.key(), cluster);
    }

    fn inject_conflicts(&self, n: u32) {
        *self.conflicts_to_inject.lock().unwrap() = n;
    }

    fn history(&self) -> Vec<ManagedClusterStatus> {
        self.history.lock().unwrap().clone()
    }

    fn progress_of(&self, key: &ResourceKey) -> Option<Progress> {
        self.clusters
            .lock()
            .unwrap()
            .get(key)
            .and_then(|c| c.status.as_ref())
            .map(|s| s.progress)
    }
}

#[async_trait]
impl ClusterStore for InMemoryStore {
    async fn get(&self, key: &ResourceKey) -> Result<Option<ManagedCluster>> {
        Ok(self.clusters.lock().unwrap().get(key).cloned())
    }

    async fn update_status(
        &self,
        cluster: &ManagedCluster,
        status: ManagedClusterStatus,
    ) -> Result<()> {
        {
            let mut remaining = self.conflicts_to_inject.lock().unwrap();
            if *remaining > 0 {
                *remaining -= 1;
                return Err(Error::conflict("the object has been modified"));
            }
        }
        let mut clusters = self.clusters.lock().unwrap();
        let entry = clusters
            .get_mut(&cluster.key())
            .ok_or_else(|| Error::conflict("object is gone"))?;
        entry.status = Some(status.clone());
        self.history.lock().unwrap().push(status);
        Ok(())
    }
}

struct ScriptedProvisioner {
    id: String,
    create_failures_remaining: Mutex<u32>,
    create_calls: Mutex<u32>,
    state_calls: Mutex<u32>,
    states: Mutex<VecDeque<ClusterState>>,
}

impl ScriptedProvisioner {
    fn new(id: &str, states: Vec<ClusterState>) -> Self {
        Self {
            id: id.to_string(),
            create_failures_remaining: Mutex::new(0),
            create_calls: Mutex::new(0),
            state_calls: Mutex::new(0),
            states: Mutex::new(states.into_iter().collect()),
        }
    }

    fn fail_creates(self, n: u32) -> Self {
        *self.create_failures_remaining.lock().unwrap() = n;
        self
    }

    fn create_calls(&self) -> u32 {
        *self.create_calls.lock().unwrap()
    }

    fn state_calls(&self) -> u32 {
        *self.state_calls.lock().unwrap()
    }
}

#[async_trait]
impl Provisioner for ScriptedProvisioner {
    async fn create(&self, _cluster: &ManagedCluster) -> Result<String> {
        *self.create_calls.lock().unwrap() += 1;
        let mut failures = self.create_failures_remaining.lock().unwrap();
        if *failures > 0 {
            *failures -= 1;
            return Err(Error::provider("DOKS create failed: 503"));
        }
        Ok(self.id.clone())
    }

    async fn state(&self, _cluster: &ManagedCluster, _id: &str) -> Result<ClusterState> {
        *self.state_calls.lock().unwrap() += 1;
        let mut states = self.states.lock().unwrap();
        let state = if states.len() > 1 {
            states.pop_front().unwrap()
        } else {
            *states.front().unwrap()
        };
        Ok(state)
    }
}

#[derive(Default)]
struct RecordingSink {
    reasons: Mutex<Vec<&'static str>>,
}

impl RecordingSink {
    fn reasons(&self) -> Vec<&'static str> {
        self.reasons.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventSink for RecordingSink {
    async fn emit(&self, event: &ClusterEvent) {
        self.reasons.lock().unwrap().push(event.reason);
    }
}

// ===========================================================================
// Fixtures
// ===========================================================================

fn sample_cluster() -> ManagedCluster {
    let mut cluster = ManagedCluster::new(
        "demo",
        ManagedClusterSpec {
            name: "demo".to_string(),
            region: "nyc1".to_string(),
            version: "1.29".to_string(),
            token_secret: SecretRef {
                namespace: None,
                name: "do-token".to_string(),
            },
            node_pools: vec![NodePool {
                size: "s-2vcpu-4gb".to_string(),
                name: "pool-a".to_string(),
                count: 3,
            }],
        },
    );
    cluster.metadata.namespace = Some("team-a".to_string());
    cluster
}

fn key() -> ResourceKey {
    ResourceKey::new("team-a", "demo")
}

fn test_queue() -> Arc<WorkQueue<ResourceKey>> {
    Arc::new(WorkQueue::new(BackoffPolicy {
        base: Duration::from_secs(1),
        max: Duration::from_secs(30),
        multiplier: 2.0,
    }))
}

fn context(
    store: Arc<InMemoryStore>,
    provisioner: Arc<ScriptedProvisioner>,
    sink: Arc<RecordingSink>,
) -> Arc<Context> {
    Arc::new(
        Context::builder(store, provisioner)
            .sink(sink)
            .poll_interval(Duration::from_secs(10))
            .poll_timeout(Duration::from_secs(600))
            .build(),
    )
}

/// Run one worker against a synced source until `until` holds (or a large
/// virtual-time cap passes), then shut the queue down and join the loop.
async fn drive<F>(queue: Arc<WorkQueue<ResourceKey>>, ctx: Arc<Context>, until: F)
where
    F: Fn() -> bool,
{
    let controller = Controller::new(queue.clone(), ctx);
    let run = tokio::spawn(async move {
        let source = ManualSource::new();
        source.mark_synced();
        controller.run(&source, 1).await;
    });

    for _ in 0..10_000 {
        if until() {
            break;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    queue.shut_down();
    run.await.expect("worker loop should shut down cleanly");
}

// ===========================================================================
// Scenarios
// ===========================================================================

/// A fresh resource converges to running: exactly one create call, three
/// polls for the scripted provisioning/provisioning/running sequence, and
/// status transitions creating -> running observed by the store.
#[tokio::test(start_paused = true)]
async fn cluster_lifecycle_reaches_running() {
    let store = Arc::new(InMemoryStore::default());
    store.insert(sample_cluster());
    let provisioner = Arc::new(ScriptedProvisioner::new(
        "abc123",
        vec![
            ClusterState::Provisioning,
            ClusterState::Provisioning,
            ClusterState::Running,
        ],
    ));
    let sink = Arc::new(RecordingSink::default());

    let queue = test_queue();
    queue.add(key());

    let watch_store = store.clone();
    drive(queue.clone(), context(store.clone(), provisioner.clone(), sink.clone()), move || {
        watch_store.progress_of(&key()) == Some(Progress::Running)
    })
    .await;

    assert_eq!(provisioner.create_calls(), 1);
    assert_eq!(provisioner.state_calls(), 3);

    let history = store.history();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].cluster_id.as_deref(), Some("abc123"));
    assert_eq!(history[0].progress, Progress::Creating);
    assert_eq!(history[1].cluster_id.as_deref(), Some("abc123"));
    assert_eq!(history[1].progress, Progress::Running);

    assert_eq!(
        sink.reasons(),
        vec!["ClusterCreation", "ClusterCreationCompleted"]
    );
}

/// Duplicate notifications for a key queued before processing coalesce
/// into a single reconciliation pass.
#[tokio::test(start_paused = true)]
async fn duplicate_notifications_coalesce() {
    let store = Arc::new(InMemoryStore::default());
    store.insert(sample_cluster());
    let provisioner = Arc::new(ScriptedProvisioner::new(
        "abc123",
        vec![ClusterState::Running],
    ));
    let sink = Arc::new(RecordingSink::default());

    let queue = test_queue();
    queue.add(key());
    queue.add(key());
    queue.add(key());

    let watch_store = store.clone();
    drive(queue.clone(), context(store.clone(), provisioner.clone(), sink), move || {
        watch_store.progress_of(&key()) == Some(Progress::Running)
    })
    .await;

    assert_eq!(provisioner.create_calls(), 1);
    assert_eq!(store.history().len(), 2);
}

/// A provider that fails twice is retried with backoff until the create
/// lands; the key's failure count is reset after the successful pass.
#[tokio::test(start_paused = true)]
async fn transient_create_failures_retry_to_success() {
    let store = Arc::new(InMemoryStore::default());
    store.insert(sample_cluster());
    let provisioner = Arc::new(
        ScriptedProvisioner::new("abc123", vec![ClusterState::Running]).fail_creates(2),
    );
    let sink = Arc::new(RecordingSink::default());

    let queue = test_queue();
    queue.add(key());

    let watch_store = store.clone();
    drive(queue.clone(), context(store.clone(), provisioner.clone(), sink), move || {
        watch_store.progress_of(&key()) == Some(Progress::Running)
    })
    .await;

    assert_eq!(provisioner.create_calls(), 3);
    assert_eq!(store.progress_of(&key()), Some(Progress::Running));
    assert_eq!(queue.num_failures(&key()), 0);
}

/// An invalid spec is rejected before any provider call, marked failed,
/// reported as a warning event, and not retried.
#[tokio::test(start_paused = true)]
async fn invalid_spec_fails_terminally() {
    let mut invalid = sample_cluster();
    invalid.spec.node_pools.clear();

    let store = Arc::new(InMemoryStore::default());
    store.insert(invalid);
    let provisioner = Arc::new(ScriptedProvisioner::new("unused", vec![ClusterState::Running]));
    let sink = Arc::new(RecordingSink::default());

    let queue = test_queue();
    queue.add(key());

    let watch_store = store.clone();
    drive(queue.clone(), context(store.clone(), provisioner.clone(), sink.clone()), move || {
        watch_store.progress_of(&key()) == Some(Progress::Failed)
    })
    .await;

    assert_eq!(provisioner.create_calls(), 0);
    assert_eq!(store.history().len(), 1);
    assert_eq!(store.progress_of(&key()), Some(Progress::Failed));
    assert_eq!(sink.reasons(), vec!["SpecInvalid"]);
    assert_eq!(queue.num_failures(&key()), 0);
}

/// A conflicted status write is absorbed inside the pass: the reconciler
/// re-reads and retries, and the pass still converges.
#[tokio::test(start_paused = true)]
async fn conflicted_status_write_is_absorbed() {
    let store = Arc::new(InMemoryStore::default());
    store.insert(sample_cluster());
    store.inject_conflicts(1);
    let provisioner = Arc::new(ScriptedProvisioner::new(
        "abc123",
        vec![ClusterState::Running],
    ));
    let sink = Arc::new(RecordingSink::default());

    let queue = test_queue();
    queue.add(key());

    let watch_store = store.clone();
    drive(queue.clone(), context(store.clone(), provisioner.clone(), sink), move || {
        watch_store.progress_of(&key()) == Some(Progress::Running)
    })
    .await;

    assert_eq!(provisioner.create_calls(), 1);
    let history = store.history();
    assert_eq!(history.first().unwrap().progress, Progress::Creating);
    assert_eq!(history.last().unwrap().progress, Progress::Running);
}
