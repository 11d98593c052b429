//! Operator events.
//!
//! The reconciler reports discrete named events (creation started, creation
//! completed, spec rejected, ...) through the narrow [`EventSink`] trait.
//! Two independent backends are composed at startup: [`LogSink`] writes
//! events to the tracing log, [`KubeEventSink`] posts core/v1 Events against
//! the owning ManagedCluster so operators see them in `kubectl describe`.
//!
//! Events are observability, not correctness: a sink that fails to deliver
//! logs the failure and the reconciliation pass proceeds.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::core::v1::{Event, EventSource, ObjectReference};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, Time};
use kube::api::{Api, ObjectMeta, PostParams};
use kube::Client;
use tracing::{info, warn};

#[cfg(test)]
use mockall::automock;

use crate::crd::ResourceKey;

/// Event reason: the provider create call was issued
pub const REASON_CREATION: &str = "ClusterCreation";
/// Event reason: provisioning completed and the cluster is running
pub const REASON_CREATION_COMPLETED: &str = "ClusterCreationCompleted";
/// Event reason: the spec failed validation
pub const REASON_SPEC_INVALID: &str = "SpecInvalid";
/// Event reason: provisioning failed or timed out
pub const REASON_PROVISION_FAILED: &str = "ProvisionFailed";

/// Severity of an operator event
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventSeverity {
    /// Routine lifecycle progress
    Normal,
    /// Something an operator should look at
    Warning,
}

impl EventSeverity {
    fn as_k8s_type(self) -> &'static str {
        match self {
            Self::Normal => "Normal",
            Self::Warning => "Warning",
        }
    }
}

/// A discrete, named event about one ManagedCluster
#[derive(Clone, Debug)]
pub struct ClusterEvent {
    /// The resource the event is about
    pub key: ResourceKey,
    /// Machine-readable reason code (one of the `REASON_*` constants)
    pub reason: &'static str,
    /// Short human-readable message
    pub message: String,
    /// Severity
    pub severity: EventSeverity,
}

impl ClusterEvent {
    /// A normal-severity event
    pub fn normal(key: ResourceKey, reason: &'static str, message: impl Into<String>) -> Self {
        Self {
            key,
            reason,
            message: message.into(),
            severity: EventSeverity::Normal,
        }
    }

    /// A warning-severity event
    pub fn warning(key: ResourceKey, reason: &'static str, message: impl Into<String>) -> Self {
        Self {
            key,
            reason,
            message: message.into(),
            severity: EventSeverity::Warning,
        }
    }
}

/// One-way sink for operator events
#[cfg_attr(test, automock)]
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Deliver one event. Must not fail the caller: delivery problems are
    /// the sink's to log.
    async fn emit(&self, event: &ClusterEvent);
}

/// Deliver an event to every configured sink
pub async fn broadcast(sinks: &[Arc<dyn EventSink>], event: &ClusterEvent) {
    for sink in sinks {
        sink.emit(event).await;
    }
}

/// Sink that writes events to the tracing log
#[derive(Clone, Copy, Debug, Default)]
pub struct LogSink;

#[async_trait]
impl EventSink for LogSink {
    async fn emit(&self, event: &ClusterEvent) {
        match event.severity {
            EventSeverity::Normal => info!(
                cluster = %event.key,
                reason = event.reason,
                "{}", event.message
            ),
            EventSeverity::Warning => warn!(
                cluster = %event.key,
                reason = event.reason,
                "{}", event.message
            ),
        }
    }
}

/// Sink that posts core/v1 Events against the ManagedCluster resource
pub struct KubeEventSink {
    client: Client,
    component: String,
}

impl KubeEventSink {
    /// Create a sink reporting as the given component name
    pub fn new(client: Client, component: impl Into<String>) -> Self {
        Self {
            client,
            component: component.into(),
        }
    }

    fn build_event(&self, event: &ClusterEvent) -> Event {
        let now = Utc::now();
        Event {
            metadata: ObjectMeta {
                namespace: Some(event.key.namespace.clone()),
                generate_name: Some(format!("{}.", event.key.name)),
                ..Default::default()
            },
            involved_object: ObjectReference {
                api_version: Some("flotilla.dev/v1alpha1".to_string()),
                kind: Some("ManagedCluster".to_string()),
                namespace: Some(event.key.namespace.clone()),
                name: Some(event.key.name.clone()),
                ..Default::default()
            },
            reason: Some(event.reason.to_string()),
            message: Some(event.message.clone()),
            type_: Some(event.severity.as_k8s_type().to_string()),
            source: Some(EventSource {
                component: Some(self.component.clone()),
                ..Default::default()
            }),
            first_timestamp: Some(Time(now)),
            last_timestamp: Some(Time(now)),
            event_time: Some(MicroTime(now)),
            count: Some(1),
            ..Default::default()
        }
    }
}

#[async_trait]
impl EventSink for KubeEventSink {
    async fn emit(&self, event: &ClusterEvent) {
        let api: Api<Event> = Api::namespaced(self.client.clone(), &event.key.namespace);
        let body = self.build_event(event);
        if let Err(e) = api.create(&PostParams::default(), &body).await {
            warn!(
                cluster = %event.key,
                reason = event.reason,
                error = %e,
                "failed to post event"
            );
        }
    }
}
