//! DigitalOcean Kubernetes (DOKS) provisioner
//!
//! Thin client over the DOKS REST API:
//! <https://docs.digitalocean.com/reference/api/api-reference/#tag/Kubernetes>
//!
//! The API token is resolved from the Kubernetes Secret referenced by the
//! ManagedCluster spec on every call, so rotating the secret takes effect
//! on the next reconciliation pass without restarting the operator.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::{Api, Client};
use serde::{Deserialize, Serialize};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use super::ClusterState;
use crate::crd::{ManagedCluster, NodePool, SecretRef};
use crate::{Error, Result};

/// Production DOKS API endpoint
pub const DEFAULT_API_URL: &str = "https://api.digitalocean.com";

/// Key inside the referenced Secret that holds the API token
const TOKEN_KEY: &str = "token";

/// Resolves a provider API token from a credential reference
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// Fetch the token for the given secret reference.
    ///
    /// `fallback_namespace` is the owning resource's namespace, used when
    /// the reference does not name one.
    async fn token(&self, secret: &SecretRef, fallback_namespace: &str) -> Result<String>;
}

/// Token source backed by Kubernetes Secrets (`data["token"]`)
pub struct SecretTokenSource {
    client: Client,
}

impl SecretTokenSource {
    /// Create a token source reading Secrets through the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl TokenSource for SecretTokenSource {
    async fn token(&self, secret: &SecretRef, fallback_namespace: &str) -> Result<String> {
        let namespace = secret.namespace_or(fallback_namespace);
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let found = api.get(&secret.name).await?;

        let data = found
            .data
            .and_then(|mut d| d.remove(TOKEN_KEY))
            .ok_or_else(|| {
                Error::provider(format!(
                    "secret {namespace}/{} has no {TOKEN_KEY:?} key",
                    secret.name
                ))
            })?;

        String::from_utf8(data.0).map_err(|_| {
            Error::provider(format!(
                "secret {namespace}/{} holds a non-UTF-8 token",
                secret.name
            ))
        })
    }
}

#[derive(Serialize)]
struct NodePoolRequest<'a> {
    size: &'a str,
    name: &'a str,
    count: u32,
}

impl<'a> From<&'a NodePool> for NodePoolRequest<'a> {
    fn from(pool: &'a NodePool) -> Self {
        Self {
            size: &pool.size,
            name: &pool.name,
            count: pool.count,
        }
    }
}

#[derive(Serialize)]
struct CreateClusterRequest<'a> {
    name: &'a str,
    region: &'a str,
    version: &'a str,
    node_pools: Vec<NodePoolRequest<'a>>,
}

#[derive(Deserialize)]
struct ClusterStatusBody {
    state: ClusterState,
}

#[derive(Deserialize)]
struct ClusterBody {
    id: String,
    status: ClusterStatusBody,
}

#[derive(Deserialize)]
struct ClusterEnvelope {
    kubernetes_cluster: ClusterBody,
}

#[derive(Deserialize)]
struct ApiErrorBody {
    message: String,
}

/// DOKS-backed [`Provisioner`](super::Provisioner) implementation
pub struct DigitalOceanProvisioner {
    http: reqwest::Client,
    tokens: std::sync::Arc<dyn TokenSource>,
    base_url: String,
}

impl DigitalOceanProvisioner {
    /// Create a provisioner against the production DOKS endpoint
    pub fn new(tokens: std::sync::Arc<dyn TokenSource>) -> Self {
        Self::with_base_url(tokens, DEFAULT_API_URL)
    }

    /// Create a provisioner against a custom endpoint (tests, proxies)
    pub fn with_base_url(
        tokens: std::sync::Arc<dyn TokenSource>,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            tokens,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    async fn resolve_token(&self, cluster: &ManagedCluster) -> Result<String> {
        let namespace = cluster.key().namespace;
        self.tokens
            .token(&cluster.spec.token_secret, &namespace)
            .await
    }

    /// Turn a non-success DOKS response into a provider error carrying the
    /// API's own message where one is present.
    async fn api_error(operation: &str, response: reqwest::Response) -> Error {
        let status = response.status();
        let message = match response.json::<ApiErrorBody>().await {
            Ok(body) => body.message,
            Err(_) => "no error body".to_string(),
        };
        Error::provider(format!("DOKS {operation} failed: {status}: {message}"))
    }
}

#[async_trait]
impl super::Provisioner for DigitalOceanProvisioner {
    async fn create(&self, cluster: &ManagedCluster) -> Result<String> {
        let token = self.resolve_token(cluster).await?;
        let spec = &cluster.spec;

        let request = CreateClusterRequest {
            name: &spec.name,
            region: &spec.region,
            version: &spec.version,
            node_pools: spec.node_pools.iter().map(Into::into).collect(),
        };

        let response = self
            .http
            .post(format!("{}/v2/kubernetes/clusters", self.base_url))
            .bearer_auth(&token)
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::provider(format!("DOKS create request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(Self::api_error("create", response).await);
        }

        let envelope: ClusterEnvelope = response
            .json()
            .await
            .map_err(|e| Error::provider(format!("DOKS create response unreadable: {e}")))?;

        debug!(
            cluster = %cluster.key(),
            id = %envelope.kubernetes_cluster.id,
            "DOKS create accepted"
        );
        Ok(envelope.kubernetes_cluster.id)
    }

    async fn state(&self, cluster: &ManagedCluster, id: &str) -> Result<ClusterState> {
        let token = self.resolve_token(cluster).await?;

        let response = self
            .http
            .get(format!("{}/v2/kubernetes/clusters/{id}", self.base_url))
            .bearer_auth(&token)
            .send()
            .await
            .map_err(|e| Error::provider(format!("DOKS get request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(Self::api_error("get", response).await);
        }

        let envelope: ClusterEnvelope = response
            .json()
            .await
            .map_err(|e| Error::provider(format!("DOKS get response unreadable: {e}")))?;

        Ok(envelope.kubernetes_cluster.status.state)
    }
}
