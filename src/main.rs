//! Flotilla Operator - managed DOKS cluster provisioning

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, CustomResourceExt};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use flotilla::controller::{Context, Controller, KubeClusterStore};
use flotilla::crd::{ManagedCluster, ResourceKey};
use flotilla::event::{KubeEventSink, LogSink};
use flotilla::provider::{DigitalOceanProvisioner, SecretTokenSource, DEFAULT_API_URL};
use flotilla::queue::WorkQueue;
use flotilla::retry::{retry_with_backoff, BackoffPolicy, RetryConfig};
use flotilla::source::WatchSource;

/// Flotilla - operator that provisions managed DOKS clusters from
/// ManagedCluster resources
#[derive(Parser, Debug)]
#[command(name = "flotilla", version, about, long_about = None)]
struct Cli {
    /// Generate the CRD manifest and exit
    #[arg(long)]
    crd: bool,

    /// Number of concurrent reconciliation workers
    #[arg(long, default_value_t = flotilla::DEFAULT_WORKERS)]
    workers: usize,

    /// Namespace to watch; all namespaces when unset
    #[arg(long)]
    namespace: Option<String>,

    /// Seconds between provider state polls
    #[arg(long, default_value_t = 10)]
    poll_interval_secs: u64,

    /// Wall-clock budget in seconds for one provisioning poll loop
    #[arg(long, default_value_t = 600)]
    poll_timeout_secs: u64,

    /// DigitalOcean API base URL
    #[arg(long, env = "DO_API_URL", default_value = DEFAULT_API_URL)]
    do_api_url: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&ManagedCluster::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    let client = Client::try_default().await?;

    // Registration is an explicit startup step, not an import-time side
    // effect: the CRD is applied before any watch or worker starts.
    ensure_crd_installed(&client).await?;

    let shutdown = CancellationToken::new();
    let queue = Arc::new(WorkQueue::<ResourceKey>::new(BackoffPolicy::default()));
    let source = WatchSource::spawn(client.clone(), queue.clone(), cli.namespace.as_deref());

    let store = Arc::new(KubeClusterStore::new(client.clone()));
    let tokens = Arc::new(SecretTokenSource::new(client.clone()));
    let provisioner = Arc::new(DigitalOceanProvisioner::with_base_url(
        tokens,
        &cli.do_api_url,
    ));

    let ctx = Arc::new(
        Context::builder(store, provisioner)
            .sink(Arc::new(LogSink))
            .sink(Arc::new(KubeEventSink::new(
                client.clone(),
                flotilla::COMPONENT,
            )))
            .poll_interval(Duration::from_secs(cli.poll_interval_secs))
            .poll_timeout(Duration::from_secs(cli.poll_timeout_secs))
            .shutdown(shutdown.clone())
            .build(),
    );

    // ctrl-c drains the queue and interrupts in-flight poll loops
    {
        let queue = queue.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("shutdown signal received");
                shutdown.cancel();
                queue.shut_down();
            }
        });
    }

    Controller::new(queue, ctx).run(&source, cli.workers).await;
    Ok(())
}

/// Install (or update) the ManagedCluster CRD via server-side apply.
///
/// Retried with backoff: at startup the API server may still be coming up.
async fn ensure_crd_installed(client: &Client) -> anyhow::Result<()> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(flotilla::COMPONENT).force();
    let patch = Patch::Apply(ManagedCluster::crd());

    tracing::info!("Installing ManagedCluster CRD...");
    retry_with_backoff(&RetryConfig::with_max_attempts(5), "install_crd", || {
        crds.patch("managedclusters.flotilla.dev", &params, &patch)
    })
    .await
    .map_err(|e| anyhow::anyhow!("Failed to install ManagedCluster CRD: {}", e))?;

    tracing::info!("ManagedCluster CRD installed/updated");
    Ok(())
}
