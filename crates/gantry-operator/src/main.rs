//! The Gantry operator binary
//!
//! Wires the watch streams into the cluster state projection, starts the
//! lifecycle and termination controllers, and runs the provisioning,
//! garbage-collection and disruption loops.

use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{ConfigMap, Node, Pod};
use kube::api::Api;
use kube::runtime::{controller::Controller, watcher};
use kube::Client;
use tracing::{info, warn};

use gantry_cloud::{fake::FakeCloudProvider, CloudProvider, UnavailableOfferings};
use gantry_common::crd::NodeClaim;
use gantry_common::events::KubeEventPublisher;
use gantry_common::settings::SETTINGS_CONFIG_MAP;
use gantry_common::telemetry::{init_telemetry, TelemetryConfig};
use gantry_common::Settings;
use gantry_provisioner::{batcher, BatchHandle, KubeProvisionerClient, Provisioner};
use gantry_state::Cluster;

mod watches;

/// Command line arguments
#[derive(Parser, Debug)]
#[command(name = "gantry", about = "Just-in-time node provisioning for Kubernetes")]
struct Args {
    /// Namespace holding the operator's settings ConfigMap
    #[arg(long, env = "GANTRY_NAMESPACE", default_value = "gantry-system")]
    namespace: String,

    /// Cloud provider adapter to use ("fake" runs the in-memory provider)
    #[arg(long, env = "GANTRY_CLOUD_PROVIDER", default_value = "fake")]
    cloud_provider: String,

    /// OTLP endpoint for traces and metrics
    #[arg(long, env = "OTEL_EXPORTER_OTLP_ENDPOINT")]
    otlp_endpoint: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_telemetry(TelemetryConfig {
        service_name: "gantry-operator".to_string(),
        otlp_endpoint: args.otlp_endpoint.clone(),
    })
    .context("initializing telemetry")?;

    let client = Client::try_default()
        .await
        .context("building kube client")?;

    // settings are process-fatal at startup, never at runtime
    let settings = load_settings(&client, &args.namespace).await?;
    info!(
        cluster = %settings.cluster_name,
        batch_idle_ms = settings.batch_idle_duration.as_millis(),
        batch_max_ms = settings.batch_max_duration.as_millis(),
        "Loaded settings"
    );

    let cloud = build_cloud_provider(&args.cloud_provider)?;
    let cluster = Arc::new(Cluster::new());
    let unavailable = Arc::new(UnavailableOfferings::default());

    let (batch_handle, batch) = batcher(
        settings.batch_idle_duration,
        settings.batch_max_duration,
    );

    // watch streams feed the state projection and the batcher
    spawn_watches(&client, cluster.clone(), batch_handle.clone());

    // a slow nudge so unschedulable pods are retried even without fresh
    // watch events (e.g. after a failed pass or an offerings-cache expiry)
    tokio::spawn({
        let batch_handle = batch_handle.clone();
        async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(30));
            loop {
                interval.tick().await;
                batch_handle.trigger();
            }
        }
    });

    let provisioner = Provisioner::new(
        Arc::new(KubeProvisionerClient::new(client.clone())),
        cloud.clone(),
        cluster.clone(),
        unavailable.clone(),
        Arc::new(KubeEventPublisher::new(client.clone(), "gantry-provisioner")),
    );

    let lifecycle_client: Arc<dyn gantry_lifecycle::LifecycleClient> =
        Arc::new(gantry_lifecycle::KubeLifecycleClient::new(client.clone()));
    let lifecycle_ctx = Arc::new(gantry_lifecycle::Context {
        launch: gantry_lifecycle::Launch::new(
            cloud.clone(),
            lifecycle_client.clone(),
            unavailable.clone(),
            Arc::new(KubeEventPublisher::new(client.clone(), "gantry-lifecycle")),
        ),
        registration: gantry_lifecycle::Registration::new(lifecycle_client.clone()),
        initialization: gantry_lifecycle::Initialization::new(lifecycle_client.clone()),
        liveness: gantry_lifecycle::Liveness::new(lifecycle_client.clone()),
        marking: gantry_lifecycle::Marking::new(
            cloud.clone(),
            lifecycle_client.clone(),
            settings.drift_enabled,
        ),
        client: lifecycle_client.clone(),
    });

    let gc = gantry_lifecycle::GarbageCollector::new(
        cloud.clone(),
        lifecycle_client,
        settings.ttl_after_not_registered,
    );

    let termination_nodes: Arc<dyn gantry_termination::TerminationClient> =
        Arc::new(gantry_termination::KubeTerminationClient::new(client.clone()));
    let termination_ctx = Arc::new(gantry_termination::Context {
        terminator: gantry_termination::Terminator::new(
            termination_nodes.clone(),
            Arc::new(gantry_termination::EvictionQueue::new(
                Arc::new(gantry_termination::KubeEvictionClient::new(client.clone())),
                Arc::new(KubeEventPublisher::new(client.clone(), "gantry-termination")),
            )),
        ),
        nodes: termination_nodes,
        claims: Arc::new(gantry_termination::KubeTerminationClaimClient::new(
            client.clone(),
        )),
        cloud: cloud.clone(),
    });

    let planner = gantry_disruption::Planner::new(
        Arc::new(gantry_disruption::KubeDisruptionClient::new(client.clone())),
        cloud.clone(),
        cluster.clone(),
        Arc::new(KubeEventPublisher::new(client.clone(), "gantry-disruption")),
    );

    let claims: Api<NodeClaim> = Api::all(client.clone());
    let lifecycle_controller = Controller::new(claims.clone(), watcher::Config::default())
        .shutdown_on_signal()
        .run(
            gantry_lifecycle::reconcile,
            gantry_lifecycle::error_policy,
            lifecycle_ctx,
        )
        .for_each(|result| async move {
            if let Err(e) = result {
                warn!(error = %e, "Lifecycle reconcile failed");
            }
        });

    let termination_controller = Controller::new(claims, watcher::Config::default())
        .shutdown_on_signal()
        .run(
            gantry_termination::reconcile,
            gantry_termination::error_policy,
            termination_ctx,
        )
        .for_each(|result| async move {
            if let Err(e) = result {
                warn!(error = %e, "Termination reconcile failed");
            }
        });

    info!("Starting controllers");
    tokio::select! {
        _ = lifecycle_controller => {}
        _ = termination_controller => {}
        _ = provisioner.run(batch) => {}
        _ = gc.run() => {}
        _ = planner.run() => {}
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
    }
    Ok(())
}

/// Read and validate the settings ConfigMap; any failure aborts startup
async fn load_settings(client: &Client, namespace: &str) -> anyhow::Result<Settings> {
    let api: Api<ConfigMap> = Api::namespaced(client.clone(), namespace);
    let cm = api
        .get(SETTINGS_CONFIG_MAP)
        .await
        .with_context(|| format!("reading ConfigMap {namespace}/{SETTINGS_CONFIG_MAP}"))?;
    Settings::from_config_map(&cm).context("parsing settings")
}

/// Resolve the configured cloud provider adapter
fn build_cloud_provider(name: &str) -> anyhow::Result<Arc<dyn CloudProvider>> {
    match name {
        "fake" => Ok(Arc::new(FakeCloudProvider::with_default_catalog())),
        other => anyhow::bail!(
            "unknown cloud provider {other:?}; link an adapter crate and register it here"
        ),
    }
}

/// Start the pod, node and claim watch tasks
fn spawn_watches(client: &Client, cluster: Arc<Cluster>, batch: BatchHandle) {
    let pods: Api<Pod> = Api::all(client.clone());
    let nodes: Api<Node> = Api::all(client.clone());
    let claims: Api<NodeClaim> = Api::all(client.clone());

    tokio::spawn(watches::watch_pods(pods, cluster.clone(), batch));
    tokio::spawn(watches::watch_nodes(nodes, cluster.clone()));
    tokio::spawn(watches::watch_claims(claims, cluster));
}
