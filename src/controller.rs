//! Upgrade controller: watches the ClusterVersion and the nodes, drives the
//! per-node extract and load jobs and requests the upgrade once every node
//! has the bundle loaded.

pub mod plan;
pub mod reconciler;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use k8s_openapi::api::core::v1::Node;
use kube::Api;
use kube::Resource;
use kube::api::{ApiResource, DynamicObject};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher;
use tracing::{debug, error, info, warn};

use crate::error::KbuError;
use crate::events::EventRecorder;
use crate::health::{self, HealthState};
use crate::k8s::KubeStore;
use crate::k8s::target::cluster_version_resource;
use crate::metrics::{self, Metrics};
use reconciler::{Outcome, Reconciler};

const REQUEUE_INTERVAL: Duration = Duration::from_secs(300);
const ERROR_REQUEUE_INTERVAL: Duration = Duration::from_secs(30);

/// Validated controller configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerSettings {
    pub namespace: String,
    /// Image of the kbu binary, used for jobs and the bundle server.
    pub image: String,
    pub target_name: String,
    pub agent_service_account: String,
    /// Host path the bundle is extracted into on every node.
    pub extract_dir: PathBuf,
    pub bundle_server_port: u16,
    pub runtime_unit: String,
}

/// Shared context for the controller.
pub struct Context {
    pub client: kube::Client,
    pub reconciler: Reconciler<KubeStore>,
    pub metrics: Arc<Metrics>,
    pub target_resource: ApiResource,
}

pub async fn reconcile(obj: Arc<DynamicObject>, ctx: Arc<Context>) -> Result<Action, KbuError> {
    let started = Instant::now();
    let result = ctx.reconciler.reconcile().await;
    let label = result.as_ref().map_or("error", Outcome::as_str);
    ctx.metrics.observe_reconcile(label, started.elapsed());

    let recorder = || EventRecorder::new(ctx.client.clone(), obj.object_ref(&ctx.target_resource));
    let outcome = match result {
        Ok(outcome) => outcome,
        Err(e) => {
            if !e.is_transient() {
                recorder()
                    .publish_warning("ReconcileFailed", &e.to_string())
                    .await;
            }
            return Err(e);
        }
    };

    match outcome {
        Outcome::UpgradeRequested { release } => {
            recorder()
                .publish(
                    "UpgradeRequested",
                    &format!("All nodes loaded the bundle, requested upgrade to {release}"),
                )
                .await;
            Ok(Action::await_change())
        }
        Outcome::UpgradeAlreadyRequested => Ok(Action::await_change()),
        Outcome::Progressing(classification) => {
            ctx.metrics.set_node_counts(&classification);
            Ok(Action::requeue(REQUEUE_INTERVAL))
        }
        Outcome::NoBundle => Ok(Action::requeue(REQUEUE_INTERVAL)),
    }
}

pub fn error_policy(obj: Arc<DynamicObject>, err: &KbuError, _ctx: Arc<Context>) -> Action {
    let name = obj.metadata.name.as_deref().unwrap_or("unknown");
    if err.is_transient() {
        warn!("Transient error reconciling {}, will retry: {}", name, err);
    } else {
        error!("Reconcile error for {}: {}", name, err);
    }
    Action::requeue(ERROR_REQUEUE_INTERVAL)
}

/// Run the controller until a shutdown signal arrives.
pub async fn run(settings: ControllerSettings, health_port: u16, metrics_port: u16) -> anyhow::Result<()> {
    let client = kube::Client::try_default().await?;
    info!("Connected to Kubernetes API server");

    let mut registry = prometheus_client::registry::Registry::default();
    let metrics = Arc::new(Metrics::new(&mut registry));
    let registry = Arc::new(registry);

    let health_state = HealthState::new();
    let health_state_clone = health_state.clone();
    tokio::spawn(async move {
        if let Err(e) = health::serve(health_port, health_state_clone).await {
            error!("Health server failed: {}", e);
        }
    });

    tokio::spawn(async move {
        if let Err(e) = metrics::serve(metrics_port, registry).await {
            error!("Metrics server failed: {}", e);
        }
    });

    let target_resource = cluster_version_resource();
    let target_name = settings.target_name.clone();
    let store = Arc::new(KubeStore::new(
        client.clone(),
        &settings.namespace,
        &settings.target_name,
    ));
    let ctx = Arc::new(Context {
        client: client.clone(),
        reconciler: Reconciler::new(store, settings),
        metrics,
        target_resource: target_resource.clone(),
    });

    let targets: Api<DynamicObject> = Api::all_with(client.clone(), &target_resource);
    let nodes: Api<Node> = Api::all(client);
    let target_ref = ObjectRef::new_with(&target_name, target_resource.clone());

    health_state.set_ready(true);

    info!(target = %target_name, "Starting upgrade controller");
    Controller::new_with(
        targets,
        watcher::Config::default().fields(&format!("metadata.name={target_name}")),
        target_resource,
    )
    .watches(nodes, watcher::Config::default(), move |_node| {
        Some(target_ref.clone())
    })
    .shutdown_on_signal()
    .run(reconcile, error_policy, ctx)
    .for_each(|res| async move {
        match res {
            Ok(o) => debug!("Reconciled: {:?}", o),
            Err(e) => warn!("Reconcile failed: {:?}", e),
        }
    })
    .await;

    info!("Controller stopped");
    Ok(())
}
