//! Prometheus metrics for the kbu controller.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;

use crate::controller::plan::Classification;
use crate::k8s::node::NodeState;

/// Labels for reconcile metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ReconcileLabels {
    pub result: String,
}

/// Labels for per-state node counts.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct NodeStateLabels {
    pub state: String,
}

pub struct Metrics {
    pub reconcile_total: Family<ReconcileLabels, Counter>,
    pub reconcile_duration_seconds: Histogram,
    pub nodes: Family<NodeStateLabels, Gauge>,
}

const RECONCILE_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

impl Metrics {
    /// Create and register all metrics with the given registry.
    pub fn new(registry: &mut Registry) -> Self {
        let reconcile_total = Family::<ReconcileLabels, Counter>::default();
        registry.register(
            "kbu_reconcile",
            "Total number of reconcile passes by result",
            reconcile_total.clone(),
        );

        let reconcile_duration_seconds = Histogram::new(RECONCILE_BUCKETS.iter().copied());
        registry.register(
            "kbu_reconcile_duration_seconds",
            "Duration of reconcile passes in seconds",
            reconcile_duration_seconds.clone(),
        );

        let nodes = Family::<NodeStateLabels, Gauge>::default();
        registry.register(
            "kbu_nodes",
            "Nodes per bundle rollout state at the last reconcile",
            nodes.clone(),
        );

        Self {
            reconcile_total,
            reconcile_duration_seconds,
            nodes,
        }
    }

    pub fn observe_reconcile(&self, result: &str, duration: Duration) {
        self.reconcile_total
            .get_or_create(&ReconcileLabels {
                result: result.to_string(),
            })
            .inc();
        self.reconcile_duration_seconds
            .observe(duration.as_secs_f64());
    }

    pub fn set_node_counts(&self, classification: &Classification) {
        for (state, count) in [
            (NodeState::NeedsExtraction, classification.needs_extraction.len()),
            (NodeState::NeedsLoad, classification.needs_load.len()),
            (NodeState::Ready, classification.ready.len()),
        ] {
            self.nodes
                .get_or_create(&NodeStateLabels {
                    state: state.as_str().to_string(),
                })
                .set(i64::try_from(count).unwrap_or(i64::MAX));
        }
    }
}

/// Axum handler that encodes the registry as OpenMetrics text.
async fn metrics_handler(State(registry): State<Arc<Registry>>) -> impl IntoResponse {
    let mut buf = String::new();
    if encode(&mut buf, &registry).is_err() {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to encode metrics".to_string(),
        );
    }
    (StatusCode::OK, buf)
}

/// Start the metrics server on the given port.
pub async fn serve(port: u16, registry: Arc<Registry>) -> anyhow::Result<()> {
    use axum::Router;
    use axum::routing::get;
    use tokio::net::TcpListener;
    use tracing::info;

    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(registry);

    let listener = TcpListener::bind(format!("0.0.0.0:{}", port)).await?;
    info!("Metrics server listening on port {}", port);
    axum::serve(listener, app).await?;
    Ok(())
}
