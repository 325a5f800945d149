//! Warden - adaptive lifecycle manager for local LLM model servers
//!
//! This library detects host hardware, selects a serving plan to match it,
//! launches and health-checks an external OpenAI-compatible model server,
//! and routes inference to it while it is healthy — falling back to a
//! deterministic zero-cost demo responder whenever it is not.

use axum::Router;
use axum::routing::{get, post};
use axum_prometheus::{
    GenericMetricLayer, Handle, PrometheusMetricLayerBuilder,
    metrics_exporter_prometheus::PrometheusHandle,
};
use std::borrow::Cow;
use std::sync::Arc;
use tracing::{info, instrument};

pub mod client;
pub mod config;
pub mod controller;
pub mod errors;
pub mod handlers;
pub mod launcher;
pub mod monitor;
pub mod profile;
pub mod router;
pub mod selector;

use client::{HttpClient, HyperClient};
use config::Config;
use controller::LifecycleController;
use router::RequestRouter;
use selector::CostPreference;

/// The main application state shared by all handlers.
#[derive(Clone)]
pub struct AppState<T: HttpClient + Clone> {
    pub controller: LifecycleController,
    pub router: Arc<RequestRouter<T>>,
    pub default_preference: CostPreference,
}

impl AppState<HyperClient> {
    /// Create the production state: one controller and a router sharing
    /// its lifecycle snapshot, over the default hyper client.
    pub fn new(config: Config) -> Self {
        let http_client = client::create_hyper_client();
        Self::with_client(config, http_client)
    }
}

impl<T: HttpClient + Clone + Send + Sync> AppState<T> {
    /// Create state with a custom HTTP client (useful for testing).
    pub fn with_client(config: Config, http_client: T) -> Self {
        let default_preference = config.cost_preference;
        let routing = config.routing.clone();
        let controller = LifecycleController::new(config);
        let router = Arc::new(RequestRouter::new(
            controller.shared(),
            http_client,
            &routing,
        ));
        Self {
            controller,
            router,
            default_preference,
        }
    }
}

/// Build the management API router:
/// - `POST /start` / `POST /stop` — lifecycle operations
/// - `GET /status` — live state, plan and uptime
/// - `POST /infer` — inference, with automatic fallback
#[instrument(skip(state))]
pub fn build_router<T: HttpClient + Clone + Send + Sync + 'static>(state: AppState<T>) -> Router {
    info!("Building router");
    Router::new()
        .route("/start", post(handlers::start))
        .route("/stop", post(handlers::stop))
        .route("/status", get(handlers::status))
        .route("/infer", post(handlers::infer))
        .with_state(state)
}

/// Builds a router for the metrics endpoint.
#[instrument(skip(handle))]
pub fn build_metrics_router(handle: PrometheusHandle) -> Router {
    info!("Building metrics router");
    Router::new().route(
        "/metrics",
        axum::routing::get(move || async move { handle.render() }),
    )
}

type MetricsLayerAndHandle = (
    GenericMetricLayer<'static, PrometheusHandle, Handle>,
    PrometheusHandle,
);

/// Builds a layer and handle for prometheus metrics collection.
pub fn build_metrics_layer_and_handle(
    prefix: impl Into<Cow<'static, str>>,
) -> MetricsLayerAndHandle {
    info!("Building metrics layer");
    PrometheusMetricLayerBuilder::new()
        .with_prefix(prefix)
        .enable_response_body_size(true)
        .with_endpoint_label_type(axum_prometheus::EndpointLabel::Exact)
        .with_default_metrics()
        .build_pair()
}
