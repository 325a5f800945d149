//! Axum handlers for the management API.

use crate::AppState;
use crate::client::HttpClient;
use crate::errors::LaunchError;
use crate::router::{InferenceRequest, InferenceResponse};
use crate::selector::CostPreference;
use axum::{
    Json,
    body::Bytes,
    extract::State,
    http::StatusCode,
};
use serde::Deserialize;
use tracing::{info, instrument};

use crate::controller::StatusReport;

#[derive(Debug, Default, Deserialize)]
pub struct StartRequest {
    #[serde(default)]
    pub cost_preference: Option<CostPreference>,
}

/// `POST /start` — body is optional; an empty body uses the configured
/// default preference.
#[instrument(skip(state, body))]
pub async fn start<T: HttpClient + Clone>(
    State(state): State<AppState<T>>,
    body: Bytes,
) -> Result<Json<StatusReport>, (StatusCode, String)> {
    let request: StartRequest = if body.is_empty() {
        StartRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| (StatusCode::BAD_REQUEST, format!("invalid body: {e}")))?
    };

    let pref = request
        .cost_preference
        .unwrap_or(state.default_preference);
    info!(preference = ?pref, "Start requested");

    state
        .controller
        .start(pref)
        .await
        .map(Json)
        .map_err(|e| match e {
            LaunchError::PortUnavailable { .. } => (StatusCode::CONFLICT, e.to_string()),
            LaunchError::SpawnError { .. } => (StatusCode::BAD_GATEWAY, e.to_string()),
        })
}

/// `POST /stop`
#[instrument(skip(state))]
pub async fn stop<T: HttpClient + Clone>(State(state): State<AppState<T>>) -> Json<StatusReport> {
    info!("Stop requested");
    Json(state.controller.stop().await)
}

/// `GET /status`
#[instrument(skip(state))]
pub async fn status<T: HttpClient + Clone>(State(state): State<AppState<T>>) -> Json<StatusReport> {
    Json(state.controller.status().await)
}

/// `POST /infer` — always answers; degraded paths get the fallback.
#[instrument(skip(state, request))]
pub async fn infer<T: HttpClient + Clone + Send + Sync>(
    State(state): State<AppState<T>>,
    Json(request): Json<InferenceRequest>,
) -> Json<InferenceResponse> {
    Json(state.router.infer(request).await)
}
