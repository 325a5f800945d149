//! Background health monitoring.
//!
//! A single poll task per managed server drives every [`HealthState`]
//! transition except the explicit stop. The poll loop probes `GET /health`
//! on a fixed cadence (faster while starting), watches for process exit,
//! and reports back to the controller when the server is beyond saving.

use crate::config::HealthConfig;
use crate::launcher::ServerHandle;
use crate::selector::ModelPlan;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock, watch};
use tracing::{debug, error, info, warn};
use url::Url;

/// Where a managed server is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Stopped,
    Starting,
    Healthy,
    Degraded,
    Failed,
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HealthState::Stopped => "stopped",
            HealthState::Starting => "starting",
            HealthState::Healthy => "healthy",
            HealthState::Degraded => "degraded",
            HealthState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// The read-mostly snapshot shared between the monitor, the controller
/// and the request router. Routers take read locks; only the monitor loop
/// and explicit stop write.
#[derive(Debug, Clone)]
pub struct Lifecycle {
    pub health: HealthState,
    pub plan: Option<ModelPlan>,
    pub endpoint: Option<Url>,
    pub started_at: Option<Instant>,
}

impl Lifecycle {
    pub fn stopped() -> Self {
        Self {
            health: HealthState::Stopped,
            plan: None,
            endpoint: None,
            started_at: None,
        }
    }
}

pub type SharedLifecycle = Arc<RwLock<Lifecycle>>;

pub fn new_shared() -> SharedLifecycle {
    Arc::new(RwLock::new(Lifecycle::stopped()))
}

/// Health probing abstraction. The production probe speaks HTTP; tests
/// script outcomes instead.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Returns Ok(true) for a ready server, Ok(false) for a reachable but
    /// unready one, Err for transport-level failures.
    async fn check(&self, base_url: &Url) -> Result<bool, String>;
}

/// Probes `GET {base_url}/health` with a bounded timeout.
#[derive(Debug)]
pub struct HttpHealthProbe {
    timeout: Duration,
}

impl HttpHealthProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn check(&self, base_url: &Url) -> Result<bool, String> {
        use http_body_util::Empty;

        let client: hyper_util::client::legacy::Client<_, Empty<bytes::Bytes>> =
            hyper_util::client::legacy::Client::builder(hyper_util::rt::TokioExecutor::new())
                .build_http();

        let url = base_url
            .join("health")
            .map_err(|e| format!("Invalid URL: {}", e))?;
        let uri: hyper::Uri = url
            .as_str()
            .parse()
            .map_err(|e| format!("Invalid URL: {}", e))?;

        let request = hyper::Request::builder()
            .method("GET")
            .uri(uri)
            .body(Empty::new())
            .map_err(|e| format!("Failed to build request: {}", e))?;

        let result = tokio::time::timeout(self.timeout, client.request(request)).await;

        match result {
            Ok(Ok(response)) => Ok(response.status().is_success()),
            Ok(Err(e)) => Err(format!("Request failed: {}", e)),
            Err(_) => Err("Health probe timeout".to_string()),
        }
    }
}

/// Why the poll loop returned.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum MonitorExit {
    /// Explicit stop requested; state is left for the stopper to settle.
    Shutdown,
    /// The server is gone. State has been set to `Failed`.
    Failed,
}

/// Everything one poll loop needs.
pub(crate) struct MonitorContext {
    pub shared: SharedLifecycle,
    pub server: Arc<Mutex<Option<ServerHandle>>>,
    pub probe: Arc<dyn HealthProbe>,
    pub config: HealthConfig,
    pub base_url: Url,
}

/// Run the poll loop until shutdown or failure.
///
/// Transition rules:
/// - `Starting` + first successful probe -> `Healthy`
/// - `Starting` past the startup timeout -> `Failed`
/// - `Healthy` + `degraded_after` consecutive failures -> `Degraded`
/// - `Degraded` + one success -> `Healthy`
/// - `Degraded` + `failed_after` consecutive failures -> `Failed`
/// - process exit observed in any state -> `Failed`
pub(crate) async fn run(ctx: &MonitorContext, shutdown: &mut watch::Receiver<bool>) -> MonitorExit {
    let mut consecutive_failures: u32 = 0;

    loop {
        let (health, started_at) = {
            let lifecycle = ctx.shared.read().await;
            (lifecycle.health, lifecycle.started_at)
        };

        let interval = if health == HealthState::Starting {
            ctx.config.starting_poll()
        } else {
            ctx.config.steady_poll()
        };

        tokio::select! {
            _ = shutdown.changed() => return MonitorExit::Shutdown,
            _ = tokio::time::sleep(interval) => {}
        }
        if *shutdown.borrow() {
            return MonitorExit::Shutdown;
        }

        // A dead process trumps whatever the probe would say.
        {
            let mut server = ctx.server.lock().await;
            if let Some(handle) = server.as_mut() {
                match handle.try_wait() {
                    Ok(Some(status)) => {
                        error!(status = %status, "Model server process exited");
                        set_health(&ctx.shared, HealthState::Failed).await;
                        return MonitorExit::Failed;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(error = %e, "Failed to check model server process status");
                    }
                }
            }
        }

        let probe_ok = match ctx.probe.check(&ctx.base_url).await {
            Ok(ready) => ready,
            Err(e) => {
                debug!(error = %e, "Health probe failed");
                false
            }
        };

        let health = ctx.shared.read().await.health;
        match (health, probe_ok) {
            (HealthState::Starting, true) => {
                info!(endpoint = %ctx.base_url, "Model server is ready");
                consecutive_failures = 0;
                set_health(&ctx.shared, HealthState::Healthy).await;
            }
            (HealthState::Starting, false) => {
                let elapsed = started_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed > ctx.config.startup_timeout() {
                    error!(
                        timeout_secs = ctx.config.startup_timeout_secs,
                        "Model server never became healthy"
                    );
                    set_health(&ctx.shared, HealthState::Failed).await;
                    return MonitorExit::Failed;
                }
            }
            (HealthState::Healthy, true) => {
                consecutive_failures = 0;
            }
            (HealthState::Healthy, false) => {
                consecutive_failures += 1;
                debug!(consecutive_failures, "Probe failed while healthy");
                if consecutive_failures >= ctx.config.degraded_after {
                    warn!(consecutive_failures, "Model server degraded");
                    consecutive_failures = 0;
                    set_health(&ctx.shared, HealthState::Degraded).await;
                }
            }
            (HealthState::Degraded, true) => {
                info!("Model server recovered");
                consecutive_failures = 0;
                set_health(&ctx.shared, HealthState::Healthy).await;
            }
            (HealthState::Degraded, false) => {
                consecutive_failures += 1;
                debug!(consecutive_failures, "Probe failed while degraded");
                if consecutive_failures >= ctx.config.failed_after {
                    error!("Model server failed to recover");
                    set_health(&ctx.shared, HealthState::Failed).await;
                    return MonitorExit::Failed;
                }
            }
            (HealthState::Stopped | HealthState::Failed, _) => {
                // The stopper got here first; nothing left to watch.
                return MonitorExit::Shutdown;
            }
        }
    }
}

async fn set_health(shared: &SharedLifecycle, health: HealthState) {
    shared.write().await.health = health;
}
