//! Lifecycle orchestration.
//!
//! [`LifecycleController`] owns the start/stop/status surface, the single
//! server slot, and the supervisor task that pairs the health monitor
//! with a bounded restart policy. It is cheap to clone and safe to use
//! from any number of tasks; all operations may overlap with in-flight
//! inference calls.

use crate::config::Config;
use crate::errors::LaunchError;
use crate::launcher::{ServerHandle, ServerLauncher};
use crate::monitor::{
    self, HealthProbe, HealthState, HttpHealthProbe, MonitorContext, MonitorExit, SharedLifecycle,
};
use crate::profile::{HardwareProfiler, SystemProfile};
use crate::selector::{self, CostPreference, ModelPlan};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tracing::{debug, error, info, warn};
use url::Url;

/// Snapshot returned by `status()`, always recomputed from memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub state: HealthState,
    pub plan: Option<ModelPlan>,
    pub uptime_secs: Option<u64>,
}

struct Supervisor {
    shutdown_tx: watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
}

struct ControllerInner {
    config: Config,
    profiler: HardwareProfiler,
    launcher: ServerLauncher,
    probe: Arc<dyn HealthProbe>,
    shared: SharedLifecycle,
    server: Arc<Mutex<Option<ServerHandle>>>,
    supervisor: Mutex<Option<Supervisor>>,
}

#[derive(Clone)]
pub struct LifecycleController {
    inner: Arc<ControllerInner>,
}

impl LifecycleController {
    pub fn new(config: Config) -> Self {
        let probe: Arc<dyn HealthProbe> =
            Arc::new(HttpHealthProbe::new(config.health.probe_timeout()));
        let launcher = ServerLauncher::new(config.server.clone());
        Self {
            inner: Arc::new(ControllerInner {
                config,
                profiler: HardwareProfiler::new(),
                launcher,
                probe,
                shared: monitor::new_shared(),
                server: Arc::new(Mutex::new(None)),
                supervisor: Mutex::new(None),
            }),
        }
    }

    /// The shared lifecycle snapshot, for wiring up a request router.
    pub fn shared(&self) -> SharedLifecycle {
        self.inner.shared.clone()
    }

    /// Detect hardware, pick a plan and launch the server.
    ///
    /// Idempotent: a second call while a server is active returns the
    /// current status untouched. Probe failures are not fatal; the
    /// selector falls back to a conservative CPU profile.
    pub async fn start(&self, pref: CostPreference) -> Result<StatusReport, LaunchError> {
        let mut server = self.inner.server.lock().await;
        if server.is_some() {
            debug!("Model server already active, start is a no-op");
            drop(server);
            return Ok(self.status().await);
        }

        let profile = match self.inner.profiler.detect() {
            Ok(profile) => profile,
            Err(e) => {
                warn!(error = %e, "Hardware probe failed, using conservative profile");
                SystemProfile::conservative()
            }
        };

        let plan = selector::select(&profile, pref, &self.inner.config.tiers);
        info!(
            model = %plan.model_id,
            device = ?plan.device,
            context = plan.max_context_tokens,
            "Selected model plan"
        );

        let handle = self.inner.launcher.launch(&plan).await?;
        let base_url = handle.base_url();
        let started_at = handle.started_at;
        *server = Some(handle);

        {
            let mut lifecycle = self.inner.shared.write().await;
            lifecycle.health = HealthState::Starting;
            lifecycle.plan = Some(plan.clone());
            lifecycle.endpoint = Some(base_url.clone());
            lifecycle.started_at = Some(started_at);
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(supervise(
            Arc::clone(&self.inner),
            plan,
            base_url,
            shutdown_rx,
        ));

        let mut supervisor = self.inner.supervisor.lock().await;
        if let Some(old) = supervisor.take() {
            // A previous lifecycle ended in Failed; its supervisor has
            // already returned, this just drops the handle.
            let _ = old.shutdown_tx.send(true);
            old.task.abort();
        }
        *supervisor = Some(Supervisor { shutdown_tx, task });
        drop(supervisor);
        drop(server);

        Ok(self.status().await)
    }

    /// Stop the server and the monitor. Idempotent; in-flight inference
    /// calls are left to complete or time out on their own.
    pub async fn stop(&self) -> StatusReport {
        if let Some(supervisor) = self.inner.supervisor.lock().await.take() {
            let _ = supervisor.shutdown_tx.send(true);
            // The monitor wakes on the signal, so this resolves quickly;
            // the timeout is a backstop against a wedged probe.
            if tokio::time::timeout(Duration::from_secs(5), supervisor.task)
                .await
                .is_err()
            {
                warn!("Supervisor did not wind down in time");
            }
        }

        if let Some(handle) = self.inner.server.lock().await.take() {
            self.inner.launcher.stop(handle).await;
        }

        {
            let mut lifecycle = self.inner.shared.write().await;
            lifecycle.health = HealthState::Stopped;
            lifecycle.plan = None;
            lifecycle.endpoint = None;
            lifecycle.started_at = None;
        }

        info!("Lifecycle stopped");
        self.status().await
    }

    pub async fn status(&self) -> StatusReport {
        let lifecycle = self.inner.shared.read().await;
        StatusReport {
            state: lifecycle.health,
            plan: lifecycle.plan.clone(),
            uptime_secs: lifecycle.started_at.map(|t| t.elapsed().as_secs()),
        }
    }
}

/// Drive the monitor, relaunching after failures until the restart budget
/// is spent.
async fn supervise(
    inner: Arc<ControllerInner>,
    plan: ModelPlan,
    base_url: Url,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut restarts: u32 = 0;

    loop {
        let ctx = MonitorContext {
            shared: inner.shared.clone(),
            server: Arc::clone(&inner.server),
            probe: Arc::clone(&inner.probe),
            config: inner.config.health.clone(),
            base_url: base_url.clone(),
        };

        match monitor::run(&ctx, &mut shutdown).await {
            MonitorExit::Shutdown => break,
            MonitorExit::Failed => {
                // Reap whatever is left of the process before deciding
                // whether to try again.
                if let Some(handle) = inner.server.lock().await.take() {
                    inner.launcher.stop(handle).await;
                }

                if *shutdown.borrow() {
                    break;
                }
                if restarts >= inner.config.health.max_restarts {
                    error!(
                        restarts,
                        "Model server failed and restart budget is spent, fallback only"
                    );
                    break;
                }

                restarts += 1;
                warn!(attempt = restarts, "Restarting model server");

                let mut server = inner.server.lock().await;
                if *shutdown.borrow() {
                    break;
                }
                match inner.launcher.launch(&plan).await {
                    Ok(handle) => {
                        let started_at = handle.started_at;
                        *server = Some(handle);
                        drop(server);

                        let mut lifecycle = inner.shared.write().await;
                        lifecycle.health = HealthState::Starting;
                        lifecycle.started_at = Some(started_at);
                    }
                    Err(e) => {
                        error!(error = %e, "Restart failed");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, ServerConfig};

    fn unstartable_config() -> Config {
        Config {
            server: ServerConfig {
                serve_command: "definitely-not-a-real-serve-binary".to_string(),
                bind_host: "127.0.0.1".to_string(),
                bind_port: 0,
                ..ServerConfig::default()
            },
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn status_before_start_is_stopped() {
        let controller = LifecycleController::new(unstartable_config());
        let status = controller.status().await;
        assert_eq!(status.state, HealthState::Stopped);
        assert!(status.plan.is_none());
        assert!(status.uptime_secs.is_none());
    }

    #[tokio::test]
    async fn failed_spawn_surfaces_error_and_leaves_state_stopped() {
        let controller = LifecycleController::new(unstartable_config());
        let err = controller.start(CostPreference::FreeOnly).await.unwrap_err();
        assert!(matches!(err, LaunchError::SpawnError { .. }));

        let status = controller.status().await;
        assert_eq!(status.state, HealthState::Stopped);
        assert!(status.plan.is_none());
    }

    #[tokio::test]
    async fn stop_without_start_is_a_no_op() {
        let controller = LifecycleController::new(unstartable_config());
        let status = controller.stop().await;
        assert_eq!(status.state, HealthState::Stopped);

        // And again, to confirm idempotence.
        let status = controller.stop().await;
        assert_eq!(status.state, HealthState::Stopped);
    }
}
