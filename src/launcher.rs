//! Model server process lifecycle.
//!
//! The launcher owns the only OS-level child process in the system. A
//! [`ServerHandle`] is handed to the controller on launch and consumed on
//! stop, so a stopped handle cannot be stopped twice. Teardown is
//! graceful first (SIGTERM), forceful after a bounded grace period.

use crate::config::ServerConfig;
use crate::errors::LaunchError;
use crate::selector::ModelPlan;
use std::process::Stdio;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};
use url::Url;

/// A running model server process and the plan it was launched with.
#[derive(Debug)]
pub struct ServerHandle {
    child: Child,
    endpoint: Url,
    pub pid: Option<u32>,
    pub bind_host: String,
    pub bind_port: u16,
    pub started_at: Instant,
    pub plan: ModelPlan,
}

impl ServerHandle {
    pub fn base_url(&self) -> Url {
        self.endpoint.clone()
    }

    /// Non-blocking check whether the process has exited.
    pub(crate) fn try_wait(&mut self) -> std::io::Result<Option<std::process::ExitStatus>> {
        self.child.try_wait()
    }
}

/// Spawns and tears down the external serving process.
#[derive(Debug, Clone)]
pub struct ServerLauncher {
    config: ServerConfig,
}

impl ServerLauncher {
    pub fn new(config: ServerConfig) -> Self {
        Self { config }
    }

    /// Start the serving process for a plan.
    ///
    /// The target port is checked before spawning: a port held by a
    /// foreign process fails fast with [`LaunchError::PortUnavailable`]
    /// instead of leaving a child that can never bind.
    pub async fn launch(&self, plan: &ModelPlan) -> Result<ServerHandle, LaunchError> {
        self.ensure_port_free().await?;

        let endpoint = Url::parse(&format!(
            "http://{}:{}",
            self.config.bind_host, self.config.bind_port
        ))
        .map_err(|e| LaunchError::SpawnError {
            command: self.config.serve_command.clone(),
            reason: format!("invalid server endpoint: {}", e),
        })?;

        let mut args = plan.serve_args(&self.config.bind_host, self.config.bind_port);
        args.extend(self.config.extra_args.iter().cloned());

        info!(
            command = %self.config.serve_command,
            model = %plan.model_id,
            port = self.config.bind_port,
            "Launching model server"
        );
        debug!(args = ?args, "Serve command args");

        let child = Command::new(&self.config.serve_command)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| LaunchError::SpawnError {
                command: self.config.serve_command.clone(),
                reason: e.to_string(),
            })?;

        let pid = child.id();
        Ok(ServerHandle {
            child,
            endpoint,
            pid,
            bind_host: self.config.bind_host.clone(),
            bind_port: self.config.bind_port,
            started_at: Instant::now(),
            plan: plan.clone(),
        })
    }

    /// Stop a server, consuming its handle.
    ///
    /// Sends SIGTERM and waits up to the configured grace period, then
    /// force-kills. Also used to reap processes that already exited, in
    /// which case the wait returns immediately.
    pub async fn stop(&self, mut handle: ServerHandle) {
        info!(pid = ?handle.pid, port = handle.bind_port, "Stopping model server");

        #[cfg(unix)]
        if let Some(pid) = handle.pid {
            use nix::sys::signal::{self, Signal};
            use nix::unistd::Pid;

            match signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                Ok(()) => debug!(pid, "Sent SIGTERM"),
                Err(e) => debug!(pid, error = %e, "SIGTERM failed, process likely gone"),
            }
        }

        #[cfg(not(unix))]
        {
            let _ = handle.child.start_kill();
        }

        match tokio::time::timeout(self.config.stop_grace(), handle.child.wait()).await {
            Ok(Ok(status)) => {
                info!(status = %status, "Model server exited");
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Failed waiting for model server exit");
            }
            Err(_) => {
                warn!(
                    grace_secs = self.config.stop_grace_secs,
                    "Model server ignored SIGTERM, killing"
                );
                if let Err(e) = handle.child.kill().await {
                    warn!(error = %e, "Failed to kill model server");
                }
            }
        }
    }

    /// Fail fast if something else already holds the serve port.
    async fn ensure_port_free(&self) -> Result<(), LaunchError> {
        let addr = format!("{}:{}", self.config.bind_host, self.config.bind_port);
        match TcpListener::bind(&addr).await {
            Ok(listener) => {
                drop(listener);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                Err(LaunchError::PortUnavailable {
                    port: self.config.bind_port,
                })
            }
            Err(e) => Err(LaunchError::SpawnError {
                command: self.config.serve_command.clone(),
                reason: format!("preflight bind of {} failed: {}", addr, e),
            }),
        }
    }
}
