//! Error types shared across the lifecycle manager.

use std::time::Duration;

/// Hardware probing failed outright. Recoverable: callers fall back to a
/// conservative CPU-only profile.
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("failed to read system memory: {0}")]
    Memory(String),

    #[error("failed to read cpu topology: {0}")]
    Cpu(String),
}

/// Launching the model server failed. Surfaced directly from `start()`;
/// the lifecycle state is left untouched.
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("port {port} is already bound by another process")]
    PortUnavailable { port: u16 },

    #[error("failed to spawn `{command}`: {reason}")]
    SpawnError { command: String, reason: String },
}

/// A single inference call failed. Absorbed by the router, which serves a
/// fallback response instead of propagating these to callers.
#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    #[error("no live endpoint to forward to")]
    NoEndpoint,

    #[error("request to {url} failed: {reason}")]
    Transport { url: String, reason: String },

    #[error("upstream returned status {status}")]
    UpstreamStatus { status: u16 },

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("malformed upstream response: {0}")]
    Malformed(String),
}
