//! Mock model server for testing warden.
//!
//! Supports two modes:
//! 1. Direct: `mock-vllm --port 8001 --model test-model`
//! 2. vLLM-compatible: `mock-vllm serve model-name --host 127.0.0.1 --port 8001 ...`
//!
//! Implements the health and completions contract the lifecycle manager
//! depends on, plus control endpoints (`/set_health`, `/crash`) so tests
//! can drive degradation and crash-recovery paths.

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "mock-vllm")]
#[command(about = "Mock model server for testing")]
struct Args {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Port to listen on (direct mode)
    #[arg(short, long, default_value = "8001")]
    port: u16,

    /// Model name to serve (direct mode)
    #[arg(short, long, default_value = "test-model")]
    model: String,

    /// Artificial latency for completions (ms)
    #[arg(long, default_value = "10", global = true)]
    latency_ms: u64,

    /// How long /health reports unready after boot (ms)
    #[arg(long, default_value = "0", global = true)]
    warmup_ms: u64,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// vLLM-compatible serve mode; accepts and mostly ignores the real
    /// launcher's flags.
    Serve {
        /// Model to serve (positional, like vllm)
        model: String,

        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        #[arg(long)]
        port: Option<u16>,

        #[arg(long)]
        max_model_len: Option<usize>,

        #[arg(long)]
        device: Option<String>,

        #[arg(long, default_value = "1")]
        tensor_parallel_size: usize,

        #[arg(long, default_value = "0.9")]
        gpu_memory_utilization: f32,

        #[arg(long)]
        quantization: Option<String>,

        #[arg(long)]
        trust_remote_code: bool,
    },
}

/// Server state
#[derive(Debug)]
struct MockState {
    model: String,
    started: Instant,
    warmup: Duration,
    latency: Duration,
    healthy: RwLock<bool>,
    request_count: RwLock<u64>,
}

impl MockState {
    async fn is_ready(&self) -> bool {
        self.started.elapsed() >= self.warmup && *self.healthy.read().await
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("mock_vllm=debug,tower_http=debug")
        .init();

    let args = Args::parse();

    let (model, host, port) = match args.command {
        Some(Commands::Serve {
            model,
            host,
            port: serve_port,
            ..
        }) => {
            let port = serve_port.unwrap_or(args.port);
            (model, host, port)
        }
        None => (args.model, "127.0.0.1".to_string(), args.port),
    };

    let state = Arc::new(MockState {
        model: model.clone(),
        started: Instant::now(),
        warmup: Duration::from_millis(args.warmup_ms),
        latency: Duration::from_millis(args.latency_ms),
        healthy: RwLock::new(true),
        request_count: RwLock::new(0),
    });

    let app = Router::new()
        .route("/health", get(health))
        .route("/v1/completions", post(completions))
        .route("/v1/models", get(list_models))
        .route("/stats", get(stats))
        .route("/set_health", post(set_health))
        .route("/crash", post(crash))
        .with_state(state);

    let addr = format!("{}:{}", host, port);
    let listener = TcpListener::bind(&addr).await?;

    let actual_port = listener.local_addr()?.port();

    info!(
        model = %model,
        port = actual_port,
        warmup_ms = args.warmup_ms,
        "Mock model server listening"
    );

    // Signal readiness to stdout for test harness
    println!("READY {}", actual_port);

    axum::serve(listener, app).await?;
    Ok(())
}

/// Health check: unready during warmup or when tests force unhealthy.
async fn health(State(state): State<Arc<MockState>>) -> impl IntoResponse {
    if state.is_ready().await {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

#[derive(Deserialize)]
struct CompletionsRequest {
    model: String,
    prompt: String,
    #[serde(default = "default_max_tokens")]
    #[allow(dead_code)] // Parsed but not used in the mock response
    max_tokens: u32,
}

fn default_max_tokens() -> u32 {
    100
}

#[derive(Serialize)]
struct CompletionsResponse {
    id: String,
    object: String,
    model: String,
    choices: Vec<Choice>,
    usage: Usage,
}

#[derive(Serialize)]
struct Choice {
    index: u32,
    text: String,
    finish_reason: String,
}

#[derive(Serialize)]
struct Usage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

/// Completions endpoint
async fn completions(
    State(state): State<Arc<MockState>>,
    Json(request): Json<CompletionsRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    if !state.is_ready().await {
        warn!(model = %request.model, "Request received while unready");
        return Err((
            StatusCode::SERVICE_UNAVAILABLE,
            "Model is still loading".to_string(),
        ));
    }

    tokio::time::sleep(state.latency).await;

    {
        let mut count = state.request_count.write().await;
        *count += 1;
    }
    let count = *state.request_count.read().await;

    info!(
        model = %request.model,
        request_num = count,
        "Processing completion"
    );

    let text = format!(
        "Mock completion from {}: you said \"{}\"",
        state.model, request.prompt
    );
    let prompt_tokens = request.prompt.split_whitespace().count() as u32;
    let completion_tokens = text.split_whitespace().count() as u32;

    let response = CompletionsResponse {
        id: format!("cmpl-mock-{}", count),
        object: "text_completion".to_string(),
        model: state.model.clone(),
        choices: vec![Choice {
            index: 0,
            text,
            finish_reason: "stop".to_string(),
        }],
        usage: Usage {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        },
    };

    Ok(Json(response))
}

#[derive(Serialize)]
struct ModelsResponse {
    object: String,
    data: Vec<ModelInfo>,
}

#[derive(Serialize)]
struct ModelInfo {
    id: String,
    object: String,
    owned_by: String,
}

/// List models endpoint
async fn list_models(State(state): State<Arc<MockState>>) -> impl IntoResponse {
    let response = ModelsResponse {
        object: "list".to_string(),
        data: vec![ModelInfo {
            id: state.model.clone(),
            object: "model".to_string(),
            owned_by: "mock-vllm".to_string(),
        }],
    };

    Json(response)
}

#[derive(Serialize)]
struct StatsResponse {
    model: String,
    pid: u32,
    healthy: bool,
    request_count: u64,
}

/// Stats endpoint for testing inspection
async fn stats(State(state): State<Arc<MockState>>) -> impl IntoResponse {
    let response = StatsResponse {
        model: state.model.clone(),
        pid: std::process::id(),
        healthy: state.is_ready().await,
        request_count: *state.request_count.read().await,
    };

    Json(response)
}

#[derive(Deserialize)]
struct SetHealthRequest {
    healthy: bool,
}

/// Force the health endpoint up or down
async fn set_health(
    State(state): State<Arc<MockState>>,
    Json(request): Json<SetHealthRequest>,
) -> impl IntoResponse {
    info!(healthy = request.healthy, "Setting health");
    *state.healthy.write().await = request.healthy;
    StatusCode::OK
}

/// Exit abruptly, as a crashed server would
async fn crash() -> impl IntoResponse {
    warn!("Crash requested");
    tokio::spawn(async {
        // Let the response flush before dying.
        tokio::time::sleep(Duration::from_millis(50)).await;
        std::process::exit(1);
    });
    StatusCode::OK
}
