//! Request routing between the live model server and the demo fallback.
//!
//! [`RequestRouter::infer`] is the single entry point for inference and
//! never returns an error: while the server is healthy requests are
//! forwarded to its OpenAI-style completions endpoint, and every other
//! situation (starting, degraded, failed, stopped, transport error,
//! timeout) produces a deterministic zero-cost fallback response. Health
//! classification stays with the monitor; a failed forward here never
//! mutates lifecycle state.

use crate::client::HttpClient;
use crate::config::RoutingConfig;
use crate::errors::InferenceError;
use crate::monitor::{HealthState, SharedLifecycle};
use async_trait::async_trait;
use axum::body::Body;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const FALLBACK_MODEL: &str = "warden-demo";

/// One inference call. Defaults mirror the completions endpoint of the
/// managed server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceRequest {
    pub prompt: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
}

fn default_max_tokens() -> u32 {
    2048
}

fn default_temperature() -> f32 {
    0.1
}

fn default_top_p() -> f32 {
    0.9
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServedBy {
    Model,
    Fallback,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceResponse {
    pub text: String,
    pub usage: TokenUsage,
    pub latency_ms: u64,
    pub served_by: ServedBy,
    pub model: String,
}

/// What a backend produces; the router adds latency and provenance.
#[derive(Debug, Clone)]
pub struct CompletionOutput {
    pub text: String,
    pub model: String,
    pub usage: TokenUsage,
}

/// A provider capable of answering an inference request. The live server
/// and the demo responder are the two variants; the router picks one per
/// call based on the current health snapshot.
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    async fn complete(&self, request: &InferenceRequest)
    -> Result<CompletionOutput, InferenceError>;
}

// --- live backend -----------------------------------------------------------

/// OpenAI-style completions request/response bodies.
#[derive(Debug, Serialize)]
struct CompletionsRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    max_tokens: u32,
    temperature: f32,
    top_p: f32,
}

#[derive(Debug, Deserialize)]
struct CompletionsResponse {
    choices: Vec<CompletionChoice>,
    #[serde(default)]
    usage: Option<TokenUsage>,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    text: String,
}

/// Forwards to the live server's `POST /v1/completions`.
#[derive(Debug)]
pub struct LiveBackend<T: HttpClient> {
    client: T,
    shared: SharedLifecycle,
}

impl<T: HttpClient> LiveBackend<T> {
    pub fn new(client: T, shared: SharedLifecycle) -> Self {
        Self { client, shared }
    }
}

#[async_trait]
impl<T: HttpClient + Send + Sync> InferenceBackend for LiveBackend<T> {
    async fn complete(
        &self,
        request: &InferenceRequest,
    ) -> Result<CompletionOutput, InferenceError> {
        let (endpoint, model) = {
            let lifecycle = self.shared.read().await;
            let endpoint = lifecycle.endpoint.clone().ok_or(InferenceError::NoEndpoint)?;
            let model = lifecycle
                .plan
                .as_ref()
                .map(|plan| plan.model_id.clone())
                .ok_or(InferenceError::NoEndpoint)?;
            (endpoint, model)
        };

        let url = endpoint
            .join("v1/completions")
            .map_err(|e| InferenceError::Malformed(e.to_string()))?;
        let body = CompletionsRequest {
            model: &model,
            prompt: &request.prompt,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            top_p: request.top_p,
        };
        let body_bytes =
            serde_json::to_vec(&body).map_err(|e| InferenceError::Malformed(e.to_string()))?;

        let req = axum::extract::Request::builder()
            .method("POST")
            .uri(url.as_str())
            .header("content-type", "application/json")
            .body(Body::from(body_bytes))
            .map_err(|e| InferenceError::Transport {
                url: url.to_string(),
                reason: e.to_string(),
            })?;

        let response =
            self.client
                .request(req)
                .await
                .map_err(|e| InferenceError::Transport {
                    url: url.to_string(),
                    reason: e.to_string(),
                })?;

        let status = response.status();
        if !status.is_success() {
            return Err(InferenceError::UpstreamStatus {
                status: status.as_u16(),
            });
        }

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .map_err(|e| InferenceError::Transport {
                url: url.to_string(),
                reason: e.to_string(),
            })?;

        let parsed: CompletionsResponse =
            serde_json::from_slice(&bytes).map_err(|e| InferenceError::Malformed(e.to_string()))?;
        let text = parsed
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.text)
            .ok_or_else(|| InferenceError::Malformed("no choices in response".to_string()))?;

        let usage = parsed.usage.unwrap_or_else(|| estimate_usage(&request.prompt, &text));
        Ok(CompletionOutput {
            text,
            model: parsed.model.unwrap_or(model),
            usage,
        })
    }
}

// --- demo backend -----------------------------------------------------------

/// Deterministic zero-cost responder used whenever the live server can't
/// take traffic. Output depends only on the prompt: no clock, no
/// randomness, no network.
#[derive(Debug, Default)]
pub struct DemoBackend;

impl DemoBackend {
    pub fn new() -> Self {
        Self
    }

    pub fn respond(&self, request: &InferenceRequest) -> CompletionOutput {
        let prompt = request.prompt.to_lowercase();
        let text = if prompt.contains("code") || prompt.contains("function") {
            demo_code_response(&request.prompt)
        } else if prompt.contains("analyze") || prompt.contains("review") {
            demo_analysis_response(&request.prompt)
        } else {
            demo_general_response(&request.prompt)
        };

        let usage = estimate_usage(&request.prompt, &text);
        CompletionOutput {
            text,
            model: FALLBACK_MODEL.to_string(),
            usage,
        }
    }
}

#[async_trait]
impl InferenceBackend for DemoBackend {
    async fn complete(
        &self,
        request: &InferenceRequest,
    ) -> Result<CompletionOutput, InferenceError> {
        Ok(self.respond(request))
    }
}

fn prompt_excerpt(prompt: &str) -> String {
    let mut excerpt: String = prompt.chars().take(100).collect();
    if prompt.chars().count() > 100 {
        excerpt.push_str("...");
    }
    excerpt
}

fn demo_code_response(prompt: &str) -> String {
    format!(
        "Demo mode: the local model server is not serving yet, so this is a canned \
         code-assistant answer.\n\nRequest: {}\n\nA production deployment would return \
         generated code here. Start the managed server to get real completions.",
        prompt_excerpt(prompt)
    )
}

fn demo_analysis_response(prompt: &str) -> String {
    format!(
        "Demo mode: the local model server is not serving yet, so this is a canned \
         analysis answer.\n\nRequest: {}\n\nA production deployment would return a code \
         review here. Start the managed server to get real completions.",
        prompt_excerpt(prompt)
    )
}

fn demo_general_response(prompt: &str) -> String {
    format!(
        "Demo mode: the local model server is not serving yet.\n\nRequest: {}\n\nThis \
         response was generated locally at zero cost. Start the managed server to get \
         real completions.",
        prompt_excerpt(prompt)
    )
}

/// Whitespace-token estimate used when the upstream omits usage and for
/// all fallback responses.
fn estimate_usage(prompt: &str, completion: &str) -> TokenUsage {
    let prompt_tokens = prompt.split_whitespace().count() as u32;
    let completion_tokens = completion.split_whitespace().count() as u32;
    TokenUsage {
        prompt_tokens,
        completion_tokens,
        total_tokens: prompt_tokens + completion_tokens,
    }
}

// --- router -----------------------------------------------------------------

/// Routes each call to the live server or the fallback.
#[derive(Debug)]
pub struct RequestRouter<T: HttpClient> {
    shared: SharedLifecycle,
    live: LiveBackend<T>,
    demo: DemoBackend,
    request_timeout: Duration,
}

impl<T: HttpClient + Send + Sync> RequestRouter<T> {
    pub fn new(shared: SharedLifecycle, client: T, config: &RoutingConfig) -> Self {
        Self {
            live: LiveBackend::new(client, shared.clone()),
            shared,
            demo: DemoBackend::new(),
            request_timeout: config.request_timeout(),
        }
    }

    /// Answer an inference request. Infallible by design: transient
    /// forwarding failures become fallback responses for this call only.
    pub async fn infer(&self, request: InferenceRequest) -> InferenceResponse {
        let started = Instant::now();
        let health = self.shared.read().await.health;

        if health == HealthState::Healthy {
            match tokio::time::timeout(self.request_timeout, self.live.complete(&request)).await {
                Ok(Ok(output)) => {
                    return finish(output, ServedBy::Model, started);
                }
                Ok(Err(e)) => {
                    warn!(error = %e, "Forwarding failed, serving fallback for this call");
                }
                Err(_) => {
                    warn!(
                        timeout_secs = self.request_timeout.as_secs(),
                        "Inference call timed out, serving fallback for this call"
                    );
                }
            }
        } else {
            debug!(state = %health, "Server not healthy, serving fallback");
        }

        finish(self.demo.respond(&request), ServedBy::Fallback, started)
    }
}

fn finish(output: CompletionOutput, served_by: ServedBy, started: Instant) -> InferenceResponse {
    InferenceResponse {
        text: output.text,
        usage: output.usage,
        latency_ms: started.elapsed().as_millis() as u64,
        served_by,
        model: output.model,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::{HealthState, new_shared};
    use crate::selector::{Device, ModelPlan};
    use crate::test_utils::MockHttpClient;
    use axum::http::StatusCode;
    use rstest::rstest;

    fn request(prompt: &str) -> InferenceRequest {
        InferenceRequest {
            prompt: prompt.to_string(),
            max_tokens: 64,
            temperature: 0.1,
            top_p: 0.9,
        }
    }

    fn test_plan() -> ModelPlan {
        ModelPlan {
            model_id: "test/model".to_string(),
            max_context_tokens: 4096,
            device: Device::Cpu,
            tensor_parallel_size: 1,
            quantization: None,
            gpu_memory_fraction: None,
        }
    }

    async fn shared_with(health: HealthState) -> crate::monitor::SharedLifecycle {
        let shared = new_shared();
        {
            let mut lifecycle = shared.write().await;
            lifecycle.health = health;
            lifecycle.plan = Some(test_plan());
            lifecycle.endpoint = Some("http://127.0.0.1:9".parse().unwrap());
        }
        shared
    }

    const COMPLETION_BODY: &str = r#"{
        "id": "cmpl-1",
        "object": "text_completion",
        "model": "test/model",
        "choices": [{"text": "a real answer", "index": 0, "finish_reason": "stop"}],
        "usage": {"prompt_tokens": 3, "completion_tokens": 5, "total_tokens": 8}
    }"#;

    #[tokio::test]
    async fn healthy_forwards_to_the_live_server() {
        let shared = shared_with(HealthState::Healthy).await;
        let client = MockHttpClient::new(StatusCode::OK, COMPLETION_BODY);
        let router = RequestRouter::new(shared, client.clone(), &RoutingConfig::default());

        let response = router.infer(request("hello")).await;
        assert_eq!(response.served_by, ServedBy::Model);
        assert_eq!(response.text, "a real answer");
        assert_eq!(response.usage.total_tokens, 8);

        let requests = client.get_requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].uri, "http://127.0.0.1:9/v1/completions");
        let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
        assert_eq!(body["model"], "test/model");
        assert_eq!(body["prompt"], "hello");
    }

    #[rstest]
    #[case(HealthState::Stopped)]
    #[case(HealthState::Starting)]
    #[case(HealthState::Degraded)]
    #[case(HealthState::Failed)]
    #[tokio::test]
    async fn non_healthy_state_serves_fallback_without_network(#[case] health: HealthState) {
        let shared = shared_with(health).await;
        let client = MockHttpClient::new(StatusCode::OK, COMPLETION_BODY);
        let router = RequestRouter::new(shared, client.clone(), &RoutingConfig::default());

        let started = Instant::now();
        let response = router.infer(request("hello")).await;

        assert_eq!(response.served_by, ServedBy::Fallback, "state {health}");
        assert!(
            started.elapsed() < Duration::from_millis(50),
            "fallback for {health} took {:?}",
            started.elapsed()
        );
        assert!(client.get_requests().is_empty(), "state {health} hit network");
    }

    #[tokio::test]
    async fn transport_error_falls_back_for_this_call_only() {
        let shared = shared_with(HealthState::Healthy).await;
        let client = MockHttpClient::failing("connection refused");
        let router = RequestRouter::new(shared.clone(), client, &RoutingConfig::default());

        let response = router.infer(request("hello")).await;
        assert_eq!(response.served_by, ServedBy::Fallback);
        // The router never reclassifies health; that is the monitor's job.
        assert_eq!(shared.read().await.health, HealthState::Healthy);
    }

    #[tokio::test]
    async fn upstream_error_status_falls_back() {
        let shared = shared_with(HealthState::Healthy).await;
        let client = MockHttpClient::new(StatusCode::INTERNAL_SERVER_ERROR, "boom");
        let router = RequestRouter::new(shared, client, &RoutingConfig::default());

        let response = router.infer(request("hello")).await;
        assert_eq!(response.served_by, ServedBy::Fallback);
    }

    #[tokio::test]
    async fn fallback_is_deterministic() {
        let demo = DemoBackend::new();
        let first = demo.respond(&request("write a function for me"));
        let second = demo.respond(&request("write a function for me"));
        assert_eq!(first.text, second.text);
        assert_eq!(first.usage, second.usage);
        assert_eq!(first.model, FALLBACK_MODEL);
    }

    #[tokio::test]
    async fn fallback_templates_follow_the_prompt() {
        let demo = DemoBackend::new();
        let code = demo.respond(&request("write a function")).text;
        let analysis = demo.respond(&request("review this please")).text;
        let general = demo.respond(&request("hello there")).text;
        assert_ne!(code, general);
        assert_ne!(analysis, general);
    }

    #[tokio::test]
    async fn usage_estimated_when_upstream_omits_it() {
        let shared = shared_with(HealthState::Healthy).await;
        let body = r#"{"choices": [{"text": "one two three"}]}"#;
        let client = MockHttpClient::new(StatusCode::OK, body);
        let router = RequestRouter::new(shared, client, &RoutingConfig::default());

        let response = router.infer(request("hi there friend")).await;
        assert_eq!(response.served_by, ServedBy::Model);
        assert_eq!(response.usage.prompt_tokens, 3);
        assert_eq!(response.usage.completion_tokens, 3);
        assert_eq!(response.usage.total_tokens, 6);
    }
}
