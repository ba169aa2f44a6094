//! Mock OpenAI-compatible completion server that streams SSE responses.

use axum::{
    body::Body,
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

/// Configuration for the mock completion server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MockServerConfig {
    /// Port to listen on (0 for random)
    pub port: u16,
    /// Simulated latency per chunk in milliseconds
    pub chunk_latency_ms: u64,
    /// Number of token chunks per completion
    pub chunk_count: usize,
    /// Fraction of requests answered with 503 (0.0 to 1.0)
    pub error_rate: f64,
    /// Finish reason attached to the last chunk
    pub finish_reason: String,
}

impl Default for MockServerConfig {
    fn default() -> Self {
        Self {
            port: 0,
            chunk_latency_ms: 10,
            chunk_count: 20,
            error_rate: 0.0,
            finish_reason: "length".to_string(),
        }
    }
}

/// Mock completion server for standalone runs and tests
pub struct MockCompletionServer {
    config: MockServerConfig,
    shutdown_tx: Option<oneshot::Sender<()>>,
    port: u16,
}

#[derive(Debug, Deserialize)]
struct CompletionBody {
    #[serde(default)]
    model: String,
    #[serde(default)]
    max_tokens: Option<usize>,
}

impl MockCompletionServer {
    /// Create a new mock server with the given configuration
    pub fn new(config: MockServerConfig) -> Self {
        Self {
            config,
            shutdown_tx: None,
            port: 0,
        }
    }

    /// Start the mock server and return the actual port
    pub async fn start(&mut self) -> anyhow::Result<u16> {
        let addr = format!("127.0.0.1:{}", self.config.port);
        let listener = TcpListener::bind(&addr).await?;
        let port = listener.local_addr()?.port();
        self.port = port;

        let config = Arc::new(self.config.clone());
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        self.shutdown_tx = Some(shutdown_tx);

        let app = Router::new()
            .route("/health", get(handle_health))
            .route("/v1/completions", post(handle_completion))
            .with_state(config);

        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
                .ok();
        });

        tracing::info!("Mock completion server listening on 127.0.0.1:{}", port);
        Ok(port)
    }

    /// Get the server's URL
    pub fn url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    /// Stop the mock server
    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for MockCompletionServer {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn handle_health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "healthy" }))
}

/// Handle POST /v1/completions
async fn handle_completion(
    State(config): State<Arc<MockServerConfig>>,
    Json(body): Json<CompletionBody>,
) -> Response {
    if config.error_rate > 0.0 && rand::thread_rng().gen::<f64>() < config.error_rate {
        return (StatusCode::SERVICE_UNAVAILABLE, "Simulated overload").into_response();
    }

    let chunks = body
        .max_tokens
        .map_or(config.chunk_count, |max| max.min(config.chunk_count));

    let stream = generate_stream(config, body.model, chunks);
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Generate an OpenAI-style completion stream
fn generate_stream(
    config: Arc<MockServerConfig>,
    model: String,
    chunks: usize,
) -> impl futures::Stream<Item = Result<Bytes, std::io::Error>> {
    async_stream::stream! {
        let chunk_latency = tokio::time::Duration::from_millis(config.chunk_latency_ms);

        for i in 0..chunks {
            tokio::time::sleep(chunk_latency).await;

            let finish_reason = if i + 1 == chunks {
                serde_json::Value::String(config.finish_reason.clone())
            } else {
                serde_json::Value::Null
            };
            let event = serde_json::json!({
                "id": "cmpl-mock",
                "object": "text_completion",
                "model": model,
                "choices": [{
                    "index": 0,
                    "text": generate_token(),
                    "finish_reason": finish_reason,
                }]
            });

            yield Ok(sse_event(&event.to_string()));
        }

        yield Ok(sse_event(crate::streaming::DONE_SENTINEL));
    }
}

fn sse_event(payload: &str) -> Bytes {
    Bytes::from(format!("{}{}\n\n", crate::streaming::DATA_PREFIX, payload))
}

/// Pick a random word as the next token
fn generate_token() -> String {
    const WORDS: &[&str] = &[
        "the", "quick", "brown", "fox", "jumps", "over", "lazy", "dog", "rust", "stream",
        "token", "deploy", "canary", "rollout", "cluster", "balance", "traffic",
    ];

    let word = WORDS[rand::thread_rng().gen_range(0..WORDS.len())];
    format!(" {}", word)
}
