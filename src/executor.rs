//! Streaming request executor.
//!
//! Issues one `POST /v1/completions` with `stream: true` and folds the
//! event stream into a [`RequestOutcome`]. Every failure is captured in the
//! outcome; nothing here is retried and nothing returns an error.

use anyhow::{Context, Result};
use chrono::Utc;
use futures::StreamExt;
use reqwest::{Client, Response, StatusCode};
use serde::Serialize;
use std::time::{Duration, Instant};
use tokio::time::timeout;

use crate::error::RequestError;
use crate::outcome::RequestOutcome;
use crate::streaming::{parse_line, LineDecoder, StreamFrame, StreamProgress, MAX_LINE_BYTES};

/// Path of the completions endpoint relative to the base URL
pub const COMPLETIONS_PATH: &str = "/v1/completions";

/// Extra time the outer send timeout allows beyond the connect timeout, so
/// a hung connect always surfaces as a connect error first
const SEND_TIMEOUT_SLACK: Duration = Duration::from_millis(500);

/// Parameters shared by every request of a run
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Base URL without trailing slash, e.g. `http://localhost:8000`
    pub base_url: String,
    pub model: String,
    pub max_tokens: u32,
    /// Bound on connecting, on waiting for the status line, and on every
    /// gap between body chunks
    pub request_timeout: Duration,
}

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    max_tokens: u32,
    stream: bool,
}

/// Executes streaming completion requests over its own HTTP client.
///
/// Each worker owns one executor, so connections are never shared between
/// workers.
pub struct StreamingExecutor {
    client: Client,
    endpoint: String,
    model: String,
    max_tokens: u32,
    request_timeout: Duration,
}

impl StreamingExecutor {
    /// Create an executor with a dedicated connection pool
    pub fn new(config: &ExecutorConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(config.request_timeout)
            .pool_max_idle_per_host(1)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            endpoint: format!("{}{}", config.base_url, COMPLETIONS_PATH),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            request_timeout: config.request_timeout,
        })
    }

    /// Full URL requests are sent to
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Bound on connecting plus waiting for the status line
    fn send_timeout(&self) -> Duration {
        self.request_timeout + SEND_TIMEOUT_SLACK
    }

    /// Run one request to completion and describe what happened.
    pub async fn execute(&self, prompt: &str, request_id: u64) -> RequestOutcome {
        let started = Instant::now();
        let mut outcome = RequestOutcome::started(request_id, Utc::now());

        if let Err(err) = self.stream_into(&mut outcome, prompt, started).await {
            tracing::debug!(
                request_id,
                status = outcome.status_code,
                error = %err,
                tokens = outcome.tokens_received,
                "Request failed"
            );
            outcome.fail(err);
        }

        outcome.total_time = started.elapsed().as_secs_f64();

        tracing::debug!(
            request_id,
            status = outcome.status_code,
            tokens = outcome.tokens_received,
            ttft = outcome.time_to_first_token,
            total_time = outcome.total_time,
            completed = outcome.stream_completed,
            "Request finished"
        );

        outcome
    }

    async fn stream_into(
        &self,
        outcome: &mut RequestOutcome,
        prompt: &str,
        started: Instant,
    ) -> Result<(), RequestError> {
        let body = CompletionRequest {
            model: &self.model,
            prompt,
            max_tokens: self.max_tokens,
            stream: true,
        };

        let response = timeout(
            self.send_timeout(),
            self.client.post(&self.endpoint).json(&body).send(),
        )
        .await?
        .map_err(|e| RequestError::from_send(&e))?;

        let status = response.status();
        outcome.status_code = status.as_u16();

        if status != StatusCode::OK {
            return Err(RequestError::Http(status.as_u16()));
        }

        let mut progress = StreamProgress::new();
        let result = self
            .read_stream(response, &mut progress, started, outcome.request_id)
            .await;

        // Partial counts survive a mid-stream failure
        outcome.tokens_received = progress.tokens_received;
        outcome.time_to_first_token = progress
            .first_token_at
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        outcome.stream_completed = progress.completed;
        outcome.finish_reason = progress.finish_reason.unwrap_or_default();
        outcome.malformed_frames = progress.malformed_frames;

        result
    }

    async fn read_stream(
        &self,
        response: Response,
        progress: &mut StreamProgress,
        started: Instant,
        request_id: u64,
    ) -> Result<(), RequestError> {
        let mut stream = response.bytes_stream();
        let mut decoder = LineDecoder::new();

        loop {
            let chunk = match timeout(self.request_timeout, stream.next()).await? {
                Some(Ok(chunk)) => chunk,
                Some(Err(e)) => return Err(RequestError::from_body(&e)),
                None => break,
            };

            let lines = decoder.feed(&chunk);
            count_oversized(progress, &mut decoder, request_id);
            for line in lines {
                if observe_line(progress, &line, started, request_id) {
                    return Ok(());
                }
            }
        }

        if let Some(line) = decoder.finish() {
            observe_line(progress, &line, started, request_id);
        }
        count_oversized(progress, &mut decoder, request_id);

        Ok(())
    }
}

/// Oversized lines are skipped like malformed payloads.
fn count_oversized(progress: &mut StreamProgress, decoder: &mut LineDecoder, request_id: u64) {
    let dropped = decoder.take_oversized();
    if dropped > 0 {
        tracing::debug!(
            request_id,
            dropped,
            limit = MAX_LINE_BYTES,
            "Dropping oversized stream line"
        );
        progress.malformed_frames += dropped;
    }
}

/// Returns `true` when the stream signalled its end.
fn observe_line(
    progress: &mut StreamProgress,
    line: &str,
    started: Instant,
    request_id: u64,
) -> bool {
    let Some(frame) = parse_line(line) else {
        return false;
    };

    if frame == StreamFrame::Malformed {
        let preview: String = line.chars().take(120).collect();
        tracing::debug!(
            request_id,
            payload = %preview,
            "Skipping malformed stream payload"
        );
    }

    progress.observe(frame, started.elapsed())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    fn executor_for(base_url: String, request_timeout: Duration) -> StreamingExecutor {
        StreamingExecutor::new(&ExecutorConfig {
            base_url,
            model: "test-model".to_string(),
            max_tokens: 16,
            request_timeout,
        })
        .unwrap()
    }

    fn sse(lines: &[&str]) -> String {
        lines.iter().map(|l| format!("{}\n\n", l)).collect()
    }

    /// Consume one HTTP request (headers plus Content-Length body)
    async fn read_request(socket: &mut TcpStream) {
        let mut buf = Vec::new();
        let mut tmp = [0u8; 1024];
        loop {
            let n = socket.read(&mut tmp).await.unwrap();
            if n == 0 {
                return;
            }
            buf.extend_from_slice(&tmp[..n]);
            let text = String::from_utf8_lossy(&buf).to_string();
            if let Some(header_end) = text.find("\r\n\r\n") {
                let content_length = text[..header_end]
                    .lines()
                    .find_map(|l| {
                        let lower = l.to_ascii_lowercase();
                        lower
                            .strip_prefix("content-length:")
                            .map(|v| v.trim().parse::<usize>().unwrap())
                    })
                    .unwrap_or(0);
                if buf.len() >= header_end + 4 + content_length {
                    return;
                }
            }
        }
    }

    /// Serve a chunked 200 response with one data chunk, then either stall
    /// or drop the connection.
    async fn spawn_partial_stream_server(stall: bool) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            read_request(&mut socket).await;

            let head = "HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\ntransfer-encoding: chunked\r\n\r\n";
            let data = "data: {\"choices\":[{\"text\":\"Hi\",\"finish_reason\":null}]}\n\n";
            let frame = format!("{:x}\r\n{}\r\n", data.len(), data);
            socket.write_all(head.as_bytes()).await.unwrap();
            socket.write_all(frame.as_bytes()).await.unwrap();
            socket.flush().await.unwrap();

            if stall {
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
            drop(socket);
        });

        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_successful_stream() {
        let mut server = mockito::Server::new_async().await;
        let body = sse(&[
            r#"data: {"choices":[{"text":"Hello","finish_reason":null}]}"#,
            r#"data: {"choices":[{"text":" world","finish_reason":null}]}"#,
            r#"data: {"choices":[{"text":"!","finish_reason":"stop"}]}"#,
            "data: [DONE]",
        ]);
        let mock = server
            .mock("POST", "/v1/completions")
            .match_body(Matcher::PartialJson(json!({
                "model": "test-model",
                "prompt": "Say hi",
                "max_tokens": 16,
                "stream": true
            })))
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body(body)
            .create_async()
            .await;

        let executor = executor_for(server.url(), Duration::from_secs(5));
        let outcome = executor.execute("Say hi", 42).await;

        mock.assert_async().await;
        assert_eq!(outcome.request_id, 42);
        assert_eq!(outcome.status_code, 200);
        assert_eq!(outcome.error, "");
        assert_eq!(outcome.tokens_received, 3);
        assert!(outcome.time_to_first_token > 0.0);
        assert!(outcome.total_time >= outcome.time_to_first_token);
        assert!(outcome.stream_completed);
        assert_eq!(outcome.finish_reason, "stop");
    }

    #[tokio::test]
    async fn test_malformed_payload_is_skipped() {
        let mut server = mockito::Server::new_async().await;
        let body = sse(&[
            r#"data: {"choices":[{"text":"broken"#,
            r#"data: {"choices":[{"text":"A","finish_reason":null}]}"#,
            r#"data: {"choices":[{"text":"B","finish_reason":null}]}"#,
            "data: [DONE]",
        ]);
        server
            .mock("POST", "/v1/completions")
            .with_status(200)
            .with_body(body)
            .create_async()
            .await;

        let executor = executor_for(server.url(), Duration::from_secs(5));
        let outcome = executor.execute("prompt", 0).await;

        assert!(outcome.is_success());
        assert_eq!(outcome.tokens_received, 2);
        assert_eq!(outcome.malformed_frames, 1);
        assert!(outcome.stream_completed);
        assert_eq!(outcome.finish_reason, "");
    }

    #[tokio::test]
    async fn test_oversized_line_is_skipped() {
        let mut server = mockito::Server::new_async().await;
        let huge = format!("data: {}", "x".repeat(MAX_LINE_BYTES + 10));
        let body = sse(&[
            huge.as_str(),
            r#"data: {"choices":[{"text":"A","finish_reason":"stop"}]}"#,
            "data: [DONE]",
        ]);
        server
            .mock("POST", "/v1/completions")
            .with_status(200)
            .with_body(body)
            .create_async()
            .await;

        let executor = executor_for(server.url(), Duration::from_secs(5));
        let outcome = executor.execute("prompt", 0).await;

        assert!(outcome.is_success());
        assert_eq!(outcome.malformed_frames, 1);
        assert_eq!(outcome.tokens_received, 1);
        assert!(outcome.stream_completed);
        assert_eq!(outcome.finish_reason, "stop");
    }

    #[tokio::test]
    async fn test_non_200_status() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/completions")
            .with_status(503)
            .with_body(sse(&[r#"data: {"choices":[{"text":"ignored"}]}"#]))
            .create_async()
            .await;

        let executor = executor_for(server.url(), Duration::from_secs(5));
        let outcome = executor.execute("prompt", 1).await;

        assert_eq!(outcome.error, "HTTP 503");
        assert_eq!(outcome.status_code, 503);
        assert_eq!(outcome.tokens_received, 0);
        assert_eq!(outcome.time_to_first_token, 0.0);
        assert!(!outcome.stream_completed);
        assert!(outcome.total_time > 0.0);
    }

    #[tokio::test]
    async fn test_stream_ending_without_completion_signal() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/completions")
            .with_status(200)
            .with_body(sse(&[
                ": comment line",
                r#"data: {"choices":[{"text":"partial","finish_reason":null}]}"#,
            ]))
            .create_async()
            .await;

        let executor = executor_for(server.url(), Duration::from_secs(5));
        let outcome = executor.execute("prompt", 2).await;

        assert!(outcome.is_success());
        assert_eq!(outcome.tokens_received, 1);
        assert!(!outcome.stream_completed);
    }

    #[tokio::test]
    async fn test_done_without_trailing_newline() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/completions")
            .with_status(200)
            .with_body("data: {\"choices\":[{\"text\":\"x\"}]}\n\ndata: [DONE]")
            .create_async()
            .await;

        let executor = executor_for(server.url(), Duration::from_secs(5));
        let outcome = executor.execute("prompt", 3).await;

        assert!(outcome.stream_completed);
        assert_eq!(outcome.tokens_received, 1);
    }

    #[tokio::test]
    async fn test_connection_refused() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let executor = executor_for(format!("http://127.0.0.1:{}", port), Duration::from_secs(2));
        let outcome = executor.execute("prompt", 4).await;

        assert_eq!(outcome.error, "connection_reset");
        assert_eq!(outcome.status_code, 0);
        assert_eq!(outcome.tokens_received, 0);
    }

    #[tokio::test]
    async fn test_unroutable_connect_classified_as_connection_reset() {
        // Either hangs until the connect timeout or fails fast, never `timeout`
        let executor = executor_for("http://10.255.255.1:81".to_string(), Duration::from_millis(200));
        let outcome = executor.execute("prompt", 8).await;

        assert_eq!(outcome.error, "connection_reset");
        assert_eq!(outcome.status_code, 0);
    }

    #[test]
    fn test_send_timeout_outlasts_connect_timeout() {
        let executor = executor_for("http://localhost:8000".to_string(), Duration::from_secs(3));
        assert!(executor.send_timeout() > Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_timeout_before_status() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(socket);
        });

        let executor = executor_for(format!("http://{}", addr), Duration::from_millis(200));
        let outcome = executor.execute("prompt", 5).await;

        assert_eq!(outcome.error, "timeout");
        assert_eq!(outcome.status_code, 0);
        assert!(outcome.total_time >= 0.2);
    }

    #[tokio::test]
    async fn test_timeout_mid_stream_keeps_partial_counts() {
        let url = spawn_partial_stream_server(true).await;

        let executor = executor_for(url, Duration::from_millis(300));
        let outcome = executor.execute("prompt", 6).await;

        assert_eq!(outcome.error, "timeout");
        assert_eq!(outcome.status_code, 200);
        assert_eq!(outcome.tokens_received, 1);
        assert!(outcome.time_to_first_token > 0.0);
    }

    #[tokio::test]
    async fn test_interrupted_stream() {
        let url = spawn_partial_stream_server(false).await;

        let executor = executor_for(url, Duration::from_secs(5));
        let outcome = executor.execute("prompt", 7).await;

        assert_eq!(outcome.error, "stream_interrupted");
        assert_eq!(outcome.status_code, 200);
        assert_eq!(outcome.tokens_received, 1);
        assert!(!outcome.stream_completed);
    }

    #[test]
    fn test_endpoint_path() {
        let executor = executor_for("http://localhost:8000".to_string(), Duration::from_secs(1));
        assert_eq!(executor.endpoint(), "http://localhost:8000/v1/completions");
    }
}
