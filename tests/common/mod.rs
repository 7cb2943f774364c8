//! Mock upstream providers for integration tests
#![allow(dead_code)]

use emx_gate::{Forwarder, ProviderConfig, ProviderType, RetryPolicy};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use wiremock::{
    matchers::{method, path},
    Mock, MockServer, ResponseTemplate,
};

pub const UPSTREAM_KEY: &str = "sk-upstream";

/// One wiremock server standing in for any provider
pub struct MockUpstream {
    pub server: MockServer,
}

impl MockUpstream {
    pub async fn start() -> Self {
        Self {
            server: MockServer::start().await,
        }
    }

    pub fn uri(&self) -> String {
        self.server.uri()
    }

    pub fn openai(&self, model: &str) -> ProviderConfig {
        ProviderConfig::new(model, ProviderType::OpenAI, UPSTREAM_KEY).with_endpoint(self.uri())
    }

    pub fn anthropic(&self, model: &str, upstream_model: &str) -> ProviderConfig {
        ProviderConfig::new(model, ProviderType::Anthropic, UPSTREAM_KEY)
            .with_endpoint(self.uri())
            .with_upstream_model(upstream_model)
    }

    pub fn azure(&self, model: &str, deployment: &str) -> ProviderConfig {
        ProviderConfig::azure(model, self.uri(), UPSTREAM_KEY, "2024-02-01").with_upstream_model(deployment)
    }

    pub fn gemini(&self, model: &str) -> ProviderConfig {
        ProviderConfig::new(model, ProviderType::Gemini, UPSTREAM_KEY).with_endpoint(self.uri())
    }

    /// Non-streaming OpenAI completion at `/chat/completions`
    pub async fn mock_openai_completion(&self, content: &str) {
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(openai_completion(content)))
            .mount(&self.server)
            .await;
    }

    /// Streaming OpenAI completion, one chunk per entry, then `[DONE]`
    pub async fn mock_openai_stream(&self, chunks: &[&str]) {
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(sse(openai_stream_body(chunks)))
            .mount(&self.server)
            .await;
    }

    /// Fixed status and body at `endpoint`
    pub async fn mock_status(&self, endpoint: &str, status: u16, body: &str) {
        Mock::given(method("POST"))
            .and(path(endpoint))
            .respond_with(ResponseTemplate::new(status).set_body_string(body))
            .mount(&self.server)
            .await;
    }
}

pub fn sse(body: String) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_raw(body, "text/event-stream")
}

pub fn openai_completion(content: &str) -> Value {
    json!({
        "id": "chatcmpl-mock",
        "object": "chat.completion",
        "created": 1234567890,
        "model": "upstream-model-id",
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": content},
            "finish_reason": "stop"
        }],
        "usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15}
    })
}

pub fn openai_stream_body(chunks: &[&str]) -> String {
    let mut body = String::new();
    for (i, chunk) in chunks.iter().enumerate() {
        let finish_reason = (i + 1 == chunks.len()).then_some("stop");
        let event = json!({
            "id": "chatcmpl-mock",
            "object": "chat.completion.chunk",
            "created": 1234567890,
            "model": "upstream-model-id",
            "choices": [{"index": 0, "delta": {"content": chunk}, "finish_reason": finish_reason}]
        });
        body.push_str(&format!("data: {}\n\n", event));
    }
    body.push_str("data: [DONE]\n\n");
    body
}

pub fn anthropic_message(content: &str) -> Value {
    json!({
        "id": "msg_mock",
        "type": "message",
        "role": "assistant",
        "model": "claude-3-opus-20240229",
        "content": [{"type": "text", "text": content}],
        "stop_reason": "end_turn",
        "usage": {"input_tokens": 12, "output_tokens": 3}
    })
}

pub fn anthropic_stream_body(chunks: &[&str]) -> String {
    let mut body = String::new();
    let mut event = |name: &str, data: Value| {
        body.push_str(&format!("event: {}\ndata: {}\n\n", name, data));
    };
    event(
        "message_start",
        json!({"type": "message_start", "message": {"id": "msg_mock", "usage": {"input_tokens": 12}}}),
    );
    event(
        "content_block_start",
        json!({"type": "content_block_start", "index": 0, "content_block": {"type": "text", "text": ""}}),
    );
    event("ping", json!({"type": "ping"}));
    for chunk in chunks {
        event(
            "content_block_delta",
            json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": chunk}}),
        );
    }
    event("content_block_stop", json!({"type": "content_block_stop", "index": 0}));
    event(
        "message_delta",
        json!({"type": "message_delta", "delta": {"stop_reason": "end_turn"}, "usage": {"output_tokens": 3}}),
    );
    event("message_stop", json!({"type": "message_stop"}));
    body
}

pub fn gemini_response(content: &str) -> Value {
    json!({
        "candidates": [{
            "content": {"role": "model", "parts": [{"text": content}]},
            "finishReason": "STOP"
        }],
        "usageMetadata": {"promptTokenCount": 4, "candidatesTokenCount": 2, "totalTokenCount": 6}
    })
}

/// Forwarder with short timeouts and fast backoff
pub fn forwarder(request_timeout: Duration) -> Forwarder {
    Forwarder::new(
        request_timeout,
        Duration::from_secs(5),
        RetryPolicy {
            initial_backoff: Duration::from_millis(10),
            ..RetryPolicy::default()
        },
    )
    .unwrap()
}

/// Hand-driven HTTP upstream for tests that control when body bytes go out.
///
/// wiremock answers with a complete body; this serves one request at a time
/// and leaves the chunked SSE body to the test.
pub struct RawUpstream {
    listener: TcpListener,
}

impl RawUpstream {
    pub async fn start() -> Self {
        Self {
            listener: TcpListener::bind("127.0.0.1:0").await.unwrap(),
        }
    }

    pub fn openai(&self, model: &str) -> ProviderConfig {
        let addr = self.listener.local_addr().unwrap();
        ProviderConfig::new(model, ProviderType::OpenAI, UPSTREAM_KEY).with_endpoint(format!("http://{}", addr))
    }

    /// Accept one request, read it fully and send streaming response headers
    pub async fn accept(&self) -> RawStream {
        let (mut socket, _) = self.listener.accept().await.unwrap();
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = socket.read(&mut chunk).await.unwrap();
            assert!(n > 0, "client closed before sending a request");
            buf.extend_from_slice(&chunk[..n]);
            if let Some(end) = find(&buf, b"\r\n\r\n") {
                let head = String::from_utf8_lossy(&buf[..end]).to_lowercase();
                let length: usize = head
                    .lines()
                    .find_map(|l| l.strip_prefix("content-length:"))
                    .map(|v| v.trim().parse().unwrap())
                    .unwrap_or(0);
                if buf.len() >= end + 4 + length {
                    break;
                }
            }
        }

        socket
            .write_all(
                b"HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\ntransfer-encoding: chunked\r\n\r\n",
            )
            .await
            .unwrap();
        RawStream { socket }
    }
}

pub struct RawStream {
    socket: TcpStream,
}

impl RawStream {
    /// Send `data: <payload>` as one chunk
    pub async fn send_data(&mut self, payload: &str) {
        let event = format!("data: {}\n\n", payload);
        let frame = format!("{:x}\r\n{}\r\n", event.len(), event);
        self.socket.write_all(frame.as_bytes()).await.unwrap();
        self.socket.flush().await.unwrap();
    }

    /// Send one OpenAI completion chunk carrying `content`
    pub async fn send_openai_chunk(&mut self, content: &str) {
        let chunk = json!({
            "id": "chatcmpl-raw",
            "object": "chat.completion.chunk",
            "created": 1234567890,
            "model": "upstream-model-id",
            "choices": [{"index": 0, "delta": {"content": content}, "finish_reason": null}]
        });
        self.send_data(&chunk.to_string()).await;
    }

    /// Terminate the chunked body
    pub async fn finish(&mut self) {
        self.socket.write_all(b"0\r\n\r\n").await.unwrap();
    }

    /// Wait until the client closes the connection
    pub async fn closed(&mut self) {
        let mut buf = [0u8; 64];
        loop {
            match self.socket.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(_) => {}
            }
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}
