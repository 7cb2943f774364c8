//! Upstream forwarding: timeouts, retries and SSE relay

use super::message::completion_id;
use super::provider::{adapter_for, StreamOutcome};
use super::{ChatChunk, ChatRequest, ChatResponse, Error, ProviderConfig, Result, UpstreamError};
use futures::stream::{Stream, StreamExt};
use reqwest::Client as HttpClient;
use std::pin::Pin;
use std::time::Duration;

/// Stream of OpenAI-shaped chunks relayed from an upstream provider
pub type ChunkStream = Pin<Box<dyn Stream<Item = std::result::Result<ChatChunk, UpstreamError>> + Send>>;

/// Upper bound for establishing a TCP/TLS connection
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Build the shared HTTP client. Per-call deadlines are applied by the
/// forwarder so streaming bodies are not cut off by a global timeout.
fn build_http_client(connect_timeout: Duration) -> std::result::Result<HttpClient, reqwest::Error> {
    HttpClient::builder().connect_timeout(connect_timeout).build()
}

/// When to try an upstream call again
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries for rate-limited (429) responses
    pub max_retries: u32,

    /// First backoff delay; doubles on each rate-limited retry
    pub initial_backoff: Duration,

    /// Retry once, immediately, when the upstream is unreachable
    pub retry_unavailable: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_retries: 2,
            initial_backoff: Duration::from_millis(200),
            retry_unavailable: true,
        }
    }
}

impl RetryPolicy {
    /// Never retry
    pub fn none() -> Self {
        RetryPolicy {
            max_retries: 0,
            initial_backoff: Duration::ZERO,
            retry_unavailable: false,
        }
    }

    /// Exponential backoff: initial, 2x, 4x, ...
    fn retry_delay(&self, attempt: u32) -> Duration {
        self.initial_backoff * (1u32 << attempt.min(16))
    }

    /// Delay before the next attempt, or `None` to give up
    fn next_delay(&self, error: &UpstreamError, attempts: &mut Attempts) -> Option<Duration> {
        match error {
            UpstreamError::RateLimited { .. } if attempts.rate_limited < self.max_retries => {
                let delay = self.retry_delay(attempts.rate_limited);
                attempts.rate_limited += 1;
                Some(delay)
            }
            UpstreamError::Unavailable { .. } if self.retry_unavailable && attempts.unavailable == 0 => {
                attempts.unavailable += 1;
                Some(Duration::ZERO)
            }
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
struct Attempts {
    rate_limited: u32,
    unavailable: u32,
}

/// Sends translated requests to upstream providers.
///
/// Holds no per-request state; cloning shares the connection pool.
#[derive(Debug, Clone)]
pub struct Forwarder {
    http: HttpClient,
    request_timeout: Duration,
    stream_idle_timeout: Duration,
    retry: RetryPolicy,
}

impl Forwarder {
    /// Create a forwarder.
    ///
    /// `request_timeout` bounds a whole non-streaming call and the wait for
    /// stream headers; `stream_idle_timeout` bounds each gap between chunks.
    pub fn new(request_timeout: Duration, stream_idle_timeout: Duration, retry: RetryPolicy) -> Result<Self> {
        let http = build_http_client(CONNECT_TIMEOUT.min(request_timeout))
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Forwarder {
            http,
            request_timeout,
            stream_idle_timeout,
            retry,
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Forward a non-streaming chat completion
    pub async fn forward(
        &self,
        provider: &ProviderConfig,
        request: &ChatRequest,
    ) -> std::result::Result<ChatResponse, UpstreamError> {
        let adapter = adapter_for(provider.provider_type);
        let upstream = adapter.translate_request(provider, request);
        let mut attempts = Attempts::default();

        loop {
            let result: std::result::Result<ChatResponse, UpstreamError> = async {
                let response = adapter
                    .send(&self.http, upstream.clone(), Some(self.request_timeout))
                    .await?;
                let body = response.text().await?;
                adapter.translate_response(request, &body)
            }
            .await;

            match result {
                Ok(response) => return Ok(response),
                Err(e) => match self.retry.next_delay(&e, &mut attempts) {
                    Some(delay) => {
                        tracing::warn!(
                            model = %provider.model_name,
                            provider = %provider.provider_type,
                            error = %e,
                            "Retrying upstream request in {:?}",
                            delay
                        );
                        tokio::time::sleep(delay).await;
                    }
                    None => return Err(e),
                },
            }
        }
    }

    /// Forward a streaming chat completion.
    ///
    /// Retries only happen until the upstream answers with a success status;
    /// once the stream is handed out, failures end it with an error item.
    pub async fn forward_stream(
        &self,
        provider: &ProviderConfig,
        request: &ChatRequest,
    ) -> std::result::Result<ChunkStream, UpstreamError> {
        let adapter = adapter_for(provider.provider_type);
        let upstream = adapter.translate_request(provider, request);
        let mut attempts = Attempts::default();

        let response = loop {
            let result = match tokio::time::timeout(
                self.request_timeout,
                adapter.send(&self.http, upstream.clone(), None),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(UpstreamError::Unavailable {
                    message: format!("no response from {} within {:?}", provider.provider_type, self.request_timeout),
                }),
            };

            match result {
                Ok(response) => break response,
                Err(e) => match self.retry.next_delay(&e, &mut attempts) {
                    Some(delay) => {
                        tracing::warn!(
                            model = %provider.model_name,
                            provider = %provider.provider_type,
                            error = %e,
                            "Retrying upstream stream in {:?}",
                            delay
                        );
                        tokio::time::sleep(delay).await;
                    }
                    None => return Err(e),
                },
            }
        };

        let request = request.clone();
        let idle_timeout = self.stream_idle_timeout;
        let stream_id = completion_id();

        Ok(Box::pin(async_stream::stream! {
            let mut body = response.bytes_stream();
            let mut sse = SseBuffer::new();

            loop {
                let next = match tokio::time::timeout(idle_timeout, body.next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        yield Err(UpstreamError::Unavailable {
                            message: format!("upstream stream idle for {:?}", idle_timeout),
                        });
                        return;
                    }
                };

                let eof = match next {
                    Some(Ok(bytes)) => {
                        sse.extend(&bytes);
                        false
                    }
                    Some(Err(e)) => {
                        yield Err(UpstreamError::from(e));
                        return;
                    }
                    None => true,
                };
                if eof {
                    // Flush a final unterminated line
                    sse.finish();
                }

                while let Some(line) = sse.next_line() {
                    match line {
                        SseLine::Done => return,
                        SseLine::Data(data) => {
                            match adapter.translate_stream_event(&request, &stream_id, &data) {
                                Ok(StreamOutcome::Chunk(chunk)) => {
                                    yield Ok(chunk);
                                }
                                Ok(StreamOutcome::Skip) => {}
                                Ok(StreamOutcome::Done) => return,
                                Err(e) => {
                                    yield Err(e);
                                    return;
                                }
                            }
                        }
                        SseLine::Invalid(raw) => {
                            yield Err(UpstreamError::malformed(
                                "SSE stream contains invalid UTF-8",
                                String::from_utf8_lossy(&raw).into_owned(),
                            ));
                            return;
                        }
                        // Event names are redundant with the payload `type`
                        SseLine::Event(_) | SseLine::Skip => {}
                    }
                }

                if eof {
                    if !adapter.stream_ends_at_eof() {
                        yield Err(UpstreamError::malformed(
                            format!("{} stream ended before its terminator", adapter.provider_type()),
                            String::new(),
                        ));
                    }
                    return;
                }
            }
        }))
    }
}

/// Parsed SSE line types
#[derive(Debug, PartialEq)]
enum SseLine {
    /// `data: [DONE]` - OpenAI stream terminator
    Done,
    /// `data: <json>` - JSON payload
    Data(String),
    /// `event: <name>` - SSE event name
    Event(String),
    /// Line that is not valid UTF-8
    Invalid(Vec<u8>),
    /// Empty, comment or unknown line
    Skip,
}

/// Accumulates bytes from an HTTP response and yields complete SSE lines.
struct SseBuffer {
    buf: Vec<u8>,
}

impl SseBuffer {
    fn new() -> Self {
        Self { buf: Vec::with_capacity(4096) }
    }

    fn extend(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Terminate a trailing partial line so it can be read
    fn finish(&mut self) {
        if !self.buf.is_empty() && self.buf.last() != Some(&b'\n') {
            self.buf.push(b'\n');
        }
    }

    /// Extract the next complete line (terminated by `\n`) from the buffer.
    /// Returns `None` when no complete line is available yet.
    ///
    /// Lines are decoded strictly so multi-byte characters split across
    /// chunk boundaries are only decoded once complete.
    fn next_line(&mut self) -> Option<SseLine> {
        let pos = self.buf.iter().position(|&b| b == b'\n')?;
        let raw: Vec<u8> = self.buf.drain(..=pos).collect();
        let line = match std::str::from_utf8(&raw) {
            Ok(s) => s.trim(),
            Err(_) => return Some(SseLine::Invalid(raw)),
        };

        if let Some(data) = line.strip_prefix("data:") {
            let data = data.trim_start();
            if data == "[DONE]" {
                return Some(SseLine::Done);
            }
            return Some(SseLine::Data(data.to_string()));
        }

        if let Some(event_name) = line.strip_prefix("event:") {
            return Some(SseLine::Event(event_name.trim_start().to_string()));
        }

        Some(SseLine::Skip)
    }
}
