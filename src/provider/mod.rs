//! Provider adapters
//!
//! Each upstream API is an [`Adapter`]: it turns an OpenAI-shaped
//! [`ChatRequest`] into the provider's wire request and turns the provider's
//! response body or stream events back into OpenAI shapes. Adding a provider
//! means adding one adapter and one [`ProviderType`] variant; the forwarder
//! and router stay untouched.

mod anthropic;
mod azure;
mod gemini;
mod openai;

use crate::{ChatChunk, ChatRequest, ChatResponse, ProviderConfig, ProviderType, UpstreamError};
use reqwest::Client as HttpClient;
use std::time::Duration;

pub use anthropic::AnthropicAdapter;
pub use azure::AzureAdapter;
pub use gemini::GeminiAdapter;
pub use openai::OpenAIAdapter;

/// Fully translated upstream HTTP request
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub url: String,
    pub headers: Vec<(&'static str, String)>,
    pub body: serde_json::Value,
}

/// Result of translating one upstream stream event
#[derive(Debug, Clone)]
pub enum StreamOutcome {
    /// Forward this chunk to the caller
    Chunk(ChatChunk),
    /// Event carries nothing for the caller (pings, bookkeeping)
    Skip,
    /// Upstream signalled the end of the stream
    Done,
}

/// Capability contract every provider implements
#[async_trait::async_trait]
pub trait Adapter: Send + Sync {
    /// Provider served by this adapter
    fn provider_type(&self) -> ProviderType;

    /// Build the upstream request for `request` against `config`
    fn translate_request(&self, config: &ProviderConfig, request: &ChatRequest) -> UpstreamRequest;

    /// Send the request; non-success statuses become classified errors
    async fn send(
        &self,
        http: &HttpClient,
        request: UpstreamRequest,
        timeout: Option<Duration>,
    ) -> Result<reqwest::Response, UpstreamError> {
        let mut builder = http.post(&request.url).json(&request.body);
        for (name, value) in &request.headers {
            builder = builder.header(*name, value);
        }
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }

        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(UpstreamError::from_status(status.as_u16(), body));
        }
        Ok(response)
    }

    /// Translate a complete (non-streaming) response body
    fn translate_response(&self, request: &ChatRequest, body: &str) -> Result<ChatResponse, UpstreamError>;

    /// Whether closing the body is a normal end of stream. Providers that
    /// send an explicit terminator (`[DONE]`, `message_stop`) return false.
    fn stream_ends_at_eof(&self) -> bool {
        false
    }

    /// Translate the payload of one SSE `data:` line
    fn translate_stream_event(
        &self,
        request: &ChatRequest,
        stream_id: &str,
        data: &str,
    ) -> Result<StreamOutcome, UpstreamError>;
}

/// Select the adapter for a provider type
pub fn adapter_for(provider_type: ProviderType) -> &'static dyn Adapter {
    match provider_type {
        ProviderType::OpenAI => &OpenAIAdapter,
        ProviderType::Anthropic => &AnthropicAdapter,
        ProviderType::Azure => &AzureAdapter,
        ProviderType::Gemini => &GeminiAdapter,
    }
}

/// Parse an upstream body, keeping it for diagnostics on failure
pub(crate) fn parse_body<T: serde::de::DeserializeOwned>(
    provider: ProviderType,
    body: &str,
) -> Result<T, UpstreamError> {
    serde_json::from_str(body).map_err(|e| {
        UpstreamError::malformed(format!("failed to parse {} response: {}", provider, e), body)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adapter_for_every_provider() {
        for provider in [
            ProviderType::OpenAI,
            ProviderType::Anthropic,
            ProviderType::Azure,
            ProviderType::Gemini,
        ] {
            assert_eq!(adapter_for(provider).provider_type(), provider);
        }
    }

    #[test]
    fn test_parse_body_keeps_raw_payload() {
        let err = parse_body::<ChatResponse>(ProviderType::OpenAI, "<html>oops</html>").unwrap_err();
        match err {
            UpstreamError::MalformedResponse { raw, .. } => assert_eq!(raw, "<html>oops</html>"),
            other => panic!("unexpected error: {other}"),
        }
    }
}
