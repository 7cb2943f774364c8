//! Azure OpenAI deployments
//!
//! `POST {endpoint}/openai/deployments/{deployment}/chat/completions?api-version={version}`
//! with an `api-key` header. Bodies use the OpenAI shape.

use super::openai::{parse_chunk, parse_completion, OpenAIChatRequest};
use super::{Adapter, StreamOutcome, UpstreamRequest};
use crate::{ChatRequest, ChatResponse, ProviderConfig, ProviderType, UpstreamError};

pub struct AzureAdapter;

#[async_trait::async_trait]
impl Adapter for AzureAdapter {
    fn provider_type(&self) -> ProviderType {
        ProviderType::Azure
    }

    fn translate_request(&self, config: &ProviderConfig, request: &ChatRequest) -> UpstreamRequest {
        let body = OpenAIChatRequest::build(config, request, false);
        UpstreamRequest {
            url: format!(
                "{}/openai/deployments/{}/chat/completions?api-version={}",
                config.api_base(),
                config.upstream_model(),
                config.api_version.as_deref().unwrap_or_default()
            ),
            headers: vec![("api-key", config.credential.clone())],
            body: serde_json::to_value(body).unwrap_or_default(),
        }
    }

    fn translate_response(&self, request: &ChatRequest, body: &str) -> Result<ChatResponse, UpstreamError> {
        parse_completion(ProviderType::Azure, request, body)
    }

    fn translate_stream_event(
        &self,
        request: &ChatRequest,
        _stream_id: &str,
        data: &str,
    ) -> Result<StreamOutcome, UpstreamError> {
        parse_chunk(ProviderType::Azure, request, data)
    }
}
