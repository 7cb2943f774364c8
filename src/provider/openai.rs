//! OpenAI chat completions

use super::{parse_body, Adapter, StreamOutcome, UpstreamRequest};
use crate::{ChatChunk, ChatRequest, ChatResponse, Message, ProviderConfig, ProviderType, UpstreamError};
use serde::Serialize;

pub struct OpenAIAdapter;

#[derive(Debug, Serialize)]
pub(super) struct OpenAIChatRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
    messages: &'a [Message],
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    stream: bool,
}

impl<'a> OpenAIChatRequest<'a> {
    /// Azure deployments carry the model in the URL, so `with_model` is off there
    pub(super) fn build(config: &'a ProviderConfig, request: &'a ChatRequest, with_model: bool) -> Self {
        OpenAIChatRequest {
            model: with_model.then(|| config.upstream_model()),
            messages: &request.messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens.or(config.max_tokens),
            stream: request.stream,
        }
    }
}

/// Parse an OpenAI-shaped completion and restore the caller's model name
pub(super) fn parse_completion(
    provider: ProviderType,
    request: &ChatRequest,
    body: &str,
) -> Result<ChatResponse, UpstreamError> {
    let mut response: ChatResponse = parse_body(provider, body)?;
    if response.choices.is_empty() {
        return Err(UpstreamError::malformed(
            format!("no choices in {} response", provider),
            body,
        ));
    }
    response.model = request.model.clone();
    Ok(response)
}

/// Parse an OpenAI-shaped stream chunk and restore the caller's model name
pub(super) fn parse_chunk(
    provider: ProviderType,
    request: &ChatRequest,
    data: &str,
) -> Result<StreamOutcome, UpstreamError> {
    let mut chunk: ChatChunk = parse_body(provider, data)?;
    // Azure opens with a prompt-filter chunk that has no choices
    if chunk.choices.is_empty() && chunk.usage.is_none() {
        return Ok(StreamOutcome::Skip);
    }
    chunk.model = request.model.clone();
    Ok(StreamOutcome::Chunk(chunk))
}

#[async_trait::async_trait]
impl Adapter for OpenAIAdapter {
    fn provider_type(&self) -> ProviderType {
        ProviderType::OpenAI
    }

    fn translate_request(&self, config: &ProviderConfig, request: &ChatRequest) -> UpstreamRequest {
        let body = OpenAIChatRequest::build(config, request, true);
        UpstreamRequest {
            url: format!("{}/chat/completions", config.api_base()),
            headers: vec![("Authorization", format!("Bearer {}", config.credential))],
            body: serde_json::to_value(body).unwrap_or_default(),
        }
    }

    fn translate_response(&self, request: &ChatRequest, body: &str) -> Result<ChatResponse, UpstreamError> {
        parse_completion(ProviderType::OpenAI, request, body)
    }

    fn translate_stream_event(
        &self,
        request: &ChatRequest,
        _stream_id: &str,
        data: &str,
    ) -> Result<StreamOutcome, UpstreamError> {
        parse_chunk(ProviderType::OpenAI, request, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> ChatRequest {
        let mut request = ChatRequest::new("gpt-4", vec![Message::system("be brief"), Message::user("Hello")]);
        request.temperature = Some(0.7);
        request
    }

    #[test]
    fn test_translate_request() {
        let config = ProviderConfig::new("gpt-4", ProviderType::OpenAI, "sk-up")
            .with_upstream_model("gpt-4-0613");
        let upstream = OpenAIAdapter.translate_request(&config, &request());
        assert_eq!(upstream.url, "https://api.openai.com/v1/chat/completions");
        assert_eq!(upstream.headers, vec![("Authorization", "Bearer sk-up".to_string())]);
        assert_eq!(upstream.body["model"], "gpt-4-0613");
        assert_eq!(upstream.body["messages"][0]["role"], "system");
        assert_eq!(upstream.body["stream"], false);
        assert!(upstream.body.get("max_tokens").is_none());
    }

    #[test]
    fn test_translate_response_restores_model() {
        let body = r#"{"id":"chatcmpl-1","object":"chat.completion","created":1,"model":"gpt-4-0613",
            "choices":[{"index":0,"message":{"role":"assistant","content":"Hi"},"finish_reason":"stop"}],
            "usage":{"prompt_tokens":5,"completion_tokens":1,"total_tokens":6}}"#;
        let response = OpenAIAdapter.translate_response(&request(), body).unwrap();
        assert_eq!(response.model, "gpt-4");
        assert_eq!(response.content(), Some("Hi"));
        assert_eq!(response.usage.unwrap().total_tokens, 6);
    }

    #[test]
    fn test_empty_choices_is_malformed() {
        let body = r#"{"id":"x","model":"gpt-4","choices":[]}"#;
        assert!(matches!(
            OpenAIAdapter.translate_response(&request(), body),
            Err(UpstreamError::MalformedResponse { .. })
        ));
    }

    #[test]
    fn test_parse_openai_sse_chunk() {
        let data = r#"{"id":"c","choices":[{"delta":{"content":"Hello"}}]}"#;
        match OpenAIAdapter.translate_stream_event(&request(), "id", data).unwrap() {
            StreamOutcome::Chunk(chunk) => {
                assert_eq!(chunk.model, "gpt-4");
                assert_eq!(chunk.choices[0].delta.content.as_deref(), Some("Hello"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
}
