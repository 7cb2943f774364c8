//! Anthropic Messages API

use super::{parse_body, Adapter, StreamOutcome, UpstreamRequest};
use crate::config::ANTHROPIC_VERSION;
use crate::{
    ChatChunk, ChatRequest, ChatResponse, MessageRole, ProviderConfig, ProviderType,
    UpstreamError, Usage,
};
use serde::{Deserialize, Serialize};

pub struct AnthropicAdapter;

#[derive(Debug, Serialize)]
struct AnthropicMessageRequest<'a> {
    model: &'a str,
    messages: Vec<AnthropicMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
}

// Anthropic only knows user and assistant turns
#[derive(Debug, Serialize)]
struct AnthropicMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct AnthropicMessageResponse {
    #[serde(default)]
    content: Vec<AnthropicContentBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
    usage: AnthropicUsage,
}

#[derive(Debug, Deserialize)]
struct AnthropicContentBlock {
    #[serde(rename = "type")]
    type_: String,
    #[serde(default)]
    text: String,
}

#[derive(Debug, Default, Deserialize)]
struct AnthropicUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct AnthropicStreamChunk {
    #[serde(rename = "type")]
    type_: String,
    #[serde(default)]
    delta: Option<AnthropicDelta>,
    #[serde(default)]
    usage: Option<AnthropicUsage>,
    #[serde(default)]
    error: Option<AnthropicError>,
}

// content_block_delta carries `type`/`text`; message_delta carries `stop_reason`
#[derive(Debug, Deserialize)]
struct AnthropicDelta {
    #[serde(default, rename = "type")]
    type_: Option<String>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnthropicError {
    #[serde(default, rename = "type")]
    type_: String,
    #[serde(default)]
    message: String,
}

fn finish_reason(stop_reason: &str) -> String {
    match stop_reason {
        "end_turn" | "stop_sequence" => "stop",
        "max_tokens" => "length",
        "tool_use" => "tool_calls",
        other => other,
    }
    .to_string()
}

#[async_trait::async_trait]
impl Adapter for AnthropicAdapter {
    fn provider_type(&self) -> ProviderType {
        ProviderType::Anthropic
    }

    fn translate_request(&self, config: &ProviderConfig, request: &ChatRequest) -> UpstreamRequest {
        // Anthropic takes system prompts out of band
        let (system, others): (Vec<_>, Vec<_>) = request
            .messages
            .iter()
            .partition(|m| m.role == MessageRole::System);
        let system = (!system.is_empty()).then(|| {
            system
                .iter()
                .map(|m| m.content.as_str())
                .collect::<Vec<_>>()
                .join("\n\n")
        });

        let body = AnthropicMessageRequest {
            model: config.upstream_model(),
            messages: others
                .into_iter()
                .map(|m| AnthropicMessage {
                    role: match m.role {
                        MessageRole::Assistant => "assistant",
                        _ => "user",
                    },
                    content: &m.content,
                })
                .collect(),
            system,
            max_tokens: request.max_tokens.unwrap_or_else(|| config.max_tokens()),
            temperature: request.temperature,
            stream: request.stream.then_some(true),
        };

        UpstreamRequest {
            url: format!("{}/v1/messages", config.api_base()),
            headers: vec![
                ("x-api-key", config.credential.clone()),
                (
                    "anthropic-version",
                    config.api_version.clone().unwrap_or_else(|| ANTHROPIC_VERSION.to_string()),
                ),
            ],
            body: serde_json::to_value(body).unwrap_or_default(),
        }
    }

    fn translate_response(&self, request: &ChatRequest, body: &str) -> Result<ChatResponse, UpstreamError> {
        let response: AnthropicMessageResponse = parse_body(ProviderType::Anthropic, body)?;
        let text: String = response
            .content
            .iter()
            .filter(|block| block.type_ == "text")
            .map(|block| block.text.as_str())
            .collect();
        if response.content.is_empty() {
            return Err(UpstreamError::malformed(
                "Anthropic response contained no content blocks",
                body,
            ));
        }

        Ok(ChatResponse::assistant(
            request.model.clone(),
            text,
            response.stop_reason.as_deref().map(finish_reason),
            Some(Usage::new(response.usage.input_tokens, response.usage.output_tokens)),
        ))
    }

    fn translate_stream_event(
        &self,
        request: &ChatRequest,
        stream_id: &str,
        data: &str,
    ) -> Result<StreamOutcome, UpstreamError> {
        let chunk: AnthropicStreamChunk = parse_body(ProviderType::Anthropic, data)?;
        match chunk.type_.as_str() {
            "content_block_delta" => match chunk.delta {
                Some(AnthropicDelta {
                    type_: Some(ref t),
                    text: Some(text),
                    ..
                }) if t == "text_delta" && !text.is_empty() => Ok(StreamOutcome::Chunk(ChatChunk::delta(
                    stream_id,
                    request.model.clone(),
                    Some(text),
                    None,
                ))),
                _ => Ok(StreamOutcome::Skip),
            },
            "message_delta" => {
                let reason = chunk.delta.and_then(|d| d.stop_reason);
                let mut out = ChatChunk::delta(
                    stream_id,
                    request.model.clone(),
                    None,
                    reason.as_deref().map(finish_reason),
                );
                out.usage = chunk
                    .usage
                    .map(|u| Usage::new(u.input_tokens, u.output_tokens));
                Ok(StreamOutcome::Chunk(out))
            }
            "message_stop" => Ok(StreamOutcome::Done),
            "error" => {
                let error = chunk.error.unwrap_or(AnthropicError {
                    type_: String::new(),
                    message: data.to_string(),
                });
                let message = format!("{}: {}", error.type_, error.message);
                Err(match error.type_.as_str() {
                    "rate_limit_error" => UpstreamError::RateLimited { message },
                    "authentication_error" | "permission_error" => {
                        UpstreamError::AuthFailed { status: 401, message }
                    }
                    "invalid_request_error" => UpstreamError::Rejected { status: 400, message },
                    // overloaded_error, api_error and anything new
                    _ => UpstreamError::Unavailable { message },
                })
            }
            // message_start, content_block_start/stop, ping
            _ => Ok(StreamOutcome::Skip),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Message;

    fn request() -> ChatRequest {
        ChatRequest::new(
            "claude-3-opus",
            vec![
                Message::system("You are helpful"),
                Message::user("Hello"),
                Message::system("Answer in English"),
            ],
        )
    }

    fn config() -> ProviderConfig {
        ProviderConfig::new("claude-3-opus", ProviderType::Anthropic, "sk-ant")
            .with_upstream_model("claude-3-opus-20240229")
    }

    #[test]
    fn test_system_messages_lifted() {
        let upstream = AnthropicAdapter.translate_request(&config(), &request());
        assert_eq!(upstream.url, "https://api.anthropic.com/v1/messages");
        assert_eq!(upstream.body["model"], "claude-3-opus-20240229");
        assert_eq!(upstream.body["system"], "You are helpful\n\nAnswer in English");
        assert_eq!(upstream.body["messages"].as_array().unwrap().len(), 1);
        assert_eq!(upstream.body["max_tokens"], 4096);
        assert!(upstream.body.get("stream").is_none());
        assert!(upstream
            .headers
            .contains(&("anthropic-version", ANTHROPIC_VERSION.to_string())));
    }

    #[test]
    fn test_unknown_roles_sent_as_user() {
        let request = ChatRequest::new(
            "claude-3-opus",
            vec![
                Message::user("What is 2+2?"),
                Message::assistant("Let me check."),
                Message::new(MessageRole::Other("tool".into()), "4"),
            ],
        );
        let upstream = AnthropicAdapter.translate_request(&config(), &request);
        let roles: Vec<&str> = upstream.body["messages"]
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["role"].as_str().unwrap())
            .collect();
        assert_eq!(roles, vec!["user", "assistant", "user"]);
        assert_eq!(upstream.body["messages"][2]["content"], "4");
    }

    #[test]
    fn test_translate_response() {
        let body = r#"{"id":"msg_1","type":"message","role":"assistant","model":"claude-3-opus-20240229",
            "content":[{"type":"text","text":"Hello"},{"type":"text","text":" there"}],
            "stop_reason":"max_tokens","usage":{"input_tokens":10,"output_tokens":2}}"#;
        let response = AnthropicAdapter.translate_response(&request(), body).unwrap();
        assert_eq!(response.model, "claude-3-opus");
        assert_eq!(response.content(), Some("Hello there"));
        assert_eq!(response.choices[0].finish_reason.as_deref(), Some("length"));
        assert_eq!(response.usage, Some(Usage::new(10, 2)));
    }

    #[test]
    fn test_parse_anthropic_content_block_delta() {
        let data = r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hello"}}"#;
        match AnthropicAdapter.translate_stream_event(&request(), "chatcmpl-x", data).unwrap() {
            StreamOutcome::Chunk(chunk) => {
                assert_eq!(chunk.id, "chatcmpl-x");
                assert_eq!(chunk.choices[0].delta.content.as_deref(), Some("Hello"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_parse_anthropic_message_delta() {
        let data = r#"{"type":"message_delta","delta":{"stop_reason":"end_turn","stop_sequence":null},"usage":{"output_tokens":15}}"#;
        match AnthropicAdapter.translate_stream_event(&request(), "id", data).unwrap() {
            StreamOutcome::Chunk(chunk) => {
                assert_eq!(chunk.choices[0].finish_reason.as_deref(), Some("stop"));
                assert_eq!(chunk.usage.unwrap().completion_tokens, 15);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_parse_anthropic_ping_and_stop() {
        let ping = AnthropicAdapter.translate_stream_event(&request(), "id", r#"{"type":"ping"}"#);
        assert!(matches!(ping, Ok(StreamOutcome::Skip)));
        let stop = AnthropicAdapter.translate_stream_event(&request(), "id", r#"{"type":"message_stop"}"#);
        assert!(matches!(stop, Ok(StreamOutcome::Done)));
    }

    #[test]
    fn test_overloaded_stream_error() {
        let data = r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#;
        assert!(matches!(
            AnthropicAdapter.translate_stream_event(&request(), "id", data),
            Err(UpstreamError::Unavailable { .. })
        ));
    }
}
