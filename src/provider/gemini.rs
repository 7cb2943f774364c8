//! Google Gemini `generateContent`

use super::{parse_body, Adapter, StreamOutcome, UpstreamRequest};
use crate::{
    ChatChunk, ChatRequest, ChatResponse, MessageRole, ProviderConfig, ProviderType, UpstreamError,
    Usage,
};
use serde::{Deserialize, Serialize};

pub struct GeminiAdapter;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest<'a> {
    contents: Vec<Content<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content<'a>>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
struct Content<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'static str>,
    parts: Vec<Part<'a>>,
}

#[derive(Debug, Serialize)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    max_output_tokens: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    usage_metadata: Option<UsageMetadata>,
    #[serde(default)]
    error: Option<GeminiError>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<CandidateContent>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: u32,
    #[serde(default)]
    candidates_token_count: u32,
}

#[derive(Debug, Deserialize)]
struct GeminiError {
    #[serde(default)]
    code: u16,
    #[serde(default)]
    message: String,
}

impl Candidate {
    fn text(&self) -> String {
        self.content
            .iter()
            .flat_map(|c| c.parts.iter())
            .filter_map(|p| p.text.as_deref())
            .collect()
    }
}

impl UsageMetadata {
    fn usage(&self) -> Usage {
        Usage::new(self.prompt_token_count, self.candidates_token_count)
    }
}

fn finish_reason(reason: &str) -> String {
    match reason {
        "STOP" => "stop",
        "MAX_TOKENS" => "length",
        // SAFETY, RECITATION, BLOCKLIST, PROHIBITED_CONTENT, ...
        _ => "content_filter",
    }
    .to_string()
}

fn role(role: &MessageRole) -> &'static str {
    match role {
        MessageRole::Assistant => "model",
        _ => "user",
    }
}

#[async_trait::async_trait]
impl Adapter for GeminiAdapter {
    fn provider_type(&self) -> ProviderType {
        ProviderType::Gemini
    }

    // Gemini has no terminator event; the last chunk carries finishReason
    fn stream_ends_at_eof(&self) -> bool {
        true
    }

    fn translate_request(&self, config: &ProviderConfig, request: &ChatRequest) -> UpstreamRequest {
        let system_parts: Vec<Part<'_>> = request
            .messages
            .iter()
            .filter(|m| m.role == MessageRole::System)
            .map(|m| Part { text: &m.content })
            .collect();
        let contents = request
            .messages
            .iter()
            .filter(|m| m.role != MessageRole::System)
            .map(|m| Content {
                role: Some(role(&m.role)),
                parts: vec![Part { text: &m.content }],
            })
            .collect();

        let body = GenerateContentRequest {
            contents,
            system_instruction: (!system_parts.is_empty()).then(|| Content {
                role: None,
                parts: system_parts,
            }),
            generation_config: GenerationConfig {
                temperature: request.temperature,
                max_output_tokens: request.max_tokens.unwrap_or_else(|| config.max_tokens()),
            },
        };

        let method = if request.stream {
            "streamGenerateContent?alt=sse"
        } else {
            "generateContent"
        };
        UpstreamRequest {
            url: format!("{}/models/{}:{}", config.api_base(), config.upstream_model(), method),
            headers: vec![("x-goog-api-key", config.credential.clone())],
            body: serde_json::to_value(body).unwrap_or_default(),
        }
    }

    fn translate_response(&self, request: &ChatRequest, body: &str) -> Result<ChatResponse, UpstreamError> {
        let response: GenerateContentResponse = parse_body(ProviderType::Gemini, body)?;
        let candidate = response.candidates.first().ok_or_else(|| {
            UpstreamError::malformed("Gemini response contained no candidates", body)
        })?;

        Ok(ChatResponse::assistant(
            request.model.clone(),
            candidate.text(),
            candidate.finish_reason.as_deref().map(finish_reason),
            response.usage_metadata.as_ref().map(UsageMetadata::usage),
        ))
    }

    fn translate_stream_event(
        &self,
        request: &ChatRequest,
        stream_id: &str,
        data: &str,
    ) -> Result<StreamOutcome, UpstreamError> {
        let response: GenerateContentResponse = parse_body(ProviderType::Gemini, data)?;
        if let Some(error) = response.error {
            return Err(UpstreamError::from_status(error.code, error.message));
        }
        let Some(candidate) = response.candidates.first() else {
            return Ok(StreamOutcome::Skip);
        };

        let text = candidate.text();
        let reason = candidate.finish_reason.as_deref().map(finish_reason);
        if text.is_empty() && reason.is_none() {
            return Ok(StreamOutcome::Skip);
        }

        let mut chunk = ChatChunk::delta(
            stream_id,
            request.model.clone(),
            (!text.is_empty()).then_some(text),
            reason.clone(),
        );
        // Gemini repeats running usage on every event; report it once, at the end
        if reason.is_some() {
            chunk.usage = response.usage_metadata.as_ref().map(UsageMetadata::usage);
        }
        Ok(StreamOutcome::Chunk(chunk))
    }
}
