//! Multi-tenant OpenAI-compatible LLM gateway
//!
//! Callers hold gateway-issued API keys; each request names a logical model
//! which the provider registry maps to an upstream OpenAI, Anthropic, Azure
//! or Gemini endpoint.
mod client;
mod config;
mod message;
mod persist;
mod provider;

pub mod audit;
pub mod keys;
pub mod probe;
pub mod registry;
pub mod router;

#[cfg(feature = "gate")]
pub mod gate;

use thiserror::Error;

/// Result type for emx-gate operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for emx-gate operations
#[derive(Debug, Error)]
pub enum Error {
    /// Missing, malformed or unknown gateway API key
    #[error("invalid API key")]
    InvalidKey,

    /// Key is valid but its allow-list does not include the model
    #[error("API key is not authorized for model '{0}'")]
    ForbiddenModel(String),

    /// No provider is registered for the model
    #[error("model '{0}' is not supported")]
    UnknownModel(String),

    /// A provider configuration failed write-time validation
    #[error("invalid configuration for model '{model}': {reason}")]
    ConfigValidation { model: String, reason: String },

    /// Upstream provider failure
    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    /// Key already present in the credential store
    #[error("API key already exists")]
    DuplicateKey,

    /// Key generation collided twice in a row
    #[error("could not generate a unique API key")]
    KeyGenerationExhausted,

    /// Store entry not found
    #[error("{0} not found")]
    NotFound(String),

    /// Caller sent a request the gateway cannot interpret
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Persistence I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Stable machine-readable category, used as the OpenAI error `type`.
    pub fn category(&self) -> &'static str {
        match self {
            Error::InvalidKey => "invalid_api_key",
            Error::ForbiddenModel(_) => "model_not_permitted",
            Error::UnknownModel(_) => "model_not_found",
            Error::ConfigValidation { .. } => "config_invalid",
            Error::Upstream(e) => e.category(),
            Error::DuplicateKey => "duplicate_key",
            Error::KeyGenerationExhausted => "key_generation_exhausted",
            Error::NotFound(_) => "not_found",
            Error::BadRequest(_) => "invalid_request",
            Error::Io(_) | Error::Json(_) | Error::Config(_) => "internal_error",
        }
    }

    pub(crate) fn invalid(model: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::ConfigValidation {
            model: model.into(),
            reason: reason.into(),
        }
    }
}

/// Failures reported by (or while reaching) an upstream provider.
///
/// Every variant keeps the upstream's own diagnostic text.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum UpstreamError {
    /// Provider rejected the configured credential (401/403)
    #[error("upstream rejected credentials ({status}): {message}")]
    AuthFailed { status: u16, message: String },

    /// Provider is throttling (429)
    #[error("upstream rate limited: {message}")]
    RateLimited { message: String },

    /// Connection failure, timeout or provider outage (5xx)
    #[error("upstream unavailable: {message}")]
    Unavailable { message: String },

    /// Successful status but the body could not be interpreted
    #[error("malformed upstream response: {message}")]
    MalformedResponse { message: String, raw: String },

    /// Any other non-success status
    #[error("upstream rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },
}

impl UpstreamError {
    /// Stable machine-readable category
    pub fn category(&self) -> &'static str {
        match self {
            UpstreamError::AuthFailed { .. } => "upstream_auth_failed",
            UpstreamError::RateLimited { .. } => "upstream_rate_limited",
            UpstreamError::Unavailable { .. } => "upstream_unavailable",
            UpstreamError::MalformedResponse { .. } => "upstream_malformed_response",
            UpstreamError::Rejected { .. } => "upstream_rejected",
        }
    }

    /// Classify a non-success HTTP status returned by a provider
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            401 | 403 => UpstreamError::AuthFailed { status, message: body },
            429 => UpstreamError::RateLimited { message: body },
            500 | 502 | 503 | 504 => UpstreamError::Unavailable {
                message: format!("HTTP {}: {}", status, body),
            },
            _ => UpstreamError::Rejected { status, message: body },
        }
    }

    pub(crate) fn malformed(message: impl Into<String>, raw: impl Into<String>) -> Self {
        UpstreamError::MalformedResponse {
            message: message.into(),
            raw: raw.into(),
        }
    }
}

impl From<reqwest::Error> for UpstreamError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            return UpstreamError::malformed(e.to_string(), String::new());
        }
        // Connect failures, timeouts and dropped bodies all land here
        UpstreamError::Unavailable {
            message: e.to_string(),
        }
    }
}

pub use audit::{AuditEntry, AuditLog, Stage};
pub use client::{ChunkStream, Forwarder, RetryPolicy};
pub use config::{ProviderConfig, ProviderDocument, ProviderType};
pub use keys::{AllowedModels, ApiKeyRecord, CredentialStore, KeyLog, KeyStorage, MemoryKeyStorage};
pub use message::{
    ChatChunk, ChatRequest, ChatResponse, Choice, ChunkChoice, Delta, Message, MessageRole, Usage,
};
pub use probe::{ProbeResult, ProbeStatus, Prober};
pub use provider::{adapter_for, Adapter, StreamOutcome, UpstreamRequest};
pub use registry::{ProviderRegistry, RegistrySnapshot};
pub use router::{Route, Router};
