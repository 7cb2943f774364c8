//! Provider configuration
//!
//! Each logical model name maps to one upstream provider entry. Entries are
//! kept in a provider document:
//!
//! ```toml
//! [[models]]
//! model = "gpt-4"
//! provider = "azure"
//! endpoint = "https://contoso.openai.azure.com"
//! credential = "..."
//! api_version = "2023-07-01-preview"
//! upstream_model = "gpt-4-deployment"
//!
//! [[models]]
//! model = "claude-3-opus"
//! provider = "anthropic"
//! credential = "sk-ant-..."
//! upstream_model = "claude-3-opus-20240229"
//! ```

use super::{persist, Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;

/// Default Anthropic API version header
pub const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Default Azure OpenAI API version used when seeding from the environment
pub const AZURE_API_VERSION: &str = "2023-07-01-preview";

/// Provider type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderType {
    /// OpenAI API
    OpenAI,
    /// Anthropic Messages API
    Anthropic,
    /// Azure OpenAI deployments
    Azure,
    /// Google Gemini API
    Gemini,
}

impl ProviderType {
    /// Get the default API base URL for this provider type
    pub fn default_base_url(&self) -> Option<&'static str> {
        match self {
            ProviderType::OpenAI => Some("https://api.openai.com/v1"),
            ProviderType::Anthropic => Some("https://api.anthropic.com"),
            ProviderType::Gemini => Some("https://generativelanguage.googleapis.com/v1beta"),
            // Every Azure resource has its own endpoint
            ProviderType::Azure => None,
        }
    }

    /// Get the config key for this provider
    pub fn config_key(&self) -> &'static str {
        match self {
            ProviderType::OpenAI => "openai",
            ProviderType::Anthropic => "anthropic",
            ProviderType::Azure => "azure",
            ProviderType::Gemini => "gemini",
        }
    }
}

impl FromStr for ProviderType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "openai" => Ok(ProviderType::OpenAI),
            "anthropic" => Ok(ProviderType::Anthropic),
            "azure" => Ok(ProviderType::Azure),
            "gemini" => Ok(ProviderType::Gemini),
            _ => Err(format!(
                "Unknown provider type: {}. Must be one of openai, anthropic, azure, gemini",
                s
            )),
        }
    }
}

impl std::fmt::Display for ProviderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.config_key())
    }
}

/// Configuration for one logical model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Logical model name requested by callers
    #[serde(rename = "model")]
    pub model_name: String,

    /// Upstream provider
    #[serde(rename = "provider")]
    pub provider_type: ProviderType,

    /// API base URL (required for Azure)
    #[serde(rename = "endpoint", default, skip_serializing_if = "Option::is_none")]
    pub endpoint_base: Option<String>,

    /// Upstream API key
    pub credential: String,

    /// API version (required for Azure, optional Anthropic header override)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,

    /// Provider-side model id or Azure deployment name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream_model: Option<String>,

    /// Completion budget when the caller sets none
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

impl ProviderConfig {
    /// Create a configuration with provider defaults
    pub fn new(
        model_name: impl Into<String>,
        provider_type: ProviderType,
        credential: impl Into<String>,
    ) -> Self {
        ProviderConfig {
            model_name: model_name.into(),
            provider_type,
            endpoint_base: None,
            credential: credential.into(),
            api_version: None,
            upstream_model: None,
            max_tokens: None,
        }
    }

    /// Create an Azure deployment configuration
    pub fn azure(
        model_name: impl Into<String>,
        endpoint: impl Into<String>,
        credential: impl Into<String>,
        api_version: impl Into<String>,
    ) -> Self {
        ProviderConfig {
            endpoint_base: Some(endpoint.into()),
            api_version: Some(api_version.into()),
            ..Self::new(model_name, ProviderType::Azure, credential)
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint_base = Some(endpoint.into());
        self
    }

    pub fn with_upstream_model(mut self, upstream_model: impl Into<String>) -> Self {
        self.upstream_model = Some(upstream_model.into());
        self
    }

    /// Base URL without a trailing slash
    pub fn api_base(&self) -> &str {
        self.endpoint_base
            .as_deref()
            .or_else(|| self.provider_type.default_base_url())
            .unwrap_or_default()
            .trim_end_matches('/')
    }

    /// Model id sent upstream
    pub fn upstream_model(&self) -> &str {
        self.upstream_model.as_deref().unwrap_or(&self.model_name)
    }

    /// Get the max_tokens value, falling back to 4096
    pub fn max_tokens(&self) -> u32 {
        self.max_tokens.unwrap_or(4096)
    }

    /// Check write-time invariants
    pub fn validate(&self) -> Result<()> {
        let model = &self.model_name;
        if model.trim().is_empty() {
            return Err(Error::invalid("<unnamed>", "model name must not be empty"));
        }
        if self.credential.trim().is_empty() {
            return Err(Error::invalid(model, "credential must not be empty"));
        }
        if let Some(endpoint) = &self.endpoint_base {
            let parsed = url::Url::parse(endpoint)
                .map_err(|e| Error::invalid(model, format!("invalid endpoint '{}': {}", endpoint, e)))?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(Error::invalid(model, format!("endpoint '{}' must be http or https", endpoint)));
            }
        }
        if self.provider_type == ProviderType::Azure {
            if self.endpoint_base.as_deref().map_or(true, |e| e.trim().is_empty()) {
                return Err(Error::invalid(model, "azure entries require an endpoint"));
            }
            if self.api_version.as_deref().map_or(true, |v| v.trim().is_empty()) {
                return Err(Error::invalid(model, "azure entries require an api_version"));
            }
        }
        if self.max_tokens == Some(0) {
            return Err(Error::invalid(model, "max_tokens must be positive"));
        }
        Ok(())
    }

    /// Copy with the credential masked, for display
    pub fn redacted(&self) -> Self {
        let visible: String = self.credential.chars().take(4).collect();
        ProviderConfig {
            credential: format!("{}****", visible),
            ..self.clone()
        }
    }
}

/// Serialized set of provider configurations
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderDocument {
    #[serde(default)]
    pub models: Vec<ProviderConfig>,
}

#[derive(Deserialize)]
struct RawDocument<V> {
    #[serde(default = "Vec::new")]
    models: Vec<V>,
}

impl ProviderDocument {
    /// Parse a TOML document. Entry errors name the offending model.
    pub fn parse(text: &str) -> Result<Self> {
        let raw: RawDocument<toml::Value> = toml::from_str(text)
            .map_err(|e| Error::Config(format!("invalid provider document: {}", e)))?;
        let models = raw
            .models
            .into_iter()
            .map(|entry| {
                let model = entry_name(entry.get("model").and_then(|v| v.as_str()));
                entry
                    .try_into::<ProviderConfig>()
                    .map_err(|e| Error::invalid(model, e.to_string()))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(ProviderDocument { models })
    }

    /// Decode a JSON document such as an admin request body
    pub fn from_json(value: serde_json::Value) -> Result<Self> {
        let raw: RawDocument<serde_json::Value> = serde_json::from_value(value)
            .map_err(|e| Error::BadRequest(format!("invalid provider document: {}", e)))?;
        let models = raw
            .models
            .into_iter()
            .map(|entry| {
                let model = entry_name(entry.get("model").and_then(|v| v.as_str()));
                serde_json::from_value::<ProviderConfig>(entry)
                    .map_err(|e| Error::invalid(model, e.to_string()))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(ProviderDocument { models })
    }

    /// Render as TOML
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }

    /// Load from disk; `None` when the file does not exist
    pub fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text).map(Some)
    }

    /// Atomically replace the document on disk
    pub fn save(&self, path: &Path) -> Result<()> {
        persist::replace_file(path, self.to_toml()?.as_bytes())
    }

    /// Seed a document from the process environment
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Seed a document from provider credentials.
    ///
    /// Recognized variables:
    /// - `OPENAI_API_KEY` - gpt-4o, gpt-4-turbo, gpt-4, gpt-3.5-turbo
    /// - `ANTHROPIC_API_KEY` - claude-3-opus, claude-3-sonnet, claude-3-haiku, claude-3.7-sonnet
    /// - `GEMINI_API_KEY` - gemini-2.0-flash
    /// - `AZURE_API_BASE`, `AZURE_API_KEY`, `AZURE_API_VERSION` - gpt-4 and
    ///   gpt-3.5-turbo served from Azure deployments of the same name
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let mut models: indexmap::IndexMap<String, ProviderConfig> = indexmap::IndexMap::new();

        if let Some(key) = var("OPENAI_API_KEY") {
            for name in ["gpt-4o", "gpt-4-turbo", "gpt-4", "gpt-3.5-turbo"] {
                models.insert(name.to_string(), ProviderConfig::new(name, ProviderType::OpenAI, &key));
            }
        }

        if let Some(key) = var("ANTHROPIC_API_KEY") {
            for (name, upstream) in [
                ("claude-3-opus", "claude-3-opus-20240229"),
                ("claude-3-sonnet", "claude-3-sonnet-20240229"),
                ("claude-3-haiku", "claude-3-haiku-20240307"),
                ("claude-3.7-sonnet", "claude-3-7-sonnet-20250219"),
            ] {
                models.insert(
                    name.to_string(),
                    ProviderConfig::new(name, ProviderType::Anthropic, &key).with_upstream_model(upstream),
                );
            }
        }

        if let Some(key) = var("GEMINI_API_KEY") {
            let name = "gemini-2.0-flash";
            models.insert(name.to_string(), ProviderConfig::new(name, ProviderType::Gemini, &key));
        }

        if let (Some(base), Some(key)) = (var("AZURE_API_BASE"), var("AZURE_API_KEY")) {
            let version = var("AZURE_API_VERSION").unwrap_or_else(|| AZURE_API_VERSION.to_string());
            for name in ["gpt-4", "gpt-3.5-turbo"] {
                models.insert(name.to_string(), ProviderConfig::azure(name, &base, &key, &version));
            }
        }

        ProviderDocument {
            models: models.into_values().collect(),
        }
    }
}

fn entry_name(name: Option<&str>) -> String {
    name.unwrap_or("<unnamed>").to_string()
}
