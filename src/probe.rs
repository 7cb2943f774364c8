//! Connection self-test for configured providers

use crate::{
    ChatRequest, Forwarder, Message, ProviderConfig, ProviderRegistry, Result, RetryPolicy,
    UpstreamError,
};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Longest diagnostic text kept in a [`ProbeResult`]
const MAX_RAW_MESSAGE: usize = 512;

const PROBE_PROMPT: &str = "Reply with OK.";
const PROBE_MAX_TOKENS: u32 = 16;

/// Outcome class of a probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeStatus {
    Ok,
    AuthFailed,
    Unreachable,
    MalformedResponse,
}

impl ProbeStatus {
    /// Classify an upstream failure.
    ///
    /// A throttled provider has accepted the credential, so it counts as ok.
    pub fn from_error(error: &UpstreamError) -> Self {
        match error {
            UpstreamError::AuthFailed { .. } => ProbeStatus::AuthFailed,
            UpstreamError::RateLimited { .. } => ProbeStatus::Ok,
            UpstreamError::Unavailable { .. } | UpstreamError::Rejected { .. } => ProbeStatus::Unreachable,
            UpstreamError::MalformedResponse { .. } => ProbeStatus::MalformedResponse,
        }
    }
}

impl std::fmt::Display for ProbeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ProbeStatus::Ok => "ok",
            ProbeStatus::AuthFailed => "auth_failed",
            ProbeStatus::Unreachable => "unreachable",
            ProbeStatus::MalformedResponse => "malformed_response",
        })
    }
}

/// Result of probing one model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeResult {
    pub model: String,
    pub status: ProbeStatus,
    pub latency_ms: u64,
    /// Reply text or upstream diagnostic, truncated
    pub raw_message: String,
}

impl ProbeResult {
    pub fn is_ok(&self) -> bool {
        self.status == ProbeStatus::Ok
    }
}

fn truncate(text: &str) -> String {
    text.chars().take(MAX_RAW_MESSAGE).collect()
}

/// Sends a minimal synthetic request through a dedicated forwarder
#[derive(Debug, Clone)]
pub struct Prober {
    forwarder: Forwarder,
}

impl Prober {
    /// Create a prober whose calls are bounded by `timeout` and never retried
    pub fn new(timeout: Duration) -> Result<Self> {
        Ok(Prober {
            forwarder: Forwarder::new(timeout, timeout, RetryPolicy::none())?,
        })
    }

    /// Probe one provider configuration
    pub async fn probe(&self, provider: &ProviderConfig) -> ProbeResult {
        let mut request = ChatRequest::new(
            provider.model_name.clone(),
            vec![Message::user(PROBE_PROMPT)],
        );
        request.max_tokens = Some(PROBE_MAX_TOKENS);

        let start = Instant::now();
        let outcome = self.forwarder.forward(provider, &request).await;
        let latency_ms = start.elapsed().as_millis() as u64;

        let (status, raw_message) = match outcome {
            Ok(response) => (ProbeStatus::Ok, response.content().unwrap_or_default().to_string()),
            Err(e) => {
                let message = match &e {
                    UpstreamError::MalformedResponse { raw, .. } if !raw.is_empty() => raw.clone(),
                    other => other.to_string(),
                };
                (ProbeStatus::from_error(&e), message)
            }
        };

        ProbeResult {
            model: provider.model_name.clone(),
            status,
            latency_ms,
            raw_message: truncate(&raw_message),
        }
    }

    /// Resolve `model` in the registry and probe it
    pub async fn probe_model(&self, registry: &ProviderRegistry, model: &str) -> Result<ProbeResult> {
        let provider = registry.resolve(model)?;
        Ok(self.probe(&provider).await)
    }

    /// Probe every registered model concurrently.
    ///
    /// Failures are logged, never returned as errors.
    pub async fn probe_all(&self, registry: &ProviderRegistry) -> Vec<ProbeResult> {
        let snapshot = registry.snapshot();
        let results = futures::future::join_all(snapshot.configs().map(|config| self.probe(config))).await;

        for result in &results {
            if result.is_ok() {
                tracing::info!(model = %result.model, latency_ms = result.latency_ms, "Provider probe ok");
            } else {
                tracing::warn!(
                    model = %result.model,
                    status = %result.status,
                    "Provider probe failed: {}",
                    result.raw_message
                );
            }
        }
        results
    }
}
