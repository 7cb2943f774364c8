//! HTTP request handlers for the gateway

use super::config::GatewayConfig;
use super::error::error_body;
use crate::{
    AuditEntry, AuditLog, ChatRequest, ChunkStream, CredentialStore, Error, Forwarder, Prober,
    ProviderRegistry, Result, Route, Router, Stage,
};
use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{header, HeaderMap, HeaderValue},
    response::{IntoResponse, Response},
    Json,
};
use futures::stream::StreamExt;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error};

/// Gateway state shared across handlers
#[derive(Clone)]
pub struct GatewayState {
    pub router: Router,
    pub forwarder: Forwarder,
    pub prober: Prober,
    pub audit: Arc<AuditLog>,
    pub require_auth_for_models: bool,
    pub admin_token: Option<Arc<str>>,
}

impl GatewayState {
    pub fn new(keys: Arc<CredentialStore>, registry: Arc<ProviderRegistry>, config: &GatewayConfig) -> Result<Self> {
        Ok(GatewayState {
            router: Router::new(keys, registry),
            forwarder: Forwarder::new(
                config.request_timeout(),
                config.stream_idle_timeout(),
                config.retry_policy(),
            )?,
            prober: Prober::new(config.probe_timeout())?,
            audit: Arc::new(AuditLog::new(config.audit_capacity)),
            require_auth_for_models: config.require_auth_for_models,
            admin_token: config.admin_token.as_deref().map(Arc::from),
        })
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        self.router.registry()
    }

    pub fn keys(&self) -> &Arc<CredentialStore> {
        self.router.keys()
    }
}

/// Token from an `Authorization: Bearer <token>` header
pub(crate) fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}

/// Decode a JSON request body, reporting failures as bad requests
pub(crate) fn parse_json<T: DeserializeOwned>(body: &[u8]) -> Result<T> {
    serde_json::from_slice(body).map_err(|e| Error::BadRequest(format!("invalid JSON body: {}", e)))
}

/// Records the audit entry for one chat request when dropped, so requests
/// cut short by a disconnect are still accounted for.
struct AuditGuard {
    log: Arc<AuditLog>,
    entry: AuditEntry,
    start: Instant,
}

impl AuditGuard {
    fn new(log: Arc<AuditLog>) -> Self {
        AuditGuard {
            log,
            entry: AuditEntry::received(uuid::Uuid::new_v4().to_string()),
            start: Instant::now(),
        }
    }

    fn fail(&mut self, err: &Error) {
        self.entry.status = err.status_code().as_u16();
        self.entry.category = Some(err.category().to_string());
        error!(
            request_id = %self.entry.request_id,
            model = self.entry.model.as_deref().unwrap_or("-"),
            stage = %self.entry.stage,
            "Chat request failed: {}",
            err
        );
    }

    fn complete(&mut self) {
        self.entry.stage = Stage::Completed;
        self.entry.status = 200;
    }
}

impl Drop for AuditGuard {
    fn drop(&mut self) {
        self.entry.latency_ms = self.start.elapsed().as_millis() as u64;
        self.log.record(self.entry.clone());
    }
}

/// Authenticate, decode and route a chat request
fn route_chat(state: &GatewayState, headers: &HeaderMap, body: &[u8], entry: &mut AuditEntry) -> Result<(Route, ChatRequest)> {
    let key = bearer_token(headers).ok_or(Error::InvalidKey)?;
    let caller = state.router.authenticate(key)?;
    entry.caller = caller.instance_name.clone();
    entry.stage = Stage::Authenticated;

    let request: ChatRequest = parse_json(body)?;
    entry.model = Some(request.model.clone());
    entry.stream = request.stream;
    if request.messages.is_empty() {
        return Err(Error::BadRequest("messages must not be empty".into()));
    }

    let route = state.router.authorize(caller, &request.model)?;
    entry.stage = Stage::Routed;
    Ok((route, request))
}

/// Handle `POST /v1/chat/completions`
pub async fn chat_completions(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let mut audit = AuditGuard::new(state.audit.clone());

    let (route, request) = match route_chat(&state, &headers, &body, &mut audit.entry) {
        Ok(routed) => routed,
        Err(e) => {
            audit.fail(&e);
            return e.into_response();
        }
    };

    debug!(
        request_id = %audit.entry.request_id,
        caller = %route.caller.instance_name,
        model = %request.model,
        provider = %route.provider.provider_type,
        stream = request.stream,
        "Forwarding chat request"
    );

    if request.stream {
        match state.forwarder.forward_stream(&route.provider, &request).await {
            Ok(upstream) => {
                audit.entry.stage = Stage::Forwarded;
                audit.entry.status = 200;
                sse_response(upstream, audit)
            }
            Err(e) => {
                let e = Error::from(e);
                audit.fail(&e);
                e.into_response()
            }
        }
    } else {
        match state.forwarder.forward(&route.provider, &request).await {
            Ok(response) => {
                audit.complete();
                Json(response).into_response()
            }
            Err(e) => {
                let e = Error::from(e);
                audit.fail(&e);
                e.into_response()
            }
        }
    }
}

/// Relay upstream chunks as `text/event-stream`, ending with `data: [DONE]`
fn sse_response(mut upstream: ChunkStream, mut audit: AuditGuard) -> Response {
    let body_stream = async_stream::stream! {
        let mut failed = false;
        while let Some(item) = upstream.next().await {
            let data = match item {
                Ok(chunk) => serde_json::to_string(&chunk).map_err(Error::from),
                Err(e) => Err(Error::from(e)),
            };
            match data {
                Ok(json) => yield Ok::<_, std::io::Error>(format!("data: {}\n\n", json)),
                Err(e) => {
                    audit.fail(&e);
                    failed = true;
                    let body = error_body(e.status_code(), &e.to_string(), e.category());
                    yield Ok(format!("data: {}\n\n", body));
                    break;
                }
            }
        }
        if !failed {
            audit.complete();
        }
        yield Ok("data: [DONE]\n\n".to_string());
    };

    let mut response = Response::new(Body::from_stream(body_stream));
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
    response
}

/// Handle `GET /v1/models`
pub async fn list_models(State(state): State<GatewayState>, headers: HeaderMap) -> Result<Json<Value>> {
    if state.require_auth_for_models {
        let key = bearer_token(&headers).ok_or(Error::InvalidKey)?;
        state.router.authenticate(key)?;
    }

    let snapshot = state.registry().snapshot();
    let data: Vec<Value> = snapshot
        .configs()
        .map(|config| {
            json!({
                "id": config.model_name,
                "object": "model",
                "owned_by": config.provider_type.config_key(),
            })
        })
        .collect();

    Ok(Json(json!({
        "object": "list",
        "data": data
    })))
}

/// Handle `GET /health`
pub async fn health(State(state): State<GatewayState>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "models": state.registry().list_models(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn test_bearer_token() {
        assert_eq!(bearer_token(&headers("Bearer sk-abc")), Some("sk-abc"));
        assert_eq!(bearer_token(&headers("bearer  sk-abc ")), Some("sk-abc"));
        assert_eq!(bearer_token(&headers("Basic dXNlcg==")), None);
        assert_eq!(bearer_token(&headers("Bearer ")), None);
        assert_eq!(bearer_token(&HeaderMap::new()), None);
    }

    #[test]
    fn test_parse_json_reports_bad_request() {
        let err = parse_json::<ChatRequest>(b"{not json").unwrap_err();
        assert!(matches!(err, Error::BadRequest(_)));
    }
}
