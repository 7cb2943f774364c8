//! Administrative API, mounted under `/admin`
//!
//! Every route requires `Authorization: Bearer <admin_token>`.

use super::handlers::{bearer_token, parse_json, GatewayState};
use crate::keys::digest;
use crate::{AllowedModels, ApiKeyRecord, AuditEntry, Error, ProbeResult, ProviderConfig, ProviderDocument, Result};
use axum::{
    body::Bytes,
    extract::{Path, Query, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

const DEFAULT_LOG_LIMIT: usize = 50;

/// Admin routes guarded by the admin token
pub fn routes(state: GatewayState) -> Router<GatewayState> {
    Router::new()
        .route("/keys", get(list_keys).post(create_key))
        .route("/keys/:key", delete(revoke_key))
        .route(
            "/providers",
            get(list_providers).put(reload_providers).post(upsert_provider),
        )
        .route("/providers/:model", delete(remove_provider))
        .route("/probe/:model", post(probe_model))
        .route("/logs", get(recent_logs))
        .route_layer(middleware::from_fn_with_state(state, require_admin))
}

async fn require_admin(State(state): State<GatewayState>, req: Request, next: Next) -> Response {
    let authorized = match (state.admin_token.as_deref(), bearer_token(req.headers())) {
        (Some(expected), Some(given)) => token_matches(expected, given),
        _ => false,
    };
    if !authorized {
        return Error::InvalidKey.into_response();
    }
    next.run(req).await
}

// Digests are compared so timing says nothing about a shared prefix
fn token_matches(expected: &str, given: &str) -> bool {
    digest(expected) == digest(given)
}

#[derive(Debug, Deserialize)]
struct CreateKeyRequest {
    instance_name: String,
    #[serde(default)]
    allowed_models: Option<AllowedModels>,
}

async fn list_keys(State(state): State<GatewayState>) -> Json<Vec<ApiKeyRecord>> {
    Json(state.keys().list())
}

async fn create_key(State(state): State<GatewayState>, body: Bytes) -> Result<(StatusCode, Json<ApiKeyRecord>)> {
    let request: CreateKeyRequest = parse_json(&body)?;
    let allowed = request.allowed_models.unwrap_or(AllowedModels::All);
    let record = state.keys().issue(&request.instance_name, allowed)?;
    info!(instance = %record.instance_name, "API key issued via admin API");
    Ok((StatusCode::CREATED, Json(record)))
}

async fn revoke_key(State(state): State<GatewayState>, Path(key): Path<String>) -> Result<StatusCode> {
    state.keys().revoke(&key)?;
    Ok(StatusCode::NO_CONTENT)
}

fn redacted_snapshot(state: &GatewayState) -> Value {
    let snapshot = state.registry().snapshot();
    let models: Vec<ProviderConfig> = snapshot.configs().map(|c| c.redacted()).collect();
    json!({
        "version": snapshot.version,
        "models": models,
    })
}

async fn list_providers(State(state): State<GatewayState>) -> Json<Value> {
    Json(redacted_snapshot(&state))
}

async fn reload_providers(State(state): State<GatewayState>, body: Bytes) -> Result<Json<Value>> {
    let document = ProviderDocument::from_json(parse_json(&body)?)?;
    state.registry().reload(document.models)?;
    Ok(Json(redacted_snapshot(&state)))
}

async fn upsert_provider(State(state): State<GatewayState>, body: Bytes) -> Result<Json<ProviderConfig>> {
    let value: Value = parse_json(&body)?;
    let model = value
        .get("model")
        .and_then(Value::as_str)
        .unwrap_or("<unnamed>")
        .to_string();
    let config: ProviderConfig =
        serde_json::from_value(value).map_err(|e| Error::invalid(model, e.to_string()))?;
    let redacted = config.redacted();
    state.registry().upsert(config)?;
    Ok(Json(redacted))
}

async fn remove_provider(State(state): State<GatewayState>, Path(model): Path<String>) -> Result<StatusCode> {
    state.registry().remove(&model)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn probe_model(State(state): State<GatewayState>, Path(model): Path<String>) -> Result<Json<ProbeResult>> {
    let result = state.prober.probe_model(state.registry(), &model).await?;
    Ok(Json(result))
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    limit: Option<usize>,
}

async fn recent_logs(State(state): State<GatewayState>, Query(query): Query<LogsQuery>) -> Json<Vec<AuditEntry>> {
    Json(state.audit.recent(query.limit.unwrap_or(DEFAULT_LOG_LIMIT)))
}
