/// Axum handlers for the gateway
use crate::access::{AccessDecision, authorize};
use crate::auth::{AdminUser, VerifiedUser};
use crate::catalog::{ModelList, endpoint_entries};
use crate::client::HttpClient;
use crate::endpoints::{ConfigForm, GatewayConfig};
use crate::errors::GatewayError;
use crate::payload::{ChatCompletionPayload, ProxyRequest, adapt};
use crate::proxy::{UpstreamCall, execute};
use crate::resolver::resolve;
use crate::AppState;
use axum::{
    Json,
    body::Bytes,
    extract::{Path, Query, State},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Default, Deserialize)]
pub struct CompletionParams {
    #[serde(default)]
    pub bypass_filter: bool,
}

#[instrument(skip(state, caller))]
pub async fn models<T: HttpClient>(
    State(state): State<AppState<T>>,
    VerifiedUser(caller): VerifiedUser,
) -> Json<ModelList> {
    let config = state.config.snapshot();
    let catalog = state.catalog.get_models(&config);
    debug!("Listing {} models for {}", catalog.len(), caller.id);
    Json(ModelList {
        data: catalog.entries().to_vec(),
    })
}

#[instrument(skip(state, _caller))]
pub async fn endpoint_models<T: HttpClient>(
    State(state): State<AppState<T>>,
    Path(endpoint_index): Path<usize>,
    VerifiedUser(_caller): VerifiedUser,
) -> Json<ModelList> {
    let config = state.config.snapshot();
    Json(ModelList {
        data: endpoint_entries(&config, endpoint_index),
    })
}

#[instrument(skip(state, body, caller), fields(caller = %caller.id))]
pub async fn chat_completions<T: HttpClient>(
    State(state): State<AppState<T>>,
    Query(params): Query<CompletionParams>,
    VerifiedUser(caller): VerifiedUser,
    body: Bytes,
) -> Result<Response, GatewayError> {
    let payload: ChatCompletionPayload = serde_json::from_slice(&body)
        .map_err(|e| GatewayError::BadRequest(format!("Invalid completion request: {e}")))?;

    if params.bypass_filter {
        debug!("Caller {} requested bypass_filter", caller.id);
    }
    let bypass = state.settings.bypass_model_access_control || params.bypass_filter;

    let mut request = ProxyRequest::new(payload, caller, bypass);
    if let Some(metadata) = &request.metadata {
        debug!("Dropping request metadata: {}", metadata);
    }

    let record = state
        .model_records
        .get_model_by_id(request.requested_model_id());
    if let Some(base_model_id) = record.as_ref().and_then(|r| r.base_model_id.clone()) {
        debug!(
            "Model {} is served by base model {}",
            request.payload.model, base_model_id
        );
        request.payload.model = base_model_id;
    }

    if let AccessDecision::Deny(reason) =
        authorize(&request.caller, record.as_ref(), request.bypass_access_check)
    {
        warn!(
            "Denying {} access to {}: {}",
            request.caller.id,
            request.requested_model_id(),
            reason
        );
        return Err(GatewayError::AccessDenied);
    }

    let config = state.config.snapshot();
    let resolved = resolve(&state.catalog, &config, request.requested_model_id())?;
    info!(
        "Received request for model {} from {}",
        resolved.entry.id, request.caller.id
    );

    let payload = adapt(request.payload, &resolved, &request.caller);
    let forwarded_identity = state
        .settings
        .forward_user_info_headers
        .then_some(&request.caller);

    let result = execute(
        &state.http_client,
        &state.connections,
        state.settings.timeout,
        UpstreamCall::builder()
            .base_url(&resolved.endpoint.base_url)
            .api_key(&resolved.endpoint.api_key)
            .payload(&payload)
            .maybe_forwarded_identity(forwarded_identity)
            .build(),
    )
    .await?;

    debug!(
        "Upstream call done, {} connections in flight",
        state.connections.in_flight()
    );
    Ok(result.into_response())
}

#[instrument(skip(state, _admin))]
pub async fn get_config<T: HttpClient>(
    State(state): State<AppState<T>>,
    AdminUser(_admin): AdminUser,
) -> Json<GatewayConfig> {
    Json(state.config.snapshot().as_ref().clone())
}

#[instrument(skip(state, admin, form), fields(admin = %admin.id))]
pub async fn update_config<T: HttpClient>(
    State(state): State<AppState<T>>,
    AdminUser(admin): AdminUser,
    Json(form): Json<ConfigForm>,
) -> Result<Json<GatewayConfig>, GatewayError> {
    let updated = state
        .config
        .snapshot()
        .apply_update(form)
        .map_err(GatewayError::BadRequest)?;

    info!(
        "Updating endpoint config: {} endpoints",
        updated.base_urls.len()
    );
    state.config.store(updated.clone());
    state.catalog.invalidate();
    Ok(Json(updated))
}
