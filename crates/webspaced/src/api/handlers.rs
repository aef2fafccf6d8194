//! HTTP request handlers.

use std::collections::BTreeMap;

use axum::{
    Json,
    body::Body,
    extract::{Path, State, WebSocketUpgrade},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::webspace::{ExecOutput, InitRequest, Webspace, WebspaceConfig, WebspaceState};

use super::auth::CurrentUser;
use super::error::{ApiError, ApiResult};
use super::state::AppState;
use super::terminal::run_terminal;

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Health check endpoint.
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn load(state: &AppState, user: &CurrentUser) -> ApiResult<Webspace> {
    Ok(state.manager.get(user.user_id).await?)
}

// ============================================================================
// Webspace
// ============================================================================

#[instrument(skip(state, user, request), fields(user_id = user.user_id, image = %request.image))]
pub async fn create_webspace(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(request): Json<InitRequest>,
) -> ApiResult<(StatusCode, Json<Webspace>)> {
    let webspace = state.manager.create(user.user_id, &request).await?;
    info!("Created webspace");
    Ok((StatusCode::CREATED, Json(webspace)))
}

pub async fn get_webspace(
    State(state): State<AppState>,
    user: CurrentUser,
) -> ApiResult<Json<Webspace>> {
    Ok(Json(load(&state, &user).await?))
}

#[instrument(skip(state, user), fields(user_id = user.user_id))]
pub async fn delete_webspace(
    State(state): State<AppState>,
    user: CurrentUser,
) -> ApiResult<StatusCode> {
    let webspace = load(&state, &user).await?;
    state.manager.delete(&webspace).await?;
    info!("Deleted webspace");
    Ok(StatusCode::NO_CONTENT)
}

// ============================================================================
// Config
// ============================================================================

/// Partial config update. Absent fields keep their current value.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigPatch {
    pub startup_delay: Option<f64>,
    pub http_port: Option<u16>,
    pub sni_passthrough: Option<bool>,
}

impl ConfigPatch {
    fn apply(self, mut config: WebspaceConfig) -> WebspaceConfig {
        if let Some(delay) = self.startup_delay {
            config.startup_delay = delay;
        }
        if let Some(port) = self.http_port {
            config.http_port = port;
        }
        if let Some(sni) = self.sni_passthrough {
            config.sni_passthrough = sni;
        }
        config
    }
}

pub async fn get_config(
    State(state): State<AppState>,
    user: CurrentUser,
) -> ApiResult<Json<WebspaceConfig>> {
    Ok(Json(load(&state, &user).await?.config))
}

#[instrument(skip(state, user, patch), fields(user_id = user.user_id))]
pub async fn update_config(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(patch): Json<ConfigPatch>,
) -> ApiResult<Json<WebspaceConfig>> {
    let mut webspace = load(&state, &user).await?;
    let config = patch.apply(webspace.config.clone());
    state.manager.update_config(&mut webspace, config).await?;
    Ok(Json(webspace.config))
}

// ============================================================================
// State
// ============================================================================

pub async fn get_state(
    State(state): State<AppState>,
    user: CurrentUser,
) -> ApiResult<Json<WebspaceState>> {
    let webspace = load(&state, &user).await?;
    Ok(Json(state.manager.state(&webspace).await?))
}

#[instrument(skip(state, user), fields(user_id = user.user_id))]
pub async fn boot(State(state): State<AppState>, user: CurrentUser) -> ApiResult<StatusCode> {
    let webspace = load(&state, &user).await?;
    state.manager.boot(&webspace).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[instrument(skip(state, user), fields(user_id = user.user_id))]
pub async fn reboot(State(state): State<AppState>, user: CurrentUser) -> ApiResult<StatusCode> {
    let webspace = load(&state, &user).await?;
    state.manager.reboot(&webspace).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[instrument(skip(state, user), fields(user_id = user.user_id))]
pub async fn shutdown(State(state): State<AppState>, user: CurrentUser) -> ApiResult<StatusCode> {
    let webspace = load(&state, &user).await?;
    state.manager.shutdown(&webspace).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AddressResponse {
    pub address: String,
}

#[instrument(skip(state, user), fields(user_id = user.user_id))]
pub async fn ensure_started(
    State(state): State<AppState>,
    user: CurrentUser,
) -> ApiResult<Json<AddressResponse>> {
    let webspace = load(&state, &user).await?;
    let address = state.manager.ensure_started(&webspace).await?;
    Ok(Json(AddressResponse { address }))
}

/// Stream the console log.
pub async fn get_log(State(state): State<AppState>, user: CurrentUser) -> ApiResult<Response> {
    let webspace = load(&state, &user).await?;
    let log = state.manager.console_log(&webspace).await?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        Body::from_stream(log),
    )
        .into_response())
}

#[derive(Debug, Deserialize)]
pub struct ExecRequest {
    pub command: String,
}

#[instrument(skip(state, user, request), fields(user_id = user.user_id))]
pub async fn exec(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(request): Json<ExecRequest>,
) -> ApiResult<Json<ExecOutput>> {
    if request.command.trim().is_empty() {
        return Err(ApiError::bad_request("command cannot be empty"));
    }
    let webspace = load(&state, &user).await?;
    Ok(Json(state.manager.exec(&webspace, &request.command).await?))
}

/// Upgrade to a WebSocket running an interactive command in the webspace.
#[instrument(skip(state, user, ws), fields(user_id = user.user_id))]
pub async fn exec_interactive(
    State(state): State<AppState>,
    user: CurrentUser,
    ws: WebSocketUpgrade,
) -> ApiResult<Response> {
    let webspace = load(&state, &user).await?;
    let manager = state.manager.clone();
    Ok(ws.on_upgrade(move |socket| run_terminal(socket, manager, webspace)))
}

// ============================================================================
// Domains
// ============================================================================

pub async fn get_domains(
    State(state): State<AppState>,
    user: CurrentUser,
) -> ApiResult<Json<Vec<String>>> {
    let webspace = load(&state, &user).await?;
    Ok(Json(state.manager.domains(&webspace).await?))
}

#[instrument(skip(state, user), fields(user_id = user.user_id))]
pub async fn add_domain(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(domain): Path<String>,
) -> ApiResult<(StatusCode, Json<Vec<String>>)> {
    let mut webspace = load(&state, &user).await?;
    state.manager.add_domain(&mut webspace, &domain).await?;
    info!("Added domain");
    Ok((
        StatusCode::CREATED,
        Json(state.manager.domains(&webspace).await?),
    ))
}

#[instrument(skip(state, user), fields(user_id = user.user_id))]
pub async fn remove_domain(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(domain): Path<String>,
) -> ApiResult<StatusCode> {
    let mut webspace = load(&state, &user).await?;
    state.manager.remove_domain(&mut webspace, &domain).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ============================================================================
// Ports
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct PortMapping {
    pub external: u16,
    pub internal: u16,
}

pub async fn get_ports(
    State(state): State<AppState>,
    user: CurrentUser,
) -> ApiResult<Json<BTreeMap<u16, u16>>> {
    Ok(Json(load(&state, &user).await?.ports))
}

async fn forward_port(
    state: &AppState,
    user: &CurrentUser,
    external: u16,
    internal: u16,
) -> ApiResult<(StatusCode, Json<PortMapping>)> {
    let mut webspace = load(state, user).await?;
    let external = state
        .manager
        .add_port(&mut webspace, external, internal)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(PortMapping { external, internal }),
    ))
}

/// Forward a random free external port to `internal`.
#[instrument(skip(state, user), fields(user_id = user.user_id))]
pub async fn add_random_port(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(internal): Path<u16>,
) -> ApiResult<(StatusCode, Json<PortMapping>)> {
    forward_port(&state, &user, 0, internal).await
}

#[instrument(skip(state, user), fields(user_id = user.user_id))]
pub async fn add_port(
    State(state): State<AppState>,
    user: CurrentUser,
    Path((external, internal)): Path<(u16, u16)>,
) -> ApiResult<(StatusCode, Json<PortMapping>)> {
    forward_port(&state, &user, external, internal).await
}

#[instrument(skip(state, user), fields(user_id = user.user_id))]
pub async fn remove_port(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(external): Path<u16>,
) -> ApiResult<StatusCode> {
    let mut webspace = load(&state, &user).await?;
    state.manager.remove_port(&mut webspace, external).await?;
    Ok(StatusCode::NO_CONTENT)
}
