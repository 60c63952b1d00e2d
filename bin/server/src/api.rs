//! Management API.
//!
//! Every route is a thin shell over [`Supervisor`]: handlers parse the
//! request, call one supervisor operation and shape the reply. Bodies use
//! camelCase field names.

use crate::error::ApiError;
use axum::{
    Json, Router,
    extract::{Path, State, rejection::JsonRejection},
    http::StatusCode,
    routing::{get, post},
};
use botwright_core::{BotId, ChatUserId, InstanceId};
use botwright_flow::{BotDefinition, InboundEvent, OutboundAction};
use botwright_runtime::{InstanceSummary, Supervisor};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// User id the simulator acts as when the request names none.
const SIMULATOR_USER: &str = "simulator";

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub supervisor: Arc<Supervisor>,
}

/// Builds the management router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/deploy", post(deploy))
        .route("/deploy/{bot_id}", post(deploy_by_id))
        .route("/undeploy/{bot_id}", post(undeploy))
        .route("/deployed", get(deployed))
        .route("/simulate/{bot_id}/command", post(simulate_command))
        .route("/simulate/{bot_id}/flow", post(simulate_flow))
        .route("/events/{bot_id}", post(route_event))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Serialize, Deserialize)]
struct HealthResponse {
    status: String,
    service: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeployResponse {
    message: String,
    bot_id: BotId,
    instance_id: InstanceId,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UndeployResponse {
    message: String,
    bot_id: BotId,
}

#[derive(Debug, Serialize)]
struct DeployedResponse {
    bots: Vec<InstanceSummary>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SimulateCommandRequest {
    #[serde(default)]
    user_id: Option<String>,
    command: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct SimulateCommandResponse {
    response: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SimulateFlowRequest {
    #[serde(default)]
    user_id: Option<String>,
    input: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct SimulateFlowResponse {
    actions: Vec<OutboundAction>,
}

fn parse_bot_id(raw: &str) -> Result<BotId, ApiError> {
    raw.parse().map_err(|e: botwright_core::ParseIdError| ApiError::InvalidRequest {
        message: e.to_string(),
    })
}

fn parse_user_id(raw: Option<String>) -> Result<ChatUserId, ApiError> {
    raw.as_deref()
        .unwrap_or(SIMULATOR_USER)
        .parse()
        .map_err(|e: botwright_core::ParseIdError| ApiError::InvalidRequest {
            message: e.to_string(),
        })
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "OK".to_string(),
        service: "bot-runtime".to_string(),
    })
}

async fn deploy(
    State(state): State<AppState>,
    body: Result<Json<BotDefinition>, JsonRejection>,
) -> Result<Json<DeployResponse>, ApiError> {
    let Json(definition) = body?;
    let bot_id = definition.id.clone();
    let instance_id = state.supervisor.deploy(definition).await?;
    Ok(Json(DeployResponse {
        message: "Bot deployed successfully".to_string(),
        bot_id,
        instance_id,
    }))
}

async fn deploy_by_id(
    State(state): State<AppState>,
    Path(bot_id): Path<String>,
) -> Result<Json<DeployResponse>, ApiError> {
    let bot_id = parse_bot_id(&bot_id)?;
    let instance_id = state.supervisor.deploy_by_id(&bot_id).await?;
    Ok(Json(DeployResponse {
        message: "Bot deployed successfully".to_string(),
        bot_id,
        instance_id,
    }))
}

async fn undeploy(
    State(state): State<AppState>,
    Path(bot_id): Path<String>,
) -> Result<Json<UndeployResponse>, ApiError> {
    let bot_id = parse_bot_id(&bot_id)?;
    state.supervisor.undeploy(&bot_id).await?;
    Ok(Json(UndeployResponse {
        message: "Bot undeployed successfully".to_string(),
        bot_id,
    }))
}

async fn deployed(State(state): State<AppState>) -> Json<DeployedResponse> {
    Json(DeployedResponse {
        bots: state.supervisor.list_deployed(),
    })
}

async fn simulate_command(
    State(state): State<AppState>,
    Path(bot_id): Path<String>,
    body: Result<Json<SimulateCommandRequest>, JsonRejection>,
) -> Result<Json<SimulateCommandResponse>, ApiError> {
    let Json(request) = body?;
    let bot_id = parse_bot_id(&bot_id)?;
    let user_id = parse_user_id(request.user_id)?;
    if request.command.trim().trim_start_matches('/').is_empty() {
        return Err(ApiError::InvalidRequest {
            message: "command must not be empty".to_string(),
        });
    }

    let response = state
        .supervisor
        .simulate_command(&bot_id, &user_id, &request.command)?;
    Ok(Json(SimulateCommandResponse { response }))
}

async fn simulate_flow(
    State(state): State<AppState>,
    Path(bot_id): Path<String>,
    body: Result<Json<SimulateFlowRequest>, JsonRejection>,
) -> Result<Json<SimulateFlowResponse>, ApiError> {
    let Json(request) = body?;
    let bot_id = parse_bot_id(&bot_id)?;
    let user_id = parse_user_id(request.user_id)?;
    let actions = state
        .supervisor
        .simulate_flow_step(&bot_id, &user_id, &request.input)
        .await?;
    Ok(Json(SimulateFlowResponse { actions }))
}

async fn route_event(
    State(state): State<AppState>,
    Path(bot_id): Path<String>,
    body: Result<Json<InboundEvent>, JsonRejection>,
) -> Result<StatusCode, ApiError> {
    let Json(event) = body?;
    let bot_id = parse_bot_id(&bot_id)?;
    state.supervisor.route(&bot_id, event)?;
    Ok(StatusCode::ACCEPTED)
}
