//! REST API Handlers
//!
//! Implements the REST API endpoints for volume attach/detach, connectors,
//! FCP templates and device usage. Every action runs in its own task so a
//! client that disconnects never interrupts an operation half way.

use crate::controlplane::action::{ActionOutput, ConnectorRequest, TemplateQuery, VolumeAction};
use crate::controlplane::Orchestrator;
use crate::domain::ports::{FcpId, FcpUsage, VolumeConnection};
use crate::error::{Error, Result};
use crate::pool::{CreateTemplateRequest, EditTemplateRequest};
use axum::{
    extract::{Json, Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{debug, error};

// =============================================================================
// Request/Response Types
// =============================================================================

/// Connector request body; the assigner comes from the path
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectorBody {
    pub reserve: bool,
    pub template_id: Option<String>,
    pub storage_provider: Option<String>,
}

/// Reserve/unreserve body
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignerBody {
    pub assigner_id: String,
}

/// Template listing query; list values are comma separated
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TemplateListParams {
    pub template_ids: Option<String>,
    pub assigner_id: Option<String>,
    pub host_default: bool,
    pub storage_providers: Option<String>,
}

/// Template details query
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TemplateDetailsParams {
    pub template_ids: Option<String>,
    pub raw: bool,
    pub statistics: bool,
    pub sync_with_hardware: bool,
}

/// API error response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiErrorResponse {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ApiErrorResponse {
    fn from_error(e: &Error) -> Self {
        let details = match e {
            Error::Operation { rolled_back, .. } if !rolled_back.is_empty() => {
                Some(format!("rolled back: {}", rolled_back.join(",")))
            }
            Error::RollbackFailed {
                rollback_errors, ..
            } => Some(rollback_errors.join("; ")),
            _ => None,
        };
        Self {
            error: e.code().into(),
            message: e.to_string(),
            details,
        }
    }
}

// =============================================================================
// REST Router
// =============================================================================

/// REST API router builder
pub struct RestRouter {
    orchestrator: Arc<Orchestrator>,
}

impl RestRouter {
    /// Create a new REST router
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }

    /// Build the Axum router
    pub fn build(self) -> Router {
        let state = AppState {
            orchestrator: self.orchestrator,
        };

        Router::new()
            // Volume endpoints
            .route("/v1/volumes/attach", post(attach_volume))
            .route("/v1/volumes/detach", post(detach_volume))
            .route("/v1/connectors/:assigner", post(get_volume_connector))
            // Template endpoints
            .route("/v1/fcp-templates", get(list_templates).post(create_template))
            .route("/v1/fcp-templates/details", get(template_details))
            .route(
                "/v1/fcp-templates/:id",
                get(get_template).put(edit_template).delete(delete_template),
            )
            .route("/v1/fcp-templates/:id/reserve", post(reserve_devices))
            .route("/v1/fcp-templates/:id/unreserve", post(unreserve_devices))
            // Device endpoints
            .route("/v1/fcp/sync", post(sync_with_hardware))
            .route("/v1/fcp/:id/usage", get(get_usage).put(set_usage))
            // Health & metrics
            .route("/health", get(health_check))
            .route("/ready", get(readiness_check))
            .route("/metrics", get(metrics))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }
}

/// Shared application state
#[derive(Clone)]
struct AppState {
    orchestrator: Arc<Orchestrator>,
}

// =============================================================================
// Action Execution
// =============================================================================

/// Run an action to completion independent of the client connection
async fn execute(state: &AppState, action: VolumeAction) -> Result<ActionOutput> {
    let orchestrator = state.orchestrator.clone();
    tokio::spawn(async move { orchestrator.dispatch(action).await })
        .await
        .map_err(|e| Error::Internal(format!("action task failed: {}", e)))?
}

fn respond(result: Result<ActionOutput>, success: StatusCode) -> Response {
    match result {
        Ok(ActionOutput::Done) => StatusCode::NO_CONTENT.into_response(),
        Ok(output) => (success, Json(output)).into_response(),
        Err(e) => error_response(&e),
    }
}

fn error_response(e: &Error) -> Response {
    let status = StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if status.is_server_error() {
        error!("Request failed: {}", e);
    } else {
        debug!("Request rejected: {}", e);
    }
    (status, Json(ApiErrorResponse::from_error(e))).into_response()
}

fn parse_fcp_id(raw: &str) -> std::result::Result<FcpId, Response> {
    FcpId::parse(raw).map_err(|e| error_response(&e))
}

fn split_list(raw: Option<String>) -> Option<Vec<String>> {
    raw.map(|list| {
        list.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect()
    })
}

// =============================================================================
// Handlers
// =============================================================================

/// Attach a volume
async fn attach_volume(
    State(state): State<AppState>,
    Json(connection): Json<VolumeConnection>,
) -> Response {
    respond(
        execute(&state, VolumeAction::Attach(connection)).await,
        StatusCode::OK,
    )
}

/// Detach a volume
async fn detach_volume(
    State(state): State<AppState>,
    Json(connection): Json<VolumeConnection>,
) -> Response {
    respond(
        execute(&state, VolumeAction::Detach(connection)).await,
        StatusCode::OK,
    )
}

/// Get (and optionally reserve) the connector of an assigner
async fn get_volume_connector(
    State(state): State<AppState>,
    Path(assigner): Path<String>,
    body: Option<Json<ConnectorBody>>,
) -> Response {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let request = ConnectorRequest {
        assigner_id: assigner,
        reserve: body.reserve,
        template_id: body.template_id,
        storage_provider: body.storage_provider,
    };
    respond(
        execute(&state, VolumeAction::GetVolumeConnector(request)).await,
        StatusCode::OK,
    )
}

/// List templates
async fn list_templates(
    State(state): State<AppState>,
    Query(params): Query<TemplateListParams>,
) -> Response {
    let query = TemplateQuery {
        template_ids: split_list(params.template_ids),
        assigner_id: params.assigner_id,
        host_default: params.host_default,
        storage_providers: split_list(params.storage_providers),
    };
    respond(
        execute(&state, VolumeAction::GetTemplates(query)).await,
        StatusCode::OK,
    )
}

/// Create a template
async fn create_template(
    State(state): State<AppState>,
    Json(request): Json<CreateTemplateRequest>,
) -> Response {
    respond(
        execute(&state, VolumeAction::CreateTemplate(request)).await,
        StatusCode::CREATED,
    )
}

/// Template details with optional raw records and statistics
async fn template_details(
    State(state): State<AppState>,
    Query(params): Query<TemplateDetailsParams>,
) -> Response {
    let action = VolumeAction::GetTemplatesDetails {
        template_ids: split_list(params.template_ids),
        raw: params.raw,
        statistics: params.statistics,
        sync_with_hardware: params.sync_with_hardware,
    };
    respond(execute(&state, action).await, StatusCode::OK)
}

/// Get one template
async fn get_template(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let query = TemplateQuery {
        template_ids: Some(vec![id.clone()]),
        ..Default::default()
    };
    match execute(&state, VolumeAction::GetTemplates(query)).await {
        Ok(ActionOutput::Templates(mut templates)) if !templates.is_empty() => {
            (StatusCode::OK, Json(templates.remove(0))).into_response()
        }
        Ok(_) => error_response(&Error::TemplateNotFound { template_id: id }),
        Err(e) => error_response(&e),
    }
}

/// Edit a template
async fn edit_template(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<EditTemplateRequest>,
) -> Response {
    let action = VolumeAction::EditTemplate {
        template_id: id,
        request,
    };
    respond(execute(&state, action).await, StatusCode::OK)
}

/// Delete a template
async fn delete_template(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    respond(
        execute(&state, VolumeAction::DeleteTemplate { template_id: id }).await,
        StatusCode::OK,
    )
}

/// Reserve devices of a template for an assigner
async fn reserve_devices(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<AssignerBody>,
) -> Response {
    let action = VolumeAction::ReserveDevices {
        assigner_id: body.assigner_id,
        template_id: Some(id),
        storage_provider: None,
    };
    respond(execute(&state, action).await, StatusCode::OK)
}

/// Release an assigner's unconnected devices of a template
async fn unreserve_devices(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<AssignerBody>,
) -> Response {
    let action = VolumeAction::UnreserveDevices {
        assigner_id: body.assigner_id,
        template_id: id,
    };
    respond(execute(&state, action).await, StatusCode::OK)
}

/// Reconcile stored devices with the hardware
async fn sync_with_hardware(State(state): State<AppState>) -> Response {
    respond(
        execute(&state, VolumeAction::SyncWithHardware).await,
        StatusCode::OK,
    )
}

/// Get a device's usage
async fn get_usage(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let fcp_id = match parse_fcp_id(&id) {
        Ok(fcp_id) => fcp_id,
        Err(response) => return response,
    };
    respond(
        execute(&state, VolumeAction::GetFcpUsage { fcp_id }).await,
        StatusCode::OK,
    )
}

/// Overwrite a device's usage
async fn set_usage(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(usage): Json<FcpUsage>,
) -> Response {
    let fcp_id = match parse_fcp_id(&id) {
        Ok(fcp_id) => fcp_id,
        Err(response) => return response,
    };
    respond(
        execute(&state, VolumeAction::SetFcpUsage { fcp_id, usage }).await,
        StatusCode::OK,
    )
}

/// Health check
async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Readiness check
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    (StatusCode::OK, Json(state.orchestrator.status()))
}

/// Prometheus metrics
async fn metrics(State(state): State<AppState>) -> Response {
    match state.orchestrator.metrics().render() {
        Ok(text) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            text,
        )
            .into_response(),
        Err(e) => error_response(&e),
    }
}
