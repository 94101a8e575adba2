//! HTTP API: execution log reads plus manual and event trigger endpoints.

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, warn};

use crate::engine::{Engine, FireOutcome};
use crate::error::Error;
use crate::idempotency::TriggerFiring;
use crate::metrics;
use crate::storage::{ExecutionQuery, ExecutionStatus};
use crate::triggers::{EventDispatcher, EventMessage};

/// Default maximum concurrent requests.
const DEFAULT_MAX_CONCURRENT_REQUESTS: usize = 100;
const DEFAULT_CORS_ORIGIN: &str = "http://localhost:3000";

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub engine: Engine,
    pub events: EventDispatcher,
}

impl AppState {
    pub fn new(engine: Engine) -> Self {
        Self {
            events: EventDispatcher::new(engine.clone()),
            engine,
        }
    }
}

/// Status code for an error surfaced by the engine.
fn error_status(e: &Error) -> StatusCode {
    match e {
        Error::Workflow(_) => StatusCode::CONFLICT,
        Error::Validation(_)
        | Error::MissingContext(_)
        | Error::Expression(_)
        | Error::Parse(_) => StatusCode::UNPROCESSABLE_ENTITY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Error response with a sanitized message. The full error is logged.
fn error_response(e: Error) -> Response {
    let status = error_status(&e);
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        error!("API error: {:?}", e);
    }
    (status, Json(json!({"error": e.external_message()}))).into_response()
}

fn not_found(what: &str, id: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"error": format!("{} '{}' not found", what, id)})),
    )
        .into_response()
}

/// CORS from `EDUFLOW_CORS_ORIGINS` (comma-separated), defaulting to localhost:3000.
pub fn create_cors_layer() -> CorsLayer {
    let origins_str =
        std::env::var("EDUFLOW_CORS_ORIGINS").unwrap_or_else(|_| DEFAULT_CORS_ORIGIN.to_string());

    let mut origins: Vec<HeaderValue> = origins_str
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|s| match s.parse::<HeaderValue>() {
            Ok(hv) => Some(hv),
            Err(e) => {
                warn!("Invalid CORS origin '{}': {}", s, e);
                None
            }
        })
        .collect();

    if origins.is_empty() {
        warn!("No valid CORS origins configured, using {}", DEFAULT_CORS_ORIGIN);
        origins.push(HeaderValue::from_static(DEFAULT_CORS_ORIGIN));
    }

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
}

/// Concurrency limit from `EDUFLOW_MAX_CONCURRENT_REQUESTS` (default 100).
pub fn create_concurrency_limit() -> tower::limit::ConcurrencyLimitLayer {
    let max = std::env::var("EDUFLOW_MAX_CONCURRENT_REQUESTS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_MAX_CONCURRENT_REQUESTS);
    tower::limit::ConcurrencyLimitLayer::new(max)
}

/// Routes without state applied.
pub fn create_api_routes() -> Router<AppState> {
    Router::new()
        .route("/api/health", get(health_check))
        .route("/metrics", get(render_metrics))
        .route("/api/workflows", get(list_workflows))
        .route("/api/workflows/{id}", get(get_workflow))
        .route("/api/workflows/{id}/fire", post(fire_workflow))
        .route("/api/events", post(ingest_event))
        .route("/api/executions", get(list_executions))
        .route("/api/executions/{id}", get(get_execution))
        .route("/api/executions/{id}/logs", get(get_execution_logs))
}

/// The complete API router with state and layers.
pub fn create_router(state: AppState) -> Router {
    create_api_routes()
        .layer(create_concurrency_limit())
        .layer(TraceLayer::new_for_http())
        .layer(create_cors_layer())
        .with_state(state)
}

// ============================================================================
// Health & Metrics
// ============================================================================

async fn health_check(State(state): State<AppState>) -> Response {
    match state.engine.storage().check_health().await {
        Ok(health) => Json(json!({
            "status": "ok",
            "foreign_keys_enabled": health.foreign_keys_enabled,
            "integrity_check": health.integrity_check,
            "journal_mode": health.journal_mode,
            "in_flight_executions": health.in_flight_executions,
        }))
        .into_response(),
        Err(e) => {
            error!("Health check failed: {:?}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"status": "error", "message": "Health check failed"})),
            )
                .into_response()
        }
    }
}

async fn render_metrics() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::render_metrics(),
    )
}

// ============================================================================
// Workflow Endpoints
// ============================================================================

#[derive(Deserialize)]
struct WorkflowListParams {
    institute_id: Option<String>,
}

async fn list_workflows(
    State(state): State<AppState>,
    Query(params): Query<WorkflowListParams>,
) -> Response {
    match state
        .engine
        .storage()
        .list_workflows(params.institute_id.as_deref())
        .await
    {
        Ok(workflows) => {
            let workflows: Vec<Value> = workflows
                .into_iter()
                .map(|w| {
                    let node_count = w.to_definition().map(|d| d.nodes.len()).unwrap_or(0);
                    json!({
                        "id": w.id,
                        "name": w.name,
                        "institute_id": w.institute_id,
                        "status": w.status,
                        "node_count": node_count,
                        "updated_at": w.updated_at.to_rfc3339(),
                    })
                })
                .collect();
            Json(json!({"workflows": workflows})).into_response()
        }
        Err(e) => error_response(e),
    }
}

async fn get_workflow(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let storage = state.engine.storage();
    let stored = match storage.get_workflow(&id).await {
        Ok(Some(w)) => w,
        Ok(None) => return not_found("Workflow", &id),
        Err(e) => return error_response(e),
    };
    let version = match storage.get_latest_workflow_version(&id).await {
        Ok(v) => v.map(|v| v.version),
        Err(e) => return error_response(e),
    };
    let definition: Value = serde_json::from_str(&stored.definition).unwrap_or(Value::Null);

    Json(json!({
        "id": stored.id,
        "name": stored.name,
        "institute_id": stored.institute_id,
        "status": stored.status,
        "version": version,
        "created_at": stored.created_at.to_rfc3339(),
        "updated_at": stored.updated_at.to_rfc3339(),
        "definition": definition,
    }))
    .into_response()
}

#[derive(Deserialize)]
struct FireRequest {
    #[serde(default)]
    payload: Map<String, Value>,
    #[serde(default)]
    event_id: Option<String>,
}

fn fire_outcome_response(outcome: FireOutcome) -> Response {
    match outcome {
        FireOutcome::Started { execution_id, .. } => (
            StatusCode::ACCEPTED,
            Json(json!({"execution_id": execution_id, "duplicate": false})),
        )
            .into_response(),
        FireOutcome::Duplicate {
            idempotency_key,
            existing_execution_id,
        } => Json(json!({
            "duplicate": true,
            "idempotency_key": idempotency_key,
            "execution_id": existing_execution_id,
        }))
        .into_response(),
    }
}

async fn fire_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<FireRequest>,
) -> Response {
    match state.engine.storage().get_workflow(&id).await {
        Ok(Some(_)) => {}
        Ok(None) => return not_found("Workflow", &id),
        Err(e) => return error_response(e),
    }

    let firing = TriggerFiring::manual(request.event_id, request.payload);
    match state.engine.fire(&id, firing).await {
        Ok(outcome) => fire_outcome_response(outcome),
        Err(e) => error_response(e),
    }
}

async fn ingest_event(State(state): State<AppState>, Json(event): Json<EventMessage>) -> Response {
    match state.events.dispatch(&event).await {
        Ok(dispatched) => {
            let results: Vec<Value> = dispatched
                .into_iter()
                .map(|d| match d.outcome {
                    Ok(outcome) => json!({
                        "workflow_id": d.workflow_id,
                        "execution_id": outcome.execution_id(),
                        "duplicate": outcome.is_duplicate(),
                    }),
                    Err(e) => json!({
                        "workflow_id": d.workflow_id,
                        "error": e.external_message(),
                    }),
                })
                .collect();
            (
                StatusCode::ACCEPTED,
                Json(json!({"event_name": event.event_name, "dispatched": results})),
            )
                .into_response()
        }
        Err(e) => error_response(e),
    }
}

// ============================================================================
// Execution Endpoints
// ============================================================================

#[derive(Deserialize)]
struct ExecutionListParams {
    workflow_id: Option<String>,
    institute_id: Option<String>,
    status: Option<String>,
    limit: Option<usize>,
    offset: Option<usize>,
}

async fn list_executions(
    State(state): State<AppState>,
    Query(params): Query<ExecutionListParams>,
) -> Response {
    let status = match params.status.as_deref().map(str::parse::<ExecutionStatus>) {
        None => None,
        Some(Ok(s)) => Some(s),
        Some(Err(e)) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": e.external_message()})),
            )
                .into_response()
        }
    };

    let defaults = ExecutionQuery::default();
    let query = ExecutionQuery {
        workflow_id: params.workflow_id,
        institute_id: params.institute_id,
        status,
        limit: params.limit.unwrap_or(defaults.limit),
        offset: params.offset.unwrap_or(defaults.offset),
    };

    match state.engine.storage().list_executions(&query).await {
        Ok(executions) => Json(json!({"executions": executions})).into_response(),
        Err(e) => error_response(e),
    }
}

async fn get_execution(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.engine.storage().get_execution(&id).await {
        Ok(Some(execution)) => {
            let duration_ms = match (execution.started_at, execution.completed_at) {
                (Some(s), Some(c)) => Some((c - s).num_milliseconds()),
                _ => None,
            };
            let mut body = json!(execution);
            body["duration_ms"] = json!(duration_ms);
            Json(body).into_response()
        }
        Ok(None) => not_found("Execution", &id),
        Err(e) => error_response(e),
    }
}

async fn get_execution_logs(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.engine.storage().get_execution_trace(&id).await {
        Ok(Some(trace)) => Json(json!({
            "execution_id": trace.execution.id,
            "status": trace.execution.status,
            "failed_node_id": trace.execution.failed_node_id,
            "logs": trace.logs,
        }))
        .into_response(),
        Ok(None) => not_found("Execution", &id),
        Err(e) => error_response(e),
    }
}
