//! HTTP request handlers

use super::types::{
    CreateSessionRequest, DemoSessionResponse, EdgeInfo, ErrorResponse, EventsQuery,
    EventsResponse, FlowInfoQuery, FlowInfoResponse, HealthResponse, InputRequest, OkResponse,
    SaveFlowRequest, SessionCreatedResponse, StateInfo, ValidateRequest, ValidateResponse,
};
use super::AppState;
use crate::db::DbError;
use crate::engine::EngineError;
use crate::flow::validate::validate;
use crate::flow::{demo, FlowConfig};
use crate::store::{SessionState, StoreError};

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde_json::Value;
use uuid::Uuid;

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Sessions
        .route("/api/sessions", post(create_session))
        .route("/api/sessions/demo", post(create_demo_session))
        .route(
            "/api/sessions/:id",
            get(get_session).delete(delete_session),
        )
        .route("/api/sessions/:id/input", post(post_input))
        .route("/api/sessions/:id/events", get(get_events))
        // Flow graph for visualization
        .route("/api/flow-info", get(get_flow_info))
        // Flow CRUD
        .route("/api/flows", get(list_flows).post(create_flow))
        .route("/api/flows/validate", post(validate_flow))
        .route(
            "/api/flows/:id",
            get(get_flow).put(update_flow).delete(delete_flow),
        )
        .route("/api/flows/:id/publish", post(publish_flow))
        .route("/api/flows/:id/versions", get(list_versions))
        // Health
        .route("/api/health", get(health))
        .with_state(state)
}

// ============================================================
// Sessions
// ============================================================

async fn create_session(
    State(state): State<AppState>,
    Json(req): Json<CreateSessionRequest>,
) -> Result<Json<SessionCreatedResponse>, AppError> {
    let flow = parse_flow(&req.flow)?;
    let session_id = state.orchestrator.create_session(flow, req.session_id).await?;
    Ok(Json(SessionCreatedResponse { session_id }))
}

async fn create_demo_session(
    State(state): State<AppState>,
) -> Result<Json<DemoSessionResponse>, AppError> {
    let (session_id, flow_name) = state.orchestrator.create_demo_session().await?;
    Ok(Json(DemoSessionResponse {
        session_id,
        flow_name,
    }))
}

async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionState>, AppError> {
    Ok(Json(state.store.get_state(&id).await?))
}

async fn post_input(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<InputRequest>,
) -> Result<Json<OkResponse>, AppError> {
    let text = req
        .text
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| AppError::BadRequest("missing text".to_string()))?;
    state.orchestrator.process_user_input(&id, text).await?;
    Ok(Json(OkResponse::ok()))
}

async fn get_events(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<EventsQuery>,
) -> Result<Json<EventsResponse>, AppError> {
    if !state.store.session_exists(&id).await? {
        return Err(AppError::NotFound(format!("session not found: {id}")));
    }
    let events = state
        .store
        .events_since(&id, query.since.unwrap_or(0))
        .await?;
    Ok(Json(EventsResponse { events }))
}

async fn delete_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<OkResponse>, AppError> {
    state.orchestrator.delete_session(&id).await?;
    Ok(Json(OkResponse::ok()))
}

// ============================================================
// Flow graph info
// ============================================================

async fn get_flow_info(
    State(state): State<AppState>,
    Query(query): Query<FlowInfoQuery>,
) -> Result<Json<FlowInfoResponse>, AppError> {
    let (flow, session) = if let Some(session_id) = &query.session_id {
        let (session, flow) = state.store.load(session_id).await?;
        (flow, Some(session))
    } else if let Some(flow_id) = &query.flow_id {
        let record = state.flows.get_flow(flow_id)?;
        (parse_flow(&record.definition)?, None)
    } else {
        (demo::reservation_flow(), None)
    };

    Ok(Json(flow_info(&flow, session)))
}

fn flow_info(flow: &FlowConfig, session: Option<SessionState>) -> FlowInfoResponse {
    let states = flow
        .states
        .iter()
        .map(|(name, def)| {
            let actions = def
                .on_enter
                .iter()
                .filter_map(|a| a.kind())
                .map(|a| match a {
                    crate::flow::Action::Say(_) => "say".to_string(),
                    crate::flow::Action::Ask(_) => "ask".to_string(),
                    crate::flow::Action::Transfer(_) => "transfer".to_string(),
                    crate::flow::Action::Hangup => "hangup".to_string(),
                    crate::flow::Action::Tool { name, .. } => format!("tool:{name}"),
                })
                .collect();

            let mut edges = Vec::new();
            for transition in &def.transitions {
                let trigger = if let Some(intents) = &transition.on_intent {
                    intents.iter().collect::<Vec<_>>().join("|")
                } else if let Some(tool) = &transition.on_tool_result {
                    format!("tool:{tool}")
                } else {
                    "guard".to_string()
                };

                if let Some(arms) = &transition.branch {
                    for arm in arms {
                        edges.push(EdgeInfo {
                            to: arm.to.clone(),
                            trigger: trigger.clone(),
                            when: Some(arm.when.clone()),
                        });
                    }
                } else if let Some(to) = &transition.to {
                    edges.push(EdgeInfo {
                        to: to.clone(),
                        trigger: trigger.clone(),
                        when: transition.when.clone(),
                    });
                }
            }

            StateInfo {
                name: name.clone(),
                actions,
                edges,
                terminal: def.is_terminal(),
            }
        })
        .collect();

    FlowInfoResponse {
        meta: serde_json::to_value(&flow.meta).unwrap_or(Value::Null),
        start: flow.start.clone(),
        states,
        intents: flow.intents.keys().cloned().collect(),
        tools: flow.tools.keys().cloned().collect(),
        session,
    }
}

// ============================================================
// Flow CRUD
// ============================================================

async fn list_flows(State(state): State<AppState>) -> Result<Json<Value>, AppError> {
    let flows = state.flows.list_flows()?;
    Ok(Json(serde_json::json!({ "flows": flows })))
}

async fn create_flow(
    State(state): State<AppState>,
    Json(req): Json<SaveFlowRequest>,
) -> Result<Json<Value>, AppError> {
    let flow = parse_flow(&req.definition)?;
    validate(&flow).map_err(|errors| AppError::BadRequest(EngineError::InvalidFlow(errors).to_string()))?;

    let name = req.name.unwrap_or_else(|| flow.name().to_string());
    let id = Uuid::new_v4().to_string();
    let record = state.flows.create_flow(&id, &name, &req.definition)?;
    Ok(Json(serde_json::json!({ "flow": record })))
}

async fn get_flow(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, AppError> {
    let record = state.flows.get_flow(&id)?;
    Ok(Json(serde_json::json!({ "flow": record })))
}

async fn update_flow(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<SaveFlowRequest>,
) -> Result<Json<Value>, AppError> {
    let flow = parse_flow(&req.definition)?;
    validate(&flow).map_err(|errors| AppError::BadRequest(EngineError::InvalidFlow(errors).to_string()))?;

    let record = state
        .flows
        .update_flow(&id, req.name.as_deref(), &req.definition)?;
    Ok(Json(serde_json::json!({ "flow": record })))
}

async fn delete_flow(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<OkResponse>, AppError> {
    state.flows.delete_flow(&id)?;
    Ok(Json(OkResponse::ok()))
}

async fn publish_flow(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, AppError> {
    let record = state.flows.publish_flow(&id)?;
    Ok(Json(serde_json::json!({ "flow": record })))
}

async fn list_versions(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, AppError> {
    let versions = state.flows.list_versions(&id)?;
    Ok(Json(serde_json::json!({ "versions": versions })))
}

async fn validate_flow(Json(req): Json<ValidateRequest>) -> Json<ValidateResponse> {
    match serde_json::from_value::<FlowConfig>(req.definition) {
        Ok(flow) => match validate(&flow) {
            Ok(warnings) => Json(ValidateResponse {
                valid: true,
                errors: vec![],
                warnings: warnings.iter().map(ToString::to_string).collect(),
            }),
            Err(errors) => Json(ValidateResponse {
                valid: false,
                errors: errors.iter().map(ToString::to_string).collect(),
                warnings: vec![],
            }),
        },
        Err(err) => Json(ValidateResponse {
            valid: false,
            errors: vec![format!("malformed flow definition: {err}")],
            warnings: vec![],
        }),
    }
}

// ============================================================
// Health
// ============================================================

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        timestamp: Utc::now().to_rfc3339(),
        uptime_secs: state.started_at.elapsed().as_secs(),
    })
}

// ============================================================
// Errors
// ============================================================

fn parse_flow(definition: &Value) -> Result<FlowConfig, AppError> {
    serde_json::from_value(definition.clone())
        .map_err(|err| AppError::BadRequest(format!("malformed flow definition: {err}")))
}

#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    Locked(String),
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            AppError::Locked(msg) => (StatusCode::LOCKED, msg),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(ErrorResponse::new(message));
        (status, body).into_response()
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::SessionNotFound(_) => AppError::NotFound(err.to_string()),
            StoreError::SessionExists(_) => AppError::Conflict(err.to_string()),
            StoreError::LockBusy(_) => AppError::Locked(err.to_string()),
            StoreError::Backend(_) | StoreError::Serde(_) => AppError::Internal(err.to_string()),
        }
    }
}

impl From<EngineError> for AppError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::InvalidFlow(_) | EngineError::UnknownState(_) => {
                AppError::BadRequest(err.to_string())
            }
            EngineError::Store(store) => store.into(),
        }
    }
}

impl From<DbError> for AppError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::FlowNotFound(_) => AppError::NotFound(err.to_string()),
            DbError::Sqlite(_) | DbError::BadDefinition(_) => AppError::Internal(err.to_string()),
        }
    }
}
