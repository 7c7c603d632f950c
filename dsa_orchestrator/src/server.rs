//! HTTP API over the orchestration facade.

use anyhow::{Context, Result};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument};

use crate::{
    error::{ErrorBody, ErrorKind, OrchestrationError},
    middleware::{
        create_body_limit_layer, create_cors_layer, create_rate_limiter, rate_limit_middleware,
        security_headers_middleware, AppRateLimiter,
    },
    monitoring::MetricsScope,
    orchestrator::{CollaborationRequest, OrchestrationResponse, Orchestrator, QueryRequest},
    settings::{ServerConfig, Settings},
};

/// Application state shared across HTTP handlers
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub rate_limiter: Arc<AppRateLimiter>,
    pub started: Instant,
}

impl AppState {
    pub fn new(orchestrator: Arc<Orchestrator>, config: &ServerConfig) -> Self {
        Self {
            orchestrator,
            rate_limiter: create_rate_limiter(config),
            started: Instant::now(),
        }
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    uptime_seconds: u64,
    agent_count: usize,
}

#[derive(Debug, Default, Deserialize)]
pub struct MetricsParams {
    agent: Option<String>,
    domain: Option<String>,
    window_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct FeedbackRequest {
    agent_id: String,
    response: Value,
    #[serde(default)]
    expected: Option<Value>,
}

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::UnknownAgent | ErrorKind::NoAgentForDomain => StatusCode::NOT_FOUND,
        ErrorKind::AmbiguousDomain | ErrorKind::InvalidDescriptor => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::DuplicateIdentity | ErrorKind::DependencyInUse | ErrorKind::UnmetDependency => {
            StatusCode::CONFLICT
        }
        ErrorKind::GovernanceViolation => StatusCode::FORBIDDEN,
        ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::AgentFailure | ErrorKind::CollaborationAborted => StatusCode::BAD_GATEWAY,
    }
}

fn error_response(err: &OrchestrationError) -> Response {
    (status_for(err.kind()), Json(ErrorBody::from(err))).into_response()
}

/// Non-compliant results are still delivered with 200.
fn orchestration_response(response: OrchestrationResponse) -> Response {
    let status = response
        .error
        .as_ref()
        .map(|e| status_for(e.kind))
        .unwrap_or(StatusCode::OK);
    (status, Json(response)).into_response()
}

pub fn create_router(state: AppState, config: &ServerConfig) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/agents", get(list_agents))
        .route("/agents/:id", delete(remove_agent))
        .route("/query", post(query))
        .route("/collaborate", post(collaborate))
        .route("/metrics", get(metrics))
        .route("/feedback", post(feedback))
        .layer(middleware::from_fn_with_state(
            state.rate_limiter.clone(),
            rate_limit_middleware,
        ))
        .layer(middleware::from_fn(security_headers_middleware))
        .layer(create_cors_layer(config))
        .layer(create_body_limit_layer(config))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds: state.started.elapsed().as_secs(),
        agent_count: state.orchestrator.registry().len(),
    })
}

async fn list_agents(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.orchestrator.get_available_agents())
}

#[instrument(skip(state))]
async fn remove_agent(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.orchestrator.deregister_agent(&id) {
        Ok(summary) => Json(summary).into_response(),
        Err(err) => error_response(&err),
    }
}

async fn query(State(state): State<AppState>, Json(request): Json<QueryRequest>) -> Response {
    orchestration_response(state.orchestrator.dispatch(request).await)
}

async fn collaborate(
    State(state): State<AppState>,
    Json(request): Json<CollaborationRequest>,
) -> Response {
    orchestration_response(state.orchestrator.collaborate_with(request).await)
}

async fn metrics(State(state): State<AppState>, Query(params): Query<MetricsParams>) -> Response {
    let scope = match (params.agent, params.domain) {
        (Some(_), Some(_)) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"message": "pass either agent or domain, not both"})),
            )
                .into_response()
        }
        (Some(agent), None) => MetricsScope::Agent(agent),
        (None, Some(domain)) => MetricsScope::Domain(domain),
        (None, None) if params.window_secs.is_none() => {
            return Json(state.orchestrator.performance_report()).into_response()
        }
        (None, None) => MetricsScope::All,
    };

    let metrics = match params.window_secs {
        Some(secs) => state
            .orchestrator
            .metrics_over(&scope, Some(Duration::from_secs(secs))),
        None => state.orchestrator.get_performance_metrics(Some(&scope)),
    };
    Json(metrics).into_response()
}

async fn feedback(State(state): State<AppState>, Json(request): Json<FeedbackRequest>) -> Response {
    match state.orchestrator.submit_feedback(
        &request.agent_id,
        &request.response,
        request.expected.as_ref(),
    ) {
        Ok(score) => Json(json!({"agent_id": request.agent_id, "score": score})).into_response(),
        Err(err) => error_response(&err),
    }
}

/// Start the HTTP server and wait for a shutdown signal.
pub async fn serve(settings: &Settings) -> Result<()> {
    let orchestrator = Orchestrator::new(settings).context("Orchestrator initialization failed")?;
    orchestrator.register_builtin_agents()?;

    let state = AppState::new(Arc::new(orchestrator), &settings.server);
    let app = create_router(state, &settings.server);

    let addr = format!("{}:{}", settings.server.host, settings.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("HTTP server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(wait_for_shutdown())
        .await
        .context("HTTP server error")?;

    info!("HTTP server shutdown complete");
    Ok(())
}

async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(stream) => stream,
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down gracefully"),
            _ = tokio::signal::ctrl_c() => info!("Received SIGINT (Ctrl+C), shutting down gracefully"),
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
        }
        info!("Received Ctrl+C, shutting down gracefully");
    }
}
