//! REST API Server for the fiscal compliance orchestrator
//!
//! Exposes pipeline runs, the fiscal calendar, memory and the publication
//! approval actions over HTTP.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

use crate::agent::Orchestrator;
use crate::error::{ErrorKind, OrchestrationError};
use crate::models::RunRequest;
use crate::publication::PublicationStatus;

/// =============================
/// Query Models
/// =============================

#[derive(Debug, Deserialize)]
pub struct DeadlineQuery {
    pub within_days: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct PublicationQuery {
    pub status: Option<PublicationStatus>,
}

#[derive(Debug, Deserialize)]
pub struct RejectQuery {
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RecentQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    pub q: String,
}

/// =============================
/// Response Wrapper
/// =============================

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse {
    pub success: bool,
    pub data: Option<serde_json::Value>,
    pub error: Option<String>,
    pub timestamp: String,
}

impl ApiResponse {
    pub fn success<T: Serialize>(data: T) -> Self {
        Self {
            success: true,
            data: serde_json::to_value(data).ok(),
            error: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

type ApiResult = (StatusCode, Json<ApiResponse>);

fn ok<T: Serialize>(data: T) -> ApiResult {
    (StatusCode::OK, Json(ApiResponse::success(data)))
}

fn failure(error: OrchestrationError) -> ApiResult {
    (status_for(&error), Json(ApiResponse::error(error.to_string())))
}

pub fn status_for(error: &OrchestrationError) -> StatusCode {
    match error.kind() {
        ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::StateConflict => StatusCode::CONFLICT,
        ErrorKind::ExternalDependency => StatusCode::BAD_GATEWAY,
        ErrorKind::Configuration | ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// =============================
/// API State
/// =============================

#[derive(Clone)]
pub struct ApiState {
    pub orchestrator: Arc<Orchestrator>,
}

/// =============================
/// Health Endpoint
/// =============================

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

/// =============================
/// Pipeline Runs
/// =============================

async fn run_pipeline(State(state): State<ApiState>, Json(req): Json<RunRequest>) -> ApiResult {
    info!(period = %req.period.label(), cadence = %req.period.cadence, "Received run request");

    match state.orchestrator.run(req).await {
        Ok(outcome) => ok(outcome),
        Err(e) => failure(e),
    }
}

async fn get_audit_record(State(state): State<ApiState>, Path(audit_id): Path<Uuid>) -> ApiResult {
    match state.orchestrator.audit_log().get(audit_id).await {
        Ok(Some(record)) => ok(record),
        Ok(None) => failure(OrchestrationError::NotFound(format!("audit record {}", audit_id))),
        Err(e) => failure(e),
    }
}

/// =============================
/// Calendar
/// =============================

async fn upcoming_deadlines(State(state): State<ApiState>, Query(query): Query<DeadlineQuery>) -> ApiResult {
    let calendar = state.orchestrator.executor().calendar();
    let within_days = query.within_days.unwrap_or(crate::verification::DEFAULT_ALERT_WINDOW_DAYS);
    match calendar.upcoming(within_days) {
        Ok(deadlines) => ok(deadlines),
        Err(e) => failure(e),
    }
}

async fn next_deadline(State(state): State<ApiState>) -> ApiResult {
    match state.orchestrator.executor().calendar().next_deadline() {
        Some(deadline) => ok(deadline),
        None => failure(OrchestrationError::NotFound("no upcoming deadline".to_string())),
    }
}

/// =============================
/// Publications
/// =============================

async fn list_publications(State(state): State<ApiState>, Query(query): Query<PublicationQuery>) -> ApiResult {
    ok(state.orchestrator.publications().list(query.status).await)
}

async fn get_publication(State(state): State<ApiState>, Path(id): Path<Uuid>) -> ApiResult {
    match state.orchestrator.publications().get(id).await {
        Ok(item) => ok(item),
        Err(e) => failure(e),
    }
}

async fn approve_publication(State(state): State<ApiState>, Path(id): Path<Uuid>) -> ApiResult {
    info!(publication_id = %id, "Approval requested");
    match state.orchestrator.publications().approve(id).await {
        Ok(item) => ok(item),
        Err(e) => failure(e),
    }
}

async fn reject_publication(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
    Query(query): Query<RejectQuery>,
) -> ApiResult {
    match state.orchestrator.publications().reject(id, query.reason.as_deref()).await {
        Ok(item) => ok(item),
        Err(e) => failure(e),
    }
}

async fn retry_publication(State(state): State<ApiState>, Path(id): Path<Uuid>) -> ApiResult {
    match state.orchestrator.publications().retry(id).await {
        Ok(item) => ok(item),
        Err(e) => failure(e),
    }
}

/// =============================
/// Memory
/// =============================

async fn recent_memory(State(state): State<ApiState>, Query(query): Query<RecentQuery>) -> ApiResult {
    let records = state.orchestrator.memory().recent(query.limit.unwrap_or(10)).await;
    ok(records)
}

async fn search_memory(State(state): State<ApiState>, Query(query): Query<SearchQuery>) -> ApiResult {
    ok(state.orchestrator.memory().search(&query.q).await)
}

async fn memory_patterns(State(state): State<ApiState>, Path(key): Path<String>) -> ApiResult {
    ok(state.orchestrator.memory().pattern_frequency(&key).await)
}

/// =============================
/// Router
/// =============================

pub fn create_router(orchestrator: Arc<Orchestrator>) -> Router {
    let state = ApiState { orchestrator };

    Router::new()
        .route("/health", get(health))
        .route("/api/runs", post(run_pipeline))
        .route("/api/audit/:audit_id", get(get_audit_record))
        .route("/api/deadlines", get(upcoming_deadlines))
        .route("/api/deadlines/next", get(next_deadline))
        .route("/api/publications", get(list_publications))
        .route("/api/publications/:id", get(get_publication))
        .route("/api/publications/:id/approve", post(approve_publication))
        .route("/api/publications/:id/reject", post(reject_publication))
        .route("/api/publications/:id/retry", post(retry_publication))
        .route("/api/memory/recent", get(recent_memory))
        .route("/api/memory/search", get(search_memory))
        .route("/api/memory/patterns/:key", get(memory_patterns))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// =============================
/// Server Startup
/// =============================

pub async fn start_server(
    orchestrator: Arc<Orchestrator>,
    port: u16,
) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let router = create_router(orchestrator);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;

    info!("API Server listening on http://0.0.0.0:{}", port);
    info!("Local: http://127.0.0.1:{}", port);

    axum::serve(listener, router).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::create_default_orchestrator;
    use crate::calendar::{Clock, FixedClock};
    use crate::config::OrchestratorConfig;
    use crate::models::{FinancialRecord, MonetaryAmount, PeriodScope, RecordKind};
    use chrono::NaiveDate;

    async fn state() -> ApiState {
        let clock: Arc<dyn Clock> = Arc::new(FixedClock::on(NaiveDate::from_ymd_opt(2025, 10, 3).unwrap()));
        let orchestrator = create_default_orchestrator(&OrchestratorConfig::default(), clock)
            .await
            .unwrap();
        ApiState {
            orchestrator: Arc::new(orchestrator),
        }
    }

    fn request() -> RunRequest {
        RunRequest::new(PeriodScope::quarterly(2025, 3).unwrap()).with_records(vec![FinancialRecord {
            id: "inv-1".to_string(),
            date: NaiveDate::from_ymd_opt(2025, 8, 1).unwrap(),
            kind: RecordKind::Revenue,
            amount: MonetaryAmount::from_cents(500_000),
            category: "consulting".to_string(),
            description: String::new(),
            taxable: true,
            documented: true,
            source: None,
        }])
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            status_for(&OrchestrationError::StateConflictError("x".into())),
            StatusCode::CONFLICT
        );
        assert_eq!(status_for(&OrchestrationError::NotFound("x".into())), StatusCode::NOT_FOUND);
        assert_eq!(
            status_for(&OrchestrationError::ValidationError("x".into())),
            StatusCode::BAD_REQUEST
        );
    }

    #[tokio::test]
    async fn test_second_approval_is_conflict() {
        let state = state().await;
        let (status, Json(body)) = run_pipeline(State(state.clone()), Json(request())).await;
        assert_eq!(status, StatusCode::OK);

        let publication_id: Uuid = body.data.unwrap()["publication_id"]
            .as_str()
            .unwrap()
            .parse()
            .unwrap();

        let (first, _) = approve_publication(State(state.clone()), Path(publication_id)).await;
        assert_eq!(first, StatusCode::OK);

        let (second, Json(body)) = approve_publication(State(state), Path(publication_id)).await;
        assert_eq!(second, StatusCode::CONFLICT);
        assert!(!body.success);
    }

    #[tokio::test]
    async fn test_oversized_deadline_window_is_bad_request() {
        let state = state().await;
        let query = DeadlineQuery {
            within_days: Some(u32::MAX),
        };
        let (status, Json(body)) = upcoming_deadlines(State(state), Query(query)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(!body.success);
    }

    #[tokio::test]
    async fn test_unknown_publication_is_not_found() {
        let state = state().await;
        let (status, _) = get_publication(State(state), Path(Uuid::new_v4())).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
