//! Schedule management API endpoints.
//!
//! Schedules are addressed by ID, or through their owning application for
//! create/update since each application has at most one.

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, patch, post},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::AppState;
use crate::error::SchedulerError;
use crate::scheduler::{RunStatus, Schedule};

/// Default number of runs returned by the history endpoint.
const DEFAULT_RUN_LIMIT: usize = 20;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/v1/schedules", get(list_schedules))
        .route("/api/v1/schedules/validate", post(validate_cron))
        .route(
            "/api/v1/schedules/{id}",
            get(get_schedule).delete(delete_schedule),
        )
        .route("/api/v1/schedules/{id}/toggle", patch(toggle_schedule))
        .route("/api/v1/schedules/{id}/run", post(run_schedule))
        .route("/api/v1/schedules/{id}/runs", get(list_runs))
        .route(
            "/api/v1/applications/{application_id}/schedule",
            get(get_application_schedule).put(upsert_application_schedule),
        )
}

/// Request to create or update an application's schedule.
#[derive(Debug, Deserialize)]
pub struct UpsertScheduleRequest {
    /// Cron expression.
    pub cron_expression: String,
    /// Enabled flag.
    #[serde(default = "default_enabled")]
    pub is_enabled: bool,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct ToggleRequest {
    pub enabled: bool,
}

#[derive(Debug, Deserialize)]
pub struct ValidateCronRequest {
    pub cron_expression: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    /// Comma separated application IDs the caller may see.
    pub application_ids: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RunsQuery {
    pub limit: Option<usize>,
}

/// Schedule response.
#[derive(Debug, Serialize)]
pub struct ScheduleResponse {
    pub id: String,
    pub application_id: String,
    pub cron_expression: String,
    pub is_enabled: bool,
    /// Whether a run currently holds the lease.
    pub is_running: bool,
    pub last_run_time: Option<DateTime<Utc>>,
    pub next_run_time: Option<DateTime<Utc>>,
    pub last_run_status: Option<RunStatus>,
    pub last_run_message: Option<String>,
    pub last_run_duration_ms: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ScheduleResponse {
    fn new(schedule: Schedule, now: DateTime<Utc>) -> Self {
        Self {
            is_running: schedule.is_running(now),
            id: schedule.id,
            application_id: schedule.application_id,
            cron_expression: schedule.cron_expression,
            is_enabled: schedule.is_enabled,
            last_run_time: schedule.last_run_time,
            next_run_time: schedule.next_run_time,
            last_run_status: schedule.last_run_status,
            last_run_message: schedule.last_run_message,
            last_run_duration_ms: schedule.last_run_duration_ms,
            created_at: schedule.created_at,
            updated_at: schedule.updated_at,
        }
    }
}

fn respond(state: &AppState, schedule: Schedule) -> Json<ScheduleResponse> {
    Json(ScheduleResponse::new(schedule, state.service.clock().now()))
}

/// List schedules.
///
/// # Endpoint
///
/// `GET /api/v1/schedules?application_ids=a,b`
pub async fn list_schedules(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<impl IntoResponse, SchedulerError> {
    let scope: Option<Vec<String>> = query.application_ids.map(|ids| {
        ids.split(',')
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(String::from)
            .collect()
    });

    let schedules = state.service.list(scope.as_deref()).await?;
    let now = state.service.clock().now();
    let responses: Vec<ScheduleResponse> = schedules
        .into_iter()
        .map(|s| ScheduleResponse::new(s, now))
        .collect();
    Ok(Json(responses))
}

/// Get a schedule by ID.
///
/// # Endpoint
///
/// `GET /api/v1/schedules/{id}`
pub async fn get_schedule(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, SchedulerError> {
    let schedule = state.service.get(&id).await?;
    Ok(respond(&state, schedule))
}

/// Get an application's schedule.
///
/// # Endpoint
///
/// `GET /api/v1/applications/{application_id}/schedule`
pub async fn get_application_schedule(
    State(state): State<AppState>,
    Path(application_id): Path<String>,
) -> Result<impl IntoResponse, SchedulerError> {
    let schedule = state
        .service
        .get_by_application(&application_id)
        .await?
        .ok_or(SchedulerError::NotFound {
            entity: "Schedule for application",
            id: application_id,
        })?;
    Ok(respond(&state, schedule))
}

/// Create or update an application's schedule.
///
/// # Endpoint
///
/// `PUT /api/v1/applications/{application_id}/schedule`
pub async fn upsert_application_schedule(
    State(state): State<AppState>,
    Path(application_id): Path<String>,
    Json(req): Json<UpsertScheduleRequest>,
) -> Result<impl IntoResponse, SchedulerError> {
    let schedule = state
        .service
        .upsert(&application_id, &req.cron_expression, req.is_enabled)
        .await?;
    Ok(respond(&state, schedule))
}

/// Enable or disable a schedule.
///
/// # Endpoint
///
/// `PATCH /api/v1/schedules/{id}/toggle`
pub async fn toggle_schedule(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ToggleRequest>,
) -> Result<impl IntoResponse, SchedulerError> {
    let schedule = state
        .service
        .toggle(&id, req.enabled)
        .await?
        .ok_or_else(|| SchedulerError::schedule_not_found(&id))?;
    Ok(respond(&state, schedule))
}

/// Delete a schedule and its history.
///
/// # Endpoint
///
/// `DELETE /api/v1/schedules/{id}`
pub async fn delete_schedule(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, SchedulerError> {
    if state.service.delete(&id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(SchedulerError::schedule_not_found(id))
    }
}

/// Check a cron expression without saving anything.
///
/// # Endpoint
///
/// `POST /api/v1/schedules/validate`
pub async fn validate_cron(
    State(state): State<AppState>,
    Json(req): Json<ValidateCronRequest>,
) -> impl IntoResponse {
    Json(state.service.validate_cron(&req.cron_expression))
}

/// Run a schedule now and return the outcome.
///
/// # Endpoint
///
/// `POST /api/v1/schedules/{id}/run`
pub async fn run_schedule(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, SchedulerError> {
    let report = state.executor.run_now(&id).await?;
    Ok(Json(report))
}

/// Run history, newest first.
///
/// # Endpoint
///
/// `GET /api/v1/schedules/{id}/runs?limit=n`
pub async fn list_runs(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<RunsQuery>,
) -> Result<impl IntoResponse, SchedulerError> {
    let runs = state
        .service
        .runs(&id, query.limit.unwrap_or(DEFAULT_RUN_LIMIT))
        .await?;
    Ok(Json(runs))
}
