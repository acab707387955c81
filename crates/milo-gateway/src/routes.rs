//! API route handlers for the gateway.

use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use chrono::Utc;
use milo_core::error::MiloError;
use milo_core::types::{Frequency, RunTrigger, ScheduleConfig, ScheduleKey, hhmm};
use milo_scheduler::recurrence;
use milo_scheduler::{NewRecipient, RecipientUpdate};
use serde::Deserialize;

use super::server::AppState;

/// Status code plus JSON body; every handler answers with one.
pub type ApiResponse = (StatusCode, Json<serde_json::Value>);

const DEFAULT_RUN_LIMIT: usize = 20;
const MAX_RUN_LIMIT: usize = 200;

#[derive(Debug, Default, Deserialize)]
pub struct ScopeQuery {
    pub project_id: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RunsQuery {
    pub limit: Option<usize>,
}

/// Body for saving a schedule.
#[derive(Debug, Deserialize)]
pub struct ScheduleRequest {
    #[serde(default)]
    pub project_id: Option<i64>,
    pub frequency: Frequency,
    /// "HH:MM"
    #[serde(default = "default_time")]
    pub time: String,
    #[serde(default)]
    pub weekday: Option<u32>,
    #[serde(default)]
    pub month_day: Option<u32>,
}

fn default_time() -> String {
    "09:00".into()
}

fn ok(body: serde_json::Value) -> ApiResponse {
    (StatusCode::OK, Json(body))
}

/// Map an engine error onto an HTTP status.
fn error_response(err: &MiloError) -> ApiResponse {
    let status = match err {
        MiloError::DispatchInProgress(_) => StatusCode::CONFLICT,
        MiloError::NotFound(_) => StatusCode::NOT_FOUND,
        MiloError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        MiloError::Connection(_) | MiloError::Auth(_) | MiloError::Timeout { .. } => {
            StatusCode::BAD_GATEWAY
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        tracing::error!("❌ API error: {err}");
    }
    (
        status,
        Json(serde_json::json!({"ok": false, "error": err.to_string()})),
    )
}

/// Health check endpoint.
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "milo-gateway",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.start_time.elapsed().as_secs(),
    }))
}

/// Manual trigger: dispatch a report now.
pub async fn send_report(
    State(state): State<Arc<AppState>>,
    Path(report_type): Path<String>,
    Query(query): Query<ScopeQuery>,
) -> ApiResponse {
    let result = match state
        .dispatch
        .run(&report_type, query.project_id, RunTrigger::Manual)
        .await
    {
        Ok(result) => result,
        Err(e) => return error_response(&e),
    };

    if result.is_delivery_failure() {
        tracing::warn!(
            "📭 Manual {report_type} dispatch could not reach the mail server: {}",
            result.connection_error.as_deref().unwrap_or("")
        );
        return (
            StatusCode::BAD_GATEWAY,
            Json(serde_json::json!({
                "ok": false,
                "error": result.connection_error,
                "result": result,
            })),
        );
    }

    ok(serde_json::json!({
        "ok": true,
        "message": format!("Report sent to {} recipient(s)", result.sent),
        "result": result,
    }))
}

/// Current schedule, or the defaults for a report that was never scheduled.
pub async fn get_schedule(
    State(state): State<Arc<AppState>>,
    Path(report_type): Path<String>,
    Query(query): Query<ScopeQuery>,
) -> ApiResponse {
    let key = ScheduleKey::new(&report_type, query.project_id);
    let schedule = match state.db.get_schedule(&key) {
        Ok(Some(schedule)) => schedule,
        Ok(None) => ScheduleConfig::default_for(&key),
        Err(e) => return error_response(&e),
    };
    let next_run_at = schedule
        .is_schedulable()
        .then(|| recurrence::next_fire_after(&schedule, Utc::now(), state.utc_offset))
        .flatten();

    ok(serde_json::json!({
        "ok": true,
        "schedule": schedule,
        "next_run_at": next_run_at,
    }))
}

/// Create or update a schedule and wake (or start) its scheduler.
pub async fn save_schedule(
    State(state): State<Arc<AppState>>,
    Path(report_type): Path<String>,
    Json(body): Json<ScheduleRequest>,
) -> ApiResponse {
    let time_of_day = match hhmm::parse(&body.time) {
        Ok(t) => t,
        Err(e) => return error_response(&MiloError::InvalidInput(e)),
    };
    let schedule = ScheduleConfig {
        report_type,
        scope: body.project_id,
        frequency: body.frequency,
        time_of_day,
        weekday: body.weekday,
        month_day: body.month_day,
        active: false,
        last_run_at: None,
    };

    let saved = match state.db.save_schedule(&schedule) {
        Ok(saved) => saved,
        Err(e) => return error_response(&e),
    };
    if let Some(registry) = &state.registry {
        registry.ensure(&saved.key()).await;
    }

    ok(serde_json::json!({
        "ok": true,
        "message": "Schedule saved",
        "schedule": saved,
    }))
}

pub async fn list_recipients(
    State(state): State<Arc<AppState>>,
    Path(report_type): Path<String>,
    Query(query): Query<ScopeQuery>,
) -> ApiResponse {
    match state.db.list_recipients(&report_type, query.project_id) {
        Ok(recipients) => ok(serde_json::json!({
            "ok": true,
            "total": recipients.len(),
            "recipients": recipients,
        })),
        Err(e) => error_response(&e),
    }
}

pub async fn add_recipient(
    State(state): State<Arc<AppState>>,
    Path(report_type): Path<String>,
    Json(body): Json<NewRecipient>,
) -> ApiResponse {
    match state.db.add_recipient(&report_type, &body) {
        Ok(recipient) => ok(serde_json::json!({"ok": true, "recipient": recipient})),
        Err(e) => error_response(&e),
    }
}

pub async fn update_recipient(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(body): Json<RecipientUpdate>,
) -> ApiResponse {
    match state.db.update_recipient(id, &body) {
        Ok(recipient) => ok(serde_json::json!({"ok": true, "recipient": recipient})),
        Err(e) => error_response(&e),
    }
}

pub async fn delete_recipient(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResponse {
    match state.db.delete_recipient(id) {
        Ok(()) => ok(serde_json::json!({"ok": true, "message": "Recipient deleted"})),
        Err(e) => error_response(&e),
    }
}

/// Recent dispatch runs, newest first.
pub async fn list_runs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RunsQuery>,
) -> ApiResponse {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_RUN_LIMIT)
        .clamp(1, MAX_RUN_LIMIT);
    match state.db.recent_runs(limit) {
        Ok(runs) => ok(serde_json::json!({"ok": true, "total": runs.len(), "runs": runs})),
        Err(e) => error_response(&e),
    }
}
