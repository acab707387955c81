//! HTTP server implementation using Axum.

use std::sync::Arc;

use axum::{
    Router,
    routing::{get, post, put},
};
use chrono::FixedOffset;
use milo_core::config::GatewayConfig;
use milo_scheduler::{ReportDb, ReportDispatch, SchedulerRegistry};
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::routes;

/// Shared state for the gateway server.
pub struct AppState {
    /// Recipients, schedules, and run history.
    pub db: Arc<ReportDb>,
    /// Manual trigger entry point (same pipeline the scheduler uses).
    pub dispatch: Arc<dyn ReportDispatch>,
    /// Running schedulers; `None` when the scheduler is disabled.
    pub registry: Option<Arc<SchedulerRegistry>>,
    /// Offset schedule times are written in, for `next_run_at`.
    pub utc_offset: FixedOffset,
    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn new(db: Arc<ReportDb>, dispatch: Arc<dyn ReportDispatch>, utc_offset: FixedOffset) -> Self {
        Self {
            db,
            dispatch,
            registry: None,
            utc_offset,
            start_time: std::time::Instant::now(),
        }
    }

    pub fn with_registry(mut self, registry: Arc<SchedulerRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .route("/api/v1/reports/runs", get(routes::list_runs))
        .route(
            "/api/v1/reports/recipients/{id}",
            put(routes::update_recipient).delete(routes::delete_recipient),
        )
        .route("/api/v1/reports/{report_type}/send", post(routes::send_report))
        .route(
            "/api/v1/reports/{report_type}/schedule",
            get(routes::get_schedule).post(routes::save_schedule),
        )
        .route(
            "/api/v1/reports/{report_type}/recipients",
            get(routes::list_recipients).post(routes::add_recipient),
        );

    Router::new()
        .route("/health", get(routes::health_check))
        .merge(api)
        .layer(
            CorsLayer::new()
                .allow_methods([
                    axum::http::Method::GET,
                    axum::http::Method::POST,
                    axum::http::Method::PUT,
                    axum::http::Method::DELETE,
                    axum::http::Method::OPTIONS,
                ])
                .allow_headers(Any)
                .allow_origin(Any)
                .max_age(std::time::Duration::from_secs(3600)),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the HTTP server; returns once `shutdown` flips to `true`.
pub async fn start(
    config: &GatewayConfig,
    state: Arc<AppState>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let app = build_router(state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("🌐 Gateway server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
            tracing::info!("🌐 Gateway shutting down");
        })
        .await?;
    Ok(())
}
