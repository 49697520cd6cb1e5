//! HTTP handlers for health and the stats API. Everything here reads through
//! the Query Facade; nothing touches storage internals.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use tracing::error;

use playtrack_store::sessions::SessionFilters;
use playtrack_store::StoreError;

use crate::metrics;
use crate::server::AppState;

/// Query parameters shared by the stats endpoints.
#[derive(Debug, Default, Deserialize)]
pub struct StatsQuery {
    pub days: Option<u32>,
    pub limit: Option<u32>,
    pub user_id: Option<String>,
    pub device_id: Option<String>,
    pub media_type: Option<String>,
}

impl StatsQuery {
    /// Window start. `days=0` means "all time".
    fn since(&self) -> DateTime<Utc> {
        let days = match self.days.unwrap_or(30) {
            0 => 3650,
            days => days,
        };
        Utc::now() - Duration::days(days as i64)
    }

    fn filters(&self) -> SessionFilters {
        SessionFilters {
            user_id: self.user_id.clone(),
            device_id: self.device_id.clone(),
            media_type: self.media_type.clone(),
        }
    }
}

fn internal_error(e: StoreError) -> StatusCode {
    error!(error = %e, "query failed");
    StatusCode::INTERNAL_SERVER_ERROR
}

pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let store_ok = state.facade.ping().is_ok();
    let feed = state.feed_status.snapshot();
    let degraded = state.health.is_degraded(store_ok);

    let status = if degraded {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    let body = serde_json::json!({
        "status": if degraded { "degraded" } else { "ok" },
        "db_connected": store_ok,
        "feed_connected": feed.connected,
        "feed_last_event_at": feed.last_event_at.map(|at| at.to_rfc3339()),
        "store_write_failures": state.health.store_failures(),
        "scheduler_failures": state.health.scheduler_failures(),
    });
    (status, Json(body))
}

pub async fn prometheus_metrics(State(state): State<AppState>) -> impl IntoResponse {
    metrics::refresh_gauges(&state);
    (
        [("content-type", "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}

pub async fn summary(
    State(state): State<AppState>,
    Query(params): Query<StatsQuery>,
) -> Result<impl IntoResponse, StatusCode> {
    state
        .facade
        .summary(params.since(), &params.filters())
        .map(Json)
        .map_err(internal_error)
}

pub async fn daily(
    State(state): State<AppState>,
    Query(params): Query<StatsQuery>,
) -> Result<impl IntoResponse, StatusCode> {
    state
        .facade
        .daily_series(params.since(), &params.filters())
        .map(Json)
        .map_err(internal_error)
}

pub async fn users(
    State(state): State<AppState>,
    Query(params): Query<StatsQuery>,
) -> Result<impl IntoResponse, StatusCode> {
    state
        .facade
        .user_watchtime(params.since(), &params.filters())
        .map(Json)
        .map_err(internal_error)
}

pub async fn top_media(
    State(state): State<AppState>,
    Query(params): Query<StatsQuery>,
) -> Result<impl IntoResponse, StatusCode> {
    state
        .facade
        .top_media(params.since(), params.limit.unwrap_or(10), &params.filters())
        .map(Json)
        .map_err(internal_error)
}

pub async fn active_sessions(
    State(state): State<AppState>,
    Query(params): Query<StatsQuery>,
) -> Result<impl IntoResponse, StatusCode> {
    state
        .facade
        .active_sessions(&params.filters())
        .map(Json)
        .map_err(internal_error)
}
