//! Health and status route handlers.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use chrono::{DateTime, Utc};
use lm_core::events::Event;
use serde::Serialize;
use std::collections::BTreeMap;

use crate::context::{Adapter, AppContext};
use crate::health::check_all;
use crate::notifications::NotificationCounters;
use crate::queue::QueueStats;

use super::error::AppError;

const RECENT_EVENTS: usize = 50;

/// GET /health
pub async fn health(State(ctx): State<AppContext>) -> impl IntoResponse {
    let report = check_all(&ctx).await;
    let status = if report.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report))
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub queue: QueueStats,
    pub last_poll: Option<DateTime<Utc>>,
    pub last_scan: Option<DateTime<Utc>>,
    pub dead_letters: i64,
    pub retrying: i64,
    pub inventory: BTreeMap<String, i64>,
    /// Adapter name to paused flag.
    pub paused: BTreeMap<&'static str, bool>,
    pub notifications: NotificationCounters,
    pub recent_events: Vec<Event>,
}

/// GET /api/status
pub async fn status(State(ctx): State<AppContext>) -> Result<Json<StatusResponse>, AppError> {
    let conn = lm_db::pool::get_conn(&ctx.db)?;
    let dead_letters = lm_db::queries::dead_letters::count_unresolved(&conn)?;
    let retrying = lm_db::queries::operations::count_retrying(&conn)?;
    let inventory = lm_db::queries::inventory::state_counts(&conn)?;

    let paused = Adapter::ALL
        .iter()
        .map(|a| (a.as_str(), ctx.controls.is_paused(*a)))
        .collect();

    Ok(Json(StatusResponse {
        queue: ctx.queue.stats(),
        last_poll: ctx.controls.last_poll(),
        last_scan: ctx.controls.last_scan(),
        dead_letters,
        retrying,
        inventory,
        paused,
        notifications: ctx.notifier.stats().snapshot(),
        recent_events: ctx.event_bus.recent_events(RECENT_EVENTS),
    }))
}
