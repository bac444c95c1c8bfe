//! Operator controls: adapter pause/resume, scans, flushes and reloads.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use lm_core::events::EventPayload;
use lm_core::Error;
use serde::Serialize;
use serde_json::json;

use crate::context::{Adapter, AppContext};
use crate::notifications::FlushReport;

use super::error::AppError;

#[derive(Debug, Serialize)]
pub struct AdapterState {
    pub adapter: &'static str,
    pub paused: bool,
    /// Whether this request changed the state.
    pub changed: bool,
}

/// POST /api/adapters/{adapter}/{action}
pub async fn set_adapter(
    State(ctx): State<AppContext>,
    Path((adapter, action)): Path<(String, String)>,
) -> Result<Json<AdapterState>, AppError> {
    let adapter: Adapter = adapter.parse().map_err(Error::Validation)?;
    let paused = match action.as_str() {
        "pause" => true,
        "resume" => false,
        other => return Err(Error::Validation(format!("unknown action '{other}'")).into()),
    };

    let was_paused = ctx.controls.set_paused(adapter, paused);
    let changed = was_paused != paused;
    if changed {
        let name = adapter.as_str().to_string();
        if paused {
            tracing::info!(adapter = %adapter, "Adapter paused");
            ctx.event_bus.broadcast(EventPayload::AdapterPaused { adapter: name });
        } else {
            tracing::info!(adapter = %adapter, "Adapter resumed");
            ctx.event_bus.broadcast(EventPayload::AdapterResumed { adapter: name });
        }
    }

    Ok(Json(AdapterState {
        adapter: adapter.as_str(),
        paused,
        changed,
    }))
}

/// POST /api/scan
pub async fn trigger_scan(State(ctx): State<AppContext>) -> impl IntoResponse {
    ctx.controls.request_scan();
    (StatusCode::ACCEPTED, Json(json!({ "scan": "requested" })))
}

/// POST /api/notifications/flush
pub async fn flush_notifications(State(ctx): State<AppContext>) -> Result<Json<FlushReport>, AppError> {
    let report = ctx.notifier.flush_and_wait().await?;
    Ok(Json(report))
}

/// POST /api/config/reload
pub async fn reload_config(State(ctx): State<AppContext>) -> Result<impl IntoResponse, AppError> {
    let warnings = ctx.config.reload()?;
    Ok(Json(json!({ "reloaded": true, "warnings": warnings })))
}
