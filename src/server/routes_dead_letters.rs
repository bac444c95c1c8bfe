use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use lm_db::models::DeadLetter;
use serde::Deserialize;
use serde_json::json;

use crate::context::AppContext;

use super::error::AppError;

#[derive(Debug, Deserialize)]
pub struct ListDeadLettersParams {
    #[serde(default)]
    pub include_resolved: bool,
    #[serde(default)]
    pub offset: i64,
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_limit() -> i64 {
    50
}

/// GET /api/dead-letters
pub async fn list_dead_letters(
    State(ctx): State<AppContext>,
    Query(params): Query<ListDeadLettersParams>,
) -> Result<Json<Vec<DeadLetter>>, AppError> {
    let conn = lm_db::pool::get_conn(&ctx.db)?;
    let letters = lm_db::queries::dead_letters::list(
        &conn,
        params.include_resolved,
        params.offset.max(0),
        params.limit.clamp(1, 500),
    )?;
    Ok(Json(letters))
}

/// POST /api/dead-letters/{id}/retry
pub async fn retry_dead_letter(
    State(ctx): State<AppContext>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, AppError> {
    let op_id = ctx.queue.retry_dead_letter(id).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "dead_letter": id, "operation_id": op_id.to_string() })),
    ))
}
