//! Read-only inventory listing.

use axum::extract::{Query, State};
use axum::Json;
use lm_core::{normalize_path, InventoryEntry};
use serde::{Deserialize, Serialize};

use crate::context::AppContext;

use super::error::AppError;

const MAX_LIMIT: i64 = 1000;

#[derive(Debug, Deserialize)]
pub struct InventoryParams {
    #[serde(default)]
    pub prefix: String,
    /// SQLite GLOB pattern matched against the full path.
    pub pattern: Option<String>,
    #[serde(default)]
    pub offset: i64,
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_limit() -> i64 {
    100
}

#[derive(Debug, Serialize)]
pub struct InventoryPage {
    pub total: i64,
    pub offset: i64,
    pub limit: i64,
    pub entries: Vec<InventoryEntry>,
}

/// GET /api/inventory
pub async fn list_inventory(
    State(ctx): State<AppContext>,
    Query(params): Query<InventoryParams>,
) -> Result<Json<InventoryPage>, AppError> {
    let offset = params.offset.max(0);
    let limit = params.limit.clamp(1, MAX_LIMIT);
    let prefix = normalize_path(&params.prefix);
    let pattern = params.pattern.filter(|p| !p.is_empty());

    let conn = lm_db::pool::get_conn(&ctx.db)?;
    let entries = lm_db::queries::inventory::list_page(&conn, &prefix, pattern.as_deref(), offset, limit)?;
    let total = lm_db::queries::inventory::count(&conn)?;

    Ok(Json(InventoryPage {
        total,
        offset,
        limit,
        entries,
    }))
}
