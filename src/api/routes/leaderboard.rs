use axum::{
    extract::{Query, State},
    routing::get,
    Router,
};
use serde::Deserialize;

use crate::api::response::{ApiResponse, ApiResult};
use crate::api::AppState;
use crate::application::leaderboard::LeaderboardEntry;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/leaderboard/monthly", get(monthly))
        .route("/leaderboard/alltime", get(alltime))
}

#[derive(Debug, Deserialize)]
struct LimitQuery {
    limit: Option<usize>,
}

async fn monthly(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> ApiResult<Vec<LeaderboardEntry>> {
    let entries = state.leaderboard.monthly(query.limit.unwrap_or(100)).await?;
    Ok(ApiResponse::ok(entries))
}

async fn alltime(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> ApiResult<Vec<LeaderboardEntry>> {
    let entries = state.leaderboard.alltime(query.limit.unwrap_or(100)).await?;
    Ok(ApiResponse::ok(entries))
}
