use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Extension, Json, Router,
};
use serde::Deserialize;

use crate::api::response::{ApiError, ApiResponse, ApiResult};
use crate::api::AppState;
use crate::auth::Principal;
use crate::domain::entities::challenge::Challenge;
use crate::domain::entities::payout::{Payout, PayoutStatus};
use crate::domain::entities::user::User;
use crate::domain::errors::EngineError;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/admin/users", get(list_users))
        .route("/admin/users/:id/block", post(block_user))
        .route("/admin/challenges", get(list_challenges))
        .route("/admin/payouts", get(list_payouts))
        .route("/admin/payouts/:id/approve", post(approve_payout))
        .route("/admin/payouts/:id/reject", post(reject_payout))
        .route("/admin/payouts/:id/sent", post(mark_payout_sent))
}

#[derive(Debug, Deserialize)]
struct LimitQuery {
    limit: Option<i64>,
}

async fn list_users(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Query(query): Query<LimitQuery>,
) -> ApiResult<Vec<User>> {
    principal.require_admin()?;
    let users = state.users.list(query.limit.unwrap_or(200).clamp(1, 1_000)).await?;
    Ok(ApiResponse::ok(users))
}

#[derive(Debug, Deserialize)]
struct BlockRequest {
    blocked: bool,
}

async fn block_user(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<i64>,
    Json(body): Json<BlockRequest>,
) -> ApiResult<User> {
    principal.require_admin()?;
    state.users.set_blocked(id, body.blocked).await?;
    let user = state
        .users
        .get(id)
        .await?
        .ok_or_else(|| ApiError(EngineError::NotFound(format!("user {id}"))))?;
    Ok(ApiResponse::ok(user))
}

async fn list_challenges(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Query(query): Query<LimitQuery>,
) -> ApiResult<Vec<Challenge>> {
    principal.require_admin()?;
    let list = state
        .challenges
        .list_all(query.limit.unwrap_or(200).clamp(1, 1_000))
        .await?;
    Ok(ApiResponse::ok(list))
}

#[derive(Debug, Deserialize)]
struct PayoutListQuery {
    status: Option<String>,
}

async fn list_payouts(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Query(query): Query<PayoutListQuery>,
) -> ApiResult<Vec<Payout>> {
    let status = match query.status.as_deref() {
        Some(s) => PayoutStatus::parse(s).ok_or_else(|| {
            ApiError(EngineError::InvalidInput(format!("unknown status '{s}'")))
        })?,
        None => PayoutStatus::Pending,
    };
    let payouts = state.payouts.list_by_status(&principal, status).await?;
    Ok(ApiResponse::ok(payouts))
}

async fn approve_payout(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<i64>,
) -> ApiResult<Payout> {
    let payout = state.payouts.approve(&principal, id).await?;
    Ok(ApiResponse::ok(payout))
}

async fn reject_payout(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<i64>,
) -> ApiResult<Payout> {
    let payout = state.payouts.reject(&principal, id).await?;
    Ok(ApiResponse::ok(payout))
}

#[derive(Debug, Deserialize)]
struct SentRequest {
    tx_hash: String,
}

async fn mark_payout_sent(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<i64>,
    Json(body): Json<SentRequest>,
) -> ApiResult<Payout> {
    let payout = state.payouts.mark_sent(&principal, id, &body.tx_hash).await?;
    Ok(ApiResponse::ok(payout))
}
