use axum::{
    extract::{Query, State},
    routing::get,
    Extension, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::api::response::{ApiError, ApiResponse, ApiResult};
use crate::api::AppState;
use crate::auth::Principal;
use crate::domain::entities::challenge::{Challenge, ChallengeStatus};
use crate::domain::errors::EngineError;
use crate::domain::services::{margin, pnl};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/stats/dashboard", get(dashboard))
        .route("/stats/equity-curve", get(equity_curve))
}

async fn owned(
    state: &AppState,
    principal: &Principal,
    id: i64,
) -> Result<Challenge, EngineError> {
    let challenge = if principal.role.is_admin() {
        state.challenges.get(id).await?
    } else {
        state.challenges.get_owned(id, principal.user_id).await?
    };
    challenge.ok_or_else(|| EngineError::NotFound(format!("challenge {id}")))
}

#[derive(Debug, Deserialize)]
struct ChallengeQuery {
    challenge_id: i64,
}

#[derive(Debug, Serialize)]
struct DashboardView {
    status: ChallengeStatus,
    balance: f64,
    equity: f64,
    unrealized_pnl: f64,
    free_margin: f64,
    margin_used: f64,
    daily_pnl_realized: f64,
    total_pnl_realized: f64,
    daily_drawdown_pct: f64,
    total_drawdown_pct: f64,
    peak_equity: f64,
    trading_days_count: u32,
    open_positions: usize,
    scaling_step: u32,
    attempt_number: u32,
}

/// Composite equity/risk snapshot for the dashboard.
async fn dashboard(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Query(query): Query<ChallengeQuery>,
) -> ApiResult<DashboardView> {
    let challenge = owned(&state, &principal, query.challenge_id).await?;
    let ct = state
        .types
        .get(challenge.type_id)
        .await?
        .ok_or_else(|| ApiError(EngineError::Internal("catalog row missing".into())))?;

    let open = state.positions.list_open(challenge.id).await?;
    let marks = state.feed.snapshot().await;
    let equity = pnl::equity(challenge.current_balance, &open, |s| {
        marks.get(s).map(|q| q.price)
    });
    let reserved: f64 = open.iter().map(|p| p.margin_used).sum();

    Ok(ApiResponse::ok(DashboardView {
        status: challenge.status,
        balance: challenge.current_balance,
        equity,
        unrealized_pnl: pnl::round_cents(equity - challenge.current_balance),
        free_margin: margin::free_margin(challenge.current_balance, &open),
        margin_used: pnl::round_cents(reserved),
        daily_pnl_realized: challenge.daily_pnl_realized,
        total_pnl_realized: challenge.total_pnl_realized,
        daily_drawdown_pct: pnl::daily_drawdown_pct(challenge.daily_anchor_equity, equity),
        total_drawdown_pct: pnl::total_drawdown_pct(
            ct.drawdown_type,
            challenge.initial_balance,
            challenge.peak_equity,
            equity,
        ),
        peak_equity: challenge.peak_equity,
        trading_days_count: challenge.trading_days_count,
        open_positions: open.len(),
        scaling_step: challenge.scaling_step,
        attempt_number: challenge.attempt_number,
    }))
}

#[derive(Debug, Deserialize)]
struct CurveQuery {
    challenge_id: i64,
    limit: Option<i64>,
}

#[derive(Debug, Serialize)]
struct CurvePoint {
    time: DateTime<Utc>,
    equity: f64,
    balance: f64,
}

async fn equity_curve(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Query(query): Query<CurveQuery>,
) -> ApiResult<Vec<CurvePoint>> {
    owned(&state, &principal, query.challenge_id).await?;
    let records = state
        .snapshots
        .series(query.challenge_id, query.limit.unwrap_or(500))
        .await?;
    Ok(ApiResponse::ok(
        records
            .into_iter()
            .map(|r| CurvePoint {
                time: r.recorded_at,
                equity: r.equity,
                balance: r.balance,
            })
            .collect(),
    ))
}
