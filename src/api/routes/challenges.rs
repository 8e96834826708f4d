use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Extension, Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::api::response::{ApiError, ApiResponse, ApiResult};
use crate::api::AppState;
use crate::auth::Principal;
use crate::domain::entities::challenge::{Challenge, ChallengeStatus, ChallengeType};
use crate::domain::errors::EngineError;
use crate::domain::services::pnl;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/challenges", get(catalog))
        .route("/challenges/purchase", post(purchase))
        .route("/challenges/my", get(my_challenges))
        .route("/challenges/:id", get(detail))
        .route("/challenges/:id/rules", get(rules))
}

async fn catalog(State(state): State<AppState>) -> ApiResult<Vec<ChallengeType>> {
    Ok(ApiResponse::ok(state.types.list_active().await?))
}

#[derive(Debug, Deserialize)]
struct PurchaseRequest {
    challenge_type_id: i64,
}

/// Purchase a plan: creates a fresh challenge in phase1. Payment handling
/// lives with the embedding host; the engine records the result.
async fn purchase(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Json(body): Json<PurchaseRequest>,
) -> ApiResult<Challenge> {
    let ct = state
        .types
        .get(body.challenge_type_id)
        .await?
        .filter(|ct| ct.is_active)
        .ok_or_else(|| {
            ApiError(EngineError::NotFound(format!(
                "challenge type {}",
                body.challenge_type_id
            )))
        })?;
    let challenge = state.challenges.create(principal.user_id, &ct).await?;
    Ok(ApiResponse::ok(challenge))
}

#[derive(Debug, Deserialize)]
struct MyQuery {
    status: Option<String>,
}

async fn my_challenges(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Query(query): Query<MyQuery>,
) -> ApiResult<Vec<Challenge>> {
    let status = match query.status.as_deref() {
        Some(s) => Some(ChallengeStatus::parse(s).ok_or_else(|| {
            ApiError(EngineError::InvalidInput(format!("unknown status '{s}'")))
        })?),
        None => None,
    };
    let list = state.challenges.list_by_user(principal.user_id, status).await?;
    Ok(ApiResponse::ok(list))
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

async fn detail(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<i64>,
) -> ApiResult<Challenge> {
    Ok(ApiResponse::ok(owned(&state, &principal, id).await?))
}

#[derive(Debug, Serialize)]
struct RulesView {
    status: ChallengeStatus,
    equity: f64,
    profit_target_pct: Option<f64>,
    profit_progress_pct: f64,
    daily_drawdown_pct: f64,
    max_daily_loss_pct: f64,
    total_drawdown_pct: f64,
    max_total_loss_pct: f64,
    trading_days_count: u32,
    min_trading_days: u32,
    open_positions: usize,
}

/// Current progress against the plan's limits and targets.
async fn rules(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<i64>,
) -> ApiResult<RulesView> {
    let challenge = owned(&state, &principal, id).await?;
    let ct = state
        .types
        .get(challenge.type_id)
        .await?
        .ok_or_else(|| ApiError(EngineError::Internal("catalog row missing".into())))?;

    let open = state.positions.list_open(id).await?;
    let marks = state.feed.snapshot().await;
    let equity = pnl::equity(challenge.current_balance, &open, |s| {
        marks.get(s).map(|q| q.price)
    });

    let target_pct = ct.profit_target_pct(challenge.status);
    let progress = match target_pct {
        Some(t) if t > 0.0 && challenge.initial_balance > 0.0 => {
            let profit_pct = (equity - challenge.initial_balance) / challenge.initial_balance
                * 100.0;
            (profit_pct / t * 100.0).clamp(0.0, 100.0)
        }
        _ => 0.0,
    };

    Ok(ApiResponse::ok(RulesView {
        status: challenge.status,
        equity,
        profit_target_pct: target_pct,
        profit_progress_pct: progress,
        daily_drawdown_pct: pnl::daily_drawdown_pct(challenge.daily_anchor_equity, equity),
        max_daily_loss_pct: ct.max_daily_loss_pct,
        total_drawdown_pct: pnl::total_drawdown_pct(
            ct.drawdown_type,
            challenge.initial_balance,
            challenge.peak_equity,
            equity,
        ),
        max_total_loss_pct: ct.max_total_loss_pct,
        trading_days_count: challenge.trading_days_count,
        min_trading_days: ct.min_trading_days,
        open_positions: open.len(),
    }))
}
