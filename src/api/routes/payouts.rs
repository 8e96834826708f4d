use axum::{
    extract::{Query, State},
    routing::{get, post},
    Extension, Json, Router,
};
use serde::Deserialize;

use crate::api::response::{ApiError, ApiResponse, ApiResult};
use crate::api::AppState;
use crate::application::payout_service::AvailablePayout;
use crate::auth::Principal;
use crate::domain::entities::payout::{Payout, PayoutNetwork};
use crate::domain::errors::EngineError;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/payouts", get(list))
        .route("/payouts/available", get(available))
        .route("/payouts/request", post(request))
}

#[derive(Debug, Deserialize)]
struct ChallengeQuery {
    challenge_id: i64,
}

async fn available(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Query(query): Query<ChallengeQuery>,
) -> ApiResult<AvailablePayout> {
    let view = state.payouts.available(&principal, query.challenge_id).await?;
    Ok(ApiResponse::ok(view))
}

#[derive(Debug, Deserialize)]
struct PayoutRequestBody {
    challenge_id: i64,
    amount: f64,
    wallet_address: String,
    network: String,
}

async fn request(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Json(body): Json<PayoutRequestBody>,
) -> ApiResult<Payout> {
    let network = PayoutNetwork::parse(&body.network).ok_or_else(|| {
        ApiError(EngineError::InvalidInput(format!(
            "network must be one of TRC20, ERC20, BEP20 (got '{}')",
            body.network
        )))
    })?;
    let payout = state
        .payouts
        .request(
            &principal,
            body.challenge_id,
            body.amount,
            &body.wallet_address,
            network,
        )
        .await?;
    Ok(ApiResponse::ok(payout))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    challenge_id: Option<i64>,
}

async fn list(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Vec<Payout>> {
    let payouts = state.payouts.list(&principal, query.challenge_id).await?;
    Ok(ApiResponse::ok(payouts))
}
