use axum::{extract::State, Json};
use serde::Deserialize;

use crate::api::response::{ApiResponse, ApiResult};
use crate::api::AppState;
use crate::application::session::{AuthOutcome, TokenPair};

#[derive(Debug, Deserialize)]
pub struct TelegramAuthRequest {
    pub init_data: String,
    pub referral_code: Option<String>,
}

pub async fn telegram(
    State(state): State<AppState>,
    Json(body): Json<TelegramAuthRequest>,
) -> ApiResult<AuthOutcome> {
    let outcome = state
        .sessions
        .authenticate(&body.init_data, body.referral_code.as_deref())
        .await?;
    Ok(ApiResponse::ok(outcome))
}

#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

pub async fn refresh(
    State(state): State<AppState>,
    Json(body): Json<RefreshRequest>,
) -> ApiResult<TokenPair> {
    let pair = state.sessions.refresh(&body.refresh_token).await?;
    Ok(ApiResponse::ok(pair))
}
