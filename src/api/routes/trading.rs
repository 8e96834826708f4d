use axum::{
    extract::{Path, Query, State},
    routing::{delete, get, post},
    Extension, Json, Router,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::api::response::{ApiError, ApiResponse, ApiResult};
use crate::api::AppState;
use crate::auth::Principal;
use crate::domain::entities::position::{Position, PositionSide};
use crate::domain::errors::EngineError;
use crate::domain::services::candle_builder::{build_candles, interval_secs, Candle};
use crate::application::trade_service::OpenOrder;
use crate::persistence::repository::HistoryFilter;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/trading/order", post(open_order))
        .route("/trading/order/:id", delete(close_order))
        .route("/trading/positions", get(open_positions))
        .route("/trading/positions/all", delete(close_all))
        .route("/trading/history", get(history))
        .route("/trading/kline", get(kline))
        .route("/trading/prices", get(prices))
}

#[derive(Debug, Serialize)]
struct PositionView {
    #[serde(flatten)]
    position: Position,
    mark_price: Option<f64>,
    unrealized_pnl: Option<f64>,
}

impl PositionView {
    fn build(position: Position, mark: Option<f64>) -> Self {
        let unrealized = mark.map(|m| position.unrealized_pnl(m));
        Self {
            position,
            mark_price: mark,
            unrealized_pnl: unrealized,
        }
    }
}

#[derive(Debug, Deserialize)]
struct OpenOrderRequest {
    challenge_id: i64,
    symbol: String,
    side: PositionSide,
    qty: f64,
    leverage: u32,
    take_profit: Option<f64>,
    stop_loss: Option<f64>,
}

async fn open_order(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Json(body): Json<OpenOrderRequest>,
) -> ApiResult<PositionView> {
    let position = state
        .trades
        .open_position(
            &principal,
            body.challenge_id,
            OpenOrder {
                symbol: body.symbol.to_uppercase(),
                side: body.side,
                qty: body.qty,
                leverage: body.leverage,
                take_profit: body.take_profit,
                stop_loss: body.stop_loss,
            },
        )
        .await?;
    let mark = position.entry_price;
    Ok(ApiResponse::ok(PositionView::build(position, Some(mark))))
}

async fn close_order(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<i64>,
) -> ApiResult<PositionView> {
    let position = state.trades.close_position(&principal, id).await?;
    let mark = position.close_price;
    Ok(ApiResponse::ok(PositionView::build(position, mark)))
}

#[derive(Debug, Deserialize)]
struct ChallengeQuery {
    challenge_id: i64,
}

async fn open_positions(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Query(query): Query<ChallengeQuery>,
) -> ApiResult<Vec<PositionView>> {
    let positions = state.trades.list_open(&principal, query.challenge_id).await?;
    let marks = state.feed.snapshot().await;
    let views = positions
        .into_iter()
        .map(|p| {
            let mark = marks.get(&p.symbol).map(|q| q.price);
            PositionView::build(p, mark)
        })
        .collect();
    Ok(ApiResponse::ok(views))
}

#[derive(Debug, Serialize)]
struct CloseAllView {
    closed: Vec<PositionView>,
    skipped_position_ids: Vec<i64>,
}

async fn close_all(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Query(query): Query<ChallengeQuery>,
) -> ApiResult<CloseAllView> {
    let (closed, skipped) = state.trades.close_all(&principal, query.challenge_id).await?;
    Ok(ApiResponse::ok(CloseAllView {
        closed: closed
            .into_iter()
            .map(|p| {
                let mark = p.close_price;
                PositionView::build(p, mark)
            })
            .collect(),
        skipped_position_ids: skipped,
    }))
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    challenge_id: i64,
    cursor: Option<i64>,
    limit: Option<i64>,
    side: Option<String>,
    symbol: Option<String>,
}

#[derive(Debug, Serialize)]
struct HistoryPage {
    items: Vec<Position>,
    next_cursor: Option<i64>,
}

async fn history(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<HistoryPage> {
    let side = match query.side.as_deref() {
        Some(s) => Some(PositionSide::parse(s).ok_or_else(|| {
            ApiError(EngineError::InvalidInput(format!("unknown side '{s}'")))
        })?),
        None => None,
    };
    let limit = query.limit.unwrap_or(50).clamp(1, 200);
    let items = state
        .trades
        .history(
            &principal,
            query.challenge_id,
            HistoryFilter {
                cursor: query.cursor,
                limit,
                side,
                symbol: query.symbol.map(|s| s.to_uppercase()),
            },
        )
        .await?;
    let next_cursor = if items.len() as i64 == limit {
        items.last().map(|p| p.id)
    } else {
        None
    };
    Ok(ApiResponse::ok(HistoryPage { items, next_cursor }))
}

#[derive(Debug, Deserialize)]
struct KlineQuery {
    symbol: String,
    interval: Option<String>,
    limit: Option<usize>,
}

/// Candles derived from the in-memory price buffer.
async fn kline(
    State(state): State<AppState>,
    Query(query): Query<KlineQuery>,
) -> ApiResult<Vec<Candle>> {
    let symbol = query.symbol.to_uppercase();
    if !state.feed.is_tracked(&symbol) {
        return Err(ApiError(EngineError::SymbolUnknown(symbol)));
    }
    let interval = query.interval.as_deref().unwrap_or("60");
    let secs = interval_secs(interval).ok_or_else(|| {
        ApiError(EngineError::InvalidInput(format!(
            "unsupported interval '{interval}'"
        )))
    })?;
    let limit = query.limit.unwrap_or(200).clamp(1, 1_000);
    let points = state.feed.buffer(&symbol).await;
    Ok(ApiResponse::ok(build_candles(&points, secs, limit)))
}

#[derive(Debug, Serialize)]
struct PriceView {
    price: f64,
    staleness_ms: u64,
}

async fn prices(State(state): State<AppState>) -> ApiResult<HashMap<String, PriceView>> {
    let marks = state.feed.snapshot().await;
    Ok(ApiResponse::ok(
        marks
            .into_iter()
            .map(|(symbol, q)| {
                (
                    symbol,
                    PriceView {
                        price: q.price,
                        staleness_ms: q.staleness_ms,
                    },
                )
            })
            .collect(),
    ))
}
