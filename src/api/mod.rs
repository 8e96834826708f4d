//! HTTP/WebSocket surface: versioned router, shared state, middleware.

pub mod response;
pub mod routes;

use axum::http::{header, Method};
use axum::{middleware, routing::get, Json, Router};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;

use crate::application::leaderboard::LeaderboardService;
use crate::application::locks::ChallengeLocks;
use crate::application::payout_service::PayoutService;
use crate::application::price_feed::PriceFeed;
use crate::application::push::PushHub;
use crate::application::session::SessionService;
use crate::application::trade_service::TradeService;
use crate::config::Settings;
use crate::persistence::repository::{
    ChallengeRepository, ChallengeTypeRepository, PositionRepository, SnapshotRepository,
    TokenRepository, UserRepository,
};
use crate::persistence::DbPool;
use crate::rate_limit::{create_rate_limiter, rate_limit_middleware};

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub pool: DbPool,
    pub feed: Arc<PriceFeed>,
    pub push: Arc<PushHub>,
    pub locks: Arc<ChallengeLocks>,
    pub sessions: Arc<SessionService>,
    pub trades: Arc<TradeService>,
    pub payouts: Arc<PayoutService>,
    pub leaderboard: Arc<LeaderboardService>,
    pub users: UserRepository,
    pub challenges: ChallengeRepository,
    pub types: ChallengeTypeRepository,
    pub positions: PositionRepository,
    pub snapshots: SnapshotRepository,
}

impl AppState {
    pub fn new(
        settings: Arc<Settings>,
        pool: DbPool,
        feed: Arc<PriceFeed>,
        push: Arc<PushHub>,
        locks: Arc<ChallengeLocks>,
    ) -> Self {
        let sessions = Arc::new(SessionService::new(
            UserRepository::new(pool.clone()),
            TokenRepository::new(pool.clone()),
            settings.clone(),
        ));
        let trades = Arc::new(TradeService::new(
            pool.clone(),
            locks.clone(),
            feed.clone(),
            push.clone(),
        ));
        let payouts = Arc::new(PayoutService::new(
            pool.clone(),
            locks.clone(),
            push.clone(),
        ));
        let leaderboard = Arc::new(LeaderboardService::new(pool.clone()));

        Self {
            users: UserRepository::new(pool.clone()),
            challenges: ChallengeRepository::new(pool.clone()),
            types: ChallengeTypeRepository::new(pool.clone()),
            positions: PositionRepository::new(pool.clone()),
            snapshots: SnapshotRepository::new(pool.clone()),
            settings,
            pool,
            feed,
            push,
            locks,
            sessions,
            trades,
            payouts,
            leaderboard,
        }
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "running" }))
}

fn cors_layer(settings: &Settings) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE]);
    if settings.allowed_origins.is_empty() {
        layer.allow_origin(Any)
    } else {
        let origins: Vec<_> = settings
            .allowed_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        layer.allow_origin(AllowOrigin::list(origins))
    }
}

pub fn build_router(state: AppState) -> Router {
    let public = Router::new()
        .route("/auth/telegram", axum::routing::post(routes::auth::telegram))
        .route("/auth/refresh", axum::routing::post(routes::auth::refresh));

    let protected = Router::new()
        .merge(routes::challenges::router())
        .merge(routes::trading::router())
        .merge(routes::stats::router())
        .merge(routes::payouts::router())
        .merge(routes::leaderboard::router())
        .merge(routes::admin::router())
        .layer(middleware::from_fn_with_state(
            state.settings.clone(),
            crate::auth::require_auth,
        ));

    let limiter = create_rate_limiter(state.settings.requests_per_minute);
    let timeout = TimeoutLayer::new(Duration::from_secs(state.settings.request_timeout_s));
    let cors = cors_layer(&state.settings);

    Router::new()
        .route("/health", get(health))
        .route(
            "/ws/trading/ws/:challenge_id",
            get(routes::ws::trading_ws),
        )
        .nest("/api/v1", public.merge(protected))
        .layer(middleware::from_fn(
            move |req: axum::extract::Request, next: middleware::Next| {
                let limiter = limiter.clone();
                async move { rate_limit_middleware(limiter, req, next).await }
            },
        ))
        .layer(timeout)
        .layer(cors)
        .with_state(state)
}
