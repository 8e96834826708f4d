use axum::{
    extract::Request,
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use std::num::NonZeroU32;
use std::sync::Arc;

/// Global request rate limiter shared across all routes.
pub type GlobalRateLimiter = Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>;

pub fn create_rate_limiter(requests_per_minute: u32) -> GlobalRateLimiter {
    let quota = Quota::per_minute(
        NonZeroU32::new(requests_per_minute.max(1)).expect("non-zero quota"),
    );
    Arc::new(RateLimiter::direct(quota))
}

pub async fn rate_limit_middleware(
    limiter: GlobalRateLimiter,
    request: Request,
    next: Next,
) -> Response {
    match limiter.check() {
        Ok(_) => next.run(request).await,
        Err(_) => {
            tracing::warn!("rate limit exceeded");
            (
                StatusCode::TOO_MANY_REQUESTS,
                "Rate limit exceeded. Please try again later.",
            )
                .into_response()
        }
    }
}
