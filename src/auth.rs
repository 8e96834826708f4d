//! Access-token verification and the authenticated principal.
//!
//! Access tokens are short-lived JWTs embedding `(user_id, role, expiry)`.
//! The middleware resolves them once; every inner component works with the
//! resolved [`Principal`].

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::Response,
};
use chrono::Utc;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::Settings;
use crate::domain::entities::user::UserRole;
use crate::domain::errors::EngineError;

/// Resolved identity attached to every authenticated request.
#[derive(Debug, Clone, Copy)]
pub struct Principal {
    pub user_id: i64,
    pub role: UserRole,
}

impl Principal {
    pub fn require_admin(&self) -> Result<(), EngineError> {
        if self.role.is_admin() {
            Ok(())
        } else {
            Err(EngineError::Forbidden("admin role required".into()))
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: i64,
    role: String,
    exp: i64,
}

pub fn issue_access_token(
    signing_key: &str,
    user_id: i64,
    role: UserRole,
    ttl_s: u64,
) -> Result<String, EngineError> {
    let claims = Claims {
        sub: user_id,
        role: role.as_str().to_string(),
        exp: Utc::now().timestamp() + ttl_s as i64,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(signing_key.as_bytes()),
    )
    .map_err(|e| EngineError::Internal(format!("token encoding failed: {e}")))
}

pub fn verify_access_token(signing_key: &str, token: &str) -> Result<Principal, EngineError> {
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(signing_key.as_bytes()),
        &Validation::default(),
    )
    .map_err(|e| EngineError::Unauthenticated(format!("invalid access token: {e}")))?;

    let role = UserRole::parse(&data.claims.role)
        .ok_or_else(|| EngineError::Unauthenticated("unknown role in token".into()))?;

    Ok(Principal {
        user_id: data.claims.sub,
        role,
    })
}

/// Middleware guarding authenticated endpoints: resolves the bearer token
/// into a [`Principal`] request extension.
pub async fn require_auth(
    State(settings): State<Arc<Settings>>,
    mut request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let header = request
        .headers()
        .get("Authorization")
        .and_then(|v| v.to_str().ok());

    let token = match header {
        Some(h) if h.starts_with("Bearer ") => &h[7..],
        Some(_) => {
            tracing::warn!("malformed Authorization header");
            return Err(StatusCode::UNAUTHORIZED);
        }
        None => return Err(StatusCode::UNAUTHORIZED),
    };

    match verify_access_token(&settings.jwt_signing_key, token) {
        Ok(principal) => {
            request.extensions_mut().insert(principal);
            Ok(next.run(request).await)
        }
        Err(e) => {
            tracing::warn!("rejected access token: {e}");
            Err(StatusCode::UNAUTHORIZED)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_round_trip() {
        let token = issue_access_token("test_key", 42, UserRole::Trader, 60).unwrap();
        let principal = verify_access_token("test_key", &token).unwrap();
        assert_eq!(principal.user_id, 42);
        assert_eq!(principal.role, UserRole::Trader);
    }

    #[test]
    fn wrong_key_rejected() {
        let token = issue_access_token("key_a", 1, UserRole::Trader, 60).unwrap();
        assert!(verify_access_token("key_b", &token).is_err());
    }

    #[test]
    fn expired_token_rejected() {
        // jsonwebtoken applies default leeway, so push expiry well past it.
        let claims = Claims {
            sub: 1,
            role: "trader".into(),
            exp: Utc::now().timestamp() - 600,
        };
        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(b"test_key"),
        )
        .unwrap();
        assert!(verify_access_token("test_key", &token).is_err());
    }

    #[test]
    fn admin_gate() {
        let admin = Principal {
            user_id: 1,
            role: UserRole::Admin,
        };
        let trader = Principal {
            user_id: 2,
            role: UserRole::Trader,
        };
        assert!(admin.require_admin().is_ok());
        assert!(trader.require_admin().is_err());
    }
}
