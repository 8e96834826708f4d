//! Session Gateway
//!
//! Verifies host-supplied init data (query-string material signed with the
//! platform bot token) and issues the access/refresh token pair. First
//! successful verification creates the user.

use chrono::{Duration as ChronoDuration, Utc};
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::sync::Arc;

use crate::auth;
use crate::config::Settings;
use crate::domain::entities::user::User;
use crate::domain::errors::EngineError;
use crate::persistence::repository::{TokenRepository, UserRepository};

type HmacSha256 = Hmac<Sha256>;

/// Init data older than this is rejected.
const MAX_AUTH_AGE_S: i64 = 24 * 3600;

#[derive(Debug, Deserialize)]
struct InitDataUser {
    id: i64,
    #[serde(default)]
    first_name: Option<String>,
    #[serde(default)]
    username: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VerifiedInitData {
    pub external_id: i64,
    pub display_name: String,
    pub auth_date: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuthOutcome {
    #[serde(flatten)]
    pub tokens: TokenPair,
    pub is_new: bool,
    pub user_id: i64,
}

/// Verify the signature and freshness of host init data.
///
/// The canonical string is every decoded `key=value` pair except `hash`,
/// sorted by key and joined with newlines. The signing key is
/// `HMAC-SHA256("WebAppData", bot_token)`; comparison is constant-time.
pub fn verify_init_data(
    init_data: &str,
    bot_token: &str,
    now_ts: i64,
) -> Result<VerifiedInitData, EngineError> {
    let pairs: Vec<(String, String)> = url::form_urlencoded::parse(init_data.as_bytes())
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    let received_hash = pairs
        .iter()
        .find(|(k, _)| k == "hash")
        .map(|(_, v)| v.clone())
        .ok_or_else(|| EngineError::Unauthenticated("init data missing hash".into()))?;

    let auth_date: i64 = pairs
        .iter()
        .find(|(k, _)| k == "auth_date")
        .and_then(|(_, v)| v.parse().ok())
        .ok_or_else(|| EngineError::Unauthenticated("init data missing auth_date".into()))?;
    if now_ts - auth_date > MAX_AUTH_AGE_S {
        return Err(EngineError::Unauthenticated("init data expired".into()));
    }

    let mut check_parts: Vec<String> = pairs
        .iter()
        .filter(|(k, _)| k != "hash")
        .map(|(k, v)| format!("{k}={v}"))
        .collect();
    check_parts.sort();
    let data_check_string = check_parts.join("\n");

    let mut key_mac = HmacSha256::new_from_slice(b"WebAppData")
        .map_err(|e| EngineError::Internal(format!("hmac init failed: {e}")))?;
    key_mac.update(bot_token.as_bytes());
    let secret_key = key_mac.finalize().into_bytes();

    let mut mac = HmacSha256::new_from_slice(&secret_key)
        .map_err(|e| EngineError::Internal(format!("hmac init failed: {e}")))?;
    mac.update(data_check_string.as_bytes());

    let received = hex::decode(&received_hash)
        .map_err(|_| EngineError::Unauthenticated("init data hash is not hex".into()))?;
    mac.verify_slice(&received)
        .map_err(|_| EngineError::Unauthenticated("init data signature mismatch".into()))?;

    let user: InitDataUser = pairs
        .iter()
        .find(|(k, _)| k == "user")
        .and_then(|(_, v)| serde_json::from_str(v).ok())
        .ok_or_else(|| EngineError::Unauthenticated("init data missing user".into()))?;

    let display_name = user
        .username
        .or(user.first_name)
        .unwrap_or_else(|| format!("trader{}", user.id));

    Ok(VerifiedInitData {
        external_id: user.id,
        display_name,
        auth_date,
    })
}

pub struct SessionService {
    users: UserRepository,
    tokens: TokenRepository,
    settings: Arc<Settings>,
}

impl SessionService {
    pub fn new(users: UserRepository, tokens: TokenRepository, settings: Arc<Settings>) -> Self {
        Self {
            users,
            tokens,
            settings,
        }
    }

    /// Verify init data and exchange it for a token pair, creating the user
    /// on first contact.
    pub async fn authenticate(
        &self,
        init_data: &str,
        referral_code: Option<&str>,
    ) -> Result<AuthOutcome, EngineError> {
        let verified = verify_init_data(
            init_data,
            &self.settings.platform_bot_token,
            Utc::now().timestamp(),
        )?;

        let (user, is_new) = match self.users.find_by_external_id(verified.external_id).await? {
            Some(user) => (user, false),
            None => {
                let user = self
                    .users
                    .create(verified.external_id, &verified.display_name, referral_code)
                    .await?;
                tracing::info!("created user {} for external id {}", user.id, user.external_id);
                (user, true)
            }
        };

        if user.is_blocked {
            return Err(EngineError::Forbidden("account is blocked".into()));
        }

        let tokens = self.issue_pair(&user).await?;
        Ok(AuthOutcome {
            tokens,
            is_new,
            user_id: user.id,
        })
    }

    /// Rotate a refresh token: the presented token is consumed and a fresh
    /// pair issued.
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenPair, EngineError> {
        let user_id = self
            .tokens
            .consume(refresh_token)
            .await?
            .ok_or_else(|| EngineError::Unauthenticated("invalid refresh token".into()))?;

        let user = self
            .users
            .get(user_id)
            .await?
            .ok_or_else(|| EngineError::Unauthenticated("user no longer exists".into()))?;
        if user.is_blocked {
            return Err(EngineError::Forbidden("account is blocked".into()));
        }

        self.issue_pair(&user).await
    }

    async fn issue_pair(&self, user: &User) -> Result<TokenPair, EngineError> {
        let access_token = auth::issue_access_token(
            &self.settings.jwt_signing_key,
            user.id,
            user.role,
            self.settings.access_ttl_s,
        )?;

        let mut raw = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut raw);
        let refresh_token = hex::encode(raw);
        let expires_at = Utc::now() + ChronoDuration::seconds(self.settings.refresh_ttl_s as i64);
        self.tokens
            .insert(&refresh_token, user.id, expires_at)
            .await?;

        Ok(TokenPair {
            access_token,
            refresh_token,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a correctly signed init-data string the way the host would.
    pub(crate) fn signed_init_data(bot_token: &str, external_id: i64, auth_date: i64) -> String {
        let user_json = format!(
            r#"{{"id":{external_id},"first_name":"Alice","username":"alice_t"}}"#
        );
        let pairs = vec![
            ("auth_date".to_string(), auth_date.to_string()),
            ("query_id".to_string(), "AAE1".to_string()),
            ("user".to_string(), user_json),
        ];

        let mut check_parts: Vec<String> =
            pairs.iter().map(|(k, v)| format!("{k}={v}")).collect();
        check_parts.sort();
        let data_check_string = check_parts.join("\n");

        let mut key_mac = HmacSha256::new_from_slice(b"WebAppData").unwrap();
        key_mac.update(bot_token.as_bytes());
        let secret = key_mac.finalize().into_bytes();
        let mut mac = HmacSha256::new_from_slice(&secret).unwrap();
        mac.update(data_check_string.as_bytes());
        let hash = hex::encode(mac.finalize().into_bytes());

        let mut serializer = url::form_urlencoded::Serializer::new(String::new());
        for (k, v) in &pairs {
            serializer.append_pair(k, v);
        }
        serializer.append_pair("hash", &hash);
        serializer.finish()
    }

    #[test]
    fn valid_init_data_verifies() {
        let now = 1_754_000_000;
        let data = signed_init_data("bot:secret", 777, now - 60);
        let verified = verify_init_data(&data, "bot:secret", now).unwrap();
        assert_eq!(verified.external_id, 777);
        assert_eq!(verified.display_name, "alice_t");
    }

    #[test]
    fn tampered_payload_rejected() {
        let now = 1_754_000_000;
        let data = signed_init_data("bot:secret", 777, now - 60);
        let tampered = data.replace("alice_t", "mallory");
        assert!(matches!(
            verify_init_data(&tampered, "bot:secret", now),
            Err(EngineError::Unauthenticated(_))
        ));
    }

    #[test]
    fn wrong_bot_token_rejected() {
        let now = 1_754_000_000;
        let data = signed_init_data("bot:secret", 777, now - 60);
        assert!(verify_init_data(&data, "bot:other", now).is_err());
    }

    #[test]
    fn stale_auth_date_rejected() {
        let now = 1_754_000_000;
        let data = signed_init_data("bot:secret", 777, now - MAX_AUTH_AGE_S - 1);
        let err = verify_init_data(&data, "bot:secret", now).unwrap_err();
        assert!(err.to_string().contains("expired"));
    }

    #[test]
    fn missing_hash_rejected() {
        assert!(verify_init_data("auth_date=1&user=%7B%7D", "t", 10).is_err());
    }
}
