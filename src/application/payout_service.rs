//! Payout Ledger
//!
//! Gates withdrawals from funded challenges. The available amount is the
//! trader's share of realized funded-phase profit minus everything already
//! paid, approved or pending. One pending request per challenge; request
//! creation serializes through the challenge writer lock so a simultaneous
//! duplicate resolves to a conflict.

use serde::Serialize;
use std::sync::Arc;
use tracing::info;

use crate::application::locks::ChallengeLocks;
use crate::application::push::{PushEvent, PushHub};
use crate::auth::Principal;
use crate::domain::entities::challenge::{Challenge, ChallengeStatus, ChallengeType};
use crate::domain::entities::payout::{Payout, PayoutNetwork, PayoutStatus};
use crate::domain::entities::user::UserRole;
use crate::domain::errors::EngineError;
use crate::domain::services::pnl::round_cents;
use crate::persistence::repository::{
    AuditRepository, ChallengeRepository, ChallengeTypeRepository, PayoutRepository,
};
use crate::persistence::DbPool;

#[derive(Debug, Clone, Serialize)]
pub struct AvailablePayout {
    pub challenge_id: i64,
    pub available_amount: f64,
    pub profit_split_pct: f64,
    pub min_payout: f64,
    pub can_request: bool,
    pub pending_payout: bool,
}

pub struct PayoutService {
    pool: DbPool,
    payouts: PayoutRepository,
    challenges: ChallengeRepository,
    types: ChallengeTypeRepository,
    audit: AuditRepository,
    locks: Arc<ChallengeLocks>,
    push: Arc<PushHub>,
}

impl PayoutService {
    pub fn new(pool: DbPool, locks: Arc<ChallengeLocks>, push: Arc<PushHub>) -> Self {
        Self {
            payouts: PayoutRepository::new(pool.clone()),
            challenges: ChallengeRepository::new(pool.clone()),
            types: ChallengeTypeRepository::new(pool.clone()),
            audit: AuditRepository::new(pool.clone()),
            pool,
            locks,
            push,
        }
    }

    async fn funded_challenge(
        &self,
        principal: &Principal,
        challenge_id: i64,
    ) -> Result<(Challenge, ChallengeType), EngineError> {
        let challenge = if principal.role.is_admin() {
            self.challenges.get(challenge_id).await?
        } else {
            self.challenges.get_owned(challenge_id, principal.user_id).await?
        }
        .ok_or_else(|| EngineError::NotFound(format!("challenge {challenge_id}")))?;

        if challenge.status != ChallengeStatus::Funded {
            return Err(EngineError::PreconditionFailed(
                "payouts are available only for funded challenges".into(),
            ));
        }
        let ct = self
            .types
            .get(challenge.type_id)
            .await?
            .ok_or_else(|| EngineError::Internal("catalog row missing".into()))?;
        Ok((challenge, ct))
    }

    pub async fn available(
        &self,
        principal: &Principal,
        challenge_id: i64,
    ) -> Result<AvailablePayout, EngineError> {
        let (challenge, ct) = self.funded_challenge(principal, challenge_id).await?;

        let earned = (challenge.total_pnl_realized.max(0.0)) * ct.profit_split_pct / 100.0;
        let reserved = self.payouts.reserved_total(challenge_id).await?;
        let available = round_cents((earned - reserved).max(0.0));
        let pending = self.payouts.pending_exists(challenge_id).await?;

        Ok(AvailablePayout {
            challenge_id,
            available_amount: available,
            profit_split_pct: ct.profit_split_pct,
            min_payout: ct.min_payout,
            can_request: available >= ct.min_payout && !pending,
            pending_payout: pending,
        })
    }

    pub async fn request(
        &self,
        principal: &Principal,
        challenge_id: i64,
        amount: f64,
        wallet_address: &str,
        network: PayoutNetwork,
    ) -> Result<Payout, EngineError> {
        if !matches!(
            principal.role,
            UserRole::FundedTrader | UserRole::Admin | UserRole::SuperAdmin
        ) {
            return Err(EngineError::Forbidden(
                "only funded traders can request payouts".into(),
            ));
        }
        if !amount.is_finite() || amount <= 0.0 {
            return Err(EngineError::InvalidInput("amount must be positive".into()));
        }
        if wallet_address.trim().len() < 10 {
            return Err(EngineError::InvalidInput("invalid wallet address".into()));
        }

        let _guard = self.locks.acquire(challenge_id).await;

        let (challenge, ct) = self.funded_challenge(principal, challenge_id).await?;
        if self.payouts.pending_exists(challenge_id).await? {
            return Err(EngineError::Conflict(
                "challenge already has a pending payout".into(),
            ));
        }
        if amount < ct.min_payout {
            return Err(EngineError::PreconditionFailed(format!(
                "minimum payout is {:.2} USDT",
                ct.min_payout
            )));
        }
        let earned = (challenge.total_pnl_realized.max(0.0)) * ct.profit_split_pct / 100.0;
        let reserved = self.payouts.reserved_total(challenge_id).await?;
        let available = round_cents((earned - reserved).max(0.0));
        if amount > available {
            return Err(EngineError::PreconditionFailed(format!(
                "amount exceeds available profit share ({available:.2} USDT)"
            )));
        }

        let payout = self
            .payouts
            .insert(
                challenge_id,
                challenge.user_id,
                round_cents(amount),
                wallet_address.trim(),
                network,
            )
            .await?;

        let mut conn = self.pool.acquire().await?;
        self.audit
            .insert(
                &mut conn,
                "payout_requested",
                Some(challenge_id),
                &serde_json::json!({
                    "payout_id": payout.id,
                    "amount": payout.amount,
                    "network": payout.network.as_str(),
                }),
            )
            .await?;
        drop(_guard);

        info!(
            "payout {} requested: {} USDT for challenge {}",
            payout.id, payout.amount, challenge_id
        );
        self.push.publish(
            challenge_id,
            &PushEvent::PayoutStatus {
                payout_id: payout.id,
                status: payout.status,
            },
        );
        Ok(payout)
    }

    pub async fn list(
        &self,
        principal: &Principal,
        challenge_id: Option<i64>,
    ) -> Result<Vec<Payout>, EngineError> {
        match challenge_id {
            Some(id) => {
                if !principal.role.is_admin() {
                    self.challenges
                        .get_owned(id, principal.user_id)
                        .await?
                        .ok_or_else(|| EngineError::NotFound(format!("challenge {id}")))?;
                }
                self.payouts.list_for_challenge(id).await
            }
            None => self.payouts.list_for_user(principal.user_id).await,
        }
    }

    pub async fn list_by_status(
        &self,
        principal: &Principal,
        status: PayoutStatus,
    ) -> Result<Vec<Payout>, EngineError> {
        principal.require_admin()?;
        self.payouts.list_by_status(status).await
    }

    /// Admin transition: `pending -> approved`. The amount stays reserved.
    pub async fn approve(&self, principal: &Principal, payout_id: i64) -> Result<Payout, EngineError> {
        self.transition(principal, payout_id, PayoutStatus::Pending, PayoutStatus::Approved, None)
            .await
    }

    /// Admin transition: `pending -> rejected`. The amount is released.
    pub async fn reject(&self, principal: &Principal, payout_id: i64) -> Result<Payout, EngineError> {
        self.transition(principal, payout_id, PayoutStatus::Pending, PayoutStatus::Rejected, None)
            .await
    }

    /// Admin transition: `approved -> sent`, recording the transaction hash.
    pub async fn mark_sent(
        &self,
        principal: &Principal,
        payout_id: i64,
        tx_hash: &str,
    ) -> Result<Payout, EngineError> {
        if tx_hash.trim().is_empty() {
            return Err(EngineError::InvalidInput("tx_hash is required".into()));
        }
        self.transition(
            principal,
            payout_id,
            PayoutStatus::Approved,
            PayoutStatus::Sent,
            Some(tx_hash.trim()),
        )
        .await
    }

    async fn transition(
        &self,
        principal: &Principal,
        payout_id: i64,
        from: PayoutStatus,
        to: PayoutStatus,
        tx_hash: Option<&str>,
    ) -> Result<Payout, EngineError> {
        principal.require_admin()?;

        let moved = self.payouts.transition(payout_id, from, to, tx_hash).await?;
        if !moved {
            return Err(EngineError::Conflict(format!(
                "payout {payout_id} is not in state {}",
                from.as_str()
            )));
        }
        let payout = self
            .payouts
            .get(payout_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("payout {payout_id}")))?;

        let mut conn = self.pool.acquire().await?;
        self.audit
            .insert(
                &mut conn,
                "payout_transition",
                Some(payout.challenge_id),
                &serde_json::json!({
                    "payout_id": payout.id,
                    "from": from.as_str(),
                    "to": to.as_str(),
                    "tx_hash": payout.tx_hash,
                }),
            )
            .await?;

        info!("payout {} moved {} -> {}", payout.id, from.as_str(), to.as_str());
        self.push.publish(
            payout.challenge_id,
            &PushEvent::PayoutStatus {
                payout_id: payout.id,
                status: payout.status,
            },
        );
        Ok(payout)
    }
}
