//! Trade Ledger
//!
//! Authoritative record of positions per challenge. All mutations serialize
//! through the challenge's writer lock; preconditions are re-checked under
//! the lock against freshly loaded state. Push events are published only
//! after the lock is released.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{info, warn};

use crate::application::locks::ChallengeLocks;
use crate::application::price_feed::{entry_price, PriceFeed};
use crate::application::push::{PositionBrief, PushEvent, PushHub};
use crate::auth::Principal;
use crate::domain::entities::challenge::Challenge;
use crate::domain::entities::position::{CloseReason, Position, PositionSide};
use crate::domain::errors::EngineError;
use crate::domain::services::{margin, pnl};
use crate::domain::value_objects::quantity::Quantity;
use crate::persistence::repository::{
    AuditRepository, ChallengeRepository, ChallengeTypeRepository, DailyCounterRepository,
    HistoryFilter, NewPosition, PositionRepository,
};
use crate::persistence::DbPool;

fn utc_day(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d").to_string()
}

#[derive(Debug, Clone)]
pub struct OpenOrder {
    pub symbol: String,
    pub side: PositionSide,
    pub qty: f64,
    pub leverage: u32,
    pub take_profit: Option<f64>,
    pub stop_loss: Option<f64>,
}

pub struct TradeService {
    pool: DbPool,
    challenges: ChallengeRepository,
    types: ChallengeTypeRepository,
    positions: PositionRepository,
    counters: DailyCounterRepository,
    audit: AuditRepository,
    locks: Arc<ChallengeLocks>,
    feed: Arc<PriceFeed>,
    push: Arc<PushHub>,
}

impl TradeService {
    pub fn new(
        pool: DbPool,
        locks: Arc<ChallengeLocks>,
        feed: Arc<PriceFeed>,
        push: Arc<PushHub>,
    ) -> Self {
        Self {
            challenges: ChallengeRepository::new(pool.clone()),
            types: ChallengeTypeRepository::new(pool.clone()),
            positions: PositionRepository::new(pool.clone()),
            counters: DailyCounterRepository::new(pool.clone()),
            audit: AuditRepository::new(pool.clone()),
            pool,
            locks,
            feed,
            push,
        }
    }

    async fn owned_challenge(
        &self,
        principal: &Principal,
        challenge_id: i64,
    ) -> Result<Challenge, EngineError> {
        let challenge = if principal.role.is_admin() {
            self.challenges.get(challenge_id).await?
        } else {
            self.challenges.get_owned(challenge_id, principal.user_id).await?
        };
        challenge.ok_or_else(|| EngineError::NotFound(format!("challenge {challenge_id}")))
    }

    /// Open a position against the latest mark price.
    pub async fn open_position(
        &self,
        principal: &Principal,
        challenge_id: i64,
        order: OpenOrder,
    ) -> Result<Position, EngineError> {
        let qty = Quantity::new(order.qty)?.value();
        self.owned_challenge(principal, challenge_id).await?;

        // Price reads happen before the writer lock; the entry price is
        // fixed from the reading that passed the staleness check.
        let entry = entry_price(&self.feed, &order.symbol).await?;

        let _guard = self.locks.acquire(challenge_id).await;
        let mut challenge = self
            .challenges
            .get(challenge_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("challenge {challenge_id}")))?;

        if challenge.is_quarantined() {
            return Err(EngineError::Conflict(
                "challenge is quarantined pending operator review".into(),
            ));
        }
        if !challenge.status.is_active() {
            return Err(EngineError::ChallengeTerminal(challenge_id));
        }

        let ct = self
            .types
            .get(challenge.type_id)
            .await?
            .ok_or_else(|| EngineError::Internal("catalog row missing".into()))?;
        margin::validate_leverage(order.leverage, ct.max_leverage)?;
        margin::validate_tp_sl(order.side, entry, order.take_profit, order.stop_loss)?;

        let margin_used = margin::margin_required(qty, entry, order.leverage);
        let open_positions = self.positions.list_open(challenge_id).await?;
        let free = margin::free_margin(challenge.current_balance, &open_positions);
        if free < margin_used {
            return Err(EngineError::InsufficientMargin {
                required: margin_used,
                free,
            });
        }

        let marks = self.feed.snapshot().await;
        let worst_open_unrealized: f64 = open_positions
            .iter()
            .filter_map(|p| marks.get(&p.symbol).map(|q| p.unrealized_pnl(q.price)))
            .filter(|pnl| *pnl < 0.0)
            .sum();
        let projected =
            margin::projected_worst_case_loss(qty, entry, order.stop_loss, margin_used);
        margin::check_daily_loss_headroom(
            projected,
            challenge.daily_pnl_realized,
            worst_open_unrealized,
            challenge.daily_anchor_equity,
            ct.max_daily_loss_pct,
        )?;

        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        let position = self
            .positions
            .insert(
                &mut *tx,
                NewPosition {
                    challenge_id,
                    symbol: &order.symbol,
                    side: order.side,
                    qty,
                    leverage: order.leverage,
                    entry_price: entry,
                    take_profit: order.take_profit,
                    stop_loss: order.stop_loss,
                    margin_used,
                },
                now,
            )
            .await?;
        let new_day = self
            .counters
            .record_trade_opened(&mut *tx, challenge_id, &utc_day(now))
            .await?;
        if new_day {
            challenge.trading_days_count += 1;
        }
        self.challenges.update_state(&mut *tx, &challenge).await?;
        self.audit
            .insert(
                &mut *tx,
                "position_opened",
                Some(challenge_id),
                &serde_json::json!({
                    "position_id": position.id,
                    "symbol": position.symbol,
                    "side": position.side.as_str(),
                    "qty": position.qty,
                    "entry_price": position.entry_price,
                }),
            )
            .await?;
        tx.commit().await?;
        drop(_guard);

        info!(
            "challenge {} opened {} {} {} @ {}",
            challenge_id,
            position.side.as_str(),
            position.qty,
            position.symbol,
            position.entry_price
        );
        self.push.publish(
            challenge_id,
            &PushEvent::PositionOpened {
                position: PositionBrief::from_position(&position, Some(entry)),
            },
        );
        Ok(position)
    }

    /// Manually close one position at the current (fresh) mark.
    pub async fn close_position(
        &self,
        principal: &Principal,
        position_id: i64,
    ) -> Result<Position, EngineError> {
        let position = self
            .positions
            .get(position_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("position {position_id}")))?;
        self.owned_challenge(principal, position.challenge_id).await?;

        let close_price = self
            .feed
            .latest_fresh(&position.symbol)
            .await
            .ok_or_else(|| EngineError::PriceUnavailable(position.symbol.clone()))?;

        let reason = if principal.role.is_admin() {
            CloseReason::Admin
        } else {
            CloseReason::Manual
        };

        let _guard = self.locks.acquire(position.challenge_id).await;
        let closed = self
            .close_under_lock(position.challenge_id, position_id, close_price, reason)
            .await?;
        drop(_guard);

        self.publish_close(&closed).await;
        Ok(closed)
    }

    /// Manually force-close every open position of a challenge. Positions
    /// whose price is stale are skipped and reported back.
    pub async fn close_all(
        &self,
        principal: &Principal,
        challenge_id: i64,
    ) -> Result<(Vec<Position>, Vec<i64>), EngineError> {
        self.owned_challenge(principal, challenge_id).await?;
        let reason = if principal.role.is_admin() {
            CloseReason::Admin
        } else {
            CloseReason::Manual
        };

        let _guard = self.locks.acquire(challenge_id).await;
        let open = self.positions.list_open(challenge_id).await?;

        let mut closed = Vec::new();
        let mut skipped = Vec::new();
        for position in open {
            match self.feed.latest_fresh(&position.symbol).await {
                Some(price) => {
                    let done = self
                        .close_under_lock(challenge_id, position.id, price, reason)
                        .await?;
                    closed.push(done);
                }
                None => {
                    warn!(
                        "skipping close of position {}: {} price unavailable",
                        position.id, position.symbol
                    );
                    skipped.push(position.id);
                }
            }
        }
        drop(_guard);

        for position in &closed {
            self.publish_close(position).await;
        }
        Ok((closed, skipped))
    }

    /// Core close path shared by manual closes and the risk evaluator's
    /// protective closes. Caller must hold the challenge writer lock.
    pub async fn close_under_lock(
        &self,
        challenge_id: i64,
        position_id: i64,
        close_price: f64,
        reason: CloseReason,
    ) -> Result<Position, EngineError> {
        let mut challenge = self
            .challenges
            .get(challenge_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("challenge {challenge_id}")))?;
        if challenge.status.is_terminal() && reason == CloseReason::Manual {
            return Err(EngineError::ChallengeTerminal(challenge_id));
        }

        let position = self
            .positions
            .get(position_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("position {position_id}")))?;
        if !position.is_open() {
            return Err(EngineError::Conflict(format!(
                "position {position_id} is already closed"
            )));
        }

        let realized = pnl::trade_pnl(position.side, position.entry_price, close_price, position.qty);
        let now = Utc::now();

        let mut tx = self.pool.begin().await?;
        let closed_now = self
            .positions
            .close(&mut *tx, position_id, close_price, reason, realized, now)
            .await?;
        if !closed_now {
            return Err(EngineError::Conflict(format!(
                "position {position_id} is already closed"
            )));
        }

        challenge.current_balance = pnl::round_cents(challenge.current_balance + realized);
        challenge.daily_pnl_realized = pnl::round_cents(challenge.daily_pnl_realized + realized);
        challenge.total_pnl_realized = pnl::round_cents(challenge.total_pnl_realized + realized);

        let new_day = self
            .counters
            .record_trade_closed(&mut *tx, challenge_id, &utc_day(now), realized)
            .await?;
        if new_day {
            challenge.trading_days_count += 1;
        }
        self.challenges.update_state(&mut *tx, &challenge).await?;
        self.audit
            .insert(
                &mut *tx,
                "position_closed",
                Some(challenge_id),
                &serde_json::json!({
                    "position_id": position_id,
                    "close_price": close_price,
                    "reason": reason.as_str(),
                    "realized_pnl": realized,
                }),
            )
            .await?;
        tx.commit().await?;

        let mut closed = position;
        closed.closed_at = Some(now);
        closed.close_price = Some(close_price);
        closed.close_reason = Some(reason);
        closed.realized_pnl = Some(realized);
        Ok(closed)
    }

    /// `position_closed` always precedes the balance update reflecting its
    /// realized PnL.
    async fn publish_close(&self, position: &Position) {
        let challenge_id = position.challenge_id;
        self.push.publish(
            challenge_id,
            &PushEvent::PositionClosed {
                position: PositionBrief::from_position(position, position.close_price),
                reason: position
                    .close_reason
                    .map(|r| r.as_str().to_string())
                    .unwrap_or_default(),
                realized_pnl: position.realized_pnl.unwrap_or(0.0),
            },
        );

        let state = async {
            let challenge = self.challenges.get(challenge_id).await?;
            let open = self.positions.list_open(challenge_id).await?;
            let ct = match &challenge {
                Some(c) => self.types.get(c.type_id).await?,
                None => None,
            };
            Ok::<_, EngineError>(challenge.zip(ct).map(|pair| (pair, open)))
        }
        .await;

        if let Ok(Some(((challenge, ct), open))) = state {
            let marks = self.feed.snapshot().await;
            let equity = pnl::equity(challenge.current_balance, &open, |s| {
                marks.get(s).map(|q| q.price)
            });
            let briefs: Vec<PositionBrief> = open
                .iter()
                .map(|p| PositionBrief::from_position(p, marks.get(&p.symbol).map(|q| q.price)))
                .collect();
            self.push.publish(
                challenge_id,
                &PushEvent::BalanceUpdate(crate::application::push::BalanceUpdate {
                    equity,
                    balance: challenge.current_balance,
                    unrealized_pnl: pnl::round_cents(equity - challenge.current_balance),
                    daily_drawdown_pct: pnl::daily_drawdown_pct(
                        challenge.daily_anchor_equity,
                        equity,
                    ),
                    total_drawdown_pct: pnl::total_drawdown_pct(
                        ct.drawdown_type,
                        challenge.initial_balance,
                        challenge.peak_equity,
                        equity,
                    ),
                    phase: challenge.status,
                    positions: briefs,
                    timestamp: Utc::now(),
                }),
            );
        }
    }

    pub async fn list_open(
        &self,
        principal: &Principal,
        challenge_id: i64,
    ) -> Result<Vec<Position>, EngineError> {
        self.owned_challenge(principal, challenge_id).await?;
        self.positions.list_open(challenge_id).await
    }

    pub async fn history(
        &self,
        principal: &Principal,
        challenge_id: i64,
        filter: HistoryFilter,
    ) -> Result<Vec<Position>, EngineError> {
        self.owned_challenge(principal, challenge_id).await?;
        self.positions.history(challenge_id, &filter).await
    }
}
