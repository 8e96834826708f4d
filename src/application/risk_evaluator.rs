//! Risk Evaluator
//!
//! Marks every active challenge to market on a fixed cadence and enforces
//! the trading rules. Per tick and per challenge, in strict order: stop
//! losses, take profits, daily-drawdown breach, total-drawdown breach,
//! phase advancement, scaling, then one balance update on the push channel.
//!
//! Price reads happen before the challenge writer lock is acquired, and all
//! push publishing happens after it is released. When both TP and SL are
//! gapped through in one tick, the stop loss wins (conservative fill).

use chrono::{Datelike, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, Semaphore};
use tracing::{debug, error, info, warn};

use crate::application::locks::ChallengeLocks;
use crate::application::price_feed::{PriceFeed, Quote};
use crate::application::push::{BalanceUpdate, PositionBrief, PushEvent, PushHub};
use crate::application::trade_service::TradeService;
use crate::config::Settings;
use crate::domain::entities::challenge::{Challenge, ChallengeType, FailReason};
use crate::domain::entities::position::{CloseReason, Position};
use crate::domain::entities::user::UserRole;
use crate::domain::errors::EngineError;
use crate::domain::services::phase::{self, PhaseEvent};
use crate::domain::services::pnl;
use crate::persistence::repository::{
    AuditRepository, ChallengeRepository, ChallengeTypeRepository, DailyCounterRepository,
    PositionRepository, SnapshotRepository, UserRepository,
};
use crate::persistence::DbPool;

const FAIL_PERSIST_ATTEMPTS: u32 = 10;
const WARNING_THRESHOLD: f64 = 0.8;
const SNAPSHOT_EVERY_S: i64 = 60;

pub struct RiskEvaluator {
    pool: DbPool,
    challenges: ChallengeRepository,
    types: ChallengeTypeRepository,
    positions: PositionRepository,
    counters: DailyCounterRepository,
    audit: AuditRepository,
    snapshots: SnapshotRepository,
    users: UserRepository,
    trades: Arc<TradeService>,
    locks: Arc<ChallengeLocks>,
    feed: Arc<PriceFeed>,
    push: Arc<PushHub>,
    semaphore: Arc<Semaphore>,
    tick: Duration,
    warned: Mutex<HashSet<(i64, &'static str, String)>>,
}

impl RiskEvaluator {
    pub fn new(
        pool: DbPool,
        settings: &Settings,
        trades: Arc<TradeService>,
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
            snapshots: SnapshotRepository::new(pool.clone()),
            users: UserRepository::new(pool.clone()),
            pool,
            trades,
            locks,
            feed,
            push,
            semaphore: Arc::new(Semaphore::new(settings.max_eval_concurrency.max(1))),
            tick: settings.eval_tick(),
            warned: Mutex::new(HashSet::new()),
        }
    }

    /// Coordinator loop. Tasks for distinct challenges run in parallel up to
    /// the concurrency bound; one slow challenge cannot block the others.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!("risk evaluator started, tick {:?}", self.tick);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => break,
            }
            if let Err(e) = self.clone().tick_all().await {
                warn!("evaluator sweep failed: {e}");
            }
        }
        info!("risk evaluator stopped");
    }

    /// One full sweep over every active challenge.
    pub async fn tick_all(self: Arc<Self>) -> Result<(), EngineError> {
        let ids = self.challenges.active_ids().await?;
        if ids.is_empty() {
            return Ok(());
        }
        // One consistent snapshot per sweep, read before any lock.
        let marks = Arc::new(self.feed.snapshot().await);

        let mut handles = Vec::with_capacity(ids.len());
        for id in ids {
            let evaluator = self.clone();
            let marks = marks.clone();
            let permit = self.semaphore.clone().acquire_owned().await.map_err(|_| {
                EngineError::Internal("evaluator semaphore closed".into())
            })?;
            handles.push(tokio::spawn(async move {
                let _permit = permit;
                if let Err(e) = evaluator.tick_challenge(id, &marks).await {
                    warn!("tick failed for challenge {id}: {e}");
                }
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }
        Ok(())
    }

    /// Evaluate one challenge. Callable directly (the coordinator does) and
    /// from tests.
    pub async fn tick_challenge(
        &self,
        challenge_id: i64,
        marks: &HashMap<String, Quote>,
    ) -> Result<(), EngineError> {
        let _guard = self.locks.acquire(challenge_id).await;

        let Some(mut challenge) = self.challenges.get(challenge_id).await? else {
            return Ok(());
        };
        if challenge.status.is_terminal() || challenge.is_quarantined() {
            return Ok(());
        }
        let ct = self
            .types
            .get(challenge.type_id)
            .await?
            .ok_or_else(|| EngineError::Internal("catalog row missing".into()))?;

        self.roll_anchors_if_needed(&mut challenge, marks).await?;

        // Protective closes first: SL before TP, per position.
        let open = self.positions.list_open(challenge_id).await?;
        let stale_after_ms = self.feed.stale_after().as_millis() as u64;
        let mut trigger_closes: Vec<Position> = Vec::new();
        for position in &open {
            let Some(quote) = marks.get(&position.symbol) else {
                continue;
            };
            if quote.staleness_ms > stale_after_ms {
                // Stale symbol: no triggers this tick, equity still marks at
                // the last known price.
                debug!(
                    "challenge {} position {}: {} stale, triggers skipped",
                    challenge_id, position.id, position.symbol
                );
                continue;
            }
            let (price, reason) = if position.hit_stop_loss(quote.price) {
                (position.stop_loss.unwrap_or(quote.price), CloseReason::StopLoss)
            } else if position.hit_take_profit(quote.price) {
                (position.take_profit.unwrap_or(quote.price), CloseReason::TakeProfit)
            } else {
                continue;
            };
            match self
                .trades
                .close_under_lock(challenge_id, position.id, price, reason)
                .await
            {
                Ok(closed) => trigger_closes.push(closed),
                Err(EngineError::Conflict(_)) => {}
                Err(e) => return Err(e),
            }
        }

        // Re-read state after protective closes.
        let Some(mut challenge) = self.challenges.get(challenge_id).await? else {
            return Ok(());
        };
        let open = self.positions.list_open(challenge_id).await?;
        let equity = pnl::equity(challenge.current_balance, &open, |s| {
            marks.get(s).map(|q| q.price)
        });

        if equity > challenge.peak_equity {
            challenge.peak_equity = equity;
        }

        let daily_dd = pnl::daily_drawdown_pct(challenge.daily_anchor_equity, equity);
        let total_dd = pnl::total_drawdown_pct(
            ct.drawdown_type,
            challenge.initial_balance,
            challenge.peak_equity,
            equity,
        );
        let today = Utc::now().format("%Y-%m-%d").to_string();
        self.counters
            .update_worst_drop(challenge_id, &today, daily_dd)
            .await?;

        let mut events: Vec<PushEvent> = trigger_closes
            .iter()
            .map(|p| close_event(p))
            .collect();

        // Daily breach takes precedence over trailing when both cross.
        let breach = if daily_dd >= ct.max_daily_loss_pct {
            Some(FailReason::DailyDrawdown)
        } else if total_dd >= ct.max_total_loss_pct {
            Some(FailReason::TrailingDrawdown)
        } else {
            None
        };

        if let Some(reason) = breach {
            let from = challenge.status;
            let closed = self
                .fail_challenge(&mut challenge, reason, &open, marks)
                .await?;
            events.extend(closed.iter().map(close_event));
            events.push(PushEvent::PhaseTransition {
                from,
                to: challenge.status,
            });
            drop(_guard);
            self.publish_all(challenge_id, events);
            return Ok(());
        }

        self.maybe_warn(&challenge, &ct, daily_dd, total_dd, &today, &mut events)
            .await;

        // Phase advancement, then the scaling rule for funded accounts.
        let any_stale = open.iter().any(|p| {
            marks
                .get(&p.symbol)
                .map(|q| q.staleness_ms > stale_after_ms)
                .unwrap_or(true)
        });
        let from = challenge.status;
        let advancement = phase::evaluate_advancement(&challenge, &ct, equity, open.len(), any_stale)
            .or_else(|| phase::evaluate_scaling(&challenge));

        let mut tx = self.pool.begin().await?;
        if let Some(event) = &advancement {
            phase::apply_event(&mut challenge, event, Utc::now());
            self.audit
                .insert(
                    &mut *tx,
                    transition_audit_type(event),
                    Some(challenge_id),
                    &serde_json::json!({
                        "from": from.as_str(),
                        "to": challenge.status.as_str(),
                        "scaling_step": challenge.scaling_step,
                        "initial_balance": challenge.initial_balance,
                    }),
                )
                .await?;
        }
        self.challenges.update_state(&mut *tx, &challenge).await?;
        tx.commit().await?;

        match &advancement {
            Some(PhaseEvent::AdvanceToFunded) => {
                // Promote the owner's role alongside the account.
                if let Some(user) = self.users.get(challenge.user_id).await? {
                    if user.role == UserRole::Trader {
                        self.users
                            .set_role(user.id, UserRole::FundedTrader)
                            .await?;
                    }
                }
                events.push(PushEvent::PhaseTransition {
                    from,
                    to: challenge.status,
                });
            }
            Some(PhaseEvent::AdvanceToPhase2) => {
                events.push(PushEvent::PhaseTransition {
                    from,
                    to: challenge.status,
                });
            }
            Some(PhaseEvent::Scale { new_size }) => {
                info!(
                    "challenge {} scaled to {} (step {})",
                    challenge_id, new_size, challenge.scaling_step
                );
            }
            _ => {}
        }

        self.record_snapshot(&challenge, equity).await?;

        let briefs: Vec<PositionBrief> = open
            .iter()
            .map(|p| PositionBrief::from_position(p, marks.get(&p.symbol).map(|q| q.price)))
            .collect();
        events.push(PushEvent::BalanceUpdate(BalanceUpdate {
            equity,
            balance: challenge.current_balance,
            unrealized_pnl: pnl::round_cents(equity - challenge.current_balance),
            daily_drawdown_pct: daily_dd,
            total_drawdown_pct: total_dd,
            phase: challenge.status,
            positions: briefs,
            timestamp: Utc::now(),
        }));

        drop(_guard);
        self.publish_all(challenge_id, events);
        Ok(())
    }

    /// Reset the daily anchor at the UTC day boundary and the month anchor
    /// at the month boundary. The anchor takes the equity as of the first
    /// tick of the new day, not a re-high-watermarked value.
    async fn roll_anchors_if_needed(
        &self,
        challenge: &mut Challenge,
        marks: &HashMap<String, Quote>,
    ) -> Result<(), EngineError> {
        let now = Utc::now();
        let mut dirty = false;

        if now.date_naive() > challenge.daily_anchor_at.date_naive() {
            let open = self.positions.list_open(challenge.id).await?;
            let equity = pnl::equity(challenge.current_balance, &open, |s| {
                marks.get(s).map(|q| q.price)
            });
            challenge.daily_anchor_equity = equity;
            challenge.daily_anchor_at = now;
            challenge.daily_pnl_realized = 0.0;
            dirty = true;
            debug!("challenge {}: daily anchor rolled to {}", challenge.id, equity);
        }

        if (now.year(), now.month())
            != (challenge.month_anchor_at.year(), challenge.month_anchor_at.month())
        {
            challenge.month_anchor_balance = challenge.current_balance;
            challenge.month_anchor_at = now;
            dirty = true;
        }

        if dirty {
            let mut conn = self.pool.acquire().await?;
            self.challenges.update_state(&mut conn, challenge).await?;
        }
        Ok(())
    }

    /// Force-close everything at the current mark and fail the challenge.
    /// Persistence failures retry with backoff; a challenge that cannot be
    /// flattened is quarantined and escalated.
    async fn fail_challenge(
        &self,
        challenge: &mut Challenge,
        reason: FailReason,
        open: &[Position],
        marks: &HashMap<String, Quote>,
    ) -> Result<Vec<Position>, EngineError> {
        let close_reason = match reason {
            FailReason::DailyDrawdown => CloseReason::DailyDrawdown,
            FailReason::TrailingDrawdown => CloseReason::TrailingDrawdown,
            FailReason::Admin => CloseReason::Admin,
        };

        let mut closed = Vec::new();
        let mut attempt = 0u32;
        for position in open {
            // Positions with no usable mark flatten at entry (zero PnL)
            // rather than blocking the breach.
            let price = marks
                .get(&position.symbol)
                .map(|q| q.price)
                .unwrap_or(position.entry_price);
            loop {
                match self
                    .trades
                    .close_under_lock(challenge.id, position.id, price, close_reason)
                    .await
                {
                    Ok(p) => {
                        closed.push(p);
                        break;
                    }
                    Err(EngineError::Conflict(_)) => break,
                    Err(e) => {
                        attempt += 1;
                        if attempt >= FAIL_PERSIST_ATTEMPTS {
                            error!(
                                "challenge {}: force-close failed {} times, quarantining: {e}",
                                challenge.id, attempt
                            );
                            return self.quarantine(challenge).await.map(|_| closed);
                        }
                        tokio::time::sleep(Duration::from_millis(50 * attempt as u64)).await;
                    }
                }
            }
        }

        // The challenge row itself: reload (closes touched balances), mark
        // failed, persist with the audit record in one transaction.
        let mut fresh = self
            .challenges
            .get(challenge.id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("challenge {}", challenge.id)))?;
        phase::apply_event(&mut fresh, &PhaseEvent::Fail { reason }, Utc::now());

        let mut attempt = 0u32;
        loop {
            let result: Result<(), EngineError> = async {
                let mut tx = self.pool.begin().await?;
                self.challenges.update_state(&mut *tx, &fresh).await?;
                self.audit
                    .insert(
                        &mut *tx,
                        "challenge_failed",
                        Some(fresh.id),
                        &serde_json::json!({
                            "reason": reason.as_str(),
                            "closed_positions": closed.len(),
                        }),
                    )
                    .await?;
                tx.commit().await?;
                Ok(())
            }
            .await;
            match result {
                Ok(()) => break,
                Err(e) => {
                    attempt += 1;
                    if attempt >= FAIL_PERSIST_ATTEMPTS {
                        error!(
                            "challenge {}: failure persist failed {} times, quarantining: {e}",
                            fresh.id, attempt
                        );
                        return self.quarantine(challenge).await.map(|_| closed);
                    }
                    tokio::time::sleep(Duration::from_millis(50 * attempt as u64)).await;
                }
            }
        }

        warn!(
            "challenge {} FAILED: {} (daily anchor {}, peak {})",
            fresh.id,
            reason.as_str(),
            fresh.daily_anchor_equity,
            fresh.peak_equity
        );
        *challenge = fresh;
        Ok(closed)
    }

    /// Quarantine: no new trades until an operator resolves the stuck state.
    async fn quarantine(&self, challenge: &mut Challenge) -> Result<(), EngineError> {
        challenge.quarantined_at = Some(Utc::now());
        let mut conn = self.pool.acquire().await?;
        self.challenges.update_state(&mut conn, challenge).await?;
        error!(
            "challenge {} quarantined, operator attention required",
            challenge.id
        );
        Ok(())
    }

    async fn maybe_warn(
        &self,
        challenge: &Challenge,
        ct: &ChallengeType,
        daily_dd: f64,
        total_dd: f64,
        today: &str,
        events: &mut Vec<PushEvent>,
    ) {
        let mut warned = self.warned.lock().await;
        if daily_dd >= ct.max_daily_loss_pct * WARNING_THRESHOLD
            && daily_dd < ct.max_daily_loss_pct
            && warned.insert((challenge.id, "daily", today.to_string()))
        {
            events.push(PushEvent::RiskWarning {
                kind: "daily_drawdown".into(),
                value_pct: daily_dd,
                limit_pct: ct.max_daily_loss_pct,
            });
        }
        if total_dd >= ct.max_total_loss_pct * WARNING_THRESHOLD
            && total_dd < ct.max_total_loss_pct
            && warned.insert((challenge.id, "total", today.to_string()))
        {
            events.push(PushEvent::RiskWarning {
                kind: "total_drawdown".into(),
                value_pct: total_dd,
                limit_pct: ct.max_total_loss_pct,
            });
        }
    }

    /// Equity snapshots back the equity-curve endpoint; throttled so the
    /// table grows by at most one row a minute per challenge.
    async fn record_snapshot(
        &self,
        challenge: &Challenge,
        equity: f64,
    ) -> Result<(), EngineError> {
        let now = Utc::now();
        let due = match self.snapshots.last_recorded_at(challenge.id).await? {
            Some(last) => (now - last).num_seconds() >= SNAPSHOT_EVERY_S,
            None => true,
        };
        if due {
            self.snapshots
                .insert(challenge.id, equity, challenge.current_balance, now)
                .await?;
        }
        Ok(())
    }

    fn publish_all(&self, challenge_id: i64, events: Vec<PushEvent>) {
        for event in events {
            self.push.publish(challenge_id, &event);
        }
    }
}

fn close_event(position: &Position) -> PushEvent {
    PushEvent::PositionClosed {
        position: PositionBrief::from_position(position, position.close_price),
        reason: position
            .close_reason
            .map(|r| r.as_str().to_string())
            .unwrap_or_default(),
        realized_pnl: position.realized_pnl.unwrap_or(0.0),
    }
}

fn transition_audit_type(event: &PhaseEvent) -> &'static str {
    match event {
        PhaseEvent::AdvanceToPhase2 => "phase_transition",
        PhaseEvent::AdvanceToFunded => "funded_promotion",
        PhaseEvent::Scale { .. } => "scaling_step",
        PhaseEvent::Fail { .. } => "challenge_failed",
    }
}
