//! Data access layer: one repository per aggregate.
//!
//! Methods that must participate in a multi-row transaction take a
//! `&mut SqliteConnection`; the rest run on the pool directly.

use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;

use super::models::*;
use super::DbPool;
use crate::domain::entities::challenge::{Challenge, ChallengeStatus, ChallengeType};
use crate::domain::entities::payout::{Payout, PayoutNetwork, PayoutStatus};
use crate::domain::entities::position::{CloseReason, Position, PositionSide};
use crate::domain::entities::user::{User, UserRole};
use crate::domain::errors::EngineError;

// ─── Users ───────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct UserRepository {
    pool: DbPool,
}

impl UserRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, id: i64) -> Result<Option<User>, EngineError> {
        let record = sqlx::query_as::<_, UserRecord>("SELECT * FROM users WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        record.map(User::try_from).transpose()
    }

    pub async fn find_by_external_id(&self, external_id: i64) -> Result<Option<User>, EngineError> {
        let record =
            sqlx::query_as::<_, UserRecord>("SELECT * FROM users WHERE external_id = ?1")
                .bind(external_id)
                .fetch_optional(&self.pool)
                .await?;
        record.map(User::try_from).transpose()
    }

    pub async fn create(
        &self,
        external_id: i64,
        display_name: &str,
        referral_code: Option<&str>,
    ) -> Result<User, EngineError> {
        let record = sqlx::query_as::<_, UserRecord>(
            r#"
            INSERT INTO users (external_id, display_name, role, is_blocked, referral_code, created_at)
            VALUES (?1, ?2, 'trader', 0, ?3, ?4)
            RETURNING *
            "#,
        )
        .bind(external_id)
        .bind(display_name)
        .bind(referral_code)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;
        User::try_from(record)
    }

    pub async fn set_role(&self, id: i64, role: UserRole) -> Result<(), EngineError> {
        sqlx::query("UPDATE users SET role = ?1 WHERE id = ?2")
            .bind(role.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_blocked(&self, id: i64, blocked: bool) -> Result<(), EngineError> {
        sqlx::query("UPDATE users SET is_blocked = ?1 WHERE id = ?2")
            .bind(blocked)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn list(&self, limit: i64) -> Result<Vec<User>, EngineError> {
        let records =
            sqlx::query_as::<_, UserRecord>("SELECT * FROM users ORDER BY id LIMIT ?1")
                .bind(limit)
                .fetch_all(&self.pool)
                .await?;
        records.into_iter().map(User::try_from).collect()
    }
}

// ─── Challenge catalog ───────────────────────────────────────────────────────

#[derive(Clone)]
pub struct ChallengeTypeRepository {
    pool: DbPool,
}

impl ChallengeTypeRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, id: i64) -> Result<Option<ChallengeType>, EngineError> {
        let record =
            sqlx::query_as::<_, ChallengeTypeRecord>("SELECT * FROM challenge_types WHERE id = ?1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        record.map(ChallengeType::try_from).transpose()
    }

    pub async fn list_active(&self) -> Result<Vec<ChallengeType>, EngineError> {
        let records = sqlx::query_as::<_, ChallengeTypeRecord>(
            "SELECT * FROM challenge_types WHERE is_active = 1 ORDER BY account_size",
        )
        .fetch_all(&self.pool)
        .await?;
        records.into_iter().map(ChallengeType::try_from).collect()
    }
}

// ─── Challenges ──────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct ChallengeRepository {
    pool: DbPool,
}

impl ChallengeRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Create a fresh challenge in phase1 for a purchased plan. The partial
    /// unique index turns a second active challenge into a conflict.
    pub async fn create(&self, user_id: i64, ct: &ChallengeType) -> Result<Challenge, EngineError> {
        let (prior,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM challenges WHERE user_id = ?1 AND type_id = ?2",
        )
        .bind(user_id)
        .bind(ct.id)
        .fetch_one(&self.pool)
        .await?;

        let now = Utc::now();
        let result = sqlx::query_as::<_, ChallengeRecord>(
            r#"
            INSERT INTO challenges (
                user_id, type_id, status, account_mode, initial_balance, current_balance,
                peak_equity, daily_anchor_equity, daily_anchor_at, daily_pnl_realized,
                total_pnl_realized, trading_days_count, scaling_step, attempt_number,
                month_anchor_balance, month_anchor_at, started_at
            )
            VALUES (?1, ?2, 'phase1', 'demo', ?3, ?3, ?3, ?3, ?4, 0, 0, 0, 0, ?5, ?3, ?4, ?4)
            RETURNING *
            "#,
        )
        .bind(user_id)
        .bind(ct.id)
        .bind(ct.account_size)
        .bind(now)
        .bind(prior + 1)
        .fetch_one(&self.pool)
        .await;

        match result {
            Ok(record) => Challenge::try_from(record),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => Err(
                EngineError::Conflict("user already has an active challenge".into()),
            ),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get(&self, id: i64) -> Result<Option<Challenge>, EngineError> {
        let record = sqlx::query_as::<_, ChallengeRecord>(
            "SELECT * FROM challenges WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        record.map(Challenge::try_from).transpose()
    }

    pub async fn get_owned(&self, id: i64, user_id: i64) -> Result<Option<Challenge>, EngineError> {
        let record = sqlx::query_as::<_, ChallengeRecord>(
            "SELECT * FROM challenges WHERE id = ?1 AND user_id = ?2",
        )
        .bind(id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        record.map(Challenge::try_from).transpose()
    }

    pub async fn list_by_user(
        &self,
        user_id: i64,
        status: Option<ChallengeStatus>,
    ) -> Result<Vec<Challenge>, EngineError> {
        let records = match status {
            Some(s) => {
                sqlx::query_as::<_, ChallengeRecord>(
                    "SELECT * FROM challenges WHERE user_id = ?1 AND status = ?2 ORDER BY id DESC",
                )
                .bind(user_id)
                .bind(s.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, ChallengeRecord>(
                    "SELECT * FROM challenges WHERE user_id = ?1 ORDER BY id DESC",
                )
                .bind(user_id)
                .fetch_all(&self.pool)
                .await?
            }
        };
        records.into_iter().map(Challenge::try_from).collect()
    }

    /// Ids of every challenge the risk evaluator must visit this tick.
    pub async fn active_ids(&self) -> Result<Vec<i64>, EngineError> {
        let rows: Vec<(i64,)> = sqlx::query_as(
            "SELECT id FROM challenges WHERE status IN ('phase1', 'phase2', 'funded') ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    pub async fn list_all(&self, limit: i64) -> Result<Vec<Challenge>, EngineError> {
        let records = sqlx::query_as::<_, ChallengeRecord>(
            "SELECT * FROM challenges ORDER BY id DESC LIMIT ?1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        records.into_iter().map(Challenge::try_from).collect()
    }

    /// Challenges of unblocked owners joined with their display names, for
    /// the leaderboard aggregator.
    pub async fn list_for_leaderboard(
        &self,
    ) -> Result<Vec<(Challenge, String)>, EngineError> {
        let records = sqlx::query_as::<_, ChallengeRecord>(
            "SELECT c.* FROM challenges c JOIN users u ON u.id = c.user_id \
             WHERE u.is_blocked = 0",
        )
        .fetch_all(&self.pool)
        .await?;

        let name_rows: Vec<(i64, String)> =
            sqlx::query_as("SELECT id, display_name FROM users")
                .fetch_all(&self.pool)
                .await?;
        let names: std::collections::HashMap<i64, String> = name_rows.into_iter().collect();

        records
            .into_iter()
            .map(|r| {
                let name = names.get(&r.user_id).cloned().unwrap_or_default();
                Challenge::try_from(r).map(|c| (c, name))
            })
            .collect()
    }

    /// Persist every mutable column of the challenge row.
    pub async fn update_state(
        &self,
        conn: &mut SqliteConnection,
        c: &Challenge,
    ) -> Result<(), EngineError> {
        sqlx::query(
            r#"
            UPDATE challenges SET
                status = ?1, account_mode = ?2, initial_balance = ?3, current_balance = ?4,
                peak_equity = ?5, daily_anchor_equity = ?6, daily_anchor_at = ?7,
                daily_pnl_realized = ?8, total_pnl_realized = ?9, trading_days_count = ?10,
                scaling_step = ?11, month_anchor_balance = ?12, month_anchor_at = ?13,
                failed_reason = ?14, quarantined_at = ?15, transitioned_at = ?16, failed_at = ?17
            WHERE id = ?18
            "#,
        )
        .bind(c.status.as_str())
        .bind(c.account_mode.as_str())
        .bind(c.initial_balance)
        .bind(c.current_balance)
        .bind(c.peak_equity)
        .bind(c.daily_anchor_equity)
        .bind(c.daily_anchor_at)
        .bind(c.daily_pnl_realized)
        .bind(c.total_pnl_realized)
        .bind(c.trading_days_count as i64)
        .bind(c.scaling_step as i64)
        .bind(c.month_anchor_balance)
        .bind(c.month_anchor_at)
        .bind(c.failed_reason.map(|r| r.as_str()))
        .bind(c.quarantined_at)
        .bind(c.transitioned_at)
        .bind(c.failed_at)
        .bind(c.id)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    pub async fn has_sent_payout(&self, challenge_id: i64) -> Result<bool, EngineError> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM payouts WHERE challenge_id = ?1 AND status = 'sent'",
        )
        .bind(challenge_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }
}

// ─── Positions ───────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct PositionRepository {
    pool: DbPool,
}

pub struct NewPosition<'a> {
    pub challenge_id: i64,
    pub symbol: &'a str,
    pub side: PositionSide,
    pub qty: f64,
    pub leverage: u32,
    pub entry_price: f64,
    pub take_profit: Option<f64>,
    pub stop_loss: Option<f64>,
    pub margin_used: f64,
}

#[derive(Debug, Default, Clone)]
pub struct HistoryFilter {
    pub cursor: Option<i64>,
    pub limit: i64,
    pub side: Option<PositionSide>,
    pub symbol: Option<String>,
}

impl PositionRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn insert(
        &self,
        conn: &mut SqliteConnection,
        new: NewPosition<'_>,
        opened_at: DateTime<Utc>,
    ) -> Result<Position, EngineError> {
        let record = sqlx::query_as::<_, PositionRecord>(
            r#"
            INSERT INTO positions (
                challenge_id, symbol, side, qty, leverage, entry_price,
                take_profit, stop_loss, margin_used, opened_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            RETURNING *
            "#,
        )
        .bind(new.challenge_id)
        .bind(new.symbol)
        .bind(new.side.as_str())
        .bind(new.qty)
        .bind(new.leverage as i64)
        .bind(new.entry_price)
        .bind(new.take_profit)
        .bind(new.stop_loss)
        .bind(new.margin_used)
        .bind(opened_at)
        .fetch_one(&mut *conn)
        .await?;
        Position::try_from(record)
    }

    pub async fn get(&self, id: i64) -> Result<Option<Position>, EngineError> {
        let record = sqlx::query_as::<_, PositionRecord>("SELECT * FROM positions WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        record.map(Position::try_from).transpose()
    }

    pub async fn list_open(&self, challenge_id: i64) -> Result<Vec<Position>, EngineError> {
        let records = sqlx::query_as::<_, PositionRecord>(
            "SELECT * FROM positions WHERE challenge_id = ?1 AND closed_at IS NULL \
             ORDER BY opened_at DESC",
        )
        .bind(challenge_id)
        .fetch_all(&self.pool)
        .await?;
        records.into_iter().map(Position::try_from).collect()
    }

    /// Close an open position. Returns false when the row was already
    /// closed by a concurrent writer — the caller maps that to `Conflict`.
    pub async fn close(
        &self,
        conn: &mut SqliteConnection,
        position_id: i64,
        close_price: f64,
        reason: CloseReason,
        realized_pnl: f64,
        closed_at: DateTime<Utc>,
    ) -> Result<bool, EngineError> {
        let rows = sqlx::query(
            r#"
            UPDATE positions
            SET closed_at = ?1, close_price = ?2, close_reason = ?3, realized_pnl = ?4
            WHERE id = ?5 AND closed_at IS NULL
            "#,
        )
        .bind(closed_at)
        .bind(close_price)
        .bind(reason.as_str())
        .bind(realized_pnl)
        .bind(position_id)
        .execute(&mut *conn)
        .await?
        .rows_affected();
        Ok(rows == 1)
    }

    /// Closed trades, newest first, keyset-paginated by position id.
    pub async fn history(
        &self,
        challenge_id: i64,
        filter: &HistoryFilter,
    ) -> Result<Vec<Position>, EngineError> {
        let records = sqlx::query_as::<_, PositionRecord>(
            "SELECT * FROM positions \
             WHERE challenge_id = ?1 AND closed_at IS NOT NULL AND id < ?2 \
               AND (?3 = '' OR side = ?3) AND (?4 = '' OR symbol = ?4) \
             ORDER BY id DESC LIMIT ?5",
        )
        .bind(challenge_id)
        .bind(filter.cursor.unwrap_or(i64::MAX))
        .bind(filter.side.map(|s| s.as_str()).unwrap_or(""))
        .bind(filter.symbol.as_deref().unwrap_or(""))
        .bind(filter.limit.clamp(1, 200))
        .fetch_all(&self.pool)
        .await?;
        records.into_iter().map(Position::try_from).collect()
    }
}

// ─── Daily counters ──────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct DailyCounterRepository {
    pool: DbPool,
}

impl DailyCounterRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Ensure the counter row for (challenge, day) exists. Returns true when
    /// this call created it — the challenge's first activity of that UTC day.
    async fn ensure_day(
        &self,
        conn: &mut SqliteConnection,
        challenge_id: i64,
        day: &str,
    ) -> Result<bool, EngineError> {
        let rows = sqlx::query(
            "INSERT INTO daily_counters (challenge_id, day) VALUES (?1, ?2) \
             ON CONFLICT(challenge_id, day) DO NOTHING",
        )
        .bind(challenge_id)
        .bind(day)
        .execute(&mut *conn)
        .await?
        .rows_affected();
        Ok(rows == 1)
    }

    pub async fn record_trade_opened(
        &self,
        conn: &mut SqliteConnection,
        challenge_id: i64,
        day: &str,
    ) -> Result<bool, EngineError> {
        let new_day = self.ensure_day(conn, challenge_id, day).await?;
        sqlx::query(
            "UPDATE daily_counters SET trades_opened = trades_opened + 1 \
             WHERE challenge_id = ?1 AND day = ?2",
        )
        .bind(challenge_id)
        .bind(day)
        .execute(&mut *conn)
        .await?;
        Ok(new_day)
    }

    pub async fn record_trade_closed(
        &self,
        conn: &mut SqliteConnection,
        challenge_id: i64,
        day: &str,
        realized_pnl: f64,
    ) -> Result<bool, EngineError> {
        let new_day = self.ensure_day(conn, challenge_id, day).await?;
        sqlx::query(
            "UPDATE daily_counters SET realized_pnl = realized_pnl + ?3 \
             WHERE challenge_id = ?1 AND day = ?2",
        )
        .bind(challenge_id)
        .bind(day)
        .bind(realized_pnl)
        .execute(&mut *conn)
        .await?;
        Ok(new_day)
    }

    pub async fn update_worst_drop(
        &self,
        challenge_id: i64,
        day: &str,
        drop_pct: f64,
    ) -> Result<(), EngineError> {
        let mut conn = self.pool.acquire().await?;
        self.ensure_day(&mut conn, challenge_id, day).await?;
        sqlx::query(
            "UPDATE daily_counters SET worst_equity_drop_pct = MAX(worst_equity_drop_pct, ?3) \
             WHERE challenge_id = ?1 AND day = ?2",
        )
        .bind(challenge_id)
        .bind(day)
        .bind(drop_pct)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    pub async fn get(
        &self,
        challenge_id: i64,
        day: &str,
    ) -> Result<Option<DailyCounterRecord>, EngineError> {
        let record = sqlx::query_as::<_, DailyCounterRecord>(
            "SELECT * FROM daily_counters WHERE challenge_id = ?1 AND day = ?2",
        )
        .bind(challenge_id)
        .bind(day)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }
}

// ─── Payouts ─────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct PayoutRepository {
    pool: DbPool,
}

impl PayoutRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn insert(
        &self,
        challenge_id: i64,
        user_id: i64,
        amount: f64,
        wallet_address: &str,
        network: PayoutNetwork,
    ) -> Result<Payout, EngineError> {
        let record = sqlx::query_as::<_, PayoutRecord>(
            r#"
            INSERT INTO payouts (challenge_id, user_id, amount, wallet_address, network,
                                 status, requested_at)
            VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6)
            RETURNING *
            "#,
        )
        .bind(challenge_id)
        .bind(user_id)
        .bind(amount)
        .bind(wallet_address)
        .bind(network.as_str())
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;
        Payout::try_from(record)
    }

    pub async fn get(&self, id: i64) -> Result<Option<Payout>, EngineError> {
        let record = sqlx::query_as::<_, PayoutRecord>("SELECT * FROM payouts WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        record.map(Payout::try_from).transpose()
    }

    pub async fn list_for_challenge(&self, challenge_id: i64) -> Result<Vec<Payout>, EngineError> {
        let records = sqlx::query_as::<_, PayoutRecord>(
            "SELECT * FROM payouts WHERE challenge_id = ?1 ORDER BY requested_at DESC",
        )
        .bind(challenge_id)
        .fetch_all(&self.pool)
        .await?;
        records.into_iter().map(Payout::try_from).collect()
    }

    pub async fn list_for_user(&self, user_id: i64) -> Result<Vec<Payout>, EngineError> {
        let records = sqlx::query_as::<_, PayoutRecord>(
            "SELECT * FROM payouts WHERE user_id = ?1 ORDER BY requested_at DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        records.into_iter().map(Payout::try_from).collect()
    }

    pub async fn list_by_status(&self, status: PayoutStatus) -> Result<Vec<Payout>, EngineError> {
        let records = sqlx::query_as::<_, PayoutRecord>(
            "SELECT * FROM payouts WHERE status = ?1 ORDER BY requested_at",
        )
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;
        records.into_iter().map(Payout::try_from).collect()
    }

    pub async fn pending_exists(&self, challenge_id: i64) -> Result<bool, EngineError> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM payouts WHERE challenge_id = ?1 AND status = 'pending'",
        )
        .bind(challenge_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }

    /// Total amount committed against the profit share: approved + sent,
    /// plus pending requests which reserve their amount until resolved.
    pub async fn reserved_total(&self, challenge_id: i64) -> Result<f64, EngineError> {
        let (total,): (Option<f64>,) = sqlx::query_as(
            "SELECT SUM(amount) FROM payouts WHERE challenge_id = ?1 \
             AND status IN ('pending', 'approved', 'sent')",
        )
        .bind(challenge_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(total.unwrap_or(0.0))
    }

    /// Guarded status transition. Returns false when the row was not in
    /// `from` — a concurrent admin acted first.
    pub async fn transition(
        &self,
        id: i64,
        from: PayoutStatus,
        to: PayoutStatus,
        tx_hash: Option<&str>,
    ) -> Result<bool, EngineError> {
        let rows = sqlx::query(
            "UPDATE payouts SET status = ?1, tx_hash = COALESCE(?2, tx_hash), \
             processed_at = ?3 WHERE id = ?4 AND status = ?5",
        )
        .bind(to.as_str())
        .bind(tx_hash)
        .bind(Utc::now())
        .bind(id)
        .bind(from.as_str())
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(rows == 1)
    }
}

// ─── Refresh tokens ──────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct TokenRepository {
    pool: DbPool,
}

impl TokenRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn insert(
        &self,
        token: &str,
        user_id: i64,
        expires_at: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        sqlx::query(
            "INSERT INTO refresh_tokens (token, user_id, expires_at, revoked, created_at) \
             VALUES (?1, ?2, ?3, 0, ?4)",
        )
        .bind(token)
        .bind(user_id)
        .bind(expires_at)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Atomically consume a refresh token (rotation): a valid token is
    /// revoked and its user id returned; anything else yields None.
    pub async fn consume(&self, token: &str) -> Result<Option<i64>, EngineError> {
        let row: Option<(i64,)> = sqlx::query_as(
            "UPDATE refresh_tokens SET revoked = 1 \
             WHERE token = ?1 AND revoked = 0 AND expires_at > ?2 \
             RETURNING user_id",
        )
        .bind(token)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(id,)| id))
    }
}

// ─── Audit log ───────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct AuditRepository {
    pool: DbPool,
}

impl AuditRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn insert(
        &self,
        conn: &mut SqliteConnection,
        event_type: &str,
        challenge_id: Option<i64>,
        details: &serde_json::Value,
    ) -> Result<(), EngineError> {
        sqlx::query(
            "INSERT INTO audit_log (event_type, challenge_id, details, created_at) \
             VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(event_type)
        .bind(challenge_id)
        .bind(details.to_string())
        .bind(Utc::now())
        .execute(&mut *conn)
        .await?;
        Ok(())
    }
}

// ─── Equity snapshots ────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct SnapshotRepository {
    pool: DbPool,
}

impl SnapshotRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn insert(
        &self,
        challenge_id: i64,
        equity: f64,
        balance: f64,
        recorded_at: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        sqlx::query(
            "INSERT INTO equity_snapshots (challenge_id, equity, balance, recorded_at) \
             VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(challenge_id)
        .bind(equity)
        .bind(balance)
        .bind(recorded_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn last_recorded_at(
        &self,
        challenge_id: i64,
    ) -> Result<Option<DateTime<Utc>>, EngineError> {
        let row: Option<(DateTime<Utc>,)> = sqlx::query_as(
            "SELECT recorded_at FROM equity_snapshots WHERE challenge_id = ?1 \
             ORDER BY recorded_at DESC LIMIT 1",
        )
        .bind(challenge_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(ts,)| ts))
    }

    pub async fn series(
        &self,
        challenge_id: i64,
        limit: i64,
    ) -> Result<Vec<EquitySnapshotRecord>, EngineError> {
        let records = sqlx::query_as::<_, EquitySnapshotRecord>(
            "SELECT * FROM (SELECT * FROM equity_snapshots WHERE challenge_id = ?1 \
             ORDER BY recorded_at DESC LIMIT ?2) ORDER BY recorded_at",
        )
        .bind(challenge_id)
        .bind(limit.clamp(1, 5_000))
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::init_database;

    async fn setup() -> DbPool {
        init_database("sqlite::memory:").await.unwrap()
    }

    async fn seed_user_and_challenge(pool: &DbPool) -> (User, Challenge) {
        let users = UserRepository::new(pool.clone());
        let types = ChallengeTypeRepository::new(pool.clone());
        let challenges = ChallengeRepository::new(pool.clone());

        let user = users.create(1001, "alice", None).await.unwrap();
        let ct = types.list_active().await.unwrap().remove(0);
        let challenge = challenges.create(user.id, &ct).await.unwrap();
        (user, challenge)
    }

    #[tokio::test]
    async fn user_create_and_lookup() {
        let pool = setup().await;
        let users = UserRepository::new(pool.clone());
        let user = users.create(42, "bob", Some("REF123")).await.unwrap();
        assert_eq!(user.role, UserRole::Trader);

        let found = users.find_by_external_id(42).await.unwrap().unwrap();
        assert_eq!(found.id, user.id);
        assert_eq!(found.referral_code.as_deref(), Some("REF123"));
        assert!(users.find_by_external_id(43).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn second_active_challenge_conflicts() {
        let pool = setup().await;
        let (user, _challenge) = seed_user_and_challenge(&pool).await;
        let types = ChallengeTypeRepository::new(pool.clone());
        let challenges = ChallengeRepository::new(pool.clone());
        let ct = types.list_active().await.unwrap().remove(0);

        let err = challenges.create(user.id, &ct).await.unwrap_err();
        assert!(matches!(err, EngineError::Conflict(_)));
    }

    #[tokio::test]
    async fn attempt_number_increments_after_failure() {
        let pool = setup().await;
        let (user, mut challenge) = seed_user_and_challenge(&pool).await;
        let types = ChallengeTypeRepository::new(pool.clone());
        let challenges = ChallengeRepository::new(pool.clone());

        challenge.status = ChallengeStatus::Failed;
        challenge.failed_at = Some(Utc::now());
        let mut conn = pool.acquire().await.unwrap();
        challenges.update_state(&mut conn, &challenge).await.unwrap();
        drop(conn);

        let ct = types.get(challenge.type_id).await.unwrap().unwrap();
        let next = challenges.create(user.id, &ct).await.unwrap();
        assert_eq!(next.attempt_number, 2);
        assert_eq!(next.initial_balance, ct.account_size);
    }

    #[tokio::test]
    async fn position_close_is_single_shot() {
        let pool = setup().await;
        let (_user, challenge) = seed_user_and_challenge(&pool).await;
        let positions = PositionRepository::new(pool.clone());
        let mut conn = pool.acquire().await.unwrap();

        let p = positions
            .insert(
                &mut conn,
                NewPosition {
                    challenge_id: challenge.id,
                    symbol: "BTCUSDT",
                    side: PositionSide::Long,
                    qty: 0.1,
                    leverage: 10,
                    entry_price: 50_000.0,
                    take_profit: None,
                    stop_loss: None,
                    margin_used: 500.0,
                },
                Utc::now(),
            )
            .await
            .unwrap();

        let first = positions
            .close(&mut conn, p.id, 51_000.0, CloseReason::Manual, 100.0, Utc::now())
            .await
            .unwrap();
        let second = positions
            .close(&mut conn, p.id, 51_000.0, CloseReason::Manual, 100.0, Utc::now())
            .await
            .unwrap();
        assert!(first);
        assert!(!second);

        drop(conn);
        assert!(positions.list_open(challenge.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn history_pagination_and_filters() {
        let pool = setup().await;
        let (_user, challenge) = seed_user_and_challenge(&pool).await;
        let positions = PositionRepository::new(pool.clone());
        let mut conn = pool.acquire().await.unwrap();

        for i in 0..5 {
            let side = if i % 2 == 0 {
                PositionSide::Long
            } else {
                PositionSide::Short
            };
            let p = positions
                .insert(
                    &mut conn,
                    NewPosition {
                        challenge_id: challenge.id,
                        symbol: "ETHUSDT",
                        side,
                        qty: 1.0,
                        leverage: 5,
                        entry_price: 3_000.0,
                        take_profit: None,
                        stop_loss: None,
                        margin_used: 600.0,
                    },
                    Utc::now(),
                )
                .await
                .unwrap();
            positions
                .close(&mut conn, p.id, 3_010.0, CloseReason::Manual, 10.0, Utc::now())
                .await
                .unwrap();
        }

        drop(conn);
        let page = positions
            .history(
                challenge.id,
                &HistoryFilter {
                    cursor: None,
                    limit: 2,
                    side: None,
                    symbol: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(page.len(), 2);

        let next = positions
            .history(
                challenge.id,
                &HistoryFilter {
                    cursor: Some(page[1].id),
                    limit: 10,
                    side: None,
                    symbol: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(next.len(), 3);
        assert!(next.iter().all(|p| p.id < page[1].id));

        let longs = positions
            .history(
                challenge.id,
                &HistoryFilter {
                    cursor: None,
                    limit: 10,
                    side: Some(PositionSide::Long),
                    symbol: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(longs.len(), 3);
    }

    #[tokio::test]
    async fn daily_counter_detects_first_activity() {
        let pool = setup().await;
        let (_user, challenge) = seed_user_and_challenge(&pool).await;
        let counters = DailyCounterRepository::new(pool.clone());
        let mut conn = pool.acquire().await.unwrap();

        let first = counters
            .record_trade_opened(&mut conn, challenge.id, "2026-08-01")
            .await
            .unwrap();
        let second = counters
            .record_trade_closed(&mut conn, challenge.id, "2026-08-01", 25.0)
            .await
            .unwrap();
        let next_day = counters
            .record_trade_closed(&mut conn, challenge.id, "2026-08-02", -10.0)
            .await
            .unwrap();

        assert!(first);
        assert!(!second);
        assert!(next_day);

        drop(conn);
        let day = counters.get(challenge.id, "2026-08-01").await.unwrap().unwrap();
        assert_eq!(day.trades_opened, 1);
        assert_eq!(day.realized_pnl, 25.0);
    }

    #[tokio::test]
    async fn payout_transition_guard() {
        let pool = setup().await;
        let (user, challenge) = seed_user_and_challenge(&pool).await;
        let payouts = PayoutRepository::new(pool.clone());

        let p = payouts
            .insert(challenge.id, user.id, 500.0, "TXYZ1234567890", PayoutNetwork::Trc20)
            .await
            .unwrap();
        assert!(payouts.pending_exists(challenge.id).await.unwrap());
        assert_eq!(payouts.reserved_total(challenge.id).await.unwrap(), 500.0);

        assert!(payouts
            .transition(p.id, PayoutStatus::Pending, PayoutStatus::Approved, None)
            .await
            .unwrap());
        // Already approved: the pending->rejected transition misses.
        assert!(!payouts
            .transition(p.id, PayoutStatus::Pending, PayoutStatus::Rejected, None)
            .await
            .unwrap());
        assert!(payouts
            .transition(p.id, PayoutStatus::Approved, PayoutStatus::Sent, Some("0xabc"))
            .await
            .unwrap());

        let done = payouts.get(p.id).await.unwrap().unwrap();
        assert_eq!(done.status, PayoutStatus::Sent);
        assert_eq!(done.tx_hash.as_deref(), Some("0xabc"));
    }

    #[tokio::test]
    async fn refresh_token_single_use() {
        let pool = setup().await;
        let (user, _) = seed_user_and_challenge(&pool).await;
        let tokens = TokenRepository::new(pool.clone());

        tokens
            .insert("tok_1", user.id, Utc::now() + chrono::Duration::days(30))
            .await
            .unwrap();
        assert_eq!(tokens.consume("tok_1").await.unwrap(), Some(user.id));
        assert_eq!(tokens.consume("tok_1").await.unwrap(), None);

        tokens
            .insert("tok_expired", user.id, Utc::now() - chrono::Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(tokens.consume("tok_expired").await.unwrap(), None);
    }
}
