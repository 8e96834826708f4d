//! Database Models
//!
//! Row-level structs mapped with `sqlx::FromRow`, plus conversions into the
//! domain entities. Enum columns are stored as text and parsed on the way
//! out; a row that fails to parse indicates schema corruption and surfaces
//! as a decode error.

use chrono::{DateTime, Utc};
use sqlx::FromRow;

use crate::domain::entities::challenge::{
    AccountMode, Challenge, ChallengeStatus, ChallengeType, DrawdownType, FailReason,
};
use crate::domain::entities::payout::{Payout, PayoutNetwork, PayoutStatus};
use crate::domain::entities::position::{CloseReason, Position, PositionSide};
use crate::domain::entities::user::{User, UserRole};
use crate::domain::errors::EngineError;

fn bad_column(table: &str, column: &str, value: &str) -> EngineError {
    EngineError::Internal(format!("{table}.{column} holds unknown value '{value}'"))
}

#[derive(Debug, Clone, FromRow)]
pub struct UserRecord {
    pub id: i64,
    pub external_id: i64,
    pub display_name: String,
    pub role: String,
    pub is_blocked: bool,
    pub referral_code: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<UserRecord> for User {
    type Error = EngineError;

    fn try_from(r: UserRecord) -> Result<Self, Self::Error> {
        Ok(User {
            id: r.id,
            external_id: r.external_id,
            display_name: r.display_name,
            role: UserRole::parse(&r.role).ok_or_else(|| bad_column("users", "role", &r.role))?,
            is_blocked: r.is_blocked,
            referral_code: r.referral_code,
            created_at: r.created_at,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct ChallengeTypeRecord {
    pub id: i64,
    pub name: String,
    pub account_size: f64,
    pub price: f64,
    pub profit_target_p1_pct: f64,
    pub profit_target_p2_pct: f64,
    pub max_daily_loss_pct: f64,
    pub max_total_loss_pct: f64,
    pub min_trading_days: i64,
    pub drawdown_type: String,
    pub max_leverage: i64,
    pub profit_split_pct: f64,
    pub min_payout: f64,
    pub is_one_phase: bool,
    pub is_instant: bool,
    pub is_active: bool,
}

impl TryFrom<ChallengeTypeRecord> for ChallengeType {
    type Error = EngineError;

    fn try_from(r: ChallengeTypeRecord) -> Result<Self, Self::Error> {
        Ok(ChallengeType {
            id: r.id,
            name: r.name,
            account_size: r.account_size,
            price: r.price,
            profit_target_p1_pct: r.profit_target_p1_pct,
            profit_target_p2_pct: r.profit_target_p2_pct,
            max_daily_loss_pct: r.max_daily_loss_pct,
            max_total_loss_pct: r.max_total_loss_pct,
            min_trading_days: r.min_trading_days as u32,
            drawdown_type: DrawdownType::parse(&r.drawdown_type)
                .ok_or_else(|| bad_column("challenge_types", "drawdown_type", &r.drawdown_type))?,
            max_leverage: r.max_leverage as u32,
            profit_split_pct: r.profit_split_pct,
            min_payout: r.min_payout,
            is_one_phase: r.is_one_phase,
            is_instant: r.is_instant,
            is_active: r.is_active,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct ChallengeRecord {
    pub id: i64,
    pub user_id: i64,
    pub type_id: i64,
    pub status: String,
    pub account_mode: String,
    pub initial_balance: f64,
    pub current_balance: f64,
    pub peak_equity: f64,
    pub daily_anchor_equity: f64,
    pub daily_anchor_at: DateTime<Utc>,
    pub daily_pnl_realized: f64,
    pub total_pnl_realized: f64,
    pub trading_days_count: i64,
    pub scaling_step: i64,
    pub attempt_number: i64,
    pub month_anchor_balance: f64,
    pub month_anchor_at: DateTime<Utc>,
    pub failed_reason: Option<String>,
    pub quarantined_at: Option<DateTime<Utc>>,
    pub started_at: DateTime<Utc>,
    pub transitioned_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
}

impl TryFrom<ChallengeRecord> for Challenge {
    type Error = EngineError;

    fn try_from(r: ChallengeRecord) -> Result<Self, Self::Error> {
        let failed_reason = match r.failed_reason {
            Some(ref s) => Some(
                FailReason::parse(s)
                    .ok_or_else(|| bad_column("challenges", "failed_reason", s))?,
            ),
            None => None,
        };
        Ok(Challenge {
            id: r.id,
            user_id: r.user_id,
            type_id: r.type_id,
            status: ChallengeStatus::parse(&r.status)
                .ok_or_else(|| bad_column("challenges", "status", &r.status))?,
            account_mode: AccountMode::parse(&r.account_mode)
                .ok_or_else(|| bad_column("challenges", "account_mode", &r.account_mode))?,
            initial_balance: r.initial_balance,
            current_balance: r.current_balance,
            peak_equity: r.peak_equity,
            daily_anchor_equity: r.daily_anchor_equity,
            daily_anchor_at: r.daily_anchor_at,
            daily_pnl_realized: r.daily_pnl_realized,
            total_pnl_realized: r.total_pnl_realized,
            trading_days_count: r.trading_days_count as u32,
            scaling_step: r.scaling_step as u32,
            attempt_number: r.attempt_number as u32,
            month_anchor_balance: r.month_anchor_balance,
            month_anchor_at: r.month_anchor_at,
            failed_reason,
            quarantined_at: r.quarantined_at,
            started_at: r.started_at,
            transitioned_at: r.transitioned_at,
            failed_at: r.failed_at,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct PositionRecord {
    pub id: i64,
    pub challenge_id: i64,
    pub symbol: String,
    pub side: String,
    pub qty: f64,
    pub leverage: i64,
    pub entry_price: f64,
    pub take_profit: Option<f64>,
    pub stop_loss: Option<f64>,
    pub margin_used: f64,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub close_price: Option<f64>,
    pub close_reason: Option<String>,
    pub realized_pnl: Option<f64>,
}

impl TryFrom<PositionRecord> for Position {
    type Error = EngineError;

    fn try_from(r: PositionRecord) -> Result<Self, Self::Error> {
        let close_reason = match r.close_reason {
            Some(ref s) => Some(
                CloseReason::parse(s)
                    .ok_or_else(|| bad_column("positions", "close_reason", s))?,
            ),
            None => None,
        };
        Ok(Position {
            id: r.id,
            challenge_id: r.challenge_id,
            symbol: r.symbol.clone(),
            side: PositionSide::parse(&r.side)
                .ok_or_else(|| bad_column("positions", "side", &r.side))?,
            qty: r.qty,
            leverage: r.leverage as u32,
            entry_price: r.entry_price,
            take_profit: r.take_profit,
            stop_loss: r.stop_loss,
            margin_used: r.margin_used,
            opened_at: r.opened_at,
            closed_at: r.closed_at,
            close_price: r.close_price,
            close_reason,
            realized_pnl: r.realized_pnl,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct PayoutRecord {
    pub id: i64,
    pub challenge_id: i64,
    pub user_id: i64,
    pub amount: f64,
    pub wallet_address: String,
    pub network: String,
    pub status: String,
    pub tx_hash: Option<String>,
    pub requested_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl TryFrom<PayoutRecord> for Payout {
    type Error = EngineError;

    fn try_from(r: PayoutRecord) -> Result<Self, Self::Error> {
        Ok(Payout {
            id: r.id,
            challenge_id: r.challenge_id,
            user_id: r.user_id,
            amount: r.amount,
            wallet_address: r.wallet_address.clone(),
            network: PayoutNetwork::parse(&r.network)
                .ok_or_else(|| bad_column("payouts", "network", &r.network))?,
            status: PayoutStatus::parse(&r.status)
                .ok_or_else(|| bad_column("payouts", "status", &r.status))?,
            tx_hash: r.tx_hash,
            requested_at: r.requested_at,
            processed_at: r.processed_at,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct DailyCounterRecord {
    pub challenge_id: i64,
    pub day: String,
    pub realized_pnl: f64,
    pub worst_equity_drop_pct: f64,
    pub trades_opened: i64,
}

#[derive(Debug, Clone, FromRow)]
pub struct RefreshTokenRecord {
    pub token: String,
    pub user_id: i64,
    pub expires_at: DateTime<Utc>,
    pub revoked: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct EquitySnapshotRecord {
    pub id: i64,
    pub challenge_id: i64,
    pub equity: f64,
    pub balance: f64,
    pub recorded_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_enum_text_is_rejected() {
        let record = UserRecord {
            id: 1,
            external_id: 7,
            display_name: "t".into(),
            role: "overlord".into(),
            is_blocked: false,
            referral_code: None,
            created_at: Utc::now(),
        };
        assert!(User::try_from(record).is_err());
    }
}
