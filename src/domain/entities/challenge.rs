use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How total drawdown is measured: against the initial balance (static) or
/// against the highest equity seen so far (trailing).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DrawdownType {
    Static,
    Trailing,
}

impl DrawdownType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DrawdownType::Static => "static",
            DrawdownType::Trailing => "trailing",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "static" => Some(DrawdownType::Static),
            "trailing" => Some(DrawdownType::Trailing),
            _ => None,
        }
    }
}

/// Lifecycle state of a challenge. `Failed` and `Completed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChallengeStatus {
    Phase1,
    Phase2,
    Funded,
    Failed,
    Completed,
}

impl ChallengeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChallengeStatus::Phase1 => "phase1",
            ChallengeStatus::Phase2 => "phase2",
            ChallengeStatus::Funded => "funded",
            ChallengeStatus::Failed => "failed",
            ChallengeStatus::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "phase1" => Some(ChallengeStatus::Phase1),
            "phase2" => Some(ChallengeStatus::Phase2),
            "funded" => Some(ChallengeStatus::Funded),
            "failed" => Some(ChallengeStatus::Failed),
            "completed" => Some(ChallengeStatus::Completed),
            _ => None,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ChallengeStatus::Phase1 | ChallengeStatus::Phase2 | ChallengeStatus::Funded
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ChallengeStatus::Failed | ChallengeStatus::Completed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountMode {
    Demo,
    Funded,
}

impl AccountMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountMode::Demo => "demo",
            AccountMode::Funded => "funded",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "demo" => Some(AccountMode::Demo),
            "funded" => Some(AccountMode::Funded),
            _ => None,
        }
    }
}

/// Why a challenge was failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailReason {
    DailyDrawdown,
    TrailingDrawdown,
    Admin,
}

impl FailReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailReason::DailyDrawdown => "daily_drawdown",
            FailReason::TrailingDrawdown => "trailing_drawdown",
            FailReason::Admin => "admin",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "daily_drawdown" => Some(FailReason::DailyDrawdown),
            "trailing_drawdown" => Some(FailReason::TrailingDrawdown),
            "admin" => Some(FailReason::Admin),
            _ => None,
        }
    }
}

/// Catalog entry describing a purchasable plan. Immutable once referenced by
/// a challenge.
#[derive(Debug, Clone, Serialize)]
pub struct ChallengeType {
    pub id: i64,
    pub name: String,
    /// Starting account size in USDT.
    pub account_size: f64,
    /// Purchase fee in USDT.
    pub price: f64,
    pub profit_target_p1_pct: f64,
    pub profit_target_p2_pct: f64,
    pub max_daily_loss_pct: f64,
    pub max_total_loss_pct: f64,
    pub min_trading_days: u32,
    pub drawdown_type: DrawdownType,
    pub max_leverage: u32,
    /// Share of funded-phase profit paid out to the trader.
    pub profit_split_pct: f64,
    pub min_payout: f64,
    pub is_one_phase: bool,
    pub is_instant: bool,
    pub is_active: bool,
}

impl ChallengeType {
    /// Profit target (percent of initial balance) for the given phase, if
    /// that phase has one. Funded accounts have no target.
    pub fn profit_target_pct(&self, status: ChallengeStatus) -> Option<f64> {
        match status {
            ChallengeStatus::Phase1 => Some(self.profit_target_p1_pct),
            ChallengeStatus::Phase2 => Some(self.profit_target_p2_pct),
            _ => None,
        }
    }
}

/// A single evaluation account owned by one user.
#[derive(Debug, Clone, Serialize)]
pub struct Challenge {
    pub id: i64,
    pub user_id: i64,
    pub type_id: i64,
    pub status: ChallengeStatus,
    pub account_mode: AccountMode,
    pub initial_balance: f64,
    pub current_balance: f64,
    /// Highest equity observed; basis for trailing drawdown. Non-decreasing
    /// while the challenge is non-terminal, reset on phase transitions.
    pub peak_equity: f64,
    /// Equity at the start of the current UTC day; basis for daily drawdown.
    pub daily_anchor_equity: f64,
    pub daily_anchor_at: DateTime<Utc>,
    pub daily_pnl_realized: f64,
    pub total_pnl_realized: f64,
    pub trading_days_count: u32,
    pub scaling_step: u32,
    pub attempt_number: u32,
    /// Balance at the start of the current month; basis for the monthly
    /// leaderboard.
    pub month_anchor_balance: f64,
    pub month_anchor_at: DateTime<Utc>,
    pub failed_reason: Option<FailReason>,
    pub quarantined_at: Option<DateTime<Utc>>,
    pub started_at: DateTime<Utc>,
    pub transitioned_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
}

impl Challenge {
    pub fn is_quarantined(&self) -> bool {
        self.quarantined_at.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert!(ChallengeStatus::Phase1.is_active());
        assert!(ChallengeStatus::Funded.is_active());
        assert!(!ChallengeStatus::Failed.is_active());
        assert!(ChallengeStatus::Failed.is_terminal());
        assert!(ChallengeStatus::Completed.is_terminal());
        assert!(!ChallengeStatus::Phase2.is_terminal());
    }

    #[test]
    fn enums_round_trip() {
        for s in ["phase1", "phase2", "funded", "failed", "completed"] {
            assert_eq!(ChallengeStatus::parse(s).unwrap().as_str(), s);
        }
        for s in ["static", "trailing"] {
            assert_eq!(DrawdownType::parse(s).unwrap().as_str(), s);
        }
        for s in ["daily_drawdown", "trailing_drawdown", "admin"] {
            assert_eq!(FailReason::parse(s).unwrap().as_str(), s);
        }
    }

    #[test]
    fn profit_target_depends_on_phase() {
        let ct = ChallengeType {
            id: 1,
            name: "10K".into(),
            account_size: 10_000.0,
            price: 99.0,
            profit_target_p1_pct: 10.0,
            profit_target_p2_pct: 5.0,
            max_daily_loss_pct: 5.0,
            max_total_loss_pct: 10.0,
            min_trading_days: 5,
            drawdown_type: DrawdownType::Trailing,
            max_leverage: 50,
            profit_split_pct: 80.0,
            min_payout: 100.0,
            is_one_phase: false,
            is_instant: false,
            is_active: true,
        };
        assert_eq!(ct.profit_target_pct(ChallengeStatus::Phase1), Some(10.0));
        assert_eq!(ct.profit_target_pct(ChallengeStatus::Phase2), Some(5.0));
        assert_eq!(ct.profit_target_pct(ChallengeStatus::Funded), None);
    }
}
