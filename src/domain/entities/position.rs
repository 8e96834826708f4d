use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionSide::Long => "long",
            PositionSide::Short => "short",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "long" => Some(PositionSide::Long),
            "short" => Some(PositionSide::Short),
            _ => None,
        }
    }

    /// +1 for long, -1 for short; multiplies the raw price move into PnL.
    pub fn sign(&self) -> f64 {
        match self {
            PositionSide::Long => 1.0,
            PositionSide::Short => -1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    Manual,
    TakeProfit,
    StopLoss,
    DailyDrawdown,
    TrailingDrawdown,
    Admin,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::Manual => "manual",
            CloseReason::TakeProfit => "take_profit",
            CloseReason::StopLoss => "stop_loss",
            CloseReason::DailyDrawdown => "daily_drawdown",
            CloseReason::TrailingDrawdown => "trailing_drawdown",
            CloseReason::Admin => "admin",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "manual" => Some(CloseReason::Manual),
            "take_profit" => Some(CloseReason::TakeProfit),
            "stop_loss" => Some(CloseReason::StopLoss),
            "daily_drawdown" => Some(CloseReason::DailyDrawdown),
            "trailing_drawdown" => Some(CloseReason::TrailingDrawdown),
            "admin" => Some(CloseReason::Admin),
            _ => None,
        }
    }
}

/// A simulated leveraged position. Exactly one of two shapes at any time:
/// open (`closed_at` absent) or closed (all close fields present).
#[derive(Debug, Clone, Serialize)]
pub struct Position {
    pub id: i64,
    pub challenge_id: i64,
    pub symbol: String,
    pub side: PositionSide,
    /// Contract quantity in base-asset units.
    pub qty: f64,
    pub leverage: u32,
    pub entry_price: f64,
    pub take_profit: Option<f64>,
    pub stop_loss: Option<f64>,
    /// Margin reserved against free margin while open.
    pub margin_used: f64,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub close_price: Option<f64>,
    pub close_reason: Option<CloseReason>,
    pub realized_pnl: Option<f64>,
}

impl Position {
    pub fn is_open(&self) -> bool {
        self.closed_at.is_none()
    }

    pub fn unrealized_pnl(&self, mark: f64) -> f64 {
        self.qty * (mark - self.entry_price) * self.side.sign()
    }

    pub fn hit_stop_loss(&self, mark: f64) -> bool {
        match (self.stop_loss, self.side) {
            (Some(sl), PositionSide::Long) => mark <= sl,
            (Some(sl), PositionSide::Short) => mark >= sl,
            (None, _) => false,
        }
    }

    pub fn hit_take_profit(&self, mark: f64) -> bool {
        match (self.take_profit, self.side) {
            (Some(tp), PositionSide::Long) => mark >= tp,
            (Some(tp), PositionSide::Short) => mark <= tp,
            (None, _) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn position(side: PositionSide, tp: Option<f64>, sl: Option<f64>) -> Position {
        Position {
            id: 1,
            challenge_id: 1,
            symbol: "BTCUSDT".into(),
            side,
            qty: 0.5,
            leverage: 10,
            entry_price: 50_000.0,
            take_profit: tp,
            stop_loss: sl,
            margin_used: 2_500.0,
            opened_at: Utc::now(),
            closed_at: None,
            close_price: None,
            close_reason: None,
            realized_pnl: None,
        }
    }

    #[test]
    fn unrealized_pnl_long() {
        let p = position(PositionSide::Long, None, None);
        assert_eq!(p.unrealized_pnl(55_000.0), 2_500.0);
        assert_eq!(p.unrealized_pnl(45_000.0), -2_500.0);
    }

    #[test]
    fn unrealized_pnl_short() {
        let p = position(PositionSide::Short, None, None);
        assert_eq!(p.unrealized_pnl(45_000.0), 2_500.0);
        assert_eq!(p.unrealized_pnl(55_000.0), -2_500.0);
    }

    #[test]
    fn stop_loss_triggers_on_correct_side() {
        let long = position(PositionSide::Long, None, Some(47_500.0));
        assert!(!long.hit_stop_loss(48_000.0));
        assert!(long.hit_stop_loss(47_500.0));
        assert!(long.hit_stop_loss(47_000.0));

        let short = position(PositionSide::Short, None, Some(52_500.0));
        assert!(!short.hit_stop_loss(52_000.0));
        assert!(short.hit_stop_loss(52_500.0));
    }

    #[test]
    fn take_profit_triggers_on_correct_side() {
        let long = position(PositionSide::Long, Some(55_000.0), None);
        assert!(!long.hit_take_profit(54_999.0));
        assert!(long.hit_take_profit(55_000.0));

        let short = position(PositionSide::Short, Some(45_000.0), None);
        assert!(!short.hit_take_profit(46_000.0));
        assert!(short.hit_take_profit(45_000.0));
    }

    #[test]
    fn no_triggers_without_levels() {
        let p = position(PositionSide::Long, None, None);
        assert!(!p.hit_stop_loss(0.01));
        assert!(!p.hit_take_profit(1_000_000.0));
    }
}
