//! PnL, equity and drawdown arithmetic.
//!
//! All monetary results are rounded to cents. Drawdown percentages are
//! positive when the account is down.

use crate::domain::entities::challenge::DrawdownType;
use crate::domain::entities::position::{Position, PositionSide};

/// Round a USDT amount to cents.
pub fn round_cents(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Realized or unrealized PnL of a fill:
/// `qty * (close - entry) * (+1 long | -1 short)`.
pub fn trade_pnl(side: PositionSide, entry_price: f64, close_price: f64, qty: f64) -> f64 {
    round_cents(qty * (close_price - entry_price) * side.sign())
}

/// Equity = balance + sum of unrealized PnL over open positions.
/// `mark_of` returns the mark price for a symbol, or None when the feed has
/// never seen it (the position then contributes nothing).
pub fn equity<F>(current_balance: f64, open_positions: &[Position], mark_of: F) -> f64
where
    F: Fn(&str) -> Option<f64>,
{
    let unrealized: f64 = open_positions
        .iter()
        .filter_map(|p| mark_of(&p.symbol).map(|mark| p.unrealized_pnl(mark)))
        .sum();
    round_cents(current_balance + unrealized)
}

/// Daily drawdown as a percentage of the day's anchor equity. Positive when
/// equity is below the anchor, zero otherwise.
pub fn daily_drawdown_pct(daily_anchor_equity: f64, equity: f64) -> f64 {
    if daily_anchor_equity <= 0.0 {
        return 0.0;
    }
    let loss = daily_anchor_equity - equity;
    if loss <= 0.0 {
        0.0
    } else {
        loss / daily_anchor_equity * 100.0
    }
}

/// Total drawdown percentage. Trailing accounts measure against the peak
/// equity; static accounts against the initial balance.
pub fn total_drawdown_pct(
    drawdown_type: DrawdownType,
    initial_balance: f64,
    peak_equity: f64,
    equity: f64,
) -> f64 {
    let base = match drawdown_type {
        DrawdownType::Trailing => peak_equity,
        DrawdownType::Static => initial_balance,
    };
    if base <= 0.0 {
        return 0.0;
    }
    let loss = base - equity;
    if loss <= 0.0 {
        0.0
    } else {
        loss / base * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn open_position(symbol: &str, side: PositionSide, qty: f64, entry: f64) -> Position {
        Position {
            id: 0,
            challenge_id: 1,
            symbol: symbol.into(),
            side,
            qty,
            leverage: 10,
            entry_price: entry,
            take_profit: None,
            stop_loss: None,
            margin_used: qty * entry / 10.0,
            opened_at: Utc::now(),
            closed_at: None,
            close_price: None,
            close_reason: None,
            realized_pnl: None,
        }
    }

    #[test]
    fn trade_pnl_signs() {
        assert_eq!(trade_pnl(PositionSide::Long, 100.0, 110.0, 2.0), 20.0);
        assert_eq!(trade_pnl(PositionSide::Long, 100.0, 90.0, 2.0), -20.0);
        assert_eq!(trade_pnl(PositionSide::Short, 100.0, 90.0, 2.0), 20.0);
        assert_eq!(trade_pnl(PositionSide::Short, 100.0, 110.0, 2.0), -20.0);
    }

    #[test]
    fn trade_pnl_zero_at_entry() {
        assert_eq!(trade_pnl(PositionSide::Long, 50_000.0, 50_000.0, 0.37), 0.0);
        assert_eq!(trade_pnl(PositionSide::Short, 50_000.0, 50_000.0, 0.37), 0.0);
    }

    #[test]
    fn equity_sums_unrealized() {
        let positions = vec![
            open_position("BTCUSDT", PositionSide::Long, 1.0, 50_000.0),
            open_position("ETHUSDT", PositionSide::Short, 10.0, 3_000.0),
        ];
        // BTC +1000, ETH +500
        let eq = equity(10_000.0, &positions, |s| match s {
            "BTCUSDT" => Some(51_000.0),
            "ETHUSDT" => Some(2_950.0),
            _ => None,
        });
        assert_eq!(eq, 11_500.0);
    }

    #[test]
    fn equity_skips_unpriced_symbols() {
        let positions = vec![open_position("TONUSDT", PositionSide::Long, 100.0, 5.0)];
        assert_eq!(equity(10_000.0, &positions, |_| None), 10_000.0);
    }

    #[test]
    fn daily_drawdown_positive_when_down() {
        assert_eq!(daily_drawdown_pct(10_000.0, 9_500.0), 5.0);
        assert_eq!(daily_drawdown_pct(10_000.0, 10_500.0), 0.0);
        assert_eq!(daily_drawdown_pct(0.0, 9_500.0), 0.0);
    }

    #[test]
    fn total_drawdown_trailing_vs_static() {
        // Peak 10800, equity 9720 => exactly 10% trailing.
        let trailing =
            total_drawdown_pct(DrawdownType::Trailing, 10_000.0, 10_800.0, 9_720.0);
        assert!((trailing - 10.0).abs() < 1e-9);

        // Static measures against initial balance instead.
        let static_dd = total_drawdown_pct(DrawdownType::Static, 10_000.0, 10_800.0, 9_720.0);
        assert!((static_dd - 2.8).abs() < 1e-9);
    }

    #[test]
    fn round_cents_behaves() {
        assert_eq!(round_cents(1.005), 1.01);
        assert_eq!(round_cents(-0.004), -0.0);
        assert_eq!(round_cents(10.0), 10.0);
    }
}
