//! Property-based tests for the engine's core math.
//!
//! These verify the accounting invariants under random inputs: the equity
//! identity, PnL sign conventions, drawdown bounds, margin arithmetic and
//! peak-equity monotonicity.

use chrono::{TimeZone, Utc};
use proptest::prelude::*;

use propdesk::domain::entities::challenge::DrawdownType;
use propdesk::domain::entities::position::{Position, PositionSide};
use propdesk::domain::services::candle_builder::build_candles;
use propdesk::domain::services::margin::{free_margin, margin_required};
use propdesk::domain::services::pnl::{
    daily_drawdown_pct, equity, total_drawdown_pct, trade_pnl,
};

fn price_strategy() -> impl Strategy<Value = f64> {
    (1i64..10_000_000i64).prop_map(|x| x as f64 / 100.0) // $0.01 to $100,000
}

fn qty_strategy() -> impl Strategy<Value = f64> {
    (1i64..1_000_000i64).prop_map(|x| x as f64 / 10_000.0) // 0.0001 to 100
}

fn side_strategy() -> impl Strategy<Value = PositionSide> {
    prop_oneof![Just(PositionSide::Long), Just(PositionSide::Short)]
}

fn leverage_strategy() -> impl Strategy<Value = u32> {
    1u32..=100
}

fn position(symbol: &str, side: PositionSide, qty: f64, entry: f64, leverage: u32) -> Position {
    Position {
        id: 0,
        challenge_id: 1,
        symbol: symbol.to_string(),
        side,
        qty,
        leverage,
        entry_price: entry,
        take_profit: None,
        stop_loss: None,
        margin_used: margin_required(qty, entry, leverage),
        opened_at: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
        closed_at: None,
        close_price: None,
        close_reason: None,
        realized_pnl: None,
    }
}

proptest! {
    /// Closing at the entry price realizes nothing, regardless of side,
    /// size or leverage.
    #[test]
    fn pnl_zero_at_entry(
        side in side_strategy(),
        entry in price_strategy(),
        qty in qty_strategy(),
    ) {
        prop_assert_eq!(trade_pnl(side, entry, entry, qty), 0.0);
    }

    /// Longs profit when the mark rises; shorts when it falls.
    #[test]
    fn pnl_sign_matches_side(
        entry in price_strategy(),
        delta in 1i64..100_000i64,
        qty in qty_strategy(),
    ) {
        let up = entry + delta as f64 / 100.0;
        // Small qty * small delta can round to zero cents; require a move
        // worth at least a cent.
        prop_assume!(qty * (up - entry) >= 0.01);

        prop_assert!(trade_pnl(PositionSide::Long, entry, up, qty) > 0.0);
        prop_assert!(trade_pnl(PositionSide::Short, entry, up, qty) < 0.0);
    }

    /// Long and short PnL for the same move are mirror images.
    #[test]
    fn pnl_antisymmetric_across_sides(
        entry in price_strategy(),
        close in price_strategy(),
        qty in qty_strategy(),
    ) {
        let long = trade_pnl(PositionSide::Long, entry, close, qty);
        let short = trade_pnl(PositionSide::Short, entry, close, qty);
        prop_assert!((long + short).abs() < 0.011);
    }

    /// Equity equals balance plus the sum of unrealized PnL (invariant 1).
    #[test]
    fn equity_identity(
        balance in (0i64..100_000_000i64).prop_map(|x| x as f64 / 100.0),
        entries in prop::collection::vec((side_strategy(), qty_strategy(), price_strategy(), price_strategy()), 0..8),
    ) {
        let positions: Vec<Position> = entries
            .iter()
            .enumerate()
            .map(|(i, (side, qty, entry, _))| {
                position(&format!("SYM{i}USDT"), *side, *qty, *entry, 10)
            })
            .collect();
        let marks: Vec<f64> = entries.iter().map(|(_, _, _, mark)| *mark).collect();

        let expected: f64 = balance
            + positions
                .iter()
                .zip(&marks)
                .map(|(p, mark)| p.unrealized_pnl(*mark))
                .sum::<f64>();
        let actual = equity(balance, &positions, |symbol| {
            let index: usize = symbol
                .trim_start_matches("SYM")
                .trim_end_matches("USDT")
                .parse()
                .ok()?;
            marks.get(index).copied()
        });
        prop_assert!((actual - expected).abs() < 0.011);
    }

    /// Drawdown percentages are non-negative and zero when flat or up.
    #[test]
    fn drawdowns_are_non_negative(
        anchor in price_strategy(),
        eq in price_strategy(),
    ) {
        let daily = daily_drawdown_pct(anchor, eq);
        prop_assert!(daily >= 0.0);
        if eq >= anchor {
            prop_assert_eq!(daily, 0.0);
        } else {
            prop_assert!(daily <= 100.0);
        }
    }

    /// Trailing drawdown measures off the peak; static off the initial
    /// balance. Both agree when peak == initial.
    #[test]
    fn drawdown_bases(
        initial in price_strategy(),
        gain in 0i64..1_000_000i64,
        eq in price_strategy(),
    ) {
        let peak = initial + gain as f64 / 100.0;
        let trailing = total_drawdown_pct(DrawdownType::Trailing, initial, peak, eq);
        let static_dd = total_drawdown_pct(DrawdownType::Static, initial, peak, eq);
        // The peak is never below the initial balance, so trailing is at
        // least as strict.
        prop_assert!(trailing + 1e-9 >= static_dd);

        let same = total_drawdown_pct(DrawdownType::Static, initial, initial, eq);
        let same_trailing = total_drawdown_pct(DrawdownType::Trailing, initial, initial, eq);
        prop_assert!((same - same_trailing).abs() < 1e-9);
    }

    /// Margin scales with notional and inversely with leverage, and never
    /// exceeds the notional value.
    #[test]
    fn margin_bounds(
        qty in qty_strategy(),
        entry in price_strategy(),
        leverage in leverage_strategy(),
    ) {
        let margin = margin_required(qty, entry, leverage);
        let notional = qty * entry;
        prop_assert!(margin >= 0.0);
        prop_assert!(margin <= notional + 0.011);
        if leverage == 1 {
            prop_assert!((margin - notional).abs() < 0.011);
        }
    }

    /// Free margin decreases by exactly the reserved margin of each
    /// position.
    #[test]
    fn free_margin_accounting(
        balance in (0i64..100_000_000i64).prop_map(|x| x as f64 / 100.0),
        entries in prop::collection::vec((qty_strategy(), price_strategy(), leverage_strategy()), 0..6),
    ) {
        let positions: Vec<Position> = entries
            .iter()
            .map(|(qty, entry, lev)| position("BTCUSDT", PositionSide::Long, *qty, *entry, *lev))
            .collect();
        let reserved: f64 = positions.iter().map(|p| p.margin_used).sum();
        let free = free_margin(balance, &positions);
        prop_assert!((free - (balance - reserved)).abs() < 0.011);
    }

    /// Peak equity is non-decreasing under the evaluator's update rule
    /// (invariant 2).
    #[test]
    fn peak_equity_monotone(
        initial in price_strategy(),
        equities in prop::collection::vec(price_strategy(), 1..50),
    ) {
        let mut peak = initial;
        let mut last_peak = peak;
        for eq in equities {
            if eq > peak {
                peak = eq;
            }
            prop_assert!(peak >= last_peak);
            prop_assert!(peak >= initial);
            last_peak = peak;
        }
    }

    /// Candles bracket every price they aggregate and never exceed the
    /// requested bucket count.
    #[test]
    fn candles_bracket_prices(
        prices in prop::collection::vec(price_strategy(), 1..200),
        interval in 1i64..=240,
        limit in 1usize..50,
    ) {
        let points: Vec<_> = prices
            .iter()
            .enumerate()
            .map(|(i, p)| (Utc.timestamp_opt(1_700_000_000 + i as i64 * 7, 0).unwrap(), *p))
            .collect();
        let candles = build_candles(&points, interval * 60, limit);

        prop_assert!(candles.len() <= limit);
        for candle in &candles {
            prop_assert!(candle.low <= candle.open);
            prop_assert!(candle.low <= candle.close);
            prop_assert!(candle.high >= candle.open);
            prop_assert!(candle.high >= candle.close);
            prop_assert!(candle.volume >= 1.0);
        }
        // Bucket starts strictly increase.
        for pair in candles.windows(2) {
            prop_assert!(pair[0].time < pair[1].time);
        }
    }
}
