//! Margin accounting and pre-trade validation.
//!
//! Margin is reserved against free margin while a position is open, never
//! debited from the balance, so `equity = balance + unrealized` holds at
//! every instant.

use crate::domain::entities::position::{Position, PositionSide};
use crate::domain::errors::EngineError;
use crate::domain::services::pnl::round_cents;

/// Margin required to carry a position: `qty * entry_price / leverage`.
pub fn margin_required(qty: f64, entry_price: f64, leverage: u32) -> f64 {
    round_cents(qty * entry_price / leverage as f64)
}

/// Balance minus margin reserved by open positions.
pub fn free_margin(current_balance: f64, open_positions: &[Position]) -> f64 {
    let reserved: f64 = open_positions.iter().map(|p| p.margin_used).sum();
    round_cents(current_balance - reserved)
}

pub fn validate_leverage(requested: u32, max: u32) -> Result<(), EngineError> {
    if requested < 1 || requested > max {
        return Err(EngineError::InvalidLeverage { requested, max });
    }
    Ok(())
}

/// TP must sit on the profitable side of entry, SL on the losing side.
pub fn validate_tp_sl(
    side: PositionSide,
    entry_price: f64,
    take_profit: Option<f64>,
    stop_loss: Option<f64>,
) -> Result<(), EngineError> {
    if let Some(tp) = take_profit {
        let ok = match side {
            PositionSide::Long => tp > entry_price,
            PositionSide::Short => tp < entry_price,
        };
        if !ok {
            return Err(EngineError::InvalidTpSl(format!(
                "take-profit {tp} on wrong side of entry {entry_price} for {}",
                side.as_str()
            )));
        }
    }
    if let Some(sl) = stop_loss {
        let ok = match side {
            PositionSide::Long => sl < entry_price,
            PositionSide::Short => sl > entry_price,
        };
        if !ok {
            return Err(EngineError::InvalidTpSl(format!(
                "stop-loss {sl} on wrong side of entry {entry_price} for {}",
                side.as_str()
            )));
        }
    }
    Ok(())
}

/// Worst-case loss of a prospective trade: the distance to the stop when one
/// is set, otherwise the whole margin.
pub fn projected_worst_case_loss(
    qty: f64,
    entry_price: f64,
    stop_loss: Option<f64>,
    margin_used: f64,
) -> f64 {
    match stop_loss {
        Some(sl) => round_cents(qty * (entry_price - sl).abs()),
        None => margin_used,
    }
}

/// Soft pre-trade check: the projected loss, stacked on the day's realized
/// loss and the worst open unrealized loss, must not cross the daily limit.
/// Runtime enforcement stays with the risk evaluator.
pub fn check_daily_loss_headroom(
    projected_loss: f64,
    daily_pnl_realized: f64,
    worst_open_unrealized: f64,
    daily_anchor_equity: f64,
    max_daily_loss_pct: f64,
) -> Result<(), EngineError> {
    if daily_anchor_equity <= 0.0 {
        return Ok(());
    }
    let realized_loss = (-daily_pnl_realized).max(0.0);
    let open_loss = (-worst_open_unrealized).max(0.0);
    let stacked_pct =
        (projected_loss + realized_loss + open_loss) / daily_anchor_equity * 100.0;
    if stacked_pct >= max_daily_loss_pct {
        return Err(EngineError::PreconditionFailed(format!(
            "projected worst-case loss would reach {stacked_pct:.2}% of the daily anchor \
             (limit {max_daily_loss_pct:.2}%)"
        )));
    }
    Ok(())
}
