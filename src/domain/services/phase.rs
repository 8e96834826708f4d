//! Phase state machine: transition guards and the mutations they imply.
//!
//! Guards are pure so they can be exercised exhaustively in tests; the risk
//! evaluator applies the returned event inside the per-challenge writer lock.

use chrono::{DateTime, Utc};

use crate::domain::entities::challenge::{
    AccountMode, Challenge, ChallengeStatus, ChallengeType, FailReason,
};
use crate::domain::services::pnl::round_cents;

pub const SCALING_TRIGGER_PCT: f64 = 10.0;
pub const SCALING_FACTOR: f64 = 1.25;
pub const MAX_ACCOUNT_SIZE: f64 = 2_000_000.0;

/// A transition the state machine wants applied.
#[derive(Debug, Clone, PartialEq)]
pub enum PhaseEvent {
    AdvanceToPhase2,
    AdvanceToFunded,
    Scale { new_size: f64 },
    Fail { reason: FailReason },
}

/// Evaluate phase advancement for an active challenge.
///
/// Advancement requires the profit target met on realized + unrealized PnL,
/// the minimum trading days (unless the plan is instant), a flat book, and
/// no stale-priced positions blocking a funded promotion.
pub fn evaluate_advancement(
    challenge: &Challenge,
    ct: &ChallengeType,
    equity: f64,
    open_positions: usize,
    any_stale: bool,
) -> Option<PhaseEvent> {
    if challenge.status.is_terminal() {
        return None;
    }
    let target_pct = ct.profit_target_pct(challenge.status)?;

    let total_pnl = challenge.total_pnl_realized + (equity - challenge.current_balance);
    let target_amount = challenge.initial_balance * target_pct / 100.0;
    if total_pnl < target_amount {
        return None;
    }
    if !ct.is_instant && challenge.trading_days_count < ct.min_trading_days {
        return None;
    }
    // A winning open position does not advance the phase until it closes.
    if open_positions > 0 {
        return None;
    }

    match challenge.status {
        ChallengeStatus::Phase1 if ct.is_one_phase => {
            if any_stale {
                return None;
            }
            Some(PhaseEvent::AdvanceToFunded)
        }
        ChallengeStatus::Phase1 => Some(PhaseEvent::AdvanceToPhase2),
        ChallengeStatus::Phase2 => {
            if any_stale {
                return None;
            }
            Some(PhaseEvent::AdvanceToFunded)
        }
        _ => None,
    }
}

/// Scaling rule for funded accounts: realized PnL since the last scaling
/// step of at least 10% of the account size grows the account by 25%,
/// capped at `MAX_ACCOUNT_SIZE`.
pub fn evaluate_scaling(challenge: &Challenge) -> Option<PhaseEvent> {
    if challenge.status != ChallengeStatus::Funded {
        return None;
    }
    if challenge.initial_balance >= MAX_ACCOUNT_SIZE {
        return None;
    }
    let realized_since_step = challenge.current_balance - challenge.initial_balance;
    if realized_since_step < challenge.initial_balance * SCALING_TRIGGER_PCT / 100.0 {
        return None;
    }
    let new_size = (challenge.initial_balance * SCALING_FACTOR).min(MAX_ACCOUNT_SIZE);
    Some(PhaseEvent::Scale { new_size })
}

/// Apply a transition to the challenge, resetting counters the way a fresh
/// phase starts: anchors and peak follow the carried-over balance.
pub fn apply_event(challenge: &mut Challenge, event: &PhaseEvent, now: DateTime<Utc>) {
    match event {
        PhaseEvent::AdvanceToPhase2 => {
            challenge.status = ChallengeStatus::Phase2;
            reset_counters(challenge, now);
        }
        PhaseEvent::AdvanceToFunded => {
            challenge.status = ChallengeStatus::Funded;
            challenge.account_mode = AccountMode::Funded;
            reset_counters(challenge, now);
        }
        PhaseEvent::Scale { new_size } => {
            challenge.scaling_step += 1;
            challenge.initial_balance = round_cents(*new_size);
            challenge.current_balance = round_cents(*new_size);
            challenge.peak_equity = challenge.initial_balance;
            challenge.daily_anchor_equity = challenge.initial_balance;
            challenge.daily_anchor_at = now;
            challenge.transitioned_at = Some(now);
        }
        PhaseEvent::Fail { reason } => {
            challenge.status = ChallengeStatus::Failed;
            challenge.failed_reason = Some(*reason);
            challenge.failed_at = Some(now);
        }
    }
}

fn reset_counters(challenge: &mut Challenge, now: DateTime<Utc>) {
    challenge.daily_pnl_realized = 0.0;
    challenge.total_pnl_realized = 0.0;
    challenge.initial_balance = challenge.current_balance;
    challenge.peak_equity = challenge.current_balance;
    challenge.daily_anchor_equity = challenge.current_balance;
    challenge.daily_anchor_at = now;
    challenge.trading_days_count = 0;
    challenge.transitioned_at = Some(now);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::challenge::DrawdownType;

    fn challenge_type() -> ChallengeType {
        ChallengeType {
            id: 1,
            name: "10K Two-Step".into(),
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
        }
    }

    fn challenge(status: ChallengeStatus, balance: f64, days: u32) -> Challenge {
        let now = Utc::now();
        Challenge {
            id: 1,
            user_id: 1,
            type_id: 1,
            status,
            account_mode: AccountMode::Demo,
            initial_balance: 10_000.0,
            current_balance: balance,
            peak_equity: balance.max(10_000.0),
            daily_anchor_equity: balance,
            daily_anchor_at: now,
            daily_pnl_realized: 0.0,
            total_pnl_realized: balance - 10_000.0,
            trading_days_count: days,
            scaling_step: 0,
            attempt_number: 1,
            month_anchor_balance: 10_000.0,
            month_anchor_at: now,
            failed_reason: None,
            quarantined_at: None,
            started_at: now,
            transitioned_at: None,
            failed_at: None,
        }
    }

    #[test]
    fn phase1_advances_when_target_days_and_flat() {
        let ct = challenge_type();
        let c = challenge(ChallengeStatus::Phase1, 11_000.0, 5);
        assert_eq!(
            evaluate_advancement(&c, &ct, 11_000.0, 0, false),
            Some(PhaseEvent::AdvanceToPhase2)
        );
    }

    #[test]
    fn open_position_blocks_advancement_even_at_target() {
        let ct = challenge_type();
        // Realized 500 + unrealized 500 = exactly at target, but book not flat.
        let c = challenge(ChallengeStatus::Phase1, 10_500.0, 5);
        assert_eq!(evaluate_advancement(&c, &ct, 11_000.0, 1, false), None);
    }

    #[test]
    fn min_days_gate_applies_unless_instant() {
        let mut ct = challenge_type();
        let c = challenge(ChallengeStatus::Phase1, 11_000.0, 4);
        assert_eq!(evaluate_advancement(&c, &ct, 11_000.0, 0, false), None);

        ct.is_instant = true;
        assert_eq!(
            evaluate_advancement(&c, &ct, 11_000.0, 0, false),
            Some(PhaseEvent::AdvanceToPhase2)
        );
    }

    #[test]
    fn one_phase_plan_goes_straight_to_funded() {
        let mut ct = challenge_type();
        ct.is_one_phase = true;
        let c = challenge(ChallengeStatus::Phase1, 11_000.0, 5);
        assert_eq!(
            evaluate_advancement(&c, &ct, 11_000.0, 0, false),
            Some(PhaseEvent::AdvanceToFunded)
        );
    }

    #[test]
    fn stale_prices_block_funded_promotion() {
        let ct = challenge_type();
        let c = challenge(ChallengeStatus::Phase2, 10_500.0, 5);
        assert_eq!(evaluate_advancement(&c, &ct, 10_500.0, 0, true), None);
        assert_eq!(
            evaluate_advancement(&c, &ct, 10_500.0, 0, false),
            Some(PhaseEvent::AdvanceToFunded)
        );
    }

    #[test]
    fn funded_has_no_target() {
        let ct = challenge_type();
        let c = challenge(ChallengeStatus::Funded, 12_000.0, 10);
        assert_eq!(evaluate_advancement(&c, &ct, 12_000.0, 0, false), None);
    }

    #[test]
    fn apply_phase2_resets_counters_to_balance() {
        let mut c = challenge(ChallengeStatus::Phase1, 11_000.0, 5);
        let now = Utc::now();
        apply_event(&mut c, &PhaseEvent::AdvanceToPhase2, now);
        assert_eq!(c.status, ChallengeStatus::Phase2);
        assert_eq!(c.initial_balance, 11_000.0);
        assert_eq!(c.peak_equity, 11_000.0);
        assert_eq!(c.daily_anchor_equity, 11_000.0);
        assert_eq!(c.total_pnl_realized, 0.0);
        assert_eq!(c.trading_days_count, 0);
        assert_eq!(c.transitioned_at, Some(now));
    }

    #[test]
    fn funded_promotion_switches_account_mode() {
        let mut c = challenge(ChallengeStatus::Phase2, 10_500.0, 5);
        apply_event(&mut c, &PhaseEvent::AdvanceToFunded, Utc::now());
        assert_eq!(c.status, ChallengeStatus::Funded);
        assert_eq!(c.account_mode, AccountMode::Funded);
    }

    #[test]
    fn scaling_triggers_at_ten_percent_and_caps() {
        let mut c = challenge(ChallengeStatus::Funded, 11_000.0, 0);
        c.initial_balance = 10_000.0;
        match evaluate_scaling(&c) {
            Some(PhaseEvent::Scale { new_size }) => assert_eq!(new_size, 12_500.0),
            other => panic!("expected scale event, got {other:?}"),
        }

        // Below the trigger: nothing.
        c.current_balance = 10_900.0;
        assert_eq!(evaluate_scaling(&c), None);

        // At the cap: nothing.
        c.initial_balance = MAX_ACCOUNT_SIZE;
        c.current_balance = MAX_ACCOUNT_SIZE * 1.2;
        assert_eq!(evaluate_scaling(&c), None);
    }

    #[test]
    fn scaling_resets_anchors() {
        let mut c = challenge(ChallengeStatus::Funded, 11_000.0, 3);
        let now = Utc::now();
        apply_event(&mut c, &PhaseEvent::Scale { new_size: 12_500.0 }, now);
        assert_eq!(c.scaling_step, 1);
        assert_eq!(c.initial_balance, 12_500.0);
        assert_eq!(c.peak_equity, 12_500.0);
        assert_eq!(c.daily_anchor_equity, 12_500.0);
    }

    #[test]
    fn fail_event_is_terminal_with_reason() {
        let mut c = challenge(ChallengeStatus::Phase1, 9_000.0, 2);
        apply_event(
            &mut c,
            &PhaseEvent::Fail {
                reason: FailReason::DailyDrawdown,
            },
            Utc::now(),
        );
        assert_eq!(c.status, ChallengeStatus::Failed);
        assert_eq!(c.failed_reason, Some(FailReason::DailyDrawdown));
        assert!(c.failed_at.is_some());
    }
}
