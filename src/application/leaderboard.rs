//! Leaderboard Aggregator
//!
//! Ranks challenges by profit percentage, monthly (against the month-start
//! anchor balance) and all-time (against the initial balance). Results are
//! cached for 60 seconds per (scope, limit); the cache is reconstructible
//! state.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use crate::domain::entities::challenge::ChallengeStatus;
use crate::domain::errors::EngineError;
use crate::persistence::repository::ChallengeRepository;
use crate::persistence::DbPool;

const CACHE_TTL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    Monthly,
    AllTime,
}

#[derive(Debug, Clone, Serialize)]
pub struct LeaderboardEntry {
    pub rank: usize,
    pub challenge_id: i64,
    pub display_name: String,
    pub profit_pct: f64,
    pub trading_days: u32,
    pub account_size: f64,
    pub started_at: DateTime<Utc>,
}

pub struct LeaderboardService {
    challenges: ChallengeRepository,
    cache: Mutex<HashMap<(Scope, usize), (Instant, Vec<LeaderboardEntry>)>>,
}

impl LeaderboardService {
    pub fn new(pool: DbPool) -> Self {
        Self {
            challenges: ChallengeRepository::new(pool),
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub async fn monthly(&self, limit: usize) -> Result<Vec<LeaderboardEntry>, EngineError> {
        self.get(Scope::Monthly, limit).await
    }

    pub async fn alltime(&self, limit: usize) -> Result<Vec<LeaderboardEntry>, EngineError> {
        self.get(Scope::AllTime, limit).await
    }

    async fn get(&self, scope: Scope, limit: usize) -> Result<Vec<LeaderboardEntry>, EngineError> {
        let limit = limit.clamp(1, 500);
        {
            let cache = self.cache.lock().await;
            if let Some((built_at, entries)) = cache.get(&(scope, limit)) {
                if built_at.elapsed() < CACHE_TTL {
                    return Ok(entries.clone());
                }
            }
        }

        let entries = self.build(scope, limit).await?;
        let mut cache = self.cache.lock().await;
        cache.insert((scope, limit), (Instant::now(), entries.clone()));
        Ok(entries)
    }

    async fn build(
        &self,
        scope: Scope,
        limit: usize,
    ) -> Result<Vec<LeaderboardEntry>, EngineError> {
        let rows = self.challenges.list_for_leaderboard().await?;

        let mut entries = Vec::new();
        for (challenge, display_name) in rows {
            let include = match scope {
                // Failed challenges never rank monthly.
                Scope::Monthly => challenge.status != ChallengeStatus::Failed,
                // All-time keeps failed accounts only once they earned a
                // completed payout.
                Scope::AllTime => {
                    challenge.status != ChallengeStatus::Failed
                        || self.challenges.has_sent_payout(challenge.id).await?
                }
            };
            if !include {
                continue;
            }

            let profit_pct = match scope {
                Scope::Monthly => profit_pct(
                    challenge.current_balance,
                    challenge.month_anchor_balance,
                ),
                Scope::AllTime => {
                    profit_pct(challenge.current_balance, challenge.initial_balance)
                }
            };
            entries.push(LeaderboardEntry {
                rank: 0,
                challenge_id: challenge.id,
                display_name,
                profit_pct,
                trading_days: challenge.trading_days_count,
                account_size: challenge.initial_balance,
                started_at: challenge.started_at,
            });
        }

        sort_entries(&mut entries);
        entries.truncate(limit);
        for (i, entry) in entries.iter_mut().enumerate() {
            entry.rank = i + 1;
        }
        Ok(entries)
    }
}

fn profit_pct(current: f64, base: f64) -> f64 {
    if base <= 0.0 {
        return 0.0;
    }
    (current - base) / base * 100.0
}

/// Descending profit; ties go to the faster trader (fewer trading days),
/// then to the earlier start.
fn sort_entries(entries: &mut [LeaderboardEntry]) {
    entries.sort_by(|a, b| {
        b.profit_pct
            .partial_cmp(&a.profit_pct)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.trading_days.cmp(&b.trading_days))
            .then_with(|| a.started_at.cmp(&b.started_at))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn entry(profit: f64, days: u32, started_s: i64) -> LeaderboardEntry {
        LeaderboardEntry {
            rank: 0,
            challenge_id: 0,
            display_name: String::new(),
            profit_pct: profit,
            trading_days: days,
            account_size: 10_000.0,
            started_at: Utc.timestamp_opt(started_s, 0).unwrap(),
        }
    }

    #[test]
    fn sorts_by_profit_then_speed_then_start() {
        let mut entries = vec![
            entry(5.0, 10, 100),
            entry(8.0, 3, 100),
            entry(5.0, 4, 200),
            entry(5.0, 4, 50),
        ];
        sort_entries(&mut entries);
        assert_eq!(entries[0].profit_pct, 8.0);
        assert_eq!(entries[1].trading_days, 4);
        assert_eq!(entries[1].started_at.timestamp(), 50);
        assert_eq!(entries[2].started_at.timestamp(), 200);
        assert_eq!(entries[3].trading_days, 10);
    }

    #[test]
    fn profit_pct_guards_zero_base() {
        assert_eq!(profit_pct(11_000.0, 10_000.0), 10.0);
        assert_eq!(profit_pct(11_000.0, 0.0), 0.0);
    }
}
