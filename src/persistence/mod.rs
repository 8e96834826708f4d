//! Persistence Layer
//!
//! SQLite-backed durable store for users, challenge catalog, challenges,
//! positions, daily counters, payouts, refresh tokens, equity snapshots and
//! the audit log. Async access via sqlx; schema migrations run inline at
//! startup.

pub mod models;
pub mod repository;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use tracing::info;

pub type DbPool = SqlitePool;

/// Initialize the connection pool and bring the schema up to date.
pub async fn init_database(database_url: &str) -> Result<DbPool, sqlx::Error> {
    info!("initializing database: {}", database_url);

    if let Some(db_path) = database_url.strip_prefix("sqlite://") {
        if let Some(parent) = Path::new(db_path).parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| sqlx::Error::Configuration(Box::new(e)))?;
        }
    }

    let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);

    // An in-memory database is per-connection; more than one connection in
    // the pool would see different schemas.
    let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };
    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await?;

    run_migrations(&pool).await?;
    seed_catalog_if_empty(&pool).await?;

    info!("database ready");
    Ok(pool)
}

async fn run_migrations(pool: &DbPool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS users (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            external_id INTEGER NOT NULL UNIQUE,
            display_name TEXT NOT NULL,
            role TEXT NOT NULL DEFAULT 'trader'
                CHECK(role IN ('trader', 'funded_trader', 'admin', 'super_admin')),
            is_blocked INTEGER NOT NULL DEFAULT 0,
            referral_code TEXT,
            created_at DATETIME NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS challenge_types (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            account_size REAL NOT NULL,
            price REAL NOT NULL,
            profit_target_p1_pct REAL NOT NULL,
            profit_target_p2_pct REAL NOT NULL,
            max_daily_loss_pct REAL NOT NULL,
            max_total_loss_pct REAL NOT NULL,
            min_trading_days INTEGER NOT NULL,
            drawdown_type TEXT NOT NULL CHECK(drawdown_type IN ('static', 'trailing')),
            max_leverage INTEGER NOT NULL,
            profit_split_pct REAL NOT NULL,
            min_payout REAL NOT NULL DEFAULT 100.0,
            is_one_phase INTEGER NOT NULL DEFAULT 0,
            is_instant INTEGER NOT NULL DEFAULT 0,
            is_active INTEGER NOT NULL DEFAULT 1
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS challenges (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id INTEGER NOT NULL REFERENCES users(id),
            type_id INTEGER NOT NULL REFERENCES challenge_types(id),
            status TEXT NOT NULL DEFAULT 'phase1'
                CHECK(status IN ('phase1', 'phase2', 'funded', 'failed', 'completed')),
            account_mode TEXT NOT NULL DEFAULT 'demo'
                CHECK(account_mode IN ('demo', 'funded')),
            initial_balance REAL NOT NULL,
            current_balance REAL NOT NULL,
            peak_equity REAL NOT NULL,
            daily_anchor_equity REAL NOT NULL,
            daily_anchor_at DATETIME NOT NULL,
            daily_pnl_realized REAL NOT NULL DEFAULT 0,
            total_pnl_realized REAL NOT NULL DEFAULT 0,
            trading_days_count INTEGER NOT NULL DEFAULT 0,
            scaling_step INTEGER NOT NULL DEFAULT 0,
            attempt_number INTEGER NOT NULL DEFAULT 1,
            month_anchor_balance REAL NOT NULL,
            month_anchor_at DATETIME NOT NULL,
            failed_reason TEXT,
            quarantined_at DATETIME,
            started_at DATETIME NOT NULL,
            transitioned_at DATETIME,
            failed_at DATETIME
        )
        "#,
    )
    .execute(pool)
    .await?;

    // At most one challenge per user may be in an active status.
    sqlx::query(
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS ix_challenges_single_active
        ON challenges(user_id)
        WHERE status IN ('phase1', 'phase2', 'funded')
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS ix_challenges_status ON challenges(status)")
        .execute(pool)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS positions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            challenge_id INTEGER NOT NULL REFERENCES challenges(id),
            symbol TEXT NOT NULL,
            side TEXT NOT NULL CHECK(side IN ('long', 'short')),
            qty REAL NOT NULL,
            leverage INTEGER NOT NULL,
            entry_price REAL NOT NULL,
            take_profit REAL,
            stop_loss REAL,
            margin_used REAL NOT NULL,
            opened_at DATETIME NOT NULL,
            closed_at DATETIME,
            close_price REAL,
            close_reason TEXT
                CHECK(close_reason IS NULL OR close_reason IN
                    ('manual', 'take_profit', 'stop_loss',
                     'daily_drawdown', 'trailing_drawdown', 'admin')),
            realized_pnl REAL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS ix_positions_history ON positions(challenge_id, opened_at)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS ix_positions_open
        ON positions(challenge_id)
        WHERE closed_at IS NULL
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS daily_counters (
            challenge_id INTEGER NOT NULL REFERENCES challenges(id),
            day TEXT NOT NULL,
            realized_pnl REAL NOT NULL DEFAULT 0,
            worst_equity_drop_pct REAL NOT NULL DEFAULT 0,
            trades_opened INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (challenge_id, day)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS payouts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            challenge_id INTEGER NOT NULL REFERENCES challenges(id),
            user_id INTEGER NOT NULL REFERENCES users(id),
            amount REAL NOT NULL,
            wallet_address TEXT NOT NULL,
            network TEXT NOT NULL CHECK(network IN ('TRC20', 'ERC20', 'BEP20')),
            status TEXT NOT NULL DEFAULT 'pending'
                CHECK(status IN ('pending', 'approved', 'rejected', 'sent')),
            tx_hash TEXT,
            requested_at DATETIME NOT NULL,
            processed_at DATETIME
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS ix_payouts_challenge ON payouts(challenge_id)")
        .execute(pool)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS refresh_tokens (
            token TEXT PRIMARY KEY,
            user_id INTEGER NOT NULL REFERENCES users(id),
            expires_at DATETIME NOT NULL,
            revoked INTEGER NOT NULL DEFAULT 0,
            created_at DATETIME NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS equity_snapshots (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            challenge_id INTEGER NOT NULL REFERENCES challenges(id),
            equity REAL NOT NULL,
            balance REAL NOT NULL,
            recorded_at DATETIME NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS ix_snapshots_challenge \
         ON equity_snapshots(challenge_id, recorded_at)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS audit_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_type TEXT NOT NULL,
            challenge_id INTEGER,
            details TEXT NOT NULL,
            created_at DATETIME NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS ix_audit_created ON audit_log(created_at)")
        .execute(pool)
        .await?;

    Ok(())
}

/// Seed a starter plan catalog on first boot so purchases work out of the
/// box. An operator-managed catalog replaces these rows in production.
async fn seed_catalog_if_empty(pool: &DbPool) -> Result<(), sqlx::Error> {
    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM challenge_types")
        .fetch_one(pool)
        .await?;
    if count > 0 {
        return Ok(());
    }

    info!("seeding default challenge catalog");
    let plans: [(&str, f64, f64, f64, f64, f64, f64, i64, &str, i64, f64, bool); 3] = [
        ("5K Two-Step", 5_000.0, 49.0, 10.0, 5.0, 5.0, 10.0, 5, "trailing", 50, 80.0, false),
        ("10K Two-Step", 10_000.0, 99.0, 10.0, 5.0, 5.0, 10.0, 5, "trailing", 50, 80.0, false),
        ("25K One-Step", 25_000.0, 249.0, 10.0, 0.0, 5.0, 10.0, 5, "static", 30, 80.0, true),
    ];

    for (name, size, price, p1, p2, daily, total, days, dd, lev, split, one_phase) in plans {
        sqlx::query(
            r#"
            INSERT INTO challenge_types (
                name, account_size, price, profit_target_p1_pct, profit_target_p2_pct,
                max_daily_loss_pct, max_total_loss_pct, min_trading_days, drawdown_type,
                max_leverage, profit_split_pct, min_payout, is_one_phase, is_instant, is_active
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, 100.0, ?12, 0, 1)
            "#,
        )
        .bind(name)
        .bind(size)
        .bind(price)
        .bind(p1)
        .bind(p2)
        .bind(daily)
        .bind(total)
        .bind(days)
        .bind(dd)
        .bind(lev)
        .bind(split)
        .bind(one_phase)
        .execute(pool)
        .await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn init_creates_schema() {
        let pool = init_database("sqlite::memory:").await.unwrap();
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name IN \
             ('users', 'challenges', 'positions', 'payouts', 'daily_counters')",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(count, 5);
    }

    #[tokio::test]
    async fn catalog_is_seeded_once() {
        let pool = init_database("sqlite::memory:").await.unwrap();
        seed_catalog_if_empty(&pool).await.unwrap();
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM challenge_types")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 3);
    }

    #[tokio::test]
    async fn single_active_challenge_enforced() {
        let pool = init_database("sqlite::memory:").await.unwrap();
        sqlx::query(
            "INSERT INTO users (external_id, display_name, created_at) \
             VALUES (1, 'trader', datetime('now'))",
        )
        .execute(&pool)
        .await
        .unwrap();

        let insert = "INSERT INTO challenges (user_id, type_id, status, initial_balance, \
             current_balance, peak_equity, daily_anchor_equity, daily_anchor_at, \
             month_anchor_balance, month_anchor_at, started_at) \
             VALUES (1, 1, ?1, 10000, 10000, 10000, 10000, datetime('now'), 10000, \
             datetime('now'), datetime('now'))";

        sqlx::query(insert).bind("phase1").execute(&pool).await.unwrap();
        // Second active challenge for the same user violates the partial index.
        assert!(sqlx::query(insert).bind("phase2").execute(&pool).await.is_err());
        // A failed one is fine.
        sqlx::query(insert).bind("failed").execute(&pool).await.unwrap();
    }
}
