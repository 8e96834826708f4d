use std::time::Duration;

/// Runtime configuration, loaded once from the environment at startup.
#[derive(Debug, Clone)]
pub struct Settings {
    pub bind_addr: String,
    pub db_url: String,
    /// Recognized for deployments fronting the service with an external
    /// key/value cache; nothing in-process requires it.
    pub cache_url: Option<String>,
    pub exchange_rest_url: String,
    pub exchange_stream_url: String,
    /// Shared secret used to verify host-supplied init data.
    pub platform_bot_token: String,
    pub jwt_signing_key: String,
    pub access_ttl_s: u64,
    pub refresh_ttl_s: u64,
    pub price_stale_ms: u64,
    pub eval_tick_ms: u64,
    pub max_eval_concurrency: usize,
    pub allowed_origins: Vec<String>,
    /// USDT-perpetual symbols tracked by the price feed. Static at startup.
    pub symbols: Vec<String>,
    pub requests_per_minute: u32,
    pub request_timeout_s: u64,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Settings {
    pub fn from_env() -> Self {
        let default_concurrency = std::thread::available_parallelism()
            .map(|n| (n.get() * 2).min(32))
            .unwrap_or(8);

        let symbols = env_or(
            "TRACKED_SYMBOLS",
            "BTCUSDT,ETHUSDT,SOLUSDT,BNBUSDT,XRPUSDT,DOGEUSDT,TONUSDT",
        )
        .split(',')
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty())
        .collect();

        let allowed_origins = std::env::var("ALLOWED_ORIGINS")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let platform_bot_token = std::env::var("PLATFORM_BOT_TOKEN").unwrap_or_else(|_| {
            tracing::warn!("PLATFORM_BOT_TOKEN not set, using development token");
            "dev_bot_token_change_me".to_string()
        });

        let jwt_signing_key = std::env::var("JWT_SIGNING_KEY").unwrap_or_else(|_| {
            tracing::warn!("JWT_SIGNING_KEY not set, using development key");
            "dev_jwt_key_change_me".to_string()
        });

        Self {
            bind_addr: env_or("BIND_ADDR", "127.0.0.1:3000"),
            db_url: env_or("DB_URL", "sqlite://data/propdesk.db"),
            cache_url: std::env::var("CACHE_URL").ok(),
            exchange_rest_url: env_or(
                "EXCHANGE_REST_URL",
                "https://api.binance.com/api/v3/ticker/price",
            ),
            exchange_stream_url: env_or(
                "EXCHANGE_STREAM_URL",
                "wss://stream.binance.com:9443/stream",
            ),
            platform_bot_token,
            jwt_signing_key,
            access_ttl_s: parse_env("ACCESS_TTL_S", 900),
            refresh_ttl_s: parse_env("REFRESH_TTL_S", 30 * 24 * 3600),
            price_stale_ms: parse_env("PRICE_STALE_MS", 5_000),
            eval_tick_ms: parse_env("EVAL_TICK_MS", 1_000),
            max_eval_concurrency: parse_env("MAX_EVAL_CONCURRENCY", default_concurrency),
            allowed_origins,
            symbols,
            requests_per_minute: parse_env("REQUESTS_PER_MINUTE", 300),
            request_timeout_s: parse_env("REQUEST_TIMEOUT_S", 15),
        }
    }

    pub fn price_stale_after(&self) -> Duration {
        Duration::from_millis(self.price_stale_ms)
    }

    pub fn eval_tick(&self) -> Duration {
        Duration::from_millis(self.eval_tick_ms)
    }
}
