//! Price Feed
//!
//! Holds the last-known mark price per tracked symbol behind a single
//! writer, plus a short rolling buffer per symbol for candle endpoints.
//! Two long-lived tasks feed it: a REST seeder (startup and reconnect) and
//! a streaming consumer with capped exponential backoff.

use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch, RwLock};
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{debug, info, warn};

use crate::domain::errors::EngineError;
use crate::domain::services::circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError,
};
use crate::infrastructure::exchange::{parse_stream_frame, stream_url, ExchangeRestClient};

const SEED_ATTEMPTS: u32 = 5;
const RECONNECT_BASE: Duration = Duration::from_millis(500);
const RECONNECT_CAP: Duration = Duration::from_secs(30);
/// Rolling buffer retention per symbol, sized for a day of second-level ticks
/// aggregated into kline requests.
const BUFFER_CAPACITY: usize = 20_000;

#[derive(Debug, Clone)]
struct PricePoint {
    price: f64,
    timestamp: DateTime<Utc>,
    received_at: Instant,
}

/// A non-blocking read of the latest mark price.
#[derive(Debug, Clone, Copy)]
pub struct Quote {
    pub price: f64,
    pub staleness_ms: u64,
}

#[derive(Debug, Clone)]
pub struct PriceUpdate {
    pub symbol: String,
    pub price: f64,
    pub timestamp: DateTime<Utc>,
}

pub struct PriceFeed {
    prices: RwLock<HashMap<String, PricePoint>>,
    buffers: RwLock<HashMap<String, VecDeque<(DateTime<Utc>, f64)>>>,
    tx: broadcast::Sender<PriceUpdate>,
    symbols: Vec<String>,
    stale_after: Duration,
}

impl PriceFeed {
    pub fn new(symbols: Vec<String>, stale_after: Duration) -> Self {
        let (tx, _) = broadcast::channel(1_024);
        Self {
            prices: RwLock::new(HashMap::new()),
            buffers: RwLock::new(HashMap::new()),
            tx,
            symbols,
            stale_after,
        }
    }

    pub fn tracked_symbols(&self) -> &[String] {
        &self.symbols
    }

    pub fn is_tracked(&self, symbol: &str) -> bool {
        self.symbols.iter().any(|s| s == symbol)
    }

    /// Latest price with its staleness. None when never received.
    pub async fn latest(&self, symbol: &str) -> Option<Quote> {
        let prices = self.prices.read().await;
        prices.get(symbol).map(|p| Quote {
            price: p.price,
            staleness_ms: p.received_at.elapsed().as_millis() as u64,
        })
    }

    /// Latest price only if it is within the staleness threshold.
    pub async fn latest_fresh(&self, symbol: &str) -> Option<f64> {
        let quote = self.latest(symbol).await?;
        (quote.staleness_ms as u128 <= self.stale_after.as_millis()).then_some(quote.price)
    }

    pub fn stale_after(&self) -> Duration {
        self.stale_after
    }

    /// Consistent snapshot of every tracked quote, taken before the risk
    /// evaluator acquires any challenge lock.
    pub async fn snapshot(&self) -> HashMap<String, Quote> {
        let prices = self.prices.read().await;
        prices
            .iter()
            .map(|(symbol, p)| {
                (
                    symbol.clone(),
                    Quote {
                        price: p.price,
                        staleness_ms: p.received_at.elapsed().as_millis() as u64,
                    },
                )
            })
            .collect()
    }

    /// Each subscriber receives every update newer than the previous one
    /// delivered to it. No ordering across symbols.
    pub fn subscribe(&self) -> broadcast::Receiver<PriceUpdate> {
        self.tx.subscribe()
    }

    /// Rolling (timestamp, price) points for a symbol, oldest first.
    pub async fn buffer(&self, symbol: &str) -> Vec<(DateTime<Utc>, f64)> {
        let buffers = self.buffers.read().await;
        buffers
            .get(symbol)
            .map(|b| b.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Single-writer update path. Replaces the stored point only when the
    /// incoming timestamp is not older, keeping per-symbol timestamps
    /// monotonic for every consumer.
    pub async fn apply_update(&self, symbol: &str, price: f64, timestamp: DateTime<Utc>) {
        {
            let mut prices = self.prices.write().await;
            match prices.get(symbol) {
                Some(existing) if existing.timestamp > timestamp => return,
                _ => {
                    prices.insert(
                        symbol.to_string(),
                        PricePoint {
                            price,
                            timestamp,
                            received_at: Instant::now(),
                        },
                    );
                }
            }
        }
        {
            let mut buffers = self.buffers.write().await;
            let buffer = buffers.entry(symbol.to_string()).or_default();
            buffer.push_back((timestamp, price));
            while buffer.len() > BUFFER_CAPACITY {
                buffer.pop_front();
            }
        }
        let _ = self.tx.send(PriceUpdate {
            symbol: symbol.to_string(),
            price,
            timestamp,
        });
    }
}

/// Long-lived feed driver: seeds over REST, then consumes the stream,
/// reseeding after every reconnect.
pub struct PriceFeedRunner {
    feed: Arc<PriceFeed>,
    rest: ExchangeRestClient,
    breaker: CircuitBreaker,
    stream_base: String,
}

impl PriceFeedRunner {
    pub fn new(feed: Arc<PriceFeed>, rest: ExchangeRestClient, stream_base: String) -> Self {
        Self {
            feed,
            rest,
            breaker: CircuitBreaker::new(CircuitBreakerConfig::default()),
            stream_base,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        self.seed().await;

        let url = stream_url(&self.stream_base, self.feed.tracked_symbols());
        let mut backoff = RECONNECT_BASE;

        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.consume_stream(&url, &mut shutdown).await {
                StreamExit::Shutdown => break,
                StreamExit::Disconnected => {
                    let jitter = rand::thread_rng().gen_range(0..250);
                    let delay = backoff + Duration::from_millis(jitter);
                    warn!("price stream disconnected, reconnecting in {:?}", delay);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.changed() => break,
                    }
                    backoff = (backoff * 2).min(RECONNECT_CAP);
                    self.seed().await;
                }
                StreamExit::Connected => {
                    // Healthy session ran for a while; start backoff over
                    // and reseed before the next connect.
                    backoff = RECONNECT_BASE;
                    self.seed().await;
                }
            }
        }
        info!("price feed stopped");
    }

    /// REST snapshot with jittered retries behind the circuit breaker.
    /// Symbols never seeded remain unopenable for trading.
    async fn seed(&self) {
        for attempt in 1..=SEED_ATTEMPTS {
            let result = self.breaker.call(|| self.rest.fetch_snapshot()).await;
            match result {
                Ok(entries) => {
                    let now = Utc::now();
                    let mut seeded = 0usize;
                    for (symbol, price) in entries {
                        if self.feed.is_tracked(&symbol) {
                            self.feed.apply_update(&symbol, price, now).await;
                            seeded += 1;
                        }
                    }
                    info!("seeded {} symbols from snapshot", seeded);
                    return;
                }
                Err(CircuitBreakerError::CircuitOpen) => {
                    warn!("seed skipped, circuit breaker open");
                    return;
                }
                Err(CircuitBreakerError::OperationFailed(e)) => {
                    warn!("seed attempt {}/{} failed: {}", attempt, SEED_ATTEMPTS, e);
                    let jitter = rand::thread_rng().gen_range(0..500);
                    tokio::time::sleep(Duration::from_millis(200 * attempt as u64 + jitter))
                        .await;
                }
            }
        }
        warn!("seed gave up after {} attempts", SEED_ATTEMPTS);
    }

    async fn consume_stream(&self, url: &str, shutdown: &mut watch::Receiver<bool>) -> StreamExit {
        let (ws_stream, _) = match connect_async(url).await {
            Ok(ok) => ok,
            Err(e) => {
                warn!("price stream connect failed: {}", e);
                return StreamExit::Disconnected;
            }
        };
        info!("price stream connected");
        let (mut write, mut read) = ws_stream.split();
        let connected_at = Instant::now();

        loop {
            tokio::select! {
                _ = shutdown.changed() => return StreamExit::Shutdown,
                message = read.next() => match message {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(tick) = parse_stream_frame(&text) {
                            self.feed
                                .apply_update(&tick.symbol, tick.price, tick.timestamp)
                                .await;
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if write.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!("price stream error: {}", e);
                        break;
                    }
                },
            }
        }

        // Sessions that survived a minute count as healthy for backoff.
        if connected_at.elapsed() > Duration::from_secs(60) {
            StreamExit::Connected
        } else {
            StreamExit::Disconnected
        }
    }
}

enum StreamExit {
    Shutdown,
    Disconnected,
    Connected,
}

/// Validate a feed reading for order placement: the price must exist, be
/// seeded, and not be stale past the threshold.
pub async fn entry_price(feed: &PriceFeed, symbol: &str) -> Result<f64, EngineError> {
    if !feed.is_tracked(symbol) {
        return Err(EngineError::SymbolUnknown(symbol.to_string()));
    }
    match feed.latest(symbol).await {
        None => Err(EngineError::PriceUnavailable(format!(
            "{symbol} has never been seeded"
        ))),
        Some(quote) if quote.staleness_ms as u128 > feed.stale_after().as_millis() => Err(
            EngineError::PriceUnavailable(format!(
                "{symbol} price is {}ms stale",
                quote.staleness_ms
            )),
        ),
        Some(quote) => Ok(quote.price),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn feed() -> PriceFeed {
        PriceFeed::new(
            vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()],
            Duration::from_millis(5_000),
        )
    }

    fn at(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(ms).unwrap()
    }

    #[tokio::test]
    async fn latest_returns_none_before_seed() {
        let feed = feed();
        assert!(feed.latest("BTCUSDT").await.is_none());
    }

    #[tokio::test]
    async fn update_and_read_back() {
        let feed = feed();
        feed.apply_update("BTCUSDT", 50_000.0, at(1_000)).await;
        let quote = feed.latest("BTCUSDT").await.unwrap();
        assert_eq!(quote.price, 50_000.0);
        assert!(quote.staleness_ms < 1_000);
    }

    #[tokio::test]
    async fn older_timestamps_are_discarded() {
        let feed = feed();
        feed.apply_update("BTCUSDT", 50_000.0, at(2_000)).await;
        feed.apply_update("BTCUSDT", 49_000.0, at(1_000)).await;
        assert_eq!(feed.latest("BTCUSDT").await.unwrap().price, 50_000.0);

        // Equal timestamps replace (>= rule).
        feed.apply_update("BTCUSDT", 50_500.0, at(2_000)).await;
        assert_eq!(feed.latest("BTCUSDT").await.unwrap().price, 50_500.0);
    }

    #[tokio::test]
    async fn subscribers_see_updates() {
        let feed = feed();
        let mut rx = feed.subscribe();
        feed.apply_update("ETHUSDT", 3_000.0, at(5_000)).await;
        let update = rx.recv().await.unwrap();
        assert_eq!(update.symbol, "ETHUSDT");
        assert_eq!(update.price, 3_000.0);
    }

    #[tokio::test]
    async fn buffer_accumulates_in_order() {
        let feed = feed();
        for i in 0..5 {
            feed.apply_update("BTCUSDT", 100.0 + i as f64, at(i * 1_000)).await;
        }
        let buffer = feed.buffer("BTCUSDT").await;
        assert_eq!(buffer.len(), 5);
        assert_eq!(buffer[0].1, 100.0);
        assert_eq!(buffer[4].1, 104.0);
    }

    #[tokio::test]
    async fn entry_price_checks() {
        let feed = feed();
        assert!(matches!(
            entry_price(&feed, "XXXUSDT").await,
            Err(EngineError::SymbolUnknown(_))
        ));
        assert!(matches!(
            entry_price(&feed, "BTCUSDT").await,
            Err(EngineError::PriceUnavailable(_))
        ));
        feed.apply_update("BTCUSDT", 42_000.0, Utc::now()).await;
        assert_eq!(entry_price(&feed, "BTCUSDT").await.unwrap(), 42_000.0);
    }

    #[tokio::test]
    async fn stale_price_rejected_for_entry() {
        let feed = PriceFeed::new(vec!["BTCUSDT".to_string()], Duration::from_millis(0));
        feed.apply_update("BTCUSDT", 42_000.0, Utc::now()).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(matches!(
            entry_price(&feed, "BTCUSDT").await,
            Err(EngineError::PriceUnavailable(_))
        ));
    }
}
