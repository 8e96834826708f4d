//! Wire-level adapter for the external market-data exchange.
//!
//! Two paths: a REST ticker snapshot used to seed the price map, and a
//! multiplexed trade stream delivering per-symbol updates. Both speak the
//! exchange's combined-stream conventions.

use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use std::time::Duration;

use crate::domain::errors::EngineError;
use crate::domain::value_objects::price::Price;

#[derive(Debug, Deserialize)]
struct TickerEntry {
    symbol: String,
    price: String,
}

/// REST client for the ticker snapshot endpoint.
#[derive(Clone)]
pub struct ExchangeRestClient {
    http: reqwest::Client,
    snapshot_url: String,
}

impl ExchangeRestClient {
    pub fn new(snapshot_url: &str) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            http,
            snapshot_url: snapshot_url.to_string(),
        }
    }

    /// Fetch the full ticker snapshot: `[{"symbol": "...", "price": "..."}]`.
    pub async fn fetch_snapshot(&self) -> Result<Vec<(String, f64)>, EngineError> {
        let response = self
            .http
            .get(&self.snapshot_url)
            .send()
            .await
            .map_err(|e| EngineError::Unavailable(format!("snapshot request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(EngineError::Unavailable(format!(
                "snapshot request returned {}",
                response.status()
            )));
        }

        let entries: Vec<TickerEntry> = response
            .json()
            .await
            .map_err(|e| EngineError::Unavailable(format!("snapshot decode failed: {e}")))?;

        Ok(entries
            .into_iter()
            .filter_map(|e| {
                let price = e.price.parse::<f64>().ok()?;
                Price::new(price).ok().map(|p| (e.symbol, p.value()))
            })
            .collect())
    }
}

/// Build the combined-stream URL subscribing to aggregate trades for the
/// tracked symbols.
pub fn stream_url(base: &str, symbols: &[String]) -> String {
    let streams: Vec<String> = symbols
        .iter()
        .map(|s| format!("{}@aggTrade", s.to_lowercase()))
        .collect();
    format!("{}?streams={}", base, streams.join("/"))
}

/// A parsed price tick from the stream.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamTick {
    pub symbol: String,
    pub price: f64,
    pub timestamp: DateTime<Utc>,
}

/// Parse one stream frame. Combined-stream frames wrap the payload in a
/// `data` envelope; raw frames carry it at the top level. Unknown frames
/// (subscription acks, heartbeats) yield None.
pub fn parse_stream_frame(text: &str) -> Option<StreamTick> {
    let value: serde_json::Value = serde_json::from_str(text).ok()?;
    let data = value.get("data").unwrap_or(&value);

    let symbol = data.get("s")?.as_str()?.to_string();
    let raw = data.get("p")?.as_str()?.parse::<f64>().ok()?;
    let price = Price::new(raw).ok()?.value();
    if price == 0.0 {
        return None;
    }
    let timestamp = data
        .get("T")
        .and_then(|t| t.as_i64())
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .unwrap_or_else(Utc::now);

    Some(StreamTick {
        symbol,
        price,
        timestamp,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_url_multiplexes_lowercased_symbols() {
        let url = stream_url(
            "wss://stream.example.com/stream",
            &["BTCUSDT".to_string(), "ETHUSDT".to_string()],
        );
        assert_eq!(
            url,
            "wss://stream.example.com/stream?streams=btcusdt@aggTrade/ethusdt@aggTrade"
        );
    }

    #[test]
    fn parses_enveloped_frame() {
        let frame = r#"{"stream":"btcusdt@aggTrade",
            "data":{"e":"aggTrade","s":"BTCUSDT","p":"50123.45","q":"0.3","T":1700000000000}}"#;
        let tick = parse_stream_frame(frame).unwrap();
        assert_eq!(tick.symbol, "BTCUSDT");
        assert_eq!(tick.price, 50_123.45);
        assert_eq!(tick.timestamp.timestamp_millis(), 1_700_000_000_000);
    }

    #[test]
    fn parses_bare_frame() {
        let frame = r#"{"e":"aggTrade","s":"ETHUSDT","p":"3000.1","T":1700000000500}"#;
        let tick = parse_stream_frame(frame).unwrap();
        assert_eq!(tick.symbol, "ETHUSDT");
        assert_eq!(tick.price, 3_000.1);
    }

    #[test]
    fn rejects_non_trade_frames() {
        assert!(parse_stream_frame(r#"{"result":null,"id":1}"#).is_none());
        assert!(parse_stream_frame("not json").is_none());
        assert!(parse_stream_frame(r#"{"s":"BTCUSDT","p":"-5","T":1}"#).is_none());
        assert!(parse_stream_frame(r#"{"s":"BTCUSDT","p":"abc","T":1}"#).is_none());
    }
}
