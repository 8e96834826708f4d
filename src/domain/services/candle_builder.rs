//! Builds fixed-interval OHLC candles from the price feed's rolling buffer.
//!
//! Backs the kline endpoint. Volume is approximated by tick count since the
//! engine only sees prices, not traded size.

use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Candle {
    /// Bucket start, unix seconds.
    pub time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Aggregate timestamped prices into candles of `interval_secs`, newest last,
/// at most `limit` buckets. Points must be fed oldest-first, which is how the
/// feed buffer stores them.
pub fn build_candles(
    points: &[(DateTime<Utc>, f64)],
    interval_secs: i64,
    limit: usize,
) -> Vec<Candle> {
    if interval_secs <= 0 || points.is_empty() {
        return Vec::new();
    }

    let mut candles: Vec<Candle> = Vec::new();
    for (ts, price) in points {
        let bucket = ts.timestamp() - ts.timestamp().rem_euclid(interval_secs);
        match candles.last_mut() {
            Some(last) if last.time == bucket => {
                last.high = last.high.max(*price);
                last.low = last.low.min(*price);
                last.close = *price;
                last.volume += 1.0;
            }
            _ => candles.push(Candle {
                time: bucket,
                open: *price,
                high: *price,
                low: *price,
                close: *price,
                volume: 1.0,
            }),
        }
    }

    if candles.len() > limit {
        candles.drain(..candles.len() - limit);
    }
    candles
}

/// Parse an interval expressed in minutes (the exchange convention: "1",
/// "5", "60", "240").
pub fn interval_secs(interval: &str) -> Option<i64> {
    let minutes: i64 = interval.parse().ok()?;
    if minutes <= 0 || minutes > 24 * 60 {
        return None;
    }
    Some(minutes * 60)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn aggregates_into_buckets() {
        let points = vec![
            (at(0), 100.0),
            (at(10), 105.0),
            (at(30), 95.0),
            (at(59), 102.0),
            (at(60), 103.0),
            (at(90), 101.0),
        ];
        let candles = build_candles(&points, 60, 100);
        assert_eq!(candles.len(), 2);

        assert_eq!(candles[0].time, 0);
        assert_eq!(candles[0].open, 100.0);
        assert_eq!(candles[0].high, 105.0);
        assert_eq!(candles[0].low, 95.0);
        assert_eq!(candles[0].close, 102.0);
        assert_eq!(candles[0].volume, 4.0);

        assert_eq!(candles[1].time, 60);
        assert_eq!(candles[1].open, 103.0);
        assert_eq!(candles[1].close, 101.0);
    }

    #[test]
    fn respects_limit_keeping_newest() {
        let points: Vec<_> = (0..10).map(|i| (at(i * 60), i as f64)).collect();
        let candles = build_candles(&points, 60, 3);
        assert_eq!(candles.len(), 3);
        assert_eq!(candles[0].time, 7 * 60);
        assert_eq!(candles[2].time, 9 * 60);
    }

    #[test]
    fn empty_and_bad_interval() {
        assert!(build_candles(&[], 60, 10).is_empty());
        assert!(build_candles(&[(at(0), 1.0)], 0, 10).is_empty());
    }

    #[test]
    fn interval_parsing() {
        assert_eq!(interval_secs("1"), Some(60));
        assert_eq!(interval_secs("60"), Some(3_600));
        assert_eq!(interval_secs("240"), Some(14_400));
        assert_eq!(interval_secs("0"), None);
        assert_eq!(interval_secs("D"), None);
    }
}
