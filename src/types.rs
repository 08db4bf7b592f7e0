//! Shared market data types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single market tick (trade print) from the venue feed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tick {
    pub symbol: String,
    pub price: f64,
    pub size: u32,
    pub timestamp: DateTime<Utc>,
}

/// OHLCV candle for a fixed time bucket
///
/// Identified by (symbol, timestamp) where timestamp is bucket-aligned.
/// Immutable once emitted as completed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    pub symbol: String,

    /// Bucket start time (aligned to the bucket width)
    pub timestamp: DateTime<Utc>,

    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,

    /// Total contracts traded in the bucket
    pub volume: u64,

    /// Number of ticks folded into the bucket
    pub tick_count: u32,
}

impl Candle {
    /// Absolute body size |close - open|
    pub fn body(&self) -> f64 {
        (self.close - self.open).abs()
    }

    /// Top of the candle body (max of open/close)
    pub fn body_top(&self) -> f64 {
        self.close.max(self.open)
    }

    /// Bottom of the candle body (min of open/close)
    pub fn body_bottom(&self) -> f64 {
        self.close.min(self.open)
    }

    /// Wick above the body
    pub fn upper_wick(&self) -> f64 {
        self.high - self.body_top()
    }

    /// Wick below the body
    pub fn lower_wick(&self) -> f64 {
        self.body_bottom() - self.low
    }

    /// Full high-low range
    pub fn range(&self) -> f64 {
        self.high - self.low
    }

    /// Synthetic gap-fill candles carry no volume and no ticks
    pub fn is_synthetic(&self) -> bool {
        self.volume == 0 && self.tick_count == 0
    }

    /// Build a flat synthetic candle at `price` (used for short gap fill)
    pub fn synthetic(symbol: &str, timestamp: DateTime<Utc>, price: f64) -> Self {
        Self {
            symbol: symbol.to_string(),
            timestamp,
            open: price,
            high: price,
            low: price,
            close: price,
            volume: 0,
            tick_count: 0,
        }
    }
}

/// Align a timestamp down to the start of its bucket
pub fn bucket_start(ts: DateTime<Utc>, width_secs: i64) -> DateTime<Utc> {
    let secs = ts.timestamp();
    let aligned = secs - secs.rem_euclid(width_secs);
    DateTime::from_timestamp(aligned, 0).unwrap_or(ts)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(open: f64, high: f64, low: f64, close: f64) -> Candle {
        Candle {
            symbol: "NQ.c.0".to_string(),
            timestamp: Utc::now(),
            open,
            high,
            low,
            close,
            volume: 100,
            tick_count: 10,
        }
    }

    #[test]
    fn test_candle_anatomy() {
        let c = candle(15290.0, 15350.0, 15285.0, 15305.0);
        assert_eq!(c.body(), 15.0);
        assert_eq!(c.body_top(), 15305.0);
        assert_eq!(c.upper_wick(), 45.0);
        assert_eq!(c.lower_wick(), 5.0);
        assert_eq!(c.range(), 65.0);
    }

    #[test]
    fn test_bucket_alignment() {
        let ts = DateTime::from_timestamp(1_700_000_037, 0).unwrap();
        let aligned = bucket_start(ts, 60);
        assert_eq!(aligned.timestamp(), 1_699_999_980);
        assert_eq!(aligned.timestamp() % 60, 0);

        // Already aligned timestamps are unchanged
        assert_eq!(bucket_start(aligned, 60), aligned);
    }

    #[test]
    fn test_synthetic_candle() {
        let ts = Utc::now();
        let c = Candle::synthetic("NQ.c.0", ts, 15300.0);
        assert!(c.is_synthetic());
        assert_eq!(c.open, 15300.0);
        assert_eq!(c.range(), 0.0);
    }
}
