//! Tick-to-candle aggregation
//!
//! Folds ticks into fixed-width OHLCV buckets, one open bucket per symbol.
//! Emits each completed (symbol, bucket) exactly once and fills short gaps
//! with synthetic flat candles so downstream consumers see a contiguous
//! sequence.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use tracing::{debug, warn};

use crate::types::{bucket_start, Candle, Tick};

/// In-progress bucket for one symbol
#[derive(Debug, Clone)]
struct OpenBucket {
    bucket: DateTime<Utc>,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: u64,
    tick_count: u32,
}

impl OpenBucket {
    fn new(bucket: DateTime<Utc>, tick: &Tick) -> Self {
        Self {
            bucket,
            open: tick.price,
            high: tick.price,
            low: tick.price,
            close: tick.price,
            volume: tick.size as u64,
            tick_count: 1,
        }
    }

    fn fold(&mut self, tick: &Tick) {
        self.high = self.high.max(tick.price);
        self.low = self.low.min(tick.price);
        self.close = tick.price;
        self.volume += tick.size as u64;
        self.tick_count += 1;
    }

    fn finalize(&self, symbol: &str) -> Candle {
        Candle {
            symbol: symbol.to_string(),
            timestamp: self.bucket,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
            tick_count: self.tick_count,
        }
    }
}

/// Folds ticks into candles, one open bucket per symbol
pub struct CandleAggregator {
    width_secs: i64,
    max_gap_fill: u32,
    open: HashMap<String, OpenBucket>,
}

impl CandleAggregator {
    pub fn new(width_secs: i64, max_gap_fill: u32) -> Self {
        Self {
            width_secs,
            max_gap_fill,
            open: HashMap::new(),
        }
    }

    /// Process one tick; returns any candles completed by it, in order
    ///
    /// When the tick opens a new bucket, the previous bucket is finalized.
    /// A gap of up to `max_gap_fill` missing buckets is bridged with flat
    /// synthetic candles at the prior close; larger gaps are left absent.
    /// Ticks that fall before the open bucket are dropped and logged.
    pub fn on_tick(&mut self, tick: &Tick) -> Vec<Candle> {
        let bucket = bucket_start(tick.timestamp, self.width_secs);

        let current = match self.open.get_mut(&tick.symbol) {
            Some(current) => current,
            None => {
                self.open
                    .insert(tick.symbol.clone(), OpenBucket::new(bucket, tick));
                return Vec::new();
            }
        };

        if bucket == current.bucket {
            current.fold(tick);
            return Vec::new();
        }

        if bucket < current.bucket {
            warn!(
                "Out-of-order tick for {} at {} (open bucket {}), dropped",
                tick.symbol, tick.timestamp, current.bucket
            );
            return Vec::new();
        }

        // Tick belongs to a later bucket: finalize the open one
        let completed = current.finalize(&tick.symbol);
        let prior_close = completed.close;
        let prior_bucket = completed.timestamp;
        let mut out = vec![completed];

        let missing = (bucket - prior_bucket).num_seconds() / self.width_secs - 1;
        if missing > 0 {
            if missing <= self.max_gap_fill as i64 {
                for i in 1..=missing {
                    let ts = prior_bucket + Duration::seconds(i * self.width_secs);
                    out.push(Candle::synthetic(&tick.symbol, ts, prior_close));
                }
            } else {
                debug!(
                    "Gap of {} buckets for {} exceeds fill bound {}, leaving absent",
                    missing, tick.symbol, self.max_gap_fill
                );
            }
        }

        self.open
            .insert(tick.symbol.clone(), OpenBucket::new(bucket, tick));
        out
    }

    /// Finalize every open bucket (called on shutdown)
    pub fn force_finalize_all(&mut self) -> Vec<Candle> {
        let mut out: Vec<Candle> = self
            .open
            .drain()
            .map(|(symbol, bucket)| bucket.finalize(&symbol))
            .collect();
        out.sort_by_key(|c| (c.symbol.clone(), c.timestamp));
        out
    }

    /// Number of symbols with an open bucket
    pub fn open_buckets(&self) -> usize {
        self.open.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tick(symbol: &str, secs: i64, price: f64) -> Tick {
        Tick {
            symbol: symbol.to_string(),
            price,
            size: 1,
            timestamp: DateTime::from_timestamp(secs, 0).unwrap(),
        }
    }

    #[test]
    fn test_ohlcv_per_bucket() {
        let mut agg = CandleAggregator::new(60, 2);
        let base = 1_700_000_040; // bucket-aligned (divisible by 60)

        assert!(agg.on_tick(&tick("NQ", base, 100.0)).is_empty());
        assert!(agg.on_tick(&tick("NQ", base + 10, 105.0)).is_empty());
        assert!(agg.on_tick(&tick("NQ", base + 20, 95.0)).is_empty());
        assert!(agg.on_tick(&tick("NQ", base + 30, 102.0)).is_empty());

        let out = agg.on_tick(&tick("NQ", base + 60, 101.0));
        assert_eq!(out.len(), 1);
        let c = &out[0];
        assert_eq!(c.open, 100.0);
        assert_eq!(c.high, 105.0);
        assert_eq!(c.low, 95.0);
        assert_eq!(c.close, 102.0);
        assert_eq!(c.volume, 4);
        assert_eq!(c.tick_count, 4);
        assert_eq!(c.timestamp.timestamp(), base);
    }

    #[test]
    fn test_short_gap_filled_with_synthetic_candles() {
        let mut agg = CandleAggregator::new(60, 2);
        let base = 1_700_000_040;

        agg.on_tick(&tick("NQ", base, 100.0));
        // Next tick is 3 buckets later: 2 missing buckets, within the bound
        let out = agg.on_tick(&tick("NQ", base + 180, 110.0));

        assert_eq!(out.len(), 3);
        assert_eq!(out[0].close, 100.0);
        assert!(!out[0].is_synthetic());
        assert!(out[1].is_synthetic());
        assert!(out[2].is_synthetic());
        assert_eq!(out[1].close, 100.0);
        assert_eq!(out[1].timestamp.timestamp(), base + 60);
        assert_eq!(out[2].timestamp.timestamp(), base + 120);
    }

    #[test]
    fn test_large_gap_left_absent() {
        let mut agg = CandleAggregator::new(60, 2);
        let base = 1_700_000_040;

        agg.on_tick(&tick("NQ", base, 100.0));
        // 5 missing buckets, beyond the fill bound
        let out = agg.on_tick(&tick("NQ", base + 360, 110.0));

        assert_eq!(out.len(), 1);
        assert!(!out[0].is_synthetic());
    }

    #[test]
    fn test_out_of_order_tick_dropped() {
        let mut agg = CandleAggregator::new(60, 2);
        let base = 1_700_000_040;

        agg.on_tick(&tick("NQ", base + 60, 100.0));
        let out = agg.on_tick(&tick("NQ", base, 90.0));
        assert!(out.is_empty());

        // Open bucket unaffected by the dropped tick
        let out = agg.on_tick(&tick("NQ", base + 120, 101.0));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].low, 100.0);
    }

    #[test]
    fn test_symbols_are_independent() {
        let mut agg = CandleAggregator::new(60, 2);
        let base = 1_700_000_040;

        agg.on_tick(&tick("NQ", base, 100.0));
        agg.on_tick(&tick("ES", base, 4500.0));

        let out = agg.on_tick(&tick("NQ", base + 60, 101.0));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].symbol, "NQ");
        assert_eq!(agg.open_buckets(), 2);
    }

    #[test]
    fn test_force_finalize_all() {
        let mut agg = CandleAggregator::new(60, 2);
        let base = 1_700_000_040;

        agg.on_tick(&tick("NQ", base, 100.0));
        agg.on_tick(&tick("ES", base, 4500.0));

        let out = agg.force_finalize_all();
        assert_eq!(out.len(), 2);
        assert_eq!(agg.open_buckets(), 0);
        assert!(agg.force_finalize_all().is_empty());
    }
}
