use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

/// Number of trades the live ticker keeps for display.
pub const DEFAULT_TICKER_CAPACITY: usize = 20;

/// A single trade print from the push feed.
///
/// The feed uses one-letter keys (`p`, `s`, `t`, `v`); the service
/// re-serialises with descriptive names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    #[serde(alias = "p")]
    pub price: f64,
    #[serde(alias = "s")]
    pub symbol: String,
    /// Trade time in milliseconds since the UNIX epoch.
    #[serde(alias = "t")]
    pub timestamp_ms: i64,
    #[serde(alias = "v", default)]
    pub volume: f64,
}

/// Bounded, newest-first list of trades.
///
/// Each batch is prepended as a unit, keeping the batch's own order, and the
/// list is then cut back to `capacity`. Arrival order is the only ordering:
/// nothing is deduplicated or sorted by timestamp.
#[derive(Debug, Clone)]
pub struct TradeBuffer {
    trades: VecDeque<Trade>,
    capacity: usize,
}

impl TradeBuffer {
    /// Create an empty buffer. A capacity of zero is raised to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            trades: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Prepend `batch` ahead of everything buffered and drop the overflow.
    pub fn push_batch(&mut self, batch: Vec<Trade>) {
        if batch.is_empty() {
            return;
        }
        // Only the leading `capacity` records of an oversized batch can survive.
        let keep = batch.len().min(self.capacity);
        for trade in batch.into_iter().take(keep).rev() {
            self.trades.push_front(trade);
        }
        self.trades.truncate(self.capacity);
    }

    pub fn len(&self) -> usize {
        self.trades.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trades.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Most recently received trade.
    pub fn newest(&self) -> Option<&Trade> {
        self.trades.front()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Trade> {
        self.trades.iter()
    }

    /// Newest-first copy of the buffer.
    pub fn to_vec(&self) -> Vec<Trade> {
        self.trades.iter().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.trades.clear();
    }
}

impl Default for TradeBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_TICKER_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trade(symbol: &str, price: f64, ts: i64) -> Trade {
        Trade {
            price,
            symbol: symbol.to_string(),
            timestamp_ms: ts,
            volume: 1.0,
        }
    }

    #[test]
    fn batch_is_prepended_in_its_own_order() {
        let mut buf = TradeBuffer::new(10);
        buf.push_batch(vec![trade("AAPL", 1.0, 1), trade("AAPL", 2.0, 2)]);
        buf.push_batch(vec![trade("AMZN", 3.0, 3), trade("AMZN", 4.0, 4)]);

        let prices: Vec<f64> = buf.iter().map(|t| t.price).collect();
        assert_eq!(prices, vec![3.0, 4.0, 1.0, 2.0]);
        assert_eq!(buf.newest().unwrap().price, 3.0);
    }

    #[test]
    fn length_is_min_of_capacity_and_total_received() {
        let mut buf = TradeBuffer::new(DEFAULT_TICKER_CAPACITY);
        let batch_sizes = [1usize, 3, 7, 2, 9, 1, 25, 4];
        let mut total = 0usize;
        let mut ts = 0i64;

        for size in batch_sizes {
            let batch: Vec<Trade> = (0..size)
                .map(|_| {
                    ts += 1;
                    trade("BINANCE:BTCUSDT", ts as f64, ts)
                })
                .collect();
            let first = batch[0].clone();
            total += size;
            buf.push_batch(batch);

            assert_eq!(buf.len(), total.min(DEFAULT_TICKER_CAPACITY));
            assert!(buf.len() <= buf.capacity());
            assert_eq!(buf.newest(), Some(&first));
        }
    }

    #[test]
    fn oversized_batch_keeps_its_leading_records() {
        let mut buf = TradeBuffer::new(3);
        buf.push_batch(vec![trade("X", 0.0, 0)]);
        buf.push_batch((1..=5).map(|i| trade("Y", i as f64, i)).collect());

        let prices: Vec<f64> = buf.iter().map(|t| t.price).collect();
        assert_eq!(prices, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn out_of_order_timestamps_are_not_reordered() {
        let mut buf = TradeBuffer::new(5);
        buf.push_batch(vec![trade("AAPL", 1.0, 200)]);
        buf.push_batch(vec![trade("AAPL", 2.0, 100)]);
        assert_eq!(buf.newest().unwrap().timestamp_ms, 100);
    }

    #[test]
    fn empty_batch_is_a_no_op() {
        let mut buf = TradeBuffer::new(2);
        buf.push_batch(Vec::new());
        assert!(buf.is_empty());
    }

    #[test]
    fn trade_decodes_feed_keys() {
        let json = r#"{"p":187.12,"s":"AAPL","t":1700000000123,"v":50,"c":["1","12"]}"#;
        let t: Trade = serde_json::from_str(json).unwrap();
        assert_eq!(t.symbol, "AAPL");
        assert_eq!(t.timestamp_ms, 1_700_000_000_123);
        assert!((t.volume - 50.0).abs() < f64::EPSILON);

        let out = serde_json::to_value(&t).unwrap();
        assert_eq!(out["price"], 187.12);
    }
}
