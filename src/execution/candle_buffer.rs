use crate::models::Candle;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

type CandleMap = HashMap<String, VecDeque<Candle>>;

/// Thread-safe rolling window of candles per pair
///
/// Feeds the strategy signal window in live mode.
#[derive(Clone)]
pub struct CandleBuffer {
    data: Arc<RwLock<CandleMap>>,
    max_candles: usize,
}

impl CandleBuffer {
    /// Create a new candle buffer
    ///
    /// # Arguments
    /// * `max_candles` - Maximum number of candles to keep per pair
    pub fn new(max_candles: usize) -> Self {
        Self {
            data: Arc::new(RwLock::new(HashMap::new())),
            max_candles: max_candles.max(1),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, CandleMap> {
        self.data.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, CandleMap> {
        self.data.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Append a candle for a pair
    ///
    /// A candle with the same date as the newest one replaces it; older
    /// candles are ignored.
    pub fn add_candle(&self, pair: &str, candle: Candle) {
        let mut data = self.write();
        let candles = data.entry(pair.to_string()).or_default();

        match candles.back() {
            Some(last) if last.date == candle.date => {
                candles.pop_back();
                candles.push_back(candle);
            }
            Some(last) if last.date > candle.date => {
                tracing::debug!("{}: ignoring out-of-order candle {}", pair, candle.date);
            }
            _ => candles.push_back(candle),
        }

        while candles.len() > self.max_candles {
            candles.pop_front();
        }
    }

    /// Get all candles for a pair, oldest first
    pub fn get_candles(&self, pair: &str) -> Vec<Candle> {
        self.read()
            .get(pair)
            .map(|deque| deque.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Get the N most recent candles for a pair
    pub fn get_recent_candles(&self, pair: &str, n: usize) -> Vec<Candle> {
        self.read()
            .get(pair)
            .map(|deque| deque.iter().skip(deque.len().saturating_sub(n)).cloned().collect())
            .unwrap_or_default()
    }

    pub fn candle_count(&self, pair: &str) -> usize {
        self.read().get(pair).map(|d| d.len()).unwrap_or(0)
    }

    pub fn clear_pair(&self, pair: &str) {
        self.write().remove(pair);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn create_test_candle(minute: i64, price: f64) -> Candle {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        Candle::flat(start + Duration::minutes(minute), price)
    }

    #[test]
    fn test_max_candles_limit() {
        let buffer = CandleBuffer::new(5);

        for i in 0..10 {
            buffer.add_candle("SOL/USDT", create_test_candle(i, 100.0 + i as f64));
        }

        let candles = buffer.get_candles("SOL/USDT");
        assert_eq!(candles.len(), 5);
        assert_eq!(candles[0].close, 105.0);
        assert_eq!(candles[4].close, 109.0);
    }

    #[test]
    fn test_same_date_replaces_last() {
        let buffer = CandleBuffer::new(10);
        buffer.add_candle("SOL/USDT", create_test_candle(0, 100.0));
        buffer.add_candle("SOL/USDT", create_test_candle(0, 101.0));
        buffer.add_candle("SOL/USDT", create_test_candle(-5, 90.0));

        let candles = buffer.get_candles("SOL/USDT");
        assert_eq!(candles.len(), 1);
        assert_eq!(candles[0].close, 101.0);
    }

    #[test]
    fn test_get_recent_candles() {
        let buffer = CandleBuffer::new(100);
        for i in 0..10 {
            buffer.add_candle("SOL/USDT", create_test_candle(i, 100.0 + i as f64));
        }

        let recent = buffer.get_recent_candles("SOL/USDT", 3);
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].close, 107.0);
        assert_eq!(recent[2].close, 109.0);
        assert!(buffer.get_recent_candles("JUP/USDT", 3).is_empty());
    }

    #[test]
    fn test_clear_pair() {
        let buffer = CandleBuffer::new(100);
        buffer.add_candle("SOL/USDT", create_test_candle(0, 100.0));
        buffer.add_candle("JUP/USDT", create_test_candle(0, 200.0));

        buffer.clear_pair("SOL/USDT");

        assert_eq!(buffer.candle_count("SOL/USDT"), 0);
        assert_eq!(buffer.candle_count("JUP/USDT"), 1);
    }

    #[test]
    fn test_thread_safety() {
        use std::thread;

        let buffer = CandleBuffer::new(100);
        let buffer_clone = buffer.clone();

        let handle = thread::spawn(move || {
            for i in 0..50 {
                buffer_clone.add_candle("ETH/USDT", create_test_candle(i, 100.0));
            }
        });

        for i in 0..50 {
            buffer.add_candle("SOL/USDT", create_test_candle(i, 100.0));
        }

        handle.join().unwrap();

        assert_eq!(buffer.candle_count("SOL/USDT"), 50);
        assert_eq!(buffer.candle_count("ETH/USDT"), 50);
    }
}
