use crate::error::EngineError;
use crate::models::Candle;
use crate::Result;
use chrono::{DateTime, TimeZone, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use serde::{Deserialize, Serialize};
use tokio::time::{timeout, Duration};

/// One OHLCV row as stored in Redis: `[timestamp, open, high, low, close, volume]`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
struct StoredCandle(i64, f64, f64, f64, f64, f64);

impl From<&Candle> for StoredCandle {
    fn from(c: &Candle) -> Self {
        StoredCandle(c.date.timestamp(), c.open, c.high, c.low, c.close, c.volume)
    }
}

impl StoredCandle {
    fn into_candle(self) -> Option<Candle> {
        let date = Utc.timestamp_opt(self.0, 0).single()?;
        Some(Candle::new(date, self.1, self.2, self.3, self.4, self.5))
    }
}

/// Sorted-set key for a pair's candles at one timeframe
pub fn ohlcv_key(pair: &str, timeframe_minutes: i64) -> String {
    format!("ohlcv:{}:{}m", pair, timeframe_minutes)
}

/// Redis persistence for OHLCV history
///
/// Uses sorted sets with timestamps as scores for efficient time-range queries
pub struct RedisPersistence {
    conn: ConnectionManager,
}

impl RedisPersistence {
    /// Connect to Redis
    ///
    /// # Arguments
    /// * `redis_url` - Redis connection URL (e.g., "redis://127.0.0.1:6379")
    pub async fn new(redis_url: &str) -> Result<Self> {
        let client = Client::open(redis_url)?;

        // Add 5 second timeout to connection attempt
        let conn = timeout(Duration::from_secs(5), ConnectionManager::new(client))
            .await
            .map_err(|_| EngineError::Timeout("Redis connection timeout after 5 seconds".to_string()))??;

        tracing::info!("Connected to Redis at {}", redis_url);

        Ok(Self { conn })
    }

    /// Save candles, replacing any stored candle with the same timestamp
    pub async fn save_candles(
        &mut self,
        pair: &str,
        timeframe_minutes: i64,
        candles: &[Candle],
    ) -> Result<()> {
        let key = ohlcv_key(pair, timeframe_minutes);

        for candle in candles {
            let value = serde_json::to_string(&StoredCandle::from(candle))?;
            let score = candle.date.timestamp() as f64;

            let _: () = redis::pipe()
                .atomic()
                .zrembyscore(&key, score, score)
                .ignore()
                .zadd(&key, value, score)
                .ignore()
                .query_async(&mut self.conn)
                .await?;
        }

        tracing::debug!("Saved {} candles to {}", candles.len(), key);

        Ok(())
    }

    /// Load candles with `from <= date <= to`, oldest first
    pub async fn load_range(
        &mut self,
        pair: &str,
        timeframe_minutes: i64,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Candle>> {
        let key = ohlcv_key(pair, timeframe_minutes);
        let rows: Vec<String> = self
            .conn
            .zrangebyscore(&key, from.timestamp() as f64, to.timestamp() as f64)
            .await?;

        let candles = decode_rows(&rows)?;
        tracing::info!("Loaded {} candles from {}", candles.len(), key);
        Ok(candles)
    }

    /// Load the newest `count` candles, oldest first
    pub async fn load_recent(
        &mut self,
        pair: &str,
        timeframe_minutes: i64,
        count: usize,
    ) -> Result<Vec<Candle>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let key = ohlcv_key(pair, timeframe_minutes);
        let rows: Vec<String> = self.conn.zrange(&key, -(count as isize), -1).await?;
        decode_rows(&rows)
    }

    /// Remove candles older than `before`
    pub async fn prune(
        &mut self,
        pair: &str,
        timeframe_minutes: i64,
        before: DateTime<Utc>,
    ) -> Result<usize> {
        let key = ohlcv_key(pair, timeframe_minutes);
        let removed: usize = self
            .conn
            .zrembyscore(&key, "-inf", format!("({}", before.timestamp()))
            .await?;

        if removed > 0 {
            tracing::debug!("Pruned {} old candles from {}", removed, key);
        }

        Ok(removed)
    }

    pub async fn count_candles(&mut self, pair: &str, timeframe_minutes: i64) -> Result<usize> {
        let count: usize = self.conn.zcard(ohlcv_key(pair, timeframe_minutes)).await?;
        Ok(count)
    }
}

fn decode_rows(rows: &[String]) -> Result<Vec<Candle>> {
    let mut candles = Vec::with_capacity(rows.len());
    for row in rows {
        let stored: StoredCandle = serde_json::from_str(row)?;
        match stored.into_candle() {
            Some(candle) => candles.push(candle),
            None => tracing::warn!("Skipping candle with invalid timestamp {}", stored.0),
        }
    }
    Ok(candles)
}
