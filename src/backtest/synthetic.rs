use crate::models::Candle;
use chrono::{DateTime, Duration, TimeZone, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Market scenario types for synthetic data generation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarketScenario {
    /// Steady uptrend with noise (+5% daily average)
    Uptrend,
    /// Steady downtrend with noise (-5% daily average)
    Downtrend,
    /// Mean-reverting chop around the base price
    Sideways,
    /// Large swings (±5% per candle)
    Volatile,
    /// Random walk with a missing candle every 50
    WithGaps,
    /// Slow rise, then a 25% slide over the second half
    Crash,
}

/// Seeded OHLCV generator for demos and tests
///
/// Output depends only on the seed and arguments, never on the clock.
pub struct SyntheticDataGenerator {
    rng: StdRng,
    base_price: f64,
    base_volume: f64,
    start: DateTime<Utc>,
}

impl SyntheticDataGenerator {
    /// Create a new generator with a seed for reproducibility
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            base_price: 150.0,
            base_volume: 1_000_000.0,
            start: Utc
                .with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
                .single()
                .unwrap_or_default(),
        }
    }

    pub fn with_base_price(mut self, base_price: f64) -> Self {
        self.base_price = base_price;
        self
    }

    pub fn with_start(mut self, start: DateTime<Utc>) -> Self {
        self.start = start;
        self
    }

    pub fn base_price(&self) -> f64 {
        self.base_price
    }

    /// Generate candles for a market scenario
    ///
    /// # Arguments
    /// * `scenario` - The market scenario to simulate
    /// * `num_candles` - Number of candle slots (gaps leave some empty)
    /// * `interval_minutes` - Minutes between candles
    pub fn generate(
        &mut self,
        scenario: MarketScenario,
        num_candles: usize,
        interval_minutes: i64,
    ) -> Vec<Candle> {
        let mut candles = Vec::with_capacity(num_candles);
        let mut price = self.base_price;
        let per_day = 24.0 * 60.0 / interval_minutes.max(1) as f64;

        for i in 0..num_candles {
            let open = price;
            price = match scenario {
                MarketScenario::Uptrend => {
                    price * (1.0 + 0.05 / per_day + self.rng.gen_range(-0.001..0.001))
                }
                MarketScenario::Downtrend => {
                    price * (1.0 - 0.05 / per_day + self.rng.gen_range(-0.001..0.001))
                }
                MarketScenario::Sideways => {
                    let reversion = (self.base_price - price) * 0.1;
                    price + reversion + price * self.rng.gen_range(-0.01..0.01)
                }
                MarketScenario::Volatile => {
                    (price * (1.0 + self.rng.gen_range(-0.05..0.05))).max(self.base_price * 0.5)
                }
                MarketScenario::WithGaps => price * (1.0 + self.rng.gen_range(-0.01..0.01)),
                MarketScenario::Crash => {
                    if i < num_candles / 2 {
                        price * (1.0 + self.rng.gen_range(-0.005..0.01))
                    } else {
                        let drop = -0.25 / (num_candles as f64 / 2.0);
                        price * (1.0 + drop + self.rng.gen_range(-0.005..0.005))
                    }
                }
            };

            if scenario == MarketScenario::WithGaps && i % 50 == 49 {
                continue;
            }

            let date = self.start + Duration::minutes(i as i64 * interval_minutes);
            candles.push(self.create_candle(date, open, price));
        }

        candles
    }

    /// Candle moving from `open` to `close` with some wick
    fn create_candle(&mut self, date: DateTime<Utc>, open: f64, close: f64) -> Candle {
        let wick = 0.002;
        let high = open.max(close) * (1.0 + self.rng.gen_range(0.0..wick));
        let low = open.min(close) * (1.0 - self.rng.gen_range(0.0..wick));
        let volume = self.base_volume * self.rng.gen_range(0.7..1.3);

        Candle::new(date, open, high, low, close, volume)
    }
}
