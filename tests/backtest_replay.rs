use chrono::{DateTime, Duration, TimeZone, Utc};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use tradecore::backtest::{
    BacktestData, BacktestMetrics, BacktestRunner, MarketScenario, SyntheticDataGenerator,
};
use tradecore::config::StakeAmount;
use tradecore::execution::{RoiTable, Trade};
use tradecore::strategy::SmaCrossStrategy;
use tradecore::*;

/// Enters whenever flat; adds one more stake once the trade is 2% under water
struct AveragingDown;

impl Strategy for AveragingDown {
    fn name(&self) -> &str {
        "AveragingDown"
    }

    fn signal(&self, _pair: &str, _window: &[Candle]) -> Result<SignalSet> {
        Ok(SignalSet::entry(Some("always")))
    }

    fn adjust_trade_position(
        &self,
        trade: &Trade,
        _now: DateTime<Utc>,
        _current_rate: f64,
        current_profit: f64,
        _min_stake: Option<f64>,
        _max_stake: f64,
    ) -> Result<Option<f64>> {
        if trade.nr_of_successful_entries() == 1 && current_profit < -0.02 {
            return Ok(Some(10.0));
        }
        Ok(None)
    }
}

fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

fn candles(prices: &[(f64, f64, f64, f64)]) -> Vec<Candle> {
    prices
        .iter()
        .enumerate()
        .map(|(i, &(open, high, low, close))| {
            Candle::new(start() + Duration::minutes(i as i64 * 5), open, high, low, close, 100.0)
        })
        .collect()
}

fn small_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.stake_amount = Some(StakeAmount::Fixed(10.0));
    config.max_open_trades = 1;
    config.fee = 0.0;
    config.dry_run_wallet = 100.0;
    config.exit_rules.minimal_roi = RoiTable::new([(0, 0.5)]);
    config.exit_rules.stoploss = -0.5;
    config
}

fn synthetic_data(seed: u64, scenario: MarketScenario, count: usize) -> BacktestData {
    let mut candles = BTreeMap::new();
    for (i, pair) in ["BTC/USDT", "ETH/USDT"].iter().enumerate() {
        let mut generator = SyntheticDataGenerator::new(seed + i as u64);
        candles.insert(pair.to_string(), generator.generate(scenario, count, 5));
    }
    BacktestData::new(candles)
}

#[test]
fn test_replay_is_deterministic() {
    tracing_subscriber::fmt()
        .with_env_filter("tradecore=info")
        .try_init()
        .ok();

    let data = synthetic_data(7, MarketScenario::Volatile, 600);

    let run = || {
        BacktestRunner::new(EngineConfig::default(), Arc::new(SmaCrossStrategy::default()))
            .unwrap()
            .run(&data)
            .unwrap()
    };

    let first = run();
    let second = run();

    assert_eq!(first.to_json().unwrap(), second.to_json().unwrap());
    assert!(first.open_trades.is_empty());
    assert!(first.trades.iter().all(|t| !t.is_open));
    assert!((first.final_balance - first.starting_balance - first.total_profit()).abs() < 1e-9);
}

#[test]
fn test_position_adjustment_averages_entry() {
    let mut config = small_config();
    config.position_adjustment.enabled = true;
    config.position_adjustment.max_entry_position_adjustment = 1;

    let mut data = BTreeMap::new();
    data.insert(
        "BTC/USDT".to_string(),
        candles(&[
            (1.0, 1.0, 1.0, 1.0),
            (1.0, 1.01, 0.99, 1.0),
            // Opens 20% down: 10 more stake at the open, before the candle's range plays out
            (0.8, 0.91, 0.79, 0.9),
            (0.85, 0.86, 0.84, 0.85),
        ]),
    );

    let result = BacktestRunner::new(config, Arc::new(AveragingDown))
        .unwrap()
        .run(&BacktestData::new(data))
        .unwrap();

    assert_eq!(result.trades.len(), 1);
    let trade = &result.trades[0];
    assert_eq!(trade.nr_of_successful_entries(), 2);
    assert!((trade.total_entry_amount() - 22.5).abs() < 1e-9);
    assert!((trade.open_rate - 20.0 / 22.5).abs() < 1e-9);

    // Force exit at the last candle's open
    assert_eq!(trade.exit_reason, Some(ExitType::ForceExit));
    assert_eq!(trade.close_rate, Some(0.85));
    assert!((trade.close_profit_abs.unwrap() - (22.5 * 0.85 - 20.0)).abs() < 1e-6);
}

#[test]
fn test_open_trades_force_exited_at_end() {
    struct HoldForever;

    impl Strategy for HoldForever {
        fn name(&self) -> &str {
            "HoldForever"
        }

        fn signal(&self, _pair: &str, _window: &[Candle]) -> Result<SignalSet> {
            Ok(SignalSet::entry(None))
        }
    }

    let mut config = small_config();
    config.max_open_trades = 2;
    config.exit_rules.minimal_roi = RoiTable::new([(0, 10.0)]);
    config.exit_rules.stoploss = -0.99;

    let data = synthetic_data(3, MarketScenario::Uptrend, 200);
    let result = BacktestRunner::new(config, Arc::new(HoldForever))
        .unwrap()
        .run(&data)
        .unwrap();

    assert_eq!(result.trades.len(), 2);
    assert!(result.open_trades.is_empty());
    for trade in &result.trades {
        assert_eq!(trade.exit_reason, Some(ExitType::ForceExit));
        let last = data.candles[&trade.pair].last().unwrap();
        assert_eq!(trade.close_rate, Some(last.open));
        assert_eq!(trade.close_date, Some(last.date));
    }

    let metrics = BacktestMetrics::from_result(&result);
    assert_eq!(metrics.strategy, "HoldForever");
    assert_eq!(metrics.total_trades, 2);
    assert_eq!(metrics.exit_reasons.get(&ExitType::ForceExit), Some(&2));
}

#[test]
fn test_abort_stops_replay() {
    let data = synthetic_data(11, MarketScenario::Sideways, 300);
    let runner =
        BacktestRunner::new(EngineConfig::default(), Arc::new(SmaCrossStrategy::default())).unwrap();

    runner.abort_handle().store(true, Ordering::SeqCst);
    let result = runner.run(&data).unwrap();

    assert!(result.aborted);
    assert!(result.trades.is_empty());
    assert_eq!(result.final_balance, result.starting_balance);
}

/// Always wants a position; raises the abort flag on its `stop_after`-th signal
struct AbortAfter {
    stop_after: usize,
    calls: AtomicUsize,
    abort: OnceLock<Arc<AtomicBool>>,
}

impl Strategy for AbortAfter {
    fn name(&self) -> &str {
        "AbortAfter"
    }

    fn signal(&self, _pair: &str, _window: &[Candle]) -> Result<SignalSet> {
        let calls = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if calls == self.stop_after {
            if let Some(abort) = self.abort.get() {
                abort.store(true, Ordering::SeqCst);
            }
        }
        Ok(SignalSet::entry(None))
    }
}

#[test]
fn test_abort_mid_run_leaves_trades_open() {
    let mut config = small_config();
    config.exit_rules.minimal_roi = RoiTable::new([(0, 0.10)]);

    let mut data = BTreeMap::new();
    data.insert(
        "BTC/USDT".to_string(),
        candles(&[
            (1.0, 1.0, 1.0, 1.0),
            (1.0, 1.01, 0.99, 1.0),  // entry
            (1.0, 1.15, 0.99, 1.12), // ROI exit at 1.1
            (1.0, 1.01, 0.99, 1.0),  // re-entry, abort raised
            (1.02, 1.03, 0.99, 1.0), // never replayed
        ]),
    );

    // The first candle has no history, so signals start on the second
    let strategy = Arc::new(AbortAfter {
        stop_after: 3,
        calls: AtomicUsize::new(0),
        abort: OnceLock::new(),
    });
    let runner = BacktestRunner::new(config, strategy.clone()).unwrap();
    strategy.abort.set(runner.abort_handle()).unwrap();

    let result = runner.run(&BacktestData::new(data)).unwrap();

    assert!(result.aborted);
    assert_eq!(result.trades.len(), 1);
    let closed = &result.trades[0];
    assert_eq!(closed.exit_reason, Some(ExitType::Roi));
    assert!((closed.close_profit_abs.unwrap() - 1.0).abs() < 1e-6);

    assert_eq!(result.open_trades.len(), 1);
    let open = &result.open_trades[0];
    assert!(open.is_open);
    assert_eq!(open.close_rate, None);
    assert_eq!(open.open_date, start() + Duration::minutes(15));
    assert!((result.final_balance - 101.0).abs() < 1e-6);
}
