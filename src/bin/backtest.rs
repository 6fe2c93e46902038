use anyhow::Context;
use chrono::{Duration, Utc};
use clap::{Parser, ValueEnum};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tradecore::backtest::{
    BacktestData, BacktestMetrics, BacktestRunner, MarketScenario, SyntheticDataGenerator,
};
use tradecore::persistence::RedisPersistence;
use tradecore::strategy::SmaCrossStrategy;
use tradecore::{Candle, EngineConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Scenario {
    All,
    Uptrend,
    Downtrend,
    Sideways,
    Volatile,
    Gaps,
    Crash,
}

impl Scenario {
    fn market_scenarios(self) -> Vec<(MarketScenario, &'static str)> {
        let all = vec![
            (MarketScenario::Uptrend, "📈 Uptrend (+5% daily)"),
            (MarketScenario::Downtrend, "📉 Downtrend (-5% daily)"),
            (MarketScenario::Sideways, "↔️  Sideways (mean-reverting)"),
            (MarketScenario::Volatile, "⚡ Volatile (±5% swings)"),
            (MarketScenario::WithGaps, "🕳️  With Time Gaps"),
            (MarketScenario::Crash, "💥 Crash (25% slide)"),
        ];
        let wanted = match self {
            Scenario::All => return all,
            Scenario::Uptrend => MarketScenario::Uptrend,
            Scenario::Downtrend => MarketScenario::Downtrend,
            Scenario::Sideways => MarketScenario::Sideways,
            Scenario::Volatile => MarketScenario::Volatile,
            Scenario::Gaps => MarketScenario::WithGaps,
            Scenario::Crash => MarketScenario::Crash,
        };
        all.into_iter().filter(|(s, _)| *s == wanted).collect()
    }
}

#[derive(Parser, Debug)]
#[command(name = "backtest", about = "Replay candles through the trade lifecycle")]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Synthetic market scenario
    #[arg(short, long, value_enum, default_value_t = Scenario::All)]
    scenario: Scenario,

    /// Seed for synthetic data
    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Candles per pair for synthetic data
    #[arg(long, default_value_t = 2_000)]
    candles: usize,

    /// Replay the last N days stored in Redis instead of synthetic data
    #[arg(long)]
    redis_days: Option<i64>,

    /// Fast SMA period
    #[arg(long, default_value_t = 5)]
    fast: usize,

    /// Slow SMA period
    #[arg(long, default_value_t = 20)]
    slow: usize,

    /// Write the last result as JSON
    #[arg(short, long)]
    output: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = EngineConfig::load(args.config.as_ref()).context("Failed to load configuration")?;

    tracing_subscriber::fmt()
        .with_env_filter(config.log_filter.as_str())
        .init();

    println!("\n╔═══════════════════════════════════════════════════════╗");
    println!("║          TRADECORE BACKTESTING SUITE                  ║");
    println!("╚═══════════════════════════════════════════════════════╝");

    let datasets = match args.redis_days {
        Some(days) => vec![("🗄️  Redis history".to_string(), load_redis_data(&config, days).await?)],
        None => synthetic_datasets(&config, &args),
    };

    let mut all_metrics = Vec::new();
    let mut last_json = None;

    for (name, data) in datasets {
        let strategy = Arc::new(SmaCrossStrategy::new(args.fast, args.slow));
        let runner = BacktestRunner::new(config.clone(), strategy)?;

        // Ctrl+C stops the replay and reports what ran so far
        let abort = runner.abort_handle();
        let watcher = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("⚠️  Received Ctrl+C, aborting backtest...");
                abort.store(true, Ordering::SeqCst);
            }
        });

        let result = tokio::task::spawn_blocking(move || runner.run(&data)).await?;
        watcher.abort();

        match result {
            Ok(result) => {
                let metrics = BacktestMetrics::from_result(&result);
                println!("\n{}", name);
                metrics.print_report();
                last_json = Some(result.to_json()?);
                let aborted = result.aborted;
                all_metrics.push((name, metrics));
                if aborted {
                    break;
                }
            }
            Err(e) => {
                eprintln!("❌ Backtest failed for {}: {}", name, e);
            }
        }
    }

    print_summary_comparison(&all_metrics);

    if let (Some(path), Some(json)) = (&args.output, last_json) {
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        println!("💾 Result written to {}", path.display());
    }

    Ok(())
}

fn synthetic_datasets(config: &EngineConfig, args: &Args) -> Vec<(String, BacktestData)> {
    args.scenario
        .market_scenarios()
        .into_iter()
        .map(|(scenario, name)| {
            let mut candles = BTreeMap::new();
            for (i, pair) in config.pair_whitelist.iter().enumerate() {
                let mut generator = SyntheticDataGenerator::new(args.seed.wrapping_add(i as u64));
                candles.insert(
                    pair.clone(),
                    generator.generate(scenario, args.candles, config.timeframe_minutes),
                );
            }

            let data = match config.detail_timeframe_minutes {
                Some(detail_tf) => {
                    let detail = detail_candles(&candles, config.timeframe_minutes, detail_tf);
                    BacktestData::new(candles).with_detail(detail)
                }
                None => BacktestData::new(candles),
            };
            (name.to_string(), data)
        })
        .collect()
}

/// Split every candle into flat-walk detail candles so the detail path can be
/// exercised on synthetic data.
fn detail_candles(
    candles: &BTreeMap<String, Vec<Candle>>,
    timeframe: i64,
    detail_timeframe: i64,
) -> BTreeMap<String, Vec<Candle>> {
    let steps = (timeframe / detail_timeframe).max(1);

    candles
        .iter()
        .map(|(pair, series)| {
            let mut detail = Vec::with_capacity(series.len() * steps as usize);
            for candle in series {
                for step in 0..steps {
                    let t0 = step as f64 / steps as f64;
                    let t1 = (step + 1) as f64 / steps as f64;
                    let open = candle.open + (candle.close - candle.open) * t0;
                    let close = candle.open + (candle.close - candle.open) * t1;
                    // The first detail candle carries the parent's wicks
                    let (high, low) = if step == 0 {
                        (candle.high, candle.low)
                    } else {
                        (open.max(close), open.min(close))
                    };
                    detail.push(Candle::new(
                        candle.date + Duration::minutes(step * detail_timeframe),
                        open,
                        high,
                        low,
                        close,
                        candle.volume / steps as f64,
                    ));
                }
            }
            (pair.clone(), detail)
        })
        .collect()
}

async fn load_redis_data(config: &EngineConfig, days: i64) -> anyhow::Result<BacktestData> {
    let redis_url = config
        .redis_url
        .as_deref()
        .context("redis_url must be configured to replay stored candles")?;
    let mut redis = RedisPersistence::new(redis_url).await?;

    let to = Utc::now();
    let from = to - Duration::days(days);

    let mut candles = BTreeMap::new();
    let mut detail = BTreeMap::new();
    for pair in &config.pair_whitelist {
        let series = redis
            .load_range(pair, config.timeframe_minutes, from, to)
            .await?;
        println!("  {} candles loaded for {}", series.len(), pair);
        candles.insert(pair.clone(), series);

        if let Some(detail_tf) = config.detail_timeframe_minutes {
            detail.insert(pair.clone(), redis.load_range(pair, detail_tf, from, to).await?);
        }
    }

    let data = BacktestData::new(candles);
    Ok(if detail.is_empty() {
        data
    } else {
        data.with_detail(detail)
    })
}

fn print_summary_comparison(results: &[(String, BacktestMetrics)]) {
    println!("\n╔═══════════════════════════════════════════════════════╗");
    println!("║              SCENARIO COMPARISON                      ║");
    println!("╚═══════════════════════════════════════════════════════╝\n");

    println!(
        "{:<30} {:>10} {:>10} {:>8} {:>8}",
        "Scenario", "P&L", "Return%", "Trades", "Win%"
    );
    println!("{}", "─".repeat(70));

    for (name, metrics) in results {
        println!(
            "{:<30} {:>10.2} {:>10.2} {:>8} {:>8.1}",
            name,
            metrics.total_pnl,
            metrics.total_return_pct,
            metrics.total_trades,
            metrics.win_rate
        );
    }

    if let Some((best_name, best_metrics)) = results
        .iter()
        .max_by(|a, b| a.1.total_return_pct.total_cmp(&b.1.total_return_pct))
    {
        println!(
            "\n🏆 Best Scenario: {} ({:+.2}%)",
            best_name, best_metrics.total_return_pct
        );
    }

    if let Some((worst_name, worst_metrics)) = results
        .iter()
        .min_by(|a, b| a.1.total_return_pct.total_cmp(&b.1.total_return_pct))
    {
        println!(
            "⚠️  Worst Scenario: {} ({:+.2}%)",
            worst_name, worst_metrics.total_return_pct
        );
    }

    let total_trades: usize = results.iter().map(|(_, m)| m.total_trades).sum();
    let rejected: usize = results.iter().map(|(_, m)| m.rejected_signals).sum();

    println!("\n📊 Overall Statistics:");
    println!("   Total Trades Across All Scenarios: {}", total_trades);
    println!("   Rejected Entry Signals: {}", rejected);

    println!("\n═══════════════════════════════════════════════════════\n");
}
