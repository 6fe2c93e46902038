use anyhow::Context;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use clap::Parser;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::time::{interval_at, Duration, Instant, MissedTickBehavior};
use tradecore::backtest::{MarketScenario, SyntheticDataGenerator};
use tradecore::db::PostgresPersistence;
use tradecore::exchange::DryRunExchange;
use tradecore::live::LiveEngine;
use tradecore::notify::{LogNotifier, NotificationSink};
use tradecore::persistence::RedisPersistence;
use tradecore::strategy::SmaCrossStrategy;
use tradecore::{Candle, EngineConfig, Strategy};

/// Synthetic candles generated per pair when no Redis history is configured
const SYNTHETIC_CANDLES: usize = 5_000;

#[derive(Parser, Debug)]
#[command(name = "tradecore", about = "Dry-run trading engine")]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Pairs to trade (overrides the configured whitelist)
    #[arg(short, long, value_delimiter = ',')]
    pairs: Vec<String>,

    /// Seed for the synthetic feed
    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Fast SMA period
    #[arg(long, default_value_t = 5)]
    fast: usize,

    /// Slow SMA period
    #[arg(long, default_value_t = 20)]
    slow: usize,
}

// ============================================================================
// Candle Feed
// ============================================================================

/// Where each cycle's newest candle comes from
enum CandleFeed {
    /// Poll the newest stored candle per pair, clocked by wall time
    Redis(RedisPersistence),
    /// Replay generated candles, clocked by candle close time
    Synthetic(BTreeMap<String, VecDeque<Candle>>),
}

impl CandleFeed {
    async fn connect(config: &EngineConfig, seed: u64) -> Self {
        if let Some(redis_url) = &config.redis_url {
            match RedisPersistence::new(redis_url).await {
                Ok(redis) => return CandleFeed::Redis(redis),
                Err(e) => tracing::warn!(
                    "Failed to connect to Redis ({}), falling back to synthetic candles",
                    e
                ),
            }
        }

        let mut series = BTreeMap::new();
        for (i, pair) in config.pair_whitelist.iter().enumerate() {
            let mut generator = SyntheticDataGenerator::new(seed.wrapping_add(i as u64))
                .with_start(Utc::now() - ChronoDuration::days(30));
            let candles = generator.generate(
                MarketScenario::Volatile,
                SYNTHETIC_CANDLES,
                config.timeframe_minutes,
            );
            series.insert(pair.clone(), candles.into_iter().collect());
        }
        tracing::info!("🧪 Using synthetic candles for {} pairs", series.len());
        CandleFeed::Synthetic(series)
    }

    /// Fill the engine's candle buffer before the first cycle
    async fn warm_up(
        &mut self,
        engine: &LiveEngine<DryRunExchange>,
        exchange: &DryRunExchange,
        count: usize,
    ) {
        let config = engine.config();
        for pair in &config.pair_whitelist {
            let candles = match self {
                CandleFeed::Redis(redis) => redis
                    .load_recent(pair, config.timeframe_minutes, count)
                    .await
                    .unwrap_or_else(|e| {
                        tracing::warn!("{}: failed to load history: {}", pair, e);
                        Vec::new()
                    }),
                CandleFeed::Synthetic(series) => match series.get_mut(pair) {
                    Some(queue) => queue.drain(..count.min(queue.len())).collect(),
                    None => Vec::new(),
                },
            };

            tracing::info!("📈 {}: warmed up with {} candles", pair, candles.len());
            if let Some(last) = candles.last() {
                exchange.set_price(pair, last.close).await;
            }
            for candle in candles {
                engine.candles().add_candle(pair, candle);
            }
        }
    }

    /// Push the next candle for every pair and return the cycle time.
    ///
    /// Returns None once the synthetic series is exhausted.
    async fn advance(
        &mut self,
        engine: &LiveEngine<DryRunExchange>,
        exchange: &DryRunExchange,
    ) -> Option<DateTime<Utc>> {
        let config = engine.config();
        let timeframe = config.timeframe_minutes;

        match self {
            CandleFeed::Redis(redis) => {
                for pair in &config.pair_whitelist {
                    match redis.load_recent(pair, timeframe, 1).await {
                        Ok(candles) => {
                            if let Some(candle) = candles.into_iter().next() {
                                exchange.set_price(pair, candle.close).await;
                                engine.candles().add_candle(pair, candle);
                            }
                        }
                        Err(e) => tracing::warn!("{}: failed to load candle: {}", pair, e),
                    }
                }
                Some(Utc::now())
            }
            CandleFeed::Synthetic(series) => {
                let mut now = None;
                for (pair, queue) in series.iter_mut() {
                    let candle = queue.pop_front()?;
                    let close_time = candle.date + ChronoDuration::minutes(timeframe);
                    now = Some(now.map_or(close_time, |t: DateTime<Utc>| t.max(close_time)));
                    exchange.set_price(pair, candle.close).await;
                    engine.candles().add_candle(pair, candle);
                }
                now
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let mut config =
        EngineConfig::load(args.config.as_ref()).context("Failed to load configuration")?;
    if !args.pairs.is_empty() {
        config.pair_whitelist = args.pairs.clone();
    }

    setup_logging(&config.log_filter);

    tracing::info!("🚀 tradecore starting (dry run)");

    let postgres = connect_to_postgres(&config).await;
    let restored = load_trades_from_db(postgres.as_ref()).await;

    let strategy: Arc<dyn Strategy> = Arc::new(SmaCrossStrategy::new(args.fast, args.slow));
    let warm_up_count = strategy.startup_candle_count();

    let exchange = Arc::new(DryRunExchange::new(
        &config.stake_currency,
        config.available_capital.unwrap_or(config.dry_run_wallet),
        config.fee,
        config.market.clone(),
    ));

    let notifier = NotificationSink::new(Arc::new(LogNotifier));
    let engine = LiveEngine::new(config.clone(), exchange.clone(), strategy, notifier)
        .context("Failed to create engine")?
        .with_trades(restored);

    log_configuration(&config);

    let mut feed = CandleFeed::connect(&config, args.seed).await;
    feed.warm_up(&engine, &exchange, warm_up_count).await;

    let throttle = Duration::from_secs(config.process_throttle_secs.max(1));
    let mut ticker = interval_at(Instant::now(), throttle);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut saved = SavedTrades::default();

    tracing::info!("\nPress Ctrl+C to stop...\n");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("\n⚠️  Received Ctrl+C, shutting down...");
                break;
            }
            _ = ticker.tick() => {
                let Some(now) = feed.advance(&engine, &exchange).await else {
                    tracing::info!("🏁 Candle feed exhausted");
                    break;
                };
                exchange.set_clock(now).await;

                if let Err(e) = engine.process(now).await {
                    tracing::warn!("Cycle failed, retrying next tick: {}", e);
                    continue;
                }

                if let Some(postgres) = &postgres {
                    save_trades_to_db(postgres, &engine, &mut saved).await;
                }
            }
        }
    }

    log_summary(&engine).await;
    if let Some(postgres) = &postgres {
        save_trades_to_db(postgres, &engine, &mut saved).await;
    }

    tracing::info!("👋 tradecore stopped");
    Ok(())
}

// ============================================================================
// Initialization Functions
// ============================================================================

fn setup_logging(filter: &str) {
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn connect_to_postgres(config: &EngineConfig) -> Option<PostgresPersistence> {
    let database_url = config.database_url.as_ref()?;

    match PostgresPersistence::new(database_url).await {
        Ok(p) => {
            tracing::info!("Postgres persistence enabled at {}", database_url);
            Some(p)
        }
        Err(e) => {
            tracing::warn!(
                "Failed to connect to Postgres ({}), continuing without persistence",
                e
            );
            None
        }
    }
}

async fn load_trades_from_db(postgres: Option<&PostgresPersistence>) -> Vec<tradecore::execution::Trade> {
    let Some(postgres) = postgres else {
        return Vec::new();
    };

    tracing::info!("Loading trades from Postgres...");
    match postgres.load_trades().await {
        Ok(trades) => {
            let open = trades.iter().filter(|t| t.is_open).count();
            tracing::info!("✓ Restored {} trades ({} open)", trades.len(), open);
            trades
        }
        Err(e) => {
            tracing::warn!("Failed to load trades from Postgres: {}", e);
            Vec::new()
        }
    }
}

fn log_configuration(config: &EngineConfig) {
    tracing::info!("\n📊 Configuration:");
    tracing::info!("  Stake: {:?} {}", config.stake_amount, config.stake_currency);
    tracing::info!("  Max open trades: {}", config.max_open_trades);
    tracing::info!("  Timeframe: {}m", config.timeframe_minutes);
    tracing::info!("  Stoploss: {:.2}%", config.exit_rules.stoploss * 100.0);
    tracing::info!("  Pairs: {}", config.pair_whitelist.join(", "));
}

// ============================================================================
// Persistence
// ============================================================================

/// Trade ids already written to Postgres
#[derive(Default)]
struct SavedTrades {
    persisted: BTreeSet<u64>,
    closed: BTreeSet<u64>,
}

/// Save open trades and trades closed since the last save; delete trades
/// the engine dropped because their first entry never filled.
async fn save_trades_to_db(
    postgres: &PostgresPersistence,
    engine: &LiveEngine<DryRunExchange>,
    saved: &mut SavedTrades,
) {
    let trades = engine.trades().await;
    let current: BTreeSet<u64> = trades.iter().map(|t| t.id).collect();

    let pending: Vec<_> = trades
        .iter()
        .filter(|t| !saved.closed.contains(&t.id))
        .collect();

    for trade in pending {
        if let Err(e) = postgres.save_trade(trade).await {
            tracing::warn!("Failed to save trade {}: {}", trade.id, e);
            continue;
        }
        saved.persisted.insert(trade.id);
        if !trade.is_open {
            saved.closed.insert(trade.id);
        }
    }

    let dropped: Vec<u64> = saved.persisted.difference(&current).copied().collect();
    for id in dropped {
        if let Err(e) = postgres.delete_trade(id).await {
            tracing::warn!("Failed to delete trade {}: {}", id, e);
            continue;
        }
        saved.persisted.remove(&id);
    }
}

async fn log_summary(engine: &LiveEngine<DryRunExchange>) {
    let trades = engine.trades().await;
    let closed: Vec<_> = trades.iter().filter(|t| !t.is_open).collect();
    let profit: f64 = closed.iter().filter_map(|t| t.close_profit_abs).sum();
    let wallet = engine.wallet().await;

    tracing::info!("\n💼 Summary:");
    tracing::info!("  Closed trades: {}", closed.len());
    tracing::info!("  Open trades: {}", trades.len() - closed.len());
    tracing::info!("  Closed profit: {:.4} {}", profit, engine.config().stake_currency);
    tracing::info!(
        "  Wallet: {:.4} {}",
        wallet.total(&engine.config().stake_currency),
        engine.config().stake_currency
    );
}
