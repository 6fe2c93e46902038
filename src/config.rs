use config::{Config, ConfigError, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::execution::exit::ExitRules;
use crate::execution::wallet::StakeConfig;
use crate::Result;

/// Stake per trade: a fixed quote amount or an even split of available capital
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawStakeAmount", into = "RawStakeAmount")]
pub enum StakeAmount {
    Fixed(f64),
    Unlimited,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum RawStakeAmount {
    Number(f64),
    Text(String),
}

impl TryFrom<RawStakeAmount> for StakeAmount {
    type Error = String;

    fn try_from(raw: RawStakeAmount) -> std::result::Result<Self, Self::Error> {
        match raw {
            RawStakeAmount::Number(value) if value > 0.0 => Ok(StakeAmount::Fixed(value)),
            RawStakeAmount::Number(value) => Err(format!("stake_amount must be positive, got {}", value)),
            RawStakeAmount::Text(text) if text.eq_ignore_ascii_case("unlimited") => {
                Ok(StakeAmount::Unlimited)
            }
            // Environment variables arrive as strings
            RawStakeAmount::Text(text) => text
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|v| *v > 0.0)
                .map(StakeAmount::Fixed)
                .ok_or_else(|| format!("invalid stake_amount '{}'", text)),
        }
    }
}

impl From<StakeAmount> for RawStakeAmount {
    fn from(stake: StakeAmount) -> Self {
        match stake {
            StakeAmount::Fixed(value) => RawStakeAmount::Number(value),
            StakeAmount::Unlimited => RawStakeAmount::Text("unlimited".to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnfilledTimeout {
    /// Minutes before an unfilled entry order is cancelled (0 = never)
    pub entry_minutes: i64,
    pub exit_minutes: i64,
    /// Cancelled exits after which an emergency exit is placed (0 = never)
    pub exit_timeout_count: u32,
}

impl Default for UnfilledTimeout {
    fn default() -> Self {
        Self {
            entry_minutes: 10,
            exit_minutes: 30,
            exit_timeout_count: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PositionAdjustment {
    pub enabled: bool,
    /// Additional entries allowed per trade, -1 for no limit
    pub max_entry_position_adjustment: i32,
}

impl Default for PositionAdjustment {
    fn default() -> Self {
        Self {
            enabled: false,
            max_entry_position_adjustment: -1,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Protections {
    /// Lock a pair for this many minutes after every exit (0 = off)
    pub cooldown_minutes: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MarketLimits {
    pub min_amount: Option<f64>,
    pub min_cost: Option<f64>,
    /// Decimal places for order amounts
    pub amount_precision: u32,
}

impl Default for MarketLimits {
    fn default() -> Self {
        Self {
            min_amount: None,
            min_cost: None,
            amount_precision: 8,
        }
    }
}

/// Engine configuration
///
/// Loaded from defaults, an optional TOML file and `TRADECORE__*`
/// environment variables, in that order of precedence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub stake_currency: String,
    pub stake_amount: Option<StakeAmount>,
    pub tradable_balance_ratio: f64,
    pub available_capital: Option<f64>,
    pub dry_run_wallet: f64,
    pub max_open_trades: usize,
    pub amend_last_stake_amount: bool,
    pub last_stake_amount_min_ratio: f64,

    pub fee: f64,
    pub timeframe_minutes: i64,
    pub detail_timeframe_minutes: Option<i64>,

    pub exit_rules: ExitRules,
    pub unfilled_timeout: UnfilledTimeout,
    pub position_adjustment: PositionAdjustment,
    pub protections: Protections,
    pub market: MarketLimits,

    pub custom_price_max_distance_ratio: f64,
    pub process_throttle_secs: u64,
    pub pair_whitelist: Vec<String>,

    pub log_filter: String,
    pub redis_url: Option<String>,
    pub database_url: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            stake_currency: "USDT".to_string(),
            stake_amount: Some(StakeAmount::Unlimited),
            tradable_balance_ratio: 0.99,
            available_capital: None,
            dry_run_wallet: 1000.0,
            max_open_trades: 3,
            amend_last_stake_amount: false,
            last_stake_amount_min_ratio: 0.5,
            fee: 0.001,
            timeframe_minutes: 5,
            detail_timeframe_minutes: None,
            exit_rules: ExitRules::default(),
            unfilled_timeout: UnfilledTimeout::default(),
            position_adjustment: PositionAdjustment::default(),
            protections: Protections::default(),
            market: MarketLimits::default(),
            custom_price_max_distance_ratio: 0.02,
            process_throttle_secs: 5,
            pair_whitelist: vec!["BTC/USDT".to_string(), "ETH/USDT".to_string()],
            log_filter: "tradecore=info".to_string(),
            redis_url: None,
            database_url: None,
        }
    }
}

impl EngineConfig {
    /// Load configuration from an optional TOML file plus environment
    ///
    /// Environment variables use the `TRADECORE` prefix and `__` as the
    /// nesting separator (e.g. `TRADECORE__EXIT_RULES__STOPLOSS=-0.05`).
    pub fn load<P: AsRef<Path>>(path: Option<P>) -> Result<Self> {
        dotenvy::dotenv().ok();

        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path.as_ref()).required(false));
        }
        builder = builder.add_source(
            Environment::with_prefix("TRADECORE")
                .separator("__")
                .try_parsing(true),
        );

        let config: EngineConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document on top of the defaults
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: EngineConfig = Config::builder()
            .add_source(File::from_str(text, FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(ConfigError::Message(msg).into());

        if !(self.tradable_balance_ratio > 0.0 && self.tradable_balance_ratio <= 1.0) {
            return invalid(format!(
                "tradable_balance_ratio must be in (0, 1], got {}",
                self.tradable_balance_ratio
            ));
        }
        if self.exit_rules.stoploss >= 0.0 || self.exit_rules.stoploss < -1.0 {
            return invalid(format!(
                "stoploss must be in [-1, 0), got {}",
                self.exit_rules.stoploss
            ));
        }
        if self.timeframe_minutes <= 0 {
            return invalid("timeframe_minutes must be positive".to_string());
        }
        if let Some(detail) = self.detail_timeframe_minutes {
            if detail <= 0 || detail >= self.timeframe_minutes || self.timeframe_minutes % detail != 0 {
                return invalid(format!(
                    "detail timeframe {}m must evenly divide timeframe {}m",
                    detail, self.timeframe_minutes
                ));
            }
        }
        if !(0.0..0.02).contains(&self.fee) {
            return invalid(format!("fee must be in [0, 0.02), got {}", self.fee));
        }
        if let Some(capital) = self.available_capital {
            if capital <= 0.0 {
                return invalid("available_capital must be positive".to_string());
            }
        }
        Ok(())
    }

    /// Stake allocation settings for the wallet allocator
    pub fn stake_config(&self) -> StakeConfig {
        StakeConfig {
            stake_amount: self.stake_amount,
            tradable_balance_ratio: self.tradable_balance_ratio,
            available_capital: self.available_capital,
            max_open_trades: self.max_open_trades,
            amend_last_stake_amount: self.amend_last_stake_amount,
            last_stake_amount_min_ratio: self.last_stake_amount_min_ratio,
        }
    }
}
