use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::config::StakeAmount;
use crate::error::EngineError;
use crate::execution::ledger::Ledger;
use crate::models::split_pair;
use crate::Result;

/// Minimum stake may be raised by up to this factor to meet exchange limits
const MIN_STAKE_SLACK: f64 = 1.3;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Balance {
    pub free: f64,
    pub used: f64,
    pub total: f64,
}

impl Balance {
    pub fn new(free: f64, used: f64) -> Self {
        Self {
            free,
            used,
            total: free + used,
        }
    }
}

/// Currency balances for one engine instance.
///
/// Live mode syncs from the exchange; backtest and dry-run derive balances
/// from the ledger, starting at a fixed balance.
#[derive(Debug, Clone)]
pub struct Wallet {
    stake_currency: String,
    starting_balance: f64,
    balances: BTreeMap<String, Balance>,
}

impl Wallet {
    pub fn new(stake_currency: &str, starting_balance: f64) -> Self {
        let mut balances = BTreeMap::new();
        balances.insert(stake_currency.to_string(), Balance::new(starting_balance, 0.0));
        Self {
            stake_currency: stake_currency.to_string(),
            starting_balance,
            balances,
        }
    }

    pub fn stake_currency(&self) -> &str {
        &self.stake_currency
    }

    pub fn starting_balance(&self) -> f64 {
        self.starting_balance
    }

    /// Recompute all balances from ledger stake flows
    pub fn sync_from_ledger(&mut self, ledger: &Ledger) {
        let committed = ledger.total_open_stake();
        let free = self.starting_balance + ledger.total_closed_profit() - committed;

        let mut balances = BTreeMap::new();
        balances.insert(self.stake_currency.clone(), Balance::new(free, committed));

        for (pair, amount) in ledger.open_amounts_by_pair() {
            let (base, _) = split_pair(&pair);
            let entry = balances.entry(base.to_string()).or_insert_with(Balance::default);
            entry.free += amount;
            entry.total += amount;
        }

        self.balances = balances;
    }

    /// Replace balances with an exchange snapshot
    pub fn sync_from_exchange(&mut self, balances: BTreeMap<String, Balance>) {
        tracing::debug!("Wallet synced: {} currencies", balances.len());
        self.balances = balances;
    }

    pub fn balance(&self, currency: &str) -> Balance {
        self.balances.get(currency).copied().unwrap_or_default()
    }

    pub fn free(&self, currency: &str) -> f64 {
        self.balance(currency).free
    }

    pub fn used(&self, currency: &str) -> f64 {
        self.balance(currency).used
    }

    pub fn total(&self, currency: &str) -> f64 {
        self.balance(currency).total
    }

    pub fn balances(&self) -> &BTreeMap<String, Balance> {
        &self.balances
    }
}

/// Stake allocation settings
#[derive(Debug, Clone, PartialEq)]
pub struct StakeConfig {
    pub stake_amount: Option<StakeAmount>,
    pub tradable_balance_ratio: f64,
    pub available_capital: Option<f64>,
    pub max_open_trades: usize,
    pub amend_last_stake_amount: bool,
    pub last_stake_amount_min_ratio: f64,
}

/// Capital still available for new trades.
///
/// The tradable base is the configured capital plus closed profit, or the
/// free balance plus stake already tied up in open trades. The result is
/// floored at zero and never exceeds the free balance.
///
/// # Arguments
/// * `open_stake` - Stake committed to open trades, including pending entries
/// * `closed_profit` - Realized profit of all closed trades
pub fn available_stake(
    wallet: &Wallet,
    open_stake: f64,
    closed_profit: f64,
    config: &StakeConfig,
) -> f64 {
    let free = wallet.free(wallet.stake_currency()).max(0.0);
    let starting = match config.available_capital {
        Some(capital) => capital + closed_profit,
        None => free + open_stake,
    };

    let available = (starting * config.tradable_balance_ratio - open_stake).max(0.0);
    available.min(free)
}

/// Stake for the next trade before min/max validation
///
/// Fails with `Dependency` when no stake can be resolved; the caller skips
/// the entry.
pub fn trade_stake_amount(
    pair: &str,
    open_trades_count: usize,
    available_stake: f64,
    config: &StakeConfig,
) -> Result<f64> {
    match config.stake_amount {
        Some(StakeAmount::Unlimited) => {
            if config.max_open_trades == 0 {
                return Err(EngineError::Dependency(
                    "unlimited stake needs max_open_trades > 0".to_string(),
                ));
            }
            let free_slots = config.max_open_trades.saturating_sub(open_trades_count);
            if free_slots == 0 {
                tracing::debug!("{}: no free slots for unlimited stake", pair);
                return Ok(0.0);
            }
            Ok(available_stake / free_slots as f64)
        }
        Some(StakeAmount::Fixed(stake)) => {
            let mut stake = stake;
            if config.amend_last_stake_amount
                && available_stake > stake * config.last_stake_amount_min_ratio
            {
                stake = stake.min(available_stake);
            }
            if available_stake < stake {
                return Err(EngineError::Dependency(format!(
                    "{}: available balance {:.8} lower than stake amount {:.8}",
                    pair, available_stake, stake
                )));
            }
            Ok(stake)
        }
        None => Err(EngineError::Dependency(format!(
            "{}: no stake amount configured",
            pair
        ))),
    }
}

/// Fit a proposed stake between the exchange minimum and the allowed maximum
///
/// Returns 0 when no valid stake exists. A stake below the minimum is raised
/// to it only if it is within 30% of the minimum.
pub fn validate_stake_amount(
    pair: &str,
    proposed: f64,
    min_stake: Option<f64>,
    max_stake: f64,
) -> f64 {
    if proposed <= 0.0 || !proposed.is_finite() {
        return 0.0;
    }

    if let Some(min_stake) = min_stake {
        if min_stake > max_stake {
            tracing::warn!(
                "{}: minimum stake {:.8} exceeds maximum {:.8}, not trading",
                pair,
                min_stake,
                max_stake
            );
            return 0.0;
        }
    }

    let mut stake = proposed;
    if stake > max_stake {
        tracing::debug!("{}: stake {:.8} reduced to maximum {:.8}", pair, stake, max_stake);
        stake = max_stake;
    }

    if let Some(min_stake) = min_stake {
        if stake < min_stake {
            if stake * MIN_STAKE_SLACK < min_stake {
                tracing::warn!(
                    "{}: stake {:.8} too far below minimum {:.8}, not trading",
                    pair,
                    stake,
                    min_stake
                );
                return 0.0;
            }
            tracing::debug!("{}: stake {:.8} raised to minimum {:.8}", pair, stake, min_stake);
            stake = min_stake;
        }
    }

    stake
}

/// Minimum stake for a pair, with a reserve so the stoploss exit still meets
/// the exchange limits
pub fn min_pair_stake(
    min_amount: Option<f64>,
    min_cost: Option<f64>,
    price: f64,
    stoploss: f64,
) -> Option<f64> {
    let from_amount = min_amount.map(|amount| amount * price);
    let limit = match (min_cost, from_amount) {
        (None, None) => return None,
        (Some(cost), None) => cost,
        (None, Some(amount)) => amount,
        (Some(cost), Some(amount)) => cost.max(amount),
    };

    let reserve = if stoploss.abs() < 1.0 {
        1.05 / (1.0 - stoploss.abs())
    } else {
        1.5
    };
    Some(limit * reserve.clamp(1.0, 1.5))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::OrderSide;
    use crate::execution::order::Fill;
    use chrono::{TimeZone, Utc};

    fn unlimited(max_open_trades: usize) -> StakeConfig {
        StakeConfig {
            stake_amount: Some(StakeAmount::Unlimited),
            tradable_balance_ratio: 1.0,
            available_capital: None,
            max_open_trades,
            amend_last_stake_amount: false,
            last_stake_amount_min_ratio: 0.5,
        }
    }

    fn open_trade(ledger: &mut Ledger, pair: &str, stake: f64) {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let trade_id = ledger.create_trade(pair, now, 0.0, None);
        let order_id = ledger
            .place_order(trade_id, OrderSide::Entry, 1.0, stake, now, None, None)
            .unwrap();
        let fill = Fill::full(ledger.trade(trade_id).unwrap().order(&order_id).unwrap(), 1.0, now);
        ledger.fill_order(trade_id, &order_id, &fill).unwrap();
    }

    fn stake_for_next(ledger: &Ledger, wallet: &mut Wallet, config: &StakeConfig) -> f64 {
        wallet.sync_from_ledger(ledger);
        let available = available_stake(
            wallet,
            ledger.total_open_stake(),
            ledger.total_closed_profit(),
            config,
        );
        trade_stake_amount("BTC/USDT", ledger.open_trade_count(), available, config).unwrap()
    }

    #[test]
    fn test_unlimited_stake_allocation() {
        let config = unlimited(2);
        let mut ledger = Ledger::new();
        let mut wallet = Wallet::new("USDT", 100.0);

        assert!((stake_for_next(&ledger, &mut wallet, &config) - 50.0).abs() < 1e-9);

        open_trade(&mut ledger, "BTC/USDT", 50.0);
        assert!((stake_for_next(&ledger, &mut wallet, &config) - 50.0).abs() < 1e-9);

        open_trade(&mut ledger, "ETH/USDT", 50.0);
        assert_eq!(stake_for_next(&ledger, &mut wallet, &config), 0.0);
    }

    #[test]
    fn test_pending_entry_reserves_stake() {
        let config = unlimited(2);
        let mut ledger = Ledger::new();
        let mut wallet = Wallet::new("USDT", 100.0);
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

        let trade_id = ledger.create_trade("BTC/USDT", now, 0.0, None);
        ledger
            .place_order(trade_id, OrderSide::Entry, 2.0, 25.0, now, None, None)
            .unwrap();

        wallet.sync_from_ledger(&ledger);
        assert!((wallet.free("USDT") - 50.0).abs() < 1e-9);
        assert!((wallet.used("USDT") - 50.0).abs() < 1e-9);
        assert!((stake_for_next(&ledger, &mut wallet, &config) - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_available_stake_with_capital() {
        let mut config = unlimited(3);
        config.available_capital = Some(80.0);
        config.tradable_balance_ratio = 0.5;
        let wallet = Wallet::new("USDT", 1000.0);

        assert!((available_stake(&wallet, 0.0, 20.0, &config) - 50.0).abs() < 1e-9);
        assert_eq!(available_stake(&wallet, 60.0, 0.0, &config), 0.0);
    }

    #[test]
    fn test_available_stake_capped_at_free() {
        let config = unlimited(3);
        let mut wallet = Wallet::new("USDT", 0.0);
        let mut balances = BTreeMap::new();
        balances.insert("USDT".to_string(), Balance::new(30.0, 70.0));
        wallet.sync_from_exchange(balances);

        assert!((available_stake(&wallet, 70.0, 0.0, &config) - 30.0).abs() < 1e-9);
    }

    #[test]
    fn test_fixed_stake() {
        let mut config = unlimited(3);
        config.stake_amount = Some(StakeAmount::Fixed(40.0));

        assert_eq!(trade_stake_amount("BTC/USDT", 0, 100.0, &config).unwrap(), 40.0);

        let err = trade_stake_amount("BTC/USDT", 0, 30.0, &config).unwrap_err();
        assert!(matches!(err, EngineError::Dependency(_)));

        config.amend_last_stake_amount = true;
        assert_eq!(trade_stake_amount("BTC/USDT", 0, 30.0, &config).unwrap(), 30.0);
        assert!(trade_stake_amount("BTC/USDT", 0, 10.0, &config).is_err());
    }

    #[test]
    fn test_no_stake_configuration() {
        let mut config = unlimited(3);
        config.stake_amount = None;
        let err = trade_stake_amount("BTC/USDT", 0, 100.0, &config).unwrap_err();
        assert!(matches!(err, EngineError::Dependency(_)));

        let err = trade_stake_amount("BTC/USDT", 0, 100.0, &unlimited(0)).unwrap_err();
        assert!(matches!(err, EngineError::Dependency(_)));
    }

    #[test]
    fn test_validate_stake_amount() {
        let pair = "BTC/USDT";
        assert_eq!(validate_stake_amount(pair, 22.0, Some(11.0), 50.0), 22.0);
        assert_eq!(validate_stake_amount(pair, 9.0, Some(11.0), 100.0), 11.0);
        assert_eq!(validate_stake_amount(pair, 20.0, Some(50.0), 100.0), 0.0);
        assert_eq!(validate_stake_amount(pair, 1000.0, Some(11.0), 500.0), 500.0);
        assert_eq!(validate_stake_amount(pair, 20.0, Some(15.0), 10.0), 0.0);
        assert_eq!(validate_stake_amount(pair, 1.0, Some(15.0), 10.0), 0.0);
        assert_eq!(validate_stake_amount(pair, 100.0, Some(11.0), 500.0), 100.0);
        assert_eq!(validate_stake_amount(pair, 1000.0, None, 1000.0), 1000.0);
        assert_eq!(validate_stake_amount(pair, 0.0, None, 1000.0), 0.0);
    }

    #[test]
    fn test_min_pair_stake() {
        assert_eq!(min_pair_stake(None, None, 10.0, -0.1), None);

        // Cost limit wins, reserve 1.05 / 0.9
        let stake = min_pair_stake(Some(0.1), Some(5.0), 10.0, -0.1).unwrap();
        assert!((stake - 5.0 * 1.05 / 0.9).abs() < 1e-9);

        // Reserve capped at 1.5
        let stake = min_pair_stake(Some(2.0), None, 10.0, -0.5).unwrap();
        assert!((stake - 30.0).abs() < 1e-9);

        // Never below the raw limit
        let stake = min_pair_stake(None, Some(10.0), 1.0, -0.01).unwrap();
        assert!((stake - 10.0 * 1.05 / 0.99).abs() < 1e-9);
    }

    #[test]
    fn test_sync_from_ledger_tracks_base_amounts() {
        let mut ledger = Ledger::new();
        open_trade(&mut ledger, "BTC/USDT", 10.0);
        let mut wallet = Wallet::new("USDT", 100.0);
        wallet.sync_from_ledger(&ledger);

        assert!((wallet.free("USDT") - 90.0).abs() < 1e-9);
        assert!((wallet.free("BTC") - 10.0).abs() < 1e-9);
        assert_eq!(wallet.free("ETH"), 0.0);
    }
}
