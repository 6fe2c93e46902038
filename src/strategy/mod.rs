// Trading strategy module
pub mod sma_cross;

use crate::execution::trade::Trade;
use crate::models::{Candle, ExitType, SignalSet};
use crate::Result;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

pub use sma_cross::SmaCrossStrategy;

/// Inputs to `Strategy::custom_stake_amount`
#[derive(Debug, Clone)]
pub struct StakeRequest<'a> {
    pub pair: &'a str,
    pub now: DateTime<Utc>,
    pub rate: f64,
    pub proposed_stake: f64,
    pub min_stake: Option<f64>,
    pub max_stake: f64,
    pub entry_tag: Option<&'a str>,
}

/// Base trait for all trading strategies
///
/// Only `name` and `signal` are required. Every other callback defaults to
/// "no override" (`Ok(None)` or `Ok(true)`).
pub trait Strategy: Send + Sync {
    /// Get strategy name
    fn name(&self) -> &str;

    /// Entry/exit signal for the latest candle of `window` (oldest first)
    fn signal(&self, pair: &str, window: &[Candle]) -> Result<SignalSet>;

    /// Candles needed before `signal` produces anything meaningful
    fn startup_candle_count(&self) -> usize {
        1
    }

    fn custom_stake_amount(&self, _request: &StakeRequest<'_>) -> Result<Option<f64>> {
        Ok(None)
    }

    fn custom_entry_price(
        &self,
        _pair: &str,
        _now: DateTime<Utc>,
        _proposed_rate: f64,
        _entry_tag: Option<&str>,
    ) -> Result<Option<f64>> {
        Ok(None)
    }

    /// Return an exit tag to close the trade for a strategy-specific reason
    fn custom_exit(
        &self,
        _trade: &Trade,
        _now: DateTime<Utc>,
        _current_rate: f64,
        _current_profit: f64,
    ) -> Result<Option<String>> {
        Ok(None)
    }

    fn custom_exit_price(
        &self,
        _trade: &Trade,
        _now: DateTime<Utc>,
        _proposed_rate: f64,
        _current_profit: f64,
        _exit_tag: Option<&str>,
    ) -> Result<Option<f64>> {
        Ok(None)
    }

    /// Additional stake to add to an open trade (DCA)
    fn adjust_trade_position(
        &self,
        _trade: &Trade,
        _now: DateTime<Utc>,
        _current_rate: f64,
        _current_profit: f64,
        _min_stake: Option<f64>,
        _max_stake: f64,
    ) -> Result<Option<f64>> {
        Ok(None)
    }

    fn confirm_trade_entry(
        &self,
        _pair: &str,
        _amount: f64,
        _rate: f64,
        _now: DateTime<Utc>,
        _entry_tag: Option<&str>,
    ) -> Result<bool> {
        Ok(true)
    }

    fn confirm_trade_exit(
        &self,
        _trade: &Trade,
        _amount: f64,
        _rate: f64,
        _exit_type: ExitType,
        _now: DateTime<Utc>,
    ) -> Result<bool> {
        Ok(true)
    }
}

/// Calls a strategy and turns every failure into the documented default.
///
/// Each failing callback is logged at warn level the first time only.
pub struct StrategyAdapter {
    inner: Arc<dyn Strategy>,
    failed: Mutex<HashSet<&'static str>>,
}

impl StrategyAdapter {
    pub fn new(inner: Arc<dyn Strategy>) -> Self {
        Self {
            inner,
            failed: Mutex::new(HashSet::new()),
        }
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub fn startup_candle_count(&self) -> usize {
        self.inner.startup_candle_count().max(1)
    }

    fn or_default<T>(&self, callback: &'static str, result: Result<T>, default: T) -> T {
        match result {
            Ok(value) => value,
            Err(e) => {
                let first = match self.failed.lock() {
                    Ok(mut failed) => failed.insert(callback),
                    Err(poisoned) => poisoned.into_inner().insert(callback),
                };
                if first {
                    tracing::warn!(
                        "Strategy {} failed in {}: {} (using default)",
                        self.inner.name(),
                        callback,
                        e
                    );
                } else {
                    tracing::debug!("Strategy {} failed in {}: {}", self.inner.name(), callback, e);
                }
                default
            }
        }
    }

    /// Signal for the window, or "no signal" on failure
    pub fn signal(&self, pair: &str, window: &[Candle]) -> SignalSet {
        if window.is_empty() {
            return SignalSet::default();
        }
        self.or_default("signal", self.inner.signal(pair, window), SignalSet::default())
    }

    pub fn custom_stake_amount(&self, request: &StakeRequest<'_>) -> f64 {
        let result = self.inner.custom_stake_amount(request);
        self.or_default("custom_stake_amount", result, None)
            .filter(|stake| stake.is_finite())
            .unwrap_or(request.proposed_stake)
    }

    pub fn custom_entry_price(
        &self,
        pair: &str,
        now: DateTime<Utc>,
        proposed_rate: f64,
        entry_tag: Option<&str>,
    ) -> f64 {
        let result = self
            .inner
            .custom_entry_price(pair, now, proposed_rate, entry_tag);
        positive_or(self.or_default("custom_entry_price", result, None), proposed_rate)
    }

    pub fn custom_exit(
        &self,
        trade: &Trade,
        now: DateTime<Utc>,
        current_rate: f64,
        current_profit: f64,
    ) -> Option<String> {
        let result = self
            .inner
            .custom_exit(trade, now, current_rate, current_profit);
        self.or_default("custom_exit", result, None)
            .filter(|tag| !tag.is_empty())
    }

    pub fn custom_exit_price(
        &self,
        trade: &Trade,
        now: DateTime<Utc>,
        proposed_rate: f64,
        current_profit: f64,
        exit_tag: Option<&str>,
    ) -> f64 {
        let result = self
            .inner
            .custom_exit_price(trade, now, proposed_rate, current_profit, exit_tag);
        positive_or(self.or_default("custom_exit_price", result, None), proposed_rate)
    }

    pub fn adjust_trade_position(
        &self,
        trade: &Trade,
        now: DateTime<Utc>,
        current_rate: f64,
        current_profit: f64,
        min_stake: Option<f64>,
        max_stake: f64,
    ) -> Option<f64> {
        let result = self.inner.adjust_trade_position(
            trade,
            now,
            current_rate,
            current_profit,
            min_stake,
            max_stake,
        );
        self.or_default("adjust_trade_position", result, None)
            .filter(|stake| stake.is_finite() && *stake > 0.0)
    }

    pub fn confirm_trade_entry(
        &self,
        pair: &str,
        amount: f64,
        rate: f64,
        now: DateTime<Utc>,
        entry_tag: Option<&str>,
    ) -> bool {
        let result = self
            .inner
            .confirm_trade_entry(pair, amount, rate, now, entry_tag);
        self.or_default("confirm_trade_entry", result, true)
    }

    pub fn confirm_trade_exit(
        &self,
        trade: &Trade,
        amount: f64,
        rate: f64,
        exit_type: ExitType,
        now: DateTime<Utc>,
    ) -> bool {
        let result = self
            .inner
            .confirm_trade_exit(trade, amount, rate, exit_type, now);
        self.or_default("confirm_trade_exit", result, true)
    }
}

fn positive_or(value: Option<f64>, default: f64) -> f64 {
    value
        .filter(|v| v.is_finite() && *v > 0.0)
        .unwrap_or(default)
}
