use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::EngineError;
use crate::execution::trade::Trade;
use crate::models::{Candle, ExitType, SignalSet};
use crate::strategy::StrategyAdapter;
use crate::Result;

/// Minutes-since-entry → minimum profit ratio
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "BTreeMap<String, f64>", into = "BTreeMap<String, f64>")]
pub struct RoiTable(BTreeMap<i64, f64>);

impl RoiTable {
    pub fn new(entries: impl IntoIterator<Item = (i64, f64)>) -> Self {
        Self(entries.into_iter().collect())
    }

    /// Entry with the greatest minute key not above `trade_duration`
    pub fn entry_for(&self, trade_duration: i64) -> Option<(i64, f64)> {
        self.0
            .range(..=trade_duration)
            .next_back()
            .map(|(minutes, roi)| (*minutes, *roi))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Default for RoiTable {
    fn default() -> Self {
        Self::new([(0, 0.04), (30, 0.02), (60, 0.01)])
    }
}

impl TryFrom<BTreeMap<String, f64>> for RoiTable {
    type Error = String;

    fn try_from(raw: BTreeMap<String, f64>) -> std::result::Result<Self, Self::Error> {
        let mut table = BTreeMap::new();
        for (key, roi) in raw {
            let minutes: i64 = key
                .trim()
                .parse()
                .map_err(|_| format!("invalid ROI table key '{}'", key))?;
            table.insert(minutes, roi);
        }
        Ok(Self(table))
    }
}

impl From<RoiTable> for BTreeMap<String, f64> {
    fn from(table: RoiTable) -> Self {
        table
            .0
            .into_iter()
            .map(|(minutes, roi)| (minutes.to_string(), roi))
            .collect()
    }
}

/// Exit configuration shared by backtest and live
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExitRules {
    pub minimal_roi: RoiTable,
    pub stoploss: f64,
    pub trailing_stop: bool,
    pub trailing_stop_positive: Option<f64>,
    pub trailing_stop_positive_offset: f64,
    pub trailing_only_offset_is_reached: bool,
    pub use_exit_signal: bool,
    pub exit_profit_only: bool,
    pub exit_profit_offset: f64,
    pub ignore_roi_if_entry_signal: bool,
}

impl Default for ExitRules {
    fn default() -> Self {
        Self {
            minimal_roi: RoiTable::default(),
            stoploss: -0.10,
            trailing_stop: false,
            trailing_stop_positive: None,
            trailing_stop_positive_offset: 0.0,
            trailing_only_offset_is_reached: false,
            use_exit_signal: true,
            exit_profit_only: false,
            exit_profit_offset: 0.0,
            ignore_roi_if_entry_signal: false,
        }
    }
}

/// Outcome of an exit evaluation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExitDecision {
    pub should_exit: bool,
    pub reason: Option<ExitType>,
    pub exit_tag: Option<String>,
    pub at_price: Option<f64>,
}

impl ExitDecision {
    pub fn none() -> Self {
        Self {
            should_exit: false,
            reason: None,
            exit_tag: None,
            at_price: None,
        }
    }

    pub fn exit(reason: ExitType, at_price: f64, exit_tag: Option<String>) -> Self {
        Self {
            should_exit: true,
            reason: Some(reason),
            exit_tag,
            at_price: Some(at_price),
        }
    }
}

/// Per-call inputs to the evaluator
#[derive(Debug, Clone)]
pub struct ExitContext<'a> {
    pub now: DateTime<Utc>,
    pub signals: &'a SignalSet,
    /// Overrides the configured stoploss when non-zero
    pub force_stoploss: f64,
    /// Bounds for strategy-proposed exit prices; defaults to the candle range
    pub custom_price_range: Option<(f64, f64)>,
}

impl<'a> ExitContext<'a> {
    pub fn new(now: DateTime<Utc>, signals: &'a SignalSet) -> Self {
        Self {
            now,
            signals,
            force_stoploss: 0.0,
            custom_price_range: None,
        }
    }
}

/// Decides whether, why and at what price a position closes.
///
/// The same evaluator runs against historical candles in the backtest and
/// against a flat candle built from the current quote in live mode.
#[derive(Debug, Clone)]
pub struct ExitEvaluator {
    rules: ExitRules,
    timeframe_minutes: i64,
}

impl ExitEvaluator {
    pub fn new(rules: ExitRules, timeframe_minutes: i64) -> Self {
        Self {
            rules,
            timeframe_minutes: timeframe_minutes.max(1),
        }
    }

    pub fn rules(&self) -> &ExitRules {
        &self.rules
    }

    /// Update min/max rates and the stop for this candle.
    ///
    /// Sets the initial stop from the open rate if none exists, then
    /// ratchets a trailing stop off the candle high.
    pub fn prepare(&self, trade: &mut Trade, candle: &Candle, force_stoploss: f64) {
        if trade.amount <= 0.0 || trade.open_rate <= 0.0 {
            return;
        }

        trade.adjust_min_max_rates(candle.high, candle.low);

        let stoploss = if force_stoploss != 0.0 {
            force_stoploss
        } else {
            self.rules.stoploss
        };
        let open_rate = trade.open_rate;
        trade.adjust_stop_loss(open_rate, stoploss, true);

        if self.rules.trailing_stop && trade.stop_loss < candle.low {
            let offset = self.rules.trailing_stop_positive_offset;
            let high_profit = trade.calc_profit_ratio(candle.high);

            if !(self.rules.trailing_only_offset_is_reached && high_profit < offset) {
                let mut distance = stoploss;
                if let Some(positive) = self.rules.trailing_stop_positive {
                    if high_profit > offset {
                        distance = positive;
                    }
                }
                trade.adjust_stop_loss(candle.high, distance, false);
            }
        }
    }

    /// Prepare the trade for `candle` and decide on an exit.
    ///
    /// A missing candle never produces an exit.
    pub fn evaluate_exit(
        &self,
        trade: &mut Trade,
        candle: Option<&Candle>,
        ctx: &ExitContext<'_>,
        strategy: &StrategyAdapter,
    ) -> Result<ExitDecision> {
        let Some(candle) = candle else {
            return Ok(ExitDecision::none());
        };
        self.prepare(trade, candle, ctx.force_stoploss);
        self.decide(trade, candle, ctx, strategy)
    }

    /// Exit decision for an already prepared trade
    pub fn decide(
        &self,
        trade: &Trade,
        candle: &Candle,
        ctx: &ExitContext<'_>,
        strategy: &StrategyAdapter,
    ) -> Result<ExitDecision> {
        if !trade.is_open || trade.amount <= 0.0 {
            return Ok(ExitDecision::none());
        }

        let trade_dur = trade.duration_minutes(ctx.now);

        // 1. Stop loss
        if trade.has_stop_loss() && candle.low <= trade.stop_loss {
            let reason = if trade.stop_is_trailing() {
                ExitType::TrailingStopLoss
            } else {
                ExitType::StopLoss
            };
            let price = self.stop_close_rate(trade, candle, reason, trade_dur);
            tracing::debug!(
                "{}: {} hit at {:.8} (stop {:.8})",
                trade.pair,
                reason,
                price,
                trade.stop_loss
            );
            return Ok(ExitDecision::exit(reason, price, None));
        }

        // 2. ROI
        let roi_blocked = ctx.signals.enter && self.rules.ignore_roi_if_entry_signal;
        if !roi_blocked {
            if let Some((roi_entry, roi)) = self.rules.minimal_roi.entry_for(trade_dur) {
                let high_profit = trade.calc_profit_ratio(candle.high);
                if high_profit >= roi {
                    let price = self.roi_close_rate(trade, candle, roi_entry, roi, trade_dur)?;
                    return Ok(ExitDecision::exit(ExitType::Roi, price, None));
                }
            }
        }

        // 3. Exit signal or custom exit
        if self.rules.use_exit_signal {
            let rate = candle.open;
            let profit = trade.calc_profit_ratio(rate);

            // A fresh entry signal suppresses both signal and custom exits
            let signal_exit = if ctx.signals.enter {
                None
            } else if ctx.signals.exit {
                Some((ExitType::ExitSignal, ctx.signals.exit_tag.clone()))
            } else {
                strategy
                    .custom_exit(trade, ctx.now, rate, profit)
                    .map(|tag| (ExitType::CustomExit, Some(tag)))
            };
            let profit_ok = !self.rules.exit_profit_only || profit > self.rules.exit_profit_offset;
            let signal_exit = signal_exit.filter(|_| profit_ok);

            if let Some((reason, tag)) = signal_exit {
                let (low, high) = ctx.custom_price_range.unwrap_or((candle.low, candle.high));
                let price = strategy
                    .custom_exit_price(trade, ctx.now, rate, profit, tag.as_deref())
                    .max(low)
                    .min(high);
                return Ok(ExitDecision::exit(reason, price, tag));
            }
        }

        Ok(ExitDecision::none())
    }

    /// Fill price for a stop exit within `candle`
    fn stop_close_rate(
        &self,
        trade: &Trade,
        candle: &Candle,
        reason: ExitType,
        trade_dur: i64,
    ) -> f64 {
        // Stop already above the candle (e.g. after a cancelled exit)
        if trade.stop_loss > candle.high {
            return candle.open;
        }

        // Trailing stop triggered on the entry candle: assume the worst path
        if reason == ExitType::TrailingStopLoss && trade_dur == 0 {
            let stop_rate = match self.rules.trailing_stop_positive {
                Some(positive)
                    if self.rules.trailing_stop
                        && self.rules.trailing_only_offset_is_reached
                        && self.rules.trailing_stop_positive_offset != 0.0 =>
                {
                    candle.open
                        * (1.0 + self.rules.trailing_stop_positive_offset.abs() - positive.abs())
                }
                _ => candle.open * (1.0 - trade.stop_loss_pct.abs()),
            };
            return candle.low.max(stop_rate);
        }

        trade.stop_loss
    }

    /// Fill price for an ROI exit within `candle`
    fn roi_close_rate(
        &self,
        trade: &Trade,
        candle: &Candle,
        roi_entry: i64,
        roi: f64,
        trade_dur: i64,
    ) -> Result<f64> {
        let on_candle_boundary = roi_entry % self.timeframe_minutes == 0;

        if roi == -1.0 && on_candle_boundary {
            return Ok(candle.open);
        }

        // Rate at which per-unit profit after fees equals open_rate * roi
        let close_rate =
            -(trade.open_rate * roi + trade.open_rate * (1.0 + trade.fee_open)) / (trade.fee_close - 1.0);

        if trade_dur > 0 && trade_dur == roi_entry && on_candle_boundary && candle.open > close_rate {
            return Ok(candle.open);
        }

        if trade_dur == 0
            && candle.is_red()
            && trade.open_rate < candle.open
            && close_rate > candle.close
        {
            return Err(EngineError::OpeningCandleRoiViolation { trade_id: trade.id });
        }

        Ok(close_rate.max(candle.low).min(candle.high))
    }
}
