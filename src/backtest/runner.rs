use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::execution::exit::{ExitContext, ExitDecision, ExitEvaluator};
use crate::execution::fees::{apply_fee_adjustment, reconcile_fill};
use crate::execution::ledger::Ledger;
use crate::execution::order::Fill;
use crate::execution::pair_locks::{PairLock, PairLocks};
use crate::execution::trade::Trade;
use crate::execution::wallet::{
    available_stake, min_pair_stake, trade_stake_amount, validate_stake_amount, Wallet,
};
use crate::models::{amount_to_precision, split_pair, Candle, ExitType, FeeInfo, OrderSide, SignalSet};
use crate::strategy::{StakeRequest, Strategy, StrategyAdapter};
use crate::Result;

/// Historical candles per pair, oldest first
#[derive(Debug, Clone, Default)]
pub struct BacktestData {
    pub candles: BTreeMap<String, Vec<Candle>>,
    /// Finer candles used for exit evaluation inside each main candle
    pub detail: BTreeMap<String, Vec<Candle>>,
}

impl BacktestData {
    pub fn new(candles: BTreeMap<String, Vec<Candle>>) -> Self {
        Self {
            candles,
            detail: BTreeMap::new(),
        }
    }

    pub fn with_detail(mut self, detail: BTreeMap<String, Vec<Candle>>) -> Self {
        self.detail = detail;
        self
    }
}

/// Outcome of one backtest run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BacktestResult {
    pub strategy: String,
    /// Closed trades in creation order
    pub trades: Vec<Trade>,
    /// Trades left open by an aborted run
    pub open_trades: Vec<Trade>,
    pub starting_balance: f64,
    pub final_balance: f64,
    /// Entry signals skipped because every slot was taken
    pub rejected_signals: usize,
    pub timed_out_entries: usize,
    pub timed_out_exits: usize,
    pub locks: Vec<PairLock>,
    pub aborted: bool,
}

impl BacktestResult {
    pub fn total_profit(&self) -> f64 {
        self.trades.iter().filter_map(|t| t.close_profit_abs).sum()
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Mutable state of one run; dropped when the run ends
struct RunState {
    ledger: Ledger,
    wallet: Wallet,
    locks: PairLocks,
    rejected_signals: usize,
    timed_out_entries: usize,
    timed_out_exits: usize,
}

/// Deterministic candle-by-candle replay of the trade lifecycle
///
/// Pairs are processed in name order at every timestep; nothing depends on
/// the wall clock or on hash ordering.
pub struct BacktestRunner {
    config: EngineConfig,
    strategy: StrategyAdapter,
    evaluator: ExitEvaluator,
    abort: Arc<AtomicBool>,
}

impl BacktestRunner {
    pub fn new(config: EngineConfig, strategy: Arc<dyn Strategy>) -> Result<Self> {
        config.validate()?;
        let evaluator = ExitEvaluator::new(config.exit_rules.clone(), config.timeframe_minutes);
        Ok(Self {
            config,
            strategy: StrategyAdapter::new(strategy),
            evaluator,
            abort: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Flag checked before every timestep; setting it stops the run
    pub fn abort_handle(&self) -> Arc<AtomicBool> {
        self.abort.clone()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Replay `data` and return the resulting trades
    pub fn run(&self, data: &BacktestData) -> Result<BacktestResult> {
        let starting_balance = self
            .config
            .available_capital
            .unwrap_or(self.config.dry_run_wallet);

        let mut state = RunState {
            ledger: Ledger::new(),
            wallet: Wallet::new(&self.config.stake_currency, starting_balance),
            locks: PairLocks::new(),
            rejected_signals: 0,
            timed_out_entries: 0,
            timed_out_exits: 0,
        };

        let timeline: BTreeSet<DateTime<Utc>> = data
            .candles
            .values()
            .flat_map(|candles| candles.iter().map(|c| c.date))
            .collect();

        let indices: BTreeMap<&str, BTreeMap<DateTime<Utc>, usize>> = data
            .candles
            .iter()
            .map(|(pair, candles)| {
                let index = candles.iter().enumerate().map(|(i, c)| (c.date, i)).collect();
                (pair.as_str(), index)
            })
            .collect();

        tracing::info!(
            "🔬 Backtesting {} with {} pairs over {} timesteps",
            self.strategy.name(),
            data.candles.len(),
            timeline.len()
        );

        let mut aborted = false;
        for date in &timeline {
            if self.abort.load(Ordering::SeqCst) {
                tracing::warn!("Backtest aborted at {}", date);
                aborted = true;
                break;
            }

            for (pair, candles) in &data.candles {
                let Some(&idx) = indices.get(pair.as_str()).and_then(|index| index.get(date)) else {
                    continue;
                };

                if let Err(e) = self.process_candle(&mut state, data, pair, candles, idx) {
                    if e.is_integrity_violation() {
                        tracing::error!("{} @ {}: {}", pair, date, e);
                    } else {
                        tracing::warn!("{} @ {}: {}", pair, date, e);
                    }
                }
            }
        }

        if !aborted {
            self.finish(&mut state, data)?;
        }

        state.wallet.sync_from_ledger(&state.ledger);
        let final_balance = starting_balance + state.ledger.total_closed_profit();

        let trades: Vec<Trade> = state.ledger.closed_trades().into_iter().cloned().collect();
        let open_trades: Vec<Trade> = state.ledger.open_trades().into_iter().cloned().collect();

        tracing::info!(
            "Backtest complete: {} closed, {} open, profit {:.4} {}",
            trades.len(),
            open_trades.len(),
            final_balance - starting_balance,
            self.config.stake_currency
        );

        Ok(BacktestResult {
            strategy: self.strategy.name().to_string(),
            trades,
            open_trades,
            starting_balance,
            final_balance,
            rejected_signals: state.rejected_signals,
            timed_out_entries: state.timed_out_entries,
            timed_out_exits: state.timed_out_exits,
            locks: state.locks.all_locks(),
            aborted,
        })
    }

    /// Signals for candle `idx`, computed from the candles before it
    fn signals_for(&self, pair: &str, candles: &[Candle], idx: usize) -> SignalSet {
        let start = idx.saturating_sub(self.strategy.startup_candle_count());
        self.strategy.signal(pair, &candles[start..idx])
    }

    fn process_candle(
        &self,
        state: &mut RunState,
        data: &BacktestData,
        pair: &str,
        candles: &[Candle],
        idx: usize,
    ) -> Result<()> {
        let candle = &candles[idx];
        let signals = self.signals_for(pair, candles, idx);

        // (a) new entry
        if state.ledger.open_trade_for_pair(pair).is_none() && signals.enter && !signals.exit {
            self.try_enter(state, pair, candle, &signals)?;
        }

        let Some(trade_id) = state.ledger.open_trade_for_pair(pair).map(|t| t.id) else {
            return Ok(());
        };

        // (b) fill pending entry
        self.try_fill_open_order(state, trade_id, candle, OrderSide::Entry)?;

        // (c) position adjustment
        if self.config.position_adjustment.enabled {
            self.try_adjust_position(state, trade_id, candle)?;
        }

        // (d) exit evaluation
        let trade = state.ledger.trade(trade_id)?;
        if trade.is_open && !trade.has_open_order() && trade.amount > 0.0 {
            let detail = self.detail_window(data, pair, candle);
            let decision = self.evaluate(state, trade_id, candle, detail, &signals)?;
            if decision.should_exit {
                self.place_exit(state, trade_id, &decision, candle.date)?;
            }
        }

        // (e) fill pending exit
        self.try_fill_open_order(state, trade_id, candle, OrderSide::Exit)?;

        // (f) timeouts
        self.check_timeouts(state, trade_id, candle.date)?;

        Ok(())
    }

    fn try_enter(
        &self,
        state: &mut RunState,
        pair: &str,
        candle: &Candle,
        signals: &SignalSet,
    ) -> Result<()> {
        if state.locks.is_pair_locked(pair, candle.date) {
            tracing::debug!("{}: locked, skipping entry", pair);
            return Ok(());
        }

        if state.ledger.open_trade_count() >= self.config.max_open_trades {
            state.rejected_signals += 1;
            return Ok(());
        }

        let enter_tag = signals.enter_tag.as_deref();
        let rate = self
            .strategy
            .custom_entry_price(pair, candle.date, candle.open, enter_tag)
            .min(candle.high);

        let stake_config = self.config.stake_config();
        state.wallet.sync_from_ledger(&state.ledger);
        let available = available_stake(
            &state.wallet,
            state.ledger.total_open_stake(),
            state.ledger.total_closed_profit(),
            &stake_config,
        );

        let stake = match trade_stake_amount(
            pair,
            state.ledger.open_trade_count(),
            available,
            &stake_config,
        ) {
            Ok(stake) => stake,
            Err(EngineError::Dependency(reason)) => {
                tracing::debug!("{}: no stake ({})", pair, reason);
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let min_stake = min_pair_stake(
            self.config.market.min_amount,
            self.config.market.min_cost,
            rate,
            self.config.exit_rules.stoploss,
        );
        let stake = self.strategy.custom_stake_amount(&StakeRequest {
            pair,
            now: candle.date,
            rate,
            proposed_stake: stake,
            min_stake,
            max_stake: available,
            entry_tag: enter_tag,
        });
        let stake = validate_stake_amount(pair, stake, min_stake, available);
        if stake <= 0.0 {
            return Ok(());
        }

        let amount = amount_to_precision(stake / rate, self.config.market.amount_precision);
        if amount <= 0.0 {
            return Ok(());
        }

        if !self
            .strategy
            .confirm_trade_entry(pair, amount, rate, candle.date, enter_tag)
        {
            tracing::debug!("{}: entry not confirmed by strategy", pair);
            return Ok(());
        }

        let trade_id = state.ledger.create_trade(
            pair,
            candle.date,
            self.config.fee,
            signals.enter_tag.clone(),
        );
        state.ledger.place_order(
            trade_id,
            OrderSide::Entry,
            rate,
            amount,
            candle.date,
            None,
            signals.enter_tag.clone(),
        )?;
        Ok(())
    }

    /// Fill the trade's open order on `side` if its price traded in `candle`
    fn try_fill_open_order(
        &self,
        state: &mut RunState,
        trade_id: u64,
        candle: &Candle,
        side: OrderSide,
    ) -> Result<()> {
        let trade = state.ledger.trade(trade_id)?;
        let Some(order) = trade.open_order() else {
            return Ok(());
        };
        if order.side.is_entry() != side.is_entry() || !candle.contains(order.price) {
            return Ok(());
        }

        let order_id = order.order_id.clone();
        let price = order.price;
        self.fill_at(&mut state.ledger, trade_id, &order_id, price, candle.date)?;

        if side.is_entry() {
            return Ok(());
        }

        let trade = state.ledger.trade(trade_id)?;
        if trade.amount <= 0.0 {
            let pair = trade.pair.clone();
            let reason = trade.exit_reason.unwrap_or(ExitType::ExitSignal);
            state.ledger.close(trade_id, price, reason, candle.date)?;
            if self.config.protections.cooldown_minutes > 0 {
                state.locks.lock_pair(
                    &pair,
                    candle.date,
                    self.config.protections.cooldown_minutes,
                    Some("cooldown"),
                );
            }
        }
        Ok(())
    }

    /// Fill an order completely at `price` and reconcile its fee
    fn fill_at(
        &self,
        ledger: &mut Ledger,
        trade_id: u64,
        order_id: &str,
        price: f64,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let trade = ledger.trade(trade_id)?;
        let order = trade
            .order(order_id)
            .ok_or_else(|| EngineError::OrderNotFound(order_id.to_string()))?;

        let (_, quote) = split_pair(&trade.pair);
        let mut fill = Fill::full(order, price, at);
        fill.fee = Some(FeeInfo {
            cost: order.amount * price * self.config.fee,
            currency: quote.to_string(),
            rate: Some(self.config.fee),
        });
        ledger.fill_order(trade_id, order_id, &fill)?;

        let trade = ledger.trade(trade_id)?;
        let order = trade
            .order(order_id)
            .ok_or_else(|| EngineError::OrderNotFound(order_id.to_string()))?;
        let precision = self.config.market.amount_precision;
        let adjustment = reconcile_fill(trade, order, &[], trade.amount, |amount| {
            amount_to_precision(amount, precision)
        })?;
        ledger.update_trade(trade_id, |trade| apply_fee_adjustment(trade, &adjustment))
    }

    fn try_adjust_position(&self, state: &mut RunState, trade_id: u64, candle: &Candle) -> Result<()> {
        let trade = state.ledger.trade(trade_id)?;
        if trade.has_open_order() || trade.amount <= 0.0 {
            return Ok(());
        }

        let max_adjustments = self.config.position_adjustment.max_entry_position_adjustment;
        if max_adjustments > -1 && trade.nr_of_successful_entries() > max_adjustments as usize {
            return Ok(());
        }

        let rate = candle.open;
        let profit = trade.calc_profit_ratio(rate);

        state.wallet.sync_from_ledger(&state.ledger);
        let available = available_stake(
            &state.wallet,
            state.ledger.total_open_stake(),
            state.ledger.total_closed_profit(),
            &self.config.stake_config(),
        );
        let min_stake = min_pair_stake(
            self.config.market.min_amount,
            self.config.market.min_cost,
            rate,
            self.config.exit_rules.stoploss,
        );

        let Some(stake) = self.strategy.adjust_trade_position(
            trade,
            candle.date,
            rate,
            profit,
            min_stake,
            available,
        ) else {
            return Ok(());
        };

        let stake = validate_stake_amount(&trade.pair, stake, min_stake, available);
        let amount = amount_to_precision(stake / rate, self.config.market.amount_precision);
        if amount <= 0.0 {
            return Ok(());
        }

        tracing::debug!(
            "{}: adjusting position of trade {} by {:.4} stake",
            trade.pair,
            trade_id,
            stake
        );

        let order_id = state.ledger.place_order(
            trade_id,
            OrderSide::Entry,
            rate,
            amount,
            candle.date,
            None,
            Some("adjust".to_string()),
        )?;
        self.fill_at(&mut state.ledger, trade_id, &order_id, rate, candle.date)
    }

    /// Detail candles inside `candle`, if any were supplied
    fn detail_window<'a>(&self, data: &'a BacktestData, pair: &str, candle: &Candle) -> &'a [Candle] {
        let Some(detail) = data.detail.get(pair) else {
            return &[];
        };
        if self.config.detail_timeframe_minutes.is_none() {
            return &[];
        }

        let end = candle.date + Duration::minutes(self.config.timeframe_minutes);
        let from = detail.partition_point(|c| c.date < candle.date);
        let to = detail.partition_point(|c| c.date < end);
        &detail[from..to]
    }

    /// Run the exit evaluator over the detail candles, or the main candle
    fn evaluate(
        &self,
        state: &mut RunState,
        trade_id: u64,
        candle: &Candle,
        detail: &[Candle],
        signals: &SignalSet,
    ) -> Result<ExitDecision> {
        let candles: &[Candle] = if detail.is_empty() {
            std::slice::from_ref(candle)
        } else {
            detail
        };

        state.ledger.update_trade(trade_id, |trade| {
            for step in candles {
                let ctx = ExitContext::new(step.date, signals);
                let decision = self
                    .evaluator
                    .evaluate_exit(trade, Some(step), &ctx, &self.strategy)?;
                if decision.should_exit {
                    return Ok(decision);
                }
            }
            Ok(ExitDecision::none())
        })
    }

    fn place_exit(
        &self,
        state: &mut RunState,
        trade_id: u64,
        decision: &ExitDecision,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let (Some(reason), Some(price)) = (decision.reason, decision.at_price) else {
            return Ok(());
        };

        let trade = state.ledger.trade(trade_id)?;
        let amount = trade.amount;
        if !reason.is_stop() && !self.strategy.confirm_trade_exit(trade, amount, price, reason, at) {
            tracing::debug!("{}: exit not confirmed by strategy", trade.pair);
            return Ok(());
        }

        let side = if reason.is_stop() {
            OrderSide::Stop
        } else {
            OrderSide::Exit
        };
        state.ledger.place_order(
            trade_id,
            side,
            price,
            amount,
            at,
            None,
            decision.exit_tag.clone(),
        )?;
        state.ledger.update_trade(trade_id, |trade| {
            trade.exit_reason = Some(reason);
            trade.exit_tag = decision.exit_tag.clone();
            Ok(())
        })
    }

    fn check_timeouts(&self, state: &mut RunState, trade_id: u64, now: DateTime<Utc>) -> Result<()> {
        let trade = state.ledger.trade(trade_id)?;
        if !trade.is_open {
            return Ok(());
        }
        let Some(order) = trade.open_order() else {
            return Ok(());
        };

        let timeout = if order.side.is_entry() {
            self.config.unfilled_timeout.entry_minutes
        } else {
            self.config.unfilled_timeout.exit_minutes
        };
        if timeout <= 0 || now < order.created_at + Duration::minutes(timeout) {
            return Ok(());
        }

        let order_id = order.order_id.clone();
        if order.side.is_entry() {
            state.timed_out_entries += 1;
            if trade.nr_of_successful_entries() == 0 && order.filled <= 0.0 {
                state.ledger.remove_trade(trade_id)?;
            } else {
                state.ledger.update_trade(trade_id, |trade| {
                    if let Some(order) = trade.order_mut(&order_id) {
                        if order.filled > 0.0 {
                            order.close_partial(now);
                        } else {
                            order.cancel(now);
                        }
                    }
                    trade.recalc_from_orders();
                    Ok(())
                })?;
            }
        } else {
            state.timed_out_exits += 1;
            state.ledger.cancel_order(trade_id, &order_id, now)?;
            state.ledger.update_trade(trade_id, |trade| {
                trade.exit_reason = None;
                trade.exit_tag = None;
                trade.exit_timeouts += 1;
                Ok(())
            })?;
        }
        Ok(())
    }

    /// Force-exit what is still open at the last candle of its pair
    fn finish(&self, state: &mut RunState, data: &BacktestData) -> Result<()> {
        for trade_id in state.ledger.open_trade_ids() {
            let trade = state.ledger.trade(trade_id)?;
            if trade.nr_of_successful_entries() == 0 {
                tracing::debug!("Dropping trade {} ({}): entry never filled", trade_id, trade.pair);
                state.ledger.remove_trade(trade_id)?;
                continue;
            }

            let Some(last) = data.candles.get(&trade.pair).and_then(|c| c.last()) else {
                continue;
            };
            let (rate, date) = (last.open, last.date);

            if let Some(order_id) = trade.open_order().map(|o| o.order_id.clone()) {
                state.ledger.cancel_order(trade_id, &order_id, date)?;
            }

            let amount = state.ledger.trade(trade_id)?.amount;
            let order_id = state.ledger.place_order(
                trade_id,
                OrderSide::Exit,
                rate,
                amount,
                date,
                None,
                Some(ExitType::ForceExit.as_str().to_string()),
            )?;
            self.fill_at(&mut state.ledger, trade_id, &order_id, rate, date)?;
            state.ledger.close(trade_id, rate, ExitType::ForceExit, date)?;
        }
        Ok(())
    }
}
