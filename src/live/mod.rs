//! Live cycle orchestrator
//!
//! Drives the ledger, wallet, exit evaluator and fee reconciler against an
//! [`Exchange`]. Every mutation happens inside one exclusive section per
//! call, so a manual `force_exit` and an automatic exit of the same trade
//! are serialised.

use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::exchange::{Exchange, ExchangeOrder, OrderRequest};
use crate::execution::candle_buffer::CandleBuffer;
use crate::execution::exit::{ExitContext, ExitEvaluator};
use crate::execution::fees::reconcile_order_fees;
use crate::execution::ledger::Ledger;
use crate::execution::pair_locks::{PairLock, PairLocks};
use crate::execution::trade::Trade;
use crate::execution::wallet::{available_stake, trade_stake_amount, validate_stake_amount, Wallet};
use crate::models::{split_pair, Candle, ExitType, OrderSide, OrderStatus, SignalSet};
use crate::notify::{NotificationSink, TradeEvent};
use crate::strategy::{StakeRequest, Strategy, StrategyAdapter};
use crate::Result;

/// Wallet holdings this far below the trade amount are still sold in full
pub const EXIT_AMOUNT_TOLERANCE: f64 = 0.02;

/// Amount to sell for a trade given what the wallet actually holds.
///
/// Fees taken in the base currency can leave the wallet slightly short of
/// the recorded amount; within 2% the wallet amount is used instead.
pub fn safe_exit_amount(pair: &str, trade_amount: f64, wallet_amount: f64) -> Result<f64> {
    if wallet_amount >= trade_amount {
        return Ok(trade_amount);
    }
    if wallet_amount >= trade_amount * (1.0 - EXIT_AMOUNT_TOLERANCE) {
        tracing::info!(
            "{}: selling wallet amount {:.8} instead of trade amount {:.8}",
            pair,
            wallet_amount,
            trade_amount
        );
        return Ok(wallet_amount);
    }
    Err(EngineError::Dependency(format!(
        "{}: not enough balance to exit (wallet {:.8}, trade {:.8})",
        pair, wallet_amount, trade_amount
    )))
}

struct LiveState {
    ledger: Ledger,
    wallet: Wallet,
    locks: PairLocks,
    /// Trades stopped after an integrity violation
    halted: BTreeSet<u64>,
}

pub struct LiveEngine<E: Exchange> {
    config: EngineConfig,
    exchange: Arc<E>,
    strategy: StrategyAdapter,
    evaluator: ExitEvaluator,
    candles: CandleBuffer,
    notifier: NotificationSink,
    state: Mutex<LiveState>,
}

impl<E: Exchange> LiveEngine<E> {
    pub fn new(
        config: EngineConfig,
        exchange: Arc<E>,
        strategy: Arc<dyn Strategy>,
        notifier: NotificationSink,
    ) -> Result<Self> {
        config.validate()?;

        let strategy = StrategyAdapter::new(strategy);
        let candles = CandleBuffer::new(strategy.startup_candle_count().max(100));
        let starting_balance = config.available_capital.unwrap_or(config.dry_run_wallet);

        Ok(Self {
            evaluator: ExitEvaluator::new(config.exit_rules.clone(), config.timeframe_minutes),
            state: Mutex::new(LiveState {
                ledger: Ledger::new(),
                wallet: Wallet::new(&config.stake_currency, starting_balance),
                locks: PairLocks::new(),
                halted: BTreeSet::new(),
            }),
            config,
            exchange,
            strategy,
            candles,
            notifier,
        })
    }

    /// Restore persisted trades and re-apply the configured stoploss
    pub fn with_trades(mut self, trades: Vec<Trade>) -> Self {
        let stoploss = self.config.exit_rules.stoploss;
        let state = self.state.get_mut();
        state.ledger = Ledger::with_trades(trades);
        let changed = state.ledger.stoploss_reinitialization(stoploss);
        if changed > 0 {
            tracing::info!("Reinitialized stoploss on {} restored trades", changed);
        }
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Candle windows fed to the strategy
    pub fn candles(&self) -> &CandleBuffer {
        &self.candles
    }

    pub async fn trades(&self) -> Vec<Trade> {
        self.state.lock().await.ledger.all_trades().to_vec()
    }

    pub async fn open_trades(&self) -> Vec<Trade> {
        let state = self.state.lock().await;
        state.ledger.open_trades().into_iter().cloned().collect()
    }

    pub async fn wallet(&self) -> Wallet {
        self.state.lock().await.wallet.clone()
    }

    pub async fn locks(&self) -> Vec<PairLock> {
        self.state.lock().await.locks.all_locks()
    }

    pub async fn halted_trades(&self) -> Vec<u64> {
        self.state.lock().await.halted.iter().copied().collect()
    }

    /// Let a halted trade be processed again
    pub async fn resume_trade(&self, trade_id: u64) -> bool {
        let resumed = self.state.lock().await.halted.remove(&trade_id);
        if resumed {
            tracing::info!("▶️ Resuming trade {}", trade_id);
        }
        resumed
    }

    // ========================================================================
    // Cycle
    // ========================================================================

    /// Run one cycle: wallet, fills, timeouts, exits, position adjustment,
    /// entries.
    ///
    /// Per-trade failures are handled here; only a failed wallet refresh is
    /// returned, in which case the whole cycle is retried next time.
    pub async fn process(&self, now: DateTime<Utc>) -> Result<()> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        self.refresh_wallet(state).await?;
        self.update_open_orders(state, now).await;
        self.handle_timeouts(state, now).await;
        self.refresh_wallet(state).await?;
        self.process_exits(state, now).await;

        if self.config.position_adjustment.enabled {
            self.process_adjustments(state, now).await;
        }

        self.process_entries(state, now).await;

        tracing::debug!(
            "🔄 Cycle done: {} open trades, closed profit {:.4}",
            state.ledger.open_trade_count(),
            state.ledger.total_closed_profit()
        );
        Ok(())
    }

    /// Close a trade at the current price, cancelling any open order first
    pub async fn force_exit(&self, trade_id: u64, now: DateTime<Utc>) -> Result<()> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        let trade = state.ledger.trade(trade_id)?;
        if !trade.is_open {
            return Err(EngineError::AlreadyClosed(trade_id));
        }
        let pair = trade.pair.clone();
        tracing::info!("🚪 Force exit requested for trade {} ({})", trade_id, pair);

        if let Some(order_id) = trade.open_order().map(|o| o.order_id.clone()) {
            let cancelled = self.exchange.cancel_order(&order_id, &pair).await?;
            self.apply_exchange_order(state, trade_id, &cancelled, now, "force exit")
                .await?;
        }

        // Cancelling an unfilled first entry removes the trade
        let Ok(trade) = state.ledger.trade(trade_id) else {
            return Ok(());
        };
        if trade.amount <= 0.0 {
            return Ok(());
        }

        self.refresh_wallet(state).await?;
        let rate = self.exchange.current_price(&pair, OrderSide::Exit).await?;
        self.execute_exit(state, trade_id, ExitType::ForceExit, rate, None, now)
            .await
    }

    async fn refresh_wallet(&self, state: &mut LiveState) -> Result<()> {
        let balances = self.exchange.balances().await?;
        state.wallet.sync_from_exchange(balances);
        Ok(())
    }

    /// Trades the cycle may touch, in id order
    fn active_trade_ids(state: &LiveState) -> Vec<u64> {
        state
            .ledger
            .open_trade_ids()
            .into_iter()
            .filter(|id| !state.halted.contains(id))
            .collect()
    }

    async fn update_open_orders(&self, state: &mut LiveState, now: DateTime<Utc>) {
        for trade_id in Self::active_trade_ids(state) {
            let Ok(trade) = state.ledger.trade(trade_id) else {
                continue;
            };
            let Some(order) = trade.open_order() else {
                continue;
            };
            let (order_id, pair) = (order.order_id.clone(), trade.pair.clone());

            let result = match self.exchange.fetch_order(&order_id, &pair).await {
                Ok(order) => {
                    self.apply_exchange_order(state, trade_id, &order, now, "cancelled on exchange")
                        .await
                }
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                self.handle_trade_error(state, trade_id, e, now).await;
            }
        }
    }

    async fn handle_timeouts(&self, state: &mut LiveState, now: DateTime<Utc>) {
        for trade_id in Self::active_trade_ids(state) {
            if let Err(e) = self.check_timeout(state, trade_id, now).await {
                self.handle_trade_error(state, trade_id, e, now).await;
            }
        }
    }

    async fn check_timeout(&self, state: &mut LiveState, trade_id: u64, now: DateTime<Utc>) -> Result<()> {
        let trade = state.ledger.trade(trade_id)?;
        let Some(order) = trade.open_order() else {
            return Ok(());
        };

        let is_entry = order.side.is_entry();
        let timeout = if is_entry {
            self.config.unfilled_timeout.entry_minutes
        } else {
            self.config.unfilled_timeout.exit_minutes
        };
        if timeout <= 0 || now < order.created_at + Duration::minutes(timeout) {
            return Ok(());
        }

        if !is_entry && order.filled > 0.0 {
            tracing::debug!(
                "Exit order {} of trade {} partially filled, keeping it open",
                order.order_id,
                trade_id
            );
            return Ok(());
        }

        let (order_id, pair) = (order.order_id.clone(), trade.pair.clone());
        tracing::info!(
            "⏰ {} order {} for {} unfilled after {} minutes, cancelling",
            order.side.as_str(),
            order_id,
            pair,
            timeout
        );

        let cancelled = self.exchange.cancel_order(&order_id, &pair).await?;
        self.apply_exchange_order(state, trade_id, &cancelled, now, "unfilled timeout")
            .await?;

        if is_entry || cancelled.status != OrderStatus::Canceled {
            return Ok(());
        }

        let exit_timeouts = state.ledger.update_trade(trade_id, |trade| {
            trade.exit_timeouts += 1;
            Ok(trade.exit_timeouts)
        })?;

        let limit = self.config.unfilled_timeout.exit_timeout_count;
        if limit > 0 && exit_timeouts >= limit {
            tracing::warn!(
                "Trade {} hit {} exit timeouts, placing emergency exit",
                trade_id,
                exit_timeouts
            );
            self.refresh_wallet(state).await?;
            let rate = self.exchange.current_price(&pair, OrderSide::Exit).await?;
            self.execute_exit(state, trade_id, ExitType::EmergencyExit, rate, None, now)
                .await?;
        }
        Ok(())
    }

    fn signals(&self, pair: &str) -> SignalSet {
        let window = self
            .candles
            .get_recent_candles(pair, self.strategy.startup_candle_count());
        self.strategy.signal(pair, &window)
    }

    async fn process_exits(&self, state: &mut LiveState, now: DateTime<Utc>) {
        for trade_id in Self::active_trade_ids(state) {
            if let Err(e) = self.check_exit(state, trade_id, now).await {
                self.handle_trade_error(state, trade_id, e, now).await;
            }
        }
    }

    async fn check_exit(&self, state: &mut LiveState, trade_id: u64, now: DateTime<Utc>) -> Result<()> {
        let trade = state.ledger.trade(trade_id)?;
        if trade.has_open_order() || trade.amount <= 0.0 {
            return Ok(());
        }
        let pair = trade.pair.clone();

        let rate = self.exchange.current_price(&pair, OrderSide::Exit).await?;
        let candle = Candle::flat(now, rate);
        let signals = self.signals(&pair);

        let distance = self.config.custom_price_max_distance_ratio;
        let mut ctx = ExitContext::new(now, &signals);
        ctx.custom_price_range = Some((rate * (1.0 - distance), rate * (1.0 + distance)));

        let decision = state.ledger.update_trade(trade_id, |trade| {
            self.evaluator
                .evaluate_exit(trade, Some(&candle), &ctx, &self.strategy)
        })?;

        let (Some(reason), Some(price)) = (decision.reason, decision.at_price) else {
            return Ok(());
        };
        self.execute_exit(state, trade_id, reason, price, decision.exit_tag, now)
            .await
    }

    async fn process_adjustments(&self, state: &mut LiveState, now: DateTime<Utc>) {
        for trade_id in Self::active_trade_ids(state) {
            if let Err(e) = self.adjust_position(state, trade_id, now).await {
                self.handle_trade_error(state, trade_id, e, now).await;
            }
            // Later trades size their stake from the balance left after this one
            if let Err(e) = self.refresh_wallet(state).await {
                tracing::warn!("Wallet refresh failed, skipping remaining adjustments: {}", e);
                return;
            }
        }
    }

    async fn adjust_position(&self, state: &mut LiveState, trade_id: u64, now: DateTime<Utc>) -> Result<()> {
        let trade = state.ledger.trade(trade_id)?;
        if trade.has_open_order() || trade.amount <= 0.0 {
            return Ok(());
        }
        let max_adjustments = self.config.position_adjustment.max_entry_position_adjustment;
        if max_adjustments > -1 && trade.nr_of_successful_entries() > max_adjustments as usize {
            return Ok(());
        }

        let pair = trade.pair.clone();
        let rate = self.exchange.current_price(&pair, OrderSide::Entry).await?;
        let profit = trade.calc_profit_ratio(rate);
        let available = available_stake(
            &state.wallet,
            state.ledger.total_open_stake(),
            state.ledger.total_closed_profit(),
            &self.config.stake_config(),
        );
        let min_stake = self
            .exchange
            .min_stake_amount(&pair, rate, self.config.exit_rules.stoploss)
            .await?;

        let Some(stake) =
            self.strategy
                .adjust_trade_position(trade, now, rate, profit, min_stake, available)
        else {
            return Ok(());
        };
        let stake = validate_stake_amount(&pair, stake, min_stake, available);
        let amount = self.exchange.amount_to_precision(&pair, stake / rate);
        if amount <= 0.0 {
            return Ok(());
        }

        let order = self
            .exchange
            .place_order(&OrderRequest {
                pair: pair.clone(),
                side: OrderSide::Entry,
                amount,
                price: rate,
            })
            .await?;
        state.ledger.place_order(
            trade_id,
            OrderSide::Entry,
            order.price,
            order.amount,
            now,
            Some(order.order_id.clone()),
            Some("adjust".to_string()),
        )?;
        tracing::info!("➕ Adding {:.4} stake to trade {} ({})", stake, trade_id, pair);
        self.apply_exchange_order(state, trade_id, &order, now, "cancelled on exchange")
            .await
    }

    async fn process_entries(&self, state: &mut LiveState, now: DateTime<Utc>) {
        for pair in &self.config.pair_whitelist {
            if state.ledger.open_trade_for_pair(pair).is_some() {
                continue;
            }
            if state.locks.is_pair_locked(pair, now) {
                tracing::debug!("{}: locked, skipping entry", pair);
                continue;
            }
            if state.ledger.open_trade_count() >= self.config.max_open_trades {
                tracing::debug!("All {} slots taken", self.config.max_open_trades);
                return;
            }

            let signals = self.signals(pair);
            if !signals.enter || signals.exit {
                continue;
            }

            if let Err(e) = self.execute_entry(state, pair, &signals, now).await {
                match e {
                    EngineError::Dependency(reason) => {
                        tracing::debug!("{}: skipping entry ({})", pair, reason)
                    }
                    e => tracing::warn!("{}: entry failed: {}", pair, e),
                }
            }
            if let Err(e) = self.refresh_wallet(state).await {
                tracing::warn!("Wallet refresh failed, skipping remaining entries: {}", e);
                return;
            }
        }
    }

    async fn execute_entry(
        &self,
        state: &mut LiveState,
        pair: &str,
        signals: &SignalSet,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let enter_tag = signals.enter_tag.as_deref();
        let proposed = self.exchange.current_price(pair, OrderSide::Entry).await?;
        let distance = self.config.custom_price_max_distance_ratio;
        let rate = self
            .strategy
            .custom_entry_price(pair, now, proposed, enter_tag)
            .max(proposed * (1.0 - distance))
            .min(proposed * (1.0 + distance));

        let stake_config = self.config.stake_config();
        let available = available_stake(
            &state.wallet,
            state.ledger.total_open_stake(),
            state.ledger.total_closed_profit(),
            &stake_config,
        );
        let stake = trade_stake_amount(pair, state.ledger.open_trade_count(), available, &stake_config)?;

        let min_stake = self
            .exchange
            .min_stake_amount(pair, rate, self.config.exit_rules.stoploss)
            .await?;
        let stake = self.strategy.custom_stake_amount(&StakeRequest {
            pair,
            now,
            rate,
            proposed_stake: stake,
            min_stake,
            max_stake: available,
            entry_tag: enter_tag,
        });
        let stake = validate_stake_amount(pair, stake, min_stake, available);
        let amount = self.exchange.amount_to_precision(pair, stake / rate);
        if stake <= 0.0 || amount <= 0.0 {
            return Ok(());
        }

        if !self.strategy.confirm_trade_entry(pair, amount, rate, now, enter_tag) {
            tracing::debug!("{}: entry not confirmed by strategy", pair);
            return Ok(());
        }

        let fee = self.exchange.fee(pair).await?;
        let order = self
            .exchange
            .place_order(&OrderRequest {
                pair: pair.to_string(),
                side: OrderSide::Entry,
                amount,
                price: rate,
            })
            .await?;

        let trade_id = state
            .ledger
            .create_trade(pair, now, fee, signals.enter_tag.clone());
        state.ledger.place_order(
            trade_id,
            OrderSide::Entry,
            order.price,
            order.amount,
            now,
            Some(order.order_id.clone()),
            signals.enter_tag.clone(),
        )?;

        self.notifier
            .emit(TradeEvent::Entry {
                trade_id,
                pair: pair.to_string(),
                rate,
                stake,
                enter_tag: signals.enter_tag.clone(),
            })
            .await;

        if let Err(e) = self
            .apply_exchange_order(state, trade_id, &order, now, "cancelled on exchange")
            .await
        {
            self.handle_trade_error(state, trade_id, e, now).await;
        }
        Ok(())
    }

    /// Place the exit order for a trade.
    ///
    /// A rejected protective stop is replaced by an emergency exit at the
    /// current price.
    async fn execute_exit(
        &self,
        state: &mut LiveState,
        trade_id: u64,
        reason: ExitType,
        rate: f64,
        exit_tag: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let trade = state.ledger.trade(trade_id)?;
        let pair = trade.pair.clone();
        let (base, _) = split_pair(&pair);
        let amount = safe_exit_amount(&pair, trade.amount, state.wallet.free(base))?;
        let amount = self.exchange.amount_to_precision(&pair, amount);

        let forced = reason.is_stop() || matches!(reason, ExitType::ForceExit | ExitType::EmergencyExit);
        if !forced && !self.strategy.confirm_trade_exit(trade, amount, rate, reason, now) {
            tracing::debug!("{}: exit not confirmed by strategy", pair);
            return Ok(());
        }

        let side = if reason.is_stop() {
            OrderSide::Stop
        } else {
            OrderSide::Exit
        };
        let request = OrderRequest {
            pair: pair.clone(),
            side,
            amount,
            price: rate,
        };

        let (order, reason) = match self.exchange.place_order(&request).await {
            Ok(order) => (order, reason),
            Err(EngineError::InvalidOrder(message)) if side == OrderSide::Stop => {
                tracing::warn!(
                    "Stop order for trade {} rejected ({}), exiting at market",
                    trade_id,
                    message
                );
                let price = self.exchange.current_price(&pair, OrderSide::Exit).await?;
                let request = OrderRequest {
                    side: OrderSide::Exit,
                    price,
                    ..request
                };
                (self.exchange.place_order(&request).await?, ExitType::EmergencyExit)
            }
            Err(e) => return Err(e),
        };

        state.ledger.place_order(
            trade_id,
            order.side,
            order.price,
            order.amount,
            now,
            Some(order.order_id.clone()),
            exit_tag.clone(),
        )?;
        state.ledger.update_trade(trade_id, |trade| {
            trade.exit_reason = Some(reason);
            trade.exit_tag = exit_tag.clone();
            Ok(())
        })?;

        self.notifier
            .emit(TradeEvent::Exit {
                trade_id,
                pair,
                rate: order.price,
                exit_type: reason,
                exit_tag,
            })
            .await;

        self.apply_exchange_order(state, trade_id, &order, now, "cancelled on exchange")
            .await
    }

    /// Bring the ledger in line with the exchange's view of one order.
    ///
    /// Finished orders are fee-reconciled; a filled exit closes the trade and
    /// a cancelled, never-filled first entry removes it.
    async fn apply_exchange_order(
        &self,
        state: &mut LiveState,
        trade_id: u64,
        order: &ExchangeOrder,
        now: DateTime<Utc>,
        cancel_reason: &str,
    ) -> Result<()> {
        let applied = state
            .ledger
            .fill_order(trade_id, &order.order_id, &order.to_fill())?;
        if !applied || order.status == OrderStatus::Open {
            return Ok(());
        }

        let cancelled = order.status == OrderStatus::Canceled;
        if cancelled && order.filled > 0.0 {
            // Keep the filled part as a smaller order
            state.ledger.update_trade(trade_id, |trade| {
                if let Some(o) = trade.order_mut(&order.order_id) {
                    o.close_partial(now);
                }
                trade.recalc_from_orders();
                Ok(())
            })?;
        }

        reconcile_order_fees(
            self.exchange.as_ref(),
            &mut state.ledger,
            &state.wallet,
            trade_id,
            &order.order_id,
        )
        .await?;

        let trade = state.ledger.trade(trade_id)?;
        let pair = trade.pair.clone();

        if order.side.is_entry() {
            if order.filled > 0.0 {
                self.notifier
                    .emit(TradeEvent::EntryFill {
                        trade_id,
                        pair,
                        open_rate: trade.open_rate,
                        amount: trade.amount,
                    })
                    .await;
            } else if trade.nr_of_successful_entries() == 0 {
                state.ledger.remove_trade(trade_id)?;
                self.notifier
                    .emit(TradeEvent::EntryCancel {
                        trade_id,
                        pair,
                        reason: cancel_reason.to_string(),
                    })
                    .await;
            }
            return Ok(());
        }

        if trade.amount <= 0.0 {
            let reason = trade.exit_reason.unwrap_or(ExitType::ExitSignal);
            let rate = order.average.unwrap_or(order.price);
            state.ledger.close(trade_id, rate, reason, now)?;

            let trade = state.ledger.trade(trade_id)?;
            self.notifier
                .emit(TradeEvent::ExitFill {
                    trade_id,
                    pair: pair.clone(),
                    close_rate: rate,
                    profit_abs: trade.close_profit_abs.unwrap_or(0.0),
                    profit_ratio: trade.close_profit.unwrap_or(0.0),
                })
                .await;

            if self.config.protections.cooldown_minutes > 0 {
                state.locks.lock_pair(
                    &pair,
                    now,
                    self.config.protections.cooldown_minutes,
                    Some("cooldown"),
                );
            }
        } else if cancelled {
            state.ledger.update_trade(trade_id, |trade| {
                trade.exit_reason = None;
                trade.exit_tag = None;
                Ok(())
            })?;
            self.notifier
                .emit(TradeEvent::ExitCancel {
                    trade_id,
                    pair,
                    reason: cancel_reason.to_string(),
                })
                .await;
        }
        Ok(())
    }

    async fn handle_trade_error(
        &self,
        state: &mut LiveState,
        trade_id: u64,
        error: EngineError,
        now: DateTime<Utc>,
    ) {
        if error.is_integrity_violation() {
            tracing::error!("🛑 Halting trade {}: {}", trade_id, error);
            state.halted.insert(trade_id);
            self.notifier
                .emit(TradeEvent::Warning {
                    message: format!("Trade {} halted: {}", trade_id, error),
                })
                .await;
            return;
        }

        match error {
            EngineError::InsufficientFunds(message) => {
                tracing::warn!(
                    "Insufficient funds on trade {} ({}), re-checking its orders",
                    trade_id,
                    message
                );
                self.recover_trade(state, trade_id, now).await;
            }
            EngineError::InvalidOrder(message) => {
                tracing::warn!("Order for trade {} rejected: {}", trade_id, message);
            }
            EngineError::Dependency(message) => {
                tracing::debug!("Trade {}: {}", trade_id, message);
            }
            error if error.is_retryable() => {
                tracing::warn!("Trade {}: {} (retrying next cycle)", trade_id, error);
            }
            error => {
                tracing::error!("Trade {}: {}", trade_id, error);
            }
        }
    }

    /// Re-fetch every open order of a trade and re-apply its state
    async fn recover_trade(&self, state: &mut LiveState, trade_id: u64, now: DateTime<Utc>) {
        let Ok(trade) = state.ledger.trade(trade_id) else {
            return;
        };
        let pair = trade.pair.clone();
        let order_ids: Vec<String> = trade
            .orders
            .iter()
            .filter(|o| o.is_open())
            .map(|o| o.order_id.clone())
            .collect();

        for order_id in order_ids {
            let result = match self.exchange.fetch_order(&order_id, &pair).await {
                Ok(order) => {
                    self.apply_exchange_order(state, trade_id, &order, now, "recovered")
                        .await
                }
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                tracing::warn!("Recovery of order {} failed: {}", order_id, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MarketLimits, StakeAmount};
    use crate::exchange::DryRunExchange;
    use crate::execution::exit::RoiTable;
    use chrono::TimeZone;

    struct AlwaysEnter;

    impl Strategy for AlwaysEnter {
        fn name(&self) -> &str {
            "AlwaysEnter"
        }

        fn signal(&self, _pair: &str, _window: &[Candle]) -> Result<SignalSet> {
            Ok(SignalSet::entry(Some("test")))
        }
    }

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.stake_amount = Some(StakeAmount::Fixed(100.0));
        config.pair_whitelist = vec!["BTC/USDT".to_string()];
        config.max_open_trades = 1;
        config.exit_rules.minimal_roi = RoiTable::new([(0, 0.05)]);
        config.exit_rules.stoploss = -0.10;
        config
    }

    async fn engine(config: EngineConfig) -> (LiveEngine<DryRunExchange>, Arc<DryRunExchange>) {
        let exchange = Arc::new(DryRunExchange::new(
            "USDT",
            1000.0,
            config.fee,
            MarketLimits::default(),
        ));
        exchange.set_price("BTC/USDT", 100.0).await;
        exchange.set_clock(start()).await;

        let engine = LiveEngine::new(
            config,
            exchange.clone(),
            Arc::new(AlwaysEnter),
            NotificationSink::disabled(),
        )
        .unwrap();
        engine.candles().add_candle("BTC/USDT", Candle::flat(start(), 100.0));
        (engine, exchange)
    }

    #[test]
    fn test_safe_exit_amount() {
        assert_eq!(safe_exit_amount("BTC/USDT", 1.0, 2.0).unwrap(), 1.0);
        assert_eq!(safe_exit_amount("BTC/USDT", 1.0, 0.99).unwrap(), 0.99);
        assert!(matches!(
            safe_exit_amount("BTC/USDT", 1.0, 0.9),
            Err(EngineError::Dependency(_))
        ));
    }

    #[tokio::test]
    async fn test_entry_then_roi_exit() {
        tracing_subscriber::fmt()
            .with_env_filter("tradecore=debug")
            .try_init()
            .ok();

        let (engine, exchange) = engine(config()).await;

        engine.process(start()).await.unwrap();
        let open = engine.open_trades().await;
        assert_eq!(open.len(), 1);
        assert!((open[0].amount - 1.0).abs() < 1e-9);
        assert!((open[0].open_rate - 100.0).abs() < 1e-9);
        assert!((open[0].fee_open_cost - 0.1).abs() < 1e-9);

        exchange.set_price("BTC/USDT", 106.0).await;
        engine.process(start() + Duration::minutes(5)).await.unwrap();

        let trades = engine.trades().await;
        let first = trades.iter().find(|t| t.id == 1).unwrap();
        assert!(!first.is_open);
        assert_eq!(first.exit_reason, Some(ExitType::Roi));
        assert_eq!(first.close_rate, Some(106.0));
        assert!(first.close_profit_abs.unwrap() > 5.0);
    }

    #[tokio::test]
    async fn test_unfilled_entry_times_out() {
        let (engine, exchange) = engine(config()).await;
        exchange.set_auto_fill(false).await;

        engine.process(start()).await.unwrap();
        assert_eq!(engine.open_trades().await[0].id, 1);

        // Not yet expired
        engine.process(start() + Duration::minutes(5)).await.unwrap();
        assert!(engine.trades().await.iter().any(|t| t.id == 1));

        engine.process(start() + Duration::minutes(11)).await.unwrap();
        let trades = engine.trades().await;
        assert!(!trades.iter().any(|t| t.id == 1));
        // The cycle's entry phase placed a fresh order
        assert_eq!(exchange.open_orders().await.len(), 1);
    }

    #[tokio::test]
    async fn test_partially_filled_entry_keeps_filled_part() {
        let (engine, exchange) = engine(config()).await;
        exchange.set_auto_fill(false).await;

        engine.process(start()).await.unwrap();
        let order_id = exchange.open_orders().await[0].order_id.clone();
        exchange.fill_order(&order_id, 0.4).await.unwrap();

        engine.process(start() + Duration::minutes(11)).await.unwrap();
        let trade = engine.open_trades().await.into_iter().find(|t| t.id == 1).unwrap();
        assert!((trade.amount - 0.4).abs() < 1e-9);
        assert!(!trade.has_open_order());
        assert_eq!(trade.nr_of_successful_entries(), 1);
    }

    #[tokio::test]
    async fn test_force_exit() {
        let (engine, exchange) = engine(config()).await;
        engine.process(start()).await.unwrap();

        exchange.set_price("BTC/USDT", 101.0).await;
        engine.force_exit(1, start() + Duration::minutes(1)).await.unwrap();

        let trades = engine.trades().await;
        assert_eq!(trades[0].exit_reason, Some(ExitType::ForceExit));
        assert_eq!(trades[0].close_rate, Some(101.0));
        assert!(matches!(
            engine.force_exit(1, start()).await,
            Err(EngineError::AlreadyClosed(1))
        ));
    }

    #[tokio::test]
    async fn test_rejected_stop_becomes_emergency_exit() {
        let (engine, exchange) = engine(config()).await;
        engine.process(start()).await.unwrap();

        exchange.set_price("BTC/USDT", 85.0).await;
        exchange
            .fail_next_order(EngineError::InvalidOrder("stop price out of range".to_string()))
            .await;
        engine.process(start() + Duration::minutes(5)).await.unwrap();

        let trades = engine.trades().await;
        let first = trades.iter().find(|t| t.id == 1).unwrap();
        assert!(!first.is_open);
        assert_eq!(first.exit_reason, Some(ExitType::EmergencyExit));
        assert_eq!(first.close_rate, Some(85.0));
    }

    #[tokio::test]
    async fn test_cooldown_lock_blocks_reentry() {
        let mut config = config();
        config.protections.cooldown_minutes = 30;
        let (engine, _exchange) = engine(config).await;

        engine.process(start()).await.unwrap();
        engine.force_exit(1, start()).await.unwrap();
        engine.process(start() + Duration::minutes(5)).await.unwrap();

        assert!(engine.open_trades().await.is_empty());
        assert_eq!(engine.locks().await.len(), 1);

        engine.process(start() + Duration::minutes(30)).await.unwrap();
        assert_eq!(engine.open_trades().await.len(), 1);
    }
}
