use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

use crate::error::EngineError;
use crate::execution::order::{Fill, Order};
use crate::execution::trade::Trade;
use crate::models::{ExitType, OrderSide};
use crate::Result;

/// Canonical trade and order state for one engine instance
#[derive(Debug, Clone)]
pub struct Ledger {
    trades: Vec<Trade>,
    next_trade_id: u64,
    next_order_id: u64,
    total_closed_profit: f64,
}

impl Default for Ledger {
    fn default() -> Self {
        Self::new()
    }
}

impl Ledger {
    pub fn new() -> Self {
        Self {
            trades: Vec::new(),
            next_trade_id: 1,
            next_order_id: 1,
            total_closed_profit: 0.0,
        }
    }

    /// Create a Ledger and restore previously persisted trades
    ///
    /// Recalculates closed profit and id counters from the loaded trades
    pub fn with_trades(trades: Vec<Trade>) -> Self {
        let total_closed_profit: f64 = trades
            .iter()
            .filter(|t| !t.is_open)
            .filter_map(|t| t.close_profit_abs)
            .sum();

        let next_trade_id = trades.iter().map(|t| t.id).max().unwrap_or(0) + 1;
        let next_order_id = trades
            .iter()
            .flat_map(|t| t.orders.iter().map(|o| o.id))
            .max()
            .unwrap_or(0)
            + 1;

        tracing::info!(
            "Restored {} trades into ledger (closed profit: {:.4})",
            trades.len(),
            total_closed_profit
        );

        Self {
            trades,
            next_trade_id,
            next_order_id,
            total_closed_profit,
        }
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn all_trades(&self) -> &[Trade] {
        &self.trades
    }

    pub fn trade(&self, trade_id: u64) -> Result<&Trade> {
        self.trades
            .iter()
            .find(|t| t.id == trade_id)
            .ok_or(EngineError::TradeNotFound(trade_id))
    }

    fn trade_mut(&mut self, trade_id: u64) -> Result<&mut Trade> {
        self.trades
            .iter_mut()
            .find(|t| t.id == trade_id)
            .ok_or(EngineError::TradeNotFound(trade_id))
    }

    /// All trades with `is_open = true`
    pub fn open_trades(&self) -> Vec<&Trade> {
        self.trades.iter().filter(|t| t.is_open).collect()
    }

    pub fn open_trade_ids(&self) -> Vec<u64> {
        self.trades.iter().filter(|t| t.is_open).map(|t| t.id).collect()
    }

    pub fn open_trade_count(&self) -> usize {
        self.trades.iter().filter(|t| t.is_open).count()
    }

    pub fn open_trade_for_pair(&self, pair: &str) -> Option<&Trade> {
        self.trades.iter().find(|t| t.is_open && t.pair == pair)
    }

    pub fn closed_trades(&self) -> Vec<&Trade> {
        self.trades.iter().filter(|t| !t.is_open).collect()
    }

    /// Stake held by open trades, including unfilled entry orders
    pub fn total_open_stake(&self) -> f64 {
        self.trades
            .iter()
            .filter(|t| t.is_open)
            .map(|t| t.committed_stake())
            .sum()
    }

    pub fn total_closed_profit(&self) -> f64 {
        self.total_closed_profit
    }

    /// Amount held per base currency across open trades
    pub fn open_amounts_by_pair(&self) -> BTreeMap<String, f64> {
        let mut amounts = BTreeMap::new();
        for trade in self.trades.iter().filter(|t| t.is_open) {
            *amounts.entry(trade.pair.clone()).or_insert(0.0) += trade.amount;
        }
        amounts
    }

    // ------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------

    /// Open a new trade record with no orders yet
    pub fn create_trade(
        &mut self,
        pair: &str,
        open_date: DateTime<Utc>,
        fee: f64,
        enter_tag: Option<String>,
    ) -> u64 {
        let id = self.next_trade_id;
        self.next_trade_id += 1;
        self.trades
            .push(Trade::new(id, pair, open_date, fee, fee, enter_tag));
        id
    }

    /// Create an order for a trade.
    ///
    /// # Arguments
    /// * `order_id` - Exchange order id, or None to assign a sequential local id
    #[allow(clippy::too_many_arguments)]
    pub fn place_order(
        &mut self,
        trade_id: u64,
        side: OrderSide,
        price: f64,
        amount: f64,
        created_at: DateTime<Utc>,
        order_id: Option<String>,
        tag: Option<String>,
    ) -> Result<String> {
        let id = self.next_order_id;
        let order_id = order_id.unwrap_or_else(|| format!("local-{}", id));

        let trade = self.trade_mut(trade_id)?;
        if !trade.is_open {
            return Err(EngineError::AlreadyClosed(trade_id));
        }

        let mut order = Order::new(
            id,
            trade_id,
            order_id.clone(),
            &trade.pair,
            side,
            price,
            amount,
            created_at,
        );
        order.tag = tag;
        trade.add_order(order)?;

        self.next_order_id += 1;

        tracing::debug!(
            "Placed {} order {} for trade {}: {:.8} @ {:.8}",
            side.as_str(),
            order_id,
            trade_id,
            amount,
            price
        );

        Ok(order_id)
    }

    /// Apply a fill to one order of a trade.
    ///
    /// Duplicate reports for an order that is no longer open are a no-op.
    pub fn record_fill(&mut self, trade_id: u64, order_id: &str, fill: &Fill) -> Result<bool> {
        let trade = self.trade_mut(trade_id)?;
        let order = trade
            .order_mut(order_id)
            .ok_or_else(|| EngineError::OrderNotFound(order_id.to_string()))?;
        order.apply_fill(fill)
    }

    /// Re-derive amount, stake and open rate from the trade's orders
    pub fn recompute_from_orders(&mut self, trade_id: u64) -> Result<()> {
        self.trade_mut(trade_id)?.recalc_from_orders();
        Ok(())
    }

    /// Record a fill and recompute in one step
    pub fn fill_order(&mut self, trade_id: u64, order_id: &str, fill: &Fill) -> Result<bool> {
        let applied = self.record_fill(trade_id, order_id, fill)?;
        if applied {
            self.recompute_from_orders(trade_id)?;
        }
        Ok(applied)
    }

    /// Run `f` on a copy of the trade and commit only if it succeeds.
    ///
    /// Keeps multi-step updates (fee correction plus recompute) from being
    /// observed half-applied.
    pub fn update_trade<T, F>(&mut self, trade_id: u64, f: F) -> Result<T>
    where
        F: FnOnce(&mut Trade) -> Result<T>,
    {
        let trade = self.trade_mut(trade_id)?;
        let mut working = trade.clone();
        let out = f(&mut working)?;
        *trade = working;
        Ok(out)
    }

    /// Cancel an open order; the trade's derived fields are recomputed
    pub fn cancel_order(&mut self, trade_id: u64, order_id: &str, at: DateTime<Utc>) -> Result<()> {
        let trade = self.trade_mut(trade_id)?;
        let order = trade
            .order_mut(order_id)
            .ok_or_else(|| EngineError::OrderNotFound(order_id.to_string()))?;
        if order.is_open() {
            order.cancel(at);
        }
        trade.recalc_from_orders();
        Ok(())
    }

    /// Close a trade.
    ///
    /// Returns `Ok(false)` if the trade was already closed, so duplicate
    /// exit-fill notifications are tolerated.
    pub fn close(
        &mut self,
        trade_id: u64,
        rate: f64,
        exit_type: ExitType,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let trade = self.trade_mut(trade_id)?;
        match trade.close(rate, exit_type, at) {
            Ok(()) => {
                let profit = trade.close_profit_abs.unwrap_or(0.0);
                self.total_closed_profit += profit;
                Ok(true)
            }
            Err(EngineError::AlreadyClosed(id)) => {
                tracing::debug!("Trade {} already closed, ignoring duplicate close", id);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Delete a trade and its orders (entry never filled)
    pub fn remove_trade(&mut self, trade_id: u64) -> Result<Trade> {
        let idx = self
            .trades
            .iter()
            .position(|t| t.id == trade_id)
            .ok_or(EngineError::TradeNotFound(trade_id))?;
        let trade = self.trades.remove(idx);
        tracing::info!("Removed trade {} for {} (no filled entries)", trade.id, trade.pair);
        Ok(trade)
    }

    /// Reset untrailed stops of open trades to a new stoploss
    pub fn stoploss_reinitialization(&mut self, stoploss: f64) -> usize {
        self.trades
            .iter_mut()
            .filter(|t| t.is_open)
            .map(|t| t.reinitialize_stop_loss(stoploss))
            .filter(|changed| *changed)
            .count()
    }

    /// Starting capital plus closed profit plus unrealized value of open trades
    pub fn portfolio_value(&self, starting_balance: f64, prices: &BTreeMap<String, f64>) -> f64 {
        let unrealized: f64 = self
            .trades
            .iter()
            .filter(|t| t.is_open)
            .filter_map(|t| prices.get(&t.pair).map(|p| t.realized_profit + t.calc_profit(*p)))
            .sum();
        starting_balance + self.total_closed_profit + unrealized
    }
}
