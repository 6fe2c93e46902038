use crate::error::EngineError;
use crate::execution::order::Order;
use crate::models::{ExitType, OrderSide};
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One open or closed holding of a pair
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Trade {
    pub id: u64,
    pub pair: String,
    pub is_open: bool,
    pub open_date: DateTime<Utc>,
    pub close_date: Option<DateTime<Utc>>,

    // Derived from filled orders by `recalc_from_orders`
    pub amount: f64,
    pub stake_amount: f64,
    pub open_rate: f64,
    pub open_trade_value: f64,
    pub realized_profit: f64,

    pub close_rate: Option<f64>,
    pub close_profit: Option<f64>,
    pub close_profit_abs: Option<f64>,

    pub fee_open: f64,
    pub fee_close: f64,
    pub fee_open_cost: f64,
    pub fee_close_cost: f64,
    fee_open_rates: Vec<f64>,
    fee_close_rates: Vec<f64>,

    pub stop_loss: f64,
    pub stop_loss_pct: f64,
    pub initial_stop_loss: f64,
    pub initial_stop_loss_pct: Option<f64>,
    pub max_rate: Option<f64>,
    pub min_rate: Option<f64>,

    pub enter_tag: Option<String>,
    pub exit_reason: Option<ExitType>,
    pub exit_tag: Option<String>,

    /// Exit orders cancelled because they timed out
    pub exit_timeouts: u32,

    pub orders: Vec<Order>,
}

impl Trade {
    pub fn new(
        id: u64,
        pair: &str,
        open_date: DateTime<Utc>,
        fee_open: f64,
        fee_close: f64,
        enter_tag: Option<String>,
    ) -> Self {
        Self {
            id,
            pair: pair.to_string(),
            is_open: true,
            open_date,
            close_date: None,
            amount: 0.0,
            stake_amount: 0.0,
            open_rate: 0.0,
            open_trade_value: 0.0,
            realized_profit: 0.0,
            close_rate: None,
            close_profit: None,
            close_profit_abs: None,
            fee_open,
            fee_close,
            fee_open_cost: 0.0,
            fee_close_cost: 0.0,
            fee_open_rates: Vec::new(),
            fee_close_rates: Vec::new(),
            stop_loss: 0.0,
            stop_loss_pct: 0.0,
            initial_stop_loss: 0.0,
            initial_stop_loss_pct: None,
            max_rate: None,
            min_rate: None,
            enter_tag,
            exit_reason: None,
            exit_tag: None,
            exit_timeouts: 0,
            orders: Vec::new(),
        }
    }

    // ------------------------------------------------------------------
    // Valuation
    // ------------------------------------------------------------------

    pub fn calc_open_trade_value(&self, amount: f64, open_rate: f64) -> f64 {
        amount * open_rate * (1.0 + self.fee_open)
    }

    pub fn recalc_open_trade_value(&mut self) {
        self.open_trade_value = self.calc_open_trade_value(self.amount, self.open_rate);
    }

    /// Value of the current amount sold at `rate`, net of the exit fee
    pub fn calc_close_trade_value(&self, rate: f64) -> f64 {
        if self.amount <= 0.0 {
            return 0.0;
        }
        self.amount * rate * (1.0 - self.fee_close)
    }

    pub fn calc_profit(&self, rate: f64) -> f64 {
        self.calc_close_trade_value(rate) - self.open_trade_value
    }

    pub fn calc_profit_ratio(&self, rate: f64) -> f64 {
        if self.open_trade_value <= 0.0 {
            return 0.0;
        }
        self.calc_close_trade_value(rate) / self.open_trade_value - 1.0
    }

    /// Sum of filled entry costs, before fees
    pub fn total_entry_cost(&self) -> f64 {
        self.orders
            .iter()
            .filter(|o| o.side.is_entry() && o.counts_toward_position())
            .map(|o| o.safe_filled() * o.safe_price())
            .sum()
    }

    /// Sum of filled entry amounts
    pub fn total_entry_amount(&self) -> f64 {
        self.orders
            .iter()
            .filter(|o| o.side.is_entry() && o.counts_toward_position())
            .map(|o| o.safe_filled())
            .sum()
    }

    // ------------------------------------------------------------------
    // Stop loss
    // ------------------------------------------------------------------

    pub fn has_stop_loss(&self) -> bool {
        self.stop_loss > 0.0
    }

    /// True once the stop has ratcheted away from its initial value
    pub fn stop_is_trailing(&self) -> bool {
        self.has_stop_loss() && self.stop_loss != self.initial_stop_loss
    }

    /// Move the stop to `current_price * (1 - |stoploss|)` if that raises it.
    ///
    /// # Arguments
    /// * `initial` - Only set the stop if none exists yet
    pub fn adjust_stop_loss(&mut self, current_price: f64, stoploss: f64, initial: bool) {
        if initial && self.has_stop_loss() {
            return;
        }

        let new_loss = current_price * (1.0 - stoploss.abs());

        if !self.has_stop_loss() {
            tracing::debug!("{}: assigning initial stop loss {:.8}", self.pair, new_loss);
            self.stop_loss = new_loss;
            self.stop_loss_pct = -stoploss.abs();
            self.initial_stop_loss = new_loss;
            self.initial_stop_loss_pct = Some(-stoploss.abs());
        } else if new_loss > self.stop_loss {
            tracing::debug!(
                "{}: adjusting stop loss {:.8} -> {:.8}",
                self.pair,
                self.stop_loss,
                new_loss
            );
            self.stop_loss = new_loss;
            self.stop_loss_pct = -stoploss.abs();
        }
    }

    /// Reset a stop that never trailed to a new percentage.
    ///
    /// Returns true if the stop was reset.
    pub fn reinitialize_stop_loss(&mut self, stoploss: f64) -> bool {
        let desired = -stoploss.abs();
        if self.stop_loss != self.initial_stop_loss || self.initial_stop_loss_pct == Some(desired) {
            return false;
        }

        self.stop_loss = 0.0;
        self.initial_stop_loss = 0.0;
        self.initial_stop_loss_pct = None;
        self.adjust_stop_loss(self.open_rate, stoploss, false);

        tracing::info!(
            "{}: stop loss reinitialized to {:.8} ({:.2}%)",
            self.pair,
            self.stop_loss,
            desired * 100.0
        );
        true
    }

    pub fn adjust_min_max_rates(&mut self, high: f64, low: f64) {
        self.max_rate = Some(self.max_rate.unwrap_or(self.open_rate).max(high));
        self.min_rate = Some(self.min_rate.unwrap_or(self.open_rate).min(low));
    }

    // ------------------------------------------------------------------
    // Orders
    // ------------------------------------------------------------------

    pub fn open_order(&self) -> Option<&Order> {
        self.orders.iter().find(|o| o.is_open())
    }

    pub fn has_open_order(&self) -> bool {
        self.open_order().is_some()
    }

    pub fn order(&self, order_id: &str) -> Option<&Order> {
        self.orders.iter().find(|o| o.order_id == order_id)
    }

    pub fn order_mut(&mut self, order_id: &str) -> Option<&mut Order> {
        self.orders.iter_mut().find(|o| o.order_id == order_id)
    }

    /// Attach a new order; a trade holds at most one open order.
    pub fn add_order(&mut self, order: Order) -> Result<()> {
        if let Some(open) = self.open_order() {
            return Err(EngineError::OpenOrderExists {
                trade_id: self.id,
                order_id: open.order_id.clone(),
            });
        }
        self.orders.push(order);
        Ok(())
    }

    pub fn nr_of_successful_entries(&self) -> usize {
        self.orders
            .iter()
            .filter(|o| o.side.is_entry() && o.counts_toward_position())
            .count()
    }

    /// Stake reserved by an unfilled entry order
    pub fn pending_entry_stake(&self) -> f64 {
        self.orders
            .iter()
            .filter(|o| o.side.is_entry())
            .map(|o| o.pending_stake())
            .sum()
    }

    /// Capital this trade holds back from the wallet
    pub fn committed_stake(&self) -> f64 {
        self.stake_amount + self.pending_entry_stake()
    }

    // ------------------------------------------------------------------
    // Fees and derived fields
    // ------------------------------------------------------------------

    /// Record an observed fee rate; each side's fee is the mean of its samples.
    pub fn update_fee(&mut self, side: OrderSide, fee_cost: f64, rate: Option<f64>) {
        if side.is_entry() {
            self.fee_open_cost += fee_cost;
            if let Some(rate) = rate {
                self.fee_open_rates.push(rate);
                self.fee_open = mean(&self.fee_open_rates);
                // Close fee is assumed to match until an exit fee is observed
                if self.fee_close_rates.is_empty() {
                    self.fee_close = self.fee_open;
                }
            }
        } else {
            self.fee_close_cost += fee_cost;
            if let Some(rate) = rate {
                self.fee_close_rates.push(rate);
                self.fee_close = mean(&self.fee_close_rates);
            }
        }
        self.recalc_open_trade_value();
    }

    /// Recompute amount, stake and open rate from filled orders.
    ///
    /// Walks closed orders in fill order. Entries build a running
    /// cost-weighted average; exits reduce the amount and book realized
    /// profit without touching the open rate. Leaves the trade untouched
    /// when nothing has been filled yet.
    pub fn recalc_from_orders(&mut self) {
        let mut filled: Vec<&Order> = self
            .orders
            .iter()
            .filter(|o| o.counts_toward_position())
            .collect();

        if filled.is_empty() {
            return;
        }

        filled.sort_by(|a, b| {
            let a_key = a.filled_at.unwrap_or(a.created_at);
            let b_key = b.filled_at.unwrap_or(b.created_at);
            a_key.cmp(&b_key).then(a.id.cmp(&b.id))
        });

        let mut amount = 0.0;
        let mut open_rate = 0.0;
        let mut realized = 0.0;

        for order in filled {
            let order_amount = order.safe_filled();
            let price = order.safe_price();

            if order.side.is_entry() {
                let new_amount = amount + order_amount;
                if new_amount > 0.0 {
                    open_rate = (amount * open_rate + order_amount * price) / new_amount;
                }
                amount = new_amount;
            } else {
                let exit_amount = order_amount.min(amount);
                let exit_value = exit_amount * price * (1.0 - self.fee_close);
                let entry_value = exit_amount * open_rate * (1.0 + self.fee_open);
                realized += exit_value - entry_value;
                amount -= exit_amount;
            }
        }

        if amount < 1e-12 {
            amount = 0.0;
        }

        self.amount = amount;
        self.open_rate = open_rate;
        self.stake_amount = amount * open_rate;
        self.realized_profit = realized;
        self.recalc_open_trade_value();
    }

    /// Trade duration in whole minutes at `now`
    pub fn duration_minutes(&self, now: DateTime<Utc>) -> i64 {
        (now - self.open_date).num_minutes()
    }

    /// Set the close fields.
    ///
    /// Profit is realized profit plus whatever amount is still held, valued
    /// at `rate`. Any order left open is cancelled.
    pub fn close(&mut self, rate: f64, exit_type: ExitType, at: DateTime<Utc>) -> Result<()> {
        if !self.is_open {
            return Err(EngineError::AlreadyClosed(self.id));
        }

        let profit_abs = self.realized_profit + self.calc_profit(rate);
        let invested = self.total_entry_cost() * (1.0 + self.fee_open);

        for order in self.orders.iter_mut().filter(|o| o.is_open()) {
            order.cancel(at);
        }

        self.is_open = false;
        self.close_rate = Some(rate);
        self.close_date = Some(at);
        self.exit_reason = Some(exit_type);
        self.close_profit_abs = Some(profit_abs);
        self.close_profit = Some(if invested > 0.0 {
            profit_abs / invested
        } else {
            0.0
        });

        tracing::info!(
            "Closed trade {} {} @ {:.8} ({}) profit {:.4} ({:.2}%)",
            self.id,
            self.pair,
            rate,
            exit_type,
            profit_abs,
            self.close_profit.unwrap_or(0.0) * 100.0
        );

        Ok(())
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::order::Fill;
    use chrono::{Duration, TimeZone};

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn filled_order(id: u64, side: OrderSide, price: f64, amount: f64, minute: i64) -> Order {
        let at = start() + Duration::minutes(minute);
        let mut order = Order::new(id, 1, format!("o-{}", id), "ADA/USDT", side, price, amount, at);
        order.apply_fill(&Fill::full(&order, price, at)).unwrap();
        order
    }

    fn test_trade() -> Trade {
        Trade::new(1, "ADA/USDT", start(), 0.0025, 0.0025, None)
    }

    #[test]
    fn test_profit_calculations() {
        let mut trade = test_trade();
        trade.orders.push(filled_order(1, OrderSide::Entry, 2.0, 50.0, 0));
        trade.recalc_from_orders();

        assert!((trade.open_trade_value - 100.25).abs() < 1e-9);
        assert!((trade.calc_close_trade_value(2.2) - 109.725).abs() < 1e-9);
        assert!((trade.calc_profit(2.2) - 9.475).abs() < 1e-9);
        assert!((trade.calc_profit_ratio(2.2) - (109.725 / 100.25 - 1.0)).abs() < 1e-12);
    }

    #[test]
    fn test_adjust_stop_loss_ratchets_up() {
        let mut trade = test_trade();
        trade.open_rate = 1.0;

        trade.adjust_stop_loss(1.0, 0.05, true);
        assert!((trade.stop_loss - 0.95).abs() < 1e-9);
        assert_eq!(trade.stop_loss_pct, -0.05);
        assert!((trade.initial_stop_loss - 0.95).abs() < 1e-9);
        assert_eq!(trade.initial_stop_loss_pct, Some(-0.05));

        // Price rises, stop follows
        trade.adjust_stop_loss(1.3, -0.1, false);
        assert!((trade.stop_loss - 1.17).abs() < 1e-9);
        assert_eq!(trade.stop_loss_pct, -0.1);
        assert!((trade.initial_stop_loss - 0.95).abs() < 1e-9);

        // Price falls, stop stays
        trade.adjust_stop_loss(1.2, 0.1, false);
        assert!((trade.stop_loss - 1.17).abs() < 1e-9);

        trade.adjust_stop_loss(1.4, 0.1, false);
        assert!((trade.stop_loss - 1.26).abs() < 1e-9);

        // Initial call does nothing once a stop exists
        trade.adjust_stop_loss(1.7, 0.1, true);
        assert!((trade.stop_loss - 1.26).abs() < 1e-9);
        assert!(trade.stop_is_trailing());
    }

    #[test]
    fn test_reinitialize_stop_loss() {
        let mut trade = test_trade();
        trade.open_rate = 1.0;
        trade.adjust_stop_loss(1.0, 0.05, true);

        assert!(trade.reinitialize_stop_loss(-0.06));
        assert!((trade.stop_loss - 0.94).abs() < 1e-9);
        assert!((trade.initial_stop_loss - 0.94).abs() < 1e-9);

        assert!(trade.reinitialize_stop_loss(0.04));
        assert!((trade.stop_loss - 0.96).abs() < 1e-9);

        // Same percentage: no change
        assert!(!trade.reinitialize_stop_loss(0.04));

        // Trailed stop is left alone
        trade.adjust_stop_loss(1.02, 0.04, false);
        assert!((trade.stop_loss - 0.9792).abs() < 1e-9);
        assert!(!trade.reinitialize_stop_loss(0.06));
        assert!((trade.stop_loss - 0.9792).abs() < 1e-9);
    }

    #[test]
    fn test_adjust_min_max_rates() {
        let mut trade = test_trade();
        trade.open_rate = 1.0;

        trade.adjust_min_max_rates(1.0, 1.0);
        assert_eq!(trade.max_rate, Some(1.0));
        assert_eq!(trade.min_rate, Some(1.0));

        trade.adjust_min_max_rates(1.1, 0.91);
        assert_eq!(trade.max_rate, Some(1.1));
        assert_eq!(trade.min_rate, Some(0.91));

        trade.adjust_min_max_rates(1.05, 0.95);
        assert_eq!(trade.max_rate, Some(1.1));
        assert_eq!(trade.min_rate, Some(0.91));
    }

    #[test]
    fn test_recalc_dca_average() {
        let mut trade = test_trade();
        trade.orders.push(filled_order(1, OrderSide::Entry, 1.0, 100.0, 0));
        trade.orders.push(filled_order(2, OrderSide::Entry, 0.9, 125.0, 5));
        trade.orders.push(filled_order(3, OrderSide::Entry, 0.85, 150.0, 10));
        trade.recalc_from_orders();

        let expected_rate = (100.0 * 1.0 + 125.0 * 0.9 + 150.0 * 0.85) / (100.0 + 125.0 + 150.0);
        assert!((trade.open_rate - expected_rate).abs() < 1e-12);
        assert!((trade.amount - 375.0).abs() < 1e-12);
        assert!((trade.stake_amount - (100.0 + 112.5 + 127.5)).abs() < 1e-9);
        assert_eq!(trade.nr_of_successful_entries(), 3);

        // Partial exit keeps the open rate
        trade.orders.push(filled_order(4, OrderSide::Exit, 1.0, 75.0, 15));
        trade.recalc_from_orders();
        assert!((trade.open_rate - expected_rate).abs() < 1e-12);
        assert!((trade.amount - 300.0).abs() < 1e-9);
        assert!(trade.realized_profit > 0.0);
    }

    #[test]
    fn test_recalc_is_idempotent() {
        let mut trade = test_trade();
        trade.orders.push(filled_order(1, OrderSide::Entry, 1.0, 100.0, 0));
        trade.orders.push(filled_order(2, OrderSide::Entry, 0.9, 125.0, 5));
        trade.recalc_from_orders();
        let first = trade.clone();
        trade.recalc_from_orders();
        assert_eq!(trade, first);
    }

    #[test]
    fn test_recalc_ignores_open_and_canceled() {
        let mut trade = test_trade();
        trade.orders.push(filled_order(1, OrderSide::Entry, 1.0, 100.0, 0));
        let mut canceled = Order::new(2, 1, "o-2".into(), "ADA/USDT", OrderSide::Entry, 0.5, 100.0, start());
        canceled.cancel(start());
        trade.orders.push(canceled);
        trade
            .orders
            .push(Order::new(3, 1, "o-3".into(), "ADA/USDT", OrderSide::Entry, 0.5, 100.0, start()));

        trade.recalc_from_orders();
        assert_eq!(trade.amount, 100.0);
        assert_eq!(trade.open_rate, 1.0);
        assert!((trade.pending_entry_stake() - 50.0).abs() < 1e-9);
        assert!((trade.committed_stake() - 150.0).abs() < 1e-9);
    }

    #[test]
    fn test_recalc_without_orders_changes_nothing() {
        let mut trade = test_trade();
        trade.amount = 30.0;
        trade.open_rate = 2.0;
        trade.recalc_from_orders();
        assert_eq!(trade.amount, 30.0);
        assert_eq!(trade.open_rate, 2.0);
    }

    #[test]
    fn test_add_order_rejects_second_open_order() {
        let mut trade = test_trade();
        let first = Order::new(1, 1, "o-1".into(), "ADA/USDT", OrderSide::Entry, 1.0, 10.0, start());
        let second = Order::new(2, 1, "o-2".into(), "ADA/USDT", OrderSide::Entry, 1.0, 10.0, start());

        trade.add_order(first).unwrap();
        let err = trade.add_order(second).unwrap_err();
        assert!(matches!(err, EngineError::OpenOrderExists { .. }));
    }

    #[test]
    fn test_update_fee_running_mean() {
        let mut trade = test_trade();
        trade.update_fee(OrderSide::Entry, 0.1, Some(0.001));
        assert_eq!(trade.fee_open, 0.001);
        assert_eq!(trade.fee_close, 0.001);

        trade.update_fee(OrderSide::Entry, 0.1, Some(0.003));
        assert!((trade.fee_open - 0.002).abs() < 1e-12);

        trade.update_fee(OrderSide::Exit, 0.2, Some(0.004));
        assert_eq!(trade.fee_close, 0.004);
        assert!((trade.fee_open_cost - 0.2).abs() < 1e-12);
    }

    #[test]
    fn test_close_sets_fields_and_rejects_twice() {
        let mut trade = test_trade();
        trade.orders.push(filled_order(1, OrderSide::Entry, 2.0, 50.0, 0));
        trade.orders.push(filled_order(2, OrderSide::Exit, 2.2, 50.0, 30));
        trade.recalc_from_orders();
        assert_eq!(trade.amount, 0.0);

        let at = start() + Duration::minutes(30);
        trade.close(2.2, ExitType::Roi, at).unwrap();

        assert!(!trade.is_open);
        assert_eq!(trade.close_rate, Some(2.2));
        assert_eq!(trade.close_date, Some(at));
        assert_eq!(trade.exit_reason, Some(ExitType::Roi));
        assert!((trade.close_profit_abs.unwrap() - 9.475).abs() < 1e-9);
        assert!((trade.close_profit.unwrap() - (109.725 / 100.25 - 1.0)).abs() < 1e-9);

        let err = trade.close(2.3, ExitType::ForceExit, at).unwrap_err();
        assert!(matches!(err, EngineError::AlreadyClosed(1)));
        assert_eq!(trade.close_rate, Some(2.2));
    }
}
