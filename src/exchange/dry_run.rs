use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, VecDeque};
use tokio::sync::Mutex;

use super::{Exchange, ExchangeOrder, OrderRequest};
use crate::config::MarketLimits;
use crate::error::EngineError;
use crate::execution::fees::ExecutionRecord;
use crate::execution::wallet::{min_pair_stake, Balance};
use crate::models::{amount_to_precision, split_pair, FeeInfo, OrderSide, OrderStatus};
use crate::Result;

#[derive(Debug)]
struct DryRunState {
    prices: BTreeMap<String, f64>,
    orders: BTreeMap<String, ExchangeOrder>,
    executions: BTreeMap<String, Vec<ExecutionRecord>>,
    next_order_id: u64,
    auto_fill: bool,
    clock: DateTime<Utc>,
    failures: VecDeque<EngineError>,
}

/// In-memory exchange for dry runs and tests
///
/// Limit orders fill at their limit price as soon as they cross the current
/// price. Balances are derived from the starting stake and all fills; fees
/// are charged in the quote currency.
#[derive(Debug)]
pub struct DryRunExchange {
    stake_currency: String,
    starting_balance: f64,
    fee: f64,
    limits: MarketLimits,
    state: Mutex<DryRunState>,
}

impl DryRunExchange {
    pub fn new(stake_currency: &str, starting_balance: f64, fee: f64, limits: MarketLimits) -> Self {
        Self {
            stake_currency: stake_currency.to_string(),
            starting_balance,
            fee,
            limits,
            state: Mutex::new(DryRunState {
                prices: BTreeMap::new(),
                orders: BTreeMap::new(),
                executions: BTreeMap::new(),
                next_order_id: 1,
                auto_fill: true,
                clock: DateTime::<Utc>::default(),
                failures: VecDeque::new(),
            }),
        }
    }

    pub async fn set_price(&self, pair: &str, price: f64) {
        self.state.lock().await.prices.insert(pair.to_string(), price);
    }

    /// Timestamp stamped on fills
    pub async fn set_clock(&self, now: DateTime<Utc>) {
        self.state.lock().await.clock = now;
    }

    /// When off, orders stay open until `fill_order` is called
    pub async fn set_auto_fill(&self, auto_fill: bool) {
        self.state.lock().await.auto_fill = auto_fill;
    }

    /// Make the next `place_order` call fail with `error`
    pub async fn fail_next_order(&self, error: EngineError) {
        self.state.lock().await.failures.push_back(error);
    }

    /// Fill `amount` more of an open order at its limit price
    pub async fn fill_order(&self, order_id: &str, amount: f64) -> Result<ExchangeOrder> {
        let mut state = self.state.lock().await;
        let clock = state.clock;
        let order = state
            .orders
            .get(order_id)
            .cloned()
            .ok_or_else(|| EngineError::OrderNotFound(order_id.to_string()))?;
        let order = self.execute(&mut state, order, amount, clock);
        Ok(order)
    }

    pub async fn open_orders(&self) -> Vec<ExchangeOrder> {
        let state = self.state.lock().await;
        state
            .orders
            .values()
            .filter(|o| o.status == OrderStatus::Open)
            .cloned()
            .collect()
    }

    /// Fill part of `order`, record the execution and store the result
    fn execute(
        &self,
        state: &mut DryRunState,
        mut order: ExchangeOrder,
        amount: f64,
        at: DateTime<Utc>,
    ) -> ExchangeOrder {
        if order.status != OrderStatus::Open {
            return order;
        }

        let amount = amount.min(order.remaining());
        if amount > 0.0 {
            let (_, quote) = split_pair(&order.pair);
            let fee_cost = amount * order.price * self.fee;
            let previous_fee = order.fee.as_ref().map(|f| f.cost).unwrap_or(0.0);

            order.filled += amount;
            order.average = Some(order.price);
            order.timestamp = at;
            order.fee = Some(FeeInfo {
                cost: previous_fee + fee_cost,
                currency: quote.to_string(),
                rate: Some(self.fee),
            });

            state
                .executions
                .entry(order.order_id.clone())
                .or_default()
                .push(ExecutionRecord {
                    order_id: order.order_id.clone(),
                    amount,
                    price: order.price,
                    fee: Some(FeeInfo {
                        cost: fee_cost,
                        currency: quote.to_string(),
                        rate: Some(self.fee),
                    }),
                });
        }

        if order.remaining() <= 1e-12 {
            order.status = OrderStatus::Closed;
        }

        tracing::debug!(
            "Dry-run {} {} filled {:.8}/{:.8} @ {:.8}",
            order.side.as_str(),
            order.order_id,
            order.filled,
            order.amount,
            order.price
        );

        state.orders.insert(order.order_id.clone(), order.clone());
        order
    }

    fn crosses(order: &ExchangeOrder, market: f64) -> bool {
        if order.side.is_entry() {
            order.price >= market
        } else {
            order.price <= market
        }
    }

    fn compute_balances(&self, state: &DryRunState) -> BTreeMap<String, Balance> {
        let mut quote_total = self.starting_balance;
        let mut quote_used = 0.0;
        let mut base: BTreeMap<String, (f64, f64)> = BTreeMap::new();

        for order in state.orders.values() {
            let (base_currency, _) = split_pair(&order.pair);
            let holding = base.entry(base_currency.to_string()).or_insert((0.0, 0.0));
            let value = order.filled * order.average.unwrap_or(order.price);

            if order.side.is_entry() {
                quote_total -= value * (1.0 + self.fee);
                holding.0 += order.filled;
                if order.status == OrderStatus::Open {
                    quote_used += order.remaining() * order.price * (1.0 + self.fee);
                }
            } else {
                quote_total += value * (1.0 - self.fee);
                holding.0 -= order.filled;
                if order.status == OrderStatus::Open {
                    holding.1 += order.remaining();
                }
            }
        }

        let mut balances = BTreeMap::new();
        balances.insert(
            self.stake_currency.clone(),
            Balance::new(quote_total - quote_used, quote_used),
        );
        for (currency, (total, used)) in base {
            if total.abs() > 1e-12 || used > 0.0 {
                balances.insert(currency, Balance::new(total - used, used));
            }
        }
        balances
    }
}

#[async_trait]
impl Exchange for DryRunExchange {
    fn name(&self) -> &str {
        "dry-run"
    }

    async fn current_price(&self, pair: &str, _side: OrderSide) -> Result<f64> {
        let state = self.state.lock().await;
        state
            .prices
            .get(pair)
            .copied()
            .ok_or_else(|| EngineError::Exchange(format!("no price for {}", pair)))
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<ExchangeOrder> {
        let mut state = self.state.lock().await;

        if let Some(error) = state.failures.pop_front() {
            return Err(error);
        }

        let amount = self.amount_to_precision(&request.pair, request.amount);
        if amount <= 0.0 || request.price <= 0.0 {
            return Err(EngineError::InvalidOrder(format!(
                "{} {} amount {:.8} @ {:.8}",
                request.pair,
                request.side.as_str(),
                request.amount,
                request.price
            )));
        }

        let balances = self.compute_balances(&state);
        if request.side.is_entry() {
            let needed = amount * request.price * (1.0 + self.fee);
            let free = balances
                .get(&self.stake_currency)
                .map(|b| b.free)
                .unwrap_or(0.0);
            if needed > free + 1e-9 {
                return Err(EngineError::InsufficientFunds(format!(
                    "need {:.8} {}, have {:.8}",
                    needed, self.stake_currency, free
                )));
            }
        } else {
            let (base, _) = split_pair(&request.pair);
            let free = balances.get(base).map(|b| b.free).unwrap_or(0.0);
            if amount > free + 1e-9 {
                return Err(EngineError::InsufficientFunds(format!(
                    "need {:.8} {}, have {:.8}",
                    amount, base, free
                )));
            }
        }

        let order_id = format!("dry-{}", state.next_order_id);
        state.next_order_id += 1;

        let order = ExchangeOrder {
            order_id: order_id.clone(),
            pair: request.pair.clone(),
            side: request.side,
            status: OrderStatus::Open,
            price: request.price,
            amount,
            filled: 0.0,
            average: None,
            timestamp: state.clock,
            fee: None,
        };
        state.orders.insert(order_id, order.clone());

        let market = state.prices.get(&request.pair).copied();
        let clock = state.clock;
        match market {
            Some(market) if state.auto_fill && Self::crosses(&order, market) => {
                let remaining = order.remaining();
                Ok(self.execute(&mut state, order, remaining, clock))
            }
            _ => Ok(order),
        }
    }

    async fn fetch_order(&self, order_id: &str, _pair: &str) -> Result<ExchangeOrder> {
        let mut state = self.state.lock().await;
        let order = state
            .orders
            .get(order_id)
            .cloned()
            .ok_or_else(|| EngineError::OrderNotFound(order_id.to_string()))?;

        let market = state.prices.get(&order.pair).copied();
        let clock = state.clock;
        match market {
            Some(market)
                if state.auto_fill && order.status == OrderStatus::Open && Self::crosses(&order, market) =>
            {
                let remaining = order.remaining();
                Ok(self.execute(&mut state, order, remaining, clock))
            }
            _ => Ok(order),
        }
    }

    async fn cancel_order(&self, order_id: &str, _pair: &str) -> Result<ExchangeOrder> {
        let mut state = self.state.lock().await;
        let clock = state.clock;
        let order = state
            .orders
            .get_mut(order_id)
            .ok_or_else(|| EngineError::OrderNotFound(order_id.to_string()))?;
        if order.status == OrderStatus::Open {
            order.status = OrderStatus::Canceled;
            order.timestamp = clock;
        }
        Ok(order.clone())
    }

    async fn min_stake_amount(&self, _pair: &str, price: f64, stoploss: f64) -> Result<Option<f64>> {
        Ok(min_pair_stake(
            self.limits.min_amount,
            self.limits.min_cost,
            price,
            stoploss,
        ))
    }

    async fn fee(&self, _pair: &str) -> Result<f64> {
        Ok(self.fee)
    }

    async fn balances(&self) -> Result<BTreeMap<String, Balance>> {
        let state = self.state.lock().await;
        Ok(self.compute_balances(&state))
    }

    async fn trades_for_order(&self, order_id: &str, _pair: &str) -> Result<Vec<ExecutionRecord>> {
        let state = self.state.lock().await;
        Ok(state.executions.get(order_id).cloned().unwrap_or_default())
    }

    fn amount_to_precision(&self, _pair: &str, amount: f64) -> f64 {
        amount_to_precision(amount, self.limits.amount_precision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exchange() -> DryRunExchange {
        DryRunExchange::new("USDT", 1000.0, 0.001, MarketLimits::default())
    }

    fn buy(amount: f64, price: f64) -> OrderRequest {
        OrderRequest {
            pair: "BTC/USDT".to_string(),
            side: OrderSide::Entry,
            amount,
            price,
        }
    }

    #[tokio::test]
    async fn test_crossing_order_fills() {
        let exchange = exchange();
        exchange.set_price("BTC/USDT", 100.0).await;

        let order = exchange.place_order(&buy(2.0, 100.0)).await.unwrap();
        assert_eq!(order.status, OrderStatus::Closed);
        assert_eq!(order.filled, 2.0);
        assert!((order.fee.as_ref().unwrap().cost - 0.2).abs() < 1e-9);

        let balances = exchange.balances().await.unwrap();
        assert!((balances["USDT"].free - (1000.0 - 200.2)).abs() < 1e-9);
        assert!((balances["BTC"].free - 2.0).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_resting_order_fills_when_price_crosses() {
        let exchange = exchange();
        exchange.set_price("BTC/USDT", 100.0).await;

        let order = exchange.place_order(&buy(1.0, 95.0)).await.unwrap();
        assert_eq!(order.status, OrderStatus::Open);
        let balances = exchange.balances().await.unwrap();
        assert!(balances["USDT"].used > 95.0);

        exchange.set_price("BTC/USDT", 94.0).await;
        let order = exchange.fetch_order(&order.order_id, "BTC/USDT").await.unwrap();
        assert_eq!(order.status, OrderStatus::Closed);
        assert_eq!(order.average, Some(95.0));
    }

    #[tokio::test]
    async fn test_partial_fill_and_cancel() {
        let exchange = exchange();
        exchange.set_price("BTC/USDT", 100.0).await;
        exchange.set_auto_fill(false).await;

        let order = exchange.place_order(&buy(4.0, 100.0)).await.unwrap();
        exchange.fill_order(&order.order_id, 1.5).await.unwrap();
        let cancelled = exchange.cancel_order(&order.order_id, "BTC/USDT").await.unwrap();

        assert_eq!(cancelled.status, OrderStatus::Canceled);
        assert_eq!(cancelled.filled, 1.5);
        let records = exchange.trades_for_order(&order.order_id, "BTC/USDT").await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].amount, 1.5);
    }

    #[tokio::test]
    async fn test_insufficient_funds() {
        let exchange = exchange();
        exchange.set_price("BTC/USDT", 100.0).await;

        let err = exchange.place_order(&buy(20.0, 100.0)).await.unwrap_err();
        assert!(matches!(err, EngineError::InsufficientFunds(_)));

        let sell = OrderRequest {
            pair: "BTC/USDT".to_string(),
            side: OrderSide::Exit,
            amount: 1.0,
            price: 100.0,
        };
        let err = exchange.place_order(&sell).await.unwrap_err();
        assert!(matches!(err, EngineError::InsufficientFunds(_)));
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let exchange = exchange();
        exchange.set_price("BTC/USDT", 100.0).await;
        exchange
            .fail_next_order(EngineError::InvalidOrder("rejected".to_string()))
            .await;

        assert!(exchange.place_order(&buy(1.0, 100.0)).await.is_err());
        assert!(exchange.place_order(&buy(1.0, 100.0)).await.is_ok());
    }
}
