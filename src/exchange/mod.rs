// Exchange collaborator interface
pub mod dry_run;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::execution::fees::ExecutionRecord;
use crate::execution::order::Fill;
use crate::execution::wallet::Balance;
use crate::models::{amount_to_precision, FeeInfo, OrderSide, OrderStatus};
use crate::Result;

pub use dry_run::DryRunExchange;

/// Limit order to submit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub pair: String,
    pub side: OrderSide,
    pub amount: f64,
    pub price: f64,
}

/// Exchange view of an order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeOrder {
    pub order_id: String,
    pub pair: String,
    pub side: OrderSide,
    pub status: OrderStatus,
    pub price: f64,
    pub amount: f64,
    pub filled: f64,
    pub average: Option<f64>,
    pub timestamp: DateTime<Utc>,
    pub fee: Option<FeeInfo>,
}

impl ExchangeOrder {
    pub fn remaining(&self) -> f64 {
        (self.amount - self.filled).max(0.0)
    }

    /// Fill report to feed into the ledger
    pub fn to_fill(&self) -> Fill {
        Fill {
            order_id: self.order_id.clone(),
            status: self.status,
            filled: self.filled,
            average: self.average.unwrap_or(self.price),
            timestamp: self.timestamp,
            fee: self.fee.clone(),
        }
    }
}

/// Capabilities the engine needs from an exchange.
///
/// Failures use `EngineError::Exchange` for transient errors,
/// `InsufficientFunds` and `InvalidOrder` for rejected orders.
#[async_trait]
pub trait Exchange: Send + Sync {
    fn name(&self) -> &str;

    /// Ask for entries, bid for exits
    async fn current_price(&self, pair: &str, side: OrderSide) -> Result<f64>;

    async fn place_order(&self, request: &OrderRequest) -> Result<ExchangeOrder>;

    async fn fetch_order(&self, order_id: &str, pair: &str) -> Result<ExchangeOrder>;

    async fn cancel_order(&self, order_id: &str, pair: &str) -> Result<ExchangeOrder>;

    /// Minimum stake for a pair at `price`, None if the market has no limits
    async fn min_stake_amount(&self, pair: &str, price: f64, stoploss: f64) -> Result<Option<f64>>;

    async fn fee(&self, pair: &str) -> Result<f64>;

    async fn balances(&self) -> Result<BTreeMap<String, Balance>>;

    /// Executions belonging to one order, used for fee reconciliation
    async fn trades_for_order(&self, order_id: &str, pair: &str) -> Result<Vec<ExecutionRecord>>;

    fn amount_to_precision(&self, _pair: &str, amount: f64) -> f64 {
        amount_to_precision(amount, 8)
    }
}
