use crate::error::EngineError;
use crate::models::{FeeInfo, OrderSide, OrderStatus};
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One exchange order, owned by exactly one trade
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Order {
    pub id: u64,
    pub trade_id: u64,
    pub order_id: String,
    pub pair: String,
    pub side: OrderSide,
    pub status: OrderStatus,
    pub price: f64,
    pub amount: f64,
    pub filled: f64,
    pub remaining: f64,
    pub average: Option<f64>,
    pub cost: f64,
    pub created_at: DateTime<Utc>,
    pub filled_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    /// Fee already deducted from the filled amount (base currency)
    pub fee_base: Option<f64>,
    pub fee_cost: Option<f64>,
    pub fee_currency: Option<String>,
    pub fee_rate: Option<f64>,
    pub tag: Option<String>,
}

/// Fill report for an order, as observed on the exchange or simulated
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Fill {
    pub order_id: String,
    pub status: OrderStatus,
    pub filled: f64,
    pub average: f64,
    pub timestamp: DateTime<Utc>,
    pub fee: Option<FeeInfo>,
}

impl Fill {
    /// A complete fill at `price`
    pub fn full(order: &Order, price: f64, timestamp: DateTime<Utc>) -> Self {
        Self {
            order_id: order.order_id.clone(),
            status: OrderStatus::Closed,
            filled: order.amount,
            average: price,
            timestamp,
            fee: None,
        }
    }
}

impl Order {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: u64,
        trade_id: u64,
        order_id: String,
        pair: &str,
        side: OrderSide,
        price: f64,
        amount: f64,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            trade_id,
            order_id,
            pair: pair.to_string(),
            side,
            status: OrderStatus::Open,
            price,
            amount,
            filled: 0.0,
            remaining: amount,
            average: None,
            cost: 0.0,
            created_at,
            filled_at: None,
            updated_at: None,
            fee_base: None,
            fee_cost: None,
            fee_currency: None,
            fee_rate: None,
            tag: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.status == OrderStatus::Open
    }

    /// Closed with a non-zero fill: the only orders that move trade amounts
    pub fn counts_toward_position(&self) -> bool {
        self.status == OrderStatus::Closed && self.filled > 0.0
    }

    /// Price actually paid, falling back to the requested price
    pub fn safe_price(&self) -> f64 {
        self.average.filter(|p| *p > 0.0).unwrap_or(self.price)
    }

    /// Filled amount net of any base-currency fee already taken
    pub fn safe_filled(&self) -> f64 {
        self.filled - self.fee_base.unwrap_or(0.0)
    }

    /// Stake still reserved by the unfilled part of the order
    pub fn pending_stake(&self) -> f64 {
        if self.is_open() {
            self.remaining.max(0.0) * self.price
        } else {
            0.0
        }
    }

    /// Apply a fill report to this order.
    ///
    /// Returns `Ok(false)` when the order is no longer open (duplicate report).
    pub fn apply_fill(&mut self, fill: &Fill) -> Result<bool> {
        if fill.order_id != self.order_id {
            return Err(EngineError::OrderMismatch {
                expected: self.order_id.clone(),
                got: fill.order_id.clone(),
            });
        }

        if !self.is_open() {
            tracing::debug!(
                "Ignoring fill for order {} (already {})",
                self.order_id,
                self.status.as_str()
            );
            return Ok(false);
        }

        self.filled = fill.filled.clamp(0.0, self.amount);
        self.remaining = self.amount - self.filled;
        if self.filled > 0.0 {
            self.average = Some(fill.average);
        }
        self.cost = self.filled * fill.average;
        self.status = fill.status;
        self.updated_at = Some(fill.timestamp);

        if self.status != OrderStatus::Open && self.filled > 0.0 {
            self.filled_at = Some(fill.timestamp);
        }

        if let Some(fee) = &fill.fee {
            self.fee_cost = Some(fee.cost);
            self.fee_currency = Some(fee.currency.clone());
            self.fee_rate = fee.rate;
        }

        Ok(true)
    }

    /// Close an order at whatever part of it was filled.
    ///
    /// Used when a partially filled order times out: the filled part becomes
    /// the whole order.
    pub fn close_partial(&mut self, at: DateTime<Utc>) {
        self.amount = self.filled;
        self.remaining = 0.0;
        self.status = OrderStatus::Closed;
        self.updated_at = Some(at);
        if self.filled_at.is_none() {
            self.filled_at = Some(at);
        }
    }

    pub fn cancel(&mut self, at: DateTime<Utc>) {
        self.status = OrderStatus::Canceled;
        self.updated_at = Some(at);
    }
}
