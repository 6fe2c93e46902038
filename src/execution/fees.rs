use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::exchange::Exchange;
use crate::execution::ledger::Ledger;
use crate::execution::order::Order;
use crate::execution::trade::Trade;
use crate::execution::wallet::Wallet;
use crate::models::{split_pair, FeeInfo, OrderSide};
use crate::Result;

/// Reported fee rates at or above this are treated as bad data
pub const FEE_RATE_CEILING: f64 = 0.02;

/// Allowed gap between summed execution records and the order's filled amount
pub const AMOUNT_EPSILON: f64 = 1e-8;

/// One exchange-side execution belonging to an order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub order_id: String,
    pub amount: f64,
    pub price: f64,
    pub fee: Option<FeeInfo>,
}

/// Result of reconciling one filled order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeeAdjustment {
    pub order_id: String,
    pub side: OrderSide,
    /// Amount credited to the position after any base-currency fee
    pub amount: f64,
    /// Base-currency fee taken out of the filled amount
    pub fee_base: f64,
    pub fee_cost: f64,
    pub fee_currency: Option<String>,
    pub fee_rate: Option<f64>,
    /// False when the reported fee was rejected and the nominal fee kept
    pub accepted: bool,
}

impl FeeAdjustment {
    fn untouched(order: &Order) -> Self {
        Self {
            order_id: order.order_id.clone(),
            side: order.side,
            amount: order.filled,
            fee_base: 0.0,
            fee_cost: 0.0,
            fee_currency: None,
            fee_rate: None,
            accepted: false,
        }
    }
}

/// Effective fee rate of `fee` on an order, if it can be derived
fn effective_rate(fee: &FeeInfo, base: &str, quote: &str, filled: f64, cost: f64) -> Option<f64> {
    if let Some(rate) = fee.rate {
        return Some(rate);
    }
    if fee.currency == base && filled > 0.0 {
        Some(fee.cost / filled)
    } else if fee.currency == quote && cost > 0.0 {
        Some(fee.cost / cost)
    } else {
        None
    }
}

/// Work out the fee-corrected amount for a filled order.
///
/// Pure: reads the trade and order, returns what should change. Uses the
/// fee on the order when present, otherwise the execution `records` that
/// belong to this order.
///
/// # Arguments
/// * `base_free` - Free wallet balance of the pair's base currency
/// * `to_precision` - Exchange amount rounding
pub fn reconcile_fill(
    trade: &Trade,
    order: &Order,
    records: &[ExecutionRecord],
    base_free: f64,
    to_precision: impl Fn(f64) -> f64,
) -> Result<FeeAdjustment> {
    let (base, quote) = split_pair(&trade.pair);
    let mut adjustment = FeeAdjustment::untouched(order);

    let (fee_cost, fee_currency, fee_rate, base_fee, executed) =
        match (order.fee_cost, order.fee_currency.as_deref()) {
            (Some(cost), Some(currency)) => {
                let fee = FeeInfo {
                    cost,
                    currency: currency.to_string(),
                    rate: order.fee_rate,
                };
                let rate = effective_rate(&fee, base, quote, order.filled, order.cost);
                let base_fee = if currency == base { cost } else { 0.0 };
                (cost, currency.to_string(), rate, base_fee, order.filled)
            }
            _ => {
                let records: Vec<&ExecutionRecord> = records
                    .iter()
                    .filter(|record| record.order_id == order.order_id)
                    .collect();
                if records.is_empty() {
                    tracing::debug!("No fee data for order {}, keeping nominal fee", order.order_id);
                    return Ok(adjustment);
                }

                let mut executed = 0.0;
                let mut cost_sum = 0.0;
                let mut base_fee = 0.0;
                let mut rates = Vec::new();
                let mut currency = None;

                for record in records {
                    executed += record.amount;
                    if let Some(fee) = &record.fee {
                        cost_sum += fee.cost;
                        if let Some(rate) = effective_rate(
                            fee,
                            base,
                            quote,
                            record.amount,
                            record.amount * record.price,
                        ) {
                            rates.push(rate);
                        }
                        if fee.currency == base {
                            base_fee += fee.cost;
                        }
                        currency = Some(fee.currency.clone());
                    }
                }

                if (executed - order.filled).abs() > AMOUNT_EPSILON {
                    return Err(EngineError::AmountMismatch {
                        order_id: order.order_id.clone(),
                        executed,
                        reported: order.filled,
                    });
                }

                let Some(currency) = currency else {
                    return Ok(adjustment);
                };
                // Rates without a derivable value leave the mean unknown
                let rate = (!rates.is_empty()).then(|| rates.iter().sum::<f64>() / rates.len() as f64);
                (cost_sum, currency, rate, base_fee, executed)
            }
        };

    if let Some(rate) = fee_rate {
        if rate >= FEE_RATE_CEILING {
            tracing::warn!(
                "Ignoring fee rate {:.4} on order {} for {} (above {:.2})",
                rate,
                order.order_id,
                trade.pair,
                FEE_RATE_CEILING
            );
            return Ok(adjustment);
        }
    }

    adjustment.fee_cost = fee_cost;
    adjustment.fee_currency = Some(fee_currency);
    adjustment.fee_rate = fee_rate;
    adjustment.accepted = true;

    if base_fee > 0.0 {
        // The trade already includes this order's fill
        let required = trade.amount;
        if base_free >= required {
            tracing::info!(
                "Fee {:.8} {} for trade {} eaten into dust",
                base_fee,
                base,
                trade.id
            );
        } else {
            let amount = to_precision(executed - base_fee);
            tracing::info!(
                "Applying {} fee {:.8} on trade {}: amount {:.8} -> {:.8}",
                base,
                base_fee,
                trade.id,
                executed,
                amount
            );
            adjustment.fee_base = executed - amount;
            adjustment.amount = amount;
        }
    }

    Ok(adjustment)
}

/// Write an adjustment into the trade and re-derive its amounts
pub fn apply_fee_adjustment(trade: &mut Trade, adjustment: &FeeAdjustment) -> Result<()> {
    let order = trade
        .order_mut(&adjustment.order_id)
        .ok_or_else(|| EngineError::OrderNotFound(adjustment.order_id.clone()))?;

    order.fee_base = Some(adjustment.fee_base);
    if adjustment.accepted && order.fee_cost.is_none() {
        order.fee_cost = Some(adjustment.fee_cost);
        order.fee_currency = adjustment.fee_currency.clone();
        order.fee_rate = adjustment.fee_rate;
    }

    if adjustment.accepted {
        trade.update_fee(adjustment.side, adjustment.fee_cost, adjustment.fee_rate);
    }
    trade.recalc_from_orders();
    Ok(())
}

/// Reconcile fees of a filled order, fetching execution records from the
/// exchange when the order carries no fee.
///
/// Returns `Ok(None)` for open orders and orders already reconciled.
pub async fn reconcile_order_fees<E: Exchange + ?Sized>(
    exchange: &E,
    ledger: &mut Ledger,
    wallet: &Wallet,
    trade_id: u64,
    order_id: &str,
) -> Result<Option<FeeAdjustment>> {
    let trade = ledger.trade(trade_id)?;
    let order = trade
        .order(order_id)
        .ok_or_else(|| EngineError::OrderNotFound(order_id.to_string()))?;

    if order.is_open() || order.fee_base.is_some() || order.filled <= 0.0 {
        return Ok(None);
    }

    let records = if order.fee_cost.is_none() {
        exchange.trades_for_order(order_id, &trade.pair).await?
    } else {
        Vec::new()
    };

    let (base, _) = split_pair(&trade.pair);
    let pair = trade.pair.clone();
    let adjustment = reconcile_fill(trade, order, &records, wallet.free(base), |amount| {
        exchange.amount_to_precision(&pair, amount)
    })?;

    ledger.update_trade(trade_id, |trade| apply_fee_adjustment(trade, &adjustment))?;
    Ok(Some(adjustment))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::order::Fill;
    use crate::models::{amount_to_precision, OrderStatus};
    use chrono::{TimeZone, Utc};

    fn filled_trade(fee: Option<FeeInfo>) -> (Trade, String) {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut trade = Trade::new(1, "LTC/ETH", now, 0.001, 0.001, None);
        let order = Order::new(1, 1, "o-1".to_string(), "LTC/ETH", OrderSide::Entry, 0.25, 8.0, now);
        trade.add_order(order).unwrap();

        let fill = Fill {
            order_id: "o-1".to_string(),
            status: OrderStatus::Closed,
            filled: 8.0,
            average: 0.25,
            timestamp: now,
            fee,
        };
        trade.order_mut("o-1").unwrap().apply_fill(&fill).unwrap();
        trade.recalc_from_orders();
        (trade, "o-1".to_string())
    }

    fn precision(amount: f64) -> f64 {
        amount_to_precision(amount, 8)
    }

    #[test]
    fn test_quote_fee_keeps_amount() {
        let fee = FeeInfo {
            cost: 0.002,
            currency: "ETH".to_string(),
            rate: None,
        };
        let (mut trade, order_id) = filled_trade(Some(fee));
        let order = trade.order(&order_id).unwrap().clone();

        let adj = reconcile_fill(&trade, &order, &[], 0.0, precision).unwrap();
        assert!(adj.accepted);
        assert_eq!(adj.amount, 8.0);
        assert!((adj.fee_rate.unwrap() - 0.001).abs() < 1e-12);

        apply_fee_adjustment(&mut trade, &adj).unwrap();
        assert_eq!(trade.amount, 8.0);
        assert!((trade.fee_open - 0.001).abs() < 1e-12);
        assert!((trade.fee_open_cost - 0.002).abs() < 1e-12);
    }

    #[test]
    fn test_base_fee_eaten_into_dust() {
        let fee = FeeInfo {
            cost: 0.008,
            currency: "LTC".to_string(),
            rate: None,
        };
        let (trade, order_id) = filled_trade(Some(fee));
        let order = trade.order(&order_id).unwrap().clone();

        // Wallet holds more than the position
        let adj = reconcile_fill(&trade, &order, &[], 8.5, precision).unwrap();
        assert_eq!(adj.amount, 8.0);
        assert_eq!(adj.fee_base, 0.0);
    }

    #[test]
    fn test_base_fee_reduces_amount() {
        let fee = FeeInfo {
            cost: 0.008,
            currency: "LTC".to_string(),
            rate: None,
        };
        let (mut trade, order_id) = filled_trade(Some(fee));
        let order = trade.order(&order_id).unwrap().clone();

        let adj = reconcile_fill(&trade, &order, &[], 7.992, precision).unwrap();
        assert!((adj.amount - 7.992).abs() < 1e-9);
        assert!((adj.fee_base - 0.008).abs() < 1e-9);

        apply_fee_adjustment(&mut trade, &adj).unwrap();
        assert!((trade.amount - 7.992).abs() < 1e-9);
        // Open rate is unchanged, stake follows the smaller amount
        assert_eq!(trade.open_rate, 0.25);
    }

    #[test]
    fn test_fee_above_ceiling_ignored() {
        let fee = FeeInfo {
            cost: 0.5,
            currency: "ETH".to_string(),
            rate: Some(0.25),
        };
        let (mut trade, order_id) = filled_trade(Some(fee));
        let order = trade.order(&order_id).unwrap().clone();

        let adj = reconcile_fill(&trade, &order, &[], 0.0, precision).unwrap();
        assert!(!adj.accepted);
        apply_fee_adjustment(&mut trade, &adj).unwrap();
        assert_eq!(trade.fee_open, 0.001);
        assert_eq!(trade.fee_open_cost, 0.0);
    }

    #[test]
    fn test_fee_from_execution_records() {
        let (trade, order_id) = filled_trade(None);
        let order = trade.order(&order_id).unwrap().clone();
        let records = vec![
            ExecutionRecord {
                order_id: order_id.clone(),
                amount: 5.0,
                price: 0.25,
                fee: Some(FeeInfo {
                    cost: 0.00125,
                    currency: "ETH".to_string(),
                    rate: Some(0.001),
                }),
            },
            ExecutionRecord {
                order_id: order_id.clone(),
                amount: 3.0,
                price: 0.25,
                fee: Some(FeeInfo {
                    cost: 0.0015,
                    currency: "ETH".to_string(),
                    rate: Some(0.002),
                }),
            },
        ];

        let adj = reconcile_fill(&trade, &order, &records, 0.0, precision).unwrap();
        assert!(adj.accepted);
        assert_eq!(adj.amount, 8.0);
        assert!((adj.fee_rate.unwrap() - 0.0015).abs() < 1e-12);
        assert!((adj.fee_cost - 0.00275).abs() < 1e-12);
    }

    #[test]
    fn test_records_of_other_orders_ignored() {
        let (trade, order_id) = filled_trade(None);
        let order = trade.order(&order_id).unwrap().clone();
        let records = vec![
            ExecutionRecord {
                order_id: order_id.clone(),
                amount: 8.0,
                price: 0.25,
                fee: Some(FeeInfo {
                    cost: 0.002,
                    currency: "ETH".to_string(),
                    rate: Some(0.001),
                }),
            },
            ExecutionRecord {
                order_id: "o-2".to_string(),
                amount: 4.0,
                price: 0.26,
                fee: Some(FeeInfo {
                    cost: 0.5,
                    currency: "LTC".to_string(),
                    rate: Some(0.005),
                }),
            },
        ];

        let adj = reconcile_fill(&trade, &order, &records, 0.0, precision).unwrap();
        assert!(adj.accepted);
        assert_eq!(adj.amount, 8.0);
        assert_eq!(adj.fee_base, 0.0);
        assert!((adj.fee_cost - 0.002).abs() < 1e-12);
        assert!((adj.fee_rate.unwrap() - 0.001).abs() < 1e-12);

        // Only foreign records is the same as none
        let adj = reconcile_fill(&trade, &order, &records[1..], 0.0, precision).unwrap();
        assert!(!adj.accepted);
    }

    #[test]
    fn test_execution_records_amount_mismatch() {
        let (trade, order_id) = filled_trade(None);
        let order = trade.order(&order_id).unwrap().clone();
        let records = vec![ExecutionRecord {
            order_id,
            amount: 7.0,
            price: 0.25,
            fee: None,
        }];

        let err = reconcile_fill(&trade, &order, &records, 0.0, precision).unwrap_err();
        assert!(matches!(err, EngineError::AmountMismatch { .. }));
        assert!(err.is_integrity_violation());
    }

    #[test]
    fn test_no_fee_data_is_untouched() {
        let (trade, order_id) = filled_trade(None);
        let order = trade.order(&order_id).unwrap().clone();
        let adj = reconcile_fill(&trade, &order, &[], 0.0, precision).unwrap();
        assert!(!adj.accepted);
        assert_eq!(adj.amount, 8.0);
    }

    #[test]
    fn test_fee_means_per_side() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut trade = Trade::new(1, "LTC/ETH", now, 0.001, 0.001, None);
        trade.update_fee(OrderSide::Entry, 0.1, Some(0.001));
        trade.update_fee(OrderSide::Entry, 0.1, Some(0.003));
        assert!((trade.fee_open - 0.002).abs() < 1e-12);
        assert!((trade.fee_close - 0.002).abs() < 1e-12);

        trade.update_fee(OrderSide::Exit, 0.1, Some(0.0005));
        assert!((trade.fee_close - 0.0005).abs() < 1e-12);
        assert!((trade.fee_open - 0.002).abs() < 1e-12);
    }
}
