use crate::backtest::runner::BacktestResult;
use crate::execution::trade::Trade;
use crate::models::ExitType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Record of a single closed trade for analysis
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub trade_id: u64,
    pub pair: String,
    pub entry_time: DateTime<Utc>,
    pub exit_time: DateTime<Utc>,
    pub entry_price: f64,
    pub exit_price: f64,
    pub amount: f64,
    pub entries: usize,
    pub pnl: f64,
    pub pnl_pct: f64,
    pub holding_period_minutes: i64,
    pub fees: f64,
    pub exit_reason: ExitType,
}

impl TradeRecord {
    /// None for trades that are still open
    pub fn from_trade(trade: &Trade) -> Option<Self> {
        if trade.is_open {
            return None;
        }
        let (Some(exit_price), Some(exit_time), Some(pnl)) =
            (trade.close_rate, trade.close_date, trade.close_profit_abs)
        else {
            return None;
        };

        let amount = trade.total_entry_amount();
        let entry_price = if amount > 0.0 {
            trade.total_entry_cost() / amount
        } else {
            trade.open_rate
        };

        Some(Self {
            trade_id: trade.id,
            pair: trade.pair.clone(),
            entry_time: trade.open_date,
            exit_time,
            entry_price,
            exit_price,
            amount,
            entries: trade.nr_of_successful_entries(),
            pnl,
            pnl_pct: trade.close_profit.unwrap_or(0.0) * 100.0,
            holding_period_minutes: (exit_time - trade.open_date).num_minutes(),
            fees: trade.fee_open_cost + trade.fee_close_cost,
            exit_reason: trade.exit_reason.unwrap_or(ExitType::ExitSignal),
        })
    }
}

/// Complete backtest performance metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestMetrics {
    pub strategy: String,

    // P&L Metrics
    pub total_pnl: f64,
    pub total_return_pct: f64,
    pub initial_portfolio_value: f64,
    pub final_portfolio_value: f64,
    pub total_fees: f64,

    // Trade Statistics
    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub win_rate: f64,
    pub rejected_signals: usize,
    pub timed_out_entries: usize,
    pub timed_out_exits: usize,

    // P&L Distribution
    pub avg_win: f64,
    pub avg_loss: f64,
    pub largest_win: f64,
    pub largest_loss: f64,
    pub profit_factor: f64, // Total wins / Total losses

    // Risk Metrics
    pub max_drawdown: f64,
    pub max_drawdown_pct: f64,
    pub sharpe_ratio: f64,

    // Holding Period
    pub avg_holding_period_minutes: f64,
    pub max_holding_period_minutes: i64,
    pub min_holding_period_minutes: i64,

    pub exit_reasons: BTreeMap<ExitType, usize>,

    pub trades: Vec<TradeRecord>,
}

impl BacktestMetrics {
    /// Calculate metrics from a finished run
    pub fn from_result(result: &BacktestResult) -> Self {
        let mut metrics = Self::from_trades(
            &result.trades,
            result.starting_balance,
            result.final_balance,
        );
        metrics.strategy = result.strategy.clone();
        metrics.rejected_signals = result.rejected_signals;
        metrics.timed_out_entries = result.timed_out_entries;
        metrics.timed_out_exits = result.timed_out_exits;
        metrics
    }

    /// Calculate metrics from closed trades
    pub fn from_trades(
        trades: &[Trade],
        initial_portfolio_value: f64,
        final_portfolio_value: f64,
    ) -> Self {
        let mut records: Vec<TradeRecord> = trades.iter().filter_map(TradeRecord::from_trade).collect();
        records.sort_by(|a, b| a.exit_time.cmp(&b.exit_time).then(a.trade_id.cmp(&b.trade_id)));

        let mut metrics = Self::empty(initial_portfolio_value, final_portfolio_value);
        let total_trades = records.len();
        if total_trades == 0 {
            return metrics;
        }

        // P&L calculations
        let total_pnl: f64 = records.iter().map(|t| t.pnl).sum();
        let total_return_pct = if initial_portfolio_value > 0.0 {
            ((final_portfolio_value - initial_portfolio_value) / initial_portfolio_value) * 100.0
        } else {
            0.0
        };

        let wins: Vec<f64> = records.iter().map(|t| t.pnl).filter(|p| *p > 0.0).collect();
        let losses: Vec<f64> = records.iter().map(|t| t.pnl).filter(|p| *p <= 0.0).collect();

        let total_wins: f64 = wins.iter().sum();
        let total_losses: f64 = losses.iter().map(|p| p.abs()).sum();

        let avg_win = if wins.is_empty() {
            0.0
        } else {
            total_wins / wins.len() as f64
        };
        let avg_loss = if losses.is_empty() {
            0.0
        } else {
            total_losses / losses.len() as f64
        };

        let largest_win = wins.iter().copied().fold(0.0, f64::max);
        let largest_loss = losses.iter().copied().fold(0.0, f64::min);

        let profit_factor = if total_losses > 0.0 {
            total_wins / total_losses
        } else if total_wins > 0.0 {
            f64::INFINITY
        } else {
            0.0
        };

        let (max_drawdown, max_drawdown_pct) =
            Self::calculate_drawdown(&records, initial_portfolio_value);
        let sharpe_ratio = Self::calculate_sharpe_ratio(&records);

        let holding_periods: Vec<i64> = records.iter().map(|t| t.holding_period_minutes).collect();
        let avg_holding_period_minutes =
            holding_periods.iter().sum::<i64>() as f64 / holding_periods.len() as f64;

        let mut exit_reasons = BTreeMap::new();
        for record in &records {
            *exit_reasons.entry(record.exit_reason).or_insert(0) += 1;
        }

        metrics.total_pnl = total_pnl;
        metrics.total_return_pct = total_return_pct;
        metrics.total_fees = records.iter().map(|t| t.fees).sum();
        metrics.total_trades = total_trades;
        metrics.winning_trades = wins.len();
        metrics.losing_trades = losses.len();
        metrics.win_rate = (wins.len() as f64 / total_trades as f64) * 100.0;
        metrics.avg_win = avg_win;
        metrics.avg_loss = avg_loss;
        metrics.largest_win = largest_win;
        metrics.largest_loss = largest_loss;
        metrics.profit_factor = profit_factor;
        metrics.max_drawdown = max_drawdown;
        metrics.max_drawdown_pct = max_drawdown_pct;
        metrics.sharpe_ratio = sharpe_ratio;
        metrics.avg_holding_period_minutes = avg_holding_period_minutes;
        metrics.max_holding_period_minutes = holding_periods.iter().copied().max().unwrap_or(0);
        metrics.min_holding_period_minutes = holding_periods.iter().copied().min().unwrap_or(0);
        metrics.exit_reasons = exit_reasons;
        metrics.trades = records;
        metrics
    }

    /// Empty metrics for when no trades occurred
    fn empty(initial_portfolio_value: f64, final_portfolio_value: f64) -> Self {
        Self {
            strategy: String::new(),
            total_pnl: 0.0,
            total_return_pct: 0.0,
            initial_portfolio_value,
            final_portfolio_value,
            total_fees: 0.0,
            total_trades: 0,
            winning_trades: 0,
            losing_trades: 0,
            win_rate: 0.0,
            rejected_signals: 0,
            timed_out_entries: 0,
            timed_out_exits: 0,
            avg_win: 0.0,
            avg_loss: 0.0,
            largest_win: 0.0,
            largest_loss: 0.0,
            profit_factor: 0.0,
            max_drawdown: 0.0,
            max_drawdown_pct: 0.0,
            sharpe_ratio: 0.0,
            avg_holding_period_minutes: 0.0,
            max_holding_period_minutes: 0,
            min_holding_period_minutes: 0,
            exit_reasons: BTreeMap::new(),
            trades: vec![],
        }
    }

    /// Maximum drawdown of the equity curve, trades applied in exit order
    fn calculate_drawdown(trades: &[TradeRecord], initial_value: f64) -> (f64, f64) {
        let mut peak = initial_value;
        let mut max_dd = 0.0;
        let mut max_dd_pct = 0.0;
        let mut current_value = initial_value;

        for trade in trades {
            current_value += trade.pnl;
            peak = f64::max(peak, current_value);

            let drawdown = peak - current_value;
            if drawdown > max_dd {
                max_dd = drawdown;
                max_dd_pct = if peak > 0.0 { (drawdown / peak) * 100.0 } else { 0.0 };
            }
        }

        (max_dd, max_dd_pct)
    }

    /// Calculate Sharpe ratio (simplified)
    /// Assumes risk-free rate of 0 for simplicity
    fn calculate_sharpe_ratio(trades: &[TradeRecord]) -> f64 {
        if trades.is_empty() {
            return 0.0;
        }

        let returns: Vec<f64> = trades.iter().map(|t| t.pnl_pct).collect();
        let mean_return = returns.iter().sum::<f64>() / returns.len() as f64;

        let variance = returns
            .iter()
            .map(|r| {
                let diff = r - mean_return;
                diff * diff
            })
            .sum::<f64>()
            / returns.len() as f64;

        let std_dev = variance.sqrt();

        if std_dev > 0.0 {
            mean_return / std_dev
        } else {
            0.0
        }
    }

    /// Print a formatted report to stdout
    pub fn print_report(&self) {
        println!("\n╔═══════════════════════════════════════════════════════╗");
        println!("║              BACKTEST PERFORMANCE REPORT              ║");
        println!("╚═══════════════════════════════════════════════════════╝\n");

        if !self.strategy.is_empty() {
            println!("  Strategy:              {}", self.strategy);
        }

        println!("📊 P&L SUMMARY");
        println!("  Initial Balance:       {:.2}", self.initial_portfolio_value);
        println!("  Final Balance:         {:.2}", self.final_portfolio_value);
        println!(
            "  Net P&L:               {:.2} ({:+.2}%)",
            self.total_pnl, self.total_return_pct
        );
        println!("  Fees Paid:             {:.4}", self.total_fees);

        println!("\n📈 TRADE STATISTICS");
        println!("  Total Trades:          {}", self.total_trades);
        println!(
            "  Winning Trades:        {} ({:.1}%)",
            self.winning_trades, self.win_rate
        );
        println!("  Losing Trades:         {}", self.losing_trades);
        println!("  Rejected Signals:      {}", self.rejected_signals);
        println!(
            "  Timed Out Orders:      {} entry / {} exit",
            self.timed_out_entries, self.timed_out_exits
        );

        if self.total_trades > 0 {
            println!("\n💰 WIN/LOSS ANALYSIS");
            println!("  Average Win:           {:.4}", self.avg_win);
            println!("  Average Loss:          {:.4}", self.avg_loss);
            println!("  Largest Win:           {:.4}", self.largest_win);
            println!("  Largest Loss:          {:.4}", self.largest_loss);
            println!("  Profit Factor:         {:.2}", self.profit_factor);

            println!("\n⚠️  RISK METRICS");
            println!(
                "  Max Drawdown:          {:.4} ({:.2}%)",
                self.max_drawdown, self.max_drawdown_pct
            );
            println!("  Sharpe Ratio:          {:.2}", self.sharpe_ratio);

            println!("\n⏱️  HOLDING PERIODS");
            println!(
                "  Average:               {:.1} minutes ({:.1} hours)",
                self.avg_holding_period_minutes,
                self.avg_holding_period_minutes / 60.0
            );
            println!("  Max:                   {} minutes", self.max_holding_period_minutes);
            println!("  Min:                   {} minutes", self.min_holding_period_minutes);

            println!("\n🚪 EXIT REASONS");
            for (reason, count) in &self.exit_reasons {
                println!("  {:<22} {}", format!("{}:", reason), count);
            }
        }

        println!("\n═════════════════════════════════════════════════════════\n");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn closed_trade(id: u64, pnl: f64, holding_minutes: i64, reason: ExitType) -> Trade {
        let open = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::hours(id as i64);
        let mut trade = Trade::new(id, "BTC/USDT", open, 0.0, 0.0, None);
        trade.is_open = false;
        trade.open_rate = 100.0;
        trade.close_rate = Some(100.0 + pnl);
        trade.close_date = Some(open + Duration::minutes(holding_minutes));
        trade.close_profit_abs = Some(pnl);
        trade.close_profit = Some(pnl / 100.0);
        trade.exit_reason = Some(reason);
        trade
    }

    #[test]
    fn test_metrics_with_winning_trades() {
        let trades = vec![
            closed_trade(1, 100.0, 60, ExitType::Roi),
            closed_trade(2, 50.0, 120, ExitType::Roi),
            closed_trade(3, -30.0, 90, ExitType::StopLoss),
        ];

        let metrics = BacktestMetrics::from_trades(&trades, 10000.0, 10120.0);

        assert_eq!(metrics.total_trades, 3);
        assert_eq!(metrics.winning_trades, 2);
        assert_eq!(metrics.losing_trades, 1);
        assert!((metrics.win_rate - 66.66).abs() < 0.1);
        assert!((metrics.total_pnl - 120.0).abs() < 0.01);
        assert_eq!(metrics.exit_reasons.get(&ExitType::Roi), Some(&2));
        assert_eq!(metrics.exit_reasons.get(&ExitType::StopLoss), Some(&1));
        assert_eq!(metrics.max_holding_period_minutes, 120);
    }

    #[test]
    fn test_metrics_with_no_trades() {
        let metrics = BacktestMetrics::from_trades(&[], 10000.0, 10000.0);

        assert_eq!(metrics.total_trades, 0);
        assert_eq!(metrics.win_rate, 0.0);
        assert_eq!(metrics.total_pnl, 0.0);
    }

    #[test]
    fn test_open_trades_are_ignored() {
        let open = Trade::new(9, "ETH/USDT", Utc::now(), 0.001, 0.001, None);
        let metrics = BacktestMetrics::from_trades(&[open], 1000.0, 1000.0);
        assert_eq!(metrics.total_trades, 0);
    }

    #[test]
    fn test_profit_factor_calculation() {
        let trades = vec![
            closed_trade(1, 200.0, 60, ExitType::Roi),
            closed_trade(2, 100.0, 60, ExitType::Roi),
            closed_trade(3, -50.0, 60, ExitType::StopLoss),
        ];

        let metrics = BacktestMetrics::from_trades(&trades, 10000.0, 10250.0);

        // Profit factor = Total wins / Total losses = 300 / 50 = 6.0
        assert!((metrics.profit_factor - 6.0).abs() < 0.01);
    }

    #[test]
    fn test_drawdown_calculation() {
        let trades = vec![
            closed_trade(1, 100.0, 60, ExitType::Roi),        // Peak at 10100
            closed_trade(2, -200.0, 60, ExitType::StopLoss),  // Down to 9900 (drawdown: 200)
            closed_trade(3, 50.0, 60, ExitType::ExitSignal),  // Back to 9950
        ];

        let metrics = BacktestMetrics::from_trades(&trades, 10000.0, 9950.0);

        assert!((metrics.max_drawdown - 200.0).abs() < 0.01);
        assert!((metrics.max_drawdown_pct - 200.0 / 10100.0 * 100.0).abs() < 1e-9);
    }
}
