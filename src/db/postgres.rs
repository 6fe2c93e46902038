use crate::execution::{Order, Trade};
use crate::models::{ExitType, OrderSide, OrderStatus};
use crate::Result;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::str::FromStr;

/// Postgres persistence for trades and orders
pub struct PostgresPersistence {
    pool: PgPool,
}

impl PostgresPersistence {
    /// Connect to Postgres and run pending migrations
    ///
    /// # Arguments
    /// * `database_url` - Postgres connection URL
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;

        // Run migrations
        sqlx::migrate!("./migrations").run(&pool).await?;

        tracing::info!("Connected to Postgres at {}", database_url);

        Ok(Self { pool })
    }

    /// Upsert a trade and all of its orders in one transaction
    pub async fn save_trade(&self, trade: &Trade) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO trades (
                id, pair, is_open, open_date, close_date,
                amount, stake_amount, open_rate, realized_profit,
                close_rate, close_profit, close_profit_abs,
                fee_open, fee_close, fee_open_cost, fee_close_cost,
                stop_loss, stop_loss_pct, initial_stop_loss, initial_stop_loss_pct,
                max_rate, min_rate, enter_tag, exit_reason, exit_tag, exit_timeouts
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13,
                    $14, $15, $16, $17, $18, $19, $20, $21, $22, $23, $24, $25, $26)
            ON CONFLICT (id) DO UPDATE SET
                is_open = EXCLUDED.is_open,
                close_date = EXCLUDED.close_date,
                amount = EXCLUDED.amount,
                stake_amount = EXCLUDED.stake_amount,
                open_rate = EXCLUDED.open_rate,
                realized_profit = EXCLUDED.realized_profit,
                close_rate = EXCLUDED.close_rate,
                close_profit = EXCLUDED.close_profit,
                close_profit_abs = EXCLUDED.close_profit_abs,
                fee_open = EXCLUDED.fee_open,
                fee_close = EXCLUDED.fee_close,
                fee_open_cost = EXCLUDED.fee_open_cost,
                fee_close_cost = EXCLUDED.fee_close_cost,
                stop_loss = EXCLUDED.stop_loss,
                stop_loss_pct = EXCLUDED.stop_loss_pct,
                initial_stop_loss = EXCLUDED.initial_stop_loss,
                initial_stop_loss_pct = EXCLUDED.initial_stop_loss_pct,
                max_rate = EXCLUDED.max_rate,
                min_rate = EXCLUDED.min_rate,
                exit_reason = EXCLUDED.exit_reason,
                exit_tag = EXCLUDED.exit_tag,
                exit_timeouts = EXCLUDED.exit_timeouts,
                updated_at = NOW()
            "#,
        )
        .bind(trade.id as i64)
        .bind(&trade.pair)
        .bind(trade.is_open)
        .bind(trade.open_date)
        .bind(trade.close_date)
        .bind(trade.amount)
        .bind(trade.stake_amount)
        .bind(trade.open_rate)
        .bind(trade.realized_profit)
        .bind(trade.close_rate)
        .bind(trade.close_profit)
        .bind(trade.close_profit_abs)
        .bind(trade.fee_open)
        .bind(trade.fee_close)
        .bind(trade.fee_open_cost)
        .bind(trade.fee_close_cost)
        .bind(trade.stop_loss)
        .bind(trade.stop_loss_pct)
        .bind(trade.initial_stop_loss)
        .bind(trade.initial_stop_loss_pct)
        .bind(trade.max_rate)
        .bind(trade.min_rate)
        .bind(&trade.enter_tag)
        .bind(trade.exit_reason.map(|r| r.as_str()))
        .bind(&trade.exit_tag)
        .bind(trade.exit_timeouts as i32)
        .execute(&mut *tx)
        .await?;

        for order in &trade.orders {
            Self::save_order(&mut tx, order).await?;
        }

        tx.commit().await?;

        tracing::debug!(
            "Saved trade {} ({}) with {} orders to Postgres",
            trade.id,
            trade.pair,
            trade.orders.len()
        );

        Ok(())
    }

    async fn save_order(tx: &mut Transaction<'_, Postgres>, order: &Order) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO orders (
                id, trade_id, order_id, pair, side, status,
                price, amount, filled, remaining, average, cost,
                created_at, filled_at, order_updated_at,
                fee_base, fee_cost, fee_currency, fee_rate, tag
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10,
                    $11, $12, $13, $14, $15, $16, $17, $18, $19, $20)
            ON CONFLICT (id) DO UPDATE SET
                status = EXCLUDED.status,
                amount = EXCLUDED.amount,
                filled = EXCLUDED.filled,
                remaining = EXCLUDED.remaining,
                average = EXCLUDED.average,
                cost = EXCLUDED.cost,
                filled_at = EXCLUDED.filled_at,
                order_updated_at = EXCLUDED.order_updated_at,
                fee_base = EXCLUDED.fee_base,
                fee_cost = EXCLUDED.fee_cost,
                fee_currency = EXCLUDED.fee_currency,
                fee_rate = EXCLUDED.fee_rate
            "#,
        )
        .bind(order.id as i64)
        .bind(order.trade_id as i64)
        .bind(&order.order_id)
        .bind(&order.pair)
        .bind(order.side.as_str())
        .bind(order.status.as_str())
        .bind(order.price)
        .bind(order.amount)
        .bind(order.filled)
        .bind(order.remaining)
        .bind(order.average)
        .bind(order.cost)
        .bind(order.created_at)
        .bind(order.filled_at)
        .bind(order.updated_at)
        .bind(order.fee_base)
        .bind(order.fee_cost)
        .bind(&order.fee_currency)
        .bind(order.fee_rate)
        .bind(&order.tag)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    /// Remove a trade that never opened (its orders cascade)
    pub async fn delete_trade(&self, trade_id: u64) -> Result<()> {
        sqlx::query("DELETE FROM trades WHERE id = $1")
            .bind(trade_id as i64)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Load every trade with its orders, oldest first
    pub async fn load_trades(&self) -> Result<Vec<Trade>> {
        let rows = sqlx::query("SELECT * FROM trades ORDER BY id ASC")
            .fetch_all(&self.pool)
            .await?;
        self.rows_to_trades(rows).await
    }

    /// Load trades that are still open
    pub async fn load_open_trades(&self) -> Result<Vec<Trade>> {
        let rows = sqlx::query("SELECT * FROM trades WHERE is_open ORDER BY id ASC")
            .fetch_all(&self.pool)
            .await?;
        self.rows_to_trades(rows).await
    }

    /// Sum of closed trade profit
    pub async fn get_total_profit(&self) -> Result<f64> {
        let row = sqlx::query(
            r#"
            SELECT COALESCE(SUM(close_profit_abs), 0)::DOUBLE PRECISION AS total_profit
            FROM trades
            WHERE NOT is_open
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(row.get("total_profit"))
    }

    /// Delete all trades and orders (testing only)
    #[cfg(test)]
    pub async fn clear_all_trades(&self) -> Result<()> {
        sqlx::query("DELETE FROM trades").execute(&self.pool).await?;
        Ok(())
    }

    async fn rows_to_trades(&self, rows: Vec<PgRow>) -> Result<Vec<Trade>> {
        let mut trades = Vec::with_capacity(rows.len());

        for row in rows {
            let mut trade = trade_from_row(&row)?;

            let order_rows = sqlx::query("SELECT * FROM orders WHERE trade_id = $1 ORDER BY id ASC")
                .bind(trade.id as i64)
                .fetch_all(&self.pool)
                .await?;
            trade.orders = order_rows
                .iter()
                .map(order_from_row)
                .collect::<Result<Vec<_>>>()?;

            trades.push(trade);
        }

        tracing::info!("Loaded {} trades from Postgres", trades.len());
        Ok(trades)
    }
}

fn trade_from_row(row: &PgRow) -> Result<Trade> {
    let id: i64 = row.get("id");
    let pair: String = row.get("pair");
    let open_date: DateTime<Utc> = row.get("open_date");
    let fee_open: f64 = row.get("fee_open");
    let fee_close: f64 = row.get("fee_close");
    let enter_tag: Option<String> = row.get("enter_tag");

    let mut trade = Trade::new(id as u64, &pair, open_date, fee_open, fee_close, enter_tag);
    trade.is_open = row.get("is_open");
    trade.close_date = row.get("close_date");
    trade.amount = row.get("amount");
    trade.stake_amount = row.get("stake_amount");
    trade.open_rate = row.get("open_rate");
    trade.realized_profit = row.get("realized_profit");
    trade.close_rate = row.get("close_rate");
    trade.close_profit = row.get("close_profit");
    trade.close_profit_abs = row.get("close_profit_abs");
    trade.fee_open_cost = row.get("fee_open_cost");
    trade.fee_close_cost = row.get("fee_close_cost");
    trade.stop_loss = row.get("stop_loss");
    trade.stop_loss_pct = row.get("stop_loss_pct");
    trade.initial_stop_loss = row.get("initial_stop_loss");
    trade.initial_stop_loss_pct = row.get("initial_stop_loss_pct");
    trade.max_rate = row.get("max_rate");
    trade.min_rate = row.get("min_rate");
    trade.exit_tag = row.get("exit_tag");

    let exit_reason: Option<String> = row.get("exit_reason");
    trade.exit_reason = exit_reason.as_deref().map(ExitType::from_str).transpose()?;

    let exit_timeouts: i32 = row.get("exit_timeouts");
    trade.exit_timeouts = exit_timeouts.max(0) as u32;
    trade.recalc_open_trade_value();

    Ok(trade)
}

fn order_from_row(row: &PgRow) -> Result<Order> {
    let id: i64 = row.get("id");
    let trade_id: i64 = row.get("trade_id");
    let order_id: String = row.get("order_id");
    let pair: String = row.get("pair");
    let side: String = row.get("side");
    let price: f64 = row.get("price");
    let amount: f64 = row.get("amount");
    let created_at: DateTime<Utc> = row.get("created_at");

    let mut order = Order::new(
        id as u64,
        trade_id as u64,
        order_id,
        &pair,
        OrderSide::from_str(&side)?,
        price,
        amount,
        created_at,
    );

    let status: String = row.get("status");
    order.status = OrderStatus::from_str(&status)?;
    order.filled = row.get("filled");
    order.remaining = row.get("remaining");
    order.average = row.get("average");
    order.cost = row.get("cost");
    order.filled_at = row.get("filled_at");
    order.updated_at = row.get("order_updated_at");
    order.fee_base = row.get("fee_base");
    order.fee_cost = row.get("fee_cost");
    order.fee_currency = row.get("fee_currency");
    order.fee_rate = row.get("fee_rate");
    order.tag = row.get("tag");

    Ok(order)
}
