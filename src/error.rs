use thiserror::Error;

/// Errors raised by the trade-lifecycle engine
#[derive(Error, Debug)]
pub enum EngineError {
    // Recoverable preconditions
    #[error("Dependency not met: {0}")]
    Dependency(String),

    // Exchange collaborator failures
    #[error("Exchange error: {0}")]
    Exchange(String),

    #[error("Insufficient funds: {0}")]
    InsufficientFunds(String),

    #[error("Invalid order: {0}")]
    InvalidOrder(String),

    // Data integrity violations
    #[error("Amount mismatch on order {order_id}: executed {executed}, reported {reported}")]
    AmountMismatch {
        order_id: String,
        executed: f64,
        reported: f64,
    },

    #[error("ROI exit on opening candle of trade {trade_id} cannot be priced above candle close")]
    OpeningCandleRoiViolation { trade_id: u64 },

    #[error("Order mismatch: expected {expected}, got {got}")]
    OrderMismatch { expected: String, got: String },

    // Ledger state errors
    #[error("Trade {0} is already closed")]
    AlreadyClosed(u64),

    #[error("Trade not found: {0}")]
    TradeNotFound(u64),

    #[error("Order not found: {0}")]
    OrderNotFound(String),

    #[error("Trade {trade_id} already has open order {order_id}")]
    OpenOrderExists { trade_id: u64, order_id: String },

    // Ambient errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Timeout: {0}")]
    Timeout(String),
}

impl EngineError {
    /// Data-integrity violations stop processing of the affected trade
    pub fn is_integrity_violation(&self) -> bool {
        matches!(
            self,
            EngineError::AmountMismatch { .. }
                | EngineError::OpeningCandleRoiViolation { .. }
                | EngineError::OrderMismatch { .. }
        )
    }

    /// Errors worth retrying on the next cycle
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::Dependency(_)
                | EngineError::Exchange(_)
                | EngineError::Timeout(_)
                | EngineError::Redis(_)
                | EngineError::Database(_)
        )
    }

    /// Errors that trigger a recovery scan of the trade's orders
    pub fn needs_recovery(&self) -> bool {
        matches!(
            self,
            EngineError::InsufficientFunds(_) | EngineError::InvalidOrder(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let mismatch = EngineError::AmountMismatch {
            order_id: "abc".to_string(),
            executed: 1.0,
            reported: 2.0,
        };
        assert!(mismatch.is_integrity_violation());
        assert!(!mismatch.is_retryable());

        let exchange = EngineError::Exchange("timeout".to_string());
        assert!(exchange.is_retryable());
        assert!(!exchange.is_integrity_violation());

        assert!(EngineError::InsufficientFunds("BTC".to_string()).needs_recovery());
        assert!(!EngineError::TradeNotFound(3).needs_recovery());
    }

    #[test]
    fn test_error_messages() {
        let err = EngineError::OrderMismatch {
            expected: "o-1".to_string(),
            got: "o-2".to_string(),
        };
        assert_eq!(err.to_string(), "Order mismatch: expected o-1, got o-2");
        assert_eq!(
            EngineError::AlreadyClosed(7).to_string(),
            "Trade 7 is already closed"
        );
    }
}
