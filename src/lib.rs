// Core modules
pub mod backtest;
pub mod config;
pub mod db;
pub mod error;
pub mod exchange;
pub mod execution;
pub mod indicators;
pub mod live;
pub mod models;
pub mod notify;
pub mod persistence;
pub mod strategy;

// Re-export commonly used types
pub use crate::config::EngineConfig;
pub use crate::error::EngineError;
pub use crate::models::*;
pub use crate::strategy::Strategy;

// Error handling
pub type Result<T> = std::result::Result<T, EngineError>;
