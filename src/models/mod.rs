use crate::error::EngineError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// OHLCV candlestick for one pair and timeframe
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Candle {
    pub date: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    pub fn new(date: DateTime<Utc>, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Self {
        Self {
            date,
            open,
            high,
            low,
            close,
            volume,
        }
    }

    /// Candle with all four prices equal (used for live quotes)
    pub fn flat(date: DateTime<Utc>, price: f64) -> Self {
        Self::new(date, price, price, price, price, 0.0)
    }

    /// Red candle: closed below its open
    pub fn is_red(&self) -> bool {
        self.open > self.close
    }

    /// True if `price` was traded within this candle
    pub fn contains(&self, price: f64) -> bool {
        self.low <= price && price <= self.high
    }
}

/// Entry/exit signal emitted by a strategy for one candle
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SignalSet {
    pub enter: bool,
    pub exit: bool,
    pub enter_tag: Option<String>,
    pub exit_tag: Option<String>,
}

impl SignalSet {
    pub fn entry(tag: Option<&str>) -> Self {
        Self {
            enter: true,
            enter_tag: tag.map(str::to_string),
            ..Default::default()
        }
    }

    pub fn exit(tag: Option<&str>) -> Self {
        Self {
            exit: true,
            exit_tag: tag.map(str::to_string),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OrderSide {
    Entry,
    Exit,
    Stop,
}

impl OrderSide {
    pub fn is_entry(&self) -> bool {
        matches!(self, OrderSide::Entry)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Entry => "entry",
            OrderSide::Exit => "exit",
            OrderSide::Stop => "stop",
        }
    }
}

impl FromStr for OrderSide {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "entry" => Ok(OrderSide::Entry),
            "exit" => Ok(OrderSide::Exit),
            "stop" => Ok(OrderSide::Stop),
            other => Err(EngineError::InvalidOrder(format!("unknown order side {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Open,
    Closed,
    Canceled,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Open => "open",
            OrderStatus::Closed => "closed",
            OrderStatus::Canceled => "canceled",
        }
    }
}

impl FromStr for OrderStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(OrderStatus::Open),
            "closed" => Ok(OrderStatus::Closed),
            "canceled" | "cancelled" | "expired" | "rejected" => Ok(OrderStatus::Canceled),
            other => Err(EngineError::InvalidOrder(format!("unknown order status {}", other))),
        }
    }
}

/// Why a trade was closed
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ExitType {
    StopLoss,
    TrailingStopLoss,
    Roi,
    ExitSignal,
    CustomExit,
    ForceExit,
    EmergencyExit,
}

impl ExitType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitType::StopLoss => "stop_loss",
            ExitType::TrailingStopLoss => "trailing_stop_loss",
            ExitType::Roi => "roi",
            ExitType::ExitSignal => "exit_signal",
            ExitType::CustomExit => "custom_exit",
            ExitType::ForceExit => "force_exit",
            ExitType::EmergencyExit => "emergency_exit",
        }
    }

    /// Stop-type exits are priced off the stop, not the candle open
    pub fn is_stop(&self) -> bool {
        matches!(self, ExitType::StopLoss | ExitType::TrailingStopLoss)
    }
}

impl fmt::Display for ExitType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExitType {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stop_loss" => Ok(ExitType::StopLoss),
            "trailing_stop_loss" => Ok(ExitType::TrailingStopLoss),
            "roi" => Ok(ExitType::Roi),
            "exit_signal" => Ok(ExitType::ExitSignal),
            "custom_exit" => Ok(ExitType::CustomExit),
            "force_exit" => Ok(ExitType::ForceExit),
            "emergency_exit" => Ok(ExitType::EmergencyExit),
            other => Err(EngineError::Dependency(format!("unknown exit type {}", other))),
        }
    }
}

/// Fee charged on a fill, as reported by the exchange
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeeInfo {
    pub cost: f64,
    pub currency: String,
    pub rate: Option<f64>,
}

/// Split "BTC/USDT" into ("BTC", "USDT")
pub fn split_pair(pair: &str) -> (&str, &str) {
    match pair.split_once('/') {
        Some((base, quote)) => (base, quote.split(':').next().unwrap_or(quote)),
        None => (pair, ""),
    }
}

/// Round an amount down to `decimals` places
pub fn amount_to_precision(amount: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    // Nudge before flooring so 0.3 * 1e8 does not land on 29999999.99..
    ((amount * factor) + 1e-6).floor() / factor
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_candle_helpers() {
        let date = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let candle = Candle::new(date, 1.1, 1.2, 0.9, 1.0, 100.0);

        assert!(candle.is_red());
        assert!(candle.contains(0.95));
        assert!(candle.contains(1.2));
        assert!(!candle.contains(1.21));

        let flat = Candle::flat(date, 2.0);
        assert!(!flat.is_red());
        assert_eq!(flat.high, flat.low);
    }

    #[test]
    fn test_exit_type_roundtrip_str() {
        for exit_type in [
            ExitType::StopLoss,
            ExitType::TrailingStopLoss,
            ExitType::Roi,
            ExitType::ExitSignal,
            ExitType::CustomExit,
            ExitType::ForceExit,
            ExitType::EmergencyExit,
        ] {
            assert_eq!(exit_type.as_str().parse::<ExitType>().unwrap(), exit_type);
        }
        assert!("bogus".parse::<ExitType>().is_err());
    }

    #[test]
    fn test_split_pair() {
        assert_eq!(split_pair("BTC/USDT"), ("BTC", "USDT"));
        assert_eq!(split_pair("ETH/USDT:USDT"), ("ETH", "USDT"));
        assert_eq!(split_pair("XRP"), ("XRP", ""));
    }

    #[test]
    fn test_amount_to_precision() {
        assert_eq!(amount_to_precision(0.3, 8), 0.3);
        assert_eq!(amount_to_precision(1.234567891, 8), 1.23456789);
        assert_eq!(amount_to_precision(9.999, 2), 9.99);
    }

    #[test]
    fn test_order_status_aliases() {
        assert_eq!("expired".parse::<OrderStatus>().unwrap(), OrderStatus::Canceled);
        assert_eq!("closed".parse::<OrderStatus>().unwrap(), OrderStatus::Closed);
    }
}
