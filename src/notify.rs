//! Fire-and-forget trade notifications
//!
//! Delivery failures are logged and dropped; they never reach the engine.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::models::ExitType;
use crate::Result;

/// Events emitted by the live engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TradeEvent {
    Entry {
        trade_id: u64,
        pair: String,
        rate: f64,
        stake: f64,
        enter_tag: Option<String>,
    },
    EntryFill {
        trade_id: u64,
        pair: String,
        open_rate: f64,
        amount: f64,
    },
    EntryCancel {
        trade_id: u64,
        pair: String,
        reason: String,
    },
    Exit {
        trade_id: u64,
        pair: String,
        rate: f64,
        exit_type: ExitType,
        exit_tag: Option<String>,
    },
    ExitFill {
        trade_id: u64,
        pair: String,
        close_rate: f64,
        profit_abs: f64,
        profit_ratio: f64,
    },
    ExitCancel {
        trade_id: u64,
        pair: String,
        reason: String,
    },
    Warning {
        message: String,
    },
}

impl TradeEvent {
    pub fn emoji(&self) -> &'static str {
        match self {
            TradeEvent::Entry { .. } => "🟢",
            TradeEvent::EntryFill { .. } => "✅",
            TradeEvent::EntryCancel { .. } | TradeEvent::ExitCancel { .. } => "❌",
            TradeEvent::Exit { .. } => "🔴",
            TradeEvent::ExitFill { profit_abs, .. } if *profit_abs >= 0.0 => "💰",
            TradeEvent::ExitFill { .. } => "📉",
            TradeEvent::Warning { .. } => "⚠️",
        }
    }

    /// One-line human readable summary
    pub fn summary(&self) -> String {
        match self {
            TradeEvent::Entry {
                trade_id,
                pair,
                rate,
                stake,
                enter_tag,
            } => format!(
                "Entering {} (trade {}) @ {:.8} stake {:.4} [{}]",
                pair,
                trade_id,
                rate,
                stake,
                enter_tag.as_deref().unwrap_or("-")
            ),
            TradeEvent::EntryFill {
                trade_id,
                pair,
                open_rate,
                amount,
            } => format!(
                "Entry filled {} (trade {}): {:.8} @ {:.8}",
                pair, trade_id, amount, open_rate
            ),
            TradeEvent::EntryCancel {
                trade_id,
                pair,
                reason,
            } => format!("Entry cancelled {} (trade {}): {}", pair, trade_id, reason),
            TradeEvent::Exit {
                trade_id,
                pair,
                rate,
                exit_type,
                exit_tag,
            } => format!(
                "Exiting {} (trade {}) @ {:.8}: {}{}",
                pair,
                trade_id,
                rate,
                exit_type,
                exit_tag.as_ref().map(|t| format!(" ({})", t)).unwrap_or_default()
            ),
            TradeEvent::ExitFill {
                trade_id,
                pair,
                close_rate,
                profit_abs,
                profit_ratio,
            } => format!(
                "Closed {} (trade {}) @ {:.8}: {:+.4} ({:+.2}%)",
                pair,
                trade_id,
                close_rate,
                profit_abs,
                profit_ratio * 100.0
            ),
            TradeEvent::ExitCancel {
                trade_id,
                pair,
                reason,
            } => format!("Exit cancelled {} (trade {}): {}", pair, trade_id, reason),
            TradeEvent::Warning { message } => message.clone(),
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, event: &TradeEvent) -> Result<()>;
}

/// Writes events to the tracing log
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, event: &TradeEvent) -> Result<()> {
        match event {
            TradeEvent::Warning { .. } => tracing::warn!("{} {}", event.emoji(), event.summary()),
            _ => tracing::info!("{} {}", event.emoji(), event.summary()),
        }
        Ok(())
    }
}

/// Optional notifier that swallows delivery errors
#[derive(Clone, Default)]
pub struct NotificationSink {
    notifier: Option<Arc<dyn Notifier>>,
}

impl NotificationSink {
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        Self {
            notifier: Some(notifier),
        }
    }

    pub fn disabled() -> Self {
        Self { notifier: None }
    }

    pub async fn emit(&self, event: TradeEvent) {
        let Some(notifier) = &self.notifier else {
            return;
        };
        if let Err(e) = notifier.send(&event).await {
            tracing::warn!("Notification failed ({}): {}", event.summary(), e);
        }
    }
}
