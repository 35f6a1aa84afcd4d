//! Trade event notifications
//!
//! The trading core reports noteworthy events through this seam; the default
//! sink writes structured log lines. A chat or webhook notifier would slot
//! in behind the same trait.

use crate::trading::Position;

pub trait Notifier: Send + Sync {
    fn position_opened(&self, symbol: &str, position: &Position);
    fn position_closed(&self, symbol: &str, position: &Position);
    fn trader_failed(&self, symbol: &str, reason: &str);
}

/// Writes every event to the log
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn position_opened(&self, symbol: &str, position: &Position) {
        tracing::info!(
            symbol,
            side = ?position.side,
            volume = position.volume,
            entry_price = position.entry_price,
            take_profit = position.take_profit,
            stop_loss = position.stop_loss,
            "position opened"
        );
    }

    fn position_closed(&self, symbol: &str, position: &Position) {
        tracing::info!(
            symbol,
            side = ?position.side,
            volume = position.volume,
            entry_price = position.entry_price,
            exit_price = ?position.exit_price,
            profit = ?position.profit,
            "position closed"
        );
    }

    fn trader_failed(&self, symbol: &str, reason: &str) {
        tracing::error!(symbol, reason, "trader failed");
    }
}
