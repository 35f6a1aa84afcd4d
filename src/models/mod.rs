use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Direction of a futures position.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OrderSide {
    Long,
    Short,
}

impl OrderSide {
    /// The side of the order that closes a position opened on this side.
    pub fn closing(self) -> OrderSide {
        match self {
            OrderSide::Long => OrderSide::Short,
            OrderSide::Short => OrderSide::Long,
        }
    }

    /// Signed profit for a move from `entry` to `exit` at the given volume.
    pub fn profit(self, entry: f64, exit: f64, volume: f64) -> f64 {
        match self {
            OrderSide::Long => (exit - entry) * volume,
            OrderSide::Short => (entry - exit) * volume,
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderSide::Long => write!(f, "LONG"),
            OrderSide::Short => write!(f, "SHORT"),
        }
    }
}

/// OHLCV candlestick data for one bar
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: DateTime<Utc>,
    pub close_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Order state as reported by the exchange
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Expired,
    // the venue spells it with one L
    #[serde(rename = "CANCELED")]
    Cancelled,
}

/// Exchange answer to an order-status query
#[derive(Debug, Clone)]
pub struct OrderReport {
    pub order_id: i64,
    pub status: OrderStatus,
    pub avg_price: f64,
    pub update_time: DateTime<Utc>,
}

/// Exchange acknowledgement of an accepted order
#[derive(Debug, Clone)]
pub struct OrderAck {
    pub order_id: i64,
    pub client_order_id: String,
}

/// Exchange-side view of the open position for a symbol
#[derive(Debug, Clone, Default)]
pub struct PositionInfo {
    pub amount: f64,
    pub entry_price: f64,
    pub mark_price: f64,
    pub liquidation_price: f64,
    pub leverage: f64,
    pub unrealized_profit: f64,
    pub isolated_margin: f64,
    pub notional: f64,
    pub margin_type: Option<String>,
}

/// Margin mode applied per symbol on the exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarginMode {
    Isolated,
    Cross,
}

impl MarginMode {
    pub fn as_str(self) -> &'static str {
        match self {
            MarginMode::Isolated => "ISOLATED",
            MarginMode::Cross => "CROSSED",
        }
    }
}

/// Instrument metadata snapshot used for rounding and asset display
///
/// Refreshed on a fixed interval; the precisions are the exchange's declared
/// decimal limits for prices and quantities.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolInfo {
    pub symbol: String,
    pub base_asset: String,
    pub quote_asset: String,
    pub margin_asset: String,
    pub price_precision: u32,
    pub quantity_precision: u32,
}

/// What a trader is currently doing, surfaced to the notifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraderStatus {
    Waiting,
    Trading,
    Stopped,
    Failed(String),
}

impl std::fmt::Display for TraderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TraderStatus::Waiting => write!(f, "waiting"),
            TraderStatus::Trading => write!(f, "trading"),
            TraderStatus::Stopped => write!(f, "stopped"),
            TraderStatus::Failed(msg) => write!(f, "{}", msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closing_side_flips() {
        assert_eq!(OrderSide::Long.closing(), OrderSide::Short);
        assert_eq!(OrderSide::Short.closing(), OrderSide::Long);
    }

    #[test]
    fn test_signed_profit() {
        assert_eq!(OrderSide::Long.profit(100.0, 110.0, 2.0), 20.0);
        assert_eq!(OrderSide::Long.profit(100.0, 97.0, 2.0), -6.0);
        assert_eq!(OrderSide::Short.profit(100.0, 97.0, 2.0), 6.0);
        assert_eq!(OrderSide::Short.profit(100.0, 110.0, 2.0), -20.0);
    }

    #[test]
    fn test_order_status_parses_exchange_strings() {
        let status: OrderStatus = serde_json::from_str("\"FILLED\"").unwrap();
        assert_eq!(status, OrderStatus::Filled);
        let status: OrderStatus = serde_json::from_str("\"EXPIRED\"").unwrap();
        assert_eq!(status, OrderStatus::Expired);
    }

    #[test]
    fn test_trader_status_display() {
        assert_eq!(TraderStatus::Waiting.to_string(), "waiting");
        assert_eq!(
            TraderStatus::Failed("margin is insufficient".to_string()).to_string(),
            "margin is insufficient"
        );
    }
}
