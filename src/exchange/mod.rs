// Exchange gateway: the only layer that talks to the venue
pub mod binance;
pub mod paper;

pub use binance::BinanceFutures;
pub use paper::{PaperExchange, ScriptedFailure};

use async_trait::async_trait;
use thiserror::Error;

use crate::models::{
    Candle, MarginMode, OrderAck, OrderReport, OrderSide, PositionInfo, SymbolInfo,
};

/// Binance error code for "TIF GTE can only be used with open positions or
/// open orders": the benign race hit when an exit order is submitted after
/// the position was already closed by someone else.
pub const NO_OPEN_POSITION_CODE: i64 = -4129;

/// Failure taxonomy for exchange operations
///
/// Callers branch on the variant, never on message text.
#[derive(Debug, Error)]
pub enum ExchangeError {
    /// Exit order submitted but there is no open position or order to
    /// attach it to; the position was closed outside the bot.
    #[error("no open position or order to attach to")]
    NoOpenPosition,

    /// Transport-level failure (timeout, reset connection). Retryable.
    #[error("connectivity failure: {0}")]
    Connectivity(String),

    /// The exchange understood the request and refused it.
    #[error("rejected by exchange (code {code}): {msg}")]
    Rejected { code: i64, msg: String },

    /// The exchange answered with something we could not interpret.
    #[error("invalid exchange response: {0}")]
    InvalidResponse(String),
}

impl ExchangeError {
    /// Map an exchange API error code onto the taxonomy.
    pub fn from_api_code(code: i64, msg: String) -> Self {
        if code == NO_OPEN_POSITION_CODE {
            ExchangeError::NoOpenPosition
        } else {
            ExchangeError::Rejected { code, msg }
        }
    }

    pub fn is_benign_race(&self) -> bool {
        matches!(self, ExchangeError::NoOpenPosition)
    }

    pub fn is_connectivity(&self) -> bool {
        matches!(self, ExchangeError::Connectivity(_))
    }
}

impl From<reqwest::Error> for ExchangeError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() {
            ExchangeError::Connectivity(err.to_string())
        } else {
            ExchangeError::InvalidResponse(err.to_string())
        }
    }
}

/// Operations the trading core needs from the venue
///
/// Take-profit and stop-loss submissions close the entire position when
/// triggered; submitting one with neither an open position nor an open
/// order present server-side yields `ExchangeError::NoOpenPosition`.
#[async_trait]
pub trait ExchangeApi: Send + Sync {
    async fn current_price(&self, symbol: &str) -> Result<f64, ExchangeError>;

    async fn historical_bars(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: usize,
    ) -> Result<Vec<Candle>, ExchangeError>;

    async fn account_balance(&self, asset: &str) -> Result<f64, ExchangeError>;

    /// `None` when the exchange reports no open position (absent entry or
    /// zero entry price).
    async fn position_info(&self, symbol: &str) -> Result<Option<PositionInfo>, ExchangeError>;

    /// Ids of all currently open orders for the symbol.
    async fn open_orders(&self, symbol: &str) -> Result<Vec<i64>, ExchangeError>;

    async fn order_status(&self, symbol: &str, order_id: i64)
        -> Result<OrderReport, ExchangeError>;

    async fn submit_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: f64,
    ) -> Result<OrderAck, ExchangeError>;

    async fn submit_take_profit_market(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: f64,
        stop_price: f64,
    ) -> Result<OrderAck, ExchangeError>;

    async fn submit_stop_market(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: f64,
        stop_price: f64,
    ) -> Result<OrderAck, ExchangeError>;

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), ExchangeError>;

    async fn set_margin_mode(&self, symbol: &str, mode: MarginMode) -> Result<(), ExchangeError>;

    async fn symbol_info(&self, symbol: &str) -> Result<SymbolInfo, ExchangeError>;
}
