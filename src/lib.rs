//! Directional futures trading engine
//!
//! One trader task per instrument follows a trend signal: it opens a market
//! position when the trend is strong enough, brackets it with virtual
//! take-profit/stop-loss levels, and hands the actual close to a supervised
//! retry engine once a trigger is crossed. Exchange truth wins everywhere:
//! fills, expiries, and externally closed positions are reconciled from the
//! venue's order reports, never assumed.

pub mod config;
pub mod exchange;
pub mod indicators;
pub mod models;
pub mod notify;
pub mod precision;
pub mod signal;
pub mod trading;

pub use config::BotConfig;
pub use exchange::{BinanceFutures, ExchangeApi, ExchangeError, PaperExchange};
pub use indicators::EmaTrendPipeline;
pub use notify::{LogNotifier, Notifier};
pub use signal::{SignalEngine, TrendPipeline};
pub use trading::{Trader, TraderSettings};
