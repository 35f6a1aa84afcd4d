//! Environment-driven configuration
//!
//! Everything is read once at startup from the process environment (a local
//! `.env` file is loaded first when present). Missing keys fall back to
//! sane defaults; credentials are only required for live trading.

use std::fmt::Display;
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use tokio::time::Duration;

use crate::trading::TraderSettings;

#[derive(Debug, Clone)]
pub struct BotConfig {
    pub symbols: Vec<String>,
    pub timeframe: String,
    pub margin_pct: f64,
    pub leverage: u32,
    pub trailing: bool,
    pub bar_window: usize,
    pub history: usize,
    pub loop_interval: Duration,
    pub api_key: Option<String>,
    pub api_secret: Option<String>,
    pub base_url: Option<String>,
}

fn var_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn parse_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid {name}={raw}: {e}")),
        Err(_) => Ok(default),
    }
}

impl BotConfig {
    pub fn from_env() -> Result<Self> {
        let symbols: Vec<String> = var_or("SYMBOLS", "BTCUSDT")
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
        if symbols.is_empty() {
            bail!("SYMBOLS must name at least one instrument");
        }

        let margin_pct: f64 = parse_or("MARGIN_PCT", 10.0)?;
        if !(0.0..=100.0).contains(&margin_pct) {
            bail!("MARGIN_PCT must be between 0 and 100, got {margin_pct}");
        }
        let leverage: u32 = parse_or("LEVERAGE", 5)?;
        if leverage == 0 {
            bail!("LEVERAGE must be at least 1");
        }

        Ok(Self {
            symbols,
            timeframe: var_or("TIMEFRAME", "1m"),
            margin_pct,
            leverage,
            trailing: parse_or("TRAILING", true)?,
            bar_window: parse_or("BAR_WINDOW", 100)?,
            history: parse_or("POSITION_HISTORY", 50)?,
            loop_interval: Duration::from_secs(parse_or("LOOP_INTERVAL_SECS", 5)?),
            api_key: std::env::var("BINANCE_API_KEY").ok(),
            api_secret: std::env::var("BINANCE_API_SECRET").ok(),
            base_url: std::env::var("BINANCE_BASE_URL").ok(),
        })
    }

    /// Live trading needs signed requests.
    pub fn credentials(&self) -> Result<(String, String)> {
        let key = self
            .api_key
            .clone()
            .context("BINANCE_API_KEY is required for live trading")?;
        let secret = self
            .api_secret
            .clone()
            .context("BINANCE_API_SECRET is required for live trading")?;
        Ok((key, secret))
    }

    pub fn trader_settings(&self, symbol: &str) -> TraderSettings {
        TraderSettings {
            symbol: symbol.to_string(),
            timeframe: self.timeframe.clone(),
            margin_pct: self.margin_pct,
            leverage: self.leverage,
            trailing: self.trailing,
            bar_window: self.bar_window,
            history: self.history,
            loop_interval: self.loop_interval,
            ..TraderSettings::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_var_or_prefers_environment() {
        std::env::set_var("TEST_VAR_OR_KEY", "from-env");
        assert_eq!(var_or("TEST_VAR_OR_KEY", "fallback"), "from-env");
        assert_eq!(var_or("TEST_VAR_OR_MISSING", "fallback"), "fallback");
    }

    #[test]
    fn test_parse_or_reads_typed_values() {
        std::env::set_var("TEST_PARSE_OR_LEVERAGE", "20");
        assert_eq!(parse_or("TEST_PARSE_OR_LEVERAGE", 5u32).unwrap(), 20);
        assert_eq!(parse_or("TEST_PARSE_OR_MISSING", 5u32).unwrap(), 5);
    }

    #[test]
    fn test_parse_or_rejects_garbage() {
        std::env::set_var("TEST_PARSE_OR_BAD", "not-a-number");
        assert!(parse_or("TEST_PARSE_OR_BAD", 5u32).is_err());
    }

    #[test]
    fn test_credentials_required_together() {
        let config = BotConfig {
            symbols: vec!["BTCUSDT".to_string()],
            timeframe: "1m".to_string(),
            margin_pct: 10.0,
            leverage: 5,
            trailing: true,
            bar_window: 100,
            history: 50,
            loop_interval: Duration::from_secs(5),
            api_key: Some("key".to_string()),
            api_secret: None,
            base_url: None,
        };
        assert!(config.credentials().is_err());
    }

    #[test]
    fn test_trader_settings_carry_config() {
        let config = BotConfig {
            symbols: vec!["ETHUSDT".to_string()],
            timeframe: "5m".to_string(),
            margin_pct: 25.0,
            leverage: 10,
            trailing: false,
            bar_window: 200,
            history: 30,
            loop_interval: Duration::from_secs(10),
            api_key: None,
            api_secret: None,
            base_url: None,
        };
        let settings = config.trader_settings("ETHUSDT");
        assert_eq!(settings.symbol, "ETHUSDT");
        assert_eq!(settings.timeframe, "5m");
        assert_eq!(settings.leverage, 10);
        assert!(!settings.trailing);
        assert_eq!(settings.loop_interval, Duration::from_secs(10));
    }
}
