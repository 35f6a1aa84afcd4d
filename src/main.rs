use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use trendbot::config::BotConfig;
use trendbot::exchange::{BinanceFutures, ExchangeApi, PaperExchange};
use trendbot::indicators::EmaTrendPipeline;
use trendbot::models::SymbolInfo;
use trendbot::notify::LogNotifier;
use trendbot::trading::Trader;

#[derive(Parser)]
#[command(name = "trendbot", about = "Directional futures trading bot")]
struct Cli {
    /// Trade against an in-memory simulated venue instead of the exchange.
    #[arg(long)]
    paper: bool,

    /// Seed for the simulated price feed.
    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Comma-separated instruments, overriding the SYMBOLS variable.
    #[arg(long)]
    symbols: Option<String>,
}

fn setup_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("trendbot=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn paper_info(symbol: &str) -> SymbolInfo {
    SymbolInfo {
        symbol: symbol.to_string(),
        base_asset: symbol.trim_end_matches("USDT").to_string(),
        quote_asset: "USDT".to_string(),
        margin_asset: "USDT".to_string(),
        price_precision: 2,
        quantity_precision: 3,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    setup_logging();

    let cli = Cli::parse();
    let mut config = BotConfig::from_env()?;
    if let Some(symbols) = cli.symbols {
        config.symbols = symbols
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
    }

    // live trading shares one signed client; paper trading gets an isolated
    // venue per instrument
    let live: Option<Arc<dyn ExchangeApi>> = if cli.paper {
        None
    } else {
        let (key, secret) = config.credentials()?;
        Some(match config.base_url.clone() {
            Some(url) => Arc::new(BinanceFutures::with_base_url(key, secret, url)),
            None => Arc::new(BinanceFutures::new(key, secret)),
        })
    };

    let mut traders = Vec::new();
    for symbol in &config.symbols {
        let exchange: Arc<dyn ExchangeApi> = match &live {
            Some(exchange) => Arc::clone(exchange),
            None => Arc::new(PaperExchange::with_synthetic_feed(
                paper_info(symbol),
                10_000.0,
                100.0,
                cli.seed,
            )),
        };
        let trader = Arc::new(Trader::new(
            config.trader_settings(symbol),
            exchange,
            Arc::new(EmaTrendPipeline::default()),
            Arc::new(LogNotifier),
        ));
        trader.start();
        tracing::info!(symbol, paper = cli.paper, "trader started");
        traders.push(trader);
    }

    let mut status = tokio::time::interval(std::time::Duration::from_secs(30));
    status.tick().await; // first tick is immediate
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = status.tick() => {
                for trader in &traders {
                    let snap = trader.snapshot();
                    tracing::info!(
                        symbol = %snap.symbol,
                        status = %snap.status,
                        balance = snap.balance,
                        last_price = snap.last_price,
                        trades = snap.total_trades,
                        longs = snap.total_longs,
                        shorts = snap.total_shorts,
                        avg_trend_strength = snap.avg_trend_strength,
                        "trader status"
                    );
                }
            }
        }
    }

    tracing::info!("shutdown requested");
    for trader in &traders {
        trader.stop().await;
        let snap = trader.snapshot();
        tracing::info!(
            symbol = %snap.symbol,
            status = %snap.status,
            trades = snap.total_trades,
            balance = snap.balance,
            "trader shut down"
        );
    }
    Ok(())
}
