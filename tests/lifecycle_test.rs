//! End-to-end lifecycle runs against the in-memory venue.

use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::time::Duration;

use trendbot::exchange::{ExchangeApi, PaperExchange};
use trendbot::indicators::EmaTrendPipeline;
use trendbot::models::{Candle, OrderSide, SymbolInfo, TraderStatus};
use trendbot::notify::LogNotifier;
use trendbot::signal::{SignalFrame, TrendDirection, TrendPipeline};
use trendbot::trading::{PositionState, Trader, TraderSettings};

fn btc_info() -> SymbolInfo {
    SymbolInfo {
        symbol: "BTCUSDT".to_string(),
        base_asset: "BTC".to_string(),
        quote_asset: "USDT".to_string(),
        margin_asset: "USDT".to_string(),
        price_precision: 2,
        quantity_precision: 3,
    }
}

/// Pipeline whose single output frame the test flips at will.
struct ScriptedPipeline {
    frame: Mutex<SignalFrame>,
}

impl ScriptedPipeline {
    fn new(frame: SignalFrame) -> Self {
        Self {
            frame: Mutex::new(frame),
        }
    }

    fn set(&self, frame: SignalFrame) {
        *self.frame.lock().unwrap() = frame;
    }
}

impl TrendPipeline for ScriptedPipeline {
    fn analyze(&self, _candles: &[Candle]) -> anyhow::Result<Vec<SignalFrame>> {
        Ok(vec![self.frame.lock().unwrap().clone()])
    }
}

fn frame(close: f64, strength: f64, direction: TrendDirection) -> SignalFrame {
    SignalFrame {
        time: Utc::now(),
        close,
        trend_strength: strength,
        direction,
        volatility: 2.0,
    }
}

fn fast_settings() -> TraderSettings {
    TraderSettings {
        symbol: "BTCUSDT".to_string(),
        timeframe: "1m".to_string(),
        margin_pct: 10.0,
        leverage: 5,
        trailing: true,
        bar_window: 100,
        history: 50,
        loop_interval: Duration::from_millis(10),
        retry_backoff: Duration::from_millis(10),
        symbol_refresh_cycles: 1_000,
    }
}

fn spawn_trader(paper: &Arc<PaperExchange>, pipeline: &Arc<ScriptedPipeline>) -> Arc<Trader> {
    let trader = Arc::new(Trader::new(
        fast_settings(),
        paper.clone() as Arc<dyn ExchangeApi>,
        pipeline.clone() as Arc<dyn TrendPipeline>,
        Arc::new(LogNotifier),
    ));
    trader.start();
    trader
}

async fn wait_until(mut check: impl FnMut() -> bool, timeout_ms: u64) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_long_entry_to_stop_loss_exit() {
    let paper = Arc::new(PaperExchange::new(btc_info(), 1000.0, 100.0));
    let pipeline = Arc::new(ScriptedPipeline::new(frame(100.0, 40.0, TrendDirection::Up)));
    let trader = spawn_trader(&paper, &pipeline);

    // strong uptrend: the bot goes long and the instant fill is reconciled
    assert!(
        wait_until(
            || trader
                .snapshot()
                .open_position
                .map(|p| p.entry_filled)
                .unwrap_or(false),
            2000
        )
        .await
    );
    let position = trader.snapshot().open_position.unwrap();
    assert_eq!(position.side, OrderSide::Long);
    assert_eq!(position.entry_price, 100.0);
    assert_eq!(position.volume, 5.0);
    // bracket at 1.1 * volatility around the fill
    assert_eq!(position.take_profit, 102.2);
    assert_eq!(position.stop_loss, 97.8);

    // prices inside the bracket leave the position alone
    paper.tick(99.0);
    tokio::time::sleep(Duration::from_millis(50)).await;
    paper.tick(101.0);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        trader.snapshot().open_position.unwrap().state(),
        PositionState::Open
    );
    assert!(paper.open_order_ids().is_empty());

    // trend dies and the price drops through the stop; the closing engine
    // pulls the breached triggers to just beyond the live price and rests
    // both legs there
    pipeline.set(frame(97.0, 5.0, TrendDirection::Flat));
    paper.tick(97.0);
    assert!(wait_until(|| paper.open_order_ids().len() == 2, 2000).await);

    // through the pulled-in stop: the venue fills it and cancels the sibling
    paper.tick(94.0);
    assert!(
        wait_until(
            || trader.snapshot().last_closed.map(|p| p.closed).unwrap_or(false),
            2000
        )
        .await
    );

    let snap = trader.snapshot();
    assert!(snap.open_position.is_none());
    assert_eq!(snap.status, TraderStatus::Waiting);
    assert_eq!(snap.total_trades, 1);
    assert_eq!(snap.total_longs, 1);

    let closed = snap.last_closed.unwrap();
    // the stop was pulled to 0.1% under the live price (97 * 0.999), so the
    // realized loss stays close to the recorded bracket
    assert_eq!(closed.exit_price, Some(96.9));
    // (96.9 - 100) * 5
    assert!((closed.profit.unwrap() + 15.5).abs() < 1e-9);
    assert!(paper.open_order_ids().is_empty());

    trader.stop().await;
    assert_eq!(trader.snapshot().status, TraderStatus::Stopped);
}

#[tokio::test]
async fn test_externally_closed_position_is_absorbed() {
    let paper = Arc::new(PaperExchange::new(btc_info(), 1000.0, 100.0));
    let pipeline = Arc::new(ScriptedPipeline::new(frame(100.0, 40.0, TrendDirection::Up)));
    let trader = spawn_trader(&paper, &pipeline);

    assert!(
        wait_until(
            || trader
                .snapshot()
                .open_position
                .map(|p| p.entry_filled)
                .unwrap_or(false),
            2000
        )
        .await
    );

    // someone flattens the account by hand; the next close attempt hits
    // the venue's "nothing to attach to" rejection and stands down
    paper.close_position_externally();
    pipeline.set(frame(97.0, 5.0, TrendDirection::Flat));
    paper.tick(97.0);

    assert!(
        wait_until(
            || trader.snapshot().last_closed.map(|p| p.closed).unwrap_or(false),
            2000
        )
        .await
    );

    let closed = trader.snapshot().last_closed.unwrap();
    // absorbed without inventing an exit price or profit
    assert_eq!(closed.exit_price, None);
    assert_eq!(closed.profit, None);
    assert!(paper.open_order_ids().is_empty());

    trader.stop().await;
}

#[tokio::test]
async fn test_trailing_ratchet_keeps_the_position_running() {
    let paper = Arc::new(PaperExchange::new(btc_info(), 1000.0, 100.0));
    let pipeline = Arc::new(ScriptedPipeline::new(frame(100.0, 40.0, TrendDirection::Up)));
    let trader = spawn_trader(&paper, &pipeline);

    assert!(
        wait_until(
            || trader
                .snapshot()
                .open_position
                .map(|p| p.entry_filled)
                .unwrap_or(false),
            2000
        )
        .await
    );

    // take-profit crossed while the trend still points up: trail, not close
    pipeline.set(frame(103.0, 40.0, TrendDirection::Up));
    paper.tick(103.0);
    assert!(
        wait_until(
            || trader
                .snapshot()
                .open_position
                .map(|p| p.take_profit == 105.2)
                .unwrap_or(false),
            2000
        )
        .await
    );

    let position = trader.snapshot().open_position.unwrap();
    assert_eq!(position.stop_loss, 100.8);
    assert!(position.tp_order_id.is_none());
    assert!(paper.open_order_ids().is_empty());

    // stopping a trader with an unprotected open position brackets it
    trader.stop().await;
    assert_eq!(paper.open_order_ids().len(), 2);
    assert_eq!(trader.snapshot().status, TraderStatus::Stopped);
}

#[tokio::test]
async fn test_synthetic_feed_runs_the_real_pipeline() {
    let paper = Arc::new(PaperExchange::with_synthetic_feed(btc_info(), 10_000.0, 100.0, 7));
    let trader = Arc::new(Trader::new(
        fast_settings(),
        paper.clone() as Arc<dyn ExchangeApi>,
        Arc::new(EmaTrendPipeline::default()),
        Arc::new(LogNotifier),
    ));
    trader.start();

    assert!(wait_until(|| trader.snapshot().cycles >= 5, 3000).await);
    trader.stop().await;

    let snap = trader.snapshot();
    assert!(matches!(snap.status, TraderStatus::Stopped));
    assert!(snap.last_price > 0.0);
    assert!(snap.balance > 0.0);
}
