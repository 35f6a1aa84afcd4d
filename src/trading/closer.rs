//! Closing engine: a supervised retry task that brackets an open position
//!
//! One task per position. It keeps attempting to place the take-profit and
//! stop-loss orders until both are accepted or the position is confirmed
//! gone, pulling a trigger the market has already crossed to just beyond the
//! live price so the close happens at once. All state changes flow back to
//! the owning trader over a channel; the task never mutates the position
//! itself.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Duration;

use crate::exchange::{ExchangeApi, ExchangeError};
use crate::models::{OrderSide, OrderStatus};
use crate::precision::truncate;
use crate::trading::position::Position;

/// Delay between failed attempts.
pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(2);

/// Distance, in percent of the live price, a breached trigger is pulled to
/// so the venue accepts it. Alternates with the wider step when the first
/// submission still fails.
const RETARGET_STEP_PCT: f64 = 0.1;
const RETARGET_MAX_PCT: f64 = 0.2;

/// State changes reported back to the owning trader
#[derive(Debug, Clone, PartialEq)]
pub enum CloserEvent {
    /// The bracket was stale and has been pulled in around the live price.
    Retargeted { take_profit: f64, stop_loss: f64 },
    TakeProfitSubmitted {
        order_id: i64,
        client_order_id: String,
        stop_price: f64,
    },
    StopLossSubmitted {
        order_id: i64,
        client_order_id: String,
        stop_price: f64,
    },
    /// One of the bot's own exit orders filled; the venue's report follows.
    ExitFilled {
        order_id: i64,
        price: f64,
        time: DateTime<Utc>,
    },
    /// The exchange had nothing left to close; the position is gone.
    ClosedExternally,
    /// Both legs accepted; the engine is done.
    BracketPlaced,
}

/// Immutable snapshot of everything the engine needs
#[derive(Debug, Clone)]
pub struct CloseRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub volume: f64,
    pub take_profit: f64,
    pub stop_loss: f64,
    pub price_precision: u32,
    pub tp_order_id: Option<i64>,
    pub sl_order_id: Option<i64>,
}

impl CloseRequest {
    pub fn for_position(symbol: &str, position: &Position) -> Self {
        Self {
            symbol: symbol.to_string(),
            side: position.side,
            volume: position.volume,
            take_profit: position.effective_take_profit(),
            stop_loss: position.effective_stop_loss(),
            price_precision: position.price_precision(),
            tp_order_id: position.tp_order_id,
            sl_order_id: position.sl_order_id,
        }
    }
}

/// Handle the trader keeps while the engine runs
pub struct CloserHandle {
    pub events: mpsc::UnboundedReceiver<CloserEvent>,
    task: JoinHandle<()>,
}

impl CloserHandle {
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the engine to terminate (used on trader stop).
    pub async fn wait(&mut self) {
        let _ = (&mut self.task).await;
    }

    pub fn abort(&self) {
        self.task.abort();
    }
}

/// Start the retry task for one position.
pub fn spawn(
    exchange: Arc<dyn ExchangeApi>,
    request: CloseRequest,
    backoff: Duration,
) -> CloserHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(async move {
        run(exchange, request, backoff, tx).await;
    });
    CloserHandle { events: rx, task }
}

async fn run(
    exchange: Arc<dyn ExchangeApi>,
    request: CloseRequest,
    backoff: Duration,
    tx: mpsc::UnboundedSender<CloserEvent>,
) {
    let mut take_profit = request.take_profit;
    let mut stop_loss = request.stop_loss;
    let mut tp_order_id = request.tp_order_id;
    let mut sl_order_id = request.sl_order_id;
    let mut nudge_pct = RETARGET_STEP_PCT;
    let exit_side = request.side.closing();

    loop {
        let price = match exchange.current_price(&request.symbol).await {
            Ok(price) => price,
            Err(err) => {
                if !err.is_connectivity() {
                    tracing::warn!(symbol = %request.symbol, error = %err, "price fetch failed in closing engine");
                }
                tokio::time::sleep(backoff).await;
                continue;
            }
        };

        // a trigger the market already crossed would be rejected or fill at
        // a worse level; collapse the bracket to just beyond the live price
        // so the close happens here, not a full offset further away
        if bracket_is_stale(request.side, price, take_profit, stop_loss) {
            let (tp, sl) = bracket_near(request.side, price, nudge_pct);
            take_profit = truncate(tp, request.price_precision);
            stop_loss = truncate(sl, request.price_precision);
            nudge_pct += RETARGET_STEP_PCT;
            if nudge_pct > RETARGET_MAX_PCT {
                nudge_pct = RETARGET_STEP_PCT;
            }
            tracing::info!(
                symbol = %request.symbol,
                take_profit,
                stop_loss,
                "pulled stale exit levels to the live price"
            );
            let _ = tx.send(CloserEvent::Retargeted {
                take_profit,
                stop_loss,
            });
        }

        if tp_order_id.is_none() {
            match exchange
                .submit_take_profit_market(&request.symbol, exit_side, request.volume, take_profit)
                .await
            {
                Ok(ack) => {
                    tp_order_id = Some(ack.order_id);
                    let _ = tx.send(CloserEvent::TakeProfitSubmitted {
                        order_id: ack.order_id,
                        client_order_id: ack.client_order_id,
                        stop_price: take_profit,
                    });
                }
                Err(err) => {
                    if err.is_benign_race() {
                        resolve_vanished_position(
                            exchange.as_ref(),
                            &request,
                            tp_order_id,
                            sl_order_id,
                            &tx,
                        )
                        .await;
                        return;
                    }
                    log_submit_retry(&request.symbol, "take-profit", &err);
                    tokio::time::sleep(backoff).await;
                    continue;
                }
            }
        }

        if sl_order_id.is_none() {
            match exchange
                .submit_stop_market(&request.symbol, exit_side, request.volume, stop_loss)
                .await
            {
                Ok(ack) => {
                    sl_order_id = Some(ack.order_id);
                    let _ = tx.send(CloserEvent::StopLossSubmitted {
                        order_id: ack.order_id,
                        client_order_id: ack.client_order_id,
                        stop_price: stop_loss,
                    });
                }
                Err(err) => {
                    if err.is_benign_race() {
                        resolve_vanished_position(
                            exchange.as_ref(),
                            &request,
                            tp_order_id,
                            sl_order_id,
                            &tx,
                        )
                        .await;
                        return;
                    }
                    log_submit_retry(&request.symbol, "stop-loss", &err);
                    tokio::time::sleep(backoff).await;
                    continue;
                }
            }
        }

        if tp_order_id.is_some() && sl_order_id.is_some() {
            tracing::info!(symbol = %request.symbol, "exit bracket placed");
            let _ = tx.send(CloserEvent::BracketPlaced);
            return;
        }
    }
}

/// The venue says there is nothing left to close. If one of the bot's own
/// exit orders filled in the meantime the close is ours: report the fill so
/// the position books a real exit price instead of an external close.
async fn resolve_vanished_position(
    exchange: &dyn ExchangeApi,
    request: &CloseRequest,
    tp_order_id: Option<i64>,
    sl_order_id: Option<i64>,
    tx: &mpsc::UnboundedSender<CloserEvent>,
) {
    for id in [tp_order_id, sl_order_id].into_iter().flatten() {
        match exchange.order_status(&request.symbol, id).await {
            Ok(report) if report.status == OrderStatus::Filled => {
                tracing::info!(
                    symbol = %request.symbol,
                    order_id = id,
                    price = report.avg_price,
                    "exit order filled while the bracket was being retried"
                );
                let _ = tx.send(CloserEvent::ExitFilled {
                    order_id: id,
                    price: report.avg_price,
                    time: report.update_time,
                });
                return;
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(symbol = %request.symbol, order_id = id, error = %err, "order lookup failed while resolving a vanished position");
            }
        }
    }
    tracing::info!(symbol = %request.symbol, "position already closed externally");
    let _ = tx.send(CloserEvent::ClosedExternally);
}

fn log_submit_retry(symbol: &str, leg: &str, err: &ExchangeError) {
    if err.is_connectivity() {
        tracing::debug!(symbol, leg, error = %err, "transient failure, retrying");
    } else {
        tracing::warn!(symbol, leg, error = %err, "unexpected rejection, retrying");
    }
}

fn bracket_is_stale(side: OrderSide, price: f64, take_profit: f64, stop_loss: f64) -> bool {
    match side {
        OrderSide::Long => price >= take_profit || price <= stop_loss,
        OrderSide::Short => price <= take_profit || price >= stop_loss,
    }
}

/// Tight bracket at `pct` percent of the live price on each side.
fn bracket_near(side: OrderSide, price: f64, pct: f64) -> (f64, f64) {
    let step = price * pct / 100.0;
    match side {
        OrderSide::Long => (price + step, price - step),
        OrderSide::Short => (price - step, price + step),
    }
}
