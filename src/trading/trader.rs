//! Trader controller: one task per instrument
//!
//! Each cycle drains closing-engine progress, reconciles local intent
//! against the exchange, evaluates the latest bar for an entry or a trailing
//! retarget, and acts. All position state lives behind one mutex and is only
//! written here; the closing engine reports back over a channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::Duration;

use crate::exchange::{ExchangeApi, ExchangeError};
use crate::models::{MarginMode, OrderSide, SymbolInfo, TraderStatus};
use crate::notify::Notifier;
use crate::signal::{EntrySizing, PositionDraft, SignalEngine, TrendPipeline};
use crate::trading::closer::{self, CloseRequest, CloserEvent, CloserHandle};
use crate::trading::position::{Position, PositionBook, PositionState};
use crate::trading::reconcile::{reconcile, Reconciliation};

#[derive(Debug, Clone)]
pub struct TraderSettings {
    pub symbol: String,
    pub timeframe: String,
    /// Percentage of the margin-asset balance committed per entry.
    pub margin_pct: f64,
    pub leverage: u32,
    /// Ratchet the bracket instead of closing when a take-profit trigger is
    /// crossed while the trend still points the same way.
    pub trailing: bool,
    /// Bars fetched per cycle for the indicator pipeline.
    pub bar_window: usize,
    /// Closed positions kept for status display.
    pub history: usize,
    pub loop_interval: Duration,
    pub retry_backoff: Duration,
    /// Cycles between refreshes of the cached symbol filters.
    pub symbol_refresh_cycles: u64,
}

impl Default for TraderSettings {
    fn default() -> Self {
        Self {
            symbol: "BTCUSDT".to_string(),
            timeframe: "1m".to_string(),
            margin_pct: 10.0,
            leverage: 5,
            trailing: true,
            bar_window: 100,
            history: 50,
            loop_interval: Duration::from_secs(5),
            retry_backoff: closer::DEFAULT_BACKOFF,
            symbol_refresh_cycles: 360,
        }
    }
}

/// Point-in-time view of a trader for status display
#[derive(Debug, Clone)]
pub struct TraderSnapshot {
    pub symbol: String,
    pub status: TraderStatus,
    pub balance: f64,
    pub last_price: f64,
    pub cycles: u64,
    pub total_trades: u64,
    pub total_longs: u64,
    pub total_shorts: u64,
    pub first_trade_time: Option<DateTime<Utc>>,
    pub last_trade_time: Option<DateTime<Utc>>,
    pub avg_trend_strength: f64,
    pub open_position: Option<Position>,
    pub last_closed: Option<Position>,
}

struct TraderState {
    status: TraderStatus,
    symbol_info: Option<SymbolInfo>,
    // adjustable at runtime through update()
    margin_pct: f64,
    leverage: u32,
    balance: f64,
    last_price: f64,
    cycles: u64,
    total_trades: u64,
    total_longs: u64,
    total_shorts: u64,
    first_trade_time: Option<DateTime<Utc>>,
    last_trade_time: Option<DateTime<Utc>>,
    avg_trend_strength: f64,
    book: PositionBook,
}

/// What the decision step concluded for this cycle
enum Action {
    Hold,
    Close(CloseRequest),
    Enter(PositionDraft),
}

pub struct Trader {
    settings: TraderSettings,
    exchange: Arc<dyn ExchangeApi>,
    pipeline: Arc<dyn TrendPipeline>,
    signals: SignalEngine,
    notifier: Arc<dyn Notifier>,
    state: Mutex<TraderState>,
    closer: tokio::sync::Mutex<Option<CloserHandle>>,
    alive: AtomicBool,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Trader {
    pub fn new(
        settings: TraderSettings,
        exchange: Arc<dyn ExchangeApi>,
        pipeline: Arc<dyn TrendPipeline>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let history = settings.history;
        let margin_pct = settings.margin_pct;
        let leverage = settings.leverage;
        Self {
            settings,
            exchange,
            pipeline,
            signals: SignalEngine::default(),
            notifier,
            state: Mutex::new(TraderState {
                status: TraderStatus::Waiting,
                symbol_info: None,
                margin_pct,
                leverage,
                balance: 0.0,
                last_price: 0.0,
                cycles: 0,
                total_trades: 0,
                total_longs: 0,
                total_shorts: 0,
                first_trade_time: None,
                last_trade_time: None,
                avg_trend_strength: 0.0,
                book: PositionBook::new(history),
            }),
            closer: tokio::sync::Mutex::new(None),
            alive: AtomicBool::new(false),
            loop_handle: Mutex::new(None),
        }
    }

    pub fn symbol(&self) -> &str {
        &self.settings.symbol
    }

    pub fn snapshot(&self) -> TraderSnapshot {
        let state = self.state.lock().unwrap();
        TraderSnapshot {
            symbol: self.settings.symbol.clone(),
            status: state.status.clone(),
            balance: state.balance,
            last_price: state.last_price,
            cycles: state.cycles,
            total_trades: state.total_trades,
            total_longs: state.total_longs,
            total_shorts: state.total_shorts,
            first_trade_time: state.first_trade_time,
            last_trade_time: state.last_trade_time,
            avg_trend_strength: state.avg_trend_strength,
            open_position: state.book.open().cloned(),
            last_closed: state.book.last_closed().cloned(),
        }
    }

    /// Spawn the control loop.
    pub fn start(self: &Arc<Self>) {
        self.alive.store(true, Ordering::SeqCst);
        let trader = Arc::clone(self);
        let handle = tokio::spawn(async move {
            trader.run().await;
        });
        *self.loop_handle.lock().unwrap() = Some(handle);
    }

    /// Change sizing at runtime; takes effect from the next cycle. The new
    /// leverage is pushed to the venue, tolerating rejection (sizing
    /// degrades, safety does not).
    pub async fn update(&self, margin_pct: f64, leverage: u32) {
        {
            let mut state = self.state.lock().unwrap();
            state.margin_pct = margin_pct;
            state.leverage = leverage;
        }
        if let Err(err) = self.exchange.set_leverage(&self.settings.symbol, leverage).await {
            tracing::warn!(symbol = %self.settings.symbol, error = %err, "leverage update not applied on the venue");
        }
        match self
            .exchange
            .set_margin_mode(&self.settings.symbol, MarginMode::Isolated)
            .await
        {
            Ok(()) => {}
            Err(ExchangeError::Rejected { code: -4046, .. }) => {}
            Err(err) => {
                tracing::warn!(symbol = %self.settings.symbol, error = %err, "margin mode update not applied on the venue");
            }
        }
        tracing::info!(symbol = %self.settings.symbol, margin_pct, leverage, "trader sizing updated");
    }

    /// Stop the loop and bracket any position still working.
    pub async fn stop(&self) {
        self.alive.store(false, Ordering::SeqCst);

        let handle = self.loop_handle.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        if let Some(mut closing) = self.closer.lock().await.take() {
            closing.wait().await;
            self.apply_closer_events(&mut closing);
        }

        // a filled position with no exit orders resting would be left
        // unprotected; bracket it before going quiet
        let request = {
            let state = self.state.lock().unwrap();
            state
                .book
                .open()
                .filter(|p| p.state() == PositionState::Open)
                .map(|p| CloseRequest::for_position(&self.settings.symbol, p))
        };
        if let Some(request) = request {
            let mut closing =
                closer::spawn(self.exchange.clone(), request, self.settings.retry_backoff);
            closing.wait().await;
            self.apply_closer_events(&mut closing);
        }

        let mut state = self.state.lock().unwrap();
        if !matches!(state.status, TraderStatus::Failed(_)) {
            state.status = TraderStatus::Stopped;
        }
        tracing::info!(symbol = %self.settings.symbol, "trader stopped");
    }

    async fn run(self: Arc<Self>) {
        loop {
            if !self.alive.load(Ordering::SeqCst) {
                return;
            }
            match self.setup().await {
                Ok(()) => break,
                Err(err) if err.is_connectivity() => {
                    tracing::warn!(symbol = %self.settings.symbol, error = %err, "setup failed, retrying");
                    tokio::time::sleep(self.settings.retry_backoff).await;
                }
                Err(err) => {
                    tracing::error!(symbol = %self.settings.symbol, error = %err, "setup failed");
                    self.state.lock().unwrap().status = TraderStatus::Failed(err.to_string());
                    self.notifier.trader_failed(&self.settings.symbol, &err.to_string());
                    return;
                }
            }
        }

        while self.alive.load(Ordering::SeqCst) {
            match self.cycle().await {
                Ok(()) => {}
                Err(err) if err.is_benign_race() => {}
                Err(err) if err.is_connectivity() => {
                    tracing::warn!(symbol = %self.settings.symbol, error = %err, "transient failure, will retry next cycle");
                }
                Err(err) => {
                    self.halt(err.to_string()).await;
                    return;
                }
            }
            tokio::time::sleep(self.settings.loop_interval).await;
        }
    }

    /// Venue-side preparation: cache symbol filters, force isolated margin
    /// and the configured leverage.
    async fn setup(&self) -> Result<(), ExchangeError> {
        let symbol = &self.settings.symbol;
        let info = self.exchange.symbol_info(symbol).await?;
        match self.exchange.set_margin_mode(symbol, MarginMode::Isolated).await {
            Ok(()) => {}
            // -4046: "No need to change margin type."
            Err(ExchangeError::Rejected { code: -4046, .. }) => {}
            Err(err) => return Err(err),
        }
        self.exchange.set_leverage(symbol, self.settings.leverage).await?;
        tracing::info!(symbol, leverage = self.settings.leverage, "trader ready");
        self.state.lock().unwrap().symbol_info = Some(info);
        Ok(())
    }

    /// Unrecoverable failure: bracket whatever is open, then stop for good.
    async fn halt(&self, reason: String) {
        tracing::error!(symbol = %self.settings.symbol, %reason, "unrecoverable failure, halting trader");
        {
            let mut state = self.state.lock().unwrap();
            state.status = TraderStatus::Failed(reason.clone());
        }
        self.notifier.trader_failed(&self.settings.symbol, &reason);

        if let Some(mut closing) = self.closer.lock().await.take() {
            closing.wait().await;
            self.apply_closer_events(&mut closing);
        }
        let request = {
            let state = self.state.lock().unwrap();
            state
                .book
                .open()
                .filter(|p| p.state() == PositionState::Open)
                .map(|p| CloseRequest::for_position(&self.settings.symbol, p))
        };
        if let Some(request) = request {
            let mut closing =
                closer::spawn(self.exchange.clone(), request, self.settings.retry_backoff);
            closing.wait().await;
            self.apply_closer_events(&mut closing);
        }
        self.alive.store(false, Ordering::SeqCst);
    }

    /// Fold the closing engine's progress into the position. Returns true
    /// once a terminal event arrived.
    fn apply_closer_events(&self, closing: &mut CloserHandle) -> bool {
        let mut done = false;
        let mut state = self.state.lock().unwrap();
        while let Ok(event) = closing.events.try_recv() {
            let position = match state.book.open_mut() {
                Some(p) => p,
                None => break,
            };
            match event {
                CloserEvent::Retargeted {
                    take_profit,
                    stop_loss,
                } => {
                    position.take_profit_override = Some(take_profit);
                    position.stop_loss_override = Some(stop_loss);
                }
                CloserEvent::TakeProfitSubmitted {
                    order_id,
                    client_order_id,
                    stop_price,
                } => {
                    position.tp_order_id = Some(order_id);
                    position.tp_client_order_id = Some(client_order_id);
                    position.take_profit = stop_price;
                    position.take_profit_override = None;
                }
                CloserEvent::StopLossSubmitted {
                    order_id,
                    client_order_id,
                    stop_price,
                } => {
                    position.sl_order_id = Some(order_id);
                    position.sl_client_order_id = Some(client_order_id);
                    position.stop_loss = stop_price;
                    position.stop_loss_override = None;
                }
                CloserEvent::ExitFilled { price, time, .. } => {
                    position.record_exit(price, time);
                    done = true;
                }
                CloserEvent::ClosedExternally => {
                    position.record_external_close(Utc::now());
                    done = true;
                }
                CloserEvent::BracketPlaced => {
                    position.take_profit_override = None;
                    position.stop_loss_override = None;
                    done = true;
                }
            }
        }
        done
    }

    async fn cycle(&self) -> Result<(), ExchangeError> {
        // closing-engine progress first, so reconciliation sees the
        // freshest order ids
        {
            let mut slot = self.closer.lock().await;
            if let Some(closing) = slot.as_mut() {
                let done = self.apply_closer_events(closing);
                if done || closing.is_finished() {
                    *slot = None;
                }
            }
        }

        let symbol = self.settings.symbol.clone();
        let (have_info, cycles) = {
            let state = self.state.lock().unwrap();
            (state.symbol_info.is_some(), state.cycles)
        };
        if !have_info {
            self.setup().await?;
        } else if cycles != 0 && cycles % self.settings.symbol_refresh_cycles.max(1) == 0 {
            // the venue occasionally changes an instrument's declared
            // precisions; pick that up without restarting the trader
            let info = self.exchange.symbol_info(&symbol).await?;
            self.state.lock().unwrap().symbol_info = Some(info);
        }
        let (margin_asset, quantity_precision, price_precision, margin_pct, leverage) = {
            let state = self.state.lock().unwrap();
            match state.symbol_info.as_ref() {
                Some(info) => (
                    info.margin_asset.clone(),
                    info.quantity_precision,
                    info.price_precision,
                    state.margin_pct,
                    state.leverage,
                ),
                None => {
                    return Err(ExchangeError::InvalidResponse(
                        "symbol filters not loaded".to_string(),
                    ))
                }
            }
        };

        let price = self.exchange.current_price(&symbol).await?;
        let balance = self.exchange.account_balance(&margin_asset).await?;

        let bars = self
            .exchange
            .historical_bars(&symbol, &self.settings.timeframe, self.settings.bar_window)
            .await?;
        let frames = match self.pipeline.analyze(&bars) {
            Ok(frames) => frames,
            Err(err) => {
                // not enough history yet; skip the cycle rather than halt
                tracing::warn!(symbol, error = %err, "indicator pipeline failed, skipping cycle");
                let mut state = self.state.lock().unwrap();
                state.cycles += 1;
                state.last_price = price;
                state.balance = balance;
                return Ok(());
            }
        };
        let avg_trend_strength = SignalEngine::average_trend_strength(&frames);
        let candidate = frames.last().and_then(|frame| {
            self.signals.evaluate(
                frame,
                &EntrySizing {
                    margin_pct,
                    equity: balance,
                    leverage,
                    current_price: price,
                    quantity_precision,
                },
            )
        });

        // reconcile against the exchange on a detached copy; the book is
        // only touched under the lock below
        let mut working = {
            let mut state = self.state.lock().unwrap();
            state.book.open_mut().map(|p| p.clone())
        };
        let mut outcome = None;
        if let Some(position) = working.as_mut() {
            outcome = Some(reconcile(self.exchange.as_ref(), &symbol, position).await?);
            if position.entry_filled && !position.closed {
                if let Some(info) = self.exchange.position_info(&symbol).await? {
                    position.sync_exchange_view(&info);
                }
            }
        }

        let (action, closed_now) = {
            let mut state = self.state.lock().unwrap();
            state.cycles += 1;
            state.last_price = price;
            state.balance = balance;
            state.avg_trend_strength = avg_trend_strength;

            if let Some(position) = working.take() {
                if let Some(slot) = state.book.open_mut() {
                    *slot = position;
                }
            }
            if matches!(outcome, Some(Reconciliation::EntryExpired)) {
                tracing::info!(symbol, "entry order expired before filling");
                state.book.discard_last();
            }
            // a trade only counts once its entry order actually filled; an
            // expired entry leaves no trace in the counters
            if matches!(outcome, Some(Reconciliation::EntryFilled)) {
                if let Some((side, time)) = state
                    .book
                    .open()
                    .map(|p| (p.side, p.entry_time.unwrap_or_else(Utc::now)))
                {
                    state.total_trades += 1;
                    match side {
                        OrderSide::Long => state.total_longs += 1,
                        OrderSide::Short => state.total_shorts += 1,
                    }
                    if state.first_trade_time.is_none() {
                        state.first_trade_time = Some(time);
                    }
                    state.last_trade_time = Some(time);
                }
            }

            let closed_now = matches!(outcome, Some(Reconciliation::ExitFilled { .. }))
                .then(|| state.book.last_closed().cloned())
                .flatten();

            let action = decide(
                &state.book,
                outcome,
                price,
                self.settings.trailing,
                candidate.as_ref(),
                &symbol,
            );
            let action = match action {
                RawDecision::Ratchet => {
                    if let (Some(position), Some(draft)) =
                        (state.book.open_mut(), candidate.as_ref())
                    {
                        position.ratchet_to(draft);
                        tracing::info!(
                            symbol,
                            take_profit = position.take_profit,
                            stop_loss = position.stop_loss,
                            "trailed bracket to fresh candidate"
                        );
                    }
                    Action::Hold
                }
                RawDecision::Close(request) => Action::Close(request),
                RawDecision::Enter => match candidate.clone() {
                    Some(draft) => Action::Enter(draft),
                    None => Action::Hold,
                },
                RawDecision::Hold => Action::Hold,
            };

            if !matches!(state.status, TraderStatus::Failed(_) | TraderStatus::Stopped) {
                state.status = if state.book.open().is_some() {
                    TraderStatus::Trading
                } else {
                    TraderStatus::Waiting
                };
            }
            (action, closed_now)
        };

        if let Some(position) = closed_now {
            self.notifier.position_closed(&symbol, &position);
        }

        match action {
            Action::Hold => {}
            Action::Close(request) => {
                let mut slot = self.closer.lock().await;
                if slot.is_none() {
                    tracing::info!(
                        symbol,
                        take_profit = request.take_profit,
                        stop_loss = request.stop_loss,
                        "exit trigger crossed, starting closing engine"
                    );
                    *slot = Some(closer::spawn(
                        self.exchange.clone(),
                        request,
                        self.settings.retry_backoff,
                    ));
                }
            }
            Action::Enter(draft) => {
                let ack = self
                    .exchange
                    .submit_market_order(&symbol, draft.side, draft.volume)
                    .await?;
                tracing::info!(
                    symbol,
                    side = ?draft.side,
                    volume = draft.volume,
                    order_id = ack.order_id,
                    "entry order submitted"
                );
                let mut position = Position::from_draft(&draft, price_precision);
                position.entry_order_id = Some(ack.order_id);
                position.entry_client_order_id = Some(ack.client_order_id);

                let mut state = self.state.lock().unwrap();
                state.status = TraderStatus::Trading;
                state.book.push(position);
                if let Some(position) = state.book.open() {
                    self.notifier.position_opened(&symbol, position);
                }
            }
        }
        Ok(())
    }
}

enum RawDecision {
    Hold,
    Ratchet,
    Close(CloseRequest),
    Enter,
}

fn decide(
    book: &PositionBook,
    outcome: Option<Reconciliation>,
    price: f64,
    trailing: bool,
    candidate: Option<&PositionDraft>,
    symbol: &str,
) -> RawDecision {
    let position = match book.open() {
        Some(p) => p,
        None => return RawDecision::Enter,
    };
    if position.state() != PositionState::Open {
        // entry still resting, or exit orders already placed
        return RawDecision::Hold;
    }
    // exit orders vanished without filling; re-bracket immediately
    if matches!(outcome, Some(Reconciliation::ExitOrdersLost)) {
        return RawDecision::Close(CloseRequest::for_position(symbol, position));
    }
    if position.hit_stop_loss(price) {
        return RawDecision::Close(CloseRequest::for_position(symbol, position));
    }
    if position.hit_take_profit(price) {
        let same_side = candidate.map(|c| c.side == position.side).unwrap_or(false);
        if trailing && same_side {
            return RawDecision::Ratchet;
        }
        if candidate.is_some() || !trailing {
            return RawDecision::Close(CloseRequest::for_position(symbol, position));
        }
        // trailing with no signal either way: an indecisive market, let the
        // position keep running
        return RawDecision::Hold;
    }
    RawDecision::Hold
}
