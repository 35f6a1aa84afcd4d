use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{Duration, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use uuid::Uuid;

use super::{ExchangeApi, ExchangeError};
use crate::models::{
    Candle, MarginMode, OrderAck, OrderReport, OrderSide, OrderStatus, PositionInfo, SymbolInfo,
};

/// Scripted failure injected into the next conditional-order submission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptedFailure {
    BenignRace,
    Connectivity,
    Rejected,
}

impl ScriptedFailure {
    fn into_error(self) -> ExchangeError {
        match self {
            ScriptedFailure::BenignRace => ExchangeError::NoOpenPosition,
            ScriptedFailure::Connectivity => {
                ExchangeError::Connectivity("connection reset by peer".to_string())
            }
            ScriptedFailure::Rejected => ExchangeError::Rejected {
                code: -1102,
                msg: "Mandatory parameter was not sent".to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PaperOrderKind {
    Market,
    TakeProfit,
    StopLoss,
}

#[derive(Debug, Clone)]
struct PaperOrder {
    id: i64,
    client_order_id: String,
    kind: PaperOrderKind,
    quantity: f64,
    stop_price: f64,
    status: OrderStatus,
    avg_price: f64,
    update_time: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Copy)]
struct PaperPosition {
    /// Signed base-asset amount: positive long, negative short.
    amount: f64,
    entry_price: f64,
}

struct Inner {
    price: f64,
    bars: Vec<Candle>,
    balance: f64,
    next_order_id: i64,
    orders: HashMap<i64, PaperOrder>,
    open: Vec<i64>,
    position: Option<PaperPosition>,
    hold_entries: bool,
    exit_failures: Vec<ScriptedFailure>,
    leverage: u32,
    margin_mode: MarginMode,
    walk: Option<StdRng>,
}

/// In-memory exchange simulation
///
/// Fills market orders instantly at the current price (unless entry holding
/// is enabled for tests), rests conditional orders until a price tick
/// crosses their trigger, and honors the venue's close-position semantics:
/// when one exit leg fills the sibling is cancelled.
pub struct PaperExchange {
    info: Mutex<SymbolInfo>,
    inner: Mutex<Inner>,
}

impl PaperExchange {
    pub fn new(info: SymbolInfo, starting_balance: f64, starting_price: f64) -> Self {
        Self {
            info: Mutex::new(info),
            inner: Mutex::new(Inner {
                price: starting_price,
                bars: Vec::new(),
                balance: starting_balance,
                next_order_id: 1,
                orders: HashMap::new(),
                open: Vec::new(),
                position: None,
                hold_entries: false,
                exit_failures: Vec::new(),
                leverage: 1,
                margin_mode: MarginMode::Cross,
                walk: None,
            }),
        }
    }

    /// Drive the price with a seeded random walk so a dry run produces
    /// plausible bars without touching a real venue.
    pub fn with_synthetic_feed(info: SymbolInfo, starting_balance: f64, starting_price: f64, seed: u64) -> Self {
        let paper = Self::new(info, starting_balance, starting_price);
        paper.inner.lock().unwrap().walk = Some(StdRng::seed_from_u64(seed));
        paper
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }

    /// Move the price and fill any conditional order whose trigger the new
    /// price crosses.
    pub fn tick(&self, price: f64) {
        let mut inner = self.lock();
        inner.price = price;
        Self::trigger_exits(&mut inner);
    }

    fn trigger_exits(inner: &mut Inner) {
        let position = match inner.position {
            Some(p) => p,
            None => return,
        };
        let long = position.amount > 0.0;
        let price = inner.price;

        let triggered = inner.open.iter().copied().find(|id| {
            let order = &inner.orders[id];
            match order.kind {
                PaperOrderKind::Market => false,
                PaperOrderKind::TakeProfit => {
                    if long {
                        price >= order.stop_price
                    } else {
                        price <= order.stop_price
                    }
                }
                PaperOrderKind::StopLoss => {
                    if long {
                        price <= order.stop_price
                    } else {
                        price >= order.stop_price
                    }
                }
            }
        });

        let triggered = match triggered {
            Some(id) => id,
            None => return,
        };

        let now = Utc::now();
        let fill_price = inner.orders[&triggered].stop_price;
        {
            let order = inner.orders.get_mut(&triggered).unwrap();
            order.status = OrderStatus::Filled;
            order.avg_price = fill_price;
            order.update_time = now;
        }

        // close-position semantics: the whole position goes, the sibling
        // conditional is cancelled by the venue
        let pnl = (fill_price - position.entry_price) * position.amount;
        inner.balance += pnl;
        inner.position = None;

        let siblings: Vec<i64> = inner
            .open
            .iter()
            .copied()
            .filter(|id| *id != triggered && inner.orders[id].kind != PaperOrderKind::Market)
            .collect();
        for id in siblings {
            let order = inner.orders.get_mut(&id).unwrap();
            order.status = OrderStatus::Cancelled;
            order.update_time = now;
        }
        let Inner { open, orders, .. } = inner;
        open.retain(|id| orders[id].status == OrderStatus::New);
    }

    /// Keep market orders resting as NEW until `fill_order`/`expire_order`.
    pub fn hold_entry_fills(&self, hold: bool) {
        self.lock().hold_entries = hold;
    }

    /// Fill a resting market order at the current price.
    pub fn fill_order(&self, order_id: i64) {
        let mut inner = self.lock();
        let price = inner.price;
        let now = Utc::now();
        let (quantity, kind) = {
            let order = inner.orders.get_mut(&order_id).expect("unknown order");
            order.status = OrderStatus::Filled;
            order.avg_price = price;
            order.update_time = now;
            (order.quantity, order.kind)
        };
        inner.open.retain(|id| *id != order_id);
        if kind == PaperOrderKind::Market {
            inner.position = Some(PaperPosition {
                amount: quantity,
                entry_price: price,
            });
        }
    }

    /// Expire a resting order without filling it.
    pub fn expire_order(&self, order_id: i64) {
        let mut inner = self.lock();
        if let Some(order) = inner.orders.get_mut(&order_id) {
            order.status = OrderStatus::Expired;
            order.update_time = Utc::now();
        }
        inner.open.retain(|id| *id != order_id);
    }

    /// Cancel a resting order (simulates an external actor).
    pub fn cancel_order(&self, order_id: i64) {
        let mut inner = self.lock();
        if let Some(order) = inner.orders.get_mut(&order_id) {
            order.status = OrderStatus::Cancelled;
            order.update_time = Utc::now();
        }
        inner.open.retain(|id| *id != order_id);
    }

    /// Drop the exchange-side position as if closed manually.
    pub fn close_position_externally(&self) {
        let mut inner = self.lock();
        inner.position = None;
        let open: Vec<i64> = inner.open.clone();
        for id in open {
            let order = inner.orders.get_mut(&id).unwrap();
            if order.kind != PaperOrderKind::Market {
                order.status = OrderStatus::Cancelled;
            }
        }
        let inner = &mut *inner;
        let orders = &inner.orders;
        inner.open.retain(|id| orders[id].status == OrderStatus::New);
    }

    /// Queue a failure for the next conditional-order submission.
    pub fn fail_next_exit(&self, failure: ScriptedFailure) {
        self.lock().exit_failures.push(failure);
    }

    /// Swap the instrument filters (simulates the venue changing them).
    pub fn set_symbol_info(&self, info: SymbolInfo) {
        *self.info.lock().unwrap() = info;
    }

    pub fn open_order_ids(&self) -> Vec<i64> {
        self.lock().open.clone()
    }

    pub fn balance_now(&self) -> f64 {
        self.lock().balance
    }

    /// Seed the bar history returned by `historical_bars`.
    pub fn push_bar(&self, bar: Candle) {
        self.lock().bars.push(bar);
    }

    fn synth_bars(inner: &mut Inner, limit: usize) -> Vec<Candle> {
        let walk = inner.walk.as_mut().expect("synthetic feed not enabled");
        let mut price = inner.price;
        let mut closes = Vec::with_capacity(limit);
        for _ in 0..limit {
            price *= 1.0 + walk.gen_range(-0.002..0.002);
            closes.push(price);
        }
        inner.price = price;
        let now = Utc::now();
        let start = now - Duration::minutes(limit as i64);
        closes
            .iter()
            .enumerate()
            .map(|(i, &close)| {
                let open = if i == 0 { close } else { closes[i - 1] };
                Candle {
                    open_time: start + Duration::minutes(i as i64),
                    close_time: start + Duration::minutes(i as i64 + 1),
                    open,
                    high: open.max(close) * 1.001,
                    low: open.min(close) * 0.999,
                    close,
                    volume: 1000.0,
                }
            })
            .collect()
    }
}

#[async_trait::async_trait]
impl ExchangeApi for PaperExchange {
    async fn current_price(&self, _symbol: &str) -> Result<f64, ExchangeError> {
        Ok(self.lock().price)
    }

    async fn historical_bars(
        &self,
        _symbol: &str,
        _timeframe: &str,
        limit: usize,
    ) -> Result<Vec<Candle>, ExchangeError> {
        let mut inner = self.lock();
        if inner.walk.is_some() {
            return Ok(Self::synth_bars(&mut inner, limit));
        }
        let skip = inner.bars.len().saturating_sub(limit);
        Ok(inner.bars[skip..].to_vec())
    }

    async fn account_balance(&self, _asset: &str) -> Result<f64, ExchangeError> {
        Ok(self.lock().balance)
    }

    async fn position_info(&self, _symbol: &str) -> Result<Option<PositionInfo>, ExchangeError> {
        let inner = self.lock();
        Ok(inner.position.map(|p| PositionInfo {
            amount: p.amount,
            entry_price: p.entry_price,
            mark_price: inner.price,
            liquidation_price: 0.0,
            leverage: inner.leverage as f64,
            unrealized_profit: (inner.price - p.entry_price) * p.amount,
            isolated_margin: 0.0,
            notional: p.amount.abs() * inner.price,
            margin_type: Some(inner.margin_mode.as_str().to_lowercase()),
        }))
    }

    async fn open_orders(&self, _symbol: &str) -> Result<Vec<i64>, ExchangeError> {
        Ok(self.lock().open.clone())
    }

    async fn order_status(
        &self,
        _symbol: &str,
        order_id: i64,
    ) -> Result<OrderReport, ExchangeError> {
        let inner = self.lock();
        let order = inner.orders.get(&order_id).ok_or(ExchangeError::Rejected {
            code: -2013,
            msg: "Order does not exist.".to_string(),
        })?;
        Ok(OrderReport {
            order_id: order.id,
            status: order.status,
            avg_price: order.avg_price,
            update_time: order.update_time,
        })
    }

    async fn submit_market_order(
        &self,
        _symbol: &str,
        side: OrderSide,
        quantity: f64,
    ) -> Result<OrderAck, ExchangeError> {
        let mut inner = self.lock();
        let id = inner.next_order_id;
        inner.next_order_id += 1;
        let signed_qty = match side {
            OrderSide::Long => quantity,
            OrderSide::Short => -quantity,
        };
        let now = Utc::now();
        let price = inner.price;
        let hold = inner.hold_entries;
        let order = PaperOrder {
            id,
            client_order_id: Uuid::new_v4().to_string(),
            kind: PaperOrderKind::Market,
            quantity: signed_qty,
            stop_price: 0.0,
            status: if hold { OrderStatus::New } else { OrderStatus::Filled },
            avg_price: if hold { 0.0 } else { price },
            update_time: now,
        };
        let ack = OrderAck {
            order_id: id,
            client_order_id: order.client_order_id.clone(),
        };
        inner.orders.insert(id, order);
        if hold {
            inner.open.push(id);
        } else {
            inner.position = Some(PaperPosition {
                amount: signed_qty,
                entry_price: price,
            });
        }
        Ok(ack)
    }

    async fn submit_take_profit_market(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: f64,
        stop_price: f64,
    ) -> Result<OrderAck, ExchangeError> {
        self.submit_exit(symbol, side, quantity, stop_price, PaperOrderKind::TakeProfit)
    }

    async fn submit_stop_market(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: f64,
        stop_price: f64,
    ) -> Result<OrderAck, ExchangeError> {
        self.submit_exit(symbol, side, quantity, stop_price, PaperOrderKind::StopLoss)
    }

    async fn set_leverage(&self, _symbol: &str, leverage: u32) -> Result<(), ExchangeError> {
        self.lock().leverage = leverage;
        Ok(())
    }

    async fn set_margin_mode(&self, _symbol: &str, mode: MarginMode) -> Result<(), ExchangeError> {
        self.lock().margin_mode = mode;
        Ok(())
    }

    async fn symbol_info(&self, _symbol: &str) -> Result<SymbolInfo, ExchangeError> {
        Ok(self.info.lock().unwrap().clone())
    }
}

impl PaperExchange {
    fn submit_exit(
        &self,
        _symbol: &str,
        _side: OrderSide,
        quantity: f64,
        stop_price: f64,
        kind: PaperOrderKind,
    ) -> Result<OrderAck, ExchangeError> {
        let mut inner = self.lock();
        if !inner.exit_failures.is_empty() {
            let failure = inner.exit_failures.remove(0);
            return Err(failure.into_error());
        }
        // conditional orders need something server-side to attach to
        if inner.position.is_none() && inner.open.is_empty() {
            return Err(ExchangeError::NoOpenPosition);
        }
        let id = inner.next_order_id;
        inner.next_order_id += 1;
        let order = PaperOrder {
            id,
            client_order_id: Uuid::new_v4().to_string(),
            kind,
            quantity,
            stop_price,
            status: OrderStatus::New,
            avg_price: 0.0,
            update_time: Utc::now(),
        };
        let ack = OrderAck {
            order_id: id,
            client_order_id: order.client_order_id.clone(),
        };
        inner.orders.insert(id, order);
        inner.open.push(id);
        Ok(ack)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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

    #[tokio::test]
    async fn test_market_order_fills_instantly() {
        let paper = PaperExchange::new(btc_info(), 1000.0, 100.0);
        let ack = paper
            .submit_market_order("BTCUSDT", OrderSide::Long, 2.0)
            .await
            .unwrap();

        let report = paper.order_status("BTCUSDT", ack.order_id).await.unwrap();
        assert_eq!(report.status, OrderStatus::Filled);
        assert_eq!(report.avg_price, 100.0);

        let info = paper.position_info("BTCUSDT").await.unwrap().unwrap();
        assert_eq!(info.amount, 2.0);
        assert_eq!(info.entry_price, 100.0);
    }

    #[tokio::test]
    async fn test_held_entry_rests_until_filled() {
        let paper = PaperExchange::new(btc_info(), 1000.0, 100.0);
        paper.hold_entry_fills(true);

        let ack = paper
            .submit_market_order("BTCUSDT", OrderSide::Long, 1.0)
            .await
            .unwrap();
        assert_eq!(paper.open_orders("BTCUSDT").await.unwrap(), vec![ack.order_id]);

        paper.fill_order(ack.order_id);
        assert!(paper.open_orders("BTCUSDT").await.unwrap().is_empty());
        assert!(paper.position_info("BTCUSDT").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_exit_without_position_is_benign_race() {
        let paper = PaperExchange::new(btc_info(), 1000.0, 100.0);
        let err = paper
            .submit_stop_market("BTCUSDT", OrderSide::Short, 1.0, 98.0)
            .await
            .unwrap_err();
        assert!(err.is_benign_race());
    }

    #[tokio::test]
    async fn test_stop_loss_tick_closes_position_and_cancels_sibling() {
        let paper = PaperExchange::new(btc_info(), 1000.0, 100.0);
        paper
            .submit_market_order("BTCUSDT", OrderSide::Long, 2.0)
            .await
            .unwrap();
        let tp = paper
            .submit_take_profit_market("BTCUSDT", OrderSide::Short, 2.0, 102.0)
            .await
            .unwrap();
        let sl = paper
            .submit_stop_market("BTCUSDT", OrderSide::Short, 2.0, 98.0)
            .await
            .unwrap();

        paper.tick(99.0); // inside the bracket, nothing fires
        assert_eq!(paper.open_orders("BTCUSDT").await.unwrap().len(), 2);

        paper.tick(97.0); // through the stop
        assert!(paper.open_orders("BTCUSDT").await.unwrap().is_empty());

        let sl_report = paper.order_status("BTCUSDT", sl.order_id).await.unwrap();
        assert_eq!(sl_report.status, OrderStatus::Filled);
        assert_eq!(sl_report.avg_price, 98.0);

        let tp_report = paper.order_status("BTCUSDT", tp.order_id).await.unwrap();
        assert_eq!(tp_report.status, OrderStatus::Cancelled);

        assert!(paper.position_info("BTCUSDT").await.unwrap().is_none());
        // (98 - 100) * 2 = -4
        assert_eq!(paper.balance_now(), 996.0);
    }

    #[tokio::test]
    async fn test_scripted_failures_pop_in_order() {
        let paper = PaperExchange::new(btc_info(), 1000.0, 100.0);
        paper
            .submit_market_order("BTCUSDT", OrderSide::Long, 1.0)
            .await
            .unwrap();
        paper.fail_next_exit(ScriptedFailure::Connectivity);

        let err = paper
            .submit_take_profit_market("BTCUSDT", OrderSide::Short, 1.0, 102.0)
            .await
            .unwrap_err();
        assert!(err.is_connectivity());

        // failure consumed; next submit succeeds
        paper
            .submit_take_profit_market("BTCUSDT", OrderSide::Short, 1.0, 102.0)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_synthetic_feed_produces_bars() {
        let paper = PaperExchange::with_synthetic_feed(btc_info(), 1000.0, 100.0, 7);
        let bars = paper.historical_bars("BTCUSDT", "1m", 50).await.unwrap();
        assert_eq!(bars.len(), 50);
        assert!(bars.iter().all(|b| b.low <= b.high));
        assert!(bars.iter().all(|b| b.close > 0.0));
    }
}
