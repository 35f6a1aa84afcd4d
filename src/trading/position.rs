use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{OrderSide, PositionInfo};
use crate::precision::truncate;
use crate::signal::PositionDraft;

/// Where a position is in its lifecycle
///
/// `PendingEntry -> Open -> PendingClose -> Closed`, with `Expired` as the
/// terminal side-channel for an entry order that died before filling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionState {
    PendingEntry,
    Open,
    PendingClose,
    Closed,
    Expired,
}

/// One trade's lifecycle: entry, open management, exit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub side: OrderSide,
    pub volume: f64,
    pub leverage: u32,

    /// Requested price at candidate time, replaced by the exchange's
    /// average-fill price once the entry order fills.
    pub entry_price: f64,
    pub entry_time: Option<DateTime<Utc>>,

    pub take_profit: f64,
    pub stop_loss: f64,
    /// Transient overrides used while a closing retry is in flight.
    pub take_profit_override: Option<f64>,
    pub stop_loss_override: Option<f64>,
    /// Distance from the reference price to each exit trigger.
    pub trigger_offset: f64,

    pub entry_order_id: Option<i64>,
    pub entry_client_order_id: Option<String>,
    pub entry_filled: bool,

    pub tp_order_id: Option<i64>,
    pub tp_client_order_id: Option<String>,
    pub sl_order_id: Option<i64>,
    pub sl_client_order_id: Option<String>,

    pub exit_price: Option<f64>,
    pub exit_time: Option<DateTime<Utc>>,
    pub profit: Option<f64>,
    pub closed: bool,
    pub expired: bool,

    // exchange-side mirror, refreshed each cycle for status display
    pub amount: f64,
    pub mark_price: f64,
    pub liquidation_price: f64,
    pub unrealized_profit: f64,
    pub isolated_margin: f64,
    pub notional: f64,
    pub margin_type: Option<String>,

    price_precision: u32,
}

impl Position {
    /// Build a position from a signal candidate, bracketing the reference
    /// price with truncated tp/sl levels.
    pub fn from_draft(draft: &PositionDraft, price_precision: u32) -> Self {
        let mut position = Self {
            side: draft.side,
            volume: draft.volume,
            leverage: draft.leverage,
            entry_price: draft.reference_price,
            entry_time: None,
            take_profit: 0.0,
            stop_loss: 0.0,
            take_profit_override: None,
            stop_loss_override: None,
            trigger_offset: draft.trigger_offset,
            entry_order_id: None,
            entry_client_order_id: None,
            entry_filled: false,
            tp_order_id: None,
            tp_client_order_id: None,
            sl_order_id: None,
            sl_client_order_id: None,
            exit_price: None,
            exit_time: None,
            profit: None,
            closed: false,
            expired: false,
            amount: 0.0,
            mark_price: 0.0,
            liquidation_price: 0.0,
            unrealized_profit: 0.0,
            isolated_margin: 0.0,
            notional: 0.0,
            margin_type: None,
            price_precision,
        };
        position.retarget_around(draft.reference_price);
        position
    }

    pub fn price_precision(&self) -> u32 {
        self.price_precision
    }

    pub fn state(&self) -> PositionState {
        if self.expired {
            PositionState::Expired
        } else if self.closed {
            PositionState::Closed
        } else if !self.entry_filled {
            PositionState::PendingEntry
        } else if self.tp_order_id.is_some() || self.sl_order_id.is_some() {
            PositionState::PendingClose
        } else {
            PositionState::Open
        }
    }

    /// Recompute the tp/sl bracket around `price` using the trigger offset.
    pub fn retarget_around(&mut self, price: f64) {
        let (tp, sl) = match self.side {
            OrderSide::Long => (price + self.trigger_offset, price - self.trigger_offset),
            OrderSide::Short => (price - self.trigger_offset, price + self.trigger_offset),
        };
        self.take_profit = truncate(tp, self.price_precision);
        self.stop_loss = truncate(sl, self.price_precision);
    }

    /// Adopt the bracket of a fresh same-direction candidate (trailing).
    pub fn ratchet_to(&mut self, draft: &PositionDraft) {
        self.trigger_offset = draft.trigger_offset;
        self.retarget_around(draft.reference_price);
    }

    pub fn effective_take_profit(&self) -> f64 {
        self.take_profit_override.unwrap_or(self.take_profit)
    }

    pub fn effective_stop_loss(&self) -> f64 {
        self.stop_loss_override.unwrap_or(self.stop_loss)
    }

    /// Entry order left the open-order set with a FILLED report: record the
    /// real fill and re-bracket around it. Legal exactly once.
    pub fn record_entry_fill(&mut self, avg_price: f64, time: DateTime<Utc>) {
        debug_assert!(!self.entry_filled);
        self.entry_filled = true;
        self.entry_price = avg_price;
        self.entry_time = Some(time);
        self.retarget_around(avg_price);
    }

    pub fn mark_expired(&mut self) {
        self.expired = true;
    }

    /// A confirmed exit fill closes the position and realizes profit.
    pub fn record_exit(&mut self, exit_price: f64, exit_time: DateTime<Utc>) {
        self.exit_price = Some(exit_price);
        self.exit_time = Some(exit_time);
        self.profit = Some(self.side.profit(self.entry_price, exit_price, self.volume));
        self.closed = true;
    }

    /// The exchange reported nothing left to close: someone closed the
    /// position outside the bot. Marks closed without inventing an exit
    /// price.
    pub fn record_external_close(&mut self, time: DateTime<Utc>) {
        self.closed = true;
        if self.exit_time.is_none() {
            self.exit_time = Some(time);
        }
    }

    /// Both exit orders vanished without a fill: forget them so a fresh
    /// attempt can be made.
    pub fn clear_exit_orders(&mut self) {
        self.tp_order_id = None;
        self.tp_client_order_id = None;
        self.sl_order_id = None;
        self.sl_client_order_id = None;
        self.take_profit_override = None;
        self.stop_loss_override = None;
    }

    pub fn hit_take_profit(&self, price: f64) -> bool {
        match self.side {
            OrderSide::Long => price >= self.take_profit,
            OrderSide::Short => price <= self.take_profit,
        }
    }

    pub fn hit_stop_loss(&self, price: f64) -> bool {
        match self.side {
            OrderSide::Long => price <= self.stop_loss,
            OrderSide::Short => price >= self.stop_loss,
        }
    }

    /// Pull in the exchange's view of the open position for status display.
    pub fn sync_exchange_view(&mut self, info: &PositionInfo) {
        self.amount = info.amount;
        self.mark_price = info.mark_price;
        self.liquidation_price = info.liquidation_price;
        self.unrealized_profit = info.unrealized_profit;
        self.isolated_margin = info.isolated_margin;
        self.notional = info.notional;
        self.margin_type = info.margin_type.clone();
    }
}

/// Chronological, bounded history of a trader's positions
///
/// At most one element is non-closed; once the window is full the oldest
/// entry is evicted on insert.
#[derive(Debug, Clone)]
pub struct PositionBook {
    positions: Vec<Position>,
    capacity: usize,
}

impl PositionBook {
    pub fn new(capacity: usize) -> Self {
        Self {
            positions: Vec::new(),
            capacity: capacity.max(1),
        }
    }

    /// Append a position, evicting the oldest when over capacity.
    pub fn push(&mut self, position: Position) {
        self.positions.push(position);
        if self.positions.len() > self.capacity {
            let excess = self.positions.len() - self.capacity;
            self.positions.drain(..excess);
        }
    }

    /// The one position still working, if any.
    pub fn open_mut(&mut self) -> Option<&mut Position> {
        self.positions
            .last_mut()
            .filter(|p| !p.closed && !p.expired)
    }

    pub fn open(&self) -> Option<&Position> {
        self.positions.last().filter(|p| !p.closed && !p.expired)
    }

    /// Most recent closed position, for status display.
    pub fn last_closed(&self) -> Option<&Position> {
        self.positions.iter().rev().find(|p| p.closed)
    }

    /// Drop the trailing position (an expired entry never traded).
    pub fn discard_last(&mut self) {
        self.positions.pop();
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Position> {
        self.positions.iter()
    }
}
