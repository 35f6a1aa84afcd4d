use chrono::{DateTime, Utc};

use crate::models::{Candle, OrderSide};
use crate::precision;

/// Minimum trend strength before an entry candidate is emitted.
pub const MIN_TREND_STRENGTH: f64 = 15.0;

/// The tp/sl trigger distance is this multiple of the bar volatility.
pub const TRIGGER_OFFSET_FACTOR: f64 = 1.1;

/// Per-bar trend reading
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrendDirection {
    Up,
    Down,
    Flat,
}

/// One finished bar plus the indicator columns computed for it
///
/// The numeric indicator pipeline is an external concern; the engine only
/// consumes its output.
#[derive(Debug, Clone)]
pub struct SignalFrame {
    pub time: DateTime<Utc>,
    pub close: f64,
    /// 0-100 trend strength reading.
    pub trend_strength: f64,
    pub direction: TrendDirection,
    /// Absolute price-units volatility for the bar window.
    pub volatility: f64,
}

/// Computes indicator columns over a bar window
pub trait TrendPipeline: Send + Sync {
    fn analyze(&self, candles: &[Candle]) -> anyhow::Result<Vec<SignalFrame>>;
}

/// Account context used to size an entry candidate
#[derive(Debug, Clone)]
pub struct EntrySizing {
    pub margin_pct: f64,
    pub equity: f64,
    pub leverage: u32,
    pub current_price: f64,
    pub quantity_precision: u32,
}

/// Candidate entry produced by the engine, not yet submitted
#[derive(Debug, Clone)]
pub struct PositionDraft {
    pub side: OrderSide,
    pub volume: f64,
    pub reference_price: f64,
    pub time: DateTime<Utc>,
    /// Distance from the entry price to each exit trigger.
    pub trigger_offset: f64,
    pub leverage: u32,
}

/// Turns a finished bar's indicator readings into an entry candidate
pub struct SignalEngine {
    min_trend_strength: f64,
}

impl Default for SignalEngine {
    fn default() -> Self {
        Self {
            min_trend_strength: MIN_TREND_STRENGTH,
        }
    }
}

impl SignalEngine {
    pub fn new(min_trend_strength: f64) -> Self {
        Self { min_trend_strength }
    }

    /// Evaluate the latest finished bar.
    ///
    /// Whether a position is already open is the caller's concern, not the
    /// engine's.
    pub fn evaluate(&self, frame: &SignalFrame, sizing: &EntrySizing) -> Option<PositionDraft> {
        if frame.trend_strength < self.min_trend_strength {
            return None;
        }
        let side = match frame.direction {
            TrendDirection::Up => OrderSide::Long,
            TrendDirection::Down => OrderSide::Short,
            TrendDirection::Flat => return None,
        };
        let volume = precision::order_quantity(
            sizing.margin_pct,
            sizing.equity,
            sizing.leverage,
            sizing.current_price,
            sizing.quantity_precision,
        );
        if volume <= 0.0 {
            return None;
        }
        Some(PositionDraft {
            side,
            volume,
            reference_price: frame.close,
            time: frame.time,
            trigger_offset: TRIGGER_OFFSET_FACTOR * frame.volatility,
            leverage: sizing.leverage,
        })
    }

    /// Mean trend strength over the window, surfaced in trader status.
    pub fn average_trend_strength(frames: &[SignalFrame]) -> f64 {
        if frames.is_empty() {
            return 0.0;
        }
        frames.iter().map(|f| f.trend_strength).sum::<f64>() / frames.len() as f64
    }
}
