//! Built-in trend pipeline
//!
//! A compact stand-in for a full technical-analysis library: trend direction
//! from a fast/slow EMA cross, trend strength from the EMA spread normalized
//! by volatility, volatility from a smoothed bar range.

use crate::models::Candle;
use crate::signal::{SignalFrame, TrendDirection, TrendPipeline};

const FAST_PERIOD: usize = 10;
const SLOW_PERIOD: usize = 30;

/// Exponential moving average, seeded with the first value.
fn ema(values: &[f64], period: usize) -> Vec<f64> {
    let alpha = 2.0 / (period as f64 + 1.0);
    let mut out = Vec::with_capacity(values.len());
    let mut prev = match values.first() {
        Some(&v) => v,
        None => return out,
    };
    for &value in values {
        prev = alpha * value + (1.0 - alpha) * prev;
        out.push(prev);
    }
    out
}

pub struct EmaTrendPipeline {
    fast_period: usize,
    slow_period: usize,
}

impl Default for EmaTrendPipeline {
    fn default() -> Self {
        Self {
            fast_period: FAST_PERIOD,
            slow_period: SLOW_PERIOD,
        }
    }
}

impl TrendPipeline for EmaTrendPipeline {
    fn analyze(&self, candles: &[Candle]) -> anyhow::Result<Vec<SignalFrame>> {
        if candles.len() < self.slow_period {
            anyhow::bail!(
                "need at least {} bars, got {}",
                self.slow_period,
                candles.len()
            );
        }

        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
        let ranges: Vec<f64> = candles.iter().map(|c| c.high - c.low).collect();

        let fast = ema(&closes, self.fast_period);
        let slow = ema(&closes, self.slow_period);
        let volatility = ema(&ranges, self.fast_period);

        // skip the warmup region where the slow EMA is still settling
        let frames = candles
            .iter()
            .enumerate()
            .skip(self.slow_period - 1)
            .map(|(i, candle)| {
                let spread = fast[i] - slow[i];
                let vol = volatility[i];
                let strength = if vol > 0.0 {
                    (spread.abs() / vol * 100.0).min(100.0)
                } else {
                    0.0
                };
                // a spread inside a tenth of the bar range is noise
                let direction = if spread.abs() < 0.1 * vol {
                    TrendDirection::Flat
                } else if spread > 0.0 {
                    TrendDirection::Up
                } else {
                    TrendDirection::Down
                };
                SignalFrame {
                    time: candle.close_time,
                    close: candle.close,
                    trend_strength: strength,
                    direction,
                    volatility: vol,
                }
            })
            .collect();
        Ok(frames)
    }
}
