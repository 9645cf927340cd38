//! Candle indicators shared by the orchestrator and sizer

use crate::types::Candle;

/// Average True Range over the last `period` candles
pub fn atr(candles: &[Candle], period: usize) -> Option<f64> {
    if period == 0 || candles.len() < period + 1 {
        return None;
    }

    let tail = &candles[candles.len() - period - 1..];
    let sum: f64 = tail
        .windows(2)
        .map(|w| {
            let (prev, curr) = (&w[0], &w[1]);
            (curr.high - curr.low)
                .max((curr.high - prev.close).abs())
                .max((curr.low - prev.close).abs())
        })
        .sum();

    Some(sum / period as f64)
}

/// ATR relative to the latest close
pub fn atr_fraction(candles: &[Candle], period: usize) -> Option<f64> {
    let last = candles.last()?.close;
    if last <= 0.0 {
        return None;
    }
    atr(candles, period).map(|a| a / last)
}
