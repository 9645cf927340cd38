//! Latest trade prices per symbol with the extremes seen since the last
//! monitor pass

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use crate::execution::PriceBar;

#[derive(Debug, Default)]
pub struct PriceTracker {
    bars: Mutex<HashMap<String, PriceBar>>,
}

impl PriceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, symbol: &str, price: f64) {
        if !price.is_finite() || price <= 0.0 {
            return;
        }
        let mut bars = self.bars.lock().unwrap_or_else(PoisonError::into_inner);
        match bars.get_mut(symbol) {
            Some(bar) => {
                bar.last = price;
                bar.high = bar.high.max(price);
                bar.low = bar.low.min(price);
            }
            None => {
                bars.insert(symbol.to_string(), PriceBar::flat(price));
            }
        }
    }

    /// Bars since the previous call; each bar restarts at its last price
    pub fn take_bars(&self) -> HashMap<String, PriceBar> {
        let mut bars = self.bars.lock().unwrap_or_else(PoisonError::into_inner);
        let out = bars.clone();
        for bar in bars.values_mut() {
            *bar = PriceBar::flat(bar.last);
        }
        out
    }

    pub fn last(&self, symbol: &str) -> Option<f64> {
        self.bars
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(symbol)
            .map(|b| b.last)
    }

    pub fn last_prices(&self) -> HashMap<String, f64> {
        self.bars
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(s, b)| (s.clone(), b.last))
            .collect()
    }
}
