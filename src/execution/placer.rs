//! Order placement seam
//!
//! Live fills come from an `OrderPlacer`. Paper fills are simulated inside
//! the engine and never reach this trait.

use async_trait::async_trait;

use crate::error::ExchangeError;
use crate::types::Side;

/// Executed quantity and volume-weighted price of a market order
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Fill {
    pub price: f64,
    pub size: f64,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait OrderPlacer: Send + Sync {
    async fn place_market_order(
        &self,
        symbol: &str,
        side: Side,
        size: f64,
    ) -> Result<Fill, ExchangeError>;

    /// Free balance of `asset`
    async fn get_balance(&self, asset: &str) -> Result<f64, ExchangeError>;
}
