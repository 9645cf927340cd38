//! Order records and their lifecycle
//!
//! Pending -> Filled | Rejected | Cancelled. Every non-pending status is
//! terminal.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::ExecutionError;
use crate::types::Side;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Pending,
    Filled,
    Rejected,
    Cancelled,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, OrderStatus::Pending)
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OrderStatus::Pending => "PENDING",
            OrderStatus::Filled => "FILLED",
            OrderStatus::Rejected => "REJECTED",
            OrderStatus::Cancelled => "CANCELLED",
        };
        f.write_str(s)
    }
}

/// Opens a position or closes one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderIntent {
    Entry,
    Exit,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub symbol: String,
    pub side: Side,
    pub size: f64,
    pub intent: OrderIntent,
    pub status: OrderStatus,
    /// Reference price at submission
    pub requested_price: f64,
    pub fill_price: Option<f64>,
    pub fill_size: Option<f64>,
    pub reason: Option<String>,
    pub created_ts: i64,
    pub updated_ts: i64,
}

impl Order {
    pub fn new(
        symbol: &str,
        side: Side,
        size: f64,
        intent: OrderIntent,
        requested_price: f64,
        ts: i64,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            symbol: symbol.to_string(),
            side,
            size,
            intent,
            status: OrderStatus::Pending,
            requested_price,
            fill_price: None,
            fill_size: None,
            reason: None,
            created_ts: ts,
            updated_ts: ts,
        }
    }

    fn transition(&mut self, to: OrderStatus, ts: i64) -> Result<(), ExecutionError> {
        if self.status.is_terminal() {
            return Err(ExecutionError::NotPending(self.id.clone()));
        }
        self.status = to;
        self.updated_ts = ts;
        Ok(())
    }

    pub fn fill(&mut self, price: f64, size: f64, ts: i64) -> Result<(), ExecutionError> {
        self.transition(OrderStatus::Filled, ts)?;
        self.fill_price = Some(price);
        self.fill_size = Some(size);
        Ok(())
    }

    pub fn reject(&mut self, reason: impl Into<String>, ts: i64) -> Result<(), ExecutionError> {
        self.transition(OrderStatus::Rejected, ts)?;
        self.reason = Some(reason.into());
        Ok(())
    }

    pub fn cancel(&mut self, ts: i64) -> Result<(), ExecutionError> {
        self.transition(OrderStatus::Cancelled, ts)
    }
}
