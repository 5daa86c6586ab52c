//! Signal/webhook event payloads consumed by the engine.
//!
//! These are produced by the out-of-scope ingestion layer (strategy engine or
//! webhook server) and translated into broker/risk calls by
//! [`crate::service::SignalExecutor`].

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::order::{OrderSide, PlaceOrderRequest};

/// The action a signal event requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Signal {
    /// Open a long position.
    Buy,
    /// Close a long position (sell to exit).
    Sell,
    /// Open a short position.
    Short,
    /// Close whatever position is open for the symbol/strategy.
    Exit,
}

/// One inbound strategy/webhook event.
///
/// `event_id` drives idempotent processing: the executor remembers processed
/// ids and acknowledges duplicates without side effects. `cid` is a
/// correlation id for tracing only and never reaches the exchange adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalEvent {
    /// Requested action.
    pub signal: Signal,
    /// Symbol the signal applies to.
    pub symbol: String,
    /// Amount to trade (required for entries).
    #[serde(default)]
    pub amount: Option<Decimal>,
    /// Suggested price (entries may carry the strategy's reference price).
    #[serde(default)]
    pub price: Option<Decimal>,
    /// Strategy label.
    #[serde(default)]
    pub strategy: Option<String>,
    /// Correlation id for tracing.
    #[serde(default)]
    pub cid: Option<String>,
    /// Idempotency key.
    #[serde(default)]
    pub event_id: Option<String>,
    /// OCO pair request, routed to the OCO manager when present.
    #[serde(default)]
    pub oco: Option<OcoRequest>,
    /// TWAP job request, routed to the TWAP runner when present.
    #[serde(default)]
    pub twap: Option<TwapRequest>,
}

impl SignalEvent {
    /// Build a bare entry/exit event.
    #[must_use]
    pub const fn new(signal: Signal, symbol: String) -> Self {
        Self {
            signal,
            symbol,
            amount: None,
            price: None,
            strategy: None,
            cid: None,
            event_id: None,
            oco: None,
            twap: None,
        }
    }

    /// Set the amount.
    #[must_use]
    pub const fn with_amount(mut self, amount: Decimal) -> Self {
        self.amount = Some(amount);
        self
    }

    /// Set the reference price.
    #[must_use]
    pub const fn with_price(mut self, price: Decimal) -> Self {
        self.price = Some(price);
        self
    }

    /// Set the strategy label.
    #[must_use]
    pub fn with_strategy(mut self, strategy: impl Into<String>) -> Self {
        self.strategy = Some(strategy.into());
        self
    }

    /// Set the idempotency key.
    #[must_use]
    pub fn with_event_id(mut self, event_id: impl Into<String>) -> Self {
        self.event_id = Some(event_id.into());
        self
    }
}

/// Request for a linked one-cancels-other pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcoRequest {
    /// First leg (typically the take-profit).
    pub primary: PlaceOrderRequest,
    /// Second leg (typically the stop).
    pub secondary: PlaceOrderRequest,
}

/// Request for a background TWAP job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TwapRequest {
    /// Symbol to trade.
    pub symbol: String,
    /// Order side for every slice.
    pub side: OrderSide,
    /// Total amount distributed across slices.
    pub total_amount: Decimal,
    /// Number of slices (must be >= 1).
    pub slices: u32,
    /// Total execution window in seconds.
    pub duration_seconds: u64,
}
