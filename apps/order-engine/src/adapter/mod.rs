//! Exchange adapter capability interface.
//!
//! Every exchange integration implements [`ExchangeAdapter`] explicitly;
//! signature incompatibilities between exchange client libraries are resolved
//! once, when the adapter is written, not at call time. The broker is the only
//! component allowed to call an adapter's mutating methods.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{OrderSide, PlaceOrderRequest};

pub mod paper;

pub use paper::PaperExchange;

/// Errors surfaced by exchange adapters.
///
/// The broker treats every variant as retryable up to its attempt cap; after
/// exhaustion the last error propagates to the caller as a terminal failure
/// for that call.
#[derive(Debug, Clone, Error)]
pub enum AdapterError {
    /// Transport/session failure talking to the exchange.
    #[error("exchange connection error: {message}")]
    Connection {
        /// Error details.
        message: String,
    },

    /// The exchange refused the order.
    #[error("order rejected: {reason}")]
    Rejected {
        /// Rejection reason.
        reason: String,
    },

    /// The exchange does not know the order id.
    #[error("order not found: {order_id}")]
    NotFound {
        /// The missing order id.
        order_id: String,
    },

    /// The adapter does not implement this capability.
    #[error("capability not supported: {capability}")]
    NotSupported {
        /// Name of the missing capability.
        capability: String,
    },

    /// Any other exchange-reported error.
    #[error("exchange error: {message}")]
    Exchange {
        /// Error details.
        message: String,
    },
}

/// Best bid/ask/last snapshot for one symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticker {
    /// Symbol.
    pub symbol: String,
    /// Best bid.
    pub bid: Decimal,
    /// Best ask.
    pub ask: Decimal,
    /// Last traded price.
    pub last: Decimal,
}

/// Account balance summary.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Balance {
    /// Total equity.
    pub total: Decimal,
    /// Free (available) balance.
    pub free: Decimal,
    /// Balance locked in open orders/positions.
    pub used: Decimal,
}

/// One OHLCV candle.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Candle {
    /// Candle open time.
    pub ts: DateTime<Utc>,
    /// Open price.
    pub open: Decimal,
    /// High price.
    pub high: Decimal,
    /// Low price.
    pub low: Decimal,
    /// Close price.
    pub close: Decimal,
    /// Traded volume.
    pub volume: Decimal,
}

/// Loosely-shaped order as returned by an exchange adapter.
///
/// Exchanges disagree about which fields an order response carries, so every
/// field is optional here; the broker normalizes this into a complete
/// [`crate::models::Order`], backfilling from the original request and
/// synthesizing an id when the exchange returned none.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdapterOrder {
    /// Exchange-assigned order id, if any.
    pub id: Option<String>,
    /// Raw status string as reported by the exchange.
    pub status: Option<String>,
    /// Symbol, if echoed back.
    pub symbol: Option<String>,
    /// Side, if echoed back.
    pub side: Option<OrderSide>,
    /// Requested amount, if echoed back.
    pub amount: Option<Decimal>,
    /// Filled amount, if reported.
    pub filled: Option<Decimal>,
    /// Order/fill price, if reported.
    pub price: Option<Decimal>,
    /// The verbatim exchange payload.
    pub raw: serde_json::Value,
}

/// Capability interface over heterogeneous exchange/broker clients.
///
/// Read capabilities (`fetch_balance`, `fetch_ohlcv`, `fetch_open_orders`)
/// have `NotSupported` defaults so thin adapters only implement what their
/// exchange offers; the broker falls back to the local store where that makes
/// sense. `connect` defaults to a no-op for clients that hold no session.
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    /// Establish the exchange session. Defaults to "already connected".
    async fn connect(&self) -> Result<bool, AdapterError> {
        Ok(true)
    }

    /// Fetch the current ticker for a symbol.
    async fn fetch_ticker(&self, symbol: &str) -> Result<Ticker, AdapterError>;

    /// Fetch the account balance.
    async fn fetch_balance(&self) -> Result<Balance, AdapterError> {
        Err(AdapterError::NotSupported {
            capability: "fetch_balance".to_string(),
        })
    }

    /// Fetch recent OHLCV candles for a symbol.
    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: usize,
    ) -> Result<Vec<Candle>, AdapterError> {
        let _ = (symbol, timeframe, limit);
        Err(AdapterError::NotSupported {
            capability: "fetch_ohlcv".to_string(),
        })
    }

    /// Place an order.
    async fn place_order(&self, request: &PlaceOrderRequest) -> Result<AdapterOrder, AdapterError>;

    /// Cancel an order by id.
    async fn cancel_order(&self, order_id: &str) -> Result<AdapterOrder, AdapterError>;

    /// Fetch one order by id.
    async fn fetch_order(&self, order_id: &str) -> Result<AdapterOrder, AdapterError>;

    /// Fetch open orders, optionally filtered by symbol.
    async fn fetch_open_orders(
        &self,
        symbol: Option<&str>,
    ) -> Result<Vec<AdapterOrder>, AdapterError> {
        let _ = symbol;
        Err(AdapterError::NotSupported {
            capability: "fetch_open_orders".to_string(),
        })
    }
}
