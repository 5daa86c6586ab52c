//! Order-related types for execution tracking.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Order side (buy or sell).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderSide {
    /// Buy order.
    Buy,
    /// Sell order.
    Sell,
}

impl OrderSide {
    /// The opposite side, used when building closing orders.
    #[must_use]
    pub const fn flipped(self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }

    /// Lowercase wire representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Buy => "buy",
            Self::Sell => "sell",
        }
    }

    /// Parse a stored/exchange side string. Unknown values default to buy.
    #[must_use]
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "sell" => Self::Sell,
            _ => Self::Buy,
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Order type (market or limit).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    /// Market order - execute at best available price.
    Market,
    /// Limit order - execute at specified price or better.
    Limit,
}

impl OrderType {
    /// Lowercase wire representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Market => "market",
            Self::Limit => "limit",
        }
    }

    /// Parse a stored/exchange order-type string. Unknown values default to market.
    #[must_use]
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "limit" => Self::Limit,
            _ => Self::Market,
        }
    }
}

/// Order status in the lifecycle.
///
/// Transitions are monotonic toward a terminal state, with the exception of
/// `Submitted` <-> `Open` churn while the exchange acknowledges the order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    /// Order sent to the exchange, not yet acknowledged as resting.
    Submitted,
    /// Order resting on the book.
    Open,
    /// Order completely filled.
    Filled,
    /// Order partially filled and still active.
    Partial,
    /// Order cancelled.
    Cancelled,
    /// Order rejected by the exchange.
    Rejected,
    /// Order simulated locally, never sent to an exchange.
    DryRun,
    /// Exchange-reported "closed" state (fully executed).
    Closed,
    /// Exchange returned a status this engine does not recognize.
    Unknown,
}

impl OrderStatus {
    /// Returns true if the order can no longer change state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Filled | Self::Cancelled | Self::Rejected | Self::Closed
        )
    }

    /// Returns true if the order is still working (can fill or be cancelled).
    #[must_use]
    pub const fn is_active(&self) -> bool {
        matches!(self, Self::Submitted | Self::Open | Self::Partial)
    }

    /// Returns true if the order executed in full.
    #[must_use]
    pub const fn is_filled(&self) -> bool {
        matches!(self, Self::Filled | Self::Closed)
    }

    /// Lowercase wire/storage representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Submitted => "submitted",
            Self::Open => "open",
            Self::Filled => "filled",
            Self::Partial => "partial",
            Self::Cancelled => "cancelled",
            Self::Rejected => "rejected",
            Self::DryRun => "dry_run",
            Self::Closed => "closed",
            Self::Unknown => "unknown",
        }
    }

    /// Map a raw exchange status string onto the engine's status set.
    ///
    /// Exchange clients disagree on vocabulary ("new", "canceled",
    /// "partially_filled", ...); anything unrecognized maps to `Unknown`
    /// rather than failing the whole response.
    #[must_use]
    pub fn from_exchange(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "submitted" | "new" | "pending" | "accepted" => Self::Submitted,
            "open" | "active" | "working" => Self::Open,
            "filled" => Self::Filled,
            "partial" | "partially_filled" => Self::Partial,
            "cancelled" | "canceled" => Self::Cancelled,
            "rejected" => Self::Rejected,
            "dry_run" => Self::DryRun,
            "closed" | "done" => Self::Closed,
            _ => Self::Unknown,
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalized exchange order as tracked and persisted by the engine.
///
/// `id` is the persistence key: exchange-assigned when available, otherwise
/// synthesized by the broker. Records are upserted, never deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    /// Order ID (exchange-assigned or locally generated).
    pub id: String,
    /// Traded symbol, e.g. "BTC/USDT".
    pub symbol: String,
    /// Order side.
    pub side: OrderSide,
    /// Requested amount.
    pub amount: Decimal,
    /// Filled amount.
    pub filled: Decimal,
    /// Order price (None for market orders without a known fill price).
    pub price: Option<Decimal>,
    /// Current status.
    pub status: OrderStatus,
    /// Order type.
    pub order_type: OrderType,
    /// Strategy label that produced the order, if any.
    pub strategy: Option<String>,
    /// Opaque adapter payload, kept verbatim for audit.
    pub raw: serde_json::Value,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last update timestamp.
    pub updated_at: DateTime<Utc>,
}

/// Typed request for placing an order through the broker.
///
/// Every exchange adapter accepts this struct uniformly; there is no
/// per-adapter keyword filtering. Tracing metadata (correlation ids, event
/// ids) deliberately does not appear here - it stays with the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaceOrderRequest {
    /// Symbol to trade.
    pub symbol: String,
    /// Order side.
    pub side: OrderSide,
    /// Amount to trade.
    pub amount: Decimal,
    /// Limit price (None for market orders).
    pub price: Option<Decimal>,
    /// Order type.
    pub order_type: OrderType,
    /// Strategy label, carried into the persisted order record.
    pub strategy: Option<String>,
}

impl PlaceOrderRequest {
    /// Create a market order request.
    #[must_use]
    pub const fn market(symbol: String, side: OrderSide, amount: Decimal) -> Self {
        Self {
            symbol,
            side,
            amount,
            price: None,
            order_type: OrderType::Market,
            strategy: None,
        }
    }

    /// Create a limit order request.
    #[must_use]
    pub const fn limit(symbol: String, side: OrderSide, amount: Decimal, price: Decimal) -> Self {
        Self {
            symbol,
            side,
            amount,
            price: Some(price),
            order_type: OrderType::Limit,
            strategy: None,
        }
    }

    /// Attach a strategy label.
    #[must_use]
    pub fn with_strategy(mut self, strategy: impl Into<String>) -> Self {
        self.strategy = Some(strategy.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;

    #[test]
    fn test_order_status_terminal() {
        assert!(OrderStatus::Filled.is_terminal());
        assert!(OrderStatus::Cancelled.is_terminal());
        assert!(OrderStatus::Rejected.is_terminal());
        assert!(OrderStatus::Closed.is_terminal());
        assert!(!OrderStatus::Submitted.is_terminal());
        assert!(!OrderStatus::Open.is_terminal());
        assert!(!OrderStatus::DryRun.is_terminal());
    }

    #[test]
    fn test_order_status_active() {
        assert!(OrderStatus::Submitted.is_active());
        assert!(OrderStatus::Open.is_active());
        assert!(OrderStatus::Partial.is_active());
        assert!(!OrderStatus::Filled.is_active());
        assert!(!OrderStatus::DryRun.is_active());
    }

    #[test]
    fn test_status_from_exchange_vocabulary() {
        assert_eq!(OrderStatus::from_exchange("NEW"), OrderStatus::Submitted);
        assert_eq!(OrderStatus::from_exchange("canceled"), OrderStatus::Cancelled);
        assert_eq!(OrderStatus::from_exchange("closed"), OrderStatus::Closed);
        assert_eq!(
            OrderStatus::from_exchange("partially_filled"),
            OrderStatus::Partial
        );
        assert_eq!(OrderStatus::from_exchange("weird"), OrderStatus::Unknown);
    }

    #[test]
    fn test_status_string_roundtrip() {
        for status in [
            OrderStatus::Submitted,
            OrderStatus::Open,
            OrderStatus::Filled,
            OrderStatus::Partial,
            OrderStatus::Cancelled,
            OrderStatus::Rejected,
            OrderStatus::DryRun,
            OrderStatus::Closed,
        ] {
            assert_eq!(OrderStatus::from_exchange(status.as_str()), status);
        }
    }

    #[test]
    fn test_side_flipped() {
        assert_eq!(OrderSide::Buy.flipped(), OrderSide::Sell);
        assert_eq!(OrderSide::Sell.flipped(), OrderSide::Buy);
    }

    #[test]
    fn test_market_request() {
        let request = PlaceOrderRequest::market("BTC/USDT".to_string(), OrderSide::Buy, dec!(1.5));
        assert_eq!(request.order_type, OrderType::Market);
        assert!(request.price.is_none());
        assert!(request.strategy.is_none());
    }

    #[test]
    fn test_limit_request_with_strategy() {
        let request =
            PlaceOrderRequest::limit("ETH/USDT".to_string(), OrderSide::Sell, dec!(2), dec!(3100))
                .with_strategy("breakout");
        assert_eq!(request.order_type, OrderType::Limit);
        assert_eq!(request.price, Some(dec!(3100)));
        assert_eq!(request.strategy.as_deref(), Some("breakout"));
    }
}
