//! In-memory paper exchange.
//!
//! Deterministic no-network adapter used by the shipped paper mode and the
//! integration tests. Market orders fill instantly at the posted ticker;
//! limit orders rest until [`PaperExchange::fill_order`] marks them executed,
//! which lets tests script fill sequences (an OCO leg filling first, a TWAP
//! slice resting, ...).
//!
//! Status strings deliberately use raw exchange vocabulary ("new", "closed",
//! "canceled") so the broker's normalization layer is exercised on every call.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde_json::json;
use uuid::Uuid;

use super::{AdapterError, AdapterOrder, Balance, Candle, ExchangeAdapter, Ticker};
use crate::models::{OrderType, PlaceOrderRequest};

/// Default paper account equity.
const DEFAULT_EQUITY: Decimal = Decimal::from_parts(10_000, 0, 0, false, 0);

/// Simulated exchange holding tickers, orders, and a balance in memory.
pub struct PaperExchange {
    tickers: RwLock<HashMap<String, Ticker>>,
    orders: RwLock<HashMap<String, AdapterOrder>>,
    balance: RwLock<Balance>,
}

impl PaperExchange {
    /// Create an empty paper exchange with the default balance.
    #[must_use]
    pub fn new() -> Self {
        Self {
            tickers: RwLock::new(HashMap::new()),
            orders: RwLock::new(HashMap::new()),
            balance: RwLock::new(Balance {
                total: DEFAULT_EQUITY,
                free: DEFAULT_EQUITY,
                used: Decimal::ZERO,
            }),
        }
    }

    /// Post a ticker snapshot for a symbol.
    pub fn set_ticker(&self, symbol: &str, bid: Decimal, ask: Decimal, last: Decimal) {
        self.tickers.write().insert(
            symbol.to_string(),
            Ticker {
                symbol: symbol.to_string(),
                bid,
                ask,
                last,
            },
        );
    }

    /// Overwrite the account balance.
    pub fn set_balance(&self, total: Decimal, free: Decimal, used: Decimal) {
        *self.balance.write() = Balance { total, free, used };
    }

    /// Mark a resting order as fully executed.
    ///
    /// Scenario control for tests and simulations; a live exchange does this
    /// on its own schedule.
    pub fn fill_order(&self, order_id: &str) -> bool {
        let mut orders = self.orders.write();
        match orders.get_mut(order_id) {
            Some(order) => {
                order.status = Some("closed".to_string());
                order.filled = order.amount;
                true
            }
            None => false,
        }
    }

    /// Number of orders this exchange has seen.
    #[must_use]
    pub fn order_count(&self) -> usize {
        self.orders.read().len()
    }
}

impl Default for PaperExchange {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExchangeAdapter for PaperExchange {
    async fn fetch_ticker(&self, symbol: &str) -> Result<Ticker, AdapterError> {
        self.tickers
            .read()
            .get(symbol)
            .cloned()
            .ok_or_else(|| AdapterError::Exchange {
                message: format!("no ticker posted for {symbol}"),
            })
    }

    async fn fetch_balance(&self) -> Result<Balance, AdapterError> {
        Ok(*self.balance.read())
    }

    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        _timeframe: &str,
        limit: usize,
    ) -> Result<Vec<Candle>, AdapterError> {
        // Flat candles around the posted last price; enough for indicator
        // plumbing that only needs a well-formed series.
        let last = self.fetch_ticker(symbol).await?.last;
        let now = Utc::now();
        Ok((0..limit)
            .map(|i| Candle {
                ts: now - Duration::minutes(i64::try_from(limit - i).unwrap_or(0)),
                open: last,
                high: last,
                low: last,
                close: last,
                volume: Decimal::ZERO,
            })
            .collect())
    }

    async fn place_order(&self, request: &PlaceOrderRequest) -> Result<AdapterOrder, AdapterError> {
        let id = format!("paper-{}", Uuid::new_v4());
        let last = self.tickers.read().get(&request.symbol).map(|t| t.last);

        let (status, filled, price) = match request.order_type {
            OrderType::Market => (
                "closed".to_string(),
                request.amount,
                request.price.or(last),
            ),
            OrderType::Limit => ("new".to_string(), Decimal::ZERO, request.price),
        };

        let order = AdapterOrder {
            id: Some(id.clone()),
            status: Some(status.clone()),
            symbol: Some(request.symbol.clone()),
            side: Some(request.side),
            amount: Some(request.amount),
            filled: Some(filled),
            price,
            raw: json!({
                "venue": "paper",
                "id": id,
                "status": status,
            }),
        };

        self.orders.write().insert(id, order.clone());
        Ok(order)
    }

    async fn cancel_order(&self, order_id: &str) -> Result<AdapterOrder, AdapterError> {
        let mut orders = self.orders.write();
        let order = orders
            .get_mut(order_id)
            .ok_or_else(|| AdapterError::NotFound {
                order_id: order_id.to_string(),
            })?;

        if matches!(order.status.as_deref(), Some("closed" | "canceled")) {
            return Err(AdapterError::Rejected {
                reason: format!("order {order_id} already terminal"),
            });
        }

        order.status = Some("canceled".to_string());
        Ok(order.clone())
    }

    async fn fetch_order(&self, order_id: &str) -> Result<AdapterOrder, AdapterError> {
        self.orders
            .read()
            .get(order_id)
            .cloned()
            .ok_or_else(|| AdapterError::NotFound {
                order_id: order_id.to_string(),
            })
    }

    async fn fetch_open_orders(
        &self,
        symbol: Option<&str>,
    ) -> Result<Vec<AdapterOrder>, AdapterError> {
        Ok(self
            .orders
            .read()
            .values()
            .filter(|o| matches!(o.status.as_deref(), Some("new" | "open")))
            .filter(|o| symbol.is_none() || o.symbol.as_deref() == symbol)
            .cloned()
            .collect())
    }
}
