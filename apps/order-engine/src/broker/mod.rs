//! Broker: the only component allowed to call an adapter's mutating methods.
//!
//! Wraps one [`ExchangeAdapter`] and one [`OrderStore`], adding retry with
//! exponential backoff, response normalization, and best-effort persistence
//! around every order operation. A dry-run mode bypasses the live adapter
//! entirely and persists synthetic orders so downstream code and tests can
//! exercise the full pipeline with no network calls.

use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::adapter::{AdapterError, AdapterOrder, ExchangeAdapter};
use crate::models::{Order, OrderSide, OrderStatus, OrderType, PlaceOrderRequest};
use crate::store::{OrderStore, StoreError};

pub mod retry;

pub use retry::{Backoff, RetryPolicy};

/// Broker-level errors.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The adapter kept failing until the retry budget ran out.
    #[error("adapter call failed after {attempts} attempt(s): {source}")]
    Adapter {
        /// Number of adapter invocations made.
        attempts: u32,
        /// The last adapter error.
        #[source]
        source: AdapterError,
    },

    /// Local store failure on a read path.
    ///
    /// Write failures during placement never surface here - an order that
    /// succeeded at the exchange must not be "lost" because local
    /// persistence hiccuped.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Order router with retry, normalization, and persistence.
pub struct Broker<A: ExchangeAdapter> {
    adapter: Arc<A>,
    store: Arc<dyn OrderStore>,
    policy: RetryPolicy,
    dry_run: bool,
}

impl<A: ExchangeAdapter> Broker<A> {
    /// Create a broker over an adapter and a store with the default retry
    /// policy, live mode.
    #[must_use]
    pub fn new(adapter: Arc<A>, store: Arc<dyn OrderStore>) -> Self {
        Self {
            adapter,
            store,
            policy: RetryPolicy::default(),
            dry_run: false,
        }
    }

    /// Override the retry policy.
    #[must_use]
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Enable or disable dry-run mode.
    #[must_use]
    pub const fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Whether this broker simulates placement locally.
    #[must_use]
    pub const fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    /// The underlying adapter.
    #[must_use]
    pub const fn adapter(&self) -> &Arc<A> {
        &self.adapter
    }

    /// The shared order store.
    #[must_use]
    pub fn store(&self) -> Arc<dyn OrderStore> {
        Arc::clone(&self.store)
    }

    /// Establish the exchange session.
    ///
    /// # Errors
    ///
    /// Returns the adapter's connection error unchanged (no retry - a broken
    /// session is worth surfacing immediately).
    pub async fn connect(&self) -> Result<bool, BrokerError> {
        self.adapter
            .connect()
            .await
            .map_err(|source| BrokerError::Adapter {
                attempts: 1,
                source,
            })
    }

    /// Place an order, retrying transient adapter failures.
    ///
    /// In dry-run mode no adapter call is made: a synthetic id is assigned
    /// and a `dry_run` order is persisted. Dry-run never deduplicates -
    /// identical requests produce distinct records.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Adapter`] once the retry budget is exhausted.
    /// Store write failures are logged and swallowed.
    pub async fn place_order(&self, request: &PlaceOrderRequest) -> Result<Order, BrokerError> {
        if self.dry_run {
            let order = self.dry_run_order(request);
            info!(
                order_id = %order.id,
                symbol = %order.symbol,
                side = %order.side,
                "dry-run order recorded"
            );
            self.persist_best_effort(&order);
            return Ok(order);
        }

        let ack = self
            .with_retry("place_order", || self.adapter.place_order(request))
            .await?;
        let order = self.normalize_placement(ack, request);

        info!(
            order_id = %order.id,
            symbol = %order.symbol,
            side = %order.side,
            status = %order.status,
            "order placed"
        );
        self.persist_best_effort(&order);
        Ok(order)
    }

    /// Fetch one order: adapter first, store fallback on adapter failure.
    ///
    /// Fresh adapter state is persisted back to the store.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Store`] only when the adapter already failed
    /// and the store lookup failed too.
    pub async fn fetch_order(&self, order_id: &str) -> Result<Option<Order>, BrokerError> {
        match self.adapter.fetch_order(order_id).await {
            Ok(ack) => {
                let existing = self.store.get(order_id).ok().flatten();
                let order = self.normalize_refresh(ack, Some(order_id), existing);
                self.persist_best_effort(&order);
                Ok(Some(order))
            }
            Err(err) => {
                debug!(order_id, error = %err, "adapter fetch failed, using store");
                Ok(self.store.get(order_id)?)
            }
        }
    }

    /// Fetch open orders, persisting newly seen records.
    ///
    /// Falls back to the store's active set when the adapter call fails or
    /// the adapter lacks the capability.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Store`] when both the adapter and the store
    /// fail.
    pub async fn fetch_open_orders(
        &self,
        symbol: Option<&str>,
    ) -> Result<Vec<Order>, BrokerError> {
        match self.adapter.fetch_open_orders(symbol).await {
            Ok(acks) => {
                let orders: Vec<Order> = acks
                    .into_iter()
                    .map(|ack| {
                        let existing = ack
                            .id
                            .as_deref()
                            .and_then(|id| self.store.get(id).ok().flatten());
                        self.normalize_refresh(ack, None, existing)
                    })
                    .collect();
                for order in &orders {
                    self.persist_best_effort(order);
                }
                Ok(orders)
            }
            Err(err) => {
                debug!(error = %err, "adapter fetch_open_orders failed, using store");
                Ok(self.store.open_orders(symbol)?)
            }
        }
    }

    /// Cancel an order, retrying transient adapter failures.
    ///
    /// The stored status defaults to `cancelled` when the adapter's ack is
    /// ambiguous about the resulting state.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Adapter`] once the retry budget is exhausted.
    pub async fn cancel_order(&self, order_id: &str) -> Result<Order, BrokerError> {
        let ack = self
            .with_retry("cancel_order", || self.adapter.cancel_order(order_id))
            .await?;

        let status = ack
            .status
            .as_deref()
            .map(OrderStatus::from_exchange)
            .filter(|s| *s != OrderStatus::Unknown)
            .unwrap_or(OrderStatus::Cancelled);

        let existing = self.store.get(order_id).ok().flatten();
        let mut order = self.normalize_refresh(ack, Some(order_id), existing);
        order.status = status;

        info!(order_id = %order.id, status = %order.status, "order cancelled");
        self.persist_best_effort(&order);
        Ok(order)
    }

    /// One-shot refresh-and-persist of a single order.
    ///
    /// Tolerant of adapter absence: any adapter failure yields `None` rather
    /// than an error, leaving the stored record untouched.
    pub async fn reconcile_order(&self, order_id: &str) -> Option<Order> {
        match self.adapter.fetch_order(order_id).await {
            Ok(ack) => {
                let existing = self.store.get(order_id).ok().flatten();
                let order = self.normalize_refresh(ack, Some(order_id), existing);
                self.persist_best_effort(&order);
                Some(order)
            }
            Err(err) => {
                debug!(order_id, error = %err, "reconcile fetch failed");
                None
            }
        }
    }

    /// Run an adapter call under the retry policy.
    ///
    /// Exactly `max_attempts` invocations are made before the last error
    /// propagates.
    async fn with_retry<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, BrokerError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, AdapterError>>,
    {
        let mut backoff = Backoff::new(&self.policy);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    warn!(attempt, error = %err, "{what} attempt failed");
                    match backoff.next_backoff() {
                        Some(delay) if attempt < self.policy.max_attempts => {
                            tokio::time::sleep(delay).await;
                        }
                        _ => {
                            return Err(BrokerError::Adapter {
                                attempts: attempt,
                                source: err,
                            });
                        }
                    }
                }
            }
        }
    }

    /// Build a synthetic order record for dry-run mode.
    fn dry_run_order(&self, request: &PlaceOrderRequest) -> Order {
        let now = Utc::now();
        Order {
            id: format!("dry-{}", Uuid::new_v4()),
            symbol: request.symbol.clone(),
            side: request.side,
            amount: request.amount,
            filled: Decimal::ZERO,
            price: request.price,
            status: OrderStatus::DryRun,
            order_type: request.order_type,
            strategy: request.strategy.clone(),
            raw: serde_json::json!({ "dry_run": true }),
            created_at: now,
            updated_at: now,
        }
    }

    /// Normalize a placement ack against the originating request.
    ///
    /// Missing fields are backfilled from the request; a missing id becomes a
    /// synthetic uuid; a missing status means "submitted".
    fn normalize_placement(&self, ack: AdapterOrder, request: &PlaceOrderRequest) -> Order {
        let now = Utc::now();
        Order {
            id: ack.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            symbol: ack.symbol.unwrap_or_else(|| request.symbol.clone()),
            side: ack.side.unwrap_or(request.side),
            amount: ack.amount.unwrap_or(request.amount),
            filled: ack.filled.unwrap_or(Decimal::ZERO),
            price: ack.price.or(request.price),
            status: ack
                .status
                .as_deref()
                .map_or(OrderStatus::Submitted, OrderStatus::from_exchange),
            order_type: request.order_type,
            strategy: request.strategy.clone(),
            raw: ack.raw,
            created_at: now,
            updated_at: now,
        }
    }

    /// Merge a refresh ack into the stored record (when one exists).
    fn normalize_refresh(
        &self,
        ack: AdapterOrder,
        fallback_id: Option<&str>,
        existing: Option<Order>,
    ) -> Order {
        let now = Utc::now();
        match existing {
            Some(mut order) => {
                if let Some(status) = ack.status.as_deref() {
                    order.status = OrderStatus::from_exchange(status);
                }
                if let Some(filled) = ack.filled {
                    order.filled = filled;
                }
                if let Some(price) = ack.price {
                    order.price = Some(price);
                }
                if !ack.raw.is_null() {
                    order.raw = ack.raw;
                }
                order.updated_at = now;
                order
            }
            None => Order {
                id: ack
                    .id
                    .or_else(|| fallback_id.map(str::to_string))
                    .unwrap_or_else(|| Uuid::new_v4().to_string()),
                symbol: ack.symbol.unwrap_or_default(),
                side: ack.side.unwrap_or(OrderSide::Buy),
                amount: ack.amount.unwrap_or(Decimal::ZERO),
                filled: ack.filled.unwrap_or(Decimal::ZERO),
                price: ack.price,
                status: ack
                    .status
                    .as_deref()
                    .map_or(OrderStatus::Unknown, OrderStatus::from_exchange),
                order_type: OrderType::Market,
                strategy: None,
                raw: ack.raw,
                created_at: now,
                updated_at: now,
            },
        }
    }

    /// Persist a record, logging and swallowing store failures.
    fn persist_best_effort(&self, order: &Order) {
        if let Err(err) = self.store.upsert(order) {
            warn!(order_id = %order.id, error = %err, "order persistence failed");
        }
    }
}
