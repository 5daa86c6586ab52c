//! One-cancels-other pair management.
//!
//! Tracks linked order pairs and enforces "at most one leg survives": when
//! either leg fills, the sibling is cancelled exactly once and the pair is
//! dropped from tracking.
//!
//! Placement is two-phase. The pair is registered only after both legs are
//! live; if the secondary leg fails after the primary succeeded, the primary
//! is cancelled best-effort and the error surfaces with the primary id so an
//! operator can still act when the rollback cancel also failed. No orphan is
//! ever left silently.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::adapter::ExchangeAdapter;
use crate::broker::{Broker, BrokerError};
use crate::models::{OrderStatus, PlaceOrderRequest};

mod reconciler;

pub use reconciler::Reconciler;

/// Errors from OCO operations.
#[derive(Debug, Error)]
pub enum OcoError {
    /// The primary leg was never placed; nothing to clean up.
    #[error("primary leg placement failed: {source}")]
    Primary {
        /// The broker failure.
        #[source]
        source: BrokerError,
    },

    /// The secondary leg failed after the primary was placed.
    ///
    /// `rolled_back` reports whether the rollback cancel of the primary
    /// succeeded; when false the primary is still live on the exchange.
    #[error(
        "secondary leg placement failed (primary {primary_id}, rolled back: {rolled_back}): {source}"
    )]
    Secondary {
        /// Id of the already-placed primary leg.
        primary_id: String,
        /// Whether the primary was successfully cancelled.
        rolled_back: bool,
        /// The broker failure.
        #[source]
        source: BrokerError,
    },
}

/// Two orders linked by cancel-on-fill semantics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcoPair {
    /// Pair id.
    pub oco_id: String,
    /// First leg order id.
    pub primary_id: String,
    /// Second leg order id.
    pub secondary_id: String,
}

/// Registry of live OCO pairs over a shared broker.
pub struct OcoManager<A: ExchangeAdapter> {
    broker: Arc<Broker<A>>,
    pairs: RwLock<HashMap<String, OcoPair>>,
}

impl<A: ExchangeAdapter> OcoManager<A> {
    /// Create a manager over the shared broker.
    #[must_use]
    pub fn new(broker: Arc<Broker<A>>) -> Self {
        Self {
            broker,
            pairs: RwLock::new(HashMap::new()),
        }
    }

    /// Place both legs and register the pair.
    ///
    /// # Errors
    ///
    /// [`OcoError::Primary`] when the first leg fails (nothing was placed);
    /// [`OcoError::Secondary`] when the second leg fails (the primary has
    /// been rolled back when `rolled_back` is true).
    pub async fn place_oco(
        &self,
        primary: &PlaceOrderRequest,
        secondary: &PlaceOrderRequest,
    ) -> Result<OcoPair, OcoError> {
        let primary_order = self
            .broker
            .place_order(primary)
            .await
            .map_err(|source| OcoError::Primary { source })?;

        let secondary_order = match self.broker.place_order(secondary).await {
            Ok(order) => order,
            Err(source) => {
                warn!(
                    primary_id = %primary_order.id,
                    error = %source,
                    "secondary leg failed, rolling back primary"
                );
                let rolled_back = self.broker.cancel_order(&primary_order.id).await.is_ok();
                return Err(OcoError::Secondary {
                    primary_id: primary_order.id,
                    rolled_back,
                    source,
                });
            }
        };

        let pair = OcoPair {
            oco_id: format!("oco-{}", Uuid::new_v4()),
            primary_id: primary_order.id,
            secondary_id: secondary_order.id,
        };

        info!(
            oco_id = %pair.oco_id,
            primary_id = %pair.primary_id,
            secondary_id = %pair.secondary_id,
            "oco pair placed"
        );
        self.pairs
            .write()
            .insert(pair.oco_id.clone(), pair.clone());
        Ok(pair)
    }

    /// Resolve every tracked pair against current exchange state.
    ///
    /// A filled leg cancels its sibling (cancel failures are logged and
    /// swallowed; the pair is dropped regardless so the cancel is attempted
    /// at most once). Pairs whose legs are both terminal are dropped without
    /// action. Pairs whose legs cannot be fetched this pass are retained for
    /// the next one. Never fails: one bad pair must not kill the loop.
    pub async fn reconcile_orders(&self) {
        let snapshot: Vec<OcoPair> = self.pairs.read().values().cloned().collect();

        for pair in snapshot {
            let primary = self.fetch_leg(&pair.primary_id).await;
            let secondary = self.fetch_leg(&pair.secondary_id).await;

            let (Some(primary), Some(secondary)) = (primary, secondary) else {
                debug!(oco_id = %pair.oco_id, "leg state unavailable, keeping pair");
                continue;
            };

            if primary.is_terminal() && secondary.is_terminal() {
                debug!(oco_id = %pair.oco_id, "both legs terminal, dropping pair");
                self.drop_pair(&pair.oco_id);
            } else if primary.is_filled() && secondary != OrderStatus::Cancelled {
                self.cancel_sibling(&pair, &pair.secondary_id).await;
            } else if secondary.is_filled() && primary != OrderStatus::Cancelled {
                self.cancel_sibling(&pair, &pair.primary_id).await;
            }
        }
    }

    /// Snapshot of the tracked pairs.
    #[must_use]
    pub fn active_pairs(&self) -> Vec<OcoPair> {
        self.pairs.read().values().cloned().collect()
    }

    /// Number of tracked pairs.
    #[must_use]
    pub fn pair_count(&self) -> usize {
        self.pairs.read().len()
    }

    /// The shared broker.
    #[must_use]
    pub fn broker(&self) -> Arc<Broker<A>> {
        Arc::clone(&self.broker)
    }

    async fn fetch_leg(&self, order_id: &str) -> Option<OrderStatus> {
        match self.broker.fetch_order(order_id).await {
            Ok(Some(order)) => Some(order.status),
            Ok(None) => None,
            Err(err) => {
                warn!(order_id, error = %err, "leg fetch failed");
                None
            }
        }
    }

    async fn cancel_sibling(&self, pair: &OcoPair, sibling_id: &str) {
        info!(
            oco_id = %pair.oco_id,
            sibling_id,
            "leg filled, cancelling sibling"
        );
        if let Err(err) = self.broker.cancel_order(sibling_id).await {
            // Attempted exactly once; the pair is dropped either way.
            warn!(oco_id = %pair.oco_id, sibling_id, error = %err, "sibling cancel failed");
        }
        self.drop_pair(&pair.oco_id);
    }

    fn drop_pair(&self, oco_id: &str) {
        self.pairs.write().remove(oco_id);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use rust_decimal_macros::dec;

    use super::*;
    use crate::adapter::{AdapterError, AdapterOrder, PaperExchange, Ticker};
    use crate::broker::RetryPolicy;
    use crate::models::OrderSide;
    use crate::store::MemoryOrderStore;

    fn paper_manager() -> (Arc<PaperExchange>, OcoManager<PaperExchange>) {
        let exchange = Arc::new(PaperExchange::new());
        exchange.set_ticker("BTC/USDT", dec!(99), dec!(101), dec!(100));
        let broker = Arc::new(
            Broker::new(
                Arc::clone(&exchange),
                Arc::new(MemoryOrderStore::new()),
            )
            .with_policy(RetryPolicy::fast()),
        );
        (exchange, OcoManager::new(broker))
    }

    fn limit(side: OrderSide, price: rust_decimal::Decimal) -> PlaceOrderRequest {
        PlaceOrderRequest::limit("BTC/USDT".to_string(), side, dec!(1), price)
    }

    #[tokio::test]
    async fn filled_primary_cancels_secondary() {
        let (exchange, manager) = paper_manager();
        let pair = manager
            .place_oco(&limit(OrderSide::Sell, dec!(120)), &limit(OrderSide::Sell, dec!(80)))
            .await
            .unwrap();
        assert_eq!(manager.pair_count(), 1);

        exchange.fill_order(&pair.primary_id);
        manager.reconcile_orders().await;

        assert_eq!(manager.pair_count(), 0);
        let sibling = manager
            .broker()
            .fetch_order(&pair.secondary_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(sibling.status, OrderStatus::Cancelled);
    }

    #[tokio::test]
    async fn filled_secondary_cancels_primary() {
        let (exchange, manager) = paper_manager();
        let pair = manager
            .place_oco(&limit(OrderSide::Sell, dec!(120)), &limit(OrderSide::Sell, dec!(80)))
            .await
            .unwrap();

        exchange.fill_order(&pair.secondary_id);
        manager.reconcile_orders().await;

        assert_eq!(manager.pair_count(), 0);
        let sibling = manager
            .broker()
            .fetch_order(&pair.primary_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(sibling.status, OrderStatus::Cancelled);
    }

    #[tokio::test]
    async fn both_terminal_drops_pair_without_cancel() {
        let (exchange, manager) = paper_manager();
        let pair = manager
            .place_oco(&limit(OrderSide::Sell, dec!(120)), &limit(OrderSide::Sell, dec!(80)))
            .await
            .unwrap();

        exchange.fill_order(&pair.primary_id);
        exchange.fill_order(&pair.secondary_id);
        manager.reconcile_orders().await;

        // Both legs already terminal: no cancel race, pair simply dropped.
        assert_eq!(manager.pair_count(), 0);
        let sibling = manager
            .broker()
            .fetch_order(&pair.secondary_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(sibling.status, OrderStatus::Closed);
    }

    #[tokio::test]
    async fn active_legs_keep_the_pair() {
        let (_exchange, manager) = paper_manager();
        manager
            .place_oco(&limit(OrderSide::Sell, dec!(120)), &limit(OrderSide::Sell, dec!(80)))
            .await
            .unwrap();

        manager.reconcile_orders().await;
        assert_eq!(manager.pair_count(), 1);
    }

    /// Paper exchange wrapper whose placements fail from the second call on.
    struct SecondPlacementFails {
        inner: PaperExchange,
        placements: AtomicU32,
    }

    #[async_trait]
    impl ExchangeAdapter for SecondPlacementFails {
        async fn fetch_ticker(&self, symbol: &str) -> Result<Ticker, AdapterError> {
            self.inner.fetch_ticker(symbol).await
        }

        async fn place_order(
            &self,
            request: &PlaceOrderRequest,
        ) -> Result<AdapterOrder, AdapterError> {
            if self.placements.fetch_add(1, Ordering::SeqCst) >= 1 {
                return Err(AdapterError::Rejected {
                    reason: "insufficient balance".to_string(),
                });
            }
            self.inner.place_order(request).await
        }

        async fn cancel_order(&self, order_id: &str) -> Result<AdapterOrder, AdapterError> {
            self.inner.cancel_order(order_id).await
        }

        async fn fetch_order(&self, order_id: &str) -> Result<AdapterOrder, AdapterError> {
            self.inner.fetch_order(order_id).await
        }
    }

    #[tokio::test]
    async fn secondary_failure_rolls_back_primary() {
        let exchange = Arc::new(SecondPlacementFails {
            inner: PaperExchange::new(),
            placements: AtomicU32::new(0),
        });
        let broker = Arc::new(
            Broker::new(Arc::clone(&exchange), Arc::new(MemoryOrderStore::new()))
                .with_policy(RetryPolicy::fast()),
        );
        let manager = OcoManager::new(broker);

        let err = manager
            .place_oco(&limit(OrderSide::Sell, dec!(120)), &limit(OrderSide::Sell, dec!(80)))
            .await
            .unwrap_err();

        let OcoError::Secondary {
            primary_id,
            rolled_back,
            ..
        } = err
        else {
            panic!("expected secondary failure");
        };

        assert!(rolled_back);
        assert_eq!(manager.pair_count(), 0);
        let primary = exchange.inner.fetch_order(&primary_id).await.unwrap();
        assert_eq!(primary.status.as_deref(), Some("canceled"));
    }
}
