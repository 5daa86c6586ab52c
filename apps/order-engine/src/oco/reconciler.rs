//! Background OCO reconciliation loop.
//!
//! Runs [`OcoManager::reconcile_orders`] on a fixed interval until cancelled.
//! The loop blocks on an interval tick raced against the shutdown token
//! rather than busy-waiting, and a failing pass never kills the loop (the
//! manager swallows per-pair errors internally).

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::OcoManager;
use crate::adapter::ExchangeAdapter;

/// Periodic driver for OCO reconciliation.
///
/// `start` and `stop` are both idempotent; once stopped the reconciler stays
/// stopped (construct a new one to resume).
pub struct Reconciler<A: ExchangeAdapter + 'static> {
    manager: Arc<OcoManager<A>>,
    interval: Duration,
    token: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl<A: ExchangeAdapter + 'static> Reconciler<A> {
    /// Create a reconciler over the shared manager.
    #[must_use]
    pub fn new(manager: Arc<OcoManager<A>>, interval: Duration) -> Self {
        Self {
            manager,
            interval,
            token: CancellationToken::new(),
            handle: Mutex::new(None),
        }
    }

    /// Start the loop. Calling again while running is a no-op.
    pub fn start(&self) {
        let mut guard = self.handle.lock();
        if guard.is_some() {
            debug!("reconciler already running");
            return;
        }

        let manager = Arc::clone(&self.manager);
        let token = self.token.clone();
        let period = self.interval;

        info!(interval_ms = period.as_millis() as u64, "starting oco reconciler");
        *guard = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        manager.reconcile_orders().await;
                    }
                    () = token.cancelled() => {
                        info!("oco reconciler shutting down");
                        break;
                    }
                }
            }
        }));
    }

    /// Stop the loop, waiting up to `timeout` for the task to finish.
    ///
    /// Best-effort: proceeds regardless of the join outcome. Safe to call
    /// repeatedly and before `start`.
    pub async fn stop(&self, timeout: Duration) {
        self.token.cancel();

        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if tokio::time::timeout(timeout, handle).await.is_err() {
                warn!("reconciler did not stop within timeout");
            }
        }
    }

    /// True while the background task is tracked.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.handle.lock().is_some()
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;
    use crate::adapter::PaperExchange;
    use crate::broker::{Broker, RetryPolicy};
    use crate::models::{OrderSide, PlaceOrderRequest};
    use crate::store::MemoryOrderStore;

    fn setup() -> (Arc<PaperExchange>, Arc<OcoManager<PaperExchange>>) {
        let exchange = Arc::new(PaperExchange::new());
        exchange.set_ticker("BTC/USDT", dec!(99), dec!(101), dec!(100));
        let broker = Arc::new(
            Broker::new(Arc::clone(&exchange), Arc::new(MemoryOrderStore::new()))
                .with_policy(RetryPolicy::fast()),
        );
        (exchange, Arc::new(OcoManager::new(broker)))
    }

    #[tokio::test]
    async fn loop_resolves_pairs_in_background() {
        let (exchange, manager) = setup();
        let reconciler = Reconciler::new(Arc::clone(&manager), Duration::from_millis(20));

        let pair = manager
            .place_oco(
                &PlaceOrderRequest::limit("BTC/USDT".to_string(), OrderSide::Sell, dec!(1), dec!(120)),
                &PlaceOrderRequest::limit("BTC/USDT".to_string(), OrderSide::Sell, dec!(1), dec!(80)),
            )
            .await
            .unwrap();

        reconciler.start();
        exchange.fill_order(&pair.primary_id);

        // A couple of intervals is plenty.
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(manager.pair_count(), 0);

        reconciler.stop(Duration::from_secs(1)).await;
        assert!(!reconciler.is_running());
    }

    #[tokio::test]
    async fn start_and_stop_are_idempotent() {
        let (_exchange, manager) = setup();
        let reconciler = Reconciler::new(manager, Duration::from_millis(50));

        reconciler.start();
        reconciler.start();
        assert!(reconciler.is_running());

        reconciler.stop(Duration::from_secs(1)).await;
        reconciler.stop(Duration::from_secs(1)).await;
        assert!(!reconciler.is_running());
    }

    #[tokio::test]
    async fn stop_before_start_is_safe() {
        let (_exchange, manager) = setup();
        let reconciler = Reconciler::new(manager, Duration::from_millis(50));
        reconciler.stop(Duration::from_millis(100)).await;
        assert!(!reconciler.is_running());
    }
}
