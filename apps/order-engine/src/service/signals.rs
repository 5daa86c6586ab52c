//! Signal event execution.
//!
//! Translates inbound strategy/webhook events into broker, risk, OCO, and
//! TWAP calls. Processing is idempotent by `event_id` and never returns an
//! error: every failure maps to an [`EventOutcome`] with a reason string,
//! because this core has no user interface of its own - the ingestion layer
//! decides what the caller sees.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::adapter::ExchangeAdapter;
use crate::broker::Broker;
use crate::models::{OrderSide, PlaceOrderRequest, Signal, SignalEvent};
use crate::oco::OcoManager;
use crate::risk::{OpenPositionRequest, PositionSide, RiskManager};
use crate::twap::TwapRunner;

/// Result of processing one signal event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EventOutcome {
    /// A position was opened.
    Opened {
        /// Position id.
        pid: String,
        /// Entry order id.
        order_id: String,
    },
    /// A position was closed.
    Closed {
        /// Position id.
        pid: String,
        /// Closing order id (None when closing needed no order).
        order_id: Option<String>,
    },
    /// An OCO pair was placed.
    OcoPlaced {
        /// Pair id.
        oco_id: String,
        /// Primary leg order id.
        primary_id: String,
        /// Secondary leg order id.
        secondary_id: String,
    },
    /// A background TWAP job was started.
    TwapStarted {
        /// Job id.
        job_id: String,
    },
    /// The event id was already processed; nothing was done.
    Duplicate,
    /// Nothing to do for this event (e.g. exit with no open position).
    Skipped {
        /// Why the event was skipped.
        reason: String,
    },
    /// The event was refused before any order was placed.
    Rejected {
        /// Why the event was refused.
        reason: String,
    },
    /// Execution failed part-way; the reason says how far it got.
    Failed {
        /// Failure description.
        reason: String,
    },
}

/// Idempotent processor for [`SignalEvent`]s.
pub struct SignalExecutor<A: ExchangeAdapter + 'static> {
    broker: Arc<Broker<A>>,
    risk: Arc<RiskManager>,
    oco: Arc<OcoManager<A>>,
    twap: Arc<TwapRunner<A>>,
    seen: Mutex<HashSet<String>>,
}

impl<A: ExchangeAdapter + 'static> SignalExecutor<A> {
    /// Wire an executor to the engine components.
    #[must_use]
    pub fn new(
        broker: Arc<Broker<A>>,
        risk: Arc<RiskManager>,
        oco: Arc<OcoManager<A>>,
        twap: Arc<TwapRunner<A>>,
    ) -> Self {
        Self {
            broker,
            risk,
            oco,
            twap,
            seen: Mutex::new(HashSet::new()),
        }
    }

    /// Process one event.
    ///
    /// Events carrying an `event_id` are processed at most once; a repeat of
    /// an already-seen id acknowledges as [`EventOutcome::Duplicate`] with no
    /// side effects, whatever the first processing's outcome was.
    pub async fn process(&self, event: &SignalEvent) -> EventOutcome {
        if let Some(event_id) = &event.event_id {
            if !self.seen.lock().insert(event_id.clone()) {
                debug!(event_id, "duplicate event acknowledged");
                return EventOutcome::Duplicate;
            }
        }

        if let Some(oco) = &event.oco {
            return match self.oco.place_oco(&oco.primary, &oco.secondary).await {
                Ok(pair) => EventOutcome::OcoPlaced {
                    oco_id: pair.oco_id,
                    primary_id: pair.primary_id,
                    secondary_id: pair.secondary_id,
                },
                Err(err) => EventOutcome::Failed {
                    reason: err.to_string(),
                },
            };
        }

        if let Some(twap) = &event.twap {
            return match self.twap.start_job(twap) {
                Ok(job_id) => EventOutcome::TwapStarted { job_id },
                Err(err) => EventOutcome::Rejected {
                    reason: err.to_string(),
                },
            };
        }

        match event.signal {
            Signal::Buy => self.open(event, PositionSide::Long, OrderSide::Buy).await,
            Signal::Short => self.open(event, PositionSide::Short, OrderSide::Sell).await,
            Signal::Sell | Signal::Exit => self.close(event).await,
        }
    }

    /// Position id for an event: one position per symbol+strategy.
    fn pid_for(event: &SignalEvent) -> String {
        format!(
            "{}:{}",
            event.symbol,
            event.strategy.as_deref().unwrap_or("default")
        )
    }

    async fn open(
        &self,
        event: &SignalEvent,
        position_side: PositionSide,
        order_side: OrderSide,
    ) -> EventOutcome {
        let Some(amount) = event.amount else {
            return EventOutcome::Rejected {
                reason: "amount is required for entry signals".to_string(),
            };
        };

        let pid = Self::pid_for(event);
        if self.risk.get_position(&pid).is_some() {
            return EventOutcome::Skipped {
                reason: format!("position {pid} already open"),
            };
        }
        if !self.risk.can_open_new() {
            return EventOutcome::Rejected {
                reason: "max concurrent deals reached".to_string(),
            };
        }

        let mut request = PlaceOrderRequest::market(event.symbol.clone(), order_side, amount);
        if let Some(strategy) = &event.strategy {
            request = request.with_strategy(strategy.clone());
        }

        let order = match self.broker.place_order(&request).await {
            Ok(order) => order,
            Err(err) => {
                return EventOutcome::Failed {
                    reason: format!("entry order failed: {err}"),
                };
            }
        };

        let Some(entry_price) = order.price.or(event.price) else {
            return EventOutcome::Failed {
                reason: format!(
                    "order {} placed but no entry price available to track the position",
                    order.id
                ),
            };
        };

        let mut open = OpenPositionRequest::new(pid.clone(), position_side, entry_price, amount);
        if let Some(strategy) = &event.strategy {
            open = open.with_strategy(strategy.clone());
        }

        match self.risk.open_position(open) {
            Ok(position) => {
                info!(
                    pid = %position.pid,
                    order_id = %order.id,
                    stop = %position.stop,
                    "entry executed"
                );
                EventOutcome::Opened {
                    pid,
                    order_id: order.id,
                }
            }
            Err(err) => {
                // The order is live/persisted; the position just isn't
                // tracked. Surface loudly.
                warn!(pid = %pid, order_id = %order.id, error = %err, "entry untracked");
                EventOutcome::Failed {
                    reason: format!("order {} placed but position not tracked: {err}", order.id),
                }
            }
        }
    }

    async fn close(&self, event: &SignalEvent) -> EventOutcome {
        let pid = Self::pid_for(event);
        let Some(position) = self.risk.close_position(&pid) else {
            return EventOutcome::Skipped {
                reason: format!("no open position for {pid}"),
            };
        };

        let closing_side = match position.side {
            PositionSide::Long => OrderSide::Sell,
            PositionSide::Short => OrderSide::Buy,
        };

        let mut request =
            PlaceOrderRequest::market(event.symbol.clone(), closing_side, position.amount);
        if let Some(strategy) = &position.strategy {
            request = request.with_strategy(strategy.clone());
        }

        match self.broker.place_order(&request).await {
            Ok(order) => {
                info!(pid = %pid, order_id = %order.id, "exit executed");
                EventOutcome::Closed {
                    pid,
                    order_id: Some(order.id),
                }
            }
            Err(err) => EventOutcome::Failed {
                reason: format!("position {pid} untracked but close order failed: {err}"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;
    use crate::adapter::PaperExchange;
    use crate::broker::RetryPolicy;
    use crate::models::TwapRequest;
    use crate::risk::RiskConfig;
    use crate::store::MemoryOrderStore;
    use crate::store::OrderStore;

    fn executor(max_deals: usize) -> (Arc<MemoryOrderStore>, SignalExecutor<PaperExchange>) {
        let exchange = Arc::new(PaperExchange::new());
        exchange.set_ticker("BTC/USDT", dec!(99), dec!(101), dec!(100));
        exchange.set_ticker("ETH/USDT", dec!(2990), dec!(3010), dec!(3000));

        let store = Arc::new(MemoryOrderStore::new());
        let broker = Arc::new(
            Broker::new(exchange, Arc::clone(&store) as Arc<dyn crate::store::OrderStore>)
                .with_policy(RetryPolicy::fast()),
        );
        let risk = Arc::new(
            RiskManager::new(RiskConfig {
                max_concurrent_deals: max_deals,
                ..RiskConfig::default()
            })
            .unwrap(),
        );
        let oco = Arc::new(OcoManager::new(Arc::clone(&broker)));
        let twap = Arc::new(TwapRunner::new(Arc::clone(&broker)).with_policy(RetryPolicy::fast()));

        (store, SignalExecutor::new(broker, risk, oco, twap))
    }

    fn buy_event(event_id: &str) -> SignalEvent {
        SignalEvent::new(Signal::Buy, "BTC/USDT".to_string())
            .with_amount(dec!(100))
            .with_event_id(event_id)
    }

    #[tokio::test]
    async fn buy_opens_a_tracked_position() {
        let (store, executor) = executor(3);

        let outcome = executor.process(&buy_event("evt-1")).await;
        let EventOutcome::Opened { pid, order_id } = outcome else {
            panic!("expected opened, got {outcome:?}");
        };

        assert_eq!(pid, "BTC/USDT:default");
        assert!(store.get(&order_id).unwrap().is_some());
        assert!(executor.risk.get_position(&pid).is_some());
        // Entry at the paper last price with the default 5% trail.
        assert_eq!(executor.risk.get_position(&pid).unwrap().stop, dec!(95.00));
    }

    #[tokio::test]
    async fn duplicate_event_id_has_no_side_effects() {
        let (store, executor) = executor(3);

        let first = executor.process(&buy_event("evt-1")).await;
        assert!(matches!(first, EventOutcome::Opened { .. }));
        let orders_after_first = store.len();

        let second = executor.process(&buy_event("evt-1")).await;
        assert_eq!(second, EventOutcome::Duplicate);
        assert_eq!(store.len(), orders_after_first);
    }

    #[tokio::test]
    async fn entry_without_amount_is_rejected() {
        let (store, executor) = executor(3);
        let event = SignalEvent::new(Signal::Buy, "BTC/USDT".to_string());

        let outcome = executor.process(&event).await;
        assert!(matches!(outcome, EventOutcome::Rejected { .. }));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn capacity_rejection_places_no_order() {
        let (store, executor) = executor(1);

        executor.process(&buy_event("evt-1")).await;
        let orders_after_first = store.len();

        let event = SignalEvent::new(Signal::Buy, "ETH/USDT".to_string())
            .with_amount(dec!(50))
            .with_event_id("evt-2");
        let outcome = executor.process(&event).await;

        assert!(matches!(outcome, EventOutcome::Rejected { .. }));
        assert_eq!(store.len(), orders_after_first);
    }

    #[tokio::test]
    async fn repeated_entry_for_open_position_is_skipped() {
        let (_store, executor) = executor(3);

        executor.process(&buy_event("evt-1")).await;
        let outcome = executor.process(&buy_event("evt-2")).await;
        assert!(matches!(outcome, EventOutcome::Skipped { .. }));
    }

    #[tokio::test]
    async fn exit_closes_and_places_flipped_order() {
        let (store, executor) = executor(3);
        executor.process(&buy_event("evt-1")).await;

        let exit = SignalEvent::new(Signal::Exit, "BTC/USDT".to_string()).with_event_id("evt-2");
        let outcome = executor.process(&exit).await;

        let EventOutcome::Closed { pid, order_id } = outcome else {
            panic!("expected closed, got {outcome:?}");
        };
        assert_eq!(pid, "BTC/USDT:default");
        assert!(executor.risk.get_position(&pid).is_none());

        let closing = store.get(&order_id.unwrap()).unwrap().unwrap();
        assert_eq!(closing.side, OrderSide::Sell);
    }

    #[tokio::test]
    async fn exit_without_position_is_skipped() {
        let (_store, executor) = executor(3);
        let exit = SignalEvent::new(Signal::Exit, "BTC/USDT".to_string());
        let outcome = executor.process(&exit).await;
        assert!(matches!(outcome, EventOutcome::Skipped { .. }));
    }

    #[tokio::test]
    async fn oco_sub_object_routes_to_the_pair_manager() {
        let (_store, executor) = executor(3);
        let mut event = SignalEvent::new(Signal::Buy, "BTC/USDT".to_string());
        event.oco = Some(crate::models::OcoRequest {
            primary: PlaceOrderRequest::limit(
                "BTC/USDT".to_string(),
                OrderSide::Sell,
                dec!(1),
                dec!(120),
            ),
            secondary: PlaceOrderRequest::limit(
                "BTC/USDT".to_string(),
                OrderSide::Sell,
                dec!(1),
                dec!(80),
            ),
        });

        let outcome = executor.process(&event).await;
        assert!(matches!(outcome, EventOutcome::OcoPlaced { .. }));
        assert_eq!(executor.oco.pair_count(), 1);
    }

    #[tokio::test]
    async fn twap_sub_object_starts_a_job() {
        let (_store, executor) = executor(3);
        let mut event = SignalEvent::new(Signal::Buy, "BTC/USDT".to_string());
        event.twap = Some(TwapRequest {
            symbol: "BTC/USDT".to_string(),
            side: OrderSide::Buy,
            total_amount: dec!(1),
            slices: 2,
            duration_seconds: 0,
        });

        let outcome = executor.process(&event).await;
        let EventOutcome::TwapStarted { job_id } = outcome else {
            panic!("expected twap start, got {outcome:?}");
        };
        assert!(executor.twap.get_status(&job_id).is_some());
    }

    #[tokio::test]
    async fn invalid_twap_request_is_rejected() {
        let (_store, executor) = executor(3);
        let mut event = SignalEvent::new(Signal::Buy, "BTC/USDT".to_string());
        event.twap = Some(TwapRequest {
            symbol: "BTC/USDT".to_string(),
            side: OrderSide::Buy,
            total_amount: dec!(1),
            slices: 0,
            duration_seconds: 0,
        });

        let outcome = executor.process(&event).await;
        assert!(matches!(outcome, EventOutcome::Rejected { .. }));
    }
}
