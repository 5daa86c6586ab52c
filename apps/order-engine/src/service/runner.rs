//! Top-level service runner.
//!
//! The composition root: builds the broker, risk manager, OCO manager,
//! reconciler, TWAP runner, and signal executor from one adapter + store +
//! config, owns the adapter's session lifecycle, and drives the background
//! loops. There is no global state anywhere in the engine - everything hangs
//! off this object.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::{info, warn};

use crate::adapter::ExchangeAdapter;
use crate::broker::{Broker, BrokerError};
use crate::config::EngineConfig;
use crate::models::SignalEvent;
use crate::oco::{OcoManager, Reconciler};
use crate::risk::{RiskError, RiskManager};
use crate::service::signals::{EventOutcome, SignalExecutor};
use crate::store::{OrderStore, PositionStore};
use crate::twap::TwapRunner;

/// Daemon composing the engine's background services.
pub struct ServiceRunner<A: ExchangeAdapter + 'static> {
    broker: Arc<Broker<A>>,
    risk: Arc<RiskManager>,
    oco: Arc<OcoManager<A>>,
    reconciler: Reconciler<A>,
    twap: Arc<TwapRunner<A>>,
    signals: SignalExecutor<A>,
    started: AtomicBool,
}

impl<A: ExchangeAdapter + 'static> ServiceRunner<A> {
    /// Wire the engine together.
    ///
    /// `position_store` optionally persists the risk manager's live set
    /// (single writer per store file).
    ///
    /// # Errors
    ///
    /// Returns [`RiskError::InvalidConfig`] when the risk configuration is
    /// rejected.
    pub fn new(
        adapter: Arc<A>,
        order_store: Arc<dyn OrderStore>,
        position_store: Option<Arc<dyn PositionStore>>,
        config: &EngineConfig,
    ) -> Result<Self, RiskError> {
        let broker = Arc::new(
            Broker::new(adapter, order_store)
                .with_policy(config.broker.retry.clone())
                .with_dry_run(config.broker.dry_run),
        );

        let mut risk = RiskManager::new(config.risk.clone())?;
        if let Some(store) = position_store {
            risk = risk.with_store(store);
        }
        let risk = Arc::new(risk);

        let oco = Arc::new(OcoManager::new(Arc::clone(&broker)));
        let reconciler = Reconciler::new(Arc::clone(&oco), config.oco.interval());
        let twap =
            Arc::new(TwapRunner::new(Arc::clone(&broker)).with_policy(config.twap.retry.clone()));
        let signals = SignalExecutor::new(
            Arc::clone(&broker),
            Arc::clone(&risk),
            Arc::clone(&oco),
            Arc::clone(&twap),
        );

        Ok(Self {
            broker,
            risk,
            oco,
            reconciler,
            twap,
            signals,
            started: AtomicBool::new(false),
        })
    }

    /// Connect the adapter, restore persisted positions, and start the
    /// background loops. Calling again while running is a no-op.
    ///
    /// # Errors
    ///
    /// Returns the broker's connection error; the runner stays stopped.
    pub async fn start(&self) -> Result<(), BrokerError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if let Err(err) = self.broker.connect().await {
            self.started.store(false, Ordering::SeqCst);
            return Err(err);
        }

        match self.risk.restore() {
            Ok(count) if count > 0 => info!(count, "resumed persisted positions"),
            Ok(_) => {}
            Err(err) => warn!(error = %err, "position restore failed, starting empty"),
        }

        self.reconciler.start();
        info!(dry_run = self.broker.is_dry_run(), "service runner started");
        Ok(())
    }

    /// Stop the background loops, waiting up to `timeout` for each.
    ///
    /// Best-effort shutdown: proceeds regardless of join outcomes.
    /// Idempotent.
    pub async fn stop(&self, timeout: Duration) {
        self.reconciler.stop(timeout).await;
        self.twap.shutdown(timeout).await;
        self.started.store(false, Ordering::SeqCst);
        info!("service runner stopped");
    }

    /// True while the background loops are running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Process one inbound signal event.
    pub async fn process_event(&self, event: &SignalEvent) -> EventOutcome {
        self.signals.process(event).await
    }

    /// The shared broker.
    #[must_use]
    pub fn broker(&self) -> Arc<Broker<A>> {
        Arc::clone(&self.broker)
    }

    /// The risk manager query surface.
    #[must_use]
    pub fn risk(&self) -> Arc<RiskManager> {
        Arc::clone(&self.risk)
    }

    /// The OCO pair manager.
    #[must_use]
    pub fn oco(&self) -> Arc<OcoManager<A>> {
        Arc::clone(&self.oco)
    }

    /// The TWAP job runner.
    #[must_use]
    pub fn twap(&self) -> Arc<TwapRunner<A>> {
        Arc::clone(&self.twap)
    }
}
