//! Risk manager: position registry, trailing stops, and drawdown tracking.
//!
//! Single source of truth for how many deals are open and where each
//! position's protective stop sits. The stop only ever tightens: favorable
//! price moves raise (long) or lower (short) the peak and recompute a
//! candidate stop, and the position keeps the better of the old and new stop.
//!
//! The position map is lock-guarded so the webhook handler, the background
//! reconciler, and TWAP workers may call concurrently.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::store::PositionStore;

mod drawdown;

pub use drawdown::DrawdownTracker;

/// Position direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionSide {
    /// Long exposure - profits when price rises.
    Long,
    /// Short exposure - profits when price falls.
    Short,
}

impl PositionSide {
    /// Lowercase storage representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Long => "long",
            Self::Short => "short",
        }
    }

    /// Parse a stored side string. Unknown values default to long.
    #[must_use]
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "short" => Self::Short,
            _ => Self::Long,
        }
    }
}

impl std::fmt::Display for PositionSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One open exposure tracked by the risk manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    /// Unique position id within the live set.
    pub pid: String,
    /// Direction.
    pub side: PositionSide,
    /// Entry price.
    pub entry_price: Decimal,
    /// Notional amount.
    pub amount: Decimal,
    /// Size in units (`amount / entry_price` unless given explicitly).
    pub size: Decimal,
    /// Strategy label, if any.
    pub strategy: Option<String>,
    /// Best price seen so far (highest for long, lowest for short).
    pub peak_price: Decimal,
    /// Current protective stop.
    pub stop: Decimal,
    /// When the position was opened.
    pub opened_at: DateTime<Utc>,
}

/// Risk manager configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Maximum simultaneously open positions (must be >= 1).
    #[serde(default = "default_max_concurrent_deals")]
    pub max_concurrent_deals: usize,
    /// Trailing stop distance as a fraction of price (percentage mode).
    #[serde(default = "default_trailing_stop_pct")]
    pub trailing_stop_pct: Decimal,
    /// ATR multiple for the stop distance (ATR mode).
    #[serde(default = "default_atr_multiplier")]
    pub atr_multiplier: Decimal,
    /// Drawdown fraction that triggers the equity alert.
    #[serde(default = "default_drawdown_alert_pct")]
    pub drawdown_alert_pct: Decimal,
}

fn default_max_concurrent_deals() -> usize {
    3
}

fn default_trailing_stop_pct() -> Decimal {
    dec!(0.05)
}

fn default_atr_multiplier() -> Decimal {
    dec!(2)
}

fn default_drawdown_alert_pct() -> Decimal {
    dec!(0.2)
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_concurrent_deals: default_max_concurrent_deals(),
            trailing_stop_pct: default_trailing_stop_pct(),
            atr_multiplier: default_atr_multiplier(),
            drawdown_alert_pct: default_drawdown_alert_pct(),
        }
    }
}

/// Errors from risk operations.
#[derive(Debug, Clone, Error)]
pub enum RiskError {
    /// Configuration rejected at construction.
    #[error("invalid risk config: {0}")]
    InvalidConfig(String),

    /// Request carried values the risk manager cannot work with.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Opening would exceed the concurrency cap. Callers should wait for a
    /// close event rather than retry.
    #[error("position limit reached ({max} concurrent deals)")]
    LimitReached {
        /// The configured cap.
        max: usize,
    },

    /// The pid is already tracked in the live set.
    #[error("position already exists: {pid}")]
    AlreadyExists {
        /// The duplicate pid.
        pid: String,
    },

    /// The pid is not in the live set.
    #[error("position not found: {pid}")]
    NotFound {
        /// The unknown pid.
        pid: String,
    },
}

/// Request to open a position.
#[derive(Debug, Clone)]
pub struct OpenPositionRequest {
    /// Unique position id.
    pub pid: String,
    /// Direction.
    pub side: PositionSide,
    /// Entry price (must be positive).
    pub entry_price: Decimal,
    /// Notional amount.
    pub amount: Decimal,
    /// Explicit size in units; derived from amount/entry when absent.
    pub size: Option<Decimal>,
    /// ATR sample; selects ATR stop mode when present.
    pub atr: Option<Decimal>,
    /// Strategy label.
    pub strategy: Option<String>,
}

impl OpenPositionRequest {
    /// Create a request with the required fields.
    #[must_use]
    pub const fn new(
        pid: String,
        side: PositionSide,
        entry_price: Decimal,
        amount: Decimal,
    ) -> Self {
        Self {
            pid,
            side,
            entry_price,
            amount,
            size: None,
            atr: None,
            strategy: None,
        }
    }

    /// Set an explicit size.
    #[must_use]
    pub const fn with_size(mut self, size: Decimal) -> Self {
        self.size = Some(size);
        self
    }

    /// Provide an ATR sample (selects ATR stop mode).
    #[must_use]
    pub const fn with_atr(mut self, atr: Decimal) -> Self {
        self.atr = Some(atr);
        self
    }

    /// Set the strategy label.
    #[must_use]
    pub fn with_strategy(mut self, strategy: impl Into<String>) -> Self {
        self.strategy = Some(strategy.into());
        self
    }
}

/// Position registry with trailing-stop and drawdown logic.
pub struct RiskManager {
    config: RiskConfig,
    positions: RwLock<HashMap<String, Position>>,
    drawdown: Mutex<DrawdownTracker>,
    persist: Option<Arc<dyn PositionStore>>,
}

impl RiskManager {
    /// Create a risk manager, validating the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`RiskError::InvalidConfig`] for a zero concurrency cap or
    /// negative percentages/multipliers.
    pub fn new(config: RiskConfig) -> Result<Self, RiskError> {
        if config.max_concurrent_deals < 1 {
            return Err(RiskError::InvalidConfig(
                "max_concurrent_deals must be >= 1".to_string(),
            ));
        }
        if config.trailing_stop_pct < Decimal::ZERO || config.trailing_stop_pct >= Decimal::ONE {
            return Err(RiskError::InvalidConfig(
                "trailing_stop_pct must be in [0, 1)".to_string(),
            ));
        }
        if config.atr_multiplier < Decimal::ZERO {
            return Err(RiskError::InvalidConfig(
                "atr_multiplier must be >= 0".to_string(),
            ));
        }
        if config.drawdown_alert_pct < Decimal::ZERO {
            return Err(RiskError::InvalidConfig(
                "drawdown_alert_pct must be >= 0".to_string(),
            ));
        }

        let drawdown = DrawdownTracker::new(config.drawdown_alert_pct);
        Ok(Self {
            config,
            positions: RwLock::new(HashMap::new()),
            drawdown: Mutex::new(drawdown),
            persist: None,
        })
    }

    /// Attach a best-effort persistence backend.
    ///
    /// One writer process per store file; store failures are logged and never
    /// fail the risk operation.
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn PositionStore>) -> Self {
        self.persist = Some(store);
        self
    }

    /// Reload the live set from the persistence backend.
    ///
    /// Returns the number of restored positions. Intended for startup, before
    /// any position has been opened.
    ///
    /// # Errors
    ///
    /// Returns [`RiskError::InvalidRequest`] when the backend cannot be read.
    pub fn restore(&self) -> Result<usize, RiskError> {
        let Some(store) = &self.persist else {
            return Ok(0);
        };

        let restored = store
            .load_positions()
            .map_err(|e| RiskError::InvalidRequest(format!("position restore failed: {e}")))?;

        let mut positions = self.positions.write();
        let count = restored.len();
        for position in restored {
            positions.insert(position.pid.clone(), position);
        }
        info!(count, "restored positions from store");
        Ok(count)
    }

    /// True while the live set is below the concurrency cap.
    #[must_use]
    pub fn can_open_new(&self) -> bool {
        self.positions.read().len() < self.config.max_concurrent_deals
    }

    /// Number of live positions.
    #[must_use]
    pub fn position_count(&self) -> usize {
        self.positions.read().len()
    }

    /// Open a position and compute its initial stop.
    ///
    /// Percentage mode: `entry * (1 -/+ trailing_stop_pct)`. ATR mode (when
    /// the request carries an ATR sample): `entry -/+ atr_multiplier * atr`.
    /// The sign follows the side.
    ///
    /// # Errors
    ///
    /// [`RiskError::AlreadyExists`] for a duplicate pid,
    /// [`RiskError::LimitReached`] at the concurrency cap,
    /// [`RiskError::InvalidRequest`] for a non-positive entry price.
    pub fn open_position(&self, request: OpenPositionRequest) -> Result<Position, RiskError> {
        if request.entry_price <= Decimal::ZERO {
            return Err(RiskError::InvalidRequest(
                "entry_price must be positive".to_string(),
            ));
        }

        let mut positions = self.positions.write();

        if positions.contains_key(&request.pid) {
            return Err(RiskError::AlreadyExists { pid: request.pid });
        }
        if positions.len() >= self.config.max_concurrent_deals {
            return Err(RiskError::LimitReached {
                max: self.config.max_concurrent_deals,
            });
        }

        let size = request
            .size
            .unwrap_or_else(|| request.amount / request.entry_price);
        let stop = self.stop_candidate(request.side, request.entry_price, request.atr);

        let position = Position {
            pid: request.pid.clone(),
            side: request.side,
            entry_price: request.entry_price,
            amount: request.amount,
            size,
            strategy: request.strategy,
            peak_price: request.entry_price,
            stop,
            opened_at: Utc::now(),
        };

        positions.insert(request.pid, position.clone());
        drop(positions);

        info!(
            pid = %position.pid,
            side = %position.side,
            entry = %position.entry_price,
            stop = %position.stop,
            "position opened"
        );
        self.persist_best_effort(&position);
        Ok(position)
    }

    /// Feed a market-price tick; returns the (possibly tightened) stop.
    ///
    /// Favorable moves advance the peak and recompute a candidate stop; the
    /// stop never retreats. Unfavorable moves leave peak and stop unchanged.
    ///
    /// # Errors
    ///
    /// [`RiskError::NotFound`] for an unknown pid.
    pub fn update_price(
        &self,
        pid: &str,
        price: Decimal,
        atr: Option<Decimal>,
    ) -> Result<Decimal, RiskError> {
        let mut positions = self.positions.write();
        let position = positions.get_mut(pid).ok_or_else(|| RiskError::NotFound {
            pid: pid.to_string(),
        })?;

        match position.side {
            PositionSide::Long => {
                if price > position.peak_price {
                    position.peak_price = price;
                    let candidate = self.stop_candidate(PositionSide::Long, price, atr);
                    if candidate > position.stop {
                        position.stop = candidate;
                    }
                }
            }
            PositionSide::Short => {
                if price < position.peak_price {
                    position.peak_price = price;
                    let candidate = self.stop_candidate(PositionSide::Short, price, atr);
                    if candidate < position.stop {
                        position.stop = candidate;
                    }
                }
            }
        }

        let snapshot = position.clone();
        drop(positions);

        debug!(pid, price = %price, stop = %snapshot.stop, "price tick");
        self.persist_best_effort(&snapshot);
        Ok(snapshot.stop)
    }

    /// True when the price has crossed the stop in the adverse direction.
    ///
    /// # Errors
    ///
    /// [`RiskError::NotFound`] for an unknown pid.
    pub fn should_close(&self, pid: &str, price: Decimal) -> Result<bool, RiskError> {
        let positions = self.positions.read();
        let position = positions.get(pid).ok_or_else(|| RiskError::NotFound {
            pid: pid.to_string(),
        })?;

        Ok(match position.side {
            PositionSide::Long => price <= position.stop,
            PositionSide::Short => price >= position.stop,
        })
    }

    /// Remove and return a position. Idempotent: an absent pid yields `None`
    /// so cleanup call sites never fail.
    pub fn close_position(&self, pid: &str) -> Option<Position> {
        let removed = self.positions.write().remove(pid);

        if let Some(position) = &removed {
            info!(pid = %position.pid, "position closed");
            if let Some(store) = &self.persist {
                if let Err(err) = store.remove_position(pid) {
                    warn!(pid, error = %err, "position removal persistence failed");
                }
            }
        }
        removed
    }

    /// Snapshot of every live position.
    #[must_use]
    pub fn list_positions(&self) -> Vec<Position> {
        self.positions.read().values().cloned().collect()
    }

    /// Snapshot of one position.
    #[must_use]
    pub fn get_position(&self, pid: &str) -> Option<Position> {
        self.positions.read().get(pid).cloned()
    }

    /// Record an equity sample against the running peak.
    ///
    /// Returns `(drawdown_fraction, alert)`; the fraction is `<= 0` and the
    /// alert fires when its magnitude reaches the configured threshold.
    pub fn record_equity(&self, equity: Decimal) -> (Decimal, bool) {
        let (fraction, alert) = self.drawdown.lock().record(equity);
        if alert {
            warn!(equity = %equity, drawdown = %fraction, "drawdown alert");
        }
        (fraction, alert)
    }

    /// Candidate stop for `price` in the mode selected by `atr`.
    fn stop_candidate(&self, side: PositionSide, price: Decimal, atr: Option<Decimal>) -> Decimal {
        match (side, atr) {
            (PositionSide::Long, Some(atr)) => price - self.config.atr_multiplier * atr,
            (PositionSide::Short, Some(atr)) => price + self.config.atr_multiplier * atr,
            (PositionSide::Long, None) => price * (Decimal::ONE - self.config.trailing_stop_pct),
            (PositionSide::Short, None) => price * (Decimal::ONE + self.config.trailing_stop_pct),
        }
    }

    fn persist_best_effort(&self, position: &Position) {
        if let Some(store) = &self.persist {
            if let Err(err) = store.save_position(position) {
                warn!(pid = %position.pid, error = %err, "position persistence failed");
            }
        }
    }
}
