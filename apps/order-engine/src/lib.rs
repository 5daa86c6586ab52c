// Allow unwrap/expect in tests - tests should panic on unexpected errors
#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::default_trait_access,
        clippy::items_after_statements
    )
)]

//! Order Engine - Rust Core Library
//!
//! Order lifecycle and risk coordination engine for the tiller trading bot.
//!
//! # Architecture
//!
//! External signal/strategy events flow through one pipeline:
//! risk gate ([`risk::RiskManager::can_open_new`]) -> order placement
//! ([`broker::Broker::place_order`], which retries against the exchange
//! adapter and persists to the order store) -> position tracking
//! ([`risk::RiskManager::open_position`]). Background loops run
//! independently: the OCO reconciler resolves linked pairs, and TWAP workers
//! drive multi-slice jobs.
//!
//! ## Modules
//!
//! - [`models`]: order, request, and event types shared across the engine
//! - [`adapter`]: the `ExchangeAdapter` capability trait + paper exchange
//! - [`store`]: durable order/position persistence (SQLite, in-memory)
//! - [`broker`]: retrying, normalizing, persisting order router
//! - [`risk`]: position registry, trailing stops, drawdown tracking
//! - [`oco`]: one-cancels-other pairs + background reconciliation
//! - [`twap`]: time-sliced execution, inline and as background jobs
//! - [`service`]: the composition root (`ServiceRunner`, `SignalExecutor`)
//! - [`config`]: YAML configuration with env overrides
//!
//! There are no global singletons: a [`service::ServiceRunner`] built at
//! process start owns every component and the adapter's session lifecycle.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

pub mod adapter;
pub mod broker;
pub mod config;
pub mod models;
pub mod oco;
pub mod risk;
pub mod service;
pub mod store;
pub mod twap;

pub use adapter::{AdapterError, ExchangeAdapter, PaperExchange};
pub use broker::{Broker, BrokerError, RetryPolicy};
pub use config::{ConfigError, EngineConfig};
pub use models::{Order, OrderSide, OrderStatus, OrderType, PlaceOrderRequest, Signal, SignalEvent};
pub use oco::{OcoManager, OcoPair, Reconciler};
pub use risk::{Position, PositionSide, RiskConfig, RiskError, RiskManager};
pub use service::{EventOutcome, ServiceRunner, SignalExecutor};
pub use store::{MemoryOrderStore, OrderStore, PositionStore, SqliteStore};
pub use twap::{TwapError, TwapExecutor, TwapJob, TwapJobStatus, TwapRunner};
