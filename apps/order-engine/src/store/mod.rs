//! Durable order and position persistence.
//!
//! One store instance is shared by the broker and the reconciliation helpers;
//! all mutations go through the store's locked methods. Order records are
//! upserted by id and never deleted - terminal states are recorded, not
//! erased.

use thiserror::Error;

use crate::models::{Order, OrderStatus};
use crate::risk::Position;

mod memory;
mod sqlite;

pub use memory::MemoryOrderStore;
pub use sqlite::SqliteStore;

/// Errors from persistence operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database open/query error.
    #[error("database error: {0}")]
    Database(String),

    /// Stored value could not be decoded.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Database(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Durable order record store, keyed by order id with upsert semantics.
pub trait OrderStore: Send + Sync {
    /// Insert or update an order record. The original `created_at` is kept
    /// when the record already exists.
    fn upsert(&self, order: &Order) -> Result<(), StoreError>;

    /// Fetch one order by id.
    fn get(&self, order_id: &str) -> Result<Option<Order>, StoreError>;

    /// Update just the status of an existing record.
    ///
    /// Returns false when the id is unknown (not an error - the caller
    /// usually follows up with a full upsert).
    fn set_status(&self, order_id: &str, status: OrderStatus) -> Result<bool, StoreError>;

    /// All records still in an active (non-terminal, non-dry-run) state,
    /// optionally filtered by symbol.
    fn open_orders(&self, symbol: Option<&str>) -> Result<Vec<Order>, StoreError>;

    /// Every stored record.
    fn all_orders(&self) -> Result<Vec<Order>, StoreError>;
}

/// Optional persistence hook for the risk manager's position registry.
///
/// Assumes a single writer process per store file; no cross-process
/// coordination is attempted.
pub trait PositionStore: Send + Sync {
    /// Insert or update a position snapshot.
    fn save_position(&self, position: &Position) -> Result<(), StoreError>;

    /// Remove a closed position.
    fn remove_position(&self, pid: &str) -> Result<(), StoreError>;

    /// Load every persisted position.
    fn load_positions(&self) -> Result<Vec<Position>, StoreError>;
}
