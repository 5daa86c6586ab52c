//! In-memory order store for tests and ephemeral runs.

use std::collections::HashMap;

use parking_lot::RwLock;

use super::{OrderStore, StoreError};
use crate::models::{Order, OrderStatus};

/// Lock-guarded in-memory [`OrderStore`].
#[derive(Debug, Default)]
pub struct MemoryOrderStore {
    orders: RwLock<HashMap<String, Order>>,
}

impl MemoryOrderStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.orders.read().len()
    }

    /// True when no records are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.orders.read().is_empty()
    }
}

impl OrderStore for MemoryOrderStore {
    fn upsert(&self, order: &Order) -> Result<(), StoreError> {
        let mut orders = self.orders.write();
        let mut record = order.clone();
        if let Some(existing) = orders.get(&order.id) {
            record.created_at = existing.created_at;
        }
        orders.insert(record.id.clone(), record);
        Ok(())
    }

    fn get(&self, order_id: &str) -> Result<Option<Order>, StoreError> {
        Ok(self.orders.read().get(order_id).cloned())
    }

    fn set_status(&self, order_id: &str, status: OrderStatus) -> Result<bool, StoreError> {
        let mut orders = self.orders.write();
        match orders.get_mut(order_id) {
            Some(order) => {
                order.status = status;
                order.updated_at = chrono::Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn open_orders(&self, symbol: Option<&str>) -> Result<Vec<Order>, StoreError> {
        Ok(self
            .orders
            .read()
            .values()
            .filter(|o| o.status.is_active())
            .filter(|o| symbol.is_none_or(|s| o.symbol == s))
            .cloned()
            .collect())
    }

    fn all_orders(&self) -> Result<Vec<Order>, StoreError> {
        Ok(self.orders.read().values().cloned().collect())
    }
}
