//! Embedded SQLite store for orders and positions.
//!
//! Single-file database behind an internal lock; callers on the webhook,
//! reconciler, and TWAP worker threads all funnel through the same
//! connection.

use std::path::Path;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, params};
use rust_decimal::Decimal;

use super::{OrderStore, PositionStore, StoreError};
use crate::models::{Order, OrderSide, OrderStatus, OrderType};
use crate::risk::{Position, PositionSide};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS orders (
    id          TEXT PRIMARY KEY,
    status      TEXT NOT NULL,
    symbol      TEXT NOT NULL,
    side        TEXT NOT NULL,
    amount      TEXT NOT NULL,
    filled      TEXT NOT NULL,
    price       TEXT,
    order_type  TEXT NOT NULL,
    strategy    TEXT,
    raw         TEXT NOT NULL,
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS positions (
    pid         TEXT PRIMARY KEY,
    side        TEXT NOT NULL,
    entry_price TEXT NOT NULL,
    amount      TEXT NOT NULL,
    size        TEXT NOT NULL,
    strategy    TEXT,
    peak_price  TEXT NOT NULL,
    stop        TEXT NOT NULL,
    opened_at   TEXT NOT NULL
);
";

/// SQLite-backed [`OrderStore`] and [`PositionStore`].
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and ensure the schema exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or the schema cannot be
    /// created.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::init(Connection::open(path)?)
    }

    /// Open a private in-memory database (tests, throwaway runs).
    ///
    /// # Errors
    ///
    /// Returns an error if the schema cannot be created.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

fn parse_decimal(value: &str, column: &str) -> Result<Decimal, StoreError> {
    value
        .parse::<Decimal>()
        .map_err(|e| StoreError::Serialization(format!("{column}: {e}")))
}

fn parse_timestamp(value: &str, column: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Serialization(format!("{column}: {e}")))
}

/// Raw order row, decoded in a second pass so decimal/timestamp parse
/// failures surface as [`StoreError::Serialization`] rather than SQL errors.
struct OrderRow {
    id: String,
    status: String,
    symbol: String,
    side: String,
    amount: String,
    filled: String,
    price: Option<String>,
    order_type: String,
    strategy: Option<String>,
    raw: String,
    created_at: String,
    updated_at: String,
}

impl OrderRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            status: row.get(1)?,
            symbol: row.get(2)?,
            side: row.get(3)?,
            amount: row.get(4)?,
            filled: row.get(5)?,
            price: row.get(6)?,
            order_type: row.get(7)?,
            strategy: row.get(8)?,
            raw: row.get(9)?,
            created_at: row.get(10)?,
            updated_at: row.get(11)?,
        })
    }

    fn decode(self) -> Result<Order, StoreError> {
        Ok(Order {
            id: self.id,
            status: OrderStatus::from_exchange(&self.status),
            symbol: self.symbol,
            side: OrderSide::from_str_lossy(&self.side),
            amount: parse_decimal(&self.amount, "amount")?,
            filled: parse_decimal(&self.filled, "filled")?,
            price: self
                .price
                .map(|p| parse_decimal(&p, "price"))
                .transpose()?,
            order_type: OrderType::from_str_lossy(&self.order_type),
            strategy: self.strategy,
            raw: serde_json::from_str(&self.raw)?,
            created_at: parse_timestamp(&self.created_at, "created_at")?,
            updated_at: parse_timestamp(&self.updated_at, "updated_at")?,
        })
    }
}

const SELECT_ORDER: &str = "SELECT id, status, symbol, side, amount, filled, price, order_type, \
                            strategy, raw, created_at, updated_at FROM orders";

impl OrderStore for SqliteStore {
    fn upsert(&self, order: &Order) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO orders (id, status, symbol, side, amount, filled, price, order_type, \
             strategy, raw, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
             ON CONFLICT(id) DO UPDATE SET
                 status = excluded.status,
                 symbol = excluded.symbol,
                 side = excluded.side,
                 amount = excluded.amount,
                 filled = excluded.filled,
                 price = excluded.price,
                 order_type = excluded.order_type,
                 strategy = excluded.strategy,
                 raw = excluded.raw,
                 updated_at = excluded.updated_at",
            params![
                order.id,
                order.status.as_str(),
                order.symbol,
                order.side.as_str(),
                order.amount.to_string(),
                order.filled.to_string(),
                order.price.map(|p| p.to_string()),
                order.order_type.as_str(),
                order.strategy,
                serde_json::to_string(&order.raw)?,
                order.created_at.to_rfc3339(),
                order.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn get(&self, order_id: &str) -> Result<Option<Order>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!("{SELECT_ORDER} WHERE id = ?1"))?;
        let mut rows = stmt.query_map(params![order_id], OrderRow::from_row)?;
        match rows.next() {
            Some(row) => Ok(Some(row?.decode()?)),
            None => Ok(None),
        }
    }

    fn set_status(&self, order_id: &str, status: OrderStatus) -> Result<bool, StoreError> {
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE orders SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![status.as_str(), Utc::now().to_rfc3339(), order_id],
        )?;
        Ok(updated > 0)
    }

    fn open_orders(&self, symbol: Option<&str>) -> Result<Vec<Order>, StoreError> {
        let conn = self.conn.lock();
        let rows = match symbol {
            Some(symbol) => {
                let mut stmt = conn.prepare(&format!(
                    "{SELECT_ORDER} WHERE symbol = ?1 AND status IN ('submitted', 'open', 'partial')"
                ))?;
                let rows = stmt.query_map(params![symbol], OrderRow::from_row)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "{SELECT_ORDER} WHERE status IN ('submitted', 'open', 'partial')"
                ))?;
                let rows = stmt.query_map([], OrderRow::from_row)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            }
        };
        rows.into_iter().map(OrderRow::decode).collect()
    }

    fn all_orders(&self) -> Result<Vec<Order>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(SELECT_ORDER)?;
        let rows = stmt.query_map([], OrderRow::from_row)?;
        let rows = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(OrderRow::decode).collect()
    }
}

struct PositionRow {
    pid: String,
    side: String,
    entry_price: String,
    amount: String,
    size: String,
    strategy: Option<String>,
    peak_price: String,
    stop: String,
    opened_at: String,
}

impl PositionRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            pid: row.get(0)?,
            side: row.get(1)?,
            entry_price: row.get(2)?,
            amount: row.get(3)?,
            size: row.get(4)?,
            strategy: row.get(5)?,
            peak_price: row.get(6)?,
            stop: row.get(7)?,
            opened_at: row.get(8)?,
        })
    }

    fn decode(self) -> Result<Position, StoreError> {
        Ok(Position {
            pid: self.pid,
            side: PositionSide::from_str_lossy(&self.side),
            entry_price: parse_decimal(&self.entry_price, "entry_price")?,
            amount: parse_decimal(&self.amount, "amount")?,
            size: parse_decimal(&self.size, "size")?,
            strategy: self.strategy,
            peak_price: parse_decimal(&self.peak_price, "peak_price")?,
            stop: parse_decimal(&self.stop, "stop")?,
            opened_at: parse_timestamp(&self.opened_at, "opened_at")?,
        })
    }
}

impl PositionStore for SqliteStore {
    fn save_position(&self, position: &Position) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO positions (pid, side, entry_price, amount, size, strategy, peak_price, \
             stop, opened_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(pid) DO UPDATE SET
                 side = excluded.side,
                 entry_price = excluded.entry_price,
                 amount = excluded.amount,
                 size = excluded.size,
                 strategy = excluded.strategy,
                 peak_price = excluded.peak_price,
                 stop = excluded.stop",
            params![
                position.pid,
                position.side.as_str(),
                position.entry_price.to_string(),
                position.amount.to_string(),
                position.size.to_string(),
                position.strategy,
                position.peak_price.to_string(),
                position.stop.to_string(),
                position.opened_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn remove_position(&self, pid: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM positions WHERE pid = ?1", params![pid])?;
        Ok(())
    }

    fn load_positions(&self) -> Result<Vec<Position>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT pid, side, entry_price, amount, size, strategy, peak_price, stop, opened_at \
             FROM positions",
        )?;
        let rows = stmt.query_map([], PositionRow::from_row)?;
        let rows = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(PositionRow::decode).collect()
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;
    use serde_json::json;

    use super::*;

    fn sample_order(id: &str, status: OrderStatus) -> Order {
        Order {
            id: id.to_string(),
            symbol: "BTC/USDT".to_string(),
            side: OrderSide::Buy,
            amount: dec!(1.25),
            filled: dec!(0),
            price: Some(dec!(30000)),
            status,
            order_type: OrderType::Limit,
            strategy: Some("breakout".to_string()),
            raw: json!({"venue": "paper"}),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn upsert_roundtrip() {
        let store = SqliteStore::open_in_memory().unwrap();
        let order = sample_order("ord-1", OrderStatus::Open);

        store.upsert(&order).unwrap();
        let loaded = store.get("ord-1").unwrap().unwrap();

        assert_eq!(loaded.id, order.id);
        assert_eq!(loaded.amount, order.amount);
        assert_eq!(loaded.price, order.price);
        assert_eq!(loaded.status, OrderStatus::Open);
        assert_eq!(loaded.strategy.as_deref(), Some("breakout"));
        assert_eq!(loaded.raw, order.raw);
    }

    #[test]
    fn upsert_preserves_created_at() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut order = sample_order("ord-1", OrderStatus::Submitted);
        store.upsert(&order).unwrap();
        let first = store.get("ord-1").unwrap().unwrap();

        order.status = OrderStatus::Filled;
        order.created_at = Utc::now();
        store.upsert(&order).unwrap();
        let second = store.get("ord-1").unwrap().unwrap();

        assert_eq!(second.status, OrderStatus::Filled);
        assert_eq!(second.created_at, first.created_at);
    }

    #[test]
    fn set_status_on_missing_row_returns_false() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert!(!store.set_status("nope", OrderStatus::Cancelled).unwrap());

        store.upsert(&sample_order("ord-1", OrderStatus::Open)).unwrap();
        assert!(store.set_status("ord-1", OrderStatus::Cancelled).unwrap());
        let loaded = store.get("ord-1").unwrap().unwrap();
        assert_eq!(loaded.status, OrderStatus::Cancelled);
    }

    #[test]
    fn open_orders_filters_terminal_and_symbol() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.upsert(&sample_order("a", OrderStatus::Open)).unwrap();
        store.upsert(&sample_order("b", OrderStatus::Filled)).unwrap();
        let mut other = sample_order("c", OrderStatus::Submitted);
        other.symbol = "ETH/USDT".to_string();
        store.upsert(&other).unwrap();

        assert_eq!(store.open_orders(None).unwrap().len(), 2);
        assert_eq!(store.open_orders(Some("ETH/USDT")).unwrap().len(), 1);
        assert_eq!(store.all_orders().unwrap().len(), 3);
    }

    #[test]
    fn position_roundtrip() {
        let store = SqliteStore::open_in_memory().unwrap();
        let position = Position {
            pid: "BTC/USDT:breakout".to_string(),
            side: PositionSide::Long,
            entry_price: dec!(100),
            amount: dec!(1000),
            size: dec!(10),
            strategy: Some("breakout".to_string()),
            peak_price: dec!(110),
            stop: dec!(104.5),
            opened_at: Utc::now(),
        };

        store.save_position(&position).unwrap();
        let loaded = store.load_positions().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].stop, dec!(104.5));
        assert_eq!(loaded[0].side, PositionSide::Long);

        store.remove_position(&position.pid).unwrap();
        assert!(store.load_positions().unwrap().is_empty());
    }

    #[test]
    fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("orders.db");

        {
            let store = SqliteStore::open(&path).unwrap();
            store.upsert(&sample_order("ord-1", OrderStatus::Filled)).unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        let loaded = store.get("ord-1").unwrap().unwrap();
        assert_eq!(loaded.status, OrderStatus::Filled);
    }
}
