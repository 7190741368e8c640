use crate::api::{OrderHeader, OrderItemRecord, StoredHeader};
use crate::database::OrderStore;
use crate::errors::StoreError;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;

/// Contains the SQL queries used to interact with the database
pub mod sql_queries {
    // No UNIQUE constraint on order_number, random numbers may collide
    pub const CREATE_TABLES: &str = "
        CREATE TABLE IF NOT EXISTS orders (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            order_number TEXT NOT NULL,
            customer_name TEXT NOT NULL,
            customer_phone TEXT NOT NULL,
            delivery_address TEXT NOT NULL,
            total_price REAL NOT NULL,
            payment_status TEXT NOT NULL,
            notes TEXT NOT NULL DEFAULT '',
            customer_telegram_chat_id TEXT,
            created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        );
        CREATE TABLE IF NOT EXISTS order_items (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            order_id INTEGER NOT NULL REFERENCES orders(id),
            item_name TEXT NOT NULL,
            quantity INTEGER NOT NULL,
            unit_price REAL NOT NULL,
            total_price REAL NOT NULL
        );";

    // Off by default in SQLite, it has to be set on every connection
    pub const ENABLE_FOREIGN_KEYS: &str = "PRAGMA foreign_keys = ON;";

    pub const INSERT_ORDER: &str = "INSERT INTO orders (order_number, customer_name, customer_phone, delivery_address, total_price, payment_status, notes, customer_telegram_chat_id) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)";
    pub const INSERT_ITEM: &str = "INSERT INTO order_items (order_id, item_name, quantity, unit_price, total_price) VALUES (?1, ?2, ?3, ?4, ?5)";

    const HEADER_COLUMNS: &str = "id, order_number, customer_name, customer_phone, delivery_address, total_price, payment_status, notes, customer_telegram_chat_id";

    pub fn select_order() -> String {
        format!("SELECT {} FROM orders WHERE id = ?1", HEADER_COLUMNS)
    }

    pub fn select_recent_orders() -> String {
        format!(
            "SELECT {} FROM orders ORDER BY created_at DESC, rowid DESC LIMIT ?1",
            HEADER_COLUMNS
        )
    }

    pub const SELECT_ITEMS: &str = "SELECT order_id, item_name, quantity, unit_price, total_price FROM order_items WHERE order_id = ?1 ORDER BY id";
}

/// Order store backed by a SQLite database
pub struct SQLiteStore {
    conn: Connection,
}

impl SQLiteStore {
    /// Open (and create if needed) the database at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::init(Connection::open(path)?)
    }

    /// Private database that disappears with the store, for tests and dry runs
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(sql_queries::ENABLE_FOREIGN_KEYS)?;
        conn.execute_batch(sql_queries::CREATE_TABLES)?;
        Ok(SQLiteStore { conn })
    }
}

/// Order ids are the integer rowid of the header, handed out as decimal strings
fn row_id(order_id: &str) -> Option<i64> {
    order_id.parse().ok()
}

fn header_from_row(row: &Row) -> rusqlite::Result<StoredHeader> {
    Ok(StoredHeader {
        order_id: row.get::<_, i64>(0)?.to_string(),
        header: OrderHeader {
            order_number: row.get(1)?,
            customer_name: row.get(2)?,
            customer_phone: row.get(3)?,
            delivery_address: row.get(4)?,
            total_price: row.get(5)?,
            payment_status: row.get(6)?,
            notes: row.get(7)?,
            customer_telegram_chat_id: row.get(8)?,
        },
    })
}

impl OrderStore for SQLiteStore {
    fn insert_order(&mut self, header: &OrderHeader) -> Result<StoredHeader, StoreError> {
        self.conn.execute(
            sql_queries::INSERT_ORDER,
            params![
                header.order_number,
                header.customer_name,
                header.customer_phone,
                header.delivery_address,
                header.total_price,
                header.payment_status,
                header.notes,
                header.customer_telegram_chat_id,
            ],
        )?;
        let order_id = self.conn.last_insert_rowid().to_string();

        // Read the row back so the caller gets what the database actually holds
        self.get_order(&order_id)?
            .ok_or_else(|| StoreError::Rejected(format!("order {} vanished after insert", order_id)))
    }

    fn insert_order_items(&mut self, items: &[OrderItemRecord]) -> Result<(), StoreError> {
        let tx = self.conn.transaction()?;
        insert_items(&tx, items)?;
        tx.commit()?;
        Ok(())
    }

    fn get_order(&self, order_id: &str) -> Result<Option<StoredHeader>, StoreError> {
        let Some(id) = row_id(order_id) else {
            return Ok(None);
        };
        Ok(self
            .conn
            .query_row(&sql_queries::select_order(), params![id], header_from_row)
            .optional()?)
    }

    fn get_order_items(&self, order_id: &str) -> Result<Vec<OrderItemRecord>, StoreError> {
        let Some(id) = row_id(order_id) else {
            return Ok(Vec::new());
        };
        let mut stmt = self.conn.prepare(sql_queries::SELECT_ITEMS)?;
        let rows = stmt.query_map(params![id], |row| {
            Ok(OrderItemRecord {
                order_id: row.get::<_, i64>(0)?.to_string(),
                item_name: row.get(1)?,
                quantity: row.get(2)?,
                unit_price: row.get(3)?,
                total_price: row.get(4)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn list_orders(&self, limit: usize) -> Result<Vec<StoredHeader>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut stmt = self.conn.prepare(&sql_queries::select_recent_orders())?;
        let rows = stmt.query_map(params![limit], header_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

/// Insert data from a slice of item records inside an open transaction
fn insert_items(tx: &rusqlite::Transaction, items: &[OrderItemRecord]) -> Result<(), StoreError> {
    let mut stmt = tx.prepare(sql_queries::INSERT_ITEM)?;

    for item in items.iter() {
        let order_id = row_id(&item.order_id)
            .ok_or_else(|| StoreError::Rejected(format!("malformed order id '{}'", item.order_id)))?;
        stmt.execute(params![
            order_id,
            item.item_name,
            item.quantity,
            item.unit_price,
            item.total_price
        ])?;
    }

    Ok(())
}
