//! SQLite persistence layer.
//!
//! Owns the two-table schema and the atomic "one receipt plus its line items"
//! insert. The handle serializes writers behind a mutex; this process is the
//! only writer, and the report layer reads the same tables with plain SQL.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use rusqlite::{params, Connection};
use tracing::{error, info};

use crate::error::{PipelineError, PipelineResult};
use crate::schema::{LineItem, Receipt, ReceiptRecord, StoredItem};

/// Shared storage handle. Cloning is cheap; all clones serialize on the same
/// underlying connection.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) the database file.
    pub fn open(path: &Path) -> PipelineResult<Self> {
        let conn = Connection::open(path)
            .map_err(|e| PipelineError::PersistenceFailed(format!("{}: {e}", path.display())))?;
        Self::from_connection(conn)
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> PipelineResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> PipelineResult<Self> {
        configure_connection(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create the two tables if absent. Idempotent, safe on every startup;
    /// existing rows are never touched.
    pub fn init_schema(&self) -> PipelineResult<()> {
        self.lock().execute_batch(
            "
            CREATE TABLE IF NOT EXISTS receipts (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              store TEXT NOT NULL,
              genre TEXT NOT NULL,
              datetime TEXT NOT NULL,
              total REAL NOT NULL
            );

            CREATE TABLE IF NOT EXISTS items (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              receipt_id INTEGER NOT NULL,
              name TEXT NOT NULL,
              price REAL NOT NULL,
              FOREIGN KEY (receipt_id) REFERENCES receipts (id) ON DELETE CASCADE
            );
            ",
        )?;
        Ok(())
    }

    /// Insert one receipt with all of its line items in a single transaction.
    ///
    /// Either every row commits or none do; any failure rolls back fully and
    /// surfaces as `PersistenceFailed`.
    pub fn insert_receipt(
        &self,
        receipt: &ReceiptRecord,
        items: &[LineItem],
    ) -> PipelineResult<i64> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;

        let receipt_id = {
            tx.execute(
                "INSERT INTO receipts (store, genre, datetime, total) VALUES (?1, ?2, ?3, ?4)",
                params![receipt.store, receipt.genre, receipt.datetime, receipt.total],
            )?;
            let receipt_id = tx.last_insert_rowid();

            let mut statement =
                tx.prepare("INSERT INTO items (receipt_id, name, price) VALUES (?1, ?2, ?3)")?;
            for item in items {
                statement.execute(params![receipt_id, item.name, item.price])?;
            }
            receipt_id
        };

        tx.commit().map_err(|e| {
            error!("receipt insert rolled back: {e}");
            PipelineError::PersistenceFailed(e.to_string())
        })?;

        info!("saved receipt {} ({} items)", receipt_id, items.len());
        Ok(receipt_id)
    }

    /// Read one receipt back with its items, `None` when the id is unknown.
    pub fn fetch_receipt(&self, id: i64) -> PipelineResult<Option<Receipt>> {
        let conn = self.lock();

        let receipt = conn
            .query_row(
                "SELECT id, store, genre, datetime, total FROM receipts WHERE id = ?1",
                [id],
                |row| {
                    Ok(Receipt {
                        id: row.get(0)?,
                        store: row.get(1)?,
                        genre: row.get(2)?,
                        datetime: row.get(3)?,
                        total: row.get(4)?,
                        items: Vec::new(),
                    })
                },
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;

        let Some(mut receipt) = receipt else {
            return Ok(None);
        };

        let mut statement = conn.prepare(
            "SELECT id, receipt_id, name, price FROM items WHERE receipt_id = ?1 ORDER BY id",
        )?;
        let items = statement
            .query_map([id], |row| {
                Ok(StoredItem {
                    id: row.get(0)?,
                    receipt_id: row.get(1)?,
                    name: row.get(2)?,
                    price: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        receipt.items = items;
        Ok(Some(receipt))
    }

    /// Run an arbitrary read against the connection. For the report layer.
    pub(crate) fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> PipelineResult<T> {
        let conn = self.lock();
        Ok(f(&conn)?)
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        // A poisoned mutex means a panic mid-statement; the connection itself
        // is still usable for the next batch.
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn configure_connection(conn: &Connection) -> PipelineResult<()> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_receipt() -> (ReceiptRecord, Vec<LineItem>) {
        (
            ReceiptRecord {
                store: "ローソン".into(),
                genre: "コンビニ".into(),
                datetime: "2024-05-01T12:30:00".into(),
                total: 640.0,
            },
            vec![
                LineItem {
                    name: "おにぎり".into(),
                    price: 140.0,
                },
                LineItem {
                    name: "コーヒー".into(),
                    price: 500.0,
                },
            ],
        )
    }

    fn count(db: &Database, sql: &str) -> i64 {
        db.with_conn(|conn| conn.query_row(sql, [], |row| row.get(0)))
            .unwrap()
    }

    #[test]
    fn insert_yields_one_receipt_and_n_item_rows() {
        let db = Database::open_in_memory().unwrap();
        db.init_schema().unwrap();

        let (receipt, items) = sample_receipt();
        let id = db.insert_receipt(&receipt, &items).unwrap();

        assert_eq!(count(&db, "SELECT COUNT(*) FROM receipts"), 1);
        assert_eq!(count(&db, "SELECT COUNT(*) FROM items"), 2);

        let stored = db.fetch_receipt(id).unwrap().unwrap();
        assert_eq!(stored.store, "ローソン");
        assert_eq!(stored.items.len(), 2);
        assert!(stored.items.iter().all(|i| i.receipt_id == id));
    }

    #[test]
    fn zero_item_receipt_is_valid() {
        let db = Database::open_in_memory().unwrap();
        db.init_schema().unwrap();

        let (receipt, _) = sample_receipt();
        let id = db.insert_receipt(&receipt, &[]).unwrap();
        assert_eq!(db.fetch_receipt(id).unwrap().unwrap().items.len(), 0);
    }

    #[test]
    fn failed_item_insert_rolls_back_the_receipt() {
        let db = Database::open_in_memory().unwrap();
        db.init_schema().unwrap();

        // Inject a failure between the receipt insert and the last item row.
        db.with_conn(|conn| {
            conn.execute_batch(
                "CREATE TRIGGER boom BEFORE INSERT ON items
                 WHEN NEW.name = '__boom__'
                 BEGIN SELECT RAISE(ABORT, 'injected'); END;",
            )
        })
        .unwrap();

        let (receipt, mut items) = sample_receipt();
        items.push(LineItem {
            name: "__boom__".into(),
            price: 1.0,
        });

        let err = db.insert_receipt(&receipt, &items).unwrap_err();
        assert!(matches!(err, PipelineError::PersistenceFailed(_)));
        assert_eq!(count(&db, "SELECT COUNT(*) FROM receipts"), 0);
        assert_eq!(count(&db, "SELECT COUNT(*) FROM items"), 0);
    }

    #[test]
    fn init_schema_is_idempotent_and_preserves_rows() {
        let db = Database::open_in_memory().unwrap();
        db.init_schema().unwrap();

        let (receipt, items) = sample_receipt();
        db.insert_receipt(&receipt, &items).unwrap();

        db.init_schema().unwrap();
        db.init_schema().unwrap();
        assert_eq!(count(&db, "SELECT COUNT(*) FROM receipts"), 1);
        assert_eq!(count(&db, "SELECT COUNT(*) FROM items"), 2);
    }

    #[test]
    fn unknown_id_reads_back_none() {
        let db = Database::open_in_memory().unwrap();
        db.init_schema().unwrap();
        assert!(db.fetch_receipt(999).unwrap().is_none());
    }
}
