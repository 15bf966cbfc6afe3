//! Read-side report queries and CSV export.
//!
//! Plain SQL projections over the two persisted tables. Nothing here mutates
//! state; the ingestion core guarantees the schema exists and its invariants
//! hold before any of these run.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;

use crate::db::Database;

const WEEKDAY_NAMES: [&str; 7] = [
    "Sunday",
    "Monday",
    "Tuesday",
    "Wednesday",
    "Thursday",
    "Friday",
    "Saturday",
];

/// One receipt row, as listed.
#[derive(Debug, Clone, Serialize)]
pub struct ReceiptRow {
    pub id: i64,
    pub store: String,
    pub genre: String,
    pub datetime: String,
    pub total: f64,
}

/// One item row, as listed.
#[derive(Debug, Clone, Serialize)]
pub struct ItemRow {
    pub id: i64,
    pub receipt_id: i64,
    pub name: String,
    pub price: f64,
}

/// Spend aggregated over one grouping key (store or genre).
#[derive(Debug, Clone, Serialize)]
pub struct KeyedSummary {
    pub key: String,
    pub total: f64,
    pub receipts: i64,
}

/// Spend per calendar month (`YYYY-MM`).
#[derive(Debug, Clone, Serialize)]
pub struct MonthlySummary {
    pub month: String,
    pub total: f64,
}

/// Spend per weekday.
#[derive(Debug, Clone, Serialize)]
pub struct WeekdaySummary {
    pub weekday: &'static str,
    pub total: f64,
    pub receipts: i64,
}

/// All receipts, newest-first.
pub fn list_receipts(db: &Database) -> Result<Vec<ReceiptRow>> {
    let rows = db.with_conn(|conn| {
        let mut statement = conn
            .prepare("SELECT id, store, genre, datetime, total FROM receipts ORDER BY id DESC")?;
        let rows = statement
            .query_map([], |row| {
                Ok(ReceiptRow {
                    id: row.get(0)?,
                    store: row.get(1)?,
                    genre: row.get(2)?,
                    datetime: row.get(3)?,
                    total: row.get(4)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    })?;
    Ok(rows)
}

/// All line items, in insertion order.
pub fn list_items(db: &Database) -> Result<Vec<ItemRow>> {
    let rows = db.with_conn(|conn| {
        let mut statement =
            conn.prepare("SELECT id, receipt_id, name, price FROM items ORDER BY id")?;
        let rows = statement
            .query_map([], |row| {
                Ok(ItemRow {
                    id: row.get(0)?,
                    receipt_id: row.get(1)?,
                    name: row.get(2)?,
                    price: row.get(3)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    })?;
    Ok(rows)
}

/// Total spend and receipt count per store, biggest spend first.
pub fn store_summary(db: &Database) -> Result<Vec<KeyedSummary>> {
    keyed_summary(db, "store")
}

/// Total spend and receipt count per genre, biggest spend first.
pub fn genre_summary(db: &Database) -> Result<Vec<KeyedSummary>> {
    keyed_summary(db, "genre")
}

fn keyed_summary(db: &Database, column: &str) -> Result<Vec<KeyedSummary>> {
    // Column name is fixed by the two public wrappers, never user input.
    let sql = format!(
        "SELECT {column}, SUM(total), COUNT(*) FROM receipts GROUP BY {column} ORDER BY SUM(total) DESC"
    );
    let rows = db.with_conn(|conn| {
        let mut statement = conn.prepare(&sql)?;
        let rows = statement
            .query_map([], |row| {
                Ok(KeyedSummary {
                    key: row.get(0)?,
                    total: row.get(1)?,
                    receipts: row.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    })?;
    Ok(rows)
}

/// Total spend per `YYYY-MM` month, chronological.
pub fn monthly_summary(db: &Database) -> Result<Vec<MonthlySummary>> {
    let rows = db.with_conn(|conn| {
        let mut statement = conn.prepare(
            "SELECT substr(datetime, 1, 7) AS month, SUM(total)
             FROM receipts GROUP BY month ORDER BY month",
        )?;
        let rows = statement
            .query_map([], |row| {
                Ok(MonthlySummary {
                    month: row.get(0)?,
                    total: row.get(1)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    })?;
    Ok(rows)
}

/// Total spend and receipt count per weekday, Sunday first.
pub fn weekday_summary(db: &Database) -> Result<Vec<WeekdaySummary>> {
    let rows = db.with_conn(|conn| {
        let mut statement = conn.prepare(
            "SELECT CAST(strftime('%w', datetime) AS INTEGER) AS dow, SUM(total), COUNT(*)
             FROM receipts GROUP BY dow ORDER BY dow",
        )?;
        let rows = statement
            .query_map([], |row| {
                let dow: i64 = row.get(0)?;
                Ok(WeekdaySummary {
                    weekday: WEEKDAY_NAMES[(dow.rem_euclid(7)) as usize],
                    total: row.get(1)?,
                    receipts: row.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    })?;
    Ok(rows)
}

/// Default export folder name, timestamped like the original tool's output.
pub fn default_export_dir() -> PathBuf {
    PathBuf::from(format!(
        "receipts_export_{}",
        chrono::Local::now().format("%Y%m%d_%H%M%S")
    ))
}

/// Write `receipts.csv` and `items.csv` under `dir`, creating it if needed.
/// Returns the two file paths.
pub fn export_csv(db: &Database, dir: &Path) -> Result<(PathBuf, PathBuf)> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("creating export dir {}", dir.display()))?;

    let receipts_path = dir.join("receipts.csv");
    let mut writer = csv::Writer::from_path(&receipts_path)
        .with_context(|| format!("opening {}", receipts_path.display()))?;
    writer.write_record(["id", "store", "genre", "datetime", "total"])?;
    for row in list_receipts(db)? {
        writer.write_record([
            row.id.to_string(),
            row.store,
            row.genre,
            row.datetime,
            row.total.to_string(),
        ])?;
    }
    writer.flush()?;

    let items_path = dir.join("items.csv");
    let mut writer = csv::Writer::from_path(&items_path)
        .with_context(|| format!("opening {}", items_path.display()))?;
    writer.write_record(["id", "receipt_id", "name", "price"])?;
    for row in list_items(db)? {
        writer.write_record([
            row.id.to_string(),
            row.receipt_id.to_string(),
            row.name,
            row.price.to_string(),
        ])?;
    }
    writer.flush()?;

    Ok((receipts_path, items_path))
}
