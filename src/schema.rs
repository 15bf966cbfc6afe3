//! Receipt domain types.
//!
//! `ExtractionResult` is the validation boundary: the lenient shape the model
//! response is parsed into before any field contract is enforced. The typed
//! `ReceiptRecord`/`LineItem` pair is what actually reaches storage.

use serde::{Deserialize, Serialize};

/// Raw candidate record returned by the extraction client, pre-validation.
///
/// Every field is optional and numerics stay as `serde_json::Value` so that a
/// model that omits a key or returns `"total": "1280"` still parses here; the
/// validator owns rejecting those shapes with a named error.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExtractionResult {
    #[serde(default)]
    pub store: Option<String>,
    #[serde(default)]
    pub genre: Option<String>,
    #[serde(default)]
    pub datetime: Option<String>,
    #[serde(default)]
    pub total: Option<serde_json::Value>,
    #[serde(default)]
    pub items: Option<Vec<RawItem>>,
}

/// One pre-validation line item.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawItem {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub price: Option<serde_json::Value>,
}

/// A validated receipt ready for insertion. Identity is assigned by storage.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReceiptRecord {
    pub store: String,
    pub genre: String,
    /// ISO 8601 with seconds precision, e.g. `2024-05-01T12:30:00`.
    pub datetime: String,
    pub total: f64,
}

/// A validated line item. Negative prices are allowed (discount lines).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LineItem {
    pub name: String,
    pub price: f64,
}

/// A persisted receipt as read back from storage, items included.
#[derive(Debug, Clone, Serialize)]
pub struct Receipt {
    pub id: i64,
    pub store: String,
    pub genre: String,
    pub datetime: String,
    pub total: f64,
    pub items: Vec<StoredItem>,
}

/// A persisted line item row.
#[derive(Debug, Clone, Serialize)]
pub struct StoredItem {
    pub id: i64,
    pub receipt_id: i64,
    pub name: String,
    pub price: f64,
}
