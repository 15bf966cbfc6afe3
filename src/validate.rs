//! Record validation and normalization.
//!
//! Enforces the required-field contract on a candidate record before it can
//! reach storage. The datetime is normalized to ISO 8601 with seconds
//! precision; genre is a soft inference and defaults instead of failing.

use chrono::NaiveDateTime;
use tracing::warn;

use crate::error::{PipelineError, PipelineResult};
use crate::schema::{ExtractionResult, LineItem, ReceiptRecord};

/// Genre sentinel used when the model omits the category.
pub const GENRE_UNCATEGORIZED: &str = "uncategorized";

/// Accepted datetime layouts, tried in order. Variants without seconds are
/// padded to `:00` by the normalization rather than rejected.
const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y/%m/%d %H:%M:%S",
    "%Y/%m/%d %H:%M",
];

/// Validate one extracted record into its storable form.
pub fn validate(raw: ExtractionResult) -> PipelineResult<(ReceiptRecord, Vec<LineItem>)> {
    let store = raw
        .store
        .filter(|s| !s.trim().is_empty())
        .ok_or(PipelineError::MissingField("store"))?;

    let genre = raw
        .genre
        .filter(|g| !g.trim().is_empty())
        .unwrap_or_else(|| GENRE_UNCATEGORIZED.to_string());

    let datetime_raw = raw
        .datetime
        .filter(|d| !d.trim().is_empty())
        .ok_or(PipelineError::MissingField("datetime"))?;
    let datetime = normalize_datetime(&datetime_raw)?;

    let total_value = raw.total.ok_or(PipelineError::MissingField("total"))?;
    let total = as_number(&total_value)
        .ok_or_else(|| PipelineError::invalid_value("total", "not numeric"))?;
    if total < 0.0 {
        return Err(PipelineError::invalid_value("total", "negative"));
    }

    let raw_items = raw.items.ok_or(PipelineError::MissingField("items"))?;
    let mut items = Vec::with_capacity(raw_items.len());
    for raw_item in raw_items {
        let name = raw_item
            .name
            .filter(|n| !n.trim().is_empty())
            .ok_or_else(|| PipelineError::invalid_value("items", "entry missing name"))?;
        let price = raw_item
            .price
            .as_ref()
            .and_then(as_number)
            .ok_or_else(|| PipelineError::invalid_value("items", "entry missing price"))?;
        // Negative prices are legitimate discount lines.
        items.push(LineItem { name, price });
    }

    let item_sum: f64 = items.iter().map(|i| i.price).sum();
    if !items.is_empty() && (item_sum - total).abs() > 0.005 {
        // Totals are often tax-inclusive while item prices are not. Logged,
        // never auto-corrected.
        warn!(
            store = %store,
            total,
            item_sum,
            "receipt total differs from line item sum"
        );
    }

    Ok((
        ReceiptRecord {
            store,
            genre,
            datetime,
            total,
        },
        items,
    ))
}

/// Normalize a model-supplied timestamp to `%Y-%m-%dT%H:%M:%S`.
fn normalize_datetime(raw: &str) -> PipelineResult<String> {
    let trimmed = raw.trim();

    // Offset-bearing ISO 8601 first; the offset is dropped after parsing
    // since the store clock is all the receipt ever knew.
    if let Ok(parsed) = chrono::DateTime::parse_from_rfc3339(trimmed) {
        return Ok(parsed.naive_local().format("%Y-%m-%dT%H:%M:%S").to_string());
    }

    for format in DATETIME_FORMATS {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Ok(parsed.format("%Y-%m-%dT%H:%M:%S").to_string());
        }
    }

    Err(PipelineError::invalid_value(
        "datetime",
        format!("not a recognized date-time: {trimmed:?}"),
    ))
}

fn as_number(value: &serde_json::Value) -> Option<f64> {
    value.as_f64()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn candidate() -> ExtractionResult {
        serde_json::from_value(json!({
            "store": "ローソン",
            "genre": "コンビニ",
            "datetime": "2024-05-01T12:30:00",
            "total": 640,
            "items": [
                {"name": "おにぎり", "price": 140},
                {"name": "コーヒー", "price": 500}
            ]
        }))
        .unwrap()
    }

    #[test]
    fn valid_record_passes_through() {
        let (receipt, items) = validate(candidate()).unwrap();
        assert_eq!(receipt.store, "ローソン");
        assert_eq!(receipt.datetime, "2024-05-01T12:30:00");
        assert_eq!(receipt.total, 640.0);
        assert_eq!(items.len(), 2);
    }

    #[test]
    fn missing_store_is_named() {
        let mut raw = candidate();
        raw.store = None;
        assert!(matches!(
            validate(raw).unwrap_err(),
            PipelineError::MissingField("store")
        ));
    }

    #[test]
    fn missing_items_key_is_named() {
        let mut raw = candidate();
        raw.items = None;
        assert!(matches!(
            validate(raw).unwrap_err(),
            PipelineError::MissingField("items")
        ));
    }

    #[test]
    fn empty_items_list_is_fine() {
        let mut raw = candidate();
        raw.items = Some(vec![]);
        let (_, items) = validate(raw).unwrap();
        assert!(items.is_empty());
    }

    #[test]
    fn string_total_is_invalid() {
        let mut raw = candidate();
        raw.total = Some(json!("640"));
        assert!(matches!(
            validate(raw).unwrap_err(),
            PipelineError::InvalidValue { field: "total", .. }
        ));
    }

    #[test]
    fn negative_total_is_invalid() {
        let mut raw = candidate();
        raw.total = Some(json!(-1));
        assert!(matches!(
            validate(raw).unwrap_err(),
            PipelineError::InvalidValue { field: "total", .. }
        ));
    }

    #[test]
    fn negative_item_price_is_a_discount_not_an_error() {
        let mut raw = candidate();
        raw.items
            .as_mut()
            .unwrap()
            .push(serde_json::from_value(json!({"name": "値引き", "price": -50})).unwrap());
        let (_, items) = validate(raw).unwrap();
        assert_eq!(items.last().unwrap().price, -50.0);
    }

    #[test]
    fn item_without_price_is_invalid() {
        let mut raw = candidate();
        raw.items
            .as_mut()
            .unwrap()
            .push(serde_json::from_value(json!({"name": "なぞの品"})).unwrap());
        assert!(matches!(
            validate(raw).unwrap_err(),
            PipelineError::InvalidValue { field: "items", .. }
        ));
    }

    #[test]
    fn genre_defaults_to_uncategorized() {
        let mut raw = candidate();
        raw.genre = None;
        let (receipt, _) = validate(raw).unwrap();
        assert_eq!(receipt.genre, GENRE_UNCATEGORIZED);
    }

    #[test]
    fn datetime_without_seconds_is_padded() {
        assert_eq!(
            normalize_datetime("2024-05-01T12:30").unwrap(),
            "2024-05-01T12:30:00"
        );
    }

    #[test]
    fn full_datetime_passes_unchanged() {
        assert_eq!(
            normalize_datetime("2024-05-01T12:30:45").unwrap(),
            "2024-05-01T12:30:45"
        );
    }

    #[test]
    fn space_separated_datetime_is_accepted() {
        assert_eq!(
            normalize_datetime("2024/05/01 12:30").unwrap(),
            "2024-05-01T12:30:00"
        );
    }

    #[test]
    fn unparsable_datetime_is_invalid() {
        assert!(matches!(
            normalize_datetime("yesterday-ish").unwrap_err(),
            PipelineError::InvalidValue {
                field: "datetime",
                ..
            }
        ));
    }
}
