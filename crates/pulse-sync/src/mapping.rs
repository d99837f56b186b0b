//! Raw API row -> warehouse row: column mapping, date stamping, dimension lookups and deltas.

use chrono::{Days, NaiveDate};
use indexmap::IndexMap;
use pulse_core::{date_id, Row, TableName, Value, SENTINEL_KEY};
use pulse_storage::{Warehouse, WarehouseError};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

/// Placeholder analytics APIs report for an absent dimension value.
pub const NOT_SET: &str = "(not set)";

#[derive(Debug, Error)]
pub enum RowError {
    #[error("cannot map row: {0}")]
    Mapping(String),
    #[error("lookup of `{column}` in {table} failed: {source}")]
    Lookup {
        column: String,
        table: String,
        #[source]
        source: WarehouseError,
    },
    #[error("reading prior snapshot from {table} failed: {source}")]
    Prior {
        table: String,
        #[source]
        source: WarehouseError,
    },
    #[error(transparent)]
    Warehouse(#[from] WarehouseError),
}

/// How a raw row becomes a [`Row`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowMapper {
    /// A JSON object maps key-for-column.
    Object,
    /// Column -> JSON pointer into the raw row. Missing fields map to NULL.
    Fields(IndexMap<String, String>),
    /// Positional: element `i` of a raw array lands in column `i`. Extra elements are ignored.
    Columns(Vec<String>),
}

impl RowMapper {
    pub fn map(&self, raw: &JsonValue) -> Result<Row, RowError> {
        match self {
            RowMapper::Object => Row::from_json_object(raw)
                .ok_or_else(|| RowError::Mapping(format!("expected an object, got {}", kind_of(raw)))),
            RowMapper::Fields(fields) => Ok(fields
                .iter()
                .map(|(column, pointer)| {
                    let value = raw.pointer(pointer).map(Value::from_json).unwrap_or(Value::Null);
                    (column.clone(), value)
                })
                .collect()),
            RowMapper::Columns(columns) => {
                let items = raw
                    .as_array()
                    .ok_or_else(|| RowError::Mapping(format!("expected a list, got {}", kind_of(raw))))?;
                if items.len() < columns.len() {
                    return Err(RowError::Mapping(format!(
                        "expected at least {} values, got {}",
                        columns.len(),
                        items.len()
                    )));
                }
                Ok(columns
                    .iter()
                    .zip(items)
                    .map(|(column, item)| (column.clone(), Value::from_json(item)))
                    .collect())
            }
        }
    }
}

fn kind_of(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "a boolean",
        JsonValue::Number(_) => "a number",
        JsonValue::String(_) => "a string",
        JsonValue::Array(_) => "a list",
        JsonValue::Object(_) => "an object",
    }
}

/// Sets `column` to today's date id unless the row already carries one.
pub fn stamp_date(row: &mut Row, column: &str, today: NaiveDate) {
    if row.get(column).map_or(true, Value::is_null) {
        row.insert(column, date_id(today));
    }
}

/// Replaces a natural value with the surrogate key of a dimension record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lookup {
    /// Row column that receives the surrogate key.
    pub column: String,
    /// Row column holding the natural value; dropped after the lookup when it differs from `column`.
    pub from: String,
    pub table: TableName,
    /// Surrogate key column of the dimension table.
    pub key: String,
    /// Natural value column of the dimension table.
    pub natural: String,
}

/// Resolves every lookup in order. Unknown and `(not set)` values resolve to the sentinel key.
pub async fn resolve_lookups(
    warehouse: &mut dyn Warehouse,
    row: &mut Row,
    lookups: &[Lookup],
) -> Result<(), RowError> {
    for lookup in lookups {
        let natural = row.get(&lookup.from).cloned().unwrap_or(Value::Null);
        let surrogate = if natural.is_null() || natural.as_text() == Some(NOT_SET) {
            Value::Int(SENTINEL_KEY)
        } else {
            let filter = Row::new().with(lookup.natural.as_str(), natural);
            let matches = warehouse
                .query(&lookup.table, &filter)
                .await
                .map_err(|source| RowError::Lookup {
                    column: lookup.column.clone(),
                    table: lookup.table.to_string(),
                    source,
                })?;
            matches
                .first()
                .and_then(|record| record.get(&lookup.key))
                .filter(|value| !value.is_null())
                .cloned()
                .unwrap_or(Value::Int(SENTINEL_KEY))
        };

        if lookup.from != lookup.column {
            row.remove(&lookup.from);
        }
        row.insert(lookup.column.as_str(), surrogate);
    }
    Ok(())
}

/// Daily change of a cumulative metric.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaSpec {
    /// Column with the running total reported by the API.
    pub total: String,
    /// Column receiving `today - yesterday`.
    pub delta: String,
}

/// Fills every delta column from `prior`. Without a prior snapshot every delta is 0.
pub fn apply_deltas(row: &mut Row, prior: Option<&Row>, deltas: &[DeltaSpec]) {
    for spec in deltas {
        let value = match prior {
            Some(prior) => difference(row.get(&spec.total), prior.get(&spec.total)),
            None => Value::Int(0),
        };
        row.insert(spec.delta.as_str(), value);
    }
}

fn difference(today: Option<&Value>, prior: Option<&Value>) -> Value {
    let (Some(today), Some(prior)) = (today, prior) else {
        return Value::Int(0);
    };
    if let Some(delta) = today
        .as_i64()
        .zip(prior.as_i64())
        .and_then(|(a, b)| a.checked_sub(b))
    {
        return Value::Int(delta);
    }
    match (today.as_f64(), prior.as_f64()) {
        (Some(a), Some(b)) => Value::Float(a - b),
        _ => Value::Int(0),
    }
}

/// Looks up yesterday's snapshot of the same entity and derives the deltas from it.
pub async fn derive_deltas(
    warehouse: &mut dyn Warehouse,
    table: &TableName,
    row: &mut Row,
    date_column: &str,
    snapshot_keys: &[String],
    deltas: &[DeltaSpec],
    today: NaiveDate,
) -> Result<(), RowError> {
    let Some(yesterday) = today.checked_sub_days(Days::new(1)) else {
        apply_deltas(row, None, deltas);
        return Ok(());
    };

    let mut filter = Row::new().with(date_column, date_id(yesterday));
    for key in snapshot_keys {
        filter.insert(key.as_str(), row.get(key).cloned().unwrap_or(Value::Null));
    }
    let prior = warehouse
        .query(table, &filter)
        .await
        .map_err(|source| RowError::Prior {
            table: table.to_string(),
            source,
        })?;

    apply_deltas(row, prior.first(), deltas);
    Ok(())
}

#[cfg(test)]
mod tests {
    use pulse_storage::MemoryWarehouse;
    use serde_json::json;

    use super::*;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, 18).expect("date")
    }

    fn follower_deltas() -> Vec<DeltaSpec> {
        vec![DeltaSpec {
            total: "total_followers".to_string(),
            delta: "followers".to_string(),
        }]
    }

    #[test]
    fn field_mapping_follows_pointers_and_nulls_missing_fields() {
        let mapper = RowMapper::Fields(IndexMap::from([
            ("video_id".to_string(), "/id".to_string()),
            ("total_views".to_string(), "/statistics/viewCount".to_string()),
            ("total_dislikes".to_string(), "/statistics/dislikeCount".to_string()),
        ]));
        let raw = json!({ "id": "v1", "statistics": { "viewCount": "1200" } });

        let row = mapper.map(&raw).expect("map");

        assert_eq!(row.column_names().collect::<Vec<_>>(), ["video_id", "total_views", "total_dislikes"]);
        assert_eq!(row.get("total_views"), Some(&Value::Text("1200".to_string())));
        assert_eq!(row.get("total_dislikes"), Some(&Value::Null));
    }

    #[test]
    fn positional_mapping_needs_enough_values() {
        let mapper = RowMapper::Columns(vec!["source".to_string(), "medium".to_string()]);

        let row = mapper.map(&json!(["google", "organic", "17"])).expect("map");
        assert_eq!(row.len(), 2);
        assert_eq!(row.get("medium"), Some(&Value::Text("organic".to_string())));

        assert!(matches!(mapper.map(&json!(["google"])), Err(RowError::Mapping(_))));
        assert!(matches!(mapper.map(&json!({ "source": "x" })), Err(RowError::Mapping(_))));
    }

    #[test]
    fn object_mapping_rejects_scalars() {
        assert!(RowMapper::Object.map(&json!({ "list_id": "a1" })).is_ok());
        assert!(RowMapper::Object.map(&json!("a1")).is_err());
    }

    #[test]
    fn date_is_stamped_only_when_absent() {
        let mut row = Row::new().with("total_followers", 120);
        stamp_date(&mut row, "date_id", today());
        assert_eq!(row.get("date_id"), Some(&Value::Int(20261018)));

        let mut dated = Row::new().with("date_id", "20261001");
        stamp_date(&mut dated, "date_id", today());
        assert_eq!(dated.get("date_id"), Some(&Value::Text("20261001".to_string())));
    }

    #[tokio::test]
    async fn delta_against_prior_snapshot() {
        let table = TableName::parse("f_twitter_daily").expect("table");
        let mut wh = MemoryWarehouse::new();
        wh.insert(&table, &Row::new().with("date_id", 20261017).with("total_followers", 100))
            .await
            .expect("seed");

        let mut row = Row::new().with("date_id", 20261018).with("total_followers", 120);
        derive_deltas(&mut wh, &table, &mut row, "date_id", &[], &follower_deltas(), today())
            .await
            .expect("deltas");

        assert_eq!(row.get("followers"), Some(&Value::Int(20)));
    }

    #[tokio::test]
    async fn delta_without_prior_snapshot_is_zero() {
        let table = TableName::parse("f_twitter_daily").expect("table");
        let mut wh = MemoryWarehouse::new();

        let mut row = Row::new().with("date_id", 20261018).with("total_followers", 120);
        derive_deltas(&mut wh, &table, &mut row, "date_id", &[], &follower_deltas(), today())
            .await
            .expect("deltas");

        assert_eq!(row.get("followers"), Some(&Value::Int(0)));
    }

    #[tokio::test]
    async fn prior_snapshot_is_matched_per_entity() {
        let table = TableName::parse("f_youtube_daily").expect("table");
        let mut wh = MemoryWarehouse::new();
        for (video, views) in [("v1", 50), ("v2", 900)] {
            wh.insert(
                &table,
                &Row::new().with("date_id", 20261017).with("video_id", video).with("total_views", views),
            )
            .await
            .expect("seed");
        }
        let deltas = vec![DeltaSpec {
            total: "total_views".to_string(),
            delta: "views".to_string(),
        }];

        let mut row = Row::new().with("date_id", 20261018).with("video_id", "v1").with("total_views", "75");
        derive_deltas(&mut wh, &table, &mut row, "date_id", &["video_id".to_string()], &deltas, today())
            .await
            .expect("deltas");

        assert_eq!(row.get("views"), Some(&Value::Int(25)));
    }

    #[test]
    fn null_prior_metric_only_zeroes_that_delta() {
        let deltas = vec![
            DeltaSpec {
                total: "total_followers".to_string(),
                delta: "followers".to_string(),
            },
            DeltaSpec {
                total: "total_tweets".to_string(),
                delta: "tweets".to_string(),
            },
        ];
        let prior = Row::new().with("total_followers", Value::Null).with("total_tweets", 40);
        let mut row = Row::new().with("total_followers", 120).with("total_tweets", 44);

        apply_deltas(&mut row, Some(&prior), &deltas);

        assert_eq!(row.get("followers"), Some(&Value::Int(0)));
        assert_eq!(row.get("tweets"), Some(&Value::Int(4)));
    }

    #[test]
    fn overflowing_integer_delta_falls_back_to_float() {
        let prior = Row::new().with("total_followers", i64::MIN);
        let mut row = Row::new().with("total_followers", i64::MAX);

        apply_deltas(&mut row, Some(&prior), &follower_deltas());

        assert_eq!(
            row.get("followers"),
            Some(&Value::Float(i64::MAX as f64 - i64::MIN as f64))
        );
    }

    #[tokio::test]
    async fn lookups_resolve_surrogates_and_fall_back_to_sentinel() {
        let dim = TableName::parse("d_ga_source").expect("table");
        let mut wh = MemoryWarehouse::new();
        wh.insert(&dim, &Row::new().with("source_id", 7).with("source_medium", "google / organic"))
            .await
            .expect("seed");
        let lookups = [Lookup {
            column: "source_id".to_string(),
            from: "source_id".to_string(),
            table: dim.clone(),
            key: "source_id".to_string(),
            natural: "source_medium".to_string(),
        }];

        let mut known = Row::new().with("source_id", "google / organic");
        let mut unknown = Row::new().with("source_id", "bing / cpc");
        let mut not_set = Row::new().with("source_id", NOT_SET);
        for row in [&mut known, &mut unknown, &mut not_set] {
            resolve_lookups(&mut wh, row, &lookups).await.expect("lookup");
        }

        assert_eq!(known.get("source_id"), Some(&Value::Int(7)));
        assert_eq!(unknown.get("source_id"), Some(&Value::Int(SENTINEL_KEY)));
        assert_eq!(not_set.get("source_id"), Some(&Value::Int(SENTINEL_KEY)));
    }

    #[tokio::test]
    async fn lookup_from_another_column_drops_the_natural_value() {
        let dim = TableName::parse("d_ga_page").expect("table");
        let mut wh = MemoryWarehouse::new();
        wh.insert(&dim, &Row::new().with("page_id", 3).with("page_title", "Home"))
            .await
            .expect("seed");
        let lookups = [Lookup {
            column: "page_id".to_string(),
            from: "page_title".to_string(),
            table: dim,
            key: "page_id".to_string(),
            natural: "page_title".to_string(),
        }];

        let mut row = Row::new().with("date_id", 20261018).with("page_title", "Home");
        resolve_lookups(&mut wh, &mut row, &lookups).await.expect("lookup");

        assert!(!row.contains("page_title"));
        assert_eq!(row.get("page_id"), Some(&Value::Int(3)));
    }
}
