//! Core data model for Pulse: rows, key sets, tables, load modes and page cursors.

use std::fmt;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

mod descriptor;

pub use descriptor::{parse_descriptor, MappingEntry};

pub const CRATE_NAME: &str = "pulse-core";

/// Key of the "unknown / not set" row every dimension table carries after a full load.
pub const SENTINEL_KEY: i64 = -1;

/// Contract violations detected before anything touches the store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("row has no columns")]
    EmptyRow,
    #[error("key set is empty")]
    EmptyKeySet,
    #[error("duplicate key column `{0}`")]
    DuplicateKey(String),
    #[error("key column `{0}` is not present in the row")]
    MissingKeyColumn(String),
    #[error("invalid identifier `{0}`")]
    InvalidIdentifier(String),
    #[error("table {0} does not exist")]
    UnknownTable(String),
    #[error("column `{column}` does not exist in {table}")]
    UnknownColumn { table: String, column: String },
    #[error("descriptor line {line}: {reason}")]
    Descriptor { line: u64, reason: String },
}

/// Accepts plain SQL identifiers only: `[A-Za-z_][A-Za-z0-9_]*`.
pub fn validate_identifier(ident: &str) -> Result<(), ValidationError> {
    let mut chars = ident.chars();
    let valid = match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(ValidationError::InvalidIdentifier(ident.to_string()))
    }
}

pub fn quote_ident(ident: &str) -> String {
    format!("\"{ident}\"")
}

/// Scalar cell value carried from an API response to a table column.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Text(String),
    Int(i64),
    Float(f64),
    Timestamp(DateTime<Utc>),
}

impl Value {
    /// Converts a decoded JSON value. Booleans become 0/1, nested structures keep their JSON text.
    pub fn from_json(value: &JsonValue) -> Self {
        match value {
            JsonValue::Null => Value::Null,
            JsonValue::Bool(b) => Value::Int(i64::from(*b)),
            JsonValue::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => n.as_f64().map(Value::Float).unwrap_or(Value::Null),
            },
            JsonValue::String(s) => Value::Text(s.clone()),
            other => Value::Text(other.to_string()),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            Value::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            Value::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("NULL"),
            Value::Text(s) => f.write_str(s),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Timestamp(ts) => write!(f, "{}", ts.to_rfc3339()),
        }
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int(i64::from(value))
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(value: DateTime<Utc>) -> Self {
        Value::Timestamp(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Value::Null)
    }
}

/// Column name -> value mapping that keeps insertion order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    columns: IndexMap<String, Value>,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets `column`, keeping its original position when it already exists.
    pub fn insert(&mut self, column: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.columns.insert(column.into(), value.into())
    }

    pub fn with(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(column, value);
        self
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.columns.get(column)
    }

    pub fn remove(&mut self, column: &str) -> Option<Value> {
        self.columns.shift_remove(column)
    }

    pub fn contains(&self, column: &str) -> bool {
        self.columns.contains_key(column)
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.columns.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Builds a row from a JSON object; any other JSON value yields `None`.
    pub fn from_json_object(value: &JsonValue) -> Option<Row> {
        value.as_object().map(|map| {
            map.iter()
                .map(|(column, v)| (column.clone(), Value::from_json(v)))
                .collect()
        })
    }

    /// Checks the row is non-empty and carries every key column.
    pub fn ensure_keys(&self, keys: &KeySet) -> Result<(), ValidationError> {
        if self.is_empty() {
            return Err(ValidationError::EmptyRow);
        }
        for key in keys.iter() {
            if !self.contains(key) {
                return Err(ValidationError::MissingKeyColumn(key.to_string()));
            }
        }
        Ok(())
    }

    /// Restricts the row to `columns`, in the order given. Missing columns are skipped.
    pub fn project<'a>(&self, columns: impl IntoIterator<Item = &'a str>) -> Row {
        columns
            .into_iter()
            .filter_map(|c| self.get(c).map(|v| (c.to_string(), v.clone())))
            .collect()
    }
}

impl FromIterator<(String, Value)> for Row {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        let mut row = Row::new();
        for (column, value) in iter {
            row.insert(column, value);
        }
        row
    }
}

/// Natural key of a table: a non-empty list of distinct column names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct KeySet(Vec<String>);

impl KeySet {
    pub fn new<I, S>(columns: I) -> Result<Self, ValidationError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut keys: Vec<String> = Vec::new();
        for column in columns {
            let column = column.into();
            validate_identifier(&column)?;
            if keys.contains(&column) {
                return Err(ValidationError::DuplicateKey(column));
            }
            keys.push(column);
        }
        if keys.is_empty() {
            return Err(ValidationError::EmptyKeySet);
        }
        Ok(Self(keys))
    }

    /// Parses a comma separated list such as `source,medium`.
    pub fn parse_csv(list: &str) -> Result<Self, ValidationError> {
        Self::new(list.split(',').map(str::trim).filter(|s| !s.is_empty()))
    }

    pub fn contains(&self, column: &str) -> bool {
        self.0.iter().any(|k| k == column)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl TryFrom<Vec<String>> for KeySet {
    type Error = ValidationError;

    fn try_from(value: Vec<String>) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<KeySet> for Vec<String> {
    fn from(value: KeySet) -> Self {
        value.0
    }
}

/// Optionally schema-qualified table name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableName {
    schema: Option<String>,
    name: String,
}

impl TableName {
    pub fn parse(input: &str) -> Result<Self, ValidationError> {
        let input = input.trim();
        let (schema, name) = match input.split_once('.') {
            Some((schema, name)) => (Some(schema), name),
            None => (None, input),
        };
        if let Some(schema) = schema {
            validate_identifier(schema)?;
        }
        validate_identifier(name)?;
        Ok(Self {
            schema: schema.map(str::to_string),
            name: name.to_string(),
        })
    }

    /// Adds `default_schema` when the name carries no schema of its own.
    pub fn qualify(self, default_schema: Option<&str>) -> Self {
        match (&self.schema, default_schema) {
            (None, Some(schema)) if !schema.is_empty() => Self {
                schema: Some(schema.to_string()),
                name: self.name,
            },
            _ => self,
        }
    }

    pub fn schema(&self) -> Option<&str> {
        self.schema.as_deref()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// SQL rendering with every part double-quoted.
    pub fn quoted(&self) -> String {
        match &self.schema {
            Some(schema) => format!("{}.{}", quote_ident(schema), quote_ident(&self.name)),
            None => quote_ident(&self.name),
        }
    }

    /// `d_<source>_<entity>` dimension tables are keyed by `<entity>_id`.
    pub fn default_sentinel_key(&self) -> Option<String> {
        let rest = self.name.strip_prefix("d_")?;
        let (_, entity) = rest.split_once('_')?;
        if entity.is_empty() {
            return None;
        }
        Some(format!("{entity}_id"))
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.schema {
            Some(schema) => write!(f, "{schema}.{}", self.name),
            None => f.write_str(&self.name),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadMode {
    Full,
    Incremental,
}

impl LoadMode {
    pub fn from_full_flag(full: bool) -> Self {
        if full {
            LoadMode::Full
        } else {
            LoadMode::Incremental
        }
    }

    pub fn is_full(self) -> bool {
        self == LoadMode::Full
    }
}

impl fmt::Display for LoadMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadMode::Full => f.write_str("Full"),
            LoadMode::Incremental => f.write_str("Incremental"),
        }
    }
}

/// Inclusive extraction window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    /// Full loads reach back to `epoch`, incremental loads cover `today` only.
    pub fn for_mode(mode: LoadMode, epoch: NaiveDate, today: NaiveDate) -> Self {
        match mode {
            LoadMode::Full => Self {
                start: epoch.min(today),
                end: today,
            },
            LoadMode::Incremental => Self {
                start: today,
                end: today,
            },
        }
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

/// Integer `YYYYMMDD` bucket used as the time key of fact tables.
pub fn date_id(date: NaiveDate) -> i64 {
    i64::from(date.year()) * 10_000 + i64::from(date.month()) * 100 + i64::from(date.day())
}

/// Position of the next page of a paginated API result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PageCursor {
    Offset(u64),
    Token(String),
}

/// One page as returned by a source, before aggregation.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub rows: Vec<T>,
    pub next_cursor: Option<PageCursor>,
    pub reported_total: Option<u64>,
}

impl<T> Page<T> {
    pub fn new(rows: Vec<T>) -> Self {
        Self {
            rows,
            next_cursor: None,
            reported_total: None,
        }
    }

    pub fn with_next(mut self, cursor: Option<PageCursor>) -> Self {
        self.next_cursor = cursor;
        self
    }

    pub fn with_total(mut self, total: Option<u64>) -> Self {
        self.reported_total = total;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn missing_key_column_is_rejected() {
        let keys = KeySet::new(["id"]).expect("keys");
        let row = Row::new().with("name", "x");
        assert_eq!(
            row.ensure_keys(&keys),
            Err(ValidationError::MissingKeyColumn("id".into()))
        );
        assert_eq!(Row::new().ensure_keys(&keys), Err(ValidationError::EmptyRow));
    }

    #[test]
    fn key_sets_must_be_non_empty_and_distinct() {
        assert_eq!(KeySet::new(Vec::<String>::new()), Err(ValidationError::EmptyKeySet));
        assert_eq!(
            KeySet::parse_csv("date_id, date_id"),
            Err(ValidationError::DuplicateKey("date_id".into()))
        );
        let keys = KeySet::parse_csv("source, medium").expect("keys");
        assert_eq!(keys.iter().collect::<Vec<_>>(), vec!["source", "medium"]);
        assert!(matches!(
            KeySet::parse_csv("id; drop table x"),
            Err(ValidationError::InvalidIdentifier(_))
        ));
    }

    #[test]
    fn row_keeps_insertion_order_on_replace() {
        let mut row = Row::new().with("b", 1).with("a", 2);
        row.insert("b", 3);
        assert_eq!(row.column_names().collect::<Vec<_>>(), vec!["b", "a"]);
        assert_eq!(row.get("b"), Some(&Value::Int(3)));
    }

    #[test]
    fn unqualified_tables_pick_up_default_schema() {
        let table = TableName::parse("f_twitter_daily").expect("table").qualify(Some("lyf"));
        assert_eq!(table.to_string(), "lyf.f_twitter_daily");
        assert_eq!(table.quoted(), "\"lyf\".\"f_twitter_daily\"");

        let already = TableName::parse("stage.d_ga_page").expect("table").qualify(Some("lyf"));
        assert_eq!(already.schema(), Some("stage"));

        let bare = TableName::parse("d_ga_page").expect("table").qualify(None);
        assert_eq!(bare.schema(), None);
        assert!(TableName::parse("a.b.c").is_err());
    }

    #[test]
    fn sentinel_key_follows_dimension_naming() {
        let key = |t: &str| TableName::parse(t).expect("table").default_sentinel_key();
        assert_eq!(key("d_ga_source").as_deref(), Some("source_id"));
        assert_eq!(key("d_ga_page").as_deref(), Some("page_id"));
        assert_eq!(key("f_ga_daily"), None);
        assert_eq!(key("d_ga_"), None);
    }

    #[test]
    fn date_ranges_follow_load_mode() {
        let epoch = NaiveDate::from_ymd_opt(2016, 1, 1).expect("date");
        let today = NaiveDate::from_ymd_opt(2026, 10, 18).expect("date");

        let full = DateRange::for_mode(LoadMode::from_full_flag(true), epoch, today);
        assert_eq!((full.start, full.end), (epoch, today));

        let incremental = DateRange::for_mode(LoadMode::Incremental, epoch, today);
        assert_eq!((incremental.start, incremental.end), (today, today));

        let future_epoch = NaiveDate::from_ymd_opt(2030, 1, 1).expect("date");
        assert_eq!(DateRange::for_mode(LoadMode::Full, future_epoch, today).start, today);
        assert_eq!(date_id(today), 20261018);
    }

    #[test]
    fn json_values_convert_to_scalars() {
        assert_eq!(Value::from_json(&json!(null)), Value::Null);
        assert_eq!(Value::from_json(&json!(42)), Value::Int(42));
        assert_eq!(Value::from_json(&json!(0.5)), Value::Float(0.5));
        assert_eq!(Value::from_json(&json!(true)), Value::Int(1));
        assert_eq!(Value::from_json(&json!("x")), Value::Text("x".into()));
        assert_eq!(Value::from_json(&json!([1, 2])), Value::Text("[1,2]".into()));
        assert_eq!(Value::Text(" 120 ".into()).as_i64(), Some(120));
        assert_eq!(Value::Float(3.0).as_i64(), Some(3));
    }
}
