//! Store-agnostic upsert engine contract.

use std::borrow::Cow;

use async_trait::async_trait;
use pulse_core::{validate_identifier, KeySet, Row, TableName, ValidationError, SENTINEL_KEY};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    /// An existing record matched the key set and was updated in place.
    Updated,
}

#[derive(Debug, Error)]
pub enum WarehouseError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("statement on {table} failed: {source}")]
    Statement {
        table: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("statement on {table} rejected: {reason}")]
    Constraint { table: String, reason: String },
    #[error("database connection failed: {0}")]
    Connect(#[source] sqlx::Error),
}

impl WarehouseError {
    pub fn is_validation(&self) -> bool {
        matches!(self, WarehouseError::Validation(_))
    }
}

/// PostgreSQL text cannot hold NUL, which some APIs emit inside free-text fields.
pub fn normalize_text(input: &str) -> Cow<'_, str> {
    if input.contains('\0') {
        Cow::Owned(input.replace('\0', ""))
    } else {
        Cow::Borrowed(input)
    }
}

/// Row-level persistence operations. Implementations validate before issuing anything.
#[async_trait]
pub trait Warehouse: Send {
    /// Updates the record matching `keys`, or inserts `row` when none matches.
    async fn upsert(
        &mut self,
        table: &TableName,
        row: &Row,
        keys: &KeySet,
    ) -> Result<UpsertOutcome, WarehouseError>;

    async fn insert(&mut self, table: &TableName, row: &Row) -> Result<(), WarehouseError>;

    async fn truncate(&mut self, table: &TableName) -> Result<(), WarehouseError>;

    /// Restarts the sequence behind `key_column`; a column without one is left alone.
    async fn reset_sequence(
        &mut self,
        table: &TableName,
        key_column: &str,
    ) -> Result<(), WarehouseError>;

    /// Deletes every record matching all `filter` columns. An empty filter is rejected.
    async fn delete(&mut self, table: &TableName, filter: &Row) -> Result<u64, WarehouseError>;

    /// Records matching all `filter` columns; an empty filter returns the whole table.
    async fn query(&mut self, table: &TableName, filter: &Row) -> Result<Vec<Row>, WarehouseError>;

    /// Full-load reset: truncate, then restart the key sequence and insert the `-1` sentinel.
    async fn reset_table(
        &mut self,
        table: &TableName,
        sentinel_key: Option<&str>,
    ) -> Result<(), WarehouseError> {
        if let Some(key) = sentinel_key {
            validate_identifier(key)?;
        }
        self.truncate(table).await?;
        if let Some(key) = sentinel_key {
            self.reset_sequence(table, key).await?;
            self.insert(table, &sentinel_row(key)).await?;
        }
        Ok(())
    }

    /// Ends the session. Stores without a connection have nothing to shut down.
    async fn close(self: Box<Self>) -> Result<(), WarehouseError> {
        Ok(())
    }
}

pub(crate) fn sentinel_row(key: &str) -> Row {
    Row::new().with(key, SENTINEL_KEY)
}

pub(crate) fn validate_row(row: &Row) -> Result<(), ValidationError> {
    if row.is_empty() {
        return Err(ValidationError::EmptyRow);
    }
    row.column_names().try_for_each(validate_identifier)
}
