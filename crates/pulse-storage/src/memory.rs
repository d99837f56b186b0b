//! In-process warehouse with the same contract as [`crate::PgWarehouse`], for dry runs and tests.

use std::collections::HashMap;

use async_trait::async_trait;
use pulse_core::{validate_identifier, KeySet, Row, TableName, Value};

use crate::warehouse::{validate_row, UpsertOutcome, Warehouse, WarehouseError};

#[derive(Debug, Default, Clone)]
struct MemoryTable {
    rows: Vec<Row>,
    /// Serial column -> next generated value.
    serials: HashMap<String, i64>,
}

#[derive(Debug, Default)]
pub struct MemoryWarehouse {
    tables: HashMap<TableName, MemoryTable>,
    statements: usize,
}

/// Numeric values compare by magnitude so `"7"` matches `7`, as a typed column would.
fn values_match(a: &Value, b: &Value) -> bool {
    if a == b {
        return true;
    }
    match (a, b) {
        (Value::Null, _) | (_, Value::Null) => false,
        _ => matches!((a.as_f64(), b.as_f64()), (Some(x), Some(y)) if x == y),
    }
}

fn matches_filter(row: &Row, filter: &Row) -> bool {
    filter.iter().all(|(column, expected)| match row.get(column) {
        Some(actual) => values_match(actual, expected) || (actual.is_null() && expected.is_null()),
        None => expected.is_null(),
    })
}

impl MemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares `column` as a serial key; generated values start at 0.
    pub fn with_serial(mut self, table: &TableName, column: &str) -> Self {
        self.tables
            .entry(table.clone())
            .or_default()
            .serials
            .insert(column.to_string(), 0);
        self
    }

    pub fn rows(&self, table: &TableName) -> &[Row] {
        self.tables.get(table).map(|t| t.rows.as_slice()).unwrap_or(&[])
    }

    pub fn next_serial(&self, table: &TableName, column: &str) -> Option<i64> {
        self.tables.get(table)?.serials.get(column).copied()
    }

    /// Number of statements that reached the store, i.e. passed validation.
    pub fn statements_issued(&self) -> usize {
        self.statements
    }

    fn table_mut(&mut self, table: &TableName) -> &mut MemoryTable {
        self.statements += 1;
        self.tables.entry(table.clone()).or_default()
    }
}

impl MemoryTable {
    fn fill_serials(&mut self, row: &mut Row) {
        for (column, next) in self.serials.iter_mut() {
            if row.get(column).map_or(true, Value::is_null) {
                row.insert(column.clone(), *next);
                *next += 1;
            }
        }
    }

    fn check_unique(&self, table: &TableName, row: &Row) -> Result<(), WarehouseError> {
        for column in self.serials.keys() {
            let Some(value) = row.get(column) else { continue };
            if self
                .rows
                .iter()
                .any(|existing| existing.get(column).is_some_and(|v| values_match(v, value)))
            {
                return Err(WarehouseError::Constraint {
                    table: table.to_string(),
                    reason: format!("duplicate key value for `{column}`: {value}"),
                });
            }
        }
        Ok(())
    }

    fn push(&mut self, table: &TableName, row: &Row) -> Result<(), WarehouseError> {
        let mut row = row.clone();
        self.fill_serials(&mut row);
        self.check_unique(table, &row)?;
        self.rows.push(row);
        Ok(())
    }
}

#[async_trait]
impl Warehouse for MemoryWarehouse {
    async fn upsert(
        &mut self,
        table: &TableName,
        row: &Row,
        keys: &KeySet,
    ) -> Result<UpsertOutcome, WarehouseError> {
        row.ensure_keys(keys)?;
        validate_row(row)?;
        let key_filter = row.project(keys.iter());
        let state = self.table_mut(table);

        match state.rows.iter().position(|r| matches_filter(r, &key_filter)) {
            Some(index) => {
                let existing = &mut state.rows[index];
                for (column, value) in row.iter().filter(|(c, _)| !keys.contains(c)) {
                    existing.insert(column, value.clone());
                }
                Ok(UpsertOutcome::Updated)
            }
            None => {
                state.push(table, row)?;
                Ok(UpsertOutcome::Inserted)
            }
        }
    }

    async fn insert(&mut self, table: &TableName, row: &Row) -> Result<(), WarehouseError> {
        validate_row(row)?;
        self.table_mut(table).push(table, row)
    }

    async fn truncate(&mut self, table: &TableName) -> Result<(), WarehouseError> {
        self.table_mut(table).rows.clear();
        Ok(())
    }

    async fn reset_sequence(
        &mut self,
        table: &TableName,
        key_column: &str,
    ) -> Result<(), WarehouseError> {
        validate_identifier(key_column)?;
        if let Some(next) = self.table_mut(table).serials.get_mut(key_column) {
            *next = 0;
        }
        Ok(())
    }

    async fn delete(&mut self, table: &TableName, filter: &Row) -> Result<u64, WarehouseError> {
        validate_row(filter)?;
        let state = self.table_mut(table);
        let before = state.rows.len();
        state.rows.retain(|r| !matches_filter(r, filter));
        Ok((before - state.rows.len()) as u64)
    }

    async fn query(&mut self, table: &TableName, filter: &Row) -> Result<Vec<Row>, WarehouseError> {
        if !filter.is_empty() {
            validate_row(filter)?;
        }
        let state = self.table_mut(table);
        Ok(state
            .rows
            .iter()
            .filter(|r| matches_filter(r, filter))
            .cloned()
            .collect())
    }
}
