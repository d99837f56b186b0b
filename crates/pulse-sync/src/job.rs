//! One job, start to finish: reset, fetch, map and merge.

use chrono::NaiveDate;
use pulse_adapters::{fetch_all, PageSource};
use pulse_core::{date_id, LoadMode, Row, ValidationError};
use pulse_storage::{FetchError, UpsertOutcome, Warehouse, WarehouseError};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::mapping::{derive_deltas, resolve_lookups, stamp_date, RowError};
use crate::registry::LoadJob;

/// Failures that abort a whole job. Row-level failures are [`RowError`]s and only counted.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("invalid job `{job}`: {reason}")]
    Config { job: String, reason: String },
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("fetching rows for `{job}` failed: {source}")]
    Fetch {
        job: String,
        #[source]
        source: FetchError,
    },
    #[error("resetting {table} failed: {source}")]
    Reset {
        table: String,
        #[source]
        source: WarehouseError,
    },
    #[error("clearing today's rows from {table} failed: {source}")]
    ReplaceToday {
        table: String,
        #[source]
        source: WarehouseError,
    },
    #[error("connecting for `{job}` failed: {source}")]
    Connect {
        job: String,
        #[source]
        source: WarehouseError,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobOutcome {
    pub attempted: usize,
    pub succeeded: usize,
    pub inserted: usize,
    pub updated: usize,
}

/// Runs `job` against `warehouse` with rows pulled from `source`.
///
/// Full mode resets the table first; incremental mode with `replace_today` deletes today's rows.
/// Every row is applied in its own statement, so one bad row never fails the others.
pub async fn run_job(
    job: &LoadJob,
    source: &dyn PageSource<Item = JsonValue>,
    warehouse: &mut dyn Warehouse,
    mode: LoadMode,
    today: NaiveDate,
) -> Result<JobOutcome, JobError> {
    match mode {
        LoadMode::Full => {
            warehouse
                .reset_table(&job.table, job.sentinel_key.as_deref())
                .await
                .map_err(|source| JobError::Reset {
                    table: job.table.to_string(),
                    source,
                })?;
            debug!(table = %job.table, sentinel = ?job.sentinel_key, "table reset");
        }
        LoadMode::Incremental => {
            if let (true, Some(column)) = (job.replace_today, &job.date_column) {
                let filter = Row::new().with(column.as_str(), date_id(today));
                let removed = warehouse
                    .delete(&job.table, &filter)
                    .await
                    .map_err(|source| JobError::ReplaceToday {
                        table: job.table.to_string(),
                        source,
                    })?;
                debug!(table = %job.table, removed, "cleared today's rows");
            }
        }
    }

    let raw_rows = fetch_all(source).await.map_err(|source| JobError::Fetch {
        job: job.name.clone(),
        source,
    })?;

    let snapshot_keys = job.snapshot_keys();
    let mut outcome = JobOutcome::default();
    for (index, raw) in raw_rows.iter().enumerate() {
        outcome.attempted += 1;
        match apply_row(job, warehouse, raw, &snapshot_keys, today).await {
            Ok(UpsertOutcome::Inserted) => {
                outcome.succeeded += 1;
                outcome.inserted += 1;
            }
            Ok(UpsertOutcome::Updated) => {
                outcome.succeeded += 1;
                outcome.updated += 1;
            }
            Err(err) => warn!(job = %job.name, row = index, error = %err, "row skipped"),
        }
    }

    info!(
        inserted = outcome.inserted,
        updated = outcome.updated,
        "merged {}/{} rows into {} ({})",
        outcome.succeeded,
        outcome.attempted,
        job.table,
        mode
    );
    Ok(outcome)
}

async fn apply_row(
    job: &LoadJob,
    warehouse: &mut dyn Warehouse,
    raw: &JsonValue,
    snapshot_keys: &[String],
    today: NaiveDate,
) -> Result<UpsertOutcome, RowError> {
    let mut row = job.mapper.map(raw)?;
    if let Some(column) = &job.date_column {
        stamp_date(&mut row, column, today);
    }
    resolve_lookups(warehouse, &mut row, &job.lookups).await?;
    if let (false, Some(column)) = (job.deltas.is_empty(), &job.date_column) {
        derive_deltas(warehouse, &job.table, &mut row, column, snapshot_keys, &job.deltas, today)
            .await?;
    }
    Ok(warehouse.upsert(&job.table, &row, &job.keys).await?)
}
