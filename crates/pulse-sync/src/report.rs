//! Per-run load summary and its JSON report.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use pulse_core::{DateRange, LoadMode};
use serde::Serialize;
use tokio::fs;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    pub job: String,
    pub table: Option<String>,
    pub mode: LoadMode,
    pub range: DateRange,
    pub attempted: usize,
    pub succeeded: usize,
    pub error: Option<String>,
}

impl JobReport {
    pub fn is_failed(&self) -> bool {
        self.error.is_some()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LoadRunSummary {
    pub run_id: Uuid,
    pub mode: LoadMode,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub jobs: Vec<JobReport>,
    pub report_path: Option<String>,
}

impl LoadRunSummary {
    pub fn failed_jobs(&self) -> usize {
        self.jobs.iter().filter(|job| job.is_failed()).count()
    }

    pub fn rows_succeeded(&self) -> usize {
        self.jobs.iter().map(|job| job.succeeded).sum()
    }

    pub fn rows_attempted(&self) -> usize {
        self.jobs.iter().map(|job| job.attempted).sum()
    }
}

/// Writes `<reports_root>/<run_id>/load_summary.json` and returns its path.
pub async fn write_summary(reports_root: &Path, summary: &LoadRunSummary) -> Result<PathBuf> {
    let run_dir = reports_root.join(summary.run_id.to_string());
    fs::create_dir_all(&run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;

    let path = run_dir.join("load_summary.json");
    let json = serde_json::to_vec_pretty(summary).context("serializing load summary")?;
    fs::write(&path, json)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(path)
}
