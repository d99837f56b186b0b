//! Declarative job registry (`jobs.yaml`) and its resolution into runnable jobs.

use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use pulse_adapters::SourceSpec;
use pulse_core::{parse_descriptor, validate_identifier, KeySet, MappingEntry, TableName};
use serde::{Deserialize, Serialize};

use crate::job::JobError;
use crate::mapping::{DeltaSpec, Lookup, RowMapper};

#[derive(Debug, Clone, Deserialize)]
pub struct JobRegistry {
    pub jobs: Vec<JobSpec>,
}

impl JobRegistry {
    pub fn from_yaml(text: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(text)
    }

    pub fn enabled(&self) -> impl Iterator<Item = &JobSpec> {
        self.jobs.iter().filter(|job| job.enabled)
    }
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobSpec {
    pub name: String,
    /// Destination table; optional for descriptor jobs, whose entries name their own tables.
    #[serde(default)]
    pub table: Option<String>,
    #[serde(default)]
    pub keys: Option<KeySet>,
    /// Column holding the `YYYYMMDD` date id; stamped with today when a row lacks it.
    #[serde(default)]
    pub date_column: Option<String>,
    pub source: SourceSpec,
    #[serde(default)]
    pub mapping: MappingSpec,
    #[serde(default)]
    pub deltas: Vec<DeltaSpec>,
    #[serde(default)]
    pub lookups: Vec<LookupSpec>,
    #[serde(default)]
    pub sentinel_key: Option<String>,
    /// Incremental loads first delete the rows of today's date id.
    #[serde(default)]
    pub replace_today: bool,
    /// Row-mapping descriptor; every entry becomes its own job.
    #[serde(default)]
    pub descriptor: Option<PathBuf>,
    /// Source parameter receiving an entry's comma-joined source fields.
    #[serde(default)]
    pub descriptor_param: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

/// `fields` maps columns to JSON pointers, `columns` maps positionally; neither maps objects as-is.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingSpec {
    #[serde(default)]
    pub fields: IndexMap<String, String>,
    #[serde(default)]
    pub columns: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LookupSpec {
    pub column: String,
    #[serde(default)]
    pub from: Option<String>,
    pub table: String,
    #[serde(default)]
    pub key: Option<String>,
    pub natural: String,
}

/// A validated job, ready to run.
#[derive(Debug, Clone)]
pub struct LoadJob {
    pub name: String,
    pub table: TableName,
    pub keys: KeySet,
    pub mapper: RowMapper,
    pub date_column: Option<String>,
    pub deltas: Vec<DeltaSpec>,
    pub lookups: Vec<Lookup>,
    /// Key column that receives the `-1` row on a full reset.
    pub sentinel_key: Option<String>,
    pub replace_today: bool,
    pub source: SourceSpec,
}

impl LoadJob {
    /// Key columns identifying one entity across daily snapshots.
    pub fn snapshot_keys(&self) -> Vec<String> {
        self.keys
            .iter()
            .filter(|key| Some(*key) != self.date_column.as_deref())
            .map(str::to_string)
            .collect()
    }
}

/// Expands `${VAR}` placeholders. Returns the name of the first unset variable on failure.
pub fn expand_env(input: &str, lookup: impl Fn(&str) -> Option<String>) -> Result<String, String> {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            out.push_str(&rest[start..]);
            return Ok(out);
        };
        let name = &after[..end];
        out.push_str(&lookup(name).ok_or_else(|| name.to_string())?);
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Inputs for turning a [`JobSpec`] into [`LoadJob`]s.
pub struct ResolveContext<'a> {
    /// Directory relative descriptor paths are read from.
    pub base_dir: &'a Path,
    pub default_schema: Option<&'a str>,
    pub env: &'a (dyn Fn(&str) -> Option<String> + Sync),
}

impl JobSpec {
    fn config_error(&self, reason: impl Into<String>) -> JobError {
        JobError::Config {
            job: self.name.clone(),
            reason: reason.into(),
        }
    }

    pub fn resolve(&self, ctx: &ResolveContext<'_>) -> Result<Vec<LoadJob>, JobError> {
        let source = self.expanded_source(ctx)?;

        let Some(descriptor) = &self.descriptor else {
            let table = self
                .table
                .as_deref()
                .ok_or_else(|| self.config_error("`table` is required"))?;
            let table = TableName::parse(table)?.qualify(ctx.default_schema);
            let keys = self
                .keys
                .clone()
                .ok_or_else(|| self.config_error("`keys` is required"))?;
            let mapper = self.mapper()?;
            return Ok(vec![self.build(self.name.clone(), table, keys, mapper, source, ctx)?]);
        };

        let param = self
            .descriptor_param
            .as_deref()
            .ok_or_else(|| self.config_error("`descriptor_param` is required with `descriptor`"))?;
        let path = ctx.base_dir.join(descriptor);
        let text = std::fs::read_to_string(&path)
            .map_err(|err| self.config_error(format!("reading {}: {err}", path.display())))?;
        let entries = parse_descriptor(&text)?;

        entries
            .into_iter()
            .map(|entry| {
                let MappingEntry {
                    table,
                    source_fields,
                    columns,
                    keys,
                } = entry;
                let mut source = source.clone();
                source
                    .request_mut()
                    .params
                    .insert(param.to_string(), source_fields.join(","));
                let name = format!("{}:{}", self.name, table.name());
                let table = table.qualify(ctx.default_schema);
                self.build(name, table, keys, RowMapper::Columns(columns), source, ctx)
            })
            .collect()
    }

    fn expanded_source(&self, ctx: &ResolveContext<'_>) -> Result<SourceSpec, JobError> {
        let mut source = self.source.clone();
        let mut unset = None;
        source.request_mut().map_strings(|text| {
            expand_env(text, ctx.env).unwrap_or_else(|name| {
                unset.get_or_insert(name);
                text.to_string()
            })
        });
        match unset {
            Some(name) => Err(self.config_error(format!("environment variable `{name}` is not set"))),
            None => Ok(source),
        }
    }

    fn mapper(&self) -> Result<RowMapper, JobError> {
        let MappingSpec { fields, columns } = &self.mapping;
        match (fields.is_empty(), columns.is_empty()) {
            (true, true) => Ok(RowMapper::Object),
            (false, true) => {
                fields.keys().try_for_each(|c| validate_identifier(c))?;
                Ok(RowMapper::Fields(fields.clone()))
            }
            (true, false) => {
                columns.iter().try_for_each(|c| validate_identifier(c))?;
                Ok(RowMapper::Columns(columns.clone()))
            }
            (false, false) => Err(self.config_error("`mapping` takes either `fields` or `columns`")),
        }
    }

    fn build(
        &self,
        name: String,
        table: TableName,
        keys: KeySet,
        mapper: RowMapper,
        source: SourceSpec,
        ctx: &ResolveContext<'_>,
    ) -> Result<LoadJob, JobError> {
        if let Some(column) = &self.date_column {
            validate_identifier(column)?;
        }
        if !self.deltas.is_empty() && self.date_column.is_none() {
            return Err(self.config_error("`deltas` need a `date_column` to find yesterday's snapshot"));
        }
        for delta in &self.deltas {
            validate_identifier(&delta.total)?;
            validate_identifier(&delta.delta)?;
        }

        let lookups = self
            .lookups
            .iter()
            .map(|spec| -> Result<Lookup, JobError> {
                validate_identifier(&spec.column)?;
                validate_identifier(&spec.natural)?;
                let from = spec.from.clone().unwrap_or_else(|| spec.column.clone());
                let key = spec.key.clone().unwrap_or_else(|| spec.column.clone());
                validate_identifier(&from)?;
                validate_identifier(&key)?;
                Ok(Lookup {
                    column: spec.column.clone(),
                    from,
                    table: TableName::parse(&spec.table)?.qualify(ctx.default_schema),
                    key,
                    natural: spec.natural.clone(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let sentinel_key = self
            .sentinel_key
            .clone()
            .or_else(|| table.default_sentinel_key());
        if let Some(key) = &sentinel_key {
            validate_identifier(key)?;
        }

        Ok(LoadJob {
            name,
            table,
            keys,
            mapper,
            date_column: self.date_column.clone(),
            deltas: self.deltas.clone(),
            lookups,
            sentinel_key,
            replace_today: self.replace_today,
            source,
        })
    }
}
