//! Tab-separated row-mapping descriptor: one destination table per line.
//!
//! ```text
//! table<TAB>source_fields<TAB>columns<TAB>keys
//! d_ga_source<TAB>ga:source,ga:medium<TAB>source,medium<TAB>source,medium
//! ```

use crate::{validate_identifier, KeySet, TableName, ValidationError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingEntry {
    pub table: TableName,
    pub source_fields: Vec<String>,
    pub columns: Vec<String>,
    pub keys: KeySet,
}

fn split_list(field: &str) -> Vec<String> {
    field
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn descriptor_error(line: u64, reason: impl Into<String>) -> ValidationError {
    ValidationError::Descriptor {
        line,
        reason: reason.into(),
    }
}

/// Parses descriptor text. The first line is a header and is skipped.
pub fn parse_descriptor(text: &str) -> Result<Vec<MappingEntry>, ValidationError> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(true)
        .flexible(true)
        .comment(Some(b'#'))
        .from_reader(text.as_bytes());

    let mut entries = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|err| {
            let line = err.position().map(|p| p.line()).unwrap_or_default();
            descriptor_error(line, err.to_string())
        })?;
        let line = record.position().map(|p| p.line()).unwrap_or_default();
        if record.iter().all(|f| f.trim().is_empty()) {
            continue;
        }
        if record.len() != 4 {
            return Err(descriptor_error(
                line,
                format!("expected 4 fields, found {}", record.len()),
            ));
        }

        let table = TableName::parse(&record[0]).map_err(|e| descriptor_error(line, e.to_string()))?;
        let source_fields = split_list(&record[1]);
        let columns = split_list(&record[2]);
        if source_fields.is_empty() {
            return Err(descriptor_error(line, "no source fields"));
        }
        if source_fields.len() != columns.len() {
            return Err(descriptor_error(
                line,
                format!(
                    "{} source fields but {} columns",
                    source_fields.len(),
                    columns.len()
                ),
            ));
        }
        for column in &columns {
            validate_identifier(column).map_err(|e| descriptor_error(line, e.to_string()))?;
        }
        let keys = KeySet::parse_csv(&record[3]).map_err(|e| descriptor_error(line, e.to_string()))?;
        if let Some(stray) = keys.iter().find(|k| !columns.iter().any(|c| c == k)) {
            return Err(descriptor_error(
                line,
                format!("key `{stray}` is not a destination column"),
            ));
        }

        entries.push(MappingEntry {
            table,
            source_fields,
            columns,
            keys,
        });
    }
    Ok(entries)
}
