//! Input normalization.
//!
//! Converts line-oriented text, structured record lists (JSON array or JSON
//! Lines) and tabular data (CSV/TSV with a header row) into an ordered sequence
//! of Pending [`WorkItem`]s with deterministic ids.
//!
//! A parse either yields every item or fails with the index of the first bad
//! record; partial results are never returned.

use std::collections::HashSet;
use std::path::Path;

use serde_json::Value;

use crate::error::ParseError;
use crate::item::{Metadata, WorkItem};

/// Shape of an input source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputFormat {
    /// One payload per non-blank, non-comment line.
    Lines,
    /// A JSON array of `{id?, payload, metadata?}` records.
    Records,
    /// One JSON record per line.
    JsonLines,
    Csv,
    Tsv,
}

impl InputFormat {
    /// Guess the format from a file extension. Unknown extensions are line-oriented.
    pub fn from_path(path: &Path) -> Self {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        match ext.as_str() {
            "json" => InputFormat::Records,
            "jsonl" | "ndjson" => InputFormat::JsonLines,
            "csv" => InputFormat::Csv,
            "tsv" | "tab" => InputFormat::Tsv,
            _ => InputFormat::Lines,
        }
    }
}

/// A raw input source borrowed from the caller.
#[derive(Debug, Clone, Copy)]
pub enum InputSource<'a> {
    Lines(&'a str),
    Records(&'a str),
    JsonLines(&'a str),
    Tabular { text: &'a str, delimiter: u8 },
}

impl<'a> InputSource<'a> {
    pub fn new(format: InputFormat, text: &'a str) -> Self {
        match format {
            InputFormat::Lines => InputSource::Lines(text),
            InputFormat::Records => InputSource::Records(text),
            InputFormat::JsonLines => InputSource::JsonLines(text),
            InputFormat::Csv => InputSource::Tabular {
                text,
                delimiter: b',',
            },
            InputFormat::Tsv => InputSource::Tabular {
                text,
                delimiter: b'\t',
            },
        }
    }
}

/// Field names and comment syntax used while normalizing.
#[derive(Debug, Clone)]
pub struct NormalizeOptions {
    pub id_field: String,
    pub payload_field: String,
    pub metadata_field: String,
    /// Lines starting with this prefix are ignored in line-oriented sources.
    pub comment_prefix: String,
}

impl Default for NormalizeOptions {
    fn default() -> Self {
        Self {
            id_field: "id".to_string(),
            payload_field: "payload".to_string(),
            metadata_field: "metadata".to_string(),
            comment_prefix: "#".to_string(),
        }
    }
}

/// Normalize a source into Pending work items, in input order.
pub fn normalize(
    source: InputSource<'_>,
    options: &NormalizeOptions,
) -> Result<Vec<WorkItem>, ParseError> {
    let items = match source {
        InputSource::Lines(text) => normalize_lines(text, options),
        InputSource::Records(text) => {
            let parsed: Value = serde_json::from_str(text)
                .map_err(|source| ParseError::Json { index: 0, source })?;
            match parsed {
                Value::Array(records) => normalize_records(records, options)?,
                _ => {
                    return Err(ParseError::InvalidRecord {
                        index: 0,
                        message: "expected a JSON array of records".into(),
                    });
                }
            }
        }
        InputSource::JsonLines(text) => normalize_json_lines(text, options)?,
        InputSource::Tabular { text, delimiter } => normalize_tabular(text, delimiter, options)?,
    };

    tracing::debug!(items = items.len(), "normalized input");
    Ok(items)
}

/// Read and normalize a file. The format is guessed from the extension when not given.
pub fn normalize_file(
    path: &Path,
    format: Option<InputFormat>,
    options: &NormalizeOptions,
) -> Result<Vec<WorkItem>, ParseError> {
    let format = format.unwrap_or_else(|| InputFormat::from_path(path));
    let text = std::fs::read_to_string(path)?;
    normalize(InputSource::new(format, &text), options)
}

/// Normalize already-decoded structured records.
pub fn normalize_records(
    records: Vec<Value>,
    options: &NormalizeOptions,
) -> Result<Vec<WorkItem>, ParseError> {
    let mut ids = IdRegistry::default();
    records
        .into_iter()
        .enumerate()
        .map(|(index, record)| record_to_item(record, index, options, &mut ids))
        .collect()
}

fn normalize_lines(text: &str, options: &NormalizeOptions) -> Vec<WorkItem> {
    let prefix = options.comment_prefix.as_str();
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter(|line| prefix.is_empty() || !line.starts_with(prefix))
        .enumerate()
        .map(|(position, line)| {
            WorkItem::new((position + 1).to_string(), position, Value::String(line.to_string()))
        })
        .collect()
}

fn normalize_json_lines(
    text: &str,
    options: &NormalizeOptions,
) -> Result<Vec<WorkItem>, ParseError> {
    let mut ids = IdRegistry::default();
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .enumerate()
        .map(|(index, line)| {
            let record: Value = serde_json::from_str(line)
                .map_err(|source| ParseError::Json { index, source })?;
            record_to_item(record, index, options, &mut ids)
        })
        .collect()
}

fn normalize_tabular(
    text: &str,
    delimiter: u8,
    options: &NormalizeOptions,
) -> Result<Vec<WorkItem>, ParseError> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .trim(csv::Trim::All)
        .from_reader(text.as_bytes());

    let headers = reader.headers()?.clone();
    let payload_col = headers
        .iter()
        .position(|h| h == options.payload_field)
        .ok_or_else(|| ParseError::MissingColumn(options.payload_field.clone()))?;
    let id_col = headers.iter().position(|h| h == options.id_field);

    let mut ids = IdRegistry::default();
    let mut items = Vec::new();
    for (index, row) in reader.records().enumerate() {
        let row = row?;
        let payload = row.get(payload_col).unwrap_or_default();
        if payload.is_empty() {
            return Err(ParseError::MissingField {
                index,
                field: options.payload_field.clone(),
            });
        }

        let explicit = id_col
            .and_then(|col| row.get(col))
            .filter(|cell| !cell.is_empty())
            .map(str::to_string);
        let id = ids.assign(explicit, index)?;

        let metadata: Metadata = headers
            .iter()
            .zip(row.iter())
            .enumerate()
            .filter(|(col, _)| *col != payload_col && Some(*col) != id_col)
            .map(|(_, (name, cell))| (name.to_string(), Value::String(cell.to_string())))
            .collect();

        items.push(
            WorkItem::new(id, index, Value::String(payload.to_string())).with_metadata(metadata),
        );
    }
    Ok(items)
}

fn record_to_item(
    record: Value,
    index: usize,
    options: &NormalizeOptions,
    ids: &mut IdRegistry,
) -> Result<WorkItem, ParseError> {
    let mut fields = match record {
        Value::String(payload) => {
            let id = ids.assign(None, index)?;
            return Ok(WorkItem::new(id, index, Value::String(payload)));
        }
        Value::Object(fields) => fields,
        other => {
            return Err(ParseError::InvalidRecord {
                index,
                message: format!("expected an object or a string, found {}", json_type(&other)),
            });
        }
    };

    let payload = match fields.remove(&options.payload_field) {
        None | Some(Value::Null) => {
            return Err(ParseError::MissingField {
                index,
                field: options.payload_field.clone(),
            });
        }
        Some(payload) => payload,
    };

    let explicit = match fields.remove(&options.id_field) {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Some(Value::Number(n)) if n.is_u64() || n.is_i64() => Some(n.to_string()),
        Some(other) => {
            return Err(ParseError::InvalidRecord {
                index,
                message: format!(
                    "`{}` must be a non-empty string or an integer, found {}",
                    options.id_field,
                    json_type(&other)
                ),
            });
        }
    };

    let explicit_metadata = match fields.remove(&options.metadata_field) {
        None | Some(Value::Null) => serde_json::Map::new(),
        Some(Value::Object(map)) => map,
        Some(other) => {
            return Err(ParseError::InvalidRecord {
                index,
                message: format!(
                    "`{}` must be an object, found {}",
                    options.metadata_field,
                    json_type(&other)
                ),
            });
        }
    };

    // Remaining top-level fields are annotations too; the explicit metadata
    // object wins on conflicts.
    let mut metadata: Metadata = fields.into_iter().collect();
    metadata.extend(explicit_metadata);

    let id = ids.assign(explicit, index)?;
    Ok(WorkItem::new(id, index, payload).with_metadata(metadata))
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Hands out ids and rejects collisions, which would break checkpoint accounting.
#[derive(Default)]
struct IdRegistry {
    seen: HashSet<String>,
}

impl IdRegistry {
    /// Use the explicit id when present, otherwise the 1-based position.
    fn assign(&mut self, explicit: Option<String>, index: usize) -> Result<String, ParseError> {
        let id = explicit.unwrap_or_else(|| (index + 1).to_string());
        if !self.seen.insert(id.clone()) {
            return Err(ParseError::DuplicateId { id, index });
        }
        Ok(id)
    }
}
