//! Declarative per-object mapping configuration.
//!
//! One mapping file describes how a master-data export for one object
//! becomes ingest-ready CSV: which source columns feed which fields, the
//! encodings on either side, and any fixed columns appended to every row.
//! Files are YAML or JSON; defaults match the shape the legacy system
//! actually emits (CP932, comma-delimited, LF, no header).

use std::path::{Path, PathBuf};

use encoding_rs::Encoding;
use serde::Deserialize;

use crate::error::AppError;
use crate::salesforce::Operation;

// ─────────────────────────────────────────────────────────────────────────────
// Mapping Types
// ─────────────────────────────────────────────────────────────────────────────

/// One source-column-to-field pair. Output column order is declaration
/// order.
#[derive(Debug, Clone, Deserialize)]
pub struct MappingEntry {
    /// 0-based column index in the source row.
    pub index: usize,
    /// Target field API name.
    pub field: String,
}

/// A fixed value appended as its own column to every output row.
#[derive(Debug, Clone, Deserialize)]
pub struct ExtraField {
    pub field: String,
    #[serde(default)]
    pub value: String,
}

/// Conversion and job settings for one master object.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MappingSpec {
    /// Short key identifying the master (e.g. "DPT"). Used in output names.
    pub master_key: String,
    /// Target object API name.
    pub object: String,
    /// Ingest operation. Defaults to upsert, the usual master-data mode.
    #[serde(default = "default_operation")]
    pub operation: Operation,
    /// External ID field; required when `operation` is upsert.
    #[serde(default)]
    pub external_id_field: Option<String>,
    /// Source encoding label (WHATWG). The legacy exports are CP932.
    #[serde(default = "default_input_encoding")]
    pub input_encoding: String,
    /// Output encoding label.
    #[serde(default = "default_output_encoding")]
    pub output_encoding: String,
    /// Source field delimiter, a single ASCII character.
    #[serde(default = "default_delimiter")]
    pub delimiter: String,
    /// Output record terminator: "\n" or "\r\n".
    #[serde(default = "default_line_terminator")]
    pub line_terminator: String,
    /// Whether the source file carries a header row to skip.
    #[serde(default)]
    pub has_header: bool,
    /// Owner-assignment column appended after the mapped fields.
    #[serde(default)]
    pub owner_column: Option<String>,
    /// Value written into the owner column. Empty leaves assignment to the
    /// server.
    #[serde(default)]
    pub owner_value: String,
    /// Fixed columns appended after the owner column, in declaration order.
    #[serde(default)]
    pub extra_fields: Vec<ExtraField>,
    /// Column-to-field pairs. Must be non-empty.
    pub mapping: Vec<MappingEntry>,
    /// Default converted-CSV path for this master.
    #[serde(default)]
    pub output_csv: Option<PathBuf>,
}

fn default_operation() -> Operation {
    Operation::Upsert
}

fn default_input_encoding() -> String {
    "cp932".to_string()
}

fn default_output_encoding() -> String {
    "utf-8".to_string()
}

fn default_delimiter() -> String {
    ",".to_string()
}

fn default_line_terminator() -> String {
    "\n".to_string()
}

// ─────────────────────────────────────────────────────────────────────────────
// Loading & Validation
// ─────────────────────────────────────────────────────────────────────────────

impl MappingSpec {
    /// Loads and validates a mapping file. The extension picks the format:
    /// `.yaml`/`.yml` or `.json`.
    pub fn load(path: &Path) -> Result<Self, AppError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            AppError::Config(format!("Cannot read mapping file {}: {}", path.display(), e))
        })?;

        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());

        let spec: MappingSpec = match ext.as_deref() {
            Some("yaml") | Some("yml") => serde_yaml::from_str(&content)
                .map_err(|e| AppError::Config(format!("Invalid mapping YAML: {}", e)))?,
            Some("json") => serde_json::from_str(&content)
                .map_err(|e| AppError::Config(format!("Invalid mapping JSON: {}", e)))?,
            _ => {
                return Err(AppError::Config(format!(
                    "Mapping file must be .yaml, .yml, or .json: {}",
                    path.display()
                )))
            }
        };

        spec.validate()?;
        Ok(spec)
    }

    /// Parses a spec from YAML text. Used by tests and embedded configs.
    pub fn from_yaml(yaml: &str) -> Result<Self, AppError> {
        let spec: MappingSpec = serde_yaml::from_str(yaml)
            .map_err(|e| AppError::Config(format!("Invalid mapping YAML: {}", e)))?;
        spec.validate()?;
        Ok(spec)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.mapping.is_empty() {
            return Err(AppError::Config(
                "Mapping must declare at least one column-to-field entry".into(),
            ));
        }

        if self.operation == Operation::Upsert && self.external_id_field.is_none() {
            return Err(AppError::Config(format!(
                "{}: upsert requires external_id_field",
                self.master_key
            )));
        }

        if matches!(self.operation, Operation::Query | Operation::QueryAll) {
            return Err(AppError::Config(format!(
                "{}: mapping operation must be an ingest operation",
                self.master_key
            )));
        }

        self.delimiter_byte()?;
        self.input_encoding()?;
        self.output_encoding()?;

        if self.line_terminator != "\n" && self.line_terminator != "\r\n" {
            return Err(AppError::Config(
                r#"line_terminator must be "\n" or "\r\n""#.into(),
            ));
        }

        Ok(())
    }

    /// The delimiter as a byte for the CSV reader.
    pub fn delimiter_byte(&self) -> Result<u8, AppError> {
        let bytes = self.delimiter.as_bytes();
        if bytes.len() != 1 || !bytes[0].is_ascii() {
            return Err(AppError::Config(format!(
                "delimiter must be a single ASCII character, got {:?}",
                self.delimiter
            )));
        }
        Ok(bytes[0])
    }

    pub fn input_encoding(&self) -> Result<&'static Encoding, AppError> {
        resolve_encoding(&self.input_encoding)
    }

    pub fn output_encoding(&self) -> Result<&'static Encoding, AppError> {
        resolve_encoding(&self.output_encoding)
    }

    /// Output header, in emission order: mapped fields, owner column,
    /// extra fields.
    pub fn header_fields(&self) -> Vec<&str> {
        let mut fields: Vec<&str> = self.mapping.iter().map(|m| m.field.as_str()).collect();
        if let Some(owner) = &self.owner_column {
            fields.push(owner.as_str());
        }
        fields.extend(self.extra_fields.iter().map(|x| x.field.as_str()));
        fields
    }
}

/// Resolves a WHATWG encoding label. `cp932` is accepted as an alias for
/// the Shift_JIS family the legacy exports use.
fn resolve_encoding(label: &str) -> Result<&'static Encoding, AppError> {
    let normalized = match label.to_ascii_lowercase().as_str() {
        "cp932" | "windows-31j" | "ms932" => "shift_jis".to_string(),
        other => other.to_string(),
    };

    Encoding::for_label(normalized.as_bytes())
        .ok_or_else(|| AppError::Config(format!("Unknown encoding label: {}", label)))
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
