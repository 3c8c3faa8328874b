//! Row transformation: legacy export → ingest-ready CSV.
//!
//! Decodes the source in its declared encoding, selects the mapped columns
//! in declaration order, appends the owner and fixed columns, and writes
//! CSV with a single header row built from the mapping's field names.
//! Decoding is strict: a byte sequence the declared encoding cannot
//! represent fails the conversion rather than silently substituting.

use std::path::Path;

use csv::{ReaderBuilder, Terminator, WriterBuilder};

use crate::convert::mapping::MappingSpec;
use crate::error::AppError;

/// UTF-8 BOM bytes, stripped from source text before decoding checks.
const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];

/// What a conversion produced.
#[derive(Debug, Clone)]
pub struct ConvertSummary {
    /// Data rows written (header excluded).
    pub rows: u64,
    /// Output columns per row.
    pub columns: usize,
}

// ─────────────────────────────────────────────────────────────────────────────
// File Conversion
// ─────────────────────────────────────────────────────────────────────────────

/// Converts a legacy export file into ingest-ready CSV at `output_path`.
///
/// # Errors
///
/// - `AppError::Encoding` - source bytes invalid in the declared encoding,
///   or output unrepresentable in the output encoding
/// - `AppError::Mapping` - a mapping index outside some row's column count
pub fn convert_file(
    input_path: &Path,
    spec: &MappingSpec,
    output_path: &Path,
) -> Result<ConvertSummary, AppError> {
    let raw = std::fs::read(input_path).map_err(|e| {
        AppError::Internal(format!("Cannot read input {}: {}", input_path.display(), e))
    })?;

    let (csv_bytes, summary) = convert_bytes(&raw, spec)?;

    if let Some(parent) = output_path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            AppError::Internal(format!("Failed to create output directory: {}", e))
        })?;
    }
    std::fs::write(output_path, csv_bytes).map_err(|e| {
        AppError::Internal(format!("Cannot write output {}: {}", output_path.display(), e))
    })?;

    Ok(summary)
}

/// Converts in memory. The returned bytes are already in the output
/// encoding.
pub fn convert_bytes(raw: &[u8], spec: &MappingSpec) -> Result<(Vec<u8>, ConvertSummary), AppError> {
    let text = decode_input(raw, spec)?;
    let delimiter = spec.delimiter_byte()?;

    let mut reader = ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(spec.has_header)
        .flexible(true)
        .from_reader(text.as_bytes());

    let header = spec.header_fields();
    let columns = header.len();

    let terminator = if spec.line_terminator == "\r\n" {
        Terminator::CRLF
    } else {
        Terminator::Any(b'\n')
    };

    let mut writer = WriterBuilder::new()
        .terminator(terminator)
        .from_writer(Vec::new());

    writer
        .write_record(&header)
        .map_err(|e| AppError::Internal(format!("Failed to write header: {}", e)))?;

    let mut rows = 0u64;
    for (row_number, record) in reader.records().enumerate() {
        let record = record.map_err(|e| {
            AppError::Mapping(format!("Row {}: unparseable record: {}", row_number + 1, e))
        })?;

        let output_row = transform_row(&record, spec, row_number + 1)?;
        writer
            .write_record(&output_row)
            .map_err(|e| AppError::Internal(format!("Failed to write row: {}", e)))?;
        rows += 1;
    }

    let utf8_csv = writer
        .into_inner()
        .map_err(|e| AppError::Internal(format!("Failed to flush CSV writer: {}", e)))?;

    let encoded = encode_output(utf8_csv, spec)?;
    Ok((encoded, ConvertSummary { rows, columns }))
}

/// Maps one source record to the output column vector.
///
/// Unmapped source columns are dropped; an index past the row's end is a
/// mapping error naming the row.
fn transform_row(
    record: &csv::StringRecord,
    spec: &MappingSpec,
    row_number: usize,
) -> Result<Vec<String>, AppError> {
    let mut out = Vec::with_capacity(spec.header_fields().len());

    for entry in &spec.mapping {
        let value = record.get(entry.index).ok_or_else(|| {
            AppError::Mapping(format!(
                "Row {}: mapping for {} references column {} but the row has {} columns",
                row_number,
                entry.field,
                entry.index,
                record.len()
            ))
        })?;
        out.push(value.to_string());
    }

    if spec.owner_column.is_some() {
        out.push(spec.owner_value.clone());
    }

    for extra in &spec.extra_fields {
        out.push(extra.value.clone());
    }

    Ok(out)
}

// ─────────────────────────────────────────────────────────────────────────────
// Encoding
// ─────────────────────────────────────────────────────────────────────────────

fn decode_input(raw: &[u8], spec: &MappingSpec) -> Result<String, AppError> {
    let encoding = spec.input_encoding()?;

    let stripped = raw.strip_prefix(UTF8_BOM).unwrap_or(raw);

    match encoding.decode_without_bom_handling_and_without_replacement(stripped) {
        Some(text) => Ok(text.into_owned()),
        None => Err(AppError::Encoding(format!(
            "Input is not valid {}",
            encoding.name()
        ))),
    }
}

fn encode_output(utf8_csv: Vec<u8>, spec: &MappingSpec) -> Result<Vec<u8>, AppError> {
    let encoding = spec.output_encoding()?;
    if encoding == encoding_rs::UTF_8 {
        return Ok(utf8_csv);
    }

    let text = String::from_utf8(utf8_csv)
        .map_err(|e| AppError::Internal(format!("CSV writer produced invalid UTF-8: {}", e)))?;
    let (encoded, _, had_unmappable) = encoding.encode(&text);
    if had_unmappable {
        return Err(AppError::Encoding(format!(
            "Output contains characters unrepresentable in {}",
            encoding.name()
        )));
    }
    Ok(encoded.into_owned())
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::mapping::MappingSpec;

    fn utf8_spec(extra: &str) -> MappingSpec {
        MappingSpec::from_yaml(&format!(
            r#"
master_key: DPT
object: Department__c
operation: upsert
external_id_field: DptCode__c
input_encoding: utf-8
{}
mapping:
  - {{ index: 1, field: MdScheduledModDate__c }}
  - {{ index: 7, field: DptCode__c }}
  - {{ index: 9, field: Name }}
"#,
            extra
        ))
        .unwrap()
    }

    /// A 12-column row in the legacy layout.
    fn twelve_column_row(code: &str, name: &str) -> String {
        format!("x,2025-03-05,2025-03-01,a,b,c,d,{},e,{},f,g", code, name)
    }

    #[test]
    fn maps_three_of_twelve_columns_in_declaration_order() {
        let spec = utf8_spec("");
        let input = format!(
            "{}\n{}\n",
            twelve_column_row("D001", "Sales"),
            twelve_column_row("D002", "Support")
        );

        let (bytes, summary) = convert_bytes(input.as_bytes(), &spec).unwrap();
        let output = String::from_utf8(bytes).unwrap();

        assert_eq!(summary.rows, 2);
        assert_eq!(summary.columns, 3);
        assert_eq!(
            output,
            "MdScheduledModDate__c,DptCode__c,Name\n\
             2025-03-05,D001,Sales\n\
             2025-03-05,D002,Support\n"
        );
    }

    #[test]
    fn owner_and_extra_fields_are_appended() {
        let spec = utf8_spec(
            "owner_column: OwnerId\nextra_fields:\n  - { field: Source__c, value: MD }",
        );
        let input = format!("{}\n", twelve_column_row("D001", "Sales"));

        let (bytes, _) = convert_bytes(input.as_bytes(), &spec).unwrap();
        let output = String::from_utf8(bytes).unwrap();

        assert_eq!(
            output,
            "MdScheduledModDate__c,DptCode__c,Name,OwnerId,Source__c\n\
             2025-03-05,D001,Sales,,MD\n"
        );
    }

    #[test]
    fn conversion_is_idempotent() {
        let spec = utf8_spec("");
        let input = format!(
            "{}\n{}\n",
            twelve_column_row("D001", "Sales"),
            twelve_column_row("D002", "Support")
        );

        let (first, _) = convert_bytes(input.as_bytes(), &spec).unwrap();
        let (second, _) = convert_bytes(input.as_bytes(), &spec).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn round_trip_preserves_mapped_values() {
        let spec = utf8_spec("");
        let input = format!("{}\n", twelve_column_row("D001", "Sales"));

        let (bytes, _) = convert_bytes(input.as_bytes(), &spec).unwrap();

        let mut reader = csv::Reader::from_reader(bytes.as_slice());
        let headers = reader.headers().unwrap().clone();
        assert_eq!(
            headers.iter().collect::<Vec<_>>(),
            vec!["MdScheduledModDate__c", "DptCode__c", "Name"]
        );

        let record = reader.records().next().unwrap().unwrap();
        assert_eq!(record.get(0), Some("2025-03-05"));
        assert_eq!(record.get(1), Some("D001"));
        assert_eq!(record.get(2), Some("Sales"));
    }

    #[test]
    fn short_row_is_mapping_error_naming_the_row() {
        let spec = utf8_spec("");
        let input = "a,b,c\n";

        match convert_bytes(input.as_bytes(), &spec).unwrap_err() {
            AppError::Mapping(msg) => {
                assert!(msg.contains("Row 1"), "message was: {}", msg);
                assert!(msg.contains("column 7"), "message was: {}", msg);
            }
            e => panic!("Expected Mapping, got: {:?}", e),
        }
    }

    #[test]
    fn invalid_bytes_for_declared_encoding_fail() {
        let spec = utf8_spec("");
        // 0xFF 0xFE is not valid UTF-8
        let input: &[u8] = b"a,\xFF\xFE,c\n";

        assert!(matches!(
            convert_bytes(input, &spec).unwrap_err(),
            AppError::Encoding(_)
        ));
    }

    #[test]
    fn decodes_shift_jis_input() {
        let spec = MappingSpec::from_yaml(
            r#"
master_key: DPT
object: Department__c
operation: insert
input_encoding: cp932
mapping:
  - { index: 0, field: DptCode__c }
  - { index: 1, field: Name }
"#,
        )
        .unwrap();

        // "営業部" (Sales Dept) in Shift_JIS
        let name_sjis: &[u8] = &[0x89, 0x63, 0x8B, 0xC6, 0x95, 0x94];
        let mut input = b"D001,".to_vec();
        input.extend_from_slice(name_sjis);
        input.push(b'\n');

        let (bytes, summary) = convert_bytes(&input, &spec).unwrap();
        let output = String::from_utf8(bytes).unwrap();

        assert_eq!(summary.rows, 1);
        assert_eq!(output, "DptCode__c,Name\nD001,営業部\n");
    }

    #[test]
    fn source_header_row_is_skipped_when_declared() {
        let spec = MappingSpec::from_yaml(
            r#"
master_key: DPT
object: Department__c
operation: insert
input_encoding: utf-8
has_header: true
mapping:
  - { index: 0, field: DptCode__c }
"#,
        )
        .unwrap();

        let input = "code,name\nD001,Sales\n";
        let (bytes, summary) = convert_bytes(input.as_bytes(), &spec).unwrap();

        assert_eq!(summary.rows, 1);
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            "DptCode__c\nD001\n"
        );
    }

    #[test]
    fn crlf_terminator_is_honored() {
        let spec = utf8_spec(r#"line_terminator: "\r\n""#);
        let input = format!("{}\n", twelve_column_row("D001", "Sales"));

        let (bytes, _) = convert_bytes(input.as_bytes(), &spec).unwrap();
        let output = String::from_utf8(bytes).unwrap();
        assert!(output.ends_with("\r\n"));
        assert_eq!(output.matches("\r\n").count(), 2);
    }

    #[test]
    fn convert_file_writes_output() {
        let dir = tempfile::tempdir().unwrap();
        let input_path = dir.path().join("TEST_DIV.ALL");
        let output_path = dir.path().join("out/dpt.csv");

        std::fs::write(&input_path, format!("{}\n", twelve_column_row("D001", "Sales")))
            .unwrap();

        let spec = utf8_spec("");
        let summary = convert_file(&input_path, &spec, &output_path).unwrap();

        assert_eq!(summary.rows, 1);
        let written = std::fs::read_to_string(&output_path).unwrap();
        assert!(written.starts_with("MdScheduledModDate__c,DptCode__c,Name\n"));
    }
}
