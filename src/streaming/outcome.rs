//! Per-record ingest outcomes.
//!
//! A finished ingest job exposes two disjoint record streams:
//! `successfulResults` and `failedResults`. Both are always downloaded —
//! an empty stream still has a header — then counted, reconciled against
//! the submitted row count, and mirrored into spreadsheet-friendly copies
//! (UTF-8 BOM, CRLF) next to the machine-readable originals.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::error::AppError;

/// UTF-8 BOM bytes.
const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];

/// Result column carrying the created/updated record id.
const SF_ID_COLUMN: &str = "sf__Id";

/// Result column carrying the row-level error on the failure stream.
const SF_ERROR_COLUMN: &str = "sf__Error";

// ─────────────────────────────────────────────────────────────────────────────
// Public Types
// ─────────────────────────────────────────────────────────────────────────────

/// One record's fate, parsed from a result stream.
#[derive(Debug, Clone, Serialize)]
pub struct IngestOutcome {
    /// Record id, when the server assigned or matched one.
    pub record_id: Option<String>,
    pub success: bool,
    /// Error code and message for failed records.
    pub error: Option<String>,
}

/// Row counts across both outcome streams.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct OutcomeCounts {
    pub success: u64,
    pub failed: u64,
}

impl OutcomeCounts {
    pub fn total(self) -> u64 {
        self.success + self.failed
    }
}

/// The four files one ingest run leaves behind.
#[derive(Debug, Clone, Serialize)]
pub struct OutcomeFiles {
    pub success_path: PathBuf,
    pub error_path: PathBuf,
    pub success_spreadsheet_path: PathBuf,
    pub error_spreadsheet_path: PathBuf,
}

impl OutcomeFiles {
    /// Standard naming under `output_dir`: `<jobid>_<master>_success.csv`,
    /// `_error.csv`, and `_excel` mirrors.
    pub fn for_job(output_dir: &Path, job_id: &str, master_key: &str) -> Self {
        let name = |suffix: &str| output_dir.join(format!("{}_{}_{}.csv", job_id, master_key, suffix));
        Self {
            success_path: name("success"),
            error_path: name("error"),
            success_spreadsheet_path: name("success_excel"),
            error_spreadsheet_path: name("error_excel"),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Parsing & Counting
// ─────────────────────────────────────────────────────────────────────────────

/// Counts data rows (header excluded) in a result CSV. An empty file — a
/// stream the server had nothing to say about — counts as zero.
pub fn count_data_rows(path: &Path) -> Result<u64, AppError> {
    let file = File::open(path)
        .map_err(|e| AppError::Internal(format!("Cannot open {}: {}", path.display(), e)))?;

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(strip_bom(file)?);

    let mut rows = 0u64;
    for record in reader.records() {
        record.map_err(|e| {
            AppError::Internal(format!("Unparseable result row in {}: {}", path.display(), e))
        })?;
        rows += 1;
    }
    Ok(rows)
}

/// Parses one outcome stream. `success` marks which stream this is; the
/// failure stream contributes the `sf__Error` column.
pub fn read_outcomes(path: &Path, success: bool) -> Result<Vec<IngestOutcome>, AppError> {
    let file = File::open(path)
        .map_err(|e| AppError::Internal(format!("Cannot open {}: {}", path.display(), e)))?;

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(strip_bom(file)?);

    let headers = reader
        .headers()
        .map_err(|e| AppError::Internal(format!("Unreadable result header: {}", e)))?
        .clone();

    let id_col = headers.iter().position(|h| h == SF_ID_COLUMN);
    let error_col = headers.iter().position(|h| h == SF_ERROR_COLUMN);

    let mut outcomes = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| {
            AppError::Internal(format!("Unparseable result row in {}: {}", path.display(), e))
        })?;

        let record_id = id_col
            .and_then(|i| record.get(i))
            .filter(|v| !v.is_empty())
            .map(|v| v.to_string());
        let error = if success {
            None
        } else {
            error_col
                .and_then(|i| record.get(i))
                .filter(|v| !v.is_empty())
                .map(|v| v.to_string())
        };

        outcomes.push(IngestOutcome {
            record_id,
            success,
            error,
        });
    }

    Ok(outcomes)
}

/// Checks that the two outcome streams together account for every
/// submitted row.
///
/// # Errors
///
/// - `AppError::ResultCountMismatch` - the server's outcome sets do not
///   sum to the submitted row count; surfaced, never silently accepted
pub fn reconcile(job_id: &str, submitted: u64, counts: OutcomeCounts) -> Result<(), AppError> {
    if counts.total() != submitted {
        return Err(AppError::ResultCountMismatch {
            job_id: job_id.to_string(),
            submitted,
            reported: counts.total(),
        });
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Spreadsheet Mirror
// ─────────────────────────────────────────────────────────────────────────────

/// Writes a spreadsheet-friendly copy of a machine-readable result CSV:
/// UTF-8 with BOM, every line CRLF-terminated, content otherwise
/// identical.
pub fn write_spreadsheet_mirror(src: &Path, dst: &Path) -> Result<(), AppError> {
    let file = File::open(src)
        .map_err(|e| AppError::Internal(format!("Cannot open {}: {}", src.display(), e)))?;
    let reader = BufReader::new(strip_bom(file)?);

    let out = File::create(dst)
        .map_err(|e| AppError::Internal(format!("Cannot create {}: {}", dst.display(), e)))?;
    let mut writer = BufWriter::new(out);

    writer
        .write_all(UTF8_BOM)
        .map_err(|e| AppError::Internal(format!("Write failed: {}", e)))?;

    for line in reader.lines() {
        let line =
            line.map_err(|e| AppError::Internal(format!("Read failed on {}: {}", src.display(), e)))?;
        let trimmed = line.strip_suffix('\r').unwrap_or(&line);
        writer
            .write_all(trimmed.as_bytes())
            .and_then(|_| writer.write_all(b"\r\n"))
            .map_err(|e| AppError::Internal(format!("Write failed: {}", e)))?;
    }

    writer
        .flush()
        .map_err(|e| AppError::Internal(format!("Flush failed: {}", e)))?;
    Ok(())
}

/// Wraps a reader with its leading UTF-8 BOM consumed, if present.
fn strip_bom(mut file: File) -> Result<impl Read, AppError> {
    let mut head = [0u8; 3];
    let mut read = 0;
    while read < 3 {
        match file.read(&mut head[read..]) {
            Ok(0) => break,
            Ok(n) => read += n,
            Err(e) => return Err(AppError::Internal(format!("Read failed: {}", e))),
        }
    }

    let prefix: Vec<u8> = if read == 3 && head == [0xEF, 0xBB, 0xBF] {
        Vec::new()
    } else {
        head[..read].to_vec()
    };

    Ok(std::io::Cursor::new(prefix).chain(file))
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
