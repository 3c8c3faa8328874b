//! Standalone conversion flow: legacy export file → ingest-ready CSV.

use std::path::{Path, PathBuf};

use tracing::info;

use crate::convert::{convert_file, MappingSpec};
use crate::error::AppError;

/// What the conversion produced.
#[derive(Debug, Clone)]
pub struct ConvertReport {
    pub output_path: PathBuf,
    pub rows: u64,
    pub columns: usize,
}

/// Converts `input` using the mapping file at `mapping_path`.
///
/// The output path is chosen in order of preference: the explicit
/// argument, the mapping's `output_csv`, then
/// `output/<master_key>_upsert_ready.csv`.
pub async fn run_convert(
    input: &Path,
    mapping_path: &Path,
    output: Option<PathBuf>,
) -> Result<ConvertReport, AppError> {
    let spec = MappingSpec::load(mapping_path)?;
    let output_path = resolve_output(&spec, output);

    info!(
        "[CONVERT] {} ({} -> {})",
        spec.master_key,
        input.display(),
        output_path.display()
    );

    let summary = {
        let input = input.to_path_buf();
        let output_path = output_path.clone();
        tokio::task::spawn_blocking(move || convert_file(&input, &spec, &output_path))
            .await
            .map_err(|e| AppError::Internal(format!("Conversion task panicked: {}", e)))??
    };

    info!(
        "[CONVERT] wrote {} row(s), {} column(s)",
        summary.rows, summary.columns
    );

    Ok(ConvertReport {
        output_path,
        rows: summary.rows,
        columns: summary.columns,
    })
}

pub(crate) fn resolve_output(spec: &MappingSpec, explicit: Option<PathBuf>) -> PathBuf {
    explicit
        .or_else(|| spec.output_csv.clone())
        .unwrap_or_else(|| {
            PathBuf::from(format!("output/{}_upsert_ready.csv", spec.master_key))
        })
}
