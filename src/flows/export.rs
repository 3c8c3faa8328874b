//! Export flow: SOQL → bulk query job → merged CSV on disk.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Local;
use tracing::info;

use crate::config::Settings;
use crate::error::AppError;
use crate::salesforce::bulk_query::PkChunking;
use crate::salesforce::{
    fetch_token, BulkQueryClient, Operation, PollPolicy, PollScheduler, SalesforceClient,
};
use crate::streaming::export_query_job;

// ─────────────────────────────────────────────────────────────────────────────
// Options & Report
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ExportOptions {
    /// `query` or `queryAll` (includes archived/deleted records).
    pub operation: Operation,
    /// Explicit output path. Defaults to a timestamped name under
    /// `output_dir`.
    pub output: Option<PathBuf>,
    pub output_dir: PathBuf,
    /// Page-size hint (`maxRecords`) for result retrieval.
    pub page_size: Option<u32>,
    /// Request server-side primary-key partitioning with this many records
    /// per partition.
    pub chunk_size: Option<u64>,
    pub policy: PollPolicy,
    /// Concurrent partition polls.
    pub max_concurrent_polls: usize,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            operation: Operation::Query,
            output: None,
            output_dir: PathBuf::from("output"),
            page_size: None,
            chunk_size: None,
            policy: PollPolicy::default(),
            max_concurrent_polls: crate::salesforce::scheduler::DEFAULT_MAX_CONCURRENT_POLLS,
        }
    }
}

/// Outcome of one export run.
#[derive(Debug, Clone)]
pub struct ExportReport {
    pub job_id: String,
    pub output_path: PathBuf,
    pub pages: u64,
    pub chunks: usize,
    pub bytes: u64,
}

// ─────────────────────────────────────────────────────────────────────────────
// Flow
// ─────────────────────────────────────────────────────────────────────────────

/// Runs a query export end to end.
pub async fn run_export(
    settings: &Settings,
    soql: &str,
    opts: &ExportOptions,
) -> Result<ExportReport, AppError> {
    let http = Arc::new(reqwest::Client::new());
    let session = fetch_token(&http, settings).await?;
    let transport = SalesforceClient::new(
        http,
        session.instance_url,
        session.access_token,
        settings.api_version.clone(),
    );
    let query = BulkQueryClient::new(transport);

    let job = query
        .create_job(
            soql,
            opts.operation,
            opts.chunk_size.map(|chunk_size| PkChunking { chunk_size }),
        )
        .await?;
    info!("[EXPORT] created job {}", job.id);

    let output_path = opts
        .output
        .clone()
        .unwrap_or_else(|| opts.output_dir.join(default_file_name(soql)));

    let scheduler = PollScheduler::new(opts.max_concurrent_polls);
    let summary =
        export_query_job(&query, &job, opts.page_size, &opts.policy, &scheduler, &output_path)
            .await?;

    info!(
        "[EXPORT] {} page(s) across {} partition(s) -> {}",
        summary.pages,
        summary.chunks.max(1),
        output_path.display()
    );

    Ok(ExportReport {
        job_id: summary.job_id,
        output_path,
        pages: summary.pages,
        chunks: summary.chunks,
        bytes: summary.bytes,
    })
}

/// `<Object>_<YYYYmmdd_HHMMSS>.csv`, falling back to a generic stem when
/// the object cannot be read off the query.
fn default_file_name(soql: &str) -> String {
    let stem = object_from_soql(soql).unwrap_or_else(|| "export".to_string());
    format!("{}_{}.csv", stem, Local::now().format("%Y%m%d_%H%M%S"))
}

/// Extracts the object name following the top-level FROM keyword.
///
/// Subquery parentheses and string literals are skipped, so a WHERE
/// clause containing `'from'` cannot confuse the scan.
fn object_from_soql(soql: &str) -> Option<String> {
    let from_pos = find_top_level_from(soql)?;
    let after = &soql[from_pos + 4..];

    let object: String = after
        .trim_start()
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect();

    if object.is_empty() {
        None
    } else {
        Some(object)
    }
}

/// Finds the byte position of the top-level FROM keyword.
fn find_top_level_from(soql: &str) -> Option<usize> {
    let bytes = soql.as_bytes();
    let len = bytes.len();

    let mut i = 0;
    let mut paren_depth: u32 = 0;
    let mut in_single_quote = false;

    while i < len {
        let ch = bytes[i];

        if in_single_quote {
            if ch == b'\\' {
                i += 2;
                continue;
            }
            if ch == b'\'' {
                in_single_quote = false;
            }
            i += 1;
            continue;
        }

        match ch {
            b'\'' => in_single_quote = true,
            b'(' => paren_depth += 1,
            b')' => paren_depth = paren_depth.saturating_sub(1),
            _ if paren_depth == 0 && i + 4 <= len => {
                let candidate = &soql[i..i + 4];
                if candidate.eq_ignore_ascii_case("from") {
                    let is_start = i == 0 || !is_identifier_char(bytes[i - 1]);
                    let is_end = i + 4 >= len || !is_identifier_char(bytes[i + 4]);
                    if is_start && is_end {
                        return Some(i);
                    }
                }
            }
            _ => {}
        }

        i += 1;
    }

    None
}

fn is_identifier_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
