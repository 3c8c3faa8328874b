//! End-to-end ingest flow: convert, create, upload, close, poll, collect
//! outcomes.
//!
//! Row-level rejections are not a flow failure — a job can reach
//! `JobComplete` with a non-zero error-row count, and the report carries
//! both counts for the caller to judge. A job-level `Failed`/`Aborted`
//! terminal state, or outcome counts that do not add up to the submitted
//! rows, are failures.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::info;

use crate::config::Settings;
use crate::convert::{convert_file, MappingSpec};
use crate::error::AppError;
use crate::salesforce::bulk_ingest::CreateIngestJob;
use crate::salesforce::{
    fetch_token, poll_until_done, BulkIngestClient, BulkJobState, PollPolicy, SalesforceClient,
    TerminalState,
};
use crate::streaming::outcome::{
    count_data_rows, reconcile, write_spreadsheet_mirror, OutcomeCounts, OutcomeFiles,
};

// ─────────────────────────────────────────────────────────────────────────────
// Options & Report
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct IngestOptions {
    /// Input is already converted CSV; skip the transformer.
    pub pre_converted: bool,
    /// Where converted CSV and outcome files land.
    pub output_dir: PathBuf,
    pub policy: PollPolicy,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            pre_converted: false,
            output_dir: PathBuf::from("output"),
            policy: PollPolicy::default(),
        }
    }
}

/// Outcome of one ingest run.
#[derive(Debug, Clone)]
pub struct IngestReport {
    pub job_id: String,
    pub state: BulkJobState,
    pub submitted: u64,
    pub counts: OutcomeCounts,
    pub files: OutcomeFiles,
}

impl IngestReport {
    /// True when every submitted row was accepted.
    pub fn fully_successful(&self) -> bool {
        self.counts.failed == 0
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Flow
// ─────────────────────────────────────────────────────────────────────────────

/// Runs the whole ingest for one master file.
pub async fn run_ingest(
    settings: &Settings,
    mapping_path: &Path,
    input: &Path,
    opts: &IngestOptions,
) -> Result<IngestReport, AppError> {
    let spec = MappingSpec::load(mapping_path)?;

    // 1) Convert (or accept a pre-converted CSV as-is)
    let csv_path = if opts.pre_converted {
        input.to_path_buf()
    } else {
        // The mapping's configured path wins; otherwise land next to the
        // outcome files.
        let output_path = spec.output_csv.clone().unwrap_or_else(|| {
            opts.output_dir
                .join(format!("{}_upsert_ready.csv", spec.master_key))
        });
        let input = input.to_path_buf();
        let spec_for_convert = spec.clone();
        let target = output_path.clone();
        let summary = tokio::task::spawn_blocking(move || {
            convert_file(&input, &spec_for_convert, &target)
        })
        .await
        .map_err(|e| AppError::Internal(format!("Conversion task panicked: {}", e)))??;
        info!(
            "[INGEST] {}: converted {} row(s)",
            spec.master_key, summary.rows
        );
        output_path
    };

    let submitted = {
        let csv_path = csv_path.clone();
        tokio::task::spawn_blocking(move || count_data_rows(&csv_path))
            .await
            .map_err(|e| AppError::Internal(format!("Count task panicked: {}", e)))??
    };

    // 2) Authenticate and build the transport
    let http = Arc::new(reqwest::Client::new());
    let session = fetch_token(&http, settings).await?;
    let transport = SalesforceClient::new(
        http,
        session.instance_url,
        session.access_token,
        settings.api_version.clone(),
    );
    let ingest = BulkIngestClient::new(transport);

    // 3) Create, upload, close
    let request = CreateIngestJob::csv(
        spec.object.clone(),
        spec.operation,
        spec.external_id_field.clone(),
    );
    let mut job = ingest.create_job(&request).await?;
    info!("[INGEST] {}: created job {}", spec.master_key, job.id);

    ingest.upload_batch(&job, &csv_path).await?;
    ingest.close_job(&mut job).await?;

    // 4) Poll to a terminal state
    let terminal = poll_until_done(&job.id, &opts.policy, || {
        let ingest = ingest.clone();
        let id = job.id.clone();
        async move { Ok(ingest.job_status(&id).await?.state) }
    })
    .await?;
    job.apply_server_state(terminal.as_state());

    if terminal != TerminalState::JobComplete {
        let message = ingest
            .job_status(&job.id)
            .await
            .ok()
            .and_then(|info| info.error_message)
            .unwrap_or_else(|| "Unknown error".to_string());
        return Err(AppError::JobFailed {
            job_id: job.id.clone(),
            state: terminal.as_state(),
            message,
        });
    }

    // 5) Collect both outcome streams, always
    let files = OutcomeFiles::for_job(&opts.output_dir, &job.id, &spec.master_key);
    ingest
        .download_success_results(&job.id, &files.success_path)
        .await?;
    ingest
        .download_failure_results(&job.id, &files.error_path)
        .await?;

    let counts = {
        let files = files.clone();
        tokio::task::spawn_blocking(move || -> Result<OutcomeCounts, AppError> {
            let counts = OutcomeCounts {
                success: count_data_rows(&files.success_path)?,
                failed: count_data_rows(&files.error_path)?,
            };
            write_spreadsheet_mirror(&files.success_path, &files.success_spreadsheet_path)?;
            write_spreadsheet_mirror(&files.error_path, &files.error_spreadsheet_path)?;
            Ok(counts)
        })
        .await
        .map_err(|e| AppError::Internal(format!("Outcome task panicked: {}", e)))??
    };

    // 6) Cardinality check: every submitted row must be accounted for
    reconcile(&job.id, submitted, counts)?;

    info!(
        "[INGEST] {}: job {} complete ({} ok, {} failed)",
        spec.master_key,
        job.id,
        counts.success,
        counts.failed
    );

    Ok(IngestReport {
        job_id: job.id,
        state: BulkJobState::JobComplete,
        submitted,
        counts,
        files,
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
