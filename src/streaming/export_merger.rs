//! Merged result assembly for query exports.
//!
//! Whether a query ran as one job or as many primary-key partitions, the
//! caller gets a single CSV: one header row, then every data row, pages in
//! locator-chain order, partitions in the server's listing order. Output
//! lands in a `.part` file that is renamed into place only after every
//! page has been written, so a failed export never leaves a file that
//! could be mistaken for a complete one.

use std::path::Path;

use futures_util::future::join_all;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::info;

use crate::error::AppError;
use crate::salesforce::{
    poll_until_done, redact_id, BulkJob, BulkQueryClient, PollPolicy, PollScheduler,
    TerminalState,
};

/// What an export produced.
#[derive(Debug, Clone)]
pub struct ExportSummary {
    pub job_id: String,
    /// Partition jobs merged (0 for an unchunked export).
    pub chunks: usize,
    /// Result pages fetched across all partitions.
    pub pages: u64,
    /// Bytes written to the merged file.
    pub bytes: u64,
}

// ─────────────────────────────────────────────────────────────────────────────
// Export Orchestration
// ─────────────────────────────────────────────────────────────────────────────

/// Drives a created query job to a merged CSV on disk.
///
/// Unchunked: poll the job itself, then follow its locator chain. Chunked:
/// poll every partition to a terminal state (concurrently, bounded by the
/// scheduler), and only then merge — in listing order, never completion
/// order, so reruns over unchanged data are byte-identical.
///
/// # Errors
///
/// - `AppError::JobFailed` - the (unchunked) job failed or was aborted
/// - `AppError::ChunkFailure` - one or more partitions failed; nothing is
///   written
/// - `AppError::PollTimeout` - budget exhausted; jobs keep running
pub async fn export_query_job(
    client: &BulkQueryClient,
    job: &BulkJob,
    page_size: Option<u32>,
    policy: &PollPolicy,
    scheduler: &PollScheduler,
    output_path: &Path,
) -> Result<ExportSummary, AppError> {
    if job.is_chunked() {
        info!(
            "[EXPORT] job {} split into {} partitions",
            redact_id(&job.id),
            job.chunk_job_ids.len()
        );
        await_chunks(client, scheduler, &job.chunk_job_ids, policy).await?;
    } else {
        let terminal = poll_until_done(&job.id, policy, || {
            let client = client.clone();
            let id = job.id.clone();
            async move { Ok(client.job_status(&id).await?.state) }
        })
        .await?;

        if terminal != TerminalState::JobComplete {
            let message = client
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
    }

    merge_query_results(client, job, page_size, output_path).await
}

/// Waits for every partition job to reach a terminal state.
///
/// Each partition is polled by its own task holding a scheduler permit, so
/// a slow partition never blocks progress on the others. The function
/// returns only after all tasks finish (conjunction barrier). Partitions
/// that ended `Failed` or `Aborted` fail the whole export.
pub async fn await_chunks(
    client: &BulkQueryClient,
    scheduler: &PollScheduler,
    chunk_ids: &[String],
    policy: &PollPolicy,
) -> Result<(), AppError> {
    let mut handles = Vec::with_capacity(chunk_ids.len());

    for id in chunk_ids {
        let client = client.clone();
        let scheduler = scheduler.clone();
        let policy = policy.clone();
        let id = id.clone();

        handles.push(tokio::spawn(async move {
            let _permit = scheduler.acquire().await;
            let result = poll_until_done(&id, &policy, || {
                let client = client.clone();
                let id = id.clone();
                async move { Ok(client.job_status(&id).await?.state) }
            })
            .await;
            (id, result)
        }));
    }

    let mut failed: Vec<String> = Vec::new();
    let mut first_error: Option<AppError> = None;

    for handle in join_all(handles).await {
        let (id, result) =
            handle.map_err(|e| AppError::Internal(format!("Partition poll task panicked: {}", e)))?;
        match result {
            Ok(TerminalState::JobComplete) => {}
            Ok(_) => failed.push(id),
            Err(e) => {
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
    }

    if !failed.is_empty() {
        return Err(AppError::ChunkFailure { failed });
    }
    if let Some(e) = first_error {
        return Err(e);
    }
    Ok(())
}

/// Streams every result page of a completed job (or its partitions) into
/// one file. The first page overall keeps its header; every other page has
/// it stripped.
pub async fn merge_query_results(
    client: &BulkQueryClient,
    job: &BulkJob,
    page_size: Option<u32>,
    output_path: &Path,
) -> Result<ExportSummary, AppError> {
    if let Some(parent) = output_path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| AppError::Internal(format!("Failed to create output directory: {}", e)))?;
    }

    let part_path = output_path.with_extension("csv.part");

    let merge_result = write_all_pages(client, job, page_size, &part_path).await;

    let (pages, bytes) = match merge_result {
        Ok(counts) => counts,
        Err(e) => {
            let _ = tokio::fs::remove_file(&part_path).await;
            return Err(e);
        }
    };

    tokio::fs::rename(&part_path, output_path)
        .await
        .map_err(|e| AppError::Internal(format!("Failed to rename merged output: {}", e)))?;

    info!(
        "[EXPORT] merged {} page(s) for job {} into {}",
        pages,
        redact_id(&job.id),
        output_path.display()
    );

    Ok(ExportSummary {
        job_id: job.id.clone(),
        chunks: job.chunk_job_ids.len(),
        pages,
        bytes,
    })
}

async fn write_all_pages(
    client: &BulkQueryClient,
    job: &BulkJob,
    page_size: Option<u32>,
    part_path: &Path,
) -> Result<(u64, u64), AppError> {
    let mut file = File::create(part_path)
        .await
        .map_err(|e| AppError::Internal(format!("Failed to create output file: {}", e)))?;

    // Partition listing order, or just the job itself
    let sources: Vec<&str> = if job.is_chunked() {
        job.chunk_job_ids.iter().map(String::as_str).collect()
    } else {
        vec![job.id.as_str()]
    };

    let mut pages = 0u64;
    let mut bytes = 0u64;
    let mut first_page_overall = true;

    for source_id in sources {
        let mut locator: Option<String> = None;

        loop {
            let page = client
                .write_results_page(
                    source_id,
                    locator.as_deref(),
                    page_size,
                    !first_page_overall,
                    &mut file,
                )
                .await?;

            first_page_overall = false;
            pages += 1;
            bytes += page.bytes_written;

            match page.next_locator {
                Some(next) => locator = Some(next),
                None => break,
            }
        }
    }

    file.flush()
        .await
        .map_err(|e| AppError::Internal(format!("Failed to flush merged output: {}", e)))?;

    Ok((pages, bytes))
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
