//! Bulk API 2.0 ingest job client.
//!
//! Drives a master-data load end to end: create the job, stream-upload the
//! converted CSV, close the job so processing starts, report status, and
//! download the success/failure outcome CSVs. CSV contents are never
//! logged.

use std::path::Path;

use futures_util::StreamExt;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::info;

use crate::error::AppError;
use crate::salesforce::client::parse_error_response;
use crate::salesforce::{redact_id, BulkJob, BulkJobState, Operation, SalesforceClient};

// ─────────────────────────────────────────────────────────────────────────────
// Public Types
// ─────────────────────────────────────────────────────────────────────────────

/// Request body for creating an ingest job.
///
/// `externalIdFieldName` skips serialization when `None` because the
/// server rejects null values for the field on insert operations.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateIngestJob {
    /// Target object API name (e.g., "Department__c").
    pub object: String,
    pub operation: Operation,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_id_field_name: Option<String>,
    pub content_type: &'static str,
    pub column_delimiter: &'static str,
    pub line_ending: &'static str,
}

impl CreateIngestJob {
    /// An ingest job over comma-delimited, LF-terminated CSV — the shape
    /// the converter produces.
    pub fn csv(object: String, operation: Operation, external_id_field: Option<String>) -> Self {
        Self {
            object,
            operation,
            external_id_field_name: external_id_field,
            content_type: "CSV",
            column_delimiter: "COMMA",
            line_ending: "LF",
        }
    }
}

/// Ingest job status as reported by the server.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestJobInfo {
    pub id: String,
    pub state: BulkJobState,
    #[serde(default, rename = "numberRecordsProcessed")]
    pub processed_records: Option<u64>,
    #[serde(default, rename = "numberRecordsFailed")]
    pub failed_records: Option<u64>,
    #[serde(default)]
    pub error_message: Option<String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Internal Wire Types
// ─────────────────────────────────────────────────────────────────────────────

/// Request body for changing job state (close or abort).
#[derive(Debug, Serialize)]
struct UpdateJobStateRequest {
    state: &'static str,
}

#[derive(Debug, Deserialize)]
struct CreateJobResponse {
    id: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// BulkIngestClient
// ─────────────────────────────────────────────────────────────────────────────

/// Client for Bulk API 2.0 ingest operations.
#[derive(Clone)]
pub struct BulkIngestClient {
    client: SalesforceClient,
}

impl BulkIngestClient {
    pub fn new(client: SalesforceClient) -> Self {
        Self { client }
    }

    /// Creates a new ingest job and returns its handle in the `Open` state.
    ///
    /// # Errors
    ///
    /// - `AppError::Auth` - credentials rejected
    /// - `AppError::Request` - malformed request
    /// - `AppError::RateLimited` - throttled after retries
    pub async fn create_job(&self, req: &CreateIngestJob) -> Result<BulkJob, AppError> {
        let url = self.client.api_url("jobs/ingest")?;

        info!(
            "[INGEST] POST /jobs/ingest (creating {} job for {})",
            req.operation.as_str(),
            req.object
        );

        let response = self
            .client
            .execute("POST /jobs/ingest", || {
                self.client.request(Method::POST, url.clone()).json(req)
            })
            .await?;

        let created: CreateJobResponse = response.json().await.map_err(|e| {
            AppError::Internal(format!("Failed to parse job creation response: {}", e))
        })?;

        Ok(BulkJob::new_ingest(
            created.id,
            req.operation,
            req.object.clone(),
        ))
    }

    /// Streams one CSV content batch into an `Open` job.
    ///
    /// May be called repeatedly before `close_job`. The file is streamed
    /// from disk, so the body cannot be replayed: transient failures here
    /// surface immediately instead of being retried.
    ///
    /// # Errors
    ///
    /// - `AppError::InvalidState` - job is no longer `Open`
    pub async fn upload_batch(&self, job: &BulkJob, csv_path: &Path) -> Result<(), AppError> {
        job.require_open("upload")?;

        let url = self
            .client
            .api_url(&format!("jobs/ingest/{}/batches", job.id))?;

        let file = File::open(csv_path)
            .await
            .map_err(|e| AppError::Internal(format!("Failed to open CSV file: {}", e)))?;
        let file_size = file
            .metadata()
            .await
            .map_err(|e| AppError::Internal(format!("Failed to get file metadata: {}", e)))?
            .len();

        info!(
            "[INGEST] PUT /jobs/ingest/{}/batches ({} bytes)",
            redact_id(&job.id),
            file_size
        );

        let body = reqwest::Body::wrap_stream(ReaderStream::new(file));
        let response = self
            .client
            .request(Method::PUT, url)
            .header("Content-Type", "text/csv")
            .body(body)
            .send()
            .await
            .map_err(|e| AppError::Connection(format!("CSV upload failed: {}", e)))?;

        let status = response.status();
        info!(
            "[INGEST] PUT /jobs/ingest/{}/batches -> {}",
            redact_id(&job.id),
            status.as_u16()
        );

        if !status.is_success() {
            return Err(parse_error_response(response, status).await);
        }

        Ok(())
    }

    /// Marks the upload complete so the server starts processing.
    ///
    /// Idempotent while the job is `Open` or already `UploadComplete`.
    pub async fn close_job(&self, job: &mut BulkJob) -> Result<(), AppError> {
        if job.state == BulkJobState::UploadComplete {
            return Ok(());
        }
        job.require_open("close")?;

        self.patch_state(&job.id, "UploadComplete", "closing").await?;
        job.mark_upload_complete()
    }

    /// Fetches the job's current server-side status.
    pub async fn job_status(&self, job_id: &str) -> Result<IngestJobInfo, AppError> {
        let url = self.client.api_url(&format!("jobs/ingest/{}", job_id))?;
        let label = format!("GET /jobs/ingest/{}", redact_id(job_id));

        let response = self
            .client
            .execute(&label, || self.client.request(Method::GET, url.clone()))
            .await?;

        response
            .json()
            .await
            .map_err(|e| AppError::Internal(format!("Failed to parse job status response: {}", e)))
    }

    /// Aborts a job that has not finished yet.
    ///
    /// # Errors
    ///
    /// - `AppError::InvalidState` - job already terminal
    pub async fn abort(&self, job: &mut BulkJob) -> Result<(), AppError> {
        job.require_not_terminal("abort")?;
        self.patch_state(&job.id, "Aborted", "aborting").await?;
        job.apply_server_state(BulkJobState::Aborted);
        Ok(())
    }

    /// Deletes a job record server-side.
    ///
    /// # Errors
    ///
    /// - `AppError::InvalidState` - job already terminal
    pub async fn delete(&self, job: &BulkJob) -> Result<(), AppError> {
        job.require_not_terminal("delete")?;

        let url = self.client.api_url(&format!("jobs/ingest/{}", job.id))?;
        let label = format!("DELETE /jobs/ingest/{}", redact_id(&job.id));

        self.client
            .execute(&label, || self.client.request(Method::DELETE, url.clone()))
            .await?;

        Ok(())
    }

    /// Streams the "successfulResults" CSV to disk.
    pub async fn download_success_results(
        &self,
        job_id: &str,
        output_path: &Path,
    ) -> Result<(), AppError> {
        self.download_results(job_id, "successfulResults", output_path)
            .await
    }

    /// Streams the "failedResults" CSV to disk.
    pub async fn download_failure_results(
        &self,
        job_id: &str,
        output_path: &Path,
    ) -> Result<(), AppError> {
        self.download_results(job_id, "failedResults", output_path)
            .await
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Private Helpers
    // ─────────────────────────────────────────────────────────────────────────

    async fn patch_state(
        &self,
        job_id: &str,
        state: &'static str,
        verb: &str,
    ) -> Result<(), AppError> {
        let url = self.client.api_url(&format!("jobs/ingest/{}", job_id))?;
        let label = format!("PATCH /jobs/ingest/{} ({})", redact_id(job_id), verb);
        let body = UpdateJobStateRequest { state };

        self.client
            .execute(&label, || {
                self.client.request(Method::PATCH, url.clone()).json(&body)
            })
            .await?;

        Ok(())
    }

    /// Downloads a result stream using the atomic write pattern: the body
    /// lands in a temp file that is persisted over the final path only
    /// after a clean finish.
    async fn download_results(
        &self,
        job_id: &str,
        result_type: &str,
        output_path: &Path,
    ) -> Result<(), AppError> {
        let url = self
            .client
            .api_url(&format!("jobs/ingest/{}/{}", job_id, result_type))?;
        let label = format!("GET /jobs/ingest/{}/{}", redact_id(job_id), result_type);

        let response = self
            .client
            .execute(&label, || self.client.request(Method::GET, url.clone()))
            .await?;

        if let Some(parent) = output_path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                AppError::Internal(format!("Failed to create output directory: {}", e))
            })?;
        }

        let parent_dir = output_path.parent().unwrap_or_else(|| Path::new("."));
        let temp_file = tempfile::NamedTempFile::new_in(parent_dir)
            .map_err(|e| AppError::Internal(format!("Failed to create temp file: {}", e)))?;
        let std_file = temp_file
            .reopen()
            .map_err(|e| AppError::Internal(format!("Failed to reopen temp file: {}", e)))?;
        let mut async_file = File::from_std(std_file);

        let mut stream = response.bytes_stream();
        let mut total_bytes = 0usize;

        while let Some(chunk_result) = stream.next().await {
            let chunk = chunk_result.map_err(|e| {
                AppError::Connection(format!("Error reading response stream: {}", e))
            })?;
            async_file
                .write_all(&chunk)
                .await
                .map_err(|e| AppError::Internal(format!("Error writing to file: {}", e)))?;
            total_bytes += chunk.len();
        }

        async_file
            .flush()
            .await
            .map_err(|e| AppError::Internal(format!("Failed to flush output file: {}", e)))?;
        async_file
            .sync_all()
            .await
            .map_err(|e| AppError::Internal(format!("Failed to sync output file: {}", e)))?;

        temp_file
            .persist(output_path)
            .map_err(|e| AppError::Internal(format!("Failed to persist temp file: {}", e)))?;

        info!(
            "[INGEST] {} download complete for job {}: {} bytes",
            result_type,
            redact_id(job_id),
            total_bytes
        );

        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Arc;
    use tempfile::TempDir;
    use url::Url;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn create_test_client(mock_url: &str) -> BulkIngestClient {
        let transport = SalesforceClient::new(
            Arc::new(reqwest::Client::new()),
            Url::parse(mock_url).unwrap(),
            "test_token".to_string(),
            "v62.0".to_string(),
        );
        BulkIngestClient::new(transport)
    }

    fn open_job() -> BulkJob {
        BulkJob::new_ingest(
            "750xx000000001ABC".into(),
            Operation::Upsert,
            "Department__c".into(),
        )
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Create Job Tests
    // ─────────────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn create_upsert_job_sends_external_id_and_csv_shape() {
        let mock_server = MockServer::start().await;
        let client = create_test_client(&mock_server.uri());

        let expected_request = serde_json::json!({
            "object": "Department__c",
            "operation": "upsert",
            "externalIdFieldName": "DptCode__c",
            "contentType": "CSV",
            "columnDelimiter": "COMMA",
            "lineEnding": "LF"
        });

        Mock::given(method("POST"))
            .and(path("/services/data/v62.0/jobs/ingest"))
            .and(header("Authorization", "Bearer test_token"))
            .and(body_json(&expected_request))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "750xx000000001ABC",
                "state": "Open",
                "object": "Department__c",
                "operation": "upsert"
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let req = CreateIngestJob::csv(
            "Department__c".to_string(),
            Operation::Upsert,
            Some("DptCode__c".to_string()),
        );
        let job = client.create_job(&req).await.unwrap();

        assert_eq!(job.id, "750xx000000001ABC");
        assert_eq!(job.state, BulkJobState::Open);
        assert_eq!(job.operation, Operation::Upsert);
    }

    #[tokio::test]
    async fn create_insert_job_omits_external_id() {
        let mock_server = MockServer::start().await;
        let client = create_test_client(&mock_server.uri());

        let expected_request = serde_json::json!({
            "object": "Contact",
            "operation": "insert",
            "contentType": "CSV",
            "columnDelimiter": "COMMA",
            "lineEnding": "LF"
        });

        Mock::given(method("POST"))
            .and(path("/services/data/v62.0/jobs/ingest"))
            .and(body_json(&expected_request))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "750xx000000002DEF",
                "state": "Open",
                "object": "Contact",
                "operation": "insert"
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let req = CreateIngestJob::csv("Contact".to_string(), Operation::Insert, None);
        assert!(client.create_job(&req).await.is_ok());
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Upload Tests
    // ─────────────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn upload_streams_csv_batch() {
        let mock_server = MockServer::start().await;
        let client = create_test_client(&mock_server.uri());
        let temp_dir = TempDir::new().unwrap();
        let csv_path = temp_dir.path().join("data.csv");

        let mut file = std::fs::File::create(&csv_path).unwrap();
        writeln!(file, "DptCode__c,Name").unwrap();
        writeln!(file, "D001,Sales").unwrap();

        Mock::given(method("PUT"))
            .and(path(
                "/services/data/v62.0/jobs/ingest/750xx000000001ABC/batches",
            ))
            .and(header("Content-Type", "text/csv"))
            .and(header("Authorization", "Bearer test_token"))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&mock_server)
            .await;

        let job = open_job();
        assert!(client.upload_batch(&job, &csv_path).await.is_ok());
    }

    #[tokio::test]
    async fn upload_to_closed_job_is_state_error_without_request() {
        let mock_server = MockServer::start().await;
        let client = create_test_client(&mock_server.uri());
        let temp_dir = TempDir::new().unwrap();
        let csv_path = temp_dir.path().join("data.csv");
        std::fs::write(&csv_path, "Name\nAcme\n").unwrap();

        // No mocks mounted: a request would 404 and fail differently
        let mut job = open_job();
        job.mark_upload_complete().unwrap();

        match client.upload_batch(&job, &csv_path).await.unwrap_err() {
            AppError::InvalidState {
                operation, state, ..
            } => {
                assert_eq!(operation, "upload");
                assert_eq!(state, BulkJobState::UploadComplete);
            }
            e => panic!("Expected InvalidState, got: {:?}", e),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Close / Abort / Delete Tests
    // ─────────────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn close_job_patches_upload_complete() {
        let mock_server = MockServer::start().await;
        let client = create_test_client(&mock_server.uri());

        Mock::given(method("PATCH"))
            .and(path("/services/data/v62.0/jobs/ingest/750xx000000001ABC"))
            .and(body_json(serde_json::json!({ "state": "UploadComplete" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "750xx000000001ABC",
                "state": "UploadComplete"
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let mut job = open_job();
        client.close_job(&mut job).await.unwrap();
        assert_eq!(job.state, BulkJobState::UploadComplete);

        // Second close is a local no-op: the mock expects exactly one PATCH
        client.close_job(&mut job).await.unwrap();
    }

    #[tokio::test]
    async fn abort_patches_aborted_and_updates_handle() {
        let mock_server = MockServer::start().await;
        let client = create_test_client(&mock_server.uri());

        Mock::given(method("PATCH"))
            .and(path("/services/data/v62.0/jobs/ingest/750xx000000001ABC"))
            .and(body_json(serde_json::json!({ "state": "Aborted" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "750xx000000001ABC",
                "state": "Aborted"
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let mut job = open_job();
        client.abort(&mut job).await.unwrap();
        assert_eq!(job.state, BulkJobState::Aborted);

        // Aborting again is a usage error, no second request
        assert!(matches!(
            client.abort(&mut job).await.unwrap_err(),
            AppError::InvalidState { .. }
        ));
    }

    #[tokio::test]
    async fn delete_on_terminal_job_is_state_error() {
        let mock_server = MockServer::start().await;
        let client = create_test_client(&mock_server.uri());

        let mut job = open_job();
        job.apply_server_state(BulkJobState::JobComplete);

        assert!(matches!(
            client.delete(&job).await.unwrap_err(),
            AppError::InvalidState { .. }
        ));
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Status Tests
    // ─────────────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn job_status_reports_counts_without_failing_on_failed_state() {
        let mock_server = MockServer::start().await;
        let client = create_test_client(&mock_server.uri());

        Mock::given(method("GET"))
            .and(path("/services/data/v62.0/jobs/ingest/750xx000000001ABC"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "750xx000000001ABC",
                "state": "Failed",
                "numberRecordsProcessed": 100,
                "numberRecordsFailed": 100,
                "errorMessage": "Invalid CSV format"
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        // The poller needs Failed reported as data, not as an error
        let info = client.job_status("750xx000000001ABC").await.unwrap();
        assert_eq!(info.state, BulkJobState::Failed);
        assert_eq!(info.processed_records, Some(100));
        assert_eq!(info.error_message.as_deref(), Some("Invalid CSV format"));
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Download Results Tests
    // ─────────────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn downloads_both_result_streams() {
        let mock_server = MockServer::start().await;
        let client = create_test_client(&mock_server.uri());
        let temp_dir = TempDir::new().unwrap();

        let success_csv = "sf__Id,sf__Created,DptCode__c,Name\n001xx1,true,D001,Sales";
        let failed_csv = "sf__Id,sf__Error,DptCode__c,Name\n,REQUIRED_FIELD_MISSING:Name,D002,";

        Mock::given(method("GET"))
            .and(path(
                "/services/data/v62.0/jobs/ingest/750xx000000001ABC/successfulResults",
            ))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("Content-Type", "text/csv")
                    .set_body_string(success_csv),
            )
            .expect(1)
            .mount(&mock_server)
            .await;

        Mock::given(method("GET"))
            .and(path(
                "/services/data/v62.0/jobs/ingest/750xx000000001ABC/failedResults",
            ))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("Content-Type", "text/csv")
                    .set_body_string(failed_csv),
            )
            .expect(1)
            .mount(&mock_server)
            .await;

        let success_path = temp_dir.path().join("success.csv");
        let failure_path = temp_dir.path().join("error.csv");

        client
            .download_success_results("750xx000000001ABC", &success_path)
            .await
            .unwrap();
        client
            .download_failure_results("750xx000000001ABC", &failure_path)
            .await
            .unwrap();

        assert_eq!(std::fs::read_to_string(&success_path).unwrap(), success_csv);
        assert_eq!(std::fs::read_to_string(&failure_path).unwrap(), failed_csv);
    }
}
