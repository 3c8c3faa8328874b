//! Bulk API 2.0 query job client.
//!
//! Creates query jobs from SOQL (optionally with primary-key partitioning
//! for very large extracts), reports status, and streams result pages into
//! a caller-supplied writer. Raw SOQL text is never logged; only HTTP
//! method, path, and status codes are.

use futures_util::StreamExt;
use reqwest::header::HeaderMap;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::info;

use crate::error::AppError;
use crate::salesforce::{redact_id, BulkJob, BulkJobState, Operation, SalesforceClient};

// ─────────────────────────────────────────────────────────────────────────────
// Constants
// ─────────────────────────────────────────────────────────────────────────────

/// Header carrying the continuation token for result pagination.
const SFORCE_LOCATOR_HEADER: &str = "Sforce-Locator";

// ─────────────────────────────────────────────────────────────────────────────
// Public Types
// ─────────────────────────────────────────────────────────────────────────────

/// Server-side partitioning request for a query job.
#[derive(Debug, Clone, Copy)]
pub struct PkChunking {
    /// Records per primary-key partition.
    pub chunk_size: u64,
}

/// Query job status as reported by the server.
///
/// `chunkJobIds` is present only on jobs created with PK chunking; its
/// order is the server's partition listing order, which defines merge
/// order.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryJobInfo {
    pub id: String,
    pub state: BulkJobState,
    #[serde(default)]
    pub chunk_job_ids: Vec<String>,
    #[serde(default)]
    pub number_records_processed: Option<u64>,
    #[serde(default)]
    pub error_message: Option<String>,
}

/// One retrieved result page: how many bytes landed in the writer and the
/// locator for the page after it (`None` when the chain is exhausted).
#[derive(Debug)]
pub struct PageWrite {
    pub bytes_written: u64,
    pub next_locator: Option<String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Internal Wire Types
// ─────────────────────────────────────────────────────────────────────────────

/// Request body for creating a query job.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateQueryJobRequest<'a> {
    operation: Operation,
    query: &'a str,
    content_type: &'static str,
    column_delimiter: &'static str,
    line_ending: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pk_chunking: Option<String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// BulkQueryClient
// ─────────────────────────────────────────────────────────────────────────────

/// Client for Bulk API 2.0 query operations.
#[derive(Clone)]
pub struct BulkQueryClient {
    client: SalesforceClient,
}

impl BulkQueryClient {
    pub fn new(client: SalesforceClient) -> Self {
        Self { client }
    }

    /// Creates a query job and returns its handle.
    ///
    /// With `pk_chunking`, the server splits the extract into partition
    /// jobs and returns their ids in listing order on the handle.
    ///
    /// # Errors
    ///
    /// - `AppError::Auth` - credentials rejected
    /// - `AppError::Request` - malformed query
    /// - `AppError::RateLimited` - throttled after retries
    pub async fn create_job(
        &self,
        soql: &str,
        operation: Operation,
        pk_chunking: Option<PkChunking>,
    ) -> Result<BulkJob, AppError> {
        let url = self.client.api_url("jobs/query")?;

        let request_body = CreateQueryJobRequest {
            operation,
            query: soql,
            content_type: "CSV",
            column_delimiter: "COMMA",
            line_ending: "LF",
            pk_chunking: pk_chunking.map(|c| format!("chunkSize={}", c.chunk_size)),
        };

        info!(
            "[QUERY] POST /jobs/query (creating {} job{})",
            operation.as_str(),
            if pk_chunking.is_some() {
                ", PK chunked"
            } else {
                ""
            }
        );

        let response = self
            .client
            .execute("POST /jobs/query", || {
                self.client
                    .request(Method::POST, url.clone())
                    .json(&request_body)
            })
            .await?;

        let info: QueryJobInfo = response.json().await.map_err(|e| {
            AppError::Internal(format!("Failed to parse job creation response: {}", e))
        })?;

        Ok(BulkJob::new_query(
            info.id,
            operation,
            soql.to_string(),
            info.state,
            info.chunk_job_ids,
        ))
    }

    /// Fetches a job's current server-side status.
    ///
    /// Works for parent and partition jobs alike; `Failed` comes back as
    /// data so the chunk barrier can observe every partition's fate.
    pub async fn job_status(&self, job_id: &str) -> Result<QueryJobInfo, AppError> {
        let url = self.client.api_url(&format!("jobs/query/{}", job_id))?;
        let label = format!("GET /jobs/query/{}", redact_id(job_id));

        let response = self
            .client
            .execute(&label, || self.client.request(Method::GET, url.clone()))
            .await?;

        response
            .json()
            .await
            .map_err(|e| AppError::Internal(format!("Failed to parse job status response: {}", e)))
    }

    /// Aborts a query job that has not finished.
    ///
    /// # Errors
    ///
    /// - `AppError::InvalidState` - job already terminal
    pub async fn abort(&self, job: &mut BulkJob) -> Result<(), AppError> {
        job.require_not_terminal("abort")?;

        let url = self.client.api_url(&format!("jobs/query/{}", job.id))?;
        let label = format!("PATCH /jobs/query/{} (aborting)", redact_id(&job.id));

        self.client
            .execute(&label, || {
                self.client
                    .request(Method::PATCH, url.clone())
                    .json(&serde_json::json!({ "state": "Aborted" }))
            })
            .await?;

        job.apply_server_state(BulkJobState::Aborted);
        Ok(())
    }

    /// Deletes a query job record server-side.
    ///
    /// # Errors
    ///
    /// - `AppError::InvalidState` - job already terminal
    pub async fn delete(&self, job: &BulkJob) -> Result<(), AppError> {
        job.require_not_terminal("delete")?;

        let url = self.client.api_url(&format!("jobs/query/{}", job.id))?;
        let label = format!("DELETE /jobs/query/{}", redact_id(&job.id));

        self.client
            .execute(&label, || self.client.request(Method::DELETE, url.clone()))
            .await?;

        Ok(())
    }

    /// Streams one result page into `writer`.
    ///
    /// With `skip_header` the first line of the page (the CSV header the
    /// server repeats on every page) is dropped before writing. The page
    /// body is streamed; nothing is buffered beyond the pending header
    /// line.
    pub async fn write_results_page<W>(
        &self,
        job_id: &str,
        locator: Option<&str>,
        max_records: Option<u32>,
        skip_header: bool,
        writer: &mut W,
    ) -> Result<PageWrite, AppError>
    where
        W: AsyncWrite + Unpin,
    {
        let mut url = self
            .client
            .api_url(&format!("jobs/query/{}/results", job_id))?;
        {
            let mut pairs = url.query_pairs_mut();
            if let Some(loc) = locator {
                pairs.append_pair("locator", loc);
            }
            if let Some(max) = max_records {
                pairs.append_pair("maxRecords", &max.to_string());
            }
        }

        let label = format!(
            "GET /jobs/query/{}/results{}",
            redact_id(job_id),
            if locator.is_some() { " (paginated)" } else { "" }
        );

        let response = self
            .client
            .execute(&label, || self.client.request(Method::GET, url.clone()))
            .await?;

        let next_locator = extract_locator(response.headers());

        let bytes_written = if skip_header {
            stream_body_skip_header(response, writer).await?
        } else {
            stream_body(response, writer).await?
        };

        Ok(PageWrite {
            bytes_written,
            next_locator,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Streaming Helpers
// ─────────────────────────────────────────────────────────────────────────────

async fn stream_body<W>(response: reqwest::Response, writer: &mut W) -> Result<u64, AppError>
where
    W: AsyncWrite + Unpin,
{
    let mut stream = response.bytes_stream();
    let mut total_bytes = 0u64;

    while let Some(chunk_result) = stream.next().await {
        let chunk = chunk_result
            .map_err(|e| AppError::Connection(format!("Error reading response stream: {}", e)))?;
        writer
            .write_all(&chunk)
            .await
            .map_err(|e| AppError::Internal(format!("Error writing results: {}", e)))?;
        total_bytes += chunk.len() as u64;
    }

    Ok(total_bytes)
}

/// Streams the body, dropping everything up to and including the first
/// line ending.
async fn stream_body_skip_header<W>(
    response: reqwest::Response,
    writer: &mut W,
) -> Result<u64, AppError>
where
    W: AsyncWrite + Unpin,
{
    let mut stream = response.bytes_stream();
    let mut total_bytes = 0u64;
    let mut header_skipped = false;
    let mut pending_bytes: Vec<u8> = Vec::new();

    while let Some(chunk_result) = stream.next().await {
        let chunk = chunk_result
            .map_err(|e| AppError::Connection(format!("Error reading response stream: {}", e)))?;

        if header_skipped {
            writer
                .write_all(&chunk)
                .await
                .map_err(|e| AppError::Internal(format!("Error writing results: {}", e)))?;
            total_bytes += chunk.len() as u64;
        } else {
            pending_bytes.extend_from_slice(&chunk);

            if let Some(newline_pos) = find_line_end(&pending_bytes) {
                let after_header = &pending_bytes[newline_pos..];
                if !after_header.is_empty() {
                    writer
                        .write_all(after_header)
                        .await
                        .map_err(|e| AppError::Internal(format!("Error writing results: {}", e)))?;
                    total_bytes += after_header.len() as u64;
                }
                header_skipped = true;
                pending_bytes.clear();
            }
        }
    }

    // A header-only page (no trailing newline) yields nothing.
    Ok(total_bytes)
}

/// Extracts the Sforce-Locator header value. The server signals the end of
/// the chain with a missing header, an empty value, or the literal "null".
fn extract_locator(headers: &HeaderMap) -> Option<String> {
    headers
        .get(SFORCE_LOCATOR_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty() && !s.eq_ignore_ascii_case("null"))
        .map(|s| s.to_string())
}

/// Finds the position after the first line ending (LF or CRLF).
fn find_line_end(bytes: &[u8]) -> Option<usize> {
    for (i, &b) in bytes.iter().enumerate() {
        if b == b'\n' {
            return Some(i + 1);
        }
        if b == b'\r' && bytes.get(i + 1) == Some(&b'\n') {
            return Some(i + 2);
        }
    }
    None
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use url::Url;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn create_test_client(mock_url: &str) -> BulkQueryClient {
        let transport = SalesforceClient::new(
            Arc::new(reqwest::Client::new()),
            Url::parse(mock_url).unwrap(),
            "test_token".to_string(),
            "v62.0".to_string(),
        );
        BulkQueryClient::new(transport)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Job Creation Tests
    // ─────────────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn create_job_sends_csv_body() {
        let mock_server = MockServer::start().await;
        let client = create_test_client(&mock_server.uri());

        let expected_request = serde_json::json!({
            "operation": "query",
            "query": "SELECT Id, Name FROM Account",
            "contentType": "CSV",
            "columnDelimiter": "COMMA",
            "lineEnding": "LF"
        });

        Mock::given(method("POST"))
            .and(path("/services/data/v62.0/jobs/query"))
            .and(header("Authorization", "Bearer test_token"))
            .and(body_json(&expected_request))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "750xx000000001ABC",
                "state": "UploadComplete"
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let job = client
            .create_job("SELECT Id, Name FROM Account", Operation::Query, None)
            .await
            .unwrap();

        assert_eq!(job.id, "750xx000000001ABC");
        assert!(!job.is_chunked());
    }

    #[tokio::test]
    async fn create_chunked_job_sends_chunk_size_and_keeps_partition_order() {
        let mock_server = MockServer::start().await;
        let client = create_test_client(&mock_server.uri());

        let expected_request = serde_json::json!({
            "operation": "queryAll",
            "query": "SELECT Id FROM Account",
            "contentType": "CSV",
            "columnDelimiter": "COMMA",
            "lineEnding": "LF",
            "pkChunking": "chunkSize=100000"
        });

        Mock::given(method("POST"))
            .and(path("/services/data/v62.0/jobs/query"))
            .and(body_json(&expected_request))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "750pp000000000AAA",
                "state": "UploadComplete",
                "chunkJobIds": ["750c1", "750c2", "750c3"]
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let job = client
            .create_job(
                "SELECT Id FROM Account",
                Operation::QueryAll,
                Some(PkChunking { chunk_size: 100_000 }),
            )
            .await
            .unwrap();

        assert!(job.is_chunked());
        assert_eq!(job.chunk_job_ids, vec!["750c1", "750c2", "750c3"]);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Status Tests
    // ─────────────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn job_status_reports_failed_as_data() {
        let mock_server = MockServer::start().await;
        let client = create_test_client(&mock_server.uri());

        Mock::given(method("GET"))
            .and(path("/services/data/v62.0/jobs/query/750xx000000001ABC"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "750xx000000001ABC",
                "state": "Failed",
                "errorMessage": "Query syntax error"
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let info = client.job_status("750xx000000001ABC").await.unwrap();
        assert_eq!(info.state, BulkJobState::Failed);
        assert_eq!(info.error_message.as_deref(), Some("Query syntax error"));
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Abort / Delete Tests
    // ─────────────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn abort_patches_aborted_state() {
        let mock_server = MockServer::start().await;
        let client = create_test_client(&mock_server.uri());

        Mock::given(method("PATCH"))
            .and(path("/services/data/v62.0/jobs/query/750xx000000001ABC"))
            .and(body_json(serde_json::json!({ "state": "Aborted" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "750xx000000001ABC",
                "state": "Aborted"
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let mut job = BulkJob::new_query(
            "750xx000000001ABC".into(),
            Operation::Query,
            "SELECT Id FROM Account".into(),
            BulkJobState::InProgress,
            Vec::new(),
        );

        client.abort(&mut job).await.unwrap();
        assert_eq!(job.state, BulkJobState::Aborted);
    }

    #[tokio::test]
    async fn delete_issues_delete_and_rejects_terminal_jobs() {
        let mock_server = MockServer::start().await;
        let client = create_test_client(&mock_server.uri());

        Mock::given(method("DELETE"))
            .and(path("/services/data/v62.0/jobs/query/750xx000000001ABC"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&mock_server)
            .await;

        let mut job = BulkJob::new_query(
            "750xx000000001ABC".into(),
            Operation::Query,
            "SELECT Id FROM Account".into(),
            BulkJobState::InProgress,
            Vec::new(),
        );

        client.delete(&job).await.unwrap();

        job.apply_server_state(BulkJobState::JobComplete);
        assert!(matches!(
            client.delete(&job).await.unwrap_err(),
            AppError::InvalidState { .. }
        ));
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Result Page Tests
    // ─────────────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn writes_page_and_reports_next_locator() {
        let mock_server = MockServer::start().await;
        let client = create_test_client(&mock_server.uri());

        Mock::given(method("GET"))
            .and(path(
                "/services/data/v62.0/jobs/query/750xx000000001ABC/results",
            ))
            .and(query_param("maxRecords", "1000"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("Sforce-Locator", "locator123")
                    .set_body_string("Id,Name\n001xx1,Acme\n"),
            )
            .expect(1)
            .mount(&mock_server)
            .await;

        let mut out: Vec<u8> = Vec::new();
        let page = client
            .write_results_page("750xx000000001ABC", None, Some(1000), false, &mut out)
            .await
            .unwrap();

        assert_eq!(page.next_locator.as_deref(), Some("locator123"));
        assert_eq!(String::from_utf8(out).unwrap(), "Id,Name\n001xx1,Acme\n");
    }

    #[tokio::test]
    async fn paginated_page_strips_header_and_passes_locator() {
        let mock_server = MockServer::start().await;
        let client = create_test_client(&mock_server.uri());

        Mock::given(method("GET"))
            .and(path(
                "/services/data/v62.0/jobs/query/750xx000000001ABC/results",
            ))
            .and(query_param("locator", "locator123"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("Sforce-Locator", "null")
                    .set_body_string("Id,Name\n001xx2,Globex\n"),
            )
            .expect(1)
            .mount(&mock_server)
            .await;

        let mut out: Vec<u8> = Vec::new();
        let page = client
            .write_results_page(
                "750xx000000001ABC",
                Some("locator123"),
                None,
                true,
                &mut out,
            )
            .await
            .unwrap();

        assert_eq!(page.next_locator, None);
        assert_eq!(String::from_utf8(out).unwrap(), "001xx2,Globex\n");
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Helper Function Tests
    // ─────────────────────────────────────────────────────────────────────────

    #[test]
    fn locator_null_and_empty_mean_exhausted() {
        let mut headers = HeaderMap::new();
        assert_eq!(extract_locator(&headers), None);

        headers.insert(SFORCE_LOCATOR_HEADER, "null".parse().unwrap());
        assert_eq!(extract_locator(&headers), None);

        headers.insert(SFORCE_LOCATOR_HEADER, "".parse().unwrap());
        assert_eq!(extract_locator(&headers), None);

        headers.insert(SFORCE_LOCATOR_HEADER, "abc123".parse().unwrap());
        assert_eq!(extract_locator(&headers), Some("abc123".to_string()));
    }

    #[test]
    fn test_find_line_end_lf() {
        assert_eq!(find_line_end(b"A,B\n1,2"), Some(4));
    }

    #[test]
    fn test_find_line_end_crlf() {
        assert_eq!(find_line_end(b"A,B\r\n1,2"), Some(5));
    }

    #[test]
    fn test_find_line_end_no_newline() {
        assert_eq!(find_line_end(b"A,B"), None);
    }
}
